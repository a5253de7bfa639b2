//! Provider adapter contracts, fixture-first and HTTP implementations, and the sport registry.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use statseed_core::{EntityType, SeasonType, Sport, StatRecord};
use statseed_storage::{HttpClient, HttpError};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "statseed-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0} handler not configured")]
    NotConfigured(Sport),
    #[error("invalid provider configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Fetch(#[from] HttpError),
    #[error("visitor rejected record: {0}")]
    Visit(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Receives player records one at a time. Returning an error aborts the stream.
#[async_trait]
pub trait StatVisitor: Send {
    async fn visit(&mut self, record: StatRecord) -> Result<(), AdapterError>;
}

/// One configured upstream statistics feed for a single sport.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn sport(&self) -> Sport;

    async fn fetch_player_stats(
        &self,
        season: &str,
        season_type: SeasonType,
        visitor: &mut dyn StatVisitor,
    ) -> Result<(), AdapterError>;

    async fn fetch_team_stats(
        &self,
        season: &str,
        season_type: SeasonType,
    ) -> Result<Vec<StatRecord>, AdapterError>;
}

/// Canonical wire shape of one entity's statistic line, shared by fixtures and HTTP feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatLine {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub team_id: Option<i64>,
    pub stats: BTreeMap<String, f64>,
}

impl StatLine {
    pub fn into_record(
        self,
        entity_type: EntityType,
        sport: Sport,
        season: &str,
        season_type: SeasonType,
    ) -> StatRecord {
        let team_id = match entity_type {
            EntityType::Team => self.team_id.or(Some(self.id)),
            EntityType::Player => self.team_id,
        };
        StatRecord {
            entity_type,
            entity_id: self.id,
            entity_name: self.name,
            team_id,
            sport,
            season: season.to_string(),
            season_type,
            stats: self.stats,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub players: Vec<StatLine>,
    #[serde(default)]
    pub teams: Vec<StatLine>,
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Serves statistics from `<dir>/<season>_<season_type>.json` bundles.
#[derive(Debug, Clone)]
pub struct FixtureProviderAdapter {
    sport: Sport,
    dir: PathBuf,
}

impl FixtureProviderAdapter {
    pub fn new(sport: Sport, dir: impl Into<PathBuf>) -> Self {
        Self {
            sport,
            dir: dir.into(),
        }
    }

    pub fn bundle_path(&self, season: &str, season_type: SeasonType) -> PathBuf {
        self.dir.join(format!("{season}_{season_type}.json"))
    }

    fn load_bundle(
        &self,
        season: &str,
        season_type: SeasonType,
    ) -> Result<FixtureBundle, AdapterError> {
        Ok(read_json_file(self.bundle_path(season, season_type))?)
    }
}

#[async_trait]
impl ProviderAdapter for FixtureProviderAdapter {
    fn sport(&self) -> Sport {
        self.sport
    }

    async fn fetch_player_stats(
        &self,
        season: &str,
        season_type: SeasonType,
        visitor: &mut dyn StatVisitor,
    ) -> Result<(), AdapterError> {
        let bundle = self.load_bundle(season, season_type)?;
        debug!(
            sport = %self.sport,
            season,
            players = bundle.players.len(),
            "streaming fixture players"
        );
        for line in bundle.players {
            visitor
                .visit(line.into_record(EntityType::Player, self.sport, season, season_type))
                .await?;
        }
        Ok(())
    }

    async fn fetch_team_stats(
        &self,
        season: &str,
        season_type: SeasonType,
    ) -> Result<Vec<StatRecord>, AdapterError> {
        let bundle = self.load_bundle(season, season_type)?;
        Ok(bundle
            .teams
            .into_iter()
            .map(|line| line.into_record(EntityType::Team, self.sport, season, season_type))
            .collect())
    }
}

/// Fetches canonical [`StatLine`] arrays from
/// `<base_url>/<sport>/<season>/<season_type>/{players,teams}`.
#[derive(Debug, Clone)]
pub struct HttpProviderAdapter {
    sport: Sport,
    base_url: String,
    api_key: Option<String>,
    http: Arc<HttpClient>,
}

impl HttpProviderAdapter {
    pub fn new(
        sport: Sport,
        base_url: impl Into<String>,
        api_key: Option<String>,
        http: Arc<HttpClient>,
    ) -> Self {
        Self {
            sport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http,
        }
    }

    pub fn endpoint(&self, season: &str, season_type: SeasonType, resource: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.base_url,
            self.sport.as_str().to_ascii_lowercase(),
            season,
            season_type,
            resource
        )
    }

    async fn fetch_lines(
        &self,
        season: &str,
        season_type: SeasonType,
        resource: &str,
    ) -> Result<Vec<StatLine>, AdapterError> {
        let url = self.endpoint(season, season_type, resource);
        let lines = self
            .http
            .get_json::<Vec<StatLine>>(self.sport.as_str(), &url, self.api_key.as_deref())
            .await?;
        Ok(lines)
    }
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    fn sport(&self) -> Sport {
        self.sport
    }

    async fn fetch_player_stats(
        &self,
        season: &str,
        season_type: SeasonType,
        visitor: &mut dyn StatVisitor,
    ) -> Result<(), AdapterError> {
        for line in self.fetch_lines(season, season_type, "players").await? {
            visitor
                .visit(line.into_record(EntityType::Player, self.sport, season, season_type))
                .await?;
        }
        Ok(())
    }

    async fn fetch_team_stats(
        &self,
        season: &str,
        season_type: SeasonType,
    ) -> Result<Vec<StatRecord>, AdapterError> {
        Ok(self
            .fetch_lines(season, season_type, "teams")
            .await?
            .into_iter()
            .map(|line| line.into_record(EntityType::Team, self.sport, season, season_type))
            .collect())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRegistryFile {
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Fixture,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub sport: Sport,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub kind: ProviderKind,
    #[serde(default)]
    pub fixture_dir: Option<PathBuf>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

/// Closed sport -> adapter map, built once at startup and shared by reference.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Sport, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.sport(), adapter);
        self
    }

    pub fn get(&self, sport: Sport) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&sport).cloned()
    }

    pub fn require(&self, sport: Sport) -> Result<Arc<dyn ProviderAdapter>, AdapterError> {
        self.get(sport).ok_or(AdapterError::NotConfigured(sport))
    }

    pub fn sports(&self) -> Vec<Sport> {
        let mut sports = self.adapters.keys().copied().collect::<Vec<_>>();
        sports.sort();
        sports
    }

    /// Builds adapters for enabled entries. Relative fixture directories resolve against
    /// `base_dir`.
    pub fn from_configs(
        configs: &[ProviderConfig],
        base_dir: &Path,
        http: Arc<HttpClient>,
    ) -> Result<Self, AdapterError> {
        let mut registry = Self::new();
        for config in configs.iter().filter(|c| c.enabled) {
            if registry.adapters.contains_key(&config.sport) {
                return Err(AdapterError::Config(format!(
                    "sport {} is configured more than once",
                    config.sport
                )));
            }
            let adapter: Arc<dyn ProviderAdapter> = match config.kind {
                ProviderKind::Fixture => {
                    let dir = config.fixture_dir.as_ref().ok_or_else(|| {
                        AdapterError::Config(format!(
                            "{} fixture provider needs fixture_dir",
                            config.sport
                        ))
                    })?;
                    Arc::new(FixtureProviderAdapter::new(config.sport, base_dir.join(dir)))
                }
                ProviderKind::Http => {
                    let base_url = config.base_url.as_ref().ok_or_else(|| {
                        AdapterError::Config(format!(
                            "{} http provider needs base_url",
                            config.sport
                        ))
                    })?;
                    Arc::new(HttpProviderAdapter::new(
                        config.sport,
                        base_url.clone(),
                        config.api_key.clone(),
                        http.clone(),
                    ))
                }
            };
            registry.adapters.insert(config.sport, adapter);
        }
        info!(sports = ?registry.sports(), "provider registry ready");
        Ok(registry)
    }

    /// Loads `providers.yaml`. A missing file yields an empty registry so every sport reports
    /// "handler not configured" instead of failing startup.
    pub fn load(path: &Path, http: Arc<HttpClient>) -> Result<Self, AdapterError> {
        if !path.exists() {
            info!(path = %path.display(), "no provider registry file; no sports configured");
            return Ok(Self::new());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: ProviderRegistryFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_configs(&file.providers, base_dir, http)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statseed_storage::HttpClientConfig;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Collect {
        records: Vec<StatRecord>,
        reject_after: Option<usize>,
    }

    #[async_trait]
    impl StatVisitor for Collect {
        async fn visit(&mut self, record: StatRecord) -> Result<(), AdapterError> {
            if self.reject_after == Some(self.records.len()) {
                return Err(AdapterError::Visit("stop".into()));
            }
            self.records.push(record);
            Ok(())
        }
    }

    fn http() -> Arc<HttpClient> {
        Arc::new(HttpClient::new(HttpClientConfig::default()).unwrap())
    }

    fn write_bundle(dir: &Path) {
        let bundle = serde_json::json!({
            "players": [
                {
                    "id": 23,
                    "name": "LeBron James",
                    "team_id": 14,
                    "stats": {"points_per_36": 27.4, "assists_per_36": 8.1}
                },
                {"id": 30, "name": "Stephen Curry", "team_id": 10, "stats": {"points_per_36": 29.0}}
            ],
            "teams": [
                {"id": 14, "name": "Los Angeles Lakers", "stats": {"net_rating": 2.5}}
            ]
        });
        fs::write(dir.join("2025_regular.json"), bundle.to_string()).unwrap();
    }

    #[tokio::test]
    async fn fixture_adapter_streams_players_and_returns_teams() {
        let dir = tempdir().expect("tempdir");
        write_bundle(dir.path());
        let adapter = FixtureProviderAdapter::new(Sport::Nba, dir.path());

        let mut visitor = Collect::default();
        adapter
            .fetch_player_stats("2025", SeasonType::Regular, &mut visitor)
            .await
            .unwrap();
        assert_eq!(visitor.records.len(), 2);
        let lebron = &visitor.records[0];
        assert_eq!(lebron.entity_type, EntityType::Player);
        assert_eq!(lebron.entity_name, "LeBron James");
        assert_eq!(lebron.team_id, Some(14));
        assert_eq!(lebron.sport, Sport::Nba);
        assert_eq!(lebron.stats["points_per_36"], 27.4);

        let teams = adapter
            .fetch_team_stats("2025", SeasonType::Regular)
            .await
            .unwrap();
        assert_eq!(teams.len(), 1);
        assert_eq!(teams[0].entity_type, EntityType::Team);
        assert_eq!(teams[0].team_id, Some(14));
    }

    #[tokio::test]
    async fn visitor_error_aborts_the_stream() {
        let dir = tempdir().expect("tempdir");
        write_bundle(dir.path());
        let adapter = FixtureProviderAdapter::new(Sport::Nba, dir.path());

        let mut visitor = Collect {
            reject_after: Some(1),
            ..Default::default()
        };
        let err = adapter
            .fetch_player_stats("2025", SeasonType::Regular, &mut visitor)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Visit(_)));
        assert_eq!(visitor.records.len(), 1);
    }

    #[tokio::test]
    async fn missing_fixture_bundle_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let adapter = FixtureProviderAdapter::new(Sport::Nhl, dir.path());
        let err = adapter
            .fetch_team_stats("2024", SeasonType::Post)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("2024_post.json"));
    }

    #[test]
    fn registry_loads_yaml_and_resolves_relative_fixture_dirs() {
        let dir = tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("fixtures/nba")).unwrap();
        fs::write(
            dir.path().join("providers.yaml"),
            r#"
providers:
  - sport: NBA
    kind: fixture
    fixture_dir: fixtures/nba
  - sport: NFL
    kind: http
    base_url: https://stats.example.com/v1/
  - sport: MLB
    kind: http
    enabled: false
"#,
        )
        .unwrap();

        let registry = AdapterRegistry::load(&dir.path().join("providers.yaml"), http()).unwrap();
        assert_eq!(registry.sports(), vec![Sport::Nba, Sport::Nfl]);
        assert!(registry.get(Sport::Mlb).is_none());
        let err = registry.require(Sport::Nhl).err().unwrap();
        assert_eq!(err.to_string(), "NHL handler not configured");
    }

    #[test]
    fn registry_rejects_unknown_sports_at_load_time() {
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join("providers.yaml"),
            "providers:\n  - sport: CRICKET\n    kind: http\n    base_url: https://x\n",
        )
        .unwrap();
        let result = AdapterRegistry::load(&dir.path().join("providers.yaml"), http());
        assert!(result.is_err());
    }

    #[test]
    fn registry_rejects_incomplete_and_duplicate_entries() {
        let missing_dir = [ProviderConfig {
            sport: Sport::Nba,
            enabled: true,
            kind: ProviderKind::Fixture,
            fixture_dir: None,
            base_url: None,
            api_key: None,
            notes: None,
        }];
        assert!(matches!(
            AdapterRegistry::from_configs(&missing_dir, Path::new("."), http()),
            Err(AdapterError::Config(_))
        ));

        let http_entry = ProviderConfig {
            sport: Sport::Nfl,
            enabled: true,
            kind: ProviderKind::Http,
            fixture_dir: None,
            base_url: Some("https://stats.example.com".into()),
            api_key: None,
            notes: None,
        };
        let duplicated = [http_entry.clone(), http_entry];
        assert!(matches!(
            AdapterRegistry::from_configs(&duplicated, Path::new("."), http()),
            Err(AdapterError::Config(_))
        ));
    }

    #[test]
    fn missing_registry_file_yields_empty_registry() {
        let dir = tempdir().expect("tempdir");
        let registry = AdapterRegistry::load(&dir.path().join("absent.yaml"), http()).unwrap();
        assert!(registry.sports().is_empty());
    }

    #[test]
    fn http_endpoints_are_lowercase_sport_paths() {
        let adapter =
            HttpProviderAdapter::new(Sport::Nba, "https://stats.example.com/v1/", None, http());
        assert_eq!(
            adapter.endpoint("2025", SeasonType::Post, "players"),
            "https://stats.example.com/v1/nba/2025/post/players"
        );
    }
}
