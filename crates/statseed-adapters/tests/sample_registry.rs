use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use statseed_adapters::{AdapterError, AdapterRegistry, StatVisitor};
use statseed_core::{SeasonType, Sport, StatRecord};
use statseed_storage::{HttpClient, HttpClientConfig};

#[derive(Default)]
struct Names(Vec<String>);

#[async_trait]
impl StatVisitor for Names {
    async fn visit(&mut self, record: StatRecord) -> Result<(), AdapterError> {
        self.0.push(record.entity_name);
        Ok(())
    }
}

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[tokio::test]
async fn sample_registry_serves_the_nba_fixture() {
    let http = Arc::new(HttpClient::new(HttpClientConfig::default()).expect("http client"));
    let registry = AdapterRegistry::load(&workspace_root().join("providers.yaml"), http)
        .expect("sample registry loads");
    assert_eq!(registry.sports(), vec![Sport::Nba]);

    let adapter = registry.require(Sport::Nba).expect("nba adapter");
    let mut names = Names::default();
    adapter
        .fetch_player_stats("2025", SeasonType::Regular, &mut names)
        .await
        .expect("players stream");
    assert_eq!(names.0.len(), 5);
    assert_eq!(names.0[0], "LeBron James");

    let teams = adapter
        .fetch_team_stats("2025", SeasonType::Regular)
        .await
        .expect("teams load");
    assert_eq!(teams.len(), 4);
    assert!(teams.iter().all(|t| t.stats.contains_key("net_rating")));
}
