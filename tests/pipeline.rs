//! End-to-end pipeline scenarios driven through whole sessions.

use std::{path::Path, sync::Arc, time::Duration};

use tempfile::tempdir;

use kinesistap::config::AgentConfig;
use kinesistap::parameters::ParameterStore;
use kinesistap::session::{Session, SessionContext};
use kinesistap::sinks::cloud_logs::{
    DestinationErrorKind, DestinationProvider, MemoryDestinationProvider,
};

fn context(data_dir: &Path) -> (SessionContext, Arc<MemoryDestinationProvider>) {
    let provider = MemoryDestinationProvider::new();
    (
        SessionContext {
            data_dir: data_dir.to_path_buf(),
            parameters: Arc::new(ParameterStore::new(data_dir).unwrap()),
            destinations: Arc::clone(&provider) as Arc<dyn DestinationProvider>,
        },
        provider,
    )
}

fn tail_config(log_dir: &Path, endpoints: &str) -> AgentConfig {
    let json = format!(
        r#"{{
            "Sources": [
                {{"Type": "DirectorySource", "Id": "app",
                  "Directory": {dir:?}, "FileNameFilter": "*.log"}}
            ],
            "Sinks": [
                {{"Type": "CloudLogsSink", "Id": "cloud",
                  "BatchIntervalMs": 50, "RegionCooldownSeconds": 1
                  {endpoints}}}
            ],
            "Pipes": [
                {{"Type": "Pipe", "Id": "wire", "SourceRef": "app", "SinkRef": "cloud"}}
            ]
        }}"#,
        dir = log_dir.to_str().unwrap(),
    );
    let config: AgentConfig = serde_json::from_str(&json).unwrap();
    config.validate().unwrap();
    config
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_delivers_every_line_exactly_once() {
    let log_dir = tempdir().unwrap();
    let data_dir = tempdir().unwrap();
    let log_path = log_dir.path().join("app.log");
    let config_path = Path::new("/tmp/restart-test.json");

    std::fs::write(&log_path, b"a\nb\nc\n").unwrap();

    // First agent lifetime.
    {
        let config = tail_config(log_dir.path(), "");
        let (ctx, provider) = context(data_dir.path());
        let mut session = Session::load(config_path, &config, &ctx);
        session.start();
        let destination = provider.get("cloud", "primary").unwrap();
        wait_for("first three lines", || destination.record_texts().len() >= 3).await;
        session.stop(Duration::from_secs(5)).await;
        assert_eq!(destination.record_texts(), vec!["a", "b", "c"]);
    }

    // Lines written while the agent is down.
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&log_path)
            .unwrap();
        f.write_all(b"d\ne\n").unwrap();
    }

    // Second agent lifetime resumes from the bookmark: d and e arrive,
    // a through c never repeat.
    {
        let config = tail_config(log_dir.path(), "");
        let (ctx, provider) = context(data_dir.path());
        let mut session = Session::load(config_path, &config, &ctx);
        session.start();
        let destination = provider.get("cloud", "primary").unwrap();
        wait_for("the two new lines", || destination.record_texts().len() >= 2).await;
        session.stop(Duration::from_secs(5)).await;
        assert_eq!(destination.record_texts(), vec!["d", "e"]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failover_reroutes_batches_to_the_secondary() {
    let log_dir = tempdir().unwrap();
    let data_dir = tempdir().unwrap();
    std::fs::write(log_dir.path().join("app.log"), b"payload-1\npayload-2\n").unwrap();

    let endpoints = r#", "Endpoints": [
        {"Id": "region-a", "Url": "https://a.example"},
        {"Id": "region-b", "Url": "https://b.example"}
    ]"#;
    let config = tail_config(log_dir.path(), endpoints);
    let (ctx, provider) = context(data_dir.path());
    let mut session = Session::load(Path::new("/tmp/failover-test.json"), &config, &ctx);

    // Destinations exist as soon as the session is loaded; script the
    // primary to refuse the next several batches.
    let primary = provider.get("cloud", "region-a").unwrap();
    for _ in 0..5 {
        primary.push_rejection(DestinationErrorKind::ServiceUnavailable, None);
    }

    session.start();
    let secondary = provider.get("cloud", "region-b").unwrap();
    wait_for("records via the secondary", || {
        secondary.record_texts().len() >= 2
    })
    .await;
    session.stop(Duration::from_secs(5)).await;

    assert!(primary.batches().is_empty());
    let mut delivered = secondary.record_texts();
    delivered.sort();
    assert_eq!(delivered, vec!["payload-1", "payload-2"]);
}
