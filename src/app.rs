//! Process bootstrap: tracing, the session manager, and the CLI verbs.

use std::{path::Path, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cli::exit;
use crate::config::AgentConfig;
use crate::parameters::ParameterStore;
use crate::session::{Session, SessionContext};
use crate::session_manager::{read_status, ManagerSettings, SessionManager};
use crate::sinks::cloud_logs::MemoryDestinationProvider;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_context(config_dir: &Path) -> std::io::Result<Arc<SessionContext>> {
    // State lives beside the configuration, mirroring the service's
    // single ProgramData-style root.
    std::fs::create_dir_all(config_dir)?;
    let parameters = Arc::new(ParameterStore::new(config_dir)?);
    Ok(Arc::new(SessionContext {
        data_dir: config_dir.to_path_buf(),
        parameters,
        destinations: MemoryDestinationProvider::new(),
    }))
}

/// `kinesistap run`: run the session manager until a stop signal lands.
pub async fn run(config_dir: &Path) -> i32 {
    let ctx = match build_context(config_dir) {
        Ok(ctx) => ctx,
        Err(error) => {
            error!(message = "Could not prepare the data directory.", ?config_dir, %error);
            return exit::RUNTIME_ERROR;
        }
    };

    match ctx.parameters.client_id() {
        Ok(client_id) => info!(message = "Agent starting.", %client_id, ?config_dir),
        Err(error) => {
            error!(message = "Could not read or create the client id.", %error);
            return exit::RUNTIME_ERROR;
        }
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            crate::shutdown::signal_received().await;
            info!(message = "Stop signal received; shutting down.");
            shutdown.cancel();
        });
    }

    let mut manager = SessionManager::new(
        ManagerSettings::new(config_dir.to_path_buf()),
        Arc::clone(&ctx),
    );
    manager.run(shutdown).await;
    exit::OK
}

/// `kinesistap validate <path>`: parse, statically check, and dry-build
/// one configuration.
pub async fn validate(config_dir: &Path, path: &Path) -> i32 {
    let (config, _) = match AgentConfig::load(path) {
        Ok(loaded) => loaded,
        Err(error) => {
            eprintln!("invalid configuration: {error}");
            return exit::INVALID_CONFIG;
        }
    };

    let ctx = match build_context(config_dir) {
        Ok(ctx) => ctx,
        Err(error) => {
            eprintln!("could not prepare the data directory: {error}");
            return exit::RUNTIME_ERROR;
        }
    };

    let session = Session::load(path, &config, &ctx);
    let status = session.status();
    println!(
        "session {:?}: {} source(s), {} sink(s), validated: {}",
        status.name, status.sources, status.sinks, status.validated
    );
    for error in &status.errors {
        eprintln!("  error: {error}");
    }
    if status.validated {
        exit::OK
    } else {
        exit::INVALID_CONFIG
    }
}

/// `kinesistap status`: print what the running agent last reported.
pub fn status(config_dir: &Path) -> i32 {
    match read_status(config_dir) {
        Some(status) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&status).expect("status round-trips")
            );
            exit::OK
        }
        None => {
            eprintln!("no status file found under {config_dir:?}; is the agent running?");
            exit::RUNTIME_ERROR
        }
    }
}

#[cfg(test)]
mod test {
    use tempfile::tempdir;

    use super::validate;
    use crate::cli::exit;

    #[tokio::test]
    async fn validate_reports_good_and_bad_configs() {
        let dir = tempdir().unwrap();
        let good = dir.path().join("good.json");
        std::fs::write(
            &good,
            r#"{"Sinks": [{"Type": "ConsoleSink", "Id": "console"}]}"#,
        )
        .unwrap();
        assert_eq!(validate(dir.path(), &good).await, exit::OK);

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, b"{ nope").unwrap();
        assert_eq!(validate(dir.path(), &bad).await, exit::INVALID_CONFIG);
    }
}
