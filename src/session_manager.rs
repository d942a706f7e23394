//! Discovers configuration files and reconciles running sessions against
//! them.
//!
//! Two locations are watched: the default configuration file and the
//! `_extra-configs/` sub-directory. The directory is polled on a fixed
//! interval and diffed by path: new files start sessions, removed files
//! stop them, modified files (mtime+size first, content hash as the
//! tie-break) restart them under the same name. One file's failure never
//! blocks another.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{is_acceptable_config_file_name, AgentConfig};
use crate::metrics::MetricKey;
use crate::session::{Session, SessionContext, SessionStatus};

pub const DEFAULT_CONFIG_FILE: &str = "appsettings.json";
pub const EXTRA_CONFIGS_DIR: &str = "_extra-configs";
const STATUS_FILE: &str = "status.json";

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub config_dir: PathBuf,
    pub poll_interval: Duration,
    pub graceful_stop: Duration,
}

impl ManagerSettings {
    pub fn new(config_dir: PathBuf) -> Self {
        ManagerSettings {
            config_dir,
            poll_interval: Duration::from_millis(500),
            graceful_stop: crate::shutdown::DEFAULT_GRACEFUL_STOP,
        }
    }

    fn clamped_poll_interval(&self) -> Duration {
        self.poll_interval
            .clamp(Duration::from_millis(100), Duration::from_millis(1_000))
    }

    pub fn default_config_path(&self) -> PathBuf {
        self.config_dir.join(DEFAULT_CONFIG_FILE)
    }

    pub fn extra_configs_dir(&self) -> PathBuf {
        self.config_dir.join(EXTRA_CONFIGS_DIR)
    }
}

/// Cheap change detector; the hash breaks mtime+size ties so touching a
/// file without changing it does not bounce the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    mtime: Option<std::time::SystemTime>,
    size: u64,
    hash: u64,
}

impl Fingerprint {
    fn quick(path: &Path) -> Option<(Option<std::time::SystemTime>, u64)> {
        let metadata = std::fs::metadata(path).ok()?;
        Some((metadata.modified().ok(), metadata.len()))
    }
}

struct RunningSession {
    session: Session,
    fingerprint: Fingerprint,
    generation: u64,
}

/// Written to `status.json` for the `status` CLI command.
#[derive(Debug, Serialize)]
pub struct AgentStatus {
    pub pid: u32,
    pub written_at: chrono::DateTime<Utc>,
    pub sessions: Vec<SessionStatusEntry>,
}

#[derive(Debug, Serialize)]
pub struct SessionStatusEntry {
    #[serde(flatten)]
    pub status: SessionStatus,
    pub counters: Vec<(MetricKey, i64)>,
}

pub struct SessionManager {
    settings: ManagerSettings,
    ctx: Arc<SessionContext>,
    sessions: IndexMap<PathBuf, RunningSession>,
    next_generation: u64,
}

impl SessionManager {
    pub fn new(settings: ManagerSettings, ctx: Arc<SessionContext>) -> Self {
        SessionManager {
            settings,
            ctx,
            sessions: IndexMap::new(),
            next_generation: 0,
        }
    }

    /// Load the default configuration and every acceptable extra file.
    /// Failures are logged per file and never block the rest.
    pub fn startup(&mut self) {
        let default_path = self.settings.default_config_path();
        if default_path.exists() {
            self.try_start(&default_path);
        } else {
            warn!(message = "Default configuration file not found.", path = ?default_path);
        }

        for path in self.discover_extra_configs() {
            self.try_start(&path);
        }
    }

    /// One reconciliation pass over both watched locations.
    pub async fn poll_once(&mut self) {
        let default_path = self.settings.default_config_path();
        let mut expected: HashSet<PathBuf> = self.discover_extra_configs().into_iter().collect();
        if default_path.exists() {
            expected.insert(default_path);
        }

        // Removed files stop their sessions.
        let removed: Vec<PathBuf> = self
            .sessions
            .keys()
            .filter(|path| !expected.contains(*path))
            .cloned()
            .collect();
        for path in removed {
            if let Some(mut running) = self.sessions.shift_remove(&path) {
                info!(message = "Configuration removed; stopping session.", session = %running.session.name());
                running.session.stop(self.settings.graceful_stop).await;
            }
        }

        // New files start sessions; changed files restart them.
        for path in expected {
            match self.sessions.get(&path) {
                None => self.try_start(&path),
                Some(running) => {
                    let Some((mtime, size)) = Fingerprint::quick(&path) else {
                        continue;
                    };
                    if mtime == running.fingerprint.mtime && size == running.fingerprint.size {
                        continue;
                    }
                    let Ok((_, hash)) = AgentConfig::load(&path) else {
                        warn!(message = "Modified configuration no longer parses; keeping the running session.", ?path);
                        continue;
                    };
                    if hash == running.fingerprint.hash {
                        // Touched but unchanged; remember the new mtime so
                        // the next poll skips the re-hash.
                        if let Some(running) = self.sessions.get_mut(&path) {
                            running.fingerprint = Fingerprint { mtime, size, hash };
                        }
                        continue;
                    }
                    info!(message = "Configuration changed; restarting session.", ?path);
                    if let Some(mut running) = self.sessions.shift_remove(&path) {
                        running.session.stop(self.settings.graceful_stop).await;
                    }
                    self.try_start(&path);
                }
            }
        }
    }

    /// Run until cancelled, then tear every session down in parallel under
    /// a shared graceful deadline.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        self.startup();
        self.write_status();

        let poll_interval = self.settings.clamped_poll_interval();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {
                    self.poll_once().await;
                    self.write_status();
                }
            }
        }

        let graceful = self.settings.graceful_stop;
        let mut stops = Vec::new();
        for (_, mut running) in self.sessions.drain(..) {
            stops.push(tokio::spawn(async move {
                running.session.stop(graceful).await;
            }));
        }
        crate::shutdown::join_with_deadline(stops, graceful, "sessions").await;
        info!(message = "All sessions stopped.");
    }

    pub fn session_names(&self) -> Vec<String> {
        self.sessions
            .values()
            .map(|running| running.session.name().to_owned())
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn generation_of(&self, path: &Path) -> Option<u64> {
        self.sessions.get(path).map(|running| running.generation)
    }

    pub fn statuses(&self) -> Vec<SessionStatusEntry> {
        self.sessions
            .values()
            .map(|running| SessionStatusEntry {
                status: running.session.status(),
                counters: running.session.metrics().snapshot(),
            })
            .collect()
    }

    fn discover_extra_configs(&self) -> Vec<PathBuf> {
        let dir = self.settings.extra_configs_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| is_acceptable_config_file_name(path))
            .collect();
        paths.sort();
        paths
    }

    fn try_start(&mut self, path: &Path) {
        let (config, hash) = match AgentConfig::load(path) {
            Ok(loaded) => loaded,
            Err(error) => {
                error!(message = "Could not load configuration.", ?path, %error);
                return;
            }
        };
        let Some((mtime, size)) = Fingerprint::quick(path) else {
            error!(message = "Could not stat configuration.", ?path);
            return;
        };

        let mut session = Session::load(path, &config, &self.ctx);

        // Duplicate display names across configurations are rejected; the
        // session that claimed the name first keeps running.
        if self
            .sessions
            .values()
            .any(|running| running.session.name() == session.name())
        {
            error!(
                message = "A session with this name is already running; skipping.",
                session = %session.name(),
                ?path,
            );
            return;
        }

        session.start();
        self.next_generation += 1;
        self.sessions.insert(
            path.to_path_buf(),
            RunningSession {
                session,
                fingerprint: Fingerprint { mtime, size, hash },
                generation: self.next_generation,
            },
        );
    }

    fn write_status(&self) {
        let status = AgentStatus {
            pid: std::process::id(),
            written_at: Utc::now(),
            sessions: self.statuses(),
        };
        let path = self.ctx.data_dir.join(STATUS_FILE);
        let tmp = self.ctx.data_dir.join(format!("{STATUS_FILE}.new"));
        let write = || -> std::io::Result<()> {
            std::fs::write(&tmp, serde_json::to_vec_pretty(&status)?)?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        };
        if let Err(error) = write() {
            warn!(message = "Could not write status file.", %error);
        }
    }
}

/// Read the status file written by a running agent.
pub fn read_status(data_dir: &Path) -> Option<serde_json::Value> {
    let bytes = std::fs::read(data_dir.join(STATUS_FILE)).ok()?;
    serde_json::from_slice(&bytes).ok()
}
