//! Installation-wide key-value store under `parameters/`.
//!
//! One JSON file per key, rewritten atomically. Holds identifiers that
//! must survive restarts and upgrades, like the installation client id.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;
use uuid::Uuid;

const CLIENT_ID_KEY: &str = "client_id";

pub struct ParameterStore {
    directory: PathBuf,
}

impl ParameterStore {
    pub fn new(data_dir: &Path) -> io::Result<Self> {
        let directory = data_dir.join("parameters");
        fs::create_dir_all(&directory)?;
        Ok(ParameterStore { directory })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.key_path(key);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(message = "Ignoring malformed parameter file.", ?path, %error);
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> io::Result<()> {
        let tmp = self.key_path(&format!("{key}.new"));
        let stable = self.key_path(key);
        let bytes = serde_json::to_vec(value)?;
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &stable)?;
        Ok(())
    }

    /// The stable per-installation identifier, created on first use.
    pub fn client_id(&self) -> io::Result<String> {
        if let Some(existing) = self.get::<String>(CLIENT_ID_KEY) {
            return Ok(existing);
        }
        let fresh = Uuid::new_v4().to_string();
        self.set(CLIENT_ID_KEY, &fresh)?;
        Ok(fresh)
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{key}.json"))
    }
}

#[cfg(test)]
mod test {
    use tempfile::tempdir;

    use super::ParameterStore;

    #[test]
    fn client_id_is_stable_across_reopens() {
        let dir = tempdir().unwrap();
        let first = ParameterStore::new(dir.path()).unwrap().client_id().unwrap();
        let second = ParameterStore::new(dir.path()).unwrap().client_id().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn set_get_round_trip() {
        let dir = tempdir().unwrap();
        let store = ParameterStore::new(dir.path()).unwrap();
        store.set("telemetry_opt_in", &true).unwrap();
        assert_eq!(store.get::<bool>("telemetry_opt_in"), Some(true));
        assert_eq!(store.get::<bool>("missing"), None);
    }
}
