//! Credential persistence: one `currentCreds-<name>.json` per component,
//! written atomically (temp file then rename). Writes are serialized so two
//! tasks refreshing the same token cannot interleave.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_lock::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

pub struct CredentialsStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CredentialsStore {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("currentCreds-{name}.json"))
    }

    /// Returns `None` when no credentials have been saved yet; a present but
    /// unreadable file is an error the caller should surface.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("reading credentials at {}", path.display()))?;
        let creds = serde_json::from_str(&contents)
            .with_context(|| format!("parsing credentials at {}", path.display()))?;
        Ok(Some(creds))
    }

    pub async fn save<T: Serialize>(&self, name: &str, creds: &T) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let body = serde_json::to_string_pretty(creds)?;
        let tmp = temp_path(&path);
        std::fs::write(&tmp, body)
            .with_context(|| format!("writing credentials to {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("moving credentials into {}", path.display()))?;
        debug!("saved credentials for {name}");
        Ok(())
    }

    pub async fn clear(&self, name: &str) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(name);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
