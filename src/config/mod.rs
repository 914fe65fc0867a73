//! Persisted configuration primitives.
//!
//! The profile/instance store itself (listing UI, history) lives outside this
//! core. What lives here is the plumbing every read and write against that
//! store goes through: the versioned document schema, an atomic
//! write-temp-then-rename primitive, and a cross-process advisory lock
//! guarding read-modify-write cycles against the instance list.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fd_lock::RwLock as FileLock;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// The only schema version this core understands. A document claiming any
/// other version is rejected before any field is read.
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub ssh_args: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub profile_id: String,
    pub http_port: u16,
    pub socks_port: u16,
    pub daemon_pid: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub last_seen_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub version: u32,
    #[serde(default)]
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub instances: Vec<Instance>,
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            profiles: Vec::new(),
            instances: Vec::new(),
        }
    }
}

impl ConfigDocument {
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let doc: ConfigDocument = serde_json::from_str(raw)
            .map_err(|e| ProxyError::config(format!("failed to parse config document: {e}")))?;
        if doc.version != CONFIG_VERSION {
            return Err(ProxyError::config(format!(
                "config schema version mismatch: expected {CONFIG_VERSION}, found {}",
                doc.version
            )));
        }
        Ok(doc)
    }

    pub fn profile(&self, id: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// Insert or replace the instance record with the same id.
    pub fn upsert_instance(&mut self, instance: Instance) {
        if let Some(existing) = self.instances.iter_mut().find(|i| i.id == instance.id) {
            *existing = instance;
        } else {
            self.instances.push(instance);
        }
    }
}

/// A single config document guarded by a cross-process advisory lock on a
/// sibling `.lock` file. All mutation goes through [`ConfigStore::update`],
/// which reads, mutates, and atomically rewrites the document while holding
/// the lock for the whole cycle.
pub struct ConfigStore {
    dir: PathBuf,
    doc_path: PathBuf,
    lock_path: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            doc_path: dir.join("config.json"),
            lock_path: dir.join("config.lock"),
            dir,
        }
    }

    fn ensure_dir(&self) -> Result<(), ProxyError> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)
                .map_err(|e| ProxyError::config(format!("failed to create config dir: {e}")))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))
                    .map_err(|e| ProxyError::config(format!("failed to chmod config dir: {e}")))?;
            }
        }
        Ok(())
    }

    pub fn load(&self) -> Result<ConfigDocument, ProxyError> {
        if !self.doc_path.exists() {
            return Ok(ConfigDocument::default());
        }
        let raw = fs::read_to_string(&self.doc_path)
            .map_err(|e| ProxyError::config(format!("failed to read config document: {e}")))?;
        ConfigDocument::parse(&raw)
    }

    /// Read-modify-write the document under the cross-process lock.
    pub fn update<F>(&self, mutate: F) -> Result<ConfigDocument, ProxyError>
    where
        F: FnOnce(&mut ConfigDocument),
    {
        self.ensure_dir()?;
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.lock_path)
            .map_err(|e| ProxyError::config(format!("failed to open lock file: {e}")))?;
        let mut lock = FileLock::new(lock_file);
        let _guard = lock
            .write()
            .map_err(|e| ProxyError::config(format!("failed to acquire config lock: {e}")))?;

        let mut doc = self.load()?;
        mutate(&mut doc);
        write_atomic(&self.doc_path, &serde_json::to_vec_pretty(&doc).unwrap())?;
        Ok(doc)
    }
}

/// Write `contents` to `path` atomically: a sibling temp file in the same
/// directory, synced, then renamed over the destination. The destination is
/// never observed truncated or partially written.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ProxyError> {
    let dir = path.parent().ok_or_else(|| {
        ProxyError::config(format!("config path {} has no parent directory", path.display()))
    })?;
    let tmp_path = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("config"),
        std::process::id()
    ));

    {
        let mut tmp = File::create(&tmp_path)
            .map_err(|e| ProxyError::config(format!("failed to create temp config file: {e}")))?;
        tmp.write_all(contents)
            .map_err(|e| ProxyError::config(format!("failed to write temp config file: {e}")))?;
        tmp.sync_all()
            .map_err(|e| ProxyError::config(format!("failed to fsync temp config file: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600)).map_err(|e| {
                ProxyError::config(format!("failed to chmod temp config file: {e}"))
            })?;
        }
    }

    fs::rename(&tmp_path, path)
        .map_err(|e| ProxyError::config(format!("failed to rename temp config file: {e}")))?;
    Ok(())
}

/// Default directory this core persists its CA, certs, and config document
/// under, mirroring the layout the external profile store already uses.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("codex-proxy")
}
