//! Durable engine state.
//!
//! Layout under the data directory:
//!
//! ```text
//! perspectives/<uuid>.json   one snapshot per perspective
//! languages/<id>.json        adapter settings blob
//! agent/keystore.json        sealed key + agent profile
//! capabilities.log           JSON lines, append-only
//! ```

use crate::agent::StoredAgent;
use crate::capability::CapabilityRecord;
use crate::error::{CoreError, Result};
use ad4m_types::PerspectiveSnapshot;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Where the engine keeps its records.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_perspectives(&self) -> Result<Vec<PerspectiveSnapshot>>;

    async fn save_perspective(&self, snapshot: &PerspectiveSnapshot) -> Result<()>;

    async fn remove_perspective(&self, uuid: Uuid) -> Result<()>;

    async fn load_language_settings(&self, language_id: &str) -> Result<Option<Value>>;

    async fn save_language_settings(&self, language_id: &str, settings: &Value) -> Result<()>;

    async fn load_agent(&self) -> Result<Option<StoredAgent>>;

    async fn save_agent(&self, agent: &StoredAgent) -> Result<()>;

    async fn append_capability_record(&self, record: &CapabilityRecord) -> Result<()>;

    async fn load_capability_log(&self) -> Result<Vec<CapabilityRecord>>;
}

/// JSON files under a root directory.
pub struct FileStateStore {
    root: PathBuf,
    log_lock: tokio::sync::Mutex<()>,
}

impl FileStateStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in ["perspectives", "languages", "agent"] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        debug!(root = %root.display(), "state store opened");
        Ok(Self {
            root,
            log_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn perspective_path(&self, uuid: Uuid) -> PathBuf {
        self.root.join("perspectives").join(format!("{uuid}.json"))
    }

    fn language_path(&self, language_id: &str) -> Result<PathBuf> {
        if language_id.is_empty() || language_id.starts_with('.') || language_id.contains(['/', '\\']) {
            return Err(CoreError::NotFound(format!("language '{language_id}'")));
        }
        Ok(self.root.join("languages").join(format!("{language_id}.json")))
    }

    fn agent_path(&self) -> PathBuf {
        self.root.join("agent").join("keystore.json")
    }

    fn log_path(&self) -> PathBuf {
        self.root.join("capabilities.log")
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temp file so readers never see a partial record.
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load_perspectives(&self) -> Result<Vec<PerspectiveSnapshot>> {
        let mut entries = tokio::fs::read_dir(self.root.join("perspectives")).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut snapshots = Vec::with_capacity(paths.len());
        for path in paths {
            match read_json::<PerspectiveSnapshot>(&path).await {
                Ok(Some(snapshot)) => snapshots.push(snapshot),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable perspective"),
            }
        }
        Ok(snapshots)
    }

    async fn save_perspective(&self, snapshot: &PerspectiveSnapshot) -> Result<()> {
        write_json(&self.perspective_path(snapshot.handle.uuid), snapshot).await
    }

    async fn remove_perspective(&self, uuid: Uuid) -> Result<()> {
        match tokio::fs::remove_file(self.perspective_path(uuid)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn load_language_settings(&self, language_id: &str) -> Result<Option<Value>> {
        read_json(&self.language_path(language_id)?).await
    }

    async fn save_language_settings(&self, language_id: &str, settings: &Value) -> Result<()> {
        write_json(&self.language_path(language_id)?, settings).await
    }

    async fn load_agent(&self) -> Result<Option<StoredAgent>> {
        read_json(&self.agent_path()).await
    }

    async fn save_agent(&self, agent: &StoredAgent) -> Result<()> {
        write_json(&self.agent_path(), agent).await
    }

    async fn append_capability_record(&self, record: &CapabilityRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.log_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_capability_log(&self) -> Result<Vec<CapabilityRecord>> {
        let contents = match tokio::fs::read_to_string(self.log_path()).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (n, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                // A torn final line from a crash mid-append is dropped.
                Err(e) => warn!(line = n + 1, error = %e, "skipping malformed capability record"),
            }
        }
        Ok(records)
    }
}

/// Keeps everything in memory; state is lost with the process.
#[derive(Default)]
pub struct MemoryStateStore {
    perspectives: Mutex<BTreeMap<Uuid, PerspectiveSnapshot>>,
    languages: Mutex<HashMap<String, Value>>,
    agent: Mutex<Option<StoredAgent>>,
    log: Mutex<Vec<CapabilityRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_perspectives(&self) -> Result<Vec<PerspectiveSnapshot>> {
        Ok(self.perspectives.lock().values().cloned().collect())
    }

    async fn save_perspective(&self, snapshot: &PerspectiveSnapshot) -> Result<()> {
        self.perspectives
            .lock()
            .insert(snapshot.handle.uuid, snapshot.clone());
        Ok(())
    }

    async fn remove_perspective(&self, uuid: Uuid) -> Result<()> {
        self.perspectives.lock().remove(&uuid);
        Ok(())
    }

    async fn load_language_settings(&self, language_id: &str) -> Result<Option<Value>> {
        Ok(self.languages.lock().get(language_id).cloned())
    }

    async fn save_language_settings(&self, language_id: &str, settings: &Value) -> Result<()> {
        self.languages
            .lock()
            .insert(language_id.to_string(), settings.clone());
        Ok(())
    }

    async fn load_agent(&self) -> Result<Option<StoredAgent>> {
        Ok(self.agent.lock().clone())
    }

    async fn save_agent(&self, agent: &StoredAgent) -> Result<()> {
        *self.agent.lock() = Some(agent.clone());
        Ok(())
    }

    async fn append_capability_record(&self, record: &CapabilityRecord) -> Result<()> {
        self.log.lock().push(record.clone());
        Ok(())
    }

    async fn load_capability_log(&self) -> Result<Vec<CapabilityRecord>> {
        Ok(self.log.lock().clone())
    }
}
