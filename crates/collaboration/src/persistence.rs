/// Durable storage for document sessions
/// Holds the element map (and field stamps) keyed by session id between restarts
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::{Element, ElementId, FieldStamps, Result, SessionId};

/// At-rest form of one document session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedDocument {
    pub elements: BTreeMap<ElementId, Element>,

    /// Absent in documents written without stamps
    #[serde(default)]
    pub field_stamps: BTreeMap<ElementId, FieldStamps>,
}

/// Storage backend for document sessions
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// `None` when the session has never been saved
    async fn load(&self, session_id: &SessionId) -> Result<Option<PersistedDocument>>;

    async fn save(&self, session_id: &SessionId, document: &PersistedDocument) -> Result<()>;
}

/// One pretty-printed JSON file per session under a data directory
#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    storage_dir: PathBuf,
}

impl JsonFileRepository {
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: storage_dir.as_ref().to_path_buf(),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Session ids are restricted to a filename-safe charset, so this never escapes the directory
    pub fn path_for(&self, session_id: &SessionId) -> PathBuf {
        self.storage_dir.join(format!("{}.json", session_id))
    }
}

#[async_trait]
impl DocumentRepository for JsonFileRepository {
    async fn load(&self, session_id: &SessionId) -> Result<Option<PersistedDocument>> {
        let path = self.path_for(session_id);

        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let document: PersistedDocument = serde_json::from_str(&json)?;
        debug!(
            "Loaded session {} ({} elements) from {}",
            session_id,
            document.elements.len(),
            path.display()
        );
        Ok(Some(document))
    }

    async fn save(&self, session_id: &SessionId, document: &PersistedDocument) -> Result<()> {
        fs::create_dir_all(&self.storage_dir).await?;

        let json = serde_json::to_string_pretty(document)?;

        // Readers only ever see a complete file
        let path = self.path_for(session_id);
        let tmp = self.storage_dir.join(format!(".{}.json.tmp", session_id));
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;

        Ok(())
    }
}

/// In-process storage for tests and ephemeral servers
#[derive(Debug, Default)]
pub struct MemoryRepository {
    documents: DashMap<SessionId, PersistedDocument>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<PersistedDocument> {
        self.documents.get(session_id).map(|doc| doc.clone())
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl DocumentRepository for MemoryRepository {
    async fn load(&self, session_id: &SessionId) -> Result<Option<PersistedDocument>> {
        Ok(self.get(session_id))
    }

    async fn save(&self, session_id: &SessionId, document: &PersistedDocument) -> Result<()> {
        self.documents.insert(session_id.clone(), document.clone());
        Ok(())
    }
}
