use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::info;

use tabula_engine::DatasetProfile;

use crate::message::{MessageKind, Role, StoredMessage};

/// The uploaded file bound to a session, plus its cached profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub filename: String,
    pub path: PathBuf,
    pub profile: DatasetProfile,
}

/// Durable per-session metadata. A session only exists once an upload has
/// succeeded, so `file` is not optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub file: FileMeta,
}

/// Lightweight listing entry (no messages, no profile).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&SessionMeta> for SessionSummary {
    fn from(meta: &SessionMeta) -> Self {
        Self {
            id: meta.id.clone(),
            title: meta.title.clone(),
            created_at: meta.created_at,
        }
    }
}

/// File-based session store — one directory per session:
///
/// ```text
/// {data_dir}/{session_id}/
///   original.{csv|parquet}    written by the upload collaborator
///   session.json              SessionMeta
///   messages.json             Vec<StoredMessage>, append-only
/// ```
///
/// Methods are synchronous filesystem operations; the server serializes
/// writes per session by routing them through the session runtime.
pub struct SessionStore {
    data_dir: PathBuf,
}

impl SessionStore {
    /// Create a store, ensuring the data directory exists.
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir: {}", data_dir.display()))?;
        info!(path = %data_dir.display(), "session store initialized");
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
        })
    }

    fn session_dir(&self, id: &str) -> PathBuf {
        self.data_dir.join(id)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join("session.json")
    }

    fn messages_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join("messages.json")
    }

    /// Record a session handed over by the upload collaborator: the file is
    /// already on disk and profiled, the session becomes ready for chat.
    pub fn register(
        &self,
        id: &str,
        user_id: &str,
        file_path: &Path,
        filename: &str,
        profile: DatasetProfile,
    ) -> Result<SessionMeta> {
        let meta = SessionMeta {
            id: id.to_string(),
            user_id: user_id.to_string(),
            title: None,
            created_at: Utc::now(),
            file: FileMeta {
                filename: filename.to_string(),
                path: file_path.to_path_buf(),
                profile,
            },
        };

        std::fs::create_dir_all(self.session_dir(id))
            .with_context(|| format!("failed to create session dir: {id}"))?;
        self.write_meta(&meta)?;
        self.write_messages(id, &[])?;

        info!(id = %id, user = %user_id, file = %filename, "session registered");
        Ok(meta)
    }

    /// Get session metadata by id.
    pub fn meta(&self, id: &str) -> Result<Option<SessionMeta>> {
        let path = self.meta_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read session meta: {id}"))?;
        let meta = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse session meta: {id}"))?;
        Ok(Some(meta))
    }

    /// List the caller's sessions, most recent first.
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<SessionSummary>> {
        let mut summaries = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.meta(&id) {
                Ok(Some(meta)) if meta.user_id == user_id => summaries.push((&meta).into()),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "skipping unreadable session");
                }
            }
        }
        summaries.sort_by(|a: &SessionSummary, b: &SessionSummary| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// All messages of a session in insertion order.
    pub fn messages(&self, id: &str) -> Result<Vec<StoredMessage>> {
        let path = self.messages_path(id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read messages: {id}"))?;
        let messages = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse messages: {id}"))?;
        Ok(messages)
    }

    /// Append a message, assigning the next monotonic id.
    pub fn append(
        &self,
        id: &str,
        role: Role,
        kind: MessageKind,
        body: impl Into<String>,
        payload: Option<Value>,
    ) -> Result<u64> {
        let mut messages = self.messages(id)?;
        let next_id = messages.last().map(|m| m.id + 1).unwrap_or(1);
        messages.push(StoredMessage {
            id: next_id,
            role,
            kind,
            body: body.into(),
            payload,
            created_at: Utc::now(),
        });
        self.write_messages(id, &messages)?;
        Ok(next_id)
    }

    /// Set the session title and persist it.
    pub fn set_title(&self, id: &str, title: &str) -> Result<bool> {
        let Some(mut meta) = self.meta(id)? else {
            return Ok(false);
        };
        meta.title = Some(title.to_string());
        self.write_meta(&meta)?;
        Ok(true)
    }

    /// Cascade-delete a session: metadata, messages, and the uploaded file
    /// all live in the session directory. Returns false when already gone.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let dir = self.session_dir(id);
        if !dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to delete session: {id}"))?;
        info!(id = %id, "session deleted");
        Ok(true)
    }

    fn write_meta(&self, meta: &SessionMeta) -> Result<()> {
        let data = serde_json::to_string_pretty(meta)?;
        std::fs::write(self.meta_path(&meta.id), data)
            .with_context(|| format!("failed to write session meta: {}", meta.id))?;
        Ok(())
    }

    fn write_messages(&self, id: &str, messages: &[StoredMessage]) -> Result<()> {
        let data = serde_json::to_string(messages)?;
        std::fs::write(self.messages_path(id), data)
            .with_context(|| format!("failed to write messages: {id}"))?;
        Ok(())
    }
}
