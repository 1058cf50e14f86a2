//! Last-resort storage for messages the transport would not take.

use crate::message::RequestMessage;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[async_trait]
pub trait Outbox: Send + Sync {
    /// Durably record `message` for later replay.
    async fn create(&self, message: &RequestMessage) -> anyhow::Result<()>;
}

/// Serialized form of an outboxed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: String,
    pub destination: String,
    pub body: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub group_id: Option<String>,
    /// Reply address, if the reply queue was already created.
    #[serde(default)]
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub outboxed_at: DateTime<Utc>,
}

impl From<&RequestMessage> for OutboxRecord {
    fn from(message: &RequestMessage) -> Self {
        Self {
            id: message.id().to_string(),
            destination: message.destination().to_string(),
            body: message.body().to_string(),
            attributes: message.attributes().clone(),
            group_id: message.group_id().map(str::to_string),
            reply_to: message.reply_to().and_then(|q| q.current_address()),
            created_at: message.created_at(),
            outboxed_at: Utc::now(),
        }
    }
}

/// Keeps records in memory. Useful for tests and for embedders that drain
/// the outbox themselves.
#[derive(Default)]
pub struct MemoryOutbox {
    records: Mutex<Vec<OutboxRecord>>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<OutboxRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl Outbox for MemoryOutbox {
    async fn create(&self, message: &RequestMessage) -> anyhow::Result<()> {
        self.records.lock().push(OutboxRecord::from(message));
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
pub struct JsonlOutbox {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlOutbox {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every record, skipping blank lines.
    pub async fn read_all(&self) -> anyhow::Result<Vec<OutboxRecord>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str::<OutboxRecord>(line)
                    .with_context(|| format!("{}:{}: malformed record", self.path.display(), i + 1))
            })
            .collect()
    }
}

#[async_trait]
impl Outbox for JsonlOutbox {
    async fn create(&self, message: &RequestMessage) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&OutboxRecord::from(message))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening outbox {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
