//! Kubernetes-style event records
//!
//! Lifecycle subsystems emit object-scoped events (reason, message, type)
//! either to the Kubernetes API (external collaborator) or to a file-based
//! sink writing one JSON object per line.

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Reference to the object an event is about
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ObjectReference {
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            api_version: "muster.giantswarm.io/v1alpha1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: "default".to_string(),
            uid: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// One emitted event record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub involved_object: ObjectReference,
    pub reason: String,
    pub message: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub source: String,
    pub count: u32,
}

impl EventRecord {
    pub fn normal(object: ObjectReference, reason: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            involved_object: object,
            reason: reason.to_string(),
            message: message.into(),
            event_type: EventType::Normal,
            source: "muster".to_string(),
            count: 1,
        }
    }

    pub fn warning(object: ObjectReference, reason: &str, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Warning,
            ..Self::normal(object, reason, message)
        }
    }
}

/// Destination for event records
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, record: EventRecord) -> Result<()>;
}

/// Appends one JSON object per line to a file
pub struct FileEventSink {
    path: PathBuf,
    /// (object, reason) -> running count for repeated events
    counts: Mutex<HashMap<(ObjectReference, String), u32>>,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl FileEventSink {
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            counts: Mutex::new(HashMap::new()),
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl EventSink for FileEventSink {
    async fn record(&self, mut record: EventRecord) -> Result<()> {
        record.count = {
            let mut counts = self.counts.lock();
            let key = (record.involved_object.clone(), record.reason.clone());
            let count = counts.entry(key).or_insert(0);
            *count += 1;
            *count
        };

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Discards all records; used when no sink is configured
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn record(&self, _record: EventRecord) -> Result<()> {
        Ok(())
    }
}
