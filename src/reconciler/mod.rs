//! Reconciler
//!
//! A single-worker queue syncing declarative definitions to running
//! services. Items are enqueued by the filesystem watcher over the
//! definition directory and by explicit trigger calls; each item tracks its
//! own state, retry count, and backoff.

pub mod watcher;

use crate::aggregator::Aggregator;
use crate::config::{DefinitionKind, DefinitionStore};
use crate::event::{EventBus, EventPayload, EventRecord, EventSink, ObjectReference};
use crate::registry::HandlerRegistry;
use crate::supervisor::Supervisor;
use crate::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use watcher::spawn_definition_watcher;

/// State of one tracked reconcile item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Pending,
    Reconciling,
    Synced,
    /// Transient error, backing off before re-enqueue
    Error,
    /// Permanent error (validation); stays until the definition changes
    Failed,
}

/// Tracking record for one (kind, name)
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileItem {
    pub kind: DefinitionKind,
    pub name: String,
    pub namespace: String,
    pub state: ItemState,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    kind: DefinitionKind,
    name: String,
    namespace: String,
    attempt: u32,
}

/// Work queue plus the worker loop
pub struct Reconciler {
    definitions: Arc<DefinitionStore>,
    supervisor: Arc<Supervisor>,
    registry: Arc<HandlerRegistry>,
    bus: Arc<EventBus>,
    sink: Arc<dyn EventSink>,
    queue_tx: mpsc::UnboundedSender<QueueEntry>,
    items: DashMap<(DefinitionKind, String), ReconcileItem>,
    /// Last applied definition per service, for idempotence
    applied: DashMap<String, serde_json::Value>,
}

impl Reconciler {
    pub fn new(
        definitions: Arc<DefinitionStore>,
        supervisor: Arc<Supervisor>,
        registry: Arc<HandlerRegistry>,
        bus: Arc<EventBus>,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let reconciler = Arc::new(Self {
            definitions,
            supervisor,
            registry,
            bus,
            sink,
            queue_tx,
            items: DashMap::new(),
            applied: DashMap::new(),
        });

        reconciler.clone().spawn_worker(queue_rx, cancel);
        reconciler
    }

    /// Enqueue one resource for reconciliation
    pub fn trigger_reconcile(&self, kind: DefinitionKind, name: &str) {
        self.enqueue(QueueEntry {
            kind,
            name: name.to_string(),
            namespace: "default".to_string(),
            attempt: 0,
        });
    }

    /// Enqueue everything currently in the definition store (startup sync)
    pub fn trigger_full_sync(&self) {
        for server in self.definitions.list_mcp_servers() {
            self.trigger_reconcile(DefinitionKind::McpServer, &server.name);
        }
        for class in self.definitions.list_service_classes() {
            self.trigger_reconcile(DefinitionKind::ServiceClass, &class.name);
        }
        for workflow in self.definitions.list_workflows() {
            self.trigger_reconcile(DefinitionKind::Workflow, &workflow.name);
        }
    }

    pub fn items(&self) -> Vec<ReconcileItem> {
        self.items.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn item(&self, kind: DefinitionKind, name: &str) -> Option<ReconcileItem> {
        self.items
            .get(&(kind, name.to_string()))
            .map(|entry| entry.value().clone())
    }

    fn enqueue(&self, entry: QueueEntry) {
        self.items
            .entry((entry.kind, entry.name.clone()))
            .and_modify(|item| {
                if item.state != ItemState::Reconciling {
                    item.state = ItemState::Pending;
                }
            })
            .or_insert_with(|| ReconcileItem {
                kind: entry.kind,
                name: entry.name.clone(),
                namespace: entry.namespace.clone(),
                state: ItemState::Pending,
                retries: 0,
                last_error: None,
                last_reconciled: None,
            });
        let _ = self.queue_tx.send(entry);
    }

    fn spawn_worker(
        self: Arc<Self>,
        mut queue_rx: mpsc::UnboundedReceiver<QueueEntry>,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    entry = queue_rx.recv() => {
                        let Some(entry) = entry else { break };
                        self.process(entry).await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    async fn process(self: &Arc<Self>, entry: QueueEntry) {
        let key = (entry.kind, entry.name.clone());
        if let Some(mut item) = self.items.get_mut(&key) {
            item.state = ItemState::Reconciling;
            item.retries = entry.attempt;
        }

        let result = self.reconcile(entry.kind, &entry.name).await;

        match result {
            Ok(()) => {
                if let Some(mut item) = self.items.get_mut(&key) {
                    item.state = ItemState::Synced;
                    item.last_error = None;
                    item.last_reconciled = Some(Utc::now());
                }
                self.bus
                    .publish(EventPayload::ReconcileCompleted {
                        kind: entry.kind.to_string(),
                        name: entry.name.clone(),
                    })
                    .await;
                let _ = self
                    .sink
                    .record(EventRecord::normal(
                        ObjectReference::new(&entry.kind.to_string(), &entry.name),
                        "Reconciled",
                        "definition applied",
                    ))
                    .await;
            }
            Err(e) if e.is_transient() && entry.attempt < crate::constants::RECONCILE_RETRY_CAP => {
                let delay = crate::constants::RECONCILE_BACKOFF_BASE
                    .saturating_mul(2u32.saturating_pow(entry.attempt))
                    .min(crate::constants::RECONCILE_BACKOFF_CAP);
                tracing::warn!(
                    "reconcile of {} '{}' failed (attempt {}), retrying in {:?}: {}",
                    entry.kind,
                    entry.name,
                    entry.attempt + 1,
                    delay,
                    e
                );
                if let Some(mut item) = self.items.get_mut(&key) {
                    item.state = ItemState::Error;
                    item.last_error = Some(e.to_string());
                }

                let reconciler = self.clone();
                let mut retry = entry.clone();
                retry.attempt += 1;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    reconciler.enqueue(retry);
                });
            }
            Err(e) => {
                tracing::error!(
                    "reconcile of {} '{}' failed permanently: {}",
                    entry.kind,
                    entry.name,
                    e
                );
                if let Some(mut item) = self.items.get_mut(&key) {
                    item.state = ItemState::Failed;
                    item.last_error = Some(e.to_string());
                }
                let _ = self
                    .sink
                    .record(EventRecord::warning(
                        ObjectReference::new(&entry.kind.to_string(), &entry.name),
                        "ReconcileFailed",
                        e.status_message(),
                    ))
                    .await;
            }
        }
    }

    /// Compare desired (definition store) against actual (supervisor) and
    /// converge. Applying an unchanged definition is a no-op.
    async fn reconcile(&self, kind: DefinitionKind, name: &str) -> Result<()> {
        match kind {
            DefinitionKind::McpServer => self.reconcile_mcp_server(name).await,
            // Classes and workflows have no running counterpart of their
            // own; the store is the actual state. Catalogs refresh so new
            // workflow tools appear.
            DefinitionKind::ServiceClass | DefinitionKind::Workflow => {
                self.refresh_catalogs();
                Ok(())
            }
        }
    }

    async fn reconcile_mcp_server(&self, name: &str) -> Result<()> {
        let desired = self.definitions.get_mcp_server(name);

        match desired {
            Some(definition) => {
                definition.validate()?;
                let serialized = serde_json::to_value(&definition)?;

                if self.supervisor.is_supervised(name) {
                    let unchanged = self
                        .applied
                        .get(name)
                        .is_some_and(|applied| *applied == serialized);
                    if unchanged {
                        return Ok(());
                    }
                    // Definition changed: replace the supervised service.
                    self.supervisor.remove_service(name).await?;
                }

                self.supervisor.add_mcp_server(definition).await?;
                self.applied.insert(name.to_string(), serialized);
                Ok(())
            }
            None => {
                if self.supervisor.is_supervised(name) {
                    self.supervisor.remove_service(name).await?;
                }
                self.applied.remove(name);
                Ok(())
            }
        }
    }

    fn refresh_catalogs(&self) {
        if let Some(aggregator) = self
            .registry
            .get::<Aggregator>(crate::constants::HANDLER_AGGREGATOR)
        {
            aggregator.invalidate_catalogs();
        }
    }

    /// Map a filesystem event into queue items. Modified files reload into
    /// the store first; deletions resolve through the store's path index.
    pub fn handle_fs_event(&self, event: watcher::FsEvent) {
        match event {
            watcher::FsEvent::Upserted(path) => match self.definitions.load_file(&path) {
                Ok(loaded) => {
                    for (kind, name) in loaded {
                        self.trigger_reconcile(kind, &name);
                    }
                }
                Err(e) => {
                    tracing::error!("failed to load {}: {}", path.display(), e);
                }
            },
            watcher::FsEvent::Removed(path) => {
                if let Some((kind, name)) = self.definitions.remove_path(&path) {
                    self.trigger_reconcile(kind, &name);
                }
            }
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("items", &self.items.len())
            .finish()
    }
}
