//! Definition directory watcher
//!
//! Bridges filesystem notifications into reconcile queue items. Creation
//! and modification reload the file; deletion resolves the affected
//! resource through the store's path index.

use crate::Result;
use crate::reconciler::Reconciler;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Filesystem change relevant to the definition store
#[derive(Debug, Clone)]
pub enum FsEvent {
    Upserted(PathBuf),
    Removed(PathBuf),
}

fn is_definition_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}

fn map_event(event: Event) -> Vec<FsEvent> {
    let mapper: fn(PathBuf) -> FsEvent = match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => FsEvent::Upserted,
        EventKind::Remove(_) => FsEvent::Removed,
        _ => return Vec::new(),
    };
    event
        .paths
        .into_iter()
        .filter(|path| is_definition_file(path))
        .map(mapper)
        .collect()
}

/// Watch the definition directory and feed changes into the reconciler.
/// Returns once the watcher is installed; events are processed until the
/// cancellation token fires. The watcher handle lives inside the task.
pub fn spawn_definition_watcher(
    dir: &Path,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<FsEvent>();

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        match result {
            Ok(event) => {
                for fs_event in map_event(event) {
                    let _ = tx.send(fs_event);
                }
            }
            Err(e) => tracing::warn!("definition watcher error: {}", e),
        }
    })
    .map_err(|e| crate::MusterError::config(format!("cannot create watcher: {}", e)))?;

    watcher
        .watch(dir, RecursiveMode::Recursive)
        .map_err(|e| {
            crate::MusterError::config(format!("cannot watch {}: {}", dir.display(), e))
        })?;

    tracing::info!("watching definitions under {}", dir.display());

    tokio::spawn(async move {
        // Keeps the watcher registered for the lifetime of the task.
        let _watcher = watcher;
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    reconciler.handle_fs_event(event);
                }
                _ = cancel.cancelled() => break,
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_event_filters_non_yaml() {
        let event = Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![PathBuf::from("/defs/k8s.yaml"), PathBuf::from("/defs/notes.txt")],
            attrs: Default::default(),
        };
        let mapped = map_event(event);
        assert_eq!(mapped.len(), 1);
        assert!(matches!(&mapped[0], FsEvent::Upserted(path) if path.ends_with("k8s.yaml")));
    }

    #[test]
    fn test_map_event_remove() {
        let event = Event {
            kind: EventKind::Remove(notify::event::RemoveKind::File),
            paths: vec![PathBuf::from("/defs/k8s.yml")],
            attrs: Default::default(),
        };
        let mapped = map_event(event);
        assert!(matches!(&mapped[0], FsEvent::Removed(_)));
    }

    #[test]
    fn test_map_event_ignores_access() {
        let event = Event {
            kind: EventKind::Access(notify::event::AccessKind::Read),
            paths: vec![PathBuf::from("/defs/k8s.yaml")],
            attrs: Default::default(),
        };
        assert!(map_event(event).is_empty());
    }
}
