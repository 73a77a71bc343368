//! Filesystem watch on the device plugin directory

use gpulet_core::{GpuletError, GpuletResult};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::debug;

/// Event forwarded to the manager loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    /// A file appeared in the watched directory
    Created(PathBuf),
    /// The watcher reported an error
    Error(String),
}

/// Watches a single directory, non-recursively, for created files.
///
/// Events are forwarded until the watcher is dropped.
pub struct PluginDirWatcher {
    _watcher: RecommendedWatcher,
}

impl PluginDirWatcher {
    pub fn new(dir: &Path, tx: mpsc::Sender<FsEvent>) -> GpuletResult<Self> {
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                let events = match result {
                    Ok(event) => match event.kind {
                        EventKind::Create(_) => {
                            event.paths.into_iter().map(FsEvent::Created).collect()
                        }
                        _ => Vec::new(),
                    },
                    Err(e) => vec![FsEvent::Error(e.to_string())],
                };
                for event in events {
                    // The receiver is gone once the manager loop exits.
                    let _ = tx.blocking_send(event);
                }
            },
            Config::default(),
        )
        .map_err(|e| GpuletError::Watch(e.to_string()))?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| GpuletError::Watch(format!("{}: {}", dir.display(), e)))?;
        debug!(dir = %dir.display(), "Watching plugin directory");

        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_created_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let _watcher = PluginDirWatcher::new(dir.path(), tx).unwrap();

        let path = dir.path().join("kubelet.sock");
        std::fs::write(&path, b"").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(FsEvent::Created(p)) if p.file_name() == path.file_name() => return p,
                    Some(_) => continue,
                    None => panic!("watcher channel closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event.file_name(), path.file_name());
    }

    #[test]
    fn test_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let result = PluginDirWatcher::new(&dir.path().join("missing"), tx);
        assert!(matches!(result, Err(GpuletError::Watch(_))));
    }
}
