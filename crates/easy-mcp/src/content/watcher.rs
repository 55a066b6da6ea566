//! Directory watcher feeding a Content Handler
//!
//! Loads every file under the handler's root once, then applies filesystem
//! events one at a time in arrival order: a path that is a file is (re)read
//! and upserted, a directory is rescanned, and a missing path is removed.
//! Rescanning covers directories created or moved into the tree in one
//! step, whose files may never get events of their own.

use super::ContentHandler;
use easy_core::{Error, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Keeps the OS watch and the event task alive
pub struct ContentWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for ContentWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Load `handler`'s directory and keep it in sync with the filesystem
pub async fn watch_content(handler: Arc<dyn ContentHandler>) -> Result<ContentWatcher> {
    let root = handler.root().to_path_buf();
    if !root.is_dir() {
        return Err(Error::config(format!(
            "content directory {} does not exist",
            root.display()
        )));
    }

    let loaded = scan(handler.as_ref(), &root).await;
    info!(root = %root.display(), kind = ?handler.kind(), loaded, "Content loaded");

    let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
        }
        Err(e) => error!("Content watcher error: {}", e),
    })
    .map_err(|e| Error::config(format!("failed to create content watcher: {}", e)))?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| Error::config(format!("failed to watch {}: {}", root.display(), e)))?;

    let task = tokio::spawn(async move {
        while let Some(path) = rx.recv().await {
            apply(handler.as_ref(), &path).await;
        }
    });

    Ok(ContentWatcher {
        _watcher: watcher,
        task,
    })
}

/// Apply one filesystem change to the handler
async fn apply(handler: &dyn ContentHandler, path: &Path) {
    if handler.key_for(path).is_none() {
        return;
    }
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => load(handler, path).await,
        Ok(meta) if meta.is_dir() => {
            let loaded = scan(handler, path).await;
            debug!(dir = %path.display(), loaded, "Content directory rescanned");
        }
        Ok(_) => {}
        Err(_) => {
            if let Some(key) = handler.remove(path) {
                debug!(key = %key, "Content entry removed");
            }
        }
    }
}

async fn load(handler: &dyn ContentHandler, path: &Path) {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            if let Some(key) = handler.upsert(path, content) {
                debug!(key = %key, "Content entry updated");
            }
        }
        Err(e) => warn!(path = %path.display(), "Failed to read content file: {}", e),
    }
}

/// Upsert every file below `root`; returns how many were loaded
async fn scan(handler: &dyn ContentHandler, root: &Path) -> usize {
    let mut loaded = 0;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), "Failed to read content directory: {}", e);
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => pending.push(path),
                Ok(ft) if ft.is_file() => {
                    if handler.key_for(&path).is_some() {
                        load(handler, &path).await;
                        loaded += 1;
                    }
                }
                _ => {}
            }
        }
    }
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ContentKind, PromptStore, ResourceStore};
    use std::time::Duration;

    #[tokio::test]
    async fn test_initial_scan_and_updates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("team")).unwrap();
        std::fs::write(dir.path().join("hello.md"), "Hello {{name}}").unwrap();
        std::fs::write(dir.path().join("team/review.md"), "Review {{pr}}").unwrap();
        std::fs::write(dir.path().join(".hidden.md"), "skip").unwrap();

        let store = Arc::new(PromptStore::new(dir.path()));
        let mut changes = store.subscribe();
        let _watcher = watch_content(store.clone()).await.unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.get("team/review").is_some());
        for _ in 0..2 {
            changes.recv().await.unwrap();
        }

        std::fs::write(dir.path().join("new.md"), "New {{x}}").unwrap();
        let change = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let change = changes.recv().await.unwrap();
                if change.key == "new" {
                    return change;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(change.kind, ContentKind::Prompt);

        std::fs::remove_file(dir.path().join("hello.md")).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let change = changes.recv().await.unwrap();
                if change.key == "hello" && change.removed {
                    return;
                }
            }
        })
        .await
        .unwrap();
        assert!(store.get("hello").is_none());
    }

    #[tokio::test]
    async fn test_directory_moved_into_tree_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("prompts");
        std::fs::create_dir(&root).unwrap();

        let store = Arc::new(PromptStore::new(&root));
        let mut changes = store.subscribe();
        let _watcher = watch_content(store.clone()).await.unwrap();
        assert!(store.is_empty());

        let staged = dir.path().join("staged");
        std::fs::create_dir_all(staged.join("deep")).unwrap();
        std::fs::write(staged.join("plan.md"), "Plan {{goal}}").unwrap();
        std::fs::write(staged.join("deep/notes.md"), "Notes").unwrap();
        std::fs::rename(&staged, root.join("pack")).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                changes.recv().await.unwrap();
                if store.get("pack/plan").is_some() && store.get("pack/deep/notes").is_some() {
                    return;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(store.get("pack/plan").unwrap().parameters, vec!["goal".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ResourceStore::new(dir.path().join("absent")));
        assert!(watch_content(store).await.is_err());
    }
}
