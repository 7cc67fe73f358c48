//! File system watcher feeding the HMR loop.

use lode_core::dev::{FileChangeEvent, FileChangeKind};
use notify::event::{EventKind, ModifyKind};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path};
use tokio::sync::mpsc;
use tracing::warn;

/// Directories whose contents never trigger HMR.
const IGNORED_DIRS: &[&str] = &["node_modules", ".git", "target", "dist"];

/// Whether changes to `path` are ignored: dependency and VCS directories,
/// and hidden files.
pub fn should_ignore(path: &Path) -> bool {
    let in_ignored_dir = path.components().any(|component| match component {
        Component::Normal(name) => IGNORED_DIRS.iter().any(|dir| name == *dir),
        _ => false,
    });
    if in_ignored_dir {
        return true;
    }
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'))
}

/// Change events for the paths of one notify event.
pub fn change_events(event: &Event) -> Vec<FileChangeEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => FileChangeKind::Add,
        EventKind::Remove(_) => FileChangeKind::Unlink,
        // Metadata-only changes (touch, chmod) do not alter module source.
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => FileChangeKind::Change,
        _ => return Vec::new(),
    };
    event
        .paths
        .iter()
        .filter(|path| !should_ignore(path))
        .map(|path| FileChangeEvent::new(kind, path.clone()))
        .collect()
}

/// Watch `root` recursively, sending change events on `tx`.
///
/// The watcher stops when the returned handle is dropped.
pub fn watch(root: &Path, tx: mpsc::UnboundedSender<FileChangeEvent>) -> notify::Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in change_events(&event) {
                    // The receiver is gone once the server shuts down.
                    let _ = tx.send(change);
                }
            }
            Err(e) => warn!(error = %e, "watch error"),
        },
        Config::default(),
    )?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}
