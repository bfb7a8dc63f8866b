use std::path::PathBuf;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

use super::changes::ChangeKind;
use super::roots::AttachmentRoot;

/// A filesystem notification mapped onto an attachment key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: ChangeKind,
    pub key: String,
    pub source: PathBuf,
}

/// Watches one attachment root and forwards its events to the aggregator.
pub struct TreeWatcher {
    root: AttachmentRoot,
    watcher: Option<RecommendedWatcher>,
}

impl TreeWatcher {
    pub fn start(
        root: AttachmentRoot,
        events: mpsc::UnboundedSender<RawEvent>,
    ) -> notify::Result<Self> {
        let mapping_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for raw in map_event(&mapping_root, event) {
                    let _ = events.send(raw);
                }
            }
            Err(err) => warn!("watch error under {}: {err}", mapping_root.path().display()),
        })?;
        watcher.watch(root.path(), RecursiveMode::Recursive)?;
        Ok(Self {
            root,
            watcher: Some(watcher),
        })
    }

    pub fn root(&self) -> &AttachmentRoot {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Releases the OS watch handle. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            let _ = watcher.unwatch(self.root.path());
        }
    }
}

impl Drop for TreeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn map_event(root: &AttachmentRoot, event: Event) -> Vec<RawEvent> {
    if event.need_rescan() {
        warn!("events lost under {}, rescanning", root.path().display());
        return vec![RawEvent {
            kind: ChangeKind::Rescan,
            key: String::new(),
            source: root.path().to_path_buf(),
        }];
    }
    let kind = match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::new();
            if let Some(from) = event.paths.first() {
                out.extend(raw(root, ChangeKind::Removed, from.clone()));
            }
            if let Some(to) = event.paths.get(1) {
                out.extend(raw(root, ChangeKind::Created, to.clone()));
            }
            return out;
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::Removed,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeKind::Created,
        // Some backends only say "renamed"; the read at flush time sorts out
        // whether the path still exists.
        EventKind::Modify(ModifyKind::Name(_)) => ChangeKind::Changed,
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(_) => ChangeKind::Changed,
        EventKind::Remove(_) => ChangeKind::Removed,
        _ => return Vec::new(),
    };
    event
        .paths
        .into_iter()
        .filter_map(|path| raw(root, kind, path))
        .collect()
}

fn raw(root: &AttachmentRoot, kind: ChangeKind, source: PathBuf) -> Option<RawEvent> {
    let key = root.key_for(&source)?;
    Some(RawEvent { kind, key, source })
}
