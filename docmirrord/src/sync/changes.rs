use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Changed,
    Removed,
    /// The backend dropped events; what changed has to be found by walking
    /// the roots again.
    Rescan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub key: String,
    pub kind: ChangeKind,
    pub source: Option<PathBuf>,
}

/// Pending changes between two sync cycles, at most one entry per key.
///
/// Entries keep the position of the first event for their key; later events
/// overwrite kind and source (last write wins). A set can also ask for a
/// full walk of the roots, which supersedes its entries.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    entries: Vec<Change>,
    positions: HashMap<String, usize>,
    rescan: bool,
}

impl ChangeSet {
    pub fn record(&mut self, change: Change) {
        match self.positions.get(&change.key) {
            Some(&idx) => self.entries[idx] = change,
            None => {
                self.positions.insert(change.key.clone(), self.entries.len());
                self.entries.push(change);
            }
        }
    }

    /// Re-queues a batch that failed to sync underneath the changes recorded
    /// since; newer entries win.
    pub fn absorb_older(&mut self, older: ChangeSet) {
        let newer = std::mem::replace(self, older);
        self.rescan |= newer.rescan;
        for change in newer.entries {
            self.record(change);
        }
    }

    pub fn request_rescan(&mut self) {
        self.rescan = true;
    }

    pub fn needs_rescan(&self) -> bool {
        self.rescan
    }

    pub fn get(&self, key: &str) -> Option<&Change> {
        self.positions.get(key).map(|&idx| &self.entries[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && !self.rescan
    }
}

impl FromIterator<Change> for ChangeSet {
    fn from_iter<T: IntoIterator<Item = Change>>(iter: T) -> Self {
        let mut set = ChangeSet::default();
        for change in iter {
            set.record(change);
        }
        set
    }
}
