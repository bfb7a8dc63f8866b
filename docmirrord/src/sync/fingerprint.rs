use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub path: String,
    pub content_hash: String,
    pub generation: u64,
}

/// Fingerprint changes staged during a cycle, committed once the push that
/// carries them has been accepted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FingerprintDelta {
    pub upserts: Vec<Fingerprint>,
    pub removals: Vec<String>,
}

impl FingerprintDelta {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

/// Last confirmed content hash per attachment key.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FingerprintStore {
    records: HashMap<String, Fingerprint>,
}

impl FingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&Fingerprint> {
        self.records.get(path)
    }

    pub fn insert(&mut self, fingerprint: Fingerprint) {
        self.records.insert(fingerprint.path.clone(), fingerprint);
    }

    pub fn remove(&mut self, path: &str) -> Option<Fingerprint> {
        self.records.remove(path)
    }

    pub fn apply(&mut self, delta: &FingerprintDelta) {
        for path in &delta.removals {
            self.records.remove(path);
        }
        for fingerprint in &delta.upserts {
            self.insert(fingerprint.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fingerprint> {
        self.records.values()
    }
}

impl FromIterator<Fingerprint> for FingerprintStore {
    fn from_iter<T: IntoIterator<Item = Fingerprint>>(iter: T) -> Self {
        let mut store = FingerprintStore::new();
        for fingerprint in iter {
            store.insert(fingerprint);
        }
        store
    }
}
