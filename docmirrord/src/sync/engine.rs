use std::collections::HashSet;

use docmirror_core::{
    Attachment, Document, DocumentStore, StoreError, content_type_for, redact_url,
    revision_generation,
};
use futures_util::future::join_all;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use super::aggregator::{ResolvedChange, observe_file};
use super::backoff::Backoff;
use super::differ::{Decision, Observed, decide};
use super::fingerprint::{Fingerprint, FingerprintDelta, FingerprintStore};
use super::fingerprint_db::{FingerprintDb, FingerprintDbError};
use super::roots::AttachmentRoot;

pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("fetching {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: StoreError,
    },
    #[error("pushing {url} failed: {source}")]
    Push {
        url: String,
        #[source]
        source: StoreError,
    },
    #[error("could not push document {url}\ncode: {status}\n{body}")]
    FatalPush {
        url: String,
        status: u16,
        body: String,
    },
    #[error("revision conflict on {url} persisted after {attempts} attempts")]
    ConflictExhausted { url: String, attempts: u32 },
    #[error("fingerprint store error: {0}")]
    Fingerprints(#[from] FingerprintDbError),
}

impl EngineError {
    /// Whether the same batch can be expected to go through on a later cycle
    /// without anyone intervening.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Fetch { source, .. } | EngineError::Push { source, .. } => {
                source.is_retryable()
            }
            EngineError::ConflictExhausted { .. } => true,
            EngineError::FatalPush { .. } | EngineError::Fingerprints(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing differed from the last confirmed state; no write was made.
    Unchanged,
    Pushed {
        revision: String,
        uploaded: usize,
        removed: usize,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub max_conflict_retries: u32,
    pub conflict_backoff: Backoff,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            conflict_backoff: Backoff::conflicts(),
        }
    }
}

/// Owns the local view of one document and pushes attachment changes to it.
///
/// `document` holds the body to publish and, after every accepted push, the
/// attachment set as stubs. Fingerprints only advance when a push that
/// carries them is accepted.
pub struct SyncEngine<S> {
    store: S,
    url: Url,
    roots: Vec<AttachmentRoot>,
    document: Document,
    fingerprints: FingerprintStore,
    generation: u64,
    db: Option<FingerprintDb>,
    options: EngineOptions,
}

struct Prepared {
    working: Document,
    delta: FingerprintDelta,
    dirty: bool,
    uploaded: usize,
    removed: usize,
}

impl<S: DocumentStore> SyncEngine<S> {
    pub fn new(store: S, url: Url, document: Document, roots: Vec<AttachmentRoot>) -> Self {
        let generation = document.generation();
        Self {
            store,
            url,
            roots,
            document,
            fingerprints: FingerprintStore::new(),
            generation,
            db: None,
            options: EngineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Restores fingerprints and the last revision from `db` and keeps
    /// writing committed cycles to it.
    pub async fn with_fingerprint_db(mut self, db: FingerprintDb) -> Result<Self, EngineError> {
        self.fingerprints = db.load().await?;
        if let Some(revision) = db.load_revision().await? {
            self.generation = revision_generation(&revision).unwrap_or(0);
            self.document.revision = Some(revision);
        }
        info!(
            "restored {} fingerprints for {}",
            self.fingerprints.len(),
            redact_url(&self.url)
        );
        self.db = Some(db);
        Ok(self)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn roots(&self) -> &[AttachmentRoot] {
        &self.roots
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn fingerprints(&self) -> &FingerprintStore {
        &self.fingerprints
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn revision(&self) -> Option<&str> {
        self.document.revision.as_deref()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Uploads every file under the attachment roots that the remote does
    /// not already hold, drops attachments whose files are gone, and always
    /// writes the document. Returns the new revision.
    pub async fn push_once(&mut self) -> Result<String, EngineError> {
        let changes = self.reconcile_changes().await;
        info!(
            "initial push of {} with {} files",
            redact_url(&self.url),
            changes.len()
        );
        match self.run_cycle(changes, true, true).await? {
            CycleOutcome::Pushed { revision, .. } => Ok(revision),
            CycleOutcome::Unchanged => Ok(self.document.revision.clone().unwrap_or_default()),
        }
    }

    /// Runs one cycle for a flushed batch.
    pub async fn sync_changes(
        &mut self,
        changes: Vec<ResolvedChange>,
    ) -> Result<CycleOutcome, EngineError> {
        self.run_cycle(changes, false, false).await
    }

    /// Runs one cycle from a full walk of the roots, for batches where the
    /// watcher could not tell what changed.
    pub async fn sync_rescan(&mut self) -> Result<CycleOutcome, EngineError> {
        let changes = self.reconcile_changes().await;
        info!(
            "rescanned roots of {}: {} entries",
            redact_url(&self.url),
            changes.len()
        );
        self.run_cycle(changes, false, true).await
    }

    async fn run_cycle(
        &mut self,
        mut changes: Vec<ResolvedChange>,
        force: bool,
        mut reconciled: bool,
    ) -> Result<CycleOutcome, EngineError> {
        let url = redact_url(&self.url);
        let mut conflicts = 0u32;
        loop {
            let remote = match self.store.fetch(&self.url).await {
                Ok(doc) => Some(doc),
                Err(StoreError::NotFound) => None,
                Err(source) => return Err(EngineError::Fetch { url, source }),
            };

            let (working, lost) = self.merge_remote(remote.as_ref());
            if !lost.is_empty() && !reconciled {
                warn!(
                    "{} lost {} attachments remotely, rescanning roots",
                    url,
                    lost.len()
                );
                changes = self.reconcile_changes().await;
                reconciled = true;
            }

            let prepared = self.apply_changes(working, remote.as_ref(), &changes);
            if !prepared.dirty && !force {
                if !prepared.delta.is_empty() {
                    self.fingerprints.apply(&prepared.delta);
                    if let Some(revision) = self.document.revision.clone() {
                        self.persist(&prepared.delta, &revision).await;
                    }
                }
                return Ok(CycleOutcome::Unchanged);
            }

            match self.store.put(&self.url, &prepared.working).await {
                Ok(revision) => {
                    info!(
                        "pushed {} rev={} uploaded={} removed={}",
                        url, revision, prepared.uploaded, prepared.removed
                    );
                    let outcome = CycleOutcome::Pushed {
                        revision: revision.clone(),
                        uploaded: prepared.uploaded,
                        removed: prepared.removed,
                    };
                    self.commit(prepared, revision).await;
                    return Ok(outcome);
                }
                Err(StoreError::Conflict { .. }) => {
                    conflicts += 1;
                    if conflicts > self.options.max_conflict_retries {
                        return Err(EngineError::ConflictExhausted {
                            url,
                            attempts: conflicts,
                        });
                    }
                    let delay = self.options.conflict_backoff.delay(conflicts - 1);
                    warn!(
                        "revision conflict on {} (attempt {}), retrying in {:?}",
                        url, conflicts, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => return Err(push_error(url, source)),
            }
        }
    }

    /// Local body and bookkeeping over the fetched document; only the
    /// revision comes from the remote. Returns the keys whose remote content
    /// has disappeared.
    fn merge_remote(&self, remote: Option<&Document>) -> (Document, Vec<String>) {
        let mut working = remote
            .cloned()
            .unwrap_or_else(|| Document::new(self.document.id.clone()));
        working.id = self.document.id.clone();
        for (key, value) in &self.document.body {
            working.body.insert(key.clone(), value.clone());
        }

        let mut lost = Vec::new();
        for (key, attachment) in &self.document.attachments {
            if working.attachments.contains_key(key) {
                continue;
            }
            if attachment.is_inline() {
                working.attachments.insert(key.clone(), attachment.clone());
            } else {
                lost.push(key.clone());
            }
        }
        (working, lost)
    }

    fn apply_changes(
        &self,
        mut working: Document,
        remote: Option<&Document>,
        changes: &[ResolvedChange],
    ) -> Prepared {
        let next_generation = working.generation() + 1;
        let mut delta = FingerprintDelta::default();
        let mut uploaded = 0;
        let mut removed = 0;

        for change in changes {
            let remote_revpos = remote
                .and_then(|doc| doc.attachments.get(&change.key))
                .and_then(|attachment| attachment.revpos);
            let fingerprint = self.fingerprints.get(&change.key);
            match (decide(&change.observed, fingerprint, remote_revpos), &change.observed) {
                (Decision::Skip, _) => {}
                (Decision::Upload, Observed::Content(content)) => {
                    working.attachments.insert(
                        change.key.clone(),
                        Attachment::from_base64(
                            content.base64.clone(),
                            content_type_for(&change.key),
                        ),
                    );
                    delta.upserts.push(Fingerprint {
                        path: change.key.clone(),
                        content_hash: content.hash.clone(),
                        generation: next_generation,
                    });
                    info!("changed {}", change.key);
                    uploaded += 1;
                }
                (Decision::Upload, Observed::Missing) | (Decision::Remove, _) => {
                    for key in self.keys_under(&change.key) {
                        if self.fingerprints.get(&key).is_some() {
                            delta.removals.push(key.clone());
                        }
                        if working.attachments.remove(&key).is_some() {
                            info!("removed {}", key);
                            removed += 1;
                        }
                    }
                }
            }
        }

        Prepared {
            working,
            delta,
            dirty: uploaded > 0 || removed > 0,
            uploaded,
            removed,
        }
    }

    /// `key` itself plus every fingerprinted key beneath it, so a vanished
    /// directory takes the files published from it along.
    fn keys_under(&self, key: &str) -> Vec<String> {
        let nested = format!("{key}/");
        let mut keys: Vec<String> = self
            .fingerprints
            .iter()
            .map(|fp| &fp.path)
            .filter(|candidate| candidate.starts_with(&nested))
            .cloned()
            .collect();
        keys.sort();
        keys.insert(0, key.to_string());
        keys
    }

    async fn commit(&mut self, prepared: Prepared, revision: String) {
        let generation =
            revision_generation(&revision).unwrap_or(prepared.working.generation() + 1);
        self.fingerprints.apply(&prepared.delta);
        self.generation = generation;
        self.document.attachments = prepared
            .working
            .attachments
            .into_iter()
            .map(|(key, attachment)| {
                let stub = if attachment.is_inline() {
                    attachment.into_stub(generation)
                } else {
                    attachment
                };
                (key, stub)
            })
            .collect();
        self.persist(&prepared.delta, &revision).await;
        self.document.revision = Some(revision);
    }

    async fn persist(&self, delta: &FingerprintDelta, revision: &str) {
        if let Some(db) = &self.db
            && let Err(err) = db.commit(delta, revision).await
        {
            warn!("failed to persist fingerprints for rev={revision}: {err}");
        }
    }

    /// Current disk state of every root, plus removals for keys this engine
    /// published earlier whose files are gone.
    async fn reconcile_changes(&self) -> Vec<ResolvedChange> {
        let mut seen = HashSet::new();
        let mut reads = Vec::new();
        for root in &self.roots {
            for (key, path) in root.walk().await {
                if seen.insert(key.clone()) {
                    reads.push(observe_file(key, path));
                }
            }
        }
        let mut changes = join_all(reads).await;

        // Only fingerprinted keys were published from these roots; anything
        // else on the remote belongs to another writer.
        for fingerprint in self.fingerprints.iter() {
            if seen.insert(fingerprint.path.clone()) {
                changes.push(ResolvedChange {
                    key: fingerprint.path.clone(),
                    observed: Observed::Missing,
                });
            }
        }
        changes
    }
}

fn push_error(url: String, source: StoreError) -> EngineError {
    match source {
        StoreError::Rejected { status, body }
            if !status.is_server_error() && status.as_u16() != 408 =>
        {
            EngineError::FatalPush {
                url,
                status: status.as_u16(),
                body,
            }
        }
        source => EngineError::Push { url, source },
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
