use std::path::PathBuf;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::Instant;
use tracing::debug;

use super::backoff::Backoff;
use super::changes::{Change, ChangeKind, ChangeSet};
use super::differ::{EncodedContent, Observed};
use super::roots::{attachment_key, relative_path, walk_files};
use super::tree_watcher::RawEvent;

pub const DEFAULT_QUIET_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Idle,
    Accumulating { deadline: Instant },
    Flushing,
}

/// A change after its file has been read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChange {
    pub key: String,
    pub observed: Observed,
}

/// Debounces raw events from every watched root into one pending
/// [`ChangeSet`] and decides when it is due for a sync cycle.
#[derive(Debug)]
pub struct ChangeAggregator {
    state: AggregatorState,
    pending: ChangeSet,
    quiet: Duration,
    retry: Backoff,
    failed_flushes: u32,
    retry_not_before: Option<Instant>,
}

impl ChangeAggregator {
    pub fn new(quiet: Duration, retry: Backoff) -> Self {
        Self {
            state: AggregatorState::Idle,
            pending: ChangeSet::default(),
            quiet,
            retry,
            failed_flushes: 0,
            retry_not_before: None,
        }
    }

    pub fn state(&self) -> AggregatorState {
        self.state
    }

    pub fn pending(&self) -> &ChangeSet {
        &self.pending
    }

    /// When the pending batch is due, if one is scheduled.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            AggregatorState::Accumulating { deadline } => Some(deadline),
            _ => None,
        }
    }

    pub fn record(&mut self, event: RawEvent, now: Instant) {
        debug!("event {:?} key={}", event.kind, event.key);
        if event.kind == ChangeKind::Rescan {
            self.pending.request_rescan();
        } else {
            self.pending.record(Change {
                source: (event.kind != ChangeKind::Removed).then_some(event.source),
                key: event.key,
                kind: event.kind,
            });
        }
        // While flushing, the new entry waits for the next batch; the timer
        // is armed when the flush completes.
        if self.state != AggregatorState::Flushing {
            self.state = AggregatorState::Accumulating {
                deadline: self.next_deadline(now),
            };
        }
    }

    pub fn begin_flush(&mut self) -> ChangeSet {
        self.state = AggregatorState::Flushing;
        std::mem::take(&mut self.pending)
    }

    /// Ends a flush. A batch that did not sync is handed back and retried
    /// after a growing delay, underneath anything recorded meanwhile.
    pub fn finish_flush(&mut self, failed: Option<ChangeSet>, now: Instant) {
        match failed {
            None => {
                self.failed_flushes = 0;
                self.retry_not_before = None;
            }
            Some(batch) => {
                self.pending.absorb_older(batch);
                self.retry_not_before = Some(now + self.retry.delay(self.failed_flushes));
                self.failed_flushes = self.failed_flushes.saturating_add(1);
            }
        }
        self.state = if self.pending.is_empty() {
            AggregatorState::Idle
        } else {
            AggregatorState::Accumulating {
                deadline: self.next_deadline(now),
            }
        };
    }

    fn next_deadline(&self, now: Instant) -> Instant {
        let quiet = now + self.quiet;
        match self.retry_not_before {
            Some(retry_at) if retry_at > quiet => retry_at,
            _ => quiet,
        }
    }
}

/// Reads every created/changed entry of `batch` concurrently. Entries whose
/// file is gone or unreadable resolve as missing; directories expand into
/// their files.
pub async fn resolve(batch: &ChangeSet) -> Vec<ResolvedChange> {
    join_all(batch.iter().map(resolve_change))
        .await
        .into_iter()
        .flatten()
        .collect()
}

async fn resolve_change(change: &Change) -> Vec<ResolvedChange> {
    let missing = || {
        vec![ResolvedChange {
            key: change.key.clone(),
            observed: Observed::Missing,
        }]
    };
    let Some(source) = change.source.as_ref().filter(|_| change.kind != ChangeKind::Removed)
    else {
        return missing();
    };
    let Ok(meta) = tokio::fs::metadata(source).await else {
        return missing();
    };
    if !meta.is_dir() {
        return vec![observe_file(change.key.clone(), source.clone()).await];
    }

    let files = walk_files(source).await;
    join_all(files.into_iter().filter_map(|file| {
        let relative = relative_path(source, &file)?;
        Some(observe_file(attachment_key(&change.key, &relative), file))
    }))
    .await
}

/// Reads one file into its upload form.
pub async fn observe_file(key: String, path: PathBuf) -> ResolvedChange {
    let observed = match tokio::fs::read(&path).await {
        Ok(bytes) => Observed::Content(EncodedContent::from_bytes(&bytes)),
        Err(err) => {
            debug!("treating {} as removed: {err}", path.display());
            Observed::Missing
        }
    };
    ResolvedChange { key, observed }
}
