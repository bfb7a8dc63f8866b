use std::path::PathBuf;
use std::time::Duration;

use docmirror_core::{DocumentStore, redact_url};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::aggregator::{ChangeAggregator, DEFAULT_QUIET_INTERVAL, resolve};
use super::backoff::Backoff;
use super::engine::{CycleOutcome, EngineError, SyncEngine};
use super::tree_watcher::{RawEvent, TreeWatcher};

/// Failures held for a caller that is not reading them; older ones are kept
/// and newer ones dropped once it fills.
pub const FAILURE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// How long a batch must stay quiet before it is flushed.
    pub quiet_interval: Duration,
    /// Delay schedule for batches whose cycle failed.
    pub retry_backoff: Backoff,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            quiet_interval: DEFAULT_QUIET_INTERVAL,
            retry_backoff: Backoff::failed_batches(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("initial push failed: {0}")]
    InitialPush(#[from] EngineError),
}

/// A cycle that did not land. Its batch stays queued for a later retry.
#[derive(Debug)]
pub struct CycleFailure {
    pub error: EngineError,
    pub pending: usize,
}

/// Handle to a running sync loop.
pub struct SyncHandle<S> {
    cancel: CancellationToken,
    task: JoinHandle<SyncEngine<S>>,
    failures: mpsc::Receiver<CycleFailure>,
    initial_revision: String,
}

impl<S> SyncHandle<S> {
    /// Revision produced by the initial push.
    pub fn initial_revision(&self) -> &str {
        &self.initial_revision
    }

    /// Stops watching and declines further cycles; a cycle already running
    /// completes first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next reported failure. At most [`FAILURE_CHANNEL_CAPACITY`] are kept
    /// while nobody asks; the loop itself never waits on this.
    pub async fn next_failure(&mut self) -> Option<CycleFailure> {
        self.failures.recv().await
    }

    /// Waits for the loop to exit and hands the engine back.
    pub async fn join(self) -> Result<SyncEngine<S>, JoinError> {
        self.task.await
    }
}

/// Starts watching every root of `engine`, performs the initial push and
/// hands the engine to a background loop. Events that arrive during the
/// initial push are buffered and synced once the loop runs.
pub async fn start_sync<S>(
    mut engine: SyncEngine<S>,
    options: SyncOptions,
) -> Result<SyncHandle<S>, StartError>
where
    S: DocumentStore + 'static,
{
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut watchers = Vec::with_capacity(engine.roots().len());
    for root in engine.roots() {
        let watcher =
            TreeWatcher::start(root.clone(), events_tx.clone()).map_err(|source| {
                StartError::Watch {
                    path: root.path().to_path_buf(),
                    source,
                }
            })?;
        info!(
            "watching {} prefix={:?}",
            root.path().display(),
            root.prefix()
        );
        watchers.push(watcher);
    }
    drop(events_tx);

    let initial_revision = engine.push_once().await?;
    info!(
        "initial push of {} done rev={}",
        redact_url(engine.url()),
        initial_revision
    );

    let cancel = CancellationToken::new();
    let (failures_tx, failures) = mpsc::channel(FAILURE_CHANNEL_CAPACITY);
    let task = tokio::spawn(run_loop(
        engine,
        watchers,
        events_rx,
        options,
        cancel.clone(),
        failures_tx,
    ));
    Ok(SyncHandle {
        cancel,
        task,
        failures,
        initial_revision,
    })
}

async fn run_loop<S: DocumentStore>(
    mut engine: SyncEngine<S>,
    mut watchers: Vec<TreeWatcher>,
    mut events: mpsc::UnboundedReceiver<RawEvent>,
    options: SyncOptions,
    cancel: CancellationToken,
    failures: mpsc::Sender<CycleFailure>,
) -> SyncEngine<S> {
    let mut aggregator = ChangeAggregator::new(options.quiet_interval, options.retry_backoff);
    let mut events_open = true;

    loop {
        let deadline = aggregator.deadline();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv(), if events_open => match event {
                Some(event) => aggregator.record(event, Instant::now()),
                None => {
                    debug!("all watchers closed their event channels");
                    events_open = false;
                }
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let batch = aggregator.begin_flush();
                let result = if batch.needs_rescan() {
                    engine.sync_rescan().await
                } else {
                    engine.sync_changes(resolve(&batch).await).await
                };
                let failed = match result {
                    Ok(CycleOutcome::Unchanged) => {
                        debug!("batch of {} changes needed no write", batch.len());
                        None
                    }
                    Ok(CycleOutcome::Pushed { .. }) => None,
                    Err(error) => {
                        warn!("sync cycle failed, {} changes kept: {error}", batch.len());
                        let failure = CycleFailure {
                            pending: batch.len(),
                            error,
                        };
                        if let Err(TrySendError::Full(dropped)) = failures.try_send(failure) {
                            debug!("failure queue full, dropping report: {}", dropped.error);
                        }
                        Some(batch)
                    }
                };
                aggregator.finish_flush(failed, Instant::now());
            }
        }
    }

    for watcher in &mut watchers {
        watcher.stop();
    }
    info!("sync loop for {} stopped", redact_url(engine.url()));
    engine
}
