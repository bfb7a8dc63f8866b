use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use docmirror_core::{CouchClient, Document, document_url, load_files, redact_url};
use serde_json::{Map, Value};
use tracing::{info, warn};
use url::Url;

use crate::sync::backoff::Backoff;
use crate::sync::fingerprint_db::{FingerprintDb, default_db_path};
use crate::sync::roots::AttachmentRoot;
use crate::sync::{EngineOptions, SyncEngine, SyncOptions, start_sync};

const DEFAULT_DOC_ID: &str = "_design/app";
const DEFAULT_DEBOUNCE_MS: u64 = 50;
const DEFAULT_CONFLICT_RETRIES: u64 = 5;

/// A local directory and the attachment key prefix it is published under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootConfig {
    pub path: PathBuf,
    pub prefix: String,
}

/// A directory loaded as text into one body field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadConfig {
    pub field: String,
    pub dir: PathBuf,
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub document_url: Url,
    pub doc_id: String,
    pub roots: Vec<RootConfig>,
    pub body_file: Option<PathBuf>,
    pub loads: Vec<LoadConfig>,
    pub debounce: Duration,
    pub conflict_retries: u32,
    pub state_db: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Self::from_lookup(|name| std::env::var(name).ok(), &home)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>, home: &Path) -> anyhow::Result<Self> {
        let base = lookup("DOCMIRROR_URL").context("DOCMIRROR_URL is not set")?;
        let doc_id = lookup("DOCMIRROR_DOC_ID")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DOC_ID.to_string());
        let document_url = document_url(&base, &doc_id)
            .with_context(|| format!("invalid DOCMIRROR_URL for document {doc_id}"))?;

        let roots = lookup("DOCMIRROR_ROOTS")
            .map(|value| parse_roots(&value, home))
            .unwrap_or_default();
        let loads = match lookup("DOCMIRROR_LOAD") {
            Some(value) => parse_loads(&value, home)?,
            None => Vec::new(),
        };
        let body_file = lookup("DOCMIRROR_BODY").map(|value| expand_with_home(&value, home));

        let debounce = Duration::from_millis(read_u64(
            &lookup,
            "DOCMIRROR_DEBOUNCE_MS",
            DEFAULT_DEBOUNCE_MS,
        ));
        let conflict_retries = u32::try_from(read_u64(
            &lookup,
            "DOCMIRROR_CONFLICT_RETRIES",
            DEFAULT_CONFLICT_RETRIES,
        ))
        .context("DOCMIRROR_CONFLICT_RETRIES is out of range")?;

        let state_db = match lookup("DOCMIRROR_STATE_DB") {
            Some(value) => Some(expand_with_home(&value, home)),
            None if read_bool(&lookup, "DOCMIRROR_PERSIST", false) => {
                Some(default_db_path().context("cannot place the fingerprint database")?)
            }
            None => None,
        };

        Ok(Self {
            document_url,
            doc_id,
            roots,
            body_file,
            loads,
            debounce,
            conflict_retries,
            state_db,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: SyncEngine<CouchClient>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let document = build_document(&config).await?;
        let roots = config
            .roots
            .iter()
            .map(|root| {
                AttachmentRoot::new(&root.path, root.prefix.as_str())
                    .with_context(|| format!("invalid attachment root {:?}", root.path))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let options = EngineOptions {
            max_conflict_retries: config.conflict_retries,
            conflict_backoff: Backoff::conflicts(),
        };
        let mut engine = SyncEngine::new(
            CouchClient::new(),
            config.document_url.clone(),
            document,
            roots,
        )
        .with_options(options);

        if let Some(path) = &config.state_db {
            // Keyed by the redacted URL so credentials never reach the database.
            let db = FingerprintDb::open(path, redact_url(&config.document_url))
                .await
                .with_context(|| format!("failed to open fingerprint database at {path:?}"))?;
            engine = engine
                .with_fingerprint_db(db)
                .await
                .context("failed to restore fingerprints")?;
        }

        Ok(Self { config, engine })
    }

    /// Pushes the document once and returns the new revision.
    pub async fn run_once(mut self) -> anyhow::Result<String> {
        let revision = self
            .engine
            .push_once()
            .await
            .context("failed to push document")?;
        info!(
            "pushed {} rev={}",
            redact_url(&self.config.document_url),
            revision
        );
        Ok(revision)
    }

    /// Pushes, then mirrors attachment changes until interrupted.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            "started: document={} roots={} debounce={:?}",
            redact_url(&self.config.document_url),
            self.config.roots.len(),
            self.config.debounce
        );
        let options = SyncOptions {
            quiet_interval: self.config.debounce,
            ..SyncOptions::default()
        };
        let mut handle = start_sync(self.engine, options)
            .await
            .context("failed to start syncing")?;

        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.context("failed waiting for shutdown signal")?;
                    break;
                }
                Some(failure) = handle.next_failure() => {
                    warn!(
                        "sync failed, {} changes waiting for retry: {}",
                        failure.pending, failure.error
                    );
                }
            }
        }

        info!("shutting down");
        handle.cancel();
        handle.join().await.context("sync task panicked")?;
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
