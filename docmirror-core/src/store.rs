use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

use crate::document::{Attachment, Document};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found")]
    NotFound,
    #[error("revision conflict: {body}")]
    Conflict { body: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("store returned {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("invalid document payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorClass {
    NotFound,
    Conflict,
    Transient,
    Fatal,
}

impl StoreError {
    pub fn classification(&self) -> StoreErrorClass {
        match self {
            StoreError::NotFound => StoreErrorClass::NotFound,
            StoreError::Conflict { .. } => StoreErrorClass::Conflict,
            StoreError::Transport(_) => StoreErrorClass::Transient,
            StoreError::Rejected { status, .. }
                if status.is_server_error() || *status == StatusCode::REQUEST_TIMEOUT =>
            {
                StoreErrorClass::Transient
            }
            StoreError::Rejected { .. } | StoreError::Decode(_) | StoreError::Url(_) => {
                StoreErrorClass::Fatal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            StoreErrorClass::Conflict | StoreErrorClass::Transient
        )
    }
}

/// Full-document access to a revisioned store.
///
/// `put` sends the whole document, tagged with `document.revision`; the store
/// answers with the new revision or `StoreError::Conflict` when the tag is
/// stale.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Document, StoreError>;

    async fn put(&self, url: &Url, document: &Document) -> Result<String, StoreError>;
}

/// In-memory store with CouchDB revision semantics.
///
/// Every accepted put bumps the generation, stamps inline attachments with the
/// new `revpos` and keeps stubbed attachments as they were. A stub naming an
/// attachment the store does not hold is rejected with 412.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    documents: HashMap<String, Document>,
    puts: usize,
    fetches: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of accepted or rejected puts seen so far.
    pub fn put_count(&self) -> usize {
        self.lock().puts
    }

    pub fn fetch_count(&self) -> usize {
        self.lock().fetches
    }

    /// Stored document with inline attachment data, as a fetch with
    /// `attachments=true` would return it.
    pub fn stored(&self, url: &Url) -> Option<Document> {
        self.lock().documents.get(url.as_str()).cloned()
    }

    /// Writes a document directly, simulating another writer.
    pub fn bump_external(&self, url: &Url) -> Option<String> {
        let mut inner = self.lock();
        let doc = inner.documents.get_mut(url.as_str())?;
        let revision = next_revision(doc.generation(), "external");
        doc.revision = Some(revision.clone());
        Some(revision)
    }

    pub fn remove(&self, url: &Url) -> Option<Document> {
        self.lock().documents.remove(url.as_str())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn fetch(&self, url: &Url) -> Result<Document, StoreError> {
        let mut inner = self.lock();
        inner.fetches += 1;
        let doc = inner
            .documents
            .get(url.as_str())
            .ok_or(StoreError::NotFound)?;
        let mut fetched = doc.clone();
        for attachment in fetched.attachments.values_mut() {
            attachment.data = None;
            attachment.stub = true;
        }
        Ok(fetched)
    }

    async fn put(&self, url: &Url, document: &Document) -> Result<String, StoreError> {
        let mut inner = self.lock();
        inner.puts += 1;
        let current = inner.documents.get(url.as_str());
        if current.and_then(|doc| doc.revision.as_deref()) != document.revision.as_deref() {
            return Err(StoreError::Conflict {
                body: r#"{"error":"conflict","reason":"Document update conflict."}"#.into(),
            });
        }

        let generation = document.generation() + 1;
        let mut attachments = std::collections::BTreeMap::new();
        for (name, attachment) in &document.attachments {
            let stored = if let Some(data) = &attachment.data {
                Attachment {
                    content_type: attachment.content_type.clone(),
                    data: Some(data.clone()),
                    revpos: Some(generation),
                    digest: Some(format!("md5-{:x}", md5::compute(data.as_bytes()))),
                    length: attachment.decoded().and_then(Result::ok).map(|b| b.len() as u64),
                    stub: false,
                }
            } else {
                current
                    .and_then(|doc| doc.attachments.get(name))
                    .cloned()
                    .ok_or_else(|| StoreError::Rejected {
                        status: StatusCode::PRECONDITION_FAILED,
                        body: format!(r#"{{"error":"missing_stub","reason":"{name}"}}"#),
                    })?
            };
            attachments.insert(name.clone(), stored);
        }

        let revision = next_revision(document.generation(), &document.id);
        let mut stored = document.clone();
        stored.revision = Some(revision.clone());
        stored.attachments = attachments;
        inner.documents.insert(url.to_string(), stored);
        Ok(revision)
    }
}

fn next_revision(generation: u64, salt: &str) -> String {
    let digest = md5::compute(format!("{generation}:{salt}").as_bytes());
    format!("{}-{:x}", generation + 1, digest)
}
