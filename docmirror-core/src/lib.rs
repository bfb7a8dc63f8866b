mod client;
mod document;
mod loader;
mod mime;
mod store;

pub use client::{CouchClient, document_url, redact_url};
pub use document::{Attachment, Document, revision_generation};
pub use loader::{LoadError, Operator, load_files};
pub use mime::content_type_for;
pub use store::{DocumentStore, MemoryStore, StoreError, StoreErrorClass};
