use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single document in a revisioned store, in its CouchDB wire shape.
///
/// Application fields live in `body` and are flattened next to the
/// underscore-prefixed store fields when serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(rename = "_attachments", default)]
    pub attachments: BTreeMap<String, Attachment>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: None,
            attachments: BTreeMap::new(),
            body: Map::new(),
        }
    }

    pub fn with_body(mut self, body: Map<String, Value>) -> Self {
        self.body = body;
        self
    }

    /// Generation prefix of the current revision, 0 when the document has
    /// never been stored.
    pub fn generation(&self) -> u64 {
        self.revision
            .as_deref()
            .and_then(revision_generation)
            .unwrap_or(0)
    }
}

/// An attachment entry: either inline base64 content being uploaded, or a
/// stub pointing at content the store already holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revpos: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stub: bool,
}

impl Attachment {
    pub fn inline(bytes: &[u8], content_type: impl Into<String>) -> Self {
        Self::from_base64(STANDARD.encode(bytes), content_type)
    }

    pub fn from_base64(data: String, content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            data: Some(data),
            revpos: None,
            digest: None,
            length: None,
            stub: false,
        }
    }

    pub fn stub(content_type: impl Into<String>, revpos: u64) -> Self {
        Self {
            content_type: content_type.into(),
            data: None,
            revpos: Some(revpos),
            digest: None,
            length: None,
            stub: true,
        }
    }

    pub fn is_inline(&self) -> bool {
        self.data.is_some()
    }

    /// Decodes inline content; `None` for stubs.
    pub fn decoded(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        self.data.as_deref().map(|data| STANDARD.decode(data))
    }

    /// Turns an uploaded entry into the stub the store will report once the
    /// push at `revpos` has been accepted.
    pub fn into_stub(self, revpos: u64) -> Self {
        let length = self
            .decoded()
            .and_then(Result::ok)
            .map(|bytes| bytes.len() as u64)
            .or(self.length);
        Self {
            content_type: self.content_type,
            data: None,
            revpos: Some(revpos),
            digest: self.digest,
            length,
            stub: true,
        }
    }
}

/// Parses the `<generation>-<opaque>` prefix of a revision token.
pub fn revision_generation(revision: &str) -> Option<u64> {
    let (generation, _) = revision.split_once('-')?;
    generation.parse().ok()
}
