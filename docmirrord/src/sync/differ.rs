use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use super::fingerprint::Fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip,
    Upload,
    Remove,
}

/// What a flush found on disk for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    Content(EncodedContent),
    Missing,
}

/// File content in the form it is uploaded and fingerprinted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedContent {
    pub base64: String,
    pub hash: String,
}

impl EncodedContent {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let base64 = STANDARD.encode(bytes);
        let hash = content_hash(&base64);
        Self { base64, hash }
    }
}

/// Hex MD5 over the base64 form of the content.
pub fn content_hash(base64: &str) -> String {
    format!("{:x}", md5::compute(base64.as_bytes()))
}

/// Decides whether a key needs a new upload.
///
/// `remote_revpos` is the generation at which the remote document last stored
/// the attachment, `None` when the remote does not have it.
pub fn decide(
    observed: &Observed,
    fingerprint: Option<&Fingerprint>,
    remote_revpos: Option<u64>,
) -> Decision {
    let Observed::Content(content) = observed else {
        return Decision::Remove;
    };
    match fingerprint {
        Some(fp) if fp.content_hash == content.hash && remote_revpos == Some(fp.generation) => {
            Decision::Skip
        }
        _ => Decision::Upload,
    }
}
