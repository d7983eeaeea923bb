//! Push-notification webhook handling.
//!
//! A delivery is accepted only when it is a `push` event for a repository
//! of the configured organization. The book id is the last path segment of
//! the clone URL, minus `.git`.
//!
//! When a shared secret is configured, the `X-Hub-Signature-256` header
//! (`sha256=<hex hmac of body>`) must verify before anything else is read.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::book::is_valid_book_id;

type HmacSha256 = Hmac<Sha256>;

pub const PUSH_EVENT: &str = "push";
pub const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushPayload {
    #[serde(default)]
    pub repository: Option<RepositoryInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepositoryInfo {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub clone_url: Option<String>,
}

/// What to do with a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Acknowledge without building.
    Ignore(String),
    /// The book id could not be derived from the clone URL.
    Reject(String),
    Build { repository: String, book_id: String },
}

/// Derive the book id from `https://host/org/<book>.git`.
pub fn book_id_from_clone_url(clone_url: &str) -> Option<String> {
    let segment = clone_url.trim().trim_end_matches('/').rsplit('/').next()?;
    let id = segment.strip_suffix(".git").unwrap_or(segment);
    is_valid_book_id(id).then(|| id.to_string())
}

/// Decide whether a delivery should start a build.
pub fn evaluate(organization: &str, event: Option<&str>, payload: &PushPayload) -> Decision {
    if event != Some(PUSH_EVENT) {
        return Decision::Ignore("Event ignored".to_string());
    }

    let repo = payload.repository.clone().unwrap_or_default();
    let full_name = repo.full_name.unwrap_or_default();
    if !full_name.starts_with(&format!("{}/", organization)) {
        return Decision::Ignore(format!(
            "Repository {} is not part of {}",
            if full_name.is_empty() { "<unknown>" } else { full_name.as_str() },
            organization
        ));
    }

    match repo.clone_url.as_deref().and_then(book_id_from_clone_url) {
        Some(book_id) => Decision::Build {
            repository: full_name,
            book_id,
        },
        None => Decision::Reject("Could not determine book id from clone_url".to_string()),
    }
}

/// Check `sha256=<hex>` against the HMAC-SHA256 of `body` under `secret`.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(signature) = header.and_then(|h| h.trim().strip_prefix(SIGNATURE_PREFIX)) else {
        return false;
    };
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// `sha256=<hex>` signature header value for `body`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}
