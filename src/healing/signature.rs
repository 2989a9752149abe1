//! Failure normalization and pattern signatures.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// Hex characters kept from the SHA-256 digest.
pub const SIGNATURE_LEN: usize = 16;

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").expect("static regex")
});

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:z|[+-]\d{2}:?\d{2})?")
        .expect("static regex")
});

static CLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,2}:\d{2}:\d{2}(?:\.\d+)?\b").expect("static regex"));

static HEX_ADDR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0x[0-9a-f]+").expect("static regex"));

static ABS_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:/[^\s/:'`()]+)+/([^\s/:'`()]+)").expect("static regex"));

static LINE_COL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\d+(?::\d+)?\b").expect("static regex"));

static LINE_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(line|column|col)\s+\d+").expect("static regex"));

static LONG_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4,}").expect("static regex"));

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

/// A failure handed to the healer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Command that produced the failure; re-run to verify a fix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl Failure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn from_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Normalized error text, with the normalized location appended.
    pub fn normalized(&self) -> String {
        match &self.location {
            Some(loc) if !loc.trim().is_empty() => {
                format!("{} @ {}", normalize(&self.error), normalize(loc))
            }
            _ => normalize(&self.error),
        }
    }

    pub fn signature(&self) -> String {
        signature_of(&self.normalized())
    }
}

/// Strip volatile tokens so that recurrences of one failure compare equal.
pub fn normalize(text: &str) -> String {
    let text = text.to_lowercase();
    let text = UUID_RE.replace_all(&text, "<uuid>");
    let text = TIMESTAMP_RE.replace_all(&text, "<ts>");
    let text = CLOCK_RE.replace_all(&text, "<ts>");
    let text = HEX_ADDR_RE.replace_all(&text, "<addr>");
    let text = ABS_PATH_RE.replace_all(&text, "$1");
    let text = LINE_COL_RE.replace_all(&text, "");
    let text = LINE_WORD_RE.replace_all(&text, "$1 <n>");
    let text = LONG_NUMBER_RE.replace_all(&text, "<n>");
    WHITESPACE_RE.replace_all(text.trim(), " ").into_owned()
}

/// First [`SIGNATURE_LEN`] hex characters of SHA-256 over normalized text.
pub fn signature_of(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    let mut sig = hex::encode(digest);
    sig.truncate(SIGNATURE_LEN);
    sig
}
