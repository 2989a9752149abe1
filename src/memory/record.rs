//! Memory record types and search-term derivation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::roles::tokenize;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "was", "were", "are", "not", "but",
    "has", "have", "had", "into", "its", "you", "your", "all", "any", "can", "could", "should",
    "would", "when", "then", "than", "there", "their", "been", "will", "also",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Failure,
    Success,
    Note,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Failure => "failure",
            Self::Success => "success",
            Self::Note => "note",
        }
    }
}

impl fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MemoryCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "failure" | "fail" => Ok(Self::Failure),
            "success" | "fix" => Ok(Self::Success),
            "note" => Ok(Self::Note),
            _ => anyhow::bail!(
                "Invalid memory category '{}'. Valid values: failure, success, note",
                s
            ),
        }
    }
}

/// A stored entry. Never updated or deleted once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: i64,
    pub description: String,
    pub domain: String,
    pub category: MemoryCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    /// Failure signature this record is about, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// The strategy or fix that worked, for `success` records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
    /// Record this one corrects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<i64>,
    pub terms: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Input to `MemoryStore::store`.
#[derive(Debug, Clone, Default)]
pub struct NewMemoryRecord {
    pub description: String,
    pub domain: String,
    pub category: Option<MemoryCategory>,
    pub source_ref: Option<String>,
    pub signature: Option<String>,
    pub fix: Option<String>,
    pub supersedes: Option<i64>,
}

impl NewMemoryRecord {
    pub fn new(category: MemoryCategory, domain: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            domain: domain.into(),
            category: Some(category),
            ..Default::default()
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_ref = Some(source.into());
        self
    }

    pub fn superseding(mut self, id: i64) -> Self {
        self.supersedes = Some(id);
        self
    }
}

/// A query hit with its relevance (higher is better).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryMatch {
    pub record: MemoryRecord,
    pub score: f64,
}

/// Answer to "has this been seen before?".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckSummary {
    pub seen_before: bool,
    pub failures: usize,
    pub successes: usize,
    pub notes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best: Option<MemoryMatch>,
    pub summary: String,
}

/// A fix recalled for the healer.
#[derive(Debug, Clone, PartialEq)]
pub struct RecalledFix {
    pub record: MemoryRecord,
    pub fix: String,
    /// Exact signature match rather than fuzzy text overlap.
    pub exact: bool,
}

/// Search terms for a text: lowercase tokens of three or more characters,
/// stopwords and pure numbers removed, deduplicated and sorted.
pub fn derive_terms(text: &str) -> Vec<String> {
    let set: BTreeSet<String> = tokenize(text)
        .into_iter()
        .filter(|t| t.len() >= 3)
        .filter(|t| !t.bytes().all(|b| b.is_ascii_digit()))
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect();
    set.into_iter().collect()
}

/// Jaccard overlap of two term lists, in `[0, 1]`.
pub fn term_overlap(a: &[String], b: &[String]) -> f64 {
    let a: BTreeSet<&String> = a.iter().collect();
    let b: BTreeSet<&String> = b.iter().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_terms() {
        let terms = derive_terms("The module `auth` was not found in 42 places; auth module");
        assert_eq!(terms, vec!["auth", "found", "module", "places"]);
    }

    #[test]
    fn test_term_overlap() {
        let a = derive_terms("cannot find module auth");
        let b = derive_terms("cannot find module session");
        let overlap = term_overlap(&a, &b);
        assert!(overlap > 0.5 && overlap < 1.0, "{overlap}");
        assert_eq!(term_overlap(&a, &a), 1.0);
        assert_eq!(term_overlap(&[], &[]), 0.0);
    }

    #[test]
    fn test_category_parse() {
        assert_eq!("SUCCESS".parse::<MemoryCategory>().unwrap(), MemoryCategory::Success);
        assert!("maybe".parse::<MemoryCategory>().is_err());
    }
}
