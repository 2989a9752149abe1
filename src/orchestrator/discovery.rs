//! Builds the discovery artifact from the request and the working tree.

use chrono::Utc;
use std::collections::BTreeSet;
use std::path::Path;
use walkdir::WalkDir;

use crate::artifacts::{DiscoveryArtifact, Requirement};
use crate::remediation::sweep::{relative, skipped};
use crate::roles::{derive_tags, tokenize};

/// Candidate files listed at most.
pub const MAX_CANDIDATE_FILES: usize = 50;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "onto", "when", "then", "also",
    "add", "make", "should", "must", "will", "can", "our", "your", "all", "any", "new", "use",
];

/// Request words worth matching against roles and file names.
pub fn keywords(request: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    tokenize(request)
        .into_iter()
        .filter(|t| t.len() >= 3 && !STOPWORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Split a request into numbered requirements: one per sentence, bullet or
/// `;`-separated clause. A request with no separators is one requirement.
pub fn requirements(request: &str) -> Vec<Requirement> {
    let clauses: Vec<&str> = request
        .split(['\n', ';', '.'])
        .map(|s| s.trim().trim_start_matches(['-', '*', ' ']).trim())
        .filter(|s| tokenize(s).len() >= 2)
        .collect();
    let clauses = if clauses.is_empty() && !request.trim().is_empty() {
        vec![request.trim()]
    } else {
        clauses
    };
    clauses
        .into_iter()
        .enumerate()
        .map(|(i, text)| Requirement {
            id: format!("R{}", i + 1),
            text: text.to_string(),
        })
        .collect()
}

/// Files under `root` whose path mentions a keyword.
pub fn candidate_files(root: &Path, keywords: &[String]) -> Vec<String> {
    let keys: Vec<&str> = keywords
        .iter()
        .map(String::as_str)
        .filter(|k| k.len() >= 4)
        .collect();
    if keys.is_empty() {
        return Vec::new();
    }
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !skipped(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| relative(root, e.path()))
        .filter(|path| {
            let lower = path.to_lowercase();
            keys.iter().any(|k| lower.contains(k))
        })
        .take(MAX_CANDIDATE_FILES)
        .collect()
}

pub fn discover(request: &str, root: &Path) -> DiscoveryArtifact {
    let keywords = keywords(request);
    let candidate_files = candidate_files(root, &keywords);
    DiscoveryArtifact {
        request: request.to_string(),
        tags: derive_tags(request),
        requirements: requirements(request),
        candidate_files,
        keywords,
        generated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_keywords_drop_stopwords_and_duplicates() {
        assert_eq!(
            keywords("Add a logout button and make the logout secure"),
            vec!["logout", "button", "secure"]
        );
    }

    #[test]
    fn test_requirements_split_on_clauses() {
        let reqs = requirements("Add logout button. Clear the session token; redirect to login");
        let texts: Vec<&str> = reqs.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["Add logout button", "Clear the session token", "redirect to login"]);
        assert_eq!(reqs[2].id, "R3");
    }

    #[test]
    fn test_single_word_request_is_one_requirement() {
        let reqs = requirements("logout");
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].text, "logout");
        assert!(requirements("   ").is_empty());
    }

    #[test]
    fn test_candidate_files_match_keywords() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/auth")).unwrap();
        fs::create_dir_all(dir.path().join("target")).unwrap();
        fs::write(dir.path().join("src/auth/logout.ts"), "").unwrap();
        fs::write(dir.path().join("src/main.ts"), "").unwrap();
        fs::write(dir.path().join("target/logout.o"), "").unwrap();

        let files = candidate_files(dir.path(), &keywords("add logout button"));
        assert_eq!(files, vec!["src/auth/logout.ts"]);
    }
}
