//! Worker roles and assignment scoring.
//!
//! The set of roles is closed: each [`WorkerRole`] carries a keyword table,
//! focus areas and the coverage areas its report satisfies. Selecting which
//! roles handle a request is a pure scoring function over that table; no
//! free-form text ever names a role at this layer.
//!
//! ## Example
//!
//! ```
//! use conductor::roles::{WorkerRole, select};
//!
//! let assignments = select("add logout button", &[], 5);
//! assert!(assignments.iter().any(|a| a.role == WorkerRole::Security));
//! assert!(assignments.iter().any(|a| a.role == WorkerRole::Testing));
//! assert!(assignments.len() <= 5);
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Weight of a keyword hit in the request text.
const REQUEST_HIT_WEIGHT: u32 = 2;
/// Weight of a discovery tag naming the role directly.
const TAG_HIT_WEIGHT: u32 = 3;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9][a-z0-9_]*").expect("static regex"));

/// A kind of worker the pipeline can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Architect,
    Security,
    Testing,
    Performance,
    Frontend,
    Backend,
    Data,
    Devops,
    Accessibility,
    Documentation,
}

impl WorkerRole {
    pub const ALL: [WorkerRole; 10] = [
        Self::Architect,
        Self::Security,
        Self::Testing,
        Self::Performance,
        Self::Frontend,
        Self::Backend,
        Self::Data,
        Self::Devops,
        Self::Accessibility,
        Self::Documentation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architect => "architect",
            Self::Security => "security",
            Self::Testing => "testing",
            Self::Performance => "performance",
            Self::Frontend => "frontend",
            Self::Backend => "backend",
            Self::Data => "data",
            Self::Devops => "devops",
            Self::Accessibility => "accessibility",
            Self::Documentation => "documentation",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Architect => "Architecture Strategist",
            Self::Security => "Security Sentinel",
            Self::Testing => "Test Engineer",
            Self::Performance => "Performance Oracle",
            Self::Frontend => "Frontend Specialist",
            Self::Backend => "Backend Specialist",
            Self::Data => "Data Steward",
            Self::Devops => "Delivery Engineer",
            Self::Accessibility => "Accessibility Reviewer",
            Self::Documentation => "Documentation Reviewer",
        }
    }

    /// Keywords that pull a request toward this role.
    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            Self::Architect => &[
                "architecture", "design", "refactor", "module", "structure", "migrate",
                "layer", "interface", "dependency",
            ],
            Self::Security => &[
                "auth", "login", "logout", "session", "token", "password", "permission",
                "secret", "oauth", "csrf", "xss", "encrypt", "credential", "role",
            ],
            Self::Testing => &[
                "test", "coverage", "regression", "flaky", "e2e", "qa", "assert", "fixture",
            ],
            Self::Performance => &[
                "slow", "latency", "performance", "cache", "memory", "optimize", "scale",
                "throughput", "profile",
            ],
            Self::Frontend => &[
                "ui", "button", "page", "form", "component", "css", "react", "layout",
                "modal", "frontend", "view", "screen", "menu",
            ],
            Self::Backend => &[
                "endpoint", "api", "server", "handler", "route", "backend", "request",
                "response", "service", "webhook",
            ],
            Self::Data => &[
                "database", "schema", "migration", "sql", "query", "table", "index",
                "data", "model",
            ],
            Self::Devops => &[
                "deploy", "ci", "docker", "pipeline", "build", "release", "infra",
                "kubernetes", "container",
            ],
            Self::Accessibility => &[
                "a11y", "accessibility", "aria", "contrast", "keyboard", "screenreader",
            ],
            Self::Documentation => &["docs", "readme", "documentation", "guide", "changelog"],
        }
    }

    /// Concerns a worker in this role should examine.
    pub fn focus_areas(&self) -> &'static [&'static str] {
        match self {
            Self::Architect => &[
                "Excessive coupling between modules",
                "Layering violations",
                "Inconsistent abstraction levels",
            ],
            Self::Security => &[
                "Authentication bypass risks",
                "Session and token handling",
                "Secrets exposure in code or logs",
                "Input validation gaps",
            ],
            Self::Testing => &[
                "Missing tests for new behavior",
                "Regression risk in touched code",
                "Flaky or order-dependent tests",
            ],
            Self::Performance => &[
                "Algorithmic complexity issues",
                "Blocking operations in async code",
                "Cache misuse or missing caching",
            ],
            Self::Frontend => &[
                "Component state handling",
                "Loading and error states",
                "Consistent styling",
            ],
            Self::Backend => &[
                "Error propagation across handlers",
                "Idempotency of mutating endpoints",
            ],
            Self::Data => &["Migration safety", "Missing indexes", "Schema drift"],
            Self::Devops => &["Build reproducibility", "Rollback path for deploys"],
            Self::Accessibility => &["Keyboard navigation", "Labels and ARIA roles"],
            Self::Documentation => &["User-facing docs updated", "Changelog entry"],
        }
    }

    /// Coverage areas a report from this role satisfies by default.
    pub fn covers(&self) -> &'static [&'static str] {
        match self {
            Self::Security => &["security"],
            Self::Testing => &["testing"],
            _ => &[],
        }
    }

    /// Roles included in every assignment set.
    pub fn is_mandatory(&self) -> bool {
        matches!(self, Self::Security | Self::Testing)
    }

    /// Where a worker in this role writes its report, relative to the
    /// project directory.
    pub fn output_path(&self) -> String {
        format!("artifacts/review/{}.json", self.as_str())
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkerRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        let normalized = lower.trim().replace(['_', ' '], "-");
        let role = match normalized.as_str() {
            "architect" | "architecture" | "architecture-strategist" => Self::Architect,
            "security" | "security-sentinel" => Self::Security,
            "testing" | "test" | "qa" => Self::Testing,
            "performance" | "performance-oracle" => Self::Performance,
            "frontend" | "ui" | "ux" => Self::Frontend,
            "backend" | "api" => Self::Backend,
            "data" | "database" => Self::Data,
            "devops" | "ops" | "infra" => Self::Devops,
            "accessibility" | "a11y" => Self::Accessibility,
            "documentation" | "docs" => Self::Documentation,
            _ => anyhow::bail!("Unknown worker role '{}'", s),
        };
        Ok(role)
    }
}

/// One role's score for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleScore {
    pub role: WorkerRole,
    pub score: u32,
    pub matched: Vec<String>,
}

/// A role assigned to the current project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub role: WorkerRole,
    pub score: u32,
    #[serde(default)]
    pub matched_keywords: Vec<String>,
    /// Report path relative to the project directory.
    pub output: String,
    #[serde(default)]
    pub focus: Vec<String>,
}

impl Assignment {
    fn from_score(score: &RoleScore) -> Self {
        Self {
            role: score.role,
            score: score.score,
            matched_keywords: score.matched.clone(),
            output: score.role.output_path(),
            focus: score
                .role
                .focus_areas()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Lowercased alphanumeric tokens of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    TOKEN_RE
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn keyword_hit(token: &str, keyword: &str) -> bool {
    token == keyword || (keyword.len() >= 4 && token.starts_with(keyword))
}

/// Score every role against a request and discovery tags.
///
/// Returned highest score first; ties keep [`WorkerRole::ALL`] order.
pub fn score_roles(request: &str, tags: &[String]) -> Vec<RoleScore> {
    let tokens = tokenize(request);
    let mut scores: Vec<RoleScore> = WorkerRole::ALL
        .iter()
        .map(|role| {
            let mut matched = BTreeSet::new();
            let mut score = 0;
            for keyword in role.keywords() {
                if tokens.iter().any(|t| keyword_hit(t, keyword)) {
                    matched.insert(keyword.to_string());
                    score += REQUEST_HIT_WEIGHT;
                }
            }
            if tags.iter().any(|t| t.eq_ignore_ascii_case(role.as_str())) {
                score += TAG_HIT_WEIGHT;
            }
            RoleScore {
                role: *role,
                score,
                matched: matched.into_iter().collect(),
            }
        })
        .collect();
    scores.sort_by(|a, b| b.score.cmp(&a.score).then(a.role.cmp(&b.role)));
    scores
}

/// Tags derived from a request: every role with at least one keyword hit.
pub fn derive_tags(request: &str) -> Vec<String> {
    score_roles(request, &[])
        .into_iter()
        .filter(|s| s.score > 0)
        .map(|s| s.role.as_str().to_string())
        .collect()
}

/// Pick at most `max` roles for a request.
///
/// Mandatory roles are always considered first; other roles need a
/// positive score. The result is ordered by score.
pub fn select(request: &str, tags: &[String], max: usize) -> Vec<Assignment> {
    let max = max.max(1);
    let ranked = score_roles(request, tags);

    let mut chosen: Vec<&RoleScore> = ranked.iter().filter(|s| s.role.is_mandatory()).collect();
    for score in ranked.iter().filter(|s| !s.role.is_mandatory() && s.score > 0) {
        chosen.push(score);
    }
    chosen.truncate(max);
    chosen.sort_by(|a, b| b.score.cmp(&a.score).then(a.role.cmp(&b.role)));

    chosen.into_iter().map(Assignment::from_score).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        assert_eq!(
            tokenize("Add Logout-Button, now!"),
            vec!["add", "logout", "button", "now"]
        );
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let a = score_roles("speed up slow database query", &[]);
        let b = score_roles("speed up slow database query", &[]);
        assert_eq!(a, b);
        assert_eq!(a[0].role, WorkerRole::Data);
    }

    #[test]
    fn test_prefix_keyword_match() {
        let scores = score_roles("add tests for the cached pages", &[]);
        let testing = scores.iter().find(|s| s.role == WorkerRole::Testing).unwrap();
        assert!(testing.matched.contains(&"test".to_string()));
        let perf = scores.iter().find(|s| s.role == WorkerRole::Performance).unwrap();
        assert!(perf.matched.contains(&"cache".to_string()));
        let frontend = scores.iter().find(|s| s.role == WorkerRole::Frontend).unwrap();
        assert!(frontend.matched.contains(&"page".to_string()));
    }

    #[test]
    fn test_tags_boost_roles() {
        let plain = score_roles("tidy things", &[]);
        let tagged = score_roles("tidy things", &["devops".to_string()]);
        let before = plain.iter().find(|s| s.role == WorkerRole::Devops).unwrap().score;
        let after = tagged.iter().find(|s| s.role == WorkerRole::Devops).unwrap().score;
        assert_eq!(after, before + TAG_HIT_WEIGHT);
    }

    #[test]
    fn test_select_logout_button() {
        let assignments = select("add logout button", &[], 5);
        let roles: Vec<WorkerRole> = assignments.iter().map(|a| a.role).collect();
        assert!(roles.contains(&WorkerRole::Security));
        assert!(roles.contains(&WorkerRole::Frontend));
        assert!(roles.contains(&WorkerRole::Testing));
        assert!(assignments.len() <= 5);
        for a in &assignments {
            assert_eq!(a.output, format!("artifacts/review/{}.json", a.role));
        }
    }

    #[test]
    fn test_select_respects_max() {
        let request = "refactor the auth api endpoint, database schema, deploy pipeline, ui page and docs";
        for max in 1..=6 {
            let assignments = select(request, &[], max);
            assert!(!assignments.is_empty());
            assert!(assignments.len() <= max);
        }
    }

    #[test]
    fn test_select_always_has_mandatory_roles_when_room() {
        let assignments = select("write a haiku", &[], 3);
        let roles: Vec<WorkerRole> = assignments.iter().map(|a| a.role).collect();
        assert_eq!(roles.len(), 2);
        assert!(roles.contains(&WorkerRole::Security));
        assert!(roles.contains(&WorkerRole::Testing));
    }

    #[test]
    fn test_derive_tags() {
        let tags = derive_tags("add logout button");
        assert!(tags.contains(&"security".to_string()));
        assert!(tags.contains(&"frontend".to_string()));
        assert!(!tags.contains(&"data".to_string()));
    }

    #[test]
    fn test_role_from_str_aliases() {
        assert_eq!("security-sentinel".parse::<WorkerRole>().unwrap(), WorkerRole::Security);
        assert_eq!("A11Y".parse::<WorkerRole>().unwrap(), WorkerRole::Accessibility);
        assert_eq!("ux".parse::<WorkerRole>().unwrap(), WorkerRole::Frontend);
        assert!("wizard".parse::<WorkerRole>().is_err());
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&WorkerRole::Devops).unwrap();
        assert_eq!(json, "\"devops\"");
    }
}
