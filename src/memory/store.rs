use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::record::*;

/// Minimum term overlap for a fuzzy fix recall.
pub const FUZZY_OVERLAP_THRESHOLD: f64 = 0.6;

/// Bounded wait when another invocation holds the database.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = "r.id, r.description, r.domain, r.category, r.source_ref, \
     r.signature, r.fix, r.supersedes, r.terms, r.created_at";

pub struct MemoryStore {
    conn: Connection,
}

struct RawRecord {
    id: i64,
    description: String,
    domain: String,
    category: String,
    source_ref: Option<String>,
    signature: Option<String>,
    fix: Option<String>,
    supersedes: Option<i64>,
    terms: String,
    created_at: String,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            description: row.get(1)?,
            domain: row.get(2)?,
            category: row.get(3)?,
            source_ref: row.get(4)?,
            signature: row.get(5)?,
            fix: row.get(6)?,
            supersedes: row.get(7)?,
            terms: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<MemoryRecord> {
        Ok(MemoryRecord {
            id: self.id,
            description: self.description,
            domain: self.domain,
            category: self.category.parse()?,
            source_ref: self.source_ref,
            signature: self.signature,
            fix: self.fix,
            supersedes: self.supersedes,
            terms: self.terms.split_whitespace().map(String::from).collect(),
            created_at: DateTime::parse_from_rfc3339(&self.created_at)
                .with_context(|| format!("Bad timestamp on memory record {}", self.id))?
                .with_timezone(&Utc),
        })
    }
}

impl MemoryStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open memory database {}", path.display()))?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS memory_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                description TEXT NOT NULL,
                domain TEXT NOT NULL,
                category TEXT NOT NULL CHECK (category IN ('failure', 'success', 'note')),
                source_ref TEXT,
                signature TEXT,
                fix TEXT,
                supersedes INTEGER REFERENCES memory_records(id),
                terms TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_memory_signature ON memory_records(signature);
            CREATE INDEX IF NOT EXISTS idx_memory_domain ON memory_records(domain);
            CREATE INDEX IF NOT EXISTS idx_memory_supersedes ON memory_records(supersedes);

            CREATE VIRTUAL TABLE IF NOT EXISTS memory_fts USING fts5(
                description, domain, terms,
                content='memory_records', content_rowid='id'
            );

            CREATE TRIGGER IF NOT EXISTS memory_records_index AFTER INSERT ON memory_records
            BEGIN
                INSERT INTO memory_fts(rowid, description, domain, terms)
                VALUES (new.id, new.description, new.domain, new.terms);
            END;

            CREATE TRIGGER IF NOT EXISTS memory_records_no_update BEFORE UPDATE ON memory_records
            BEGIN
                SELECT RAISE(ABORT, 'memory records are append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS memory_records_no_delete BEFORE DELETE ON memory_records
            BEGIN
                SELECT RAISE(ABORT, 'memory records are append-only');
            END;
            ",
        )?;
        Ok(())
    }

    /// Append a record and index it.
    pub fn store(&self, new: NewMemoryRecord) -> Result<MemoryRecord> {
        let Some(category) = new.category else {
            bail!("memory record needs a category");
        };
        if new.description.trim().is_empty() {
            bail!("memory record needs a description");
        }
        if let Some(old) = new.supersedes
            && self.get(old)?.is_none()
        {
            bail!("cannot supersede unknown memory record {}", old);
        }

        let mut terms = derive_terms(&new.description);
        if let Some(fix) = &new.fix {
            for term in derive_terms(fix) {
                if !terms.contains(&term) {
                    terms.push(term);
                }
            }
        }
        let domain = if new.domain.trim().is_empty() {
            "general".to_string()
        } else {
            new.domain.trim().to_lowercase()
        };

        self.conn
            .execute(
                "INSERT INTO memory_records
                   (description, domain, category, source_ref, signature, fix, supersedes, terms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    new.description,
                    domain,
                    category.as_str(),
                    new.source_ref,
                    new.signature,
                    new.fix,
                    new.supersedes,
                    terms.join(" "),
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to insert memory record")?;
        let id = self.conn.last_insert_rowid();
        tracing::debug!(id, category = %category, "Stored memory record");
        self.get(id)?
            .context("Memory record not found after insert")
    }

    pub fn get(&self, id: i64) -> Result<Option<MemoryRecord>> {
        let sql = format!("SELECT {} FROM memory_records r WHERE r.id = ?1", SELECT_COLUMNS);
        let raw = self
            .conn
            .query_row(&sql, params![id], RawRecord::from_row)
            .optional()
            .context("Failed to query memory record")?;
        raw.map(RawRecord::into_record).transpose()
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM memory_records", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Ranked full-text matches for `text`, optionally limited to a domain.
    /// Superseded records are hidden.
    pub fn query(&self, text: &str, domain: Option<&str>, limit: usize) -> Result<Vec<MemoryMatch>> {
        let terms = derive_terms(text);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let fts_query = terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR ");
        let domain = domain.map(|d| d.trim().to_lowercase());

        let sql = format!(
            "SELECT {}, bm25(memory_fts) AS rank
             FROM memory_fts JOIN memory_records r ON r.id = memory_fts.rowid
             WHERE memory_fts MATCH ?1
               AND (?2 IS NULL OR r.domain = ?2)
               AND NOT EXISTS (SELECT 1 FROM memory_records s WHERE s.supersedes = r.id)
             ORDER BY rank, r.id DESC
             LIMIT ?3",
            SELECT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare memory query")?;
        let rows = stmt
            .query_map(params![fts_query, domain, limit as i64], |row| {
                Ok((RawRecord::from_row(row)?, row.get::<_, f64>(10)?))
            })
            .context("Failed to run memory query")?;

        let mut matches = Vec::new();
        for row in rows {
            let (raw, rank) = row.context("Failed to read memory row")?;
            matches.push(MemoryMatch {
                record: raw.into_record()?,
                score: -rank,
            });
        }
        Ok(matches)
    }

    /// Has anything like `text` been recorded before?
    pub fn check(&self, text: &str) -> Result<CheckSummary> {
        let matches = self.query(text, None, 20)?;
        let count = |c: MemoryCategory| matches.iter().filter(|m| m.record.category == c).count();
        let failures = count(MemoryCategory::Failure);
        let successes = count(MemoryCategory::Success);
        let notes = count(MemoryCategory::Note);
        let best = matches.first().cloned();

        let summary = match &best {
            None => "no matching records".to_string(),
            Some(m) => format!(
                "{} related record(s): {} failure, {} success, {} note; best match #{} [{}] {}",
                matches.len(),
                failures,
                successes,
                notes,
                m.record.id,
                m.record.category,
                m.record.description
            ),
        };

        Ok(CheckSummary {
            seen_before: best.is_some(),
            failures,
            successes,
            notes,
            best,
            summary,
        })
    }

    /// A known fix for a failure: exact signature match first, then a fuzzy
    /// text match whose term overlap clears [`FUZZY_OVERLAP_THRESHOLD`].
    pub fn find_fix(&self, signature: &str, text: &str) -> Result<Option<RecalledFix>> {
        let sql = format!(
            "SELECT {} FROM memory_records r
             WHERE r.signature = ?1 AND r.category = 'success' AND r.fix IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM memory_records s WHERE s.supersedes = r.id)
             ORDER BY r.id DESC LIMIT 1",
            SELECT_COLUMNS
        );
        let exact = self
            .conn
            .query_row(&sql, params![signature], RawRecord::from_row)
            .optional()
            .context("Failed to look up fix by signature")?;
        if let Some(raw) = exact {
            let record = raw.into_record()?;
            if let Some(fix) = record.fix.clone() {
                return Ok(Some(RecalledFix {
                    record,
                    fix,
                    exact: true,
                }));
            }
        }

        let wanted = derive_terms(text);
        let candidates = self.query(text, None, 20)?;
        let best = candidates
            .into_iter()
            .filter(|m| m.record.category == MemoryCategory::Success && m.record.fix.is_some())
            .map(|m| {
                let overlap = term_overlap(&wanted, &derive_terms(&m.record.description));
                (m, overlap)
            })
            .filter(|(_, overlap)| *overlap >= FUZZY_OVERLAP_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1).then(a.0.record.id.cmp(&b.0.record.id)));

        Ok(best.and_then(|(m, _)| {
            m.record.fix.clone().map(|fix| RecalledFix {
                record: m.record,
                fix,
                exact: false,
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn success(desc: &str, sig: &str, fix: &str) -> NewMemoryRecord {
        NewMemoryRecord::new(MemoryCategory::Success, "build", desc)
            .with_signature(sig)
            .with_fix(fix)
    }

    #[test]
    fn test_migrations_create_tables() -> Result<()> {
        let store = MemoryStore::open_in_memory()?;
        let count: i32 = store.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name IN ('memory_records', 'memory_fts')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 2);
        Ok(())
    }

    #[test]
    fn test_store_and_get() -> Result<()> {
        let store = MemoryStore::open_in_memory()?;
        let rec = store.store(
            NewMemoryRecord::new(MemoryCategory::Note, "Security", "Session tokens live in cookies")
                .with_source("T001"),
        )?;
        assert_eq!(rec.domain, "security");
        assert_eq!(rec.source_ref.as_deref(), Some("T001"));
        assert!(rec.terms.contains(&"cookies".to_string()));
        assert_eq!(store.get(rec.id)?, Some(rec));
        assert_eq!(store.get(999)?, None);
        Ok(())
    }

    #[test]
    fn test_store_rejects_bad_input() -> Result<()> {
        let store = MemoryStore::open_in_memory()?;
        assert!(store.store(NewMemoryRecord::default()).is_err());
        assert!(store.store(NewMemoryRecord::new(MemoryCategory::Note, "x", "  ")).is_err());
        assert!(
            store
                .store(NewMemoryRecord::new(MemoryCategory::Note, "x", "fine").superseding(42))
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn test_updates_and_deletes_are_rejected() -> Result<()> {
        let store = MemoryStore::open_in_memory()?;
        let rec = store.store(NewMemoryRecord::new(MemoryCategory::Note, "x", "immutable entry"))?;
        let update = store.conn.execute(
            "UPDATE memory_records SET description = 'changed' WHERE id = ?1",
            params![rec.id],
        );
        assert!(update.unwrap_err().to_string().contains("append-only"));
        let delete = store
            .conn
            .execute("DELETE FROM memory_records WHERE id = ?1", params![rec.id]);
        assert!(delete.is_err());
        assert_eq!(store.count()?, 1);
        Ok(())
    }

    #[test]
    fn test_query_ranks_and_filters_domain() -> Result<()> {
        let store = MemoryStore::open_in_memory()?;
        store.store(NewMemoryRecord::new(MemoryCategory::Failure, "build", "linker error missing symbol openssl"))?;
        store.store(NewMemoryRecord::new(MemoryCategory::Note, "build", "openssl is vendored"))?;
        store.store(NewMemoryRecord::new(MemoryCategory::Note, "frontend", "button styling uses tokens"))?;

        let hits = store.query("openssl linker symbol", None, 10)?;
        assert_eq!(hits.len(), 2);
        assert!(hits[0].record.description.contains("linker"));
        assert!(hits[0].score >= hits[1].score);

        assert!(store.query("openssl", Some("frontend"), 10)?.is_empty());
        assert_eq!(store.query("button", Some("FRONTEND"), 10)?.len(), 1);
        assert!(store.query("", None, 10)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_superseded_records_are_hidden() -> Result<()> {
        let store = MemoryStore::open_in_memory()?;
        let old = store.store(NewMemoryRecord::new(MemoryCategory::Note, "ops", "deploy window is friday"))?;
        let new = store.store(
            NewMemoryRecord::new(MemoryCategory::Note, "ops", "deploy window is thursday").superseding(old.id),
        )?;
        let hits = store.query("deploy window", None, 10)?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, new.id);
        assert!(store.get(old.id)?.is_some());
        Ok(())
    }

    #[test]
    fn test_check_summary() -> Result<()> {
        let store = MemoryStore::open_in_memory()?;
        let empty = store.check("anything at all")?;
        assert!(!empty.seen_before);

        store.store(NewMemoryRecord::new(MemoryCategory::Failure, "build", "flaky integration timeout"))?;
        store.store(success("integration timeout in ci", "abc", "raise timeout"))?;
        let summary = store.check("integration timeout")?;
        assert!(summary.seen_before);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.successes, 1);
        assert!(summary.summary.contains("2 related record(s)"));
        Ok(())
    }

    #[test]
    fn test_find_fix_exact_signature() -> Result<()> {
        let store = MemoryStore::open_in_memory()?;
        store.store(success("unused import warning", "sig-1", "tier:imports"))?;
        let fix = store.find_fix("sig-1", "totally different text")?.unwrap();
        assert!(fix.exact);
        assert_eq!(fix.fix, "tier:imports");
        Ok(())
    }

    #[test]
    fn test_find_fix_fuzzy_requires_overlap() -> Result<()> {
        let store = MemoryStore::open_in_memory()?;
        store.store(success("cannot find module auth session", "sig-a", "tier:imports"))?;

        let close = store.find_fix("sig-b", "cannot find module auth handler")?;
        let close = close.expect("overlap 4/6 should recall");
        assert!(!close.exact);

        let far = store.find_fix("sig-c", "module missing")?;
        assert!(far.is_none());
        Ok(())
    }

    #[test]
    fn test_failure_records_never_recalled_as_fixes() -> Result<()> {
        let store = MemoryStore::open_in_memory()?;
        store.store(
            NewMemoryRecord::new(MemoryCategory::Failure, "build", "cannot find module auth")
                .with_signature("sig-1"),
        )?;
        assert!(store.find_fix("sig-1", "cannot find module auth")?.is_none());
        Ok(())
    }

    #[test]
    fn test_persists_across_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested/memory.db");
        {
            let store = MemoryStore::open(&path)?;
            store.store(NewMemoryRecord::new(MemoryCategory::Note, "x", "durable note"))?;
        }
        let store = MemoryStore::open(&path)?;
        assert_eq!(store.count()?, 1);
        assert_eq!(store.query("durable", None, 5)?.len(), 1);
        Ok(())
    }
}
