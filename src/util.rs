//! Shared filesystem and parsing helpers.
//!
//! Every durable document is written through [`write_atomic`]: the bytes go
//! to a temp file in the destination directory, are fsynced, then renamed
//! over the target. A crash leaves either the old file or the new one, plus
//! at worst a stray `.tmp*` file that readers ignore.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Prefix used for in-flight temp files. Directory scans skip anything
/// starting with it.
pub const TEMP_PREFIX: &str = ".tmp";

/// Write `content` to `path` atomically (temp file, fsync, rename).
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)
        .context("Failed to create temp file")?;
    temp.write_all(content)
        .context("Failed to write to temp file")?;
    temp.as_file()
        .sync_all()
        .context("Failed to sync temp file")?;
    temp.persist(path)
        .with_context(|| format!("Failed to persist {}", path.display()))?;

    // Make the rename itself durable.
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).context("Failed to serialize document")?;
    write_atomic(path, &json)
}

/// Read and parse a JSON document. `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Append one line to an append-only log, syncing before returning.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut entry = line.trim_end_matches('\n').to_string();
    entry.push('\n');
    file.write_all(entry.as_bytes())
        .with_context(|| format!("Failed to append to {}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("Failed to sync {}", path.display()))?;
    Ok(())
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object, so a worker that
/// wraps its report in prose or a fenced block still parses.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Parse a document that should be JSON, falling back to the outermost
/// object embedded in surrounding text.
pub fn parse_lenient<T: DeserializeOwned>(text: &str) -> Result<T> {
    match serde_json::from_str(text) {
        Ok(value) => Ok(value),
        Err(strict) => {
            let Some(object) = extract_json_object(text) else {
                return Err(strict).context("No JSON object found");
            };
            serde_json::from_str(&object).context("Embedded JSON object is invalid")
        }
    }
}
