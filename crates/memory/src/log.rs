//! JSONL document logs backing the vector collections.
//!
//! Append-only upsert/delete events; replay is latest-wins by document id,
//! which is what makes repeated upserts of the same `(id, text)` idempotent.
//! Compaction rewrites the file through an atomic temp-file rename.
//!
//! Writes fsync, so `append`/`compact` hop through `spawn_blocking` —
//! callers hold the memory lock while writing and must never stall the
//! runtime doing it. `load` stays synchronous: it runs once at startup.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{MemoryError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LogEvent<T> {
    Upsert { id: String, doc: T },
    Delete { id: String },
}

#[derive(Debug, Clone)]
pub struct DocumentLog {
    path: PathBuf,
}

impl DocumentLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append<T: Serialize>(&self, event: &LogEvent<T>) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_line(&path, &line))
            .await
            .map_err(join_error)?
    }

    /// Rewrite the log as one upsert per live document. Written to a temp
    /// sibling and renamed, so a crash mid-compaction never loses the
    /// original.
    pub async fn compact<T: Serialize>(&self, docs: &BTreeMap<String, T>) -> Result<()> {
        let mut lines = Vec::with_capacity(docs.len());
        for (id, doc) in docs {
            let event = LogEvent::Upsert {
                id: id.clone(),
                doc,
            };
            lines.push(serde_json::to_string(&event)?);
        }
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_lines_atomic(&path, &lines))
            .await
            .map_err(join_error)?
    }

    /// Replay the log into a latest-wins document map. Corrupt lines are
    /// skipped with a warning; the rest of the log still loads.
    pub fn load<T: DeserializeOwned>(&self) -> Result<BTreeMap<String, T>> {
        let mut docs = BTreeMap::new();
        if !self.path.exists() {
            return Ok(docs);
        }

        let reader = BufReader::new(fs::File::open(&self.path)?);
        for (line_idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEvent<T>>(&line) {
                Ok(LogEvent::Upsert { id, doc }) => {
                    docs.insert(id, doc);
                }
                Ok(LogEvent::Delete { id }) => {
                    docs.remove(&id);
                }
                Err(err) => {
                    warn!(
                        line = line_idx + 1,
                        path = %self.path.display(),
                        error = %err,
                        "corrupt log line skipped"
                    );
                }
            }
        }
        Ok(docs)
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    file.sync_all()?;
    Ok(())
}

fn write_lines_atomic(path: &Path, lines: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("jsonl.tmp");
    {
        let mut file = fs::File::create(&tmp_path)?;
        for line in lines {
            writeln!(file, "{line}")?;
        }
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn join_error(err: tokio::task::JoinError) -> MemoryError {
    MemoryError::Io(std::io::Error::other(err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        text: String,
    }

    #[tokio::test]
    async fn replay_is_latest_wins() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = DocumentLog::new(dir.path().join("docs.jsonl"));

        log.append(&LogEvent::Upsert {
            id: "a".to_string(),
            doc: Doc { text: "one".to_string() },
        })
        .await?;
        log.append(&LogEvent::Upsert {
            id: "a".to_string(),
            doc: Doc { text: "two".to_string() },
        })
        .await?;

        let docs: BTreeMap<String, Doc> = log.load()?;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs["a"].text, "two");
        Ok(())
    }

    #[tokio::test]
    async fn delete_events_remove_documents() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = DocumentLog::new(dir.path().join("docs.jsonl"));

        log.append(&LogEvent::Upsert {
            id: "a".to_string(),
            doc: Doc { text: "x".to_string() },
        })
        .await?;
        log.append(&LogEvent::<Doc>::Delete { id: "a".to_string() }).await?;

        let docs: BTreeMap<String, Doc> = log.load()?;
        assert!(docs.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_lines_do_not_poison_the_log() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("docs.jsonl");
        let log = DocumentLog::new(&path);
        log.append(&LogEvent::Upsert {
            id: "good".to_string(),
            doc: Doc { text: "kept".to_string() },
        })
        .await?;
        fs::OpenOptions::new()
            .append(true)
            .open(&path)?
            .write_all(b"{not json}\n")?;
        log.append(&LogEvent::Upsert {
            id: "later".to_string(),
            doc: Doc { text: "also kept".to_string() },
        })
        .await?;

        let docs: BTreeMap<String, Doc> = log.load()?;
        assert_eq!(docs.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn compaction_preserves_live_documents() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = DocumentLog::new(dir.path().join("docs.jsonl"));
        for n in 0..10 {
            log.append(&LogEvent::Upsert {
                id: "hot".to_string(),
                doc: Doc { text: format!("rev {n}") },
            })
            .await?;
        }

        let docs: BTreeMap<String, Doc> = log.load()?;
        log.compact(&docs).await?;

        let reloaded: BTreeMap<String, Doc> = log.load()?;
        assert_eq!(reloaded, docs);
        // Compacted file holds exactly one line now.
        let lines = fs::read_to_string(log.path())?.lines().count();
        assert_eq!(lines, 1);
        Ok(())
    }

    #[test]
    fn missing_file_loads_empty() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let log = DocumentLog::new(dir.path().join("absent.jsonl"));
        let docs: BTreeMap<String, Doc> = log.load()?;
        assert!(docs.is_empty());
        Ok(())
    }
}
