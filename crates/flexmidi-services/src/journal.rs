//! Request/response journal.
//!
//! Every dispatched request and its final reply are recorded once, keyed by
//! `(corr, role)`. The file journal stores one JSON file per record:
//!   {root}/{corr}.{role}.json
//!
//! Correlation ids that are not plain `[A-Za-z0-9_-]` names are hex-encoded
//! so a caller-chosen corr can never escape the journal directory.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use flexmidi_core::envelope::now_millis;
use flexmidi_core::JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalRole {
    Request,
    Response,
}

impl JournalRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalRole::Request => "request",
            JournalRole::Response => "response",
        }
    }
}

/// One journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub corr: String,
    pub role: JournalRole,
    /// Milliseconds since the Unix epoch at write time.
    pub ts: u64,
    pub payload: JsonValue,
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal entry {corr}.{} already written", .role.as_str())]
    AlreadyWritten { corr: String, role: JournalRole },

    #[error("journal io on {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("journal serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only sink. Each `(corr, role)` is written at most once.
#[async_trait]
pub trait Journal: Send + Sync {
    async fn write(&self, corr: &str, role: JournalRole, payload: &JsonValue)
        -> Result<(), JournalError>;

    async fn read(&self, corr: &str, role: JournalRole) -> Result<Option<JournalEntry>, JournalError>;

    /// The last `n` records, oldest first.
    async fn tail(&self, n: usize) -> Result<Vec<JournalEntry>, JournalError>;
}

// ── File journal ──────────────────────────────────────────────────────────────

pub struct FileJournal {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl FileJournal {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| JournalError::Io(root.clone(), e))?;
        Ok(Self {
            root,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, corr: &str, role: JournalRole) -> PathBuf {
        self.root
            .join(format!("{}.{}.json", file_stem(corr), role.as_str()))
    }
}

/// File-name-safe form of a corr.
fn file_stem(corr: &str) -> String {
    let plain = !corr.is_empty()
        && corr.len() <= 128
        && corr
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if plain {
        corr.to_string()
    } else {
        format!("x-{}", hex::encode(corr.as_bytes()))
    }
}

#[async_trait]
impl Journal for FileJournal {
    async fn write(
        &self,
        corr: &str,
        role: JournalRole,
        payload: &JsonValue,
    ) -> Result<(), JournalError> {
        let path = self.entry_path(corr, role);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(JournalError::AlreadyWritten {
                corr: corr.to_string(),
                role,
            });
        }

        let entry = JournalEntry {
            corr: corr.to_string(),
            role,
            ts: now_millis(),
            payload: payload.clone(),
        };
        let data = serde_json::to_vec(&entry)?;

        // Atomic write: tmp file → rename
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_extension(format!("tmp{}-{n}", std::process::id()));
        tokio::fs::write(&tmp_path, &data)
            .await
            .map_err(|e| JournalError::Io(tmp_path.clone(), e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| JournalError::Io(path.clone(), e))?;

        tracing::trace!(corr, role = role.as_str(), "journal entry written");
        Ok(())
    }

    async fn read(&self, corr: &str, role: JournalRole) -> Result<Option<JournalEntry>, JournalError> {
        let path = self.entry_path(corr, role);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(JournalError::Io(path, e)),
        }
    }

    async fn tail(&self, n: usize) -> Result<Vec<JournalEntry>, JournalError> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| JournalError::Io(self.root.clone(), e))?;

        let mut entries = Vec::new();
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| JournalError::Io(self.root.clone(), e))?
        {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = match tokio::fs::read(&path).await {
                Ok(d) => d,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "skipping unreadable journal file");
                    continue;
                }
            };
            match serde_json::from_slice::<JournalEntry>(&data) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::debug!(path = %path.display(), error = %e, "skipping corrupt journal file"),
            }
        }

        // Request before response when written in the same millisecond.
        entries.sort_by(|a, b| {
            (a.ts, a.role == JournalRole::Response).cmp(&(b.ts, b.role == JournalRole::Response))
        });
        let skip = entries.len().saturating_sub(n);
        Ok(entries.split_off(skip))
    }
}

// ── Memory journal ────────────────────────────────────────────────────────────

/// In-process journal used when no directory is configured.
#[derive(Default)]
pub struct MemoryJournal {
    entries: DashMap<(String, JournalRole), (u64, JournalEntry)>,
    seq: AtomicU64,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn write(
        &self,
        corr: &str,
        role: JournalRole,
        payload: &JsonValue,
    ) -> Result<(), JournalError> {
        use dashmap::mapref::entry::Entry;
        match self.entries.entry((corr.to_string(), role)) {
            Entry::Occupied(_) => Err(JournalError::AlreadyWritten {
                corr: corr.to_string(),
                role,
            }),
            Entry::Vacant(slot) => {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                slot.insert((
                    seq,
                    JournalEntry {
                        corr: corr.to_string(),
                        role,
                        ts: now_millis(),
                        payload: payload.clone(),
                    },
                ));
                Ok(())
            }
        }
    }

    async fn read(&self, corr: &str, role: JournalRole) -> Result<Option<JournalEntry>, JournalError> {
        Ok(self
            .entries
            .get(&(corr.to_string(), role))
            .map(|e| e.value().1.clone()))
    }

    async fn tail(&self, n: usize) -> Result<Vec<JournalEntry>, JournalError> {
        let mut all: Vec<(u64, JournalEntry)> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|(seq, _)| *seq);
        let skip = all.len().saturating_sub(n);
        Ok(all.into_iter().skip(skip).map(|(_, e)| e).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(text: &str) -> JsonValue {
        JsonValue::object([("text".to_string(), JsonValue::from(text))])
    }

    #[tokio::test]
    async fn file_journal_write_and_read() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = FileJournal::new(tmp.path()).await.unwrap();

        journal.write("abc", JournalRole::Request, &body("hi")).await.unwrap();
        let entry = journal.read("abc", JournalRole::Request).await.unwrap().unwrap();
        assert_eq!(entry.corr, "abc");
        assert_eq!(entry.payload, body("hi"));
        assert!(tmp.path().join("abc.request.json").exists());
        assert!(journal.read("abc", JournalRole::Response).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_journal_is_write_once() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = FileJournal::new(tmp.path()).await.unwrap();

        journal.write("abc", JournalRole::Response, &body("1")).await.unwrap();
        let err = journal
            .write("abc", JournalRole::Response, &body("2"))
            .await
            .unwrap_err();
        assert!(matches!(err, JournalError::AlreadyWritten { .. }));

        let entry = journal.read("abc", JournalRole::Response).await.unwrap().unwrap();
        assert_eq!(entry.payload, body("1"));
    }

    #[tokio::test]
    async fn unsafe_corr_stays_inside_root() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = FileJournal::new(tmp.path().join("j")).await.unwrap();

        journal
            .write("../../etc/passwd", JournalRole::Request, &JsonValue::Null)
            .await
            .unwrap();
        let names: Vec<String> = std::fs::read_dir(journal.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("x-"));
        assert!(journal
            .read("../../etc/passwd", JournalRole::Request)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn file_journal_tail_orders_by_time() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = FileJournal::new(tmp.path()).await.unwrap();
        for corr in ["a", "b", "c"] {
            journal.write(corr, JournalRole::Request, &JsonValue::Null).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(3)).await;
        }
        let tail = journal.tail(2).await.unwrap();
        let corrs: Vec<&str> = tail.iter().map(|e| e.corr.as_str()).collect();
        assert_eq!(corrs, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn memory_journal_tail_and_write_once() {
        let journal = MemoryJournal::new();
        journal.write("a", JournalRole::Request, &body("q")).await.unwrap();
        journal.write("a", JournalRole::Response, &body("r")).await.unwrap();
        journal.write("b", JournalRole::Request, &body("q2")).await.unwrap();
        assert!(journal.write("a", JournalRole::Request, &body("again")).await.is_err());

        let tail = journal.tail(2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!((tail[0].corr.as_str(), tail[0].role), ("a", JournalRole::Response));
        assert_eq!(tail[1].corr, "b");
        assert_eq!(journal.len(), 3);
    }
}
