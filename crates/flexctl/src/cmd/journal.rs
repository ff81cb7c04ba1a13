//! Journal commands: read the bridge's journal directory directly.

use std::path::Path;

use anyhow::{Context, Result};

use flexmidi_core::envelope::now_millis;
use flexmidi_core::CommandEnvelope;
use flexmidi_services::journal::JournalEntry;
use flexmidi_services::{FileJournal, Journal, JournalRole};

pub async fn tail(dir: &Path, n: usize) -> Result<()> {
    let journal = open(dir).await?;
    let entries = journal.tail(n).await.context("failed to read journal")?;
    if entries.is_empty() {
        println!("Journal at {} is empty.", dir.display());
        return Ok(());
    }
    for entry in &entries {
        println!("{}", format_entry(entry));
    }
    Ok(())
}

/// The journaled request for `corr`, restamped so the bridge's replay
/// cache accepts it as new.
pub async fn replay_envelope(dir: &Path, corr: &str) -> Result<CommandEnvelope> {
    let journal = open(dir).await?;
    let entry = journal
        .read(corr, JournalRole::Request)
        .await
        .context("failed to read journal")?
        .with_context(|| format!("no request journaled for {corr}"))?;
    restamp(&entry, now_millis())
}

fn restamp(entry: &JournalEntry, ts: u64) -> Result<CommandEnvelope> {
    let mut env: CommandEnvelope = entry
        .payload
        .deserialize_into()
        .with_context(|| format!("journaled request {} is not an envelope", entry.corr))?;
    env.ts = ts;
    Ok(env)
}

async fn open(dir: &Path) -> Result<FileJournal> {
    FileJournal::new(dir)
        .await
        .with_context(|| format!("failed to open journal at {}", dir.display()))
}

pub fn format_entry(entry: &JournalEntry) -> String {
    let payload = serde_json::to_string(&entry.payload).unwrap_or_else(|_| "<unprintable>".into());
    format!("{:>13}  {:<8}  {}  {}", entry.ts, entry.role.as_str(), entry.corr, payload)
}
