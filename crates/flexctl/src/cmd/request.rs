//! Building requests and presenting their replies.

use anyhow::{bail, Context, Result};

use flexmidi_core::{CommandEnvelope, JsonValue, Reply};

/// Replies collected for one request, final reply last.
#[derive(Debug)]
pub struct Outcome {
    pub corr: String,
    pub replies: Vec<Reply>,
}

impl Outcome {
    pub fn final_reply(&self) -> Option<&Reply> {
        self.replies.last().filter(|r| is_final(r))
    }
}

pub fn build(intent: &str, body: &str, corr: Option<String>) -> Result<CommandEnvelope> {
    if intent.trim().is_empty() {
        bail!("intent must not be empty");
    }
    let body = parse_body(body)?;
    let corr = corr.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    Ok(CommandEnvelope::new(corr, intent, body))
}

/// Request bodies are JSON objects.
pub fn parse_body(text: &str) -> Result<JsonValue> {
    let body: JsonValue = serde_json::from_str(text).context("body is not valid JSON")?;
    if !matches!(body, JsonValue::Object(_)) {
        bail!("body must be a JSON object");
    }
    Ok(body)
}

/// An ack without an outcome is followed by more replies.
pub fn is_final(reply: &Reply) -> bool {
    reply.success.is_some() || !reply.ack
}

pub fn describe(reply: &Reply) -> String {
    if let Some(error) = &reply.error {
        return format!("failed: {error}");
    }
    match (reply.success, reply.progress) {
        (Some(true), _) => "success".to_string(),
        (Some(false), _) => "unsuccessful".to_string(),
        (None, Some(p)) => format!("progress {:.0}%", p * 100.0),
        (None, None) => "ack".to_string(),
    }
}

pub fn report(outcome: Outcome) -> Result<()> {
    for reply in &outcome.replies {
        println!("{}  {}", outcome.corr, describe(reply));
    }
    match outcome.final_reply() {
        Some(r) if r.success == Some(true) => Ok(()),
        Some(r) => bail!("{} {}", outcome.corr, describe(r)),
        None => bail!("{} got no final reply", outcome.corr),
    }
}
