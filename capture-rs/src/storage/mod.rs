//! Email storage module
//!
//! The storage contract is three narrow capabilities:
//! - [`DataStore`]: maps a recipient address to its [`Mailbox`]
//! - [`Mailbox`]: an ordered collection of sealed messages
//! - [`Message`]: a sealed, immutable message; [`MessageWriter`] is its
//!   writable form before sealing
//!
//! Backends:
//! - [`memory`]: in-process maps, used by tests and `backend = "memory"`
//! - [`file`]: one directory per mailbox, atomic tmp-to-new sealing

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::AsyncRead;

#[async_trait]
pub trait DataStore: Send + Sync {
    /// Mailbox for a normalized recipient address, created on first use
    async fn mailbox_for(&self, address: &str) -> Result<Arc<dyn Mailbox>>;

    async fn all_mailboxes(&self) -> Result<Vec<Arc<dyn Mailbox>>>;
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    fn name(&self) -> &str;

    /// Sealed messages in delivery order
    async fn get_messages(&self) -> Result<Vec<Arc<dyn Message>>>;

    /// Fails with `MailError::NotFound` for an unknown id
    async fn get_message(&self, id: &str) -> Result<Arc<dyn Message>>;

    async fn new_message(&self) -> Result<Box<dyn MessageWriter>>;

    async fn purge(&self) -> Result<()>;
}

#[async_trait]
pub trait Message: Send + Sync {
    fn id(&self) -> &str;
    fn from(&self) -> &str;
    fn subject(&self) -> &str;
    fn date(&self) -> DateTime<Utc>;
    fn size(&self) -> u64;

    async fn read_raw(&self) -> Result<Vec<u8>>;

    async fn raw_reader(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    async fn read_header(&self) -> Result<String> {
        let raw = self.read_raw().await?;
        let (header, _) = split_message(&raw);
        Ok(String::from_utf8_lossy(header).into_owned())
    }

    async fn read_body(&self) -> Result<String> {
        let raw = self.read_raw().await?;
        let (_, body) = split_message(&raw);
        Ok(String::from_utf8_lossy(body).into_owned())
    }

    /// Irreversible; a second delete fails with `MailError::NotFound`
    async fn delete(&self) -> Result<()>;
}

/// A message being written. Nothing is visible to readers until `close`.
#[async_trait]
pub trait MessageWriter: Send {
    async fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Seal the message. Closing again returns the same sealed message.
    async fn close(&mut self) -> Result<Arc<dyn Message>>;

    /// Drop the unsealed content
    async fn discard(&mut self) -> Result<()>;
}

/// Attributes of a sealed message, computed once at seal time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub size: u64,
    /// Per-mailbox seal order
    #[serde(default)]
    pub seq: u64,
}

impl MessageMeta {
    pub fn from_raw(seq: u64, date: DateTime<Utc>, raw: &[u8]) -> Self {
        let parsed = mail_parser::MessageParser::default().parse(raw);

        let from = parsed
            .as_ref()
            .and_then(|m| m.from())
            .and_then(|f| f.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string())
            .or_else(|| return_path(raw))
            .unwrap_or_default();

        let subject = parsed
            .as_ref()
            .and_then(|m| m.subject())
            .unwrap_or("")
            .to_string();

        Self {
            id: message_id(date, seq),
            from,
            subject,
            date,
            size: raw.len() as u64,
            seq,
        }
    }
}

/// `<yyyymmddThhmmss>-<seq>`
pub fn message_id(date: DateTime<Utc>, seq: u64) -> String {
    format!("{}-{:04}", date.format("%Y%m%dT%H%M%S"), seq)
}

/// Split raw bytes at the first blank line into header (with its final line
/// ending) and body.
pub fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    let mut start = 0;
    while let Some(pos) = raw[start..].iter().position(|&b| b == b'\n') {
        let nl = start + pos;
        let rest = &raw[nl + 1..];
        if rest.starts_with(b"\r\n") {
            return (&raw[..=nl], &rest[2..]);
        }
        if rest.starts_with(b"\n") {
            return (&raw[..=nl], &rest[1..]);
        }
        start = nl + 1;
    }
    (raw, &[])
}

fn return_path(raw: &[u8]) -> Option<String> {
    let (header, _) = split_message(raw);
    String::from_utf8_lossy(header)
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("Return-Path")
                .then(|| value.trim().trim_start_matches('<').trim_end_matches('>').to_string())
        })
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_message_crlf() {
        let raw = b"Subject: hi\r\nFrom: a@b.com\r\n\r\nbody\r\n";
        let (header, body) = split_message(raw);
        assert_eq!(header, b"Subject: hi\r\nFrom: a@b.com\r\n");
        assert_eq!(body, b"body\r\n");
    }

    #[test]
    fn test_split_message_without_body() {
        let raw = b"Subject: hi\n";
        let (header, body) = split_message(raw);
        assert_eq!(header, raw);
        assert!(body.is_empty());

        let (header, body) = split_message(b"A: b\n\nrest");
        assert_eq!(header, b"A: b\n");
        assert_eq!(body, b"rest");
    }

    #[test]
    fn test_meta_from_headers() {
        let raw = b"From: Alice <alice@example.com>\r\nSubject: Greetings\r\n\r\nHi\r\n";
        let meta = MessageMeta::from_raw(7, Utc::now(), raw);
        assert_eq!(meta.from, "alice@example.com");
        assert_eq!(meta.subject, "Greetings");
        assert_eq!(meta.size, raw.len() as u64);
        assert!(meta.id.ends_with("-0007"));
    }

    #[test]
    fn test_meta_falls_back_to_return_path() {
        let raw = b"Return-Path: <a@b.com>\r\nReceived: from x\r\n\r\nno headers here\r\n";
        let meta = MessageMeta::from_raw(1, Utc::now(), raw);
        assert_eq!(meta.from, "a@b.com");
        assert_eq!(meta.subject, "");
    }
}
