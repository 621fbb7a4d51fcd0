//! In-memory storage backend
//!
//! Each mailbox keeps its sealed messages in a `Vec` behind a `tokio` lock;
//! sealing appends under the write lock, so ids and order follow seal order.

use crate::error::{MailError, Result};
use crate::storage::{DataStore, Mailbox, Message, MessageMeta, MessageWriter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Weak};
use tokio::io::AsyncRead;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
pub struct MemoryStore {
    mailboxes: RwLock<HashMap<String, Arc<MemoryMailbox>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn mailbox_for(&self, address: &str) -> Result<Arc<dyn Mailbox>> {
        {
            let mailboxes = self.mailboxes.read().await;
            if let Some(mailbox) = mailboxes.get(address) {
                return Ok(mailbox.clone() as Arc<dyn Mailbox>);
            }
        }

        let mut mailboxes = self.mailboxes.write().await;
        let mailbox = mailboxes
            .entry(address.to_string())
            .or_insert_with(|| {
                debug!("Creating in-memory mailbox {}", address);
                Arc::new(MemoryMailbox::new(address))
            })
            .clone();
        Ok(mailbox as Arc<dyn Mailbox>)
    }

    async fn all_mailboxes(&self) -> Result<Vec<Arc<dyn Mailbox>>> {
        let mailboxes = self.mailboxes.read().await;
        let mut all: Vec<Arc<MemoryMailbox>> = mailboxes.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all.into_iter().map(|m| m as Arc<dyn Mailbox>).collect())
    }
}

#[derive(Default)]
struct MailboxState {
    messages: Vec<Arc<MemoryMessage>>,
    last_seq: u64,
}

pub struct MemoryMailbox {
    name: String,
    state: Arc<RwLock<MailboxState>>,
}

impl MemoryMailbox {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(RwLock::new(MailboxState::default())),
        }
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_messages(&self) -> Result<Vec<Arc<dyn Message>>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .iter()
            .map(|m| m.clone() as Arc<dyn Message>)
            .collect())
    }

    async fn get_message(&self, id: &str) -> Result<Arc<dyn Message>> {
        let state = self.state.read().await;
        state
            .messages
            .iter()
            .find(|m| m.meta.id == id)
            .map(|m| m.clone() as Arc<dyn Message>)
            .ok_or_else(|| MailError::NotFound(format!("message {} in {}", id, self.name)))
    }

    async fn new_message(&self) -> Result<Box<dyn MessageWriter>> {
        Ok(Box::new(MemoryWriter {
            mailbox: self.name.clone(),
            state: self.state.clone(),
            buf: Vec::new(),
            sealed: None,
            discarded: false,
        }))
    }

    async fn purge(&self) -> Result<()> {
        let mut state = self.state.write().await;
        debug!("Purging {} messages from {}", state.messages.len(), self.name);
        state.messages.clear();
        Ok(())
    }
}

pub struct MemoryMessage {
    meta: MessageMeta,
    mailbox: String,
    raw: Arc<Vec<u8>>,
    state: Weak<RwLock<MailboxState>>,
}

#[async_trait]
impl Message for MemoryMessage {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn from(&self) -> &str {
        &self.meta.from
    }

    fn subject(&self) -> &str {
        &self.meta.subject
    }

    fn date(&self) -> DateTime<Utc> {
        self.meta.date
    }

    fn size(&self) -> u64 {
        self.meta.size
    }

    async fn read_raw(&self) -> Result<Vec<u8>> {
        Ok(self.raw.as_ref().clone())
    }

    async fn raw_reader(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        Ok(Box::new(Cursor::new(self.raw.as_ref().clone())))
    }

    async fn delete(&self) -> Result<()> {
        let not_found = || MailError::NotFound(format!("message {} in {}", self.meta.id, self.mailbox));
        let state = self.state.upgrade().ok_or_else(not_found)?;
        let mut state = state.write().await;
        let pos = state
            .messages
            .iter()
            .position(|m| m.meta.id == self.meta.id)
            .ok_or_else(not_found)?;
        state.messages.remove(pos);
        Ok(())
    }
}

pub struct MemoryWriter {
    mailbox: String,
    state: Arc<RwLock<MailboxState>>,
    buf: Vec<u8>,
    sealed: Option<Arc<dyn Message>>,
    discarded: bool,
}

impl MemoryWriter {
    fn ensure_open(&self) -> Result<()> {
        if self.sealed.is_some() || self.discarded {
            return Err(MailError::Storage(format!(
                "message for {} is no longer writable",
                self.mailbox
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageWriter for MemoryWriter {
    async fn append(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn close(&mut self) -> Result<Arc<dyn Message>> {
        if let Some(sealed) = &self.sealed {
            return Ok(sealed.clone());
        }
        self.ensure_open()?;

        let raw = std::mem::take(&mut self.buf);
        let mut state = self.state.write().await;
        state.last_seq += 1;
        let meta = MessageMeta::from_raw(state.last_seq, Utc::now(), &raw);
        let message = Arc::new(MemoryMessage {
            meta,
            mailbox: self.mailbox.clone(),
            raw: Arc::new(raw),
            state: Arc::downgrade(&self.state),
        });
        state.messages.push(message.clone());
        drop(state);

        debug!("Sealed message {} in {}", message.meta.id, self.mailbox);
        let sealed: Arc<dyn Message> = message;
        self.sealed = Some(sealed.clone());
        Ok(sealed)
    }

    async fn discard(&mut self) -> Result<()> {
        if self.sealed.is_some() {
            return Err(MailError::Storage("cannot discard a sealed message".to_string()));
        }
        self.buf.clear();
        self.discarded = true;
        Ok(())
    }
}
