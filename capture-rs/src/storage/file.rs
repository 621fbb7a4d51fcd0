//! Directory-backed storage
//!
//! Layout under the root, one directory per mailbox named by the SHA-256 of
//! the mailbox name:
//!
//! ```text
//! <root>/<sha256>/name        mailbox address
//! <root>/<sha256>/tmp/        messages being written
//! <root>/<sha256>/new/<id>.eml  sealed raw message
//! <root>/<sha256>/new/<id>.json sealed message metadata
//! ```
//!
//! Sealing renames the raw file from `tmp/` into `new/` and then writes the
//! metadata; only messages with metadata are enumerated.

use crate::error::{MailError, Result};
use crate::storage::{DataStore, Mailbox, Message, MessageMeta, MessageWriter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

const NAME_FILE: &str = "name";

pub struct FileStore {
    root: PathBuf,
    mailboxes: Mutex<HashMap<String, Arc<FileMailbox>>>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|e| {
            MailError::Storage(format!("Failed to create directory {:?}: {}", root, e))
        })?;
        info!("File store opened at {}", root.display());
        Ok(Self {
            root,
            mailboxes: Mutex::new(HashMap::new()),
        })
    }

    /// Remove unsealed leftovers from every mailbox's `tmp/`.
    ///
    /// Only the process that owns the writers may call this, at startup and
    /// before it accepts mail. Other processes sharing the root must not.
    pub async fn recover(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let tmp = entry.path().join("tmp");
            if !fs::try_exists(&tmp).await? {
                continue;
            }
            let mut stale = fs::read_dir(&tmp).await?;
            while let Some(leftover) = stale.next_entry().await? {
                debug!("Removing unsealed leftover {}", leftover.path().display());
                fs::remove_file(leftover.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} unsealed message(s) from {}", removed, self.root.display());
        }
        Ok(removed)
    }

    async fn open_mailbox(&self, name: &str) -> Result<Arc<FileMailbox>> {
        let mut mailboxes = self.mailboxes.lock().await;
        if let Some(mailbox) = mailboxes.get(name) {
            return Ok(mailbox.clone());
        }

        let dir = self.root.join(hash_name(name));
        let mailbox = Arc::new(FileMailbox::open(name, dir).await?);
        mailboxes.insert(name.to_string(), mailbox.clone());
        Ok(mailbox)
    }
}

#[async_trait]
impl DataStore for FileStore {
    async fn mailbox_for(&self, address: &str) -> Result<Arc<dyn Mailbox>> {
        Ok(self.open_mailbox(address).await? as Arc<dyn Mailbox>)
    }

    async fn all_mailboxes(&self) -> Result<Vec<Arc<dyn Mailbox>>> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match fs::read_to_string(entry.path().join(NAME_FILE)).await {
                Ok(name) => names.push(name.trim().to_string()),
                Err(e) => warn!("Skipping {}: {}", entry.path().display(), e),
            }
        }
        names.sort();

        let mut mailboxes = Vec::with_capacity(names.len());
        for name in names {
            mailboxes.push(self.open_mailbox(&name).await? as Arc<dyn Mailbox>);
        }
        Ok(mailboxes)
    }
}

pub struct FileMailbox {
    name: String,
    dir: PathBuf,
    /// Guards `new/`; holds the last sequence number handed out
    lock: Arc<RwLock<u64>>,
}

impl FileMailbox {
    async fn open(name: &str, dir: PathBuf) -> Result<Self> {
        for subdir in ["tmp", "new"] {
            let path = dir.join(subdir);
            fs::create_dir_all(&path).await.map_err(|e| {
                MailError::Storage(format!("Failed to create directory {:?}: {}", path, e))
            })?;
        }

        let name_path = dir.join(NAME_FILE);
        if !fs::try_exists(&name_path).await? {
            fs::write(&name_path, name).await?;
        }

        Ok(Self {
            name: name.to_string(),
            dir,
            lock: Arc::new(RwLock::new(0)),
        })
    }

    async fn load_messages(&self) -> Result<Vec<Arc<FileMessage>>> {
        let new_dir = self.dir.join("new");
        let mut messages = Vec::new();
        let mut entries = fs::read_dir(&new_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read(&path).await?;
            match serde_json::from_slice::<MessageMeta>(&content) {
                Ok(meta) => messages.push(Arc::new(FileMessage {
                    meta,
                    mailbox: self.name.clone(),
                    dir: new_dir.clone(),
                    lock: self.lock.clone(),
                })),
                Err(e) => warn!("Skipping corrupt metadata {}: {}", path.display(), e),
            }
        }

        messages.sort_by(|a, b| (a.meta.date, a.meta.seq).cmp(&(b.meta.date, b.meta.seq)));
        Ok(messages)
    }
}

#[async_trait]
impl Mailbox for FileMailbox {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_messages(&self) -> Result<Vec<Arc<dyn Message>>> {
        let _guard = self.lock.read().await;
        Ok(self
            .load_messages()
            .await?
            .into_iter()
            .map(|m| m as Arc<dyn Message>)
            .collect())
    }

    async fn get_message(&self, id: &str) -> Result<Arc<dyn Message>> {
        let _guard = self.lock.read().await;
        let path = self.dir.join("new").join(format!("{}.json", id));
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MailError::NotFound(format!("message {} in {}", id, self.name)));
            }
            Err(e) => return Err(e.into()),
        };
        let meta: MessageMeta = serde_json::from_slice(&content)?;
        Ok(Arc::new(FileMessage {
            meta,
            mailbox: self.name.clone(),
            dir: self.dir.join("new"),
            lock: self.lock.clone(),
        }))
    }

    async fn new_message(&self) -> Result<Box<dyn MessageWriter>> {
        let tmp_path = self
            .dir
            .join("tmp")
            .join(Uuid::new_v4().simple().to_string());
        let file = fs::File::create(&tmp_path).await?;
        Ok(Box::new(FileWriter {
            mailbox: self.name.clone(),
            dir: self.dir.clone(),
            tmp_path,
            file: Some(file),
            lock: self.lock.clone(),
            sealed: None,
        }))
    }

    async fn purge(&self) -> Result<()> {
        let _guard = self.lock.write().await;
        let new_dir = self.dir.join("new");
        let mut entries = fs::read_dir(&new_dir).await?;
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            fs::remove_file(entry.path()).await?;
            removed += 1;
        }
        debug!("Purged {} files from {}", removed, self.name);
        Ok(())
    }
}

pub struct FileMessage {
    meta: MessageMeta,
    mailbox: String,
    dir: PathBuf,
    lock: Arc<RwLock<u64>>,
}

impl FileMessage {
    fn raw_path(&self) -> PathBuf {
        self.dir.join(format!("{}.eml", self.meta.id))
    }

    fn not_found(&self) -> MailError {
        MailError::NotFound(format!("message {} in {}", self.meta.id, self.mailbox))
    }
}

#[async_trait]
impl Message for FileMessage {
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
        fs::read(self.raw_path()).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                self.not_found()
            } else {
                e.into()
            }
        })
    }

    async fn raw_reader(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        match fs::File::open(self.raw_path()).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(self.not_found()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self) -> Result<()> {
        let _guard = self.lock.write().await;
        let meta_path = self.dir.join(format!("{}.json", self.meta.id));

        // Metadata goes first so enumeration never sees a message without content
        match fs::remove_file(&meta_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(self.not_found()),
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = fs::remove_file(self.raw_path()).await {
            warn!("Failed to remove {}: {}", self.raw_path().display(), e);
        }
        debug!("Deleted message {} from {}", self.meta.id, self.mailbox);
        Ok(())
    }
}

pub struct FileWriter {
    mailbox: String,
    dir: PathBuf,
    tmp_path: PathBuf,
    file: Option<fs::File>,
    lock: Arc<RwLock<u64>>,
    sealed: Option<Arc<dyn Message>>,
}

impl FileWriter {
    fn file(&mut self) -> Result<&mut fs::File> {
        let mailbox = &self.mailbox;
        self.file.as_mut().ok_or_else(|| {
            MailError::Storage(format!("message for {} is no longer writable", mailbox))
        })
    }
}

#[async_trait]
impl MessageWriter for FileWriter {
    async fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file()?.write_all(data).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<Arc<dyn Message>> {
        if let Some(sealed) = &self.sealed {
            return Ok(sealed.clone());
        }
        let file = self.file()?;
        file.flush().await?;
        file.sync_all().await?;
        self.file = None;

        let raw = fs::read(&self.tmp_path).await?;
        let new_dir = self.dir.join("new");

        let mut last_seq = self.lock.write().await;
        let date = Utc::now();
        let mut meta = MessageMeta::from_raw(*last_seq + 1, date, &raw);
        while fs::try_exists(new_dir.join(format!("{}.eml", meta.id))).await? {
            meta = MessageMeta::from_raw(meta.seq + 1, date, &raw);
        }
        *last_seq = meta.seq;

        let raw_path = new_dir.join(format!("{}.eml", meta.id));
        fs::rename(&self.tmp_path, &raw_path).await?;
        fs::write(
            new_dir.join(format!("{}.json", meta.id)),
            serde_json::to_vec(&meta)?,
        )
        .await?;
        drop(last_seq);

        debug!("Sealed message {} in {}", meta.id, self.mailbox);
        let sealed: Arc<dyn Message> = Arc::new(FileMessage {
            meta,
            mailbox: self.mailbox.clone(),
            dir: new_dir,
            lock: self.lock.clone(),
        });
        self.sealed = Some(sealed.clone());
        Ok(sealed)
    }

    async fn discard(&mut self) -> Result<()> {
        if self.sealed.is_some() {
            return Err(MailError::Storage("cannot discard a sealed message".to_string()));
        }
        // A failed close leaves the file handle gone but tmp/ still populated
        self.file = None;
        match fs::remove_file(&self.tmp_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.tmp_path.display(), e),
        }
        Ok(())
    }
}

fn hash_name(name: &str) -> String {
    format!("{:x}", Sha256::digest(name.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn deliver(mailbox: &Arc<dyn Mailbox>, raw: &[u8]) -> Arc<dyn Message> {
        let mut writer = mailbox.new_message().await.unwrap();
        writer.append(raw).await.unwrap();
        writer.close().await.unwrap()
    }

    #[tokio::test]
    async fn test_deliver_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let raw = b"From: a@b.com\r\nSubject: stored\r\n\r\n.leading dot kept\r\n";

        {
            let store = FileStore::open(temp_dir.path()).await.unwrap();
            let mailbox = store.mailbox_for("c@d.com").await.unwrap();
            deliver(&mailbox, raw).await;
        }

        let store = FileStore::open(temp_dir.path()).await.unwrap();
        let mailboxes = store.all_mailboxes().await.unwrap();
        assert_eq!(mailboxes.len(), 1);
        assert_eq!(mailboxes[0].name(), "c@d.com");

        let messages = mailboxes[0].get_messages().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].from(), "a@b.com");
        assert_eq!(messages[0].subject(), "stored");
        assert_eq!(messages[0].read_raw().await.unwrap(), raw);
        assert_eq!(messages[0].read_body().await.unwrap(), ".leading dot kept\r\n");
    }

    #[tokio::test]
    async fn test_unsealed_message_is_invisible_and_discarded() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        let mailbox = store.mailbox_for("c@d.com").await.unwrap();

        let mut writer = mailbox.new_message().await.unwrap();
        writer.append(b"Subject: pending\r\n\r\n").await.unwrap();
        assert!(mailbox.get_messages().await.unwrap().is_empty());

        writer.discard().await.unwrap();
        assert!(mailbox.get_messages().await.unwrap().is_empty());

        let tmp = temp_dir.path().join(hash_name("c@d.com")).join("tmp");
        assert_eq!(std::fs::read_dir(tmp).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_close_twice_and_delete_twice() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        let mailbox = store.mailbox_for("c@d.com").await.unwrap();

        let mut writer = mailbox.new_message().await.unwrap();
        writer.append(b"Subject: x\r\n\r\n").await.unwrap();
        let first = writer.close().await.unwrap();
        let second = writer.close().await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(mailbox.get_messages().await.unwrap().len(), 1);

        first.delete().await.unwrap();
        assert!(second.delete().await.unwrap_err().is_not_found());
        assert!(first.read_raw().await.unwrap_err().is_not_found());
        assert!(matches!(
            mailbox.get_message(first.id()).await,
            Err(e) if e.is_not_found()
        ));
    }

    #[tokio::test]
    async fn test_purge() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        let mailbox = store.mailbox_for("c@d.com").await.unwrap();
        deliver(&mailbox, b"Subject: 1\r\n\r\n").await;
        deliver(&mailbox, b"Subject: 2\r\n\r\n").await;

        mailbox.purge().await.unwrap();
        assert!(mailbox.get_messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_writers_produce_distinct_messages() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::open(temp_dir.path()).await.unwrap());
        let mut handles = Vec::new();

        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mailbox = store.mailbox_for("shared@d.com").await.unwrap();
                let mut writer = mailbox.new_message().await.unwrap();
                writer.append(format!("Subject: msg {}\r\n", i).as_bytes()).await.unwrap();
                writer.append(b"\r\nbody\r\n").await.unwrap();
                writer.close().await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mailbox = store.mailbox_for("shared@d.com").await.unwrap();
        let messages = mailbox.get_messages().await.unwrap();
        assert_eq!(messages.len(), 10);

        let mut subjects: Vec<_> = messages.iter().map(|m| m.subject().to_string()).collect();
        subjects.sort();
        subjects.dedup();
        assert_eq!(subjects.len(), 10);

        let ids: std::collections::HashSet<_> =
            messages.iter().map(|m| m.id().to_string()).collect();
        assert_eq!(ids.len(), 10);
    }

    #[tokio::test]
    async fn test_second_store_leaves_open_writers_alone() {
        let temp_dir = TempDir::new().unwrap();
        let server = FileStore::open(temp_dir.path()).await.unwrap();
        let mailbox = server.mailbox_for("c@d.com").await.unwrap();
        let mut writer = mailbox.new_message().await.unwrap();
        writer.append(b"Subject: in flight\r\n\r\n").await.unwrap();

        // An operator listing the same root while the message is being written
        let admin = FileStore::open(temp_dir.path()).await.unwrap();
        let listed = admin.all_mailboxes().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].get_messages().await.unwrap().is_empty());

        let sealed = writer.close().await.unwrap();
        assert_eq!(sealed.subject(), "in flight");
        assert_eq!(listed[0].get_messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recover_removes_unsealed_leftovers() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = FileStore::open(temp_dir.path()).await.unwrap();
            let mailbox = store.mailbox_for("c@d.com").await.unwrap();
            deliver(&mailbox, b"Subject: kept\r\n\r\n").await;
            let mut writer = mailbox.new_message().await.unwrap();
            writer.append(b"Subject: abandoned\r\n").await.unwrap();
            // Dropped without close or discard, as after a crash
        }

        let store = FileStore::open(temp_dir.path()).await.unwrap();
        assert_eq!(store.recover().await.unwrap(), 1);
        assert_eq!(store.recover().await.unwrap(), 0);

        let tmp = temp_dir.path().join(hash_name("c@d.com")).join("tmp");
        assert_eq!(std::fs::read_dir(tmp).unwrap().count(), 0);
        let mailbox = store.mailbox_for("c@d.com").await.unwrap();
        assert_eq!(mailbox.get_messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_discard_after_failed_close_removes_tmp() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::open(temp_dir.path()).await.unwrap();
        let mailbox = store.mailbox_for("c@d.com").await.unwrap();
        let mut writer = mailbox.new_message().await.unwrap();
        writer.append(b"Subject: doomed\r\n\r\n").await.unwrap();

        let dir = temp_dir.path().join(hash_name("c@d.com"));
        std::fs::remove_dir_all(dir.join("new")).unwrap();
        assert!(writer.close().await.is_err());

        writer.discard().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.join("tmp")).unwrap().count(), 0);
    }
}
