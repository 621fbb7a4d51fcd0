//! Group aliases
//!
//! A group name expands to a list of member addresses at RCPT time. The
//! mapping is loaded once into an immutable [`AliasSnapshot`] from the inline
//! `[[aliases.groups]]` config and, optionally, an SQLite `aliases` table.

use crate::config::AliasConfig;
use crate::error::Result;
use crate::utils::EmailAddress;
use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::{debug, info};

pub trait AliasResolver: Send + Sync {
    /// Members of the group `name`, or `None` when it is not a group
    fn resolve(&self, name: &str) -> Option<Vec<String>>;

    /// Look up the full address first, then its bare local part
    fn resolve_address(&self, address: &EmailAddress) -> Option<Vec<String>> {
        self.resolve(&address.normalized())
            .or_else(|| self.resolve(&address.local.to_lowercase()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AliasSnapshot {
    groups: HashMap<String, Vec<String>>,
}

impl AliasSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the snapshot from config, merging the database table if one is configured
    pub async fn load(config: &AliasConfig) -> Result<Self> {
        let mut snapshot = Self::new();
        for group in &config.groups {
            snapshot.insert(&group.name, group.members.iter().map(String::as_str));
        }

        if let Some(url) = &config.database_url {
            let db = SqlitePool::connect(url).await?;
            snapshot.merge(Self::from_database(&db).await?);
            db.close().await;
        }

        info!("Loaded {} alias groups", snapshot.len());
        Ok(snapshot)
    }

    /// Read every row of `aliases(address, goto)`; `goto` is comma-separated
    pub async fn from_database(db: &SqlitePool) -> Result<Self> {
        let rows = sqlx::query_as::<_, (String, String)>("SELECT address, goto FROM aliases")
            .fetch_all(db)
            .await?;

        let mut snapshot = Self::new();
        for (address, goto) in rows {
            snapshot.insert(&address, goto.split(','));
        }
        debug!("Read {} alias groups from database", snapshot.len());
        Ok(snapshot)
    }

    pub fn insert<'a>(&mut self, name: &str, members: impl IntoIterator<Item = &'a str>) {
        let members: Vec<String> = members
            .into_iter()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();
        self.groups.insert(name.trim().to_lowercase(), members);
    }

    /// Entries from `other` replace entries with the same name
    pub fn merge(&mut self, other: AliasSnapshot) {
        self.groups.extend(other.groups);
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl AliasResolver for AliasSnapshot {
    fn resolve(&self, name: &str) -> Option<Vec<String>> {
        self.groups.get(&name.to_lowercase()).cloned()
    }
}
