//! Persistence collaborator
//!
//! Account and character records behind the async [`Storage`] trait. The
//! server core never talks to a database directly; deployments plug in their
//! own backend. [`MemoryStorage`] keeps everything in process memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StorageError};

/// Player account record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    /// Username (normalized)
    pub username: String,
    /// Argon2 PHC string; empty for development accounts
    pub password_hash: String,
    /// Player rights (0=normal, 1=mod, 2=admin)
    pub rights: u8,
    pub enabled: bool,
    pub locked: bool,
}

/// Fields needed to create an account
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub password_hash: String,
    pub rights: u8,
}

/// Character record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub id: i64,
    pub account_id: i64,
    pub name: String,
    pub level: u16,
    /// Channel the character last played on (0 = none)
    pub channel: u16,
}

/// A set of records written together: either every record is stored or none is
#[derive(Debug, Clone, Default)]
pub struct SaveBatch {
    pub accounts: Vec<Account>,
    pub characters: Vec<Character>,
}

impl SaveBatch {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.characters.is_empty()
    }
}

/// Durable storage of accounts and characters
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn find_account(&self, username: &str) -> Result<Option<Account>>;

    async fn create_account(&self, account: NewAccount) -> Result<Account>;

    async fn find_character(&self, character_id: i64) -> Result<Option<Character>>;

    async fn list_characters(&self, account_id: i64) -> Result<Vec<Character>>;

    async fn create_character(&self, account_id: i64, name: &str) -> Result<Character>;

    /// Write a batch atomically. Every record must already exist.
    async fn save(&self, batch: SaveBatch) -> Result<()>;
}

#[derive(Default)]
struct Tables {
    accounts: HashMap<i64, Account>,
    usernames: HashMap<String, i64>,
    characters: HashMap<i64, Character>,
}

/// In-memory [`Storage`] backend
pub struct MemoryStorage {
    tables: RwLock<Tables>,
    next_account_id: AtomicI64,
    next_character_id: AtomicI64,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_account_id: AtomicI64::new(1),
            next_character_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn find_account(&self, username: &str) -> Result<Option<Account>> {
        let tables = self.tables.read();
        Ok(tables
            .usernames
            .get(username)
            .and_then(|id| tables.accounts.get(id))
            .cloned())
    }

    async fn create_account(&self, account: NewAccount) -> Result<Account> {
        let mut tables = self.tables.write();
        if tables.usernames.contains_key(&account.username) {
            return Err(StorageError::Conflict(format!("account {}", account.username)).into());
        }

        let id = self.next_account_id.fetch_add(1, Ordering::SeqCst);
        let record = Account {
            id,
            username: account.username,
            password_hash: account.password_hash,
            rights: account.rights,
            enabled: true,
            locked: false,
        };
        tables.usernames.insert(record.username.clone(), id);
        tables.accounts.insert(id, record.clone());

        debug!(account_id = id, username = %record.username, "Account stored");
        Ok(record)
    }

    async fn find_character(&self, character_id: i64) -> Result<Option<Character>> {
        Ok(self.tables.read().characters.get(&character_id).cloned())
    }

    async fn list_characters(&self, account_id: i64) -> Result<Vec<Character>> {
        let mut characters: Vec<Character> = self
            .tables
            .read()
            .characters
            .values()
            .filter(|c| c.account_id == account_id)
            .cloned()
            .collect();
        characters.sort_by_key(|c| c.id);
        Ok(characters)
    }

    async fn create_character(&self, account_id: i64, name: &str) -> Result<Character> {
        let mut tables = self.tables.write();
        if !tables.accounts.contains_key(&account_id) {
            return Err(StorageError::NotFound(format!("account {}", account_id)).into());
        }
        if tables
            .characters
            .values()
            .any(|c| c.name.eq_ignore_ascii_case(name))
        {
            return Err(StorageError::Conflict(format!("character {}", name)).into());
        }

        let id = self.next_character_id.fetch_add(1, Ordering::SeqCst);
        let character = Character {
            id,
            account_id,
            name: name.to_string(),
            level: 1,
            channel: 0,
        };
        tables.characters.insert(id, character.clone());

        debug!(character_id = id, account_id = account_id, "Character stored");
        Ok(character)
    }

    async fn save(&self, batch: SaveBatch) -> Result<()> {
        let mut tables = self.tables.write();

        // Validate the whole batch before touching anything
        if let Some(missing) = batch
            .accounts
            .iter()
            .find(|a| !tables.accounts.contains_key(&a.id))
        {
            return Err(StorageError::NotFound(format!("account {}", missing.id)).into());
        }
        if let Some(missing) = batch
            .characters
            .iter()
            .find(|c| !tables.characters.contains_key(&c.id))
        {
            return Err(StorageError::NotFound(format!("character {}", missing.id)).into());
        }

        for account in batch.accounts {
            tables.accounts.insert(account.id, account);
        }
        for character in batch.characters {
            tables.characters.insert(character.id, character);
        }
        Ok(())
    }
}
