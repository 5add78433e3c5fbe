//! Authentication service module
//!
//! Credential checks for the login tier against the [`Storage`] collaborator.
//! Supports both development mode (accepts all logins, creating accounts on
//! the fly) and production mode (validates Argon2 password hashes).

use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use tracing::{debug, info, warn};

use crate::error::{AuthError, RealmgateError, Result, StorageError};
use crate::game::persistence::{Account, Character, NewAccount, Storage};

/// Maximum characters per account
pub const MAX_CHARACTERS: usize = 6;

/// Authentication service for managing player accounts and logins
pub struct AuthService {
    storage: Arc<dyn Storage>,
    /// Whether running in development mode
    dev_mode: bool,
}

impl AuthService {
    pub fn new(storage: Arc<dyn Storage>, dev_mode: bool) -> Self {
        Self { storage, dev_mode }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Check if running in dev mode
    pub fn is_dev_mode(&self) -> bool {
        self.dev_mode
    }

    /// Authenticate a user with username and password
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Account> {
        let username = normalize_username(username);
        if username.is_empty() {
            return Err(AuthError::InvalidCredentials.into());
        }

        let account = match self.storage.find_account(&username).await? {
            Some(account) => account,
            None if self.dev_mode => {
                debug!(username = %username, "Dev mode authentication - auto-creating account");
                self.storage
                    .create_account(NewAccount {
                        username: username.clone(),
                        password_hash: String::new(),
                        rights: 2,
                    })
                    .await?
            }
            None => return Err(AuthError::InvalidCredentials.into()),
        };

        if !account.enabled {
            return Err(AuthError::AccountDisabled.into());
        }
        if account.locked {
            return Err(AuthError::AccountLocked.into());
        }

        // Development accounts carry no hash
        if !account.password_hash.is_empty() && !verify_password(password, &account.password_hash)
        {
            warn!(username = %username, "Failed login attempt");
            return Err(AuthError::InvalidCredentials.into());
        }

        info!(
            username = %username,
            account_id = account.id,
            "Authentication successful"
        );
        Ok(account)
    }

    /// Register a new account
    pub async fn register(&self, username: &str, password: &str) -> Result<Account> {
        let username = normalize_username(username);

        if username.is_empty() || username.len() > 12 {
            return Err(AuthError::InvalidUsername.into());
        }
        if password.len() < 4 || password.len() > 20 {
            return Err(AuthError::InvalidPassword.into());
        }

        let account = self
            .storage
            .create_account(NewAccount {
                username: username.clone(),
                password_hash: hash_password(password)?,
                rights: 0,
            })
            .await
            .map_err(|e| match e {
                RealmgateError::Storage(StorageError::Conflict(_)) => {
                    AuthError::RegistrationFailed("Username already exists".to_string()).into()
                }
                other => other,
            })?;

        info!(
            username = %username,
            account_id = account.id,
            "New account registered"
        );
        Ok(account)
    }

    /// Characters owned by an account
    pub async fn characters(&self, account_id: i64) -> Result<Vec<Character>> {
        self.storage.list_characters(account_id).await
    }

    /// Create a character for an account
    pub async fn create_character(&self, account_id: i64, name: &str) -> Result<Character> {
        let name = name.trim();
        if name.len() < 2 || name.len() > 12 || !name.chars().all(char::is_alphanumeric) {
            return Err(AuthError::RegistrationFailed(format!("Invalid name {:?}", name)).into());
        }
        if self.storage.list_characters(account_id).await?.len() >= MAX_CHARACTERS {
            return Err(AuthError::RegistrationFailed("Character slots full".to_string()).into());
        }
        self.storage.create_character(account_id, name).await
    }

    /// Load a character, checking that `account_id` owns it
    pub async fn owned_character(&self, account_id: i64, character_id: i64) -> Result<Character> {
        match self.storage.find_character(character_id).await? {
            Some(character) if character.account_id == account_id => Ok(character),
            _ => Err(AuthError::CharacterNotOwned.into()),
        }
    }
}

/// Normalize a username (lowercase, trim, replace spaces with underscores)
pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase().replace(' ', "_")
}

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| RealmgateError::Internal(format!("Failed to hash password: {}", e)))?
        .to_string();

    Ok(password_hash)
}

/// Verify a password against a hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}
