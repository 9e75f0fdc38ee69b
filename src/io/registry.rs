//! Registered plate lookup
//!
//! The registry file is a JSON array of user records. It is owned by the
//! operator tooling and re-read on every lookup, so registrations take effect
//! without restarting recognition.

use crate::domain::types::Plate;
use crate::io::slot_store::write_atomic;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("plate number {0:?} has no letters or digits")]
    InvalidPlate(String),

    #[error("plate {0} is already registered")]
    AlreadyRegistered(Plate),
}

/// Registered-plate capability consumed by camera workers
#[async_trait]
pub trait Registry: Send + Sync {
    async fn lookup(&self, plate: &Plate) -> Result<bool, RegistryError>;
}

/// A registered vehicle owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    pub plate_number: String,
}

impl User {
    /// Registered plate in canonical form, if the stored text has one
    pub fn plate(&self) -> Option<Plate> {
        Plate::parse(&self.plate_number)
    }
}

/// Registry backed by a JSON file of users
#[derive(Debug, Clone)]
pub struct JsonRegistry {
    path: PathBuf,
}

impl JsonRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse_users(content: &str) -> Result<Vec<User>, RegistryError> {
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(content)?)
    }

    /// All registered users; a missing file is an empty registry
    pub fn users(&self) -> Result<Vec<User>, RegistryError> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Self::parse_users(&content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Add a user. The plate is stored sanitized; duplicates are refused.
    pub fn register(&self, mut user: User) -> Result<User, RegistryError> {
        let plate = user
            .plate()
            .ok_or_else(|| RegistryError::InvalidPlate(user.plate_number.clone()))?;
        user.plate_number = plate.to_string();

        let mut users = self.users()?;
        if users.iter().any(|u| u.plate().as_ref() == Some(&plate)) {
            return Err(RegistryError::AlreadyRegistered(plate));
        }
        users.push(user.clone());

        // Lookups re-read the file concurrently; never expose a partial write
        write_atomic(&self.path, &serde_json::to_vec_pretty(&users)?)?;

        info!(plate = %plate, users = %users.len(), "user_registered");
        Ok(user)
    }
}

#[async_trait]
impl Registry for JsonRegistry {
    async fn lookup(&self, plate: &Plate) -> Result<bool, RegistryError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let users = Self::parse_users(&content)?;
        Ok(users.iter().any(|u| u.plate().as_ref() == Some(plate)))
    }
}

/// Fixed in-memory registry
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    plates: HashSet<Plate>,
}

impl StaticRegistry {
    pub fn new(plates: impl IntoIterator<Item = Plate>) -> Self {
        Self { plates: plates.into_iter().collect() }
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn lookup(&self, plate: &Plate) -> Result<bool, RegistryError> {
        Ok(self.plates.contains(plate))
    }
}
