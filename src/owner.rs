//! Owners: the characters and corporations whose data is synced.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;

/// Kind of owner a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
  Character,
  Corporation,
}

impl OwnerType {
  pub fn as_str(&self) -> &'static str {
    match self {
      OwnerType::Character => "character",
      OwnerType::Corporation => "corporation",
    }
  }
}

impl fmt::Display for OwnerType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A character or corporation whose data is fetched and cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
  #[serde(rename = "type")]
  pub owner_type: OwnerType,
  pub id: u64,
  pub name: String,
  /// Character whose token authenticates requests for this owner.
  /// Equal to `id` for characters.
  pub character_id: u64,
  /// Set by the auth subsystem; such owners are never scheduled.
  #[serde(default)]
  pub auth_failed: bool,
}

impl Owner {
  pub fn character(id: u64, name: impl Into<String>) -> Self {
    Self {
      owner_type: OwnerType::Character,
      id,
      name: name.into(),
      character_id: id,
      auth_failed: false,
    }
  }

  pub fn corporation(id: u64, name: impl Into<String>, character_id: u64) -> Self {
    Self {
      owner_type: OwnerType::Corporation,
      id,
      name: name.into(),
      character_id,
      auth_failed: false,
    }
  }

  pub fn key(&self) -> String {
    owner_key(self.owner_type, self.id)
  }
}

/// Build the `"{type}-{id}"` key naming an owner.
pub fn owner_key(owner_type: OwnerType, id: u64) -> String {
  format!("{}-{}", owner_type, id)
}

/// Split an owner key back into its type and id.
pub fn parse_owner_key(key: &str) -> Result<(OwnerType, u64)> {
  let (kind, id) = key
    .split_once('-')
    .ok_or_else(|| eyre!("Malformed owner key '{}'", key))?;

  let owner_type = match kind {
    "character" => OwnerType::Character,
    "corporation" => OwnerType::Corporation,
    other => return Err(eyre!("Unknown owner type '{}' in key '{}'", other, key)),
  };

  let id = id
    .parse::<u64>()
    .map_err(|e| eyre!("Invalid owner id in key '{}': {}", key, e))?;

  Ok((owner_type, id))
}

/// Which owners a resource applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerFilter {
  #[default]
  All,
  Character,
  Corporation,
}

impl OwnerFilter {
  pub fn matches(&self, owner_type: OwnerType) -> bool {
    match self {
      OwnerFilter::All => true,
      OwnerFilter::Character => owner_type == OwnerType::Character,
      OwnerFilter::Corporation => owner_type == OwnerType::Corporation,
    }
  }

  /// Like [`matches`](Self::matches), but for a raw owner key.
  /// Unparseable keys never match.
  pub fn matches_key(&self, key: &str) -> bool {
    parse_owner_key(key)
      .map(|(owner_type, _)| self.matches(owner_type))
      .unwrap_or(false)
  }
}

/// Read-only view of the current owners, provided by the auth subsystem.
pub trait OwnerDirectory: Send + Sync {
  /// All known owners, including ones whose auth has failed.
  fn owners(&self) -> Vec<Owner>;

  fn find(&self, key: &str) -> Option<Owner> {
    self.owners().into_iter().find(|o| o.key() == key)
  }

  /// Unknown owners count as not failed; they are handled as orphans.
  fn is_auth_failed(&self, key: &str) -> bool {
    self.find(key).map(|o| o.auth_failed).unwrap_or(false)
  }
}

/// In-memory owner directory.
#[derive(Debug, Default)]
pub struct OwnerSet {
  owners: RwLock<Vec<Owner>>,
}

impl OwnerSet {
  pub fn new(owners: Vec<Owner>) -> Self {
    Self {
      owners: RwLock::new(owners),
    }
  }

  /// Add an owner, replacing any existing owner with the same key.
  pub fn add(&self, owner: Owner) {
    let mut owners = self.owners.write().unwrap_or_else(|e| e.into_inner());
    let key = owner.key();
    match owners.iter_mut().find(|o| o.key() == key) {
      Some(existing) => *existing = owner,
      None => owners.push(owner),
    }
  }

  pub fn remove(&self, key: &str) -> Option<Owner> {
    let mut owners = self.owners.write().unwrap_or_else(|e| e.into_inner());
    let pos = owners.iter().position(|o| o.key() == key)?;
    Some(owners.remove(pos))
  }

  /// Returns false if no owner has that key.
  pub fn set_auth_failed(&self, key: &str, failed: bool) -> bool {
    let mut owners = self.owners.write().unwrap_or_else(|e| e.into_inner());
    match owners.iter_mut().find(|o| o.key() == key) {
      Some(owner) => {
        owner.auth_failed = failed;
        true
      }
      None => false,
    }
  }
}

impl OwnerDirectory for OwnerSet {
  fn owners(&self) -> Vec<Owner> {
    self
      .owners
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }
}
