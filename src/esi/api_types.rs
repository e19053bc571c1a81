//! Serde types matching ESI responses for the built-in resources.
//!
//! Only the fields the sync layer and its hooks use are modelled; unknown
//! fields are ignored on decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Clones
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiLocation {
  pub location_id: u64,
  pub location_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiJumpClone {
  pub jump_clone_id: u64,
  pub location_id: u64,
  pub location_type: String,
  #[serde(default)]
  pub implants: Vec<u32>,
  pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiClones {
  pub home_location: Option<ApiLocation>,
  #[serde(default)]
  pub jump_clones: Vec<ApiJumpClone>,
  pub last_clone_jump_date: Option<DateTime<Utc>>,
  pub last_station_change_date: Option<DateTime<Utc>>,
}

// ============================================================================
// Blueprints
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiBlueprint {
  pub item_id: u64,
  pub type_id: u32,
  pub location_id: u64,
  pub location_flag: String,
  pub material_efficiency: i32,
  pub time_efficiency: i32,
  /// -1 for originals, -2 for copies, else stack size
  pub quantity: i32,
  /// -1 for originals
  pub runs: i32,
}

impl ApiBlueprint {
  pub fn is_copy(&self) -> bool {
    self.quantity == -2
  }
}

// ============================================================================
// Structures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiStructureService {
  pub name: String,
  pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiStructure {
  pub structure_id: u64,
  pub type_id: u32,
  pub system_id: u32,
  pub name: Option<String>,
  pub state: String,
  pub fuel_expires: Option<DateTime<Utc>>,
  #[serde(default)]
  pub services: Vec<ApiStructureService>,
}

impl ApiStructure {
  pub fn display_name(&self) -> String {
    self
      .name
      .clone()
      .unwrap_or_else(|| format!("Structure {}", self.structure_id))
  }
}
