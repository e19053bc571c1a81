use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::{normalize_endpoint, resolve_pattern, ExpiryConfig, EXPIRY_PARTITION};
use crate::owner::{Owner, OwnerFilter, OwnerType};
use crate::paths;
use crate::resources::BUILTIN_ROUTES;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub esi: EsiConfig,
  /// Override for the cache database location
  pub database: Option<PathBuf>,
  #[serde(default)]
  pub refresh: RefreshSettings,
  #[serde(default)]
  pub owners: Vec<OwnerConfig>,
  /// Extra resources synced as raw JSON
  #[serde(default)]
  pub resources: Vec<ResourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EsiConfig {
  #[serde(default = "default_base_url")]
  pub base_url: String,
  #[serde(default = "default_user_agent")]
  pub user_agent: String,
  /// Sent as `X-Compatibility-Date` when set
  pub compatibility_date: Option<String>,
}

fn default_base_url() -> String {
  "https://esi.evetech.net/latest".to_string()
}

fn default_user_agent() -> String {
  format!("esi-sync/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for EsiConfig {
  fn default() -> Self {
    Self {
      base_url: default_base_url(),
      user_agent: default_user_agent(),
      compatibility_date: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshSettings {
  #[serde(default = "default_poll_interval")]
  pub poll_interval_secs: u64,
  /// Minimum cache window for endpoints that returned nothing
  #[serde(default = "default_empty_floor")]
  pub empty_floor_secs: i64,
}

fn default_poll_interval() -> u64 {
  60
}

fn default_empty_floor() -> i64 {
  3600
}

impl Default for RefreshSettings {
  fn default() -> Self {
    Self {
      poll_interval_secs: default_poll_interval(),
      empty_floor_secs: default_empty_floor(),
    }
  }
}

impl From<&RefreshSettings> for ExpiryConfig {
  fn from(settings: &RefreshSettings) -> Self {
    Self {
      poll_interval: std::time::Duration::from_secs(settings.poll_interval_secs.max(1)),
      empty_floor: chrono::Duration::seconds(settings.empty_floor_secs.max(0)),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OwnerConfig {
  #[serde(rename = "type")]
  pub owner_type: OwnerType,
  pub id: u64,
  #[serde(default)]
  pub name: String,
  /// Character whose token is used; required for corporations
  pub character_id: Option<u64>,
}

impl OwnerConfig {
  pub fn to_owner(&self) -> Result<Owner> {
    match self.owner_type {
      OwnerType::Character => Ok(Owner::character(self.id, self.name.clone())),
      OwnerType::Corporation => {
        let character_id = self.character_id.ok_or_else(|| {
          eyre!(
            "Corporation {} needs a character_id to authenticate with",
            self.id
          )
        })?;
        Ok(Owner::corporation(self.id, self.name.clone(), character_id))
      }
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
  /// Storage partition name; must be unique
  pub name: String,
  /// Endpoint substring the refresh callback is registered under
  pub pattern: String,
  #[serde(default)]
  pub owners: OwnerFilter,
  /// Path template; `{id}` is replaced by the owner id
  pub path: String,
  #[serde(default)]
  pub paginated: bool,
}

/// A resource's pattern and the endpoints it fetches, for route checks.
struct Route<'a> {
  name: &'a str,
  pattern: &'a str,
  paths: Vec<&'a str>,
}

impl Config {
  /// Load configuration from `explicit_path`, or else the first file of
  /// [`paths::config_candidates`] that exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = match explicit_path {
      Some(path) if path.exists() => path.to_path_buf(),
      Some(path) => return Err(eyre!("Config file not found: {}", path.display())),
      None => {
        let candidates = paths::config_candidates();
        match candidates.iter().find(|c| c.exists()) {
          Some(found) => found.clone(),
          None => {
            let tried: Vec<String> = candidates.iter().map(|c| c.display().to_string()).collect();
            return Err(eyre!(
              "No configuration file found (tried {}). See config.example.yaml for the format.",
              tried.join(", ")
            ));
          }
        }
      }
    };

    let contents = std::fs::read_to_string(&path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    for owner in &self.owners {
      owner.to_owner()?;
    }
    for resource in &self.resources {
      let name = resource.name.as_str();
      if name == EXPIRY_PARTITION || BUILTIN_ROUTES.iter().any(|r| r.name == name) {
        return Err(eyre!("Resource name '{}' is reserved", name));
      }
      if resource.pattern.trim().is_empty() {
        return Err(eyre!("Resource '{}' has an empty pattern", name));
      }
    }
    self.validate_routes()
  }

  /// Every fetched endpoint must resolve, both as requested and as an
  /// expiry key, to the pattern of the resource that fetches it.
  fn validate_routes(&self) -> Result<()> {
    let routes: Vec<Route> = BUILTIN_ROUTES
      .iter()
      .map(|r| Route {
        name: r.name,
        pattern: r.pattern,
        paths: r.paths.to_vec(),
      })
      .chain(self.resources.iter().map(|r| Route {
        name: &r.name,
        pattern: &r.pattern,
        paths: vec![r.path.as_str()],
      }))
      .collect();

    for (i, route) in routes.iter().enumerate() {
      if let Some(earlier) = routes[..i].iter().find(|r| r.name == route.name) {
        return Err(eyre!("Duplicate resource name '{}'", earlier.name));
      }
      if let Some(earlier) = routes[..i].iter().find(|r| r.pattern == route.pattern) {
        return Err(eyre!(
          "Resources '{}' and '{}' share the pattern '{}'",
          earlier.name,
          route.name,
          route.pattern
        ));
      }
    }

    let patterns: Vec<&str> = routes.iter().map(|r| r.pattern).collect();
    for route in &routes {
      for template in &route.paths {
        let endpoint = template.replace("{id}", "0");
        for form in [endpoint.clone(), normalize_endpoint(&endpoint)] {
          match resolve_pattern(&form, &patterns) {
            Some(pattern) if pattern == route.pattern => {}
            Some(pattern) => {
              let thief = routes.iter().find(|r| r.pattern == pattern).map_or("", |r| r.name);
              return Err(eyre!(
                "Resource '{}' fetches {} but pattern '{}' of '{}' would refresh it",
                route.name,
                template,
                pattern,
                thief
              ));
            }
            None => {
              return Err(eyre!(
                "Resource '{}' path {} does not contain its pattern '{}'",
                route.name,
                template,
                route.pattern
              ));
            }
          }
        }
      }
    }
    Ok(())
  }

  pub fn owners(&self) -> Result<Vec<Owner>> {
    self.owners.iter().map(OwnerConfig::to_owner).collect()
  }
}
