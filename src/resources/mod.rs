//! Concrete owner-data resources synced from ESI.

mod blueprints;
mod clones;
mod json;
mod structures;

pub use blueprints::{BlueprintIndex, BlueprintInfo, Blueprints};
pub use clones::Clones;
pub use json::JsonResource;
pub use structures::{diff_structures, StructureNotice, Structures, LOW_FUEL_HOURS};

/// Endpoints a built-in resource fetches, as `{id}` templates.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinRoute {
  pub name: &'static str,
  pub pattern: &'static str,
  pub paths: &'static [&'static str],
}

/// Routes of [`Clones`], [`Blueprints`] and [`Structures`]. Configured
/// resources may not take these names or steal these endpoints.
pub const BUILTIN_ROUTES: &[BuiltinRoute] = &[
  BuiltinRoute {
    name: "clones",
    pattern: "/clones",
    paths: &["/characters/{id}/clones/"],
  },
  BuiltinRoute {
    name: "blueprints",
    pattern: "/blueprints",
    paths: &["/characters/{id}/blueprints/", "/corporations/{id}/blueprints/"],
  },
  BuiltinRoute {
    name: "structures",
    pattern: "/structures",
    paths: &["/corporations/{id}/structures/"],
  },
];
