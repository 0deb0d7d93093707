//! Gateway configuration: typed schema, file discovery, env substitution.
//!
//! Config lives in `fleetgate.toml` (or `.json`) in the working directory or
//! `~/.config/fleetgate/`. Every field has a sensible default, so a missing
//! file is not an error.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{discover_and_load, load_config, set_config_dir},
    schema::FleetgateConfig,
};
