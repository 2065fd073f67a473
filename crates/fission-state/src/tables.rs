//! redb table definitions for the catalog.
//!
//! Resource tables use `&str` keys (`{namespace}/{name}`) and `&[u8]`
//! values (JSON-serialized resources).

use redb::TableDefinition;

pub const FUNCTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("functions");

pub const ENVIRONMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("environments");

pub const PACKAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("packages");

pub const HTTP_TRIGGERS: TableDefinition<&str, &[u8]> = TableDefinition::new("httptriggers");

pub const CONFIG_MAPS: TableDefinition<&str, &[u8]> = TableDefinition::new("configmaps");

pub const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Store-wide counters. Holds the last issued resource version.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const RESOURCE_VERSION_KEY: &str = "resource_version";
