//! Convention-based routing: message types to transport destinations.
//!
//! - [`naming`]: prefix and dead-letter suffix convention
//! - [`catalog`]: registered message types and their canonical names
//! - [`resolver`]: implicit and explicit rules, validated into a [`RoutingTable`]

pub mod catalog;
pub mod naming;
pub mod resolver;

pub use catalog::{CatalogEntry, MessageCatalog};
pub use naming::{NamingConfig, DEFAULT_DEAD_LETTER_SUFFIX};
pub use resolver::{RouteConfiguration, RoutingResolver, RoutingRule, RoutingTable, RuleSource};
