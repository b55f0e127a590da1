//! Conventional and explicit routing rules, validated into a [`RoutingTable`].

use std::collections::{BTreeMap, HashMap};

use crate::error::RoutingError;

use super::catalog::MessageCatalog;
use super::naming::NamingConfig;

/// Where a rule came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSource {
    Conventional,
    Explicit,
}

/// Resolved mapping from a message type to its destinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRule {
    pub message_type: String,
    pub destination: String,
    pub dead_letter: Option<String>,
    /// Options applied when the transport provisions the destination.
    pub server_options: BTreeMap<String, String>,
    /// Options applied by the sending client.
    pub client_options: BTreeMap<String, String>,
    pub source: RuleSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum DeadLetterSetting {
    #[default]
    Conventional,
    Disabled,
    Named(String),
}

/// Explicit per-type routing configuration.
#[derive(Debug, Clone, Default)]
pub struct RouteConfiguration {
    destination: Option<String>,
    dead_letter: DeadLetterSetting,
    server_options: BTreeMap<String, String>,
    client_options: BTreeMap<String, String>,
}

impl RouteConfiguration {
    /// Use `name` verbatim as the primary destination.
    pub fn destination(&mut self, name: impl Into<String>) -> &mut Self {
        self.destination = Some(name.into());
        self
    }

    pub fn disable_dead_lettering(&mut self) -> &mut Self {
        self.dead_letter = DeadLetterSetting::Disabled;
        self
    }

    /// Use `name` verbatim as the dead-letter destination.
    pub fn dead_letter(&mut self, name: impl Into<String>) -> &mut Self {
        self.dead_letter = DeadLetterSetting::Named(name.into());
        self
    }

    pub fn server_option(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.server_options.insert(key.into(), value.into());
        self
    }

    pub fn client_option(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.client_options.insert(key.into(), value.into());
        self
    }
}

/// Builds the routing table from naming conventions and explicit overrides.
#[derive(Debug, Clone, Default)]
pub struct RoutingResolver {
    naming: NamingConfig,
    conventional: bool,
    explicit: BTreeMap<String, RouteConfiguration>,
}

impl RoutingResolver {
    /// A resolver with conventional routing enabled.
    #[must_use]
    pub fn new(naming: NamingConfig) -> Self {
        Self {
            naming,
            conventional: true,
            explicit: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn conventional(mut self, enabled: bool) -> Self {
        self.conventional = enabled;
        self
    }

    /// Configure `message_type` explicitly. The result replaces any implicit
    /// rule for that type. Repeated calls for one type accumulate.
    #[must_use]
    pub fn configure(
        mut self,
        message_type: impl Into<String>,
        configure: impl FnOnce(&mut RouteConfiguration),
    ) -> Self {
        configure(self.explicit.entry(message_type.into()).or_default());
        self
    }

    #[must_use]
    pub fn naming(&self) -> &NamingConfig {
        &self.naming
    }

    /// Validate every rule against the catalog and produce the table.
    ///
    /// # Errors
    ///
    /// [`RoutingError::UnknownMessageType`] for explicit rules naming an
    /// unregistered type; [`RoutingError::DuplicateDestination`] when two types
    /// resolve to the same primary destination.
    pub fn build(&self, catalog: &MessageCatalog) -> Result<RoutingTable, RoutingError> {
        if let Some(unknown) = self.explicit.keys().find(|t| !catalog.contains(t)) {
            return Err(RoutingError::UnknownMessageType {
                message_type: unknown.clone(),
            });
        }

        let mut rules = BTreeMap::new();
        let mut canonical = HashMap::new();
        for entry in catalog.entries() {
            canonical.insert(entry.message_type.clone(), entry.canonical_name().to_string());
            let conventional = self.naming.primary(entry.canonical_name());

            let rule = if let Some(config) = self.explicit.get(&entry.message_type) {
                let destination = config.destination.clone().unwrap_or(conventional);
                let dead_letter = match &config.dead_letter {
                    DeadLetterSetting::Conventional => self.naming.dead_letter(&destination),
                    DeadLetterSetting::Disabled => None,
                    DeadLetterSetting::Named(name) => Some(name.clone()),
                };
                RoutingRule {
                    message_type: entry.message_type.clone(),
                    destination,
                    dead_letter,
                    server_options: config.server_options.clone(),
                    client_options: config.client_options.clone(),
                    source: RuleSource::Explicit,
                }
            } else if self.conventional && entry.publishable && entry.handled {
                RoutingRule {
                    message_type: entry.message_type.clone(),
                    dead_letter: self.naming.dead_letter(&conventional),
                    destination: conventional,
                    server_options: BTreeMap::new(),
                    client_options: BTreeMap::new(),
                    source: RuleSource::Conventional,
                }
            } else {
                continue;
            };
            rules.insert(entry.message_type.clone(), rule);
        }

        let mut claimed: HashMap<&str, &str> = HashMap::new();
        for rule in rules.values() {
            if let Some(first) = claimed.insert(&rule.destination, &rule.message_type) {
                return Err(RoutingError::DuplicateDestination {
                    destination: rule.destination.clone(),
                    first: first.to_string(),
                    second: rule.message_type.clone(),
                });
            }
        }

        tracing::debug!(rules = rules.len(), prefix = ?self.naming.prefix, "routing table built");
        Ok(RoutingTable {
            rules,
            canonical,
            naming: self.naming.clone(),
        })
    }
}

/// Validated, immutable routing rules.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    rules: BTreeMap<String, RoutingRule>,
    canonical: HashMap<String, String>,
    naming: NamingConfig,
}

impl RoutingTable {
    /// The rule for `message_type`.
    ///
    /// # Errors
    ///
    /// [`RoutingError::UnknownMessageType`] for unregistered types and
    /// [`RoutingError::Unrouted`] for registered types without a rule.
    pub fn resolve(&self, message_type: &str) -> Result<&RoutingRule, RoutingError> {
        self.rules.get(message_type).ok_or_else(|| {
            if self.canonical.contains_key(message_type) {
                RoutingError::Unrouted {
                    message_type: message_type.to_string(),
                }
            } else {
                RoutingError::UnknownMessageType {
                    message_type: message_type.to_string(),
                }
            }
        })
    }

    /// Check that every type in `message_types` resolves.
    ///
    /// # Errors
    ///
    /// The first resolution failure.
    pub fn require<'a>(&self, message_types: impl IntoIterator<Item = &'a str>) -> Result<(), RoutingError> {
        for message_type in message_types {
            self.resolve(message_type)?;
        }
        Ok(())
    }

    /// Dead-letter destination for failed envelopes of `message_type`.
    ///
    /// Types without a rule fall back to the naming convention, so handled-only
    /// types still dead-letter deterministically.
    #[must_use]
    pub fn dead_letter_for(&self, message_type: &str) -> Option<String> {
        if let Some(rule) = self.rules.get(message_type) {
            return rule.dead_letter.clone();
        }
        let canonical = self
            .canonical
            .get(message_type)
            .map_or(message_type, String::as_str);
        self.naming.dead_letter(&self.naming.primary(canonical))
    }

    /// Primary destinations, sorted.
    #[must_use]
    pub fn destinations(&self) -> Vec<&str> {
        let mut destinations: Vec<&str> = self.rules.values().map(|r| r.destination.as_str()).collect();
        destinations.sort_unstable();
        destinations
    }

    pub fn rules(&self) -> impl Iterator<Item = &RoutingRule> {
        self.rules.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(types: &[&str]) -> MessageCatalog {
        let mut catalog = MessageCatalog::new();
        for t in types {
            catalog.register(t, true).unwrap();
            catalog.mark_handled(t).unwrap();
        }
        catalog
    }

    #[test]
    fn conventional_rule_with_prefix_and_dead_letter() {
        let table = RoutingResolver::new(NamingConfig::default().with_prefix("zztop"))
            .build(&catalog(&["Routed"]))
            .unwrap();
        let rule = table.resolve("Routed").unwrap();
        assert_eq!(rule.destination, "zztop.Routed");
        assert_eq!(rule.dead_letter.as_deref(), Some("zztop.Routed.dead-letter"));
        assert_eq!(rule.source, RuleSource::Conventional);
    }

    #[test]
    fn only_publishable_and_handled_types_get_implicit_rules() {
        let mut catalog = MessageCatalog::new();
        catalog.register("app::PublishedOnly", true).unwrap();
        catalog.mark_handled("app::HandledOnly").unwrap();
        let table = RoutingResolver::new(NamingConfig::default()).build(&catalog).unwrap();
        assert_eq!(
            table.resolve("app::PublishedOnly"),
            Err(RoutingError::Unrouted {
                message_type: "app::PublishedOnly".into()
            })
        );
        assert!(table.resolve("app::HandledOnly").is_err());
        assert!(table.destinations().is_empty());
    }

    #[test]
    fn explicit_configuration_replaces_the_implicit_rule() {
        let table = RoutingResolver::new(NamingConfig::default().with_prefix("zztop"))
            .configure("Routed", |c| {
                c.destination("routed-topic")
                    .disable_dead_lettering()
                    .server_option("ack_deadline", "30");
            })
            .build(&catalog(&["Routed"]))
            .unwrap();
        let rule = table.resolve("Routed").unwrap();
        assert_eq!(rule.destination, "routed-topic");
        assert!(rule.dead_letter.is_none());
        assert_eq!(rule.server_options.get("ack_deadline").map(String::as_str), Some("30"));
        assert_eq!(rule.source, RuleSource::Explicit);
    }

    #[test]
    fn explicit_dead_letter_name_is_used_verbatim() {
        let table = RoutingResolver::new(NamingConfig::default())
            .configure("Routed", |c| {
                c.dead_letter("shared-dlq");
            })
            .build(&catalog(&["Routed"]))
            .unwrap();
        assert_eq!(table.resolve("Routed").unwrap().dead_letter.as_deref(), Some("shared-dlq"));
    }

    #[test]
    fn explicit_rule_for_unknown_type_fails_the_build() {
        let err = RoutingResolver::new(NamingConfig::default())
            .configure("app::Ghost", |c| {
                c.destination("ghosts");
            })
            .build(&catalog(&["Routed"]))
            .unwrap_err();
        assert_eq!(
            err,
            RoutingError::UnknownMessageType {
                message_type: "app::Ghost".into()
            }
        );
    }

    #[test]
    fn duplicate_destinations_fail_the_build() {
        let err = RoutingResolver::new(NamingConfig::default())
            .configure("app::B", |c| {
                c.destination("app::A");
            })
            .build(&catalog(&["app::A", "app::B"]))
            .unwrap_err();
        assert!(matches!(err, RoutingError::DuplicateDestination { ref destination, .. } if destination == "app::A"));
    }

    #[test]
    fn conventional_routing_can_be_disabled() {
        let table = RoutingResolver::new(NamingConfig::default())
            .conventional(false)
            .build(&catalog(&["Routed"]))
            .unwrap();
        assert!(table.resolve("Routed").is_err());
        assert_eq!(table.dead_letter_for("Routed").as_deref(), Some("Routed.dead-letter"));
    }

    #[test]
    fn require_reports_unregistered_types() {
        let table = RoutingResolver::new(NamingConfig::default())
            .build(&catalog(&["Routed"]))
            .unwrap();
        assert!(table.require(["Routed"]).is_ok());
        assert!(matches!(
            table.require(["Routed", "app::Missing"]),
            Err(RoutingError::UnknownMessageType { .. })
        ));
    }
}
