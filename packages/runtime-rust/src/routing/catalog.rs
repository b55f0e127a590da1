//! The registered message set.

use std::collections::{BTreeMap, HashMap};

use courier_core::Message;

use crate::error::RoutingError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub message_type: String,
    pub alias: Option<String>,
    pub publishable: bool,
    pub handled: bool,
}

impl CatalogEntry {
    /// Name used for destination derivation: the alias if one was given,
    /// otherwise the full message type.
    #[must_use]
    pub fn canonical_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.message_type)
    }
}

/// Registered message types, keyed by their full type name.
#[derive(Debug, Clone, Default)]
pub struct MessageCatalog {
    entries: BTreeMap<String, CatalogEntry>,
    /// canonical name -> message type
    canonical: HashMap<String, String>,
}

impl MessageCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message type. Registering again only widens `publishable`.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::Collision`] when the type's full name is
    /// already another type's alias.
    pub fn register(&mut self, message_type: &str, publishable: bool) -> Result<(), RoutingError> {
        self.insert(message_type, None, publishable)
    }

    /// Register `M` by its `MESSAGE_TYPE`.
    ///
    /// # Errors
    ///
    /// See [`MessageCatalog::register`].
    pub fn register_message<M: Message>(&mut self, publishable: bool) -> Result<(), RoutingError> {
        self.register(M::MESSAGE_TYPE, publishable)
    }

    /// Register a message type under a short alias used for destination names.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::Collision`] when the alias is claimed by another
    /// type, or when the type was registered with a different alias.
    pub fn register_aliased(
        &mut self,
        message_type: &str,
        alias: &str,
        publishable: bool,
    ) -> Result<(), RoutingError> {
        self.insert(message_type, Some(alias), publishable)
    }

    fn insert(&mut self, message_type: &str, alias: Option<&str>, publishable: bool) -> Result<(), RoutingError> {
        if let Some(existing) = self.entries.get_mut(message_type) {
            match (existing.alias.as_deref(), alias) {
                (Some(current), Some(requested)) if current != requested => {
                    return Err(RoutingError::Collision {
                        alias: message_type.to_string(),
                        first: current.to_string(),
                        second: requested.to_string(),
                    });
                }
                (None, Some(requested)) => {
                    Self::claim(&self.canonical, requested, message_type)?;
                    self.canonical.remove(message_type);
                    self.canonical
                        .insert(requested.to_string(), message_type.to_string());
                    existing.alias = Some(requested.to_string());
                }
                _ => {}
            }
            existing.publishable |= publishable;
            return Ok(());
        }

        let canonical = alias.unwrap_or(message_type);
        Self::claim(&self.canonical, canonical, message_type)?;
        self.canonical
            .insert(canonical.to_string(), message_type.to_string());
        self.entries.insert(
            message_type.to_string(),
            CatalogEntry {
                message_type: message_type.to_string(),
                alias: alias.map(str::to_string),
                publishable,
                handled: false,
            },
        );
        Ok(())
    }

    fn claim(canonical: &HashMap<String, String>, name: &str, message_type: &str) -> Result<(), RoutingError> {
        match canonical.get(name) {
            Some(owner) if owner != message_type => Err(RoutingError::Collision {
                alias: name.to_string(),
                first: owner.clone(),
                second: message_type.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Record that a handler exists for `message_type`, registering it if needed.
    ///
    /// # Errors
    ///
    /// See [`MessageCatalog::register`].
    pub fn mark_handled(&mut self, message_type: &str) -> Result<(), RoutingError> {
        if !self.entries.contains_key(message_type) {
            self.register(message_type, false)?;
        }
        if let Some(entry) = self.entries.get_mut(message_type) {
            entry.handled = true;
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, message_type: &str) -> Option<&CatalogEntry> {
        self.entries.get(message_type)
    }

    #[must_use]
    pub fn contains(&self, message_type: &str) -> bool {
        self.entries.contains_key(message_type)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }
}
