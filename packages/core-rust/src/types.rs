use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Stable identity of a type referenced by handler descriptions and chain metadata.
///
/// The identity is a fully qualified path (e.g. `"orders::PlaceOrder"`). It is a
/// plain value: two `TypeRef`s are the same type iff their paths are equal, which
/// keeps every derived name a pure function of the type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeRef(Cow<'static, str>);

impl TypeRef {
    /// A type identity backed by a static path.
    #[must_use]
    pub const fn from_static(path: &'static str) -> Self {
        Self(Cow::Borrowed(path))
    }

    /// A type identity from an owned path.
    #[must_use]
    pub fn named(path: impl Into<String>) -> Self {
        Self(Cow::Owned(path.into()))
    }

    /// The identity of a registered message type.
    #[must_use]
    pub const fn of<M: Message>() -> Self {
        Self::from_static(M::MESSAGE_TYPE)
    }

    /// The fully qualified path.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The last `::`-separated segment of the path.
    #[must_use]
    pub fn simple_name(&self) -> &str {
        self.0.rsplit("::").next().unwrap_or(&self.0)
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for TypeRef {
    fn from(path: &'static str) -> Self {
        Self::from_static(path)
    }
}
