use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::TypeRef;

/// Content type used when a handler or message declares none.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A registered message type.
///
/// `MESSAGE_TYPE` is the canonical identity used for chain lookup and routing.
/// It must be stable across processes and unique across the registered message
/// set; a fully qualified path such as `"orders::PlaceOrder"` is the convention.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Canonical, fully qualified message identity.
    const MESSAGE_TYPE: &'static str;

    /// Content type used when the message is put on the wire.
    const CONTENT_TYPE: &'static str = JSON_CONTENT_TYPE;

    #[must_use]
    fn type_ref() -> TypeRef {
        TypeRef::of::<Self>()
    }
}
