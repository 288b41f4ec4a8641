//! Identifier types shared by every component.
//!
//! Ids are opaque strings minted by the external collaborators (identity
//! provider, conversation directory, message store). They are wrapped in
//! newtypes so a `UserId` can never be passed where a `ConversationId` is
//! expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Stable user identity yielded by the identity verifier.
    UserId
);

string_id!(
    /// A direct or group conversation ("chat" on the wire).
    ConversationId
);

string_id!(
    /// A persisted message, as assigned by the message store.
    MessageId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_bare_strings() {
        let id = UserId::new("u-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"u-1\"");

        let back: ConversationId = serde_json::from_str("\"c-9\"").unwrap();
        assert_eq!(back.as_str(), "c-9");
    }
}
