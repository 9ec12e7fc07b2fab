//! NewType wrappers for the names that flow between the quest file,
//! the container runtime and the certificate authority.
//!
//! Keeping them distinct stops a quest name from being passed where a
//! container name is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

newtype_string!(
    /// Name of a training scenario, the key into the quest file.
    QuestName
);

newtype_string!(
    /// Container name of a lab node. Doubles as the node's short host name.
    NodeName
);

newtype_string!(
    /// Container image reference, e.g. `agent` or `registry.local/agent:1.2`.
    ImageRef
);

impl NodeName {
    /// Fully qualified name under the lab domain, used as hostname and certname.
    pub fn fqdn(&self, domain: &str) -> String {
        if domain.is_empty() {
            self.0.clone()
        } else {
            format!("{}.{}", self.0, domain.trim_start_matches('.'))
        }
    }
}
