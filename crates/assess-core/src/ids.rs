//! Branded ID newtypes.
//!
//! Session and interaction identifiers are both opaque strings issued by the
//! assessment backend. Wrapping them in distinct types keeps an interaction
//! ID from being used to build a session URL and vice versa.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::IdError;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifier of one assessment session. Used as the last path segment
    /// of the channel endpoint, so it is validated on construction.
    SessionId
}

branded_id! {
    /// Identifier of one question/response exchange within a session.
    InteractionId
}

impl SessionId {
    /// Validate and wrap a session identifier.
    ///
    /// Rejects empty values and values containing characters that would
    /// alter the endpoint path (`/`, `?`, `#`, whitespace).
    pub fn parse(raw: impl Into<String>) -> Result<Self, IdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(IdError::Empty);
        }
        if let Some(c) = raw
            .chars()
            .find(|c| matches!(c, '/' | '?' | '#') || c.is_whitespace())
        {
            return Err(IdError::InvalidChar { id: raw, ch: c });
        }
        Ok(Self(raw))
    }
}

impl std::str::FromStr for SessionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<String> for InteractionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for InteractionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}
