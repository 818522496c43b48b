//! Identifier wrappers for the Genie authoring pipeline.
//!
//! Every record the pipeline creates (projects, chat messages, action
//! records, suggestions, launch runs, exceptions) carries a UUID-backed
//! newtype so ids of different kinds cannot be mixed up.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Error returned when parsing a UUID-backed identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    message: String,
}

impl IdParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IdParseError {}

macro_rules! define_uuid_id {
    ($(#[$meta:meta])* $name:ident, $label:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                Uuid::parse_str(value)
                    .map_err(|e| IdParseError::new(format!("Invalid {}: {}", $label, e)))?;
                Ok(Self(value.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// First eight characters, for log lines and CLI tables.
            pub fn short(&self) -> &str {
                match self.0.char_indices().nth(8) {
                    Some((cut, _)) => &self.0[..cut],
                    None => &self.0,
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_uuid_id!(
    /// An authoring project (the pipeline's root aggregate).
    ProjectId,
    "project ID"
);
define_uuid_id!(
    /// A copilot chat message.
    MessageId,
    "message ID"
);
define_uuid_id!(
    /// One attempted invocation of a stage action.
    ActionRecordId,
    "action record ID"
);
define_uuid_id!(SuggestionId, "suggestion ID");
define_uuid_id!(
    /// One execution of the composite build & launch run.
    RunId,
    "run ID"
);
define_uuid_id!(
    /// An entry in a project's exception queue.
    ExceptionId,
    "exception ID"
);
