//! String identifier value objects
//!
//! Every identifier that crosses a store or wire boundary is a thin newtype
//! over `String` so flow, step, component and execution ids cannot be mixed up.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier
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
                Self(value.to_string())
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
    /// Value object: Flow ID
    FlowId
);

string_id!(
    /// Value object: Step ID (the id of a node within a flow graph)
    StepId
);

string_id!(
    /// Value object: Component ID
    ComponentId
);

string_id!(
    /// Value object: Flow execution ID, one run-instance of a flow
    FlowExecId
);

string_id!(
    /// Value object: Execution ID, the journal key for one processing attempt
    ExecutionId
);

string_id!(
    /// Value object: Broker message ID used for duplicate detection
    MessageId
);
