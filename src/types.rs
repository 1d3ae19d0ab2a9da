//! Identifiers and the request priority class.
//!
//! Request ids and pod ids travel as bare strings in JSON and in provider
//! responses. Each gets its own type so a pod id can never be looked up in
//! the queue or a request id handed to the provider.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Declares a serde-transparent `String` id with conversions and `Display`.
macro_rules! string_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
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

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of a queued request (e.g. "req_3f2a...").
    ///
    /// Generated by the queue on admission and stable for the lifetime of
    /// the request record, including across retries.
    RequestId
);

string_id!(
    /// Provider-assigned identifier of a remote GPU pod.
    PodId
);

impl RequestId {
    /// Generate a fresh, unique request id.
    pub fn generate() -> Self {
        Self(format!("req_{}", uuid::Uuid::new_v4().simple()))
    }
}

/// Scheduling class of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(anyhow::anyhow!("unknown priority `{}`", other)),
        }
    }
}
