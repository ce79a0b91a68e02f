//! Strongly-typed identifiers used across the bridge.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BridgeError;

/// Engine-assigned key of a job offer (unique per offer).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(i64);

/// Engine-assigned key of a running process instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessInstanceKey(i64);

macro_rules! impl_engine_key {
    ($t:ty, $name:literal) => {
        impl $t {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $t {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = BridgeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let value = s
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| BridgeError::validation(format!("{}: {}", $name, e)))?;
                Ok(Self(value))
            }
        }
    };
}

impl_engine_key!(JobKey, "JobKey");
impl_engine_key!(ProcessInstanceKey, "ProcessInstanceKey");

/// Identifier threading one logical request across the broker boundary.
///
/// Minted once per logical request and never reused. The same literal value is
/// the broker message key on the way out and the correlation key on the way back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestId(String);

impl RequestId {
    /// Mint a fresh identifier (UUIDv7, time-ordered).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Accept an identifier produced elsewhere (e.g. by a `generate-request-id` step).
    ///
    /// Blank values are rejected: an empty id cannot correlate anything.
    pub fn parse(value: impl Into<String>) -> Result<Self, BridgeError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(BridgeError::protocol("requestId is blank"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for RequestId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RequestId {
    type Error = BridgeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RequestId> for String {
    fn from(value: RequestId) -> Self {
        value.0
    }
}

impl FromStr for RequestId {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn engine_keys_parse_from_strings() {
        assert_eq!("2251799813685249".parse::<JobKey>().unwrap().get(), 2251799813685249);
        assert!("not-a-key".parse::<ProcessInstanceKey>().is_err());
    }

    #[test]
    fn generated_request_ids_do_not_repeat() {
        let ids: HashSet<RequestId> = (0..10_000).map(|_| RequestId::generate()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn blank_request_id_is_a_protocol_violation() {
        assert!(matches!(
            RequestId::parse("   "),
            Err(BridgeError::ProtocolViolation(_))
        ));
        assert_eq!(RequestId::parse(" r1 ").unwrap().as_str(), "r1");
    }

    #[test]
    fn request_id_deserialization_rejects_empty_strings() {
        let ok: RequestId = serde_json::from_str("\"r1\"").unwrap();
        assert_eq!(ok.as_str(), "r1");
        assert!(serde_json::from_str::<RequestId>("\"\"").is_err());
    }

    proptest! {
        #[test]
        fn engine_keys_survive_display_and_parse(raw in any::<i64>()) {
            let key = JobKey::new(raw);
            prop_assert_eq!(key.to_string().parse::<JobKey>().unwrap(), key);
            prop_assert_eq!(format!(" {raw} ").parse::<ProcessInstanceKey>().unwrap().get(), raw);
        }

        #[test]
        fn request_ids_are_trimmed_and_stable(body in "[A-Za-z0-9-]{1,40}", pad in "[ \t]{0,3}") {
            let id = RequestId::parse(format!("{pad}{body}{pad}")).unwrap();
            prop_assert_eq!(id.as_str(), body.as_str());
            prop_assert_eq!(id.to_string().parse::<RequestId>().unwrap(), id);
        }
    }
}
