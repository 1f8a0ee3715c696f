//! Identifier types for prism.
//!
//! Resources get a 32-byte content-derived identifier so that keys in the store
//! sort and compare cheaply. Everything handed to us by an external subsystem
//! (users, projects, budget accounts) and approval requests use UUIDs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 32-byte managed resource identifier, generated via blake3.
///
/// Derived from the owning project, the resource name and a timestamp so that
/// two launches with the same name never collide.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId([u8; 32]);

impl ResourceId {
    /// Create a new `ResourceId` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a new unique `ResourceId`.
    #[must_use]
    pub fn generate(project_id: &ProjectId, name: &str) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self::derive(project_id, name, &timestamp.to_le_bytes())
    }

    /// Generate a reproducible `ResourceId`, used by tests and fixtures.
    #[must_use]
    pub fn generate_deterministic(project_id: &ProjectId, name: &str, seed: u64) -> Self {
        Self::derive(project_id, name, &seed.to_le_bytes())
    }

    fn derive(project_id: &ProjectId, name: &str, salt: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(project_id.as_bytes());
        hasher.update(name.as_bytes());
        hasher.update(salt);
        Self(*hasher.finalize().as_bytes())
    }

    /// Parse a `ResourceId` from a hex-encoded string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid hex or not exactly 64 characters.
    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let bytes = hex::decode(s).map_err(|_| IdError::InvalidHex)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| IdError::InvalidLength {
            expected: 32,
            got: s.len() / 2,
        })?;
        Ok(Self(arr))
    }

    /// Return the underlying bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Return the hex-encoded string representation.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({})", self.to_hex())
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ResourceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for ResourceId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.to_hex()
    }
}

impl AsRef<[u8]> for ResourceId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Declares a UUID-backed identifier with string serde, parsing and display.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Wrap an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Generate a new random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Return the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }

            /// Return the 16 raw bytes, used for store keys.
            #[must_use]
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// Rebuild the identifier from its 16 raw bytes.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(uuid::Uuid::from_bytes(bytes))
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = uuid::Uuid::parse_str(s).map_err(|_| IdError::InvalidUuid)?;
                Ok(Self(uuid))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0.to_string()
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }
    };
}

uuid_id!(
    /// A user identity supplied by the identity subsystem.
    UserId
);

uuid_id!(
    /// A research project that owns resources and default idle policies.
    ProjectId
);

uuid_id!(
    /// A node in the hierarchical budget account tree.
    AccountId
);

uuid_id!(
    /// An over-quota request waiting for (or holding) an approval decision.
    ApprovalId
);

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input string contains invalid hexadecimal characters.
    #[error("invalid hex encoding")]
    InvalidHex,

    /// The input has an incorrect length.
    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// The expected number of bytes.
        expected: usize,
        /// The actual number of bytes.
        got: usize,
    },

    /// The input is not a valid UUID.
    #[error("invalid UUID format")]
    InvalidUuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_id_roundtrip_hex() {
        let id = ResourceId::from_bytes([0x42u8; 32]);
        let parsed = ResourceId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn resource_id_rejects_bad_input() {
        assert!(matches!(
            ResourceId::from_hex("not-valid-hex"),
            Err(IdError::InvalidHex)
        ));
        assert!(matches!(
            ResourceId::from_hex("deadbeef"),
            Err(IdError::InvalidLength { expected: 32, got: 4 })
        ));
    }

    #[test]
    fn resource_id_deterministic_depends_on_seed() {
        let project = ProjectId::from_uuid(uuid::Uuid::nil());
        let a = ResourceId::generate_deterministic(&project, "ws-1", 7);
        let b = ResourceId::generate_deterministic(&project, "ws-1", 7);
        let c = ResourceId::generate_deterministic(&project, "ws-1", 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn resource_id_serde_json_is_hex_string() {
        let id = ResourceId::from_bytes([0xab; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let parsed: ResourceId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn account_id_bytes_roundtrip() {
        let id = AccountId::generate();
        assert_eq!(AccountId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn approval_id_parse_and_display() {
        let id = ApprovalId::generate();
        let parsed: ApprovalId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(format!("{id:?}").starts_with("ApprovalId("));
    }

    #[test]
    fn uuid_ids_reject_garbage() {
        assert!(matches!(
            "not-a-uuid".parse::<UserId>(),
            Err(IdError::InvalidUuid)
        ));
        assert!(serde_json::from_str::<ProjectId>("\"nope\"").is_err());
    }
}
