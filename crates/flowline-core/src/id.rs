//! Resource identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for jobs, steps and flows.
/// Uses UUIDv7 for time-ordered, sortable IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Create a new unique ResourceId using UUIDv7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Deterministic id for a name scoped under another id.
    pub fn derived(namespace: &ResourceId, name: &str) -> Self {
        Self(Uuid::new_v5(&namespace.0, name.as_bytes()))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse an id from raw message bytes, as carried on job and dead-letter queues.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, uuid::Error> {
        let text = String::from_utf8_lossy(raw);
        Ok(Self(Uuid::parse_str(text.trim())?))
    }

    /// Encode the id as raw message bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ResourceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<ResourceId> for Uuid {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

impl std::str::FromStr for ResourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_round_trip() {
        let id = ResourceId::new();
        let parsed = ResourceId::from_bytes(&id.to_bytes()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_derived_is_stable() {
        let job = ResourceId::new();
        assert_eq!(
            ResourceId::derived(&job, "api/test"),
            ResourceId::derived(&job, "api/test")
        );
        assert_ne!(
            ResourceId::derived(&job, "api/test"),
            ResourceId::derived(&job, "api/lint")
        );
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(ResourceId::from_bytes(b"not-a-job-id").is_err());
        assert!(ResourceId::from_bytes(b"").is_err());
    }
}
