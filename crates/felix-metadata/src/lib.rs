// Shared broker directory consulted by auto-discovering clusters.
use felix_common::BrokerAddress;
use felix_common::ids::SessionId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("broker directory unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate broker address {address} (already owned by {owner})")]
    DuplicateAddress { address: String, owner: String },
}

/// One broker as published in the shared directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerRecord {
    pub name: String,
    pub address: BrokerAddress,
    #[serde(default)]
    pub session: Option<SessionId>,
    #[serde(default)]
    pub version: u32,
}

impl BrokerRecord {
    pub fn new(name: impl Into<String>, address: BrokerAddress) -> Self {
        Self {
            name: name.into(),
            address,
            session: None,
            version: 0,
        }
    }
}

/// Read side of a directory shared by every broker in the cluster.
pub trait BrokerDirectory: Send + Sync {
    /// Every broker currently listed, in name order.
    fn list(&self) -> Result<Vec<BrokerRecord>>;

    fn get(&self, name: &str) -> Result<Option<BrokerRecord>>;
}

/// In-memory broker directory.
///
/// ```
/// use felix_common::BrokerAddress;
/// use felix_metadata::{BrokerDirectory, BrokerRecord, InMemoryBrokerDirectory};
///
/// let directory = InMemoryBrokerDirectory::new();
/// let addr: BrokerAddress = "b:1001".parse().expect("addr");
/// directory.put(BrokerRecord::new("b", addr)).expect("put");
/// assert_eq!(directory.list().expect("list").len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBrokerDirectory {
    // Name-ordered so listings are deterministic.
    inner: RwLock<BTreeMap<String, BrokerRecord>>,
}

impl InMemoryBrokerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record; an address may only be owned by one name.
    pub fn put(&self, record: BrokerRecord) -> Result<Option<BrokerRecord>> {
        let mut guard = self.inner.write();
        if let Some(owner) = guard
            .values()
            .find(|existing| existing.address == record.address && existing.name != record.name)
        {
            return Err(MetadataError::DuplicateAddress {
                address: record.address.to_string(),
                owner: owner.name.clone(),
            });
        }
        Ok(guard.insert(record.name.clone(), record))
    }

    pub fn delete(&self, name: &str) -> Option<BrokerRecord> {
        self.inner.write().remove(name)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl BrokerDirectory for InMemoryBrokerDirectory {
    fn list(&self) -> Result<Vec<BrokerRecord>> {
        Ok(self.inner.read().values().cloned().collect())
    }

    fn get(&self, name: &str) -> Result<Option<BrokerRecord>> {
        Ok(self.inner.read().get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(input: &str) -> BrokerAddress {
        input.parse().expect("address")
    }

    #[test]
    fn put_get_round_trip() {
        let directory = InMemoryBrokerDirectory::new();
        directory
            .put(BrokerRecord::new("b1", addr("b:1001")))
            .expect("put");
        let record = directory.get("b1").expect("get").expect("present");
        assert_eq!(record.address, addr("mq://b:1001/"));
        assert_eq!(record.version, 0);
    }

    #[test]
    fn delete_removes_entry() {
        let directory = InMemoryBrokerDirectory::new();
        directory
            .put(BrokerRecord::new("b1", addr("b:1001")))
            .expect("put");
        assert!(directory.delete("b1").is_some());
        assert!(directory.get("b1").expect("get").is_none());
        assert!(directory.is_empty());
    }

    #[test]
    fn put_overwrites_existing_record() {
        let directory = InMemoryBrokerDirectory::new();
        directory
            .put(BrokerRecord::new("b1", addr("b:1001")))
            .expect("put");
        let previous = directory
            .put(BrokerRecord::new("b1", addr("b:2002")))
            .expect("put");
        assert_eq!(previous.map(|r| r.address), Some(addr("b:1001")));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let directory = InMemoryBrokerDirectory::new();
        directory
            .put(BrokerRecord::new("b1", addr("b:1001")))
            .expect("put");
        let err = directory
            .put(BrokerRecord::new("b2", addr("b:1001")))
            .expect_err("duplicate");
        assert!(matches!(err, MetadataError::DuplicateAddress { owner, .. } if owner == "b1"));
    }

    #[test]
    fn list_is_name_ordered() {
        let directory = InMemoryBrokerDirectory::new();
        directory
            .put(BrokerRecord::new("zeta", addr("z:1")))
            .expect("put");
        directory
            .put(BrokerRecord::new("alpha", addr("a:1")))
            .expect("put");
        let names: Vec<_> = directory
            .list()
            .expect("list")
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
