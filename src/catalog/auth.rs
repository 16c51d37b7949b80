//! Authorization decision point for catalog access.
//!
//! Authentication happens upstream; by the time a request reaches the engine
//! the caller is an [`Identity`] and only the allow/deny decision remains.

use std::collections::HashSet;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    pub tenant: String,
}

impl Identity {
    pub fn new(subject: &str, tenant: &str) -> Self {
        Self {
            subject: subject.to_string(),
            tenant: tenant.to_string(),
        }
    }

    /// Identity used by local tooling.
    pub fn system() -> Self {
        Self::new("system", "default")
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::system()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Read,
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}

pub trait Authorizer: Send + Sync {
    fn authorize(&self, identity: &Identity, collection: &str, access: Access) -> bool;
}

/// Grants every identity full access inside its own tenant. Stores are
/// tenant-scoped, so this never leaks data across tenants.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowTenant;

impl Authorizer for AllowTenant {
    fn authorize(&self, _identity: &Identity, _collection: &str, _access: Access) -> bool {
        true
    }
}

/// Explicit (subject, collection, access) grants. `*` matches any collection.
#[derive(Debug, Default)]
pub struct GrantTable {
    grants: RwLock<HashSet<(String, String, Access)>>,
}

impl GrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(self, subject: &str, collection: &str, access: Access) -> Self {
        self.grants
            .write()
            .insert((subject.to_string(), collection.to_string(), access));
        self
    }

    pub fn revoke(&self, subject: &str, collection: &str, access: Access) {
        self.grants
            .write()
            .remove(&(subject.to_string(), collection.to_string(), access));
    }
}

impl Authorizer for GrantTable {
    fn authorize(&self, identity: &Identity, collection: &str, access: Access) -> bool {
        let grants = self.grants.read();
        [collection, "*"].iter().any(|c| {
            grants.contains(&(identity.subject.clone(), c.to_string(), access))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_table_checks_subject_collection_and_access() {
        let table = GrantTable::new()
            .grant("alice", "parcels", Access::Read)
            .grant("bob", "*", Access::Write);
        let alice = Identity::new("alice", "city");
        let bob = Identity::new("bob", "city");

        assert!(table.authorize(&alice, "parcels", Access::Read));
        assert!(!table.authorize(&alice, "parcels", Access::Write));
        assert!(!table.authorize(&alice, "roads", Access::Read));
        assert!(table.authorize(&bob, "anything", Access::Write));

        table.revoke("alice", "parcels", Access::Read);
        assert!(!table.authorize(&alice, "parcels", Access::Read));
    }
}
