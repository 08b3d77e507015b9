//! The `Namespace` external interface (spec §6 item 1) and an
//! in-process double (component C8) sufficient to drive the client
//! call state machine end to end without a real mount-table service.
//!
//! The production name resolution and DHCP/roaming republishing logic
//! (spec §9) is out of scope; this is grounded in the shape of the
//! teacher's membership/discovery module (`discovery.rs`'s
//! `MemberInfo`/config pattern), trimmed to a flat name→servers map.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{CoreError, Result};

/// One candidate server entry inside a [`MountEntry`].
#[derive(Debug, Clone)]
pub struct MountedServer {
    /// The server's dialable address, e.g. `"tcp/10.0.0.1:1234"`.
    pub address: String,
    /// Blessing-pattern hints used for early filtering before dial.
    pub blessing_patterns: Vec<String>,
}

/// The result of resolving a name: a non-empty ordered list of
/// candidate servers plus whether this entry itself serves as a mount
/// table (eligible for further resolution).
#[derive(Debug, Clone)]
pub struct MountEntry {
    /// The residual suffix after stripping the resolved name prefix.
    pub name: String,
    /// Non-empty ordered list of candidate servers.
    pub servers: Vec<MountedServer>,
    /// Whether this entry itself serves as a mount table.
    pub serves_mount_table: bool,
}

/// Name resolution service: `Resolve(name) -> MountEntry`.
#[async_trait]
pub trait Namespace: Send + Sync {
    /// Resolves `name` to its mount entry. Implementations distinguish
    /// "name truly absent" (`CoreError::NoExist`) from transient
    /// failure (`CoreError::NoServers`) so the client can apply the
    /// right retry classification (spec §4.6 step 1).
    async fn resolve(&self, name: &str) -> Result<MountEntry>;
}

/// An in-process, statically-configured namespace double. Good enough
/// to exercise dial racing, retries and streaming in tests without a
/// real mount table process.
#[derive(Default)]
pub struct InMemoryNamespace {
    entries: RwLock<HashMap<String, MountEntry>>,
}

impl InMemoryNamespace {
    /// An empty namespace; every resolve fails `NoExist`.
    pub fn new() -> Self {
        InMemoryNamespace::default()
    }

    /// Registers (or replaces) the mount entry for `name`.
    pub fn mount(&self, name: impl Into<String>, servers: Vec<MountedServer>) {
        let name = name.into();
        let entry = MountEntry {
            name: name.clone(),
            servers,
            serves_mount_table: false,
        };
        self.entries.write().unwrap().insert(name, entry);
    }

    /// Removes the mount entry for `name`, if any.
    pub fn unmount(&self, name: &str) {
        self.entries.write().unwrap().remove(name);
    }
}

#[async_trait]
impl Namespace for InMemoryNamespace {
    async fn resolve(&self, name: &str) -> Result<MountEntry> {
        self.entries
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::NoExist(format!("no mount entry for {name:?}")))
    }
}

impl Clone for MountEntry {
    fn clone(&self) -> Self {
        MountEntry {
            name: self.name.clone(),
            servers: self.servers.clone(),
            serves_mount_table: self.serves_mount_table,
        }
    }
}

impl Clone for MountedServer {
    fn clone(&self) -> Self {
        MountedServer {
            address: self.address.clone(),
            blessing_patterns: self.blessing_patterns.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_unknown_name_is_no_exist() {
        let ns = InMemoryNamespace::new();
        let err = ns.resolve("missing").await.unwrap_err();
        assert!(matches!(err, CoreError::NoExist(_)));
    }

    #[tokio::test]
    async fn resolve_mounted_name_returns_servers() {
        let ns = InMemoryNamespace::new();
        ns.mount(
            "echo",
            vec![MountedServer {
                address: "tcp/127.0.0.1:1".into(),
                blessing_patterns: vec![],
            }],
        );
        let entry = ns.resolve("echo").await.unwrap();
        assert_eq!(entry.servers.len(), 1);
    }

    #[tokio::test]
    async fn unmount_removes_entry() {
        let ns = InMemoryNamespace::new();
        ns.mount("echo", vec![]);
        ns.unmount("echo");
        assert!(ns.resolve("echo").await.is_err());
    }
}
