//! Per-server capability store.
//!
//! Only the transfer state machine and the protocol session write to it.
//! Everything reads [`Tri::Unknown`] until someone has found out.

use std::collections::HashMap;

use tracing::debug;

use crate::server::ServerKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    SizeCommand,
    MdtmCommand,
    MfmtCommand,
    /// `REST` is accepted before `STOR`.
    RestStream,
    /// Resuming files larger than `threshold` bytes is broken.
    ResumeBug { threshold: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tri {
    #[default]
    Unknown,
    Yes,
    No,
}

#[derive(Debug, Default)]
pub struct CapabilityStore {
    entries: HashMap<(ServerKey, Capability), Tri>,
}

impl CapabilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, server: &ServerKey, cap: Capability) -> Tri {
        self.entries
            .get(&(server.clone(), cap))
            .copied()
            .unwrap_or_default()
    }

    pub fn set(&mut self, server: &ServerKey, cap: Capability, value: Tri) {
        debug!(%server, ?cap, ?value, "capability recorded");
        if value == Tri::Unknown {
            self.entries.remove(&(server.clone(), cap));
        } else {
            self.entries.insert((server.clone(), cap), value);
        }
    }

    /// Records `value` only if nothing is known yet.
    pub fn set_if_unknown(&mut self, server: &ServerKey, cap: Capability, value: Tri) {
        if self.get(server, cap) == Tri::Unknown {
            self.set(server, cap, value);
        }
    }

    /// Forgets everything known about `server`.
    pub fn clear(&mut self, server: &ServerKey) {
        self.entries.retain(|(k, _), _| k != server);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;

    fn ftp(host: &str) -> ServerKey {
        ServerKey::new(host, 21, Backend::Ftp)
    }

    #[test]
    fn defaults_to_unknown() {
        let store = CapabilityStore::new();
        assert_eq!(store.get(&ftp("a"), Capability::SizeCommand), Tri::Unknown);
        assert!(store.is_empty());
    }

    #[test]
    fn servers_are_independent() {
        let mut store = CapabilityStore::new();
        let bug = Capability::ResumeBug { threshold: 1 << 32 };
        store.set(&ftp("a"), bug, Tri::Yes);
        assert_eq!(store.get(&ftp("a"), bug), Tri::Yes);
        assert_eq!(store.get(&ftp("b"), bug), Tri::Unknown);
        assert_eq!(
            store.get(&ftp("a"), Capability::ResumeBug { threshold: 1 << 31 }),
            Tri::Unknown
        );
        let sftp = ServerKey::new("a", 21, Backend::Sftp);
        assert_eq!(store.get(&sftp, bug), Tri::Unknown);
    }

    #[test]
    fn set_if_unknown_keeps_first_answer() {
        let mut store = CapabilityStore::new();
        store.set_if_unknown(&ftp("a"), Capability::MdtmCommand, Tri::No);
        store.set_if_unknown(&ftp("a"), Capability::MdtmCommand, Tri::Yes);
        assert_eq!(store.get(&ftp("a"), Capability::MdtmCommand), Tri::No);
    }

    #[test]
    fn clear_forgets_one_server() {
        let mut store = CapabilityStore::new();
        store.set(&ftp("a"), Capability::RestStream, Tri::Yes);
        store.set(&ftp("b"), Capability::RestStream, Tri::No);
        store.clear(&ftp("a"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&ftp("b"), Capability::RestStream), Tri::No);
    }
}
