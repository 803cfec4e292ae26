//! Per-realm terminal registry. One instance per admin key, owned by the host.
//!
//! Generic over the socket handle so the relay can store whatever it writes to
//! (an mpsc sender in practice) and tests can store plain values.

use std::collections::{BTreeMap, HashMap};

use crate::identity::PublicKey;
use crate::info::TerminalInfo;

/// Identifies one admitted connection, so a late close of a replaced socket
/// cannot evict its successor.
pub type ConnId = u64;

struct Slot<S> {
    conn: ConnId,
    socket: S,
}

pub struct Realm<S> {
    key: PublicKey,
    sockets: HashMap<String, Slot<S>>,
    infos: BTreeMap<String, TerminalInfo>,
    next_conn: ConnId,
}

/// Result of [`Realm::admit`].
pub struct Admitted<S> {
    pub conn: ConnId,
    /// Previous live socket under the same id; the caller must close it.
    pub replaced: Option<S>,
}

impl<S> Realm<S> {
    pub fn new(key: PublicKey) -> Self {
        Self {
            key,
            sockets: HashMap::new(),
            infos: BTreeMap::new(),
            next_conn: 1,
        }
    }

    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    /// Install `socket` under `terminal_id`. Last writer wins.
    pub fn admit(&mut self, terminal_id: &str, socket: S) -> Admitted<S> {
        let conn = self.next_conn;
        self.next_conn += 1;
        let replaced = self
            .sockets
            .insert(terminal_id.to_string(), Slot { conn, socket })
            .map(|old| old.socket);
        Admitted { conn, replaced }
    }

    /// Remove `terminal_id` if it is still served by `conn`. Drops its info too.
    pub fn evict(&mut self, terminal_id: &str, conn: ConnId) -> Option<S> {
        match self.sockets.get(terminal_id) {
            Some(slot) if slot.conn == conn => {}
            _ => return None,
        }
        self.infos.remove(terminal_id);
        self.sockets.remove(terminal_id).map(|s| s.socket)
    }

    /// Unconditional removal (phantom sweep).
    pub fn remove(&mut self, terminal_id: &str) -> Option<S> {
        self.infos.remove(terminal_id);
        self.sockets.remove(terminal_id).map(|s| s.socket)
    }

    pub fn lookup(&self, terminal_id: &str) -> Option<&S> {
        self.sockets.get(terminal_id).map(|s| &s.socket)
    }

    pub fn is_live(&self, terminal_id: &str) -> bool {
        self.sockets.contains_key(terminal_id)
    }

    pub fn terminal_ids(&self) -> Vec<String> {
        self.sockets.keys().cloned().collect()
    }

    /// Store a descriptor. Ignored for terminals that are not connected.
    pub fn update_info(&mut self, info: TerminalInfo) -> bool {
        if !self.sockets.contains_key(&info.terminal_id) {
            return false;
        }
        self.infos.insert(info.terminal_id.clone(), info);
        true
    }

    /// Insert a descriptor for the host-local terminal, which has no socket.
    pub fn pin_info(&mut self, info: TerminalInfo) {
        self.infos.insert(info.terminal_id.clone(), info);
    }

    pub fn infos(&self) -> Vec<TerminalInfo> {
        self.infos.values().cloned().collect()
    }

    /// Take every socket out, for shutdown.
    pub fn drain(&mut self) -> Vec<S> {
        self.infos.clear();
        self.sockets.drain().map(|(_, s)| s.socket).collect()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

/// All realms of one host, created lazily on first admission.
pub struct Realms<S> {
    realms: HashMap<PublicKey, Realm<S>>,
}

impl<S> Default for Realms<S> {
    fn default() -> Self {
        Self {
            realms: HashMap::new(),
        }
    }
}

impl<S> Realms<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the realm and whether it was just created.
    pub fn get_or_create(&mut self, key: &PublicKey) -> (&mut Realm<S>, bool) {
        let created = !self.realms.contains_key(key);
        let realm = self.realms.entry(*key).or_insert_with(|| Realm::new(*key));
        (realm, created)
    }

    pub fn get(&self, key: &PublicKey) -> Option<&Realm<S>> {
        self.realms.get(key)
    }

    pub fn get_mut(&mut self, key: &PublicKey) -> Option<&mut Realm<S>> {
        self.realms.get_mut(key)
    }

    pub fn keys(&self) -> Vec<PublicKey> {
        self.realms.keys().copied().collect()
    }

    pub fn drain_all(&mut self) -> Vec<S> {
        self.realms.values_mut().flat_map(|r| r.drain()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn realm() -> Realm<&'static str> {
        Realm::new(*Keypair::generate().public_key())
    }

    #[test]
    fn second_admission_replaces_first() {
        let mut r = realm();
        let first = r.admit("T1", "sock-1");
        assert!(first.replaced.is_none());
        let second = r.admit("T1", "sock-2");
        assert_eq!(second.replaced, Some("sock-1"));
        assert_eq!(r.lookup("T1"), Some(&"sock-2"));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn stale_evict_keeps_successor() {
        let mut r = realm();
        let first = r.admit("T1", "sock-1");
        let second = r.admit("T1", "sock-2");
        assert_eq!(r.evict("T1", first.conn), None);
        assert_eq!(r.lookup("T1"), Some(&"sock-2"));
        assert_eq!(r.evict("T1", second.conn), Some("sock-2"));
        assert!(r.lookup("T1").is_none());
    }

    #[test]
    fn info_follows_socket_lifetime() {
        let mut r = realm();
        assert!(!r.update_info(TerminalInfo::new("T1", "one")));
        let a = r.admit("T1", "sock-1");
        assert!(r.update_info(TerminalInfo::new("T1", "one")));
        assert_eq!(r.infos().len(), 1);
        r.evict("T1", a.conn);
        assert!(r.infos().is_empty());
    }

    #[test]
    fn realms_created_lazily_per_key() {
        let mut realms: Realms<u8> = Realms::new();
        let k1 = *Keypair::generate().public_key();
        let k2 = *Keypair::generate().public_key();
        assert!(realms.get_or_create(&k1).1);
        assert!(!realms.get_or_create(&k1).1);
        realms.get_or_create(&k1).0.admit("T1", 1);
        realms.get_or_create(&k2).0.admit("T1", 2);
        assert_eq!(realms.get(&k1).unwrap().lookup("T1"), Some(&1));
        assert_eq!(realms.get(&k2).unwrap().lookup("T1"), Some(&2));
        let mut drained = realms.drain_all();
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
    }
}
