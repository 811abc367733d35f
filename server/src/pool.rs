//! Fixed-capacity session table with generation-checked keys.
//!
//! The pool hands out dense wire identities (`ClientId(slot + 1)`) and lets a
//! slot be reused as soon as its session is released. Everything that holds
//! on to a session across ticks keeps a [`SessionKey`], which also records the
//! slot generation; a key that outlived its session resolves to nothing, even
//! after the slot has been taken by a new peer.

use crate::session::{ClientSession, Transport};
use log::{debug, info};
use shared::ClientId;
use std::net::SocketAddr;

/// Stable reference to one session incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub id: ClientId,
    generation: u32,
}

impl SessionKey {
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Returned by [`SessionPool::allocate`] when every slot is taken. Hands the
/// transport back so the caller can still answer the peer.
pub struct PoolFull(pub Box<dyn Transport>);

impl std::fmt::Debug for PoolFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PoolFull")
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    session: Option<ClientSession>,
}

pub struct SessionPool {
    slots: Vec<Slot>,
    live: usize,
}

impl SessionPool {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);
        Self { slots, live: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn is_full(&self) -> bool {
        self.live == self.slots.len()
    }

    /// Places a new session in the lowest free slot.
    pub fn allocate(
        &mut self,
        transport: Box<dyn Transport>,
        address: SocketAddr,
        receive_limit: usize,
        frame: u32,
    ) -> Result<SessionKey, PoolFull> {
        let Some(index) = self.slots.iter().position(|slot| slot.session.is_none()) else {
            return Err(PoolFull(transport));
        };

        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        let key = SessionKey {
            id: ClientId::from_slot(index),
            generation: slot.generation,
        };
        slot.session = Some(ClientSession::new(
            key,
            transport,
            address,
            receive_limit,
            frame,
        ));
        self.live += 1;

        info!("Client {} allocated for {}", key.id, address);
        Ok(key)
    }

    /// Removes the session `key` refers to. Stale keys release nothing.
    pub fn release(&mut self, key: SessionKey) -> Option<ClientSession> {
        let slot = self.slot_mut(key.id)?;
        if slot.generation != key.generation {
            debug!("Ignoring release of stale key {:?}", key);
            return None;
        }

        let session = slot.session.take()?;
        self.live -= 1;
        Some(session)
    }

    pub fn get(&self, key: SessionKey) -> Option<&ClientSession> {
        let slot = self.slots.get(key.id.slot()?)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.session.as_ref()
    }

    pub fn get_mut(&mut self, key: SessionKey) -> Option<&mut ClientSession> {
        let slot = self.slot_mut(key.id)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.session.as_mut()
    }

    /// Resolves a wire identity to the session currently holding it.
    pub fn key_of(&self, id: ClientId) -> Option<SessionKey> {
        let slot = self.slots.get(id.slot()?)?;
        slot.session.as_ref().map(|_| SessionKey {
            id,
            generation: slot.generation,
        })
    }

    /// Keys of all live sessions, in slot order.
    pub fn keys(&self) -> Vec<SessionKey> {
        self.iter().map(|session| session.key()).collect()
    }

    /// Live sessions in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.slots.iter().filter_map(|slot| slot.session.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientSession> {
        self.slots.iter_mut().filter_map(|slot| slot.session.as_mut())
    }

    fn slot_mut(&mut self, id: ClientId) -> Option<&mut Slot> {
        self.slots.get_mut(id.slot()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::NullTransport;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn allocate(pool: &mut SessionPool, port: u16) -> Result<SessionKey, PoolFull> {
        pool.allocate(Box::new(NullTransport), addr(port), 1024, 0)
    }

    #[test]
    fn test_allocate_assigns_dense_ids() {
        let mut pool = SessionPool::new(3);
        let a = allocate(&mut pool, 1).unwrap();
        let b = allocate(&mut pool, 2).unwrap();

        assert_eq!(a.id, ClientId(1));
        assert_eq!(b.id, ClientId(2));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(b).unwrap().address(), addr(2));
    }

    #[test]
    fn test_full_pool_returns_transport() {
        let mut pool = SessionPool::new(1);
        allocate(&mut pool, 1).unwrap();

        assert!(pool.is_full());
        assert!(allocate(&mut pool, 2).is_err());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_stale_key_never_aliases_reused_slot() {
        let mut pool = SessionPool::new(1);
        let old = allocate(&mut pool, 1).unwrap();
        pool.release(old).unwrap();

        let new = allocate(&mut pool, 2).unwrap();
        assert_eq!(old.id, new.id);
        assert_ne!(old, new);

        assert!(pool.get(old).is_none());
        assert!(pool.get_mut(old).is_none());
        assert!(pool.release(old).is_none());
        assert_eq!(pool.get(new).unwrap().address(), addr(2));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_release_frees_lowest_slot_for_reuse() {
        let mut pool = SessionPool::new(3);
        let a = allocate(&mut pool, 1).unwrap();
        let _b = allocate(&mut pool, 2).unwrap();
        let _c = allocate(&mut pool, 3).unwrap();

        pool.release(a).unwrap();
        let d = allocate(&mut pool, 4).unwrap();
        assert_eq!(d.id, ClientId(1));
    }

    #[test]
    fn test_iteration_is_slot_order() {
        let mut pool = SessionPool::new(4);
        let keys: Vec<_> = (0..4).map(|p| allocate(&mut pool, p).unwrap()).collect();
        pool.release(keys[1]).unwrap();

        let ids: Vec<_> = pool.keys().into_iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![ClientId(1), ClientId(3), ClientId(4)]);
    }

    #[test]
    fn test_server_identity_resolves_to_nothing() {
        let mut pool = SessionPool::new(2);
        allocate(&mut pool, 1).unwrap();
        assert!(pool.key_of(ClientId::SERVER).is_none());
        assert!(pool.key_of(ClientId(9)).is_none());
        assert!(pool.key_of(ClientId(1)).is_some());
    }
}
