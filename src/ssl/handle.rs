//! Connection handles
//!
//! A `ConnectionHandle` is an index into a slot table plus the generation
//! the slot had when the handle was issued. Closing a connection bumps the
//! generation, so an old handle can never reach a newer connection that
//! reused the slot.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Opaque identifier for one TLS-capable transport endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    index: u32,
    generation: u32,
}

impl ConnectionHandle {
    /// Pack the handle into a pointer-sized integer for a host binding
    pub fn as_raw(&self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Rebuild a handle from `as_raw`; validity is checked on use
    pub fn from_raw(raw: u64) -> Self {
        ConnectionHandle {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

/// Generational slot table
pub(crate) struct HandleTable<T> {
    inner: RwLock<TableInner<T>>,
}

struct TableInner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> HandleTable<T> {
    pub(crate) fn new() -> Self {
        HandleTable {
            inner: RwLock::new(TableInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    pub(crate) fn insert(&self, value: T) -> ConnectionHandle {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let value = Some(Arc::new(value));

        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.value = value;
            return ConnectionHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = inner.slots.len() as u32;
        inner.slots.push(Slot {
            generation: 0,
            value,
        });
        ConnectionHandle {
            index,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, handle: ConnectionHandle) -> Option<Arc<T>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let slot = inner.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.clone()
    }

    pub(crate) fn remove(&self, handle: ConnectionHandle) -> Option<Arc<T>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let slot = inner.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(handle.index);
        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.slots.iter().filter(|s| s.value.is_some()).count()
    }
}
