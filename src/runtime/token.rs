//! Handle allocation for multiplexer registrations.
//!
//! Each registered source gets a handle that doubles as its mio `Token`.
//! Freed handles are retired rather than released so that a stale event
//! later in the same poll batch cannot reach a connection that reused the
//! slot. Retired slots are released when the next poll starts.

use mio::{Interest, Token};
use slab::Slab;
use std::fmt;

/// Identifier of a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(usize);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<Handle> for Token {
    fn from(handle: Handle) -> Token {
        Token(handle.0)
    }
}

impl From<Token> for Handle {
    fn from(token: Token) -> Handle {
        Handle(token.0)
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Active(Interest),
    Retired,
}

/// Slab of handle slots with deferred release.
#[derive(Debug, Default)]
pub struct HandleAllocator {
    slots: Slab<Slot>,
    retired: Vec<usize>,
}

impl HandleAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity),
            retired: Vec::new(),
        }
    }

    /// Reserve a handle for a source registered with `interest`.
    pub fn alloc(&mut self, interest: Interest) -> Handle {
        Handle(self.slots.insert(Slot::Active(interest)))
    }

    /// Interest of an active handle.
    pub fn get(&self, handle: Handle) -> Option<Interest> {
        match self.slots.get(handle.0) {
            Some(Slot::Active(interest)) => Some(*interest),
            _ => None,
        }
    }

    /// Update the interest of an active handle. Returns false if not active.
    pub fn set(&mut self, handle: Handle, interest: Interest) -> bool {
        match self.slots.get_mut(handle.0) {
            Some(slot @ Slot::Active(_)) => {
                *slot = Slot::Active(interest);
                true
            }
            _ => false,
        }
    }

    /// Retire an active handle. Returns false if not active.
    pub fn retire(&mut self, handle: Handle) -> bool {
        match self.slots.get_mut(handle.0) {
            Some(slot @ Slot::Active(_)) => {
                *slot = Slot::Retired;
                self.retired.push(handle.0);
                true
            }
            _ => false,
        }
    }

    /// Release a handle that was reserved but never registered.
    pub fn cancel(&mut self, handle: Handle) {
        if self.slots.contains(handle.0) {
            self.slots.remove(handle.0);
        }
    }

    /// Make retired slots available for reuse.
    pub fn release_retired(&mut self) {
        for idx in self.retired.drain(..) {
            self.slots.remove(idx);
        }
    }

    /// Active handles in slot order.
    pub fn active(&self) -> impl Iterator<Item = Handle> + '_ {
        self.slots.iter().filter_map(|(idx, slot)| match slot {
            Slot::Active(_) => Some(Handle(idx)),
            Slot::Retired => None,
        })
    }
}
