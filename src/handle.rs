/// Generation-checked handles.
///
/// Every object the instance hands out (topics, publishers, subscribers,
/// entries, listeners, pollers) is addressed by a small copyable handle: a
/// slot index plus the generation the slot had when the object was created.
/// Freeing a slot bumps its generation, so a handle that outlives its object
/// is detected instead of silently aliasing whatever reuses the slot.
///
/// Each arena also stamps its handles with a process-unique owner tag, so a
/// handle from another instance never resolves even when its slot is live.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_OWNER: AtomicU32 = AtomicU32::new(1);

/// Untyped slot reference shared by all handle kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawHandle {
    /// Tag of the arena that issued the handle.
    pub owner: u32,
    pub index: u32,
    pub generation: u32,
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub RawHandle);

        impl From<RawHandle> for $name {
            fn from(raw: RawHandle) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for RawHandle {
            fn from(handle: $name) -> Self {
                handle.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}.{}", $prefix, self.0.index, self.0.generation)
            }
        }
    };
}

typed_handle!(
    /// A topic in the directory.
    TopicHandle,
    "topic"
);
typed_handle!(
    /// A registered intent to write a topic.
    PublisherHandle,
    "pub"
);
typed_handle!(
    /// A registered intent to read a topic.
    SubscriberHandle,
    "sub"
);
typed_handle!(
    /// A subscriber plus lazily created publisher on one topic.
    EntryHandle,
    "entry"
);
typed_handle!(
    /// A registered event listener.
    ListenerHandle,
    "listener"
);
typed_handle!(
    /// A poll-based event queue.
    PollerHandle,
    "poller"
);

/// Identifies one peer link for the lifetime of the process.
///
/// Never reused, even across reconnections to the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Any releasable handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handle {
    Publisher(PublisherHandle),
    Subscriber(SubscriberHandle),
    Entry(EntryHandle),
    Listener(ListenerHandle),
    Poller(PollerHandle),
}

impl From<PublisherHandle> for Handle {
    fn from(h: PublisherHandle) -> Self {
        Handle::Publisher(h)
    }
}

impl From<SubscriberHandle> for Handle {
    fn from(h: SubscriberHandle) -> Self {
        Handle::Subscriber(h)
    }
}

impl From<EntryHandle> for Handle {
    fn from(h: EntryHandle) -> Self {
        Handle::Entry(h)
    }
}

impl From<ListenerHandle> for Handle {
    fn from(h: ListenerHandle) -> Self {
        Handle::Listener(h)
    }
}

impl From<PollerHandle> for Handle {
    fn from(h: PollerHandle) -> Self {
        Handle::Poller(h)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slab of values addressed by generation-checked handles.
#[derive(Debug)]
pub struct HandleArena<T> {
    owner: u32,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for HandleArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleArena<T> {
    pub fn new() -> Self {
        Self {
            owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Store a value and return its handle.
    pub fn insert(&mut self, value: T) -> RawHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return RawHandle {
                owner: self.owner,
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        RawHandle {
            owner: self.owner,
            index,
            generation: 0,
        }
    }

    pub fn get(&self, handle: RawHandle) -> Option<&T> {
        if handle.owner != self.owner {
            return None;
        }
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: RawHandle) -> Option<&mut T> {
        if handle.owner != self.owner {
            return None;
        }
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, handle: RawHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Remove a value. Returns `None` for stale or already-removed handles.
    pub fn remove(&mut self, handle: RawHandle) -> Option<T> {
        if handle.owner != self.owner {
            return None;
        }
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over live values with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (RawHandle, &T)> {
        let owner = self.owner;
        self.slots.iter().enumerate().filter_map(move |(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    RawHandle {
                        owner,
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (RawHandle, &mut T)> {
        let owner = self.owner;
        self.slots.iter_mut().enumerate().filter_map(move |(index, slot)| {
            let generation = slot.generation;
            slot.value.as_mut().map(move |value| {
                (
                    RawHandle {
                        owner,
                        index: index as u32,
                        generation,
                    },
                    value,
                )
            })
        })
    }
}
