/// Listener events and the bounded event queue.
///
/// Events are produced by storage, directory and network activity and are
/// consumed either by application threads through [`EventQueue::poll`] or by
/// the instance's delivery thread, which runs listener callbacks. Producers
/// never block on consumers: a full queue sheds the oldest value events
/// first and never sheds connection events.
use crate::directory::TopicInfo;
use crate::handle::{ListenerHandle, SubscriberHandle, TopicHandle};
use crate::protocol::ConnectionInfo;
use crate::value::Value;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::ops::{BitOr, BitOrAssign};
use std::time::{Duration, Instant};

/// Default capacity of an event queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Bit set selecting which events a listener receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    /// A topic became visible.
    pub const PUBLISH: EventMask = EventMask(1);
    /// A topic went away.
    pub const UNPUBLISH: EventMask = EventMask(1 << 1);
    pub const PROPERTIES: EventMask = EventMask(1 << 2);
    /// Value written by a peer.
    pub const VALUE_REMOTE: EventMask = EventMask(1 << 3);
    /// Value written on this instance.
    pub const VALUE_LOCAL: EventMask = EventMask(1 << 4);
    pub const CONNECTED: EventMask = EventMask(1 << 5);
    pub const DISCONNECTED: EventMask = EventMask(1 << 6);
    /// Deliver the current state once at registration.
    pub const IMMEDIATE: EventMask = EventMask(1 << 7);

    pub const TOPIC: EventMask = EventMask(0b111);
    pub const VALUE_ALL: EventMask = EventMask((1 << 3) | (1 << 4));
    pub const CONNECTION: EventMask = EventMask((1 << 5) | (1 << 6));

    pub fn contains(&self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Publish,
    Unpublish,
    Properties,
    ValueRemote,
    ValueLocal,
    Connected,
    Disconnected,
}

impl EventKind {
    pub fn mask(&self) -> EventMask {
        match self {
            EventKind::Publish => EventMask::PUBLISH,
            EventKind::Unpublish => EventMask::UNPUBLISH,
            EventKind::Properties => EventMask::PROPERTIES,
            EventKind::ValueRemote => EventMask::VALUE_REMOTE,
            EventKind::ValueLocal => EventMask::VALUE_LOCAL,
            EventKind::Connected => EventMask::CONNECTED,
            EventKind::Disconnected => EventMask::DISCONNECTED,
        }
    }

    /// Connection events are never shed from a full queue.
    pub fn is_critical(&self) -> bool {
        matches!(self, EventKind::Connected | EventKind::Disconnected)
    }

    pub fn is_value(&self) -> bool {
        matches!(self, EventKind::ValueLocal | EventKind::ValueRemote)
    }
}

/// A value change as seen by a listener.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueEvent {
    pub topic: TopicHandle,
    pub name: String,
    pub value: Value,
    pub sequence: u64,
    /// The subscriber the listener is attached to, if any.
    pub subscriber: Option<SubscriberHandle>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    Topic(TopicInfo),
    Value(ValueEvent),
    Connection(ConnectionInfo),
}

/// One event delivered to one listener.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub listener: ListenerHandle,
    pub kind: EventKind,
    pub data: EventData,
}

impl Event {
    pub fn value(&self) -> Option<&ValueEvent> {
        match &self.data {
            EventData::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn topic(&self) -> Option<&TopicInfo> {
        match &self.data {
            EventData::Topic(info) => Some(info),
            _ => None,
        }
    }

    pub fn connection(&self) -> Option<&ConnectionInfo> {
        match &self.data {
            EventData::Connection(info) => Some(info),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<Event>,
    dropped: u64,
    closed: bool,
}

/// Bounded multi-producer FIFO with blocking, timed drain.
#[derive(Debug)]
pub struct EventQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    capacity: usize,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue an event, shedding older ones if the queue is full.
    ///
    /// Returns `false` if the queue is closed.
    pub fn push(&self, event: Event) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }

        while state.events.len() >= self.capacity {
            let victim = state
                .events
                .iter()
                .position(|e| e.kind.is_value())
                .or_else(|| state.events.iter().position(|e| !e.kind.is_critical()));
            match victim {
                Some(index) => {
                    state.events.remove(index);
                    state.dropped += 1;
                }
                None if event.kind.is_critical() => break,
                None => {
                    // Queue is all connection events; shed the newcomer.
                    state.dropped += 1;
                    return true;
                }
            }
        }

        state.events.push_back(event);
        drop(state);
        self.ready.notify_all();
        true
    }

    /// Wait up to `timeout` for at least one event, then drain everything.
    ///
    /// Returns an empty vector on timeout or when the queue is closed.
    pub fn poll(&self, timeout: Duration) -> Vec<Event> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.events.is_empty() && !state.closed {
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.events.drain(..).collect()
    }

    /// Drain without waiting.
    pub fn try_poll(&self) -> Vec<Event> {
        self.state.lock().events.drain(..).collect()
    }

    /// Close the queue, waking any blocked poller.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events shed because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}
