/// Pub/sub dispatcher: fans changes out to listeners and to the network.
///
/// The dispatcher sits between the storage engine and everything that wants
/// to hear about changes:
///
/// - **Listeners** registered by the application, each with an [`EventMask`],
///   a scope (a subscriber, a set of name prefixes, or connection state), and
///   a sink (a callback run on the delivery thread, or a poller queue).
/// - **The network layer**, reached through an unbounded channel of
///   [`Outbound`] messages so no storage or directory lock is ever held while
///   the network does work.
///
/// # Delivery policy
///
/// Listeners attached to a subscriber inherit its options. Without a period,
/// events are delivered as they happen. With a period, events are buffered
/// and handed over on the listener's tick; unless `send_all` is set, only the
/// newest value per topic survives between ticks.
///
/// # Threads
///
/// Each dispatcher owns two threads: the delivery thread, which runs listener
/// callbacks in order, and the flusher, which sleeps until the next periodic
/// listener is due.
use crate::config::Role;
use crate::directory::{DirectoryEvent, SubscriberInfo, TopicInfo};
use crate::error::{TableError, TableResult};
use crate::event::{
    DEFAULT_QUEUE_CAPACITY, Event, EventData, EventKind, EventMask, EventQueue, ValueEvent,
};
use crate::handle::{HandleArena, ListenerHandle, PollerHandle, SubscriberHandle, TopicHandle};
use crate::protocol::ConnectionInfo;
use crate::storage::WriteOrigin;
use crate::value::Value;
use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

/// Longest the flusher sleeps when no periodic listener exists.
const IDLE_FLUSH_WAIT: Duration = Duration::from_millis(500);

/// Listener callback.
pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Work handed to the network layer.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// A topic became visible on this instance, or an untyped one got its
    /// type.
    Announce(TopicInfo),
    /// A topic went away on this instance.
    Unannounce(TopicInfo),
    /// First local publisher on a topic.
    Publish(TopicInfo),
    /// Last local publisher on a topic released.
    Unpublish(TopicInfo),
    Properties {
        info: TopicInfo,
        update: JsonMap<String, JsonValue>,
        origin: WriteOrigin,
    },
    Value {
        topic: TopicHandle,
        name: String,
        value: Value,
        origin: WriteOrigin,
    },
    Subscribe {
        subscriber: SubscriberHandle,
        info: SubscriberInfo,
    },
    Unsubscribe {
        subscriber: SubscriberHandle,
    },
}

impl Outbound {
    /// Whether an instance playing `role` forwards this to its peers.
    ///
    /// Servers relay everything that describes their state. Clients relay
    /// only their own writes and their own registrations.
    fn relayed_by(&self, role: Role) -> bool {
        match (role, self) {
            (Role::Server, Outbound::Announce(_) | Outbound::Unannounce(_)) => true,
            (Role::Server, Outbound::Properties { .. } | Outbound::Value { .. }) => true,
            (Role::Server, _) => false,
            (Role::Client, Outbound::Announce(_) | Outbound::Unannounce(_)) => false,
            (Role::Client, Outbound::Properties { origin, .. } | Outbound::Value { origin, .. }) => {
                origin.is_local()
            }
            (Role::Client, _) => true,
        }
    }
}

/// What a listener is attached to.
#[derive(Debug, Clone)]
pub(crate) enum Scope {
    /// The topic (or prefix) a subscriber covers, with its delivery options.
    Subscriber {
        handle: SubscriberHandle,
        info: SubscriberInfo,
    },
    /// Every topic whose name starts with one of these prefixes.
    Prefixes(Vec<String>),
    /// Connection state changes.
    Connections,
}

impl Scope {
    fn covers(&self, topic: TopicHandle, name: &str) -> bool {
        match self {
            Scope::Subscriber { info, .. } => {
                if info.options.prefix {
                    name.starts_with(info.name.as_str())
                } else {
                    info.topic == topic
                }
            }
            Scope::Prefixes(prefixes) => prefixes.iter().any(|p| name.starts_with(p.as_str())),
            Scope::Connections => false,
        }
    }

    fn wants_values(&self) -> bool {
        match self {
            Scope::Subscriber { info, .. } => !info.options.topics_only,
            Scope::Prefixes(_) => true,
            Scope::Connections => false,
        }
    }

    pub(crate) fn subscriber(&self) -> Option<SubscriberHandle> {
        match self {
            Scope::Subscriber { handle, .. } => Some(*handle),
            _ => None,
        }
    }
}

/// Where a listener's events go.
pub enum ListenerTarget {
    /// Run on the instance's delivery thread.
    Callback(Callback),
    /// Queue on a poller for the application to drain.
    Poller(PollerHandle),
}

enum Sink {
    Callback,
    Poller(PollerHandle, Arc<EventQueue>),
}

struct ListenerRecord {
    scope: Scope,
    mask: EventMask,
    sink: Sink,
    period: Option<Duration>,
    send_all: bool,
    pending: Vec<Event>,
    next_flush: Instant,
}

impl ListenerRecord {
    fn route(&mut self, event: Event, delivery: &EventQueue) {
        if self.period.is_none() {
            self.deliver(event, delivery);
            return;
        }

        if !self.send_all {
            if let Some(topic) = event.value().map(|v| v.topic) {
                self.pending
                    .retain(|p| p.value().is_none_or(|v| v.topic != topic));
            }
        }
        self.pending.push(event);
    }

    fn deliver(&self, event: Event, delivery: &EventQueue) {
        match &self.sink {
            Sink::Callback => delivery.push(event),
            Sink::Poller(_, queue) => queue.push(event),
        };
    }

    fn flush(&mut self, delivery: &EventQueue) {
        for event in std::mem::take(&mut self.pending) {
            self.deliver(event, delivery);
        }
    }
}

#[derive(Default)]
struct DispatcherInner {
    listeners: HandleArena<ListenerRecord>,
    pollers: HandleArena<Arc<EventQueue>>,
}

struct NetworkSink {
    role: Role,
    tx: UnboundedSender<Outbound>,
}

#[derive(Default)]
struct FlushState {
    stop: bool,
    dirty: bool,
}

/// Routes change notifications of one instance.
pub struct Dispatcher {
    inner: Mutex<DispatcherInner>,
    callbacks: RwLock<HashMap<ListenerHandle, Callback>>,
    delivery: Arc<EventQueue>,
    network: Mutex<Option<NetworkSink>>,
    flush_state: Mutex<FlushState>,
    flush_wake: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &self.listener_count())
            .field("queued", &self.delivery.len())
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher and start its delivery and flusher threads.
    pub fn start() -> TableResult<Arc<Self>> {
        let dispatcher = Arc::new(Self {
            inner: Mutex::new(DispatcherInner::default()),
            callbacks: RwLock::new(HashMap::new()),
            delivery: Arc::new(EventQueue::new(DEFAULT_QUEUE_CAPACITY)),
            network: Mutex::new(None),
            flush_state: Mutex::new(FlushState::default()),
            flush_wake: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        });

        let delivery = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::Builder::new()
                .name("nt-delivery".to_string())
                .spawn(move || dispatcher.run_delivery())?
        };
        let flusher = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::Builder::new()
                .name("nt-flusher".to_string())
                .spawn(move || dispatcher.run_flusher())?
        };
        dispatcher.threads.lock().extend([delivery, flusher]);
        Ok(dispatcher)
    }

    /// Stop both threads. Queued callback events are still delivered.
    pub fn shutdown(&self) {
        {
            let mut state = self.flush_state.lock();
            state.stop = true;
        }
        self.flush_wake.notify_all();
        self.delivery.close();
        self.detach_network();

        let current = thread::current().id();
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            // A callback may tear the instance down from the delivery thread.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("dispatcher thread panicked");
            }
        }

        let inner = self.inner.lock();
        for (_, queue) in inner.pollers.iter() {
            queue.close();
        }
    }

    fn run_delivery(&self) {
        loop {
            let events = self.delivery.poll(Duration::from_millis(200));
            if events.is_empty() {
                if self.delivery.is_closed() {
                    break;
                }
                continue;
            }

            for event in events {
                let callback = self.callbacks.read().get(&event.listener).cloned();
                let Some(callback) = callback else {
                    tracing::trace!(listener = %event.listener, "dropping event for removed listener");
                    continue;
                };
                if panic::catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                    tracing::error!(listener = %event.listener, "listener callback panicked");
                }
            }
        }
        tracing::debug!("delivery thread stopped");
    }

    fn run_flusher(&self) {
        loop {
            let now = Instant::now();
            let next = self.flush_due(now);

            let mut state = self.flush_state.lock();
            if state.stop {
                break;
            }
            if !state.dirty {
                let deadline = next.unwrap_or(now + IDLE_FLUSH_WAIT);
                self.flush_wake.wait_until(&mut state, deadline);
            }
            state.dirty = false;
            if state.stop {
                break;
            }
        }
        tracing::debug!("flusher thread stopped");
    }

    /// Flush every periodic listener that is due; returns the next deadline.
    fn flush_due(&self, now: Instant) -> Option<Instant> {
        let mut inner = self.inner.lock();
        let mut next: Option<Instant> = None;
        for (_, record) in inner.listeners.iter_mut() {
            let Some(period) = record.period else {
                continue;
            };
            if record.next_flush <= now {
                record.flush(&self.delivery);
                while record.next_flush <= now {
                    record.next_flush += period;
                }
            }
            next = Some(next.map_or(record.next_flush, |n| n.min(record.next_flush)));
        }
        next
    }

    fn wake_flusher(&self) {
        self.flush_state.lock().dirty = true;
        self.flush_wake.notify_all();
    }

    /// Route outbound messages to the network layer.
    pub fn attach_network(&self, role: Role, tx: UnboundedSender<Outbound>) {
        *self.network.lock() = Some(NetworkSink { role, tx });
    }

    pub fn detach_network(&self) {
        self.network.lock().take();
    }

    /// Hand a message to the network layer, honoring the role's relay rules.
    pub fn send_outbound(&self, message: Outbound) {
        let network = self.network.lock();
        let Some(sink) = network.as_ref() else {
            return;
        };
        if !message.relayed_by(sink.role) {
            return;
        }
        if sink.tx.send(message).is_err() {
            tracing::trace!("network layer gone; outbound message dropped");
        }
    }

    /// Create an event queue for application-driven polling.
    pub fn create_poller(&self, capacity: usize) -> PollerHandle {
        let queue = Arc::new(EventQueue::new(capacity));
        PollerHandle(self.inner.lock().pollers.insert(queue))
    }

    pub fn poller_queue(&self, poller: PollerHandle) -> TableResult<Arc<EventQueue>> {
        self.inner
            .lock()
            .pollers
            .get(poller.0)
            .cloned()
            .ok_or_else(|| TableError::invalid_handle(poller))
    }

    /// Destroy a poller and every listener feeding it.
    ///
    /// Returns the removed listeners, or `None` for an unknown poller.
    pub fn destroy_poller(&self, poller: PollerHandle) -> Option<Vec<ListenerHandle>> {
        let mut inner = self.inner.lock();
        let queue = inner.pollers.remove(poller.0)?;
        queue.close();

        let feeding: Vec<ListenerHandle> = inner
            .listeners
            .iter()
            .filter(|(_, record)| matches!(record.sink, Sink::Poller(p, _) if p == poller))
            .map(|(raw, _)| ListenerHandle(raw))
            .collect();
        for listener in &feeding {
            inner.listeners.remove(listener.0);
        }
        Some(feeding)
    }

    /// Register a listener.
    pub(crate) fn add_listener(
        &self,
        scope: Scope,
        mask: EventMask,
        target: ListenerTarget,
    ) -> TableResult<ListenerHandle> {
        let (period, send_all) = match &scope {
            Scope::Subscriber { info, .. } => (info.options.period(), info.options.send_all),
            _ => (None, true),
        };

        let mut inner = self.inner.lock();
        let (sink, callback) = match target {
            ListenerTarget::Callback(callback) => (Sink::Callback, Some(callback)),
            ListenerTarget::Poller(poller) => {
                let queue = inner
                    .pollers
                    .get(poller.0)
                    .cloned()
                    .ok_or_else(|| TableError::invalid_handle(poller))?;
                (Sink::Poller(poller, queue), None)
            }
        };

        let handle = ListenerHandle(inner.listeners.insert(ListenerRecord {
            scope,
            mask,
            sink,
            period,
            send_all,
            pending: Vec::new(),
            next_flush: Instant::now() + period.unwrap_or_default(),
        }));
        if let Some(callback) = callback {
            self.callbacks.write().insert(handle, callback);
        }
        drop(inner);

        if period.is_some() {
            self.wake_flusher();
        }
        tracing::debug!(listener = %handle, "listener registered");
        Ok(handle)
    }

    /// Remove a listener. Events already queued for it are dropped.
    pub fn remove_listener(&self, listener: ListenerHandle) -> bool {
        let removed = self.inner.lock().listeners.remove(listener.0).is_some();
        self.callbacks.write().remove(&listener);
        removed
    }

    /// Remove every listener attached to a released subscriber.
    pub fn remove_subscriber_listeners(&self, subscriber: SubscriberHandle) {
        let attached: Vec<ListenerHandle> = {
            let inner = self.inner.lock();
            inner
                .listeners
                .iter()
                .filter(|(_, record)| record.scope.subscriber() == Some(subscriber))
                .map(|(raw, _)| ListenerHandle(raw))
                .collect()
        };
        for listener in attached {
            self.remove_listener(listener);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Deliver events to one listener right away, bypassing its period.
    pub(crate) fn deliver_now(&self, listener: ListenerHandle, events: Vec<(EventKind, EventData)>) {
        let inner = self.inner.lock();
        let Some(record) = inner.listeners.get(listener.0) else {
            return;
        };
        for (kind, data) in events {
            record.deliver(
                Event {
                    listener,
                    kind,
                    data,
                },
                &self.delivery,
            );
        }
    }

    /// Fan out an applied value change.
    pub fn notify_value(
        &self,
        topic: TopicHandle,
        name: &str,
        value: &Value,
        sequence: u64,
        origin: WriteOrigin,
    ) {
        let kind = if origin.is_local() {
            EventKind::ValueLocal
        } else {
            EventKind::ValueRemote
        };

        {
            let mut inner = self.inner.lock();
            for (raw, record) in inner.listeners.iter_mut() {
                if !record.mask.contains(kind.mask())
                    || !record.scope.wants_values()
                    || !record.scope.covers(topic, name)
                {
                    continue;
                }
                let event = Event {
                    listener: ListenerHandle(raw),
                    kind,
                    data: EventData::Value(ValueEvent {
                        topic,
                        name: name.to_string(),
                        value: value.clone(),
                        sequence,
                        subscriber: record.scope.subscriber(),
                    }),
                };
                record.route(event, &self.delivery);
            }
        }

        self.send_outbound(Outbound::Value {
            topic,
            name: name.to_string(),
            value: value.clone(),
            origin,
        });
    }

    /// Fan out directory transitions.
    pub fn notify_directory(&self, events: &[DirectoryEvent], origin: WriteOrigin) {
        for event in events {
            let (kind, info) = match event {
                DirectoryEvent::Announced(info) => (Some(EventKind::Publish), info),
                DirectoryEvent::Unannounced(info) => (Some(EventKind::Unpublish), info),
                DirectoryEvent::PropertiesChanged { info, .. } => (Some(EventKind::Properties), info),
                DirectoryEvent::Published(info)
                | DirectoryEvent::Unpublished(info)
                | DirectoryEvent::TypeBound(info) => (None, info),
            };

            if let Some(kind) = kind {
                let mut inner = self.inner.lock();
                for (raw, record) in inner.listeners.iter_mut() {
                    if !record.mask.contains(kind.mask())
                        || !record.scope.covers(info.handle, &info.name)
                    {
                        continue;
                    }
                    let event = Event {
                        listener: ListenerHandle(raw),
                        kind,
                        data: EventData::Topic(info.clone()),
                    };
                    record.route(event, &self.delivery);
                }
            }

            let outbound = match event {
                DirectoryEvent::Announced(info) | DirectoryEvent::TypeBound(info) => {
                    Outbound::Announce(info.clone())
                }
                DirectoryEvent::Unannounced(info) => Outbound::Unannounce(info.clone()),
                DirectoryEvent::Published(info) => Outbound::Publish(info.clone()),
                DirectoryEvent::Unpublished(info) => Outbound::Unpublish(info.clone()),
                DirectoryEvent::PropertiesChanged { info, update } => Outbound::Properties {
                    info: info.clone(),
                    update: update.clone(),
                    origin,
                },
            };
            self.send_outbound(outbound);
        }
    }

    /// Fan out a connection state change.
    pub fn notify_connection(&self, kind: EventKind, info: &ConnectionInfo) {
        let inner = self.inner.lock();
        for (raw, record) in inner.listeners.iter() {
            if !matches!(record.scope, Scope::Connections) || !record.mask.contains(kind.mask()) {
                continue;
            }
            record.deliver(
                Event {
                    listener: ListenerHandle(raw),
                    kind,
                    data: EventData::Connection(info.clone()),
                },
                &self.delivery,
            );
        }
    }
}
