/// The instance: one independent replicated table.
///
/// An [`Instance`] bundles a directory, a storage engine, a dispatcher with
/// its delivery threads, and optionally a running server or client. It is
/// cheap to clone; every clone refers to the same tables. Instances are
/// created and destroyed explicitly. [`default_instance`] is only a lazily
/// created convenience for applications that need a single one.
///
/// # Example
///
/// ```no_run
/// use nettables::{Instance, SubscribeOptions, Value, ValueKind};
/// use serde_json::Map;
///
/// # fn main() -> nettables::TableResult<()> {
/// let nt = Instance::create()?;
/// let speed = nt.topic("/drive/speed");
/// let publisher = nt.publish(speed, ValueKind::Double, Map::new())?;
/// let subscriber = nt.subscribe(speed, SubscribeOptions::new())?;
///
/// nt.set(publisher, Value::double(1.5))?;
/// assert_eq!(nt.get(subscriber)?.as_f64(), Some(1.5));
/// nt.destroy();
/// # Ok(())
/// # }
/// ```
use crate::clock::{ClockOffset, now_micros};
use crate::config::{NetworkConfig, Role};
use crate::directory::{
    Directory, DirectoryEvent, PROP_PERSISTENT, PROP_RETAINED, PublishOptions, SubscribeOptions,
    TopicInfo,
};
use crate::dispatcher::{Dispatcher, ListenerTarget, Outbound, Scope};
use crate::error::{TableError, TableResult};
use crate::event::{
    DEFAULT_QUEUE_CAPACITY, Event, EventData, EventKind, EventMask, ValueEvent,
};
use crate::handle::{
    ConnectionId, EntryHandle, Handle, ListenerHandle, PollerHandle, PublisherHandle,
    SubscriberHandle, TopicHandle,
};
use crate::network::NetworkHandle;
use crate::persistence::{self, Autosave, LoadReport, PersistedTopic};
use crate::protocol::{ConnectionInfo, ConnectionState};
use crate::storage::{HistoryItem, SetOutcome, StorageEngine, WriteOrigin};
use crate::value::{Value, ValueKind};
use parking_lot::Mutex;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use uuid::Uuid;

/// What a listener is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerSource {
    /// The topics a subscriber covers, with its delivery options.
    Subscriber(SubscriberHandle),
    /// The topic of an entry.
    Entry(EntryHandle),
    /// Every topic whose name starts with one of the prefixes.
    Prefixes(Vec<String>),
    /// Connection state changes.
    Connections,
}

enum NetworkSlot {
    Idle,
    Starting,
    Running(NetworkHandle),
}

/// Shared state behind every clone of an [`Instance`].
pub(crate) struct InstanceCore {
    pub(crate) id: Uuid,
    pub(crate) directory: Directory,
    pub(crate) storage: StorageEngine,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) clock: ClockOffset,
    network: Mutex<NetworkSlot>,
    autosave: Mutex<Option<Autosave>>,
    persistent_dirty: AtomicBool,
    /// Queued-read cursor per subscriber.
    cursors: Mutex<HashMap<SubscriberHandle, u64>>,
    /// Subscribers created on behalf of prefix listeners.
    listener_subscribers: Mutex<HashMap<ListenerHandle, Vec<SubscriberHandle>>>,
    destroyed: AtomicBool,
}

impl InstanceCore {
    fn new() -> TableResult<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            directory: Directory::new(),
            storage: StorageEngine::new(),
            dispatcher: Dispatcher::start()?,
            clock: ClockOffset::new(),
            network: Mutex::new(NetworkSlot::Idle),
            autosave: Mutex::new(None),
            persistent_dirty: AtomicBool::new(false),
            cursors: Mutex::new(HashMap::new()),
            listener_subscribers: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Apply side effects of directory transitions, then fan them out.
    pub(crate) fn dispatch_directory(&self, events: Vec<DirectoryEvent>, origin: WriteOrigin) {
        if events.is_empty() {
            return;
        }
        for event in &events {
            match event {
                DirectoryEvent::Unannounced(info) => {
                    tracing::debug!(topic = %info.name, "topic unannounced");
                    self.storage.clear(info.handle);
                }
                DirectoryEvent::PropertiesChanged { info, update } => {
                    if info.is_persistent() || update.contains_key(PROP_PERSISTENT) {
                        self.mark_persistent_dirty();
                    }
                }
                DirectoryEvent::Announced(info) => {
                    tracing::debug!(topic = %info.name, kind = %info.kind, "topic announced");
                }
                DirectoryEvent::TypeBound(info) => {
                    tracing::debug!(topic = %info.name, kind = %info.kind, "topic type bound");
                }
                DirectoryEvent::Published(_) | DirectoryEvent::Unpublished(_) => {}
            }
        }
        self.dispatcher.notify_directory(&events, origin);
    }

    fn value_applied(
        &self,
        topic: TopicHandle,
        name: &str,
        value: &Value,
        sequence: u64,
        origin: WriteOrigin,
    ) {
        if self.directory.is_persistent(topic) {
            self.mark_persistent_dirty();
        }
        self.dispatcher
            .notify_value(topic, name, value, sequence, origin);
    }

    /// Write from this process. Unstamped values take the current time.
    pub(crate) fn set_local(
        &self,
        topic: TopicHandle,
        value: Value,
        keep_duplicates: bool,
    ) -> TableResult<SetOutcome> {
        let value = if value.time() == 0 {
            value.with_time(now_micros())
        } else {
            value
        };
        let name = self.directory.topic_name(topic)?;
        let kind = self.directory.topic_kind(topic)?;
        let outcome = self.storage.set_value(
            topic,
            &name,
            kind,
            value.clone(),
            WriteOrigin::Local,
            keep_duplicates,
        )?;
        if let SetOutcome::Applied(sequence) = outcome {
            self.value_applied(topic, &name, &value, sequence, WriteOrigin::Local);
        }
        Ok(outcome)
    }

    /// A peer started publishing a topic.
    pub(crate) fn apply_remote_announce(
        &self,
        connection: ConnectionId,
        name: &str,
        kind: ValueKind,
        properties: &JsonMap<String, JsonValue>,
    ) -> TableResult<TopicHandle> {
        let (topic, event) = self
            .directory
            .remote_publish(connection, name, kind, properties)?;
        self.dispatch_directory(event.into_iter().collect(), WriteOrigin::Remote(connection));
        Ok(topic)
    }

    pub(crate) fn apply_remote_unannounce(&self, connection: ConnectionId, topic: TopicHandle) {
        let event = self.directory.remote_unpublish(connection, topic);
        self.dispatch_directory(event.into_iter().collect(), WriteOrigin::Remote(connection));
    }

    pub(crate) fn apply_remote_properties(
        &self,
        connection: ConnectionId,
        name: &str,
        update: JsonMap<String, JsonValue>,
    ) -> TableResult<()> {
        let topic = self
            .directory
            .find_topic(name)
            .ok_or_else(|| TableError::invalid_data(format!("unknown topic '{}'", name)))?;
        let events = self.directory.set_properties(topic, update)?;
        self.dispatch_directory(events, WriteOrigin::Remote(connection));
        Ok(())
    }

    /// A value from a peer. Duplicates are kept so a peer's repeated writes
    /// are all observed; stale ones are dropped quietly.
    pub(crate) fn apply_remote_value(
        &self,
        connection: ConnectionId,
        topic: TopicHandle,
        value: Value,
    ) -> TableResult<SetOutcome> {
        let origin = WriteOrigin::Remote(connection);
        let name = self.directory.topic_name(topic)?;
        let kind = self.directory.topic_kind(topic)?;
        let outcome = self
            .storage
            .set_value(topic, &name, kind, value.clone(), origin, true)?;
        match outcome {
            SetOutcome::Applied(sequence) => {
                self.value_applied(topic, &name, &value, sequence, origin)
            }
            SetOutcome::Stale => {
                tracing::trace!(topic = %name, connection = %connection, "stale remote value dropped")
            }
            SetOutcome::Unchanged => {}
        }
        Ok(outcome)
    }

    /// Forget everything a closed link contributed.
    pub(crate) fn connection_closed(&self, connection: ConnectionId) {
        let events = self.directory.drop_connection(connection);
        self.dispatch_directory(events, WriteOrigin::Remote(connection));
    }

    /// Recreate one topic from a persistence record.
    pub(crate) fn restore_persistent(&self, record: &PersistedTopic) -> TableResult<()> {
        let value = if record.value.is_null() {
            None
        } else {
            Some(Value::from_json(record.kind, &record.value, now_micros())?)
        };
        let (topic, event) = self
            .directory
            .restore(&record.name, record.kind, &record.properties)?;
        self.dispatch_directory(event.into_iter().collect(), WriteOrigin::Local);
        if let Some(value) = value {
            self.set_local(topic, value, true)?;
        }
        Ok(())
    }

    pub(crate) fn take_persistent_dirty(&self) -> bool {
        self.persistent_dirty.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn mark_persistent_dirty(&self) {
        self.persistent_dirty.store(true, Ordering::Release);
    }
}

impl Drop for InstanceCore {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
    }
}

/// Handle to one table instance.
#[derive(Clone)]
pub struct Instance {
    core: Arc<InstanceCore>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.core.id)
            .field("topics", &self.core.directory.topic_count())
            .finish()
    }
}

static DEFAULT_INSTANCE: OnceLock<Instance> = OnceLock::new();

/// The process-wide default instance, created on first use.
pub fn default_instance() -> TableResult<Instance> {
    if let Some(instance) = DEFAULT_INSTANCE.get() {
        return Ok(instance.clone());
    }
    let created = Instance::create()?;
    let winner = DEFAULT_INSTANCE.get_or_init(|| created.clone());
    if !Arc::ptr_eq(&winner.core, &created.core) {
        created.destroy();
    }
    Ok(winner.clone())
}

impl Instance {
    /// Create an instance and start its delivery threads.
    pub fn create() -> TableResult<Self> {
        let core = Arc::new(InstanceCore::new()?);
        tracing::debug!(instance = %core.id, "instance created");
        Ok(Self { core })
    }

    /// Tear the instance down: stop networking and autosave, close pollers
    /// and stop the delivery threads. Calling it again does nothing.
    pub fn destroy(&self) {
        if self.core.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let network = std::mem::replace(&mut *self.core.network.lock(), NetworkSlot::Idle);
        if let NetworkSlot::Running(handle) = network {
            handle.signal_stop();
        }
        if let Some(autosave) = self.core.autosave.lock().take() {
            autosave.signal_stop();
        }
        self.core.dispatcher.detach_network();
        self.core.dispatcher.shutdown();
        tracing::debug!(instance = %self.core.id, "instance destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.core.destroyed.load(Ordering::Acquire)
    }

    /// Identifier sent to peers in the handshake.
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    // ─────────────────────────────────────────────────────────────────────
    // Topics
    // ─────────────────────────────────────────────────────────────────────

    /// Get or create the topic `name`. Creating does not announce it.
    pub fn topic(&self, name: &str) -> TopicHandle {
        self.core.directory.get_or_create_topic(name)
    }

    pub fn find_topic(&self, name: &str) -> Option<TopicHandle> {
        self.core.directory.find_topic(name)
    }

    pub fn topic_info(&self, topic: TopicHandle) -> TableResult<TopicInfo> {
        self.core.directory.topic_info(topic)
    }

    /// Announced topics whose name starts with `prefix`, sorted by name.
    pub fn topics(&self, prefix: &str) -> Vec<TopicInfo> {
        self.core.directory.topics_with_prefix(prefix)
    }

    /// Bind a topic's type ahead of publishing.
    pub fn set_type(&self, topic: TopicHandle, kind: ValueKind) -> TableResult<()> {
        let event = self.core.directory.set_type(topic, kind)?;
        self.core
            .dispatch_directory(event.into_iter().collect(), WriteOrigin::Local);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Publishers, subscribers, entries
    // ─────────────────────────────────────────────────────────────────────

    /// Register a publisher, binding the topic to `kind`.
    ///
    /// `properties` apply if this publisher is the one announcing the topic.
    pub fn publish(
        &self,
        topic: TopicHandle,
        kind: ValueKind,
        properties: JsonMap<String, JsonValue>,
    ) -> TableResult<PublisherHandle> {
        self.publish_with(topic, kind, properties, PublishOptions::default())
    }

    pub fn publish_with(
        &self,
        topic: TopicHandle,
        kind: ValueKind,
        properties: JsonMap<String, JsonValue>,
        options: PublishOptions,
    ) -> TableResult<PublisherHandle> {
        let (publisher, events) = self
            .core
            .directory
            .publish(topic, kind, properties, options)?;
        self.core.dispatch_directory(events, WriteOrigin::Local);
        Ok(publisher)
    }

    /// Register a subscriber. With a client running, the subscription is
    /// also registered with the server.
    pub fn subscribe(
        &self,
        topic: TopicHandle,
        options: SubscribeOptions,
    ) -> TableResult<SubscriberHandle> {
        let depth = options.poll_storage;
        let (subscriber, event) = self.core.directory.subscribe(topic, options)?;
        if depth > 1 {
            self.core.storage.ensure_depth(topic, depth);
        }
        self.core
            .dispatch_directory(event.into_iter().collect(), WriteOrigin::Local);
        self.announce_subscriber(subscriber)?;
        Ok(subscriber)
    }

    fn announce_subscriber(&self, subscriber: SubscriberHandle) -> TableResult<()> {
        let info = self.core.directory.subscriber(subscriber)?;
        self.core
            .dispatcher
            .send_outbound(Outbound::Subscribe { subscriber, info });
        Ok(())
    }

    /// Get an entry on `name`: a subscriber now and a publisher on first write.
    pub fn get_entry(&self, name: &str) -> TableResult<EntryHandle> {
        self.get_entry_with(name, SubscribeOptions::default())
    }

    pub fn get_entry_with(&self, name: &str, options: SubscribeOptions) -> TableResult<EntryHandle> {
        let topic = self.topic(name);
        let (entry, subscriber, event) = self.core.directory.create_entry(topic, options)?;
        self.core
            .dispatch_directory(event.into_iter().collect(), WriteOrigin::Local);
        self.announce_subscriber(subscriber)?;
        Ok(entry)
    }

    /// Release a publisher, subscriber, entry, listener or poller.
    ///
    /// Releasing twice, or releasing a stale handle, is a no-op.
    pub fn release(&self, handle: impl Into<Handle>) {
        match handle.into() {
            Handle::Publisher(publisher) => self.release_publisher(publisher),
            Handle::Subscriber(subscriber) => self.release_subscriber(subscriber),
            Handle::Entry(entry) => {
                if let Some(info) = self.core.directory.remove_entry(entry) {
                    if let Some(publisher) = info.publisher {
                        self.release_publisher(publisher);
                    }
                    self.release_subscriber(info.subscriber);
                }
            }
            Handle::Listener(listener) => {
                self.remove_listener(listener);
            }
            Handle::Poller(poller) => {
                self.destroy_poller(poller);
            }
        }
    }

    fn release_publisher(&self, publisher: PublisherHandle) {
        let events = self.core.directory.release_publisher(publisher);
        self.core.dispatch_directory(events, WriteOrigin::Local);
    }

    fn release_subscriber(&self, subscriber: SubscriberHandle) {
        let Some((_, event)) = self.core.directory.release_subscriber(subscriber) else {
            return;
        };
        self.core.dispatcher.remove_subscriber_listeners(subscriber);
        self.core.cursors.lock().remove(&subscriber);
        self.core
            .dispatcher
            .send_outbound(Outbound::Unsubscribe { subscriber });
        self.core
            .dispatch_directory(event.into_iter().collect(), WriteOrigin::Local);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Values
    // ─────────────────────────────────────────────────────────────────────

    /// Write a value through a publisher.
    ///
    /// Fails with `TypeMismatch` if the value's kind differs from the
    /// topic's. Unless the publisher keeps duplicates, a value equal to the
    /// current one is accepted but not propagated.
    pub fn set(&self, publisher: PublisherHandle, value: Value) -> TableResult<()> {
        let info = self.core.directory.publisher(publisher)?;
        self.core
            .set_local(info.topic, value, info.options.keep_duplicates)?;
        Ok(())
    }

    /// Write through an entry, creating its publisher on first use.
    pub fn set_entry(&self, entry: EntryHandle, value: Value) -> TableResult<()> {
        let info = self.core.directory.entry(entry)?;
        let publisher = match info.publisher {
            Some(publisher) => publisher,
            None => {
                let publisher = self.publish(info.topic, value.kind(), JsonMap::new())?;
                self.core
                    .directory
                    .attach_entry_publisher(entry, publisher)?;
                publisher
            }
        };
        self.set(publisher, value)
    }

    /// Current value seen by a subscriber; empty if never published.
    pub fn get(&self, subscriber: SubscriberHandle) -> TableResult<Value> {
        let info = self.core.directory.subscriber(subscriber)?;
        Ok(self.core.storage.get_value(info.topic))
    }

    pub fn get_entry_value(&self, entry: EntryHandle) -> TableResult<Value> {
        let info = self.core.directory.entry(entry)?;
        Ok(self.core.storage.get_value(info.topic))
    }

    /// Current value of a topic; empty if never published.
    pub fn value(&self, topic: TopicHandle) -> TableResult<Value> {
        self.core.directory.topic_name(topic)?;
        Ok(self.core.storage.get_value(topic))
    }

    /// Updates a queued subscriber has not read yet, oldest first.
    ///
    /// At most `poll_storage` items are returned; older unread updates that
    /// fell out of the history are skipped.
    pub fn read_queue(&self, subscriber: SubscriberHandle) -> TableResult<Vec<HistoryItem>> {
        let info = self.core.directory.subscriber(subscriber)?;
        let mut cursors = self.core.cursors.lock();
        let since = cursors.get(&subscriber).copied().unwrap_or(0);
        let mut items = self.core.storage.get_history(info.topic, since);
        let depth = info.options.poll_storage.max(1);
        if items.len() > depth {
            items.drain(..items.len() - depth);
        }
        if let Some(last) = items.last() {
            cursors.insert(subscriber, last.sequence);
        }
        Ok(items)
    }

    /// Retained updates of a topic newer than `since`, oldest first.
    pub fn history(&self, topic: TopicHandle, since: u64) -> TableResult<Vec<HistoryItem>> {
        self.core.directory.topic_name(topic)?;
        Ok(self.core.storage.get_history(topic, since))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Properties
    // ─────────────────────────────────────────────────────────────────────

    pub fn properties(&self, topic: TopicHandle) -> TableResult<JsonMap<String, JsonValue>> {
        self.core.directory.properties(topic)
    }

    /// Merge `update` into a topic's properties; `null` members delete keys.
    pub fn set_properties(
        &self,
        topic: TopicHandle,
        update: JsonMap<String, JsonValue>,
    ) -> TableResult<()> {
        let events = self.core.directory.set_properties(topic, update)?;
        self.core.dispatch_directory(events, WriteOrigin::Local);
        Ok(())
    }

    pub fn set_persistent(&self, topic: TopicHandle, persistent: bool) -> TableResult<()> {
        self.set_flag(topic, PROP_PERSISTENT, persistent)
    }

    pub fn set_retained(&self, topic: TopicHandle, retained: bool) -> TableResult<()> {
        self.set_flag(topic, PROP_RETAINED, retained)
    }

    fn set_flag(&self, topic: TopicHandle, key: &str, on: bool) -> TableResult<()> {
        let mut update = JsonMap::new();
        update.insert(
            key.to_string(),
            if on { JsonValue::Bool(true) } else { JsonValue::Null },
        );
        self.set_properties(topic, update)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Listeners
    // ─────────────────────────────────────────────────────────────────────

    /// Run `callback` on the delivery thread for matching events.
    ///
    /// With [`EventMask::IMMEDIATE`] the current state is delivered once
    /// right away.
    pub fn add_listener<F>(
        &self,
        source: ListenerSource,
        mask: EventMask,
        callback: F,
    ) -> TableResult<ListenerHandle>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register_listener(source, mask, ListenerTarget::Callback(Arc::new(callback)))
    }

    /// Create a poller with the default capacity.
    pub fn create_poller(&self) -> PollerHandle {
        self.core.dispatcher.create_poller(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn create_poller_with_capacity(&self, capacity: usize) -> PollerHandle {
        self.core.dispatcher.create_poller(capacity)
    }

    /// Queue matching events on `poller`.
    pub fn add_poller_listener(
        &self,
        poller: PollerHandle,
        source: ListenerSource,
        mask: EventMask,
    ) -> TableResult<ListenerHandle> {
        self.register_listener(source, mask, ListenerTarget::Poller(poller))
    }

    /// Block up to `timeout` for events on `poller`, then drain them.
    ///
    /// This blocks the calling thread; from async code use
    /// `tokio::task::spawn_blocking`.
    pub fn read_poller(&self, poller: PollerHandle, timeout: Duration) -> TableResult<Vec<Event>> {
        Ok(self.core.dispatcher.poller_queue(poller)?.poll(timeout))
    }

    pub fn try_read_poller(&self, poller: PollerHandle) -> TableResult<Vec<Event>> {
        Ok(self.core.dispatcher.poller_queue(poller)?.try_poll())
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn remove_listener(&self, listener: ListenerHandle) -> bool {
        let removed = self.core.dispatcher.remove_listener(listener);
        self.release_listener_subscribers(listener);
        removed
    }

    /// Destroy a poller and the listeners feeding it.
    pub fn destroy_poller(&self, poller: PollerHandle) -> bool {
        match self.core.dispatcher.destroy_poller(poller) {
            Some(listeners) => {
                for listener in listeners {
                    self.release_listener_subscribers(listener);
                }
                true
            }
            None => false,
        }
    }

    fn release_listener_subscribers(&self, listener: ListenerHandle) {
        let internal = self.core.listener_subscribers.lock().remove(&listener);
        for subscriber in internal.into_iter().flatten() {
            self.release_subscriber(subscriber);
        }
    }

    fn register_listener(
        &self,
        source: ListenerSource,
        mask: EventMask,
        target: ListenerTarget,
    ) -> TableResult<ListenerHandle> {
        let (scope, internal) = self.resolve_source(source, mask)?;
        let listener = match self.core.dispatcher.add_listener(scope.clone(), mask, target) {
            Ok(listener) => listener,
            Err(e) => {
                for subscriber in internal {
                    self.release_subscriber(subscriber);
                }
                return Err(e);
            }
        };
        if !internal.is_empty() {
            self.core
                .listener_subscribers
                .lock()
                .insert(listener, internal);
        }

        if mask.contains(EventMask::IMMEDIATE) {
            let initial = self.initial_events(&scope, mask);
            self.core.dispatcher.deliver_now(listener, initial);
        }
        Ok(listener)
    }

    /// Resolve a listener source to a dispatcher scope.
    ///
    /// Prefix listeners get internal prefix subscribers so a client asks its
    /// server for those topics.
    fn resolve_source(
        &self,
        source: ListenerSource,
        mask: EventMask,
    ) -> TableResult<(Scope, Vec<SubscriberHandle>)> {
        match source {
            ListenerSource::Subscriber(handle) => {
                let info = self.core.directory.subscriber(handle)?;
                Ok((Scope::Subscriber { handle, info }, Vec::new()))
            }
            ListenerSource::Entry(entry) => {
                let handle = self.core.directory.entry(entry)?.subscriber;
                let info = self.core.directory.subscriber(handle)?;
                Ok((Scope::Subscriber { handle, info }, Vec::new()))
            }
            ListenerSource::Prefixes(prefixes) => {
                let mut options = SubscribeOptions::new().prefix();
                if !mask.intersects(EventMask::VALUE_ALL) {
                    options = options.topics_only();
                }
                let mut internal = Vec::with_capacity(prefixes.len());
                for prefix in &prefixes {
                    let topic = self.topic(prefix);
                    match self.subscribe(topic, options.clone()) {
                        Ok(subscriber) => internal.push(subscriber),
                        Err(e) => {
                            for subscriber in internal {
                                self.release_subscriber(subscriber);
                            }
                            return Err(e);
                        }
                    }
                }
                Ok((Scope::Prefixes(prefixes), internal))
            }
            ListenerSource::Connections => Ok((Scope::Connections, Vec::new())),
        }
    }

    fn initial_events(&self, scope: &Scope, mask: EventMask) -> Vec<(EventKind, EventData)> {
        let mut events = Vec::new();

        let (topics, wants_values) = match scope {
            Scope::Connections => {
                if mask.contains(EventMask::CONNECTED) {
                    events.extend(
                        self.connections()
                            .into_iter()
                            .filter(|info| info.state == ConnectionState::Synchronized)
                            .map(|info| (EventKind::Connected, EventData::Connection(info))),
                    );
                }
                return events;
            }
            Scope::Subscriber { info, .. } => {
                let topics = if info.options.prefix {
                    self.core.directory.topics_with_prefix(&info.name)
                } else {
                    self.core
                        .directory
                        .topic_info(info.topic)
                        .ok()
                        .filter(|topic| topic.announced)
                        .into_iter()
                        .collect()
                };
                (topics, !info.options.topics_only)
            }
            Scope::Prefixes(prefixes) => {
                let mut seen = HashSet::new();
                let topics = prefixes
                    .iter()
                    .flat_map(|prefix| self.core.directory.topics_with_prefix(prefix))
                    .filter(|topic| seen.insert(topic.handle))
                    .collect();
                (topics, true)
            }
        };

        let value_kind = if mask.contains(EventMask::VALUE_REMOTE) {
            Some(EventKind::ValueRemote)
        } else if mask.contains(EventMask::VALUE_LOCAL) {
            Some(EventKind::ValueLocal)
        } else {
            None
        };

        for topic in topics {
            if mask.contains(EventMask::PUBLISH) {
                events.push((EventKind::Publish, EventData::Topic(topic.clone())));
            }
            let Some(kind) = value_kind.filter(|_| wants_values) else {
                continue;
            };
            let value = self.core.storage.get_value(topic.handle);
            if value.is_empty() {
                continue;
            }
            events.push((
                kind,
                EventData::Value(ValueEvent {
                    topic: topic.handle,
                    name: topic.name,
                    sequence: self.core.storage.last_sequence(topic.handle),
                    value,
                    subscriber: scope.subscriber(),
                }),
            ));
        }
        events
    }

    // ─────────────────────────────────────────────────────────────────────
    // Networking
    // ─────────────────────────────────────────────────────────────────────

    fn reserve_network(&self) -> TableResult<()> {
        if self.is_destroyed() {
            return Err(TableError::Config("instance destroyed".to_string()));
        }
        let mut slot = self.core.network.lock();
        if !matches!(*slot, NetworkSlot::Idle) {
            return Err(TableError::AlreadyRunning);
        }
        *slot = NetworkSlot::Starting;
        Ok(())
    }

    fn finish_start(&self, started: TableResult<NetworkHandle>) -> TableResult<()> {
        let mut slot = self.core.network.lock();
        match started {
            Ok(handle) => {
                *slot = NetworkSlot::Running(handle);
                Ok(())
            }
            Err(e) => {
                *slot = NetworkSlot::Idle;
                self.core.dispatcher.detach_network();
                Err(e)
            }
        }
    }

    /// Start serving clients. Returns the bound address, which differs from
    /// the configured one when binding port 0.
    pub async fn start_server(&self, config: NetworkConfig) -> TableResult<SocketAddr> {
        self.reserve_network()?;
        let started = NetworkHandle::start_server(Arc::clone(&self.core), config).await;
        let addr = started.as_ref().ok().and_then(NetworkHandle::local_addr);
        self.finish_start(started)?;
        addr.ok_or_else(|| TableError::Config("server has no bound address".to_string()))
    }

    /// Start connecting to a server. Connection progress is reported through
    /// connection events.
    pub async fn start_client(&self, config: NetworkConfig) -> TableResult<()> {
        self.reserve_network()?;
        let started = NetworkHandle::start_client(Arc::clone(&self.core), config);
        self.finish_start(started)
    }

    /// Stop the server or client, waiting for its sessions to close.
    pub async fn stop_network(&self) {
        let network = std::mem::replace(&mut *self.core.network.lock(), NetworkSlot::Idle);
        let NetworkSlot::Running(handle) = network else {
            return;
        };
        self.core.dispatcher.detach_network();
        handle.stop().await;
    }

    /// The running network role, if any.
    pub fn network_role(&self) -> Option<Role> {
        match &*self.core.network.lock() {
            NetworkSlot::Running(handle) => Some(handle.role()),
            _ => None,
        }
    }

    /// Live links, sorted by connection id.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        match &*self.core.network.lock() {
            NetworkSlot::Running(handle) => handle.connections(),
            _ => Vec::new(),
        }
    }

    /// Whether at least one link is synchronized.
    pub fn is_connected(&self) -> bool {
        self.connections()
            .iter()
            .any(|info| info.state == ConnectionState::Synchronized)
    }

    /// Current estimate of server time minus local time, in microseconds.
    pub fn clock_offset(&self) -> i64 {
        self.core.clock.offset()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    /// Save every persistent topic to `path`. Returns the number saved.
    pub async fn save_persistent(&self, path: impl AsRef<Path>) -> TableResult<usize> {
        let saved = persistence::save(&self.core, path.as_ref()).await?;
        Ok(saved)
    }

    /// Restore persistent topics from `path`.
    pub async fn load_persistent(&self, path: impl AsRef<Path>) -> TableResult<LoadReport> {
        let report = persistence::load(&self.core, path.as_ref()).await?;
        // What was just loaded is what is on disk.
        self.core.take_persistent_dirty();
        Ok(report)
    }

    /// Save to `path` every `period` whenever persistent state changed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_autosave(&self, path: impl Into<PathBuf>, period: Duration) -> TableResult<()> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(TableError::Config(
                "autosave needs a running tokio runtime".to_string(),
            ));
        }
        let mut slot = self.core.autosave.lock();
        if slot.is_some() {
            return Err(TableError::AlreadyRunning);
        }
        *slot = Some(Autosave::spawn(Arc::clone(&self.core), path.into(), period));
        Ok(())
    }

    /// Stop autosave after a final save of outstanding changes.
    pub async fn stop_autosave(&self) {
        let autosave = self.core.autosave.lock().take();
        if let Some(autosave) = autosave {
            autosave.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: JsonValue) -> JsonMap<String, JsonValue> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_set_and_get() {
        let nt = Instance::create().unwrap();
        let topic = nt.topic("/a");
        let publisher = nt.publish(topic, ValueKind::Integer, JsonMap::new()).unwrap();
        let subscriber = nt.subscribe(topic, SubscribeOptions::new()).unwrap();

        assert!(nt.get(subscriber).unwrap().is_empty());
        nt.set(publisher, Value::integer(4)).unwrap();
        assert_eq!(nt.get(subscriber).unwrap().as_i64(), Some(4));
        nt.destroy();
    }

    #[test]
    fn test_type_mismatch_leaves_value() {
        let nt = Instance::create().unwrap();
        let topic = nt.topic("/t");
        nt.set_type(topic, ValueKind::Double).unwrap();
        let publisher = nt.publish(topic, ValueKind::Double, JsonMap::new()).unwrap();
        nt.set(publisher, Value::double(2.0)).unwrap();

        let err = nt.set(publisher, Value::string("x")).unwrap_err();
        assert!(matches!(err, TableError::TypeMismatch { .. }));
        assert_eq!(nt.value(topic).unwrap().as_f64(), Some(2.0));

        let err = nt.publish(topic, ValueKind::String, JsonMap::new()).unwrap_err();
        assert!(matches!(err, TableError::TypeMismatch { .. }));
        nt.destroy();
    }

    #[test]
    fn test_released_handles_are_invalid() {
        let nt = Instance::create().unwrap();
        let topic = nt.topic("/r");
        let publisher = nt.publish(topic, ValueKind::Boolean, JsonMap::new()).unwrap();
        nt.release(publisher);
        nt.release(publisher);

        let err = nt.set(publisher, Value::boolean(true)).unwrap_err();
        assert!(matches!(err, TableError::HandleInvalid { .. }));
        assert!(!nt.topic_info(topic).unwrap().announced);
        nt.destroy();
    }

    #[test]
    fn test_unannounce_clears_value_and_allows_new_type() {
        let nt = Instance::create().unwrap();
        let topic = nt.topic("/retype");
        let publisher = nt.publish(topic, ValueKind::Double, JsonMap::new()).unwrap();
        nt.set(publisher, Value::double(1.0)).unwrap();
        nt.release(publisher);
        assert!(nt.value(topic).unwrap().is_empty());

        let publisher = nt.publish(topic, ValueKind::String, JsonMap::new()).unwrap();
        nt.set(publisher, Value::string("now a string")).unwrap();
        assert_eq!(nt.value(topic).unwrap().as_str(), Some("now a string"));
        nt.destroy();
    }

    #[test]
    fn test_subscriber_keeps_value_after_publisher_release() {
        let nt = Instance::create().unwrap();
        let topic = nt.topic("/late");
        let subscriber = nt.subscribe(topic, SubscribeOptions::new()).unwrap();
        let publisher = nt.publish(topic, ValueKind::Integer, JsonMap::new()).unwrap();
        nt.set(publisher, Value::integer(9)).unwrap();
        nt.release(publisher);

        assert!(nt.topic_info(topic).unwrap().announced);
        assert_eq!(nt.get(subscriber).unwrap().as_i64(), Some(9));

        nt.release(subscriber);
        assert!(!nt.topic_info(topic).unwrap().announced);
        nt.destroy();
    }

    #[test]
    fn test_entry_creates_publisher_on_first_write() {
        let nt = Instance::create().unwrap();
        let entry = nt.get_entry("/entry").unwrap();
        assert!(nt.get_entry_value(entry).unwrap().is_empty());

        nt.set_entry(entry, Value::string("hi")).unwrap();
        nt.set_entry(entry, Value::string("there")).unwrap();
        assert_eq!(nt.get_entry_value(entry).unwrap().as_str(), Some("there"));

        let err = nt.set_entry(entry, Value::integer(1)).unwrap_err();
        assert!(matches!(err, TableError::TypeMismatch { .. }));

        nt.release(entry);
        assert!(nt.get_entry_value(entry).is_err());
        nt.destroy();
    }

    #[test]
    fn test_read_queue_returns_unread_updates() {
        let nt = Instance::create().unwrap();
        let topic = nt.topic("/q");
        let publisher = nt.publish(topic, ValueKind::Integer, JsonMap::new()).unwrap();
        let subscriber = nt
            .subscribe(topic, SubscribeOptions::new().with_poll_storage(3))
            .unwrap();

        for v in 1..=5 {
            nt.set(publisher, Value::integer(v)).unwrap();
        }
        let values: Vec<i64> = nt
            .read_queue(subscriber)
            .unwrap()
            .iter()
            .filter_map(|item| item.value.as_i64())
            .collect();
        assert_eq!(values, vec![3, 4, 5]);
        assert!(nt.read_queue(subscriber).unwrap().is_empty());

        nt.set(publisher, Value::integer(6)).unwrap();
        assert_eq!(nt.read_queue(subscriber).unwrap().len(), 1);
        nt.destroy();
    }

    #[test]
    fn test_duplicate_suppression() {
        let nt = Instance::create().unwrap();
        let topic = nt.topic("/dup");
        let publisher = nt.publish(topic, ValueKind::Integer, JsonMap::new()).unwrap();
        nt.set(publisher, Value::integer(1)).unwrap();
        nt.set(publisher, Value::integer(1)).unwrap();
        assert_eq!(nt.history(topic, 0).unwrap().len(), 1);

        let keeper = nt
            .publish_with(
                topic,
                ValueKind::Integer,
                JsonMap::new(),
                PublishOptions::new().with_keep_duplicates(true),
            )
            .unwrap();
        nt.set(keeper, Value::integer(1)).unwrap();
        assert_eq!(nt.history(topic, 0).unwrap().len(), 2);
        nt.destroy();
    }

    #[test]
    fn test_properties_merge_and_delete() {
        let nt = Instance::create().unwrap();
        let topic = nt.topic("/p");
        nt.publish(topic, ValueKind::Double, props(json!({"unit": "m"})))
            .unwrap();
        nt.set_properties(topic, props(json!({"max": 3, "unit": null})))
            .unwrap();
        assert_eq!(nt.properties(topic).unwrap(), props(json!({"max": 3})));

        nt.set_persistent(topic, true).unwrap();
        assert!(nt.topic_info(topic).unwrap().is_persistent());
        nt.set_persistent(topic, false).unwrap();
        assert!(!nt.topic_info(topic).unwrap().is_persistent());
        nt.destroy();
    }

    #[test]
    fn test_default_instance_is_shared() {
        let a = default_instance().unwrap();
        let b = default_instance().unwrap();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let nt = Instance::create().unwrap();
        let poller = nt.create_poller();
        nt.destroy();
        nt.destroy();
        assert!(nt.is_destroyed());
        assert!(nt.read_poller(poller, Duration::from_millis(1)).unwrap().is_empty());
    }
}
