/// Topic and entry directory.
///
/// The directory owns every topic's metadata (name, bound type, properties)
/// and the handle tables for publishers, subscribers and entries. It decides
/// when a topic becomes visible to the rest of the system (announced) and
/// when it disappears again (unannounced), and reports those transitions as
/// [`DirectoryEvent`]s so the caller can fan them out without holding the
/// directory lock.
///
/// # Topic lifecycle
///
/// - A topic is created name-only by [`Directory::get_or_create_topic`].
/// - The first publisher (local or remote) binds its type and announces it.
/// - When the last publisher and the last subscriber are gone and the topic
///   is neither `persistent` nor `retained`, the topic is unannounced: its
///   type and properties are reset so a differently-typed topic of the same
///   name may be published later. The handle itself stays valid.
use crate::error::{TableError, TableResult};
use crate::handle::{
    ConnectionId, EntryHandle, HandleArena, PublisherHandle, SubscriberHandle, TopicHandle,
};
use crate::value::ValueKind;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Well-known property: value survives restarts through the persistence file.
pub const PROP_PERSISTENT: &str = "persistent";
/// Well-known property: topic stays announced with no publishers.
pub const PROP_RETAINED: &str = "retained";

/// Options for a publisher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Forward values equal to the current one instead of dropping them.
    #[serde(default)]
    pub keep_duplicates: bool,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keep_duplicates(mut self, keep: bool) -> Self {
        self.keep_duplicates = keep;
        self
    }
}

/// Options for a subscriber.
///
/// These travel to the server with network subscriptions, so they are plain
/// serializable data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// Depth of the queued-read history. 1 means most-recent-only.
    #[serde(default = "default_poll_storage")]
    pub poll_storage: usize,
    /// Periodic delivery interval in milliseconds; `None` delivers immediately.
    #[serde(default)]
    pub period_ms: Option<u64>,
    /// Deliver every intermediate update instead of only the latest.
    #[serde(default)]
    pub send_all: bool,
    /// Match every topic whose name starts with the subscribed name.
    #[serde(default)]
    pub prefix: bool,
    /// Only receive announcements, never values.
    #[serde(default)]
    pub topics_only: bool,
}

fn default_poll_storage() -> usize {
    1
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            poll_storage: default_poll_storage(),
            period_ms: None,
            send_all: false,
            prefix: false,
            topics_only: false,
        }
    }
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep up to `depth` updates for queued reads.
    pub fn with_poll_storage(mut self, depth: usize) -> Self {
        self.poll_storage = depth.max(1);
        self
    }

    /// Deliver at most once per `period`, coalescing in between.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period_ms = Some(period.as_millis().max(1) as u64);
        self
    }

    pub fn with_send_all(mut self, send_all: bool) -> Self {
        self.send_all = send_all;
        self
    }

    pub fn prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    pub fn topics_only(mut self) -> Self {
        self.topics_only = true;
        self
    }

    pub fn period(&self) -> Option<Duration> {
        self.period_ms.map(Duration::from_millis)
    }

    /// Whether a subscription with these options on `pattern` covers `name`.
    pub fn matches(&self, pattern: &str, name: &str) -> bool {
        if self.prefix {
            name.starts_with(pattern)
        } else {
            name == pattern
        }
    }
}

/// Snapshot of a topic's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub handle: TopicHandle,
    pub name: String,
    pub kind: ValueKind,
    pub properties: JsonMap<String, JsonValue>,
    /// Local plus remote publishers.
    pub publishers: usize,
    pub subscribers: usize,
    pub announced: bool,
}

impl TopicInfo {
    pub fn is_persistent(&self) -> bool {
        flag(&self.properties, PROP_PERSISTENT)
    }

    pub fn is_retained(&self) -> bool {
        flag(&self.properties, PROP_RETAINED)
    }
}

/// A publisher's registration.
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherInfo {
    pub topic: TopicHandle,
    pub kind: ValueKind,
    pub options: PublishOptions,
}

/// A subscriber's registration.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberInfo {
    pub topic: TopicHandle,
    pub name: String,
    pub options: SubscribeOptions,
}

/// An entry's registration.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    pub topic: TopicHandle,
    pub subscriber: SubscriberHandle,
    pub publisher: Option<PublisherHandle>,
}

/// Visibility transitions produced by directory mutations.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    Announced(TopicInfo),
    Unannounced(TopicInfo),
    /// An already announced topic had its type bound.
    ///
    /// Subscribers can announce a topic before anyone has typed it; peers
    /// only hear about it once this fires.
    TypeBound(TopicInfo),
    /// The first local publisher registered on a topic.
    Published(TopicInfo),
    /// The last local publisher on a topic was released.
    Unpublished(TopicInfo),
    PropertiesChanged {
        info: TopicInfo,
        /// The applied update; `null` members were deletions.
        update: JsonMap<String, JsonValue>,
    },
}

#[derive(Debug)]
struct TopicRecord {
    name: String,
    kind: ValueKind,
    properties: JsonMap<String, JsonValue>,
    publishers: HashSet<PublisherHandle>,
    subscribers: HashSet<SubscriberHandle>,
    remote_publishers: HashMap<ConnectionId, usize>,
    announced: bool,
}

impl TopicRecord {
    fn new(name: String) -> Self {
        Self {
            name,
            kind: ValueKind::Unassigned,
            properties: JsonMap::new(),
            publishers: HashSet::new(),
            subscribers: HashSet::new(),
            remote_publishers: HashMap::new(),
            announced: false,
        }
    }

    fn publisher_count(&self) -> usize {
        self.publishers.len() + self.remote_publishers.values().sum::<usize>()
    }

    fn info(&self, handle: TopicHandle) -> TopicInfo {
        TopicInfo {
            handle,
            name: self.name.clone(),
            kind: self.kind,
            properties: self.properties.clone(),
            publishers: self.publisher_count(),
            subscribers: self.subscribers.len(),
            announced: self.announced,
        }
    }

    fn sticky(&self) -> bool {
        flag(&self.properties, PROP_PERSISTENT) || flag(&self.properties, PROP_RETAINED)
    }

    /// Bind the type. Returns true if the topic was untyped until now.
    fn bind(&mut self, kind: ValueKind) -> TableResult<bool> {
        if kind == ValueKind::Unassigned {
            return Err(TableError::invalid_data(format!(
                "cannot bind topic '{}' to the unassigned type",
                self.name
            )));
        }
        if self.kind == ValueKind::Unassigned {
            self.kind = kind;
            return Ok(true);
        }
        if self.kind != kind {
            return Err(TableError::TypeMismatch {
                topic: self.name.clone(),
                expected: self.kind.to_string(),
                actual: kind.to_string(),
            });
        }
        Ok(false)
    }
}

fn flag(properties: &JsonMap<String, JsonValue>, key: &str) -> bool {
    properties
        .get(key)
        .and_then(JsonValue::as_bool)
        .unwrap_or(false)
}

#[derive(Debug, Default)]
struct DirectoryInner {
    topics: HandleArena<TopicRecord>,
    by_name: HashMap<String, TopicHandle>,
    publishers: HandleArena<PublisherInfo>,
    subscribers: HandleArena<SubscriberInfo>,
    entries: HandleArena<EntryInfo>,
}

impl DirectoryInner {
    fn topic(&self, handle: TopicHandle) -> TableResult<&TopicRecord> {
        self.topics
            .get(handle.0)
            .ok_or_else(|| TableError::invalid_handle(handle))
    }

    fn topic_mut(&mut self, handle: TopicHandle) -> TableResult<&mut TopicRecord> {
        self.topics
            .get_mut(handle.0)
            .ok_or_else(|| TableError::invalid_handle(handle))
    }

    fn get_or_create(&mut self, name: &str) -> TopicHandle {
        if let Some(handle) = self.by_name.get(name) {
            return *handle;
        }
        let handle = TopicHandle(self.topics.insert(TopicRecord::new(name.to_string())));
        self.by_name.insert(name.to_string(), handle);
        handle
    }

    /// Announce `topic` if it is not yet visible.
    fn announce(&mut self, topic: TopicHandle) -> Option<DirectoryEvent> {
        let record = self.topics.get_mut(topic.0)?;
        if record.announced {
            return None;
        }
        record.announced = true;
        Some(DirectoryEvent::Announced(record.info(topic)))
    }

    /// Announce `topic` either for the first time, or, when it is already
    /// visible and `newly_typed`, report the type binding.
    fn announce_typed(&mut self, topic: TopicHandle, newly_typed: bool) -> Option<DirectoryEvent> {
        let announced = self.announce(topic);
        if announced.is_some() || !newly_typed {
            return announced;
        }
        let record = self.topics.get(topic.0)?;
        Some(DirectoryEvent::TypeBound(record.info(topic)))
    }

    /// Unannounce `topic` when nothing keeps it alive any more.
    ///
    /// A topic that was never announced keeps its type and properties.
    fn cleanup(&mut self, topic: TopicHandle) -> Option<DirectoryEvent> {
        let record = self.topics.get_mut(topic.0)?;
        if !record.announced
            || record.publisher_count() > 0
            || !record.subscribers.is_empty()
            || record.sticky()
        {
            return None;
        }

        let info = record.info(topic);
        record.kind = ValueKind::Unassigned;
        record.properties.clear();
        record.announced = false;
        Some(DirectoryEvent::Unannounced(info))
    }
}

/// The process-wide topic directory of one instance.
#[derive(Debug, Default)]
pub struct Directory {
    inner: Mutex<DirectoryInner>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a topic by name, creating a name-only topic if needed.
    pub fn get_or_create_topic(&self, name: &str) -> TopicHandle {
        self.inner.lock().get_or_create(name)
    }

    pub fn find_topic(&self, name: &str) -> Option<TopicHandle> {
        self.inner.lock().by_name.get(name).copied()
    }

    /// Bind a topic's type. Fails with `TypeMismatch` if already bound to a
    /// different kind.
    ///
    /// Binding an announced, untyped topic reports `TypeBound`.
    pub fn set_type(
        &self,
        topic: TopicHandle,
        kind: ValueKind,
    ) -> TableResult<Option<DirectoryEvent>> {
        let mut inner = self.inner.lock();
        let record = inner.topic_mut(topic)?;
        let newly_typed = record.bind(kind)?;
        if !(newly_typed && record.announced) {
            return Ok(None);
        }
        Ok(Some(DirectoryEvent::TypeBound(record.info(topic))))
    }

    pub fn topic_kind(&self, topic: TopicHandle) -> TableResult<ValueKind> {
        Ok(self.inner.lock().topic(topic)?.kind)
    }

    pub fn topic_name(&self, topic: TopicHandle) -> TableResult<String> {
        Ok(self.inner.lock().topic(topic)?.name.clone())
    }

    pub fn topic_info(&self, topic: TopicHandle) -> TableResult<TopicInfo> {
        Ok(self.inner.lock().topic(topic)?.info(topic))
    }

    /// All announced topics whose name starts with `prefix`, sorted by name.
    pub fn topics_with_prefix(&self, prefix: &str) -> Vec<TopicInfo> {
        let inner = self.inner.lock();
        let mut topics: Vec<TopicInfo> = inner
            .topics
            .iter()
            .filter(|(_, record)| record.announced && record.name.starts_with(prefix))
            .map(|(raw, record)| record.info(TopicHandle(raw)))
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        topics
    }

    /// All announced topics.
    pub fn announced_topics(&self) -> Vec<TopicInfo> {
        self.topics_with_prefix("")
    }

    /// Announced topics that have at least one local publisher.
    pub fn locally_published_topics(&self) -> Vec<TopicInfo> {
        let inner = self.inner.lock();
        inner
            .topics
            .iter()
            .filter(|(_, record)| record.announced && !record.publishers.is_empty())
            .map(|(raw, record)| record.info(TopicHandle(raw)))
            .collect()
    }

    pub fn has_local_publishers(&self, topic: TopicHandle) -> bool {
        self.inner
            .lock()
            .topics
            .get(topic.0)
            .is_some_and(|record| !record.publishers.is_empty())
    }

    /// Register a local publisher, binding the topic's type.
    ///
    /// `properties` are applied only when this publisher announces the topic.
    /// Events come back in order: `Announced` (topic became visible) or
    /// `TypeBound` (a subscriber had announced it untyped), then `Published`
    /// (first local publisher).
    pub fn publish(
        &self,
        topic: TopicHandle,
        kind: ValueKind,
        properties: JsonMap<String, JsonValue>,
        options: PublishOptions,
    ) -> TableResult<(PublisherHandle, Vec<DirectoryEvent>)> {
        let mut inner = self.inner.lock();
        let record = inner.topic_mut(topic)?;
        let newly_typed = record.bind(kind)?;
        if !record.announced || newly_typed {
            merge_properties(&mut record.properties, &properties);
        }

        let publisher = PublisherHandle(inner.publishers.insert(PublisherInfo {
            topic,
            kind,
            options,
        }));
        let record = inner.topic_mut(topic)?;
        record.publishers.insert(publisher);
        let first_local = record.publishers.len() == 1;

        let mut events: Vec<DirectoryEvent> =
            inner.announce_typed(topic, newly_typed).into_iter().collect();
        if first_local {
            events.push(DirectoryEvent::Published(inner.topic(topic)?.info(topic)));
        }
        Ok((publisher, events))
    }

    /// Register a subscriber, announcing a name-only topic.
    ///
    /// Prefix subscribers match other topics by name and never announce the
    /// topic carrying their prefix.
    pub fn subscribe(
        &self,
        topic: TopicHandle,
        options: SubscribeOptions,
    ) -> TableResult<(SubscriberHandle, Option<DirectoryEvent>)> {
        let mut inner = self.inner.lock();
        let name = inner.topic(topic)?.name.clone();
        let prefix = options.prefix;
        let subscriber = SubscriberHandle(inner.subscribers.insert(SubscriberInfo {
            topic,
            name,
            options,
        }));
        inner.topic_mut(topic)?.subscribers.insert(subscriber);
        let event = if prefix { None } else { inner.announce(topic) };
        Ok((subscriber, event))
    }

    pub fn publisher(&self, publisher: PublisherHandle) -> TableResult<PublisherInfo> {
        self.inner
            .lock()
            .publishers
            .get(publisher.0)
            .cloned()
            .ok_or_else(|| TableError::invalid_handle(publisher))
    }

    pub fn subscriber(&self, subscriber: SubscriberHandle) -> TableResult<SubscriberInfo> {
        self.inner
            .lock()
            .subscribers
            .get(subscriber.0)
            .cloned()
            .ok_or_else(|| TableError::invalid_handle(subscriber))
    }

    /// Live local subscribers with their handles.
    pub fn subscribers(&self) -> Vec<(SubscriberHandle, SubscriberInfo)> {
        self.inner
            .lock()
            .subscribers
            .iter()
            .map(|(raw, info)| (SubscriberHandle(raw), info.clone()))
            .collect()
    }

    /// Deregister a publisher. Releasing an already-released handle is a no-op.
    pub fn release_publisher(&self, publisher: PublisherHandle) -> Vec<DirectoryEvent> {
        let mut inner = self.inner.lock();
        let Some(info) = inner.publishers.remove(publisher.0) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        if let Some(record) = inner.topics.get_mut(info.topic.0) {
            record.publishers.remove(&publisher);
            if record.publishers.is_empty() {
                events.push(DirectoryEvent::Unpublished(record.info(info.topic)));
            }
        }
        events.extend(inner.cleanup(info.topic));
        events
    }

    /// Deregister a subscriber. Releasing an already-released handle is a no-op.
    pub fn release_subscriber(
        &self,
        subscriber: SubscriberHandle,
    ) -> Option<(SubscriberInfo, Option<DirectoryEvent>)> {
        let mut inner = self.inner.lock();
        let info = inner.subscribers.remove(subscriber.0)?;
        if let Some(record) = inner.topics.get_mut(info.topic.0) {
            record.subscribers.remove(&subscriber);
        }
        let event = inner.cleanup(info.topic);
        Some((info, event))
    }

    /// Create an entry: a subscriber now, a publisher on first write.
    pub fn create_entry(
        &self,
        topic: TopicHandle,
        options: SubscribeOptions,
    ) -> TableResult<(EntryHandle, SubscriberHandle, Option<DirectoryEvent>)> {
        let (subscriber, event) = self.subscribe(topic, options)?;
        let entry = EntryHandle(self.inner.lock().entries.insert(EntryInfo {
            topic,
            subscriber,
            publisher: None,
        }));
        Ok((entry, subscriber, event))
    }

    pub fn entry(&self, entry: EntryHandle) -> TableResult<EntryInfo> {
        self.inner
            .lock()
            .entries
            .get(entry.0)
            .cloned()
            .ok_or_else(|| TableError::invalid_handle(entry))
    }

    /// Attach the lazily created publisher to an entry.
    pub fn attach_entry_publisher(
        &self,
        entry: EntryHandle,
        publisher: PublisherHandle,
    ) -> TableResult<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .entries
            .get_mut(entry.0)
            .ok_or_else(|| TableError::invalid_handle(entry))?;
        record.publisher = Some(publisher);
        Ok(())
    }

    /// Remove an entry registration, returning the handles it owned.
    pub fn remove_entry(&self, entry: EntryHandle) -> Option<EntryInfo> {
        self.inner.lock().entries.remove(entry.0)
    }

    /// A peer started publishing `name`.
    pub fn remote_publish(
        &self,
        connection: ConnectionId,
        name: &str,
        kind: ValueKind,
        properties: &JsonMap<String, JsonValue>,
    ) -> TableResult<(TopicHandle, Option<DirectoryEvent>)> {
        let mut inner = self.inner.lock();
        let topic = inner.get_or_create(name);
        let record = inner.topic_mut(topic)?;
        let newly_typed = record.bind(kind)?;
        if !record.announced || newly_typed {
            merge_properties(&mut record.properties, properties);
        }
        *record.remote_publishers.entry(connection).or_default() += 1;
        let event = inner.announce_typed(topic, newly_typed);
        Ok((topic, event))
    }

    /// A peer stopped publishing `topic`.
    pub fn remote_unpublish(
        &self,
        connection: ConnectionId,
        topic: TopicHandle,
    ) -> Option<DirectoryEvent> {
        let mut inner = self.inner.lock();
        let record = inner.topics.get_mut(topic.0)?;
        let count = record.remote_publishers.get_mut(&connection)?;
        *count -= 1;
        if *count == 0 {
            record.remote_publishers.remove(&connection);
        }
        inner.cleanup(topic)
    }

    /// Forget every publisher a disconnected peer held.
    pub fn drop_connection(&self, connection: ConnectionId) -> Vec<DirectoryEvent> {
        let mut inner = self.inner.lock();
        let affected: Vec<TopicHandle> = inner
            .topics
            .iter()
            .filter(|(_, record)| record.remote_publishers.contains_key(&connection))
            .map(|(raw, _)| TopicHandle(raw))
            .collect();

        affected
            .into_iter()
            .filter_map(|topic| {
                if let Some(record) = inner.topics.get_mut(topic.0) {
                    record.remote_publishers.remove(&connection);
                }
                inner.cleanup(topic)
            })
            .collect()
    }

    pub fn properties(&self, topic: TopicHandle) -> TableResult<JsonMap<String, JsonValue>> {
        Ok(self.inner.lock().topic(topic)?.properties.clone())
    }

    /// Merge a properties update. `null` members delete keys.
    ///
    /// Clearing `persistent`/`retained` on an otherwise unused topic also
    /// unannounces it, in which case both events are returned.
    pub fn set_properties(
        &self,
        topic: TopicHandle,
        update: JsonMap<String, JsonValue>,
    ) -> TableResult<Vec<DirectoryEvent>> {
        let mut inner = self.inner.lock();
        let record = inner.topic_mut(topic)?;
        let before = record.properties.clone();
        merge_properties(&mut record.properties, &update);
        if record.properties == before {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        if record.announced {
            events.push(DirectoryEvent::PropertiesChanged {
                info: record.info(topic),
                update,
            });
        }
        events.extend(inner.cleanup(topic));
        Ok(events)
    }

    pub fn is_persistent(&self, topic: TopicHandle) -> bool {
        self.inner
            .lock()
            .topic(topic)
            .map(|record| flag(&record.properties, PROP_PERSISTENT))
            .unwrap_or(false)
    }

    /// Announce a topic restored from the persistence file.
    ///
    /// The type is bound and properties merged exactly like a publisher
    /// would, without registering one; the persistent flag keeps it alive.
    pub fn restore(
        &self,
        name: &str,
        kind: ValueKind,
        properties: &JsonMap<String, JsonValue>,
    ) -> TableResult<(TopicHandle, Option<DirectoryEvent>)> {
        let mut inner = self.inner.lock();
        let topic = inner.get_or_create(name);
        let record = inner.topic_mut(topic)?;
        let newly_typed = record.bind(kind)?;
        merge_properties(&mut record.properties, properties);
        record
            .properties
            .insert(PROP_PERSISTENT.to_string(), JsonValue::Bool(true));
        let event = inner.announce_typed(topic, newly_typed);
        Ok((topic, event))
    }

    pub fn topic_count(&self) -> usize {
        self.inner.lock().topics.len()
    }
}

fn merge_properties(target: &mut JsonMap<String, JsonValue>, update: &JsonMap<String, JsonValue>) {
    for (key, value) in update {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
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
    fn test_get_or_create_is_idempotent() {
        let dir = Directory::new();
        let a = dir.get_or_create_topic("/robot/speed");
        let b = dir.get_or_create_topic("/robot/speed");
        assert_eq!(a, b);
        assert_eq!(dir.topic_count(), 1);

        // Name-only topics are not announced.
        assert!(!dir.topic_info(a).unwrap().announced);
        assert!(dir.announced_topics().is_empty());
    }

    #[test]
    fn test_names_are_case_sensitive() {
        let dir = Directory::new();
        let a = dir.get_or_create_topic("/Speed");
        let b = dir.get_or_create_topic("/speed");
        assert_ne!(a, b);
    }

    #[test]
    fn test_set_type_binds_once() {
        let dir = Directory::new();
        let topic = dir.get_or_create_topic("/x");
        dir.set_type(topic, ValueKind::Double).unwrap();
        dir.set_type(topic, ValueKind::Double).unwrap();

        let err = dir.set_type(topic, ValueKind::String).unwrap_err();
        assert!(matches!(err, TableError::TypeMismatch { .. }));
        assert_eq!(dir.topic_kind(topic).unwrap(), ValueKind::Double);
    }

    #[test]
    fn test_first_publisher_announces() {
        let dir = Directory::new();
        let topic = dir.get_or_create_topic("/x");

        let (p1, events) = dir
            .publish(topic, ValueKind::Double, JsonMap::new(), PublishOptions::new())
            .unwrap();
        assert!(matches!(events[0], DirectoryEvent::Announced(_)));
        assert!(matches!(events[1], DirectoryEvent::Published(_)));

        let (p2, events) = dir
            .publish(topic, ValueKind::Double, JsonMap::new(), PublishOptions::new())
            .unwrap();
        assert!(events.is_empty());

        assert!(dir.release_publisher(p1).is_empty());
        let events = dir.release_publisher(p2);
        assert!(matches!(events[0], DirectoryEvent::Unpublished(_)));
        assert!(matches!(events[1], DirectoryEvent::Unannounced(_)));

        // Type is reset so a different type can be published.
        let (_p3, events) = dir
            .publish(topic, ValueKind::String, JsonMap::new(), PublishOptions::new())
            .unwrap();
        assert!(matches!(events[0], DirectoryEvent::Announced(_)));
    }

    #[test]
    fn test_local_publish_on_remote_topic() {
        let dir = Directory::new();
        let conn = ConnectionId(3);
        let (topic, _) = dir
            .remote_publish(conn, "/shared", ValueKind::Integer, &JsonMap::new())
            .unwrap();

        let (publisher, events) = dir
            .publish(topic, ValueKind::Integer, JsonMap::new(), PublishOptions::new())
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], DirectoryEvent::Published(_)));
        assert!(dir.has_local_publishers(topic));

        // The peer still publishes, so only the local transition is reported.
        let events = dir.release_publisher(publisher);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], DirectoryEvent::Unpublished(_)));
        assert!(dir.topic_info(topic).unwrap().announced);
    }

    #[test]
    fn test_publisher_type_conflict() {
        let dir = Directory::new();
        let topic = dir.get_or_create_topic("/x");
        dir.publish(topic, ValueKind::Double, JsonMap::new(), PublishOptions::new())
            .unwrap();
        let err = dir
            .publish(topic, ValueKind::Boolean, JsonMap::new(), PublishOptions::new())
            .unwrap_err();
        assert!(matches!(err, TableError::TypeMismatch { .. }));
    }

    #[test]
    fn test_subscriber_keeps_topic_alive() {
        let dir = Directory::new();
        let topic = dir.get_or_create_topic("/x");
        let (sub, _) = dir.subscribe(topic, SubscribeOptions::new()).unwrap();
        let (publisher, _) = dir
            .publish(topic, ValueKind::Integer, JsonMap::new(), PublishOptions::new())
            .unwrap();

        assert_eq!(dir.release_publisher(publisher).len(), 1);
        assert!(dir.topic_info(topic).unwrap().announced);

        let (_, event) = dir.release_subscriber(sub).unwrap();
        assert!(matches!(event, Some(DirectoryEvent::Unannounced(_))));
    }

    #[test]
    fn test_first_subscriber_announces() {
        let dir = Directory::new();
        let topic = dir.get_or_create_topic("/sub/only");

        let (first, event) = dir.subscribe(topic, SubscribeOptions::new()).unwrap();
        match event {
            Some(DirectoryEvent::Announced(info)) => {
                assert_eq!(info.name, "/sub/only");
                assert_eq!(info.kind, ValueKind::Unassigned);
            }
            other => panic!("expected announce, got {:?}", other),
        }
        assert_eq!(dir.announced_topics().len(), 1);

        let (second, event) = dir.subscribe(topic, SubscribeOptions::new()).unwrap();
        assert!(event.is_none());

        let (_, event) = dir.release_subscriber(first).unwrap();
        assert!(event.is_none());
        let (_, event) = dir.release_subscriber(second).unwrap();
        assert!(matches!(event, Some(DirectoryEvent::Unannounced(_))));
        assert!(dir.announced_topics().is_empty());
    }

    #[test]
    fn test_prefix_subscriber_does_not_announce() {
        let dir = Directory::new();
        let topic = dir.get_or_create_topic("/a/");
        let (sub, event) = dir
            .subscribe(topic, SubscribeOptions::new().prefix())
            .unwrap();
        assert!(event.is_none());
        assert!(!dir.topic_info(topic).unwrap().announced);

        let (_, event) = dir.release_subscriber(sub).unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn test_publisher_types_subscriber_announced_topic() {
        let dir = Directory::new();
        let topic = dir.get_or_create_topic("/x");
        dir.subscribe(topic, SubscribeOptions::new()).unwrap();

        let (_, events) = dir
            .publish(
                topic,
                ValueKind::Double,
                props(json!({"unit": "m"})),
                PublishOptions::new(),
            )
            .unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            DirectoryEvent::TypeBound(info) => {
                assert_eq!(info.kind, ValueKind::Double);
                assert_eq!(info.properties.get("unit"), Some(&json!("m")));
            }
            other => panic!("expected type binding, got {:?}", other),
        }
        assert!(matches!(events[1], DirectoryEvent::Published(_)));

        // A second binding of the same type is silent.
        assert!(dir.set_type(topic, ValueKind::Double).unwrap().is_none());
    }

    #[test]
    fn test_remote_publisher_types_subscriber_announced_topic() {
        let dir = Directory::new();
        let topic = dir.get_or_create_topic("/shared");
        dir.subscribe(topic, SubscribeOptions::new()).unwrap();

        let (remote, event) = dir
            .remote_publish(ConnectionId(1), "/shared", ValueKind::Integer, &JsonMap::new())
            .unwrap();
        assert_eq!(remote, topic);
        assert!(matches!(event, Some(DirectoryEvent::TypeBound(_))));

        // The subscriber still holds it after the peer leaves; the type stays.
        assert!(dir.drop_connection(ConnectionId(1)).is_empty());
        assert_eq!(dir.topic_kind(topic).unwrap(), ValueKind::Integer);
    }

    #[test]
    fn test_set_type_on_subscriber_announced_topic() {
        let dir = Directory::new();
        let topic = dir.get_or_create_topic("/x");
        assert!(dir.set_type(topic, ValueKind::Boolean).unwrap().is_none());

        let other = dir.get_or_create_topic("/y");
        dir.subscribe(other, SubscribeOptions::new()).unwrap();
        let event = dir.set_type(other, ValueKind::Boolean).unwrap();
        assert!(matches!(event, Some(DirectoryEvent::TypeBound(_))));
    }

    #[test]
    fn test_unannounced_topic_keeps_bound_type() {
        let dir = Directory::new();
        let topic = dir.get_or_create_topic("/typed/");
        dir.set_type(topic, ValueKind::Double).unwrap();

        let (sub, _) = dir
            .subscribe(topic, SubscribeOptions::new().prefix())
            .unwrap();
        let (_, event) = dir.release_subscriber(sub).unwrap();
        assert!(event.is_none());
        assert_eq!(dir.topic_kind(topic).unwrap(), ValueKind::Double);
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = Directory::new();
        let topic = dir.get_or_create_topic("/x");
        let (sub, _) = dir.subscribe(topic, SubscribeOptions::new()).unwrap();
        assert!(dir.release_subscriber(sub).is_some());
        assert!(dir.release_subscriber(sub).is_none());
        assert!(matches!(
            dir.subscriber(sub),
            Err(TableError::HandleInvalid { .. })
        ));
    }

    #[test]
    fn test_retained_topic_survives_last_publisher() {
        let dir = Directory::new();
        let topic = dir.get_or_create_topic("/x");
        let (publisher, _) = dir
            .publish(
                topic,
                ValueKind::Double,
                props(json!({"retained": true})),
                PublishOptions::new(),
            )
            .unwrap();
        let events = dir.release_publisher(publisher);
        assert!(matches!(events[..], [DirectoryEvent::Unpublished(_)]));
        assert!(dir.topic_info(topic).unwrap().is_retained());

        // Clearing the flag lets the topic go.
        let events = dir
            .set_properties(topic, props(json!({"retained": null})))
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], DirectoryEvent::Unannounced(_)));
    }

    #[test]
    fn test_set_properties_merges_and_reports() {
        let dir = Directory::new();
        let topic = dir.get_or_create_topic("/x");
        dir.publish(
            topic,
            ValueKind::Double,
            props(json!({"unit": "m"})),
            PublishOptions::new(),
        )
        .unwrap();

        let events = dir
            .set_properties(topic, props(json!({"persistent": true})))
            .unwrap();
        assert!(matches!(events[0], DirectoryEvent::PropertiesChanged { .. }));
        assert!(dir.is_persistent(topic));
        assert_eq!(dir.properties(topic).unwrap().get("unit"), Some(&json!("m")));

        // No-op update produces no event.
        let events = dir
            .set_properties(topic, props(json!({"persistent": true})))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_remote_publishers_are_dropped_with_connection() {
        let dir = Directory::new();
        let conn = ConnectionId(7);
        let (topic, event) = dir
            .remote_publish(conn, "/remote", ValueKind::Boolean, &JsonMap::new())
            .unwrap();
        assert!(matches!(event, Some(DirectoryEvent::Announced(_))));
        assert_eq!(dir.topic_info(topic).unwrap().publishers, 1);

        let events = dir.drop_connection(conn);
        assert_eq!(events.len(), 1);
        assert!(!dir.topic_info(topic).unwrap().announced);
    }

    #[test]
    fn test_prefix_listing() {
        let dir = Directory::new();
        for name in ["/a/1", "/a/2", "/b/1"] {
            let topic = dir.get_or_create_topic(name);
            dir.publish(topic, ValueKind::Integer, JsonMap::new(), PublishOptions::new())
                .unwrap();
        }
        let names: Vec<String> = dir
            .topics_with_prefix("/a/")
            .into_iter()
            .map(|info| info.name)
            .collect();
        assert_eq!(names, vec!["/a/1", "/a/2"]);
    }

    #[test]
    fn test_subscribe_options_matching() {
        let exact = SubscribeOptions::new();
        assert!(exact.matches("/a", "/a"));
        assert!(!exact.matches("/a", "/a/b"));

        let prefix = SubscribeOptions::new().prefix();
        assert!(prefix.matches("/a", "/a/b"));
        assert!(!prefix.matches("/a", "/b"));
    }

    #[test]
    fn test_entry_lifecycle() {
        let dir = Directory::new();
        let topic = dir.get_or_create_topic("/e");
        let (entry, sub, event) = dir.create_entry(topic, SubscribeOptions::new()).unwrap();
        assert!(matches!(event, Some(DirectoryEvent::Announced(_))));
        assert_eq!(dir.entry(entry).unwrap().subscriber, sub);
        assert!(dir.entry(entry).unwrap().publisher.is_none());

        let removed = dir.remove_entry(entry).unwrap();
        assert_eq!(removed.subscriber, sub);
        assert!(dir.entry(entry).is_err());
    }
}
