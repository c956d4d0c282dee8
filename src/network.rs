/// Server and client networking.
///
/// This module runs the synchronization protocol on top of the framing in
/// [`crate::protocol`]:
///
/// - A **server** accepts any number of clients. It announces every visible
///   topic to every client, applies values clients publish, and relays them
///   to the other clients whose subscriptions cover the topic.
/// - A **client** keeps at most one link to its server. It announces its
///   locally published topics, sends its own writes, registers its
///   subscriptions, and reconnects on a backoff schedule when the link drops.
///
/// # Sessions
///
/// Each link is one session task that owns the writing half of the socket
/// and reacts to three sources: frames from a reader task, outbound work
/// routed from the instance's dispatcher, and timers (keep-alive and the
/// coalescing flush). Per-topic order is preserved because a session writes
/// everything for its peer from a single task.
///
/// # Lifecycle of a link
///
/// `Handshaking` covers the version exchange and both initial state dumps.
/// Each side ends its dump with `SyncDone`; receiving the peer's `SyncDone`
/// moves the link to `Synchronized` and raises the `Connected` event.
use crate::clock::now_micros;
use crate::config::{NetworkConfig, Role};
use crate::directory::{SubscribeOptions, TopicInfo};
use crate::dispatcher::Outbound;
use crate::error::{TableError, TableResult};
use crate::event::EventKind;
use crate::handle::{ConnectionId, TopicHandle};
use crate::instance::InstanceCore;
use crate::protocol::{
    Connection, ConnectionInfo, ConnectionState, FrameReader, FrameWriter, Message,
    PROTOCOL_VERSION,
};
use crate::storage::WriteOrigin;
use crate::value::{Value, ValueKind};
use dashmap::DashMap;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};

/// Frames buffered between a reader task and its session.
const INCOMING_BUFFER: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Resolve once `shutdown` reads true (or its sender is gone).
///
/// The borrow handed out by `wait_for` is released before returning, so
/// the future stays `Send` inside `select!` arms of spawned tasks.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Live sessions of one network role.
#[derive(Debug, Default)]
struct Hub {
    sessions: DashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>,
    connections: DashMap<ConnectionId, ConnectionInfo>,
}

impl Hub {
    fn register(&self, info: ConnectionInfo) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(info.id, tx);
        self.connections.insert(info.id, info);
        rx
    }

    fn unregister(&self, id: ConnectionId) {
        self.sessions.remove(&id);
        self.connections.remove(&id);
    }

    fn update(&self, id: ConnectionId, f: impl FnOnce(&mut ConnectionInfo)) {
        if let Some(mut info) = self.connections.get_mut(&id) {
            f(&mut info);
        }
    }

    fn broadcast(&self, message: &Outbound) {
        for session in self.sessions.iter() {
            // A closed session unregisters itself shortly.
            let _ = session.value().send(message.clone());
        }
    }
}

/// A running server or client.
///
/// Dropping the handle signals every task to stop; [`NetworkHandle::stop`]
/// additionally waits for them.
#[derive(Debug)]
pub(crate) struct NetworkHandle {
    role: Role,
    local_addr: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
    hub: Arc<Hub>,
    tasks: Vec<JoinHandle<()>>,
}

impl NetworkHandle {
    /// Bind the listen address and start accepting clients.
    pub(crate) async fn start_server(
        core: Arc<InstanceCore>,
        config: NetworkConfig,
    ) -> TableResult<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen_addr).await.map_err(|e| {
            TableError::ConnectionLost(format!("failed to bind {}: {}", config.listen_addr, e))
        })?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, identity = %config.identity, "server listening");

        let mut handle = Self::new(Role::Server, Some(local_addr));
        handle.spawn_router(&core);

        let hub = Arc::clone(&handle.hub);
        let shutdown = handle.shutdown.subscribe();
        handle.tasks.push(tokio::spawn(accept_loop(
            listener, core, hub, config, shutdown,
        )));
        Ok(handle)
    }

    /// Start the client connect loop. Returns immediately; the first
    /// connection attempt happens in the background.
    pub(crate) fn start_client(core: Arc<InstanceCore>, config: NetworkConfig) -> TableResult<Self> {
        config.validate()?;
        tracing::info!(server = %config.server_addr, identity = %config.identity, "client starting");

        let mut handle = Self::new(Role::Client, None);
        handle.spawn_router(&core);

        let hub = Arc::clone(&handle.hub);
        let shutdown = handle.shutdown.subscribe();
        handle
            .tasks
            .push(tokio::spawn(connect_loop(core, hub, config, shutdown)));
        Ok(handle)
    }

    fn new(role: Role, local_addr: Option<SocketAddr>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            role,
            local_addr,
            shutdown,
            hub: Arc::new(Hub::default()),
            tasks: Vec::new(),
        }
    }

    fn spawn_router(&mut self, core: &Arc<InstanceCore>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        core.dispatcher.attach_network(self.role, tx);

        let hub = Arc::clone(&self.hub);
        let mut shutdown = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = rx.recv() => match message {
                        Some(message) => hub.broadcast(&message),
                        None => break,
                    },
                    _ = stopped(&mut shutdown) => break,
                }
            }
        }));
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    /// Bound address of a server.
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub(crate) fn connections(&self) -> Vec<ConnectionInfo> {
        let mut connections: Vec<ConnectionInfo> = self
            .hub
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        connections.sort_by_key(|info| info.id);
        connections
    }

    /// Signal every task to stop without waiting.
    pub(crate) fn signal_stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stop every task and wait for the sessions to clean up.
    pub(crate) async fn stop(mut self) {
        self.signal_stop();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "network task failed");
            }
        }
        tracing::info!(role = %self.role, "network stopped");
    }
}

impl Drop for NetworkHandle {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

async fn accept_loop(
    listener: TcpListener,
    core: Arc<InstanceCore>,
    hub: Arc<Hub>,
    config: NetworkConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "accepted connection");
                    sessions.spawn(serve_client(
                        Connection::new(stream, peer),
                        Arc::clone(&core),
                        Arc::clone(&hub),
                        config.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            _ = stopped(&mut shutdown) => break,
        }
    }

    while sessions.join_next().await.is_some() {}
    tracing::debug!("accept loop stopped");
}

/// Handshake with one accepted client, then run its session.
async fn serve_client(
    mut conn: Connection,
    core: Arc<InstanceCore>,
    hub: Arc<Hub>,
    config: NetworkConfig,
    shutdown: watch::Receiver<bool>,
) {
    let peer = conn.peer_addr();
    let handshake = timeout(config.handshake_timeout, server_handshake(&core, &config, &mut conn));
    let info = match handshake.await {
        Ok(Ok(info)) => info,
        Ok(Err(e)) => {
            tracing::warn!(peer = %peer, error = %e, "handshake failed");
            return;
        }
        Err(_) => {
            tracing::warn!(peer = %peer, "handshake timed out");
            return;
        }
    };

    run_session(Role::Server, conn, info, core, hub, config, shutdown).await;
}

async fn server_handshake(
    core: &InstanceCore,
    config: &NetworkConfig,
    conn: &mut Connection,
) -> TableResult<ConnectionInfo> {
    let (version, instance_id, identity, time) = match conn.receive().await? {
        Message::Hello {
            version,
            instance_id,
            identity,
            time,
        } => (version, instance_id, identity, time),
        other => {
            return Err(TableError::ProtocolError(format!(
                "expected hello, got {}",
                other.name()
            )));
        }
    };

    if !PROTOCOL_VERSION.is_compatible(&version) {
        let reason = format!(
            "protocol version {} is incompatible with {}",
            version, PROTOCOL_VERSION
        );
        conn.send(&Message::Reject {
            reason: reason.clone(),
        })
        .await?;
        return Err(TableError::ProtocolError(reason));
    }

    conn.send(&Message::HelloAck {
        version: PROTOCOL_VERSION,
        instance_id: core.id,
        identity: config.identity.clone(),
        client_time: time,
        server_time: now_micros(),
    })
    .await?;

    let mut info = ConnectionInfo::new(
        next_connection_id(),
        identity,
        Some(conn.peer_addr()),
        ConnectionState::Handshaking,
    );
    info.remote_instance = Some(instance_id);
    info.protocol_version = Some(version);
    Ok(info)
}

async fn connect_loop(
    core: Arc<InstanceCore>,
    hub: Arc<Hub>,
    config: NetworkConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    let mut failures: usize = 0;

    loop {
        let connected = tokio::select! {
            result = connect_once(&core, &config) => result,
            _ = stopped(&mut shutdown) => break,
        };

        match connected {
            Ok((conn, info)) => {
                attempt = 0;
                failures = 0;
                run_session(
                    Role::Client,
                    conn,
                    info,
                    Arc::clone(&core),
                    Arc::clone(&hub),
                    config.clone(),
                    shutdown.clone(),
                )
                .await;
            }
            Err(e) => {
                failures += 1;
                tracing::debug!(server = %config.server_addr, attempt = failures, error = %e, "connect failed");
                if config.backoff.exhausted(failures) {
                    tracing::warn!(server = %config.server_addr, "giving up after {} attempts", failures);
                    break;
                }
            }
        }

        if *shutdown.borrow() {
            break;
        }
        let delay = config.backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = stopped(&mut shutdown) => break,
        }
    }
    tracing::debug!("connect loop stopped");
}

async fn connect_once(
    core: &InstanceCore,
    config: &NetworkConfig,
) -> TableResult<(Connection, ConnectionInfo)> {
    let mut conn = Connection::connect(config.server_addr).await?;
    let info = timeout(config.handshake_timeout, client_handshake(core, config, &mut conn))
        .await
        .map_err(|_| TableError::ConnectionLost("handshake timed out".to_string()))??;
    Ok((conn, info))
}

async fn client_handshake(
    core: &InstanceCore,
    config: &NetworkConfig,
    conn: &mut Connection,
) -> TableResult<ConnectionInfo> {
    let sent = now_micros();
    conn.send(&Message::Hello {
        version: PROTOCOL_VERSION,
        instance_id: core.id,
        identity: config.identity.clone(),
        time: sent,
    })
    .await?;

    match conn.receive().await? {
        Message::HelloAck {
            version,
            instance_id,
            identity,
            client_time,
            server_time,
        } => {
            core.clock.record(client_time, now_micros(), server_time);
            let mut info = ConnectionInfo::new(
                next_connection_id(),
                identity,
                Some(conn.peer_addr()),
                ConnectionState::Handshaking,
            );
            info.remote_instance = Some(instance_id);
            info.protocol_version = Some(version);
            Ok(info)
        }
        Message::Reject { reason } => Err(TableError::ProtocolError(format!(
            "server rejected handshake: {}",
            reason
        ))),
        other => Err(TableError::ProtocolError(format!(
            "expected hello_ack, got {}",
            other.name()
        ))),
    }
}

async fn run_session(
    role: Role,
    conn: Connection,
    info: ConnectionInfo,
    core: Arc<InstanceCore>,
    hub: Arc<Hub>,
    config: NetworkConfig,
    shutdown: watch::Receiver<bool>,
) {
    let commands = hub.register(info.clone());
    let (reader, writer) = conn.into_split();
    tracing::info!(
        connection = %info.id,
        peer = %info.remote_id,
        addr = ?info.remote_addr,
        "connection established"
    );

    let mut session = Session {
        id: info.id,
        role,
        core,
        hub,
        config,
        writer,
        info,
        sent: HashMap::new(),
        received: HashMap::new(),
        subscriptions: HashMap::new(),
        pending: Vec::new(),
        last_seen: Instant::now(),
        synchronized: false,
        flush_changed: false,
    };

    match session.run(reader, commands, shutdown).await {
        Ok(()) => tracing::info!(connection = %session.id, "connection closed"),
        Err(e @ TableError::ProtocolError(_)) => {
            tracing::warn!(connection = %session.id, error = %e, "dropping connection")
        }
        Err(e) => tracing::info!(connection = %session.id, error = %e, "connection lost"),
    }
    session.close();
}

/// A subscription a client registered with this server.
#[derive(Debug, Clone)]
struct PeerSubscription {
    patterns: Vec<String>,
    options: SubscribeOptions,
}

impl PeerSubscription {
    fn covers(&self, name: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| self.options.matches(pattern, name))
    }
}

/// A value waiting for the next flush tick.
#[derive(Debug)]
struct PendingValue {
    topic: TopicHandle,
    value: Value,
}

struct Session {
    id: ConnectionId,
    role: Role,
    core: Arc<InstanceCore>,
    hub: Arc<Hub>,
    config: NetworkConfig,
    writer: FrameWriter<OwnedWriteHalf>,
    info: ConnectionInfo,
    /// Topics announced to the peer, with the id used on the wire.
    sent: HashMap<TopicHandle, u32>,
    /// Topics the peer announced, by the peer's wire id.
    received: HashMap<u32, (TopicHandle, ValueKind)>,
    /// Server side: the peer's subscriptions by subuid.
    subscriptions: HashMap<u32, PeerSubscription>,
    pending: Vec<PendingValue>,
    last_seen: Instant,
    synchronized: bool,
    flush_changed: bool,
}

impl Session {
    async fn run(
        &mut self,
        mut reader: FrameReader<OwnedReadHalf>,
        mut commands: mpsc::UnboundedReceiver<Outbound>,
        mut shutdown: watch::Receiver<bool>,
    ) -> TableResult<()> {
        let (incoming_tx, mut incoming) = mpsc::channel(INCOMING_BUFFER);
        let reader_task = tokio::spawn(async move {
            loop {
                let result = reader.receive().await;
                let failed = result.is_err();
                if incoming_tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });

        let result = self
            .event_loop(&mut incoming, &mut commands, &mut shutdown)
            .await;
        reader_task.abort();
        result
    }

    async fn event_loop(
        &mut self,
        incoming: &mut mpsc::Receiver<TableResult<Message>>,
        commands: &mut mpsc::UnboundedReceiver<Outbound>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> TableResult<()> {
        self.send_initial_state().await?;

        let mut keepalive = interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flush = interval(self.flush_interval());
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = incoming.recv() => match message {
                    Some(Ok(message)) => self.handle_message(message).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Err(TableError::ConnectionLost("reader stopped".to_string())),
                },
                Some(outbound) = commands.recv() => self.handle_outbound(outbound).await?,
                _ = flush.tick() => self.flush_pending().await?,
                _ = keepalive.tick() => self.keepalive().await?,
                _ = stopped(shutdown) => return Ok(()),
            }

            if self.flush_changed {
                self.flush_changed = false;
                flush = interval(self.flush_interval());
                flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
        }
    }

    fn flush_interval(&self) -> Duration {
        self.subscriptions
            .values()
            .filter_map(|sub| sub.options.period())
            .min()
            .unwrap_or(self.config.flush_period)
            .max(Duration::from_millis(1))
    }

    async fn send(&mut self, message: Message) -> TableResult<()> {
        tracing::trace!(connection = %self.id, message = message.name(), "send");
        self.writer.send(&message).await
    }

    async fn send_initial_state(&mut self) -> TableResult<()> {
        match self.role {
            Role::Server => {
                // Untyped topics follow once something binds their type.
                for info in self.core.directory.announced_topics() {
                    if info.kind != ValueKind::Unassigned {
                        self.announce(&info).await?;
                    }
                }
            }
            Role::Client => {
                for info in self.core.directory.locally_published_topics() {
                    self.announce(&info).await?;
                    let value = self.core.storage.get_value(info.handle);
                    if !value.is_empty() {
                        self.send_value(info.handle, &value).await?;
                    }
                }
                for (subscriber, info) in self.core.directory.subscribers() {
                    self.send(Message::Subscribe {
                        subuid: subscriber.0.index,
                        patterns: vec![info.name],
                        options: info.options,
                    })
                    .await?;
                }
            }
        }
        self.send(Message::SyncDone).await
    }

    async fn announce(&mut self, info: &TopicInfo) -> TableResult<u32> {
        if let Some(id) = self.sent.get(&info.handle) {
            return Ok(*id);
        }
        let id = info.handle.0.index;
        self.send(Message::Announce {
            id,
            name: info.name.clone(),
            kind: info.kind,
            properties: info.properties.clone(),
        })
        .await?;
        self.sent.insert(info.handle, id);
        Ok(id)
    }

    /// Wire id for `topic`, announcing it first if the peer has not seen it.
    async fn ensure_announced(&mut self, topic: TopicHandle) -> TableResult<Option<u32>> {
        if let Some(id) = self.sent.get(&topic) {
            return Ok(Some(*id));
        }
        let Ok(info) = self.core.directory.topic_info(topic) else {
            return Ok(None);
        };
        if !info.announced {
            return Ok(None);
        }
        if self.role == Role::Client && !self.core.directory.has_local_publishers(topic) {
            return Ok(None);
        }
        self.announce(&info).await.map(Some)
    }

    async fn unannounce(&mut self, info: &TopicInfo) -> TableResult<()> {
        self.pending.retain(|p| p.topic != info.handle);
        if let Some(id) = self.sent.remove(&info.handle) {
            self.send(Message::Unannounce {
                id,
                name: info.name.clone(),
            })
            .await?;
        }
        Ok(())
    }

    async fn send_value(&mut self, topic: TopicHandle, value: &Value) -> TableResult<()> {
        let Some(id) = self.ensure_announced(topic).await? else {
            tracing::trace!(connection = %self.id, topic = %topic, "value for unannounced topic dropped");
            return Ok(());
        };
        let time = match self.role {
            Role::Client => self.core.clock.to_server(value.time()),
            Role::Server => value.time(),
        };
        self.send(Message::Value {
            id,
            time,
            value: value.to_json(),
        })
        .await
    }

    async fn flush_pending(&mut self) -> TableResult<()> {
        for pending in std::mem::take(&mut self.pending) {
            self.send_value(pending.topic, &pending.value).await?;
        }
        Ok(())
    }

    async fn keepalive(&mut self) -> TableResult<()> {
        if self.last_seen.elapsed() > self.config.keepalive_timeout {
            return Err(TableError::ConnectionLost(format!(
                "no traffic from {} for {:?}",
                self.info.remote_id, self.config.keepalive_timeout
            )));
        }
        if self.role == Role::Client {
            self.send(Message::Ping { time: now_micros() }).await?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────────

    async fn handle_outbound(&mut self, outbound: Outbound) -> TableResult<()> {
        match (self.role, outbound) {
            (Role::Server, Outbound::Announce(info)) if info.kind != ValueKind::Unassigned => {
                self.announce(&info).await?;
            }
            (Role::Server, Outbound::Unannounce(info)) => self.unannounce(&info).await?,
            (Role::Client, Outbound::Publish(info)) => {
                self.announce(&info).await?;
            }
            (Role::Client, Outbound::Unpublish(info)) => self.unannounce(&info).await?,
            (role, Outbound::Properties { info, update, origin }) => {
                if origin == WriteOrigin::Remote(self.id) {
                    return Ok(());
                }
                // A client may annotate topics it does not publish.
                if role == Role::Server && !self.sent.contains_key(&info.handle) {
                    return Ok(());
                }
                self.send(Message::Properties {
                    name: info.name,
                    update,
                })
                .await?;
            }
            (Role::Server, Outbound::Value {
                topic,
                name,
                value,
                origin,
            }) => {
                if origin == WriteOrigin::Remote(self.id) {
                    return Ok(());
                }
                self.route_value(topic, &name, value).await?;
            }
            (Role::Client, Outbound::Value { topic, value, .. }) => {
                self.send_value(topic, &value).await?;
            }
            (Role::Client, Outbound::Subscribe { subscriber, info }) => {
                self.send(Message::Subscribe {
                    subuid: subscriber.0.index,
                    patterns: vec![info.name],
                    options: info.options,
                })
                .await?;
            }
            (Role::Client, Outbound::Unsubscribe { subscriber }) => {
                self.send(Message::Unsubscribe {
                    subuid: subscriber.0.index,
                })
                .await?;
            }
            (role, other) => {
                tracing::trace!(connection = %self.id, %role, message = ?other, "not relayed");
            }
        }
        Ok(())
    }

    /// Server side: send a value to this client if any subscription wants it.
    async fn route_value(&mut self, topic: TopicHandle, name: &str, value: Value) -> TableResult<()> {
        let mut wanted = false;
        let mut immediate = false;
        let mut send_all = false;
        for sub in self.subscriptions.values() {
            if sub.options.topics_only || !sub.covers(name) {
                continue;
            }
            wanted = true;
            immediate |= sub.options.period().is_none();
            send_all |= sub.options.send_all;
        }

        if !wanted {
            return Ok(());
        }
        if immediate {
            return self.send_value(topic, &value).await;
        }

        if !send_all {
            if let Some(slot) = self.pending.iter_mut().find(|p| p.topic == topic) {
                slot.value = value;
                return Ok(());
            }
        }
        self.pending.push(PendingValue { topic, value });
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────

    async fn handle_message(&mut self, message: Message) -> TableResult<()> {
        self.last_seen = Instant::now();
        self.info.touch();
        self.hub.update(self.id, ConnectionInfo::touch);
        tracing::trace!(connection = %self.id, message = message.name(), "receive");

        match message {
            Message::SyncDone => self.peer_synchronized(),
            Message::Announce {
                id,
                name,
                kind,
                properties,
            } => self.peer_announce(id, &name, kind, &properties),
            Message::Unannounce { id, name } => match self.received.remove(&id) {
                Some((topic, _)) => self.core.apply_remote_unannounce(self.id, topic),
                None => {
                    tracing::debug!(connection = %self.id, id, name = %name, "unannounce for unknown topic")
                }
            },
            Message::Properties { name, update } => {
                if let Err(e) = self.core.apply_remote_properties(self.id, &name, update) {
                    tracing::debug!(connection = %self.id, topic = %name, error = %e, "properties update ignored");
                }
            }
            Message::Value { id, time, value } => self.peer_value(id, time, &value)?,
            Message::Subscribe {
                subuid,
                patterns,
                options,
            } if self.role == Role::Server => self.peer_subscribe(subuid, patterns, options).await?,
            Message::Unsubscribe { subuid } if self.role == Role::Server => {
                self.subscriptions.remove(&subuid);
                self.flush_changed = true;
            }
            Message::Ping { time } if self.role == Role::Server => {
                self.send(Message::Pong {
                    client_time: time,
                    server_time: now_micros(),
                })
                .await?;
            }
            Message::Pong {
                client_time,
                server_time,
            } if self.role == Role::Client => {
                self.core.clock.record(client_time, now_micros(), server_time);
            }
            unexpected @ (Message::Hello { .. } | Message::HelloAck { .. } | Message::Reject { .. }) => {
                return Err(TableError::ProtocolError(format!(
                    "unexpected {} after handshake",
                    unexpected.name()
                )));
            }
            other => {
                tracing::debug!(connection = %self.id, role = %self.role, message = other.name(), "ignoring message");
            }
        }
        Ok(())
    }

    fn peer_synchronized(&mut self) {
        if self.synchronized {
            return;
        }
        self.synchronized = true;
        self.info.state = ConnectionState::Synchronized;
        self.hub
            .update(self.id, |info| info.state = ConnectionState::Synchronized);
        tracing::info!(connection = %self.id, peer = %self.info.remote_id, "synchronized");
        self.core
            .dispatcher
            .notify_connection(EventKind::Connected, &self.info);
    }

    fn peer_announce(
        &mut self,
        id: u32,
        name: &str,
        kind: ValueKind,
        properties: &JsonMap<String, JsonValue>,
    ) {
        if self.received.contains_key(&id) {
            return;
        }
        match self
            .core
            .apply_remote_announce(self.id, name, kind, properties)
        {
            Ok(topic) => {
                self.received.insert(id, (topic, kind));
            }
            Err(e) => {
                tracing::warn!(connection = %self.id, topic = name, error = %e, "rejected announce");
            }
        }
    }

    fn peer_value(&mut self, id: u32, time: u64, json: &JsonValue) -> TableResult<()> {
        let Some((topic, kind)) = self.received.get(&id).copied() else {
            tracing::debug!(connection = %self.id, id, "value for unknown topic id dropped");
            return Ok(());
        };

        let time = match (self.role, time) {
            (_, 0) => now_micros(),
            (Role::Client, time) => self.core.clock.to_local(time),
            (Role::Server, time) => time,
        };
        let value = Value::from_json(kind, json, time).map_err(|e| {
            TableError::ProtocolError(format!("undecodable value for topic id {}: {}", id, e))
        })?;

        if let Err(e) = self.core.apply_remote_value(self.id, topic, value) {
            tracing::debug!(connection = %self.id, topic = %topic, error = %e, "remote value rejected");
        }
        Ok(())
    }

    async fn peer_subscribe(
        &mut self,
        subuid: u32,
        patterns: Vec<String>,
        options: SubscribeOptions,
    ) -> TableResult<()> {
        let subscription = PeerSubscription { patterns, options };
        self.subscriptions.insert(subuid, subscription.clone());
        self.flush_changed = true;
        if subscription.options.topics_only {
            return Ok(());
        }

        // Full resync: replay every current value the subscription covers.
        for info in self.core.directory.announced_topics() {
            if !subscription.covers(&info.name) {
                continue;
            }
            let value = self.core.storage.get_value(info.handle);
            if !value.is_empty() {
                self.send_value(info.handle, &value).await?;
            }
        }
        Ok(())
    }

    fn close(mut self) {
        self.hub.unregister(self.id);
        if self.synchronized {
            self.info.state = ConnectionState::Disconnected;
            self.core
                .dispatcher
                .notify_connection(EventKind::Disconnected, &self.info);
        }
        self.core.connection_closed(self.id);
        if self.role == Role::Client {
            self.core.clock.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;
    use crate::protocol::ProtocolVersion;
    use uuid::Uuid;

    fn local_server_config() -> NetworkConfig {
        NetworkConfig::new().listen_addr("127.0.0.1:0".parse().unwrap())
    }

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert!(b > a);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_spawned_loops_see_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = async move {
            let mut ticks = interval(Duration::from_millis(5));
            let mut count = 0u32;
            loop {
                tokio::select! {
                    _ = ticks.tick() => count += 1,
                    _ = stopped(&mut rx) => break,
                }
            }
            count
        };
        assert_send(&waiter);
        let task = tokio::spawn(waiter);

        sleep(Duration::from_millis(30)).await;
        tx.send_replace(true);
        let ticks = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(ticks > 0);
    }

    #[tokio::test]
    async fn test_stopped_resolves_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        timeout(Duration::from_secs(1), stopped(&mut rx)).await.unwrap();
    }

    #[test]
    fn test_peer_subscription_matching() {
        let exact = PeerSubscription {
            patterns: vec!["/a".to_string()],
            options: SubscribeOptions::new(),
        };
        assert!(exact.covers("/a"));
        assert!(!exact.covers("/ab"));

        let prefix = PeerSubscription {
            patterns: vec!["/a/".to_string(), "/b".to_string()],
            options: SubscribeOptions::new().prefix(),
        };
        assert!(prefix.covers("/a/x"));
        assert!(prefix.covers("/bcd"));
        assert!(!prefix.covers("/c"));
    }

    #[tokio::test]
    async fn test_incompatible_version_is_rejected() {
        let server = Instance::create().unwrap();
        let addr = server.start_server(local_server_config()).await.unwrap();

        let mut conn = Connection::connect(addr).await.unwrap();
        conn.send(&Message::Hello {
            version: ProtocolVersion { major: 3, minor: 0 },
            instance_id: Uuid::new_v4(),
            identity: "old".to_string(),
            time: now_micros(),
        })
        .await
        .unwrap();

        match conn.receive().await.unwrap() {
            Message::Reject { reason } => assert!(reason.contains("incompatible")),
            other => panic!("expected reject, got {:?}", other),
        }
        assert!(conn.receive().await.is_err());
        assert!(server.connections().is_empty());
        server.destroy();
    }

    #[tokio::test]
    async fn test_handshake_and_initial_dump() {
        let server = Instance::create().unwrap();
        let topic = server.topic("/dump/a");
        let publisher = server
            .publish(topic, ValueKind::Double, JsonMap::new())
            .unwrap();
        server.set(publisher, Value::double(3.5)).unwrap();
        let addr = server.start_server(local_server_config()).await.unwrap();

        let mut conn = Connection::connect(addr).await.unwrap();
        conn.send(&Message::Hello {
            version: PROTOCOL_VERSION,
            instance_id: Uuid::new_v4(),
            identity: "raw".to_string(),
            time: now_micros(),
        })
        .await
        .unwrap();

        assert!(matches!(conn.receive().await.unwrap(), Message::HelloAck { .. }));
        match conn.receive().await.unwrap() {
            Message::Announce { name, kind, .. } => {
                assert_eq!(name, "/dump/a");
                assert_eq!(kind, ValueKind::Double);
            }
            other => panic!("expected announce, got {:?}", other),
        }
        assert_eq!(conn.receive().await.unwrap(), Message::SyncDone);

        // Values flow only after a subscription.
        conn.send(&Message::SyncDone).await.unwrap();
        conn.send(&Message::Subscribe {
            subuid: 1,
            patterns: vec!["/dump/".to_string()],
            options: SubscribeOptions::new().prefix(),
        })
        .await
        .unwrap();
        match conn.receive().await.unwrap() {
            Message::Value { value, .. } => assert_eq!(value, serde_json::json!(3.5)),
            other => panic!("expected value, got {:?}", other),
        }

        assert!(wait_for(|| server.connections().len() == 1).await);
        let info = &server.connections()[0];
        assert_eq!(info.remote_id, "raw");
        assert_eq!(info.state, ConnectionState::Synchronized);
        server.destroy();
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let server = Instance::create().unwrap();
        let config = local_server_config()
            .keepalive(Duration::from_millis(20), Duration::from_millis(100));
        let addr = server.start_server(config).await.unwrap();

        let mut conn = Connection::connect(addr).await.unwrap();
        conn.send(&Message::Hello {
            version: PROTOCOL_VERSION,
            instance_id: Uuid::new_v4(),
            identity: "quiet".to_string(),
            time: now_micros(),
        })
        .await
        .unwrap();

        // The server answers the handshake, dumps its state, then gives up on us.
        let started = Instant::now();
        while conn.receive().await.is_ok() {}
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert!(wait_for(|| server.connections().is_empty()).await);
        server.destroy();
    }

    #[tokio::test]
    async fn test_malformed_value_drops_connection() {
        let server = Instance::create().unwrap();
        let addr = server.start_server(local_server_config()).await.unwrap();

        let mut conn = Connection::connect(addr).await.unwrap();
        conn.send(&Message::Hello {
            version: PROTOCOL_VERSION,
            instance_id: Uuid::new_v4(),
            identity: "bad".to_string(),
            time: now_micros(),
        })
        .await
        .unwrap();
        conn.send(&Message::Announce {
            id: 7,
            name: "/bad".to_string(),
            kind: ValueKind::Double,
            properties: JsonMap::new(),
        })
        .await
        .unwrap();
        conn.send(&Message::Value {
            id: 7,
            time: now_micros(),
            value: serde_json::json!("not a number"),
        })
        .await
        .unwrap();

        while conn.receive().await.is_ok() {}
        assert!(wait_for(|| server.connections().is_empty()).await);
        // The peer's publisher went away with it.
        let topic = server.topic("/bad");
        assert!(!server.topic_info(topic).unwrap().announced);
        server.destroy();
    }
}
