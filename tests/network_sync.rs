/// Integration tests for server/client synchronization over loopback TCP.
///
/// Every test binds port 0 so tests can run in parallel; timings are kept
/// short but waits poll with generous deadlines.
use nettables::{
    BackoffPolicy, ConnectionState, EventKind, EventMask, Instance, ListenerSource, NetworkConfig,
    Role, SubscribeOptions, TableError, Value, ValueKind, json,
};
use serde_json::Map;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

fn server_config() -> NetworkConfig {
    NetworkConfig::new()
        .listen_addr("127.0.0.1:0".parse().unwrap())
        .keepalive(Duration::from_millis(100), Duration::from_secs(2))
}

fn client_config(server: SocketAddr, identity: &str) -> NetworkConfig {
    NetworkConfig::new()
        .server_addr(server)
        .identity(identity)
        .keepalive(Duration::from_millis(100), Duration::from_secs(2))
        .backoff(BackoffPolicy {
            max_retries: 0,
            base_delay_ms: 20,
            max_delay_ms: 100,
        })
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

fn double_at(nt: &Instance, name: &str) -> Option<f64> {
    let topic = nt.find_topic(name)?;
    nt.value(topic).ok()?.as_f64()
}

fn int_at(nt: &Instance, name: &str) -> Option<i64> {
    let topic = nt.find_topic(name)?;
    nt.value(topic).ok()?.as_i64()
}

async fn shutdown(instances: &[&Instance]) {
    for nt in instances {
        nt.stop_network().await;
        nt.destroy();
    }
}

#[tokio::test]
async fn test_server_value_reaches_subscribed_client() {
    let server = Instance::create().unwrap();
    let topic = server.topic("/x");
    let publisher = server.publish(topic, ValueKind::Double, Map::new()).unwrap();
    server.set(publisher, Value::double(1.0)).unwrap();
    let addr = server.start_server(server_config()).await.unwrap();

    let client = Instance::create().unwrap();
    client
        .subscribe(client.topic("/x"), SubscribeOptions::new())
        .unwrap();
    client
        .start_client(client_config(addr, "dashboard"))
        .await
        .unwrap();

    assert!(eventually(|| double_at(&client, "/x") == Some(1.0)).await);
    let info = client.topic_info(client.topic("/x")).unwrap();
    assert_eq!(info.kind, ValueKind::Double);
    assert!(info.announced);

    server.set(publisher, Value::double(2.0)).unwrap();
    assert!(eventually(|| double_at(&client, "/x") == Some(2.0)).await);

    shutdown(&[&client, &server]).await;
}

#[tokio::test]
async fn test_unsubscribed_client_sees_topic_but_no_value() {
    let server = Instance::create().unwrap();
    let topic = server.topic("/only/announced");
    let publisher = server.publish(topic, ValueKind::Integer, Map::new()).unwrap();
    server.set(publisher, Value::integer(7)).unwrap();
    let addr = server.start_server(server_config()).await.unwrap();

    let client = Instance::create().unwrap();
    client
        .start_client(client_config(addr, "observer"))
        .await
        .unwrap();

    assert!(eventually(|| client.find_topic("/only/announced").is_some()).await);
    assert!(eventually(|| client.is_connected()).await);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(int_at(&client, "/only/announced"), None);

    shutdown(&[&client, &server]).await;
}

#[tokio::test]
async fn test_client_write_reaches_server_and_other_clients() {
    let server = Instance::create().unwrap();
    let addr = server.start_server(server_config()).await.unwrap();

    let writer = Instance::create().unwrap();
    let topic = writer.topic("/coproc/targets");
    let publisher = writer.publish(topic, ValueKind::Integer, Map::new()).unwrap();
    writer
        .start_client(client_config(addr, "coprocessor"))
        .await
        .unwrap();

    let reader = Instance::create().unwrap();
    reader
        .subscribe(
            reader.topic("/coproc/"),
            SubscribeOptions::new().prefix(),
        )
        .unwrap();
    reader
        .start_client(client_config(addr, "dashboard"))
        .await
        .unwrap();

    assert!(eventually(|| writer.is_connected() && reader.is_connected()).await);
    writer.set(publisher, Value::integer(5)).unwrap();

    assert!(eventually(|| int_at(&server, "/coproc/targets") == Some(5)).await);
    assert!(eventually(|| int_at(&reader, "/coproc/targets") == Some(5)).await);

    shutdown(&[&writer, &reader, &server]).await;
}

#[tokio::test]
async fn test_multi_writer_converges_to_latest() {
    let server = Instance::create().unwrap();
    let addr = server.start_server(server_config()).await.unwrap();

    let a = Instance::create().unwrap();
    let b = Instance::create().unwrap();
    let mut publishers = Vec::new();
    for (nt, identity) in [(&a, "a"), (&b, "b")] {
        let topic = nt.topic("/shared");
        publishers.push(nt.publish(topic, ValueKind::Integer, Map::new()).unwrap());
        nt.subscribe(topic, SubscribeOptions::new()).unwrap();
        nt.start_client(client_config(addr, identity)).await.unwrap();
    }
    assert!(eventually(|| a.is_connected() && b.is_connected()).await);
    assert!(eventually(|| server.connections().len() == 2).await);

    a.set(publishers[0], Value::integer(1)).unwrap();
    assert!(eventually(|| int_at(&b, "/shared") == Some(1)).await);

    sleep(Duration::from_millis(50)).await;
    b.set(publishers[1], Value::integer(2)).unwrap();

    assert!(
        eventually(|| {
            int_at(&a, "/shared") == Some(2)
                && int_at(&b, "/shared") == Some(2)
                && int_at(&server, "/shared") == Some(2)
        })
        .await
    );

    shutdown(&[&a, &b, &server]).await;
}

#[tokio::test]
async fn test_unannounce_propagates_to_client() {
    let server = Instance::create().unwrap();
    let topic = server.topic("/temp/reading");
    let publisher = server.publish(topic, ValueKind::Double, Map::new()).unwrap();
    let addr = server.start_server(server_config()).await.unwrap();

    let client = Instance::create().unwrap();
    let poller = client.create_poller();
    client
        .add_poller_listener(
            poller,
            ListenerSource::Prefixes(vec!["/temp/".to_string()]),
            EventMask::PUBLISH | EventMask::UNPUBLISH,
        )
        .unwrap();
    client
        .start_client(client_config(addr, "viewer"))
        .await
        .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let drained = |client: &Instance| {
        let batch = client.try_read_poller(poller).unwrap();
        sink.lock().unwrap().extend(batch.into_iter().map(|e| e.kind));
    };

    assert!(
        eventually(|| {
            drained(&client);
            events.lock().unwrap().contains(&EventKind::Publish)
        })
        .await
    );

    server.release(publisher);
    assert!(
        eventually(|| {
            drained(&client);
            events.lock().unwrap().contains(&EventKind::Unpublish)
        })
        .await
    );
    let topic = client.find_topic("/temp/reading").unwrap();
    assert!(!client.topic_info(topic).unwrap().announced);

    shutdown(&[&client, &server]).await;
}

#[tokio::test]
async fn test_properties_flow_both_ways() {
    let server = Instance::create().unwrap();
    let topic = server.topic("/arm/limit");
    let mut props = Map::new();
    props.insert("unit".to_string(), json!("deg"));
    server.publish(topic, ValueKind::Double, props).unwrap();
    let addr = server.start_server(server_config()).await.unwrap();

    let client = Instance::create().unwrap();
    client
        .start_client(client_config(addr, "tuner"))
        .await
        .unwrap();

    assert!(
        eventually(|| {
            client
                .find_topic("/arm/limit")
                .and_then(|t| client.properties(t).ok())
                .is_some_and(|p| p.get("unit") == Some(&json!("deg")))
        })
        .await
    );
    assert!(eventually(|| client.is_connected()).await);

    let remote = client.find_topic("/arm/limit").unwrap();
    let mut update = Map::new();
    update.insert("max".to_string(), json!(90));
    client.set_properties(remote, update).unwrap();

    assert!(
        eventually(|| {
            server
                .properties(topic)
                .is_ok_and(|p| p.get("max") == Some(&json!(90)))
        })
        .await
    );

    shutdown(&[&client, &server]).await;
}

#[tokio::test]
async fn test_connection_events_and_listing() {
    let server = Instance::create().unwrap();
    let addr = server.start_server(server_config()).await.unwrap();
    assert_eq!(server.network_role(), Some(Role::Server));

    let server_poller = server.create_poller();
    server
        .add_poller_listener(server_poller, ListenerSource::Connections, EventMask::CONNECTION)
        .unwrap();

    let client = Instance::create().unwrap();
    client
        .start_client(client_config(addr, "driver-station"))
        .await
        .unwrap();
    assert_eq!(client.network_role(), Some(Role::Client));

    let events = server
        .read_poller(server_poller, Duration::from_secs(5))
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Connected);
    let info = events[0].connection().unwrap();
    assert_eq!(info.remote_id, "driver-station");
    assert_eq!(info.remote_instance, Some(client.id()));

    let listed = server.connections();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].state, ConnectionState::Synchronized);
    assert!(eventually(|| client.is_connected()).await);

    client.stop_network().await;
    let events = server
        .read_poller(server_poller, Duration::from_secs(5))
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Disconnected);
    assert!(eventually(|| server.connections().is_empty()).await);

    shutdown(&[&client, &server]).await;
}

#[tokio::test]
async fn test_client_resynchronizes_after_server_restart() {
    let server = Instance::create().unwrap();
    let topic = server.topic("/x");
    let publisher = server.publish(topic, ValueKind::Double, Map::new()).unwrap();
    server.set(publisher, Value::double(1.0)).unwrap();
    let addr = server.start_server(server_config()).await.unwrap();

    let client = Instance::create().unwrap();
    client
        .subscribe(client.topic("/x"), SubscribeOptions::new())
        .unwrap();
    client
        .start_client(client_config(addr, "robot-dash"))
        .await
        .unwrap();
    assert!(eventually(|| double_at(&client, "/x") == Some(1.0)).await);

    server.stop_network().await;
    assert!(eventually(|| !client.is_connected()).await);

    server.set(publisher, Value::double(3.0)).unwrap();
    let restarted = server
        .start_server(server_config().listen_addr(addr))
        .await
        .unwrap();
    assert_eq!(restarted, addr);

    assert!(eventually(|| client.is_connected()).await);
    assert!(eventually(|| double_at(&client, "/x") == Some(3.0)).await);

    shutdown(&[&client, &server]).await;
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let nt = Instance::create().unwrap();
    nt.start_server(server_config()).await.unwrap();

    let err = nt.start_server(server_config()).await.unwrap_err();
    assert!(matches!(err, TableError::AlreadyRunning));
    let err = nt
        .start_client(client_config("127.0.0.1:1".parse().unwrap(), "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::AlreadyRunning));

    nt.stop_network().await;
    assert_eq!(nt.network_role(), None);
    nt.start_server(server_config()).await.unwrap();
    shutdown(&[&nt]).await;
}

#[tokio::test]
async fn test_invalid_network_config_is_rejected() {
    let nt = Instance::create().unwrap();
    let bad = server_config().keepalive(Duration::from_millis(100), Duration::from_millis(50));
    let err = nt.start_server(bad).await.unwrap_err();
    assert!(matches!(err, TableError::Config(_)));
    assert_eq!(nt.network_role(), None);
    nt.destroy();
}

#[tokio::test]
async fn test_subscriber_announced_topic_is_typed_by_remote_publisher() {
    let server = Instance::create().unwrap();
    let topic = server.topic("/sub/only");
    let subscriber = server.subscribe(topic, SubscribeOptions::new()).unwrap();
    assert!(server.topic_info(topic).unwrap().announced);
    let addr = server.start_server(server_config()).await.unwrap();

    // A watcher connected before anything has a type sees no announcement.
    let watcher = Instance::create().unwrap();
    let poller = watcher.create_poller();
    watcher
        .add_poller_listener(
            poller,
            ListenerSource::Prefixes(vec!["/sub/".to_string()]),
            EventMask::PUBLISH | EventMask::VALUE_ALL,
        )
        .unwrap();
    watcher
        .start_client(client_config(addr, "watcher"))
        .await
        .unwrap();
    assert!(eventually(|| watcher.is_connected()).await);
    sleep(Duration::from_millis(100)).await;
    assert!(watcher.find_topic("/sub/only").is_none());

    let writer = Instance::create().unwrap();
    let publisher = writer
        .publish(writer.topic("/sub/only"), ValueKind::Double, Map::new())
        .unwrap();
    writer.set(publisher, Value::double(4.5)).unwrap();
    writer
        .start_client(client_config(addr, "writer"))
        .await
        .unwrap();

    assert!(eventually(|| server.get(subscriber).ok().and_then(|v| v.as_f64()) == Some(4.5)).await);
    assert_eq!(server.topic_info(topic).unwrap().kind, ValueKind::Double);

    // The binding reaches the watcher as a typed announcement plus the value.
    assert!(eventually(|| double_at(&watcher, "/sub/only") == Some(4.5)).await);
    let watched = watcher.find_topic("/sub/only").unwrap();
    assert_eq!(watcher.topic_info(watched).unwrap().kind, ValueKind::Double);
    let kinds: Vec<EventKind> = watcher
        .try_read_poller(poller)
        .unwrap()
        .iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds.first(), Some(&EventKind::Publish));

    shutdown(&[&writer, &watcher, &server]).await;
}

#[tokio::test]
async fn test_client_subscriber_announces_locally_only() {
    let server = Instance::create().unwrap();
    let addr = server.start_server(server_config()).await.unwrap();

    let client = Instance::create().unwrap();
    let topic = client.topic("/wanted");
    client.subscribe(topic, SubscribeOptions::new()).unwrap();
    client
        .start_client(client_config(addr, "reader"))
        .await
        .unwrap();
    assert!(eventually(|| client.is_connected()).await);
    sleep(Duration::from_millis(100)).await;

    assert!(client.topic_info(topic).unwrap().announced);
    // An intent to read does not make the server believe anyone publishes it.
    assert!(server.topics("").is_empty());

    let server_topic = server.topic("/wanted");
    let publisher = server
        .publish(server_topic, ValueKind::Integer, Map::new())
        .unwrap();
    server.set(publisher, Value::integer(12)).unwrap();
    assert!(eventually(|| int_at(&client, "/wanted") == Some(12)).await);
    assert_eq!(client.topic_info(topic).unwrap().kind, ValueKind::Integer);

    shutdown(&[&client, &server]).await;
}
