//! End-to-end scenarios: real sockets, scripted backends, one proxy.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{set_topology, shared_topology, BackendOptions, FakeBackend, TestClient};
use ferry_proxy::{ConnPool, Dispatcher, DispatcherHandle, Proxy, ProxyConfig};
use ferry_resp::RespValue;

// Reference slots: foo -> 12182, bar -> 5061, user1000 -> 1649.

fn base_config(startup: &FakeBackend) -> ProxyConfig {
    ProxyConfig::new(0, vec![Arc::clone(&startup.addr)])
        // Keep the reload loop quiet unless a test wants it.
        .with_slot_reload_interval(Duration::from_secs(60))
        .with_backend_read_timeout(Duration::from_secs(10))
}

async fn start_proxy(config: ProxyConfig) -> (SocketAddr, DispatcherHandle) {
    let config = Arc::new(config);
    let pool = ConnPool::new(8, Duration::from_millis(500));
    let (dispatcher, handle) = Dispatcher::new(Arc::clone(&config), pool);
    dispatcher.init_slot_table().await.unwrap();
    tokio::spawn(dispatcher.run());

    let proxy = Proxy::new(config, handle.clone());
    let listener = proxy.bind().unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = proxy.serve(listener).await;
    });
    (SocketAddr::from(([127, 0, 0, 1], port)), handle)
}

async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting: {description}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_basic_routing_forwards_request_and_reply() {
    let topology = shared_topology();
    let b1 = FakeBackend::spawn(
        topology.clone(),
        BackendOptions::replying(|_| RespValue::bulk("bar-value")),
    )
    .await;
    set_topology(&topology, vec![(0, 16383, Arc::clone(&b1.addr))]);

    let (proxy_addr, _handle) = start_proxy(base_config(&b1)).await;
    let mut client = TestClient::connect(proxy_addr).await;

    client.send(&[b"GET", b"foo"]).await;
    assert_eq!(client.read_reply().await, RespValue::bulk("bar-value"));
    assert_eq!(*b1.seen.lock().unwrap(), vec!["GET foo".to_string()]);
}

#[tokio::test]
async fn test_queue_overflow_rejects_excess_and_recovers() {
    let topology = shared_topology();
    let b1 = FakeBackend::spawn(topology.clone(), BackendOptions::default().stalled()).await;
    set_topology(&topology, vec![(0, 16383, Arc::clone(&b1.addr))]);

    // One connection, pipeline depth 1, queue of 2: the stalled backend
    // absorbs three requests (one matching a reply, one queued in flight,
    // one in the writer's hand), two wait in the runner queue, the sixth
    // overflows.
    let config = base_config(&b1)
        .with_backend_connections(1)
        .with_pipeline_depth(1)
        .with_backend_queue_size(2);
    let (proxy_addr, _handle) = start_proxy(config).await;
    let mut client = TestClient::connect(proxy_addr).await;

    for _ in 0..6 {
        client.send(&[b"GET", b"foo"]).await;
        // Let each request settle into its final position.
        tokio::time::sleep(Duration::from_millis(60)).await;
    }
    client.expect_silence(Duration::from_millis(200)).await;

    b1.resume();
    for _ in 0..5 {
        assert_eq!(client.read_reply().await, RespValue::ok());
    }
    let overflow = client.read_reply().await;
    let message = overflow.as_error().expect("expected an error reply");
    assert!(message.contains("queue overflow"), "got: {message}");
}

#[tokio::test]
async fn test_moved_redirection_follows_target() {
    let topology = shared_topology();
    let b2 = FakeBackend::spawn(
        topology.clone(),
        BackendOptions::replying(|_| RespValue::simple("from-b2")),
    )
    .await;
    let b2_addr = Arc::clone(&b2.addr);
    let b1 = FakeBackend::spawn(
        topology.clone(),
        BackendOptions::replying(move |_| {
            RespValue::error(format!("MOVED 12182 {b2_addr}"))
        }),
    )
    .await;
    set_topology(&topology, vec![(0, 16383, Arc::clone(&b1.addr))]);

    let (proxy_addr, _handle) = start_proxy(base_config(&b1)).await;
    let mut client = TestClient::connect(proxy_addr).await;

    client.send(&[b"GET", b"foo"]).await;
    assert_eq!(client.read_reply().await, RespValue::simple("from-b2"));
    assert_eq!(*b1.seen.lock().unwrap(), vec!["GET foo".to_string()]);
    assert_eq!(*b2.seen.lock().unwrap(), vec!["GET foo".to_string()]);
}

#[tokio::test]
async fn test_ask_redirection_prefixes_asking() {
    let topology = shared_topology();
    let b2 = FakeBackend::spawn(
        topology.clone(),
        BackendOptions::replying(|cmd| {
            if cmd.name() == "ASKING" {
                RespValue::ok()
            } else {
                RespValue::simple("from-b2")
            }
        }),
    )
    .await;
    let b2_addr = Arc::clone(&b2.addr);
    let b1 = FakeBackend::spawn(
        topology.clone(),
        BackendOptions::replying(move |_| RespValue::error(format!("ASK 12182 {b2_addr}"))),
    )
    .await;
    set_topology(&topology, vec![(0, 16383, Arc::clone(&b1.addr))]);

    let (proxy_addr, _handle) = start_proxy(base_config(&b1)).await;
    let mut client = TestClient::connect(proxy_addr).await;

    client.send(&[b"GET", b"foo"]).await;
    assert_eq!(client.read_reply().await, RespValue::simple("from-b2"));
    // The ASKING prefix travels on the same connection, before the retry.
    assert_eq!(
        *b2.seen.lock().unwrap(),
        vec!["ASKING".to_string(), "GET foo".to_string()]
    );
}

#[tokio::test]
async fn test_redirect_limit_surfaces_reply_verbatim() {
    let topology = shared_topology();
    // A backend that always redirects to itself: an endless loop unless the
    // proxy enforces the redirect bound. Its own address is only known after
    // the listener binds, so the closure reads it through a cell.
    let self_addr: Arc<std::sync::Mutex<Option<Arc<str>>>> =
        Arc::new(std::sync::Mutex::new(None));
    let addr_for_reply = Arc::clone(&self_addr);
    let b1 = FakeBackend::spawn(
        topology.clone(),
        BackendOptions::replying(move |_| {
            let addr = addr_for_reply
                .lock()
                .unwrap()
                .clone()
                .expect("backend address not recorded yet");
            RespValue::error(format!("MOVED 12182 {addr}"))
        }),
    )
    .await;
    *self_addr.lock().unwrap() = Some(Arc::clone(&b1.addr));
    set_topology(&topology, vec![(0, 16383, Arc::clone(&b1.addr))]);

    let (proxy_addr, _handle) = start_proxy(base_config(&b1).with_redirect_limit(2)).await;
    let mut client = TestClient::connect(proxy_addr).await;

    client.send(&[b"GET", b"foo"]).await;
    let reply = client.read_reply().await;
    let message = reply.as_error().expect("expected the redirection to surface");
    assert!(message.starts_with("MOVED 12182"), "got: {message}");
    // Initial attempt plus two redirect retries.
    assert_eq!(b1.seen_count(), 3);
}

#[tokio::test]
async fn test_reload_is_throttled_under_burst() {
    let topology = shared_topology();
    let b1 = FakeBackend::spawn(topology.clone(), BackendOptions::default()).await;
    set_topology(&topology, vec![(0, 16383, Arc::clone(&b1.addr))]);

    let config = base_config(&b1).with_slot_reload_interval(Duration::from_millis(100));
    let (_proxy_addr, handle) = start_proxy(config).await;

    // One query for the initial table load.
    assert_eq!(b1.cluster_queries.load(std::sync::atomic::Ordering::SeqCst), 1);

    // A burst of triggers coalesces into a single reload.
    for _ in 0..10 {
        handle.trigger_reload_slots();
    }
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(b1.cluster_queries.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_out_of_order_completion_is_reordered_per_session() {
    let topology = shared_topology();
    let b1 = FakeBackend::spawn(
        topology.clone(),
        BackendOptions::replying(|_| RespValue::simple("b1"))
            .with_delay(Duration::from_millis(300)),
    )
    .await;
    let b2 = FakeBackend::spawn(
        topology.clone(),
        BackendOptions::replying(|_| RespValue::simple("b2")),
    )
    .await;
    set_topology(
        &topology,
        vec![
            (0, 8191, Arc::clone(&b1.addr)),
            (8192, 16383, Arc::clone(&b2.addr)),
        ],
    );

    let (proxy_addr, _handle) = start_proxy(base_config(&b1)).await;
    let mut client = TestClient::connect(proxy_addr).await;

    // bar (5061) routes to the slow backend, foo (12182) to the fast one.
    // The fast reply completes first but must be emitted second.
    client.send(&[b"GET", b"bar"]).await;
    client.send(&[b"GET", b"foo"]).await;

    assert_eq!(client.read_reply().await, RespValue::simple("b1"));
    assert_eq!(client.read_reply().await, RespValue::simple("b2"));
}

#[tokio::test]
async fn test_backend_crash_fails_inflight_and_recovers() {
    let topology = shared_topology();
    let b1 = FakeBackend::spawn(topology.clone(), BackendOptions::default().stalled()).await;
    set_topology(&topology, vec![(0, 16383, Arc::clone(&b1.addr))]);

    let config = base_config(&b1)
        .with_backend_connections(2)
        .with_pipeline_depth(16);
    let (proxy_addr, _handle) = start_proxy(config).await;
    let mut client = TestClient::connect(proxy_addr).await;

    for _ in 0..10 {
        client.send(&[b"GET", b"foo"]).await;
    }
    wait_until("backend to receive all 10 requests", || b1.seen_count() == 10).await;

    b1.close_all();
    for _ in 0..10 {
        let reply = client.read_reply().await;
        let message = reply.as_error().expect("expected a failure reply");
        assert!(message.contains("unreachable"), "got: {message}");
    }

    // Fresh backend sessions come up against the same address; once the
    // backend answers again, traffic flows normally.
    b1.resume();
    client.send(&[b"GET", b"foo"]).await;
    assert_eq!(client.read_reply().await, RespValue::ok());
}

#[tokio::test]
async fn test_bulk_topology_change_moves_traffic() {
    let topology = shared_topology();
    let b1 = FakeBackend::spawn(
        topology.clone(),
        BackendOptions::replying(|_| RespValue::simple("b1")),
    )
    .await;
    let b2 = FakeBackend::spawn(
        topology.clone(),
        BackendOptions::replying(|_| RespValue::simple("b2")),
    )
    .await;
    let b3 = FakeBackend::spawn(
        topology.clone(),
        BackendOptions::replying(|_| RespValue::simple("b3")),
    )
    .await;
    let b4 = FakeBackend::spawn(
        topology.clone(),
        BackendOptions::replying(|_| RespValue::simple("b4")),
    )
    .await;
    set_topology(
        &topology,
        vec![
            (0, 5000, Arc::clone(&b1.addr)),
            (5001, 10000, Arc::clone(&b2.addr)),
            (10001, 16383, Arc::clone(&b3.addr)),
        ],
    );

    let config = base_config(&b1).with_slot_reload_interval(Duration::from_millis(100));
    let (proxy_addr, handle) = start_proxy(config).await;
    let mut client = TestClient::connect(proxy_addr).await;

    // Touch all three owners so their runners exist.
    client.send(&[b"GET", b"user1000"]).await; // 1649  -> b1
    client.send(&[b"GET", b"bar"]).await; //      5061  -> b2
    client.send(&[b"GET", b"foo"]).await; //      12182 -> b3
    assert_eq!(client.read_reply().await, RespValue::simple("b1"));
    assert_eq!(client.read_reply().await, RespValue::simple("b2"));
    assert_eq!(client.read_reply().await, RespValue::simple("b3"));

    // The cluster reshapes to {b1, b4}; b2 and b3 lose everything.
    set_topology(
        &topology,
        vec![
            (0, 8191, Arc::clone(&b1.addr)),
            (8192, 16383, Arc::clone(&b4.addr)),
        ],
    );
    handle.trigger_reload_slots();

    // Once the new table lands, foo belongs to b4 (lazily created) and bar
    // to b1; no new request reaches the retired runners.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        client.send(&[b"GET", b"foo"]).await;
        if client.read_reply().await == RespValue::simple("b4") {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "reload never reached the slot table"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    client.send(&[b"GET", b"bar"]).await;
    assert_eq!(client.read_reply().await, RespValue::simple("b1"));
}

#[tokio::test]
async fn test_multi_key_command_spans_backends() {
    let topology = shared_topology();
    let reply_with_key = |cmd: &ferry_resp::Command| {
        let key = String::from_utf8_lossy(cmd.key().unwrap_or(b"?")).to_string();
        RespValue::bulk(format!("v-{key}"))
    };
    let b1 = FakeBackend::spawn(topology.clone(), BackendOptions::replying(reply_with_key)).await;
    let b2 = FakeBackend::spawn(topology.clone(), BackendOptions::replying(reply_with_key)).await;
    set_topology(
        &topology,
        vec![
            (0, 8191, Arc::clone(&b1.addr)),
            (8192, 16383, Arc::clone(&b2.addr)),
        ],
    );

    let (proxy_addr, _handle) = start_proxy(base_config(&b1)).await;
    let mut client = TestClient::connect(proxy_addr).await;

    // foo and bar live on different backends; replies come back in argument
    // order regardless.
    client.send(&[b"MGET", b"foo", b"bar"]).await;
    assert_eq!(
        client.read_reply().await,
        RespValue::Array(vec![
            RespValue::bulk("v-foo"),
            RespValue::bulk("v-bar"),
        ])
    );
    assert_eq!(*b1.seen.lock().unwrap(), vec!["GET bar".to_string()]);
    assert_eq!(*b2.seen.lock().unwrap(), vec!["GET foo".to_string()]);
}

#[tokio::test]
async fn test_ping_is_answered_locally_in_order() {
    let topology = shared_topology();
    let b1 = FakeBackend::spawn(
        topology.clone(),
        BackendOptions::replying(|_| RespValue::ok()).with_delay(Duration::from_millis(100)),
    )
    .await;
    set_topology(&topology, vec![(0, 16383, Arc::clone(&b1.addr))]);

    let (proxy_addr, _handle) = start_proxy(base_config(&b1)).await;
    let mut client = TestClient::connect(proxy_addr).await;

    // The PING reply is produced instantly but must still follow the
    // earlier, slower GET.
    client.send(&[b"GET", b"foo"]).await;
    client.send(&[b"PING"]).await;
    assert_eq!(client.read_reply().await, RespValue::ok());
    assert_eq!(client.read_reply().await, RespValue::simple("PONG"));
}

#[tokio::test]
async fn test_single_range_update_through_handle() {
    let topology = shared_topology();
    let b1 = FakeBackend::spawn(
        topology.clone(),
        BackendOptions::replying(|_| RespValue::simple("b1")),
    )
    .await;
    let b2 = FakeBackend::spawn(
        topology.clone(),
        BackendOptions::replying(|_| RespValue::simple("b2")),
    )
    .await;
    set_topology(&topology, vec![(0, 16383, Arc::clone(&b1.addr))]);

    let (proxy_addr, handle) = start_proxy(base_config(&b1)).await;
    let mut client = TestClient::connect(proxy_addr).await;

    client.send(&[b"GET", b"foo"]).await;
    assert_eq!(client.read_reply().await, RespValue::simple("b1"));

    // A control-plane push moves foo's slot to b2.
    handle
        .update_slot_info(ferry_proxy::SlotInfo::new(
            ferry_core::Slot::new(12182),
            ferry_core::Slot::new(12182),
            Arc::clone(&b2.addr),
            Vec::new(),
        ))
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        client.send(&[b"GET", b"foo"]).await;
        if client.read_reply().await == RespValue::simple("b2") {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "single-range update never applied"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
