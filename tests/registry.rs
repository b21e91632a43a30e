use std::sync::Arc;
use std::time::Duration;

use canvas_fanout::websocket::{CloseState, Connection, Frame, Registry};
use canvas_fanout::{AdmissionError, PoolConfig};
use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type Ws = WebSocketStream<DuplexStream>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn config(workers: usize, per_worker: usize) -> PoolConfig {
    PoolConfig {
        workers,
        max_connections_per_worker: per_worker,
        ..PoolConfig::default()
    }
}

/// Server and client ends of an already-upgraded websocket.
async fn ws_pair() -> (Ws, Ws) {
    ws_pair_with_buffer(64 * 1024).await
}

/// Same, with a pipe that only holds `buffer` bytes the client has not read.
async fn ws_pair_with_buffer(buffer: usize) -> (Ws, Ws) {
    let (server_io, client_io) = tokio::io::duplex(buffer);
    tokio::join!(
        WebSocketStream::from_raw_socket(server_io, Role::Server, None),
        WebSocketStream::from_raw_socket(client_io, Role::Client, None),
    )
}

async fn admit(registry: &Registry) -> Result<(Arc<Connection>, Ws), AdmissionError> {
    let (server, client) = ws_pair().await;
    registry.add(server).await.map(|conn| (conn, client))
}

fn worker_gauge_sum(registry: &Registry) -> usize {
    registry
        .pool()
        .workers()
        .iter()
        .map(|w| w.metrics().active_connections())
        .sum()
}

fn assert_counts_consistent(registry: &Registry, expected: usize) {
    assert_eq!(registry.connection_count(), expected);
    assert_eq!(worker_gauge_sum(registry), expected);
    assert_eq!(registry.pool().metrics().active_connections(), expected);
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + RECV_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Next data frame on the client side, skipping control frames.
async fn next_data(client: &mut Ws) -> Option<Message> {
    loop {
        match timeout(RECV_TIMEOUT, client.next()).await {
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            Ok(Some(Ok(message))) => return Some(message),
            _ => return None,
        }
    }
}

/// Reads control and data frames until `window` has passed, returning the
/// number of pings seen.
async fn count_pings(client: &mut Ws, window: Duration) -> usize {
    let deadline = Instant::now() + window;
    let mut pings = 0;
    while let Ok(Some(Ok(message))) = timeout_at(deadline, client.next()).await {
        if matches!(message, Message::Ping(_)) {
            pings += 1;
        }
    }
    pings
}

#[tokio::test]
async fn test_two_workers_capacity_one_scenario() {
    let registry = Registry::new(config(2, 1));

    let (a, _client_a) = admit(&registry).await.expect("A admitted");
    assert_eq!(a.worker_id(), 0);

    let (b, _client_b) = admit(&registry).await.expect("B admitted");
    assert_eq!(b.worker_id(), 1);

    let refused = admit(&registry).await;
    assert!(matches!(
        refused,
        Err(AdmissionError::CapacityExhausted { workers: 2, per_worker: 1 })
    ));
    assert_counts_consistent(&registry, 2);

    assert!(registry.remove(&a).await);
    assert_eq!(registry.pool().workers()[0].metrics().active_connections(), 0);
    assert_counts_consistent(&registry, 1);

    let (c, _client_c) = admit(&registry).await.expect("C admitted after removal");
    assert_eq!(c.worker_id(), 0);
    assert_counts_consistent(&registry, 2);

    registry.close();
}

#[tokio::test]
async fn test_placement_is_least_loaded_up_to_total_capacity() {
    let registry = Registry::new(config(3, 2));
    let mut clients = Vec::new();

    for expected_worker in [0, 1, 2, 0, 1, 2] {
        let (conn, client) = admit(&registry).await.expect("within capacity");
        assert_eq!(conn.worker_id(), expected_worker);
        clients.push((conn, client));
        assert_counts_consistent(&registry, clients.len());
    }

    assert!(admit(&registry).await.is_err());
    assert_counts_consistent(&registry, 6);

    // Freeing a slot on worker 1 makes it the only candidate.
    assert!(registry.remove(&clients[4].0).await);
    let (conn, _client) = admit(&registry).await.expect("slot freed");
    assert_eq!(conn.worker_id(), 1);

    registry.close();
}

#[tokio::test]
async fn test_connection_ids_are_unique() {
    let registry = Registry::new(config(2, 4));
    let mut ids = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..8 {
        let (conn, client) = admit(&registry).await.unwrap();
        ids.push(conn.id());
        clients.push(client);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    registry.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_never_exceed_capacity() {
    let registry = Registry::new(config(4, 5));

    let mut tasks = Vec::new();
    for _ in 0..30 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move { admit(&registry).await }));
    }

    let mut admitted = Vec::new();
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(pair) => admitted.push(pair),
            Err(AdmissionError::CapacityExhausted { .. }) => refused += 1,
            Err(e) => panic!("unexpected admission error: {}", e),
        }
    }

    assert_eq!(admitted.len(), 20);
    assert_eq!(refused, 10);
    for worker in registry.pool().workers() {
        assert_eq!(worker.metrics().active_connections(), 5);
        assert_eq!(worker.connections().len().await, 5);
    }
    assert_counts_consistent(&registry, 20);

    registry.close();
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let registry = Registry::new(config(1, 4));
    let (conn, _client) = admit(&registry).await.unwrap();
    let (_other, _other_client) = admit(&registry).await.unwrap();
    assert_counts_consistent(&registry, 2);

    assert!(registry.remove(&conn).await);
    assert!(!registry.remove(&conn).await);
    assert_counts_consistent(&registry, 1);
    assert_ne!(conn.state(), CloseState::Open);
    assert!(!registry.pool().workers()[0].connections().contains(conn.id()).await);

    registry.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_remove_decrements_once() {
    let registry = Registry::new(config(2, 4));
    let (conn, _client) = admit(&registry).await.unwrap();
    assert_counts_consistent(&registry, 1);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = registry.clone();
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move { registry.remove(&conn).await }));
    }

    let mut removed = 0;
    for task in tasks {
        if task.await.unwrap() {
            removed += 1;
        }
    }
    assert_eq!(removed, 1);
    assert_counts_consistent(&registry, 0);

    registry.close();
}

#[tokio::test]
async fn test_removed_connection_transport_is_closed() {
    let registry = Registry::new(config(1, 1));
    let (conn, mut client) = admit(&registry).await.unwrap();

    registry.remove(&conn).await;

    match timeout(RECV_TIMEOUT, client.next()).await {
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => {}
        other => panic!("expected the server to close, got {:?}", other),
    }
    assert!(wait_until(|| conn.state() == CloseState::Closed).await);

    registry.close();
}

#[tokio::test]
async fn test_broadcast_reaches_every_worker() {
    let registry = Registry::new(config(2, 2));
    registry.start();

    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(admit(&registry).await.unwrap());
    }

    let report = registry.broadcast(vec![7u8, 0, 3, 255]);
    assert_eq!(report.enqueued, 2);
    assert_eq!(report.dropped, 0);

    for (_, client) in clients.iter_mut() {
        assert_eq!(next_data(client).await, Some(Message::Binary(vec![7, 0, 3, 255])));
    }

    let stats = registry.stats();
    assert_eq!(stats.total_messages, 1);
    assert_eq!(stats.dropped_messages, 0);

    registry.close();
}

#[tokio::test]
async fn test_messages_arrive_in_broadcast_order() {
    let registry = Registry::new(PoolConfig {
        queue_capacity: 16,
        ..config(1, 1)
    });
    registry.start();
    let (_conn, mut client) = admit(&registry).await.unwrap();

    for i in 0..10u8 {
        registry.broadcast(vec![i]);
    }
    for i in 0..10u8 {
        assert_eq!(next_data(&mut client).await, Some(Message::Binary(vec![i])));
    }

    registry.close();
}

#[tokio::test]
async fn test_full_queue_drops_for_that_worker_only() {
    let registry = Registry::new(PoolConfig {
        queue_capacity: 1,
        ..config(2, 1)
    });
    let worker0 = registry.pool().worker(0).unwrap().clone();
    let worker1 = registry.pool().worker(1).unwrap().clone();
    // worker 0 never drains
    worker1.spawn().expect("worker 1 starts");

    let (_a, _client_a) = admit(&registry).await.unwrap();
    let (_b, mut client_b) = admit(&registry).await.unwrap();

    let filler = Arc::new(Message::Binary(b"filler".to_vec()));
    assert_eq!(worker0.enqueue(filler), canvas_fanout::websocket::Enqueue::Accepted);

    let report = registry.broadcast(b"pixel".to_vec());
    assert_eq!(report.enqueued, 1);
    assert_eq!(report.dropped, 1);
    assert_eq!(worker0.metrics().dropped_messages(), 1);
    assert_eq!(worker1.metrics().dropped_messages(), 0);

    assert_eq!(next_data(&mut client_b).await, Some(Message::Binary(b"pixel".to_vec())));
    assert_eq!(registry.stats().dropped_messages, 1);

    registry.close();
}

#[tokio::test]
async fn test_stale_connection_swept_after_threshold_only() {
    let registry = Registry::new(PoolConfig {
        ping_interval_ms: 100,
        stale_after_ms: 250,
        ..config(1, 2)
    });
    let worker = registry.pool().worker(0).unwrap().clone();

    // Workers are not running, so no pings go out and no pongs come back.
    let (conn, _client) = admit(&registry).await.unwrap();

    assert_eq!(worker.sweep_stale().await, 0);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(worker.sweep_stale().await, 0);
    assert!(conn.is_open());

    sleep(Duration::from_millis(250)).await;
    assert_eq!(worker.sweep_stale().await, 1);
    assert!(!conn.is_open());
    assert_counts_consistent(&registry, 0);

    // Already gone; a second sweep finds nothing.
    assert_eq!(worker.sweep_stale().await, 0);
    registry.close();
}

#[tokio::test]
async fn test_pongs_keep_connection_alive() {
    let registry = Registry::new(PoolConfig {
        ping_interval_ms: 40,
        stale_after_ms: 250,
        sweep_interval_ms: 40,
        ..config(1, 2)
    });
    registry.start();

    let (conn, client) = admit(&registry).await.unwrap();
    let (_silent, _silent_client) = admit(&registry).await.unwrap();

    // Reading drives the client's automatic pong replies.
    let reader = tokio::spawn(async move {
        let mut client = client;
        while let Some(Ok(_)) = client.next().await {}
    });

    sleep(Duration::from_millis(700)).await;
    assert!(conn.is_open());
    assert!(conn.idle_for() < Duration::from_millis(250));
    assert_counts_consistent(&registry, 1);

    registry.close();
    reader.abort();
}

#[tokio::test]
async fn test_client_close_removes_connection() {
    let registry = Registry::new(config(1, 2));
    let (conn, mut client) = admit(&registry).await.unwrap();
    assert_counts_consistent(&registry, 1);

    client.close(None).await.unwrap();

    assert!(wait_until(|| registry.connection_count() == 0).await);
    assert!(!conn.is_open());
    assert_counts_consistent(&registry, 0);

    registry.close();
}

#[tokio::test]
async fn test_oversized_frame_evicts_client() {
    let registry = Registry::new(PoolConfig {
        max_frame_bytes: 16,
        ..config(1, 2)
    });
    let (conn, mut client) = admit(&registry).await.unwrap();

    client.send(Message::Binary(vec![0u8; 8])).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    assert!(conn.is_open());

    client.send(Message::Binary(vec![0u8; 64])).await.unwrap();
    assert!(wait_until(|| !conn.is_open()).await);
    assert_counts_consistent(&registry, 0);

    registry.close();
}

#[tokio::test]
async fn test_close_tears_down_connections() {
    let registry = Registry::new(config(2, 2));
    registry.start();

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(admit(&registry).await.unwrap());
    }
    assert_counts_consistent(&registry, 3);

    registry.close();

    assert!(wait_until(|| registry.connection_count() == 0).await);
    assert_counts_consistent(&registry, 0);
    for (conn, _) in &clients {
        assert!(wait_until(|| conn.state() == CloseState::Closed).await);
    }
    assert!(matches!(admit(&registry).await, Err(AdmissionError::ShuttingDown)));

    // Broadcasts after shutdown are dropped, not errors.
    sleep(Duration::from_millis(50)).await;
    let report = registry.broadcast(vec![1u8]);
    assert_eq!(report.enqueued + report.dropped, 2);
}

#[tokio::test]
async fn test_wedged_client_costs_one_write_timeout_per_pass() {
    let registry = Registry::new(PoolConfig {
        write_timeout_ms: 100,
        ..config(1, 2)
    });
    let worker = registry.pool().worker(0).unwrap().clone();

    // This client never reads and its pipe only holds a few bytes.
    let (server, _wedged_client) = ws_pair_with_buffer(64).await;
    let wedged = registry.add(server).await.unwrap();
    let (healthy, mut healthy_client) = admit(&registry).await.unwrap();

    let batch: Vec<Frame> = (0..10u8)
        .map(|i| Arc::new(Message::Binary(vec![i; 4096])))
        .collect();

    let started = Instant::now();
    let failures = worker.send_batch(&batch).await;
    let elapsed = started.elapsed();

    assert_eq!(failures, 1);
    assert!(elapsed < Duration::from_millis(500), "pass took {:?}", elapsed);
    assert!(!wedged.is_open());
    assert!(healthy.is_open());
    assert_counts_consistent(&registry, 1);

    // The failure did not cost the other client any frame.
    for i in 0..10u8 {
        assert_eq!(next_data(&mut healthy_client).await, Some(Message::Binary(vec![i; 4096])));
    }

    registry.close();
}

#[tokio::test]
async fn test_pings_continue_while_a_pass_is_stalled() {
    let registry = Registry::new(PoolConfig {
        ping_interval_ms: 50,
        write_timeout_ms: 2_000,
        ..config(1, 2)
    });
    registry.start();

    let (server, _wedged_client) = ws_pair_with_buffer(64).await;
    let wedged = registry.add(server).await.unwrap();
    let (_healthy, mut healthy_client) = admit(&registry).await.unwrap();

    // Writing this to the wedged client blocks the drain until the write
    // timeout.
    registry.broadcast(vec![9u8; 4096]);

    let pings = count_pings(&mut healthy_client, Duration::from_millis(600)).await;
    assert!(wedged.is_open(), "the pass should still be stalled");
    assert!(pings >= 3, "only {} pings during the stalled pass", pings);

    registry.close();
}

#[tokio::test]
async fn test_every_connection_is_pinged_each_tick() {
    let registry = Registry::new(PoolConfig {
        ping_interval_ms: 50,
        ..config(1, 4)
    });
    registry.start();

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(admit(&registry).await.unwrap());
    }

    sleep(Duration::from_millis(330)).await;

    for (conn, client) in clients.iter_mut() {
        let pings = count_pings(client, Duration::from_millis(100)).await;
        assert!(pings >= 4, "client {} saw only {} pings", conn.id(), pings);
        assert!(conn.is_open());
    }
    assert_counts_consistent(&registry, 3);

    registry.close();
}

#[tokio::test]
async fn test_failed_ping_evicts_connection() {
    // Pong wait, staleness and the sweep are far away, so only the ping
    // write can remove the connection.
    let registry = Registry::new(PoolConfig {
        ping_interval_ms: 30,
        write_timeout_ms: 50,
        ..config(1, 2)
    });
    registry.start();

    // Room for one ping frame; the client never reads it.
    let (server, _wedged_client) = ws_pair_with_buffer(2).await;
    let wedged = registry.add(server).await.unwrap();
    let (healthy, healthy_client) = admit(&registry).await.unwrap();
    let reader = tokio::spawn(async move {
        let mut client = healthy_client;
        while let Some(Ok(_)) = client.next().await {}
    });

    assert!(wait_until(|| !wedged.is_open()).await);
    assert!(healthy.is_open());
    assert_counts_consistent(&registry, 1);
    assert!(!registry.pool().workers()[0].connections().contains(wedged.id()).await);

    registry.close();
    reader.abort();
}
