mod common;

use std::sync::Arc;

use common::*;
use tidemark::engine::Bucket;
use tidemark::protocol::Status;
use tidemark::server::{run_listener, ListenerConfig, WorkerPool};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// The whole stack over a real socket: accept → worker → state machine →
// SASL → bucket engine → checkpoint log → responses in request order.
#[tokio::test]
async fn full_round_trip_over_tcp() {
    let ctx = test_context();
    let bucket = Arc::new(Bucket::new("default", 4, small_config()));
    ctx.add_bucket("default", Arc::clone(&bucket) as _);

    let pool = Arc::new(WorkerPool::new(Arc::clone(&ctx)).expect("worker pool"));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_listener(
        listener,
        Arc::clone(&pool),
        ListenerConfig {
            tls: None,
            tcp_nodelay: true,
        },
    ));

    let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");

    let mut script = Vec::new();
    script.extend_from_slice(&sasl_plain_frame("app", "app-secret", 1));
    script.extend_from_slice(&select_bucket_frame("default", 2));
    script.extend_from_slice(&set_frame(3, "net-key", b"net-value", 3));
    script.extend_from_slice(&get_frame(3, "net-key", 4));
    script.extend_from_slice(&quit_frame(5));
    stream.write_all(&script).await.expect("write script");

    // QUIT closes the connection after its response, so the stream drains
    // to EOF.
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("read responses");

    let responses = parse_responses(&raw);
    assert_eq!(responses.len(), 5);
    for (i, response) in responses.iter().enumerate() {
        assert_eq!(response.opaque, i as u32 + 1, "responses in request order");
        assert_eq!(response.status, Status::Success.as_u16());
    }
    assert_eq!(responses[3].value, b"net-value");

    // The write is visible in the partition's checkpoint log.
    let manager = bucket.manager(3).unwrap();
    assert_eq!(manager.num_open_items(), 1);
    assert_eq!(manager.high_seqno(), 1);
}

#[tokio::test]
async fn connections_are_distributed_across_workers() {
    let ctx = test_context();
    let pool = Arc::new(WorkerPool::new(Arc::clone(&ctx)).expect("worker pool"));
    assert_eq!(pool.len(), ctx.settings.num_worker_threads);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_listener(
        listener,
        Arc::clone(&pool),
        ListenerConfig::default(),
    ));

    // More concurrent clients than workers; every one of them gets served.
    let mut clients = Vec::new();
    for opaque in 0..8u32 {
        clients.push(tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
            let mut script = noop_frame(opaque);
            script.extend_from_slice(&quit_frame(opaque + 100));
            stream.write_all(&script).await.expect("write");
            let mut raw = Vec::new();
            stream.read_to_end(&mut raw).await.expect("read");
            let responses = parse_responses(&raw);
            assert_eq!(responses.len(), 2);
            assert_eq!(responses[0].opaque, opaque);
        }));
    }
    for client in clients {
        client.await.expect("client task");
    }
}
