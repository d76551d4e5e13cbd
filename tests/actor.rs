//! Integration tests for partition-affine dispatch: local ordering and
//! affinity, remote round-trips, failure kinds, backpressure accounting
//! and shutdown.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use spindle::actor::hash_to_index;
use spindle::{
    frame, AsyncServerSocket, AsyncSocket, ConfigBuilder, ConnectionRegistry, EventLoop, IoBuffer,
    PartitionActorRef, PartitionDirectory, PeerConnection, ReactorKind, ReadHandler, RequestError,
    Requests, Scheduler, TpcEngine,
};

const MAX_FRAME: usize = 1 << 20;

fn request_frame(payload: i64) -> IoBuffer {
    let mut buf = IoBuffer::with_capacity(64);
    frame::init_frame(&mut buf, 0);
    buf.write_i64(payload);
    frame::construct_complete(&mut buf);
    buf
}

fn payload_of(buf: &IoBuffer) -> i64 {
    buf.get_i64(buf.position() + frame::HEADER_BYTES)
}

struct FixedDirectory {
    owner: SocketAddr,
}

impl PartitionDirectory for FixedDirectory {
    fn partition_owner(&self, _partition_id: u32) -> Option<SocketAddr> {
        Some(self.owner)
    }
}

struct UnknownDirectory;

impl PartitionDirectory for UnknownDirectory {
    fn partition_owner(&self, _partition_id: u32) -> Option<SocketAddr> {
        None
    }
}

struct EmptyRegistry;

impl ConnectionRegistry for EmptyRegistry {
    fn connection(&self, _addr: SocketAddr) -> Option<Arc<PeerConnection>> {
        None
    }
}

struct FixedRegistry {
    conn: Arc<PeerConnection>,
}

impl ConnectionRegistry for FixedRegistry {
    fn connection(&self, _addr: SocketAddr) -> Option<Arc<PeerConnection>> {
        Some(self.conn.clone())
    }
}

/// Local partition executor: echoes the payload back through the
/// correlation table and records which loop saw the request.
struct EchoScheduler {
    loop_index: usize,
    requests: Requests,
    log: mpsc::Sender<(usize, i64)>,
}

impl Scheduler for EchoScheduler {
    fn tick(&mut self) -> bool {
        false
    }

    fn schedule(&mut self, request: IoBuffer) {
        let call_id = frame::call_id(&request);
        let payload = payload_of(&request);
        let _ = self.log.send((self.loop_index, payload));

        let mut response = IoBuffer::with_capacity(64);
        frame::init_frame(&mut response, call_id);
        response.write_i64(payload);
        frame::construct_complete(&mut response);
        self.requests.complete(call_id, response);
        request.release();
    }
}

/// Executor that drops requests without replying.
struct SwallowScheduler;

impl Scheduler for SwallowScheduler {
    fn tick(&mut self) -> bool {
        false
    }

    fn schedule(&mut self, request: IoBuffer) {
        request.release();
    }
}

#[test]
fn partition_affinity_and_ordering() {
    let config = ConfigBuilder::new()
        .reactor(ReactorKind::Portable)
        .eventloops(2)
        .build()
        .unwrap();
    let engine = TpcEngine::new(config).unwrap();

    let requests = Requests::new(1024);
    let (log_tx, log_rx) = mpsc::channel();
    for index in 0..engine.eventloop_count() {
        engine
            .eventloop(index)
            .set_scheduler(Box::new(EchoScheduler {
                loop_index: index,
                requests: requests.clone(),
                log: log_tx.clone(),
            }))
            .unwrap();
    }
    engine.start().unwrap();

    let self_addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
    let actor = PartitionActorRef::new(
        42,
        Arc::new(FixedDirectory { owner: self_addr }),
        &engine,
        Arc::new(EmptyRegistry),
        self_addr,
        requests.clone(),
    );

    let expected_loop = hash_to_index(42, engine.eventloop_count());
    assert_eq!(actor.eventloop().index(), expected_loop);

    let futures: Vec<_> = (0..100i64).map(|k| actor.submit(request_frame(k))).collect();
    for (k, future) in futures.into_iter().enumerate() {
        let response = future.join_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(payload_of(&response), k as i64);
    }

    for k in 0..100i64 {
        let (loop_index, payload) = log_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(
            loop_index, expected_loop,
            "request observed off the partition's loop"
        );
        assert_eq!(payload, k, "requests reordered");
    }
    assert_eq!(requests.outstanding(), 0);

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn unknown_owner_fails_with_routing() {
    let config = ConfigBuilder::new()
        .reactor(ReactorKind::Portable)
        .eventloops(1)
        .build()
        .unwrap();
    let engine = TpcEngine::new(config).unwrap();
    engine.start().unwrap();

    let requests = Requests::new(16);
    let actor = PartitionActorRef::new(
        5,
        Arc::new(UnknownDirectory),
        &engine,
        Arc::new(EmptyRegistry),
        "127.0.0.1:7000".parse().unwrap(),
        requests.clone(),
    );

    let result = actor.submit(request_frame(1)).join();
    assert!(matches!(result, Err(RequestError::Routing(_))));
    assert_eq!(requests.outstanding(), 0);

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn missing_connection_fails_with_routing() {
    let config = ConfigBuilder::new()
        .reactor(ReactorKind::Portable)
        .eventloops(1)
        .build()
        .unwrap();
    let engine = TpcEngine::new(config).unwrap();
    engine.start().unwrap();

    let requests = Requests::new(16);
    let remote: SocketAddr = "127.0.0.1:7001".parse().unwrap();
    let actor = PartitionActorRef::new(
        5,
        Arc::new(FixedDirectory { owner: remote }),
        &engine,
        Arc::new(EmptyRegistry),
        "127.0.0.1:7000".parse().unwrap(),
        requests.clone(),
    );

    let result = actor.submit(request_frame(1)).join();
    assert!(matches!(result, Err(RequestError::Routing(_))));

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn configured_deadline_fails_with_timeout() {
    let config = ConfigBuilder::new()
        .reactor(ReactorKind::Readiness)
        .eventloops(1)
        .build()
        .unwrap();
    let engine = TpcEngine::new(config).unwrap();
    engine
        .eventloop(0)
        .set_scheduler(Box::new(SwallowScheduler))
        .unwrap();
    engine.start().unwrap();

    let requests = Requests::with_timeout(16, Duration::from_millis(80));
    let self_addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
    let actor = PartitionActorRef::new(
        9,
        Arc::new(FixedDirectory { owner: self_addr }),
        &engine,
        Arc::new(EmptyRegistry),
        self_addr,
        requests.clone(),
    );

    let result = actor.submit(request_frame(1)).join_timeout(Duration::from_secs(2));
    assert_eq!(result, Err(RequestError::Timeout));
    assert_eq!(requests.outstanding(), 0, "slot not vacated on timeout");

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn shutdown_fails_outstanding_and_new_requests() {
    let config = ConfigBuilder::new()
        .reactor(ReactorKind::Portable)
        .eventloops(1)
        .build()
        .unwrap();
    let engine = TpcEngine::new(config).unwrap();
    engine
        .eventloop(0)
        .set_scheduler(Box::new(SwallowScheduler))
        .unwrap();
    engine.start().unwrap();

    let requests = Requests::new(16);
    let self_addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
    let actor = PartitionActorRef::new(
        3,
        Arc::new(FixedDirectory { owner: self_addr }),
        &engine,
        Arc::new(EmptyRegistry),
        self_addr,
        requests.clone(),
    );

    let outstanding = actor.submit(request_frame(1));

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
    // The embedding runtime fails the table on engine shutdown.
    requests.fail_all();
    assert_eq!(outstanding.join(), Err(RequestError::Shutdown));

    let rejected = actor.submit(request_frame(2));
    assert_eq!(rejected.join(), Err(RequestError::Shutdown));
    assert_eq!(requests.outstanding(), 0);
}

// ── Remote round-trip over real sockets ─────────────────────────────

/// Server-side read handler: stamps the origin socket on each decoded
/// request and hands it to the loop's executor.
struct OfferHandler {
    eventloop: EventLoop,
}

impl ReadHandler for OfferHandler {
    fn on_read(&mut self, socket: &AsyncSocket, buffer: &mut IoBuffer) {
        while let Ok(Some(mut request)) = frame::try_decode(buffer, MAX_FRAME) {
            request.set_socket(socket.clone());
            let _ = self.eventloop.offer(request);
        }
    }
}

/// Server-side executor: replies with payload + 1 on the origin socket.
struct ReplyScheduler;

impl Scheduler for ReplyScheduler {
    fn tick(&mut self) -> bool {
        false
    }

    fn schedule(&mut self, request: IoBuffer) {
        let origin = request.socket().expect("request without origin socket");
        let mut response = IoBuffer::with_capacity(64);
        frame::init_frame(&mut response, frame::call_id(&request));
        response.write_i64(payload_of(&request) + 1);
        frame::construct_complete(&mut response);
        origin.unsafe_write_and_flush(response);
        request.release();
    }
}

/// Client-side read handler: correlates responses back to futures.
struct ResponseHandler {
    requests: Requests,
}

impl ReadHandler for ResponseHandler {
    fn on_read(&mut self, _socket: &AsyncSocket, buffer: &mut IoBuffer) {
        while let Ok(Some(response)) = frame::try_decode(buffer, MAX_FRAME) {
            self.requests.complete(frame::call_id(&response), response);
        }
    }
}

fn connect_peer(
    client_loop: &EventLoop,
    addr: SocketAddr,
    requests: &Requests,
) -> AsyncSocket {
    let socket = AsyncSocket::open().unwrap();
    socket.tcp_no_delay(true).unwrap();
    socket.read_handler(ResponseHandler {
        requests: requests.clone(),
    });
    socket.activate(client_loop).unwrap();
    socket
        .connect(addr)
        .join_timeout(Duration::from_secs(5))
        .unwrap();
    let tracked = requests.clone();
    let socket_id = socket.id();
    socket.set_closed_listener(move |_cause| tracked.fail_socket(socket_id));
    socket
}

fn remote_round_trip(kind: ReactorKind) {
    let server_config = ConfigBuilder::new()
        .reactor(kind)
        .eventloops(1)
        .build()
        .unwrap();
    let server_engine = match TpcEngine::new(server_config) {
        Ok(e) => e,
        Err(_) if kind == ReactorKind::CompletionRing => return,
        Err(e) => panic!("engine construction failed: {e}"),
    };
    server_engine
        .eventloop(0)
        .set_scheduler(Box::new(ReplyScheduler))
        .unwrap();
    server_engine.start().unwrap();

    let server_loop = server_engine.eventloop(0).clone();
    let server = AsyncServerSocket::open(&server_loop);
    server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    server.listen(16).unwrap();
    let accept_loop = server_loop.clone();
    server
        .accept(move |socket| {
            socket.tcp_no_delay(true).unwrap();
            socket.read_handler(OfferHandler {
                eventloop: accept_loop.clone(),
            });
            socket.activate(&accept_loop).unwrap();
        })
        .unwrap();
    let server_addr = server.local_addr().unwrap();

    let client_config = ConfigBuilder::new()
        .reactor(kind)
        .eventloops(1)
        .build()
        .unwrap();
    let client_engine = TpcEngine::new(client_config).unwrap();
    client_engine.start().unwrap();
    let client_loop = client_engine.eventloop(0).clone();

    let requests = Requests::new(1024);
    let conn = Arc::new(PeerConnection {
        sockets: vec![
            connect_peer(&client_loop, server_addr, &requests),
            connect_peer(&client_loop, server_addr, &requests),
        ],
    });

    let actor = PartitionActorRef::new(
        7,
        Arc::new(FixedDirectory { owner: server_addr }),
        &client_engine,
        Arc::new(FixedRegistry { conn: conn.clone() }),
        "127.0.0.1:1".parse().unwrap(),
        requests.clone(),
    );

    let futures: Vec<_> = (0..50i64).map(|k| actor.submit(request_frame(k))).collect();
    for (k, future) in futures.into_iter().enumerate() {
        let response = future.join_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(payload_of(&response), k as i64 + 1);
    }
    assert_eq!(requests.outstanding(), 0);

    client_engine.shutdown();
    assert!(client_engine.await_termination(Duration::from_secs(5)));
    server_engine.shutdown();
    assert!(server_engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn remote_round_trip_readiness() {
    remote_round_trip(ReactorKind::Readiness);
}

#[test]
fn remote_round_trip_portable() {
    remote_round_trip(ReactorKind::Portable);
}

#[test]
fn closed_socket_fails_in_flight_requests() {
    let server_config = ConfigBuilder::new()
        .reactor(ReactorKind::Portable)
        .eventloops(1)
        .build()
        .unwrap();
    // Default scheduler swallows requests: nothing ever replies.
    let server_engine = TpcEngine::new(server_config).unwrap();
    server_engine.start().unwrap();
    let server_loop = server_engine.eventloop(0).clone();
    let server = AsyncServerSocket::open(&server_loop);
    server.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    server.listen(16).unwrap();
    let accept_loop = server_loop.clone();
    server
        .accept(move |socket| {
            socket.read_handler(OfferHandler {
                eventloop: accept_loop.clone(),
            });
            socket.activate(&accept_loop).unwrap();
        })
        .unwrap();
    let server_addr = server.local_addr().unwrap();

    let client_config = ConfigBuilder::new()
        .reactor(ReactorKind::Portable)
        .eventloops(1)
        .build()
        .unwrap();
    let client_engine = TpcEngine::new(client_config).unwrap();
    client_engine.start().unwrap();

    let requests = Requests::new(16);
    let socket = connect_peer(
        &client_engine.eventloop(0).clone(),
        server_addr,
        &requests,
    );
    let conn = Arc::new(PeerConnection {
        sockets: vec![socket.clone()],
    });

    let actor = PartitionActorRef::new(
        11,
        Arc::new(FixedDirectory { owner: server_addr }),
        &client_engine,
        Arc::new(FixedRegistry { conn }),
        "127.0.0.1:1".parse().unwrap(),
        requests.clone(),
    );

    let pending = actor.submit(request_frame(5));
    std::thread::sleep(Duration::from_millis(100));
    assert!(!pending.is_done());

    socket.close();
    assert_eq!(
        pending.join_timeout(Duration::from_secs(5)),
        Err(RequestError::ConnectionLost)
    );
    assert_eq!(requests.outstanding(), 0);

    client_engine.shutdown();
    assert!(client_engine.await_termination(Duration::from_secs(5)));
    server_engine.shutdown();
    assert!(server_engine.await_termination(Duration::from_secs(5)));
}

// ── Backpressure accounting ─────────────────────────────────────────

#[test]
fn outbound_budget_refuses_and_releases() {
    // Unactivated socket: the queue only grows, so the budget is
    // deterministic (default 1 MiB).
    let socket = AsyncSocket::open().unwrap();

    let payload = vec![7u8; 300 * 1024];
    let mut held = Vec::new();
    let mut accepted = 0;
    for _ in 0..5 {
        let mut buf = IoBuffer::with_capacity(payload.len() + 32);
        frame::init_frame(&mut buf, -1);
        buf.write_bytes(&payload);
        frame::construct_complete(&mut buf);
        let queued = socket.write(buf.acquire());
        if queued {
            accepted += 1;
        }
        held.push((buf, queued));
    }
    assert!(accepted >= 3, "budget refused too early");
    assert!(accepted < 5, "budget never engaged");

    // Refused writes released their reference immediately.
    for (buf, queued) in &held {
        assert_eq!(buf.refs(), if *queued { 2 } else { 1 });
    }

    // Close releases every queued reference exactly once.
    socket.close();
    for (buf, _) in &held {
        assert_eq!(buf.refs(), 1, "buffer lost or double-released");
    }
}
