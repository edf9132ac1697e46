use my_tcp_proxy::clients::ControlClient;
use my_tcp_proxy::filter::FilterChain;
use my_tcp_proxy::protocol::ConnectionInfo;
use my_tcp_proxy::server;
use my_tcp_proxy::ProxyConfig;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{self, Instant};

/// A client sending through an unfiltered proxy reaches the upstream
/// byte for byte and the counters reflect the exchange.
#[tokio::test]
async fn echo_roundtrip_without_filters() {
    let upstream = start_echo_server().await;
    let proxy = start_proxy(upstream, FilterChain::new()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello");

    // the registry mirror trails the relay by at most one segment
    let connections = wait_for(&proxy.control, |conns| {
        conns.len() == 1
            && conns[0].client_to_server_bytes == 5
            && conns[0].server_to_client_bytes == 5
    })
    .await;
    assert_eq!(connections[0].target_port, upstream.port());
}

/// No-drop chains conserve bytes for arbitrary segment sizes.
#[tokio::test]
async fn byte_conservation_across_segment_sizes() {
    let upstream = start_echo_server().await;
    let proxy = start_proxy(upstream, FilterChain::new()).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    let mut sent = Vec::new();
    for (i, size) in [1usize, 3, 7, 100, 999, 1024, 8192, 2000].iter().enumerate() {
        let segment: Vec<u8> = (0..*size).map(|b| (b + i) as u8).collect();
        client.write_all(&segment).await.unwrap();
        sent.extend_from_slice(&segment);
    }

    let mut received = vec![0u8; sent.len()];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(received, sent);
}

/// A delay filter holds every segment for the configured time, in both
/// directions.
#[tokio::test]
async fn delay_filter_holds_segments() {
    let upstream = start_echo_server().await;
    let mut filters = FilterChain::new();
    filters.add_delay(200).unwrap();
    let proxy = start_proxy(upstream, filters).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    let before = Instant::now();
    client.write_all(b"x").await.unwrap();
    let mut echoed = [0u8; 1];
    client.read_exact(&mut echoed).await.unwrap();

    // 200ms on the way out and 200ms on the way back
    assert!(before.elapsed() >= Duration::from_millis(400));

    wait_for(&proxy.control, |conns| {
        conns.len() == 1 && conns[0].client_to_server_bytes == 1
    })
    .await;
}

/// A certain drop never forwards anything: the upstream sees no bytes and
/// the connection stays up.
#[tokio::test]
async fn full_drop_discards_segments() {
    let upstream = start_echo_server().await;
    let mut filters = FilterChain::new();
    filters.add_drop(1.0).unwrap();
    let proxy = start_proxy(upstream, filters).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(&[7u8; 100]).await.unwrap();

    let mut buf = [0u8; 1];
    let echo = time::timeout(Duration::from_millis(300), client.read(&mut buf)).await;
    assert!(echo.is_err(), "dropped segment must not come back");

    let connections = wait_for(&proxy.control, |conns| conns.len() == 1).await;
    assert_eq!(connections[0].client_to_server_bytes, 0);
    assert_eq!(connections[0].server_to_client_bytes, 0);
}

/// Three concurrent clients each get their own handler and entry; closing
/// them empties the table again.
#[tokio::test]
async fn concurrent_clients_are_tracked_and_isolated() {
    let upstream = start_echo_server().await;
    let proxy = start_proxy(upstream, FilterChain::new()).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TcpStream::connect(proxy.addr).await.unwrap());
    }

    let connections = wait_for(&proxy.control, |conns| conns.len() == 3).await;
    let mut ids: Vec<u32> = connections.iter().map(|c| c.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 3, "handler ids must be unique");

    // 10 KB through each client, interleaved with the others still open
    let payload: Vec<u8> = (0..10 * 1024).map(|b| (b % 251) as u8).collect();
    for client in &mut clients {
        client.write_all(&payload).await.unwrap();
        let mut received = vec![0u8; payload.len()];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    drop(clients);
    wait_for(&proxy.control, |conns| conns.is_empty()).await;
}

/// Killing handler A tears down exactly A; handler B keeps relaying.
#[tokio::test]
async fn killing_one_handler_leaves_others_running() {
    let upstream = start_echo_server().await;
    let proxy = start_proxy(upstream, FilterChain::new()).await;

    let mut victim = TcpStream::connect(proxy.addr).await.unwrap();
    let mut survivor = TcpStream::connect(proxy.addr).await.unwrap();

    let connections = wait_for(&proxy.control, |conns| conns.len() == 2).await;
    let victim_port = victim.local_addr().unwrap().port();
    let victim_id = connections
        .iter()
        .find(|c| c.client_port == victim_port)
        .expect("victim not registered")
        .id;

    let response = proxy.control.kill(victim_id).await.unwrap();
    assert!(response.success, "{}", response.message);

    // the victim's socket closes...
    let mut buf = [0u8; 1];
    let read = time::timeout(Duration::from_secs(2), victim.read(&mut buf))
        .await
        .expect("victim was not torn down");
    assert_eq!(read.unwrap(), 0);

    // ...its entry disappears...
    let remaining = wait_for(&proxy.control, |conns| conns.len() == 1).await;
    assert_ne!(remaining[0].id, victim_id);

    // ...and the survivor never notices
    survivor.write_all(b"still here").await.unwrap();
    let mut echoed = [0u8; 10];
    survivor.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"still here");
}

/// When the upstream refuses the dial, the client is dropped and the
/// proxy keeps serving.
#[tokio::test]
async fn unreachable_upstream_drops_the_client_only() {
    // grab a port that nothing listens on
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_target = unused.local_addr().unwrap();
    drop(unused);

    let proxy = start_proxy(dead_target, FilterChain::new()).await;

    for _ in 0..2 {
        let mut client = TcpStream::connect(proxy.addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("client should have been dropped");
        assert_eq!(read.unwrap_or(0), 0);
    }

    let response = proxy.control.list().await.unwrap();
    assert!(response.success);
    assert!(response.connections.is_empty());
}

struct TestProxy {
    addr: SocketAddr,
    control: ControlClient,
    _shutdown_tx: oneshot::Sender<()>,
}

async fn start_proxy(target: SocketAddr, filters: FilterChain) -> TestProxy {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let socket_path = unique_socket_path();
    let mut config = ProxyConfig::default();
    config.listen_port = addr.port();
    config.target_host = target.ip().to_string();
    config.target_port = target.port();
    config.enable_filters = !filters.is_empty();
    config.control_socket = socket_path.clone();

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        server::run(listener, config, filters, async {
            let _ = shutdown_rx.await;
        })
        .await
        .unwrap();
    });

    // the control socket appears once the server task is up
    for _ in 0..200 {
        if std::path::Path::new(&socket_path).exists() {
            break;
        }
        time::sleep(Duration::from_millis(5)).await;
    }

    TestProxy {
        addr,
        control: ControlClient::new(&socket_path),
        _shutdown_tx: shutdown_tx,
    }
}

async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Poll the control plane until `cond` holds for the listed connections.
async fn wait_for(
    control: &ControlClient,
    cond: impl Fn(&[ConnectionInfo]) -> bool,
) -> Vec<ConnectionInfo> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let response = control.list().await.unwrap();
        assert!(response.success, "{}", response.message);
        if cond(&response.connections) {
            return response.connections;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting on registry, last: {:?}", response.connections);
        }
        time::sleep(Duration::from_millis(20)).await;
    }
}

fn unique_socket_path() -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    std::env::temp_dir()
        .join(format!(
            "my-tcp-proxy-test-{}-{}.sock",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ))
        .to_string_lossy()
        .into_owned()
}
