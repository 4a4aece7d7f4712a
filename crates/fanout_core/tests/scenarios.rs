//! End-to-end scenario tests: a combined SOCKS5+origin mock server per
//! upstream, driven through the real `Registry`/`Dispatcher`/
//! `ConnectHandler`/`HealthChecker` exactly as `socks-fanout`'s listener
//! would, only with `tokio::io::duplex` standing in for the client
//! socket so the response can be captured in-process.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use fanout_core::{ConnectHandler, Dispatcher};
use fanout_http::request::RequestHead;
use fanout_registry::{HealthChecker, ProxyDescriptor, Registry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn descriptor(addr: SocketAddr) -> ProxyDescriptor {
    ProxyDescriptor {
        host: addr.ip().to_string(),
        port: addr.port(),
        username: None,
        password: None,
    }
}

fn get_head(path: &str) -> RequestHead {
    RequestHead {
        method: "GET".to_string(),
        target: format!("http://origin.test{path}"),
        version: "HTTP/1.1".to_string(),
        headers: vec![("Host".to_string(), "origin.test".to_string())],
    }
}

/// Reads a SOCKS5 greeting and CONNECT request off `socket`, always
/// answering with no-auth and a successful connect reply, then hands
/// the now-"tunneled" socket to `serve` for the origin half of the
/// conversation.
async fn accept_socks5_then<F, Fut>(mut socket: TcpStream, serve: F)
where
    F: FnOnce(TcpStream) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut greeting = [0u8; 2];
    if socket.read_exact(&mut greeting).await.is_err() {
        return;
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    if socket.read_exact(&mut methods).await.is_err() {
        return;
    }
    if socket.write_all(&[0x05, 0x00]).await.is_err() {
        return;
    }

    let mut head = [0u8; 4];
    if socket.read_exact(&mut head).await.is_err() {
        return;
    }
    let addr_ok = match head[3] {
        0x01 => socket.read_exact(&mut [0u8; 4 + 2]).await.is_ok(),
        0x04 => socket.read_exact(&mut [0u8; 16 + 2]).await.is_ok(),
        0x03 => {
            let mut len = [0u8; 1];
            if socket.read_exact(&mut len).await.is_err() {
                return;
            }
            let mut rest = vec![0u8; len[0] as usize + 2];
            socket.read_exact(&mut rest).await.is_ok()
        }
        _ => false,
    };
    if !addr_ok {
        return;
    }

    let reply = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
    if socket.write_all(&reply).await.is_err() {
        return;
    }

    serve(socket).await;
}

/// Reads one HTTP request head (request-line + headers, up to the blank
/// line) off `socket`. Any body is assumed absent (every scenario here
/// drives bodiless `GET`s).
async fn read_request_head(socket: &mut TcpStream) -> Option<String> {
    let mut buf = BytesMut::new();
    loop {
        if let Some(end) = find_double_crlf(&buf) {
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            return Some(head);
        }
        let mut chunk = [0u8; 1024];
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_double_crlf(buf: &BytesMut) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Binds a mock proxy's listening socket on an ephemeral loopback port
/// without yet serving anything. Split from [`run_mock_proxy`] so a test
/// can know the port up front (to build a [`ProxyDescriptor`]) before
/// deciding how — or whether — the mock actually answers on it.
fn spawn_mock_proxy() -> (SocketAddr, Arc<AtomicUsize>, TcpListener) {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    std_listener.set_nonblocking(true).unwrap();
    let listener = TcpListener::from_std(std_listener).unwrap();
    let addr = listener.local_addr().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    (addr, count, listener)
}

/// Drives the accept loop for a mock spawned by [`spawn_mock_proxy`].
/// Split out so a test can hold the `JoinHandle` and `abort()` it to
/// simulate the upstream proxy process dying.
fn run_mock_proxy<R>(listener: TcpListener, count: Arc<AtomicUsize>, responder: R) -> tokio::task::JoinHandle<()>
where
    R: Fn(usize) -> String + Send + Sync + 'static,
{
    let responder = Arc::new(responder);
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let responder = Arc::clone(&responder);
            let count = Arc::clone(&count);
            tokio::spawn(async move {
                accept_socks5_then(socket, |mut origin| async move {
                    let mut n = 0usize;
                    loop {
                        n += 1;
                        if read_request_head(&mut origin).await.is_none() {
                            return;
                        }
                        count.fetch_add(1, Ordering::SeqCst);
                        let response = responder(n);
                        if origin.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                        if origin.flush().await.is_err() {
                            return;
                        }
                    }
                })
                .await;
            });
        }
    })
}

fn always_200(_n: usize) -> String {
    "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_string()
}

async fn capture_response(
    dispatcher: &Dispatcher,
    head: &RequestHead,
    forced_dest: Option<(String, u16)>,
) -> String {
    let (mut client_side, mut reader_side) = tokio::io::duplex(64 * 1024);
    let read_task = tokio::spawn(async move {
        let mut out = Vec::new();
        let _ = reader_side.read_to_end(&mut out).await;
        out
    });

    timeout(TEST_TIMEOUT, dispatcher.forward(head, &[], &mut client_side, forced_dest))
        .await
        .expect("forward timed out")
        .expect("forward returned an error");
    drop(client_side);

    let bytes = read_task.await.expect("reader task panicked");
    String::from_utf8_lossy(&bytes).to_string()
}

#[tokio::test]
async fn round_robin_distributes_evenly_across_healthy_proxies() {
    let mut descriptors = Vec::new();
    let counters: Vec<Arc<AtomicUsize>> = (0..3)
        .map(|_| {
            let (addr, count, listener) = spawn_mock_proxy();
            run_mock_proxy(listener, Arc::clone(&count), always_200);
            descriptors.push(descriptor(addr));
            count
        })
        .collect();

    let registry = Arc::new(Registry::new(descriptors, "round_robin", 3, 30.0, 20));
    let dispatcher = Dispatcher::new(Arc::clone(&registry), Duration::from_secs(5));

    for _ in 0..12 {
        let response = capture_response(&dispatcher, &get_head("/get"), None).await;
        assert!(response.starts_with("HTTP/1.1 200"));
    }

    for count in &counters {
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }
}

#[tokio::test]
async fn stopped_proxy_excluded_then_recovers_after_health_probe() {
    let (addr0, count0, listener0) = spawn_mock_proxy();
    let (addr1, count1, listener1) = spawn_mock_proxy();
    let (addr2, count2, listener2) = spawn_mock_proxy();

    // Proxy #0 never actually starts serving: dropping its listener
    // frees the port but leaves nothing listening, so a connect attempt
    // fails exactly like a stopped process.
    drop(listener0);
    run_mock_proxy(listener1, Arc::clone(&count1), always_200);
    run_mock_proxy(listener2, Arc::clone(&count2), always_200);
    let _ = count0;

    let descriptors = vec![descriptor(addr0), descriptor(addr1), descriptor(addr2)];
    let registry = Arc::new(Registry::new(descriptors, "round_robin", 1, 30.0, 20));
    let dispatcher = Dispatcher::new(Arc::clone(&registry), Duration::from_secs(5));

    // The first attempt lands on #0 (round-robin cursor starts at 0),
    // fails, and the dispatcher's own retry loop tries #1 next — all
    // within the one `forward` call.
    let response = capture_response(&dispatcher, &get_head("/get"), None).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(registry.available_count(), 2);

    // Six more requests land only on #1 and #2.
    for _ in 0..6 {
        capture_response(&dispatcher, &get_head("/get"), None).await;
    }
    assert_eq!(registry.available_count(), 2);

    // Bring #0 back on the same port and let a health checker tick find it.
    let std_listener = std::net::TcpListener::bind(addr0).expect("rebind stopped proxy's port");
    std_listener.set_nonblocking(true).unwrap();
    let listener0 = TcpListener::from_std(std_listener).unwrap();
    run_mock_proxy(listener0, Arc::new(AtomicUsize::new(0)), always_200);

    let checker = Arc::new(HealthChecker::new(
        Arc::clone(&registry),
        Duration::from_millis(20),
        Duration::from_millis(20),
    ));
    let handle = Arc::clone(&checker).spawn();
    tokio::time::sleep(Duration::from_millis(200)).await;
    checker.stop(handle).await;

    assert_eq!(registry.available_count(), 3);
}

#[tokio::test]
async fn overloaded_proxy_rests_while_client_still_sees_success() {
    let (addr0, _count0, listener0) = spawn_mock_proxy();
    let (addr1, count1, listener1) = spawn_mock_proxy();
    let (addr2, count2, listener2) = spawn_mock_proxy();

    run_mock_proxy(listener0, Arc::new(AtomicUsize::new(0)), |_n| {
        "HTTP/1.1 429 Too Many Requests\r\nContent-Length: 0\r\n\r\n".to_string()
    });
    run_mock_proxy(listener1, Arc::clone(&count1), always_200);
    run_mock_proxy(listener2, Arc::clone(&count2), always_200);

    let descriptors = vec![descriptor(addr0), descriptor(addr1), descriptor(addr2)];
    let registry = Arc::new(Registry::new(descriptors, "round_robin", 3, 0.2, 20));
    let dispatcher = Dispatcher::new(Arc::clone(&registry), Duration::from_secs(5));

    let response = capture_response(&dispatcher, &get_head("/get"), None).await;
    assert!(response.starts_with("HTTP/1.1 200"));

    let snapshot = registry.snapshot();
    let key0 = descriptor(addr0).key();
    let proxy0 = snapshot.proxies.iter().find(|p| p.key == key0).unwrap();
    assert_eq!(proxy0.state, "resting");
}

#[tokio::test]
async fn both_proxies_overloaded_surfaces_429_to_the_client() {
    let reply_429 = "HTTP/1.1 429 Too Many Requests\r\nContent-Length: 0\r\n\r\n";
    let (addr0, _count0, listener0) = spawn_mock_proxy();
    let (addr1, _count1, listener1) = spawn_mock_proxy();
    run_mock_proxy(listener0, Arc::new(AtomicUsize::new(0)), move |_n| reply_429.to_string());
    run_mock_proxy(listener1, Arc::new(AtomicUsize::new(0)), move |_n| reply_429.to_string());

    let descriptors = vec![descriptor(addr0), descriptor(addr1)];
    let registry = Arc::new(Registry::new(descriptors, "round_robin", 3, 0.05, 20));
    let dispatcher = Dispatcher::new(Arc::clone(&registry), Duration::from_secs(5));

    let response = capture_response(&dispatcher, &get_head("/get"), None).await;
    assert!(response.starts_with("HTTP/1.1 429"));
    assert_eq!(registry.available_count(), 0);

    let snapshot = registry.snapshot();
    assert_eq!(snapshot.total_successes, 0);
    for proxy in &snapshot.proxies {
        assert_eq!(proxy.state, "resting");
    }
}

#[tokio::test]
async fn config_update_brings_a_new_proxy_into_rotation_without_losing_old_stats() {
    let (addr_a, count_a, listener_a) = spawn_mock_proxy();
    run_mock_proxy(listener_a, Arc::clone(&count_a), always_200);

    let registry = Arc::new(Registry::new(vec![descriptor(addr_a)], "round_robin", 3, 30.0, 20));
    let dispatcher = Dispatcher::new(Arc::clone(&registry), Duration::from_secs(5));

    for _ in 0..3 {
        capture_response(&dispatcher, &get_head("/get"), None).await;
    }
    let key_a = descriptor(addr_a).key();
    assert_eq!(registry.stats_for(&key_a).unwrap().snapshot().requests, 3);

    let (addr_b, count_b, listener_b) = spawn_mock_proxy();
    run_mock_proxy(listener_b, Arc::clone(&count_b), always_200);
    registry.update_proxies(vec![descriptor(addr_a), descriptor(addr_b)]);

    for _ in 0..4 {
        capture_response(&dispatcher, &get_head("/get"), None).await;
    }

    assert!(count_b.load(Ordering::SeqCst) > 0, "new proxy never received traffic");
    // Proxy A's accumulated request count survived the membership update.
    assert!(registry.stats_for(&key_a).unwrap().snapshot().requests >= 3);
}

#[tokio::test]
async fn connect_raw_tunnel_relays_bytes_through_the_selected_proxy() {
    let (addr, _count, listener) = spawn_mock_proxy();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(accept_socks5_then(socket, |mut origin| async move {
                // Acts as the tunnel's far end: echoes whatever the
                // client sends, simulating a raw (non-TLS-terminated)
                // CONNECT target on a port other than 443.
                let mut buf = [0u8; 1024];
                loop {
                    let n = match origin.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    if origin.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }));
        }
    });

    let registry = Arc::new(Registry::new(vec![descriptor(addr)], "round_robin", 3, 30.0, 20));
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), Duration::from_secs(5)));
    let handler = ConnectHandler::new(Arc::clone(&registry), Arc::clone(&dispatcher), None, Duration::from_secs(5));

    let (mut client_side, mut remote_side) = tokio::io::duplex(64 * 1024);
    let mut buf = BytesMut::new();

    let server_task = tokio::spawn(async move {
        let raw_head = "CONNECT example.internal:9000 HTTP/1.1";
        timeout(TEST_TIMEOUT, handler.handle(raw_head, &mut client_side, &mut buf))
            .await
            .expect("handle timed out")
            .expect("handle returned an error");
    });

    let mut established = [0u8; 39]; // "HTTP/1.1 200 Connection Established\r\n\r\n".len()
    timeout(TEST_TIMEOUT, remote_side.read_exact(&mut established))
        .await
        .expect("timed out waiting for CONNECT reply")
        .expect("connection closed before CONNECT reply");
    assert!(String::from_utf8_lossy(&established).starts_with("HTTP/1.1 200"));

    remote_side.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    timeout(TEST_TIMEOUT, remote_side.read_exact(&mut echoed))
        .await
        .expect("timed out waiting for echo")
        .expect("tunnel closed before echoing");
    assert_eq!(&echoed, b"ping");

    drop(remote_side);
    let _ = timeout(TEST_TIMEOUT, server_task).await;
}
