use kerberos_proxy::http::Scheme;
use kerberos_proxy::{
    Config, NegotiationError, ProxyServer, SecurityContext, SecurityPrimitive, StepOutput, TokenCache,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Barrier};

const OK_RESPONSE: &str = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
const CHALLENGE: &str = "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Negotiate\r\nContent-Length: 0\r\n\r\n";
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Primitive Kerberos simulée: un jeton `ticket-N` par initialisation.
struct TestPrimitive {
    calls: Arc<AtomicUsize>,
    delay: Duration,
    fail: bool,
}

struct TestContext {
    call: usize,
    delay: Duration,
    fail: bool,
}

impl SecurityContext for TestContext {
    fn step(&mut self, _input: Option<&[u8]>) -> Result<StepOutput, NegotiationError> {
        std::thread::sleep(self.delay);
        if self.fail {
            return Err(NegotiationError::new("no credentials cache found"));
        }
        Ok(StepOutput {
            token: format!("ticket-{}", self.call).into_bytes(),
            done: true,
        })
    }
}

impl SecurityPrimitive for TestPrimitive {
    fn initialize(&self, principal: &str) -> Result<Box<dyn SecurityContext>, NegotiationError> {
        assert_eq!(principal, "HTTP/127.0.0.1");
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(TestContext {
            call,
            delay: self.delay,
            fail: self.fail,
        }))
    }
}

/// Proxy upstream simulé: enregistre les en-têtes reçus et répond selon `respond`.
/// Après un CONNECT accepté ou un 101, la socket est remise au test via `tunnels`.
struct FakeUpstream {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
    tunnels: mpsc::UnboundedReceiver<BufReader<TcpStream>>,
}

impl FakeUpstream {
    async fn start<F>(respond: F, barrier: Option<Arc<Barrier>>) -> FakeUpstream
    where
        F: Fn(&str, usize) -> String + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
        let addr = listener.local_addr().expect("addr");
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (tunnel_tx, tunnels) = mpsc::unbounded_channel();
        let respond = Arc::new(respond);

        let accepted = Arc::clone(&connections);
        let seen = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                accepted.fetch_add(1, Ordering::SeqCst);
                let respond = Arc::clone(&respond);
                let seen = Arc::clone(&seen);
                let tunnel_tx = tunnel_tx.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    let mut socket = BufReader::new(socket);
                    while let Some(head) = read_request(&mut socket).await {
                        let index = {
                            let mut seen = seen.lock().unwrap();
                            seen.push(head.clone());
                            seen.len() - 1
                        };
                        if let Some(barrier) = &barrier {
                            barrier.wait().await;
                        }
                        let response = respond(&head, index);
                        if socket.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                        let established = head.starts_with("CONNECT ") && response.starts_with("HTTP/1.1 200");
                        if established || response.starts_with("HTTP/1.1 101") {
                            let _ = tunnel_tx.send(socket);
                            return;
                        }
                    }
                });
            }
        });

        FakeUpstream {
            addr,
            connections,
            requests,
            tunnels,
        }
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_request(socket: &mut BufReader<TcpStream>) -> Option<String> {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        if socket.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        head.push_str(&line);
        if line == "\r\n" {
            break;
        }
    }

    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    socket.read_exact(&mut body).await.ok()?;
    head.push_str(&String::from_utf8_lossy(&body));
    Some(head)
}

fn authorizations(request: &str) -> Vec<&str> {
    request
        .lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("proxy-authorization").then(|| value.trim())
        })
        .collect()
}

struct Harness {
    server: ProxyServer,
    addr: SocketAddr,
    tokens: Arc<TokenCache>,
    negotiations: Arc<AtomicUsize>,
}

async fn start_proxy(upstream: SocketAddr, delay: Duration, fail: bool) -> Harness {
    start_proxy_with(upstream, delay, fail, |_| {}).await
}

async fn start_proxy_with<F>(upstream: SocketAddr, delay: Duration, fail: bool, configure: F) -> Harness
where
    F: FnOnce(&mut Config),
{
    let mut config = Config::default();
    config.upstream_host = upstream.ip().to_string();
    config.upstream_port = upstream.port();
    config.listen_port = 0;
    config.connect_timeout = 2;
    config.socket_timeout = 5;
    config.negotiate_timeout = 5;
    config.prefetch_token = false;
    configure(&mut config);

    let negotiations = Arc::new(AtomicUsize::new(0));
    let primitive = Arc::new(TestPrimitive {
        calls: Arc::clone(&negotiations),
        delay,
        fail,
    });
    let tokens = Arc::new(kerberos_proxy::token_cache(&config, primitive));
    let mut server = ProxyServer::new(config, Arc::clone(&tokens));
    let addr = server.start().await.expect("proxy starts");

    Harness {
        server,
        addr,
        tokens,
        negotiations,
    }
}

async fn exchange(proxy: SocketAddr, request: &str) -> String {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(proxy).await.expect("connect proxy");
        client.write_all(request.as_bytes()).await.expect("write");
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.expect("read");
        String::from_utf8_lossy(&response).into_owned()
    })
    .await
    .expect("exchange finishes in time")
}

fn get(url: &str) -> String {
    format!("GET {} HTTP/1.1\r\nHost: example\r\nConnection: close\r\n\r\n", url)
}

#[tokio::test]
async fn plain_request_carries_exactly_one_negotiated_credential() {
    let upstream = FakeUpstream::start(|_, _| OK_RESPONSE.to_string(), None).await;
    let proxy = start_proxy(upstream.addr, Duration::ZERO, false).await;

    let request = "POST http://intranet.example/form HTTP/1.1\r\nHost: intranet.example\r\nProxy-Authorization: Basic dXNlcjpwdw==\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";
    let response = exchange(proxy.addr, request).await;
    assert_eq!(response, OK_RESPONSE);

    let seen = upstream.requests();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("POST http://intranet.example/form HTTP/1.1\r\n"));
    assert_eq!(authorizations(&seen[0]), vec!["Negotiate dGlja2V0LTE="]);
    assert!(seen[0].ends_with("\r\n\r\nhello"));
}

#[tokio::test]
async fn sequential_requests_reuse_token_and_upstream_connection() {
    let upstream = FakeUpstream::start(|_, _| OK_RESPONSE.to_string(), None).await;
    let proxy = start_proxy(upstream.addr, Duration::ZERO, false).await;

    let mut client = TcpStream::connect(proxy.addr).await.expect("connect");
    for path in ["/one", "/two"] {
        let request = format!("GET http://intranet.example{} HTTP/1.1\r\nHost: intranet.example\r\n\r\n", path);
        client.write_all(request.as_bytes()).await.expect("write");
        let mut response = vec![0u8; OK_RESPONSE.len()];
        tokio::time::timeout(TEST_TIMEOUT, client.read_exact(&mut response))
            .await
            .expect("in time")
            .expect("read");
        assert_eq!(response, OK_RESPONSE.as_bytes());
    }

    assert_eq!(proxy.negotiations.load(Ordering::SeqCst), 1);
    assert_eq!(upstream.connections(), 1);
    assert_eq!(upstream.requests().len(), 2);
}

#[tokio::test]
async fn single_challenge_is_retried_with_a_fresh_token() {
    let upstream = FakeUpstream::start(
        |_, index| if index == 0 { CHALLENGE.to_string() } else { OK_RESPONSE.to_string() },
        None,
    )
    .await;
    let proxy = start_proxy(upstream.addr, Duration::ZERO, false).await;

    let response = exchange(proxy.addr, &get("http://intranet.example/")).await;
    assert_eq!(response, OK_RESPONSE);

    let seen = upstream.requests();
    assert_eq!(seen.len(), 2);
    assert_eq!(authorizations(&seen[0]), vec!["Negotiate dGlja2V0LTE="]);
    assert_eq!(authorizations(&seen[1]), vec!["Negotiate dGlja2V0LTI="]);
    assert_eq!(proxy.tokens.negotiation_count(), 2);
}

#[tokio::test]
async fn repeated_challenge_is_surfaced_without_a_third_attempt() {
    let upstream = FakeUpstream::start(|_, _| CHALLENGE.to_string(), None).await;
    let proxy = start_proxy(upstream.addr, Duration::ZERO, false).await;

    let response = exchange(proxy.addr, &get("http://intranet.example/")).await;
    assert!(response.starts_with("HTTP/1.1 407 "), "{}", response);
    assert_eq!(upstream.requests().len(), 2);
    assert_eq!(proxy.negotiations.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_a_single_negotiation() {
    let upstream = FakeUpstream::start(|_, _| OK_RESPONSE.to_string(), None).await;
    let proxy = start_proxy(upstream.addr, Duration::from_millis(200), false).await;

    let clients: Vec<_> = (0..10)
        .map(|i| {
            let addr = proxy.addr;
            tokio::spawn(async move { exchange(addr, &get(&format!("http://intranet.example/{}", i))).await })
        })
        .collect();

    for client in clients {
        assert_eq!(client.await.expect("join"), OK_RESPONSE);
    }
    assert_eq!(proxy.negotiations.load(Ordering::SeqCst), 1);
    assert!(upstream
        .requests()
        .iter()
        .all(|request| authorizations(request) == vec!["Negotiate dGlja2V0LTE="]));
}

#[tokio::test]
async fn connect_tunnel_is_byte_transparent_and_closes_both_sides() {
    let mut upstream = FakeUpstream::start(
        |_, _| "HTTP/1.1 200 Connection established\r\n\r\n".to_string(),
        None,
    )
    .await;
    let proxy = start_proxy(upstream.addr, Duration::ZERO, false).await;

    let mut client = TcpStream::connect(proxy.addr).await.expect("connect");
    client
        .write_all(b"CONNECT secure.example:443 HTTP/1.1\r\nHost: secure.example:443\r\n\r\n")
        .await
        .expect("write");

    let established = b"HTTP/1.1 200 Connection established\r\n\r\n";
    let mut reply = vec![0u8; established.len()];
    client.read_exact(&mut reply).await.expect("read reply");
    assert_eq!(reply, established);

    let mut far_end = tokio::time::timeout(TEST_TIMEOUT, upstream.tunnels.recv())
        .await
        .expect("in time")
        .expect("tunnel");
    let seen = upstream.requests();
    assert!(seen[0].starts_with("CONNECT secure.example:443 HTTP/1.1\r\n"));
    assert_eq!(authorizations(&seen[0]), vec!["Negotiate dGlja2V0LTE="]);

    let client_hello = [0x16u8, 0x03, 0x01, 0x00, 0xff, 0x00, 0x0d, 0x0a];
    client.write_all(&client_hello).await.expect("client write");
    let mut buf = [0u8; 8];
    far_end.read_exact(&mut buf).await.expect("far end read");
    assert_eq!(buf, client_hello);

    far_end.write_all(b"server-bytes").await.expect("far end write");
    let mut buf = [0u8; 12];
    client.read_exact(&mut buf).await.expect("client read");
    assert_eq!(&buf, b"server-bytes");

    drop(client);
    let mut rest = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, far_end.read_to_end(&mut rest))
        .await
        .expect("far end sees the close")
        .expect("read");
    assert!(rest.is_empty());
}

#[tokio::test]
async fn refused_tunnel_passes_the_upstream_answer_through() {
    let upstream = FakeUpstream::start(
        |_, _| "HTTP/1.1 403 Forbidden\r\nContent-Length: 6\r\n\r\nblock!".to_string(),
        None,
    )
    .await;
    let proxy = start_proxy(upstream.addr, Duration::ZERO, false).await;

    let response = exchange(proxy.addr, "CONNECT blocked.example:443 HTTP/1.1\r\n\r\n").await;
    assert_eq!(response, "HTTP/1.1 403 Forbidden\r\nContent-Length: 6\r\n\r\nblock!");
}

#[tokio::test]
async fn malformed_request_line_is_rejected_without_upstream_contact() {
    let upstream = FakeUpstream::start(|_, _| OK_RESPONSE.to_string(), None).await;
    let proxy = start_proxy(upstream.addr, Duration::ZERO, false).await;

    for request in ["HELLO\r\n\r\n", "GET /relative HTTP/1.1\r\nHost: a\r\n\r\n"] {
        let response = exchange(proxy.addr, request).await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", response);
    }

    assert_eq!(upstream.connections(), 0);
    assert_eq!(proxy.negotiations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn negotiation_failure_is_an_authentication_failure() {
    let upstream = FakeUpstream::start(|_, _| OK_RESPONSE.to_string(), None).await;
    let proxy = start_proxy(upstream.addr, Duration::ZERO, true).await;

    let response = exchange(proxy.addr, &get("http://intranet.example/")).await;
    assert!(response.starts_with("HTTP/1.1 407 "), "{}", response);
    assert!(response.contains("no credentials cache found"));
    assert_eq!(upstream.connections(), 0);

    // Le processus continue: la requête suivante renégocie.
    let _ = exchange(proxy.addr, &get("http://intranet.example/")).await;
    assert_eq!(proxy.negotiations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unreachable_upstream_is_a_gateway_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let dead = listener.local_addr().expect("addr");
    drop(listener);
    let proxy = start_proxy(dead, Duration::ZERO, false).await;

    let response = exchange(proxy.addr, &get("http://intranet.example/")).await;
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", response);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_schemes_use_distinct_connections() {
    // Chaque réponse attend l'arrivée des deux requêtes: une connexion partagée bloquerait.
    let barrier = Arc::new(Barrier::new(2));
    let upstream = FakeUpstream::start(|_, _| OK_RESPONSE.to_string(), Some(barrier)).await;
    let proxy = start_proxy(upstream.addr, Duration::ZERO, false).await;
    proxy.tokens.get_token().await.expect("token");

    let addr = proxy.addr;
    let plain = tokio::spawn(async move { exchange(addr, &get("http://a.example/")).await });
    let secure = tokio::spawn(async move { exchange(addr, &get("https://b.example/")).await });

    assert_eq!(plain.await.expect("join"), OK_RESPONSE);
    assert_eq!(secure.await.expect("join"), OK_RESPONSE);
    assert_eq!(upstream.connections(), 2);

    let pool = proxy.server.pool();
    assert!(pool.idle_count(Scheme::Http) <= 1);
    assert!(pool.idle_count(Scheme::Https) <= 1);
}

#[tokio::test]
async fn tunnel_challenge_is_retried_once_with_a_fresh_token() {
    let mut upstream = FakeUpstream::start(
        |_, index| {
            if index == 0 {
                CHALLENGE.to_string()
            } else {
                "HTTP/1.1 200 Connection established\r\n\r\n".to_string()
            }
        },
        None,
    )
    .await;
    let proxy = start_proxy(upstream.addr, Duration::ZERO, false).await;

    let mut client = TcpStream::connect(proxy.addr).await.expect("connect");
    client
        .write_all(b"CONNECT secure.example:443 HTTP/1.1\r\nHost: secure.example:443\r\n\r\n")
        .await
        .expect("write");

    let established = b"HTTP/1.1 200 Connection established\r\n\r\n";
    let mut reply = vec![0u8; established.len()];
    tokio::time::timeout(TEST_TIMEOUT, client.read_exact(&mut reply))
        .await
        .expect("in time")
        .expect("read reply");
    assert_eq!(reply, established);

    let seen = upstream.requests();
    assert_eq!(seen.len(), 2);
    assert_eq!(authorizations(&seen[0]), vec!["Negotiate dGlja2V0LTE="]);
    assert_eq!(authorizations(&seen[1]), vec!["Negotiate dGlja2V0LTI="]);
    assert_eq!(upstream.connections(), 2);

    let mut far_end = upstream.tunnels.recv().await.expect("tunnel");
    client.write_all(b"ping").await.expect("client write");
    let mut buf = [0u8; 4];
    far_end.read_exact(&mut buf).await.expect("far end read");
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn silent_upstream_is_a_gateway_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let silent = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    let proxy = start_proxy_with(silent, Duration::ZERO, false, |config| config.socket_timeout = 1).await;

    let response = exchange(proxy.addr, &get("http://intranet.example/")).await;
    assert!(response.starts_with("HTTP/1.1 504 Gateway Timeout\r\n"), "{}", response);

    let response = exchange(proxy.addr, "CONNECT secure.example:443 HTTP/1.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 504 Gateway Timeout\r\n"), "{}", response);
}

#[tokio::test]
async fn interim_responses_are_not_forwarded() {
    let upstream = FakeUpstream::start(
        |_, _| {
            format!(
                "HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 103 Early Hints\r\nLink: </app.css>; rel=preload\r\n\r\n{}",
                OK_RESPONSE
            )
        },
        None,
    )
    .await;
    let proxy = start_proxy(upstream.addr, Duration::ZERO, false).await;

    let response = exchange(proxy.addr, &get("http://intranet.example/")).await;
    assert_eq!(response, OK_RESPONSE);
}

#[tokio::test]
async fn protocol_upgrade_is_spliced() {
    let switching = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
    let mut upstream = FakeUpstream::start(move |_, _| switching.to_string(), None).await;
    let proxy = start_proxy(upstream.addr, Duration::ZERO, false).await;

    let mut client = TcpStream::connect(proxy.addr).await.expect("connect");
    client
        .write_all(b"GET http://intranet.example/socket HTTP/1.1\r\nHost: intranet.example\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
        .await
        .expect("write");

    let mut reply = vec![0u8; switching.len()];
    tokio::time::timeout(TEST_TIMEOUT, client.read_exact(&mut reply))
        .await
        .expect("in time")
        .expect("read reply");
    assert_eq!(reply, switching.as_bytes());

    let mut far_end = tokio::time::timeout(TEST_TIMEOUT, upstream.tunnels.recv())
        .await
        .expect("in time")
        .expect("upgraded socket");
    assert!(upstream.requests()[0].contains("Upgrade: websocket\r\n"));

    client.write_all(b"\x81\x02hi").await.expect("client write");
    let mut buf = [0u8; 4];
    far_end.read_exact(&mut buf).await.expect("far end read");
    assert_eq!(&buf, b"\x81\x02hi");

    far_end.write_all(b"\x81\x02yo").await.expect("far end write");
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.expect("client read");
    assert_eq!(&buf, b"\x81\x02yo");

    drop(far_end);
    let mut rest = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, client.read_to_end(&mut rest))
        .await
        .expect("client sees the close")
        .expect("read");
    assert!(rest.is_empty());
}
