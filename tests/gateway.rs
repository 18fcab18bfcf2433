//! End-to-end tests: raw HTTP bytes in, raw HTTP bytes out.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use sessiongate::handler::{HandlerError, HandlerFuture, SessionHandler};
use sessiongate::{
    ClientInfo, ConnectionSupervisor, EventSender, Gateway, GatewayConfig, Method, RemovalReason, Request, Response,
    SessionId, SessionLink, SessionRegistry, SseEvent, StatusCode,
};

/// Dispatches on the `op` field of a JSON body.
struct Scripted {
    link: SessionLink,
    closed: Arc<Mutex<Vec<RemovalReason>>>,
    held: Arc<Mutex<Vec<EventSender>>>,
}

impl SessionHandler for Scripted {
    fn handle(&self, request: Request) -> HandlerFuture<'_> {
        Box::pin(async move {
            if request.method() == &Method::Delete {
                self.link.close();
                return Ok(Response::new(StatusCode::NoContent));
            }

            let body: Value = serde_json::from_slice(request.body())?;
            match body["op"].as_str().unwrap_or_default() {
                "init" => {
                    if let Some(name) = body["clientInfo"]["name"].as_str() {
                        let version = body["clientInfo"]["version"].as_str().unwrap_or("0");
                        self.link.report_client(ClientInfo::new(name, version));
                    }
                    self.link.establish();
                    Ok(Response::new(StatusCode::Ok).json(&json!({ "ready": true }))?)
                }
                "ping" => Ok(Response::new(StatusCode::Ok).body(format!("pong {}", self.link.id()))),
                "echo" => Ok(Response::new(StatusCode::Ok).body(body["n"].to_string())),
                "fail" => Err(HandlerError::msg("scripted failure")),
                "panic" => panic!("scripted panic"),
                "watch" => {
                    let (tx, response) = Response::event_stream(4);
                    tokio::spawn(async move {
                        for n in 0..3 {
                            if tx.send(SseEvent::new(format!("tick {n}")).event("tick")).await.is_err() {
                                break;
                            }
                        }
                    });
                    Ok(response)
                }
                // Opens a stream that only ends when the consumer goes away.
                "hold" => {
                    let (tx, response) = Response::event_stream(4);
                    self.held.lock().unwrap().push(tx);
                    Ok(response)
                }
                other => Ok(Response::new(StatusCode::BadRequest).body(format!("unknown op {other:?}"))),
            }
        })
    }

    fn closed(&self, reason: RemovalReason) {
        self.closed.lock().unwrap().push(reason);
    }
}

struct Harness {
    supervisor: Arc<ConnectionSupervisor>,
    registry: SessionRegistry,
    created: Arc<AtomicUsize>,
    closed: Arc<Mutex<Vec<RemovalReason>>>,
    held: Arc<Mutex<Vec<EventSender>>>,
}

impl Harness {
    fn new(config: GatewayConfig) -> Self {
        let registry = SessionRegistry::new(config.session_timeout());
        let created = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(Mutex::new(Vec::new()));
        let held = Arc::new(Mutex::new(Vec::new()));
        let (c, d, h) = (Arc::clone(&created), Arc::clone(&closed), Arc::clone(&held));
        let factory = move |link: SessionLink| {
            c.fetch_add(1, Ordering::SeqCst);
            Scripted {
                link,
                closed: Arc::clone(&d),
                held: Arc::clone(&h),
            }
        };
        let supervisor = Arc::new(ConnectionSupervisor::new(&config, registry.clone(), Arc::new(factory)));
        Self {
            supervisor,
            registry,
            created,
            closed,
            held,
        }
    }

    fn with_timeout(secs: u64) -> Self {
        Self::new(GatewayConfig {
            session_timeout_secs: secs,
            ..GatewayConfig::default()
        })
    }

    fn connect(&self) -> Client {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let supervisor = Arc::clone(&self.supervisor);
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let task = tokio::spawn(async move { supervisor.serve(server, peer).await });
        Client {
            io: client,
            buf: BytesMut::new(),
            task,
        }
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn session(&self) -> String {
        self.header("mcp-session-id").expect("session header").to_owned()
    }
}

struct Client {
    io: DuplexStream,
    buf: BytesMut,
    task: JoinHandle<()>,
}

impl Client {
    async fn send(&mut self, raw: &str) {
        self.io.write_all(raw.as_bytes()).await.unwrap();
    }

    /// Reads one length-delimited response.
    async fn reply(&mut self) -> Reply {
        loop {
            if let Some(end) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8(self.buf[..end].to_vec()).unwrap();
                let (status, headers) = parse_head(&head);
                let len: usize = headers
                    .iter()
                    .find(|(n, _)| n == "content-length")
                    .map(|(_, v)| v.parse().unwrap())
                    .expect("buffered replies carry a length");
                while self.buf.len() < end + 4 + len {
                    self.fill().await;
                }
                let _ = self.buf.split_to(end + 4);
                let body = String::from_utf8(self.buf.split_to(len).to_vec()).unwrap();
                return Reply { status, headers, body };
            }
            self.fill().await;
        }
    }

    /// Reads and consumes a response head, leaving any body in the buffer.
    async fn head(&mut self) -> (u16, Vec<(String, String)>) {
        loop {
            if let Some(end) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = self.buf.split_to(end + 4);
                return parse_head(std::str::from_utf8(&head[..end]).unwrap());
            }
            self.fill().await;
        }
    }

    /// Reads until the server closes, returning everything not yet consumed.
    async fn rest(mut self) -> String {
        let mut tail = Vec::new();
        self.io.read_to_end(&mut tail).await.unwrap();
        let mut all = self.buf.to_vec();
        all.extend_from_slice(&tail);
        String::from_utf8(all).unwrap()
    }

    async fn fill(&mut self) {
        let n = self.io.read_buf(&mut self.buf).await.unwrap();
        assert!(n > 0, "connection closed before a full response");
    }
}

fn parse_head(head: &str) -> (u16, Vec<(String, String)>) {
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status = status_line.split(' ').nth(1).unwrap().parse().unwrap();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_ascii_lowercase(), v.trim().to_owned()))
        .collect();
    (status, headers)
}

fn post(session: Option<&str>, body: &str, keep_alive: bool) -> String {
    let mut raw = String::from("POST /mcp HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n");
    if let Some(id) = session {
        raw.push_str(&format!("Mcp-Session-Id: {id}\r\n"));
    }
    if keep_alive {
        raw.push_str("Connection: keep-alive\r\n");
    }
    raw.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    raw
}

fn delete(session: &str) -> String {
    format!("DELETE /mcp HTTP/1.1\r\nMcp-Session-Id: {session}\r\nConnection: keep-alive\r\n\r\n")
}

const INIT: &str = r#"{"op":"init","clientInfo":{"name":"tester","version":"1.2.0"}}"#;
const PING: &str = r#"{"op":"ping"}"#;

#[tokio::test(start_paused = true)]
async fn session_lifecycle_init_ping_fabricated_and_idle() {
    let harness = Harness::with_timeout(5);
    let mut client = harness.connect();

    client.send(&post(None, INIT, true)).await;
    let init = client.reply().await;
    assert_eq!(init.status, 200);
    assert_eq!(init.header("content-type"), Some("application/json"));
    let id = init.session();
    assert_eq!(harness.registry.len(), 1);

    client.send(&post(Some(&id), PING, true)).await;
    let ping = client.reply().await;
    assert_eq!(ping.status, 200);
    assert_eq!(ping.body, format!("pong {id}"));
    assert!(ping.header("mcp-session-id").is_none());

    client.send(&post(Some("fabricated"), PING, true)).await;
    let bogus = client.reply().await;
    assert_eq!(bogus.status, 409);
    let error: Value = serde_json::from_str(&bogus.body).unwrap();
    assert_eq!(error["error"]["code"], -32001);
    assert_eq!(error["error"]["message"], "Session not found");

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(harness.registry.is_empty());
    assert_eq!(*harness.closed.lock().unwrap(), vec![RemovalReason::Expired]);

    client.send(&post(Some(&id), PING, false)).await;
    let expired = client.reply().await;
    assert_eq!(expired.status, 409);
    assert_eq!(harness.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn reported_client_info_reaches_the_registry() {
    let harness = Harness::with_timeout(60);
    let mut client = harness.connect();

    client.send(&post(None, INIT, false)).await;
    let id = client.reply().await.session();

    let snapshot = harness.registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id.as_str(), id);
    assert_eq!(snapshot[0].client, Some(ClientInfo::new("tester", "1.2.0")));
}

#[tokio::test(start_paused = true)]
async fn activity_keeps_a_session_alive() {
    let harness = Harness::with_timeout(5);
    let mut client = harness.connect();
    client.send(&post(None, INIT, true)).await;
    let id = client.reply().await.session();

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(3)).await;
        client.send(&post(Some(&id), PING, true)).await;
        assert_eq!(client.reply().await.status, 200);
    }
    assert_eq!(harness.registry.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn sessions_survive_their_connection() {
    let harness = Harness::with_timeout(60);

    let mut first = harness.connect();
    first.send(&post(None, INIT, false)).await;
    let id = first.reply().await.session();
    assert!(first.rest().await.is_empty());

    let mut second = harness.connect();
    second.send(&post(Some(&id), PING, false)).await;
    let reply = second.reply().await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, format!("pong {id}"));
    assert_eq!(harness.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn headerless_request_without_handshake_registers_nothing() {
    let harness = Harness::with_timeout(60);
    let mut client = harness.connect();

    client.send(&post(None, r#"{"op":"echo","n":7}"#, false)).await;
    let reply = client.reply().await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "7");
    assert!(reply.header("mcp-session-id").is_none());
    assert!(harness.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn pipelined_requests_are_answered_in_order() {
    let harness = Harness::with_timeout(60);
    let mut client = harness.connect();

    let burst: String = (1..=3)
        .map(|n| post(None, &format!(r#"{{"op":"echo","n":{n}}}"#), n < 3))
        .collect();
    client.send(&burst).await;

    for n in 1..=3 {
        let reply = client.reply().await;
        assert_eq!(reply.body, n.to_string());
        let expected = if n < 3 { "keep-alive" } else { "close" };
        assert_eq!(reply.header("connection"), Some(expected));
    }
    assert!(client.rest().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn request_split_across_writes_is_reassembled() {
    let harness = Harness::with_timeout(60);
    let mut client = harness.connect();

    let raw = post(None, r#"{"op":"echo","n":42}"#, false);
    for chunk in raw.as_bytes().chunks(5) {
        client.io.write_all(chunk).await.unwrap();
        tokio::task::yield_now().await;
    }
    assert_eq!(client.reply().await.body, "42");
}

#[tokio::test(start_paused = true)]
async fn paths_outside_the_base_get_404_and_no_handler() {
    let harness = Harness::with_timeout(60);
    let mut client = harness.connect();

    client
        .send("GET /mcpx HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .await;
    let reply = client.reply().await;
    assert_eq!(reply.status, 404);
    assert_eq!(reply.body, "Not Found");

    client.send("GET /health?mcp HTTP/1.1\r\n\r\n").await;
    assert_eq!(client.reply().await.status, 404);
    assert_eq!(harness.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn handler_failure_is_a_generic_500_and_connection_survives() {
    let harness = Harness::with_timeout(60);
    let mut client = harness.connect();
    client.send(&post(None, INIT, true)).await;
    let id = client.reply().await.session();

    client.send(&post(Some(&id), r#"{"op":"fail"}"#, true)).await;
    let failed = client.reply().await;
    assert_eq!(failed.status, 500);
    assert_eq!(failed.body, "Internal Server Error");
    assert!(!failed.body.contains("scripted"));

    client.send(&post(Some(&id), r#"{"op":"panic"}"#, true)).await;
    assert_eq!(client.reply().await.status, 500);

    client.send(&post(Some(&id), "not json", true)).await;
    assert_eq!(client.reply().await.status, 500);

    client.send(&post(Some(&id), PING, false)).await;
    assert_eq!(client.reply().await.status, 200);
    assert!(harness.registry.contains(&SessionId::from(id.as_str())));
}

#[tokio::test(start_paused = true)]
async fn failed_handshake_is_not_registered() {
    let harness = Harness::with_timeout(60);
    let mut client = harness.connect();

    client.send(&post(None, r#"{"op":"fail"}"#, false)).await;
    let reply = client.reply().await;
    assert_eq!(reply.status, 500);
    assert!(reply.header("mcp-session-id").is_none());
    assert!(harness.registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn event_stream_is_unframed_ordered_and_closes_the_connection() {
    let harness = Harness::with_timeout(60);
    let mut client = harness.connect();
    client.send(&post(None, INIT, true)).await;
    let id = client.reply().await.session();

    client.send(&post(Some(&id), r#"{"op":"watch"}"#, true)).await;
    let raw = client.rest().await;
    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let (status, headers) = parse_head(head);

    assert_eq!(status, 200);
    assert!(headers.iter().all(|(n, _)| n != "content-length"));
    assert!(headers.contains(&("content-type".into(), "text/event-stream".into())));
    assert!(headers.contains(&("cache-control".into(), "no-cache".into())));
    assert_eq!(
        body,
        "event: tick\ndata: tick 0\n\nevent: tick\ndata: tick 1\n\nevent: tick\ndata: tick 2\n\n"
    );
    assert!(harness.registry.contains(&SessionId::from(id.as_str())));
}

#[tokio::test(start_paused = true)]
async fn event_stream_stops_when_the_peer_disconnects() {
    let harness = Harness::with_timeout(60);
    let mut client = harness.connect();
    client.send(&post(None, INIT, true)).await;
    let id = client.reply().await.session();

    client.send(&post(Some(&id), r#"{"op":"hold"}"#, true)).await;
    let (status, headers) = client.head().await;
    assert_eq!(status, 200);
    assert!(headers.contains(&("content-type".into(), "text/event-stream".into())));

    let Client { io, task, .. } = client;
    drop(io);
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("connection task should end once the peer is gone")
        .unwrap();

    let held = harness.held.lock().unwrap();
    assert_eq!(held.len(), 1);
    assert!(held.iter().all(EventSender::is_closed));
    // Losing the stream ends the connection, not the session.
    assert!(harness.registry.contains(&SessionId::from(id.as_str())));
}

#[tokio::test(start_paused = true)]
async fn oversized_request_gets_413_and_close() {
    let harness = Harness::new(GatewayConfig {
        max_request_bytes: 64,
        ..GatewayConfig::default()
    });
    let mut client = harness.connect();

    let filler = "a".repeat(256);
    client
        .send(&format!("POST /mcp HTTP/1.1\r\nX-Filler: {filler}"))
        .await;
    let reply = client.reply().await;
    assert_eq!(reply.status, 413);
    assert_eq!(reply.header("connection"), Some("close"));
    assert!(client.rest().await.is_empty());
    assert_eq!(harness.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn nothing_follows_a_closing_response() {
    let harness = Harness::with_timeout(60);
    let mut client = harness.connect();

    let burst = format!(
        "{}{}",
        post(None, r#"{"op":"echo","n":1}"#, false),
        post(None, r#"{"op":"echo","n":2}"#, true)
    );
    client.send(&burst).await;

    assert_eq!(client.reply().await.body, "1");
    assert!(client.rest().await.is_empty());
    assert_eq!(harness.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn delete_closes_the_session_and_notifies_observers() {
    let harness = Harness::with_timeout(60);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _subscription = harness
        .registry
        .subscribe(move |sessions| sink.lock().unwrap().push(sessions.len()));

    let mut client = harness.connect();
    client.send(&post(None, INIT, true)).await;
    let id = client.reply().await.session();

    client.send(&delete(&id)).await;
    assert_eq!(client.reply().await.status, 204);

    client.send(&post(Some(&id), PING, false)).await;
    assert_eq!(client.reply().await.status, 409);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.first(), Some(&0));
    assert!(seen.contains(&1));
    assert_eq!(seen.last(), Some(&0));
    assert_eq!(*harness.closed.lock().unwrap(), vec![RemovalReason::Closed]);
}

#[tokio::test]
async fn gateway_serves_over_tcp_and_clears_on_shutdown() {
    let config = GatewayConfig {
        port: 0,
        ..GatewayConfig::default()
    };
    let gateway = Gateway::bind(config).await.unwrap();
    let addr = gateway.local_addr();
    let registry = gateway.registry().clone();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let closed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&closed);
    let server = tokio::spawn(gateway.run_until(
        move |link: SessionLink| Scripted {
            link,
            closed: Arc::clone(&sink),
            held: Arc::new(Mutex::new(Vec::new())),
        },
        async move {
            let _ = stopped.await;
        },
    ));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(post(None, INIT, false).as_bytes()).await.unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let (status, headers) = parse_head(head);
    assert_eq!(status, 200);
    assert!(headers.iter().any(|(n, _)| n == "mcp-session-id"));
    assert_eq!(body, r#"{"ready":true}"#);
    assert_eq!(registry.len(), 1);

    stop.send(()).unwrap();
    server.await.unwrap().unwrap();
    assert!(registry.is_empty());
    assert!(closed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_config_is_rejected_before_binding() {
    let config = GatewayConfig {
        base_path: "mcp".into(),
        ..GatewayConfig::default()
    };
    assert!(matches!(
        Gateway::bind(config).await,
        Err(sessiongate::GatewayError::Config(_))
    ));
}
