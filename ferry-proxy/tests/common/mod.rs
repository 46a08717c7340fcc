//! Test doubles: an in-process fake backend speaking the cluster protocol.
//!
//! Each fake backend accepts any number of connections, answers the topology
//! query from a shared topology description, and answers data commands via a
//! scripted reply function. Backends can start "stalled" (reading but not
//! replying until resumed) and can slam every open connection shut, which is
//! enough to script all the failure scenarios.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use ferry_resp::{decode_command, encode_value, Command, RespValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Shared slot-range topology served to `CLUSTER SLOTS` queries:
/// `(start, end, master_addr)` triples.
pub type SharedTopology = Arc<Mutex<Vec<(u16, u16, Arc<str>)>>>;

/// Creates an empty shared topology.
pub fn shared_topology() -> SharedTopology {
    Arc::new(Mutex::new(Vec::new()))
}

/// Replaces the shared topology contents.
pub fn set_topology(topology: &SharedTopology, ranges: Vec<(u16, u16, Arc<str>)>) {
    *topology.lock().unwrap() = ranges;
}

type ReplyFn = Arc<dyn Fn(&Command) -> RespValue + Send + Sync>;

/// Configuration for one fake backend.
#[derive(Clone)]
pub struct BackendOptions {
    /// Produces the reply for each non-topology command.
    pub reply: ReplyFn,
    /// Delay applied before each reply.
    pub delay: Option<Duration>,
    /// Start with replies held back until `resume` is called.
    pub stalled: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            reply: Arc::new(|_| RespValue::ok()),
            delay: None,
            stalled: false,
        }
    }
}

impl BackendOptions {
    pub fn replying(reply: impl Fn(&Command) -> RespValue + Send + Sync + 'static) -> Self {
        Self {
            reply: Arc::new(reply),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }
}

/// A scripted backend node.
pub struct FakeBackend {
    /// Address the backend listens on.
    pub addr: Arc<str>,
    /// Every non-topology command received, rendered as `"GET foo"`.
    pub seen: Arc<Mutex<Vec<String>>>,
    /// Number of topology queries answered.
    pub cluster_queries: Arc<AtomicUsize>,
    gate: Arc<watch::Sender<bool>>,
    kill: Arc<watch::Sender<u64>>,
}

impl FakeBackend {
    /// Binds a listener and serves connections with the given script.
    pub async fn spawn(topology: SharedTopology, options: BackendOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: Arc<str> = Arc::from(listener.local_addr().unwrap().to_string());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let cluster_queries = Arc::new(AtomicUsize::new(0));
        let (gate, _) = watch::channel(!options.stalled);
        let gate = Arc::new(gate);
        let (kill, _) = watch::channel(0u64);
        let kill = Arc::new(kill);

        let state = ConnState {
            topology,
            options,
            seen: Arc::clone(&seen),
            cluster_queries: Arc::clone(&cluster_queries),
            gate: Arc::clone(&gate),
            kill: Arc::clone(&kill),
        };
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_conn(conn, state.clone()));
            }
        });

        Self {
            addr,
            seen,
            cluster_queries,
            gate,
            kill,
        }
    }

    /// Number of non-topology commands received so far.
    pub fn seen_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Releases held-back replies; the backend answers normally afterwards.
    pub fn resume(&self) {
        let _ = self.gate.send(true);
    }

    /// Closes every currently open connection. New connections still accept.
    pub fn close_all(&self) {
        self.kill.send_modify(|generation| *generation += 1);
    }
}

#[derive(Clone)]
struct ConnState {
    topology: SharedTopology,
    options: BackendOptions,
    seen: Arc<Mutex<Vec<String>>>,
    cluster_queries: Arc<AtomicUsize>,
    gate: Arc<watch::Sender<bool>>,
    kill: Arc<watch::Sender<u64>>,
}

async fn serve_conn(mut conn: TcpStream, state: ConnState) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut kill_rx = state.kill.subscribe();
    let mut gate_rx = state.gate.subscribe();
    let mut out = BytesMut::with_capacity(4 * 1024);

    loop {
        loop {
            let command = match decode_command(&mut buf) {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(_) => return,
            };
            if command.name() == "CLUSTER" {
                state.cluster_queries.fetch_add(1, Ordering::SeqCst);
                out.clear();
                encode_value(&slots_reply(&state.topology), &mut out);
                if conn.write_all(&out).await.is_err() {
                    return;
                }
                continue;
            }

            state.seen.lock().unwrap().push(describe(&command));

            // Hold the reply while stalled; a kill closes the connection.
            while !*gate_rx.borrow() {
                tokio::select! {
                    _ = kill_rx.changed() => return,
                    changed = gate_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }

            if let Some(delay) = state.options.delay {
                tokio::time::sleep(delay).await;
            }
            out.clear();
            encode_value(&(state.options.reply)(&command), &mut out);
            if conn.write_all(&out).await.is_err() {
                return;
            }
        }

        let read = tokio::select! {
            _ = kill_rx.changed() => return,
            read = conn.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

fn describe(command: &Command) -> String {
    command
        .args()
        .iter()
        .map(|arg| String::from_utf8_lossy(arg).to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Renders the shared topology as a `CLUSTER SLOTS` reply.
fn slots_reply(topology: &SharedTopology) -> RespValue {
    let entries = topology
        .lock()
        .unwrap()
        .iter()
        .map(|(start, end, master)| {
            let (ip, port) = master.rsplit_once(':').unwrap();
            RespValue::Array(vec![
                RespValue::Integer(i64::from(*start)),
                RespValue::Integer(i64::from(*end)),
                RespValue::Array(vec![
                    RespValue::bulk(ip.to_string()),
                    RespValue::Integer(port.parse().unwrap()),
                ]),
            ])
        })
        .collect();
    RespValue::Array(entries)
}

/// A minimal pipelining client for driving the proxy.
pub struct TestClient {
    conn: TcpStream,
    buf: BytesMut,
}

impl TestClient {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let conn = TcpStream::connect(addr).await.unwrap();
        conn.set_nodelay(true).unwrap();
        Self {
            conn,
            buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Sends one command without waiting for the reply.
    pub async fn send(&mut self, parts: &[&[u8]]) {
        let frame = ferry_resp::command_frame(parts);
        self.conn.write_all(&frame).await.unwrap();
    }

    /// Reads the next reply, with a deadline.
    pub async fn read_reply(&mut self) -> RespValue {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(value) = ferry_resp::decode_value(&mut self.buf).unwrap() {
                    return value;
                }
                let read = self.conn.read_buf(&mut self.buf).await.unwrap();
                assert!(read > 0, "proxy closed the connection");
            }
        })
        .await
        .expect("timed out waiting for a reply")
    }

    /// Asserts that no reply arrives within the window.
    pub async fn expect_silence(&mut self, window: Duration) {
        let result = tokio::time::timeout(window, self.conn.read_buf(&mut self.buf)).await;
        assert!(result.is_err(), "expected no bytes from the proxy yet");
        assert!(
            ferry_resp::decode_value(&mut self.buf).unwrap().is_none(),
            "expected no complete reply yet"
        );
    }
}
