//! Shared fixtures for unit and end-to-end tests.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{channel::mpsc, SinkExt, StreamExt};
use secp256k1::{Keypair, Message as SecpMessage, Secp256k1};
use serde_json::{json, Value};
use tokio::{net::TcpStream, task::JoinHandle};
use tokio_tungstenite::{tungstenite::Message as TungMessage, MaybeTlsStream, WebSocketStream};

use crate::{
    auth::AUTH_KIND,
    connection::{ConnId, Connection, SendError},
    event::{event_hash, Event, Tag},
    filter::Filter,
    handlers::HandlerRegistry,
    relay::{Relay, RelayOptions},
    server,
    storage::EventStore,
    verify::Schnorr,
};

pub const SECRET: [u8; 32] = [1u8; 32];
pub const OTHER_SECRET: [u8; 32] = [2u8; 32];

/// Serializes tests that touch process environment variables.
pub static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Every variable [`crate::config::Settings`] reads.
pub const ENV_VARS: [&str; 14] = [
    "STORE_ROOT",
    "BIND",
    "RELAY_URL",
    "VERIFY_SIG",
    "ACCEPTED_KINDS",
    "AUTH_REQUIRED_KINDS",
    "AUTH_MAX_SKEW",
    "MAX_SUBSCRIPTIONS",
    "MAX_MESSAGE_BYTES",
    "WRITE_TIMEOUT_MS",
    "RELAY_NAME",
    "RELAY_DESCRIPTION",
    "RELAY_PUBKEY",
    "RELAY_CONTACT",
];

pub fn pubkey_of(secret: [u8; 32]) -> String {
    let secp = Secp256k1::new();
    let kp = Keypair::from_seckey_slice(&secp, &secret).unwrap();
    hex::encode(kp.x_only_public_key().0.serialize())
}

pub fn signed_event(
    secret: [u8; 32],
    kind: u32,
    created_at: u64,
    tags: Vec<Tag>,
    content: &str,
) -> Event {
    let secp = Secp256k1::new();
    let kp = Keypair::from_seckey_slice(&secp, &secret).unwrap();
    let mut ev = Event {
        id: String::new(),
        pubkey: hex::encode(kp.x_only_public_key().0.serialize()),
        kind,
        created_at,
        tags,
        content: content.into(),
        sig: String::new(),
    };
    let hash = event_hash(&ev).unwrap();
    ev.id = hex::encode(hash);
    let msg = SecpMessage::from_digest_slice(&hash).unwrap();
    let sig = secp.sign_schnorr_no_aux_rand(&msg, &kp);
    ev.sig = hex::encode(sig.as_ref());
    ev
}

pub fn auth_event(secret: [u8; 32], challenge: &str, relay: &str, created_at: u64) -> Event {
    signed_event(
        secret,
        AUTH_KIND,
        created_at,
        vec![
            Tag(vec!["relay".into(), relay.into()]),
            Tag(vec!["challenge".into(), challenge.into()]),
        ],
        "",
    )
}

/// Connection whose frames land in an unbounded channel.
pub fn channel_connection(id: ConnId) -> (Connection, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded::<String>();
    let sink = tx.sink_map_err(|e| SendError::Transport(e.to_string()));
    (Connection::new(id, Box::pin(sink), Duration::from_secs(1)), rx)
}

/// Connection whose peer never accepts a frame.
pub fn stalled_connection(id: ConnId, write_timeout: Duration) -> Connection {
    let sink = futures::sink::unfold((), |(), _frame: String| async {
        std::future::pending::<Result<(), SendError>>().await
    });
    Connection::new(id, Box::pin(sink), write_timeout)
}

/// Drain every frame currently queued on a channel connection.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
    let mut out = vec![];
    while let Ok(frame) = rx.try_recv() {
        out.push(serde_json::from_str(&frame).unwrap());
    }
    out
}

/// In-memory [`EventStore`] for tests that don't need the file store.
#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<Vec<Event>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn with(events: Vec<Event>) -> Self {
        Self {
            events: Mutex::new(events),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("disk on fire");
        }
        Ok(())
    }
}

impl EventStore for MemoryStore {
    fn store(&self, ev: &Event) -> anyhow::Result<bool> {
        self.check()?;
        let mut events = self.events.lock().unwrap();
        if events.iter().any(|e| e.id == ev.id) {
            return Ok(false);
        }
        events.push(ev.clone());
        Ok(true)
    }

    fn query(&self, filters: &[Filter]) -> anyhow::Result<Vec<Event>> {
        self.check()?;
        let events = self.events.lock().unwrap();
        Ok(events
            .iter()
            .filter(|e| filters.iter().any(|f| f.matches(e)))
            .cloned()
            .collect())
    }

    fn count(&self, filters: &[Filter]) -> anyhow::Result<u64> {
        Ok(self.query(filters)?.len() as u64)
    }
}

pub fn test_options() -> RelayOptions {
    RelayOptions {
        relay_url: "ws://relay.test".into(),
        write_timeout: Duration::from_secs(1),
        ..RelayOptions::default()
    }
}

/// Relay with the standard handlers over `store`, accepting kinds 1 and 7 and
/// requiring AUTH for kind 4.
pub fn test_relay(options: RelayOptions, store: Arc<dyn EventStore>) -> Relay {
    let handlers = HandlerRegistry::standard(Arc::clone(&store), &[1, 7], &[4]);
    Relay::new(options, store, handlers, Arc::new(Schnorr))
}

/// A relay served over a real socket on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub relay: Arc<Relay>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(store: Arc<dyn EventStore>) -> Self {
        Self::start_with(test_options(), store).await
    }

    /// Start a server; `relay_url` in `options` is replaced by the bound address.
    pub async fn start_with(mut options: RelayOptions, store: Arc<dyn EventStore>) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        options.relay_url = format!("ws://{addr}");
        let relay = Arc::new(test_relay(options, store));
        let app = server::router(Arc::clone(&relay));
        let handle = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        Self {
            addr,
            relay,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Connect a client and consume the AUTH challenge.
    pub async fn connect(&self) -> Client {
        let (ws, _) = tokio_tungstenite::connect_async(format!("{}/", self.url()))
            .await
            .unwrap();
        let mut client = Client {
            ws,
            challenge: String::new(),
        };
        let first = client.recv().await;
        assert_eq!(first[0], "AUTH");
        client.challenge = first[1].as_str().unwrap().to_string();
        client
    }

    /// Wait until the registry no longer knows any connection.
    pub async fn wait_for_no_connections(&self) {
        for _ in 0..100 {
            if self.relay.registry().connection_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connections were not cleaned up");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub challenge: String,
}

impl Client {
    pub async fn send(&mut self, msg: Value) {
        self.send_text(msg.to_string()).await;
    }

    pub async fn send_text(&mut self, text: String) {
        self.ws.send(TungMessage::Text(text)).await.unwrap();
    }

    /// Next text frame as JSON, failing the test after two seconds.
    pub async fn recv(&mut self) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .unwrap();
            if let TungMessage::Text(t) = msg {
                return serde_json::from_str(&t).unwrap();
            }
        }
    }

    /// Assert that no text frame arrives within `ms` milliseconds.
    pub async fn expect_silence(&mut self, ms: u64) {
        let deadline = tokio::time::sleep(Duration::from_millis(ms));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return,
                msg = self.ws.next() => match msg {
                    Some(Ok(TungMessage::Text(t))) => panic!("unexpected frame {t}"),
                    Some(Ok(_)) => {}
                    other => panic!("connection ended: {other:?}"),
                },
            }
        }
    }

    /// Send a REQ and collect stored events up to EOSE.
    pub async fn subscribe(&mut self, sub: &str, filters: Vec<Value>) -> Vec<Value> {
        let mut msg = vec![json!("REQ"), json!(sub)];
        msg.extend(filters);
        self.send(Value::Array(msg)).await;
        let mut events = vec![];
        loop {
            let frame = self.recv().await;
            match frame[0].as_str() {
                Some("EOSE") => {
                    assert_eq!(frame[1], sub);
                    return events;
                }
                Some("EVENT") if frame[1] == sub => events.push(frame[2].clone()),
                _ => panic!("unexpected frame {frame}"),
            }
        }
    }

    /// Publish an event and return the OK frame.
    pub async fn publish(&mut self, ev: &Event) -> Value {
        self.send(json!(["EVENT", ev])).await;
        let frame = self.recv().await;
        assert_eq!(frame[0], "OK", "unexpected frame {frame}");
        frame
    }

    pub async fn close(mut self) {
        self.ws.close(None).await.unwrap();
    }
}
