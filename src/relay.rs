//! Persistent client connection to a single Nostr relay.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use rand::Rng;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::event::Event;

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

type WsStream = WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>;
type WsSink = SplitSink<WsStream, Message>;

/// Subscription filter: kinds, authors, `#`-prefixed tag filters, limit.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub kinds: Option<Vec<u32>>,
    pub authors: Option<Vec<String>>,
    /// Tag filters keyed by their `#` form, e.g. `#p`.
    pub tags: BTreeMap<String, Vec<String>>,
    pub limit: Option<u32>,
}

impl Filter {
    /// Build the NIP-01 filter object sent inside a `REQ`.
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        if let Some(k) = &self.kinds {
            map.insert(
                "kinds".into(),
                Value::Array(k.iter().map(|v| Value::Number((*v).into())).collect()),
            );
        }
        if let Some(a) = &self.authors {
            map.insert(
                "authors".into(),
                Value::Array(a.iter().cloned().map(Value::String).collect()),
            );
        }
        for (key, values) in &self.tags {
            map.insert(
                key.clone(),
                Value::Array(values.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(l) = self.limit {
            map.insert("limit".into(), Value::Number(l.into()));
        }
        Value::Object(map)
    }
}

/// Collector for a one-shot query, filled until EOSE.
struct Collector {
    events: Vec<Event>,
    done: oneshot::Sender<Vec<Event>>,
}

/// Routes inbound events to live subscriptions and one-shot collectors.
#[derive(Default)]
struct Router {
    live: HashMap<String, mpsc::UnboundedSender<Event>>,
    oneshot: HashMap<String, Collector>,
}

/// One long-lived relay connection.
///
/// The socket is split on connect: a reader task owns the receiving half and
/// routes `EVENT`/`EOSE` frames by subscription id, while publishes and
/// subscription control share the write sink. Delivery order is the arrival
/// order on the single reader task. Unrecognized inbound frames (`OK`,
/// `NOTICE`, anything else) are ignored.
pub struct RelayLink {
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    router: Arc<Mutex<Router>>,
    closed: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for RelayLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayLink")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl RelayLink {
    /// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
    /// Fails with `Connection` on refusal or when the handshake outlives
    /// `timeout`. Retry policy belongs to the caller.
    pub async fn connect(
        relay: &str,
        tor_socks: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let ws = tokio::time::timeout(timeout, connect_ws(relay, tor_socks))
            .await
            .map_err(|_| Error::Connection(format!("handshake timed out: {relay}")))??;
        let (sink, stream) = ws.split();
        let router: Arc<Mutex<Router>> = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(stream, router.clone(), closed.clone()));
        Ok(Self {
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
            router,
            closed,
            reader,
        })
    }

    /// Send `["EVENT", event]`. Fire-and-forget: success means transmitted,
    /// not persisted by the relay.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Connection("link is closed".into()));
        }
        let msg = json!(["EVENT", event]);
        self.sink
            .lock()
            .await
            .send(Message::Text(msg.to_string()))
            .await
            .map_err(|e| Error::Connection(format!("publish: {e}")))
    }

    /// Open a standing subscription. Matching events arrive on the returned
    /// channel in the order the relay delivers them, until the handle is
    /// cancelled or the link closes.
    pub async fn subscribe(
        &self,
        filter: &Filter,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<Event>)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Connection("link is closed".into()));
        }
        let sub_id = new_sub_id();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut router = self.router.lock().unwrap_or_else(|e| e.into_inner());
            router.live.insert(sub_id.clone(), tx);
        }
        let req = json!(["REQ", sub_id, filter.to_json()]);
        let sent = self
            .sink
            .lock()
            .await
            .send(Message::Text(req.to_string()))
            .await;
        if let Err(e) = sent {
            let mut router = self.router.lock().unwrap_or_else(|e| e.into_inner());
            router.live.remove(&sub_id);
            return Err(Error::Connection(format!("subscribe: {e}")));
        }
        let handle = SubscriptionHandle {
            sub_id,
            sink: self.sink.clone(),
            router: self.router.clone(),
            cancelled: false,
        };
        Ok((handle, rx))
    }

    /// One-shot query: subscribe, collect until `EOSE`, close. Fails with
    /// `QueryTimeout` when the end-of-results signal does not arrive in time.
    pub async fn query_sync(&self, filter: &Filter, timeout: Duration) -> Result<Vec<Event>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Connection("link is closed".into()));
        }
        let sub_id = new_sub_id();
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut router = self.router.lock().unwrap_or_else(|e| e.into_inner());
            router.oneshot.insert(
                sub_id.clone(),
                Collector {
                    events: vec![],
                    done: done_tx,
                },
            );
        }
        let req = json!(["REQ", sub_id, filter.to_json()]);
        self.sink
            .lock()
            .await
            .send(Message::Text(req.to_string()))
            .await
            .map_err(|e| Error::Connection(format!("query: {e}")))?;

        let outcome = tokio::time::timeout(timeout, done_rx).await;
        self.send_close(&sub_id).await;
        match outcome {
            Ok(Ok(events)) => Ok(events),
            Ok(Err(_)) => Err(Error::Connection("link closed during query".into())),
            Err(_) => {
                let mut router = self.router.lock().unwrap_or_else(|e| e.into_inner());
                router.oneshot.remove(&sub_id);
                Err(Error::QueryTimeout)
            }
        }
    }

    /// Tear down the connection: stop delivery on every subscription and
    /// release the socket. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut router = self.router.lock().unwrap_or_else(|e| e.into_inner());
            router.live.clear();
            router.oneshot.clear();
        }
        let _ = self.sink.lock().await.send(Message::Close(None)).await;
        self.reader.abort();
    }

    async fn send_close(&self, sub_id: &str) {
        let msg = json!(["CLOSE", sub_id]);
        let _ = self
            .sink
            .lock()
            .await
            .send(Message::Text(msg.to_string()))
            .await;
    }
}

/// Cancellation handle for a standing subscription.
pub struct SubscriptionHandle {
    sub_id: String,
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    router: Arc<Mutex<Router>>,
    cancelled: bool,
}

impl SubscriptionHandle {
    /// Stop delivery and send `CLOSE`. Safe to call more than once.
    pub async fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        {
            let mut router = self.router.lock().unwrap_or_else(|e| e.into_inner());
            router.live.remove(&self.sub_id);
        }
        let msg = json!(["CLOSE", self.sub_id]);
        let _ = self
            .sink
            .lock()
            .await
            .send(Message::Text(msg.to_string()))
            .await;
    }
}

/// Read frames until the socket closes, routing events by subscription id.
async fn read_loop(
    mut stream: SplitStream<WsStream>,
    router: Arc<Mutex<Router>>,
    closed: Arc<AtomicBool>,
) {
    while let Some(msg) = stream.next().await {
        let txt = match msg {
            Ok(Message::Text(txt)) => txt,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("relay read error: {e}");
                break;
            }
        };
        let Ok(val) = serde_json::from_str::<Value>(&txt) else {
            continue;
        };
        let Some(arr) = val.as_array() else { continue };
        match arr.first().and_then(|v| v.as_str()) {
            Some("EVENT") if arr.len() >= 3 => {
                let Some(sub) = arr.get(1).and_then(|v| v.as_str()) else {
                    continue;
                };
                let Ok(ev) = serde_json::from_value::<Event>(arr[2].clone()) else {
                    warn!("dropping malformed event frame");
                    continue;
                };
                let mut router = router.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(collector) = router.oneshot.get_mut(sub) {
                    collector.events.push(ev);
                } else if let Some(tx) = router.live.get(sub) {
                    if tx.send(ev).is_err() {
                        router.live.remove(sub);
                    }
                }
            }
            Some("EOSE") => {
                let Some(sub) = arr.get(1).and_then(|v| v.as_str()) else {
                    continue;
                };
                let collector = {
                    let mut router = router.lock().unwrap_or_else(|e| e.into_inner());
                    router.oneshot.remove(sub)
                };
                if let Some(c) = collector {
                    let _ = c.done.send(c.events);
                }
            }
            // OK acks and anything unrecognized carry no contract here.
            Some(other) => debug!("ignoring relay frame: {other}"),
            None => {}
        }
    }
    closed.store(true, Ordering::SeqCst);
    // Dropping the senders ends every live subscription stream.
    let mut router = router.lock().unwrap_or_else(|e| e.into_inner());
    router.live.clear();
    router.oneshot.clear();
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<WsStream> {
    let url = Url::parse(relay).map_err(|e| Error::Connection(format!("bad url: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Connection("missing host".into()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Connection("missing port".into()))?;
    let req = relay
        .into_client_request()
        .map_err(|e| Error::Connection(format!("bad request: {e}")))?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(
            Socks5Stream::connect(proxy, (host, port))
                .await
                .map_err(|e| Error::Connection(format!("socks: {e}")))?,
        )
    } else {
        Box::new(
            TcpStream::connect((host, port))
                .await
                .map_err(|e| Error::Connection(format!("connect: {e}")))?,
        )
    };
    let (ws, _) = client_async(req, stream)
        .await
        .map_err(|e| Error::Connection(format!("handshake: {e}")))?;
    Ok(ws)
}

/// Short random id for a subscription, unique per connection.
fn new_sub_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    hex::encode(bytes)
}
