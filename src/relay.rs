//! Relay transport: NIP-01 over WebSocket, one connection per relay.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::mpsc,
};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::{
    client_async,
    tungstenite::{client::IntoClientRequest, Message},
    WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    event::Event,
    filter::{close_message, req_message, Filter},
};

/// A message delivered by one relay for one subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { relay: String, event: Event },
    Eose { relay: String },
}

/// Where a relay subscription delivers its messages.
pub type Sink = mpsc::UnboundedSender<RelayMessage>;

/// Something that can stream relay messages for a subscription id.
///
/// Implementations must stop using `sink` once the returned handle is
/// released, and must drop `sink` when the relay goes away for good.
pub trait Transport: Send + Sync {
    fn subscribe(
        &self,
        relay: &str,
        sub_id: &str,
        filters: &[Filter],
        sink: Sink,
    ) -> RelaySubscription;
}

/// Handle to one relay subscription. Released on drop.
pub struct RelaySubscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl RelaySubscription {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Stop the relay subscription. Calling it again does nothing.
    pub fn unsubscribe(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for RelaySubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySubscription")
            .field("active", &self.is_active())
            .finish()
    }
}

enum Command {
    Req {
        sub_id: String,
        filters: Vec<Filter>,
        sink: Sink,
    },
    Close {
        sub_id: String,
    },
}

/// Pool of relay connections shared by every subscription of a session.
///
/// Connections are opened on first use and reopened on the next subscribe
/// after they drop.
#[derive(Clone, Default)]
pub struct RelayPool {
    connections: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Command>>>>,
    tor_socks: Option<String>,
}

impl RelayPool {
    pub fn new(tor_socks: Option<String>) -> Self {
        Self {
            connections: Arc::default(),
            tor_socks,
        }
    }

    /// Command channel of the live connection task for `relay`, spawning one
    /// if there is none.
    fn connection(&self, relay: &str) -> mpsc::UnboundedSender<Command> {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = connections.get(relay).filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(relay.to_string(), self.tor_socks.clone(), rx));
        connections.insert(relay.to_string(), tx.clone());
        tx
    }
}

impl Transport for RelayPool {
    fn subscribe(
        &self,
        relay: &str,
        sub_id: &str,
        filters: &[Filter],
        sink: Sink,
    ) -> RelaySubscription {
        let req = Command::Req {
            sub_id: sub_id.to_string(),
            filters: filters.to_vec(),
            sink,
        };
        let tx = self.connection(relay);
        // the task may have ended between lookup and send
        let tx = match tx.send(req) {
            Ok(()) => tx,
            Err(mpsc::error::SendError(req)) => {
                let tx = self.connection(relay);
                if tx.send(req).is_err() {
                    debug!(%relay, %sub_id, "relay connection unavailable");
                }
                tx
            }
        };
        let sub_id = sub_id.to_string();
        RelaySubscription::new(move || {
            let _ = tx.send(Command::Close { sub_id });
        })
    }
}

async fn run_connection(
    relay: String,
    tor_socks: Option<String>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let ws = match connect_ws(&relay, tor_socks.as_deref()).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%relay, error = %e, "relay connection failed");
            return;
        }
    };
    debug!(%relay, "relay connected");
    let (mut write, mut read) = ws.split();
    let mut routes: HashMap<String, Sink> = HashMap::new();

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let frame = match cmd {
                    Some(Command::Req { sub_id, filters, sink }) => {
                        let frame = req_message(&sub_id, &filters);
                        routes.insert(sub_id, sink);
                        frame
                    }
                    Some(Command::Close { sub_id }) => {
                        if routes.remove(&sub_id).is_none() {
                            continue;
                        }
                        close_message(&sub_id)
                    }
                    None => break,
                };
                if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                    warn!(%relay, error = %e, "relay write failed");
                    break;
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(txt))) => route(&relay, &txt, &mut routes),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%relay, error = %e, "relay read failed");
                    break;
                }
            },
        }
    }
    debug!(%relay, open = routes.len(), "relay disconnected");
    let _ = write.close().await;
}

/// Dispatch one relay frame to the subscription it names.
fn route(relay: &str, txt: &str, routes: &mut HashMap<String, Sink>) {
    let frame = match serde_json::from_str::<Value>(txt) {
        Ok(Value::Array(frame)) => frame,
        _ => {
            debug!(%relay, "ignoring malformed frame");
            return;
        }
    };
    let sub_id = frame.get(1).and_then(Value::as_str).unwrap_or_default();
    let message = match frame.first().and_then(Value::as_str) {
        Some("EVENT") => {
            let Some(raw) = frame.get(2) else { return };
            match Event::deserialize(raw) {
                Ok(event) => RelayMessage::Event {
                    relay: relay.to_string(),
                    event,
                },
                Err(e) => {
                    debug!(%relay, %sub_id, error = %e, "ignoring unparsable event");
                    return;
                }
            }
        }
        Some("EOSE") => RelayMessage::Eose {
            relay: relay.to_string(),
        },
        Some("CLOSED") => {
            let reason = frame.get(2).and_then(Value::as_str).unwrap_or_default();
            info!(%relay, %sub_id, %reason, "subscription closed by relay");
            routes.remove(sub_id);
            return;
        }
        Some("NOTICE") => {
            info!(%relay, notice = %sub_id, "relay notice");
            return;
        }
        _ => return,
    };
    let Some(sink) = routes.get(sub_id) else {
        return;
    };
    if sink.send(message).is_err() {
        routes.remove(sub_id);
    }
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(
    relay: &str,
    tor_socks: Option<&str>,
) -> Result<WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>> {
    let url = Url::parse(relay)?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::event::{Tag, KIND_PLACE};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    pub(crate) fn sample_event(id: &str, kind: u32, created_at: u64) -> Event {
        Event {
            id: id.into(),
            pubkey: "p".into(),
            kind,
            created_at,
            tags: vec![Tag(vec!["d".into(), "s".into()])],
            content: String::new(),
            sig: String::new(),
        }
    }

    async fn next_frame(
        ws: &mut WebSocketStream<TcpStream>,
    ) -> Value {
        loop {
            match ws.next().await {
                Some(Ok(TMsg::Text(txt))) => return serde_json::from_str(&txt).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("relay socket ended: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn routes_frames_by_subscription_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let req = next_frame(&mut ws).await;
            assert_eq!(req[0], "REQ");
            assert_eq!(req[1], "s1");
            assert_eq!(req[2]["kinds"][0], KIND_PLACE);
            for frame in [
                json!(["EVENT", "other", sample_event("xx", KIND_PLACE, 1)]),
                json!(["NOTICE", "slow down"]),
                json!("garbage"),
                json!(["EVENT", "s1", {"id": "broken"}]),
                json!(["EVENT", "s1", sample_event("aa11", KIND_PLACE, 1)]),
                json!(["EOSE", "s1"]),
            ] {
                ws.send(TMsg::Text(frame.to_string())).await.unwrap();
            }
            assert_eq!(next_frame(&mut ws).await, json!(["CLOSE", "s1"]));
        });

        let pool = RelayPool::new(None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = pool.subscribe(&url, "s1", &[Filter::kinds([KIND_PLACE])], tx);

        match rx.recv().await {
            Some(RelayMessage::Event { relay, event }) => {
                assert_eq!(relay, url);
                assert_eq!(event.id, "aa11");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rx.recv().await, Some(RelayMessage::Eose { relay: url }));

        handle.unsubscribe();
        assert!(!handle.is_active());
        server.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscriptions_share_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut ids = Vec::new();
            for _ in 0..2 {
                let req = next_frame(&mut ws).await;
                ids.push(req[1].as_str().unwrap().to_string());
            }
            ids.sort();
            assert_eq!(ids, ["a", "b"]);
            for id in ["a", "b"] {
                ws.send(TMsg::Text(json!(["EOSE", id]).to_string()))
                    .await
                    .unwrap();
            }
            // keep the socket open until the client is done
            let _ = ws.next().await;
        });

        let pool = RelayPool::new(None);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let _a = pool.subscribe(&url, "a", &[Filter::kinds([1])], tx_a);
        let _b = pool.subscribe(&url, "b", &[Filter::kinds([0])], tx_b);
        assert!(matches!(rx_a.recv().await, Some(RelayMessage::Eose { .. })));
        assert!(matches!(rx_b.recv().await, Some(RelayMessage::Eose { .. })));
        server.abort();
    }

    #[tokio::test]
    async fn failed_connection_closes_sink() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let pool = RelayPool::new(None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = pool.subscribe(&format!("ws://{addr}"), "s1", &[Filter::kinds([1])], tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn invalid_url_closes_sink() {
        let pool = RelayPool::new(None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = pool.subscribe("not a url", "s1", &[Filter::kinds([1])], tx);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn release_runs_once() {
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        let mut handle = RelaySubscription::new(move || *counter.lock().unwrap() += 1);
        handle.unsubscribe();
        handle.unsubscribe();
        drop(handle);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    async fn spawn_socks_proxy(target: std::net::SocketAddr) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut inbound, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 2];
            inbound.read_exact(&mut greeting).await.unwrap();
            let mut methods = vec![0u8; greeting[1] as usize];
            inbound.read_exact(&mut methods).await.unwrap();
            inbound.write_all(&[0x05, 0x00]).await.unwrap();

            let mut req = [0u8; 4];
            inbound.read_exact(&mut req).await.unwrap();
            let addr_len = match req[3] {
                0x01 => 4,
                0x04 => 16,
                _ => {
                    let mut len = [0u8; 1];
                    inbound.read_exact(&mut len).await.unwrap();
                    len[0] as usize
                }
            };
            let mut rest = vec![0u8; addr_len + 2];
            inbound.read_exact(&mut rest).await.unwrap();
            let mut outbound = TcpStream::connect(target).await.unwrap();
            inbound
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            tokio::io::copy_bidirectional(&mut inbound, &mut outbound)
                .await
                .ok();
        });
        addr
    }

    #[tokio::test]
    async fn connects_through_socks_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let req = next_frame(&mut ws).await;
            ws.send(TMsg::Text(
                json!(["EVENT", req[1], sample_event("dd44", 1, 1)]).to_string(),
            ))
            .await
            .unwrap();
            let _ = ws.next().await;
        });

        let proxy = spawn_socks_proxy(addr).await;
        let pool = RelayPool::new(Some(proxy.to_string()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = pool.subscribe(&format!("ws://{addr}"), "px", &[Filter::kinds([1])], tx);
        match rx.recv().await {
            Some(RelayMessage::Event { event, .. }) => assert_eq!(event.id, "dd44"),
            other => panic!("unexpected {other:?}"),
        }
        server.abort();
    }
}
