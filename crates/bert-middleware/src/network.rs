//! [`NetworkPeripheral`] – the WebSocket endpoint the tablet app talks to.
//!
//! Each text message is one JSON [`RequestEnvelope`]; the peripheral stamps
//! it with [`Source::Network`] and submits it to the hub.  Replies arriving
//! on the network lane of the [`ReplyBus`] are written back as JSON to every
//! open connection.
//!
//! Each connection is rate limited.  A message over the limit, or one that
//! does not parse, is answered on that connection only and never reaches
//! the hub.

use std::net::SocketAddr;
use std::num::NonZeroU32;

use bert_types::{BertError, RequestEnvelope, RequestKind, Source, Target};
use futures_util::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::bus::{ReplyBus, Submitter};

/// Default TCP port for the network peripheral.
pub const DEFAULT_PORT: u16 = 8765;

/// Default per-connection limit, in requests per second.
pub const DEFAULT_RATE_LIMIT: u32 = 20;

// ---------------------------------------------------------------------------
// NetworkPeripheral
// ---------------------------------------------------------------------------

/// WebSocket server bridging remote clients to the hub.
///
/// # Example
///
/// ```rust,no_run
/// use bert_middleware::{NetworkPeripheral, ReplyBus};
/// use tokio::sync::mpsc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), bert_types::BertError> {
///     let (submit, _hub_inbox) = mpsc::channel(64);
///     NetworkPeripheral::new(submit, ReplyBus::default())
///         .with_port(9000)
///         .run()
///         .await
/// }
/// ```
pub struct NetworkPeripheral {
    submit: Submitter,
    bus: ReplyBus,
    port: u16,
    rate_limit: u32,
}

impl NetworkPeripheral {
    pub fn new(submit: Submitter, bus: ReplyBus) -> Self {
        Self { submit, bus, port: DEFAULT_PORT, rate_limit: DEFAULT_RATE_LIMIT }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the per-connection limit in requests per second.  Zero
    /// disables limiting.
    pub fn with_rate_limit(mut self, per_second: u32) -> Self {
        self.rate_limit = per_second;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind `0.0.0.0:port` and serve until the process ends.
    ///
    /// # Errors
    ///
    /// Returns [`BertError::Io`] if the listener cannot bind.
    pub async fn run(self) -> Result<(), BertError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BertError::Io(format!("bind error on {addr}: {e}")))?;
        self.serve(listener).await
    }

    /// Serve connections accepted from an already bound `listener`.
    pub async fn serve(self, listener: TcpListener) -> Result<(), BertError> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "network peripheral listening");
        }
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let connection = Connection {
                        submit: self.submit.clone(),
                        bus: self.bus.clone(),
                        limiter: limiter(self.rate_limit),
                        peer,
                    };
                    tokio::spawn(async move {
                        if let Err(e) = connection.run(stream).await {
                            warn!(%peer, error = %e, "network connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept error"),
            }
        }
    }
}

fn limiter(per_second: u32) -> Option<DefaultDirectRateLimiter> {
    NonZeroU32::new(per_second).map(|n| RateLimiter::direct(Quota::per_second(n)))
}

// ---------------------------------------------------------------------------
// Message parsing
// ---------------------------------------------------------------------------

/// Parse one inbound text message into an envelope addressed back to the
/// network peripheral.
pub fn parse_request(text: &str) -> Result<RequestEnvelope, BertError> {
    let mut envelope: RequestEnvelope =
        serde_json::from_str(text).map_err(|e| BertError::Parse(format!("bad request: {e}")))?;
    envelope.source = Source::Network;
    envelope.error = None;
    envelope.text = None;
    Ok(envelope)
}

/// A reply for a message that never reached the hub.
fn rejection(message: impl Into<String>) -> RequestEnvelope {
    let mut envelope =
        RequestEnvelope::new(RequestKind::Notification(String::new()), Target::None).with_source(Source::Network);
    envelope.assign_error(message);
    envelope
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

struct Connection {
    submit: Submitter,
    bus: ReplyBus,
    limiter: Option<DefaultDirectRateLimiter>,
    peer: SocketAddr,
}

impl Connection {
    /// Decide what to do with one inbound text message: `Ok` to submit, or
    /// `Err` with the reply for this connection alone.
    fn admit(&self, text: &str) -> Result<RequestEnvelope, RequestEnvelope> {
        if self.limiter.as_ref().is_some_and(|l| l.check().is_err()) {
            return Err(rejection("Too many requests, please slow down"));
        }
        parse_request(text).map_err(|e| rejection(e.to_string()))
    }

    async fn run(self, stream: TcpStream) -> Result<(), BertError> {
        let peer = self.peer;
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| BertError::Io(format!("WS handshake from {peer}: {e}")))?;
        info!(%peer, "network client connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut replies = self.bus.subscribe(Source::Network)?;

        loop {
            tokio::select! {
                // ── Hub → client ────────────────────────────────────────────
                reply = replies.recv() => match reply {
                    Ok(envelope) => {
                        if send_json(&mut ws_tx, &envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => warn!(%peer, lagged_by = n, "network client lagged"),
                    Err(RecvError::Closed) => break,
                },
                // ── Client → hub ────────────────────────────────────────────
                message = ws_rx.next() => match message {
                    Some(Ok(Message::Text(text))) => match self.admit(text.as_str()) {
                        Ok(envelope) => {
                            debug!(%peer, kind = envelope.kind.label(), "network request");
                            self.submit
                                .send(envelope)
                                .await
                                .map_err(|_| BertError::Channel("the hub has stopped".into()))?;
                        }
                        Err(rejected) => {
                            if send_json(&mut ws_tx, &rejected).await.is_err() {
                                break;
                            }
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(%peer, error = %e, "network read error");
                        break;
                    }
                    _ => {}
                },
            }
        }
        info!(%peer, "network client disconnected");
        Ok(())
    }
}

async fn send_json<S>(ws_tx: &mut S, envelope: &RequestEnvelope) -> Result<(), BertError>
where
    S: SinkExt<Message> + Unpin,
{
    let json = serde_json::to_string(envelope).map_err(|e| BertError::Parse(e.to_string()))?;
    ws_tx
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| BertError::Io("network client write failed".into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bert_types::{Joint, JointProperty};
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;

    use super::*;

    // ── Parsing ──────────────────────────────────────────────────────────────

    #[test]
    fn request_json_is_stamped_with_the_network_source() -> Result<(), BertError> {
        let text = r#"{
            "kind": {"type": "GET_MOTOR_PROPERTY", "payload": "ANGLE"},
            "target": {"kind": "JOINT", "name": "LEFT_ELBOW_Y"},
            "source": "TERMINAL",
            "error": "stale"
        }"#;
        let envelope = parse_request(text)?;
        assert_eq!(envelope.kind, RequestKind::GetMotorProperty(JointProperty::Angle));
        assert_eq!(envelope.target, Target::Joint(Joint::LeftElbowY));
        assert_eq!(envelope.source, Source::Network);
        assert!(!envelope.has_error());
        Ok(())
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(parse_request("not json"), Err(BertError::Parse(_))));
        assert!(matches!(parse_request(r#"{"kind": {"type": "FLY"}}"#), Err(BertError::Parse(_))));
    }

    #[test]
    fn port_defaults_and_overrides() {
        let (submit, _rx) = mpsc::channel(1);
        let peripheral = NetworkPeripheral::new(submit, ReplyBus::default());
        assert_eq!(peripheral.port(), DEFAULT_PORT);
        assert_eq!(peripheral.with_port(9999).port(), 9999);
    }

    // ── End to end over a socket ─────────────────────────────────────────────

    async fn start(rate_limit: u32) -> Result<(String, mpsc::Receiver<RequestEnvelope>, ReplyBus), BertError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (submit, hub_rx) = mpsc::channel(16);
        let bus = ReplyBus::default();
        let peripheral = NetworkPeripheral::new(submit, bus.clone()).with_rate_limit(rate_limit);
        tokio::spawn(peripheral.serve(listener));
        Ok((format!("ws://{addr}"), hub_rx, bus))
    }

    fn heartbeat_json() -> String {
        r#"{"kind": {"type": "HEARTBEAT"}}"#.to_string()
    }

    #[tokio::test]
    async fn request_reaches_the_hub_and_reply_reaches_the_client() -> Result<(), Box<dyn std::error::Error>> {
        let (url, mut hub_rx, bus) = start(0).await?;
        let (mut client, _) = connect_async(url.as_str()).await?;

        client.send(Message::Text(heartbeat_json().into())).await?;
        let mut request = timeout(Duration::from_secs(2), hub_rx.recv()).await?.ok_or("hub closed")?;
        assert_eq!(request.kind, RequestKind::Heartbeat);
        assert_eq!(request.source, Source::Network);

        request.text = Some("I'm alive".into());
        bus.deliver(request)?;

        let reply = loop {
            match timeout(Duration::from_secs(2), client.next()).await?.ok_or("socket closed")?? {
                Message::Text(text) => break serde_json::from_str::<RequestEnvelope>(text.as_str())?,
                _ => continue,
            }
        };
        assert_eq!(reply.reply_text(), "I'm alive");
        Ok(())
    }

    #[tokio::test]
    async fn bad_message_is_answered_on_the_connection_only() -> Result<(), Box<dyn std::error::Error>> {
        let (url, mut hub_rx, _bus) = start(0).await?;
        let (mut client, _) = connect_async(url.as_str()).await?;

        client.send(Message::Text("{oops".into())).await?;
        let reply = loop {
            match timeout(Duration::from_secs(2), client.next()).await?.ok_or("socket closed")?? {
                Message::Text(text) => break serde_json::from_str::<RequestEnvelope>(text.as_str())?,
                _ => continue,
            }
        };
        assert!(reply.has_error());
        assert!(timeout(Duration::from_millis(100), hub_rx.recv()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn flooding_client_is_throttled() -> Result<(), Box<dyn std::error::Error>> {
        let (url, mut hub_rx, _bus) = start(1).await?;
        let (mut client, _) = connect_async(url.as_str()).await?;

        for _ in 0..3 {
            client.send(Message::Text(heartbeat_json().into())).await?;
        }

        let reply = loop {
            match timeout(Duration::from_secs(2), client.next()).await?.ok_or("socket closed")?? {
                Message::Text(text) => break serde_json::from_str::<RequestEnvelope>(text.as_str())?,
                _ => continue,
            }
        };
        assert_eq!(reply.reply_text(), "Too many requests, please slow down");

        // Exactly one request got through.
        assert!(timeout(Duration::from_secs(1), hub_rx.recv()).await?.is_some());
        assert!(timeout(Duration::from_millis(100), hub_rx.recv()).await.is_err());
        Ok(())
    }
}
