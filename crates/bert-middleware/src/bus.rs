//! Reply routing to the peripherals.
//!
//! Uses [`tokio::sync::broadcast`] channels so every connection of a
//! peripheral (several tablet sessions, say) sees every reply addressed to
//! it without one slow connection blocking the others.
//!
//! # Lanes
//!
//! One lane per peripheral [`Source`]:
//!
//! | Source | Listener |
//! |---|---|
//! | [`Source::Network`] | every WebSocket connection of the network peripheral |
//! | [`Source::Terminal`] | the local console |
//!
//! Replies whose source is not a peripheral have no lane;
//! [`ReplyBus::deliver`] reports them as routing errors.

use bert_types::{BertError, RequestEnvelope, Source};
use tokio::sync::broadcast;
use tokio::sync::mpsc;

/// Default channel capacity (replies buffered before old ones are dropped
/// for a slow listener).
const DEFAULT_CAPACITY: usize = 64;

/// Where peripherals hand new requests to the hub.
pub type Submitter = mpsc::Sender<RequestEnvelope>;

/// Shared reply bus.  Clones share the same underlying channels.
#[derive(Clone, Debug)]
pub struct ReplyBus {
    network: broadcast::Sender<RequestEnvelope>,
    terminal: broadcast::Sender<RequestEnvelope>,
}

impl ReplyBus {
    /// Create a bus whose lanes each buffer `capacity` replies.
    pub fn new(capacity: usize) -> Self {
        let (network, _) = broadcast::channel(capacity);
        let (terminal, _) = broadcast::channel(capacity);
        Self { network, terminal }
    }

    fn lane(&self, source: Source) -> Result<&broadcast::Sender<RequestEnvelope>, BertError> {
        match source {
            Source::Network => Ok(&self.network),
            Source::Terminal => Ok(&self.terminal),
            other => Err(BertError::Routing(format!("{other} is not a peripheral"))),
        }
    }

    /// Deliver `envelope` to the peripheral named by its source.
    ///
    /// Returns the number of listeners that were handed the reply.
    pub fn deliver(&self, envelope: RequestEnvelope) -> Result<usize, BertError> {
        let source = envelope.source;
        self.lane(source)?
            .send(envelope)
            .map_err(|_| BertError::Channel(format!("no listener on the {source} peripheral")))
    }

    /// Deliver a copy of `envelope` to every peripheral, re-addressed to
    /// each.  Peripherals with no listener are skipped.  Returns how many
    /// peripherals received it.
    pub fn announce(&self, envelope: &RequestEnvelope) -> usize {
        [Source::Network, Source::Terminal]
            .into_iter()
            .filter(|source| {
                let mut copy = envelope.clone();
                copy.source = *source;
                self.deliver(copy).is_ok()
            })
            .count()
    }

    /// Listen for replies addressed to `source`.
    pub fn subscribe(&self, source: Source) -> Result<ReplyReceiver, BertError> {
        Ok(ReplyReceiver { source, receiver: self.lane(source)?.subscribe() })
    }
}

impl Default for ReplyBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to one peripheral's lane.
///
/// Obtained via [`ReplyBus::subscribe`].
pub struct ReplyReceiver {
    source: Source,
    receiver: broadcast::Receiver<RequestEnvelope>,
}

impl ReplyReceiver {
    /// Wait for the next reply.
    ///
    /// * `Err(RecvError::Lagged(n))` – the listener fell behind and `n`
    ///   replies were dropped.
    /// * `Err(RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<RequestEnvelope, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    pub fn source(&self) -> Source {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bert_types::{RequestKind, Target};

    use super::*;

    fn reply(source: Source, text: &str) -> RequestEnvelope {
        let mut envelope = RequestEnvelope::new(RequestKind::Heartbeat, Target::None).with_source(source);
        envelope.text = Some(text.to_string());
        envelope
    }

    #[tokio::test]
    async fn reply_reaches_its_own_peripheral_only() -> Result<(), Box<dyn std::error::Error>> {
        let bus = ReplyBus::default();
        let mut network = bus.subscribe(Source::Network)?;
        let mut terminal = bus.subscribe(Source::Terminal)?;

        bus.deliver(reply(Source::Terminal, "hello"))?;

        assert_eq!(terminal.recv().await?.text.as_deref(), Some("hello"));
        let nothing = tokio::time::timeout(Duration::from_millis(50), network.recv()).await;
        assert!(nothing.is_err(), "network must not see a terminal reply");
        Ok(())
    }

    #[tokio::test]
    async fn every_connection_of_a_peripheral_sees_the_reply() -> Result<(), Box<dyn std::error::Error>> {
        let bus = ReplyBus::default();
        let mut first = bus.subscribe(Source::Network)?;
        let mut second = bus.subscribe(Source::Network)?;

        let sent = reply(Source::Network, "At your command");
        assert_eq!(bus.deliver(sent.clone())?, 2);
        assert_eq!(first.recv().await?.id, sent.id);
        assert_eq!(second.recv().await?.id, sent.id);
        Ok(())
    }

    #[test]
    fn non_peripheral_sources_have_no_lane() {
        let bus = ReplyBus::default();
        assert!(matches!(bus.deliver(reply(Source::Sink, "x")), Err(BertError::Routing(_))));
        assert!(bus.subscribe(Source::Motor).is_err());
    }

    #[test]
    fn delivery_without_listener_is_a_channel_error() {
        let bus = ReplyBus::default();
        assert!(matches!(bus.deliver(reply(Source::Network, "x")), Err(BertError::Channel(_))));
    }

    #[tokio::test]
    async fn announce_reaches_every_listening_peripheral() -> Result<(), Box<dyn std::error::Error>> {
        let bus = ReplyBus::default();
        let mut terminal = bus.subscribe(Source::Terminal)?;

        let count = bus.announce(&reply(Source::Internal, "Bert is ready"));
        assert_eq!(count, 1);
        let received = terminal.recv().await?;
        assert_eq!(received.source, Source::Terminal);
        assert_eq!(received.text.as_deref(), Some("Bert is ready"));
        Ok(())
    }

    #[tokio::test]
    async fn slow_listener_lags_instead_of_blocking() -> Result<(), Box<dyn std::error::Error>> {
        let bus = ReplyBus::new(4);
        let mut slow = bus.subscribe(Source::Terminal)?;
        for i in 0..20 {
            let _ = bus.deliver(reply(Source::Terminal, &i.to_string()));
        }
        let result = slow.recv().await;
        assert!(matches!(result, Err(broadcast::error::RecvError::Lagged(_))));
        Ok(())
    }
}
