//! Change feed abstraction and adapters
//!
//! A change feed delivers `ChangeEvent`s for the provider table. Delivery is
//! at-least-once with no ordering across providers, and a subscription may end
//! at any time. An ended subscription means the channel disconnected and the
//! caller has to subscribe again.

pub mod amqp;
pub mod channel;
pub mod connection;
pub mod messages;

pub use amqp::{AmqpChangeFeed, AmqpChangePublisher, AmqpFeedConfig};
pub use channel::ChannelChangeFeed;
pub use connection::{AmqpConfig, AmqpConnection};
pub use messages::{ChangeMessage, MessageUtils};

use crate::error::Result;
use crate::types::ChangeEvent;
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Trait for sources of provider change notifications
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a new subscription
    ///
    /// Fails with `DirectoryError::FeedDisconnected` when the channel cannot
    /// be reached.
    async fn subscribe(&self) -> Result<FeedSubscription>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Trait for announcing provider changes on a feed
#[async_trait]
pub trait ChangePublisher: Send + Sync {
    async fn publish_change(&self, event: ChangeEvent) -> Result<()>;
}

/// What a subscription yields
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    /// A provider record changed
    Changed(ChangeEvent),
    /// The subscriber fell behind and this many events were dropped
    Lagged(u64),
}

enum SignalSource {
    Broadcast(BroadcastStream<ChangeEvent>),
    Channel(mpsc::Receiver<ChangeEvent>),
}

/// A live subscription to a change feed
pub struct FeedSubscription {
    source: SignalSource,
    closed: CancellationToken,
    _guard: Option<DropGuard>,
}

impl FeedSubscription {
    /// Subscription fed by a broadcast receiver
    pub fn from_broadcast(receiver: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            source: SignalSource::Broadcast(BroadcastStream::new(receiver)),
            closed: CancellationToken::new(),
            _guard: None,
        }
    }

    /// Subscription fed by an mpsc receiver
    pub fn from_channel(receiver: mpsc::Receiver<ChangeEvent>) -> Self {
        Self {
            source: SignalSource::Channel(receiver),
            closed: CancellationToken::new(),
            _guard: None,
        }
    }

    /// End the subscription as soon as `closed` is cancelled
    pub fn with_close_signal(mut self, closed: CancellationToken) -> Self {
        self.closed = closed;
        self
    }

    /// Keep `guard` alive for as long as the subscription exists
    pub fn with_guard(mut self, guard: DropGuard) -> Self {
        self._guard = Some(guard);
        self
    }

    /// Wait for the next signal; `None` means the feed disconnected
    pub async fn next(&mut self) -> Option<FeedSignal> {
        if self.closed.is_cancelled() {
            return None;
        }

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            signal = Self::receive(&mut self.source) => signal,
        }
    }

    async fn receive(source: &mut SignalSource) -> Option<FeedSignal> {
        match source {
            SignalSource::Broadcast(stream) => match stream.next().await? {
                Ok(event) => Some(FeedSignal::Changed(event)),
                Err(BroadcastStreamRecvError::Lagged(missed)) => Some(FeedSignal::Lagged(missed)),
            },
            SignalSource::Channel(receiver) => receiver.recv().await.map(FeedSignal::Changed),
        }
    }
}

impl std::fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match self.source {
            SignalSource::Broadcast(_) => "broadcast",
            SignalSource::Channel(_) => "channel",
        };
        f.debug_struct("FeedSubscription")
            .field("source", &source)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}
