//! In-process change feed over a tokio broadcast channel

use crate::error::{DirectoryError, Result};
use crate::feed::{ChangeFeed, ChangePublisher, FeedSubscription};
use crate::types::ChangeEvent;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Change feed living entirely inside the process
///
/// Events published here reach every live subscription. The feed can be told
/// to drop all subscriptions and to refuse new ones, which is how local runs
/// and tests exercise disconnection.
pub struct ChannelChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
    session: Mutex<CancellationToken>,
    available: AtomicBool,
    subscriptions: AtomicU64,
}

impl ChannelChangeFeed {
    /// Create a feed whose subscribers buffer up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            session: Mutex::new(CancellationToken::new()),
            available: AtomicBool::new(true),
            subscriptions: AtomicU64::new(0),
        }
    }

    /// Deliver an event, returning how many subscribers received it
    pub fn publish(&self, event: ChangeEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                debug!(
                    "No subscribers for change of provider '{}'",
                    event.provider_id
                );
                0
            }
        }
    }

    /// End every live subscription
    pub fn disconnect_all(&self) {
        if let Ok(mut session) = self.session.lock() {
            session.cancel();
            *session = CancellationToken::new();
            info!("Change feed disconnected all subscribers");
        }
    }

    /// Control whether new subscriptions succeed
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Total number of successful subscriptions
    pub fn subscription_count(&self) -> u64 {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Number of subscribers currently attached
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChannelChangeFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ChangeFeed for ChannelChangeFeed {
    async fn subscribe(&self) -> Result<FeedSubscription> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(DirectoryError::FeedDisconnected {
                message: "in-process feed is not accepting subscriptions".to_string(),
            }
            .into());
        }

        let closed = self
            .session
            .lock()
            .map_err(|_| DirectoryError::InternalError {
                message: "Failed to acquire feed session lock".to_string(),
            })?
            .clone();

        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(FeedSubscription::from_broadcast(self.sender.subscribe()).with_close_signal(closed))
    }

    fn describe(&self) -> String {
        "in-process channel".to_string()
    }
}

#[async_trait]
impl ChangePublisher for ChannelChangeFeed {
    async fn publish_change(&self, event: ChangeEvent) -> Result<()> {
        self.publish(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedSignal;
    use crate::types::ChangeKind;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let feed = ChannelChangeFeed::new(8);
        let mut first = feed.subscribe().await.unwrap();
        let mut second = feed.subscribe().await.unwrap();

        assert_eq!(feed.publish(ChangeEvent::new("p1", ChangeKind::Insert)), 2);

        for subscription in [&mut first, &mut second] {
            assert!(matches!(
                subscription.next().await,
                Some(FeedSignal::Changed(event)) if event.provider_id == "p1"
            ));
        }
        assert_eq!(feed.subscription_count(), 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let feed = ChannelChangeFeed::new(8);
        assert_eq!(feed.publish(ChangeEvent::new("p1", ChangeKind::Update)), 0);
    }

    #[tokio::test]
    async fn test_disconnect_ends_only_existing_subscriptions() {
        let feed = ChannelChangeFeed::new(8);
        let mut old = feed.subscribe().await.unwrap();

        feed.disconnect_all();
        assert_eq!(old.next().await, None);

        let mut fresh = feed.subscribe().await.unwrap();
        feed.publish(ChangeEvent::new("p2", ChangeKind::Update));
        assert!(matches!(fresh.next().await, Some(FeedSignal::Changed(_))));
    }

    #[tokio::test]
    async fn test_unavailable_feed_refuses_subscriptions() {
        let feed = ChannelChangeFeed::new(8);
        feed.set_available(false);

        let err = feed.subscribe().await.unwrap_err();
        assert!(DirectoryError::is_feed_disconnected(&err));

        feed.set_available(true);
        assert!(feed.subscribe().await.is_ok());
    }
}
