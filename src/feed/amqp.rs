//! AMQP change feed and publisher
//!
//! Each subscription opens its own connection and channel, binds an exclusive
//! server-named queue to the change exchange and forwards parsed messages to
//! the subscriber. When the broker connection or channel goes away the
//! subscription ends, and dropping the subscription closes both.

use crate::error::{DirectoryError, Result};
use crate::feed::connection::{AmqpConfig, AmqpConnection};
use crate::feed::messages::{ChangeMessage, MessageUtils, CHANGE_EXCHANGE, PROVIDER_BINDING_KEY};
use crate::feed::{ChangeFeed, ChangePublisher, FeedSubscription};
use crate::metrics::MetricsCollector;
use crate::types::ChangeEvent;
use crate::utils::generate_consumer_tag;
use amqprs::{
    channel::{
        BasicAckArguments, BasicConsumeArguments, BasicPublishArguments, Channel,
        ExchangeDeclareArguments, QueueBindArguments, QueueDeclareArguments,
    },
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Settings for the AMQP change feed
#[derive(Debug, Clone)]
pub struct AmqpFeedConfig {
    pub connection: AmqpConfig,
    pub exchange: String,
    pub binding_key: String,
    /// How often the connection and channel are checked for liveness
    pub liveness_interval: Duration,
    /// Events buffered per subscription before the consumer waits
    pub buffer: usize,
}

impl Default for AmqpFeedConfig {
    fn default() -> Self {
        Self {
            connection: AmqpConfig::default(),
            exchange: CHANGE_EXCHANGE.to_string(),
            binding_key: PROVIDER_BINDING_KEY.to_string(),
            liveness_interval: Duration::from_secs(1),
            buffer: 1024,
        }
    }
}

async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<()> {
    let mut args = ExchangeDeclareArguments::new(exchange, "topic");
    args.durable = true;

    channel.exchange_declare(args).await.map_err(|e| {
        DirectoryError::FeedDisconnected {
            message: format!("Failed to declare exchange '{}': {}", exchange, e),
        }
        .into()
    })
}

/// Change feed backed by a topic exchange
pub struct AmqpChangeFeed {
    config: AmqpFeedConfig,
    metrics: Option<Arc<MetricsCollector>>,
}

impl AmqpChangeFeed {
    pub fn new(config: AmqpFeedConfig) -> Self {
        Self {
            config,
            metrics: None,
        }
    }

    /// Count rejected messages in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn bind_queue(&self, channel: &Channel) -> Result<String> {
        declare_exchange(channel, &self.config.exchange).await?;

        let (queue_name, _, _) = channel
            .queue_declare(QueueDeclareArguments::exclusive_server_named())
            .await
            .map_err(|e| DirectoryError::FeedDisconnected {
                message: format!("Failed to declare subscription queue: {}", e),
            })?
            .ok_or_else(|| DirectoryError::FeedDisconnected {
                message: "Broker did not return a queue name".to_string(),
            })?;

        let args = QueueBindArguments::new(
            &queue_name,
            &self.config.exchange,
            &self.config.binding_key,
        );
        channel
            .queue_bind(args)
            .await
            .map_err(|e| DirectoryError::FeedDisconnected {
                message: format!("Failed to bind queue '{}': {}", queue_name, e),
            })?;

        Ok(queue_name)
    }
}

#[async_trait]
impl ChangeFeed for AmqpChangeFeed {
    async fn subscribe(&self) -> Result<FeedSubscription> {
        let connection = AmqpConnection::new(self.config.connection.clone()).await?;

        let channel = connection
            .connection()
            .open_channel(None)
            .await
            .map_err(|e| DirectoryError::FeedDisconnected {
                message: format!("Failed to open channel: {}", e),
            })?;

        let queue_name = self.bind_queue(&channel).await?;

        let (sender, receiver) = mpsc::channel(self.config.buffer.max(1));
        let consumer_tag = generate_consumer_tag("directory");
        let consumer = ChangeMessageConsumer {
            sender,
            metrics: self.metrics.clone(),
        };

        channel
            .basic_consume(consumer, BasicConsumeArguments::new(&queue_name, &consumer_tag))
            .await
            .map_err(|e| DirectoryError::FeedDisconnected {
                message: format!("Failed to start consuming: {}", e),
            })?;

        info!(
            "Subscribed to '{}' with binding '{}' on queue {}",
            self.config.exchange, self.config.binding_key, queue_name
        );

        let closed = CancellationToken::new();
        tokio::spawn(watch_liveness(
            connection,
            channel,
            closed.clone(),
            self.config.liveness_interval,
        ));

        Ok(FeedSubscription::from_channel(receiver)
            .with_close_signal(closed.clone())
            .with_guard(closed.drop_guard()))
    }

    fn describe(&self) -> String {
        format!(
            "amqp://{}:{}{} exchange '{}'",
            self.config.connection.host,
            self.config.connection.port,
            self.config.connection.vhost,
            self.config.exchange
        )
    }
}

/// Ends the subscription when the broker goes away, closes it when the
/// subscription goes away
async fn watch_liveness(
    connection: AmqpConnection,
    channel: Channel,
    closed: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = ticker.tick() => {
                if !connection.is_open() || !channel.is_open() {
                    warn!("AMQP change feed lost its connection");
                    closed.cancel();
                    return;
                }
            }
        }
    }

    if let Err(e) = channel.close().await {
        debug!("Closing feed channel: {}", e);
    }
    if let Err(e) = connection.close().await {
        debug!("Closing feed connection: {}", e);
    }
}

/// Parses deliveries into change events for one subscription
struct ChangeMessageConsumer {
    sender: mpsc::Sender<ChangeEvent>,
    metrics: Option<Arc<MetricsCollector>>,
}

#[async_trait]
impl AsyncConsumer for ChangeMessageConsumer {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let delivery_tag = deliver.delivery_tag();

        match MessageUtils::deserialize_change(&content) {
            Ok(message) if message.is_provider_change() => {
                debug!(
                    "Change received - delivery_tag: {}, provider: '{}', kind: {}",
                    delivery_tag, message.provider_id, message.kind
                );
                if self.sender.send(message.into_event()).await.is_err() {
                    debug!("Subscriber gone, dropping delivery {}", delivery_tag);
                }
            }
            Ok(message) => {
                debug!("Ignoring change on table '{}'", message.table);
            }
            Err(e) => {
                warn!(
                    "Rejected change message - delivery_tag: {}, routing_key: '{}', error: {}",
                    delivery_tag,
                    deliver.routing_key(),
                    e
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_invalid_message();
                }
            }
        }

        if let Err(e) = channel
            .basic_ack(BasicAckArguments::new(delivery_tag, false))
            .await
        {
            warn!("Failed to ack delivery {}: {}", delivery_tag, e);
        }
    }
}

/// Publishes provider changes to the change exchange
pub struct AmqpChangePublisher {
    channel: Channel,
    exchange: String,
}

impl AmqpChangePublisher {
    /// Open a channel on `connection` and declare the exchange
    pub async fn new(connection: &AmqpConnection, exchange: impl Into<String>) -> Result<Self> {
        let exchange = exchange.into();
        let channel = connection
            .connection()
            .open_channel(None)
            .await
            .map_err(|e| DirectoryError::FeedDisconnected {
                message: format!("Failed to open channel: {}", e),
            })?;

        declare_exchange(&channel, &exchange).await?;

        Ok(Self { channel, exchange })
    }

    /// Publish an already built message
    pub async fn publish_message(&self, message: &ChangeMessage) -> Result<()> {
        let payload = MessageUtils::serialize_change(message)?;
        let routing_key = message.routing_key();

        let args = BasicPublishArguments::new(&self.exchange, &routing_key);
        let mut properties = BasicProperties::default();
        properties
            .with_content_type("application/json")
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| DirectoryError::FeedDisconnected {
                message: format!("Failed to publish change: {}", e),
            })?;

        debug!(
            "Published {} for provider '{}' to {}",
            message.kind, message.provider_id, self.exchange
        );
        Ok(())
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }
}

#[async_trait]
impl ChangePublisher for AmqpChangePublisher {
    async fn publish_change(&self, event: ChangeEvent) -> Result<()> {
        self.publish_message(&ChangeMessage::from_event(&event))
            .await
    }
}
