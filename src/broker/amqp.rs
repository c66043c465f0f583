//! AMQP (RabbitMQ) transport.
//!
//! One durable topic exchange; publisher confirms on the publishing channel;
//! each consumer gets its own channel with `basic_qos(prefetch)` and manual
//! acknowledgement.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::config::BrokerConfig;

use super::{
    BrokerError, InboundMessage, MessagePublisher, MessageSource, OutboundMessage,
    CAUSATION_ID_HEADER,
};

const CONSUMER_TAG: &str = "account-service";

/// RabbitMQ-backed broker
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    exchange: String,
}

impl AmqpBroker {
    /// Connect, enable publisher confirms and declare the exchange
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Failed to connect: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Failed to create channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Failed to enable confirms: {}", e)))?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Failed to declare exchange: {}", e)))?;

        tracing::info!(exchange = %config.exchange, "Connected to AMQP");

        Ok(Self {
            connection,
            channel,
            exchange: config.exchange.clone(),
        })
    }

    /// Declare a durable queue and bind it with the given patterns
    pub async fn declare_queue(&self, queue: &str, bindings: &[&str]) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to declare queue: {}", e)))?;

        for binding in bindings {
            self.channel
                .queue_bind(
                    queue,
                    &self.exchange,
                    binding,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Consume(format!("Failed to bind queue: {}", e)))?;

            tracing::info!(queue = %queue, binding = %binding, "Bound queue to exchange");
        }
        Ok(())
    }

    /// Start consuming a queue on a dedicated channel
    pub async fn source(&self, queue: &str, prefetch: u16) -> Result<AmqpSource, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Failed to create channel: {}", e)))?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to set prefetch: {}", e)))?;

        let consumer = channel
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to start consumer: {}", e)))?;

        Ok(AmqpSource {
            channel,
            consumer: Mutex::new(consumer),
        })
    }
}

#[async_trait]
impl MessagePublisher for AmqpBroker {
    async fn publish(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        let mut headers = FieldTable::default();
        headers.insert(
            CAUSATION_ID_HEADER.into(),
            AMQPValue::LongString(message.causation_id.to_string().into()),
        );

        let properties = BasicProperties::default()
            .with_message_id(message.message_id.to_string().into())
            .with_correlation_id(message.correlation_id.to_string().into())
            .with_content_type(message.content_type.into())
            .with_delivery_mode(if message.persistent { 2 } else { 1 })
            .with_headers(headers);

        let confirm = self
            .channel
            .basic_publish(
                &self.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?;

        let confirmation = confirm
            .await
            .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {}", e)))?;

        if confirmation.is_nack() {
            return Err(BrokerError::Publish("Broker nacked the message".to_string()));
        }

        tracing::debug!(
            exchange = %self.exchange,
            routing_key = %message.routing_key,
            message_id = %message.message_id,
            "Published message"
        );
        Ok(())
    }
}

/// Consumer on one queue
pub struct AmqpSource {
    channel: Channel,
    consumer: Mutex<lapin::Consumer>,
}

fn header_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}

#[async_trait]
impl MessageSource for AmqpSource {
    async fn receive(&self) -> Result<Option<InboundMessage>, BrokerError> {
        let mut consumer = self.consumer.lock().await;

        let delivery = match consumer.next().await {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => return Err(BrokerError::Consume(format!("Delivery error: {}", e))),
            None => return Ok(None),
        };

        let properties = &delivery.properties;
        let headers: HashMap<String, String> = properties
            .headers()
            .as_ref()
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .filter_map(|(k, v)| header_text(v).map(|v| (k.as_str().to_string(), v)))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(InboundMessage {
            delivery_tag: delivery.delivery_tag,
            message_id: properties.message_id().as_ref().map(|s| s.as_str().to_string()),
            routing_key: delivery.routing_key.as_str().to_string(),
            correlation_id: properties
                .correlation_id()
                .as_ref()
                .map(|s| s.as_str().to_string()),
            headers,
            body: delivery.data.clone(),
            redelivered: delivery.redelivered,
        }))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to ack: {}", e)))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to nack: {}", e)))
    }
}
