//! `lapin` implementation of the broker traits.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable as AmqpFieldTable},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::{
    BrokerChannel, BrokerConnection, BrokerConnector, ConnectionOptions, Delivery, DeliveryCallback,
    QueueInfo, SubscriptionEndedCallback,
};
use crate::error::{MessagingError, Result};
use crate::message::{FieldTable, FieldValue, MessageProperties};
use crate::topology::{ExchangeKind, ExchangeSpec, QueueSpec};

const REPLY_SUCCESS: u16 = 200;

/// Opens real AMQP connections
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn BrokerConnection>> {
        let mut uri: AMQPUri = options
            .url
            .parse()
            .map_err(|reason: String| MessagingError::InvalidConnectionString { reason })?;
        uri.query.heartbeat = Some(options.heartbeat_seconds);
        uri.query.connection_timeout = Some(options.connection_timeout_ms);
        uri.query.channel_max = Some(options.channel_max);

        let properties =
            ConnectionProperties::default().with_connection_name(options.connection_name.clone().into());
        let connection = Connection::connect_uri(uri, properties).await?;

        let name = options.connection_name.clone();
        connection.on_error(move |err| {
            error!("Connection {} reported an error: {}", name, err);
        });

        debug!("AMQP connection {} established", options.connection_name);
        Ok(Arc::new(AmqpConnection {
            name: options.connection_name.clone(),
            inner: connection,
        }))
    }
}

pub struct AmqpConnection {
    name: String,
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    // lapin tracks connection.blocked/unblocked in the status but has no callback for it
    fn is_blocked(&self) -> bool {
        self.inner.status().blocked()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.inner.create_channel().await?;
        debug!("Opened channel {} on {}", channel.id(), self.name);
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> Result<()> {
        if self.inner.status().connected() {
            self.inner.close(REPLY_SUCCESS, "OK").await?;
        }
        Ok(())
    }
}

pub struct AmqpChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u16 {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn exchange_declare(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.inner
            .exchange_declare(
                &exchange.name,
                exchange_kind(exchange.kind),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    ..Default::default()
                },
                to_amqp_table(&exchange.arguments),
            )
            .await?;
        Ok(())
    }

    async fn queue_declare(&self, queue: &QueueSpec) -> Result<QueueInfo> {
        let declared = self
            .inner
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..Default::default()
                },
                to_amqp_table(&queue.arguments),
            )
            .await?;

        Ok(QueueInfo {
            name: declared.name().as_str().to_string(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                AmqpFieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<()> {
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    ..Default::default()
                },
                body,
                to_basic_properties(properties),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        on_delivery: DeliveryCallback,
        on_ended: SubscriptionEndedCallback,
    ) -> Result<String> {
        let mut consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                AmqpFieldTable::default(),
            )
            .await?;
        let tag = consumer.tag().as_str().to_string();

        let queue_name = queue.to_string();
        let task_tag = tag.clone();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            delivery_tag: delivery.delivery_tag,
                            exchange: delivery.exchange.as_str().to_string(),
                            routing_key: delivery.routing_key.as_str().to_string(),
                            redelivered: delivery.redelivered,
                            properties: from_basic_properties(&delivery.properties),
                            body: delivery.data,
                        };
                        tokio::spawn(on_delivery(delivery));
                    }
                    Err(err) => {
                        warn!("Consumer {} on queue {} stopped: {}", task_tag, queue_name, err);
                        break;
                    }
                }
            }
            debug!("Delivery stream for consumer {} on queue {} ended", task_tag, queue_name);
            on_ended(&task_tag);
        });

        Ok(tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.inner.status().connected() {
            self.inner.close(REPLY_SUCCESS, "OK").await?;
        }
        Ok(())
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.as_str().into());
    }
    if let Some(delivery_mode) = properties.delivery_mode {
        basic = basic.with_delivery_mode(delivery_mode);
    }
    if let Some(kind) = &properties.kind {
        basic = basic.with_type(kind.as_str().into());
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(message_id.as_str().into());
    }
    if !properties.headers.is_empty() {
        basic = basic.with_headers(to_amqp_table(&properties.headers));
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: basic.content_type().as_ref().map(|value| value.as_str().to_string()),
        delivery_mode: *basic.delivery_mode(),
        kind: basic.kind().as_ref().map(|value| value.as_str().to_string()),
        timestamp: *basic.timestamp(),
        message_id: basic.message_id().as_ref().map(|value| value.as_str().to_string()),
        headers: basic.headers().as_ref().map(from_amqp_table).unwrap_or_default(),
    }
}

fn to_amqp_table(table: &FieldTable) -> AmqpFieldTable {
    let mut amqp = AmqpFieldTable::default();
    for (key, value) in table {
        amqp.insert(key.as_str().into(), to_amqp_value(value));
    }
    amqp
}

fn to_amqp_value(value: &FieldValue) -> AMQPValue {
    match value {
        FieldValue::Void => AMQPValue::Void,
        FieldValue::Bool(value) => AMQPValue::Boolean(*value),
        // x-message-ttl and friends must stay 32-bit for the broker to accept them
        FieldValue::Int(value) => match i32::try_from(*value) {
            Ok(small) => AMQPValue::LongInt(small),
            Err(_) => AMQPValue::LongLongInt(*value),
        },
        FieldValue::Float(value) => AMQPValue::Double(*value),
        FieldValue::String(value) => AMQPValue::LongString(value.as_str().into()),
        FieldValue::Bytes(value) => AMQPValue::ByteArray(value.clone().into()),
    }
}

fn from_amqp_table(table: &AmqpFieldTable) -> FieldTable {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), from_amqp_value(value)))
        .collect()
}

fn from_amqp_value(value: &AMQPValue) -> FieldValue {
    match value {
        AMQPValue::Boolean(value) => FieldValue::Bool(*value),
        AMQPValue::ShortShortInt(value) => FieldValue::Int(i64::from(*value)),
        AMQPValue::ShortShortUInt(value) => FieldValue::Int(i64::from(*value)),
        AMQPValue::ShortInt(value) => FieldValue::Int(i64::from(*value)),
        AMQPValue::ShortUInt(value) => FieldValue::Int(i64::from(*value)),
        AMQPValue::LongInt(value) => FieldValue::Int(i64::from(*value)),
        AMQPValue::LongUInt(value) => FieldValue::Int(i64::from(*value)),
        AMQPValue::LongLongInt(value) => FieldValue::Int(*value),
        AMQPValue::Timestamp(value) => FieldValue::Int(i64::try_from(*value).unwrap_or(i64::MAX)),
        AMQPValue::Float(value) => FieldValue::Float(f64::from(*value)),
        AMQPValue::Double(value) => FieldValue::Float(*value),
        AMQPValue::ShortString(value) => FieldValue::String(value.as_str().to_string()),
        AMQPValue::LongString(value) => match std::str::from_utf8(value.as_bytes()) {
            Ok(text) => FieldValue::String(text.to_string()),
            Err(_) => FieldValue::Bytes(value.as_bytes().to_vec()),
        },
        AMQPValue::ByteArray(value) => FieldValue::Bytes(value.as_slice().to_vec()),
        _ => FieldValue::Void,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{headers, retry_count};

    #[test]
    fn test_properties_survive_conversion() {
        let properties = MessageProperties {
            content_type: Some("application/json".into()),
            delivery_mode: Some(2),
            kind: Some("OrderPaymentRequestedEvent".into()),
            timestamp: Some(1_700_000_000),
            message_id: Some("0190f1c2-0000-7000-8000-000000000001".into()),
            headers: FieldTable::new(),
        }
        .with_header(headers::EVENT_TYPE, "OrderPaymentRequestedEvent")
        .with_header(headers::RETRY_COUNT, 2i64)
        .with_header("large", 10_000_000_000i64)
        .with_header("flag", true);

        let basic = to_basic_properties(&properties);
        assert_eq!(basic.kind().as_ref().map(|v| v.as_str()), Some("OrderPaymentRequestedEvent"));
        assert_eq!(*basic.delivery_mode(), Some(2));

        assert_eq!(from_basic_properties(&basic), properties);
    }

    #[test]
    fn test_small_integers_are_32_bit() {
        assert_eq!(to_amqp_value(&FieldValue::Int(300_000)), AMQPValue::LongInt(300_000));
        assert_eq!(
            to_amqp_value(&FieldValue::Int(i64::from(i32::MAX) + 1)),
            AMQPValue::LongLongInt(i64::from(i32::MAX) + 1)
        );
    }

    #[test]
    fn test_inbound_retry_header_encodings() {
        let decode = |value: AMQPValue| {
            let mut table = AmqpFieldTable::default();
            table.insert(headers::RETRY_COUNT.into(), value);
            retry_count(&from_amqp_table(&table))
        };

        assert_eq!(decode(AMQPValue::ShortShortUInt(4)), 4);
        assert_eq!(decode(AMQPValue::LongLongInt(7)), 7);
        assert_eq!(decode(AMQPValue::LongString("5".into())), 5);
        assert_eq!(decode(AMQPValue::ByteArray(b"6".to_vec().into())), 6);
        assert_eq!(decode(AMQPValue::LongString(vec![0xff_u8, 0xfe].into())), 0);
        assert_eq!(decode(AMQPValue::Boolean(true)), 0);
    }

    #[test]
    fn test_exchange_kind_mapping() {
        assert_eq!(exchange_kind(ExchangeKind::Topic), lapin::ExchangeKind::Topic);
        assert_eq!(exchange_kind(ExchangeKind::Direct), lapin::ExchangeKind::Direct);
    }
}
