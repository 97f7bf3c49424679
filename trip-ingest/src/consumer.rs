use std::collections::HashMap;
use std::time::Duration;

use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    message::BorrowedMessage,
    ClientConfig, Message, Offset, TopicPartitionList,
};
use tracing::{debug, warn};

use crate::codec::StreamEntry;
use crate::config::KafkaConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

/// Reads the ingestion topic in batches.
///
/// Offsets are only stored through `StreamBatch::commit`, so a batch that was not
/// handled is delivered again after a restart.
pub struct StreamBatchConsumer {
    consumer: StreamConsumer,
    topic: String,
}

/// Entries received together, plus the offsets to store once they are handled.
#[derive(Default)]
pub struct StreamBatch {
    pub entries: Vec<StreamEntry>,
    // Next offset to read per partition.
    next_offsets: HashMap<i32, i64>,
}

impl StreamBatch {
    fn push(&mut self, entry: StreamEntry, partition: i32, offset: i64) {
        self.entries.push(entry);
        let next = self.next_offsets.entry(partition).or_insert(offset + 1);
        *next = (*next).max(offset + 1);
    }

    /// One element per partition; the list must not repeat a partition or later
    /// elements would overwrite the stored position.
    fn offsets(&self, topic: &str) -> Result<TopicPartitionList, KafkaError> {
        let mut list = TopicPartitionList::with_capacity(self.next_offsets.len());
        for (partition, next) in &self.next_offsets {
            list.add_partition_offset(topic, *partition, Offset::Offset(*next))?;
        }
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hand the entries over to a handler, keeping the offsets for `commit`.
    pub fn take_entries(&mut self) -> Vec<StreamEntry> {
        std::mem::take(&mut self.entries)
    }
}

impl StreamBatchConsumer {
    pub fn new(config: &KafkaConfig) -> Result<Self, ConsumerError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", &config.kafka_consumer_offset_reset)
            .set("enable.auto.offset.store", "false");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[config.kafka_consumer_topic.as_str()])?;

        Ok(Self {
            consumer,
            topic: config.kafka_consumer_topic.clone(),
        })
    }

    /// Collect up to `max_size` entries, waiting at most `max_wait` after the first one.
    ///
    /// Returns an empty batch when nothing arrives within `max_wait`, so callers get to
    /// report liveness while the topic is idle.
    pub async fn next_batch(
        &self,
        max_size: usize,
        max_wait: Duration,
    ) -> Result<StreamBatch, ConsumerError> {
        let mut batch = StreamBatch {
            entries: Vec::with_capacity(max_size),
            ..Default::default()
        };

        match tokio::time::timeout(max_wait, self.consumer.recv()).await {
            Ok(first) => push(&mut batch, &first?),
            Err(_) => return Ok(batch),
        }

        let deadline = tokio::time::Instant::now() + max_wait;
        while batch.len() < max_size {
            match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Ok(Ok(message)) => push(&mut batch, &message),
                Ok(Err(e)) => {
                    // Keep what we have, the error resurfaces on the next recv if persistent.
                    warn!("error while filling batch: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(batch)
    }

    /// Store the offsets of a handled batch; they are committed by the consumer in the background.
    pub fn commit(&self, batch: StreamBatch) -> Result<(), ConsumerError> {
        if batch.next_offsets.is_empty() {
            return Ok(());
        }
        self.consumer.store_offsets(&batch.offsets(&self.topic)?)?;
        Ok(())
    }
}

fn push(batch: &mut StreamBatch, message: &BorrowedMessage<'_>) {
    let partition_key = message
        .key()
        .map(|key| String::from_utf8_lossy(key).into_owned());
    // Non-UTF-8 payloads are left empty and rejected by the codec as malformed.
    let data = message
        .payload()
        .and_then(|payload| std::str::from_utf8(payload).ok())
        .map(str::to_owned);

    batch.push(
        StreamEntry {
            partition_key,
            data,
        },
        message.partition(),
        message.offset(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str) -> StreamEntry {
        StreamEntry::encode(key, "{}")
    }

    #[test]
    fn test_offsets_hold_one_element_per_partition() {
        let mut batch = StreamBatch::default();
        batch.push(entry("T1"), 0, 10);
        batch.push(entry("T2"), 0, 11);
        batch.push(entry("T3"), 0, 12);

        let list = batch.offsets("trip_events").unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(list.count(), 1);
        assert_eq!(
            list.find_partition("trip_events", 0).unwrap().offset(),
            Offset::Offset(13)
        );
    }

    #[test]
    fn test_offsets_track_the_highest_message_of_each_partition() {
        let mut batch = StreamBatch::default();
        batch.push(entry("T1"), 0, 5);
        batch.push(entry("T2"), 1, 40);
        batch.push(entry("T3"), 1, 39);
        batch.push(entry("T4"), 0, 6);

        let list = batch.offsets("trip_events").unwrap();

        assert_eq!(list.count(), 2);
        assert_eq!(
            list.find_partition("trip_events", 0).unwrap().offset(),
            Offset::Offset(7)
        );
        assert_eq!(
            list.find_partition("trip_events", 1).unwrap().offset(),
            Offset::Offset(41)
        );
    }

    #[test]
    fn test_taking_entries_keeps_the_offsets() {
        let mut batch = StreamBatch::default();
        assert!(batch.is_empty());
        assert_eq!(batch.offsets("trip_events").unwrap().count(), 0);

        batch.push(entry("T1"), 2, 0);
        let entries = batch.take_entries();

        assert_eq!(entries, vec![entry("T1")]);
        assert!(batch.is_empty());
        assert_eq!(
            batch.offsets("trip_events").unwrap().find_partition("trip_events", 2).unwrap().offset(),
            Offset::Offset(1)
        );
    }
}
