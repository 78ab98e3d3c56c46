//! The seam between the typed adapter and the concrete log engine.
//!
//! A driver exposes streams, durable consumers, publish-with-dedup, batched
//! fetch and the acknowledgement verbs.  The production engine lives outside
//! this repository; [`crate::memory::MemoryBus`] implements the same contract
//! in-process.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::types::{
    AckKind, BusError, ConsumerConfig, RawMessage, RawPublishAck, StreamConfig, StreamInfo,
};

#[async_trait]
pub trait BusDriver: Send + Sync {
    /// Readiness probe; Ok means publishes and fetches can proceed.
    async fn ready(&self) -> Result<(), BusError>;

    /// Create the stream if missing; adopt it unchanged if present.
    async fn ensure_stream(&self, config: StreamConfig) -> Result<StreamInfo, BusError>;

    async fn get_stream(&self, name: &str) -> Result<Option<StreamInfo>, BusError>;

    async fn list_streams(&self) -> Result<Vec<StreamInfo>, BusError>;

    /// Returns false when the stream did not exist.
    async fn delete_stream(&self, name: &str) -> Result<bool, BusError>;

    /// Remove stored messages, optionally only those matching `filter`.
    /// Returns the number of messages removed.
    async fn purge_stream(&self, name: &str, filter: Option<&str>) -> Result<u64, BusError>;

    /// Store one message in the stream capturing `subject`.
    ///
    /// With a `dedup_id` already seen inside the dedup window the message is
    /// not stored again and the original sequence is returned with
    /// `duplicate = true`.
    async fn publish(
        &self,
        subject: &str,
        payload: &[u8],
        headers: &HashMap<String, String>,
        dedup_id: Option<&str>,
    ) -> Result<RawPublishAck, BusError>;

    async fn get_consumer(
        &self,
        stream: &str,
        name: &str,
    ) -> Result<Option<ConsumerConfig>, BusError>;

    /// Create a durable consumer; fails if one with the same name exists.
    async fn create_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<(), BusError>;

    /// Returns false when the consumer did not exist.
    async fn delete_consumer(&self, stream: &str, name: &str) -> Result<bool, BusError>;

    /// Pull up to `batch` messages, waiting at most `timeout` for the first.
    /// An empty batch after the timeout is not an error.
    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        batch: usize,
        timeout: Duration,
    ) -> Result<Vec<RawMessage>, BusError>;

    /// Apply an acknowledgement verb to a delivered message.
    async fn acknowledge(
        &self,
        stream: &str,
        consumer: &str,
        stream_sequence: u64,
        kind: AckKind,
    ) -> Result<(), BusError>;
}
