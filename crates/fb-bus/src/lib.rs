// fb-bus: typed facade over a persistent pub/sub log.
//
// The adapter owns streams and durable consumers, publishes with
// deduplication and retry, fetches in batches, and supports replay from
// arbitrary positions.  The concrete log engine sits behind the `BusDriver`
// trait; `MemoryBus` is the in-process engine used by tests and the
// standalone binaries.

pub mod adapter;
pub mod driver;
pub mod memory;
pub mod types;

pub use adapter::{BusAdapter, BusSettings, MessageHandler, RetryPolicy, Subscription};
pub use driver::BusDriver;
pub use memory::MemoryBus;
pub use types::{
    AckKind, AckPolicy, BusError, BusMessage, ConsumerConfig, ConsumerKind, DeliverPolicy,
    DiscardPolicy, PublishError, PublishReceipt, ReplayPacing, RetentionPolicy, StorageKind,
    StreamConfig, StreamInfo,
};
