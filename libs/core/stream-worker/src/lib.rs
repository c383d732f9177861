//! Stream Worker Framework
//!
//! A Redis Streams work queue with at-least-once delivery.
//!
//! ## Features
//!
//! - **Generic worker**: `StreamWorker<J, P>` processes any job type
//! - **Consumer groups**: Horizontal scaling with Redis consumer groups
//! - **Receive counts**: Failed entries are re-added with an incremented count
//! - **Dead Letter Queue**: Entries move to the DLQ once their receive count is spent
//! - **Batch abort**: A fatal error leaves the rest of a batch pending
//! - **Prometheus metrics**: Built-in observability
//! - **Health endpoints**: K8s-ready liveness and readiness probes
//!
//! ## Example
//!
//! ```ignore
//! use stream_worker::{StreamWorker, StreamJob, StreamProcessor, StreamDef, WorkerConfig};
//!
//! struct MyStream;
//! impl StreamDef for MyStream {
//!     const STREAM_NAME: &'static str = "my:jobs";
//!     const CONSUMER_GROUP: &'static str = "my_workers";
//!     const DLQ_STREAM: &'static str = "my:jobs:dlq";
//! }
//!
//! let config = WorkerConfig::from_stream_def::<MyStream>();
//! let worker = StreamWorker::new(redis, processor, config);
//! worker.run(shutdown_rx).await?;
//! ```

mod config;
mod consumer;
mod dlq;
mod error;
mod event;
mod health;
pub mod metrics;
mod producer;
mod registry;
mod worker;

// Re-export main types
pub use config::{WorkerConfig, delayed_set_name};
pub use consumer::{RawEntry, StreamConsumer, StreamInfo};
pub use dlq::{DlqManager, DlqMessage, DlqStats, ReprocessResult};
pub use error::{ErrorCategory, StreamError};
pub use event::{QueueMessage, StreamEvent};
pub use health::{HealthState, dlq_admin_router, full_admin_router, health_router};
pub use metrics::{StreamMetrics, init_metrics};
pub use producer::StreamProducer;
pub use registry::{MessageKey, StreamDef, StreamJob, StreamProcessor};
pub use worker::{Redrive, StreamWorker, redrive_decision};
