//! Stream definitions for the song requests domain.

use stream_worker::StreamDef;

/// Delivery requests waiting for the player.
///
/// Written by the listener, drained by the delivery worker.
pub struct SongRequestStream;

impl StreamDef for SongRequestStream {
    const STREAM_NAME: &'static str = "song_requests:deliveries";

    const CONSUMER_GROUP: &'static str = "delivery_workers";

    const DLQ_STREAM: &'static str = "song_requests:deliveries:dlq";

    const MAX_LENGTH: i64 = 100_000;

    const BATCH_SIZE: usize = 10;

    /// 30s, the idle time after which a crashed worker's entries are taken over
    const CLAIM_IDLE_MS: u64 = 30_000;
}
