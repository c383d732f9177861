//! Song Requests Listener - Entry Point
//!
//! Keeps one channel-point subscription per connected channel and publishes
//! qualifying song requests to the delivery queue.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    song_requests_listener::run().await
}
