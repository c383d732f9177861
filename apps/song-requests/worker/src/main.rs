//! Song Requests Worker - Entry Point
//!
//! Drains the delivery queue into each channel's media player.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    song_requests_worker::run().await
}
