//! Publishing delivery requests onto the queue.

use async_trait::async_trait;
use stream_worker::StreamProducer;

use crate::error::SongRequestResult;
use crate::models::DeliveryRequest;

/// Where the subscription client sends qualifying requests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestPublisher: Send + Sync {
    /// Returns the queue's id for the new message
    async fn publish(&self, request: &DeliveryRequest) -> SongRequestResult<String>;
}

#[async_trait]
impl RequestPublisher for StreamProducer {
    async fn publish(&self, request: &DeliveryRequest) -> SongRequestResult<String> {
        Ok(self.send(request).await?)
    }
}
