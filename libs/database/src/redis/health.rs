use redis::aio::ConnectionManager;
use tracing::debug;

use crate::common::{DatabaseError, DatabaseResult};

/// `PING` the server. Transport failures surface as [`DatabaseError::Redis`].
pub async fn check_health(conn: &mut ConnectionManager) -> DatabaseResult<()> {
    let response: String = redis::cmd("PING").query_async(conn).await?;

    if response != "PONG" {
        return Err(DatabaseError::HealthCheckFailed(format!(
            "unexpected PING reply: {response}"
        )));
    }

    debug!("Redis answered PING");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_error_message() {
        let err = DatabaseError::HealthCheckFailed("unexpected PING reply: LOADING".to_string());
        assert_eq!(err.to_string(), "Health check failed: unexpected PING reply: LOADING");
    }
}
