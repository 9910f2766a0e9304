use redis::aio::MultiplexedConnection;

use crate::error::{Error, ErrorDetails};

/// Opens the multiplexed connection shared by the counter, rate-limit, and cache stores.
pub async fn connect(url: &str) -> Result<MultiplexedConnection, Error> {
    let client = redis::Client::open(url).map_err(|e| {
        Error::new(ErrorDetails::Config {
            message: format!("Failed to create Redis client: {e}"),
        })
    })?;
    let conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to get Redis connection: {e}"),
            })
        })?;
    tracing::info!("Connected to Redis");
    Ok(conn)
}
