// src/utils/http.rs

//! HTTP client utilities.

use std::time::Duration;

use crate::error::Result;
use crate::models::DeliveryConfig;

const USER_AGENT: &str = concat!("workschedule/", env!("CARGO_PKG_VERSION"));

/// Create a configured asynchronous HTTP client for delivery endpoints.
pub fn create_async_client(config: &DeliveryConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()?;
    Ok(client)
}
