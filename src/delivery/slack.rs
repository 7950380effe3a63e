//! Slack delivery through the external upload flow:
//! `files.getUploadURLExternal` → raw upload → `files.completeUploadExternal`.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::delivery::{DeliveryReceipt, DeliveryRequest, Messenger};
use crate::error::{AppError, Result};
use crate::models::DeliveryConfig;
use crate::utils::http::create_async_client;

/// Slack Web API messenger.
pub struct SlackMessenger {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct UploadUrlResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    upload_url: Option<String>,
    #[serde(default)]
    file_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl SlackMessenger {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Build from configuration; the token is read from `token_env`.
    pub fn from_config(config: &DeliveryConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env).map_err(|_| {
            AppError::config_missing(format!("{} is not set", config.token_env))
        })?;
        Ok(Self::new(create_async_client(config)?, &config.api_base, token))
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.api_base, method)
    }

    async fn get_upload_url(&self, filename: &str, length: usize) -> Result<(String, String)> {
        let response = self
            .client
            .post(self.url("files.getUploadURLExternal"))
            .bearer_auth(&self.token)
            .form(&[("filename", filename.to_string()), ("length", length.to_string())])
            .send()
            .await?;
        check_status("files.getUploadURLExternal", response.status())?;

        let body: UploadUrlResponse = response.json().await?;
        if !body.ok {
            return Err(api_error(body.error.as_deref()));
        }
        match (body.upload_url, body.file_id) {
            (Some(url), Some(id)) => Ok((url, id)),
            _ => Err(AppError::rejected(
                "files.getUploadURLExternal returned no upload_url/file_id",
            )),
        }
    }

    async fn upload(&self, upload_url: &str, filename: &str, bytes: Vec<u8>) -> Result<()> {
        let response = self
            .client
            .post(upload_url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await?;
        check_status("file upload", response.status())?;
        debug!("Uploaded {}", filename);
        Ok(())
    }

    async fn complete(&self, file_id: &str, title: &str, channel: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url("files.completeUploadExternal"))
            .bearer_auth(&self.token)
            .json(&json!({
                "files": [{ "id": file_id, "title": title }],
                "channel_id": channel,
            }))
            .send()
            .await?;
        check_status("files.completeUploadExternal", response.status())?;

        let body: ApiResponse = response.json().await?;
        if !body.ok {
            return Err(api_error(body.error.as_deref()));
        }
        Ok(())
    }
}

#[async_trait]
impl Messenger for SlackMessenger {
    async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryReceipt> {
        let (upload_url, file_id) = self
            .get_upload_url(&request.filename, request.bytes.len())
            .await?;
        self.upload(&upload_url, &request.filename, request.bytes)
            .await?;
        self.complete(&file_id, &request.filename, &request.channel)
            .await?;

        info!(
            "Shared {} with {} for {}",
            request.filename, request.channel, request.user_id
        );
        Ok(DeliveryReceipt {
            user_id: request.user_id,
            channel: request.channel,
            file_id,
            delivered_at: Utc::now(),
        })
    }
}

fn check_status(call: &str, status: StatusCode) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("{call}: HTTP {status}");
    match status.as_u16() {
        401 | 403 => Err(AppError::permission(message)),
        429 => Err(AppError::transient(message)),
        s if s >= 500 => Err(AppError::transient(message)),
        _ => Err(AppError::rejected(message)),
    }
}

/// Map a Slack `error` code onto the error taxonomy.
pub(crate) fn api_error(code: Option<&str>) -> AppError {
    let code = code.unwrap_or("unknown_error");
    match code {
        "ratelimited" | "rate_limited" | "service_unavailable" | "internal_error"
        | "fatal_error" | "request_timeout" => AppError::transient(format!("slack: {code}")),
        "not_in_channel" | "channel_not_found" | "invalid_auth" | "not_authed"
        | "missing_scope" | "access_denied" | "account_inactive" | "token_revoked"
        | "is_archived" => AppError::permission(format!("slack: {code}")),
        other => AppError::rejected(format!("slack: {other}")),
    }
}
