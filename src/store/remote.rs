//! HTTP client for the cloud KV worker.
//!
//! Wire protocol, one request per operation:
//! - `GET  {base}?method=getItem&key=K` answers `{"value": <any | null>}`
//! - `POST {base}?method=setItem&key=K` with body `{"value": <any>}`
//! - `POST {base}?method=removeItem&key=K`
//!
//! Only a 2xx status counts as success. The client never retries.

use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::Config;

/// Why a remote call did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
  #[error("request timed out")]
  Timeout,

  #[error("transport error: {0}")]
  Transport(String),

  #[error("remote returned status {0}")]
  Status(u16),

  #[error("malformed response body: {0}")]
  Malformed(String),
}

impl From<reqwest::Error> for RemoteError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      RemoteError::Timeout
    } else if let Some(status) = e.status() {
      RemoteError::Status(status.as_u16())
    } else {
      RemoteError::Transport(e.to_string())
    }
  }
}

#[derive(Deserialize)]
struct GetResponse {
  #[serde(default)]
  value: Option<Value>,
}

#[derive(Serialize)]
struct SetRequest<'a> {
  value: &'a Value,
}

/// Client for the remote durable store.
#[derive(Debug, Clone)]
pub struct RemoteStore {
  client: Client,
  base_url: Url,
  token: Option<String>,
}

impl RemoteStore {
  pub fn new(base_url: Url, timeout: Duration, token: Option<String>) -> color_eyre::Result<Self> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  /// Build a client from the loaded configuration and `SFKV_REMOTE_TOKEN`.
  pub fn from_config(config: &Config) -> color_eyre::Result<Self> {
    Self::new(
      config.remote.url.clone(),
      config.remote.timeout(),
      Config::get_remote_token(),
    )
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  fn request(&self, builder: RequestBuilder, method: &str, key: &str) -> RequestBuilder {
    let builder = builder.query(&[("method", method), ("key", key)]);
    match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  async fn send(&self, builder: RequestBuilder, method: &str, key: &str) -> Result<Response, RemoteError> {
    let response = builder.send().await?;
    let status = response.status();
    debug!(method, key, status = status.as_u16(), "remote store responded");

    if !status.is_success() {
      return Err(RemoteError::Status(status.as_u16()));
    }
    Ok(response)
  }

  /// Fetch `key`. `Ok(None)` means the remote answered but holds no value.
  pub async fn get_item(&self, key: &str) -> Result<Option<Value>, RemoteError> {
    let builder = self.request(self.client.get(self.base_url.clone()), "getItem", key);
    let response = self.send(builder, "getItem", key).await?;

    let body = response.bytes().await?;
    let parsed: GetResponse =
      serde_json::from_slice(&body).map_err(|e| RemoteError::Malformed(e.to_string()))?;

    Ok(parsed.value)
  }

  pub async fn set_item(&self, key: &str, value: &Value) -> Result<(), RemoteError> {
    let builder = self
      .request(self.client.post(self.base_url.clone()), "setItem", key)
      .json(&SetRequest { value });
    self.send(builder, "setItem", key).await?;
    Ok(())
  }

  pub async fn remove_item(&self, key: &str) -> Result<(), RemoteError> {
    let builder = self.request(self.client.post(self.base_url.clone()), "removeItem", key);
    self.send(builder, "removeItem", key).await?;
    Ok(())
  }
}
