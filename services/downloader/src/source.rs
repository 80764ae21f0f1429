//! Remote file sources.
//!
//! A [`FileSource`] resolves to one or more addresses and opens a
//! [`SourceConnection`] pinned to each. Workers hold a connection between
//! files and drop it before sleeping.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use tracing::{debug, info};
use wind_common::BuildTime;

use crate::config::SourceConfig;
use crate::error::{DownloadError, Result};

#[async_trait]
pub trait FileSource: Send + Sync {
    /// Addresses the source host resolves to, without duplicates.
    async fn resolve(&self) -> Result<Vec<SocketAddr>>;

    /// Open a connection that only talks to `address`.
    fn connect(&self, address: SocketAddr) -> Result<Box<dyn SourceConnection>>;
}

#[async_trait]
pub trait SourceConnection: Send {
    /// Fetch the whole of `file_name` for `build_time`.
    ///
    /// A file the source does not have is [`DownloadError::NotFound`];
    /// any other failure is [`DownloadError::Transport`] or
    /// [`DownloadError::Timeout`].
    async fn fetch(&mut self, build_time: &BuildTime, file_name: &str) -> Result<Bytes>;
}

/// Plain HTTP(S) GETs against the configured host.
#[derive(Debug, Clone)]
pub struct HttpSource {
    config: SourceConfig,
    timeout: Duration,
}

impl HttpSource {
    pub fn new(config: SourceConfig, timeout: Duration) -> Self {
        Self { config, timeout }
    }
}

#[async_trait]
impl FileSource for HttpSource {
    async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let host = (self.config.host.as_str(), self.config.port);
        let mut addresses: Vec<SocketAddr> = tokio::net::lookup_host(host)
            .await
            .map_err(|e| {
                DownloadError::Transport(format!("Failed to resolve {}: {}", self.config.host, e))
            })?
            .collect();
        addresses.sort();
        addresses.dedup();
        info!(host = %self.config.host, count = addresses.len(), "Resolved source host");
        Ok(addresses)
    }

    fn connect(&self, address: SocketAddr) -> Result<Box<dyn SourceConnection>> {
        let client = Client::builder()
            .resolve(&self.config.host, address)
            .timeout(self.timeout)
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(1)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| DownloadError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        debug!(address = %address, "Connecting to source");

        Ok(Box::new(HttpConnection {
            client,
            config: self.config.clone(),
        }))
    }
}

struct HttpConnection {
    client: Client,
    config: SourceConfig,
}

fn transport_error(file_name: &str, err: reqwest::Error) -> DownloadError {
    if err.is_timeout() {
        DownloadError::Timeout(file_name.to_string())
    } else {
        DownloadError::Transport(format!("{}: {}", file_name, err))
    }
}

#[async_trait]
impl SourceConnection for HttpConnection {
    async fn fetch(&mut self, build_time: &BuildTime, file_name: &str) -> Result<Bytes> {
        let url = self.config.url(build_time, file_name);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(file_name, e))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(DownloadError::NotFound(file_name.to_string())),
            status => {
                return Err(DownloadError::Transport(format!(
                    "{}: HTTP {}",
                    file_name, status
                )))
            }
        }

        let data = response
            .bytes()
            .await
            .map_err(|e| transport_error(file_name, e))?;
        debug!(url = %url, bytes = data.len(), "Fetched file");
        Ok(data)
    }
}
