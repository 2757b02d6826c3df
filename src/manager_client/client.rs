use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::error::ClientError;
use super::locator::ControllerLocator;
use crate::retry::RetryConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON client for the controller.
///
/// Calls carry no request timeout: administrative operations may run for a
/// long time, so a dead peer is detected at the connection level and the
/// caller retries.
pub struct ManagerClient {
    locator: Arc<dyn ControllerLocator>,
    client: Client,
    retry: RetryConfig,
}

impl ManagerClient {
    pub fn new(locator: Arc<dyn ControllerLocator>, retry: RetryConfig) -> Result<Self, ClientError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(ClientError::Build)?;
        Ok(Self {
            locator,
            client,
            retry,
        })
    }

    /// Sends one request to `endpoint` with no client-side timeout.
    pub async fn call_no_timeout<Req, Resp>(
        &self,
        endpoint: &str,
        path: &str,
        req: &Req,
    ) -> Result<Resp, ClientError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!(
            "{}/{}",
            endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| classify(endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }

        response.json::<Resp>().await.map_err(ClientError::Decode)
    }

    /// Locates the controller and calls it, retrying retryable failures
    /// with exponential backoff up to `max_retries` times.
    pub async fn execute<Req, Resp>(&self, path: &str, req: &Req) -> Result<Resp, ClientError>
    where
        Req: Serialize + ?Sized + Sync,
        Resp: DeserializeOwned,
    {
        let mut attempt = 0;
        loop {
            let result = match self.locator.locate().await {
                Some(endpoint) => {
                    debug!(%endpoint, path, attempt, "calling controller");
                    self.call_no_timeout(&endpoint, path, req).await
                }
                None => Err(ClientError::NotAvailable),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, error = %e, "controller call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Unresolvable hosts are fatal; every other send failure is transport.
fn classify(endpoint: &str, err: reqwest::Error) -> ClientError {
    let unresolved = std::iter::successors(err.source(), |cause| (*cause).source()).any(|cause| {
        let text = cause.to_string().to_lowercase();
        text.contains("dns error") || text.contains("failed to lookup address")
    });
    let endpoint = endpoint.to_string();
    if unresolved {
        ClientError::UnknownHost { endpoint, source: err }
    } else {
        ClientError::Transport { endpoint, source: err }
    }
}
