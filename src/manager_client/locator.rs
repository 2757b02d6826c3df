//! Discovery of the current controller endpoint.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

/// Address a controller advertises while it is still starting up.
pub const UNAVAILABLE_ADDRESS: &str = "0.0.0.0:0";

/// Finds the controller. `None` means it is not available yet and the
/// caller should retry later.
#[async_trait]
pub trait ControllerLocator: Send + Sync {
    async fn locate(&self) -> Option<String>;
}

/// A fixed endpoint.
#[derive(Debug, Clone)]
pub struct StaticLocator {
    endpoint: String,
}

impl StaticLocator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ControllerLocator for StaticLocator {
    async fn locate(&self) -> Option<String> {
        normalize(&self.endpoint)
    }
}

/// Reads the address the controller advertises in a file. The file is
/// re-read on every lookup so a restarted controller is picked up.
#[derive(Debug, Clone)]
pub struct FileLocator {
    path: PathBuf,
}

impl FileLocator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ControllerLocator for FileLocator {
    async fn locate(&self) -> Option<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => normalize(&contents),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "controller address not readable");
                None
            }
        }
    }
}

/// Trims the address and adds an `http://` scheme when it has none.
fn normalize(address: &str) -> Option<String> {
    let address = address.trim();
    if address.is_empty() || address == UNAVAILABLE_ADDRESS {
        return None;
    }
    if address.contains("://") {
        Some(address.trim_end_matches('/').to_string())
    } else {
        Some(format!("http://{}", address.trim_end_matches('/')))
    }
}
