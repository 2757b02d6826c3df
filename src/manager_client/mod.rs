pub mod client;
pub mod error;
pub mod locator;

pub use client::ManagerClient;
pub use error::ClientError;
pub use locator::{ControllerLocator, FileLocator, StaticLocator};
