//! Connection management: URLs, listeners, connect/accept loops and the
//! event loop servicing every live controller.

pub mod config;
pub mod manager;
pub mod url;

pub use config::NetworkConfig;
pub use manager::{AbortHandle, EventStatus, NetworkAccessManager, NetworkError, NetworkEvent};
pub use self::url::{ConnectionUrl, UrlError};
