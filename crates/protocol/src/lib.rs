pub mod config;
pub mod envelope;
pub mod error;
pub mod jsep;

pub use config::GatewayConfig;
pub use envelope::{ErrorBody, PluginData, Reply, Request};
pub use error::{ApiError, ErrorCode};
pub use jsep::{Jsep, JsepType};
