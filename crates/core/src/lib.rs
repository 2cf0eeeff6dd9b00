pub mod bridge;
pub mod events;
pub mod gateway;
pub mod host;
pub mod ids;
pub mod plugin;
pub mod sdp;
pub mod session;
pub mod transport;

pub use gateway::Gateway;
pub use host::{InboundMessage, PluginHost};
pub use plugin::{GatewayCallbacks, Plugin, PluginInfo};
pub use session::{Handle, Session, SessionRegistry};
