mod config;
mod connection;
mod error;
mod registry;

pub use config::BrokerConfig;
pub use connection::{Connection, ConnectionId, Delivery};
pub use error::BrokerError;
pub use registry::ConnectionRegistry;
