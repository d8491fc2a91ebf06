pub mod builder;
pub mod server;

pub use builder::{Gateway, GatewayBuilder};
pub use server::GatewayServer;
