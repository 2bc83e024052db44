//! Request gateway: stateless routing of client operations

pub mod http;
pub mod router;

pub use http::{create_router, GatewayState};
pub use router::Router;
