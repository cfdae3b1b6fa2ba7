//! Reverse-proxy gateway: one public port, Basic auth, path-based routing to
//! the web UI and desktop-streaming upstreams, with WebSocket relay.

pub mod auth;
pub mod route;
pub mod server;

pub use auth::{check_auth, Credentials};
pub use route::{matches_prefix, normalize_subfolder, strip_prefix, RouteDecision, RouteTable};
pub use server::GatewayServer;
