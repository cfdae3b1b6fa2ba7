pub mod clienv;
pub mod config;
pub mod environment;
pub mod error;
pub mod proxy;
pub mod supervisor;

pub use config::{ProxyConfig, ServiceConfig, SupervisorConfig};
pub use environment::{Environment, EnvironmentProvider, ProcessEnvironment};
pub use error::{ConfigError, RegistrationError, ResolveError, RouteError, StartError};
pub use proxy::GatewayServer;
pub use supervisor::{HealthOutcome, ServiceDescriptor, ServiceKind, Supervisor};
