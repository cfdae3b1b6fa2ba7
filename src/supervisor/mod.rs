//! Service supervisor: dependency-ordered startup, health monitoring and
//! restart with exponential backoff.
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │                 Supervisor                 │
//! ├────────────────────────────────────────────┤
//! │ resolver │ ProcessRegistry │ RestartTracker│
//! ├────────────────────────────────────────────┤
//! │   xvfb   │   kasmvnc   │   web   │  ...    │
//! └────────────────────────────────────────────┘
//! ```

pub mod command;
pub mod descriptor;
pub mod health;
pub mod log_buffer;
pub mod manager;
pub mod registry;
pub mod resolver;
pub mod restart;

pub use command::CommandService;
pub use descriptor::{ProcessHandle, Service, ServiceDescriptor, ServiceKind, DEFAULT_STOP_GRACE};
pub use health::HealthCheck;
pub use log_buffer::LogBuffer;
pub use manager::{HealthOutcome, Supervisor};
pub use registry::{ProcessRegistry, ServiceInfo, ServiceState};
pub use restart::{RestartPolicy, RestartTracker};
