//! voc-runtime - Vehicle state and command orchestration
//!
//! - [`VehicleRegistry`]: known vehicles and their last attribute snapshot,
//!   with single-flight refreshes and version-guarded commits
//! - [`CommandInvoker`]: submits commands and polls them to a terminal status
//! - [`Poller`]: periodic refresh of the vehicle list and every vehicle's state

pub mod error;
pub mod invoker;
pub mod poller;
pub mod registry;

pub use error::{InvokerError, InvokerResult, RegistryError};
pub use invoker::{
    wait_for_shutdown, CommandInvoker, InvocationHandle, InvocationState, InvokerConfig,
};
pub use poller::{PollReport, Poller, PollerConfig};
pub use registry::{Commit, VehicleRecord, VehicleRegistry};
