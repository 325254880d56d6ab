//! Shared data models

mod command;
mod vehicle;

pub use command::*;
pub use vehicle::*;
