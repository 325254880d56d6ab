//! VOC Client Library
//!
//! Authenticated transport for the Volvo On Call customer API.
//!
//! # Example
//!
//! ```rust,no_run
//! use voc_client::Transport;
//! use voc_core::VocConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), voc_client::TransportError> {
//!     let transport = Transport::new(&VocConfig::new("user@example.com", "secret"))?;
//!
//!     let account = transport.customer_account().await?;
//!     for relation in &account.account_vehicle_relations {
//!         let relation = transport.vehicle_relation(relation).await?;
//!         let status = transport.vehicle_resource(&relation.vehicle, "status").await?;
//!         println!("{}: {}", relation.vehicle_id, status);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Session handling
//!
//! Every request carries the Basic credentials and the last session cookie.
//! A 401 triggers one shared re-authentication; concurrent callers wait on
//! the same attempt and retry once. Rejected credentials poison the session
//! and every later call fails with [`TransportError::Auth`].
//!
//! # Testing
//!
//! The `testing` module provides a mock of the customer API:
//!
//! ```rust,ignore
//! use voc_client::testing::MockCloud;
//!
//! let cloud = MockCloud::new();
//! let server = cloud.serve().await?;
//! let transport = server.transport()?;
//! ```

mod error;
pub mod testing;
mod transport;
mod types;

pub use error::{Result, TransportError};
pub use transport::{join_url, Transport};
pub use types::*;

pub use reqwest::Method;
