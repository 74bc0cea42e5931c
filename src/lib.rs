//! Run-status streaming: a same-origin relay that forwards the workflow
//! engine's credentialed event stream, and a client tracker that turns the
//! stream into a monotonic, render-safe progress model.
//!
//! ```rust,no_run
//! use runstream::{StatusTracker, TrackerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut tracker = StatusTracker::new(TrackerConfig::new("http://127.0.0.1:8080"))?;
//!     let mut updates = tracker.subscribe();
//!     tracker.watch("5f0c6d1e-8a0b-4b8e-9d53-3f1f6f3c2a11", true);
//!     while updates.changed().await.is_ok() {
//!         let state = updates.borrow_and_update().clone();
//!         println!("{:?} {:?}", state.status, state.message);
//!         if !state.is_connected && state.is_terminal() {
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod frame;
pub mod relay;
pub mod state;
pub mod tracker;
pub mod transport;

pub use api::{router, serve, AppState};
pub use config::{RelayConfig, Secret, TrackerConfig};
pub use error::{RelayError, TrackerError};
pub use events::{parse_timestamp, RunStatus, StatusEvent, WorkflowNode};
pub use relay::Relay;
pub use state::{Phase, TrackerState};
pub use tracker::StatusTracker;
