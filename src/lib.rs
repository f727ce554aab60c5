//! treeway - asynchronous binary-tree overlay
//!
//! A fixed set of ranks `[0, N)` is arranged as an implicit binary tree.
//! Each participant runs a [`TreeWaypoint`] that sends to its parent or
//! children without blocking and hands inbound messages to registered
//! handlers. All progress happens on cooperative poll turns driven by a
//! [`Scheduler`](scheduler::Scheduler).
//!
//! ```no_run
//! use treeway::{TreewayConfig, WaypointContext};
//!
//! let config = TreewayConfig::load(None)?;
//! let ctx = WaypointContext::init(&config)?;
//! // register receive handlers here, then:
//! ctx.start_receiving();
//! ctx.waypoint().send_to_children(b"params".to_vec(), |ok| {
//!     if !ok {
//!         eprintln!("broadcast failed");
//!     }
//! });
//! # Ok::<(), treeway::Error>(())
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod relay;
pub mod scheduler;
pub mod simulate;
pub mod topology;
pub mod transport;
pub mod version;
pub mod waypoint;

pub use config::TreewayConfig;
pub use context::WaypointContext;
pub use error::{Error, ErrorCode, Result};
pub use topology::{Rank, Topology, ROOT};
pub use transport::{Payload, Transport, CHANNEL_TAG};
pub use waypoint::{PollReport, ReceiveHandler, TreeWaypoint, WaypointStats};
