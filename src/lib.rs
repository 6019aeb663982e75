//! MEGATrace - low-overhead native tracing bridge
//!
//! The host (a game mod, over the C boundary in [`ffi`], or Rust code through
//! [`bridge`]) reports zones, frame marks, counters, memory events and GPU
//! timings. Each calling thread records into its own call stack and bounded
//! ring; one background serializer thread drains the rings, frames the
//! records and writes them to a sink (a viewer socket, a file, or nothing).
//!
//! ```text
//! host call ─► bridge ─► thread_state (call_stack, encoder) ─► queue
//!                                                               │
//!                              sink ◄─ wire ◄─ worker ◄─────────┘
//! ```
//!
//! No host-facing call blocks on I/O, and no failure inside the bridge is
//! allowed to take the host down: misuse is reported through [`diagnostics`],
//! overload drops records and counts them, transport failures stay on the
//! serializer thread.
//!
//! ```no_run
//! use megatrace::{bridge, source_location, BridgeConfig, Identity};
//!
//! # fn main() -> megatrace::Result<()> {
//! let config = BridgeConfig::default();
//! let sink = megatrace::sink::from_config(&config);
//! let session = bridge::init_session_with(config, Identity::build(), sink)?;
//!
//! {
//!     let _tick = session.zone(&source_location!("tick"));
//!     session.emit_counter("entities", 412.0);
//! }
//! session.mark_frame();
//!
//! let report = bridge::shutdown_session()?;
//! println!("{} records written", report.records_written);
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod call_stack;
pub mod capture;
pub mod cli;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod encoder;
pub mod error;
pub mod event;
pub mod ffi;
pub mod identity;
pub mod logging;
pub mod platform;
pub mod queue;
pub mod session;
pub mod sink;
pub mod strings;
pub mod thread_state;
pub mod wire;
pub mod worker;

pub use call_stack::{DepthPolicy, ZoneHandle};
pub use config::{BridgeConfig, SinkConfig};
pub use error::{BridgeError, DecodeError, Result, UsageError};
pub use event::{Event, EventKind};
pub use identity::Identity;
pub use session::{Session, SessionHandle, ZoneGuard};
pub use strings::{LocationId, SourceLocation, StringId};
pub use worker::ShutdownReport;
