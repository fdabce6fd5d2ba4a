//! # shmlog Shared Memory
//!
//! Named, fixed-shape numeric buffers shared between processes on one host,
//! with an explicit lifecycle and an optional cross-process lock.
//!
//! ## Features
//!
//! - **Explicit lifecycle**: `create` / `connect` / `disconnect` / `destroy`,
//!   with layout checks on every attach and `UseAfterDestroy` on every access
//!   to a removed region
//! - **Bounded locking**: locked access gives up with `LockTimeout` instead of
//!   hanging on a stuck peer
//! - **Typed views**: elements are plain numeric primitives bound by the
//!   [`Element`] trait
//! - **Termination flag**: a one-byte buffer used as a cross-process stop
//!   mailbox
//!
//! ## Layout
//!
//! ```text
//! /dev/shm/shmlog_<name>
//! ┌──────────────────────────────┬──────────────────────────────┐
//! │ BufferHeader (128 B)         │ element data (row-major)     │
//! │ magic, layout, state, pids   │ shape.product() * size_of<T> │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shmlog_shared_memory::{BufferSpec, SharedBuffer};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let spec = BufferSpec::of::<f64>("joint_positions", vec![6]);
//!
//! // Owner
//! let mut owner = SharedBuffer::<f64>::create(&spec, false)?;
//! owner.write(.., &[0.0, 0.1, 0.2, 0.3, 0.4, 0.5], true)?;
//!
//! // Peer (usually another process)
//! let peer = SharedBuffer::<f64>::connect(&spec)?;
//! assert_eq!(peer.get(2, true)?, 0.2);
//! peer.with_exclusive(|data| data[0] += 1.0)?;
//!
//! drop(peer);
//! owner.destroy()?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod element;
pub mod error;
pub mod flag;
mod lock;
pub mod platform;
pub mod segment;

pub use buffer::{BufferGuard, BufferSpec, SharedBuffer, Span, remove_region};
pub use element::{Element, ElementType};
pub use error::{ShmError, ShmResult};
pub use flag::{FlagState, TerminationFlag, terminator_name};
pub use segment::{BufferHeader, HEADER_SIZE, MAX_DIMS, StateFlags};
