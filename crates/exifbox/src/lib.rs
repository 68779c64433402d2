//! Embeds a WASI build of a command-line metadata tool and exposes it as a
//! synchronous call interface.
//!
//! The tool only understands file paths, so in-memory inputs are spilled to
//! a scratch directory and its standard output is captured through an
//! anonymous scratch file. See [`Sandbox`] for the lifecycle.

mod internal;

pub mod alloc;
pub mod config;
pub mod error;
pub mod options;
pub mod output;
pub mod sandbox;

pub const TRACE_TARGET: &str = "exifbox";
/// Target of events carrying the guest's standard error.
pub const TRACE_TARGET_GUEST: &str = "exifbox::guest";

pub use alloc::{HostAllocator, HostBuf, Malloc, SharedAllocator, default_allocator};
pub use config::{Config, DirPerms, FilePerms, MODULE_ENV, PROGRAM_ENV};
pub use error::{CallError, CallErrorKind, Error, Result};
pub use options::{CallOptions, NamedBuffer, Transform};
pub use output::Output;
pub use sandbox::{READ_DEFAULTS, Sandbox, SharedSandbox};
