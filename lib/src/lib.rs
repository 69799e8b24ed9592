//! # twoyi container host daemon core
//!
//! This crate hosts a guest Android userspace rootfs as an unprivileged
//! process tree and exposes it over a TCP control plane for remote
//! rendering and input. It is the core used by the `twoyi-server` binary.

#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

pub mod archive;
pub mod bootprep;
pub mod context;
pub mod error;
pub mod input;
pub mod kvstore;
pub mod profile;
pub mod rominfo;
pub mod rootfs;
pub mod screen;
pub mod server;
pub mod supervisor;

pub use context::DaemonContext;
pub use error::{DaemonError, Result};
