//! stpd: a per-VLAN Spanning Tree Protocol (PVST+) daemon for SONiC-style
//! switches.
//!
//! The crate is split the way the design calls out its components (spec
//! §2, §4): [`bitmap`] and [`timer`] are the small shared primitives,
//! [`iftable`] tracks the physical/LAG topology, [`bpdu`] is the wire codec,
//! [`model`] is the per-instance/global data model, [`stp`] is the state
//! machine itself, [`protect`] layers the protection overlays on top of it,
//! [`sched`] drives everything from a single 100ms tick, and [`sync`]
//! publishes the results downstream. [`ipc`] and [`config`] are the ambient
//! plumbing the binary uses to get bytes in and settings loaded; `main.rs`
//! wires all of it to real sockets.
//!
//! Nothing in this crate spawns a thread or holds a lock: every module here
//! is called from a single event-loop thread, exactly as spec §5 requires.

pub mod bitmap;
pub mod bpdu;
pub mod config;
pub mod error;
pub mod iftable;
pub mod ipc;
pub mod model;
pub mod protect;
pub mod sched;
pub mod stp;
pub mod sync;
pub mod timer;

pub use error::{Result, StpError};
