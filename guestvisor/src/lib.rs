//! guestvisor - host daemon orchestrating KVM/QEMU guests.
//!
//! The [`Manager`] is the entry point: it serializes every mutating
//! operation per guest, bounds each one with the configured deadline, and
//! publishes completed operations to watchers. Guest-level logic lives on
//! [`VirtGuest`]; hypervisor access goes through [`bot::Bot`].

pub mod bot;
pub mod config;
pub mod context;
pub mod guest;
pub mod logging;
pub mod manager;
pub mod models;
pub mod network;
pub mod pipeline;
pub mod runtime;
pub mod store;

pub use config::{LogConfig, VirtConfig};
pub use context::CallContext;
pub use guest::{DestroyReceiver, ResizeRequest, VirtGuest};
pub use guestvisor_shared::{Event, GuestvisorError, GuestvisorResult};
pub use manager::{CreateOptions, Manager, Op, Watcher};
pub use models::{Guest, Status, Volume};
pub use runtime::{GuestRuntime, SharedRuntime};
