//! Types shared between the guestvisor runtime and its clients.

pub mod constants;
pub mod errors;
pub mod event;

pub use errors::{GuestvisorError, GuestvisorResult, ResultExt};
pub use event::Event;
