//! Persisted guest and volume records plus the lifecycle state machine.

mod guest;
pub mod meta;
mod status;
mod volume;

pub use guest::{ExtraNetwork, GpuParams, Guest, LambdaOptions, qemu_mac};
pub use status::{Lifecycle, Status, can_forward};
pub use volume::{Volume, VolumeFormat, Volumes, parse_mount_size, parse_size};
