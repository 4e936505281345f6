//! macOS backend.
//!
//! - `ffi`: vmnet.framework and libxpc declarations
//! - `dispatch`: owned GCD serial queues
//! - `vmnet`: [`VmnetFramework`], the vmnet.framework [`HostService`](crate::host::HostService)

mod dispatch;
mod ffi;
mod vmnet;

pub use vmnet::VmnetFramework;
