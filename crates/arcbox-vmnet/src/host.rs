//! Host service abstraction.
//!
//! Everything above this module is written against two traits:
//! [`HostService`], which creates interfaces and answers capability queries,
//! and [`NativeInterface`], the started interface itself. Both are shaped after
//! vmnet.framework's C surface: commands that the host completes
//! asynchronously take a [`Completer`], packet transfers report through the
//! signed status convention decoded by [`crate::packet::decode_transfer`].
//!
//! Implementations:
//!
//! - `darwin::VmnetFramework` - vmnet.framework (macOS only)
//! - [`crate::sim::SimulatedHost`] - in-process host with its own delivery thread

use std::sync::Arc;

use uuid::Uuid;

use crate::completion::Completer;
use crate::interface::{Ipv4Config, Mode};
use crate::rules::{Proto, Rule};

/// Raw native status code (`vmnet_return_t`).
pub type Status = u32;

/// Callback invoked on the delivery context whenever packets become available.
pub type EventCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Outcome of an interface start command.
pub type StartResult = Result<InterfaceParams, Status>;

/// Optional host capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Bridged mode and the bridge-eligible interface list.
    Bridging,
    /// Port-forwarding rule management.
    PortForwarding,
}

impl Capability {
    /// Human-readable capability name used in errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bridging => "bridged mode",
            Self::PortForwarding => "port forwarding rules",
        }
    }
}

/// Parameters submitted with an interface start command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    /// Operating mode.
    pub mode: Mode,
    /// Interface identifier. The host derives the MAC address from it.
    pub uuid: Uuid,
    /// Optional DHCP range and netmask for shared mode.
    pub ipv4: Option<Ipv4Config>,
    /// Label for any per-interface host resources (dispatch queues, threads).
    pub label: String,
}

/// Attributes the host resolves when an interface starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceParams {
    /// Assigned MAC address.
    pub mac: [u8; 6],
    /// Maximum transmission unit.
    pub mtu: u64,
    /// Largest frame accepted by read and write.
    pub max_packet_size: usize,
}

/// A host service capable of starting virtual interfaces.
pub trait HostService: Send + Sync {
    /// Returns true if the host implements the capability.
    fn supports(&self, capability: Capability) -> bool;

    /// Returns true if the calling process may create interfaces.
    ///
    /// Used to disambiguate the generic failure the host reports when an
    /// unprivileged process tries to start an interface.
    fn is_privileged(&self) -> bool {
        // SAFETY: geteuid has no preconditions.
        unsafe { libc::geteuid() == 0 }
    }

    /// Submits an interface start command.
    ///
    /// Returns the native interface immediately; `done` fires later on the
    /// delivery context with the resolved parameters or a failure status.
    ///
    /// # Errors
    ///
    /// Returns a status if the host rejects the command outright, in which
    /// case `done` may never fire.
    fn start_interface(
        &self,
        desc: &InterfaceDescriptor,
        done: Completer<StartResult>,
    ) -> Result<Box<dyn NativeInterface>, Status>;

    /// Lists host interfaces that may back a bridged interface.
    ///
    /// # Errors
    ///
    /// Returns a status if the host cannot produce the list.
    fn shared_interface_names(&self) -> Result<Vec<String>, Status>;
}

/// A started interface.
pub trait NativeInterface: Send + Sync {
    /// Registers the packets-available callback.
    ///
    /// # Errors
    ///
    /// Returns the host status on failure.
    fn set_event_callback(&self, callback: EventCallback) -> Result<(), Status>;

    /// Non-blocking read of one packet into `buf`.
    ///
    /// Returns the byte count, `0` if nothing is queued, or `-status`.
    fn read(&self, buf: &mut [u8]) -> isize;

    /// Writes one packet.
    ///
    /// Returns the byte count or `-status`.
    fn write(&self, buf: &[u8]) -> isize;

    /// Submits a port-forwarding rule; `done` receives the host status.
    ///
    /// # Errors
    ///
    /// Returns a status if the host rejects the command outright.
    fn add_port_forwarding_rule(&self, rule: Rule, done: Completer<Status>)
    -> Result<(), Status>;

    /// Removes the rule keyed by `(proto, external_port)`; `done` receives
    /// the host status.
    ///
    /// # Errors
    ///
    /// Returns a status if the host rejects the command outright.
    fn remove_port_forwarding_rule(
        &self,
        proto: Proto,
        external_port: u16,
        done: Completer<Status>,
    ) -> Result<(), Status>;

    /// Returns a snapshot of the live rule set.
    ///
    /// # Errors
    ///
    /// Returns the host status on failure.
    fn port_forwarding_rules(&self) -> Result<Vec<Rule>, Status>;

    /// Submits a stop command; `done` receives the host status.
    ///
    /// # Errors
    ///
    /// Returns a status if the host rejects the command outright.
    fn stop(&self, done: Completer<Status>) -> Result<(), Status>;
}
