//! Interface handles.
//!
//! An [`Interface`] owns one started host interface together with the
//! attributes the host resolved for it. Attributes never change after
//! creation. The interface is stopped explicitly with [`Interface::stop`] or,
//! failing that, when the handle is dropped.
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(target_os = "macos")]
//! # fn main() -> arcbox_vmnet::Result<()> {
//! use arcbox_vmnet::{Interface, InterfaceConfig};
//!
//! let iface = Interface::create(InterfaceConfig::shared())?;
//! iface.install_event_bridge()?;
//!
//! let mut buf = vec![0u8; iface.max_packet_size()];
//! let frame = iface.blocking_read(&mut buf)?;
//! println!("received {} bytes", frame.len());
//! # Ok(())
//! # }
//! # #[cfg(not(target_os = "macos"))]
//! # fn main() {}
//! ```

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::completion::await_once;
use crate::error::{ErrorKind, Result, VmnetError, check, classify};
use crate::event::EventBridge;
use crate::host::{
    Capability, HostService, InterfaceDescriptor, InterfaceParams, NativeInterface, Status,
};

/// Interface operating mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// Host-only network between the interface and the host.
    Host,
    /// NAT through the host's network connection, with DHCP.
    #[default]
    Shared,
    /// Bridged onto the named physical (wired) host interface.
    Bridged(String),
}

/// DHCP range and netmask for shared mode.
///
/// All three addresses must lie in a private range. The host enforces this,
/// not this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ipv4Config {
    /// First address handed out by DHCP.
    pub start: Ipv4Addr,
    /// Last address handed out by DHCP.
    pub end: Ipv4Addr,
    /// Subnet mask.
    pub netmask: Ipv4Addr,
}

impl Ipv4Config {
    /// Creates a new range.
    #[must_use]
    pub const fn new(start: Ipv4Addr, end: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            start,
            end,
            netmask,
        }
    }
}

/// Interface creation parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Operating mode.
    pub mode: Mode,
    /// Interface identifier (random if None).
    pub uuid: Option<Uuid>,
    /// DHCP range (host default if None).
    pub ipv4: Option<Ipv4Config>,
}

impl InterfaceConfig {
    /// Creates a host-only configuration.
    #[must_use]
    pub fn host() -> Self {
        Self {
            mode: Mode::Host,
            ..Default::default()
        }
    }

    /// Creates a shared (NAT) configuration.
    #[must_use]
    pub fn shared() -> Self {
        Self {
            mode: Mode::Shared,
            ..Default::default()
        }
    }

    /// Creates a configuration bridged onto `interface`.
    #[must_use]
    pub fn bridged(interface: impl Into<String>) -> Self {
        Self {
            mode: Mode::Bridged(interface.into()),
            ..Default::default()
        }
    }

    /// Sets the interface identifier.
    #[must_use]
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = Some(uuid);
        self
    }

    /// Sets the DHCP range.
    #[must_use]
    pub fn with_ipv4(mut self, ipv4: Ipv4Config) -> Self {
        self.ipv4 = Some(ipv4);
        self
    }
}

/// A started host interface.
pub struct Interface {
    pub(crate) native: Box<dyn NativeInterface>,
    pub(crate) host: Arc<dyn HostService>,
    pub(crate) params: InterfaceParams,
    pub(crate) events: Arc<EventBridge>,
    uuid: Uuid,
    mode: Mode,
    ipv4: Option<Ipv4Config>,
    name: String,
    events_installed: AtomicBool,
    stopped: AtomicBool,
}

impl Interface {
    /// Creates an interface through vmnet.framework.
    ///
    /// # Errors
    ///
    /// See [`create_with`](Self::create_with).
    #[cfg(target_os = "macos")]
    pub fn create(config: InterfaceConfig) -> Result<Self> {
        Self::create_with(Arc::new(crate::darwin::VmnetFramework::new()), config)
    }

    /// Creates an interface on the given host service.
    ///
    /// Blocks until the host has started the interface and resolved its MAC
    /// address, MTU and maximum packet size. Creating twice with the same
    /// UUID yields the same MAC address.
    ///
    /// # Errors
    ///
    /// - [`VmnetError::ApiNotSupported`] for bridged mode on a host without
    ///   bridging
    /// - [`VmnetError::PermissionDenied`] if the host fails generically and
    ///   the process is unprivileged
    /// - [`VmnetError::Native`] for any other host failure
    pub fn create_with(host: Arc<dyn HostService>, config: InterfaceConfig) -> Result<Self> {
        if matches!(config.mode, Mode::Bridged(_)) && !host.supports(Capability::Bridging) {
            return Err(VmnetError::ApiNotSupported(Capability::Bridging.name()));
        }

        let uuid = config.uuid.unwrap_or_else(Uuid::new_v4);
        let name = interface_name(&uuid);
        let desc = InterfaceDescriptor {
            mode: config.mode,
            uuid,
            ipv4: config.ipv4,
            label: name.clone(),
        };

        let mut native = None;
        let started = await_once(|done| {
            let started = host
                .start_interface(&desc, done)
                .map_err(|code| creation_error(host.as_ref(), code))?;
            native = Some(started);
            Ok::<(), VmnetError>(())
        })?;
        let params = started.map_err(|code| creation_error(host.as_ref(), code))?;
        let native = native.ok_or(VmnetError::CompletionAbandoned)?;

        tracing::debug!(
            name = %name,
            mac = %format_mac(&params.mac),
            mtu = params.mtu,
            max_packet_size = params.max_packet_size,
            "vmnet interface started"
        );

        Ok(Self {
            native,
            host,
            params,
            events: Arc::new(EventBridge::new()),
            uuid,
            mode: desc.mode,
            ipv4: desc.ipv4,
            name,
            events_installed: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Returns the interface identifier actually assigned.
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the name derived from the identifier.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the MAC address.
    #[must_use]
    pub const fn mac(&self) -> [u8; 6] {
        self.params.mac
    }

    /// Returns the MTU.
    #[must_use]
    pub const fn mtu(&self) -> u64 {
        self.params.mtu
    }

    /// Returns the maximum packet size.
    #[must_use]
    pub const fn max_packet_size(&self) -> usize {
        self.params.max_packet_size
    }

    /// Returns the operating mode.
    #[must_use]
    pub const fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Returns the DHCP range requested at creation.
    #[must_use]
    pub const fn ipv4_config(&self) -> Option<&Ipv4Config> {
        self.ipv4.as_ref()
    }

    /// Returns the event bridge attached to this interface.
    #[must_use]
    pub fn events(&self) -> &EventBridge {
        &self.events
    }

    /// Returns true until the interface is stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(VmnetError::Stopped)
        }
    }

    /// Attaches the event bridge to the host's packets-available events.
    ///
    /// Must be called once before [`wait_for_packets`](Self::wait_for_packets)
    /// or [`blocking_read`](Self::blocking_read).
    ///
    /// # Errors
    ///
    /// Returns [`VmnetError::EventsAlreadyInstalled`] on a second call, or the
    /// host status if the callback cannot be registered.
    pub fn install_event_bridge(&self) -> Result<()> {
        self.ensure_running()?;
        if self.events_installed.swap(true, Ordering::AcqRel) {
            return Err(VmnetError::EventsAlreadyInstalled);
        }

        let events = Arc::clone(&self.events);
        if let Err(code) = self.native.set_event_callback(Arc::new(move || events.notify())) {
            self.events_installed.store(false, Ordering::Release);
            return Err(VmnetError::Native(classify(code)));
        }

        tracing::debug!(name = %self.name, "event bridge installed");
        Ok(())
    }

    /// Blocks until packets may be available.
    ///
    /// Wakeups are coalesced; see [`EventBridge`].
    ///
    /// # Errors
    ///
    /// - [`VmnetError::EventsNotInstalled`] if the bridge was never installed
    /// - [`VmnetError::Stopped`] if the interface is stopped, including while
    ///   this call is parked
    pub fn wait_for_packets(&self) -> Result<()> {
        self.ensure_running()?;
        if !self.events_installed.load(Ordering::Acquire) {
            return Err(VmnetError::EventsNotInstalled);
        }
        self.events.wait()
    }

    /// Stops the interface and releases the host resources.
    ///
    /// Threads parked in [`wait_for_packets`](Self::wait_for_packets) or
    /// [`blocking_read`](Self::blocking_read) are woken with
    /// [`VmnetError::Stopped`]. Idempotent once it has succeeded. If the host
    /// refuses the stop command the interface stays running and `stop` may be
    /// retried. Must not be called from a host delivery callback.
    ///
    /// # Errors
    ///
    /// Returns the host status if the stop command fails.
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Err(e) = self.stop_native() {
            self.stopped.store(false, Ordering::Release);
            return Err(e);
        }
        self.events.close();

        tracing::debug!(name = %self.name, "vmnet interface stopped");
        Ok(())
    }

    fn stop_native(&self) -> Result<()> {
        let status: Status = await_once(|done| {
            self.native
                .stop(done)
                .map_err(|code| VmnetError::Native(classify(code)))
        })?;
        check(status)
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(name = %self.name, error = %e, "failed to stop vmnet interface");
        }
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("mode", &self.mode)
            .field("mac", &format_mac(&self.params.mac))
            .field("mtu", &self.params.mtu)
            .field("max_packet_size", &self.params.max_packet_size)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Lists host interfaces usable for bridged mode (wired interfaces only).
///
/// # Errors
///
/// Returns [`VmnetError::ApiNotSupported`] if the host lacks bridging, or the
/// host status on failure.
pub fn list_bridge_eligible_interfaces(host: &dyn HostService) -> Result<Vec<String>> {
    if !host.supports(Capability::Bridging) {
        return Err(VmnetError::ApiNotSupported(Capability::Bridging.name()));
    }
    host.shared_interface_names()
        .map_err(|code| VmnetError::Native(classify(code)))
}

/// Maps a failed start status, surfacing missing privilege as the root cause.
fn creation_error(host: &dyn HostService, code: Status) -> VmnetError {
    match classify(code) {
        ErrorKind::Failure if !host.is_privileged() => VmnetError::PermissionDenied,
        kind => VmnetError::Native(kind),
    }
}

fn interface_name(uuid: &Uuid) -> String {
    let simple = uuid.simple().to_string();
    format!("vmnet-{}", &simple[..8])
}

/// Formats a MAC address as a string.
#[must_use]
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Parses a MAC address from a string.
///
/// Accepts single-digit octets (`2:0:c:1:2:3`), which is how the host
/// reports addresses.
///
/// # Errors
///
/// Returns an error if the string is not a valid MAC address.
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(VmnetError::config("invalid MAC address format"));
    }

    let mut mac = [0u8; 6];
    for (byte, part) in mac.iter_mut().zip(&parts) {
        if part.is_empty() || part.len() > 2 {
            return Err(VmnetError::config("invalid MAC address byte"));
        }
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| VmnetError::config("invalid MAC address byte"))?;
    }

    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::completion::Completer;
    use crate::error::{VMNET_FAILURE, VMNET_SUCCESS};
    use crate::host::{EventCallback, StartResult};
    use crate::rules::{Proto, Rule};
    use crate::sim::SimulatedHost;

    fn sim() -> Arc<SimulatedHost> {
        Arc::new(SimulatedHost::new())
    }

    #[test]
    fn test_config_builders() {
        let uuid = Uuid::new_v4();
        let range = Ipv4Config::new(
            Ipv4Addr::new(192, 168, 64, 2),
            Ipv4Addr::new(192, 168, 64, 254),
            Ipv4Addr::new(255, 255, 255, 0),
        );
        let config = InterfaceConfig::shared().with_uuid(uuid).with_ipv4(range);
        assert_eq!(config.mode, Mode::Shared);
        assert_eq!(config.uuid, Some(uuid));
        assert_eq!(config.ipv4, Some(range));

        assert_eq!(InterfaceConfig::host().mode, Mode::Host);
        assert_eq!(
            InterfaceConfig::bridged("en0").mode,
            Mode::Bridged("en0".to_string())
        );
        assert_eq!(InterfaceConfig::default().mode, Mode::Shared);
    }

    #[test]
    fn test_format_mac() {
        let mac = [0x02, 0xAB, 0xCD, 0xEF, 0x12, 0x34];
        assert_eq!(format_mac(&mac), "02:ab:cd:ef:12:34");
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("02:ab:cd:ef:12:34").unwrap(),
            [0x02, 0xAB, 0xCD, 0xEF, 0x12, 0x34]
        );
        assert_eq!(
            parse_mac("2:0:c:1:2:3").unwrap(),
            [0x02, 0x00, 0x0C, 0x01, 0x02, 0x03]
        );
    }

    #[test]
    fn test_parse_mac_invalid() {
        assert!(parse_mac("invalid").is_err());
        assert!(parse_mac("02:ab:cd:ef:12").is_err());
        assert!(parse_mac("02:ab:cd:ef:12:34:56").is_err());
        assert!(parse_mac("02:ab:cd:ef:12:gg").is_err());
        assert!(parse_mac("02:ab:cd:ef::34").is_err());
        assert!(parse_mac("02:ab:cd:ef:123:34").is_err());
    }

    #[test]
    fn test_interface_name_from_uuid() {
        let uuid = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(interface_name(&uuid), "vmnet-67e55044");
    }

    #[test]
    fn test_create_resolves_attributes() {
        let iface = Interface::create_with(sim(), InterfaceConfig::shared()).unwrap();
        assert_eq!(iface.mtu(), 1500);
        assert_eq!(iface.max_packet_size(), 1518);
        assert_eq!(iface.mode(), &Mode::Shared);
        assert!(iface.ipv4_config().is_none());
        assert!(iface.is_running());
        assert!(iface.name().starts_with("vmnet-"));
    }

    #[test]
    fn test_create_echoes_requested_uuid() {
        let uuid = Uuid::new_v4();
        let iface =
            Interface::create_with(sim(), InterfaceConfig::host().with_uuid(uuid)).unwrap();
        assert_eq!(iface.uuid(), uuid);
    }

    #[test]
    fn test_same_uuid_same_mac() {
        let host = sim();
        let uuid = Uuid::new_v4();

        let first = Interface::create_with(host.clone(), InterfaceConfig::shared().with_uuid(uuid))
            .unwrap();
        let mac = first.mac();
        first.stop().unwrap();
        drop(first);

        let second =
            Interface::create_with(host, InterfaceConfig::shared().with_uuid(uuid)).unwrap();
        assert_eq!(second.mac(), mac);
    }

    #[test]
    fn test_unprivileged_failure_is_permission_denied() {
        let host = Arc::new(SimulatedHost::new().with_privileged(false));
        let err = Interface::create_with(host, InterfaceConfig::shared()).unwrap_err();
        assert!(matches!(err, VmnetError::PermissionDenied));
    }

    #[test]
    fn test_invalid_range_is_native_error() {
        let public = Ipv4Config::new(
            Ipv4Addr::new(8, 8, 8, 2),
            Ipv4Addr::new(8, 8, 8, 254),
            Ipv4Addr::new(255, 255, 255, 0),
        );
        let err = Interface::create_with(sim(), InterfaceConfig::shared().with_ipv4(public))
            .unwrap_err();
        assert!(err.is_native(ErrorKind::InvalidArgument));
    }

    #[test]
    fn test_bridged_requires_capability() {
        let host = Arc::new(SimulatedHost::new().with_capability(Capability::Bridging, false));
        let err = Interface::create_with(host, InterfaceConfig::bridged("en0")).unwrap_err();
        assert!(matches!(err, VmnetError::ApiNotSupported(_)));
    }

    #[test]
    fn test_bridged_unknown_interface() {
        let host = Arc::new(SimulatedHost::new().with_bridge_interfaces(["en0"]));
        assert!(Interface::create_with(host.clone(), InterfaceConfig::bridged("en0")).is_ok());
        let err = Interface::create_with(host, InterfaceConfig::bridged("en7")).unwrap_err();
        assert!(err.is_native(ErrorKind::InvalidArgument));
    }

    #[test]
    fn test_list_bridge_eligible_interfaces() {
        let host = SimulatedHost::new().with_bridge_interfaces(["en0", "en1"]);
        assert_eq!(
            list_bridge_eligible_interfaces(&host).unwrap(),
            vec!["en0".to_string(), "en1".to_string()]
        );

        let old = SimulatedHost::new().with_capability(Capability::Bridging, false);
        assert!(matches!(
            list_bridge_eligible_interfaces(&old),
            Err(VmnetError::ApiNotSupported(_))
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let host = sim();
        let iface = Interface::create_with(host.clone(), InterfaceConfig::shared()).unwrap();
        let port = host.port(iface.uuid()).unwrap();

        iface.stop().unwrap();
        iface.stop().unwrap();
        assert!(!iface.is_running());
        assert!(port.is_stopped());
    }

    #[test]
    fn test_drop_stops_interface() {
        let host = sim();
        let iface = Interface::create_with(host.clone(), InterfaceConfig::shared()).unwrap();
        let port = host.port(iface.uuid()).unwrap();

        drop(iface);
        assert!(port.is_stopped());
    }

    /// Host whose first stop command is rejected outright.
    struct RefusesFirstStop {
        stops: Arc<AtomicUsize>,
    }

    struct RefusingNative {
        stops: Arc<AtomicUsize>,
    }

    impl HostService for RefusesFirstStop {
        fn supports(&self, _capability: Capability) -> bool {
            true
        }

        fn is_privileged(&self) -> bool {
            true
        }

        fn start_interface(
            &self,
            _desc: &InterfaceDescriptor,
            done: Completer<StartResult>,
        ) -> std::result::Result<Box<dyn NativeInterface>, Status> {
            done.complete(Ok(InterfaceParams {
                mac: [0x02, 0, 0, 0, 0, 1],
                mtu: 1500,
                max_packet_size: 1518,
            }));
            Ok(Box::new(RefusingNative {
                stops: Arc::clone(&self.stops),
            }))
        }

        fn shared_interface_names(&self) -> std::result::Result<Vec<String>, Status> {
            Ok(Vec::new())
        }
    }

    impl NativeInterface for RefusingNative {
        fn set_event_callback(&self, _callback: EventCallback) -> std::result::Result<(), Status> {
            Ok(())
        }

        fn read(&self, _buf: &mut [u8]) -> isize {
            0
        }

        fn write(&self, buf: &[u8]) -> isize {
            isize::try_from(buf.len()).unwrap()
        }

        fn add_port_forwarding_rule(
            &self,
            _rule: Rule,
            done: Completer<Status>,
        ) -> std::result::Result<(), Status> {
            done.complete(VMNET_SUCCESS);
            Ok(())
        }

        fn remove_port_forwarding_rule(
            &self,
            _proto: Proto,
            _external_port: u16,
            done: Completer<Status>,
        ) -> std::result::Result<(), Status> {
            done.complete(VMNET_SUCCESS);
            Ok(())
        }

        fn port_forwarding_rules(&self) -> std::result::Result<Vec<Rule>, Status> {
            Ok(Vec::new())
        }

        fn stop(&self, done: Completer<Status>) -> std::result::Result<(), Status> {
            if self.stops.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(VMNET_FAILURE);
            }
            done.complete(VMNET_SUCCESS);
            Ok(())
        }
    }

    #[test]
    fn test_refused_stop_can_be_retried() {
        let stops = Arc::new(AtomicUsize::new(0));
        let host = Arc::new(RefusesFirstStop {
            stops: Arc::clone(&stops),
        });
        let iface = Interface::create_with(host, InterfaceConfig::shared()).unwrap();
        iface.install_event_bridge().unwrap();

        let err = iface.stop().unwrap_err();
        assert!(err.is_native(ErrorKind::Failure));
        assert!(iface.is_running());
        assert!(!iface.events().is_closed());

        iface.stop().unwrap();
        assert!(!iface.is_running());
        assert!(iface.events().is_closed());
        assert_eq!(stops.load(Ordering::SeqCst), 2);

        // Already stopped: neither a third call nor drop reaches the host.
        iface.stop().unwrap();
        drop(iface);
        assert_eq!(stops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stop_wakes_waiting_thread() {
        let iface = Arc::new(Interface::create_with(sim(), InterfaceConfig::shared()).unwrap());
        iface.install_event_bridge().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = {
            let iface = Arc::clone(&iface);
            std::thread::spawn(move || tx.send(iface.wait_for_packets()).unwrap())
        };

        std::thread::sleep(std::time::Duration::from_millis(30));
        iface.stop().unwrap();

        let result = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("waiter still parked after stop");
        assert!(matches!(result, Err(VmnetError::Stopped)));
        waiter.join().unwrap();
    }

    #[test]
    fn test_event_bridge_install_once() {
        let iface = Interface::create_with(sim(), InterfaceConfig::shared()).unwrap();
        assert!(matches!(
            iface.wait_for_packets(),
            Err(VmnetError::EventsNotInstalled)
        ));

        iface.install_event_bridge().unwrap();
        assert!(matches!(
            iface.install_event_bridge(),
            Err(VmnetError::EventsAlreadyInstalled)
        ));
    }

    #[test]
    fn test_operations_after_stop() {
        let iface = Interface::create_with(sim(), InterfaceConfig::shared()).unwrap();
        iface.stop().unwrap();
        assert!(matches!(
            iface.install_event_bridge(),
            Err(VmnetError::Stopped)
        ));
        assert!(matches!(iface.wait_for_packets(), Err(VmnetError::Stopped)));
    }
}
