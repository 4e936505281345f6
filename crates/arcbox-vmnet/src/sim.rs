//! In-process simulated host.
//!
//! [`SimulatedHost`] implements [`HostService`] without vmnet.framework. Like
//! the real service it answers commands and raises packets-available events
//! from a delivery thread the caller does not control, so every blocking path
//! in this crate runs against genuine cross-thread completions.
//!
//! The peer side of each started interface is reachable through
//! [`SimulatedHost::port`]: frames injected there show up on the interface's
//! read side, frames the interface writes can be collected with
//! [`SimPort::take_sent`].

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use uuid::Uuid;

use crate::completion::{Completer, await_once};
use crate::error::{
    VMNET_FAILURE, VMNET_INVALID_ACCESS, VMNET_INVALID_ARGUMENT, VMNET_PACKET_TOO_BIG,
    VMNET_SUCCESS, VmnetError,
};
use crate::host::{
    Capability, EventCallback, HostService, InterfaceDescriptor, InterfaceParams,
    NativeInterface, StartResult, Status,
};
use crate::interface::Mode;
use crate::rules::{Proto, Rule};

/// Default MTU reported for new interfaces.
const DEFAULT_MTU: u64 = 1500;

/// Default maximum packet size (Ethernet frame + VLAN tag).
const DEFAULT_MAX_PACKET_SIZE: usize = 1518;

type Job = Box<dyn FnOnce() + Send + 'static>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn negative(status: Status) -> isize {
    -isize::try_from(status).unwrap_or(isize::MAX)
}

/// Serial delivery context, the stand-in for a GCD dispatch queue.
struct DeliveryQueue {
    sender: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl DeliveryQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = thread::spawn(move || {
            for job in receiver {
                job();
            }
        });
        Self {
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Runs `job` on the delivery thread. Jobs run in submission order.
    fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            // A closed queue drops the job, which abandons any completer it holds.
            let _ = sender.send(Box::new(job));
        }
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

/// Shared state of one simulated interface.
struct PortState {
    max_packet_size: usize,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    outbound: Mutex<Vec<Vec<u8>>>,
    rules: Mutex<Vec<Rule>>,
    callback: Mutex<Option<EventCallback>>,
    stopped: AtomicBool,
}

/// A host service simulated in-process.
pub struct SimulatedHost {
    queue: Arc<DeliveryQueue>,
    ports: Arc<Mutex<HashMap<Uuid, Arc<PortState>>>>,
    privileged: bool,
    bridging: bool,
    port_forwarding: bool,
    bridge_interfaces: Vec<String>,
    mtu: u64,
    max_packet_size: usize,
}

impl SimulatedHost {
    /// Creates a privileged host with every capability and one wired
    /// interface, `en0`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Arc::new(DeliveryQueue::new()),
            ports: Arc::new(Mutex::new(HashMap::new())),
            privileged: true,
            bridging: true,
            port_forwarding: true,
            bridge_interfaces: vec!["en0".to_string()],
            mtu: DEFAULT_MTU,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Sets whether the calling process counts as privileged.
    ///
    /// Unprivileged hosts fail every start with the generic failure status.
    #[must_use]
    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Enables or disables a capability.
    #[must_use]
    pub fn with_capability(mut self, capability: Capability, enabled: bool) -> Self {
        match capability {
            Capability::Bridging => self.bridging = enabled,
            Capability::PortForwarding => self.port_forwarding = enabled,
        }
        self
    }

    /// Sets the wired interfaces eligible for bridging.
    #[must_use]
    pub fn with_bridge_interfaces<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bridge_interfaces = names.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the MTU and maximum packet size reported for new interfaces.
    #[must_use]
    pub fn with_packet_limits(mut self, mtu: u64, max_packet_size: usize) -> Self {
        self.mtu = mtu;
        self.max_packet_size = max_packet_size;
        self
    }

    /// Returns the peer side of the running interface started with `uuid`.
    ///
    /// A later start with the same UUID replaces the port. Stopping the
    /// interface releases it, after which this returns `None`; handles taken
    /// earlier keep working and report [`SimPort::is_stopped`].
    #[must_use]
    pub fn port(&self, uuid: Uuid) -> Option<SimPort> {
        lock(&self.ports).get(&uuid).map(|state| SimPort {
            state: Arc::clone(state),
            queue: Arc::clone(&self.queue),
        })
    }

    /// Blocks until every job queued on the delivery thread so far has run.
    pub fn flush(&self) {
        let flushed: Result<(), VmnetError> = await_once(|done| {
            self.queue.dispatch(move || done.complete(()));
            Ok(())
        });
        if let Err(e) = flushed {
            tracing::warn!(error = %e, "simulated delivery queue closed");
        }
    }

    fn validate(&self, desc: &InterfaceDescriptor) -> Result<(), Status> {
        if !self.privileged {
            return Err(VMNET_FAILURE);
        }
        if let Mode::Bridged(name) = &desc.mode {
            if !self.bridge_interfaces.contains(name) {
                return Err(VMNET_INVALID_ARGUMENT);
            }
        }
        if let Some(range) = &desc.ipv4 {
            let ordered = u32::from(range.start) <= u32::from(range.end);
            if !range.start.is_private() || !range.end.is_private() || !ordered {
                return Err(VMNET_INVALID_ARGUMENT);
            }
        }
        Ok(())
    }
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimulatedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedHost")
            .field("privileged", &self.privileged)
            .field("bridging", &self.bridging)
            .field("port_forwarding", &self.port_forwarding)
            .field("bridge_interfaces", &self.bridge_interfaces)
            .finish_non_exhaustive()
    }
}

/// Derives a stable, locally administered unicast MAC from an interface UUID.
fn mac_for(uuid: &Uuid) -> [u8; 6] {
    let bytes = uuid.as_bytes();
    let mut mac = [0u8; 6];
    for (i, byte) in mac.iter_mut().enumerate() {
        *byte = bytes[i] ^ bytes[i + 8];
    }
    mac[0] = (mac[0] & 0xFC) | 0x02;
    mac
}

impl HostService for SimulatedHost {
    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Bridging => self.bridging,
            Capability::PortForwarding => self.port_forwarding,
        }
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn start_interface(
        &self,
        desc: &InterfaceDescriptor,
        done: Completer<StartResult>,
    ) -> Result<Box<dyn NativeInterface>, Status> {
        let state = Arc::new(PortState {
            max_packet_size: self.max_packet_size,
            inbound: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        let result = self.validate(desc).map(|()| InterfaceParams {
            mac: mac_for(&desc.uuid),
            mtu: self.mtu,
            max_packet_size: self.max_packet_size,
        });
        if result.is_ok() {
            lock(&self.ports).insert(desc.uuid, Arc::clone(&state));
        }

        tracing::trace!(label = %desc.label, ok = result.is_ok(), "simulated start");
        self.queue.dispatch(move || done.complete(result));

        Ok(Box::new(SimInterface {
            uuid: desc.uuid,
            state,
            ports: Arc::clone(&self.ports),
            queue: Arc::clone(&self.queue),
        }))
    }

    fn shared_interface_names(&self) -> Result<Vec<String>, Status> {
        Ok(self.bridge_interfaces.clone())
    }
}

/// Native side of a simulated interface.
struct SimInterface {
    uuid: Uuid,
    state: Arc<PortState>,
    ports: Arc<Mutex<HashMap<Uuid, Arc<PortState>>>>,
    queue: Arc<DeliveryQueue>,
}

impl SimInterface {
    fn acknowledge(&self, done: Completer<Status>, status: Status) {
        self.queue.dispatch(move || done.complete(status));
    }
}

impl NativeInterface for SimInterface {
    fn set_event_callback(&self, callback: EventCallback) -> Result<(), Status> {
        if self.state.stopped.load(Ordering::Acquire) {
            return Err(VMNET_INVALID_ACCESS);
        }
        *lock(&self.state.callback) = Some(callback);
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> isize {
        if self.state.stopped.load(Ordering::Acquire) {
            return negative(VMNET_INVALID_ACCESS);
        }
        let mut inbound = lock(&self.state.inbound);
        let Some(frame) = inbound.pop_front() else {
            return 0;
        };
        if frame.len() > buf.len() {
            inbound.push_front(frame);
            return negative(VMNET_INVALID_ARGUMENT);
        }
        buf[..frame.len()].copy_from_slice(&frame);
        isize::try_from(frame.len()).unwrap_or(isize::MAX)
    }

    fn write(&self, buf: &[u8]) -> isize {
        if self.state.stopped.load(Ordering::Acquire) {
            return negative(VMNET_INVALID_ACCESS);
        }
        if buf.len() > self.state.max_packet_size {
            return negative(VMNET_PACKET_TOO_BIG);
        }
        lock(&self.state.outbound).push(buf.to_vec());
        isize::try_from(buf.len()).unwrap_or(isize::MAX)
    }

    fn add_port_forwarding_rule(
        &self,
        rule: Rule,
        done: Completer<Status>,
    ) -> Result<(), Status> {
        let mut rules = lock(&self.state.rules);
        // Duplicate keys overwrite in place.
        match rules.iter_mut().find(|r| r.key() == rule.key()) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
        drop(rules);
        self.acknowledge(done, VMNET_SUCCESS);
        Ok(())
    }

    fn remove_port_forwarding_rule(
        &self,
        proto: Proto,
        external_port: u16,
        done: Completer<Status>,
    ) -> Result<(), Status> {
        let mut rules = lock(&self.state.rules);
        let before = rules.len();
        rules.retain(|r| r.key() != (proto, external_port));
        let status = if rules.len() < before {
            VMNET_SUCCESS
        } else {
            VMNET_INVALID_ARGUMENT
        };
        drop(rules);
        self.acknowledge(done, status);
        Ok(())
    }

    fn port_forwarding_rules(&self) -> Result<Vec<Rule>, Status> {
        Ok(lock(&self.state.rules).clone())
    }

    fn stop(&self, done: Completer<Status>) -> Result<(), Status> {
        if self.state.stopped.swap(true, Ordering::AcqRel) {
            return Err(VMNET_INVALID_ACCESS);
        }
        lock(&self.state.callback).take();

        // Only release the entry if a later start has not replaced it.
        let mut ports = lock(&self.ports);
        if ports
            .get(&self.uuid)
            .is_some_and(|state| Arc::ptr_eq(state, &self.state))
        {
            ports.remove(&self.uuid);
        }
        drop(ports);

        self.acknowledge(done, VMNET_SUCCESS);
        Ok(())
    }
}

/// Peer side of a simulated interface.
#[derive(Clone)]
pub struct SimPort {
    state: Arc<PortState>,
    queue: Arc<DeliveryQueue>,
}

impl SimPort {
    /// Queues an inbound frame and raises a packets-available event.
    pub fn inject(&self, frame: impl Into<Vec<u8>>) {
        lock(&self.state.inbound).push_back(frame.into());
        let callback = lock(&self.state.callback).clone();
        if let Some(callback) = callback {
            self.queue.dispatch(move || callback());
        }
    }

    /// Drains the frames written by the interface so far.
    #[must_use]
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *lock(&self.state.outbound))
    }

    /// Returns the number of inbound frames not yet read.
    #[must_use]
    pub fn queued(&self) -> usize {
        lock(&self.state.inbound).len()
    }

    /// Returns true once the interface has been stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SimPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimPort")
            .field("queued", &self.queued())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
