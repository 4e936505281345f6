//! vmnet.framework host service.
//!
//! [`VmnetFramework`] implements [`HostService`] on top of Apple's
//! vmnet.framework. Every started interface gets its own serial dispatch
//! queue; completion handlers and packet events arrive there.
//!
//! Creating interfaces requires root privileges or the
//! `com.apple.vm.networking` entitlement.

use std::ffi::{CStr, CString, c_char, c_int};
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError};

use block2::RcBlock;

use super::dispatch::DispatchQueue;
use super::ffi::{self, in_addr, interface_ref, xpc_object_t};
use crate::completion::{Completer, await_once};
use crate::error::{
    ErrorKind, VMNET_FAILURE, VMNET_INVALID_ARGUMENT, VMNET_SUCCESS, VmnetError, classify,
};
use crate::host::{
    Capability, EventCallback, HostService, InterfaceDescriptor, InterfaceParams, NativeInterface,
    StartResult, Status,
};
use crate::interface::{Mode, parse_mac};
use crate::rules::{Proto, Rule};

/// Wraps a completer so it can be fired from an `Fn` block exactly once.
struct Once<T>(Mutex<Option<Completer<T>>>);

impl<T> Once<T> {
    fn new(done: Completer<T>) -> Self {
        Self(Mutex::new(Some(done)))
    }

    fn complete(&self, value: T) {
        let done = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(done) = done {
            done.complete(value);
        }
    }
}

/// An owned XPC object, released on drop.
struct XpcObject(xpc_object_t);

impl XpcObject {
    fn empty_dictionary() -> Result<Self, Status> {
        // SAFETY: creating an empty dictionary has no preconditions.
        let dict = unsafe { ffi::xpc_dictionary_create(std::ptr::null(), std::ptr::null(), 0) };
        if dict.is_null() {
            Err(VMNET_FAILURE)
        } else {
            Ok(Self(dict))
        }
    }

    fn set_uint64(&self, key: *const c_char, value: u64) {
        // SAFETY: self.0 is a live dictionary and key a framework constant.
        unsafe { ffi::xpc_dictionary_set_uint64(self.0, key, value) }
    }

    fn set_string(&self, key: Option<*const c_char>, value: &str) -> Result<(), Status> {
        let key = key.ok_or(VMNET_INVALID_ARGUMENT)?;
        let value = CString::new(value).map_err(|_| VMNET_INVALID_ARGUMENT)?;
        // SAFETY: the dictionary copies the string.
        unsafe { ffi::xpc_dictionary_set_string(self.0, key, value.as_ptr()) }
        Ok(())
    }
}

impl Drop for XpcObject {
    fn drop(&mut self) {
        // SAFETY: the object was created by this wrapper and is released once.
        unsafe { ffi::xpc_release(self.0) }
    }
}

fn copy_string(ptr: *const c_char) -> Option<String> {
    // SAFETY: xpc returns NUL-terminated strings owned by the container.
    (!ptr.is_null()).then(|| unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

fn build_descriptor(desc: &InterfaceDescriptor) -> Result<XpcObject, Status> {
    let api = ffi::optional_api();
    let dict = XpcObject::empty_dictionary()?;

    // SAFETY: the keys are framework constants.
    let (mode_key, id_key) = unsafe { (ffi::vmnet_operation_mode_key, ffi::vmnet_interface_id_key) };

    let mode = match &desc.mode {
        Mode::Host => ffi::VMNET_HOST_MODE,
        Mode::Shared => ffi::VMNET_SHARED_MODE,
        Mode::Bridged(interface) => {
            dict.set_string(api.shared_interface_name_key, interface)?;
            ffi::VMNET_BRIDGED_MODE
        }
    };
    dict.set_uint64(mode_key, mode);

    // SAFETY: the dictionary copies the 16 UUID bytes.
    unsafe { ffi::xpc_dictionary_set_uuid(dict.0, id_key, desc.uuid.as_bytes().as_ptr()) };

    if let Some(range) = &desc.ipv4 {
        dict.set_string(api.start_address_key, &range.start.to_string())?;
        dict.set_string(api.end_address_key, &range.end.to_string())?;
        dict.set_string(api.subnet_mask_key, &range.netmask.to_string())?;
    }

    Ok(dict)
}

/// Reads the resolved attributes out of a start handler's parameter dictionary.
fn read_params(params: xpc_object_t) -> StartResult {
    if params.is_null() {
        return Err(VMNET_FAILURE);
    }

    // SAFETY: params is the live dictionary passed to the start handler and
    // the keys are framework constants.
    let (mac, mtu, max_packet_size) = unsafe {
        (
            copy_string(ffi::xpc_dictionary_get_string(params, ffi::vmnet_mac_address_key)),
            ffi::xpc_dictionary_get_uint64(params, ffi::vmnet_mtu_key),
            ffi::xpc_dictionary_get_uint64(params, ffi::vmnet_max_packet_size_key),
        )
    };

    let mac = mac
        .and_then(|mac| parse_mac(&mac).ok())
        .ok_or(VMNET_FAILURE)?;
    let max_packet_size = usize::try_from(max_packet_size).map_err(|_| VMNET_FAILURE)?;

    Ok(InterfaceParams {
        mac,
        mtu,
        max_packet_size,
    })
}

/// Maps a native status to the signed transfer convention.
fn negated(status: Status) -> isize {
    -isize::try_from(status).unwrap_or(isize::MAX)
}

fn byte_count(len: usize) -> isize {
    isize::try_from(len).unwrap_or(isize::MAX)
}

/// vmnet.framework as a [`HostService`].
#[derive(Debug, Default, Clone, Copy)]
pub struct VmnetFramework;

impl VmnetFramework {
    /// Creates the service.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl HostService for VmnetFramework {
    fn supports(&self, capability: Capability) -> bool {
        let api = ffi::optional_api();
        match capability {
            Capability::Bridging => api.has_bridging(),
            Capability::PortForwarding => api.has_port_forwarding(),
        }
    }

    fn start_interface(
        &self,
        desc: &InterfaceDescriptor,
        done: Completer<StartResult>,
    ) -> Result<Box<dyn NativeInterface>, Status> {
        let queue = DispatchQueue::new(&format!("com.arcbox.vmnet.{}", desc.label))
            .ok_or(VMNET_FAILURE)?;
        let dict = build_descriptor(desc)?;

        let done = Once::new(done);
        let handler = RcBlock::new(move |status: u32, params: xpc_object_t| {
            let result = if status == VMNET_SUCCESS {
                read_params(params)
            } else {
                Err(status)
            };
            done.complete(result);
        });

        // SAFETY: vmnet copies the descriptor and the block before returning.
        let iface = unsafe { ffi::vmnet_start_interface(dict.0, queue.as_ptr(), &handler) };
        if iface.is_null() {
            tracing::warn!(label = %desc.label, "vmnet_start_interface returned no interface");
            return Err(VMNET_FAILURE);
        }

        Ok(Box::new(DarwinInterface { iface, queue }))
    }

    fn shared_interface_names(&self) -> Result<Vec<String>, Status> {
        let copy = ffi::optional_api()
            .copy_shared_interface_list
            .ok_or(VMNET_FAILURE)?;

        // SAFETY: the returned array is owned by the caller.
        let list = unsafe { copy() };
        if list.is_null() {
            return Err(VMNET_FAILURE);
        }
        let list = XpcObject(list);

        // SAFETY: list is a live XPC array of strings.
        let count = unsafe { ffi::xpc_array_get_count(list.0) };
        Ok((0..count)
            .filter_map(|i| copy_string(unsafe { ffi::xpc_array_get_string(list.0, i) }))
            .collect())
    }
}

/// A started vmnet interface.
struct DarwinInterface {
    iface: interface_ref,
    queue: DispatchQueue,
}

// SAFETY: vmnet interface references may be used from any thread.
unsafe impl Send for DarwinInterface {}
unsafe impl Sync for DarwinInterface {}

impl DarwinInterface {
    fn transfer(
        &self,
        base: *mut u8,
        len: usize,
        op: unsafe extern "C" fn(interface_ref, *mut ffi::vmpktdesc, *mut c_int) -> u32,
    ) -> isize {
        let mut iov = ffi::iovec {
            iov_base: base.cast(),
            iov_len: len,
        };
        let mut pkt = ffi::vmpktdesc {
            vm_pkt_size: len,
            vm_pkt_iov: &raw mut iov,
            vm_pkt_iovcnt: 1,
            vm_flags: 0,
        };
        let mut count: c_int = 1;

        // SAFETY: iov points at `len` bytes that outlive the call.
        let status = unsafe { op(self.iface, &raw mut pkt, &raw mut count) };
        if status != VMNET_SUCCESS {
            return negated(status);
        }
        if count == 0 {
            0
        } else {
            byte_count(pkt.vm_pkt_size)
        }
    }
}

impl NativeInterface for DarwinInterface {
    fn set_event_callback(&self, callback: EventCallback) -> Result<(), Status> {
        let block = RcBlock::new(move |_event: u32, _info: xpc_object_t| callback());

        // SAFETY: vmnet copies the block.
        let status = unsafe {
            ffi::vmnet_interface_set_event_callback(
                self.iface,
                ffi::VMNET_INTERFACE_PACKETS_AVAILABLE,
                self.queue.as_ptr(),
                Some(&*block),
            )
        };
        if status == VMNET_SUCCESS {
            Ok(())
        } else {
            Err(status)
        }
    }

    fn read(&self, buf: &mut [u8]) -> isize {
        self.transfer(buf.as_mut_ptr(), buf.len(), ffi::vmnet_read)
    }

    fn write(&self, buf: &[u8]) -> isize {
        // vmnet_write only reads through the iovec.
        self.transfer(buf.as_ptr().cast_mut(), buf.len(), ffi::vmnet_write)
    }

    fn add_port_forwarding_rule(
        &self,
        rule: Rule,
        done: Completer<Status>,
    ) -> Result<(), Status> {
        let add = ffi::optional_api().add_rule.ok_or(VMNET_FAILURE)?;
        let address = in_addr {
            s_addr: u32::from(rule.internal_address).to_be(),
        };

        let done = Once::new(done);
        let handler = RcBlock::new(move |status: u32| done.complete(status));

        // SAFETY: vmnet copies the address and the block.
        let status = unsafe {
            add(
                self.iface,
                u8::from(rule.proto),
                rule.external_port,
                &raw const address,
                rule.internal_port,
                &handler,
            )
        };
        if status == VMNET_SUCCESS {
            Ok(())
        } else {
            Err(status)
        }
    }

    fn remove_port_forwarding_rule(
        &self,
        proto: Proto,
        external_port: u16,
        done: Completer<Status>,
    ) -> Result<(), Status> {
        let remove = ffi::optional_api().remove_rule.ok_or(VMNET_FAILURE)?;

        let done = Once::new(done);
        let handler = RcBlock::new(move |status: u32| done.complete(status));

        // SAFETY: vmnet copies the block.
        let status = unsafe { remove(self.iface, u8::from(proto), external_port, &handler) };
        if status == VMNET_SUCCESS {
            Ok(())
        } else {
            Err(status)
        }
    }

    fn port_forwarding_rules(&self) -> Result<Vec<Rule>, Status> {
        let api = ffi::optional_api();
        let (get, details) = api
            .get_rules
            .zip(api.rule_details)
            .ok_or(VMNET_FAILURE)?;

        let rules = await_once(|done: Completer<Vec<Rule>>| {
            let done = Once::new(done);
            let handler = RcBlock::new(move |list: xpc_object_t| {
                let mut rules = Vec::new();
                // SAFETY: list is the live rule array passed to the handler.
                let count = if list.is_null() {
                    0
                } else {
                    unsafe { ffi::xpc_array_get_count(list) }
                };
                for i in 0..count {
                    let (mut proto, mut external, mut internal) = (0u8, 0u16, 0u16);
                    let mut address = in_addr { s_addr: 0 };
                    // SAFETY: each element is a rule object owned by the array.
                    unsafe {
                        let rule = ffi::xpc_array_get_value(list, i);
                        details(
                            rule,
                            &raw mut proto,
                            &raw mut external,
                            &raw mut address,
                            &raw mut internal,
                        );
                    }
                    rules.push(Rule::new(
                        proto,
                        external,
                        Ipv4Addr::from(u32::from_be(address.s_addr)),
                        internal,
                    ));
                }
                done.complete(rules);
            });

            // SAFETY: vmnet copies the block.
            let status = unsafe { get(self.iface, &handler) };
            if status == VMNET_SUCCESS {
                Ok(())
            } else {
                Err(VmnetError::Native(classify(status)))
            }
        });

        rules.map_err(|e| e.native_kind().map_or(VMNET_FAILURE, ErrorKind::code))
    }

    fn stop(&self, done: Completer<Status>) -> Result<(), Status> {
        // Unregister first so no event block runs against a stopping interface.
        // SAFETY: a null queue and block clear the callback.
        let cleared = unsafe {
            ffi::vmnet_interface_set_event_callback(
                self.iface,
                ffi::VMNET_INTERFACE_PACKETS_AVAILABLE,
                std::ptr::null_mut(),
                None,
            )
        };
        if cleared != VMNET_SUCCESS {
            tracing::debug!(status = cleared, "failed to clear vmnet event callback");
        }

        let done = Once::new(done);
        let handler = RcBlock::new(move |status: u32| done.complete(status));

        // SAFETY: vmnet copies the block; the interface is not used afterwards.
        let status = unsafe { ffi::vmnet_stop_interface(self.iface, self.queue.as_ptr(), &handler) };
        if status == VMNET_SUCCESS {
            Ok(())
        } else {
            Err(status)
        }
    }
}
