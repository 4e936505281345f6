//! vmnet.framework FFI bindings.
//!
//! Low-level declarations for Apple's vmnet.framework and the libxpc calls
//! used to build interface descriptors and read back interface parameters.
//!
//! # Architecture
//!
//! vmnet uses Grand Central Dispatch (GCD) for asynchronous operations. All
//! completion handlers and event callbacks are Objective-C blocks delivered
//! on the dispatch queue passed alongside them.
//!
//! Port forwarding and the shared-interface list appeared in macOS 10.15. They
//! are resolved at runtime through `dlsym` so that hosts without them report
//! the capability as missing instead of failing to load the binary.
//!
//! # References
//!
//! - Apple vmnet documentation: https://developer.apple.com/documentation/vmnet
//! - lima-vm/socket_vmnet: https://github.com/lima-vm/socket_vmnet

#![allow(non_camel_case_types, non_upper_case_globals)]

use std::ffi::{CStr, c_char, c_int, c_void};
use std::sync::OnceLock;

use block2::Block;
use objc2::runtime::AnyObject;

/// vmnet interface handle (opaque pointer).
pub type interface_ref = *mut c_void;

/// XPC object (opaque pointer).
pub type xpc_object_t = *mut c_void;

/// vmnet return status.
pub type vmnet_return_t = u32;

/// Interface event mask.
pub type interface_event_t = u32;

/// Packets are available for reading.
pub const VMNET_INTERFACE_PACKETS_AVAILABLE: interface_event_t = 1 << 0;

/// Host mode (isolated network between VMs and host).
pub const VMNET_HOST_MODE: u64 = 1000;
/// Shared mode (NAT with host network).
pub const VMNET_SHARED_MODE: u64 = 1001;
/// Bridged mode (direct access to physical network).
pub const VMNET_BRIDGED_MODE: u64 = 1002;

/// IO vector for scatter-gather I/O.
#[repr(C)]
#[derive(Debug)]
pub struct iovec {
    /// Pointer to data.
    pub iov_base: *mut c_void,
    /// Length of data.
    pub iov_len: usize,
}

/// Packet descriptor for vmnet read/write operations.
#[repr(C)]
#[derive(Debug)]
pub struct vmpktdesc {
    /// Packet size in bytes.
    pub vm_pkt_size: usize,
    /// Pointer to the iovec array.
    pub vm_pkt_iov: *mut iovec,
    /// Number of iovec entries.
    pub vm_pkt_iovcnt: u32,
    /// Flags.
    pub vm_flags: u32,
}

/// IPv4 address in network byte order.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct in_addr {
    /// Address bits, network byte order.
    pub s_addr: u32,
}

/// Completion handler taking only a status.
pub type CompletionBlock = Block<dyn Fn(vmnet_return_t)>;
/// Start handler receiving the status and the interface parameters.
pub type StartBlock = Block<dyn Fn(vmnet_return_t, xpc_object_t)>;
/// Event callback receiving the event mask and the event dictionary.
pub type EventBlock = Block<dyn Fn(interface_event_t, xpc_object_t)>;
/// Rule listing handler receiving an XPC array of rules.
pub type RulesBlock = Block<dyn Fn(xpc_object_t)>;

#[link(name = "vmnet", kind = "framework")]
unsafe extern "C" {
    pub fn vmnet_start_interface(
        interface_desc: xpc_object_t,
        queue: *mut AnyObject,
        handler: &StartBlock,
    ) -> interface_ref;

    pub fn vmnet_stop_interface(
        interface: interface_ref,
        queue: *mut AnyObject,
        handler: &CompletionBlock,
    ) -> vmnet_return_t;

    pub fn vmnet_interface_set_event_callback(
        interface: interface_ref,
        event_mask: interface_event_t,
        queue: *mut AnyObject,
        callback: Option<&EventBlock>,
    ) -> vmnet_return_t;

    pub fn vmnet_read(
        interface: interface_ref,
        packets: *mut vmpktdesc,
        pktcnt: *mut c_int,
    ) -> vmnet_return_t;

    pub fn vmnet_write(
        interface: interface_ref,
        packets: *mut vmpktdesc,
        pktcnt: *mut c_int,
    ) -> vmnet_return_t;

    pub static vmnet_operation_mode_key: *const c_char;
    pub static vmnet_interface_id_key: *const c_char;
    pub static vmnet_mac_address_key: *const c_char;
    pub static vmnet_mtu_key: *const c_char;
    pub static vmnet_max_packet_size_key: *const c_char;
}

// libxpc lives in libSystem.
#[link(name = "System")]
unsafe extern "C" {
    pub fn xpc_dictionary_create(
        keys: *const *const c_char,
        values: *const xpc_object_t,
        count: usize,
    ) -> xpc_object_t;
    pub fn xpc_dictionary_set_uint64(xdict: xpc_object_t, key: *const c_char, value: u64);
    pub fn xpc_dictionary_set_string(xdict: xpc_object_t, key: *const c_char, string: *const c_char);
    pub fn xpc_dictionary_set_uuid(xdict: xpc_object_t, key: *const c_char, uuid: *const u8);
    pub fn xpc_dictionary_get_string(xdict: xpc_object_t, key: *const c_char) -> *const c_char;
    pub fn xpc_dictionary_get_uint64(xdict: xpc_object_t, key: *const c_char) -> u64;
    pub fn xpc_array_get_count(xarray: xpc_object_t) -> usize;
    pub fn xpc_array_get_string(xarray: xpc_object_t, index: usize) -> *const c_char;
    pub fn xpc_array_get_value(xarray: xpc_object_t, index: usize) -> xpc_object_t;
    pub fn xpc_release(object: xpc_object_t);
}

type AddRuleFn = unsafe extern "C" fn(
    interface_ref,
    u8,
    u16,
    *const in_addr,
    u16,
    &CompletionBlock,
) -> vmnet_return_t;

type RemoveRuleFn =
    unsafe extern "C" fn(interface_ref, u8, u16, &CompletionBlock) -> vmnet_return_t;

type GetRulesFn = unsafe extern "C" fn(interface_ref, &RulesBlock) -> vmnet_return_t;

type RuleDetailsFn =
    unsafe extern "C" fn(xpc_object_t, *mut u8, *mut u16, *mut in_addr, *mut u16);

type CopySharedListFn = unsafe extern "C" fn() -> xpc_object_t;

/// vmnet entry points that only exist on newer hosts.
pub struct OptionalApi {
    pub add_rule: Option<AddRuleFn>,
    pub remove_rule: Option<RemoveRuleFn>,
    pub get_rules: Option<GetRulesFn>,
    pub rule_details: Option<RuleDetailsFn>,
    pub copy_shared_interface_list: Option<CopySharedListFn>,
    pub shared_interface_name_key: Option<*const c_char>,
    pub start_address_key: Option<*const c_char>,
    pub end_address_key: Option<*const c_char>,
    pub subnet_mask_key: Option<*const c_char>,
}

// SAFETY: every field is a function pointer or a pointer to an immutable
// framework constant.
unsafe impl Send for OptionalApi {}
unsafe impl Sync for OptionalApi {}

impl OptionalApi {
    /// Returns true if all port-forwarding entry points are present.
    pub const fn has_port_forwarding(&self) -> bool {
        self.add_rule.is_some()
            && self.remove_rule.is_some()
            && self.get_rules.is_some()
            && self.rule_details.is_some()
    }

    /// Returns true if bridged mode can be configured.
    pub const fn has_bridging(&self) -> bool {
        self.copy_shared_interface_list.is_some() && self.shared_interface_name_key.is_some()
    }
}

fn symbol(name: &CStr) -> Option<*mut c_void> {
    // SAFETY: dlsym with RTLD_DEFAULT searches every loaded image.
    let ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    (!ptr.is_null()).then_some(ptr)
}

/// Resolves a `const char *const` framework key.
fn key(name: &CStr) -> Option<*const c_char> {
    // SAFETY: vmnet exports its keys as `const char *const` globals.
    symbol(name).map(|ptr| unsafe { *ptr.cast::<*const c_char>() })
}

/// Returns the optional vmnet entry points of the running host.
pub fn optional_api() -> &'static OptionalApi {
    static API: OnceLock<OptionalApi> = OnceLock::new();
    // SAFETY: each symbol is transmuted to the signature vmnet.h declares.
    API.get_or_init(|| unsafe {
        OptionalApi {
            add_rule: symbol(c"vmnet_interface_add_ip_port_forwarding_rule")
                .map(|ptr| std::mem::transmute::<*mut c_void, AddRuleFn>(ptr)),
            remove_rule: symbol(c"vmnet_interface_remove_ip_port_forwarding_rule")
                .map(|ptr| std::mem::transmute::<*mut c_void, RemoveRuleFn>(ptr)),
            get_rules: symbol(c"vmnet_interface_get_ip_port_forwarding_rules")
                .map(|ptr| std::mem::transmute::<*mut c_void, GetRulesFn>(ptr)),
            rule_details: symbol(c"vmnet_ip_port_forwarding_rule_get_details")
                .map(|ptr| std::mem::transmute::<*mut c_void, RuleDetailsFn>(ptr)),
            copy_shared_interface_list: symbol(c"vmnet_copy_shared_interface_list")
                .map(|ptr| std::mem::transmute::<*mut c_void, CopySharedListFn>(ptr)),
            shared_interface_name_key: key(c"vmnet_shared_interface_name_key"),
            start_address_key: key(c"vmnet_start_address_key"),
            end_address_key: key(c"vmnet_end_address_key"),
            subnet_mask_key: key(c"vmnet_subnet_mask_key"),
        }
    })
}
