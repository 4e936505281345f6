//! Grand Central Dispatch (GCD) queue handling.
//!
//! vmnet delivers every completion handler and event callback on a dispatch
//! queue chosen by the caller. Each interface owns one serial queue.

use std::ffi::{CString, c_char, c_void};

use objc2::runtime::AnyObject;

unsafe extern "C" {
    fn dispatch_queue_create(label: *const c_char, attr: *const c_void) -> *mut AnyObject;
    fn dispatch_release(object: *mut AnyObject);
}

/// An owned serial dispatch queue.
pub struct DispatchQueue {
    inner: *mut AnyObject,
}

// SAFETY: GCD queues are thread-safe reference-counted objects.
unsafe impl Send for DispatchQueue {}
unsafe impl Sync for DispatchQueue {}

impl DispatchQueue {
    /// Creates a new serial dispatch queue with the given label.
    ///
    /// Returns `None` if the label contains a NUL byte or GCD refuses to
    /// create the queue.
    pub fn new(label: &str) -> Option<Self> {
        let label = CString::new(label).ok()?;
        // SAFETY: a null attribute selects DISPATCH_QUEUE_SERIAL.
        let queue = unsafe { dispatch_queue_create(label.as_ptr(), std::ptr::null()) };
        (!queue.is_null()).then_some(Self { inner: queue })
    }

    /// Returns the raw queue pointer.
    pub const fn as_ptr(&self) -> *mut AnyObject {
        self.inner
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        // SAFETY: the queue was created by this wrapper and is released once.
        unsafe {
            dispatch_release(self.inner);
        }
    }
}
