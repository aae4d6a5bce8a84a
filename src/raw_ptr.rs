// newtype for HANDLE pointer

use std::ffi::c_void;

use windows_sys::Win32::Foundation::{CloseHandle, INVALID_HANDLE_VALUE};

/// Owned kernel handle, closed on drop.
pub struct OwnedHandle(*mut c_void);

impl OwnedHandle {
    /// Takes ownership of `raw`; null and `INVALID_HANDLE_VALUE` yield `None`.
    pub fn new(raw: *mut c_void) -> Option<Self> {
        if raw.is_null() || raw == INVALID_HANDLE_VALUE {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn raw(&self) -> *mut c_void {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

// Handles are process-wide.
unsafe impl Send for OwnedHandle {}
