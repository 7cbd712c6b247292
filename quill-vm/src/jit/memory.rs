// quill-vm - Bytecode compiler and virtual machine for the Quill scripting language
// Copyright (c) 2025 Quill contributors. MIT licensed.

//! Executable memory for JIT output.
//!
//! Pages are mapped read-write, filled once, then flipped to
//! read-execute. The mapping is never writable and executable at the
//! same time, and is unmapped when the owning [`ExecBuffer`] drops.

/// An immutable, executable code buffer.
pub struct ExecBuffer {
    ptr: *mut u8,
    len: usize,
}

impl ExecBuffer {
    /// Map, fill and seal a buffer. Returns `None` if the kernel
    /// refuses either the mapping or the protection flip.
    pub fn new(code: &[u8]) -> Option<ExecBuffer> {
        if code.is_empty() {
            return None;
        }
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = code.len().div_ceil(page) * page;

        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return None;
            }
            let ptr = ptr as *mut u8;
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());

            if libc::mprotect(ptr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_EXEC)
                != 0
            {
                libc::munmap(ptr as *mut libc::c_void, len);
                return None;
            }
            Some(ExecBuffer { ptr, len })
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

impl std::fmt::Debug for ExecBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExecBuffer({} bytes at {:p})", self.len, self.ptr)
    }
}
