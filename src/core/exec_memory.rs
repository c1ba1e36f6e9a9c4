//! Executable memory regions.
//!
//! Lifecycle: `reserve` maps anonymous read/write pages, `write` copies machine
//! code in (at most once), `make_executable` synchronizes the instruction cache
//! and flips the pages to read/execute. The region is unmapped on drop. After
//! `make_executable` the bytes are never written again.

use std::io;
use std::ptr::NonNull;

pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    capacity: usize,
    len: usize,
    executable: bool,
}

// The mapping is owned exclusively and immutable once executable.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

impl ExecutableMemory {
    /// Maps at least `size` bytes, rounded up to whole pages.
    pub fn reserve(size: usize) -> io::Result<Self> {
        let page = page_size();
        let capacity = size.max(1).div_ceil(page) * page;
        let ptr = map_region(capacity)?;
        log::trace!("mapped {capacity} bytes at {:#x}", ptr.as_ptr() as usize);
        Ok(ExecutableMemory {
            ptr,
            capacity,
            len: 0,
            executable: false,
        })
    }

    /// Address code is assembled for.
    pub fn address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn write(&mut self, code: &[u8]) -> io::Result<()> {
        if self.executable || self.len != 0 {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "region already holds code",
            ));
        }
        if code.len() > self.capacity {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} bytes of code exceed a {} byte region", code.len(), self.capacity),
            ));
        }
        write_code(self.ptr.as_ptr(), code)?;
        self.len = code.len();
        Ok(())
    }

    pub fn make_executable(&mut self) -> io::Result<()> {
        if !self.executable {
            protect_executable(self.ptr.as_ptr(), self.capacity)?;
            self.executable = true;
        }
        Ok(())
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        if let Err(e) = unmap_region(self.ptr.as_ptr(), self.capacity) {
            log::warn!("failed to unmap code region: {e}");
        }
    }
}

impl std::fmt::Debug for ExecutableMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableMemory")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("executable", &self.executable)
            .finish()
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn map_region(len: usize) -> io::Result<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
}

#[cfg(target_os = "macos")]
fn map_region(len: usize) -> io::Result<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_JIT,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "macos"
)))]
fn map_region(_len: usize) -> io::Result<NonNull<u8>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "executable memory is not supported on this platform",
    ))
}

#[cfg(unix)]
fn unmap_region(ptr: *mut u8, len: usize) -> io::Result<()> {
    let rc = unsafe { libc::munmap(ptr as *mut libc::c_void, len) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn unmap_region(_ptr: *mut u8, _len: usize) -> io::Result<()> {
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn write_code(ptr: *mut u8, code: &[u8]) -> io::Result<()> {
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
    }
    flush_icache(ptr, code.len());
    Ok(())
}

#[cfg(target_os = "macos")]
fn write_code(ptr: *mut u8, code: &[u8]) -> io::Result<()> {
    unsafe {
        let toggle = pthread_jit_write_protect_supported_np() != 0;
        if toggle {
            pthread_jit_write_protect_np(0);
        }
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        sys_icache_invalidate(ptr as *mut libc::c_void, code.len());
        if toggle {
            pthread_jit_write_protect_np(1);
        }
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn protect_executable(ptr: *mut u8, len: usize) -> io::Result<()> {
    let rc = unsafe { libc::mprotect(ptr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_EXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn protect_executable(_ptr: *mut u8, _len: usize) -> io::Result<()> {
    Ok(())
}

#[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_os = "android")))]
fn flush_icache(ptr: *mut u8, len: usize) {
    unsafe {
        __clear_cache(ptr as *mut libc::c_char, ptr.add(len) as *mut libc::c_char);
    }
}

#[cfg(not(all(target_arch = "aarch64", any(target_os = "linux", target_os = "android"))))]
fn flush_icache(_ptr: *mut u8, _len: usize) {}

#[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_os = "android")))]
extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(target_os = "macos")]
extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}
