//! Executable memory management using mmap.
//!
//! This module is the only place that writes to code after it has become
//! executable. Everything above it works on plain byte vectors until the
//! final copy, and goes through [`ExecutableMemory::patch`] afterwards.

use std::ptr::NonNull;

/// Error type for memory operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
    /// A configured code budget would be exceeded.
    CodeCacheFull { requested: usize, limit: usize },
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::InvalidSize => write!(f, "invalid memory size"),
            MemoryError::CodeCacheFull { requested, limit } => write!(
                f,
                "code cache full ({} bytes requested, limit {})",
                requested, limit
            ),
        }
    }
}

impl std::error::Error for MemoryError {}

/// Get the page size for the current system.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

/// A block of executable memory allocated via mmap.
///
/// The memory is initially writable. Call `make_executable()` to make it
/// executable (and read-only) once the code has been copied in.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Allocate a new block of memory with the given size.
    /// The memory is initially writable but not executable.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        // Round up to page size
        let page_size = page_size();
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        let ptr = Self::mmap_alloc(aligned_size)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    /// Allocate memory using mmap.
    #[cfg(unix)]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        use std::ptr;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        // Note: This won't actually be executable on most systems
        let layout = std::alloc::Layout::from_size_align(size, page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    /// Get a pointer to the memory.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Base address of the block, as generated code sees it.
    pub fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Get the size of the allocated memory.
    pub fn size(&self) -> usize {
        self.size
    }

    /// View the whole block.
    ///
    /// The view must not be held across a call to [`patch`](Self::patch).
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Write bytes to the memory at the given offset.
    /// Returns an error if the memory is executable or if the write would overflow.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }

        if offset + data.len() > self.size {
            return Err(MemoryError::InvalidSize);
        }

        unsafe {
            let dest = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        }

        Ok(())
    }

    /// Rewrite bytes of memory that may already be executable.
    ///
    /// The affected pages are opened for writing (keeping execute permission)
    /// for the duration of the copy and then restored.
    ///
    /// # Safety
    /// The caller must serialize patches of the same block, must not hold a
    /// slice from [`bytes`](Self::bytes) across the call, and must guarantee
    /// that no thread executes the patched bytes while they change (the
    /// threads are parked at a safepoint, or the code is not yet published).
    pub unsafe fn patch(&self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if offset + data.len() > self.size {
            return Err(MemoryError::InvalidSize);
        }

        if self.executable {
            self.protect(offset, data.len(), Protection::ReadWriteExecute)?;
        }

        unsafe {
            let dest = self.ptr.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        }

        if self.executable {
            self.protect(offset, data.len(), Protection::ReadExecute)?;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn protect(&self, offset: usize, len: usize, prot: Protection) -> Result<(), MemoryError> {
        let page = page_size();
        let start = offset & !(page - 1);
        let end = (offset + len + page - 1) & !(page - 1);
        let flags = match prot {
            Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
            Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        };
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().add(start) as *mut libc::c_void,
                end - start,
                flags,
            )
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn protect(&self, _offset: usize, _len: usize, _prot: Protection) -> Result<(), MemoryError> {
        Ok(())
    }

    /// Make the memory executable (and read-only).
    /// After this call, only [`patch`](Self::patch) can change it.
    #[cfg(unix)]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }

        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };

        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }

        self.executable = true;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        self.executable = true;
        Ok(())
    }

    /// Check if the memory is executable.
    pub fn is_executable(&self) -> bool {
        self.executable
    }
}

#[derive(Clone, Copy)]
enum Protection {
    ReadExecute,
    ReadWriteExecute,
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
        }
        #[cfg(not(unix))]
        {
            if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, page_size()) {
                unsafe {
                    std::alloc::dealloc(self.ptr.as_ptr(), layout);
                }
            }
        }
    }
}

// ExecutableMemory owns its mapping; writes after publication go through
// the unsafe `patch`, whose callers provide the synchronization.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

/// The page that safepoint polls read from.
///
/// Arming (revoking read access) belongs to the safepoint mechanism; this
/// crate only needs a stable, readable address to point near polls at.
pub struct PollingPage {
    memory: ExecutableMemory,
}

impl PollingPage {
    pub fn new() -> Result<Self, MemoryError> {
        let memory = ExecutableMemory::new(page_size())?;
        Ok(Self { memory })
    }

    pub fn address(&self) -> u64 {
        self.memory.base()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_memory() {
        let mem = ExecutableMemory::new(4096).unwrap();
        assert!(mem.size() >= 4096);
        assert!(!mem.is_executable());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert_eq!(ExecutableMemory::new(0).err(), Some(MemoryError::InvalidSize));
    }

    #[test]
    fn test_write_memory() {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        let data = [0x90, 0x90, 0x90, 0x90]; // NOP instructions
        mem.write(0, &data).unwrap();
        assert_eq!(&mem.bytes()[..4], &data);
    }

    #[test]
    fn test_make_executable() {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        mem.make_executable().unwrap();
        assert!(mem.is_executable());
    }

    #[test]
    fn test_cannot_write_after_executable() {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        mem.make_executable().unwrap();
        let data = [0x90];
        assert!(mem.write(0, &data).is_err());
    }

    #[test]
    fn test_patch_after_executable() {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        mem.write(0, &[0xC3, 0xC3, 0xC3, 0xC3]).unwrap();
        mem.make_executable().unwrap();
        unsafe { mem.patch(1, &[0x90, 0x90]).unwrap() };
        assert_eq!(&mem.bytes()[..4], &[0xC3, 0x90, 0x90, 0xC3]);
        assert!(mem.is_executable());
    }

    #[test]
    fn test_patch_out_of_range() {
        let mem = ExecutableMemory::new(16).unwrap();
        let size = mem.size();
        let result = unsafe { mem.patch(size - 1, &[0, 0]) };
        assert_eq!(result, Err(MemoryError::InvalidSize));
    }

    #[test]
    fn test_polling_page_is_page_aligned() {
        let page = PollingPage::new().unwrap();
        assert_eq!(page.address() as usize % page_size(), 0);
    }
}
