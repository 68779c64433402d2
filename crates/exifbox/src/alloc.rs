//! Host-side allocation indirection.
//!
//! Every buffer handed back to a caller (captured output, read-back files,
//! transformed output) and the private copy of the module image is obtained
//! through a [`HostAllocator`], so embedders control where those bytes live.
//! [`HostBuf`] owns one such allocation and returns it to the allocator that
//! produced it when dropped.

use std::{num::NonZeroUsize, ptr::NonNull, sync::Arc};

/// Allocate/free capability used for every host-visible buffer.
///
/// # Safety
///
/// `allocate` must return either `None` or a pointer to at least `size`
/// writable bytes that stays valid until passed back to `deallocate` on the
/// same allocator. `deallocate` must accept a `size` of `0` meaning "unknown",
/// because buffers adopted from foreign code do not always carry their size.
pub unsafe trait HostAllocator: Send + Sync + 'static {
    fn allocate(&self, size: NonZeroUsize) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must have been returned by [`HostAllocator::allocate`] on this
    /// allocator and not freed since. `size` is the requested size or `0`.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize);
}

pub type SharedAllocator = Arc<dyn HostAllocator>;

/// The process allocator (`malloc`/`free`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Malloc;

// SAFETY: malloc returns memory valid for `size` bytes or null, and free
// ignores the size argument.
unsafe impl HostAllocator for Malloc {
    fn allocate(&self, size: NonZeroUsize) -> Option<NonNull<u8>> {
        // SAFETY: plain FFI call with a non-zero size.
        NonNull::new(unsafe { libc::malloc(size.get()) }.cast::<u8>())
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _size: usize) {
        // SAFETY: caller guarantees `ptr` came from `malloc`.
        unsafe { libc::free(ptr.as_ptr().cast()) };
    }
}

#[must_use]
pub fn default_allocator() -> SharedAllocator {
    Arc::new(Malloc)
}

/// Bytes owned by a [`HostAllocator`].
///
/// Non-empty buffers are always followed by a NUL byte that is not counted in
/// [`HostBuf::len`], so the contents can be handed to C as a string. The
/// contents themselves may contain NUL bytes.
pub struct HostBuf {
    ptr: Option<NonNull<u8>>,
    len: usize,
    size: usize,
    alloc: SharedAllocator,
}

// SAFETY: the buffer is uniquely owned and the allocator is `Send + Sync`.
unsafe impl Send for HostBuf {}
// SAFETY: shared access only hands out `&[u8]`.
unsafe impl Sync for HostBuf {}

impl HostBuf {
    #[must_use]
    pub fn empty(alloc: &SharedAllocator) -> Self {
        Self {
            ptr: None,
            len: 0,
            size: 0,
            alloc: Arc::clone(alloc),
        }
    }

    /// Allocate `len` zeroed bytes (plus the trailing NUL).
    ///
    /// Returns `None` when the allocator refuses the request.
    #[must_use]
    pub fn zeroed(alloc: &SharedAllocator, len: usize) -> Option<Self> {
        if len == 0 {
            return Some(Self::empty(alloc));
        }
        let size = NonZeroUsize::new(len.checked_add(1)?)?;
        let ptr = alloc.allocate(size)?;
        // SAFETY: `ptr` is valid for `size` bytes.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size.get()) };
        Some(Self {
            ptr: Some(ptr),
            len,
            size: size.get(),
            alloc: Arc::clone(alloc),
        })
    }

    #[must_use]
    pub fn copy_from(alloc: &SharedAllocator, bytes: &[u8]) -> Option<Self> {
        let mut buf = Self::zeroed(alloc, bytes.len())?;
        buf.as_mut_slice().copy_from_slice(bytes);
        Some(buf)
    }

    /// Adopt a buffer produced by `alloc`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc`, be valid for `len` bytes, and not be
    /// owned by anything else. `size` is the allocation size or `0` when
    /// unknown.
    #[must_use]
    pub unsafe fn from_raw_parts(
        alloc: &SharedAllocator,
        ptr: NonNull<u8>,
        len: usize,
        size: usize,
    ) -> Self {
        Self {
            ptr: Some(ptr),
            len,
            size,
            alloc: Arc::clone(alloc),
        }
    }

    /// Give up ownership; the caller must free the pointer through the same
    /// allocator. Empty buffers yield a null pointer.
    #[must_use]
    pub fn into_raw(self) -> (*mut u8, usize) {
        let this = std::mem::ManuallyDrop::new(self);
        let ptr = this.ptr.map_or(std::ptr::null_mut(), NonNull::as_ptr);
        let len = this.len;
        // SAFETY: `this` is never used again, so the allocator handle is
        // moved out exactly once.
        drop(unsafe { std::ptr::read(&this.alloc) });
        (ptr, len)
    }

    /// Shrink the visible length. Does not reallocate.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
            if let Some(ptr) = self.ptr {
                // SAFETY: `len` is within the allocation.
                unsafe { ptr.as_ptr().add(len).write(0) };
            }
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self.ptr {
            // SAFETY: `ptr` is valid for `len` initialized bytes.
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.ptr {
            // SAFETY: `ptr` is valid for `len` initialized bytes and uniquely owned.
            Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len) },
            None => &mut [],
        }
    }

    #[must_use]
    pub const fn allocator(&self) -> &SharedAllocator {
        &self.alloc
    }
}

impl Drop for HostBuf {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            // SAFETY: `ptr` was produced by `self.alloc` and is freed once.
            unsafe { self.alloc.deallocate(ptr, self.size) };
        }
    }
}

impl AsRef<[u8]> for HostBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::ops::Deref for HostBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl core::fmt::Debug for HostBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostBuf")
            .field("len", &self.len)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

    use super::*;

    /// Counts outstanding allocations on top of `malloc`.
    #[derive(Default)]
    pub(crate) struct Counting {
        pub(crate) live: AtomicIsize,
        pub(crate) total: AtomicUsize,
    }

    unsafe impl HostAllocator for Counting {
        fn allocate(&self, size: NonZeroUsize) -> Option<NonNull<u8>> {
            self.live.fetch_add(1, Ordering::SeqCst);
            self.total.fetch_add(1, Ordering::SeqCst);
            Malloc.allocate(size)
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
            self.live.fetch_sub(1, Ordering::SeqCst);
            unsafe { Malloc.deallocate(ptr, size) };
        }
    }

    struct Refuse;

    unsafe impl HostAllocator for Refuse {
        fn allocate(&self, _size: NonZeroUsize) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn deallocate(&self, _ptr: NonNull<u8>, _size: usize) {
            unreachable!("nothing was allocated");
        }
    }

    #[test]
    fn copy_is_nul_terminated() {
        let alloc = default_allocator();
        let buf = HostBuf::copy_from(&alloc, b"abc").unwrap();
        assert_eq!(buf.as_slice(), b"abc");
        let (ptr, len) = buf.into_raw();
        assert_eq!(len, 3);
        let terminator = unsafe { *ptr.add(3) };
        assert_eq!(terminator, 0);
        unsafe { alloc.deallocate(NonNull::new(ptr).unwrap(), 0) };
    }

    #[test]
    fn drop_returns_memory_to_its_allocator() {
        let counting = Arc::new(Counting::default());
        let alloc: SharedAllocator = counting.clone();
        {
            let _a = HostBuf::copy_from(&alloc, b"first").unwrap();
            let _b = HostBuf::zeroed(&alloc, 64).unwrap();
            assert_eq!(counting.live.load(Ordering::SeqCst), 2);
        }
        assert_eq!(counting.live.load(Ordering::SeqCst), 0);
        assert_eq!(counting.total.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_buffers_do_not_allocate() {
        let counting = Arc::new(Counting::default());
        let alloc: SharedAllocator = counting.clone();
        let buf = HostBuf::copy_from(&alloc, b"").unwrap();
        assert!(buf.is_empty());
        let (ptr, len) = buf.into_raw();
        assert!(ptr.is_null());
        assert_eq!(len, 0);
        assert_eq!(counting.total.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn refused_allocation_is_reported() {
        let alloc: SharedAllocator = Arc::new(Refuse);
        assert!(HostBuf::copy_from(&alloc, b"data").is_none());
    }

    #[test]
    fn truncate_keeps_terminator() {
        let alloc = default_allocator();
        let mut buf = HostBuf::copy_from(&alloc, b"hello").unwrap();
        buf.truncate(2);
        assert_eq!(buf.as_slice(), b"he");
        let (ptr, _) = buf.into_raw();
        assert_eq!(unsafe { *ptr.add(2) }, 0);
        unsafe { alloc.deallocate(NonNull::new(ptr).unwrap(), 0) };
    }
}
