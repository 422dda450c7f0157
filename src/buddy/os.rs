//! OS-backed superblock source.
//!
//! The buddy allocator never touches the OS directly; it goes through an
//! injectable [`OsRegionSource`], mirroring the way the teacher's page
//! allocator is handed a frame array by `init_page_allocator` rather than
//! mapping physical memory itself. The default source prefers an
//! anonymous mapping (`mmap` with `MAP_ANON | MAP_PRIVATE`) placed at a
//! naturally aligned address; the `posix_memalign` fallback exists only
//! for tests where `mmap`'s placement games are unnecessary overhead.

use std::ptr::NonNull;

/// Supplies and reclaims power-of-two, self-aligned regions.
///
/// # Safety
///
/// Implementations must return a pointer aligned to `size` bytes (or
/// `None`/abort), and `unmap` must accept exactly the `(ptr, size)` pair
/// a prior `map` returned.
pub trait OsRegionSource: Send + Sync {
    fn map(&self, size: usize) -> Option<NonNull<u8>>;
    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize);
}

/// Anonymous-mapping source used in production.
///
/// First attempts a single mapping of exactly `size` bytes and hopes the
/// OS's default placement happens to be aligned (common on Linux for
/// mappings that are themselves a power of two, since the kernel's VMA
/// allocator tends to hand out addresses aligned to the requested size
/// for sufficiently large requests). If the result is misaligned, maps
/// `2 * size`, computes the aligned interior, and unmaps the two
/// leftover tails.
#[derive(Default)]
pub struct MmapSource;

impl MmapSource {
    pub const fn new() -> Self {
        Self
    }

    fn raw_map(len: usize) -> *mut libc::c_void {
        unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        }
    }
}

impl OsRegionSource for MmapSource {
    fn map(&self, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(size.is_power_of_two());

        let first = Self::raw_map(size);
        if first == libc::MAP_FAILED {
            return None;
        }
        if (first as usize) & (size - 1) == 0 {
            return NonNull::new(first as *mut u8);
        }

        // Misaligned: over-map by 2x, carve out the aligned interior, and
        // unmap the two surrounding tails.
        unsafe {
            libc::munmap(first, size);
        }
        let over_len = size * 2;
        let over = Self::raw_map(over_len);
        if over == libc::MAP_FAILED {
            return None;
        }
        let base = over as usize;
        let aligned = (base + size - 1) & !(size - 1);
        let front_waste = aligned - base;
        let back_waste = over_len - front_waste - size;

        unsafe {
            if front_waste > 0 {
                libc::munmap(over, front_waste);
            }
            if back_waste > 0 {
                libc::munmap((aligned + size) as *mut libc::c_void, back_waste);
            }
        }

        NonNull::new(aligned as *mut u8)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize) {
        unsafe {
            libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
        }
    }
}

/// `posix_memalign`-backed source. Used in tests to avoid the
/// double-mapping dance above, and as [`BuddyConfig`](super::BuddyConfig)'s
/// default on non-unix targets where `mmap` isn't available.
#[derive(Default)]
pub struct AlignedMallocSource;

impl AlignedMallocSource {
    pub const fn new() -> Self {
        Self
    }
}

impl OsRegionSource for AlignedMallocSource {
    fn map(&self, size: usize) -> Option<NonNull<u8>> {
        let mut raw: *mut libc::c_void = std::ptr::null_mut();
        let align = size.max(std::mem::size_of::<usize>());
        let rc = unsafe { libc::posix_memalign(&mut raw, align, size) };
        if rc != 0 || raw.is_null() {
            return None;
        }
        NonNull::new(raw as *mut u8)
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, _size: usize) {
        unsafe {
            libc::free(ptr.as_ptr() as *mut libc::c_void);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmap_source_returns_self_aligned_region() {
        let src = MmapSource::new();
        let size = 1 << 20;
        let region = src.map(size).expect("mmap should succeed");
        assert_eq!(region.as_ptr() as usize & (size - 1), 0);
        unsafe { src.unmap(region, size) };
    }

    #[test]
    fn aligned_malloc_source_returns_self_aligned_region() {
        let src = AlignedMallocSource::new();
        let size = 1 << 16;
        let region = src.map(size).expect("posix_memalign should succeed");
        assert_eq!(region.as_ptr() as usize & (size - 1), 0);
        unsafe { src.unmap(region, size) };
    }
}
