//! The POSIX platform layer: `mmap` for address space, `madvise` for
//! decommit, demand paging for commit.
use crate::pal::{Pal, PalFeatures};

/// All the platforms we target demand-page anonymous mappings, so
/// commitment is lazy and `notify_using` has nothing to do.
#[derive(Debug)]
pub struct PosixPal;

const RESERVE_PROT: i32 = libc::PROT_READ | libc::PROT_WRITE;
const RESERVE_FLAGS: i32 = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

fn mmap_reserve(size: usize) -> Option<usize> {
    debug_assert!(size > 0 && size % PosixPal::PAGE_SIZE == 0);

    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            RESERVE_PROT,
            RESERVE_FLAGS,
            -1,
            0,
        )
    };

    if base == libc::MAP_FAILED {
        None
    } else {
        Some(base as usize)
    }
}

impl Pal for PosixPal {
    const FEATURES: PalFeatures = PalFeatures::ALIGNED_ALLOCATION
        .union(PalFeatures::LAZY_COMMIT)
        .union(PalFeatures::ENTROPY)
        .union(PalFeatures::TIME);

    // We only develop on platforms with 4K pages.
    const PAGE_SIZE: usize = 4096;

    fn reserve(size: usize) -> Option<usize> {
        mmap_reserve(size)
    }

    /// Over-reserves by the requested alignment and trims the slop
    /// back to the kernel, leaving exactly `[base, base + size)` with
    /// `base` a multiple of `size`.
    fn reserve_aligned(size: usize) -> Option<usize> {
        debug_assert!(size.is_power_of_two());
        debug_assert!(size >= Self::PAGE_SIZE);

        let reserved = mmap_reserve(size.checked_mul(2)?)?;
        let base = crate::bits::align_up(reserved, size);
        let prefix = base - reserved;
        let suffix = size - prefix;

        unsafe {
            if prefix > 0 {
                libc::munmap(reserved as *mut libc::c_void, prefix);
            }
            if suffix > 0 {
                libc::munmap((base + size) as *mut libc::c_void, suffix);
            }
        }

        Some(base)
    }

    fn notify_using(base: usize, size: usize, zero: bool) {
        debug_assert!(base % Self::PAGE_SIZE == 0);
        debug_assert!(size % Self::PAGE_SIZE == 0);
        // Demand paging commits for us, and fresh or `MADV_DONTNEED`ed
        // anonymous pages read back as zero.
        let _ = (base, size, zero);
    }

    fn notify_not_using(base: usize, size: usize) {
        debug_assert!(base % Self::PAGE_SIZE == 0);
        debug_assert!(size % Self::PAGE_SIZE == 0);

        unsafe {
            libc::madvise(base as *mut libc::c_void, size, libc::MADV_DONTNEED);
        }
    }

    fn register_timer(period_ms: u64, callback: Box<dyn Fn() + Send + Sync>) -> bool {
        std::thread::Builder::new()
            .name("quarry-decay".into())
            .spawn(move || loop {
                std::thread::sleep(std::time::Duration::from_millis(period_ms));
                callback();
            })
            .is_ok()
    }

    fn get_entropy64() -> u64 {
        let mut bytes = [0u8; 8];

        #[cfg(target_os = "linux")]
        {
            let got = unsafe {
                libc::getrandom(bytes.as_mut_ptr() as *mut libc::c_void, bytes.len(), 0)
            };
            if got == bytes.len() as isize {
                return u64::from_ne_bytes(bytes);
            }
        }

        // Fallback path for platforms (or kernels) without
        // getrandom(2).
        use std::io::Read;
        let mut urandom =
            std::fs::File::open("/dev/urandom").expect("/dev/urandom must be readable");
        urandom
            .read_exact(&mut bytes)
            .expect("/dev/urandom reads cannot fail");
        u64::from_ne_bytes(bytes)
    }
}
