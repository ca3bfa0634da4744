//! A platform layer that reserves address space as shared mappings of
//! unlinked temporary files.  This lets the operating system eagerly
//! write cold chunk data out when under memory pressure, instead of
//! swapping anonymous pages.
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::pal::{Pal, PalFeatures};
use crate::pal_posix::PosixPal;

#[derive(Debug)]
pub struct FileBackedPal;

lazy_static::lazy_static! {
    static ref FILE_BACKED_PATH: Mutex<Option<PathBuf>> = Default::default();
}

/// Updates the parent directory for the file-backed PAL's temporary
/// files.  `None` reverts to the system default, and `":memory:"`
/// forces regular anonymous mappings.
pub fn set_file_backed_chunk_directory(path: Option<PathBuf>) {
    let mut global_path = FILE_BACKED_PATH.lock().unwrap();

    *global_path = path;
}

/// Returns a fresh unlinked temporary file in the configured
/// directory, or `None` when anonymous mappings were requested.
fn backing_file(size: usize) -> Result<Option<std::fs::File>, std::io::Error> {
    let path = FILE_BACKED_PATH.lock().unwrap().clone();

    let file = match path {
        None => tempfile::tempfile()?,
        Some(dir) => {
            if dir == std::path::Path::new(":memory:") {
                return Ok(None);
            }

            tempfile::tempfile_in(dir)?
        }
    };

    file.set_len(size as u64)?;
    Ok(Some(file))
}

impl Pal for FileBackedPal {
    // Deliberately not `ALIGNED_ALLOCATION`: file mappings land
    // wherever the kernel puts them, so this PAL exercises the
    // unaligned refill path of the large buddy stage.
    const FEATURES: PalFeatures = PalFeatures::LAZY_COMMIT
        .union(PalFeatures::ENTROPY)
        .union(PalFeatures::TIME);

    const PAGE_SIZE: usize = PosixPal::PAGE_SIZE;

    fn reserve(size: usize) -> Option<usize> {
        debug_assert!(size > 0 && size % Self::PAGE_SIZE == 0);

        let file = match backing_file(size) {
            Ok(Some(file)) => file,
            // ":memory:" falls back to anonymous reservations.
            Ok(None) => return PosixPal::reserve(size),
            Err(_) => return None,
        };

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_NORESERVE,
                file.as_raw_fd(),
                0,
            )
        };

        // The mapping keeps the unlinked file alive; the descriptor
        // can go.
        if base == libc::MAP_FAILED {
            None
        } else {
            Some(base as usize)
        }
    }

    fn notify_using(base: usize, size: usize, zero: bool) {
        PosixPal::notify_using(base, size, zero)
    }

    fn notify_not_using(base: usize, size: usize) {
        debug_assert!(base % Self::PAGE_SIZE == 0);
        debug_assert!(size % Self::PAGE_SIZE == 0);

        unsafe {
            libc::madvise(base as *mut libc::c_void, size, libc::MADV_DONTNEED);
        }
    }

    fn register_timer(period_ms: u64, callback: Box<dyn Fn() + Send + Sync>) -> bool {
        PosixPal::register_timer(period_ms, callback)
    }

    fn get_entropy64() -> u64 {
        PosixPal::get_entropy64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_backed_reserve_is_usable() {
        let size = 1 << 20;
        let base = FileBackedPal::reserve(size).expect("reserve should succeed");

        unsafe {
            let p = base as *mut u8;
            assert_eq!(*p, 0);
            *p = 42;
            *p.add(size - 1) = 42;
            assert_eq!(*p, 42);
        }
    }

    #[test]
    fn memory_directory_forces_anonymous() {
        set_file_backed_chunk_directory(Some(":memory:".into()));
        let base = FileBackedPal::reserve(1 << 16).expect("reserve should succeed");
        unsafe { *(base as *mut u8) = 1 };
        set_file_backed_chunk_directory(None);
    }
}
