//! This module tracks every outstanding chunk allocation in checked
//! builds, so the contracts on the backend's entry points can detect
//! overlapping handouts, double allocation, and double free.
use std::collections::BTreeMap;
use std::sync::Mutex;

lazy_static::lazy_static! {
    /// base -> size of every chunk currently held by a front end.
    static ref LIVE_CHUNKS: Mutex<BTreeMap<usize, usize>> = Default::default();
}

/// Registers a fresh handout.  Fails if it overlaps anything still
/// live.
pub fn mark_allocated(base: usize, size: usize) -> Result<(), &'static str> {
    if usize::MAX - base < size {
        return Err("Chunk wraps the address space");
    }

    let mut map = LIVE_CHUNKS.lock().unwrap();

    // The predecessor must end at or before us, and the successor must
    // start at or after our end.
    if let Some((&prev_base, &prev_size)) = map.range(..=base).last() {
        if prev_base + prev_size > base {
            return Err("Chunk overlaps a live allocation below it");
        }
    }
    if let Some((&next_base, _)) = map.range(base..).next() {
        if next_base < base + size {
            return Err("Chunk overlaps a live allocation above it");
        }
    }

    map.insert(base, size);
    Ok(())
}

/// Unregisters a handout.  Fails on anything that is not exactly a
/// live chunk.
pub fn mark_released(base: usize, size: usize) -> Result<(), &'static str> {
    let mut map = LIVE_CHUNKS.lock().unwrap();

    match map.get(&base) {
        None => Err("Chunk is not live (double free?)"),
        Some(&live_size) if live_size != size => Err("Chunk freed with the wrong size"),
        Some(_) => {
            map.remove(&base);
            Ok(())
        }
    }
}

/// True iff `base` is currently handed out.
pub fn is_live(base: usize) -> bool {
    LIVE_CHUNKS.lock().unwrap().contains_key(&base)
}

#[test]
fn overlap_and_double_free_are_caught() {
    let base = 0x7f00_0000_0000;

    mark_allocated(base, 0x8000).expect("fresh chunk");
    assert!(is_live(base));

    assert!(mark_allocated(base, 0x4000).is_err(), "same base");
    assert!(mark_allocated(base + 0x4000, 0x4000).is_err(), "inside");
    assert!(mark_allocated(base - 0x2000, 0x4000).is_err(), "straddles the start");

    mark_allocated(base + 0x8000, 0x4000).expect("adjacent is fine");

    assert!(mark_released(base, 0x4000).is_err(), "wrong size");
    mark_released(base, 0x8000).expect("live chunk");
    assert!(mark_released(base, 0x8000).is_err(), "double free");
    mark_released(base + 0x8000, 0x4000).expect("live chunk");
}
