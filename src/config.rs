//! Compile-time configuration for the backend.  Everything here is a
//! constant: there is no runtime CLI and no environment variable.
//!
//! The `test_only_small_constants` feature shrinks the refill and cap
//! constants so that tests hit the refill, overflow, and exhaustion
//! edges with far less memory.
use static_assertions::const_assert;

/// The backend never hands out less than one chunk; chunks are
/// naturally aligned to their (power-of-two) size.
pub const MIN_CHUNK_BITS: u32 = 14;
pub const MIN_CHUNK_SIZE: usize = 1 << MIN_CHUNK_BITS;

/// Number of virtual address bits the pagemap covers in its unbounded
/// form.
pub const ADDRESS_BITS: u32 = 48;

/// Exclusive upper bound (as a bit width) on the sizes the large buddy
/// allocator will track.  Anything at or above this goes straight to
/// the parent range.
#[cfg(not(feature = "test_only_small_constants"))]
pub const MAX_SIZE_BITS: u32 = 48;
#[cfg(feature = "test_only_small_constants")]
pub const MAX_SIZE_BITS: u32 = 26;

/// The shared tail refills from the PAL in units of this size.
#[cfg(not(feature = "test_only_small_constants"))]
pub const GLOBAL_REFILL_BITS: u32 = 24;
#[cfg(feature = "test_only_small_constants")]
pub const GLOBAL_REFILL_BITS: u32 = 17;

/// Per-thread ranges refill from the shared tail in units of this
/// size, to amortise the global lock.
#[cfg(not(feature = "test_only_small_constants"))]
pub const LOCAL_REFILL_BITS: u32 = 21;
#[cfg(feature = "test_only_small_constants")]
pub const LOCAL_REFILL_BITS: u32 = 15;

/// A per-thread large buddy stops coalescing at this size and lets the
/// overflow block fall through to the decay stage.
#[cfg(not(feature = "test_only_small_constants"))]
pub const LOCAL_MAX_BITS: u32 = 22;
#[cfg(feature = "test_only_small_constants")]
pub const LOCAL_MAX_BITS: u32 = 16;

/// Number of decay epochs.  Must be a power of two so the epoch
/// counter can wrap with a mask.
pub const NUM_EPOCHS: usize = 4;

/// Size classes the decay stage caches: one per power of two in
/// `[MIN_CHUNK_BITS, LOCAL_MAX_BITS]`.  Larger blocks skip the cache.
pub const NUM_DECAY_CLASSES: usize = (LOCAL_MAX_BITS - MIN_CHUNK_BITS) as usize + 1;

/// Period of the decay timer.
pub const DECAY_PERIOD_MS: u64 = 500;

/// The metadata sub-range carves a `1 << SUB_RANGE_RATIO_BITS` times
/// larger parent region and picks a random slice of it.
#[cfg(not(feature = "test_only_small_constants"))]
pub const SUB_RANGE_RATIO_BITS: u32 = 6;
#[cfg(feature = "test_only_small_constants")]
pub const SUB_RANGE_RATIO_BITS: u32 = 2;

/// Whether buddy pairs may merge across separate PAL reservations.
/// Some platforms cannot tolerate ranges that span reservations, so
/// the conservative answer stays off.
pub const COALESCE_ACROSS_RESERVATIONS: bool = false;

/// Smallest block the in-band (small) buddy allocator will track: two
/// machine words, enough for its tree links.
pub const MIN_SMALL_SIZE: usize = 2 * core::mem::size_of::<usize>();
pub const SMALL_MIN_BITS: u32 = MIN_SMALL_SIZE.trailing_zeros();

/// Exclusive upper bound for the small buddy: one chunk.  Chunk-sized
/// traffic passes straight through, and sub-blocks that coalesce back
/// into a whole chunk overflow to the parent.
pub const SMALL_MAX_BITS: u32 = MIN_CHUNK_BITS;

const_assert!(MIN_CHUNK_SIZE.is_power_of_two());
const_assert!(NUM_EPOCHS.is_power_of_two());
const_assert!(NUM_EPOCHS >= 4);
const_assert!(MIN_SMALL_SIZE.is_power_of_two());
const_assert!(GLOBAL_REFILL_BITS >= MIN_CHUNK_BITS);
const_assert!(LOCAL_REFILL_BITS >= MIN_CHUNK_BITS);
const_assert!(LOCAL_MAX_BITS > LOCAL_REFILL_BITS);
const_assert!(MAX_SIZE_BITS > GLOBAL_REFILL_BITS);
const_assert!(MAX_SIZE_BITS <= ADDRESS_BITS);
