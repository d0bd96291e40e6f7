use static_assertions::const_assert;

pub(super) const MIN_ALLOCATION_BITS: usize = 8;
/// Granularity of every chunk size and every returned address.
pub const MIN_ALLOCATION_SIZE: usize = 1 << MIN_ALLOCATION_BITS;
/// Bin `i` holds free chunks of `[256 << i, 512 << i)`; the last bin is open ended.
pub(super) const NUM_BINS: usize = 21;
/// Requests above this are refused before rounding.
pub(super) const MAX_ALLOCATION_SIZE: usize = isize::MAX as usize - MIN_ALLOCATION_SIZE;

const_assert!(MIN_ALLOCATION_SIZE.is_power_of_two());
const_assert!(NUM_BINS + MIN_ALLOCATION_BITS < usize::BITS as usize);

#[inline]
pub(super) const fn bin_size(bin: usize) -> usize {
    MIN_ALLOCATION_SIZE << bin
}

#[inline]
pub(super) fn rounded_bytes(bytes: usize) -> usize {
    debug_assert!(bytes <= MAX_ALLOCATION_SIZE);
    bytes.next_multiple_of(MIN_ALLOCATION_SIZE)
}

#[inline]
fn bsr(value: usize) -> usize {
    debug_assert!(value != 0);
    (usize::BITS - 1 - value.leading_zeros()) as usize
}

pub(super) fn bin_num_for_size(bytes: usize) -> usize {
    let v = std::cmp::max(bytes, MIN_ALLOCATION_SIZE) >> MIN_ALLOCATION_BITS;
    std::cmp::min(NUM_BINS - 1, bsr(v))
}

pub(super) fn human_readable_num_bytes(num_bytes: usize) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];
    if num_bytes < 1024 {
        return format!("{num_bytes}B");
    }
    let mut value = num_bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2}{}", value, UNITS[unit])
}
