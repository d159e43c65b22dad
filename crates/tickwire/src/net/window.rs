//! 32-bit sliding presence windows keyed by sequence number modulo 32.

pub const WINDOW_SIZE: u32 = 32;
pub const WINDOW_INDEX_MASK: u32 = WINDOW_SIZE - 1;

#[inline]
pub fn window_index(sequence: u32) -> u32 {
    sequence & WINDOW_INDEX_MASK
}

#[inline]
pub fn window_bit(index: u32) -> u32 {
    1 << (index & WINDOW_INDEX_MASK)
}

/// Mask that keeps every bit of a window except the circular arc
/// `(old_index, new_index]`, i.e. the slots whose contents belong to
/// sequence numbers that rotated out when the reference moved forward.
///
/// `old_index == new_index` yields all ones.
#[inline]
pub fn window_mask(old_index: u32, new_index: u32) -> u32 {
    let old_index = old_index & WINDOW_INDEX_MASK;
    let new_index = new_index & WINDOW_INDEX_MASK;

    let lo = old_index.min(new_index);
    let hi = old_index.max(new_index);
    let max_minus_hi = WINDOW_INDEX_MASK - hi;

    let mut mask = (u32::MAX << (lo + max_minus_hi)) >> max_minus_hi;
    if new_index >= old_index {
        mask = !mask;
    }
    mask ^ (1 << lo)
}

/// Folds a freshly observed bit into `field`.
///
/// `delta` is how far the new observation is ahead of the previous
/// reference. A gap of a full window or more leaves nothing trustworthy in
/// the field, so only the new bit survives.
#[inline]
pub fn merge_bit(field: u32, new_index: u32, prior_reference_index: u32, delta: u32) -> u32 {
    let mask = if delta < WINDOW_SIZE {
        window_mask(prior_reference_index, new_index)
    } else {
        0
    };
    (field & mask) | window_bit(new_index)
}
