pub const SEQUENCE_HALF_RANGE: u32 = 1 << 31;
pub const SEQUENCE_HALF_RANGE_U16: u16 = 1 << 15;
pub const SEQUENCE_HALF_RANGE_U8: u8 = 1 << 7;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_HALF_RANGE))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_HALF_RANGE))
}

#[inline]
pub fn sequence_greater_than_u16(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_HALF_RANGE_U16))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_HALF_RANGE_U16))
}

/// Ordering for the 8-bit fragment ids carried by messages.
#[inline]
pub fn sequence_greater_than_u8(s1: u8, s2: u8) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_HALF_RANGE_U8))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_HALF_RANGE_U8))
}

/// Forward distance from `from` to `to` on a ring of `modulus` values.
///
/// `modulus` must be in `1..=2^32`. Bitfield indexing uses a modulus of 32;
/// full sequence numbers use 2^32.
#[inline]
pub fn circular_distance(to: u32, from: u32, modulus: u64) -> u32 {
    debug_assert!(modulus > 0 && modulus <= 1 << 32);
    let to = u64::from(to) % modulus;
    let from = u64::from(from) % modulus;
    ((to + modulus - from) % modulus) as u32
}
