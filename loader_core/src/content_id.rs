use std::fmt;
use std::ops::RangeInclusive;

/// Upper bound on the bytes read by each sample window.
pub const MAX_SAMPLE_LEN: usize = 3200;

const MIDDLE_WINDOW_PERCENT: usize = 50;
const EARLY_WINDOW_PERCENT: usize = 20;

/// Fingerprint of a payload that stands in for the payload as a map key.
///
/// Combines a hash over every byte with two XOR-folded hashes over salted
/// sample windows. Equal identities mean "almost certainly the same bytes";
/// the payload itself is never retained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContentIdentity {
    hash: u64,
    middle: u64,
    early: u64,
}

impl ContentIdentity {
    pub fn of(payload: &[u8]) -> Self {
        let len = payload.len();
        Self {
            hash: fnv1a64(payload),
            middle: sample_hash(payload, sample_window(len, MIDDLE_WINDOW_PERCENT), 0),
            // Offset by one so the salted positions differ from the middle window.
            early: sample_hash(payload, sample_window(len, EARLY_WINDOW_PERCENT), 1),
        }
    }

    pub fn hash64(&self) -> u64 {
        self.hash
    }

    pub fn middle_sample(&self) -> u64 {
        self.middle
    }

    pub fn early_sample(&self) -> u64 {
        self.early
    }
}

impl fmt::Display for ContentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}-{:016x}", self.hash, self.middle, self.early)
    }
}

fn sample_window(len: usize, percent: usize) -> RangeInclusive<usize> {
    if len < MAX_SAMPLE_LEN {
        // Short payloads sample everything past the first byte. Fewer than two
        // bytes leaves an empty range.
        return 1..=len.saturating_sub(1);
    }
    let start = len / 100 * percent;
    let mut end = len / 100 * (percent + 1);
    if end - start > MAX_SAMPLE_LEN {
        end = start + MAX_SAMPLE_LEN - 1;
    }
    start..=end
}

fn sample_hash(payload: &[u8], window: RangeInclusive<usize>, salt_phase: usize) -> u64 {
    let mut hash = 0u64;
    for index in window {
        let Some(byte) = payload.get(index) else {
            break;
        };
        let mut part = *byte;
        // Salting breaks up repeating patterns that would otherwise XOR to zero.
        if (index + salt_phase) % 3 == 0 {
            part ^= (index % 0xff) as u8;
        }
        hash ^= u64::from(part) << ((index % 8) * 8);
    }
    hash
}

fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|index| (index as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn identical_payloads_match() {
        let a = patterned(10_000, 7);
        let b = a.clone();
        assert_eq!(ContentIdentity::of(&a), ContentIdentity::of(&b));
    }

    #[test]
    fn middle_window_change_is_detected() {
        let a = patterned(10_000, 7);
        let mut b = a.clone();
        b[5_020] ^= 0x40;
        let left = ContentIdentity::of(&a);
        let right = ContentIdentity::of(&b);
        assert_ne!(left, right);
        assert_ne!(left.hash64(), right.hash64());
        assert_ne!(left.middle_sample(), right.middle_sample());
        assert_eq!(left.early_sample(), right.early_sample());
    }

    #[test]
    fn early_window_change_is_detected() {
        let a = patterned(10_000, 7);
        let mut b = a.clone();
        b[2_010] ^= 0x01;
        let left = ContentIdentity::of(&a);
        let right = ContentIdentity::of(&b);
        assert_ne!(left.early_sample(), right.early_sample());
        assert_eq!(left.middle_sample(), right.middle_sample());
    }

    #[test]
    fn windows_are_capped_for_large_payloads() {
        let window = sample_window(1_000_000, MIDDLE_WINDOW_PERCENT);
        assert_eq!(*window.start(), 500_000);
        assert_eq!(window.end() - window.start() + 1, MAX_SAMPLE_LEN);
    }

    #[test]
    fn short_payloads_sample_past_first_byte() {
        let window = sample_window(40, EARLY_WINDOW_PERCENT);
        assert_eq!(window, 1..=39);
    }

    #[test]
    fn degenerate_payloads_do_not_panic() {
        let empty = ContentIdentity::of(&[]);
        let single = ContentIdentity::of(&[9]);
        assert_eq!(empty.middle_sample(), 0);
        assert_eq!(single.early_sample(), 0);
        assert_ne!(empty, single);
    }

    #[test]
    fn display_is_stable_hex() {
        let id = ContentIdentity::of(b"progressive");
        let text = id.to_string();
        assert_eq!(text.len(), 16 * 3 + 2);
        assert_eq!(text, ContentIdentity::of(b"progressive").to_string());
    }
}
