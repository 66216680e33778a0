//! Utility functions

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique owner id, used to bind command buffers to their manager.
pub fn next_id() -> u64 {
    NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Align value to power of 2
pub fn align_to(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Broadcast `pattern` across `dst` (whose length must be a multiple of the pattern length).
///
/// Fills by doubling the already-written prefix, so N copies cost O(log N) memcpy calls.
pub fn replicate(dst: &mut [u8], pattern: &[u8]) {
    let item = pattern.len();
    if item == 0 || dst.is_empty() {
        return;
    }
    debug_assert_eq!(dst.len() % item, 0);
    dst[..item].copy_from_slice(pattern);
    let mut filled = item;
    while filled < dst.len() {
        let n = filled.min(dst.len() - filled);
        let (head, tail) = dst.split_at_mut(filled);
        tail[..n].copy_from_slice(&head[..n]);
        filled += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_id() {
        let id1 = next_id();
        let id2 = next_id();
        assert_ne!(id1, id2);
        assert!(id1 > 0);
    }

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 8), 0);
        assert_eq!(align_to(1, 8), 8);
        assert_eq!(align_to(7, 8), 8);
        assert_eq!(align_to(8, 8), 8);
        assert_eq!(align_to(9, 8), 16);
    }

    #[test]
    fn test_replicate_odd_count() {
        let mut dst = [0u8; 21];
        replicate(&mut dst, &[1, 2, 3]);
        assert!(dst.chunks(3).all(|c| c == [1, 2, 3]));
    }
}
