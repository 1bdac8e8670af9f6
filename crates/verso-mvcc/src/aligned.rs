//! Cache-line alignment for contended slot arrays and cursors.

/// Cache line size in bytes.
///
/// 64 bytes covers x86-64 and AArch64; over-aligning on platforms with
/// larger lines wastes a little memory but never causes false sharing.
pub const CACHE_LINE_BYTES: usize = 64;

/// Forces a value onto its own cache line.
///
/// The readers-list slot arrays and the allocator cursors are written by
/// different threads at high frequency; placing each element on a
/// separate line keeps one thread's stores from invalidating its
/// neighbors' lines.
#[repr(C, align(64))]
#[derive(Default)]
pub struct CacheAligned<T> {
    value: T,
}

impl<T> CacheAligned<T> {
    #[inline]
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    #[inline]
    #[must_use]
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> std::ops::Deref for CacheAligned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::DerefMut for CacheAligned<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CacheAligned<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheAligned, CACHE_LINE_BYTES};
    use std::sync::atomic::AtomicU64;

    #[test]
    fn elements_occupy_whole_lines() {
        assert_eq!(std::mem::align_of::<CacheAligned<AtomicU64>>(), CACHE_LINE_BYTES);
        assert_eq!(std::mem::size_of::<CacheAligned<AtomicU64>>(), CACHE_LINE_BYTES);
        let arr: [CacheAligned<AtomicU64>; 2] =
            [CacheAligned::new(AtomicU64::new(0)), CacheAligned::new(AtomicU64::new(0))];
        let a = std::ptr::addr_of!(arr[0]) as usize;
        let b = std::ptr::addr_of!(arr[1]) as usize;
        assert_eq!(b - a, CACHE_LINE_BYTES);
    }

    #[test]
    fn deref_reaches_the_value() {
        let c = CacheAligned::new(7_u32);
        assert_eq!(*c, 7);
        assert_eq!(c.into_inner(), 7);
    }
}
