//! Stack-frame copier
//!
//! Moves the in-use span of a call stack into an off-stack buffer and back.
//! Whole words are copied while at least one remains, then a byte tail.
//!
//! No call may push frames onto the stack being copied while a copy is in
//! flight. Callers guarantee this by running the copy on a different stack
//! (the carrier's) from the one being frozen or thawed; the copy itself runs
//! inside a critical section so that it is never chosen as a suspension point.

use crate::constants::WORD_SIZE;
use crate::pin::CriticalSection;

/// Copy `len` bytes from `src` to `dst`
///
/// # Safety
///
/// `src` must be valid for `len` bytes of reads, `dst` for `len` bytes of
/// writes, and the two ranges must not overlap.
#[inline(never)]
pub unsafe fn copy(src: *const u8, dst: *mut u8, len: usize) {
    let _cs = CriticalSection::enter();

    let words = len / WORD_SIZE;
    let aligned = (src as usize | dst as usize) % WORD_SIZE == 0;

    let mut s = src as *const usize;
    let mut d = dst as *mut usize;
    if aligned {
        for _ in 0..words {
            d.write(s.read());
            s = s.add(1);
            d = d.add(1);
        }
    } else {
        for _ in 0..words {
            d.write_unaligned(s.read_unaligned());
            s = s.add(1);
            d = d.add(1);
        }
    }

    let mut sb = s as *const u8;
    let mut db = d as *mut u8;
    for _ in 0..len % WORD_SIZE {
        db.write(sb.read());
        sb = sb.add(1);
        db = db.add(1);
    }
}

/// Frozen stack frames plus the address to resume them at
///
/// The backing buffer is kept across suspends of the same continuation and
/// only grows.
#[derive(Default)]
pub struct StackChunk {
    storage: Vec<usize>,
    sp: usize,
    len: usize,
    resume_ip: usize,
}

impl StackChunk {
    pub const fn new() -> Self {
        StackChunk {
            storage: Vec::new(),
            sp: 0,
            len: 0,
            resume_ip: 0,
        }
    }

    /// Snapshot `[sp, top)` and record `ip` as the resume address
    ///
    /// # Safety
    ///
    /// `[sp, top)` must be readable and must not belong to the stack the
    /// caller is running on.
    pub unsafe fn freeze(&mut self, sp: usize, top: usize, ip: usize) {
        assert!(sp <= top, "frozen span has its leaf above its root");
        let len = top - sp;
        let words = len.div_ceil(WORD_SIZE);
        if self.storage.len() < words {
            self.storage.resize(words, 0);
        }
        copy(sp as *const u8, self.storage.as_mut_ptr() as *mut u8, len);
        self.sp = sp;
        self.len = len;
        self.resume_ip = ip;
    }

    /// Write the frozen span back to its original addresses
    ///
    /// Returns the resume address recorded by `freeze`. The chunk is left
    /// empty.
    ///
    /// # Safety
    ///
    /// The original span must be writable and must not belong to the stack
    /// the caller is running on.
    pub unsafe fn thaw(&mut self) -> usize {
        assert!(!self.is_empty(), "thaw of an empty stack chunk");
        copy(self.storage.as_ptr() as *const u8, self.sp as *mut u8, self.len);
        let ip = self.resume_ip;
        self.sp = 0;
        self.len = 0;
        self.resume_ip = 0;
        ip
    }

    /// Drop frozen contents and the backing buffer
    pub fn clear(&mut self) {
        self.storage = Vec::new();
        self.sp = 0;
        self.len = 0;
        self.resume_ip = 0;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.resume_ip == 0
    }

    /// Bytes of frame data currently frozen
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Leaf stack pointer of the frozen span
    #[inline]
    pub fn stack_pointer(&self) -> usize {
        self.sp
    }

    #[inline]
    pub fn resume_ip(&self) -> usize {
        self.resume_ip
    }

    /// Bytes reserved by the backing buffer
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.capacity() * WORD_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin;

    fn pattern(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 31 + 7) as u8).collect()
    }

    fn round_trip(n: usize, src_off: usize, dst_off: usize) {
        let original = pattern(n);
        let mut src = vec![0u8; n + 16];
        src[src_off..src_off + n].copy_from_slice(&original);

        let mut buf = vec![0u8; n + 16];
        let mut back = vec![0u8; n + 16];
        unsafe {
            copy(src.as_ptr().add(src_off), buf.as_mut_ptr().add(dst_off), n);
            copy(buf.as_ptr().add(dst_off), back.as_mut_ptr().add(src_off), n);
        }
        assert_eq!(&back[src_off..src_off + n], &original[..], "n={} offsets={}/{}", n, src_off, dst_off);
        // Nothing past the span is touched
        assert!(back[src_off + n..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_copy_round_trip_sizes() {
        let sizes = [
            0,
            1,
            WORD_SIZE - 1,
            WORD_SIZE,
            WORD_SIZE + 1,
            2 * WORD_SIZE - 1,
            3 * WORD_SIZE,
            4096,
            64 * 1024 + 5,
        ];
        for &n in &sizes {
            round_trip(n, 0, 0);
        }
    }

    #[test]
    fn test_copy_round_trip_unaligned() {
        for &n in &[0, 3, WORD_SIZE, WORD_SIZE + 3, 1000] {
            round_trip(n, 1, 3);
            round_trip(n, 0, 5);
        }
    }

    #[test]
    fn test_copy_runs_in_critical_section() {
        let src = [1u8; 4];
        let mut dst = [0u8; 4];
        unsafe { copy(src.as_ptr(), dst.as_mut_ptr(), 4) };
        assert_eq!(dst, src);
        assert_eq!(pin::critical_depth(), 0);
    }

    #[test]
    fn test_chunk_freeze_thaw() {
        let mut stack: Vec<usize> = (0..128).map(|i| i * 3 + 1).collect();
        let original = stack.clone();
        let base = stack.as_mut_ptr() as usize;
        let sp = base + 40 * WORD_SIZE;
        let top = base + 128 * WORD_SIZE;

        let mut chunk = StackChunk::new();
        assert!(chunk.is_empty());
        unsafe { chunk.freeze(sp, top, 0xdead_beef) };
        assert!(!chunk.is_empty());
        assert_eq!(chunk.len(), 88 * WORD_SIZE);
        assert_eq!(chunk.stack_pointer(), sp);

        for w in &mut stack[40..] {
            *w = 0;
        }
        let ip = unsafe { chunk.thaw() };
        assert_eq!(ip, 0xdead_beef);
        assert_eq!(stack, original);
        assert!(chunk.is_empty());
    }

    #[test]
    fn test_chunk_reuses_buffer() {
        let stack = vec![7usize; 64];
        let base = stack.as_ptr() as usize;
        let top = base + 64 * WORD_SIZE;

        let mut chunk = StackChunk::new();
        unsafe { chunk.freeze(base, top, 1) };
        let cap = chunk.capacity();
        unsafe { chunk.freeze(base + 16 * WORD_SIZE, top, 2) };
        assert_eq!(chunk.capacity(), cap);
        assert_eq!(chunk.resume_ip(), 2);

        chunk.clear();
        assert!(chunk.is_empty());
        assert_eq!(chunk.capacity(), 0);
    }
}
