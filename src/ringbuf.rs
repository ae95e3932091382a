//! Bounded byte ring buffer
//!
//! Used by character devices to pass bytes between interrupt handlers and
//! tasks. Writes stop when the buffer is full and reads stop when it is
//! empty; nothing ever blocks or overwrites unread data. Blocking is layered
//! on top by the device wait protocol in `device.rs`.

/// Fixed-capacity byte FIFO.
pub struct RingBuffer<const N: usize> {
    buffer: [u8; N],
    len: usize,
    read_idx: usize,
    write_idx: usize,
}

impl<const N: usize> RingBuffer<N> {
    pub const fn new() -> Self {
        Self {
            buffer: [0u8; N],
            len: 0,
            read_idx: 0,
            write_idx: 0,
        }
    }

    /// Copy as much of `data` as fits. Returns the number of bytes written.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let mut written = 0;
        for &byte in data {
            if self.len == N {
                break;
            }
            self.buffer[self.write_idx] = byte;
            self.write_idx = (self.write_idx + 1) % N;
            self.len += 1;
            written += 1;
        }
        written
    }

    /// Move up to `dest.len()` bytes out of the buffer. Returns the number
    /// of bytes read.
    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        let mut read = 0;
        for slot in dest.iter_mut() {
            if self.len == 0 {
                break;
            }
            *slot = self.buffer[self.read_idx];
            self.read_idx = (self.read_idx + 1) % N;
            self.len -= 1;
            read += 1;
        }
        read
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline]
    pub const fn free(&self) -> usize {
        N - self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub const fn is_full(&self) -> bool {
        self.len == N
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.len = 0;
        self.read_idx = 0;
        self.write_idx = 0;
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}
