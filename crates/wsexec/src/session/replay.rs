//! Bounded retention of recent terminal output.

/// Capacity of the replay ring. Matches the wire message budget order of
/// magnitude; the multiplexer's own scrollback handles redraw delivery,
/// this ring only bounds what the server retains per session.
pub const REPLAY_CAPACITY: usize = 64 * 1024;

/// Fixed-size ring over the most recent bytes a session has emitted.
pub struct ReplayBuffer {
    buffer: Vec<u8>,
    write_pos: usize,
    filled: bool,
}

impl ReplayBuffer {
    /// Creates a ring with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity],
            write_pos: 0,
            filled: false,
        }
    }

    /// Creates a ring with [`REPLAY_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(REPLAY_CAPACITY)
    }

    /// Appends bytes, overwriting the oldest data once full.
    pub fn write(&mut self, data: &[u8]) {
        let capacity = self.buffer.len();
        if capacity == 0 {
            return;
        }

        if data.len() >= capacity {
            // Larger than the ring; keep the tail.
            let start = data.len() - capacity;
            self.buffer.copy_from_slice(&data[start..]);
            self.write_pos = 0;
            self.filled = true;
            return;
        }

        let space_left = capacity - self.write_pos;
        if data.len() <= space_left {
            self.buffer[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
            self.write_pos += data.len();
        } else {
            self.buffer[self.write_pos..].copy_from_slice(&data[..space_left]);
            let remaining = data.len() - space_left;
            self.buffer[..remaining].copy_from_slice(&data[space_left..]);
            self.write_pos = remaining;
            self.filled = true;
        }

        if self.write_pos >= capacity {
            self.write_pos = 0;
            self.filled = true;
        }
    }

    /// Returns the retained bytes, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        if !self.filled {
            return self.buffer[..self.write_pos].to_vec();
        }
        let mut linear = Vec::with_capacity(self.buffer.len());
        linear.extend_from_slice(&self.buffer[self.write_pos..]);
        linear.extend_from_slice(&self.buffer[..self.write_pos]);
        linear
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        if self.filled {
            self.buffer.len()
        } else {
            self.write_pos
        }
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let ring = ReplayBuffer::with_capacity(8);
        assert!(ring.is_empty());
        assert!(ring.snapshot().is_empty());
    }

    #[test]
    fn test_write_below_capacity() {
        let mut ring = ReplayBuffer::with_capacity(8);
        ring.write(b"abc");
        assert_eq!(ring.snapshot(), b"abc");
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_wraparound_keeps_most_recent() {
        let mut ring = ReplayBuffer::with_capacity(8);
        ring.write(b"abcdef");
        ring.write(b"ghij");
        assert_eq!(ring.snapshot(), b"cdefghij");
        assert_eq!(ring.len(), 8);
    }

    #[test]
    fn test_oversized_write_keeps_tail() {
        let mut ring = ReplayBuffer::with_capacity(4);
        ring.write(b"0123456789");
        assert_eq!(ring.snapshot(), b"6789");
    }

    #[test]
    fn test_exact_capacity_write() {
        let mut ring = ReplayBuffer::with_capacity(4);
        ring.write(b"abcd");
        assert_eq!(ring.snapshot(), b"abcd");
        ring.write(b"e");
        assert_eq!(ring.snapshot(), b"bcde");
    }

    #[test]
    fn test_len_never_exceeds_capacity() {
        let mut ring = ReplayBuffer::new();
        let chunk = vec![7u8; 10_000];
        for _ in 0..20 {
            ring.write(&chunk);
            assert!(ring.len() <= REPLAY_CAPACITY);
            assert!(ring.snapshot().len() <= REPLAY_CAPACITY);
        }
        assert_eq!(ring.len(), REPLAY_CAPACITY);
    }

    #[test]
    fn test_many_small_writes_preserve_order() {
        let mut ring = ReplayBuffer::with_capacity(16);
        for i in 0u8..32 {
            ring.write(&[i]);
        }
        let expected: Vec<u8> = (16u8..32).collect();
        assert_eq!(ring.snapshot(), expected);
    }
}
