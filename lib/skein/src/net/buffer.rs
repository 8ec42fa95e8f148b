use slice_deque::SliceDeque;
use std::collections::VecDeque;
use std::io;

/// A contiguous byte FIFO backed by a mirrored ring. Producers append at
/// the tail, consumers inspect the full readable span and consume from the
/// head. Used for stream reassembly (the gate's frame decoder).
pub struct Buffer {
    data: SliceDeque<u8>,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer {
            data: SliceDeque::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Everything readable, as one slice.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Drop `count` bytes off the head.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.data.len());
        unsafe { self.data.move_head(count as isize) }
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        self.consume(len);
    }
}

/// One buffered write, possibly partially sent.
struct Chunk {
    data: Box<[u8]>,
    offset: usize,
}

impl Chunk {
    #[inline]
    fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }
}

/// Result of flushing the write queue into a socket.
#[derive(Debug, Eq, PartialEq)]
pub enum Flush {
    /// Everything buffered went out.
    Drained(usize),
    /// The socket stopped accepting; bytes written so far.
    Blocked(usize),
}

/// Two-priority write queue for one socket. High drains fully before low is
/// touched; `warn_threshold` doubles after each report so a slow peer does
/// not flood the owner with warnings.
pub struct WriteQueue {
    high: VecDeque<Chunk>,
    low: VecDeque<Chunk>,
    buffered: usize,
    warn_threshold: usize,
    warn_base: usize,
}

impl WriteQueue {
    pub fn new(warn_base: usize) -> WriteQueue {
        WriteQueue {
            high: VecDeque::new(),
            low: VecDeque::new(),
            buffered: 0,
            warn_threshold: warn_base,
            warn_base,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }

    /// Bytes currently buffered across both priorities.
    #[inline]
    pub fn size(&self) -> usize {
        self.buffered
    }

    pub fn push_high(&mut self, data: Box<[u8]>) {
        self.buffered += data.len();
        self.high.push_back(Chunk { data, offset: 0 });
    }

    pub fn push_low(&mut self, data: Box<[u8]>) {
        self.buffered += data.len();
        self.low.push_back(Chunk { data, offset: 0 });
    }

    /// Report once per threshold crossing, in KiB buffered.
    pub fn take_warning(&mut self) -> Option<usize> {
        if self.buffered > self.warn_threshold {
            self.warn_threshold = self.warn_threshold.saturating_mul(2);
            Some((self.buffered + 1023) / 1024)
        } else {
            None
        }
    }

    /// Reset the warning ratchet once the queue has drained.
    fn reset_warning(&mut self) {
        self.warn_threshold = self.warn_base;
    }

    /// Write as much as the socket accepts. `WouldBlock` is not an error;
    /// anything else propagates to the caller for the force-close path.
    pub fn flush<W: io::Write>(&mut self, mut writer: W) -> io::Result<Flush> {
        let mut total = 0;

        loop {
            let queue = if !self.high.is_empty() {
                &mut self.high
            } else if !self.low.is_empty() {
                &mut self.low
            } else {
                self.reset_warning();
                return Ok(Flush::Drained(total));
            };

            let chunk = queue.front_mut().expect("non-empty queue");
            match writer.write(chunk.remaining()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    total += count;
                    self.buffered -= count;
                    chunk.offset += count;
                    if chunk.offset == chunk.data.len() {
                        queue.pop_front();
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Flush::Blocked(total));
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockSocket {
        accepted: Vec<u8>,
        budget: usize,
        chunk: usize,
    }

    impl MockSocket {
        fn new(budget: usize, chunk: usize) -> MockSocket {
            MockSocket {
                accepted: Vec::new(),
                budget,
                chunk,
            }
        }
    }

    impl io::Write for MockSocket {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let count = min(min(self.chunk, buf.len()), self.budget);
            self.accepted.extend_from_slice(&buf[..count]);
            self.budget -= count;
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_buffer_push_consume() {
        let mut buffer = Buffer::new();
        buffer.push(b"hello");
        buffer.push(b" world");
        assert_eq!(buffer.peek(), b"hello world");
        buffer.consume(6);
        assert_eq!(buffer.peek(), b"world");
        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_flush_drains_high_before_low() {
        let mut queue = WriteQueue::new(1 << 20);
        queue.push_low(Box::from(&b"low"[..]));
        queue.push_high(Box::from(&b"high"[..]));
        assert_eq!(queue.size(), 7);

        let mut socket = MockSocket::new(1024, 1024);
        assert_eq!(queue.flush(&mut socket).unwrap(), Flush::Drained(7));
        assert_eq!(socket.accepted, b"highlow");
        assert!(queue.is_empty());
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_flush_partial_resumes_mid_chunk() {
        let mut queue = WriteQueue::new(1 << 20);
        queue.push_high(Box::from(&b"abcdefgh"[..]));

        let mut socket = MockSocket::new(3, 2);
        assert_eq!(queue.flush(&mut socket).unwrap(), Flush::Blocked(3));
        assert_eq!(socket.accepted, b"abc");
        assert_eq!(queue.size(), 5);

        let mut socket = MockSocket::new(100, 100);
        assert_eq!(queue.flush(&mut socket).unwrap(), Flush::Drained(5));
        assert_eq!(socket.accepted, b"defgh");
    }

    #[test]
    fn test_write_zero_is_fatal() {
        struct Zero;
        impl io::Write for Zero {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut queue = WriteQueue::new(1 << 20);
        queue.push_high(Box::from(&b"x"[..]));
        let err = queue.flush(Zero).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_warning_threshold_doubles() {
        let mut queue = WriteQueue::new(8);
        queue.push_high(Box::from(&[0u8; 10][..]));
        assert_eq!(queue.take_warning(), Some(1));
        assert_eq!(queue.take_warning(), None);
        queue.push_high(Box::from(&[0u8; 10][..]));
        // 20 bytes > doubled threshold of 16.
        assert_eq!(queue.take_warning(), Some(1));
    }

    #[test]
    fn test_warning_resets_after_drain() {
        let mut queue = WriteQueue::new(8);
        queue.push_high(Box::from(&[0u8; 10][..]));
        assert!(queue.take_warning().is_some());

        let mut socket = MockSocket::new(1024, 1024);
        queue.flush(&mut socket).unwrap();

        queue.push_high(Box::from(&[0u8; 10][..]));
        assert!(queue.take_warning().is_some(), "threshold must re-arm after drain");
    }
}
