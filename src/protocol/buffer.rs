use std::io::{self, Write};

/// Largest serialized payload accepted by default.
pub const MAX_SERIALIZATION_BUF_SIZE_BYTES: usize = 32_000_000;

/// Growable byte buffer with a hard upper bound.
///
/// Starts with `initial_capacity` reserved and grows as needed; any write
/// that would take it past `max_size` fails and leaves the contents as
/// they were before that write.
#[derive(Debug)]
pub struct BoundedBuffer {
    buf: Vec<u8>,
    max_size: usize,
}

impl BoundedBuffer {
    pub fn new(initial_capacity: usize, max_size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(initial_capacity.min(max_size)),
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl Write for BoundedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.max_size {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("serialization buffer limit of {} bytes reached", self.max_size),
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grows_past_initial_capacity() {
        let mut buf = BoundedBuffer::new(4, 64);
        buf.write_all(&[1u8; 40]).expect("write within limit");
        assert_eq!(buf.len(), 40);
    }

    #[test]
    fn test_write_past_max_fails_without_partial_data() {
        let mut buf = BoundedBuffer::new(4, 8);
        buf.write_all(b"abcdef").expect("first write");
        let err = buf.write_all(b"ghi").expect_err("over limit");
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
        assert_eq!(buf.as_slice(), b"abcdef");
    }

    #[test]
    fn test_exact_fit() {
        let mut buf = BoundedBuffer::new(0, 3);
        buf.write_all(b"abc").expect("exact fit");
        assert_eq!(buf.into_inner(), b"abc");
    }
}
