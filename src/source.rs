//! Byte sources feeding the demuxer.

use std::io::{self, Read, Seek, SeekFrom};

/// Random access byte provider used in pull mode.
pub trait Source: Send {
    /// Reads up to `length` bytes starting at `offset`.
    ///
    /// Returns `Ok(None)` when `offset` is at or past the end of the data. A short read is
    /// allowed near the end.
    fn read_range(&mut self, offset: u64, length: usize) -> io::Result<Option<Vec<u8>>>;

    /// Total length in bytes, if known.
    fn query_length(&mut self) -> Option<u64>;
}

/// Wraps any `Read + Seek` as a [`Source`].
pub struct ReadSeekSource<T: Read + Seek + Send> {
    inner: T,
    byte_len: Option<u64>,
}

impl<T: Read + Seek + Send> ReadSeekSource<T> {
    /// Instantiates a new `ReadSeekSource<T>` by taking ownership and wrapping the provided
    /// `Read + Seek`er. When `byte_len` is `None` the length is probed by seeking to the end.
    #[inline]
    pub fn new(inner: T, byte_len: Option<u64>) -> Self {
        ReadSeekSource { inner, byte_len }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read + Seek + Send> Source for ReadSeekSource<T> {
    fn read_range(&mut self, offset: u64, length: usize) -> io::Result<Option<Vec<u8>>> {
        if let Some(len) = self.query_length() {
            if offset >= len {
                return Ok(None);
            }
        }
        self.inner.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(length);
        (&mut self.inner).take(length as u64).read_to_end(&mut buf)?;
        if buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(buf))
    }

    fn query_length(&mut self) -> Option<u64> {
        if self.byte_len.is_none() {
            let current = self.inner.stream_position().ok()?;
            let end = self.inner.seek(SeekFrom::End(0)).ok()?;
            self.inner.seek(SeekFrom::Start(current)).ok()?;
            self.byte_len = Some(end);
        }
        self.byte_len
    }
}

/// Placeholder source for controllers fed with [`push_bytes`](crate::DemuxController::push_bytes).
///
/// It has no data and no length, so every random access operation fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct PushOnly;

impl Source for PushOnly {
    fn read_range(&mut self, _offset: u64, _length: usize) -> io::Result<Option<Vec<u8>>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "push-only source has no random access",
        ))
    }

    fn query_length(&mut self) -> Option<u64> {
        None
    }
}
