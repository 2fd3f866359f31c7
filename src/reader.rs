//! Restartable page cursor over a random access [`Source`].

use std::io;
use std::sync::Arc;

use crate::common::{assert_error_traits, log_trace};
use crate::page::{Page, PageSync, Sync, MAX_PAGE_SIZE};
use crate::source::Source;

/// Default number of bytes requested from the source per read.
pub const DEFAULT_CHUNK_SIZE: u64 = 8500;

/// Error returned when the underlying [`Source`] fails.
#[derive(Debug, thiserror::Error, Clone)]
#[error("failed to read from the byte source")]
pub struct ReadError(#[source] pub Arc<io::Error>);
assert_error_traits!(ReadError);

impl From<io::Error> for ReadError {
    fn from(err: io::Error) -> Self {
        ReadError(Arc::new(err))
    }
}

/// Result of asking a [`PageReader`] for a page.
#[derive(Debug, PartialEq, Eq)]
pub enum PageResult {
    /// A page starting at the given byte offset.
    Page { offset: u64, page: Page },
    /// The search boundary was reached before a complete page was found.
    BoundaryReached,
    /// The source has no more data.
    Eof,
}

/// Byte limit for [`PageReader::next_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// Read as much as needed.
    Unbounded,
    /// Do not look at bytes past `offset + n`.
    Bytes(u64),
}

/// Produces pages from a [`Source`] starting at an arbitrary byte offset.
///
/// `offset` always points at the first byte not yet framed (the start of the next page once
/// the sync has locked on), while `read_offset` is the next byte to request from the source.
pub struct PageReader<S> {
    source: S,
    sync: PageSync,
    offset: u64,
    read_offset: u64,
    length: Option<u64>,
    chunk_size: u64,
}

impl<S: Source> PageReader<S> {
    pub fn new(mut source: S, byte_len: Option<u64>, chunk_size: u64) -> Self {
        let length = byte_len.or_else(|| source.query_length());
        PageReader {
            source,
            sync: PageSync::new(),
            offset: 0,
            read_offset: 0,
            length,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Offset of the next unframed byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total length of the source, when known.
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Grows the read chunk so that two pages of this size fit in one read.
    pub fn update_chunk_size(&mut self, page: &Page) {
        let wanted = page.len() as u64 * 2;
        if wanted > self.chunk_size {
            log_trace!("updating chunk size to {wanted}");
            self.chunk_size = wanted;
        }
    }

    /// Repositions the cursor, dropping any partially framed data.
    pub fn seek_to(&mut self, offset: u64) {
        self.offset = offset;
        self.read_offset = offset;
        self.sync.reset();
    }

    /// Returns the next page at or after the current offset.
    ///
    /// Garbage bytes in front of a page are skipped and accounted for in the offset.
    pub fn next_page(&mut self, boundary: Boundary) -> Result<PageResult, ReadError> {
        let end_offset = match boundary {
            Boundary::Unbounded => None,
            Boundary::Bytes(n) => Some(self.offset + n),
        };

        loop {
            if let Some(end) = end_offset {
                if end > 0 && self.offset >= end {
                    return Ok(PageResult::BoundaryReached);
                }
            }

            match self.sync.page_seek() {
                Sync::Skipped(n) => {
                    self.offset += n as u64;
                    log_trace!("skipped {n} bytes, offset now {}", self.offset);
                }
                Sync::NeedMore => {
                    if let Some(result) = self.fill(end_offset)? {
                        return Ok(result);
                    }
                }
                Sync::Page(page) => {
                    let offset = self.offset;
                    self.offset += page.len() as u64;
                    return Ok(PageResult::Page { offset, page });
                }
            }
        }
    }

    /// Reads one chunk into the sync. Returns a terminal result when no data can be read.
    fn fill(&mut self, end_offset: Option<u64>) -> Result<Option<PageResult>, ReadError> {
        if let Some(end) = end_offset {
            if end > 0 && self.read_offset >= end {
                return Ok(Some(PageResult::BoundaryReached));
            }
        }
        if Some(self.read_offset) == self.length {
            return Ok(Some(PageResult::Eof));
        }

        match self
            .source
            .read_range(self.read_offset, self.chunk_size as usize)?
        {
            Some(data) => {
                self.read_offset += data.len() as u64;
                self.sync.feed(&data);
                Ok(None)
            }
            None => Ok(Some(PageResult::Eof)),
        }
    }

    /// Hands bytes pushed by upstream to the sync.
    ///
    /// Pushed data continues at the current read position; after an upstream byte seek, call
    /// [`seek_to`](Self::seek_to) with the new position first.
    pub fn feed(&mut self, data: &[u8]) {
        self.read_offset += data.len() as u64;
        self.sync.feed(data);
    }

    /// Frames the next page out of data already fed, without reading from the source.
    pub fn next_buffered(&mut self) -> Option<(u64, Page)> {
        loop {
            match self.sync.page_seek() {
                Sync::Skipped(n) => self.offset += n as u64,
                Sync::NeedMore => return None,
                Sync::Page(page) => {
                    let offset = self.offset;
                    self.offset += page.len() as u64;
                    return Some((offset, page));
                }
            }
        }
    }

    /// Returns the last page that starts before the current offset.
    ///
    /// On success the cursor is left just past the returned page.
    pub fn prev_page(&mut self) -> Result<PageResult, ReadError> {
        let end = self.offset;
        let mut begin = end;
        let mut found = None;

        while found.is_none() {
            if begin == 0 {
                return Ok(PageResult::Eof);
            }
            begin = begin.saturating_sub(self.chunk_size);
            self.seek_to(begin);

            while self.offset < end {
                let boundary = (end - self.offset).min(2 * MAX_PAGE_SIZE as u64);
                match self.next_page(Boundary::Bytes(boundary))? {
                    PageResult::BoundaryReached => break,
                    PageResult::Eof => return Ok(PageResult::Eof),
                    PageResult::Page { offset, .. } => found = Some(offset),
                }
            }
        }

        let offset = found.unwrap_or_default();
        self.seek_to(offset);
        self.next_page(Boundary::Unbounded)
    }
}
