//! Byte-range arithmetic for random-access reads
//!
//! Because every full encrypted chunk occupies exactly
//! `CHUNK_SIZE + TAG_SIZE` bytes, the backend byte range covering any
//! plaintext window is a constant-time computation once the header and
//! metadata lengths are known.

use crate::envelope::{CHUNK_DISK_SIZE, CHUNK_SIZE};

/// A plaintext byte range over an encrypted object
///
/// Created with the requested plaintext window, then resolved against the
/// object's header once its metadata is available (from cache or a first
/// fetch). After resolution it yields the chunk coordinates for
/// [`decrypt_packages`](crate::envelope::decrypt_packages) and the byte
/// range to request from the backend.
#[derive(Debug, Clone, Copy)]
pub struct RequestRange {
    /// Plaintext start offset
    pub start: u64,
    /// Resolved plaintext length; 0 until [`resolve`](Self::resolve) runs
    /// when the request was open-ended
    pub length: u64,
    requested_length: Option<u64>,
    header_length: u32,
    metadata_length: u32,
    file_size: u64,
}

impl RequestRange {
    /// A range starting at `start`; `length` of `None` means "to the end"
    pub fn new(start: u64, length: Option<u64>) -> Self {
        RequestRange {
            start,
            length: length.unwrap_or(0),
            requested_length: length,
            header_length: 0,
            metadata_length: 0,
            file_size: 0,
        }
    }

    /// Build an already-resolved range (tests and internal callers)
    pub fn resolved(
        start: u64,
        length: Option<u64>,
        header_length: u32,
        metadata_length: u32,
        file_size: u64,
    ) -> Self {
        let mut range = RequestRange::new(start, length);
        range.resolve(header_length, metadata_length, file_size);
        range
    }

    /// Fill in the object's header geometry and clamp the window to the
    /// plaintext size
    pub fn resolve(&mut self, header_length: u32, metadata_length: u32, file_size: u64) {
        self.header_length = header_length;
        self.metadata_length = metadata_length;
        self.file_size = file_size;

        if self.start >= file_size {
            self.length = 0;
            return;
        }
        let available = file_size - self.start;
        self.length = match self.requested_length {
            Some(l) => l.min(available),
            None => available,
        };
    }

    /// True when no plaintext needs to be produced
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Index of the first chunk holding the window (chunk 0 is metadata)
    pub fn start_package(&self) -> u32 {
        1 + (self.start / CHUNK_SIZE as u64) as u32
    }

    /// Plaintext bytes to discard from the first chunk
    pub fn skip_beginning(&self) -> u32 {
        (self.start % CHUNK_SIZE as u64) as u32
    }

    /// Offset of the data region: header plus length-prefixed metadata block
    fn data_offset(&self) -> u64 {
        self.header_length as u64 + 4 + self.metadata_length as u64
    }

    /// First backend byte to request
    pub fn start_bytes(&self) -> u64 {
        self.data_offset() + (self.start_package() as u64 - 1) * CHUNK_DISK_SIZE as u64
    }

    /// Number of backend bytes to request; the final chunk may come back
    /// short, which the decryptor tolerates
    pub fn length_bytes(&self) -> u64 {
        if self.length == 0 {
            return 0;
        }
        let end = self.start + self.length;
        let end_package = end.div_ceil(CHUNK_SIZE as u64);
        (end_package - (self.start_package() as u64 - 1)) * CHUNK_DISK_SIZE as u64
    }
}
