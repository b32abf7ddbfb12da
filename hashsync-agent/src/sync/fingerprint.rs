//! Content addressing.
//!
//! A file's fingerprint is the lowercase hex MD5 of its bytes. The stored
//! object for a fingerprint lives at `<prefix>/<fingerprint>`, so two files
//! with equal content always share one object.

use crate::config::Location;
use crate::utils::errors::{Result, SyncError};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Compute the content fingerprint of a file.
///
/// Read failures are reported as transient so the caller's retry budget applies.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    fingerprint_file_sized(path).map(|(fingerprint, _)| fingerprint)
}

/// Fingerprint of a file together with the number of bytes it was taken over.
pub fn fingerprint_file_sized(path: &Path) -> Result<(String, u64)> {
    fingerprint_reader(File::open(path).map_err(|e| read_error(path, e))?)
        .map_err(|e| read_error(path, e))
}

/// Compute the content fingerprint and length of any byte stream.
pub fn fingerprint_reader<R: Read>(reader: R) -> io::Result<(String, u64)> {
    let mut reader = DigestReader::new(reader);
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    while reader.read(&mut buffer)? > 0 {}

    Ok(reader.finish())
}

/// Reader adapter that fingerprints everything read through it.
pub struct DigestReader<R> {
    inner: R,
    context: md5::Context,
    length: u64,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            context: md5::Context::new(),
            length: 0,
        }
    }

    /// Fingerprint and length of the bytes read so far.
    pub fn finish(self) -> (String, u64) {
        (format!("{:x}", self.context.compute()), self.length)
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.context.consume(&buf[..n]);
        self.length += n as u64;
        Ok(n)
    }
}

pub fn fingerprint_bytes(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Object key holding the content for `fingerprint` under `location`.
pub fn object_key(location: &Location, fingerprint: &str) -> String {
    location.key(fingerprint)
}

fn read_error(path: &Path, err: io::Error) -> SyncError {
    SyncError::Transient(format!("reading {}: {}", path.display(), err))
}
