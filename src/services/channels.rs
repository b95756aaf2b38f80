//! Byte channels handed out by the filesystem service.
//!
//! `ObjectReader` serves reads out of a ranged-get buffer and can be
//! repositioned at any time. `ObjectWriter` accumulates bytes and performs a
//! single put on `close`; nothing is visible in the store before that.

use crate::{
    errors::{FsError, FsResult},
    models::path::ObjectPath,
    store::{ObjectStore, WriteMode},
};
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::debug;

/// Default size of the read-ahead buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub write_mode: WriteMode,
}

impl CreateOptions {
    pub fn create_new() -> Self {
        Self {
            write_mode: WriteMode::CreateNew,
        }
    }

    pub fn overwrite() -> Self {
        Self {
            write_mode: WriteMode::Overwrite,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOptions {
    /// Bytes fetched per ranged get. Larger reads bypass the buffer.
    pub buffer_size: usize,
    /// Check existence on `open`. When false, a missing object is only
    /// reported by the first `read` or `size` call.
    pub fast_fail_on_not_found: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_READ_BUFFER_SIZE,
            fast_fail_on_not_found: true,
        }
    }
}

/// Seekable byte source over one object.
pub struct ObjectReader {
    store: Arc<dyn ObjectStore>,
    path: ObjectPath,
    size: Option<u64>,
    position: u64,
    buffer: Bytes,
    buffer_start: u64,
    buffer_size: usize,
}

impl ObjectReader {
    pub(crate) fn new(
        store: Arc<dyn ObjectStore>,
        path: ObjectPath,
        size: Option<u64>,
        options: &ReadOptions,
    ) -> Self {
        Self {
            store,
            path,
            size,
            position: 0,
            buffer: Bytes::new(),
            buffer_start: 0,
            buffer_size: options.buffer_size.max(1),
        }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the read position. Positions past the end make `read` return 0.
    pub fn seek(&mut self, position: u64) {
        self.position = position;
    }

    /// Object size, looked up on first use when `open` skipped the check.
    pub async fn size(&mut self) -> FsResult<u64> {
        if let Some(size) = self.size {
            return Ok(size);
        }
        let info = self
            .store
            .head(self.path.bucket(), self.path.key())
            .await?
            .ok_or_else(|| FsError::NotFound(self.path.to_string()))?;
        self.size = Some(info.size);
        Ok(info.size)
    }

    /// Fill as much of `buf` as the object allows from the current position.
    ///
    /// Returns the number of bytes copied; 0 means end of object.
    pub async fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let size = self.size().await?;
        let mut filled = 0;

        while filled < buf.len() && self.position < size {
            let cached = self.buffered();
            if !cached.is_empty() {
                let n = cached.len().min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&cached[..n]);
                filled += n;
                self.position += n as u64;
                continue;
            }

            let remaining = buf.len() - filled;
            if remaining >= self.buffer_size {
                let end = (self.position + remaining as u64).min(size);
                let bytes = self.fetch(end).await?;
                if bytes.is_empty() {
                    break;
                }
                buf[filled..filled + bytes.len()].copy_from_slice(&bytes);
                filled += bytes.len();
                self.position += bytes.len() as u64;
                continue;
            }

            let end = (self.position + self.buffer_size as u64).min(size);
            let bytes = self.fetch(end).await?;
            if bytes.is_empty() {
                break;
            }
            self.buffer_start = self.position;
            self.buffer = bytes;
        }

        Ok(filled)
    }

    /// Read from the current position to the end of the object.
    pub async fn read_to_end(&mut self) -> FsResult<Vec<u8>> {
        let size = self.size().await?;
        let mut out = vec![0u8; size.saturating_sub(self.position) as usize];
        let n = self.read(&mut out).await?;
        out.truncate(n);
        Ok(out)
    }

    fn buffered(&self) -> &[u8] {
        let end = self.buffer_start + self.buffer.len() as u64;
        if self.position >= self.buffer_start && self.position < end {
            &self.buffer[(self.position - self.buffer_start) as usize..]
        } else {
            &[]
        }
    }

    async fn fetch(&self, end: u64) -> FsResult<Bytes> {
        debug!("ranged read {}..{} of {}", self.position, end, self.path);
        Ok(self
            .store
            .get(self.path.bucket(), self.path.key(), Some(self.position..end))
            .await?)
    }
}

/// Writable byte sink for one object. Dropping it without `close` discards
/// everything written.
pub struct ObjectWriter {
    store: Arc<dyn ObjectStore>,
    path: ObjectPath,
    mode: WriteMode,
    buffer: BytesMut,
}

impl ObjectWriter {
    pub(crate) fn new(store: Arc<dyn ObjectStore>, path: ObjectPath, mode: WriteMode) -> Self {
        Self {
            store,
            path,
            mode,
            buffer: BytesMut::new(),
        }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    /// Append `data`; always accepts the whole slice.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.buffer.extend_from_slice(data);
        data.len()
    }

    pub fn len(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Store the accumulated bytes and return how many were written.
    ///
    /// Under `CreateNew` the store rejects the put if another writer got to
    /// the key first.
    pub async fn close(self) -> FsResult<u64> {
        let data = self.buffer.freeze();
        let info = self
            .store
            .put(self.path.bucket(), self.path.key(), data, self.mode)
            .await?;
        debug!("closed {} ({} bytes)", self.path, info.size);
        Ok(info.size)
    }
}
