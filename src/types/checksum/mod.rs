//! Checksums guarding merge-log frames.

/// Incremental 32-bit checksum.
pub trait Checksum {
    /// Forgets every byte fed so far.
    fn reset(&mut self);
    /// Feeds `bytes`.
    fn update(&mut self, bytes: &[u8]);
    /// Checksum of the bytes fed so far; feeding may continue afterwards.
    fn finalize(&self) -> u32;
}

/// [`Checksum`] backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC32 over a sequence of chunks, as if they were one contiguous buffer.
pub fn crc32(chunks: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}
