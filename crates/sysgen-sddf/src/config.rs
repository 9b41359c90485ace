//! Binary configuration blobs.
//!
//! Each connected subsystem emits one blob per participating PD, named
//! `{class}_{pd}.data` under the caller's output directory. A blob starts
//! with a four-byte class magic and a version byte; everything after is
//! packed little-endian. The graph core treats these as opaque output
//! artifacts.

use std::path::Path;

use crate::error::Result;

/// Blob format version.
pub const CONFIG_VERSION: u8 = 1;

/// Deterministic blob file name for one PD of one subsystem.
#[must_use]
pub fn blob_name(class: &str, pd: &str) -> String {
    format!("{class}_{pd}.data")
}

/// Little-endian byte packer for one configuration blob.
pub struct BlobWriter {
    data: Vec<u8>,
}

impl BlobWriter {
    /// Starts a blob with the class magic and format version.
    #[must_use]
    pub fn new(magic: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(&magic);
        data.push(CONFIG_VERSION);
        Self { data }
    }

    /// Appends a byte.
    pub fn u8(&mut self, value: u8) {
        self.data.push(value);
    }

    /// Appends a bool as one byte.
    pub fn flag(&mut self, value: bool) {
        self.data.push(u8::from(value));
    }

    /// Appends a little-endian u32.
    pub fn u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a little-endian u64.
    pub fn u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends raw bytes.
    pub fn bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Current blob contents.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Writes the blob to `dir/file`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the location is not writable; a partially
    /// written file is the caller's concern.
    pub fn write_to(&self, dir: &Path, file: &str) -> Result<()> {
        let path = dir.join(file);
        std::fs::write(&path, &self.data)?;
        tracing::info!(path = %path.display(), bytes = self.data.len(), "wrote config blob");
        Ok(())
    }
}
