use crate::bridge::error::Error;
use std::path::Path;

/// Script path buffer written into the debugee, exactly `script_path_size` bytes long.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoaderBuffer {
    pub bytes: Vec<u8>,
    /// Path bytes before the first NUL.
    pub path_len: usize,
    pub truncated: bool,
}

impl LoaderBuffer {
    /// Encode a loader path into a null padded buffer of `size` bytes.
    ///
    /// A path longer than `size - 1` bytes is truncated, the last byte is always NUL.
    pub fn prepare(path: &Path, size: u64) -> Result<Self, Error> {
        if size == 0 {
            return Err(Error::LoaderPath("empty script path buffer"));
        }
        let size = usize::try_from(size).map_err(|_| Error::LoaderPath("buffer too large"))?;

        let path = path.to_string_lossy();
        let raw = path.as_bytes();
        if raw.is_empty() {
            return Err(Error::LoaderPath("empty path"));
        }
        if raw.contains(&0) {
            return Err(Error::LoaderPath("interior NUL"));
        }

        let path_len = raw.len().min(size - 1);
        let mut bytes = vec![0; size];
        bytes[..path_len].copy_from_slice(&raw[..path_len]);

        Ok(Self {
            bytes,
            path_len,
            truncated: path_len < raw.len(),
        })
    }

    /// Path bytes as written, without padding.
    pub fn path(&self) -> &[u8] {
        &self.bytes[..self.path_len]
    }
}
