//! The length-prefixed encoding OpenSSH uses for keys and certificates.

use crate::{VirshboxError, VirshboxResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Builds an SSH wire-format buffer.
#[derive(Debug, Default, Clone)]
pub struct SshWriter {
    buf: Vec<u8>,
}

/// Reads fields out of an SSH wire-format buffer.
#[derive(Debug, Clone)]
pub struct SshReader<'a> {
    data: &'a [u8],
    pos: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SshWriter {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a big-endian `uint32`.
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Appends a big-endian `uint64`.
    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Appends a length-prefixed byte string.
    pub fn put_string(&mut self, value: impl AsRef<[u8]>) -> &mut Self {
        let value = value.as_ref();
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
        self
    }

    /// Appends raw bytes without a length prefix.
    pub fn put_raw(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// The bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer and returns its buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl<'a> SshReader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Reads a big-endian `uint32`.
    pub fn read_u32(&mut self) -> VirshboxResult<u32> {
        let bytes = self.take(4)?;
        let mut array = [0u8; 4];
        array.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(array))
    }

    /// Reads a big-endian `uint64`.
    pub fn read_u64(&mut self) -> VirshboxResult<u64> {
        let bytes = self.take(8)?;
        let mut array = [0u8; 8];
        array.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(array))
    }

    /// Reads a length-prefixed byte string.
    pub fn read_string(&mut self) -> VirshboxResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> VirshboxResult<&'a str> {
        let bytes = self.read_string()?;
        std::str::from_utf8(bytes)
            .map_err(|_| VirshboxError::InvalidKey("string field is not valid utf-8".to_string()))
    }

    /// Reads `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> VirshboxResult<&'a [u8]> {
        self.take(len)
    }

    /// The offset of the next unread byte.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Whether every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, len: usize) -> VirshboxResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| VirshboxError::InvalidKey("truncated ssh wire data".to_string()))?;

        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strings_are_length_prefixed() {
        let mut writer = SshWriter::new();
        writer.put_string("ssh-ed25519").put_u32(7);

        assert_eq!(&writer.as_bytes()[..4], &[0, 0, 0, 11]);
        assert_eq!(&writer.as_bytes()[4..15], b"ssh-ed25519");
        assert_eq!(&writer.as_bytes()[15..], &[0, 0, 0, 7]);
    }

    #[test]
    fn test_reader_rejects_truncated_input() -> anyhow::Result<()> {
        let mut writer = SshWriter::new();
        writer.put_string("principal").put_u64(42);
        let bytes = writer.into_bytes();

        let mut reader = SshReader::new(&bytes);
        assert_eq!(reader.read_str()?, "principal");
        assert_eq!(reader.read_u64()?, 42);
        assert!(reader.is_empty());

        let mut short = SshReader::new(&bytes[..6]);
        assert!(matches!(
            short.read_string(),
            Err(VirshboxError::InvalidKey(_))
        ));
        Ok(())
    }
}
