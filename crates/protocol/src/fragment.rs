//! Artifact fragment payload, carried inside `Binary` frames on the
//! file-transfer service.
//!
//! # Wire format
//!
//! ```text
//! [2 bytes BE: dir_len]   [dir_len bytes: directory name UTF-8]
//! [2 bytes BE: path_len]  [path_len bytes: relative file path UTF-8]
//! [8 bytes BE: total_file_length]
//! [8 bytes BE: offset]
//! [4 bytes BE: fragment_length]
//! [fragment_length bytes: data]
//! ```

use crate::ProtocolError;

/// One slice of a file being uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFragment {
    /// Upload directory the file belongs to (forward slashes).
    pub directory: String,
    /// Path of the file inside `directory` (forward slashes).
    pub relative_path: String,
    /// Size of the complete file in bytes.
    pub total_length: u64,
    /// Byte offset of `data` within the file.
    pub offset: u64,
    pub data: Vec<u8>,
}

impl FileFragment {
    /// Reassembly key: `directory + "/" + relative_path`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.directory, self.relative_path)
    }

    /// Returns `true` if this fragment ends the file.
    pub fn is_last(&self) -> bool {
        self.offset + self.data.len() as u64 == self.total_length
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let dir = self.directory.as_bytes();
        let path = self.relative_path.as_bytes();
        for (what, len) in [("directory name", dir.len()), ("file path", path.len())] {
            if len > u16::MAX as usize {
                return Err(ProtocolError::Malformed(format!(
                    "{what} too long: {len} bytes (max {})",
                    u16::MAX
                )));
            }
        }
        if self.data.len() > u32::MAX as usize {
            return Err(ProtocolError::PayloadTooLarge {
                len: self.data.len(),
                max: u32::MAX as usize,
            });
        }

        let mut buf = Vec::with_capacity(2 + dir.len() + 2 + path.len() + 20 + self.data.len());
        buf.extend_from_slice(&(dir.len() as u16).to_be_bytes());
        buf.extend_from_slice(dir);
        buf.extend_from_slice(&(path.len() as u16).to_be_bytes());
        buf.extend_from_slice(path);
        buf.extend_from_slice(&self.total_length.to_be_bytes());
        buf.extend_from_slice(&self.offset.to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Parses a fragment payload.
    ///
    /// The declared fragment length must match the remaining bytes exactly
    /// and the fragment must lie within the declared file length.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor { buf: payload, pos: 0 };

        let dir_len = cursor.read_u16()? as usize;
        let directory = cursor.read_str(dir_len, "directory name")?;
        let path_len = cursor.read_u16()? as usize;
        let relative_path = cursor.read_str(path_len, "file path")?;
        let total_length = cursor.read_u64()?;
        let offset = cursor.read_u64()?;
        let data_len = cursor.read_u32()? as usize;

        let remaining = cursor.remaining();
        if data_len != remaining {
            return Err(ProtocolError::Malformed(format!(
                "fragment declares {data_len} bytes but carries {remaining}"
            )));
        }
        let data = cursor.take(data_len)?.to_vec();

        let end = offset.checked_add(data.len() as u64);
        if end.is_none_or(|end| end > total_length) {
            return Err(ProtocolError::Malformed(format!(
                "fragment at offset {offset} (+{}) exceeds file length {total_length}",
                data.len()
            )));
        }

        Ok(Self {
            directory,
            relative_path,
            total_length,
            offset,
            data,
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Malformed(format!(
                "truncated fragment: need {n} bytes at offset {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn read_str(&mut self, n: usize, what: &'static str) -> Result<String, ProtocolError> {
        let bytes = self.take(n)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8(what))
    }
}
