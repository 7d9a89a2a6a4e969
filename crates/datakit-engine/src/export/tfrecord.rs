//! TFRecord framing.
//!
//! Each record is `u64 length (LE) | masked crc32c(length) | payload |
//! masked crc32c(payload)`.

use std::io::{self, Read, Write};

const CRC32C_POLY: u32 = 0x82F6_3B78;
const MASK_DELTA: u32 = 0xA282_EAD8;

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        #[allow(clippy::cast_possible_truncation)]
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 1 { (crc >> 1) ^ CRC32C_POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = crc_table();

/// CRC-32C (Castagnoli).
#[must_use]
pub fn crc32c(bytes: &[u8]) -> u32 {
    !bytes.iter().fold(!0u32, |crc, &b| {
        CRC_TABLE[((crc ^ u32::from(b)) & 0xFF) as usize] ^ (crc >> 8)
    })
}

#[must_use]
pub fn masked_crc(bytes: &[u8]) -> u32 {
    crc32c(bytes).rotate_right(15).wrapping_add(MASK_DELTA)
}

#[derive(Debug, thiserror::Error)]
pub enum TfRecordError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("record {0}: length checksum mismatch")]
    LengthChecksum(u64),
    #[error("record {0}: payload checksum mismatch")]
    DataChecksum(u64),
    #[error("record {0}: truncated")]
    Truncated(u64),
}

/// Appends framed records to a byte sink.
pub struct TfRecordWriter<W: Write> {
    inner: W,
    records: u64,
}

impl<W: Write> TfRecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, records: 0 }
    }

    pub fn write_record(&mut self, payload: &[u8]) -> io::Result<()> {
        let len = (payload.len() as u64).to_le_bytes();
        self.inner.write_all(&len)?;
        self.inner.write_all(&masked_crc(&len).to_le_bytes())?;
        self.inner.write_all(payload)?;
        self.inner.write_all(&masked_crc(payload).to_le_bytes())?;
        self.records += 1;
        Ok(())
    }

    #[must_use]
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Flush and hand back the sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Iterates the payloads of a framed byte stream, verifying both checksums.
pub struct TfRecordReader<R: Read> {
    inner: R,
    index: u64,
    done: bool,
}

impl<R: Read> TfRecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            index: 0,
            done: false,
        }
    }

    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool, TfRecordError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(TfRecordError::Truncated(self.index));
            }
            filled += n;
        }
        Ok(true)
    }

    fn read_u32(&mut self) -> Result<u32, TfRecordError> {
        let mut buf = [0u8; 4];
        if !self.read_exact_or_eof(&mut buf)? {
            return Err(TfRecordError::Truncated(self.index));
        }
        Ok(u32::from_le_bytes(buf))
    }

    fn next_record(&mut self) -> Result<Option<Vec<u8>>, TfRecordError> {
        let mut len = [0u8; 8];
        if !self.read_exact_or_eof(&mut len)? {
            return Ok(None);
        }
        if self.read_u32()? != masked_crc(&len) {
            return Err(TfRecordError::LengthChecksum(self.index));
        }
        let size = usize::try_from(u64::from_le_bytes(len)).map_err(|_| TfRecordError::Truncated(self.index))?;
        let mut payload = vec![0u8; size];
        if size > 0 && !self.read_exact_or_eof(&mut payload)? {
            return Err(TfRecordError::Truncated(self.index));
        }
        if self.read_u32()? != masked_crc(&payload) {
            return Err(TfRecordError::DataChecksum(self.index));
        }
        self.index += 1;
        Ok(Some(payload))
    }
}

impl<R: Read> Iterator for TfRecordReader<R> {
    type Item = Result<Vec<u8>, TfRecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(payload)) => Some(Ok(payload)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_known_vectors() {
        assert_eq!(crc32c(b"123456789"), 0xE306_9283);
        assert_eq!(crc32c(&[0u8; 32]), 0x8A91_36AA);
        assert_eq!(crc32c(b""), 0);
    }

    #[test]
    fn test_framing_layout() {
        let mut writer = TfRecordWriter::new(Vec::new());
        writer.write_record(b"abc").unwrap();
        assert_eq!(writer.records(), 1);
        let bytes = writer.finish().unwrap();
        assert_eq!(bytes.len(), 8 + 4 + 3 + 4);
        assert_eq!(&bytes[..8], &3u64.to_le_bytes());
        assert_eq!(&bytes[12..15], b"abc");
        assert_eq!(&bytes[15..], &masked_crc(b"abc").to_le_bytes());
    }

    #[test]
    fn test_reader_yields_payloads() {
        let mut writer = TfRecordWriter::new(Vec::new());
        for payload in [&b"one"[..], b"", b"three"] {
            writer.write_record(payload).unwrap();
        }
        let bytes = writer.finish().unwrap();
        let payloads: Vec<Vec<u8>> = TfRecordReader::new(bytes.as_slice())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(payloads, vec![b"one".to_vec(), Vec::new(), b"three".to_vec()]);
    }

    #[test]
    fn test_corruption_detected() {
        let mut writer = TfRecordWriter::new(Vec::new());
        writer.write_record(b"payload").unwrap();
        let mut bytes = writer.finish().unwrap();
        bytes[13] ^= 0xFF;
        let err = TfRecordReader::new(bytes.as_slice()).next().unwrap().unwrap_err();
        assert!(matches!(err, TfRecordError::DataChecksum(0)));

        let mut writer = TfRecordWriter::new(Vec::new());
        writer.write_record(b"payload").unwrap();
        let bytes = writer.finish().unwrap();
        let err = TfRecordReader::new(&bytes[..bytes.len() - 2]).next().unwrap().unwrap_err();
        assert!(matches!(err, TfRecordError::Truncated(0)));
    }
}
