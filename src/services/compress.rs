use crate::error::StageError;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Suffix appended to the remote key when a file is compressed on upload.
pub const GZIP_SUFFIX: &str = ".gz";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Whether the content is already gzip-compressed (magic bytes).
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[..2] == GZIP_MAGIC
}

pub fn gzip_bytes(data: &[u8]) -> Result<Vec<u8>, StageError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gunzip_bytes(data: &[u8]) -> Result<Vec<u8>, StageError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

const READ_CHUNK: usize = 64 * 1024;

/// Sequential part producer for one upload payload. The source file is read
/// in small chunks, gzip-encoded on the fly when requested, and handed out
/// as fixed-size parts, so the payload is never resident in full no matter
/// how large the file is. The payload size and SHA-256 accumulate as parts
/// are emitted.
///
/// All methods block on file I/O and compression; callers run them on a
/// blocking worker.
pub struct PartReader {
    file: File,
    encoder: Option<GzEncoder<Vec<u8>>>,
    part_size: usize,
    pending: Vec<u8>,
    hasher: Sha256,
    bytes_out: u64,
    eof: bool,
}

impl PartReader {
    pub fn open(path: &Path, compress: bool, part_size: usize) -> Result<Self, StageError> {
        Ok(Self {
            file: File::open(path)?,
            encoder: compress.then(|| GzEncoder::new(Vec::new(), Compression::default())),
            part_size,
            pending: Vec::new(),
            hasher: Sha256::new(),
            bytes_out: 0,
            eof: false,
        })
    }

    /// Next payload part: exactly `part_size` bytes except possibly the
    /// last, `None` once the payload is exhausted.
    pub fn next_part(&mut self) -> Result<Option<Vec<u8>>, StageError> {
        let mut chunk = vec![0u8; READ_CHUNK];
        while !self.eof && self.pending.len() < self.part_size {
            let n = self.file.read(&mut chunk)?;
            if n == 0 {
                self.eof = true;
                if let Some(encoder) = self.encoder.take() {
                    self.pending.extend_from_slice(&encoder.finish()?);
                }
            } else if let Some(encoder) = self.encoder.as_mut() {
                encoder.write_all(&chunk[..n])?;
                self.pending.append(encoder.get_mut());
            } else {
                self.pending.extend_from_slice(&chunk[..n]);
            }
        }
        if self.pending.is_empty() {
            return Ok(None);
        }
        let take = self.pending.len().min(self.part_size);
        let rest = self.pending.split_off(take);
        let part = std::mem::replace(&mut self.pending, rest);
        self.hasher.update(&part);
        self.bytes_out += part.len() as u64;
        Ok(Some(part))
    }

    /// Whether `next_part` can only return `None` from here on.
    pub fn finished(&self) -> bool {
        self.eof && self.pending.is_empty()
    }

    /// Total payload bytes emitted and their hex-encoded SHA-256.
    pub fn into_summary(self) -> (u64, String) {
        (self.bytes_out, hex::encode(self.hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_round_trip() {
        let original = b"123,test1\n456,test2\n".to_vec();
        let compressed = gzip_bytes(&original).unwrap();
        assert!(is_gzip(&compressed));
        assert_eq!(gunzip_bytes(&compressed).unwrap(), original);
    }

    #[test]
    fn test_is_gzip_rejects_plain_text() {
        assert!(!is_gzip(b"plain text"));
        assert!(!is_gzip(b""));
        assert!(!is_gzip(&[0x1f]));
    }

    #[test]
    fn test_part_reader_splits_plain_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let content: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let mut reader = PartReader::open(&path, false, 1024).unwrap();
        let mut parts = Vec::new();
        while let Some(part) = reader.next_part().unwrap() {
            parts.push(part);
        }
        assert!(reader.finished());
        let sizes: Vec<_> = parts.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1024, 1024, 452]);

        let (bytes_out, digest) = reader.into_summary();
        assert_eq!(bytes_out, 2500);
        assert_eq!(digest, crate::utils::digest::sha256_hex(&content));
    }

    #[test]
    fn test_part_reader_gzip_parts_reassemble() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv");
        let content = b"123,test1\n456,test2\n".repeat(40);
        std::fs::write(&path, &content).unwrap();

        // A tiny part size forces the gzip stream to span several parts.
        let mut reader = PartReader::open(&path, true, 32).unwrap();
        let mut payload = Vec::new();
        while let Some(part) = reader.next_part().unwrap() {
            assert!(part.len() <= 32);
            payload.extend_from_slice(&part);
        }
        let (bytes_out, _) = reader.into_summary();
        assert_eq!(bytes_out, payload.len() as u64);
        assert!(is_gzip(&payload));
        assert_eq!(gunzip_bytes(&payload).unwrap(), content);
    }

    #[test]
    fn test_part_reader_empty_file_yields_no_plain_parts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        let mut reader = PartReader::open(&path, false, 1024).unwrap();
        assert!(reader.next_part().unwrap().is_none());
        assert!(reader.finished());
        assert_eq!(reader.into_summary().0, 0);
    }
}
