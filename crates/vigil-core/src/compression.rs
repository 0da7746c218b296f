//! Raw deflate helpers shared by blob storage and the wire codec

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

/// Compress with raw deflate at the default level
pub fn deflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompress raw deflate data
pub fn inflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deflate_shrinks_repetitive_data() {
        let data = b"abcabcabc".repeat(500);
        let compressed = deflate(&data).unwrap();
        assert!(compressed.len() < data.len() / 10);
        assert_eq!(inflate(&compressed).unwrap(), data);
    }

    #[test]
    fn test_inflate_rejects_garbage() {
        assert!(inflate(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_empty_input() {
        let compressed = deflate(&[]).unwrap();
        assert!(inflate(&compressed).unwrap().is_empty());
    }
}
