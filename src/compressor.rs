//! Pluggable compression capability.
//!
//! Concrete LZ4/GZIP codecs are an external collaborator in spirit: the
//! record engine only depends on the [`Compressor`] trait, and the
//! implementations here are thin adapters over `flate2` and `lz4`.

use std::io::{Read, Write};

use crate::error::{HipoError, Result};

/// Compression kind, matching the 4-bit code stored in a record header's
/// word 10 (high nibble).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Lz4Fast = 1,
    Lz4Best = 2,
    Gzip = 3,
}

impl CompressionType {
    /// Decode the 4-bit compression code from a header word.
    pub const fn kind_from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4Fast),
            2 => Ok(Self::Lz4Best),
            3 => Ok(Self::Gzip),
            _ => Err(HipoError::BadHeader(String::new())),
        }
    }

    /// The 4-bit code this kind is stored as in a header word.
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Whether this kind represents actual compression (as opposed to
    /// [`CompressionType::None`]).
    pub const fn is_compressed(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl Default for CompressionType {
    fn default() -> Self {
        Self::None
    }
}

/// Uncompress/compress byte ranges for one compression kind.
///
/// No state is shared across calls; implementations are stateless
/// adapters over a real codec crate.
pub trait Compressor {
    /// Decompress an LZ4 frame from `src[src_off..src_off+compressed_len]`
    /// into `dst`, starting at `dst`'s current length. Returns the number
    /// of uncompressed bytes appended.
    fn uncompress_lz4(
        &self,
        src: &[u8],
        src_off: usize,
        compressed_len: usize,
        dst: &mut Vec<u8>,
    ) -> Result<usize>;

    /// Decompress a GZIP member, returning owned bytes.
    fn uncompress_gzip(&self, src: &[u8], src_off: usize, compressed_len: usize) -> Result<Vec<u8>>;

    /// Compress `src[src_off..src_off+src_len]` into
    /// `dst[dst_off..dst_off+dst_capacity]` using the fast LZ4 mode.
    /// Returns the compressed length.
    fn compress_lz4_fast(
        &self,
        src: &[u8],
        src_off: usize,
        src_len: usize,
        dst: &mut [u8],
        dst_off: usize,
        dst_capacity: usize,
    ) -> Result<usize>;

    /// Same as [`compress_lz4_fast`](Self::compress_lz4_fast) but using
    /// the higher-ratio LZ4 mode.
    fn compress_lz4_best(
        &self,
        src: &[u8],
        src_off: usize,
        src_len: usize,
        dst: &mut [u8],
        dst_off: usize,
        dst_capacity: usize,
    ) -> Result<usize>;

    /// Compress `src[src_off..src_off+src_len]` as a GZIP member,
    /// returning owned bytes.
    fn compress_gzip(&self, src: &[u8], src_off: usize, src_len: usize) -> Result<Vec<u8>>;
}

/// Default [`Compressor`] backed by `flate2` (GZIP) and `lz4` (LZ4).
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCompressor;

impl Compressor for DefaultCompressor {
    fn uncompress_lz4(
        &self,
        src: &[u8],
        src_off: usize,
        compressed_len: usize,
        dst: &mut Vec<u8>,
    ) -> Result<usize> {
        let frame = &src[src_off..src_off + compressed_len];
        let decompressed =
            lz4::block::decompress(frame, None).map_err(|e| HipoError::CompressError(e.to_string()))?;
        let n = decompressed.len();
        dst.extend_from_slice(&decompressed);
        Ok(n)
    }

    fn uncompress_gzip(
        &self,
        src: &[u8],
        src_off: usize,
        compressed_len: usize,
    ) -> Result<Vec<u8>> {
        let frame = &src[src_off..src_off + compressed_len];
        let mut decoder = flate2::read::GzDecoder::new(frame);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| HipoError::CompressError(e.to_string()))?;
        Ok(out)
    }

    fn compress_lz4_fast(
        &self,
        src: &[u8],
        src_off: usize,
        src_len: usize,
        dst: &mut [u8],
        dst_off: usize,
        dst_capacity: usize,
    ) -> Result<usize> {
        compress_lz4_into(
            &src[src_off..src_off + src_len],
            dst,
            dst_off,
            dst_capacity,
            lz4::block::CompressionMode::FAST(1),
        )
    }

    fn compress_lz4_best(
        &self,
        src: &[u8],
        src_off: usize,
        src_len: usize,
        dst: &mut [u8],
        dst_off: usize,
        dst_capacity: usize,
    ) -> Result<usize> {
        compress_lz4_into(
            &src[src_off..src_off + src_len],
            dst,
            dst_off,
            dst_capacity,
            lz4::block::CompressionMode::HIGHCOMPRESSION(9),
        )
    }

    fn compress_gzip(&self, src: &[u8], src_off: usize, src_len: usize) -> Result<Vec<u8>> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(&src[src_off..src_off + src_len])
            .map_err(|e| HipoError::CompressError(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| HipoError::CompressError(e.to_string()))
    }
}

fn compress_lz4_into(
    src: &[u8],
    dst: &mut [u8],
    dst_off: usize,
    dst_capacity: usize,
    mode: lz4::block::CompressionMode,
) -> Result<usize> {
    // Prepend the uncompressed size so `lz4::block::decompress` can read
    // frames back without the caller needing to pass the size through.
    let compressed = lz4::block::compress(src, Some(mode), true)
        .map_err(|e| HipoError::CompressError(e.to_string()))?;
    if compressed.len() > dst_capacity {
        return Err(HipoError::BufferTooSmall {
            needed: compressed.len(),
            available: dst_capacity,
        });
    }
    dst[dst_off..dst_off + compressed.len()].copy_from_slice(&compressed);
    Ok(compressed.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_code_roundtrips() {
        for kind in [
            CompressionType::None,
            CompressionType::Lz4Fast,
            CompressionType::Lz4Best,
            CompressionType::Gzip,
        ] {
            assert_eq!(CompressionType::kind_from_code(kind.code()).unwrap(), kind);
        }
    }

    #[test]
    fn is_compressed() {
        assert!(!CompressionType::None.is_compressed());
        assert!(CompressionType::Lz4Fast.is_compressed());
        assert!(CompressionType::Lz4Best.is_compressed());
        assert!(CompressionType::Gzip.is_compressed());
    }

    #[test]
    fn gzip_round_trip() {
        let c = DefaultCompressor;
        let data = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let compressed = c.compress_gzip(&data, 0, data.len()).unwrap();
        let decompressed = c.uncompress_gzip(&compressed, 0, compressed.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn lz4_fast_round_trip() {
        let c = DefaultCompressor;
        let data = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let mut dst = vec![0u8; data.len() * 2];
        let n = c
            .compress_lz4_fast(&data, 0, data.len(), &mut dst, 0, dst.len())
            .unwrap();
        let mut out = Vec::new();
        let got = c.uncompress_lz4(&dst, 0, n, &mut out).unwrap();
        assert_eq!(got, data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn lz4_best_round_trip() {
        let c = DefaultCompressor;
        let data = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let mut dst = vec![0u8; data.len() * 2];
        let n = c
            .compress_lz4_best(&data, 0, data.len(), &mut dst, 0, dst.len())
            .unwrap();
        let mut out = Vec::new();
        let got = c.uncompress_lz4(&dst, 0, n, &mut out).unwrap();
        assert_eq!(got, data.len());
        assert_eq!(out, data);
    }
}
