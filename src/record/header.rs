//! Bit-exact codec for the 56-byte general record header.

use crate::compressor::CompressionType;
use crate::error::{HipoError, Result};

use super::{padded_len, words, HEADER_BYTES, HEADER_WORDS, MAGIC};

/// Byte order a header was (or will be) encoded in. Detected from the
/// magic word, never assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    #[inline]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Little => Self::Big,
            Self::Big => Self::Little,
        }
    }

    #[inline]
    fn read_u32(self, bytes: &[u8]) -> u32 {
        let arr: [u8; 4] = bytes.try_into().expect("4-byte slice");
        match self {
            Self::Little => u32::from_le_bytes(arr),
            Self::Big => u32::from_be_bytes(arr),
        }
    }

    #[inline]
    fn read_u64(self, bytes: &[u8]) -> u64 {
        let arr: [u8; 8] = bytes.try_into().expect("8-byte slice");
        match self {
            Self::Little => u64::from_le_bytes(arr),
            Self::Big => u64::from_be_bytes(arr),
        }
    }

    #[inline]
    fn write_u32(self, dst: &mut [u8], value: u32) {
        let bytes = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        dst[..4].copy_from_slice(&bytes);
    }

    #[inline]
    fn write_u64(self, dst: &mut [u8], value: u64) {
        let bytes = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        dst[..8].copy_from_slice(&bytes);
    }
}

impl Default for ByteOrder {
    /// The platform-neutral default used when no file has been read yet.
    fn default() -> Self {
        Self::Little
    }
}

/// The header-kind field packed into bits 28-31 of word 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    Record,
    EvioFileV1,
    EvioFileV2,
    Trailer,
    HipoRecord,
    HipoFileV1,
    HipoFileV2,
    HipoTrailer,
}

impl HeaderType {
    fn from_bits(bits: u32) -> Result<Self> {
        Ok(match bits {
            0 => Self::Record,
            1 => Self::EvioFileV1,
            2 => Self::EvioFileV2,
            3 => Self::Trailer,
            4 => Self::HipoRecord,
            5 => Self::HipoFileV1,
            6 => Self::HipoFileV2,
            7 => Self::HipoTrailer,
            other => {
                return Err(HipoError::BadHeader(format!(
                    "unknown header kind bits: {other}"
                )))
            }
        })
    }

    const fn bits(self) -> u32 {
        match self {
            Self::Record => 0,
            Self::EvioFileV1 => 1,
            Self::EvioFileV2 => 2,
            Self::Trailer => 3,
            Self::HipoRecord => 4,
            Self::HipoFileV1 => 5,
            Self::HipoFileV2 => 6,
            Self::HipoTrailer => 7,
        }
    }

    /// True for any trailer variant (evio or hipo).
    pub const fn is_trailer(self) -> bool {
        matches!(self, Self::Trailer | Self::HipoTrailer)
    }
}

/// The 56-byte general header shared by records and (with different
/// field meaning, see [`crate::record::FileHeader`]) files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub byte_order: ByteOrder,
    pub record_length_words: u32,
    pub record_number: u32,
    pub event_count: u32,
    pub index_length_bytes: u32,
    pub version: u8,
    pub has_dictionary: bool,
    pub is_last_record: bool,
    pub event_type: u8,
    pub user_header_pad: u8,
    pub data_pad: u8,
    pub compressed_pad: u8,
    pub header_type: HeaderType,
    pub user_header_length_bytes: u32,
    pub data_length_bytes: u32,
    pub compression_type: CompressionType,
    pub compressed_data_length_bytes: u32,
    pub user_register_1: u64,
    pub user_register_2: u64,
}

impl RecordHeader {
    /// Byte offset of the magic word within a header, word index 8
    /// (1-indexed) => `(8-1)*4`.
    pub(crate) const MAGIC_OFFSET: usize = 28;

    /// A bare, empty record header: no events, no user header, no
    /// compression. Matches what [`crate::record::RecordOutput::build`]
    /// emits for an empty record.
    pub fn empty(byte_order: ByteOrder, record_number: u32) -> Self {
        Self {
            byte_order,
            record_length_words: HEADER_WORDS,
            record_number,
            event_count: 0,
            index_length_bytes: 0,
            version: 6,
            has_dictionary: false,
            is_last_record: false,
            event_type: 0,
            user_header_pad: 0,
            data_pad: 0,
            compressed_pad: 0,
            header_type: HeaderType::Record,
            user_header_length_bytes: 0,
            data_length_bytes: 0,
            compression_type: CompressionType::None,
            compressed_data_length_bytes: 0,
            user_register_1: 0,
            user_register_2: 0,
        }
    }

    fn bit_info_word(&self) -> u32 {
        (self.version as u32)
            | (self.has_dictionary as u32) << 8
            | (self.is_last_record as u32) << 9
            | ((self.event_type as u32) & 0xF) << 10
            | ((self.user_header_pad as u32) & 0x3) << 20
            | ((self.data_pad as u32) & 0x3) << 22
            | ((self.compressed_pad as u32) & 0x3) << 24
            | self.header_type.bits() << 28
    }

    /// Detect endianness from the magic word and decode the 14 header
    /// words starting at `offset`. `declared` is the byte order to try
    /// first; on mismatch the opposite order is tried before failing.
    pub fn read(src: &[u8], offset: usize, declared: ByteOrder) -> Result<Self> {
        if src.len() < offset + HEADER_BYTES {
            return Err(HipoError::BufferTooSmall {
                needed: offset + HEADER_BYTES,
                available: src.len(),
            });
        }
        let magic_bytes = &src[offset + Self::MAGIC_OFFSET..offset + Self::MAGIC_OFFSET + 4];
        let byte_order = if declared.read_u32(magic_bytes) == MAGIC {
            declared
        } else if declared.opposite().read_u32(magic_bytes) == MAGIC {
            declared.opposite()
        } else {
            return Err(HipoError::NotHipo);
        };

        let word = |n: usize| byte_order.read_u32(&src[offset + (n - 1) * 4..offset + n * 4]);

        let record_length_words = word(1);
        let record_number = word(2);
        let header_length_words = word(3);
        let event_count = word(4);
        let index_length_bytes = word(5);
        let bit_info_word = word(6);
        let user_header_length_bytes = word(7);
        let data_length_bytes = word(9);
        let compression_word = word(10);
        let user_register_1 = byte_order.read_u64(&src[offset + 40..offset + 48]);
        let user_register_2 = byte_order.read_u64(&src[offset + 48..offset + 56]);

        let version = (bit_info_word & 0xFF) as u8;
        if version != 6 {
            return Err(HipoError::BadVersion(version));
        }
        if header_length_words != HEADER_WORDS {
            return Err(HipoError::BadHeader(format!(
                "header length {header_length_words} words, expected {HEADER_WORDS}"
            )));
        }
        if index_length_bytes != 0 && index_length_bytes != 4 * event_count {
            return Err(HipoError::BadHeader(format!(
                "index length {index_length_bytes} bytes inconsistent with {event_count} events"
            )));
        }

        let compression_type =
            CompressionType::kind_from_code(((compression_word >> 28) & 0xF) as u8)?;
        let compressed_data_length_bytes = compression_word & 0x0FFF_FFFF;

        let header = Self {
            byte_order,
            record_length_words,
            record_number,
            event_count,
            index_length_bytes,
            version,
            has_dictionary: (bit_info_word >> 8) & 1 != 0,
            is_last_record: (bit_info_word >> 9) & 1 != 0,
            event_type: ((bit_info_word >> 10) & 0xF) as u8,
            user_header_pad: ((bit_info_word >> 20) & 0x3) as u8,
            data_pad: ((bit_info_word >> 22) & 0x3) as u8,
            compressed_pad: ((bit_info_word >> 24) & 0x3) as u8,
            header_type: HeaderType::from_bits((bit_info_word >> 28) & 0xF)?,
            user_header_length_bytes,
            data_length_bytes,
            compression_type,
            compressed_data_length_bytes,
            user_register_1,
            user_register_2,
        };

        // spec invariant: record_length_words * 4 >= header_length +
        // padded(compressed_data_length). For uncompressed records
        // compressed_data_length is 0 by construction, so this is a
        // weak check there; the payload bound in that case is carried
        // by `uncompressed_record_length` instead.
        let min_bytes = HEADER_BYTES as u32 + padded_len(header.compressed_data_length_bytes);
        if header.record_length_words * 4 < min_bytes {
            return Err(HipoError::BadHeader(format!(
                "record length {} words too small for payload",
                header.record_length_words
            )));
        }

        Ok(header)
    }

    /// Encode this header's 14 words at `offset`, writing the magic in
    /// this header's own `byte_order` so downstream readers detect it
    /// correctly. `dst` must have at least `offset + 56` bytes.
    pub fn write(&self, dst: &mut [u8], offset: usize) -> Result<()> {
        if dst.len() < offset + HEADER_BYTES {
            return Err(HipoError::BufferTooSmall {
                needed: offset + HEADER_BYTES,
                available: dst.len(),
            });
        }
        let bo = self.byte_order;
        let mut put = |n: usize, value: u32| {
            bo.write_u32(&mut dst[offset + (n - 1) * 4..offset + n * 4], value);
        };
        put(1, self.record_length_words);
        put(2, self.record_number);
        put(3, HEADER_WORDS);
        put(4, self.event_count);
        put(5, self.index_length_bytes);
        put(6, self.bit_info_word());
        put(7, self.user_header_length_bytes);
        put(8, MAGIC);
        put(9, self.data_length_bytes);
        put(
            10,
            (self.compression_type.code() as u32) << 28 | (self.compressed_data_length_bytes & 0x0FFF_FFFF),
        );
        bo.write_u64(&mut dst[offset + 40..offset + 48], self.user_register_1);
        bo.write_u64(&mut dst[offset + 48..offset + 56], self.user_register_2);
        Ok(())
    }

    pub const fn header_length_bytes(&self) -> u32 {
        HEADER_WORDS * 4
    }

    pub const fn data_length_words(&self) -> u32 {
        words(self.data_length_bytes)
    }

    pub const fn compressed_data_length_words(&self) -> u32 {
        words(self.compressed_data_length_bytes)
    }

    pub const fn user_header_length_words(&self) -> u32 {
        words(self.user_header_length_bytes)
    }

    /// Total uncompressed size of index + padded user header + padded
    /// event payload, in bytes.
    pub const fn uncompressed_record_length(&self) -> u32 {
        self.header_length_bytes()
            + self.index_length_bytes
            + padded_len(self.user_header_length_bytes)
            + padded_len(self.data_length_bytes)
    }
}

impl std::fmt::Display for RecordHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "record #{} [{:?}]: {} events, {:?}, data={}B (pad {}/{}/{})",
            self.record_number,
            self.header_type,
            self.event_count,
            self.compression_type,
            self.data_length_bytes,
            self.user_header_pad,
            self.data_pad,
            self.compressed_pad,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(byte_order: ByteOrder) -> RecordHeader {
        RecordHeader {
            byte_order,
            record_length_words: 20,
            record_number: 7,
            event_count: 3,
            index_length_bytes: 12,
            version: 6,
            has_dictionary: true,
            is_last_record: false,
            event_type: 5,
            user_header_pad: 1,
            data_pad: 2,
            compressed_pad: 3,
            header_type: HeaderType::Record,
            user_header_length_bytes: 10,
            data_length_bytes: 64,
            compression_type: CompressionType::Lz4Fast,
            compressed_data_length_bytes: 40,
            user_register_1: 0x1122_3344_5566_7788,
            user_register_2: 0xAABB_CCDD_EEFF_0011,
        }
    }

    #[test]
    fn round_trip_little_endian() {
        let h = sample(ByteOrder::Little);
        let mut buf = vec![0u8; 56];
        h.write(&mut buf, 0).unwrap();
        let decoded = RecordHeader::read(&buf, 0, ByteOrder::Little).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn round_trip_big_endian() {
        let h = sample(ByteOrder::Big);
        let mut buf = vec![0u8; 56];
        h.write(&mut buf, 0).unwrap();
        let decoded = RecordHeader::read(&buf, 0, ByteOrder::Big).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn endian_auto_detection() {
        let h = sample(ByteOrder::Big);
        let mut buf = vec![0u8; 56];
        h.write(&mut buf, 0).unwrap();
        // Reader defaults to the opposite order; must still detect Big.
        let decoded = RecordHeader::read(&buf, 0, ByteOrder::Little).unwrap();
        assert_eq!(decoded.byte_order, ByteOrder::Big);
        assert_eq!(decoded, h);
    }

    #[test]
    fn bad_magic_is_not_hipo() {
        let buf = vec![0u8; 56];
        let err = RecordHeader::read(&buf, 0, ByteOrder::Little).unwrap_err();
        assert!(matches!(err, HipoError::NotHipo));
    }

    #[test]
    fn bad_version_rejected() {
        let mut h = sample(ByteOrder::Little);
        h.version = 5;
        let mut buf = vec![0u8; 56];
        h.write(&mut buf, 0).unwrap();
        let err = RecordHeader::read(&buf, 0, ByteOrder::Little).unwrap_err();
        assert!(matches!(err, HipoError::BadVersion(5)));
    }

    #[test]
    fn index_length_invariant_enforced() {
        let mut h = sample(ByteOrder::Little);
        h.index_length_bytes = 13; // not 0 and not 4*3
        let mut buf = vec![0u8; 56];
        h.write(&mut buf, 0).unwrap();
        let err = RecordHeader::read(&buf, 0, ByteOrder::Little).unwrap_err();
        assert!(matches!(err, HipoError::BadHeader(_)));
    }

    #[test]
    fn padding_helpers() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 4);
        assert_eq!(padded_len(3), 4);
        assert_eq!(padded_len(4), 4);
        assert_eq!(padded_len(5), 8);
        assert_eq!(words(8), 2);
    }
}
