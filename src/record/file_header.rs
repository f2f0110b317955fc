//! File-level header: same 56-byte wire shape as [`RecordHeader`],
//! different meaning for a handful of words.

use crate::error::Result;

use super::header::{ByteOrder, HeaderType, RecordHeader};
use super::{padded_len, HEADER_BYTES};

/// The general header written once at the start of a file.
///
/// Differences from a record header: word 2 is a split-file number
/// rather than a record number, word 9 is always 0, and words 11-12
/// hold the trailer's absolute byte offset (0 = absent) instead of a
/// free-form user register. Bit 10 of bit-info marks "trailer carries
/// an index".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub inner: RecordHeader,
}

impl FileHeader {
    pub fn new(byte_order: ByteOrder, file_type_id: u32, split_number: u32) -> Self {
        let mut inner = RecordHeader::empty(byte_order, split_number);
        inner.record_length_words = file_type_id; // word 1: file type id
        inner.header_type = HeaderType::HipoFileV1;
        Self { inner }
    }

    pub fn read(src: &[u8], offset: usize, declared: ByteOrder) -> Result<Self> {
        Ok(Self {
            inner: RecordHeader::read(src, offset, declared)?,
        })
    }

    pub fn write(&self, dst: &mut [u8], offset: usize) -> Result<()> {
        self.inner.write(dst, offset)
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.inner.byte_order
    }

    /// Absolute byte offset of the trailer record, or `None` if absent.
    pub fn trailer_position(&self) -> Option<u64> {
        let pos = self.inner.user_register_1; // words 11-12
        if pos == 0 {
            None
        } else {
            Some(pos)
        }
    }

    pub fn set_trailer_position(&mut self, pos: u64) {
        self.inner.user_register_1 = pos;
    }

    /// Bit 10 of bit-info: the trailer carries a record-lookup index.
    ///
    /// `event_type` (bits 10-13 of bit-info) has no meaning for a file
    /// header, so its low bit is repurposed here.
    pub fn has_trailer_with_index(&self) -> bool {
        self.inner.event_type & 0x1 != 0
    }

    pub fn set_has_trailer_with_index(&mut self, value: bool) {
        if value {
            self.inner.event_type |= 0x1;
        } else {
            self.inner.event_type &= !0x1;
        }
    }

    pub fn header_length_bytes(&self) -> u32 {
        self.inner.header_length_bytes()
    }

    /// Write a trailer header: last-record + trailer kind, with data
    /// section length set from an optional record-index payload.
    pub fn write_trailer(
        dst: &mut [u8],
        offset: usize,
        record_number: u32,
        byte_order: ByteOrder,
        index: Option<&[(u32, u32)]>,
    ) -> Result<usize> {
        let mut header = RecordHeader::empty(byte_order, record_number);
        header.is_last_record = true;
        header.header_type = HeaderType::HipoTrailer;

        let index_bytes = index.map(|i| i.len() as u32 * 8).unwrap_or(0);
        header.data_length_bytes = index_bytes;
        header.record_length_words = super::words(
            header.header_length_bytes() + padded_len(index_bytes),
        );

        header.write(dst, offset)?;
        let mut cursor = offset + HEADER_BYTES;
        if let Some(entries) = index {
            for (len, count) in entries {
                header
                    .byte_order
                    .write_pair(&mut dst[cursor..cursor + 8], *len, *count);
                cursor += 8;
            }
        }
        Ok(cursor - offset)
    }
}

impl std::fmt::Display for FileHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "file header [{:?}]: trailer={:?}, has_index={}",
            self.inner.byte_order,
            self.trailer_position(),
            self.has_trailer_with_index(),
        )
    }
}

impl ByteOrder {
    fn write_pair(self, dst: &mut [u8], a: u32, b: u32) {
        match self {
            Self::Little => {
                dst[0..4].copy_from_slice(&a.to_le_bytes());
                dst[4..8].copy_from_slice(&b.to_le_bytes());
            }
            Self::Big => {
                dst[0..4].copy_from_slice(&a.to_be_bytes());
                dst[4..8].copy_from_slice(&b.to_be_bytes());
            }
        }
    }

    pub(crate) fn read_pair(self, src: &[u8]) -> (u32, u32) {
        match self {
            Self::Little => (
                u32::from_le_bytes(src[0..4].try_into().unwrap()),
                u32::from_le_bytes(src[4..8].try_into().unwrap()),
            ),
            Self::Big => (
                u32::from_be_bytes(src[0..4].try_into().unwrap()),
                u32::from_be_bytes(src[4..8].try_into().unwrap()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailer_position_round_trips() {
        let mut fh = FileHeader::new(ByteOrder::Little, 1, 0);
        assert_eq!(fh.trailer_position(), None);
        fh.set_trailer_position(4096);
        assert_eq!(fh.trailer_position(), Some(4096));
    }

    #[test]
    fn has_trailer_with_index_flag() {
        let mut fh = FileHeader::new(ByteOrder::Little, 1, 0);
        assert!(!fh.has_trailer_with_index());
        fh.set_has_trailer_with_index(true);
        assert!(fh.has_trailer_with_index());
    }

    #[test]
    fn write_trailer_with_index_round_trips() {
        let mut buf = vec![0u8; 56 + 16];
        let entries = [(100, 5), (200, 3)];
        let n = FileHeader::write_trailer(&mut buf, 0, 9, ByteOrder::Little, Some(&entries))
            .unwrap();
        assert_eq!(n, 56 + 16);
        let header = RecordHeader::read(&buf, 0, ByteOrder::Little).unwrap();
        assert!(header.is_last_record);
        assert!(header.header_type.is_trailer());
        assert_eq!(header.data_length_bytes, 16);
        let (len0, count0) = ByteOrder::Little.read_pair(&buf[56..64]);
        assert_eq!((len0, count0), (100, 5));
    }
}
