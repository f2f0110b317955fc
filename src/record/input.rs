//! Holds one uncompressed record; exposes event / user-header accessors.
//!
//! After [`RecordInput::read_record`] the leading `4*N` bytes of the
//! uncompressed buffer are *cumulative end-offsets*, not the original
//! per-event lengths: position `4*k` holds the byte offset one past the
//! end of event `k`. This is computed by overwriting the decoded index
//! in place.

use std::io::{Read, Seek, SeekFrom};

use crate::compressor::{CompressionType, Compressor, DefaultCompressor};
use crate::error::{HipoError, Result};

use super::header::{ByteOrder, RecordHeader};
use super::{padded_len, HEADER_BYTES};

/// Decode the byte-length of the next EVIO-framed event at `data[pos..]`:
/// the first 32-bit word (in `byte_order`) is `length_words - 1`.
fn evio_event_len(data: &[u8], pos: usize, byte_order: ByteOrder) -> Result<u32> {
    if data.len() < pos + 4 {
        return Err(HipoError::BadHeader(
            "truncated event while reconstructing index".into(),
        ));
    }
    let word0 = match byte_order {
        ByteOrder::Little => u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()),
        ByteOrder::Big => u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()),
    };
    Ok(4 * (word0 + 1))
}

/// One decoded, decompressed record, reusable across reads.
#[derive(Debug)]
pub struct RecordInput {
    header: RecordHeader,
    header_buf: Vec<u8>,
    compressed_buf: Vec<u8>,
    uncompressed_buf: Vec<u8>,
    /// Byte offset (within `uncompressed_buf`) where the index region
    /// ends and the user header begins. Equal to `4 * event_count`.
    index_len: usize,
    compressor: Box<dyn Compressor + Send + Sync>,
}

impl Default for RecordInput {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordInput {
    pub fn new() -> Self {
        Self {
            header: RecordHeader::empty(ByteOrder::Little, 0),
            header_buf: vec![0u8; HEADER_BYTES],
            compressed_buf: Vec::new(),
            uncompressed_buf: Vec::new(),
            index_len: 0,
            compressor: Box::new(DefaultCompressor),
        }
    }

    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    /// Read one record starting at `position` in `src`, decompressing
    /// into owned buffers and rewriting the index in place.
    pub fn read_record<R: Read + Seek>(&mut self, src: &mut R, position: u64) -> Result<()> {
        src.seek(SeekFrom::Start(position))?;
        src.read_exact(&mut self.header_buf)?;
        let declared = self.header.byte_order;
        let header = RecordHeader::read(&self.header_buf, 0, declared)?;

        let disk_payload_len = if header.compression_type.is_compressed() {
            header.compressed_data_length_bytes as usize
        } else {
            (header.record_length_words * 4) as usize - HEADER_BYTES
        };

        if header.compression_type.is_compressed() {
            let padded_compressed = (header.compressed_data_length_words() * 4) as usize;
            self.compressed_buf.resize(padded_compressed, 0);
            src.read_exact(&mut self.compressed_buf)?;
        } else {
            self.compressed_buf.resize(disk_payload_len, 0);
            src.read_exact(&mut self.compressed_buf)?;
        }

        self.load_payload(&header, disk_payload_len)?;
        log::debug!("read {}", header);
        self.header = header;
        Ok(())
    }

    /// Same as [`read_record`](Self::read_record) but reading from an
    /// in-memory region instead of a seekable stream.
    pub fn read_record_from_buffer(&mut self, src: &[u8], offset: usize) -> Result<()> {
        let declared = self.header.byte_order;
        let header = RecordHeader::read(src, offset, declared)?;

        let disk_payload_len = if header.compression_type.is_compressed() {
            header.compressed_data_length_bytes as usize
        } else {
            (header.record_length_words * 4) as usize - HEADER_BYTES
        };

        if header.compression_type.is_compressed() {
            let padded_compressed = (header.compressed_data_length_words() * 4) as usize;
            let start = offset + HEADER_BYTES;
            self.compressed_buf = src[start..start + padded_compressed].to_vec();
        } else {
            let start = offset + HEADER_BYTES;
            self.uncompressed_buf.clear();
            self.uncompressed_buf
                .extend_from_slice(&src[start..start + disk_payload_len]);
            self.finish_load(&header)?;
            self.header = header;
            return Ok(());
        }

        self.load_payload(&header, disk_payload_len)?;
        self.header = header;
        Ok(())
    }

    fn load_payload(&mut self, header: &RecordHeader, disk_payload_len: usize) -> Result<()> {
        self.uncompressed_buf.clear();
        match header.compression_type {
            CompressionType::None => {
                // caller already populated compressed_buf as a plain
                // read in the file-based path; buffer path special
                // cases this above.
                self.uncompressed_buf
                    .extend_from_slice(&self.compressed_buf[..disk_payload_len]);
            }
            CompressionType::Lz4Fast | CompressionType::Lz4Best => {
                self.compressor.uncompress_lz4(
                    &self.compressed_buf,
                    0,
                    disk_payload_len,
                    &mut self.uncompressed_buf,
                )?;
            }
            CompressionType::Gzip => {
                let out = self
                    .compressor
                    .uncompress_gzip(&self.compressed_buf, 0, disk_payload_len)?;
                self.uncompressed_buf.extend_from_slice(&out);
            }
        }
        self.finish_load(header)
    }

    /// Rebuild the index (if missing) and perform the in-place
    /// lengths-to-offsets transform. `uncompressed_buf` must already
    /// hold `index_len_on_disk + padded(user_header) + padded(data)`
    /// bytes with the index (if any) at the front.
    fn finish_load(&mut self, header: &RecordHeader) -> Result<()> {
        let index_len = 4 * header.event_count as usize;
        let uh_len = padded_len(header.user_header_length_bytes) as usize;

        if header.index_length_bytes == 0 {
            log::trace!(
                "record #{} carries no index, reconstructing from EVIO framing",
                header.record_number
            );
            // No index on disk: reserve room for one at the front and
            // shift the existing contents (user header + data) after it.
            let mut shifted = vec![0u8; index_len + self.uncompressed_buf.len()];
            shifted[index_len..].copy_from_slice(&self.uncompressed_buf);
            self.uncompressed_buf = shifted;

            let data_start = index_len + uh_len;
            let mut pos = data_start;
            for i in 0..header.event_count as usize {
                let len = evio_event_len(&self.uncompressed_buf, pos, header.byte_order)?;
                header
                    .byte_order
                    .write_index_entry(&mut self.uncompressed_buf[i * 4..i * 4 + 4], len);
                pos += len as usize;
            }
        } else if header.index_length_bytes != index_len as u32 {
            return Err(HipoError::BadHeader(format!(
                "index length {} bytes inconsistent with {} events",
                header.index_length_bytes, header.event_count
            )));
        }

        self.index_len = index_len;

        // Lengths -> cumulative end-offsets, in place.
        let mut running = 0u32;
        for i in 0..header.event_count as usize {
            let len = header.byte_order.read_index_entry(&self.uncompressed_buf[i * 4..i * 4 + 4]);
            running += len;
            header
                .byte_order
                .write_index_entry(&mut self.uncompressed_buf[i * 4..i * 4 + 4], running);
        }

        Ok(())
    }

    fn event_count(&self) -> usize {
        self.header.event_count as usize
    }

    fn offset_of(&self, i: usize) -> u32 {
        if i == 0 {
            0
        } else {
            self.header
                .byte_order
                .read_index_entry(&self.uncompressed_buf[(i - 1) * 4..i * 4])
        }
    }

    fn end_of(&self, i: usize) -> u32 {
        self.header
            .byte_order
            .read_index_entry(&self.uncompressed_buf[i * 4..(i + 1) * 4])
    }

    fn data_region_start(&self) -> usize {
        self.index_len + padded_len(self.header.user_header_length_bytes) as usize
    }

    /// Event `i`, clamping out-of-range indices (including negative
    /// ones) to the nearest valid event, matching historical behavior.
    pub fn get_event(&self, i: i64) -> Vec<u8> {
        let count = self.event_count();
        if count == 0 {
            return Vec::new();
        }
        let clamped = i.clamp(0, count as i64 - 1) as usize;
        let start = self.data_region_start() + self.offset_of(clamped) as usize;
        let end = self.data_region_start() + self.end_of(clamped) as usize;
        self.uncompressed_buf[start..end].to_vec()
    }

    /// Event `i` written into `buf` at `offset`; raises
    /// [`HipoError::IndexOutOfRange`] instead of clamping.
    pub fn get_event_into(&self, buf: &mut [u8], offset: usize, i: usize) -> Result<usize> {
        let count = self.event_count();
        if i >= count {
            return Err(HipoError::IndexOutOfRange {
                index: i as i64,
                max: count,
            });
        }
        let start = self.data_region_start() + self.offset_of(i) as usize;
        let end = self.data_region_start() + self.end_of(i) as usize;
        let len = end - start;
        if buf.len() < offset + len {
            return Err(HipoError::BufferTooSmall {
                needed: offset + len,
                available: buf.len(),
            });
        }
        buf[offset..offset + len].copy_from_slice(&self.uncompressed_buf[start..end]);
        Ok(len)
    }

    pub fn get_user_header(&self) -> &[u8] {
        let start = self.index_len;
        let end = start + self.header.user_header_length_bytes as usize;
        &self.uncompressed_buf[start..end]
    }

    pub fn get_uncompressed_data_buffer(&self) -> &[u8] {
        &self.uncompressed_buf
    }

    /// Remove event `i`, shifting later events down and shrinking the
    /// index by one entry. Only meaningful on an uncompressed record
    /// (the caller is responsible for keeping compressed records out of
    /// reach of this method).
    pub fn remove_event(&mut self, i: usize) -> Result<()> {
        let count = self.event_count();
        if i >= count {
            return Err(HipoError::IndexOutOfRange { index: i as i64, max: count });
        }
        let byte_order = self.header.byte_order;
        let rel_start = self.offset_of(i) as usize;
        let rel_end = self.end_of(i) as usize;

        let mut lengths: Vec<u32> = (0..count).map(|j| self.end_of(j) - self.offset_of(j)).collect();
        lengths.remove(i);

        let data_start_abs = self.data_region_start();
        let old_data_len = self.header.data_length_bytes as usize;
        let data_region = self.uncompressed_buf[data_start_abs..data_start_abs + old_data_len].to_vec();
        let mut new_data = Vec::with_capacity(old_data_len - (rel_end - rel_start));
        new_data.extend_from_slice(&data_region[..rel_start]);
        new_data.extend_from_slice(&data_region[rel_end..]);

        self.rebuild_from(lengths, new_data, byte_order)
    }

    /// Insert `data` as a new event at position `i` (`i == event_count()`
    /// appends). Only meaningful on an uncompressed record.
    pub fn insert_event(&mut self, i: usize, data: &[u8]) -> Result<()> {
        let count = self.event_count();
        if i > count {
            return Err(HipoError::IndexOutOfRange { index: i as i64, max: count });
        }
        let byte_order = self.header.byte_order;
        let rel_pos = if i < count {
            self.offset_of(i) as usize
        } else {
            self.header.data_length_bytes as usize
        };

        let mut lengths: Vec<u32> = (0..count).map(|j| self.end_of(j) - self.offset_of(j)).collect();
        lengths.insert(i, data.len() as u32);

        let data_start_abs = self.data_region_start();
        let old_data_len = self.header.data_length_bytes as usize;
        let data_region = self.uncompressed_buf[data_start_abs..data_start_abs + old_data_len].to_vec();
        let mut new_data = Vec::with_capacity(old_data_len + data.len());
        new_data.extend_from_slice(&data_region[..rel_pos]);
        new_data.extend_from_slice(data);
        new_data.extend_from_slice(&data_region[rel_pos..]);

        self.rebuild_from(lengths, new_data, byte_order)
    }

    /// Re-derive the index, header length/pad fields, and
    /// `uncompressed_buf` layout from a fresh event-length list and data
    /// payload. Shared by [`remove_event`](Self::remove_event) and
    /// [`insert_event`](Self::insert_event).
    fn rebuild_from(&mut self, lengths: Vec<u32>, new_data: Vec<u8>, byte_order: ByteOrder) -> Result<()> {
        let new_count = lengths.len();
        let new_index_len = 4 * new_count;
        let user_header = self.get_user_header().to_vec();
        let uh_padded = padded_len(self.header.user_header_length_bytes) as usize;

        let new_data_len = new_data.len() as u32;
        let data_padded = padded_len(new_data_len) as usize;

        let mut buf = vec![0u8; new_index_len + uh_padded + data_padded];
        let mut running = 0u32;
        for (j, len) in lengths.iter().enumerate() {
            running += len;
            byte_order.write_index_entry(&mut buf[j * 4..j * 4 + 4], running);
        }
        buf[new_index_len..new_index_len + user_header.len()].copy_from_slice(&user_header);
        let data_off = new_index_len + uh_padded;
        buf[data_off..data_off + new_data.len()].copy_from_slice(&new_data);

        self.uncompressed_buf = buf;
        self.index_len = new_index_len;
        self.header.event_count = new_count as u32;
        self.header.index_length_bytes = new_index_len as u32;
        self.header.data_length_bytes = new_data_len;
        self.header.data_pad = (data_padded as u32 - new_data_len) as u8;
        self.header.record_length_words = super::words(
            HEADER_BYTES as u32 + self.header.index_length_bytes + uh_padded as u32 + data_padded as u32,
        );
        Ok(())
    }

    /// Serialize this record back to on-disk bytes. Only meaningful
    /// while `uncompressed_buf` holds an uncompressed record, which is
    /// the only state [`Reader::remove_structure`](crate::reader::Reader::remove_structure)
    /// and [`Reader::add_structure`](crate::reader::Reader::add_structure)
    /// operate on.
    pub fn to_record_bytes(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; HEADER_BYTES + self.uncompressed_buf.len()];
        self.header.write(&mut out, 0)?;
        out[HEADER_BYTES..].copy_from_slice(&self.uncompressed_buf);
        Ok(out)
    }

    /// Static helper used by the multi-record scanner ([`crate::reader::Reader`]):
    /// copy `header` verbatim, decompress/copy the payload from `src` at
    /// `src_off` into `dst`, zero the emitted header's compression-type
    /// word, and update the record-length word to the uncompressed size.
    pub fn uncompress_record(
        src: &[u8],
        src_off: usize,
        dst: &mut Vec<u8>,
        header: &RecordHeader,
    ) -> Result<usize> {
        let compressor = DefaultCompressor;
        let mut emitted = *header;
        emitted.compression_type = CompressionType::None;
        emitted.compressed_data_length_bytes = 0;

        let payload_start = src_off + HEADER_BYTES;
        let uncompressed: Vec<u8> = if header.compression_type.is_compressed() {
            let compressed_len = header.compressed_data_length_bytes as usize;
            let mut out = Vec::new();
            match header.compression_type {
                CompressionType::Lz4Fast | CompressionType::Lz4Best => {
                    compressor.uncompress_lz4(src, payload_start, compressed_len, &mut out)?;
                }
                CompressionType::Gzip => {
                    out = compressor.uncompress_gzip(src, payload_start, compressed_len)?;
                }
                CompressionType::None => unreachable!(),
            }
            out
        } else {
            let len = (header.record_length_words * 4) as usize - HEADER_BYTES;
            src[payload_start..payload_start + len].to_vec()
        };

        emitted.record_length_words = super::words(HEADER_BYTES as u32 + uncompressed.len() as u32);

        let start = dst.len();
        dst.resize(start + HEADER_BYTES, 0);
        emitted.write(&mut dst[start..], 0)?;
        dst.extend_from_slice(&uncompressed);
        Ok(HEADER_BYTES + uncompressed.len())
    }
}

impl ByteOrder {
    fn read_index_entry(self, bytes: &[u8]) -> u32 {
        match self {
            Self::Little => u32::from_le_bytes(bytes.try_into().unwrap()),
            Self::Big => u32::from_be_bytes(bytes.try_into().unwrap()),
        }
    }

    fn write_index_entry(self, bytes: &mut [u8], value: u32) {
        let enc = match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        };
        bytes.copy_from_slice(&enc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::output::RecordOutput;
    use std::io::Cursor;

    fn evio_event(words_of_body: u32) -> Vec<u8> {
        let total_words = words_of_body + 1;
        let mut v = Vec::with_capacity(total_words as usize * 4);
        v.extend_from_slice(&(total_words - 1).to_le_bytes());
        for _ in 0..words_of_body {
            v.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        }
        v
    }

    #[test]
    fn read_uncompressed_record_with_index() {
        let mut out = RecordOutput::new(ByteOrder::Little, CompressionType::None);
        let events = [evio_event(2), evio_event(5), evio_event(1)];
        for e in &events {
            assert!(out.add_event(e).unwrap());
        }
        let mut buf = vec![0u8; 4096];
        let written = out.build_into(&mut buf).unwrap();

        let mut input = RecordInput::new();
        let mut cursor = Cursor::new(&buf[..written]);
        input.read_record(&mut cursor, 0).unwrap();

        assert_eq!(input.header().event_count, 3);
        for (i, e) in events.iter().enumerate() {
            assert_eq!(&input.get_event(i as i64), e);
        }
    }

    #[test]
    fn index_offsets_are_monotonic_and_sum_to_data_length() {
        let mut out = RecordOutput::new(ByteOrder::Little, CompressionType::None);
        let events = [evio_event(2), evio_event(5), evio_event(1)];
        for e in &events {
            out.add_event(e).unwrap();
        }
        let mut buf = vec![0u8; 4096];
        let written = out.build_into(&mut buf).unwrap();

        let mut input = RecordInput::new();
        let mut cursor = Cursor::new(&buf[..written]);
        input.read_record(&mut cursor, 0).unwrap();

        let n = input.event_count();
        let mut prev = 0u32;
        for i in 0..n {
            let end = input.end_of(i);
            assert!(end > prev || (end == 0 && prev == 0));
            prev = end;
        }
        assert_eq!(prev, input.header().data_length_bytes);
    }

    #[test]
    fn get_event_clamps_out_of_range() {
        let mut out = RecordOutput::new(ByteOrder::Little, CompressionType::None);
        let events = [evio_event(2), evio_event(5)];
        for e in &events {
            out.add_event(e).unwrap();
        }
        let mut buf = vec![0u8; 4096];
        let written = out.build_into(&mut buf).unwrap();

        let mut input = RecordInput::new();
        let mut cursor = Cursor::new(&buf[..written]);
        input.read_record(&mut cursor, 0).unwrap();

        assert_eq!(input.get_event(-5), input.get_event(0));
        assert_eq!(input.get_event(50), input.get_event(1));
    }

    #[test]
    fn get_event_into_raises_on_out_of_range() {
        let mut out = RecordOutput::new(ByteOrder::Little, CompressionType::None);
        out.add_event(&evio_event(2)).unwrap();
        let mut buf = vec![0u8; 4096];
        let written = out.build_into(&mut buf).unwrap();

        let mut input = RecordInput::new();
        let mut cursor = Cursor::new(&buf[..written]);
        input.read_record(&mut cursor, 0).unwrap();

        let mut out_buf = [0u8; 64];
        let err = input.get_event_into(&mut out_buf, 0, 5).unwrap_err();
        assert!(matches!(err, HipoError::IndexOutOfRange { .. }));
    }

    #[test]
    fn missing_index_is_reconstructed_from_evio_framing() {
        let mut out = RecordOutput::new(ByteOrder::Little, CompressionType::None);
        let events = [evio_event(3), evio_event(0), evio_event(7)];
        for e in &events {
            out.add_event(e).unwrap();
        }
        out.set_write_index(false);
        let mut buf = vec![0u8; 4096];
        let written = out.build_into(&mut buf).unwrap();

        let mut input = RecordInput::new();
        let mut cursor = Cursor::new(&buf[..written]);
        input.read_record(&mut cursor, 0).unwrap();

        for (i, e) in events.iter().enumerate() {
            assert_eq!(&input.get_event(i as i64), e);
        }
    }

    #[test]
    fn remove_event_shifts_later_events_and_shrinks_index() {
        let mut out = RecordOutput::new(ByteOrder::Little, CompressionType::None);
        let events = [evio_event(2), evio_event(5), evio_event(1)];
        for e in &events {
            out.add_event(e).unwrap();
        }
        let mut buf = vec![0u8; 4096];
        let written = out.build_into(&mut buf).unwrap();

        let mut input = RecordInput::new();
        let mut cursor = Cursor::new(&buf[..written]);
        input.read_record(&mut cursor, 0).unwrap();

        input.remove_event(1).unwrap();
        assert_eq!(input.header().event_count, 2);
        assert_eq!(input.get_event(0), events[0]);
        assert_eq!(input.get_event(1), events[2]);
    }

    #[test]
    fn insert_event_at_front_and_middle() {
        let mut out = RecordOutput::new(ByteOrder::Little, CompressionType::None);
        let events = [evio_event(2), evio_event(5)];
        for e in &events {
            out.add_event(e).unwrap();
        }
        let mut buf = vec![0u8; 4096];
        let written = out.build_into(&mut buf).unwrap();

        let mut input = RecordInput::new();
        let mut cursor = Cursor::new(&buf[..written]);
        input.read_record(&mut cursor, 0).unwrap();

        let inserted = evio_event(0);
        input.insert_event(1, &inserted).unwrap();
        assert_eq!(input.header().event_count, 3);
        assert_eq!(input.get_event(0), events[0]);
        assert_eq!(input.get_event(1), inserted);
        assert_eq!(input.get_event(2), events[1]);
    }

    #[test]
    fn lz4_compressed_record_round_trips() {
        let mut out = RecordOutput::new(ByteOrder::Little, CompressionType::Lz4Fast);
        let events: Vec<Vec<u8>> = (0..5).map(|_| evio_event(30)).collect();
        for e in &events {
            out.add_event(e).unwrap();
        }
        let mut buf = vec![0u8; 8192];
        let written = out.build_into(&mut buf).unwrap();

        let mut input = RecordInput::new();
        let mut cursor = Cursor::new(&buf[..written]);
        input.read_record(&mut cursor, 0).unwrap();

        for (i, e) in events.iter().enumerate() {
            assert_eq!(&input.get_event(i as i64), e);
        }
    }
}
