//! Sequential and random-access reading over a HIPO file or in-memory
//! buffer.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use crate::compressor::CompressionType;
use crate::error::{HipoError, Result};
use crate::event_index::FileEventIndex;
use crate::record::file_header::FileHeader;
use crate::record::header::{ByteOrder, RecordHeader};
use crate::record::input::RecordInput;
use crate::record::{padded_len, HEADER_BYTES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// File position and decoded event count of one discovered record.
#[derive(Debug, Clone, Copy)]
pub struct RecordPosition {
    pub position: u64,
    pub event_count: u64,
    pub record_length_bytes: u64,
}

/// Reads records and events out of a HIPO file (or, via
/// [`Reader::from_buffer`], an in-memory byte vector).
pub struct Reader<R> {
    source: R,
    byte_order: ByteOrder,
    file_header: FileHeader,
    first_record_position: u64,
    records: Vec<RecordPosition>,
    index: FileEventIndex,
    current: RecordInput,
    loaded_record: Option<usize>,
    cursor: Option<i64>,
    last_direction: Option<Direction>,
    check_record_number_sequence: bool,
}

impl Reader<File> {
    /// Open `path`, read its file header, and scan its records (trailer
    /// index if present and valid, otherwise a sequential force-scan).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut header_buf = [0u8; HEADER_BYTES];
        file.read_exact(&mut header_buf)?;
        let mut reader = Self::new_over(file, &header_buf)?;
        reader.scan_file()?;
        Ok(reader)
    }
}

impl Reader<Cursor<Vec<u8>>> {
    /// Wrap an in-memory file image. Call [`Reader::scan_buffer`]
    /// afterwards to decompress and index it.
    pub fn from_buffer(data: Vec<u8>) -> Result<Self> {
        let mut header_buf = [0u8; HEADER_BYTES];
        header_buf.copy_from_slice(&data[..HEADER_BYTES]);
        Self::new_over(Cursor::new(data), &header_buf)
    }

    /// Decompress every record into a fresh staging buffer and swap it
    /// in as the source, then scan it. After this call, all generic
    /// record-loading machinery works exactly as it would over a file
    /// that was never compressed.
    pub fn scan_buffer(&mut self) -> Result<()> {
        let original = self.source.get_ref().clone();
        let mut staged = Vec::with_capacity(original.len());
        staged.extend_from_slice(&original[..self.first_record_position as usize]);

        let mut position = self.first_record_position as usize;
        let mut prev_record_number: Option<u32> = None;
        loop {
            if position + HEADER_BYTES > original.len() {
                break;
            }
            let header = match RecordHeader::read(&original, position, self.byte_order) {
                Ok(h) => h,
                Err(_) => break,
            };
            if header.header_type.is_trailer() {
                break;
            }
            if self.check_record_number_sequence {
                if let Some(prev) = prev_record_number {
                    if header.record_number != prev + 1 {
                        return Err(HipoError::BadRecordNumber {
                            expected: prev + 1,
                            found: header.record_number,
                        });
                    }
                }
                prev_record_number = Some(header.record_number);
            }
            RecordInput::uncompress_record(&original, position, &mut staged, &header)?;
            position += (header.record_length_words * 4) as usize;
        }

        self.source = Cursor::new(staged);
        self.loaded_record = None;
        self.force_scan_file()
    }

    /// Remove event `event_ordinal` from record `record_idx`, splice the
    /// shrunk record back into the buffer, and rescan. Only valid on an
    /// uncompressed buffer record (surgical edits are not defined over
    /// compressed records).
    pub fn remove_structure(&mut self, record_idx: usize, event_ordinal: usize) -> Result<()> {
        self.ensure_loaded(record_idx)?;
        self.current.remove_event(event_ordinal)?;
        self.rewrite_record_in_source(record_idx)
    }

    /// Insert `payload` as a new event at `event_ordinal` within record
    /// `record_idx`, splice the grown record back into the buffer, and
    /// rescan.
    pub fn add_structure(&mut self, record_idx: usize, event_ordinal: usize, payload: &[u8]) -> Result<()> {
        self.ensure_loaded(record_idx)?;
        self.current.insert_event(event_ordinal, payload)?;
        self.rewrite_record_in_source(record_idx)
    }

    fn rewrite_record_in_source(&mut self, record_idx: usize) -> Result<()> {
        if self.current.header().compression_type != CompressionType::None {
            return Err(HipoError::BadHeader(
                "surgical edits require an uncompressed record".into(),
            ));
        }
        let new_bytes = self.current.to_record_bytes()?;
        let position = self.records[record_idx].position as usize;
        let old_len = self.records[record_idx].record_length_bytes as usize;

        let buf = self.source.get_mut();
        buf.splice(position..position + old_len, new_bytes);

        self.loaded_record = None;
        self.force_scan_file()
    }
}

impl<R> Reader<R> {
    fn new_over(source: R, header_buf: &[u8; HEADER_BYTES]) -> Result<Self> {
        let file_header = FileHeader::read(header_buf, 0, ByteOrder::Little)?;
        let byte_order = file_header.byte_order();
        let first_record_position =
            HEADER_BYTES as u64 + padded_len(file_header.inner.user_header_length_bytes) as u64;
        Ok(Self {
            source,
            byte_order,
            file_header,
            first_record_position,
            records: Vec::new(),
            index: FileEventIndex::new(),
            current: RecordInput::new(),
            loaded_record: None,
            cursor: None,
            last_direction: None,
            check_record_number_sequence: false,
        })
    }

    pub fn file_header(&self) -> &FileHeader {
        &self.file_header
    }

    pub fn records(&self) -> &[RecordPosition] {
        &self.records
    }

    pub fn event_count(&self) -> u64 {
        self.index.max_events()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn set_check_record_number_sequence(&mut self, value: bool) {
        self.check_record_number_sequence = value;
    }
}

impl<R: Read + Seek> Reader<R> {
    fn scan_file(&mut self) -> Result<()> {
        if let Some(trailer_pos) = self.file_header.trailer_position() {
            if self.file_header.has_trailer_with_index() && self.scan_from_trailer(trailer_pos).is_ok() {
                return Ok(());
            }
        }
        self.force_scan_file()
    }

    fn scan_from_trailer(&mut self, trailer_pos: u64) -> Result<()> {
        self.source.seek(SeekFrom::Start(trailer_pos))?;
        let mut header_buf = vec![0u8; HEADER_BYTES];
        self.source.read_exact(&mut header_buf)?;
        let trailer = RecordHeader::read(&header_buf, 0, self.byte_order)?;
        if !trailer.header_type.is_trailer() {
            return Err(HipoError::BadHeader(
                "trailer position does not point at a trailer".into(),
            ));
        }
        log::trace!("indexing from trailer at byte {trailer_pos}");

        let entry_count = (trailer.data_length_bytes / 8) as usize;
        let mut index_buf = vec![0u8; entry_count * 8];
        self.source.read_exact(&mut index_buf)?;

        self.records.clear();
        self.index.clear();
        let mut position = self.first_record_position;
        for i in 0..entry_count {
            let (len, count) = self.byte_order.read_pair(&index_buf[i * 8..i * 8 + 8]);
            self.records.push(RecordPosition {
                position,
                event_count: count as u64,
                record_length_bytes: len as u64,
            });
            self.index.add_record(count as u64);
            position += len as u64;
        }
        Ok(())
    }

    /// Re-derive record positions by reading every header in sequence,
    /// ignoring any trailer index. Used as a fallback when the trailer
    /// is missing or doesn't check out, and exposed so callers can force
    /// a rescan (e.g. after a buffer edit, or with `force_scan` enabled).
    pub fn force_scan(&mut self) -> Result<()> {
        self.force_scan_file()
    }

    fn force_scan_file(&mut self) -> Result<()> {
        log::trace!("force-scanning records from byte {}", self.first_record_position);
        self.records.clear();
        self.index.clear();
        self.loaded_record = None;
        let mut position = self.first_record_position;
        let mut prev_record_number: Option<u32> = None;
        loop {
            if self.source.seek(SeekFrom::Start(position)).is_err() {
                break;
            }
            let mut header_buf = vec![0u8; HEADER_BYTES];
            match self.source.read_exact(&mut header_buf) {
                Ok(()) => {}
                Err(_) => break,
            }
            let header = match RecordHeader::read(&header_buf, 0, self.byte_order) {
                Ok(h) => h,
                Err(_) => break,
            };
            if header.header_type.is_trailer() {
                break;
            }
            if self.check_record_number_sequence {
                if let Some(prev) = prev_record_number {
                    if header.record_number != prev + 1 {
                        return Err(HipoError::BadRecordNumber {
                            expected: prev + 1,
                            found: header.record_number,
                        });
                    }
                }
                prev_record_number = Some(header.record_number);
            }
            let record_length_bytes = header.record_length_words as u64 * 4;
            self.records.push(RecordPosition {
                position,
                event_count: header.event_count as u64,
                record_length_bytes,
            });
            self.index.add_record(header.event_count as u64);
            position += record_length_bytes;
        }
        Ok(())
    }

    fn ensure_loaded(&mut self, record_idx: usize) -> Result<()> {
        if self.loaded_record != Some(record_idx) {
            let position = self.records[record_idx].position;
            self.current.read_record(&mut self.source, position)?;
            log::debug!("loaded record {record_idx} at byte {position}");
            self.loaded_record = Some(record_idx);
        }
        Ok(())
    }

    /// Event `global_index`, clamped to the valid range like
    /// [`RecordInput::get_event`].
    pub fn get_event(&mut self, global_index: i64) -> Result<Vec<u8>> {
        let count = self.index.max_events();
        if count == 0 {
            return Ok(Vec::new());
        }
        let clamped = global_index.clamp(0, count as i64 - 1) as u64;
        self.index.set_event(clamped);
        let record_idx = self.index.current_record();
        self.ensure_loaded(record_idx)?;
        Ok(self.current.get_event(self.index.intra_record() as i64))
    }

    /// Event `global_index` written into `buf` at `offset`; raises
    /// [`HipoError::IndexOutOfRange`] instead of clamping.
    pub fn get_event_into(&mut self, buf: &mut [u8], offset: usize, global_index: u64) -> Result<usize> {
        let count = self.index.max_events();
        if global_index >= count {
            return Err(HipoError::IndexOutOfRange {
                index: global_index as i64,
                max: count as usize,
            });
        }
        self.index.set_event(global_index);
        let record_idx = self.index.current_record();
        self.ensure_loaded(record_idx)?;
        self.current.get_event_into(buf, offset, self.index.intra_record() as usize)
    }

    /// Advance the sequential cursor and return the next event, or
    /// `Ok(None)` at end of file. Reversing direction from
    /// [`get_prev_event`](Self::get_prev_event) takes one extra step so
    /// the same event is never returned twice in a row.
    pub fn get_next_event(&mut self) -> Result<Option<Vec<u8>>> {
        let next = match self.cursor {
            None => 0,
            Some(c) if self.last_direction == Some(Direction::Backward) => c + 2,
            Some(c) => c + 1,
        };
        if next < 0 || next as u64 >= self.index.max_events() {
            return Ok(None);
        }
        let event = self.get_event(next)?;
        self.cursor = Some(next);
        self.last_direction = Some(Direction::Forward);
        Ok(Some(event))
    }

    /// Retreat the sequential cursor and return the previous event, or
    /// `Ok(None)` before the start of file.
    pub fn get_prev_event(&mut self) -> Result<Option<Vec<u8>>> {
        let prev = match self.cursor {
            None => return Ok(None),
            Some(c) if self.last_direction == Some(Direction::Forward) => c - 2,
            Some(c) => c - 1,
        };
        if prev < 0 {
            return Ok(None);
        }
        let event = self.get_event(prev)?;
        self.cursor = Some(prev);
        self.last_direction = Some(Direction::Backward);
        Ok(Some(event))
    }

    /// A forward iterator over every event, starting from the beginning
    /// regardless of any prior cursor position.
    pub fn events(&mut self) -> Events<'_, R> {
        self.cursor = None;
        self.last_direction = None;
        Events { reader: self }
    }
}

/// Iterator returned by [`Reader::events`].
pub struct Events<'a, R> {
    reader: &'a mut Reader<R>,
}

impl<'a, R: Read + Seek> Iterator for Events<'a, R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.get_next_event() {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::Writer;

    fn build_buffer(events: &[Vec<u8>], with_trailer_index: bool) -> Vec<u8> {
        let mut w = Writer::from_dest(Cursor::new(Vec::new()), ByteOrder::Little, None).unwrap();
        w.set_add_trailer(true);
        w.set_add_trailer_index(with_trailer_index);
        w.set_max_event_count(2);
        for e in events {
            w.add_event(e).unwrap();
        }
        w.into_inner().unwrap().into_inner()
    }

    #[test]
    fn events_iterator_covers_every_event_in_order() {
        let events: Vec<Vec<u8>> = (0..7u8).map(|i| vec![i; 4]).collect();
        let bytes = build_buffer(&events, true);
        let mut reader = Reader::from_buffer(bytes).unwrap();
        reader.scan_buffer().unwrap();

        let collected: Vec<Vec<u8>> = reader.events().map(|e| e.unwrap()).collect();
        assert_eq!(collected, events);
    }

    #[test]
    fn get_event_clamps_like_record_input() {
        let events: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i; 4]).collect();
        let bytes = build_buffer(&events, true);
        let mut reader = Reader::from_buffer(bytes).unwrap();
        reader.scan_buffer().unwrap();

        assert_eq!(reader.get_event(-9).unwrap(), events[0]);
        assert_eq!(reader.get_event(500).unwrap(), events[2]);
    }

    #[test]
    fn reversing_direction_skips_the_just_returned_event() {
        let events: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 4]).collect();
        let bytes = build_buffer(&events, true);
        let mut reader = Reader::from_buffer(bytes).unwrap();
        reader.scan_buffer().unwrap();

        assert_eq!(reader.get_next_event().unwrap().unwrap(), events[0]);
        assert_eq!(reader.get_next_event().unwrap().unwrap(), events[1]);
        assert_eq!(reader.get_next_event().unwrap().unwrap(), events[2]);
        // switching direction: should land on events[0], not re-show events[2] or events[1]
        assert_eq!(reader.get_prev_event().unwrap().unwrap(), events[0]);
    }

    #[test]
    fn remove_and_add_structure_round_trip() {
        let events: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 8]).collect();
        let bytes = build_buffer(&events, true);
        let mut reader = Reader::from_buffer(bytes).unwrap();
        reader.scan_buffer().unwrap();

        reader.remove_structure(0, 1).unwrap();
        assert_eq!(reader.event_count(), 3);
        assert_eq!(reader.get_event(1).unwrap(), events[2]);

        let new_event = vec![0xEE; 8];
        reader.add_structure(0, 1, &new_event).unwrap();
        assert_eq!(reader.event_count(), 4);
        assert_eq!(reader.get_event(1).unwrap(), new_event);
    }

    #[test]
    fn missing_trailer_index_falls_back_to_force_scan() {
        let events: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 4]).collect();
        let bytes = build_buffer(&events, false);
        let mut reader = Reader::from_buffer(bytes).unwrap();
        reader.scan_buffer().unwrap();
        assert_eq!(reader.event_count(), 6);
    }
}
