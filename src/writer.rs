//! Single-threaded file writer.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::compressor::CompressionType;
use crate::error::Result;
use crate::record::file_header::FileHeader;
use crate::record::header::ByteOrder;
use crate::record::output::RecordOutput;
use crate::record::HEADER_BYTES;

/// Writes a HIPO file one record at a time, building each record with an
/// owned [`RecordOutput`] and streaming it straight to `dest`.
pub struct Writer<W: Write + Seek> {
    dest: W,
    file_header: FileHeader,
    current: RecordOutput,
    trailer_index: Vec<(u32, u32)>,
    add_trailer: bool,
    add_trailer_index: bool,
    first_record_position: u64,
    closed: bool,
}

impl Writer<File> {
    /// Create (truncating) the file at `path` and write its file header.
    pub fn open(path: impl AsRef<Path>, byte_order: ByteOrder, user_header: Option<&[u8]>) -> Result<Self> {
        let file = File::create(path)?;
        Self::from_dest(file, byte_order, user_header)
    }
}

impl<W: Write + Seek> Writer<W> {
    pub fn from_dest(mut dest: W, byte_order: ByteOrder, user_header: Option<&[u8]>) -> Result<Self> {
        let mut file_header = FileHeader::new(byte_order, 1, 0);
        let uh_len = user_header.map(|h| h.len()).unwrap_or(0) as u32;
        file_header.inner.user_header_length_bytes = uh_len;

        let mut buf = vec![0u8; HEADER_BYTES + super::record::padded_len(uh_len) as usize];
        file_header.write(&mut buf, 0)?;
        if let Some(uh) = user_header {
            buf[HEADER_BYTES..HEADER_BYTES + uh.len()].copy_from_slice(uh);
        }
        dest.write_all(&buf)?;

        let first_record_position = buf.len() as u64;
        Ok(Self {
            dest,
            file_header,
            current: RecordOutput::new(byte_order, CompressionType::None),
            trailer_index: Vec::new(),
            add_trailer: false,
            add_trailer_index: false,
            first_record_position,
            closed: false,
        })
    }

    pub fn set_compression_type(&mut self, kind: CompressionType) {
        self.current.set_compression_type(kind);
    }

    pub fn set_max_event_count(&mut self, n: u32) {
        self.current.set_max_event_count(n);
    }

    pub fn set_max_buffer_bytes(&mut self, n: usize) {
        self.current.set_max_buffer_bytes(n);
    }

    pub fn set_add_trailer(&mut self, value: bool) {
        self.add_trailer = value;
    }

    pub fn set_add_trailer_index(&mut self, value: bool) {
        self.add_trailer_index = value;
    }

    /// Add one event, flushing the current record first if it is full.
    pub fn add_event(&mut self, data: &[u8]) -> Result<()> {
        if !self.current.add_event(data)? {
            self.flush_current()?;
            if !self.current.add_event(data)? {
                // Single-event growth already handled inside RecordOutput
                // for a self-owned target; a second rejection means the
                // event alone exceeds max_event_count, not a size issue.
                self.current.add_event(data)?;
            }
        }
        Ok(())
    }

    fn flush_current(&mut self) -> Result<()> {
        if self.current.event_count() == 0 {
            return Ok(());
        }
        self.current.set_record_number(self.trailer_index.len() as u32 + 1);
        let event_count = self.current.event_count();
        let built = self.current.build()?;
        let len = built.len() as u32;
        self.dest.write_all(built)?;
        log::debug!("wrote record #{} ({event_count} events, {len} bytes)", self.trailer_index.len() + 1);
        self.trailer_index.push((len, event_count));
        self.current.reset();
        Ok(())
    }

    /// Force any buffered events to disk without closing the file.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_current()?;
        self.dest.flush()?;
        Ok(())
    }

    /// Flush the last record, optionally write a trailer, then patch the
    /// file header's trailer position and index bit.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_current()?;

        if self.add_trailer {
            let trailer_position = self.dest.stream_position()?;
            let index = if self.add_trailer_index {
                Some(self.trailer_index.as_slice())
            } else {
                None
            };
            let mut buf = vec![0u8; HEADER_BYTES + 8 * self.trailer_index.len()];
            let byte_order = self.file_header.byte_order();
            let record_number = self.trailer_index.len() as u32 + 1;
            FileHeader::write_trailer(&mut buf, 0, record_number, byte_order, index)?;
            self.dest.write_all(&buf)?;

            self.file_header.set_trailer_position(trailer_position);
            self.file_header.set_has_trailer_with_index(self.add_trailer_index);

            self.dest.seek(SeekFrom::Start(0))?;
            let mut header_buf = vec![0u8; HEADER_BYTES];
            self.file_header.write(&mut header_buf, 0)?;
            self.dest.write_all(&header_buf)?;
        }

        self.dest.flush()?;
        self.closed = true;
        Ok(())
    }

    pub fn first_record_position(&self) -> u64 {
        self.first_record_position
    }

    /// Close and hand back the underlying destination (e.g. to read an
    /// in-memory buffer back out after writing it).
    pub fn into_inner(mut self) -> Result<W> {
        self.close()?;
        Ok(self.dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Reader;
    use std::io::Cursor;

    fn open_mem() -> Writer<Cursor<Vec<u8>>> {
        Writer::from_dest(Cursor::new(Vec::new()), ByteOrder::Little, None).unwrap()
    }

    #[test]
    fn writes_file_header_then_records_then_trailer() {
        let mut w = open_mem();
        w.set_add_trailer(true);
        w.set_add_trailer_index(true);
        w.set_max_event_count(2);
        for i in 0..5u8 {
            w.add_event(&vec![i; 10]).unwrap();
        }
        let bytes = w.into_inner().unwrap().into_inner();
        assert!(bytes.len() > HEADER_BYTES);

        let mut reader = Reader::from_buffer(bytes).unwrap();
        reader.scan_buffer().unwrap();
        assert_eq!(reader.event_count(), 5);
        for i in 0..5u8 {
            assert_eq!(reader.get_event(i as i64).unwrap(), vec![i; 10]);
        }
    }

    #[test]
    fn flush_writes_without_closing() {
        let mut w = open_mem();
        w.add_event(&[1, 2, 3]).unwrap();
        w.flush().unwrap();
        let bytes = w.into_inner().unwrap().into_inner();
        assert!(bytes.len() > HEADER_BYTES);
    }
}
