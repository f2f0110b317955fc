//! Multithreaded record pipeline: one producer (the caller), N
//! compressor threads, and one writer thread, joined by a
//! [`RecordSupply`] ring.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::compressor::CompressionType;
use crate::error::{HipoError, Result};
use crate::record::file_header::FileHeader;
use crate::record::header::ByteOrder;
use crate::record::{padded_len, HEADER_BYTES};

use super::ring::RecordSupply;
use super::wait::{BlockWait, SpinWait, WaitStrategy, YieldWait};

/// Which [`WaitStrategy`] a [`WriterMtConfig`] should install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategyKind {
    Spin,
    Yield,
    Block,
}

impl WaitStrategyKind {
    fn build(self) -> Box<dyn WaitStrategy> {
        match self {
            Self::Spin => Box::new(SpinWait),
            Self::Yield => Box::new(YieldWait),
            Self::Block => Box::new(BlockWait::new(Duration::from_micros(200))),
        }
    }
}

/// Tunables for [`WriterMT`]: `ring_size`, `compressor_threads`,
/// `wait_strategy`, and the per-record output budget.
#[derive(Debug, Clone, Copy)]
pub struct WriterMtConfig {
    pub ring_size: usize,
    pub compressor_threads: usize,
    pub compression_type: CompressionType,
    pub wait_strategy: WaitStrategyKind,
    pub max_event_count: u32,
    pub max_buffer_bytes: usize,
    pub add_trailer: bool,
    pub add_trailer_index: bool,
}

impl Default for WriterMtConfig {
    /// One compressor thread per available core over a 32-slot ring.
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Self {
            ring_size: 32,
            compressor_threads: threads,
            compression_type: CompressionType::Lz4Fast,
            wait_strategy: WaitStrategyKind::Spin,
            max_event_count: u32::MAX,
            max_buffer_bytes: 8 * 1024 * 1024,
            add_trailer: true,
            add_trailer_index: true,
        }
    }
}

/// Drives the background compressor/writer threads. The caller (the
/// producer, in spec terms) fills events via [`WriterMT::add_event`];
/// [`WriterMT::close`] drains the pipeline and patches the file header.
pub struct WriterMT<W: Write + Seek + Send + 'static> {
    file_header: FileHeader,
    first_record_position: u64,
    supply: Arc<RecordSupply>,
    writer_handle: Option<JoinHandle<(W, Result<Vec<(u32, u32)>>)>>,
    compressor_handles: Vec<JoinHandle<()>>,
    seq: u64,
    has_open_slot: bool,
    add_trailer: bool,
    add_trailer_index: bool,
    closed: bool,
}

impl WriterMT<File> {
    pub fn open(
        path: impl AsRef<Path>,
        byte_order: ByteOrder,
        user_header: Option<&[u8]>,
        config: WriterMtConfig,
    ) -> Result<Self> {
        let file = File::create(path)?;
        Self::from_dest(file, byte_order, user_header, config)
    }
}

impl<W: Write + Seek + Send + 'static> WriterMT<W> {
    pub fn from_dest(
        mut dest: W,
        byte_order: ByteOrder,
        user_header: Option<&[u8]>,
        config: WriterMtConfig,
    ) -> Result<Self> {
        let mut file_header = FileHeader::new(byte_order, 1, 0);
        let uh_len = user_header.map(|h| h.len()).unwrap_or(0) as u32;
        file_header.inner.user_header_length_bytes = uh_len;

        let mut buf = vec![0u8; HEADER_BYTES + padded_len(uh_len) as usize];
        file_header.write(&mut buf, 0)?;
        if let Some(uh) = user_header {
            buf[HEADER_BYTES..HEADER_BYTES + uh.len()].copy_from_slice(uh);
        }
        dest.write_all(&buf)?;
        let first_record_position = buf.len() as u64;

        let wait_strategy = config.wait_strategy.build();
        let supply = Arc::new(RecordSupply::new(
            config.ring_size,
            config.compressor_threads,
            byte_order,
            config.compression_type,
            wait_strategy,
        )?);

        for i in 0..config.ring_size as u64 {
            supply.with_slot(i, |item| {
                item.output.set_max_event_count(config.max_event_count);
                item.output.set_max_buffer_bytes(config.max_buffer_bytes);
            });
        }

        log::debug!(
            "starting mt writer: ring_size={}, compressor_threads={}",
            config.ring_size, config.compressor_threads
        );
        let mut compressor_handles = Vec::with_capacity(config.compressor_threads);
        let n = config.compressor_threads as u64;
        for k in 0..n {
            let supply = Arc::clone(&supply);
            compressor_handles.push(std::thread::spawn(move || {
                supply.run_compressor(k, n);
            }));
        }

        let writer_supply = Arc::clone(&supply);
        let writer_handle = std::thread::spawn(move || writer_supply.run_writer(dest));

        Ok(Self {
            file_header,
            first_record_position,
            supply,
            writer_handle: Some(writer_handle),
            compressor_handles,
            seq: 0,
            has_open_slot: false,
            add_trailer: config.add_trailer,
            add_trailer_index: config.add_trailer_index,
            closed: false,
        })
    }

    pub fn first_record_position(&self) -> u64 {
        self.first_record_position
    }

    fn ensure_open_slot(&mut self) -> Result<()> {
        if !self.has_open_slot {
            self.supply.get(self.seq)?;
            self.has_open_slot = true;
        }
        Ok(())
    }

    /// Add one event, publishing the current slot and fetching a fresh
    /// one if it's full.
    pub fn add_event(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open_slot()?;
        let added: Result<bool> = self.supply.with_slot(self.seq, |item| item.output.add_event(data));
        if added? {
            return Ok(());
        }

        self.supply.publish(self.seq);
        self.seq += 1;
        self.has_open_slot = false;
        self.ensure_open_slot()?;
        let added: Result<bool> = self.supply.with_slot(self.seq, |item| item.output.add_event(data));
        if added? {
            Ok(())
        } else {
            Err(HipoError::BufferTooSmall {
                needed: data.len(),
                available: 0,
            })
        }
    }

    /// Drain the pipeline: publish any partial slot, tell the producer
    /// side of the supply it's done, join every thread, then (if
    /// configured) write the trailer and patch the file header. Returns
    /// the underlying destination.
    pub fn close(mut self) -> Result<W> {
        log::debug!("closing mt writer at sequence {}", self.seq);
        if self.has_open_slot {
            let event_count = self.supply.with_slot(self.seq, |item| item.output.event_count());
            if event_count > 0 {
                self.supply.publish(self.seq);
                self.seq += 1;
            }
        }
        self.supply.close_producer(self.seq);

        for handle in self.compressor_handles.drain(..) {
            let _ = handle.join();
        }
        let (mut dest, result) = self
            .writer_handle
            .take()
            .expect("close() called more than once")
            .join()
            .map_err(|_| HipoError::Alerted("writer thread panicked".into()))?;
        let trailer_index = result?;
        if let Some(err) = self.supply.take_error() {
            return Err(HipoError::Alerted(err));
        }

        if self.add_trailer {
            let trailer_position = dest.stream_position()?;
            let index = if self.add_trailer_index {
                Some(trailer_index.as_slice())
            } else {
                None
            };
            let mut buf = vec![0u8; HEADER_BYTES + 8 * trailer_index.len()];
            let byte_order = self.file_header.byte_order();
            let record_number = trailer_index.len() as u32 + 1;
            FileHeader::write_trailer(&mut buf, 0, record_number, byte_order, index)?;
            dest.write_all(&buf)?;

            self.file_header.set_trailer_position(trailer_position);
            self.file_header.set_has_trailer_with_index(self.add_trailer_index);

            dest.seek(SeekFrom::Start(0))?;
            let mut header_buf = vec![0u8; HEADER_BYTES];
            self.file_header.write(&mut header_buf, 0)?;
            dest.write_all(&header_buf)?;
        }

        dest.flush()?;
        self.closed = true;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Reader;
    use std::io::Cursor;

    fn small_config(threads: usize) -> WriterMtConfig {
        WriterMtConfig {
            ring_size: 8,
            compressor_threads: threads,
            compression_type: CompressionType::Lz4Fast,
            wait_strategy: WaitStrategyKind::Yield,
            max_event_count: u32::MAX,
            max_buffer_bytes: 8 * 1024 * 1024,
            add_trailer: true,
            add_trailer_index: true,
        }
    }

    fn write_events(threads: usize, events: &[Vec<u8>]) -> Vec<u8> {
        let mut w = WriterMT::from_dest(
            Cursor::new(Vec::new()),
            ByteOrder::Little,
            None,
            small_config(threads),
        )
        .unwrap();
        for e in events {
            w.add_event(e).unwrap();
        }
        w.close().unwrap().into_inner()
    }

    #[test]
    fn mt_writer_round_trips_events_through_reader() {
        let events: Vec<Vec<u8>> = (0..40u32).map(|i| vec![(i % 251) as u8; 37]).collect();
        let bytes = write_events(3, &events);

        let mut reader = Reader::from_buffer(bytes).unwrap();
        reader.scan_buffer().unwrap();
        assert_eq!(reader.event_count(), events.len() as u64);
        for (i, e) in events.iter().enumerate() {
            assert_eq!(&reader.get_event(i as i64).unwrap(), e);
        }
    }

    #[test]
    fn output_is_identical_regardless_of_thread_count() {
        let events: Vec<Vec<u8>> = (0..25u32).map(|i| vec![(i * 7 % 256) as u8; 19]).collect();
        let single = write_events(1, &events);
        for threads in [2usize, 4] {
            let many = write_events(threads, &events);
            let mut r1 = Reader::from_buffer(single.clone()).unwrap();
            r1.scan_buffer().unwrap();
            let mut r2 = Reader::from_buffer(many).unwrap();
            r2.scan_buffer().unwrap();
            assert_eq!(r1.event_count(), r2.event_count());
            for i in 0..r1.event_count() as i64 {
                assert_eq!(r1.get_event(i).unwrap(), r2.get_event(i).unwrap());
            }
        }
    }
}
