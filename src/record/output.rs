//! Accumulates events and their lengths, then lays out and compresses a
//! full binary record.

use crate::compressor::{CompressionType, Compressor, DefaultCompressor};
use crate::error::{HipoError, Result};

use super::header::{ByteOrder, HeaderType, RecordHeader};
use super::{padded_len, HEADER_BYTES};

const DEFAULT_MAX_BUFFER_BYTES: usize = 8 * 1024 * 1024;
const FIRST_EVENT_GROWTH_SLACK: usize = 1024 * 1024;

/// Accumulates events for one record and builds its on-disk bytes.
///
/// Owns the index (per-event lengths), the event payload, and — unless
/// a caller-provided target is installed via [`RecordOutput::build_into`]
/// — a self-owned target buffer sized `1.1 * max_buffer_bytes`.
pub struct RecordOutput {
    byte_order: ByteOrder,
    header_type: HeaderType,
    pending_compression_type: CompressionType,
    compression_type: CompressionType,
    record_number: u32,
    user_register_1: u64,
    user_register_2: u64,
    write_index: bool,
    max_event_count: u32,
    max_buffer_bytes: usize,
    /// When `true`, the eventual target is a caller-provided buffer that
    /// cannot be reallocated, so an oversize first event must fail the
    /// add instead of growing `max_buffer_bytes`.
    target_is_caller_provided: bool,
    event_lengths: Vec<u32>,
    events: Vec<u8>,
    own_target: Vec<u8>,
    compressor: Box<dyn Compressor + Send + Sync>,
}

impl std::fmt::Debug for RecordOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordOutput")
            .field("byte_order", &self.byte_order)
            .field("compression_type", &self.compression_type)
            .field("record_number", &self.record_number)
            .field("event_count", &self.event_lengths.len())
            .field("payload_bytes", &self.events.len())
            .finish()
    }
}

impl RecordOutput {
    pub fn new(byte_order: ByteOrder, compression_type: CompressionType) -> Self {
        Self {
            byte_order,
            header_type: HeaderType::Record,
            pending_compression_type: compression_type,
            compression_type,
            record_number: 1,
            user_register_1: 0,
            user_register_2: 0,
            write_index: true,
            max_event_count: u32::MAX,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            target_is_caller_provided: false,
            event_lengths: Vec::new(),
            events: Vec::new(),
            own_target: Vec::new(),
            compressor: Box::new(DefaultCompressor),
        }
    }

    pub fn set_compression_type(&mut self, kind: CompressionType) {
        // Takes effect on the next build(), not immediately.
        self.pending_compression_type = kind;
    }

    pub fn compression_type(&self) -> CompressionType {
        self.compression_type
    }

    pub fn set_record_number(&mut self, n: u32) {
        self.record_number = n;
    }

    pub fn record_number(&self) -> u32 {
        self.record_number
    }

    pub fn set_user_registers(&mut self, r1: u64, r2: u64) {
        self.user_register_1 = r1;
        self.user_register_2 = r2;
    }

    pub fn set_max_event_count(&mut self, n: u32) {
        self.max_event_count = n;
    }

    pub fn set_max_buffer_bytes(&mut self, n: usize) {
        self.max_buffer_bytes = n;
    }

    pub fn max_buffer_bytes(&self) -> usize {
        self.max_buffer_bytes
    }

    /// Mark the eventual build target as caller-provided (i.e. built via
    /// [`RecordOutput::build_into`]/[`RecordOutput::build_into_at`]
    /// rather than [`RecordOutput::build`]). An oversize first event then
    /// fails the add instead of growing `max_buffer_bytes`, since a
    /// caller-provided buffer can never honor that growth.
    pub fn set_target_is_caller_provided(&mut self, value: bool) {
        self.target_is_caller_provided = value;
    }

    /// Omit the per-event index from the built record (`index_length`
    /// word is written as 0). Readers reconstruct it from EVIO framing.
    pub fn set_write_index(&mut self, write_index: bool) {
        self.write_index = write_index;
    }

    pub fn event_count(&self) -> u32 {
        self.event_lengths.len() as u32
    }

    fn index_bytes(&self) -> usize {
        4 * self.event_lengths.len()
    }

    fn room_for_event(&self, n: usize) -> bool {
        self.index_bytes() + 4 + self.events.len() + HEADER_BYTES + n <= self.max_buffer_bytes
    }

    /// Append one event's bytes. Returns `false` (not an error) if the
    /// record is full; on a self-owned target, a too-large *first*
    /// event instead grows the buffer budget and retries. On a
    /// caller-provided target (see
    /// [`set_target_is_caller_provided`](Self::set_target_is_caller_provided)),
    /// the add is rejected instead, since that buffer cannot grow.
    pub fn add_event(&mut self, data: &[u8]) -> Result<bool> {
        if self.event_lengths.is_empty() && !self.room_for_event(data.len()) {
            if self.target_is_caller_provided {
                return Ok(false);
            }
            log::warn!(
                "growing record buffer budget to {} bytes for a single {}-byte event",
                data.len() + HEADER_BYTES + FIRST_EVENT_GROWTH_SLACK,
                data.len()
            );
            self.max_buffer_bytes = data.len() + HEADER_BYTES + FIRST_EVENT_GROWTH_SLACK;
        } else if self.event_lengths.len() as u32 >= self.max_event_count || !self.room_for_event(data.len())
        {
            return Ok(false);
        }

        self.events.extend_from_slice(data);
        self.event_lengths.push(data.len() as u32);
        Ok(true)
    }

    /// Return to the empty state. Compression/byte-order/header-kind are
    /// left untouched.
    pub fn reset(&mut self) {
        self.event_lengths.clear();
        self.events.clear();
    }

    fn bit_info_header(&self, compressed_len: u32, user_header_len: u32) -> RecordHeader {
        let user_header_pad = (padded_len(user_header_len) - user_header_len) as u8;
        let data_pad = (padded_len(self.events.len() as u32) - self.events.len() as u32) as u8;
        let compressed_pad = (padded_len(compressed_len) - compressed_len) as u8;

        RecordHeader {
            byte_order: self.byte_order,
            record_length_words: 0, // filled by caller
            record_number: self.record_number,
            event_count: self.event_lengths.len() as u32,
            index_length_bytes: if self.write_index {
                self.index_bytes() as u32
            } else {
                0
            },
            version: 6,
            has_dictionary: false,
            is_last_record: false,
            event_type: 0,
            user_header_pad,
            data_pad,
            compressed_pad,
            header_type: self.header_type,
            user_header_length_bytes: user_header_len,
            data_length_bytes: self.events.len() as u32,
            compression_type: self.compression_type,
            compressed_data_length_bytes: compressed_len,
            user_register_1: self.user_register_1,
            user_register_2: self.user_register_2,
        }
    }

    /// Build with no user header, into this `RecordOutput`'s self-owned
    /// target buffer (sized `1.1 * max_buffer_bytes`, reallocated if
    /// still too small). Returns the ready-to-read record bytes.
    pub fn build(&mut self) -> Result<&[u8]> {
        self.build_with_user_header_owned(None)
    }

    pub fn build_with_user_header(&mut self, user_header: Option<&[u8]>) -> Result<&[u8]> {
        self.build_with_user_header_owned(user_header)
    }

    fn build_with_user_header_owned(&mut self, user_header: Option<&[u8]>) -> Result<&[u8]> {
        let needed = self.estimate_record_len(user_header);
        let capacity = (self.max_buffer_bytes as f64 * 1.1).ceil() as usize;
        // write_into needs `&mut self` and `&mut target` at once; stage
        // into a buffer taken out of `self` for the duration of the call.
        let mut staged = std::mem::take(&mut self.own_target);
        if staged.len() < needed.max(capacity) {
            staged.resize(needed.max(capacity), 0);
        }
        let written = self.write_into(&mut staged, 0, user_header)?;
        self.own_target = staged;
        Ok(&self.own_target[..written])
    }

    /// Build into a caller-provided buffer at offset 0. The buffer
    /// cannot be grown: an oversized record fails with
    /// [`HipoError::BufferTooSmall`].
    pub fn build_into(&mut self, dst: &mut [u8]) -> Result<usize> {
        self.write_into(dst, 0, None)
    }

    pub fn build_into_at(&mut self, dst: &mut [u8], starting_position: usize) -> Result<usize> {
        self.write_into(dst, starting_position, None)
    }

    fn estimate_record_len(&self, user_header: Option<&[u8]>) -> usize {
        let uh_len = user_header.map(|h| h.len()).unwrap_or(0) as u32;
        let uncompressed = self.index_bytes() as u32 + padded_len(uh_len) + padded_len(self.events.len() as u32);
        HEADER_BYTES + padded_len(uncompressed) as usize + 64
    }

    fn write_into(&mut self, dst: &mut [u8], starting_position: usize, user_header: Option<&[u8]>) -> Result<usize> {
        self.compression_type = self.pending_compression_type;

        if self.event_lengths.is_empty() && user_header.is_none() {
            let header = RecordHeader {
                record_length_words: super::HEADER_WORDS,
                ..RecordHeader::empty(self.byte_order, self.record_number)
            };
            if dst.len() < starting_position + HEADER_BYTES {
                return Err(HipoError::BufferTooSmall {
                    needed: starting_position + HEADER_BYTES,
                    available: dst.len(),
                });
            }
            header.write(dst, starting_position)?;
            return Ok(starting_position + HEADER_BYTES);
        }

        let uh = user_header.unwrap_or(&[]);
        let uh_len = uh.len() as u32;
        let uh_padded = padded_len(uh_len) as usize;
        let data_padded = padded_len(self.events.len() as u32) as usize;
        let index_bytes = if self.write_index { self.index_bytes() } else { 0 };

        let mut staging = Vec::with_capacity(index_bytes + uh_padded + data_padded);
        if self.write_index {
            for len in &self.event_lengths {
                staging.extend_from_slice(&match self.byte_order {
                    ByteOrder::Little => len.to_le_bytes(),
                    ByteOrder::Big => len.to_be_bytes(),
                });
            }
        }
        staging.extend_from_slice(uh);
        staging.resize(index_bytes + uh_padded, 0);
        staging.extend_from_slice(&self.events);
        staging.resize(index_bytes + uh_padded + data_padded, 0);

        let (compressed_len, record_len_words) = if self.compression_type.is_compressed() {
            let payload_off = starting_position + HEADER_BYTES;
            if dst.len() < payload_off {
                return Err(HipoError::BufferTooSmall {
                    needed: payload_off,
                    available: dst.len(),
                });
            }
            let capacity = dst.len() - payload_off;
            let compressed_len = match self.compression_type {
                CompressionType::Lz4Fast => self.compressor.compress_lz4_fast(
                    &staging,
                    0,
                    staging.len(),
                    dst,
                    payload_off,
                    capacity,
                )?,
                CompressionType::Lz4Best => self.compressor.compress_lz4_best(
                    &staging,
                    0,
                    staging.len(),
                    dst,
                    payload_off,
                    capacity,
                )?,
                CompressionType::Gzip => {
                    let out = self.compressor.compress_gzip(&staging, 0, staging.len())?;
                    if out.len() > capacity {
                        return Err(HipoError::BufferTooSmall {
                            needed: payload_off + out.len(),
                            available: dst.len(),
                        });
                    }
                    dst[payload_off..payload_off + out.len()].copy_from_slice(&out);
                    out.len()
                }
                CompressionType::None => unreachable!(),
            };
            let record_len_words = super::words(HEADER_BYTES as u32 + padded_len(compressed_len as u32));
            (compressed_len as u32, record_len_words)
        } else {
            let payload_off = starting_position + HEADER_BYTES;
            if dst.len() < payload_off + staging.len() {
                return Err(HipoError::BufferTooSmall {
                    needed: payload_off + staging.len(),
                    available: dst.len(),
                });
            }
            dst[payload_off..payload_off + staging.len()].copy_from_slice(&staging);
            let record_len_words = super::words(HEADER_BYTES as u32 + staging.len() as u32);
            (0u32, record_len_words)
        };

        let header = self.bit_info_header(compressed_len, uh_len);
        let header = RecordHeader {
            record_length_words: record_len_words,
            ..header
        };
        header.write(dst, starting_position)?;

        let total = HEADER_BYTES as u32 + if self.compression_type.is_compressed() {
            padded_len(compressed_len)
        } else {
            staging.len() as u32
        };
        Ok(starting_position + total as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_build_is_56_bytes() {
        let mut out = RecordOutput::new(ByteOrder::Little, CompressionType::None);
        let built = out.build().unwrap();
        assert_eq!(built.len(), HEADER_BYTES);
        let header = RecordHeader::read(built, 0, ByteOrder::Little).unwrap();
        assert_eq!(header.event_count, 0);
        assert_eq!(header.compressed_data_length_bytes, 0);
        assert_eq!(header.record_length_words, super::super::HEADER_WORDS);
    }

    #[test]
    fn s1_uncompressed_three_events() {
        let mut out = RecordOutput::new(ByteOrder::Little, CompressionType::None);
        for len in [20usize, 24, 28] {
            assert!(out.add_event(&vec![0xABu8; len]).unwrap());
        }
        let mut buf = vec![0u8; 4096];
        let written = out.build_into(&mut buf).unwrap();
        // header(56) + index(12) + events(72)
        assert_eq!(written, 56 + 12 + 72);
    }

    #[test]
    fn room_for_event_rejects_when_full() {
        let mut out = RecordOutput::new(ByteOrder::Little, CompressionType::None);
        out.set_max_buffer_bytes(64);
        out.set_max_event_count(1);
        assert!(out.add_event(&[1, 2, 3]).unwrap());
        assert!(!out.add_event(&[4, 5, 6]).unwrap());
    }

    #[test]
    fn oversize_first_event_grows_self_owned_target() {
        let mut out = RecordOutput::new(ByteOrder::Little, CompressionType::None);
        out.set_max_buffer_bytes(8);
        assert!(out.add_event(&[0u8; 64]).unwrap());
        assert!(out.max_buffer_bytes() > 8);
    }

    #[test]
    fn oversize_first_event_rejected_for_caller_provided_target() {
        let mut out = RecordOutput::new(ByteOrder::Little, CompressionType::None);
        out.set_max_buffer_bytes(8);
        out.set_target_is_caller_provided(true);
        assert!(!out.add_event(&[0u8; 64]).unwrap());
        assert_eq!(out.max_buffer_bytes(), 8);
    }

    #[test]
    fn set_compression_type_takes_effect_next_build() {
        let mut out = RecordOutput::new(ByteOrder::Little, CompressionType::None);
        out.add_event(&[1, 2, 3, 4]).unwrap();
        out.set_compression_type(CompressionType::Gzip);
        assert_eq!(out.compression_type(), CompressionType::None);
        let mut buf = vec![0u8; 4096];
        out.build_into(&mut buf).unwrap();
        assert_eq!(out.compression_type(), CompressionType::Gzip);
    }
}
