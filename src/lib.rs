//! # hipo-record
//!
//! Reads and writes HIPO v6 binary record containers: the block-structured
//! container format used to hold variable-length EVIO events, each record
//! a self-describing unit that can be independently compressed, skipped,
//! or rewritten.
//!
//! Example usage:
//!
//! ```no_run
//! use hipo_record::{ByteOrder, CompressionType, Reader, Writer};
//!
//! // Writing a file one record at a time.
//! let mut writer = Writer::open("out.hipo", ByteOrder::Little, None).unwrap();
//! writer.set_compression_type(CompressionType::Lz4Fast);
//! writer.add_event(b"hello event").unwrap();
//! writer.close().unwrap();
//!
//! // Reading it back.
//! let mut reader = Reader::open("out.hipo").unwrap();
//! let event = reader.get_event(0).unwrap();
//! assert_eq!(event, b"hello event");
//! ```
//!
//! For high-throughput writes, [`WriterMT`] drives a multithreaded
//! compress-then-write pipeline behind the same `add_event`/`close` shape.

pub mod compressor;
pub mod error;
pub mod event_index;
pub mod reader;
pub mod record;
pub mod writer;
pub mod writer_mt;

pub use compressor::{CompressionType, Compressor};
pub use error::{HipoError, Result};
pub use event_index::FileEventIndex;
pub use reader::{Events, Reader, RecordPosition};
pub use record::{ByteOrder, FileHeader, HeaderType, RecordHeader, RecordInput, RecordOutput};
pub use writer::Writer;
pub use writer_mt::{RecordSupply, WaitStrategyKind, WriterMT, WriterMtConfig};
