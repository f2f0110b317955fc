//! Multithreaded write pipeline: a fixed-size ring of record slots
//! shared by the producer, N compressor threads, and one writer
//! thread.

pub mod mt_writer;
pub mod ring;
pub mod wait;

pub use mt_writer::{WaitStrategyKind, WriterMT, WriterMtConfig};
pub use ring::{RecordRingItem, RecordSupply};
pub use wait::{BlockWait, SpinWait, WaitStrategy, YieldWait};
