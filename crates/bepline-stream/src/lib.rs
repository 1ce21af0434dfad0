//! Build Event Protocol stream reading: wire records, framing, and typed events.

#![forbid(unsafe_code)]

pub mod error;
pub mod event;
pub mod reader;
pub mod source;

pub use error::StreamError;
pub use event::{
    BuildFinished, Event, EventRecord, FileDescriptor, OptionsParsed, OutputGroup, TargetEvent,
    TestResultEvent,
};
pub use reader::EventStreamReader;
pub use source::{open_path, write_delimited, DelimitedSource, EventSource, JsonLinesSource};
