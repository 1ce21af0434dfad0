//! Typed, forward-only event reading over an [`EventSource`].

use std::path::Path;

use bepline_config::StreamSettings;

use crate::error::StreamError;
use crate::event::{Event, EventRecord};
use crate::source::{open_path, EventSource};

/// Reads typed events from a source, exactly once and in order.
///
/// After the end of the stream, or after any error, every further call
/// returns `Ok(None)`: a failed stream is never resumed.
#[derive(Debug)]
pub struct EventStreamReader<S> {
    source: S,
    events_read: u64,
    skipped: u64,
    done: bool,
}

impl<S: EventSource> EventStreamReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            events_read: 0,
            skipped: 0,
            done: false,
        }
    }

    /// Return the next event, or `None` at end of stream.
    ///
    /// # Errors
    /// Returns an error if the source fails or a message cannot be decoded.
    pub fn next_event(&mut self) -> Result<Option<Event>, StreamError> {
        if self.done {
            return Ok(None);
        }
        match self.read_one() {
            Ok(Some(event)) => Ok(Some(event)),
            Ok(None) => {
                self.done = true;
                tracing::debug!(
                    events = self.events_read,
                    skipped = self.skipped,
                    "build event stream finished"
                );
                Ok(None)
            }
            Err(e) => {
                self.done = true;
                Err(e)
            }
        }
    }

    fn read_one(&mut self) -> Result<Option<Event>, StreamError> {
        let Some(body) = self.source.next_message()? else {
            return Ok(None);
        };
        let index = self.events_read;
        self.events_read = self.events_read.saturating_add(1);
        let record: EventRecord = serde_json::from_slice(&body)
            .map_err(|source| StreamError::Malformed { index, source })?;
        let event = Event::from(record);
        if event == Event::Other {
            self.skipped = self.skipped.saturating_add(1);
        }
        Ok(Some(event))
    }

    /// Number of messages consumed so far.
    pub fn events_read(&self) -> u64 {
        self.events_read
    }
}

impl EventStreamReader<Box<dyn EventSource + Send>> {
    /// Open a stream file; see [`open_path`] for how the framing is chosen.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path, settings: &StreamSettings) -> Result<Self, StreamError> {
        Ok(Self::new(open_path(path, settings)?))
    }
}

impl<S: EventSource> Iterator for EventStreamReader<S> {
    type Item = Result<Event, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}
