//! JSON-lines event sink: writes one `{"topic": ..., "event": ...}` object
//! per subscribed event to a buffered file.
//!
//! Grounded in `original_source/processor/dump.go`'s `Dumper` (topic list
//! configured at construction, `bufio.Writer`, flush-and-close on
//! teardown). Control-plane events (`"packet"`, `"flow.attach_telemetry"`)
//! are never meaningful to record and are silently skipped via
//! [`Event::as_json`](crate::event::Event::as_json) returning `None`.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::event::{self, Event, EventManager, Processor, Topic};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("unable to open sink file {path:?}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Serialize)]
struct DumpItem<'a> {
    topic: &'a str,
    event: serde_json::Value,
}

/// Subscribes to a configured set of topics and appends one JSON line per
/// event to a buffered file, flushing and closing it on teardown.
pub struct JsonSink {
    writer: RefCell<BufWriter<File>>,
    subs: Vec<Topic>,
}

impl JsonSink {
    pub fn new(path: impl AsRef<Path>, topics: Vec<Topic>) -> Result<Self, SinkError> {
        let path_ref = path.as_ref();
        let file = File::create(path_ref).map_err(|source| SinkError::Open {
            path: path_ref.display().to_string(),
            source,
        })?;
        Ok(JsonSink {
            writer: RefCell::new(BufWriter::new(file)),
            subs: topics,
        })
    }
}

impl Processor for JsonSink {
    fn name(&self) -> &str {
        "json_sink"
    }

    fn subs(&self) -> &[Topic] {
        &self.subs
    }

    fn handle_event(&self, topic: Topic, event: &Event, _bus: &EventManager) {
        let Some(value) = event.as_json() else {
            return;
        };
        let item = DumpItem { topic, event: value };
        let Ok(line) = serde_json::to_string(&item) else {
            log::error!("sink: failed to marshal event on topic {topic:?}");
            return;
        };
        let mut writer = self.writer.borrow_mut();
        if let Err(e) = writeln!(writer, "{line}") {
            log::error!("sink: failed to write event on topic {topic:?}: {e}");
        }
    }

    fn teardown(&self, _bus: &EventManager) {
        let mut writer = self.writer.borrow_mut();
        if let Err(e) = writer.flush() {
            log::error!("sink: failed to flush on teardown: {e}");
        }
    }
}

/// Convenience constructor mirroring `original_source`'s common
/// "record everything telemetry ever publishes" configuration.
pub fn all_telemetry_topics() -> Vec<Topic> {
    vec![
        event::FLOW_CREATED,
        event::FLOW_EXPIRED,
        event::CLASSIFICATION,
        event::PROTOCOL_SNI,
        event::PROTOCOL_DNS,
        event::TELEMETRY_FLOW_SUMMARY,
        event::TELEMETRY_FLOW_PULSE,
        event::TELEMETRY_FLOW_PRINT,
        event::TELEMETRY_GAP_CHUNK,
        event::TELEMETRY_FLOWLET,
        event::TELEMETRY_HTTP_CHUNK,
        event::TELEMETRY_TCP_RETRANSMIT,
        event::TELEMETRY_TCP_RTT,
        event::TELEMETRY_FRAME,
    ]
}
