// Integration test utilities
//
// Sessions wired to an in-memory sink, plus helpers to decode what the
// serializer wrote.
#![allow(dead_code)]

use megatrace::capture::{read_stream, Capture, CapturedEvent};
use megatrace::sink::SharedBufferSink;
use megatrace::{BridgeConfig, Event, Identity, Session, SinkConfig};
use std::thread;
use std::time::{Duration, Instant};

/// Fast-polling configuration for tests
pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        poll_interval_ms: 1,
        reconnect_initial_ms: 5,
        reconnect_max_ms: 20,
        shutdown_grace_ms: 2_000,
        dropped_report_interval_ms: 1,
        ..BridgeConfig::default()
    }
    .with_sink(SinkConfig::Null)
}

pub fn test_identity() -> Identity {
    Identity::new("megatrace-test", "MEGATrace Test", "0.0.1", "mega.trace.test")
}

/// Start a session writing into `sink`
pub fn start(config: BridgeConfig, sink: &SharedBufferSink) -> Session {
    Session::start(config, test_identity(), Box::new(sink.clone())).unwrap()
}

/// Decode the most recent connection of `sink`
pub fn decode(sink: &SharedBufferSink) -> (Capture, Vec<CapturedEvent>) {
    read_stream(&sink.contents()[..]).unwrap()
}

/// Decode every connection of `sink` independently
pub fn decode_connections(sink: &SharedBufferSink) -> Vec<(Capture, Vec<CapturedEvent>)> {
    sink.connections()
        .iter()
        .map(|bytes| read_stream(&bytes[..]).unwrap())
        .collect()
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Zone begin/end events recorded by `thread_id`, in stream order
pub fn zone_events(events: &[CapturedEvent], thread_id: u32) -> Vec<Event> {
    events
        .iter()
        .filter(|e| e.thread_id == thread_id)
        .map(|e| e.event)
        .filter(|e| matches!(e, Event::ZoneBegin { .. } | Event::ZoneEnd { .. }))
        .collect()
}

/// Values of the counter called `name`, per recording thread, in stream order
pub fn counter_values(capture: &Capture, events: &[CapturedEvent], name: &str) -> Vec<(u32, f64)> {
    events
        .iter()
        .filter_map(|e| match e.event {
            Event::Counter { name: id, value, .. } if capture.string(id) == Some(name) => {
                Some((e.thread_id, value))
            }
            _ => None,
        })
        .collect()
}
