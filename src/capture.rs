//! Stream consumer
//!
//! Folds decoded frames into a view a human (or a test) can read: interned
//! ids resolved back to names, per-kind counts, and the session summary if
//! the writer said goodbye. Used by `megatrace-capture`.

use crate::error::DecodeError;
use crate::event::Event;
use crate::strings::{LocationDef, LocationId, StringId};
use crate::wire::{Handshake, SessionSummary, StreamDecoder, WireMessage};
use fnv::FnvHashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Read;

/// One event and the thread that recorded it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapturedEvent {
    pub thread_id: u32,
    pub event: Event,
}

/// Source location information in JSON output
#[derive(Debug, Clone, Serialize)]
pub struct JsonSourceLocation {
    pub function: String,
    pub file: String,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
}

/// A single event in JSON output
#[derive(Debug, Clone, Serialize)]
pub struct JsonEvent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    pub thread_id: u32,
    #[serde(flatten)]
    pub event: &'a Event,
    /// Resolved zone, counter or thread name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<JsonSourceLocation>,
}

/// Totals over everything captured
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureSummary {
    pub sessions: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub threads: usize,
    pub events: u64,
    pub per_kind: BTreeMap<&'static str, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goodbye: Option<SessionSummary>,
}

impl fmt::Display for CaptureSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.identity, &self.target) {
            (Some(identity), Some(target)) => writeln!(f, "source: {} on {}", identity, target)?,
            (Some(identity), None) => writeln!(f, "source: {}", identity)?,
            _ => {}
        }
        writeln!(
            f,
            "{} events from {} threads ({} sessions)",
            self.events, self.threads, self.sessions
        )?;
        for (kind, count) in &self.per_kind {
            writeln!(f, "  {:<16} {:>10}", kind, count)?;
        }
        if let Some(bye) = &self.goodbye {
            writeln!(
                f,
                "writer: {} written, {} dropped (queue full {}, transport {}, shutdown {})",
                bye.records_written,
                bye.dropped_queue_full + bye.dropped_transport + bye.dropped_at_shutdown,
                bye.dropped_queue_full,
                bye.dropped_transport,
                bye.dropped_at_shutdown
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Capture {
    handshake: Option<Handshake>,
    strings: FnvHashMap<StringId, String>,
    locations: FnvHashMap<LocationId, LocationDef>,
    goodbye: Option<SessionSummary>,
    per_kind: BTreeMap<&'static str, u64>,
    threads: BTreeSet<u32>,
    events: u64,
    sessions: u64,
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one frame in; events it carries are appended to `out`
    pub fn apply(&mut self, message: WireMessage, out: &mut Vec<CapturedEvent>) {
        match message {
            WireMessage::Handshake(handshake) => {
                let same_session = self
                    .handshake
                    .as_ref()
                    .is_some_and(|h| h.session_id == handshake.session_id);
                if !same_session {
                    // Ids are per session
                    self.strings.clear();
                    self.locations.clear();
                    self.goodbye = None;
                    self.sessions += 1;
                }
                self.handshake = Some(handshake);
            }
            WireMessage::Strings(defs) => {
                for def in defs {
                    self.strings.insert(def.id, def.text);
                }
            }
            WireMessage::Locations(defs) => {
                for def in defs {
                    self.locations.insert(def.id, def);
                }
            }
            WireMessage::Events { thread_id, events } => {
                self.threads.insert(thread_id);
                for event in events {
                    self.events += 1;
                    *self.per_kind.entry(event.kind().name()).or_insert(0) += 1;
                    out.push(CapturedEvent { thread_id, event });
                }
            }
            WireMessage::Goodbye(summary) => self.goodbye = Some(summary),
        }
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    pub fn goodbye(&self) -> Option<&SessionSummary> {
        self.goodbye.as_ref()
    }

    pub fn string(&self, id: StringId) -> Option<&str> {
        self.strings.get(&id).map(String::as_str)
    }

    pub fn location(&self, id: LocationId) -> Option<&LocationDef> {
        self.locations.get(&id)
    }

    /// Display name of a location: its name, else its function
    pub fn location_name(&self, id: LocationId) -> Option<&str> {
        let def = self.location(id)?;
        def.name
            .and_then(|n| self.string(n))
            .or_else(|| self.string(def.function))
    }

    /// Resolved name carried by `event`, if it has one
    pub fn label(&self, event: &Event) -> Option<String> {
        match *event {
            Event::ZoneBegin { location, .. } | Event::GpuZoneBegin { location, .. } => Some(
                self.location_name(location)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("#loc{}", location.0)),
            ),
            Event::Counter { name, .. } | Event::ThreadName { name, .. } => Some(
                self.string(name)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("#str{}", name.0)),
            ),
            _ => None,
        }
    }

    fn source_of(&self, event: &Event) -> Option<JsonSourceLocation> {
        let location = match *event {
            Event::ZoneBegin { location, .. } | Event::GpuZoneBegin { location, .. } => location,
            _ => return None,
        };
        let def = self.location(location)?;
        Some(JsonSourceLocation {
            function: self.string(def.function)?.to_string(),
            file: self.string(def.file)?.to_string(),
            line: def.line,
            color: (def.color != 0).then_some(def.color),
        })
    }

    pub fn render_text(&self, captured: &CapturedEvent) -> String {
        let event = &captured.event;
        let label = self.label(event).unwrap_or_default();
        let detail = match *event {
            Event::ZoneBegin {
                depth, location, ..
            } => match self.location(location) {
                Some(def) => format!(
                    "{} depth={} {}:{}",
                    label,
                    depth,
                    self.string(def.file).unwrap_or("?"),
                    def.line
                ),
                None => format!("{} depth={}", label, depth),
            },
            Event::ZoneEnd { depth, .. } => format!("depth={}", depth),
            Event::FrameMark { frame, .. } => format!("frame={}", frame),
            Event::Counter { value, .. } => format!("{} = {}", label, value),
            Event::Alloc { address, size, .. } => format!("{:#x} size={}", address, size),
            Event::Free { address, .. } => format!("{:#x}", address),
            Event::ThreadName { .. } => label,
            Event::GpuNewContext {
                context,
                gpu_time,
                period,
                ..
            } => format!("ctx={} gpu_time={} period={}", context, gpu_time, period),
            Event::GpuZoneBegin {
                context, query_id, ..
            } => format!("ctx={} query={} {}", context, query_id, label),
            Event::GpuZoneEnd {
                context, query_id, ..
            } => format!("ctx={} query={}", context, query_id),
            Event::GpuTime {
                context,
                query_id,
                gpu_time,
                ..
            } => format!("ctx={} query={} gpu_time={}", context, query_id, gpu_time),
            Event::GpuTimeSync {
                context, gpu_time, ..
            } => format!("ctx={} gpu_time={}", context, gpu_time),
        };

        format!(
            "{:>14.6} ms  t{:<4} {:<15} {}",
            event.timestamp_ns() as f64 / 1_000_000.0,
            captured.thread_id,
            event.kind().name(),
            detail
        )
    }

    pub fn render_json(&self, captured: &CapturedEvent) -> serde_json::Result<String> {
        serde_json::to_string(&JsonEvent {
            session_id: self.handshake.as_ref().map(|h| h.session_id),
            thread_id: captured.thread_id,
            event: &captured.event,
            label: self.label(&captured.event),
            source: self.source_of(&captured.event),
        })
    }

    pub fn summary(&self) -> CaptureSummary {
        CaptureSummary {
            sessions: self.sessions,
            identity: self.handshake.as_ref().map(|h| h.identity.to_string()),
            target: self.handshake.as_ref().map(|h| h.target.clone()),
            threads: self.threads.len(),
            events: self.events,
            per_kind: self.per_kind.clone(),
            goodbye: self.goodbye,
        }
    }
}

/// Decode a whole stream
pub fn read_stream<R: Read>(reader: R) -> Result<(Capture, Vec<CapturedEvent>), DecodeError> {
    let mut capture = Capture::new();
    let mut events = Vec::new();
    for message in StreamDecoder::new(reader) {
        capture.apply(message?, &mut events);
    }
    Ok((capture, events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::encode;
    use crate::identity::Identity;
    use crate::strings::StringDef;
    use crate::wire::{self, FrameTag, PROTOCOL_VERSION};

    fn stream(session_id: u64) -> Vec<u8> {
        let mut out = Vec::new();
        wire::write_preamble(&mut out);
        let handshake = Handshake {
            protocol_version: PROTOCOL_VERSION,
            identity: Identity::new("megatrace", "MEGATrace", "1.2.3", "mega.trace"),
            session_id,
            process_id: 1,
            session_start_unix_ns: 0,
            target: "aarch64-linux-gnu".to_string(),
        };
        wire::write_message(&mut out, FrameTag::Handshake, &handshake).unwrap();
        let strings = vec![
            StringDef { id: StringId(0), text: "tick".into() },
            StringDef { id: StringId(1), text: "Server.tick".into() },
            StringDef { id: StringId(2), text: "Server.java".into() },
            StringDef { id: StringId(3), text: "tps".into() },
        ];
        wire::write_message(&mut out, FrameTag::Strings, &strings).unwrap();
        let locations = vec![LocationDef {
            id: LocationId(0),
            name: Some(StringId(0)),
            function: StringId(1),
            file: StringId(2),
            line: 42,
            color: 0xff0000,
        }];
        wire::write_message(&mut out, FrameTag::Locations, &locations).unwrap();
        let records = [
            encode(&Event::ZoneBegin { timestamp_ns: 1_000, location: LocationId(0), depth: 1 }),
            encode(&Event::Counter { timestamp_ns: 1_500, name: StringId(3), value: 20.0 }),
            encode(&Event::ZoneEnd { timestamp_ns: 2_000, depth: 1 }),
        ];
        wire::write_events_frame(&mut out, 3, &records);
        out
    }

    #[test]
    fn test_names_are_resolved() {
        let (capture, events) = read_stream(&stream(1)[..]).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(capture.label(&events[0].event).as_deref(), Some("tick"));
        assert_eq!(capture.label(&events[1].event).as_deref(), Some("tps"));

        let line = capture.render_text(&events[0]);
        assert!(line.contains("zone_begin"));
        assert!(line.contains("tick depth=1 Server.java:42"));
    }

    #[test]
    fn test_json_rendering() {
        let (capture, events) = read_stream(&stream(1)[..]).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&capture.render_json(&events[0]).unwrap()).unwrap();
        assert_eq!(json["kind"], "zone_begin");
        assert_eq!(json["thread_id"], 3);
        assert_eq!(json["label"], "tick");
        assert_eq!(json["source"]["file"], "Server.java");
        assert_eq!(json["source"]["color"], 0xff0000);
    }

    #[test]
    fn test_summary_counts_kinds() {
        let (capture, _) = read_stream(&stream(1)[..]).unwrap();
        let summary = capture.summary();
        assert_eq!(summary.events, 3);
        assert_eq!(summary.threads, 1);
        assert_eq!(summary.per_kind.get("zone_begin"), Some(&1));
        assert_eq!(summary.identity.as_deref(), Some("MEGATrace 1.2.3 (megatrace)"));
        assert_eq!(summary.target.as_deref(), Some("aarch64-linux-gnu"));
        let text = summary.to_string();
        assert!(text.contains("source: MEGATrace 1.2.3 (megatrace) on aarch64-linux-gnu"));
        assert!(text.contains("3 events from 1 threads"));
    }

    #[test]
    fn test_new_session_resets_dictionaries() {
        let mut bytes = stream(1);
        bytes.extend_from_slice(&stream(2));
        let (capture, _) = read_stream(&bytes[..]).unwrap();
        assert_eq!(capture.summary().sessions, 2);
        assert_eq!(capture.handshake().map(|h| h.session_id), Some(2));
    }

    #[test]
    fn test_unresolved_ids_fall_back() {
        let capture = Capture::new();
        let event = Event::Counter {
            timestamp_ns: 0,
            name: StringId(9),
            value: 1.0,
        };
        assert_eq!(capture.label(&event).as_deref(), Some("#str9"));
    }
}
