//! Event model
//!
//! [`Event`] is the decoded, structured form of everything the bridge records.
//! [`EventRecord`] is its encoded, transport-ready form: a fixed-size `Copy`
//! buffer, so moving one through a ring never touches the heap. Records are
//! immutable once built; the only way to get one is [`crate::encoder::encode`].
//!
//! All `timestamp_ns` fields are nanoseconds since session start.

use crate::strings::{LocationId, StringId};
use serde::Serialize;

/// Largest encoded record (an `Alloc` with maximal varints)
pub const MAX_RECORD_LEN: usize = 32;

/// Kind tag, first byte of every record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EventKind {
    ZoneBegin = 0x01,
    ZoneEnd = 0x02,
    FrameMark = 0x03,
    Counter = 0x04,
    Alloc = 0x05,
    Free = 0x06,
    ThreadName = 0x07,
    GpuNewContext = 0x08,
    GpuZoneBegin = 0x09,
    GpuZoneEnd = 0x0a,
    GpuTime = 0x0b,
    GpuTimeSync = 0x0c,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::ZoneBegin,
        EventKind::ZoneEnd,
        EventKind::FrameMark,
        EventKind::Counter,
        EventKind::Alloc,
        EventKind::Free,
        EventKind::ThreadName,
        EventKind::GpuNewContext,
        EventKind::GpuZoneBegin,
        EventKind::GpuZoneEnd,
        EventKind::GpuTime,
        EventKind::GpuTimeSync,
    ];

    pub fn from_tag(tag: u8) -> Option<Self> {
        EventKind::ALL.iter().copied().find(|k| *k as u8 == tag)
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ZoneBegin => "zone_begin",
            EventKind::ZoneEnd => "zone_end",
            EventKind::FrameMark => "frame_mark",
            EventKind::Counter => "counter",
            EventKind::Alloc => "alloc",
            EventKind::Free => "free",
            EventKind::ThreadName => "thread_name",
            EventKind::GpuNewContext => "gpu_new_context",
            EventKind::GpuZoneBegin => "gpu_zone_begin",
            EventKind::GpuZoneEnd => "gpu_zone_end",
            EventKind::GpuTime => "gpu_time",
            EventKind::GpuTimeSync => "gpu_time_sync",
        }
    }
}

/// A recorded event
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    ZoneBegin {
        timestamp_ns: u64,
        location: LocationId,
        depth: u32,
    },
    ZoneEnd {
        timestamp_ns: u64,
        depth: u32,
    },
    FrameMark {
        timestamp_ns: u64,
        frame: u64,
    },
    Counter {
        timestamp_ns: u64,
        name: StringId,
        value: f64,
    },
    Alloc {
        timestamp_ns: u64,
        address: u64,
        size: u64,
    },
    Free {
        timestamp_ns: u64,
        address: u64,
    },
    ThreadName {
        timestamp_ns: u64,
        name: StringId,
    },
    GpuNewContext {
        timestamp_ns: u64,
        context: u8,
        gpu_time: u64,
        /// Nanoseconds per GPU tick
        period: f32,
    },
    GpuZoneBegin {
        timestamp_ns: u64,
        context: u8,
        query_id: u16,
        location: LocationId,
    },
    GpuZoneEnd {
        timestamp_ns: u64,
        context: u8,
        query_id: u16,
    },
    GpuTime {
        timestamp_ns: u64,
        context: u8,
        query_id: u16,
        gpu_time: u64,
    },
    GpuTimeSync {
        timestamp_ns: u64,
        context: u8,
        gpu_time: u64,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ZoneBegin { .. } => EventKind::ZoneBegin,
            Event::ZoneEnd { .. } => EventKind::ZoneEnd,
            Event::FrameMark { .. } => EventKind::FrameMark,
            Event::Counter { .. } => EventKind::Counter,
            Event::Alloc { .. } => EventKind::Alloc,
            Event::Free { .. } => EventKind::Free,
            Event::ThreadName { .. } => EventKind::ThreadName,
            Event::GpuNewContext { .. } => EventKind::GpuNewContext,
            Event::GpuZoneBegin { .. } => EventKind::GpuZoneBegin,
            Event::GpuZoneEnd { .. } => EventKind::GpuZoneEnd,
            Event::GpuTime { .. } => EventKind::GpuTime,
            Event::GpuTimeSync { .. } => EventKind::GpuTimeSync,
        }
    }

    pub fn timestamp_ns(&self) -> u64 {
        match *self {
            Event::ZoneBegin { timestamp_ns, .. }
            | Event::ZoneEnd { timestamp_ns, .. }
            | Event::FrameMark { timestamp_ns, .. }
            | Event::Counter { timestamp_ns, .. }
            | Event::Alloc { timestamp_ns, .. }
            | Event::Free { timestamp_ns, .. }
            | Event::ThreadName { timestamp_ns, .. }
            | Event::GpuNewContext { timestamp_ns, .. }
            | Event::GpuZoneBegin { timestamp_ns, .. }
            | Event::GpuZoneEnd { timestamp_ns, .. }
            | Event::GpuTime { timestamp_ns, .. }
            | Event::GpuTimeSync { timestamp_ns, .. } => timestamp_ns,
        }
    }
}

/// Encoded, transport-ready form of one [`Event`]
#[derive(Clone, Copy)]
pub struct EventRecord {
    pub(crate) len: u8,
    pub(crate) bytes: [u8; MAX_RECORD_LEN],
}

impl EventRecord {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Kind tag without decoding the rest
    pub fn kind(&self) -> Option<EventKind> {
        self.as_bytes().first().and_then(|tag| EventKind::from_tag(*tag))
    }
}

impl std::fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecord")
            .field("kind", &self.kind())
            .field("bytes", &self.as_bytes())
            .finish()
    }
}

impl PartialEq for EventRecord {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for EventRecord {}
