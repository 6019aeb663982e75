//! Event encoder
//!
//! Turns an [`Event`] into a compact [`EventRecord`] and back.
//!
//! # Record layout
//!
//! ```text
//! ┌──────┬───────────────┬──────────────────────────────────────────┐
//! │ kind │ timestamp_ns  │ kind-specific fields                     │
//! │ u8   │ LEB128 u64    │ LEB128 ints, raw u8, LE f64/f32          │
//! └──────┴───────────────┴──────────────────────────────────────────┘
//! ```
//!
//! Timestamps are session-relative so they stay short; names and locations
//! are interned ids. Encoding writes into a stack buffer: no allocation, no
//! string copies, a handful of predictable branches per varint.

use crate::error::DecodeError;
use crate::event::{Event, EventKind, EventRecord, MAX_RECORD_LEN};
use crate::strings::{LocationId, StringId};

struct RecordWriter {
    bytes: [u8; MAX_RECORD_LEN],
    pos: usize,
}

impl RecordWriter {
    #[inline]
    fn new(kind: EventKind, timestamp_ns: u64) -> Self {
        let mut w = RecordWriter {
            bytes: [0; MAX_RECORD_LEN],
            pos: 0,
        };
        w.put_u8(kind as u8);
        w.put_varint(timestamp_ns);
        w
    }

    #[inline]
    fn put_u8(&mut self, b: u8) {
        // Every kind fits in MAX_RECORD_LEN; see test_maximal_records_fit
        if let Some(slot) = self.bytes.get_mut(self.pos) {
            *slot = b;
            self.pos += 1;
        }
    }

    #[inline]
    fn put_varint(&mut self, mut v: u64) {
        while v >= 0x80 {
            self.put_u8((v as u8) | 0x80);
            v >>= 7;
        }
        self.put_u8(v as u8);
    }

    #[inline]
    fn put_slice(&mut self, s: &[u8]) {
        for b in s {
            self.put_u8(*b);
        }
    }

    #[inline]
    fn finish(self) -> EventRecord {
        EventRecord {
            len: self.pos as u8,
            bytes: self.bytes,
        }
    }
}

/// Encode one event
pub fn encode(event: &Event) -> EventRecord {
    let mut w = RecordWriter::new(event.kind(), event.timestamp_ns());

    match *event {
        Event::ZoneBegin { location, depth, .. } => {
            w.put_varint(location.0 as u64);
            w.put_varint(depth as u64);
        }
        Event::ZoneEnd { depth, .. } => {
            w.put_varint(depth as u64);
        }
        Event::FrameMark { frame, .. } => {
            w.put_varint(frame);
        }
        Event::Counter { name, value, .. } => {
            w.put_varint(name.0 as u64);
            w.put_slice(&value.to_le_bytes());
        }
        Event::Alloc { address, size, .. } => {
            w.put_varint(address);
            w.put_varint(size);
        }
        Event::Free { address, .. } => {
            w.put_varint(address);
        }
        Event::ThreadName { name, .. } => {
            w.put_varint(name.0 as u64);
        }
        Event::GpuNewContext {
            context,
            gpu_time,
            period,
            ..
        } => {
            w.put_u8(context);
            w.put_varint(gpu_time);
            w.put_slice(&period.to_le_bytes());
        }
        Event::GpuZoneBegin {
            context,
            query_id,
            location,
            ..
        } => {
            w.put_u8(context);
            w.put_varint(query_id as u64);
            w.put_varint(location.0 as u64);
        }
        Event::GpuZoneEnd {
            context, query_id, ..
        } => {
            w.put_u8(context);
            w.put_varint(query_id as u64);
        }
        Event::GpuTime {
            context,
            query_id,
            gpu_time,
            ..
        } => {
            w.put_u8(context);
            w.put_varint(query_id as u64);
            w.put_varint(gpu_time);
        }
        Event::GpuTimeSync {
            context, gpu_time, ..
        } => {
            w.put_u8(context);
            w.put_varint(gpu_time);
        }
    }

    w.finish()
}

/// Append a LEB128 varint to `out`
pub fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

/// Read a LEB128 varint at `*pos`, advancing it
pub fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64, DecodeError> {
    let start = *pos;
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos).ok_or(DecodeError::Truncated(*pos))?;
        *pos += 1;
        if shift == 63 && byte > 1 {
            return Err(DecodeError::VarintOverflow(start));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(DecodeError::VarintOverflow(start));
        }
    }
}

struct RecordReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or(DecodeError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn varint(&mut self) -> Result<u64, DecodeError> {
        read_varint(self.bytes, &mut self.pos)
    }

    fn varint_u32(&mut self) -> Result<u32, DecodeError> {
        let at = self.pos;
        u32::try_from(self.varint()?).map_err(|_| DecodeError::VarintOverflow(at))
    }

    fn varint_u16(&mut self) -> Result<u16, DecodeError> {
        let at = self.pos;
        u16::try_from(self.varint()?).map_err(|_| DecodeError::VarintOverflow(at))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.pos + N;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(DecodeError::Truncated(self.bytes.len()))?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }
}

/// Decode the record at the start of `bytes`
///
/// Returns the event and the number of bytes consumed.
pub fn decode(bytes: &[u8]) -> Result<(Event, usize), DecodeError> {
    let mut r = RecordReader { bytes, pos: 0 };
    let tag = r.u8()?;
    let kind = EventKind::from_tag(tag).ok_or(DecodeError::UnknownEventKind(tag))?;
    let timestamp_ns = r.varint()?;

    let event = match kind {
        EventKind::ZoneBegin => Event::ZoneBegin {
            timestamp_ns,
            location: LocationId(r.varint_u32()?),
            depth: r.varint_u32()?,
        },
        EventKind::ZoneEnd => Event::ZoneEnd {
            timestamp_ns,
            depth: r.varint_u32()?,
        },
        EventKind::FrameMark => Event::FrameMark {
            timestamp_ns,
            frame: r.varint()?,
        },
        EventKind::Counter => Event::Counter {
            timestamp_ns,
            name: StringId(r.varint_u32()?),
            value: f64::from_le_bytes(r.array()?),
        },
        EventKind::Alloc => Event::Alloc {
            timestamp_ns,
            address: r.varint()?,
            size: r.varint()?,
        },
        EventKind::Free => Event::Free {
            timestamp_ns,
            address: r.varint()?,
        },
        EventKind::ThreadName => Event::ThreadName {
            timestamp_ns,
            name: StringId(r.varint_u32()?),
        },
        EventKind::GpuNewContext => Event::GpuNewContext {
            timestamp_ns,
            context: r.u8()?,
            gpu_time: r.varint()?,
            period: f32::from_le_bytes(r.array()?),
        },
        EventKind::GpuZoneBegin => Event::GpuZoneBegin {
            timestamp_ns,
            context: r.u8()?,
            query_id: r.varint_u16()?,
            location: LocationId(r.varint_u32()?),
        },
        EventKind::GpuZoneEnd => Event::GpuZoneEnd {
            timestamp_ns,
            context: r.u8()?,
            query_id: r.varint_u16()?,
        },
        EventKind::GpuTime => Event::GpuTime {
            timestamp_ns,
            context: r.u8()?,
            query_id: r.varint_u16()?,
            gpu_time: r.varint()?,
        },
        EventKind::GpuTimeSync => Event::GpuTimeSync {
            timestamp_ns,
            context: r.u8()?,
            gpu_time: r.varint()?,
        },
    };

    Ok((event, r.pos))
}

/// Decode a record produced by [`encode`]
pub fn decode_record(record: &EventRecord) -> Result<Event, DecodeError> {
    decode(record.as_bytes()).map(|(event, _)| event)
}
