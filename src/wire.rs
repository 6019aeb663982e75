//! Event stream framing
//!
//! ```text
//! stream   := preamble frame*
//! preamble := "MGTR" version:u16le
//! frame    := tag:u8 len:u32le payload[len]
//!
//! tag 1  Handshake   MessagePack Handshake
//! tag 2  Strings     MessagePack Vec<StringDef>
//! tag 3  Locations   MessagePack Vec<LocationDef>
//! tag 4  Events      thread_id:varint count:varint record*
//! tag 5  Goodbye     MessagePack SessionSummary
//! ```
//!
//! Every frame is length-prefixed, so a reader can skip what it does not
//! understand. Definitions precede the first Events frame that references
//! them. A writer that reconnects starts over with a new preamble; readers
//! accept a preamble at any frame boundary.

use crate::encoder::{decode, read_varint, write_varint};
use crate::error::DecodeError;
use crate::event::{Event, EventRecord, MAX_RECORD_LEN};
use crate::identity::Identity;
use crate::strings::{LocationDef, StringDef};
use serde::{Deserialize, Serialize};
use std::io::{self, Read};

pub const MAGIC: [u8; 4] = *b"MGTR";
pub const PROTOCOL_VERSION: u16 = 1;
/// Frames larger than this are rejected by the decoder
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Records per Events frame that always fit in `MAX_FRAME_LEN`
///
/// Leaves room for the two varint headers and the dropped counter the writer
/// may append to a batch.
pub const MAX_EVENTS_PER_FRAME: usize = (MAX_FRAME_LEN as usize - 2 * 10) / MAX_RECORD_LEN - 1;

const PREAMBLE_LEN: usize = MAGIC.len() + 2;
const FRAME_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    Handshake = 1,
    Strings = 2,
    Locations = 3,
    Events = 4,
    Goodbye = 5,
}

impl FrameTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FrameTag::Handshake),
            2 => Some(FrameTag::Strings),
            3 => Some(FrameTag::Locations),
            4 => Some(FrameTag::Events),
            5 => Some(FrameTag::Goodbye),
            _ => None,
        }
    }
}

/// First frame of every connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol_version: u16,
    pub identity: Identity,
    pub session_id: u64,
    pub process_id: u32,
    pub session_start_unix_ns: u64,
    /// Artifact triple of the writer, e.g. `x86_64-linux-gnu`
    pub target: String,
}

/// Last frame of a session that shut down cleanly
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: u64,
    pub records_written: u64,
    /// Records producers dropped because their ring was full
    pub dropped_queue_full: u64,
    /// Records discarded while no sink was connected
    pub dropped_transport: u64,
    /// Records still queued when the shutdown grace period ran out
    pub dropped_at_shutdown: u64,
}

pub fn write_preamble(out: &mut Vec<u8>) {
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
}

pub fn write_frame(out: &mut Vec<u8>, tag: FrameTag, payload: &[u8]) {
    out.push(tag as u8);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Append a MessagePack-encoded frame
pub fn write_message<T: Serialize>(
    out: &mut Vec<u8>,
    tag: FrameTag,
    value: &T,
) -> Result<(), rmp_serde::encode::Error> {
    let payload = rmp_serde::to_vec_named(value)?;
    write_frame(out, tag, &payload);
    Ok(())
}

/// Append an Events frame carrying `records` produced by one thread
pub fn write_events_frame(out: &mut Vec<u8>, thread_id: u32, records: &[EventRecord]) {
    out.push(FrameTag::Events as u8);
    let len_at = out.len();
    out.extend_from_slice(&[0u8; 4]);
    let start = out.len();

    write_varint(out, thread_id as u64);
    write_varint(out, records.len() as u64);
    for record in records {
        out.extend_from_slice(record.as_bytes());
    }

    let len = (out.len() - start) as u32;
    out[len_at..start].copy_from_slice(&len.to_le_bytes());
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Handshake(Handshake),
    Strings(Vec<StringDef>),
    Locations(Vec<LocationDef>),
    Events { thread_id: u32, events: Vec<Event> },
    Goodbye(SessionSummary),
}

/// Decode the payload of an Events frame
pub fn decode_events(payload: &[u8]) -> Result<(u32, Vec<Event>), DecodeError> {
    let mut pos = 0;
    let thread_id = read_varint(payload, &mut pos)?;
    let thread_id = u32::try_from(thread_id).map_err(|_| DecodeError::VarintOverflow(0))?;
    let declared = read_varint(payload, &mut pos)?;

    let mut events = Vec::with_capacity(declared.min(4096) as usize);
    while pos < payload.len() {
        let (event, used) = decode(&payload[pos..])?;
        events.push(event);
        pos += used;
    }

    if events.len() as u64 != declared {
        return Err(DecodeError::RecordCountMismatch {
            declared,
            found: events.len() as u64,
        });
    }
    Ok((thread_id, events))
}

/// Pull-based decoder over any byte source
pub struct StreamDecoder<R> {
    reader: R,
    started: bool,
    payload: Vec<u8>,
}

impl<R: Read> StreamDecoder<R> {
    pub fn new(reader: R) -> Self {
        StreamDecoder {
            reader,
            started: false,
            payload: Vec::new(),
        }
    }

    /// Next frame, or `None` at a clean end of stream
    pub fn next_message(&mut self) -> Result<Option<WireMessage>, DecodeError> {
        loop {
            if !self.started {
                let mut preamble = [0u8; PREAMBLE_LEN];
                if !read_exact_or_eof(&mut self.reader, &mut preamble)? {
                    return Ok(None);
                }
                check_preamble(&preamble)?;
                self.started = true;
            }

            let mut header = [0u8; FRAME_HEADER_LEN];
            if !read_exact_or_eof(&mut self.reader, &mut header[..1])? {
                return Ok(None);
            }

            // A writer that reconnected restarts with a fresh preamble
            if header[0] == MAGIC[0] {
                let mut preamble = [0u8; PREAMBLE_LEN];
                preamble[0] = header[0];
                self.reader.read_exact(&mut preamble[1..])?;
                check_preamble(&preamble)?;
                continue;
            }

            self.reader.read_exact(&mut header[1..])?;
            let tag = FrameTag::from_u8(header[0]).ok_or(DecodeError::UnknownFrame(header[0]))?;
            let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
            if len > MAX_FRAME_LEN {
                return Err(DecodeError::FrameTooLarge(len));
            }

            self.payload.resize(len as usize, 0);
            self.reader.read_exact(&mut self.payload)?;
            return self.parse(tag).map(Some);
        }
    }

    fn parse(&self, tag: FrameTag) -> Result<WireMessage, DecodeError> {
        let payload = &self.payload[..];
        Ok(match tag {
            FrameTag::Handshake => WireMessage::Handshake(rmp_serde::from_slice(payload)?),
            FrameTag::Strings => WireMessage::Strings(rmp_serde::from_slice(payload)?),
            FrameTag::Locations => WireMessage::Locations(rmp_serde::from_slice(payload)?),
            FrameTag::Events => {
                let (thread_id, events) = decode_events(payload)?;
                WireMessage::Events { thread_id, events }
            }
            FrameTag::Goodbye => WireMessage::Goodbye(rmp_serde::from_slice(payload)?),
        })
    }
}

impl<R: Read> Iterator for StreamDecoder<R> {
    type Item = Result<WireMessage, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_message().transpose()
    }
}

fn check_preamble(preamble: &[u8; PREAMBLE_LEN]) -> Result<(), DecodeError> {
    if preamble[..MAGIC.len()] != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let found = u16::from_le_bytes([preamble[4], preamble[5]]);
    if found != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion {
            expected: PROTOCOL_VERSION,
            found,
        });
    }
    Ok(())
}

/// Fill `buf`; `Ok(false)` if the reader was already at end of stream
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, DecodeError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(DecodeError::Truncated(filled)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::encode;
    use crate::strings::{LocationId, StringId};

    fn handshake() -> Handshake {
        Handshake {
            protocol_version: PROTOCOL_VERSION,
            identity: Identity::new("megatrace", "MEGATrace", "0.1.0", "mega.trace"),
            session_id: 3,
            process_id: 42,
            session_start_unix_ns: 1_700_000_000_000_000_000,
            target: "x86_64-linux-gnu".to_string(),
        }
    }

    fn sample_stream() -> Vec<u8> {
        let mut out = Vec::new();
        write_preamble(&mut out);
        write_message(&mut out, FrameTag::Handshake, &handshake()).unwrap();
        write_message(
            &mut out,
            FrameTag::Strings,
            &vec![StringDef {
                id: StringId(0),
                text: "tick".to_string(),
            }],
        )
        .unwrap();
        let records = [
            encode(&Event::ZoneBegin {
                timestamp_ns: 10,
                location: LocationId(0),
                depth: 1,
            }),
            encode(&Event::ZoneEnd {
                timestamp_ns: 20,
                depth: 1,
            }),
        ];
        write_events_frame(&mut out, 7, &records);
        write_message(&mut out, FrameTag::Goodbye, &SessionSummary::default()).unwrap();
        out
    }

    #[test]
    fn test_decode_full_stream() {
        let bytes = sample_stream();
        let messages: Vec<_> = StreamDecoder::new(&bytes[..])
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], WireMessage::Handshake(handshake()));
        match &messages[2] {
            WireMessage::Events { thread_id, events } => {
                assert_eq!(*thread_id, 7);
                assert_eq!(events.len(), 2);
                assert_eq!(events[1], Event::ZoneEnd { timestamp_ns: 20, depth: 1 });
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(messages[3], WireMessage::Goodbye(_)));
    }

    #[test]
    fn test_fullest_events_frame_fits() {
        let mut header = Vec::new();
        write_varint(&mut header, u32::MAX as u64);
        write_varint(&mut header, (MAX_EVENTS_PER_FRAME + 1) as u64);
        let worst = header.len() + (MAX_EVENTS_PER_FRAME + 1) * MAX_RECORD_LEN;
        assert!(worst <= MAX_FRAME_LEN as usize);
    }

    #[test]
    fn test_empty_stream_is_clean_eof() {
        let mut decoder = StreamDecoder::new(&[][..]);
        assert!(decoder.next_message().unwrap().is_none());
    }

    #[test]
    fn test_bad_magic() {
        let mut decoder = StreamDecoder::new(&b"NOPE\x01\x00"[..]);
        assert!(matches!(decoder.next_message(), Err(DecodeError::BadMagic)));
    }

    #[test]
    fn test_version_mismatch() {
        let mut decoder = StreamDecoder::new(&b"MGTR\x09\x00"[..]);
        assert!(matches!(
            decoder.next_message(),
            Err(DecodeError::UnsupportedVersion { expected: 1, found: 9 })
        ));
    }

    #[test]
    fn test_restarted_preamble_is_skipped() {
        let mut bytes = sample_stream();
        bytes.extend_from_slice(&sample_stream());
        let count = StreamDecoder::new(&bytes[..]).filter(|m| m.is_ok()).count();
        assert_eq!(count, 8);
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let bytes = sample_stream();
        let cut = &bytes[..bytes.len() - 3];
        let result: Result<Vec<_>, _> = StreamDecoder::new(cut).collect();
        assert!(result.is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut bytes = Vec::new();
        write_preamble(&mut bytes);
        bytes.push(FrameTag::Strings as u8);
        bytes.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
        let mut decoder = StreamDecoder::new(&bytes[..]);
        assert!(matches!(decoder.next_message(), Err(DecodeError::FrameTooLarge(_))));
    }

    #[test]
    fn test_record_count_mismatch() {
        let mut payload = Vec::new();
        write_varint(&mut payload, 1);
        write_varint(&mut payload, 3);
        payload.extend_from_slice(
            encode(&Event::FrameMark {
                timestamp_ns: 1,
                frame: 1,
            })
            .as_bytes(),
        );
        assert!(matches!(
            decode_events(&payload),
            Err(DecodeError::RecordCountMismatch { declared: 3, found: 1 })
        ));
    }

    #[test]
    fn test_unknown_frame_tag() {
        let mut bytes = Vec::new();
        write_preamble(&mut bytes);
        write_frame(&mut bytes, FrameTag::Strings, &[]);
        bytes[PREAMBLE_LEN] = 0x7f;
        let mut decoder = StreamDecoder::new(&bytes[..]);
        assert!(matches!(decoder.next_message(), Err(DecodeError::UnknownFrame(0x7f))));
    }
}
