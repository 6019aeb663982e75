//! Serializer/transport worker
//!
//! The one background thread a session owns, and the only thread that does
//! blocking I/O. Each pass:
//!
//! 1. re-snapshots the ring registry if threads attached or left
//! 2. drains up to `batch_size` records from every ring, round-robin
//! 3. writes new string/location definitions, then one Events frame per ring
//!
//! Allocation tracking looks at every ring's allocs and frees of a pass
//! together, in timestamp order, since an address is often freed on a
//! different thread than the one that allocated it. A free with no matching
//! alloc is held for one more pass before it is reported, in case the alloc
//! is still waiting behind a full batch on its own ring.
//!
//! # Link states
//!
//! ```text
//!            connect ok                       write/flush error
//! Disconnected ─────────► Connected ─────────────────────────► Disconnected
//!      ▲  │                 (preamble, handshake,                (frames buffered up
//!      │  │ connect error    all definitions re-sent)             to a byte cap)
//!      └──┘ backoff doubles up to reconnect_max
//! ```
//!
//! No viewer attached is the normal production case: rings keep draining,
//! frames past the buffer cap are counted and discarded, and connect attempts
//! stay on the backoff timer.

use crate::encoder::{decode_record, encode};
use crate::platform;
use crate::error::UsageError;
use crate::event::{Event, EventKind, EventRecord};
use crate::queue::ThreadQueue;
use crate::session::SessionInner;
use crate::sink::Sink;
use crate::strings::StringId;
use crate::wire::{self, FrameTag, Handshake, SessionSummary, PROTOCOL_VERSION};
use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use fnv::{FnvHashMap, FnvHashSet};
use serde::Serialize;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Name of the counter carrying per-thread dropped-record totals
pub const DROPPED_COUNTER_NAME: &str = "megatrace.dropped_events";

static LIVE_WORKERS: AtomicUsize = AtomicUsize::new(0);

/// Worker threads currently running in this process
pub fn live_workers() -> usize {
    LIVE_WORKERS.load(Ordering::SeqCst)
}

/// Counts a worker as live from creation until drop, panics included
pub(crate) struct LiveWorker(());

impl LiveWorker {
    pub(crate) fn register() -> Self {
        LIVE_WORKERS.fetch_add(1, Ordering::SeqCst);
        LiveWorker(())
    }
}

impl Drop for LiveWorker {
    fn drop(&mut self) {
        LIVE_WORKERS.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerCommand {
    Shutdown,
}

/// Outcome of a session, returned by shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub session_id: u64,
    pub records_written: u64,
    pub dropped_queue_full: u64,
    pub dropped_transport: u64,
    pub dropped_at_shutdown: u64,
    /// Successful connects after the first one
    pub reconnects: u64,
    /// The grace period ran out with records still queued
    pub grace_expired: bool,
}

impl ShutdownReport {
    pub fn total_dropped(&self) -> u64 {
        self.dropped_queue_full + self.dropped_transport + self.dropped_at_shutdown
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            records_written: self.records_written,
            dropped_queue_full: self.dropped_queue_full,
            dropped_transport: self.dropped_transport,
            dropped_at_shutdown: self.dropped_at_shutdown,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Link {
    Connected,
    Disconnected { retry_at: Instant, backoff: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryOpKind {
    Alloc,
    /// `held` once it already went unmatched for a pass
    Free { held: bool },
}

#[derive(Debug, Clone, Copy)]
struct MemoryOp {
    timestamp_ns: u64,
    thread_id: u32,
    address: u64,
    kind: MemoryOpKind,
}

/// An encoded frame and the number of producer records in it
struct Frame {
    bytes: Vec<u8>,
    records: u64,
}

pub(crate) struct Worker {
    session: Arc<SessionInner>,
    sink: Box<dyn Sink>,
    control: Receiver<WorkerCommand>,
    link: Link,
    ever_connected: bool,

    queues: Vec<Arc<ThreadQueue>>,
    registry_version: u64,
    cursor: usize,
    batch: Vec<EventRecord>,
    outgoing: Vec<Frame>,

    string_mark: usize,
    location_mark: usize,

    pending: VecDeque<Frame>,
    pending_bytes: usize,

    dropped_counter: StringId,
    dropped_reported: FnvHashMap<u32, u64>,
    next_dropped_report: Instant,

    live_allocs: FnvHashSet<u64>,
    alloc_tracking_saturated: bool,
    memory_ops: Vec<MemoryOp>,
    held_frees: Vec<MemoryOp>,

    report: ShutdownReport,
}

impl Worker {
    pub(crate) fn new(
        session: Arc<SessionInner>,
        sink: Box<dyn Sink>,
        control: Receiver<WorkerCommand>,
    ) -> Self {
        let now = Instant::now();
        let dropped_counter = session.strings.intern(DROPPED_COUNTER_NAME);
        let batch_size = session.config.batch_size;
        let report = ShutdownReport {
            session_id: session.id,
            ..ShutdownReport::default()
        };
        Worker {
            link: Link::Disconnected {
                retry_at: now,
                backoff: session.config.reconnect_initial(),
            },
            ever_connected: false,
            queues: Vec::new(),
            registry_version: 0,
            cursor: 0,
            batch: Vec::with_capacity(batch_size + 1),
            outgoing: Vec::new(),
            string_mark: 0,
            location_mark: 0,
            pending: VecDeque::new(),
            pending_bytes: 0,
            dropped_counter,
            dropped_reported: FnvHashMap::default(),
            next_dropped_report: now,
            live_allocs: FnvHashSet::default(),
            alloc_tracking_saturated: false,
            memory_ops: Vec::new(),
            held_frees: Vec::new(),
            report,
            session,
            sink,
            control,
        }
    }

    pub(crate) fn run(mut self) -> ShutdownReport {
        tracing::info!(
            session = self.session.id,
            sink = %self.sink.describe(),
            "serializer started"
        );
        let poll = self.session.config.poll_interval();

        loop {
            let moved = self.pass();
            let command = if moved == 0 {
                match self.control.recv_timeout(poll) {
                    Ok(cmd) => Some(cmd),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => Some(WorkerCommand::Shutdown),
                }
            } else {
                match self.control.try_recv() {
                    Ok(cmd) => Some(cmd),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => Some(WorkerCommand::Shutdown),
                }
            };
            if command == Some(WorkerCommand::Shutdown) {
                break;
            }
        }

        self.finish()
    }

    /// One drain-and-write cycle; returns the records taken from rings
    fn pass(&mut self) -> usize {
        if self
            .session
            .registry
            .snapshot_if_changed(&mut self.registry_version, &mut self.queues)
            && self.cursor >= self.queues.len()
        {
            self.cursor = 0;
        }

        let now = Instant::now();
        if let Link::Disconnected { retry_at, .. } = self.link {
            if now >= retry_at {
                self.try_connect(now);
            }
        }

        let report_dropped = now >= self.next_dropped_report;
        let n = self.queues.len();
        let batch_size = self.session.config.batch_size;
        let mut moved = 0;

        for i in 0..n {
            let queue = Arc::clone(&self.queues[(self.cursor + i) % n]);
            let thread_id = queue.thread_id();
            self.batch.clear();
            let taken = queue.drain_into(&mut self.batch, batch_size);
            moved += taken;
            self.track_memory(thread_id, taken);

            if report_dropped {
                self.push_dropped_counter(thread_id, queue.dropped());
            }
            if self.batch.is_empty() {
                continue;
            }

            let mut bytes = Vec::with_capacity(16 + self.batch.len() * 8);
            wire::write_events_frame(&mut bytes, thread_id, &self.batch);
            self.outgoing.push(Frame {
                bytes,
                records: taken as u64,
            });
        }
        if n > 0 {
            self.cursor = (self.cursor + 1) % n;
        }
        if report_dropped {
            self.next_dropped_report = now + self.session.config.dropped_report_interval();
        }
        self.settle_memory(false);

        if moved == 0 {
            for queue in self.session.registry.prune_closed() {
                self.retire(&queue);
            }
        }
        if !self.outgoing.is_empty() {
            let frames = std::mem::take(&mut self.outgoing);
            self.deliver(frames);
        }
        moved
    }

    /// Collect the allocs and frees of the records just drained
    fn track_memory(&mut self, thread_id: u32, taken: usize) {
        let start = self.batch.len() - taken;
        for record in &self.batch[start..] {
            match record.kind() {
                Some(EventKind::Alloc) | Some(EventKind::Free) => {}
                _ => continue,
            }
            let op = match decode_record(record) {
                Ok(Event::Alloc {
                    timestamp_ns,
                    address,
                    ..
                }) => MemoryOp {
                    timestamp_ns,
                    thread_id,
                    address,
                    kind: MemoryOpKind::Alloc,
                },
                Ok(Event::Free {
                    timestamp_ns,
                    address,
                }) => MemoryOp {
                    timestamp_ns,
                    thread_id,
                    address,
                    kind: MemoryOpKind::Free { held: false },
                },
                _ => continue,
            };
            self.memory_ops.push(op);
        }
    }

    /// Match this pass's allocs and frees, plus frees held from the last one
    ///
    /// With `final_pass` nothing is held over: every unmatched free is reported.
    fn settle_memory(&mut self, final_pass: bool) {
        let mut ops = std::mem::take(&mut self.memory_ops);
        ops.append(&mut self.held_frees);
        // Stable, so records of one thread keep their ring order on ties
        ops.sort_by_key(|op| op.timestamp_ns);

        for op in ops.drain(..) {
            match op.kind {
                MemoryOpKind::Alloc => {
                    if self.live_allocs.len() < self.session.config.alloc_tracking_capacity {
                        self.live_allocs.insert(op.address);
                    } else if !self.alloc_tracking_saturated {
                        self.alloc_tracking_saturated = true;
                        tracing::warn!(
                            capacity = self.session.config.alloc_tracking_capacity,
                            "allocation tracking is full; unmatched frees are no longer reported"
                        );
                    }
                }
                MemoryOpKind::Free { held } => {
                    if self.live_allocs.remove(&op.address) || self.alloc_tracking_saturated {
                        continue;
                    }
                    if held || final_pass {
                        self.session.diagnostics.report(
                            UsageError::UnmatchedFree {
                                address: op.address,
                            },
                            op.thread_id,
                            op.timestamp_ns,
                        );
                    } else {
                        self.held_frees.push(MemoryOp {
                            kind: MemoryOpKind::Free { held: true },
                            ..op
                        });
                    }
                }
            }
        }
        self.memory_ops = ops;
    }

    /// Queue the final dropped counter of a ring whose thread is gone
    fn retire(&mut self, queue: &ThreadQueue) {
        let thread_id = queue.thread_id();
        self.batch.clear();
        self.push_dropped_counter(thread_id, queue.dropped());
        self.dropped_reported.remove(&thread_id);
        if self.batch.is_empty() {
            return;
        }
        let mut bytes = Vec::with_capacity(16 + self.batch.len() * 8);
        wire::write_events_frame(&mut bytes, thread_id, &self.batch);
        self.outgoing.push(Frame { bytes, records: 0 });
    }

    fn push_dropped_counter(&mut self, thread_id: u32, dropped: u64) {
        let reported = self.dropped_reported.entry(thread_id).or_insert(0);
        if dropped <= *reported {
            return;
        }
        if *reported == 0 {
            tracing::warn!(
                thread = thread_id,
                dropped,
                "event ring full, dropping newest records"
            );
        } else {
            tracing::debug!(thread = thread_id, dropped, "event ring still dropping");
        }
        *reported = dropped;

        self.batch.push(encode(&Event::Counter {
            timestamp_ns: self.session.clock.now_ns(),
            name: self.dropped_counter,
            value: dropped as f64,
        }));
    }

    fn deliver(&mut self, frames: Vec<Frame>) {
        if matches!(self.link, Link::Connected) {
            if let Err(e) = self.send_definitions() {
                self.disconnect(e);
            }
        }

        for frame in frames {
            if !matches!(self.link, Link::Connected) {
                self.buffer(frame);
                continue;
            }
            match self.sink.write_all(&frame.bytes) {
                Ok(()) => self.report.records_written += frame.records,
                Err(e) => {
                    self.disconnect(e);
                    self.buffer(frame);
                }
            }
        }

        if matches!(self.link, Link::Connected) {
            if let Err(e) = self.sink.flush() {
                self.disconnect(e);
            }
        }
    }

    /// Write every definition past the watermarks
    fn send_definitions(&mut self) -> io::Result<()> {
        let mut strings = Vec::new();
        let string_mark = self.session.strings.definitions_since(self.string_mark, &mut strings);
        let mut locations = Vec::new();
        let location_mark = self
            .session
            .locations
            .definitions_since(self.location_mark, &mut locations);

        let mut out = Vec::new();
        if !strings.is_empty() {
            wire::write_message(&mut out, FrameTag::Strings, &strings).map_err(encode_error)?;
        }
        if !locations.is_empty() {
            wire::write_message(&mut out, FrameTag::Locations, &locations).map_err(encode_error)?;
        }
        if !out.is_empty() {
            self.sink.write_all(&out)?;
        }

        self.string_mark = string_mark;
        self.location_mark = location_mark;
        Ok(())
    }

    fn buffer(&mut self, frame: Frame) {
        let cap = self.session.config.disconnected_buffer_bytes;
        if self.pending_bytes + frame.bytes.len() > cap {
            self.report.dropped_transport += frame.records;
            return;
        }
        self.pending_bytes += frame.bytes.len();
        self.pending.push_back(frame);
    }

    fn try_connect(&mut self, now: Instant) {
        match self.open_stream() {
            Ok(()) => {
                if self.ever_connected {
                    self.report.reconnects += 1;
                }
                self.ever_connected = true;
                self.link = Link::Connected;
                tracing::info!(sink = %self.sink.describe(), "sink connected");
                self.flush_pending();
            }
            Err(e) => {
                let backoff = match self.link {
                    Link::Disconnected { backoff, .. } => backoff,
                    Link::Connected => self.session.config.reconnect_initial(),
                };
                tracing::debug!(
                    sink = %self.sink.describe(),
                    retry_in_ms = backoff.as_millis() as u64,
                    "sink connect failed: {}",
                    e
                );
                self.sink.close();
                let next = (backoff * 2).min(self.session.config.reconnect_max());
                self.link = Link::Disconnected {
                    retry_at: now + backoff,
                    backoff: next,
                };
            }
        }
    }

    /// Connect and send the preamble, handshake and every definition so far
    fn open_stream(&mut self) -> io::Result<()> {
        self.sink.connect()?;

        let handshake = Handshake {
            protocol_version: PROTOCOL_VERSION,
            identity: self.session.identity.clone(),
            session_id: self.session.id,
            process_id: std::process::id(),
            session_start_unix_ns: self.session.clock.origin_unix_ns(),
            target: platform::target_name(),
        };
        let mut out = Vec::new();
        wire::write_preamble(&mut out);
        wire::write_message(&mut out, FrameTag::Handshake, &handshake).map_err(encode_error)?;
        self.sink.write_all(&out)?;

        self.string_mark = 0;
        self.location_mark = 0;
        self.send_definitions()?;
        self.sink.flush()
    }

    fn flush_pending(&mut self) {
        while let Some(frame) = self.pending.pop_front() {
            match self.sink.write_all(&frame.bytes) {
                Ok(()) => {
                    self.pending_bytes -= frame.bytes.len();
                    self.report.records_written += frame.records;
                }
                Err(e) => {
                    self.pending.push_front(frame);
                    self.disconnect(e);
                    return;
                }
            }
        }
        if let Err(e) = self.sink.flush() {
            self.disconnect(e);
        }
    }

    fn disconnect(&mut self, err: io::Error) {
        if matches!(self.link, Link::Connected) {
            tracing::warn!(sink = %self.sink.describe(), "sink disconnected: {}", err);
        }
        self.sink.close();
        let initial = self.session.config.reconnect_initial();
        self.link = Link::Disconnected {
            retry_at: Instant::now() + initial,
            backoff: (initial * 2).min(self.session.config.reconnect_max()),
        };
    }

    /// Drain within the grace period, say goodbye and close the sink
    fn finish(mut self) -> ShutdownReport {
        let grace = self.session.config.shutdown_grace();
        let deadline = Instant::now() + grace;
        let poll = self.session.config.poll_interval();

        loop {
            let moved = self.pass();
            let rings_empty = self.session.registry.pending() == 0;

            if rings_empty && !matches!(self.link, Link::Connected) && !self.pending.is_empty() {
                // Last chance for buffered frames, regardless of backoff
                self.try_connect(Instant::now());
            }
            if rings_empty && (self.pending.is_empty() || !matches!(self.link, Link::Connected)) {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                self.report.grace_expired = true;
                break;
            }
            if moved == 0 {
                std::thread::sleep(poll.min(deadline - now));
            }
        }

        self.settle_memory(true);
        let mut leftover = self.discard_rings();
        leftover += self.pending.iter().map(|f| f.records).sum::<u64>();
        self.pending.clear();
        self.pending_bytes = 0;
        self.report.dropped_at_shutdown = leftover;
        self.report.dropped_queue_full = self.session.registry.stats().total_dropped;

        // Rings are freed here even if idle producer threads never call in again
        self.queues.clear();
        for queue in self.session.registry.release() {
            self.retire(&queue);
        }
        let frames = std::mem::take(&mut self.outgoing);
        if matches!(self.link, Link::Connected) && !frames.is_empty() {
            self.deliver(frames);
        }

        if leftover > 0 {
            tracing::warn!(
                session = self.session.id,
                dropped = leftover,
                grace_ms = grace.as_millis() as u64,
                "records dropped at shutdown"
            );
        }

        if matches!(self.link, Link::Connected) {
            let mut out = Vec::new();
            let goodbye = wire::write_message(&mut out, FrameTag::Goodbye, &self.report.summary());
            let written = goodbye
                .map_err(encode_error)
                .and_then(|()| self.sink.write_all(&out))
                .and_then(|()| self.sink.flush());
            if let Err(e) = written {
                tracing::debug!("failed to write goodbye frame: {}", e);
            }
        }
        self.sink.close();

        tracing::info!(
            session = self.session.id,
            written = self.report.records_written,
            dropped = self.report.total_dropped(),
            "serializer stopped"
        );
        self.report
    }

    fn discard_rings(&mut self) -> u64 {
        self.session
            .registry
            .snapshot_if_changed(&mut self.registry_version, &mut self.queues);
        let mut discarded = 0;
        for queue in &self.queues {
            while queue.pop().is_some() {
                discarded += 1;
            }
        }
        discarded
    }
}

fn encode_error(e: rmp_serde::encode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, SinkConfig};
    use crate::identity::Identity;
    use crate::sink::SharedBufferSink;
    use crate::wire::{StreamDecoder, WireMessage};
    use crossbeam::channel;

    fn session(config: BridgeConfig) -> Arc<SessionInner> {
        Arc::new(SessionInner::new(config, Identity::default()))
    }

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig::default().with_sink(SinkConfig::Null);
        config.reconnect_initial_ms = 1;
        config.reconnect_max_ms = 4;
        config.shutdown_grace_ms = 200;
        config
    }

    fn messages(bytes: &[u8]) -> Vec<WireMessage> {
        StreamDecoder::new(bytes).collect::<Result<_, _>>().unwrap()
    }

    fn finish(session: &Arc<SessionInner>, sink: SharedBufferSink) -> ShutdownReport {
        let (_tx, rx) = channel::unbounded();
        Worker::new(session.clone(), Box::new(sink), rx).finish()
    }

    #[test]
    fn test_definitions_precede_events() {
        let session = session(config());
        let name = session.strings.intern("tick");
        let queue = session.registry.register(1, 16);
        queue.push(encode(&Event::Counter {
            timestamp_ns: 5,
            name,
            value: 1.0,
        }));

        let sink = SharedBufferSink::new();
        let report = finish(&session, sink.clone());
        assert_eq!(report.records_written, 1);
        assert_eq!(report.dropped_at_shutdown, 0);

        let msgs = messages(&sink.contents());
        assert!(matches!(msgs[0], WireMessage::Handshake(_)));
        let strings_at = msgs
            .iter()
            .position(|m| matches!(m, WireMessage::Strings(_)))
            .unwrap();
        let events_at = msgs
            .iter()
            .position(|m| matches!(m, WireMessage::Events { .. }))
            .unwrap();
        assert!(strings_at < events_at);
        assert!(matches!(msgs.last(), Some(WireMessage::Goodbye(_))));
    }

    #[test]
    fn test_unmatched_free_is_reported() {
        let session = session(config());
        let queue = session.registry.register(1, 16);
        queue.push(encode(&Event::Alloc {
            timestamp_ns: 1,
            address: 0x10,
            size: 8,
        }));
        queue.push(encode(&Event::Free {
            timestamp_ns: 2,
            address: 0x10,
        }));
        queue.push(encode(&Event::Free {
            timestamp_ns: 3,
            address: 0x20,
        }));

        finish(&session, SharedBufferSink::new());
        let drained = session.diagnostics.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].error, UsageError::UnmatchedFree { address: 0x20 });
        assert_eq!(drained[0].thread_id, 1);
    }

    #[test]
    fn test_disconnected_frames_are_capped_and_counted() {
        let mut cfg = config();
        cfg.disconnected_buffer_bytes = 0;
        cfg.shutdown_grace_ms = 20;
        let session = session(cfg);
        let queue = session.registry.register(1, 16);
        for frame in 1..=3 {
            queue.push(encode(&Event::FrameMark {
                timestamp_ns: frame,
                frame,
            }));
        }

        let sink = SharedBufferSink::new();
        sink.set_fail_connect(true);
        let report = finish(&session, sink.clone());
        assert_eq!(report.records_written, 0);
        assert_eq!(report.dropped_transport, 3);
        assert!(sink.connections().is_empty());
    }

    #[test]
    fn test_dropped_counter_is_emitted() {
        let session = session(config());
        let queue = session.registry.register(1, 1);
        queue.push(encode(&Event::FrameMark {
            timestamp_ns: 1,
            frame: 1,
        }));
        queue.push(encode(&Event::FrameMark {
            timestamp_ns: 2,
            frame: 2,
        }));

        let sink = SharedBufferSink::new();
        let report = finish(&session, sink.clone());
        assert_eq!(report.dropped_queue_full, 1);

        let counter = session.strings.intern(DROPPED_COUNTER_NAME);
        let found = messages(&sink.contents()).into_iter().any(|m| match m {
            WireMessage::Events { events, .. } => events.iter().any(|e| {
                matches!(e, Event::Counter { name, value, .. } if *name == counter && *value == 1.0)
            }),
            _ => false,
        });
        assert!(found);
    }

    #[test]
    fn test_write_failure_buffers_then_resends_on_reconnect() {
        let session = session(config());
        let queue = session.registry.register(1, 16);
        let sink = SharedBufferSink::new();
        let (_tx, rx) = channel::unbounded();
        let mut worker = Worker::new(session.clone(), Box::new(sink.clone()), rx);

        queue.push(encode(&Event::FrameMark {
            timestamp_ns: 1,
            frame: 1,
        }));
        worker.pass();
        assert_eq!(sink.connections().len(), 1);

        sink.set_fail_writes(true);
        queue.push(encode(&Event::FrameMark {
            timestamp_ns: 2,
            frame: 2,
        }));
        worker.pass();
        assert_eq!(worker.pending.len(), 1);

        sink.set_fail_writes(false);
        std::thread::sleep(Duration::from_millis(5));
        let report = worker.finish();

        assert_eq!(report.reconnects, 1);
        assert_eq!(report.records_written, 2);
        let second = messages(&sink.connections()[1]);
        assert!(matches!(second[0], WireMessage::Handshake(_)));
        let frames: Vec<u64> = second
            .iter()
            .flat_map(|m| match m {
                WireMessage::Events { events, .. } => events.clone(),
                _ => Vec::new(),
            })
            .filter_map(|e| match e {
                Event::FrameMark { frame, .. } => Some(frame),
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec![2]);
    }

    #[test]
    fn test_cross_thread_free_matches_earlier_alloc_in_same_pass() {
        let session = session(config());
        // Drained first, though its free happened last
        let freeing = session.registry.register(2, 16);
        let allocating = session.registry.register(1, 16);
        allocating.push(encode(&Event::Alloc {
            timestamp_ns: 10,
            address: 0xABC0,
            size: 64,
        }));
        freeing.push(encode(&Event::Free {
            timestamp_ns: 20,
            address: 0xABC0,
        }));

        finish(&session, SharedBufferSink::new());
        assert!(session.diagnostics.drain().is_empty());
    }

    #[test]
    fn test_unmatched_free_waits_one_pass_for_its_alloc() {
        let mut cfg = config();
        cfg.batch_size = 1;
        let session = session(cfg);
        let freeing = session.registry.register(2, 16);
        let allocating = session.registry.register(1, 16);
        // The alloc sits behind a full batch on its ring
        allocating.push(encode(&Event::FrameMark {
            timestamp_ns: 5,
            frame: 1,
        }));
        allocating.push(encode(&Event::Alloc {
            timestamp_ns: 10,
            address: 0xABC0,
            size: 64,
        }));
        freeing.push(encode(&Event::Free {
            timestamp_ns: 20,
            address: 0xABC0,
        }));

        let (_tx, rx) = channel::unbounded();
        let mut worker = Worker::new(session.clone(), Box::new(SharedBufferSink::new()), rx);
        worker.pass();
        assert_eq!(worker.held_frees.len(), 1);
        worker.pass();
        assert!(worker.held_frees.is_empty());
        worker.finish();
        assert!(session.diagnostics.drain().is_empty());
    }

    #[test]
    fn test_exited_thread_dropped_counter_is_sent_before_pruning() {
        let mut cfg = config();
        cfg.dropped_report_interval_ms = 60_000;
        let session = session(cfg);
        let sink = SharedBufferSink::new();
        let (_tx, rx) = channel::unbounded();
        let mut worker = Worker::new(session.clone(), Box::new(sink.clone()), rx);
        // Spends the first periodic report while nothing is registered
        worker.pass();

        let queue = session.registry.register(7, 1);
        for frame in 1..=3 {
            queue.push(encode(&Event::FrameMark {
                timestamp_ns: frame,
                frame,
            }));
        }
        queue.close();
        drop(queue);

        assert_eq!(worker.pass(), 1);
        assert_eq!(worker.pass(), 0);
        assert!(session.registry.is_empty());
        assert!(worker.dropped_reported.is_empty());

        let counter = session.strings.intern(DROPPED_COUNTER_NAME);
        let found = messages(&sink.contents()).into_iter().any(|m| match m {
            WireMessage::Events { thread_id, events } => {
                thread_id == 7
                    && events.iter().any(|e| {
                        matches!(e, Event::Counter { name, value, .. } if *name == counter && *value == 2.0)
                    })
            }
            _ => false,
        });
        assert!(found);
    }

    #[test]
    fn test_finish_releases_rings() {
        let session = session(config());
        let queue = session.registry.register(1, 16);
        let ring = Arc::downgrade(&queue);
        drop(queue);

        finish(&session, SharedBufferSink::new());
        assert!(ring.upgrade().is_none());
        assert!(session.registry.is_released());
    }
}
