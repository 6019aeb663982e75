//! Tracing session lifecycle and producer operations
//!
//! A [`Session`] owns the worker thread and everything shared between
//! producers and the worker ([`SessionInner`]). Producers go through a cheap,
//! clonable [`SessionHandle`]; every operation on it returns in bounded time
//! and never does I/O.
//!
//! ```text
//! Session::start ─► SessionInner (Arc) ─┬─► SessionHandle (producers, any thread)
//!                                       └─► Worker (background thread) ─► Sink
//! ```
//!
//! Usage errors on a handle are reported to [`Diagnostics`] and never returned.

use crate::call_stack::ZoneHandle;
use crate::clock::{FrameCounter, SessionClock};
use crate::config::BridgeConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{BridgeError, Result};
use crate::event::Event;
use crate::identity::Identity;
use crate::queue::{QueueRegistry, QueueStats};
use crate::sink::Sink;
use crate::strings::{LocationId, LocationKey, LocationTable, SourceLocation, StringTable};
use crate::thread_state::{current_thread_id, with_state};
use crate::worker::{LiveWorker, ShutdownReport, Worker, WorkerCommand};
use crossbeam::channel::{self, Sender};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by producers and the worker
pub(crate) struct SessionInner {
    pub(crate) id: u64,
    pub(crate) config: BridgeConfig,
    pub(crate) identity: Identity,
    pub(crate) clock: SessionClock,
    pub(crate) strings: StringTable,
    pub(crate) locations: LocationTable,
    pub(crate) registry: QueueRegistry,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) frames: FrameCounter,
    accepting: AtomicBool,
}

impl SessionInner {
    pub(crate) fn new(config: BridgeConfig, identity: Identity) -> Self {
        SessionInner {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            diagnostics: Diagnostics::new(config.diagnostics_capacity),
            clock: SessionClock::start(),
            strings: StringTable::new(),
            locations: LocationTable::new(),
            registry: QueueRegistry::new(),
            frames: FrameCounter::new(),
            accepting: AtomicBool::new(true),
            config,
            identity,
        }
    }

    #[inline]
    fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }
}

/// A running session: the worker thread plus its shared state
pub struct Session {
    handle: SessionHandle,
    control: Sender<WorkerCommand>,
    worker: Option<JoinHandle<ShutdownReport>>,
}

impl Session {
    /// Validate `config` and spawn the worker writing to `sink`
    pub fn start(config: BridgeConfig, identity: Identity, sink: Box<dyn Sink>) -> Result<Session> {
        config.validate()?;

        let inner = Arc::new(SessionInner::new(config, identity));
        let (control, commands) = channel::bounded(1);
        let worker = Worker::new(inner.clone(), sink, commands);
        let live = LiveWorker::register();

        let join = thread::Builder::new()
            .name("megatrace-serializer".to_string())
            .spawn(move || {
                let _live = live;
                worker.run()
            })
            .map_err(BridgeError::SpawnFailed)?;

        tracing::info!(
            session = inner.id,
            identity = %inner.identity,
            "tracing session started"
        );
        Ok(Session {
            handle: SessionHandle { inner },
            control,
            worker: Some(join),
        })
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Stop accepting events, drain within the grace period and close the sink
    pub fn shutdown(mut self) -> Result<ShutdownReport> {
        self.stop()
    }

    fn stop(&mut self) -> Result<ShutdownReport> {
        self.handle.inner.accepting.store(false, Ordering::Release);
        let Some(join) = self.worker.take() else {
            return Err(BridgeError::NotInitialized);
        };
        // A full channel means a shutdown is already queued
        let _ = self.control.try_send(WorkerCommand::Shutdown);
        join.join().map_err(|_| BridgeError::WorkerPanicked)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.stop() {
                tracing::warn!("tracing session did not stop cleanly: {}", e);
            }
        }
    }
}

/// Producer-side access to a session; cheap to clone and share
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    pub(crate) fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| SessionHandle { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.inner.diagnostics
    }

    /// Ring totals across every producer thread
    pub fn queue_stats(&self) -> QueueStats {
        self.inner.registry.stats()
    }

    /// Frames marked so far
    pub fn frame_count(&self) -> u64 {
        self.inner.frames.current()
    }

    /// Nanoseconds since the session started
    pub fn now_ns(&self) -> u64 {
        self.inner.clock.now_ns()
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_accepting()
    }

    /// Open a zone on the calling thread
    ///
    /// Returns [`ZoneHandle::NULL`] if the session is stopping or the zone was
    /// rejected by the depth policy. An inactive zone holds a stack slot (so
    /// the handle must still be ended) but records nothing.
    pub fn begin_zone(&self, location: &SourceLocation<'_>, active: bool) -> ZoneHandle {
        let inner = &*self.inner;
        if !inner.is_accepting() {
            return ZoneHandle::NULL;
        }
        let timestamp_ns = inner.clock.now_ns();
        with_state(inner, |state| {
            let id = state.intern_location(inner, location);
            state.begin_zone(inner, id, active, timestamp_ns)
        })
        .unwrap_or(ZoneHandle::NULL)
    }

    /// Open a zone at a location registered with [`Self::alloc_source_location`]
    pub fn begin_zone_at(&self, location: LocationId, active: bool) -> ZoneHandle {
        let inner = &*self.inner;
        if !inner.is_accepting() {
            return ZoneHandle::NULL;
        }
        if !inner.locations.contains(location) {
            tracing::debug!(location = location.0, "zone begun at unknown location");
            return ZoneHandle::NULL;
        }
        let timestamp_ns = inner.clock.now_ns();
        with_state(inner, |state| state.begin_zone(inner, location, active, timestamp_ns))
            .unwrap_or(ZoneHandle::NULL)
    }

    /// Intern a source location for use with [`Self::begin_zone_at`]
    pub fn alloc_source_location(&self, location: &SourceLocation<'_>) -> LocationId {
        let inner = &*self.inner;
        with_state(inner, |state| state.intern_location(inner, location)).unwrap_or_else(|| {
            let key = LocationKey {
                name: location.name.map(|n| inner.strings.intern(n)),
                function: inner.strings.intern(location.function),
                file: inner.strings.intern(location.file),
                line: location.line,
                color: location.color,
            };
            inner.locations.intern(key)
        })
    }

    /// Close the innermost zone of the calling thread
    ///
    /// `handle` must come from `begin_zone` on this thread, in LIFO order.
    /// Anything else is reported and leaves every stack untouched.
    pub fn end_zone(&self, handle: ZoneHandle) {
        if handle.is_null() {
            return;
        }
        let inner = &*self.inner;
        if !inner.is_accepting() {
            return;
        }
        let timestamp_ns = inner.clock.now_ns();
        with_state(inner, |state| state.end_zone(inner, handle, timestamp_ns));
    }

    /// Open a zone that ends when the guard drops
    pub fn zone(&self, location: &SourceLocation<'_>) -> ZoneGuard {
        ZoneGuard {
            session: self.clone(),
            handle: self.begin_zone(location, true),
            _not_send: PhantomData,
        }
    }

    /// Mark the end of a frame; returns its index (starting at 1), or 0 if
    /// the session is stopping
    pub fn mark_frame(&self) -> u64 {
        let inner = &*self.inner;
        if !inner.is_accepting() {
            return 0;
        }
        let timestamp_ns = inner.clock.now_ns();
        let frame = inner.frames.tick();
        with_state(inner, |state| {
            state.emit(&Event::FrameMark {
                timestamp_ns,
                frame,
            })
        });
        frame
    }

    pub fn emit_counter(&self, name: &str, value: f64) {
        let inner = &*self.inner;
        if !inner.is_accepting() {
            return;
        }
        let timestamp_ns = inner.clock.now_ns();
        with_state(inner, |state| {
            let name = state.intern_string(inner, name);
            state.emit(&Event::Counter {
                timestamp_ns,
                name,
                value,
            })
        });
    }

    pub fn notify_alloc(&self, address: u64, size: u64) {
        self.emit(|timestamp_ns| Event::Alloc {
            timestamp_ns,
            address,
            size,
        });
    }

    pub fn notify_free(&self, address: u64) {
        self.emit(|timestamp_ns| Event::Free {
            timestamp_ns,
            address,
        });
    }

    /// Name the calling thread in the stream
    pub fn set_thread_name(&self, name: &str) {
        let inner = &*self.inner;
        if !inner.is_accepting() {
            return;
        }
        let timestamp_ns = inner.clock.now_ns();
        with_state(inner, |state| {
            let name = state.intern_string(inner, name);
            state.emit(&Event::ThreadName { timestamp_ns, name })
        });
    }

    /// Announce a GPU timing context; `period` is nanoseconds per GPU tick
    pub fn gpu_new_context(&self, context: u8, gpu_time: u64, period: f32) {
        self.emit(|timestamp_ns| Event::GpuNewContext {
            timestamp_ns,
            context,
            gpu_time,
            period,
        });
    }

    pub fn gpu_begin_zone(&self, context: u8, query_id: u16, location: LocationId) {
        if !self.inner.locations.contains(location) {
            tracing::debug!(location = location.0, "gpu zone begun at unknown location");
            return;
        }
        self.emit(|timestamp_ns| Event::GpuZoneBegin {
            timestamp_ns,
            context,
            query_id,
            location,
        });
    }

    pub fn gpu_end_zone(&self, context: u8, query_id: u16) {
        self.emit(|timestamp_ns| Event::GpuZoneEnd {
            timestamp_ns,
            context,
            query_id,
        });
    }

    /// Resolve a query issued by `gpu_begin_zone`/`gpu_end_zone`
    pub fn gpu_time(&self, context: u8, query_id: u16, gpu_time: u64) {
        self.emit(|timestamp_ns| Event::GpuTime {
            timestamp_ns,
            context,
            query_id,
            gpu_time,
        });
    }

    pub fn gpu_time_sync(&self, context: u8, gpu_time: u64) {
        self.emit(|timestamp_ns| Event::GpuTimeSync {
            timestamp_ns,
            context,
            gpu_time,
        });
    }

    /// Current zone nesting depth of the calling thread
    pub fn zone_depth(&self) -> u32 {
        with_state(&self.inner, |state| state.depth()).unwrap_or(0)
    }

    /// Bridge-assigned id of the calling thread
    pub fn thread_id(&self) -> u32 {
        current_thread_id()
    }

    #[inline]
    fn emit(&self, build: impl FnOnce(u64) -> Event) {
        let inner = &*self.inner;
        if !inner.is_accepting() {
            return;
        }
        let event = build(inner.clock.now_ns());
        with_state(inner, |state| state.emit(&event));
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("identity", &self.inner.identity)
            .finish()
    }
}

/// Ends its zone on drop
///
/// Not `Send`: a zone must end on the thread that opened it.
#[must_use = "the zone ends as soon as the guard is dropped"]
pub struct ZoneGuard {
    session: SessionHandle,
    handle: ZoneHandle,
    _not_send: PhantomData<*const ()>,
}

impl ZoneGuard {
    pub fn handle(&self) -> ZoneHandle {
        self.handle
    }
}

impl Drop for ZoneGuard {
    fn drop(&mut self) {
        self.session.end_zone(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SinkConfig;
    use crate::error::UsageError;
    use crate::sink::{NullSink, SharedBufferSink};
    use crate::wire::{StreamDecoder, WireMessage};

    fn start(sink: SharedBufferSink) -> Session {
        let config = BridgeConfig::default().with_sink(SinkConfig::Null);
        Session::start(config, Identity::default(), Box::new(sink)).unwrap()
    }

    fn events(bytes: &[u8]) -> Vec<Event> {
        StreamDecoder::new(bytes)
            .filter_map(|m| match m.unwrap() {
                WireMessage::Events { events, .. } => Some(events),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = BridgeConfig::default();
        config.batch_size = 0;
        let result = Session::start(config, Identity::default(), Box::new(NullSink::default()));
        assert!(matches!(result, Err(BridgeError::InvalidConfig(_))));
    }

    #[test]
    fn test_zone_guard_nests_and_ends() {
        let sink = SharedBufferSink::new();
        let session = start(sink.clone());
        let handle = session.handle();
        std::thread::spawn(move || {
            let _outer = handle.zone(&crate::source_location!("outer"));
            let inner = handle.zone(&crate::source_location!("inner"));
            assert_eq!(inner.handle().depth(), 2);
            assert_eq!(handle.zone_depth(), 2);
        })
        .join()
        .unwrap();

        let report = session.shutdown().unwrap();
        assert_eq!(report.records_written, 4);

        let depths: Vec<_> = events(&sink.contents())
            .into_iter()
            .filter_map(|e| match e {
                Event::ZoneBegin { depth, .. } => Some(("begin", depth)),
                Event::ZoneEnd { depth, .. } => Some(("end", depth)),
                _ => None,
            })
            .collect();
        assert_eq!(
            depths,
            vec![("begin", 1), ("begin", 2), ("end", 2), ("end", 1)]
        );
    }

    #[test]
    fn test_out_of_order_end_keeps_zone_open() {
        let session = start(SharedBufferSink::new());
        let handle = session.handle();
        let loc = SourceLocation::new("f", "f.rs", 1);
        let diagnostics = std::thread::spawn(move || {
            let a = handle.begin_zone(&loc, true);
            let b = handle.begin_zone(&loc, true);
            handle.end_zone(a);
            assert_eq!(handle.zone_depth(), 2);
            handle.end_zone(b);
            handle.end_zone(a);
            assert_eq!(handle.zone_depth(), 0);
            handle.diagnostics().drain()
        })
        .join()
        .unwrap();

        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics[0].error,
            UsageError::ZoneEndOutOfOrder { expected: 2, actual: 1 }
        );
        session.shutdown().unwrap();
    }

    #[test]
    fn test_inactive_zone_holds_slot_without_records() {
        let sink = SharedBufferSink::new();
        let session = start(sink.clone());
        let handle = session.handle();
        std::thread::spawn(move || {
            let loc = SourceLocation::new("f", "f.rs", 1);
            let off = handle.begin_zone(&loc, false);
            assert!(!off.is_null());
            let on = handle.begin_zone(&loc, true);
            assert_eq!(on.depth(), 2);
            handle.end_zone(on);
            handle.end_zone(off);
        })
        .join()
        .unwrap();

        session.shutdown().unwrap();
        assert_eq!(events(&sink.contents()).len(), 2);
    }

    #[test]
    fn test_begin_zone_at_registered_location() {
        let session = start(SharedBufferSink::new());
        let handle = session.handle();
        let location = handle.alloc_source_location(&SourceLocation::new("tick", "Server.java", 7));
        assert_eq!(
            handle.alloc_source_location(&SourceLocation::new("tick", "Server.java", 7)),
            location
        );
        assert!(handle.begin_zone_at(LocationId(999), true).is_null());

        let zone = handle.begin_zone_at(location, true);
        assert!(!zone.is_null());
        handle.end_zone(zone);
        session.shutdown().unwrap();
    }

    #[test]
    fn test_frames_are_numbered() {
        let session = start(SharedBufferSink::new());
        let handle = session.handle();
        assert_eq!(handle.mark_frame(), 1);
        assert_eq!(handle.mark_frame(), 2);
        assert_eq!(handle.frame_count(), 2);
        session.shutdown().unwrap();
        // Stopped sessions accept nothing
        assert_eq!(handle.mark_frame(), 0);
        assert!(!handle.is_active());
    }

    #[test]
    fn test_shutdown_on_drop() {
        let sink = SharedBufferSink::new();
        {
            let session = start(sink.clone());
            session.handle().emit_counter("tps", 20.0);
        }
        let bytes = sink.contents();
        let messages: Vec<_> = StreamDecoder::new(&bytes[..]).map(|m| m.unwrap()).collect();
        assert!(matches!(messages.last(), Some(WireMessage::Goodbye(_))));
    }
}
