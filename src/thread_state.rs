//! Per-thread producer state
//!
//! Everything a host thread touches on the hot path lives here, in a
//! thread-local: its call stack, its ring, and caches in front of the shared
//! intern tables. Nothing in this module takes a lock once the caches are warm.
//!
//! State is tied to one session. When a thread calls in after the session it
//! attached to has been replaced, the old state is dropped (closing its ring)
//! and a fresh one is attached; open zones of the old session are forgotten.
//!
//! The ring itself is owned by the session's registry. A thread only holds a
//! weak reference, so a shut-down session frees every ring even while idle
//! threads still carry their state.

use crate::call_stack::{CallStack, PopOutcome, PushOutcome, ZoneFrame, ZoneHandle};
use crate::encoder::encode;
use crate::error::UsageError;
use crate::event::Event;
use crate::queue::ThreadQueue;
use crate::session::SessionInner;
use crate::strings::{LocationId, LocationKey, SourceLocation, StringId};
use fnv::FnvHashMap;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Thread id 0 is reserved for the worker
static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_ID: u32 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    static STATE: RefCell<Option<ThreadState>> = const { RefCell::new(None) };
}

/// Bridge-assigned id of the calling thread
///
/// Stable for the life of the thread and never reused. Returns 0 while the
/// thread's locals are being torn down.
pub fn current_thread_id() -> u32 {
    THREAD_ID.try_with(|id| *id).unwrap_or(0)
}

pub(crate) struct ThreadState {
    session_id: u64,
    thread_id: u32,
    stack: CallStack,
    queue: Weak<ThreadQueue>,
    strings: FnvHashMap<Box<str>, StringId>,
    locations: FnvHashMap<LocationKey, LocationId>,
}

impl ThreadState {
    fn attach(session: &SessionInner) -> Self {
        let thread_id = current_thread_id();
        let queue = Arc::downgrade(
            &session
                .registry
                .register(thread_id, session.config.queue_capacity),
        );
        let mut state = ThreadState {
            session_id: session.id,
            thread_id,
            stack: CallStack::new(session.config.max_zone_depth, session.config.depth_policy),
            queue,
            strings: FnvHashMap::default(),
            locations: FnvHashMap::default(),
        };

        if let Some(name) = std::thread::current().name() {
            let name = state.intern_string(session, name);
            state.emit(&Event::ThreadName {
                timestamp_ns: session.clock.now_ns(),
                name,
            });
        }

        tracing::trace!(
            session = session.id,
            thread = thread_id,
            "thread attached to tracing session"
        );
        state
    }

    /// Push a record onto this thread's ring; `false` if it was dropped
    /// or the session already released its rings
    #[inline]
    pub(crate) fn emit(&self, event: &Event) -> bool {
        self.queue
            .upgrade()
            .is_some_and(|queue| queue.push(encode(event)))
    }

    pub(crate) fn intern_string(&mut self, session: &SessionInner, text: &str) -> StringId {
        if let Some(id) = self.strings.get(text) {
            return *id;
        }
        let id = session.strings.intern(text);
        self.strings.insert(Box::from(text), id);
        id
    }

    pub(crate) fn intern_location(
        &mut self,
        session: &SessionInner,
        location: &SourceLocation<'_>,
    ) -> LocationId {
        let key = LocationKey {
            name: location.name.map(|n| self.intern_string(session, n)),
            function: self.intern_string(session, location.function),
            file: self.intern_string(session, location.file),
            line: location.line,
            color: location.color,
        };
        if let Some(id) = self.locations.get(&key) {
            return *id;
        }
        let id = session.locations.intern(key);
        self.locations.insert(key, id);
        id
    }

    pub(crate) fn begin_zone(
        &mut self,
        session: &SessionInner,
        location: LocationId,
        active: bool,
        timestamp_ns: u64,
    ) -> ZoneHandle {
        let frame = ZoneFrame {
            location,
            start_ns: timestamp_ns,
            active,
        };
        match self.stack.push(frame) {
            Ok(PushOutcome::Tracked { depth }) => {
                if active {
                    self.emit(&Event::ZoneBegin {
                        timestamp_ns,
                        location,
                        depth,
                    });
                }
                ZoneHandle::new(self.thread_id, depth)
            }
            Ok(PushOutcome::Coarsened { depth }) => ZoneHandle::new(self.thread_id, depth),
            Err(err) => {
                session.diagnostics.report(err, self.thread_id, timestamp_ns);
                ZoneHandle::NULL
            }
        }
    }

    pub(crate) fn end_zone(&mut self, session: &SessionInner, handle: ZoneHandle, timestamp_ns: u64) {
        if handle.thread_id() != self.thread_id {
            // Neither stack is touched
            session.diagnostics.report(
                UsageError::ZoneEndOnWrongThread {
                    owner: handle.thread_id(),
                    caller: self.thread_id,
                },
                self.thread_id,
                timestamp_ns,
            );
            return;
        }

        match self.stack.pop(handle.depth()) {
            Ok(PopOutcome::Tracked { depth, frame }) => {
                if frame.active {
                    self.emit(&Event::ZoneEnd {
                        timestamp_ns,
                        depth,
                    });
                }
            }
            Ok(PopOutcome::Coarsened { .. }) => {}
            Err(err) => session.diagnostics.report(err, self.thread_id, timestamp_ns),
        }
    }

    pub(crate) fn depth(&self) -> u32 {
        self.stack.depth()
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        self.stack.clear();
        if let Some(queue) = self.queue.upgrade() {
            queue.close();
        }
    }
}

/// Run `f` against the calling thread's state for `session`
///
/// Attaches the thread on first use. Returns `None` when the thread-local is
/// unavailable (thread exiting) or already borrowed (a re-entrant call from
/// inside the bridge, e.g. through a log subscriber); such calls are dropped.
pub(crate) fn with_state<R>(
    session: &SessionInner,
    f: impl FnOnce(&mut ThreadState) -> R,
) -> Option<R> {
    STATE
        .try_with(|cell| {
            let mut slot = cell.try_borrow_mut().ok()?;
            let current = slot.as_ref().map(|state| state.session_id);
            if current != Some(session.id) {
                // Replacing drops (and closes) the previous session's state
                *slot = Some(ThreadState::attach(session));
            }
            slot.as_mut().map(f)
        })
        .ok()
        .flatten()
}

/// Detach the calling thread from whatever session it is attached to
pub(crate) fn detach() {
    let _ = STATE.try_with(|cell| {
        if let Ok(mut slot) = cell.try_borrow_mut() {
            slot.take();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, SinkConfig};
    use crate::encoder::decode_record;
    use crate::identity::Identity;
    use crate::session::SessionInner;

    fn session(queue_capacity: usize) -> Arc<SessionInner> {
        let mut config = BridgeConfig::default().with_sink(SinkConfig::Null);
        config.queue_capacity = queue_capacity;
        config.max_zone_depth = 2;
        Arc::new(SessionInner::new(config, Identity::default()))
    }

    fn drained(session: &SessionInner) -> Vec<Event> {
        let mut queues = Vec::new();
        let mut seen = 0;
        session.registry.snapshot_if_changed(&mut seen, &mut queues);
        let mut records = Vec::new();
        for q in &queues {
            q.drain_into(&mut records, usize::MAX);
        }
        records.iter().map(|r| decode_record(r).unwrap()).collect()
    }

    #[test]
    fn test_thread_ids_are_unique_and_stable() {
        let here = current_thread_id();
        assert_ne!(here, 0);
        assert_eq!(current_thread_id(), here);
        let other = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(other, here);
    }

    #[test]
    fn test_cached_interning_matches_tables() {
        let session = session(64);
        let ids = std::thread::spawn({
            let session = session.clone();
            move || {
                with_state(&session, |state| {
                    let a = state.intern_string(&session, "tick");
                    let b = state.intern_string(&session, "tick");
                    let loc = SourceLocation::new("f", "f.rs", 1);
                    let l1 = state.intern_location(&session, &loc);
                    let l2 = state.intern_location(&session, &loc);
                    (a, b, l1, l2)
                })
                .unwrap()
            }
        })
        .join()
        .unwrap();

        assert_eq!(ids.0, ids.1);
        assert_eq!(ids.2, ids.3);
        assert_eq!(session.strings.resolve(ids.0).as_deref(), Some("tick"));
        assert!(session.locations.contains(ids.2));
    }

    #[test]
    fn test_named_thread_announces_itself() {
        let session = session(64);
        std::thread::Builder::new()
            .name("Server thread".to_string())
            .spawn({
                let session = session.clone();
                move || with_state(&session, |_| ())
            })
            .unwrap()
            .join()
            .unwrap();

        let events = drained(&session);
        assert_eq!(events.len(), 1);
        match events[0] {
            Event::ThreadName { name, .. } => {
                assert_eq!(session.strings.resolve(name).as_deref(), Some("Server thread"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reattach_on_new_session_forgets_open_zones() {
        let first = session(64);
        let second = session(64);
        std::thread::spawn(move || {
            let loc = with_state(&first, |s| s.intern_location(&first, &SourceLocation::new("f", "f.rs", 1))).unwrap();
            with_state(&first, |s| s.begin_zone(&first, loc, true, 1)).unwrap();
            assert_eq!(with_state(&first, |s| s.depth()), Some(1));
            assert_eq!(with_state(&second, |s| s.depth()), Some(0));
            // The first session's ring was closed on replacement
            let mut queues = Vec::new();
            let mut seen = 0;
            first.registry.snapshot_if_changed(&mut seen, &mut queues);
            assert!(queues.iter().all(|q| q.is_closed()));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_wrong_thread_end_is_reported_not_applied() {
        let session = session(64);
        let handle = std::thread::spawn({
            let session = session.clone();
            move || {
                let loc = with_state(&session, |s| {
                    s.intern_location(&session, &SourceLocation::new("f", "f.rs", 1))
                })
                .unwrap();
                with_state(&session, |s| s.begin_zone(&session, loc, true, 1)).unwrap()
            }
        })
        .join()
        .unwrap();

        std::thread::spawn({
            let session = session.clone();
            move || {
                with_state(&session, |s| s.end_zone(&session, handle, 2)).unwrap();
                assert_eq!(with_state(&session, |s| s.depth()), Some(0));
            }
        })
        .join()
        .unwrap();

        let wrong = UsageError::ZoneEndOnWrongThread { owner: 0, caller: 0 };
        assert_eq!(session.diagnostics.count_of(&wrong), 1);
    }

    #[test]
    fn test_depth_limit_coarsens() {
        let session = session(64);
        std::thread::spawn({
            let session = session.clone();
            move || {
                let loc = with_state(&session, |s| {
                    s.intern_location(&session, &SourceLocation::new("f", "f.rs", 1))
                })
                .unwrap();
                let handles: Vec<_> = (0..3)
                    .map(|i| with_state(&session, |s| s.begin_zone(&session, loc, true, i)).unwrap())
                    .collect();
                assert!(handles.iter().all(|h| !h.is_null()));
                for h in handles.iter().rev() {
                    with_state(&session, |s| s.end_zone(&session, *h, 10)).unwrap();
                }
            }
        })
        .join()
        .unwrap();

        // Only the two tracked zones produce records
        let events = drained(&session);
        assert_eq!(events.len(), 4);
        assert_eq!(session.diagnostics.total(), 0);
    }

    #[test]
    fn test_released_rings_are_freed_while_thread_idles() {
        let session = session(64);
        let (attached_tx, attached_rx) = std::sync::mpsc::channel();
        let (resume_tx, resume_rx) = std::sync::mpsc::channel::<()>();
        let worker_thread = std::thread::spawn({
            let session = session.clone();
            move || {
                with_state(&session, |s| s.emit(&Event::FrameMark { timestamp_ns: 1, frame: 1 }));
                attached_tx.send(()).unwrap();
                resume_rx.recv().unwrap();
                // State is still attached, but its ring is gone
                with_state(&session, |s| s.emit(&Event::FrameMark { timestamp_ns: 2, frame: 2 }))
            }
        });
        attached_rx.recv().unwrap();

        let mut queues = Vec::new();
        let mut seen = 0;
        session.registry.snapshot_if_changed(&mut seen, &mut queues);
        let ring = Arc::downgrade(&queues[0]);
        drop(queues);

        drop(session.registry.release());
        assert!(ring.upgrade().is_none());

        resume_tx.send(()).unwrap();
        assert_eq!(worker_thread.join().unwrap(), Some(false));
    }
}
