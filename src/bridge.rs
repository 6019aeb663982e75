//! Process-wide bridge
//!
//! The host sees one tracing session per process. This module owns that
//! singleton and exposes the bridge operations as free functions, which is
//! what the C boundary in [`crate::ffi`] calls.
//!
//! Lifecycle:
//!
//! ```text
//! init_session ──► Active ──► shutdown_session ──► (none) ──► init_session ...
//!                    │
//!                    └─ init_session again: Err(AlreadyInitialized), reported
//! ```
//!
//! Producer calls never take the singleton lock on the fast path: each thread
//! caches a weak reference tagged with the generation it was read at, and only
//! re-reads the singleton when an init or shutdown bumped the generation. The
//! cache never keeps a shut-down session alive.
//! Every operation is a silent no-op while no session is active.

use crate::call_stack::ZoneHandle;
use crate::config::BridgeConfig;
use crate::diagnostics::Diagnostic;
use crate::error::{BridgeError, Result, UsageError};
use crate::identity::Identity;
use crate::session::{Session, SessionHandle, SessionInner};
use crate::sink::{self, Sink};
use crate::strings::{LocationId, SourceLocation};
use crate::thread_state::{current_thread_id, detach};
use crate::worker::ShutdownReport;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};

static SESSION: Mutex<Option<Session>> = Mutex::new(None);
static GENERATION: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CACHED: RefCell<(u64, Weak<SessionInner>)> = const { RefCell::new((0, Weak::new())) };
}

fn slot() -> MutexGuard<'static, Option<Session>> {
    SESSION.lock().unwrap_or_else(PoisonError::into_inner)
}

fn with_current<R>(f: impl FnOnce(&SessionHandle) -> R) -> Option<R> {
    let generation = GENERATION.load(Ordering::Acquire);
    let handle = CACHED
        .try_with(|cell| {
            let mut cached = cell.try_borrow_mut().ok()?;
            if cached.0 != generation {
                let fresh = slot()
                    .as_ref()
                    .map(|session| session.handle().downgrade())
                    .unwrap_or_default();
                *cached = (generation, fresh);
            }
            SessionHandle::upgrade(&cached.1)
        })
        .ok()
        .flatten()?;
    Some(f(&handle))
}

/// Reject a second init while a session is running
fn check_not_running(slot: &Option<Session>) -> Result<()> {
    let Some(existing) = slot.as_ref() else {
        return Ok(());
    };
    let handle = existing.handle();
    handle.diagnostics().report(
        UsageError::AlreadyInitialized {
            session: existing.id(),
        },
        current_thread_id(),
        handle.now_ns(),
    );
    Err(BridgeError::AlreadyInitialized(existing.id()))
}

/// Start the process-wide session
///
/// Configuration comes from the environment (see [`BridgeConfig::from_env`]).
/// Fails with [`BridgeError::AlreadyInitialized`] while a session is active;
/// the running session is left untouched.
pub fn init_session(identity: Identity) -> Result<SessionHandle> {
    check_not_running(&slot())?;
    let config = BridgeConfig::from_env()?;
    let sink = sink::from_config(&config);
    init_session_with(config, identity, sink)
}

/// Start the process-wide session with an explicit configuration and sink
pub fn init_session_with(
    config: BridgeConfig,
    identity: Identity,
    sink: Box<dyn Sink>,
) -> Result<SessionHandle> {
    let mut slot = slot();
    check_not_running(&slot)?;

    let session = Session::start(config, identity, sink)?;
    let handle = session.handle();
    *slot = Some(session);
    GENERATION.fetch_add(1, Ordering::AcqRel);
    Ok(handle)
}

/// Stop the process-wide session, draining in-flight records
pub fn shutdown_session() -> Result<ShutdownReport> {
    // Join the worker without holding the singleton lock
    let session = slot().take().ok_or(BridgeError::NotInitialized)?;
    GENERATION.fetch_add(1, Ordering::AcqRel);
    detach();
    let report = session.shutdown()?;

    tracing::info!(
        session = report.session_id,
        written = report.records_written,
        dropped = report.total_dropped(),
        "tracing session shut down"
    );
    Ok(report)
}

/// Handle to the active session, if any
pub fn active_session() -> Option<SessionHandle> {
    with_current(SessionHandle::clone)
}

pub fn is_active() -> bool {
    with_current(|s| s.is_active()).unwrap_or(false)
}

pub fn begin_zone(location: &SourceLocation<'_>, active: bool) -> ZoneHandle {
    with_current(|s| s.begin_zone(location, active)).unwrap_or(ZoneHandle::NULL)
}

pub fn begin_zone_at(location: LocationId, active: bool) -> ZoneHandle {
    with_current(|s| s.begin_zone_at(location, active)).unwrap_or(ZoneHandle::NULL)
}

pub fn alloc_source_location(location: &SourceLocation<'_>) -> Option<LocationId> {
    with_current(|s| s.alloc_source_location(location))
}

pub fn end_zone(handle: ZoneHandle) {
    if handle.is_null() {
        return;
    }
    with_current(|s| s.end_zone(handle));
}

/// Returns the frame index, or 0 without an active session
pub fn mark_frame() -> u64 {
    with_current(|s| s.mark_frame()).unwrap_or(0)
}

pub fn emit_counter(name: &str, value: f64) {
    with_current(|s| s.emit_counter(name, value));
}

pub fn notify_alloc(address: u64, size: u64) {
    with_current(|s| s.notify_alloc(address, size));
}

pub fn notify_free(address: u64) {
    with_current(|s| s.notify_free(address));
}

pub fn set_thread_name(name: &str) {
    with_current(|s| s.set_thread_name(name));
}

pub fn gpu_new_context(context: u8, gpu_time: u64, period: f32) {
    with_current(|s| s.gpu_new_context(context, gpu_time, period));
}

pub fn gpu_begin_zone(context: u8, query_id: u16, location: LocationId) {
    with_current(|s| s.gpu_begin_zone(context, query_id, location));
}

pub fn gpu_end_zone(context: u8, query_id: u16) {
    with_current(|s| s.gpu_end_zone(context, query_id));
}

pub fn gpu_time(context: u8, query_id: u16, gpu_time: u64) {
    with_current(|s| s.gpu_time(context, query_id, gpu_time));
}

pub fn gpu_time_sync(context: u8, gpu_time: u64) {
    with_current(|s| s.gpu_time_sync(context, gpu_time));
}

/// Report a usage error detected outside a session operation
pub fn report_usage_error(error: UsageError) {
    with_current(|s| {
        s.diagnostics()
            .report(error, current_thread_id(), s.now_ns())
    });
}

/// Take the recent diagnostics of the active session
pub fn drain_diagnostics() -> Vec<Diagnostic> {
    with_current(|s| s.diagnostics().drain()).unwrap_or_default()
}
