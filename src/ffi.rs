//! C ABI for the host
//!
//! Every entry point takes fixed-size primitives only. Strings cross as a
//! pointer plus byte length (UTF-8, no terminator needed); a null pointer with
//! length 0 is the empty string, and a null name pointer means "no name".
//!
//! No entry point unwinds into the host: bodies run under `catch_unwind`, and
//! a panic is logged and turned into the neutral return value.

use crate::bridge;
use crate::call_stack::ZoneHandle;
use crate::error::{BridgeError, UsageError};
use crate::identity::{self, Identity};
use crate::logging;
use crate::strings::{LocationId, SourceLocation};
use std::os::raw::c_char;
use std::panic::{self, AssertUnwindSafe};

/// Returned by `megatrace_alloc_source_location` when nothing was registered
pub const MEGATRACE_INVALID_LOCATION: u32 = u32::MAX;

/// Status codes of lifecycle calls
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MegatraceStatus {
    Ok = 0,
    AlreadyInitialized = 1,
    NotInitialized = 2,
    InvalidArgument = 3,
    InitFailed = 4,
    Panicked = 5,
}

impl From<&BridgeError> for MegatraceStatus {
    fn from(err: &BridgeError) -> Self {
        match err {
            BridgeError::AlreadyInitialized(_) => MegatraceStatus::AlreadyInitialized,
            BridgeError::NotInitialized => MegatraceStatus::NotInitialized,
            BridgeError::InvalidConfig(_) | BridgeError::Config(_) => {
                MegatraceStatus::InvalidArgument
            }
            BridgeError::SpawnFailed(_) | BridgeError::WorkerPanicked => MegatraceStatus::InitFailed,
        }
    }
}

fn guarded<R>(entry: &'static str, fallback: R, f: impl FnOnce() -> R) -> R {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            tracing::error!(entry, "panic caught at the C boundary");
            fallback
        }
    }
}

/// Borrow a host string
///
/// # Safety
///
/// `ptr` must be null or point to `len` readable bytes for the duration of
/// the call.
unsafe fn host_str<'a>(ptr: *const u8, len: usize) -> Result<&'a str, UsageError> {
    if ptr.is_null() || len == 0 {
        return Ok("");
    }
    // SAFETY: caller guarantees `len` readable bytes at `ptr`
    let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
    std::str::from_utf8(bytes).map_err(|_| UsageError::InvalidUtf8)
}

/// Like [`host_str`], but a null pointer is `None`
unsafe fn host_opt_str<'a>(ptr: *const u8, len: usize) -> Result<Option<&'a str>, UsageError> {
    if ptr.is_null() {
        Ok(None)
    } else {
        unsafe { host_str(ptr, len) }.map(Some)
    }
}

/// Build a location from host strings, reporting invalid UTF-8
#[allow(clippy::too_many_arguments)]
unsafe fn host_location<'a>(
    function: *const u8,
    function_len: usize,
    file: *const u8,
    file_len: usize,
    line: u32,
    name: *const u8,
    name_len: usize,
    color: u32,
) -> Option<SourceLocation<'a>> {
    let parsed = (|| unsafe {
        Ok::<_, UsageError>(SourceLocation {
            name: host_opt_str(name, name_len)?,
            function: host_str(function, function_len)?,
            file: host_str(file, file_len)?,
            line,
            color,
        })
    })();
    match parsed {
        Ok(location) => Some(location),
        Err(err) => {
            bridge::report_usage_error(err);
            None
        }
    }
}

fn status_of(result: Result<(), BridgeError>) -> MegatraceStatus {
    match result {
        Ok(()) => MegatraceStatus::Ok,
        Err(err) => {
            tracing::warn!("megatrace: {}", err);
            MegatraceStatus::from(&err)
        }
    }
}

/// Start the process-wide session with the built-in identity
///
/// Also installs the bridge's log subscriber unless the process has one.
#[no_mangle]
pub extern "C" fn megatrace_init() -> MegatraceStatus {
    guarded("megatrace_init", MegatraceStatus::Panicked, || {
        logging::init(false);
        status_of(bridge::init_session(Identity::build()).map(drop))
    })
}

/// Start the process-wide session with a host-supplied identity
///
/// # Safety
///
/// Each pointer must be null or point to the given number of readable bytes.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn megatrace_init_with_identity(
    mod_id: *const u8,
    mod_id_len: usize,
    mod_name: *const u8,
    mod_name_len: usize,
    mod_version: *const u8,
    mod_version_len: usize,
    root_pkg: *const u8,
    root_pkg_len: usize,
) -> MegatraceStatus {
    guarded("megatrace_init_with_identity", MegatraceStatus::Panicked, || {
        logging::init(false);
        let identity = (|| unsafe {
            Ok::<_, UsageError>(Identity::new(
                host_str(mod_id, mod_id_len)?,
                host_str(mod_name, mod_name_len)?,
                host_str(mod_version, mod_version_len)?,
                host_str(root_pkg, root_pkg_len)?,
            ))
        })();
        match identity {
            Ok(identity) => status_of(bridge::init_session(identity).map(drop)),
            Err(_) => MegatraceStatus::InvalidArgument,
        }
    })
}

/// Drain and stop the process-wide session
#[no_mangle]
pub extern "C" fn megatrace_shutdown() -> MegatraceStatus {
    guarded("megatrace_shutdown", MegatraceStatus::Panicked, || {
        status_of(bridge::shutdown_session().map(drop))
    })
}

#[no_mangle]
pub extern "C" fn megatrace_is_active() -> bool {
    guarded("megatrace_is_active", false, bridge::is_active)
}

/// Open a zone; returns 0 if nothing was opened
///
/// # Safety
///
/// Each pointer must be null or point to the given number of readable bytes.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn megatrace_begin_zone(
    function: *const u8,
    function_len: usize,
    file: *const u8,
    file_len: usize,
    line: u32,
    name: *const u8,
    name_len: usize,
    color: u32,
    active: bool,
) -> u64 {
    guarded("megatrace_begin_zone", 0, || {
        let location = unsafe {
            host_location(function, function_len, file, file_len, line, name, name_len, color)
        };
        match location {
            Some(location) => bridge::begin_zone(&location, active).as_raw(),
            None => ZoneHandle::NULL.as_raw(),
        }
    })
}

/// Register a source location for `megatrace_begin_zone_at`
///
/// Returns [`MEGATRACE_INVALID_LOCATION`] without an active session.
///
/// # Safety
///
/// Each pointer must be null or point to the given number of readable bytes.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn megatrace_alloc_source_location(
    function: *const u8,
    function_len: usize,
    file: *const u8,
    file_len: usize,
    line: u32,
    name: *const u8,
    name_len: usize,
    color: u32,
) -> u32 {
    guarded(
        "megatrace_alloc_source_location",
        MEGATRACE_INVALID_LOCATION,
        || {
            let location = unsafe {
                host_location(function, function_len, file, file_len, line, name, name_len, color)
            };
            location
                .and_then(|location| bridge::alloc_source_location(&location))
                .map_or(MEGATRACE_INVALID_LOCATION, |id| id.0)
        },
    )
}

#[no_mangle]
pub extern "C" fn megatrace_begin_zone_at(location: u32, active: bool) -> u64 {
    guarded("megatrace_begin_zone_at", 0, || {
        bridge::begin_zone_at(LocationId(location), active).as_raw()
    })
}

#[no_mangle]
pub extern "C" fn megatrace_end_zone(handle: u64) {
    guarded("megatrace_end_zone", (), || {
        bridge::end_zone(ZoneHandle::from_raw(handle))
    })
}

/// Returns the frame index, or 0 without an active session
#[no_mangle]
pub extern "C" fn megatrace_mark_frame() -> u64 {
    guarded("megatrace_mark_frame", 0, bridge::mark_frame)
}

/// # Safety
///
/// `name` must be null or point to `name_len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn megatrace_emit_counter(name: *const u8, name_len: usize, value: f64) {
    guarded("megatrace_emit_counter", (), || match unsafe { host_str(name, name_len) } {
        Ok(name) => bridge::emit_counter(name, value),
        Err(err) => bridge::report_usage_error(err),
    })
}

#[no_mangle]
pub extern "C" fn megatrace_notify_alloc(address: u64, size: u64) {
    guarded("megatrace_notify_alloc", (), || {
        bridge::notify_alloc(address, size)
    })
}

#[no_mangle]
pub extern "C" fn megatrace_notify_free(address: u64) {
    guarded("megatrace_notify_free", (), || bridge::notify_free(address))
}

/// # Safety
///
/// `name` must be null or point to `name_len` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn megatrace_set_thread_name(name: *const u8, name_len: usize) {
    guarded("megatrace_set_thread_name", (), || match unsafe { host_str(name, name_len) } {
        Ok(name) => bridge::set_thread_name(name),
        Err(err) => bridge::report_usage_error(err),
    })
}

#[no_mangle]
pub extern "C" fn megatrace_gpu_new_context(context: u8, gpu_time: u64, period: f32) {
    guarded("megatrace_gpu_new_context", (), || {
        bridge::gpu_new_context(context, gpu_time, period)
    })
}

#[no_mangle]
pub extern "C" fn megatrace_gpu_begin_zone(context: u8, query_id: u16, location: u32) {
    guarded("megatrace_gpu_begin_zone", (), || {
        bridge::gpu_begin_zone(context, query_id, LocationId(location))
    })
}

#[no_mangle]
pub extern "C" fn megatrace_gpu_end_zone(context: u8, query_id: u16) {
    guarded("megatrace_gpu_end_zone", (), || {
        bridge::gpu_end_zone(context, query_id)
    })
}

#[no_mangle]
pub extern "C" fn megatrace_gpu_time(context: u8, query_id: u16, gpu_time: u64) {
    guarded("megatrace_gpu_time", (), || {
        bridge::gpu_time(context, query_id, gpu_time)
    })
}

#[no_mangle]
pub extern "C" fn megatrace_gpu_time_sync(context: u8, gpu_time: u64) {
    guarded("megatrace_gpu_time_sync", (), || {
        bridge::gpu_time_sync(context, gpu_time)
    })
}

/// Usage errors reported so far by the active session
#[no_mangle]
pub extern "C" fn megatrace_diagnostic_count() -> u64 {
    guarded("megatrace_diagnostic_count", 0, || {
        bridge::active_session().map_or(0, |s| s.diagnostics().total())
    })
}

/// Build-time mod id, NUL-terminated, static
#[no_mangle]
pub extern "C" fn megatrace_mod_id() -> *const c_char {
    identity::MOD_ID_C.as_ptr().cast()
}

#[no_mangle]
pub extern "C" fn megatrace_mod_name() -> *const c_char {
    identity::MOD_NAME_C.as_ptr().cast()
}

#[no_mangle]
pub extern "C" fn megatrace_mod_version() -> *const c_char {
    identity::MOD_VERSION_C.as_ptr().cast()
}

#[no_mangle]
pub extern "C" fn megatrace_root_pkg() -> *const c_char {
    identity::ROOT_PKG_C.as_ptr().cast()
}
