//! Interned strings and source locations
//!
//! Zone, counter and thread names cross the queue as integer ids, never as text.
//! Each session owns one append-only [`StringTable`] and one [`LocationTable`]:
//!
//! ```text
//! producer thread                      shared tables               worker
//! ───────────────                      ─────────────               ──────
//! thread-local cache hit ──► id        (not touched)
//! cache miss ──► intern() ──► lock, append, publish len
//!                                      definitions_since(mark) ──► Strings frame
//! ```
//!
//! Producers only touch the shared tables on the first occurrence of a name on
//! their thread (see `thread_state`). Ids are dense indices in first-occurrence
//! order; `len()` is published atomically after each append so validity checks
//! never take the lock. The worker reconciles by emitting every definition past
//! its watermark before the first events frame that may reference it.

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Id of an interned string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StringId(pub u32);

/// Id of an interned source location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocationId(pub u32);

/// Where a zone was opened, as the host describes it
///
/// Prefer `'static` literals (see [`crate::source_location!`]); anything else
/// is copied exactly once per thread, on first occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation<'a> {
    /// Display name; viewers fall back to `function` when absent
    pub name: Option<&'a str>,
    pub function: &'a str,
    pub file: &'a str,
    pub line: u32,
    /// 0xRRGGBB, 0 = viewer default
    pub color: u32,
}

impl<'a> SourceLocation<'a> {
    pub const fn new(function: &'a str, file: &'a str, line: u32) -> Self {
        SourceLocation {
            name: None,
            function,
            file,
            line,
            color: 0,
        }
    }

    pub const fn with_name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    pub const fn with_color(mut self, color: u32) -> Self {
        self.color = color;
        self
    }
}

/// Build a [`SourceLocation`] for the current Rust call site
///
/// `source_location!("name")` or `source_location!("name", 0xRRGGBB)`.
#[macro_export]
macro_rules! source_location {
    ($name:expr) => {
        $crate::strings::SourceLocation::new(module_path!(), file!(), line!()).with_name($name)
    };
    ($name:expr, $color:expr) => {
        $crate::source_location!($name).with_color($color)
    };
}

/// A source location with its strings already interned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocationKey {
    pub name: Option<StringId>,
    pub function: StringId,
    pub file: StringId,
    pub line: u32,
    pub color: u32,
}

/// Wire form of an interned string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringDef {
    pub id: StringId,
    pub text: String,
}

/// Wire form of an interned source location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationDef {
    pub id: LocationId,
    pub name: Option<StringId>,
    pub function: StringId,
    pub file: StringId,
    pub line: u32,
    pub color: u32,
}

impl LocationDef {
    pub fn key(&self) -> LocationKey {
        LocationKey {
            name: self.name,
            function: self.function,
            file: self.file,
            line: self.line,
            color: self.color,
        }
    }
}

#[derive(Debug, Default)]
struct StringTableInner {
    ids: FnvHashMap<Arc<str>, StringId>,
    texts: Vec<Arc<str>>,
}

/// Append-only session string dictionary
#[derive(Debug, Default)]
pub struct StringTable {
    inner: Mutex<StringTableInner>,
    published: AtomicU32,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of `text`, assigning the next id on first occurrence
    pub fn intern(&self, text: &str) -> StringId {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = inner.ids.get(text) {
            return *id;
        }

        let id = StringId(inner.texts.len() as u32);
        let text: Arc<str> = Arc::from(text);
        inner.texts.push(text.clone());
        inner.ids.insert(text, id);
        self.published.store(inner.texts.len() as u32, Ordering::Release);
        id
    }

    pub fn resolve(&self, id: StringId) -> Option<Arc<str>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.texts.get(id.0 as usize).cloned()
    }

    /// Lock-free validity check
    pub fn contains(&self, id: StringId) -> bool {
        id.0 < self.published.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.published.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append definitions for every id `>= start` to `out`; returns the new watermark
    pub fn definitions_since(&self, start: usize, out: &mut Vec<StringDef>) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for (index, text) in inner.texts.iter().enumerate().skip(start) {
            out.push(StringDef {
                id: StringId(index as u32),
                text: text.to_string(),
            });
        }
        inner.texts.len()
    }
}

#[derive(Debug, Default)]
struct LocationTableInner {
    ids: FnvHashMap<LocationKey, LocationId>,
    keys: Vec<LocationKey>,
}

/// Append-only session source-location dictionary
#[derive(Debug, Default)]
pub struct LocationTable {
    inner: Mutex<LocationTableInner>,
    published: AtomicU32,
}

impl LocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, key: LocationKey) -> LocationId {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = inner.ids.get(&key) {
            return *id;
        }

        let id = LocationId(inner.keys.len() as u32);
        inner.keys.push(key);
        inner.ids.insert(key, id);
        self.published.store(inner.keys.len() as u32, Ordering::Release);
        id
    }

    pub fn get(&self, id: LocationId) -> Option<LocationKey> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.keys.get(id.0 as usize).copied()
    }

    pub fn contains(&self, id: LocationId) -> bool {
        id.0 < self.published.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.published.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn definitions_since(&self, start: usize, out: &mut Vec<LocationDef>) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for (index, key) in inner.keys.iter().enumerate().skip(start) {
            out.push(LocationDef {
                id: LocationId(index as u32),
                name: key.name,
                function: key.function,
                file: key.file,
                line: key.line,
                color: key.color,
            });
        }
        inner.keys.len()
    }
}
