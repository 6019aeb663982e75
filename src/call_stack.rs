//! Per-thread stack of open zones
//!
//! Pure data structure: no I/O, no locking. Each producer thread owns one
//! [`CallStack`] inside its thread-local state, so push/pop never synchronize.
//!
//! # Depth limit
//!
//! Nesting beyond `max_depth` follows the configured [`DepthPolicy`]:
//!
//! - `Coarsen` (default): the zone gets a valid handle but is not recorded; its
//!   time is attributed to the deepest tracked ancestor. Only a counter is kept
//!   for such zones, so memory stays bounded by `max_depth`.
//! - `Reject`: `push` fails with [`UsageError::ZoneDepthExceeded`].
//!
//! # Handles
//!
//! A [`ZoneHandle`] packs the owning thread id and the 1-based logical depth of
//! the zone. Ending requires the handle of the innermost open zone.
//!
//! A handle names a stack position, not a zone instance. Once the zone at
//! depth `d` has ended, a stale copy of its handle matches the next zone
//! opened at depth `d` on the same thread and closes it. Each handle must be
//! ended exactly once.

use crate::error::UsageError;
use crate::strings::LocationId;
use serde::{Deserialize, Serialize};

/// Lightweight handle returned by zone begin
///
/// Identifies `(thread, depth)`; see the module docs for what that means for
/// a handle ended twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZoneHandle(u64);

impl ZoneHandle {
    /// Handle returned when nothing was opened; ending it is a no-op
    pub const NULL: ZoneHandle = ZoneHandle(0);

    pub const fn new(thread_id: u32, depth: u32) -> Self {
        ZoneHandle(((thread_id as u64) << 32) | depth as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        ZoneHandle(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    pub const fn thread_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn depth(self) -> u32 {
        self.0 as u32
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// What to do when zones nest deeper than the configured maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthPolicy {
    /// Keep the handle valid, stop recording below the limit
    #[default]
    Coarsen,
    /// Fail the begin call
    Reject,
}

/// An open, tracked zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneFrame {
    pub location: LocationId,
    pub start_ns: u64,
    /// Inactive zones hold a slot but emit no records
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Tracked { depth: u32 },
    Coarsened { depth: u32 },
}

impl PushOutcome {
    pub fn depth(&self) -> u32 {
        match *self {
            PushOutcome::Tracked { depth } | PushOutcome::Coarsened { depth } => depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopOutcome {
    Tracked { depth: u32, frame: ZoneFrame },
    Coarsened { depth: u32 },
}

#[derive(Debug)]
pub struct CallStack {
    frames: Vec<ZoneFrame>,
    coarsened: u32,
    max_depth: u32,
    policy: DepthPolicy,
}

impl CallStack {
    pub fn new(max_depth: u32, policy: DepthPolicy) -> Self {
        CallStack {
            frames: Vec::with_capacity(max_depth.min(32) as usize),
            coarsened: 0,
            max_depth,
            policy,
        }
    }

    /// Logical nesting depth, including coarsened zones
    pub fn depth(&self) -> u32 {
        self.frames.len() as u32 + self.coarsened
    }

    /// Number of zones with their own frame
    pub fn tracked_depth(&self) -> u32 {
        self.frames.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Innermost tracked frame
    pub fn innermost(&self) -> Option<&ZoneFrame> {
        self.frames.last()
    }

    pub fn push(&mut self, frame: ZoneFrame) -> Result<PushOutcome, UsageError> {
        let depth = self.depth() + 1;

        if self.tracked_depth() < self.max_depth {
            self.frames.push(frame);
            return Ok(PushOutcome::Tracked { depth });
        }

        match self.policy {
            DepthPolicy::Coarsen => {
                self.coarsened += 1;
                Ok(PushOutcome::Coarsened { depth })
            }
            DepthPolicy::Reject => Err(UsageError::ZoneDepthExceeded {
                max: self.max_depth,
            }),
        }
    }

    /// Close the innermost zone, which must be at `depth`
    ///
    /// On error the stack is left untouched.
    pub fn pop(&mut self, depth: u32) -> Result<PopOutcome, UsageError> {
        let top = self.depth();
        if top == 0 {
            return Err(UsageError::ZoneEndWithoutBegin { depth });
        }
        if depth != top {
            return Err(UsageError::ZoneEndOutOfOrder {
                expected: top,
                actual: depth,
            });
        }

        if self.coarsened > 0 {
            self.coarsened -= 1;
            return Ok(PopOutcome::Coarsened { depth });
        }

        match self.frames.pop() {
            Some(frame) => Ok(PopOutcome::Tracked { depth, frame }),
            None => Err(UsageError::ZoneEndWithoutBegin { depth }),
        }
    }

    /// Drop every open zone (thread detaching from a session)
    pub fn clear(&mut self) {
        self.frames.clear();
        self.coarsened = 0;
    }
}
