//! Instrumentation hooks for tensor-train operations.
//!
//! A train may carry an [`EventSink`], which is handed a [`TrainEvent`] every
//! time a sweep finishes, a bond is truncated, or the train's peak memory
//! high-water mark rises. Events are purely advisory and never affect the
//! result of an operation.

use std::{ fmt, sync::Mutex };
use serde::{ Deserialize, Serialize };
use crate::site::TrainKind;

/// Direction of a sweep.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Sites are visited left to right; the train ends left-canonical.
    LeftToRight,
    /// Sites are visited right to left; the train ends right-canonical.
    RightToLeft,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LeftToRight => write!(f, "left"),
            Self::RightToLeft => write!(f, "right"),
        }
    }
}

/// Which kind of sweep was performed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SweepMode {
    Canonicalise,
    Compress,
}

/// Events emitted by a tensor train.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TrainEvent {
    /// The memory high-water mark was raised.
    PeakBytes {
        /// New high-water mark.
        bytes: usize,
    },

    /// A bond was truncated during compression.
    BondTruncated {
        /// Index of the bond.
        bond: usize,
        /// Number of directions kept.
        kept: usize,
        /// Number of directions before truncation.
        total: usize,
    },

    /// A full sweep finished.
    Swept {
        kind: TrainKind,
        mode: SweepMode,
        direction: Direction,
        /// Bond dimensions after the sweep.
        bond_dims: Vec<usize>,
    },
}

/// Receiver for [`TrainEvent`]s.
pub trait EventSink: fmt::Debug + Send + Sync {
    fn on_event(&self, event: &TrainEvent);
}

/// An [`EventSink`] that stores every event it receives.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<TrainEvent>>,
}

impl EventLog {
    /// Create a new, empty log.
    pub fn new() -> Self { Self::default() }

    /// Return a copy of all events received so far.
    pub fn events(&self) -> Vec<TrainEvent> {
        self.events.lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Return the largest peak-memory value received so far.
    pub fn peak_bytes(&self) -> Option<usize> {
        self.events().iter()
            .filter_map(|ev| match ev {
                TrainEvent::PeakBytes { bytes } => Some(*bytes),
                _ => None,
            })
            .max()
    }

    /// Remove all stored events.
    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() { events.clear(); }
    }
}

impl EventSink for EventLog {
    fn on_event(&self, event: &TrainEvent) {
        if let Ok(mut events) = self.events.lock() { events.push(event.clone()); }
    }
}
