use std::sync::{
    Arc,
    atomic::{
        AtomicBool, AtomicU64,
        Ordering::{AcqRel, Acquire, Relaxed},
    },
};

use parking_lot::Mutex;

/// One-shot validity token. Starts valid, can only ever become invalid.
///
/// Guards hold an `Arc<SwitchPoint>`; the hot path is a single load of
/// `valid`.
#[derive(Debug)]
pub struct SwitchPoint {
    valid: AtomicBool,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidatorKind {
    /// a type's method table
    MethodTable,
    /// a global variable's value
    Global,
    /// process wide "safepoint pending" flag
    Checkpoint,
}

/// Owner side of a guarded fact.
///
/// A repeatable invalidator flips its current switch point and installs a
/// fresh one, so guards taken earlier all fail while later guards start
/// valid again. A one-shot invalidator stays invalid after the first flip.
#[derive(Debug)]
pub struct Invalidator {
    kind: InvalidatorKind,
    repeatable: bool,
    current: Mutex<Arc<SwitchPoint>>,
    generation: AtomicU64,
}

impl SwitchPoint {
    pub fn new(generation: u64) -> Arc<Self> {
        Arc::new(Self {
            valid: AtomicBool::new(true),
            generation,
        })
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Acquire)
    }

    /// Returns true if this call performed the valid -> invalid transition.
    pub fn invalidate(&self) -> bool {
        self.valid.swap(false, AcqRel)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Invalidator {
    pub fn new(kind: InvalidatorKind) -> Self {
        Self::with_mode(kind, true)
    }

    pub fn one_shot(kind: InvalidatorKind) -> Self {
        Self::with_mode(kind, false)
    }

    fn with_mode(kind: InvalidatorKind, repeatable: bool) -> Self {
        Self {
            kind,
            repeatable,
            current: Mutex::new(SwitchPoint::new(0)),
            generation: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn kind(&self) -> InvalidatorKind {
        self.kind
    }

    /// The token a new guard should capture.
    ///
    /// Callers must take the switch point *before* reading the guarded fact;
    /// a write racing with them then flips the token they hold instead of
    /// leaving a stale value behind a fresh token.
    pub fn switch_point(&self) -> Arc<SwitchPoint> {
        self.current.lock().clone()
    }

    pub fn invalidate(&self) {
        let mut current = self.current.lock();
        if !current.is_valid() {
            // one-shot and already spent
            return;
        }
        let previous = if self.repeatable {
            let generation = self.generation.fetch_add(1, Relaxed) + 1;
            std::mem::replace(&mut *current, SwitchPoint::new(generation))
        } else {
            current.clone()
        };
        drop(current);
        previous.invalidate();
    }

    pub fn invalidate_all<'a>(invalidators: impl IntoIterator<Item = &'a Invalidator>) {
        for invalidator in invalidators {
            invalidator.invalidate();
        }
    }

    /// number of times a fresh switch point has been minted
    pub fn generation(&self) -> u64 {
        self.generation.load(Relaxed)
    }

    pub fn is_spent(&self) -> bool {
        !self.repeatable && !self.current.lock().is_valid()
    }
}
