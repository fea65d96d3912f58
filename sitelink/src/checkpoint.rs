use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering::Relaxed},
};

use crate::{DispatchCell, RaiseError, SwitchPoint, ThreadContext};

enum Checkpoint {
    Unlinked,
    /// no-op while the safepoint token holds
    Guarded(Arc<SwitchPoint>),
}

/// Safepoint poll in a loop back-edge or method prologue.
pub struct CheckpointSite {
    target: DispatchCell<Checkpoint>,
    slow_paths: AtomicU64,
}

impl CheckpointSite {
    pub fn new() -> Self {
        Self {
            target: DispatchCell::new(Arc::new(Checkpoint::Unlinked)),
            slow_paths: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn poll(&self, ctx: &mut ThreadContext) -> Result<(), RaiseError> {
        let pending = self.target.with(|target| match target {
            Checkpoint::Guarded(token) => !token.is_valid(),
            Checkpoint::Unlinked => true,
        });
        if pending { self.handle(ctx) } else { Ok(()) }
    }

    /// Re-arm with the current token first, so a request that races with
    /// the poll below is seen on the next pass.
    #[cold]
    fn handle(&self, ctx: &mut ThreadContext) -> Result<(), RaiseError> {
        let token = ctx.runtime().checkpoint_switch_point();
        self.target.store(Arc::new(Checkpoint::Guarded(token)));
        self.slow_paths.fetch_add(1, Relaxed);
        ctx.poll_thread_events()
    }

    /// times the guard failed and the full poll ran
    pub fn slow_paths(&self) -> u64 {
        self.slow_paths.load(Relaxed)
    }
}

impl Default for CheckpointSite {
    fn default() -> Self {
        Self::new()
    }
}
