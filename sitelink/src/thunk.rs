use std::{fmt, sync::Arc};

use crate::{Block, CacheEntry, CallResult, ClassId, SwitchPoint, ThreadContext, Value};

/// Pre-resolved invocation path. Built once per link, reused by every call.
pub type Invoker =
    Box<dyn Fn(&mut ThreadContext, &Value, &[Value], &Block) -> CallResult + Send + Sync>;

/// Box a closure as an [`Invoker`], fixing its signature.
pub fn invoker(
    f: impl Fn(&mut ThreadContext, &Value, &[Value], &Block) -> CallResult + Send + Sync + 'static,
) -> Invoker {
    Box::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThunkKind {
    Link,
    Native,
    Compiled,
    Handle,
    AttrReader,
    AttrWriter,
    MethodMissing,
    /// bound method through its generic calling convention
    Generic,
    /// lookup on every call
    Megamorphic,
}

/// A dispatch target bound to one resolved method and call shape.
pub struct BoundThunk {
    kind: ThunkKind,
    entry: CacheEntry,
    invoker: Invoker,
}

/// Receiver class plus the method-table token the binding depends on.
#[derive(Clone)]
pub struct TypeGuard {
    pub class_id: ClassId,
    pub token: Arc<SwitchPoint>,
}

/// Current dispatch behaviour of a call site.
///
/// Guarded entries chain to a fallback; the chain always ends in `Link` or
/// `Megamorphic`.
pub enum Thunk {
    Link,
    Guarded {
        guard: TypeGuard,
        target: Arc<BoundThunk>,
        fallback: Arc<Thunk>,
    },
    Megamorphic,
}

pub enum Dispatch<'a> {
    Bound(&'a Arc<BoundThunk>),
    Link,
    Megamorphic,
}

impl BoundThunk {
    pub fn new(kind: ThunkKind, entry: CacheEntry, invoker: Invoker) -> Self {
        Self {
            kind,
            entry,
            invoker,
        }
    }

    #[inline]
    pub fn invoke(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        block: &Block,
    ) -> CallResult {
        (self.invoker)(ctx, receiver, args, block)
    }

    pub fn kind(&self) -> ThunkKind {
        self.kind
    }

    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }
}

impl fmt::Debug for BoundThunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.kind, self.entry)
    }
}

impl TypeGuard {
    #[inline]
    pub fn test(&self, class_id: ClassId) -> bool {
        self.class_id == class_id && self.token.is_valid()
    }
}

impl Thunk {
    /// First bound entry whose guard passes, or the chain's terminal.
    #[inline]
    pub fn dispatch(&self, class_id: ClassId) -> Dispatch<'_> {
        let mut current = self;
        loop {
            match current {
                Thunk::Guarded {
                    guard,
                    target,
                    fallback,
                } => {
                    if guard.test(class_id) {
                        return Dispatch::Bound(target);
                    }
                    current = fallback;
                }
                Thunk::Link => return Dispatch::Link,
                Thunk::Megamorphic => return Dispatch::Megamorphic,
            }
        }
    }

    /// Guarded entries, most recently linked first.
    pub fn entries(&self) -> Vec<(&TypeGuard, &Arc<BoundThunk>)> {
        let mut entries = Vec::new();
        let mut current = self;
        while let Thunk::Guarded {
            guard,
            target,
            fallback,
        } = current
        {
            entries.push((guard, target));
            current = fallback;
        }
        entries
    }

    pub fn depth(&self) -> usize {
        self.entries().len()
    }

    pub fn kind(&self) -> ThunkKind {
        match self {
            Thunk::Link => ThunkKind::Link,
            Thunk::Guarded { target, .. } => target.kind,
            Thunk::Megamorphic => ThunkKind::Megamorphic,
        }
    }

    /// Chain `entries` in order in front of `terminal`.
    pub fn chain(entries: Vec<(TypeGuard, Arc<BoundThunk>)>, terminal: Arc<Thunk>) -> Arc<Thunk> {
        entries
            .into_iter()
            .rev()
            .fold(terminal, |fallback, (guard, target)| {
                Arc::new(Thunk::Guarded {
                    guard,
                    target,
                    fallback,
                })
            })
    }
}
