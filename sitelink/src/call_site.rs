use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering::Relaxed},
    },
};

use crate::{
    Block, BoundThunk, CacheEntry, CallResult, Dispatch, DispatchCell, DynamicMethod,
    LookupResult, MissingReason, Runtime, Symbol, ThreadContext, Thunk, ThunkKind, TypeGuard,
    TypeRef, Value, Visibility, generic_thunk, method_missing_thunk, missing_arguments,
    specialize,
};

/// Static shape of a call, fixed when the site is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallShape {
    /// `-1` when arguments arrive as one splatted list
    pub arg_count: i32,
    pub has_block: bool,
    /// no explicit receiver
    pub is_functional: bool,
    pub receiver_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    /// `recv.foo`
    Normal,
    /// `foo()`, may call private methods
    Functional,
    /// bare `foo` that could have been a local
    Variable,
}

/// One dynamic send in generated code.
pub struct CallSite {
    name: Symbol,
    shape: CallShape,
    call_type: CallType,
    link: Arc<Thunk>,
    target: DispatchCell<Thunk>,
    failures: AtomicU32,
    links: AtomicU64,
}

enum Step {
    Invoke(Arc<BoundThunk>),
    Link,
    Uncached,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteStats {
    pub links: u64,
    pub failures: u32,
    /// receiver types currently chained
    pub depth: usize,
    pub kind: ThunkKind,
}

impl CallShape {
    pub const fn fixed(arg_count: usize) -> Self {
        Self {
            arg_count: arg_count as i32,
            has_block: false,
            is_functional: false,
            receiver_offset: 0,
        }
    }

    pub const fn variadic() -> Self {
        Self {
            arg_count: -1,
            has_block: false,
            is_functional: false,
            receiver_offset: 0,
        }
    }

    pub const fn with_block(self) -> Self {
        Self {
            has_block: true,
            ..self
        }
    }
}

impl CallSite {
    pub fn new(name: Symbol, shape: CallShape, call_type: CallType) -> Self {
        let shape = CallShape {
            is_functional: call_type != CallType::Normal,
            ..shape
        };
        let link = Arc::new(Thunk::Link);
        Self {
            name,
            shape,
            call_type,
            target: DispatchCell::new(link.clone()),
            link,
            failures: AtomicU32::new(0),
            links: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &Symbol {
        &self.name
    }

    pub fn shape(&self) -> &CallShape {
        &self.shape
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    /// Invoke the site. Links on first use and after invalidation.
    pub fn call(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        block: &Block,
    ) -> CallResult {
        debug_assert!(
            self.shape.arg_count < 0 || args.len() == self.shape.arg_count as usize,
            "{self} called with {} arguments",
            args.len()
        );
        let class_id = ctx.runtime().type_of(receiver).id();
        // the pin only covers the chain walk, so stores made while linking
        // or from inside the callee can reclaim replaced chains
        let step = self.target.with(|thunk| match thunk.dispatch(class_id) {
            Dispatch::Bound(bound) => Step::Invoke(bound.clone()),
            Dispatch::Link => Step::Link,
            Dispatch::Megamorphic => Step::Uncached,
        });
        match step {
            Step::Invoke(bound) => bound.invoke(ctx, receiver, args, block),
            Step::Link => self.link(ctx, receiver, args, block),
            Step::Uncached => {
                invoke_uncached(ctx, &self.name, self.call_type, receiver, args, block)
            }
        }
    }

    fn link(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        args: &[Value],
        block: &Block,
    ) -> CallResult {
        let current = self.target.load();
        let runtime = ctx.runtime().clone();
        let options = runtime.options();
        let receiver_type = runtime.type_of(receiver).clone();

        if self.links.fetch_add(1, Relaxed) > 0 {
            let failures = self.failures.fetch_add(1, Relaxed) + 1;
            if failures > options.max_fail {
                if options.log_binding {
                    log::info!("{self}\tmegamorphic after {failures} relinks, no longer caching");
                }
                self.target.store(Arc::new(Thunk::Megamorphic));
                return invoke_uncached(ctx, &self.name, self.call_type, receiver, args, block);
            }
        }

        let Some((guard, bound)) = self.bind(&runtime, &receiver_type) else {
            // no method_missing anywhere, nothing worth caching
            return invoke_uncached(ctx, &self.name, self.call_type, receiver, args, block);
        };

        let mut entries: Vec<_> = current
            .entries()
            .into_iter()
            .filter(|(other, _)| other.class_id != guard.class_id && other.token.is_valid())
            .map(|(other, target)| (other.clone(), target.clone()))
            .collect();
        if entries.len() >= options.max_poly {
            if options.log_binding {
                log::info!(
                    "{self}\tmore than {} receiver types, restarting chain",
                    options.max_poly
                );
            }
            entries.clear();
        }
        entries.insert(0, (guard, bound.clone()));
        self.target.store(Thunk::chain(entries, self.link.clone()));

        bound.invoke(ctx, receiver, args, block)
    }

    fn bind(
        &self,
        runtime: &Runtime,
        receiver_type: &TypeRef,
    ) -> Option<(TypeGuard, Arc<BoundThunk>)> {
        let options = runtime.options();
        let lookup = runtime.lookup(receiver_type, &self.name);
        let guard = TypeGuard {
            class_id: receiver_type.id(),
            token: lookup.token().clone(),
        };

        let bound = match lookup {
            LookupResult::Found(entry) if is_callable(&entry.method, self.call_type) => {
                match specialize(&self.name, &self.shape, receiver_type, &entry, options) {
                    Some(bound) => {
                        if options.log_binding {
                            log::info!("{self}\tbound {:?} {entry}", bound.kind());
                        }
                        bound
                    }
                    None => {
                        self.failures.fetch_add(1, Relaxed);
                        if options.log_binding {
                            log::info!(
                                "{self}\tfalling back to generic for {} {entry}",
                                entry.method.implementation().kind_name()
                            );
                        }
                        generic_thunk(&self.name, &entry)
                    }
                }
            }
            other => {
                let found = other.found();
                let reason = missing_reason(self.call_type, found.as_ref());
                let handler = runtime
                    .lookup(receiver_type, runtime.method_missing_name())
                    .found()?;
                if options.log_binding {
                    log::info!(
                        "{self}\t{:?} on {}, bound method_missing {handler}",
                        reason,
                        receiver_type.name()
                    );
                }
                method_missing_thunk(&self.name, reason, &handler)
            }
        };
        Some((guard, Arc::new(bound)))
    }

    /// Identity of the installed target; unchanged while the site stays
    /// linked.
    pub fn target_id(&self) -> usize {
        self.target.target_id()
    }

    pub fn target_kind(&self) -> ThunkKind {
        self.target.with(Thunk::kind)
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Relaxed)
    }

    pub fn is_megamorphic(&self) -> bool {
        self.target_kind() == ThunkKind::Megamorphic
    }

    pub fn stats(&self) -> SiteStats {
        let (depth, kind) = self.target.with(|thunk| (thunk.depth(), thunk.kind()));
        SiteStats {
            links: self.links.load(Relaxed),
            failures: self.failures(),
            depth,
            kind,
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shape.arg_count {
            -1 => write!(f, "{}(*)", self.name),
            n => write!(f, "{}({n})", self.name),
        }
    }
}

fn is_callable(method: &DynamicMethod, call_type: CallType) -> bool {
    method.visibility() == Visibility::Public || call_type != CallType::Normal
}

fn missing_reason(call_type: CallType, found: Option<&CacheEntry>) -> MissingReason {
    match (found, call_type) {
        (Some(_), _) => MissingReason::Private,
        (None, CallType::Variable) => MissingReason::Variable,
        (None, CallType::Functional) => MissingReason::Functional,
        (None, CallType::Normal) => MissingReason::Normal,
    }
}

/// The fully generic send: look up on every call, no caching.
pub fn invoke_uncached(
    ctx: &mut ThreadContext,
    name: &Symbol,
    call_type: CallType,
    receiver: &Value,
    args: &[Value],
    block: &Block,
) -> CallResult {
    let runtime = ctx.runtime().clone();
    let receiver_type = runtime.type_of(receiver);
    match runtime.lookup(receiver_type, name).found() {
        Some(entry) if is_callable(&entry.method, call_type) => {
            entry
                .method
                .call(ctx, receiver, &entry.source_module, name, args, block)
        }
        found => {
            let reason = missing_reason(call_type, found.as_ref());
            let args = missing_arguments(name, args);
            ctx.set_missing_reason(reason);
            match runtime
                .lookup(receiver_type, runtime.method_missing_name())
                .found()
            {
                Some(handler) => handler.method.call(
                    ctx,
                    receiver,
                    &handler.source_module,
                    handler.method.name(),
                    &args,
                    block,
                ),
                None => ctx.raise_missing(receiver, &args),
            }
        }
    }
}
