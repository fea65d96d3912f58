use std::{
    fmt,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering::Relaxed},
    },
};

use bitflags::bitflags;

use crate::{
    CallResult, DynamicScope, Frame, RaiseError, Signature, StaticScope, ThreadContext, Value,
    check_arity,
};

bitflags! {
    /// What a block body reads from its defining activation, decided by the
    /// compiler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CaptureRequirements: u8 {
        /// self, the defining module or method name beyond plain self
        const FRAME = 1 << 0;
        /// enclosing local variables
        const SCOPE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStrategy {
    FrameAndScope,
    ScopeOnly,
    FrameOnly,
    SelfOnly,
}

/// Captured environment of a block.
#[derive(Debug, Clone)]
pub struct Binding {
    pub self_value: Value,
    pub frame: Option<Frame>,
    pub scope: Option<Arc<DynamicScope>>,
}

pub type BlockFn = fn(&mut ThreadContext, &Binding, &[Value]) -> CallResult;

/// Code of a block, shared by every closure created from it.
pub struct BlockBody {
    entry: BlockFn,
    scope: Arc<StaticScope>,
    requirements: CaptureRequirements,
}

struct BlockInner {
    body: Arc<BlockBody>,
    binding: Binding,
    lambda: bool,
}

/// A closure, or the null block when none was passed.
#[derive(Clone, Default)]
pub struct Block(Option<Arc<BlockInner>>);

/// Closure construction point. The body is built on first use and the
/// capture strategy is decided once from its requirements.
pub struct BlockSite {
    factory: Box<dyn Fn() -> BlockBody + Send + Sync>,
    body: OnceLock<Arc<BlockBody>>,
    strategy: OnceLock<CaptureStrategy>,
    prepared: AtomicU64,
}

impl CaptureStrategy {
    pub fn select(requirements: CaptureRequirements) -> Self {
        let frame = requirements.contains(CaptureRequirements::FRAME);
        let scope = requirements.contains(CaptureRequirements::SCOPE);
        match (frame, scope) {
            (true, true) => CaptureStrategy::FrameAndScope,
            (false, true) => CaptureStrategy::ScopeOnly,
            (true, false) => CaptureStrategy::FrameOnly,
            (false, false) => CaptureStrategy::SelfOnly,
        }
    }

    pub fn captures_frame(self) -> bool {
        matches!(self, CaptureStrategy::FrameAndScope | CaptureStrategy::FrameOnly)
    }

    pub fn captures_scope(self) -> bool {
        matches!(self, CaptureStrategy::FrameAndScope | CaptureStrategy::ScopeOnly)
    }

    pub fn capture(
        self,
        ctx: &ThreadContext,
        self_value: &Value,
        scope: Option<&Arc<DynamicScope>>,
    ) -> Binding {
        Binding {
            self_value: self_value.clone(),
            frame: self.captures_frame().then(|| ctx.current_frame().clone()),
            scope: if self.captures_scope() { scope.cloned() } else { None },
        }
    }
}

impl BlockBody {
    pub fn new(entry: BlockFn, scope: Arc<StaticScope>, requirements: CaptureRequirements) -> Self {
        Self {
            entry,
            scope,
            requirements,
        }
    }

    pub fn scope(&self) -> &Arc<StaticScope> {
        &self.scope
    }

    pub fn signature(&self) -> Signature {
        self.scope.signature()
    }

    pub fn requirements(&self) -> CaptureRequirements {
        self.requirements
    }
}

impl Block {
    pub fn null() -> Self {
        Self(None)
    }

    pub fn new(body: Arc<BlockBody>, binding: Binding) -> Self {
        Self(Some(Arc::new(BlockInner {
            body,
            binding,
            lambda: false,
        })))
    }

    pub fn lambda(body: Arc<BlockBody>, binding: Binding) -> Self {
        Self(Some(Arc::new(BlockInner {
            body,
            binding,
            lambda: true,
        })))
    }

    #[inline]
    pub fn is_given(&self) -> bool {
        self.0.is_some()
    }

    pub fn is_lambda(&self) -> bool {
        self.0.as_ref().is_some_and(|inner| inner.lambda)
    }

    pub fn same_block(&self, other: &Block) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.0.as_ref().map(|inner| &inner.binding)
    }

    pub fn body(&self) -> Option<&Arc<BlockBody>> {
        self.0.as_ref().map(|inner| &inner.body)
    }

    /// Yield to the block. Lambdas check arity strictly, procs pad missing
    /// arguments with nil, drop extras and auto-splat a lone array.
    pub fn call(&self, ctx: &mut ThreadContext, args: &[Value]) -> CallResult {
        let Some(inner) = &self.0 else {
            return Err(RaiseError::LocalJumpError);
        };
        let signature = inner.body.signature();
        if inner.lambda {
            check_arity(&signature, args, false)?;
            return (inner.body.entry)(ctx, &inner.binding, args);
        }
        let args = proc_arguments(&signature, args);
        (inner.body.entry)(ctx, &inner.binding, &args)
    }
}

fn proc_arguments(signature: &Signature, args: &[Value]) -> Vec<Value> {
    let splat = signature.required + signature.optional > 1
        || (signature.rest && signature.required > 0);
    let mut args = match args {
        [Value::Array(values)] if splat => values.to_vec(),
        _ => args.to_vec(),
    };
    if !signature.rest {
        args.truncate(signature.required + signature.optional);
    }
    if args.len() < signature.required {
        args.resize(signature.required, Value::Nil);
    }
    args
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => f.write_str("Block(null)"),
            Some(inner) => write!(
                f,
                "Block({}:{}{})",
                inner.body.scope.file(),
                inner.body.scope.line(),
                if inner.lambda { ", lambda" } else { "" }
            ),
        }
    }
}

impl BlockSite {
    pub fn new(factory: impl Fn() -> BlockBody + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            body: OnceLock::new(),
            strategy: OnceLock::new(),
            prepared: AtomicU64::new(0),
        }
    }

    pub fn body(&self) -> &Arc<BlockBody> {
        self.body.get_or_init(|| Arc::new((self.factory)()))
    }

    pub fn strategy(&self) -> CaptureStrategy {
        *self
            .strategy
            .get_or_init(|| CaptureStrategy::select(self.body().requirements))
    }

    /// Build the closure for one evaluation of the block literal.
    pub fn prepare(
        &self,
        ctx: &ThreadContext,
        self_value: &Value,
        scope: Option<&Arc<DynamicScope>>,
    ) -> Block {
        let strategy = self.strategy();
        if self.prepared.fetch_add(1, Relaxed) == 0 && ctx.runtime().options().log_binding {
            let body = self.body();
            log::info!(
                "block at {}:{} captures {strategy:?}",
                body.scope.file(),
                body.scope.line()
            );
        }
        Block::new(self.body().clone(), strategy.capture(ctx, self_value, scope))
    }

    pub fn prepared(&self) -> u64 {
        self.prepared.load(Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Runtime, RuntimeCreateInfo, ScopeKind};

    fn args_as_array(_ctx: &mut ThreadContext, _binding: &Binding, args: &[Value]) -> CallResult {
        Ok(Value::array(args.to_vec()))
    }

    fn captured_scope(_ctx: &mut ThreadContext, binding: &Binding, _args: &[Value]) -> CallResult {
        Ok(Value::from_bool(binding.scope.is_some()))
    }

    fn body(signature: Signature, requirements: CaptureRequirements) -> Arc<BlockBody> {
        let scope = StaticScope::new(ScopeKind::Block, Vec::new(), None).with_signature(signature);
        Arc::new(BlockBody::new(args_as_array, Arc::new(scope), requirements))
    }

    #[test]
    fn strategy_follows_requirements() {
        use CaptureRequirements as R;
        assert_eq!(CaptureStrategy::select(R::FRAME | R::SCOPE), CaptureStrategy::FrameAndScope);
        assert_eq!(CaptureStrategy::select(R::SCOPE), CaptureStrategy::ScopeOnly);
        assert_eq!(CaptureStrategy::select(R::FRAME), CaptureStrategy::FrameOnly);
        assert_eq!(CaptureStrategy::select(R::empty()), CaptureStrategy::SelfOnly);
    }

    #[test]
    fn yielding_to_the_null_block_raises() {
        let runtime = Runtime::new(RuntimeCreateInfo::default());
        let mut ctx = runtime.new_context();
        assert_eq!(
            Block::null().call(&mut ctx, &[]).unwrap_err(),
            RaiseError::LocalJumpError
        );
        assert!(Block::null().same_block(&Block::default()));
    }

    #[test]
    fn procs_are_lenient_and_lambdas_are_strict() {
        let runtime = Runtime::new(RuntimeCreateInfo::default());
        let mut ctx = runtime.new_context();
        let body = body(Signature::required(2), CaptureRequirements::empty());
        let binding = Binding {
            self_value: Value::Nil,
            frame: None,
            scope: None,
        };

        let proc = Block::new(body.clone(), binding.clone());
        assert_eq!(
            proc.call(&mut ctx, &[Value::Fixnum(1)]).unwrap(),
            Value::array(vec![Value::Fixnum(1), Value::Nil])
        );
        assert_eq!(
            proc.call(&mut ctx, &[Value::array(vec![Value::Fixnum(1), Value::Fixnum(2)])])
                .unwrap(),
            Value::array(vec![Value::Fixnum(1), Value::Fixnum(2)]),
            "a lone array is splatted"
        );

        let lambda = Block::lambda(body, binding);
        assert!(lambda.call(&mut ctx, &[Value::Fixnum(1)]).unwrap_err().is_argument_error());
        assert!(lambda.is_lambda());
    }

    #[test]
    fn block_site_builds_the_body_once_and_captures_per_strategy() {
        let runtime = Runtime::new(RuntimeCreateInfo::default());
        let ctx = runtime.new_context();
        let static_scope = Arc::new(StaticScope::new(ScopeKind::Method, Vec::new(), None));
        let scope = DynamicScope::new(static_scope.clone(), None);

        let site = BlockSite::new(move || {
            BlockBody::new(captured_scope, static_scope.clone(), CaptureRequirements::FRAME)
        });
        let first = site.prepare(&ctx, &Value::Fixnum(7), Some(&scope));
        let second = site.prepare(&ctx, &Value::Fixnum(7), Some(&scope));

        assert!(Arc::ptr_eq(first.body().unwrap(), second.body().unwrap()));
        assert!(!first.same_block(&second), "each evaluation is a new closure");
        assert_eq!(site.strategy(), CaptureStrategy::FrameOnly);
        let binding = first.binding().unwrap();
        assert!(binding.frame.is_some());
        assert!(binding.scope.is_none(), "scope is not captured for FrameOnly");
        assert_eq!(binding.self_value, Value::Fixnum(7));
        assert_eq!(site.prepared(), 2);
    }
}
