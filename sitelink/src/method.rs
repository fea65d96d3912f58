use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering::Relaxed},
    },
};

use parking_lot::RwLock;

use crate::{
    Block, CallInfo, CallResult, Frame, RaiseError, Signature, StaticScope, Symbol,
    ThreadContext, TypeRef, Value, VariableAccessor, check_arity, check_arity_specific_args,
};

/// arities `0..SPECIFIC_ARITIES` may carry a dedicated entry point
pub const SPECIFIC_ARITIES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

/// A method as stored in a method table.
pub struct DynamicMethod {
    serial: u64,
    name: Symbol,
    visibility: Visibility,
    implementation: MethodImpl,
}

/// How a resolved method executes.
pub enum MethodImpl {
    Native(NativeMethod),
    Compiled(Arc<CompiledMethod>),
    MixedMode(MixedModeMethod),
    Handle(HandleMethod),
    AttrReader(AttrMethod),
    AttrWriter(AttrMethod),
    /// tombstone left by `undef`, lookup treats it as missing
    Undefined,
}

// -- native primitives --------------------------------------------------

pub type NativeFn = fn(NativeCall<'_>) -> CallResult;

/// Arguments handed to a native primitive. `context` and `block` are only
/// present when the primitive declares it wants them.
pub struct NativeCall<'a> {
    pub context: Option<&'a mut ThreadContext>,
    pub receiver: &'a Value,
    pub args: &'a [Value],
    pub block: Option<&'a Block>,
}

/// Declared parameters of a native primitive, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeParam {
    Context,
    /// explicit self, only for static primitives
    Receiver,
    Value,
    /// all positional arguments as one list
    Values,
    Block,
}

#[derive(Clone, Copy)]
pub struct NativeMethod {
    function: NativeFn,
    params: &'static [NativeParam],
    is_static: bool,
    frame: bool,
    signature: Signature,
}

// -- compiled bodies ----------------------------------------------------

pub type CompiledFn = fn(&mut ThreadContext, CompiledFrame<'_>) -> CallResult;

pub struct CompiledFrame<'a> {
    pub scope: &'a Arc<StaticScope>,
    pub receiver: &'a Value,
    pub args: &'a [Value],
    pub block: &'a Block,
    pub module: &'a TypeRef,
    pub name: &'a Symbol,
}

pub struct CompiledMethod {
    entry: CompiledFn,
    specific: [Option<CompiledFn>; SPECIFIC_ARITIES],
    scope: Arc<StaticScope>,
    wants_block: bool,
}

/// Interpreted until promoted, then runs the compiled body.
pub struct MixedModeMethod {
    interpreted: Arc<CompiledMethod>,
    jitted: RwLock<Option<Arc<CompiledMethod>>>,
}

// -- handle table -------------------------------------------------------

pub type HandleFn = fn(&mut ThreadContext, &Value, &[Value], &Block) -> CallResult;

/// Primitive with one entry per small arity plus an optional catch-all.
#[derive(Clone, Copy)]
pub struct HandleMethod {
    handles: [Option<HandleFn>; SPECIFIC_ARITIES],
    variadic: Option<HandleFn>,
    signature: Signature,
}

// -- attributes ---------------------------------------------------------

pub struct AttrMethod {
    variable: Symbol,
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

impl DynamicMethod {
    pub fn new(name: Symbol, visibility: Visibility, implementation: MethodImpl) -> Self {
        Self {
            serial: NEXT_SERIAL.fetch_add(1, Relaxed),
            name,
            visibility,
            implementation,
        }
    }

    pub fn native(name: Symbol, native: NativeMethod) -> Self {
        Self::new(name, Visibility::Public, MethodImpl::Native(native))
    }

    pub fn compiled(name: Symbol, compiled: CompiledMethod) -> Self {
        Self::new(
            name,
            Visibility::Public,
            MethodImpl::Compiled(Arc::new(compiled)),
        )
    }

    pub fn attr_reader(name: Symbol, variable: Symbol) -> Self {
        Self::new(
            name,
            Visibility::Public,
            MethodImpl::AttrReader(AttrMethod::new(variable)),
        )
    }

    pub fn attr_writer(name: Symbol, variable: Symbol) -> Self {
        Self::new(
            name,
            Visibility::Public,
            MethodImpl::AttrWriter(AttrMethod::new(variable)),
        )
    }

    pub fn private(mut self) -> Self {
        self.visibility = Visibility::Private;
        self
    }

    /// Unique per definition; used only to identify methods in logs.
    #[inline]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn name(&self) -> &Symbol {
        &self.name
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn implementation(&self) -> &MethodImpl {
        &self.implementation
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.implementation, MethodImpl::Undefined)
    }

    /// The fully generic calling convention. Every bound thunk must behave
    /// exactly like this, errors included.
    pub fn call(
        &self,
        ctx: &mut ThreadContext,
        receiver: &Value,
        module: &TypeRef,
        name: &Symbol,
        args: &[Value],
        block: &Block,
    ) -> CallResult {
        match &self.implementation {
            MethodImpl::Native(native) => {
                call_native(ctx, native, receiver, module, name, args, block)
            }
            MethodImpl::Compiled(compiled) => {
                invoke_compiled(ctx, compiled, receiver, module, name, args, block)
            }
            MethodImpl::MixedMode(mixed) => {
                invoke_compiled(ctx, &mixed.active(), receiver, module, name, args, block)
            }
            MethodImpl::Handle(handle) => invoke_handle(ctx, handle, receiver, args, block),
            MethodImpl::AttrReader(attr) => {
                ctx.take_call_info();
                check_arity_specific_args(&Signature::NO_ARGUMENTS, args.len())?;
                Ok(attr.read(receiver))
            }
            MethodImpl::AttrWriter(attr) => {
                ctx.take_call_info();
                check_arity_specific_args(&Signature::ONE_ARGUMENT, args.len())?;
                attr.write(receiver, args[0].clone())
            }
            MethodImpl::Undefined => Err(RaiseError::NoMethodError {
                name: name.to_string(),
                receiver: ctx.runtime().describe(receiver),
            }),
        }
    }
}

impl fmt::Debug for DynamicMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.serial, self.name)
    }
}

impl MethodImpl {
    pub fn kind_name(&self) -> &'static str {
        match self {
            MethodImpl::Native(_) => "native",
            MethodImpl::Compiled(_) => "compiled",
            MethodImpl::MixedMode(_) => "mixed",
            MethodImpl::Handle(_) => "handle",
            MethodImpl::AttrReader(_) => "attr-reader",
            MethodImpl::AttrWriter(_) => "attr-writer",
            MethodImpl::Undefined => "undefined",
        }
    }
}

/// Positional argument count a native parameter list binds to, `-1` when it
/// takes a single argument list. `None` for lists no call shape can fit.
pub fn native_arg_count(params: &[NativeParam], is_static: bool) -> Option<i32> {
    let mut params = params;
    if let [NativeParam::Context, rest @ ..] = params {
        params = rest;
    }
    if is_static {
        match params {
            [NativeParam::Receiver, rest @ ..] => params = rest,
            _ => return None,
        }
    }
    if let [rest @ .., NativeParam::Block] = params {
        params = rest;
    }
    match params {
        [NativeParam::Values] => Some(-1),
        _ if params.iter().all(|param| *param == NativeParam::Value) => Some(params.len() as i32),
        _ => None,
    }
}

impl NativeMethod {
    pub fn new(function: NativeFn, params: &'static [NativeParam]) -> Self {
        let signature = match native_arg_count(params, false) {
            Some(count) if count >= 0 => Signature::required(count as usize),
            _ => Signature::ANY,
        };
        Self {
            function,
            params,
            is_static: false,
            frame: false,
            signature,
        }
    }

    /// self arrives as an explicit `Receiver` parameter
    pub fn static_method(mut self) -> Self {
        self.is_static = true;
        if let Some(count) = self.arity().filter(|count| *count >= 0) {
            self.signature = Signature::required(count as usize);
        }
        self
    }

    /// run inside a pushed frame
    pub fn with_frame(mut self) -> Self {
        self.frame = true;
        self
    }

    /// Minimum counts for primitives taking `Values`.
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }

    pub fn arity(&self) -> Option<i32> {
        native_arg_count(self.params, self.is_static)
    }

    pub fn wants_context(&self) -> bool {
        self.params.first() == Some(&NativeParam::Context)
    }

    pub fn wants_block(&self) -> bool {
        self.params.last() == Some(&NativeParam::Block)
    }

    pub fn needs_frame(&self) -> bool {
        self.frame
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

/// Run a native primitive without checking arity.
pub fn invoke_native(
    ctx: &mut ThreadContext,
    native: &NativeMethod,
    receiver: &Value,
    module: &TypeRef,
    name: &Symbol,
    args: &[Value],
    block: &Block,
) -> CallResult {
    ctx.take_call_info();
    if native.frame {
        ctx.push_frame(Frame::new(receiver.clone(), module.clone(), name.clone()));
    }
    let call = NativeCall {
        context: if native.wants_context() { Some(&mut *ctx) } else { None },
        receiver,
        args,
        block: native.wants_block().then_some(block),
    };
    let result = (native.function)(call);
    if native.frame {
        ctx.pop_frame();
    }
    result
}

/// Arity checked native call, the generic path.
pub fn call_native(
    ctx: &mut ThreadContext,
    native: &NativeMethod,
    receiver: &Value,
    module: &TypeRef,
    name: &Symbol,
    args: &[Value],
    block: &Block,
) -> CallResult {
    let info = ctx.take_call_info();
    check_arity(&native.signature, args, info.contains(CallInfo::KWARGS))?;
    invoke_native(ctx, native, receiver, module, name, args, block)
}

impl CompiledMethod {
    pub fn new(entry: CompiledFn, scope: Arc<StaticScope>) -> Self {
        Self {
            entry,
            specific: [None; SPECIFIC_ARITIES],
            scope,
            wants_block: true,
        }
    }

    /// Add an entry compiled for exactly `arity` arguments.
    pub fn with_specific(mut self, arity: usize, entry: CompiledFn) -> Self {
        if arity < SPECIFIC_ARITIES && self.signature().accepts(arity) {
            self.specific[arity] = Some(entry);
        } else {
            log::warn!(
                "ignoring specific entry for arity {arity}, signature expects {}",
                self.signature().expected()
            );
        }
        self
    }

    /// body never yields, the caller's block is dropped
    pub fn without_block(mut self) -> Self {
        self.wants_block = false;
        self
    }

    pub fn entry(&self) -> CompiledFn {
        self.entry
    }

    pub fn specific(&self, arity: usize) -> Option<CompiledFn> {
        self.specific.get(arity).copied().flatten()
    }

    pub fn scope(&self) -> &Arc<StaticScope> {
        &self.scope
    }

    pub fn signature(&self) -> Signature {
        self.scope.signature()
    }

    pub fn wants_block(&self) -> bool {
        self.wants_block
    }
}

/// Check arity against the general entry and run it.
pub fn invoke_compiled(
    ctx: &mut ThreadContext,
    method: &CompiledMethod,
    receiver: &Value,
    module: &TypeRef,
    name: &Symbol,
    args: &[Value],
    block: &Block,
) -> CallResult {
    let info = ctx.take_call_info();
    check_arity(&method.signature(), args, info.contains(CallInfo::KWARGS))?;
    enter_compiled(ctx, method, method.entry, receiver, module, name, args, block)
}

/// Run `entry` in a fresh frame. Arity must already be known to fit.
#[allow(clippy::too_many_arguments)]
pub fn enter_compiled(
    ctx: &mut ThreadContext,
    method: &CompiledMethod,
    entry: CompiledFn,
    receiver: &Value,
    module: &TypeRef,
    name: &Symbol,
    args: &[Value],
    block: &Block,
) -> CallResult {
    let null = Block::null();
    let block = if method.wants_block { block } else { &null };
    ctx.push_frame(Frame::new(receiver.clone(), module.clone(), name.clone()));
    let result = entry(
        ctx,
        CompiledFrame {
            scope: &method.scope,
            receiver,
            args,
            block,
            module,
            name,
        },
    );
    ctx.pop_frame();
    result
}

impl MixedModeMethod {
    pub fn new(interpreted: CompiledMethod) -> Self {
        Self {
            interpreted: Arc::new(interpreted),
            jitted: RwLock::new(None),
        }
    }

    pub fn active(&self) -> Arc<CompiledMethod> {
        match &*self.jitted.read() {
            Some(jitted) => jitted.clone(),
            None => self.interpreted.clone(),
        }
    }

    pub fn jitted(&self) -> Option<Arc<CompiledMethod>> {
        self.jitted.read().clone()
    }

    /// Use `Type::jit_method` so dependent call sites see the change.
    pub(crate) fn promote(&self, compiled: Arc<CompiledMethod>) {
        *self.jitted.write() = Some(compiled);
    }
}

impl HandleMethod {
    pub fn new(signature: Signature) -> Self {
        Self {
            handles: [None; SPECIFIC_ARITIES],
            variadic: None,
            signature,
        }
    }

    pub fn with_arity(mut self, arity: usize, handle: HandleFn) -> Self {
        if arity < SPECIFIC_ARITIES {
            self.handles[arity] = Some(handle);
        }
        self
    }

    pub fn with_variadic(mut self, handle: HandleFn) -> Self {
        self.variadic = Some(handle);
        self
    }

    pub fn handle(&self, arity: usize) -> Option<HandleFn> {
        self.handles.get(arity).copied().flatten()
    }

    pub fn variadic(&self) -> Option<HandleFn> {
        self.variadic
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

pub fn invoke_handle(
    ctx: &mut ThreadContext,
    method: &HandleMethod,
    receiver: &Value,
    args: &[Value],
    block: &Block,
) -> CallResult {
    ctx.take_call_info();
    if let Some(handle) = method.handle(args.len()) {
        return handle(ctx, receiver, args, block);
    }
    match method.variadic {
        Some(handle) => {
            check_arity_specific_args(&method.signature, args.len())?;
            handle(ctx, receiver, args, block)
        }
        None => Err(RaiseError::argument_count(
            args.len(),
            method.signature.expected(),
        )),
    }
}

impl AttrMethod {
    pub fn new(variable: Symbol) -> Self {
        Self { variable }
    }

    pub fn variable(&self) -> &Symbol {
        &self.variable
    }

    pub fn read(&self, receiver: &Value) -> Value {
        match receiver.as_object() {
            Some(object) => {
                let accessor = object.type_ref().variable_accessor_for_read(&self.variable);
                read_variable(&accessor, receiver)
            }
            None => Value::Nil,
        }
    }

    pub fn write(&self, receiver: &Value, value: Value) -> CallResult {
        match receiver.as_object() {
            Some(object) => {
                let accessor = object.type_ref().variable_accessor_for_write(&self.variable);
                write_variable(&accessor, receiver, value)
            }
            None => Err(cannot_set_variable(&self.variable, receiver)),
        }
    }
}

/// Read through a resolved accessor; unassigned reads as nil.
#[inline]
pub fn read_variable(accessor: &VariableAccessor, receiver: &Value) -> Value {
    receiver
        .as_object()
        .and_then(|object| accessor.get(object))
        .unwrap_or(Value::Nil)
}

#[inline]
pub fn write_variable(accessor: &VariableAccessor, receiver: &Value, value: Value) -> CallResult {
    match receiver.as_object() {
        Some(object) => {
            accessor.set(object, value.clone());
            Ok(value)
        }
        None => Err(cannot_set_variable(
            match accessor {
                VariableAccessor::Dictionary { name } => name.as_str(),
                VariableAccessor::Field { .. } => "instance variable",
            },
            receiver,
        )),
    }
}

fn cannot_set_variable(variable: impl fmt::Display, receiver: &Value) -> RaiseError {
    RaiseError::TypeError(format!("can't set {variable} on {receiver}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_arity_strips_context_receiver_and_block() {
        use NativeParam::*;
        assert_eq!(native_arg_count(&[], false), Some(0));
        assert_eq!(native_arg_count(&[Context, Value, Block], false), Some(1));
        assert_eq!(native_arg_count(&[Context, Receiver, Value, Value], true), Some(2));
        assert_eq!(native_arg_count(&[Values], false), Some(-1));
        assert_eq!(native_arg_count(&[Context, Values, Block], false), Some(-1));
        assert_eq!(
            native_arg_count(&[Value], true),
            None,
            "static primitives must declare their receiver"
        );
        assert_eq!(native_arg_count(&[Value, Values], false), None);
    }

    fn noop(_call: NativeCall<'_>) -> CallResult {
        Ok(crate::Value::Nil)
    }

    #[test]
    fn native_descriptor_flags() {
        use NativeParam::*;
        let native = NativeMethod::new(noop, &[Context, Value, Block]).with_frame();
        assert!(native.wants_context());
        assert!(native.wants_block());
        assert!(native.needs_frame());
        assert_eq!(native.signature(), &Signature::required(1));

        let variadic = NativeMethod::new(noop, &[Values]).with_signature(Signature::rest(1));
        assert_eq!(variadic.arity(), Some(-1));
        assert!(!variadic.wants_context());
        assert_eq!(variadic.signature().expected(), "1+");
    }

    #[test]
    fn method_serials_are_unique() {
        let symbols = crate::SymbolTable::new();
        let a = DynamicMethod::native(symbols.intern("a"), NativeMethod::new(noop, &[]));
        let b = DynamicMethod::native(symbols.intern("a"), NativeMethod::new(noop, &[]));
        assert_ne!(a.serial(), b.serial());
        assert_eq!(a.visibility(), Visibility::Public);
        assert_eq!(a.private().visibility(), Visibility::Private);
    }
}
