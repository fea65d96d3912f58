use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering::Relaxed},
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    CallResult, ContextId, Coverage, CoverageMode, DynamicMethod, GlobalVariables,
    HierarchyLookup, Invalidator, InvalidatorKind, LinkerOptions, LookupResult, MethodLookup,
    NativeCall, NativeMethod, NativeParam, Object, RaiseError, SwitchPoint, Symbol, SymbolTable,
    ThreadContext, Type, TypeRef, Value,
};

/// Classes every runtime starts with.
#[derive(Debug)]
pub struct Builtins {
    pub basic_object: TypeRef,
    pub object: TypeRef,
    pub class: TypeRef,
    pub nil: TypeRef,
    pub true_class: TypeRef,
    pub false_class: TypeRef,
    pub integer: TypeRef,
    pub symbol: TypeRef,
    pub string: TypeRef,
    pub array: TypeRef,
    pub hash: TypeRef,
    pub proc: TypeRef,
}

/// Process wide state shared by every thread context.
pub struct Runtime {
    options: LinkerOptions,
    lookup: Box<dyn MethodLookup>,
    symbols: SymbolTable,
    globals: GlobalVariables,
    coverage: Option<Coverage>,
    builtins: Builtins,
    classes: RwLock<HashMap<String, TypeRef>>,
    checkpoint: Invalidator,
    interrupts: Mutex<HashMap<ContextId, VecDeque<RaiseError>>>,
    next_context: AtomicU64,
    method_missing: Symbol,
}

#[derive(Default)]
pub struct RuntimeCreateInfo {
    pub options: LinkerOptions,
    /// defaults to [`HierarchyLookup`]
    pub lookup: Option<Box<dyn MethodLookup>>,
    pub coverage: CoverageMode,
}

fn default_method_missing(call: NativeCall<'_>) -> CallResult {
    let Some(ctx) = call.context else {
        return Err(RaiseError::TypeError(
            "method_missing called without a thread context".into(),
        ));
    };
    ctx.raise_missing(call.receiver, call.args)
}

impl Builtins {
    fn new() -> Self {
        let basic_object = Type::new("BasicObject", None);
        let object = Type::new("Object", Some(basic_object.clone()));
        let subclass = |name: &str| Type::new(name, Some(object.clone()));
        Self {
            class: subclass("Class"),
            nil: subclass("NilClass"),
            true_class: subclass("TrueClass"),
            false_class: subclass("FalseClass"),
            integer: subclass("Integer"),
            symbol: subclass("Symbol"),
            string: subclass("String"),
            array: subclass("Array"),
            hash: subclass("Hash"),
            proc: subclass("Proc"),
            basic_object,
            object,
        }
    }

    fn all(&self) -> [&TypeRef; 12] {
        [
            &self.basic_object,
            &self.object,
            &self.class,
            &self.nil,
            &self.true_class,
            &self.false_class,
            &self.integer,
            &self.symbol,
            &self.string,
            &self.array,
            &self.hash,
            &self.proc,
        ]
    }
}

impl Runtime {
    pub fn new(info: RuntimeCreateInfo) -> Arc<Self> {
        let symbols = SymbolTable::new();
        let globals = GlobalVariables::new(&symbols);
        let method_missing = symbols.intern("method_missing");
        let builtins = Builtins::new();

        builtins.basic_object.define_method(
            DynamicMethod::native(
                method_missing.clone(),
                NativeMethod::new(
                    default_method_missing,
                    &[NativeParam::Context, NativeParam::Values],
                ),
            )
            .private(),
        );
        let classes = builtins
            .all()
            .into_iter()
            .map(|ty| (ty.name().to_string(), ty.clone()))
            .collect();

        let coverage = match info.coverage {
            CoverageMode::Disabled => None,
            CoverageMode::Lines => Some(Coverage::new(false)),
            CoverageMode::OneShot => Some(Coverage::new(true)),
        };
        log::debug!("runtime created with {:?}", info.options);

        Arc::new(Self {
            options: info.options,
            lookup: info.lookup.unwrap_or_else(|| Box::new(HierarchyLookup)),
            symbols,
            globals,
            coverage,
            builtins,
            classes: RwLock::new(classes),
            checkpoint: Invalidator::new(InvalidatorKind::Checkpoint),
            interrupts: Mutex::new(HashMap::new()),
            next_context: AtomicU64::new(0),
            method_missing,
        })
    }

    pub fn new_context(self: &Arc<Self>) -> ThreadContext {
        let id = ContextId(self.next_context.fetch_add(1, Relaxed));
        self.interrupts.lock().insert(id, VecDeque::new());
        ThreadContext::new(id, self.clone())
    }

    #[inline]
    pub fn options(&self) -> &LinkerOptions {
        &self.options
    }

    pub fn symbol(&self, name: &str) -> Symbol {
        self.symbols.intern(name)
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn method_missing_name(&self) -> &Symbol {
        &self.method_missing
    }

    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    pub fn object_class(&self) -> &TypeRef {
        &self.builtins.object
    }

    pub fn integer_class(&self) -> &TypeRef {
        &self.builtins.integer
    }

    /// Open `name`, creating it under `parent` (default `Object`) if new.
    pub fn define_class(&self, name: &str, parent: Option<&TypeRef>) -> TypeRef {
        self.define_class_with_fields(name, parent, crate::DEFAULT_FIELD_CAPACITY)
    }

    pub fn define_class_with_fields(
        &self,
        name: &str,
        parent: Option<&TypeRef>,
        field_capacity: usize,
    ) -> TypeRef {
        let mut classes = self.classes.write();
        if let Some(existing) = classes.get(name) {
            return existing.clone();
        }
        let parent = parent.unwrap_or(&self.builtins.object).clone();
        let ty = Type::with_field_capacity(name, Some(parent), field_capacity);
        classes.insert(name.to_string(), ty.clone());
        ty
    }

    pub fn class(&self, name: &str) -> Option<TypeRef> {
        self.classes.read().get(name).cloned()
    }

    pub fn new_object(&self, ty: &TypeRef) -> Value {
        Value::Object(Arc::new(Object::new(ty.clone())))
    }

    #[inline]
    pub fn type_of<'a>(&'a self, value: &'a Value) -> &'a TypeRef {
        let builtins = &self.builtins;
        match value {
            Value::Nil => &builtins.nil,
            Value::True => &builtins.true_class,
            Value::False => &builtins.false_class,
            Value::Fixnum(_) => &builtins.integer,
            Value::Symbol(_) => &builtins.symbol,
            Value::String(_) => &builtins.string,
            Value::Array(_) => &builtins.array,
            Value::Hash(_) => &builtins.hash,
            Value::Object(object) => object.type_ref(),
            Value::Class(_) => &builtins.class,
            Value::Proc(_) => &builtins.proc,
        }
    }

    pub fn lookup(&self, ty: &TypeRef, name: &Symbol) -> LookupResult {
        self.lookup.lookup(ty, name)
    }

    /// Receiver as named in error messages.
    pub fn describe(&self, value: &Value) -> String {
        match value {
            Value::Nil => "nil".into(),
            Value::True => "true".into(),
            Value::False => "false".into(),
            Value::Class(ty) => format!("class {}", ty.name()),
            other => format!("an instance of {}", self.type_of(other).name()),
        }
    }

    pub fn globals(&self) -> &GlobalVariables {
        &self.globals
    }

    pub fn coverage(&self) -> Option<&Coverage> {
        self.coverage.as_ref()
    }

    pub fn checkpoint_switch_point(&self) -> Arc<SwitchPoint> {
        self.checkpoint.switch_point()
    }

    /// Make every checkpoint site take its slow path once.
    pub fn request_safepoint(&self) {
        self.checkpoint.invalidate();
    }

    /// Raise `error` in context `target` at its next safepoint. Interrupts
    /// for a context that is already gone are dropped.
    pub fn interrupt(&self, target: ContextId, error: RaiseError) {
        match self.interrupts.lock().get_mut(&target) {
            Some(queue) => {
                log::debug!("interrupting {target:?} with {error}");
                queue.push_back(error);
            }
            None => {
                log::debug!("{target:?} is gone, dropping {error}");
                return;
            }
        }
        self.request_safepoint();
    }

    /// Next error queued for `target`. While another live context still has
    /// errors queued the safepoint stays requested, so a checkpoint re-armed
    /// by this context cannot hide them.
    pub(crate) fn take_interrupt(&self, target: ContextId) -> Option<RaiseError> {
        let (error, others_pending) = {
            let mut interrupts = self.interrupts.lock();
            let error = interrupts.get_mut(&target).and_then(VecDeque::pop_front);
            let others_pending = interrupts
                .iter()
                .any(|(id, queue)| *id != target && !queue.is_empty());
            (error, others_pending)
        };
        if others_pending {
            self.request_safepoint();
        }
        error
    }

    /// Forget a finished context and anything still queued for it.
    pub(crate) fn release_context(&self, id: ContextId) {
        let undelivered = self.interrupts.lock().remove(&id).map_or(0, |queue| queue.len());
        if undelivered > 0 {
            log::debug!("{id:?} finished with {undelivered} undelivered interrupts");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Block, CallShape, CallSite, CallType, CacheEntry};

    #[test]
    fn builtin_values_map_to_their_classes() {
        let runtime = Runtime::new(RuntimeCreateInfo::default());
        assert_eq!(runtime.type_of(&Value::Nil).name(), "NilClass");
        assert_eq!(runtime.type_of(&Value::Fixnum(1)).name(), "Integer");
        assert_eq!(runtime.type_of(&Value::string("s")).name(), "String");
        let ty = runtime.define_class("Widget", None);
        let widget = runtime.new_object(&ty);
        assert!(Arc::ptr_eq(runtime.type_of(&widget), &ty));
        assert!(ty.is_kind_of(runtime.object_class()));

        assert_eq!(runtime.describe(&Value::Nil), "nil");
        assert_eq!(runtime.describe(&widget), "an instance of Widget");
        assert_eq!(runtime.describe(&Value::Class(ty.clone())), "class Widget");
    }

    #[test]
    fn defining_an_existing_class_reopens_it() {
        let runtime = Runtime::new(RuntimeCreateInfo::default());
        let first = runtime.define_class("Reopened", None);
        let second = runtime.define_class("Reopened", None);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(runtime.class("Integer").is_some());
    }

    #[test]
    fn interrupts_queue_per_context() {
        let runtime = Runtime::new(RuntimeCreateInfo::default());
        let a = runtime.new_context();
        let b = runtime.new_context();
        assert_ne!(a.id(), b.id());

        let token = runtime.checkpoint_switch_point();
        runtime.interrupt(a.id(), RaiseError::LocalJumpError);
        runtime.interrupt(a.id(), RaiseError::TypeError("second".into()));
        assert!(!token.is_valid(), "interrupting requests a safepoint");

        assert_eq!(runtime.take_interrupt(b.id()), None);
        assert_eq!(runtime.take_interrupt(a.id()), Some(RaiseError::LocalJumpError));
        assert!(runtime.take_interrupt(a.id()).is_some());
        assert_eq!(runtime.take_interrupt(a.id()), None);
    }

    #[test]
    fn finished_contexts_take_their_interrupts_with_them() {
        let runtime = Runtime::new(RuntimeCreateInfo::default());
        let live = runtime.new_context();
        let finished = runtime.new_context();
        let finished_id = finished.id();
        runtime.interrupt(finished_id, RaiseError::LocalJumpError);
        drop(finished);

        let token = runtime.checkpoint_switch_point();
        assert_eq!(runtime.take_interrupt(live.id()), None);
        assert!(token.is_valid(), "nothing left to deliver, no new safepoint");

        runtime.interrupt(finished_id, RaiseError::LocalJumpError);
        assert!(token.is_valid(), "interrupts for finished contexts are dropped");
        assert_eq!(runtime.take_interrupt(finished_id), None);
    }

    /// Looks up `method_missing` only, so every send lands there.
    struct EverythingMissing;

    impl MethodLookup for EverythingMissing {
        fn lookup(&self, ty: &TypeRef, name: &Symbol) -> LookupResult {
            let token = ty.switch_point();
            match ty.search_method(name) {
                Some((method, source_module)) if name.as_str() == "method_missing" => {
                    LookupResult::Found(CacheEntry {
                        method,
                        source_module,
                        token,
                    })
                }
                _ => LookupResult::NotFound { token },
            }
        }
    }

    #[test]
    fn lookup_is_pluggable() {
        let runtime = Runtime::new(RuntimeCreateInfo {
            lookup: Some(Box::new(EverythingMissing)),
            ..Default::default()
        });
        let mut ctx = runtime.new_context();
        let site = CallSite::new(runtime.symbol("to_s"), CallShape::fixed(0), CallType::Normal);
        let err = site
            .call(&mut ctx, &Value::Fixnum(1), &[], &Block::null())
            .unwrap_err();
        assert_eq!(err.to_string(), "undefined method `to_s' for an instance of Integer");
    }
}
