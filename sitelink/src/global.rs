use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering::Relaxed},
    },
};

use parking_lot::RwLock;

use crate::{
    DispatchCell, Invalidator, InvalidatorKind, SwitchPoint, Symbol, SymbolTable, ThreadContext,
    Value,
};

/// Globals whose value depends on the current frame or thread, or that the
/// runtime rewrites behind the program's back. Never cached.
pub const UNCACHED_GLOBALS: &[&str] = &[
    "$_", "$~", "$!", "$@", "$;", "$,", "$/", "$\\", "$.", "$0", "$*",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalScope {
    Global,
    Frame,
    Thread,
}

pub type TraceFn = Box<dyn Fn(&Symbol, &Value) + Send + Sync>;

pub struct GlobalVariable {
    name: Symbol,
    scope: GlobalScope,
    value: RwLock<Value>,
    invalidator: Invalidator,
    traces: RwLock<Vec<TraceFn>>,
    writes: AtomicU64,
}

/// The process wide `$name` table.
#[derive(Default)]
pub struct GlobalVariables {
    table: RwLock<HashMap<Symbol, Arc<GlobalVariable>>>,
}

enum GlobalRead {
    Unlinked,
    Cached {
        token: Arc<SwitchPoint>,
        value: Value,
    },
    Uncached(Arc<GlobalVariable>),
}

/// Read/write access to one global from one place in the code.
pub struct GlobalSite {
    name: Symbol,
    file: Arc<str>,
    line: u32,
    read: DispatchCell<GlobalRead>,
    variable: OnceLock<Arc<GlobalVariable>>,
    failures: AtomicU32,
    demoted: AtomicBool,
}

impl GlobalVariable {
    pub fn new(name: Symbol, scope: GlobalScope) -> Self {
        Self {
            name,
            scope,
            value: RwLock::new(Value::Nil),
            invalidator: Invalidator::new(InvalidatorKind::Global),
            traces: RwLock::new(Vec::new()),
            writes: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &Symbol {
        &self.name
    }

    pub fn scope(&self) -> GlobalScope {
        self.scope
    }

    pub fn is_cacheable(&self) -> bool {
        self.scope == GlobalScope::Global && !UNCACHED_GLOBALS.contains(&self.name.as_str())
    }

    pub fn get(&self) -> Value {
        self.value.read().clone()
    }

    /// Store, run traces, then revoke cached reads.
    pub fn set(&self, value: Value) -> Value {
        *self.value.write() = value.clone();
        self.writes.fetch_add(1, Relaxed);
        for trace in self.traces.read().iter() {
            trace(&self.name, &value);
        }
        self.invalidator.invalidate();
        value
    }

    pub fn add_trace(&self, trace: impl Fn(&Symbol, &Value) + Send + Sync + 'static) {
        self.traces.write().push(Box::new(trace));
    }

    pub fn switch_point(&self) -> Arc<SwitchPoint> {
        self.invalidator.switch_point()
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Relaxed)
    }
}

impl fmt::Debug for GlobalVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalVariable")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("value", &*self.value.read())
            .finish_non_exhaustive()
    }
}

impl GlobalVariables {
    /// A table with the special variables already in place.
    pub fn new(symbols: &SymbolTable) -> Self {
        let table = Self::default();
        for name in UNCACHED_GLOBALS {
            table.define(symbols.intern(name), special_scope(name));
        }
        table
    }

    pub fn define(&self, name: Symbol, scope: GlobalScope) -> Arc<GlobalVariable> {
        self.table
            .write()
            .entry(name.clone())
            .or_insert_with(|| Arc::new(GlobalVariable::new(name, scope)))
            .clone()
    }

    /// The variable for `name`, created as a plain global on first mention.
    pub fn variable(&self, name: &Symbol) -> Arc<GlobalVariable> {
        if let Some(variable) = self.table.read().get(name) {
            return variable.clone();
        }
        self.define(name.clone(), special_scope(name.as_str()))
    }

    pub fn get(&self, name: &Symbol) -> Value {
        self.table
            .read()
            .get(name)
            .map(|variable| variable.get())
            .unwrap_or(Value::Nil)
    }

    pub fn set(&self, name: &Symbol, value: Value) -> Value {
        self.variable(name).set(value)
    }

    pub fn contains(&self, name: &Symbol) -> bool {
        self.table.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

fn special_scope(name: &str) -> GlobalScope {
    match name {
        "$_" | "$~" => GlobalScope::Frame,
        "$!" | "$@" => GlobalScope::Thread,
        _ => GlobalScope::Global,
    }
}

impl GlobalSite {
    pub fn new(name: Symbol, file: &str, line: u32) -> Self {
        Self {
            name,
            file: Arc::from(file),
            line,
            read: DispatchCell::new(Arc::new(GlobalRead::Unlinked)),
            variable: OnceLock::new(),
            failures: AtomicU32::new(0),
            demoted: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &Symbol {
        &self.name
    }

    pub fn get(&self, ctx: &ThreadContext) -> Value {
        let cached = self.read.with(|target| match target {
            GlobalRead::Cached { token, value } if token.is_valid() => Some(value.clone()),
            GlobalRead::Uncached(variable) => Some(variable.get()),
            _ => None,
        });
        match cached {
            Some(value) => value,
            None => self.relink(ctx),
        }
    }

    pub fn set(&self, ctx: &ThreadContext, value: Value) -> Value {
        self.variable(ctx).set(value)
    }

    fn variable(&self, ctx: &ThreadContext) -> &Arc<GlobalVariable> {
        self.variable
            .get_or_init(|| ctx.runtime().globals().variable(&self.name))
    }

    fn relink(&self, ctx: &ThreadContext) -> Value {
        let options = ctx.runtime().options();
        let variable = self.variable(ctx).clone();

        if !variable.is_cacheable() {
            if options.log_globals {
                log::info!("{self}\tuncacheable, binding direct access");
            }
            return self.demote(variable);
        }
        let was_cached = self
            .read
            .with(|target| matches!(target, GlobalRead::Cached { .. }));
        if was_cached {
            let failures = self.failures.fetch_add(1, Relaxed) + 1;
            if failures > options.global_max_fail {
                if options.log_globals {
                    log::info!("{self}\tinvalidated {failures} times, no longer caching");
                }
                return self.demote(variable);
            }
        }

        let token = variable.switch_point();
        let value = variable.get();
        if options.log_globals {
            log::info!("{self}\tcaching {value}");
        }
        self.read.store(Arc::new(GlobalRead::Cached {
            token,
            value: value.clone(),
        }));
        value
    }

    fn demote(&self, variable: Arc<GlobalVariable>) -> Value {
        self.demoted.store(true, Relaxed);
        let value = variable.get();
        self.read.store(Arc::new(GlobalRead::Uncached(variable)));
        value
    }

    /// True once the site reads through without caching, for good.
    pub fn is_demoted(&self) -> bool {
        self.demoted.load(Relaxed)
    }

    pub fn is_cached(&self) -> bool {
        self.read
            .with(|target| matches!(target, GlobalRead::Cached { token, .. } if token.is_valid()))
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Relaxed)
    }
}

impl fmt::Display for GlobalSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.name, self.file, self.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LinkerOptions, Runtime, RuntimeCreateInfo};
    use parking_lot::Mutex;
    use std::thread;

    fn runtime_with_budget(global_max_fail: u32) -> Arc<Runtime> {
        Runtime::new(RuntimeCreateInfo {
            options: LinkerOptions {
                global_max_fail,
                ..LinkerOptions::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn cached_reads_observe_every_write() {
        let runtime = runtime_with_budget(100);
        let ctx = runtime.new_context();
        let name = runtime.symbol("$level");
        let site = GlobalSite::new(name.clone(), "test.rb", 1);

        assert_eq!(site.get(&ctx), Value::Nil, "unassigned globals read as nil");
        assert!(site.is_cached());
        runtime.globals().set(&name, Value::Fixnum(1));
        assert!(!site.is_cached(), "a write revokes the cached value");
        assert_eq!(site.get(&ctx), Value::Fixnum(1));

        let writer = GlobalSite::new(name, "test.rb", 2);
        writer.set(&ctx, Value::Fixnum(2));
        assert_eq!(site.get(&ctx), Value::Fixnum(2));
        assert_eq!(site.failures(), 2);
    }

    #[test]
    fn hot_globals_are_demoted_for_good() {
        let runtime = runtime_with_budget(3);
        let ctx = runtime.new_context();
        let site = GlobalSite::new(runtime.symbol("$hot"), "test.rb", 1);

        for i in 0..10 {
            site.set(&ctx, Value::Fixnum(i));
            assert_eq!(site.get(&ctx), Value::Fixnum(i), "write {i} must be visible");
        }
        assert!(site.is_demoted());
        assert_eq!(site.failures(), 4, "demoted on the first failure past the budget");

        site.set(&ctx, Value::Fixnum(42));
        assert_eq!(site.get(&ctx), Value::Fixnum(42));
        assert!(!site.is_cached(), "a demoted site never reinstalls a guard");
        assert_eq!(site.failures(), 4);
    }

    #[test]
    fn special_globals_are_never_cached() {
        let runtime = runtime_with_budget(100);
        let ctx = runtime.new_context();
        for name in UNCACHED_GLOBALS {
            let site = GlobalSite::new(runtime.symbol(name), "test.rb", 1);
            site.set(&ctx, Value::string("x"));
            assert_eq!(site.get(&ctx), Value::string("x"));
            assert!(!site.is_cached(), "{name} must not be cached");
        }
        assert!(runtime.globals().contains(&runtime.symbol("$!")));
        let last_line = runtime.globals().variable(&runtime.symbol("$_"));
        assert_eq!(last_line.scope(), GlobalScope::Frame);
    }

    #[test]
    fn traces_run_after_the_store() {
        let runtime = runtime_with_budget(100);
        let ctx = runtime.new_context();
        let name = runtime.symbol("$traced");
        let variable = runtime.globals().variable(&name);
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            let variable_view = variable.clone();
            variable.add_trace(move |name, value| {
                assert_eq!(&variable_view.get(), value, "trace sees the stored value");
                seen.lock().push(format!("{name}={value}"));
            });
        }
        let site = GlobalSite::new(name, "test.rb", 3);
        site.set(&ctx, Value::Fixnum(1));
        site.set(&ctx, Value::Fixnum(2));
        assert_eq!(*seen.lock(), vec!["$traced=1", "$traced=2"]);
        assert_eq!(variable.writes(), 2);
    }

    #[test]
    fn writes_on_other_threads_are_observed() {
        let runtime = runtime_with_budget(1000);
        let ctx = runtime.new_context();
        let name = runtime.symbol("$shared");
        let site = Arc::new(GlobalSite::new(name, "test.rb", 1));
        assert_eq!(site.get(&ctx), Value::Nil);

        for i in 1..=20 {
            let writer = {
                let runtime = runtime.clone();
                let site = site.clone();
                thread::spawn(move || {
                    let ctx = runtime.new_context();
                    site.set(&ctx, Value::Fixnum(i));
                })
            };
            writer.join().unwrap();
            assert_eq!(site.get(&ctx), Value::Fixnum(i));
        }
    }
}
