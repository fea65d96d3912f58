use std::sync::Arc;

use parking_lot::RwLock;

use crate::{Signature, Symbol, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Script,
    Method,
    Block,
    Eval,
}

/// Compile time description of a lexical scope.
#[derive(Debug)]
pub struct StaticScope {
    kind: ScopeKind,
    variables: Vec<Symbol>,
    parent: Option<Arc<StaticScope>>,
    file: Arc<str>,
    line: u32,
    signature: Signature,
}

/// Runtime storage for one activation of a `StaticScope`.
#[derive(Debug)]
pub struct DynamicScope {
    static_scope: Arc<StaticScope>,
    parent: Option<Arc<DynamicScope>>,
    values: RwLock<Vec<Option<Value>>>,
}

pub type ScopeGetter = fn(&DynamicScope) -> Option<Value>;

/// Depth zero offsets with a dedicated accessor.
pub const SPECIALIZED_GETS: [ScopeGetter; 10] = [
    value_at::<0>,
    value_at::<1>,
    value_at::<2>,
    value_at::<3>,
    value_at::<4>,
    value_at::<5>,
    value_at::<6>,
    value_at::<7>,
    value_at::<8>,
    value_at::<9>,
];

fn value_at<const OFFSET: usize>(scope: &DynamicScope) -> Option<Value> {
    scope.values.read().get(OFFSET).cloned().flatten()
}

impl StaticScope {
    pub fn new(kind: ScopeKind, variables: Vec<Symbol>, parent: Option<Arc<StaticScope>>) -> Self {
        Self {
            kind,
            variables,
            parent,
            file: Arc::from("-"),
            line: 0,
            signature: Signature::NO_ARGUMENTS,
        }
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }

    pub fn at(mut self, file: &str, line: u32) -> Self {
        self.file = Arc::from(file);
        self.line = line;
        self
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn variables(&self) -> &[Symbol] {
        &self.variables
    }

    pub fn parent(&self) -> Option<&Arc<StaticScope>> {
        self.parent.as_ref()
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// `(depth, offset)` of `name` as the emitter would compute it.
    pub fn resolve(&self, name: &Symbol) -> Option<(usize, usize)> {
        let mut depth = 0;
        let mut current = Some(self);
        while let Some(scope) = current {
            if let Some(offset) = scope.variables.iter().position(|var| var == name) {
                return Some((depth, offset));
            }
            depth += 1;
            current = scope.parent.as_deref();
        }
        None
    }
}

impl DynamicScope {
    pub fn new(static_scope: Arc<StaticScope>, parent: Option<Arc<DynamicScope>>) -> Arc<Self> {
        let values = vec![None; static_scope.variables.len()];
        Arc::new(Self {
            static_scope,
            parent,
            values: RwLock::new(values),
        })
    }

    pub fn static_scope(&self) -> &Arc<StaticScope> {
        &self.static_scope
    }

    pub fn parent(&self) -> Option<&Arc<DynamicScope>> {
        self.parent.as_ref()
    }

    pub fn ancestor(&self, depth: usize) -> Option<&DynamicScope> {
        let mut current = self;
        for _ in 0..depth {
            current = current.parent.as_deref()?;
        }
        Some(current)
    }

    #[inline]
    pub fn value_depth_zero(&self, offset: usize) -> Option<Value> {
        self.values.read().get(offset).cloned().flatten()
    }

    pub fn value(&self, offset: usize, depth: usize) -> Option<Value> {
        self.ancestor(depth)?.value_depth_zero(offset)
    }

    pub fn set_value_depth_zero(&self, offset: usize, value: Value) {
        let mut values = self.values.write();
        if values.len() <= offset {
            values.resize(offset + 1, None);
        }
        values[offset] = Some(value);
    }

    /// false when the scope chain is shorter than `depth`
    pub fn set_value(&self, offset: usize, depth: usize, value: Value) -> bool {
        match self.ancestor(depth) {
            Some(scope) => {
                scope.set_value_depth_zero(offset, value);
                true
            }
            None => false,
        }
    }
}

#[derive(Clone, Copy)]
enum LocalAccess {
    Specialized(ScopeGetter),
    DepthZero,
    Walk,
}

/// Read/write site for one lexical variable at fixed coordinates.
pub struct HeapLocalSite {
    depth: usize,
    offset: usize,
    access: LocalAccess,
}

impl HeapLocalSite {
    pub fn new(depth: usize, offset: usize) -> Self {
        let access = match (depth, SPECIALIZED_GETS.get(offset)) {
            (0, Some(getter)) => LocalAccess::Specialized(*getter),
            (0, None) => LocalAccess::DepthZero,
            _ => LocalAccess::Walk,
        };
        Self {
            depth,
            offset,
            access,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_specialized(&self) -> bool {
        matches!(self.access, LocalAccess::Specialized(_))
    }

    #[inline]
    pub fn get(&self, scope: &DynamicScope) -> Option<Value> {
        match self.access {
            LocalAccess::Specialized(getter) => getter(scope),
            LocalAccess::DepthZero => scope.value_depth_zero(self.offset),
            LocalAccess::Walk => scope.value(self.offset, self.depth),
        }
    }

    /// unassigned variables read as nil
    #[inline]
    pub fn get_or_nil(&self, scope: &DynamicScope) -> Value {
        self.get(scope).unwrap_or(Value::Nil)
    }

    pub fn set(&self, scope: &DynamicScope, value: Value) {
        if !scope.set_value(self.offset, self.depth, value) {
            log::warn!(
                "scope chain shorter than depth {} for offset {}",
                self.depth,
                self.offset
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SymbolTable;

    fn scopes(symbols: &SymbolTable) -> (Arc<DynamicScope>, Arc<DynamicScope>) {
        let outer_vars: Vec<_> = (0..12).map(|i| symbols.intern(&format!("o{i}"))).collect();
        let outer = Arc::new(StaticScope::new(ScopeKind::Method, outer_vars, None));
        let inner = Arc::new(StaticScope::new(
            ScopeKind::Block,
            vec![symbols.intern("x")],
            Some(outer.clone()),
        ));
        let outer_scope = DynamicScope::new(outer, None);
        let inner_scope = DynamicScope::new(inner, Some(outer_scope.clone()));
        (outer_scope, inner_scope)
    }

    #[test]
    fn access_strategy_is_chosen_from_coordinates() {
        assert!(HeapLocalSite::new(0, 3).is_specialized());
        assert!(HeapLocalSite::new(0, 9).is_specialized());
        assert!(matches!(HeapLocalSite::new(0, 10).access, LocalAccess::DepthZero));
        assert!(matches!(HeapLocalSite::new(1, 0).access, LocalAccess::Walk));
    }

    #[test]
    fn every_strategy_reads_what_was_written() {
        let symbols = SymbolTable::new();
        let (outer, inner) = scopes(&symbols);
        for (depth, offset) in [(0, 0), (0, 11), (1, 4), (1, 11)] {
            let site = HeapLocalSite::new(depth, offset);
            assert_eq!(site.get(&inner), None, "({depth}, {offset}) starts unassigned");
            assert_eq!(site.get_or_nil(&inner), Value::Nil);
            site.set(&inner, Value::Fixnum((depth * 100 + offset) as i64));
            assert_eq!(
                site.get(&inner),
                Some(Value::Fixnum((depth * 100 + offset) as i64))
            );
        }
        assert_eq!(
            HeapLocalSite::new(0, 4).get(&outer),
            Some(Value::Fixnum(104)),
            "depth 1 from the block is depth 0 in the method"
        );
    }

    #[test]
    fn specialized_getters_match_the_generic_accessor() {
        let symbols = SymbolTable::new();
        let (outer, _) = scopes(&symbols);
        for offset in 0..10 {
            outer.set_value_depth_zero(offset, Value::Fixnum(offset as i64));
        }
        for (offset, getter) in SPECIALIZED_GETS.iter().enumerate() {
            assert_eq!(getter(&outer), outer.value_depth_zero(offset));
        }
    }

    #[test]
    fn static_resolution_counts_depth_outward() {
        let symbols = SymbolTable::new();
        let (_, inner) = scopes(&symbols);
        let scope = inner.static_scope();
        assert_eq!(scope.resolve(&symbols.intern("x")), Some((0, 0)));
        assert_eq!(scope.resolve(&symbols.intern("o7")), Some((1, 7)));
        assert_eq!(scope.resolve(&symbols.intern("missing")), None);
    }

    #[test]
    fn writes_past_a_short_chain_are_dropped() {
        let symbols = SymbolTable::new();
        let (outer, _) = scopes(&symbols);
        assert!(!outer.set_value(0, 3, Value::True));
        assert_eq!(outer.value(0, 3), None);
    }
}
