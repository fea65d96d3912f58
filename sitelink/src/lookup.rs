use std::{fmt, sync::Arc};

use crate::{DynamicMethod, SwitchPoint, Symbol, TypeRef};

/// Snapshot of one successful resolution. Never mutated after it is built.
#[derive(Clone)]
pub struct CacheEntry {
    pub method: Arc<DynamicMethod>,
    /// the type that defines `method`
    pub source_module: TypeRef,
    /// revoked when the receiver type's method table changes
    pub token: Arc<SwitchPoint>,
}

pub enum LookupResult {
    Found(CacheEntry),
    /// the miss is cached too, until `token` is revoked
    NotFound { token: Arc<SwitchPoint> },
}

/// Resolves a name against a receiver type.
pub trait MethodLookup: Send + Sync {
    fn lookup(&self, ty: &TypeRef, name: &Symbol) -> LookupResult;
}

/// Walks the receiver type's ancestry.
#[derive(Debug, Default, Clone, Copy)]
pub struct HierarchyLookup;

impl CacheEntry {
    #[inline]
    pub fn version(&self) -> u64 {
        self.method.serial()
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.token.is_valid()
    }
}

impl fmt::Display for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[#{} {}#{}]",
            self.version(),
            self.source_module.name(),
            self.method.name()
        )
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl LookupResult {
    pub fn token(&self) -> &Arc<SwitchPoint> {
        match self {
            LookupResult::Found(entry) => &entry.token,
            LookupResult::NotFound { token } => token,
        }
    }

    pub fn found(self) -> Option<CacheEntry> {
        match self {
            LookupResult::Found(entry) => Some(entry),
            LookupResult::NotFound { .. } => None,
        }
    }
}

impl MethodLookup for HierarchyLookup {
    fn lookup(&self, ty: &TypeRef, name: &Symbol) -> LookupResult {
        // token first, so a concurrent redefinition revokes what we return
        let token = ty.switch_point();
        match ty.search_method(name) {
            Some((method, source_module)) if !method.is_undefined() => {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MethodImpl, NativeCall, NativeMethod, SymbolTable, Type, Value, Visibility};

    fn one(_call: NativeCall<'_>) -> crate::CallResult {
        Ok(Value::Fixnum(1))
    }

    #[test]
    fn found_entries_carry_the_defining_type_and_a_live_token() {
        let symbols = SymbolTable::new();
        let foo = symbols.intern("foo");
        let base = Type::new("Base", None);
        let derived = Type::new("Derived", Some(base.clone()));
        let defined = base.define_method(DynamicMethod::native(
            foo.clone(),
            NativeMethod::new(one, &[]),
        ));

        let entry = HierarchyLookup
            .lookup(&derived, &foo)
            .found()
            .expect("inherited method resolves");
        assert!(Arc::ptr_eq(&entry.source_module, &base));
        assert_eq!(entry.version(), defined.serial());
        assert!(entry.is_valid());
        assert_eq!(
            entry.to_string(),
            format!("[#{} Base#foo]", defined.serial())
        );
    }

    #[test]
    fn redefinition_revokes_earlier_entries() {
        let symbols = SymbolTable::new();
        let foo = symbols.intern("foo");
        let ty = Type::new("A", None);
        ty.define_method(DynamicMethod::native(
            foo.clone(),
            NativeMethod::new(one, &[]),
        ));
        let entry = HierarchyLookup.lookup(&ty, &foo).found().unwrap();
        ty.define_method(DynamicMethod::native(
            foo.clone(),
            NativeMethod::new(one, &[]),
        ));
        assert!(!entry.is_valid());
    }

    #[test]
    fn undefined_tombstones_and_misses_are_not_found() {
        let symbols = SymbolTable::new();
        let gone = symbols.intern("gone");
        let base = Type::new("Base", None);
        let derived = Type::new("Derived", Some(base.clone()));
        base.define_method(DynamicMethod::native(
            gone.clone(),
            NativeMethod::new(one, &[]),
        ));
        derived.define_method(DynamicMethod::new(
            gone.clone(),
            Visibility::Public,
            MethodImpl::Undefined,
        ));

        let result = HierarchyLookup.lookup(&derived, &gone);
        assert!(matches!(result, LookupResult::NotFound { .. }));
        let token = result.token().clone();
        derived.remove_method(&gone);
        assert!(!token.is_valid(), "cached misses are revoked too");
        assert!(HierarchyLookup.lookup(&derived, &gone).found().is_some());
    }
}
