use std::{
    fmt,
    hash::{Hash, Hasher},
    mem,
    sync::Arc,
};

use indexmap::IndexMap;

use crate::{Block, ObjectRef, Symbol, TypeRef};

/// A language-level value.
///
/// Immediates are stored inline, everything else is shared behind an `Arc`
/// so values are cheap to clone into bound thunks and across threads.
#[derive(Clone)]
pub enum Value {
    Nil,
    True,
    False,
    Fixnum(i64),
    Symbol(Symbol),
    String(Arc<str>),
    Array(Arc<[Value]>),
    Hash(Arc<RHash>),
    Object(ObjectRef),
    Class(TypeRef),
    Proc(Block),
}

/// Insertion ordered hash. Keys compare with `Value` equality.
#[derive(Clone, Default)]
pub struct RHash {
    entries: IndexMap<Value, Value>,
}

impl Value {
    #[inline]
    pub fn from_bool(value: bool) -> Self {
        if value { Value::True } else { Value::False }
    }

    pub fn string(value: &str) -> Self {
        Value::String(Arc::from(value))
    }

    pub fn array(values: Vec<Value>) -> Self {
        Value::Array(Arc::from(values))
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// everything except nil and false
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::False)
    }

    pub fn as_fixnum(&self) -> Option<i64> {
        match self {
            Value::Fixnum(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Value::Symbol(sym) => Some(sym),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_hash(&self) -> Option<&RHash> {
        match self {
            Value::Hash(hash) => Some(hash),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<&Block> {
        match self {
            Value::Proc(block) => Some(block),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil)
            | (Value::True, Value::True)
            | (Value::False, Value::False) => true,
            (Value::Fixnum(a), Value::Fixnum(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Hash(a), Value::Hash(b)) => a.entries == b.entries,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Arc::ptr_eq(a, b),
            (Value::Proc(a), Value::Proc(b)) => a.same_block(b),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        mem::discriminant(self).hash(state);
        match self {
            Value::Nil | Value::True | Value::False | Value::Proc(_) => {}
            Value::Fixnum(n) => n.hash(state),
            Value::Symbol(sym) => sym.hash(state),
            Value::String(s) => s.hash(state),
            Value::Array(values) => values.hash(state),
            // hash equality ignores entry order
            Value::Hash(hash) => hash.len().hash(state),
            Value::Object(object) => Arc::as_ptr(object).hash(state),
            Value::Class(ty) => Arc::as_ptr(ty).hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::True => f.write_str("true"),
            Value::False => f.write_str("false"),
            Value::Fixnum(n) => write!(f, "{n}"),
            Value::Symbol(sym) => write!(f, ":{sym}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Array(values) => {
                f.write_str("[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
            Value::Hash(hash) => {
                f.write_str("{")?;
                for (i, (key, value)) in hash.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}=>{value}")?;
                }
                f.write_str("}")
            }
            Value::Object(object) => write!(f, "#<{}>", object.type_ref().name()),
            Value::Class(ty) => f.write_str(ty.name()),
            Value::Proc(_) => f.write_str("#<Proc>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl RHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity),
        }
    }

    /// Insert or overwrite, keeping the original insertion position.
    pub fn insert(&mut self, key: Value, value: Value) {
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter()
    }
}
