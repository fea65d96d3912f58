use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU32, Ordering::Relaxed},
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    CompiledMethod, DynamicMethod, Invalidator, InvalidatorKind, MethodImpl, SwitchPoint, Symbol,
    Value,
};

/// number of instance variables a type lays out as fixed fields before it
/// spills new names into the per-object dictionary
pub const DEFAULT_FIELD_CAPACITY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u32);

pub type TypeRef = Arc<Type>;
pub type ObjectRef = Arc<Object>;

/// A class: method table, instance variable layout and hierarchy links.
pub struct Type {
    id: ClassId,
    name: String,
    parent: Option<TypeRef>,
    methods: RwLock<HashMap<Symbol, Arc<DynamicMethod>>>,
    invalidator: Invalidator,
    subclasses: Mutex<Vec<Weak<Type>>>,
    variables: RwLock<Vec<Symbol>>,
    field_capacity: usize,
}

/// Where an instance variable lives in objects of one type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableAccessor {
    Field { index: usize },
    Dictionary { name: Symbol },
}

pub struct Object {
    ty: TypeRef,
    fields: RwLock<Vec<Option<Value>>>,
    dictionary: RwLock<HashMap<Symbol, Value>>,
}

static NEXT_CLASS_ID: AtomicU32 = AtomicU32::new(1);

impl ClassId {
    fn next() -> Self {
        Self(NEXT_CLASS_ID.fetch_add(1, Relaxed))
    }
}

impl Type {
    pub fn new(name: impl Into<String>, parent: Option<TypeRef>) -> TypeRef {
        Self::with_field_capacity(name, parent, DEFAULT_FIELD_CAPACITY)
    }

    pub fn with_field_capacity(
        name: impl Into<String>,
        parent: Option<TypeRef>,
        field_capacity: usize,
    ) -> TypeRef {
        let ty = Arc::new(Self {
            id: ClassId::next(),
            name: name.into(),
            parent: parent.clone(),
            methods: RwLock::new(HashMap::new()),
            invalidator: Invalidator::new(InvalidatorKind::MethodTable),
            subclasses: Mutex::new(Vec::new()),
            variables: RwLock::new(Vec::new()),
            field_capacity,
        });
        if let Some(parent) = parent {
            parent.subclasses.lock().push(Arc::downgrade(&ty));
        }
        ty
    }

    #[inline]
    pub fn id(&self) -> ClassId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&TypeRef> {
        self.parent.as_ref()
    }

    /// Token for guards that depend on this type's method table, including
    /// everything inherited.
    pub fn switch_point(&self) -> Arc<SwitchPoint> {
        self.invalidator.switch_point()
    }

    pub fn invalidator(&self) -> &Invalidator {
        &self.invalidator
    }

    pub fn define_method(&self, method: DynamicMethod) -> Arc<DynamicMethod> {
        let method = Arc::new(method);
        self.methods
            .write()
            .insert(method.name().clone(), method.clone());
        self.invalidate_cache_descendants();
        method
    }

    pub fn remove_method(&self, name: &Symbol) -> Option<Arc<DynamicMethod>> {
        let removed = self.methods.write().remove(name);
        if removed.is_some() {
            self.invalidate_cache_descendants();
        }
        removed
    }

    /// Method defined directly on this type.
    pub fn method(&self, name: &Symbol) -> Option<Arc<DynamicMethod>> {
        self.methods.read().get(name).cloned()
    }

    /// Walk the ancestry. Returns the method and the type that defines it.
    pub fn search_method(self: &Arc<Self>, name: &Symbol) -> Option<(Arc<DynamicMethod>, TypeRef)> {
        let mut current = Some(self);
        while let Some(ty) = current {
            if let Some(method) = ty.method(name) {
                return Some((method, ty.clone()));
            }
            current = ty.parent.as_ref();
        }
        None
    }

    /// Flip the method-table switch point of this type and every live
    /// subclass.
    pub fn invalidate_cache_descendants(&self) {
        self.invalidator.invalidate();
        for subclass in self.subclasses() {
            subclass.invalidate_cache_descendants();
        }
    }

    pub fn subclasses(&self) -> Vec<TypeRef> {
        let mut subclasses = self.subclasses.lock();
        subclasses.retain(|weak| weak.strong_count() > 0);
        subclasses.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn is_kind_of(&self, other: &Type) -> bool {
        let mut current = Some(self);
        while let Some(ty) = current {
            if ty.id == other.id {
                return true;
            }
            current = ty.parent.as_deref();
        }
        false
    }

    /// Switch a mixed-mode method defined on this type to its compiled body.
    /// Dependent call sites relink onto the compiled body on their next call.
    pub fn jit_method(&self, name: &Symbol, compiled: Arc<CompiledMethod>) -> bool {
        let Some(method) = self.method(name) else {
            return false;
        };
        let MethodImpl::MixedMode(mixed) = method.implementation() else {
            return false;
        };
        mixed.promote(compiled);
        self.invalidate_cache_descendants();
        true
    }

    /// Accessor for reading `name`. Never allocates a field.
    pub fn variable_accessor_for_read(&self, name: &Symbol) -> VariableAccessor {
        match self.variables.read().iter().position(|var| var == name) {
            Some(index) => VariableAccessor::Field { index },
            None => VariableAccessor::Dictionary { name: name.clone() },
        }
    }

    /// Accessor for writing `name`, laying out a new field while capacity
    /// remains. Once a name resolves it keeps resolving the same way.
    pub fn variable_accessor_for_write(&self, name: &Symbol) -> VariableAccessor {
        if let accessor @ VariableAccessor::Field { .. } = self.variable_accessor_for_read(name) {
            return accessor;
        }
        let mut variables = self.variables.write();
        // recheck, another writer may have laid it out
        if let Some(index) = variables.iter().position(|var| var == name) {
            return VariableAccessor::Field { index };
        }
        if variables.len() < self.field_capacity {
            variables.push(name.clone());
            return VariableAccessor::Field {
                index: variables.len() - 1,
            };
        }
        VariableAccessor::Dictionary { name: name.clone() }
    }

    pub fn field_count(&self) -> usize {
        self.variables.read().len()
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Type")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl VariableAccessor {
    pub fn get(&self, object: &Object) -> Option<Value> {
        match self {
            VariableAccessor::Field { index } => {
                object.fields.read().get(*index).cloned().flatten()
            }
            VariableAccessor::Dictionary { name } => object.dictionary.read().get(name).cloned(),
        }
    }

    pub fn set(&self, object: &Object, value: Value) {
        match self {
            VariableAccessor::Field { index } => {
                let mut fields = object.fields.write();
                if fields.len() <= *index {
                    fields.resize(*index + 1, None);
                }
                fields[*index] = Some(value);
            }
            VariableAccessor::Dictionary { name } => {
                object.dictionary.write().insert(name.clone(), value);
            }
        }
    }
}

impl Object {
    pub fn new(ty: TypeRef) -> Self {
        let fields = vec![None; ty.field_count()];
        Self {
            ty,
            fields: RwLock::new(fields),
            dictionary: RwLock::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn type_ref(&self) -> &TypeRef {
        &self.ty
    }

    pub fn get_variable(&self, name: &Symbol) -> Option<Value> {
        self.ty.variable_accessor_for_read(name).get(self)
    }

    pub fn set_variable(&self, name: &Symbol, value: Value) {
        self.ty.variable_accessor_for_write(name).set(self, value);
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<{}>", self.ty.name)
    }
}
