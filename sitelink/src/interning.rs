use std::{
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);

/// An interned name. Equality and hashing go through the id only.
#[derive(Clone)]
pub struct Symbol {
    id: SymbolId,
    name: Arc<str>,
}

struct SymbolTableImpl {
    table: Vec<Arc<str>>,
    mappings: HashMap<Arc<str>, SymbolId>,
}

pub struct SymbolTable(RwLock<SymbolTableImpl>);

impl Symbol {
    #[inline]
    pub fn id(&self) -> SymbolId {
        self.id
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl PartialEq for Symbol {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.name)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl SymbolTableImpl {
    fn new() -> Self {
        Self {
            table: Vec::new(),
            mappings: HashMap::new(),
        }
    }

    fn get_or_add(&mut self, value: &str) -> Symbol {
        if let Some(&id) = self.mappings.get(value) {
            return self.symbol(id);
        }
        let id = SymbolId(self.table.len() as u32);
        let interned = Arc::<str>::from(value);
        self.table.push(interned.clone());
        self.mappings.insert(interned.clone(), id);
        Symbol { id, name: interned }
    }

    fn symbol(&self, id: SymbolId) -> Symbol {
        Symbol {
            id,
            name: self.table[id.0 as usize].clone(),
        }
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self(RwLock::new(SymbolTableImpl::new()))
    }

    pub fn intern(&self, value: &str) -> Symbol {
        {
            let table = self.0.read();
            if let Some(&id) = table.mappings.get(value) {
                return table.symbol(id);
            }
        }
        // another thread may have won the race in between, get_or_add rechecks
        self.0.write().get_or_add(value)
    }

    pub fn get(&self, id: SymbolId) -> Option<Symbol> {
        let table = self.0.read();
        table.table.get(id.0 as usize).map(|name| Symbol {
            id,
            name: name.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.0.read().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn interning_twice_yields_the_same_symbol() {
        let table = SymbolTable::new();
        let a = table.intern("foo");
        let b = table.intern("foo");
        let c = table.intern("bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "foo");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn symbols_round_trip_through_their_id() {
        let table = SymbolTable::new();
        let sym = table.intern("method_missing");
        let found = table.get(sym.id()).expect("interned id must resolve");
        assert_eq!(found.as_str(), "method_missing");
        assert!(table.get(SymbolId(99)).is_none());
    }

    #[test]
    fn concurrent_interning_agrees_on_ids() {
        let table = Arc::new(SymbolTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    (0..64)
                        .map(|i| table.intern(&format!("name{i}")).id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(
            results.windows(2).all(|w| w[0] == w[1]),
            "every thread must observe the same ids"
        );
        assert_eq!(table.len(), 64);
    }
}
