use std::{collections::HashMap, sync::Arc};

use crate::Value;

/// An interned name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(pub u32);

impl Symbol {
    /// Returned by lookups that miss; never handed out by [`SymbolTable::add`].
    pub const NOT_FOUND: Symbol = Symbol(u32::MAX);

    pub fn is_found(self) -> bool {
        self != Self::NOT_FOUND
    }
}

/// Two-way mapping between names and [`Symbol`]s.
///
/// Every symbol may also own the heap string object it was interned from.
/// Those strings are collector roots.
#[derive(Debug, Default)]
pub struct SymbolTable {
    names: Vec<Arc<str>>,
    mappings: HashMap<Arc<str>, Symbol>,
    strings: Vec<Value>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `name`. Returns the symbol and whether it was newly added.
    pub fn add(&mut self, name: &str) -> (Symbol, bool) {
        if let Some(&symbol) = self.mappings.get(name) {
            return (symbol, false);
        }
        let symbol = Symbol(self.names.len() as u32);
        debug_assert!(symbol.is_found(), "symbol table exhausted");
        let interned = Arc::<str>::from(name);
        self.names.push(interned.clone());
        self.mappings.insert(interned, symbol);
        self.strings.push(Value::NIL);
        (symbol, true)
    }

    pub fn lookup(&self, name: &str) -> Symbol {
        self.mappings.get(name).copied().unwrap_or(Symbol::NOT_FOUND)
    }

    pub fn lookup_or_add(&mut self, name: &str) -> Symbol {
        self.add(name).0
    }

    pub fn name(&self, symbol: Symbol) -> Option<&str> {
        self.names.get(symbol.0 as usize).map(|name| &**name)
    }

    /// The string object backing `symbol`, nil if none was attached.
    pub fn string(&self, symbol: Symbol) -> Value {
        self.strings.get(symbol.0 as usize).copied().unwrap_or(Value::NIL)
    }

    pub fn attach_string(&mut self, symbol: Symbol, string: Value) {
        if let Some(slot) = self.strings.get_mut(symbol.0 as usize) {
            *slot = string;
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub(crate) fn strings_mut(&mut self) -> impl Iterator<Item = &mut Value> {
        self.strings.iter_mut()
    }
}
