use std::collections::{BTreeSet, HashSet};

use crate::{
    Fault, Heap, RuntimeError, SlotExistsError, SlotObject, Symbol, SymbolTable, Value, VmError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    NotFound,
    Found {
        value: Value,
        /// The object (receiver or trait) that defines the slot.
        holder: Value,
    },
}

impl LookupResult {
    pub fn value(self) -> Option<Value> {
        match self {
            LookupResult::Found { value, .. } => Some(value),
            LookupResult::NotFound => None,
        }
    }
}

/// Find `name` on `receiver`: local slots first, then traits in the order
/// they were added, depth first. Values that are not slot objects have no
/// slots.
pub fn lookup(heap: &Heap, receiver: Value, name: Symbol) -> Result<LookupResult, Fault> {
    let mut visited = HashSet::new();
    lookup_in(heap, receiver, name, &mut visited)
}

fn lookup_in(
    heap: &Heap,
    object: Value,
    name: Symbol,
    visited: &mut HashSet<Value>,
) -> Result<LookupResult, Fault> {
    if !object.is_reference() || !visited.insert(object) {
        return Ok(LookupResult::NotFound);
    }
    let Some(slots) = heap.get(object)?.as_object() else {
        return Ok(LookupResult::NotFound);
    };
    if let Some(&value) = slots.slots.get(&name) {
        return Ok(LookupResult::Found {
            value,
            holder: object,
        });
    }
    for &trait_value in &slots.traits {
        let found = lookup_in(heap, trait_value, name, visited)?;
        if found != LookupResult::NotFound {
            return Ok(found);
        }
    }
    Ok(LookupResult::NotFound)
}

/// Every slot name visible on `object`: its own slots and, transitively,
/// those of its traits.
pub fn visible_slots(heap: &Heap, object: Value) -> Result<BTreeSet<Symbol>, Fault> {
    let mut names = BTreeSet::new();
    let mut visited = HashSet::new();
    collect_visible(heap, object, &mut names, &mut visited)?;
    Ok(names)
}

fn collect_visible(
    heap: &Heap,
    object: Value,
    names: &mut BTreeSet<Symbol>,
    visited: &mut HashSet<Value>,
) -> Result<(), Fault> {
    if !object.is_reference() || !visited.insert(object) {
        return Ok(());
    }
    if let Some(slots) = heap.get(object)?.as_object() {
        names.extend(slots.slots.keys().copied());
        for &trait_value in &slots.traits {
            collect_visible(heap, trait_value, names, visited)?;
        }
    }
    Ok(())
}

/// Compose `trait_value` into `object`.
///
/// Fails without touching the trait list when any slot of the trait is
/// already visible on the object. The error names the object or the
/// earlier trait that defines it.
pub fn compose(
    heap: &mut Heap,
    symbols: &SymbolTable,
    object: Value,
    trait_value: Value,
) -> Result<(), VmError> {
    expect_object(heap, object)?;
    expect_object(heap, trait_value)?;

    let existing = visible_slots(heap, object)?;
    let incoming = visible_slots(heap, trait_value)?;
    if let Some(&slot) = existing.intersection(&incoming).next() {
        let offender = match lookup(heap, object, slot)? {
            LookupResult::Found { holder, .. } => defining_root(heap, object, holder)?,
            LookupResult::NotFound => object,
        };
        return Err(SlotExistsError {
            slot,
            name: symbols.name(slot).unwrap_or("?").to_string(),
            offender,
        }
        .into());
    }

    heap.charge(SlotObject::TRAIT_SIZE)?;
    if let Some(slots) = heap.get_mut(object)?.as_object_mut() {
        slots.traits.push(trait_value);
    }
    Ok(())
}

/// The object itself or the direct trait of `object` through which
/// `holder` was reached.
fn defining_root(heap: &Heap, object: Value, holder: Value) -> Result<Value, Fault> {
    if holder == object {
        return Ok(object);
    }
    let traits = match heap.get(object)?.as_object() {
        Some(slots) => slots.traits.clone(),
        None => return Ok(object),
    };
    for trait_value in traits {
        if trait_value == holder || reaches(heap, trait_value, holder, &mut HashSet::new())? {
            return Ok(trait_value);
        }
    }
    Ok(holder)
}

fn reaches(
    heap: &Heap,
    from: Value,
    to: Value,
    visited: &mut HashSet<Value>,
) -> Result<bool, Fault> {
    if from == to {
        return Ok(true);
    }
    if !from.is_reference() || !visited.insert(from) {
        return Ok(false);
    }
    if let Some(slots) = heap.get(from)?.as_object() {
        for &next in &slots.traits {
            if reaches(heap, next, to, visited)? {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Add a local slot. Shadowing a visible slot is rejected like a trait
/// conflict.
pub fn add_slot(
    heap: &mut Heap,
    symbols: &SymbolTable,
    object: Value,
    name: Symbol,
    value: Value,
) -> Result<(), VmError> {
    expect_object(heap, object)?;
    if let LookupResult::Found { holder, .. } = lookup(heap, object, name)? {
        return Err(SlotExistsError {
            slot: name,
            name: symbols.name(name).unwrap_or("?").to_string(),
            offender: defining_root(heap, object, holder)?,
        }
        .into());
    }
    heap.charge(SlotObject::SLOT_SIZE)?;
    if let Some(slots) = heap.get_mut(object)?.as_object_mut() {
        slots.slots.insert(name, value);
    }
    Ok(())
}

/// Remove a local slot, returning its value. Trait slots are untouched.
pub fn remove_slot(heap: &mut Heap, object: Value, name: Symbol) -> Result<Option<Value>, VmError> {
    expect_object(heap, object)?;
    let removed = heap
        .get_mut(object)?
        .as_object_mut()
        .and_then(|slots| slots.slots.remove(&name));
    if removed.is_some() {
        heap.refund(SlotObject::SLOT_SIZE);
    }
    Ok(removed)
}

fn expect_object(heap: &Heap, value: Value) -> Result<(), VmError> {
    if !value.is_reference() {
        return Err(RuntimeError::NotAnObject(value).into());
    }
    match heap.get(value)?.as_object() {
        Some(_) => Ok(()),
        None => Err(RuntimeError::NotAnObject(value).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HeapObject, HeapSettings, NoRoots, SlotObject};

    struct Fixture {
        heap: Heap,
        symbols: SymbolTable,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                heap: Heap::new(HeapSettings::default()),
                symbols: SymbolTable::new(),
            }
        }

        fn sym(&mut self, name: &str) -> Symbol {
            self.symbols.lookup_or_add(name)
        }

        fn object(&mut self, slots: &[(&str, i64)]) -> Value {
            let mut object = SlotObject::default();
            for &(name, value) in slots {
                let symbol = self.sym(name);
                object.slots.insert(symbol, Value::from_i64(value).unwrap());
            }
            self.heap
                .allocate(HeapObject::Object(object), &mut NoRoots)
                .unwrap()
        }

        fn traits(&self, object: Value) -> Vec<Value> {
            self.heap.get(object).unwrap().as_object().unwrap().traits.clone()
        }

        fn lookup(&mut self, object: Value, name: &str) -> LookupResult {
            let symbol = self.sym(name);
            lookup(&self.heap, object, symbol).unwrap()
        }
    }

    fn int(v: i64) -> Value {
        Value::from_i64(v).unwrap()
    }

    #[test]
    fn local_slots_first() {
        let mut f = Fixture::new();
        let object = f.object(&[("x", 1)]);
        assert_eq!(f.lookup(object, "x"), LookupResult::Found {
            value: int(1),
            holder: object
        });
        assert_eq!(f.lookup(object, "y"), LookupResult::NotFound);
        assert_eq!(f.lookup(int(3), "x"), LookupResult::NotFound);
    }

    #[test]
    fn traits_in_addition_order() {
        let mut f = Fixture::new();
        let object = f.object(&[]);
        let t1 = f.object(&[("a", 1)]);
        let t2 = f.object(&[("b", 2)]);
        compose(&mut f.heap, &f.symbols, object, t1).unwrap();
        compose(&mut f.heap, &f.symbols, object, t2).unwrap();

        assert_eq!(f.traits(object), vec![t1, t2]);
        assert_eq!(f.lookup(object, "b"), LookupResult::Found {
            value: int(2),
            holder: t2
        });
        let names = visible_slots(&f.heap, object).unwrap();
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn conflicting_trait_is_rejected_and_names_offender() {
        let mut f = Fixture::new();
        let object = f.object(&[]);
        let t1 = f.object(&[("x", 1)]);
        let t2 = f.object(&[("x", 2)]);
        compose(&mut f.heap, &f.symbols, object, t1).unwrap();

        let err = compose(&mut f.heap, &f.symbols, object, t2).unwrap_err();
        let VmError::Runtime(RuntimeError::SlotExists(err)) = err else {
            panic!("expected slot conflict, got {err:?}");
        };
        assert_eq!(err.name, "x");
        assert_eq!(err.offender, t1);
        assert_eq!(f.traits(object), vec![t1], "trait list must be unchanged");
    }

    #[test]
    fn conflict_with_local_slot_names_the_object() {
        let mut f = Fixture::new();
        let object = f.object(&[("x", 1)]);
        let t = f.object(&[("x", 2), ("y", 3)]);
        let err = compose(&mut f.heap, &f.symbols, object, t).unwrap_err();
        assert!(matches!(
            err,
            VmError::Runtime(RuntimeError::SlotExists(SlotExistsError { offender, .. }))
                if offender == object
        ));
        assert!(f.traits(object).is_empty());
        assert_eq!(f.lookup(object, "y"), LookupResult::NotFound);
    }

    #[test]
    fn nested_trait_conflict_names_direct_trait() {
        let mut f = Fixture::new();
        let object = f.object(&[]);
        let inner = f.object(&[("x", 1)]);
        let outer = f.object(&[]);
        compose(&mut f.heap, &f.symbols, outer, inner).unwrap();
        compose(&mut f.heap, &f.symbols, object, outer).unwrap();

        let other = f.object(&[("x", 2)]);
        let err = compose(&mut f.heap, &f.symbols, object, other).unwrap_err();
        assert!(matches!(
            err,
            VmError::Runtime(RuntimeError::SlotExists(SlotExistsError { offender, .. }))
                if offender == outer
        ));
    }

    #[test]
    fn cyclic_traits_terminate() {
        let mut f = Fixture::new();
        let a = f.object(&[("a", 1)]);
        let b = f.object(&[("b", 2)]);
        compose(&mut f.heap, &f.symbols, a, b).unwrap();
        // b -> a would conflict through the cycle, so wire it by hand
        f.heap
            .get_mut(b)
            .unwrap()
            .as_object_mut()
            .unwrap()
            .traits
            .push(a);
        assert_eq!(f.lookup(a, "missing"), LookupResult::NotFound);
        assert_eq!(f.lookup(b, "a").value(), Some(int(1)));
    }

    #[test]
    fn add_and_remove_slots() {
        let mut f = Fixture::new();
        let object = f.object(&[]);
        let x = f.sym("x");
        add_slot(&mut f.heap, &f.symbols, object, x, int(4)).unwrap();
        assert_eq!(f.lookup(object, "x").value(), Some(int(4)));

        let err = add_slot(&mut f.heap, &f.symbols, object, x, int(5)).unwrap_err();
        assert!(matches!(err, VmError::Runtime(RuntimeError::SlotExists(_))));

        assert_eq!(remove_slot(&mut f.heap, object, x).unwrap(), Some(int(4)));
        assert_eq!(remove_slot(&mut f.heap, object, x).unwrap(), None);
        assert_eq!(f.lookup(object, "x"), LookupResult::NotFound);
    }

    #[test]
    fn growth_is_charged_to_the_heap() {
        let mut f = Fixture::new();
        let object = f.object(&[]);
        let t = f.object(&[("a", 1)]);
        let x = f.sym("x");
        let before = f.heap.used();

        add_slot(&mut f.heap, &f.symbols, object, x, int(4)).unwrap();
        compose(&mut f.heap, &f.symbols, object, t).unwrap();
        assert_eq!(f.heap.used(), before + SlotObject::SLOT_SIZE + SlotObject::TRAIT_SIZE);

        remove_slot(&mut f.heap, object, x).unwrap();
        assert_eq!(f.heap.used(), before + SlotObject::TRAIT_SIZE);
    }

    #[test]
    fn composing_non_objects_fails() {
        let mut f = Fixture::new();
        let object = f.object(&[]);
        let err = compose(&mut f.heap, &f.symbols, object, int(1)).unwrap_err();
        assert!(matches!(err, VmError::Runtime(RuntimeError::NotAnObject(_))));
    }
}
