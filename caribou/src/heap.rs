//! Semispace copying collector.
//!
//! The heap owns two equally sized spaces. Objects are bump-accounted into
//! the active one; when an allocation does not fit, the spaces flip and
//! every object reachable from the roots is copied over (Cheney). The old
//! slot of a copied object holds a forwarding entry for the rest of the
//! cycle, so every object is copied at most once and cycles terminate.
//!
//! The collector is decoupled from the interpreter. Consumers provide:
//! - A [`RootProvider`] to supply live roots at GC time.
//! - Objects that report [`HeapObject::object_size`] and enumerate their
//!   references through [`HeapObject::visit_refs_mut`].
//!
//! Collection is stop-the-world. An incremental tri-color variant would
//! keep the same copy/scan split: roots and copied-but-unscanned objects
//! are grey, the scan pointer separates grey from black, and a write
//! barrier on slot stores would shade the stored value grey while a cycle
//! is in progress. It is not implemented.

use std::{fmt, mem};

use crate::{HeapObject, Value};

pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

/// No roots at all. Everything unreachable from a pending allocation dies.
pub struct NoRoots;

impl RootProvider for NoRoots {
    fn visit_roots(&mut self, _visitor: &mut dyn FnMut(&mut Value)) {}
}

impl RootProvider for Vec<Value> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.iter_mut().for_each(visitor);
    }
}

// ── Heap settings ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Size of one semispace in bytes. The heap reserves twice this.
    pub space_size: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            space_size: 4 * 1024 * 1024, // 4 MB
        }
    }
}

impl HeapSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.space_size == 0 {
            return Err("space_size must be > 0");
        }
        if !self.space_size.is_multiple_of(mem::size_of::<Value>()) {
            return Err("space_size must be a multiple of the word size");
        }
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The object does not fit even after a collection.
    OutOfMemory { requested: usize, available: usize },
    /// The reference points into the inactive space or at a freed slot.
    StaleReference(Value),
    NotAReference(Value),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "out of memory: {requested} bytes requested, {available} available"
            ),
            HeapError::StaleReference(value) => write!(f, "stale reference {value:?}"),
            HeapError::NotAReference(value) => write!(f, "{value:?} is not a reference"),
        }
    }
}

impl std::error::Error for HeapError {}

// ── Statistics ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub collections: usize,
    /// Totals over every cycle.
    pub objects_copied: usize,
    pub bytes_copied: usize,
    /// What the most recent cycle freed.
    pub last_reclaimed_objects: usize,
    pub last_reclaimed_bytes: usize,
}

// ── Spaces ────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Slot {
    Live(HeapObject),
    Forwarded(Value),
}

#[derive(Debug)]
struct Space {
    id: u8,
    objects: Vec<Slot>,
    used: usize,
}

impl Space {
    fn new(id: u8) -> Self {
        Self {
            id,
            objects: Vec::new(),
            used: 0,
        }
    }

    fn insert(&mut self, object: HeapObject) -> Value {
        let index = self.objects.len();
        self.used += object.object_size();
        self.objects.push(Slot::Live(object));
        Value::from_reference(self.id, index)
    }

    fn clear(&mut self) {
        self.objects.clear();
        self.used = 0;
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Heap {
    spaces: [Space; 2],
    active: usize,
    settings: HeapSettings,
    stats: GcStats,
}

impl Heap {
    /// # Panics
    ///
    /// Panics if `settings` does not validate.
    pub fn new(settings: HeapSettings) -> Self {
        settings.validate().expect("Invalid Heap Settings");
        Self {
            spaces: [Space::new(0), Space::new(1)],
            active: 0,
            settings,
            stats: GcStats::default(),
        }
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Id of the space new objects are allocated in.
    pub fn active_space(&self) -> u8 {
        self.spaces[self.active].id
    }

    /// Bytes accounted in the active space.
    pub fn used(&self) -> usize {
        self.spaces[self.active].used
    }

    pub fn available(&self) -> usize {
        self.settings.space_size.saturating_sub(self.used())
    }

    /// Number of objects in the active space.
    pub fn object_count(&self) -> usize {
        self.spaces[self.active].objects.len()
    }

    /// Allocate `object`, collecting first if it does not fit.
    ///
    /// References held by `object` itself are treated as roots during that
    /// collection. Every [`Value`] the caller keeps outside of `roots` is
    /// stale afterwards.
    pub fn allocate(
        &mut self,
        mut object: HeapObject,
        roots: &mut dyn RootProvider,
    ) -> Result<Value, HeapError> {
        let size = object.object_size();
        if size > self.available() {
            self.collect_with(roots, Some(&mut object));
            if size > self.available() {
                return Err(HeapError::OutOfMemory {
                    requested: size,
                    available: self.available(),
                });
            }
        }
        Ok(self.spaces[self.active].insert(object))
    }

    /// Charge `bytes` an object grew by after its allocation. Fails
    /// without collecting when they do not fit; callers that can supply
    /// roots make room first.
    pub fn charge(&mut self, bytes: usize) -> Result<(), HeapError> {
        if bytes > self.available() {
            return Err(HeapError::OutOfMemory {
                requested: bytes,
                available: self.available(),
            });
        }
        self.spaces[self.active].used += bytes;
        Ok(())
    }

    /// Give back `bytes` an object shrank by.
    pub fn refund(&mut self, bytes: usize) {
        let space = &mut self.spaces[self.active];
        space.used = space.used.saturating_sub(bytes);
    }

    pub fn get(&self, value: Value) -> Result<&HeapObject, HeapError> {
        let index = self.check(value)?;
        match &self.spaces[self.active].objects[index] {
            Slot::Live(object) => Ok(object),
            Slot::Forwarded(_) => Err(HeapError::StaleReference(value)),
        }
    }

    pub fn get_mut(&mut self, value: Value) -> Result<&mut HeapObject, HeapError> {
        let index = self.check(value)?;
        match &mut self.spaces[self.active].objects[index] {
            Slot::Live(object) => Ok(object),
            Slot::Forwarded(_) => Err(HeapError::StaleReference(value)),
        }
    }

    /// Whether `value` is a reference to a live object of the active space.
    pub fn contains(&self, value: Value) -> bool {
        self.get(value).is_ok()
    }

    fn check(&self, value: Value) -> Result<usize, HeapError> {
        let (space, index) = value.reference().ok_or(HeapError::NotAReference(value))?;
        let active = &self.spaces[self.active];
        if space != active.id || index >= active.objects.len() {
            return Err(HeapError::StaleReference(value));
        }
        Ok(index)
    }

    pub fn collect(&mut self, roots: &mut dyn RootProvider) {
        self.collect_with(roots, None);
    }

    fn collect_with(&mut self, roots: &mut dyn RootProvider, pending: Option<&mut HeapObject>) {
        let mut collection = self.begin_collection();
        roots.visit_roots(&mut |value| *value = collection.copy(*value));
        if let Some(object) = pending {
            object.visit_refs_mut(&mut |value| *value = collection.copy(*value));
        }
        collection.finish();
    }

    /// Flip the spaces and start a cycle by hand.
    ///
    /// Copy the roots with [`Collection::copy`], then call
    /// [`Collection::finish`] to scan and release the old space.
    pub fn begin_collection(&mut self) -> Collection<'_> {
        let from_index = self.active;
        self.active = 1 - from_index;
        let [first, second] = &mut self.spaces;
        let (from, to) = if from_index == 0 {
            (first, second)
        } else {
            (second, first)
        };
        to.clear();
        Collection {
            from_objects: from.objects.len(),
            from_used: from.used,
            from,
            to,
            stats: &mut self.stats,
            copied_objects: 0,
            copied_bytes: 0,
        }
    }
}

/// One collection cycle in progress.
pub struct Collection<'h> {
    from: &'h mut Space,
    to: &'h mut Space,
    stats: &'h mut GcStats,
    from_objects: usize,
    from_used: usize,
    copied_objects: usize,
    copied_bytes: usize,
}

impl Collection<'_> {
    /// Copy the object `value` refers to into the new space, or return
    /// the address it was already copied to during this cycle.
    ///
    /// Non-references and references outside the old space come back
    /// unchanged.
    pub fn copy(&mut self, value: Value) -> Value {
        let Some((space, index)) = value.reference() else {
            return value;
        };
        if space != self.from.id {
            return value;
        }
        let Some(slot) = self.from.objects.get_mut(index) else {
            return value;
        };
        match mem::replace(slot, Slot::Forwarded(value)) {
            Slot::Forwarded(new) => {
                *slot = Slot::Forwarded(new);
                new
            }
            Slot::Live(object) => {
                self.copied_objects += 1;
                self.copied_bytes += object.object_size();
                let new = self.to.insert(object);
                *slot = Slot::Forwarded(new);
                new
            }
        }
    }

    /// Scan the new space in copy order until every reference in it has
    /// been relocated, then drop the old space.
    pub fn finish(mut self) {
        let mut scan = 0;
        while scan < self.to.objects.len() {
            let slot = mem::replace(&mut self.to.objects[scan], Slot::Forwarded(Value::NIL));
            if let Slot::Live(mut object) = slot {
                object.visit_refs_mut(&mut |value| *value = self.copy(*value));
                self.to.objects[scan] = Slot::Live(object);
            }
            scan += 1;
        }

        let reclaimed_objects = self.from_objects - self.copied_objects;
        let reclaimed_bytes = self.from_used.saturating_sub(self.copied_bytes);
        self.from.clear();

        self.stats.collections += 1;
        self.stats.objects_copied += self.copied_objects;
        self.stats.bytes_copied += self.copied_bytes;
        self.stats.last_reclaimed_objects = reclaimed_objects;
        self.stats.last_reclaimed_bytes = reclaimed_bytes;

        log::debug!(
            "gc #{}: copied {} objects ({} bytes), reclaimed {} objects ({} bytes)",
            self.stats.collections,
            self.copied_objects,
            self.copied_bytes,
            reclaimed_objects,
            reclaimed_bytes,
        );
    }
}
