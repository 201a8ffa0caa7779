use bytecode::{Constant, Image};

use crate::{
    CallStack, Context, DEFAULT_MAILBOX_CAPACITY, DEFAULT_MAX_FRAMES, DEFAULT_STACK_SIZE, Envelope,
    Fault, GcStats, Heap, HeapObject, HeapSettings, LookupResult, Message, Method, RootProvider,
    RuntimeError, SlotObject, Symbol, SymbolTable, Value, VmError,
};

#[derive(Debug, Clone)]
pub struct MachineCreateInfo {
    pub heap: HeapSettings,
    /// Operand stack capacity of every context.
    pub stack_size: usize,
    pub max_frames: usize,
    /// Pending envelopes per slot object.
    pub mailbox_capacity: usize,
}

impl Default for MachineCreateInfo {
    fn default() -> Self {
        Self {
            heap: HeapSettings::default(),
            stack_size: DEFAULT_STACK_SIZE,
            max_frames: DEFAULT_MAX_FRAMES,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

impl MachineCreateInfo {
    pub fn validate(&self) -> Result<(), &'static str> {
        self.heap.validate()?;
        if self.stack_size == 0 {
            return Err("stack_size must be > 0");
        }
        if self.max_frames == 0 {
            return Err("max_frames must be > 0");
        }
        if self.mailbox_capacity == 0 {
            return Err("mailbox_capacity must be > 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ready,
    Halted(Value),
    /// Sticky: every later step reports the same fault.
    Faulted(Fault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Halted(Value),
}

/// One virtual machine: code, constant pool, call stack and a private heap.
pub struct Machine {
    pub(crate) heap: Heap,
    pub(crate) calls: CallStack,
    pub(crate) constants: Vec<Value>,
    pub(crate) symbols: SymbolTable,
    pub(crate) code: Vec<u8>,
    pub(crate) ip: usize,
    pub(crate) status: Status,
    /// Values the embedder is holding across an allocation.
    pub(crate) scratch: Vec<Value>,
    pub(crate) mailbox_capacity: usize,
}

pub(crate) struct MachineRoots<'a> {
    calls: &'a mut CallStack,
    constants: &'a mut Vec<Value>,
    symbols: &'a mut SymbolTable,
    scratch: &'a mut Vec<Value>,
}

impl RootProvider for MachineRoots<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.calls.visit_values_mut(visitor);
        self.constants.iter_mut().for_each(&mut *visitor);
        self.symbols.strings_mut().for_each(&mut *visitor);
        self.scratch.iter_mut().for_each(visitor);
    }
}

impl Machine {
    /// An empty machine with a single root context.
    ///
    /// # Panics
    ///
    /// Panics if `info` does not validate.
    pub fn new(info: &MachineCreateInfo) -> Self {
        info.validate().expect("Invalid Machine Settings");
        let mut calls = CallStack::new(info.max_frames, info.stack_size);
        calls.reset(Value::NIL);
        Self {
            heap: Heap::new(info.heap.clone()),
            calls,
            constants: Vec::new(),
            symbols: SymbolTable::new(),
            code: Vec::new(),
            ip: 0,
            status: Status::Ready,
            scratch: Vec::new(),
            mailbox_capacity: info.mailbox_capacity,
        }
    }

    /// Build a machine from an image, materialising its constant pool.
    pub fn load(image: &Image, info: &MachineCreateInfo) -> Result<Self, VmError> {
        let mut machine = Self::new(info);
        machine.code = image.code.clone();
        for constant in &image.constants {
            let value = machine.materialize(constant)?;
            machine.constants.push(value);
        }
        log::debug!(
            "loaded image: {} constants, {} code bytes, {} symbols",
            machine.constants.len(),
            machine.code.len(),
            machine.symbols.len()
        );
        Ok(machine)
    }

    fn materialize(&mut self, constant: &Constant) -> Result<Value, VmError> {
        let value = match constant {
            Constant::Nil => Value::NIL,
            Constant::Boolean(value) => Value::from_bool(*value),
            Constant::Integer(value) => Value::from_i64(*value).ok_or(Fault::IntegerOverflow)?,
            Constant::String(text) => self.alloc_string(text)?,
            Constant::Symbol(name) => Value::from_symbol(self.intern(name)?),
            Constant::Method {
                name,
                args,
                locals,
                entry,
                scope,
            } => {
                let scope = match scope {
                    Some(index) => self
                        .constants
                        .get(*index as usize)
                        .copied()
                        .ok_or(Fault::InvalidConstant(*index))?,
                    None => Value::NIL,
                };
                self.new_method(name, *args, *locals, *entry, scope)?
            }
            Constant::Object { slots } => {
                // intern first: it allocates, and the slot values are only
                // rooted through the pool until the object exists
                let names = slots
                    .iter()
                    .map(|(name, _)| self.intern(name))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut object = SlotObject::new(self.mailbox_capacity);
                for (symbol, &(_, index)) in names.into_iter().zip(slots) {
                    let value = self
                        .constants
                        .get(index as usize)
                        .copied()
                        .ok_or(Fault::InvalidConstant(index))?;
                    object.slots.insert(symbol, value);
                }
                self.allocate(HeapObject::Object(object))?
            }
        };
        Ok(value)
    }

    // ── Allocation ────────────────────────────────────────────────────

    pub(crate) fn allocate(&mut self, object: HeapObject) -> Result<Value, Fault> {
        let Machine {
            heap,
            calls,
            constants,
            symbols,
            scratch,
            ..
        } = self;
        let mut roots = MachineRoots {
            calls,
            constants,
            symbols,
            scratch,
        };
        Ok(heap.allocate(object, &mut roots)?)
    }

    /// Run a full collection now.
    pub fn collect(&mut self) {
        let Machine {
            heap,
            calls,
            constants,
            symbols,
            scratch,
            ..
        } = self;
        heap.collect(&mut MachineRoots {
            calls,
            constants,
            symbols,
            scratch,
        });
    }

    /// Make sure `bytes` more fit in the active space, collecting if they
    /// do not. `values` stay valid across that collection.
    pub(crate) fn make_room(&mut self, bytes: usize, values: &mut [Value]) -> Result<(), Fault> {
        if bytes <= self.heap.available() {
            return Ok(());
        }
        let base = self.scratch.len();
        self.scratch.extend_from_slice(values);
        self.collect();
        values.copy_from_slice(&self.scratch[base..]);
        self.scratch.truncate(base);
        if bytes > self.heap.available() {
            return Err(Fault::OutOfMemory {
                requested: bytes,
                available: self.heap.available(),
            });
        }
        Ok(())
    }

    pub fn alloc_string(&mut self, text: &str) -> Result<Value, Fault> {
        self.allocate(HeapObject::String(text.to_string()))
    }

    pub fn alloc_array(&mut self, values: Vec<Value>) -> Result<Value, Fault> {
        self.allocate(HeapObject::Array(values))
    }

    pub fn new_object(&mut self) -> Result<Value, Fault> {
        self.allocate(HeapObject::Object(SlotObject::new(self.mailbox_capacity)))
    }

    /// A method activated at `entry`. Its activations see `scope` in r1.
    pub fn new_method(
        &mut self,
        name: &str,
        arg_count: u8,
        local_count: u8,
        entry: u32,
        scope: Value,
    ) -> Result<Value, Fault> {
        let mut rooted = [scope];
        let name = self.intern_rooted(name, &mut rooted)?;
        let [scope] = rooted;
        self.allocate(HeapObject::Method(Method {
            name,
            arg_count,
            local_count,
            scope,
            entry,
        }))
    }

    pub fn new_message(&mut self, selector: Symbol, arguments: Vec<Value>) -> Result<Value, Fault> {
        self.allocate(HeapObject::Message(Message {
            selector,
            arguments,
        }))
    }

    // ── Symbols ───────────────────────────────────────────────────────

    /// Intern `name`, allocating its backing string the first time.
    pub fn intern(&mut self, name: &str) -> Result<Symbol, Fault> {
        let (symbol, added) = self.symbols.add(name);
        if added {
            let string = self.alloc_string(name)?;
            self.symbols.attach_string(symbol, string);
        }
        Ok(symbol)
    }

    /// Like [`intern`](Self::intern), keeping `values` valid across the
    /// allocation.
    fn intern_rooted(&mut self, name: &str, values: &mut [Value]) -> Result<Symbol, Fault> {
        let base = self.scratch.len();
        self.scratch.extend_from_slice(values);
        let result = self.intern(name);
        values.copy_from_slice(&self.scratch[base..]);
        self.scratch.truncate(base);
        result
    }

    /// [`Symbol::NOT_FOUND`] if `name` was never interned.
    pub fn find_symbol(&self, name: &str) -> Symbol {
        self.symbols.lookup(name)
    }

    pub fn symbol_name(&self, symbol: Symbol) -> Option<&str> {
        self.symbols.name(symbol)
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    // ── Objects ───────────────────────────────────────────────────────

    pub fn string(&self, value: Value) -> Result<&str, Fault> {
        let object = self.heap.get(value).map_err(|_| Fault::TypeError {
            expected: "string",
            got: value,
        })?;
        object.as_str().ok_or(Fault::TypeError {
            expected: "string",
            got: value,
        })
    }

    /// Value of the slot `name` as seen from `receiver`.
    pub fn lookup_slot(&self, receiver: Value, name: &str) -> Result<Option<Value>, Fault> {
        let symbol = self.symbols.lookup(name);
        if !symbol.is_found() {
            return Ok(None);
        }
        Ok(crate::lookup(&self.heap, receiver, symbol)?.value())
    }

    pub fn add_slot(&mut self, object: Value, name: &str, value: Value) -> Result<(), VmError> {
        let mut rooted = [object, value];
        let symbol = self.intern_rooted(name, &mut rooted)?;
        self.make_room(SlotObject::SLOT_SIZE, &mut rooted)?;
        let [object, value] = rooted;
        crate::add_slot(&mut self.heap, &self.symbols, object, symbol, value)
    }

    pub fn remove_slot(&mut self, object: Value, name: &str) -> Result<Option<Value>, VmError> {
        let symbol = self.symbols.lookup(name);
        if !symbol.is_found() {
            return Ok(None);
        }
        crate::remove_slot(&mut self.heap, object, symbol)
    }

    /// Compose `trait_value` into `object`. See [`crate::compose`].
    pub fn add_trait(&mut self, object: Value, trait_value: Value) -> Result<(), VmError> {
        let mut rooted = [object, trait_value];
        self.make_room(SlotObject::TRAIT_SIZE, &mut rooted)?;
        let [object, trait_value] = rooted;
        crate::compose(&mut self.heap, &self.symbols, object, trait_value)
    }

    pub(crate) fn resolve(&self, receiver: Value, selector: Symbol) -> Result<LookupResult, Fault> {
        crate::lookup(&self.heap, receiver, selector)
    }

    /// Queue `message` in the mailbox of `receiver`.
    ///
    /// May collect to make room for the envelope; references the caller
    /// holds besides the three arguments are stale afterwards.
    pub fn deliver(
        &mut self,
        receiver: Value,
        message: Value,
        sender: Value,
    ) -> Result<(), VmError> {
        let mut rooted = [receiver, message, sender];
        self.make_room(SlotObject::ENVELOPE_SIZE, &mut rooted)?;
        let [receiver, message, sender] = rooted;
        self.mailbox(receiver)?
            .deliver(Envelope { message, sender })
            .map_err(|_| RuntimeError::MailboxFull { receiver })?;
        // cannot fail, the room was made above
        self.heap.charge(SlotObject::ENVELOPE_SIZE)?;
        Ok(())
    }

    /// Take the oldest envelope out of the mailbox of `receiver`.
    pub fn receive(&mut self, receiver: Value) -> Result<Option<Envelope>, VmError> {
        let envelope = self.mailbox(receiver)?.receive();
        if envelope.is_some() {
            self.heap.refund(SlotObject::ENVELOPE_SIZE);
        }
        Ok(envelope)
    }

    fn mailbox(&self, receiver: Value) -> Result<&crate::Mailbox<Envelope>, VmError> {
        if !receiver.is_reference() {
            return Err(RuntimeError::NotAnObject(receiver).into());
        }
        match self.heap.get(receiver)?.as_object() {
            Some(object) => Ok(&object.mailbox),
            None => Err(RuntimeError::NotAnObject(receiver).into()),
        }
    }

    // ── State ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn status(&self) -> &Status {
        &self.status
    }

    #[must_use]
    pub fn ip(&self) -> usize {
        self.ip
    }

    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Replace the program and rewind to its start.
    pub fn set_code(&mut self, code: Vec<u8>) {
        self.code = code;
        self.ip = 0;
        self.status = Status::Ready;
    }

    #[must_use]
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// Append a constant pool entry and return its index.
    pub fn push_constant(&mut self, value: Value) -> Result<u16, Fault> {
        let index = u16::try_from(self.constants.len())
            .map_err(|_| Fault::InvalidConstant(u16::MAX))?;
        self.constants.push(value);
        Ok(index)
    }

    #[must_use]
    pub fn call_depth(&self) -> usize {
        self.calls.depth()
    }

    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    #[must_use]
    pub fn stats(&self) -> GcStats {
        self.heap.stats()
    }

    pub(crate) fn context(&self) -> Result<&Context, Fault> {
        self.calls.current().ok_or(Fault::StackUnderflow)
    }

    pub(crate) fn context_mut(&mut self) -> Result<&mut Context, Fault> {
        self.calls.current_mut().ok_or(Fault::StackUnderflow)
    }

    /// Operand stack of the current context, bottom first.
    #[must_use]
    pub fn stack(&self) -> &[Value] {
        self.calls
            .current()
            .map(|context| context.stack.as_slice())
            .unwrap_or(&[])
    }

    pub fn push(&mut self, value: Value) -> Result<(), Fault> {
        self.context_mut()?.stack.push(value)
    }

    pub fn pop(&mut self) -> Result<Value, Fault> {
        self.context_mut()?.stack.pop()
    }

    pub fn register(&self, reg: u8) -> Result<Value, Fault> {
        self.context()?.register(reg)
    }

    pub fn set_register(&mut self, reg: u8, value: Value) -> Result<(), Fault> {
        self.context_mut()?.set_register(reg, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> Value {
        Value::from_i64(v).unwrap()
    }

    fn tiny() -> MachineCreateInfo {
        MachineCreateInfo {
            heap: HeapSettings { space_size: 512 },
            ..Default::default()
        }
    }

    #[test]
    fn settings_validate() {
        assert!(MachineCreateInfo::default().validate().is_ok());
        let info = MachineCreateInfo {
            stack_size: 0,
            ..Default::default()
        };
        assert_eq!(info.validate(), Err("stack_size must be > 0"));
        let info = MachineCreateInfo {
            heap: HeapSettings { space_size: 0 },
            ..Default::default()
        };
        assert!(info.validate().is_err());
    }

    #[test]
    fn new_machine_has_a_root_context() {
        let machine = Machine::new(&MachineCreateInfo::default());
        assert_eq!(machine.call_depth(), 1);
        assert_eq!(machine.register(0), Ok(Value::NIL));
        assert_eq!(machine.register(8), Err(Fault::InvalidRegister(8)));
        assert!(machine.stack().is_empty());
        assert_eq!(machine.status(), &Status::Ready);
    }

    #[test]
    fn load_materialises_constants() {
        let image = Image::new(Vec::new(), vec![
            Constant::Integer(7),
            Constant::Symbol("size".into()),
            Constant::String("hello".into()),
            Constant::Method {
                name: "run".into(),
                args: 1,
                locals: 2,
                entry: 16,
                scope: Some(2),
            },
            Constant::Object {
                slots: vec![("size".into(), 0), ("greeting".into(), 2)],
            },
        ]);
        let machine = Machine::load(&image, &MachineCreateInfo::default()).unwrap();
        let pool = machine.constants();
        assert_eq!(pool[0], int(7));

        let size = machine.find_symbol("size");
        assert_eq!(pool[1], Value::from_symbol(size));
        assert_eq!(machine.string(machine.symbols().string(size)), Ok("size"));
        assert_eq!(machine.string(pool[2]), Ok("hello"));

        let method = *machine.heap().get(pool[3]).unwrap().as_method().unwrap();
        assert_eq!(machine.symbol_name(method.name), Some("run"));
        assert_eq!((method.arg_count, method.local_count, method.entry), (1, 2, 16));
        assert_eq!(method.scope, pool[2]);

        assert_eq!(machine.lookup_slot(pool[4], "size"), Ok(Some(int(7))));
        assert_eq!(machine.lookup_slot(pool[4], "greeting"), Ok(Some(pool[2])));
        assert_eq!(machine.lookup_slot(pool[4], "missing"), Ok(None));
    }

    #[test]
    fn forward_object_slot_reference_is_rejected() {
        let image = Image::new(Vec::new(), vec![Constant::Object {
            slots: vec![("x".into(), 3)],
        }]);
        assert!(matches!(
            Machine::load(&image, &MachineCreateInfo::default()),
            Err(VmError::Fault(Fault::InvalidConstant(3)))
        ));
    }

    #[test]
    fn collection_keeps_every_root() {
        let mut machine = Machine::new(&tiny());
        let pooled = machine.alloc_string("pooled").unwrap();
        machine.push_constant(pooled).unwrap();
        let stacked = machine.alloc_string("stacked").unwrap();
        machine.push(stacked).unwrap();
        let held = machine.alloc_string("held").unwrap();
        machine.set_register(4, held).unwrap();
        machine.intern("symbol").unwrap();
        machine.alloc_string("garbage").unwrap();

        machine.collect();

        let space = machine.heap().active_space();
        assert_eq!(machine.heap().object_count(), 4);
        assert_eq!(machine.string(machine.constants()[0]), Ok("pooled"));
        assert_eq!(machine.string(machine.stack()[0]), Ok("stacked"));
        let held = machine.register(4).unwrap();
        assert_eq!(held.reference().unwrap().0, space);
        assert_eq!(machine.string(held), Ok("held"));
        let symbol = machine.find_symbol("symbol");
        assert_eq!(machine.string(machine.symbols().string(symbol)), Ok("symbol"));
    }

    #[test]
    fn add_slot_survives_a_collection_while_interning() {
        let mut machine = Machine::new(&tiny());
        let object = machine.new_object().unwrap();
        machine.push(object).unwrap();
        let value = machine.alloc_string("value").unwrap();
        machine.push(value).unwrap();
        // fill the space so interning the slot name collects
        while machine.heap().available() > 32 {
            machine.alloc_string("filler").unwrap();
        }
        let before = machine.stats().collections;
        let [object, value] = [machine.stack()[0], machine.stack()[1]];
        machine
            .add_slot(object, "a-rather-long-slot-name-to-force-gc", value)
            .unwrap();
        assert!(machine.stats().collections > before);

        let object = machine.stack()[0];
        let value = machine
            .lookup_slot(object, "a-rather-long-slot-name-to-force-gc")
            .unwrap()
            .unwrap();
        assert_eq!(machine.string(value), Ok("value"));
    }

    #[test]
    fn mailbox_delivery() {
        let info = MachineCreateInfo {
            mailbox_capacity: 1,
            ..Default::default()
        };
        let mut machine = Machine::new(&info);
        let object = machine.new_object().unwrap();
        machine.deliver(object, int(1), Value::NIL).unwrap();
        let err = machine.deliver(object, int(2), Value::NIL).unwrap_err();
        assert!(matches!(
            err,
            VmError::Runtime(RuntimeError::MailboxFull { receiver }) if receiver == object
        ));
        assert_eq!(
            machine.receive(object).unwrap(),
            Some(Envelope {
                message: int(1),
                sender: Value::NIL
            })
        );
        assert_eq!(machine.receive(object).unwrap(), None);
        assert!(matches!(
            machine.deliver(int(3), int(1), Value::NIL),
            Err(VmError::Runtime(RuntimeError::NotAnObject(_)))
        ));
    }

    #[test]
    fn pending_envelopes_are_charged() {
        let mut machine = Machine::new(&MachineCreateInfo::default());
        let object = machine.new_object().unwrap();
        let before = machine.heap().used();
        machine.deliver(object, int(1), Value::NIL).unwrap();
        assert_eq!(machine.heap().used(), before + SlotObject::ENVELOPE_SIZE);
        machine.receive(object).unwrap();
        assert_eq!(machine.heap().used(), before);
    }

    #[test]
    fn growing_objects_never_overfill_the_space() {
        let mut machine = Machine::new(&tiny());
        let object = machine.new_object().unwrap();
        machine.push(object).unwrap();

        let mut added = 0;
        let err = loop {
            let object = machine.stack()[0];
            match machine.add_slot(object, &format!("s{added}"), int(added)) {
                Ok(()) => added += 1,
                Err(err) => break err,
            }
            assert!(added < 100, "the space must fill up");
        };
        assert!(matches!(err, VmError::Fault(Fault::OutOfMemory { .. })));
        let space_size = machine.heap().settings().space_size;
        assert!(machine.heap().used() <= space_size);

        // everything is live, so a collection copies exactly what was charged
        let used = machine.heap().used();
        machine.collect();
        assert_eq!(machine.heap().used(), used);
        assert!(machine.heap().used() <= space_size);

        let object = machine.stack()[0];
        assert_eq!(machine.lookup_slot(object, "s0"), Ok(Some(int(0))));
    }
}
