use crate::{Fault, OperandStack, RuntimeError, Value, VmError};

/// r0..r7 exist in every context.
pub const GENERAL_REGISTERS: usize = 8;
pub const RECEIVER_REGISTER: u8 = 0;
pub const SCOPE_REGISTER: u8 = 1;
pub const RETURN_REGISTER: u8 = 2;
/// Arguments start here, followed by the method's locals.
pub const FIRST_ARGUMENT_REGISTER: u8 = GENERAL_REGISTERS as u8;

/// Default bound on nested activations.
pub const DEFAULT_MAX_FRAMES: usize = 1024;

/// One pending call.
#[derive(Debug, Clone)]
pub struct Context {
    /// Index of the calling context in the call stack.
    pub previous: Option<usize>,
    pub sender: Value,
    pub receiver: Value,
    /// The method object this context activates, nil for the root context.
    pub method: Value,
    /// Caller's instruction pointer to resume at on return.
    pub return_ip: usize,
    pub stack: OperandStack,
    registers: Vec<Value>,
}

/// What [`CallStack::enter`] needs to know about a method.
#[derive(Debug, Clone, Copy)]
pub struct MethodShape {
    pub arg_count: u8,
    pub local_count: u8,
    pub scope: Value,
}

impl Context {
    pub fn new(
        receiver: Value,
        sender: Value,
        method: Value,
        extra_registers: usize,
        stack_size: usize,
    ) -> Self {
        let mut registers = vec![Value::NIL; GENERAL_REGISTERS + extra_registers];
        registers[RECEIVER_REGISTER as usize] = receiver;
        Self {
            previous: None,
            sender,
            receiver,
            method,
            return_ip: 0,
            stack: OperandStack::new(stack_size),
            registers,
        }
    }

    pub fn registers(&self) -> &[Value] {
        &self.registers
    }

    pub fn register(&self, reg: u8) -> Result<Value, Fault> {
        self.registers
            .get(reg as usize)
            .copied()
            .ok_or(Fault::InvalidRegister(reg))
    }

    pub fn set_register(&mut self, reg: u8, value: Value) -> Result<(), Fault> {
        let slot = self
            .registers
            .get_mut(reg as usize)
            .ok_or(Fault::InvalidRegister(reg))?;
        *slot = value;
        Ok(())
    }

    /// Bytes a snapshot of this context is charged for.
    pub fn size(&self) -> usize {
        (4 + self.registers.len() + self.stack.depth()) * std::mem::size_of::<Value>()
    }

    /// Visit every value this context keeps alive.
    pub fn visit_values_mut(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.sender);
        visitor(&mut self.receiver);
        visitor(&mut self.method);
        self.registers.iter_mut().for_each(&mut *visitor);
        self.stack.iter_mut().for_each(visitor);
    }
}

/// LIFO of live contexts. The primary collector root.
#[derive(Debug, Clone)]
pub struct CallStack {
    frames: Vec<Context>,
    max_frames: usize,
    stack_size: usize,
}

impl CallStack {
    pub fn new(max_frames: usize, stack_size: usize) -> Self {
        Self {
            frames: Vec::new(),
            max_frames,
            stack_size,
        }
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Context] {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut [Context] {
        &mut self.frames
    }

    pub fn current(&self) -> Option<&Context> {
        self.frames.last()
    }

    pub fn current_mut(&mut self) -> Option<&mut Context> {
        self.frames.last_mut()
    }

    /// Drop every frame and push a fresh root context.
    pub fn reset(&mut self, receiver: Value) -> &mut Context {
        self.frames.clear();
        self.frames.push(Context::new(receiver, Value::NIL, Value::NIL, 0, self.stack_size));
        &mut self.frames[0]
    }

    /// Push a context activating `method` on `receiver`.
    pub fn enter(
        &mut self,
        receiver: Value,
        sender: Value,
        method: Value,
        shape: &MethodShape,
        args: &[Value],
        return_ip: usize,
    ) -> Result<&mut Context, VmError> {
        if args.len() != shape.arg_count as usize {
            return Err(RuntimeError::ArityMismatch {
                expected: shape.arg_count,
                got: args.len(),
            }
            .into());
        }
        if self.frames.len() >= self.max_frames {
            return Err(Fault::CallStackOverflow {
                depth: self.frames.len(),
            }
            .into());
        }

        let extra = shape.arg_count as usize + shape.local_count as usize;
        let mut context = Context::new(receiver, sender, method, extra, self.stack_size);
        context.previous = self.frames.len().checked_sub(1);
        context.return_ip = return_ip;
        context.registers[SCOPE_REGISTER as usize] = shape.scope;
        let first = FIRST_ARGUMENT_REGISTER as usize;
        context.registers[first..first + args.len()].copy_from_slice(args);

        log::debug!(
            "enter {:?} on {:?} (depth {})",
            method,
            receiver,
            self.frames.len() + 1
        );
        self.frames.push(context);
        let top = self.frames.len() - 1;
        Ok(&mut self.frames[top])
    }

    /// Pop the current context. Returns its result (top of its operand
    /// stack, nil if empty) and the caller's resume address.
    pub fn leave(&mut self) -> Result<(Value, usize), Fault> {
        let mut context = self.frames.pop().ok_or(Fault::StackUnderflow)?;
        let value = context.stack.pop().unwrap_or(Value::NIL);
        log::debug!("leave {:?} (depth {})", context.method, self.frames.len());
        Ok((value, context.return_ip))
    }

    pub(crate) fn replace(&mut self, frames: Vec<Context>) {
        self.frames = frames;
    }

    pub fn visit_values_mut(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for frame in self.frames.iter_mut() {
            frame.visit_values_mut(visitor);
        }
    }
}
