//! Fetch, decode and execute.
//!
//! Fatal conditions surface as [`Fault`]s and leave the machine faulted.
//! Runtime errors leave the instruction pointer on the failing
//! instruction so an embedder can inspect the state.

use std::cmp::Ordering;

use bytecode::{Instruction, WORD_SIZE, decode_at};

use crate::{
    Envelope, Fault, HeapObject, LookupResult, Machine, Method, MethodShape, RETURN_REGISTER,
    RuntimeError, SlotObject, Status, Step, Symbol, Value, VmError,
};

/// Where execution continues after an instruction.
enum Flow {
    Next,
    Jump(usize),
    Halt(Value),
}

impl Machine {
    /// Execute until the program halts.
    pub fn run(&mut self) -> Result<Value, VmError> {
        loop {
            if let Step::Halted(value) = self.step()? {
                return Ok(value);
            }
        }
    }

    /// Execute a single instruction.
    pub fn step(&mut self) -> Result<Step, VmError> {
        match &self.status {
            Status::Ready => {}
            Status::Halted(value) => return Ok(Step::Halted(*value)),
            Status::Faulted(fault) => return Err(fault.clone().into()),
        }

        match self.cycle() {
            Ok(Step::Halted(value)) => {
                log::debug!("halted at {} with {value:?}", self.ip);
                self.status = Status::Halted(value);
                Ok(Step::Halted(value))
            }
            Ok(Step::Continue) => Ok(Step::Continue),
            Err(VmError::Fault(fault)) => {
                log::error!("fault at {}: {fault}", self.ip);
                self.status = Status::Faulted(fault.clone());
                Err(fault.into())
            }
            Err(err) => {
                log::warn!("{err} at {}", self.ip);
                Err(err)
            }
        }
    }

    fn cycle(&mut self) -> Result<Step, VmError> {
        let ip = self.ip;
        // running off the end is a halt
        if ip == self.code.len() {
            return Ok(Step::Halted(self.register(RETURN_REGISTER)?));
        }
        if ip > self.code.len() || !ip.is_multiple_of(WORD_SIZE) {
            return Err(Fault::InvalidJump(ip).into());
        }

        let (instruction, next) = decode_at(&self.code, ip).map_err(Fault::from)?;
        log::trace!("{ip:>6}: {instruction}");

        match self.execute(instruction, next)? {
            Flow::Next => self.ip = next,
            Flow::Jump(target) => self.ip = target,
            Flow::Halt(value) => return Ok(Step::Halted(value)),
        }
        Ok(Step::Continue)
    }

    fn execute(&mut self, instruction: Instruction, next: usize) -> Result<Flow, VmError> {
        match instruction {
            Instruction::Noop => {}
            Instruction::Move { dst, src } => {
                let value = self.register(src)?;
                self.set_register(dst, value)?;
            }
            Instruction::LoadI { dst, idx } => {
                let value = self
                    .constants
                    .get(idx as usize)
                    .copied()
                    .ok_or(Fault::InvalidConstant(idx))?;
                self.set_register(dst, value)?;
            }

            // ── Stack ─────────────────────────────────────────────────
            Instruction::Push { src } => {
                let value = self.register(src)?;
                self.push(value)?;
            }
            Instruction::Pop { dst } => {
                let value = self.pop()?;
                self.set_register(dst, value)?;
            }
            Instruction::Swap => self.context_mut()?.stack.swap()?,
            Instruction::Dup => self.context_mut()?.stack.dup()?,
            Instruction::Rotate { count } => {
                let count = self.count(count)?;
                self.context_mut()?.stack.reverse_top(count)?;
            }

            // ── Arithmetic ────────────────────────────────────────────
            Instruction::Add { dst, lhs, rhs } => self.arithmetic(dst, lhs, rhs, |a, b| {
                a.checked_add(b).ok_or(Fault::IntegerOverflow)
            })?,
            Instruction::Sub { dst, lhs, rhs } => self.arithmetic(dst, lhs, rhs, |a, b| {
                a.checked_sub(b).ok_or(Fault::IntegerOverflow)
            })?,
            Instruction::Mul { dst, lhs, rhs } => self.arithmetic(dst, lhs, rhs, |a, b| {
                a.checked_mul(b).ok_or(Fault::IntegerOverflow)
            })?,
            Instruction::Div { dst, lhs, rhs } => self.arithmetic(dst, lhs, rhs, |a, b| {
                if b == 0 {
                    return Err(Fault::DivisionByZero);
                }
                a.checked_div(b).ok_or(Fault::IntegerOverflow)
            })?,
            Instruction::Mod { dst, lhs, rhs } => self.arithmetic(dst, lhs, rhs, |a, b| {
                if b == 0 {
                    return Err(Fault::DivisionByZero);
                }
                a.checked_rem(b).ok_or(Fault::IntegerOverflow)
            })?,
            Instruction::Pow { dst, lhs, rhs } => self.arithmetic(dst, lhs, rhs, power)?,
            Instruction::Not { dst, src } => {
                let value = !self.integer(src)?;
                self.store_integer(dst, value)?;
            }

            // ── Comparison ────────────────────────────────────────────
            Instruction::Eq { dst, lhs, rhs } => {
                return self.compare(dst, lhs, rhs, next, Ordering::is_eq);
            }
            Instruction::Lt { dst, lhs, rhs } => {
                return self.compare(dst, lhs, rhs, next, Ordering::is_lt);
            }
            Instruction::Lte { dst, lhs, rhs } => {
                return self.compare(dst, lhs, rhs, next, Ordering::is_le);
            }
            Instruction::Gt { dst, lhs, rhs } => {
                return self.compare(dst, lhs, rhs, next, Ordering::is_gt);
            }
            Instruction::Gte { dst, lhs, rhs } => {
                return self.compare(dst, lhs, rhs, next, Ordering::is_ge);
            }

            // ── Control ───────────────────────────────────────────────
            Instruction::Halt => return Ok(Flow::Halt(self.register(RETURN_REGISTER)?)),
            Instruction::Send {
                receiver,
                message,
                sender,
            } => return self.send(receiver, message, sender, next),
            Instruction::Ret => return self.ret(),
            Instruction::Jmp { target } => return Ok(Flow::Jump(target as usize)),
            Instruction::Save { dst } => {
                let continuation = self.save_continuation(next, dst)?;
                self.set_register(dst, continuation)?;
            }
            Instruction::Restore { src } => {
                let continuation = self.register(src)?;
                return Ok(Flow::Jump(self.restore_continuation(continuation)?));
            }

            // ── Symbols and collections ───────────────────────────────
            Instruction::AddSym { dst, src } => {
                let string = self.register(src)?;
                let name = self.string(string)?.to_string();
                let (symbol, added) = self.symbols.add(&name);
                if added {
                    self.symbols.attach_string(symbol, string);
                }
                self.set_register(dst, Value::from_symbol(symbol))?;
            }
            Instruction::FindSym { dst, src } => {
                let string = self.register(src)?;
                let symbol = self.symbols.lookup(self.string(string)?);
                self.set_register(dst, Value::from_symbol(symbol))?;
            }
            Instruction::Array { count } => {
                let count = self.count(count)?;
                let values = self.context_mut()?.stack.pop_slice(count)?;
                let array = self.alloc_array(values)?;
                self.push(array)?;
            }
            Instruction::String { count } => {
                let count = self.count(count)?;
                let parts = self.context_mut()?.stack.pop_slice(count)?;
                let text = self.concatenate(&parts)?;
                let string = self.alloc_string(&text)?;
                self.push(string)?;
            }
        }
        Ok(Flow::Next)
    }

    // ── Operands ──────────────────────────────────────────────────────

    fn integer(&self, reg: u8) -> Result<i64, Fault> {
        let value = self.register(reg)?;
        value.as_i64().ok_or(Fault::TypeError {
            expected: "integer",
            got: value,
        })
    }

    fn store_integer(&mut self, reg: u8, value: i64) -> Result<(), Fault> {
        let value = Value::from_i64(value).ok_or(Fault::IntegerOverflow)?;
        self.set_register(reg, value)
    }

    /// A non-negative element count held in `reg`.
    fn count(&self, reg: u8) -> Result<usize, Fault> {
        let value = self.register(reg)?;
        value
            .as_i64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or(Fault::TypeError {
                expected: "non-negative integer",
                got: value,
            })
    }

    fn arithmetic(
        &mut self,
        dst: u8,
        lhs: u8,
        rhs: u8,
        op: impl FnOnce(i64, i64) -> Result<i64, Fault>,
    ) -> Result<(), Fault> {
        let a = self.integer(lhs)?;
        let b = self.integer(rhs)?;
        self.store_integer(dst, op(a, b)?)
    }

    fn compare(
        &mut self,
        dst: u8,
        lhs: u8,
        rhs: u8,
        next: usize,
        accept: fn(Ordering) -> bool,
    ) -> Result<Flow, VmError> {
        let a = self.register(lhs)?;
        let b = self.register(rhs)?;
        let result = self.ordering(a, b)?.is_some_and(accept);
        self.set_register(dst, Value::from_bool(result))?;
        if result || next == self.code.len() {
            return Ok(Flow::Next);
        }
        // false skips the fused instruction, whatever its width
        let (_, after) = decode_at(&self.code, next).map_err(Fault::from)?;
        Ok(Flow::Jump(after))
    }

    /// `None` when the values are not comparable.
    fn ordering(&self, a: Value, b: Value) -> Result<Option<Ordering>, Fault> {
        if a == b {
            return Ok(Some(Ordering::Equal));
        }
        if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
            return Ok(Some(a.cmp(&b)));
        }
        if a.is_reference() && b.is_reference() {
            let left = self.heap.get(a)?.as_str();
            let right = self.heap.get(b)?.as_str();
            if let (Some(left), Some(right)) = (left, right) {
                return Ok(Some(left.cmp(right)));
            }
        }
        Ok(None)
    }

    fn concatenate(&self, parts: &[Value]) -> Result<String, Fault> {
        let mut text = String::new();
        for &part in parts {
            if let Some(code) = part.as_i64() {
                let ch = u32::try_from(code)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or(Fault::TypeError {
                        expected: "unicode scalar value",
                        got: part,
                    })?;
                text.push(ch);
            } else {
                let string = self.string(part).map_err(|_| Fault::TypeError {
                    expected: "character or string",
                    got: part,
                })?;
                text.push_str(string);
            }
        }
        Ok(text)
    }

    // ── Calls ─────────────────────────────────────────────────────────

    fn ret(&mut self) -> Result<Flow, VmError> {
        if self.calls.depth() <= 1 {
            let value = self.pop().unwrap_or(Value::NIL);
            return Ok(Flow::Halt(value));
        }
        let (value, return_ip) = self.calls.leave()?;
        self.set_register(RETURN_REGISTER, value)?;
        Ok(Flow::Jump(return_ip))
    }

    /// Deliver the message in `message` to the receiver and dispatch the
    /// oldest pending envelope.
    fn send(
        &mut self,
        receiver: u8,
        message: u8,
        sender: u8,
        next: usize,
    ) -> Result<Flow, VmError> {
        let mut message = [self.normalize_message(message)?];
        self.make_room(SlotObject::ENVELOPE_SIZE, &mut message)?;
        let [message] = message;
        // registers are read after the collections above may have moved them
        let receiver = self.register(receiver)?;
        let sender = self.register(sender)?;

        self.deliver(receiver, message, sender)?;
        match self.receive(receiver)? {
            Some(envelope) => self.dispatch(receiver, envelope, next),
            None => Ok(Flow::Next),
        }
    }

    /// Message objects pass through; a symbol becomes a unary message and an
    /// array `[selector, args…]` a message with arguments.
    fn normalize_message(&mut self, reg: u8) -> Result<Value, VmError> {
        let value = self.register(reg)?;
        if let Some(selector) = value.as_symbol() {
            return Ok(self.new_message(selector, Vec::new())?);
        }
        if value.is_reference() {
            let parts = match self.heap.get(value)? {
                HeapObject::Message(_) => return Ok(value),
                HeapObject::Array(items) => match items.split_first() {
                    Some((first, arguments)) => {
                        let selector = first.as_symbol().ok_or(Fault::TypeError {
                            expected: "selector",
                            got: *first,
                        })?;
                        Some((selector, arguments.to_vec()))
                    }
                    None => None,
                },
                _ => None,
            };
            if let Some((selector, arguments)) = parts {
                return Ok(self.new_message(selector, arguments)?);
            }
        }
        Err(Fault::TypeError {
            expected: "message",
            got: value,
        }
        .into())
    }

    fn dispatch(
        &mut self,
        receiver: Value,
        envelope: Envelope,
        next: usize,
    ) -> Result<Flow, VmError> {
        let Envelope { message, sender } = envelope;
        let (selector, arguments) = match self.heap.get(message)?.as_message() {
            Some(message) => (message.selector, message.arguments.clone()),
            None => {
                return Err(Fault::TypeError {
                    expected: "message",
                    got: message,
                }
                .into());
            }
        };

        if let LookupResult::Found { value, .. } = self.resolve(receiver, selector)? {
            return match self.method(value)? {
                Some(method) => self.activate(receiver, sender, value, method, &arguments, next),
                None => {
                    self.set_register(RETURN_REGISTER, value)?;
                    Ok(Flow::Next)
                }
            };
        }

        let forward = self.symbols.lookup("forward");
        if forward.is_found()
            && let LookupResult::Found { value, .. } = self.resolve(receiver, forward)?
            && let Some(method) = self.method(value)?
        {
            log::debug!("forwarding {} to {value:?}", self.selector_name(selector));
            return self.activate(receiver, sender, value, method, &[message], next);
        }

        Err(RuntimeError::MessageNotUnderstood {
            receiver,
            selector: self.selector_name(selector),
        }
        .into())
    }

    fn method(&self, value: Value) -> Result<Option<Method>, Fault> {
        if !value.is_reference() {
            return Ok(None);
        }
        Ok(self.heap.get(value)?.as_method().copied())
    }

    fn activate(
        &mut self,
        receiver: Value,
        sender: Value,
        method_value: Value,
        method: Method,
        arguments: &[Value],
        return_ip: usize,
    ) -> Result<Flow, VmError> {
        let shape = MethodShape {
            arg_count: method.arg_count,
            local_count: method.local_count,
            scope: method.scope,
        };
        self.calls
            .enter(receiver, sender, method_value, &shape, arguments, return_ip)?;
        Ok(Flow::Jump(method.entry as usize))
    }

    fn selector_name(&self, selector: Symbol) -> String {
        self.symbols.name(selector).unwrap_or("?").to_string()
    }
}

fn power(base: i64, exponent: i64) -> Result<i64, Fault> {
    if exponent < 0 {
        return Err(Fault::NegativeExponent);
    }
    match u32::try_from(exponent) {
        Ok(exponent) => base.checked_pow(exponent).ok_or(Fault::IntegerOverflow),
        Err(_) => match base {
            0 | 1 => Ok(base),
            -1 if exponent % 2 == 0 => Ok(1),
            -1 => Ok(-1),
            _ => Err(Fault::IntegerOverflow),
        },
    }
}
