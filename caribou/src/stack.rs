use crate::{Fault, Value};

/// Default number of slots in a context's operand stack.
pub const DEFAULT_STACK_SIZE: usize = 256;

/// Bounded per-context evaluation stack.
///
/// Every operation that would run past either end fails with a fault and
/// leaves the stack untouched.
#[derive(Debug, Clone)]
pub struct OperandStack {
    values: Vec<Value>,
    capacity: usize,
}

impl OperandStack {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity.min(DEFAULT_STACK_SIZE)),
            capacity,
        }
    }

    /// Returns the active portion of the stack, bottom first.
    #[must_use]
    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&mut self, value: Value) -> Result<(), Fault> {
        if self.values.len() >= self.capacity {
            return Err(Fault::StackOverflow);
        }
        self.values.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value, Fault> {
        self.values.pop().ok_or(Fault::StackUnderflow)
    }

    /// Gets the nth value from the top of the stack (0-indexed)
    pub fn peek(&self, n: usize) -> Result<Value, Fault> {
        let depth = self.values.len();
        if n >= depth {
            return Err(Fault::StackUnderflow);
        }
        Ok(self.values[depth - 1 - n])
    }

    pub fn dup(&mut self) -> Result<(), Fault> {
        let top = self.peek(0)?;
        self.push(top)
    }

    pub fn swap(&mut self) -> Result<(), Fault> {
        let depth = self.values.len();
        if depth < 2 {
            return Err(Fault::StackUnderflow);
        }
        self.values.swap(depth - 1, depth - 2);
        Ok(())
    }

    /// Reverse the topmost `n` values: `(v1 v2 … vN --)` becomes
    /// `(vN … v2 v1 --)`.
    pub fn reverse_top(&mut self, n: usize) -> Result<(), Fault> {
        let depth = self.values.len();
        if n > depth {
            return Err(Fault::StackUnderflow);
        }
        self.values[depth - n..].reverse();
        Ok(())
    }

    /// Removes the top n elements and returns them bottom-most first.
    pub fn pop_slice(&mut self, n: usize) -> Result<Vec<Value>, Fault> {
        let depth = self.values.len();
        if n > depth {
            return Err(Fault::StackUnderflow);
        }
        Ok(self.values.split_off(depth - n))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Value> {
        self.values.iter_mut()
    }
}

impl Default for OperandStack {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE)
    }
}
