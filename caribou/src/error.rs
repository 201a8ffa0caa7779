use std::fmt;

use bytecode::{DecodeError, ImageError};

use crate::{HeapError, Symbol, Value};

/// A fatal condition. The machine that raised it stays faulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    StackOverflow,
    StackUnderflow,
    CallStackOverflow { depth: usize },
    DivisionByZero,
    IntegerOverflow,
    NegativeExponent,
    TypeError { expected: &'static str, got: Value },
    InvalidRegister(u8),
    InvalidConstant(u16),
    InvalidJump(usize),
    Decode(DecodeError),
    OutOfMemory { requested: usize, available: usize },
    ContinuationConsumed,
    StaleReference(Value),
}

/// Raised when a trait would shadow a slot that is already visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotExistsError {
    pub slot: Symbol,
    pub name: String,
    /// The object or trait that already defines the slot.
    pub offender: Value,
}

/// A structured error the embedder may recover from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    SlotExists(SlotExistsError),
    MessageNotUnderstood { receiver: Value, selector: String },
    ArityMismatch { expected: u8, got: usize },
    MailboxFull { receiver: Value },
    NotAnObject(Value),
}

#[derive(Debug)]
pub enum VmError {
    Fault(Fault),
    Runtime(RuntimeError),
    Image(ImageError),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::StackOverflow => write!(f, "stack overflow"),
            Fault::StackUnderflow => write!(f, "stack underflow"),
            Fault::CallStackOverflow { depth } => {
                write!(f, "call stack overflow at depth {depth}")
            }
            Fault::DivisionByZero => write!(f, "division by zero"),
            Fault::IntegerOverflow => write!(f, "integer overflow"),
            Fault::NegativeExponent => write!(f, "negative exponent"),
            Fault::TypeError { expected, got } => {
                write!(f, "type error: expected {expected}, got {got:?}")
            }
            Fault::InvalidRegister(reg) => write!(f, "invalid register r{reg}"),
            Fault::InvalidConstant(idx) => write!(f, "invalid constant #{idx}"),
            Fault::InvalidJump(target) => write!(f, "invalid jump target {target}"),
            Fault::Decode(err) => write!(f, "{err}"),
            Fault::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "out of memory: {requested} bytes requested, {available} available"
            ),
            Fault::ContinuationConsumed => write!(f, "continuation already restored"),
            Fault::StaleReference(value) => write!(f, "stale reference {value:?}"),
        }
    }
}

impl std::error::Error for Fault {}

impl fmt::Display for SlotExistsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slot `{}` is already defined by {:?}",
            self.name, self.offender
        )
    }
}

impl std::error::Error for SlotExistsError {}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::SlotExists(err) => write!(f, "{err}"),
            RuntimeError::MessageNotUnderstood { receiver, selector } => {
                write!(f, "{receiver:?} does not understand `{selector}`")
            }
            RuntimeError::ArityMismatch { expected, got } => {
                write!(f, "expected {expected} argument(s), got {got}")
            }
            RuntimeError::MailboxFull { receiver } => {
                write!(f, "mailbox of {receiver:?} is full")
            }
            RuntimeError::NotAnObject(value) => {
                write!(f, "{value:?} is not a slot object")
            }
        }
    }
}

impl std::error::Error for RuntimeError {}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Fault(fault) => write!(f, "fault: {fault}"),
            VmError::Runtime(err) => write!(f, "runtime error: {err}"),
            VmError::Image(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::Fault(fault) => Some(fault),
            VmError::Runtime(err) => Some(err),
            VmError::Image(err) => Some(err),
        }
    }
}

impl From<DecodeError> for Fault {
    fn from(err: DecodeError) -> Self {
        Fault::Decode(err)
    }
}

impl From<HeapError> for Fault {
    fn from(err: HeapError) -> Self {
        match err {
            HeapError::OutOfMemory {
                requested,
                available,
            } => Fault::OutOfMemory {
                requested,
                available,
            },
            HeapError::StaleReference(value) => Fault::StaleReference(value),
            HeapError::NotAReference(got) => Fault::TypeError {
                expected: "heap object",
                got,
            },
        }
    }
}

impl From<Fault> for VmError {
    fn from(fault: Fault) -> Self {
        VmError::Fault(fault)
    }
}

impl From<HeapError> for VmError {
    fn from(err: HeapError) -> Self {
        VmError::Fault(err.into())
    }
}

impl From<RuntimeError> for VmError {
    fn from(err: RuntimeError) -> Self {
        VmError::Runtime(err)
    }
}

impl From<SlotExistsError> for VmError {
    fn from(err: SlotExistsError) -> Self {
        VmError::Runtime(RuntimeError::SlotExists(err))
    }
}

impl From<ImageError> for VmError {
    fn from(err: ImageError) -> Self {
        VmError::Image(err)
    }
}
