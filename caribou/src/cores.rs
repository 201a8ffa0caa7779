//! Virtual cores.
//!
//! A core is one [`Machine`] on its own OS thread. Cores share nothing:
//! values cross between them as owned [`Exported`] trees through a
//! single-producer single-consumer [`Mailbox`].

use std::{
    fmt, io,
    thread::{self, JoinHandle},
};

use bytecode::Image;

use crate::{
    Deliverer, Fault, HeapObject, Machine, MachineCreateInfo, Mailbox, Message, Recipient,
    SlotObject, Value, VmError,
};

/// A value detached from any heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exported {
    Nil,
    Boolean(bool),
    Integer(i64),
    Symbol(String),
    String(String),
    Array(Vec<Exported>),
    /// Local slots sorted by name. Traits and pending messages stay behind.
    Object(Vec<(String, Exported)>),
    Method {
        name: String,
        args: u8,
        locals: u8,
        entry: u32,
        scope: Box<Exported>,
    },
    Message {
        selector: String,
        arguments: Vec<Exported>,
    },
    /// Continuations are bound to the heap that captured them.
    Continuation,
}

impl fmt::Display for Exported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, items: &[Exported]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }

        match self {
            Exported::Nil => write!(f, "nil"),
            Exported::Boolean(value) => write!(f, "{value}"),
            Exported::Integer(value) => write!(f, "{value}"),
            Exported::Symbol(name) => write!(f, "#{name}"),
            Exported::String(text) => write!(f, "{text:?}"),
            Exported::Array(items) => {
                write!(f, "[")?;
                list(f, items)?;
                write!(f, "]")
            }
            Exported::Object(slots) => {
                write!(f, "{{")?;
                for (i, (name, value)) in slots.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                write!(f, "}}")
            }
            Exported::Method { name, args, .. } => write!(f, "<method {name}/{args}>"),
            Exported::Message {
                selector,
                arguments,
            } => {
                write!(f, "<message {selector}")?;
                if !arguments.is_empty() {
                    write!(f, " ")?;
                    list(f, arguments)?;
                }
                write!(f, ">")
            }
            Exported::Continuation => write!(f, "<continuation>"),
        }
    }
}

impl Machine {
    /// Deep-copy `value` out of the heap.
    ///
    /// Cyclic structures cannot be exported.
    pub fn export(&self, value: Value) -> Result<Exported, Fault> {
        self.export_in(value, &mut Vec::new())
    }

    fn export_in(&self, value: Value, path: &mut Vec<Value>) -> Result<Exported, Fault> {
        if let Some(n) = value.as_i64() {
            return Ok(Exported::Integer(n));
        }
        if let Some(b) = value.as_bool() {
            return Ok(Exported::Boolean(b));
        }
        if let Some(symbol) = value.as_symbol() {
            let name = self.symbol_name(symbol).unwrap_or("?");
            return Ok(Exported::Symbol(name.to_string()));
        }
        if !value.is_reference() {
            return Ok(Exported::Nil);
        }
        if path.contains(&value) {
            return Err(Fault::TypeError {
                expected: "acyclic value",
                got: value,
            });
        }

        path.push(value);
        let exported = match self.heap.get(value)? {
            HeapObject::String(text) => Exported::String(text.clone()),
            HeapObject::Array(items) => Exported::Array(
                items
                    .iter()
                    .map(|&item| self.export_in(item, path))
                    .collect::<Result<_, _>>()?,
            ),
            HeapObject::Object(object) => {
                let mut slots = object
                    .slots
                    .iter()
                    .map(|(&name, &slot)| {
                        let name = self.symbol_name(name).unwrap_or("?").to_string();
                        Ok((name, self.export_in(slot, path)?))
                    })
                    .collect::<Result<Vec<_>, Fault>>()?;
                slots.sort_by(|a, b| a.0.cmp(&b.0));
                Exported::Object(slots)
            }
            HeapObject::Method(method) => Exported::Method {
                name: self.symbol_name(method.name).unwrap_or("?").to_string(),
                args: method.arg_count,
                locals: method.local_count,
                entry: method.entry,
                scope: Box::new(self.export_in(method.scope, path)?),
            },
            HeapObject::Message(message) => Exported::Message {
                selector: self.symbol_name(message.selector).unwrap_or("?").to_string(),
                arguments: message
                    .arguments
                    .iter()
                    .map(|&argument| self.export_in(argument, path))
                    .collect::<Result<_, _>>()?,
            },
            HeapObject::Continuation(_) => Exported::Continuation,
        };
        path.pop();
        Ok(exported)
    }

    /// Rebuild an exported value in this machine's heap.
    pub fn import(&mut self, exported: &Exported) -> Result<Value, Fault> {
        // partially built children live in scratch until their parent exists
        let base = self.scratch.len();
        let result = self.import_in(exported);
        self.scratch.truncate(base);
        result
    }

    fn import_in(&mut self, exported: &Exported) -> Result<Value, Fault> {
        match exported {
            Exported::Nil => Ok(Value::NIL),
            Exported::Boolean(value) => Ok(Value::from_bool(*value)),
            Exported::Integer(value) => Value::from_i64(*value).ok_or(Fault::IntegerOverflow),
            Exported::Symbol(name) => Ok(Value::from_symbol(self.intern(name)?)),
            Exported::String(text) => self.alloc_string(text),
            Exported::Array(items) => {
                let values = self.import_all(items)?;
                self.alloc_array(values)
            }
            Exported::Object(slots) => {
                let mut names = Vec::with_capacity(slots.len());
                for (name, _) in slots {
                    names.push(self.intern(name)?);
                }
                let values = self.import_all(slots.iter().map(|(_, value)| value))?;
                let mut object = SlotObject::new(self.mailbox_capacity);
                object.slots.extend(names.into_iter().zip(values));
                self.allocate(HeapObject::Object(object))
            }
            Exported::Method {
                name,
                args,
                locals,
                entry,
                scope,
            } => {
                let scope = self.import_in(scope)?;
                self.new_method(name, *args, *locals, *entry, scope)
            }
            Exported::Message {
                selector,
                arguments,
            } => {
                let selector = self.intern(selector)?;
                let arguments = self.import_all(arguments)?;
                self.allocate(HeapObject::Message(Message {
                    selector,
                    arguments,
                }))
            }
            Exported::Continuation => Err(Fault::TypeError {
                expected: "exportable value",
                got: Value::NIL,
            }),
        }
    }

    /// Import every item, keeping the finished ones rooted until the caller
    /// allocates their parent.
    fn import_all<'a>(
        &mut self,
        items: impl IntoIterator<Item = &'a Exported>,
    ) -> Result<Vec<Value>, Fault> {
        let base = self.scratch.len();
        for item in items {
            let value = self.import_in(item)?;
            self.scratch.push(value);
        }
        Ok(self.scratch.split_off(base))
    }
}

// ── Cores ─────────────────────────────────────────────────────────────

/// What a core receives before and while starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parcel {
    /// Pushed on the root operand stack.
    Argument(Exported),
    Run,
}

#[derive(Debug)]
pub enum CoreError {
    Vm(VmError),
    /// The handle went away before sending [`Parcel::Run`].
    Disconnected,
    MailboxFull,
    Panicked,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Vm(err) => write!(f, "{err}"),
            CoreError::Disconnected => write!(f, "core disconnected before it was started"),
            CoreError::MailboxFull => write!(f, "core mailbox is full"),
            CoreError::Panicked => write!(f, "core panicked"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<VmError> for CoreError {
    fn from(err: VmError) -> Self {
        CoreError::Vm(err)
    }
}

impl From<Fault> for CoreError {
    fn from(fault: Fault) -> Self {
        CoreError::Vm(fault.into())
    }
}

/// The owning side of a running core.
pub struct CoreHandle {
    name: String,
    deliverer: Deliverer<Parcel>,
    thread: JoinHandle<Result<Exported, CoreError>>,
}

impl CoreHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&self, parcel: Parcel) -> Result<(), CoreError> {
        self.deliverer
            .deliver(parcel)
            .map_err(|_| CoreError::MailboxFull)
    }

    pub fn argument(&self, value: Exported) -> Result<(), CoreError> {
        self.send(Parcel::Argument(value))
    }

    pub fn start(&self) -> Result<(), CoreError> {
        self.send(Parcel::Run)
    }

    /// Wait for the program to finish and return its result.
    pub fn join(self) -> Result<Exported, CoreError> {
        let CoreHandle {
            deliverer, thread, ..
        } = self;
        // a core still waiting for Run sees the mailbox close
        drop(deliverer);
        thread.join().map_err(|_| CoreError::Panicked)?
    }
}

/// Start a core running `image` on a new named thread. It waits for
/// [`Parcel::Run`] before executing.
/// Invalid settings fail with [`io::ErrorKind::InvalidInput`].
pub fn spawn(name: &str, image: Image, info: MachineCreateInfo) -> io::Result<CoreHandle> {
    info.validate()
        .map_err(|reason| io::Error::new(io::ErrorKind::InvalidInput, reason))?;
    let (deliverer, recipient) = Mailbox::new(info.mailbox_capacity).split();
    let thread = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || core_main(&image, &info, recipient))?;
    Ok(CoreHandle {
        name: name.to_string(),
        deliverer,
        thread,
    })
}

fn core_main(
    image: &Image,
    info: &MachineCreateInfo,
    recipient: Recipient<Parcel>,
) -> Result<Exported, CoreError> {
    let mut machine = Machine::load(image, info)?;
    loop {
        match recipient.receive_blocking() {
            Some(Parcel::Argument(value)) => {
                let value = machine.import(&value)?;
                machine.push(value)?;
            }
            Some(Parcel::Run) => break,
            None => return Err(CoreError::Disconnected),
        }
    }

    log::debug!(
        "core {} running with {} argument(s)",
        thread::current().name().unwrap_or("?"),
        machine.stack().len()
    );
    let result = machine.run()?;
    Ok(machine.export(result)?)
}
