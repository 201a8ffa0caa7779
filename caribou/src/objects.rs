use std::{collections::HashMap, mem};

use crate::{DEFAULT_MAILBOX_CAPACITY, Envelope, Mailbox, Message, Snapshot, Symbol, Value};

/// Size every heap object is charged for its header.
pub const HEADER_SIZE: usize = 16;

const WORD: usize = mem::size_of::<Value>();

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObjectType {
    String,
    Array,
    Object,
    Method,
    Message,
    Continuation,
}

impl ObjectType {
    pub fn name(self) -> &'static str {
        match self {
            ObjectType::String => "string",
            ObjectType::Array => "array",
            ObjectType::Object => "object",
            ObjectType::Method => "method",
            ObjectType::Message => "message",
            ObjectType::Continuation => "continuation",
        }
    }
}

/// A slot object: local slots, composed traits and a mailbox.
#[derive(Debug, Clone)]
pub struct SlotObject {
    pub slots: HashMap<Symbol, Value>,
    pub traits: Vec<Value>,
    pub mailbox: Mailbox<Envelope>,
}

impl SlotObject {
    /// Bytes one local slot adds to the object.
    pub const SLOT_SIZE: usize = 2 * WORD;
    pub const TRAIT_SIZE: usize = WORD;
    /// Bytes one pending envelope adds to the object.
    pub const ENVELOPE_SIZE: usize = 2 * WORD;

    pub fn new(mailbox_capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            traits: Vec::new(),
            mailbox: Mailbox::new(mailbox_capacity),
        }
    }

    pub fn with_slots(slots: HashMap<Symbol, Value>, mailbox_capacity: usize) -> Self {
        Self {
            slots,
            ..Self::new(mailbox_capacity)
        }
    }
}

impl Default for SlotObject {
    fn default() -> Self {
        Self::new(DEFAULT_MAILBOX_CAPACITY)
    }
}

/// Activation template of a method. Every activation builds a fresh
/// context from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Method {
    pub name: Symbol,
    pub arg_count: u8,
    pub local_count: u8,
    /// Lexically enclosing locals object, or nil.
    pub scope: Value,
    /// Code offset of the first instruction.
    pub entry: u32,
}

#[derive(Debug, Clone)]
pub enum HeapObject {
    String(String),
    Array(Vec<Value>),
    Object(SlotObject),
    Method(Method),
    Message(Message),
    /// `None` once the continuation has been restored.
    Continuation(Option<Snapshot>),
}

impl HeapObject {
    pub fn object_type(&self) -> ObjectType {
        match self {
            HeapObject::String(_) => ObjectType::String,
            HeapObject::Array(_) => ObjectType::Array,
            HeapObject::Object(_) => ObjectType::Object,
            HeapObject::Method(_) => ObjectType::Method,
            HeapObject::Message(_) => ObjectType::Message,
            HeapObject::Continuation(_) => ObjectType::Continuation,
        }
    }

    /// Bytes charged against the active semispace.
    pub fn object_size(&self) -> usize {
        let payload = match self {
            HeapObject::String(string) => string.len().next_multiple_of(WORD),
            HeapObject::Array(values) => values.len() * WORD,
            HeapObject::Object(object) => {
                object.slots.len() * SlotObject::SLOT_SIZE
                    + object.traits.len() * SlotObject::TRAIT_SIZE
                    + object.mailbox.len() * SlotObject::ENVELOPE_SIZE
            }
            HeapObject::Method(_) => 3 * WORD,
            HeapObject::Message(message) => WORD + message.arguments.len() * WORD,
            HeapObject::Continuation(Some(snapshot)) => snapshot.size(),
            HeapObject::Continuation(None) => 0,
        };
        HEADER_SIZE + payload
    }

    /// Visit every reference field.
    pub fn visit_refs_mut(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        match self {
            HeapObject::String(_) => {}
            HeapObject::Array(values) => values.iter_mut().for_each(visitor),
            HeapObject::Object(object) => {
                object.slots.values_mut().for_each(&mut *visitor);
                object.traits.iter_mut().for_each(&mut *visitor);
                object.mailbox.for_each_mut(|envelope| {
                    visitor(&mut envelope.message);
                    visitor(&mut envelope.sender);
                });
            }
            HeapObject::Method(method) => visitor(&mut method.scope),
            HeapObject::Message(message) => message.arguments.iter_mut().for_each(visitor),
            HeapObject::Continuation(Some(snapshot)) => snapshot.visit_values_mut(visitor),
            HeapObject::Continuation(None) => {}
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeapObject::String(string) => Some(string),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            HeapObject::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&SlotObject> {
        match self {
            HeapObject::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut SlotObject> {
        match self {
            HeapObject::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_method(&self) -> Option<&Method> {
        match self {
            HeapObject::Method(method) => Some(method),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            HeapObject::Message(message) => Some(message),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> Value {
        Value::from_i64(v).unwrap()
    }

    fn collect_refs(object: &mut HeapObject) -> Vec<Value> {
        let mut seen = Vec::new();
        object.visit_refs_mut(&mut |value| seen.push(*value));
        seen
    }

    #[test]
    fn sizes_include_header() {
        assert_eq!(HeapObject::String(String::new()).object_size(), HEADER_SIZE);
        assert_eq!(HeapObject::String("abc".into()).object_size(), HEADER_SIZE + 8);
        assert_eq!(
            HeapObject::Array(vec![Value::NIL; 3]).object_size(),
            HEADER_SIZE + 24
        );
        assert_eq!(HeapObject::Continuation(None).object_size(), HEADER_SIZE);
    }

    #[test]
    fn object_size_grows_with_slots() {
        let mut object = SlotObject::default();
        let empty = HeapObject::Object(object.clone()).object_size();
        object.slots.insert(Symbol(0), int(1));
        assert!(HeapObject::Object(object).object_size() > empty);
    }

    #[test]
    fn visits_every_reference_field() {
        let mut object = SlotObject::default();
        object.slots.insert(Symbol(0), int(1));
        object.traits.push(int(2));
        object
            .mailbox
            .deliver(Envelope {
                message: int(3),
                sender: int(4),
            })
            .unwrap();
        let mut seen = collect_refs(&mut HeapObject::Object(object));
        seen.sort_by_key(|v| v.as_i64());
        assert_eq!(seen, vec![int(1), int(2), int(3), int(4)]);

        let mut message = HeapObject::Message(Message {
            selector: Symbol(1),
            arguments: vec![int(5), int(6)],
        });
        assert_eq!(collect_refs(&mut message), vec![int(5), int(6)]);

        let mut method = HeapObject::Method(Method {
            name: Symbol(2),
            arg_count: 0,
            local_count: 0,
            scope: int(7),
            entry: 0,
        });
        assert_eq!(collect_refs(&mut method), vec![int(7)]);

        assert!(collect_refs(&mut HeapObject::String("x".into())).is_empty());
    }

    #[test]
    fn visitor_can_rewrite() {
        let mut array = HeapObject::Array(vec![int(1), int(2)]);
        array.visit_refs_mut(&mut |value| *value = Value::NIL);
        assert_eq!(array.as_array(), Some(&[Value::NIL, Value::NIL][..]));
    }
}
