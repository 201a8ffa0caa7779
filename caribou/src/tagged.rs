//! Value: a tagged 64 bit word.
//!
//! ```text
//! ...xxxxx0   fixnum, 63 bit signed payload
//! ...iiis01   reference, `s` = semispace id, `i` = object index
//! ...kkk11    immediate, `kkk` selects nil/false/true/symbol,
//!             symbols keep their id above bit 5
//! ```
use std::fmt;

use crate::Symbol;

#[allow(unused)]
#[repr(u8)]
#[derive(Debug, Copy, Clone)]
pub enum ValueTag {
    Fixnum = 0b0,
    Reference = 0b01,
    Immediate = 0b11,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ImmediateKind {
    Nil = 0,
    False = 1,
    True = 2,
    Symbol = 3,
}

const TAG_MASK: u64 = 0b11;
const SPACE_BIT: u64 = 0b100;
const INDEX_SHIFT: u32 = 3;
const KIND_SHIFT: u32 = 2;
const KIND_MASK: u64 = 0b111 << KIND_SHIFT;
const SYMBOL_SHIFT: u32 = 5;

/// Smallest integer a fixnum can hold.
pub const FIXNUM_MIN: i64 = -(1 << 62);
/// Largest integer a fixnum can hold.
pub const FIXNUM_MAX: i64 = (1 << 62) - 1;

/// A generic Value
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Value(u64);

impl Value {
    pub const NIL: Value = Value::immediate(ImmediateKind::Nil, 0);
    pub const FALSE: Value = Value::immediate(ImmediateKind::False, 0);
    pub const TRUE: Value = Value::immediate(ImmediateKind::True, 0);

    const fn immediate(kind: ImmediateKind, payload: u64) -> Self {
        Self(payload << SYMBOL_SHIFT | (kind as u64) << KIND_SHIFT | ValueTag::Immediate as u64)
    }

    /// Tag an integer, `None` if it does not fit into a fixnum.
    pub fn from_i64(value: i64) -> Option<Self> {
        if (FIXNUM_MIN..=FIXNUM_MAX).contains(&value) {
            Some(Self(value.cast_unsigned() << 1))
        } else {
            None
        }
    }

    pub fn from_bool(value: bool) -> Self {
        if value { Self::TRUE } else { Self::FALSE }
    }

    pub fn from_symbol(symbol: Symbol) -> Self {
        Self::immediate(ImmediateKind::Symbol, symbol.0 as u64)
    }

    pub(crate) fn from_reference(space: u8, index: usize) -> Self {
        let space_bit = if space == 0 { 0 } else { SPACE_BIT };
        Self((index as u64) << INDEX_SHIFT | space_bit | ValueTag::Reference as u64)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_fixnum(self) -> bool {
        self.0 & 0b1 == ValueTag::Fixnum as u64
    }

    #[inline]
    pub fn is_reference(self) -> bool {
        self.0 & TAG_MASK == ValueTag::Reference as u64
    }

    #[inline]
    pub fn is_immediate(self) -> bool {
        self.0 & TAG_MASK == ValueTag::Immediate as u64
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }

    fn kind(self) -> Option<ImmediateKind> {
        if !self.is_immediate() {
            return None;
        }
        match (self.0 & KIND_MASK) >> KIND_SHIFT {
            0 => Some(ImmediateKind::Nil),
            1 => Some(ImmediateKind::False),
            2 => Some(ImmediateKind::True),
            3 => Some(ImmediateKind::Symbol),
            _ => None,
        }
    }

    pub fn as_i64(self) -> Option<i64> {
        self.is_fixnum().then(|| self.0.cast_signed() >> 1)
    }

    pub fn as_bool(self) -> Option<bool> {
        match self.kind() {
            Some(ImmediateKind::True) => Some(true),
            Some(ImmediateKind::False) => Some(false),
            _ => None,
        }
    }

    pub fn as_symbol(self) -> Option<Symbol> {
        match self.kind() {
            Some(ImmediateKind::Symbol) => Some(Symbol((self.0 >> SYMBOL_SHIFT) as u32)),
            _ => None,
        }
    }

    /// Semispace id and object index of a reference.
    pub fn reference(self) -> Option<(u8, usize)> {
        if !self.is_reference() {
            return None;
        }
        let space = u8::from(self.0 & SPACE_BIT != 0);
        Some((space, (self.0 >> INDEX_SHIFT) as usize))
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::NIL
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(value) = self.as_i64() {
            return write!(f, "{value}");
        }
        if let Some((space, index)) = self.reference() {
            return write!(f, "ref({space}:{index})");
        }
        match self.kind() {
            Some(ImmediateKind::Nil) => write!(f, "nil"),
            Some(ImmediateKind::False) => write!(f, "false"),
            Some(ImmediateKind::True) => write!(f, "true"),
            Some(ImmediateKind::Symbol) => write!(f, "#{}", (self.0 >> SYMBOL_SHIFT) as u32),
            None => write!(f, "Value({:#x})", self.0),
        }
    }
}
