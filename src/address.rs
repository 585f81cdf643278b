//! Tagged abstract addresses.
//!
//! Every abstract value in the machine is ultimately a set of [`Addr`]s.
//! An address is a 32-bit word whose high bits select its kind:
//!
//! ```text
//!   0xxx xxxx ...   object slot      (index into the Store)
//!   10xx xxxx ...   relocated        (symbolic id, resolved per Store)
//!   110x xxxx ...   static field     (index into the StaticTable)
//!   1110 .... ...   constant         (bitmask over the low 5 bits)
//!   1111 1111 ...   null
//! ```
//!
//! Constants are *sets* of lattice points, not single values:
//!
//! | bit | name  | meaning             |
//! |-----|-------|---------------------|
//! | 0   | NEG   | some negative value |
//! | 1   | ZERO  | zero                |
//! | 2   | POS   | some positive value |
//! | 3   | TRUE  | boolean true        |
//! | 4   | FALSE | boolean false       |
//!
//! Consumers must switch on [`Addr::kind`] before dereferencing an address.

use std::fmt::{Debug, Display, Formatter};

use crate::utils::MyHash;

/// Kind of an address, decoded from its high bits.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AddrKind {
    Object,
    Relocated,
    Static,
    Constant,
    Null,
}

/// Tagged abstract address.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Addr(u32);

const RELOC_PREFIX: u32 = 0x8000_0000;
const RELOC_MASK: u32 = 0xC000_0000;
const STATIC_PREFIX: u32 = 0xC000_0000;
const STATIC_MASK: u32 = 0xE000_0000;
const CONST_PREFIX: u32 = 0xE000_0000;
const CONST_MASK: u32 = 0xF000_0000;
const CONST_BITS: u32 = 0x1F;

/// Largest object slot index.
pub const MAX_OBJECT_INDEX: u32 = RELOC_PREFIX - 1;
/// Largest relocated id.
pub const MAX_RELOC_ID: u32 = !RELOC_MASK;
/// Largest static field index.
pub const MAX_STATIC_INDEX: u32 = !STATIC_MASK;

// Constant bits
pub const NEG: u8 = 1 << 0;
pub const ZERO: u8 = 1 << 1;
pub const POS: u8 = 1 << 2;
pub const TRUE: u8 = 1 << 3;
pub const FALSE: u8 = 1 << 4;

/// All numeric lattice points.
pub const NUMERIC: u8 = NEG | ZERO | POS;
/// All boolean lattice points.
pub const BOOLEAN: u8 = TRUE | FALSE;
/// Every lattice point.
pub const ANY: u8 = NUMERIC | BOOLEAN;

// Constructors
impl Addr {
    pub const NULL: Addr = Addr(u32::MAX);

    /// Concrete store slot.
    ///
    /// # Panics
    ///
    /// Panics if `index` does not fit into the object region.
    pub const fn object(index: u32) -> Self {
        assert!(index <= MAX_OBJECT_INDEX, "object index out of range");
        Self(index)
    }

    /// Symbolic address for relocation id `id`.
    pub const fn relocated(id: u32) -> Self {
        assert!(id <= MAX_RELOC_ID, "relocation id out of range");
        Self(RELOC_PREFIX | id)
    }

    /// Address of the static field with index `index`.
    pub const fn static_field(index: u32) -> Self {
        assert!(index <= MAX_STATIC_INDEX, "static index out of range");
        Self(STATIC_PREFIX | index)
    }

    /// Constant address holding the lattice points in `bits`.
    ///
    /// Bits outside of [`ANY`] are ignored.
    pub const fn constant(bits: u8) -> Self {
        Self(CONST_PREFIX | (bits as u32 & CONST_BITS))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

// Named constants
impl Addr {
    pub const NEG: Addr = Addr::constant(NEG);
    pub const ZERO: Addr = Addr::constant(ZERO);
    pub const POS: Addr = Addr::constant(POS);
    pub const TRUE: Addr = Addr::constant(TRUE);
    pub const FALSE: Addr = Addr::constant(FALSE);
    /// Empty constant, the bottom of the lattice.
    pub const EMPTY: Addr = Addr::constant(0);
}

// Getters
impl Addr {
    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn kind(self) -> AddrKind {
        if self.0 == u32::MAX {
            AddrKind::Null
        } else if self.0 & RELOC_PREFIX == 0 {
            AddrKind::Object
        } else if self.0 & RELOC_MASK == RELOC_PREFIX {
            AddrKind::Relocated
        } else if self.0 & STATIC_MASK == STATIC_PREFIX {
            AddrKind::Static
        } else if self.0 & CONST_MASK == CONST_PREFIX {
            AddrKind::Constant
        } else {
            // 0xFxxx_xxxx other than null is unused.
            AddrKind::Null
        }
    }

    pub const fn is_null(self) -> bool {
        self.0 == u32::MAX
    }
    pub const fn is_object(self) -> bool {
        matches!(self.kind(), AddrKind::Object)
    }
    pub const fn is_relocated(self) -> bool {
        matches!(self.kind(), AddrKind::Relocated)
    }
    pub const fn is_static(self) -> bool {
        matches!(self.kind(), AddrKind::Static)
    }
    pub const fn is_constant(self) -> bool {
        matches!(self.kind(), AddrKind::Constant)
    }

    /// Whether the address names a store slot, either directly or through relocation.
    pub const fn is_heap(self) -> bool {
        matches!(self.kind(), AddrKind::Object | AddrKind::Relocated)
    }

    /// Slot index of an object address.
    pub fn object_index(self) -> Option<u32> {
        match self.kind() {
            AddrKind::Object => Some(self.0),
            _ => None,
        }
    }

    /// Id of a relocated address.
    pub fn reloc_id(self) -> Option<u32> {
        match self.kind() {
            AddrKind::Relocated => Some(self.0 & !RELOC_MASK),
            _ => None,
        }
    }

    /// Index of a static field address.
    pub fn static_index(self) -> Option<u32> {
        match self.kind() {
            AddrKind::Static => Some(self.0 & !STATIC_MASK),
            _ => None,
        }
    }

    /// Lattice bits of a constant address.
    pub fn const_bits(self) -> Option<u8> {
        match self.kind() {
            AddrKind::Constant => Some((self.0 & CONST_BITS) as u8),
            _ => None,
        }
    }

    /// Whether the constant contains all lattice points in `bits`.
    pub fn const_contains(self, bits: u8) -> bool {
        match self.const_bits() {
            Some(b) => b & bits == bits,
            None => false,
        }
    }
}

impl MyHash for Addr {
    fn hash(&self) -> u64 {
        crate::utils::hash_u32(self.0)
    }
}

impl From<Addr> for u32 {
    fn from(addr: Addr) -> Self {
        addr.0
    }
}

impl Debug for Addr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            AddrKind::Null => write!(f, "null"),
            AddrKind::Object => write!(f, "#obj({})", self.0),
            AddrKind::Relocated => write!(f, "#reloc({})", self.0 & !RELOC_MASK),
            AddrKind::Static => write!(f, "#static({})", self.0 & !STATIC_MASK),
            AddrKind::Constant => {
                let bits = (self.0 & CONST_BITS) as u8;
                write!(f, "{{")?;
                for (bit, c) in [(NEG, '-'), (ZERO, '0'), (POS, '+'), (TRUE, 'T'), (FALSE, 'F')] {
                    if bits & bit != 0 {
                        write!(f, "{}", c)?;
                    }
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_kinds() {
        assert_eq!(Addr::object(0).kind(), AddrKind::Object);
        assert_eq!(Addr::object(MAX_OBJECT_INDEX).kind(), AddrKind::Object);
        assert_eq!(Addr::relocated(0).kind(), AddrKind::Relocated);
        assert_eq!(Addr::relocated(MAX_RELOC_ID).kind(), AddrKind::Relocated);
        assert_eq!(Addr::static_field(3).kind(), AddrKind::Static);
        assert_eq!(Addr::static_field(MAX_STATIC_INDEX).kind(), AddrKind::Static);
        assert_eq!(Addr::POS.kind(), AddrKind::Constant);
        assert_eq!(Addr::constant(ANY).kind(), AddrKind::Constant);
        assert_eq!(Addr::NULL.kind(), AddrKind::Null);
    }

    #[test]
    fn test_payloads() {
        assert_eq!(Addr::object(42).object_index(), Some(42));
        assert_eq!(Addr::relocated(42).reloc_id(), Some(42));
        assert_eq!(Addr::static_field(42).static_index(), Some(42));
        assert_eq!(Addr::constant(NEG | POS).const_bits(), Some(NEG | POS));
        assert_eq!(Addr::relocated(42).object_index(), None);
        assert_eq!(Addr::object(42).const_bits(), None);
    }

    #[test]
    fn test_const_contains() {
        let a = Addr::constant(NEG | ZERO);
        assert!(a.const_contains(NEG));
        assert!(a.const_contains(NEG | ZERO));
        assert!(!a.const_contains(POS));
        assert!(!Addr::object(1).const_contains(NEG));
    }

    #[test]
    fn test_display() {
        assert_eq!(Addr::NULL.to_string(), "null");
        assert_eq!(Addr::object(5).to_string(), "#obj(5)");
        assert_eq!(Addr::relocated(5).to_string(), "#reloc(5)");
        assert_eq!(Addr::static_field(5).to_string(), "#static(5)");
        assert_eq!(Addr::constant(NEG | POS).to_string(), "{-+}");
        assert_eq!(Addr::constant(BOOLEAN).to_string(), "{TF}");
    }

    #[test]
    fn test_ordering_groups_kinds() {
        assert!(Addr::object(MAX_OBJECT_INDEX) < Addr::relocated(0));
        assert!(Addr::relocated(MAX_RELOC_ID) < Addr::static_field(0));
        assert!(Addr::static_field(MAX_STATIC_INDEX) < Addr::EMPTY);
    }
}
