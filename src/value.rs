//! Values held in store slots.

use std::fmt::{Debug, Display, Formatter};

use log::warn;

use crate::address::Addr;
use crate::object::Object;
use crate::set::Set;
use crate::tag::TagSet;
use crate::utils::MyHash;

/// Content of a store slot: either a field's set of possible addresses, or an object.
#[derive(Clone, PartialEq)]
pub enum Value {
    Set(Set),
    Object(Object),
}

impl Value {
    pub fn as_set(&self) -> Option<&Set> {
        match self {
            Value::Set(s) => Some(s),
            Value::Object(_) => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            Value::Set(_) => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Object> {
        match self {
            Value::Object(o) => Some(o),
            Value::Set(_) => None,
        }
    }

    /// Store addresses referenced by this value.
    pub fn referenced_addrs(&self) -> Vec<Addr> {
        match self {
            Value::Set(s) => s.heap_addrs().collect(),
            Value::Object(o) => {
                let mut out = Vec::new();
                o.referenced_addrs(&mut out);
                out.retain(|a| a.is_heap());
                out
            }
        }
    }

    pub fn tags(&self) -> &TagSet {
        match self {
            Value::Set(s) => s.tags(),
            Value::Object(o) => o.tags(),
        }
    }

    pub fn hashcode(&self) -> u64 {
        match self {
            Value::Set(s) => s.hashcode(),
            Value::Object(o) => o.hashcode() ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    pub fn compute_hashcode(&self) -> u64 {
        match self {
            Value::Set(s) => s.compute_hashcode(),
            Value::Object(o) => o.hashcode() ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    /// Joins `other` into `self`. Returns `true` if `self` changed.
    ///
    /// Values of different variants cannot be joined; `self` is kept.
    pub fn join(&mut self, other: &Value) -> bool {
        match (self, other) {
            (Value::Set(a), Value::Set(b)) => a.merge(b),
            (Value::Object(a), Value::Object(b)) => a.join(b),
            (a, b) => {
                warn!("join: cannot join {} with {}", a, b);
                false
            }
        }
    }
}

impl From<Set> for Value {
    fn from(s: Set) -> Self {
        Value::Set(s)
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Value::Object(o)
    }
}

impl MyHash for Value {
    fn hash(&self) -> u64 {
        self.hashcode()
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Set(s) => write!(f, "{}", s),
            Value::Object(o) => write!(f, "{}", o),
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}
