//! Contract for built-in (foreign) classes.
//!
//! Standard library classes are modeled outside of the machine. A model registers a
//! [`BuiltinClass`] for every classpath it provides; objects of that class then carry
//! an opaque [`BuiltinInstance`] payload in one of their segments. The machine never
//! looks inside a payload: it goes through the callbacks below for every field access,
//! duplication, hashing, comparison and reachability walk.
//!
//! | callback                 | used by                                   |
//! |--------------------------|-------------------------------------------|
//! | `initialize`             | object construction                       |
//! | `finalize`               | segment drop                              |
//! | `duplicate`              | copy-on-write of the owning value         |
//! | `get_field`/`put_field`  | field access through the owning object    |
//! | `referenced_addrs`       | reference counting and garbage collection |
//! | `hash`/`equal`           | value hashcodes and frame comparison      |
//! | `is_instance_of`         | type tests                                |
//! | `invoke`                 | method calls on the class                 |

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::rc::Rc;

use log::debug;

use crate::address::Addr;
use crate::error::Result;
use crate::frame::{Frame, Recorder};
use crate::set::Set;

/// Payload of one built-in segment.
pub trait BuiltinInstance: Debug {
    /// Copy used when the owning value is duplicated on write.
    fn duplicate(&self) -> Box<dyn BuiltinInstance>;

    /// Called when the segment is dropped.
    fn finalize(&mut self) {}

    /// Value of a field, or `None` if this class has no such field.
    fn get_field(&self, field: &str) -> Option<Set>;

    /// Writes a field. With `keep_old` the new value is added to the old one.
    ///
    /// Returns `false` if this class has no such field.
    fn put_field(&mut self, field: &str, value: &Set, keep_old: bool) -> bool;

    /// Appends every store address held by the payload.
    fn referenced_addrs(&self, out: &mut Vec<Addr>);

    fn hash(&self) -> u64;

    fn equal(&self, other: &dyn BuiltinInstance) -> bool;

    /// Whether the instance also counts as an instance of `classpath`.
    fn is_instance_of(&self, classpath: &str) -> bool {
        let _ = classpath;
        false
    }

    fn as_any(&self) -> &dyn Any;
}

/// Environment handed to [`BuiltinClass::invoke`].
pub struct InvokeEnv<'a> {
    pub frame: &'a mut Frame,
    pub recorder: Option<&'a mut Recorder>,
    /// Argument values, receiver first for instance methods.
    pub args: Vec<Set>,
}

/// Class-level callbacks of a built-in class.
pub trait BuiltinClass: Debug {
    /// Classpaths this class provides.
    fn provides(&self) -> Vec<String>;

    /// Superclass continuing the inheritance chain, if any.
    fn superclass(&self) -> Option<String> {
        None
    }

    /// Creates the payload for a new object of `classpath`.
    fn initialize(&self, classpath: &str) -> Box<dyn BuiltinInstance>;

    /// Invokes `method`, returning the abstract result.
    fn invoke(&self, method: &str, env: &mut InvokeEnv<'_>) -> Result<Set>;
}

/// Name table of built-in classes, keyed by classpath.
#[derive(Debug, Default, Clone)]
pub struct BuiltinRegistry {
    classes: HashMap<String, Rc<dyn BuiltinClass>>,
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `class` under every classpath it provides.
    pub fn register(&mut self, class: Rc<dyn BuiltinClass>) {
        for path in class.provides() {
            debug!("registered built-in class {}", path);
            self.classes.insert(path, Rc::clone(&class));
        }
    }

    pub fn get(&self, classpath: &str) -> Option<&Rc<dyn BuiltinClass>> {
        self.classes.get(classpath)
    }

    pub fn contains(&self, classpath: &str) -> bool {
        self.classes.contains_key(classpath)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
