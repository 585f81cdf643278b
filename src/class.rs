//! Class definitions known to the analysis.
//!
//! The bytecode frontend supplies user classes as [`ClassDef`]s; built-in models are
//! registered into the same table. Static fields of every class get a global index,
//! which is also their [`Addr::static_field`] address.

use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use crate::address::Addr;
use crate::builtin::{BuiltinClass, BuiltinRegistry};

/// A class defined by the analyzed program.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: Rc<str>,
    pub superclass: Option<Rc<str>>,
    /// Instance fields declared by this class (not inherited ones).
    pub fields: Vec<Rc<str>>,
    /// Static fields with their default constant.
    pub statics: Vec<(Rc<str>, Addr)>,
}

impl ClassDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            fields: Vec::new(),
            statics: Vec::new(),
        }
    }

    pub fn extends(mut self, superclass: &str) -> Self {
        self.superclass = Some(superclass.into());
        self
    }

    pub fn field(mut self, name: &str) -> Self {
        self.fields.push(name.into());
        self
    }

    pub fn static_field(mut self, name: &str, default: Addr) -> Self {
        self.statics.push((name.into(), default));
        self
    }
}

/// One link of an inheritance chain.
#[derive(Debug, Clone)]
pub enum ClassRef<'a> {
    User(&'a ClassDef),
    Builtin { path: Rc<str>, class: Rc<dyn BuiltinClass> },
}

impl ClassRef<'_> {
    pub fn name(&self) -> Rc<str> {
        match self {
            ClassRef::User(def) => Rc::clone(&def.name),
            ClassRef::Builtin { path, .. } => Rc::clone(path),
        }
    }
}

#[derive(Debug, Clone)]
struct StaticField {
    class: Rc<str>,
    name: Rc<str>,
    default: Addr,
}

/// Table of user classes, built-in classes and static fields.
#[derive(Debug, Default, Clone)]
pub struct ClassTable {
    classes: HashMap<Rc<str>, ClassDef>,
    builtins: BuiltinRegistry,
    statics: Vec<StaticField>,
    static_index: HashMap<(Rc<str>, Rc<str>), u32>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a user class and assigns indices to its static fields.
    pub fn define(&mut self, def: ClassDef) {
        debug!("define(class = {}, fields = {})", def.name, def.fields.len());
        for (name, default) in &def.statics {
            let key = (Rc::clone(&def.name), Rc::clone(name));
            if self.static_index.contains_key(&key) {
                continue;
            }
            let index = self.statics.len() as u32;
            self.statics.push(StaticField {
                class: Rc::clone(&def.name),
                name: Rc::clone(name),
                default: *default,
            });
            self.static_index.insert(key, index);
        }
        self.classes.insert(Rc::clone(&def.name), def);
    }

    pub fn register_builtin(&mut self, class: Rc<dyn BuiltinClass>) {
        self.builtins.register(class);
    }

    pub fn builtins(&self) -> &BuiltinRegistry {
        &self.builtins
    }

    pub fn get(&self, classpath: &str) -> Option<&ClassDef> {
        self.classes.get(classpath)
    }

    pub fn contains(&self, classpath: &str) -> bool {
        self.classes.contains_key(classpath) || self.builtins.contains(classpath)
    }

    /// Inheritance chain from `classpath` up to the root, most derived first.
    ///
    /// The chain stops at the first class that is not known. Returns an empty chain if
    /// `classpath` itself is unknown.
    pub fn chain(&self, classpath: &str) -> Vec<ClassRef<'_>> {
        let mut chain = Vec::new();
        let mut next: Option<Rc<str>> = Some(classpath.into());
        while let Some(path) = next.take() {
            if chain.iter().any(|c: &ClassRef| c.name() == path) {
                debug!("chain: inheritance cycle at {}", path);
                break;
            }
            if let Some(def) = self.classes.get(&path) {
                next = def.superclass.clone();
                chain.push(ClassRef::User(def));
            } else if let Some(class) = self.builtins.get(&path) {
                next = class.superclass().map(Rc::from);
                chain.push(ClassRef::Builtin {
                    path,
                    class: Rc::clone(class),
                });
            } else {
                debug!("chain: {} is not known, stopping", path);
            }
        }
        chain
    }

    /// Whether `classpath` is `ancestor` or inherits from it.
    pub fn is_subclass(&self, classpath: &str, ancestor: &str) -> bool {
        self.chain(classpath).iter().any(|c| &*c.name() == ancestor)
    }

    /// Address of static field `class.field`.
    pub fn static_field(&self, class: &str, field: &str) -> Option<Addr> {
        let key: (Rc<str>, Rc<str>) = (class.into(), field.into());
        if let Some(&index) = self.static_index.get(&key) {
            return Some(Addr::static_field(index));
        }
        // Inherited statics resolve through the superclass.
        let def = self.classes.get(class)?;
        let parent = def.superclass.as_deref()?;
        self.static_field(parent, field)
    }

    /// Name of the static field at `index`, as `(class, field)`.
    pub fn static_name(&self, index: u32) -> Option<(&str, &str)> {
        self.statics.get(index as usize).map(|s| (&*s.class, &*s.name))
    }

    /// Default constant of every static field, by index.
    pub fn static_defaults(&self) -> Rc<[Addr]> {
        self.statics.iter().map(|s| s.default).collect()
    }

    pub fn num_statics(&self) -> usize {
        self.statics.len()
    }
}
