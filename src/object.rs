//! Abstract objects.
//!
//! An [`Object`] is flattened into one [`Segment`] per class of its inheritance chain,
//! most derived first:
//!
//! ```text
//! new LDerived;   =>   [ LDerived; { y: #reloc(4) } ]
//!                      [ LBase;    { x: #reloc(3) } ]
//!                      [ LModel;   <built-in payload> ]
//! ```
//!
//! User segments hold one *address* per field; the field's value lives in its own
//! store slot. Built-in segments hold an opaque payload driven through
//! [`BuiltinInstance`].
//!
//! Equality and hashing are structural over class names and field addresses only.
//! Two objects are equal when they are the same abstract entity, even across heaps,
//! not when the values they point to happen to agree.

use std::fmt::{Debug, Display, Formatter};
use std::rc::Rc;

use log::debug;

use crate::address::Addr;
use crate::builtin::BuiltinInstance;
use crate::class::{ClassRef, ClassTable};
use crate::set::Set;
use crate::tag::TagSet;
use crate::utils::{hash_str, mix2, MyHash};

/// Body of one segment.
#[derive(Debug)]
pub enum SegmentBody {
    Fields(Vec<(Rc<str>, Addr)>),
    Builtin(Box<dyn BuiltinInstance>),
}

/// Part of an object belonging to one class.
#[derive(Debug)]
pub struct Segment {
    class: Rc<str>,
    body: SegmentBody,
}

impl Segment {
    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn body(&self) -> &SegmentBody {
        &self.body
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self.body, SegmentBody::Builtin(_))
    }

    fn hash(&self) -> u64 {
        let body = match &self.body {
            SegmentBody::Fields(fields) => fields
                .iter()
                .fold(0, |acc, (name, addr)| mix2(acc, mix2(hash_str(name), MyHash::hash(addr)))),
            SegmentBody::Builtin(inst) => inst.hash(),
        };
        mix2(hash_str(&self.class), body)
    }
}

impl Clone for Segment {
    fn clone(&self) -> Self {
        let body = match &self.body {
            SegmentBody::Fields(fields) => SegmentBody::Fields(fields.clone()),
            SegmentBody::Builtin(inst) => SegmentBody::Builtin(inst.duplicate()),
        };
        Self {
            class: Rc::clone(&self.class),
            body,
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let SegmentBody::Builtin(inst) = &mut self.body {
            inst.finalize();
        }
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        if self.class != other.class {
            return false;
        }
        match (&self.body, &other.body) {
            (SegmentBody::Fields(a), SegmentBody::Fields(b)) => a == b,
            (SegmentBody::Builtin(a), SegmentBody::Builtin(b)) => a.equal(b.as_ref()),
            _ => false,
        }
    }
}

/// Result of a field lookup.
#[derive(Debug)]
pub enum FieldRef<'a> {
    /// The field's value lives in this store address.
    Addr(Addr),
    /// The field belongs to a built-in payload.
    Builtin(&'a dyn BuiltinInstance),
}

/// Abstract object: a chain of class segments.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    segments: Vec<Segment>,
    tags: TagSet,
}

impl Object {
    /// Builds an object of `classpath`, one segment per class of its chain.
    ///
    /// `field_addr(class, field)` provides the address of every user field.
    /// Returns `None` if `classpath` is unknown.
    pub fn from_classpath(
        classes: &ClassTable,
        classpath: &str,
        mut field_addr: impl FnMut(&str, &str) -> Addr,
    ) -> Option<Object> {
        let chain = classes.chain(classpath);
        if chain.is_empty() {
            return None;
        }
        let mut segments = Vec::with_capacity(chain.len());
        for link in chain {
            let segment = match link {
                ClassRef::User(def) => {
                    let fields = def
                        .fields
                        .iter()
                        .map(|f| (Rc::clone(f), field_addr(&def.name, f)))
                        .collect();
                    Segment {
                        class: Rc::clone(&def.name),
                        body: SegmentBody::Fields(fields),
                    }
                }
                ClassRef::Builtin { path, class } => {
                    let inst = class.initialize(classpath);
                    Segment {
                        class: path,
                        body: SegmentBody::Builtin(inst),
                    }
                }
            };
            segments.push(segment);
        }
        debug!("from_classpath({}) => {} segments", classpath, segments.len());
        Some(Object {
            segments,
            tags: TagSet::new(),
        })
    }

    /// The most derived class.
    pub fn classpath(&self) -> &str {
        self.segments.first().map(|s| s.class()).unwrap_or("")
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Whether the object is an instance of `classpath`.
    pub fn is_instance_of(&self, classpath: &str) -> bool {
        self.segments.iter().any(|s| {
            &*s.class == classpath
                || match &s.body {
                    SegmentBody::Builtin(inst) => inst.is_instance_of(classpath),
                    SegmentBody::Fields(_) => false,
                }
        })
    }

    /// Index of the segment serving `field`, searching from the segment of `classpath`
    /// toward the root, then the whole chain.
    fn find_segment(&self, classpath: &str, field: &str) -> Option<usize> {
        let start = self.segments.iter().position(|s| &*s.class == classpath).unwrap_or(0);
        let serves = |s: &Segment| match &s.body {
            SegmentBody::Fields(fields) => fields.iter().any(|(name, _)| &**name == field),
            SegmentBody::Builtin(inst) => inst.get_field(field).is_some(),
        };
        (start..self.segments.len())
            .chain(0..start)
            .find(|&i| serves(&self.segments[i]))
    }

    /// Looks up `field` as seen from `classpath`.
    pub fn field(&self, classpath: &str, field: &str) -> Option<FieldRef<'_>> {
        let i = self.find_segment(classpath, field)?;
        match &self.segments[i].body {
            SegmentBody::Fields(fields) => fields
                .iter()
                .find(|(name, _)| &**name == field)
                .map(|&(_, addr)| FieldRef::Addr(addr)),
            SegmentBody::Builtin(inst) => Some(FieldRef::Builtin(inst.as_ref())),
        }
    }

    /// Writes a built-in field. Returns `false` if no built-in segment serves it.
    pub fn put_builtin_field(&mut self, classpath: &str, field: &str, value: &Set, keep_old: bool) -> bool {
        let Some(i) = self.find_segment(classpath, field) else {
            return false;
        };
        match &mut self.segments[i].body {
            SegmentBody::Builtin(inst) => inst.put_field(field, value, keep_old),
            SegmentBody::Fields(_) => false,
        }
    }

    /// Every store address the object refers to: user field slots and addresses held
    /// by built-in payloads.
    pub fn referenced_addrs(&self, out: &mut Vec<Addr>) {
        for s in &self.segments {
            match &s.body {
                SegmentBody::Fields(fields) => out.extend(fields.iter().map(|&(_, a)| a)),
                SegmentBody::Builtin(inst) => inst.referenced_addrs(out),
            }
        }
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn tags_mut(&mut self) -> &mut TagSet {
        &mut self.tags
    }

    pub fn hashcode(&self) -> u64 {
        let h = self.segments.iter().fold(0, |acc, s| mix2(acc, s.hash()));
        h ^ MyHash::hash(&self.tags)
    }

    /// Joins `other` into `self`. Returns `true` if `self` changed.
    ///
    /// Objects of the same entity share their field addresses, so the join only has
    /// to reconcile tags.
    pub fn join(&mut self, other: &Object) -> bool {
        if self.segments != other.segments {
            debug!(
                "join: objects of {} and {} differ in layout, keeping the first",
                self.classpath(),
                other.classpath()
            );
        }
        self.tags.union_with(&other.tags)
    }
}

impl Display for Object {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, s) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{}", s.class)?;
            match &s.body {
                SegmentBody::Fields(fields) => {
                    write!(f, "(")?;
                    for (j, (name, addr)) in fields.iter().enumerate() {
                        if j > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}: {}", name, addr)?;
                    }
                    write!(f, ")")?;
                }
                SegmentBody::Builtin(inst) => write!(f, "<{:?}>", inst)?,
            }
        }
        write!(f, "}}")?;
        if !self.tags.is_empty() {
            write!(f, "{}", self.tags)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::class::ClassDef;

    use test_log::test;

    fn classes() -> ClassTable {
        let mut classes = ClassTable::new();
        classes.define(ClassDef::new("LBase;").field("x"));
        classes.define(ClassDef::new("LDerived;").extends("LBase;").field("y").field("z"));
        classes
    }

    fn build(classes: &ClassTable, classpath: &str) -> Object {
        let mut next = 0;
        Object::from_classpath(classes, classpath, |_, _| {
            next += 1;
            Addr::relocated(next)
        })
        .unwrap()
    }

    #[test]
    fn test_from_classpath() {
        let classes = classes();
        let obj = build(&classes, "LDerived;");
        assert_eq!(obj.segments().len(), 2);
        assert_eq!(obj.classpath(), "LDerived;");
        assert_eq!(obj.segments()[1].class(), "LBase;");
        assert!(Object::from_classpath(&classes, "LNope;", |_, _| Addr::NULL).is_none());
    }

    #[test]
    fn test_field_lookup() {
        let classes = classes();
        let obj = build(&classes, "LDerived;");
        assert!(matches!(obj.field("LDerived;", "y"), Some(FieldRef::Addr(a)) if a == Addr::relocated(1)));
        assert!(matches!(obj.field("LDerived;", "x"), Some(FieldRef::Addr(a)) if a == Addr::relocated(3)));
        assert!(matches!(obj.field("LBase;", "x"), Some(FieldRef::Addr(a)) if a == Addr::relocated(3)));
        assert!(obj.field("LDerived;", "w").is_none());
    }

    #[test]
    fn test_referenced_addrs() {
        let classes = classes();
        let obj = build(&classes, "LDerived;");
        let mut out = Vec::new();
        obj.referenced_addrs(&mut out);
        assert_eq!(out, vec![Addr::relocated(1), Addr::relocated(2), Addr::relocated(3)]);
    }

    #[test]
    fn test_equality_is_by_addresses() {
        let classes = classes();
        let a = build(&classes, "LDerived;");
        let b = build(&classes, "LDerived;");
        assert_eq!(a, b);
        assert_eq!(a.hashcode(), b.hashcode());
        let c = Object::from_classpath(&classes, "LDerived;", |_, _| Addr::relocated(9)).unwrap();
        assert_ne!(a, c);
        assert_ne!(a.hashcode(), c.hashcode());
    }

    #[test]
    fn test_is_instance_of() {
        let classes = classes();
        let obj = build(&classes, "LDerived;");
        assert!(obj.is_instance_of("LBase;"));
        assert!(!obj.is_instance_of("LOther;"));
    }

    #[test]
    fn test_join_tags() {
        let classes = classes();
        let mut a = build(&classes, "LBase;");
        let mut b = a.clone();
        b.tags_mut().insert(5);
        assert!(a.join(&b));
        assert!(a.tags().contains(5));
        assert!(!a.join(&b));
    }
}
