//! Tagged values.
//!
//! A [`Value`] is either an inline primitive (nil, real, integer, boolean,
//! class id) or a reference into the [`Heap`](crate::heap::Heap). Strong
//! references participate in reference counting, so `Clone` is
//! deliberately not derived: use [`Value::clone_with_heap`] to copy a
//! value that may hold an object reference, [`Value::raw_copy`] for a
//! non-owning snapshot, and [`Value::drop_with_heap`] when an owning value
//! goes away.

use std::fmt;

use strum::{FromRepr, IntoStaticStr};

use crate::heap::{Heap, HeapId};

/// Class (type) identifiers.
///
/// The first group are value classes carried inline in a [`Value`]; the
/// rest are object classes stored on the heap. `typeof` evaluates to one
/// of these, and cast expressions name them.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ClassId {
    Nil = 0,
    Real,
    Integer,
    Boolean,
    TypeId,
    ObjRef,
    WeakRef,

    String,
    Function,
    Module,
    Table,
    Array,
    VectorF64,
    VectorF32,
    VectorI32,
    VectorU32,
    VectorI16,
    VectorU16,
    VectorI8,
    VectorU8,
    ClassDef,
}

impl ClassId {
    /// Whether instances of this class live on the heap.
    #[must_use]
    pub fn is_object(self) -> bool {
        self as u8 >= Self::String as u8
    }
}

/// A dynamically-typed value.
#[derive(Debug, PartialEq)]
pub enum Value {
    Nil,
    Real(f64),
    Integer(i32),
    Boolean(bool),
    TypeId(ClassId),
    /// Strong (counted) object reference.
    ObjRef(HeapId),
    /// Weak (uncounted) object reference.
    WeakRef(HeapId),
}

impl Value {
    /// The value class; for object references, the class of the referenced
    /// object.
    #[must_use]
    pub fn class_id(&self, heap: &Heap) -> ClassId {
        match self {
            Self::Nil => ClassId::Nil,
            Self::Real(_) => ClassId::Real,
            Self::Integer(_) => ClassId::Integer,
            Self::Boolean(_) => ClassId::Boolean,
            Self::TypeId(_) => ClassId::TypeId,
            Self::ObjRef(id) | Self::WeakRef(id) => heap.class_of(*id),
        }
    }

    /// Truthiness: nil, integer 0, false and 0.0 are false; everything
    /// else, including any object reference, is true.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::Nil => false,
            Self::Real(v) => *v != 0.0,
            Self::Integer(v) => *v != 0,
            Self::Boolean(v) => *v,
            Self::TypeId(_) | Self::ObjRef(_) | Self::WeakRef(_) => true,
        }
    }

    #[must_use]
    pub fn is_objref(&self) -> bool {
        matches!(self, Self::ObjRef(_) | Self::WeakRef(_))
    }

    /// The referenced heap object, for either reference strength.
    #[must_use]
    pub fn object(&self) -> Option<HeapId> {
        match self {
            Self::ObjRef(id) | Self::WeakRef(id) => Some(*id),
            _ => None,
        }
    }

    /// Bitwise copy without touching reference counts.
    ///
    /// The copy must not outlive the owner of `self`; use
    /// [`Value::clone_with_heap`] for an owning copy.
    #[must_use]
    pub fn raw_copy(&self) -> Self {
        match self {
            Self::Nil => Self::Nil,
            Self::Real(v) => Self::Real(*v),
            Self::Integer(v) => Self::Integer(*v),
            Self::Boolean(v) => Self::Boolean(*v),
            Self::TypeId(c) => Self::TypeId(*c),
            Self::ObjRef(id) => Self::ObjRef(*id),
            Self::WeakRef(id) => Self::WeakRef(*id),
        }
    }

    /// Owning copy: strong references gain a reference count.
    #[must_use]
    pub fn clone_with_heap(&self, heap: &mut Heap) -> Self {
        if let Self::ObjRef(id) = self {
            heap.own(*id);
        }
        self.raw_copy()
    }

    /// Releases an owning value. Strong references drop a reference
    /// count; everything else is a no-op.
    pub fn drop_with_heap(self, heap: &mut Heap) {
        if let Self::ObjRef(id) = self {
            heap.disown(id);
        }
    }

    /// Shallow equality usable as a table key comparison: same kind and
    /// same payload. Interned strings make `ObjRef` id equality a content
    /// comparison for string keys.
    #[must_use]
    pub fn key_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Real(a), Self::Real(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::TypeId(a), Self::TypeId(b)) => a == b,
            (Self::ObjRef(a) | Self::WeakRef(a), Self::ObjRef(b) | Self::WeakRef(b)) => a == b,
            _ => false,
        }
    }

    /// Human-readable rendering for diagnostics and disassembly.
    #[must_use]
    pub fn display(&self, heap: &Heap) -> String {
        match self {
            Self::Nil => "nil".to_string(),
            Self::Real(v) => {
                let mut buf = ryu::Buffer::new();
                buf.format(*v).to_string()
            }
            Self::Integer(v) => v.to_string(),
            Self::Boolean(v) => if *v { "true" } else { "false" }.to_string(),
            Self::TypeId(c) => {
                let name: &'static str = (*c).into();
                format!("<typeid {name}>")
            }
            Self::ObjRef(id) | Self::WeakRef(id) => {
                let weak = if matches!(self, Self::WeakRef(_)) { "weak " } else { "" };
                if !heap.is_alive(*id) {
                    return format!("<{weak}dead object #{}>", id.index());
                }
                match heap.class_of(*id) {
                    ClassId::String => {
                        let s = String::from_utf8_lossy(heap.str_bytes(*id)).into_owned();
                        format!("\"{s}\"")
                    }
                    class => {
                        let name: &'static str = class.into();
                        format!("<{weak}{name} #{}>", id.index())
                    }
                }
            }
        }
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: &'static str = (*self).into();
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.truthy());
        assert!(!Value::Integer(0).truthy());
        assert!(!Value::Boolean(false).truthy());
        assert!(!Value::Real(0.0).truthy());
        assert!(Value::Integer(-1).truthy());
        assert!(Value::Real(0.5).truthy());
        assert!(Value::Boolean(true).truthy());
        assert!(Value::TypeId(ClassId::Real).truthy());
    }

    #[test]
    fn key_equality_is_kind_strict() {
        assert!(Value::Integer(1).key_eq(&Value::Integer(1)));
        assert!(!Value::Integer(1).key_eq(&Value::Real(1.0)));
        assert!(!Value::Boolean(true).key_eq(&Value::Integer(1)));
    }

    #[test]
    fn object_classes() {
        assert!(ClassId::Table.is_object());
        assert!(!ClassId::Integer.is_object());
    }
}
