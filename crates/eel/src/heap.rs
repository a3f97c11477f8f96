//! Reference-counted object store.
//!
//! Every object the compiler creates (interned strings, tables, arrays,
//! vectors, functions, modules, class descriptors) lives in one slotted
//! arena. Objects carry a strong reference count; `own`/`disown` are the
//! explicit transfer points called out in the component design, and a
//! count reaching zero tears the payload down, releasing everything the
//! object owned in turn.
//!
//! Strings are interned: allocating the same byte sequence twice yields
//! the same [`HeapId`], so id equality on string references is content
//! equality. The intern table itself does not hold a reference; a string
//! whose last owner lets go is removed from the table.

use ahash::RandomState;
use bitflags::bitflags;
use indexmap::IndexMap;

use crate::value::{ClassId, Value};

/// Index of an object in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Function flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FnFlags: u16 {
        /// Native (host) function rather than bytecode.
        const CFUNC = 0x0001;
        /// Takes arguments.
        const ARGS = 0x0002;
        /// Returns a value.
        const RESULTS = 0x0004;
        /// Accesses upvalues.
        const UPVALUES = 0x0008;
        /// Exception block (`try`/`except`/`untry` body).
        const XBLOCK = 0x0010;
        /// Exported from its module.
        const EXPORT = 0x0020;
        /// Forward declaration only; no body yet.
        const DECLARATION = 0x0040;
        /// Module root function (`__init_module`).
        const ROOT = 0x0080;
    }
}

/// Signature of a native function callback.
pub type NativeFn = fn(&mut Heap, &[Value]) -> Result<Option<Value>, crate::operate::OperateError>;

/// Bytecode body of a compiled function.
#[derive(Debug, Default)]
pub struct EelBody {
    pub code: Vec<u8>,
    /// One entry per instruction.
    pub lines: Vec<i32>,
    /// Owning, except references to functions in the same module.
    pub constants: Vec<Value>,
    /// Number of registers in the call frame.
    pub framesize: u16,
    /// Number of variable registers to clear on frame exit.
    pub cleansize: u16,
}

/// Implementation of a function: bytecode or native callback.
#[derive(Debug)]
pub enum FnBody {
    Eel(EelBody),
    Native(NativeFn),
}

/// A function object.
#[derive(Debug)]
pub struct Function {
    /// Interned name.
    pub name: HeapId,
    /// Defining module. Non-owning: the module owns its functions.
    pub module: HeapId,
    pub flags: FnFlags,
    pub results: u8,
    pub reqargs: u8,
    pub optargs: u8,
    pub tupargs: u8,
    pub body: FnBody,
}

impl Function {
    /// The bytecode body. Errors would indicate a compiler bug, so this is
    /// only used where the function is known to be an EEL function.
    #[must_use]
    pub fn eel(&self) -> &EelBody {
        match &self.body {
            FnBody::Eel(e) => e,
            FnBody::Native(_) => unreachable!("native function has no bytecode body"),
        }
    }

    #[must_use]
    pub fn eel_mut(&mut self) -> &mut EelBody {
        match &mut self.body {
            FnBody::Eel(e) => e,
            FnBody::Native(_) => unreachable!("native function has no bytecode body"),
        }
    }
}

/// A module object.
#[derive(Debug)]
pub struct Module {
    /// Export table object (owned).
    pub exports: HeapId,
    /// Static variable table (owned values).
    pub variables: Vec<Value>,
    /// Objects created while compiling the module (owned), for
    /// deterministic teardown.
    pub objects: Vec<HeapId>,
    /// −1 while compiling; the post-compile reference sum afterwards.
    pub refsum: i64,
}

/// Ordered mapping from values to values with unique keys.
///
/// Keys compare with [`Value::key_eq`]; since strings are interned, a
/// string key comparison is an id comparison. Entries are kept in
/// insertion order.
#[derive(Debug, Default)]
pub struct Table {
    items: Vec<(Value, Value)>,
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Non-owning view of the value for `key`.
    #[must_use]
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.items.iter().find(|(k, _)| k.key_eq(key)).map(|(_, v)| v)
    }

    /// Entry by insertion position.
    #[must_use]
    pub fn item(&self, index: usize) -> Option<(&Value, &Value)> {
        self.items.get(index).map(|(k, v)| (k, v))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.items.iter().map(|(k, v)| (k, v))
    }
}

/// Which metamethods a class implements.
///
/// The descriptor is data; the behavior of the built-in classes lives in
/// `operate`. User classes created at runtime would fill this in from
/// their registration.
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Metamethods: u32 {
        const GETINDEX = 0x0001;
        const SETINDEX = 0x0002;
        const LENGTH = 0x0004;
        const COMPARE = 0x0008;
        const EQ = 0x0010;
        const IN = 0x0020;
        const CASTS = 0x0040;
        const CLONE = 0x0080;
        const ARITHMETIC = 0x0100;
    }
}

/// Per-class descriptor.
#[derive(Debug)]
pub struct ClassDef {
    pub class: ClassId,
    /// Interned class name.
    pub name: HeapId,
    pub mmethods: Metamethods,
}

/// Numeric vector payloads.
#[derive(Debug)]
pub enum Vector {
    F64(Vec<f64>),
    F32(Vec<f32>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I8(Vec<i8>),
    U8(Vec<u8>),
}

impl Vector {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F64(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::U32(v) => v.len(),
            Self::I16(v) => v.len(),
            Self::U16(v) => v.len(),
            Self::I8(v) => v.len(),
            Self::U8(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element as a value; integers for integer element types, reals for
    /// the float types.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Value> {
        match self {
            Self::F64(v) => v.get(index).map(|x| Value::Real(*x)),
            Self::F32(v) => v.get(index).map(|x| Value::Real(f64::from(*x))),
            Self::I32(v) => v.get(index).map(|x| Value::Integer(*x)),
            #[expect(clippy::cast_possible_wrap, reason = "u32 elements read back as raw integer bits")]
            Self::U32(v) => v.get(index).map(|x| Value::Integer(*x as i32)),
            Self::I16(v) => v.get(index).map(|x| Value::Integer(i32::from(*x))),
            Self::U16(v) => v.get(index).map(|x| Value::Integer(i32::from(*x))),
            Self::I8(v) => v.get(index).map(|x| Value::Integer(i32::from(*x))),
            Self::U8(v) => v.get(index).map(|x| Value::Integer(i32::from(*x))),
        }
    }

    #[must_use]
    pub fn class_id(&self) -> ClassId {
        match self {
            Self::F64(_) => ClassId::VectorF64,
            Self::F32(_) => ClassId::VectorF32,
            Self::I32(_) => ClassId::VectorI32,
            Self::U32(_) => ClassId::VectorU32,
            Self::I16(_) => ClassId::VectorI16,
            Self::U16(_) => ClassId::VectorU16,
            Self::I8(_) => ClassId::VectorI8,
            Self::U8(_) => ClassId::VectorU8,
        }
    }
}

/// Object payloads.
#[derive(Debug)]
pub enum HeapData {
    String(Box<[u8]>),
    Table(Table),
    Array(Vec<Value>),
    Vector(Vector),
    Function(Function),
    Module(Module),
    ClassDef(ClassDef),
}

impl HeapData {
    #[must_use]
    pub fn class_id(&self) -> ClassId {
        match self {
            Self::String(_) => ClassId::String,
            Self::Table(_) => ClassId::Table,
            Self::Array(_) => ClassId::Array,
            Self::Vector(v) => v.class_id(),
            Self::Function(_) => ClassId::Function,
            Self::Module(_) => ClassId::Module,
            Self::ClassDef(_) => ClassId::ClassDef,
        }
    }
}

#[derive(Debug)]
struct Slot {
    refs: u32,
    data: Option<HeapData>,
}

/// The object arena.
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    interns: IndexMap<Box<[u8]>, HeapId, RandomState>,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new object with one reference owned by the caller.
    pub fn alloc(&mut self, data: HeapData) -> HeapId {
        let id = HeapId(u32::try_from(self.slots.len()).expect("heap exhausted"));
        self.slots.push(Slot { refs: 1, data: Some(data) });
        id
    }

    /// Interned string allocation: the same bytes always yield the same
    /// id. The returned reference is owned by the caller.
    pub fn new_string(&mut self, bytes: &[u8]) -> HeapId {
        if let Some(&id) = self.interns.get(bytes) {
            self.own(id);
            return id;
        }
        let id = self.alloc(HeapData::String(bytes.into()));
        self.interns.insert(bytes.into(), id);
        id
    }

    /// Convenience for str literals.
    pub fn new_str(&mut self, s: &str) -> HeapId {
        self.new_string(s.as_bytes())
    }

    /// Finds an already-interned string without creating or owning it.
    #[must_use]
    pub fn find_string(&self, bytes: &[u8]) -> Option<HeapId> {
        self.interns.get(bytes).copied()
    }

    /// Adds a reference.
    pub fn own(&mut self, id: HeapId) {
        let slot = &mut self.slots[id.index()];
        debug_assert!(slot.data.is_some(), "owning a dead object");
        slot.refs += 1;
    }

    /// Drops a reference; at zero the payload is destroyed and everything
    /// it owned is released in turn.
    pub fn disown(&mut self, id: HeapId) {
        let slot = &mut self.slots[id.index()];
        if slot.refs == 0 {
            debug_assert!(false, "disowning with zero refs");
            return;
        }
        slot.refs -= 1;
        if slot.refs > 0 {
            return;
        }
        let Some(data) = slot.data.take() else { return };
        self.destroy(id, data);
    }

    fn destroy(&mut self, id: HeapId, data: HeapData) {
        match data {
            HeapData::String(bytes) => {
                self.interns.shift_remove(&bytes);
                let _ = id;
            }
            HeapData::Table(table) => {
                for (k, v) in table.items {
                    k.drop_with_heap(self);
                    v.drop_with_heap(self);
                }
            }
            HeapData::Array(items) => {
                for v in items {
                    v.drop_with_heap(self);
                }
            }
            HeapData::Vector(_) => {}
            HeapData::Function(f) => {
                self.disown(f.name);
                if let FnBody::Eel(body) = f.body {
                    let module = f.module;
                    for c in body.constants {
                        // Same-module function constants are borrows; the
                        // module owns those functions. A dead target can
                        // only be such a sibling freed first.
                        if let Value::ObjRef(cid) = &c {
                            if !self.is_alive(*cid) || self.function(*cid).is_some_and(|cf| cf.module == module) {
                                continue;
                            }
                        }
                        c.drop_with_heap(self);
                    }
                }
            }
            HeapData::Module(m) => {
                self.disown(m.exports);
                for v in m.variables {
                    v.drop_with_heap(self);
                }
                for o in m.objects {
                    self.disown(o);
                }
            }
            HeapData::ClassDef(cd) => {
                self.disown(cd.name);
            }
        }
    }

    #[must_use]
    pub fn is_alive(&self, id: HeapId) -> bool {
        self.slots.get(id.index()).is_some_and(|s| s.data.is_some())
    }

    #[must_use]
    pub fn refcount(&self, id: HeapId) -> u32 {
        self.slots[id.index()].refs
    }

    /// Payload access. The object must be alive.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        self.slots[id.index()].data.as_ref().expect("access to dead object")
    }

    #[must_use]
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.slots[id.index()].data.as_mut().expect("access to dead object")
    }

    #[must_use]
    pub fn class_of(&self, id: HeapId) -> ClassId {
        self.get(id).class_id()
    }

    #[must_use]
    pub fn str_bytes(&self, id: HeapId) -> &[u8] {
        match self.get(id) {
            HeapData::String(b) => b,
            _ => unreachable!("expected a string object"),
        }
    }

    /// The string payload as UTF-8 (lossy) for diagnostics.
    #[must_use]
    pub fn str_lossy(&self, id: HeapId) -> String {
        String::from_utf8_lossy(self.str_bytes(id)).into_owned()
    }

    #[must_use]
    pub fn function(&self, id: HeapId) -> Option<&Function> {
        match self.slots.get(id.index()).and_then(|s| s.data.as_ref()) {
            Some(HeapData::Function(f)) => Some(f),
            _ => None,
        }
    }

    #[must_use]
    pub fn function_mut(&mut self, id: HeapId) -> &mut Function {
        match self.get_mut(id) {
            HeapData::Function(f) => f,
            _ => unreachable!("expected a function object"),
        }
    }

    #[must_use]
    pub fn module(&self, id: HeapId) -> &Module {
        match self.get(id) {
            HeapData::Module(m) => m,
            _ => unreachable!("expected a module object"),
        }
    }

    #[must_use]
    pub fn module_mut(&mut self, id: HeapId) -> &mut Module {
        match self.get_mut(id) {
            HeapData::Module(m) => m,
            _ => unreachable!("expected a module object"),
        }
    }

    #[must_use]
    pub fn table(&self, id: HeapId) -> &Table {
        match self.get(id) {
            HeapData::Table(t) => t,
            _ => unreachable!("expected a table object"),
        }
    }

    #[must_use]
    pub fn classdef(&self, id: HeapId) -> &ClassDef {
        match self.get(id) {
            HeapData::ClassDef(c) => c,
            _ => unreachable!("expected a class descriptor"),
        }
    }

    /// Allocates an empty table object.
    pub fn new_table(&mut self) -> HeapId {
        self.alloc(HeapData::Table(Table::new()))
    }

    /// Allocates a module with an empty export table. The caller owns the
    /// returned reference; the module owns the export table.
    pub fn new_module(&mut self) -> HeapId {
        let exports = self.new_table();
        self.alloc(HeapData::Module(Module {
            exports,
            variables: Vec::new(),
            objects: Vec::new(),
            refsum: -1,
        }))
    }

    /// Sets `key` in table object `tid` to `value`, both passed by
    /// ownership transfer. A previous value under the key is released.
    pub fn table_set(&mut self, tid: HeapId, key: Value, value: Value) {
        let pos = self.table(tid).items.iter().position(|(k, _)| k.key_eq(&key));
        let HeapData::Table(table) = self.get_mut(tid) else {
            unreachable!("expected a table object");
        };
        match pos {
            Some(i) => {
                let old = std::mem::replace(&mut table.items[i].1, value);
                // Key ownership stays with the existing entry.
                key.drop_with_heap(self);
                old.drop_with_heap(self);
            }
            None => table.items.push((key, value)),
        }
    }

    /// Convenience: set a string-keyed export-style entry.
    pub fn table_set_str(&mut self, tid: HeapId, key: &str, value: Value) {
        let k = self.new_str(key);
        self.table_set(tid, Value::ObjRef(k), value);
    }

    /// Removes `key` from table object `tid`, releasing the entry.
    pub fn table_delete(&mut self, tid: HeapId, key: &Value) {
        let HeapData::Table(table) = self.get_mut(tid) else {
            unreachable!("expected a table object");
        };
        if let Some(pos) = table.items.iter().position(|(k, _)| k.key_eq(key)) {
            let (k, v) = table.items.remove(pos);
            k.drop_with_heap(self);
            v.drop_with_heap(self);
        }
    }

    /// Sum of reference counts reachable from a module, used for the
    /// post-compile `refsum` bookkeeping.
    #[must_use]
    pub fn module_countref(&self, mid: HeapId) -> i64 {
        let m = self.module(mid);
        let mut sum = i64::from(self.refcount(mid));
        sum += i64::from(self.refcount(m.exports));
        for o in &m.objects {
            sum += i64::from(self.refcount(*o));
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut heap = Heap::new();
        let a = heap.new_str("hello");
        let b = heap.new_str("hello");
        let c = heap.new_str("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.refcount(a), 2);
    }

    #[test]
    fn dead_strings_leave_the_intern_table() {
        let mut heap = Heap::new();
        let a = heap.new_str("gone");
        heap.disown(a);
        assert!(!heap.is_alive(a));
        let b = heap.new_str("gone");
        assert_ne!(a, b);
    }

    #[test]
    fn table_set_replaces_and_owns() {
        let mut heap = Heap::new();
        let t = heap.new_table();
        let k = heap.new_str("key");
        heap.table_set(t, Value::ObjRef(k), Value::Integer(1));
        let k2 = heap.new_str("key");
        heap.table_set(t, Value::ObjRef(k2), Value::Integer(2));
        assert_eq!(heap.table(t).len(), 1);
        assert_eq!(heap.table(t).get(&Value::ObjRef(k)), Some(&Value::Integer(2)));
        // The duplicate key reference was released by the overwrite.
        assert_eq!(heap.refcount(k), 1);
        heap.disown(t);
        assert!(!heap.is_alive(k));
    }

    #[test]
    fn module_teardown_releases_objects() {
        let mut heap = Heap::new();
        let m = heap.new_module();
        let t = heap.new_table();
        heap.module_mut(m).objects.push(t);
        let s = heap.new_str("static");
        heap.module_mut(m).variables.push(Value::ObjRef(s));
        heap.disown(m);
        assert!(!heap.is_alive(t));
        assert!(!heap.is_alive(s));
        assert!(!heap.is_alive(m));
    }

    #[test]
    fn vector_elements() {
        let v = Vector::U16(vec![1, 2, 3]);
        assert_eq!(v.len(), 3);
        assert_eq!(v.get(1), Some(Value::Integer(2)));
        assert_eq!(v.class_id(), ClassId::VectorU16);
        let v = Vector::F32(vec![0.5]);
        assert_eq!(v.get(0), Some(Value::Real(0.5)));
    }
}
