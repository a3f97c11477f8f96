//! Manipulators: compile-time descriptions of readable/writable things.
//!
//! Expressions and declarations produce manipulators instead of values; a
//! manipulator knows how to generate code to read, write or push whatever
//! it describes, picking shortcut instruction forms (immediate, constant
//! pool, static variable) where they exist. Operator applications form
//! trees whose children may be shared, so manipulators are reference
//! counted at compile time and live in a slab on the compile state.
//!
//! Manipulator lists ([`MList`]) represent argument lists and parallel
//! operand lists.
//!
//! Operator applications over primitive constants are folded right here:
//! the resulting manipulator is a constant, and evaluation errors (such
//! as division by zero) surface as compile errors.

use crate::{
    coder::RegUse,
    diag::{CompileResult, ErrorKind},
    event::CeState,
    heap::{FnFlags, Heap},
    opcode::Opcode,
    operate::{self, OperateError, Operator},
    state::Cc,
    symtab::SymbolId,
    value::{ClassId, Value},
};

/// Index of a manipulator in the slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ManipId(u32);

impl ManipId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a manipulator describes.
#[derive(Debug)]
pub(crate) enum ManipKind {
    /// Nothing; no operations possible. Also the free-slot marker.
    Void,
    /// Constant value (owned), with its constant pool index once known.
    Constant { v: Value, index: i32 },
    /// Result in a temporary register managed by this manipulator.
    Result { reg: i32 },
    /// Result in an unmanaged register.
    Register { reg: i32 },
    /// Static (module) variable.
    StaticVar { sym: SymbolId, index: i32 },
    /// Local or upvalue stack variable.
    Variable { sym: SymbolId, level: u32, reg: i32 },
    /// Required argument, local or upvalue.
    Argument { sym: SymbolId, level: u32, arg: i32 },
    /// Optional argument, local or upvalue.
    OptArg { sym: SymbolId, level: u32, arg: i32 },
    /// Tuple argument; can only be indexed.
    TupArg { sym: SymbolId, level: u32, arg: i32 },
    /// Operator application. `left` is absent for unary operators.
    Op {
        left: Option<ManipId>,
        op: Operator,
        right: ManipId,
    },
    /// Cast to a class.
    Cast { object: ManipId, class: ClassId },
    /// Indexed object.
    Index { object: ManipId, index: ManipId },
    /// The full argument list of the current function.
    Args,
    /// The tuple argument list of the current function.
    TupArgs,
}

/// Slab slot: refcount plus payload.
#[derive(Debug)]
pub(crate) struct ManipSlot {
    pub refs: u32,
    pub kind: ManipKind,
}

impl ManipSlot {
    /// Releases heap references held by the payload; used for wholesale
    /// teardown at the end of a compilation.
    pub fn release(self, heap: &mut Heap) {
        if let ManipKind::Constant { v, .. } = self.kind {
            v.drop_with_heap(heap);
        }
    }
}

/// An ordered list of manipulators. The list owns one reference to each
/// element; close it with [`Cc::ml_close`].
#[derive(Debug, Default)]
pub(crate) struct MList {
    items: Vec<ManipId>,
}

impl MList {
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Element by index; negative indices count from the end.
    #[must_use]
    pub fn get(&self, i: isize) -> Option<ManipId> {
        let i = if i < 0 {
            self.items.len().checked_sub(i.unsigned_abs())?
        } else {
            usize::try_from(i).ok()?
        };
        self.items.get(i).copied()
    }

    #[must_use]
    pub fn first(&self) -> Option<ManipId> {
        self.items.first().copied()
    }
}

impl Cc<'_> {
    pub fn ml_open(&mut self) -> MList {
        MList::default()
    }

    /// Closes a list, dropping one reference from each element.
    pub fn ml_close(&mut self, ml: MList) -> CompileResult<()> {
        for id in ml.items {
            self.m_deref(id)?;
        }
        Ok(())
    }

    /// Moves every element of `from` to the end of `to`.
    pub fn ml_transfer(&mut self, from: &mut MList, to: &mut MList) {
        to.items.append(&mut from.items);
    }

    /// Removes `count` elements starting at `first`, dropping their
    /// references.
    pub fn ml_delete(&mut self, ml: &mut MList, first: usize, count: usize) -> CompileResult<()> {
        let end = (first + count).min(ml.items.len());
        let removed: Vec<ManipId> = ml.items.drain(first..end).collect();
        for id in removed {
            self.m_deref(id)?;
        }
        Ok(())
    }

    /// Removes one element (by value) from the list, dropping its
    /// reference.
    pub fn ml_remove(&mut self, ml: &mut MList, id: ManipId) -> CompileResult<()> {
        if let Some(pos) = ml.items.iter().position(|&m| m == id) {
            ml.items.remove(pos);
            self.m_deref(id)?;
        }
        Ok(())
    }

    /// Pushes every element onto the argument stack, in order. Returns
    /// the element count.
    pub fn ml_push(&mut self, ml: &MList) -> CompileResult<usize> {
        for &id in &ml.items {
            self.m_push(id)?;
        }
        Ok(ml.items.len())
    }

    // ---- Construction ----------------------------------------------

    fn m_alloc(&mut self, kind: ManipKind) -> ManipId {
        if let Some(ix) = self.free_manips.pop() {
            let slot = &mut self.manips[ix as usize];
            slot.refs = 1;
            slot.kind = kind;
            return ManipId(ix);
        }
        let ix = u32::try_from(self.manips.len()).expect("manipulator slab exhausted");
        self.manips.push(ManipSlot { refs: 1, kind });
        ManipId(ix)
    }

    fn m_attach(&mut self, ml: &mut MList, kind: ManipKind) -> ManipId {
        let id = self.m_alloc(kind);
        ml.items.push(id);
        id
    }

    pub fn manip(&self, id: ManipId) -> &ManipKind {
        &self.manips[id.index()].kind
    }

    pub fn m_ref(&mut self, id: ManipId) {
        self.manips[id.index()].refs += 1;
    }

    /// Drops a reference; the last one releases the payload (and, for
    /// managed result registers, the register).
    pub fn m_deref(&mut self, id: ManipId) -> CompileResult<()> {
        let slot = &mut self.manips[id.index()];
        debug_assert!(slot.refs > 0, "double-deref of a manipulator");
        slot.refs -= 1;
        if slot.refs > 0 {
            return Ok(());
        }
        let kind = std::mem::replace(&mut slot.kind, ManipKind::Void);
        self.free_manips.push(id.0);
        match kind {
            ManipKind::Constant { v, .. } => v.drop_with_heap(self.heap),
            ManipKind::Result { reg } => {
                if !self.coders.is_empty() {
                    self.r_free(usize::try_from(reg).expect("result register is non-negative"), 1)?;
                }
            }
            ManipKind::Op { left, right, .. } => {
                if let Some(l) = left {
                    self.m_deref(l)?;
                }
                self.m_deref(right)?;
            }
            ManipKind::Cast { object, .. } => self.m_deref(object)?,
            ManipKind::Index { object, index } => {
                self.m_deref(object)?;
                self.m_deref(index)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Adds a constant manipulator; ownership of `v` transfers to it.
    pub fn m_constant(&mut self, ml: &mut MList, v: Value) -> ManipId {
        self.m_attach(ml, ManipKind::Constant { v, index: -1 })
    }

    /// Adds an owned object reference as a constant.
    pub fn m_object(&mut self, ml: &mut MList, obj: crate::heap::HeapId) -> ManipId {
        self.m_attach(ml, ManipKind::Constant { v: Value::ObjRef(obj), index: -1 })
    }

    /// Allocates a temporary register and adds a result manipulator for
    /// it. Returns the register.
    pub fn m_result(&mut self, ml: &mut MList) -> CompileResult<i32> {
        let reg = self.r_alloc(1, RegUse::Temporary)?;
        let reg = i32::try_from(reg).expect("register index fits i32");
        self.m_attach(ml, ManipKind::Result { reg });
        Ok(reg)
    }

    /// Adds an unmanaged register manipulator.
    pub fn m_register(&mut self, ml: &mut MList, reg: i32) -> ManipId {
        self.m_attach(ml, ManipKind::Register { reg })
    }

    pub fn m_variable(&mut self, ml: &mut MList, sym: SymbolId, level: u32) -> ManipId {
        let (_, location) = self.tree.get(sym).var();
        self.m_attach(ml, ManipKind::Variable { sym, level, reg: location })
    }

    pub fn m_statvar(&mut self, ml: &mut MList, sym: SymbolId) -> ManipId {
        let (_, location) = self.tree.get(sym).var();
        self.m_attach(ml, ManipKind::StaticVar { sym, index: location })
    }

    pub fn m_argument(&mut self, ml: &mut MList, sym: SymbolId, level: u32) -> ManipId {
        let (_, location) = self.tree.get(sym).var();
        self.m_attach(ml, ManipKind::Argument { sym, level, arg: location })
    }

    pub fn m_optarg(&mut self, ml: &mut MList, sym: SymbolId, level: u32) -> ManipId {
        let (_, location) = self.tree.get(sym).var();
        self.m_attach(ml, ManipKind::OptArg { sym, level, arg: location })
    }

    pub fn m_tuparg(&mut self, ml: &mut MList, sym: SymbolId, level: u32) -> ManipId {
        let (_, location) = self.tree.get(sym).var();
        self.m_attach(ml, ManipKind::TupArg { sym, level, arg: location })
    }

    pub fn m_args(&mut self, ml: &mut MList) -> ManipId {
        self.m_attach(ml, ManipKind::Args)
    }

    pub fn m_tupargs(&mut self, ml: &mut MList) -> ManipId {
        self.m_attach(ml, ManipKind::TupArgs)
    }

    /// Adds `left <op> right` (or `<op> right` when `left` is `None`).
    /// Applications over primitive constants fold at compile time.
    pub fn m_op(
        &mut self,
        ml: &mut MList,
        left: Option<ManipId>,
        op: Operator,
        right: ManipId,
    ) -> CompileResult<ManipId> {
        if let Some(folded) = self.try_fold(left, op, right)? {
            return Ok(self.m_attach(ml, ManipKind::Constant { v: folded, index: -1 }));
        }
        if let Some(l) = left {
            self.m_ref(l);
        }
        self.m_ref(right);
        Ok(self.m_attach(ml, ManipKind::Op { left, op, right }))
    }

    /// Constant folding: both operands primitive constants, evaluated
    /// through the operator core. Division by zero is a compile error;
    /// anything the primitive rules cannot handle is left to run time.
    fn try_fold(&mut self, left: Option<ManipId>, op: Operator, right: ManipId) -> CompileResult<Option<Value>> {
        let prim = |kind: &ManipKind| match kind {
            ManipKind::Constant { v, .. } if !v.is_objref() => Some(v.raw_copy()),
            _ => None,
        };
        let Some(rv) = prim(self.manip(right)) else {
            return Ok(None);
        };
        let result = match left {
            Some(l) => {
                let Some(lv) = prim(self.manip(l)) else {
                    return Ok(None);
                };
                operate::binary_op(self.heap, &lv, op, &rv, false, self.options.pascal_divs)
            }
            None => operate::unary_op(self.heap, op, &rv),
        };
        match result {
            Ok(v) => Ok(Some(v)),
            Err(OperateError::DivByZero) => {
                Err(self.error(ErrorKind::Numeric, "Division by zero in constant expression!"))
            }
            Err(_) => Ok(None),
        }
    }

    pub fn m_cast(&mut self, ml: &mut MList, object: ManipId, class: ClassId) -> ManipId {
        self.m_ref(object);
        self.m_attach(ml, ManipKind::Cast { object, class })
    }

    pub fn m_index(&mut self, ml: &mut MList, object: ManipId, index: ManipId) -> ManipId {
        self.m_ref(object);
        self.m_ref(index);
        self.m_attach(ml, ManipKind::Index { object, index })
    }

    /// Moves `m` from one list to another without touching its count.
    pub fn m_transfer(&mut self, m: ManipId, from: &mut MList, to: &mut MList) {
        if let Some(pos) = from.items.iter().position(|&x| x == m) {
            from.items.remove(pos);
            to.items.push(m);
        }
    }

    // ---- Information -----------------------------------------------

    pub fn m_writable(&self, id: ManipId) -> bool {
        matches!(
            self.manip(id),
            ManipKind::Variable { .. }
                | ManipKind::StaticVar { .. }
                | ManipKind::Index { .. }
                | ManipKind::Args
                | ManipKind::TupArgs
        )
    }

    /// Register this manipulator can be read from directly, if any.
    /// Stack variables qualify, since reading them needs no extra steps.
    pub fn m_direct_read(&self, id: ManipId) -> Option<i32> {
        match self.manip(id) {
            ManipKind::Result { reg } | ManipKind::Register { reg } => Some(*reg),
            ManipKind::Variable { level: 0, reg, .. } => Some(*reg),
            _ => None,
        }
    }

    /// Register this manipulator can be written to directly, if any.
    /// Stack variables do NOT qualify: they are written with `INIT` or
    /// `ASSIGN`.
    pub fn m_direct_write(&self, id: ManipId) -> Option<i32> {
        match self.manip(id) {
            ManipKind::Result { reg } | ManipKind::Register { reg } => Some(*reg),
            _ => None,
        }
    }

    /// Constant integer in 0..=255, if that is what this is.
    pub fn m_direct_u8(&self, id: ManipId) -> Option<i32> {
        match self.manip(id) {
            ManipKind::Constant { v: Value::Integer(i), .. } if (0..=255).contains(i) => Some(*i),
            _ => None,
        }
    }

    /// Constant integer in the signed 16-bit range, if that is what this
    /// is.
    pub fn m_direct_short(&self, id: ManipId) -> Option<i32> {
        match self.manip(id) {
            ManipKind::Constant { v: Value::Integer(i), .. } if (-32768..=32767).contains(i) => Some(*i),
            _ => None,
        }
    }

    /// Truthiness of a constant, as a conditional jump would see it.
    pub fn m_direct_bool(&self, id: ManipId) -> Option<bool> {
        match self.manip(id) {
            ManipKind::Constant { v, .. } => Some(v.truthy()),
            _ => None,
        }
    }

    pub fn m_is_constant(&self, id: ManipId) -> bool {
        matches!(self.manip(id), ManipKind::Constant { .. })
    }

    /// Owning copy of a constant manipulator's value.
    pub fn m_get_constant(&mut self, id: ManipId) -> Option<Value> {
        match &self.manips[id.index()].kind {
            ManipKind::Constant { v, .. } => {
                let v = v.raw_copy();
                Some(v.clone_with_heap(self.heap))
            }
            _ => None,
        }
    }

    // ---- Code generation -------------------------------------------

    /// Ensures a constant is in the pool when it needs to be. Returns its
    /// pool index, or −1 for values the instruction set can produce
    /// inline (nil, booleans, short integers).
    pub fn m_prepare_constant(&mut self, id: ManipId) -> CompileResult<i32> {
        let (v, index) = match self.manip(id) {
            ManipKind::Constant { v, index } => (v.raw_copy(), *index),
            _ => return Err(self.ierror("prepare_constant() on a non-constant manipulator!")),
        };
        if index >= 0 {
            return Ok(index);
        }
        match v {
            Value::Nil | Value::Boolean(_) => Ok(-1),
            Value::Integer(i) if (-32768..=32767).contains(&i) => Ok(-1),
            _ => {
                let owned = v.clone_with_heap(self.heap);
                let ix = self.add_constant(owned)?;
                let ix = i32::try_from(ix).map_err(|_| self.error(ErrorKind::Range, "Constant pool overflow!"))?;
                if let ManipKind::Constant { index, .. } = &mut self.manips[id.index()].kind {
                    *index = ix;
                }
                Ok(ix)
            }
        }
    }

    fn read_constant(&mut self, id: ManipId, r: i32) -> CompileResult<()> {
        let ix = self.m_prepare_constant(id)?;
        if ix >= 0 {
            self.code_abx(Opcode::LdC, r, ix)?;
            return Ok(());
        }
        let v = match self.manip(id) {
            ManipKind::Constant { v, .. } => v.raw_copy(),
            _ => unreachable!("checked by prepare_constant"),
        };
        match v {
            Value::Nil => {
                self.code_a(Opcode::LdNil, r)?;
            }
            Value::Integer(i) => {
                self.code_asbx(Opcode::LdI, r, i)?;
            }
            Value::Boolean(true) => {
                self.code_a(Opcode::LdTrue, r)?;
            }
            Value::Boolean(false) => {
                self.code_a(Opcode::LdFalse, r)?;
            }
            _ => return Err(self.ierror("Constant manipulator failed to generate value!")),
        }
        Ok(())
    }

    fn push_constant(&mut self, id: ManipId) -> CompileResult<()> {
        let ix = self.m_prepare_constant(id)?;
        if ix >= 0 {
            self.code_ax(Opcode::PushC, ix)?;
            return Ok(());
        }
        let v = match self.manip(id) {
            ManipKind::Constant { v, .. } => v.raw_copy(),
            _ => unreachable!("checked by prepare_constant"),
        };
        match v {
            Value::Nil => {
                self.code0(Opcode::PushNil)?;
            }
            Value::Integer(i) => {
                self.code_sax(Opcode::PushI, i)?;
            }
            Value::Boolean(true) => {
                self.code0(Opcode::PhTrue)?;
            }
            Value::Boolean(false) => {
                self.code0(Opcode::PhFalse)?;
            }
            _ => return Err(self.ierror("Constant manipulator failed to generate value!")),
        }
        Ok(())
    }

    /// Checks that reading variable symbol `sym` is allowed right now.
    fn check_var_read(&mut self, sym: SymbolId) -> CompileResult<()> {
        match self.test_init(sym) {
            CeState::Yes => Ok(()),
            CeState::No => {
                let name = self.sym_name(sym);
                Err(self.error(
                    ErrorKind::Init,
                    format!("Reading uninitialized variable '{name}'! Maybe you misspelled the name?"),
                ))
            }
            CeState::Maybe => {
                let name = self.sym_name(sym);
                Err(self.error(
                    ErrorKind::Init,
                    format!("Reading variable '{name}', which may be uninitialized at this point!"),
                ))
            }
        }
    }

    /// The argument-vector index of an argument manipulator; optional
    /// arguments sit after the required ones.
    fn arg_index(&self, arg: i32, optional: bool) -> i32 {
        if optional {
            let f = self
                .heap
                .function(self.cdr().func)
                .expect("coder function disappeared");
            arg + i32::from(f.reqargs)
        } else {
            arg
        }
    }

    /// Generates code to copy the value of `id` into register `r`.
    pub fn m_read(&mut self, id: ManipId, r: i32) -> CompileResult<()> {
        match *self.manip(id) {
            ManipKind::Void => Err(self.ierror("Tried to read a void manipulator!")),
            ManipKind::Constant { .. } => self.read_constant(id, r),
            ManipKind::Result { reg } | ManipKind::Register { reg } => {
                self.code_ab(Opcode::Move, r, reg)?;
                Ok(())
            }
            ManipKind::Variable { sym, level, reg } => {
                if level > 0 {
                    self.code_abc(Opcode::GetUVal, r, reg, i32::try_from(level).expect("level fits i32"))?;
                } else {
                    self.check_var_read(sym)?;
                    self.code_ab(Opcode::Move, r, reg)?;
                }
                Ok(())
            }
            ManipKind::StaticVar { index, .. } => {
                self.code_abx(Opcode::GetVar, r, index)?;
                Ok(())
            }
            ManipKind::Argument { level, arg, .. } | ManipKind::OptArg { level, arg, .. } => {
                let optional = matches!(self.manip(id), ManipKind::OptArg { .. });
                let arg = self.arg_index(arg, optional);
                if level > 0 {
                    self.code_abc(Opcode::GetUVArgI, r, arg, i32::try_from(level).expect("level fits i32"))?;
                } else {
                    self.code_ab(Opcode::GetArgI, r, arg)?;
                }
                Ok(())
            }
            ManipKind::TupArg { sym, .. } => {
                let name = self.sym_name(sym);
                Err(self.error(
                    ErrorKind::Type,
                    format!("Tried to read tuple argument array '{name}'! (Can only be indexed.)"),
                ))
            }
            ManipKind::Op { .. } => self.do_operate(id, r, false),
            ManipKind::Cast { .. } => self.do_cast(id, r),
            ManipKind::Index { .. } => self.do_read_index(id, r),
            ManipKind::Args => Err(self.ierror("Tried to read argument list into register!")),
            ManipKind::TupArgs => Err(self.ierror("Tried to read tuple argument list into register!")),
        }
    }

    /// Generates code to push the value of `id` onto the argument stack.
    pub fn m_push(&mut self, id: ManipId) -> CompileResult<()> {
        match *self.manip(id) {
            ManipKind::Void => Err(self.ierror("Tried to push a void manipulator!")),
            ManipKind::Constant { .. } => self.push_constant(id),
            ManipKind::Result { reg } | ManipKind::Register { reg } => {
                self.code_a(Opcode::Push, reg)?;
                Ok(())
            }
            ManipKind::Variable { sym, level, reg } => {
                if level > 0 {
                    self.code_ab(Opcode::PhUVal, reg, i32::try_from(level).expect("level fits i32"))?;
                } else {
                    self.check_var_read(sym)?;
                    self.code_a(Opcode::Push, reg)?;
                }
                Ok(())
            }
            ManipKind::StaticVar { index, .. } => {
                self.code_ax(Opcode::PhVar, index)?;
                Ok(())
            }
            ManipKind::Args => {
                self.code0(Opcode::PhArgs)?;
                Ok(())
            }
            ManipKind::TupArgs => {
                self.code0(Opcode::PushTup)?;
                Ok(())
            }
            _ => {
                // Everything else evaluates into a scratch register and
                // pushes from there; the peephole pass fuses the common
                // shapes (GETARGI+PUSH, BOP+PUSH, ...).
                let r = self.r_alloc(1, RegUse::Temporary)?;
                let r = i32::try_from(r).expect("register index fits i32");
                self.m_read(id, r)?;
                self.code_a(Opcode::Push, r)?;
                self.r_free(usize::try_from(r).expect("non-negative"), 1)?;
                Ok(())
            }
        }
    }

    /// Generates code to write the value in register `r` to `id`.
    pub fn m_write(&mut self, id: ManipId, r: i32) -> CompileResult<()> {
        match *self.manip(id) {
            ManipKind::Variable { sym, level, reg } => {
                if level > 0 {
                    self.code_abc(Opcode::SetUVal, r, reg, i32::try_from(level).expect("level fits i32"))?;
                    return Ok(());
                }
                match self.test_init(sym) {
                    CeState::No => {
                        self.code_ab(Opcode::Init, reg, r)?;
                        self.e_init(sym)?;
                    }
                    CeState::Yes => {
                        self.code_ab(Opcode::Assign, reg, r)?;
                    }
                    CeState::Maybe => {
                        let name = self.sym_name(sym);
                        return Err(self.error(
                            ErrorKind::Init,
                            format!("Variable '{name}' may or may not be initialized at this point!"),
                        ));
                    }
                }
                Ok(())
            }
            ManipKind::StaticVar { index, .. } => {
                self.code_abx(Opcode::SetVar, r, index)?;
                Ok(())
            }
            ManipKind::Argument { level, arg, .. } | ManipKind::OptArg { level, arg, .. } => {
                let optional = matches!(self.manip(id), ManipKind::OptArg { .. });
                let arg = self.arg_index(arg, optional);
                if level > 0 {
                    self.code_abc(Opcode::SetUVArgI, r, arg, i32::try_from(level).expect("level fits i32"))?;
                } else {
                    self.code_ab(Opcode::SetArgI, r, arg)?;
                }
                Ok(())
            }
            ManipKind::Index { .. } => self.do_write_index(id, r),
            ManipKind::TupArg { .. } => {
                Err(self.error(ErrorKind::Type, "Writing tuple arguments not yet implemented!"))
            }
            _ => Err(self.error(ErrorKind::Type, "Cannot write to this expression!")),
        }
    }

    /// Copies the value of `from` into `to`.
    pub fn m_copy(&mut self, from: ManipId, to: ManipId) -> CompileResult<()> {
        if let Some(r) = self.m_direct_read(from) {
            return self.m_write(to, r);
        }
        // A directly writable target takes the value without a scratch
        // register.
        if let Some(r) = self.m_direct_write(to) {
            return self.m_read(from, r);
        }
        let r = self.r_alloc(1, RegUse::Temporary)?;
        let ri = i32::try_from(r).expect("register index fits i32");
        self.m_read(from, ri)?;
        self.m_write(to, ri)?;
        self.r_free(r, 1)
    }

    /// Applies `to = to <op> from`. Plain assignment copies; weak
    /// assignment stores a weak reference and is only legal for targets
    /// that can hold one.
    pub fn m_operate(&mut self, from: ManipId, op: Operator, to: ManipId) -> CompileResult<()> {
        match op {
            Operator::Assign => self.m_copy(from, to),
            Operator::WkAssign => self.m_weak_copy(from, to),
            _ => self.apply_op(from, op, to, false),
        }
    }

    /// Applies `to = to <op> from` through the in-place dispatch path.
    pub fn m_ipoperate(&mut self, from: ManipId, op: Operator, to: ManipId) -> CompileResult<()> {
        match op {
            Operator::Assign => self.m_copy(from, to),
            Operator::WkAssign => self.m_weak_copy(from, to),
            _ => self.apply_op(from, op, to, true),
        }
    }

    /// Weak assignment: the value is converted to a weak reference on
    /// the way into the target.
    fn m_weak_copy(&mut self, from: ManipId, to: ManipId) -> CompileResult<()> {
        if !self.m_can_write_weakref(to) {
            return Err(self.error(
                ErrorKind::Type,
                "Weak assignment target cannot hold a weak reference!",
            ));
        }
        let r = self.r_alloc(1, RegUse::Temporary)?;
        let ri = i32::try_from(r).expect("register index fits i32");
        let res = (|cc: &mut Self| -> CompileResult<()> {
            cc.m_read(from, ri)?;
            cc.code_ab(Opcode::WeakRef, ri, ri)?;
            cc.m_write(to, ri)
        })(self);
        self.r_free(r, 1)?;
        res
    }

    fn apply_op(&mut self, from: ManipId, op: Operator, to: ManipId, inplace: bool) -> CompileResult<()> {
        self.m_ref(to);
        self.m_ref(from);
        let mop = self.m_alloc(ManipKind::Op {
            left: Some(to),
            op,
            right: from,
        });
        let r = self.r_alloc(1, RegUse::Temporary)?;
        let ri = i32::try_from(r).expect("register index fits i32");
        let res = self
            .do_operate(mop, ri, inplace)
            .and_then(|()| self.m_write(to, ri));
        self.r_free(r, 1)?;
        self.m_deref(mop)?;
        res
    }

    /// Fully evaluates `id` for effect, discarding the value. Used to
    /// make sure calls buried in an expression actually happen.
    pub fn m_evaluate(&mut self, id: ManipId) -> CompileResult<()> {
        match self.manip(id) {
            ManipKind::Op { .. } | ManipKind::Cast { .. } | ManipKind::Index { .. } => {
                let r = self.r_alloc(1, RegUse::Temporary)?;
                let ri = i32::try_from(r).expect("register index fits i32");
                self.m_read(id, ri)?;
                self.r_free(r, 1)
            }
            _ => Ok(()),
        }
    }

    // ---- Operator and index emission -------------------------------

    fn do_operate(&mut self, id: ManipId, r: i32, inplace: bool) -> CompileResult<()> {
        let ManipKind::Op { left, op, right } = *self.manip(id) else {
            return Err(self.ierror("do_operate() on a non-operator manipulator!"));
        };
        use Operator as Op;
        match op {
            Op::Power
            | Op::Mod
            | Op::Div
            | Op::Mul
            | Op::Sub
            | Op::Add
            | Op::IpPower
            | Op::IpMod
            | Op::IpDiv
            | Op::IpMul
            | Op::IpSub
            | Op::IpAdd
            | Op::BAnd
            | Op::BOr
            | Op::BXor
            | Op::Shl
            | Op::Shr
            | Op::Rol
            | Op::Ror
            | Op::BRev
            | Op::And
            | Op::Or
            | Op::Xor
            | Op::Eq
            | Op::Ne
            | Op::Gt
            | Op::Ge
            | Op::Lt
            | Op::Le
            | Op::In
            | Op::Min
            | Op::Max => {
                let Some(left) = left else {
                    return Err(self.ierror("Left hand operand to binary operator missing!"));
                };
                let (bop, ipbop) = (Opcode::Bop, Opcode::IpBop);
                let ins = if inplace { ipbop } else { bop };
                let lr = match self.m_direct_read(left) {
                    Some(lr) => lr,
                    None => {
                        self.m_read(left, r)?;
                        r
                    }
                };
                let opc = i32::from(op as u8);
                if let Some(rr) = self.m_direct_read(right) {
                    self.code_abcd(ins, r, lr, opc, rr)?;
                } else if let Some(rv) = self.m_direct_short(right) {
                    let ins = if inplace { Opcode::IpBopI } else { Opcode::BopI };
                    self.code_abcsdx(ins, r, lr, opc, rv)?;
                } else if let ManipKind::StaticVar { index, .. } = *self.manip(right) {
                    let ins = if inplace { Opcode::IpBopS } else { Opcode::BopS };
                    self.code_abcsdx(ins, r, lr, opc, index)?;
                } else {
                    let rr = self.r_alloc(1, RegUse::Temporary)?;
                    let rri = i32::try_from(rr).expect("register index fits i32");
                    self.m_read(right, rri)?;
                    self.code_abcd(ins, r, lr, opc, rri)?;
                    self.r_free(rr, 1)?;
                }
                Ok(())
            }
            Op::Neg
            | Op::Not
            | Op::CastR
            | Op::CastI
            | Op::CastB
            | Op::TypeOf
            | Op::SizeOf
            | Op::Clone
            | Op::BNot => {
                // 'sizeof tuples' counts tuples rather than measuring a
                // value.
                if op == Op::SizeOf && matches!(self.manip(right), ManipKind::TupArg { .. }) {
                    self.code_a(Opcode::TupC, r)?;
                    return Ok(());
                }
                let ins = match op {
                    Op::Neg => Opcode::Neg,
                    Op::Not => Opcode::Not,
                    Op::CastR => Opcode::CastR,
                    Op::CastI => Opcode::CastI,
                    Op::CastB => Opcode::CastB,
                    Op::TypeOf => Opcode::TypeOf,
                    Op::SizeOf => Opcode::SizeOf,
                    Op::Clone => Opcode::Clone,
                    _ => Opcode::BNot,
                };
                let rr = match self.m_direct_read(right) {
                    Some(rr) => rr,
                    None => {
                        self.m_read(right, r)?;
                        r
                    }
                };
                self.code_ab(ins, r, rr)?;
                Ok(())
            }
            Op::Assign | Op::WkAssign => {
                Err(self.ierror("ASSIGN operators are not handled by do_operate()!"))
            }
        }
    }

    fn do_cast(&mut self, id: ManipId, r: i32) -> CompileResult<()> {
        let ManipKind::Cast { object, class } = *self.manip(id) else {
            return Err(self.ierror("do_cast() on a non-cast manipulator!"));
        };
        let dr = match self.m_direct_read(object) {
            Some(dr) => dr,
            None => {
                self.m_read(object, r)?;
                r
            }
        };
        match class {
            ClassId::Real => {
                self.code_ab(Opcode::CastR, r, dr)?;
            }
            ClassId::Integer => {
                self.code_ab(Opcode::CastI, r, dr)?;
            }
            ClassId::Boolean => {
                self.code_ab(Opcode::CastB, r, dr)?;
            }
            _ => {
                let cr = self.r_alloc(1, RegUse::Temporary)?;
                let cri = i32::try_from(cr).expect("register index fits i32");
                let cix = self.add_constant(Value::TypeId(class))?;
                let cix = i32::try_from(cix).map_err(|_| self.error(ErrorKind::Range, "Constant pool overflow!"))?;
                self.code_abx(Opcode::LdC, cri, cix)?;
                self.code_abc(Opcode::Cast, r, dr, cri)?;
                self.r_free(cr, 1)?;
            }
        }
        Ok(())
    }

    fn do_read_index(&mut self, id: ManipId, r: i32) -> CompileResult<()> {
        let ManipKind::Index { object, index } = *self.manip(id) else {
            return Err(self.ierror("do_read_index() on a non-index manipulator!"));
        };
        if let ManipKind::TupArg { level, arg, .. } = *self.manip(object) {
            // Tuple argument member access.
            let level = i32::try_from(level).expect("level fits i32");
            let ir = self.m_direct_read(index);
            let (ir, tmp) = match ir {
                Some(ir) => (ir, None),
                None => {
                    let t = self.r_alloc(1, RegUse::Temporary)?;
                    let ti = i32::try_from(t).expect("register index fits i32");
                    self.m_read(index, ti)?;
                    (ti, Some(t))
                }
            };
            if level > 0 {
                self.code_abcd(Opcode::GetUVTArgI, r, arg, ir, level)?;
            } else {
                self.code_abc(Opcode::GetTArgI, r, arg, ir)?;
            }
            if let Some(t) = tmp {
                self.r_free(t, 1)?;
            }
            return Ok(());
        }

        let or = match self.m_direct_read(object) {
            Some(or) => or,
            None => {
                // Use r as the intermediate for the object.
                self.m_read(object, r)?;
                r
            }
        };
        if let Some(ir) = self.m_direct_read(index) {
            self.code_abc(Opcode::IndGet, r, ir, or)?;
        } else if let Some(iv) = self.m_direct_u8(index) {
            self.code_abc(Opcode::IndGetI, r, iv, or)?;
        } else {
            let ir = self.r_alloc(1, RegUse::Temporary)?;
            let iri = i32::try_from(ir).expect("register index fits i32");
            self.m_read(index, iri)?;
            self.code_abc(Opcode::IndGet, r, iri, or)?;
            self.r_free(ir, 1)?;
        }
        Ok(())
    }

    fn do_write_index(&mut self, id: ManipId, r: i32) -> CompileResult<()> {
        let ManipKind::Index { object, index } = *self.manip(id) else {
            return Err(self.ierror("do_write_index() on a non-index manipulator!"));
        };
        if matches!(self.manip(object), ManipKind::TupArg { .. }) {
            return Err(self.error(ErrorKind::Type, "Writing tuple arguments not yet implemented!"));
        }
        let (or, otmp) = match self.m_direct_read(object) {
            Some(or) => (or, None),
            None => {
                let t = self.r_alloc(1, RegUse::Temporary)?;
                let ti = i32::try_from(t).expect("register index fits i32");
                self.m_read(object, ti)?;
                (ti, Some(t))
            }
        };
        if let Some(ir) = self.m_direct_read(index) {
            self.code_abc(Opcode::IndSet, r, ir, or)?;
        } else if let Some(iv) = self.m_direct_u8(index) {
            self.code_abc(Opcode::IndSetI, r, iv, or)?;
        } else {
            let ir = self.r_alloc(1, RegUse::Temporary)?;
            let iri = i32::try_from(ir).expect("register index fits i32");
            self.m_read(index, iri)?;
            self.code_abc(Opcode::IndSet, r, iri, or)?;
            self.r_free(ir, 1)?;
        }
        if let Some(t) = otmp {
            self.r_free(t, 1)?;
        }
        Ok(())
    }

    /// Whether a weak reference can be stored through this manipulator.
    pub fn m_can_write_weakref(&self, id: ManipId) -> bool {
        matches!(self.manip(id), ManipKind::StaticVar { .. } | ManipKind::Index { .. })
    }

    /// Marks the current function as using upvalues; exported functions
    /// must not.
    pub fn flag_upvalue_use(&mut self) {
        let func = self.cdr().func;
        self.heap.function_mut(func).flags.insert(FnFlags::UPVALUES);
    }
}
