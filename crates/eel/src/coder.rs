//! VM code generation.
//!
//! One [`Coder`] is open per function under construction. It owns the
//! register allocation map and tracks the current peephole fragment; the
//! code, lineinfo and constant vectors live on the function object
//! itself. Emission goes through one per-layout entry point each, which
//! validates ranges, appends lineinfo, and applies the dead-code rules.
//!
//! Emission return convention: branch-class instructions return their
//! position so the parser can patch them later; ordinary instructions
//! return −1 (the optimiser may move them); instructions suppressed by
//! dead-code elimination return the negated position, which makes later
//! patch requests a no-op.

use crate::{
    config::DeadCode,
    diag::{CompileResult, ErrorKind},
    event::CeState,
    heap::{EelBody, FnFlags, Heap, HeapId},
    opcode::{self, Opcode, OperandLayout, Operands},
    operate,
    state::Cc,
    value::Value,
};

/// Use class of a frame register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum RegUse {
    #[default]
    Free,
    Temporary,
    Variable,
}

/// Code generator state for one function.
#[derive(Debug)]
pub(crate) struct Coder {
    /// The function the code goes into.
    pub func: HeapId,
    /// Byte position where the current optimization fragment starts.
    pub fragstart: usize,
    /// Lineinfo index at the fragment start.
    pub fragline: usize,
    /// Peephole optimisation enabled.
    pub peephole: bool,
    /// Set while the optimiser re-emits substitution code, to suppress
    /// fragment bookkeeping and dead-code analysis.
    pub codeonly: bool,
    registers: Vec<RegUse>,
}

impl Coder {
    pub fn open(heap: &Heap, func: HeapId, peephole: bool) -> Self {
        debug_assert!(
            heap.function(func).is_some_and(|f| !f.flags.contains(FnFlags::CFUNC)),
            "coder opened on a non-EEL function"
        );
        Self {
            func,
            fragstart: 0,
            fragline: 0,
            peephole,
            codeonly: false,
            registers: Vec::new(),
        }
    }

    /// Closes the coder. The function keeps its buffers; the register
    /// map dies with the coder.
    pub fn close(self, heap: &mut Heap) {
        let body = heap.function_mut(self.func).eel_mut();
        body.code.shrink_to_fit();
        body.lines.shrink_to_fit();
    }

    #[must_use]
    pub fn reg_use(&self, r: usize) -> RegUse {
        self.registers.get(r).copied().unwrap_or(RegUse::Free)
    }

    fn ensure_regs(&mut self, upto: usize) {
        if upto >= self.registers.len() {
            self.registers.resize(upto + 1, RegUse::Free);
        }
    }

    fn count_variables(&self) -> usize {
        self.registers.iter().filter(|r| **r == RegUse::Variable).count()
    }
}

impl Cc<'_> {
    fn eel_body(&self) -> &EelBody {
        self.heap
            .function(self.cdr().func)
            .expect("coder function disappeared")
            .eel()
    }

    fn body_mut(&mut self) -> &mut EelBody {
        let func = self.cdr().func;
        self.heap.function_mut(func).eel_mut()
    }

    /// Current end of code.
    pub fn code_size(&self) -> usize {
        self.eel_body().code.len()
    }

    // ---- Register allocation ---------------------------------------

    /// Bumps the function frame size to cover registers up to `top`.
    fn grow_frame(&mut self, top: usize) -> CompileResult<()> {
        let Ok(need) = u16::try_from(top + 1) else {
            return Err(self.error(ErrorKind::Range, "Out of registers!"));
        };
        let body = self.body_mut();
        if need >= body.framesize {
            body.framesize = need + 1;
        }
        Ok(())
    }

    /// Updates the clean size: the running maximum number of variable
    /// registers, which the VM clears on frame exit.
    fn check_cleansize(&mut self) {
        let clean = self.cdr().count_variables();
        let clean = u16::try_from(clean).unwrap_or(u16::MAX);
        let body = self.body_mut();
        if clean > body.cleansize {
            body.cleansize = clean;
        }
    }

    /// Allocates the lowest run of `count` contiguous free registers.
    pub fn r_alloc(&mut self, count: usize, reg_use: RegUse) -> CompileResult<usize> {
        let first = {
            let cdr = self.cdr_mut();
            let mut first = 0;
            'search: loop {
                for i in first..first + count {
                    cdr.ensure_regs(i);
                    if cdr.registers[i] != RegUse::Free {
                        first = i + 1;
                        continue 'search;
                    }
                }
                break first;
            }
        };
        self.grow_frame(first + count - 1)?;
        let cdr = self.cdr_mut();
        for i in first..first + count {
            cdr.registers[i] = reg_use;
        }
        self.check_cleansize();
        Ok(first)
    }

    /// Allocates `count` registers directly above the highest one in use.
    pub fn r_alloc_top(&mut self, count: usize, reg_use: RegUse) -> CompileResult<usize> {
        let first = {
            let cdr = self.cdr_mut();
            let first = cdr
                .registers
                .iter()
                .rposition(|r| *r != RegUse::Free)
                .map_or(0, |i| i + 1);
            cdr.ensure_regs(first + count);
            first
        };
        self.grow_frame(first + count - 1)?;
        let cdr = self.cdr_mut();
        for i in first..first + count {
            cdr.registers[i] = reg_use;
        }
        self.check_cleansize();
        Ok(first)
    }

    /// Allocates the specific register `r`; an in-use register is an
    /// internal error.
    pub fn r_alloc_reg(&mut self, r: usize, reg_use: RegUse) -> CompileResult<()> {
        self.cdr_mut().ensure_regs(r);
        if self.cdr().registers[r] != RegUse::Free {
            return Err(self.ierror("Tried to allocate in-use register!"));
        }
        self.grow_frame(r)?;
        self.cdr_mut().registers[r] = reg_use;
        self.check_cleansize();
        Ok(())
    }

    /// Frees `count` registers starting at `first`.
    pub fn r_free(&mut self, first: usize, count: usize) -> CompileResult<()> {
        if count == 0 {
            return Err(self.ierror("Tried to free zero registers!"));
        }
        let cdr = self.cdr_mut();
        cdr.ensure_regs(first + count);
        for i in first..first + count {
            cdr.registers[i] = RegUse::Free;
        }
        Ok(())
    }

    /// Use class of register `r`; asking about a free or unknown register
    /// is an internal error.
    pub fn r_spec(&mut self, r: usize) -> CompileResult<RegUse> {
        match self.cdr().reg_use(r) {
            RegUse::Free => Err(self.ierror("Compiler asked about a free register!")),
            u => Ok(u),
        }
    }

    // ---- Constants and variables -----------------------------------

    /// Adds `value` to the function's constant pool, deduplicating:
    /// primitives by value, objects by identity and then by structural
    /// equality. The pool owns object constants, except functions that
    /// belong to the same module (the module owns those).
    ///
    /// Ownership of `value` transfers to this call in every case.
    pub fn add_constant(&mut self, value: Value) -> CompileResult<usize> {
        let func = self.cdr().func;
        let module = self.heap.function(func).expect("coder function disappeared").module;

        let found = {
            let constants = &self.heap.function(func).expect("coder function disappeared").eel().constants;
            let mut found = None;
            for (i, c) in constants.iter().enumerate() {
                let hit = match (c, &value) {
                    (Value::Nil, Value::Nil) => true,
                    (Value::Real(a), Value::Real(b)) => a == b,
                    (Value::Integer(a), Value::Integer(b)) => a == b,
                    (Value::Boolean(a), Value::Boolean(b)) => a == b,
                    (Value::TypeId(a), Value::TypeId(b)) => a == b,
                    (Value::ObjRef(a) | Value::WeakRef(a), Value::ObjRef(b) | Value::WeakRef(b)) => {
                        a == b || (self.heap.class_of(*a) == self.heap.class_of(*b) && operate::objects_equal(self.heap, *a, *b))
                    }
                    _ => false,
                };
                if hit {
                    found = Some(i);
                    break;
                }
            }
            found
        };
        if let Some(i) = found {
            value.drop_with_heap(self.heap);
            return Ok(i);
        }

        // New entry. The incoming reference is handed to the pool when
        // the pool owns; same-module functions enter as borrows.
        let owned_by_pool = match &value {
            Value::ObjRef(o) => !self
                .heap
                .function(*o)
                .is_some_and(|f| f.module == module),
            _ => true,
        };
        if !owned_by_pool {
            if let Value::ObjRef(o) = &value {
                self.heap.disown(*o);
            }
        }
        let body = self.body_mut();
        body.constants.push(value);
        Ok(body.constants.len() - 1)
    }

    /// Adds a static variable to the module's variable table,
    /// initialized to `value` (or nil). Returns its index.
    pub fn add_variable(&mut self, value: Option<Value>) -> usize {
        let func = self.cdr().func;
        let module = self.heap.function(func).expect("coder function disappeared").module;
        let m = self.heap.module_mut(module);
        m.variables.push(value.unwrap_or(Value::Nil));
        m.variables.len() - 1
    }

    // ---- Emission --------------------------------------------------

    /// Core emitter. Validates the layout and ranges, applies dead-code
    /// elimination, appends lineinfo, and for branch-class instructions
    /// closes the fragment and reports the final position.
    fn emit(&mut self, op: Opcode, operands: Operands, expected: OperandLayout) -> CompileResult<i32> {
        if op.layout() != expected {
            let have: &'static str = op.layout().into();
            let want: &'static str = expected.into();
            return Err(self.ierror(format!(
                "Instruction {} with operand layout {have}; emitted as {want}!",
                op.name()
            )));
        }
        let line = self.line();
        let pos = self.code_size();
        let ipos = i32::try_from(pos).map_err(|_| self.error(ErrorKind::Range, "Code too large!"))?;

        let dead = !self.cdr().codeonly && self.test_exit() == CeState::Yes;
        if dead {
            if self.options.dead_code == DeadCode::IllegalFill {
                let body = self.body_mut();
                body.code.push(Opcode::Illegal as u8);
                body.lines.push(line);
                for _ in 1..op.size() {
                    body.code.push(Opcode::Nop as u8);
                    body.lines.push(line);
                }
            }
            return Ok(-ipos);
        }

        {
            let mut buf = Vec::with_capacity(op.size());
            if let Err(e) = opcode::encode(&mut buf, op, &operands) {
                return Err(self.error(
                    ErrorKind::Range,
                    format!("Operand {} of {} out of range: {}", e.index, op.name(), e.value),
                ));
            }
            let body = self.body_mut();
            body.code.extend_from_slice(&buf);
            body.lines.push(line);
        }

        if self.cdr().codeonly {
            return Ok(ipos);
        }
        if op.is_branch() {
            // The branch ends the fragment; its final position is the new
            // fragment start minus its own size.
            let end = self.code_target()?;
            Ok(end - i32::try_from(op.size()).expect("instruction size fits i32"))
        } else {
            Ok(-1)
        }
    }

    pub fn code0(&mut self, op: Opcode) -> CompileResult<i32> {
        self.emit(op, Operands::default(), OperandLayout::L0)
    }

    pub fn code_a(&mut self, op: Opcode, a: i32) -> CompileResult<i32> {
        self.emit(op, Operands { a, ..Default::default() }, OperandLayout::A)
    }

    pub fn code_ax(&mut self, op: Opcode, a: i32) -> CompileResult<i32> {
        self.emit(op, Operands { a, ..Default::default() }, OperandLayout::Ax)
    }

    pub fn code_sax(&mut self, op: Opcode, a: i32) -> CompileResult<i32> {
        self.emit(op, Operands { a, ..Default::default() }, OperandLayout::SAx)
    }

    pub fn code_ab(&mut self, op: Opcode, a: i32, b: i32) -> CompileResult<i32> {
        self.emit(op, Operands { a, b, ..Default::default() }, OperandLayout::AB)
    }

    pub fn code_abc(&mut self, op: Opcode, a: i32, b: i32, c: i32) -> CompileResult<i32> {
        self.emit(op, Operands { a, b, c, d: 0 }, OperandLayout::ABC)
    }

    pub fn code_abcd(&mut self, op: Opcode, a: i32, b: i32, c: i32, d: i32) -> CompileResult<i32> {
        self.emit(op, Operands { a, b, c, d }, OperandLayout::ABCD)
    }

    pub fn code_abx(&mut self, op: Opcode, a: i32, b: i32) -> CompileResult<i32> {
        self.emit(op, Operands { a, b, ..Default::default() }, OperandLayout::ABx)
    }

    pub fn code_asbx(&mut self, op: Opcode, a: i32, b: i32) -> CompileResult<i32> {
        self.emit(op, Operands { a, b, ..Default::default() }, OperandLayout::ASBx)
    }

    pub fn code_axbx(&mut self, op: Opcode, a: i32, b: i32) -> CompileResult<i32> {
        self.emit(op, Operands { a, b, ..Default::default() }, OperandLayout::AxBx)
    }

    pub fn code_axsbx(&mut self, op: Opcode, a: i32, b: i32) -> CompileResult<i32> {
        self.emit(op, Operands { a, b, ..Default::default() }, OperandLayout::AxSBx)
    }

    pub fn code_abcx(&mut self, op: Opcode, a: i32, b: i32, c: i32) -> CompileResult<i32> {
        self.emit(op, Operands { a, b, c, d: 0 }, OperandLayout::ABCx)
    }

    pub fn code_abscx(&mut self, op: Opcode, a: i32, b: i32, c: i32) -> CompileResult<i32> {
        self.emit(op, Operands { a, b, c, d: 0 }, OperandLayout::ABSCx)
    }

    pub fn code_abxcx(&mut self, op: Opcode, a: i32, b: i32, c: i32) -> CompileResult<i32> {
        self.emit(op, Operands { a, b, c, d: 0 }, OperandLayout::ABxCx)
    }

    pub fn code_abxscx(&mut self, op: Opcode, a: i32, b: i32, c: i32) -> CompileResult<i32> {
        self.emit(op, Operands { a, b, c, d: 0 }, OperandLayout::ABxSCx)
    }

    pub fn code_abcdx(&mut self, op: Opcode, a: i32, b: i32, c: i32, d: i32) -> CompileResult<i32> {
        self.emit(op, Operands { a, b, c, d }, OperandLayout::ABCDx)
    }

    pub fn code_abcsdx(&mut self, op: Opcode, a: i32, b: i32, c: i32, d: i32) -> CompileResult<i32> {
        self.emit(op, Operands { a, b, c, d }, OperandLayout::ABCSDx)
    }

    // ---- Branch patching -------------------------------------------

    /// Patches the jump at `pos` to land at `whereto`. A negative `pos`
    /// (dead or suppressed emission) is silently ignored.
    pub fn set_jump(&mut self, pos: i32, whereto: i32) -> CompileResult<()> {
        if pos < 0 {
            return Ok(());
        }
        let p = usize::try_from(pos).expect("non-negative");
        let Some(op) = self.eel_body().code.get(p).copied().and_then(Opcode::from_repr) else {
            return Err(self.ierror("setjump() position does not hold an instruction!"));
        };
        let Some(field) = op.jump_field() else {
            return Err(self.ierror("Tried to setjump() a non-jump instruction!"));
        };
        let isize = i32::try_from(op.size()).expect("instruction size fits i32");
        let rel = whereto - (pos + isize);
        if !(-32768..=32767).contains(&rel) {
            return Err(self.error(ErrorKind::Range, "Relative jump out of range!"));
        }
        #[expect(clippy::cast_possible_truncation, reason = "range-checked above")]
        let rel16 = rel as i16;
        let bytes = rel16.to_le_bytes();
        let body = self.body_mut();
        body.code[p + field] = bytes[0];
        body.code[p + field + 1] = bytes[1];
        Ok(())
    }

    /// Reads the relative offset of the jump at `pos`.
    pub fn get_jump(&mut self, pos: usize) -> CompileResult<i32> {
        let Some(op) = self.eel_body().code.get(pos).copied().and_then(Opcode::from_repr) else {
            return Err(self.ierror("getjump() position does not hold an instruction!"));
        };
        let Some(field) = op.jump_field() else {
            return Err(self.ierror("Tried to getjump() a non-jump instruction!"));
        };
        let code = &self.eel_body().code;
        let raw = i16::from_le_bytes([code[pos + field], code[pos + field + 1]]);
        Ok(i32::from(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Register and emission behavior is exercised through a minimal
    // harness: a bare function object with an open coder, no parser.
    use crate::{
        config::CompileOptions,
        context::{CtxFlags, CtxKind},
        diag::NoWarnings,
        heap::{EelBody, FnBody, Function},
        symtab::{SymKind, SymTree},
    };

    struct Harness {
        heap: Heap,
        tree: SymTree,
        sink: NoWarnings,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                heap: Heap::new(),
                tree: SymTree::new(),
                sink: NoWarnings,
            }
        }

        fn cc(&mut self) -> Cc<'_> {
            let root = self.tree.add(None, None, SymKind::Namespace);
            let module = self.heap.new_module();
            let fname = self.heap.new_str("test");
            let func = self.heap.alloc(crate::heap::HeapData::Function(Function {
                name: fname,
                module,
                flags: FnFlags::empty(),
                results: 0,
                reqargs: 0,
                optargs: 0,
                tupargs: 0,
                body: FnBody::Eel(EelBody::default()),
            }));
            self.heap.module_mut(module).objects.push(func);
            let mut cc = Cc::new(
                &mut self.heap,
                &mut self.tree,
                root,
                CompileOptions::default(),
                &mut self.sink,
                b"",
                module,
                &[],
            );
            cc.context_push(CtxKind::Function, CtxFlags::empty(), Some("test"))
                .unwrap();
            let coder = Coder::open(cc.heap, func, true);
            cc.coders.push(coder);
            cc
        }
    }

    #[test]
    fn register_allocation_finds_lowest_run() {
        let mut h = Harness::new();
        let mut cc = h.cc();
        assert_eq!(cc.r_alloc(1, RegUse::Variable).unwrap(), 0);
        assert_eq!(cc.r_alloc(2, RegUse::Temporary).unwrap(), 1);
        cc.r_free(1, 1).unwrap();
        // A two-register run cannot use the single free slot at 1.
        assert_eq!(cc.r_alloc(2, RegUse::Temporary).unwrap(), 3);
        assert_eq!(cc.r_alloc(1, RegUse::Temporary).unwrap(), 1);
        let func = cc.cdr().func;
        assert!(cc.heap.function(func).unwrap().eel().framesize >= 5);
    }

    #[test]
    fn alloc_top_goes_above_everything() {
        let mut h = Harness::new();
        let mut cc = h.cc();
        cc.r_alloc(3, RegUse::Variable).unwrap();
        cc.r_free(0, 1).unwrap();
        assert_eq!(cc.r_alloc_top(1, RegUse::Temporary).unwrap(), 3);
    }

    #[test]
    fn cleansize_tracks_variable_registers() {
        let mut h = Harness::new();
        let mut cc = h.cc();
        cc.r_alloc(2, RegUse::Variable).unwrap();
        cc.r_alloc(1, RegUse::Temporary).unwrap();
        let func = cc.cdr().func;
        assert_eq!(cc.heap.function(func).unwrap().eel().cleansize, 2);
    }

    #[test]
    fn emission_appends_lineinfo_per_instruction() {
        let mut h = Harness::new();
        let mut cc = h.cc();
        cc.r_alloc(1, RegUse::Temporary).unwrap();
        assert_eq!(cc.code_asbx(Opcode::LdI, 0, 42).unwrap(), -1);
        assert_eq!(cc.code_a(Opcode::Push, 0).unwrap(), -1);
        let func = cc.cdr().func;
        let body = cc.heap.function(func).unwrap().eel();
        assert_eq!(crate::opcode::count_instructions(&body.code), Some(2));
        assert_eq!(body.lines.len(), 2);
    }

    #[test]
    fn branch_instructions_report_their_position() {
        let mut h = Harness::new();
        let mut cc = h.cc();
        let pos = cc.code_sax(Opcode::Jump, 0).unwrap();
        assert_eq!(pos, 0);
        cc.code0(Opcode::PushNil).unwrap();
        let end = i32::try_from(cc.code_size()).unwrap();
        cc.set_jump(pos, end).unwrap();
        assert_eq!(cc.get_jump(0).unwrap(), end - 3);
    }

    #[test]
    fn jump_out_of_range_is_an_error() {
        let mut h = Harness::new();
        let mut cc = h.cc();
        let pos = cc.code_sax(Opcode::Jump, 0).unwrap();
        assert_eq!(
            cc.set_jump(pos, 40000).unwrap_err().kind,
            ErrorKind::Range
        );
    }

    #[test]
    fn constant_pool_deduplicates() {
        let mut h = Harness::new();
        let mut cc = h.cc();
        assert_eq!(cc.add_constant(Value::Integer(7)).unwrap(), 0);
        assert_eq!(cc.add_constant(Value::Real(1.5)).unwrap(), 1);
        assert_eq!(cc.add_constant(Value::Integer(7)).unwrap(), 0);
        // Strings dedup by identity (interning) and by content.
        let s1 = cc.heap.new_str("hi");
        assert_eq!(cc.add_constant(Value::ObjRef(s1)).unwrap(), 2);
        let s2 = cc.heap.new_str("hi");
        assert_eq!(cc.add_constant(Value::ObjRef(s2)).unwrap(), 2);
        // Integer vs real constants stay distinct.
        assert_eq!(cc.add_constant(Value::Integer(1)).unwrap(), 3);
        assert_eq!(cc.add_constant(Value::Real(1.0)).unwrap(), 4);
    }

    #[test]
    fn dead_code_is_suppressed_after_exit() {
        let mut h = Harness::new();
        let mut cc = h.cc();
        cc.code0(Opcode::Return).unwrap();
        cc.e_return();
        let pos = cc.code0(Opcode::PushNil).unwrap();
        assert!(pos <= 0);
        let func = cc.cdr().func;
        let body = cc.heap.function(func).unwrap().eel();
        // Only the RETURN made it into the code.
        assert_eq!(body.code, vec![Opcode::Return as u8]);
    }

    #[test]
    fn dead_code_illegal_fill_mode() {
        let mut h = Harness::new();
        let mut cc = h.cc();
        cc.options.dead_code = DeadCode::IllegalFill;
        cc.code0(Opcode::Return).unwrap();
        cc.e_return();
        cc.code_ab(Opcode::Move, 1, 0).unwrap();
        let func = cc.cdr().func;
        let body = cc.heap.function(func).unwrap().eel();
        assert_eq!(
            body.code,
            vec![Opcode::Return as u8, Opcode::Illegal as u8, Opcode::Nop as u8, Opcode::Nop as u8]
        );
        assert_eq!(body.lines.len(), 4);
    }
}
