//! Peephole optimisation.
//!
//! Runs over closed code fragments: the parser marks a fragment boundary
//! at every branch target and after every branch-class instruction, so a
//! fragment can never be jumped into. Within a fragment, windows of one
//! or two instructions are rewritten into smaller equivalents until
//! nothing more matches.
//!
//! A substitution works in three steps to stay simple and robust: the
//! replacement is emitted at the end of the code buffer (with fragment
//! bookkeeping suppressed), the byte and instruction count differences
//! are removed at the substitution point, and the replacement is moved
//! into place. The lineinfo table stays parallel throughout: replacement
//! instructions inherit the line numbers of the instructions they
//! replace.

use crate::{
    diag::CompileResult,
    opcode::{Opcode, decode},
    operate::Operator,
    state::Cc,
};

impl Cc<'_> {
    /// Closes the current fragment: optimises it, then makes the current
    /// position the start of a new fragment. Returns the position, which
    /// is what branch targets are made of.
    pub fn code_target(&mut self) -> CompileResult<i32> {
        if self.cdr().peephole && self.options.peephole {
            loop {
                let mut changed = false;
                let mut pc = self.cdr().fragstart;
                while pc < self.code_size() {
                    self.cdr_mut().codeonly = true;
                    let subst = self.peephole_subst(pc);
                    self.cdr_mut().codeonly = false;
                    changed |= subst?;
                    let code = self.function_code();
                    match code.get(pc).copied().and_then(Opcode::from_repr) {
                        Some(op) => pc += op.size(),
                        None => break,
                    }
                }
                if !changed {
                    break;
                }
            }
        }
        let size = self.code_size();
        self.cdr_mut().fragstart = size;
        let nlines = self.function_lines_len();
        self.cdr_mut().fragline = nlines;
        Ok(i32::try_from(size).expect("code size fits i32"))
    }

    fn function_code(&self) -> &[u8] {
        &self
            .heap
            .function(self.cdr().func)
            .expect("coder function disappeared")
            .eel()
            .code
    }

    fn function_lines_len(&self) -> usize {
        self.heap
            .function(self.cdr().func)
            .expect("coder function disappeared")
            .eel()
            .lines
            .len()
    }

    /// Attempts one substitution at `pc`. Returns whether code changed.
    fn peephole_subst(&mut self, pc: usize) -> CompileResult<bool> {
        use Opcode as O;
        let code = self.function_code();
        let Some((op1, i1, size1)) = decode(code, pc) else {
            return Ok(false);
        };
        let pc2 = pc + size1;
        if pc2 >= code.len() {
            return Ok(false);
        }
        let Some((op2, i2, size2)) = decode(code, pc2) else {
            return Ok(false);
        };

        let old_end = self.code_size();
        let old_nlines = self.function_lines_len();
        let mut icount_in = 2;
        let mut old_len = size1 + size2;

        match (op1, op2) {
            (O::Push, O::Push) => {
                self.code_ab(O::Push2, i1.a, i2.a)?;
            }
            (O::Push2, O::Push) => {
                self.code_abc(O::Push3, i1.a, i1.b, i2.a)?;
            }
            (O::Push2, O::Push2) => {
                self.code_abcd(O::Push4, i1.a, i1.b, i2.a, i2.b)?;
            }
            (O::PushC, O::PushC) => {
                self.code_axbx(O::PushC2, i1.a, i2.a)?;
            }
            (O::PushC, O::PushI) => {
                self.code_axsbx(O::PushCI, i1.a, i2.a)?;
            }
            (O::PushI, O::PushC) => {
                self.code_axsbx(O::PushIC, i2.a, i1.a)?;
            }
            (O::Not, O::JumpZ) => {
                if i1.a != i2.a {
                    return Ok(false);
                }
                self.code_asbx(O::JumpNZ, i1.b, 0)?;
            }
            (O::Not, O::JumpNZ) => {
                if i1.a != i2.a {
                    return Ok(false);
                }
                self.code_asbx(O::JumpZ, i1.b, 0)?;
            }
            (O::LdI, O::Init) => {
                if i1.a != i2.b {
                    return Ok(false);
                }
                self.code_asbx(O::InitI, i2.a, i1.b)?;
            }
            (O::LdI, O::Assign) => {
                if i1.a != i2.b {
                    return Ok(false);
                }
                self.code_asbx(O::AssignI, i2.a, i1.b)?;
            }
            (O::LdNil, O::Init) => {
                if i1.a != i2.b {
                    return Ok(false);
                }
                self.code_a(O::InitNil, i2.a)?;
            }
            (O::LdNil, O::Assign) => {
                if i1.a != i2.b {
                    return Ok(false);
                }
                self.code_a(O::AsnNil, i2.a)?;
            }
            (O::LdC, O::Init) => {
                if i1.a != i2.b {
                    return Ok(false);
                }
                self.code_abx(O::InitC, i2.a, i1.b)?;
            }
            (O::LdC, O::Assign) => {
                if i1.a != i2.b {
                    return Ok(false);
                }
                self.code_abx(O::AssignC, i2.a, i1.b)?;
            }
            (O::GetArgI, O::Push) => {
                if i1.a != i2.a {
                    return Ok(false);
                }
                self.code_a(O::PhArgI, i1.b)?;
            }
            (O::PhArgI, O::PhArgI) => {
                self.code_ab(O::PhArgI2, i1.a, i2.a)?;
            }
            (O::Bop, O::Push) => {
                if i1.a != i2.a {
                    return Ok(false);
                }
                self.code_abc(O::PhBop, i1.b, i1.c, i1.d)?;
            }
            (O::BopI, O::Push) => {
                if i1.a != i2.a {
                    return Ok(false);
                }
                self.code_abscx(O::PhBopI, i1.b, i1.c, i1.d)?;
            }
            (O::LdC, O::IndGet) => {
                if i1.a != i2.b {
                    return Ok(false);
                }
                self.code_abcx(O::IndGetC, i2.a, i2.c, i1.b)?;
            }
            (O::LdC, O::IndSet) => {
                if i1.a != i2.b {
                    return Ok(false);
                }
                self.code_abcx(O::IndSetC, i2.a, i2.c, i1.b)?;
            }
            (O::LdC, O::Bop) => {
                if i1.a != i2.d {
                    return Ok(false);
                }
                self.code_abcdx(O::BopC, i2.a, i2.b, i2.c, i1.b)?;
            }
            _ => {
                // Single instruction substitutions
                icount_in = 1;
                old_len = size1;
                match op1 {
                    O::Bop => {
                        let Some(ded) = dedicated_arith(i1.c) else {
                            return Ok(false);
                        };
                        self.code_abc(ded, i1.a, i1.b, i1.d)?;
                    }
                    O::PhBop => {
                        let Some(ded) = dedicated_push_arith(i1.b) else {
                            return Ok(false);
                        };
                        self.code_ab(ded, i1.a, i1.c)?;
                    }
                    _ => return Ok(false),
                }
            }
        }

        self.splice_substitution(pc, old_end, old_nlines, old_len, icount_in);
        Ok(true)
    }

    /// Moves replacement code emitted at the end of the buffer into the
    /// substitution window, compacting code and lineinfo.
    fn splice_substitution(&mut self, pc: usize, old_end: usize, old_nlines: usize, old_len: usize, icount_in: usize) {
        let new_len = self.code_size() - old_end;
        let diff = old_len - new_len;
        let icount_out = self.function_lines_len() - old_nlines;
        let icdiff = icount_in - icount_out;
        debug_assert!(new_len <= old_len, "peephole substitution grew the code");
        debug_assert!(icount_out <= icount_in, "peephole substitution grew the instruction count");

        // Lineinfo index of the instruction at pc.
        let line_ix = {
            let code = self.function_code();
            let mut ix = self.cdr().fragline;
            let mut p = self.cdr().fragstart;
            while p < pc {
                let op = Opcode::from_repr(code[p]).expect("fragment decodes cleanly");
                p += op.size();
                ix += 1;
            }
            ix
        };

        let func = self.cdr().func;
        let body = self.heap.function_mut(func).eel_mut();
        // The replaced instructions' leading line entries become the
        // replacement's lineinfo; the entries appended during emission
        // and the excess replaced entries go away.
        body.lines.drain(line_ix..line_ix + icdiff);
        body.lines.truncate(old_nlines - icdiff);
        // Close the byte gap, then move the replacement into place.
        body.code.drain(pc..pc + diff);
        let staged = old_end - diff;
        body.code.copy_within(staged.., pc);
        body.code.truncate(staged);
    }
}

fn dedicated_arith(op: i32) -> Option<Opcode> {
    match u8::try_from(op).ok().and_then(Operator::from_repr)? {
        Operator::Add => Some(Opcode::Add),
        Operator::Sub => Some(Opcode::Sub),
        Operator::Mul => Some(Opcode::Mul),
        Operator::Div => Some(Opcode::Div),
        Operator::Mod => Some(Opcode::Mod),
        Operator::Power => Some(Opcode::Power),
        _ => None,
    }
}

fn dedicated_push_arith(op: i32) -> Option<Opcode> {
    match u8::try_from(op).ok().and_then(Operator::from_repr)? {
        Operator::Add => Some(Opcode::PhAdd),
        Operator::Sub => Some(Opcode::PhSub),
        Operator::Mul => Some(Opcode::PhMul),
        Operator::Div => Some(Opcode::PhDiv),
        Operator::Mod => Some(Opcode::PhMod),
        Operator::Power => Some(Opcode::PhPower),
        _ => None,
    }
}
