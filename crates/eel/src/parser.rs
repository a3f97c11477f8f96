//! The parser.
//!
//! Recursive descent over the statement and expression grammar, emitting
//! VM code directly through the manipulator layer; no AST is built. Each
//! rule function checks the current token, returns [`Rule::Wrong`] with
//! the lexer state restored when it does not apply, and otherwise leaves
//! the token stream positioned after what it consumed.
//!
//! The module pipeline lives at the bottom: a module context, the
//! `__init_module` root function, the statement block, and finally the
//! export table and the check for unfulfilled forward declarations.

use crate::{
    coder::{Coder, RegUse},
    context::{CodeMark, Creator, CtxFlags, CtxKind},
    diag::{CompileResult, ErrorKind},
    event::CeState,
    heap::{EelBody, FnBody, FnFlags, Function, HeapData, HeapId},
    lexer::{Keyword, LexFlags, Lval, Qualifiers, Token},
    manip::{ManipId, ManipKind, MList},
    opcode::Opcode,
    operate::Operator,
    state::{Cc, Rule},
    symtab::{FindFlags, Finder, SymKind, SymKinds, SymPayload, SymbolId, VarKind},
    value::{ClassId, Value},
};

/// Pre-0.3.7 priority of the cast operation, still used for the
/// precedence-change warning.
const CAST_PRIORITY: i32 = 100;

/// Priority offset that marks "flat" (post-0.3.7) evaluation; the old
/// priority survives underneath it for the compatibility warning.
const FLAT: i32 = 1000;

impl Cc<'_> {
    fn lex0(&mut self) -> CompileResult<Token> {
        self.lex(LexFlags::empty())
    }

    /// Consumes the expected punctuation byte or fails with `msg` (or a
    /// default message).
    fn expect_char(&mut self, ch: u8, msg: Option<&str>) -> CompileResult<()> {
        if self.token != Token::Punct(ch) {
            let message = match msg {
                Some(m) => m.to_string(),
                None => format!("Expected '{}'.", char::from(ch)),
            };
            return Err(self.error(ErrorKind::Syntax, message));
        }
        self.lex0()?;
        Ok(())
    }

    fn check_argc(&mut self, ml: &MList, min: usize, max: usize) -> CompileResult<()> {
        if ml.len() < min {
            return Err(self.error(ErrorKind::Arity, "Too few values in expression list!"));
        }
        if ml.len() > max {
            return Err(self.error(ErrorKind::Arity, "Too many values in expression list!"));
        }
        Ok(())
    }

    /// The symbol attached to the current token, for the symbol tokens.
    fn token_symbol(&mut self) -> CompileResult<SymbolId> {
        self.lval
            .symbol()
            .ok_or_else(|| self.ierror("Symbol token without a symbol value!"))
    }

    fn current_function(&self) -> &Function {
        self.heap.function(self.cdr().func).expect("coder function disappeared")
    }

    /// Class id of a class symbol.
    fn class_of_symbol(&self, sym: SymbolId) -> Option<ClassId> {
        let obj = self.tree.get(sym).object()?;
        match self.heap.get(obj) {
            HeapData::ClassDef(cd) => Some(cd.class),
            _ => None,
        }
    }

    // ---- Leave/break/continue plumbing -----------------------------

    /// Emits code to prepare to leave the context at stack index `idx`:
    /// clears this scope's variable registers unless its initializations
    /// persist.
    fn code_leave_context(&mut self, idx: usize) -> CompileResult<()> {
        if self.keep_variables(idx) {
            return Ok(());
        }
        let here = self.initializations_at(idx)?;
        let parent = if idx > 0 { self.initializations_at(idx - 1)? } else { 0 };
        if here > parent {
            let n = i32::try_from(parent).expect("register count fits i32");
            self.code_a(Opcode::Clean, n)?;
        }
        Ok(())
    }

    /// `break` out of the context at `target` (or the nearest breakable).
    fn code_break(&mut self, target: Option<usize>) -> CompileResult<()> {
        let Some(target) = target.or_else(|| self.find_context_flags(CtxFlags::BREAKABLE)) else {
            return Err(self.error(ErrorKind::Scope, "'break' outside breakable context!"));
        };
        let xs = self.test_exit().not();
        if xs == CeState::No && self.options.dead_code == crate::config::DeadCode::Suppress {
            return Ok(());
        }
        self.code_leave_context(target)?;
        let pos = self.code_sax(Opcode::Jump, 0)?;
        self.contexts[target].end_jumps.push(CodeMark { pos, xstate: xs });
        self.e_break(target);
        Ok(())
    }

    /// `repeat`: jump straight back to the start of the context at
    /// `target`, bypassing any loop test.
    fn code_repeat(&mut self, target: usize) -> CompileResult<()> {
        self.code_leave_context(target)?;
        let pos = self.code_sax(Opcode::Jump, 0)?;
        let startpos = self.contexts[target].startpos;
        self.set_jump(pos, startpos)?;
        self.e_break(target);
        Ok(())
    }

    /// `continue`: jump to the loop test of the context at `target`.
    fn code_next(&mut self, target: usize) -> CompileResult<()> {
        let xs = self.test_exit().not();
        if xs == CeState::No && self.options.dead_code == crate::config::DeadCode::Suppress {
            return Ok(());
        }
        self.code_leave_context(target)?;
        let pos = self.code_sax(Opcode::Jump, 0)?;
        self.contexts[target].cont_jumps.push(CodeMark { pos, xstate: xs });
        self.e_break(target);
        Ok(())
    }

    /// Patches pending continue jumps of the current context to land
    /// here.
    fn code_fixup_continuations(&mut self) -> CompileResult<()> {
        let pos = self.code_target()?;
        let marks = std::mem::take(&mut self.ctx_mut().cont_jumps);
        for cm in marks {
            self.set_jump(cm.pos, pos)?;
            self.e_target(cm.xstate);
        }
        Ok(())
    }

    /// Patches pending break jumps of the current context to land here.
    fn code_fixup_breaks(&mut self) -> CompileResult<()> {
        let pos = self.code_target()?;
        let marks = std::mem::take(&mut self.ctx_mut().end_jumps);
        for cm in marks {
            self.set_jump(cm.pos, pos)?;
            self.e_target(cm.xstate);
        }
        Ok(())
    }

    /// Moves pending break jumps up to the parent context (case bodies
    /// break out of the whole switch).
    fn code_move_breaks_up(&mut self) {
        let marks = std::mem::take(&mut self.ctx_mut().end_jumps);
        let parent = self.contexts.len() - 2;
        self.contexts[parent].end_jumps.extend(marks);
    }

    /// Emits the implicit return at the end of a function body.
    fn procreturn(&mut self) -> CompileResult<()> {
        let flags = self.current_function().flags;
        if flags.contains(FnFlags::RESULTS) && self.test_result() != CeState::Yes {
            return Err(self.error(
                ErrorKind::Init,
                "Control reaches end of function that should return a value!",
            ));
        }
        self.code0(Opcode::Return)?;
        self.e_return();
        Ok(())
    }

    // ---- Qualifiers ------------------------------------------------

    fn parse_qualifiers(&mut self) -> CompileResult<Qualifiers> {
        let mut result = Qualifiers::empty();
        loop {
            let q = match self.token {
                Token::Kw(Keyword::Local) => Qualifiers::LOCAL,
                Token::Kw(Keyword::Static) => Qualifiers::STATIC,
                Token::Kw(Keyword::Upvalue) => Qualifiers::UPVALUE,
                Token::Kw(Keyword::Export) => Qualifiers::EXPORT,
                Token::Kw(Keyword::Shadow) => Qualifiers::SHADOW,
                _ => return Ok(result),
            };
            if result.contains(q) {
                return Err(self.error(ErrorKind::Syntax, "Qualifier specified more than once!"));
            }
            result |= q;
            self.lex0()?;
        }
    }

    fn q_allow_only(&mut self, mask: Qualifiers, what: &str) -> CompileResult<()> {
        let stray = self.qualifiers & !mask;
        for (flag, name) in [
            (Qualifiers::LOCAL, "local"),
            (Qualifiers::STATIC, "static"),
            (Qualifiers::UPVALUE, "upvalue"),
            (Qualifiers::EXPORT, "export"),
            (Qualifiers::SHADOW, "shadow"),
        ] {
            if stray.contains(flag) {
                return Err(self.error(ErrorKind::Syntax, format!("Cannot use qualifier '{name}' {what}!")));
            }
        }
        Ok(())
    }

    fn no_qualifiers(&mut self) -> CompileResult<()> {
        if !self.qualifiers.is_empty() {
            return Err(self.error(ErrorKind::Syntax, "No qualifiers allowed in this context!"));
        }
        Ok(())
    }

    fn qualifiers_handled(&mut self, mask: Qualifiers) -> CompileResult<()> {
        self.qualifiers &= !mask;
        if !self.qualifiers.is_empty() {
            return Err(self.error(ErrorKind::Syntax, "Qualifier not allowed in this context!"));
        }
        Ok(())
    }

    // ---- Declarations ----------------------------------------------

    /// Declares a variable of `kind` in the current scope, allocating its
    /// storage.
    fn declare_var(&mut self, name: &[u8], kind: VarKind) -> CompileResult<SymbolId> {
        let nid = self.heap.new_string(name);
        let scope = self.symtab();
        let s = self.tree.add(Some(scope), Some(nid), SymKind::Variable);
        let location = match kind {
            VarKind::Stack => i32::try_from(self.r_alloc(1, RegUse::Variable)?).expect("register fits i32"),
            VarKind::Static => i32::try_from(self.add_variable(None)).expect("variable index fits i32"),
            // Argument indices are assigned when the signature closes.
            VarKind::Argument | VarKind::OptArg | VarKind::TupArg => -1,
        };
        self.tree.get_mut(s).payload = SymPayload::Var { kind, location };
        Ok(s)
    }

    /// Declares an explicit upvalue shadow of `var` in the current scope.
    fn declare_upvalue(&mut self, var: SymbolId) -> CompileResult<SymbolId> {
        let (kind, location) = self.tree.get(var).var();
        let uv_level = self.tree.get(var).uv_level;
        let name = self.tree.get(var).name.expect("variables are named");
        self.heap.own(name);
        let scope = self.symtab();
        let s = self.tree.add(Some(scope), Some(name), SymKind::Upvalue);
        let sym = self.tree.get_mut(s);
        sym.payload = SymPayload::Var { kind, location };
        sym.uv_level = uv_level;
        Ok(s)
    }

    /// Adds a variable reference manipulator for `sym`, handling upvalue
    /// distance and legality.
    fn do_getvar(&mut self, sym: SymbolId, al: &mut MList) -> CompileResult<()> {
        let scope_level = self.tree.get(self.symtab()).uv_level;
        let sym_level = self.tree.get(sym).uv_level;
        let level = scope_level - sym_level;
        let (kind, _) = self.tree.get(sym).var();
        let mut uv = level != 0;
        match kind {
            VarKind::Stack => {
                self.m_variable(al, sym, level);
            }
            VarKind::Static => {
                self.m_statvar(al, sym);
                uv = false;
            }
            VarKind::Argument => {
                self.m_argument(al, sym, level);
            }
            VarKind::OptArg => {
                self.m_optarg(al, sym, level);
            }
            VarKind::TupArg => {
                self.m_tuparg(al, sym, level);
            }
        }
        if uv {
            let is_xblock = self.current_function().flags.contains(FnFlags::XBLOCK);
            self.flag_upvalue_use();
            if self.tree.get(sym).kind == SymKind::Variable && !is_xblock {
                let name = self.sym_name(sym);
                return Err(self.error(ErrorKind::Scope, format!("Implicit upvalue '{name}'.")));
            }
        }
        Ok(())
    }

    /// Turns the current (function) context into a function: creates or
    /// reuses the function object, opens a coder for it, and names the
    /// scope.
    fn declare_func(
        &mut self,
        name: &str,
        al: Option<&mut MList>,
        decl: Option<SymbolId>,
        fflags: FnFlags,
        symname: Option<&str>,
    ) -> CompileResult<HeapId> {
        let pflags = self
            .coders
            .last()
            .and_then(|c| self.heap.function(c.func))
            .map_or(FnFlags::empty(), |f| f.flags);

        let fo = match decl {
            Some(ds) => {
                let fo = self.tree.get(ds).object().expect("declaration symbol has a function");
                self.heap.own(fo);
                fo
            }
            None => {
                let nid = self.heap.new_str(name);
                let fo = self.heap.alloc(HeapData::Function(Function {
                    name: nid,
                    module: self.module,
                    flags: FnFlags::empty(),
                    results: 0,
                    reqargs: 0,
                    optargs: 0,
                    tupargs: 0,
                    body: FnBody::Eel(EelBody::default()),
                }));
                // The module owns every object created while compiling it.
                self.heap.own(fo);
                self.heap.module_mut(self.module).objects.push(fo);
                fo
            }
        };

        let mut flags = fflags;
        if self.qualifiers.contains(Qualifiers::EXPORT) {
            flags |= FnFlags::EXPORT;
        }
        // An xblock returns through its enclosing function, so it
        // inherits the RESULTS contract.
        if fflags.contains(FnFlags::XBLOCK) {
            flags |= pflags & FnFlags::RESULTS;
        }
        self.heap.function_mut(fo).flags = flags;

        let peephole = self.options.peephole;
        let coder = Coder::open(self.heap, fo, peephole);
        self.coders.push(coder);
        self.ctx_mut().flags |= CtxFlags::OWNS_CODER;
        self.ctx_mut().startpos = 0;

        // The scope symbol becomes the function symbol.
        let st = self.symtab();
        self.heap.own(fo);
        let old = std::mem::replace(&mut self.tree.get_mut(st).payload, SymPayload::Object(fo));
        if let SymPayload::Object(o) = old {
            self.heap.disown(o);
        }
        if decl.is_none() {
            let sname = symname.unwrap_or(name);
            let snid = self.heap.new_str(sname);
            self.tree.rename(self.heap, st, snid);
            let fnid = self.heap.new_str(name);
            let f = self.heap.function_mut(fo);
            let old_name = std::mem::replace(&mut f.name, fnid);
            self.heap.disown(old_name);
        }

        if let Some(al) = al {
            self.heap.own(fo);
            self.m_object(al, fo);
        }
        Ok(fo)
    }

    /// Scans the function scope for declared arguments and builds the
    /// call contract from them.
    fn declare_func_args(&mut self, has_result: bool) -> CompileResult<()> {
        let st = self.symtab();
        let mut reqargs: u8 = 0;
        let mut optargs: u8 = 0;
        let mut tupargs: u8 = 0;
        let children: Vec<SymbolId> = self.tree.get(st).children.clone();
        for s in children {
            if self.tree.get(s).kind != SymKind::Variable {
                continue;
            }
            let (kind, _) = self.tree.get(s).var();
            let slot = match kind {
                VarKind::Stack | VarKind::Static => continue,
                VarKind::Argument => {
                    reqargs += 1;
                    reqargs - 1
                }
                VarKind::OptArg => {
                    optargs += 1;
                    optargs - 1
                }
                VarKind::TupArg => {
                    tupargs += 1;
                    tupargs - 1
                }
            };
            if let SymPayload::Var { location, .. } = &mut self.tree.get_mut(s).payload {
                *location = i32::from(slot);
            }
        }
        let func = self.cdr().func;
        let f = self.heap.function_mut(func);
        f.results = u8::from(has_result);
        f.reqargs = reqargs;
        f.optargs = optargs;
        f.tupargs = tupargs;
        if has_result {
            f.flags |= FnFlags::RESULTS;
        }
        if reqargs > 0 || optargs > 0 || tupargs > 0 {
            f.flags |= FnFlags::ARGS;
        }
        Ok(())
    }

    // ---- Expression lists ------------------------------------------

    /// `explist: expression | expression ',' explist`
    fn explist(&mut self, al: &mut MList, wantresult: bool) -> CompileResult<Rule> {
        let mut sal = self.ml_open();
        let mut first = true;
        let res = loop {
            match self.expression(&mut sal, wantresult)? {
                Rule::Wrong => {
                    break if first { Rule::Wrong } else { Rule::Matched };
                }
                Rule::Void => {
                    if first && self.token != Token::Punct(b',') {
                        break Rule::Void;
                    }
                    let e = self.error(ErrorKind::Syntax, "Void expression in expression list!");
                    self.ml_close(sal)?;
                    return Err(e);
                }
                _ => {}
            }
            first = false;
            if self.token != Token::Punct(b',') {
                break Rule::Matched;
            }
            self.lex0()?;
        };
        self.ml_transfer(&mut sal, al);
        self.ml_close(sal)?;
        Ok(res)
    }

    // ---- Calls -----------------------------------------------------

    /// Compiles an argument list and a call through a function
    /// reference; used for indirect and member calls. For member calls,
    /// `self_args` already holds the receiver as the first argument.
    fn call_member(
        &mut self,
        fnref: ManipId,
        self_args: Option<MList>,
        al: &mut MList,
        mut wantresult: bool,
    ) -> CompileResult<Rule> {
        let mut args = self.ml_open();
        if let Some(mut sl) = self_args {
            self.ml_transfer(&mut sl, &mut args);
            self.ml_close(sl)?;
        }
        match self.explist(&mut args, true)? {
            Rule::Wrong => {
                if self.token != Token::Punct(b')') {
                    let e = self.error(ErrorKind::Syntax, "Expected argument list!");
                    self.ml_close(args)?;
                    return Err(e);
                }
            }
            Rule::Void => {
                let e = self.error(ErrorKind::Syntax, "Argument generates no value!");
                self.ml_close(args)?;
                return Err(e);
            }
            _ => {}
        }
        self.expect_char(b')', Some("Expected ')' after call arguments!"))?;

        // An "ignore result" call that is just the first simplexp of
        // something bigger still needs its result.
        if matches!(self.token, Token::Punct(b'[' | b'.' | b':')) {
            wantresult = true;
        }

        let r = if wantresult {
            self.m_result(al)?
        } else {
            i32::try_from(self.r_alloc(1, RegUse::Temporary)?).expect("register fits i32")
        };
        // The result register doubles as the funcref register.
        self.m_read(fnref, r)?;
        self.ml_push(&args)?;
        if wantresult {
            self.code_ab(Opcode::CallR, r, r)?;
        } else {
            self.code_a(Opcode::Call, r)?;
            self.r_free(usize::try_from(r).expect("non-negative"), 1)?;
        }
        self.ml_close(args)?;
        Ok(Rule::Matched)
    }

    /// `call: FUNCTION | FUNCTION '(' [explist] ')'`
    fn call(&mut self, al: &mut MList) -> CompileResult<Rule> {
        if self.token != Token::SymFunction {
            return Ok(Rule::Wrong);
        }
        let s = self.token_symbol()?;
        let fo = self.tree.get(s).object().expect("function symbol has an object");
        let Some(f) = self.heap.function(fo) else {
            return Err(self.ierror("Function symbol has an object that is not a function!"));
        };
        let (reqargs, optargs, tupargs, results, fflags, fn_uvlevel) = (
            usize::from(f.reqargs),
            usize::from(f.optargs),
            usize::from(f.tupargs),
            f.results,
            f.flags,
            self.tree.get(s).uv_level,
        );
        self.heap.own(fo);
        let fnconst = self.add_constant(Value::ObjRef(fo))?;
        let fnconst = i32::try_from(fnconst).map_err(|_| self.error(ErrorKind::Range, "Constant pool overflow!"))?;
        self.lex0()?;
        self.no_qualifiers()?;

        if self.token != Token::Punct(b'(') {
            // Reference to the function, not a call.
            self.heap.own(fo);
            self.m_constant(al, Value::ObjRef(fo));
            return Ok(Rule::Matched);
        }
        self.lex0()?;

        let mut args = self.ml_open();
        match self.explist(&mut args, true)? {
            Rule::Wrong => {
                if self.token != Token::Punct(b')') {
                    let e = self.error(ErrorKind::Syntax, "Expected argument list!");
                    self.ml_close(args)?;
                    return Err(e);
                }
            }
            Rule::Void => {
                let e = self.error(ErrorKind::Syntax, "Argument generates no value!");
                self.ml_close(args)?;
                return Err(e);
            }
            _ => {}
        }

        // Check the argument count against the call contract.
        let name = self.sym_name(s);
        if args.len() < reqargs {
            let e = self.error(ErrorKind::Arity, format!("Too few arguments to function '{name}'!"));
            self.ml_close(args)?;
            return Err(e);
        }
        if tupargs > 0 {
            if (args.len() - reqargs) % tupargs != 0 {
                let e = self.error(
                    ErrorKind::Arity,
                    format!("Incorrect number of arguments to function '{name}'! (Incomplete tuple.)"),
                );
                self.ml_close(args)?;
                return Err(e);
            }
        } else if (optargs != 255 && args.len() > reqargs + optargs) || (optargs == 0 && args.len() > reqargs) {
            let e = self.error(ErrorKind::Arity, format!("Too many arguments to function '{name}'!"));
            self.ml_close(args)?;
            return Err(e);
        }

        let result = if results > 0 { Some(self.m_result(al)?) } else { None };
        self.ml_push(&args)?;

        let uvlevel = if fflags.contains(FnFlags::UPVALUES) {
            let cur = self.tree.get(self.symtab()).uv_level;
            i32::try_from(cur - fn_uvlevel + 1).expect("level fits i32")
        } else {
            0
        };
        match result {
            Some(r) => {
                self.code_abcx(Opcode::CCallR, uvlevel, r, fnconst)?;
            }
            None => {
                self.code_abx(Opcode::CCall, uvlevel, fnconst)?;
            }
        }
        self.ml_close(args)?;

        if self.token != Token::Punct(b')') {
            return Err(self.error(
                ErrorKind::Syntax,
                "Expected ')' after arguments, or ',' followed by more arguments!",
            ));
        }
        self.lex0()?;
        Ok(if result.is_some() { Rule::Matched } else { Rule::Void })
    }

    // ---- Function definitions --------------------------------------

    /// `argdeflist: NAME (',' NAME)*` for one argument kind.
    fn argdeflist(&mut self, kind: VarKind) -> CompileResult<Rule> {
        let mut first = true;
        loop {
            match &self.token {
                Token::Name => {
                    let name = match std::mem::take(&mut self.lval) {
                        Lval::Str(s) => s,
                        _ => return Err(self.ierror("Name token without name bytes!")),
                    };
                    self.declare_var(&name, kind)?;
                    self.lex(LexFlags::LOCALS_ONLY | LexFlags::NO_OPERATORS)?;
                }
                Token::SymClass => {
                    return Err(self.error(ErrorKind::Type, "Typed arguments not yet implemented!"));
                }
                Token::SymVariable => {
                    let s = self.token_symbol()?;
                    let name = self.sym_name(s);
                    return Err(self.error(
                        ErrorKind::Scope,
                        format!("There already is a result or argument named '{name}'!"),
                    ));
                }
                _ => {
                    if first {
                        return Ok(Rule::Wrong);
                    }
                    return Err(self.error(ErrorKind::Syntax, "Incorrect result/argument declaration."));
                }
            }
            first = false;
            if self.token != Token::Punct(b',') {
                return Ok(Rule::Matched);
            }
            self.lex(LexFlags::LOCALS_ONLY | LexFlags::NO_OPERATORS)?;
        }
    }

    fn getargs(&mut self) -> CompileResult<Rule> {
        let (delim, kind) = match self.token {
            Token::Punct(b'(') => (b')', VarKind::Argument),
            Token::Punct(b'[') => (b']', VarKind::OptArg),
            Token::Punct(b'<') => (b'>', VarKind::TupArg),
            _ => return Ok(Rule::Wrong),
        };
        self.lex(LexFlags::NO_OPERATORS)?;
        self.argdeflist(kind)?;
        if self.token != Token::Punct(delim) {
            return Err(self.error(
                ErrorKind::Syntax,
                format!("Expected closing '{}' after argument list.", char::from(delim)),
            ));
        }
        self.lex(LexFlags::NO_OPERATORS)?;
        Ok(Rule::Matched)
    }

    fn funcargs_check(&mut self) -> CompileResult<Rule> {
        if matches!(self.token, Token::Punct(b'(' | b'[' | b'<')) {
            return Err(self.error(
                ErrorKind::Syntax,
                "Too many argument lists, or illegal combination of argument lists!",
            ));
        }
        Ok(Rule::Matched)
    }

    /// `funcargs: '(' args ')' [ '[' opts ']' | '<' tups '>' ] | ...`
    fn funcargs(&mut self) -> CompileResult<Rule> {
        // '<' and '>' must not lex as operators here.
        self.relex(LexFlags::NO_OPERATORS)?;
        match self.token {
            Token::Punct(b'(') => {
                self.getargs()?;
            }
            Token::Punct(b'[' | b'<') => {
                self.getargs()?;
                match self.token {
                    Token::Punct(b'(') => {
                        return Err(self.error(ErrorKind::Syntax, "Required arguments must come first!"));
                    }
                    Token::Punct(b'[' | b'<') => {
                        return Err(self.error(
                            ErrorKind::Syntax,
                            "Cannot have both optional and tuple arguments!",
                        ));
                    }
                    _ => {}
                }
                return self.funcargs_check();
            }
            _ => return Ok(Rule::Wrong),
        }
        match self.token {
            Token::Punct(b'(') => Err(self.error(ErrorKind::Syntax, "Required arguments already specified!")),
            Token::Punct(b'[' | b'<') => {
                self.getargs()?;
                self.funcargs_check()
            }
            _ => self.funcargs_check(),
        }
    }

    /// Function prototype comparison for forward declarations.
    fn contract_of(&self, fo: HeapId) -> (u8, u8, u8, u8, FnFlags) {
        let f = self.heap.function(fo).expect("function object");
        (
            f.results,
            f.reqargs,
            f.optargs,
            f.tupargs,
            f.flags & (FnFlags::ARGS | FnFlags::RESULTS),
        )
    }

    fn funcdef2(&mut self, al: &mut MList, is_func: bool, local: bool) -> CompileResult<Rule> {
        let mut declsym: Option<SymbolId> = None;
        let mut decl_contract = None;
        let mut decl_export = false;
        let mut fname: Option<Vec<u8>> = None;
        let mut consume_name = false;

        match self.token {
            Token::Name => {
                if let Lval::Str(s) = &self.lval {
                    fname = Some(s.clone());
                }
                consume_name = true;
            }
            Token::SymFunction => {
                let s = self.token_symbol()?;
                let fo = self.tree.get(s).object().expect("function symbol has an object");
                let Some(f) = self.heap.function(fo) else {
                    return Err(self.ierror("Function symbol has an object that is not a function!"));
                };
                let flags = f.flags;
                let name_bytes = self.heap.str_bytes(f.name).to_vec();
                fname = Some(name_bytes);
                consume_name = true;
                if !local {
                    if flags.contains(FnFlags::DECLARATION) {
                        declsym = Some(s);
                        decl_contract = Some(self.contract_of(fo));
                        decl_export = flags.contains(FnFlags::EXPORT);
                    } else if flags.contains(FnFlags::CFUNC) {
                        let name = self.sym_name(s);
                        return Err(self.error(ErrorKind::Scope, format!("There is a C function named '{name}'!")));
                    } else {
                        let name = self.sym_name(s);
                        return Err(self.error(
                            ErrorKind::Scope,
                            format!("There already is a function named '{name}'!"),
                        ));
                    }
                }
            }
            Token::SymOperator => {
                let s = self.token_symbol()?;
                let name = self.sym_name(s);
                return Err(self.error(ErrorKind::Scope, format!("There is an operator named '{name}'!")));
            }
            Token::Kw(_) => {
                return Err(self.error(ErrorKind::Scope, "Function name is a reserved EEL keyword!"));
            }
            Token::Punct(b'(' | b'[' | b'<' | b'{') => {
                // Anonymous function
            }
            _ => return Err(self.error(ErrorKind::Syntax, "Expected function name!")),
        }

        if local {
            let Some(name) = fname.clone() else {
                return Err(self.error(ErrorKind::Syntax, "Member function must be named!"));
            };
            let name = String::from_utf8_lossy(&name).into_owned();
            let symname = self.unique_name(&name);
            self.declare_func(&name, Some(al), None, FnFlags::empty(), Some(&symname))?;
            self.lex0()?;
        } else if let Some(name) = fname.clone() {
            let name = String::from_utf8_lossy(&name).into_owned();
            self.declare_func(&name, Some(al), declsym, FnFlags::empty(), None)?;
            if consume_name {
                self.lex0()?;
            }
        } else {
            let name = self.unique_name("__anonymous_function");
            self.declare_func(&name, Some(al), None, FnFlags::empty(), None)?;
            // The current token was not a name, so it stays.
        }

        // Declaration/definition qualifiers
        if self.qualifiers.contains(Qualifiers::LOCAL | Qualifiers::EXPORT) {
            return Err(self.error(ErrorKind::Scope, "Functions cannot be both local and exported!"));
        }
        self.q_allow_only(Qualifiers::LOCAL | Qualifiers::EXPORT, "with functions")?;
        if self.qualifiers.contains(Qualifiers::EXPORT)
            && self.current_function().flags.contains(FnFlags::UPVALUES)
        {
            return Err(self.error(
                ErrorKind::Scope,
                "Functions that use upvalues cannot be exported!",
            ));
        }

        // Argument lists and call contract
        self.funcargs()?;
        self.declare_func_args(is_func)?;

        // A definition of a predeclared function must match its
        // declaration, and compiles against the declaration's scope.
        if let Some(ds) = declsym {
            let fo = self.cdr().func;
            let mut new_contract = self.contract_of(fo);
            // The declaration carries no DECLARATION bit in the saved
            // contract; drop it for comparison symmetry.
            new_contract.4 &= FnFlags::ARGS | FnFlags::RESULTS;
            if decl_contract != Some(new_contract) {
                return Err(self.error(
                    ErrorKind::Arity,
                    "Function definition does not match previous declaration!",
                ));
            }
            if self.qualifiers.contains(Qualifiers::LOCAL) && decl_export {
                return Err(self.error(
                    ErrorKind::Scope,
                    "Definition of exported function tries to make the function local!",
                ));
            }
            if self.qualifiers.contains(Qualifiers::EXPORT) && !decl_export {
                return Err(self.error(
                    ErrorKind::Scope,
                    "Definition of local function tries to export the function!",
                ));
            }
            if decl_export {
                self.heap.function_mut(fo).flags.insert(FnFlags::EXPORT);
            }
            // Redirect the context to the declaration's scope, where the
            // original argument symbols live.
            let anon = self.symtab();
            self.tree.free(self.heap, anon);
            self.ctx_mut().symtab = ds;
        }

        self.qualifiers_handled(Qualifiers::LOCAL | Qualifiers::EXPORT)?;

        // Check for accidental Pascal inspired semicolons
        if self.token == Token::Punct(b';') {
            self.lex0()?;
            if self.token == Token::Punct(b'{') {
                self.warn("Likely accidental ';' breaking function definition!");
            }
            self.unlex()?;
        }

        // Compile the function body
        if self.body(CtxFlags::empty(), true)? == Rule::Wrong {
            if declsym.is_some() {
                return Err(self.error(ErrorKind::Syntax, "Expected function body!"));
            }
            // Just a declaration.
            let fo = self.cdr().func;
            self.heap.function_mut(fo).flags.insert(FnFlags::DECLARATION);
            return Ok(Rule::Matched);
        }

        // A (re)defined declaration is fulfilled.
        let fo = self.cdr().func;
        self.heap.function_mut(fo).flags.remove(FnFlags::DECLARATION);
        self.procreturn()?;

        // The body may have introduced upvalue accesses (explicitly
        // declared ones pass the early check).
        let flags = self.current_function().flags;
        if flags.contains(FnFlags::EXPORT) && flags.contains(FnFlags::UPVALUES) {
            return Err(self.error(
                ErrorKind::Scope,
                "Functions that use upvalues cannot be exported!",
            ));
        }
        Ok(Rule::Matched)
    }

    /// `funcdef: ('function' | 'procedure') [NAME] funcargs body?`
    ///
    /// `function` is a class name rather than a keyword, so the rule
    /// triggers on the function class symbol.
    fn funcdef(&mut self, al: &mut MList, local: bool) -> CompileResult<Rule> {
        let is_func = match self.token {
            Token::SymClass => {
                let s = self.token_symbol()?;
                if self.class_of_symbol(s) != Some(ClassId::Function) {
                    return Ok(Rule::Wrong);
                }
                true
            }
            Token::Kw(Keyword::Procedure) => false,
            _ => return Ok(Rule::Wrong),
        };
        self.lex0()?;

        // "(function)" and "(procedure)" are class id literals.
        if self.token == Token::Punct(b')') {
            self.m_constant(al, Value::TypeId(ClassId::Function));
            return Ok(Rule::Matched);
        }

        self.context_push(CtxKind::Function, CtxFlags::empty(), None)?;
        let res = self.funcdef2(al, is_func, local);
        self.context_pop();
        let res = res?;

        // The next token was lexed in the function's scope; re-lex it.
        self.relex(LexFlags::empty())?;
        Ok(res)
    }

    /// Compiles a `try`/`except`/`untry` body as an xblock function and
    /// adds its reference to `al`.
    fn xblock(&mut self, basename: &str, al: &mut MList, flags: CtxFlags) -> CompileResult<Rule> {
        let name = self.unique_name(basename);
        self.context_push(CtxKind::Function, flags & (CtxFlags::CATCHER | CtxFlags::DUMMY), None)?;
        let inner = (|cc: &mut Self| -> CompileResult<()> {
            cc.declare_func(&name, Some(al), None, FnFlags::XBLOCK, None)?;
            cc.declare_func_args(false)?;
            // Catchers receive the exception in R[0], which must be
            // cleaned on frame exit.
            if flags.contains(CtxFlags::CATCHER) {
                cc.r_alloc_reg(0, RegUse::Variable)?;
            }
            if !flags.contains(CtxFlags::DUMMY) {
                if cc.statement(CtxFlags::empty(), true)? == Rule::Wrong {
                    return Err(cc.error(ErrorKind::Syntax, "Expected a statement or body!"));
                }
            }
            cc.code0(Opcode::Return)?;
            Ok(())
        })(self);
        self.context_pop();
        inner?;
        if !flags.contains(CtxFlags::DUMMY) {
            // The token was lexed in the xblock's scope. Re-lex.
            self.relex(LexFlags::empty())?;
        }
        Ok(Rule::Matched)
    }

    // ---- arginfo ----------------------------------------------------

    fn check_specified(&mut self, s: SymbolId, al: &mut MList) -> CompileResult<()> {
        let level = self.tree.get(self.symtab()).uv_level - self.tree.get(s).uv_level;
        let (kind, location) = self.tree.get(s).var();
        self.lex0()?;
        match kind {
            VarKind::Argument => Err(self.error(ErrorKind::Type, "'specified' used on required argument!")),
            VarKind::OptArg => {
                if level != 0 {
                    return Err(self.error(ErrorKind::Type, "'specified' cannot test upvalues!"));
                }
                let r = self.m_result(al)?;
                self.code_ab(Opcode::Spec, location, r)?;
                Ok(())
            }
            VarKind::TupArg => {
                if level != 0 {
                    return Err(self.error(ErrorKind::Type, "'specified' cannot test upvalues!"));
                }
                let mut ind = self.ml_open();
                self.expect_char(b'[', None)?;
                match self.expression(&mut ind, true)? {
                    Rule::Wrong => {
                        let e = self.error(ErrorKind::Syntax, "Index expression does not generate a result!");
                        self.ml_close(ind)?;
                        return Err(e);
                    }
                    Rule::Void => {
                        let e = self.error(ErrorKind::Syntax, "Expected index expression!");
                        self.ml_close(ind)?;
                        return Err(e);
                    }
                    _ => {}
                }
                self.expect_char(b']', Some("Missing ']'!"))?;
                self.check_argc(&ind, 1, 1)?;
                let r = self.m_result(al)?;
                let m = ind.first().expect("checked length");
                self.m_read(m, r)?;
                self.code_ab(Opcode::TSpec, r, r)?;
                self.ml_close(ind)?;
                Ok(())
            }
            _ => Err(self.error(ErrorKind::Type, "Expected argument identifier!")),
        }
    }

    /// `arginfo: 'arguments' | 'tuples' | 'specified' VARIABLE ['[' e ']']`
    fn arginfo(&mut self, al: &mut MList) -> CompileResult<Rule> {
        let f = self.current_function();
        let (optargs, tupargs) = (f.optargs, f.tupargs);
        match self.token {
            Token::Kw(Keyword::Arguments) => {
                self.no_qualifiers()?;
                if optargs == 0 && tupargs == 0 {
                    return Err(self.error(
                        ErrorKind::Type,
                        "'arguments' used in a function with no optional or tuple arguments!",
                    ));
                }
                let r = self.m_result(al)?;
                self.code_a(Opcode::ArgC, r)?;
                self.lex0()?;
            }
            Token::Kw(Keyword::Tuples) => {
                self.no_qualifiers()?;
                if tupargs == 0 {
                    return Err(self.error(
                        ErrorKind::Type,
                        "'tuples' used in a function with no tuple arguments!",
                    ));
                }
                let r = self.m_result(al)?;
                self.code_a(Opcode::TupC, r)?;
                self.lex0()?;
            }
            Token::Kw(Keyword::Specified) => {
                self.no_qualifiers()?;
                self.lex0()?;
                if self.token == Token::SymVariable {
                    let s = self.token_symbol()?;
                    self.check_specified(s, al)?;
                } else {
                    return Err(self.error(ErrorKind::Syntax, "Expected argument identifier!"));
                }
            }
            _ => return Ok(Rule::Wrong),
        }
        Ok(Rule::Matched)
    }

    // ---- Fields and constructors -----------------------------------

    /// `field: CONSTANT | VARIABLE | NAME` — NAME becomes a string key.
    fn field(&mut self, al: &mut MList) -> CompileResult<Rule> {
        match self.token {
            Token::SymConstant => {
                let s = self.token_symbol()?;
                let v = match &self.tree.get(s).payload {
                    SymPayload::Constant(v) => v.raw_copy(),
                    _ => return Err(self.ierror("Constant symbol without a value!")),
                };
                let v = v.clone_with_heap(self.heap);
                self.m_constant(al, v);
                self.lex0()?;
                Ok(Rule::Matched)
            }
            Token::SymVariable => {
                let s = self.token_symbol()?;
                self.do_getvar(s, al)?;
                self.lex0()?;
                Ok(Rule::Matched)
            }
            Token::Name => {
                let name = match std::mem::take(&mut self.lval) {
                    Lval::Str(s) => s,
                    _ => return Err(self.ierror("Name token without name bytes!")),
                };
                let sid = self.heap.new_string(&name);
                self.m_constant(al, Value::ObjRef(sid));
                self.lex0()?;
                Ok(Rule::Matched)
            }
            _ => Ok(Rule::Wrong),
        }
    }

    fn fieldlist(&mut self, al: &mut MList) -> CompileResult<Rule> {
        let mut first = true;
        loop {
            match self.field(al)? {
                Rule::Wrong => {
                    return Ok(if first { Rule::Wrong } else { Rule::Matched });
                }
                Rule::Void => {
                    return Err(self.error(ErrorKind::Syntax, "Void expression in field list!"));
                }
                _ => {}
            }
            first = false;
            if self.token != Token::Punct(b',') {
                return Ok(Rule::Matched);
            }
            self.lex(LexFlags::LOCALS_ONLY)?;
        }
    }

    /// Indexes `obj` by `ind` element-wise into `dest`, with the usual
    /// broadcast-one rules.
    fn do_index(&mut self, obj: &MList, ind: &MList, dest: &mut MList) -> CompileResult<()> {
        if obj.is_empty() {
            return Err(self.error(ErrorKind::Arity, "Trying to index nothing!"));
        }
        if ind.is_empty() {
            return Err(self.error(ErrorKind::Arity, "Trying to index object with nothing!"));
        }
        let (count, oi, ii) = if obj.len() == 1 {
            (ind.len(), 0, 1)
        } else if ind.len() == 1 {
            (obj.len(), 1, 0)
        } else {
            if obj.len() != ind.len() {
                return Err(self.error(
                    ErrorKind::Arity,
                    "Number of objects does not match number of indices!",
                ));
            }
            (obj.len(), 1, 1)
        };
        for i in 0..count {
            let om = obj.get(isize::try_from(i * oi).expect("index fits isize")).expect("in range");
            let im = ind.get(isize::try_from(i * ii).expect("index fits isize")).expect("in range");
            self.m_index(dest, om, im);
        }
        Ok(())
    }

    /// Table constructor: `table [ key value, (k, v), .name value, ... ]`
    fn tablector(&mut self, al: &mut MList) -> CompileResult<Rule> {
        if self.token != Token::Punct(b'[') {
            return Ok(Rule::Wrong);
        }
        self.lex0()?;
        self.no_qualifiers()?;

        let r = self.m_result(al)?;
        let mut inits = self.ml_open();
        let res = (|cc: &mut Self| -> CompileResult<()> {
            loop {
                if cc.token == Token::Punct(b']') {
                    break;
                }
                let lastcount = inits.len();
                let mut func_by_name = false;
                if cc.token == Token::Punct(b'(') {
                    // (key, value) syntax
                    cc.lex0()?;
                    if cc.explist(&mut inits, true)? == Rule::Wrong || inits.len() - lastcount != 2 {
                        return Err(cc.error(ErrorKind::Syntax, "Expected (key, value) tuple!"));
                    }
                    cc.expect_char(b')', None)?;
                } else if cc.funcdef(&mut inits, true)? != Rule::Wrong {
                    // Local function: keyed by its own name.
                    let fm = inits.get(-1).expect("funcdef added a manipulator");
                    let fo = match cc.manip(fm) {
                        ManipKind::Constant { v: Value::ObjRef(o), .. } => *o,
                        _ => return Err(cc.ierror("Local function is not a constant reference!")),
                    };
                    let name = cc.heap.function(fo).expect("function object").name;
                    cc.heap.own(name);
                    cc.m_object(&mut inits, name);
                    // Key first, then value.
                    let mut tmp = cc.ml_open();
                    cc.m_transfer(fm, &mut inits, &mut tmp);
                    cc.ml_transfer(&mut tmp, &mut inits);
                    cc.ml_close(tmp)?;
                    func_by_name = true;
                } else {
                    if cc.token == Token::Punct(b'.') {
                        // .name value syntax
                        cc.lex_hidden_scope = true;
                        let r = cc.lex(LexFlags::LOCALS_ONLY);
                        cc.lex_hidden_scope = false;
                        r?;
                        if cc.token != Token::Name {
                            return Err(cc.error(ErrorKind::Syntax, "Expected name!"));
                        }
                        let name = match std::mem::take(&mut cc.lval) {
                            Lval::Str(s) => s,
                            _ => return Err(cc.ierror("Name token without name bytes!")),
                        };
                        let sid = cc.heap.new_string(&name);
                        cc.m_constant(&mut inits, Value::ObjRef(sid));
                        cc.lex0()?;
                    } else if cc.expression(&mut inits, true)? == Rule::Wrong || inits.len() - lastcount != 1 {
                        return Err(cc.error(ErrorKind::Syntax, "Expected key expression!"));
                    }
                    if cc.expression(&mut inits, true)? == Rule::Wrong || inits.len() - lastcount != 2 {
                        return Err(cc.error(ErrorKind::Syntax, "Expected value expression!"));
                    }
                }
                if func_by_name {
                    // Comma is optional after "function by name".
                    if cc.token == Token::Punct(b',') {
                        cc.lex0()?;
                    }
                } else {
                    if cc.token != Token::Punct(b',') {
                        break;
                    }
                    cc.lex0()?;
                }
            }
            cc.expect_char(b']', None)?;
            if cc.ml_push_pairs_check(&inits) {
                return Err(cc.ierror("Table constructor generated an odd number of initializers!"));
            }
            Ok(())
        })(self);
        if let Err(e) = res {
            self.ml_close(inits)?;
            return Err(e);
        }
        self.ml_push(&inits)?;
        self.code_ab(Opcode::New, r, i32::from(ClassId::Table as u8))?;
        self.ml_close(inits)?;
        Ok(Rule::Matched)
    }

    fn ml_push_pairs_check(&self, inits: &MList) -> bool {
        inits.len() % 2 != 0
    }

    /// `ctor: '[' explist ']' | TYPENAME '[' ... ']'`
    fn ctor(&mut self, al: &mut MList) -> CompileResult<Rule> {
        let class = if self.token == Token::SymClass {
            let s = self.token_symbol()?;
            let Some(class) = self.class_of_symbol(s) else {
                return Ok(Rule::Wrong);
            };
            self.lex0()?;
            if self.token != Token::Punct(b'[') {
                self.unlex()?;
                return Ok(Rule::Wrong);
            }
            // Constructible classes are the mutable containers plus
            // strings; the class descriptor knows.
            let cd = self.tree.get(s).object().and_then(|o| match self.heap.get(o) {
                HeapData::ClassDef(cd) => Some(cd.mmethods),
                _ => None,
            });
            let constructible = class == ClassId::String
                || cd.is_some_and(|mm| mm.contains(crate::heap::Metamethods::SETINDEX));
            if !constructible {
                let name: &'static str = class.into();
                return Err(self.error(ErrorKind::Type, format!("Class '{name}' has no constructor!")));
            }
            class
        } else {
            if self.token != Token::Punct(b'[') {
                return Ok(Rule::Wrong);
            }
            ClassId::Array
        };
        if class == ClassId::Table {
            return self.tablector(al);
        }
        self.lex0()?;
        self.no_qualifiers()?;

        let r = self.m_result(al)?;
        let mut inits = self.ml_open();
        if self.token != Token::Punct(b']') && self.explist(&mut inits, true)? == Rule::Wrong {
            let e = self.error(ErrorKind::Syntax, "Expected list of initializers!");
            self.ml_close(inits)?;
            return Err(e);
        }
        let res = self.expect_char(b']', None);
        if let Err(e) = res {
            self.ml_close(inits)?;
            return Err(e);
        }
        self.ml_push(&inits)?;
        self.code_ab(Opcode::New, r, i32::from(class as u8))?;
        self.ml_close(inits)?;
        Ok(Rule::Matched)
    }

    // ---- simplexp ---------------------------------------------------

    fn simplexp2(&mut self, al: &mut MList, _wantresult: bool) -> CompileResult<Rule> {
        match self.token {
            Token::IntNum => {
                self.no_qualifiers()?;
                let v = match self.lval {
                    Lval::Integer(i) => i,
                    _ => return Err(self.ierror("Integer token without a value!")),
                };
                self.m_constant(al, Value::Integer(v));
                self.lex0()?;
                return Ok(Rule::Matched);
            }
            Token::RealNum => {
                self.no_qualifiers()?;
                let v = match self.lval {
                    Lval::Real(r) => r,
                    _ => return Err(self.ierror("Real token without a value!")),
                };
                self.m_constant(al, Value::Real(v));
                self.lex0()?;
                return Ok(Rule::Matched);
            }
            Token::SymOperator => {
                // Negative number literals are handled right here.
                let s = self.token_symbol()?;
                let unary = match &self.tree.get(s).payload {
                    SymPayload::Operator(op) => op.unary,
                    _ => None,
                };
                if unary != Some(Operator::Neg) {
                    return Ok(Rule::Wrong);
                }
                self.lex0()?;
                match self.token {
                    Token::IntNum => {
                        self.no_qualifiers()?;
                        let v = match self.lval {
                            Lval::Integer(i) => i,
                            _ => return Err(self.ierror("Integer token without a value!")),
                        };
                        self.m_constant(al, Value::Integer(v.wrapping_neg()));
                        self.lex0()?;
                        return Ok(Rule::Matched);
                    }
                    Token::RealNum => {
                        self.no_qualifiers()?;
                        let v = match self.lval {
                            Lval::Real(r) => r,
                            _ => return Err(self.ierror("Real token without a value!")),
                        };
                        self.m_constant(al, Value::Real(-v));
                        self.lex0()?;
                        return Ok(Rule::Matched);
                    }
                    _ => {
                        self.unlex()?;
                        return Ok(Rule::Wrong);
                    }
                }
            }
            Token::Kw(Keyword::True) => {
                self.no_qualifiers()?;
                self.m_constant(al, Value::Boolean(true));
                self.lex0()?;
                return Ok(Rule::Matched);
            }
            Token::Kw(Keyword::False) => {
                self.no_qualifiers()?;
                self.m_constant(al, Value::Boolean(false));
                self.lex0()?;
                return Ok(Rule::Matched);
            }
            Token::Kw(Keyword::Nil) => {
                self.no_qualifiers()?;
                self.m_constant(al, Value::Nil);
                self.lex0()?;
                return Ok(Rule::Matched);
            }
            Token::Str => {
                self.no_qualifiers()?;
                let bytes = match std::mem::take(&mut self.lval) {
                    Lval::Str(s) => s,
                    _ => return Err(self.ierror("String token without bytes!")),
                };
                let sid = self.heap.new_string(&bytes);
                self.m_constant(al, Value::ObjRef(sid));
                self.lex0()?;
                return Ok(Rule::Matched);
            }
            Token::SymConstant => {
                self.no_qualifiers()?;
                let s = self.token_symbol()?;
                let v = match &self.tree.get(s).payload {
                    SymPayload::Constant(v) => v.raw_copy(),
                    _ => return Err(self.ierror("Constant symbol without a value!")),
                };
                let v = v.clone_with_heap(self.heap);
                self.m_constant(al, v);
                self.lex0()?;
                return Ok(Rule::Matched);
            }
            Token::SymVariable => {
                let s = self.token_symbol()?;
                if self.qualifiers.contains(Qualifiers::LOCAL) {
                    let name = self.sym_name(s);
                    return Err(self.error(
                        ErrorKind::Scope,
                        format!("'{name}' is already declared in the current scope!"),
                    ));
                }
                self.q_allow_only(
                    Qualifiers::UPVALUE,
                    "here; the only qualifier allowed is 'upvalue', unless 'shadow' is used",
                )?;
                self.do_getvar(s, al)?;
                self.lex0()?;
                self.qualifiers_handled(Qualifiers::UPVALUE)?;
                return Ok(Rule::Matched);
            }
            Token::Kw(Keyword::Exception) => {
                let Some(fctx) = self.find_function_context() else {
                    return Err(self.ierror("'exception' outside function context!?"));
                };
                if !self.contexts[fctx].flags.contains(CtxFlags::CATCHER) {
                    return Err(self.error(
                        ErrorKind::Exception,
                        "'exception' used outside 'except' block!",
                    ));
                }
                self.no_qualifiers()?;
                self.m_register(al, 0);
                self.lex0()?;
                return Ok(Rule::Matched);
            }
            Token::Punct(b'#') => {
                // Argument expansion expressions
                self.no_qualifiers()?;
                self.lex0()?;
                match self.token {
                    Token::Kw(Keyword::Arguments) => {
                        self.m_args(al);
                        self.lex0()?;
                        return Ok(Rule::Matched);
                    }
                    Token::Kw(Keyword::Tuples) => {
                        self.m_tupargs(al);
                        self.lex0()?;
                        return Ok(Rule::Matched);
                    }
                    _ => {
                        return Err(self.error(ErrorKind::Syntax, "Invalid argument expansion expression!"));
                    }
                }
            }
            Token::Punct(b'(') => {
                // '(' explist ')' and '(' typeid ')' simplexp
                self.no_qualifiers()?;
                self.lex0()?;
                let res = self.explist(al, true)?;
                if res == Rule::Wrong {
                    return Err(self.error(ErrorKind::Syntax, "Expected expression list or type name!"));
                }
                self.expect_char(b')', Some("Missing ')' in expression."))?;
                let lastm = al.get(-1);
                let cast_class = lastm.and_then(|m| match self.manip(m) {
                    ManipKind::Constant { v: Value::TypeId(c), .. } if *c != ClassId::Function => Some(*c),
                    _ => None,
                });
                if let (Some(lastm), Some(class)) = (lastm, cast_class) {
                    let mut src = self.ml_open();
                    if self.expression2(CAST_PRIORITY + FLAT, &mut src, true)? == Rule::Wrong {
                        let e = self.error(ErrorKind::Syntax, "Expected expression!");
                        self.ml_close(src)?;
                        return Err(e);
                    }
                    if src.is_empty() {
                        let e = self.error(ErrorKind::Syntax, "Cast operator gets void operand!");
                        self.ml_close(src)?;
                        return Err(e);
                    }
                    for i in 0..src.len() {
                        let m = src.get(isize::try_from(i).expect("fits isize")).expect("in range");
                        self.m_cast(al, m, class);
                    }
                    self.ml_close(src)?;
                    self.ml_remove(al, lastm)?;
                    return Ok(Rule::Matched);
                }
                return Ok(if res == Rule::Void { Rule::Void } else { Rule::Matched });
            }
            _ => {}
        }

        // call
        match self.call(al)? {
            Rule::Wrong => {}
            Rule::Void => return Ok(Rule::Void),
            _ => return Ok(Rule::Matched),
        }

        // vardecl
        if self.vardecl(al)? != Rule::Wrong {
            return Ok(Rule::Matched);
        }

        // funcdef
        if self.funcdef(al, false)? != Rule::Wrong {
            return Ok(Rule::Matched);
        }

        // arginfo
        if self.arginfo(al)? != Rule::Wrong {
            return Ok(Rule::Matched);
        }

        // ctor
        if self.ctor(al)? != Rule::Wrong {
            return Ok(Rule::Matched);
        }

        // TYPENAME
        if self.token == Token::SymClass {
            let s = self.token_symbol()?;
            if let Some(class) = self.class_of_symbol(s) {
                self.m_constant(al, Value::TypeId(class));
                self.lex0()?;
                return Ok(Rule::Matched);
            }
        }

        Ok(Rule::Wrong)
    }

    /// `simplexp`, including the postfix indexing/member/call chain.
    fn simplexp(&mut self, al: &mut MList, wantresult: bool) -> CompileResult<Rule> {
        let before = al.len();

        // Qualifiers for declarations and definitions
        self.qualifiers = self.parse_qualifiers()?;

        if self.qualifiers.contains(Qualifiers::SHADOW) {
            // Don't look for upvalues.
            let old_token = self.token;
            self.relex(LexFlags::LOCALS_ONLY)?;
            match self.token {
                Token::SymVariable => {
                    return Err(self.error(ErrorKind::Scope, "Cannot shadow a local variable!"));
                }
                Token::SymFunction => {
                    return Err(self.error(ErrorKind::Scope, "Cannot shadow a local function!"));
                }
                Token::IntNum
                | Token::RealNum
                | Token::Kw(Keyword::True | Keyword::False)
                | Token::Str
                | Token::SymConstant
                | Token::Punct(b'[' | b'<') => {
                    return Err(self.error(ErrorKind::Syntax, "Incorrect use of 'shadow'!"));
                }
                t => {
                    if t == old_token {
                        self.warn("Use of 'shadow' to no effect.");
                    }
                }
            }
        }

        if self.qualifiers.contains(Qualifiers::UPVALUE) {
            if self.token != Token::SymVariable {
                return Err(self.error(
                    ErrorKind::Scope,
                    "Can't use 'upvalue' on something that is not a variable!",
                ));
            }
            let s = self.token_symbol()?;
            let level = self.tree.get(self.symtab()).uv_level - self.tree.get(s).uv_level;
            if level == 0 {
                let name = self.sym_name(s);
                return Err(self.error(
                    ErrorKind::Scope,
                    format!("Tried to use 'upvalue' on local variable '{name}'!"),
                ));
            }
            if self.tree.get(s).kind == SymKind::Upvalue {
                let name = self.sym_name(s);
                return Err(self.error(
                    ErrorKind::Scope,
                    format!("Variable '{name}' is already declared upvalue!"),
                ));
            }
            self.declare_upvalue(s)?;
            self.relex(LexFlags::LOCALS_ONLY)?;
        }

        // The initial simplexp
        let res = self.simplexp2(al, wantresult)?;
        if res == Rule::Wrong || al.len() <= before {
            // Don't let stray qualifiers leak outside simplexp().
            self.no_qualifiers()?;
            self.relex(LexFlags::empty())?;
            return Ok(res);
        }
        if !self.qualifiers.is_empty() {
            return Err(self.ierror("simplexp2() leaked qualifiers without complaining!"));
        }

        // Field/member/object indexing chain
        loop {
            match self.token {
                Token::Punct(b'[') => {
                    let mut ind = self.ml_open();
                    let mut vals = self.ml_open();
                    self.lex0()?;
                    if self.explist(&mut ind, true)? == Rule::Void {
                        let e = self.error(ErrorKind::Syntax, "Index expression evaluates to nothing!");
                        self.ml_close(ind)?;
                        self.ml_close(vals)?;
                        return Err(e);
                    }
                    self.expect_char(b']', Some("Expected closing ']' after index expression!"))?;
                    self.do_index(al, &ind, &mut vals)?;
                    let n = al.len();
                    self.ml_delete(al, 0, n)?;
                    self.ml_transfer(&mut vals, al);
                    self.ml_close(ind)?;
                    self.ml_close(vals)?;
                }
                Token::Punct(b'.' | b':') => {
                    let is_membercall = self.token == Token::Punct(b':');
                    self.lex0()?;
                    if self.token == Token::SymOperator {
                        // Probably an inplace operation statement.
                        self.unlex()?;
                        return Ok(Rule::Matched);
                    }
                    self.unlex()?;
                    let mut ind = self.ml_open();
                    // Field names resolve as plain names, not against the
                    // current scope.
                    self.lex_hidden_scope = true;
                    let lexres = self.lex(LexFlags::LOCALS_ONLY);
                    let fieldres = lexres.and_then(|_| {
                        if self.token == Token::Punct(b'(') {
                            if is_membercall {
                                return Err(self.error(
                                    ErrorKind::Syntax,
                                    "Expected name of member function or procedure!",
                                ));
                            }
                            self.lex(LexFlags::LOCALS_ONLY)?;
                            if self.fieldlist(&mut ind)? == Rule::Void {
                                return Err(self.error(ErrorKind::Syntax, "Field list evaluates to nothing!"));
                            }
                            if self.token != Token::Punct(b')') {
                                return Err(self.error(
                                    ErrorKind::Syntax,
                                    "Expected ')' after field list, or ',' to continue it!",
                                ));
                            }
                            self.lex(LexFlags::LOCALS_ONLY)?;
                            Ok(())
                        } else {
                            match self.field(&mut ind)? {
                                Rule::Void => Err(self.error(ErrorKind::Syntax, "Field evaluates to nothing!")),
                                Rule::Wrong => Err(self.error(ErrorKind::Syntax, "Expected field name!")),
                                _ => Ok(()),
                            }
                        }
                    });
                    self.lex_hidden_scope = false;
                    if let Err(e) = fieldres {
                        self.ml_close(ind)?;
                        return Err(e);
                    }
                    self.relex(LexFlags::empty())?;
                    let mut vals = self.ml_open();
                    self.do_index(al, &ind, &mut vals)?;
                    if is_membercall {
                        if al.len() != 1 || ind.len() != 1 {
                            let e = self.error(
                                ErrorKind::Arity,
                                "Multiple member calls through expression lists not yet implemented!",
                            );
                            self.ml_close(ind)?;
                            self.ml_close(vals)?;
                            return Err(e);
                        }
                        self.expect_char(b'(', Some("Expected member call argument list!"))?;
                        let self_m = al.first().expect("checked length");
                        let fn_m = vals.first().expect("indexed one value");
                        let mut selfl = self.ml_open();
                        self.m_transfer(self_m, al, &mut selfl);
                        self.call_member(fn_m, Some(selfl), al, wantresult)?;
                    } else {
                        // Replace objects with index results.
                        let n = al.len();
                        self.ml_delete(al, 0, n)?;
                        self.ml_transfer(&mut vals, al);
                    }
                    self.ml_close(ind)?;
                    self.ml_close(vals)?;
                }
                Token::Punct(b'(') => {
                    self.lex0()?;
                    if al.len() != 1 {
                        return Err(self.error(ErrorKind::Arity, "Cannot make method calls on expression lists!"));
                    }
                    let fn_m = al.first().expect("checked length");
                    self.call_member(fn_m, None, al, wantresult)?;
                    // The result(s) replace the funcref.
                    self.ml_remove(al, fn_m)?;
                }
                _ => return Ok(Rule::Matched),
            }
        }
    }

    // ---- Expressions ------------------------------------------------

    /// Flat left-to-right expression parsing; the old priorities only
    /// drive the compatibility warning.
    fn expression3(&mut self, limit: i32, left: &mut MList, al: &mut MList, wantresult: bool) -> CompileResult<Rule> {
        let res = self.simplexp(left, wantresult)?;
        if matches!(res, Rule::Wrong | Rule::Void) {
            if self.token == Token::SymOperator {
                let s = self.token_symbol()?;
                let (unary, un_pri, no_result) = match &self.tree.get(s).payload {
                    SymPayload::Operator(op) => (op.unary, op.un_pri, op.no_result),
                    _ => (None, 0, false),
                };
                let opname = self.sym_name(s);
                let Some(un_op) = unary else {
                    return Err(self.error(
                        ErrorKind::Type,
                        format!("No unary version of operator '{opname}' available!"),
                    ));
                };
                self.lex0()?;
                let mut right = self.ml_open();
                self.expression2(un_pri + FLAT, &mut right, true)?;
                if right.is_empty() {
                    let e = self.error(
                        ErrorKind::Syntax,
                        format!("No operands for unary operator '{opname}'!"),
                    );
                    self.ml_close(right)?;
                    return Err(e);
                }
                for i in 0..right.len() {
                    let rm = right.get(isize::try_from(i).expect("fits isize")).expect("in range");
                    self.m_op(left, None, un_op, rm)?;
                }
                self.ml_close(right)?;
                if no_result {
                    return Ok(Rule::Void);
                }
            } else if res == Rule::Void {
                return Ok(Rule::Void);
            } else {
                // Not an expression. The caller distinguishes a top-level
                // miss from an operand stop.
                return Ok(if limit == -1 { Rule::Wrong } else { Rule::Matched });
            }
        }

        // Loop over binary applications, left to right.
        loop {
            if self.token != Token::SymOperator {
                self.ml_transfer(left, al);
                return Ok(Rule::Matched);
            }
            let s = self.token_symbol()?;
            let (binary, lpri, rpri, no_result) = match &self.tree.get(s).payload {
                SymPayload::Operator(op) => (op.binary, op.lpri, op.rpri, op.no_result),
                _ => (None, 0, 0, false),
            };
            let opname = self.sym_name(s);
            let Some(op) = binary else {
                return Err(self.error(
                    ErrorKind::Type,
                    format!("No binary version of operator '{opname}' available!"),
                ));
            };

            // Warn whenever the pre-0.3.7 precedence would have made a
            // difference.
            if limit >= FLAT && ((lpri <= limit - FLAT) != (lpri <= limit)) {
                self.warn("EEL <= 0.3.6 would evaluate this expression differently due to operator precedence!");
            }
            if lpri <= limit {
                self.ml_transfer(left, al);
                return Ok(Rule::Matched);
            }

            self.lex0()?;
            let mut right = self.ml_open();
            let rres = self.expression2(rpri + FLAT, &mut right, true)?;
            if rres == Rule::Void {
                let e = self.error(ErrorKind::Syntax, "Subexpression generates no result!");
                self.ml_close(right)?;
                return Err(e);
            }

            // Element-wise application with broadcast-one length rules.
            let (count, linc, rinc) = if left.len() == 1 {
                if right.is_empty() {
                    let e = self.error(
                        ErrorKind::Arity,
                        format!("No right hand operands to binary operator '{opname}'!"),
                    );
                    self.ml_close(right)?;
                    return Err(e);
                }
                (right.len(), 0usize, 1usize)
            } else if right.len() == 1 {
                if left.is_empty() {
                    let e = self.error(
                        ErrorKind::Arity,
                        format!("No left hand operands to binary operator '{opname}'!"),
                    );
                    self.ml_close(right)?;
                    return Err(e);
                }
                (left.len(), 1, 0)
            } else if left.len() < right.len() {
                let e = self.error(
                    ErrorKind::Arity,
                    format!("Too few left hand operands to operator '{opname}'!"),
                );
                self.ml_close(right)?;
                return Err(e);
            } else if left.len() > right.len() {
                let e = self.error(
                    ErrorKind::Arity,
                    format!("Too few right hand operands to operator '{opname}'!"),
                );
                self.ml_close(right)?;
                return Err(e);
            } else {
                (left.len(), 1, 1)
            };
            let mut ri = 0isize;
            for i in 0..count {
                let lm = left.first().expect("left operand available");
                let rm = right.get(ri).expect("right operand available");
                self.m_op(left, Some(lm), op, rm)?;
                if linc == 1 || i + 1 == count {
                    self.ml_remove(left, lm)?;
                }
                ri += isize::try_from(rinc).expect("fits isize");
            }
            self.ml_close(right)?;
            if no_result {
                return Ok(Rule::Void);
            }
        }
    }

    fn expression2(&mut self, limit: i32, al: &mut MList, wantresult: bool) -> CompileResult<Rule> {
        let mut left = self.ml_open();
        let res = self.expression3(limit, &mut left, al, wantresult);
        match res {
            Ok(r) => {
                self.ml_close(left)?;
                Ok(r)
            }
            Err(e) => {
                self.ml_close(left)?;
                Err(e)
            }
        }
    }

    /// `expression: simplexp | OPERATOR expression | expression OPERATOR expression`
    pub fn expression(&mut self, al: &mut MList, wantresult: bool) -> CompileResult<Rule> {
        self.expression2(-1, al, wantresult)
    }

    // ---- Statements -------------------------------------------------

    /// `body: '{' block '}' | NAME ':' '{' block '}'`
    ///
    /// With `as_function` the body compiles into the current function
    /// context instead of a new body context.
    fn body(&mut self, flags: CtxFlags, as_function: bool) -> CompileResult<Rule> {
        let mut name: Option<Vec<u8>> = None;
        match self.token {
            Token::Punct(b'{') => {}
            Token::Name => {
                let n = match &self.lval {
                    Lval::Str(s) => s.clone(),
                    _ => return Ok(Rule::Wrong),
                };
                self.lex0()?;
                if self.token != Token::Punct(b':') {
                    self.unlex()?;
                    return Ok(Rule::Wrong);
                }
                if as_function {
                    return Err(self.error(ErrorKind::Syntax, "Function body must not be named!"));
                }
                name = Some(n);
                self.lex0()?;
                if self.token != Token::Punct(b'{') {
                    return Err(self.error(ErrorKind::Syntax, "Expected '{'."));
                }
            }
            _ => return Ok(Rule::Wrong),
        }
        self.lex0()?;

        if !as_function {
            let name_str = name.as_ref().map(|n| String::from_utf8_lossy(n).into_owned());
            self.context_push(CtxKind::Body, flags, name_str.as_deref())?;
        }
        self.ctx_mut().flags |= CtxFlags::WRAPPED;
        if self.block()? == Rule::Eof {
            return Err(self.error(ErrorKind::Syntax, "Unexpected EOF; unterminated {...} block!"));
        }
        if !as_function && !flags.contains(CtxFlags::KEEP) {
            let idx = self.contexts.len() - 1;
            self.code_leave_context(idx)?;
            // A labeled `break` may target this body by name.
            if !self.ctx().end_jumps.is_empty() {
                self.code_fixup_breaks()?;
            }
            self.context_pop();
        } else {
            self.ctx_mut().flags.remove(CtxFlags::WRAPPED);
        }

        self.expect_char(b'}', Some("Expected new statement or closing '}'."))?;
        Ok(Rule::Matched)
    }

    /// `assignstat: explist [op] explist ';'` and plain expression
    /// statements.
    fn assignstat(&mut self) -> CompileResult<Rule> {
        let mut expr = self.ml_open();
        if self.explist(&mut expr, false)? == Rule::Wrong {
            self.ml_close(expr)?;
            return Ok(Rule::Wrong);
        }

        // Statements that end on '}' (bodies, function definitions as
        // expressions) need no semicolon.
        self.unlex()?;
        if self.token == Token::Punct(b'}') {
            self.lex0()?;
            self.ml_close(expr)?;
            return Ok(Rule::Matched);
        }
        self.lex0()?;

        let (op, inplace, ops) = match self.token {
            Token::SymShortOp => {
                let s = self.token_symbol()?;
                let op = match &self.tree.get(s).payload {
                    SymPayload::Operator(d) => d.binary,
                    _ => None,
                };
                let Some(op) = op else {
                    return Err(self.error(ErrorKind::Type, "Operator has no binary form for shorthand use!"));
                };
                self.lex0()?;
                (op, false, "shorthand operation")
            }
            Token::Punct(b'.') => {
                self.lex0()?;
                if self.token != Token::SymOperator {
                    return Err(self.error(ErrorKind::Syntax, "Expected operator for inplace operation!"));
                }
                let s = self.token_symbol()?;
                let op = match &self.tree.get(s).payload {
                    SymPayload::Operator(d) => d.binary,
                    _ => None,
                };
                let Some(op) = op else {
                    return Err(self.error(ErrorKind::Type, "Operator has no binary form for inplace use!"));
                };
                self.lex0()?;
                (op, true, "inplace operation")
            }
            Token::Punct(b'=') => {
                self.lex0()?;
                (Operator::Assign, false, "assignment")
            }
            Token::WeakAssign => {
                self.lex0()?;
                (Operator::WkAssign, false, "weak assignment")
            }
            Token::Punct(b';') => {
                self.lex0()?;
                for i in 0..expr.len() {
                    let m = expr.get(isize::try_from(i).expect("fits isize")).expect("in range");
                    self.m_evaluate(m)?;
                }
                self.ml_close(expr)?;
                return Ok(Rule::Matched);
            }
            _ => {
                let writable = expr.first().is_some_and(|m| self.m_writable(m));
                let e = if writable {
                    self.error(ErrorKind::Syntax, "Expected '=' or ';'!")
                } else {
                    self.error(ErrorKind::Syntax, "Expected ';' or '('!")
                };
                self.ml_close(expr)?;
                return Err(e);
            }
        };

        if expr.is_empty() {
            let e = self.error(ErrorKind::Arity, format!("No target operand for {ops}!"));
            self.ml_close(expr)?;
            return Err(e);
        }

        let mut src = self.ml_open();
        let res = (|cc: &mut Self| -> CompileResult<()> {
            match cc.explist(&mut src, true)? {
                Rule::Wrong => {
                    return Err(cc.error(ErrorKind::Syntax, "Expected an expression!"));
                }
                Rule::Void => {
                    return Err(cc.error(ErrorKind::Syntax, "Expression does not generate a value!"));
                }
                _ => {}
            }
            if src.is_empty() {
                return Err(cc.error(ErrorKind::Arity, format!("No source operand for {ops}!")));
            }
            if src.len() != 1 && expr.len() != 1 {
                if expr.len() > src.len() {
                    return Err(cc.error(ErrorKind::Arity, format!("Too few sources in multiple {ops}!")));
                }
                if expr.len() < src.len() {
                    return Err(cc.error(ErrorKind::Arity, format!("Too many sources in multiple {ops}!")));
                }
            }
            if matches!(op, Operator::Assign | Operator::WkAssign) && src.len() > expr.len() {
                return Err(cc.error(
                    ErrorKind::Arity,
                    "Multiple assignment with fewer targets than sources!",
                ));
            }
            let dsi = usize::from(src.len() > 1);
            let ddi = usize::from(expr.len() > 1);
            let count = src.len().max(expr.len());
            let mut si = 0isize;
            let mut di = 0isize;
            for _ in 0..count {
                let sm = src.get(si).expect("in range");
                let dm = expr.get(di).expect("in range");
                if inplace {
                    cc.m_ipoperate(sm, op, dm)?;
                } else {
                    cc.m_operate(sm, op, dm)?;
                }
                si += isize::try_from(dsi).expect("fits isize");
                di += isize::try_from(ddi).expect("fits isize");
            }
            Ok(())
        })(self);
        self.ml_close(src)?;
        self.ml_close(expr)?;
        res?;
        self.expect_char(b';', Some("Missing ';' after assignment statement!"))?;
        Ok(Rule::Matched)
    }

    /// `vardecl: qualifiers NAME`
    fn vardecl(&mut self, al: &mut MList) -> CompileResult<Rule> {
        match self.token {
            Token::Name => {}
            Token::SymClass => {
                let s = self.token_symbol()?;
                // `function` and `module` have special uses.
                if matches!(self.class_of_symbol(s), Some(ClassId::Function | ClassId::Module)) {
                    return Ok(Rule::Wrong);
                }
                self.lex0()?;
                if self.token != Token::Name {
                    self.unlex()?;
                    return Ok(Rule::Wrong);
                }
                return Err(self.error(ErrorKind::Type, "Static typing not yet implemented!"));
            }
            _ => return Ok(Rule::Wrong),
        }

        self.q_allow_only(
            Qualifiers::LOCAL | Qualifiers::UPVALUE | Qualifiers::SHADOW | Qualifiers::STATIC,
            "with variables",
        )?;

        // Either a 'local' or 'static' qualifier is required.
        if !self.qualifiers.intersects(Qualifiers::LOCAL | Qualifiers::STATIC) {
            let name = match &self.lval {
                Lval::Str(s) => String::from_utf8_lossy(s).into_owned(),
                _ => "?".to_string(),
            };
            return Err(self.error(
                ErrorKind::Scope,
                format!("'{name}' not declared in the current scope!"),
            ));
        }
        if self.qualifiers.contains(Qualifiers::UPVALUE | Qualifiers::SHADOW) {
            return Err(self.error(ErrorKind::Scope, "Can't both use and shadow an upvalue!"));
        }
        if self.qualifiers.contains(Qualifiers::UPVALUE | Qualifiers::STATIC) {
            return Err(self.error(ErrorKind::Scope, "Cannot make an upvalue static!"));
        }
        let vk = if self.qualifiers.contains(Qualifiers::STATIC) {
            VarKind::Static
        } else {
            VarKind::Stack
        };

        let name = match std::mem::take(&mut self.lval) {
            Lval::Str(s) => s,
            _ => return Err(self.ierror("Name token without name bytes!")),
        };
        let sym = self.declare_var(&name, vk)?;
        self.do_getvar(sym, al)?;
        self.lex0()?;
        self.qualifiers_handled(
            Qualifiers::LOCAL | Qualifiers::UPVALUE | Qualifiers::SHADOW | Qualifiers::STATIC,
        )?;
        Ok(Rule::Matched)
    }

    /// `constdeclstat: ['export'] 'constant' NAME '=' expression ';'`
    fn constdeclstat(&mut self) -> CompileResult<Rule> {
        let mut do_export = false;
        match self.token {
            Token::Kw(Keyword::Constant) => {
                self.lex0()?;
            }
            Token::Kw(Keyword::Export) => {
                self.lex0()?;
                if self.token != Token::Kw(Keyword::Constant) {
                    self.unlex()?;
                    return Ok(Rule::Wrong);
                }
                do_export = true;
                self.lex0()?;
            }
            _ => return Ok(Rule::Wrong),
        }
        if self.token != Token::Name {
            return Err(self.error(ErrorKind::Syntax, "Expected constant name!"));
        }
        let cname = match std::mem::take(&mut self.lval) {
            Lval::Str(s) => s,
            _ => return Err(self.ierror("Name token without name bytes!")),
        };
        self.lex0()?;
        self.expect_char(b'=', None)?;
        let mut val = self.ml_open();
        let res = (|cc: &mut Self| -> CompileResult<()> {
            match cc.expression(&mut val, true)? {
                Rule::Wrong => {
                    return Err(cc.error(ErrorKind::Syntax, "Expression does not generate a value!"));
                }
                Rule::Void => {
                    return Err(cc.error(ErrorKind::Syntax, "Expected constant expression!"));
                }
                _ => {}
            }
            cc.check_argc(&val, 1, 1)?;
            let m = val.first().expect("checked length");
            if !cc.m_is_constant(m) {
                return Err(cc.error(ErrorKind::Type, "Cannot evaluate constant value of expression!"));
            }
            let nid = cc.heap.new_string(&cname);
            let scope = cc.symtab();
            let cs = cc.tree.add(Some(scope), Some(nid), SymKind::Constant);
            let v = cc.m_get_constant(m).expect("checked constant");
            if do_export {
                let xv = v.clone_with_heap(cc.heap);
                let key = cc.heap.new_string(&cname);
                let exports = cc.heap.module(cc.module).exports;
                cc.heap.table_set(exports, Value::ObjRef(key), xv);
            }
            cc.tree.get_mut(cs).payload = SymPayload::Constant(v);
            Ok(())
        })(self);
        self.ml_close(val)?;
        res?;
        self.expect_char(b';', Some("Missing ';' after constant declaration statement!"))?;
        Ok(Rule::Matched)
    }

    // ---- Control flow -----------------------------------------------

    /// Evaluates a test expression and emits the false-branch jump.
    /// Returns the jump position, or `None` with the constant truth of
    /// the test when it folds.
    fn code_test_jump(&mut self, expr: &MList) -> CompileResult<i32> {
        let m = expr.first().expect("caller checked length");
        match self.m_direct_read(m) {
            Some(r) => self.code_asbx(Opcode::JumpZ, r, 0),
            None => {
                let r = self.r_alloc(1, RegUse::Temporary)?;
                let ri = i32::try_from(r).expect("register fits i32");
                self.m_read(m, ri)?;
                let pos = self.code_asbx(Opcode::JumpZ, ri, 0)?;
                self.r_free(r, 1)?;
                Ok(pos)
            }
        }
    }

    /// `ifstat: 'if' expression statement ['else' statement]`
    fn ifstat(&mut self) -> CompileResult<Rule> {
        if self.token != Token::Kw(Keyword::If) {
            return Ok(Rule::Wrong);
        }
        self.lex0()?;

        // Test expression and conditional jump. Constant tests skip the
        // jump and make the branch certainty exact.
        let mut expr = self.ml_open();
        match self.expression(&mut expr, true)? {
            Rule::Void => {
                let e = self.error(ErrorKind::Syntax, "Test expression does not generate a result!");
                self.ml_close(expr)?;
                return Err(e);
            }
            Rule::Wrong => {
                let e = self.error(ErrorKind::Syntax, "Expected an expression!");
                self.ml_close(expr)?;
                return Err(e);
            }
            _ => {}
        }
        self.check_argc(&expr, 1, 1)?;
        let const_test = self.m_direct_bool(expr.first().expect("checked length"));
        let jump_false = match const_test {
            // A constant-true test needs no jump at all; a constant-false
            // one skips the branch unconditionally.
            Some(true) => -1,
            Some(false) => self.code_sax(Opcode::Jump, 0)?,
            None => self.code_test_jump(&expr)?,
        };
        self.ml_close(expr)?;

        // Code for "true"
        if self.statement(CtxFlags::CONDITIONAL | CtxFlags::KEEP, false)? != Rule::Matched {
            return Err(self.error(ErrorKind::Syntax, "Expected 'true' condition statement!"));
        }
        let idx = self.contexts.len() - 1;
        self.code_leave_context(idx)?;
        let jump_out = if self.token == Token::Kw(Keyword::Else) {
            // Skip the else section when the test was true. Inside the
            // conditional context for dead code elimination.
            self.code_sax(Opcode::Jump, 0)?
        } else {
            -1
        };
        self.context_pop();

        // else section?
        let target = self.code_target()?;
        self.set_jump(jump_false, target)?;
        if self.token == Token::Kw(Keyword::Else) {
            self.lex0()?;
            if self.statement(CtxFlags::CONDITIONAL, false)? != Rule::Matched {
                return Err(self.error(ErrorKind::Syntax, "Expected 'false' condition statement!"));
            }
            let target = self.code_target()?;
            self.set_jump(jump_out, target)?;
            self.e_merge(CeState::Yes);
        } else {
            let modulator = match const_test {
                Some(true) => CeState::Yes,
                Some(false) => CeState::No,
                None => CeState::Maybe,
            };
            self.e_merge(modulator);
        }

        // Check for "maybe initialized" right away.
        self.initializations()?;
        Ok(Rule::Matched)
    }

    /// `caselist: ('case' explist statement)*`
    fn caselist(&mut self, jtab: HeapId) -> CompileResult<()> {
        while self.token == Token::Kw(Keyword::Case) {
            let mut values = self.ml_open();
            self.lex0()?;
            let res = (|cc: &mut Self| -> CompileResult<()> {
                if cc.explist(&mut values, true)? == Rule::Wrong || values.is_empty() {
                    return Err(cc.error(ErrorKind::Syntax, "Expected case value(s)!"));
                }
                let pos = cc.code_target()?;
                for i in 0..values.len() {
                    let m = values.get(isize::try_from(i).expect("fits isize")).expect("in range");
                    if !cc.m_is_constant(m) {
                        return Err(cc.error(ErrorKind::Type, "Case value must be a constant!"));
                    }
                    let key = cc.m_get_constant(m).expect("checked constant");
                    if cc.heap.table(jtab).get(&key).is_some() {
                        let rendered = key.display(cc.heap);
                        key.drop_with_heap(cc.heap);
                        return Err(cc.error(
                            ErrorKind::Scope,
                            format!("Case value {rendered} already handled in switch!"),
                        ));
                    }
                    cc.heap.table_set(jtab, key, Value::Integer(pos));
                }
                Ok(())
            })(self);
            self.ml_close(values)?;
            res?;
            if self.statement(CtxFlags::CONDITIONAL | CtxFlags::KEEP, false)? != Rule::Matched {
                return Err(self.error(ErrorKind::Syntax, "Expected 'case' body statement!"));
            }
            let idx = self.contexts.len() - 1;
            self.code_break(Some(idx))?;
            self.code_move_breaks_up();
            self.context_pop();
        }
        Ok(())
    }

    /// `switchstat: 'switch' expression caselist ['default' statement]`
    fn switchstat(&mut self) -> CompileResult<Rule> {
        if self.token != Token::Kw(Keyword::Switch) {
            return Ok(Rule::Wrong);
        }
        self.lex0()?;

        // A switch directly inside a case invites 'default'/'else'
        // ambiguities; require braces.
        if self.ctx().creator == Creator::Switch && !self.ctx().flags.contains(CtxFlags::WRAPPED) {
            return Err(self.error(
                ErrorKind::Syntax,
                "'switch' directly inside 'case' not allowed! Please enclose in braces. ('{...}')",
            ));
        }

        // Switch wrapper context, to keep the implicit case breaks apart
        // from breaks belonging to outer contexts.
        self.context_push(CtxKind::Block, CtxFlags::empty(), None)?;
        self.ctx_mut().creator = Creator::Switch;

        let res = (|cc: &mut Self| -> CompileResult<()> {
            // The jump table is a table constant mapping case values to
            // code positions.
            let jtab = cc.heap.new_table();
            let jtabc = cc.add_constant(Value::ObjRef(jtab))?;
            let jtabc = i32::try_from(jtabc).map_err(|_| cc.error(ErrorKind::Range, "Constant pool overflow!"))?;

            // Selector expression and the jump through the table.
            let mut expr = cc.ml_open();
            match cc.expression(&mut expr, true)? {
                Rule::Void => {
                    let e = cc.error(ErrorKind::Syntax, "Switch expression does not generate a result!");
                    cc.ml_close(expr)?;
                    return Err(e);
                }
                Rule::Wrong => {
                    let e = cc.error(ErrorKind::Syntax, "Expected an expression!");
                    cc.ml_close(expr)?;
                    return Err(e);
                }
                _ => {}
            }
            cc.check_argc(&expr, 1, 1)?;
            let m = expr.first().expect("checked length");
            let jump_else = match cc.m_direct_read(m) {
                Some(r) => cc.code_abxscx(Opcode::Switch, r, jtabc, 0)?,
                None => {
                    let r = cc.r_alloc(1, RegUse::Temporary)?;
                    let ri = i32::try_from(r).expect("register fits i32");
                    cc.m_read(m, ri)?;
                    let pos = cc.code_abxscx(Opcode::Switch, ri, jtabc, 0)?;
                    cc.r_free(r, 1)?;
                    pos
                }
            };
            cc.ml_close(expr)?;

            cc.caselist(jtab)?;

            // default section?
            let target = cc.code_target()?;
            cc.set_jump(jump_else, target)?;
            if cc.token == Token::Kw(Keyword::Default) {
                cc.lex0()?;
                if cc.statement(CtxFlags::CONDITIONAL | CtxFlags::KEEP, false)? != Rule::Matched {
                    return Err(cc.error(ErrorKind::Syntax, "Expected 'default' catch statement!"));
                }
                cc.code_move_breaks_up();
                cc.context_pop();
                cc.e_merge(CeState::Yes);
            } else {
                cc.e_merge(CeState::Maybe);
            }

            // Wire all case exit jumps here.
            cc.code_fixup_breaks()?;
            Ok(())
        })(self);
        res?;

        self.context_pop();
        self.e_merge(CeState::Yes);
        self.relex(LexFlags::empty())?;

        // Misplaced 'case' gives a nonsense parse otherwise; 'default'
        // must come last.
        if self.token == Token::Kw(Keyword::Case) {
            return Err(self.error(
                ErrorKind::Syntax,
                "Misplaced 'case'! ('default' must come last in a 'switch'.)",
            ));
        }

        self.initializations()?;
        Ok(Rule::Matched)
    }

    /// `whilestat: 'while' expression statement`
    fn whilestat(&mut self) -> CompileResult<Rule> {
        if self.token != Token::Kw(Keyword::While) {
            return Ok(Rule::Wrong);
        }
        self.lex0()?;

        let loop_start = self.code_target()?;

        let mut expr = self.ml_open();
        match self.expression(&mut expr, true)? {
            Rule::Void => {
                let e = self.error(ErrorKind::Syntax, "Test expression does not generate a result!");
                self.ml_close(expr)?;
                return Err(e);
            }
            Rule::Wrong => {
                let e = self.error(ErrorKind::Syntax, "Expected a test expression!");
                self.ml_close(expr)?;
                return Err(e);
            }
            _ => {}
        }
        self.check_argc(&expr, 1, 1)?;
        let (jump_out, evstate) = match self.m_direct_bool(expr.first().expect("checked length")) {
            Some(false) => (self.code_sax(Opcode::Jump, 0)?, CeState::No),
            Some(true) => (-1, CeState::Yes),
            None => (self.code_test_jump(&expr)?, CeState::Maybe),
        };
        self.ml_close(expr)?;

        // Loop body
        if self
            .statement(
                CtxFlags::CONDITIONAL | CtxFlags::BREAKABLE | CtxFlags::CONTINUABLE | CtxFlags::KEEP,
                false,
            )?
            != Rule::Matched
        {
            return Err(self.error(ErrorKind::Syntax, "Expected loop body statement!"));
        }
        let idx = self.contexts.len() - 1;
        self.code_leave_context(idx)?;

        // Continue jumps land here
        self.code_fixup_continuations()?;

        // Loop jump
        let pos = self.code_sax(Opcode::Jump, 0)?;
        self.set_jump(pos, loop_start)?;

        // The stop jump and breaks land here
        let target = self.code_target()?;
        self.set_jump(jump_out, target)?;
        self.code_fixup_breaks()?;

        self.context_pop();
        self.e_merge(evstate);
        self.initializations()?;
        Ok(Rule::Matched)
    }

    /// `dostat: 'do' statement ('while' | 'until') expression`
    fn dostat(&mut self) -> CompileResult<Rule> {
        if self.token != Token::Kw(Keyword::Do) {
            return Ok(Rule::Wrong);
        }
        self.lex0()?;

        let loop_start = self.code_target()?;

        if self
            .statement(
                CtxFlags::CONDITIONAL | CtxFlags::BREAKABLE | CtxFlags::CONTINUABLE | CtxFlags::KEEP,
                false,
            )?
            != Rule::Matched
        {
            return Err(self.error(ErrorKind::Syntax, "Expected loop body statement!"));
        }
        let idx = self.contexts.len() - 1;
        self.code_leave_context(idx)?;

        // Continue jumps land here
        self.code_fixup_continuations()?;

        let jumpins = match self.token {
            Token::Kw(Keyword::Until) => Opcode::JumpZ,
            Token::Kw(Keyword::While) => Opcode::JumpNZ,
            _ => return Err(self.error(ErrorKind::Syntax, "Expected 'until' or 'while'!")),
        };
        self.lex0()?;

        let mut expr = self.ml_open();
        match self.expression(&mut expr, true)? {
            Rule::Void => {
                let e = self.error(ErrorKind::Syntax, "Test expression does not generate a result!");
                self.ml_close(expr)?;
                return Err(e);
            }
            Rule::Wrong => {
                let e = self.error(ErrorKind::Syntax, "Expected a test expression!");
                self.ml_close(expr)?;
                return Err(e);
            }
            _ => {}
        }
        self.check_argc(&expr, 1, 1)?;
        let m = expr.first().expect("checked length");
        let loopjump = match self.m_direct_read(m) {
            Some(r) => self.code_asbx(jumpins, r, 0)?,
            None => {
                let r = self.r_alloc(1, RegUse::Temporary)?;
                let ri = i32::try_from(r).expect("register fits i32");
                self.m_read(m, ri)?;
                let pos = self.code_asbx(jumpins, ri, 0)?;
                self.r_free(r, 1)?;
                pos
            }
        };
        self.set_jump(loopjump, loop_start)?;
        self.ml_close(expr)?;

        // Breaks land here
        self.code_fixup_breaks()?;

        self.context_pop();
        self.e_merge(CeState::MULTIPLE);
        self.initializations()?;
        Ok(Rule::Matched)
    }

    /// `forstat: 'for' iter '=' start ',' limit [',' step] statement`
    fn forstat(&mut self) -> CompileResult<Rule> {
        if self.token != Token::Kw(Keyword::For) {
            return Ok(Rule::Wrong);
        }
        self.lex0()?;

        // Wrap, so an iterator declared here is local to the loop.
        self.context_push(CtxKind::Body, CtxFlags::empty(), None)?;

        let mut iter = self.ml_open();
        if self.expression(&mut iter, true)? == Rule::Wrong {
            self.ml_close(iter)?;
            self.context_pop();
            return Ok(Rule::Wrong);
        }
        let res = (|cc: &mut Self| -> CompileResult<()> {
            if iter.is_empty() {
                return Err(cc.error(ErrorKind::Syntax, "No iterator variable!"));
            }
            cc.expect_char(b'=', None)?;

            let mut params = cc.ml_open();
            let inner = (|cc: &mut Self| -> CompileResult<()> {
                match cc.explist(&mut params, true)? {
                    Rule::Wrong | Rule::Void => {
                        return Err(cc.error(ErrorKind::Syntax, "Expected iteration parameters!"));
                    }
                    _ => {}
                }
                if params.len() < 2 || params.len() > 3 {
                    return Err(cc.error(ErrorKind::Arity, "'for' needs 2 or 3 parameters!"));
                }

                // Initialize the iteration variable.
                let iter_m = iter.first().expect("checked length");
                let start_m = params.first().expect("checked length");
                cc.m_copy(start_m, iter_m)?;
                let Some(i) = cc.m_direct_read(iter_m) else {
                    return Err(cc.error(ErrorKind::Type, "Iterator variable must be a local variable!"));
                };

                // Limit and increment registers.
                let limit = cc.r_alloc(1, RegUse::Temporary)?;
                let incr = cc.r_alloc(1, RegUse::Temporary)?;
                let limit_i = i32::try_from(limit).expect("register fits i32");
                let incr_i = i32::try_from(incr).expect("register fits i32");
                let limit_m = params.get(1).expect("checked length");
                cc.m_read(limit_m, limit_i)?;
                if params.len() >= 3 {
                    let step_m = params.get(2).expect("checked length");
                    cc.m_read(step_m, incr_i)?;
                } else {
                    cc.code_asbx(Opcode::LdI, incr_i, 1)?;
                }

                // Cast values; handle "limit is before start".
                let preloop = cc.code_abcsdx(Opcode::Preloop, i, incr_i, limit_i, 0)?;
                let loopstart = cc.code_target()?;

                // Loop body
                if cc
                    .statement(
                        CtxFlags::CONDITIONAL
                            | CtxFlags::BREAKABLE
                            | CtxFlags::CONTINUABLE
                            | CtxFlags::REPEATABLE
                            | CtxFlags::KEEP,
                        false,
                    )?
                    != Rule::Matched
                {
                    return Err(cc.error(ErrorKind::Syntax, "Expected loop body statement!"));
                }
                let idx = cc.contexts.len() - 1;
                cc.code_leave_context(idx)?;

                // 'continue' lands here
                cc.code_fixup_continuations()?;

                // Update the iteration variable, test, and maybe loop.
                let loopjump = cc.code_abcsdx(Opcode::Loop, i, incr_i, limit_i, 0)?;
                cc.set_jump(loopjump, loopstart)?;
                let target = cc.code_target()?;
                cc.set_jump(preloop, target)?;

                cc.r_free(incr, 1)?;
                cc.r_free(limit, 1)?;

                // Breaks land here
                cc.code_fixup_breaks()?;

                cc.context_pop();
                cc.e_merge(CeState::MULTIPLE);
                Ok(())
            })(cc);
            cc.ml_close(params)?;
            inner
        })(self);
        self.ml_close(iter)?;
        res?;

        let idx = self.contexts.len() - 1;
        self.code_leave_context(idx)?;
        self.context_pop();
        self.relex(LexFlags::empty())?;
        Ok(Rule::Matched)
    }

    /// Resolves the optional body-name label of break/continue/repeat.
    fn label_target(&mut self) -> CompileResult<Option<usize>> {
        if self.token != Token::SymBody {
            return Ok(None);
        }
        let s = self.token_symbol()?;
        let Some(level) = self.body_context_index(s) else {
            let name = self.sym_name(s);
            return Err(self.error(ErrorKind::Scope, format!("Named body '{name}' is not open here!")));
        };
        if level >= self.contexts.len() || self.contexts[level].symtab != s {
            let name = self.sym_name(s);
            return Err(self.error(ErrorKind::Scope, format!("Named body '{name}' is not open here!")));
        }
        self.lex0()?;
        Ok(Some(level))
    }

    fn breakstat(&mut self) -> CompileResult<Rule> {
        if self.token != Token::Kw(Keyword::Break) {
            return Ok(Rule::Wrong);
        }
        self.lex0()?;
        let target = self.label_target()?;
        self.code_break(target)?;
        self.expect_char(b';', Some("Missing ';' after 'break' statement!"))?;
        Ok(Rule::Matched)
    }

    fn contstat(&mut self) -> CompileResult<Rule> {
        if self.token != Token::Kw(Keyword::Continue) {
            return Ok(Rule::Wrong);
        }
        self.lex0()?;
        let target = match self.label_target()? {
            Some(t) => t,
            None => match self.find_context_flags(CtxFlags::CONTINUABLE) {
                Some(t) => t,
                None => {
                    return Err(self.error(ErrorKind::Scope, "'continue' outside continuable context!"));
                }
            },
        };
        if !self.contexts[target].flags.contains(CtxFlags::CONTINUABLE) {
            return Err(self.error(ErrorKind::Scope, "'continue' outside continuable context!"));
        }
        self.code_next(target)?;
        self.expect_char(b';', Some("Missing ';' after 'continue' statement!"))?;
        Ok(Rule::Matched)
    }

    fn repeatstat(&mut self) -> CompileResult<Rule> {
        if self.token != Token::Kw(Keyword::Repeat) {
            return Ok(Rule::Wrong);
        }
        self.lex0()?;
        let target = match self.label_target()? {
            Some(t) => Some(t),
            None => self.find_context_flags(CtxFlags::REPEATABLE),
        };
        let Some(target) = target else {
            return Err(self.error(ErrorKind::Scope, "'repeat' outside repeatable context!"));
        };
        if !self.contexts[target].flags.contains(CtxFlags::REPEATABLE) {
            return Err(self.error(ErrorKind::Scope, "'repeat' outside repeatable context!"));
        }
        self.code_repeat(target)?;
        self.expect_char(b';', Some("Missing ';' after 'repeat' statement!"))?;
        Ok(Rule::Matched)
    }

    /// `returnstat: 'return' [expression] ';'`
    fn returnstat(&mut self) -> CompileResult<Rule> {
        if self.token != Token::Kw(Keyword::Return) {
            return Ok(Rule::Wrong);
        }
        self.lex0()?;

        // Initialization state must be certain here, or the return
        // instruction's frame cleanup would be wrong.
        self.initializations()?;

        let flags = self.current_function().flags;
        let mut result = self.ml_open();
        let rres = self.expression(&mut result, true)?;
        let res = (|cc: &mut Self| -> CompileResult<()> {
            if flags.contains(FnFlags::RESULTS) {
                if rres == Rule::Void {
                    return Err(cc.error(ErrorKind::Syntax, "Return value evaluates to nothing!"));
                }
                if result.is_empty() {
                    if cc.token == Token::Punct(b';') {
                        return Err(cc.error(ErrorKind::Arity, "Function must return a value!"));
                    }
                    return Err(cc.error(ErrorKind::Syntax, "Return value expression syntax error!"));
                }
                if result.len() > 1 {
                    return Err(cc.error(ErrorKind::Arity, "Function can only return one value!"));
                }
                let m = result.first().expect("checked length");
                let r = match cc.m_direct_read(m) {
                    Some(r) => r,
                    None => {
                        let r = cc.r_alloc(1, RegUse::Temporary)?;
                        let ri = i32::try_from(r).expect("register fits i32");
                        cc.m_read(m, ri)?;
                        ri
                    }
                };
                if flags.contains(FnFlags::XBLOCK) {
                    cc.code_a(Opcode::RetxR, r)?;
                } else {
                    cc.code_a(Opcode::ReturnR, r)?;
                }
                cc.e_result();
                cc.e_return();
                cc.expect_char(b';', Some("Expected ';' after 'return' statement!"))?;
            } else {
                if rres != Rule::Void && !result.is_empty() {
                    return Err(cc.error(ErrorKind::Arity, "A procedure cannot return a value!"));
                }
                if flags.contains(FnFlags::XBLOCK) {
                    cc.code0(Opcode::Retx)?;
                } else {
                    cc.code0(Opcode::Return)?;
                }
                cc.e_return();
                cc.expect_char(b';', Some("Expected ';' after procedure return statement."))?;
            }
            Ok(())
        })(self);
        self.ml_close(result)?;
        res?;
        Ok(Rule::Matched)
    }

    /// `trystat: 'try' xblock ['except' xblock]`
    fn trystat(&mut self) -> CompileResult<Rule> {
        if self.token != Token::Kw(Keyword::Try) {
            return Ok(Rule::Wrong);
        }
        self.lex0()?;

        let mut fl = self.ml_open();
        let res = (|cc: &mut Self| -> CompileResult<()> {
            if cc.xblock("__try", &mut fl, CtxFlags::empty())? == Rule::Wrong {
                return Err(cc.error(ErrorKind::Exception, "Expected 'try' block!"));
            }
            let tm = fl.first().expect("xblock added its function");
            let tf = cc.m_prepare_constant(tm)?;

            if cc.token == Token::Kw(Keyword::Except) {
                cc.lex0()?;
                if cc.xblock("__except", &mut fl, CtxFlags::CATCHER)? == Rule::Wrong {
                    return Err(cc.error(ErrorKind::Exception, "Expected 'except' block!"));
                }
            } else if cc.xblock("__except", &mut fl, CtxFlags::CATCHER | CtxFlags::DUMMY)? == Rule::Wrong {
                return Err(cc.ierror("Could not compile dummy 'except' block!"));
            }
            let xm = fl.get(1).expect("xblock added its function");
            let xf = cc.m_prepare_constant(xm)?;

            cc.code_axbx(Opcode::Try, xf, tf)?;
            Ok(())
        })(self);
        self.ml_close(fl)?;
        res?;

        // Exceptions can abort the try block anywhere; the only event
        // worth keeping is both blocks certainly throwing.
        self.e_merge(CeState::Yes);
        Ok(Rule::Matched)
    }

    /// `untrystat: 'untry' xblock`
    fn untrystat(&mut self) -> CompileResult<Rule> {
        if self.token != Token::Kw(Keyword::Untry) {
            return Ok(Rule::Wrong);
        }
        self.lex0()?;

        let mut fl = self.ml_open();
        let res = (|cc: &mut Self| -> CompileResult<()> {
            if cc.xblock("__untry", &mut fl, CtxFlags::empty())? == Rule::Wrong {
                return Err(cc.error(ErrorKind::Exception, "Expected 'untry' block!"));
            }
            let tm = fl.first().expect("xblock added its function");
            let tf = cc.m_prepare_constant(tm)?;
            cc.code_ax(Opcode::Untry, tf)?;
            Ok(())
        })(self);
        self.ml_close(fl)?;
        res?;

        self.e_merge(CeState::Yes);
        Ok(Rule::Matched)
    }

    /// `eelversion <anything> ';'` — accepted for compatibility.
    fn eelversionstat(&mut self) -> CompileResult<Rule> {
        loop {
            match self.token {
                Token::Punct(b';') => {
                    self.lex0()?;
                    return Ok(Rule::Matched);
                }
                Token::Eof => {
                    return Err(self.error(ErrorKind::Syntax, "Missing ';' after 'eelversion' statement!"));
                }
                _ => {
                    self.lex0()?;
                }
            }
        }
    }

    fn statement2(&mut self) -> CompileResult<Rule> {
        match self.token {
            Token::Eof | Token::Kw(Keyword::End) => {
                return Ok(Rule::Eof);
            }
            Token::Punct(b';') => {
                self.lex0()?;
                return Ok(Rule::Matched);
            }
            Token::Kw(Keyword::Include) => {
                self.lex0()?;
                if self.token != Token::Str {
                    return Err(self.error(ErrorKind::Syntax, "Expected a string literal."));
                }
                return Err(self.error(
                    ErrorKind::Io,
                    "'include' is not available: module loading is external to this compiler.",
                ));
            }
            Token::Kw(Keyword::Export) => {
                // 'export import ...' forwards imports; plain 'export'
                // falls through to declarations below.
                self.lex0()?;
                if self.token == Token::Kw(Keyword::Import) {
                    return Err(self.error(
                        ErrorKind::Io,
                        "'import' is not available: module loading is external to this compiler.",
                    ));
                }
                self.unlex()?;
            }
            Token::Kw(Keyword::Import) => {
                return Err(self.error(
                    ErrorKind::Io,
                    "'import' is not available: module loading is external to this compiler.",
                ));
            }
            Token::Kw(Keyword::EelVersion) => {
                self.lex0()?;
                return self.eelversionstat();
            }
            Token::SymClass => {
                let s = self.token_symbol()?;
                if self.class_of_symbol(s) == Some(ClassId::Module) {
                    return Err(self.error(ErrorKind::Scope, "Cannot declare a module within a module!"));
                }
            }
            Token::Kw(Keyword::Throw) => {
                self.lex0()?;
                let mut al = self.ml_open();
                let res = (|cc: &mut Self| -> CompileResult<()> {
                    if cc.expression(&mut al, true)? == Rule::Wrong || al.len() != 1 {
                        return Err(cc.error(ErrorKind::Exception, "Expected exception value!"));
                    }
                    let m = al.first().expect("checked length");
                    match cc.m_direct_read(m) {
                        Some(r) => {
                            cc.code_a(Opcode::Throw, r)?;
                        }
                        None => {
                            let r = cc.r_alloc(1, RegUse::Temporary)?;
                            let ri = i32::try_from(r).expect("register fits i32");
                            cc.m_read(m, ri)?;
                            cc.code_a(Opcode::Throw, ri)?;
                            cc.r_free(r, 1)?;
                        }
                    }
                    Ok(())
                })(self);
                self.ml_close(al)?;
                res?;
                // Try blocks are functions; a throw leaves them like a
                // return (and satisfies the result contract).
                self.e_return();
                self.e_result();
                self.expect_char(b';', None)?;
                return Ok(Rule::Matched);
            }
            Token::Kw(Keyword::Retry) => {
                self.lex0()?;
                self.code0(Opcode::Retry)?;
                self.expect_char(b';', None)?;
                return Ok(Rule::Matched);
            }
            _ => {}
        }

        if self.ifstat()? != Rule::Wrong {
            return Ok(Rule::Matched);
        }
        if self.switchstat()? != Rule::Wrong {
            return Ok(Rule::Matched);
        }
        if self.whilestat()? != Rule::Wrong {
            return Ok(Rule::Matched);
        }
        if self.dostat()? != Rule::Wrong {
            return Ok(Rule::Matched);
        }
        if self.forstat()? != Rule::Wrong {
            return Ok(Rule::Matched);
        }
        if self.breakstat()? != Rule::Wrong {
            return Ok(Rule::Matched);
        }
        if self.contstat()? != Rule::Wrong {
            return Ok(Rule::Matched);
        }
        if self.repeatstat()? != Rule::Wrong {
            return Ok(Rule::Matched);
        }
        if self.returnstat()? != Rule::Wrong {
            return Ok(Rule::Matched);
        }
        if self.trystat()? != Rule::Wrong {
            return Ok(Rule::Matched);
        }
        if self.untrystat()? != Rule::Wrong {
            return Ok(Rule::Matched);
        }
        if self.constdeclstat()? != Rule::Wrong {
            return Ok(Rule::Matched);
        }
        if self.assignstat()? != Rule::Wrong {
            return Ok(Rule::Matched);
        }

        Ok(Rule::Wrong)
    }

    /// One statement. With `as_function`, a `{...}` body compiles into
    /// the current function context.
    fn statement(&mut self, flags: CtxFlags, as_function: bool) -> CompileResult<Rule> {
        // A body wraps itself if needed.
        if self.body(flags, as_function)? != Rule::Wrong {
            return Ok(Rule::Matched);
        }

        // Wrap conditional statements in their own block context.
        if flags.contains(CtxFlags::CONDITIONAL) {
            self.context_push(CtxKind::Block, flags, None)?;
        }

        let res = self.statement2();

        if flags.contains(CtxFlags::CONDITIONAL) && !flags.contains(CtxFlags::KEEP) {
            let idx = self.contexts.len() - 1;
            self.code_leave_context(idx)?;
            self.context_pop();
        }
        res
    }

    /// `block: statement*`
    fn block(&mut self) -> CompileResult<Rule> {
        loop {
            match self.statement(CtxFlags::empty(), false)? {
                Rule::Wrong => return Ok(Rule::Matched),
                Rule::Eof => return Ok(Rule::Eof),
                _ => {}
            }
        }
    }

    // ---- Module pipeline --------------------------------------------

    /// Installs `__init_module` and the exported functions into the
    /// module's export table.
    fn init_exports(&mut self) -> CompileResult<()> {
        let exports = self.heap.module(self.module).exports;
        let root_fn = self.cdr().func;
        self.heap.own(root_fn);
        let key = self.heap.new_str("__init_module");
        self.heap.table_set(exports, Value::ObjRef(key), Value::ObjRef(root_fn));

        let st = self.symtab();
        let mut finder = Finder::new(st, FindFlags::MATCH_KINDS);
        finder.kinds = SymKinds::FUNCTION;
        let mut found = Vec::new();
        while let Some(s) = finder.next(self.tree) {
            found.push(s);
        }
        for s in found {
            let Some(fo) = self.tree.get(s).object() else { continue };
            let Some(f) = self.heap.function(fo) else { continue };
            if !f.flags.contains(FnFlags::EXPORT) || f.module != self.module {
                continue;
            }
            let Some(name) = self.tree.get(s).name else { continue };
            self.heap.own(name);
            self.heap.own(fo);
            self.heap.table_set(exports, Value::ObjRef(name), Value::ObjRef(fo));
        }
        Ok(())
    }

    /// Any function object still flagged as a declaration never got a
    /// body.
    fn check_declarations(&mut self) -> CompileResult<()> {
        let objects = self.heap.module(self.module).objects.clone();
        for o in objects {
            let Some(f) = self.heap.function(o) else { continue };
            if f.flags.contains(FnFlags::DECLARATION) {
                let name = self.heap.str_lossy(f.name);
                return Err(self.error(
                    ErrorKind::Scope,
                    format!("Function '{name}' declared but not defined!"),
                ));
            }
        }
        Ok(())
    }

    /// Declares the implicit `$` environment static variable. The VM
    /// binds the actual environment object into the slot at module init.
    fn declare_environment(&mut self) -> CompileResult<()> {
        self.declare_var(b"$", VarKind::Static)?;
        Ok(())
    }

    /// Compiles the whole module source.
    pub fn compile_module(&mut self) -> CompileResult<()> {
        // Module context
        self.context_push(CtxKind::Module, CtxFlags::empty(), None)?;
        self.module_symtab = Some(self.symtab());
        self.heap.own(self.module);
        self.tree.get_mut(self.symtab()).payload = SymPayload::Object(self.module);

        // Bootstrap the lexer
        self.lexer_invalidate();
        self.lex0()?;

        // Named module?
        if self.token == Token::SymClass {
            let s = self.token_symbol()?;
            if self.class_of_symbol(s) == Some(ClassId::Module) {
                self.lex0()?;
                if self.token != Token::Name {
                    return Err(self.error(ErrorKind::Syntax, "Expected module name!"));
                }
                let name = match std::mem::take(&mut self.lval) {
                    Lval::Str(s) => s,
                    _ => return Err(self.ierror("Name token without name bytes!")),
                };
                let nid = self.heap.new_string(&name);
                let st = self.symtab();
                self.heap.own(nid);
                self.tree.rename(self.heap, st, nid);
                let exports = self.heap.module(self.module).exports;
                let key = self.heap.new_str("__modname");
                self.heap.table_set(exports, Value::ObjRef(key), Value::ObjRef(nid));
                self.lex0()?;
                self.expect_char(b';', Some("Missing ';' after module declaration!"))?;
            }
        }

        // Root function context
        self.context_push(CtxKind::Function, CtxFlags::ROOT, None)?;
        self.declare_func("__init_module", None, None, FnFlags::empty(), None)?;
        self.declare_func_args(false)?;
        {
            let func = self.cdr().func;
            self.heap.function_mut(func).flags.insert(FnFlags::ROOT);
        }
        self.declare_environment()?;
        self.relex(LexFlags::empty())?;

        // Go!
        if self.block()? != Rule::Eof {
            return Err(self.error(ErrorKind::Syntax, "Syntax error! Statement expected."));
        }
        if self.token == Token::Kw(Keyword::End) {
            self.lex0()?;
            self.expect_char(b';', Some("Missing ';' after 'end'!"))?;
        }

        // Finalize the top-level function
        self.check_declarations()?;
        self.init_exports()?;
        self.procreturn()?;
        self.context_pop();

        // Leave the module context and drop its symbols.
        let mst = self.symtab();
        self.context_pop();
        self.tree.free(self.heap, mst);
        self.module_symtab = None;
        self.lexer_invalidate();

        // Record the initial reference sum, for module garbage
        // collection.
        let refsum = self.heap.module_countref(self.module);
        self.heap.module_mut(self.module).refsum = refsum;
        Ok(())
    }
}
