//! Compiler contexts.
//!
//! A context is a compile-time lexical scope on a LIFO stack: module,
//! function, body (`{...}`) or plain statement block. Contexts carry the
//! scope's symbol table, pending break/continue fix-ups, and the event
//! lists that make initialization analysis and dead-code elimination
//! work. Popping a context propagates or discards its events according
//! to its kind and flags.

use bitflags::bitflags;

use crate::{
    diag::CompileResult,
    event::{CeState, EventList, MAX_REG, merge_branches},
    heap::FnFlags,
    state::Cc,
    symtab::{SymKind, SymPayload, SymbolId},
};

/// What kind of scope a context is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CtxKind {
    /// No symbol table of its own; a piece of code treated as a block.
    Block,
    /// `{...}` body with a local symbol table.
    Body,
    /// Module scope.
    Module,
    /// Function scope.
    Function,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct CtxFlags: u16 {
        /// `break` may jump to the end of this context.
        const BREAKABLE = 0x0001;
        /// `continue` may jump to this context's loop test.
        const CONTINUABLE = 0x0002;
        /// Context compiles conditional code; its events become a
        /// sibling list in the parent on pop.
        const CONDITIONAL = 0x0004;
        /// `repeat` may jump straight to this context's start.
        const REPEATABLE = 0x0008;
        /// Root function context: top-level declarations become statics
        /// and may be exported.
        const ROOT = 0x0010;
        /// Exception catcher (`except` block) function context.
        const CATCHER = 0x0020;
        /// No explicit code is parsed in this context.
        const DUMMY = 0x0040;
        /// Wrapped in `{}` (a real body).
        const WRAPPED = 0x0080;
        /// The parsing rule leaves the context open for its caller.
        const KEEP = 0x0100;
        /// Popping this context pops the current coder too.
        const OWNS_CODER = 0x0200;
    }
}

/// Who pushed a context; used for targeted diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Creator {
    None,
    Switch,
}

/// Deferred branch patch: the position of an emitted jump and the exit
/// certainty at the jump site.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CodeMark {
    pub pos: i32,
    pub xstate: CeState,
}

#[derive(Debug)]
pub(crate) struct Context {
    pub kind: CtxKind,
    pub flags: CtxFlags,
    pub symtab: SymbolId,
    /// Code position of the context start (for `continue`/`repeat`).
    pub startpos: i32,
    /// Jumps to the end of the context (breaks).
    pub end_jumps: Vec<CodeMark>,
    /// Jumps to the loop test (continues).
    pub cont_jumps: Vec<CodeMark>,
    /// Event lists; `[0]` is the master, the rest are collected branch
    /// siblings awaiting a merge.
    pub events: Vec<EventList>,
    pub creator: Creator,
    pub level: u32,
}

impl Cc<'_> {
    /// Pushes a new context of `kind`. Body, function and module contexts
    /// get a scope symbol (named `name`, or a generated one); module
    /// scopes attach under the root namespace.
    pub fn context_push(&mut self, kind: CtxKind, flags: CtxFlags, name: Option<&str>) -> CompileResult<()> {
        let (symtab, level, creator) = match self.contexts.last() {
            Some(prev) => (prev.symtab, prev.level + 1, prev.creator),
            None => (self.root_symtab, 0, Creator::None),
        };

        let symtab = match kind {
            CtxKind::Block => symtab,
            CtxKind::Body => {
                let n = match name {
                    Some(n) => n.to_string(),
                    None => self.unique_name("__body"),
                };
                let nid = self.heap.new_str(&n);
                let s = self.tree.add(Some(symtab), Some(nid), SymKind::Body);
                self.tree.get_mut(s).payload = SymPayload::Body {
                    level: self.contexts.len(),
                };
                s
            }
            CtxKind::Function => {
                let n = match name {
                    Some(n) => n.to_string(),
                    None => self.unique_name("__function"),
                };
                let nid = self.heap.new_str(&n);
                self.tree.add(Some(symtab), Some(nid), SymKind::Function)
            }
            CtxKind::Module => {
                let nid = name.map(|n| self.heap.new_str(n));
                self.tree.add(Some(self.root_symtab), nid, SymKind::Module)
            }
        };

        self.contexts.push(Context {
            kind,
            flags,
            symtab,
            startpos: 0,
            end_jumps: Vec::new(),
            cont_jumps: Vec::new(),
            events: vec![EventList::new()],
            // Inherited, so nested constructs can tell what they are
            // directly inside of.
            creator,
            level,
        });

        // The start of a continuable context is a jump target, so it
        // closes the current optimization fragment.
        if flags.contains(CtxFlags::CONTINUABLE) && !self.coders.is_empty() {
            let startpos = self.code_target()?;
            self.ctx_mut().startpos = startpos;
        }
        Ok(())
    }

    /// Pops the current context, propagating its events to the parent.
    pub fn context_pop(&mut self) {
        let ctx = self.contexts.pop().expect("popping an empty context stack");
        let keep_inits = ctx.kind == CtxKind::Block;

        match ctx.kind {
            CtxKind::Module | CtxKind::Block | CtxKind::Body => {
                if let Some(parent) = self.contexts.last_mut() {
                    let mut events = ctx.events;
                    let mut master = events.swap_remove(0);
                    if ctx.flags.contains(CtxFlags::CONDITIONAL) {
                        master.prepare_move_up(keep_inits);
                        parent.events.push(master);
                    } else {
                        master.merge_into(&mut parent.events[0], keep_inits);
                    }
                }
            }
            CtxKind::Function => {
                let is_xblock = self
                    .coders
                    .last()
                    .and_then(|c| self.heap.function(c.func))
                    .is_some_and(|f| f.flags.contains(FnFlags::XBLOCK));
                if is_xblock {
                    if let Some(parent_ix) = self.contexts.len().checked_sub(1) {
                        let mut events = ctx.events;
                        let mut master = events.swap_remove(0);
                        master.prepare_move_up_xblock();
                        self.contexts[parent_ix].events.push(master);
                    }
                }
            }
        }

        if ctx.flags.contains(CtxFlags::OWNS_CODER) {
            let coder = self.coders.pop().expect("context owned a coder but none is open");
            coder.close(self.heap);
        }
    }

    /// Index of the innermost context with any of `flags`, excluding the
    /// root context.
    pub fn find_context_flags(&self, flags: CtxFlags) -> Option<usize> {
        for (i, ctx) in self.contexts.iter().enumerate().rev() {
            if i == 0 {
                break;
            }
            if ctx.flags.intersects(flags) {
                return Some(i);
            }
        }
        None
    }

    /// Index of the innermost function context.
    pub fn find_function_context(&self) -> Option<usize> {
        self.contexts.iter().rposition(|c| c.kind == CtxKind::Function)
    }

    // ---- Event recording -------------------------------------------

    pub fn e_exit(&mut self) {
        self.ctx_mut().events[0].set_exit();
    }

    pub fn e_return(&mut self) {
        self.ctx_mut().events[0].set_return();
    }

    pub fn e_result(&mut self) {
        self.ctx_mut().events[0].set_result();
    }

    pub fn e_target(&mut self, st: CeState) {
        self.ctx_mut().events[0].set_target(st);
    }

    /// Records a `break` escaping up to the context at stack index
    /// `target`.
    pub fn e_break(&mut self, target: usize) {
        let depth = i32::try_from(self.ctx().level - self.contexts[target].level + 1).unwrap_or(i32::MAX);
        self.ctx_mut().events[0].set_break(depth);
    }

    /// Records the initialization of variable symbol `sym`.
    pub fn e_init(&mut self, sym: SymbolId) -> CompileResult<()> {
        let (_, location) = self.tree.get(sym).var();
        if self.test_init(sym) != CeState::No {
            let name = self.sym_name(sym);
            return Err(self.ierror(format!("Variable '{name}' has already been initialized!")));
        }
        let Ok(reg) = usize::try_from(location) else {
            let name = self.sym_name(sym);
            return Err(self.ierror(format!("Variable '{name}' is located in an out of range register!")));
        };
        if reg > MAX_REG {
            let name = self.sym_name(sym);
            return Err(self.ierror(format!("Variable '{name}' is located in an out of range register!")));
        }
        self.ctx_mut().events[0].set_init(reg);
        Ok(())
    }

    /// Folds collected branch sibling lists into the current context's
    /// master list.
    pub fn e_merge(&mut self, modulator: CeState) {
        let ctx = self.ctx_mut();
        if ctx.events.len() < 2 {
            return;
        }
        let branches: Vec<EventList> = ctx.events.drain(1..).collect();
        merge_branches(&mut ctx.events[0], &branches, modulator);
    }

    // ---- Event tests -----------------------------------------------

    /// Maximum of an event over the current context and its ancestors,
    /// stopping at (and including) the function boundary.
    fn walk_ev(&self, get: impl Fn(&EventList) -> CeState) -> CeState {
        let mut result = CeState::No;
        for ctx in self.contexts.iter().rev() {
            let st = get(&ctx.events[0]);
            if st > result {
                result = st;
                if result == CeState::Yes {
                    break;
                }
            }
            if ctx.kind == CtxKind::Function {
                break;
            }
        }
        result
    }

    /// Has control certainly/maybe left the current emission point?
    /// Combines exit, return and break events; a backward-jump target at
    /// the current position re-enables emission.
    pub fn test_exit(&self) -> CeState {
        let ctx = self.ctx();
        if ctx.events[0].target == CeState::Yes {
            return CeState::No;
        }
        let ex = self.walk_ev(|e| e.exit);
        if ex == CeState::Yes {
            return CeState::Yes;
        }
        let ret = self.walk_ev(|e| e.ret);
        if ret == CeState::Yes {
            return CeState::Yes;
        }
        let brk = ctx.events[0].break_state();
        if brk == CeState::Yes {
            return CeState::Yes;
        }
        if ex == CeState::No && ret == CeState::No && brk == CeState::No {
            CeState::No
        } else {
            CeState::Maybe
        }
    }

    /// Initialization state of variable symbol `sym` at the current
    /// emission point.
    pub fn test_init(&self, sym: SymbolId) -> CeState {
        let (_, location) = self.tree.get(sym).var();
        let Ok(reg) = usize::try_from(location) else {
            return CeState::No;
        };
        if reg > MAX_REG {
            return CeState::No;
        }
        self.walk_ev(|e| e.init(reg))
    }

    /// Has the function result been initialized?
    pub fn test_result(&self) -> CeState {
        self.walk_ev(|e| e.result)
    }

    /// Counts certain initializations visible from the context at stack
    /// index `idx`, walking up to the function boundary; errors when any
    /// variable is only maybe-initialized.
    pub fn initializations_at(&mut self, idx: usize) -> CompileResult<usize> {
        let mut count = 0usize;
        for i in (0..=idx).rev() {
            match self.contexts[i].events[0].count_certain_inits() {
                Ok(n) => count += n,
                Err(mut e) => {
                    let (line, col) = self.here();
                    e.line = line;
                    e.col = col;
                    return Err(e);
                }
            }
            if self.contexts[i].kind == CtxKind::Function {
                break;
            }
        }
        Ok(count)
    }

    /// Counts certain initializations at the current context.
    pub fn initializations(&mut self) -> CompileResult<usize> {
        let idx = self.contexts.len() - 1;
        self.initializations_at(idx)
    }

    /// Do variable initializations survive leaving the context at `idx`
    /// (so its variables must NOT be cleaned)?
    pub fn keep_variables(&self, idx: usize) -> bool {
        self.contexts[idx].kind == CtxKind::Block
    }

    /// The display name of a symbol, for diagnostics.
    pub fn sym_name(&self, sym: SymbolId) -> String {
        match self.tree.get(sym).name {
            Some(n) => self.heap.str_lossy(n),
            None => "<anonymous>".to_string(),
        }
    }

    /// Raises an `Init` error unless initialization state is certain at
    /// this point, mirroring the checks done before `RETURN`-class
    /// instructions.
    pub fn require_certain_inits(&mut self) -> CompileResult<()> {
        self.initializations().map(|_| ())
    }

    /// Stack index of the context a named body symbol is bound to, while
    /// that body is still open.
    pub fn body_context_index(&self, sym: SymbolId) -> Option<usize> {
        match self.tree.get(sym).payload {
            SymPayload::Body { level } => Some(level),
            _ => None,
        }
    }
}
