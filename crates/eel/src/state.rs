//! Compile state.
//!
//! One [`Cc`] exists per module compilation. It borrows the persistent
//! pieces owned by the public [`Compiler`](crate::Compiler) (heap, symbol
//! tree, options) and owns everything transient: the source reader, the
//! lexer state, the context stack, the coder stack and the manipulator
//! slab. The parser, lexer, coder and optimiser are all implemented as
//! `impl Cc` blocks in their own modules.

use crate::{
    config::CompileOptions,
    context::Context,
    coder::Coder,
    diag::{CompileError, ErrorKind, Warning, WarningSink},
    heap::{Heap, HeapId},
    lexer::{LexItem, Lval, Qualifiers, Token},
    manip::ManipSlot,
    source::SourceReader,
    symtab::{SymTree, SymbolId},
};

pub(crate) struct Cc<'a> {
    pub heap: &'a mut Heap,
    pub tree: &'a mut SymTree,
    /// Root namespace holding keywords, operators and classes.
    pub root_symtab: SymbolId,
    pub options: CompileOptions,
    pub sink: &'a mut dyn WarningSink,

    pub reader: SourceReader<'a>,
    /// Module under compilation.
    pub module: HeapId,
    /// The module's scope symbol, once the module context is open.
    pub module_symtab: Option<SymbolId>,
    /// Symbols for the stripped-source token bytes, in token order.
    pub strip_tokens: &'a [SymbolId],

    // Lexer state
    pub token: Token,
    pub lval: Lval,
    pub lex_stack: [LexItem; 2],
    pub qualifiers: Qualifiers,
    /// While set, identifier lookups find nothing, so field names lex as
    /// plain names regardless of what is in scope.
    pub lex_hidden_scope: bool,

    // Compile structure
    pub contexts: Vec<Context>,
    pub coders: Vec<Coder>,

    // Manipulator slab
    pub manips: Vec<ManipSlot>,
    pub free_manips: Vec<u32>,

    unique: u32,
}

impl<'a> Cc<'a> {
    pub fn new(
        heap: &'a mut Heap,
        tree: &'a mut SymTree,
        root_symtab: SymbolId,
        options: CompileOptions,
        sink: &'a mut dyn WarningSink,
        source: &'a [u8],
        module: HeapId,
        strip_tokens: &'a [SymbolId],
    ) -> Self {
        Self {
            heap,
            tree,
            root_symtab,
            options,
            sink,
            reader: SourceReader::new(source),
            module,
            module_symtab: None,
            strip_tokens,
            token: Token::Eof,
            lval: Lval::None,
            lex_stack: [LexItem::default(), LexItem::default()],
            qualifiers: Qualifiers::empty(),
            lex_hidden_scope: false,
            contexts: Vec::new(),
            coders: Vec::new(),
            manips: Vec::new(),
            free_manips: Vec::new(),
            unique: 0,
        }
    }

    /// Current (innermost) context.
    pub fn ctx(&self) -> &Context {
        self.contexts.last().expect("no open context")
    }

    pub fn ctx_mut(&mut self) -> &mut Context {
        self.contexts.last_mut().expect("no open context")
    }

    /// Current (innermost) coder.
    pub fn cdr(&self) -> &Coder {
        self.coders.last().expect("no open coder")
    }

    pub fn cdr_mut(&mut self) -> &mut Coder {
        self.coders.last_mut().expect("no open coder")
    }

    /// Current scope.
    pub fn symtab(&self) -> SymbolId {
        self.ctx().symtab
    }

    /// Source line/column at the current read position.
    pub fn here(&mut self) -> (usize, usize) {
        let pos = self.reader.tell();
        self.reader.linecount(pos).unwrap_or((0, 0))
    }

    /// Source line at the current read position, for lineinfo entries.
    pub fn line(&mut self) -> i32 {
        let (line, _) = self.here();
        i32::try_from(line).unwrap_or(i32::MAX)
    }

    /// Builds a compile error of `kind` at the current source position.
    pub fn error(&mut self, kind: ErrorKind, message: impl Into<String>) -> CompileError {
        let (line, col) = self.here();
        CompileError {
            kind,
            message: message.into(),
            line,
            col,
        }
    }

    /// Internal (invariant violation) error.
    pub fn ierror(&mut self, message: impl Into<String>) -> CompileError {
        self.error(ErrorKind::Internal, message)
    }

    /// Emits a warning through the sink.
    pub fn warn(&mut self, message: impl Into<String>) {
        let (line, col) = self.here();
        self.sink.warning(&Warning {
            message: message.into(),
            line,
            col,
        });
    }

    /// A compilation-unique name with the given prefix, for anonymous
    /// scopes and generated functions.
    pub fn unique_name(&mut self, prefix: &str) -> String {
        self.unique += 1;
        format!("{prefix}#{}", self.unique)
    }

    /// Symbol bound to a stripped-source token byte, if registered.
    pub fn strip_token(&self, ix: usize) -> Option<SymbolId> {
        self.strip_tokens.get(ix).copied()
    }

    /// Releases every manipulator still in the slab. Run at the end of a
    /// compilation (successful or not) so constant manipulators cannot
    /// leak heap references.
    pub fn free_all_manips(&mut self) {
        let slots = std::mem::take(&mut self.manips);
        for slot in slots {
            slot.release(self.heap);
        }
        self.free_manips.clear();
    }
}

/// `Ok` rule results for the recursive descent functions; `Wrong` (no
/// match, state restored) travels in `Option`/dedicated variants rather
/// than the error channel so real errors stay fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rule {
    /// Rule did not match; lexer state was restored.
    Wrong,
    /// Rule matched but produced no value.
    Void,
    /// Rule matched and produced value(s).
    Matched,
    /// End of input reached.
    Eof,
}
