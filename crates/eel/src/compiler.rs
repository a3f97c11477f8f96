//! The public compiler front.
//!
//! A [`Compiler`] owns the heap, the symbol tree (with the built-in
//! keywords, operators and classes registered under the root namespace),
//! and the compile options. Each call to [`Compiler::compile`] runs the
//! whole pipeline over one module source and returns the compiled module
//! object; native host functions can be registered up front so scripts
//! can call them.

use strum::IntoEnumIterator;

use crate::{
    config::CompileOptions,
    diag::{CompileResult, StderrWarnings, WarningSink},
    heap::{ClassDef, EelBody, FnBody, FnFlags, Function, Heap, HeapData, HeapId, Metamethods, NativeFn},
    lexer::Keyword,
    opcode,
    operate::Operator,
    state::Cc,
    symtab::{OpDesc, SymKind, SymPayload, SymTree, SymbolId},
    value::{ClassId, Value},
};

/// Built-in class registrations: source name, class id, metamethods.
const CLASSES: &[(&str, ClassId, Metamethods)] = &[
    ("real", ClassId::Real, Metamethods::empty()),
    ("integer", ClassId::Integer, Metamethods::empty()),
    ("boolean", ClassId::Boolean, Metamethods::empty()),
    ("typeid", ClassId::TypeId, Metamethods::empty()),
    (
        "string",
        ClassId::String,
        Metamethods::GETINDEX
            .union(Metamethods::LENGTH)
            .union(Metamethods::COMPARE)
            .union(Metamethods::EQ)
            .union(Metamethods::IN)
            .union(Metamethods::CASTS)
            .union(Metamethods::CLONE)
            .union(Metamethods::ARITHMETIC),
    ),
    ("function", ClassId::Function, Metamethods::empty()),
    ("module", ClassId::Module, Metamethods::GETINDEX),
    (
        "table",
        ClassId::Table,
        Metamethods::GETINDEX
            .union(Metamethods::SETINDEX)
            .union(Metamethods::LENGTH)
            .union(Metamethods::COMPARE)
            .union(Metamethods::EQ)
            .union(Metamethods::IN)
            .union(Metamethods::CLONE),
    ),
    (
        "array",
        ClassId::Array,
        Metamethods::GETINDEX
            .union(Metamethods::SETINDEX)
            .union(Metamethods::LENGTH)
            .union(Metamethods::COMPARE)
            .union(Metamethods::EQ)
            .union(Metamethods::IN)
            .union(Metamethods::CLONE),
    ),
    (
        "vector",
        ClassId::VectorF64,
        Metamethods::GETINDEX
            .union(Metamethods::SETINDEX)
            .union(Metamethods::LENGTH)
            .union(Metamethods::COMPARE)
            .union(Metamethods::EQ)
            .union(Metamethods::IN)
            .union(Metamethods::CLONE)
            .union(Metamethods::ARITHMETIC),
    ),
    (
        "vector_d",
        ClassId::VectorF64,
        Metamethods::GETINDEX
            .union(Metamethods::SETINDEX)
            .union(Metamethods::LENGTH)
            .union(Metamethods::COMPARE)
            .union(Metamethods::EQ)
            .union(Metamethods::IN)
            .union(Metamethods::CLONE)
            .union(Metamethods::ARITHMETIC),
    ),
    (
        "vector_f",
        ClassId::VectorF32,
        Metamethods::GETINDEX
            .union(Metamethods::SETINDEX)
            .union(Metamethods::LENGTH)
            .union(Metamethods::COMPARE)
            .union(Metamethods::EQ)
            .union(Metamethods::IN)
            .union(Metamethods::CLONE)
            .union(Metamethods::ARITHMETIC),
    ),
    // The dynamic-string class of the runtime; compile-time strings are
    // always interned, so it shares the string descriptor here.
    (
        "dstring",
        ClassId::String,
        Metamethods::GETINDEX
            .union(Metamethods::LENGTH)
            .union(Metamethods::COMPARE)
            .union(Metamethods::EQ)
            .union(Metamethods::IN)
            .union(Metamethods::CASTS)
            .union(Metamethods::CLONE),
    ),
];

struct OpReg {
    name: &'static str,
    binary: Option<Operator>,
    unary: Option<Operator>,
    lpri: i32,
    rpri: i32,
    un_pri: i32,
    no_short: bool,
}

const fn binop(name: &'static str, op: Operator, pri: i32) -> OpReg {
    OpReg {
        name,
        binary: Some(op),
        unary: None,
        lpri: pri,
        rpri: pri,
        un_pri: 0,
        no_short: false,
    }
}

const fn cmpop(name: &'static str, op: Operator, pri: i32) -> OpReg {
    OpReg {
        name,
        binary: Some(op),
        unary: None,
        lpri: pri,
        rpri: pri,
        un_pri: 0,
        no_short: true,
    }
}

const fn unop(name: &'static str, op: Operator) -> OpReg {
    OpReg {
        name,
        binary: None,
        unary: Some(op),
        lpri: 0,
        rpri: 0,
        un_pri: 100,
        no_short: false,
    }
}

/// Operator registrations with their pre-0.3.7 priorities (kept only for
/// the compatibility warning).
const OPERATORS: &[OpReg] = &[
    binop("+", Operator::Add, 80),
    OpReg {
        name: "-",
        binary: Some(Operator::Sub),
        unary: Some(Operator::Neg),
        lpri: 80,
        rpri: 80,
        un_pri: 100,
        no_short: false,
    },
    binop("*", Operator::Mul, 90),
    binop("/", Operator::Div, 90),
    binop("%", Operator::Mod, 90),
    OpReg {
        name: "**",
        binary: Some(Operator::Power),
        unary: None,
        lpri: 110,
        rpri: 109,
        un_pri: 0,
        no_short: false,
    },
    binop("&", Operator::BAnd, 40),
    binop("|", Operator::BOr, 36),
    binop("^", Operator::BXor, 38),
    binop("<<", Operator::Shl, 70),
    binop(">>", Operator::Shr, 70),
    cmpop("==", Operator::Eq, 50),
    cmpop("!=", Operator::Ne, 50),
    cmpop("<", Operator::Lt, 60),
    cmpop("<=", Operator::Le, 60),
    cmpop(">", Operator::Gt, 60),
    cmpop(">=", Operator::Ge, 60),
    unop("~", Operator::BNot),
    cmpop("and", Operator::And, 30),
    cmpop("or", Operator::Or, 26),
    cmpop("xor", Operator::Xor, 28),
    cmpop("in", Operator::In, 55),
    binop("min", Operator::Min, 45),
    binop("max", Operator::Max, 45),
    binop("rol", Operator::Rol, 70),
    binop("ror", Operator::Ror, 70),
    binop("brev", Operator::BRev, 70),
    unop("not", Operator::Not),
    unop("typeof", Operator::TypeOf),
    unop("sizeof", Operator::SizeOf),
    unop("clone", Operator::Clone),
];

/// Names bound to the stripped-source token bytes, in token order:
/// keywords first, then operator words, then value types, then classes.
const STRIP_EXTRAS: &[&str] = &[
    "typeof", "sizeof", "clone", "not", "and", "or", "xor", "in", "real", "integer", "boolean", "typeid",
    "string", "function", "module", "array", "table", "vector", "vector_d", "vector_f", "dstring",
];

/// The EEL compiler.
pub struct Compiler {
    heap: Heap,
    tree: SymTree,
    root: SymbolId,
    /// Owns natively registered functions.
    host_module: HeapId,
    strip_tokens: Vec<SymbolId>,
    pub options: CompileOptions,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompileOptions::default())
    }
}

impl Compiler {
    #[must_use]
    pub fn new(options: CompileOptions) -> Self {
        let mut heap = Heap::new();
        let mut tree = SymTree::new();
        let root = tree.add(None, None, SymKind::Namespace);

        // Keywords
        for kw in Keyword::iter() {
            let name: &'static str = kw.into();
            let nid = heap.new_str(name);
            let s = tree.add(Some(root), Some(nid), SymKind::Keyword);
            tree.get_mut(s).payload = SymPayload::Keyword(kw);
        }

        // Classes
        for &(name, class, mmethods) in CLASSES {
            let nid = heap.new_str(name);
            heap.own(nid);
            let cd = heap.alloc(HeapData::ClassDef(ClassDef {
                class,
                name: nid,
                mmethods,
            }));
            let s = tree.add(Some(root), Some(nid), SymKind::Class);
            tree.get_mut(s).payload = SymPayload::Object(cd);
        }

        // Operators
        for op in OPERATORS {
            let nid = heap.new_str(op.name);
            let s = tree.add(Some(root), Some(nid), SymKind::Operator);
            tree.get_mut(s).payload = SymPayload::Operator(OpDesc {
                binary: op.binary,
                unary: op.unary,
                lpri: op.lpri,
                rpri: op.rpri,
                un_pri: op.un_pri,
                no_short: op.no_short,
                no_result: false,
            });
        }

        // Stripped-source token table: keywords, then the extras, all
        // resolved to their root symbols.
        let mut strip_tokens = Vec::new();
        for kw in Keyword::iter() {
            let name: &'static str = kw.into();
            let nid = heap.new_str(name);
            let s = tree.find_in(root, nid, SymKind::Keyword).expect("keyword registered");
            heap.disown(nid);
            strip_tokens.push(s);
        }
        for name in STRIP_EXTRAS {
            let nid = heap.new_str(name);
            let s = tree
                .find_in(root, nid, SymKind::Operator)
                .or_else(|| tree.find_in(root, nid, SymKind::Class))
                .expect("strip table name registered");
            heap.disown(nid);
            strip_tokens.push(s);
        }

        let host_module = heap.new_module();
        Self {
            heap,
            tree,
            root,
            host_module,
            strip_tokens,
            options,
        }
    }

    /// Registers a native (host) function in the root namespace, with
    /// the given call contract. Scripts can then call it by name.
    pub fn register_native(
        &mut self,
        name: &str,
        reqargs: u8,
        optargs: u8,
        tupargs: u8,
        results: u8,
        callback: NativeFn,
    ) -> HeapId {
        let nid = self.heap.new_str(name);
        // One reference for the function's name, one for the symbol's.
        self.heap.own(nid);
        let mut flags = FnFlags::CFUNC;
        if results > 0 {
            flags |= FnFlags::RESULTS;
        }
        if reqargs > 0 || optargs > 0 || tupargs > 0 {
            flags |= FnFlags::ARGS;
        }
        let fo = self.heap.alloc(HeapData::Function(Function {
            name: nid,
            module: self.host_module,
            flags,
            results,
            reqargs,
            optargs,
            tupargs,
            body: FnBody::Native(callback),
        }));
        self.heap.own(fo);
        self.heap.module_mut(self.host_module).objects.push(fo);
        let s = self.tree.add(Some(self.root), Some(nid), SymKind::Function);
        self.tree.get_mut(s).payload = SymPayload::Object(fo);
        fo
    }

    /// Makes the exports of a compiled module visible to subsequent
    /// compilations, either directly in the root scope or under a
    /// namespace (scripts then write `ns.exported_name`).
    pub fn import_module(&mut self, namespace: Option<&str>, module: HeapId) -> CompileResult<()> {
        let scope = match namespace {
            Some(ns) => {
                let nid = self.heap.new_str(ns);
                if self.tree.find_in(self.root, nid, SymKind::Namespace).is_some() {
                    self.heap.disown(nid);
                    return Err(crate::diag::CompileError {
                        kind: crate::diag::ErrorKind::Scope,
                        message: format!("There already is a namespace '{ns}' in this context!"),
                        line: 0,
                        col: 0,
                    });
                }
                self.tree.add(Some(self.root), Some(nid), SymKind::Namespace)
            }
            None => self.root,
        };
        crate::symtab::import_exports(&mut self.tree, &mut self.heap, scope, module)
    }

    /// Compiles one module, reporting warnings to stderr. Returns the
    /// module object; the caller owns the returned reference.
    pub fn compile(&mut self, source: &[u8], name: &str) -> CompileResult<HeapId> {
        let mut sink = StderrWarnings;
        self.compile_with(source, name, &mut sink)
    }

    /// Compiles one module, routing warnings through `sink`.
    pub fn compile_with(
        &mut self,
        source: &[u8],
        name: &str,
        sink: &mut dyn WarningSink,
    ) -> CompileResult<HeapId> {
        let module = self.heap.new_module();
        {
            let exports = self.heap.module(module).exports;
            let fname = self.heap.new_str(name);
            self.heap.table_set_str(exports, "__filename", Value::ObjRef(fname));
        }

        let mut cc = Cc::new(
            &mut self.heap,
            &mut self.tree,
            self.root,
            self.options.clone(),
            sink,
            source,
            module,
            &self.strip_tokens,
        );
        let result = cc.compile_module();
        let module_symtab = cc.module_symtab;
        cc.free_all_manips();
        drop(cc);

        match result {
            Ok(()) => Ok(module),
            Err(e) => {
                // Unwind: release the module's symbols and the module
                // itself, in LIFO order.
                if let Some(st) = module_symtab {
                    self.tree.free(&mut self.heap, st);
                }
                self.heap.disown(module);
                Err(e)
            }
        }
    }

    /// The object heap, for inspecting compiled output.
    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Releases a module obtained from [`Compiler::compile`].
    pub fn release_module(&mut self, module: HeapId) {
        self.heap.disown(module);
    }

    /// The value exported from `module` under `name`, if any.
    #[must_use]
    pub fn export(&self, module: HeapId, name: &str) -> Option<&Value> {
        let sid = self.heap.find_string(name.as_bytes())?;
        let exports = self.heap.module(module).exports;
        self.heap.table(exports).get(&Value::ObjRef(sid))
    }

    /// Names in a module's export table, in insertion order.
    #[must_use]
    pub fn export_names(&self, module: HeapId) -> Vec<String> {
        let exports = self.heap.module(module).exports;
        self.heap
            .table(exports)
            .iter()
            .filter_map(|(k, _)| k.object().map(|o| self.heap.str_lossy(o)))
            .collect()
    }

    /// The bytecode body of a function object.
    #[must_use]
    pub fn function_body(&self, function: HeapId) -> Option<&EelBody> {
        match &self.heap.function(function)?.body {
            FnBody::Eel(body) => Some(body),
            FnBody::Native(_) => None,
        }
    }

    /// Disassembly of one function.
    #[must_use]
    pub fn disassemble_function(&self, function: HeapId) -> Option<String> {
        let f = self.heap.function(function)?;
        let name = self.heap.str_lossy(f.name);
        let body = self.function_body(function)?;
        Some(format!("{name}:\n{}", opcode::disassemble(body, &self.heap)))
    }

    /// Disassembly of every bytecode function in a module.
    #[must_use]
    pub fn disassemble_module(&self, module: HeapId) -> String {
        let mut out = String::new();
        for &o in &self.heap.module(module).objects {
            if let Some(text) = self.disassemble_function(o) {
                out.push_str(&text);
                out.push('\n');
            }
        }
        out
    }
}
