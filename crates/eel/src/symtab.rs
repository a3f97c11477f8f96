//! The symbol tree and its finder.
//!
//! Symbols form one tree per compilation: a root namespace holding
//! keywords, operators and classes, with module, function and body scopes
//! attached below it. Nodes are arena-allocated and addressed by
//! [`SymbolId`]; names are interned strings, so name matching is id
//! equality.
//!
//! The [`Finder`] is the single lookup primitive. It iterates matches one
//! at a time, optionally recursing up through parent scopes (symbol
//! resolution) or down into child scopes (export scans).

use bitflags::bitflags;

use crate::{
    diag::{CompileError, CompileResult, ErrorKind},
    heap::{Heap, HeapId},
    lexer::Keyword,
    operate::Operator,
    value::{ClassId, Value},
};

/// Index of a symbol in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Symbol kinds.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymKind {
    Undefined = 0,
    Keyword,
    Variable,
    /// Variable explicitly declared as an upvalue in the current scope.
    Upvalue,
    /// Named `{...}` body.
    Body,
    Namespace,
    Constant,
    Class,
    Module,
    Function,
    Operator,
}

bitflags! {
    /// Kind masks for the finder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SymKinds: u16 {
        const UNDEFINED = 1 << 0;
        const KEYWORD = 1 << 1;
        const VARIABLE = 1 << 2;
        const UPVALUE = 1 << 3;
        const BODY = 1 << 4;
        const NAMESPACE = 1 << 5;
        const CONSTANT = 1 << 6;
        const CLASS = 1 << 7;
        const MODULE = 1 << 8;
        const FUNCTION = 1 << 9;
        const OPERATOR = 1 << 10;
    }
}

impl SymKind {
    #[must_use]
    pub fn mask(self) -> SymKinds {
        SymKinds::from_bits_truncate(1 << (self as u16))
    }
}

/// Where a variable's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// Register in the function frame.
    Stack,
    /// Slot in the module's static variable table.
    Static,
    /// Required argument.
    Argument,
    /// Optional argument.
    OptArg,
    /// Tuple argument member.
    TupArg,
}

/// Operator descriptor attached to operator symbols.
///
/// The priorities are the pre-0.3.7 ones; evaluation no longer uses them,
/// but the parser still compares them to warn when an expression would
/// have evaluated differently under the old rules.
#[derive(Debug, Clone, Copy)]
pub struct OpDesc {
    /// Binary operator code, if the operator has a binary form.
    pub binary: Option<Operator>,
    /// Unary operator code, if the operator has a unary form.
    pub unary: Option<Operator>,
    pub lpri: i32,
    pub rpri: i32,
    pub un_pri: i32,
    /// Never usable as the base of a `<op>=` shorthand.
    pub no_short: bool,
    /// Application produces no value.
    pub no_result: bool,
}

/// Kind-specific payload of a symbol.
#[derive(Debug)]
pub enum SymPayload {
    None,
    Keyword(Keyword),
    Var {
        kind: VarKind,
        /// Register index, static table index, or argument index.
        location: i32,
    },
    /// Owned constant value.
    Constant(Value),
    /// Owned object reference (class descriptor, module, or function).
    Object(HeapId),
    Operator(OpDesc),
    /// Context stack depth of a named body, while it is open.
    Body { level: usize },
}

/// One symbol tree node.
#[derive(Debug)]
pub struct Symbol {
    pub parent: Option<SymbolId>,
    pub children: Vec<SymbolId>,
    /// Interned name (owned); anonymous scopes have none.
    pub name: Option<HeapId>,
    pub kind: SymKind,
    /// Function nesting level; the difference between a reference's level
    /// and its definition's level is the upvalue distance.
    pub uv_level: u32,
    pub payload: SymPayload,
}

impl Symbol {
    #[must_use]
    pub fn var(&self) -> (VarKind, i32) {
        match &self.payload {
            SymPayload::Var { kind, location } => (*kind, *location),
            _ => (VarKind::Stack, -1),
        }
    }

    #[must_use]
    pub fn object(&self) -> Option<HeapId> {
        match &self.payload {
            SymPayload::Object(o) => Some(*o),
            _ => None,
        }
    }
}

/// The symbol tree arena.
#[derive(Debug, Default)]
pub struct SymTree {
    syms: Vec<Symbol>,
}

impl SymTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.syms[id.index()]
    }

    #[must_use]
    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.syms[id.index()]
    }

    /// Adds a symbol under `parent`. The name reference, if any, must be
    /// owned by the caller; ownership moves to the symbol. The new symbol
    /// inherits its parent's uv-level; function symbols bump it for their
    /// children.
    pub fn add(&mut self, parent: Option<SymbolId>, name: Option<HeapId>, kind: SymKind) -> SymbolId {
        let uv_level = match parent {
            Some(p) => self.get(p).uv_level,
            None => 0,
        };
        let id = SymbolId(u32::try_from(self.syms.len()).expect("symbol arena exhausted"));
        self.syms.push(Symbol {
            parent,
            children: Vec::new(),
            name,
            kind,
            uv_level: uv_level + u32::from(kind == SymKind::Function),
            payload: SymPayload::None,
        });
        if let Some(p) = parent {
            self.syms[p.index()].children.push(id);
        }
        id
    }

    /// Renames a symbol, releasing the previous name.
    pub fn rename(&mut self, heap: &mut Heap, id: SymbolId, name: HeapId) {
        let old = self.get_mut(id).name.replace(name);
        if let Some(old) = old {
            heap.disown(old);
        }
    }

    /// Detaches `id` from its parent and releases the whole subtree:
    /// names, constant values and object payloads are disowned.
    pub fn free(&mut self, heap: &mut Heap, id: SymbolId) {
        if let Some(p) = self.get(id).parent {
            let parent = self.get_mut(p);
            parent.children.retain(|c| *c != id);
        }
        self.free_subtree(heap, id);
    }

    fn free_subtree(&mut self, heap: &mut Heap, id: SymbolId) {
        let children = std::mem::take(&mut self.get_mut(id).children);
        for c in children {
            self.free_subtree(heap, c);
        }
        let sym = self.get_mut(id);
        sym.kind = SymKind::Undefined;
        if let Some(name) = sym.name.take() {
            heap.disown(name);
        }
        match std::mem::replace(&mut sym.payload, SymPayload::None) {
            SymPayload::Constant(v) => v.drop_with_heap(heap),
            SymPayload::Object(o) => heap.disown(o),
            _ => {}
        }
    }

    /// First direct child of `table` with the given name and kind.
    #[must_use]
    pub fn find_in(&self, table: SymbolId, name: HeapId, kind: SymKind) -> Option<SymbolId> {
        self.get(table)
            .children
            .iter()
            .copied()
            .find(|&c| self.get(c).kind == kind && self.get(c).name == Some(name))
    }
}

bitflags! {
    /// Finder behavior flags. `RECURSE_UP` and `RECURSE_DOWN` are
    /// mutually exclusive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FindFlags: u8 {
        const MATCH_NAME = 0x01;
        const MATCH_KINDS = 0x02;
        const RECURSE_UP = 0x10;
        const RECURSE_DOWN = 0x20;
    }
}

/// Iterating symbol search.
///
/// Each call to [`Finder::next`] yields the next symbol matching the
/// name (if requested) and kind mask. Downward recursion descends into a
/// matching symbol's children immediately; upward recursion continues in
/// the parent table once the current one is exhausted.
#[derive(Debug)]
pub struct Finder {
    start: SymbolId,
    table: SymbolId,
    pos: usize,
    pub name: Option<HeapId>,
    pub kinds: SymKinds,
    pub flags: FindFlags,
    done: bool,
}

impl Finder {
    #[must_use]
    pub fn new(start: SymbolId, flags: FindFlags) -> Self {
        debug_assert!(
            !flags.contains(FindFlags::RECURSE_UP | FindFlags::RECURSE_DOWN),
            "UP and DOWN recursion cannot be combined"
        );
        Self {
            start,
            table: start,
            pos: 0,
            name: None,
            kinds: SymKinds::all(),
            flags,
            done: false,
        }
    }

    /// Advances to the next match, or `None` when the walk is complete.
    pub fn next(&mut self, tree: &SymTree) -> Option<SymbolId> {
        if self.done {
            return None;
        }
        loop {
            let children = &tree.get(self.table).children;
            if self.pos >= children.len() {
                if self.flags.contains(FindFlags::RECURSE_UP) {
                    let Some(parent) = tree.get(self.table).parent else {
                        self.done = true;
                        return None;
                    };
                    self.table = parent;
                    self.pos = 0;
                    continue;
                }
                if self.flags.contains(FindFlags::RECURSE_DOWN) {
                    if self.table == self.start {
                        self.done = true;
                        return None;
                    }
                    // End of a child table: resume in the parent right
                    // after the symbol we descended into.
                    let here = self.table;
                    let parent = tree.get(here).parent.expect("walk escaped the start scope");
                    let at = tree
                        .get(parent)
                        .children
                        .iter()
                        .position(|&c| c == here)
                        .expect("child not linked to parent");
                    self.table = parent;
                    self.pos = at + 1;
                    continue;
                }
                self.done = true;
                return None;
            }

            let sym = children[self.pos];
            self.pos += 1;

            let s = tree.get(sym);
            let mut hit = true;
            if self.flags.contains(FindFlags::MATCH_NAME) {
                if let Some(name) = self.name {
                    if s.name != Some(name) {
                        hit = false;
                    }
                }
            }
            if hit && self.flags.contains(FindFlags::MATCH_KINDS) && !self.kinds.contains(s.kind.mask()) {
                hit = false;
            }

            // Record downward descent before yielding the hit, so the
            // next call continues inside.
            if !s.children.is_empty()
                && self.flags.contains(FindFlags::RECURSE_DOWN)
                && (!self.flags.contains(FindFlags::MATCH_KINDS) || self.kinds.contains(s.kind.mask()))
            {
                self.table = sym;
                self.pos = 0;
            }

            if hit {
                return Some(sym);
            }
        }
    }
}

/// Imports the exports of module object `module` as symbols under `scope`.
///
/// `__init_module`, `__modname` and `__filename` entries are skipped. A
/// function-kind symbol with a conflicting name raises a scope error.
/// Everything else becomes a Function, Class or Constant symbol depending
/// on the export's class.
pub fn import_exports(
    tree: &mut SymTree,
    heap: &mut Heap,
    scope: SymbolId,
    module: HeapId,
) -> CompileResult<()> {
    let skip: Vec<HeapId> = ["__init_module", "__modname", "__filename"]
        .iter()
        .map(|s| heap.new_str(s))
        .collect();
    let exports = heap.module(module).exports;
    let count = heap.table(exports).len();
    for i in 0..count {
        let (k, v) = {
            let t = heap.table(exports);
            let (k, v) = t.item(i).expect("export table shrank during import");
            (k.raw_copy(), v.raw_copy())
        };
        let Value::ObjRef(name) = k else {
            return Err(CompileError {
                kind: ErrorKind::Internal,
                message: "module export with a non-string name".to_string(),
                line: 0,
                col: 0,
            });
        };
        if skip.contains(&name) {
            continue;
        }

        let mut finder = Finder::new(scope, FindFlags::MATCH_NAME | FindFlags::MATCH_KINDS);
        finder.name = Some(name);
        finder.kinds = SymKinds::FUNCTION;
        if finder.next(tree).is_some() {
            let n = heap.str_lossy(name);
            for &s in &skip {
                heap.disown(s);
            }
            return Err(CompileError {
                kind: ErrorKind::Scope,
                message: format!("Export '{n}' causes a conflict!"),
                line: 0,
                col: 0,
            });
        }

        let kind = match v.object().map(|o| heap.class_of(o)) {
            Some(ClassId::Function) => SymKind::Function,
            Some(ClassId::ClassDef) => SymKind::Class,
            _ => SymKind::Constant,
        };
        heap.own(name);
        let sym = tree.add(Some(scope), Some(name), kind);
        tree.get_mut(sym).payload = match kind {
            SymKind::Function | SymKind::Class => {
                let o = v.object().expect("function/class export without object");
                heap.own(o);
                SymPayload::Object(o)
            }
            _ => SymPayload::Constant(v.clone_with_heap(heap)),
        };
    }
    for &s in &skip {
        heap.disown(s);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn setup() -> (SymTree, Heap, SymbolId) {
        let mut tree = SymTree::new();
        let root = tree.add(None, None, SymKind::Namespace);
        (tree, Heap::new(), root)
    }

    #[test]
    fn uv_level_bumps_under_functions() {
        let (mut tree, mut heap, root) = setup();
        let n = heap.new_str("f");
        let f = tree.add(Some(root), Some(n), SymKind::Function);
        let n2 = heap.new_str("g");
        let g = tree.add(Some(f), Some(n2), SymKind::Function);
        assert_eq!(tree.get(root).uv_level, 0);
        assert_eq!(tree.get(f).uv_level, 1);
        assert_eq!(tree.get(g).uv_level, 2);
    }

    #[test]
    fn finder_matches_name_and_kind_upward() {
        let (mut tree, mut heap, root) = setup();
        let name = heap.new_str("x");
        heap.own(name);
        let outer = tree.add(Some(root), Some(name), SymKind::Variable);
        let scope = tree.add(Some(root), None, SymKind::Function);

        let mut f = Finder::new(scope, FindFlags::MATCH_NAME | FindFlags::MATCH_KINDS | FindFlags::RECURSE_UP);
        f.name = Some(name);
        f.kinds = SymKinds::VARIABLE;
        assert_eq!(f.next(&tree), Some(outer));
        assert_eq!(f.next(&tree), None);
    }

    #[test]
    fn finder_local_only_does_not_climb() {
        let (mut tree, mut heap, root) = setup();
        let name = heap.new_str("x");
        tree.add(Some(root), Some(name), SymKind::Variable);
        let scope = tree.add(Some(root), None, SymKind::Function);

        let mut f = Finder::new(scope, FindFlags::MATCH_NAME | FindFlags::MATCH_KINDS);
        f.name = Some(name);
        f.kinds = SymKinds::VARIABLE;
        assert_eq!(f.next(&tree), None);
    }

    #[test]
    fn finder_down_walk_visits_nested_scopes() {
        let (mut tree, mut heap, root) = setup();
        let fname = heap.new_str("f");
        let f = tree.add(Some(root), Some(fname), SymKind::Function);
        let vname = heap.new_str("v");
        let v = tree.add(Some(f), Some(vname), SymKind::Variable);
        let wname = heap.new_str("w");
        let w = tree.add(Some(root), Some(wname), SymKind::Variable);

        let mut found = Vec::new();
        let mut fd = Finder::new(root, FindFlags::MATCH_KINDS | FindFlags::RECURSE_DOWN);
        fd.kinds = SymKinds::VARIABLE | SymKinds::FUNCTION;
        while let Some(s) = fd.next(&tree) {
            found.push(s);
        }
        assert_eq!(found, vec![f, v, w]);
    }

    #[test]
    fn free_releases_names_and_payloads() {
        let (mut tree, mut heap, root) = setup();
        let name = heap.new_str("c");
        let s = tree.add(Some(root), Some(name), SymKind::Constant);
        let strval = heap.new_str("payload");
        tree.get_mut(s).payload = SymPayload::Constant(Value::ObjRef(strval));
        tree.free(&mut heap, s);
        assert!(!heap.is_alive(name));
        assert!(!heap.is_alive(strval));
        assert!(tree.get(root).children.is_empty());
    }

    #[test]
    fn export_import_creates_symbols_and_rejects_conflicts() {
        let (mut tree, mut heap, root) = setup();
        let module = heap.new_module();
        let exports = heap.module(module).exports;
        heap.table_set_str(exports, "__init_module", Value::Integer(0));
        heap.table_set_str(exports, "answer", Value::Integer(42));

        import_exports(&mut tree, &mut heap, root, module).unwrap();
        let name = heap.new_str("answer");
        let sym = tree.find_in(root, name, SymKind::Constant).expect("imported constant");
        assert!(matches!(tree.get(sym).payload, SymPayload::Constant(Value::Integer(42))));
        heap.disown(name);

        // A conflicting function symbol blocks a function import.
        let fname = heap.new_str("clash");
        let _fs = tree.add(Some(root), Some(fname), SymKind::Function);
        let eel_name = heap.new_str("clash");
        let fobj = heap.alloc(crate::heap::HeapData::Function(crate::heap::Function {
            name: eel_name,
            module,
            flags: crate::heap::FnFlags::empty(),
            results: 0,
            reqargs: 0,
            optargs: 0,
            tupargs: 0,
            body: crate::heap::FnBody::Eel(crate::heap::EelBody::default()),
        }));
        heap.table_set_str(exports, "clash", Value::ObjRef(fobj));
        assert_eq!(
            import_exports(&mut tree, &mut heap, root, module).unwrap_err().kind,
            ErrorKind::Scope
        );
    }
}
