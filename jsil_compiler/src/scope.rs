//! Read-only lexical scope tree consumed by the code generator.
//!
//! The tree is produced once by [`builder::build_scope_tree`] and never mutated
//! afterwards: every accessor here takes `&self`.

use std::collections::HashMap;

use slotmap::SlotMap;
use swc_atoms::JsWord;
use swc_common::{BytePos, Span};

use crate::bytecode::ClrType;

pub mod builder;

slotmap::new_key_type! {
    pub struct ScopeId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Function,
    Block,
    Class,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Var,
    Let,
    Const,
    Param,
    Function,
    Class,
}

/// Statically inferred JS type of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JsType {
    Unknown,
    Number,
    Boolean,
    String,
    Object,
    Undefined,
    Null,
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub name: JsWord,
    pub kind: BindingKind,
    /// Read or written from a nested function or class.
    pub is_captured: bool,
    /// Holds a single JS type across all of its writes.
    pub is_stable_type: bool,
    /// Meaningful only when `is_stable_type`.
    pub inferred: JsType,
    /// Written after its declaration.
    pub reassigned: bool,
    /// For parameters, the 0-based JS position.
    pub param_index: Option<u16>,
    /// Set when the binding is never reassigned and is initialized with
    /// `new C(...)` for a class declaration `C`.
    pub instance_of: Option<ClassRef>,
    pub span: Span,
}

/// A class declaration, named by the scope holding its binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassRef {
    pub decl: ScopeId,
    pub name: JsWord,
}

impl Binding {
    /// Concrete storage type when the binding is stable, if any.
    pub fn clr_type(&self) -> Option<ClrType> {
        if !self.is_stable_type {
            return None;
        }
        match self.inferred {
            JsType::Number => Some(ClrType::Double),
            JsType::Boolean => Some(ClrType::Boolean),
            JsType::String => Some(ClrType::String),
            _ => None,
        }
    }

    /// The type of the slot or field backing this binding.  Only numbers and
    /// booleans are stored unboxed.
    pub fn storage_type(&self) -> ClrType {
        match self.clr_type() {
            Some(ClrType::Double) => ClrType::Double,
            Some(ClrType::Boolean) => ClrType::Boolean,
            _ => ClrType::Object,
        }
    }

    pub fn js_type(&self) -> JsType {
        if self.is_stable_type {
            self.inferred
        } else {
            JsType::Unknown
        }
    }
}

/// Identity of the AST node that introduced a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeKey {
    lo: BytePos,
    hi: BytePos,
}

impl From<Span> for NodeKey {
    fn from(span: Span) -> Self {
        NodeKey {
            lo: span.lo,
            hi: span.hi,
        }
    }
}

#[derive(Debug)]
pub struct Scope {
    pub name: String,
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    pub span: Span,
    pub parameters: Vec<JsWord>,
    /// Name of a function or class expression, bound inside its own scope.
    pub self_name: Option<JsWord>,
    /// Some code in this function (or a function nested in it) reads a
    /// binding declared outside of it.
    pub references_parent_scope_variables: bool,
    bindings: Vec<Binding>,
    binding_ndx: HashMap<JsWord, usize>,
}

impl Scope {
    pub fn binding(&self, name: &JsWord) -> Option<&Binding> {
        self.binding_ndx.get(name).map(|ndx| &self.bindings[*ndx])
    }

    pub fn bindings(&self) -> impl '_ + Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    pub fn has_captured_bindings(&self) -> bool {
        self.bindings.iter().any(|b| b.is_captured)
    }

    /// Owns the storage of its bindings.  A block holding captured bindings
    /// is a frame of its own: every entry into it creates a new instance.
    pub fn is_frame(&self) -> bool {
        match self.kind {
            ScopeKind::Global | ScopeKind::Function => true,
            ScopeKind::Block => self.has_captured_bindings(),
            ScopeKind::Class => false,
        }
    }

    pub fn is_function_level(&self) -> bool {
        matches!(self.kind, ScopeKind::Global | ScopeKind::Function)
    }
}

/// A resolved identifier use that crosses at least one scope.
#[derive(Debug, Clone)]
pub struct Reference {
    pub from: ScopeId,
    pub decl: ScopeId,
    pub name: JsWord,
    pub is_write: bool,
    /// Callee position of a call expression.
    pub is_call: bool,
}

pub struct ScopeTree {
    scopes: SlotMap<ScopeId, Scope>,
    root: ScopeId,
    by_node: HashMap<(NodeKey, ScopeKindTag), ScopeId>,
    references: Vec<Reference>,
}

/// Scopes are looked up by node span *and* by the kind of scope expected at
/// that node, since a class and its implicit constructor share a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ScopeKindTag {
    Frame,
    Block,
    Class,
}

impl ScopeKindTag {
    fn of(kind: ScopeKind) -> Self {
        match kind {
            ScopeKind::Global | ScopeKind::Function => ScopeKindTag::Frame,
            ScopeKind::Block => ScopeKindTag::Block,
            ScopeKind::Class => ScopeKindTag::Class,
        }
    }
}

impl std::ops::Index<ScopeId> for ScopeTree {
    type Output = Scope;

    fn index(&self, id: ScopeId) -> &Scope {
        &self.scopes[id]
    }
}

impl ScopeTree {
    pub fn root(&self) -> ScopeId {
        self.root
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id]
    }

    pub fn iter(&self) -> impl '_ + Iterator<Item = (ScopeId, &Scope)> {
        self.scopes.iter()
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }

    pub fn function_scope(&self, span: Span) -> Option<ScopeId> {
        self.by_node
            .get(&(NodeKey::from(span), ScopeKindTag::Frame))
            .copied()
    }

    pub fn block_scope(&self, span: Span) -> Option<ScopeId> {
        self.by_node
            .get(&(NodeKey::from(span), ScopeKindTag::Block))
            .copied()
    }

    pub fn class_scope(&self, span: Span) -> Option<ScopeId> {
        self.by_node
            .get(&(NodeKey::from(span), ScopeKindTag::Class))
            .copied()
    }

    pub fn ancestors(&self, id: ScopeId) -> impl '_ + Iterator<Item = ScopeId> {
        std::iter::successors(Some(id), move |id| self.scopes[*id].parent)
    }

    /// `name`, resolved in `decl`, is the own name of a function or class
    /// expression.
    pub fn is_self_name(&self, decl: ScopeId, name: &JsWord) -> bool {
        self.scopes[decl].self_name.as_ref() == Some(name)
    }

    pub fn is_within(&self, inner: ScopeId, outer: ScopeId) -> bool {
        self.ancestors(inner).any(|id| id == outer)
    }

    /// Resolve `name` starting at scope `from`, walking outwards.
    pub fn resolve(&self, from: ScopeId, name: &JsWord) -> Option<(ScopeId, &Binding)> {
        self.ancestors(from)
            .find_map(|id| self.scopes[id].binding(name).map(|b| (id, b)))
    }

    /// The nearest enclosing frame, `id` included: the scope whose storage
    /// holds this scope's bindings.
    pub fn frame_of(&self, id: ScopeId) -> ScopeId {
        self.ancestors(id)
            .find(|id| self.scopes[*id].is_frame())
            .unwrap_or(self.root)
    }

    /// The nearest enclosing Global or Function scope, `id` included.
    pub fn function_of(&self, id: ScopeId) -> ScopeId {
        self.ancestors(id)
            .find(|id| self.scopes[*id].is_function_level())
            .unwrap_or(self.root)
    }

    /// Number of frames strictly enclosing `frame`; the global frame has depth 0.
    pub fn frame_depth(&self, frame: ScopeId) -> u16 {
        self.ancestors(frame)
            .skip(1)
            .filter(|id| self.scopes[*id].is_frame())
            .count() as u16
    }

    /// Frames from the global one down to `frame` included.
    pub fn frame_chain(&self, frame: ScopeId) -> Vec<ScopeId> {
        let mut chain: Vec<_> = self
            .ancestors(frame)
            .filter(|id| self.scopes[*id].is_frame())
            .collect();
        chain.reverse();
        chain
    }

    /// Scopes whose bindings are stored in `frame`, `frame` included.
    pub fn frame_members(&self, frame: ScopeId) -> Vec<ScopeId> {
        let mut members = vec![frame];
        self.collect_blocks(frame, true, &mut members);
        members
    }

    /// Every block scope of `function`'s own body, nested blocks included.
    pub fn blocks_within(&self, function: ScopeId) -> Vec<ScopeId> {
        let mut blocks = Vec::new();
        self.collect_blocks(function, false, &mut blocks);
        blocks
    }

    /// The block scopes of `function` that are frames of their own.
    pub fn block_frames_within(&self, function: ScopeId) -> Vec<ScopeId> {
        let mut blocks = self.blocks_within(function);
        blocks.retain(|id| self.scopes[*id].is_frame());
        blocks
    }

    fn collect_blocks(&self, from: ScopeId, stop_at_frames: bool, out: &mut Vec<ScopeId>) {
        for child in &self.scopes[from].children {
            let scope = &self.scopes[*child];
            if scope.kind != ScopeKind::Block || (stop_at_frames && scope.is_frame()) {
                continue;
            }
            out.push(*child);
            self.collect_blocks(*child, stop_at_frames, out);
        }
    }

    /// `global/outer/inner`
    pub fn qualified_name(&self, id: ScopeId) -> String {
        let mut names: Vec<_> = self
            .ancestors(id)
            .map(|id| self.scopes[id].name.as_str())
            .collect();
        names.reverse();
        names.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::builder::build_scope_tree;
    use super::*;

    fn tree(code: &str) -> ScopeTree {
        let (script, _) = crate::bytecode_compiler::parse_script_str(code).unwrap();
        build_scope_tree(&script).unwrap()
    }

    fn find_scope(tree: &ScopeTree, name: &str) -> ScopeId {
        tree.iter()
            .find(|(_, scope)| scope.name == name)
            .map(|(id, _)| id)
            .unwrap()
    }

    fn binding<'a>(tree: &'a ScopeTree, scope: &str, name: &str) -> &'a Binding {
        let id = find_scope(tree, scope);
        tree.get(id).binding(&JsWord::from(name)).unwrap()
    }

    #[test]
    fn test_captured_marking() {
        let tree = tree(
            "
            let counter = 0;
            let untouched = 1;
            function outer() {
                let x = 1;
                let y = 2;
                function inner() { x++; }
                inner();
                return x + y;
            }
            ",
        );

        assert!(binding(&tree, "outer", "x").is_captured);
        assert!(!binding(&tree, "outer", "y").is_captured);
        assert!(!binding(&tree, "global", "untouched").is_captured);
        assert!(!binding(&tree, "global", "counter").is_captured);
        // direct calls do not read the function binding
        assert!(!binding(&tree, "outer", "inner").is_captured);

        let inner = find_scope(&tree, "inner");
        assert!(tree.get(inner).references_parent_scope_variables);
        let outer = find_scope(&tree, "outer");
        assert!(!tree.get(outer).references_parent_scope_variables);
    }

    #[test]
    fn test_stable_types() {
        let tree = tree(
            "
            let n = 1;
            n = n + 2;
            let s = 'a';
            s += 1;
            let mixed = 1;
            mixed = 'x';
            let flag = true;
            flag = !flag;
            var hoisted = 3;
            function f(p) { return p; }
            let later;
            later = 4;
            ",
        );

        let n = binding(&tree, "global", "n");
        assert!(n.is_stable_type);
        assert_eq!(n.storage_type(), ClrType::Double);

        let s = binding(&tree, "global", "s");
        assert!(s.is_stable_type);
        assert_eq!(s.inferred, JsType::String);
        assert_eq!(s.storage_type(), ClrType::Object);

        assert!(!binding(&tree, "global", "mixed").is_stable_type);
        assert_eq!(binding(&tree, "global", "flag").storage_type(), ClrType::Boolean);
        assert!(!binding(&tree, "global", "hoisted").is_stable_type);
        assert!(!binding(&tree, "f", "p").is_stable_type);
        assert!(!binding(&tree, "global", "later").is_stable_type);
    }

    #[test]
    fn test_captured_bindings_are_not_stable() {
        let tree = tree(
            "
            function outer() {
                let x = 1;
                const get = () => x;
                return get();
            }
            ",
        );
        let x = binding(&tree, "outer", "x");
        assert!(x.is_captured);
        assert!(!x.is_stable_type);
    }

    #[test]
    fn test_frames() {
        let tree = tree(
            "
            function a() {
                if (true) {
                    let inBlock = 1;
                    function b() { return inBlock; }
                }
            }
            ",
        );

        let a = find_scope(&tree, "a");
        let b = find_scope(&tree, "b");
        let block = tree.get(b).parent.unwrap();
        assert_eq!(tree.get(block).kind, ScopeKind::Block);

        // The block holds a captured binding, so it is a frame of its own.
        assert!(tree.get(block).is_frame());
        assert_eq!(tree.frame_depth(tree.root()), 0);
        assert_eq!(tree.frame_depth(a), 1);
        assert_eq!(tree.frame_depth(block), 2);
        assert_eq!(tree.frame_depth(b), 3);
        assert_eq!(tree.frame_chain(b), vec![tree.root(), a, block, b]);
        assert_eq!(tree.qualified_name(a), "global/a");

        assert_eq!(tree.frame_of(block), block);
        assert_eq!(tree.function_of(block), a);
        assert!(!tree.frame_members(a).contains(&block));
        assert_eq!(tree.block_frames_within(a), vec![block]);

        let (decl_scope, in_block) = tree.resolve(b, &JsWord::from("inBlock")).unwrap();
        assert_eq!(decl_scope, block);
        assert!(in_block.is_captured);
    }

    #[test]
    fn test_blocks_without_captures_stay_in_their_function() {
        let tree = tree(
            "
            function f() {
                let total = 0;
                for (let i = 0; i < 3; i++) {
                    let sq = i * i;
                    total += sq;
                }
                for (const v of [1]) { const g = () => v; }
                return total;
            }
            ",
        );

        let f = find_scope(&tree, "f");
        let for_scope = find_scope(&tree, "for");
        let for_of = find_scope(&tree, "for_of");
        assert!(!tree.get(for_scope).is_frame());
        assert_eq!(tree.frame_of(for_scope), f);
        assert!(tree.frame_members(f).contains(&for_scope));

        assert!(tree.get(for_of).is_frame());
        assert_eq!(tree.block_frames_within(f), vec![for_of]);
        assert_eq!(tree.blocks_within(f).len(), 4);
    }
}
