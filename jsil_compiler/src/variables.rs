//! Storage of JS bindings: frame layouts for captured bindings, and the
//! [`Variable`] load/store contract every emitter goes through.
//!
//! Every Global or Function scope is a *frame*, and so is every block
//! holding a captured binding.  Other blocks store their bindings in the
//! enclosing frame.  A frame holding at least one captured binding gets a
//! scope type (one field per captured binding); functions instantiate it at
//! entry, blocks each time control enters them.  Other frames have no heap
//! instance.
//!
//! Functions receive the frames of their lexical ancestors as a scope array
//! indexed by frame depth (the global frame is at index 0).  Entries for
//! frames without an instance are null.

use std::collections::HashMap;

use swc_atoms::JsWord;

use crate::bytecode::{
    ArgIndex, Assembly, ClrType, FieldHandle, Instr, LocalIndex, MethodDecl, MethodHandle, MethodSig,
    TypeDecl, TypeHandle, TypeKind, Visibility,
};
use crate::common::Result;
use crate::error;
use crate::runtime::RuntimeFn;
use crate::scope::{Binding, ScopeId, ScopeTree};

/// Index of a frame in [`FrameLayouts`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameIndex(pub u32);

impl std::fmt::Debug for FrameIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame{}", self.0)
    }
}

#[derive(Debug)]
pub struct FrameLayout {
    pub scope: ScopeId,
    /// Position of this frame in the scope arrays of nested functions.
    pub depth: u16,
    /// Present iff the frame has captured bindings.
    pub shape: Option<FrameShape>,
}

#[derive(Debug)]
pub struct FrameShape {
    pub ty: TypeHandle,
    pub ctor: MethodHandle,
    fields: HashMap<(ScopeId, JsWord), FieldHandle>,
}

impl FrameShape {
    pub fn field(&self, decl: ScopeId, name: &JsWord) -> Option<FieldHandle> {
        self.fields.get(&(decl, name.clone())).copied()
    }

    /// Every field, in declaration order.
    pub fn all_fields(&self) -> Vec<FieldHandle> {
        let mut fields: Vec<_> = self.fields.values().copied().collect();
        fields.sort();
        fields
    }
}

/// Arena of frame layouts, built once before any body is emitted.
#[derive(Debug, Default)]
pub struct FrameLayouts {
    frames: Vec<FrameLayout>,
    by_scope: HashMap<ScopeId, FrameIndex>,
}

impl FrameLayouts {
    /// Declare one scope type per frame with captured bindings.
    pub fn declare(scopes: &ScopeTree, assembly: &mut Assembly) -> Result<FrameLayouts> {
        let mut layouts = FrameLayouts::default();
        let mut type_names = HashMap::new();

        // Walk in tree order so that frame indices follow the source.
        let mut queue = vec![scopes.root()];
        while let Some(frame) = queue.pop() {
            for child in scopes.get(frame).children.iter().rev() {
                queue.push(*child);
            }
            if !scopes.get(frame).is_frame() {
                continue;
            }

            let captured: Vec<(ScopeId, &Binding)> = scopes
                .frame_members(frame)
                .into_iter()
                .flat_map(|member| {
                    scopes
                        .get(member)
                        .bindings()
                        .filter(|b| b.is_captured)
                        .map(move |b| (member, b))
                })
                .collect();

            let shape = if captured.is_empty() {
                None
            } else {
                let base = format!("Scopes.{}", scopes.qualified_name(frame).replace('/', "."));
                let count = type_names.entry(base.clone()).or_insert(0u32);
                let type_name = if *count == 0 { base } else { format!("{}${}", base, count) };
                *count += 1;
                Some(declare_shape(assembly, type_name, &captured)?)
            };

            let index = FrameIndex(layouts.frames.len() as u32);
            layouts.frames.push(FrameLayout {
                scope: frame,
                depth: scopes.frame_depth(frame),
                shape,
            });
            layouts.by_scope.insert(frame, index);
        }

        Ok(layouts)
    }

    pub fn index_of(&self, frame: ScopeId) -> Option<FrameIndex> {
        self.by_scope.get(&frame).copied()
    }

    pub fn get(&self, index: FrameIndex) -> &FrameLayout {
        &self.frames[index.0 as usize]
    }

    pub fn of_scope(&self, frame: ScopeId) -> Result<&FrameLayout> {
        self.index_of(frame)
            .map(|index| self.get(index))
            .ok_or_else(|| error!("internal: scope is not a frame"))
    }

    pub fn iter(&self) -> impl '_ + Iterator<Item = (FrameIndex, &FrameLayout)> {
        self.frames
            .iter()
            .enumerate()
            .map(|(ndx, layout)| (FrameIndex(ndx as u32), layout))
    }
}

fn declare_shape(assembly: &mut Assembly, type_name: String, captured: &[(ScopeId, &Binding)]) -> Result<FrameShape> {
    let ctor = assembly.reserve_method(MethodDecl {
        name: ".ctor".to_string(),
        sig: MethodSig {
            params: Vec::new(),
            ret: None,
            has_this: true,
        },
        param_names: Vec::new(),
        is_static: false,
        is_ctor: true,
        visibility: Visibility::Public,
    });
    let ty = assembly.declare_type(TypeDecl {
        name: type_name,
        kind: TypeKind::Scope,
        base: None,
        nested_in: None,
        first_method: Some(ctor),
    })?;
    assembly.define_body(
        ctor,
        crate::bytecode::MethodBody {
            instrs: vec![Instr::Ret],
            locals: Vec::new(),
        },
    )?;

    let mut fields = HashMap::new();
    let mut used_names: HashMap<String, u32> = HashMap::new();
    for (decl, binding) in captured {
        // Two blocks stored in one frame may both declare `x`.
        let count = used_names.entry(binding.name.to_string()).or_insert(0);
        let field_name = if *count == 0 {
            binding.name.to_string()
        } else {
            format!("{}${}", binding.name, count)
        };
        *count += 1;

        let field = assembly.declare_field(ty, &field_name, binding.storage_type(), false, Visibility::Public);
        fields.insert((*decl, binding.name.clone()), field);
    }

    Ok(FrameShape { ty, ctor, fields })
}

/// Where the current method body finds the frames of its ancestors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopesSource {
    /// Top-level code: no ancestor frames.
    None,
    /// The scope array parameter.
    Arg(ArgIndex),
    /// The scope array stored on `this` by a class constructor.
    ThisField(FieldHandle),
}

impl ScopesSource {
    /// Push the incoming scope array, or null when there is none.
    pub fn emit_load(&self, out: &mut Vec<Instr>) {
        match self {
            ScopesSource::None => out.push(Instr::Ldnull),
            ScopesSource::Arg(arg) => out.push(Instr::Ldarg(*arg)),
            ScopesSource::ThisField(field) => {
                out.push(Instr::Ldarg(ArgIndex(0)));
                out.push(Instr::Ldfld(*field));
            }
        }
    }
}

/// A binding resolved to its storage.  Decided once per binding from
/// `is_captured` and the declaring frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variable {
    /// Method-local slot (uncaptured bindings).
    Local { slot: LocalIndex, storage: ClrType },
    /// Uncaptured parameter, read and written in its argument slot.
    Parameter { arg: ArgIndex },
    /// Field of a frame instance held in a local: the function's own frame
    /// or a block frame entered by the current body.
    Field {
        frame: LocalIndex,
        field: FieldHandle,
        storage: ClrType,
    },
    /// Field of an ancestor frame, reached through the scope array.
    ScopeChain {
        scopes: ScopesSource,
        parent_index: u16,
        shape: TypeHandle,
        field: FieldHandle,
        storage: ClrType,
    },
}

impl Variable {
    pub fn storage(&self) -> ClrType {
        match self {
            Variable::Local { storage, .. }
            | Variable::Field { storage, .. }
            | Variable::ScopeChain { storage, .. } => *storage,
            Variable::Parameter { .. } => ClrType::Object,
        }
    }

    pub fn is_field(&self) -> bool {
        matches!(self, Variable::Field { .. } | Variable::ScopeChain { .. })
    }

    /// Push the frame instance owning the field (nothing for slots).
    pub fn emit_instance(&self, out: &mut Vec<Instr>) {
        match self {
            Variable::Local { .. } | Variable::Parameter { .. } => {}
            Variable::Field { frame, .. } => out.push(Instr::Ldloc(*frame)),
            Variable::ScopeChain {
                scopes,
                parent_index,
                shape,
                ..
            } => {
                scopes.emit_load(out);
                out.push(Instr::LdFrame {
                    index: *parent_index,
                    shape: *shape,
                });
            }
        }
    }

    /// Push the variable's value, in its storage type.
    pub fn emit_load(&self, out: &mut Vec<Instr>) {
        self.emit_instance(out);
        self.emit_load_from_instance(out);
    }

    /// Like `emit_load`, with the frame instance already on the stack.
    pub fn emit_load_from_instance(&self, out: &mut Vec<Instr>) {
        match self {
            Variable::Local { slot, .. } => out.push(Instr::Ldloc(*slot)),
            Variable::Parameter { arg } => out.push(Instr::Ldarg(*arg)),
            Variable::Field { field, .. } | Variable::ScopeChain { field, .. } => {
                out.push(Instr::Ldfld(*field))
            }
        }
    }

    /// Store the value on top of the stack.  For fields, the frame instance
    /// must have been pushed (with `emit_instance`) before the value.
    pub fn emit_store(&self, out: &mut Vec<Instr>) {
        match self {
            Variable::Local { slot, .. } => out.push(Instr::Stloc(*slot)),
            Variable::Parameter { arg } => out.push(Instr::Starg(*arg)),
            Variable::Field { field, .. } | Variable::ScopeChain { field, .. } => {
                out.push(Instr::Stfld(*field))
            }
        }
    }
}

/// Convert the value on top of the stack from `from` to the storage type
/// `to`.  Object values are coerced with JS semantics.
pub fn emit_coerce(out: &mut Vec<Instr>, from: ClrType, to: ClrType) {
    if from == to {
        return;
    }
    match (from, to) {
        (ClrType::Double | ClrType::Boolean, ClrType::Object) => out.push(Instr::Box(from)),
        (ClrType::Boolean, ClrType::Double) => out.push(Instr::ConvR8),
        (_, ClrType::Double) => {
            if from.is_value_type() {
                out.push(Instr::Box(from));
            }
            out.push(Instr::Call(crate::bytecode::MethodRef::Runtime(RuntimeFn::ToNumber)));
        }
        (_, ClrType::Boolean) => {
            if from.is_value_type() {
                out.push(Instr::Box(from));
            }
            out.push(Instr::Call(crate::bytecode::MethodRef::Runtime(RuntimeFn::ToBoolean)));
        }
        // Reference types are all assignable to object.
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::builder::build_scope_tree;

    fn layouts(code: &str) -> (ScopeTree, Assembly, FrameLayouts) {
        let (script, _) = crate::bytecode_compiler::parse_script_str(code).unwrap();
        let scopes = build_scope_tree(&script).unwrap();
        let mut assembly = Assembly::new("test");
        let frames = FrameLayouts::declare(&scopes, &mut assembly).unwrap();
        (scopes, assembly, frames)
    }

    #[test]
    fn test_only_frames_with_captures_get_a_shape() {
        let (scopes, assembly, frames) = layouts(
            "
            let plain = 1;
            function outer() {
                let x = 1;
                { let x = 2; const f = () => x; }
                { let x = 3; const g = () => x; }
                function inner() { return x; }
                return inner();
            }
            ",
        );

        let root = frames.of_scope(scopes.root()).unwrap();
        assert_eq!(root.depth, 0);
        assert!(root.shape.is_none());

        let (outer_id, _) = scopes.iter().find(|(_, s)| s.name == "outer").unwrap();
        let outer = frames.of_scope(outer_id).unwrap();
        assert_eq!(outer.depth, 1);
        let shape = outer.shape.as_ref().unwrap();
        let ty = assembly.type_def(shape.ty);
        assert_eq!(ty.name, "Scopes.global.outer");
        assert_eq!(ty.kind, TypeKind::Scope);

        let names: Vec<_> = ty.fields.iter().map(|f| assembly.field(*f).name.as_str()).collect();
        assert_eq!(names, vec!["x"]);
        assert_eq!(assembly.method(shape.ctor).owner, Some(shape.ty));

        // Each block with a captured `x` is a frame with its own type.
        let blocks: Vec<_> = frames
            .iter()
            .filter(|(_, layout)| scopes.get(layout.scope).kind == crate::scope::ScopeKind::Block)
            .map(|(_, layout)| layout)
            .collect();
        assert_eq!(blocks.len(), 2);
        let block_types: Vec<_> = blocks
            .iter()
            .map(|layout| {
                assert_eq!(layout.depth, 2);
                assembly.type_def(layout.shape.as_ref().unwrap().ty).name.clone()
            })
            .collect();
        assert_eq!(block_types, vec!["Scopes.global.outer.block", "Scopes.global.outer.block$1"]);
    }

    #[test]
    fn test_coerce() {
        let mut out = Vec::new();
        emit_coerce(&mut out, ClrType::Double, ClrType::Object);
        emit_coerce(&mut out, ClrType::Object, ClrType::Double);
        emit_coerce(&mut out, ClrType::String, ClrType::Object);
        emit_coerce(&mut out, ClrType::Double, ClrType::Boolean);
        assert_eq!(
            out,
            vec![
                Instr::Box(ClrType::Double),
                Instr::Call(crate::bytecode::MethodRef::Runtime(RuntimeFn::ToNumber)),
                Instr::Box(ClrType::Double),
                Instr::Call(crate::bytecode::MethodRef::Runtime(RuntimeFn::ToBoolean)),
            ]
        );
    }

    #[test]
    fn test_field_store_needs_instance_first() {
        let var = Variable::ScopeChain {
            scopes: ScopesSource::Arg(ArgIndex(0)),
            parent_index: 1,
            shape: TypeHandle(4),
            field: FieldHandle(2),
            storage: ClrType::Double,
        };
        let mut out = Vec::new();
        var.emit_instance(&mut out);
        out.push(Instr::LdcR8(1.0));
        var.emit_store(&mut out);
        assert_eq!(
            out,
            vec![
                Instr::Ldarg(ArgIndex(0)),
                Instr::LdFrame {
                    index: 1,
                    shape: TypeHandle(4)
                },
                Instr::LdcR8(1.0),
                Instr::Stfld(FieldHandle(2)),
            ]
        );
    }
}
