//! The target instruction set and the metadata sink the compiler writes into.
//!
//! The instruction set models a typed, stack-based, verifiable VM: values are
//! pushed and popped from an evaluation stack, locals and arguments are typed
//! slots, and all JS values travel as `object` unless they are unboxed
//! `float64`/`bool` fast-path values.

use serde::Serialize;
use strum::IntoStaticStr;

use crate::common::Result;
use crate::error;
use crate::runtime::{IntrinsicMethod, RuntimeFn};

macro_rules! handle_type {
    ($name:ident, $repr:ty, $prefix:literal) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        pub struct $name(pub $repr);

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

handle_type!(TypeHandle, u32, "T");
handle_type!(MethodHandle, u32, "M");
handle_type!(FieldHandle, u32, "F");
handle_type!(LocalIndex, u16, "loc");
handle_type!(ArgIndex, u16, "arg");
handle_type!(Label, u32, "L");

/// Storage type of a slot, field, parameter or stack value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ClrType {
    Object,
    Double,
    Boolean,
    String,
    ObjectArray,
    /// The boxed sentinel standing for the JS `null` value.  JS `undefined`
    /// is the native null reference.
    JsNull,
    Class(TypeHandle),
}

impl ClrType {
    pub fn is_value_type(&self) -> bool {
        matches!(self, ClrType::Double | ClrType::Boolean)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MethodRef {
    User(MethodHandle),
    Runtime(RuntimeFn),
    Intrinsic(IntrinsicMethod),
}

#[derive(Debug, Clone, PartialEq, Serialize, IntoStaticStr)]
pub enum Instr {
    Nop,
    /// Marks a branch target.  Occupies no space in the encoded body.
    Label(Label),

    LdcR8(f64),
    LdcI4(i32),
    Ldstr(String),
    Ldnull,

    Ldloc(LocalIndex),
    Stloc(LocalIndex),
    Ldarg(ArgIndex),
    Starg(ArgIndex),
    Ldfld(FieldHandle),
    Stfld(FieldHandle),
    Ldsfld(FieldHandle),
    Stsfld(FieldHandle),
    /// Pops a scope array and pushes the frame stored at `index`, statically
    /// typed as `shape`.
    LdFrame {
        index: u16,
        shape: TypeHandle,
    },

    Box(ClrType),
    UnboxAny(ClrType),
    Castclass(TypeHandle),
    Isinst(ClrType),

    Dup,
    Pop,

    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    ShrUn,

    Ceq,
    Cgt,
    CgtUn,
    Clt,
    CltUn,

    ConvI4,
    ConvU4,
    ConvR8,
    ConvRUn,

    Br(Label),
    Brtrue(Label),
    Brfalse(Label),

    Call(MethodRef),
    Callvirt(MethodRef),
    Newobj(MethodRef),
    Ldftn(MethodHandle),

    /// Pops an int32 length.
    Newarr(ClrType),
    /// array, int32 index -> element
    Ldelem,
    /// array, int32 index, value ->
    Stelem,

    BeginTry,
    BeginCatch,
    BeginFinally,
    EndFinally,
    EndTry,
    Leave(Label),

    Throw,
    Ret,
}

impl Instr {
    pub fn opcode(&self) -> &'static str {
        // use strum::IntoStaticStr
        self.into()
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instr::Br(_) | Instr::Leave(_) | Instr::Throw | Instr::Ret
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MethodBody {
    pub instrs: Vec<Instr>,
    pub locals: Vec<ClrType>,
}

impl MethodBody {
    pub fn opcodes(&self) -> impl '_ + Iterator<Item = &'static str> {
        self.instrs
            .iter()
            .filter(|instr| !matches!(instr, Instr::Label(_)))
            .map(Instr::opcode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TypeKind {
    Module,
    /// Heap-allocated frame holding a scope's captured bindings.
    Scope,
    Class,
    /// Owner of the static method implementing a function declaration or
    /// expression.
    FunctionOwner,
    ArrowOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Visibility {
    Public,
    Internal,
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodSig {
    pub params: Vec<ClrType>,
    /// `None` for void methods (constructors).
    pub ret: Option<ClrType>,
    pub has_this: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypeDef {
    pub name: String,
    pub kind: TypeKind,
    pub base: Option<TypeHandle>,
    pub nested_in: Option<TypeHandle>,
    pub first_method: Option<MethodHandle>,
    pub fields: Vec<FieldHandle>,
    pub methods: Vec<MethodHandle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldDef {
    pub name: String,
    pub owner: TypeHandle,
    pub ty: ClrType,
    pub is_static: bool,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodDef {
    pub name: String,
    pub owner: Option<TypeHandle>,
    pub sig: MethodSig,
    pub param_names: Vec<String>,
    pub is_static: bool,
    pub is_ctor: bool,
    pub visibility: Visibility,
    pub body: Option<MethodBody>,
}

pub struct TypeDecl {
    pub name: String,
    pub kind: TypeKind,
    pub base: Option<TypeHandle>,
    pub nested_in: Option<TypeHandle>,
    /// The method anchoring the type's method list; it must be reserved
    /// before the type is declared.
    pub first_method: Option<MethodHandle>,
}

pub struct MethodDecl {
    pub name: String,
    pub sig: MethodSig,
    pub param_names: Vec<String>,
    pub is_static: bool,
    pub is_ctor: bool,
    pub visibility: Visibility,
}

/// In-memory metadata and bytecode sink.
///
/// Methods can be reserved (signature only) before their owner type exists
/// and before their body is emitted; bodies are attached later, exactly once.
#[derive(Debug, Default, Serialize)]
pub struct Assembly {
    name: String,
    types: Vec<TypeDef>,
    fields: Vec<FieldDef>,
    methods: Vec<MethodDef>,
    entry_point: Option<MethodHandle>,
}

impl Assembly {
    pub fn new(name: &str) -> Self {
        Assembly {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reserve_method(&mut self, decl: MethodDecl) -> MethodHandle {
        let handle = MethodHandle(self.methods.len() as u32);
        self.methods.push(MethodDef {
            name: decl.name,
            owner: None,
            sig: decl.sig,
            param_names: decl.param_names,
            is_static: decl.is_static,
            is_ctor: decl.is_ctor,
            visibility: decl.visibility,
            body: None,
        });
        handle
    }

    pub fn declare_type(&mut self, decl: TypeDecl) -> Result<TypeHandle> {
        let handle = TypeHandle(self.types.len() as u32);
        let mut methods = Vec::new();
        if let Some(first) = decl.first_method {
            let method = self
                .methods
                .get_mut(first.0 as usize)
                .ok_or_else(|| error!("internal: type {} anchored to unknown method {:?}", decl.name, first))?;
            if method.owner.is_some() {
                return Err(error!(
                    "internal: method {:?} ({}) already belongs to a type",
                    first, method.name
                ));
            }
            method.owner = Some(handle);
            methods.push(first);
        }

        self.types.push(TypeDef {
            name: decl.name,
            kind: decl.kind,
            base: decl.base,
            nested_in: decl.nested_in,
            first_method: decl.first_method,
            fields: Vec::new(),
            methods,
        });
        Ok(handle)
    }

    pub fn attach_method(&mut self, owner: TypeHandle, method: MethodHandle) -> Result<()> {
        let def = self
            .methods
            .get_mut(method.0 as usize)
            .ok_or_else(|| error!("internal: unknown method {:?}", method))?;
        match def.owner {
            Some(prev) if prev == owner => return Ok(()),
            Some(prev) => {
                return Err(error!(
                    "internal: method {} already owned by {:?}",
                    def.name, prev
                ))
            }
            None => def.owner = Some(owner),
        }
        self.types
            .get_mut(owner.0 as usize)
            .ok_or_else(|| error!("internal: unknown type {:?}", owner))?
            .methods
            .push(method);
        Ok(())
    }

    pub fn declare_field(
        &mut self,
        owner: TypeHandle,
        name: &str,
        ty: ClrType,
        is_static: bool,
        visibility: Visibility,
    ) -> FieldHandle {
        let handle = FieldHandle(self.fields.len() as u32);
        self.fields.push(FieldDef {
            name: name.to_string(),
            owner,
            ty,
            is_static,
            visibility,
        });
        if let Some(type_def) = self.types.get_mut(owner.0 as usize) {
            type_def.fields.push(handle);
        }
        handle
    }

    pub fn define_body(&mut self, method: MethodHandle, body: MethodBody) -> Result<()> {
        let def = self
            .methods
            .get_mut(method.0 as usize)
            .ok_or_else(|| error!("internal: unknown method {:?}", method))?;
        if def.body.is_some() {
            return Err(error!("internal: body of {} emitted twice", def.name));
        }
        def.body = Some(body);
        Ok(())
    }

    pub fn set_entry_point(&mut self, method: MethodHandle) {
        self.entry_point = Some(method);
    }

    pub fn entry_point(&self) -> Option<MethodHandle> {
        self.entry_point
    }

    pub fn method(&self, handle: MethodHandle) -> &MethodDef {
        &self.methods[handle.0 as usize]
    }

    pub fn field(&self, handle: FieldHandle) -> &FieldDef {
        &self.fields[handle.0 as usize]
    }

    pub fn type_def(&self, handle: TypeHandle) -> &TypeDef {
        &self.types[handle.0 as usize]
    }

    pub fn methods(&self) -> impl '_ + Iterator<Item = (MethodHandle, &MethodDef)> {
        self.methods
            .iter()
            .enumerate()
            .map(|(ndx, def)| (MethodHandle(ndx as u32), def))
    }

    pub fn types(&self) -> impl '_ + Iterator<Item = (TypeHandle, &TypeDef)> {
        self.types
            .iter()
            .enumerate()
            .map(|(ndx, def)| (TypeHandle(ndx as u32), def))
    }

    pub fn find_method(&self, owner_name: &str, method_name: &str) -> Option<MethodHandle> {
        self.methods().find_map(|(handle, def)| {
            let owner = def.owner.map(|ty| self.type_def(ty).name.as_str());
            if owner == Some(owner_name) && def.name == method_name {
                Some(handle)
            } else {
                None
            }
        })
    }

    /// Methods that were reserved but never received a body.
    pub fn missing_bodies(&self) -> Vec<MethodHandle> {
        self.methods()
            .filter(|(_, def)| def.body.is_none())
            .map(|(handle, _)| handle)
            .collect()
    }

    /// Encode the whole image (metadata and bodies).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|err| error!("could not encode assembly: {}", err))
    }

    pub fn dump(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        // Writing into a String never fails.
        let _ = self.dump_into(&mut out);
        let _ = writeln!(out);
        out
    }

    fn dump_into(&self, out: &mut String) -> std::fmt::Result {
        use std::fmt::Write;

        writeln!(out, "assembly {}", self.name)?;
        if let Some(entry) = self.entry_point {
            writeln!(out, "  entry point: {:?}", entry)?;
        }

        for (handle, ty) in self.types() {
            write!(out, "type {:?} {:?} {}", handle, ty.kind, ty.name)?;
            if let Some(base) = ty.base {
                write!(out, " extends {:?}", base)?;
            }
            if let Some(owner) = ty.nested_in {
                write!(out, " nested in {:?}", owner)?;
            }
            writeln!(out)?;

            for field in &ty.fields {
                let def = self.field(*field);
                writeln!(
                    out,
                    "  field {:?} {:?} {}{:?} {}",
                    field,
                    def.visibility,
                    if def.is_static { "static " } else { "" },
                    def.ty,
                    def.name
                )?;
            }
            for method in &ty.methods {
                self.dump_method(out, *method)?;
            }
        }

        for (handle, def) in self.methods() {
            if def.owner.is_none() {
                writeln!(out, "(orphan)")?;
                self.dump_method(out, handle)?;
            }
        }

        Ok(())
    }

    fn dump_method(&self, out: &mut String, handle: MethodHandle) -> std::fmt::Result {
        use std::fmt::Write;

        let def = self.method(handle);
        write!(
            out,
            "  method {:?} {}{} {}(",
            handle,
            if def.is_static { "static " } else { "" },
            match def.sig.ret {
                Some(ty) => format!("{:?}", ty),
                None => "void".to_string(),
            },
            def.name
        )?;
        for (ndx, param) in def.sig.params.iter().enumerate() {
            if ndx > 0 {
                write!(out, ", ")?;
            }
            let name = def.param_names.get(ndx).map(String::as_str).unwrap_or("_");
            write!(out, "{:?} {}", param, name)?;
        }
        writeln!(out, ")")?;

        match &def.body {
            None => writeln!(out, "    <no body>")?,
            Some(body) => {
                writeln!(out, "    locals: {:?}", body.locals)?;
                for (ndx, instr) in body.instrs.iter().enumerate() {
                    writeln!(out, "    {:4} {:?}", ndx, instr)?;
                }
            }
        }
        Ok(())
    }
}
