//! Class layouts: one type per class declaration, with its fields,
//! constructor and methods reserved before any body is emitted.

use std::collections::{HashMap, HashSet};

use swc_atoms::JsWord;
use swc_ecma_ast::{
    AssignExpr, BinaryOp, Class, ClassDecl, ClassMember, Constructor, Expr, Lit, MemberProp,
    ParamOrTsParamProp, Pat, PatOrExpr, Script, UpdateExpr,
};
use swc_ecma_visit::{Visit, VisitWith};

use crate::bytecode::{
    ArgIndex, Assembly, ClrType, FieldHandle, Instr, MethodDecl, MethodHandle, MethodRef,
    MethodSig, TypeDecl, TypeHandle, TypeKind, Visibility,
};
use crate::bytecode_compiler::{compile_expr, compile_stmts, FnBuilder};
use crate::closures::emit_scopes_for;
use crate::common::Result;
use crate::coordinator::ParamCount;
use crate::scope::{BindingKind, ClassRef, JsType, ScopeId, ScopeKind, ScopeTree};
use crate::{error, unsupported_node};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(u32);

impl std::fmt::Debug for ClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "class{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldInfo {
    pub handle: FieldHandle,
    pub ty: ClrType,
    pub is_static: bool,
}

impl FieldInfo {
    pub fn js_type(&self) -> JsType {
        match self.ty {
            ClrType::Double => JsType::Number,
            ClrType::Boolean => JsType::Boolean,
            _ => JsType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MethodInfo {
    pub handle: MethodHandle,
    pub scope: ScopeId,
    pub params: ParamCount,
    pub is_static: bool,
}

#[derive(Debug)]
pub struct ClassEntry {
    pub name: JsWord,
    pub class_ref: ClassRef,
    /// The Class scope.
    pub scope: ScopeId,
    pub ty: TypeHandle,
    pub base: Option<ClassId>,
    pub ctor: MethodHandle,
    /// Function scope of the constructor, explicit or implicit.
    pub ctor_scope: ScopeId,
    pub ctor_params: ParamCount,
    /// Constructor and methods read outer frames, so every instance stores
    /// the scope array it was constructed with.
    pub needs_scopes: bool,
    pub scopes_field: Option<FieldHandle>,
    /// Written by `return <expr>` in the constructor.
    pub ctor_return_field: Option<FieldHandle>,
    fields: HashMap<String, FieldInfo>,
    methods: HashMap<String, MethodInfo>,
}

impl ClassEntry {
    /// Argument index of the first JS constructor parameter.
    pub fn ctor_first_param(&self) -> u16 {
        if self.needs_scopes {
            2
        } else {
            1
        }
    }

    pub fn own_methods(&self) -> impl '_ + Iterator<Item = (&String, &MethodInfo)> {
        self.methods.iter()
    }
}

#[derive(Debug, Default)]
pub struct ClassRegistry {
    entries: Vec<ClassEntry>,
    by_ref: HashMap<ClassRef, ClassId>,
}

impl ClassRegistry {
    pub fn get(&self, id: ClassId) -> &ClassEntry {
        &self.entries[id.0 as usize]
    }

    pub fn by_ref(&self, class_ref: &ClassRef) -> Option<ClassId> {
        self.by_ref.get(class_ref).copied()
    }

    pub fn iter(&self) -> impl '_ + Iterator<Item = (ClassId, &ClassEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(ndx, entry)| (ClassId(ndx as u32), entry))
    }

    /// The class and its bases, most derived first.
    pub fn chain(&self, id: ClassId) -> impl '_ + Iterator<Item = (ClassId, &ClassEntry)> {
        std::iter::successors(Some(id), move |id| self.get(*id).base).map(|id| (id, self.get(id)))
    }

    /// Instance or static field, searched through the base chain.
    pub fn field(&self, id: ClassId, name: &str) -> Option<FieldInfo> {
        self.chain(id)
            .find_map(|(_, entry)| entry.fields.get(name).copied())
    }

    pub fn method(&self, id: ClassId, name: &str) -> Option<(ClassId, MethodInfo)> {
        self.chain(id)
            .find_map(|(owner, entry)| entry.methods.get(name).map(|m| (owner, *m)))
    }

    /// Declare every class of `script`.  Bases are declared before the
    /// classes extending them.
    pub fn declare<'a>(
        scopes: &ScopeTree,
        assembly: &mut Assembly,
        script: &Script,
        decls: &[&'a ClassDecl],
        nested_in: &dyn Fn(ScopeId) -> Option<TypeHandle>,
    ) -> Result<ClassRegistry> {
        let mut infos = Vec::new();
        for decl in decls {
            infos.push(ClassInfo::collect(scopes, decl)?);
        }
        let dynamic_writes = DynamicWrites::of_script(script);
        compute_needs_scopes(&mut infos);

        let mut registry = ClassRegistry::default();
        let ndx_of: HashMap<ClassRef, usize> = infos
            .iter()
            .enumerate()
            .map(|(ndx, info)| (info.class_ref.clone(), ndx))
            .collect();
        for ndx in 0..infos.len() {
            registry.declare_class(scopes, assembly, &infos, &ndx_of, ndx, &dynamic_writes, nested_in, 0)?;
        }
        Ok(registry)
    }

    #[allow(clippy::too_many_arguments)]
    fn declare_class(
        &mut self,
        scopes: &ScopeTree,
        assembly: &mut Assembly,
        infos: &[ClassInfo<'_>],
        ndx_of: &HashMap<ClassRef, usize>,
        ndx: usize,
        dynamic_writes: &DynamicWrites,
        nested_in: &dyn Fn(ScopeId) -> Option<TypeHandle>,
        depth: usize,
    ) -> Result<ClassId> {
        let info = &infos[ndx];
        if let Some(id) = self.by_ref.get(&info.class_ref) {
            return Ok(*id);
        }
        if depth > infos.len() {
            return Err(error!("class {} extends itself", info.class_ref.name).with_span(info.class.span));
        }

        let base = match &info.base {
            Some(base_ref) => {
                let base_ndx = ndx_of.get(base_ref).copied().ok_or_else(|| {
                    error!("internal: base class {} not collected", base_ref.name)
                })?;
                Some(self.declare_class(
                    scopes,
                    assembly,
                    infos,
                    ndx_of,
                    base_ndx,
                    dynamic_writes,
                    nested_in,
                    depth + 1,
                )?)
            }
            None => None,
        };

        let ctor_params = match (&info.ctor_params, base) {
            (Some(params), _) => *params,
            // The implicit constructor of a derived class forwards its
            // arguments to the base constructor.
            (None, Some(base)) => self.get(base).ctor_params,
            (None, None) => ParamCount { min: 0, max: 0 },
        };

        let mut ctor_sig = Vec::new();
        let mut ctor_names = Vec::new();
        if info.needs_scopes {
            ctor_sig.push(ClrType::ObjectArray);
            ctor_names.push("scopes".to_string());
        }
        for i in 0..ctor_params.max {
            ctor_sig.push(ClrType::Object);
            ctor_names.push(info.param_name(i));
        }
        // The constructor anchors the type's method list, so it must exist
        // before the type.
        let ctor = assembly.reserve_method(MethodDecl {
            name: ".ctor".to_string(),
            sig: MethodSig {
                params: ctor_sig,
                ret: None,
                has_this: true,
            },
            param_names: ctor_names,
            is_static: false,
            is_ctor: true,
            visibility: Visibility::Public,
        });
        let ty = assembly.declare_type(TypeDecl {
            name: format!("Classes.{}", info.class_ref.name),
            kind: TypeKind::Class,
            base: base.map(|base| self.get(base).ty),
            nested_in: nested_in(scopes.function_of(info.scope)),
            first_method: Some(ctor),
        })?;

        let scopes_field = if info.needs_scopes {
            Some(assembly.declare_field(ty, "_scopes", ClrType::ObjectArray, false, Visibility::Private))
        } else {
            None
        };
        let ctor_return_field = if info.ctor_returns_value {
            Some(assembly.declare_field(ty, "__ctor_return", ClrType::Object, false, Visibility::Internal))
        } else {
            None
        };

        let mut fields = HashMap::new();
        for (name, field) in &info.fields {
            let mut field_ty = field.ty.resolve();
            if dynamic_writes.may_write(name) {
                field_ty = ClrType::Object;
            }
            let (backing_name, visibility) = match name.strip_prefix('#') {
                Some(private) => (format!("__private_{}", private), Visibility::Private),
                None => (name.clone(), Visibility::Public),
            };
            let handle = assembly.declare_field(ty, &backing_name, field_ty, field.is_static, visibility);
            fields.insert(
                name.clone(),
                FieldInfo {
                    handle,
                    ty: field_ty,
                    is_static: field.is_static,
                },
            );
        }

        let mut methods = HashMap::new();
        for method in &info.methods {
            let mut params = Vec::new();
            let mut param_names = Vec::new();
            if method.is_static && info.needs_scopes {
                params.push(ClrType::ObjectArray);
                param_names.push("scopes".to_string());
            }
            for name in &method.param_names {
                params.push(ClrType::Object);
                param_names.push(name.clone());
            }
            let handle = assembly.reserve_method(MethodDecl {
                name: match method.name.strip_prefix('#') {
                    Some(private) => format!("__private_{}", private),
                    None => method.name.clone(),
                },
                sig: MethodSig {
                    params,
                    ret: Some(ClrType::Object),
                    has_this: !method.is_static,
                },
                param_names,
                is_static: method.is_static,
                is_ctor: false,
                visibility: if method.name.starts_with('#') {
                    Visibility::Private
                } else {
                    Visibility::Public
                },
            });
            assembly.attach_method(ty, handle)?;
            methods.insert(
                method.name.clone(),
                MethodInfo {
                    handle,
                    scope: method.scope,
                    params: method.params,
                    is_static: method.is_static,
                },
            );
        }

        let id = ClassId(self.entries.len() as u32);
        self.entries.push(ClassEntry {
            name: info.class_ref.name.clone(),
            class_ref: info.class_ref.clone(),
            scope: info.scope,
            ty,
            base,
            ctor,
            ctor_scope: info.ctor_scope,
            ctor_params,
            needs_scopes: info.needs_scopes,
            scopes_field,
            ctor_return_field,
            fields,
            methods,
        });
        self.by_ref.insert(info.class_ref.clone(), id);
        Ok(id)
    }
}

/// What phase 1 learns from one class declaration before declaring it.
struct ClassInfo<'a> {
    class: &'a Class,
    class_ref: ClassRef,
    scope: ScopeId,
    ctor_scope: ScopeId,
    base: Option<ClassRef>,
    /// `None` for an implicit constructor.
    ctor_params: Option<ParamCount>,
    ctor_param_names: Vec<String>,
    ctor_returns_value: bool,
    fields: Vec<(String, FieldSlot)>,
    methods: Vec<MethodSlot>,
    /// Reads bindings declared outside the class.
    reads_outer: bool,
    /// Classes constructed from the class body.
    constructs: HashSet<ClassRef>,
    needs_scopes: bool,
}

struct FieldSlot {
    is_static: bool,
    ty: FieldType,
}

struct MethodSlot {
    name: String,
    scope: ScopeId,
    params: ParamCount,
    param_names: Vec<String>,
    is_static: bool,
}

/// Join of the types written into a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldType {
    Unwritten,
    Typed(JsType),
    Mixed,
}

impl FieldType {
    fn join(self, ty: JsType) -> FieldType {
        match (self, ty) {
            (_, JsType::Unknown) => FieldType::Mixed,
            (FieldType::Unwritten, ty) => FieldType::Typed(ty),
            (FieldType::Typed(prev), ty) if prev == ty => self,
            _ => FieldType::Mixed,
        }
    }

    fn resolve(self) -> ClrType {
        match self {
            FieldType::Typed(JsType::Number) => ClrType::Double,
            FieldType::Typed(JsType::Boolean) => ClrType::Boolean,
            _ => ClrType::Object,
        }
    }
}

impl<'a> ClassInfo<'a> {
    fn collect(scopes: &ScopeTree, decl: &'a ClassDecl) -> Result<ClassInfo<'a>> {
        let class = &decl.class;
        let scope = scopes
            .class_scope(class.span)
            .ok_or_else(|| error!("internal: no scope for class {}", decl.ident.sym).with_span(class.span))?;
        let decl_scope = scopes.get(scope).parent.unwrap_or(scope);
        let class_ref = ClassRef {
            decl: decl_scope,
            name: decl.ident.sym.clone(),
        };

        let base = match class.super_class.as_deref() {
            None => None,
            Some(Expr::Ident(ident)) => match scopes.resolve(decl_scope, &ident.sym) {
                Some((base_decl, binding)) if binding.kind == BindingKind::Class => Some(ClassRef {
                    decl: base_decl,
                    name: ident.sym.clone(),
                }),
                _ => return Err(unsupported_node!("extending a value that is not a class declaration", ident.span)),
            },
            Some(other) => return Err(unsupported_node!("computed base class", swc_common::Spanned::span(other))),
        };

        let ctor = class.body.iter().find_map(|member| match member {
            ClassMember::Constructor(ctor) => Some(ctor),
            _ => None,
        });
        let ctor_scope = scopes
            .function_scope(ctor.map(|ctor| ctor.span).unwrap_or(class.span))
            .ok_or_else(|| error!("internal: no constructor scope for {}", decl.ident.sym))?;

        let mut info = ClassInfo {
            class,
            class_ref,
            scope,
            ctor_scope,
            base,
            ctor_params: None,
            ctor_param_names: Vec::new(),
            ctor_returns_value: false,
            fields: Vec::new(),
            methods: Vec::new(),
            reads_outer: false,
            constructs: HashSet::new(),
            needs_scopes: false,
        };

        let mut writes = FieldWrites::new(scopes);
        if let Some(ctor) = ctor {
            let mut pats = Vec::new();
            for param in &ctor.params {
                match param {
                    swc_ecma_ast::ParamOrTsParamProp::Param(param) => pats.push(&param.pat),
                    swc_ecma_ast::ParamOrTsParamProp::TsParamProp(prop) => {
                        return Err(unsupported_node!("parameter property", prop.span))
                    }
                }
            }
            let (params, names) = param_count(pats.into_iter());
            info.ctor_params = Some(params);
            info.ctor_param_names = names;
            if let Some(body) = &ctor.body {
                writes.scan(ctor_scope, body);
                info.ctor_returns_value = writes.returns_value;
            }
        }

        for member in &class.body {
            match member {
                ClassMember::Constructor(_) | ClassMember::Empty(_) => {}
                ClassMember::Method(method) => {
                    if method.kind != swc_ecma_ast::MethodKind::Method {
                        return Err(unsupported_node!("getter or setter", method.span));
                    }
                    let name = crate::scope::builder::prop_name_str(&method.key)?.to_string();
                    info.add_method(scopes, name, &method.function, method.is_static, &mut writes)?;
                }
                ClassMember::PrivateMethod(method) => {
                    if method.kind != swc_ecma_ast::MethodKind::Method {
                        return Err(unsupported_node!("getter or setter", method.span));
                    }
                    let name = format!("#{}", method.key.id.sym);
                    info.add_method(scopes, name, &method.function, method.is_static, &mut writes)?;
                }
                ClassMember::ClassProp(prop) => {
                    let name = crate::scope::builder::prop_name_str(&prop.key)?.to_string();
                    let ty = initializer_type(scopes, ctor_scope, prop.value.as_deref());
                    info.add_field(name, prop.is_static, ty);
                }
                ClassMember::PrivateProp(prop) => {
                    let name = format!("#{}", prop.key.id.sym);
                    let ty = initializer_type(scopes, ctor_scope, prop.value.as_deref());
                    info.add_field(name, prop.is_static, ty);
                }
                other => return Err(unsupported_node!("class member", swc_common::Spanned::span(other))),
            }
        }

        for (name, ty) in writes.fields {
            info.add_field(name, false, ty);
        }

        for reference in scopes.references() {
            if !scopes.is_within(reference.from, scope) || scopes.is_within(reference.decl, scope) {
                continue;
            }
            let Some(binding) = scopes.get(reference.decl).binding(&reference.name) else {
                continue;
            };
            if binding.kind == BindingKind::Class {
                info.constructs.insert(ClassRef {
                    decl: reference.decl,
                    name: reference.name.clone(),
                });
            } else {
                info.reads_outer = true;
            }
        }

        Ok(info)
    }

    fn add_method(
        &mut self,
        scopes: &ScopeTree,
        name: String,
        function: &'a swc_ecma_ast::Function,
        is_static: bool,
        writes: &mut FieldWrites<'_>,
    ) -> Result<()> {
        let scope = scopes
            .function_scope(function.span)
            .ok_or_else(|| error!("internal: no scope for method {}", name).with_span(function.span))?;
        if self.methods.iter().any(|m| m.name == name) {
            return Err(unsupported_node!(format!("duplicate method {}", name), function.span));
        }
        let (params, param_names) = param_count(function.params.iter().map(|p| &p.pat));
        if let (false, Some(body)) = (is_static, &function.body) {
            writes.scan(scope, body);
        }
        self.methods.push(MethodSlot {
            name,
            scope,
            params,
            param_names,
            is_static,
        });
        Ok(())
    }

    fn add_field(&mut self, name: String, is_static: bool, ty: JsType) {
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => slot.ty = slot.ty.join(ty),
            None => self.fields.push((
                name,
                FieldSlot {
                    is_static,
                    ty: FieldType::Unwritten.join(ty),
                },
            )),
        }
    }

    fn param_name(&self, ndx: u16) -> String {
        self.ctor_param_names
            .get(ndx as usize)
            .cloned()
            .unwrap_or_else(|| format!("arg{}", ndx))
    }
}

/// A class needs scopes when its body reads outer bindings, when its base
/// needs them, or when it constructs a class that needs them.
fn compute_needs_scopes(infos: &mut [ClassInfo<'_>]) {
    for info in infos.iter_mut() {
        info.needs_scopes = info.reads_outer;
    }
    loop {
        let needing: HashSet<ClassRef> = infos
            .iter()
            .filter(|info| info.needs_scopes)
            .map(|info| info.class_ref.clone())
            .collect();
        let mut changed = false;
        for info in infos.iter_mut() {
            if info.needs_scopes {
                continue;
            }
            let base_needs = info.base.as_ref().map_or(false, |base| needing.contains(base));
            if base_needs || info.constructs.iter().any(|c| needing.contains(c)) {
                info.needs_scopes = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

/// `(min, max)` parameter counts: parameters after the first one with a
/// default value are optional.
pub fn param_count<'p>(params: impl Iterator<Item = &'p Pat>) -> (ParamCount, Vec<String>) {
    let mut min = None;
    let mut names = Vec::new();
    for (ndx, pat) in params.enumerate() {
        let name = match pat {
            Pat::Ident(ident) => ident.id.sym.to_string(),
            Pat::Assign(assign) => {
                min.get_or_insert(ndx as u16);
                match assign.left.as_ref() {
                    Pat::Ident(ident) => ident.id.sym.to_string(),
                    _ => format!("arg{}", ndx),
                }
            }
            _ => format!("arg{}", ndx),
        };
        names.push(name);
    }
    let max = names.len() as u16;
    (
        ParamCount {
            min: min.unwrap_or(max),
            max,
        },
        names,
    )
}

fn initializer_type(scopes: &ScopeTree, scope: ScopeId, value: Option<&Expr>) -> JsType {
    match value {
        // An uninitialized field holds `undefined`.
        None => JsType::Unknown,
        Some(expr) => static_type(scopes, scope, expr),
    }
}

/// Conservative static type of an expression evaluated in function scope
/// `scope`.
fn static_type(scopes: &ScopeTree, scope: ScopeId, expr: &Expr) -> JsType {
    use swc_ecma_ast::{Lit, UnaryOp};
    match expr {
        Expr::Lit(Lit::Num(_)) => JsType::Number,
        Expr::Lit(Lit::Bool(_)) => JsType::Boolean,
        Expr::Paren(paren) => static_type(scopes, scope, &paren.expr),
        Expr::Unary(unary) => match unary.op {
            UnaryOp::Minus | UnaryOp::Plus | UnaryOp::Tilde => JsType::Number,
            UnaryOp::Bang => JsType::Boolean,
            _ => JsType::Unknown,
        },
        Expr::Update(_) => JsType::Number,
        Expr::Bin(bin) => match bin.op {
            BinaryOp::Sub
            | BinaryOp::Mul
            | BinaryOp::Div
            | BinaryOp::Mod
            | BinaryOp::Exp
            | BinaryOp::BitAnd
            | BinaryOp::BitOr
            | BinaryOp::BitXor
            | BinaryOp::LShift
            | BinaryOp::RShift
            | BinaryOp::ZeroFillRShift => JsType::Number,
            BinaryOp::Lt
            | BinaryOp::LtEq
            | BinaryOp::Gt
            | BinaryOp::GtEq
            | BinaryOp::EqEq
            | BinaryOp::NotEq
            | BinaryOp::EqEqEq
            | BinaryOp::NotEqEq => JsType::Boolean,
            BinaryOp::Add => {
                let left = static_type(scopes, scope, &bin.left);
                let right = static_type(scopes, scope, &bin.right);
                if left == JsType::Number && right == JsType::Number {
                    JsType::Number
                } else {
                    JsType::Unknown
                }
            }
            _ => JsType::Unknown,
        },
        Expr::Ident(ident) => {
            // Names shadowed by a block of the function are not resolved
            // from the function scope.
            let shadowed = scopes
                .blocks_within(scope)
                .into_iter()
                .any(|block| scopes.get(block).binding(&ident.sym).is_some());
            if shadowed || scopes.get(scope).kind != ScopeKind::Function {
                return JsType::Unknown;
            }
            match scopes.resolve(scope, &ident.sym) {
                Some((_, binding)) => match binding.js_type() {
                    ty @ (JsType::Number | JsType::Boolean) => ty,
                    _ => JsType::Unknown,
                },
                None => JsType::Unknown,
            }
        }
        _ => JsType::Unknown,
    }
}

/// Collects `this.x = ...` and `this.x++` in constructor and method bodies,
/// without entering nested functions.
struct FieldWrites<'s> {
    scopes: &'s ScopeTree,
    scope: Option<ScopeId>,
    fields: Vec<(String, JsType)>,
    returns_value: bool,
}

impl<'s> FieldWrites<'s> {
    fn new(scopes: &'s ScopeTree) -> Self {
        FieldWrites {
            scopes,
            scope: None,
            fields: Vec::new(),
            returns_value: false,
        }
    }

    fn scan(&mut self, scope: ScopeId, body: &swc_ecma_ast::BlockStmt) {
        self.scope = Some(scope);
        self.returns_value = false;
        body.visit_with(self);
    }

    fn this_field(expr: &Expr) -> Option<String> {
        let Expr::Member(member) = expr else {
            return None;
        };
        if !matches!(member.obj.as_ref(), Expr::This(_)) {
            return None;
        }
        match &member.prop {
            MemberProp::Ident(ident) => Some(ident.sym.to_string()),
            MemberProp::PrivateName(private) => Some(format!("#{}", private.id.sym)),
            MemberProp::Computed(_) => None,
        }
    }
}

impl Visit for FieldWrites<'_> {
    fn visit_function(&mut self, _: &swc_ecma_ast::Function) {}
    fn visit_arrow_expr(&mut self, _: &swc_ecma_ast::ArrowExpr) {}
    fn visit_class(&mut self, _: &Class) {}

    fn visit_return_stmt(&mut self, n: &swc_ecma_ast::ReturnStmt) {
        if n.arg.is_some() {
            self.returns_value = true;
        }
        n.visit_children_with(self);
    }

    fn visit_assign_expr(&mut self, n: &AssignExpr) {
        let target = match &n.left {
            PatOrExpr::Expr(expr) => Self::this_field(expr),
            PatOrExpr::Pat(pat) => match pat.as_ref() {
                Pat::Expr(expr) => Self::this_field(expr),
                _ => None,
            },
        };
        if let (Some(name), Some(scope)) = (target, self.scope) {
            let rhs = static_type(self.scopes, scope, &n.right);
            let ty = match n.op {
                swc_ecma_ast::AssignOp::Assign => rhs,
                swc_ecma_ast::AssignOp::AddAssign if rhs == JsType::Number => JsType::Number,
                swc_ecma_ast::AssignOp::AddAssign
                | swc_ecma_ast::AssignOp::AndAssign
                | swc_ecma_ast::AssignOp::OrAssign
                | swc_ecma_ast::AssignOp::NullishAssign => JsType::Unknown,
                _ => JsType::Number,
            };
            self.fields.push((name, ty));
        }
        n.visit_children_with(self);
    }

    fn visit_update_expr(&mut self, n: &UpdateExpr) {
        if let Some(name) = Self::this_field(&n.arg) {
            self.fields.push((name, JsType::Number));
        }
        n.visit_children_with(self);
    }
}

/// Properties written anywhere in the script other than through `this`
/// inside a class body.  Such properties may receive any value, so their
/// fields stay untyped.
#[derive(Default)]
struct DynamicWrites {
    names: HashSet<String>,
    /// A write with a computed key may reach any field.
    any: bool,
    class_depth: usize,
}

impl DynamicWrites {
    fn of_script(script: &Script) -> Self {
        let mut writes = DynamicWrites::default();
        script.visit_with(&mut writes);
        writes
    }

    fn may_write(&self, field: &str) -> bool {
        self.any || self.names.contains(field)
    }

    fn record(&mut self, expr: &Expr) {
        let Expr::Member(member) = expr else {
            return;
        };
        if self.class_depth > 0 && matches!(member.obj.as_ref(), Expr::This(_)) {
            return;
        }
        match &member.prop {
            MemberProp::Ident(ident) => {
                self.names.insert(ident.sym.to_string());
            }
            MemberProp::Computed(computed) => match computed.expr.as_ref() {
                // Field names are identifiers; an index never matches one.
                Expr::Lit(Lit::Num(_)) => {}
                Expr::Lit(Lit::Str(key)) => {
                    self.names.insert(key.value.to_string());
                }
                _ => self.any = true,
            },
            MemberProp::PrivateName(_) => {}
        }
    }
}

impl Visit for DynamicWrites {
    fn visit_class(&mut self, n: &Class) {
        self.class_depth += 1;
        n.visit_children_with(self);
        self.class_depth -= 1;
    }

    fn visit_assign_expr(&mut self, n: &AssignExpr) {
        match &n.left {
            PatOrExpr::Expr(expr) => self.record(expr),
            PatOrExpr::Pat(pat) => {
                if let Pat::Expr(expr) = pat.as_ref() {
                    self.record(expr);
                }
            }
        }
        n.visit_children_with(self);
    }

    fn visit_update_expr(&mut self, n: &UpdateExpr) {
        self.record(&n.arg);
        n.visit_children_with(self);
    }
}

//
// Emission
//

/// Body of the constructor of `class`.  Instance field initializers run
/// right away in a base class, and right after `super(...)` in a derived
/// one.
pub(crate) fn compile_constructor<'a>(
    b: &mut FnBuilder<'a>,
    class: &'a Class,
    ctor: Option<&'a Constructor>,
) -> Result<()> {
    let id = b
        .callable()
        .class
        .ok_or_else(|| error!("internal: constructor {} has no class", b.callable().id))?;
    let entry = b.env().classes.get(id);

    if let Some(field) = entry.scopes_field {
        b.emit(Instr::Ldarg(ArgIndex(0)));
        b.emit(Instr::Ldarg(ArgIndex(1)));
        b.emit(Instr::Stfld(field));
    }

    let mut params = Vec::new();
    for param in ctor.map(|ctor| ctor.params.as_slice()).unwrap_or_default() {
        match param {
            ParamOrTsParamProp::Param(param) => params.push(&param.pat),
            ParamOrTsParamProp::TsParamProp(prop) => return Err(unsupported_node!("parameter property", prop.span)),
        }
    }
    b.prologue(&params)?;

    match entry.base {
        None => emit_field_initializers(b, class)?,
        Some(_) => b.set_pending_field_inits(Some(class)),
    }

    match (ctor, entry.base) {
        (Some(ctor), _) => {
            if let Some(body) = &ctor.body {
                compile_stmts(b, &body.stmts)?;
            }
        }
        // Implicit `constructor(...args) { super(...args); }`
        (None, Some(base)) => {
            let base_entry = b.env().classes.get(base);
            b.emit(Instr::Ldarg(ArgIndex(0)));
            if base_entry.needs_scopes {
                emit_scopes_for(b, base_entry.ctor_scope, class.span)?;
            }
            let first_param = b.callable().first_param;
            for ndx in 0..base_entry.ctor_params.max {
                b.emit(Instr::Ldarg(ArgIndex(first_param + ndx)));
            }
            b.emit(Instr::Call(MethodRef::User(base_entry.ctor)));
            if let Some(class) = b.take_pending_field_inits() {
                emit_field_initializers(b, class)?;
            }
        }
        (None, None) => {}
    }
    Ok(())
}

/// `this.x = <init>` for every instance field declared with an initializer.
pub(crate) fn emit_field_initializers<'a>(b: &mut FnBuilder<'a>, class: &'a Class) -> Result<()> {
    let id = b
        .callable()
        .this_class()
        .ok_or_else(|| error!("internal: field initializers outside of a constructor"))?;
    for member in &class.body {
        let (name, value) = match member {
            ClassMember::ClassProp(prop) if !prop.is_static => {
                (crate::scope::builder::prop_name_str(&prop.key)?.to_string(), prop.value.as_deref())
            }
            ClassMember::PrivateProp(prop) if !prop.is_static => (format!("#{}", prop.key.id.sym), prop.value.as_deref()),
            _ => continue,
        };
        let Some(value) = value else {
            continue;
        };
        let field = b
            .env()
            .classes
            .field(id, &name)
            .ok_or_else(|| error!("internal: field {} was not declared", name))?;
        b.emit(Instr::Ldarg(ArgIndex(0)));
        let emitted = compile_expr(b, value)?;
        b.to_storage(emitted, field.ty);
        b.emit(Instr::Stfld(field.handle));
    }
    Ok(())
}

/// Static field initializers, run where the class declaration appears.
pub(crate) fn emit_static_initializers(b: &mut FnBuilder<'_>, id: ClassId, class: &Class) -> Result<()> {
    for member in &class.body {
        let (name, value) = match member {
            ClassMember::ClassProp(prop) if prop.is_static => {
                (crate::scope::builder::prop_name_str(&prop.key)?.to_string(), prop.value.as_deref())
            }
            ClassMember::PrivateProp(prop) if prop.is_static => (format!("#{}", prop.key.id.sym), prop.value.as_deref()),
            _ => continue,
        };
        let Some(value) = value else {
            continue;
        };
        let field = b
            .env()
            .classes
            .field(id, &name)
            .ok_or_else(|| error!("internal: static field {} was not declared", name))?;
        let emitted = compile_expr(b, value)?;
        b.to_storage(emitted, field.ty);
        b.emit(Instr::Stsfld(field.handle));
    }
    Ok(())
}
