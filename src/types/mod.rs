//! Type resolution.
//!
//! Walks the AST bottom-up, writes a resolved [`Type`] into every node, and
//! flags compile-time constants. Numeric types never promote implicitly:
//! mixing them in arithmetic is `E2004`, conversions go through `as`, which
//! is checked against the cast lattice (i32 <-> i64, u32 <-> u64, any numeric
//! -> f64, narrowing allowed).

use crate::error::{Diagnostic, DiagnosticList, ErrorCode, SourceLocation};
use crate::parser::{Ast, BinaryOp, Literal, NodeId, NodeKind, UnaryOp};
use std::collections::HashMap;

/// Resolved type of an expression or binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    I32,
    I64,
    U32,
    U64,
    F64,
    Bool,
    Str,
    Nil,
    /// Array with a scalar element type.
    Array(ElementType),
    /// A declared struct, by index into the struct table.
    Struct(u16),
    /// A declared function, by index into the function table.
    Function(u16),
    /// Caught error value.
    Error,
    /// Poisoned by an earlier diagnostic; suppresses cascades.
    Unknown,
}

/// Scalar element types an array can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    I32,
    I64,
    U32,
    U64,
    F64,
    Bool,
    Str,
    Any,
}

impl ElementType {
    pub fn as_type(self) -> Type {
        match self {
            ElementType::I32 => Type::I32,
            ElementType::I64 => Type::I64,
            ElementType::U32 => Type::U32,
            ElementType::U64 => Type::U64,
            ElementType::F64 => Type::F64,
            ElementType::Bool => Type::Bool,
            ElementType::Str => Type::Str,
            ElementType::Any => Type::Unknown,
        }
    }
}

/// Unboxed register kinds mirrored by the typed register windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericKind {
    I32,
    I64,
    U32,
    U64,
    F64,
    Bool,
}

pub const NUMERIC_KIND_COUNT: usize = 6;

impl NumericKind {
    pub fn index(self) -> usize {
        match self {
            NumericKind::I32 => 0,
            NumericKind::I64 => 1,
            NumericKind::U32 => 2,
            NumericKind::U64 => 3,
            NumericKind::F64 => 4,
            NumericKind::Bool => 5,
        }
    }
}

impl Type {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Type::I32 | Type::I64 | Type::U32 | Type::U64 | Type::F64
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::I32 | Type::I64 | Type::U32 | Type::U64)
    }

    pub fn numeric_kind(&self) -> Option<NumericKind> {
        match self {
            Type::I32 => Some(NumericKind::I32),
            Type::I64 => Some(NumericKind::I64),
            Type::U32 => Some(NumericKind::U32),
            Type::U64 => Some(NumericKind::U64),
            Type::F64 => Some(NumericKind::F64),
            Type::Bool => Some(NumericKind::Bool),
            _ => None,
        }
    }

    pub fn element_type(&self) -> Option<ElementType> {
        match self {
            Type::I32 => Some(ElementType::I32),
            Type::I64 => Some(ElementType::I64),
            Type::U32 => Some(ElementType::U32),
            Type::U64 => Some(ElementType::U64),
            Type::F64 => Some(ElementType::F64),
            Type::Bool => Some(ElementType::Bool),
            Type::Str => Some(ElementType::Str),
            _ => None,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Type::I32 => "i32".into(),
            Type::I64 => "i64".into(),
            Type::U32 => "u32".into(),
            Type::U64 => "u64".into(),
            Type::F64 => "f64".into(),
            Type::Bool => "bool".into(),
            Type::Str => "string".into(),
            Type::Nil => "nil".into(),
            Type::Array(elem) => format!("[{}]", elem.as_type().name()),
            Type::Struct(idx) => format!("struct#{}", idx),
            Type::Function(idx) => format!("fn#{}", idx),
            Type::Error => "error".into(),
            Type::Unknown => "<unknown>".into(),
        }
    }
}

/// A declared struct: field names and types in declaration order. Field
/// indices double as payload slots at runtime.
#[derive(Debug, Clone)]
pub struct StructInfo {
    pub name: String,
    pub fields: Vec<(String, Type)>,
}

impl StructInfo {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(f, _)| f == name)
    }
}

/// A declared function (top-level, nested, or impl method).
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub name: String,
    pub params: Vec<Type>,
    pub return_type: Type,
    /// AST node of the declaration.
    pub node: NodeId,
}

/// Tables produced by resolution, consumed by the code generator.
#[derive(Debug, Default)]
pub struct TypeContext {
    pub structs: Vec<StructInfo>,
    pub struct_ids: HashMap<String, u16>,
    pub functions: Vec<FunctionInfo>,
    pub function_ids: HashMap<String, u16>,
}

impl TypeContext {
    pub fn struct_info(&self, id: u16) -> &StructInfo {
        &self.structs[id as usize]
    }

    pub fn function_info(&self, id: u16) -> &FunctionInfo {
        &self.functions[id as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindingKind {
    Local,
    Global,
    Static,
    Const,
    Function,
}

#[derive(Debug, Clone)]
struct Binding {
    ty: Type,
    mutable: bool,
    initialized: bool,
    kind: BindingKind,
}

/// Resolve every node of `ast`, returning the declaration tables or the
/// collected diagnostics.
pub fn resolve(ast: &mut Ast) -> Result<TypeContext, Vec<Diagnostic>> {
    let mut resolver = Resolver::new();
    resolver.declare_pass(ast);
    resolver.resolve_pass(ast);
    if resolver.diagnostics.has_errors() {
        Err(resolver.diagnostics.into_vec())
    } else {
        Ok(resolver.context)
    }
}

struct Resolver {
    context: TypeContext,
    diagnostics: DiagnosticList,
    scopes: Vec<HashMap<String, Binding>>,
    /// Return type of the function being resolved, if any.
    current_return: Option<Type>,
    loop_depth: u32,
}

impl Resolver {
    fn new() -> Self {
        Self {
            context: TypeContext::default(),
            diagnostics: DiagnosticList::new(),
            scopes: vec![HashMap::new()],
            current_return: None,
            loop_depth: 0,
        }
    }

    fn error(&mut self, code: ErrorCode, location: SourceLocation, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(code, location, message));
    }

    // ------------------------------------------------------------------
    // Declaration pass: structs and function signatures, so bodies can
    // reference forward declarations.
    // ------------------------------------------------------------------

    fn declare_pass(&mut self, ast: &Ast) {
        // Structs first so function signatures can mention them.
        for &root in &ast.roots {
            if let NodeKind::StructDecl { name, .. } = ast.kind(root) {
                if self.context.struct_ids.contains_key(name) {
                    self.error(
                        ErrorCode::VariableRedefinition,
                        ast.node(root).location,
                        format!("struct `{}` is already defined", name),
                    );
                    continue;
                }
                let id = self.context.structs.len() as u16;
                self.context.struct_ids.insert(name.clone(), id);
                self.context.structs.push(StructInfo {
                    name: name.clone(),
                    fields: Vec::new(),
                });
            }
        }
        // Fill in struct fields now that every struct name is known.
        for &root in &ast.roots {
            if let NodeKind::StructDecl { name, fields } = ast.kind(root) {
                let resolved: Vec<(String, Type)> = fields
                    .iter()
                    .map(|f| {
                        let ty = self.named_type(&f.type_name, ast.node(root).location);
                        (f.name.clone(), ty)
                    })
                    .collect();
                if let Some(&id) = self.context.struct_ids.get(name) {
                    self.context.structs[id as usize].fields = resolved;
                }
            }
        }
        // Function signatures: top level and impl methods.
        for &root in &ast.roots {
            match ast.kind(root) {
                NodeKind::Function { .. } => self.declare_function(ast, root, None),
                NodeKind::ImplBlock { target, methods } => {
                    let target = target.clone();
                    for &method in methods {
                        self.declare_function(ast, method, Some(&target));
                    }
                }
                _ => {}
            }
        }
    }

    fn declare_function(&mut self, ast: &Ast, node: NodeId, owner: Option<&str>) {
        let location = ast.node(node).location;
        let NodeKind::Function {
            name,
            params,
            return_type,
            ..
        } = ast.kind(node)
        else {
            return;
        };
        let qualified = match owner {
            Some(owner) => format!("{}.{}", owner, name),
            None => name.clone(),
        };
        if self.context.function_ids.contains_key(&qualified) {
            self.error(
                ErrorCode::VariableRedefinition,
                location,
                format!("function `{}` is already defined", qualified),
            );
            return;
        }
        let param_types: Vec<Type> = params
            .iter()
            .map(|p| self.named_type(&p.type_name, p.location))
            .collect();
        let ret = match return_type {
            Some(name) => self.named_type(name, location),
            None => Type::Nil,
        };
        let id = self.context.functions.len() as u16;
        self.context.function_ids.insert(qualified.clone(), id);
        self.context.functions.push(FunctionInfo {
            name: qualified,
            params: param_types,
            return_type: ret,
            node,
        });
    }

    fn named_type(&mut self, name: &str, location: SourceLocation) -> Type {
        match name {
            "i32" => Type::I32,
            "i64" => Type::I64,
            "u32" => Type::U32,
            "u64" => Type::U64,
            "f64" => Type::F64,
            "bool" => Type::Bool,
            "string" | "str" => Type::Str,
            "nil" => Type::Nil,
            other => {
                if let Some(&id) = self.context.struct_ids.get(other) {
                    Type::Struct(id)
                } else {
                    self.error(
                        ErrorCode::UndefinedType,
                        location,
                        format!("undefined type `{}`", other),
                    );
                    Type::Unknown
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn end_scope(&mut self) {
        self.scopes.pop();
    }

    fn declare(&mut self, name: &str, binding: Binding, location: SourceLocation) {
        let scope = self.scopes.last_mut().expect("scope stack never empty");
        if scope.contains_key(name) {
            self.error(
                ErrorCode::VariableRedefinition,
                location,
                format!("`{}` is already defined in this scope", name),
            );
            return;
        }
        scope.insert(name.to_string(), binding);
    }

    fn lookup(&self, name: &str) -> Option<&Binding> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn lookup_mut(&mut self, name: &str) -> Option<&mut Binding> {
        self.scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.get_mut(name))
    }

    // ------------------------------------------------------------------
    // Resolution pass
    // ------------------------------------------------------------------

    fn resolve_pass(&mut self, ast: &mut Ast) {
        let roots = ast.roots.clone();
        for root in roots {
            self.resolve_node(ast, root);
        }
    }

    fn set(&mut self, ast: &mut Ast, id: NodeId, ty: Type, constant: bool) -> Type {
        let node = ast.node_mut(id);
        node.ty = Some(ty);
        node.constant = constant;
        ty
    }

    fn resolve_node(&mut self, ast: &mut Ast, id: NodeId) -> Type {
        let location = ast.node(id).location;
        match ast.kind(id).clone() {
            NodeKind::Literal(lit) => {
                let ty = lit.natural_type();
                self.set(ast, id, ty, true)
            }
            NodeKind::Identifier(name) => {
                let (ty, constant) = match self.lookup(&name) {
                    Some(binding) => {
                        if !binding.initialized {
                            let msg = format!("`{}` is used before it is initialized", name);
                            let ty = binding.ty;
                            self.error(ErrorCode::UninitializedVariable, location, msg);
                            (ty, false)
                        } else {
                            (binding.ty, binding.kind == BindingKind::Const)
                        }
                    }
                    None => {
                        self.error(
                            ErrorCode::UndefinedVariable,
                            location,
                            format!("undefined variable `{}`", name),
                        );
                        (Type::Unknown, false)
                    }
                };
                self.set(ast, id, ty, constant)
            }
            NodeKind::Binary { op, lhs, rhs } => {
                let lt = self.resolve_node(ast, lhs);
                let rt = self.resolve_node(ast, rhs);
                let constant = ast.node(lhs).constant && ast.node(rhs).constant;
                let ty = self.binary_type(op, lt, rt, location);
                self.set(ast, id, ty, constant && ty != Type::Unknown)
            }
            NodeKind::Unary { op, operand } => {
                let ot = self.resolve_node(ast, operand);
                let constant = ast.node(operand).constant;
                let ty = match op {
                    UnaryOp::Negate => match ot {
                        Type::I32 | Type::I64 | Type::F64 => ot,
                        Type::U32 | Type::U64 => {
                            self.error(
                                ErrorCode::UnsupportedOperation,
                                location,
                                "cannot negate an unsigned value",
                            );
                            Type::Unknown
                        }
                        Type::Unknown => Type::Unknown,
                        other => {
                            self.error(
                                ErrorCode::UnsupportedOperation,
                                location,
                                format!("cannot negate `{}`", other.name()),
                            );
                            Type::Unknown
                        }
                    },
                    UnaryOp::Not => match ot {
                        Type::Bool | Type::Unknown => Type::Bool,
                        other => {
                            self.error(
                                ErrorCode::TypeMismatch,
                                location,
                                format!("`!` expects bool, found `{}`", other.name()),
                            );
                            Type::Unknown
                        }
                    },
                };
                self.set(ast, id, ty, constant && ty != Type::Unknown)
            }
            NodeKind::Ternary {
                condition,
                then_value,
                else_value,
            } => {
                let ct = self.resolve_node(ast, condition);
                self.expect_bool(ct, ast.node(condition).location, "ternary condition");
                let tt = self.resolve_node(ast, then_value);
                let et = self.resolve_node(ast, else_value);
                let ty = if tt == et || et == Type::Unknown {
                    tt
                } else if tt == Type::Unknown {
                    et
                } else {
                    self.error(
                        ErrorCode::IncompatibleTypes,
                        location,
                        format!(
                            "ternary branches disagree: `{}` vs `{}`",
                            tt.name(),
                            et.name()
                        ),
                    );
                    Type::Unknown
                };
                self.set(ast, id, ty, false)
            }
            NodeKind::Cast { value, target } => {
                let vt = self.resolve_node(ast, value);
                let tt = self.named_type(&target, location);
                let ok = match (vt, tt) {
                    (Type::Unknown, _) | (_, Type::Unknown) => true,
                    // i32 <-> i64, u32 <-> u64, anything numeric -> f64,
                    // narrowing allowed.
                    (a, b) if a.is_numeric() && b.is_numeric() => true,
                    _ => false,
                };
                if !ok {
                    self.error(
                        ErrorCode::InvalidCast,
                        location,
                        format!("cannot cast `{}` to `{}`", vt.name(), tt.name()),
                    );
                }
                self.set(ast, id, tt, false)
            }
            NodeKind::Call { callee, args } => {
                let ty = self.resolve_call(ast, id, callee, &args, location);
                self.set(ast, id, ty, false)
            }
            NodeKind::Index { target, index } => {
                let tt = self.resolve_node(ast, target);
                let it = self.resolve_node(ast, index);
                if !it.is_integer() && it != Type::Unknown {
                    self.error(
                        ErrorCode::TypeMismatch,
                        location,
                        format!("array index must be an integer, found `{}`", it.name()),
                    );
                }
                let ty = match tt {
                    Type::Array(elem) => elem.as_type(),
                    Type::Unknown => Type::Unknown,
                    other => {
                        self.error(
                            ErrorCode::UnsupportedOperation,
                            location,
                            format!("cannot index `{}`", other.name()),
                        );
                        Type::Unknown
                    }
                };
                self.set(ast, id, ty, false)
            }
            NodeKind::FieldAccess { target, field } => {
                let tt = self.resolve_node(ast, target);
                let ty = match tt {
                    Type::Struct(sid) => {
                        let info = self.context.struct_info(sid);
                        match info.fields.iter().find(|(name, _)| *name == field) {
                            Some((_, field_ty)) => *field_ty,
                            None => {
                                let msg = format!(
                                    "struct `{}` has no field `{}`",
                                    info.name, field
                                );
                                self.error(ErrorCode::UndefinedVariable, location, msg);
                                Type::Unknown
                            }
                        }
                    }
                    Type::Unknown => Type::Unknown,
                    other => {
                        self.error(
                            ErrorCode::UnsupportedOperation,
                            location,
                            format!("`{}` has no fields", other.name()),
                        );
                        Type::Unknown
                    }
                };
                self.set(ast, id, ty, false)
            }
            NodeKind::ArrayLiteral(elements) => {
                let mut elem: Option<Type> = None;
                for &e in &elements {
                    let et = self.resolve_node(ast, e);
                    match elem {
                        None => elem = Some(et),
                        Some(prev) if prev != et && et != Type::Unknown && prev != Type::Unknown => {
                            self.error(
                                ErrorCode::IncompatibleTypes,
                                ast.node(e).location,
                                format!(
                                    "array elements disagree: `{}` vs `{}`",
                                    prev.name(),
                                    et.name()
                                ),
                            );
                        }
                        _ => {}
                    }
                }
                let element = elem
                    .and_then(|t| t.element_type())
                    .unwrap_or(ElementType::Any);
                self.set(ast, id, Type::Array(element), false)
            }
            NodeKind::Assign { target, value } => {
                let ty = self.resolve_assign(ast, target, value, location);
                self.set(ast, id, ty, false)
            }
            NodeKind::Let {
                name,
                mutable,
                type_annotation,
                init,
            } => {
                let declared = type_annotation
                    .as_deref()
                    .map(|t| self.named_type(t, location));
                let init_ty = init.map(|e| self.resolve_node(ast, e));
                let ty = match (declared, init_ty) {
                    (Some(d), Some(i)) => {
                        if d != i && i != Type::Unknown && d != Type::Unknown {
                            self.error(
                                ErrorCode::TypeMismatch,
                                location,
                                format!(
                                    "`{}` declared as `{}` but initialized with `{}`",
                                    name,
                                    d.name(),
                                    i.name()
                                ),
                            );
                        }
                        d
                    }
                    (Some(d), None) => d,
                    (None, Some(i)) => i,
                    (None, None) => {
                        self.error(
                            ErrorCode::TypeAnnotationRequired,
                            location,
                            format!("`{}` needs a type annotation or an initializer", name),
                        );
                        Type::Unknown
                    }
                };
                self.declare(
                    &name,
                    Binding {
                        ty,
                        mutable,
                        initialized: init.is_some(),
                        kind: if self.scopes.len() == 1 {
                            BindingKind::Global
                        } else {
                            BindingKind::Local
                        },
                    },
                    location,
                );
                self.set(ast, id, Type::Nil, false)
            }
            NodeKind::Const { name, init } => {
                let ty = self.resolve_node(ast, init);
                if !ast.node(init).constant {
                    self.error(
                        ErrorCode::TypeMismatch,
                        location,
                        format!("`{}` must be initialized with a constant expression", name),
                    );
                }
                self.declare(
                    &name,
                    Binding {
                        ty,
                        mutable: false,
                        initialized: true,
                        kind: BindingKind::Const,
                    },
                    location,
                );
                self.set(ast, id, Type::Nil, false)
            }
            NodeKind::Static { name, mutable, init } => {
                let ty = self.resolve_node(ast, init);
                self.declare(
                    &name,
                    Binding {
                        ty,
                        mutable,
                        initialized: true,
                        kind: BindingKind::Static,
                    },
                    location,
                );
                self.set(ast, id, Type::Nil, false)
            }
            NodeKind::Function { .. } => {
                self.resolve_function(ast, id, None);
                self.set(ast, id, Type::Nil, false)
            }
            NodeKind::StructDecl { .. } => self.set(ast, id, Type::Nil, false),
            NodeKind::ImplBlock { target, methods } => {
                for method in methods {
                    self.resolve_function(ast, method, Some(&target));
                }
                self.set(ast, id, Type::Nil, false)
            }
            NodeKind::If {
                condition,
                then_block,
                else_block,
            } => {
                let ct = self.resolve_node(ast, condition);
                self.expect_bool(ct, ast.node(condition).location, "if condition");
                self.begin_scope();
                for stmt in then_block {
                    self.resolve_node(ast, stmt);
                }
                self.end_scope();
                if let Some(else_block) = else_block {
                    self.begin_scope();
                    for stmt in else_block {
                        self.resolve_node(ast, stmt);
                    }
                    self.end_scope();
                }
                self.set(ast, id, Type::Nil, false)
            }
            NodeKind::While { condition, body } => {
                let ct = self.resolve_node(ast, condition);
                self.expect_bool(ct, ast.node(condition).location, "while condition");
                self.begin_scope();
                self.loop_depth += 1;
                for stmt in body {
                    self.resolve_node(ast, stmt);
                }
                self.loop_depth -= 1;
                self.end_scope();
                self.set(ast, id, Type::Nil, false)
            }
            NodeKind::For {
                var,
                start,
                end,
                step,
                body,
            } => {
                let st = self.resolve_node(ast, start);
                let et = self.resolve_node(ast, end);
                if st != et && st != Type::Unknown && et != Type::Unknown {
                    self.error(
                        ErrorCode::MixedArithmetic,
                        location,
                        format!(
                            "range endpoints disagree: `{}` vs `{}`",
                            st.name(),
                            et.name()
                        ),
                    );
                }
                if !st.is_integer() && st != Type::Unknown {
                    self.error(
                        ErrorCode::TypeMismatch,
                        location,
                        format!("range endpoints must be integers, found `{}`", st.name()),
                    );
                }
                if let Some(step) = step {
                    let pt = self.resolve_node(ast, step);
                    if pt != st && pt != Type::Unknown && st != Type::Unknown {
                        self.error(
                            ErrorCode::MixedArithmetic,
                            location,
                            format!("range step must be `{}`, found `{}`", st.name(), pt.name()),
                        );
                    }
                }
                self.begin_scope();
                // The induction variable is read-only inside the body.
                self.declare(
                    &var,
                    Binding {
                        ty: st,
                        mutable: false,
                        initialized: true,
                        kind: BindingKind::Local,
                    },
                    location,
                );
                self.loop_depth += 1;
                for stmt in body {
                    self.resolve_node(ast, stmt);
                }
                self.loop_depth -= 1;
                self.end_scope();
                self.set(ast, id, Type::Nil, false)
            }
            NodeKind::ForEach {
                var,
                iterable,
                body,
            } => {
                let it = self.resolve_node(ast, iterable);
                let elem = match it {
                    Type::Array(elem) => elem.as_type(),
                    Type::Unknown => Type::Unknown,
                    other => {
                        self.error(
                            ErrorCode::UnsupportedOperation,
                            location,
                            format!("cannot iterate over `{}`", other.name()),
                        );
                        Type::Unknown
                    }
                };
                self.begin_scope();
                self.declare(
                    &var,
                    Binding {
                        ty: elem,
                        mutable: false,
                        initialized: true,
                        kind: BindingKind::Local,
                    },
                    location,
                );
                self.loop_depth += 1;
                for stmt in body {
                    self.resolve_node(ast, stmt);
                }
                self.loop_depth -= 1;
                self.end_scope();
                self.set(ast, id, Type::Nil, false)
            }
            NodeKind::Return(value) => {
                let value_ty = value.map(|v| self.resolve_node(ast, v)).unwrap_or(Type::Nil);
                match self.current_return {
                    None => {
                        self.error(
                            ErrorCode::ScopeViolation,
                            location,
                            "`return` outside of a function",
                        );
                    }
                    Some(expected) => {
                        if expected != value_ty
                            && value_ty != Type::Unknown
                            && expected != Type::Unknown
                        {
                            self.error(
                                ErrorCode::TypeMismatch,
                                location,
                                format!(
                                    "return type is `{}`, found `{}`",
                                    expected.name(),
                                    value_ty.name()
                                ),
                            );
                        }
                    }
                }
                self.set(ast, id, Type::Nil, false)
            }
            NodeKind::Break | NodeKind::Continue => {
                if self.loop_depth == 0 {
                    self.error(
                        ErrorCode::ScopeViolation,
                        location,
                        "`break`/`continue` outside of a loop",
                    );
                }
                self.set(ast, id, Type::Nil, false)
            }
            NodeKind::Import(_) | NodeKind::Use(_) => self.set(ast, id, Type::Nil, false),
            NodeKind::Try {
                body,
                catch_name,
                catch_body,
            } => {
                self.begin_scope();
                for stmt in body {
                    self.resolve_node(ast, stmt);
                }
                self.end_scope();
                self.begin_scope();
                self.declare(
                    &catch_name,
                    Binding {
                        ty: Type::Error,
                        mutable: false,
                        initialized: true,
                        kind: BindingKind::Local,
                    },
                    location,
                );
                for stmt in catch_body {
                    self.resolve_node(ast, stmt);
                }
                self.end_scope();
                self.set(ast, id, Type::Nil, false)
            }
            NodeKind::Print(args) => {
                for arg in args {
                    self.resolve_node(ast, arg);
                }
                self.set(ast, id, Type::Nil, false)
            }
            NodeKind::Block(body) => {
                self.begin_scope();
                for stmt in body {
                    self.resolve_node(ast, stmt);
                }
                self.end_scope();
                self.set(ast, id, Type::Nil, false)
            }
            NodeKind::ExprStmt(expr) => {
                self.resolve_node(ast, expr);
                self.set(ast, id, Type::Nil, false)
            }
        }
    }

    fn resolve_function(&mut self, ast: &mut Ast, id: NodeId, owner: Option<&str>) {
        let NodeKind::Function {
            name, params, body, ..
        } = ast.kind(id).clone()
        else {
            return;
        };
        let qualified = match owner {
            Some(owner) => format!("{}.{}", owner, name),
            None => name.clone(),
        };
        // Nested functions may not have been declared by the top-level pass.
        if !self.context.function_ids.contains_key(&qualified) {
            self.declare_function(ast, id, owner);
        }
        let Some(&fid) = self.context.function_ids.get(&qualified) else {
            return;
        };
        let info = self.context.functions[fid as usize].clone();

        // Bind the function name in the current scope so calls resolve.
        let scope = self.scopes.last_mut().expect("scope stack never empty");
        scope
            .entry(qualified.clone())
            .or_insert(Binding {
                ty: Type::Function(fid),
                mutable: false,
                initialized: true,
                kind: BindingKind::Function,
            });

        let saved_return = self.current_return.replace(info.return_type);
        let saved_loop_depth = std::mem::take(&mut self.loop_depth);
        self.begin_scope();
        for (param, ty) in params.iter().zip(info.params.iter()) {
            self.declare(
                &param.name,
                Binding {
                    ty: *ty,
                    mutable: false,
                    initialized: true,
                    kind: BindingKind::Local,
                },
                param.location,
            );
        }
        for stmt in body {
            self.resolve_node(ast, stmt);
        }
        self.end_scope();
        self.loop_depth = saved_loop_depth;
        self.current_return = saved_return;
    }

    fn resolve_call(
        &mut self,
        ast: &mut Ast,
        _id: NodeId,
        callee: NodeId,
        args: &[NodeId],
        location: SourceLocation,
    ) -> Type {
        // Method call sugar: `value.method(args)` resolves to the function
        // `Struct.method` with `value` as the implicit first argument.
        if let NodeKind::FieldAccess { target, field } = ast.kind(callee).clone() {
            let tt = self.resolve_node(ast, target);
            if let Type::Struct(sid) = tt {
                let struct_name = self.context.struct_info(sid).name.clone();
                let qualified = format!("{}.{}", struct_name, field);
                if let Some(&fid) = self.context.function_ids.get(&qualified) {
                    ast.node_mut(callee).ty = Some(Type::Function(fid));
                    let info = self.context.function_info(fid).clone();
                    let mut arg_types = vec![tt];
                    for &arg in args {
                        arg_types.push(self.resolve_node(ast, arg));
                    }
                    return self.check_signature(&info, &arg_types, location);
                }
                self.error(
                    ErrorCode::UndefinedVariable,
                    location,
                    format!("`{}` has no method `{}`", struct_name, field),
                );
                return Type::Unknown;
            }
            // Not a struct: fall through and resolve as a field access call,
            // which reports its own error.
        }

        let NodeKind::Identifier(name) = ast.kind(callee).clone() else {
            self.error(
                ErrorCode::UnsupportedOperation,
                location,
                "only named functions and struct constructors can be called",
            );
            return Type::Unknown;
        };

        // Array builtins, unless shadowed by a user function.
        if !self.context.function_ids.contains_key(&name) {
            match (name.as_str(), args.len()) {
                ("len", 1) => {
                    let at = self.resolve_node(ast, args[0]);
                    if !matches!(at, Type::Array(_) | Type::Unknown) {
                        self.error(
                            ErrorCode::TypeMismatch,
                            location,
                            format!("`len` expects an array, found `{}`", at.name()),
                        );
                    }
                    return Type::I32;
                }
                ("push", 2) => {
                    let at = self.resolve_node(ast, args[0]);
                    let vt = self.resolve_node(ast, args[1]);
                    match at {
                        Type::Array(elem) => {
                            let et = elem.as_type();
                            if et != vt && vt != Type::Unknown && et != Type::Unknown {
                                self.error(
                                    ErrorCode::TypeMismatch,
                                    location,
                                    format!(
                                        "cannot push `{}` into `{}`",
                                        vt.name(),
                                        at.name()
                                    ),
                                );
                            }
                        }
                        Type::Unknown => {}
                        other => {
                            self.error(
                                ErrorCode::TypeMismatch,
                                location,
                                format!("`push` expects an array, found `{}`", other.name()),
                            );
                        }
                    }
                    return Type::Nil;
                }
                _ => {}
            }
        }

        // Struct constructor: `Point(1, 2)`.
        if let Some(&sid) = self.context.struct_ids.get(&name) {
            ast.node_mut(callee).ty = Some(Type::Struct(sid));
            let info = self.context.struct_info(sid).clone();
            if args.len() != info.fields.len() {
                self.error(
                    ErrorCode::TypeMismatch,
                    location,
                    format!(
                        "`{}` has {} field(s) but {} argument(s) were given",
                        name,
                        info.fields.len(),
                        args.len()
                    ),
                );
            }
            for (&arg, (fname, fty)) in args.iter().zip(info.fields.iter()) {
                let at = self.resolve_node(ast, arg);
                if at != *fty && at != Type::Unknown && *fty != Type::Unknown {
                    self.error(
                        ErrorCode::TypeMismatch,
                        ast.node(arg).location,
                        format!(
                            "field `{}` is `{}`, found `{}`",
                            fname,
                            fty.name(),
                            at.name()
                        ),
                    );
                }
            }
            return Type::Struct(sid);
        }

        if let Some(&fid) = self.context.function_ids.get(&name) {
            ast.node_mut(callee).ty = Some(Type::Function(fid));
            let info = self.context.function_info(fid).clone();
            let mut arg_types = Vec::with_capacity(args.len());
            for &arg in args {
                arg_types.push(self.resolve_node(ast, arg));
            }
            return self.check_signature(&info, &arg_types, location);
        }

        self.error(
            ErrorCode::UndefinedVariable,
            location,
            format!("undefined function `{}`", name),
        );
        for &arg in args {
            self.resolve_node(ast, arg);
        }
        Type::Unknown
    }

    fn check_signature(
        &mut self,
        info: &FunctionInfo,
        arg_types: &[Type],
        location: SourceLocation,
    ) -> Type {
        if arg_types.len() != info.params.len() {
            self.error(
                ErrorCode::TypeMismatch,
                location,
                format!(
                    "`{}` takes {} argument(s) but {} were given",
                    info.name,
                    info.params.len(),
                    arg_types.len()
                ),
            );
            return info.return_type;
        }
        for (i, (arg, param)) in arg_types.iter().zip(info.params.iter()).enumerate() {
            if arg != param && *arg != Type::Unknown && *param != Type::Unknown {
                self.error(
                    ErrorCode::TypeMismatch,
                    location,
                    format!(
                        "argument {} of `{}` is `{}`, found `{}`",
                        i + 1,
                        info.name,
                        param.name(),
                        arg.name()
                    ),
                );
            }
        }
        info.return_type
    }

    fn resolve_assign(
        &mut self,
        ast: &mut Ast,
        target: NodeId,
        value: NodeId,
        location: SourceLocation,
    ) -> Type {
        let value_ty = self.resolve_node(ast, value);
        match ast.kind(target).clone() {
            NodeKind::Identifier(name) => {
                let (target_ty, assignable) = match self.lookup(&name) {
                    Some(binding) => (binding.ty, binding.mutable || !binding.initialized),
                    None => {
                        self.error(
                            ErrorCode::UndefinedVariable,
                            location,
                            format!("undefined variable `{}`", name),
                        );
                        (Type::Unknown, true)
                    }
                };
                if !assignable {
                    self.error(
                        ErrorCode::ImmutableAssignment,
                        location,
                        format!("cannot assign to immutable binding `{}`", name),
                    );
                }
                if target_ty != value_ty
                    && value_ty != Type::Unknown
                    && target_ty != Type::Unknown
                {
                    self.error(
                        ErrorCode::TypeMismatch,
                        location,
                        format!(
                            "`{}` is `{}`, cannot assign `{}`",
                            name,
                            target_ty.name(),
                            value_ty.name()
                        ),
                    );
                }
                if let Some(binding) = self.lookup_mut(&name) {
                    binding.initialized = true;
                }
                ast.node_mut(target).ty = Some(target_ty);
                target_ty
            }
            NodeKind::Index { .. } => {
                let elem_ty = self.resolve_node(ast, target);
                if elem_ty != value_ty && value_ty != Type::Unknown && elem_ty != Type::Unknown {
                    self.error(
                        ErrorCode::TypeMismatch,
                        location,
                        format!(
                            "element type is `{}`, cannot assign `{}`",
                            elem_ty.name(),
                            value_ty.name()
                        ),
                    );
                }
                elem_ty
            }
            NodeKind::FieldAccess { .. } => {
                let field_ty = self.resolve_node(ast, target);
                if field_ty != value_ty && value_ty != Type::Unknown && field_ty != Type::Unknown {
                    self.error(
                        ErrorCode::TypeMismatch,
                        location,
                        format!(
                            "field type is `{}`, cannot assign `{}`",
                            field_ty.name(),
                            value_ty.name()
                        ),
                    );
                }
                field_ty
            }
            _ => {
                self.error(
                    ErrorCode::UnexpectedToken,
                    location,
                    "invalid assignment target",
                );
                Type::Unknown
            }
        }
    }

    fn binary_type(
        &mut self,
        op: BinaryOp,
        lt: Type,
        rt: Type,
        location: SourceLocation,
    ) -> Type {
        if lt == Type::Unknown || rt == Type::Unknown {
            return Type::Unknown;
        }
        if op.is_arithmetic() {
            // String concatenation rides on `+`.
            if op == BinaryOp::Add && lt == Type::Str && rt == Type::Str {
                return Type::Str;
            }
            if lt.is_numeric() && rt.is_numeric() {
                if lt == rt {
                    return lt;
                }
                self.error(
                    ErrorCode::MixedArithmetic,
                    location,
                    format!(
                        "mixed-type arithmetic: `{}` {} `{}` (use `as` to convert)",
                        lt.name(),
                        op.symbol(),
                        rt.name()
                    ),
                );
                return Type::Unknown;
            }
            self.error(
                ErrorCode::UnsupportedOperation,
                location,
                format!(
                    "`{}` is not defined for `{}` and `{}`",
                    op.symbol(),
                    lt.name(),
                    rt.name()
                ),
            );
            return Type::Unknown;
        }
        if op.is_comparison() {
            if lt == rt {
                return Type::Bool;
            }
            if lt.is_numeric() && rt.is_numeric() {
                self.error(
                    ErrorCode::MixedArithmetic,
                    location,
                    format!(
                        "cannot compare `{}` with `{}` (use `as` to convert)",
                        lt.name(),
                        rt.name()
                    ),
                );
            } else {
                self.error(
                    ErrorCode::IncompatibleTypes,
                    location,
                    format!("cannot compare `{}` with `{}`", lt.name(), rt.name()),
                );
            }
            return Type::Unknown;
        }
        if op.is_bitwise() {
            if lt.is_integer() && lt == rt {
                return lt;
            }
            self.error(
                ErrorCode::UnsupportedOperation,
                location,
                format!(
                    "`{}` needs matching integer operands, found `{}` and `{}`",
                    op.symbol(),
                    lt.name(),
                    rt.name()
                ),
            );
            return Type::Unknown;
        }
        // Logical
        if lt == Type::Bool && rt == Type::Bool {
            return Type::Bool;
        }
        self.error(
            ErrorCode::TypeMismatch,
            location,
            format!(
                "`{}` expects bool operands, found `{}` and `{}`",
                op.symbol(),
                lt.name(),
                rt.name()
            ),
        );
        Type::Unknown
    }

    fn expect_bool(&mut self, ty: Type, location: SourceLocation, what: &str) {
        if ty != Type::Bool && ty != Type::Unknown {
            self.error(
                ErrorCode::TypeMismatch,
                location,
                format!("{} must be bool, found `{}`", what, ty.name()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn resolve_source(source: &str) -> Result<TypeContext, Vec<Diagnostic>> {
        let mut outcome = parse(source);
        assert!(
            outcome.diagnostics.is_empty(),
            "parse errors: {:?}",
            outcome.diagnostics
        );
        resolve(&mut outcome.ast)
    }

    fn first_error(source: &str) -> ErrorCode {
        resolve_source(source).unwrap_err()[0].code
    }

    #[test]
    fn test_literal_types() {
        assert!(resolve_source("let a = 1\nlet b = 1i64\nlet c = 2.5\nlet d = true").is_ok());
    }

    #[test]
    fn test_suffix_wins() {
        let mut outcome = parse("let a = 42u64");
        resolve(&mut outcome.ast).unwrap();
        let NodeKind::Let { init: Some(init), .. } = outcome.ast.kind(outcome.ast.roots[0]) else {
            panic!();
        };
        assert_eq!(outcome.ast.ty(*init), Some(Type::U64));
    }

    #[test]
    fn test_mixed_arithmetic_is_e2004() {
        assert_eq!(first_error("let a = 1 + 2i64"), ErrorCode::MixedArithmetic);
    }

    #[test]
    fn test_comparison_produces_bool() {
        let mut outcome = parse("let a = 1 < 2");
        resolve(&mut outcome.ast).unwrap();
        let NodeKind::Let { init: Some(init), .. } = outcome.ast.kind(outcome.ast.roots[0]) else {
            panic!();
        };
        assert_eq!(outcome.ast.ty(*init), Some(Type::Bool));
    }

    #[test]
    fn test_immutable_assignment_is_e2008() {
        assert_eq!(
            first_error("let x = 1\nx = 2"),
            ErrorCode::ImmutableAssignment
        );
    }

    #[test]
    fn test_mut_assignment_ok() {
        assert!(resolve_source("mut x = 1\nx = 2").is_ok());
    }

    #[test]
    fn test_undefined_variable_is_e1010() {
        assert_eq!(first_error("print(missing)"), ErrorCode::UndefinedVariable);
    }

    #[test]
    fn test_cast_lattice() {
        assert!(resolve_source("let a = 1 as i64\nlet b = 2i64 as i32\nlet c = 3 as f64").is_ok());
        assert_eq!(
            first_error("let a = true as i32"),
            ErrorCode::InvalidCast
        );
    }

    #[test]
    fn test_function_signature_checked() {
        assert!(resolve_source("fn add(a: i32, b: i32) -> i32 { return a + b }\nlet x = add(1, 2)").is_ok());
        assert_eq!(
            first_error("fn f(a: i32) { }\nf(true)"),
            ErrorCode::TypeMismatch
        );
    }

    #[test]
    fn test_struct_construction_and_fields() {
        let src = "struct Point { x: i32, y: i32 }\nlet p = Point(1, 2)\nlet x = p.x";
        assert!(resolve_source(src).is_ok());
    }

    #[test]
    fn test_method_call() {
        let src = "struct Point { x: i32, y: i32 }\nimpl Point { fn sum(self: Point) -> i32 { return self.x + self.y } }\nlet p = Point(1, 2)\nlet s = p.sum()";
        assert!(resolve_source(src).is_ok());
    }

    #[test]
    fn test_break_outside_loop() {
        assert_eq!(first_error("break"), ErrorCode::ScopeViolation);
    }

    #[test]
    fn test_const_requires_constant() {
        assert!(resolve_source("const N = 1 + 2").is_ok());
        assert_eq!(
            first_error("mut x = 1\nconst N = x"),
            ErrorCode::TypeMismatch
        );
    }
}
