// AST nodes.
//
// Nodes live in a flat arena and reference each other by index, which makes
// the template-injection clone a structural walk instead of a deep
// polymorphic copy. Each node kind knows its static type (`expr_type`) and
// how to resolve names/overloads in place (`resolve_expr`); lowering to
// bytecode lives in `emit`.

use crate::class::resolve_overload;
use crate::modules;
use crate::program::Program;
use crate::template::TemplateCommand;
use crate::types::*;
use crate::value::Value;
use std::rc::Rc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExprId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Less,
    Greater,
    LessEq,
    GreaterEq,
    Eq,
    NotEq,
    BitAnd,
    BitOr,
    Shl,
    Shr,
    LogicalAnd,
    LogicalOr,
}

impl BinOp {
    /// Operator-overload spelling, for the ops a class may define.
    pub fn overload_name(self) -> Option<&'static str> {
        match self {
            BinOp::Add => Some("operator+"),
            BinOp::Sub => Some("operator-"),
            BinOp::Mul => Some("operator*"),
            BinOp::Div => Some("operator/"),
            BinOp::Mod => Some("operator%"),
            BinOp::Less => Some("operator<"),
            BinOp::Greater => Some("operator>"),
            BinOp::LessEq => Some("operator<="),
            BinOp::GreaterEq => Some("operator>="),
            BinOp::Eq => Some("operator=="),
            BinOp::NotEq => Some("operator!="),
            _ => None,
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Less | BinOp::Greater | BinOp::LessEq | BinOp::GreaterEq | BinOp::Eq | BinOp::NotEq
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::LogicalAnd | BinOp::LogicalOr)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpdateOp {
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

/// Resolution result for anything that ends up a function call.
#[derive(Clone, Debug)]
pub struct CallInfo {
    /// Declaring class of the selected function.
    pub class_id: TypeId,
    pub fn_id: u16,
    /// Per-argument implicit-cast constructor ids (INVALID_ID = none).
    pub cast_fns: Vec<u16>,
    /// VTable slot when the call dispatches virtually.
    pub virtual_slot: u16,
}

impl CallInfo {
    pub fn unresolved() -> CallInfo {
        CallInfo {
            class_id: INVALID_ID,
            fn_id: INVALID_ID,
            cast_fns: Vec::new(),
            virtual_slot: INVALID_ID,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.fn_id != INVALID_ID
    }
}

#[derive(Clone, Debug)]
pub enum Expr {
    Literal {
        value: Value,
    },
    ConstUInt {
        value: u32,
    },
    /// Use of a template int parameter; replaced by ConstUInt at injection.
    TemplateConst {
        name: String,
    },
    This {
        class_id: TypeId,
    },
    PushLocal {
        slot: u16,
        type_info: TypeInfo,
        template_type_name: String,
        command: Option<Rc<TemplateCommand>>,
    },
    PushMember {
        base: ExprId,
        members: Vec<String>,
        type_info: TypeInfo,
        is_array: bool,
        offset: u64,
    },
    PushIndexed {
        base: ExprId,
        indices: Vec<ExprId>,
        call: CallInfo,
    },
    StaticVar {
        class_id: TypeId,
        members: Vec<String>,
        offset: u64,
        type_info: TypeInfo,
        is_array: bool,
    },
    ModuleCall {
        module: u16,
        function: u16,
        args: Vec<ExprId>,
    },
    ModuleConstant {
        module: u16,
        constant: u16,
    },
    DeclarePrim {
        prim: Primitive,
        slot: u16,
        init: Option<ExprId>,
    },
    DeclarePointer {
        type_id: TypeId,
        pointer_level: u8,
        slot: u16,
        init: Option<ExprId>,
        template_type_name: String,
        command: Option<Rc<TemplateCommand>>,
    },
    DeclareRef {
        type_id: TypeId,
        pointer_level: u8,
        slot: u16,
        init: ExprId,
        template_type_name: String,
        command: Option<Rc<TemplateCommand>>,
    },
    DeclareArray {
        type_id: TypeId,
        elem_pointer_level: u8,
        slot: u16,
        dims: Vec<(u32, String)>,
        inits: Vec<ExprId>,
        template_type_name: String,
    },
    DeclareObject {
        type_id: TypeId,
        slot: u16,
        args: Vec<ExprId>,
        call: CallInfo,
        template_type_name: String,
        command: Option<Rc<TemplateCommand>>,
    },
    DeclareObjectAssign {
        type_id: TypeId,
        slot: u16,
        init: ExprId,
        call: CallInfo,
        template_type_name: String,
        command: Option<Rc<TemplateCommand>>,
    },
    Set {
        target: ExprId,
        value: ExprId,
        call: CallInfo,
    },
    Binary {
        op: BinOp,
        lhs: ExprId,
        rhs: ExprId,
        call: CallInfo,
    },
    ArithAssign {
        op: BinOp,
        target: ExprId,
        amount: ExprId,
    },
    UnaryUpdate {
        op: UpdateOp,
        expr: ExprId,
    },
    Negate {
        expr: ExprId,
    },
    Invert {
        expr: ExprId,
    },
    AddressOf {
        expr: ExprId,
    },
    Deref {
        expr: ExprId,
    },
    Cast {
        expr: ExprId,
        type_id: TypeId,
        pointer_level: u8,
        template_type_name: String,
    },
    IfElse {
        cond: ExprId,
        then_scope: bool,
        else_scope: bool,
        then_body: Vec<ExprId>,
        else_body: Vec<ExprId>,
    },
    For {
        init: Option<ExprId>,
        cond: Option<ExprId>,
        step: Option<ExprId>,
        body: Vec<ExprId>,
    },
    While {
        cond: ExprId,
        body: Vec<ExprId>,
    },
    Break,
    Continue,
    Breakpoint,
    Return {
        expr: Option<ExprId>,
        by_reference: bool,
    },
    StaticCall {
        class_id: TypeId,
        name: String,
        args: Vec<ExprId>,
        call: CallInfo,
    },
    MemberCall {
        base: ExprId,
        name: String,
        args: Vec<ExprId>,
        call: CallInfo,
    },
    ConstructorCall {
        type_id: TypeId,
        args: Vec<ExprId>,
        call: CallInfo,
        template_type_name: String,
        command: Option<Rc<TemplateCommand>>,
    },
    New {
        type_id: TypeId,
        args: Vec<ExprId>,
        call: CallInfo,
        template_type_name: String,
    },
    NewArray {
        type_id: TypeId,
        pointer_level: u8,
        size: ExprId,
        template_type_name: String,
    },
    Delete {
        expr: ExprId,
        is_array: bool,
    },
    SizeOf {
        type_id: TypeId,
        is_pointer: bool,
        template_type_name: String,
    },
    OffsetOf {
        class_id: TypeId,
        members: Vec<String>,
        offset: u64,
    },
    Strlen {
        expr: ExprId,
    },
}

#[derive(Default)]
pub struct ExprArena {
    pub nodes: Vec<Expr>,
}

impl ExprArena {
    pub fn new() -> ExprArena {
        ExprArena { nodes: Vec::new() }
    }

    pub fn add(&mut self, expr: Expr) -> ExprId {
        self.nodes.push(expr);
        ExprId(self.nodes.len() as u32 - 1)
    }

    pub fn get(&self, id: ExprId) -> &Expr {
        &self.nodes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.nodes[id.0 as usize]
    }
}

impl Program {
    /// Static type of an expression. Children must be resolved before their
    /// parents ask (resolution is post-order).
    pub fn expr_type(&self, id: ExprId) -> TypeInfo {
        match self.arena.get(id) {
            Expr::Literal { value } => value.type_info(),
            Expr::ConstUInt { .. } => TypeInfo::new(TYPE_UINT32, 0),
            Expr::TemplateConst { .. } => TypeInfo::new(TYPE_UINT32, 0),
            Expr::This { class_id } => TypeInfo::new(*class_id, 1),
            Expr::PushLocal { type_info, .. } => *type_info,
            Expr::PushMember { type_info, .. } => *type_info,
            Expr::PushIndexed { base, call, .. } => {
                if call.is_resolved() {
                    return self.class(call.class_id).function(call.fn_id).return_info;
                }
                let mut info = self.expr_type(*base);
                if info.pointer_level > 0 {
                    info.pointer_level -= 1;
                }
                info
            }
            Expr::StaticVar { type_info, .. } => *type_info,
            Expr::ModuleCall { module, function, .. } => modules::return_info(*module, *function),
            Expr::ModuleConstant { module, constant } => modules::constant_info(*module, *constant),
            Expr::DeclarePrim { prim, .. } => TypeInfo::new(*prim as u16, 0),
            Expr::DeclarePointer { type_id, pointer_level, .. } => TypeInfo::new(*type_id, *pointer_level),
            Expr::DeclareRef { type_id, pointer_level, .. } => TypeInfo::new(*type_id, *pointer_level),
            Expr::DeclareArray { type_id, elem_pointer_level, .. } => {
                TypeInfo::new(*type_id, elem_pointer_level + 1)
            }
            Expr::DeclareObject { type_id, .. } => TypeInfo::new(*type_id, 0),
            Expr::DeclareObjectAssign { type_id, .. } => TypeInfo::new(*type_id, 0),
            Expr::Set { target, .. } => self.expr_type(*target),
            Expr::Binary { op, lhs, rhs, call } => {
                if call.is_resolved() {
                    return self.class(call.class_id).function(call.fn_id).return_info;
                }
                if op.is_comparison() || op.is_logical() {
                    return TypeInfo::new(TYPE_BOOL, 0);
                }
                let lt = self.expr_type(*lhs);
                let rt = self.expr_type(*rhs);
                if lt.pointer_level > 0 {
                    return lt;
                }
                if is_primitive_type(lt.type_id) && is_primitive_type(rt.type_id) {
                    return TypeInfo::new(promote_type(lt.type_id, rt.type_id), 0);
                }
                TypeInfo::invalid()
            }
            Expr::ArithAssign { target, .. } => self.expr_type(*target),
            Expr::UnaryUpdate { expr, .. } => self.expr_type(*expr),
            Expr::Negate { expr } => self.expr_type(*expr),
            Expr::Invert { .. } => TypeInfo::new(TYPE_BOOL, 0),
            Expr::AddressOf { expr } => {
                let mut info = self.expr_type(*expr);
                info.pointer_level += 1;
                info
            }
            Expr::Deref { expr } => {
                let mut info = self.expr_type(*expr);
                if info.pointer_level > 0 {
                    info.pointer_level -= 1;
                }
                info
            }
            Expr::Cast { type_id, pointer_level, .. } => TypeInfo::new(*type_id, *pointer_level),
            Expr::Return { expr: Some(e), .. } => self.expr_type(*e),
            Expr::StaticCall { call, .. } | Expr::MemberCall { call, .. } => {
                if call.is_resolved() {
                    self.class(call.class_id).function(call.fn_id).return_info
                } else {
                    TypeInfo::invalid()
                }
            }
            Expr::ConstructorCall { type_id, .. } => TypeInfo::new(*type_id, 0),
            Expr::New { type_id, .. } => TypeInfo::new(*type_id, 1),
            Expr::NewArray { type_id, pointer_level, .. } => TypeInfo::new(*type_id, pointer_level + 1),
            Expr::SizeOf { .. } => TypeInfo::new(TYPE_UINT64, 0),
            Expr::OffsetOf { .. } => TypeInfo::new(TYPE_UINT64, 0),
            Expr::Strlen { .. } => TypeInfo::new(TYPE_UINT32, 0),
            _ => TypeInfo::invalid(),
        }
    }

    fn resolve_all(&mut self, ids: &[ExprId]) -> Result<(), String> {
        for &id in ids {
            self.resolve_expr(id)?;
        }
        Ok(())
    }

    /// Resolve names, member offsets and overloads in place, children first.
    pub fn resolve_expr(&mut self, id: ExprId) -> Result<(), String> {
        let node = self.arena.get(id).clone();
        match node {
            Expr::Literal { .. }
            | Expr::ConstUInt { .. }
            | Expr::This { .. }
            | Expr::PushLocal { .. }
            | Expr::ModuleConstant { .. }
            | Expr::Break
            | Expr::Continue
            | Expr::Breakpoint => Ok(()),

            Expr::TemplateConst { name } => {
                Err(format!("template parameter '{}' used outside a template", name))
            }

            Expr::PushMember { base, members, offset, .. } => {
                self.resolve_expr(base)?;
                if offset != u64::MAX {
                    return Ok(());
                }
                let base_info = self.expr_type(base);
                if !is_class_type(base_info.type_id) {
                    return Err(format!("member access '{}' on a non-class value", members[0]));
                }
                let cls = self.class(base_info.type_id);
                let resolved = cls
                    .member_offset(&self.classes, &members)
                    .ok_or_else(|| format!("unknown member '{}' on {}", members.join("."), cls.name))?;
                if let Expr::PushMember { type_info, is_array, offset, .. } = self.arena.get_mut(id) {
                    *offset = resolved.0;
                    *type_info = resolved.1;
                    *is_array = resolved.2;
                }
                Ok(())
            }

            Expr::PushIndexed { base, indices, call } => {
                self.resolve_expr(base)?;
                self.resolve_all(&indices)?;
                if call.is_resolved() {
                    return Ok(());
                }
                let base_info = self.expr_type(base);
                if is_class_type(base_info.type_id) && base_info.pointer_level == 0 {
                    let args: Vec<TypeInfo> = indices.iter().map(|&a| self.expr_type(a)).collect();
                    let found = resolve_overload(&self.classes, base_info.type_id, "operator[]", &args)
                        .ok_or_else(|| {
                            format!("no operator[] on {}", self.class(base_info.type_id).name)
                        })?;
                    if let Expr::PushIndexed { call, .. } = self.arena.get_mut(id) {
                        call.class_id = found.class_id;
                        call.fn_id = found.fn_id;
                        call.cast_fns = found.cast_fns;
                    }
                } else if base_info.pointer_level == 0 {
                    return Err(String::from("indexing a non-array, non-pointer value"));
                }
                Ok(())
            }

            Expr::StaticVar { class_id, members, offset, .. } => {
                if offset != u64::MAX {
                    return Ok(());
                }
                let cls = self.class(class_id);
                let resolved = cls
                    .static_offset(&self.classes, &members)
                    .ok_or_else(|| format!("unknown static '{}' on {}", members.join("."), cls.name))?;
                if let Expr::StaticVar { offset, type_info, is_array, .. } = self.arena.get_mut(id) {
                    *offset = resolved.0;
                    *type_info = resolved.1;
                    *is_array = resolved.2;
                }
                Ok(())
            }

            Expr::ModuleCall { args, .. } => self.resolve_all(&args),

            Expr::DeclarePrim { init, .. } => {
                if let Some(init) = init {
                    self.resolve_expr(init)?;
                }
                Ok(())
            }

            Expr::DeclarePointer { init, type_id, .. } => {
                if type_id == TYPE_PLACEHOLDER {
                    return Err(String::from("unresolved template type in declaration"));
                }
                if let Some(init) = init {
                    self.resolve_expr(init)?;
                }
                Ok(())
            }

            Expr::DeclareRef { init, type_id, pointer_level, .. } => {
                self.resolve_expr(init)?;
                let got = self.expr_type(init);
                if got != TypeInfo::new(type_id, pointer_level) {
                    return Err(String::from("reference initializer type mismatch"));
                }
                Ok(())
            }

            Expr::DeclareArray { dims, inits, type_id, .. } => {
                if type_id == TYPE_PLACEHOLDER {
                    return Err(String::from("unresolved template type in array declaration"));
                }
                if dims.iter().any(|d| !d.1.is_empty()) {
                    return Err(String::from("unresolved template extent in array declaration"));
                }
                self.resolve_all(&inits)
            }

            Expr::DeclareObject { type_id, args, call, .. } => {
                self.resolve_all(&args)?;
                if call.is_resolved() || !is_class_type(type_id) {
                    if !is_class_type(type_id) {
                        return Err(String::from("unresolved object type in declaration"));
                    }
                    return Ok(());
                }
                let found = self.resolve_constructor(type_id, &args)?;
                if let Expr::DeclareObject { call, .. } = self.arena.get_mut(id) {
                    *call = found;
                }
                Ok(())
            }

            Expr::DeclareObjectAssign { type_id, init, call, .. } => {
                self.resolve_expr(init)?;
                if call.is_resolved() || !is_class_type(type_id) {
                    if !is_class_type(type_id) {
                        return Err(String::from("unresolved object type in declaration"));
                    }
                    return Ok(());
                }
                let init_info = self.expr_type(init);
                let name = self.class(type_id).name.clone();
                if let Some(found) = resolve_overload(&self.classes, type_id, &name, &[init_info]) {
                    if let Expr::DeclareObjectAssign { call, .. } = self.arena.get_mut(id) {
                        call.class_id = found.class_id;
                        call.fn_id = found.fn_id;
                        call.cast_fns = found.cast_fns;
                    }
                }
                Ok(())
            }

            Expr::Set { target, value, call } => {
                self.resolve_expr(target)?;
                self.resolve_expr(value)?;
                if call.is_resolved() {
                    return Ok(());
                }
                let target_info = self.expr_type(target);
                if is_class_type(target_info.type_id) && target_info.pointer_level == 0 {
                    let value_info = self.expr_type(value);
                    if let Some(found) =
                        resolve_overload(&self.classes, target_info.type_id, "operator=", &[value_info])
                    {
                        if let Expr::Set { call, .. } = self.arena.get_mut(id) {
                            call.class_id = found.class_id;
                            call.fn_id = found.fn_id;
                            call.cast_fns = found.cast_fns;
                        }
                    }
                }
                Ok(())
            }

            Expr::Binary { op, lhs, rhs, call } => {
                self.resolve_expr(lhs)?;
                self.resolve_expr(rhs)?;
                if call.is_resolved() {
                    return Ok(());
                }
                let lt = self.expr_type(lhs);
                if is_class_type(lt.type_id) && lt.pointer_level == 0 {
                    let name = op
                        .overload_name()
                        .ok_or_else(|| String::from("operator not overloadable for class operands"))?;
                    let rt = self.expr_type(rhs);
                    let found = resolve_overload(&self.classes, lt.type_id, name, &[rt])
                        .ok_or_else(|| {
                            format!("no {} on {}", name, self.class(lt.type_id).name)
                        })?;
                    if let Expr::Binary { call, .. } = self.arena.get_mut(id) {
                        call.class_id = found.class_id;
                        call.fn_id = found.fn_id;
                        call.cast_fns = found.cast_fns;
                    }
                }
                Ok(())
            }

            Expr::ArithAssign { target, amount, .. } => {
                self.resolve_expr(target)?;
                self.resolve_expr(amount)
            }

            Expr::UnaryUpdate { expr, .. }
            | Expr::Negate { expr }
            | Expr::Invert { expr }
            | Expr::AddressOf { expr }
            | Expr::Deref { expr }
            | Expr::Strlen { expr }
            | Expr::Delete { expr, .. } => self.resolve_expr(expr),

            Expr::Cast { expr, type_id, template_type_name, .. } => {
                if type_id == TYPE_PLACEHOLDER || !template_type_name.is_empty() {
                    return Err(String::from("unresolved template type in cast"));
                }
                self.resolve_expr(expr)
            }

            Expr::IfElse { cond, then_body, else_body, .. } => {
                self.resolve_expr(cond)?;
                self.resolve_all(&then_body)?;
                self.resolve_all(&else_body)
            }

            Expr::For { init, cond, step, body } => {
                if let Some(init) = init {
                    self.resolve_expr(init)?;
                }
                if let Some(cond) = cond {
                    self.resolve_expr(cond)?;
                }
                if let Some(step) = step {
                    self.resolve_expr(step)?;
                }
                self.resolve_all(&body)
            }

            Expr::While { cond, body } => {
                self.resolve_expr(cond)?;
                self.resolve_all(&body)
            }

            Expr::Return { expr, .. } => {
                if let Some(expr) = expr {
                    self.resolve_expr(expr)?;
                }
                Ok(())
            }

            Expr::StaticCall { class_id, name, args, call } => {
                self.resolve_all(&args)?;
                if call.is_resolved() {
                    return Ok(());
                }
                let arg_types: Vec<TypeInfo> = args.iter().map(|&a| self.expr_type(a)).collect();
                let found = resolve_overload(&self.classes, class_id, &name, &arg_types)
                    .ok_or_else(|| {
                        format!("no overload of {}::{} matches", self.class(class_id).name, name)
                    })?;
                if let Expr::StaticCall { call, .. } = self.arena.get_mut(id) {
                    call.class_id = found.class_id;
                    call.fn_id = found.fn_id;
                    call.cast_fns = found.cast_fns;
                }
                Ok(())
            }

            Expr::MemberCall { base, name, args, call } => {
                self.resolve_expr(base)?;
                self.resolve_all(&args)?;
                if call.is_resolved() {
                    return Ok(());
                }
                let base_info = self.expr_type(base);
                if !is_class_type(base_info.type_id) {
                    return Err(format!("method call '{}' on a non-class value", name));
                }
                let arg_types: Vec<TypeInfo> = args.iter().map(|&a| self.expr_type(a)).collect();
                let found = resolve_overload(&self.classes, base_info.type_id, &name, &arg_types)
                    .ok_or_else(|| {
                        format!("no overload of {}::{} matches", self.class(base_info.type_id).name, name)
                    })?;
                let mut virtual_slot = INVALID_ID;
                if self.class(found.class_id).function(found.fn_id).is_virtual() {
                    virtual_slot = self
                        .class(base_info.type_id)
                        .vtable
                        .find_slot(&self.classes, &name, &arg_types)
                        .unwrap_or(INVALID_ID);
                }
                if let Expr::MemberCall { call, .. } = self.arena.get_mut(id) {
                    call.class_id = found.class_id;
                    call.fn_id = found.fn_id;
                    call.cast_fns = found.cast_fns;
                    call.virtual_slot = virtual_slot;
                }
                Ok(())
            }

            Expr::ConstructorCall { type_id, args, call, .. } => {
                self.resolve_all(&args)?;
                if call.is_resolved() {
                    return Ok(());
                }
                if !is_class_type(type_id) {
                    return Err(String::from("unresolved template type in constructor call"));
                }
                let found = self.resolve_constructor(type_id, &args)?;
                if let Expr::ConstructorCall { call, .. } = self.arena.get_mut(id) {
                    *call = found;
                }
                Ok(())
            }

            Expr::New { type_id, args, call, .. } => {
                self.resolve_all(&args)?;
                if call.is_resolved() || !is_class_type(type_id) {
                    return Ok(());
                }
                let found = self.resolve_constructor(type_id, &args)?;
                if let Expr::New { call, .. } = self.arena.get_mut(id) {
                    *call = found;
                }
                Ok(())
            }

            Expr::NewArray { size, .. } => self.resolve_expr(size),

            Expr::SizeOf { template_type_name, .. } => {
                if !template_type_name.is_empty() {
                    return Err(String::from("unresolved template type in sizeof"));
                }
                Ok(())
            }

            Expr::OffsetOf { class_id, members, offset } => {
                if offset != u64::MAX {
                    return Ok(());
                }
                let cls = self.class(class_id);
                let resolved = cls
                    .member_offset(&self.classes, &members)
                    .ok_or_else(|| format!("unknown member '{}' on {}", members.join("."), cls.name))?;
                if let Expr::OffsetOf { offset, .. } = self.arena.get_mut(id) {
                    *offset = resolved.0;
                }
                Ok(())
            }
        }
    }

    /// Constructor selection for `DeclareObject`, `ConstructorCall` and
    /// `New`: zero arguments means the default constructor or none at all;
    /// otherwise a matching overload is required.
    fn resolve_constructor(&self, type_id: TypeId, args: &[ExprId]) -> Result<CallInfo, String> {
        let cls = self.class(type_id);
        let mut info = CallInfo::unresolved();
        info.class_id = type_id;
        if args.is_empty() {
            if let Some(default) = cls.default_ctor {
                info.fn_id = default;
            }
            return Ok(info);
        }
        let name = cls.name.clone();
        let arg_types: Vec<TypeInfo> = args.iter().map(|&a| self.expr_type(a)).collect();
        let found = resolve_overload(&self.classes, type_id, &name, &arg_types)
            .ok_or_else(|| format!("no constructor of {} matches", name))?;
        info.class_id = found.class_id;
        info.fn_id = found.fn_id;
        info.cast_fns = found.cast_fns;
        Ok(info)
    }
}
