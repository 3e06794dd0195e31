// The compiled program.
//
// Owns the class table, the AST arena, the byte stream, the storage
// regions and the template-instantiation cache. Compilation is staged:
// parse builds classes and ASTs, `compile` then builds VTables, resolves
// every body, emits bytecode and the static-initialization prologue, and
// returns the entry pc.

use crate::ast::{CallInfo, Expr, ExprArena, ExprId};
use crate::bytecode::{CodeBuf, Op};
use crate::class::{
    class_index, function_signature, resolve_overload, type_name, type_size, Class, ClassField,
    Function, FunctionParam, VSlot, VTable,
};
use crate::config::Settings;
use crate::memory::{Addr, Memory, Region};
use crate::template::{
    CommandArg, InstanceKey, TemplateArg, TemplateCommand, TemplateDefinition, TemplateInstantiation,
    TemplateParamKind,
};
use crate::types::*;
use crate::value::{
    elem_stride, init_interior, ArrayHeader, ARRAY_HEADER_SIZE, MAX_ARRAY_DIMS, VTABLE_SLOT_SIZE,
};
use std::collections::HashMap;
use std::rc::Rc;

pub struct Program {
    pub settings: Settings,
    pub classes: Vec<Class>,
    pub class_names: HashMap<String, TypeId>,
    pub module_names: HashMap<String, u16>,
    pub main_class: Option<TypeId>,
    pub arena: ExprArena,
    pub code: CodeBuf,
    pub memory: Memory,
    pub string_pool: Vec<Addr>,
    template_cache: HashMap<InstanceKey, TypeId>,
}

/// Substitution context while instantiating one template class.
pub struct Inject {
    pub def: TemplateDefinition,
    pub inst: TemplateInstantiation,
    /// The template class being replayed.
    pub source: TypeId,
    /// The concrete class being synthesized.
    pub target: TypeId,
}

impl Program {
    pub fn new(settings: Settings) -> Program {
        let memory = Memory::new(&settings);
        Program {
            settings,
            classes: Vec::new(),
            class_names: HashMap::new(),
            module_names: HashMap::new(),
            main_class: None,
            arena: ExprArena::new(),
            code: CodeBuf::new(),
            memory,
            string_pool: Vec::new(),
            template_cache: HashMap::new(),
        }
    }

    pub fn add_class(&mut self, name: String, base: Option<TypeId>) -> TypeId {
        let id = FIRST_CLASS_TYPE + self.classes.len() as u16;
        self.class_names.insert(name.clone(), id);
        self.classes.push(Class::new(name, id, base));
        id
    }

    pub fn class_id(&self, name: &str) -> TypeId {
        *self.class_names.get(name).unwrap_or(&INVALID_ID)
    }

    pub fn class(&self, id: TypeId) -> &Class {
        &self.classes[class_index(id)]
    }

    pub fn class_mut(&mut self, id: TypeId) -> &mut Class {
        &mut self.classes[class_index(id)]
    }

    pub fn type_name(&self, t: TypeId) -> String {
        type_name(&self.classes, t)
    }

    pub fn type_size(&self, t: TypeId) -> u64 {
        type_size(&self.classes, t)
    }

    pub fn add_module(&mut self, name: &str, id: u16) {
        self.module_names.insert(name.to_string(), id);
    }

    pub fn module_id(&self, name: &str) -> u16 {
        *self.module_names.get(name).unwrap_or(&INVALID_ID)
    }

    /// Pool a string literal's bytes in the heap; freed at teardown.
    pub fn intern_string(&mut self, text: &str) -> Result<Addr, String> {
        let addr = self
            .memory
            .alloc_cstr(Region::Heap, text)
            .map_err(|e| e.to_string())?;
        self.string_pool.push(addr);
        Ok(addr)
    }

    pub fn release_string_pool(&mut self) {
        for addr in std::mem::take(&mut self.string_pool) {
            let _ = self.memory.free(addr);
        }
    }

    pub fn add_class_function(&mut self, class_id: TypeId, func: Function) -> u16 {
        let signature = function_signature(&self.classes, &func);
        self.class_mut(class_id).add_function(func, signature)
    }

    /// Byte placement of one field: (offset shift past hidden word/header,
    /// total bytes the field occupies).
    pub fn field_layout(&self, t: TypeId, pointer_level: u8, dims: &[(u32, String)]) -> (u64, u64) {
        if !dims.is_empty() {
            let elem_plevel = pointer_level - 1;
            let stride = elem_stride(&self.classes, t, elem_plevel);
            let count: u64 = dims.iter().map(|d| d.0 as u64).product();
            (ARRAY_HEADER_SIZE, ARRAY_HEADER_SIZE + stride * count)
        } else if pointer_level > 0 {
            (0, 8)
        } else if is_primitive_type(t) {
            (0, self.type_size(t))
        } else {
            (VTABLE_SLOT_SIZE, VTABLE_SLOT_SIZE + self.type_size(t))
        }
    }

    // ---- templates -------------------------------------------------------

    fn template_instance_name(&self, template_id: TypeId, inst: &TemplateInstantiation) -> String {
        let mut name = format!("{}<", self.class(template_id).name);
        for (i, arg) in inst.args.iter().enumerate() {
            if i > 0 {
                name.push(',');
            }
            match arg.kind {
                TemplateParamKind::Type => {
                    name.push_str(&self.type_name(arg.value as TypeId));
                    for _ in 0..arg.pointer_level {
                        name.push('*');
                    }
                }
                TemplateParamKind::Int => name.push_str(&arg.value.to_string()),
            }
        }
        name.push('>');
        name
    }

    /// Substitute one declared type under `ctx`: run an attached command,
    /// or map a placeholder name to its concrete argument. The returned
    /// pointer level is *added* to the declared one.
    fn subst_type(
        &mut self,
        type_id: TypeId,
        template_type_name: &str,
        command: Option<&Rc<TemplateCommand>>,
        ctx: &Inject,
    ) -> Result<(TypeId, u8), String> {
        if let Some(cmd) = command {
            let concrete = self.run_command(cmd, &ctx.def, &ctx.inst)?;
            return Ok((concrete, 0));
        }
        if !template_type_name.is_empty() {
            let index = ctx
                .def
                .find(template_type_name)
                .ok_or_else(|| format!("unknown template parameter '{}'", template_type_name))?;
            let arg = &ctx.inst.args[index];
            if arg.kind != TemplateParamKind::Type {
                return Err(format!("template parameter '{}' is not a type", template_type_name));
            }
            return Ok((arg.value as TypeId, arg.pointer_level));
        }
        if type_id == ctx.source {
            // self-reference inside the template body
            return Ok((ctx.target, 0));
        }
        Ok((type_id, 0))
    }

    fn subst_dims(
        &self,
        dims: &[(u32, String)],
        ctx: &Inject,
    ) -> Result<Vec<(u32, String)>, String> {
        let mut out = Vec::with_capacity(dims.len());
        for (extent, name) in dims {
            if name.is_empty() {
                out.push((*extent, String::new()));
                continue;
            }
            let index = ctx
                .def
                .find(name)
                .ok_or_else(|| format!("unknown template parameter '{}'", name))?;
            let arg = &ctx.inst.args[index];
            if arg.kind != TemplateParamKind::Int {
                return Err(format!("template parameter '{}' is not an int", name));
            }
            out.push((arg.value, String::new()));
        }
        Ok(out)
    }

    /// Replay a recorded instantiation command against the enclosing
    /// template's concrete arguments.
    pub fn run_command(
        &mut self,
        cmd: &TemplateCommand,
        def: &TemplateDefinition,
        inst: &TemplateInstantiation,
    ) -> Result<TypeId, String> {
        let mut resolved = TemplateInstantiation::default();
        for arg in &cmd.args {
            match arg {
                CommandArg::Arg(a) => {
                    if a.is_placeholder() {
                        let index = def
                            .find(&a.placeholder)
                            .ok_or_else(|| format!("unknown template parameter '{}'", a.placeholder))?;
                        let mut concrete = inst.args[index].clone();
                        concrete.pointer_level += a.pointer_level;
                        resolved.args.push(concrete);
                    } else {
                        resolved.args.push(a.clone());
                    }
                }
                CommandArg::Nested(nested) => {
                    let id = self.run_command(nested, def, inst)?;
                    resolved.args.push(TemplateArg::concrete_type(id, 0));
                }
            }
        }
        self.instantiate_template(cmd.class_id, &resolved)
    }

    /// Synthesize (or fetch) the concrete class for `template_id`
    /// instantiated with `inst`. Idempotent: the cache is consulted before
    /// any work, which also terminates self-referential templates.
    pub fn instantiate_template(
        &mut self,
        template_id: TypeId,
        inst: &TemplateInstantiation,
    ) -> Result<TypeId, String> {
        if inst.has_placeholder() {
            return Err(String::from("template instantiation with unresolved argument"));
        }
        let key = InstanceKey::new(template_id, inst);
        if let Some(&cached) = self.template_cache.get(&key) {
            return Ok(cached);
        }
        let def = self.class(template_id).template.clone();
        if def.params.len() != inst.args.len() {
            return Err(format!(
                "wrong number of template arguments for {}",
                self.class(template_id).name
            ));
        }
        let name = self.template_instance_name(template_id, inst);
        if let Some(&existing) = self.class_names.get(&name) {
            self.template_cache.insert(key, existing);
            return Ok(existing);
        }

        let base = self.class(template_id).base;
        let target = self.add_class(name, base);
        self.template_cache.insert(key, target);
        self.class_mut(target).is_template_instance = true;

        let ctx = Inject {
            def,
            inst: inst.clone(),
            source: template_id,
            target,
        };

        // member layout, recomputed with concrete sizes
        let base_size = base.map_or(0, |b| self.class(b).size);
        let mut cursor = base_size;
        let fields = self.class(template_id).member_fields.clone();
        let mut members = Vec::with_capacity(fields.len());
        for field in fields {
            let (t, extra) = self.subst_type(
                field.type_info.type_id,
                &field.template_type_name,
                field.command.as_ref(),
                &ctx,
            )?;
            let plevel = field.type_info.pointer_level + extra;
            let dims = self.subst_dims(&field.dims, &ctx)?;
            let (shift, total) = self.field_layout(t, plevel, &dims);
            members.push(ClassField {
                name: field.name,
                type_info: TypeInfo::new(t, plevel),
                offset: cursor + shift,
                size: total,
                dims,
                template_type_name: String::new(),
                command: None,
                init_expr: None,
            });
            cursor += total;
        }
        self.class_mut(target).member_fields = members;
        self.class_mut(target).size = cursor;

        // statics, one region per instance
        let statics = self.class(template_id).static_fields.clone();
        let mut scursor = 0;
        let mut new_statics = Vec::with_capacity(statics.len());
        for field in statics {
            let (t, extra) = self.subst_type(
                field.type_info.type_id,
                &field.template_type_name,
                field.command.as_ref(),
                &ctx,
            )?;
            let plevel = field.type_info.pointer_level + extra;
            let dims = self.subst_dims(&field.dims, &ctx)?;
            let (shift, total) = self.field_layout(t, plevel, &dims);
            let init_expr = match field.init_expr {
                Some(e) => Some(self.inject_expr(e, &ctx)?),
                None => None,
            };
            new_statics.push(ClassField {
                name: field.name,
                type_info: TypeInfo::new(t, plevel),
                offset: scursor + shift,
                size: total,
                dims,
                template_type_name: String::new(),
                command: None,
                init_expr,
            });
            scursor += total;
        }
        self.class_mut(target).static_fields = new_statics;
        self.class_mut(target).static_size = scursor;

        // functions, bodies cloned with substitution
        let template_name = self.class(template_id).name.clone();
        let instance_name = self.class(target).name.clone();
        let functions = self.class(template_id).functions.clone();
        for func in functions {
            let (rt, rextra) =
                self.subst_type(func.return_info.type_id, &func.return_template_type_name, None, &ctx)?;
            let mut params = Vec::with_capacity(func.params.len());
            for p in &func.params {
                let (t, extra) =
                    self.subst_type(p.type_info.type_id, &p.template_type_name, p.command.as_ref(), &ctx)?;
                params.push(FunctionParam {
                    type_info: TypeInfo::new(t, p.type_info.pointer_level + extra),
                    is_reference: p.is_reference,
                    slot: p.slot,
                    template_type_name: String::new(),
                    command: None,
                });
            }
            let mut body = Vec::with_capacity(func.body.len());
            for &e in &func.body {
                body.push(self.inject_expr(e, &ctx)?);
            }
            let name = if func.name == template_name {
                instance_name.clone()
            } else if func.name.starts_with('~') {
                format!("~{}", instance_name)
            } else {
                func.name.clone()
            };
            let new_func = Function {
                name,
                access: func.access,
                flags: func.flags,
                return_info: TypeInfo::new(rt, func.return_info.pointer_level + rextra),
                return_template_type_name: String::new(),
                returns_reference: func.returns_reference,
                params,
                body,
                id: 0,
                num_locals: func.num_locals,
                pc: 0,
            };
            self.add_class_function(target, new_func);
        }

        Ok(target)
    }

    /// Structural clone of an expression tree, substituting template
    /// placeholders with their concrete arguments.
    pub fn inject_expr(&mut self, id: ExprId, ctx: &Inject) -> Result<ExprId, String> {
        let node = self.arena.get(id).clone();
        let cloned = match node {
            Expr::Literal { value } => Expr::Literal { value },
            Expr::ConstUInt { value } => Expr::ConstUInt { value },
            Expr::TemplateConst { name } => {
                let index = ctx
                    .def
                    .find(&name)
                    .ok_or_else(|| format!("unknown template parameter '{}'", name))?;
                let arg = &ctx.inst.args[index];
                if arg.kind != TemplateParamKind::Int {
                    return Err(format!("template parameter '{}' is not an int", name));
                }
                Expr::ConstUInt { value: arg.value }
            }
            Expr::This { class_id } => Expr::This {
                class_id: if class_id == ctx.source { ctx.target } else { class_id },
            },
            Expr::PushLocal { slot, type_info, template_type_name, command } => {
                let (t, extra) =
                    self.subst_type(type_info.type_id, &template_type_name, command.as_ref(), ctx)?;
                Expr::PushLocal {
                    slot,
                    type_info: TypeInfo::new(t, type_info.pointer_level + extra),
                    template_type_name: String::new(),
                    command: None,
                }
            }
            Expr::PushMember { base, members, .. } => Expr::PushMember {
                base: self.inject_expr(base, ctx)?,
                members,
                type_info: TypeInfo::invalid(),
                is_array: false,
                offset: u64::MAX,
            },
            Expr::PushIndexed { base, indices, .. } => Expr::PushIndexed {
                base: self.inject_expr(base, ctx)?,
                indices: self.inject_all(&indices, ctx)?,
                call: CallInfo::unresolved(),
            },
            Expr::StaticVar { class_id, members, .. } => Expr::StaticVar {
                class_id: if class_id == ctx.source { ctx.target } else { class_id },
                members,
                offset: u64::MAX,
                type_info: TypeInfo::invalid(),
                is_array: false,
            },
            Expr::ModuleCall { module, function, args } => Expr::ModuleCall {
                module,
                function,
                args: self.inject_all(&args, ctx)?,
            },
            Expr::ModuleConstant { module, constant } => Expr::ModuleConstant { module, constant },
            Expr::DeclarePrim { prim, slot, init } => Expr::DeclarePrim {
                prim,
                slot,
                init: self.inject_opt(init, ctx)?,
            },
            Expr::DeclarePointer { type_id, pointer_level, slot, init, template_type_name, command } => {
                let (t, extra) = self.subst_type(type_id, &template_type_name, command.as_ref(), ctx)?;
                Expr::DeclarePointer {
                    type_id: t,
                    pointer_level: pointer_level + extra,
                    slot,
                    init: self.inject_opt(init, ctx)?,
                    template_type_name: String::new(),
                    command: None,
                }
            }
            Expr::DeclareRef { type_id, pointer_level, slot, init, template_type_name, command } => {
                let (t, extra) = self.subst_type(type_id, &template_type_name, command.as_ref(), ctx)?;
                Expr::DeclareRef {
                    type_id: t,
                    pointer_level: pointer_level + extra,
                    slot,
                    init: self.inject_expr(init, ctx)?,
                    template_type_name: String::new(),
                    command: None,
                }
            }
            Expr::DeclareArray { type_id, elem_pointer_level, slot, dims, inits, template_type_name } => {
                let (t, extra) = self.subst_type(type_id, &template_type_name, None, ctx)?;
                Expr::DeclareArray {
                    type_id: t,
                    elem_pointer_level: elem_pointer_level + extra,
                    slot,
                    dims: self.subst_dims(&dims, ctx)?,
                    inits: self.inject_all(&inits, ctx)?,
                    template_type_name: String::new(),
                }
            }
            Expr::DeclareObject { type_id, slot, args, template_type_name, command, .. } => {
                let (t, extra) = self.subst_type(type_id, &template_type_name, command.as_ref(), ctx)?;
                let args = self.inject_all(&args, ctx)?;
                // a type parameter may turn out primitive or a pointer
                if extra > 0 {
                    Expr::DeclarePointer {
                        type_id: t,
                        pointer_level: extra,
                        slot,
                        init: None,
                        template_type_name: String::new(),
                        command: None,
                    }
                } else if let (Some(prim), true) = (Primitive::from_type(t), args.is_empty()) {
                    Expr::DeclarePrim { prim, slot, init: None }
                } else {
                    Expr::DeclareObject {
                        type_id: t,
                        slot,
                        args,
                        call: CallInfo::unresolved(),
                        template_type_name: String::new(),
                        command: None,
                    }
                }
            }
            Expr::DeclareObjectAssign { type_id, slot, init, template_type_name, command, .. } => {
                let (t, extra) = self.subst_type(type_id, &template_type_name, command.as_ref(), ctx)?;
                let init = self.inject_expr(init, ctx)?;
                if extra > 0 {
                    Expr::DeclarePointer {
                        type_id: t,
                        pointer_level: extra,
                        slot,
                        init: Some(init),
                        template_type_name: String::new(),
                        command: None,
                    }
                } else if let Some(prim) = Primitive::from_type(t) {
                    Expr::DeclarePrim { prim, slot, init: Some(init) }
                } else {
                    Expr::DeclareObjectAssign {
                        type_id: t,
                        slot,
                        init,
                        call: CallInfo::unresolved(),
                        template_type_name: String::new(),
                        command: None,
                    }
                }
            }
            Expr::Set { target, value, .. } => Expr::Set {
                target: self.inject_expr(target, ctx)?,
                value: self.inject_expr(value, ctx)?,
                call: CallInfo::unresolved(),
            },
            Expr::Binary { op, lhs, rhs, .. } => Expr::Binary {
                op,
                lhs: self.inject_expr(lhs, ctx)?,
                rhs: self.inject_expr(rhs, ctx)?,
                call: CallInfo::unresolved(),
            },
            Expr::ArithAssign { op, target, amount } => Expr::ArithAssign {
                op,
                target: self.inject_expr(target, ctx)?,
                amount: self.inject_expr(amount, ctx)?,
            },
            Expr::UnaryUpdate { op, expr } => Expr::UnaryUpdate { op, expr: self.inject_expr(expr, ctx)? },
            Expr::Negate { expr } => Expr::Negate { expr: self.inject_expr(expr, ctx)? },
            Expr::Invert { expr } => Expr::Invert { expr: self.inject_expr(expr, ctx)? },
            Expr::AddressOf { expr } => Expr::AddressOf { expr: self.inject_expr(expr, ctx)? },
            Expr::Deref { expr } => Expr::Deref { expr: self.inject_expr(expr, ctx)? },
            Expr::Cast { expr, type_id, pointer_level, template_type_name } => {
                let (t, extra) = self.subst_type(type_id, &template_type_name, None, ctx)?;
                Expr::Cast {
                    expr: self.inject_expr(expr, ctx)?,
                    type_id: t,
                    pointer_level: pointer_level + extra,
                    template_type_name: String::new(),
                }
            }
            Expr::IfElse { cond, then_scope, else_scope, then_body, else_body } => Expr::IfElse {
                cond: self.inject_expr(cond, ctx)?,
                then_scope,
                else_scope,
                then_body: self.inject_all(&then_body, ctx)?,
                else_body: self.inject_all(&else_body, ctx)?,
            },
            Expr::For { init, cond, step, body } => Expr::For {
                init: self.inject_opt(init, ctx)?,
                cond: self.inject_opt(cond, ctx)?,
                step: self.inject_opt(step, ctx)?,
                body: self.inject_all(&body, ctx)?,
            },
            Expr::While { cond, body } => Expr::While {
                cond: self.inject_expr(cond, ctx)?,
                body: self.inject_all(&body, ctx)?,
            },
            Expr::Break => Expr::Break,
            Expr::Continue => Expr::Continue,
            Expr::Breakpoint => Expr::Breakpoint,
            Expr::Return { expr, by_reference } => Expr::Return {
                expr: self.inject_opt(expr, ctx)?,
                by_reference,
            },
            Expr::StaticCall { class_id, name, args, .. } => Expr::StaticCall {
                class_id: if class_id == ctx.source { ctx.target } else { class_id },
                name,
                args: self.inject_all(&args, ctx)?,
                call: CallInfo::unresolved(),
            },
            Expr::MemberCall { base, name, args, .. } => Expr::MemberCall {
                base: self.inject_expr(base, ctx)?,
                name,
                args: self.inject_all(&args, ctx)?,
                call: CallInfo::unresolved(),
            },
            Expr::ConstructorCall { type_id, args, template_type_name, command, .. } => {
                let (t, _) = self.subst_type(type_id, &template_type_name, command.as_ref(), ctx)?;
                let args = self.inject_all(&args, ctx)?;
                // constructor name follows the concrete class
                Expr::ConstructorCall {
                    type_id: t,
                    args,
                    call: CallInfo::unresolved(),
                    template_type_name: String::new(),
                    command: None,
                }
            }
            Expr::New { type_id, args, template_type_name, .. } => {
                let (t, _) = self.subst_type(type_id, &template_type_name, None, ctx)?;
                Expr::New {
                    type_id: t,
                    args: self.inject_all(&args, ctx)?,
                    call: CallInfo::unresolved(),
                    template_type_name: String::new(),
                }
            }
            Expr::NewArray { type_id, pointer_level, size, template_type_name } => {
                let (t, extra) = self.subst_type(type_id, &template_type_name, None, ctx)?;
                Expr::NewArray {
                    type_id: t,
                    pointer_level: pointer_level + extra,
                    size: self.inject_expr(size, ctx)?,
                    template_type_name: String::new(),
                }
            }
            Expr::Delete { expr, is_array } => Expr::Delete {
                expr: self.inject_expr(expr, ctx)?,
                is_array,
            },
            Expr::Strlen { expr } => Expr::Strlen { expr: self.inject_expr(expr, ctx)? },
            Expr::SizeOf { type_id, is_pointer, template_type_name } => {
                let (t, extra) = self.subst_type(type_id, &template_type_name, None, ctx)?;
                Expr::SizeOf {
                    type_id: t,
                    is_pointer: is_pointer || extra > 0,
                    template_type_name: String::new(),
                }
            }
            Expr::OffsetOf { class_id, members, .. } => Expr::OffsetOf {
                class_id: if class_id == ctx.source { ctx.target } else { class_id },
                members,
                offset: u64::MAX,
            },
        };
        Ok(self.arena.add(cloned))
    }

    fn inject_all(&mut self, ids: &[ExprId], ctx: &Inject) -> Result<Vec<ExprId>, String> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            out.push(self.inject_expr(id, ctx)?);
        }
        Ok(out)
    }

    fn inject_opt(&mut self, id: Option<ExprId>, ctx: &Inject) -> Result<Option<ExprId>, String> {
        match id {
            Some(id) => Ok(Some(self.inject_expr(id, ctx)?)),
            None => Ok(None),
        }
    }

    // ---- semantic passes -------------------------------------------------

    /// One slot per declared function; derived classes override base slots
    /// that match by name and parameter types, and append the rest.
    pub fn build_vtables(&mut self) {
        for index in 0..self.classes.len() {
            if self.classes[index].is_template_class() {
                continue;
            }
            let id = self.classes[index].id;
            let mut slots: Vec<VSlot> = match self.classes[index].base {
                Some(base) => self.class(base).vtable.slots.clone(),
                None => Vec::new(),
            };
            for fn_id in 0..self.classes[index].functions.len() as u16 {
                let func = self.classes[index].function(fn_id);
                let name = func.name.clone();
                let params: Vec<TypeInfo> = func.params.iter().map(|p| p.type_info).collect();
                let overriding = slots.iter().position(|slot| {
                    let base_fn = self.class(slot.class_id).function(slot.fn_id);
                    base_fn.name == name
                        && base_fn.params.len() == params.len()
                        && base_fn.params.iter().zip(&params).all(|(p, t)| p.type_info == *t)
                });
                match overriding {
                    Some(pos) => slots[pos] = VSlot { class_id: id, fn_id },
                    None => slots.push(VSlot { class_id: id, fn_id }),
                }
            }
            self.classes[index].vtable = VTable { slots };
        }
    }

    /// Resolve every function body and static initializer. All failures
    /// are reported together.
    pub fn resolve(&mut self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        for index in 0..self.classes.len() {
            if self.classes[index].is_template_class() {
                continue;
            }
            let class_name = self.classes[index].name.clone();
            for fn_id in 0..self.classes[index].functions.len() {
                let body = self.classes[index].functions[fn_id].body.clone();
                let fn_name = self.classes[index].functions[fn_id].name.clone();
                for expr in body {
                    if let Err(message) = self.resolve_expr(expr) {
                        errors.push(format!("{}::{}: {}", class_name, fn_name, message));
                    }
                }
            }
            let inits: Vec<ExprId> = self.classes[index]
                .static_fields
                .iter()
                .filter_map(|f| f.init_expr)
                .collect();
            for expr in inits {
                if let Err(message) = self.resolve_expr(expr) {
                    errors.push(format!("{} static initializer: {}", class_name, message));
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Full back end: VTables, resolution, function bodies, the Main call,
    /// and the static-initialization prologue. Returns the entry pc.
    pub fn compile(&mut self) -> Result<u32, Vec<String>> {
        self.build_vtables();
        self.resolve()?;

        for index in 0..self.classes.len() {
            if self.classes[index].is_template_class() {
                continue;
            }
            for fn_id in 0..self.classes[index].functions.len() {
                let pc = self.code.len();
                self.classes[index].functions[fn_id].pc = pc;
                let body = self.classes[index].functions[fn_id].body.clone();
                for expr in body {
                    self.emit_statement(expr);
                }
                // backstop so a body that falls off the end still returns
                self.code.write_op(Op::Return);
                self.code.write_u8(0);
            }
        }

        let main_class = self
            .main_class
            .ok_or_else(|| vec![String::from("no class declares a Main function")])?;
        let main = resolve_overload(&self.classes, main_class, "Main", &[])
            .ok_or_else(|| vec![String::from("Main must take no arguments")])?;

        let main_call_pc = self.code.len();
        self.code.write_op(Op::StaticCall);
        self.code.write_u16(main.class_id);
        self.code.write_u16(main.fn_id);
        self.code.write_u8(0);
        self.code.write_op(Op::End);

        let entry_pc = self.code.len();
        self.init_statics().map_err(|e| vec![e])?;
        self.code.write_op(Op::Jump);
        self.code.write_u32(main_call_pc);
        Ok(entry_pc)
    }

    /// Allocate and pre-shape each class's static region, then emit the
    /// initializer stores. Executed as the program prologue.
    fn init_statics(&mut self) -> Result<(), String> {
        for index in 0..self.classes.len() {
            if self.classes[index].is_template_class() {
                continue;
            }
            let size = self.classes[index].static_size;
            if size == 0 {
                continue;
            }
            let base = self
                .memory
                .alloc(Region::Static, size)
                .map_err(|e| e.to_string())?;
            self.memory.fill(base, 0, size).map_err(|e| e.to_string())?;
            self.classes[index].static_base = base;

            let fields = self.classes[index].static_fields.clone();
            let class_id = self.classes[index].id;
            for field in &fields {
                self.shape_static_field(base, field).map_err(|e| e.to_string())?;
            }
            for field in fields {
                if let Some(init) = field.init_expr {
                    let target = self.arena.add(Expr::StaticVar {
                        class_id,
                        members: Vec::new(),
                        offset: field.offset,
                        type_info: field.type_info,
                        is_array: !field.dims.is_empty(),
                    });
                    let set = self.arena.add(Expr::Set {
                        target,
                        value: init,
                        call: CallInfo::unresolved(),
                    });
                    self.resolve_expr(set)?;
                    self.emit_statement(set);
                }
            }
        }
        Ok(())
    }

    /// Stamp array headers and interior class-id words for one static field.
    fn shape_static_field(&mut self, base: Addr, field: &ClassField) -> Result<(), String> {
        let t = field.type_info.type_id;
        if !field.dims.is_empty() {
            let elem_plevel = field.type_info.pointer_level - 1;
            let mut header = ArrayHeader {
                elem_pointer_level: elem_plevel,
                num_dims: field.dims.len() as u8,
                dims: [0; MAX_ARRAY_DIMS],
            };
            let mut count = 1u64;
            for (i, d) in field.dims.iter().enumerate() {
                header.dims[i] = d.0;
                count *= d.0 as u64;
            }
            let elements = base.offset(field.offset as i64);
            header
                .write(&mut self.memory, elements)
                .map_err(|e| e.to_string())?;
            if elem_plevel == 0 && !is_primitive_type(t) {
                let stride = elem_stride(&self.classes, t, 0);
                for i in 0..count {
                    let slot = elements.offset((i * stride) as i64);
                    self.memory
                        .write_u64(slot, t as u64)
                        .map_err(|e| e.to_string())?;
                    init_interior(
                        &self.classes,
                        t,
                        slot.offset(VTABLE_SLOT_SIZE as i64),
                        &mut self.memory,
                    )
                    .map_err(|e| e.to_string())?;
                }
            }
        } else if field.type_info.pointer_level == 0 && !is_primitive_type(t) {
            let payload = base.offset(field.offset as i64);
            self.memory
                .write_u64(payload.offset(-(VTABLE_SLOT_SIZE as i64)), t as u64)
                .map_err(|e| e.to_string())?;
            init_interior(&self.classes, t, payload, &mut self.memory).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}
