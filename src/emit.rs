// AST -> bytecode lowering.
//
// Statement position decides whether a node materializes a value: pure
// reads emit nothing as statements, calls drop their return value, and
// `++`/`--` skip the re-push. Call sites append one implicit-cast
// constructor id per argument, written in reverse so the callee's binding
// loop (which pops right-to-left) reads them in step.

use crate::ast::{BinOp, Expr, ExprId, UpdateOp};
use crate::bytecode::Op;
use crate::program::Program;
use crate::types::*;
use crate::value::Value;

impl Program {
    pub fn emit_expr(&mut self, id: ExprId) {
        self.emit_node(id, true);
    }

    pub fn emit_statement(&mut self, id: ExprId) {
        // value-only nodes have no effect in statement position
        let value_only = matches!(
            self.arena.get(id),
            Expr::Literal { .. }
                | Expr::ConstUInt { .. }
                | Expr::TemplateConst { .. }
                | Expr::This { .. }
                | Expr::PushLocal { .. }
                | Expr::PushMember { .. }
                | Expr::PushIndexed { .. }
                | Expr::StaticVar { .. }
                | Expr::ModuleConstant { .. }
                | Expr::Binary { .. }
                | Expr::Negate { .. }
                | Expr::Invert { .. }
                | Expr::AddressOf { .. }
                | Expr::Deref { .. }
                | Expr::Cast { .. }
                | Expr::SizeOf { .. }
                | Expr::OffsetOf { .. }
                | Expr::Strlen { .. }
        );
        if !value_only {
            self.emit_node(id, false);
        }
    }

    fn emit_body(&mut self, body: &[ExprId]) {
        for &stmt in body {
            self.emit_statement(stmt);
        }
    }

    /// Implicit-cast ids trail the call operands, reversed to match the
    /// callee's right-to-left binding order.
    fn emit_cast_ids(&mut self, cast_fns: &[u16]) {
        for &cast in cast_fns.iter().rev() {
            self.code.write_u16(cast);
        }
    }

    fn emit_args(&mut self, args: &[ExprId]) {
        for &arg in args {
            self.emit_expr(arg);
        }
    }

    fn emit_literal(&mut self, value: &Value) {
        if value.type_id == TYPE_CHAR && value.pointer_level == 1 {
            let text = value.pointer_word(&self.memory).unwrap_or(0);
            self.code.write_op(Op::PushStr);
            self.code.write_u64(text);
            return;
        }
        if !value.type_info().is_valid() || value.data.is_null() {
            self.code.write_op(Op::PushNull);
            self.code.write_u16(value.type_id);
            self.code.write_u8(value.pointer_level);
            return;
        }
        self.code.write_op(Op::PushPrim);
        self.code.write_u8(value.type_id as u8);
        match Primitive::from_type(value.type_id) {
            Some(Primitive::UInt8) => self.code.write_u8(value.get_u64(&self.memory).unwrap_or(0) as u8),
            Some(Primitive::UInt16) => self.code.write_u16(value.get_u64(&self.memory).unwrap_or(0) as u16),
            Some(Primitive::UInt32) => self.code.write_u32(value.get_u64(&self.memory).unwrap_or(0) as u32),
            Some(Primitive::UInt64) => self.code.write_u64(value.get_u64(&self.memory).unwrap_or(0)),
            Some(Primitive::Int8) => self.code.write_u8(value.get_i64(&self.memory).unwrap_or(0) as u8),
            Some(Primitive::Int16) => self.code.write_u16(value.get_i64(&self.memory).unwrap_or(0) as u16),
            Some(Primitive::Int32) => self.code.write_u32(value.get_i64(&self.memory).unwrap_or(0) as u32),
            Some(Primitive::Int64) => self.code.write_i64(value.get_i64(&self.memory).unwrap_or(0)),
            Some(Primitive::Real32) => self.code.write_f32(value.get_f64(&self.memory).unwrap_or(0.0) as f32),
            Some(Primitive::Real64) => self.code.write_f64(value.get_f64(&self.memory).unwrap_or(0.0)),
            Some(Primitive::Bool) => self.code.write_u8(value.get_bool(&self.memory).unwrap_or(false) as u8),
            Some(Primitive::Char) => self.code.write_u8(value.get_char(&self.memory).unwrap_or(0)),
            _ => self.code.write_u8(0),
        }
    }

    fn emit_zero(&mut self, prim: Primitive) {
        self.code.write_op(Op::PushPrim);
        self.code.write_u8(prim as u16 as u8);
        match prim {
            Primitive::UInt8 | Primitive::Int8 | Primitive::Bool | Primitive::Char => {
                self.code.write_u8(0)
            }
            Primitive::UInt16 | Primitive::Int16 => self.code.write_u16(0),
            Primitive::UInt32 | Primitive::Int32 => self.code.write_u32(0),
            Primitive::UInt64 | Primitive::Int64 => self.code.write_u64(0),
            Primitive::Real32 => self.code.write_f32(0.0),
            Primitive::Real64 => self.code.write_f64(0.0),
            _ => self.code.write_u8(0),
        }
    }

    fn binary_opcode(op: BinOp) -> Op {
        match op {
            BinOp::Add => Op::Add,
            BinOp::Sub => Op::Sub,
            BinOp::Mul => Op::Mul,
            BinOp::Div => Op::Div,
            BinOp::Mod => Op::Mod,
            BinOp::Less => Op::Less,
            BinOp::Greater => Op::Greater,
            BinOp::LessEq => Op::LessEq,
            BinOp::GreaterEq => Op::GreaterEq,
            BinOp::Eq => Op::Eq,
            BinOp::NotEq => Op::NotEq,
            BinOp::BitAnd => Op::BitAnd,
            BinOp::BitOr => Op::BitOr,
            BinOp::Shl => Op::Shl,
            BinOp::Shr => Op::Shr,
            BinOp::LogicalAnd => Op::LogicalAnd,
            BinOp::LogicalOr => Op::LogicalOr,
        }
    }

    fn emit_node(&mut self, id: ExprId, use_ret: bool) {
        let node = self.arena.get(id).clone();
        match node {
            Expr::Literal { value } => self.emit_literal(&value),

            Expr::ConstUInt { value } => {
                self.code.write_op(Op::PushPrim);
                self.code.write_u8(TYPE_UINT32 as u8);
                self.code.write_u32(value);
            }

            Expr::TemplateConst { .. } => {}

            Expr::This { .. } => self.code.write_op(Op::PushThis),

            Expr::PushLocal { slot, .. } => {
                self.code.write_op(Op::PushLocal);
                self.code.write_u16(slot);
            }

            Expr::PushMember { base, type_info, is_array, offset, .. } => {
                self.emit_expr(base);
                self.code.write_op(Op::PushMember);
                self.code.write_u16(type_info.type_id);
                self.code.write_u8(type_info.pointer_level);
                self.code.write_u64(offset);
                self.code.write_u8(0);
                self.code.write_u8(is_array as u8);
            }

            Expr::PushIndexed { base, indices, call } => {
                let result = self.expr_type(id);
                self.emit_expr(base);
                for &index in indices.iter().rev() {
                    self.emit_expr(index);
                }
                self.code.write_op(Op::PushIndexed);
                self.code.write_u64(self.type_size(result.type_id));
                self.code.write_u8(indices.len() as u8);
                self.code.write_u16(call.fn_id);
                if call.is_resolved() {
                    self.code.write_u16(call.class_id);
                    self.emit_cast_ids(&call.cast_fns);
                }
            }

            Expr::StaticVar { class_id, offset, type_info, is_array, .. } => {
                self.code.write_op(Op::PushStatic);
                self.code.write_u16(class_id);
                self.code.write_u64(offset);
                self.code.write_u16(type_info.type_id);
                self.code.write_u8(type_info.pointer_level);
                self.code.write_u8(0);
                self.code.write_u8(is_array as u8);
            }

            Expr::ModuleCall { module, function, args } => {
                for &arg in args.iter().rev() {
                    self.emit_expr(arg);
                }
                self.code.write_op(Op::ModuleCall);
                self.code.write_u16(module);
                self.code.write_u16(function);
                self.code.write_u8(args.len() as u8);
                self.code.write_u8(use_ret as u8);
            }

            Expr::ModuleConstant { module, constant } => {
                self.code.write_op(Op::ModuleConstant);
                self.code.write_u16(module);
                self.code.write_u16(constant);
            }

            Expr::DeclarePrim { prim, slot, init } => {
                match init {
                    Some(init) => self.emit_expr(init),
                    None => self.emit_zero(prim),
                }
                self.code.write_op(Op::DeclarePrim);
                self.code.write_u8(prim as u16 as u8);
                self.code.write_u16(slot);
            }

            Expr::DeclarePointer { type_id, pointer_level, slot, init, .. } => {
                match init {
                    Some(init) => self.emit_expr(init),
                    None => {
                        self.code.write_op(Op::PushNull);
                        self.code.write_u16(type_id);
                        self.code.write_u8(pointer_level);
                    }
                }
                self.code.write_op(Op::DeclarePointer);
                self.code.write_u16(type_id);
                self.code.write_u8(pointer_level);
                self.code.write_u16(slot);
            }

            Expr::DeclareRef { slot, init, .. } => {
                self.emit_expr(init);
                self.code.write_op(Op::DeclareRef);
                self.code.write_u16(slot);
            }

            Expr::DeclareArray { type_id, elem_pointer_level, slot, dims, inits, .. } => {
                for &init in inits.iter().rev() {
                    self.emit_expr(init);
                }
                self.code.write_op(Op::DeclareArray);
                self.code.write_u16(type_id);
                self.code.write_u8(elem_pointer_level);
                self.code.write_u8(dims.len() as u8);
                self.code.write_u32(inits.len() as u32);
                self.code.write_u16(slot);
                for (extent, _) in &dims {
                    self.code.write_u32(*extent);
                }
            }

            Expr::DeclareObject { type_id, slot, args, call, .. } => {
                self.emit_args(&args);
                self.code.write_op(Op::DeclareObject);
                self.code.write_u16(type_id);
                self.code.write_u16(call.fn_id);
                self.code.write_u16(slot);
                if call.is_resolved() {
                    self.emit_cast_ids(&call.cast_fns);
                }
            }

            Expr::DeclareObjectAssign { type_id, slot, init, call, .. } => {
                self.emit_expr(init);
                self.code.write_op(Op::DeclareObjectAssign);
                self.code.write_u16(type_id);
                self.code.write_u16(slot);
                self.code.write_u16(call.fn_id);
            }

            Expr::Set { target, value, call } => {
                self.emit_expr(value);
                self.emit_expr(target);
                self.code.write_op(Op::Set);
                self.code.write_u16(call.fn_id);
            }

            Expr::Binary { op, lhs, rhs, call } => {
                self.emit_expr(lhs);
                self.emit_expr(rhs);
                self.code.write_op(Self::binary_opcode(op));
                self.code.write_u16(call.fn_id);
                if call.is_resolved() {
                    self.emit_cast_ids(&call.cast_fns);
                }
            }

            Expr::ArithAssign { op, target, amount } => {
                self.emit_expr(target);
                self.emit_expr(amount);
                self.code.write_op(match op {
                    BinOp::Add => Op::AddAssign,
                    BinOp::Sub => Op::SubAssign,
                    BinOp::Mul => Op::MulAssign,
                    BinOp::Div => Op::DivAssign,
                    _ => Op::ModAssign,
                });
            }

            Expr::UnaryUpdate { op, expr } => {
                self.emit_expr(expr);
                self.code.write_op(Op::UnaryUpdate);
                self.code.write_u8(match op {
                    UpdateOp::PreInc => 0,
                    UpdateOp::PreDec => 1,
                    UpdateOp::PostInc => 2,
                    UpdateOp::PostDec => 3,
                });
                self.code.write_u8(use_ret as u8);
            }

            Expr::Negate { expr } => {
                self.emit_expr(expr);
                self.code.write_op(Op::Negate);
            }

            Expr::Invert { expr } => {
                self.emit_expr(expr);
                self.code.write_op(Op::Invert);
            }

            Expr::AddressOf { expr } => {
                self.emit_expr(expr);
                self.code.write_op(Op::AddressOf);
            }

            Expr::Deref { expr } => {
                self.emit_expr(expr);
                self.code.write_op(Op::Deref);
            }

            Expr::Cast { expr, type_id, pointer_level, .. } => {
                self.emit_expr(expr);
                self.code.write_op(Op::Cast);
                self.code.write_u16(type_id);
                self.code.write_u8(pointer_level);
            }

            Expr::IfElse { cond, then_scope, else_scope, then_body, else_body } => {
                self.emit_expr(cond);
                self.code.write_op(Op::JumpIfFalse);
                let to_else = self.code.len();
                self.code.write_u32(0);

                if then_scope {
                    self.code.write_op(Op::PushScope);
                }
                self.emit_body(&then_body);
                if then_scope {
                    self.code.write_op(Op::PopScope);
                }

                self.code.write_op(Op::Jump);
                let to_end = self.code.len();
                self.code.write_u32(0);

                let else_label = self.code.len();
                self.code.patch_u32(to_else, else_label);

                if else_scope {
                    self.code.write_op(Op::PushScope);
                }
                self.emit_body(&else_body);
                if else_scope {
                    self.code.write_op(Op::PopScope);
                }

                let end_label = self.code.len();
                self.code.patch_u32(to_end, end_label);
            }

            Expr::For { init, cond, step, body } => {
                self.emit_loop(init, cond, step, &body);
            }

            Expr::While { cond, body } => {
                self.emit_loop(None, Some(cond), None, &body);
            }

            Expr::Break => self.code.write_op(Op::Break),
            Expr::Continue => self.code.write_op(Op::Continue),
            Expr::Breakpoint => self.code.write_op(Op::Breakpoint),

            Expr::Return { expr, by_reference } => {
                if let Some(expr) = expr {
                    self.emit_expr(expr);
                }
                self.code.write_op(Op::Return);
                self.code.write_u8(if by_reference {
                    2
                } else if expr.is_some() {
                    1
                } else {
                    0
                });
            }

            Expr::StaticCall { args, call, .. } => {
                self.emit_args(&args);
                self.code.write_op(Op::StaticCall);
                self.code.write_u16(call.class_id);
                self.code.write_u16(call.fn_id);
                self.code.write_u8(use_ret as u8);
                self.emit_cast_ids(&call.cast_fns);
            }

            Expr::MemberCall { base, args, call, .. } => {
                self.emit_args(&args);
                self.emit_expr(base);
                let base_info = self.expr_type(base);
                if base_info.pointer_level == 1 {
                    self.code.write_op(Op::Deref);
                }
                if call.virtual_slot != INVALID_ID {
                    self.code.write_op(Op::VirtualCall);
                    self.code.write_u16(call.virtual_slot);
                    self.code.write_u8(use_ret as u8);
                } else {
                    self.code.write_op(Op::MemberCall);
                    self.code.write_u16(call.class_id);
                    self.code.write_u16(call.fn_id);
                    self.code.write_u8(use_ret as u8);
                }
                self.emit_cast_ids(&call.cast_fns);
            }

            Expr::ConstructorCall { type_id, args, call, .. } => {
                self.emit_args(&args);
                self.code.write_op(Op::ConstructorCall);
                self.code.write_u16(type_id);
                self.code.write_u16(call.fn_id);
                if call.is_resolved() {
                    self.emit_cast_ids(&call.cast_fns);
                }
            }

            Expr::New { type_id, args, call, .. } => {
                self.emit_args(&args);
                self.code.write_op(Op::New);
                self.code.write_u16(type_id);
                self.code.write_u16(call.fn_id);
                if call.is_resolved() {
                    self.emit_cast_ids(&call.cast_fns);
                }
            }

            Expr::NewArray { type_id, pointer_level, size, .. } => {
                self.emit_expr(size);
                self.code.write_op(Op::NewArray);
                self.code.write_u16(type_id);
                self.code.write_u8(pointer_level);
            }

            Expr::Delete { expr, is_array } => {
                self.emit_expr(expr);
                self.code
                    .write_op(if is_array { Op::DeleteArray } else { Op::Delete });
            }

            Expr::SizeOf { type_id, is_pointer, .. } => {
                let size = if is_pointer { 8 } else { self.type_size(type_id) };
                self.code.write_op(Op::PushPrim);
                self.code.write_u8(TYPE_UINT64 as u8);
                self.code.write_u64(size);
            }

            Expr::OffsetOf { offset, .. } => {
                self.code.write_op(Op::PushPrim);
                self.code.write_u8(TYPE_UINT64 as u8);
                self.code.write_u64(offset);
            }

            Expr::Strlen { expr } => {
                self.emit_expr(expr);
                self.code.write_op(Op::Strlen);
            }
        }
    }

    /// Shared skeleton for `for` and `while`. The loop's recorded start pc
    /// is the tail (increment, scope pop, jump back), so `continue` can
    /// unwind to the body scope and land there on every path.
    fn emit_loop(
        &mut self,
        init: Option<ExprId>,
        cond: Option<ExprId>,
        step: Option<ExprId>,
        body: &[ExprId],
    ) {
        if let Some(init) = init {
            self.emit_statement(init);
        }

        self.code.write_op(Op::PushLoop);
        let loop_operands = self.code.len();
        self.code.write_u32(0);
        self.code.write_u32(0);

        let cond_pos = self.code.len();
        self.code.write_op(Op::PushScope);
        match cond {
            Some(cond) => self.emit_expr(cond),
            None => {
                self.code.write_op(Op::PushPrim);
                self.code.write_u8(TYPE_BOOL as u8);
                self.code.write_u8(1);
            }
        }
        self.code.write_op(Op::JumpIfFalse);
        let exit_patch = self.code.len();
        self.code.write_u32(0);

        self.emit_body(body);

        let tail_pos = self.code.len();
        if let Some(step) = step {
            self.emit_statement(step);
        }
        self.code.write_op(Op::PopScope);
        self.code.write_op(Op::Jump);
        self.code.write_u32(cond_pos);

        let end_pos = self.code.len();
        self.code.write_op(Op::PopLoop);
        self.code.write_op(Op::PopScope);

        self.code.patch_u32(exit_patch, end_pos);
        self.code.patch_u32(loop_operands, tail_pos);
        self.code.patch_u32(loop_operands + 4, end_pos);
    }
}
