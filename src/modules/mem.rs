use crate::memory::{Addr, Region};
use crate::modules::ModuleCtx;
use crate::types::{TypeInfo, TYPE_VOID};
use crate::value::Value;
use crate::vm::Result;

pub const COPY: u16 = 0;
pub const ALLOC: u16 = 1;
pub const FREE: u16 = 2;
pub const SET: u16 = 3;

pub fn function_id(name: &str) -> Option<u16> {
    match name {
        "Copy" => Some(COPY),
        "Alloc" => Some(ALLOC),
        "Free" => Some(FREE),
        "Set" => Some(SET),
        _ => None,
    }
}

pub fn call(ctx: &mut ModuleCtx, function: u16, args: &[Value]) -> Result<Value> {
    match function {
        COPY => {
            let dst = Addr(args[0].pointer_word(ctx.memory)?);
            let src = Addr(args[1].pointer_word(ctx.memory)?);
            let count = args[2].get_u64(ctx.memory)?;
            ctx.memory.copy(dst, src, count)?;
            Ok(Value::null())
        }
        ALLOC => {
            let count = args[0].get_u64(ctx.memory)?;
            let block = ctx.memory.alloc(Region::Heap, count)?;
            Value::make_pointer(TYPE_VOID, 1, block, ctx.memory, Region::Stack)
        }
        FREE => {
            let block = Addr(args[0].pointer_word(ctx.memory)?);
            ctx.memory.free(block)?;
            Ok(Value::null())
        }
        SET => {
            let dst = Addr(args[0].pointer_word(ctx.memory)?);
            let byte = args[1].get_u64(ctx.memory)? as u8;
            let count = args[2].get_u64(ctx.memory)?;
            ctx.memory.fill(dst, byte, count)?;
            Ok(Value::null())
        }
        _ => Ok(Value::null()),
    }
}

pub fn return_info(function: u16) -> TypeInfo {
    match function {
        ALLOC => TypeInfo::new(TYPE_VOID, 1),
        _ => TypeInfo::new(TYPE_VOID, 0),
    }
}
