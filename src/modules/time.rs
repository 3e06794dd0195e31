use crate::memory::Region;
use crate::modules::ModuleCtx;
use crate::types::{TypeInfo, TYPE_UINT64};
use crate::value::Value;
use crate::vm::Result;

pub const GET_MILLI: u16 = 0;
pub const GET_MICRO: u16 = 1;
pub const GET_NANO: u16 = 2;

pub fn function_id(name: &str) -> Option<u16> {
    match name {
        "GetMilli" => Some(GET_MILLI),
        "GetMicro" => Some(GET_MICRO),
        "GetNano" => Some(GET_NANO),
        _ => None,
    }
}

pub fn call(ctx: &mut ModuleCtx, function: u16, _args: &[Value]) -> Result<Value> {
    let elapsed = ctx.started.elapsed();
    let value = match function {
        GET_MILLI => elapsed.as_millis() as u64,
        GET_MICRO => elapsed.as_micros() as u64,
        GET_NANO => elapsed.as_nanos() as u64,
        _ => 0,
    };
    Value::make_u64(value, ctx.memory, Region::Stack)
}

pub fn return_info(_function: u16) -> TypeInfo {
    TypeInfo::new(TYPE_UINT64, 0)
}
