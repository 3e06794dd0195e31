// Windowing is host-provided; the id space is reserved but no bindings
// ship with the core. Calls are accepted and return void so programs that
// import the module still compile and run headless.

use crate::modules::ModuleCtx;
use crate::types::{TypeInfo, TYPE_VOID};
use crate::value::Value;
use crate::vm::Result;

pub fn function_id(_name: &str) -> Option<u16> {
    None
}

pub fn call(_ctx: &mut ModuleCtx, _function: u16, _args: &[Value]) -> Result<Value> {
    Ok(Value::null())
}

pub fn return_info(_function: u16) -> TypeInfo {
    TypeInfo::new(TYPE_VOID, 0)
}
