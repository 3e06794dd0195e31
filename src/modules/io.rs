use crate::modules::ModuleCtx;
use crate::types::{TypeInfo, TYPE_VOID};
use crate::value::{format_value, Value};
use crate::vm::Result;

pub const PRINT: u16 = 0;
pub const PRINTLN: u16 = 1;

pub fn function_id(name: &str) -> Option<u16> {
    match name {
        "Print" => Some(PRINT),
        "Println" => Some(PRINTLN),
        _ => None,
    }
}

pub fn call(ctx: &mut ModuleCtx, function: u16, args: &[Value]) -> Result<Value> {
    match function {
        PRINT => {
            if let Some(arg) = args.first() {
                let text = format_value(arg, ctx.memory)?;
                ctx.out.emit(&text);
            }
        }
        PRINTLN => {
            let mut text = match args.first() {
                Some(arg) => format_value(arg, ctx.memory)?,
                None => String::new(),
            };
            text.push('\n');
            ctx.out.emit(&text);
        }
        _ => {}
    }
    Ok(Value::null())
}

pub fn return_info(_function: u16) -> TypeInfo {
    TypeInfo::new(TYPE_VOID, 0)
}
