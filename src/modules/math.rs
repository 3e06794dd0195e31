use crate::memory::Region;
use crate::modules::ModuleCtx;
use crate::types::{TypeInfo, INVALID_ID, TYPE_REAL32, TYPE_REAL64};
use crate::value::Value;
use crate::vm::Result;

pub const COS: u16 = 0;
pub const SIN: u16 = 1;
pub const TAN: u16 = 2;
pub const ACOS: u16 = 3;
pub const ASIN: u16 = 4;
pub const ATAN: u16 = 5;
pub const ATAN2: u16 = 6;
pub const COSH: u16 = 7;
pub const SINH: u16 = 8;
pub const TANH: u16 = 9;
pub const ACOSH: u16 = 10;
pub const ASINH: u16 = 11;
pub const ATANH: u16 = 12;
pub const DEG_TO_RAD: u16 = 13;
pub const RAD_TO_DEG: u16 = 14;
pub const FLOOR: u16 = 15;
pub const CEIL: u16 = 16;
pub const ROUND: u16 = 17;
pub const MIN: u16 = 18;
pub const MAX: u16 = 19;
pub const CLAMP: u16 = 20;
pub const LERP: u16 = 21;
pub const ABS: u16 = 22;
pub const SQRT: u16 = 23;
pub const POW: u16 = 24;
pub const EXP: u16 = 25;
pub const LOG: u16 = 26;
pub const LOG10: u16 = 27;
pub const LOG2: u16 = 28;
pub const MODF: u16 = 29;
pub const MOD: u16 = 30;

pub const PI: u16 = 0;
pub const E: u16 = 1;
pub const TAU: u16 = 2;

pub fn function_id(name: &str) -> Option<u16> {
    Some(match name {
        "Cos" => COS,
        "Sin" => SIN,
        "Tan" => TAN,
        "Acos" => ACOS,
        "Asin" => ASIN,
        "Atan" => ATAN,
        "Atan2" => ATAN2,
        "Cosh" => COSH,
        "Sinh" => SINH,
        "Tanh" => TANH,
        "Acosh" => ACOSH,
        "Asinh" => ASINH,
        "Atanh" => ATANH,
        "DegToRad" => DEG_TO_RAD,
        "RadToDeg" => RAD_TO_DEG,
        "Floor" => FLOOR,
        "Ceil" => CEIL,
        "Round" => ROUND,
        "Min" => MIN,
        "Max" => MAX,
        "Clamp" => CLAMP,
        "Lerp" => LERP,
        "Abs" => ABS,
        "Sqrt" => SQRT,
        "Pow" => POW,
        "Exp" => EXP,
        "Log" => LOG,
        "Log10" => LOG10,
        "Log2" => LOG2,
        "Modf" => MODF,
        "Mod" => MOD,
        _ => return None,
    })
}

pub fn constant_id(name: &str) -> Option<u16> {
    match name {
        "PI" => Some(PI),
        "E" => Some(E),
        "TAU" => Some(TAU),
        _ => None,
    }
}

pub fn call(ctx: &mut ModuleCtx, function: u16, args: &[Value]) -> Result<Value> {
    let a = match args.first() {
        Some(v) => v.get_f64(ctx.memory)?,
        None => 0.0,
    };
    let b = match args.get(1) {
        Some(v) => v.get_f64(ctx.memory)?,
        None => 0.0,
    };
    let c = match args.get(2) {
        Some(v) => v.get_f64(ctx.memory)?,
        None => 0.0,
    };

    if function == MODF {
        let result = (a as f32) % (b as f32);
        return Value::make_f32(result, ctx.memory, Region::Stack);
    }

    let result = match function {
        COS => a.cos(),
        SIN => a.sin(),
        TAN => a.tan(),
        ACOS => a.acos(),
        ASIN => a.asin(),
        ATAN => a.atan(),
        ATAN2 => a.atan2(b),
        COSH => a.cosh(),
        SINH => a.sinh(),
        TANH => a.tanh(),
        ACOSH => a.acosh(),
        ASINH => a.asinh(),
        ATANH => a.atanh(),
        DEG_TO_RAD => a.to_radians(),
        RAD_TO_DEG => a.to_degrees(),
        FLOOR => a.floor(),
        CEIL => a.ceil(),
        ROUND => a.round(),
        MIN => a.min(b),
        MAX => a.max(b),
        CLAMP => {
            if a < b {
                b
            } else if a > c {
                c
            } else {
                a
            }
        }
        LERP => a + (b - a) * c,
        ABS => a.abs(),
        SQRT => a.sqrt(),
        POW => a.powf(b),
        EXP => a.exp(),
        LOG => {
            if args.len() == 1 {
                a.ln()
            } else {
                a.ln() / b.ln()
            }
        }
        LOG10 => a.log10(),
        LOG2 => a.log2(),
        MOD => a % b,
        _ => 0.0,
    };
    Value::make_f64(result, ctx.memory, Region::Stack)
}

pub fn constant(ctx: &mut ModuleCtx, constant: u16) -> Result<Value> {
    let value = match constant {
        PI => std::f64::consts::PI,
        E => std::f64::consts::E,
        TAU => std::f64::consts::PI * 2.0,
        _ => return Ok(Value::null()),
    };
    Value::make_f64(value, ctx.memory, Region::Stack)
}

pub fn return_info(function: u16) -> TypeInfo {
    if function == MODF {
        TypeInfo::new(TYPE_REAL32, 0)
    } else {
        TypeInfo::new(TYPE_REAL64, 0)
    }
}

pub fn constant_info(constant: u16) -> TypeInfo {
    match constant {
        PI | E | TAU => TypeInfo::new(TYPE_REAL64, 0),
        _ => TypeInfo::new(INVALID_ID, 0),
    }
}
