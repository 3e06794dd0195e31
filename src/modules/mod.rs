// Built-in modules.
//
// A module is addressed by a stable 16-bit id, a function or constant by a
// 16-bit id inside it. The core only ever goes through this gateway: call,
// constant, and their type queries. Modules may allocate their return in
// the program's stack region; it lives until the next scope-marker reset.

pub mod fs;
pub mod gl;
pub mod io;
pub mod math;
pub mod mem;
pub mod time;
pub mod window;

use crate::memory::Memory;
use crate::types::{TypeInfo, INVALID_ID};
use crate::value::Value;
use crate::vm::{Output, Result};
use std::time::Instant;

pub const IO_MODULE: u16 = 0;
pub const MATH_MODULE: u16 = 1;
pub const WINDOW_MODULE: u16 = 2;
pub const GL_MODULE: u16 = 3;
pub const FS_MODULE: u16 = 4;
pub const MEM_MODULE: u16 = 5;
pub const TIME_MODULE: u16 = 6;

/// Everything a module implementation may touch.
pub struct ModuleCtx<'a> {
    pub memory: &'a mut Memory,
    pub fs: &'a mut fs::FsState,
    pub out: &'a mut dyn Output,
    pub started: Instant,
}

pub fn lookup(name: &str) -> Option<u16> {
    match name {
        "IO" => Some(IO_MODULE),
        "Math" => Some(MATH_MODULE),
        "Window" => Some(WINDOW_MODULE),
        "GL" => Some(GL_MODULE),
        "FS" => Some(FS_MODULE),
        "Mem" => Some(MEM_MODULE),
        "Time" => Some(TIME_MODULE),
        _ => None,
    }
}

/// Function id for `module.name`, used by the parser.
pub fn function_id(module: u16, name: &str) -> Option<u16> {
    match module {
        IO_MODULE => io::function_id(name),
        MATH_MODULE => math::function_id(name),
        FS_MODULE => fs::function_id(name),
        MEM_MODULE => mem::function_id(name),
        TIME_MODULE => time::function_id(name),
        WINDOW_MODULE => window::function_id(name),
        GL_MODULE => gl::function_id(name),
        _ => None,
    }
}

pub fn constant_id(module: u16, name: &str) -> Option<u16> {
    match module {
        MATH_MODULE => math::constant_id(name),
        _ => None,
    }
}

pub fn call(ctx: &mut ModuleCtx, module: u16, function: u16, args: &[Value]) -> Result<Value> {
    match module {
        IO_MODULE => io::call(ctx, function, args),
        MATH_MODULE => math::call(ctx, function, args),
        FS_MODULE => fs::call(ctx, function, args),
        MEM_MODULE => mem::call(ctx, function, args),
        TIME_MODULE => time::call(ctx, function, args),
        WINDOW_MODULE => window::call(ctx, function, args),
        GL_MODULE => gl::call(ctx, function, args),
        _ => Ok(Value::null()),
    }
}

pub fn constant(ctx: &mut ModuleCtx, module: u16, constant: u16) -> Result<Value> {
    match module {
        MATH_MODULE => math::constant(ctx, constant),
        _ => Ok(Value::null()),
    }
}

pub fn return_info(module: u16, function: u16) -> TypeInfo {
    match module {
        IO_MODULE => io::return_info(function),
        MATH_MODULE => math::return_info(function),
        FS_MODULE => fs::return_info(function),
        MEM_MODULE => mem::return_info(function),
        TIME_MODULE => time::return_info(function),
        WINDOW_MODULE => window::return_info(function),
        GL_MODULE => gl::return_info(function),
        _ => TypeInfo::new(INVALID_ID, 0),
    }
}

pub fn constant_info(module: u16, constant: u16) -> TypeInfo {
    match module {
        MATH_MODULE => math::constant_info(constant),
        _ => TypeInfo::new(INVALID_ID, 0),
    }
}
