use crate::memory::{Addr, Region};
use crate::modules::ModuleCtx;
use crate::types::{TypeInfo, TYPE_BOOL, TYPE_CHAR, TYPE_UINT32, TYPE_UINT8, TYPE_VOID};
use crate::value::Value;
use crate::vm::Result;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};

pub const READ_TEXT_FILE: u16 = 0;
pub const READ_BINARY_FILE: u16 = 1;
pub const OPEN_FILE: u16 = 2;
pub const CLOSE_FILE: u16 = 3;
pub const READ_LINE: u16 = 4;

/// Open-file table; handles are index + 1 so 0 can mean failure.
pub struct FsState {
    files: Vec<Option<BufReader<File>>>,
}

impl FsState {
    pub fn new() -> FsState {
        FsState { files: Vec::new() }
    }

    fn open(&mut self, path: &str) -> u32 {
        match File::open(path) {
            Ok(file) => {
                self.files.push(Some(BufReader::new(file)));
                self.files.len() as u32
            }
            Err(_) => 0,
        }
    }

    fn close(&mut self, handle: u32) {
        if handle > 0 && handle as usize <= self.files.len() {
            self.files[handle as usize - 1] = None;
        }
    }

    fn reader(&mut self, handle: u32) -> Option<&mut BufReader<File>> {
        if handle == 0 {
            return None;
        }
        self.files.get_mut(handle as usize - 1)?.as_mut()
    }
}

pub fn function_id(name: &str) -> Option<u16> {
    match name {
        "ReadTextFile" => Some(READ_TEXT_FILE),
        "ReadBinaryFile" => Some(READ_BINARY_FILE),
        "OpenFile" => Some(OPEN_FILE),
        "CloseFile" => Some(CLOSE_FILE),
        "ReadLine" => Some(READ_LINE),
        _ => None,
    }
}

fn path_arg(ctx: &mut ModuleCtx, args: &[Value]) -> Result<String> {
    let value = args.first().copied().unwrap_or_else(Value::null);
    let addr = Addr(value.pointer_word(ctx.memory)?);
    Ok(ctx.memory.read_cstr(addr)?)
}

pub fn call(ctx: &mut ModuleCtx, function: u16, args: &[Value]) -> Result<Value> {
    match function {
        READ_TEXT_FILE => {
            let path = path_arg(ctx, args)?;
            let text = std::fs::read_to_string(&path).unwrap_or_default();
            let data = ctx.memory.alloc_cstr(Region::Heap, &text)?;
            Value::make_cstr(data, ctx.memory, Region::Stack)
        }
        READ_BINARY_FILE => {
            let path = path_arg(ctx, args)?;
            let mut bytes = Vec::new();
            if let Ok(mut file) = File::open(&path) {
                let _ = file.read_to_end(&mut bytes);
            }
            let data = ctx.memory.alloc(Region::Heap, bytes.len() as u64 + 1)?;
            ctx.memory.bytes_mut(data, bytes.len() as u64)?.copy_from_slice(&bytes);
            Value::make_pointer(TYPE_UINT8, 1, data, ctx.memory, Region::Stack)
        }
        OPEN_FILE => {
            let path = path_arg(ctx, args)?;
            let handle = ctx.fs.open(&path);
            Value::make_u32(handle, ctx.memory, Region::Stack)
        }
        CLOSE_FILE => {
            let handle = args
                .first()
                .map(|v| v.get_u64(ctx.memory))
                .transpose()?
                .unwrap_or(0) as u32;
            ctx.fs.close(handle);
            Ok(Value::null())
        }
        READ_LINE => {
            let handle = args
                .first()
                .map(|v| v.get_u64(ctx.memory))
                .transpose()?
                .unwrap_or(0) as u32;
            let buffer = Addr(args.get(1).copied().unwrap_or_else(Value::null).pointer_word(ctx.memory)?);
            let max = args
                .get(2)
                .map(|v| v.get_u64(ctx.memory))
                .transpose()?
                .unwrap_or(0);
            let mut line = String::new();
            let ok = match ctx.fs.reader(handle) {
                Some(reader) => reader.read_line(&mut line).unwrap_or(0) > 0,
                None => false,
            };
            if ok && max > 0 {
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                let n = line.len().min(max as usize - 1);
                let dst = ctx.memory.bytes_mut(buffer, n as u64 + 1)?;
                dst[..n].copy_from_slice(&line.as_bytes()[..n]);
                dst[n] = 0;
            }
            Value::make_bool(ok, ctx.memory, Region::Stack)
        }
        _ => Ok(Value::null()),
    }
}

pub fn return_info(function: u16) -> TypeInfo {
    match function {
        READ_TEXT_FILE => TypeInfo::new(TYPE_CHAR, 1),
        READ_BINARY_FILE => TypeInfo::new(TYPE_UINT8, 1),
        OPEN_FILE => TypeInfo::new(TYPE_UINT32, 0),
        CLOSE_FILE => TypeInfo::new(TYPE_VOID, 0),
        READ_LINE => TypeInfo::new(TYPE_BOOL, 0),
        _ => TypeInfo::new(TYPE_VOID, 0),
    }
}
