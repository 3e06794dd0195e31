// The flat byte stream.
//
// Opcodes are 16-bit, operands are little-endian and immediately follow
// their opcode. Forward jumps are written as zero and patched once the
// target is known.

use byteorder::{ByteOrder, LittleEndian};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum Op {
    /// prim:u8, value bytes sized by prim
    PushPrim,
    /// addr:u64 of pooled NUL-terminated bytes
    PushStr,
    /// slot:u16
    PushLocal,
    /// type:u16, plevel:u8
    PushNull,
    /// elem_size:u64, n_indices:u8, index_fn:u16 (+class:u16, casts when valid)
    PushIndexed,
    /// class:u16, offset:u64, type:u16, plevel:u8, ref:u8, array:u8
    PushStatic,
    /// type:u16, plevel:u8, offset:u64, ref:u8, array:u8
    PushMember,
    PushThis,

    PushScope,
    PopScope,
    /// start:u32, end:u32
    PushLoop,
    PopLoop,

    /// prim:u8, slot:u16
    DeclarePrim,
    /// type:u16, plevel:u8, slot:u16
    DeclarePointer,
    /// type:u16, elem_plevel:u8, n_dims:u8, n_inits:u32, slot:u16, dims:u32...
    DeclareArray,
    /// type:u16, fn:u16, slot:u16 (+casts)
    DeclareObject,
    /// type:u16, slot:u16, copy_fn:u16
    DeclareObjectAssign,
    /// slot:u16
    DeclareRef,

    /// each: op_fn:u16 (+1 cast when valid)
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

    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,

    /// op:u8, push:u8
    UnaryUpdate,
    Negate,
    Invert,

    AddressOf,
    Deref,
    /// type:u16, plevel:u8
    Cast,
    /// assign_fn:u16
    Set,

    Break,
    Continue,
    Breakpoint,

    /// module:u16, constant:u16
    ModuleConstant,
    /// module:u16, fn:u16, argc:u8, use_ret:u8
    ModuleCall,
    /// class:u16, fn:u16, use_ret:u8 (+casts)
    StaticCall,
    /// class:u16, fn:u16, use_ret:u8 (+casts)
    MemberCall,
    /// slot:u16, use_ret:u8 (+casts)
    VirtualCall,
    /// type:u16, fn:u16 (+casts)
    ConstructorCall,

    /// type:u16, fn:u16 (+casts)
    New,
    /// type:u16, elem_plevel:u8
    NewArray,
    Delete,
    DeleteArray,

    Strlen,
    /// tag:u8 (0 none, 1 by value, 2 by reference)
    Return,
    /// target:u32
    Jump,
    /// target:u32
    JumpIfFalse,
    End,
}

#[derive(Default)]
pub struct CodeBuf {
    pub bytes: Vec<u8>,
}

impl CodeBuf {
    pub fn new() -> CodeBuf {
        CodeBuf { bytes: Vec::new() }
    }

    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn write_op(&mut self, op: Op) {
        self.write_u16(op.into());
    }

    pub fn write_u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, v);
        self.bytes.extend_from_slice(&buf);
    }

    pub fn write_u32(&mut self, v: u32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, v);
        self.bytes.extend_from_slice(&buf);
    }

    pub fn write_u64(&mut self, v: u64) {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, v);
        self.bytes.extend_from_slice(&buf);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_u64(v as u64);
    }

    pub fn write_f32(&mut self, v: f32) {
        let mut buf = [0u8; 4];
        LittleEndian::write_f32(&mut buf, v);
        self.bytes.extend_from_slice(&buf);
    }

    pub fn write_f64(&mut self, v: f64) {
        let mut buf = [0u8; 8];
        LittleEndian::write_f64(&mut buf, v);
        self.bytes.extend_from_slice(&buf);
    }

    pub fn patch_u32(&mut self, pos: u32, v: u32) {
        LittleEndian::write_u32(&mut self.bytes[pos as usize..pos as usize + 4], v);
    }

    pub fn read_u8(&self, pc: &mut u32) -> u8 {
        let v = self.bytes[*pc as usize];
        *pc += 1;
        v
    }

    pub fn read_u16(&self, pc: &mut u32) -> u16 {
        let v = LittleEndian::read_u16(&self.bytes[*pc as usize..]);
        *pc += 2;
        v
    }

    pub fn read_u32(&self, pc: &mut u32) -> u32 {
        let v = LittleEndian::read_u32(&self.bytes[*pc as usize..]);
        *pc += 4;
        v
    }

    pub fn read_u64(&self, pc: &mut u32) -> u64 {
        let v = LittleEndian::read_u64(&self.bytes[*pc as usize..]);
        *pc += 8;
        v
    }

    pub fn read_i64(&self, pc: &mut u32) -> i64 {
        self.read_u64(pc) as i64
    }

    pub fn read_f32(&self, pc: &mut u32) -> f32 {
        let v = LittleEndian::read_f32(&self.bytes[*pc as usize..]);
        *pc += 4;
        v
    }

    pub fn read_f64(&self, pc: &mut u32) -> f64 {
        let v = LittleEndian::read_f64(&self.bytes[*pc as usize..]);
        *pc += 8;
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn opcode_round_trip() {
        let mut code = CodeBuf::new();
        code.write_op(Op::JumpIfFalse);
        code.write_u32(0);
        code.write_op(Op::End);

        let mut pc = 0;
        assert_eq!(Op::try_from(code.read_u16(&mut pc)).unwrap(), Op::JumpIfFalse);
        assert_eq!(code.read_u32(&mut pc), 0);
        assert_eq!(Op::try_from(code.read_u16(&mut pc)).unwrap(), Op::End);
        assert_eq!(pc, code.len());
    }

    #[test]
    fn patching_fixes_forward_jumps() {
        let mut code = CodeBuf::new();
        code.write_op(Op::Jump);
        let site = code.len();
        code.write_u32(0);
        code.write_op(Op::End);
        let target = code.len();
        code.patch_u32(site, target);

        let mut pc = 2;
        assert_eq!(code.read_u32(&mut pc), target);
    }

    #[test]
    fn operands_are_little_endian() {
        let mut code = CodeBuf::new();
        code.write_u16(0x1234);
        assert_eq!(code.bytes, vec![0x34, 0x12]);
        let mut code = CodeBuf::new();
        code.write_f64(1.5);
        let mut pc = 0;
        assert_eq!(code.read_f64(&mut pc), 1.5);
    }

    #[test]
    fn bad_opcode_is_detectable() {
        assert!(Op::try_from(0xFFFFu16).is_err());
    }
}
