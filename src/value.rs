// The universal runtime datum.
//
// A Value is a TypeInfo, two flags, and an address into one of the storage
// regions. Primitives store their bits at the address; pointers and
// references store the target address as a machine word; object payloads
// are preceded by a hidden class-id word used for virtual dispatch; array
// elements are preceded by an ArrayHeader.

use crate::class::{type_size, Class};
use crate::memory::{Addr, Memory, Region};
use crate::types::*;
use crate::vm::{Error, Result};

pub const MAX_ARRAY_DIMS: usize = 8;

/// Hidden word in front of every object payload, holding the payload's
/// dynamic class id.
pub const VTABLE_SLOT_SIZE: u64 = 8;

/// elem_pointer_level u8, num_dims u8, dims [u32; 8]
pub const ARRAY_HEADER_SIZE: u64 = 34;

#[derive(Clone, Debug, PartialEq)]
pub struct ArrayHeader {
    pub elem_pointer_level: u8,
    pub num_dims: u8,
    pub dims: [u32; MAX_ARRAY_DIMS],
}

impl ArrayHeader {
    pub fn element_count(&self) -> u64 {
        let mut n = 1u64;
        for i in 0..self.num_dims as usize {
            n *= self.dims[i] as u64;
        }
        n
    }

    /// The header sits immediately in front of the first element.
    pub fn read(mem: &Memory, elements: Addr) -> Result<ArrayHeader> {
        let base = elements.offset(-(ARRAY_HEADER_SIZE as i64));
        let mut header = ArrayHeader {
            elem_pointer_level: mem.read_u8(base)?,
            num_dims: mem.read_u8(base.offset(1))?,
            dims: [0; MAX_ARRAY_DIMS],
        };
        for i in 0..MAX_ARRAY_DIMS {
            header.dims[i] = mem.read_u32(base.offset(2 + 4 * i as i64))?;
        }
        Ok(header)
    }

    pub fn write(&self, mem: &mut Memory, elements: Addr) -> Result<()> {
        let base = elements.offset(-(ARRAY_HEADER_SIZE as i64));
        mem.write_u8(base, self.elem_pointer_level)?;
        mem.write_u8(base.offset(1), self.num_dims)?;
        for i in 0..MAX_ARRAY_DIMS {
            mem.write_u32(base.offset(2 + 4 * i as i64), self.dims[i])?;
        }
        Ok(())
    }
}

/// Stride between two elements of an array: pointers are one word,
/// object elements carry their hidden class-id word.
pub fn elem_stride(classes: &[Class], t: TypeId, pointer_level: u8) -> u64 {
    if pointer_level > 0 {
        8
    } else if is_primitive_type(t) {
        type_size(classes, t)
    } else {
        VTABLE_SLOT_SIZE + type_size(classes, t)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Value {
    pub type_id: TypeId,
    pub pointer_level: u8,
    pub is_array: bool,
    pub is_reference: bool,
    pub data: Addr,
}

macro_rules! make_prim {
    ($name:ident, $t:ty, $type_id:expr, $write:ident) => {
        pub fn $name(v: $t, mem: &mut Memory, region: Region) -> Result<Value> {
            let data = mem.alloc(region, std::mem::size_of::<$t>() as u64)?;
            mem.$write(data, v)?;
            Ok(Value {
                type_id: $type_id,
                pointer_level: 0,
                is_array: false,
                is_reference: false,
                data,
            })
        }
    };
}

macro_rules! arith {
    ($name:ident, $int_op:ident, $float_op:tt) => {
        pub fn $name(&self, rhs: &Value, mem: &mut Memory, region: Region) -> Result<Value> {
            if self.is_real() || rhs.is_real() {
                let result = self.get_f64(mem)? $float_op rhs.get_f64(mem)?;
                return if self.type_id == TYPE_REAL64 || rhs.type_id == TYPE_REAL64 {
                    Value::make_f64(result, mem, region)
                } else {
                    Value::make_f32(result as f32, mem, region)
                };
            }

            if self.is_integer() && rhs.is_integer() {
                let bits = bit_width(self.type_id).max(bit_width(rhs.type_id));
                let signed = is_signed_type(self.type_id) || is_signed_type(rhs.type_id);
                if signed {
                    let result = self.get_i64(mem)?.$int_op(rhs.get_i64(mem)?);
                    return match bits {
                        0..=8 => Value::make_i8(result as i8, mem, region),
                        9..=16 => Value::make_i16(result as i16, mem, region),
                        17..=32 => Value::make_i32(result as i32, mem, region),
                        _ => Value::make_i64(result, mem, region),
                    };
                } else {
                    let result = self.get_u64(mem)?.$int_op(rhs.get_u64(mem)?);
                    return match bits {
                        0..=8 => Value::make_u8(result as u8, mem, region),
                        9..=16 => Value::make_u16(result as u16, mem, region),
                        17..=32 => Value::make_u32(result as u32, mem, region),
                        _ => Value::make_u64(result, mem, region),
                    };
                }
            }

            Value::make_i64(self.get_i64(mem)?.$int_op(rhs.get_i64(mem)?), mem, region)
        }
    };
}

macro_rules! compare {
    ($name:ident, $op:tt) => {
        pub fn $name(&self, rhs: &Value, mem: &mut Memory, region: Region) -> Result<Value> {
            if self.is_integer() && rhs.is_integer() {
                let signed = is_signed_type(self.type_id) || is_signed_type(rhs.type_id);
                let result = if signed {
                    self.get_i64(mem)? $op rhs.get_i64(mem)?
                } else {
                    self.get_u64(mem)? $op rhs.get_u64(mem)?
                };
                return Value::make_bool(result, mem, region);
            }

            if self.is_real() || rhs.is_real() {
                let result = self.get_f64(mem)? $op rhs.get_f64(mem)?;
                return Value::make_bool(result, mem, region);
            }

            let result = self.get_i64(mem)? $op rhs.get_i64(mem)?;
            Value::make_bool(result, mem, region)
        }
    };
}

macro_rules! in_place {
    ($name:ident, $int_op:ident, $float_op:tt) => {
        pub fn $name(&self, amount: &Value, mem: &mut Memory) -> Result<()> {
            let target = self.storage(mem)?;
            match Primitive::from_type(self.type_id) {
                Some(Primitive::UInt8) => {
                    let v = mem.read_u8(target)?.$int_op(amount.get_u64(mem)? as u8);
                    mem.write_u8(target, v)?
                }
                Some(Primitive::UInt16) => {
                    let v = mem.read_u16(target)?.$int_op(amount.get_u64(mem)? as u16);
                    mem.write_u16(target, v)?
                }
                Some(Primitive::UInt32) => {
                    let v = mem.read_u32(target)?.$int_op(amount.get_u64(mem)? as u32);
                    mem.write_u32(target, v)?
                }
                Some(Primitive::UInt64) => {
                    let v = mem.read_u64(target)?.$int_op(amount.get_u64(mem)?);
                    mem.write_u64(target, v)?
                }
                Some(Primitive::Int8) | Some(Primitive::Char) => {
                    let v = (mem.read_u8(target)? as i8).$int_op(amount.get_i64(mem)? as i8);
                    mem.write_u8(target, v as u8)?
                }
                Some(Primitive::Int16) => {
                    let v = (mem.read_u16(target)? as i16).$int_op(amount.get_i64(mem)? as i16);
                    mem.write_u16(target, v as u16)?
                }
                Some(Primitive::Int32) => {
                    let v = (mem.read_u32(target)? as i32).$int_op(amount.get_i64(mem)? as i32);
                    mem.write_u32(target, v as u32)?
                }
                Some(Primitive::Int64) => {
                    let v = (mem.read_u64(target)? as i64).$int_op(amount.get_i64(mem)?);
                    mem.write_u64(target, v as u64)?
                }
                Some(Primitive::Real32) => {
                    let v = mem.read_f32(target)? $float_op amount.get_f64(mem)? as f32;
                    mem.write_f32(target, v)?
                }
                Some(Primitive::Real64) => {
                    let v = mem.read_f64(target)? $float_op amount.get_f64(mem)?;
                    mem.write_f64(target, v)?
                }
                _ => {}
            }
            Ok(())
        }
    };
}

impl Value {
    pub fn null() -> Value {
        Value::make_null(INVALID_ID, 0)
    }

    pub fn make_null(type_id: TypeId, pointer_level: u8) -> Value {
        Value {
            type_id,
            pointer_level,
            is_array: false,
            is_reference: false,
            data: Addr::NULL,
        }
    }

    make_prim!(make_u8, u8, TYPE_UINT8, write_u8);
    make_prim!(make_u16, u16, TYPE_UINT16, write_u16);
    make_prim!(make_u32, u32, TYPE_UINT32, write_u32);
    make_prim!(make_u64, u64, TYPE_UINT64, write_u64);
    make_prim!(make_f32, f32, TYPE_REAL32, write_f32);
    make_prim!(make_f64, f64, TYPE_REAL64, write_f64);

    pub fn make_i8(v: i8, mem: &mut Memory, region: Region) -> Result<Value> {
        let data = mem.alloc(region, 1)?;
        mem.write_u8(data, v as u8)?;
        Ok(Value { type_id: TYPE_INT8, pointer_level: 0, is_array: false, is_reference: false, data })
    }

    pub fn make_i16(v: i16, mem: &mut Memory, region: Region) -> Result<Value> {
        let data = mem.alloc(region, 2)?;
        mem.write_u16(data, v as u16)?;
        Ok(Value { type_id: TYPE_INT16, pointer_level: 0, is_array: false, is_reference: false, data })
    }

    pub fn make_i32(v: i32, mem: &mut Memory, region: Region) -> Result<Value> {
        let data = mem.alloc(region, 4)?;
        mem.write_u32(data, v as u32)?;
        Ok(Value { type_id: TYPE_INT32, pointer_level: 0, is_array: false, is_reference: false, data })
    }

    pub fn make_i64(v: i64, mem: &mut Memory, region: Region) -> Result<Value> {
        let data = mem.alloc(region, 8)?;
        mem.write_u64(data, v as u64)?;
        Ok(Value { type_id: TYPE_INT64, pointer_level: 0, is_array: false, is_reference: false, data })
    }

    pub fn make_bool(v: bool, mem: &mut Memory, region: Region) -> Result<Value> {
        let data = mem.alloc(region, 1)?;
        mem.write_u8(data, v as u8)?;
        Ok(Value { type_id: TYPE_BOOL, pointer_level: 0, is_array: false, is_reference: false, data })
    }

    pub fn make_char(v: u8, mem: &mut Memory, region: Region) -> Result<Value> {
        let data = mem.alloc(region, 1)?;
        mem.write_u8(data, v)?;
        Ok(Value { type_id: TYPE_CHAR, pointer_level: 0, is_array: false, is_reference: false, data })
    }

    /// A `char*` whose bytes live at `text`.
    pub fn make_cstr(text: Addr, mem: &mut Memory, region: Region) -> Result<Value> {
        Value::make_pointer(TYPE_CHAR, 1, text, mem, region)
    }

    /// A pointer cell holding `target`.
    pub fn make_pointer(
        type_id: TypeId,
        pointer_level: u8,
        target: Addr,
        mem: &mut Memory,
        region: Region,
    ) -> Result<Value> {
        let data = mem.alloc(region, 8)?;
        mem.write_addr(data, target)?;
        Ok(Value {
            type_id,
            pointer_level,
            is_array: false,
            is_reference: false,
            data,
        })
    }

    /// A reference aliasing the storage of `v` (collapsing references).
    pub fn make_reference(v: &Value, mem: &mut Memory, region: Region) -> Result<Value> {
        let target = if v.is_reference { mem.read_addr(v.data)? } else { v.data };
        let data = mem.alloc(region, 8)?;
        mem.write_addr(data, target)?;
        Ok(Value {
            type_id: v.type_id,
            pointer_level: v.pointer_level,
            is_array: false,
            is_reference: true,
            data,
        })
    }

    pub fn is_integer(&self) -> bool {
        is_integer_type(self.type_id)
    }

    pub fn is_real(&self) -> bool {
        is_real_type(self.type_id)
    }

    pub fn is_pointer(&self) -> bool {
        self.pointer_level > 0
    }

    pub fn is_primitive(&self) -> bool {
        is_primitive_type(self.type_id)
    }

    pub fn type_info(&self) -> TypeInfo {
        TypeInfo::new(self.type_id, self.pointer_level)
    }

    /// The address actually read/written: references indirect once.
    fn storage(&self, mem: &Memory) -> Result<Addr> {
        if self.is_reference {
            Ok(mem.read_addr(self.data)?)
        } else {
            Ok(self.data)
        }
    }

    pub fn get_i64(&self, mem: &Memory) -> Result<i64> {
        let a = self.storage(mem)?;
        Ok(match Primitive::from_type(self.type_id) {
            Some(Primitive::UInt8) => mem.read_u8(a)? as i64,
            Some(Primitive::UInt16) => mem.read_u16(a)? as i64,
            Some(Primitive::UInt32) => mem.read_u32(a)? as i64,
            Some(Primitive::UInt64) => mem.read_u64(a)? as i64,
            Some(Primitive::Int8) => mem.read_u8(a)? as i8 as i64,
            Some(Primitive::Int16) => mem.read_u16(a)? as i16 as i64,
            Some(Primitive::Int32) => mem.read_u32(a)? as i32 as i64,
            Some(Primitive::Int64) => mem.read_u64(a)? as i64,
            Some(Primitive::Real32) => mem.read_f32(a)? as i64,
            Some(Primitive::Real64) => mem.read_f64(a)? as i64,
            Some(Primitive::Bool) => mem.read_u8(a)? as i64,
            Some(Primitive::Char) => mem.read_u8(a)? as i8 as i64,
            _ => 0,
        })
    }

    pub fn get_u64(&self, mem: &Memory) -> Result<u64> {
        let a = self.storage(mem)?;
        Ok(match Primitive::from_type(self.type_id) {
            Some(Primitive::UInt8) => mem.read_u8(a)? as u64,
            Some(Primitive::UInt16) => mem.read_u16(a)? as u64,
            Some(Primitive::UInt32) => mem.read_u32(a)? as u64,
            Some(Primitive::UInt64) => mem.read_u64(a)?,
            Some(Primitive::Real32) => mem.read_f32(a)? as u64,
            Some(Primitive::Real64) => mem.read_f64(a)? as u64,
            _ => self.get_i64(mem)? as u64,
        })
    }

    pub fn get_f64(&self, mem: &Memory) -> Result<f64> {
        let a = self.storage(mem)?;
        Ok(match Primitive::from_type(self.type_id) {
            Some(Primitive::Real32) => mem.read_f32(a)? as f64,
            Some(Primitive::Real64) => mem.read_f64(a)?,
            Some(Primitive::UInt8) | Some(Primitive::UInt16) | Some(Primitive::UInt32)
            | Some(Primitive::UInt64) => self.get_u64(mem)? as f64,
            _ => self.get_i64(mem)? as f64,
        })
    }

    pub fn get_bool(&self, mem: &Memory) -> Result<bool> {
        Ok(match Primitive::from_type(self.type_id) {
            Some(Primitive::Real32) | Some(Primitive::Real64) => self.get_f64(mem)? != 0.0,
            _ => self.get_i64(mem)? != 0,
        })
    }

    pub fn get_char(&self, mem: &Memory) -> Result<u8> {
        Ok(self.get_i64(mem)? as u8)
    }

    /// The word a pointer-shaped value holds; null data reads as 0.
    pub fn pointer_word(&self, mem: &Memory) -> Result<u64> {
        if self.data.is_null() {
            return Ok(0);
        }
        let a = self.storage(mem)?;
        Ok(mem.read_u64(a)?)
    }

    arith!(add, wrapping_add, +);
    arith!(sub, wrapping_sub, -);
    arith!(mul, wrapping_mul, *);

    pub fn div(&self, rhs: &Value, mem: &mut Memory, region: Region) -> Result<Value> {
        if self.is_real() || rhs.is_real() {
            let result = self.get_f64(mem)? / rhs.get_f64(mem)?;
            return if self.type_id == TYPE_REAL64 || rhs.type_id == TYPE_REAL64 {
                Value::make_f64(result, mem, region)
            } else {
                Value::make_f32(result as f32, mem, region)
            };
        }

        if rhs.get_i64(mem)? == 0 {
            return Err(Error::DivideByZero);
        }

        if self.is_integer() && rhs.is_integer() {
            let bits = bit_width(self.type_id).max(bit_width(rhs.type_id));
            let signed = is_signed_type(self.type_id) || is_signed_type(rhs.type_id);
            if signed {
                let result = self.get_i64(mem)?.wrapping_div(rhs.get_i64(mem)?);
                return match bits {
                    0..=8 => Value::make_i8(result as i8, mem, region),
                    9..=16 => Value::make_i16(result as i16, mem, region),
                    17..=32 => Value::make_i32(result as i32, mem, region),
                    _ => Value::make_i64(result, mem, region),
                };
            } else {
                let result = self.get_u64(mem)? / rhs.get_u64(mem)?;
                return match bits {
                    0..=8 => Value::make_u8(result as u8, mem, region),
                    9..=16 => Value::make_u16(result as u16, mem, region),
                    17..=32 => Value::make_u32(result as u32, mem, region),
                    _ => Value::make_u64(result, mem, region),
                };
            }
        }

        Value::make_i64(self.get_i64(mem)?.wrapping_div(rhs.get_i64(mem)?), mem, region)
    }

    pub fn modulo(&self, rhs: &Value, mem: &mut Memory, region: Region) -> Result<Value> {
        if self.is_real() || rhs.is_real() {
            let result = self.get_f64(mem)? % rhs.get_f64(mem)?;
            return if self.type_id == TYPE_REAL64 || rhs.type_id == TYPE_REAL64 {
                Value::make_f64(result, mem, region)
            } else {
                Value::make_f32(result as f32, mem, region)
            };
        }

        if rhs.get_i64(mem)? == 0 {
            return Err(Error::DivideByZero);
        }

        let bits = bit_width(self.type_id).max(bit_width(rhs.type_id));
        let signed = is_signed_type(self.type_id) || is_signed_type(rhs.type_id);
        if signed {
            let result = self.get_i64(mem)?.wrapping_rem(rhs.get_i64(mem)?);
            match bits {
                0..=8 => Value::make_i8(result as i8, mem, region),
                9..=16 => Value::make_i16(result as i16, mem, region),
                17..=32 => Value::make_i32(result as i32, mem, region),
                _ => Value::make_i64(result, mem, region),
            }
        } else {
            let result = self.get_u64(mem)? % rhs.get_u64(mem)?;
            match bits {
                0..=8 => Value::make_u8(result as u8, mem, region),
                9..=16 => Value::make_u16(result as u16, mem, region),
                17..=32 => Value::make_u32(result as u32, mem, region),
                _ => Value::make_u64(result, mem, region),
            }
        }
    }

    compare!(less, <);
    compare!(greater, >);
    compare!(less_eq, <=);
    compare!(greater_eq, >=);

    pub fn equals(&self, rhs: &Value, mem: &mut Memory, region: Region) -> Result<Value> {
        if self.is_pointer() || rhs.is_pointer() {
            if self.is_pointer() && rhs.is_pointer() && self.pointer_level != rhs.pointer_level {
                return Value::make_bool(false, mem, region);
            }
            let result = self.pointer_word(mem)? == rhs.pointer_word(mem)?;
            return Value::make_bool(result, mem, region);
        }

        if self.is_integer() && rhs.is_integer() {
            let signed = is_signed_type(self.type_id) || is_signed_type(rhs.type_id);
            let result = if signed {
                self.get_i64(mem)? == rhs.get_i64(mem)?
            } else {
                self.get_u64(mem)? == rhs.get_u64(mem)?
            };
            return Value::make_bool(result, mem, region);
        }

        if self.is_real() || rhs.is_real() {
            let result = self.get_f64(mem)? == rhs.get_f64(mem)?;
            return Value::make_bool(result, mem, region);
        }

        let result = self.get_i64(mem)? == rhs.get_i64(mem)?;
        Value::make_bool(result, mem, region)
    }

    pub fn not_equals(&self, rhs: &Value, mem: &mut Memory, region: Region) -> Result<Value> {
        let eq = self.equals(rhs, mem, region)?;
        let flipped = !eq.get_bool(mem)?;
        Value::make_bool(flipped, mem, region)
    }

    pub fn bit_and(&self, rhs: &Value, mem: &mut Memory, region: Region) -> Result<Value> {
        self.bitwise(rhs, mem, region, |a, b| a & b)
    }

    pub fn bit_or(&self, rhs: &Value, mem: &mut Memory, region: Region) -> Result<Value> {
        self.bitwise(rhs, mem, region, |a, b| a | b)
    }

    pub fn shift_left(&self, rhs: &Value, mem: &mut Memory, region: Region) -> Result<Value> {
        let by = rhs.get_u64(mem)? as u32 & 63;
        let v = self.get_u64(mem)?.wrapping_shl(by);
        self.rebuild_integer(v, mem, region)
    }

    pub fn shift_right(&self, rhs: &Value, mem: &mut Memory, region: Region) -> Result<Value> {
        let by = rhs.get_u64(mem)? as u32 & 63;
        if is_signed_type(self.type_id) {
            let v = self.get_i64(mem)?.wrapping_shr(by);
            self.rebuild_integer(v as u64, mem, region)
        } else {
            let v = self.get_u64(mem)?.wrapping_shr(by);
            self.rebuild_integer(v, mem, region)
        }
    }

    fn bitwise(
        &self,
        rhs: &Value,
        mem: &mut Memory,
        region: Region,
        op: fn(u64, u64) -> u64,
    ) -> Result<Value> {
        let bits = bit_width(self.type_id).max(bit_width(rhs.type_id));
        let signed = is_signed_type(self.type_id) || is_signed_type(rhs.type_id);
        let v = op(self.get_u64(mem)?, rhs.get_u64(mem)?);
        match (signed, bits) {
            (true, 0..=8) => Value::make_i8(v as i8, mem, region),
            (true, 9..=16) => Value::make_i16(v as i16, mem, region),
            (true, 17..=32) => Value::make_i32(v as i32, mem, region),
            (true, _) => Value::make_i64(v as i64, mem, region),
            (false, 0..=8) => Value::make_u8(v as u8, mem, region),
            (false, 9..=16) => Value::make_u16(v as u16, mem, region),
            (false, 17..=32) => Value::make_u32(v as u32, mem, region),
            (false, _) => Value::make_u64(v, mem, region),
        }
    }

    /// Result of a shift keeps the left operand's type.
    fn rebuild_integer(&self, v: u64, mem: &mut Memory, region: Region) -> Result<Value> {
        match Primitive::from_type(self.type_id) {
            Some(Primitive::UInt8) => Value::make_u8(v as u8, mem, region),
            Some(Primitive::UInt16) => Value::make_u16(v as u16, mem, region),
            Some(Primitive::UInt32) => Value::make_u32(v as u32, mem, region),
            Some(Primitive::UInt64) => Value::make_u64(v, mem, region),
            Some(Primitive::Int8) => Value::make_i8(v as i8, mem, region),
            Some(Primitive::Int16) => Value::make_i16(v as i16, mem, region),
            Some(Primitive::Int32) => Value::make_i32(v as i32, mem, region),
            _ => Value::make_i64(v as i64, mem, region),
        }
    }

    pub fn logical_and(&self, rhs: &Value, mem: &mut Memory, region: Region) -> Result<Value> {
        let result = self.get_bool(mem)? && rhs.get_bool(mem)?;
        Value::make_bool(result, mem, region)
    }

    pub fn logical_or(&self, rhs: &Value, mem: &mut Memory, region: Region) -> Result<Value> {
        let result = self.get_bool(mem)? || rhs.get_bool(mem)?;
        Value::make_bool(result, mem, region)
    }

    in_place!(plus_equals, wrapping_add, +);
    in_place!(minus_equals, wrapping_sub, -);
    in_place!(times_equals, wrapping_mul, *);

    pub fn divide_equals(&self, amount: &Value, mem: &mut Memory) -> Result<()> {
        if !self.is_real() && amount.get_i64(mem)? == 0 {
            return Err(Error::DivideByZero);
        }
        self.div_mod_in_place(amount, mem, false)
    }

    pub fn mod_equals(&self, amount: &Value, mem: &mut Memory) -> Result<()> {
        if !self.is_real() && amount.get_i64(mem)? == 0 {
            return Err(Error::DivideByZero);
        }
        self.div_mod_in_place(amount, mem, true)
    }

    fn div_mod_in_place(&self, amount: &Value, mem: &mut Memory, rem: bool) -> Result<()> {
        let target = self.storage(mem)?;
        macro_rules! lane {
            ($read:ident, $write:ident, $get:ident, $t:ty) => {{
                let cur = mem.$read(target)? as $t;
                let amt = amount.$get(mem)? as $t;
                let v = if rem { cur.wrapping_rem(amt) } else { cur.wrapping_div(amt) };
                mem.$write(target, v as _)?;
            }};
        }
        match Primitive::from_type(self.type_id) {
            Some(Primitive::UInt8) => lane!(read_u8, write_u8, get_u64, u8),
            Some(Primitive::UInt16) => lane!(read_u16, write_u16, get_u64, u16),
            Some(Primitive::UInt32) => lane!(read_u32, write_u32, get_u64, u32),
            Some(Primitive::UInt64) => lane!(read_u64, write_u64, get_u64, u64),
            Some(Primitive::Int8) | Some(Primitive::Char) => {
                let cur = mem.read_u8(target)? as i8;
                let amt = amount.get_i64(mem)? as i8;
                let v = if rem { cur.wrapping_rem(amt) } else { cur.wrapping_div(amt) };
                mem.write_u8(target, v as u8)?;
            }
            Some(Primitive::Int16) => {
                let cur = mem.read_u16(target)? as i16;
                let amt = amount.get_i64(mem)? as i16;
                let v = if rem { cur.wrapping_rem(amt) } else { cur.wrapping_div(amt) };
                mem.write_u16(target, v as u16)?;
            }
            Some(Primitive::Int32) => {
                let cur = mem.read_u32(target)? as i32;
                let amt = amount.get_i64(mem)? as i32;
                let v = if rem { cur.wrapping_rem(amt) } else { cur.wrapping_div(amt) };
                mem.write_u32(target, v as u32)?;
            }
            Some(Primitive::Int64) => {
                let cur = mem.read_u64(target)? as i64;
                let amt = amount.get_i64(mem)?;
                let v = if rem { cur.wrapping_rem(amt) } else { cur.wrapping_div(amt) };
                mem.write_u64(target, v as u64)?;
            }
            Some(Primitive::Real32) => {
                let cur = mem.read_f32(target)?;
                let amt = amount.get_f64(mem)? as f32;
                let v = if rem { cur % amt } else { cur / amt };
                mem.write_f32(target, v)?;
            }
            Some(Primitive::Real64) => {
                let cur = mem.read_f64(target)?;
                let amt = amount.get_f64(mem)?;
                let v = if rem { cur % amt } else { cur / amt };
                mem.write_f64(target, v)?;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn increment(&self, mem: &mut Memory) -> Result<()> {
        self.step(mem, 1)
    }

    pub fn decrement(&self, mem: &mut Memory) -> Result<()> {
        self.step(mem, -1)
    }

    fn step(&self, mem: &mut Memory, delta: i64) -> Result<()> {
        let target = self.storage(mem)?;
        match Primitive::from_type(self.type_id) {
            Some(Primitive::UInt8) | Some(Primitive::Int8) | Some(Primitive::Char) => {
                let v = mem.read_u8(target)?.wrapping_add(delta as u8);
                mem.write_u8(target, v)?;
            }
            Some(Primitive::UInt16) | Some(Primitive::Int16) => {
                let v = mem.read_u16(target)?.wrapping_add(delta as u16);
                mem.write_u16(target, v)?;
            }
            Some(Primitive::UInt32) | Some(Primitive::Int32) => {
                let v = mem.read_u32(target)?.wrapping_add(delta as u32);
                mem.write_u32(target, v)?;
            }
            Some(Primitive::UInt64) | Some(Primitive::Int64) => {
                let v = mem.read_u64(target)?.wrapping_add(delta as u64);
                mem.write_u64(target, v)?;
            }
            Some(Primitive::Real32) => {
                let v = mem.read_f32(target)? + delta as f32;
                mem.write_f32(target, v)?;
            }
            Some(Primitive::Real64) => {
                let v = mem.read_f64(target)? + delta as f64;
                mem.write_f64(target, v)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Logical not; any primitive is truthy when non-zero.
    pub fn invert(&self, mem: &mut Memory, region: Region) -> Result<Value> {
        let v = !self.get_bool(mem)?;
        Value::make_bool(v, mem, region)
    }

    pub fn negate(&self, mem: &mut Memory, region: Region) -> Result<Value> {
        match Primitive::from_type(self.type_id) {
            Some(Primitive::Real32) => Value::make_f32(-(self.get_f64(mem)? as f32), mem, region),
            Some(Primitive::Real64) => Value::make_f64(-self.get_f64(mem)?, mem, region),
            Some(Primitive::UInt8) => Value::make_u8((self.get_u64(mem)? as u8).wrapping_neg(), mem, region),
            Some(Primitive::UInt16) => Value::make_u16((self.get_u64(mem)? as u16).wrapping_neg(), mem, region),
            Some(Primitive::UInt32) => Value::make_u32((self.get_u64(mem)? as u32).wrapping_neg(), mem, region),
            Some(Primitive::UInt64) => Value::make_u64(self.get_u64(mem)?.wrapping_neg(), mem, region),
            Some(Primitive::Int8) => Value::make_i8((self.get_i64(mem)? as i8).wrapping_neg(), mem, region),
            Some(Primitive::Int16) => Value::make_i16((self.get_i64(mem)? as i16).wrapping_neg(), mem, region),
            Some(Primitive::Int32) => Value::make_i32((self.get_i64(mem)? as i32).wrapping_neg(), mem, region),
            Some(Primitive::Int64) => Value::make_i64(self.get_i64(mem)?.wrapping_neg(), mem, region),
            Some(Primitive::Char) => Value::make_char((self.get_char(mem)? as i8).wrapping_neg() as u8, mem, region),
            Some(Primitive::Bool) => Value::make_bool(!self.get_bool(mem)?, mem, region),
            _ => Ok(Value::null()),
        }
    }

    /// Copy the backing bytes into a fresh allocation in `region`.
    /// Pointers and references copy the word, primitives copy their lane,
    /// objects copy the hidden class-id word plus the payload.
    pub fn clone_into(
        &self,
        classes: &[Class],
        mem: &mut Memory,
        region: Region,
    ) -> Result<Value> {
        let mut out = *self;
        if self.data.is_null() {
            // typed null pointers stay null
            return Ok(out);
        }
        if self.is_reference || self.is_pointer() {
            out.data = mem.alloc(region, 8)?;
            let word = mem.read_u64(self.data)?;
            mem.write_u64(out.data, word)?;
        } else if self.is_primitive() {
            let size = type_size(classes, self.type_id);
            out.data = mem.alloc(region, size)?;
            mem.copy(out.data, self.data, size)?;
        } else {
            let size = type_size(classes, self.type_id);
            let base = mem.alloc(region, VTABLE_SLOT_SIZE + size)?;
            out.data = base.offset(VTABLE_SLOT_SIZE as i64);
            let word = mem.read_u64(self.data.offset(-(VTABLE_SLOT_SIZE as i64)))?;
            mem.write_u64(base, word)?;
            mem.copy(out.data, self.data, size)?;
        }
        Ok(out)
    }

    /// Convert to `(new_type, pointer_level)`. Primitive lanes convert
    /// C-style, pointer casts rebadge the word, object casts copy the
    /// base-class prefix of the payload.
    pub fn cast_to(
        &self,
        classes: &[Class],
        new_type: TypeId,
        pointer_level: u8,
        mem: &mut Memory,
        region: Region,
    ) -> Result<Value> {
        let mut out = Value {
            type_id: new_type,
            pointer_level,
            is_array: false,
            is_reference: false,
            data: Addr::NULL,
        };

        if self.is_pointer() {
            out.data = mem.alloc(region, 8)?;
            let word = self.pointer_word(mem)?;
            mem.write_u64(out.data, word)?;
            return Ok(out);
        }

        match Primitive::from_type(new_type) {
            Some(Primitive::UInt8) => return Value::make_u8(self.get_u64(mem)? as u8, mem, region),
            Some(Primitive::UInt16) => return Value::make_u16(self.get_u64(mem)? as u16, mem, region),
            Some(Primitive::UInt32) => return Value::make_u32(self.get_u64(mem)? as u32, mem, region),
            Some(Primitive::UInt64) => return Value::make_u64(self.get_u64(mem)?, mem, region),
            Some(Primitive::Int8) => return Value::make_i8(self.get_i64(mem)? as i8, mem, region),
            Some(Primitive::Int16) => return Value::make_i16(self.get_i64(mem)? as i16, mem, region),
            Some(Primitive::Int32) => return Value::make_i32(self.get_i64(mem)? as i32, mem, region),
            Some(Primitive::Int64) => return Value::make_i64(self.get_i64(mem)?, mem, region),
            Some(Primitive::Real32) => return Value::make_f32(self.get_f64(mem)? as f32, mem, region),
            Some(Primitive::Real64) => return Value::make_f64(self.get_f64(mem)?, mem, region),
            Some(Primitive::Bool) => return Value::make_bool(self.get_bool(mem)?, mem, region),
            Some(Primitive::Char) => return Value::make_char(self.get_char(mem)?, mem, region),
            _ => {}
        }

        // object-to-object: copy the target type's payload prefix
        let size = type_size(classes, new_type);
        let base = mem.alloc(region, VTABLE_SLOT_SIZE + size)?;
        out.data = base.offset(VTABLE_SLOT_SIZE as i64);
        mem.write_u64(base, new_type as u64)?;
        let src = self.storage(mem)?;
        mem.copy(out.data, src, size)?;
        Ok(out)
    }

    /// Write `source` into this value's storage. Primitive lanes write the
    /// lane, pointer lanes write the word, object lanes copy `size` bytes.
    pub fn assign(&self, source: &Value, size: u64, mem: &mut Memory) -> Result<()> {
        let target = self.storage(mem)?;
        let source = source.actual(mem)?;

        if !self.is_reference && self.is_pointer() && source.is_pointer() {
            if self.pointer_level != source.pointer_level || self.type_id != source.type_id {
                return Ok(());
            }
            let word = source.pointer_word(mem)?;
            mem.write_u64(target, word)?;
            return Ok(());
        }

        if self.is_pointer() {
            let word = source.pointer_word(mem)?;
            mem.write_u64(target, word)?;
            return Ok(());
        }

        match Primitive::from_type(self.type_id) {
            Some(Primitive::UInt8) => mem.write_u8(target, source.get_u64(mem)? as u8)?,
            Some(Primitive::UInt16) => mem.write_u16(target, source.get_u64(mem)? as u16)?,
            Some(Primitive::UInt32) => mem.write_u32(target, source.get_u64(mem)? as u32)?,
            Some(Primitive::UInt64) => mem.write_u64(target, source.get_u64(mem)?)?,
            Some(Primitive::Int8) => mem.write_u8(target, source.get_i64(mem)? as u8)?,
            Some(Primitive::Int16) => mem.write_u16(target, source.get_i64(mem)? as u16)?,
            Some(Primitive::Int32) => mem.write_u32(target, source.get_i64(mem)? as u32)?,
            Some(Primitive::Int64) => mem.write_u64(target, source.get_i64(mem)? as u64)?,
            Some(Primitive::Real32) => mem.write_f32(target, source.get_f64(mem)? as f32)?,
            Some(Primitive::Real64) => mem.write_f64(target, source.get_f64(mem)?)?,
            Some(Primitive::Bool) => mem.write_u8(target, source.get_bool(mem)? as u8)?,
            Some(Primitive::Char) => mem.write_u8(target, source.get_char(mem)?)?,
            _ => {
                if self.type_id != source.type_id {
                    return Ok(());
                }
                mem.copy(target, source.data, size)?;
            }
        }
        Ok(())
    }

    /// Follow a pointer one level.
    pub fn dereference(&self, mem: &Memory) -> Result<Value> {
        Ok(Value {
            type_id: self.type_id,
            pointer_level: self.pointer_level - 1,
            is_array: self.is_array,
            is_reference: false,
            data: Addr(self.pointer_word(mem)?),
        })
    }

    /// Collapse a reference for reads.
    pub fn actual(&self, mem: &Memory) -> Result<Value> {
        if !self.is_reference {
            return Ok(*self);
        }
        Ok(Value {
            type_id: self.type_id,
            pointer_level: self.pointer_level,
            is_array: false,
            is_reference: false,
            data: mem.read_addr(self.data)?,
        })
    }

    /// Row-major flattening of an n-dimensional index against this array's
    /// header.
    pub fn linear_index(&self, mem: &Memory, indices: &[u32]) -> Result<u64> {
        let header = ArrayHeader::read(mem, self.data)?;
        let mut index = 0u64;
        let mut stride = 1u64;
        for i in (0..header.num_dims as usize).rev() {
            index += indices[i] as u64 * stride;
            stride *= header.dims[i] as u64;
        }
        Ok(index)
    }

    /// Allocate and zero a class instance: hidden class-id word, payload,
    /// array headers and nested object words for every interior field.
    pub fn make_object(
        classes: &[Class],
        type_id: TypeId,
        mem: &mut Memory,
        region: Region,
    ) -> Result<Value> {
        let size = type_size(classes, type_id);
        let base = mem.alloc(region, VTABLE_SLOT_SIZE + size)?;
        mem.write_u64(base, type_id as u64)?;
        let payload = base.offset(VTABLE_SLOT_SIZE as i64);
        mem.fill(payload, 0, size)?;
        init_interior(classes, type_id, payload, mem)?;
        Ok(Value {
            type_id,
            pointer_level: 0,
            is_array: false,
            is_reference: false,
            data: payload,
        })
    }

    /// Allocate an array: header, then elements; object elements each get
    /// their hidden class-id word and interior headers.
    pub fn make_array(
        classes: &[Class],
        elem_type: TypeId,
        elem_pointer_level: u8,
        dims: &[u32],
        mem: &mut Memory,
        region: Region,
    ) -> Result<Value> {
        let mut header = ArrayHeader {
            elem_pointer_level,
            num_dims: dims.len() as u8,
            dims: [0; MAX_ARRAY_DIMS],
        };
        let mut count = 1u64;
        for (i, &d) in dims.iter().enumerate() {
            header.dims[i] = d;
            count *= d as u64;
        }

        let stride = elem_stride(classes, elem_type, elem_pointer_level);
        let base = mem.alloc(region, ARRAY_HEADER_SIZE + stride * count)?;
        mem.fill(base, 0, ARRAY_HEADER_SIZE + stride * count)?;
        let elements = base.offset(ARRAY_HEADER_SIZE as i64);
        header.write(mem, elements)?;

        if elem_pointer_level == 0 && !is_primitive_type(elem_type) {
            for i in 0..count {
                let slot = elements.offset((i * stride) as i64);
                mem.write_u64(slot, elem_type as u64)?;
                init_interior(classes, elem_type, slot.offset(VTABLE_SLOT_SIZE as i64), mem)?;
            }
        }

        Ok(Value {
            type_id: elem_type,
            pointer_level: 1 + elem_pointer_level,
            is_array: true,
            is_reference: false,
            data: elements,
        })
    }
}

/// Walk a zeroed payload and stamp array headers plus hidden class-id words
/// for every interior object, recursing through the base chain and nested
/// classes.
pub fn init_interior(classes: &[Class], type_id: TypeId, payload: Addr, mem: &mut Memory) -> Result<()> {
    if !is_class_type(type_id) {
        return Ok(());
    }
    let mut current = Some(type_id);
    while let Some(cls_id) = current {
        let cls = &classes[(cls_id - FIRST_CLASS_TYPE) as usize];
        for fi in 0..cls.member_fields.len() {
            let field = &cls.member_fields[fi];
            let ftype = field.type_info.type_id;
            let fplevel = field.type_info.pointer_level;
            if !field.dims.is_empty() {
                let elem_plevel = fplevel - 1;
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
                let elements = payload.offset(field.offset as i64);
                header.write(mem, elements)?;
                if elem_plevel == 0 && !is_primitive_type(ftype) {
                    let stride = elem_stride(classes, ftype, 0);
                    for i in 0..count {
                        let slot = elements.offset((i * stride) as i64);
                        mem.write_u64(slot, ftype as u64)?;
                        init_interior(classes, ftype, slot.offset(VTABLE_SLOT_SIZE as i64), mem)?;
                    }
                }
            } else if fplevel == 0 && !is_primitive_type(ftype) {
                let member = payload.offset(field.offset as i64);
                mem.write_u64(member.offset(-(VTABLE_SLOT_SIZE as i64)), ftype as u64)?;
                init_interior(classes, ftype, member, mem)?;
            }
        }
        current = cls.base;
    }
    Ok(())
}

/// Render a value the way IO.Print does: `char*` as the pooled C string,
/// int8 as a number, bool as true/false.
pub fn format_value(v: &Value, mem: &Memory) -> Result<String> {
    let v = v.actual(mem)?;
    if v.type_id == TYPE_CHAR && v.pointer_level == 1 {
        return Ok(mem.read_cstr(Addr(v.pointer_word(mem)?))?);
    }
    if v.is_pointer() {
        return Ok(format!("{:#x}", v.pointer_word(mem)?));
    }
    Ok(match Primitive::from_type(v.type_id) {
        Some(Primitive::Bool) => if v.get_bool(mem)? { "true".into() } else { "false".into() },
        Some(Primitive::Char) => (v.get_char(mem)? as char).to_string(),
        Some(Primitive::Real32) => format!("{}", v.get_f64(mem)? as f32),
        Some(Primitive::Real64) => format!("{}", v.get_f64(mem)?),
        Some(Primitive::UInt8) | Some(Primitive::UInt16) | Some(Primitive::UInt32)
        | Some(Primitive::UInt64) => format!("{}", v.get_u64(mem)?),
        Some(_) => format!("{}", v.get_i64(mem)?),
        None => String::from("<object>"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn mem() -> Memory {
        Memory::new(&Settings::default())
    }

    const S: Region = Region::Stack;

    #[test]
    fn widening_reads() {
        let mut m = mem();
        let v = Value::make_i8(-5, &mut m, S).unwrap();
        assert_eq!(v.get_i64(&m).unwrap(), -5);
        assert_eq!(v.get_f64(&m).unwrap(), -5.0);
        assert!(v.get_bool(&m).unwrap());

        let v = Value::make_u16(40_000, &mut m, S).unwrap();
        assert_eq!(v.get_u64(&m).unwrap(), 40_000);
        assert_eq!(v.get_i64(&m).unwrap(), 40_000);

        let v = Value::make_f32(2.75, &mut m, S).unwrap();
        assert_eq!(v.get_i64(&m).unwrap(), 2);
    }

    #[test]
    fn promotion_width_and_sign() {
        let mut m = mem();
        let a = Value::make_i8(100, &mut m, S).unwrap();
        let b = Value::make_i8(100, &mut m, S).unwrap();
        let sum = a.add(&b, &mut m, S).unwrap();
        // 8-bit signed result wraps
        assert_eq!(sum.type_id, TYPE_INT8);
        assert_eq!(sum.get_i64(&m).unwrap(), (100i8).wrapping_add(100) as i64);

        let a = Value::make_u8(200, &mut m, S).unwrap();
        let b = Value::make_i32(100, &mut m, S).unwrap();
        let sum = a.add(&b, &mut m, S).unwrap();
        // signed dominates, width is max
        assert_eq!(sum.type_id, TYPE_INT32);
        assert_eq!(sum.get_i64(&m).unwrap(), 300);

        let a = Value::make_i32(1, &mut m, S).unwrap();
        let b = Value::make_f64(0.5, &mut m, S).unwrap();
        let sum = a.add(&b, &mut m, S).unwrap();
        // real dominates integer
        assert_eq!(sum.type_id, TYPE_REAL64);
        assert_eq!(sum.get_f64(&m).unwrap(), 1.5);

        let a = Value::make_f32(1.0, &mut m, S).unwrap();
        let b = Value::make_f32(0.25, &mut m, S).unwrap();
        assert_eq!(a.add(&b, &mut m, S).unwrap().type_id, TYPE_REAL32);
    }

    #[test]
    fn unsigned_comparison() {
        let mut m = mem();
        let a = Value::make_u64(u64::MAX, &mut m, S).unwrap();
        let b = Value::make_u64(1, &mut m, S).unwrap();
        assert!(a.greater(&b, &mut m, S).unwrap().get_bool(&m).unwrap());
        let a = Value::make_i32(-1, &mut m, S).unwrap();
        let b = Value::make_i32(1, &mut m, S).unwrap();
        assert!(a.less(&b, &mut m, S).unwrap().get_bool(&m).unwrap());
    }

    #[test]
    fn divide_by_zero_is_an_error() {
        let mut m = mem();
        let a = Value::make_i32(10, &mut m, S).unwrap();
        let b = Value::make_i32(0, &mut m, S).unwrap();
        assert!(matches!(a.div(&b, &mut m, S), Err(Error::DivideByZero)));
        assert!(matches!(a.modulo(&b, &mut m, S), Err(Error::DivideByZero)));
    }

    #[test]
    fn reference_reads_and_writes_indirect() {
        let mut m = mem();
        let v = Value::make_i32(7, &mut m, S).unwrap();
        let r = Value::make_reference(&v, &mut m, S).unwrap();
        assert!(r.is_reference);
        assert_eq!(r.get_i64(&m).unwrap(), 7);

        let forty = Value::make_i32(40, &mut m, S).unwrap();
        r.assign(&forty, 4, &mut m).unwrap();
        // writing through the reference hit the referent
        assert_eq!(v.get_i64(&m).unwrap(), 40);

        // a reference to a reference collapses to the original storage
        let r2 = Value::make_reference(&r, &mut m, S).unwrap();
        assert_eq!(m.read_addr(r2.data).unwrap(), v.data);
    }

    #[test]
    fn pointer_roundtrip_and_equality() {
        let mut m = mem();
        let v = Value::make_i32(11, &mut m, S).unwrap();
        let p = Value::make_pointer(TYPE_INT32, 1, v.data, &mut m, S).unwrap();
        let back = p.dereference(&m).unwrap();
        assert_eq!(back.pointer_level, 0);
        assert_eq!(back.get_i64(&m).unwrap(), 11);

        let q = Value::make_pointer(TYPE_INT32, 1, v.data, &mut m, S).unwrap();
        assert!(p.equals(&q, &mut m, S).unwrap().get_bool(&m).unwrap());

        let null = Value::make_null(TYPE_INT32, 1);
        assert!(!p.equals(&null, &mut m, S).unwrap().get_bool(&m).unwrap());
        let unset = Value::make_pointer(TYPE_INT32, 1, Addr::NULL, &mut m, S).unwrap();
        assert!(unset.equals(&null, &mut m, S).unwrap().get_bool(&m).unwrap());
    }

    #[test]
    fn in_place_updates() {
        let mut m = mem();
        let v = Value::make_i32(10, &mut m, S).unwrap();
        v.increment(&mut m).unwrap();
        v.increment(&mut m).unwrap();
        v.decrement(&mut m).unwrap();
        assert_eq!(v.get_i64(&m).unwrap(), 11);

        let amount = Value::make_i32(4, &mut m, S).unwrap();
        v.plus_equals(&amount, &mut m).unwrap();
        assert_eq!(v.get_i64(&m).unwrap(), 15);
        v.times_equals(&amount, &mut m).unwrap();
        assert_eq!(v.get_i64(&m).unwrap(), 60);
        v.divide_equals(&amount, &mut m).unwrap();
        assert_eq!(v.get_i64(&m).unwrap(), 15);
    }

    #[test]
    fn primitive_casts() {
        let mut m = mem();
        let v = Value::make_f64(3.9, &mut m, S).unwrap();
        let i = v.cast_to(&[], TYPE_INT32, 0, &mut m, S).unwrap();
        assert_eq!(i.type_id, TYPE_INT32);
        assert_eq!(i.get_i64(&m).unwrap(), 3);

        let wide = Value::make_u8(250, &mut m, S).unwrap();
        let narrow = wide.cast_to(&[], TYPE_INT8, 0, &mut m, S).unwrap();
        assert_eq!(narrow.get_i64(&m).unwrap(), (250u8 as i8) as i64);
    }

    #[test]
    fn array_layout_is_row_major() {
        let mut m = mem();
        let arr = Value::make_array(&[], TYPE_INT32, 0, &[2, 3], &mut m, S).unwrap();
        assert!(arr.is_array);
        assert_eq!(arr.pointer_level, 1);
        let header = ArrayHeader::read(&m, arr.data).unwrap();
        assert_eq!(header.num_dims, 2);
        assert_eq!(header.element_count(), 6);
        // element (1, 2) => 1*3 + 2
        assert_eq!(arr.linear_index(&m, &[1, 2]).unwrap(), 5);
        assert_eq!(arr.linear_index(&m, &[0, 1]).unwrap(), 1);
    }

    #[test]
    fn cstr_values_format() {
        let mut m = mem();
        let text = m.alloc_cstr(Region::Heap, "teal").unwrap();
        let v = Value::make_cstr(text, &mut m, S).unwrap();
        assert_eq!(format_value(&v, &m).unwrap(), "teal");

        let b = Value::make_bool(true, &mut m, S).unwrap();
        assert_eq!(format_value(&b, &m).unwrap(), "true");
        let c = Value::make_char(b'x', &mut m, S).unwrap();
        assert_eq!(format_value(&c, &m).unwrap(), "x");
        let i = Value::make_i8(-3, &mut m, S).unwrap();
        assert_eq!(format_value(&i, &m).unwrap(), "-3");
    }
}
