// Type identity.
//
// A 16-bit type id either names a primitive (low reserved range) or a user
// class (`id >= FIRST_CLASS_TYPE`, index into the class table). A TypeInfo
// pairs a type id with a pointer level; two TypeInfos are equal only when
// both halves match.

use num_enum::TryFromPrimitive;
use std::convert::TryFrom;

pub const INVALID_ID: u16 = u16::MAX;

/// Type ids at or above this value are user classes.
pub const FIRST_CLASS_TYPE: u16 = 128;

pub type TypeId = u16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum Primitive {
    UInt8 = 1,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Real32,
    Real64,
    Bool,
    Char,
    Void,
    /// Stand-in for a not-yet-substituted template parameter.
    Placeholder,
}

impl Primitive {
    pub fn from_type(t: TypeId) -> Option<Primitive> {
        Primitive::try_from(t).ok()
    }

    pub fn size(self) -> u64 {
        match self {
            Primitive::UInt8 | Primitive::Int8 | Primitive::Bool | Primitive::Char => 1,
            Primitive::UInt16 | Primitive::Int16 => 2,
            Primitive::UInt32 | Primitive::Int32 | Primitive::Real32 => 4,
            Primitive::UInt64 | Primitive::Int64 | Primitive::Real64 => 8,
            Primitive::Void | Primitive::Placeholder => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Primitive::UInt8 => "uint8",
            Primitive::UInt16 => "uint16",
            Primitive::UInt32 => "uint32",
            Primitive::UInt64 => "uint64",
            Primitive::Int8 => "int8",
            Primitive::Int16 => "int16",
            Primitive::Int32 => "int32",
            Primitive::Int64 => "int64",
            Primitive::Real32 => "real32",
            Primitive::Real64 => "real64",
            Primitive::Bool => "bool",
            Primitive::Char => "char",
            Primitive::Void => "void",
            Primitive::Placeholder => "<T>",
        }
    }
}

pub const TYPE_UINT8: TypeId = Primitive::UInt8 as u16;
pub const TYPE_UINT16: TypeId = Primitive::UInt16 as u16;
pub const TYPE_UINT32: TypeId = Primitive::UInt32 as u16;
pub const TYPE_UINT64: TypeId = Primitive::UInt64 as u16;
pub const TYPE_INT8: TypeId = Primitive::Int8 as u16;
pub const TYPE_INT16: TypeId = Primitive::Int16 as u16;
pub const TYPE_INT32: TypeId = Primitive::Int32 as u16;
pub const TYPE_INT64: TypeId = Primitive::Int64 as u16;
pub const TYPE_REAL32: TypeId = Primitive::Real32 as u16;
pub const TYPE_REAL64: TypeId = Primitive::Real64 as u16;
pub const TYPE_BOOL: TypeId = Primitive::Bool as u16;
pub const TYPE_CHAR: TypeId = Primitive::Char as u16;
pub const TYPE_VOID: TypeId = Primitive::Void as u16;
pub const TYPE_PLACEHOLDER: TypeId = Primitive::Placeholder as u16;

pub fn is_primitive_type(t: TypeId) -> bool {
    t >= TYPE_UINT8 && t <= TYPE_PLACEHOLDER
}

pub fn is_class_type(t: TypeId) -> bool {
    t >= FIRST_CLASS_TYPE && t != INVALID_ID
}

pub fn is_integer_type(t: TypeId) -> bool {
    t >= TYPE_UINT8 && t <= TYPE_INT64
}

pub fn is_unsigned_type(t: TypeId) -> bool {
    t >= TYPE_UINT8 && t <= TYPE_UINT64
}

pub fn is_signed_type(t: TypeId) -> bool {
    t >= TYPE_INT8 && t <= TYPE_INT64
}

pub fn is_real_type(t: TypeId) -> bool {
    t == TYPE_REAL32 || t == TYPE_REAL64
}

pub fn bit_width(t: TypeId) -> u32 {
    match Primitive::from_type(t) {
        Some(Primitive::Bool) => 1,
        Some(p) => p.size() as u32 * 8,
        None => 0,
    }
}

/// Conversion rank, used to predict the static type of a mixed binary
/// expression. Real beats integer, wider beats narrower, unsigned beats
/// signed at equal width.
pub fn type_rank(t: TypeId) -> i32 {
    match Primitive::from_type(t) {
        Some(Primitive::Bool) => 0,
        Some(Primitive::Char) => 1,
        Some(Primitive::Int8) => 2,
        Some(Primitive::UInt8) => 3,
        Some(Primitive::Int16) => 4,
        Some(Primitive::UInt16) => 5,
        Some(Primitive::Int32) => 6,
        Some(Primitive::UInt32) => 7,
        Some(Primitive::Int64) => 8,
        Some(Primitive::UInt64) => 9,
        Some(Primitive::Real32) => 10,
        Some(Primitive::Real64) => 11,
        _ => -1,
    }
}

pub fn promote_type(a: TypeId, b: TypeId) -> TypeId {
    if a == b {
        return a;
    }
    if type_rank(a) > type_rank(b) {
        a
    } else {
        b
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TypeInfo {
    pub type_id: TypeId,
    pub pointer_level: u8,
}

impl TypeInfo {
    pub fn new(type_id: TypeId, pointer_level: u8) -> TypeInfo {
        TypeInfo { type_id, pointer_level }
    }

    pub fn invalid() -> TypeInfo {
        TypeInfo { type_id: INVALID_ID, pointer_level: 0 }
    }

    pub fn is_valid(&self) -> bool {
        self.type_id != INVALID_ID
    }

    pub fn is_pointer(&self) -> bool {
        self.pointer_level > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_classification() {
        assert!(is_primitive_type(TYPE_BOOL));
        assert!(is_primitive_type(TYPE_REAL64));
        assert!(!is_primitive_type(FIRST_CLASS_TYPE));
        assert!(!is_primitive_type(INVALID_ID));
        assert!(is_integer_type(TYPE_UINT8));
        assert!(is_integer_type(TYPE_INT64));
        assert!(!is_integer_type(TYPE_BOOL));
        assert!(!is_integer_type(TYPE_CHAR));
        assert!(is_signed_type(TYPE_INT16));
        assert!(is_unsigned_type(TYPE_UINT16));
        assert!(is_real_type(TYPE_REAL32));
    }

    #[test]
    fn promotion_follows_rank() {
        // real dominates integer
        assert_eq!(promote_type(TYPE_INT64, TYPE_REAL32), TYPE_REAL32);
        assert_eq!(promote_type(TYPE_REAL32, TYPE_REAL64), TYPE_REAL64);
        // wider wins
        assert_eq!(promote_type(TYPE_INT8, TYPE_INT32), TYPE_INT32);
        assert_eq!(promote_type(TYPE_UINT16, TYPE_UINT64), TYPE_UINT64);
        // same type is preserved
        assert_eq!(promote_type(TYPE_BOOL, TYPE_BOOL), TYPE_BOOL);
    }

    #[test]
    fn typeinfo_equality_needs_both_halves() {
        assert_eq!(TypeInfo::new(TYPE_INT32, 1), TypeInfo::new(TYPE_INT32, 1));
        assert_ne!(TypeInfo::new(TYPE_INT32, 1), TypeInfo::new(TYPE_INT32, 2));
        assert_ne!(TypeInfo::new(TYPE_INT32, 0), TypeInfo::new(TYPE_UINT32, 0));
    }
}
