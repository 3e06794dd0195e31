// Class and function registries.
//
// A class owns its field layout, an overload set keyed by generated
// signatures, cached special functions (constructor/destructor/copy/assign)
// and a compiled VTable. Overload resolution scores implicit conversions
// with one table shared by call-site selection and VTable slot matching.

use crate::ast::ExprId;
use crate::memory::Addr;
use crate::template::{TemplateCommand, TemplateDefinition};
use crate::types::*;
use enumflags2::BitFlags;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Public,
    Private,
}

#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum FnFlag {
    Static = 0b01,
    Virtual = 0b10,
}

#[derive(Clone, Debug)]
pub struct FunctionParam {
    pub type_info: TypeInfo,
    pub is_reference: bool,
    pub slot: u16,
    pub template_type_name: String,
    pub command: Option<Rc<TemplateCommand>>,
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub access: Access,
    pub flags: BitFlags<FnFlag>,
    pub return_info: TypeInfo,
    pub return_template_type_name: String,
    pub returns_reference: bool,
    pub params: Vec<FunctionParam>,
    pub body: Vec<ExprId>,
    pub id: u16,
    pub num_locals: u16,
    pub pc: u32,
}

impl Function {
    pub fn is_static(&self) -> bool {
        self.flags.contains(FnFlag::Static)
    }

    pub fn is_virtual(&self) -> bool {
        self.flags.contains(FnFlag::Virtual)
    }
}

#[derive(Clone, Debug)]
pub struct ClassField {
    pub name: String,
    pub type_info: TypeInfo,
    pub offset: u64,
    pub size: u64,
    /// Up to 8 dimensions; the string names a template int parameter when
    /// the extent is not yet concrete.
    pub dims: Vec<(u32, String)>,
    pub template_type_name: String,
    pub command: Option<Rc<TemplateCommand>>,
    /// Statics only.
    pub init_expr: Option<ExprId>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct VSlot {
    pub class_id: TypeId,
    pub fn_id: u16,
}

#[derive(Clone, Debug, Default)]
pub struct VTable {
    pub slots: Vec<VSlot>,
}

impl VTable {
    /// Best slot for `name` called with `params`, by conversion scoring.
    pub fn find_slot(&self, classes: &[Class], name: &str, params: &[TypeInfo]) -> Option<u16> {
        let mut best: Option<(i32, u16)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            let func = class_of(classes, slot.class_id).function(slot.fn_id);
            if func.name != name || func.params.len() != params.len() {
                continue;
            }
            let mut total = 0;
            let mut compatible = true;
            for (arg, param) in params.iter().zip(&func.params) {
                match conversion_score(classes, *arg, param.type_info, true) {
                    Some((score, _)) => total += score,
                    None => {
                        compatible = false;
                        break;
                    }
                }
            }
            if compatible && best.map_or(true, |(s, _)| total < s) {
                best = Some((total, index as u16));
            }
        }
        best.map(|(_, i)| i)
    }
}

pub struct Class {
    pub name: String,
    pub id: TypeId,
    pub base: Option<TypeId>,
    /// Payload size in bytes, including the base-class prefix and the
    /// hidden words/headers of interior objects and arrays.
    pub size: u64,
    pub static_size: u64,
    pub static_base: Addr,
    pub member_fields: Vec<ClassField>,
    pub static_fields: Vec<ClassField>,
    /// name -> function ids, in declaration order.
    pub overloads: HashMap<String, Vec<u16>>,
    pub signature_map: HashMap<String, u16>,
    pub functions: Vec<Function>,
    pub destructor: Option<u16>,
    pub copy_ctor: Option<u16>,
    pub assign_fn: Option<u16>,
    pub default_ctor: Option<u16>,
    pub template: TemplateDefinition,
    pub is_template_instance: bool,
    pub vtable: VTable,
}

impl Class {
    pub fn new(name: String, id: TypeId, base: Option<TypeId>) -> Class {
        Class {
            name,
            id,
            base,
            size: 0,
            static_size: 0,
            static_base: Addr::NULL,
            member_fields: Vec::new(),
            static_fields: Vec::new(),
            overloads: HashMap::new(),
            signature_map: HashMap::new(),
            functions: Vec::new(),
            destructor: None,
            copy_ctor: None,
            assign_fn: None,
            default_ctor: None,
            template: TemplateDefinition::default(),
            is_template_instance: false,
            vtable: VTable::default(),
        }
    }

    pub fn is_template_class(&self) -> bool {
        self.template.has_params()
    }

    pub fn function(&self, id: u16) -> &Function {
        &self.functions[id as usize]
    }

    /// Register a function. Duplicate signatures reuse the existing id.
    pub fn add_function(&mut self, mut func: Function, signature: String) -> u16 {
        if let Some(&existing) = self.signature_map.get(&signature) {
            return existing;
        }
        let id = self.functions.len() as u16;
        func.id = id;
        self.signature_map.insert(signature, id);
        self.overloads.entry(func.name.clone()).or_insert_with(Vec::new).push(id);

        if func.name.starts_with('~') {
            self.destructor = Some(id);
        } else if func.name == self.name {
            if func.params.is_empty() {
                self.default_ctor = Some(id);
            } else if func.params.len() == 1
                && func.params[0].type_info == TypeInfo::new(self.id, 0)
            {
                self.copy_ctor = Some(id);
            }
        } else if func.name == "operator=" {
            self.assign_fn = Some(id);
        }

        self.functions.push(func);
        id
    }

    /// Resolve `members` (a dotted path) against the member layout,
    /// accumulating byte offsets and descending into nested classes.
    /// Fields of base classes are visible at their base offsets.
    pub fn member_offset(
        &self,
        classes: &[Class],
        members: &[String],
    ) -> Option<(u64, TypeInfo, bool)> {
        let field = find_member_field(classes, self.id, &members[0])?;
        let offset = field.offset;
        let is_array = !field.dims.is_empty();
        if members.len() == 1 || is_primitive_type(field.type_info.type_id) {
            if members.len() > 1 {
                return None;
            }
            return Some((offset, field.type_info, is_array));
        }
        let inner = class_of(classes, field.type_info.type_id);
        let (rest, info, arr) = inner.member_offset(classes, &members[1..])?;
        Some((offset + rest, info, arr))
    }

    /// Same walk for the static region of this class.
    pub fn static_offset(
        &self,
        classes: &[Class],
        members: &[String],
    ) -> Option<(u64, TypeInfo, bool)> {
        let field = self.static_fields.iter().find(|f| f.name == members[0])?;
        let is_array = !field.dims.is_empty();
        if members.len() == 1 {
            return Some((field.offset, field.type_info, is_array));
        }
        if is_primitive_type(field.type_info.type_id) {
            return None;
        }
        let inner = class_of(classes, field.type_info.type_id);
        let (rest, info, arr) = inner.member_offset(classes, &members[1..])?;
        Some((field.offset + rest, info, arr))
    }
}

pub fn class_of(classes: &[Class], t: TypeId) -> &Class {
    &classes[(t - FIRST_CLASS_TYPE) as usize]
}

pub fn class_index(t: TypeId) -> usize {
    (t - FIRST_CLASS_TYPE) as usize
}

fn find_member_field<'a>(classes: &'a [Class], class_id: TypeId, name: &str) -> Option<&'a ClassField> {
    let mut current = Some(class_id);
    while let Some(id) = current {
        let cls = class_of(classes, id);
        if let Some(field) = cls.member_fields.iter().find(|f| f.name == name) {
            return Some(field);
        }
        current = cls.base;
    }
    None
}

pub fn inherits_from(classes: &[Class], derived: TypeId, base: TypeId) -> bool {
    let mut current = class_of(classes, derived).base;
    while let Some(id) = current {
        if id == base {
            return true;
        }
        current = class_of(classes, id).base;
    }
    false
}

pub fn type_name(classes: &[Class], t: TypeId) -> String {
    if let Some(p) = Primitive::from_type(t) {
        return p.name().to_string();
    }
    if is_class_type(t) && class_index(t) < classes.len() {
        return class_of(classes, t).name.clone();
    }
    String::from("<invalid>")
}

/// Byte size of a value of type `t` (pointers not included; a pointer to
/// anything is one word).
pub fn type_size(classes: &[Class], t: TypeId) -> u64 {
    if let Some(p) = Primitive::from_type(t) {
        return p.size();
    }
    if is_class_type(t) && class_index(t) < classes.len() {
        return class_of(classes, t).size;
    }
    0
}

/// Textual overload signature: `"name-T0_T1"` with pointer levels suffixed.
pub fn signature_from_types(classes: &[Class], name: &str, args: &[TypeInfo]) -> String {
    let mut sig = format!("{}-", name);
    for (i, arg) in args.iter().enumerate() {
        if !arg.is_valid() {
            return sig;
        }
        sig.push_str(&type_name(classes, arg.type_id));
        if arg.pointer_level > 0 {
            sig.push_str(&arg.pointer_level.to_string());
        }
        if i + 1 < args.len() {
            sig.push('_');
        }
    }
    sig
}

pub fn function_signature(classes: &[Class], func: &Function) -> String {
    let types: Vec<TypeInfo> = func.params.iter().map(|p| p.type_info).collect();
    signature_from_types(classes, &func.name, &types)
}

/// Implicit-conversion score for passing `from` where `to` is expected.
/// `None` means incompatible; the second element is the id of a one-argument
/// constructor on the target class when the conversion goes through one.
pub fn conversion_score(
    classes: &[Class],
    from: TypeInfo,
    to: TypeInfo,
    allow_ctor: bool,
) -> Option<(i32, u16)> {
    if from.pointer_level != to.pointer_level {
        return None;
    }
    if from.type_id == to.type_id {
        return Some((0, INVALID_ID));
    }

    if is_class_type(from.type_id) && is_class_type(to.type_id) {
        if inherits_from(classes, from.type_id, to.type_id) {
            return Some((1, INVALID_ID));
        }
    }

    if is_class_type(to.type_id) && to.pointer_level == 0 {
        if !allow_ctor {
            return None;
        }
        let target = class_of(classes, to.type_id);
        let name = target.name.clone();
        let found = resolve_overload_in(classes, to.type_id, &name, &[from], false)?;
        return Some((1, found.fn_id));
    }

    let from_int = is_integer_type(from.type_id);
    let to_int = is_integer_type(to.type_id);
    let from_real = is_real_type(from.type_id);
    let to_real = is_real_type(to.type_id);

    if from_int && to_int {
        let narrowing = type_size(classes, from.type_id) > type_size(classes, to.type_id);
        return Some((if narrowing { 2 } else { 1 }, INVALID_ID));
    }
    if from_real && to_real {
        let narrowing = type_size(classes, from.type_id) > type_size(classes, to.type_id);
        return Some((if narrowing { 2 } else { 1 }, INVALID_ID));
    }
    if from_int && to_real {
        return Some((3, INVALID_ID));
    }
    if from_real && to_int {
        return Some((4, INVALID_ID));
    }

    None
}

#[derive(Clone, Debug, PartialEq)]
pub struct OverloadMatch {
    /// Class that declares the selected function (may be a base).
    pub class_id: TypeId,
    pub fn_id: u16,
    /// One entry per argument: implicit-cast constructor id or INVALID_ID.
    pub cast_fns: Vec<u16>,
}

/// Deterministic overload resolution: exact signature first, then the
/// minimum-score candidate, ties broken by declaration order. Walks the
/// base chain when the class itself has no compatible overload.
pub fn resolve_overload(
    classes: &[Class],
    class_id: TypeId,
    name: &str,
    args: &[TypeInfo],
) -> Option<OverloadMatch> {
    resolve_overload_in(classes, class_id, name, args, true)
}

fn resolve_overload_in(
    classes: &[Class],
    class_id: TypeId,
    name: &str,
    args: &[TypeInfo],
    allow_ctor: bool,
) -> Option<OverloadMatch> {
    let mut current = Some(class_id);
    while let Some(id) = current {
        let cls = class_of(classes, id);

        let exact = signature_from_types(classes, name, args);
        if let Some(&fn_id) = cls.signature_map.get(&exact) {
            return Some(OverloadMatch {
                class_id: id,
                fn_id,
                cast_fns: vec![INVALID_ID; args.len()],
            });
        }

        let mut best: Option<(i32, u16, Vec<u16>)> = None;
        if let Some(candidates) = cls.overloads.get(name) {
            for &fn_id in candidates {
                let func = cls.function(fn_id);
                if func.params.len() != args.len() {
                    continue;
                }
                let mut total = 0;
                let mut casts = Vec::with_capacity(args.len());
                let mut compatible = true;
                for (arg, param) in args.iter().zip(&func.params) {
                    match conversion_score(classes, *arg, param.type_info, allow_ctor) {
                        Some((score, cast)) => {
                            total += score;
                            casts.push(cast);
                        }
                        None => {
                            compatible = false;
                            break;
                        }
                    }
                }
                if compatible && best.as_ref().map_or(true, |(s, _, _)| total < *s) {
                    best = Some((total, fn_id, casts));
                }
            }
        }
        if let Some((_, fn_id, cast_fns)) = best {
            return Some(OverloadMatch { class_id: id, fn_id, cast_fns });
        }

        current = cls.base;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func(name: &str, params: &[(TypeId, u8)], ret: TypeId) -> Function {
        Function {
            name: name.to_string(),
            access: Access::Public,
            flags: BitFlags::empty(),
            return_info: TypeInfo::new(ret, 0),
            return_template_type_name: String::new(),
            returns_reference: false,
            params: params
                .iter()
                .enumerate()
                .map(|(i, &(t, p))| FunctionParam {
                    type_info: TypeInfo::new(t, p),
                    is_reference: false,
                    slot: i as u16,
                    template_type_name: String::new(),
                    command: None,
                })
                .collect(),
            body: Vec::new(),
            id: 0,
            num_locals: 0,
            pc: 0,
        }
    }

    fn add(classes: &mut Vec<Class>, idx: usize, f: Function) -> u16 {
        let sig = function_signature(classes, &f);
        classes[idx].add_function(f, sig)
    }

    fn table() -> Vec<Class> {
        let mut classes = vec![
            Class::new("Base".into(), FIRST_CLASS_TYPE, None),
            Class::new("Derived".into(), FIRST_CLASS_TYPE + 1, Some(FIRST_CLASS_TYPE)),
        ];
        add(&mut classes, 0, func("f", &[(TYPE_INT32, 0)], TYPE_VOID));
        add(&mut classes, 0, func("f", &[(TYPE_REAL64, 0)], TYPE_VOID));
        add(&mut classes, 0, func("g", &[(FIRST_CLASS_TYPE, 1)], TYPE_VOID));
        classes
    }

    #[test]
    fn signatures_suffix_pointer_levels() {
        let classes = table();
        let sig = signature_from_types(
            &classes,
            "f",
            &[TypeInfo::new(TYPE_INT32, 0), TypeInfo::new(TYPE_CHAR, 2)],
        );
        assert_eq!(sig, "f-int32_char2");
    }

    #[test]
    fn duplicate_signatures_reuse_ids() {
        let mut classes = table();
        let a = add(&mut classes, 0, func("f", &[(TYPE_INT32, 0)], TYPE_VOID));
        assert_eq!(a, 0);
        assert_eq!(classes[0].functions.len(), 3);
    }

    #[test]
    fn exact_match_beats_scoring() {
        let classes = table();
        let m = resolve_overload(&classes, FIRST_CLASS_TYPE, "f", &[TypeInfo::new(TYPE_INT32, 0)])
            .unwrap();
        assert_eq!(m.fn_id, 0);
        assert_eq!(m.cast_fns, vec![INVALID_ID]);
    }

    #[test]
    fn scoring_prefers_widening_over_int_to_real() {
        let classes = table();
        // int16 arg: widening to int32 scores 1, int -> real scores 3
        let m = resolve_overload(&classes, FIRST_CLASS_TYPE, "f", &[TypeInfo::new(TYPE_INT16, 0)])
            .unwrap();
        assert_eq!(m.fn_id, 0);
        // real32 arg: real widening to real64 scores 1, real -> int scores 4
        let m = resolve_overload(&classes, FIRST_CLASS_TYPE, "f", &[TypeInfo::new(TYPE_REAL32, 0)])
            .unwrap();
        assert_eq!(m.fn_id, 1);
    }

    #[test]
    fn derived_pointer_converts_to_base_pointer() {
        let classes = table();
        let m = resolve_overload(
            &classes,
            FIRST_CLASS_TYPE,
            "g",
            &[TypeInfo::new(FIRST_CLASS_TYPE + 1, 1)],
        )
        .unwrap();
        assert_eq!(m.fn_id, 2);

        // but a pointer-level mismatch is rejected
        assert!(resolve_overload(
            &classes,
            FIRST_CLASS_TYPE,
            "g",
            &[TypeInfo::new(FIRST_CLASS_TYPE + 1, 2)],
        )
        .is_none());
    }

    #[test]
    fn inherited_methods_resolve_through_base_chain() {
        let classes = table();
        let m = resolve_overload(
            &classes,
            FIRST_CLASS_TYPE + 1,
            "f",
            &[TypeInfo::new(TYPE_INT32, 0)],
        )
        .unwrap();
        assert_eq!(m.class_id, FIRST_CLASS_TYPE);
        assert_eq!(m.fn_id, 0);
    }

    #[test]
    fn resolution_is_deterministic() {
        // same table, same args, same answer (overload map iteration must
        // not leak HashMap ordering)
        let classes = table();
        let args = [TypeInfo::new(TYPE_INT16, 0)];
        let first = resolve_overload(&classes, FIRST_CLASS_TYPE, "f", &args).unwrap();
        for _ in 0..16 {
            let classes = table();
            assert_eq!(resolve_overload(&classes, FIRST_CLASS_TYPE, "f", &args).unwrap(), first);
        }
    }

    #[test]
    fn special_functions_are_cached() {
        let mut classes = vec![Class::new("V".into(), FIRST_CLASS_TYPE, None)];
        add(&mut classes, 0, func("V", &[], TYPE_VOID));
        add(&mut classes, 0, func("V", &[(FIRST_CLASS_TYPE, 0)], TYPE_VOID));
        add(&mut classes, 0, func("~V", &[], TYPE_VOID));
        add(&mut classes, 0, func("operator=", &[(FIRST_CLASS_TYPE, 0)], TYPE_VOID));
        let cls = &classes[0];
        assert_eq!(cls.default_ctor, Some(0));
        assert_eq!(cls.copy_ctor, Some(1));
        assert_eq!(cls.destructor, Some(2));
        assert_eq!(cls.assign_fn, Some(3));
    }

    #[test]
    fn member_offsets_descend_and_search_bases() {
        let mut classes = table();
        classes[0].member_fields.push(ClassField {
            name: "x".into(),
            type_info: TypeInfo::new(TYPE_INT32, 0),
            offset: 0,
            size: 4,
            dims: Vec::new(),
            template_type_name: String::new(),
            command: None,
            init_expr: None,
        });
        classes[0].size = 4;
        classes[1].member_fields.push(ClassField {
            name: "y".into(),
            type_info: TypeInfo::new(TYPE_INT32, 0),
            offset: 4,
            size: 4,
            dims: Vec::new(),
            template_type_name: String::new(),
            command: None,
            init_expr: None,
        });
        classes[1].size = 8;

        let derived = class_of(&classes, FIRST_CLASS_TYPE + 1);
        let (off, info, arr) = derived.member_offset(&classes, &["y".into()]).unwrap();
        assert_eq!((off, arr), (4, false));
        assert_eq!(info.type_id, TYPE_INT32);
        // base field found through the chain at its base offset
        let (off, _, _) = derived.member_offset(&classes, &["x".into()]).unwrap();
        assert_eq!(off, 0);
        assert!(derived.member_offset(&classes, &["nope".into()]).is_none());
    }
}
