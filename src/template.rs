// Template (generic) machinery.
//
// A templated class records its parameter list. Uses of `X<...>` inside
// another template, where an argument is itself a parameter of the
// enclosing class, cannot instantiate yet; they record an instantiation
// command that is replayed once concrete arguments are known. Replay is
// memoised in the program's template cache, keyed by the canonical
// argument list.

use crate::types::TypeId;
use std::rc::Rc;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TemplateParamKind {
    Type,
    Int,
}

#[derive(Clone, Debug)]
pub struct TemplateParam {
    pub kind: TemplateParamKind,
    pub name: String,
}

#[derive(Clone, Debug, Default)]
pub struct TemplateDefinition {
    pub params: Vec<TemplateParam>,
}

impl TemplateDefinition {
    pub fn has_params(&self) -> bool {
        !self.params.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    pub fn is_type_param(&self, name: &str) -> bool {
        self.params
            .iter()
            .any(|p| p.kind == TemplateParamKind::Type && p.name == name)
    }

    pub fn is_int_param(&self, name: &str) -> bool {
        self.params
            .iter()
            .any(|p| p.kind == TemplateParamKind::Int && p.name == name)
    }
}

/// One argument of an instantiation. `placeholder` names a parameter of
/// the enclosing template when the argument is not yet concrete.
#[derive(Clone, Debug, PartialEq)]
pub struct TemplateArg {
    pub kind: TemplateParamKind,
    /// Type id for type arguments, literal value for int arguments.
    pub value: u32,
    pub pointer_level: u8,
    pub placeholder: String,
}

impl TemplateArg {
    pub fn concrete_type(t: TypeId, pointer_level: u8) -> TemplateArg {
        TemplateArg {
            kind: TemplateParamKind::Type,
            value: t as u32,
            pointer_level,
            placeholder: String::new(),
        }
    }

    pub fn int(v: u32) -> TemplateArg {
        TemplateArg {
            kind: TemplateParamKind::Int,
            value: v,
            pointer_level: 0,
            placeholder: String::new(),
        }
    }

    pub fn placeholder(kind: TemplateParamKind, name: &str) -> TemplateArg {
        TemplateArg {
            kind,
            value: 0,
            pointer_level: 0,
            placeholder: name.to_string(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        !self.placeholder.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TemplateInstantiation {
    pub args: Vec<TemplateArg>,
}

impl TemplateInstantiation {
    pub fn has_placeholder(&self) -> bool {
        self.args.iter().any(|a| a.is_placeholder())
    }
}

/// Deferred instantiation recipe: each argument is either already known or
/// the result of a nested command.
#[derive(Clone, Debug)]
pub enum CommandArg {
    Arg(TemplateArg),
    Nested(Rc<TemplateCommand>),
}

#[derive(Clone, Debug)]
pub struct TemplateCommand {
    /// The template class to instantiate.
    pub class_id: TypeId,
    pub args: Vec<CommandArg>,
}

/// Cache key canonicalising integer values and type identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub class_id: TypeId,
    pub args: Vec<(u8, u32, u8)>,
}

impl InstanceKey {
    pub fn new(class_id: TypeId, inst: &TemplateInstantiation) -> InstanceKey {
        InstanceKey {
            class_id,
            args: inst
                .args
                .iter()
                .map(|a| (a.kind as u8, a.value, a.pointer_level))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TYPE_INT32;

    #[test]
    fn definition_lookups() {
        let def = TemplateDefinition {
            params: vec![
                TemplateParam { kind: TemplateParamKind::Type, name: "T".into() },
                TemplateParam { kind: TemplateParamKind::Int, name: "N".into() },
            ],
        };
        assert!(def.has_params());
        assert_eq!(def.find("T"), Some(0));
        assert_eq!(def.find("N"), Some(1));
        assert!(def.is_type_param("T"));
        assert!(!def.is_type_param("N"));
        assert!(def.is_int_param("N"));
        assert_eq!(def.find("U"), None);
    }

    #[test]
    fn keys_canonicalise_arguments() {
        let a = TemplateInstantiation {
            args: vec![TemplateArg::concrete_type(TYPE_INT32, 0), TemplateArg::int(4)],
        };
        let b = TemplateInstantiation {
            args: vec![TemplateArg::concrete_type(TYPE_INT32, 0), TemplateArg::int(4)],
        };
        assert_eq!(InstanceKey::new(200, &a), InstanceKey::new(200, &b));
        let c = TemplateInstantiation {
            args: vec![TemplateArg::concrete_type(TYPE_INT32, 1), TemplateArg::int(4)],
        };
        assert_ne!(InstanceKey::new(200, &a), InstanceKey::new(200, &c));
    }

    #[test]
    fn placeholder_detection() {
        let inst = TemplateInstantiation {
            args: vec![
                TemplateArg::concrete_type(TYPE_INT32, 0),
                TemplateArg::placeholder(TemplateParamKind::Type, "T"),
            ],
        };
        assert!(inst.has_placeholder());
    }
}
