// Parse-time symbol tables.
//
// Scopes nest lexically; the innermost *function* scope owns the slot
// counter, so locals declared in sibling blocks share the same frame and
// slots are dense per function.

use crate::template::TemplateCommand;
use crate::types::{TypeInfo, INVALID_ID};
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Clone, Debug)]
pub struct LocalDecl {
    pub type_info: TypeInfo,
    pub template_type_name: String,
    pub command: Option<Rc<TemplateCommand>>,
}

impl Default for LocalDecl {
    fn default() -> LocalDecl {
        LocalDecl {
            type_info: TypeInfo::invalid(),
            template_type_name: String::new(),
            command: None,
        }
    }
}

#[derive(Default)]
struct Block {
    names: HashMap<String, u16>,
    decls: HashMap<u16, LocalDecl>,
}

/// A chain of blocks for one function body. Pushing and popping blocks
/// tracks shadowing; the slot counter only ever grows within a function.
pub struct ScopeChain {
    blocks: Vec<Block>,
    local_count: u16,
}

impl ScopeChain {
    pub fn new() -> ScopeChain {
        ScopeChain {
            blocks: vec![Block::default()],
            local_count: 0,
        }
    }

    pub fn push(&mut self) {
        self.blocks.push(Block::default());
    }

    pub fn pop(&mut self) {
        self.blocks.pop();
    }

    /// Declare a local in the innermost block; re-declaring a name in the
    /// same block returns the existing slot.
    pub fn add_local(
        &mut self,
        name: &str,
        type_info: TypeInfo,
        template_type_name: &str,
        command: Option<Rc<TemplateCommand>>,
    ) -> u16 {
        let block = self.blocks.last_mut().unwrap();
        if let Some(&slot) = block.names.get(name) {
            return slot;
        }
        let slot = self.local_count;
        self.local_count += 1;
        let block = self.blocks.last_mut().unwrap();
        block.names.insert(name.to_string(), slot);
        block.decls.insert(
            slot,
            LocalDecl {
                type_info,
                template_type_name: template_type_name.to_string(),
                command,
            },
        );
        slot
    }

    /// Innermost-first name lookup through the whole chain.
    pub fn resolve(&self, name: &str) -> u16 {
        for block in self.blocks.iter().rev() {
            if let Some(&slot) = block.names.get(name) {
                return slot;
            }
        }
        INVALID_ID
    }

    pub fn declaration(&self, slot: u16) -> LocalDecl {
        for block in self.blocks.iter().rev() {
            if let Some(decl) = block.decls.get(&slot) {
                return decl.clone();
            }
        }
        LocalDecl::default()
    }

    pub fn num_locals(&self) -> u16 {
        self.local_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TypeInfo, TYPE_INT32, TYPE_REAL64};

    #[test]
    fn slots_are_function_wide() {
        let mut scope = ScopeChain::new();
        let a = scope.add_local("a", TypeInfo::new(TYPE_INT32, 0), "", None);
        scope.push();
        let b = scope.add_local("b", TypeInfo::new(TYPE_INT32, 0), "", None);
        scope.pop();
        scope.push();
        let c = scope.add_local("c", TypeInfo::new(TYPE_INT32, 0), "", None);
        scope.pop();
        // sibling blocks keep counting; nothing is reused at parse time
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(scope.num_locals(), 3);
    }

    #[test]
    fn inner_blocks_shadow_and_expire() {
        let mut scope = ScopeChain::new();
        scope.add_local("x", TypeInfo::new(TYPE_INT32, 0), "", None);
        scope.push();
        let inner = scope.add_local("x", TypeInfo::new(TYPE_REAL64, 0), "", None);
        assert_eq!(scope.resolve("x"), inner);
        assert_eq!(scope.declaration(inner).type_info.type_id, TYPE_REAL64);
        scope.pop();
        assert_eq!(scope.resolve("x"), 0);
        assert_eq!(scope.resolve("y"), INVALID_ID);
    }

    #[test]
    fn redeclaration_in_same_block_reuses_slot() {
        let mut scope = ScopeChain::new();
        let a = scope.add_local("x", TypeInfo::new(TYPE_INT32, 0), "", None);
        let b = scope.add_local("x", TypeInfo::new(TYPE_INT32, 0), "", None);
        assert_eq!(a, b);
        assert_eq!(scope.num_locals(), 1);
    }
}
