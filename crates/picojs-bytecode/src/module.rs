//! The bytecode module: the artifact an interpreter runs.

use serde::{Deserialize, Serialize};

use crate::error::BytecodeError;
use crate::function::Function;
use crate::operand::FunctionIndex;

/// A loaded bytecode module.
///
/// Bytecode generation from an AST is out of scope for this crate — a
/// `Module` is assumed to already exist, built by an external compiler or
/// by tests constructing one by hand via [`ModuleBuilder`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Module {
    functions: Vec<Function>,
    global_function_index: u32,
}

impl Module {
    pub fn builder() -> ModuleBuilder {
        ModuleBuilder::default()
    }

    pub fn global_function_index(&self) -> FunctionIndex {
        FunctionIndex(self.global_function_index)
    }

    pub fn function(&self, index: FunctionIndex) -> Result<&Function, BytecodeError> {
        self.functions
            .get(index.index() as usize)
            .ok_or(BytecodeError::InvalidFunctionIndex(index.index()))
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }
}

#[derive(Debug, Default)]
pub struct ModuleBuilder {
    functions: Vec<Function>,
    global_function_index: u32,
}

impl ModuleBuilder {
    pub fn function(mut self, f: Function) -> Self {
        self.functions.push(f);
        self
    }

    pub fn global_function_index(mut self, index: u32) -> Self {
        self.global_function_index = index;
        self
    }

    pub fn build(self) -> Module {
        Module {
            functions: self.functions,
            global_function_index: self.global_function_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Function;

    #[test]
    fn missing_function_is_an_error() {
        let m = Module::builder().function(Function::builder().build()).build();
        assert!(m.function(FunctionIndex(0)).is_ok());
        assert!(matches!(
            m.function(FunctionIndex(5)),
            Err(BytecodeError::InvalidFunctionIndex(5))
        ));
    }
}
