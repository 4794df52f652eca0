//! Modules of cranelift functions, and the operations that move functions between them

use crate::context::IrContext;
use crate::error::{IrError, IrResult, VerifyError};
use crate::names::{
    prune_external_functions, remap_external_names, symbol_value_names, used_func_refs,
    user_name, ExternalSymbol, NameTarget,
};
use cranelift::codegen::ir::{
    ExtFuncData, ExternalName, FuncRef, Function, InstBuilder, InstructionData, Opcode,
    UserExternalName, UserFuncName,
};
use cranelift::codegen::print_errors::pretty_verifier_error;
use cranelift::codegen::settings;
use cranelift::codegen::verify_function;
use indexmap::IndexMap;
use itertools::Itertools as _;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use tracing::{debug, trace};

/// Identifies a module within its [IrContext]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u32);

impl ModuleId {
    pub(crate) fn new(id: u32) -> Self {
        Self(id)
    }

    /// The namespace references into this module use
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for ModuleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "module{}", self.0)
    }
}

/// What a numbered reference inside a function body points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A function of the module holding the body
    Local(String),
    /// A function of some other module of the same context
    Foreign { module: ModuleId, symbol: String },
}

/// An ordered collection of functions, some defined and some only declared.
///
/// Function bodies refer to other functions through numbered names whose namespace is the id
/// of the module the reference resolves in. A body cloned out of another module keeps pointing
/// into that module until its calls are localized.
pub struct IrModule {
    context: IrContext,
    id: ModuleId,
    name: String,
    functions: IndexMap<String, Function>,
}

/// Whether a function only declares a signature
pub fn is_declaration(func: &Function) -> bool {
    func.layout.entry_block().is_none()
}

impl IrModule {
    pub(crate) fn new(
        context: IrContext,
        id: ModuleId,
        name: String,
        functions: IndexMap<String, Function>,
    ) -> Self {
        Self {
            context,
            id,
            name,
            functions,
        }
    }

    #[inline]
    pub fn id(&self) -> ModuleId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn context(&self) -> &IrContext {
        &self.context
    }

    /// All functions in the order they were added
    pub fn functions(&self) -> impl Iterator<Item = (&str, &Function)> {
        self.functions.iter().map(|(name, func)| (name.as_str(), func))
    }

    /// Gets a function by name
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    /// Whether the named function is a declaration, `None` if there is no such function
    pub fn is_declaration(&self, name: &str) -> Option<bool> {
        self.functions.get(name).map(is_declaration)
    }

    /// Resolves a numbered reference made by one of this module's bodies
    pub fn resolve(&self, name: &UserExternalName) -> Reference {
        let symbol = self
            .context
            .symbol_name(name.index)
            .unwrap_or_else(|| format!("<symbol {}>", name.index));
        if name.namespace == self.id.as_u32() {
            Reference::Local(symbol)
        } else {
            Reference::Foreign {
                module: ModuleId::new(name.namespace),
                symbol,
            }
        }
    }

    fn find(&self, name: &str) -> IrResult<&Function> {
        self.functions
            .get(name)
            .ok_or_else(|| IrError::FunctionNotFound {
                module: self.name.clone(),
                function: name.to_string(),
            })
    }

    fn check_context(&self, other: &IrModule) -> IrResult<()> {
        if self.context.same_as(&other.context) {
            Ok(())
        } else {
            Err(IrError::ContextMismatch(
                self.name.clone(),
                other.name.clone(),
            ))
        }
    }

    /// Verifies every function body, and that every reference they make resolves to a function
    /// of this module with a matching signature.
    pub fn verify(&self) -> IrResult<()> {
        let flags = settings::Flags::new(settings::builder());
        let mut errors = vec![];

        for (name, func) in &self.functions {
            if is_declaration(func) {
                continue;
            }
            if let Err(e) = verify_function(func, &flags) {
                errors.push(VerifyError::Function {
                    function: name.clone(),
                    report: pretty_verifier_error(func, None, e),
                });
            }

            for func_ref in used_func_refs(func) {
                let Some(user) = user_name(func, func_ref) else {
                    continue;
                };
                match self.check_reference(name, &user) {
                    Ok((symbol, callee)) => {
                        let imported = &func.dfg.signatures[func.dfg.ext_funcs[func_ref].signature];
                        if imported != &callee.signature {
                            errors.push(VerifyError::SignatureMismatch {
                                function: name.clone(),
                                symbol,
                                imported: imported.clone(),
                                actual: callee.signature.clone(),
                            });
                        }
                    }
                    Err(e) => errors.push(e),
                }
            }

            for user in symbol_value_names(func) {
                if let Err(e) = self.check_reference(name, &user) {
                    errors.push(e);
                }
            }
        }

        if errors.is_empty() {
            trace!("module {:?} verified", self.name);
            Ok(())
        } else {
            Err(IrError::Verify {
                module: self.name.clone(),
                errors,
            })
        }
    }

    fn check_reference(
        &self,
        function: &str,
        user: &UserExternalName,
    ) -> Result<(String, &Function), VerifyError> {
        match self.resolve(user) {
            Reference::Local(symbol) => match self.functions.get(&symbol) {
                Some(callee) => Ok((symbol, callee)),
                None => Err(VerifyError::UndefinedSymbol {
                    function: function.to_string(),
                    symbol,
                }),
            },
            Reference::Foreign { module, symbol } => Err(VerifyError::ForeignReference {
                function: function.to_string(),
                symbol,
                module: self
                    .context
                    .module_name(module)
                    .unwrap_or_else(|| module.to_string()),
            }),
        }
    }

    /// Copies the declaration of `name` from `from` into this module, then verifies this module.
    ///
    /// The declaration is removed again when verification fails.
    pub fn clone_declaration(&mut self, from: &IrModule, name: &str) -> IrResult<()> {
        self.check_context(from)?;
        let source = from.find(name)?;
        if !is_declaration(source) {
            return Err(IrError::NotADeclaration {
                module: from.name.clone(),
                function: name.to_string(),
            });
        }
        if self.functions.contains_key(name) {
            return Err(IrError::AlreadyDefined {
                module: self.name.clone(),
                function: name.to_string(),
            });
        }

        let declaration =
            Function::with_name_signature(UserFuncName::testcase(name), source.signature.clone());
        let signature = source.signature.clone();
        self.functions.insert(name.to_string(), declaration);
        if let Err(e) = self.verify() {
            self.functions.shift_remove(name);
            return Err(e);
        }
        debug!(
            "declared %{name} in {:?} with signature `{signature}`",
            self.name
        );
        Ok(())
    }

    /// Replaces the body of this module's `name` with a copy of the body `from` has.
    ///
    /// References made by the copied body keep resolving in `from`, so this module will not
    /// verify until those references are localized.
    pub fn replace_body(&mut self, from: &IrModule, name: &str) -> IrResult<()> {
        self.check_context(from)?;
        let source = from.find(name)?;
        if is_declaration(source) {
            return Err(IrError::NotADefinition {
                module: from.name.clone(),
                function: name.to_string(),
            });
        }
        let module = &self.name;
        let target = self
            .functions
            .get_mut(name)
            .ok_or_else(|| IrError::FunctionNotFound {
                module: module.clone(),
                function: name.to_string(),
            })?;
        if target.signature != source.signature {
            return Err(IrError::SignatureMismatch {
                function: name.to_string(),
                expected: target.signature.clone(),
                found: source.signature.clone(),
            });
        }

        let mut body = source.clone();
        body.name = target.name.clone();
        *target = body;
        debug!("replaced body of %{name} in {module:?} with the body from {:?}", from.name);
        trace!("%{name} is now:\n{}", self.functions[name]);
        Ok(())
    }

    /// Rewrites every call in `name` that targets a function of another module into a call of
    /// this module's function with the same name.
    ///
    /// External functions left unused afterwards are dropped. Returns the number of rewritten
    /// calls.
    pub fn localize_calls(&mut self, name: &str) -> IrResult<usize> {
        let index = self
            .functions
            .get_index_of(name)
            .ok_or_else(|| IrError::FunctionNotFound {
                module: self.name.clone(),
                function: name.to_string(),
            })?;
        let func = &self.functions[index];
        if is_declaration(func) {
            return Err(IrError::NotADefinition {
                module: self.name.clone(),
                function: name.to_string(),
            });
        }

        let mut rewrites = vec![];
        for block in func.layout.blocks() {
            for inst in func.layout.block_insts(block) {
                let InstructionData::Call {
                    opcode,
                    ref args,
                    func_ref,
                } = func.dfg.insts[inst]
                else {
                    continue;
                };
                let Some(user) = user_name(func, func_ref) else {
                    continue;
                };
                let Reference::Foreign { symbol, .. } = self.resolve(&user) else {
                    continue;
                };
                let callee = self.find(&symbol)?;
                let imported = &func.dfg.signatures[func.dfg.ext_funcs[func_ref].signature];
                if imported != &callee.signature {
                    return Err(IrError::SignatureMismatch {
                        function: symbol,
                        expected: callee.signature.clone(),
                        found: imported.clone(),
                    });
                }
                rewrites.push(CallRewrite {
                    inst,
                    opcode,
                    args: args.as_slice(&func.dfg.value_lists).to_vec(),
                    symbol: user.index,
                    signature: callee.signature.clone(),
                });
            }
        }

        let namespace = self.id.as_u32();
        let func = &mut self.functions[index];
        let mut imported: HashMap<u32, FuncRef> = HashMap::new();
        for rewrite in &rewrites {
            let func_ref = *imported.entry(rewrite.symbol).or_insert_with(|| {
                let signature = func.dfg.signatures.push(rewrite.signature.clone());
                let name = func
                    .declare_imported_user_function(UserExternalName::new(namespace, rewrite.symbol));
                func.dfg.ext_funcs.push(ExtFuncData {
                    name: ExternalName::User(name),
                    signature,
                    colocated: false,
                })
            });
            let replace = func.dfg.replace(rewrite.inst);
            match rewrite.opcode {
                Opcode::ReturnCall => replace.return_call(func_ref, &rewrite.args),
                _ => replace.call(func_ref, &rewrite.args),
            };
            trace!("rewrote {} in %{name} to call {func_ref}", rewrite.inst);
        }
        let pruned = prune_external_functions(func);
        debug!(
            "localized {} calls in %{name}, dropping {pruned} unused imports",
            rewrites.len()
        );
        Ok(rewrites.len())
    }

    /// Every reference `func` makes into another module, as `(symbol, module name)`
    fn foreign_references(&self, func: &Function) -> Vec<(String, String)> {
        func.dfg
            .ext_funcs
            .keys()
            .filter_map(|func_ref| user_name(func, func_ref))
            .chain(symbol_value_names(func))
            .filter_map(|user| match self.resolve(&user) {
                Reference::Local(_) => None,
                Reference::Foreign { module, symbol } => Some((
                    symbol,
                    self.context
                        .module_name(module)
                        .unwrap_or_else(|| module.to_string()),
                )),
            })
            .unique()
            .collect()
    }

    /// A copy of `func` whose references are spelled as `%name` again
    fn printable(&self, func: &Function) -> Function {
        let mut printable = func.clone();
        remap_external_names(&mut printable, |symbol| match symbol {
            ExternalSymbol::User(user) => Ok::<_, std::convert::Infallible>(
                self.context
                    .symbol_name(user.index)
                    .map(NameTarget::Testcase),
            ),
            ExternalSymbol::Testcase(_) => Ok(None),
        })
        .unwrap_or_else(|never| match never {});
        printable
    }
}

struct CallRewrite {
    inst: cranelift::codegen::ir::Inst,
    opcode: Opcode,
    args: Vec<cranelift::codegen::ir::Value>,
    symbol: u32,
    signature: cranelift::codegen::ir::Signature,
}

/// Prints the module as clif text.
///
/// References into other modules print as plain `%name` and would resolve locally when the text
/// is parsed again, so each one is listed in a comment above its function.
impl Display for IrModule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for (name, func) in &self.functions {
            writeln!(f)?;
            for (symbol, module) in self.foreign_references(func) {
                writeln!(f, "; %{name}: %{symbol} is in module {module:?}")?;
            }
            write!(f, "{}", self.printable(func))?;
        }
        Ok(())
    }
}

impl Debug for IrModule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrModule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
