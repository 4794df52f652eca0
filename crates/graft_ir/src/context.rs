//! The context shared by every module taking part in a splice

use crate::error::{IrError, IrResult};
use crate::module::{IrModule, ModuleId};
use crate::names::{remap_external_names, ExternalSymbol, NameTarget};
use cranelift::codegen::ir::{UserExternalName, UserFuncName};
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Owns the symbol table that function references are interned into.
///
/// Cloning a context is cheap, clones share the same symbols. Modules can only be spliced
/// together when they come from the same context.
#[derive(Clone, Default)]
pub struct IrContext {
    inner: Arc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    symbols: RwLock<IndexSet<String>>,
    modules: RwLock<HashMap<ModuleId, String>>,
    next_module: AtomicU32,
}

impl IrContext {
    /// Creates a context with no symbols
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a function name, returning its symbol index
    pub fn intern(&self, name: &str) -> u32 {
        if let Some(index) = self.inner.symbols.read().get_index_of(name) {
            return index as u32;
        }
        let (index, _) = self.inner.symbols.write().insert_full(name.to_string());
        index as u32
    }

    /// Gets the name of an interned symbol
    pub fn symbol_name(&self, index: u32) -> Option<String> {
        self.inner
            .symbols
            .read()
            .get_index(index as usize)
            .cloned()
    }

    /// Whether two handles refer to the same context
    pub fn same_as(&self, other: &IrContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Gets the name a module was created with
    pub fn module_name(&self, id: ModuleId) -> Option<String> {
        self.inner.modules.read().get(&id).cloned()
    }

    fn register_module(&self, name: &str) -> ModuleId {
        // namespace 0 is left to the jit
        let id = ModuleId::new(self.inner.next_module.fetch_add(1, Ordering::Relaxed) + 1);
        self.inner.modules.write().insert(id, name.to_string());
        id
    }

    /// Reads a module from a `.clif` file and verifies it.
    ///
    /// The module is named after the file stem.
    pub fn read_module<P: AsRef<Path>>(&self, path: P) -> IrResult<IrModule> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| IrError::Io(path.to_path_buf(), e))?;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let module = self.parse_module(&name, &text)?;
        module.verify()?;
        debug!(
            "read module {name:?} from {path:?} with {} functions",
            module.functions().count()
        );
        Ok(module)
    }

    /// Parses clif text into a module, without verifying it.
    pub fn parse_module(&self, name: &str, text: &str) -> IrResult<IrModule> {
        let parsed = cranelift_reader::parse_functions(text).map_err(|e| IrError::Parse {
            module: name.to_string(),
            line: e.location.line_number,
            message: e.message,
        })?;

        let id = self.register_module(name);
        let mut functions = IndexMap::with_capacity(parsed.len());
        for mut func in parsed {
            let fn_name = match &func.name {
                UserFuncName::Testcase(_) => testcase_name(&func.name.to_string()),
                other => return Err(IrError::UnnamedFunction(other.to_string())),
            };

            remap_external_names(&mut func, |symbol| match symbol {
                ExternalSymbol::Testcase(symbol) => Ok(Some(NameTarget::User(
                    UserExternalName::new(id.as_u32(), self.intern(symbol)),
                ))),
                ExternalSymbol::User(user) => Err(IrError::NumberedExternalName {
                    function: fn_name.clone(),
                    name: format!("u{}:{}", user.namespace, user.index),
                }),
            })?;

            trace!("parsed %{fn_name} into module {name:?}");
            if functions.insert(fn_name.clone(), func).is_some() {
                return Err(IrError::DuplicateFunction {
                    module: name.to_string(),
                    function: fn_name,
                });
            }
        }

        Ok(IrModule::new(self.clone(), id, name.to_string(), functions))
    }
}

impl Debug for IrContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrContext")
            .field("symbols", &self.inner.symbols.read().len())
            .field("modules", &self.inner.modules.read().len())
            .finish_non_exhaustive()
    }
}

/// Strips the `%` sigil cranelift prints in front of testcase names
pub(crate) fn testcase_name(displayed: &str) -> String {
    displayed
        .strip_prefix('%')
        .unwrap_or(displayed)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use test_log::test;

    #[test]
    fn test_intern_is_stable() {
        let context = IrContext::new();
        let foo = context.intern("foo");
        let bar = context.intern("bar");
        assert_ne!(foo, bar);
        assert_eq!(context.intern("foo"), foo);
        assert_eq!(context.symbol_name(bar).as_deref(), Some("bar"));
        assert_eq!(context.symbol_name(100), None);
    }

    #[test]
    fn test_clones_share_symbols() {
        let context = IrContext::new();
        let clone = context.clone();
        let index = clone.intern("shared");
        assert!(context.same_as(&clone));
        assert!(!context.same_as(&IrContext::new()));
        assert_eq!(context.symbol_name(index).as_deref(), Some("shared"));
    }

    #[test]
    fn test_parse_module() {
        let context = IrContext::new();
        let module = context
            .parse_module(
                "m",
                r#"
function %inc(i64) -> i64 {
block0(v0: i64):
    v1 = iadd_imm v0, 1
    return v1
}

function %twice(i64) -> i64 {
    fn0 = %inc(i64) -> i64
block0(v0: i64):
    v1 = call fn0(v0)
    v2 = call fn0(v1)
    return v2
}
"#,
            )
            .expect("could not parse");
        let names = module.functions().map(|(name, _)| name).collect::<Vec<_>>();
        assert_eq!(names, ["inc", "twice"]);
        assert_ne!(module.id().as_u32(), 0);
        module.verify().expect("module should be valid");
    }

    #[test]
    fn test_module_ids_are_unique() {
        let context = IrContext::new();
        let a = context.parse_module("a", "").unwrap();
        let b = context.parse_module("b", "").unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(context.module_name(b.id()).as_deref(), Some("b"));
    }

    #[test]
    fn test_parse_error_reports_line() {
        let context = IrContext::new();
        let error = context
            .parse_module(
                "broken",
                "function %f() {\nblock0:\n    v0 = not_an_instruction\n}\n",
            )
            .expect_err("should not parse");
        match error {
            IrError::Parse { module, line, .. } => {
                assert_eq!(module, "broken");
                assert_eq!(line, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_function() {
        let context = IrContext::new();
        let error = context
            .parse_module(
                "dup",
                "function %f(i64) -> i64 {\n}\n\nfunction %f(i64) -> i64 {\n}\n",
            )
            .expect_err("duplicate should be rejected");
        assert!(
            matches!(error, IrError::DuplicateFunction { ref function, .. } if function == "f"),
            "got {error}"
        );
    }

    #[test]
    fn test_numbered_function_names_are_rejected() {
        let context = IrContext::new();
        let error = context
            .parse_module("numbered", "function u0:1(i64) -> i64 {\n}\n")
            .expect_err("numbered name should be rejected");
        assert!(matches!(error, IrError::UnnamedFunction(_)), "got {error}");
    }

    #[test]
    fn test_read_module_uses_file_stem() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("module-x.clif");
        let mut file = std::fs::File::create(&path)?;
        writeln!(
            file,
            "function %id(i64) -> i64 {{\nblock0(v0: i64):\n    return v0\n}}"
        )?;
        drop(file);

        let module = IrContext::new().read_module(&path)?;
        assert_eq!(module.name(), "module-x");
        assert!(module.function("id").is_some());
        Ok(())
    }

    #[test]
    fn test_read_missing_module() {
        let error = IrContext::new()
            .read_module("does/not/exist.clif")
            .expect_err("file does not exist");
        assert!(matches!(error, IrError::Io(..)), "got {error}");
    }
}
