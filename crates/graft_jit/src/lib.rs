//! Used for running spliced modules as native code in this process

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::fmt::{Debug, Formatter};

use cranelift::codegen::ir::{Function, GlobalValueData, Signature, UserExternalName};
use cranelift::codegen::isa::CallConv;
use cranelift::codegen::settings::{self, Configurable, SetError};
use cranelift::codegen::{self, CodegenError};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module, ModuleError};
use tracing::{debug, info, trace};

use graft_ir::names::{
    remap_external_names, symbol_value_names, used_func_refs, user_name, ExternalSymbol,
    NameTarget,
};
use graft_ir::{is_declaration, IrError, IrModule, Reference};

mod native;

pub use native::{NativeFunction, NativeReturn, NativeType};

/// How hard cranelift optimizes compiled functions
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, strum::EnumString, strum::Display, strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

/// Settings used for creating a [JitSession]
#[derive(Debug, Default)]
pub struct JitConfig {
    /// the optimization level handed to cranelift
    pub opt_level: OptLevel,
    symbols: HashMap<String, *const u8>,
}

impl JitConfig {
    /// Sets the optimization level
    pub fn opt_level(mut self, opt_level: OptLevel) -> Self {
        self.opt_level = opt_level;
        self
    }

    /// Makes declarations named `name` resolve to `address`
    pub fn symbol(mut self, name: impl Into<String>, address: *const u8) -> Self {
        self.symbols.insert(name.into(), address);
        self
    }
}

/// Compiles a verified [IrModule] into machine code and hands out its functions.
///
/// Compiled code is never freed, so function pointers stay valid for the rest of the process.
pub struct JitSession {
    /// The main [cranelift] context, reused for every defined function.
    ctx: codegen::Context,
    /// The module, with the jit backend, which manages the JIT'd functions.
    module: JITModule,
    func_ids: HashMap<String, FuncId>,
    host_symbols: HashSet<String>,
}

impl Debug for JitSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitSession")
            .field("functions", &self.func_ids.len())
            .finish_non_exhaustive()
    }
}

impl JitSession {
    /// Creates a session targeting the host machine
    pub fn new(config: JitConfig) -> JitResult<Self> {
        let mut flag_builder = settings::builder();
        flag_builder.set("use_colocated_libcalls", "false")?;
        flag_builder.set("is_pic", "false")?;
        flag_builder.set("opt_level", config.opt_level.as_ref())?;
        let isa_builder = cranelift_native::builder()
            .map_err(|msg| JitError::UnsupportedHost(msg.to_string()))?;
        let isa = isa_builder.finish(settings::Flags::new(flag_builder))?;
        debug!(
            "created {} isa with opt level {}",
            isa.triple(),
            config.opt_level
        );

        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        for (name, address) in &config.symbols {
            trace!("registering host symbol {name:?} at {address:?}");
            builder.symbol(name.clone(), *address);
        }
        let module = JITModule::new(builder);
        Ok(Self {
            ctx: module.make_context(),
            module,
            func_ids: HashMap::new(),
            host_symbols: config.symbols.into_keys().collect(),
        })
    }

    /// Verifies `ir` then compiles every function it defines.
    ///
    /// Declarations are imported, and must name a host symbol when a defined function uses them.
    pub fn load(&mut self, ir: &IrModule) -> JitResult<()> {
        ir.verify()?;
        let call_conv = self.module.isa().default_call_conv();

        let mut func_ids = HashMap::new();
        for (name, func) in ir.functions() {
            let linkage = if is_declaration(func) {
                Linkage::Import
            } else {
                Linkage::Export
            };
            let mut signature = func.signature.clone();
            signature.call_conv = host_call_conv(signature.call_conv, call_conv);
            let id = self.module.declare_function(name, linkage, &signature)?;
            trace!("declared %{name} as {id} with {linkage:?} linkage");
            func_ids.insert(name.to_string(), id);
        }

        for (name, func) in ir.functions() {
            if is_declaration(func) {
                continue;
            }
            self.check_imports(ir, name, func)?;
            self.ctx.func = link(ir, func, &func_ids, call_conv);
            trace!("defining %{name}:\n{}", self.ctx.func);
            let id = func_ids[name];
            let defined = self.module.define_function(id, &mut self.ctx);
            self.module.clear_context(&mut self.ctx);
            defined.map_err(|source| JitError::Define {
                function: name.to_string(),
                source,
            })?;
        }

        self.module.finalize_definitions()?;
        info!(
            "compiled {} functions of module {:?}",
            ir.functions().filter(|(_, func)| !is_declaration(func)).count(),
            ir.name()
        );
        self.func_ids.extend(func_ids);
        Ok(())
    }

    /// Every declaration `func` uses must be a host symbol, cranelift-jit panics on symbols it
    /// can not find
    fn check_imports(&self, ir: &IrModule, name: &str, func: &Function) -> JitResult<()> {
        let referenced = used_func_refs(func)
            .into_iter()
            .filter_map(|func_ref| user_name(func, func_ref))
            .chain(symbol_value_names(func));
        for user in referenced {
            let Reference::Local(symbol) = ir.resolve(&user) else {
                continue;
            };
            if ir.is_declaration(&symbol) == Some(true) && !self.host_symbols.contains(&symbol) {
                return Err(JitError::UnresolvedSymbol {
                    function: name.to_string(),
                    symbol,
                });
            }
        }
        Ok(())
    }

    /// Gets a compiled function as a native function pointer.
    ///
    /// # Safety
    /// The function is called as native code, it must not break any of rust's memory safety
    /// rules when it runs.
    pub unsafe fn get<F: NativeFunction>(&self, name: &str) -> JitResult<F> {
        let id = *self
            .func_ids
            .get(name)
            .ok_or_else(|| JitError::UndefinedFunction(name.to_string()))?;
        let declaration = self.module.declarations().get_function_decl(id);
        if !declaration.linkage.is_definable() {
            return Err(JitError::UndefinedFunction(name.to_string()));
        }

        let signature = &declaration.signature;
        let params = signature.params.iter().map(|p| p.value_type).collect::<Vec<_>>();
        let returns = signature.returns.iter().map(|p| p.value_type).collect::<Vec<_>>();
        if params != F::param_types() || returns != F::return_types() {
            return Err(JitError::SignatureMismatch {
                function: name.to_string(),
                expected: F::describe(),
                found: signature.clone(),
            });
        }

        let host = self.module.isa().default_call_conv();
        if signature.call_conv != host {
            return Err(JitError::CallConvMismatch {
                function: name.to_string(),
                found: signature.call_conv,
                host,
            });
        }

        let code = self.module.get_finalized_function(id);
        trace!("%{name} is at {code:?}");
        Ok(F::from_code(code))
    }
}

/// Rewrites a function of `ir` so that it refers to functions of the jit module
fn link(
    ir: &IrModule,
    func: &Function,
    func_ids: &HashMap<String, FuncId>,
    call_conv: CallConv,
) -> Function {
    let mut linked = func.clone();
    linked.signature.call_conv = host_call_conv(linked.signature.call_conv, call_conv);
    for signature in linked.dfg.signatures.values_mut() {
        signature.call_conv = host_call_conv(signature.call_conv, call_conv);
    }
    for ext_func in linked.dfg.ext_funcs.values_mut() {
        ext_func.colocated = false;
    }
    for gv in linked.global_values.values_mut() {
        if let GlobalValueData::Symbol { colocated, .. } = gv {
            *colocated = false;
        }
    }

    remap_external_names(&mut linked, |symbol| {
        let ExternalSymbol::User(user) = symbol else {
            return Ok::<_, Infallible>(None);
        };
        // references nothing uses may still point elsewhere, they never reach a relocation
        let Reference::Local(symbol) = ir.resolve(user) else {
            return Ok(None);
        };
        Ok(func_ids
            .get(&symbol)
            .map(|id| NameTarget::User(UserExternalName::new(0, id.as_u32()))))
    })
    .unwrap_or_else(|never| match never {});
    linked
}

/// Clif text defaults to `fast`, which becomes the host convention so that functions can be
/// called from rust. Any other convention, such as `tail`, is kept.
fn host_call_conv(written: CallConv, host: CallConv) -> CallConv {
    match written {
        CallConv::Fast => host,
        other => other,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("host machine is not supported: {0}")]
    UnsupportedHost(String),
    #[error(transparent)]
    Setting(#[from] SetError),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error(transparent)]
    ModuleError(#[from] ModuleError),
    #[error("could not compile %{function}: {source}")]
    Define {
        function: String,
        #[source]
        source: ModuleError,
    },
    #[error(transparent)]
    Ir(#[from] IrError),
    #[error("%{function} uses %{symbol}, which is only declared and has no host symbol")]
    UnresolvedSymbol { function: String, symbol: String },
    #[error("Function {0:?} is not defined")]
    UndefinedFunction(String),
    #[error("%{function} uses the {found} calling convention, only {host} functions can be called")]
    CallConvMismatch {
        function: String,
        found: CallConv,
        host: CallConv,
    },
    #[error("%{function} has signature `{found}`, not `{expected}`")]
    SignatureMismatch {
        function: String,
        expected: String,
        found: Signature,
    },
}

pub type JitResult<T> = std::result::Result<T, JitError>;
