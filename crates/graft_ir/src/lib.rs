//! Modules of cranelift IR functions, and splicing functions from one module into another.
//!
//! Modules are read from clif text through an [IrContext]. Every reference a function body
//! makes is interned into the context and tagged with the module it resolves in, so a body
//! cloned into another module can be told apart from the module's own code until its calls
//! are [localized](IrModule::localize_calls).

mod context;
pub mod error;
mod module;
pub mod names;
mod splice;

pub use context::IrContext;
pub use error::{IrError, IrResult, VerifyError};
pub use module::{is_declaration, IrModule, ModuleId, Reference};
pub use splice::SplicePlan;
