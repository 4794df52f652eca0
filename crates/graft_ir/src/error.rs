//! Errors produced while reading, splicing and verifying modules

use cranelift::codegen::ir::Signature;
use itertools::Itertools as _;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A problem found while verifying a single module
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The cranelift verifier rejected a function body
    #[error("function %{function} failed verification:\n{report}")]
    Function { function: String, report: String },
    /// A body refers to a function that lives in another module
    #[error("function %{function} references %{symbol} from module {module:?}")]
    ForeignReference {
        function: String,
        symbol: String,
        module: String,
    },
    /// A body refers to a function this module neither defines nor declares
    #[error("function %{function} references undefined function %{symbol}")]
    UndefinedSymbol { function: String, symbol: String },
    /// An imported signature does not agree with the callee
    #[error("function %{function} imports %{symbol} as `{imported}` but it is `{actual}`")]
    SignatureMismatch {
        function: String,
        symbol: String,
        imported: Signature,
        actual: Signature,
    },
}

/// An error occurred while working on IR modules
#[derive(Debug, Error)]
pub enum IrError {
    #[error("could not read {0:?}: {1}")]
    Io(PathBuf, #[source] io::Error),
    #[error("{module}:{line}: {message}")]
    Parse {
        module: String,
        line: usize,
        message: String,
    },
    #[error("function {0} must be named with a `%name`")]
    UnnamedFunction(String),
    #[error("function %{function} uses numbered external name {name}, only `%name` references are supported")]
    NumberedExternalName { function: String, name: String },
    #[error("module {module:?} defines %{function} more than once")]
    DuplicateFunction { module: String, function: String },
    #[error("module {module:?} has no function %{function}")]
    FunctionNotFound { module: String, function: String },
    #[error("%{function} in module {module:?} is not a declaration")]
    NotADeclaration { module: String, function: String },
    #[error("%{function} in module {module:?} has no body")]
    NotADefinition { module: String, function: String },
    #[error("module {module:?} already contains %{function}")]
    AlreadyDefined { module: String, function: String },
    #[error("%{function} has signature `{expected}` in the target but `{found}` in the source")]
    SignatureMismatch {
        function: String,
        expected: Signature,
        found: Signature,
    },
    #[error("module {0:?} and module {1:?} were not created by the same context")]
    ContextMismatch(String, String),
    #[error("module {module:?} is invalid:\n{}", .errors.iter().join("\n"))]
    Verify {
        module: String,
        errors: Vec<VerifyError>,
    },
}

/// A type alias for results of IR operations
pub type IrResult<T> = Result<T, IrError>;
