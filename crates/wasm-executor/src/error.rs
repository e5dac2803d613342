//! Fatal errors raised by the module execution adapter.
//!
//! These cover the unrecoverable conditions of the adapter: link failures,
//! guest/host contract violations and runtime traps surfaced at the call
//! boundary.  Routine outcomes (a malformed module buffer, an out-of-bounds
//! memory access, a missing optional export) are deliberately *not* errors;
//! they are signalled as `false`/`None` results instead.
//!
//! ## Authors
//!
//! The Wasm Executor Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the repository root directory for
//! information on licensing and copyright.

use err_derive::Error;

/// Result type for fallible adapter operations.
pub type VmResult<T> = Result<T, FatalVmError>;

/// Unrecoverable errors raised while linking or calling into a guest module.
///
/// *NOTE*: care should be taken when presenting these errors to users in
/// release mode: the embedded diagnostic strings can reveal details of the
/// guest module and the host configuration.
#[derive(Debug, Error)]
pub enum FatalVmError {
    /// An import declared by the guest module could not be satisfied by any
    /// registered module or fallback resolver.
    #[error(
        display = "FatalVmError: Failed to link module due to a missing import: {}.{} {}.",
        module_name,
        export_name,
        expected
    )]
    MissingImport {
        /// The import's module namespace.
        module_name: String,
        /// The name of the import within the namespace.
        export_name: String,
        /// A rendering of the expected type.
        expected: String,
    },
    /// An import resolved to an object of the wrong type.  This is a
    /// configuration error, not a missing import, and never falls through to
    /// later resolvers.
    #[error(
        display = "FatalVmError: Failed to link module due to a type mismatch in an import: {}.{} {} but was expecting type: {}.",
        module_name,
        export_name,
        actual,
        expected
    )]
    ImportTypeMismatch {
        /// The import's module namespace.
        module_name: String,
        /// The name of the import within the namespace.
        export_name: String,
        /// A rendering of the type actually found.
        actual: String,
        /// A rendering of the expected type.
        expected: String,
    },
    /// The runtime failed to instantiate the module after its imports had
    /// been resolved (e.g. the start function trapped).
    #[error(
        display = "FatalVmError: Failed to instantiate module '{}': {}.",
        debug_name,
        message
    )]
    Instantiation {
        /// The debug name supplied to `link`.
        debug_name: String,
        /// The runtime's description of the failure.
        message: String,
    },
    /// An export exists under the requested name but its type differs from
    /// the requested host signature, indicating an incompatible guest module
    /// version.
    #[error(
        display = "FatalVmError: Bad function signature for export '{}': {} but was expecting: {}.",
        function_name,
        actual,
        expected
    )]
    ExportSignatureMismatch {
        /// The name of the export that was looked up.
        function_name: String,
        /// A rendering of the export's actual type.
        actual: String,
        /// A rendering of the requested host signature.
        expected: String,
    },
    /// The host supplied arguments that do not match the signature the
    /// callable was created with.
    #[error(
        display = "FatalVmError: Bad arguments passed to function '{}': expected {}.",
        function_name,
        expected
    )]
    BadArguments {
        /// The name of the function being invoked.
        function_name: String,
        /// A rendering of the expected signature.
        expected: String,
    },
    /// Guest code faulted during an invocation.  The trap has been caught at
    /// the call boundary; the adapter remains usable.
    #[error(
        display = "FatalVmError: Function '{}' failed: {}.",
        function_name,
        description
    )]
    RuntimeTrap {
        /// The name of the export that was being invoked.
        function_name: String,
        /// A human-readable description of the fault.
        description: String,
    },
    /// Any other error reported by the underlying execution runtime.
    #[error(display = "FatalVmError: Runtime error: {}.", _0)]
    RuntimeError(String),
}

impl From<anyhow::Error> for FatalVmError {
    fn from(error: anyhow::Error) -> Self {
        FatalVmError::RuntimeError(format!("{:#}", error))
    }
}
