//! A sandboxed WebAssembly module execution adapter.
//!
//! This library sits at the trust boundary between a supervising host and
//! untrusted guest modules.  It loads a module from its binary or textual
//! encoding, links its imports against host-registered functions and a
//! chain of fallback resolvers inside an isolated compartment, exposes the
//! guest's linear memory through bounds-checked accessors, and marshals
//! typed calls across the boundary in both directions.  A linked adapter
//! can be forked cheaply, one fork per concurrent worker, without
//! recompiling the module.
//!
//! The WebAssembly validator, compiler and instruction semantics are the
//! responsibility of the underlying execution runtime; this crate only
//! drives it.
//!
//! ## Authors
//!
//! The Wasm Executor Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the repository root directory for
//! information on licensing and copyright.

mod error;
mod host;
mod loader;
mod memory;
mod resolver;
mod value;
mod vm;

pub use error::{FatalVmError, VmResult};
pub use host::{CallContext, HostCallContext, StoreData};
pub use loader::PRECOMPILED_SECTION_NAME;
pub use memory::{GuestMemory, WASM_PAGE_SIZE};
pub use resolver::FallbackResolver;
pub use value::{Signature, ValueKind, WasmValue, Word, WORD_SIZE};
pub use vm::{GuestFunction, WasmVm};

// Re-exported so fallback resolvers can be written against the same runtime
// types the adapter uses.
pub use wasmtime;
