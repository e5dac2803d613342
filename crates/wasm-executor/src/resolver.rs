//! Name-based resolution of a module's declared imports.
//!
//! Resolution is total for a link: every import is satisfied up front, in
//! strict priority order, or the link fails.  Registered module instances
//! are consulted first; an ordered chain of fallback resolvers (e.g. host
//! intrinsics synthesized on demand) is consulted afterwards.
//!
//! ## Authors
//!
//! The Wasm Executor Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the repository root directory for
//! information on licensing and copyright.

use crate::{
    error::{FatalVmError, VmResult},
    host::StoreData,
    value::describe_func_type,
};
use log::error;
use std::{collections::BTreeMap, sync::Arc};
use wasmtime::{Extern, ExternType, Store};

/// A fallback strategy for satisfying imports that no registered module
/// provides.  Consulted in registration order; the first resolver to return
/// an object wins.
pub trait FallbackResolver: Send + Sync {
    /// Attempts to produce an object satisfying `(module_name,
    /// export_name)` with the expected type, creating it inside the given
    /// compartment if necessary.
    fn resolve(
        &self,
        store: &mut Store<StoreData>,
        module_name: &str,
        export_name: &str,
        expected: &ExternType,
    ) -> Option<Extern>;
}

/// The resolver consulted for every import declared by the main module.
pub(crate) struct ImportResolver<'a> {
    instances: &'a BTreeMap<String, BTreeMap<String, Extern>>,
    fallbacks: &'a [Arc<dyn FallbackResolver>],
}

impl<'a> ImportResolver<'a> {
    pub(crate) fn new(
        instances: &'a BTreeMap<String, BTreeMap<String, Extern>>,
        fallbacks: &'a [Arc<dyn FallbackResolver>],
    ) -> Self {
        Self {
            instances,
            fallbacks,
        }
    }

    /// Resolves one import.
    ///
    /// A registered module that exports the name under the wrong type is a
    /// configuration error and fails immediately; a registered module that
    /// merely lacks the name falls through to the fallback chain.
    pub(crate) fn resolve(
        &self,
        store: &mut Store<StoreData>,
        module_name: &str,
        export_name: &str,
        expected: &ExternType,
    ) -> VmResult<Extern> {
        if let Some(exports) = self.instances.get(module_name) {
            if let Some(object) = exports.get(export_name) {
                let actual = object.ty(&*store);
                if extern_type_matches(&actual, expected) {
                    return Ok(object.clone());
                }
                let err = FatalVmError::ImportTypeMismatch {
                    module_name: module_name.to_string(),
                    export_name: export_name.to_string(),
                    actual: describe_extern_type(&actual),
                    expected: describe_extern_type(expected),
                };
                error!("{}", err);
                return Err(err);
            }
        }
        for fallback in self.fallbacks {
            if let Some(object) = fallback.resolve(store, module_name, export_name, expected) {
                return Ok(object);
            }
        }
        let err = FatalVmError::MissingImport {
            module_name: module_name.to_string(),
            export_name: export_name.to_string(),
            expected: describe_extern_type(expected),
        };
        error!("{}", err);
        Err(err)
    }
}

/// Checks an import candidate's type against the declared import type.
///
/// Functions and globals must match exactly; memories and tables only need
/// to be of the right class, since their limits are checked by the runtime
/// at instantiation.
fn extern_type_matches(actual: &ExternType, expected: &ExternType) -> bool {
    match (actual, expected) {
        (ExternType::Func(a), ExternType::Func(e)) => {
            a.params().eq(e.params()) && a.results().eq(e.results())
        }
        (ExternType::Global(a), ExternType::Global(e)) => {
            a.content() == e.content() && a.mutability() == e.mutability()
        }
        (ExternType::Memory(_), ExternType::Memory(_)) => true,
        (ExternType::Table(_), ExternType::Table(_)) => true,
        _otherwise => false,
    }
}

/// Renders an extern type for diagnostics.
pub(crate) fn describe_extern_type(ty: &ExternType) -> String {
    match ty {
        ExternType::Func(func) => format!("func {}", describe_func_type(func)),
        ExternType::Global(global) => format!("global {:?}", global.content()),
        ExternType::Memory(_) => "memory".to_string(),
        ExternType::Table(_) => "table".to_string(),
    }
}
