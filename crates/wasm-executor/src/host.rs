//! Host-side import functions and the per-call execution context.
//!
//! Host functions are registered before `link` under a named virtual import
//! module, as a signature descriptor plus an owned closure; at link time each
//! accumulated module is materialised into a set of runtime-callable
//! intrinsics.  Every intrinsic receives a [`HostCallContext`] as an implicit
//! first parameter, through which it can recover the ambient call context
//! installed by the invoking export call and access the guest's linear
//! memory.
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
    memory::{range_in_bounds, GuestMemory, WASM_PAGE_SIZE},
    value::{Signature, WasmValue},
};
use anyhow::{anyhow, Result};
use std::{
    any::Any,
    collections::BTreeMap,
    sync::Arc,
};
use wasmtime::{Caller, Extern, Func, Memory, Store};

////////////////////////////////////////////////////////////////////////////////
// Per-call state carried inside the compartment's store.
////////////////////////////////////////////////////////////////////////////////

/// An opaque, cheaply-cloneable handle identifying the logical caller of an
/// export invocation (e.g. "which request is this").  The adapter never
/// inspects it; host functions downcast it to whatever they registered.
pub type CallContext = Arc<dyn Any + Send + Sync>;

/// Host-side state carried inside a compartment's store: the ambient call
/// context of the invocation currently in flight, and the instance's default
/// linear memory once linked.
#[derive(Default)]
pub struct StoreData {
    /// The context of the export call currently in flight, if any.  Installed
    /// on entry to an export invocation and restored on every exit path.
    pub(crate) context: Option<CallContext>,
    /// The default linear memory of the linked instance.
    pub(crate) memory: Option<Memory>,
    /// Set while a fork re-instantiates the module in this compartment.
    /// Instantiation re-runs the module's start function, but its
    /// host-visible effects already happened in the source compartment and
    /// must not be observed a second time.
    pub(crate) start_muted: bool,
}

////////////////////////////////////////////////////////////////////////////////
// The implicit first parameter of every host function.
////////////////////////////////////////////////////////////////////////////////

/// The per-call execution context handed to a host function.
///
/// Grants access to the ambient [`CallContext`] of the export invocation
/// that (transitively) triggered this host call, and bounds-checked access
/// to the guest's linear memory.
pub struct HostCallContext<'a, 'b> {
    caller: &'a mut Caller<'b, StoreData>,
}

impl<'a, 'b> HostCallContext<'a, 'b> {
    pub(crate) fn new(caller: &'a mut Caller<'b, StoreData>) -> Self {
        Self { caller }
    }

    /// The ambient call context installed by the in-flight export
    /// invocation, if one was supplied.
    pub fn call_context(&self) -> Option<CallContext> {
        self.caller.data().context.clone()
    }
}

impl GuestMemory for HostCallContext<'_, '_> {
    fn memory_size(&self) -> u64 {
        match self.caller.data().memory {
            Some(memory) => memory.size(&*self.caller) * WASM_PAGE_SIZE,
            None => 0,
        }
    }

    fn read_memory(&self, pointer: u64, length: u64) -> Option<Vec<u8>> {
        let memory = self.caller.data().memory?;
        let data = memory.data(&*self.caller);
        if !range_in_bounds(pointer, length, data.len() as u64) {
            return None;
        }
        Some(data[pointer as usize..(pointer + length) as usize].to_vec())
    }

    fn write_memory(&mut self, pointer: u64, data: &[u8]) -> bool {
        let memory = match self.caller.data().memory {
            Some(memory) => memory,
            None => return false,
        };
        let bytes = memory.data_mut(&mut *self.caller);
        if !range_in_bounds(pointer, data.len() as u64, bytes.len() as u64) {
            return false;
        }
        bytes[pointer as usize..pointer as usize + data.len()].copy_from_slice(data);
        true
    }
}

////////////////////////////////////////////////////////////////////////////////
// Host functions and their per-module accumulation.
////////////////////////////////////////////////////////////////////////////////

/// The owned body of a registered host function.
pub(crate) type HostFunctionBody =
    dyn Fn(&mut HostCallContext, &[WasmValue]) -> Result<Option<WasmValue>> + Send + Sync;

/// A host function registered for import by guest code: a signature
/// descriptor plus an owned closure.
///
/// One runtime-polymorphic representation covers every arity; the signature
/// drives argument unpacking and result packing at call time.
pub(crate) struct HostFunction {
    signature: Signature,
    body: Arc<HostFunctionBody>,
}

impl HostFunction {
    /// Wraps a closure and its declared signature.
    pub(crate) fn new(
        signature: Signature,
        body: impl Fn(&mut HostCallContext, &[WasmValue]) -> Result<Option<WasmValue>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            signature,
            body: Arc::new(body),
        }
    }

    /// Synthesizes a runtime-callable intrinsic for this host function in
    /// the given compartment.  Untagged guest arguments are decoded by the
    /// declared signature, the call context is attached, and the result is
    /// re-encoded; an error returned by the body becomes a guest-visible
    /// trap.
    pub(crate) fn materialize(&self, store: &mut Store<StoreData>, name: &str) -> Func {
        let signature = self.signature.clone();
        let body = Arc::clone(&self.body);
        let name = name.to_string();
        Func::new(
            &mut *store,
            signature.wire_type(),
            move |mut caller, params, results| {
                if caller.data().start_muted {
                    if let Some(kind) = signature.ret() {
                        results[0] = kind.zero_wire();
                    }
                    return Ok(());
                }
                let mut arguments = Vec::with_capacity(signature.params().len());
                for (kind, value) in signature.params().iter().zip(params) {
                    let argument = WasmValue::from_wire(*kind, value).ok_or_else(|| {
                        anyhow!("host function '{}': malformed argument", name)
                    })?;
                    arguments.push(argument);
                }
                let mut context = HostCallContext::new(&mut caller);
                let returned = body(&mut context, &arguments)?;
                match (signature.ret(), returned) {
                    (Some(kind), Some(value)) if value.kind() == kind => {
                        results[0] = value.to_wire();
                        Ok(())
                    }
                    (Some(kind), other) => Err(anyhow!(
                        "host function '{}': expected a {} result, got {:?}",
                        name,
                        kind,
                        other
                    )),
                    (None, _) => Ok(()),
                }
            },
        )
    }
}

/// A per-module-name accumulation of host functions, not yet bound to any
/// compartment.  Registrations become resolvable module instances at link
/// time, and are re-materialised into the new compartment on every fork.
#[derive(Default)]
pub(crate) struct ImportRegistry {
    modules: BTreeMap<String, Vec<(String, HostFunction)>>,
}

impl ImportRegistry {
    /// Accumulates a host function under `(module_name, function_name)`.
    pub(crate) fn register(
        &mut self,
        module_name: &str,
        function_name: &str,
        function: HostFunction,
    ) {
        self.modules
            .entry(module_name.to_string())
            .or_default()
            .push((function_name.to_string(), function));
    }

    /// Instantiates every accumulated import module in the given
    /// compartment, producing the name map consulted by the import resolver.
    pub(crate) fn materialize(
        &self,
        store: &mut Store<StoreData>,
    ) -> BTreeMap<String, BTreeMap<String, Extern>> {
        let mut instances = BTreeMap::new();
        for (module_name, functions) in &self.modules {
            let mut exports = BTreeMap::new();
            for (function_name, function) in functions {
                let func = function.materialize(store, function_name);
                exports.insert(function_name.clone(), Extern::Func(func));
            }
            instances.insert(module_name.clone(), exports);
        }
        instances
    }
}
