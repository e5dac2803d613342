//! The compartment/instance manager: the adapter's public surface.
//!
//! A [`WasmVm`] owns one isolated compartment: the compiled module, the
//! linked instance, its default linear memory and the execution state used
//! to call into it.  The lifecycle is strict: `load` exactly once, then
//! `link` exactly once, then any number of export invocations, memory
//! accesses and forks.  Out-of-order use is a programming error in the
//! embedding host and aborts; guest-triggered faults never do.
//!
//! Within one compartment only one call may be in flight at a time.  The
//! supported concurrency model is fork-per-concurrent-user: link once, then
//! [`WasmVm::fork`] once per worker.  Forks share the compiled code but no
//! mutable state.
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
    host::{CallContext, HostCallContext, HostFunction, ImportRegistry, StoreData},
    loader::{self, PRECOMPILED_SECTION_NAME},
    memory::{range_in_bounds, GuestMemory, WASM_PAGE_SIZE},
    resolver::{FallbackResolver, ImportResolver},
    value::{describe_func_type, Signature, WasmValue},
};
use anyhow::Result;
use log::{error, info};
use std::{collections::BTreeMap, mem, sync::Arc};
use wasmtime::{
    Config, Engine, Extern, Func, Global, Instance, Memory, Module, Mutability, Store, Trap, Val,
};

////////////////////////////////////////////////////////////////////////////////
// Lifecycle.
////////////////////////////////////////////////////////////////////////////////

/// The adapter's lifecycle stage.  Transitions run strictly forwards.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Stage {
    Unloaded,
    Loaded,
    Linked,
}

////////////////////////////////////////////////////////////////////////////////
// The adapter.
////////////////////////////////////////////////////////////////////////////////

/// A sandboxed WebAssembly module execution adapter.
pub struct WasmVm {
    stage: Stage,
    engine: Engine,
    /// The compartment: every live runtime object derived from this load
    /// (instance, memory, synthesized intrinsics) lives inside this store
    /// and is released with it.
    store: Store<StoreData>,
    /// The canonical binary encoding of the loaded module, retained
    /// orthogonally to the live instance for custom-section lookup.
    canonical_binary: Vec<u8>,
    /// The validated, compiled module.  Reference-counted by the runtime;
    /// forks share it without recompilation.
    module: Option<Module>,
    instance: Option<Instance>,
    /// The instance's default linear memory, if it exports one.
    memory: Option<Memory>,
    /// Host functions accumulated before `link`, keyed by import module
    /// name.
    imports: Arc<ImportRegistry>,
    /// The import-module instances materialised at link time.
    import_instances: BTreeMap<String, BTreeMap<String, Extern>>,
    fallbacks: Vec<Arc<dyn FallbackResolver>>,
    debug_name: String,
}

/// A callable handle to a guest export, produced by
/// [`WasmVm::get_exported_function`] after a successful signature check.
///
/// The handle is only valid for the adapter instance that produced it; a
/// fork has its own compartment and requires a fresh lookup.
pub struct GuestFunction {
    name: String,
    func: Func,
    signature: Signature,
}

impl WasmVm {
    /// Creates a new adapter in the `Unloaded` stage.
    pub fn new() -> VmResult<Self> {
        let mut config = Config::new();
        config.wasm_simd(true);
        let engine = Engine::new(&config).map_err(FatalVmError::from)?;
        let store = Store::new(&engine, StoreData::default());
        Ok(Self {
            stage: Stage::Unloaded,
            engine,
            store,
            canonical_binary: Vec::new(),
            module: None,
            instance: None,
            memory: None,
            imports: Arc::new(ImportRegistry::default()),
            import_instances: BTreeMap::new(),
            fallbacks: Vec::new(),
            debug_name: String::new(),
        })
    }

    /// The fixed name of the custom section holding a precompiled object
    /// blob.
    pub fn precompiled_section_name() -> &'static str {
        PRECOMPILED_SECTION_NAME
    }

    ////////////////////////////////////////////////////////////////////////////
    // Loading.
    ////////////////////////////////////////////////////////////////////////////

    /// Loads a module from `bytes`, in either the binary or the textual
    /// encoding.
    ///
    /// Returns `false`, after logging a diagnostic, if the buffer is
    /// malformed in either form; the caller decides whether to retry with
    /// other input or abort.  When `allow_precompiled` is set and the module
    /// carries a precompiled-object custom section, the runtime's artifact
    /// is deserialised from it instead of compiling from scratch.
    ///
    /// Calling `load` twice on one adapter is a programming error and
    /// aborts.
    pub fn load(&mut self, bytes: &[u8], allow_precompiled: bool) -> bool {
        assert!(
            self.stage == Stage::Unloaded,
            "load may only be called once per adapter instance"
        );
        let binary = match loader::canonicalize_module(bytes) {
            Ok(binary) => binary,
            Err(e) => {
                error!("Failed to parse module: {:#}.", e);
                return false;
            }
        };

        let precompiled = if allow_precompiled {
            loader::custom_section(&binary, PRECOMPILED_SECTION_NAME)
        } else {
            None
        };
        let module = match precompiled {
            // The blob is a cache hint whose internal format is owned by the
            // execution runtime; `allow_precompiled` asserts the embedder
            // trusts its provenance.
            Some(blob) => unsafe { Module::deserialize(&self.engine, blob) },
            None => Module::new(&self.engine, &binary),
        };
        match module {
            Ok(module) => {
                info!(
                    "Module loaded: {} bytes, precompiled: {}.",
                    binary.len(),
                    precompiled.is_some()
                );
                self.canonical_binary = binary;
                self.module = Some(module);
                self.stage = Stage::Loaded;
                true
            }
            Err(e) => {
                error!("Failed to compile module: {:#}.", e);
                false
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Import registration.
    ////////////////////////////////////////////////////////////////////////////

    /// Registers a host function under `(module_name, function_name)` for
    /// import by guest code.
    ///
    /// Registrations under one module name accumulate and become a genuine,
    /// resolvable module instance at `link` time; they are not callable
    /// before that.  Must be called before `link`.
    pub fn register_host_function(
        &mut self,
        module_name: &str,
        function_name: &str,
        signature: Signature,
        body: impl Fn(&mut HostCallContext, &[WasmValue]) -> Result<Option<WasmValue>>
            + Send
            + Sync
            + 'static,
    ) {
        assert!(
            self.stage != Stage::Linked,
            "host functions must be registered before link"
        );
        let registry = Arc::get_mut(&mut self.imports)
            .expect("import registry is not shared before link");
        registry.register(module_name, function_name, HostFunction::new(signature, body));
    }

    /// Appends a fallback resolver to the resolution chain.  Fallbacks are
    /// consulted, in registration order, for imports that no registered
    /// module satisfies.  Must be called before `link`.
    pub fn add_fallback_resolver(&mut self, resolver: Arc<dyn FallbackResolver>) {
        assert!(
            self.stage != Stage::Linked,
            "fallback resolvers must be registered before link"
        );
        self.fallbacks.push(resolver);
    }

    ////////////////////////////////////////////////////////////////////////////
    // Linking.
    ////////////////////////////////////////////////////////////////////////////

    /// Links the loaded module: materialises every registered import module
    /// inside the compartment, resolves all declared imports up front, and
    /// instantiates.  Captures the instance's default linear memory.
    ///
    /// Any unresolved or mis-typed import is fatal; the adapter must not be
    /// used further after a link failure.
    pub fn link(&mut self, debug_name: &str) -> VmResult<()> {
        assert!(
            self.stage == Stage::Loaded,
            "a module must be loaded exactly once before it is linked"
        );
        let module = self.module.clone().expect("module present in Loaded stage");
        let (instance, memory, import_instances) = Self::instantiate_in(
            &mut self.store,
            &module,
            &self.imports,
            &self.fallbacks,
            debug_name,
        )?;
        self.instance = Some(instance);
        self.memory = memory;
        self.import_instances = import_instances;
        self.debug_name = debug_name.to_string();
        self.stage = Stage::Linked;
        info!("Module '{}' linked.", debug_name);
        Ok(())
    }

    /// Resolves and instantiates `module` inside `store`, together with the
    /// import modules accumulated in `imports`.  Shared by `link` and
    /// `fork`.
    fn instantiate_in(
        store: &mut Store<StoreData>,
        module: &Module,
        imports: &ImportRegistry,
        fallbacks: &[Arc<dyn FallbackResolver>],
        debug_name: &str,
    ) -> VmResult<(
        Instance,
        Option<Memory>,
        BTreeMap<String, BTreeMap<String, Extern>>,
    )> {
        let import_instances = imports.materialize(store);
        let resolver = ImportResolver::new(&import_instances, fallbacks);

        let mut resolved = Vec::with_capacity(module.imports().len());
        for import in module.imports() {
            let object = resolver.resolve(store, import.module(), import.name(), &import.ty())?;
            resolved.push(object);
        }

        let instance = Instance::new(&mut *store, module, &resolved).map_err(|e| {
            let err = FatalVmError::Instantiation {
                debug_name: debug_name.to_string(),
                message: format!("{:#}", e),
            };
            error!("{}", err);
            err
        })?;

        // Capture the default linear memory: the first memory export, if
        // any.  The handle is also parked in the store data so that host
        // functions can reach guest memory through their caller.
        let mut memory = None;
        for export in instance.exports(&mut *store) {
            if let Some(found) = export.into_memory() {
                memory = Some(found);
                break;
            }
        }
        store.data_mut().memory = memory;

        Ok((instance, memory, import_instances))
    }

    ////////////////////////////////////////////////////////////////////////////
    // Forking.
    ////////////////////////////////////////////////////////////////////////////

    /// Produces an independent adapter backed by a duplicate compartment.
    ///
    /// The compiled module is shared (no re-validation, no recompilation);
    /// host functions are re-materialised into the new compartment; the
    /// main module is re-instantiated there; and the current memory
    /// contents and mutable exported globals are copied across.  After the
    /// fork, writes on either side are never observable from the other, and
    /// no handle is valid across the two compartments.
    ///
    /// Re-instantiation re-runs the module's start function in the new
    /// compartment, but host function bodies are muted for its duration:
    /// initialisation effects already happened in the source compartment,
    /// and whatever guest-visible state the re-run produces is overwritten
    /// by the memory and global copy that follows.
    ///
    /// Requires the adapter to be linked.  Takes `&mut self` because
    /// traversing the source instance's exports requires mutable access to
    /// its store; the source is not semantically modified.
    pub fn fork(&mut self) -> VmResult<WasmVm> {
        assert!(self.stage == Stage::Linked, "only a linked adapter can be forked");
        let module = self.module.clone().expect("module present in Linked stage");
        let mut store = Store::new(&self.engine, StoreData::default());
        store.data_mut().start_muted = true;
        let (instance, memory, import_instances) = Self::instantiate_in(
            &mut store,
            &module,
            &self.imports,
            &self.fallbacks,
            &self.debug_name,
        )?;
        store.data_mut().start_muted = false;

        let mut fork = WasmVm {
            stage: Stage::Linked,
            engine: self.engine.clone(),
            store,
            canonical_binary: self.canonical_binary.clone(),
            module: Some(module),
            instance: Some(instance),
            memory,
            imports: Arc::clone(&self.imports),
            import_instances,
            fallbacks: self.fallbacks.clone(),
            debug_name: self.debug_name.clone(),
        };

        self.copy_memory_into(&mut fork)?;
        self.copy_globals_into(&mut fork)?;
        info!("Module '{}' forked.", self.debug_name);
        Ok(fork)
    }

    /// Copies the source compartment's current linear memory contents into
    /// the fork, growing the fork's memory to match first.
    fn copy_memory_into(&self, fork: &mut WasmVm) -> VmResult<()> {
        let (src, dst) = match (self.memory, fork.memory) {
            (Some(src), Some(dst)) => (src, dst),
            _otherwise => return Ok(()),
        };
        let src_pages = src.size(&self.store);
        let dst_pages = dst.size(&fork.store);
        if src_pages > dst_pages {
            dst.grow(&mut fork.store, src_pages - dst_pages)
                .map_err(FatalVmError::from)?;
        }
        let data = src.data(&self.store);
        dst.data_mut(&mut fork.store)[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copies the current values of mutable exported numeric globals into
    /// the fork.  Reference-typed globals are compartment-scoped and are
    /// left as re-instantiated.
    fn copy_globals_into(&mut self, fork: &mut WasmVm) -> VmResult<()> {
        let instance = self.instance.expect("instance present in Linked stage");
        let globals: Vec<(String, Global)> = instance
            .exports(&mut self.store)
            .filter_map(|export| {
                let name = export.name().to_string();
                export.into_global().map(|global| (name, global))
            })
            .collect();
        for (name, global) in globals {
            if global.ty(&self.store).mutability() != Mutability::Var {
                continue;
            }
            let value = global.get(&mut self.store);
            match value {
                Val::I32(_) | Val::I64(_) | Val::F32(_) | Val::F64(_) | Val::V128(_) => {}
                _otherwise => continue,
            }
            let target = fork
                .instance
                .expect("fork instance present")
                .get_global(&mut fork.store, &name);
            if let Some(target) = target {
                target.set(&mut fork.store, value).map_err(FatalVmError::from)?;
            }
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////
    // Export lookup and invocation.
    ////////////////////////////////////////////////////////////////////////////

    /// Locates an exported function by name and checks it against the
    /// requested host signature.
    ///
    /// An absent export yields `Ok(None)`: optional guest hooks are common
    /// and callers must check.  A present export with a different signature
    /// is a fatal, descriptive error, since the name exists but the
    /// guest/host contract is violated.
    pub fn get_exported_function(
        &mut self,
        name: &str,
        signature: &Signature,
    ) -> VmResult<Option<GuestFunction>> {
        assert!(
            self.stage == Stage::Linked,
            "exports can only be looked up after link"
        );
        let instance = self.instance.expect("instance present in Linked stage");
        let func = match instance.get_func(&mut self.store, name) {
            Some(func) => func,
            None => return Ok(None),
        };
        let actual = func.ty(&self.store);
        if !signature.matches(&actual) {
            let err = FatalVmError::ExportSignatureMismatch {
                function_name: name.to_string(),
                actual: describe_func_type(&actual),
                expected: signature.to_string(),
            };
            error!("{}", err);
            return Err(err);
        }
        Ok(Some(GuestFunction {
            name: name.to_string(),
            func,
            signature: signature.clone(),
        }))
    }

    /// Invokes a guest export previously located by
    /// [`WasmVm::get_exported_function`].
    ///
    /// Arguments are packed into the runtime's untagged representation in
    /// declared order; `context` is installed as the compartment's ambient
    /// call context for the duration of the call and the previous context is
    /// restored on every exit path.  A runtime trap is caught at this
    /// boundary and converted into a descriptive error; the adapter remains
    /// usable for subsequent calls.
    pub fn call(
        &mut self,
        function: &GuestFunction,
        context: Option<CallContext>,
        arguments: &[WasmValue],
    ) -> VmResult<Option<WasmValue>> {
        assert!(self.stage == Stage::Linked, "calls require a linked adapter");
        let kinds_match = arguments.len() == function.signature.params().len()
            && arguments
                .iter()
                .zip(function.signature.params())
                .all(|(argument, kind)| argument.kind() == *kind);
        if !kinds_match {
            let err = FatalVmError::BadArguments {
                function_name: function.name.clone(),
                expected: function.signature.to_string(),
            };
            error!("{}", err);
            return Err(err);
        }

        let params: Vec<Val> = arguments.iter().map(WasmValue::to_wire).collect();
        let mut results = vec![Val::I32(0); function.signature.ret().iter().len()];

        let saved = mem::replace(&mut self.store.data_mut().context, context);
        let outcome = function.func.call(&mut self.store, &params, &mut results);
        self.store.data_mut().context = saved;

        match outcome {
            Ok(()) => match function.signature.ret() {
                None => Ok(None),
                Some(kind) => {
                    let value = WasmValue::from_wire(kind, &results[0]).ok_or_else(|| {
                        FatalVmError::RuntimeError(format!(
                            "function '{}' returned a value of the wrong wire type",
                            function.name
                        ))
                    })?;
                    Ok(Some(value))
                }
            },
            Err(e) => {
                let description = match e.downcast_ref::<Trap>() {
                    Some(trap) => trap.to_string(),
                    None => format!("{:#}", e),
                };
                let err = FatalVmError::RuntimeTrap {
                    function_name: function.name.clone(),
                    description,
                };
                error!("{}", err);
                Err(err)
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Custom sections.
    ////////////////////////////////////////////////////////////////////////////

    /// Returns the contents of the named custom section of the loaded
    /// module, or an empty vector if the section is absent.
    pub fn get_custom_section(&self, name: &str) -> Vec<u8> {
        loader::custom_section(&self.canonical_binary, name)
            .map(|data| data.to_vec())
            .unwrap_or_default()
    }
}

impl GuestMemory for WasmVm {
    fn memory_size(&self) -> u64 {
        match self.memory {
            Some(memory) => memory.size(&self.store) * WASM_PAGE_SIZE,
            None => 0,
        }
    }

    fn read_memory(&self, pointer: u64, length: u64) -> Option<Vec<u8>> {
        let memory = self.memory?;
        let data = memory.data(&self.store);
        if !range_in_bounds(pointer, length, data.len() as u64) {
            return None;
        }
        Some(data[pointer as usize..(pointer + length) as usize].to_vec())
    }

    fn write_memory(&mut self, pointer: u64, data: &[u8]) -> bool {
        let memory = match self.memory {
            Some(memory) => memory,
            None => return false,
        };
        let bytes = memory.data_mut(&mut self.store);
        if !range_in_bounds(pointer, data.len() as u64, bytes.len() as u64) {
            return false;
        }
        bytes[pointer as usize..pointer as usize + data.len()].copy_from_slice(data);
        true
    }
}
