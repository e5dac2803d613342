//! Integration tests for the module execution adapter.
//!
//! These drive real guest modules, written in the textual surface syntax,
//! through the public API: loading, linking, import resolution, memory
//! supervision, marshaled calls in both directions, fault recovery and
//! forking.
//!
//! ## Authors
//!
//! The Wasm Executor Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the repository root directory for
//! information on licensing and copyright.

use std::sync::{Arc, Mutex};
use wasm_executor::{
    wasmtime::{Extern, ExternType, Func, Store, Val},
    FallbackResolver, FatalVmError, GuestMemory, Signature, StoreData, ValueKind, WasmValue,
    WasmVm, Word,
};

/// A guest exporting `add(i32, i32) -> i32` and a one-page memory.
const ADD_MODULE: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "add") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add))
"#;

/// A guest whose `boom` export traps and whose `add` export works.
const TRAP_MODULE: &str = r#"
(module
  (func (export "boom") unreachable)
  (func (export "add") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add))
"#;

/// A guest that forwards a value to an imported `env.log` function.
const LOG_MODULE: &str = r#"
(module
  (import "env" "log" (func $log (param i32)))
  (memory (export "memory") 1)
  (func (export "run") (param i32)
    local.get 0
    call $log))
"#;

/// A guest whose start function calls imported `env.tick`, with a `poke`
/// export that calls it again on demand.
const START_MODULE: &str = r#"
(module
  (import "env" "tick" (func $tick))
  (func $init call $tick)
  (func (export "poke") call $tick)
  (start $init))
"#;

/// A guest exporting a mutable global with get/set accessors.
const GLOBAL_MODULE: &str = r#"
(module
  (global $g (export "g") (mut i32) (i32.const 0))
  (func (export "set") (param i32)
    local.get 0
    global.set $g)
  (func (export "get") (result i32)
    global.get $g))
"#;

/// A guest importing `env.f` and `env.g`, exporting trampolines for both.
const TWO_IMPORTS_MODULE: &str = r#"
(module
  (import "env" "f" (func $f (result i32)))
  (import "env" "g" (func $g (result i32)))
  (func (export "call_f") (result i32) call $f)
  (func (export "call_g") (result i32) call $g))
"#;

/// Builds a fresh adapter, initialising the test logger on first use so
/// that `RUST_LOG` surfaces the adapter's diagnostics during a test run.
fn new_vm() -> WasmVm {
    let _ = env_logger::builder().is_test(true).try_init();
    WasmVm::new().expect("adapter construction")
}

fn linked_vm(wat: &str) -> WasmVm {
    let mut vm = new_vm();
    assert!(vm.load(wat.as_bytes(), false));
    vm.link("test-module").expect("link");
    vm
}

fn add_signature() -> Signature {
    Signature::new(vec![ValueKind::I32, ValueKind::I32], Some(ValueKind::I32))
}

////////////////////////////////////////////////////////////////////////////////
// Loading.
////////////////////////////////////////////////////////////////////////////////

#[test]
fn load_accepts_text_and_binary_encodings() {
    let binary = wat::parse_str(ADD_MODULE).unwrap();

    let mut from_text = new_vm();
    assert!(from_text.load(ADD_MODULE.as_bytes(), false));

    let mut from_binary = new_vm();
    assert!(from_binary.load(&binary, false));
}

#[test]
fn load_rejects_garbage_without_panicking() {
    // Not binary (no magic) and not valid text.
    let mut vm = new_vm();
    assert!(!vm.load(b"(module", false));

    // Correct magic, malformed binary.
    let mut vm = new_vm();
    assert!(!vm.load(b"\0asm\x63\x63\x63\x63", false));

    // Invalid UTF-8 that is also not binary.
    let mut vm = new_vm();
    assert!(!vm.load(&[0xff, 0xfe, 0xfd], false));
}

#[test]
fn load_failure_leaves_adapter_reloadable() {
    let mut vm = new_vm();
    assert!(!vm.load(b"(module", false));
    // A failed load returns to Unloaded; a subsequent load succeeds.
    assert!(vm.load(ADD_MODULE.as_bytes(), false));
}

#[test]
#[should_panic(expected = "load may only be called once")]
fn double_load_is_a_programming_error() {
    let mut vm = new_vm();
    assert!(vm.load(ADD_MODULE.as_bytes(), false));
    vm.load(ADD_MODULE.as_bytes(), false);
}

#[test]
fn garbage_precompiled_section_fails_only_when_trusted() {
    let binary = wat::parse_str(ADD_MODULE).unwrap();
    let tagged = append_custom_section(
        binary,
        wasm_executor::PRECOMPILED_SECTION_NAME,
        b"not a real artifact",
    );

    // Ignored when precompiled artifacts are not allowed.
    let mut vm = new_vm();
    assert!(vm.load(&tagged, false));

    // Deserialisation of the garbage blob fails, recoverably.
    let mut vm = new_vm();
    assert!(!vm.load(&tagged, true));
}

////////////////////////////////////////////////////////////////////////////////
// Custom sections.
////////////////////////////////////////////////////////////////////////////////

#[test]
fn custom_sections_are_readable_after_link() {
    let binary = wat::parse_str(ADD_MODULE).unwrap();
    let tagged = append_custom_section(binary, "build-id", b"cafebabe");

    let mut vm = new_vm();
    assert!(vm.load(&tagged, false));
    vm.link("custom-sections").unwrap();

    assert_eq!(vm.get_custom_section("build-id"), b"cafebabe");
    assert!(vm.get_custom_section("absent").is_empty());
}

////////////////////////////////////////////////////////////////////////////////
// Export lookup and invocation.
////////////////////////////////////////////////////////////////////////////////

#[test]
fn add_two_and_three_yields_five() {
    let mut vm = linked_vm(ADD_MODULE);
    let add = vm
        .get_exported_function("add", &add_signature())
        .unwrap()
        .expect("add is exported");
    let result = vm
        .call(&add, None, &[WasmValue::I32(2), WasmValue::I32(3)])
        .unwrap();
    assert_eq!(result, Some(WasmValue::I32(5)));
}

#[test]
fn missing_export_is_absent_not_an_error() {
    let mut vm = linked_vm(ADD_MODULE);
    let hook = vm
        .get_exported_function("optional_hook", &Signature::new(vec![], None))
        .unwrap();
    assert!(hook.is_none());
}

#[test]
fn mismatched_export_signature_is_a_loud_error() {
    let mut vm = linked_vm(ADD_MODULE);
    let wrong = Signature::new(vec![ValueKind::I64], Some(ValueKind::I32));
    match vm.get_exported_function("add", &wrong) {
        Err(FatalVmError::ExportSignatureMismatch { function_name, .. }) => {
            assert_eq!(function_name, "add");
        }
        other => panic!("expected a signature mismatch, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn bad_argument_kinds_are_rejected() {
    let mut vm = linked_vm(ADD_MODULE);
    let add = vm
        .get_exported_function("add", &add_signature())
        .unwrap()
        .unwrap();
    let outcome = vm.call(&add, None, &[WasmValue::I64(2), WasmValue::I64(3)]);
    assert!(matches!(outcome, Err(FatalVmError::BadArguments { .. })));
}

#[test]
fn a_trap_is_descriptive_and_recoverable() {
    let mut vm = linked_vm(TRAP_MODULE);
    let boom = vm
        .get_exported_function("boom", &Signature::new(vec![], None))
        .unwrap()
        .unwrap();
    match vm.call(&boom, None, &[]) {
        Err(FatalVmError::RuntimeTrap { description, .. }) => {
            assert!(description.contains("unreachable"), "got: {}", description);
        }
        other => panic!("expected a trap, got {:?}", other),
    }

    // The fault was contained; an unrelated call still works.
    let add = vm
        .get_exported_function("add", &add_signature())
        .unwrap()
        .unwrap();
    let result = vm
        .call(&add, None, &[WasmValue::I32(40), WasmValue::I32(2)])
        .unwrap();
    assert_eq!(result, Some(WasmValue::I32(42)));
}

////////////////////////////////////////////////////////////////////////////////
// Host imports.
////////////////////////////////////////////////////////////////////////////////

#[test]
fn registered_host_function_sees_guest_values_unchanged() {
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);

    let mut vm = new_vm();
    vm.register_host_function(
        "env",
        "log",
        Signature::new(vec![ValueKind::Word], None),
        move |_ctx, args| {
            if let [WasmValue::Word(word)] = args {
                sink.lock().unwrap().push(u32::from(*word));
            }
            Ok(None)
        },
    );
    assert!(vm.load(LOG_MODULE.as_bytes(), false));
    vm.link("log-module").unwrap();

    let run = vm
        .get_exported_function("run", &Signature::new(vec![ValueKind::Word], None))
        .unwrap()
        .unwrap();
    vm.call(&run, None, &[WasmValue::Word(Word(0x1234_5678))])
        .unwrap();

    assert_eq!(*observed.lock().unwrap(), vec![0x1234_5678]);
}

#[test]
fn host_function_recovers_the_ambient_call_context() {
    let observed = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&observed);

    let mut vm = new_vm();
    vm.register_host_function(
        "env",
        "log",
        Signature::new(vec![ValueKind::Word], None),
        move |ctx, _args| {
            let request_id = ctx
                .call_context()
                .and_then(|c| c.downcast_ref::<u64>().copied());
            *sink.lock().unwrap() = request_id;
            Ok(None)
        },
    );
    assert!(vm.load(LOG_MODULE.as_bytes(), false));
    vm.link("log-module").unwrap();

    let run = vm
        .get_exported_function("run", &Signature::new(vec![ValueKind::Word], None))
        .unwrap()
        .unwrap();
    vm.call(&run, Some(Arc::new(99u64)), &[WasmValue::Word(Word(1))])
        .unwrap();

    assert_eq!(*observed.lock().unwrap(), Some(99));
}

#[test]
fn host_function_can_read_guest_memory() {
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);

    let mut vm = new_vm();
    vm.register_host_function(
        "env",
        "log",
        Signature::new(vec![ValueKind::Word], None),
        move |ctx, args| {
            if let [WasmValue::Word(pointer)] = args {
                if let Some(bytes) = ctx.read_memory(pointer.u64(), 5) {
                    sink.lock().unwrap().extend_from_slice(&bytes);
                }
            }
            Ok(None)
        },
    );
    assert!(vm.load(LOG_MODULE.as_bytes(), false));
    vm.link("log-module").unwrap();

    assert!(vm.write_memory(64, b"hello"));
    let run = vm
        .get_exported_function("run", &Signature::new(vec![ValueKind::Word], None))
        .unwrap()
        .unwrap();
    vm.call(&run, None, &[WasmValue::Word(Word(64))]).unwrap();

    assert_eq!(*observed.lock().unwrap(), b"hello");
}

#[test]
fn host_function_error_surfaces_as_a_trap() {
    let mut vm = new_vm();
    vm.register_host_function(
        "env",
        "log",
        Signature::new(vec![ValueKind::Word], None),
        |_ctx, _args| Err(anyhow::anyhow!("host-side refusal")),
    );
    assert!(vm.load(LOG_MODULE.as_bytes(), false));
    vm.link("log-module").unwrap();

    let run = vm
        .get_exported_function("run", &Signature::new(vec![ValueKind::Word], None))
        .unwrap()
        .unwrap();
    match vm.call(&run, None, &[WasmValue::Word(Word(1))]) {
        Err(FatalVmError::RuntimeTrap { description, .. }) => {
            assert!(description.contains("host-side refusal"), "got: {}", description);
        }
        other => panic!("expected a trap, got {:?}", other),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Import resolution.
////////////////////////////////////////////////////////////////////////////////

/// Satisfies `env.f` and `env.g` with functions returning fixed markers.
struct MarkerFallback;

impl FallbackResolver for MarkerFallback {
    fn resolve(
        &self,
        store: &mut Store<StoreData>,
        module_name: &str,
        export_name: &str,
        expected: &ExternType,
    ) -> Option<Extern> {
        if module_name != "env" {
            return None;
        }
        let func_type = match expected {
            ExternType::Func(func_type) => func_type.clone(),
            _otherwise => return None,
        };
        let marker = match export_name {
            "f" => 2,
            "g" => 3,
            _otherwise => return None,
        };
        let func = Func::new(store, func_type, move |_caller, _params, results| {
            results[0] = Val::I32(marker);
            Ok(())
        });
        Some(Extern::Func(func))
    }
}

#[test]
fn registered_modules_take_priority_over_fallbacks() {
    let mut vm = new_vm();
    // `env.f` is registered as an instantiated import module; `env.g` is
    // only satisfiable by the fallback.
    vm.register_host_function(
        "env",
        "f",
        Signature::new(vec![], Some(ValueKind::I32)),
        |_ctx, _args| Ok(Some(WasmValue::I32(1))),
    );
    vm.add_fallback_resolver(Arc::new(MarkerFallback));
    assert!(vm.load(TWO_IMPORTS_MODULE.as_bytes(), false));
    vm.link("two-imports").unwrap();

    let sig = Signature::new(vec![], Some(ValueKind::I32));
    let call_f = vm.get_exported_function("call_f", &sig).unwrap().unwrap();
    let call_g = vm.get_exported_function("call_g", &sig).unwrap().unwrap();
    assert_eq!(vm.call(&call_f, None, &[]).unwrap(), Some(WasmValue::I32(1)));
    assert_eq!(vm.call(&call_g, None, &[]).unwrap(), Some(WasmValue::I32(3)));
}

#[test]
fn unresolved_import_is_a_fatal_link_error() {
    let mut vm = new_vm();
    assert!(vm.load(TWO_IMPORTS_MODULE.as_bytes(), false));
    match vm.link("no-imports") {
        Err(FatalVmError::MissingImport {
            module_name,
            export_name,
            ..
        }) => {
            assert_eq!(module_name, "env");
            assert_eq!(export_name, "f");
        }
        other => panic!("expected a missing import, got {:?}", other),
    }
}

#[test]
fn mistyped_import_fails_without_falling_through() {
    let mut vm = new_vm();
    // Wrong type for `env.f`; the fallback could satisfy it, but a name
    // collision with the wrong type is a configuration error.
    vm.register_host_function(
        "env",
        "f",
        Signature::new(vec![ValueKind::I64], None),
        |_ctx, _args| Ok(None),
    );
    vm.add_fallback_resolver(Arc::new(MarkerFallback));
    assert!(vm.load(TWO_IMPORTS_MODULE.as_bytes(), false));
    match vm.link("mistyped") {
        Err(FatalVmError::ImportTypeMismatch {
            module_name,
            export_name,
            ..
        }) => {
            assert_eq!(module_name, "env");
            assert_eq!(export_name, "f");
        }
        other => panic!("expected a type mismatch, got {:?}", other),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Memory supervision.
////////////////////////////////////////////////////////////////////////////////

#[test]
fn memory_roundtrip_and_bounds() {
    let mut vm = linked_vm(ADD_MODULE);
    let size = vm.memory_size();
    assert_eq!(size, wasm_executor::WASM_PAGE_SIZE);

    assert!(vm.write_memory(100, b"supervised"));
    assert_eq!(vm.read_memory(100, 10).unwrap(), b"supervised");

    // Out of bounds, including overflowing arithmetic: absent, not an error.
    assert!(vm.read_memory(size, 1).is_none());
    assert!(vm.read_memory(u64::MAX, 2).is_none());
    assert!(!vm.write_memory(size - 1, b"xy"));
}

#[test]
fn oversized_writes_are_not_partial() {
    let mut vm = linked_vm(ADD_MODULE);
    let size = vm.memory_size();
    let base = size - 4;
    assert!(vm.write_memory(base, &[1, 2, 3, 4]));

    // Straddles the end of memory: nothing at all may be written.
    assert!(!vm.write_memory(base, &[9, 9, 9, 9, 9]));
    assert_eq!(vm.read_memory(base, 4).unwrap(), [1, 2, 3, 4]);
}

#[test]
fn words_roundtrip_through_guest_memory() {
    let mut vm = linked_vm(ADD_MODULE);
    assert!(vm.write_word(8, Word(0xdead_beef)));
    assert_eq!(vm.read_word(8), Some(Word(0xdead_beef)));
    // Little-endian, exactly four bytes.
    assert_eq!(vm.read_memory(8, 4).unwrap(), [0xef, 0xbe, 0xad, 0xde]);
    assert_eq!(vm.read_word(vm.memory_size() - 3), None);
}

////////////////////////////////////////////////////////////////////////////////
// Forking.
////////////////////////////////////////////////////////////////////////////////

#[test]
fn fork_duplicates_memory_and_then_diverges() {
    let mut vm = linked_vm(ADD_MODULE);
    assert!(vm.write_memory(200, b"original"));

    let mut fork = vm.fork().unwrap();
    // Initially byte-identical.
    assert_eq!(fork.read_memory(200, 8).unwrap(), b"original");
    assert_eq!(fork.memory_size(), vm.memory_size());

    // Writes on either side are invisible to the other.
    assert!(fork.write_memory(200, b"FORKSIDE"));
    assert_eq!(vm.read_memory(200, 8).unwrap(), b"original");
    assert!(vm.write_memory(300, b"source"));
    assert!(fork.read_memory(300, 6).unwrap() != b"source");
}

#[test]
fn fork_executes_independently_without_recompilation() {
    let mut vm = linked_vm(ADD_MODULE);
    let mut fork = vm.fork().unwrap();

    // Handles are compartment-scoped: each side performs its own lookup.
    let add_src = vm
        .get_exported_function("add", &add_signature())
        .unwrap()
        .unwrap();
    let add_fork = fork
        .get_exported_function("add", &add_signature())
        .unwrap()
        .unwrap();

    assert_eq!(
        vm.call(&add_src, None, &[WasmValue::I32(1), WasmValue::I32(2)])
            .unwrap(),
        Some(WasmValue::I32(3))
    );
    assert_eq!(
        fork.call(&add_fork, None, &[WasmValue::I32(20), WasmValue::I32(22)])
            .unwrap(),
        Some(WasmValue::I32(42))
    );
}

#[test]
fn fork_does_not_replay_start_function_effects() {
    let count = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&count);

    let mut vm = new_vm();
    vm.register_host_function(
        "env",
        "tick",
        Signature::new(vec![], None),
        move |_ctx, _args| {
            *sink.lock().unwrap() += 1;
            Ok(None)
        },
    );
    assert!(vm.load(START_MODULE.as_bytes(), false));
    vm.link("start-module").unwrap();
    assert_eq!(*count.lock().unwrap(), 1);

    // Re-instantiation in the fork re-runs `start`, silently: the
    // initialisation effect already happened in the source compartment.
    let mut fork = vm.fork().unwrap();
    assert_eq!(*count.lock().unwrap(), 1);

    // Host calls made by the fork afterwards are observed as usual.
    let poke = fork
        .get_exported_function("poke", &Signature::new(vec![], None))
        .unwrap()
        .unwrap();
    fork.call(&poke, None, &[]).unwrap();
    assert_eq!(*count.lock().unwrap(), 2);
}

#[test]
fn fork_copies_mutable_globals_and_then_diverges() {
    let set_sig = Signature::new(vec![ValueKind::I32], None);
    let get_sig = Signature::new(vec![], Some(ValueKind::I32));

    let mut vm = linked_vm(GLOBAL_MODULE);
    let set = vm.get_exported_function("set", &set_sig).unwrap().unwrap();
    vm.call(&set, None, &[WasmValue::I32(7)]).unwrap();

    // The fork observes the pre-fork value of the mutable global.
    let mut fork = vm.fork().unwrap();
    let fork_get = fork.get_exported_function("get", &get_sig).unwrap().unwrap();
    assert_eq!(
        fork.call(&fork_get, None, &[]).unwrap(),
        Some(WasmValue::I32(7))
    );

    // Writes after the fork are invisible to the other side.
    let fork_set = fork.get_exported_function("set", &set_sig).unwrap().unwrap();
    fork.call(&fork_set, None, &[WasmValue::I32(9)]).unwrap();
    let get = vm.get_exported_function("get", &get_sig).unwrap().unwrap();
    assert_eq!(vm.call(&get, None, &[]).unwrap(), Some(WasmValue::I32(7)));
}

#[test]
fn forks_run_on_other_threads() {
    let mut vm = linked_vm(ADD_MODULE);
    let mut fork = vm.fork().unwrap();

    let worker = std::thread::spawn(move || {
        let add = fork
            .get_exported_function("add", &add_signature())
            .unwrap()
            .unwrap();
        fork.call(&add, None, &[WasmValue::I32(20), WasmValue::I32(22)])
            .unwrap()
    });
    assert_eq!(worker.join().unwrap(), Some(WasmValue::I32(42)));

    // The source adapter is unaffected.
    let add = vm
        .get_exported_function("add", &add_signature())
        .unwrap()
        .unwrap();
    let result = vm
        .call(&add, None, &[WasmValue::I32(1), WasmValue::I32(1)])
        .unwrap();
    assert_eq!(result, Some(WasmValue::I32(2)));
}

#[test]
fn fork_carries_host_functions() {
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);

    let mut vm = new_vm();
    vm.register_host_function(
        "env",
        "log",
        Signature::new(vec![ValueKind::Word], None),
        move |_ctx, args| {
            if let [WasmValue::Word(word)] = args {
                sink.lock().unwrap().push(u32::from(*word));
            }
            Ok(None)
        },
    );
    assert!(vm.load(LOG_MODULE.as_bytes(), false));
    vm.link("log-module").unwrap();

    let mut fork = vm.fork().unwrap();
    let run = fork
        .get_exported_function("run", &Signature::new(vec![ValueKind::Word], None))
        .unwrap()
        .unwrap();
    fork.call(&run, None, &[WasmValue::Word(Word(7))]).unwrap();

    assert_eq!(*observed.lock().unwrap(), vec![7]);
}

////////////////////////////////////////////////////////////////////////////////
// Helpers.
////////////////////////////////////////////////////////////////////////////////

/// Appends a custom section to a binary-encoded module.
fn append_custom_section(mut binary: Vec<u8>, name: &str, data: &[u8]) -> Vec<u8> {
    fn write_leb128(out: &mut Vec<u8>, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    let mut payload = Vec::new();
    write_leb128(&mut payload, name.len() as u64);
    payload.extend_from_slice(name.as_bytes());
    payload.extend_from_slice(data);

    binary.push(0); // custom section id
    write_leb128(&mut binary, payload.len() as u64);
    binary.extend_from_slice(&payload);
    binary
}
