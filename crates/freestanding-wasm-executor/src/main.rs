//! A freestanding driver for the module execution adapter, for offline
//! development.
//!
//! ## About
//!
//! The module to execute is passed with `--module`, in either the binary or
//! the textual encoding, and the export to invoke with `--invoke`.  Integer
//! arguments are passed with repeated `--arg` flags.  A diagnostic host
//! function, `env.log(word)`, is registered before linking so that guest
//! modules built against it can be exercised without a full embedding.
//!
//! To see verbose output of what is happening, set `RUST_LOG=info` before
//! executing.
//!
//! On success, the return value of the invoked export (if any) is printed
//! to stdout.
//!
//! ## Authors
//!
//! The Wasm Executor Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the repository root directory for
//! information on licensing and copyright.

use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction};
use log::info;
use std::{fs, time::Instant};
use wasm_executor::{Signature, ValueKind, WasmValue, WasmVm};

////////////////////////////////////////////////////////////////////////////////
// Constants.
////////////////////////////////////////////////////////////////////////////////

/// About freestanding-wasm-executor.
const ABOUT: &str = "An offline driver for the wasm-executor module execution adapter.  Loads a \
                     WebAssembly module, links it against a small set of diagnostic host \
                     functions, and invokes a named export with integer arguments.  This can be \
                     used to test and develop guest modules before deployment.";
/// The name of the application.
const APPLICATION_NAME: &str = "freestanding-wasm-executor";
/// Application version number.
const VERSION: &str = "0.1.0";

////////////////////////////////////////////////////////////////////////////////
// Command line options and parsing.
////////////////////////////////////////////////////////////////////////////////

/// A struct capturing all of the command line options passed to the program.
struct CommandLineOptions {
    /// The path of the module to load.
    module_path: String,
    /// The name of the export to invoke.
    function_name: String,
    /// 32-bit integer arguments for the invocation.
    arguments: Vec<i32>,
    /// Whether a precompiled-object custom section may be used.
    allow_precompiled: bool,
}

/// Parses the command line options, building a `CommandLineOptions` struct
/// out of them.  If required options are not present, or if any options are
/// malformed, this will abort the program.
fn parse_command_line() -> Result<CommandLineOptions> {
    let matches = clap::Command::new(APPLICATION_NAME)
        .version(VERSION)
        .about(ABOUT)
        .arg(
            Arg::new("module")
                .short('m')
                .long("module")
                .value_name("FILE")
                .help("Path to the WebAssembly module, in binary or textual encoding.")
                .required(true),
        )
        .arg(
            Arg::new("invoke")
                .short('i')
                .long("invoke")
                .value_name("NAME")
                .help("The name of the exported function to invoke.")
                .required(true),
        )
        .arg(
            Arg::new("arg")
                .short('a')
                .long("arg")
                .value_name("I32")
                .help("A 32-bit integer argument.  May be given multiple times, in order.")
                .num_args(1)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("allow-precompiled")
                .long("allow-precompiled")
                .help("Trust and use a precompiled-object custom section, if present.")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    info!("Parsed command line.");

    let module_path = matches
        .get_one::<String>("module")
        .ok_or_else(|| anyhow!("No module path provided"))?
        .to_string();
    let function_name = matches
        .get_one::<String>("invoke")
        .ok_or_else(|| anyhow!("No function name provided"))?
        .to_string();
    let arguments = match matches.get_many::<String>("arg") {
        None => Vec::new(),
        Some(args) => args
            .map(|arg| {
                arg.parse::<i32>()
                    .map_err(|_| anyhow!("Expected a 32-bit integer argument, found '{}'", arg))
            })
            .collect::<Result<Vec<i32>>>()?,
    };
    let allow_precompiled = matches.get_flag("allow-precompiled");

    Ok(CommandLineOptions {
        module_path,
        function_name,
        arguments,
        allow_precompiled,
    })
}

////////////////////////////////////////////////////////////////////////////////
// Entry.
////////////////////////////////////////////////////////////////////////////////

/// Entry: reads the command line, provisions an adapter with the diagnostic
/// host functions, then loads, links and invokes.
fn main() -> Result<()> {
    env_logger::init();
    let cmdline = parse_command_line()?;

    let module_bytes = fs::read(&cmdline.module_path)?;
    info!(
        "Loaded module '{}' ({} bytes) from disk.",
        cmdline.module_path,
        module_bytes.len()
    );

    let mut vm = WasmVm::new()?;
    vm.register_host_function(
        "env",
        "log",
        Signature::new(vec![ValueKind::Word], None),
        |_ctx, args| {
            if let [WasmValue::Word(word)] = args {
                println!("guest log: {}", word);
            }
            Ok(None)
        },
    );

    if !vm.load(&module_bytes, cmdline.allow_precompiled) {
        return Err(anyhow!(
            "failed to load module '{}': malformed binary or text encoding",
            cmdline.module_path
        ));
    }
    vm.link(&cmdline.module_path)?;

    let signature = Signature::new(
        vec![ValueKind::I32; cmdline.arguments.len()],
        Some(ValueKind::I32),
    );
    let arguments: Vec<WasmValue> = cmdline
        .arguments
        .iter()
        .map(|value| WasmValue::I32(*value))
        .collect();

    // Exports are commonly void; retry the lookup without a return kind
    // before giving up, so both shapes can be driven from the command line.
    let start = Instant::now();
    let outcome = match vm.get_exported_function(&cmdline.function_name, &signature) {
        Ok(Some(function)) => vm.call(&function, None, &arguments)?,
        _otherwise => {
            let void = Signature::new(vec![ValueKind::I32; cmdline.arguments.len()], None);
            let function = vm
                .get_exported_function(&cmdline.function_name, &void)?
                .ok_or_else(|| {
                    anyhow!("export '{}' not found in module", cmdline.function_name)
                })?;
            vm.call(&function, None, &arguments)?
        }
    };

    info!(
        "Invocation of '{}' took {} microseconds.",
        cmdline.function_name,
        start.elapsed().as_micros()
    );

    match outcome {
        Some(value) => println!("{:?}", value),
        None => println!("(no result)"),
    }
    Ok(())
}
