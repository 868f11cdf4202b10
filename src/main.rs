//! avm2 CLI
//!
//! Runs, disassembles, analyzes and compiles methods of a JSON module.

use anyhow::{anyhow, bail};
use avm2::bytecode::{disassemble, Module};
use avm2::jit::{analyze, compile};
use avm2::{JitMode, StandardModel, Value, VmConfig, VERSION};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "avm2")]
#[command(author, version, about = "An ActionScript 3 bytecode virtual machine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// VM configuration file (JSON)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a method and print its result and trace output
    Run {
        /// Module file
        module: PathBuf,
        /// Method to run (defaults to the module's entry)
        #[arg(short, long)]
        method: Option<String>,
        /// JIT mode: off, on or auto
        #[arg(long, value_parser = parse_jit_mode)]
        jit: Option<JitMode>,
        /// Print execution time
        #[arg(short, long)]
        profile: bool,
    },

    /// Disassemble every method body
    Disasm {
        /// Module file
        module: PathBuf,
    },

    /// Print a method's block graph and type analysis as JSON
    Analyze {
        /// Module file
        module: PathBuf,
        #[arg(short, long)]
        method: Option<String>,
    },

    /// Print the lowered IR of a method
    Compile {
        /// Module file
        module: PathBuf,
        #[arg(short, long)]
        method: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    debug!(version = VERSION, "avm2 starting");

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn setup_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// `avm2::Error` can carry a thrown `Value`, which is not `Send`
fn vm_error(e: avm2::Error) -> anyhow::Error {
    anyhow!("{}", e)
}

fn parse_jit_mode(s: &str) -> Result<JitMode, String> {
    s.parse().map_err(|e: avm2::Error| e.to_string())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Run {
            module,
            method,
            jit,
            profile,
        } => run_method(&module, method.as_deref(), jit, profile, config),
        Commands::Disasm { module } => show_disassembly(&module),
        Commands::Analyze { module, method } => show_analysis(&module, method.as_deref()),
        Commands::Compile { module, method } => show_compiled(&module, method.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<VmConfig> {
    let config = match path {
        Some(path) => VmConfig::from_file(path)
            .map_err(|e| anyhow!("failed to load config '{}': {}", path.display(), e))?,
        None => VmConfig::default(),
    };
    config.with_env_overrides().map_err(vm_error)
}

fn load_module(path: &Path) -> anyhow::Result<Module> {
    Module::from_file(path)
        .map_err(|e| anyhow!("failed to load module '{}': {}", path.display(), e))
}

fn select_method(module: &Module, name: Option<&str>) -> anyhow::Result<u32> {
    let index = match name {
        Some(name) => module.method_index(name).map_err(vm_error)?,
        None => module.entry_method().map_err(vm_error)?,
    };
    Ok(index)
}

fn run_method(
    path: &Path,
    method: Option<&str>,
    jit: Option<JitMode>,
    profile: bool,
    mut config: VmConfig,
) -> anyhow::Result<()> {
    if let Some(jit) = jit {
        config.jit = jit;
    }
    let module = load_module(path)?;
    let entry = select_method(&module, method)?;
    let model = Rc::new(StandardModel::new());
    let vm = module.into_vm(config, model.clone()).map_err(vm_error)?;

    let start = Instant::now();
    let result = vm.invoke(entry, Value::Null, Vec::new());
    let elapsed = start.elapsed();

    for line in model.take_output() {
        println!("{}", line);
    }
    let value = result.map_err(vm_error)?;
    if !matches!(value, Value::Undefined) {
        println!("{}", value);
    }
    if profile {
        eprintln!("time: {:?}, tier: {}", elapsed, vm.tier_of(entry));
    }
    Ok(())
}

fn show_disassembly(path: &Path) -> anyhow::Result<()> {
    let module = load_module(path)?;
    let pool = module.build_pool().map_err(vm_error)?;
    for method in &module.methods {
        println!("{}", disassemble(method, &pool).map_err(vm_error)?);
    }
    Ok(())
}

fn show_analysis(path: &Path, method: Option<&str>) -> anyhow::Result<()> {
    let module = load_module(path)?;
    let index = select_method(&module, method)?;
    let Some(info) = module.methods.get(index as usize) else {
        bail!("method {} out of range", index);
    };
    let analysis = analyze(info).map_err(vm_error)?;
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

fn show_compiled(path: &Path, method: Option<&str>) -> anyhow::Result<()> {
    let module = load_module(path)?;
    let pool = module.build_pool().map_err(vm_error)?;
    let index = select_method(&module, method)?;
    let Some(info) = module.methods.get(index as usize) else {
        bail!("method {} out of range", index);
    };
    print!("{}", compile(info, &pool).map_err(vm_error)?);
    Ok(())
}
