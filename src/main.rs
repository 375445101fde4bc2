use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use jitlink::config::RuntimeConfig;
use jitlink::jit::installer::CodeInstaller;
use jitlink::jit::registers::{Register, to_native_register};
use jitlink::jit::reloc::Relocation;
use jitlink::jit::stackmap::OopMap;
use jitlink::manifest::{Manifest, to_hex};
use jitlink::runtime::SharedRuntime;
use jitlink::runtime::method::{AccessFlags, Method};
use jitlink::runtime::stubs::RuntimeEntryPoints;

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
enum OutputFormat {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "jitlink")]
#[command(about = "Install and relocate compiled code, build call adapters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Relocate a compilation unit at its manifest addresses and print the relocation table
    Relocate {
        /// Manifest describing the code, data and sites
        manifest: PathBuf,

        /// Output format (human or json)
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,

        /// Runtime configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Generate adapters for method descriptors and print their entries
    Adapter {
        /// Method descriptors, e.g. "(IJ)V"
        #[arg(required = true)]
        descriptors: Vec<String>,

        /// Treat the methods as static (no receiver)
        #[arg(long = "static")]
        is_static: bool,

        /// Output format (human or json)
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,

        /// Runtime configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Map a compiler register index to its native register
    Reg {
        index: u32,
    },
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig, String> {
    match path {
        Some(path) => RuntimeConfig::load(path),
        None => Ok(RuntimeConfig::default()),
    }
}

#[derive(Serialize)]
struct OopMapReport {
    return_pc: u32,
    registers: Vec<String>,
    stack_slots: Vec<usize>,
}

impl From<&OopMap> for OopMapReport {
    fn from(map: &OopMap) -> Self {
        Self {
            return_pc: map.return_pc,
            registers: map.registers.iter().map(|r| r.to_string()).collect(),
            stack_slots: map.stack_ref_slots(),
        }
    }
}

#[derive(Serialize)]
struct RelocateReport {
    name: String,
    code: String,
    relocations: Vec<Relocation>,
    objects: Vec<u64>,
    oop_maps: Vec<OopMapReport>,
}

fn relocate(manifest: &Path, format: OutputFormat, config: Option<&Path>) -> Result<(), String> {
    let config = load_config(config)?;
    let manifest = Manifest::load(manifest)?;
    let mut compiled = manifest.compiled_code()?;
    let installer = CodeInstaller::new(config.clone(), manifest.context(&config));
    let output = installer
        .relocate_at(&mut compiled, manifest.layout())
        .map_err(|e| format!("{}: {}", compiled.name, e))?;

    let report = RelocateReport {
        name: compiled.name.clone(),
        code: to_hex(&compiled.code),
        relocations: output.relocations.iter().copied().collect(),
        objects: output.objects.iter().map(|o| o.address()).collect(),
        oop_maps: output.oop_maps.iter().map(OopMapReport::from).collect(),
    };

    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
            println!("{}", json);
        }
        OutputFormat::Human => {
            println!("{} ({} relocations)", report.name, report.relocations.len());
            for reloc in &report.relocations {
                println!(
                    "  {:#06x}  {:<20} {:?}",
                    reloc.offset,
                    reloc.kind.name(),
                    reloc.format
                );
            }
            for (i, object) in report.objects.iter().enumerate() {
                println!("  object[{}] = {:#x}", i, object);
            }
            for map in &report.oop_maps {
                println!(
                    "  oop map at {:#x}: registers {:?}, stack slots {:?}",
                    map.return_pc, map.registers, map.stack_slots
                );
            }
            println!("  code: {}", report.code);
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct AdapterReport {
    descriptor: String,
    index: usize,
    fingerprint: String,
    i2c_entry: u64,
    c2i_entry: u64,
    c2i_unverified_entry: u64,
}

fn adapter(
    descriptors: &[String],
    is_static: bool,
    format: OutputFormat,
    config: Option<&Path>,
) -> Result<(), String> {
    let config = load_config(config)?;
    let runtime = SharedRuntime::new(config, RuntimeEntryPoints::default()).map_err(|e| e.to_string())?;
    let flags = if is_static {
        AccessFlags(AccessFlags::STATIC)
    } else {
        AccessFlags::default()
    };

    let mut reports = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        let method = Method::new("m", descriptor, flags).map_err(|e| e.to_string())?;
        let entry = runtime.get_adapter(&method).map_err(|e| e.to_string())?;
        reports.push(AdapterReport {
            descriptor: descriptor.clone(),
            index: entry.index(),
            fingerprint: entry.fingerprint().to_string(),
            i2c_entry: entry.i2c_entry(),
            c2i_entry: entry.c2i_entry(),
            c2i_unverified_entry: entry.c2i_unverified_entry(),
        });
    }

    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&reports).map_err(|e| e.to_string())?;
            println!("{}", json);
        }
        OutputFormat::Human => {
            for r in &reports {
                println!(
                    "{} -> #{} fingerprint {} i2c {:#x} c2i {:#x} c2i_unverified {:#x}",
                    r.descriptor, r.index, r.fingerprint, r.i2c_entry, r.c2i_entry, r.c2i_unverified_entry
                );
            }
            println!("{} handlers", runtime.adapters().len());
        }
    }
    Ok(())
}

fn reg(index: u32) -> Result<(), String> {
    let register = to_native_register(index).map_err(|e| e.to_string())?;
    let class = match register {
        Register::Gpr(_) => "general purpose",
        Register::Xmm(_) => "xmm",
    };
    println!("{} -> {} ({})", index, register, class);
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Relocate {
            manifest,
            format,
            config,
        } => relocate(&manifest, format, config.as_deref()),
        Commands::Adapter {
            descriptors,
            is_static,
            format,
            config,
        } => adapter(&descriptors, is_static, format, config.as_deref()),
        Commands::Reg { index } => reg(index),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
