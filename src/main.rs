use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use ropfp::arch::Arch;
use ropfp::disasm;
use ropfp::error::Error;
use ropfp::fingerprint::{compare_with, CompareOptions, Fingerprint};
use ropfp::process;
use ropfp::procfs;
use ropfp::region::Permissions;
use ropfp::search::{self, GadgetSearchSpec, SearchTarget, DEFAULT_END};
use ropfp::types::Addr;

#[derive(Parser)]
#[command(name = "ropfp", about = "ROP gadget discovery and fingerprint diffing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct TargetArgs {
    /// ELF binary to inspect
    #[arg(long, conflicts_with = "pid")]
    file: Option<PathBuf>,

    /// Live process to inspect
    #[arg(long)]
    pid: Option<i32>,
}

impl TargetArgs {
    fn resolve(&self) -> Result<SearchTarget> {
        match (&self.file, self.pid) {
            (Some(path), None) => Ok(SearchTarget::File(path.clone())),
            (None, Some(pid)) => Ok(SearchTarget::Pid(pid)),
            _ => bail!("specify exactly one of --file or --pid"),
        }
    }
}

#[derive(Args)]
struct SearchArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Maximum gadget length in instructions
    #[arg(long, default_value_t = 2)]
    len: usize,

    /// Lower address bound, inclusive (hex or decimal)
    #[arg(long, value_parser = parse_u64)]
    start: Option<u64>,

    /// Upper address bound, inclusive (hex or decimal)
    #[arg(long, value_parser = parse_u64)]
    end: Option<u64>,

    /// Offset added to reported gadget addresses
    #[arg(long, value_parser = parse_u64, default_value = "0")]
    base: u64,

    /// Target architecture (amd64, x86)
    #[arg(long, default_value = "amd64")]
    arch: String,
}

impl SearchArgs {
    fn spec(&self) -> Result<GadgetSearchSpec> {
        Ok(GadgetSearchSpec {
            target: self.target.resolve()?,
            max_instructions: self.len,
            start: Addr(self.start.unwrap_or(0)),
            end: Addr(self.end.unwrap_or(DEFAULT_END)),
            base: self.base,
            arch: self.arch.parse::<Arch>()?,
        })
    }
}

#[derive(Subcommand)]
enum Command {
    /// List every gadget of a binary or process
    Gadgets(SearchArgs),

    /// Fingerprint a binary or process by its gadgets
    Fingerprint(SearchArgs),

    /// Compare two fingerprint JSON files
    Compare {
        old: PathBuf,
        new: PathBuf,

        /// Also report signatures that vanished from shared regions
        #[arg(long)]
        removed_gadgets: bool,
    },

    /// Disassemble the executable regions of a binary or process
    Disasm(SearchArgs),

    /// List a process's memory regions
    Regions {
        #[arg(long)]
        pid: i32,

        /// Access mask, any of r/w/x/f (e.g. "rx")
        #[arg(long, default_value = "r")]
        access: String,
    },

    /// List visible process IDs
    Pids,
}

fn parse_u64(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("invalid number: '{}'", s))
}

fn log_soft_errors(soft: &[Error]) {
    for e in soft {
        log::warn!("{}", e);
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Gadgets(args) => {
            let spec = args.spec()?;
            let (gadgets, soft) = search::find_gadgets(&spec)?;
            log_soft_errors(&soft);
            eprintln!("{} {} gadgets", "found".green().bold(), gadgets.len());
            print_json(&gadgets)
        }
        Command::Fingerprint(args) => {
            let spec = args.spec()?;
            let (fingerprint, soft) = search::fingerprint(&spec)?;
            log_soft_errors(&soft);
            eprintln!(
                "{} {} gadgets across {} regions",
                "fingerprinted".green().bold(),
                fingerprint.gadget_count(),
                fingerprint.regions().len()
            );
            print_json(&fingerprint)
        }
        Command::Compare { old, new, removed_gadgets } => {
            let old_fp: Fingerprint = read_fingerprint(&old)?;
            let new_fp: Fingerprint = read_fingerprint(&new)?;
            let comparison = compare_with(
                &old_fp,
                &new_fp,
                CompareOptions { report_removed_gadgets: removed_gadgets },
            );
            print_json(&comparison)
        }
        Command::Disasm(args) => {
            let spec = args.spec()?;
            let (instructions, soft) = match &spec.target {
                SearchTarget::File(path) => {
                    disasm::disassemble_file(path, spec.arch, spec.start, spec.end)?
                }
                SearchTarget::Pid(pid) => {
                    disasm::disassemble_process(*pid, spec.arch, spec.start, spec.end)?
                }
            };
            log_soft_errors(&soft);
            print_json(&instructions)
        }
        Command::Regions { pid, access } => {
            let mask: Permissions = access.parse()?;
            let regions = process::memory_regions(pid, mask)?;
            print_json(&regions)
        }
        Command::Pids => {
            let pids = procfs::all_pids()?;
            print_json(&pids)
        }
    }
}

fn read_fingerprint(path: &std::path::Path) -> Result<Fingerprint> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read fingerprint '{}'", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("parse fingerprint '{}'", path.display()))
}
