use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

use parisc_unwind::pattern;
use parisc_unwind::registers::{self, RegisterSet, PCOQ_HEAD, RP, SP};
use parisc_unwind::{ElfObject, Frame, ObjectFile, SavedRegister, Session, StaticImage, TargetAccess, TargetConfig};

#[derive(Parser)]
#[command(name = "pa-unwind", about = "PA-RISC unwind tables, stubs and frames")]
struct Cli {
    /// Calling convention of the object
    #[arg(long, value_enum, default_value_t = AbiArg::Pa32)]
    abi: AbiArg,

    /// Operating system conventions
    #[arg(long, value_enum, default_value_t = OsArg::Hpux)]
    os: OsArg,

    /// Treat the processor as PA 1.x (no `bve` stub exits)
    #[arg(long)]
    pa1: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum AbiArg {
    Pa32,
    Pa64,
}

#[derive(Clone, Copy, ValueEnum)]
enum OsArg {
    Hpux,
    Linux,
}

#[derive(Subcommand)]
enum Command {
    /// Dump every unwind descriptor of an object
    Table { file: PathBuf },
    /// Describe the code at an address: descriptor, symbol, prologue, stubs
    Lookup { file: PathBuf, addr: String },
    /// Scan the text section for linker stub shapes
    Stubs {
        file: PathBuf,
        #[arg(long, default_value = ".text")]
        section: String,
    },
    /// Recover the caller of a frame from its registers
    Frame {
        file: PathBuf,
        /// Program counter
        #[arg(long)]
        pc: String,
        /// Stack pointer
        #[arg(long)]
        sp: String,
        /// Return pointer (r2)
        #[arg(long)]
        rp: Option<String>,
        /// Number of frames to walk
        #[arg(long, default_value_t = 16)]
        depth: usize,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let config = TargetConfig {
        abi: match cli.abi {
            AbiArg::Pa32 => parisc_unwind::Abi::Pa32,
            AbiArg::Pa64 => parisc_unwind::Abi::Pa64,
        },
        os: match cli.os {
            OsArg::Hpux => parisc_unwind::Os::Hpux,
            OsArg::Linux => parisc_unwind::Os::Linux,
        },
        is_pa_2: !cli.pa1,
        ..TargetConfig::default()
    };

    match cli.command {
        Command::Table { file } => cmd_table(config, &file),
        Command::Lookup { file, addr } => cmd_lookup(config, &file, parse_addr(&addr)?),
        Command::Stubs { file, section } => cmd_stubs(&file, &section),
        Command::Frame { file, pc, sp, rp, depth } => {
            let mut regs = RegisterSet::new();
            regs.set(PCOQ_HEAD, parse_addr(&pc)?);
            regs.set(SP, parse_addr(&sp)?);
            if let Some(rp) = rp {
                regs.set(RP, parse_addr(&rp)?);
            }
            cmd_frame(TargetConfig { max_backtrace_depth: depth, ..config }, &file, regs)
        }
    }
}

fn parse_addr(s: &str) -> anyhow::Result<u64> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid address: {}", s))
}

fn open_session(config: TargetConfig, file: &Path) -> anyhow::Result<Session> {
    let object = ElfObject::load(file)?;
    let mut session = Session::new(config);
    session.add_object(Box::new(object));
    Ok(session)
}

fn cmd_table(config: TargetConfig, file: &Path) -> anyhow::Result<()> {
    let session = open_session(config, file)?;
    let table = session.unwind_table(0).filter(|t| !t.is_empty());
    let Some(table) = table else {
        println!("  {}", "no unwind descriptors".yellow());
        return Ok(());
    };

    println!("{} {} descriptors", file.display().to_string().bold(), table.len());
    for desc in table.iter() {
        let name = session
            .lookup_symbol_by_pc(desc.region_start)
            .map(|hit| hit.symbol.name)
            .unwrap_or_default();
        println!(
            "  {}..{}  frame {:>5}  {}",
            format!("0x{:08x}", desc.region_start).cyan(),
            format!("0x{:08x}", desc.region_end).cyan(),
            desc.frame_size(),
            name.bold()
        );
        let flags = desc.flag_names();
        if !flags.is_empty() {
            println!("      {}", flags.join(" ").dimmed());
        }
    }
    Ok(())
}

fn cmd_lookup(config: TargetConfig, file: &Path, addr: u64) -> anyhow::Result<()> {
    let session = open_session(config, file)?;
    let image = StaticImage::new(&session, [(PCOQ_HEAD, addr)].into_iter().collect());

    match session.lookup_symbol_by_pc(addr) {
        Some(hit) => println!(
            "  symbol:    {} + 0x{:x}",
            hit.symbol.name.bold(),
            addr - hit.symbol.address()
        ),
        None => println!("  symbol:    {}", "none".yellow()),
    }
    if let Some(section) = session.section_name_at(addr) {
        println!("  section:   {}", section);
    }
    match session.find_unwind_entry(addr) {
        Some(desc) => println!("  unwind:\n{}", desc),
        None => println!("  unwind:    {}", "no descriptor".yellow()),
    }
    if let Some(start) = session.function_start(addr) {
        let past = session.skip_prologue(&image, start);
        println!("  prologue:  0x{:x}..0x{:x}", start, past);
    }
    if session.in_dyncall(addr) {
        println!("  {}", "inside $$dyncall".cyan());
    }
    if session.in_solib_call_trampoline(&image, addr) {
        print!("  {}", "call trampoline".cyan());
        match session.skip_trampoline_code(&image, addr) {
            Some(dest) => println!(" to 0x{:x}", dest),
            None => println!(" (target unknown without registers)"),
        }
    }
    if session.in_solib_return_trampoline(&image, addr) {
        println!("  {}", "return trampoline".cyan());
    }
    Ok(())
}

fn cmd_stubs(file: &Path, section: &str) -> anyhow::Result<()> {
    let object = ElfObject::load(file)?;
    let text = object
        .section(section)
        .with_context(|| format!("{}: no {} section", file.display(), section))?;

    let symbols = object.minimal_symbols();
    let found = pattern::scan_stubs(text.data, text.address);
    if found.is_empty() {
        println!("  {}", "no stubs found".yellow());
    }
    for stub in &found {
        let name = parisc_unwind::symbols::lookup_by_pc(symbols, stub.address)
            .map(|s| s.name.as_str())
            .unwrap_or("");
        println!(
            "  {}  {:<16} {}",
            format!("0x{:08x}", stub.address).cyan(),
            stub.kind,
            name.dimmed()
        );
    }
    Ok(())
}

fn cmd_frame(config: TargetConfig, file: &Path, regs: RegisterSet) -> anyhow::Result<()> {
    let session = open_session(config, file)?;
    let image = StaticImage::new(&session, regs.clone());

    let frame = Frame::new(&session, &image, 0, regs);
    let cache = frame.cache(&session, &image)?;
    println!("{}", frame);
    for (regnum, slot) in cache.saved.iter() {
        let name = registers::info(regnum).map_or("?", |info| info.name);
        match slot {
            SavedRegister::Addr(addr) => {
                let value = image.read_word(addr, session.convention().word_size());
                match value {
                    Ok(v) => println!("    {:<8} saved at 0x{:x} = 0x{:x}", name, addr, v),
                    Err(_) => println!("    {:<8} saved at 0x{:x} {}", name, addr, "(not in image)".dimmed()),
                }
            }
            SavedRegister::Value(v) => println!("    {:<8} = 0x{:x}", name, v),
            SavedRegister::SameAs(other) => {
                let other = registers::info(other).map_or("?", |info| info.name);
                println!("    {:<8} = {}", name, other);
            }
        }
    }

    // Saved registers live on a stack the image cannot see, so the walk
    // usually stops after a frame or two.
    match session.backtrace_from(&image, frame.registers.clone()) {
        Ok(frames) => {
            for f in frames.iter().skip(1) {
                print!("{}", f);
                if let Some(func) = f.function(&session) {
                    print!(" in {}", func.bold());
                }
                println!();
            }
        }
        Err(e) => println!("  {}: {}", "unwind failed".red(), e),
    }
    Ok(())
}
