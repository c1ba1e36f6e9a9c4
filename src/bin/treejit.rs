//! Command line front end: parse a tree IR file, print it back, assemble it
//! for a chosen ISA, dump the code or write it to an ELF object.

use clap::{Parser, ValueEnum};
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};
use log::info;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use treejit::codegen::{CompileOptions, MachineCode, VectorFallback};
use treejit::core::write_object;
use treejit::cpu::{Cpu, Isa, X86Feature};
use treejit::CompilationSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum IsaArg {
    Host,
    Aarch64,
    #[value(name = "x86-64")]
    X86_64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Emit {
    /// Pretty-print the parsed tree
    Tree,
    /// Hex dump of the machine code
    Hex,
    /// Disassembly (x86-64) or instruction words (AArch64)
    Asm,
    /// ELF relocatable object
    Obj,
}

#[derive(Parser, Debug)]
#[command(name = "treejit", about = "Assemble tree IR methods for AArch64 or x86-64.")]
struct Args {
    /// Input IR file, or `-` for stdin
    #[arg(required_unless_present = "cpu_info")]
    input: Option<String>,

    /// Target instruction set
    #[arg(long, value_enum, default_value_t = IsaArg::Host)]
    isa: IsaArg,

    /// What to produce
    #[arg(long, value_enum, default_value_t = Emit::Asm)]
    emit: Emit,

    /// Address the code is assembled for (decimal or 0x hex)
    #[arg(long, value_name = "ADDR", value_parser = parse_address, default_value = "0")]
    base: u64,

    /// Lower vector operations without a native instruction lane by lane
    #[arg(long, action = clap::ArgAction::SetTrue)]
    scalarize: bool,

    /// Model an x86-64 target with SSE4.1
    #[arg(long, action = clap::ArgAction::SetTrue)]
    sse41: bool,

    /// Output file (stdout for text output when omitted)
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Print the capability model of the target and exit
    #[arg(long, action = clap::ArgAction::SetTrue)]
    cpu_info: bool,
}

fn parse_address(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{text}': {e}"))
}

fn target_cpu(args: &Args) -> Result<Cpu, Box<dyn std::error::Error>> {
    let cpu = match args.isa {
        IsaArg::Host => Cpu::host().ok_or("the host instruction set is not supported")?,
        IsaArg::Aarch64 => Cpu::new(Isa::Aarch64),
        IsaArg::X86_64 => Cpu::new(Isa::X86_64),
    };
    if !args.sse41 {
        return Ok(cpu);
    }
    if cpu.isa() != Isa::X86_64 {
        return Err("--sse41 only applies to x86-64 targets".into());
    }
    Ok(Cpu::builder(cpu.logical_processor())
        .physical(cpu.physical_processor())
        .feature_words(cpu.features())
        .feature(X86Feature::Sse4_1)
        .build()?)
}

fn read_input(input: &str) -> io::Result<String> {
    if input == "-" {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text)?;
        Ok(text)
    } else {
        fs::read_to_string(input)
    }
}

fn hex_dump(code: &MachineCode) -> String {
    let mut out = String::new();
    for (i, line) in code.bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:016x} ", code.base + (i * 16) as u64);
        for byte in line {
            let _ = write!(out, " {byte:02x}");
        }
        out.push('\n');
    }
    out
}

fn disassemble(code: &MachineCode) -> String {
    let mut out = String::new();
    match code.isa {
        Isa::X86_64 => {
            let mut decoder = Decoder::with_ip(64, &code.bytes, code.base, DecoderOptions::NONE);
            let mut formatter = IntelFormatter::new();
            let mut instruction = Instruction::default();
            let mut text = String::new();
            while decoder.can_decode() {
                decoder.decode_out(&mut instruction);
                text.clear();
                formatter.format(&instruction, &mut text);
                let start = (instruction.ip() - code.base) as usize;
                let bytes: String = code.bytes[start..start + instruction.len()]
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect();
                let _ = writeln!(out, "{:016x}  {:<24} {}", instruction.ip(), bytes, text);
            }
        }
        Isa::Aarch64 => {
            for (i, word) in code.bytes.chunks_exact(4).enumerate() {
                let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                let _ = writeln!(out, "{:016x}  {word:08x}", code.base + (i * 4) as u64);
            }
        }
    }
    out
}

fn write_output(path: Option<&PathBuf>, bytes: &[u8]) -> io::Result<()> {
    match path {
        Some(path) => fs::write(path, bytes),
        None => io::stdout().write_all(bytes),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let cpu = target_cpu(&args)?;

    if args.cpu_info {
        println!("{cpu}");
        return Ok(());
    }
    let Some(input) = args.input.as_deref() else {
        return Err("no input given".into());
    };

    let fallback = if args.scalarize {
        VectorFallback::Scalarize
    } else {
        VectorFallback::Fail
    };
    let options = CompileOptions::default().with_vector_fallback(fallback);
    let mut session = CompilationSession::with_options(&cpu, options);
    let method = session.parse(&read_input(input)?)?;

    match args.emit {
        Emit::Tree => write_output(args.output.as_ref(), method.to_string().as_bytes())?,
        Emit::Hex => {
            let code = session.assemble(&method, args.base)?;
            write_output(args.output.as_ref(), hex_dump(&code).as_bytes())?;
        }
        Emit::Asm => {
            let code = session.assemble(&method, args.base)?;
            write_output(args.output.as_ref(), disassemble(&code).as_bytes())?;
        }
        Emit::Obj => {
            let code = session.assemble(&method, 0)?;
            let object = write_object(&code, method.symbol())?;
            let path = args
                .output
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("{}.o", method.symbol())));
            fs::write(&path, object)?;
            info!("wrote {}", path.display());
        }
    }
    info!("{}", session.stats());
    Ok(())
}
