// This file is part of OpenFA.
//
// OpenFA is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// OpenFA is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with OpenFA.  If not, see <http://www.gnu.org/licenses/>.
use anyhow::{Context, Result};
use i8086::{disassemble, parse_address, Image, SymbolTable, TraceConfig};
use log::{info, LevelFilter};
use mz::MzExecutable;
use std::{fs, num::ParseIntError, path::PathBuf};
use structopt::StructOpt;

fn from_hex(src: &str) -> Result<u16, ParseIntError> {
    if let Some(digits) = src.strip_prefix("0x") {
        return u16::from_str_radix(digits, 16);
    }
    u16::from_str_radix(src, 16)
}

/// Trace the reachable code of a DOS program and write an assembly listing
#[derive(Debug, StructOpt)]
struct Opt {
    /// The program to disassemble
    #[structopt(parse(from_os_str))]
    input: PathBuf,

    /// Segment that interrupt handlers installed by the program live in
    #[structopt(long, default_value = "0x28", parse(try_from_str = from_hex))]
    ivt_segment: u16,

    /// Extra entry point, as a linear hex address in the load module
    #[structopt(long = "entry", number_of_values = 1, parse(try_from_str = parse_address))]
    entries: Vec<u32>,

    /// CSV of known names: kind,address,label,description
    #[structopt(long, parse(from_os_str))]
    symbols: Option<PathBuf>,

    /// Where to write the listing; defaults to the input with an .asm extension
    #[structopt(short, long, parse(from_os_str))]
    output: Option<PathBuf>,

    /// Log each traced path
    #[structopt(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if opt.verbose {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();

    println!("disassembling {}...", opt.input.display());
    let content = fs::read(&opt.input)
        .with_context(|| format!("reading {}", opt.input.display()))?;
    let exe = MzExecutable::from_bytes(&content)?;
    show_header(&exe);

    let symbols = if let Some(path) = &opt.symbols {
        let fp = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
        SymbolTable::from_csv(fp).with_context(|| format!("loading {}", path.display()))?
    } else {
        SymbolTable::default()
    };

    let mut config = TraceConfig::new(opt.ivt_segment).with_entry(exe.entry_point());
    for entry in &opt.entries {
        config = config.with_entry(*entry);
    }

    let image = Image::new(exe.load_module().to_vec(), 0);
    let mut listing = disassemble(&image, &symbols, config)?;
    listing.add_comment(&format!(
        "Generated by trace-exe from {}",
        opt.input
            .file_name()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default()
    ));

    let output = opt
        .output
        .clone()
        .unwrap_or_else(|| opt.input.with_extension("asm"));
    fs::write(&output, listing.to_string())
        .with_context(|| format!("writing {}", output.display()))?;
    info!(
        "wrote {} code lines and {} errors",
        listing.code_lines(),
        listing.error_lines()
    );
    println!("wrote {}", output.display());

    Ok(())
}

fn show_header(exe: &MzExecutable) {
    println!(
        "Initial CS:IP = {:04X}:{:04X}",
        exe.entry_segment, exe.entry_offset
    );
    println!("Num Relocs = {}", exe.relocation_count);
    println!(
        "Header size = {} paragraphs = {} bytes",
        exe.header_paragraphs,
        exe.header_size()
    );
    println!("Image size = {} bytes", exe.image_size);
    println!("Reloc. Table Offset = {:04X}", exe.relocation_table_offset);
    println!("Relocations:");
    for reloc in &exe.relocs {
        println!("  offset:{:04X} segment:{:04X}", reloc.offset, reloc.segment);
    }
}
