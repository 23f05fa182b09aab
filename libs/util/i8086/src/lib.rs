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
mod cursor;
mod decoder;
mod listing;
mod lut;
mod symbols;
mod trace;

pub use crate::{
    cursor::{Cursor, DisassemblyError, Image},
    decoder::{Address, Effect, Instr, MachineState, MemRef, Operand, VectorWrite, IVT_LIMIT},
    listing::{bs2s, Entry, Listing},
    lut::{Memonic, Reg},
    symbols::{parse_address, Symbol, SymbolTable},
    trace::{Disassembler, TraceConfig},
};

use anyhow::Result;

/// Trace `image` from every entry point in `config` and return the finished listing.
pub fn disassemble(image: &Image, symbols: &SymbolTable, config: TraceConfig) -> Result<Listing> {
    let mut disasm = Disassembler::new(image, symbols, config);
    disasm.trace()?;
    Ok(disasm.into_listing())
}
