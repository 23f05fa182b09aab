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
use crate::{
    cursor::{Cursor, DisassemblyError, Image},
    decoder::{Effect, Instr, MachineState, VectorWrite},
    listing::Listing,
    symbols::SymbolTable,
};
use anyhow::Result;
use log::{debug, trace, warn};
use std::collections::{HashSet, VecDeque};

#[derive(Clone, Debug)]
pub struct TraceConfig {
    pub entry_points: Vec<u32>,

    // Segment the program's interrupt handlers run in. Vector table writes only
    // carry the offset, so this has to come from outside.
    pub ivt_segment: u16,
}

impl TraceConfig {
    pub fn new(ivt_segment: u16) -> Self {
        Self {
            entry_points: Vec::new(),
            ivt_segment,
        }
    }

    pub fn with_entry(mut self, addr: u32) -> Self {
        self.entry_points.push(addr);
        self
    }

    pub fn ivt_handler(&self, handler: u16) -> u32 {
        u32::from(self.ivt_segment) * 16 + u32::from(handler)
    }
}

/// Follows control flow out from a set of entry points, decoding everything it can
/// reach exactly once.
pub struct Disassembler<'a> {
    image: &'a Image,
    symbols: &'a SymbolTable,
    config: TraceConfig,

    visited: HashSet<u32>,
    pending: VecDeque<(u32, MachineState)>,
    listing: Listing,
}

impl<'a> Disassembler<'a> {
    pub fn new(image: &'a Image, symbols: &'a SymbolTable, config: TraceConfig) -> Self {
        let mut listing = Listing::default();
        for (addr, sym) in symbols.subroutines() {
            listing.add_equate(*addr, &sym.label, &sym.description);
        }
        let mut disasm = Self {
            image,
            symbols,
            config,
            visited: HashSet::new(),
            pending: VecDeque::new(),
            listing,
        };

        // Known subroutines are anchors in their own right; some are only reached
        // through tables we cannot follow.
        let mut anchors = disasm.config.entry_points.clone();
        anchors.extend(symbols.subroutines().map(|(addr, _)| *addr));
        for addr in anchors {
            disasm.add_target(addr);
            disasm.listing.mark_subroutine(addr);
            disasm.schedule(addr, MachineState::default());
        }
        disasm
    }

    pub fn schedule(&mut self, addr: u32, state: MachineState) {
        trace!("scheduling 0x{:04X}", addr);
        self.pending.push_back((addr, state));
    }

    pub fn trace(&mut self) -> Result<()> {
        while let Some((addr, state)) = self.pending.pop_front() {
            if self.visited.contains(&addr) {
                trace!("skipping already visited 0x{:04X}", addr);
                continue;
            }
            debug!(
                "tracing at 0x{:04X} with {} entries remaining",
                addr,
                self.pending.len()
            );
            self.trace_path(addr, state)?;
        }
        Ok(())
    }

    // Decode straight-line code from addr until something ends the path.
    fn trace_path(&mut self, mut addr: u32, mut state: MachineState) -> Result<()> {
        while !self.visited.contains(&addr) {
            let mut cursor = Cursor::new(self.image, addr);
            let (instr, next_state) = match Instr::decode_one(&mut cursor, state) {
                Ok(decoded) => decoded,
                Err(e) => {
                    if let Some(DisassemblyError::OutOfBounds { addr: at }) =
                        e.downcast_ref::<DisassemblyError>()
                    {
                        self.out_of_bounds(addr, *at);
                        return Ok(());
                    }
                    return Err(e);
                }
            };

            for a in addr..instr.next_addr() {
                self.visited.insert(a);
            }
            let text = instr.show(self.symbols);
            trace!("0x{:04X}: {}", addr, text);

            if let Effect::Illegal(bytes) = &instr.effect {
                debug!("illegal instruction at 0x{:04X}: {:02X?}", addr, bytes);
                self.listing.push_error(addr, &instr.raw, text);
                return Ok(());
            }
            self.listing.push_code(addr, &instr.raw, text);

            if let Some(write) = instr.vector_write {
                self.vector_write(addr, write);
            }

            let next = instr.next_addr();
            match instr.effect {
                Effect::Fallthrough => {}
                Effect::Branch(target) => {
                    self.add_target(target);
                    self.schedule(target, next_state);
                }
                Effect::Jump(target) => {
                    self.add_target(target);
                    self.schedule(target, next_state);
                    return Ok(());
                }
                Effect::Call(target) => {
                    self.add_target(target);
                    self.listing.mark_subroutine(target);
                    self.schedule(target, next_state);
                }
                Effect::Return | Effect::Exit | Effect::Illegal(_) => return Ok(()),
            }

            addr = next;
            state = next_state;
        }
        trace!("path rejoined visited code at 0x{:04X}", addr);
        Ok(())
    }

    fn out_of_bounds(&mut self, start: u32, at: u32) {
        debug!("decode at 0x{:04X} ran out of image at 0x{:04X}", start, at);
        let bytes = self.image.slice(start, at).to_vec();
        self.visited.insert(start);
        for i in 0..bytes.len() as u32 {
            self.visited.insert(start + i);
        }
        self.listing.push_error(
            start,
            &bytes,
            format!(
                "; DISASM ERROR! Instruction runs past the end of the image (at 0x{:04X})",
                at
            ),
        );
    }

    fn vector_write(&mut self, addr: u32, write: VectorWrite) {
        let handler = self.config.ivt_handler(write.handler);
        warn!(
            "0x{:04X}: interrupt 0x{:02X} set to offset 0x{:04X}; assuming a handler at {:04X}:{:04X} (0x{:04X})",
            addr,
            write.slot / 4,
            write.handler,
            self.config.ivt_segment,
            write.handler,
            handler
        );
        self.add_target(handler);
        self.listing.mark_subroutine(handler);
        self.schedule(handler, MachineState::default());
    }

    fn add_target(&mut self, addr: u32) {
        self.listing.add_label(addr, self.symbols.resolve(addr));
    }

    pub fn visited(&self) -> &HashSet<u32> {
        &self.visited
    }

    /// Finish the listing, covering everything the trace never reached with data.
    pub fn into_listing(mut self) -> Listing {
        self.listing.fill_data(self.image);
        debug!(
            "traced {} code lines and {} errors over {} of {} bytes",
            self.listing.code_lines(),
            self.listing.error_lines(),
            self.visited.len(),
            self.image.len()
        );
        self.listing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::Entry;

    fn run(code: &[u8], base: u32, config: TraceConfig) -> Result<(Listing, HashSet<u32>)> {
        let _ = env_logger::builder().is_test(true).try_init();
        let image = Image::new(code.to_vec(), base);
        let symbols = SymbolTable::default();
        let mut disasm = Disassembler::new(&image, &symbols, config);
        disasm.trace()?;
        let visited = disasm.visited().clone();
        Ok((disasm.into_listing(), visited))
    }

    fn text(listing: &Listing, addr: u32) -> Option<&str> {
        match listing.get(addr) {
            Some(Entry::Code { text, .. }) => Some(text),
            Some(Entry::Error { text, .. }) => Some(text),
            _ => None,
        }
    }

    #[test]
    fn it_stops_on_self_jump() -> Result<()> {
        let (listing, visited) = run(&[0xEB, 0xFE], 0x100, TraceConfig::new(0x28).with_entry(0x100))?;
        assert_eq!(text(&listing, 0x100), Some("jmp LABEL_0100"));
        assert_eq!(listing.label(0x100), Some("LABEL_0100"));
        assert_eq!(visited.len(), 2);
        assert_eq!(listing.code_lines(), 1);
        Ok(())
    }

    #[test]
    fn it_follows_calls() -> Result<()> {
        let mut code = vec![0x90; 0x206];
        code[0x200..0x206].copy_from_slice(&[0xE8, 0x00, 0x00, 0x90, 0xCD, 0x20]);
        let (listing, _) = run(&code, 0, TraceConfig::new(0x28).with_entry(0x200))?;
        assert_eq!(text(&listing, 0x200), Some("call LABEL_0203"));
        assert_eq!(text(&listing, 0x203), Some("nop"));
        assert_eq!(text(&listing, 0x204), Some("int 0x20"));
        assert!(listing.is_subroutine(0x203));
        assert!(matches!(listing.get(0), Some(Entry::Data { .. })));
        Ok(())
    }

    #[test]
    fn it_follows_vector_table_writes() -> Result<()> {
        let mut code = vec![0x00; 0x3A4];
        code[0..9].copy_from_slice(&[0x26, 0xC7, 0x06, 0x20, 0x00, 0x23, 0x01, 0xCD, 0x20]);
        code[0x3A3] = 0xCF;
        let (listing, visited) = run(&code, 0, TraceConfig::new(0x28).with_entry(0))?;
        assert_eq!(text(&listing, 0), Some("mov word es:[0x0020], 0x0123"));
        assert_eq!(text(&listing, 7), Some("int 0x20"));
        assert_eq!(text(&listing, 0x3A3), Some("iret"));
        assert_eq!(listing.label(0x3A3), Some("LABEL_03A3"));
        assert!(visited.contains(&0x3A3));
        Ok(())
    }

    #[test]
    fn ivt_segment_is_configurable() -> Result<()> {
        let mut code = vec![0x00; 0x104];
        code[0..9].copy_from_slice(&[0x26, 0xC7, 0x06, 0x00, 0x00, 0x03, 0x00, 0xCD, 0x20]);
        code[0x103] = 0xCF;
        let (listing, _) = run(&code, 0, TraceConfig::new(0x10).with_entry(0))?;
        assert_eq!(text(&listing, 0x103), Some("iret"));
        Ok(())
    }

    #[test]
    fn illegal_opcodes_do_not_stop_other_entries() -> Result<()> {
        let config = TraceConfig::new(0x28).with_entry(0).with_entry(1);
        let (listing, _) = run(&[0xF4, 0x90, 0xC3], 0, config)?;
        assert_eq!(
            text(&listing, 0),
            Some("; DISASM ERROR! Illegal instruction (opcode = 0xF4)")
        );
        assert_eq!(listing.error_lines(), 1);
        assert_eq!(text(&listing, 1), Some("nop"));
        assert_eq!(text(&listing, 2), Some("ret"));
        Ok(())
    }

    #[test]
    fn it_decodes_each_address_once() -> Result<()> {
        // A branch back to itself, then a jump into the branch's own bytes.
        let code = [0x74, 0xFE, 0xEB, 0xFD, 0xC3];
        let (listing, visited) = run(&code, 0, TraceConfig::new(0x28).with_entry(0))?;
        assert_eq!(text(&listing, 0), Some("je LABEL_0000"));
        assert_eq!(text(&listing, 2), Some("jmp LABEL_0001"));
        assert_eq!(listing.get(1), None);
        assert_eq!(listing.code_lines(), 2);
        assert_eq!(visited.len(), 4);
        assert!(matches!(listing.get(4), Some(Entry::Data { .. })));
        Ok(())
    }

    #[test]
    fn dos_exit_ends_the_path() -> Result<()> {
        let code = [0xB8, 0x00, 0x4C, 0xCD, 0x21, 0x90];
        let (listing, visited) = run(&code, 0, TraceConfig::new(0x28).with_entry(0))?;
        assert_eq!(text(&listing, 3), Some("int 0x21"));
        assert!(!visited.contains(&5));
        assert_eq!(listing.get(5), Some(&Entry::Data { bytes: vec![0x90] }));
        Ok(())
    }

    #[test]
    fn branch_targets_inherit_the_accumulator() -> Result<()> {
        // mov ah, 0x4C; je +2; ret; nop; nop; int 0x21; nop
        let code = [0xB4, 0x4C, 0x74, 0x02, 0xC3, 0x90, 0xCD, 0x21, 0x90];
        let (listing, visited) = run(&code, 0, TraceConfig::new(0x28).with_entry(0))?;
        assert_eq!(text(&listing, 6), Some("int 0x21"));
        assert!(!visited.contains(&5));
        assert!(!visited.contains(&8));
        Ok(())
    }

    #[test]
    fn overlapping_decodes_are_not_repeated_as_data() -> Result<()> {
        // Entry 1 decodes mov ax over bytes 1..4; entry 0 then decodes mov al over 0..2.
        let image = Image::new(vec![0xB0, 0xB8, 0x34, 0x12, 0xC3], 0);
        let symbols = SymbolTable::default();
        let config = TraceConfig::new(0x28).with_entry(1).with_entry(0);
        let listing = crate::disassemble(&image, &symbols, config)?;
        assert_eq!(text(&listing, 0), Some("mov al, 0xB8"));
        assert_eq!(text(&listing, 1), Some("mov ax, 0x1234"));
        assert_eq!(text(&listing, 4), Some("ret"));
        assert_eq!(listing.get(2), None);
        assert!(!listing
            .entries()
            .any(|(_, entry)| matches!(entry, Entry::Data { .. })));
        assert!(!listing.to_string().contains("db "));
        Ok(())
    }

    #[test]
    fn it_reports_running_off_the_image() -> Result<()> {
        let (listing, visited) = run(&[0x90, 0xB8, 0x00], 0, TraceConfig::new(0x28).with_entry(0))?;
        assert_eq!(text(&listing, 0), Some("nop"));
        assert!(matches!(listing.get(1), Some(Entry::Error { bytes, .. }) if bytes == &vec![0xB8, 0x00]));
        assert!(listing
            .to_string()
            .contains("the image (at 0x0003); @0001: B8 00\n"));
        assert!(visited.contains(&2));
        Ok(())
    }

    #[test]
    fn known_subroutines_are_traced_and_named() -> Result<()> {
        let image = Image::new(vec![0xE8, 0x01, 0x00, 0xC3, 0xC3, 0x90, 0xC3], 0);
        let mut symbols = SymbolTable::default();
        symbols.add_subroutine(0x0004, "done", "returns immediately");
        symbols.add_subroutine(0x0005, "orphan", "only reached indirectly");
        let mut disasm = Disassembler::new(&image, &symbols, TraceConfig::new(0x28).with_entry(0));
        disasm.trace()?;
        let listing = disasm.into_listing();
        assert_eq!(text(&listing, 0), Some("call done"));
        assert_eq!(text(&listing, 5), Some("nop"));

        let rendered = listing.to_string();
        assert!(rendered.contains("done:\tequ 0x0004\t; returns immediately\n"));
        assert!(rendered.contains("LABEL_0000:\n"));
        assert!(!rendered.contains("done:\n"));
        Ok(())
    }
}
