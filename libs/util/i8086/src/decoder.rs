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
    cursor::Cursor,
    lut::{Memonic, Reg, ALU_OPS, EFFECTIVE_ADDRESSES, PREFIX_CODES, SIMPLE_OPCODES, UNARY_OPS},
    symbols::SymbolTable,
};
use anyhow::{bail, Result};
use log::debug;
use std::fmt;

// Largest value a stored word can have and still be read as an offset into the vector table.
pub const IVT_LIMIT: u16 = 0x03FF;

const DOS_SERVICES: u8 = 0x21;
const DOS_TERMINATE: u8 = 0x20;
const DOS_EXIT_FUNCTION: u8 = 0x4C;

/// What little of the machine we follow between instructions: the two halves of the
/// accumulator, each unknown until something loads a constant into it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MachineState {
    al: Option<u8>,
    ah: Option<u8>,
}

impl MachineState {
    pub fn ax(&self) -> Option<u16> {
        match (self.ah, self.al) {
            (Some(hi), Some(lo)) => Some(u16::from_le_bytes([lo, hi])),
            _ => None,
        }
    }

    pub fn ah(&self) -> Option<u8> {
        self.ah
    }

    // Record that `reg` now holds `value`, or something we cannot know if None.
    fn load(&mut self, reg: Reg, value: Option<u16>) {
        match reg {
            Reg::AL => self.al = value.map(|v| v as u8),
            Reg::AH => self.ah = value.map(|v| v as u8),
            Reg::AX => {
                self.al = value.map(|v| v as u8);
                self.ah = value.map(|v| (v >> 8) as u8);
            }
            _ => {}
        }
    }

    fn clobber(&mut self, reg: Reg) {
        self.load(reg, None);
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Address {
    Direct(u16),
    Indirect {
        base: Reg,
        index: Option<Reg>,
        displacement: i16,
    },
}

// size seg:[address]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemRef {
    pub segment: Option<Reg>,
    pub address: Address,
    pub size: Option<u8>, // 1 or 2, when the other operand does not imply it
}

impl MemRef {
    fn direct(addr: u16, size: Option<u8>, prefix: &OpPrefix) -> Self {
        Self {
            segment: prefix.segment,
            address: Address::Direct(addr),
            size,
        }
    }

    pub fn show(&self, symbols: &SymbolTable) -> String {
        let size = match self.size {
            Some(1) => "byte ",
            Some(2) => "word ",
            _ => "",
        };
        let seg = if let Some(r) = self.segment {
            format!("{}:", r)
        } else {
            "".to_owned()
        };
        let inner = match &self.address {
            Address::Direct(addr) => symbols.variable(*addr),
            Address::Indirect {
                base,
                index,
                displacement,
            } => {
                let mut s = base.to_string();
                if let Some(index) = index {
                    s += &format!(" + {}", index);
                }
                if *displacement > 0 {
                    s += &format!(" + 0x{:02X}", displacement);
                } else if *displacement < 0 {
                    s += &format!(" - 0x{:02X}", displacement.unsigned_abs());
                }
                s
            }
        };
        format!("{}{}[{}]", size, seg, inner)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Operand {
    Register(Reg),
    Imm8(u8),
    Imm16(u16),
    Memory(MemRef),
    // Absolute destination of a relative branch or call.
    Target(u32),
}

impl Operand {
    pub fn show(&self, symbols: &SymbolTable) -> String {
        match self {
            Operand::Register(r) => r.to_string(),
            Operand::Imm8(v) => format!("0x{:02X}", v),
            Operand::Imm16(v) => format!("0x{:04X}", v),
            Operand::Memory(mr) => mr.show(symbols),
            Operand::Target(addr) => symbols.resolve(*addr),
        }
    }
}

/// How an instruction hands control on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Effect {
    Fallthrough,
    Branch(u32),
    Jump(u32),
    Call(u32),
    Return,
    // The program asked DOS to end it.
    Exit,
    // No rule matched; carries every byte consumed.
    Illegal(Vec<u8>),
}

impl Effect {
    // Whether decoding may continue at the next address.
    pub fn falls_through(&self) -> bool {
        matches!(
            self,
            Effect::Fallthrough | Effect::Branch(_) | Effect::Call(_)
        )
    }
}

/// A word stored through es: into the low vector table, which we take to be the
/// program installing an interrupt handler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VectorWrite {
    pub slot: u16,
    pub handler: u16,
}

#[derive(Debug, Default)]
struct OpPrefix {
    segment: Option<Reg>,
    repeat: bool,
}

impl OpPrefix {
    fn apply(mut self, b: u8) -> Result<Self> {
        match b {
            0x26 => self.segment = Some(Reg::ES),
            0x2E => self.segment = Some(Reg::CS),
            0xF3 => self.repeat = true,
            _ => bail!("not an op prefix: 0x{:02X}", b),
        }
        Ok(self)
    }
}

// The shape-specific part of an instruction, before it is tied to its address and bytes.
struct Form {
    memonic: Memonic,
    operands: Vec<Operand>,
    effect: Effect,
    vector_write: Option<VectorWrite>,
}

impl Form {
    fn new(memonic: Memonic, operands: Vec<Operand>) -> Self {
        Self {
            memonic,
            operands,
            effect: Effect::Fallthrough,
            vector_write: None,
        }
    }

    fn with_effect(mut self, effect: Effect) -> Self {
        self.effect = effect;
        self
    }

    fn illegal(bytes: &[u8]) -> Self {
        Self::new(Memonic::Invalid, vec![]).with_effect(Effect::Illegal(bytes.to_vec()))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instr {
    pub addr: u32,
    pub memonic: Memonic,
    pub operands: Vec<Operand>,
    pub raw: Vec<u8>,
    pub repeat: bool,
    pub effect: Effect,
    pub vector_write: Option<VectorWrite>,
}

impl Instr {
    /// Decode the instruction at the cursor, returning it along with the machine state
    /// that holds after it.
    pub fn decode_one(cursor: &mut Cursor, state: MachineState) -> Result<(Instr, MachineState)> {
        let mut prefix = OpPrefix::default();
        let mut op = cursor.fetch()?;
        while PREFIX_CODES.contains(&op) {
            prefix = prefix.apply(op)?;
            op = cursor.fetch()?;
        }

        let mut decoder = OpDecoder {
            cursor,
            prefix,
            state,
        };
        let form = decoder.decode(op)?;
        let OpDecoder {
            cursor,
            prefix,
            state,
        } = decoder;

        Ok((
            Instr {
                addr: cursor.start(),
                memonic: form.memonic,
                operands: form.operands,
                raw: cursor.consumed().to_vec(),
                repeat: prefix.repeat,
                effect: form.effect,
                vector_write: form.vector_write,
            },
            state,
        ))
    }

    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn next_addr(&self) -> u32 {
        self.addr + self.raw.len() as u32
    }

    pub fn is_illegal(&self) -> bool {
        matches!(self.effect, Effect::Illegal(_))
    }

    pub fn show(&self, symbols: &SymbolTable) -> String {
        if let Effect::Illegal(bytes) = &self.effect {
            let opcode = bytes
                .iter()
                .map(|b| format!("0x{:02X}", b))
                .collect::<Vec<_>>()
                .join(" ");
            return format!("; DISASM ERROR! Illegal instruction (opcode = {})", opcode);
        }
        let mut s = String::new();
        if self.repeat {
            s += "rep ";
        }
        s += self.memonic.name();
        for (i, op) in self.operands.iter().enumerate() {
            s += if i == 0 { " " } else { ", " };
            s += &op.show(symbols);
        }
        s
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.show(&SymbolTable::default()))
    }
}

// Relative targets wrap within the 64KiB window holding the next instruction. Below
// 0x10000 this is the plain 16 bit mask.
fn relative(next: u32, displacement: i16) -> u32 {
    (next & !0xFFFF) | u32::from((next as u16).wrapping_add(displacement as u16))
}

fn modrm(b: u8) -> (u8, u8, u8) {
    (b >> 6, (b >> 3) & 0b111, b & 0b111)
}

struct OpDecoder<'c, 'a> {
    cursor: &'c mut Cursor<'a>,
    prefix: OpPrefix,
    state: MachineState,
}

impl<'c, 'a> OpDecoder<'c, 'a> {
    fn decode(&mut self, op: u8) -> Result<Form> {
        if let Some(def) = SIMPLE_OPCODES.get(&op) {
            match def.memonic {
                Memonic::Pop => def.operands.iter().for_each(|r| self.state.clobber(*r)),
                Memonic::PopAll => self.state.clobber(Reg::AX),
                _ => {}
            }
            return Ok(Form::new(
                def.memonic,
                def.operands.iter().map(|r| Operand::Register(*r)).collect(),
            ));
        }

        Ok(match op {
            0x0C => self.alu_al_imm8(Memonic::Or)?,
            0x24 => self.alu_al_imm8(Memonic::And)?,
            0xA8 => self.alu_al_imm8(Memonic::Test)?,
            0x2B => self.sub_reg16()?,
            0x3D => Form::new(
                Memonic::Compare,
                vec![
                    Operand::Register(Reg::AX),
                    Operand::Imm16(self.cursor.fetch_u16()?),
                ],
            ),
            0x68 => Form::new(Memonic::Push, vec![Operand::Imm16(self.cursor.fetch_u16()?)]),
            0x6A => Form::new(Memonic::Push, vec![Operand::Imm8(self.cursor.fetch()?)]),
            0x72 => self.branch8(Memonic::Jc)?,
            0x74 => self.branch8(Memonic::Je)?,
            0x75 => self.branch8(Memonic::Jne)?,
            0x80 => self.group_80()?,
            0x81 => self.group_81()?,
            0x83 => self.group_83()?,
            0x88..=0x8B => self.move_rm(op)?,
            0x8C => self.move_from_sreg()?,
            0x8E => self.move_to_sreg()?,
            0x8F => self.group_8f()?,
            0xA0 => {
                let addr = self.cursor.fetch_u16()?;
                self.state.clobber(Reg::AL);
                Form::new(
                    Memonic::Move,
                    vec![
                        Operand::Register(Reg::AL),
                        Operand::Memory(MemRef::direct(addr, None, &self.prefix)),
                    ],
                )
            }
            0xA2 => {
                let addr = self.cursor.fetch_u16()?;
                if self.prefix.segment == Some(Reg::ES) && addr <= IVT_LIMIT {
                    debug!("byte store into interrupt vector table at es:0x{:04X}", addr);
                }
                Form::new(
                    Memonic::Move,
                    vec![
                        Operand::Memory(MemRef::direct(addr, None, &self.prefix)),
                        Operand::Register(Reg::AL),
                    ],
                )
            }
            0xB0..=0xB7 => {
                let reg = Reg::reg8(op);
                let imm = self.cursor.fetch()?;
                self.state.load(reg, Some(u16::from(imm)));
                Form::new(
                    Memonic::Move,
                    vec![Operand::Register(reg), Operand::Imm8(imm)],
                )
            }
            0xB8..=0xBF => {
                let reg = Reg::reg16(op);
                let imm = self.cursor.fetch_u16()?;
                self.state.load(reg, Some(imm));
                Form::new(
                    Memonic::Move,
                    vec![Operand::Register(reg), Operand::Imm16(imm)],
                )
            }
            0xC3 => Form::new(Memonic::Return, vec![]).with_effect(Effect::Return),
            0xC6 => self.group_c6()?,
            0xC7 => self.group_c7()?,
            0xCD => self.interrupt()?,
            0xCF => Form::new(Memonic::InterruptReturn, vec![]).with_effect(Effect::Return),
            0xE4 => {
                let port = self.cursor.fetch()?;
                self.state.clobber(Reg::AL);
                Form::new(
                    Memonic::In,
                    vec![Operand::Register(Reg::AL), Operand::Imm8(port)],
                )
            }
            0xE6 => {
                let port = self.cursor.fetch()?;
                Form::new(
                    Memonic::Out,
                    vec![Operand::Imm8(port), Operand::Register(Reg::AL)],
                )
            }
            0xE8 => {
                let target = self.relative16()?;
                Form::new(Memonic::Call, vec![Operand::Target(target)])
                    .with_effect(Effect::Call(target))
            }
            0xE9 => {
                let target = self.relative16()?;
                Form::new(Memonic::Jump, vec![Operand::Target(target)])
                    .with_effect(Effect::Jump(target))
            }
            0xEB => {
                let target = self.relative8()?;
                Form::new(Memonic::Jump, vec![Operand::Target(target)])
                    .with_effect(Effect::Jump(target))
            }
            0xF7 => self.group_f7()?,
            0xFF => self.group_ff()?,
            _ => self.illegal(),
        })
    }

    fn illegal(&self) -> Form {
        Form::illegal(self.cursor.consumed())
    }

    // Register-direct operands reached through a mod-reg-r/m byte may be written by the
    // instruction; forget anything we knew about them.
    fn written(&mut self, memonic: Memonic, dest: &Operand) {
        if memonic.writes_destination() {
            if let Operand::Register(r) = dest {
                self.state.clobber(*r);
            }
        }
    }

    fn relative8(&mut self) -> Result<u32> {
        let disp = self.cursor.fetch()? as i8;
        Ok(relative(self.cursor.pc(), i16::from(disp)))
    }

    fn relative16(&mut self) -> Result<u32> {
        let disp = self.cursor.fetch_u16()? as i16;
        Ok(relative(self.cursor.pc(), disp))
    }

    fn branch8(&mut self, memonic: Memonic) -> Result<Form> {
        let target = self.relative8()?;
        Ok(Form::new(memonic, vec![Operand::Target(target)]).with_effect(Effect::Branch(target)))
    }

    fn alu_al_imm8(&mut self, memonic: Memonic) -> Result<Form> {
        let imm = self.cursor.fetch()?;
        let dest = Operand::Register(Reg::AL);
        self.written(memonic, &dest);
        Ok(Form::new(memonic, vec![dest, Operand::Imm8(imm)]))
    }

    // Memory operand for a mod field other than 0b11.
    fn read_memory(&mut self, mod_: u8, rm: u8, size: Option<u8>) -> Result<MemRef> {
        let indirect = |displacement: i16| {
            let (base, index) = EFFECTIVE_ADDRESSES[rm as usize];
            Address::Indirect {
                base,
                index,
                displacement,
            }
        };
        let address = match (mod_, rm) {
            (0b00, 0b110) => Address::Direct(self.cursor.fetch_u16()?),
            (0b00, _) => indirect(0),
            (0b01, _) => indirect(i16::from(self.cursor.fetch()? as i8)),
            (0b10, _) => indirect(self.cursor.fetch_u16()? as i16),
            _ => bail!("mod {:02b} has no memory operand", mod_),
        };
        Ok(MemRef {
            segment: self.prefix.segment,
            address,
            size,
        })
    }

    // 2B: sub r16, r/m16
    fn sub_reg16(&mut self) -> Result<Form> {
        let (mod_, reg, rm) = modrm(self.cursor.fetch()?);
        if mod_ != 0b11 {
            return Ok(self.illegal());
        }
        let dest = Operand::Register(Reg::reg16(reg));
        self.written(Memonic::Sub, &dest);
        Ok(Form::new(
            Memonic::Sub,
            vec![dest, Operand::Register(Reg::reg16(rm))],
        ))
    }

    // 80 /op: op byte [addr], imm8
    fn group_80(&mut self) -> Result<Form> {
        let (mod_, reg, rm) = modrm(self.cursor.fetch()?);
        if mod_ != 0b00 || rm != 0b110 {
            return Ok(self.illegal());
        }
        let addr = self.cursor.fetch_u16()?;
        let imm = self.cursor.fetch()?;
        Ok(Form::new(
            ALU_OPS[reg as usize],
            vec![
                Operand::Memory(MemRef::direct(addr, Some(1), &self.prefix)),
                Operand::Imm8(imm),
            ],
        ))
    }

    // 81 /op: op r16, imm16
    fn group_81(&mut self) -> Result<Form> {
        let (mod_, reg, rm) = modrm(self.cursor.fetch()?);
        if mod_ != 0b11 {
            return Ok(self.illegal());
        }
        let memonic = ALU_OPS[reg as usize];
        let dest = Operand::Register(Reg::reg16(rm));
        let imm = self.cursor.fetch_u16()?;
        self.written(memonic, &dest);
        Ok(Form::new(memonic, vec![dest, Operand::Imm16(imm)]))
    }

    // 83 /op: op r/m16, imm8
    fn group_83(&mut self) -> Result<Form> {
        let (mod_, reg, rm) = modrm(self.cursor.fetch()?);
        let memonic = ALU_OPS[reg as usize];
        let dest = if mod_ == 0b11 {
            Operand::Register(Reg::reg16(rm))
        } else {
            Operand::Memory(self.read_memory(mod_, rm, Some(2))?)
        };
        let imm = self.cursor.fetch()?;
        self.written(memonic, &dest);
        Ok(Form::new(memonic, vec![dest, Operand::Imm8(imm)]))
    }

    // 88-8B: mov between r/m and reg. Bit 1 is the direction (set means reg is the
    // destination) and bit 0 the width.
    fn move_rm(&mut self, op: u8) -> Result<Form> {
        let to_reg = op & 0b10 != 0;
        let wide = op & 0b01 != 0;
        let (mod_, reg, rm) = modrm(self.cursor.fetch()?);
        let reg = Operand::Register(Reg::sized(reg, wide));
        let rm = match (mod_, rm) {
            (0b11, _) => Operand::Register(Reg::sized(rm, wide)),
            (0b00, 0b110) => Operand::Memory(self.read_memory(mod_, rm, None)?),
            _ => return Ok(self.illegal()),
        };
        let operands = if to_reg { vec![reg, rm] } else { vec![rm, reg] };
        self.written(Memonic::Move, &operands[0]);
        Ok(Form::new(Memonic::Move, operands))
    }

    // 8C: mov r16, sreg
    fn move_from_sreg(&mut self) -> Result<Form> {
        let (mod_, reg, rm) = modrm(self.cursor.fetch()?);
        if mod_ != 0b11 || reg > 0b011 {
            return Ok(self.illegal());
        }
        let dest = Operand::Register(Reg::reg16(rm));
        self.written(Memonic::Move, &dest);
        Ok(Form::new(
            Memonic::Move,
            vec![dest, Operand::Register(Reg::sreg(reg))],
        ))
    }

    // 8E: mov sreg, r16
    fn move_to_sreg(&mut self) -> Result<Form> {
        let (mod_, reg, rm) = modrm(self.cursor.fetch()?);
        if mod_ != 0b11 || reg > 0b011 {
            return Ok(self.illegal());
        }
        Ok(Form::new(
            Memonic::Move,
            vec![
                Operand::Register(Reg::sreg(reg)),
                Operand::Register(Reg::reg16(rm)),
            ],
        ))
    }

    // 8F /0: pop [addr]
    fn group_8f(&mut self) -> Result<Form> {
        if self.cursor.fetch()? != 0x06 {
            return Ok(self.illegal());
        }
        let addr = self.cursor.fetch_u16()?;
        Ok(Form::new(
            Memonic::Pop,
            vec![Operand::Memory(MemRef::direct(addr, None, &self.prefix))],
        ))
    }

    // C6 /0: mov byte [addr], imm8
    fn group_c6(&mut self) -> Result<Form> {
        if self.cursor.fetch()? != 0x06 {
            return Ok(self.illegal());
        }
        let addr = self.cursor.fetch_u16()?;
        let imm = self.cursor.fetch()?;
        Ok(Form::new(
            Memonic::Move,
            vec![
                Operand::Memory(MemRef::direct(addr, Some(1), &self.prefix)),
                Operand::Imm8(imm),
            ],
        ))
    }

    // C7 /0: mov word [addr], imm16
    fn group_c7(&mut self) -> Result<Form> {
        if self.cursor.fetch()? != 0x06 {
            return Ok(self.illegal());
        }
        let addr = self.cursor.fetch_u16()?;
        let value = self.cursor.fetch_u16()?;
        let mut form = Form::new(
            Memonic::Move,
            vec![
                Operand::Memory(MemRef::direct(addr, Some(2), &self.prefix)),
                Operand::Imm16(value),
            ],
        );
        // The offset half of a vector lives at the 4 byte aligned slot address.
        if self.prefix.segment == Some(Reg::ES) && value <= IVT_LIMIT && addr % 4 == 0 {
            form.vector_write = Some(VectorWrite {
                slot: addr,
                handler: value,
            });
        }
        Ok(form)
    }

    // CD: int imm8
    fn interrupt(&mut self) -> Result<Form> {
        let n = self.cursor.fetch()?;
        let exits = n == DOS_TERMINATE
            || (n == DOS_SERVICES && self.state.ah() == Some(DOS_EXIT_FUNCTION));
        // Services hand results back in ax.
        self.state.clobber(Reg::AX);
        let form = Form::new(Memonic::Interrupt, vec![Operand::Imm8(n)]);
        Ok(if exits {
            form.with_effect(Effect::Exit)
        } else {
            form
        })
    }

    // F7 /op: op r16
    fn group_f7(&mut self) -> Result<Form> {
        let (mod_, reg, rm) = modrm(self.cursor.fetch()?);
        let memonic = match UNARY_OPS[reg as usize] {
            Some(memonic) if mod_ == 0b11 => memonic,
            _ => return Ok(self.illegal()),
        };
        let operand = Operand::Register(Reg::reg16(rm));
        match memonic {
            Memonic::Not | Memonic::Neg => self.written(memonic, &operand),
            _ => self.state.clobber(Reg::AX),
        }
        Ok(Form::new(memonic, vec![operand]))
    }

    // FF /6: push [addr]
    fn group_ff(&mut self) -> Result<Form> {
        if self.cursor.fetch()? != 0x36 {
            return Ok(self.illegal());
        }
        let addr = self.cursor.fetch_u16()?;
        Ok(Form::new(
            Memonic::Push,
            vec![Operand::Memory(MemRef::direct(addr, None, &self.prefix))],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{DisassemblyError, Image};

    fn decode_at(bytes: &[u8], addr: u32, state: MachineState) -> Result<(Instr, MachineState)> {
        let image = Image::new(bytes.to_vec(), addr);
        let mut cursor = Cursor::new(&image, addr);
        Instr::decode_one(&mut cursor, state)
    }

    fn decode(bytes: &[u8]) -> Result<Instr> {
        Ok(decode_at(bytes, 0, MachineState::default())?.0)
    }

    fn text(bytes: &[u8]) -> Result<String> {
        Ok(decode(bytes)?.to_string())
    }

    #[test]
    fn it_decodes_simple_opcodes() -> Result<()> {
        assert_eq!(text(&[0x06])?, "push es");
        assert_eq!(text(&[0x1F])?, "pop ds");
        assert_eq!(text(&[0x52])?, "push dx");
        assert_eq!(text(&[0x60])?, "pusha");
        assert_eq!(text(&[0xA4])?, "movsb");
        assert_eq!(text(&[0xFA])?, "cli");
        assert_eq!(decode(&[0x90])?.effect, Effect::Fallthrough);
        Ok(())
    }

    #[test]
    fn it_keeps_immediates() -> Result<()> {
        let instr = decode(&[0xB8, 0x34, 0x12])?;
        assert_eq!(instr.size(), 3);
        assert_eq!(instr.operands[1], Operand::Imm16(0x1234));
        assert_eq!(instr.to_string(), "mov ax, 0x1234");
        assert_eq!(text(&[0xBF, 0x00, 0x02])?, "mov di, 0x0200");
        assert_eq!(text(&[0xB4, 0x09])?, "mov ah, 0x09");
        assert_eq!(text(&[0x0C, 0x80])?, "or al, 0x80");
        assert_eq!(text(&[0x24, 0x0F])?, "and al, 0x0F");
        assert_eq!(text(&[0xA8, 0x01])?, "test al, 0x01");
        assert_eq!(text(&[0x3D, 0xFF, 0x00])?, "cmp ax, 0x00FF");
        assert_eq!(text(&[0x68, 0x00, 0xB8])?, "push 0xB800");
        assert_eq!(text(&[0x6A, 0x07])?, "push 0x07");
        assert_eq!(text(&[0xE4, 0x60])?, "in al, 0x60");
        assert_eq!(text(&[0xE6, 0x20])?, "out 0x20, al");
        Ok(())
    }

    #[test]
    fn it_computes_branch_targets() -> Result<()> {
        let (jmp, _) = decode_at(&[0xEB, 0xFE], 0x100, MachineState::default())?;
        assert_eq!(jmp.effect, Effect::Jump(0x100));
        assert_eq!(jmp.to_string(), "jmp LABEL_0100");

        let (call, _) = decode_at(&[0xE8, 0x00, 0x00], 0x200, MachineState::default())?;
        assert_eq!(call.effect, Effect::Call(0x203));
        assert!(call.effect.falls_through());

        let (jne, _) = decode_at(&[0x75, 0x10], 0x300, MachineState::default())?;
        assert_eq!(jne.effect, Effect::Branch(0x312));
        assert_eq!(jne.to_string(), "jne LABEL_0312");

        let (jc, _) = decode_at(&[0x72, 0x80], 0x300, MachineState::default())?;
        assert_eq!(jc.effect, Effect::Branch(0x282));
        Ok(())
    }

    #[test]
    fn relative_targets_wrap_at_64k() -> Result<()> {
        let (jmp, _) = decode_at(&[0xE9, 0x00, 0x80], 0x8000, MachineState::default())?;
        assert_eq!(jmp.effect, Effect::Jump(0x0003));
        let (back, _) = decode_at(&[0xE8, 0xF0, 0xFF], 0x0004, MachineState::default())?;
        assert_eq!(back.effect, Effect::Call(0xFFF7));
        Ok(())
    }

    #[test]
    fn it_flags_unknown_opcodes() -> Result<()> {
        let instr = decode(&[0xF4])?;
        assert!(instr.is_illegal());
        assert_eq!(instr.effect, Effect::Illegal(vec![0xF4]));
        assert_eq!(
            instr.to_string(),
            "; DISASM ERROR! Illegal instruction (opcode = 0xF4)"
        );
        Ok(())
    }

    #[test]
    fn it_flags_unknown_group_members() -> Result<()> {
        let instr = decode(&[0xC7, 0x05, 0x00, 0x00])?;
        assert_eq!(instr.effect, Effect::Illegal(vec![0xC7, 0x05]));
        assert_eq!(instr.size(), 2);
        assert_eq!(
            decode(&[0xFF, 0x06])?.effect,
            Effect::Illegal(vec![0xFF, 0x06])
        );
        assert!(decode(&[0x8C, 0x20])?.is_illegal());
        assert!(decode(&[0x8B, 0x07])?.is_illegal());
        assert!(decode(&[0xF7, 0xC3])?.is_illegal());
        Ok(())
    }

    #[test]
    fn it_decodes_groups() -> Result<()> {
        assert_eq!(text(&[0x80, 0x3E, 0x10, 0x00, 0x05])?, "cmp byte [0x0010], 0x05");
        assert_eq!(text(&[0x81, 0xC3, 0x00, 0x01])?, "add bx, 0x0100");
        assert_eq!(text(&[0x81, 0xC2, 0x10, 0x00])?, "add dx, 0x0010");
        assert_eq!(text(&[0x8F, 0x06, 0x20, 0x00])?, "pop [0x0020]");
        assert_eq!(text(&[0xC6, 0x06, 0x20, 0x00, 0x01])?, "mov byte [0x0020], 0x01");
        assert_eq!(text(&[0xFF, 0x36, 0x22, 0x00])?, "push [0x0022]");
        assert_eq!(text(&[0xF7, 0xDB])?, "neg bx");
        assert_eq!(text(&[0xF7, 0xE1])?, "mul cx");
        Ok(())
    }

    #[test]
    fn it_decodes_group_83_addressing() -> Result<()> {
        assert_eq!(text(&[0x83, 0xC1, 0x02])?, "add cx, 0x02");
        assert_eq!(text(&[0x83, 0xF8, 0x10])?, "cmp ax, 0x10");
        assert_eq!(text(&[0x83, 0x40, 0x04, 0x01])?, "add word [bx + si + 0x04], 0x01");
        assert_eq!(text(&[0x83, 0x7E, 0xFE, 0x00])?, "cmp word [bp - 0x02], 0x00");
        assert_eq!(text(&[0x83, 0x2C, 0x03])?, "sub word [si], 0x03");
        assert_eq!(text(&[0x83, 0x26, 0x34, 0x12, 0x7F])?, "and word [0x1234], 0x7F");
        assert_eq!(
            text(&[0x83, 0x87, 0x00, 0x01, 0x01])?,
            "add word [bx + 0x100], 0x01"
        );
        Ok(())
    }

    #[test]
    fn it_decodes_moves() -> Result<()> {
        assert_eq!(text(&[0x89, 0xD8])?, "mov ax, bx");
        assert_eq!(text(&[0x8B, 0xD8])?, "mov bx, ax");
        assert_eq!(text(&[0x88, 0xE0])?, "mov al, ah");
        assert_eq!(text(&[0x8A, 0xE0])?, "mov ah, al");
        assert_eq!(text(&[0x8B, 0x1E, 0x40, 0x00])?, "mov bx, [0x0040]");
        assert_eq!(text(&[0x89, 0x0E, 0x40, 0x00])?, "mov [0x0040], cx");
        assert_eq!(text(&[0x8C, 0xD8])?, "mov ax, ds");
        assert_eq!(text(&[0x8E, 0xC0])?, "mov es, ax");
        assert_eq!(text(&[0x8E, 0xDB])?, "mov ds, bx");
        assert_eq!(text(&[0xA0, 0x10, 0x00])?, "mov al, [0x0010]");
        assert_eq!(text(&[0x2B, 0xC3])?, "sub ax, bx");
        Ok(())
    }

    #[test]
    fn it_names_direct_memory() -> Result<()> {
        let mut symbols = SymbolTable::default();
        symbols.add_variable(0x0040, "counter", "frame counter");
        assert_eq!(
            decode(&[0xA0, 0x40, 0x00])?.show(&symbols),
            "mov al, [counter]"
        );
        assert_eq!(
            decode(&[0x8B, 0x1E, 0x40, 0x00])?.show(&symbols),
            "mov bx, [counter]"
        );
        Ok(())
    }

    #[test]
    fn es_override_applies_to_one_instruction() -> Result<()> {
        let image = Image::new(vec![0x26, 0xA2, 0x34, 0x12, 0xA2, 0x34, 0x12], 0);
        let mut cursor = Cursor::new(&image, 0);
        let (first, state) = Instr::decode_one(&mut cursor, MachineState::default())?;
        assert_eq!(first.to_string(), "mov es:[0x1234], al");
        assert_eq!(first.size(), 4);
        let mut cursor = Cursor::new(&image, first.next_addr());
        let (second, _) = Instr::decode_one(&mut cursor, state)?;
        assert_eq!(second.to_string(), "mov [0x1234], al");
        Ok(())
    }

    #[test]
    fn cs_override_annotates_memory() -> Result<()> {
        assert_eq!(text(&[0x2E, 0xFF, 0x36, 0x10, 0x00])?, "push cs:[0x0010]");
        Ok(())
    }

    #[test]
    fn rep_wraps_the_next_instruction() -> Result<()> {
        let instr = decode(&[0xF3, 0xA4])?;
        assert_eq!(instr.to_string(), "rep movsb");
        assert_eq!(instr.effect, Effect::Fallthrough);
        assert_eq!(instr.size(), 2);
        Ok(())
    }

    #[test]
    fn it_notices_vector_table_writes() -> Result<()> {
        let instr = decode(&[0x26, 0xC7, 0x06, 0x20, 0x00, 0x23, 0x01])?;
        assert_eq!(instr.to_string(), "mov word es:[0x0020], 0x0123");
        assert_eq!(instr.effect, Effect::Fallthrough);
        assert_eq!(
            instr.vector_write,
            Some(VectorWrite {
                slot: 0x20,
                handler: 0x123
            })
        );

        // Too large to be an offset into the table.
        let instr = decode(&[0x26, 0xC7, 0x06, 0x00, 0x00, 0x34, 0x12])?;
        assert_eq!(instr.to_string(), "mov word es:[0x0000], 0x1234");
        assert_eq!(instr.vector_write, None);

        // Segment half of the vector.
        assert_eq!(
            decode(&[0x26, 0xC7, 0x06, 0x22, 0x00, 0x00, 0x00])?.vector_write,
            None
        );

        // Not through es.
        assert_eq!(
            decode(&[0xC7, 0x06, 0x20, 0x00, 0x23, 0x01])?.vector_write,
            None
        );
        Ok(())
    }

    #[test]
    fn it_tracks_the_accumulator() -> Result<()> {
        let (_, state) = decode_at(&[0xB8, 0x00, 0x4C], 0, MachineState::default())?;
        assert_eq!(state.ax(), Some(0x4C00));

        let (_, state) = decode_at(&[0xB4, 0x4C], 0, MachineState::default())?;
        assert_eq!(state.ah(), Some(0x4C));
        assert_eq!(state.ax(), None);

        let (_, state) = decode_at(&[0xB0, 0x01], 0, state)?;
        assert_eq!(state.ax(), Some(0x4C01));

        let (_, state) = decode_at(&[0x58], 0, state)?;
        assert_eq!(state.ax(), None);

        let (_, state) = decode_at(&[0xB8, 0x00, 0x4C], 0, MachineState::default())?;
        let (_, state) = decode_at(&[0x3D, 0x00, 0x00], 0, state)?;
        assert_eq!(state.ax(), Some(0x4C00));
        let (_, state) = decode_at(&[0x8B, 0xC3], 0, state)?;
        assert_eq!(state.ax(), None);
        Ok(())
    }

    #[test]
    fn it_recognizes_dos_exit() -> Result<()> {
        let (_, state) = decode_at(&[0xB8, 0x00, 0x4C], 0, MachineState::default())?;
        let (exit, after) = decode_at(&[0xCD, 0x21], 0, state)?;
        assert_eq!(exit.effect, Effect::Exit);
        assert_eq!(exit.to_string(), "int 0x21");
        assert_eq!(after.ax(), None);

        let (_, state) = decode_at(&[0xB4, 0x09], 0, MachineState::default())?;
        let (print, _) = decode_at(&[0xCD, 0x21], 0, state)?;
        assert_eq!(print.effect, Effect::Fallthrough);

        let (unknown, _) = decode_at(&[0xCD, 0x21], 0, MachineState::default())?;
        assert_eq!(unknown.effect, Effect::Fallthrough);

        assert_eq!(decode(&[0xCD, 0x20])?.effect, Effect::Exit);
        assert_eq!(decode(&[0xCF])?.effect, Effect::Return);
        assert_eq!(decode(&[0xC3])?.effect, Effect::Return);
        Ok(())
    }

    #[test]
    fn it_reports_truncated_instructions() {
        let err = decode(&[0xB8, 0x00]).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<DisassemblyError>(),
            Some(DisassemblyError::OutOfBounds { addr: 2 })
        ));
        assert!(decode(&[0x26]).is_err());
    }
}
