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
use lazy_static::lazy_static;
use std::{
    collections::{HashMap, HashSet},
    fmt,
};

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Reg {
    AL,
    CL,
    DL,
    BL,
    AH,
    CH,
    DH,
    BH,

    AX,
    CX,
    DX,
    BX,
    SP,
    BP,
    SI,
    DI,

    ES,
    CS,
    SS,
    DS,
}

impl Reg {
    // Register numbering as encoded in the reg and r/m fields.
    const REG8: [Reg; 8] = [
        Reg::AL,
        Reg::CL,
        Reg::DL,
        Reg::BL,
        Reg::AH,
        Reg::CH,
        Reg::DH,
        Reg::BH,
    ];
    const REG16: [Reg; 8] = [
        Reg::AX,
        Reg::CX,
        Reg::DX,
        Reg::BX,
        Reg::SP,
        Reg::BP,
        Reg::SI,
        Reg::DI,
    ];
    const SREG: [Reg; 4] = [Reg::ES, Reg::CS, Reg::SS, Reg::DS];

    pub fn reg8(n: u8) -> Reg {
        Self::REG8[(n & 7) as usize]
    }

    pub fn reg16(n: u8) -> Reg {
        Self::REG16[(n & 7) as usize]
    }

    pub fn sreg(n: u8) -> Reg {
        Self::SREG[(n & 3) as usize]
    }

    pub fn sized(n: u8, wide: bool) -> Reg {
        if wide {
            Self::reg16(n)
        } else {
            Self::reg8(n)
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Reg::AL => "al",
            Reg::CL => "cl",
            Reg::DL => "dl",
            Reg::BL => "bl",
            Reg::AH => "ah",
            Reg::CH => "ch",
            Reg::DH => "dh",
            Reg::BH => "bh",
            Reg::AX => "ax",
            Reg::CX => "cx",
            Reg::DX => "dx",
            Reg::BX => "bx",
            Reg::SP => "sp",
            Reg::BP => "bp",
            Reg::SI => "si",
            Reg::DI => "di",
            Reg::ES => "es",
            Reg::CS => "cs",
            Reg::SS => "ss",
            Reg::DS => "ds",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Memonic {
    Adc,
    Add,
    And,
    Call,
    ClearDF,
    ClearIF,
    Compare,
    Div,
    IDiv,
    IMul,
    In,
    Interrupt,
    InterruptReturn,
    Jc,
    Je,
    Jne,
    Jump,
    Move,
    MoveStrB,
    Mul,
    Neg,
    Nop,
    Not,
    Or,
    Out,
    Pop,
    PopAll,
    PopF,
    Push,
    PushAll,
    PushF,
    Return,
    Sbb,
    SetIF,
    Sub,
    Test,
    Xor,

    // Placeholder for a byte sequence no decode rule accepts.
    Invalid,
}

impl Memonic {
    pub fn name(&self) -> &'static str {
        match self {
            Memonic::Adc => "adc",
            Memonic::Add => "add",
            Memonic::And => "and",
            Memonic::Call => "call",
            Memonic::ClearDF => "cld",
            Memonic::ClearIF => "cli",
            Memonic::Compare => "cmp",
            Memonic::Div => "div",
            Memonic::IDiv => "idiv",
            Memonic::IMul => "imul",
            Memonic::In => "in",
            Memonic::Interrupt => "int",
            Memonic::InterruptReturn => "iret",
            Memonic::Jc => "jc",
            Memonic::Je => "je",
            Memonic::Jne => "jne",
            Memonic::Jump => "jmp",
            Memonic::Move => "mov",
            Memonic::MoveStrB => "movsb",
            Memonic::Mul => "mul",
            Memonic::Neg => "neg",
            Memonic::Nop => "nop",
            Memonic::Not => "not",
            Memonic::Or => "or",
            Memonic::Out => "out",
            Memonic::Pop => "pop",
            Memonic::PopAll => "popa",
            Memonic::PopF => "popf",
            Memonic::Push => "push",
            Memonic::PushAll => "pusha",
            Memonic::PushF => "pushf",
            Memonic::Return => "ret",
            Memonic::Sbb => "sbb",
            Memonic::SetIF => "sti",
            Memonic::Sub => "sub",
            Memonic::Test => "test",
            Memonic::Xor => "xor",
            Memonic::Invalid => "(bad)",
        }
    }

    // Whether the first operand is overwritten by the result.
    pub fn writes_destination(&self) -> bool {
        !matches!(
            self,
            Memonic::Compare | Memonic::Test | Memonic::Push | Memonic::Out
        )
    }
}

impl fmt::Display for Memonic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// An instruction whose single opcode byte fully determines it; all operands are implicit
// registers.
#[derive(Clone, Debug)]
pub struct OpCodeDef {
    pub memonic: Memonic,
    pub operands: Vec<Reg>,
}

macro_rules! make_op {
    ($meme:ident: $( $reg:ident ),* ) => {
        OpCodeDef {
            memonic: Memonic::$meme,
            operands: vec![
                $( Reg::$reg ),*
            ]
        }
    };
}

// Operation selected by the reg field of the 0x80, 0x81 and 0x83 groups.
pub const ALU_OPS: [Memonic; 8] = [
    Memonic::Add,
    Memonic::Or,
    Memonic::Adc,
    Memonic::Sbb,
    Memonic::And,
    Memonic::Sub,
    Memonic::Xor,
    Memonic::Compare,
];

// Operation selected by the reg field of 0xF7. /0 is test with an immediate and /1 is
// undefined; neither is supported.
pub const UNARY_OPS: [Option<Memonic>; 8] = [
    None,
    None,
    Some(Memonic::Not),
    Some(Memonic::Neg),
    Some(Memonic::Mul),
    Some(Memonic::IMul),
    Some(Memonic::Div),
    Some(Memonic::IDiv),
];

// Base and index registers of the 16 bit effective addresses, keyed by r/m.
pub const EFFECTIVE_ADDRESSES: [(Reg, Option<Reg>); 8] = [
    (Reg::BX, Some(Reg::SI)),
    (Reg::BX, Some(Reg::DI)),
    (Reg::BP, Some(Reg::SI)),
    (Reg::BP, Some(Reg::DI)),
    (Reg::SI, None),
    (Reg::DI, None),
    (Reg::BP, None),
    (Reg::BX, None),
];

lazy_static! {
    pub static ref PREFIX_CODES: HashSet<u8> = {
        [0x26u8, 0x2Eu8, 0xF3u8].iter().cloned().collect()
    };

    #[cfg_attr(rustfmt, rustfmt_skip)]
    pub static ref SIMPLE_OPCODES: HashMap<u8, OpCodeDef> = {
        let mut out: HashMap<u8, OpCodeDef> = HashMap::new();
        let ops = [
            (0x06, make_op!(Push:     ES)),
            (0x07, make_op!(Pop:      ES)),
            (0x0E, make_op!(Push:     CS)),
            (0x16, make_op!(Push:     SS)),
            (0x17, make_op!(Pop:      SS)),
            (0x1E, make_op!(Push:     DS)),
            (0x1F, make_op!(Pop:      DS)),
            (0x60, make_op!(PushAll:)),
            (0x61, make_op!(PopAll:)),
            (0x90, make_op!(Nop:)),
            (0x9C, make_op!(PushF:)),
            (0x9D, make_op!(PopF:)),
            (0xA4, make_op!(MoveStrB:)),
            (0xFA, make_op!(ClearIF:)),
            (0xFB, make_op!(SetIF:)),
            (0xFC, make_op!(ClearDF:)),
        ];
        for (op, def) in ops.iter() {
            out.insert(*op, def.clone());
        }
        // The register is encoded in the low bits of push and pop.
        for n in 0..8u8 {
            out.insert(0x50 + n, OpCodeDef { memonic: Memonic::Push, operands: vec![Reg::reg16(n)] });
            out.insert(0x58 + n, OpCodeDef { memonic: Memonic::Pop, operands: vec![Reg::reg16(n)] });
        }
        out
    };
}
