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
use log::trace;
use serde::Deserialize;
use std::{collections::BTreeMap, io::Read};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Symbol {
    pub label: String,
    pub description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SymbolKind {
    Subroutine,
    Variable,
}

/// A row of a symbols file: `kind,address,label,description`
#[derive(Debug, Deserialize)]
struct Record {
    kind: SymbolKind,
    address: String,
    label: String,
    #[serde(default)]
    description: String,
}

/// Names for addresses the user already knows about. Anything else gets a
/// generated label.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    subroutines: BTreeMap<u32, Symbol>,
    variables: BTreeMap<u32, Symbol>,
}

impl SymbolTable {
    pub fn new(subroutines: BTreeMap<u32, Symbol>, variables: BTreeMap<u32, Symbol>) -> Self {
        Self {
            subroutines,
            variables,
        }
    }

    pub fn from_csv<R: Read>(reader: R) -> Result<Self> {
        let mut table = Self::default();
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        for (i, result) in rdr.deserialize().enumerate() {
            let record: Record = result.with_context(|| format!("symbols row {}", i + 1))?;
            let address = parse_address(&record.address)
                .with_context(|| format!("symbols row {}: bad address", i + 1))?;
            trace!("symbol {:?} {} @ 0x{:04X}", record.kind, record.label, address);
            match record.kind {
                SymbolKind::Subroutine => {
                    table.add_subroutine(address, &record.label, &record.description)
                }
                SymbolKind::Variable => table.add_variable(address, &record.label, &record.description),
            }
        }
        Ok(table)
    }

    pub fn add_subroutine(&mut self, addr: u32, label: &str, description: &str) {
        self.subroutines.insert(
            addr,
            Symbol {
                label: label.to_owned(),
                description: description.to_owned(),
            },
        );
    }

    pub fn add_variable(&mut self, addr: u32, label: &str, description: &str) {
        self.variables.insert(
            addr,
            Symbol {
                label: label.to_owned(),
                description: description.to_owned(),
            },
        );
    }

    pub fn generated_label(addr: u32) -> String {
        format!("LABEL_{:04X}", addr)
    }

    /// The label printed for a code address.
    pub fn resolve(&self, addr: u32) -> String {
        if let Some(sym) = self.subroutines.get(&addr) {
            sym.label.clone()
        } else if let Some(sym) = self.variables.get(&addr) {
            sym.label.clone()
        } else {
            Self::generated_label(addr)
        }
    }

    /// The name printed for a direct memory operand.
    pub fn variable(&self, addr: u16) -> String {
        let addr = u32::from(addr);
        if let Some(sym) = self.variables.get(&addr) {
            sym.label.clone()
        } else if let Some(sym) = self.subroutines.get(&addr) {
            sym.label.clone()
        } else {
            format!("0x{:04X}", addr)
        }
    }

    pub fn subroutine(&self, addr: u32) -> Option<&Symbol> {
        self.subroutines.get(&addr)
    }

    pub fn subroutines(&self) -> impl Iterator<Item = (&u32, &Symbol)> {
        self.subroutines.iter()
    }

    pub fn variables(&self) -> impl Iterator<Item = (&u32, &Symbol)> {
        self.variables.iter()
    }
}

pub fn parse_address(s: &str) -> Result<u32, std::num::ParseIntError> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16)
}
