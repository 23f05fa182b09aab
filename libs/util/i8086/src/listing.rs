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
use crate::cursor::Image;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

// Bytes per db line.
const DATA_RUN: usize = 8;

pub fn bs2s(bs: &[u8]) -> String {
    bs.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Entry {
    Code { bytes: Vec<u8>, text: String },
    // A decode that went wrong. Covers the bytes the decoder got through.
    Error { bytes: Vec<u8>, text: String },
    // Never reached by the trace.
    Data { bytes: Vec<u8> },
}

impl Entry {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Entry::Code { bytes, .. } => bytes,
            Entry::Error { bytes, .. } => bytes,
            Entry::Data { bytes } => bytes,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct Equate {
    label: String,
    description: String,
}

/// Everything the trace learned about a program, keyed by address.
#[derive(Clone, Debug, Default)]
pub struct Listing {
    comments: Vec<String>,
    equates: BTreeMap<u32, Equate>,
    entries: BTreeMap<u32, Entry>,
    labels: BTreeMap<u32, String>,
    subroutines: BTreeSet<u32>,
}

impl Listing {
    pub fn add_comment(&mut self, comment: &str) {
        self.comments.push(comment.to_owned());
    }

    /// Name an address in the header, rather than where it lands in the body.
    pub fn add_equate(&mut self, addr: u32, label: &str, description: &str) {
        self.equates.insert(
            addr,
            Equate {
                label: label.to_owned(),
                description: description.to_owned(),
            },
        );
    }

    pub fn add_label(&mut self, addr: u32, label: String) {
        self.labels.entry(addr).or_insert(label);
    }

    pub fn mark_subroutine(&mut self, addr: u32) {
        self.subroutines.insert(addr);
    }

    pub fn push_code(&mut self, addr: u32, bytes: &[u8], text: String) {
        self.entries.insert(
            addr,
            Entry::Code {
                bytes: bytes.to_vec(),
                text,
            },
        );
    }

    pub fn push_error(&mut self, addr: u32, bytes: &[u8], text: String) {
        self.entries.insert(
            addr,
            Entry::Error {
                bytes: bytes.to_vec(),
                text,
            },
        );
    }

    /// Emit every byte of the image that no entry covers as data, in short runs
    /// that never straddle a label.
    pub fn fill_data(&mut self, image: &Image) {
        let mut data = Vec::new();
        let mut run: Option<(u32, Vec<u8>)> = None;
        // Entries may overlap, so track the furthest byte any of them reaches.
        let mut covered_end = image.base();
        for addr in image.base()..image.end() {
            if let Some(entry) = self.entries.get(&addr) {
                covered_end = covered_end.max(addr + entry.bytes().len() as u32);
            }
            if addr < covered_end {
                data.extend(run.take());
                continue;
            }
            let breaks = self.labels.contains_key(&addr)
                || run
                    .as_ref()
                    .map(|(_, bytes)| bytes.len() == DATA_RUN)
                    .unwrap_or(false);
            if breaks {
                data.extend(run.take());
            }
            if let Some(b) = image.get(addr) {
                run.get_or_insert_with(|| (addr, Vec::new())).1.push(b);
            }
        }
        data.extend(run.take());
        for (addr, bytes) in data {
            self.entries.insert(addr, Entry::Data { bytes });
        }
    }

    pub fn get(&self, addr: u32) -> Option<&Entry> {
        self.entries.get(&addr)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&u32, &Entry)> {
        self.entries.iter()
    }

    pub fn label(&self, addr: u32) -> Option<&str> {
        self.labels.get(&addr).map(|s| s.as_str())
    }

    pub fn is_subroutine(&self, addr: u32) -> bool {
        self.subroutines.contains(&addr)
    }

    pub fn code_lines(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, Entry::Code { .. }))
            .count()
    }

    pub fn error_lines(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, Entry::Error { .. }))
            .count()
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for comment in &self.comments {
            writeln!(f, "; {}", comment)?;
        }
        for (addr, equate) in &self.equates {
            if equate.description.is_empty() {
                writeln!(f, "{}:\tequ 0x{:04X}", equate.label, addr)?;
            } else {
                writeln!(
                    f,
                    "{}:\tequ 0x{:04X}\t; {}",
                    equate.label, addr, equate.description
                )?;
            }
        }
        // Targets that landed inside something else still need a definition.
        for (addr, label) in &self.labels {
            if !self.entries.contains_key(addr) && !self.equates.contains_key(addr) {
                writeln!(f, "{}:\tequ 0x{:04X}", label, addr)?;
            }
        }

        for (addr, entry) in &self.entries {
            if self.subroutines.contains(addr) {
                writeln!(f)?;
            }
            if let Some(label) = self.labels.get(addr) {
                if !self.equates.contains_key(addr) {
                    writeln!(f, "{}:", label)?;
                }
            }
            match entry {
                Entry::Code { bytes, text } => {
                    writeln!(f, "\t{:<40}; @{:04X}: {}", text, addr, bs2s(bytes))?
                }
                Entry::Error { bytes, text } => {
                    writeln!(f, "\t{:<40}; @{:04X}: {}", text, addr, bs2s(bytes))?
                }
                Entry::Data { bytes } => {
                    let values = bytes
                        .iter()
                        .map(|b| format!("0x{:02X}", b))
                        .collect::<Vec<_>>()
                        .join(", ");
                    writeln!(f, "\t{:<40}; @{:04X}", format!("db {}", values), addr)?
                }
            }
        }
        Ok(())
    }
}
