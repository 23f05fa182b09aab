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
use anyhow::{ensure, Result};
use log::trace;
use std::mem;
use thiserror::Error;
use zerocopy::{
    byteorder::{LittleEndian, U16},
    FromBytes, LayoutVerified, Unaligned,
};

pub const PARAGRAPH_SIZE: usize = 16;
pub const PAGE_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum MzError {
    #[error("malformed header: {reason}")]
    MalformedHeader { reason: &'static str },
}

// The fixed part of the DOS program header. Everything after it, up to the
// end of the header paragraphs, is the relocation table plus padding.
#[allow(dead_code)]
#[repr(C)]
#[derive(FromBytes, Unaligned)]
struct DosHeader {
    signature: [u8; 2],
    last_page_size: U16<LittleEndian>,
    page_count: U16<LittleEndian>,
    relocation_count: U16<LittleEndian>,
    header_paragraphs: U16<LittleEndian>,
    min_alloc: U16<LittleEndian>,
    max_alloc: U16<LittleEndian>,
    initial_ss: U16<LittleEndian>,
    initial_sp: U16<LittleEndian>,
    checksum: U16<LittleEndian>,
    initial_ip: U16<LittleEndian>,
    initial_cs: U16<LittleEndian>,
    relocation_table_offset: U16<LittleEndian>,
    overlay_number: U16<LittleEndian>,
}

#[repr(C)]
#[derive(FromBytes, Unaligned)]
struct RelocationEntry {
    offset: U16<LittleEndian>,
    segment: U16<LittleEndian>,
}

/// A segment:offset pair naming a word in the load module that DOS patches
/// with the load segment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Relocation {
    pub offset: u16,
    pub segment: u16,
}

impl Relocation {
    pub fn linear(&self) -> u32 {
        u32::from(self.segment) * PARAGRAPH_SIZE as u32 + u32::from(self.offset)
    }
}

pub struct MzExecutable {
    // Initial CS:IP, relative to the start of the load module.
    pub entry_segment: u16,
    pub entry_offset: u16,

    pub relocation_table_offset: u16,
    pub relocation_count: u16,

    // Size of the header in 16 byte paragraphs.
    pub header_paragraphs: u16,

    // Size of the file as declared by the page counts, header included.
    pub image_size: usize,

    pub relocs: Vec<Relocation>,

    // Everything after the header, up to image_size.
    load_module: Vec<u8>,
}

impl MzExecutable {
    pub const HEADER_SIZE: usize = 0x1C;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        assert_eq!(mem::size_of::<DosHeader>(), Self::HEADER_SIZE);

        let (header, _) = LayoutVerified::<&[u8], DosHeader>::new_unaligned_from_prefix(data)
            .ok_or(MzError::MalformedHeader {
                reason: "file too short for dos header",
            })?;
        let header = header.into_ref();
        ensure!(
            &header.signature == b"MZ" || &header.signature == b"ZM",
            MzError::MalformedHeader {
                reason: "not a dos program file header"
            }
        );

        let page_count = header.page_count.get() as usize;
        let last_page_size = header.last_page_size.get() as usize;
        ensure!(
            last_page_size < PAGE_SIZE,
            MzError::MalformedHeader {
                reason: "last page size larger than a page"
            }
        );
        let image_size = if last_page_size == 0 {
            page_count * PAGE_SIZE
        } else {
            page_count.saturating_sub(1) * PAGE_SIZE + last_page_size
        };

        let header_paragraphs = header.header_paragraphs.get();
        let header_size = header_paragraphs as usize * PARAGRAPH_SIZE;
        ensure!(
            header_size >= Self::HEADER_SIZE,
            MzError::MalformedHeader {
                reason: "header paragraphs do not cover the dos header"
            }
        );
        ensure!(
            header_size <= data.len(),
            MzError::MalformedHeader {
                reason: "header runs past the end of the file"
            }
        );

        let relocation_count = header.relocation_count.get();
        let relocation_table_offset = header.relocation_table_offset.get();
        let reloc_start = relocation_table_offset as usize;
        let reloc_end = reloc_start + relocation_count as usize * mem::size_of::<RelocationEntry>();
        ensure!(
            relocation_count == 0 || reloc_end <= data.len(),
            MzError::MalformedHeader {
                reason: "relocation table runs past the end of the file"
            }
        );
        let relocs = if relocation_count == 0 {
            Vec::new()
        } else {
            LayoutVerified::<&[u8], [RelocationEntry]>::new_slice_unaligned(
                &data[reloc_start..reloc_end],
            )
            .ok_or(MzError::MalformedHeader {
                reason: "failed to overlay relocation table",
            })?
            .into_slice()
            .iter()
            .map(|entry| Relocation {
                offset: entry.offset.get(),
                segment: entry.segment.get(),
            })
            .collect::<Vec<_>>()
        };
        trace!(
            "loaded {} relocations from table at 0x{:04X}",
            relocs.len(),
            relocation_table_offset
        );

        let load_end = image_size.min(data.len()).max(header_size);
        let load_module = data[header_size..load_end].to_owned();
        trace!(
            "load module is 0x{:X} bytes at file offset 0x{:X} (ss:sp {:04X}:{:04X}, overlay {})",
            load_module.len(),
            header_size,
            header.initial_ss.get(),
            header.initial_sp.get(),
            header.overlay_number.get()
        );

        Ok(Self {
            entry_segment: header.initial_cs.get(),
            entry_offset: header.initial_ip.get(),
            relocation_table_offset,
            relocation_count,
            header_paragraphs,
            image_size,
            relocs,
            load_module,
        })
    }

    pub fn header_size(&self) -> usize {
        self.header_paragraphs as usize * PARAGRAPH_SIZE
    }

    /// Linear address of CS:IP within the load module.
    pub fn entry_point(&self) -> u32 {
        u32::from(self.entry_segment) * PARAGRAPH_SIZE as u32 + u32::from(self.entry_offset)
    }

    pub fn load_module(&self) -> &[u8] {
        &self.load_module
    }
}
