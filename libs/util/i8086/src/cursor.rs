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
use anyhow::Result;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DisassemblyError {
    #[error("read past end of image at 0x{addr:04X}")]
    OutOfBounds { addr: u32 },
}

/// The bytes of a program, mapped so that `base` is the address of the first byte.
#[derive(Clone, Debug)]
pub struct Image {
    data: Vec<u8>,
    base: u32,
}

impl Image {
    pub fn new(data: Vec<u8>, base: u32) -> Self {
        Self { data, base }
    }

    #[inline]
    pub fn base(&self) -> u32 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    // One past the last mapped address.
    #[inline]
    pub fn end(&self) -> u32 {
        self.base + self.data.len() as u32
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub fn get(&self, addr: u32) -> Option<u8> {
        if self.contains(addr) {
            Some(self.data[(addr - self.base) as usize])
        } else {
            None
        }
    }

    pub fn slice(&self, start: u32, end: u32) -> &[u8] {
        let start = start.clamp(self.base, self.end());
        let end = end.clamp(start, self.end());
        &self.data[(start - self.base) as usize..(end - self.base) as usize]
    }
}

/// Reads one instruction's worth of bytes out of an image.
pub struct Cursor<'a> {
    image: &'a Image,
    start: u32,
    pc: u32,
}

impl<'a> Cursor<'a> {
    pub fn new(image: &'a Image, addr: u32) -> Self {
        Self {
            image,
            start: addr,
            pc: addr,
        }
    }

    pub fn fetch(&mut self) -> Result<u8> {
        let b = self
            .image
            .get(self.pc)
            .ok_or(DisassemblyError::OutOfBounds { addr: self.pc })?;
        self.pc += 1;
        Ok(b)
    }

    pub fn fetch_u16(&mut self) -> Result<u16> {
        let lo = self.fetch()?;
        let hi = self.fetch()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    #[inline]
    pub fn start(&self) -> u32 {
        self.start
    }

    #[inline]
    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn consumed(&self) -> &'a [u8] {
        self.image.slice(self.start, self.pc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_reads_little_endian() -> Result<()> {
        let image = Image::new(vec![0xB8, 0x00, 0x4C], 0x100);
        let mut cursor = Cursor::new(&image, 0x100);
        assert_eq!(cursor.fetch()?, 0xB8);
        assert_eq!(cursor.fetch_u16()?, 0x4C00);
        assert_eq!(cursor.pc(), 0x103);
        assert_eq!(cursor.start(), 0x100);
        assert_eq!(cursor.consumed(), &[0xB8, 0x00, 0x4C]);
        Ok(())
    }

    #[test]
    fn it_stops_at_end_of_image() {
        let image = Image::new(vec![0xE8, 0x00], 0);
        let mut cursor = Cursor::new(&image, 0);
        cursor.fetch().unwrap();
        let err = cursor.fetch_u16().err().unwrap();
        match err.downcast_ref::<DisassemblyError>() {
            Some(DisassemblyError::OutOfBounds { addr }) => assert_eq!(*addr, 2),
            None => panic!("expected out of bounds"),
        }
    }

    #[test]
    fn it_rejects_addresses_below_base() {
        let image = Image::new(vec![0x90], 0x10);
        assert!(Cursor::new(&image, 0x0F).fetch().is_err());
        assert_eq!(image.slice(0, 0x20), &[0x90]);
    }
}
