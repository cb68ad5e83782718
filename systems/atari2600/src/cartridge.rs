//! Atari 2600 cartridge handling and bank switching.
//!
//! Reading or writing specific addresses in the cartridge window switches the
//! visible 4K bank; the actual value read/written at a magic address is discarded.
//! This core supports the plain-4K cartridge and the three Atari address-triggered
//! bank switchers (8K/F8, 16K/F6, 32K/F4). Other historical schemes (2K, FA/12K,
//! DPC, FE, 3F, E0, ...) are out of scope.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CartridgeError {
    #[error("invalid ROM size: {0} bytes (expected 4096, 8192, 16384, or 32768)")]
    InvalidSize(usize),
}

/// Banking scheme, chosen by the caller at mount time rather than inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BankingScheme {
    /// 4K ROM, no banking.
    Rom4K,
    /// 8K F8 banking (2x 4K banks), hotspots at 0x1FF8/0x1FF9.
    F8,
    /// 16K F6 banking (4x 4K banks), hotspots at 0x1FF6..=0x1FF9.
    F6,
    /// 32K F4 banking (8x 4K banks), hotspots at 0x1FF4..=0x1FFB.
    F4,
}

impl BankingScheme {
    pub fn bank_count(self) -> usize {
        match self {
            BankingScheme::Rom4K => 1,
            BankingScheme::F8 => 2,
            BankingScheme::F6 => 4,
            BankingScheme::F4 => 8,
        }
    }

    fn hotspot_base(self) -> u16 {
        match self {
            BankingScheme::Rom4K => 0,
            BankingScheme::F8 => 0x1FF8,
            BankingScheme::F6 => 0x1FF6,
            BankingScheme::F4 => 0x1FF4,
        }
    }

    /// True if `addr` (already masked to the 13-bit cartridge window) selects a bank.
    pub fn is_magic(self, addr: u16) -> bool {
        if matches!(self, BankingScheme::Rom4K) {
            return false;
        }
        let base = self.hotspot_base();
        addr >= base && (addr - base) < self.bank_count() as u16
    }

    fn bank_for(self, addr: u16) -> usize {
        (addr - self.hotspot_base()) as usize
    }

    pub fn detect(rom_len: usize) -> Result<Self, CartridgeError> {
        match rom_len {
            4096 => Ok(BankingScheme::Rom4K),
            8192 => Ok(BankingScheme::F8),
            16384 => Ok(BankingScheme::F6),
            32768 => Ok(BankingScheme::F4),
            _ => Err(CartridgeError::InvalidSize(rom_len)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cartridge {
    rom: Vec<u8>,
    current_bank: usize,
    scheme: BankingScheme,
}

impl Cartridge {
    pub fn new(rom: Vec<u8>, scheme: BankingScheme) -> Result<Self, CartridgeError> {
        let expected = scheme.bank_count() * 4096;
        if rom.len() != expected {
            return Err(CartridgeError::InvalidSize(rom.len()));
        }
        Ok(Self { rom, current_bank: 0, scheme })
    }

    /// Construct with the scheme auto-detected from ROM size (a convenience on top
    /// of the "caller selects the scheme" contract for the common case).
    pub fn from_rom(rom: Vec<u8>) -> Result<Self, CartridgeError> {
        let scheme = BankingScheme::detect(rom.len())?;
        Self::new(rom, scheme)
    }

    pub fn scheme(&self) -> BankingScheme {
        self.scheme
    }

    pub fn current_bank(&self) -> usize {
        self.current_bank
    }

    pub fn size(&self) -> usize {
        self.rom.len()
    }

    /// True if `addr` (13-bit cartridge-relative) is a bank-select hotspot.
    pub fn has_side_effect(&self, addr: u16) -> bool {
        self.scheme.is_magic(addr)
    }

    /// Returns whether this access switched banks (so the caller can mark the
    /// ROM window dirty for the instruction cache).
    fn maybe_switch(&mut self, addr: u16) -> bool {
        if self.scheme.is_magic(addr) {
            self.current_bank = self.scheme.bank_for(addr);
            true
        } else {
            false
        }
    }

    /// Read with bank-switch side effect applied first, per real hardware (the
    /// switch happens on *access*, independent of the value returned).
    pub fn read(&mut self, addr: u16) -> (u8, bool) {
        let switched = self.maybe_switch(addr);
        let offset = (addr & 0x0FFF) as usize;
        let bank_offset = self.current_bank * 4096;
        (self.rom[bank_offset + offset], switched)
    }

    /// Write to the cartridge window. Only magic addresses are legal; anything
    /// else is an unhandled-ROM-write fault at the bus level (4.2/7).
    pub fn write(&mut self, addr: u16) -> bool {
        self.maybe_switch(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_scheme_from_size() {
        assert_eq!(BankingScheme::detect(4096).unwrap(), BankingScheme::Rom4K);
        assert_eq!(BankingScheme::detect(8192).unwrap(), BankingScheme::F8);
        assert_eq!(BankingScheme::detect(16384).unwrap(), BankingScheme::F6);
        assert_eq!(BankingScheme::detect(32768).unwrap(), BankingScheme::F4);
        assert!(BankingScheme::detect(2048).is_err());
        assert!(BankingScheme::detect(12288).is_err());
    }

    #[test]
    fn rom4k_has_no_magic_addresses() {
        let rom = vec![0x00; 4096];
        let cart = Cartridge::new(rom, BankingScheme::Rom4K).unwrap();
        assert!(!cart.has_side_effect(0x1FF8));
    }

    #[test]
    fn f8_bank_switch_via_read() {
        let mut rom = vec![0x00; 8192];
        rom[0] = 0x11;
        rom[4096] = 0x22;
        let mut cart = Cartridge::new(rom, BankingScheme::F8).unwrap();

        assert_eq!(cart.current_bank(), 0);
        let (v, switched) = cart.read(0x1000);
        assert_eq!(v, 0x11);
        assert!(!switched);

        let (_, switched) = cart.read(0x1FF9);
        assert!(switched);
        assert_eq!(cart.current_bank(), 1);
        let (v, _) = cart.read(0x1000);
        assert_eq!(v, 0x22);

        cart.write(0x1FF8);
        assert_eq!(cart.current_bank(), 0);
    }

    #[test]
    fn f6_covers_all_four_banks() {
        let mut rom = vec![0x00; 16384];
        for i in 0..4 {
            rom[i * 4096] = (0x10 + i) as u8;
        }
        let mut cart = Cartridge::new(rom, BankingScheme::F6).unwrap();
        for bank in 0..4u16 {
            cart.write(0x1FF6 + bank);
            assert_eq!(cart.current_bank(), bank as usize);
            let (v, _) = cart.read(0x1000);
            assert_eq!(v, 0x10 + bank as u8);
        }
    }

    #[test]
    fn f4_covers_all_eight_banks() {
        let rom = vec![0x00; 32768];
        let mut cart = Cartridge::new(rom, BankingScheme::F4).unwrap();
        for bank in 0..8u16 {
            cart.write(0x1FF4 + bank);
            assert_eq!(cart.current_bank(), bank as usize);
        }
    }

    #[test]
    fn rejects_mismatched_size() {
        let rom = vec![0x00; 8192];
        assert!(Cartridge::new(rom, BankingScheme::F6).is_err());
    }
}
