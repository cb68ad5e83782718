//! Atari 2600 address bus: routes the 6507's 13-bit address space across the
//! TIA, the PIA, and the cartridge, and answers the instruction cache's
//! side-effect/dirty-page questions on their behalf.
//!
//! Address decoding masks every access to 13 bits (`addr & 0x1FFF`) before
//! dispatch, since the 6507 only has 13 address pins; the cartridge ROM window
//! and the TIA/PIA register windows are consequently mirrored 8 times across
//! the CPU's full 16-bit address space.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use emu_core::cpu_6502::Memory6502;
use emu_core::log;
use emu_core::logging::{LogCategory, LogLevel};

use crate::cartridge::Cartridge;
use crate::pia::Pia;
use crate::tia::{Tia, TiaFault};

#[derive(Debug, Error)]
pub enum BusFault {
    #[error("write to ROM at non-hotspot address {0:#06x}")]
    RomWrite(u16),
    #[error("no cartridge mounted")]
    NoCartridge,
    #[error("TIA register fault: {0}")]
    Tia(#[from] TiaFault),
}

const MIRROR_PERIOD_PAGES: u16 = 0x20; // 0x2000 bytes / 256 = 32 pages.
const MIRROR_COUNT: u16 = 8; // 0x10000 / 0x2000.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atari2600Bus {
    pub tia: Tia,
    pub pia: Pia,
    pub cartridge: Option<Cartridge>,
    #[serde(skip)]
    dirty: [bool; 256],
    wsync_pending: bool,
}

impl Default for Atari2600Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Atari2600Bus {
    pub fn new() -> Self {
        Self {
            tia: Tia::new(),
            pia: Pia::new(),
            cartridge: None,
            dirty: [false; 256],
            wsync_pending: false,
        }
    }

    pub fn reset(&mut self) {
        self.tia.reset();
        self.pia.reset();
        self.dirty = [false; 256];
        self.wsync_pending = false;
    }

    pub fn load_cartridge(&mut self, cartridge: Cartridge) {
        self.cartridge = Some(cartridge);
        self.mark_region_dirty(0x1000, 0x1000);
    }

    /// Advance the TIA and PIA by `cycles` CPU cycles; called once per
    /// executed instruction (and again for any WSYNC stall).
    pub fn clock(&mut self, cycles: u32) {
        self.tia.catch_up(cycles);
        self.pia.tick(cycles);
    }

    /// If a WSYNC strobe was written since the last call, returns the number
    /// of additional CPU cycles needed to reach the next scanline boundary
    /// and clears the pending flag. The caller is expected to both add these
    /// cycles to the CPU's own cycle counter and feed them to `clock`.
    pub fn take_wsync_request(&mut self) -> Option<u32> {
        if self.wsync_pending {
            self.wsync_pending = false;
            Some(self.tia.cycles_to_scanline_boundary())
        } else {
            None
        }
    }

    fn mark_region_dirty(&mut self, masked_start: u16, len: u16) {
        let first_page = (masked_start >> 8) as u16;
        let pages = len.div_ceil(256).max(1);
        for k in 0..MIRROR_COUNT {
            for p in 0..pages {
                let page = (first_page + p) % MIRROR_PERIOD_PAGES + k * MIRROR_PERIOD_PAGES;
                if (page as usize) < self.dirty.len() {
                    self.dirty[page as usize] = true;
                }
            }
        }
    }
}

impl Memory6502 for Atari2600Bus {
    type Fault = BusFault;

    fn read(&mut self, addr: u16) -> Result<u8, BusFault> {
        let masked = addr & 0x1FFF;
        match masked {
            0x0000..=0x007F | 0x0100..=0x017F => Ok(self.tia.read(masked)),
            0x0080..=0x00FF | 0x0180..=0x01FF | 0x0280..=0x029F => Ok(self.pia.read(masked)),
            0x1000..=0x1FFF => match &mut self.cartridge {
                Some(cart) => {
                    let (value, switched) = cart.read(masked);
                    if switched {
                        self.mark_region_dirty(0x1000, 0x1000);
                    }
                    Ok(value)
                }
                None => Err(BusFault::NoCartridge),
            },
            _ => {
                log!(
                    LogCategory::Bus,
                    LogLevel::Warn,
                    "unmapped read at {:#06x}",
                    addr
                );
                Ok(0)
            }
        }
    }

    fn write(&mut self, addr: u16, value: u8) -> Result<(), BusFault> {
        let masked = addr & 0x1FFF;
        match masked {
            0x0000..=0x007F | 0x0100..=0x017F => {
                if masked & 0x3F == 0x02 {
                    self.wsync_pending = true;
                }
                self.tia.write(masked, value)?;
                Ok(())
            }
            0x0080..=0x00FF | 0x0180..=0x01FF => {
                self.pia.write(masked, value);
                self.mark_region_dirty(masked & 0xFF00, 256);
                Ok(())
            }
            0x0280..=0x029F => {
                self.pia.write(masked, value);
                Ok(())
            }
            0x1000..=0x1FFF => match &mut self.cartridge {
                Some(cart) => {
                    let switched = cart.write(masked);
                    if switched {
                        self.mark_region_dirty(0x1000, 0x1000);
                        Ok(())
                    } else {
                        Err(BusFault::RomWrite(addr))
                    }
                }
                None => Err(BusFault::NoCartridge),
            },
            _ => {
                log!(
                    LogCategory::Bus,
                    LogLevel::Warn,
                    "unmapped write at {:#06x} (value {:#04x})",
                    addr,
                    value
                );
                Ok(())
            }
        }
    }

    fn has_side_effect(&self, addr: u16) -> bool {
        let masked = addr & 0x1FFF;
        match masked {
            0x0000..=0x007F | 0x0100..=0x017F => true,
            0x0080..=0x00FF | 0x0180..=0x01FF => false,
            0x0280..=0x029F => true,
            0x1000..=0x1FFF => self
                .cartridge
                .as_ref()
                .map(|c| c.has_side_effect(masked))
                .unwrap_or(false),
            _ => false,
        }
    }

    fn is_dirty_page(&self, addr: u16) -> bool {
        self.dirty[(addr >> 8) as usize]
    }

    fn mark_page_clean(&mut self, addr: u16) {
        self.dirty[(addr >> 8) as usize] = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cartridge::BankingScheme;

    fn bus_with_rom(rom: Vec<u8>, scheme: BankingScheme) -> Atari2600Bus {
        let mut bus = Atari2600Bus::new();
        bus.load_cartridge(Cartridge::new(rom, scheme).unwrap());
        bus
    }

    #[test]
    fn ram_round_trip_and_mirror() {
        let mut bus = Atari2600Bus::new();
        bus.write(0x0080, 0x42).unwrap();
        assert_eq!(bus.read(0x0080).unwrap(), 0x42);
        assert_eq!(bus.read(0x0180).unwrap(), 0x42);
    }

    #[test]
    fn rom_read_returns_program_bytes() {
        let mut rom = vec![0; 4096];
        rom[0] = 0xEA;
        let mut bus = bus_with_rom(rom, BankingScheme::Rom4K);
        assert_eq!(bus.read(0x1000).unwrap(), 0xEA);
    }

    #[test]
    fn rom_write_at_non_hotspot_is_a_fault() {
        let rom = vec![0; 4096];
        let mut bus = bus_with_rom(rom, BankingScheme::Rom4K);
        assert!(bus.write(0x1000, 0xFF).is_err());
    }

    #[test]
    fn no_cartridge_read_is_a_fault() {
        let mut bus = Atari2600Bus::new();
        assert!(bus.read(0x1000).is_err());
    }

    #[test]
    fn bank_switch_marks_rom_window_dirty() {
        let mut rom = vec![0; 8192];
        rom[4096] = 0x99;
        let mut bus = bus_with_rom(rom, BankingScheme::F8);
        bus.mark_page_clean(0x1000);
        bus.write(0x1FF9, 0).unwrap();
        assert!(bus.is_dirty_page(0x1000));
        assert_eq!(bus.read(0x1000).unwrap(), 0x99);
    }

    #[test]
    fn wsync_strobe_requests_cycles_to_boundary() {
        let mut bus = Atari2600Bus::new();
        bus.write(0x02, 0).unwrap();
        let extra = bus.take_wsync_request();
        assert!(extra.is_some());
        assert!(bus.take_wsync_request().is_none());
    }

    #[test]
    fn tia_register_has_side_effect() {
        let bus = Atari2600Bus::new();
        assert!(bus.has_side_effect(0x0000));
        assert!(!bus.has_side_effect(0x0080));
    }
}
