//! Atari 2600 (VCS) system: CPU, TIA, PIA, and cartridge wired together.

#![allow(clippy::upper_case_acronyms)]

mod bus;
mod cartridge;
mod cpu;
mod pia;
mod tia;

use emu_core::cpu_6502::CpuFault;
use emu_core::types::Frame;
use emu_core::{MountPointInfo, System};
use serde_json::Value;
use thiserror::Error;

use bus::{Atari2600Bus, BusFault};
use cartridge::{Cartridge, CartridgeError};
use cpu::Atari2600Cpu;
pub use cpu::CpuRegisters;
pub use pia::JoystickState;

/// CPU cycles in one NTSC frame: 262 scanlines * 76 CPU cycles/scanline
/// (228 color clocks / 3 per CPU cycle).
const CYCLES_PER_FRAME: u32 = 262 * 76;

#[derive(Debug, Error)]
pub enum Atari2600Error {
    #[error("cartridge error: {0}")]
    Cartridge(#[from] CartridgeError),
    #[error("CPU fault: {0}")]
    Cpu(#[from] CpuFault<BusFault>),
    #[error("no cartridge loaded")]
    NoCartridge,
    #[error("invalid mount point: {0}")]
    InvalidMountPoint(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Atari2600Input {
    pub player0: JoystickState,
    pub player1: JoystickState,
    pub fire0: bool,
    pub fire1: bool,
    pub console_switches: u8,
}

pub struct Atari2600System {
    cpu: Atari2600Cpu,
    cycles: u64,
}

impl Default for Atari2600System {
    fn default() -> Self {
        Self::new()
    }
}

impl Atari2600System {
    pub fn new() -> Self {
        Self { cpu: Atari2600Cpu::new(Atari2600Bus::new()), cycles: 0 }
    }

    /// Apply controller/console state ahead of the next `step_frame`.
    pub fn set_input(&mut self, input: Atari2600Input) {
        let bus = self.cpu.bus_mut();
        bus.pia.set_joysticks(input.player0, input.player1);
        bus.pia.set_console_switches(input.console_switches);
        bus.tia.set_inputs(input.fire0, input.fire1);
    }

    pub fn debug_info(&self) -> Option<DebugInfo> {
        let bus = self.cpu.bus();
        bus.cartridge.as_ref().map(|cart| DebugInfo {
            rom_size: cart.size(),
            banking_scheme: format!("{:?}", cart.scheme()),
            current_bank: cart.current_bank(),
            scanline: bus.tia.scanline(),
        })
    }

    /// A diagnostic register/memory dump, used on a fatal fault instead of a
    /// raw panic: registers, bus fault context, and TIA/PIA summary.
    pub fn debug_dump(&self) -> String {
        let bus = self.cpu.bus();
        format!(
            "cycles={} cpu_cycle={} scanline={} cartridge={:?}",
            self.cycles,
            self.cpu.cycle(),
            bus.tia.scanline(),
            bus.cartridge.as_ref().map(|c| c.scheme()),
        )
    }
}

#[derive(Debug, Clone)]
pub struct DebugInfo {
    pub rom_size: usize,
    pub banking_scheme: String,
    pub current_bank: usize,
    pub scanline: u16,
}

impl System for Atari2600System {
    type Error = Atari2600Error;

    fn reset(&mut self) {
        self.cpu.bus_mut().reset();
        // `reset()` reads the reset vector off the cartridge; with none
        // mounted the read comes back `Err(NoCartridge)`, which is fine:
        // there is nothing useful to execute until one is mounted.
        let _ = self.cpu.reset();
        self.cycles = 0;
    }

    fn step_frame(&mut self) -> Result<Frame, Self::Error> {
        let mut cycles_this_frame = 0u32;
        let mut frame = Frame::new(tia::SCREEN_WIDTH as u32, tia::SCREEN_HEIGHT as u32);

        while cycles_this_frame < CYCLES_PER_FRAME {
            let result = self.cpu.step()?;
            self.cpu.bus_mut().clock(result.cycles);
            cycles_this_frame += result.cycles;
            self.cycles += result.cycles as u64;

            if let Some(extra) = self.cpu.bus_mut().take_wsync_request() {
                self.cpu.bus_mut().clock(extra);
                self.cpu.add_cycles(extra);
                cycles_this_frame += extra;
                self.cycles += extra as u64;
            }

            if result.halted {
                break;
            }
            if self.cpu.bus().tia.frame_ready() {
                break;
            }
        }

        if self.cpu.bus().tia.frame_ready() {
            let pixels = self.cpu.bus_mut().tia.take_frame();
            frame.pixels = pixels;
        }

        Ok(frame)
    }

    fn save_state(&self) -> Value {
        serde_json::json!({
            "version": 1,
            "system": "atari2600",
            "cycles": self.cycles,
            "bus": self.cpu.bus(),
            "cpu": self.cpu.registers(),
        })
    }

    fn load_state(&mut self, v: &Value) -> Result<(), serde_json::Error> {
        let version = v["version"].as_u64().unwrap_or(0);
        if version != 1 || v["system"].as_str() != Some("atari2600") {
            return Err(serde::de::Error::custom("incompatible save state"));
        }
        self.cycles = v["cycles"].as_u64().unwrap_or(0);
        if let Some(bus_value) = v.get("bus") {
            let bus: Atari2600Bus = serde_json::from_value(bus_value.clone())?;
            self.cpu.replace_bus(bus);
        }
        if let Some(cpu_value) = v.get("cpu") {
            let regs: CpuRegisters = serde_json::from_value(cpu_value.clone())?;
            self.cpu.set_registers(regs);
        }
        Ok(())
    }

    fn supports_save_states(&self) -> bool {
        true
    }

    fn mount_points(&self) -> Vec<MountPointInfo> {
        vec![MountPointInfo {
            id: "Cartridge".to_string(),
            name: "Cartridge Slot".to_string(),
            extensions: vec!["a26".to_string(), "bin".to_string()],
            required: true,
        }]
    }

    fn mount(&mut self, mount_point_id: &str, data: &[u8]) -> Result<(), Self::Error> {
        if mount_point_id != "Cartridge" {
            return Err(Atari2600Error::InvalidMountPoint(mount_point_id.to_string()));
        }
        let cartridge = Cartridge::from_rom(data.to_vec())?;
        self.cpu.bus_mut().load_cartridge(cartridge);
        self.reset();
        Ok(())
    }

    fn unmount(&mut self, mount_point_id: &str) -> Result<(), Self::Error> {
        if mount_point_id != "Cartridge" {
            return Err(Atari2600Error::InvalidMountPoint(mount_point_id.to_string()));
        }
        self.cpu.bus_mut().cartridge = None;
        Ok(())
    }

    fn is_mounted(&self, mount_point_id: &str) -> bool {
        if mount_point_id != "Cartridge" {
            return false;
        }
        self.cpu.bus().cartridge.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop_rom() -> Vec<u8> {
        let mut rom = vec![0xEA; 4096]; // NOP filler
        rom[0x0FFC] = 0x00; // reset vector low -> $1000
        rom[0x0FFD] = 0x10;
        rom[0x0FFE] = 0x00; // IRQ vector = 0 so BRK halts cleanly if ever hit
        rom[0x0FFF] = 0x00;
        rom
    }

    #[test]
    fn mount_points_report_cartridge_slot() {
        let sys = Atari2600System::new();
        let mounts = sys.mount_points();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].id, "Cartridge");
        assert!(mounts[0].required);
    }

    #[test]
    fn mount_and_unmount_cartridge() {
        let mut sys = Atari2600System::new();
        assert!(sys.mount("Cartridge", &nop_rom()).is_ok());
        assert!(sys.is_mounted("Cartridge"));
        assert!(sys.unmount("Cartridge").is_ok());
        assert!(!sys.is_mounted("Cartridge"));
    }

    #[test]
    fn invalid_mount_point_is_an_error() {
        let mut sys = Atari2600System::new();
        assert!(sys.mount("Floppy", &nop_rom()).is_err());
    }

    #[test]
    fn mounting_resets_cycle_count() {
        let mut sys = Atari2600System::new();
        sys.mount("Cartridge", &nop_rom()).unwrap();
        assert_eq!(sys.cycles, 0);
    }

    #[test]
    fn save_load_round_trips_without_a_mounted_cartridge() {
        let sys = Atari2600System::new();
        let state = sys.save_state();
        assert_eq!(state["version"], 1);
        assert_eq!(state["system"], "atari2600");

        let mut sys2 = Atari2600System::new();
        assert!(sys2.load_state(&state).is_ok());
    }

    #[test]
    fn save_load_round_trips_with_a_mounted_cartridge() {
        let mut sys = Atari2600System::new();
        sys.mount("Cartridge", &nop_rom()).unwrap();
        sys.cpu.bus_mut().clock(5);
        // Move the CPU registers off their power-on values so the round trip
        // actually exercises register persistence rather than comparing zeros.
        sys.cpu.set_registers(CpuRegisters {
            a: 0x11,
            x: 0x22,
            y: 0x33,
            p: 0x24,
            s: 0xF0,
            pc: 0x1234,
            cycle: 777,
        });

        let state = sys.save_state();
        let mut sys2 = Atari2600System::new();
        sys2.load_state(&state).unwrap();
        assert_eq!(
            sys2.cpu.bus_mut().pia.read(0x0284),
            sys.cpu.bus_mut().pia.read(0x0284)
        );

        let regs = sys.cpu.registers();
        let regs2 = sys2.cpu.registers();
        assert_eq!(regs2.pc, regs.pc);
        assert_eq!(regs2.a, regs.a);
        assert_eq!(regs2.x, regs.x);
        assert_eq!(regs2.y, regs.y);
        assert_eq!(regs2.s, regs.s);
        assert_eq!(regs2.p, regs.p);
        assert_eq!(regs2.cycle, regs.cycle);
    }

    #[test]
    fn load_state_rejects_wrong_version() {
        let mut sys = Atari2600System::new();
        let bad = serde_json::json!({"version": 2, "system": "atari2600"});
        assert!(sys.load_state(&bad).is_err());
    }

    #[test]
    fn step_frame_runs_without_a_cartridge_until_bus_fault() {
        let mut sys = Atari2600System::new();
        let err = sys.step_frame().unwrap_err();
        matches!(err, Atari2600Error::Cpu(_));
    }

    #[test]
    fn input_is_forwarded_to_pia_and_tia() {
        let mut sys = Atari2600System::new();
        sys.set_input(Atari2600Input {
            fire0: true,
            console_switches: 0xFF,
            ..Default::default()
        });
        let bus = sys.cpu.bus_mut();
        assert_eq!(bus.pia.read(0x0282), 0x3F);
    }
}
