//! CPU wrapper for the Atari 2600 (6507, the 6502 variant with a 13-bit
//! address bus exposed through [`crate::bus::Atari2600Bus`]).

use emu_core::cpu_6502::{Cpu6502, CpuFault, StepResult};
use serde::{Deserialize, Serialize};

use crate::bus::{Atari2600Bus, BusFault};

/// A snapshot of the 6502's own registers, independent of the bus state,
/// so a save state can restore execution exactly where it left off instead
/// of rewinding the CPU to its power-on values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CpuRegisters {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub p: u8,
    pub s: u8,
    pub pc: u16,
    pub cycle: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Atari2600Cpu {
    #[serde(skip)]
    cpu: Option<Cpu6502<Atari2600Bus>>,
}

impl Atari2600Cpu {
    pub fn new(bus: Atari2600Bus) -> Self {
        Self { cpu: Some(Cpu6502::new(bus)) }
    }

    pub fn reset(&mut self) -> Result<(), CpuFault<BusFault>> {
        self.cpu.as_mut().expect("CPU always present").reset()
    }

    pub fn step(&mut self) -> Result<StepResult, CpuFault<BusFault>> {
        self.cpu.as_mut().expect("CPU always present").step()
    }

    pub fn add_cycles(&mut self, cycles: u32) {
        let cpu = self.cpu.as_mut().expect("CPU always present");
        cpu.cycle += cycles as u64;
    }

    pub fn cycle(&self) -> u64 {
        self.cpu.as_ref().expect("CPU always present").cycle
    }

    pub fn bus(&self) -> &Atari2600Bus {
        &self.cpu.as_ref().expect("CPU always present").memory
    }

    pub fn bus_mut(&mut self) -> &mut Atari2600Bus {
        &mut self.cpu.as_mut().expect("CPU always present").memory
    }

    pub fn replace_bus(&mut self, bus: Atari2600Bus) {
        self.cpu = Some(Cpu6502::new(bus));
    }

    pub fn registers(&self) -> CpuRegisters {
        let cpu = self.cpu.as_ref().expect("CPU always present");
        CpuRegisters {
            a: cpu.a,
            x: cpu.x,
            y: cpu.y,
            p: cpu.p,
            s: cpu.s,
            pc: cpu.pc,
            cycle: cpu.cycle,
        }
    }

    pub fn set_registers(&mut self, regs: CpuRegisters) {
        let cpu = self.cpu.as_mut().expect("CPU always present");
        cpu.a = regs.a;
        cpu.x = regs.x;
        cpu.y = regs.y;
        cpu.p = regs.p;
        cpu.s = regs.s;
        cpu.pc = regs.pc;
        cpu.cycle = regs.cycle;
    }
}
