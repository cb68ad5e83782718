//! Generic 6502 interpreter shared by 6502-family emulated systems.
//!
//! Decoding is table-driven: every opcode maps to an (`Op`, `AddrMode`) pair with a
//! base cycle cost, mirroring the instruction/operand split of the systems this core
//! was ported from rather than a single giant per-opcode `match`. Sitting in front of
//! the decoder is a per-page decoded-instruction cache keyed on program counter, so a
//! straight run of non-self-modifying code pays the decode cost once per 256-byte page.

use std::collections::HashMap;
use thiserror::Error;

/// A memory bus a `Cpu6502` can execute against.
///
/// Besides byte-level access, a bus answers the two questions the instruction cache
/// needs: whether an address carries a read/write side effect (so the page parser
/// never speculatively touches it) and whether a page has been written since the
/// cache last reconciled with it.
pub trait Memory6502 {
    type Fault: std::fmt::Debug;

    fn read(&mut self, addr: u16) -> Result<u8, Self::Fault>;
    fn write(&mut self, addr: u16, value: u8) -> Result<(), Self::Fault>;

    /// True if reading or writing `addr` can change machine state beyond a plain
    /// byte store (mapped device registers, bank-switch magic addresses).
    fn has_side_effect(&self, addr: u16) -> bool;

    /// True if the 256-byte page containing `addr` has been written since the
    /// instruction cache last reconciled it.
    fn is_dirty_page(&self, addr: u16) -> bool;

    /// Clear the dirty flag for the page containing `addr`.
    fn mark_page_clean(&mut self, addr: u16);
}

/// A fault that halts the interpreter. Every variant is fatal to the process;
/// recovery is never attempted (a partially executed instruction is never resumed).
#[derive(Debug, Error)]
pub enum CpuFault<E: std::fmt::Debug> {
    #[error("invalid opcode {opcode:#04x} at {pc:#06x}")]
    InvalidOpcode { pc: u16, opcode: u8 },
    #[error("bus fault: {0:?}")]
    Bus(E),
}

impl<E: std::fmt::Debug> From<E> for CpuFault<E> {
    fn from(e: E) -> Self {
        CpuFault::Bus(e)
    }
}

/// Result of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepResult {
    pub cycles: u32,
    /// Set when BRK executed with an IRQ vector of zero. This is a clean,
    /// cooperative stop request, not a fault: the driver should stop calling
    /// `step` but the process exit code is 0, not -1.
    pub halted: bool,
}

pub const FLAG_N: u8 = 0x80;
pub const FLAG_V: u8 = 0x40;
pub const FLAG_U: u8 = 0x20;
pub const FLAG_B: u8 = 0x10;
pub const FLAG_D: u8 = 0x08;
pub const FLAG_I: u8 = 0x04;
pub const FLAG_Z: u8 = 0x02;
pub const FLAG_C: u8 = 0x01;

pub const NMI_VECTOR: u16 = 0xFFFA;
pub const RESET_VECTOR: u16 = 0xFFFC;
pub const IRQ_VECTOR: u16 = 0xFFFE;

/// Z/N from an 8-bit result: shared by every load/transfer/arithmetic/logic op.
pub fn apply_nz(result: u8) -> (bool, bool) {
    (result == 0, result & 0x80 != 0)
}

/// V as defined in 4.1: set when both inputs share a sign bit and the result differs.
pub fn apply_overflow(a: u8, b: u8, r: u8) -> bool {
    (a ^ r) & (b ^ r) & 0x80 != 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    Indirect,
    IndirectX,
    IndirectY,
    Relative,
}

fn mode_len(mode: AddrMode) -> u8 {
    match mode {
        AddrMode::Implied | AddrMode::Accumulator => 1,
        AddrMode::Immediate
        | AddrMode::ZeroPage
        | AddrMode::ZeroPageX
        | AddrMode::ZeroPageY
        | AddrMode::IndirectX
        | AddrMode::IndirectY
        | AddrMode::Relative => 2,
        AddrMode::Absolute | AddrMode::AbsoluteX | AddrMode::AbsoluteY | AddrMode::Indirect => 3,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Op {
    ADC, AND, ASL, BCC, BCS, BEQ, BIT, BMI, BNE, BPL, BRK, BVC, BVS,
    CLC, CLD, CLI, CLV, CMP, CPX, CPY,
    DEC, DEX, DEY, EOR,
    INC, INX, INY,
    JMP, JSR,
    LDA, LDX, LDY, LSR,
    NOP, ORA,
    PHA, PHP, PLA, PLP,
    ROL, ROR, RTI, RTS,
    SBC, SEC, SED, SEI, STA, STX, STY,
    TAX, TAY, TSX, TXA, TXS, TYA,
}

#[derive(Debug, Clone, Copy)]
struct OpInfo {
    op: Op,
    mode: AddrMode,
    cycles: u8,
    /// Whether this (op, mode) pair pays +1 cycle on an index-carry page cross.
    /// Only read-type instructions in indexed/indirect-indexed modes do.
    page_penalty: bool,
}

const fn info(op: Op, mode: AddrMode, cycles: u8, page_penalty: bool) -> OpInfo {
    OpInfo { op, mode, cycles, page_penalty }
}

/// Decode a single opcode byte into its instruction/addressing-mode/cost triple.
/// Returns `None` for every unofficial/undocumented opcode: this core implements
/// the official instruction set only, per 4.3.
fn decode(opcode: u8) -> Option<OpInfo> {
    use AddrMode::*;
    use Op::*;
    Some(match opcode {
        0x69 => info(ADC, Immediate, 2, false),
        0x65 => info(ADC, ZeroPage, 3, false),
        0x75 => info(ADC, ZeroPageX, 4, false),
        0x6D => info(ADC, Absolute, 4, false),
        0x7D => info(ADC, AbsoluteX, 4, true),
        0x79 => info(ADC, AbsoluteY, 4, true),
        0x61 => info(ADC, IndirectX, 6, false),
        0x71 => info(ADC, IndirectY, 5, true),

        0x29 => info(AND, Immediate, 2, false),
        0x25 => info(AND, ZeroPage, 3, false),
        0x35 => info(AND, ZeroPageX, 4, false),
        0x2D => info(AND, Absolute, 4, false),
        0x3D => info(AND, AbsoluteX, 4, true),
        0x39 => info(AND, AbsoluteY, 4, true),
        0x21 => info(AND, IndirectX, 6, false),
        0x31 => info(AND, IndirectY, 5, true),

        0x0A => info(ASL, Accumulator, 2, false),
        0x06 => info(ASL, ZeroPage, 5, false),
        0x16 => info(ASL, ZeroPageX, 6, false),
        0x0E => info(ASL, Absolute, 6, false),
        0x1E => info(ASL, AbsoluteX, 7, false),

        0x90 => info(BCC, Relative, 2, false),
        0xB0 => info(BCS, Relative, 2, false),
        0xF0 => info(BEQ, Relative, 2, false),
        0x24 => info(BIT, ZeroPage, 3, false),
        0x2C => info(BIT, Absolute, 4, false),
        0x30 => info(BMI, Relative, 2, false),
        0xD0 => info(BNE, Relative, 2, false),
        0x10 => info(BPL, Relative, 2, false),
        0x00 => info(BRK, Implied, 7, false),
        0x50 => info(BVC, Relative, 2, false),
        0x70 => info(BVS, Relative, 2, false),

        0x18 => info(CLC, Implied, 2, false),
        0xD8 => info(CLD, Implied, 2, false),
        0x58 => info(CLI, Implied, 2, false),
        0xB8 => info(CLV, Implied, 2, false),

        0xC9 => info(CMP, Immediate, 2, false),
        0xC5 => info(CMP, ZeroPage, 3, false),
        0xD5 => info(CMP, ZeroPageX, 4, false),
        0xCD => info(CMP, Absolute, 4, false),
        0xDD => info(CMP, AbsoluteX, 4, true),
        0xD9 => info(CMP, AbsoluteY, 4, true),
        0xC1 => info(CMP, IndirectX, 6, false),
        0xD1 => info(CMP, IndirectY, 5, true),

        0xE0 => info(CPX, Immediate, 2, false),
        0xE4 => info(CPX, ZeroPage, 3, false),
        0xEC => info(CPX, Absolute, 4, false),
        0xC0 => info(CPY, Immediate, 2, false),
        0xC4 => info(CPY, ZeroPage, 3, false),
        0xCC => info(CPY, Absolute, 4, false),

        0xC6 => info(DEC, ZeroPage, 5, false),
        0xD6 => info(DEC, ZeroPageX, 6, false),
        0xCE => info(DEC, Absolute, 6, false),
        0xDE => info(DEC, AbsoluteX, 7, false),
        0xCA => info(DEX, Implied, 2, false),
        0x88 => info(DEY, Implied, 2, false),

        0x49 => info(EOR, Immediate, 2, false),
        0x45 => info(EOR, ZeroPage, 3, false),
        0x55 => info(EOR, ZeroPageX, 4, false),
        0x4D => info(EOR, Absolute, 4, false),
        0x5D => info(EOR, AbsoluteX, 4, true),
        0x59 => info(EOR, AbsoluteY, 4, true),
        0x41 => info(EOR, IndirectX, 6, false),
        0x51 => info(EOR, IndirectY, 5, true),

        0xE6 => info(INC, ZeroPage, 5, false),
        0xF6 => info(INC, ZeroPageX, 6, false),
        0xEE => info(INC, Absolute, 6, false),
        0xFE => info(INC, AbsoluteX, 7, false),
        0xE8 => info(INX, Implied, 2, false),
        0xC8 => info(INY, Implied, 2, false),

        0x4C => info(JMP, Absolute, 3, false),
        0x6C => info(JMP, Indirect, 5, false),
        0x20 => info(JSR, Absolute, 6, false),

        0xA9 => info(LDA, Immediate, 2, false),
        0xA5 => info(LDA, ZeroPage, 3, false),
        0xB5 => info(LDA, ZeroPageX, 4, false),
        0xAD => info(LDA, Absolute, 4, false),
        0xBD => info(LDA, AbsoluteX, 4, true),
        0xB9 => info(LDA, AbsoluteY, 4, true),
        0xA1 => info(LDA, IndirectX, 6, false),
        0xB1 => info(LDA, IndirectY, 5, true),

        0xA2 => info(LDX, Immediate, 2, false),
        0xA6 => info(LDX, ZeroPage, 3, false),
        0xB6 => info(LDX, ZeroPageY, 4, false),
        0xAE => info(LDX, Absolute, 4, false),
        0xBE => info(LDX, AbsoluteY, 4, true),

        0xA0 => info(LDY, Immediate, 2, false),
        0xA4 => info(LDY, ZeroPage, 3, false),
        0xB4 => info(LDY, ZeroPageX, 4, false),
        0xAC => info(LDY, Absolute, 4, false),
        0xBC => info(LDY, AbsoluteX, 4, true),

        0x4A => info(LSR, Accumulator, 2, false),
        0x46 => info(LSR, ZeroPage, 5, false),
        0x56 => info(LSR, ZeroPageX, 6, false),
        0x4E => info(LSR, Absolute, 6, false),
        0x5E => info(LSR, AbsoluteX, 7, false),

        0xEA => info(NOP, Implied, 2, false),

        0x09 => info(ORA, Immediate, 2, false),
        0x05 => info(ORA, ZeroPage, 3, false),
        0x15 => info(ORA, ZeroPageX, 4, false),
        0x0D => info(ORA, Absolute, 4, false),
        0x1D => info(ORA, AbsoluteX, 4, true),
        0x19 => info(ORA, AbsoluteY, 4, true),
        0x01 => info(ORA, IndirectX, 6, false),
        0x11 => info(ORA, IndirectY, 5, true),

        0x48 => info(PHA, Implied, 3, false),
        0x08 => info(PHP, Implied, 3, false),
        0x68 => info(PLA, Implied, 4, false),
        0x28 => info(PLP, Implied, 4, false),

        0x2A => info(ROL, Accumulator, 2, false),
        0x26 => info(ROL, ZeroPage, 5, false),
        0x36 => info(ROL, ZeroPageX, 6, false),
        0x2E => info(ROL, Absolute, 6, false),
        0x3E => info(ROL, AbsoluteX, 7, false),

        0x6A => info(ROR, Accumulator, 2, false),
        0x66 => info(ROR, ZeroPage, 5, false),
        0x76 => info(ROR, ZeroPageX, 6, false),
        0x6E => info(ROR, Absolute, 6, false),
        0x7E => info(ROR, AbsoluteX, 7, false),

        0x40 => info(RTI, Implied, 6, false),
        0x60 => info(RTS, Implied, 6, false),

        0xE9 => info(SBC, Immediate, 2, false),
        0xE5 => info(SBC, ZeroPage, 3, false),
        0xF5 => info(SBC, ZeroPageX, 4, false),
        0xED => info(SBC, Absolute, 4, false),
        0xFD => info(SBC, AbsoluteX, 4, true),
        0xF9 => info(SBC, AbsoluteY, 4, true),
        0xE1 => info(SBC, IndirectX, 6, false),
        0xF1 => info(SBC, IndirectY, 5, true),

        0x38 => info(SEC, Implied, 2, false),
        0xF8 => info(SED, Implied, 2, false),
        0x78 => info(SEI, Implied, 2, false),

        0x85 => info(STA, ZeroPage, 3, false),
        0x95 => info(STA, ZeroPageX, 4, false),
        0x8D => info(STA, Absolute, 4, false),
        0x9D => info(STA, AbsoluteX, 5, false),
        0x99 => info(STA, AbsoluteY, 5, false),
        0x81 => info(STA, IndirectX, 6, false),
        0x91 => info(STA, IndirectY, 6, false),

        0x86 => info(STX, ZeroPage, 3, false),
        0x96 => info(STX, ZeroPageY, 4, false),
        0x8E => info(STX, Absolute, 4, false),
        0x84 => info(STY, ZeroPage, 3, false),
        0x94 => info(STY, ZeroPageX, 4, false),
        0x8C => info(STY, Absolute, 4, false),

        0xAA => info(TAX, Implied, 2, false),
        0xA8 => info(TAY, Implied, 2, false),
        0xBA => info(TSX, Implied, 2, false),
        0x8A => info(TXA, Implied, 2, false),
        0x9A => info(TXS, Implied, 2, false),
        0x98 => info(TYA, Implied, 2, false),

        _ => return None,
    })
}

/// A decoded instruction cached by address. `operand` holds the raw encoded operand
/// (1 or 2 bytes, zero-extended) as read from ROM at parse time; registers feeding
/// into indexed/indirect addressing are re-read at execution time, not cached.
#[derive(Debug, Clone, Copy)]
struct DecodedInsn {
    op: Op,
    mode: AddrMode,
    operand: u16,
    len: u8,
    base_cycles: u8,
    page_penalty: bool,
}

pub struct Cpu6502<M: Memory6502> {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub p: u8,
    pub s: u8,
    pub pc: u16,
    pub cycle: u64,
    pub memory: M,
    cache: HashMap<u16, DecodedInsn>,
}

impl<M: Memory6502> Cpu6502<M> {
    pub fn new(memory: M) -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            p: 0,
            s: 0xFF,
            pc: 0,
            cycle: 0,
            memory,
            cache: HashMap::new(),
        }
    }

    /// 4.1 contract: A=X=Y=0, P=0, S=0xFF, PC=reset_pc, cycle=0.
    pub fn init(&mut self, reset_pc: u16) {
        self.a = 0;
        self.x = 0;
        self.y = 0;
        self.p = 0;
        self.s = 0xFF;
        self.pc = reset_pc;
        self.cycle = 0;
        self.cache.clear();
    }

    pub fn get_flag(&self, mask: u8) -> bool {
        self.p & mask != 0
    }

    pub fn set_flag(&mut self, mask: u8, value: bool) {
        if value {
            self.p |= mask;
        } else {
            self.p &= !mask;
        }
    }

    fn read_word(&mut self, addr: u16) -> Result<u16, CpuFault<M::Fault>> {
        let lo = self.memory.read(addr)?;
        let hi = self.memory.read(addr.wrapping_add(1))?;
        Ok(lo as u16 | (hi as u16) << 8)
    }

    pub fn reset(&mut self) -> Result<(), CpuFault<M::Fault>> {
        let vec = self.read_word(RESET_VECTOR)?;
        self.init(vec);
        Ok(())
    }

    /// Push/pop against the hard-wired 6502 stack page (0x0100 + S). On the 2600
    /// this page is physically the TIA-mirror/RAM-mirror split of the bus (6.),
    /// which is why software keeps S above 0x80: nothing special is required here,
    /// it falls out of routing every access through `self.memory`.
    fn push_byte(&mut self, v: u8) -> Result<(), CpuFault<M::Fault>> {
        self.memory.write(0x0100 | self.s as u16, v)?;
        self.s = self.s.wrapping_sub(1);
        Ok(())
    }

    fn pop_byte(&mut self) -> Result<u8, CpuFault<M::Fault>> {
        self.s = self.s.wrapping_add(1);
        Ok(self.memory.read(0x0100 | self.s as u16)?)
    }

    fn push_word(&mut self, v: u16) -> Result<(), CpuFault<M::Fault>> {
        self.push_byte((v >> 8) as u8)?;
        self.push_byte((v & 0xFF) as u8)?;
        Ok(())
    }

    fn pop_word(&mut self) -> Result<u16, CpuFault<M::Fault>> {
        let lo = self.pop_byte()?;
        let hi = self.pop_byte()?;
        Ok(lo as u16 | (hi as u16) << 8)
    }

    /// Push PC and P, set I, load PC from `vector`. Shared by NMI/IRQ entry and by
    /// BRK's software-interrupt path. Costs 7 cycles.
    fn interrupt(&mut self, vector: u16, set_b: bool) -> Result<(), CpuFault<M::Fault>> {
        self.push_word(self.pc)?;
        let mut pushed_p = self.p | FLAG_U;
        if set_b {
            pushed_p |= FLAG_B;
        } else {
            pushed_p &= !FLAG_B;
        }
        self.push_byte(pushed_p)?;
        self.set_flag(FLAG_I, true);
        self.pc = self.read_word(vector)?;
        self.cycle += 7;
        Ok(())
    }

    /// Not driven by anything in this system's scope (the 2600 has no maskable
    /// interrupt source wired to the CPU), kept for reuse by other 6502-family
    /// systems in the workspace.
    pub fn trigger_nmi(&mut self) -> Result<(), CpuFault<M::Fault>> {
        self.interrupt(NMI_VECTOR, false)
    }

    pub fn trigger_irq(&mut self) -> Result<(), CpuFault<M::Fault>> {
        if self.get_flag(FLAG_I) {
            return Ok(());
        }
        self.interrupt(IRQ_VECTOR, false)
    }

    fn invalidate_page(&mut self, addr: u16) {
        let page = addr & 0xFF00;
        self.cache.retain(|k, _| k & 0xFF00 != page);
        self.memory.mark_page_clean(page);
    }

    /// Populate the cache for the whole 256-byte page containing `pc`, per 4.3.
    fn parse_page(&mut self, pc: u16) -> Result<(), CpuFault<M::Fault>> {
        let page = pc & 0xFF00;
        let mut addr = page;
        loop {
            if addr.wrapping_sub(page) >= 0x100 {
                break;
            }
            if self.memory.has_side_effect(addr) {
                break;
            }
            let opcode = self.memory.read(addr)?;
            let Some(opinfo) = decode(opcode) else { break };
            let len = mode_len(opinfo.mode);

            let mut operand: u16 = 0;
            let mut stop_after = false;
            if len >= 2 {
                let b1 = addr.wrapping_add(1);
                if self.memory.has_side_effect(b1) {
                    stop_after = true;
                } else {
                    operand = self.memory.read(b1)? as u16;
                }
            }
            if len == 3 && !stop_after {
                let b2 = addr.wrapping_add(2);
                if self.memory.has_side_effect(b2) {
                    stop_after = true;
                } else {
                    operand |= (self.memory.read(b2)? as u16) << 8;
                }
            }

            self.cache.insert(
                addr,
                DecodedInsn {
                    op: opinfo.op,
                    mode: opinfo.mode,
                    operand,
                    len,
                    base_cycles: opinfo.cycles,
                    page_penalty: opinfo.page_penalty,
                },
            );

            if stop_after {
                break;
            }
            addr = addr.wrapping_add(len as u16);
        }
        Ok(())
    }

    fn ensure_decoded(&mut self, pc: u16) -> Result<(), CpuFault<M::Fault>> {
        if self.cache.contains_key(&pc) {
            if self.memory.is_dirty_page(pc) {
                self.invalidate_page(pc);
                self.parse_page(pc)?;
            }
        } else {
            self.parse_page(pc)?;
        }
        Ok(())
    }

    /// Execute the instruction at the current PC, advancing cycle and PC.
    pub fn step(&mut self) -> Result<StepResult, CpuFault<M::Fault>> {
        let pc = self.pc;
        self.ensure_decoded(pc)?;
        let insn = *self.cache.get(&pc).ok_or_else(|| {
            let opcode = self.memory.read(pc).unwrap_or(0);
            CpuFault::InvalidOpcode { pc, opcode }
        })?;
        self.execute(pc, insn)
    }

    /// Resolve an address-producing mode to (address, page_crossed). Implied,
    /// Accumulator, Immediate and Relative do not go through this path.
    fn address_of(&mut self, mode: AddrMode, operand: u16) -> Result<(u16, bool), CpuFault<M::Fault>> {
        Ok(match mode {
            AddrMode::ZeroPage => (operand & 0xFF, false),
            AddrMode::ZeroPageX => (((operand as u8).wrapping_add(self.x)) as u16, false),
            AddrMode::ZeroPageY => (((operand as u8).wrapping_add(self.y)) as u16, false),
            AddrMode::Absolute => (operand, false),
            AddrMode::AbsoluteX => {
                let addr = operand.wrapping_add(self.x as u16);
                (addr, operand & 0xFF00 != addr & 0xFF00)
            }
            AddrMode::AbsoluteY => {
                let addr = operand.wrapping_add(self.y as u16);
                (addr, operand & 0xFF00 != addr & 0xFF00)
            }
            AddrMode::IndirectX => {
                let ptr = (operand as u8).wrapping_add(self.x);
                let lo = self.memory.read(ptr as u16)?;
                let hi = self.memory.read(ptr.wrapping_add(1) as u16)?;
                (lo as u16 | (hi as u16) << 8, false)
            }
            AddrMode::IndirectY => {
                let ptr = operand as u8;
                let lo = self.memory.read(ptr as u16)?;
                let hi = self.memory.read(ptr.wrapping_add(1) as u16)?;
                let base = lo as u16 | (hi as u16) << 8;
                let addr = base.wrapping_add(self.y as u16);
                (addr, base & 0xFF00 != addr & 0xFF00)
            }
            // JMP's own Indirect mode is handled directly in execute(); Implied/
            // Accumulator/Immediate/Relative never reach this function.
            _ => unreachable!("address_of called with non-address mode"),
        })
    }

    fn adc(&mut self, value: u8) {
        let a = self.a;
        let c = self.get_flag(FLAG_C) as u16;
        let raw = a as u16 + value as u16 + c;
        let raw_u8 = raw as u8;
        if self.get_flag(FLAG_D) {
            let mut lo = (a & 0x0F) + (value & 0x0F) + c as u8;
            let mut carry = 0u8;
            if lo > 9 {
                lo = lo.wrapping_sub(10) & 0x0F;
                carry = 1;
            }
            let mut hi = (a >> 4) + (value >> 4) + carry;
            let mut final_carry = false;
            if hi > 9 {
                hi = hi.wrapping_sub(10) & 0x0F;
                final_carry = true;
            }
            self.a = (hi << 4) | lo;
            self.set_flag(FLAG_C, final_carry);
        } else {
            self.a = raw_u8;
            self.set_flag(FLAG_C, raw > 0xFF);
        }
        self.set_flag(FLAG_Z, self.a == 0);
        self.set_flag(FLAG_N, raw_u8 & 0x80 != 0);
        self.set_flag(FLAG_V, apply_overflow(a, value, raw_u8));
    }

    fn sbc(&mut self, value: u8) {
        let a = self.a;
        let borrow: i16 = 1 - self.get_flag(FLAG_C) as i16;
        let raw = a as i16 - value as i16 - borrow;
        let raw_u8 = (raw & 0xFF) as u8;
        if self.get_flag(FLAG_D) {
            let mut lo = (a & 0x0F) as i16 - (value & 0x0F) as i16 - borrow;
            let mut bwo = 0i16;
            if lo < 0 {
                lo += 10;
                bwo = 1;
            }
            let mut hi = (a >> 4) as i16 - (value >> 4) as i16 - bwo;
            let mut final_borrow = false;
            if hi < 0 {
                hi += 10;
                final_borrow = true;
            }
            self.a = (((hi as u8) << 4) | (lo as u8 & 0x0F)) as u8;
            self.set_flag(FLAG_C, !final_borrow);
        } else {
            self.a = raw_u8;
            self.set_flag(FLAG_C, raw >= 0);
        }
        self.set_flag(FLAG_Z, self.a == 0);
        self.set_flag(FLAG_N, raw_u8 & 0x80 != 0);
        self.set_flag(FLAG_V, (a ^ value) & (a ^ raw_u8) & 0x80 != 0);
    }

    fn compare(&mut self, reg: u8, value: u8) {
        let r = reg as i16 - value as i16;
        let result = (r & 0xFF) as u8;
        let (z, n) = apply_nz(result);
        self.set_flag(FLAG_Z, z);
        self.set_flag(FLAG_N, n);
        self.set_flag(FLAG_C, r >= 0);
    }

    /// Execute a decoded entry: advance cycle by base + mode/branch/page-cross
    /// adjustments, run the operation, then land on the next PC.
    fn execute(&mut self, pc: u16, insn: DecodedInsn) -> Result<StepResult, CpuFault<M::Fault>> {
        use Op::*;
        let mut cycles = insn.base_cycles as u32;
        let mut next_pc = pc.wrapping_add(insn.len as u16);
        let mut halted = false;

        match insn.op {
            // Loads
            LDA | LDX | LDY | AND | ORA | EOR | ADC | SBC | CMP | BIT => {
                let value = match insn.mode {
                    AddrMode::Immediate => insn.operand as u8,
                    AddrMode::Accumulator => self.a,
                    _ => {
                        let (addr, crossed) = self.address_of(insn.mode, insn.operand)?;
                        if insn.page_penalty && crossed {
                            cycles += 1;
                        }
                        self.memory.read(addr)?
                    }
                };
                match insn.op {
                    LDA => {
                        self.a = value;
                        let (z, n) = apply_nz(value);
                        self.set_flag(FLAG_Z, z);
                        self.set_flag(FLAG_N, n);
                    }
                    LDX => {
                        self.x = value;
                        let (z, n) = apply_nz(value);
                        self.set_flag(FLAG_Z, z);
                        self.set_flag(FLAG_N, n);
                    }
                    LDY => {
                        self.y = value;
                        let (z, n) = apply_nz(value);
                        self.set_flag(FLAG_Z, z);
                        self.set_flag(FLAG_N, n);
                    }
                    AND => {
                        self.a &= value;
                        let (z, n) = apply_nz(self.a);
                        self.set_flag(FLAG_Z, z);
                        self.set_flag(FLAG_N, n);
                    }
                    ORA => {
                        self.a |= value;
                        let (z, n) = apply_nz(self.a);
                        self.set_flag(FLAG_Z, z);
                        self.set_flag(FLAG_N, n);
                    }
                    EOR => {
                        self.a ^= value;
                        let (z, n) = apply_nz(self.a);
                        self.set_flag(FLAG_Z, z);
                        self.set_flag(FLAG_N, n);
                    }
                    ADC => self.adc(value),
                    SBC => self.sbc(value),
                    CMP => self.compare(self.a, value),
                    BIT => {
                        self.set_flag(FLAG_Z, self.a & value == 0);
                        self.set_flag(FLAG_N, value & 0x80 != 0);
                        self.set_flag(FLAG_V, value & 0x40 != 0);
                    }
                    _ => unreachable!(),
                }
            }
            CPX => {
                let value = self.operand_value(insn)?;
                self.compare(self.x, value);
            }
            CPY => {
                let value = self.operand_value(insn)?;
                self.compare(self.y, value);
            }

            STA | STX | STY => {
                let (addr, _) = self.address_of(insn.mode, insn.operand)?;
                let value = match insn.op {
                    STA => self.a,
                    STX => self.x,
                    STY => self.y,
                    _ => unreachable!(),
                };
                self.memory.write(addr, value)?;
            }

            ASL | LSR | ROL | ROR | INC | DEC => {
                let old = if insn.mode == AddrMode::Accumulator {
                    self.a
                } else {
                    let (addr, _) = self.address_of(insn.mode, insn.operand)?;
                    self.memory.read(addr)?
                };
                let (result, new_c) = match insn.op {
                    ASL => (old << 1, old & 0x80 != 0),
                    LSR => (old >> 1, old & 0x01 != 0),
                    ROL => (
                        (old << 1) | self.get_flag(FLAG_C) as u8,
                        old & 0x80 != 0,
                    ),
                    ROR => (
                        (old >> 1) | ((self.get_flag(FLAG_C) as u8) << 7),
                        old & 0x01 != 0,
                    ),
                    INC => (old.wrapping_add(1), self.get_flag(FLAG_C)),
                    DEC => (old.wrapping_sub(1), self.get_flag(FLAG_C)),
                    _ => unreachable!(),
                };
                if matches!(insn.op, ASL | LSR | ROL | ROR) {
                    self.set_flag(FLAG_C, new_c);
                }
                let (z, n) = apply_nz(result);
                self.set_flag(FLAG_Z, z);
                self.set_flag(FLAG_N, n);
                if insn.mode == AddrMode::Accumulator {
                    self.a = result;
                } else {
                    let (addr, _) = self.address_of(insn.mode, insn.operand)?;
                    self.memory.write(addr, result)?;
                }
            }

            INX => {
                self.x = self.x.wrapping_add(1);
                let (z, n) = apply_nz(self.x);
                self.set_flag(FLAG_Z, z);
                self.set_flag(FLAG_N, n);
            }
            INY => {
                self.y = self.y.wrapping_add(1);
                let (z, n) = apply_nz(self.y);
                self.set_flag(FLAG_Z, z);
                self.set_flag(FLAG_N, n);
            }
            DEX => {
                self.x = self.x.wrapping_sub(1);
                let (z, n) = apply_nz(self.x);
                self.set_flag(FLAG_Z, z);
                self.set_flag(FLAG_N, n);
            }
            DEY => {
                self.y = self.y.wrapping_sub(1);
                let (z, n) = apply_nz(self.y);
                self.set_flag(FLAG_Z, z);
                self.set_flag(FLAG_N, n);
            }

            TAX => {
                self.x = self.a;
                let (z, n) = apply_nz(self.x);
                self.set_flag(FLAG_Z, z);
                self.set_flag(FLAG_N, n);
            }
            TAY => {
                self.y = self.a;
                let (z, n) = apply_nz(self.y);
                self.set_flag(FLAG_Z, z);
                self.set_flag(FLAG_N, n);
            }
            TXA => {
                self.a = self.x;
                let (z, n) = apply_nz(self.a);
                self.set_flag(FLAG_Z, z);
                self.set_flag(FLAG_N, n);
            }
            TYA => {
                self.a = self.y;
                let (z, n) = apply_nz(self.a);
                self.set_flag(FLAG_Z, z);
                self.set_flag(FLAG_N, n);
            }
            TSX => {
                self.x = self.s;
                let (z, n) = apply_nz(self.x);
                self.set_flag(FLAG_Z, z);
                self.set_flag(FLAG_N, n);
            }
            TXS => {
                self.s = self.x;
            }

            PHA => self.push_byte(self.a)?,
            PHP => {
                let pushed = self.p | FLAG_B | FLAG_U;
                self.push_byte(pushed)?;
            }
            PLA => {
                self.a = self.pop_byte()?;
                let (z, n) = apply_nz(self.a);
                self.set_flag(FLAG_Z, z);
                self.set_flag(FLAG_N, n);
            }
            PLP => {
                self.p = (self.pop_byte()? & !FLAG_B) | FLAG_U;
            }

            CLC => self.set_flag(FLAG_C, false),
            SEC => self.set_flag(FLAG_C, true),
            CLD => self.set_flag(FLAG_D, false),
            SED => self.set_flag(FLAG_D, true),
            CLI => self.set_flag(FLAG_I, false),
            SEI => self.set_flag(FLAG_I, true),
            CLV => self.set_flag(FLAG_V, false),

            NOP => {}

            JMP => {
                next_pc = match insn.mode {
                    AddrMode::Absolute => insn.operand,
                    AddrMode::Indirect => {
                        // Open question (4.5/9) resolved: operand+1 without the
                        // historical same-page wrap bug.
                        let lo = self.memory.read(insn.operand)?;
                        let hi = self.memory.read(insn.operand.wrapping_add(1))?;
                        lo as u16 | (hi as u16) << 8
                    }
                    _ => unreachable!(),
                };
            }
            JSR => {
                let ret = pc.wrapping_add(2);
                self.push_word(ret)?;
                next_pc = insn.operand;
            }
            RTS => {
                next_pc = self.pop_word()?.wrapping_add(1);
            }
            RTI => {
                self.p = (self.pop_byte()? & !FLAG_B) | FLAG_U;
                next_pc = self.pop_word()?;
            }
            BRK => {
                let irq_vec = self.read_word(IRQ_VECTOR)?;
                if irq_vec == 0 {
                    halted = true;
                } else if !self.get_flag(FLAG_I) {
                    let ret = pc.wrapping_add(2);
                    self.push_word(ret)?;
                    let pushed = self.p | FLAG_B | FLAG_U;
                    self.push_byte(pushed)?;
                    self.set_flag(FLAG_I, true);
                    next_pc = irq_vec;
                }
            }

            BCC | BCS | BEQ | BMI | BNE | BPL | BVC | BVS => {
                let taken = match insn.op {
                    BCC => !self.get_flag(FLAG_C),
                    BCS => self.get_flag(FLAG_C),
                    BEQ => self.get_flag(FLAG_Z),
                    BMI => self.get_flag(FLAG_N),
                    BNE => !self.get_flag(FLAG_Z),
                    BPL => !self.get_flag(FLAG_N),
                    BVC => !self.get_flag(FLAG_V),
                    BVS => self.get_flag(FLAG_V),
                    _ => unreachable!(),
                };
                if taken {
                    let disp = insn.operand as u8 as i8;
                    let pc_after = pc.wrapping_add(insn.len as u16);
                    let target = pc_after.wrapping_add(disp as i16 as u16);
                    cycles += 1;
                    if pc_after & 0xFF00 != target & 0xFF00 {
                        cycles += 1;
                    }
                    next_pc = target;
                }
            }
        }

        self.cycle += cycles as u64;
        self.pc = next_pc;
        Ok(StepResult { cycles, halted })
    }

    /// Shared value-fetch for CPX/CPY, which unlike the LDA-family block above
    /// never carry a page-cross penalty (no indexed addressing modes exist for
    /// them in the official instruction set).
    fn operand_value(&mut self, insn: DecodedInsn) -> Result<u8, CpuFault<M::Fault>> {
        match insn.mode {
            AddrMode::Immediate => Ok(insn.operand as u8),
            _ => {
                let (addr, _) = self.address_of(insn.mode, insn.operand)?;
                Ok(self.memory.read(addr)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct NoFault;

    struct FlatMemory {
        bytes: [u8; 0x10000],
        dirty: [bool; 256],
    }

    impl FlatMemory {
        fn new() -> Self {
            Self { bytes: [0; 0x10000], dirty: [false; 256] }
        }

        fn load(&mut self, addr: u16, program: &[u8]) {
            for (i, b) in program.iter().enumerate() {
                self.bytes[addr as usize + i] = *b;
            }
        }
    }

    impl Memory6502 for FlatMemory {
        type Fault = NoFault;

        fn read(&mut self, addr: u16) -> Result<u8, NoFault> {
            Ok(self.bytes[addr as usize])
        }

        fn write(&mut self, addr: u16, value: u8) -> Result<(), NoFault> {
            self.bytes[addr as usize] = value;
            self.dirty[(addr >> 8) as usize] = true;
            Ok(())
        }

        fn has_side_effect(&self, _addr: u16) -> bool {
            false
        }

        fn is_dirty_page(&self, addr: u16) -> bool {
            self.dirty[(addr >> 8) as usize]
        }

        fn mark_page_clean(&mut self, addr: u16) {
            self.dirty[(addr >> 8) as usize] = false;
        }
    }

    fn cpu_at(pc: u16, program: &[u8]) -> Cpu6502<FlatMemory> {
        let mut mem = FlatMemory::new();
        mem.load(pc, program);
        let mut cpu = Cpu6502::new(mem);
        cpu.init(pc);
        cpu
    }

    #[test]
    fn init_sets_power_on_state() {
        let cpu = cpu_at(0x8000, &[]);
        assert_eq!(cpu.a, 0);
        assert_eq!(cpu.x, 0);
        assert_eq!(cpu.y, 0);
        assert_eq!(cpu.p, 0);
        assert_eq!(cpu.s, 0xFF);
        assert_eq!(cpu.pc, 0x8000);
        assert_eq!(cpu.cycle, 0);
    }

    #[test]
    fn lda_immediate_sets_flags() {
        let mut cpu = cpu_at(0x8000, &[0xA9, 0x00]);
        let r = cpu.step().unwrap();
        assert_eq!(cpu.a, 0);
        assert!(cpu.get_flag(FLAG_Z));
        assert!(!cpu.get_flag(FLAG_N));
        assert_eq!(r.cycles, 2);
        assert_eq!(cpu.pc, 0x8002);
    }

    #[test]
    fn binary_adc_sets_n_v() {
        let mut cpu = cpu_at(0x8000, &[0xA9, 0x50, 0x69, 0x50]);
        cpu.step().unwrap();
        cpu.step().unwrap();
        assert_eq!(cpu.a, 0xA0);
        assert!(cpu.get_flag(FLAG_N));
        assert!(cpu.get_flag(FLAG_V));
        assert!(!cpu.get_flag(FLAG_Z));
        assert!(!cpu.get_flag(FLAG_C));
    }

    #[test]
    fn binary_adc_overflow_from_positive() {
        let mut cpu = cpu_at(0x8000, &[0xA9, 0x7F, 0x69, 0x01]);
        cpu.step().unwrap();
        cpu.step().unwrap();
        assert_eq!(cpu.a, 0x80);
        assert!(cpu.get_flag(FLAG_N));
        assert!(cpu.get_flag(FLAG_V));
        assert!(!cpu.get_flag(FLAG_C));
    }

    #[test]
    fn decimal_adc_no_carry() {
        let mut cpu = cpu_at(0x8000, &[0xF8, 0xA9, 0x15, 0x69, 0x27]);
        cpu.step().unwrap(); // SED
        cpu.step().unwrap(); // LDA #$15
        cpu.step().unwrap(); // ADC #$27
        assert_eq!(cpu.a, 0x42);
        assert!(!cpu.get_flag(FLAG_C));
    }

    #[test]
    fn decimal_adc_with_carry() {
        let mut cpu = cpu_at(0x8000, &[0xF8, 0x38, 0xA9, 0x58, 0x69, 0x46]);
        cpu.step().unwrap(); // SED
        cpu.step().unwrap(); // SEC
        cpu.step().unwrap(); // LDA #$58
        cpu.step().unwrap(); // ADC #$46
        assert_eq!(cpu.a, 0x05);
        assert!(cpu.get_flag(FLAG_C));
    }

    #[test]
    fn binary_sbc_borrow_taken() {
        let mut cpu = cpu_at(0x8000, &[0x38, 0xA9, 0x50, 0xE9, 0xF0]);
        cpu.step().unwrap(); // SEC (C=1, no incoming borrow)
        cpu.step().unwrap(); // LDA #$50
        cpu.step().unwrap(); // SBC #$F0
        assert_eq!(cpu.a, 0x60);
        assert!(!cpu.get_flag(FLAG_C));
    }

    #[test]
    fn cmp_sets_flags_per_spec_example() {
        let mut cpu = cpu_at(0x8000, &[0xA9, 0x80, 0xC9, 0x01]);
        cpu.step().unwrap();
        cpu.step().unwrap();
        assert!(!cpu.get_flag(FLAG_N));
        assert!(!cpu.get_flag(FLAG_Z));
        assert!(cpu.get_flag(FLAG_C));
    }

    #[test]
    fn branch_pacing_taken_same_page_and_not_taken() {
        let mut cpu = cpu_at(0x8000, &[0xD0, 0x02]); // BNE +2, Z starts clear -> taken
        let r = cpu.step().unwrap();
        assert_eq!(r.cycles, 3);
        assert_eq!(cpu.pc, 0x8004);

        let mut cpu2 = cpu_at(0x8000, &[0xF8, 0xD0, 0x02]); // SED then BNE, force Z via CMP-equal instead
        cpu2.step().unwrap();
        // Craft a not-taken branch: set Z so BNE doesn't fire.
        cpu2.p |= FLAG_Z;
        let r2 = cpu2.step().unwrap();
        assert_eq!(r2.cycles, 2);
    }

    #[test]
    fn branch_pacing_taken_crosses_page() {
        // BNE at 0x80FE with +2 offset lands at 0x8102, crossing from page 0x81->0x81
        // Use an address right at the page boundary edge instead: PC 0x80FE, len 2 -> pc_after=0x8100, target with disp=+2 => 0x8102: pc_after page 0x81, target page 0x81 (no cross).
        // To force an actual cross, place branch so pc_after is 0x80FF+1=0x8100 and use negative disp crossing back.
        let mut cpu = cpu_at(0x80F0, &[0xD0, 0x20]); // pc_after = 0x80F2, target = 0x8112: same page (0x81? no: 0x80F2 page is 0x80, target 0x8112 page is 0x81) -> crosses
        let r = cpu.step().unwrap();
        assert_eq!(r.cycles, 4);
    }

    #[test]
    fn jsr_rts_round_trip_preserves_stack_pointer() {
        let mut cpu = cpu_at(0x8000, &[0x20, 0x00, 0x90]);
        // Place an RTS at the JSR target.
        cpu.memory.bytes[0x9000] = 0x60;
        let s_before = cpu.s;
        cpu.step().unwrap(); // JSR $9000
        assert_eq!(cpu.pc, 0x9000);
        cpu.step().unwrap(); // RTS
        assert_eq!(cpu.pc, 0x8003);
        assert_eq!(cpu.s, s_before);
    }

    #[test]
    fn invalid_opcode_at_pc_is_fatal() {
        let mut cpu = cpu_at(0x8000, &[0xFF]);
        let err = cpu.step().unwrap_err();
        matches!(err, CpuFault::InvalidOpcode { .. });
    }

    #[test]
    fn self_modifying_code_invalidates_cache() {
        let mut cpu = cpu_at(0x8000, &[0xA9, 0x01, 0x00]); // LDA #1; BRK
        cpu.step().unwrap(); // caches page 0x80
        // Overwrite the LDA operand through a write (marks page 0x80 dirty).
        cpu.memory.write(0x8000, 0xA9).unwrap();
        cpu.memory.write(0x8001, 0x05).unwrap();
        cpu.pc = 0x8000;
        cpu.step().unwrap();
        assert_eq!(cpu.a, 0x05);
    }

    #[test]
    fn brk_with_zero_irq_vector_halts_cleanly() {
        let mut cpu = cpu_at(0x8000, &[0x00]);
        let r = cpu.step().unwrap();
        assert!(r.halted);
    }

    #[test]
    fn jmp_indirect_does_not_emulate_page_wrap_bug() {
        let mut cpu = cpu_at(0x8000, &[0x6C, 0xFF, 0x80]); // JMP ($80FF)
        cpu.memory.bytes[0x80FF] = 0x34;
        cpu.memory.bytes[0x8100] = 0x12; // correct high byte location (no wrap)
        cpu.memory.bytes[0x8000] = 0x99; // would be read if the bug wrapped within page 0x80
        cpu.step().unwrap();
        assert_eq!(cpu.pc, 0x1234);
    }
}
