//! TIA (Television Interface Adapter): video generation and collision detection.
//!
//! The TIA free-runs on color clocks while the CPU issues instructions; the bus
//! drives it via [`Tia::catch_up`] after every CPU step rather than the TIA
//! ticking itself. Register writes that are beam-position-sensitive (the RESxx
//! strobes) go through a single-slot deferred store so they latch the beam
//! position at the moment the *next* catch-up begins, not at the moment the
//! bus call happened to arrive.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use emu_core::logging::{LogCategory, LogLevel};
use emu_core::log;

pub const SCREEN_WIDTH: usize = 160;
pub const SCREEN_HEIGHT: usize = 192;

const COLOR_CLOCKS_PER_SCANLINE: u16 = 228;
const HBLANK_CLOCKS: u16 = 68;
const SCANLINES_PER_FRAME: u16 = 262;
const FIRST_VISIBLE_SCANLINE: u16 = 40;
const LAST_VISIBLE_SCANLINE: u16 = FIRST_VISIBLE_SCANLINE + SCREEN_HEIGHT as u16 - 1;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TiaFault {
    #[error("VSYNC write had invalid stray bits set: {0:#04x}")]
    InvalidVsync(u8),
    #[error("VBLANK write had invalid stray bits set: {0:#04x}")]
    InvalidVblank(u8),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct PlayerState {
    grp: u8,
    grp_shadow: u8,
    vdel: bool,
    reflect: bool,
    nusiz: u8,
    color: u8,
    pos: u8,
}

impl PlayerState {
    fn effective_grp(&self) -> u8 {
        if self.vdel {
            self.grp_shadow
        } else {
            self.grp
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct MissileState {
    enabled: bool,
    nusiz: u8,
    pos: u8,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct BallState {
    enabled: bool,
    enabled_shadow: bool,
    vdel: bool,
    pos: u8,
}

impl BallState {
    fn effective_enabled(&self) -> bool {
        if self.vdel {
            self.enabled_shadow
        } else {
            self.enabled
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct AudioChannel {
    control: u8,
    freq: u8,
    volume: u8,
}

/// The 15 pairwise collision latches, packed as individual bools for clarity
/// (they are read back through 7 two-bit ports plus one one-bit port).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Collisions {
    m0_p1: bool,
    m0_p0: bool,
    m1_p0: bool,
    m1_p1: bool,
    p0_pf: bool,
    p0_bl: bool,
    p1_pf: bool,
    p1_bl: bool,
    m0_pf: bool,
    m0_bl: bool,
    m1_pf: bool,
    m1_bl: bool,
    bl_pf: bool,
    p0_p1: bool,
    m0_m1: bool,
}

impl Collisions {
    fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PendingWrite {
    addr: u16,
    value: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tia {
    vsync: bool,
    vblank: bool,

    p0: PlayerState,
    p1: PlayerState,
    m0: MissileState,
    m1: MissileState,
    ball: BallState,

    colubk: u8,
    colupf: u8,
    ctrlpf: u8,
    pf0: u8,
    pf1: u8,
    pf2: u8,

    hmp0: i8,
    hmp1: i8,
    hmm0: i8,
    hmm1: i8,
    hmbl: i8,

    audio: [AudioChannel; 2],

    collisions: Collisions,

    /// Fire-button/paddle-trigger input lines (INPT4/INPT5); only the digital
    /// fire buttons are modeled, per the paddle-controller non-goal.
    input4: bool,
    input5: bool,

    pending: Option<PendingWrite>,

    color_clock: u16,
    scanline: u16,
    #[serde(skip)]
    frame_ready: bool,
    #[serde(skip, default = "default_frame")]
    frame: Vec<u32>,
}

fn default_frame() -> Vec<u32> {
    vec![0; SCREEN_WIDTH * SCREEN_HEIGHT]
}

impl Default for Tia {
    fn default() -> Self {
        Self::new()
    }
}

impl Tia {
    pub fn new() -> Self {
        Self {
            vsync: false,
            vblank: false,
            p0: PlayerState::default(),
            p1: PlayerState::default(),
            m0: MissileState::default(),
            m1: MissileState::default(),
            ball: BallState::default(),
            colubk: 0,
            colupf: 0,
            ctrlpf: 0,
            pf0: 0,
            pf1: 0,
            pf2: 0,
            hmp0: 0,
            hmp1: 0,
            hmm0: 0,
            hmm1: 0,
            hmbl: 0,
            audio: [AudioChannel::default(); 2],
            collisions: Collisions::default(),
            input4: false,
            input5: false,
            pending: None,
            color_clock: 0,
            scanline: 0,
            frame_ready: false,
            frame: vec![0; SCREEN_WIDTH * SCREEN_HEIGHT],
        }
    }

    pub fn reset(&mut self) {
        let frame = std::mem::take(&mut self.frame);
        *self = Self::new();
        self.frame = frame;
    }

    pub fn set_inputs(&mut self, fire0: bool, fire1: bool) {
        self.input4 = fire0;
        self.input5 = fire1;
    }

    pub fn frame_ready(&self) -> bool {
        self.frame_ready
    }

    pub fn take_frame(&mut self) -> Vec<u32> {
        self.frame_ready = false;
        self.frame.clone()
    }

    pub fn scanline(&self) -> u16 {
        self.scanline
    }

    /// CPU cycles needed to advance the beam to the start of the next
    /// scanline, used by WSYNC.
    pub fn cycles_to_scanline_boundary(&self) -> u32 {
        let remaining_clocks = (COLOR_CLOCKS_PER_SCANLINE - self.color_clock) as u32;
        remaining_clocks.div_ceil(3)
    }

    /// Called by the bus for every TIA-window address, immediately for
    /// registers with no beam-position sensitivity, or staged into the
    /// single pending slot for the RESxx strobes.
    pub fn write(&mut self, addr: u16, value: u8) -> Result<(), TiaFault> {
        let reg = addr & 0x3F;
        match reg {
            0x10 | 0x11 | 0x12 | 0x13 | 0x14 => {
                self.pending = Some(PendingWrite { addr: reg, value });
                Ok(())
            }
            _ => self.commit_write(reg, value),
        }
    }

    fn commit_write(&mut self, reg: u16, value: u8) -> Result<(), TiaFault> {
        match reg {
            0x00 => {
                if value & !0x02 != 0 {
                    return Err(TiaFault::InvalidVsync(value));
                }
                let was_on = self.vsync;
                self.vsync = value & 0x02 != 0;
                if was_on && !self.vsync {
                    self.scanline = 0;
                    self.color_clock = 0;
                    self.frame_ready = true;
                }
            }
            0x01 => {
                if value & !0xC2 != 0 {
                    return Err(TiaFault::InvalidVblank(value));
                }
                self.vblank = value & 0x02 != 0;
            }
            0x02 | 0x03 => {} // WSYNC/RSYNC: handled by the bus, not the TIA.
            0x04 => self.m0.nusiz = value,
            0x05 => self.m1.nusiz = value,
            0x06 => self.p0.color = value,
            0x07 => self.p1.color = value,
            0x08 => self.colupf = value,
            0x09 => self.colubk = value,
            0x0A => self.ctrlpf = value,
            0x0B => self.p0.reflect = value & 0x08 != 0,
            0x0C => self.p1.reflect = value & 0x08 != 0,
            0x0D => self.pf0 = value,
            0x0E => self.pf1 = value,
            0x0F => self.pf2 = value,
            0x15 => self.audio[0].control = value,
            0x16 => self.audio[1].control = value,
            0x17 => self.audio[0].freq = value,
            0x18 => self.audio[1].freq = value,
            0x19 => self.audio[0].volume = value,
            0x1A => self.audio[1].volume = value,
            0x1B => {
                self.p1.grp_shadow = self.p1.grp;
                self.p0.grp = value;
            }
            0x1C => {
                self.p0.grp_shadow = self.p0.grp;
                self.ball.enabled_shadow = self.ball.enabled;
                self.p1.grp = value;
            }
            0x1D => self.m0.enabled = value & 0x02 != 0,
            0x1E => self.m1.enabled = value & 0x02 != 0,
            0x1F => self.ball.enabled = value & 0x02 != 0,
            0x20 => self.hmp0 = Self::decode_motion(value),
            0x21 => self.hmp1 = Self::decode_motion(value),
            0x22 => self.hmm0 = Self::decode_motion(value),
            0x23 => self.hmm1 = Self::decode_motion(value),
            0x24 => self.hmbl = Self::decode_motion(value),
            0x25 => self.p0.vdel = value & 0x01 != 0,
            0x26 => self.p1.vdel = value & 0x01 != 0,
            0x27 => self.ball.vdel = value & 0x01 != 0,
            0x28 | 0x29 => {
                // RESMP0/RESMP1: accepted, no modeled effect (spec leaves
                // missile-locked-to-player recentering undefined).
                log!(
                    LogCategory::Stubs,
                    LogLevel::Debug,
                    "TIA: RESMP{} write ignored (stub)",
                    if reg == 0x28 { 0 } else { 1 }
                );
            }
            0x2A => self.apply_hmove(),
            0x2B => {
                self.hmp0 = 0;
                self.hmp1 = 0;
                self.hmm0 = 0;
                self.hmm1 = 0;
                self.hmbl = 0;
            }
            0x2C => self.collisions.clear(),
            _ => {}
        }
        Ok(())
    }

    /// RESxx latches the current visible-column position of the beam, offset
    /// by the fixed hardware fudge factor for the object class.
    fn commit_pending(&mut self) {
        let Some(PendingWrite { addr, value: _ }) = self.pending.take() else {
            return;
        };
        let column = self.beam_column();
        match addr {
            0x10 => self.p0.pos = Self::reset_position(column, 3, 5),
            0x11 => self.p1.pos = Self::reset_position(column, 3, 5),
            0x12 => self.m0.pos = Self::reset_position(column, 2, 4),
            0x13 => self.m1.pos = Self::reset_position(column, 2, 4),
            0x14 => self.ball.pos = Self::reset_position(column, 2, 4),
            _ => {}
        }
    }

    fn reset_position(column: i32, fudge: i32, offset: i32) -> u8 {
        let base = if column < 0 { fudge } else { column };
        (base + offset).rem_euclid(SCREEN_WIDTH as i32) as u8
    }

    /// Current visible column of the beam (0..160, may be negative/out of
    /// range during HBLANK; RESxx during HBLANK still latches per real
    /// hardware, hence the signed math in `reset_position`).
    fn beam_column(&self) -> i32 {
        self.color_clock as i32 - HBLANK_CLOCKS as i32
    }

    fn decode_motion(value: u8) -> i8 {
        // Upper nibble is a signed 4-bit motion value; negate then scale to
        // pixels per the documented "HMxx is negated, /16" hardware behavior.
        let signed = (value as i8) >> 4;
        signed.wrapping_neg()
    }

    fn apply_hmove(&mut self) {
        self.p0.pos = self.move_pos(self.p0.pos, self.hmp0);
        self.p1.pos = self.move_pos(self.p1.pos, self.hmp1);
        self.m0.pos = self.move_pos(self.m0.pos, self.hmm0);
        self.m1.pos = self.move_pos(self.m1.pos, self.hmm1);
        self.ball.pos = self.move_pos(self.ball.pos, self.hmbl);
    }

    fn move_pos(&self, pos: u8, motion: i8) -> u8 {
        (pos as i32 + motion as i32).rem_euclid(SCREEN_WIDTH as i32) as u8
    }

    pub fn read(&mut self, addr: u16) -> u8 {
        let reg = addr & 0x3F;
        match reg {
            0x00 => 0x02 | (self.collisions.m0_p1 as u8) << 7 | (self.collisions.m0_p0 as u8) << 6,
            0x01 => 0x02 | (self.collisions.m1_p0 as u8) << 7 | (self.collisions.m1_p1 as u8) << 6,
            0x02 => 0x02 | (self.collisions.p0_pf as u8) << 7 | (self.collisions.p0_bl as u8) << 6,
            0x03 => 0x02 | (self.collisions.p1_pf as u8) << 7 | (self.collisions.p1_bl as u8) << 6,
            0x04 => 0x02 | (self.collisions.m0_pf as u8) << 7 | (self.collisions.m0_bl as u8) << 6,
            0x05 => 0x02 | (self.collisions.m1_pf as u8) << 7 | (self.collisions.m1_bl as u8) << 6,
            0x06 => 0x02 | (self.collisions.bl_pf as u8) << 7,
            0x07 => 0x02 | (self.collisions.p0_p1 as u8) << 7 | (self.collisions.m0_m1 as u8) << 6,
            0x08..=0x0B => 0, // INPT0-3: paddles, out of scope; read as centered/low.
            0x0C => (!self.input4 as u8) << 7,
            0x0D => (!self.input5 as u8) << 7,
            _ => 0,
        }
    }

    /// Advance `cpu_cycles` CPU cycles' worth of color clocks (3 per cycle),
    /// committing any pending RESxx write at the very end, once the beam has
    /// reached the position the write is meant to land on.
    pub fn catch_up(&mut self, cpu_cycles: u32) {
        for _ in 0..(cpu_cycles * 3) {
            self.tick_color_clock();
        }
        self.commit_pending();
    }

    fn tick_color_clock(&mut self) {
        if self.color_clock >= HBLANK_CLOCKS
            && self.scanline >= FIRST_VISIBLE_SCANLINE
            && self.scanline <= LAST_VISIBLE_SCANLINE
            && !self.vblank
        {
            let row = (self.scanline - FIRST_VISIBLE_SCANLINE) as usize;
            let col = (self.color_clock - HBLANK_CLOCKS) as usize;
            let color = self.pixel_color(col as u8);
            self.frame[row * SCREEN_WIDTH + col] = Self::ntsc_to_rgb(color);
        }

        self.color_clock += 1;
        if self.color_clock >= COLOR_CLOCKS_PER_SCANLINE {
            self.color_clock = 0;
            self.scanline = (self.scanline + 1) % SCANLINES_PER_FRAME;
        }
    }

    fn pixel_color(&mut self, column: u8) -> u8 {
        let pf = self.playfield_bit(column);
        let p0 = self.player_bit(&self.p0, column);
        let p1 = self.player_bit(&self.p1, column);
        let m0 = Self::object_bit(self.m0.pos, self.missile_width(self.m0.nusiz), column)
            && self.m0.enabled;
        let m1 = Self::object_bit(self.m1.pos, self.missile_width(self.m1.nusiz), column)
            && self.m1.enabled;
        let bl = Self::object_bit(self.ball.pos, self.ball_width(), column)
            && self.ball.effective_enabled();

        self.update_collisions(p0, p1, m0, m1, bl, pf);

        let score_mode = self.ctrlpf & 0x02 != 0;
        let priority = self.ctrlpf & 0x04 != 0;

        // Score-mode color substitution (left/right playfield halves take the
        // matching player's color) is not implemented: the reference this
        // core was distilled from leaves it as an open gap too.
        let _ = score_mode;

        if priority {
            if pf || bl {
                self.colupf
            } else if p0 || m0 {
                self.p0.color
            } else if p1 || m1 {
                self.p1.color
            } else {
                self.colubk
            }
        } else if p0 || m0 {
            self.p0.color
        } else if p1 || m1 {
            self.p1.color
        } else if pf || bl {
            self.colupf
        } else {
            self.colubk
        }
    }

    fn update_collisions(&mut self, p0: bool, p1: bool, m0: bool, m1: bool, bl: bool, pf: bool) {
        let c = &mut self.collisions;
        c.m0_p1 |= m0 && p1;
        c.m0_p0 |= m0 && p0;
        c.m1_p0 |= m1 && p0;
        c.m1_p1 |= m1 && p1;
        c.p0_pf |= p0 && pf;
        c.p0_bl |= p0 && bl;
        c.p1_pf |= p1 && pf;
        c.p1_bl |= p1 && bl;
        c.m0_pf |= m0 && pf;
        c.m0_bl |= m0 && bl;
        c.m1_pf |= m1 && pf;
        c.m1_bl |= m1 && bl;
        c.bl_pf |= bl && pf;
        c.p0_p1 |= p0 && p1;
        c.m0_m1 |= m0 && m1;
    }

    fn playfield_bit(&self, column: u8) -> bool {
        let half_width = (SCREEN_WIDTH / 2) as u8;
        let (idx_col, mirrored_half) = if column < half_width {
            (column, false)
        } else {
            (column - half_width, self.ctrlpf & 0x01 != 0)
        };
        let mut bit_index = idx_col / 4;
        if mirrored_half {
            bit_index = 19 - bit_index;
        }
        Self::playfield_bit_at(self.pf0, self.pf1, self.pf2, bit_index)
    }

    fn playfield_bit_at(pf0: u8, pf1: u8, pf2: u8, i: u8) -> bool {
        match i {
            0..=3 => (pf0 >> (4 + i)) & 1 != 0,
            4..=11 => (pf1 >> (11 - i)) & 1 != 0,
            12..=19 => (pf2 >> (i - 12)) & 1 != 0,
            _ => false,
        }
    }

    fn player_bit(&self, player: &PlayerState, column: u8) -> bool {
        let grp = player.effective_grp();
        if grp == 0 {
            return false;
        }
        for offset in Self::nusiz_copy_offsets(player.nusiz) {
            let width = Self::nusiz_width_scale(player.nusiz);
            if let Some(pixel) = Self::sprite_pixel(player.pos, offset, width, column) {
                let bit_index = if player.reflect { pixel } else { 7 - pixel };
                if grp & (1 << bit_index) != 0 {
                    return true;
                }
            }
        }
        false
    }

    fn sprite_pixel(pos: u8, offset: u8, width: u8, column: u8) -> Option<u8> {
        let start = pos.wrapping_add(offset) as i32;
        let span = 8i32 * width as i32;
        let rel = (column as i32 - start).rem_euclid(SCREEN_WIDTH as i32);
        if rel < span {
            Some((rel / width as i32) as u8)
        } else {
            None
        }
    }

    fn object_bit(pos: u8, width: u8, column: u8) -> bool {
        let rel = (column as i32 - pos as i32).rem_euclid(SCREEN_WIDTH as i32);
        rel < width as i32
    }

    fn missile_width(&self, nusiz: u8) -> u8 {
        1 << ((nusiz >> 4) & 0x03)
    }

    fn ball_width(&self) -> u8 {
        1 << ((self.ctrlpf >> 4) & 0x03)
    }

    fn nusiz_copy_offsets(nusiz: u8) -> &'static [u8] {
        match nusiz & 0x07 {
            1 => &[0, 16],
            2 => &[0, 32],
            3 => &[0, 16, 32],
            4 => &[0, 64],
            6 => &[0, 32, 64],
            _ => &[0],
        }
    }

    fn nusiz_width_scale(nusiz: u8) -> u8 {
        match nusiz & 0x07 {
            5 => 2,
            7 => 4,
            _ => 1,
        }
    }

    /// A deliberately simplified NTSC-ish palette: this core does not model
    /// the full 128-entry hue/luma chroma table, only a usable approximation
    /// (PAL/SECAM palettes are out of scope entirely).
    fn ntsc_to_rgb(value: u8) -> u32 {
        let luma = (value & 0x0F) as u32;
        let hue = (value >> 4) as u32;
        let brightness = 20 + luma * 15;
        let r = brightness.saturating_add(hue.wrapping_mul(7) % 64);
        let g = brightness.saturating_add((hue.wrapping_mul(11) + 32) % 64);
        let b = brightness.saturating_add((hue.wrapping_mul(13) + 64) % 64);
        (r.min(255) << 16) | (g.min(255) << 8) | b.min(255)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsync_falling_edge_resets_beam_and_marks_frame_ready() {
        let mut tia = Tia::new();
        tia.write(0x00, 0x02).unwrap();
        tia.catch_up(10);
        tia.write(0x00, 0x00).unwrap();
        assert!(tia.frame_ready());
        assert_eq!(tia.scanline(), 0);
    }

    #[test]
    fn vsync_rejects_stray_bits() {
        let mut tia = Tia::new();
        assert!(tia.write(0x00, 0x01).is_err());
    }

    #[test]
    fn vblank_rejects_stray_bits() {
        let mut tia = Tia::new();
        assert!(tia.write(0x01, 0x20).is_err());
    }

    #[test]
    fn cxclr_clears_all_latches() {
        let mut tia = Tia::new();
        tia.collisions.p0_p1 = true;
        tia.write(0x2C, 0).unwrap();
        assert!(!tia.collisions.p0_p1);
    }

    #[test]
    fn resp0_latches_beam_position_with_fudge() {
        let mut tia = Tia::new();
        tia.color_clock = HBLANK_CLOCKS + 10;
        tia.write(0x10, 0).unwrap();
        // catch_up ticks 3 color clocks (1 CPU cycle) before committing the
        // pending write, so the beam has moved on to column 81-68=13 by the
        // time RESP0 actually lands: 13 + 5 (post-hblank offset) = 18.
        tia.catch_up(1);
        assert_eq!(tia.p0.pos, 18);
    }

    #[test]
    fn resp0_during_hblank_clamps_to_fudge_then_adds_offset() {
        let mut tia = Tia::new();
        tia.color_clock = 0;
        tia.write(0x10, 0).unwrap();
        // Still within hblank (column negative) when the write commits, so
        // the raw column is clamped to the player fudge of 3, then +5: 8.
        tia.catch_up(1);
        assert_eq!(tia.p0.pos, 8);
    }

    #[test]
    fn hmove_shifts_all_objects() {
        let mut tia = Tia::new();
        tia.p0.pos = 50;
        tia.write(0x20, 0x10).unwrap(); // HMP0 = -1 after decode (nibble 1 -> -1)
        tia.write(0x2A, 0).unwrap();
        assert_eq!(tia.p0.pos, 49);
    }

    #[test]
    fn vdel_promotes_shadow_buffer_on_next_write() {
        let mut tia = Tia::new();
        tia.write(0x25, 1).unwrap(); // VDELP0
        tia.write(0x1B, 0xAA).unwrap(); // GRP0 = 0xAA, shadow still 0
        assert_eq!(tia.p0.effective_grp(), 0);
        tia.write(0x1C, 0x00).unwrap(); // GRP1 write promotes p0's shadow
        assert_eq!(tia.p0.effective_grp(), 0xAA);
    }

    #[test]
    fn input_ports_reflect_fire_buttons() {
        let mut tia = Tia::new();
        tia.set_inputs(true, false);
        assert_eq!(tia.read(0x0C) & 0x80, 0);
        assert_eq!(tia.read(0x0D) & 0x80, 0x80);
    }

    #[test]
    fn playfield_bit_matches_hardware_bit_ordering() {
        // PF0 bit4 set -> leftmost playfield column of the left half.
        assert!(Tia::playfield_bit_at(0x10, 0, 0, 0));
        assert!(!Tia::playfield_bit_at(0x10, 0, 0, 1));
        // PF1 bit7 (MSB) maps to column 4 (reversed order).
        assert!(Tia::playfield_bit_at(0, 0x80, 0, 4));
        // PF2 bit0 maps to column 12 (normal order).
        assert!(Tia::playfield_bit_at(0, 0, 0x01, 12));
    }
}
