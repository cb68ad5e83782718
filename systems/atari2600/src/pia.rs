//! PIA (6532 RIOT): 128 bytes of RAM plus a programmable interval timer and the
//! console switch/joystick input ports.
//!
//! Fire buttons (INPT4/INPT5) are TIA-side inputs on real hardware and are owned
//! by [`crate::tia::Tia`], not this module.

use serde::{Deserialize, Serialize};

/// Selectable timer prescaler intervals, in CPU cycles per internal tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum TimerInterval {
    One = 1,
    Eight = 8,
    SixtyFour = 64,
    OneOhTwoFour = 1024,
}

impl TimerInterval {
    fn from_register(addr: u16) -> Option<Self> {
        match addr & 0x1F {
            0x14 => Some(TimerInterval::One),
            0x15 => Some(TimerInterval::Eight),
            0x16 => Some(TimerInterval::SixtyFour),
            0x17 => Some(TimerInterval::OneOhTwoFour),
            _ => None,
        }
    }

    fn cycles(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoystickState {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pia {
    #[serde(with = "serde_arrays")]
    ram: [u8; 128],

    interval: TimerInterval,
    /// Cycles remaining until the next INTIM decrement.
    prescaler_cycles: u32,
    intim: u8,
    /// Set the instant INTIM underflows past zero; never cleared by a read.
    underflow_since_write: bool,
    /// Set the instant INTIM underflows past zero; cleared when INSTAT is read.
    underflow_since_read: bool,

    /// SWCHA-equivalent raw input, latched each frame by the system driver.
    joystick0: JoystickState,
    joystick1: JoystickState,
    /// Console switches byte (reset/select/color/difficulty); spec mandates the
    /// read value is always 0x3F regardless of what was written here.
    console_switches: u8,

    /// 0x0280/0x0281/0x0283 are accepted and stored but have no further effect;
    /// real hardware uses them for DRA/DDRA/DDRB-style port direction control,
    /// out of scope for this core.
    stub_registers: [u8; 3],
}

mod serde_arrays {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(arr: &[u8; 128], s: S) -> Result<S::Ok, S::Error> {
        arr.to_vec().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 128], D::Error> {
        let v = Vec::<u8>::deserialize(d)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("expected 128 bytes of PIA RAM"))
    }
}

impl Default for Pia {
    fn default() -> Self {
        Self::new()
    }
}

impl Pia {
    pub fn new() -> Self {
        Self {
            ram: [0; 128],
            interval: TimerInterval::One,
            prescaler_cycles: 0,
            intim: 0,
            underflow_since_write: false,
            underflow_since_read: false,
            joystick0: JoystickState::default(),
            joystick1: JoystickState::default(),
            console_switches: 0,
            stub_registers: [0; 3],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn set_joysticks(&mut self, p0: JoystickState, p1: JoystickState) {
        self.joystick0 = p0;
        self.joystick1 = p1;
    }

    pub fn set_console_switches(&mut self, value: u8) {
        self.console_switches = value;
    }

    /// Advance the timer by `cycles` CPU cycles. Called by the bus before any
    /// PIA register read, and once per executed instruction otherwise.
    pub fn tick(&mut self, cycles: u32) {
        for _ in 0..cycles {
            if self.prescaler_cycles == 0 {
                if self.intim == 0 {
                    self.underflow_since_write = true;
                    self.underflow_since_read = true;
                }
                self.intim = self.intim.wrapping_sub(1);
                self.prescaler_cycles = self.interval.cycles() - 1;
            } else {
                self.prescaler_cycles -= 1;
            }
        }
    }

    pub fn read(&mut self, addr: u16) -> u8 {
        let reg = addr & 0x03FF;
        match reg {
            0x0000..=0x007F => self.ram[(reg & 0x7F) as usize],
            0x0080..=0x00FF => self.ram[(reg & 0x7F) as usize],
            0x0100..=0x017F => self.ram[(reg & 0x7F) as usize],
            0x0180..=0x01FF => self.ram[(reg & 0x7F) as usize],
            0x0280..=0x029F => match reg & 0x0F {
                0x00 => self.joystick_byte(),
                0x01 => self.stub_registers[0],
                0x02 => 0x3F,
                0x03 => self.stub_registers[1],
                0x04 => self.intim,
                0x05 => {
                    let v = self.instat();
                    self.underflow_since_read = false;
                    v
                }
                _ => 0,
            },
            _ => 0,
        }
    }

    pub fn write(&mut self, addr: u16, value: u8) {
        let reg = addr & 0x03FF;
        match reg {
            0x0000..=0x007F => self.ram[(reg & 0x7F) as usize] = value,
            0x0080..=0x00FF => self.ram[(reg & 0x7F) as usize] = value,
            0x0100..=0x017F => self.ram[(reg & 0x7F) as usize] = value,
            0x0180..=0x01FF => self.ram[(reg & 0x7F) as usize] = value,
            0x0280..=0x029F => {
                if let Some(interval) = TimerInterval::from_register(reg) {
                    self.interval = interval;
                    self.intim = value;
                    // The write consumes the first tick immediately: the interval
                    // countdown already has one cycle "used up" by the write itself.
                    self.prescaler_cycles = interval.cycles() - 1;
                    self.underflow_since_write = false;
                    self.underflow_since_read = false;
                    return;
                }
                match reg & 0x0F {
                    0x00 => self.stub_registers[0] = value,
                    0x01 => self.stub_registers[1] = value,
                    0x03 => self.stub_registers[2] = value,
                    _ => {}
                }
            }
            _ => {}
        }
    }

    fn instat(&self) -> u8 {
        let mut v = 0u8;
        if self.underflow_since_write {
            v |= 0x80;
        }
        if self.underflow_since_read {
            v |= 0x40;
        }
        v
    }

    fn joystick_byte(&self) -> u8 {
        // SWCHA layout: bits 7-4 = player 0 (right, left, down, up), bits 3-0 =
        // player 1, active-low (1 = released).
        let mut v = 0xFFu8;
        if self.joystick0.right {
            v &= !0x80;
        }
        if self.joystick0.left {
            v &= !0x40;
        }
        if self.joystick0.down {
            v &= !0x20;
        }
        if self.joystick0.up {
            v &= !0x10;
        }
        if self.joystick1.right {
            v &= !0x08;
        }
        if self.joystick1.left {
            v &= !0x04;
        }
        if self.joystick1.down {
            v &= !0x02;
        }
        if self.joystick1.up {
            v &= !0x01;
        }
        v
    }
}
