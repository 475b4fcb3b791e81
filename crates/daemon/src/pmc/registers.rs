//! PMC register map
//!
//! The register set is closed: every register the firmware exposes is listed
//! here with its access mode and value encoding. Hex values are written
//! uppercase and parsed case-insensitively; the firmware itself replies
//! lowercase.

use super::PmcError;
use std::fmt;

/// Maximum characters accepted by the LCD line registers.
pub const LCD_LINE_WIDTH: usize = 16;

/// Register access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
    /// Listed but never driven over the link (`UPD` enters the firmware's
    /// interactive update menu and would wedge the protocol).
    None,
}

impl Access {
    pub fn readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// Value encoding on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// One byte, two hex digits
    HexU8,
    /// Two bytes, four hex digits
    HexU16,
    /// Free text, LCD charset
    Text,
}

/// A decoded register value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Byte(u8),
    Word(u16),
    Text(String),
}

impl Value {
    pub fn as_byte(&self) -> Option<u8> {
        match self {
            Value::Byte(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_word(&self) -> Option<u16> {
        match self {
            Value::Word(w) => Some(*w),
            Value::Byte(b) => Some(u16::from(*b)),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Byte(b) => write!(f, "{:02X}", b),
            Value::Word(w) => write!(f, "{:04X}", w),
            Value::Text(t) => f.write_str(t),
        }
    }
}

/// One register descriptor.
#[derive(Debug)]
pub struct Register {
    pub code: &'static str,
    pub access: Access,
    pub encoding: Encoding,
}

impl Register {
    const fn new(code: &'static str, access: Access, encoding: Encoding) -> Self {
        Self {
            code,
            access,
            encoding,
        }
    }
}

/// Firmware version string
pub static VER: Register = Register::new("VER", Access::Read, Encoding::Text);
/// Config bits; bit 0 = automatic bay power
pub static CFG: Register = Register::new("CFG", Access::ReadWrite, Encoding::HexU8);
/// Power-up status; bits 1,2 = power socket 2,1
pub static STA: Register = Register::new("STA", Access::Read, Encoding::HexU8);
/// Interrupt status; read clears latched bits on the PMC
pub static ISR: Register = Register::new("ISR", Access::Read, Encoding::HexU8);
/// Interrupt mask
pub static IMR: Register = Register::new("IMR", Access::ReadWrite, Encoding::HexU8);
/// Echo register; a write triggers an ALERT with ISR bit 7 set
pub static ECH: Register = Register::new("ECH", Access::ReadWrite, Encoding::HexU8);
/// Interactive firmware update menu; never driven
pub static UPD: Register = Register::new("UPD", Access::None, Encoding::Text);
/// LCD backlight percent
pub static BKL: Register = Register::new("BKL", Access::ReadWrite, Encoding::HexU8);
/// LCD line 1 text
pub static LN1: Register = Register::new("LN1", Access::Write, Encoding::Text);
/// LCD line 2 text
pub static LN2: Register = Register::new("LN2", Access::Write, Encoding::Text);
/// Board temperature, degrees Celsius
pub static TMP: Register = Register::new("TMP", Access::Read, Encoding::HexU8);
/// Fan duty cycle percent; the firmware rejects values above 99
pub static FAN: Register = Register::new("FAN", Access::ReadWrite, Encoding::HexU8);
/// Fan speed, RPM
pub static RPM: Register = Register::new("RPM", Access::Read, Encoding::HexU16);
/// Fan tacho pulses per second
pub static TAC: Register = Register::new("TAC", Access::Read, Encoding::HexU16);
/// Steady LED bitmap
pub static LED: Register = Register::new("LED", Access::ReadWrite, Encoding::HexU8);
/// Blinking LED bitmap
pub static BLK: Register = Register::new("BLK", Access::ReadWrite, Encoding::HexU8);
/// Pulsing LED bitmap, bit 0 only
pub static PLS: Register = Register::new("PLS", Access::ReadWrite, Encoding::HexU8);
/// Drive presence bitmap (active-low); bit 4 indicates a 4-bay chassis
pub static DP0: Register = Register::new("DP0", Access::Read, Encoding::HexU8);
/// Drive enable (low nibble) and alert LED (high nibble) bitmap
pub static DE0: Register = Register::new("DE0", Access::ReadWrite, Encoding::HexU8);
/// Set bits in DE0
pub static DLS: Register = Register::new("DLS", Access::Write, Encoding::HexU8);
/// Clear bits in DE0
pub static DLC: Register = Register::new("DLC", Access::Write, Encoding::HexU8);
/// Alert LED blink bitmap
pub static DLB: Register = Register::new("DLB", Access::ReadWrite, Encoding::HexU8);

/// All known registers.
pub static REGISTERS: [&Register; 22] = [
    &VER, &CFG, &STA, &ISR, &IMR, &ECH, &UPD, &BKL, &LN1, &LN2, &TMP, &FAN, &RPM, &TAC, &LED,
    &BLK, &PLS, &DP0, &DE0, &DLS, &DLC, &DLB,
];

/// Look up a register descriptor by its three-letter code, case-insensitive.
pub fn lookup(code: &str) -> Option<&'static Register> {
    REGISTERS
        .iter()
        .find(|r| r.code.eq_ignore_ascii_case(code.trim()))
        .copied()
}

/// Encode a value for the wire according to the register's encoding.
pub fn encode(reg: &Register, value: &Value) -> Result<String, PmcError> {
    match (reg.encoding, value) {
        (Encoding::HexU8, Value::Byte(b)) => Ok(format!("{:02X}", b)),
        (Encoding::HexU16, Value::Word(w)) => Ok(format!("{:04X}", w)),
        (Encoding::Text, Value::Text(t)) => {
            if t.bytes().any(|b| !(0x20..=0x7e).contains(&b)) {
                return Err(PmcError::Unsupported(format!(
                    "{}: text value must be printable ASCII",
                    reg.code
                )));
            }
            let mut t = t.clone();
            t.truncate(LCD_LINE_WIDTH);
            Ok(t)
        }
        _ => Err(PmcError::Unsupported(format!(
            "{}: value does not match register encoding",
            reg.code
        ))),
    }
}

/// Decode a wire value according to the register's encoding.
pub fn decode(reg: &Register, raw: &str) -> Result<Value, PmcError> {
    match reg.encoding {
        Encoding::HexU8 => {
            let raw = raw.trim();
            if raw.is_empty() || raw.len() > 2 {
                return Err(PmcError::FrameMalformed(format!(
                    "{}: expected 1-2 hex digits, got {:?}",
                    reg.code, raw
                )));
            }
            u8::from_str_radix(raw, 16)
                .map(Value::Byte)
                .map_err(|_| PmcError::FrameMalformed(format!("{}: bad hex {:?}", reg.code, raw)))
        }
        Encoding::HexU16 => {
            let raw = raw.trim();
            if raw.is_empty() || raw.len() > 4 {
                return Err(PmcError::FrameMalformed(format!(
                    "{}: expected 1-4 hex digits, got {:?}",
                    reg.code, raw
                )));
            }
            u16::from_str_radix(raw, 16)
                .map(Value::Word)
                .map_err(|_| PmcError::FrameMalformed(format!("{}: bad hex {:?}", reg.code, raw)))
        }
        Encoding::Text => Ok(Value::Text(raw.to_string())),
    }
}
