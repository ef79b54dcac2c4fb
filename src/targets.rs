//! Supported target devices
//!
//! The chip family is detected once per session by reading a magic value from
//! a register that is mapped on every supported chip. The family selects the
//! SPI register map and decides which bootloader operations are available:
//! the ESP8266 generation has no SPI-attach step, no baud-rate change and no
//! MD5 verification command.

use strum::{Display, EnumIter, EnumString, VariantNames};

use crate::error::Error;

/// Register whose reset value identifies the chip family
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

const ESP8266_MAGIC: u32 = 0xfff0_c101;
const ESP32_MAGIC: u32 = 0x00f0_1d83;

const ESP8266_SPI_REGISTERS: SpiRegisters = SpiRegisters {
    base: 0x6000_0200,
    usr_offset: 0x1c,
    usr1_offset: 0x20,
    usr2_offset: 0x24,
    w0_offset: 0x40,
    mosi_length_offset: None,
    miso_length_offset: None,
};

const ESP32_SPI_REGISTERS: SpiRegisters = SpiRegisters {
    base: 0x3ff4_2000,
    usr_offset: 0x1c,
    usr1_offset: 0x20,
    usr2_offset: 0x24,
    w0_offset: 0x80,
    mosi_length_offset: Some(0x28),
    miso_length_offset: Some(0x2c),
};

/// All supported devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString, VariantNames)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
pub enum Chip {
    /// ESP8266
    Esp8266,
    /// ESP32
    Esp32,
}

impl Chip {
    /// Identify the chip from the magic value read out of the detection
    /// register
    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        match magic {
            ESP8266_MAGIC => Ok(Chip::Esp8266),
            ESP32_MAGIC => Ok(Chip::Esp32),
            _ => Err(Error::ChipDetectError(magic)),
        }
    }

    /// SPI register addresses for the chip
    pub fn spi_registers(&self) -> SpiRegisters {
        match self {
            Chip::Esp8266 => ESP8266_SPI_REGISTERS,
            Chip::Esp32 => ESP32_SPI_REGISTERS,
        }
    }

    /// Does the bootloader of this chip take an explicit SPI-attach command?
    ///
    /// The ESP8266 generation instead arms its flash engine with an empty
    /// flash-begin command.
    pub fn supports_spi_attach(&self) -> bool {
        !matches!(self, Chip::Esp8266)
    }

    /// Does the bootloader accept SPI flash timing/addressing parameters?
    pub fn supports_spi_set_params(&self) -> bool {
        !matches!(self, Chip::Esp8266)
    }

    /// Does the bootloader support changing the link baud rate?
    pub fn supports_change_baud(&self) -> bool {
        !matches!(self, Chip::Esp8266)
    }

    /// Does the bootloader support computing an MD5 digest over flash?
    pub fn supports_md5_check(&self) -> bool {
        !matches!(self, Chip::Esp8266)
    }
}

/// SPI register addresses
///
/// Chips of the ESP8266 generation pack both transfer lengths into bit fields
/// of `usr1` and have no dedicated length registers, which is signalled here
/// by the length offsets being absent.
#[derive(Debug, Clone, Copy)]
pub struct SpiRegisters {
    base: u32,
    usr_offset: u32,
    usr1_offset: u32,
    usr2_offset: u32,
    w0_offset: u32,
    mosi_length_offset: Option<u32>,
    miso_length_offset: Option<u32>,
}

impl SpiRegisters {
    pub fn cmd(&self) -> u32 {
        self.base
    }

    pub fn usr(&self) -> u32 {
        self.base + self.usr_offset
    }

    pub fn usr1(&self) -> u32 {
        self.base + self.usr1_offset
    }

    pub fn usr2(&self) -> u32 {
        self.base + self.usr2_offset
    }

    pub fn w0(&self) -> u32 {
        self.base + self.w0_offset
    }

    pub fn mosi_length(&self) -> Option<u32> {
        self.mosi_length_offset.map(|offset| self.base + offset)
    }

    pub fn miso_length(&self) -> Option<u32> {
        self.miso_length_offset.map(|offset| self.base + offset)
    }
}
