//! The command transport consumed by the flasher core
//!
//! Everything below the [Transport] trait is considered external to the
//! protocol client: framing, link I/O and timers live in the implementation
//! (see [Connection](crate::Connection) for the serial one), while the core
//! only issues typed request/response commands and the out-of-band controls.

use std::{thread::sleep, time::Duration};

use crate::{error::Error, targets::Chip};

/// Request/response command API of the ROM bootloader, plus the out-of-band
/// link controls.
///
/// Every command call performs exactly one request/response round trip bound
/// by the most recently armed timeout and may fail with a transport error or
/// timeout. Implementations must not retry on their own; retry policy belongs
/// to the caller.
pub trait Transport {
    /// Perform a single sync handshake attempt
    fn sync(&mut self) -> Result<(), Error>;

    /// Detect the chip family of the connected target
    fn detect_chip(&mut self) -> Result<Chip, Error>;

    /// Read the SPI pin configuration word used by the SPI-attach command
    fn read_spi_config(&mut self, chip: Chip) -> Result<u32, Error>;

    /// Attach the SPI flash with the given pin configuration
    fn spi_attach(&mut self, config: u32) -> Result<(), Error>;

    /// Push the timing/addressing parameters for a flash of `total_size`
    /// bytes
    fn spi_set_params(&mut self, total_size: u32) -> Result<(), Error>;

    /// Erase `erase_size` bytes at `offset` and start a flash session of
    /// `blocks` blocks of `block_size` bytes
    fn flash_begin(
        &mut self,
        offset: u32,
        erase_size: u32,
        block_size: u32,
        blocks: u32,
    ) -> Result<(), Error>;

    /// Program one block of data; `sequence` numbers blocks from zero in
    /// write order
    fn flash_data(&mut self, data: &[u8], sequence: u32) -> Result<(), Error>;

    /// End the flash session; `stay_in_bootloader` suppresses the bootloader
    /// exit
    fn flash_end(&mut self, stay_in_bootloader: bool) -> Result<(), Error>;

    /// Read a 32-bit register
    fn read_register(&mut self, address: u32) -> Result<u32, Error>;

    /// Write a 32-bit register
    fn write_register(
        &mut self,
        address: u32,
        value: u32,
        mask: u32,
        delay_us: u32,
    ) -> Result<(), Error>;

    /// Switch the link to a new baud rate
    fn change_baud(&mut self, new_baud: u32) -> Result<(), Error>;

    /// Request the target's MD5 digest over a flash region, returned as 32
    /// ASCII hex bytes
    fn flash_md5(&mut self, offset: u32, size: u32) -> Result<[u8; 32], Error>;

    /// Put the target into its ROM bootloader
    fn enter_bootloader(&mut self) -> Result<(), Error>;

    /// Hard-reset the target into whatever is on flash
    fn reset_target(&mut self) -> Result<(), Error>;

    /// Arm the timeout bounding the next blocking call
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error>;

    /// Stall the calling context for the given duration
    fn delay(&mut self, duration: Duration) {
        sleep(duration);
    }
}
