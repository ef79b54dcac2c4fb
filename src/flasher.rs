//! The flasher core
//!
//! [Flasher] drives a connected target through a firmware update: syncing
//! with the ROM bootloader, detecting the chip family and the attached flash
//! chip, writing the image in checksummed blocks and verifying the result
//! with the bootloader's MD5 command. It is written against the [Transport]
//! trait and carries no link-level state of its own.

use std::time::Duration;

use log::{debug, warn};
use md5::{Digest, Md5};
use strum::{Display, FromRepr, VariantNames};

use crate::{
    command::CommandType,
    error::{ConnectionError, Error},
    targets::{Chip, SpiRegisters},
    transport::Transport,
};

/// Default size of a single flash data block
pub const FLASH_WRITE_SIZE: usize = 0x400;
/// Initial value for the rolling XOR block checksum
pub const CHECKSUM_INIT: u8 = 0xEF;

const PADDING_PATTERN: u8 = 0xff;

const SPI_USR_CMD: u32 = 1 << 31;
const SPI_USR_MISO: u32 = 1 << 28;
const SPI_USR_MOSI: u32 = 1 << 27;
const SPI_CMD_USR: u32 = 1 << 18;
const CMD_LEN_SHIFT: u32 = 28;

/// Default bound on the SPI completion poll loop
pub const SPI_POLL_ATTEMPTS: u32 = 10;

const SYNC_RETRY_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_CONNECT_TRIALS: u32 = 10;

/// Update the rolling XOR checksum over `data`
pub fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

/// Render a raw MD5 digest as lowercase ASCII hex
pub(crate) fn hexify(raw: &[u8; 16]) -> [u8; 32] {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let mut hex = [0; 32];
    for (i, byte) in raw.iter().enumerate() {
        hex[2 * i] = HEX[(byte >> 4) as usize];
        hex[2 * i + 1] = HEX[(byte & 0xf) as usize];
    }

    hex
}

/// Supported flash chip sizes, identified by the size field of the JEDEC ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr, VariantNames)]
#[non_exhaustive]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum FlashSize {
    /// 256 KB
    _256Kb = 0x12,
    /// 512 KB
    _512Kb = 0x13,
    /// 1 MB
    _1Mb = 0x14,
    /// 2 MB
    _2Mb = 0x15,
    /// 4 MB
    _4Mb = 0x16,
    /// 8 MB
    _8Mb = 0x17,
    /// 16 MB
    _16Mb = 0x18,
}

impl FlashSize {
    fn from_detected(value: u8) -> Result<Self, Error> {
        Self::from_repr(value).ok_or(Error::UnsupportedFlash(value))
    }

    /// Size of the flash chip in bytes
    pub fn size(self) -> u32 {
        1 << (self as u8)
    }
}

/// Parameters of the attached SPI flash chip, passed to the bootloader after
/// attaching
#[derive(Copy, Clone, Debug)]
pub struct SpiSetParams {
    /// Flash chip ID
    fl_id: u32,
    /// Total size in bytes
    total_size: u32,
    /// Block size
    block_size: u32,
    /// Sector size
    sector_size: u32,
    /// Page size
    page_size: u32,
    /// Status mask
    status_mask: u32,
}

impl SpiSetParams {
    pub fn default(size: u32) -> Self {
        SpiSetParams {
            fl_id: 0,
            total_size: size,
            block_size: 64 * 1024,
            sector_size: 4 * 1024,
            page_size: 256,
            status_mask: 0xFFFF,
        }
    }

    /// Encode the parameters into a byte array
    pub fn encode(&self) -> Vec<u8> {
        let vec = vec![
            self.fl_id,
            self.total_size,
            self.block_size,
            self.sector_size,
            self.page_size,
            self.status_mask,
        ];
        vec.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

/// Options controlling the initial handshake with the bootloader
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Number of sync attempts before giving up
    pub trials: u32,
    /// Timeout for a single sync attempt
    pub sync_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            trials: DEFAULT_CONNECT_TRIALS,
            sync_timeout: CommandType::Sync.timeout(),
        }
    }
}

struct WriteCursor {
    offset: u32,
    total_size: u32,
    block_size: u32,
    blocks: u32,
    sequence: u32,
    digest: Md5,
}

#[derive(Clone)]
struct WrittenRegion {
    offset: u32,
    size: u32,
    digest: [u8; 32],
}

/// A session with a target device in bootloader mode
pub struct Flasher<T: Transport> {
    transport: T,
    chip: Chip,
    spi_registers: SpiRegisters,
    flash_size: Option<FlashSize>,
    cursor: Option<WriteCursor>,
    written: Option<WrittenRegion>,
}

impl<T: Transport> Flasher<T> {
    /// Put the target into bootloader mode, sync with it, detect the chip
    /// family and attach the SPI flash
    pub fn connect(mut transport: T, options: ConnectOptions) -> Result<Self, Error> {
        transport.enter_bootloader()?;
        Self::sync(&mut transport, &options)?;

        let chip = transport.detect_chip()?;
        debug!("Found {}", chip);

        let mut flasher = Flasher {
            transport,
            spi_registers: chip.spi_registers(),
            chip,
            flash_size: None,
            cursor: None,
            written: None,
        };
        flasher.attach()?;

        Ok(flasher)
    }

    fn sync(transport: &mut T, options: &ConnectOptions) -> Result<(), Error> {
        transport.set_timeout(options.sync_timeout)?;

        let mut last_error = Error::Connection(ConnectionError::ConnectionFailed);
        for trial in 0..options.trials {
            if trial > 0 {
                transport.delay(SYNC_RETRY_DELAY);
            }
            match transport.sync() {
                Ok(()) => {
                    debug!("Synced after {} attempt(s)", trial + 1);
                    return Ok(());
                }
                // only a missed reply is worth retrying, anything else means
                // the link itself is broken
                Err(err @ Error::Connection(ConnectionError::Timeout(_))) => last_error = err,
                Err(err) => return Err(err),
            }
        }

        Err(last_error)
    }

    fn attach(&mut self) -> Result<(), Error> {
        if self.chip.supports_spi_attach() {
            let config = self.transport.read_spi_config(self.chip)?;
            debug!("SPI pin configuration: {:#x}", config);
            self.transport
                .set_timeout(CommandType::SpiAttach.timeout())?;
            self.transport.spi_attach(config)
        } else {
            // the legacy generation arms its flash engine with an empty
            // flash-begin instead of an attach command
            self.transport
                .set_timeout(CommandType::FlashBegin.timeout())?;
            self.transport.flash_begin(0, 0, 0, 0)
        }
    }

    /// The chip family of the connected target
    pub fn chip(&self) -> Chip {
        self.chip
    }

    /// The detected flash size, available once a flash session has started
    pub fn flash_size(&self) -> Option<FlashSize> {
        self.flash_size
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Read a 32-bit register on the target
    pub fn read_reg(&mut self, address: u32) -> Result<u32, Error> {
        self.transport.set_timeout(CommandType::ReadReg.timeout())?;
        self.transport.read_register(address)
    }

    /// Write a 32-bit register on the target
    pub fn write_reg(&mut self, address: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.transport
            .set_timeout(CommandType::WriteReg.timeout())?;
        self.transport
            .write_register(address, value, mask.unwrap_or(0xFFFFFFFF), 0)
    }

    /// Run an arbitrary SPI command against the attached flash chip by
    /// driving the chip's SPI controller registers directly
    ///
    /// At most 64 data bits can be clocked out and at most 32 bits clocked
    /// back in; the response arrives in the first data-buffer register.
    pub fn spi_command(
        &mut self,
        command: CommandType,
        data: &[u8],
        read_bits: u32,
    ) -> Result<u32, Error> {
        self.spi_command_bounded(command, data, read_bits, SPI_POLL_ATTEMPTS)
    }

    /// [spi_command](Self::spi_command) with an explicit bound on the
    /// completion poll loop
    pub fn spi_command_bounded(
        &mut self,
        command: CommandType,
        data: &[u8],
        read_bits: u32,
        poll_attempts: u32,
    ) -> Result<u32, Error> {
        if read_bits > 32 {
            return Err(Error::InvalidArgument("at most 32 bits can be read back"));
        }
        if data.len() > 8 {
            return Err(Error::InvalidArgument(
                "at most 64 bits can be clocked out",
            ));
        }

        let regs = self.spi_registers;

        let old_spi_usr = self.read_reg(regs.usr())?;
        let old_spi_usr2 = self.read_reg(regs.usr2())?;

        let mut flags = SPI_USR_CMD;
        if read_bits > 0 {
            flags |= SPI_USR_MISO;
        }
        if !data.is_empty() {
            flags |= SPI_USR_MOSI;
        }

        self.set_data_lengths(data.len() as u32 * 8, read_bits)?;

        self.write_reg(regs.usr(), flags, None)?;
        self.write_reg(regs.usr2(), (7 << CMD_LEN_SHIFT) | command as u32, None)?;

        if data.is_empty() {
            self.write_reg(regs.w0(), 0, None)?;
        } else {
            for (i, bytes) in data.chunks(4).enumerate() {
                let mut padded = [0; 4];
                padded[..bytes.len()].copy_from_slice(bytes);
                self.write_reg(
                    regs.w0() + 4 * i as u32,
                    u32::from_le_bytes(padded),
                    None,
                )?;
            }
        }

        // trigger the transfer and poll for completion
        self.write_reg(regs.cmd(), SPI_CMD_USR, None)?;

        let mut attempts = 0;
        while self.read_reg(regs.cmd())? & SPI_CMD_USR != 0 {
            attempts += 1;
            if attempts >= poll_attempts {
                return Err(Error::Connection(ConnectionError::Timeout(command.into())));
            }
        }

        let result = self.read_reg(regs.w0())?;

        // restored only on success, a wedged controller keeps its state for
        // inspection
        self.write_reg(regs.usr(), old_spi_usr, None)?;
        self.write_reg(regs.usr2(), old_spi_usr2, None)?;

        Ok(result)
    }

    fn set_data_lengths(&mut self, mosi_bits: u32, miso_bits: u32) -> Result<(), Error> {
        let regs = self.spi_registers;

        if let (Some(mosi_length), Some(miso_length)) = (regs.mosi_length(), regs.miso_length()) {
            if mosi_bits > 0 {
                self.write_reg(mosi_length, mosi_bits - 1, None)?;
            }
            if miso_bits > 0 {
                self.write_reg(miso_length, miso_bits - 1, None)?;
            }
        } else {
            // the legacy generation packs both lengths into bit fields of the
            // usr1 register
            let mosi_mask = if mosi_bits == 0 { 0 } else { mosi_bits - 1 };
            let miso_mask = if miso_bits == 0 { 0 } else { miso_bits - 1 };
            self.write_reg(regs.usr1(), (miso_mask << 8) | (mosi_mask << 17), None)?;
        }

        Ok(())
    }

    /// Detect the size of the attached flash chip from its JEDEC ID
    pub fn flash_detect(&mut self) -> Result<FlashSize, Error> {
        let flash_id = self.spi_command(CommandType::FlashDetect, &[], 24)?;
        let size_id = (flash_id >> 16) as u8;

        FlashSize::from_detected(size_id)
    }

    /// Begin a flash session: size-check the image against the detected flash
    /// chip and erase the target region
    pub fn flash_start(
        &mut self,
        offset: u32,
        image_size: u32,
        block_size: u32,
    ) -> Result<(), Error> {
        if self.cursor.is_some() {
            return Err(Error::InvalidArgument(
                "a flash session is already in progress",
            ));
        }
        if block_size == 0 {
            return Err(Error::InvalidArgument("block size must not be zero"));
        }

        match self.flash_detect() {
            Ok(size) => {
                debug!("Detected flash size: {}", size);
                self.flash_size = Some(size);

                if image_size > size.size().saturating_sub(offset) {
                    return Err(Error::ImageTooLarge {
                        image: image_size,
                        flash: size.size(),
                    });
                }
                if self.chip.supports_spi_set_params() {
                    self.transport
                        .set_timeout(CommandType::SpiSetParams.timeout())?;
                    self.transport.spi_set_params(size.size())?;
                }
            }
            // detection is best effort, without it the image is written
            // unchecked
            Err(err) => warn!("Flash size detection failed: {:#}", err),
        }

        let blocks = image_size.div_ceil(block_size);
        let erase_size = blocks * block_size;

        self.transport
            .set_timeout(CommandType::FlashBegin.timeout_for_size(erase_size))?;
        self.transport
            .flash_begin(offset, erase_size, block_size, blocks)?;

        self.cursor = Some(WriteCursor {
            offset,
            total_size: image_size,
            block_size,
            blocks,
            sequence: 0,
            digest: Md5::new(),
        });
        self.written = None;

        Ok(())
    }

    /// Write one block of image data, at most the session's block size
    ///
    /// Short blocks are padded to the full block size before transmission and
    /// are only valid as the final block of a session.
    pub fn flash_write(&mut self, data: &[u8]) -> Result<(), Error> {
        let cursor = self
            .cursor
            .as_mut()
            .ok_or(Error::InvalidArgument("no flash session is in progress"))?;

        if data.is_empty() || data.len() as u32 > cursor.block_size {
            return Err(Error::InvalidArgument(
                "a block must be between one byte and the session block size",
            ));
        }
        if cursor.sequence >= cursor.blocks {
            return Err(Error::InvalidArgument(
                "more blocks written than announced at session start",
            ));
        }

        let mut block = vec![PADDING_PATTERN; cursor.block_size as usize];
        block[..data.len()].copy_from_slice(data);

        // the digest covers the data rounded up to a word boundary, padding
        // included, matching what the bootloader hashes on its side
        let digest_len = (data.len() + 3) & !3;
        cursor.digest.update(&block[..digest_len]);

        let sequence = cursor.sequence;
        cursor.sequence += 1;

        self.transport
            .set_timeout(CommandType::FlashData.timeout())?;
        self.transport.flash_data(&block, sequence)
    }

    /// End the flash session
    ///
    /// With `reboot` set the bootloader immediately jumps into the freshly
    /// written image; otherwise the target stays in the bootloader so the
    /// write can still be verified.
    pub fn flash_finish(&mut self, reboot: bool) -> Result<(), Error> {
        let cursor = self
            .cursor
            .take()
            .ok_or(Error::InvalidArgument("no flash session is in progress"))?;

        self.transport
            .set_timeout(CommandType::FlashEnd.timeout())?;
        self.transport.flash_end(!reboot)?;

        let digest: [u8; 16] = cursor.digest.finalize().into();
        self.written = Some(WrittenRegion {
            offset: cursor.offset,
            size: cursor.total_size,
            digest: hexify(&digest),
        });

        Ok(())
    }

    /// Verify the last finished write by comparing MD5 digests
    pub fn verify(&mut self) -> Result<(), Error> {
        if !self.chip.supports_md5_check() {
            return Err(Error::UnsupportedFeature {
                chip: self.chip,
                feature: "MD5 flash verification".into(),
            });
        }

        let region = self
            .written
            .clone()
            .ok_or(Error::InvalidArgument("no finished write to verify"))?;

        self.transport
            .set_timeout(CommandType::FlashMd5.timeout_for_size(region.size))?;
        let received = self.transport.flash_md5(region.offset, region.size)?;

        if received != region.digest {
            return Err(Error::DigestMismatch {
                expected: String::from_utf8_lossy(&region.digest).into_owned(),
                received: String::from_utf8_lossy(&received).into_owned(),
            });
        }

        debug!("Flash contents verified");
        Ok(())
    }

    /// Switch the link to a higher baud rate
    pub fn change_baud(&mut self, baud: u32) -> Result<(), Error> {
        if !self.chip.supports_change_baud() {
            return Err(Error::UnsupportedFeature {
                chip: self.chip,
                feature: "changing the baud rate".into(),
            });
        }

        self.transport
            .set_timeout(CommandType::ChangeBaudrate.timeout())?;
        self.transport.change_baud(baud)
    }

    /// Hard-reset the target out of the bootloader
    pub fn reset(&mut self) -> Result<(), Error> {
        self.transport.reset_target()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rolling_checksum() {
        assert_eq!(checksum(&[], CHECKSUM_INIT), 0xEF);
        assert_eq!(checksum(&[0xEF], CHECKSUM_INIT), 0x00);
        assert_eq!(checksum(&[0x01, 0x02, 0x04], CHECKSUM_INIT), 0xEF ^ 0x07);
    }

    #[test]
    fn hexify_digest() {
        let raw = [
            0xd4, 0x1d, 0x8c, 0xd9, 0x8f, 0x00, 0xb2, 0x04, 0xe9, 0x80, 0x09, 0x98, 0xec, 0xf8,
            0x42, 0x7e,
        ];
        assert_eq!(&hexify(&raw), b"d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn flash_size_from_jedec_id() {
        assert_eq!(FlashSize::from_detected(0x12).unwrap(), FlashSize::_256Kb);
        assert_eq!(FlashSize::from_detected(0x16).unwrap(), FlashSize::_4Mb);
        assert_eq!(FlashSize::from_detected(0x18).unwrap(), FlashSize::_16Mb);
        assert_eq!(FlashSize::_4Mb.size(), 4 * 1024 * 1024);

        assert!(matches!(
            FlashSize::from_detected(0x11),
            Err(Error::UnsupportedFlash(0x11))
        ));
        assert!(matches!(
            FlashSize::from_detected(0x19),
            Err(Error::UnsupportedFlash(0x19))
        ));
    }

    #[test]
    fn spi_set_params_encoding() {
        let encoded = SpiSetParams::default(0x400000).encode();
        assert_eq!(encoded.len(), 24);
        assert_eq!(&encoded[0..4], &[0, 0, 0, 0]);
        assert_eq!(&encoded[4..8], &0x400000u32.to_le_bytes());
        assert_eq!(&encoded[20..24], &0xFFFFu32.to_le_bytes());
    }
}
