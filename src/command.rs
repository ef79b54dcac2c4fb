//! Commands understood by the ROM bootloader, their wire encoding and the
//! timeout budget attached to each of them.

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

use crate::flasher::{checksum, SpiSetParams, CHECKSUM_INIT};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_FLASH_TIMEOUT: Duration = Duration::from_secs(3);
const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(10);
const MD5_TIMEOUT_PER_MB: Duration = Duration::from_millis(800);
const SYNC_TIMEOUT: Duration = Duration::from_millis(100);

/// Types of commands that can be sent to a target device
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0a,
    SpiSetParams = 0x0b,
    SpiAttach = 0x0d,
    ChangeBaudrate = 0x0f,
    FlashMd5 = 0x13,
    // Not a bootloader command: the JEDEC read-ID opcode clocked out over the
    // raw SPI executor, kept here so timeouts and errors can name it.
    FlashDetect = 0x9f,
}

impl CommandType {
    /// The fixed timeout budget for this command
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::ReadReg | CommandType::WriteReg => DEFAULT_TIMEOUT,
            _ => DEFAULT_FLASH_TIMEOUT,
        }
    }

    /// The timeout budget for this command when operating on `size` bytes
    ///
    /// Scaled timeouts are computed once from the full operation size and are
    /// floored at the default flash timeout so small images never get an
    /// unreasonably short window.
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        fn calc_timeout(timeout_per_mb: Duration, size: u32) -> Duration {
            let mb = size as f64 / 1_000_000.0;
            std::cmp::max(
                DEFAULT_FLASH_TIMEOUT,
                Duration::from_millis((timeout_per_mb.as_millis() as f64 * mb) as u64),
            )
        }
        match self {
            CommandType::FlashBegin => calc_timeout(ERASE_REGION_TIMEOUT_PER_MB, size),
            CommandType::FlashMd5 => calc_timeout(MD5_TIMEOUT_PER_MB, size),
            _ => self.timeout(),
        }
    }
}

/// A command to be sent to a target device
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    FlashBegin {
        erase_size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashEnd {
        stay_in_bootloader: bool,
    },
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: u32,
        delay_us: u32,
    },
    ReadReg {
        address: u32,
    },
    SpiSetParams {
        spi_params: SpiSetParams,
    },
    SpiAttach {
        config: u32,
    },
    ChangeBaudrate {
        /// New baud rate
        new_baud: u32,
        /// Prior baud rate ('0' for ROM flasher)
        prior_baud: u32,
    },
    FlashMd5 {
        offset: u32,
        size: u32,
    },
}

impl Command<'_> {
    /// The command type of the command
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach { .. } => CommandType::SpiAttach,
            Command::ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
        }
    }

    /// Write the command to the given writer
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[0, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                erase_size,
                blocks,
                block_size,
                offset,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct BeginParams {
                    erase_size: u32,
                    blocks: u32,
                    block_size: u32,
                    offset: u32,
                }
                let params = BeginParams {
                    erase_size,
                    blocks,
                    block_size,
                    offset,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::FlashData { data, sequence } => {
                data_command(writer, data, sequence)?;
            }
            Command::FlashEnd { stay_in_bootloader } => {
                write_basic(writer, &[stay_in_bootloader as u8], 0)?;
            }
            Command::Sync => {
                write_basic(
                    writer,
                    &[
                        0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                        0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                        0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
                    ],
                    0,
                )?;
            }
            Command::WriteReg {
                address,
                value,
                mask,
                delay_us,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct WriteRegParams {
                    addr: u32,
                    value: u32,
                    mask: u32,
                    delay_us: u32,
                }
                let params = WriteRegParams {
                    addr: address,
                    value,
                    mask,
                    delay_us,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &address.to_le_bytes(), 0)?;
            }
            Command::SpiSetParams { spi_params } => {
                write_basic(writer, &spi_params.encode(), 0)?;
            }
            Command::SpiAttach { config } => {
                // The ROM loader takes 4 extra zero bytes after the pin
                // configuration word.
                let mut data = [0; 8];
                data[0..4].copy_from_slice(&config.to_le_bytes());
                write_basic(writer, &data, 0)?;
            }
            Command::ChangeBaudrate {
                new_baud,
                prior_baud,
            } => {
                // length
                writer.write_all(&(8u16.to_le_bytes()))?;
                // checksum
                writer.write_all(&(0u32.to_le_bytes()))?;
                // data
                writer.write_all(&new_baud.to_le_bytes())?;
                writer.write_all(&prior_baud.to_le_bytes())?;
            }
            Command::FlashMd5 { offset, size } => {
                // length
                writer.write_all(&(16u16.to_le_bytes()))?;
                // checksum
                writer.write_all(&(0u32.to_le_bytes()))?;
                // data
                writer.write_all(&offset.to_le_bytes())?;
                writer.write_all(&size.to_le_bytes())?;
                writer.write_all(&0u32.to_le_bytes())?;
                writer.write_all(&0u32.to_le_bytes())?;
            }
        };
        Ok(())
    }
}

fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&((data.len() as u16).to_le_bytes()))?;
    writer.write_all(&(checksum.to_le_bytes()))?;
    writer.write_all(data)?;
    Ok(())
}

fn data_command<W: Write>(mut writer: W, block_data: &[u8], sequence: u32) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let params = BlockParams {
        size: block_data.len() as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let check = checksum(block_data, CHECKSUM_INIT);
    let total_length = size_of::<BlockParams>() + block_data.len();

    writer.write_all(&((total_length as u16).to_le_bytes()))?;
    writer.write_all(&((check as u32).to_le_bytes()))?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaled_timeout_is_floored_for_small_sizes() {
        assert_eq!(
            CommandType::FlashBegin.timeout_for_size(1024),
            DEFAULT_FLASH_TIMEOUT
        );
        assert_eq!(
            CommandType::FlashMd5.timeout_for_size(0),
            DEFAULT_FLASH_TIMEOUT
        );
    }

    #[test]
    fn scaled_timeout_grows_with_size() {
        // 4 MB erase at 10 s/MB
        assert_eq!(
            CommandType::FlashBegin.timeout_for_size(4_000_000),
            Duration::from_secs(40)
        );
        // 10 MB digest at 800 ms/MB
        assert_eq!(
            CommandType::FlashMd5.timeout_for_size(10_000_000),
            Duration::from_secs(8)
        );
    }

    #[test]
    fn fixed_timeouts_by_class() {
        assert_eq!(CommandType::Sync.timeout(), SYNC_TIMEOUT);
        assert_eq!(CommandType::ReadReg.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(CommandType::FlashData.timeout(), DEFAULT_FLASH_TIMEOUT);
        // size-scaling only applies to erase and digest commands
        assert_eq!(
            CommandType::FlashData.timeout_for_size(100_000_000),
            DEFAULT_FLASH_TIMEOUT
        );
    }

    #[test]
    fn flash_end_encodes_stay_in_bootloader_flag() {
        let mut encoded = Vec::new();
        Command::FlashEnd {
            stay_in_bootloader: true,
        }
        .write(&mut encoded)
        .unwrap();

        // direction, opcode, length (u16), checksum (u32), payload
        assert_eq!(
            encoded,
            &[0, 0x04, 1, 0, 0, 0, 0, 0, 1][..]
        );
    }
}
