//! Serial implementation of the command transport
//!
//! [Connection] abstracts over the serial link and the SLIP
//! encoding/decoding of commands, and implements the [Transport] API the
//! flasher core is written against.

use std::{
    io::{BufWriter, Write},
    thread::sleep,
    time::Duration,
};

use log::debug;
use serialport::{ClearBuffer, SerialPort};
use slip_codec::SlipDecoder;

use self::encoder::SlipEncoder;
use crate::{
    command::{Command, CommandType},
    error::{ConnectionError, Error, ResultExt, RomError, RomErrorKind},
    flasher::{hexify, SpiSetParams},
    targets::{Chip, CHIP_DETECT_MAGIC_REG_ADDR},
    transport::Transport,
};

// eFuse word 5 carries the SPI pad routing on chips with embedded flash;
// a zero field means the flash is on the default pins.
const EFUSE_SPI_PAD_CONFIG_REG: u32 = 0x3ff5_a014;

const MAX_RESPONSE_ATTEMPTS: usize = 100;
const SYNC_REPLY_COUNT: usize = 8;

/// A response from a target device following a command
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub resp: u8,
    pub return_op: u8,
    pub return_length: u16,
    pub value: u32,
    pub data: Vec<u8>,
    pub status: u8,
    pub error: u8,
}

/// An established connection with a target device
pub struct Connection {
    serial: Box<dyn SerialPort>,
    decoder: SlipDecoder,
}

impl Connection {
    pub fn new(serial: Box<dyn SerialPort>) -> Self {
        Connection {
            serial,
            decoder: SlipDecoder::new(),
        }
    }

    /// Open the serial port at `path` and wrap it in a connection
    pub fn open(path: &str, baud: u32) -> Result<Self, Error> {
        let serial = serialport::new(path, baud)
            .timeout(CommandType::FlashData.timeout())
            .open()?;
        Ok(Connection::new(serial))
    }

    /// Write a command to the serial port
    fn write_command(&mut self, command: Command) -> Result<(), Error> {
        debug!("Writing command: {:?}", command);
        self.serial.clear(ClearBuffer::Input)?;

        let mut writer = BufWriter::new(&mut self.serial);
        let mut encoder = SlipEncoder::new(&mut writer)?;
        command.write(&mut encoder)?;
        encoder.finish()?;
        writer.flush()?;
        Ok(())
    }

    /// Read the response to a command from the serial port
    fn read_response(&mut self) -> Result<Option<CommandResponse>, Error> {
        let response = self.read(10)?;

        // Most commands are answered with 10 bytes (ESP8266 ROM, two status
        // bytes) or 12 bytes (ESP32 ROM, four status bytes). The MD5 command
        // is answered with a 44 byte packet carrying the digest as ASCII hex
        // on the ROM loader, or a 26 byte packet carrying it as raw bytes.
        let (status_len, data) = match response.len() {
            10 | 26 => (2, Vec::new()),
            12 | 44 => (4, Vec::new()),
            _ => return Err(Error::InvalidResponse(format!(
                "unexpected response length {}",
                response.len()
            ))),
        };
        let data = match response.len() {
            26 => response[8..24].to_vec(),
            44 => response[8..40].to_vec(),
            _ => data,
        };

        let header = CommandResponse {
            resp: response[0],
            return_op: response[1],
            return_length: u16::from_le_bytes(response[2..4].try_into().unwrap()),
            value: u32::from_le_bytes(response[4..8].try_into().unwrap()),
            data,
            status: response[response.len() - status_len],
            error: response[response.len() - status_len + 1],
        };

        Ok(Some(header))
    }

    /// Write a command and read the matching response
    fn command(&mut self, command: Command) -> Result<CommandResponse, Error> {
        let ty = command.command_type();
        self.write_command(command).for_command(ty)?;

        for _ in 0..MAX_RESPONSE_ATTEMPTS {
            match self.read_response().for_command(ty)? {
                Some(response) if response.return_op == ty as u8 => {
                    return if response.status != 0 {
                        Err(Error::RomError(RomError::new(
                            ty,
                            RomErrorKind::from(response.error),
                        )))
                    } else {
                        Ok(response)
                    };
                }
                _ => continue,
            }
        }
        Err(Error::Connection(ConnectionError::ConnectionFailed))
    }

    fn read_reg(&mut self, address: u32) -> Result<u32, Error> {
        Ok(self.command(Command::ReadReg { address })?.value)
    }

    fn read(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let mut response = Vec::with_capacity(len);
        loop {
            self.decoder.decode(&mut self.serial, &mut response)?;
            if response.len() >= len {
                return Ok(response);
            }
        }
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.serial.flush()?;
        Ok(())
    }
}

impl Transport for Connection {
    fn sync(&mut self) -> Result<(), Error> {
        self.write_command(Command::Sync)
            .for_command(CommandType::Sync)?;
        self.flush()?;

        let mut synced = false;
        for _ in 0..MAX_RESPONSE_ATTEMPTS {
            match self.read_response().for_command(CommandType::Sync)? {
                Some(response) if response.return_op == CommandType::Sync as u8 => {
                    if response.status != 0 {
                        return Err(Error::RomError(RomError::new(
                            CommandType::Sync,
                            RomErrorKind::from(response.error),
                        )));
                    }
                    synced = true;
                    break;
                }
                _ => continue,
            }
        }
        if !synced {
            return Err(Error::Connection(ConnectionError::ConnectionFailed));
        }

        // the ROM repeats the sync reply several times, drain the extras so
        // they don't show up as responses to the next command
        for _ in 0..SYNC_REPLY_COUNT - 1 {
            if self.read_response().is_err() {
                break;
            }
        }

        Ok(())
    }

    fn detect_chip(&mut self) -> Result<Chip, Error> {
        let magic = self.read_reg(CHIP_DETECT_MAGIC_REG_ADDR)?;
        debug!("Detection magic: {:#010x}", magic);
        Chip::from_magic(magic)
    }

    fn read_spi_config(&mut self, chip: Chip) -> Result<u32, Error> {
        if !chip.supports_spi_attach() {
            return Ok(0);
        }
        let word = self.read_reg(EFUSE_SPI_PAD_CONFIG_REG)?;
        Ok(word & 0xfffff)
    }

    fn spi_attach(&mut self, config: u32) -> Result<(), Error> {
        self.command(Command::SpiAttach { config })?;
        Ok(())
    }

    fn spi_set_params(&mut self, total_size: u32) -> Result<(), Error> {
        self.command(Command::SpiSetParams {
            spi_params: SpiSetParams::default(total_size),
        })?;
        Ok(())
    }

    fn flash_begin(
        &mut self,
        offset: u32,
        erase_size: u32,
        block_size: u32,
        blocks: u32,
    ) -> Result<(), Error> {
        self.command(Command::FlashBegin {
            erase_size,
            blocks,
            block_size,
            offset,
        })
        .flashing()?;
        Ok(())
    }

    fn flash_data(&mut self, data: &[u8], sequence: u32) -> Result<(), Error> {
        self.command(Command::FlashData { data, sequence })
            .flashing()?;
        Ok(())
    }

    fn flash_end(&mut self, stay_in_bootloader: bool) -> Result<(), Error> {
        self.command(Command::FlashEnd { stay_in_bootloader })
            .flashing()?;
        Ok(())
    }

    fn read_register(&mut self, address: u32) -> Result<u32, Error> {
        self.read_reg(address)
    }

    fn write_register(
        &mut self,
        address: u32,
        value: u32,
        mask: u32,
        delay_us: u32,
    ) -> Result<(), Error> {
        self.command(Command::WriteReg {
            address,
            value,
            mask,
            delay_us,
        })?;
        Ok(())
    }

    fn change_baud(&mut self, new_baud: u32) -> Result<(), Error> {
        debug!("Change baud to: {}", new_baud);
        self.command(Command::ChangeBaudrate {
            new_baud,
            prior_baud: 0,
        })?;
        self.serial.set_baud_rate(new_baud)?;

        sleep(Duration::from_millis(50));
        self.flush()?;
        self.serial.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn flash_md5(&mut self, offset: u32, size: u32) -> Result<[u8; 32], Error> {
        let response = self.command(Command::FlashMd5 { offset, size })?;
        match response.data.len() {
            // ROM loader answers with the digest already hex encoded
            32 => Ok(response.data.as_slice().try_into().unwrap()),
            16 => {
                let raw: [u8; 16] = response.data.as_slice().try_into().unwrap();
                Ok(hexify(&raw))
            }
            len => Err(Error::InvalidResponse(format!(
                "expected a digest of 16 or 32 bytes, received {} bytes",
                len
            ))),
        }
    }

    fn enter_bootloader(&mut self) -> Result<(), Error> {
        // classic DTR/RTS dance: hold IO0 low while pulsing reset
        self.serial.write_data_terminal_ready(false)?;
        self.serial.write_request_to_send(true)?;

        sleep(Duration::from_millis(100));

        self.serial.write_data_terminal_ready(true)?;
        self.serial.write_request_to_send(false)?;

        sleep(Duration::from_millis(50));

        self.serial.write_data_terminal_ready(false)?;
        self.serial.clear(ClearBuffer::All)?;

        Ok(())
    }

    fn reset_target(&mut self) -> Result<(), Error> {
        sleep(Duration::from_millis(100));

        self.serial.write_request_to_send(true)?;
        sleep(Duration::from_millis(100));
        self.serial.write_request_to_send(false)?;

        Ok(())
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.serial.set_timeout(timeout)?;
        Ok(())
    }
}

mod encoder {
    use std::io::Write;

    const END: u8 = 0xC0;
    const ESC: u8 = 0xDB;
    const ESC_END: u8 = 0xDC;
    const ESC_ESC: u8 = 0xDD;

    pub struct SlipEncoder<'a, W: Write> {
        writer: &'a mut W,
        len: usize,
    }

    impl<'a, W: Write> SlipEncoder<'a, W> {
        /// Creates a new encoder context
        pub fn new(writer: &'a mut W) -> std::io::Result<Self> {
            let len = writer.write(&[END])?;
            Ok(Self { writer, len })
        }

        pub fn finish(mut self) -> std::io::Result<usize> {
            self.len += self.writer.write(&[END])?;
            Ok(self.len)
        }
    }

    impl<W: Write> Write for SlipEncoder<'_, W> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            for value in buf.iter() {
                match *value {
                    END => {
                        self.len += self.writer.write(&[ESC, ESC_END])?;
                    }
                    ESC => {
                        self.len += self.writer.write(&[ESC, ESC_ESC])?;
                    }
                    _ => {
                        self.len += self.writer.write(&[*value])?;
                    }
                }
            }

            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.writer.flush()
        }
    }
}
