//! A library for updating the firmware of Espressif devices over serial, in
//! the field, using the ROM bootloader protocol.
//!
//! Supports the ESP8266 and ESP32 chip families.
//!
//! ```no_run
//! use esploader::{run_update, ConnectOptions, Connection, Flasher, UpdateOptions};
//!
//! # fn main() -> Result<(), esploader::Error> {
//! let connection = Connection::open("/dev/ttyUSB0", 115_200)?;
//! let mut flasher = Flasher::connect(connection, ConnectOptions::default())?;
//!
//! run_update(
//!     &mut flasher,
//!     &UpdateOptions {
//!         image: "firmware.bin".into(),
//!         offset: 0x1000,
//!         verify: true,
//!         delete_image: false,
//!     },
//!     None,
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod progress;
pub mod targets;
pub mod transport;
pub mod updater;

pub use crate::{
    connection::Connection,
    error::Error,
    flasher::{ConnectOptions, Flasher, FlashSize},
    progress::ProgressCallbacks,
    targets::Chip,
    transport::Transport,
    updater::{run_update, write_image, UpdateOptions},
};
