//! The update orchestrator
//!
//! Drives a complete firmware update from a file on the local filesystem:
//! stream the image to the target in blocks, verify the written flash
//! against a local digest and reboot the target into the new firmware.

use std::{
    fs,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use crate::{
    error::Error,
    flasher::{Flasher, FLASH_WRITE_SIZE},
    progress::ProgressCallbacks,
    transport::Transport,
};

// report progress in steps of this many percent
const PROGRESS_GRANULARITY: u64 = 4;

/// Options for a complete firmware update
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Path of the firmware image to write
    pub image: PathBuf,
    /// Flash offset to write the image to
    pub offset: u32,
    /// Verify the written flash against the image digest where the chip
    /// supports it
    pub verify: bool,
    /// Delete the image file once it has been written and verified
    pub delete_image: bool,
}

/// Stream an image to the target in blocks, reporting progress along the way
///
/// The session is left open so the caller decides how to finish it.
pub fn write_image<T, R>(
    flasher: &mut Flasher<T>,
    mut image: R,
    image_size: u32,
    offset: u32,
    mut progress: Option<&mut dyn ProgressCallbacks>,
) -> Result<(), Error>
where
    T: Transport,
    R: Read,
{
    flasher.flash_start(offset, image_size, FLASH_WRITE_SIZE as u32)?;

    if let Some(cb) = progress.as_mut() {
        cb.init(offset, image_size as usize);
    }

    let mut buffer = [0; FLASH_WRITE_SIZE];
    let mut written = 0u64;
    let mut last_reported = 0u64;

    while written < image_size as u64 {
        // readers may return short counts mid-stream, keep reading until the
        // block is full so only the final block is ever short
        let remaining = (image_size as u64 - written).min(FLASH_WRITE_SIZE as u64) as usize;
        let mut filled = 0;
        while filled < remaining {
            match image.read(&mut buffer[filled..remaining]) {
                Ok(0) => {
                    return Err(Error::InvalidArgument(
                        "image file is shorter than its reported size",
                    ));
                }
                Ok(read) => filled += read,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::ImageRead(err)),
            }
        }

        flasher.flash_write(&buffer[..filled])?;
        written += filled as u64;

        let percent = written * 100 / image_size as u64;
        if percent >= last_reported + PROGRESS_GRANULARITY || written == image_size as u64 {
            debug!("Written {}/{} bytes ({}%)", written, image_size, percent);
            if let Some(cb) = progress.as_mut() {
                cb.update(written as usize);
            }
            last_reported = percent;
        }
    }

    if let Some(cb) = progress.as_mut() {
        cb.finish();
    }

    Ok(())
}

/// Run a complete firmware update from a file
///
/// Writes the image, verifies the flash contents where the chip supports it,
/// reboots the target into the new firmware and finally removes the image
/// file when asked to.
pub fn run_update<T: Transport>(
    flasher: &mut Flasher<T>,
    options: &UpdateOptions,
    progress: Option<&mut dyn ProgressCallbacks>,
) -> Result<(), Error> {
    let image = open_image(&options.image)?;
    let image_size = image
        .metadata()
        .map_err(|err| Error::FileOpenError(options.image.display().to_string(), err))?
        .len() as u32;

    info!(
        "Writing {} ({} bytes) to {:#x}",
        options.image.display(),
        image_size,
        options.offset
    );

    write_image(flasher, image, image_size, options.offset, progress)?;
    flasher.flash_finish(false)?;

    if options.verify {
        if flasher.chip().supports_md5_check() {
            flasher.verify()?;
        } else {
            warn!("The {} cannot verify flash contents, skipping", flasher.chip());
        }
    }

    flasher.reset()?;
    info!("Update complete, target rebooted");

    if options.delete_image {
        fs::remove_file(&options.image)
            .map_err(|err| Error::FileOpenError(options.image.display().to_string(), err))?;
        debug!("Removed {}", options.image.display());
    }

    Ok(())
}

fn open_image(path: &Path) -> Result<File, Error> {
    File::open(path).map_err(|err| Error::FileOpenError(path.display().to_string(), err))
}
