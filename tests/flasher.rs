use std::{cell::Cell, io::Read, rc::Rc, time::Duration};

use esploader::{
    command::CommandType,
    error::{ConnectionError, Error},
    flasher::{ConnectOptions, Flasher, FLASH_WRITE_SIZE},
    targets::Chip,
    transport::Transport,
    updater::write_image,
};
use md5::{Digest, Md5};
use pretty_assertions::assert_eq;

/// A scripted transport recording every command issued against it
struct MockTransport {
    chip: Chip,
    flash_id: u32,
    md5_response: [u8; 32],
    sync_timeouts: u32,
    sync_hard_failure: bool,
    spi_busy: bool,

    sync_calls: Rc<Cell<u32>>,
    register_reads: Vec<u32>,
    register_writes: Vec<(u32, u32)>,
    begins: Vec<(u32, u32, u32, u32)>,
    data_blocks: Vec<(Vec<u8>, u32)>,
    ends: Vec<bool>,
    attaches: Vec<u32>,
    set_params: Vec<u32>,
    baud_changes: Vec<u32>,
    md5_requests: Vec<(u32, u32)>,
    bootloader_entries: u32,
    resets: u32,
}

impl MockTransport {
    fn new(chip: Chip) -> Self {
        MockTransport {
            chip,
            // JEDEC ID of a 4 MB part
            flash_id: 0x0016_4020,
            md5_response: *b"00000000000000000000000000000000",
            sync_timeouts: 0,
            sync_hard_failure: false,
            spi_busy: false,
            sync_calls: Rc::new(Cell::new(0)),
            register_reads: Vec::new(),
            register_writes: Vec::new(),
            begins: Vec::new(),
            data_blocks: Vec::new(),
            ends: Vec::new(),
            attaches: Vec::new(),
            set_params: Vec::new(),
            baud_changes: Vec::new(),
            md5_requests: Vec::new(),
            bootloader_entries: 0,
            resets: 0,
        }
    }

    fn register_traffic(&self) -> usize {
        self.register_reads.len() + self.register_writes.len()
    }
}

impl Transport for MockTransport {
    fn sync(&mut self) -> Result<(), Error> {
        self.sync_calls.set(self.sync_calls.get() + 1);
        if self.sync_hard_failure {
            return Err(Error::InvalidResponse("garbage".into()));
        }
        if self.sync_calls.get() <= self.sync_timeouts {
            return Err(Error::Connection(ConnectionError::Timeout(
                CommandType::Sync.into(),
            )));
        }
        Ok(())
    }

    fn detect_chip(&mut self) -> Result<Chip, Error> {
        Ok(self.chip)
    }

    fn read_spi_config(&mut self, _chip: Chip) -> Result<u32, Error> {
        Ok(0)
    }

    fn spi_attach(&mut self, config: u32) -> Result<(), Error> {
        self.attaches.push(config);
        Ok(())
    }

    fn spi_set_params(&mut self, total_size: u32) -> Result<(), Error> {
        self.set_params.push(total_size);
        Ok(())
    }

    fn flash_begin(
        &mut self,
        offset: u32,
        erase_size: u32,
        block_size: u32,
        blocks: u32,
    ) -> Result<(), Error> {
        self.begins.push((offset, erase_size, block_size, blocks));
        Ok(())
    }

    fn flash_data(&mut self, data: &[u8], sequence: u32) -> Result<(), Error> {
        self.data_blocks.push((data.to_vec(), sequence));
        Ok(())
    }

    fn flash_end(&mut self, stay_in_bootloader: bool) -> Result<(), Error> {
        self.ends.push(stay_in_bootloader);
        Ok(())
    }

    fn read_register(&mut self, address: u32) -> Result<u32, Error> {
        self.register_reads.push(address);
        if address == self.chip.spi_registers().w0() {
            Ok(self.flash_id)
        } else if self.spi_busy && address == self.chip.spi_registers().cmd() {
            // command register with the user-command bit still set
            Ok(1 << 18)
        } else {
            Ok(0)
        }
    }

    fn write_register(
        &mut self,
        address: u32,
        value: u32,
        _mask: u32,
        _delay_us: u32,
    ) -> Result<(), Error> {
        self.register_writes.push((address, value));
        Ok(())
    }

    fn change_baud(&mut self, new_baud: u32) -> Result<(), Error> {
        self.baud_changes.push(new_baud);
        Ok(())
    }

    fn flash_md5(&mut self, offset: u32, size: u32) -> Result<[u8; 32], Error> {
        self.md5_requests.push((offset, size));
        Ok(self.md5_response)
    }

    fn enter_bootloader(&mut self) -> Result<(), Error> {
        self.bootloader_entries += 1;
        Ok(())
    }

    fn reset_target(&mut self) -> Result<(), Error> {
        self.resets += 1;
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<(), Error> {
        Ok(())
    }

    fn delay(&mut self, _duration: Duration) {}
}

fn hex_digest(data: &[u8]) -> [u8; 32] {
    let digest: [u8; 16] = Md5::digest(data).into();
    let mut hex = [0; 32];
    for (i, byte) in digest.iter().enumerate() {
        hex[2 * i..2 * i + 2].copy_from_slice(format!("{byte:02x}").as_bytes());
    }
    hex
}

fn test_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A reader that never returns more than `chunk` bytes per call
struct ChunkedReader<'a> {
    data: &'a [u8],
    chunk: usize,
}

impl Read for ChunkedReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let len = self.data.len().min(self.chunk).min(buf.len());
        buf[..len].copy_from_slice(&self.data[..len]);
        self.data = &self.data[len..];
        Ok(len)
    }
}

#[test]
fn connect_syncs_once_on_a_quiet_link() {
    let mock = MockTransport::new(Chip::Esp32);
    let sync_calls = mock.sync_calls.clone();

    let flasher = Flasher::connect(mock, ConnectOptions::default()).unwrap();
    assert_eq!(sync_calls.get(), 1);
    assert_eq!(flasher.chip(), Chip::Esp32);
    assert_eq!(flasher.transport().bootloader_entries, 1);
    // the modern generation attaches its flash explicitly
    assert_eq!(flasher.transport().attaches, vec![0]);
    assert!(flasher.transport().begins.is_empty());
}

#[test]
fn connect_retries_timed_out_syncs() {
    let mut mock = MockTransport::new(Chip::Esp32);
    mock.sync_timeouts = 3;
    let sync_calls = mock.sync_calls.clone();

    Flasher::connect(mock, ConnectOptions::default()).unwrap();
    assert_eq!(sync_calls.get(), 4);
}

#[test]
fn connect_gives_up_after_the_configured_trials() {
    let mut mock = MockTransport::new(Chip::Esp32);
    mock.sync_timeouts = u32::MAX;
    let sync_calls = mock.sync_calls.clone();

    let result = Flasher::connect(mock, ConnectOptions::default());
    assert!(matches!(
        result,
        Err(Error::Connection(ConnectionError::Timeout(_)))
    ));
    assert_eq!(sync_calls.get(), 10);
}

#[test]
fn connect_aborts_on_non_timeout_sync_errors() {
    let mut mock = MockTransport::new(Chip::Esp32);
    mock.sync_hard_failure = true;
    let sync_calls = mock.sync_calls.clone();

    let result = Flasher::connect(mock, ConnectOptions::default());
    assert!(matches!(result, Err(Error::InvalidResponse(_))));
    assert_eq!(sync_calls.get(), 1);
}

#[test]
fn legacy_chips_attach_with_an_empty_flash_begin() {
    let mock = MockTransport::new(Chip::Esp8266);

    let flasher = Flasher::connect(mock, ConnectOptions::default()).unwrap();
    assert!(flasher.transport().attaches.is_empty());
    assert_eq!(flasher.transport().begins, vec![(0, 0, 0, 0)]);
}

#[test]
fn end_to_end_update_writes_padded_blocks_and_verifies() {
    let image = test_image(2500);
    let mut mock = MockTransport::new(Chip::Esp32);
    mock.md5_response = hex_digest(&image);

    let mut flasher = Flasher::connect(mock, ConnectOptions::default()).unwrap();
    write_image(&mut flasher, image.as_slice(), 2500, 0x1000, None).unwrap();
    flasher.flash_finish(false).unwrap();
    flasher.verify().unwrap();
    flasher.reset().unwrap();

    let mock = flasher.transport();

    // a 2500 byte image in 1024 byte blocks: 3 blocks, 3072 bytes erased
    assert_eq!(mock.begins, vec![(0x1000, 3072, 1024, 3)]);
    // the detected 4 MB capacity is pushed to the bootloader
    assert_eq!(mock.set_params, vec![4 * 1024 * 1024]);

    assert_eq!(mock.data_blocks.len(), 3);
    for (i, (block, sequence)) in mock.data_blocks.iter().enumerate() {
        assert_eq!(block.len(), FLASH_WRITE_SIZE);
        assert_eq!(*sequence, i as u32);
    }
    // the final block carries 452 bytes of data and a 572 byte 0xFF tail
    let (last, _) = &mock.data_blocks[2];
    assert_eq!(&last[..452], &image[2048..]);
    assert!(last[452..].iter().all(|byte| *byte == 0xFF));

    // finishing without a reboot keeps the target in the bootloader
    assert_eq!(mock.ends, vec![true]);
    // the device digest is requested over the unpadded image
    assert_eq!(mock.md5_requests, vec![(0x1000, 2500)]);
    assert_eq!(mock.resets, 1);
}

#[test]
fn verify_mismatch_is_not_a_transport_error() {
    let image = test_image(1024);
    let mock = MockTransport::new(Chip::Esp32);

    let mut flasher = Flasher::connect(mock, ConnectOptions::default()).unwrap();
    write_image(&mut flasher, image.as_slice(), 1024, 0, None).unwrap();
    flasher.flash_finish(false).unwrap();

    let result = flasher.verify();
    assert!(matches!(result, Err(Error::DigestMismatch { .. })));
}

#[test]
fn oversized_images_are_rejected_before_erasing() {
    let mut mock = MockTransport::new(Chip::Esp32);
    // a 256 KB part
    mock.flash_id = 0x0012_4020;

    let mut flasher = Flasher::connect(mock, ConnectOptions::default()).unwrap();
    let result = flasher.flash_start(0, 256 * 1024 + 1, 1024);
    assert!(matches!(result, Err(Error::ImageTooLarge { .. })));
    assert!(flasher.transport().begins.is_empty());

    // an image of exactly the capacity fits
    flasher.flash_start(0, 256 * 1024, 1024).unwrap();
    assert_eq!(flasher.transport().begins.len(), 1);
}

#[test]
fn unrecognized_flash_chips_skip_the_capacity_check() {
    let mut mock = MockTransport::new(Chip::Esp32);
    // size class outside 0x12..=0x18
    mock.flash_id = 0x00ff_4020;

    let mut flasher = Flasher::connect(mock, ConnectOptions::default()).unwrap();
    flasher.flash_start(0, 16 * 1024 * 1024, 1024).unwrap();

    assert!(flasher.transport().set_params.is_empty());
    assert_eq!(flasher.transport().begins.len(), 1);
    assert_eq!(flasher.flash_size(), None);
}

#[test]
fn writing_more_blocks_than_announced_is_rejected() {
    let mock = MockTransport::new(Chip::Esp32);
    let mut flasher = Flasher::connect(mock, ConnectOptions::default()).unwrap();

    flasher.flash_start(0, 2500, 1024).unwrap();
    flasher.flash_write(&[0; 1024]).unwrap();
    flasher.flash_write(&[0; 1024]).unwrap();
    flasher.flash_write(&[0; 452]).unwrap();

    let result = flasher.flash_write(&[0; 1]);
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    assert_eq!(flasher.transport().data_blocks.len(), 3);
}

#[test]
fn spi_command_preconditions_cause_no_register_traffic() {
    let mock = MockTransport::new(Chip::Esp32);
    let mut flasher = Flasher::connect(mock, ConnectOptions::default()).unwrap();
    let traffic_before = flasher.transport().register_traffic();

    let result = flasher.spi_command(CommandType::FlashDetect, &[], 40);
    assert!(matches!(result, Err(Error::InvalidArgument(_))));

    let result = flasher.spi_command(CommandType::FlashDetect, &[0; 9], 0);
    assert!(matches!(result, Err(Error::InvalidArgument(_))));

    assert_eq!(flasher.transport().register_traffic(), traffic_before);
}

#[test]
fn legacy_chips_reject_baud_changes_without_transport_calls() {
    let mock = MockTransport::new(Chip::Esp8266);
    let mut flasher = Flasher::connect(mock, ConnectOptions::default()).unwrap();

    let result = flasher.change_baud(921_600);
    assert!(matches!(result, Err(Error::UnsupportedFeature { .. })));
    assert!(flasher.transport().baud_changes.is_empty());

    let result = flasher.verify();
    assert!(matches!(result, Err(Error::UnsupportedFeature { .. })));
    assert!(flasher.transport().md5_requests.is_empty());
}

#[test]
fn short_reads_do_not_split_blocks() {
    let image = test_image(2500);
    let mut mock = MockTransport::new(Chip::Esp32);
    mock.md5_response = hex_digest(&image);

    let mut flasher = Flasher::connect(mock, ConnectOptions::default()).unwrap();
    let reader = ChunkedReader {
        data: &image,
        chunk: 512,
    };
    write_image(&mut flasher, reader, 2500, 0x1000, None).unwrap();
    flasher.flash_finish(false).unwrap();
    flasher.verify().unwrap();

    let mock = flasher.transport();
    assert_eq!(mock.data_blocks.len(), 3);
    // full blocks carry contiguous image data, no pad bytes mid-image
    let (first, _) = &mock.data_blocks[0];
    assert_eq!(&first[..], &image[..1024]);
    let (second, _) = &mock.data_blocks[1];
    assert_eq!(&second[..], &image[1024..2048]);
    let (last, _) = &mock.data_blocks[2];
    assert_eq!(&last[..452], &image[2048..]);
    assert!(last[452..].iter().all(|byte| *byte == 0xFF));
}

#[test]
fn capacity_check_accounts_for_the_start_offset() {
    let mut mock = MockTransport::new(Chip::Esp32);
    // a 256 KB part
    mock.flash_id = 0x0012_4020;

    let mut flasher = Flasher::connect(mock, ConnectOptions::default()).unwrap();

    // the image fits the part but not the part minus the offset
    let result = flasher.flash_start(0x1000, 256 * 1024 - 0x800, 1024);
    assert!(matches!(result, Err(Error::ImageTooLarge { .. })));
    assert!(flasher.transport().begins.is_empty());

    flasher.flash_start(0x1000, 256 * 1024 - 0x1000, 1024).unwrap();
    assert_eq!(flasher.transport().begins.len(), 1);
}

#[test]
fn wedged_spi_controller_times_out_after_the_poll_bound() {
    let mut mock = MockTransport::new(Chip::Esp32);
    mock.spi_busy = true;

    let mut flasher = Flasher::connect(mock, ConnectOptions::default()).unwrap();
    let cmd_reg = Chip::Esp32.spi_registers().cmd();

    let result = flasher.spi_command_bounded(CommandType::FlashDetect, &[], 24, 3);
    assert!(matches!(
        result,
        Err(Error::Connection(ConnectionError::Timeout(_)))
    ));
    let polls = flasher
        .transport()
        .register_reads
        .iter()
        .filter(|addr| **addr == cmd_reg)
        .count();
    assert_eq!(polls, 3);

    // the default bound takes the same exit
    let result = flasher.spi_command(CommandType::FlashDetect, &[], 24);
    assert!(matches!(
        result,
        Err(Error::Connection(ConnectionError::Timeout(_)))
    ));
}

#[test]
fn verify_before_a_finished_write_is_a_programming_error() {
    let mock = MockTransport::new(Chip::Esp32);
    let mut flasher = Flasher::connect(mock, ConnectOptions::default()).unwrap();

    assert!(matches!(
        flasher.verify(),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        flasher.flash_write(&[0; 4]),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        flasher.flash_finish(false),
        Err(Error::InvalidArgument(_))
    ));
}
