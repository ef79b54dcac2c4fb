//! Progress reporting for long-running update operations

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// A write of `total` bytes to `addr` has started
    fn init(&mut self, addr: u32, total: usize);
    /// `current` bytes of the write have been sent
    fn update(&mut self, current: usize);
    /// The write has completed
    fn finish(&mut self);
}
