use crate::frame::Frame;
use crate::memory::MemoryMonitor;
use crate::transaction::TxError;

/// Replies below this size are always sent, an error reply would not be much smaller.
pub const MIN_GUARDED_REPLY: u64 = 1024;

/// Reservation for a reply buffer. The encoded reply is charged to accounted memory while the
/// guard is alive, so large replies cannot push the process past the deny threshold.
#[derive(Debug)]
pub struct ReplyGuard<'a> {
    memory: &'a MemoryMonitor,
    reserved: u64,
    buffer: Vec<u8>,
}

impl<'a> ReplyGuard<'a> {
    /// Reserves `bytes` for a reply, or refuses with an OOM error when the allocation would
    /// cross the deny threshold.
    pub fn reserve(memory: &'a MemoryMonitor, bytes: usize) -> Result<ReplyGuard<'a>, TxError> {
        let bytes = bytes as u64;
        if bytes >= MIN_GUARDED_REPLY && memory.would_deny(bytes) {
            return Err(TxError::ResourceExhausted);
        }

        memory.accounted().add(bytes);

        Ok(ReplyGuard {
            memory,
            reserved: bytes,
            buffer: Vec::new(),
        })
    }

    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    /// Encodes `frame` into the reserved buffer.
    pub fn encode(&mut self, frame: &Frame) -> &[u8] {
        self.buffer.clear();
        self.buffer.reserve(self.reserved as usize);
        frame.write_to(&mut self.buffer);
        &self.buffer
    }
}

impl Drop for ReplyGuard<'_> {
    fn drop(&mut self) {
        self.memory.accounted().sub(self.reserved);
    }
}
