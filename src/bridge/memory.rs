use crate::bridge::address::RelocatedAddress;
use crate::bridge::error::Error;
use crate::bridge::host::{RemoteMemory, ThreadControl, ThreadId};
use crate::{pb_debug, weak_error};
use serde::{Deserialize, Serialize};
use std::cell::Cell;

/// Debugee pointer width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointerSize {
    Four,
    Eight,
}

impl PointerSize {
    pub fn bytes(self) -> usize {
        match self {
            PointerSize::Four => 4,
            PointerSize::Eight => 8,
        }
    }

    /// Decode one little-endian pointer from the head of `data`.
    pub fn read_le(self, data: &[u8]) -> Option<u64> {
        match self {
            PointerSize::Four => {
                let raw: [u8; 4] = data.get(..4)?.try_into().ok()?;
                Some(u32::from_le_bytes(raw) as u64)
            }
            PointerSize::Eight => {
                let raw: [u8; 8] = data.get(..8)?.try_into().ok()?;
                Some(u64::from_le_bytes(raw))
            }
        }
    }
}

impl TryFrom<u8> for PointerSize {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(PointerSize::Four),
            8 => Ok(PointerSize::Eight),
            other => Err(Error::UnsupportedPointerSize(other)),
        }
    }
}

/// Typed reads and writes over any [`RemoteMemory`].
pub trait MemoryExt: RemoteMemory {
    fn read_bytes(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0; len];
        self.read_memory(addr, &mut buf)?;
        Ok(buf)
    }

    fn read_u16(&self, addr: RelocatedAddress) -> Result<u16, Error> {
        let mut buf = [0; 2];
        self.read_memory(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: RelocatedAddress) -> Result<u32, Error> {
        let mut buf = [0; 4];
        self.read_memory(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_pointer(&self, addr: RelocatedAddress) -> Result<RelocatedAddress, Error> {
        let size = self.pointer_size();
        let mut buf = [0; 8];
        self.read_memory(addr, &mut buf[..size.bytes()])?;
        let value = size
            .read_le(&buf)
            .ok_or(Error::ReadMemory { addr, len: size.bytes() })?;
        Ok(RelocatedAddress::from(value))
    }

    /// Read a NUL terminated ASCII string of at most `max_len` bytes.
    fn read_c_string(&self, addr: RelocatedAddress, max_len: usize) -> Result<String, Error> {
        let bytes = self.read_bytes(addr, max_len)?;
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8(bytes[..end].to_vec())?)
    }

    /// Return true if one byte at `addr` is readable.
    fn probe(&self, addr: RelocatedAddress) -> bool {
        let mut one = [0; 1];
        self.read_memory(addr, &mut one).is_ok()
    }

    fn write_u32(&self, addr: RelocatedAddress, value: u32) -> Result<(), Error> {
        self.write_memory(addr, &value.to_le_bytes())
    }
}

impl<T: RemoteMemory + ?Sized> MemoryExt for T {}

/// Keeps debugee threads suspended while alive.
///
/// Threads are resumed on drop whatever happened in between, a failed resume of one thread
/// doesn't prevent resuming the rest.
pub struct SuspendGuard<'a, T: ThreadControl + ?Sized> {
    control: &'a T,
    suspended: Vec<ThreadId>,
}

impl<'a, T: ThreadControl + ?Sized> SuspendGuard<'a, T> {
    /// Suspend every debugee thread. A single threaded debugee is left running.
    pub fn new(control: &'a T) -> Self {
        let threads = control.thread_ids();
        let mut suspended = Vec::with_capacity(threads.len());
        if threads.len() > 1 {
            for tid in threads {
                if weak_error!(control.suspend_thread(tid), "suspend thread:").is_some() {
                    suspended.push(tid);
                }
            }
        }
        pb_debug!("{} threads suspended", suspended.len());
        Self { control, suspended }
    }

    pub fn suspended(&self) -> &[ThreadId] {
        &self.suspended
    }
}

impl<T: ThreadControl + ?Sized> Drop for SuspendGuard<'_, T> {
    fn drop(&mut self) {
        for tid in self.suspended.drain(..) {
            weak_error!(self.control.resume_thread(tid), "resume thread:");
        }
    }
}

/// Memory wrapper that fails the first large write after writing only half of it.
pub struct PartialWriteInjector<'a> {
    inner: &'a dyn RemoteMemory,
    fired: &'a Cell<bool>,
}

impl<'a> PartialWriteInjector<'a> {
    /// Writes bigger than this are eligible for a simulated partial write.
    const MIN_SIZE: usize = 8;

    pub fn new(inner: &'a dyn RemoteMemory, fired: &'a Cell<bool>) -> Self {
        Self { inner, fired }
    }
}

impl RemoteMemory for PartialWriteInjector<'_> {
    fn pointer_size(&self) -> PointerSize {
        self.inner.pointer_size()
    }

    fn read_memory(&self, addr: RelocatedAddress, buf: &mut [u8]) -> Result<(), Error> {
        self.inner.read_memory(addr, buf)
    }

    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        if data.len() > Self::MIN_SIZE && !self.fired.get() {
            self.fired.set(true);
            let half = &data[..data.len() / 2];
            weak_error!(self.inner.write_memory(addr, half), "simulated partial write:");
            return Err(Error::PartialWrite {
                addr,
                written: half.len(),
                expected: data.len(),
            });
        }
        self.inner.write_memory(addr, data)
    }
}
