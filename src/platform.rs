// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

//! Platform services: randomness, time, cancellation, firmware secrets and
//! the non-volatile backing store.

use crate::error::TpmRcBase;
use log::warn;
use rand::RngCore;
use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};
use zeroize::Zeroizing;

/// Services the engine obtains from its host.
pub trait Platform: Send {
    /// Fills `buf` with random bytes.
    fn random(&mut self, buf: &mut [u8]);

    /// Milliseconds from an arbitrary, monotonically increasing origin.
    fn monotonic_ms(&self) -> u64;

    /// Returns `true` when the host asks a long-running command to stop.
    fn cancel_requested(&self) -> bool {
        false
    }

    /// The secret bound to the current firmware, if the platform has one.
    fn firmware_secret(&self) -> Option<Zeroizing<Vec<u8>>>;

    /// Security version number of the running firmware.
    fn firmware_svn(&self) -> u16;

    /// The secret bound to `svn`. Must be `None` for a version newer than
    /// the running firmware.
    fn svn_secret(&self, svn: u16) -> Option<Zeroizing<Vec<u8>>>;
}

/// Host implementation backed by the thread RNG and `Instant`.
pub struct StdPlatform {
    origin: Instant,
    firmware_secret: Option<Zeroizing<Vec<u8>>>,
    firmware_svn: u16,
}

impl StdPlatform {
    #[must_use]
    pub fn new(firmware_secret: Option<Vec<u8>>, firmware_svn: u16) -> Self {
        Self {
            origin: Instant::now(),
            firmware_secret: firmware_secret.map(Zeroizing::new),
            firmware_svn,
        }
    }
}

impl Default for StdPlatform {
    fn default() -> Self {
        Self::new(None, 0)
    }
}

fn derive_svn_secret(base: &[u8], svn: u16) -> Zeroizing<Vec<u8>> {
    let mut secret = Zeroizing::new(base.to_vec());
    secret.extend_from_slice(&svn.to_be_bytes());
    secret
}

impl Platform for StdPlatform {
    fn random(&mut self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }

    fn monotonic_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn firmware_secret(&self) -> Option<Zeroizing<Vec<u8>>> {
        self.firmware_secret.clone()
    }

    fn firmware_svn(&self) -> u16 {
        self.firmware_svn
    }

    fn svn_secret(&self, svn: u16) -> Option<Zeroizing<Vec<u8>>> {
        if svn > self.firmware_svn {
            return None;
        }
        self.firmware_secret
            .as_ref()
            .map(|base| derive_svn_secret(base, svn))
    }
}

/// Remote control of a [`SimulatedPlatform`] after it has been moved into
/// an engine.
#[derive(Debug, Clone, Default)]
pub struct PlatformControl {
    clock_ms: Arc<AtomicU64>,
    cancel: Arc<AtomicBool>,
}

impl PlatformControl {
    pub fn advance(&self, ms: u64) {
        self.clock_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance(secs.saturating_mul(1000));
    }

    pub fn set_cancel(&self, cancel: bool) {
        self.cancel.store(cancel, Ordering::SeqCst);
    }

    #[must_use]
    pub fn now(&self) -> u64 {
        self.clock_ms.load(Ordering::SeqCst)
    }
}

/// Platform with a manually driven clock and cancel flag.
pub struct SimulatedPlatform {
    control: PlatformControl,
    firmware_secret: Option<Zeroizing<Vec<u8>>>,
    firmware_svn: u16,
}

impl SimulatedPlatform {
    #[must_use]
    pub fn new(firmware_secret: Option<Vec<u8>>, firmware_svn: u16) -> Self {
        Self {
            control: PlatformControl::default(),
            firmware_secret: firmware_secret.map(Zeroizing::new),
            firmware_svn,
        }
    }

    #[must_use]
    pub fn control(&self) -> PlatformControl {
        self.control.clone()
    }
}

impl Platform for SimulatedPlatform {
    fn random(&mut self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }

    fn monotonic_ms(&self) -> u64 {
        self.control.now()
    }

    fn cancel_requested(&self) -> bool {
        self.control.cancel.load(Ordering::SeqCst)
    }

    fn firmware_secret(&self) -> Option<Zeroizing<Vec<u8>>> {
        self.firmware_secret.clone()
    }

    fn firmware_svn(&self) -> u16 {
        self.firmware_svn
    }

    fn svn_secret(&self, svn: u16) -> Option<Zeroizing<Vec<u8>>> {
        if svn > self.firmware_svn {
            return None;
        }
        self.firmware_secret
            .as_ref()
            .map(|base| derive_svn_secret(base, svn))
    }
}

/// Byte-addressed persistent storage under the NV image.
pub trait NvBacking: Send {
    /// Size of the backing store in bytes.
    fn size(&self) -> usize;

    /// # Errors
    ///
    /// Returns `TpmRcBase::NvUnavailable` when the store cannot be read.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), TpmRcBase>;

    /// Writes `data` at `offset` and makes it durable before returning.
    ///
    /// # Errors
    ///
    /// Returns `TpmRcBase::NvUnavailable` when the store cannot be written.
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), TpmRcBase>;

    fn available(&self) -> bool {
        true
    }
}

/// RAM backing store with a switch that makes it unavailable.
pub struct MemoryNv {
    data: Vec<u8>,
    available: Arc<AtomicBool>,
}

impl MemoryNv {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Returns the availability switch, `false` fails every access.
    #[must_use]
    pub fn availability(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.available)
    }
}

impl NvBacking for MemoryNv {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), TpmRcBase> {
        if !self.available() {
            return Err(TpmRcBase::NvUnavailable);
        }
        let src = self
            .data
            .get(offset..offset + buf.len())
            .ok_or(TpmRcBase::NvUnavailable)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), TpmRcBase> {
        if !self.available() {
            return Err(TpmRcBase::NvUnavailable);
        }
        let dst = self
            .data
            .get_mut(offset..offset + data.len())
            .ok_or(TpmRcBase::NvUnavailable)?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

/// File backing store. The file is created zero-filled on first use.
pub struct FileNv {
    path: PathBuf,
    file: File,
    size: usize,
}

impl FileNv {
    /// Opens or creates the NV file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be opened or sized.
    pub fn open(path: &Path, size: usize) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        let wanted = u64::try_from(size).unwrap_or(u64::MAX);
        if len < wanted {
            file.set_len(wanted)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
            size,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn seek(&mut self, offset: usize) -> std::io::Result<()> {
        let offset = u64::try_from(offset).unwrap_or(u64::MAX);
        self.file.seek(SeekFrom::Start(offset)).map(|_| ())
    }
}

impl NvBacking for FileNv {
    fn size(&self) -> usize {
        self.size
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), TpmRcBase> {
        let mut file = self.file.try_clone().map_err(|_| TpmRcBase::NvUnavailable)?;
        let offset = u64::try_from(offset).map_err(|_| TpmRcBase::NvUnavailable)?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| {
                warn!(target: "tpm2sim::nv", "{}: {e}", self.path.display());
                TpmRcBase::NvUnavailable
            })
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), TpmRcBase> {
        if offset + data.len() > self.size {
            return Err(TpmRcBase::NvUnavailable);
        }
        self.seek(offset)
            .and_then(|()| self.file.write_all(data))
            .and_then(|()| self.file.sync_data())
            .map_err(|e| {
                warn!(target: "tpm2sim::nv", "{}: {e}", self.path.display());
                TpmRcBase::NvUnavailable
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_nv_unavailable() {
        let mut nv = MemoryNv::new(16);
        nv.write(0, &[1, 2, 3]).unwrap();
        nv.availability().store(false, Ordering::SeqCst);
        assert_eq!(nv.write(0, &[4]), Err(TpmRcBase::NvUnavailable));
        nv.availability().store(true, Ordering::SeqCst);
        let mut buf = [0u8; 3];
        nv.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_svn_secret_limited() {
        let platform = SimulatedPlatform::new(Some(vec![1; 32]), 4);
        assert!(platform.svn_secret(4).is_some());
        assert!(platform.svn_secret(5).is_none());
    }

    #[test]
    fn test_file_nv_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nv.bin");
        {
            let mut nv = FileNv::open(&path, 64).unwrap();
            nv.write(8, b"tpm").unwrap();
        }
        let nv = FileNv::open(&path, 64).unwrap();
        let mut buf = [0u8; 3];
        nv.read(8, &mut buf).unwrap();
        assert_eq!(&buf, b"tpm");
    }
}
