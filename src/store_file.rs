//! Main module for the store engine.  This owns the backing file: opening and initial
//! allocation, the status machine that admits operations, the advisory exclusive lock
//! that serializes writers across processes, and the low-level record primitives
//! (read/write at offset, append with bounded retries) every flavor builds on.
//!
//! One file serves many unrelated processes.  Nothing here assumes it is the only
//! writer- every admission re-reads the status byte, every append re-seeks to the end,
//! and partially created files are detected and rebuilt via the status machine.

use crate::error::{LoadHeaderError, OpenError, StatusError};
use crate::store_config::StoreConfig;
use crate::store_file::header::{FileHeader, Status, FILE_HEADER_LEN};
use crate::BUCKET_COUNT;
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod header;

/// Guard prefix written when the store lives at a path a web server might execute.
/// Requests for the file then terminate immediately instead of leaking the contents.
const SCRIPT_GUARD: &[u8; 13] = b"<?php exit();";

/// Path extension that activates the script guard.
const GUARD_EXT: &str = "php";

/// Bucket slots zeroed per write during initial allocation.  Chunked so a crashed
/// creation leaves a short file that the status machine can detect and rebuild.
const CREATE_CHUNK_SLOTS: usize = 16 * 1024;

/// Retry budget for short appends.
const APPEND_RETRIES: u32 = 100;

/// Retry budget and sleep while another process finishes creating the file.
const CREATE_RETRIES: u32 = 100;
const CREATE_SLEEP: Duration = Duration::from_millis(20);

/// Retry budget and sleep while a compactor renames the file aside.
const OPTIMIZE_RETRIES: u32 = 30;
const OPTIMIZE_SLEEP: Duration = Duration::from_millis(100);

/// Current time as epoch seconds, saturating into the header's u32.
pub(crate) fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
        .min(u32::MAX as u64) as u32
}

/// An open handle on one store file.
///
/// The same type serves the live store and, during compaction, the renamed old store
/// (see [`StoreFile::open_old`]).  Old-store handles bypass the status machine- the
/// compactor owns that file and ordinary processes only consult it directly.
pub(crate) struct StoreFile {
    config: StoreConfig,
    path: PathBuf,
    file: Option<File>,
    prefix: u64,
}

impl StoreFile {
    /// Open the store file at the configured path, allocating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, OpenError> {
        if config.path.as_os_str().is_empty() {
            return Err(OpenError::Config("no store path set".to_string()));
        }
        let prefix = if has_guard_ext(&config.path) {
            SCRIPT_GUARD.len() as u64
        } else {
            0
        };
        let path = config.path.clone();
        let mut store = Self {
            config,
            path,
            file: None,
            prefix,
        };
        let full_size = store.full_size();
        let len = store.ensure_open()?.metadata()?.len();
        if len < full_size {
            store.recreate()?;
        }
        Ok(store)
    }

    /// Configuration this handle was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Path of the file this handle serves.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when warnings should be suppressed.
    pub fn quiet(&self) -> bool {
        self.config.quiet
    }

    /// Path of the renamed old store during compaction.
    pub fn op_path(&self) -> PathBuf {
        append_extension(&self.config.path, "op")
    }

    /// Path of the rename gate file.
    pub fn lock_path(&self) -> PathBuf {
        append_extension(&self.config.path, "lock")
    }

    /// True while some process is compacting this store.  The old store's presence is
    /// the authoritative signal- it exists exactly for the duration of a compaction.
    pub fn is_optimizing(&self) -> bool {
        self.op_path().exists()
    }

    /// File offset of a bucket's head-pointer slot.
    pub fn bucket_offset(&self, bucket: u32) -> u64 {
        self.prefix + FILE_HEADER_LEN + bucket as u64 * 4
    }

    /// Size of the fixed regions (guard, header, bucket array).  The record heap starts
    /// here and a shorter file is a failed creation.
    pub fn full_size(&self) -> u64 {
        self.prefix + FILE_HEADER_LEN + BUCKET_COUNT as u64 * 4
    }

    /// Close the handle, releasing all OS references so another process can rename the
    /// file.  The next operation reopens it.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// A second handle on the same file, for iterators that must not disturb the main
    /// handle's cursor discipline.
    pub fn duplicate(&mut self) -> Result<StoreFile, io::Error> {
        let file = self.ensure_open()?.try_clone()?;
        Ok(StoreFile {
            config: self.config.clone(),
            path: self.path.clone(),
            file: Some(file),
            prefix: self.prefix,
        })
    }

    /// Open the renamed old store if a compaction is in progress.  Pass write for the
    /// cooperation paths that mutate it (remove/expire/drop and list migration).
    pub fn open_old(&self, write: bool) -> Option<StoreFile> {
        let op_path = self.op_path();
        let file = OpenOptions::new()
            .read(true)
            .write(write)
            .open(&op_path)
            .ok()?;
        Some(StoreFile {
            config: self.config.clone(),
            path: op_path,
            file: Some(file),
            prefix: self.prefix,
        })
    }

    /// Admit an operation through the status machine, re-reading the status byte and
    /// resolving transitional states first.  Writes wait out transitions within the
    /// bounded budgets; reads fail fast so callers never block without the lock.
    pub fn admit(&mut self, write: bool) -> Result<(), StatusError> {
        let full_size = self.full_size();
        let mut create_tries = 0;
        let mut optimize_tries = 0;
        loop {
            let len = self.ensure_open()?.metadata()?.len();
            if len < full_size {
                // Empty or truncated file.  During a compaction's rename window the
                // path can transiently hold a fresh empty file- wait for the gate to
                // clear instead of fighting the compactor over creation.
                if self.lock_path().exists() {
                    optimize_tries += 1;
                    if optimize_tries > OPTIMIZE_RETRIES {
                        return Err(StatusError::Busy);
                    }
                    self.close();
                    thread::sleep(OPTIMIZE_SLEEP);
                    continue;
                }
                self.recreate()?;
                continue;
            }
            match self.read_status()? {
                Status::Normal => return Ok(()),
                Status::Clearing => {
                    // clear() ran; rebuild the file from scratch.
                    self.recreate()?;
                    continue;
                }
                Status::Creating => {
                    if !write {
                        return Err(StatusError::Busy);
                    }
                    create_tries += 1;
                    if create_tries > CREATE_RETRIES {
                        return Err(StatusError::Busy);
                    }
                    thread::sleep(CREATE_SLEEP);
                    continue;
                }
                Status::WaitOptimize => {
                    if !self.lock_path().exists() {
                        // Stale marker from a crashed compactor; force it back.
                        self.write_status(Status::Normal)?;
                        continue;
                    }
                    // A rename is pending; release our OS references so it can
                    // proceed, then come back for the recreated store.
                    self.close();
                    optimize_tries += 1;
                    if optimize_tries > OPTIMIZE_RETRIES {
                        return Err(StatusError::Busy);
                    }
                    thread::sleep(OPTIMIZE_SLEEP);
                    continue;
                }
            }
        }
    }

    /// Take the exclusive advisory lock on the whole file.  Blocks until granted; every
    /// writer in every process takes this lock for its full critical section.
    pub fn lock(&mut self) -> Result<(), io::Error> {
        self.ensure_open()?.lock_exclusive()
    }

    /// Admit through the status machine and take the exclusive lock, re-verifying the
    /// status byte once the lock is granted.  A compactor announces itself (status 3)
    /// before renaming the file, so a handle that admitted just ahead of the
    /// announcement finds out here, backs off and re-admits instead of writing into a
    /// file that is about to be renamed away.
    pub fn lock_admitted(&mut self, write: bool) -> Result<(), StatusError> {
        loop {
            self.admit(write)?;
            self.lock()?;
            match self.read_status() {
                Ok(Status::Normal) => return Ok(()),
                Ok(_) => {
                    self.unlock();
                    continue;
                }
                Err(e) => {
                    self.unlock();
                    return Err(e);
                }
            }
        }
    }

    /// Release the exclusive lock.  A failed unlock is only warned about- the OS drops
    /// the lock with the handle in the worst case.
    pub fn unlock(&mut self) {
        if let Some(file) = &self.file {
            if let Err(e) = FileExt::unlock(file) {
                if !self.config.quiet {
                    tracing::warn!("failed to unlock store file: {}", e);
                }
            }
        }
    }

    /// Rebuild the file from scratch under the exclusive lock: guard prefix, header
    /// (status creating), zeroed bucket array in chunks, then status normal.  Rechecks
    /// the need under the lock so racing processes create only once.
    pub fn recreate(&mut self) -> Result<(), StatusError> {
        let full_size = self.full_size();
        self.lock()?;
        let res = (|| -> Result<(), StatusError> {
            let len = self.ensure_open()?.metadata()?.len();
            let needed = if len < full_size {
                true
            } else {
                self.read_status()? == Status::Clearing
            };
            if needed {
                self.create_layout()?;
            }
            Ok(())
        })();
        self.unlock();
        res
    }

    fn create_layout(&mut self) -> Result<(), io::Error> {
        let prefix = self.prefix;
        let file = self.ensure_open()?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        if prefix > 0 {
            file.write_all(SCRIPT_GUARD)?;
        }
        file.write_all(&FileHeader::new(unix_now()).store())?;
        let chunk = vec![0_u8; CREATE_CHUNK_SLOTS * 4];
        let mut remaining = BUCKET_COUNT as usize * 4;
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            file.write_all(&chunk[..n])?;
            remaining -= n;
        }
        self.write_status(Status::Normal)?;
        Ok(())
    }

    fn ensure_open(&mut self) -> Result<&mut File, io::Error> {
        if self.file.is_none() {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)?;
            // Read at least one byte before any lock or write- some platforms refuse
            // to lock a fresh, unread handle.  The status byte exists for this.
            let mut test = [0_u8; 1];
            let _ = file.read(&mut test);
            self.file = Some(file);
        }
        Ok(self.file.as_mut().expect("just opened"))
    }

    fn file_mut(&mut self) -> Result<&mut File, io::Error> {
        self.ensure_open()
    }

    // ----- primitives ---------------------------------------------------------------

    /// Read a little-endian u32 at pos.
    pub fn read_u32(&mut self, pos: u64) -> Result<u32, io::Error> {
        let mut buf = [0_u8; 4];
        self.read_exact_at(pos, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write a little-endian u32 at pos.
    pub fn write_u32(&mut self, pos: u64, value: u32) -> Result<(), io::Error> {
        self.write_all_at(pos, &value.to_le_bytes())
    }

    /// Fill buf from the file starting at pos.
    pub fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<(), io::Error> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(buf)
    }

    /// Write all of buf at pos.
    pub fn write_all_at(&mut self, pos: u64, buf: &[u8]) -> Result<(), io::Error> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(buf)
    }

    /// Append bytes at end of file and return the offset they landed at.  Short writes
    /// are continued from the bytes actually written, up to the retry budget.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u32, io::Error> {
        let file = self.file_mut()?;
        let pos = file.seek(SeekFrom::End(0))?;
        if pos + bytes.len() as u64 > u32::MAX as u64 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "store file exceeds the 4 GiB offset limit",
            ));
        }
        let mut written = 0;
        let mut tries = 0;
        while written < bytes.len() {
            match file.write(&bytes[written..]) {
                Ok(0) => {
                    tries += 1;
                    if tries > APPEND_RETRIES {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "append made no progress",
                        ));
                    }
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    tries += 1;
                    if tries > APPEND_RETRIES {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(pos as u32)
    }

    // ----- global header ------------------------------------------------------------

    /// Load the global header.
    pub fn read_header(&mut self) -> Result<FileHeader, LoadHeaderError> {
        let mut buf = [0_u8; FILE_HEADER_LEN as usize];
        self.read_exact_at(self.prefix, &mut buf)?;
        FileHeader::load(&buf)
    }

    /// Store a complete global header.
    pub fn write_header(&mut self, header: &FileHeader) -> Result<(), io::Error> {
        self.write_all_at(self.prefix, &header.store())
    }

    /// Read just the status byte.
    pub fn read_status(&mut self) -> Result<Status, StatusError> {
        let mut buf = [0_u8; 1];
        self.read_exact_at(self.prefix, &mut buf)?;
        Ok(Status::from_byte(buf[0])?)
    }

    /// Write just the status byte.
    pub fn write_status(&mut self, status: Status) -> Result<(), io::Error> {
        self.write_all_at(self.prefix, &[status.to_byte()])
    }

    /// Write just the optimized flag byte.
    pub fn write_optimized(&mut self, optimized: bool) -> Result<(), io::Error> {
        self.write_all_at(self.prefix + 1, &[if optimized { b'1' } else { b'0' }])
    }

    /// Bump the live-record count.  Caller holds the exclusive lock.
    pub fn increase_count(&mut self) -> Result<(), io::Error> {
        let count = self.read_u32(self.prefix + 6)?;
        self.write_u32(self.prefix + 6, count.saturating_add(1))
    }

    /// Drop the live-record count, clamped at zero.  Caller holds the exclusive lock.
    pub fn decrease_count(&mut self) -> Result<(), io::Error> {
        let count = self.read_u32(self.prefix + 6)?;
        if count == 0 {
            if !self.config.quiet {
                tracing::warn!("record count underflow clamped at zero");
            }
            return Ok(());
        }
        self.write_u32(self.prefix + 6, count - 1)
    }

    /// Mark the store cleared.  The next operation from any process rebuilds an empty
    /// file.  If a compaction is running the old store is marked too, which the
    /// compactor treats as "abort, the store is empty now".
    pub fn clear(&mut self) -> Result<(), StatusError> {
        self.lock_admitted(true)?;
        let res = self.write_status(Status::Clearing).map_err(StatusError::IO);
        self.unlock();
        if let Some(mut old) = self.open_old(true) {
            if let Err(e) = old.write_status(Status::Clearing) {
                if !self.config.quiet {
                    tracing::warn!("failed to mark old store cleared: {}", e);
                }
            }
        }
        res
    }
}

fn has_guard_ext(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case(GUARD_EXT))
        .unwrap_or(false)
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_os_string();
    os.push(".");
    os.push(ext);
    PathBuf::from(os)
}
