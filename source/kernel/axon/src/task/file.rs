// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-task open-file table.
//!
//! File objects themselves belong to the filesystem layer; the kernel core
//! only stores shared handles, duplicates them on `fork` and drops them on
//! `close`/`exit`. The console is the one object implemented here.

use alloc::sync::Arc;

use crate::param::NOFILE;
use crate::uart;

/// Errors raised by file handles and the descriptor table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileError {
    /// Descriptor out of range or not open.
    BadDescriptor,
    /// Every descriptor slot is in use.
    TooManyOpen,
    NotReadable,
    NotWritable,
}

/// An open file as seen by the kernel core.
pub trait FileObject: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> Result<usize, FileError>;
    fn write(&self, buf: &[u8]) -> Result<usize, FileError>;
}

/// The UART console.
pub struct Console;

impl FileObject for Console {
    fn read(&self, buf: &mut [u8]) -> Result<usize, FileError> {
        Ok(uart::read_bytes(buf))
    }

    fn write(&self, buf: &[u8]) -> Result<usize, FileError> {
        uart::write_bytes(buf);
        Ok(buf.len())
    }
}

/// Shared handle stored in a descriptor slot.
pub type FileRef = Arc<dyn FileObject>;

/// Descriptor table of one task.
pub struct FileTable {
    slots: [Option<FileRef>; NOFILE],
}

impl FileTable {
    pub const fn new() -> Self {
        Self { slots: [const { None }; NOFILE] }
    }

    /// Table with descriptors 0, 1 and 2 bound to the console.
    pub fn with_console() -> Self {
        let console: FileRef = Arc::new(Console);
        let mut table = Self::new();
        for slot in table.slots.iter_mut().take(3) {
            *slot = Some(console.clone());
        }
        table
    }

    /// Installs `file` in the lowest free slot.
    pub fn install(&mut self, file: FileRef) -> Result<usize, FileError> {
        let fd = self.slots.iter().position(Option::is_none).ok_or(FileError::TooManyOpen)?;
        self.slots[fd] = Some(file);
        Ok(fd)
    }

    pub fn get(&self, fd: usize) -> Result<FileRef, FileError> {
        self.slots.get(fd).and_then(Clone::clone).ok_or(FileError::BadDescriptor)
    }

    pub fn close(&mut self, fd: usize) -> Result<(), FileError> {
        let slot = self.slots.get_mut(fd).ok_or(FileError::BadDescriptor)?;
        slot.take().map(drop).ok_or(FileError::BadDescriptor)
    }

    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.take();
        }
    }

    /// Copy sharing every open handle, for `fork`.
    pub fn duplicate(&self) -> Self {
        Self { slots: self.slots.clone() }
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}
