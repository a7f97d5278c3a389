//! Per-process file descriptor tables.
//!
//! Slots 0 and 1 are non-closable aliases of the keyboard and the console.
//! `dup2` makes two descriptors share one open file (offset included);
//! fork instead *reopens* every entry so positions diverge afterwards.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::fs::File;

pub const FD_CAPACITY: usize = 1024;

#[derive(Clone)]
pub enum FdEntry {
    Stdin,
    Stdout,
    File(Arc<Mutex<File>>),
}

pub struct FdTable {
    slots: Vec<Option<FdEntry>>,
}

impl FdTable {
    pub fn new() -> KernelResult<FdTable> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(FD_CAPACITY)
            .map_err(|_| KernelError::FdTableFull)?;
        slots.resize_with(FD_CAPACITY, || None);
        slots[0] = Some(FdEntry::Stdin);
        slots[1] = Some(FdEntry::Stdout);
        Ok(FdTable { slots })
    }

    pub fn get(&self, fd: usize) -> Option<FdEntry> {
        self.slots.get(fd)?.clone()
    }

    /// Puts `file` in the lowest free slot at or above 2.
    pub fn install(&mut self, file: File) -> KernelResult<usize> {
        let entry = FdEntry::File(Arc::new(Mutex::new(file)));
        for (fd, slot) in self.slots.iter_mut().enumerate().skip(2) {
            if slot.is_none() {
                *slot = Some(entry);
                return Ok(fd);
            }
        }
        Err(KernelError::FdTableFull)
    }

    /// `dup2`: re-points `new_fd` at whatever `old_fd` holds. The shared
    /// open file keeps one offset for both descriptors.
    pub fn dup2(&mut self, old_fd: usize, new_fd: usize) -> KernelResult<usize> {
        if old_fd >= FD_CAPACITY || new_fd >= FD_CAPACITY {
            return Err(KernelError::BadFd);
        }
        let entry = self.get(old_fd).ok_or(KernelError::BadFd)?;
        if old_fd != new_fd {
            self.slots[new_fd] = Some(entry);
        }
        Ok(new_fd)
    }

    pub fn close(&mut self, fd: usize) -> KernelResult<()> {
        if fd < 2 || fd >= FD_CAPACITY {
            // fd 0 and 1 are permanent aliases.
            return Err(KernelError::BadFd);
        }
        match self.slots[fd].take() {
            Some(_) => Ok(()),
            None => Err(KernelError::BadFd),
        }
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    /// Fork-time copy: every open file is independently reopened at the
    /// parent's current position.
    pub fn duplicate_for_fork(&self) -> KernelResult<FdTable> {
        let mut table = FdTable::new()?;
        for (fd, slot) in self.slots.iter().enumerate() {
            let dup = match slot {
                None => None,
                Some(FdEntry::Stdin) => Some(FdEntry::Stdin),
                Some(FdEntry::Stdout) => Some(FdEntry::Stdout),
                Some(FdEntry::File(shared)) => {
                    let dup = crate::intr::critical(|| {
                        let f = shared.lock();
                        let mut copy = f.reopen();
                        copy.seek(f.tell());
                        copy
                    });
                    Some(FdEntry::File(Arc::new(Mutex::new(dup))))
                }
            };
            table.slots[fd] = dup;
        }
        Ok(table)
    }
}
