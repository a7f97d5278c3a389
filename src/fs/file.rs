//! Open-file handles over in-RAM inodes.
//!
//! An [`Inode`] is shared by every handle open on it; unlinking removes the
//! directory entry only, so handles keep working until the last `Arc`
//! drops. Files never grow past their created size: writes stop at EOF,
//! like the original filesystem's fixed-extent files.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

pub struct Inode {
    data: Mutex<Vec<u8>>,
    /// Non-zero while some executable is running from this inode.
    deny_write: AtomicUsize,
}

impl Inode {
    pub fn new(size: usize) -> Arc<Inode> {
        Arc::new(Inode {
            data: Mutex::new(vec![0; size]),
            deny_write: AtomicUsize::new(0),
        })
    }

    pub fn with_data(bytes: &[u8]) -> Arc<Inode> {
        Arc::new(Inode {
            data: Mutex::new(bytes.to_vec()),
            deny_write: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        crate::intr::critical(|| self.data.lock().len())
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        crate::intr::critical(|| {
            let data = self.data.lock();
            if offset >= data.len() {
                return 0;
            }
            let n = buf.len().min(data.len() - offset);
            buf[..n].copy_from_slice(&data[offset..offset + n]);
            n
        })
    }

    /// Writes up to EOF; returns bytes written, 0 while writes are denied.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        if self.deny_write.load(Ordering::Acquire) > 0 {
            return 0;
        }
        crate::intr::critical(|| {
            let mut data = self.data.lock();
            if offset >= data.len() {
                return 0;
            }
            let n = buf.len().min(data.len() - offset);
            data[offset..offset + n].copy_from_slice(&buf[..n]);
            n
        })
    }
}

/// One open file: a shared inode plus a private position.
pub struct File {
    inode: Arc<Inode>,
    pos: usize,
    denies_write: bool,
}

impl File {
    pub fn from_inode(inode: Arc<Inode>) -> File {
        File {
            inode,
            pos: 0,
            denies_write: false,
        }
    }

    /// A fresh handle on the same inode, position reset. The write-denial
    /// state of this handle is not inherited.
    pub fn reopen(&self) -> File {
        File::from_inode(self.inode.clone())
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn len(&self) -> usize {
        self.inode.len()
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.inode.read_at(self.pos, buf);
        self.pos += n;
        n
    }

    pub fn write(&mut self, buf: &[u8]) -> usize {
        let n = self.inode.write_at(self.pos, buf);
        self.pos += n;
        n
    }

    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        self.inode.read_at(offset, buf)
    }

    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        self.inode.write_at(offset, buf)
    }

    /// Blocks writes to the underlying inode until this handle allows them
    /// again (or is dropped). Used on running executables.
    pub fn deny_write(&mut self) {
        if !self.denies_write {
            self.denies_write = true;
            self.inode.deny_write.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn allow_write(&mut self) {
        if self.denies_write {
            self.denies_write = false;
            self.inode.deny_write.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.allow_write();
    }
}
