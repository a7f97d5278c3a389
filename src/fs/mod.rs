//! Flat in-RAM filesystem.
//!
//! The demand-paging core treats the filesystem as a collaborator; this one
//! keeps a single directory of named inodes, seeded from Multiboot2 modules
//! at boot. Unlink only detaches the name — open handles stay usable.

pub mod file;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;

use lazy_static::lazy_static;
use spin::Mutex;

pub use file::{File, Inode};

lazy_static! {
    static ref ROOT: Mutex<BTreeMap<String, Arc<Inode>>> = Mutex::new(BTreeMap::new());
}

pub fn init() {
    lazy_static::initialize(&ROOT);
}

/// Creates `name` with `size` zero bytes. Fails on empty names and
/// duplicates.
pub fn create(name: &str, size: usize) -> bool {
    if name.is_empty() {
        return false;
    }
    crate::intr::critical(|| {
        let mut root = ROOT.lock();
        if root.contains_key(name) {
            return false;
        }
        root.insert(String::from(name), Inode::new(size));
        true
    })
}

/// Unlinks `name`. Existing handles keep the inode alive.
pub fn remove(name: &str) -> bool {
    crate::intr::critical(|| ROOT.lock().remove(name).is_some())
}

pub fn open(name: &str) -> Option<File> {
    let inode = crate::intr::critical(|| ROOT.lock().get(name).cloned())?;
    Some(File::from_inode(inode))
}

pub fn exists(name: &str) -> bool {
    crate::intr::critical(|| ROOT.lock().contains_key(name))
}

/// Installs (or replaces) `name` with the given contents. Boot-time only.
pub fn install(name: &str, bytes: &[u8]) {
    crate::intr::critical(|| {
        ROOT.lock().insert(String::from(name), Inode::with_data(bytes));
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn create_open_remove() {
        assert!(create("fs-test-a", 64));
        assert!(!create("fs-test-a", 64), "duplicate create must fail");
        assert!(!create("", 1));

        let mut f = open("fs-test-a").expect("created file must open");
        assert_eq!(f.len(), 64);
        assert_eq!(f.write(b"hello"), 5);
        f.seek(0);
        let mut buf = [0u8; 5];
        assert_eq!(f.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");

        assert!(remove("fs-test-a"));
        assert!(open("fs-test-a").is_none());
        // The surviving handle still reads.
        assert_eq!(f.read_at(0, &mut buf), 5);
    }

    #[test_case]
    fn independent_positions_after_reopen() {
        assert!(create("fs-test-b", 16));
        let mut a = open("fs-test-b").unwrap();
        a.write(b"0123456789");
        a.seek(4);
        let mut b = a.reopen();
        assert_eq!(b.tell(), 0);
        let mut one = [0u8; 1];
        b.read(&mut one);
        assert_eq!(one[0], b'0');
        a.read(&mut one);
        assert_eq!(one[0], b'4');
        remove("fs-test-b");
    }

    #[test_case]
    fn writes_stop_at_eof() {
        assert!(create("fs-test-c", 4));
        let f = open("fs-test-c").unwrap();
        assert_eq!(f.write_at(2, b"abcd"), 2);
        assert_eq!(f.write_at(4, b"zz"), 0);
        assert_eq!(f.len(), 4);
        remove("fs-test-c");
    }

    #[test_case]
    fn write_denial_is_counted() {
        assert!(create("fs-test-d", 8));
        let mut a = open("fs-test-d").unwrap();
        let mut b = a.reopen();
        a.deny_write();
        b.deny_write();
        assert_eq!(a.write_at(0, b"x"), 0);
        a.allow_write();
        assert_eq!(b.write_at(0, b"x"), 0, "still denied by b");
        drop(b);
        assert_eq!(a.write_at(0, b"x"), 1);
        remove("fs-test-d");
    }
}
