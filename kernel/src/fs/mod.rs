/*
 * File System Facade
 *
 * The core treats the file system as a collaborator with a narrow
 * surface: flat names, fixed-size files, per-handle positions, write
 * denial for running executables, and positioned read/write for the
 * lazy loader and mmap write-back. This module provides that surface
 * over RAM-backed inodes.
 *
 * One global sleeping lock (`fs_lock`) serializes file-system work done
 * on behalf of user programs. Every syscall exit path releases it, error
 * or not; holding it across anything that blocks is a bug.
 */

pub mod fd;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

use crate::sync::Lock;

/// On-"disk" file state shared by every handle to it.
pub struct Inode {
    data: Mutex<Vec<u8>>,
    /// While positive, writes through any handle fail. Running
    /// executables hold this so a program cannot be rewritten under
    /// itself.
    deny_write_cnt: AtomicU32,
}

impl Inode {
    fn new(size: usize) -> Arc<Inode> {
        Arc::new(Inode {
            data: Mutex::new(vec![0u8; size]),
            deny_write_cnt: AtomicU32::new(0),
        })
    }

    fn length(&self) -> usize {
        self.data.lock().len()
    }

    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    /// Write into the file without growing it; returns bytes written,
    /// zero when writes are denied.
    fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        if self.deny_write_cnt.load(Ordering::SeqCst) > 0 {
            return 0;
        }
        let mut data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }
}

struct FileHandle {
    inode: Arc<Inode>,
    pos: Mutex<usize>,
    denies_write: AtomicBool,
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        // Closing a handle re-allows writes it had denied.
        if self.denies_write.load(Ordering::SeqCst) {
            self.inode.deny_write_cnt.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// An open file. Clones share the handle (and its position), the way
/// copied pointers to one open file do; `reopen` makes an independent
/// handle instead.
#[derive(Clone)]
pub struct File(Arc<FileHandle>);

impl File {
    fn from_inode(inode: Arc<Inode>) -> File {
        File(Arc::new(FileHandle {
            inode,
            pos: Mutex::new(0),
            denies_write: AtomicBool::new(false),
        }))
    }

    /// A fresh handle to the same file, position zero, no write denial.
    pub fn reopen(&self) -> File {
        File::from_inode(self.0.inode.clone())
    }

    /// True if the two handles name the same underlying file.
    pub fn same_inode(&self, other: &File) -> bool {
        Arc::ptr_eq(&self.0.inode, &other.0.inode)
    }

    pub fn length(&self) -> usize {
        self.0.inode.length()
    }

    /// Read from the handle position, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut pos = self.0.pos.lock();
        let n = self.0.inode.read_at(buf, *pos);
        *pos += n;
        n
    }

    /// Write at the handle position, advancing it. Returns bytes
    /// written; zero when the file is write-denied or full.
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut pos = self.0.pos.lock();
        let n = self.0.inode.write_at(buf, *pos);
        *pos += n;
        n
    }

    /// Positioned read; the handle position is unaffected.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        self.0.inode.read_at(buf, offset)
    }

    /// Positioned write; the handle position is unaffected.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        self.0.inode.write_at(buf, offset)
    }

    pub fn seek(&self, pos: usize) {
        *self.0.pos.lock() = pos;
    }

    pub fn tell(&self) -> usize {
        *self.0.pos.lock()
    }

    /// Deny writes to the underlying file for this handle's lifetime.
    pub fn deny_write(&self) {
        if !self.0.denies_write.swap(true, Ordering::SeqCst) {
            self.0.inode.deny_write_cnt.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Re-allow writes denied through this handle.
    pub fn allow_write(&self) {
        if self.0.denies_write.swap(false, Ordering::SeqCst) {
            self.0.inode.deny_write_cnt.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// The flat root directory.
pub struct FileSys {
    files: Mutex<BTreeMap<String, Arc<Inode>>>,
}

impl FileSys {
    pub fn new() -> FileSys {
        FileSys { files: Mutex::new(BTreeMap::new()) }
    }

    /// Create a file of `size` zero bytes. False if the name exists.
    pub fn create(&self, name: &str, size: usize) -> bool {
        if name.is_empty() {
            return false;
        }
        let mut files = self.files.lock();
        if files.contains_key(name) {
            return false;
        }
        files.insert(String::from(name), Inode::new(size));
        true
    }

    /// Unlink a file. Existing handles keep working; the storage goes
    /// away with the last of them.
    pub fn remove(&self, name: &str) -> bool {
        self.files.lock().remove(name).is_some()
    }

    pub fn open(&self, name: &str) -> Option<File> {
        let inode = self.files.lock().get(name).cloned()?;
        Some(File::from_inode(inode))
    }
}

impl Default for FileSys {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref FILESYS: FileSys = FileSys::new();
    static ref FS_LOCK: Lock = Lock::new();
}

/// The global file system.
pub fn root() -> &'static FileSys {
    &FILESYS
}

/// The global file-system lock. Ordered after the child-list lock and
/// before the page-table lock.
pub fn fs_lock() -> &'static Lock {
    &FS_LOCK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_read_write() {
        let fs = FileSys::new();
        assert!(fs.create("alpha", 16));
        assert!(!fs.create("alpha", 16));
        assert!(fs.open("missing").is_none());

        let f = fs.open("alpha").unwrap();
        assert_eq!(f.length(), 16);
        assert_eq!(f.write(b"hello"), 5);
        assert_eq!(f.tell(), 5);

        f.seek(0);
        let mut buf = [0u8; 5];
        assert_eq!(f.read(&mut buf), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn files_do_not_grow() {
        let fs = FileSys::new();
        fs.create("small", 4);
        let f = fs.open("small").unwrap();
        assert_eq!(f.write(b"abcdef"), 4);
        assert_eq!(f.length(), 4);
        assert_eq!(f.write_at(b"x", 9), 0);
    }

    #[test]
    fn positioned_io_leaves_position_alone() {
        let fs = FileSys::new();
        fs.create("f", 8);
        let f = fs.open("f").unwrap();
        f.write_at(b"zz", 6);
        assert_eq!(f.tell(), 0);

        let mut buf = [0u8; 2];
        assert_eq!(f.read_at(&mut buf, 6), 2);
        assert_eq!(&buf, b"zz");
        assert_eq!(f.tell(), 0);
    }

    #[test]
    fn deny_write_blocks_all_handles_until_closed() {
        let fs = FileSys::new();
        fs.create("exe", 8);
        let running = fs.open("exe").unwrap();
        running.deny_write();

        let other = fs.open("exe").unwrap();
        assert_eq!(other.write(b"nope"), 0);

        // Dropping the denying handle re-enables writes.
        drop(running);
        assert_eq!(other.write(b"yes!"), 4);
    }

    #[test]
    fn reopen_has_its_own_position() {
        let fs = FileSys::new();
        fs.create("f", 8);
        let a = fs.open("f").unwrap();
        a.write(b"abcd");

        let b = a.reopen();
        assert!(a.same_inode(&b));
        assert_eq!(b.tell(), 0);

        // A clone, by contrast, shares the position.
        let c = a.clone();
        assert_eq!(c.tell(), 4);
    }

    #[test]
    fn removal_keeps_open_handles_alive() {
        let fs = FileSys::new();
        fs.create("doomed", 4);
        let f = fs.open("doomed").unwrap();
        assert!(fs.remove("doomed"));
        assert!(!fs.remove("doomed"));
        assert!(fs.open("doomed").is_none());

        assert_eq!(f.write(b"ok"), 2);
        f.seek(0);
        let mut buf = [0u8; 2];
        assert_eq!(f.read(&mut buf), 2);
        assert_eq!(&buf, b"ok");
    }
}
