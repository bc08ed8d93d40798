/*
 * Running-Executable Registry
 *
 * Tracks which executables are currently running and how many processes
 * share each one. All processes running one image read their lazy
 * segments through a single shared handle, and writes to the file stay
 * denied until the last of them exits.
 */

use alloc::collections::BTreeMap;
use alloc::string::String;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::fs::File;

struct ExeEntry {
    running: usize,
    /// Shared read handle; holds the write denial.
    file: File,
}

lazy_static! {
    static ref REGISTRY: Mutex<BTreeMap<String, ExeEntry>> = Mutex::new(BTreeMap::new());
}

/// Register a process running `name`. Opens and write-denies the image
/// on first use; later registrations share the same handle. None if the
/// file does not exist.
pub fn checkout(name: &str) -> Option<File> {
    let mut reg = REGISTRY.lock();
    if let Some(entry) = reg.get_mut(name) {
        entry.running += 1;
        return Some(entry.file.clone());
    }
    let file = crate::fs::root().open(name)?;
    file.deny_write();
    let handle = file.clone();
    reg.insert(String::from(name), ExeEntry { running: 1, file });
    Some(handle)
}

/// A process running `name` exited. When the last one goes, the handle
/// drops and writes to the image are allowed again.
pub fn release(name: &str) {
    let mut reg = REGISTRY.lock();
    let Some(entry) = reg.get_mut(name) else {
        log::warn!("release of unregistered executable '{}'", name);
        return;
    };
    entry.running -= 1;
    if entry.running == 0 {
        reg.remove(name);
    }
}

/// Number of processes currently running `name`.
pub fn running_count(name: &str) -> usize {
    REGISTRY.lock().get(name).map_or(0, |e| e.running)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_checkout_denies_writes_until_last_release() {
        let _serial = crate::test_sync::lock();
        let name = "exe-registry-test";
        crate::fs::root().create(name, 16);

        let a = checkout(name).unwrap();
        let b = checkout(name).unwrap();
        assert!(a.same_inode(&b));
        assert_eq!(running_count(name), 2);

        // Write-denied while anything runs it.
        let writer = crate::fs::root().open(name).unwrap();
        assert_eq!(writer.write(b"x"), 0);

        release(name);
        drop(a);
        drop(b);
        assert_eq!(writer.write(b"x"), 0, "still running once");

        release(name);
        assert_eq!(running_count(name), 0);
        assert_eq!(writer.write(b"x"), 1);

        crate::fs::root().remove(name);
    }

    #[test]
    fn checkout_of_missing_file_fails() {
        let _serial = crate::test_sync::lock();
        assert!(checkout("no-such-image").is_none());
    }
}
