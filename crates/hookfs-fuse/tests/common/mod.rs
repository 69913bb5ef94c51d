//! Shared helpers for hookfs-fuse integration tests.

pub mod harness;

#[allow(unused_imports)]
pub use harness::*;

use std::path::Path;

/// Assert that a file inside the mount has exactly `expected` as contents.
pub fn assert_file_content(mount: &TestMount, path: &str, expected: &[u8]) {
    let actual = mount
        .read(path)
        .unwrap_or_else(|e| panic!("Failed to read {path}: {e}"));
    assert_eq!(actual, expected, "Content mismatch for {path}");
}

/// Assert that an I/O result failed with `errno`.
pub fn assert_errno<T: std::fmt::Debug>(result: std::io::Result<T>, errno: i32) {
    match result {
        Ok(v) => panic!("Expected errno {errno}, got Ok({v:?})"),
        Err(e) => assert_eq!(e.raw_os_error(), Some(errno), "Unexpected error: {e}"),
    }
}

/// Assert that `path` exists in the backing directory, bypassing the mount.
pub fn assert_backing_exists(mount: &TestMount, path: &str) {
    assert!(
        mount.backing(path).exists(),
        "{} missing from backing directory",
        Path::new(path).display()
    );
}
