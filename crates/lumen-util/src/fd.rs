//! File descriptor identity helpers

use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::MetadataExt;

/// Kernel identity of the object behind a file descriptor.
///
/// Two descriptors with equal identities refer to the same open file even
/// when their numeric values differ, as happens after passing them over a
/// socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdIdentity {
    pub device: u64,
    pub inode: u64,
}

impl FdIdentity {
    pub fn of(fd: impl AsFd) -> io::Result<Self> {
        let file = File::from(fd.as_fd().try_clone_to_owned()?);
        let metadata = file.metadata()?;
        Ok(Self {
            device: metadata.dev(),
            inode: metadata.ino(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicated_descriptor_has_same_identity() {
        let file = tempfile::tempfile().unwrap();
        let dup = file.try_clone().unwrap();
        assert_eq!(FdIdentity::of(&file).unwrap(), FdIdentity::of(&dup).unwrap());
    }

    #[test]
    fn distinct_files_differ() {
        let a = tempfile::tempfile().unwrap();
        let b = tempfile::tempfile().unwrap();
        assert_ne!(FdIdentity::of(&a).unwrap(), FdIdentity::of(&b).unwrap());
    }
}
