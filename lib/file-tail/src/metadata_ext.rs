//! Portable access to the OS-level file identity used by [`crate::FileId`].
//!
//! Unix exposes device and inode through `MetadataExt`. Windows needs
//! `GetFileInformationByHandle`, which reports the volume serial number and
//! the file index pair that survive renames the same way an inode does.

use std::fs::File;
#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

#[cfg(windows)]
use winapi::um::fileapi::{GetFileInformationByHandle, BY_HANDLE_FILE_INFORMATION};

#[cfg(not(windows))]
pub trait PortableFileExt {
    fn portable_dev(&self) -> std::io::Result<u64>;
    fn portable_ino(&self) -> std::io::Result<u64>;
}

#[cfg(windows)]
pub trait PortableFileExt: std::os::windows::io::AsRawHandle {
    fn portable_dev(&self) -> std::io::Result<u64>;
    fn portable_ino(&self) -> std::io::Result<u64>;

    fn get_file_info(&self) -> std::io::Result<BY_HANDLE_FILE_INFORMATION> {
        unsafe {
            let mut info: BY_HANDLE_FILE_INFORMATION = std::mem::zeroed();
            if GetFileInformationByHandle(self.as_raw_handle(), &mut info) == 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(info)
        }
    }
}

#[cfg(unix)]
impl PortableFileExt for File {
    fn portable_dev(&self) -> std::io::Result<u64> {
        Ok(self.metadata()?.dev())
    }

    fn portable_ino(&self) -> std::io::Result<u64> {
        Ok(self.metadata()?.ino())
    }
}

#[cfg(windows)]
impl PortableFileExt for File {
    fn portable_dev(&self) -> std::io::Result<u64> {
        let info = self.get_file_info()?;
        Ok(info.dwVolumeSerialNumber.into())
    }

    // Not an inode, but the closest stable equivalent: the file index is
    // constant for the lifetime of the file on NTFS.
    fn portable_ino(&self) -> std::io::Result<u64> {
        let info = self.get_file_info()?;
        Ok((info.nFileIndexLow as u64) | ((info.nFileIndexHigh as u64) << 32))
    }
}
