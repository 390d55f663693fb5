//! POSIX shared-memory region management.
//!
//! Thin safe wrapper over `shm_open`, `ftruncate`, `mmap`, `munmap` and
//! `shm_unlink`. A [`ShmRegion`] owns one mapping and unmaps it on drop;
//! it never unlinks, so the name outlives any individual handle and other
//! processes keep their mappings until they drop them.
//!
//! Region names follow the POSIX rules: a leading `/`, no other `/`, at
//! most 255 bytes. Objects are created with mode `0666` so unrelated
//! processes can attach.

use std::ffi::CString;
use std::io;
use std::ptr;

use crate::error::{from_errno, Error, Result};

/// A mapped shared-memory object.
pub struct ShmRegion {
    ptr: *mut u8,
    len: usize,
    name: String,
}

// SAFETY: the mapping is valid for the life of the struct and all mutable
// state inside it is accessed through atomics by the layers above.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

fn validate_name(name: &str) -> Result<CString> {
    if !name.starts_with('/') || name.len() < 2 {
        return Err(Error::InvalidName(name.to_string()));
    }
    if name[1..].contains('/') {
        return Err(Error::InvalidName(name.to_string()));
    }
    if name.len() > 255 {
        return Err(Error::InvalidName(name.to_string()));
    }
    CString::new(name).map_err(|_| Error::InvalidName(name.to_string()))
}

fn map(fd: libc::c_int, len: usize, writable: bool) -> Result<*mut u8> {
    let prot = if writable {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_READ
    };
    // SAFETY: fd is a live shm descriptor, len is nonzero, and we pass a
    // null hint so the kernel picks the address. MAP_FAILED is checked
    // before the pointer is used.
    let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(Error::Sys(io::Error::last_os_error()));
    }
    Ok(ptr.cast())
}

impl ShmRegion {
    /// Create a new region of exactly `len` bytes, failing if the name is
    /// already taken. The fresh object is zero-filled by the kernel.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        let c_name = validate_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string; O_EXCL makes
        // creation exclusive, the error path is checked below.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o666,
            )
        };
        if fd < 0 {
            return Err(from_errno(name));
        }

        // SAFETY: fd is the descriptor opened above; a failed ftruncate
        // leaves a zero-length object behind, so undo the creation.
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } < 0 {
            let err = Error::Sys(io::Error::last_os_error());
            // SAFETY: fd is still open; shm_unlink on the name we just
            // created is the cleanup path.
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(err);
        }

        let mapped = map(fd, len, true);
        // SAFETY: the mapping (when it succeeded) holds its own reference
        // to the object; the descriptor is no longer needed either way.
        unsafe { libc::close(fd) };
        let ptr = match mapped {
            Ok(p) => p,
            Err(e) => {
                // SAFETY: undo the exclusive creation so a retry can succeed.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(e);
            }
        };

        log::debug!("created shm region {name} ({len} bytes)");
        Ok(Self {
            ptr,
            len,
            name: name.to_string(),
        })
    }

    /// Map `len` bytes of an existing region. `len` may be smaller than
    /// the object (used to probe just the control block).
    pub fn attach(name: &str, len: usize, writable: bool) -> Result<Self> {
        let c_name = validate_name(name)?;

        let oflag = if writable { libc::O_RDWR } else { libc::O_RDONLY };
        // SAFETY: c_name is valid; mode is ignored without O_CREAT.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), oflag, 0) };
        if fd < 0 {
            return Err(from_errno(name));
        }

        let mapped = map(fd, len, writable);
        // SAFETY: the mapping keeps the object alive; close is safe here.
        unsafe { libc::close(fd) };
        let ptr = mapped?;

        Ok(Self {
            ptr,
            len,
            name: name.to_string(),
        })
    }

    /// Size in bytes of the named object, without mapping it.
    pub fn object_size(name: &str) -> Result<usize> {
        let c_name = validate_name(name)?;

        // SAFETY: read-only open purely to fstat the object.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd < 0 {
            return Err(from_errno(name));
        }

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: fd is open and st is a properly sized out-struct.
        let rc = unsafe { libc::fstat(fd, &mut st) };
        // SAFETY: fd is not used past this point.
        unsafe { libc::close(fd) };
        if rc < 0 {
            return Err(Error::Sys(io::Error::last_os_error()));
        }
        Ok(st.st_size as usize)
    }

    /// Remove the name from the shared-memory namespace. Mappings held by
    /// live processes stay valid; the object is destroyed when the last
    /// one drops. Missing names are an error, matching `shm_unlink`.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = validate_name(name)?;
        // SAFETY: unlink only touches the namespace, never live mappings.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
            return Err(from_errno(name));
        }
        log::debug!("unlinked shm region {name}");
        Ok(())
    }

    /// Base pointer of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Name the region was opened under.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and drop runs once.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/shmring_{tag}_{ts}")
    }

    #[test]
    fn name_rules() {
        assert!(validate_name("/ok").is_ok());
        assert!(validate_name("no_slash").is_err());
        assert!(validate_name("/two/slashes").is_err());
        assert!(validate_name("/").is_err());
        let long = format!("/{}", "x".repeat(300));
        assert!(validate_name(&long).is_err());
    }

    #[test]
    fn create_attach_roundtrip() {
        let name = unique_name("region");
        let a = ShmRegion::create(&name, 4096).unwrap();
        // SAFETY: offset 0 is inside the fresh 4096-byte mapping.
        unsafe { *a.as_ptr() = 0x5a };

        let b = ShmRegion::attach(&name, 4096, false).unwrap();
        // SAFETY: same object, same offset, written above.
        unsafe { assert_eq!(*b.as_ptr(), 0x5a) };

        assert_eq!(ShmRegion::object_size(&name).unwrap(), 4096);

        drop(a);
        drop(b);
        ShmRegion::unlink(&name).unwrap();
    }

    #[test]
    fn exclusive_create_fails_on_existing() {
        let name = unique_name("excl");
        let _a = ShmRegion::create(&name, 1024).unwrap();
        assert!(matches!(
            ShmRegion::create(&name, 1024),
            Err(Error::Exists)
        ));
        ShmRegion::unlink(&name).unwrap();
    }

    #[test]
    fn attach_missing_is_not_found() {
        let name = unique_name("missing");
        assert!(matches!(
            ShmRegion::attach(&name, 256, false),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn unlink_missing_is_not_found() {
        let name = unique_name("gone");
        assert!(matches!(
            ShmRegion::unlink(&name),
            Err(Error::NotFound(_))
        ));
    }
}
