use super::security::{SecurityEvents, Severity};
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

const TAG_ATTRIBUTE: &str = "user.fleet_runner.sha256";

/// Outcome of comparing a file against its integrity tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityStatus {
    Valid,
    Invalid { expected: String, actual: String },
    /// The file carries no tag.
    Unknown,
}

/// Out-of-band content tags for individual files.
///
/// The tag lives in an extended attribute when the filesystem allows it,
/// otherwise in a `<file>.sha256` sidecar.
#[derive(Debug, Clone)]
pub struct FileIntegrity {
    security: SecurityEvents,
}

impl FileIntegrity {
    pub fn new(security: SecurityEvents) -> Self {
        Self { security }
    }

    /// Tags `path` with the SHA-256 of its current contents.
    pub fn tag(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        let digest = file_digest(path)?;

        match xattr::set(path, TAG_ATTRIBUTE, digest.as_bytes()) {
            Ok(()) => {
                let sidecar = sidecar_path(path);
                if sidecar.exists() {
                    let _ = std::fs::remove_file(sidecar);
                }
            }
            Err(e) => {
                self.security.record(
                    Severity::Warning,
                    "setxattr failed",
                    &format!("{}: {}; using sidecar tag", path.display(), e),
                );
                std::fs::write(sidecar_path(path), &digest)?;
            }
        }

        tracing::debug!(path = ?path, digest = %digest, "Tagged file");
        Ok(digest)
    }

    /// Compares `path` against its tag.
    pub fn check(&self, path: impl AsRef<Path>) -> Result<IntegrityStatus> {
        let path = path.as_ref();
        let Some(expected) = read_tag(path) else {
            return Ok(IntegrityStatus::Unknown);
        };

        let actual = file_digest(path)?;
        if actual == expected {
            Ok(IntegrityStatus::Valid)
        } else {
            self.security.record(
                Severity::Warning,
                "file_integrity_mismatch",
                &format!("{} no longer matches its tag", path.display()),
            );
            Ok(IntegrityStatus::Invalid { expected, actual })
        }
    }
}

fn file_digest(path: &Path) -> Result<String> {
    let content = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&content)))
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".sha256");
    PathBuf::from(name)
}

fn read_tag(path: &Path) -> Option<String> {
    if let Ok(Some(value)) = xattr::get(path, TAG_ATTRIBUTE) {
        if let Ok(tag) = String::from_utf8(value) {
            return Some(tag.trim().to_string());
        }
    }
    std::fs::read_to_string(sidecar_path(path))
        .ok()
        .map(|tag| tag.trim().to_string())
}

#[cfg(target_os = "linux")]
mod xattr {
    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    fn c_string(bytes: &[u8]) -> io::Result<CString> {
        CString::new(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    pub fn set(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
        let c_path = c_string(path.as_os_str().as_bytes())?;
        let c_name = c_string(name.as_bytes())?;
        // SAFETY: both C strings are NUL terminated and outlive the call;
        // `value` is a valid slice of `value.len()` bytes.
        let rc = unsafe {
            libc::setxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                0,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    pub fn get(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
        let c_path = c_string(path.as_os_str().as_bytes())?;
        let c_name = c_string(name.as_bytes())?;
        let mut buf = vec![0u8; 256];
        // SAFETY: `buf` is writable for `buf.len()` bytes and the C strings
        // are NUL terminated.
        let rc = unsafe {
            libc::getxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENODATA) {
                return Ok(None);
            }
            return Err(err);
        }
        buf.truncate(rc as usize);
        Ok(Some(buf))
    }
}

#[cfg(not(target_os = "linux"))]
mod xattr {
    use std::io;
    use std::path::Path;

    pub fn set(_path: &Path, _name: &str, _value: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "extended attributes are not supported on this platform",
        ))
    }

    pub fn get(_path: &Path, _name: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_tag_then_check() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("server.py");
        file.write_str("print('hello')").unwrap();

        let integrity = FileIntegrity::new(SecurityEvents::new(temp.path().join("sec.log")));
        let digest = integrity.tag(file.path()).unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(integrity.check(file.path()).unwrap(), IntegrityStatus::Valid);

        file.write_str("print('tampered')").unwrap();
        match integrity.check(file.path()).unwrap() {
            IntegrityStatus::Invalid { expected, actual } => {
                assert_eq!(expected, digest);
                assert_ne!(actual, digest);
            }
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_untagged_is_unknown() {
        let temp = assert_fs::TempDir::new().unwrap();
        let file = temp.child("plain.txt");
        file.write_str("data").unwrap();

        let integrity = FileIntegrity::new(SecurityEvents::new(temp.path().join("sec.log")));
        assert_eq!(integrity.check(file.path()).unwrap(), IntegrityStatus::Unknown);
    }
}
