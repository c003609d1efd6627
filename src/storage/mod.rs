//! Staged upload storage.
//!
//! Uploaded images are persisted under `<storage_dir>/uploads` with random
//! hex names and deleted once processing is done. Ownership of the deletion
//! is carried by [`CleanupHandle`].

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use rand::RngCore;
use tracing::warn;

use crate::{Error, Result};

const UPLOADS_DIR_NAME: &str = "uploads";
const RANDOM_NAME_BYTES: usize = 16;

const MIME_PNG: &str = "image/png";
const MIME_JPEG: &str = "image/jpeg";
const MIME_JPG: &str = "image/jpg";
const MIME_OCTET_STREAM: &str = "application/octet-stream";

/// Deferred deletion of a staged upload.
///
/// `cleanup` removes the file; the second call is an error the caller
/// ignores. Dropping an un-cleaned handle removes the file as well, so early
/// exits and shutdown cannot leak staged uploads.
pub struct CleanupHandle {
    path: Option<PathBuf>,
}

impl CleanupHandle {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    /// Remove the staged file. Calling twice returns an error.
    pub fn cleanup(&mut self) -> io::Result<()> {
        match self.path.take() {
            Some(path) => std::fs::remove_file(path),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "upload already cleaned up",
            )),
        }
    }

    /// Path of the staged file, if not yet cleaned.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove staged upload");
            }
        }
    }
}

impl fmt::Debug for CleanupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupHandle")
            .field("path", &self.path)
            .finish()
    }
}

/// Stores temporary uploads on disk.
pub struct Uploader {
    uploads_dir: PathBuf,
}

impl Uploader {
    /// Create an uploader rooted at `<storage_dir>/uploads`.
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        Self {
            uploads_dir: storage_dir.as_ref().join(UPLOADS_DIR_NAME),
        }
    }

    /// Validate and persist an uploaded image.
    ///
    /// The media type is taken from `declared_mime`, falling back to
    /// extension inference from `filename` when the declared value is empty
    /// or `application/octet-stream`. Payloads larger than `max_bytes` are
    /// rejected; exactly `max_bytes` is accepted. Returns the absolute path,
    /// the deletion handle, and the resolved media type.
    pub fn save_image(
        &self,
        filename: &str,
        declared_mime: &str,
        data: &[u8],
        max_bytes: u64,
    ) -> Result<(PathBuf, CleanupHandle, String)> {
        let mime = resolve_mime(declared_mime, filename);
        let ext = extension_for(&mime).ok_or_else(|| {
            Error::validation(format!("unsupported content type: {mime}"))
        })?;

        if data.len() as u64 > max_bytes {
            return Err(Error::validation(format!(
                "file exceeds maximum upload size of {max_bytes} bytes"
            )));
        }

        std::fs::create_dir_all(&self.uploads_dir)
            .map_err(|e| Error::Other(format!("ensure uploads dir: {e}")))?;

        let name = format!("{}{}", random_hex(RANDOM_NAME_BYTES), ext);
        let dst = self.uploads_dir.join(name);

        // Exclusive create: a name collision is an error, never an overwrite.
        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create_new(true);
        let write_result = opts
            .open(&dst)
            .and_then(|mut f| io::Write::write_all(&mut f, data));
        if let Err(e) = write_result {
            let _ = std::fs::remove_file(&dst);
            return Err(Error::Other(format!("store upload: {e}")));
        }

        let abs = dst.canonicalize().unwrap_or(dst);
        let handle = CleanupHandle::new(abs.clone());
        Ok((abs, handle, mime))
    }
}

/// Resolve the effective media type from the declared value and filename.
fn resolve_mime(declared: &str, filename: &str) -> String {
    let declared = declared.trim();
    if !declared.is_empty() && !declared.eq_ignore_ascii_case(MIME_OCTET_STREAM) {
        return declared.to_ascii_lowercase();
    }
    match Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => MIME_PNG.to_string(),
        Some("jpg") | Some("jpeg") => MIME_JPEG.to_string(),
        _ => declared.to_ascii_lowercase(),
    }
}

/// File extension for an allowed image media type.
fn extension_for(mime: &str) -> Option<&'static str> {
    match mime {
        MIME_PNG => Some(".png"),
        MIME_JPEG | MIME_JPG => Some(".jpg"),
        _ => None,
    }
}

fn random_hex(n: usize) -> String {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn saves_png_and_cleanup_removes_it() {
        let dir = TempDir::new().unwrap();
        let uploader = Uploader::new(dir.path());

        let (path, mut handle, mime) = uploader
            .save_image("img.png", "image/png", b"abc", 1024)
            .unwrap();
        assert!(path.exists());
        assert!(path.extension().is_some_and(|e| e == "png"));
        assert_eq!(mime, "image/png");

        handle.cleanup().unwrap();
        assert!(!path.exists());
        // Second call errors but leaves nothing behind.
        assert!(handle.cleanup().is_err());
        assert!(!path.exists());
    }

    #[test]
    fn drop_removes_uncleaned_file() {
        let dir = TempDir::new().unwrap();
        let uploader = Uploader::new(dir.path());
        let (path, handle, _) = uploader
            .save_image("img.png", "image/png", b"abc", 1024)
            .unwrap();
        assert!(path.exists());
        drop(handle);
        assert!(!path.exists());
    }

    #[test]
    fn rejects_unsupported_media_type() {
        let dir = TempDir::new().unwrap();
        let uploader = Uploader::new(dir.path());
        let err = uploader
            .save_image("notes.txt", "text/plain", b"hello", 1024)
            .unwrap_err();
        assert!(err.to_string().contains("unsupported content type"));
    }

    #[test]
    fn octet_stream_falls_back_to_extension() {
        let dir = TempDir::new().unwrap();
        let uploader = Uploader::new(dir.path());
        let (_, _handle, mime) = uploader
            .save_image("scan.jpeg", "application/octet-stream", b"abc", 1024)
            .unwrap();
        assert_eq!(mime, "image/jpeg");
    }

    #[test]
    fn size_ceiling_is_inclusive() {
        let dir = TempDir::new().unwrap();
        let uploader = Uploader::new(dir.path());

        let exact = vec![0u8; 16];
        assert!(uploader
            .save_image("a.png", "image/png", &exact, 16)
            .is_ok());

        let over = vec![0u8; 17];
        let err = uploader
            .save_image("b.png", "image/png", &over, 16)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn filenames_are_32_hex_plus_extension() {
        let dir = TempDir::new().unwrap();
        let uploader = Uploader::new(dir.path());
        let (path, _handle, _) = uploader
            .save_image("x.jpg", "image/jpg", b"abc", 1024)
            .unwrap();
        let stem = path.file_stem().unwrap().to_str().unwrap();
        assert_eq!(stem.len(), 32);
        assert!(stem.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
