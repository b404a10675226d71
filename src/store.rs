//! Content-addressed object store.
//!
//! Objects live in the git-lfs standard layout:
//! `<root>/<oid[0:2]>/<oid[2:4]>/<oid>`. This is both where downloads land
//! (`.git/lfs/objects`) and the on-disk format of the filesystem remote.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::oid::OidHasher;
use crate::{Error, Oid, Result};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// A directory of objects keyed by OID.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    base_path: PathBuf,
}

impl ObjectStore {
    /// Create a store rooted at the given directory.
    ///
    /// The directory does not need to exist yet; it is created on first write.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        ObjectStore {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the path where an object with the given OID is stored.
    pub fn object_path(&self, oid: &Oid) -> PathBuf {
        let hex = oid.to_hex();
        self.base_path.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }

    /// Check if an object exists and has the expected size.
    pub fn contains_valid(&self, oid: &Oid, size: u64) -> bool {
        match fs::metadata(self.object_path(oid)) {
            Ok(meta) => meta.is_file() && meta.len() == size,
            Err(_) => false,
        }
    }

    /// Create a writer for storing an object.
    ///
    /// Content is streamed into a uniquely named temp file next to the final
    /// path, so concurrent writers for the same OID never share a file.
    pub fn writer(&self, oid: &Oid) -> Result<ObjectWriter> {
        let final_path = self.object_path(oid);

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = final_path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        let file = File::create(&temp_path)?;

        Ok(ObjectWriter {
            file,
            oid: oid.clone(),
            hasher: OidHasher::new(),
            temp_path,
            final_path,
            finished: false,
        })
    }

    /// Stream a reader into the store, calling `on_chunk` with the size of
    /// every chunk written. The content must hash to `oid`.
    pub fn import<R: Read>(
        &self,
        oid: &Oid,
        mut reader: R,
        on_chunk: &mut dyn FnMut(u64),
    ) -> Result<PathBuf> {
        let mut writer = self.writer(oid)?;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            writer.write_all(&buf[..n])?;
            on_chunk(n as u64);
        }
        writer.finish()
    }
}

/// Writer for streaming content into the store.
///
/// The object only becomes visible at its final path once [`finish`] has
/// verified the content hash. Dropping an unfinished writer removes the
/// temp file.
///
/// [`finish`]: ObjectWriter::finish
pub struct ObjectWriter {
    file: File,
    oid: Oid,
    hasher: OidHasher,
    temp_path: PathBuf,
    final_path: PathBuf,
    finished: bool,
}

impl ObjectWriter {
    /// Verify the content hash and atomically move into place.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.file.sync_all()?;

        let hasher = std::mem::take(&mut self.hasher);
        let actual = hasher.finish();
        if actual != self.oid {
            return Err(Error::ChecksumMismatch {
                expected: self.oid.to_hex(),
                actual: actual.to_hex(),
            });
        }

        fs::rename(&self.temp_path, &self.final_path)?;
        self.finished = true;
        Ok(self.final_path.clone())
    }
}

impl Write for ObjectWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for ObjectWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}
