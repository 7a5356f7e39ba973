//! The random-access record file.
//!
//! An append-only binary file of `(key, len, payload)` records with an
//! in-memory key-to-offset map for fast reads. Reopening rebuilds the map by
//! a single forward scan. Every fetch costs the caller one logical page read
//! per 4 KB of payload.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// An append-only random-access record file.
pub struct Raf {
    /// The open file handle; exclusive to the owning index.
    file: std::fs::File,
    /// The path of the file.
    path: PathBuf,
    /// Key to byte-offset map, kept in memory.
    offsets: HashMap<u64, u64>,
}

impl Raf {
    /// Creates a fresh, empty record file at `path`.
    ///
    /// # Errors
    ///
    /// - If the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| format!("Could not create '{}': {e}", path.display()))?;
        Ok(Self {
            file,
            path,
            offsets: HashMap::new(),
        })
    }

    /// Opens an existing record file, rebuilding the offset map by scanning.
    ///
    /// # Errors
    ///
    /// - If the file cannot be opened or a record is truncated.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref().to_path_buf();
        let mut file = std::fs::File::open(&path)
            .map_err(|e| format!("Could not open '{}': {e}", path.display()))?;

        let end = file
            .seek(SeekFrom::End(0))
            .map_err(|e| format!("Could not seek '{}': {e}", path.display()))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| format!("Could not seek '{}': {e}", path.display()))?;

        let mut offsets = HashMap::new();
        let mut pos = 0;
        while pos < end {
            let mut header = [0_u8; 12];
            file.read_exact(&mut header)
                .map_err(|e| format!("Truncated record in '{}': {e}", path.display()))?;
            let key = u64::from_le_bytes(header[..8].try_into().unwrap_or_default());
            let len = u32::from_le_bytes(header[8..].try_into().unwrap_or_default());

            offsets.insert(key, pos);
            pos += 12 + u64::from(len);
            file.seek(SeekFrom::Start(pos))
                .map_err(|e| format!("Could not seek '{}': {e}", path.display()))?;
        }

        Ok(Self { file, path, offsets })
    }

    /// Appends one record and returns its byte offset.
    ///
    /// # Errors
    ///
    /// - If the payload exceeds the record size limit or the write fails.
    pub fn append(&mut self, key: u64, payload: &[u8]) -> Result<u64, String> {
        let len = u32::try_from(payload.len()).map_err(|_| "RAF record exceeds 4 GiB.".to_string())?;

        let offset = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|e| format!("Could not seek '{}': {e}", self.path.display()))?;
        self.file
            .write_all(&key.to_le_bytes())
            .and_then(|()| self.file.write_all(&len.to_le_bytes()))
            .and_then(|()| self.file.write_all(payload))
            .map_err(|e| format!("Could not append to '{}': {e}", self.path.display()))?;

        self.offsets.insert(key, offset);
        Ok(offset)
    }

    /// Fetches the payload stored under `key`.
    ///
    /// # Errors
    ///
    /// - If the key is unknown or the record is truncated.
    pub fn read(&mut self, key: u64) -> Result<Vec<u8>, String> {
        let &offset = self
            .offsets
            .get(&key)
            .ok_or_else(|| format!("Unknown record key {key} in '{}'.", self.path.display()))?;

        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| format!("Could not seek '{}': {e}", self.path.display()))?;
        let mut header = [0_u8; 12];
        self.file
            .read_exact(&mut header)
            .map_err(|e| format!("Truncated record in '{}': {e}", self.path.display()))?;
        let len = u32::from_le_bytes(header[8..].try_into().unwrap_or_default()) as usize;

        let mut payload = vec![0_u8; len];
        self.file
            .read_exact(&mut payload)
            .map_err(|e| format!("Truncated record in '{}': {e}", self.path.display()))?;
        Ok(payload)
    }

    /// The number of records in the file.
    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Returns whether the file holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Flushes all buffered writes to disk.
    ///
    /// # Errors
    ///
    /// - If the sync fails.
    pub fn sync(&mut self) -> Result<(), String> {
        self.file
            .sync_all()
            .map_err(|e| format!("Could not sync '{}': {e}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_read_reopen() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-raf").map_err(|e| e.to_string())?;
        let path = tmp.path().join("objects.raf");

        let mut raf = Raf::create(&path)?;
        raf.append(0, b"first")?;
        raf.append(7, b"second")?;
        raf.sync()?;
        assert_eq!(raf.read(7)?, b"second");
        assert_eq!(raf.read(0)?, b"first");
        drop(raf);

        let mut reopened = Raf::open(&path)?;
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.read(0)?, b"first");
        assert_eq!(reopened.read(7)?, b"second");
        assert!(reopened.read(3).is_err());
        Ok(())
    }
}
