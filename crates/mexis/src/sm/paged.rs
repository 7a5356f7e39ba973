//! The paged node file shared by the secondary-memory indexes.
//!
//! Layout: a fixed header of two little-endian `u64`s (the root node offset
//! and the metadata record offset), followed by node records. Each record is
//! `(len: u32, bincode bytes)`. Nodes are written post-order, so offsets are
//! monotonically increasing and parents always reference already-written
//! children. Builds go to a temporary path and are atomically renamed into
//! place on completion, so a crash never leaves a half-written index behind.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

/// The size in bytes of the fixed file header.
const HEADER_BYTES: u64 = 16;

/// A paged binary node file.
pub struct NodeFile {
    /// The open file handle; exclusive to the owning index.
    file: std::fs::File,
    /// The final path of the file.
    path: PathBuf,
    /// The temporary path used during a build, until the atomic rename.
    tmp_path: Option<PathBuf>,
}

impl NodeFile {
    /// Creates a fresh node file for building, at a temporary path next to
    /// `path`. The header is zeroed until [`NodeFile::finish`].
    ///
    /// # Errors
    ///
    /// - If the temporary file cannot be created or written.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref().to_path_buf();
        let tmp_path = path.with_extension(match path.extension() {
            Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
            None => "tmp".to_string(),
        });

        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| format!("Could not create '{}': {e}", tmp_path.display()))?;
        file.write_all(&[0_u8; HEADER_BYTES as usize])
            .map_err(|e| format!("Could not write header of '{}': {e}", tmp_path.display()))?;

        Ok(Self {
            file,
            path,
            tmp_path: Some(tmp_path),
        })
    }

    /// Opens an existing node file and returns it with its root offset.
    ///
    /// # Errors
    ///
    /// - If the file cannot be opened or its header is short or corrupt.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<(Self, u64), String> {
        let path = path.as_ref().to_path_buf();
        let mut file = std::fs::File::open(&path)
            .map_err(|e| format!("Could not open '{}': {e}", path.display()))?;

        let mut header = [0_u8; 8];
        file.read_exact(&mut header)
            .map_err(|e| format!("Short header in '{}': {e}", path.display()))?;
        let root = u64::from_le_bytes(header);

        if root < HEADER_BYTES {
            return Err(format!("Corrupt root offset in '{}'.", path.display()));
        }

        Ok((
            Self {
                file,
                path,
                tmp_path: None,
            },
            root,
        ))
    }

    /// Appends one node record and returns `(offset, record bytes)`.
    ///
    /// # Errors
    ///
    /// - If serialization or the write fails.
    pub fn write_node<T: Serialize>(&mut self, node: &T) -> Result<(u64, u64), String> {
        let bytes = bincode::serialize(node).map_err(|e| format!("Could not serialize node: {e}"))?;
        let len = u32::try_from(bytes.len()).map_err(|_| "Node record exceeds 4 GiB.".to_string())?;

        let offset = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|e| format!("Could not seek '{}': {e}", self.path.display()))?;
        self.file
            .write_all(&len.to_le_bytes())
            .and_then(|()| self.file.write_all(&bytes))
            .map_err(|e| format!("Could not write node to '{}': {e}", self.path.display()))?;

        Ok((offset, 4 + u64::from(len)))
    }

    /// Reads the node record at `offset`; returns the node and its size in
    /// bytes.
    ///
    /// # Errors
    ///
    /// - If the offset is out of range, the record is short, or it fails to
    ///   deserialize.
    pub fn read_node<T: DeserializeOwned>(&mut self, offset: u64) -> Result<(T, u64), String> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| format!("Could not seek '{}': {e}", self.path.display()))?;

        let mut len_bytes = [0_u8; 4];
        self.file
            .read_exact(&mut len_bytes)
            .map_err(|e| format!("Short node record in '{}': {e}", self.path.display()))?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut bytes = vec![0_u8; len];
        self.file
            .read_exact(&mut bytes)
            .map_err(|e| format!("Short node record in '{}': {e}", self.path.display()))?;

        let node =
            bincode::deserialize(&bytes).map_err(|e| format!("Corrupt node in '{}': {e}", self.path.display()))?;
        Ok((node, 4 + len as u64))
    }

    /// Finalizes a build: appends the metadata record, rewrites the header
    /// with the root and metadata offsets, and atomically renames the
    /// temporary file into place.
    ///
    /// # Errors
    ///
    /// - If any write or the rename fails.
    pub fn finish<M: Serialize>(&mut self, root_offset: u64, meta: &M) -> Result<(), String> {
        let (meta_offset, _) = self.write_node(meta)?;

        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| format!("Could not seek '{}': {e}", self.path.display()))?;
        self.file
            .write_all(&root_offset.to_le_bytes())
            .and_then(|()| self.file.write_all(&meta_offset.to_le_bytes()))
            .map_err(|e| format!("Could not write header of '{}': {e}", self.path.display()))?;
        self.file
            .sync_all()
            .map_err(|e| format!("Could not sync '{}': {e}", self.path.display()))?;

        if let Some(tmp_path) = self.tmp_path.take() {
            std::fs::rename(&tmp_path, &self.path)
                .map_err(|e| format!("Could not rename '{}' into place: {e}", tmp_path.display()))?;
        }
        Ok(())
    }

    /// Reads the metadata record written by [`NodeFile::finish`].
    ///
    /// # Errors
    ///
    /// - If the header or the metadata record is corrupt.
    pub fn read_meta<M: DeserializeOwned>(&mut self) -> Result<M, String> {
        self.file
            .seek(SeekFrom::Start(8))
            .map_err(|e| format!("Could not seek '{}': {e}", self.path.display()))?;
        let mut header = [0_u8; 8];
        self.file
            .read_exact(&mut header)
            .map_err(|e| format!("Short header in '{}': {e}", self.path.display()))?;
        let meta_offset = u64::from_le_bytes(header);

        if meta_offset < HEADER_BYTES {
            return Err(format!("Corrupt metadata offset in '{}'.", self.path.display()));
        }
        self.read_node(meta_offset).map(|(meta, _)| meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct TestNode {
        ids: Vec<u32>,
        radius: f64,
    }

    #[test]
    fn write_finish_reopen_read() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-paged").map_err(|e| e.to_string())?;
        let path = tmp.path().join("index.bin");

        let node = TestNode {
            ids: vec![1, 2, 3],
            radius: 2.5,
        };

        let mut file = NodeFile::create(&path)?;
        let (offset, bytes) = file.write_node(&node)?;
        assert_eq!(offset, 16);
        assert!(bytes > 0);
        file.finish(offset, &"meta".to_string())?;

        let (mut reopened, root) = NodeFile::open(&path)?;
        assert_eq!(root, offset);
        let (read, _) = reopened.read_node::<TestNode>(root)?;
        assert_eq!(read, node);
        assert_eq!(reopened.read_meta::<String>()?, "meta");
        Ok(())
    }

    #[test]
    fn unfinished_builds_leave_no_index() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-paged").map_err(|e| e.to_string())?;
        let path = tmp.path().join("index.bin");

        let mut file = NodeFile::create(&path)?;
        file.write_node(&TestNode {
            ids: vec![],
            radius: 0.0,
        })?;
        drop(file);

        assert!(NodeFile::open(&path).is_err());
        Ok(())
    }
}
