use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, StorageError};

/// Fixed size of every block in a block file.
pub const BLOCK_SIZE: usize = 8192;

/// Fixed-size block I/O over a single file.
pub struct BlockManager {
    path: PathBuf,
    file: File,
}

impl BlockManager {
    /// Opens the block file, creating it (and any missing directory on its
    /// path) if necessary.
    pub fn open(path: &Path) -> Result<BlockManager> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(BlockManager {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Opens the block file with any previous contents discarded.
    pub fn create(path: &Path) -> Result<BlockManager> {
        let bm = BlockManager::open(path)?;
        bm.file.set_len(0)?;
        Ok(bm)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_blocks(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len() / BLOCK_SIZE as u64)
    }

    pub fn read_block(&mut self, block_num: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.file
            .seek(SeekFrom::Start(block_num * BLOCK_SIZE as u64))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Writes `data` at `block_num`, zero-padded to the full block size so a
    /// shorter rewrite never leaves residue from an earlier longer record.
    pub fn write_block(&mut self, block_num: u64, data: &[u8]) -> Result<()> {
        if data.len() > BLOCK_SIZE {
            return Err(StorageError::Corruption(format!(
                "block payload of {} bytes exceeds block size {}",
                data.len(),
                BLOCK_SIZE
            )));
        }
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[..data.len()].copy_from_slice(data);
        self.file
            .seek(SeekFrom::Start(block_num * BLOCK_SIZE as u64))?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    /// Appends a zero-filled block and returns its index.
    pub fn allocate_block(&mut self) -> Result<u64> {
        let block_num = self.num_blocks()?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&[0u8; BLOCK_SIZE])?;
        Ok(block_num)
    }

    /// Discards every block.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        Ok(())
    }
}
