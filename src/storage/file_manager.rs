use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::os::unix::prelude::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error, Result};

use crate::catalog::schema::IndexKind;
use crate::common::{
    DIRECTORY_FILE_EXTENSION, INDEX_FILE_EXTENSION, META_FILE_EXTENSION, TABLE_FILE_EXTENSION,
};

/// FileManager knows where the files of every table live.
/// All tables are stored inside a single directory, the data directory:
/// `<table>.tbl` holds the records, `<table>.meta` the table metadata and
/// `<table>.<column>.<kind>.idx` one index each.
#[derive(Clone, Debug)]
pub struct FileManager {
    data_directory: PathBuf,
}

impl FileManager {
    /// Creates a new FileManager.
    ///
    /// # Arguments
    /// * `data_directory` - The directory under which all tables are stored
    ///
    pub fn new(data_directory: impl Into<PathBuf>) -> Result<Self> {
        let data_directory = data_directory.into();
        if !data_directory.is_dir() {
            return Err(Error::msg(format!(
                "Could not create file manager. {} is not a directory",
                data_directory.display()
            )));
        }
        Ok(Self { data_directory })
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.data_directory
            .join(format!("{table}.{TABLE_FILE_EXTENSION}"))
    }

    pub fn meta_path(&self, table: &str) -> PathBuf {
        self.data_directory
            .join(format!("{table}.{META_FILE_EXTENSION}"))
    }

    pub fn index_path(&self, table: &str, column: &str, kind: IndexKind) -> PathBuf {
        self.data_directory
            .join(format!("{table}.{column}.{kind}.{INDEX_FILE_EXTENSION}"))
    }

    /// Extendible hashing keeps its directory next to the bucket file.
    pub fn directory_path(&self, table: &str, column: &str) -> PathBuf {
        self.data_directory.join(format!(
            "{table}.{column}.{}.{DIRECTORY_FILE_EXTENSION}",
            IndexKind::Hash
        ))
    }

    /// Returns the names of all tables which have a metadata file.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let content = self.data_directory.read_dir().with_context(|| {
            format!(
                "Could not read files in data directory {}",
                self.data_directory.display()
            )
        })?;

        let mut tables = Vec::new();
        for entry in content {
            let entry = entry.with_context(|| {
                format!(
                    "Could not read entry in data directory {}",
                    self.data_directory.display()
                )
            })?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(table) = to_table_name(&entry.file_name()) {
                tables.push(table);
            }
        }
        tables.sort();
        Ok(tables)
    }

    /// Removes every file that belongs to the index.
    pub fn remove_index_files(&self, table: &str, column: &str, kind: IndexKind) -> Result<()> {
        remove_if_exists(&self.index_path(table, column, kind))?;
        if kind == IndexKind::Hash {
            remove_if_exists(&self.directory_path(table, column))?;
        }
        Ok(())
    }

    pub fn remove_table_files(&self, table: &str) -> Result<()> {
        remove_if_exists(&self.table_path(table))?;
        remove_if_exists(&self.meta_path(table))
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}

/// Returns the table name if the file is a table metadata file, else none.
fn to_table_name(filename: &OsStr) -> Option<String> {
    let filename = filename.to_str()?;
    let table = filename.strip_suffix(&format!(".{META_FILE_EXTENSION}"))?;
    if table.is_empty() || table.contains('.') {
        None
    } else {
        Some(table.to_owned())
    }
}

/// A file read and written at explicit byte offsets. Every write is synced
/// before it returns.
pub struct DataFile {
    path: PathBuf,
    file: File,
    filesize: u64,
}

impl DataFile {
    /// Creates a new, empty file. Fails if the file exists.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("Failed to create data file {}", path.display()))?;

        Ok(Self {
            path,
            file,
            filesize: 0,
        })
    }

    /// Opens an existing file for reading and writing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Could not open data file {}", path.display()))?;

        let filesize = file
            .metadata()
            .with_context(|| format!("Could not read size of {}", path.display()))?
            .len();

        Ok(Self {
            path,
            file,
            filesize,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filesize(&self) -> u64 {
        self.filesize
    }

    /// Reads `buffer.len()` bytes starting at offset.
    pub fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buffer, offset).with_context(|| {
            format!(
                "Could not read {} bytes at offset {} of {}",
                buffer.len(),
                offset,
                self.path.display()
            )
        })?;

        Ok(())
    }

    /// Writes data to the file at the given offset.
    pub fn write_at(&mut self, offset: u64, buffer: &[u8]) -> Result<()> {
        self.file.write_all_at(buffer, offset).with_context(|| {
            format!(
                "Failed to write data at offset {} of {}",
                offset,
                self.path.display()
            )
        })?;
        self.file.sync_all().with_context(|| {
            format!(
                "Failed to sync data when writing at offset {} of {}",
                offset,
                self.path.display()
            )
        })?;
        self.filesize = self.filesize.max(offset + buffer.len() as u64);

        Ok(())
    }

    /// Appends data and returns the offset it was written at.
    pub fn append(&mut self, buffer: &[u8]) -> Result<u64> {
        let offset = self.filesize;
        self.write_at(offset, buffer)?;
        Ok(offset)
    }

    /// Replaces the whole content of the file.
    pub fn overwrite(&mut self, buffer: &[u8]) -> Result<()> {
        self.file
            .set_len(0)
            .with_context(|| format!("Failed to truncate {}", self.path.display()))?;
        self.filesize = 0;
        self.write_at(0, buffer)
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; self.filesize as usize];
        self.read_at(0, &mut buffer)?;
        Ok(buffer)
    }
}
