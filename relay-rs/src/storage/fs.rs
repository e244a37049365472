//! Filesystem operations used by the spool
//!
//! Everything the spool and the relay scanner do to disk goes through
//! [`SpoolFs`], which keeps the hand-off protocol testable without a real
//! directory tree.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A spool file opened for writing
pub trait SpoolFile: Write + Send {
    /// Flush buffered data and make it durable
    fn sync(&mut self) -> io::Result<()>;
}

pub trait SpoolFs: Send + Sync {
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Create a new file, failing if `path` already exists
    fn create_new(&self, path: &Path) -> io::Result<Box<dyn SpoolFile>>;

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Atomic within one filesystem
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Regular files directly inside `dir`, sorted by name
    fn list_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    fn modified(&self, path: &Path) -> io::Result<SystemTime>;

    /// Set the modification time to now
    fn touch(&self, path: &Path) -> io::Result<()>;

    fn exists(&self, path: &Path) -> bool;
}

/// [`SpoolFs`] backed by `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

struct LocalFile(BufWriter<File>);

impl Write for LocalFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl SpoolFile for LocalFile {
    fn sync(&mut self) -> io::Result<()> {
        self.0.flush()?;
        self.0.get_ref().sync_all()
    }
}

impl SpoolFs for LocalFs {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        match fs::create_dir_all(path) {
            Err(e) if e.kind() != io::ErrorKind::AlreadyExists => Err(e),
            _ => Ok(()),
        }
    }

    fn create_new(&self, path: &Path) -> io::Result<Box<dyn SpoolFile>> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        Ok(Box::new(LocalFile(BufWriter::new(file))))
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn list_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        fs::metadata(path)?.modified()
    }

    fn touch(&self, path: &Path) -> io::Result<()> {
        OpenOptions::new()
            .write(true)
            .open(path)?
            .set_modified(SystemTime::now())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}
