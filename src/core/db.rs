// Read-only bolt database handle: open, meta selection, shared locking, and read views.
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::Mmap;
use tracing::debug;

use crate::core::cursor::Cursor;
use crate::core::error::{Error, ErrorKind};
use crate::core::format::{BUCKET_HEADER_LEN, FALLBACK_PAGE_SIZE, PAGE_HEADER_LEN};
use crate::core::page::{Meta, Page, PageHeader, read_u64};

pub struct Db {
    path: PathBuf,
    file: File,
    mmap: Mmap,
    page_size: usize,
    meta: Meta,
    locked: bool,
}

impl Db {
    /// Opens an existing database without ever creating or modifying it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|err| Error::from_io(err, &path))?;

        // Named through the trait: std's inherent `File::try_lock_shared` has a different error type.
        FileExt::try_lock_shared(&file).map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_message("database is locked")
                .with_path(&path)
                .with_source(err)
        })?;

        let (mmap, page_size, meta) = match load(&file, &path) {
            Ok(loaded) => loaded,
            Err(err) => {
                let _ = FileExt::unlock(&file);
                return Err(err);
            }
        };
        debug!(
            path = %path.display(),
            page_size,
            txid = meta.txid,
            "opened database"
        );
        Ok(Self {
            path,
            file,
            mmap,
            page_size,
            meta,
            locked: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` against a consistent read view of the database.
    pub fn view<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T, Error>) -> Result<T, Error> {
        let tx = Tx {
            db: self,
            meta: self.meta,
        };
        f(&tx)
    }

    /// Releases the lock and the map. Unlock failures are reported.
    pub fn close(mut self) -> Result<(), Error> {
        self.locked = false;
        let result = FileExt::unlock(&self.file).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to release database lock")
                .with_path(&self.path)
                .with_source(err)
        });
        debug!(path = %self.path.display(), "closed database");
        result
    }

    pub(crate) fn page(&self, id: u64) -> Result<Page<'_>, Error> {
        let page_size = self.page_size as u64;
        let start = id
            .checked_mul(page_size)
            .filter(|start| {
                start
                    .checked_add(PAGE_HEADER_LEN as u64)
                    .is_some_and(|end| end <= self.mmap.len() as u64)
            })
            .ok_or_else(|| self.corrupt("page out of bounds").with_page(id))?
            as usize;
        let header = PageHeader::decode(&self.mmap[start..])?;
        let span = (u64::from(header.overflow) + 1) * page_size;
        let end = (start as u64)
            .checked_add(span)
            .filter(|end| *end <= self.mmap.len() as u64)
            .ok_or_else(|| self.corrupt("page overflow exceeds file").with_page(id))?
            as usize;
        if header.id != id {
            return Err(self.corrupt("page id mismatch").with_page(id));
        }
        Page::parse(&self.mmap[start..end])
    }

    fn corrupt(&self, message: &str) -> Error {
        Error::new(ErrorKind::Corrupt)
            .with_message(message)
            .with_path(&self.path)
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if self.locked {
            let _ = FileExt::unlock(&self.file);
        }
    }
}

/// A read-only view pinned to one meta page.
pub struct Tx<'a> {
    db: &'a Db,
    meta: Meta,
}

impl<'a> Tx<'a> {
    /// Transaction id of the meta page this view reads from.
    pub fn txid(&self) -> u64 {
        self.meta.txid
    }

    fn root(&self) -> Bucket<'a> {
        Bucket {
            db: self.db,
            root: BucketRoot::Paged(self.meta.root),
        }
    }

    /// Visits the name of every top-level bucket in key order. Non-bucket root keys are skipped.
    pub fn for_each_bucket(
        &self,
        mut f: impl FnMut(&'a [u8]) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let mut cursor = self.root().cursor();
        let mut element = cursor.first_element()?;
        while let Some(current) = element {
            if current.is_bucket() {
                f(current.key)?;
            } else {
                debug!(
                    key = %String::from_utf8_lossy(current.key),
                    "skipping non-bucket root key"
                );
            }
            element = cursor.next_element()?;
        }
        Ok(())
    }

    /// Looks up a top-level bucket by name.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'a>>, Error> {
        let mut cursor = self.root().cursor();
        match cursor.seek_element(name)? {
            Some(found) if found.key == name && found.is_bucket() => {
                Bucket::from_value(self.db, found.value).map(Some)
            }
            _ => Ok(None),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum BucketRoot<'a> {
    Paged(u64),
    Inline(&'a [u8]),
}

#[derive(Clone, Copy)]
pub struct Bucket<'a> {
    db: &'a Db,
    root: BucketRoot<'a>,
}

impl<'a> Bucket<'a> {
    fn from_value(db: &'a Db, value: &'a [u8]) -> Result<Self, Error> {
        if value.len() < BUCKET_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("bucket header too small")
                .with_path(db.path()));
        }
        let root = match read_u64(value, 0) {
            0 => BucketRoot::Inline(&value[BUCKET_HEADER_LEN..]),
            pgid => BucketRoot::Paged(pgid),
        };
        Ok(Self { db, root })
    }

    pub fn cursor(&self) -> Cursor<'a> {
        Cursor::new(self.db, self.root)
    }
}

fn load(file: &File, path: &Path) -> Result<(Mmap, usize, Meta), Error> {
    let corrupt = |message: &str| {
        Error::new(ErrorKind::Corrupt)
            .with_message(message)
            .with_path(path)
    };
    let actual_size = file
        .metadata()
        .map(|meta| meta.len())
        .map_err(|err| Error::from_io(err, path))?;
    if actual_size < (PAGE_HEADER_LEN * 2) as u64 {
        return Err(corrupt("file size too small"));
    }

    let mmap = unsafe { Mmap::map(file).map_err(|err| Error::from_io(err, path))? };

    let meta0 = Meta::decode(&mmap).and_then(|meta| meta.validate().map(|_| meta));
    let page_size = match &meta0 {
        Ok(meta) => meta.page_size as usize,
        Err(_) => os_page_size(),
    };
    if page_size < PAGE_HEADER_LEN * 2 || mmap.len() < page_size.saturating_mul(2) {
        return Err(corrupt("file size too small"));
    }

    let meta1 = Meta::decode(&mmap[page_size..]).and_then(|meta| meta.validate().map(|_| meta));
    let meta = select_meta(meta0, meta1).map_err(|err| err.with_path(path))?;

    let required = meta.high_water.saturating_mul(page_size as u64);
    if required > mmap.len() as u64 {
        return Err(corrupt("file size too small"));
    }
    Ok((mmap, page_size, meta))
}

fn select_meta(meta0: Result<Meta, Error>, meta1: Result<Meta, Error>) -> Result<Meta, Error> {
    match (meta0, meta1) {
        (Ok(a), Ok(b)) => Ok(if b.txid > a.txid { b } else { a }),
        (Ok(meta), Err(_)) | (Err(_), Ok(meta)) => Ok(meta),
        (Err(err), Err(_)) => Err(err),
    }
}

fn os_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}
