// Forward cursor over a bucket's B+tree: branch descent, leaf walk, inline pages.
use crate::core::db::{BucketRoot, Db};
use crate::core::error::{Error, ErrorKind};
use crate::core::page::{LeafElement, Page};

/// Deeper trees than this only arise from cyclic (corrupt) branch pointers.
const MAX_DEPTH: usize = 64;

/// One key/value pair. `value` is `None` when the key names a nested bucket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Entry<'a> {
    pub key: &'a [u8],
    pub value: Option<&'a [u8]>,
}

impl<'a> From<LeafElement<'a>> for Entry<'a> {
    fn from(element: LeafElement<'a>) -> Self {
        let value = if element.is_bucket() {
            None
        } else {
            Some(element.value)
        };
        Self {
            key: element.key,
            value,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Frame<'a> {
    page: Page<'a>,
    index: usize,
}

pub struct Cursor<'a> {
    db: &'a Db,
    root: BucketRoot<'a>,
    stack: Vec<Frame<'a>>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(db: &'a Db, root: BucketRoot<'a>) -> Self {
        Self {
            db,
            root,
            stack: Vec::new(),
        }
    }

    /// Positions on the first key, or returns `None` for an empty bucket.
    pub fn first(&mut self) -> Result<Option<Entry<'a>>, Error> {
        Ok(self.first_element()?.map(Entry::from))
    }

    /// Advances to the next key; `None` once the bucket is exhausted.
    pub fn next(&mut self) -> Result<Option<Entry<'a>>, Error> {
        Ok(self.next_element()?.map(Entry::from))
    }

    pub(crate) fn first_element(&mut self) -> Result<Option<LeafElement<'a>>, Error> {
        self.stack.clear();
        let root = self.root_page()?;
        self.push(root)?;
        self.descend_first()?;
        if self.leaf_exhausted() {
            return self.next_element();
        }
        self.current()
    }

    /// Positions on the first key at or after `target`.
    pub(crate) fn seek_element(
        &mut self,
        target: &[u8],
    ) -> Result<Option<LeafElement<'a>>, Error> {
        self.stack.clear();
        let root = self.root_page()?;
        self.push(root)?;
        while let Some(frame) = self.stack.last().copied() {
            let page = frame.page;
            if page.is_leaf() {
                let mut index = 0;
                while index < page.count() && page.leaf_element(index)?.key < target {
                    index += 1;
                }
                self.set_index(index);
                break;
            }
            if page.count() == 0 {
                return Err(self.empty_branch(page));
            }
            // Last child whose separator key is <= target.
            let mut index = 0;
            for candidate in 1..page.count() {
                if page.branch_element(candidate)?.key > target {
                    break;
                }
                index = candidate;
            }
            self.set_index(index);
            let child = self.db.page(page.branch_element(index)?.child)?;
            self.push(child)?;
        }
        if self.leaf_exhausted() {
            return self.next_element();
        }
        self.current()
    }

    pub(crate) fn next_element(&mut self) -> Result<Option<LeafElement<'a>>, Error> {
        loop {
            // Pop until a page still has an unvisited element.
            let mut depth = self.stack.len();
            while depth > 0 {
                let frame = &mut self.stack[depth - 1];
                if frame.index + 1 < frame.page.count() {
                    frame.index += 1;
                    break;
                }
                depth -= 1;
            }
            if depth == 0 {
                self.stack.clear();
                return Ok(None);
            }
            self.stack.truncate(depth);
            self.descend_first()?;
            if self.leaf_exhausted() {
                continue;
            }
            return self.current();
        }
    }

    fn root_page(&self) -> Result<Page<'a>, Error> {
        match self.root {
            BucketRoot::Paged(id) => self.db.page(id),
            BucketRoot::Inline(bytes) => Page::parse(bytes),
        }
    }

    fn push(&mut self, page: Page<'a>) -> Result<(), Error> {
        if !page.is_leaf() && !page.is_branch() {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("unexpected page type {:#04x}", page.header.flags))
                .with_path(self.db.path())
                .with_page(page.header.id));
        }
        if self.stack.len() >= MAX_DEPTH {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("bucket tree too deep")
                .with_path(self.db.path())
                .with_page(page.header.id));
        }
        self.stack.push(Frame { page, index: 0 });
        Ok(())
    }

    fn descend_first(&mut self) -> Result<(), Error> {
        while let Some(frame) = self.stack.last().copied() {
            if frame.page.is_leaf() {
                return Ok(());
            }
            if frame.page.count() == 0 {
                return Err(self.empty_branch(frame.page));
            }
            let child = frame.page.branch_element(frame.index)?.child;
            let page = self.db.page(child)?;
            self.push(page)?;
        }
        Ok(())
    }

    fn set_index(&mut self, index: usize) {
        if let Some(frame) = self.stack.last_mut() {
            frame.index = index;
        }
    }

    fn empty_branch(&self, page: Page<'a>) -> Error {
        Error::new(ErrorKind::Corrupt)
            .with_message("empty branch page")
            .with_path(self.db.path())
            .with_page(page.header.id)
    }

    fn leaf_exhausted(&self) -> bool {
        self.stack
            .last()
            .is_none_or(|frame| frame.index >= frame.page.count())
    }

    fn current(&self) -> Result<Option<LeafElement<'a>>, Error> {
        match self.stack.last() {
            Some(frame) => frame.page.leaf_element(frame.index).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Entry;
    use crate::core::db::Db;
    use crate::core::error::ErrorKind;
    use crate::core::fixture::FixtureBuilder;

    fn collect_keys(db: &Db, bucket: &str) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        db.view(|tx| {
            let bucket = tx.bucket(bucket.as_bytes())?.expect("bucket");
            let mut cursor = bucket.cursor();
            let mut out = Vec::new();
            let mut entry = cursor.first()?;
            while let Some(Entry { key, value }) = entry {
                out.push((key.to_vec(), value.map(<[u8]>::to_vec)));
                entry = cursor.next()?;
            }
            Ok(out)
        })
        .expect("view")
    }

    #[test]
    fn walks_multi_leaf_bucket_in_key_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("multi.db");
        let records: Vec<(String, String)> = (0..50)
            .rev()
            .map(|i| (format!("key-{i:03}"), format!("value-{i}")))
            .collect();
        let image = FixtureBuilder::new()
            .leaf_capacity(7)
            .bucket("big", records)
            .build();
        assert!(!image.bucket_pages.is_empty());
        std::fs::write(&path, &image.bytes).expect("write");

        let db = Db::open(&path).expect("open");
        let keys = collect_keys(&db, "big");
        assert_eq!(keys.len(), 50);
        for (i, (key, value)) in keys.iter().enumerate() {
            assert_eq!(key, format!("key-{i:03}").as_bytes());
            assert_eq!(value.as_deref(), Some(format!("value-{i}").as_bytes()));
        }
        db.close().expect("close");
    }

    #[test]
    fn seek_lands_on_first_key_at_or_after_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seek.db");
        let records: Vec<(String, String)> = (0..40)
            .map(|i| (format!("key-{:03}", i * 2), format!("value-{i}")))
            .collect();
        FixtureBuilder::new()
            .leaf_capacity(3)
            .bucket("big", records)
            .write(&path)
            .expect("write");

        let db = Db::open(&path).expect("open");
        let seek = |target: &str| {
            db.view(|tx| {
                let bucket = tx.bucket(b"big")?.expect("bucket");
                let found = bucket.cursor().seek_element(target.as_bytes())?;
                Ok(found.map(|element| element.key.to_vec()))
            })
            .expect("view")
        };
        assert_eq!(seek("key-000"), Some(b"key-000".to_vec()));
        assert_eq!(seek("key-041"), Some(b"key-042".to_vec()));
        assert_eq!(seek("key-078"), Some(b"key-078".to_vec()));
        assert_eq!(seek("a"), Some(b"key-000".to_vec()));
        assert_eq!(seek("key-079"), None);
        assert_eq!(seek("z"), None);
        db.close().expect("close");
    }

    #[test]
    fn walks_inline_bucket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("inline.db");
        let image = FixtureBuilder::new()
            .inline_bucket("small", [("b", "2"), ("a", "1")])
            .build();
        assert!(!image.bucket_pages.contains_key(b"small".as_slice()));
        std::fs::write(&path, &image.bytes).expect("write");

        let db = Db::open(&path).expect("open");
        let keys = collect_keys(&db, "small");
        assert_eq!(
            keys,
            vec![
                (b"a".to_vec(), Some(b"1".to_vec())),
                (b"b".to_vec(), Some(b"2".to_vec())),
            ]
        );
        db.close().expect("close");
    }

    #[test]
    fn empty_bucket_yields_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.db");
        FixtureBuilder::new()
            .bucket("paged", Vec::<(String, String)>::new())
            .inline_bucket("inline", Vec::<(String, String)>::new())
            .write(&path)
            .expect("write");

        let db = Db::open(&path).expect("open");
        assert!(collect_keys(&db, "paged").is_empty());
        assert!(collect_keys(&db, "inline").is_empty());
        db.close().expect("close");
    }

    #[test]
    fn overflow_values_are_read_whole() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("overflow.db");
        let large = "x".repeat(10_000);
        FixtureBuilder::new()
            .bucket("blobs", [("large", large.as_str()), ("small", "s")])
            .write(&path)
            .expect("write");

        let db = Db::open(&path).expect("open");
        let keys = collect_keys(&db, "blobs");
        assert_eq!(keys[0].1.as_deref(), Some(large.as_bytes()));
        assert_eq!(keys[1].1.as_deref(), Some(b"s".as_slice()));
        db.close().expect("close");
    }

    #[test]
    fn nested_buckets_have_no_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested.db");
        FixtureBuilder::new()
            .bucket("outer", [("k", "v")])
            .nested_bucket("outer", "child")
            .write(&path)
            .expect("write");

        let db = Db::open(&path).expect("open");
        let keys = collect_keys(&db, "outer");
        assert_eq!(
            keys,
            vec![(b"child".to_vec(), None), (b"k".to_vec(), Some(b"v".to_vec()))]
        );
        db.close().expect("close");
    }

    #[test]
    fn damaged_page_type_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("damaged.db");
        let image = FixtureBuilder::new().bucket("a", [("k", "v")]).build();
        let page_id = image.bucket_pages["a".as_bytes()];
        let mut bytes = image.bytes;
        let flags_at = page_id as usize * image.page_size + 8;
        bytes[flags_at] = 0;
        bytes[flags_at + 1] = 0;
        std::fs::write(&path, &bytes).expect("write");

        let db = Db::open(&path).expect("open");
        let err = db
            .view(|tx| {
                let bucket = tx.bucket(b"a")?.expect("bucket");
                bucket.cursor().first().map(|entry| entry.is_some())
            })
            .expect_err("damaged");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(err.page(), Some(page_id));
        db.close().expect("close");
    }
}
