//! Purpose: Build small, valid bolt database images for tests.
//! Exports: `FixtureBuilder`, `FixtureImage`.
//! Role: Test support shared by unit tests and the integration suite; the CLI never calls it.
//! Invariants: Images match the on-disk layout the reader expects (two metas, freelist, trees).
//! Invariants: Writes only to brand-new paths chosen by the caller.
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;

use crate::core::format::{
    BRANCH_PAGE_FLAG, BUCKET_HEADER_LEN, BUCKET_LEAF_FLAG, ELEMENT_LEN, FREELIST_PAGE_FLAG,
    LEAF_PAGE_FLAG, META_PAGE_FLAG, PAGE_HEADER_LEN,
};
use crate::core::page::{Meta, PageHeader, write_u32, write_u64};

const DEFAULT_PAGE_SIZE: usize = 4096;
const DEFAULT_LEAF_CAPACITY: usize = 64;
const FREELIST_PGID: u64 = 2;

#[derive(Default)]
struct FixtureBucket {
    inline: bool,
    records: BTreeMap<Vec<u8>, Vec<u8>>,
    nested: BTreeSet<Vec<u8>>,
}

pub struct FixtureBuilder {
    page_size: usize,
    leaf_capacity: usize,
    buckets: BTreeMap<Vec<u8>, FixtureBucket>,
    root_values: BTreeMap<Vec<u8>, Vec<u8>>,
}

pub struct FixtureImage {
    pub bytes: Vec<u8>,
    pub page_size: usize,
    pub root_pgid: u64,
    /// Root page of every bucket stored in its own pages, keyed by bucket name.
    pub bucket_pages: BTreeMap<Vec<u8>, u64>,
}

struct LeafItem {
    flags: u32,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl Default for FixtureBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FixtureBuilder {
    pub fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            leaf_capacity: DEFAULT_LEAF_CAPACITY,
            buckets: BTreeMap::new(),
            root_values: BTreeMap::new(),
        }
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Maximum elements per leaf or branch page; small values force deeper trees.
    pub fn leaf_capacity(mut self, capacity: usize) -> Self {
        self.leaf_capacity = capacity.max(2);
        self
    }

    /// Adds records to a bucket stored in its own pages.
    pub fn bucket<I, K, V>(self, name: impl AsRef<[u8]>, records: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.add(name.as_ref(), false, records)
    }

    /// Adds records to a bucket stored inside its parent's leaf value.
    pub fn inline_bucket<I, K, V>(self, name: impl AsRef<[u8]>, records: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.add(name.as_ref(), true, records)
    }

    /// Adds an empty sub-bucket named `child` under `parent`.
    pub fn nested_bucket(mut self, parent: impl AsRef<[u8]>, child: impl AsRef<[u8]>) -> Self {
        self.buckets
            .entry(parent.as_ref().to_vec())
            .or_default()
            .nested
            .insert(child.as_ref().to_vec());
        self
    }

    /// Adds a plain key/value at the root level, next to the buckets.
    pub fn root_value(mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        self.root_values
            .insert(key.as_ref().to_vec(), value.as_ref().to_vec());
        self
    }

    fn add<I, K, V>(mut self, name: &[u8], inline: bool, records: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let bucket = self.buckets.entry(name.to_vec()).or_default();
        bucket.inline = inline;
        for (key, value) in records {
            bucket
                .records
                .insert(key.as_ref().to_vec(), value.as_ref().to_vec());
        }
        self
    }

    pub fn build(self) -> FixtureImage {
        let mut writer = PageWriter {
            page_size: self.page_size,
            leaf_capacity: self.leaf_capacity,
            bytes: vec![0u8; self.page_size * 3],
            next_pgid: 3,
        };
        writer.put_header(
            FREELIST_PGID,
            PageHeader {
                id: FREELIST_PGID,
                flags: FREELIST_PAGE_FLAG,
                count: 0,
                overflow: 0,
            },
        );

        let mut bucket_pages = BTreeMap::new();
        let mut root_items = Vec::new();
        for (name, bucket) in &self.buckets {
            let items = bucket_items(bucket);
            let value = if bucket.inline {
                let mut value = bucket_header(0);
                value.extend(encode_leaf(0, &items));
                value
            } else {
                let pgid = writer.write_tree(items);
                bucket_pages.insert(name.clone(), pgid);
                bucket_header(pgid)
            };
            root_items.push(LeafItem {
                flags: BUCKET_LEAF_FLAG,
                key: name.clone(),
                value,
            });
        }
        for (key, value) in &self.root_values {
            root_items.push(LeafItem {
                flags: 0,
                key: key.clone(),
                value: value.clone(),
            });
        }
        root_items.sort_by(|a, b| a.key.cmp(&b.key));
        let root_pgid = writer.write_tree(root_items);

        let high_water = writer.next_pgid;
        for (pgid, txid) in [(0u64, 0u64), (1, 1)] {
            writer.put_header(
                pgid,
                PageHeader {
                    id: pgid,
                    flags: META_PAGE_FLAG,
                    count: 0,
                    overflow: 0,
                },
            );
            let meta = Meta::new(
                self.page_size as u32,
                root_pgid,
                FREELIST_PGID,
                high_water,
                txid,
            );
            let start = pgid as usize * self.page_size + PAGE_HEADER_LEN;
            let encoded = meta.encode();
            writer.bytes[start..start + encoded.len()].copy_from_slice(&encoded);
        }

        FixtureImage {
            bytes: writer.bytes,
            page_size: self.page_size,
            root_pgid,
            bucket_pages,
        }
    }

    pub fn write(self, path: impl AsRef<Path>) -> io::Result<()> {
        std::fs::write(path, self.build().bytes)
    }
}

struct PageWriter {
    page_size: usize,
    leaf_capacity: usize,
    bytes: Vec<u8>,
    next_pgid: u64,
}

impl PageWriter {
    fn put_header(&mut self, pgid: u64, header: PageHeader) {
        let start = pgid as usize * self.page_size;
        self.bytes[start..start + PAGE_HEADER_LEN].copy_from_slice(&header.encode());
    }

    /// Appends an encoded page (plus overflow pages as needed) and returns its id.
    fn alloc(&mut self, encode: impl FnOnce(u64) -> Vec<u8>) -> u64 {
        let pgid = self.next_pgid;
        let mut page = encode(pgid);
        let pages = page.len().div_ceil(self.page_size).max(1);
        write_u32(&mut page, 12, (pages - 1) as u32);
        page.resize(pages * self.page_size, 0);
        self.bytes.extend_from_slice(&page);
        self.next_pgid += pages as u64;
        pgid
    }

    /// Writes sorted leaf items as a tree and returns the root page id.
    fn write_tree(&mut self, items: Vec<LeafItem>) -> u64 {
        if items.is_empty() {
            return self.alloc(|pgid| encode_leaf(pgid, &[]));
        }
        let mut level: Vec<(Vec<u8>, u64)> = items
            .chunks(self.leaf_capacity)
            .map(|chunk| {
                let pgid = self.alloc(|pgid| encode_leaf(pgid, chunk));
                (chunk[0].key.clone(), pgid)
            })
            .collect();
        while level.len() > 1 {
            level = level
                .chunks(self.leaf_capacity)
                .map(|chunk| {
                    let pgid = self.alloc(|pgid| encode_branch(pgid, chunk));
                    (chunk[0].0.clone(), pgid)
                })
                .collect();
        }
        level[0].1
    }
}

fn bucket_items(bucket: &FixtureBucket) -> Vec<LeafItem> {
    let mut items: Vec<LeafItem> = bucket
        .records
        .iter()
        .map(|(key, value)| LeafItem {
            flags: 0,
            key: key.clone(),
            value: value.clone(),
        })
        .collect();
    for child in &bucket.nested {
        let mut value = bucket_header(0);
        value.extend(encode_leaf(0, &[]));
        items.push(LeafItem {
            flags: BUCKET_LEAF_FLAG,
            key: child.clone(),
            value,
        });
    }
    items.sort_by(|a, b| a.key.cmp(&b.key));
    items
}

fn bucket_header(root: u64) -> Vec<u8> {
    let mut header = vec![0u8; BUCKET_HEADER_LEN];
    write_u64(&mut header, 0, root);
    header
}

fn encode_leaf(pgid: u64, items: &[LeafItem]) -> Vec<u8> {
    let mut page = page_with_elements(pgid, LEAF_PAGE_FLAG, items.len());
    for (index, item) in items.iter().enumerate() {
        let elem = PAGE_HEADER_LEN + index * ELEMENT_LEN;
        let pos = page.len() - elem;
        write_u32(&mut page, elem, item.flags);
        write_u32(&mut page, elem + 4, pos as u32);
        write_u32(&mut page, elem + 8, item.key.len() as u32);
        write_u32(&mut page, elem + 12, item.value.len() as u32);
        page.extend_from_slice(&item.key);
        page.extend_from_slice(&item.value);
    }
    page
}

fn encode_branch(pgid: u64, children: &[(Vec<u8>, u64)]) -> Vec<u8> {
    let mut page = page_with_elements(pgid, BRANCH_PAGE_FLAG, children.len());
    for (index, (key, child)) in children.iter().enumerate() {
        let elem = PAGE_HEADER_LEN + index * ELEMENT_LEN;
        let pos = page.len() - elem;
        write_u32(&mut page, elem, pos as u32);
        write_u32(&mut page, elem + 4, key.len() as u32);
        write_u64(&mut page, elem + 8, *child);
        page.extend_from_slice(key);
    }
    page
}

fn page_with_elements(pgid: u64, flags: u16, count: usize) -> Vec<u8> {
    let header = PageHeader {
        id: pgid,
        flags,
        count: count as u16,
        overflow: 0,
    };
    let mut page = header.encode().to_vec();
    page.resize(PAGE_HEADER_LEN + count * ELEMENT_LEN, 0);
    page
}
