// Bolt page header, element layout, and meta page decoding.
use crate::core::error::{Error, ErrorKind};
use crate::core::format::{
    self, BRANCH_PAGE_FLAG, BUCKET_LEAF_FLAG, ELEMENT_LEN, LEAF_PAGE_FLAG, MAGIC,
    META_CHECKSUM_OFFSET, META_LEN, PAGE_HEADER_LEN,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageHeader {
    pub id: u64,
    pub flags: u16,
    pub count: u16,
    pub overflow: u32,
}

impl PageHeader {
    pub fn encode(&self) -> [u8; PAGE_HEADER_LEN] {
        let mut buf = [0u8; PAGE_HEADER_LEN];
        write_u64(&mut buf, 0, self.id);
        write_u16(&mut buf, 8, self.flags);
        write_u16(&mut buf, 10, self.count);
        write_u32(&mut buf, 12, self.overflow);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < PAGE_HEADER_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("page header too small"));
        }
        Ok(Self {
            id: read_u64(buf, 0),
            flags: read_u16(buf, 8),
            count: read_u16(buf, 10),
            overflow: read_u32(buf, 12),
        })
    }
}

/// A branch or leaf page borrowed from the map (or from an inline bucket value).
#[derive(Clone, Copy, Debug)]
pub struct Page<'a> {
    pub header: PageHeader,
    data: &'a [u8],
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LeafElement<'a> {
    pub flags: u32,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl LeafElement<'_> {
    pub fn is_bucket(&self) -> bool {
        self.flags & BUCKET_LEAF_FLAG != 0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BranchElement<'a> {
    pub key: &'a [u8],
    pub child: u64,
}

impl<'a> Page<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, Error> {
        let header = PageHeader::decode(data)?;
        let elements_end = PAGE_HEADER_LEN + header.count as usize * ELEMENT_LEN;
        if elements_end > data.len() {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("element table exceeds page")
                .with_page(header.id));
        }
        Ok(Self { header, data })
    }

    pub fn count(&self) -> usize {
        self.header.count as usize
    }

    pub fn is_leaf(&self) -> bool {
        self.header.flags & LEAF_PAGE_FLAG != 0
    }

    pub fn is_branch(&self) -> bool {
        self.header.flags & BRANCH_PAGE_FLAG != 0
    }

    pub fn leaf_element(&self, index: usize) -> Result<LeafElement<'a>, Error> {
        let elem = self.element_offset(index)?;
        let flags = read_u32(self.data, elem);
        let pos = read_u32(self.data, elem + 4) as usize;
        let ksize = read_u32(self.data, elem + 8) as usize;
        let vsize = read_u32(self.data, elem + 12) as usize;
        let key_start = elem + pos;
        let key_end = key_start + ksize;
        let value_end = key_end + vsize;
        if value_end > self.data.len() {
            return Err(self.corrupt("leaf element exceeds page"));
        }
        Ok(LeafElement {
            flags,
            key: &self.data[key_start..key_end],
            value: &self.data[key_end..value_end],
        })
    }

    pub fn branch_element(&self, index: usize) -> Result<BranchElement<'a>, Error> {
        let elem = self.element_offset(index)?;
        let pos = read_u32(self.data, elem) as usize;
        let ksize = read_u32(self.data, elem + 4) as usize;
        let child = read_u64(self.data, elem + 8);
        let key_start = elem + pos;
        let key_end = key_start + ksize;
        if key_end > self.data.len() {
            return Err(self.corrupt("branch element exceeds page"));
        }
        Ok(BranchElement {
            key: &self.data[key_start..key_end],
            child,
        })
    }

    fn element_offset(&self, index: usize) -> Result<usize, Error> {
        if index >= self.count() {
            return Err(self.corrupt("element index out of range"));
        }
        Ok(PAGE_HEADER_LEN + index * ELEMENT_LEN)
    }

    fn corrupt(&self, message: &str) -> Error {
        Error::new(ErrorKind::Corrupt)
            .with_message(message)
            .with_page(self.header.id)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Meta {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub flags: u32,
    pub root: u64,
    pub sequence: u64,
    pub freelist: u64,
    pub high_water: u64,
    pub txid: u64,
    pub checksum: u64,
}

impl Meta {
    /// Builds a meta record with a freshly computed checksum.
    pub fn new(page_size: u32, root: u64, freelist: u64, high_water: u64, txid: u64) -> Self {
        let mut meta = Self {
            magic: MAGIC,
            version: format::FORMAT_VERSION,
            page_size,
            flags: 0,
            root,
            sequence: 0,
            freelist,
            high_water,
            txid,
            checksum: 0,
        };
        meta.checksum = meta.sum();
        meta
    }

    pub fn encode(&self) -> [u8; META_LEN] {
        let mut buf = [0u8; META_LEN];
        write_u32(&mut buf, 0, self.magic);
        write_u32(&mut buf, 4, self.version);
        write_u32(&mut buf, 8, self.page_size);
        write_u32(&mut buf, 12, self.flags);
        write_u64(&mut buf, 16, self.root);
        write_u64(&mut buf, 24, self.sequence);
        write_u64(&mut buf, 32, self.freelist);
        write_u64(&mut buf, 40, self.high_water);
        write_u64(&mut buf, 48, self.txid);
        write_u64(&mut buf, 56, self.checksum);
        buf
    }

    /// Decodes the meta record stored right after a page header.
    pub fn decode(page: &[u8]) -> Result<Self, Error> {
        if page.len() < PAGE_HEADER_LEN + META_LEN {
            return Err(Error::new(ErrorKind::Corrupt).with_message("file size too small"));
        }
        let buf = &page[PAGE_HEADER_LEN..PAGE_HEADER_LEN + META_LEN];
        Ok(Self {
            magic: read_u32(buf, 0),
            version: read_u32(buf, 4),
            page_size: read_u32(buf, 8),
            flags: read_u32(buf, 12),
            root: read_u64(buf, 16),
            sequence: read_u64(buf, 24),
            freelist: read_u64(buf, 32),
            high_water: read_u64(buf, 40),
            txid: read_u64(buf, 48),
            checksum: read_u64(buf, 56),
        })
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.magic != MAGIC {
            return Err(Error::new(ErrorKind::Corrupt).with_message("invalid database"));
        }
        if self.version != format::FORMAT_VERSION {
            return Err(format::format_version_error(self.version));
        }
        if self.checksum != self.sum() {
            return Err(Error::new(ErrorKind::Corrupt).with_message("checksum error"));
        }
        Ok(())
    }

    fn sum(&self) -> u64 {
        fnv1a64(&self.encode()[..META_CHECKSUM_OFFSET])
    }
}

pub fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    let mut out = [0u8; 2];
    out.copy_from_slice(&buf[offset..offset + 2]);
    u16::from_le_bytes(out)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::{Meta, Page, PageHeader, fnv1a64, write_u32};
    use crate::core::error::ErrorKind;
    use crate::core::format::{LEAF_PAGE_FLAG, META_LEN, PAGE_HEADER_LEN};

    fn meta_page(meta: &Meta) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_HEADER_LEN + META_LEN];
        page[PAGE_HEADER_LEN..].copy_from_slice(&meta.encode());
        page
    }

    #[test]
    fn fnv_matches_reference_vectors() {
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn meta_roundtrip_validates() {
        let meta = Meta::new(4096, 3, 2, 4, 7);
        let decoded = Meta::decode(&meta_page(&meta)).expect("decode");
        assert_eq!(decoded, meta);
        decoded.validate().expect("valid");
    }

    #[test]
    fn meta_rejects_bad_magic_version_and_checksum() {
        let mut meta = Meta::new(4096, 3, 2, 4, 1);
        meta.magic = 0xDEAD_BEEF;
        let err = meta.validate().expect_err("magic");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(err.message(), Some("invalid database"));

        let mut meta = Meta::new(4096, 3, 2, 4, 1);
        meta.version = 1;
        let err = meta.validate().expect_err("version");
        assert!(err.message().unwrap().starts_with("version mismatch"));

        let mut meta = Meta::new(4096, 3, 2, 4, 1);
        meta.txid = 2;
        let err = meta.validate().expect_err("checksum");
        assert_eq!(err.message(), Some("checksum error"));
    }

    #[test]
    fn truncated_meta_is_too_small() {
        let err = Meta::decode(&[0u8; 20]).expect_err("short");
        assert_eq!(err.message(), Some("file size too small"));
    }

    #[test]
    fn leaf_element_bounds_are_checked() {
        let header = PageHeader {
            id: 9,
            flags: LEAF_PAGE_FLAG,
            count: 1,
            overflow: 0,
        };
        let mut data = vec![0u8; 64];
        data[..PAGE_HEADER_LEN].copy_from_slice(&header.encode());
        // pos=16, ksize=8, vsize=1000 runs past the page.
        write_u32(&mut data, PAGE_HEADER_LEN + 4, 16);
        write_u32(&mut data, PAGE_HEADER_LEN + 8, 8);
        write_u32(&mut data, PAGE_HEADER_LEN + 12, 1000);
        let page = Page::parse(&data).expect("parse");
        assert!(page.is_leaf());
        let err = page.leaf_element(0).expect_err("out of bounds");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(err.page(), Some(9));

        let err = page.leaf_element(1).expect_err("index");
        assert_eq!(err.message(), Some("element index out of range"));
    }

    #[test]
    fn element_table_larger_than_page_is_rejected() {
        let header = PageHeader {
            id: 4,
            flags: LEAF_PAGE_FLAG,
            count: 100,
            overflow: 0,
        };
        let mut data = vec![0u8; 64];
        data[..PAGE_HEADER_LEN].copy_from_slice(&header.encode());
        let err = Page::parse(&data).expect_err("table");
        assert_eq!(err.page(), Some(4));
    }
}
