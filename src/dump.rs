//! Purpose: Walk every bucket of an open database and render it as one JSON document.
//! Exports: `Dump`, `BucketRecords`, `ReadPolicy`, `dump_database`, `collect`, `decode_bucket`,
//! `render`, `strip_leading_unprintable`, `is_printable_byte`.
//! Role: The enumerate -> decode -> serialize pipeline used by the CLI.
//! Invariants: All buckets are read inside a single read view; partial documents are never returned.
//! Invariants: Values are only trimmed of leading framing bytes, never parsed.
//! Invariants: Every stored bucket and key yields exactly one output entry, in engine order,
//! even when lossy text conversion makes two names print the same.
use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::debug;

use crate::core::db::{Bucket, Db, Tx};
use crate::core::error::{Error, ErrorKind};

/// Record key -> cleaned value for one bucket, in the bucket's key order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BucketRecords {
    entries: Vec<(String, String)>,
}

impl BucketRecords {
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for BucketRecords {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Bucket name -> records, in the database's bucket order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Dump {
    buckets: Vec<(String, BucketRecords)>,
}

impl Dump {
    pub fn buckets(&self) -> &[(String, BucketRecords)] {
        &self.buckets
    }
}

impl Serialize for Dump {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.buckets.len()))?;
        for (name, records) in &self.buckets {
            map.serialize_entry(name, records)?;
        }
        map.end()
    }
}

/// What to do when the walk hits a read error after the database opened.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ReadPolicy {
    /// Swallow the error and produce no document.
    #[default]
    Lenient,
    /// Surface the error to the caller.
    Strict,
}

/// Printability of a single byte taken as the code point U+0000..=U+00FF.
///
/// Multi-byte UTF-8 sequences are not decoded first, so a lead byte such as
/// `0xC3` counts as printable while continuation bytes `0x80..=0xA0` do not.
pub fn is_printable_byte(byte: u8) -> bool {
    matches!(byte, 0x20..=0x7E | 0xA1..=0xAC | 0xAE..=0xFF)
}

pub fn strip_leading_unprintable(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|byte| is_printable_byte(*byte))
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn decode_value(value: Option<&[u8]>) -> String {
    let trimmed = strip_leading_unprintable(value.unwrap_or_default());
    String::from_utf8_lossy(trimmed).into_owned()
}

fn decode_records(bucket: &Bucket<'_>) -> Result<BucketRecords, Error> {
    let mut records = BucketRecords::default();
    let mut cursor = bucket.cursor();
    let mut entry = cursor.first()?;
    while let Some(current) = entry {
        records.entries.push((
            String::from_utf8_lossy(current.key).into_owned(),
            decode_value(current.value),
        ));
        entry = cursor.next()?;
    }
    Ok(records)
}

/// Decodes one top-level bucket; an absent bucket yields no records.
pub fn decode_bucket(tx: &Tx<'_>, name: &[u8]) -> Result<BucketRecords, Error> {
    match tx.bucket(name)? {
        Some(bucket) => decode_records(&bucket),
        None => Ok(BucketRecords::default()),
    }
}

/// Reads every bucket inside one read view.
pub fn collect(db: &Db) -> Result<Dump, Error> {
    db.view(|tx| {
        debug!(txid = tx.txid(), "reading buckets");
        let mut dump = Dump::default();
        tx.for_each_bucket(|name| {
            let records = decode_bucket(tx, name)?;
            let name = String::from_utf8_lossy(name).into_owned();
            debug!(bucket = %name, records = records.len(), "decoded bucket");
            dump.buckets.push((name, records));
            Ok(())
        })?;
        Ok(dump)
    })
}

/// Runs `collect` under `policy`. `Ok(None)` means a lenient walk failed.
pub fn dump_database(db: &Db, policy: ReadPolicy) -> Result<Option<Dump>, Error> {
    match collect(db) {
        Ok(dump) => Ok(Some(dump)),
        Err(err) => match policy {
            ReadPolicy::Strict => Err(err),
            ReadPolicy::Lenient => {
                debug!(error = %err, "read failed; emitting no document");
                Ok(None)
            }
        },
    }
}

/// Two-space indented JSON; the empty string when there is no document.
pub fn render(dump: Option<&Dump>) -> Result<String, Error> {
    let Some(dump) = dump else {
        return Ok(String::new());
    };
    serde_json::to_string_pretty(dump).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode JSON")
            .with_source(err)
    })
}
