//! On-disk container format
//!
//! A container is a single file:
//!
//! - Offset 0x00: magic `CSK1` (4 bytes)
//! - Offset 0x04: format version (u16)
//! - Offset 0x06: reserved, must be zero (u16)
//! - Offset 0x08: index table count (u32)
//! - Offset 0x0C: root blob length (u32)
//! - Offset 0x10: root blob (bjson), then one table per persisted index:
//!   handle (u32), key kind tag (u8), entry count (u32), then per entry a
//!   kind-specific key followed by a u32-length-prefixed bjson value blob.
//!
//! Little-endian throughout. `open` rejects unknown magic or version and
//! any structural mismatch (truncated section, bad kind tag, trailing
//! garbage) as `CorruptFile`. Durability is whole-generation replacement:
//! a flush writes a sibling temp file, syncs it, and renames it over the
//! container, so a failed flush leaves the previous generation intact.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::index::{FloatOrd, IndexKey, KeyKind};

/// File magic, bumped with the format version on incompatible changes
pub(crate) const MAGIC: [u8; 4] = *b"CSK1";

/// Current format version
pub(crate) const VERSION: u16 = 1;

/// Suffix of the temp file used for generation replacement
const TMP_SUFFIX: &str = ".tmp";

/// One persisted index: stable handle, key kind, and the entries with
/// their values already encoded.
#[derive(Debug)]
pub(crate) struct IndexTable {
    pub(crate) handle: u32,
    pub(crate) kind: KeyKind,
    pub(crate) entries: Vec<(IndexKey, Vec<u8>)>,
}

/// Structurally validated container contents, values still encoded.
#[derive(Debug)]
pub(crate) struct RawContainer {
    pub(crate) root_blob: Vec<u8>,
    pub(crate) indexes: Vec<IndexTable>,
}

/// Serialize a container generation to `w`.
pub(crate) fn write_container(
    w: &mut impl Write,
    root_blob: &[u8],
    tables: &[IndexTable],
) -> io::Result<()> {
    w.write_all(&MAGIC)?;
    w.write_u16::<LittleEndian>(VERSION)?;
    w.write_u16::<LittleEndian>(0)?; // reserved
    w.write_u32::<LittleEndian>(tables.len() as u32)?;
    w.write_u32::<LittleEndian>(root_blob.len() as u32)?;
    w.write_all(root_blob)?;

    for table in tables {
        w.write_u32::<LittleEndian>(table.handle)?;
        w.write_u8(table.kind.as_tag())?;
        w.write_u32::<LittleEndian>(table.entries.len() as u32)?;
        for (key, blob) in &table.entries {
            write_key(w, key)?;
            w.write_u32::<LittleEndian>(blob.len() as u32)?;
            w.write_all(blob)?;
        }
    }
    Ok(())
}

fn write_key(w: &mut impl Write, key: &IndexKey) -> io::Result<()> {
    match key {
        IndexKey::Integer(v) => w.write_i32::<LittleEndian>(*v),
        IndexKey::Long(v) => w.write_i64::<LittleEndian>(*v),
        IndexKey::Float(v) => w.write_u64::<LittleEndian>(v.0.to_bits()),
        IndexKey::Date(v) => w.write_i64::<LittleEndian>(*v),
        IndexKey::String(v) => {
            w.write_u32::<LittleEndian>(v.len() as u32)?;
            w.write_all(v.as_bytes())
        }
    }
}

/// Parse and structurally validate a container file image.
pub(crate) fn read_container(data: &[u8]) -> StorageResult<RawContainer> {
    let mut scan = Scanner { data, pos: 0 };

    let magic = scan.take(4)?;
    if magic != MAGIC {
        return Err(StorageError::CorruptFile(
            "bad magic: not a container file".into(),
        ));
    }
    let version = scan.u16()?;
    if version != VERSION {
        return Err(StorageError::CorruptFile(format!(
            "unsupported format version {}",
            version
        )));
    }
    let reserved = scan.u16()?;
    if reserved != 0 {
        return Err(StorageError::CorruptFile(
            "reserved header field is not zero".into(),
        ));
    }

    let index_count = scan.u32()?;
    let root_len = scan.u32()? as usize;
    let root_blob = scan.take(root_len)?.to_vec();

    let mut indexes = Vec::new();
    for _ in 0..index_count {
        let handle = scan.u32()?;
        let kind_tag = scan.u8()?;
        let kind = KeyKind::from_tag(kind_tag).ok_or_else(|| {
            StorageError::CorruptFile(format!("invalid key kind tag {}", kind_tag))
        })?;
        let entry_count = scan.u32()?;

        let mut entries = Vec::new();
        for _ in 0..entry_count {
            let key = read_key(&mut scan, kind)?;
            let blob_len = scan.u32()? as usize;
            let blob = scan.take(blob_len)?.to_vec();
            entries.push((key, blob));
        }
        indexes.push(IndexTable {
            handle,
            kind,
            entries,
        });
    }

    if scan.remaining() != 0 {
        return Err(StorageError::CorruptFile(format!(
            "{} trailing bytes after last index table",
            scan.remaining()
        )));
    }

    Ok(RawContainer { root_blob, indexes })
}

fn read_key(scan: &mut Scanner<'_>, kind: KeyKind) -> StorageResult<IndexKey> {
    Ok(match kind {
        KeyKind::Integer => IndexKey::Integer(scan.i32()?),
        KeyKind::Long => IndexKey::Long(scan.i64()?),
        KeyKind::Float => IndexKey::Float(FloatOrd(f64::from_bits(scan.u64()?))),
        KeyKind::Date => IndexKey::Date(scan.i64()?),
        KeyKind::String => {
            let len = scan.u32()? as usize;
            let bytes = scan.take(len)?;
            IndexKey::String(String::from_utf8(bytes.to_vec()).map_err(|_| {
                StorageError::CorruptFile("invalid UTF-8 in string key".into())
            })?)
        }
    })
}

/// Write a new generation next to `path` and atomically swing it in.
pub(crate) fn replace_file(
    path: &Path,
    root_blob: &[u8],
    tables: &[IndexTable],
) -> StorageResult<()> {
    let tmp = tmp_path(path);
    let result = write_generation(&tmp, root_blob, tables)
        .and_then(|_| fs::rename(&tmp, path).map_err(StorageError::Io));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    } else {
        debug!(path = %path.display(), "container generation replaced");
    }
    result
}

fn write_generation(
    tmp: &Path,
    root_blob: &[u8],
    tables: &[IndexTable],
) -> StorageResult<()> {
    let file = File::create(tmp)?;
    let mut writer = BufWriter::new(file);
    write_container(&mut writer, root_blob, tables)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Temp file path used while writing a new generation
pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(TMP_SUFFIX);
    PathBuf::from(os)
}

struct Scanner<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> StorageResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(StorageError::CorruptFile(
                "container file is truncated".into(),
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> StorageResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> StorageResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> StorageResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> StorageResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> StorageResult<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> StorageResult<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tables() -> Vec<IndexTable> {
        vec![
            IndexTable {
                handle: 0,
                kind: KeyKind::String,
                entries: vec![
                    (IndexKey::String("a".into()), vec![0x03, 1, 0, 0, 0]),
                    (IndexKey::String("b".into()), vec![0x00]),
                ],
            },
            IndexTable {
                handle: 1,
                kind: KeyKind::Long,
                entries: vec![(IndexKey::Long(-7), vec![0x02])],
            },
        ]
    }

    #[test]
    fn test_container_roundtrip() {
        let root = vec![0x0A, 0, 0, 0, 0]; // empty record blob
        let mut buf = Vec::new();
        write_container(&mut buf, &root, &sample_tables()).unwrap();

        let raw = read_container(&buf).unwrap();
        assert_eq!(raw.root_blob, root);
        assert_eq!(raw.indexes.len(), 2);
        assert_eq!(raw.indexes[0].kind, KeyKind::String);
        assert_eq!(raw.indexes[0].entries.len(), 2);
        assert_eq!(raw.indexes[1].entries[0].0, IndexKey::Long(-7));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = Vec::new();
        write_container(&mut buf, &[0x00], &[]).unwrap();
        buf[0] = b'X';
        let err = read_container(&buf).unwrap_err();
        assert!(matches!(err, StorageError::CorruptFile(_)));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut buf = Vec::new();
        write_container(&mut buf, &[0x00], &[]).unwrap();
        buf[4] = 0xFF;
        let err = read_container(&buf).unwrap_err();
        assert!(matches!(err, StorageError::CorruptFile(_)));
    }

    #[test]
    fn test_truncated_rejected() {
        let mut buf = Vec::new();
        write_container(&mut buf, &[0x00], &sample_tables()).unwrap();
        buf.truncate(buf.len() - 3);
        let err = read_container(&buf).unwrap_err();
        assert!(matches!(err, StorageError::CorruptFile(_)));
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut buf = Vec::new();
        write_container(&mut buf, &[0x00], &[]).unwrap();
        buf.extend_from_slice(&[1, 2, 3]);
        let err = read_container(&buf).unwrap_err();
        assert!(matches!(err, StorageError::CorruptFile(_)));
    }

    #[test]
    fn test_float_key_bits_roundtrip() {
        let tables = vec![IndexTable {
            handle: 0,
            kind: KeyKind::Float,
            entries: vec![(IndexKey::Float(FloatOrd(-0.0)), vec![0x00])],
        }];
        let mut buf = Vec::new();
        write_container(&mut buf, &[0x00], &tables).unwrap();
        let raw = read_container(&buf).unwrap();
        match &raw.indexes[0].entries[0].0 {
            IndexKey::Float(f) => assert_eq!(f.0.to_bits(), (-0.0f64).to_bits()),
            other => panic!("expected float key, got {:?}", other),
        }
    }
}
