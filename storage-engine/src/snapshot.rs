//! Binary snapshot of an embedded store.
//!
//! Layout: the magic `CCSNAP`, one version byte, then one frame per record:
//!
//! ```text
//! [u32 tree-name len][tree name][u32 key len][key][u32 value len][value]
//! ```
//!
//! All integers are big-endian. Values are stored verbatim, expiry header
//! included, so a restored record keeps its absolute expiry.

use bytes::{BufMut, BytesMut};
use shared::{Error, Result};
use std::io::{self, Read, Write};
use tracing::debug;

const MAGIC: &[u8; 6] = b"CCSNAP";
const VERSION: u8 = 1;
/// Records per `apply_batch` during restore.
const RESTORE_BATCH_SIZE: usize = 10_000;

pub fn write_snapshot<W: Write>(db: &sled::Db, mut writer: W) -> Result<u64> {
    let mut header = BytesMut::with_capacity(MAGIC.len() + 1);
    header.put_slice(MAGIC);
    header.put_u8(VERSION);
    writer.write_all(&header).map_err(write_error)?;

    let mut written = 0u64;
    for name in db.tree_names() {
        let tree = db
            .open_tree(&name)
            .map_err(|e| Error::BackendUnavailable(format!("backup: {}", e)))?;

        for item in tree.iter() {
            let (key, value) =
                item.map_err(|e| Error::BackendUnavailable(format!("backup: {}", e)))?;

            let mut frame = BytesMut::with_capacity(12 + name.len() + key.len() + value.len());
            put_field(&mut frame, &name)?;
            put_field(&mut frame, &key)?;
            put_field(&mut frame, &value)?;
            writer.write_all(&frame).map_err(write_error)?;
            written += 1;
        }
    }

    writer.flush().map_err(write_error)?;
    Ok(written)
}

pub fn read_snapshot<R: Read>(db: &sled::Db, mut reader: R) -> Result<u64> {
    let mut header = [0u8; 7];
    reader
        .read_exact(&mut header)
        .map_err(|e| Error::Encoding(format!("snapshot header unreadable: {}", e)))?;
    if &header[..MAGIC.len()] != MAGIC {
        return Err(Error::Encoding("not a cache snapshot".to_string()));
    }
    if header[MAGIC.len()] != VERSION {
        return Err(Error::Encoding(format!(
            "unsupported snapshot version {}",
            header[MAGIC.len()]
        )));
    }

    let mut loaded = 0u64;
    let mut pending: Option<(Vec<u8>, sled::Batch, usize)> = None;

    while let Some(tree_name) = read_field(&mut reader, true)? {
        let key = read_field(&mut reader, false)?.ok_or_else(truncated)?;
        let value = read_field(&mut reader, false)?.ok_or_else(truncated)?;

        // flush on tree change or when the batch is full
        if let Some((name, batch, _)) = pending.take_if(|(name, _, count)| {
            *name != tree_name || *count >= RESTORE_BATCH_SIZE
        }) {
            apply(db, &name, batch)?;
        }

        let (_, batch, count) =
            pending.get_or_insert_with(|| (tree_name, sled::Batch::default(), 0));
        batch.insert(key, value);
        *count += 1;
        loaded += 1;
    }

    if let Some((name, batch, _)) = pending {
        apply(db, &name, batch)?;
    }
    Ok(loaded)
}

fn apply(db: &sled::Db, tree_name: &[u8], batch: sled::Batch) -> Result<()> {
    let tree = db
        .open_tree(tree_name)
        .map_err(|e| Error::BackendUnavailable(format!("restore: {}", e)))?;
    tree.apply_batch(batch)
        .map_err(|e| Error::BackendUnavailable(format!("restore: {}", e)))?;
    debug!("restore applied batch to tree {}", String::from_utf8_lossy(tree_name));
    Ok(())
}

fn put_field(frame: &mut BytesMut, field: &[u8]) -> Result<()> {
    let len = u32::try_from(field.len()).map_err(|_| {
        Error::InvalidArgument(format!("snapshot field of {} bytes is too large", field.len()))
    })?;
    frame.put_u32(len);
    frame.put_slice(field);
    Ok(())
}

/// Read one length-prefixed field. A clean end of input before the length is
/// `None` when `eof_ok`, an error otherwise.
fn read_field<R: Read>(reader: &mut R, eof_ok: bool) -> Result<Option<Vec<u8>>> {
    let mut first = [0u8; 1];
    let read = loop {
        match reader.read(&mut first) {
            Ok(read) => break read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Encoding(format!("snapshot unreadable: {}", e))),
        }
    };
    if read == 0 {
        return if eof_ok { Ok(None) } else { Err(truncated()) };
    }

    let mut rest = [0u8; 3];
    reader.read_exact(&mut rest).map_err(|_| truncated())?;
    let len = u32::from_be_bytes([first[0], rest[0], rest[1], rest[2]]);

    // the length is untrusted; only what is actually present gets buffered
    let mut field = Vec::new();
    let read = Read::take(&mut *reader, u64::from(len))
        .read_to_end(&mut field)
        .map_err(|e| Error::Encoding(format!("snapshot unreadable: {}", e)))?;
    if read != len as usize {
        return Err(truncated());
    }
    Ok(Some(field))
}

fn truncated() -> Error {
    Error::Encoding("snapshot is truncated".to_string())
}

fn write_error(err: io::Error) -> Error {
    Error::Internal(format!("backup write failed: {}", err))
}
