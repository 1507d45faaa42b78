//! Packed tile-pyramid archive.
//!
//! Many small tile blobs in one random-access file: a fixed header, an
//! offset/size index table addressed by `x + y * table_width`, then the
//! item blobs. An index entry with offset 0 is an empty slot. Reads go
//! through positioned I/O so multiple open items share the file handle
//! without coordination.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, warn};

use crate::error::{MapError, MapResult};

const HDR_MAGIC: u64 = 0x59A1_4C76;
const ITEM_MAGIC: u64 = 0x97F2_1E5B;

const HEADER_SIZE: usize = 40;
const ITEM_HEADER_SIZE: usize = 24;
const ENTRY_SIZE: usize = 16;

/// Upper bound on `table_width * table_height`.
pub const TABLE_SIZE_MAX: u64 = 2 << 24;

#[derive(Debug, Clone, Copy)]
struct ArchiveHeader {
    table_width: u32,
    table_height: u32,
    tile_width: u32,
    tile_height: u32,
    empty_color: u32,
    suffix: [u8; 8],
}

impl ArchiveHeader {
    fn parse(buf: &[u8; HEADER_SIZE]) -> MapResult<Self> {
        let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        if magic != HDR_MAGIC {
            return Err(MapError::Archive("bad header magic".into()));
        }

        let table_width = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let table_height = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let tile_width = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let tile_height = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        let empty_color = u32::from_le_bytes(buf[24..28].try_into().unwrap());
        let reserved = u32::from_le_bytes(buf[28..32].try_into().unwrap());

        if reserved != 0 {
            return Err(MapError::Archive(
                "non-zero reserved field, different version?".into(),
            ));
        }

        let table_size = table_width as u64 * table_height as u64;
        if table_size > TABLE_SIZE_MAX {
            return Err(MapError::Archive(format!(
                "index table too large: {} entries",
                table_size
            )));
        }

        let mut suffix = [0u8; 8];
        suffix.copy_from_slice(&buf[32..40]);

        Ok(Self {
            table_width,
            table_height,
            tile_width,
            tile_height,
            empty_color,
            suffix,
        })
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&HDR_MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&self.table_width.to_le_bytes());
        buf[12..16].copy_from_slice(&self.table_height.to_le_bytes());
        buf[16..20].copy_from_slice(&self.tile_width.to_le_bytes());
        buf[20..24].copy_from_slice(&self.tile_height.to_le_bytes());
        buf[24..28].copy_from_slice(&self.empty_color.to_le_bytes());
        // reserved stays zero
        buf[32..40].copy_from_slice(&self.suffix);
        buf
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct IndexEntry {
    offset: u64,
    size: u64,
}

#[derive(Debug)]
struct AppendState {
    x: u32,
    y: u32,
    size: u64,
    offset: u64,
}

/// Random-access archive of tile blobs.
#[derive(Debug)]
pub struct TileArchive {
    file: File,
    header: ArchiveHeader,
    table: Vec<IndexEntry>,
    writable: bool,
    table_dirty: bool,
    append: Option<AppendState>,
}

impl TileArchive {
    /// Open an existing archive.
    ///
    /// Fails on I/O errors, bad magic, a non-zero reserved field or an
    /// oversize index table.
    pub fn open(path: &Path, writable: bool) -> MapResult<Self> {
        let mut file = OpenOptions::new().read(true).write(writable).open(path)?;

        let mut hdr_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut hdr_buf)?;
        let header = ArchiveHeader::parse(&hdr_buf)?;

        let table_size = header.table_width as usize * header.table_height as usize;
        let mut table_buf = vec![0u8; table_size * ENTRY_SIZE];
        file.read_exact(&mut table_buf)?;

        let mut table = Vec::with_capacity(table_size);
        for chunk in table_buf.chunks_exact(ENTRY_SIZE) {
            table.push(IndexEntry {
                offset: u64::from_le_bytes(chunk[0..8].try_into().unwrap()),
                size: u64::from_le_bytes(chunk[8..16].try_into().unwrap()),
            });
        }

        Ok(Self {
            file,
            header,
            table,
            writable,
            table_dirty: false,
            append: None,
        })
    }

    /// Create a new archive with an empty index table.
    ///
    /// The suffix is truncated to 7 bytes and NUL-terminated.
    pub fn create(
        path: &Path,
        table_width: u32,
        table_height: u32,
        tile_width: u32,
        tile_height: u32,
        suffix: &str,
        empty_color: u32,
    ) -> MapResult<Self> {
        let table_size = table_width as u64 * table_height as u64;
        if table_size > TABLE_SIZE_MAX {
            return Err(MapError::Archive(format!(
                "index table too large: {} entries",
                table_size
            )));
        }

        let mut suffix_buf = [0u8; 8];
        let raw = suffix.as_bytes();
        let len = raw.len().min(7);
        suffix_buf[..len].copy_from_slice(&raw[..len]);

        let header = ArchiveHeader {
            table_width,
            table_height,
            tile_width,
            tile_height,
            empty_color,
            suffix: suffix_buf,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        file.write_all(&header.to_bytes())?;
        file.write_all(&vec![0u8; table_size as usize * ENTRY_SIZE])?;

        Ok(Self {
            file,
            header,
            table: vec![IndexEntry::default(); table_size as usize],
            writable: true,
            table_dirty: false,
            append: None,
        })
    }

    /// Close the archive, flushing a dirty index table.
    ///
    /// Fails while an append is in progress; finishing the append first
    /// is the only way to keep the on-disk file consistent. Open item
    /// cursors borrow the archive, so they cannot outlive it.
    pub fn close(mut self) -> MapResult<()> {
        if self.append.is_some() {
            return Err(MapError::Archive("close with append in progress".into()));
        }
        self.flush_table()?;
        Ok(())
    }

    fn flush_table(&mut self) -> MapResult<()> {
        if !self.table_dirty {
            return Ok(());
        }
        // Payload bytes must be durable before the index points at them.
        self.file.sync_all()?;

        let mut buf = Vec::with_capacity(self.table.len() * ENTRY_SIZE);
        for entry in &self.table {
            buf.extend_from_slice(&entry.offset.to_le_bytes());
            buf.extend_from_slice(&entry.size.to_le_bytes());
        }
        write_at(&self.file, HEADER_SIZE as u64, &buf)?;
        self.table_dirty = false;
        Ok(())
    }

    /// Tile width stored in the archive header.
    pub fn tile_width(&self) -> u32 {
        self.header.tile_width
    }

    /// Tile height stored in the archive header.
    pub fn tile_height(&self) -> u32 {
        self.header.tile_height
    }

    /// Index table dimensions.
    pub fn table_size(&self) -> (u32, u32) {
        (self.header.table_width, self.header.table_height)
    }

    /// Placeholder color for empty slots.
    pub fn empty_color(&self) -> u32 {
        self.header.empty_color
    }

    /// File suffix of the stored blobs, without the NUL padding.
    pub fn suffix(&self) -> &str {
        let end = self
            .header
            .suffix
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.header.suffix.len());
        std::str::from_utf8(&self.header.suffix[..end]).unwrap_or("")
    }

    fn index(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.header.table_width || y >= self.header.table_height {
            debug!("archive index ({}, {}) out of range", x, y);
            return None;
        }
        Some(x as usize + y as usize * self.header.table_width as usize)
    }

    /// Byte offset of the item at `(x, y)`, `None` when out of range.
    pub fn item_offset(&self, x: u32, y: u32) -> Option<u64> {
        self.index(x, y).map(|i| self.table[i].offset)
    }

    /// Payload size of the item at `(x, y)`, `None` when out of range.
    pub fn item_size(&self, x: u32, y: u32) -> Option<u64> {
        self.index(x, y).map(|i| self.table[i].size)
    }

    /// Whether the slot at `(x, y)` holds an item.
    pub fn is_used(&self, x: u32, y: u32) -> bool {
        self.item_offset(x, y).is_some_and(|off| off != 0)
    }

    /// Open a read cursor over the item at `(x, y)`.
    ///
    /// Returns `Ok(None)` for an empty slot. Validates the on-disk item
    /// header; a stored size or position that disagrees with the index is
    /// logged and execution continues with the index values.
    pub fn open_item(&self, x: u32, y: u32) -> MapResult<Option<ItemCursor<'_>>> {
        let Some(idx) = self.index(x, y) else {
            return Err(MapError::Archive(format!(
                "item ({}, {}) out of table range",
                x, y
            )));
        };

        let entry = self.table[idx];
        if entry.offset == 0 {
            return Ok(None);
        }

        let mut hdr_buf = [0u8; ITEM_HEADER_SIZE];
        read_exact_at(&self.file, entry.offset, &mut hdr_buf)?;

        let magic = u64::from_le_bytes(hdr_buf[0..8].try_into().unwrap());
        if magic != ITEM_MAGIC {
            return Err(MapError::Archive(format!(
                "bad item magic at ({}, {})",
                x, y
            )));
        }

        let hx = u32::from_le_bytes(hdr_buf[8..12].try_into().unwrap());
        let hy = u32::from_le_bytes(hdr_buf[12..16].try_into().unwrap());
        let hsize = u64::from_le_bytes(hdr_buf[16..24].try_into().unwrap());

        if hsize != entry.size {
            warn!(
                "item ({}, {}) header size {} disagrees with index size {}",
                x, y, hsize, entry.size
            );
        }
        if hx != x || hy != y {
            warn!("item ({}, {}) header claims position ({}, {})", x, y, hx, hy);
        }

        Ok(Some(ItemCursor {
            archive: self,
            offset: entry.offset + ITEM_HEADER_SIZE as u64,
            size: entry.size,
            position: 0,
        }))
    }

    /// Read the whole payload of the item at `(x, y)`.
    ///
    /// `Ok(None)` for an empty slot, `Err` on I/O failure or a truncated
    /// payload.
    pub fn read_whole(&self, x: u32, y: u32) -> MapResult<Option<Vec<u8>>> {
        let Some(mut item) = self.open_item(x, y)? else {
            return Ok(None);
        };

        let mut buf = Vec::with_capacity(item.size as usize);
        item.read_to_end(&mut buf)?;

        if (buf.len() as u64) < item.size {
            return Err(MapError::Archive(format!(
                "item ({}, {}) payload truncated",
                x, y
            )));
        }

        Ok(Some(buf))
    }

    /// Begin appending an item at `(x, y)`: seek to EOF and write a
    /// placeholder item header.
    ///
    /// # Panics
    ///
    /// Panics on protocol misuse: read-only archive, coordinates out of
    /// range, or an append already in progress. These leave the on-disk
    /// file unrecoverable, so they abort instead of returning.
    pub fn append_item(&mut self, x: u32, y: u32) -> MapResult<()> {
        assert!(self.writable, "append on a read-only archive");
        assert!(self.append.is_none(), "append already in progress");
        assert!(
            x < self.header.table_width && y < self.header.table_height,
            "append position ({}, {}) out of table range",
            x,
            y
        );

        let offset = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&[0u8; ITEM_HEADER_SIZE])?;

        self.append = Some(AppendState {
            x,
            y,
            size: 0,
            offset,
        });
        Ok(())
    }

    /// Append payload bytes to the item started with [`Self::append_item`].
    ///
    /// # Panics
    ///
    /// Panics when no append is in progress.
    pub fn append_data(&mut self, buf: &[u8]) -> MapResult<()> {
        let append = self.append.as_mut().expect("no append in progress");

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(buf)?;
        append.size += buf.len() as u64;
        Ok(())
    }

    /// Finish the append: rewrite the item header with the final size and
    /// update the in-memory index entry.
    ///
    /// # Panics
    ///
    /// Panics when no append is in progress.
    pub fn append_finish(&mut self) -> MapResult<()> {
        let append = self.append.take().expect("no append in progress");

        let mut hdr = [0u8; ITEM_HEADER_SIZE];
        hdr[0..8].copy_from_slice(&ITEM_MAGIC.to_le_bytes());
        hdr[8..12].copy_from_slice(&append.x.to_le_bytes());
        hdr[12..16].copy_from_slice(&append.y.to_le_bytes());
        hdr[16..24].copy_from_slice(&append.size.to_le_bytes());
        write_at(&self.file, append.offset, &hdr)?;

        let idx = append.x as usize + append.y as usize * self.header.table_width as usize;
        self.table[idx] = IndexEntry {
            offset: append.offset,
            size: append.size,
        };
        self.table_dirty = true;
        Ok(())
    }

    /// Zero the index entry at `(x, y)`. The blob bytes are leaked on
    /// disk; the archive format has no free-space management.
    pub fn remove_item(&mut self, x: u32, y: u32) {
        let Some(idx) = self.index(x, y) else {
            return;
        };
        self.table[idx] = IndexEntry::default();
        self.table_dirty = true;
    }
}

impl Drop for TileArchive {
    fn drop(&mut self) {
        if self.table_dirty {
            if let Err(e) = self.flush_table() {
                warn!("archive index flush failed on drop: {}", e);
            }
        }
    }
}

/// Read cursor over one archive item.
///
/// Each cursor has an independent position; reads use positioned I/O on
/// the shared file handle. A read advances the position by exactly the
/// number of bytes returned; a failed read does not advance it.
#[derive(Debug)]
pub struct ItemCursor<'a> {
    archive: &'a TileArchive,
    offset: u64,
    size: u64,
    position: u64,
}

impl ItemCursor<'_> {
    /// Payload size of the item.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current read position.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Read for ItemCursor<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = (self.size - self.position) as usize;
        let count = buf.len().min(remaining);
        if count == 0 {
            return Ok(0);
        }

        let n = read_at(
            &self.archive.file,
            self.offset + self.position,
            &mut buf[..count],
        )?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for ItemCursor<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(off) => off as i64,
            SeekFrom::Current(off) => self.position as i64 + off,
            SeekFrom::End(off) => self.size as i64 + off,
        };

        if new_pos < 0 || new_pos > self.size as i64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek out of item bounds",
            ));
        }

        self.position = new_pos as u64;
        Ok(self.position)
    }
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = read_at(file, offset, buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated archive",
            ));
        }
        offset += n as u64;
        buf = &mut buf[n..];
    }
    Ok(())
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        offset += n as u64;
        buf = &buf[n..];
    }
    Ok(())
}
