//! Minimal reader for OLE2 *Compound File Binary* containers.
//!
//! Encrypted OOXML documents are wrapped in a CFB container holding two
//! streams at the root level, `EncryptionInfo` and `EncryptedPackage`. This
//! reader implements just enough of [MS-CFB] to pull full streams out of an
//! in-memory buffer: header validation, DIFAT/FAT/miniFAT loading and the
//! directory walk. Partial reads, writes and nested storages are not needed.

use crate::error::{Result, XlsxCryptoError};

const SIGNATURE: [u8; 8] = [0xd0, 0xcf, 0x11, 0xe0, 0xa1, 0xb1, 0x1a, 0xe1];

const MAXREGSECT: u32 = 0xffff_fffa;
const ENDOFCHAIN: u32 = 0xffff_fffe;
const FREESECT: u32 = 0xffff_ffff;

const DIR_ENTRY_LEN: usize = 128;
const MINI_SECTOR_LEN: usize = 64;
const MINI_STREAM_CUTOFF: u64 = 4096;
const HEADER_DIFAT_ENTRIES: usize = 109;

/// An opened compound file over a borrowed byte buffer.
///
/// The FAT, miniFAT and directory are decoded eagerly by [`open`](Self::open)
/// so that [`stream`](Self::stream) only has to follow sector chains.
#[derive(Debug)]
pub struct CompoundFile<'a> {
    data: &'a [u8],
    sector_len: usize,
    fat: Vec<u32>,
    minifat: Vec<u32>,
    dir: Vec<DirEntry>,
}

#[derive(Debug)]
struct DirEntry {
    name: String,
    objtype: u8,
    start_sector: u32,
    size: u64,
}

const OBJTYPE_STREAM: u8 = 2;
const OBJTYPE_ROOT: u8 = 5;

fn rdu16(data: &[u8], off: usize) -> Result<u16> {
    data.get(off..off + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(XlsxCryptoError::NotCompoundFile)
}

fn rdu32(data: &[u8], off: usize) -> Result<u32> {
    data.get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(XlsxCryptoError::NotCompoundFile)
}

fn rdu64(data: &[u8], off: usize) -> Result<u64> {
    data.get(off..off + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .ok_or(XlsxCryptoError::NotCompoundFile)
}

impl<'a> CompoundFile<'a> {
    /// Parses the container structures; any structural problem is reported as
    /// [`XlsxCryptoError::NotCompoundFile`].
    pub fn open(data: &'a [u8]) -> Result<Self> {
        if data.len() < 512 || data[..8] != SIGNATURE {
            return Err(XlsxCryptoError::NotCompoundFile);
        }
        let sector_shift = rdu16(data, 30)?;
        let sector_len = match sector_shift {
            9 => 512,
            12 => 4096,
            _ => return Err(XlsxCryptoError::NotCompoundFile),
        };
        if rdu16(data, 32)? != 6 {
            // Mini sector size is fixed at 64 bytes
            return Err(XlsxCryptoError::NotCompoundFile);
        }

        let first_dir_sector = rdu32(data, 48)?;
        let first_minifat_sector = rdu32(data, 60)?;
        let minifat_sectors = rdu32(data, 64)?;
        let first_difat_sector = rdu32(data, 68)?;
        let difat_sectors = rdu32(data, 72)?;

        let mut ole = Self {
            data,
            sector_len,
            fat: Vec::new(),
            minifat: Vec::new(),
            dir: Vec::new(),
        };

        let difat = ole.read_difat(first_difat_sector, difat_sectors)?;
        for fat_sector in &difat {
            let sec = ole.sector(*fat_sector)?;
            for v in sec.chunks_exact(4) {
                ole.fat.push(u32::from_le_bytes(v.try_into().unwrap()));
            }
        }

        ole.read_directory(first_dir_sector)?;
        match ole.dir.first() {
            Some(root) if root.objtype == OBJTYPE_ROOT => {}
            _ => return Err(XlsxCryptoError::NotCompoundFile),
        }
        ole.read_minifat(first_minifat_sector, minifat_sectors)?;
        Ok(ole)
    }

    /// Returns `true` if a stream with the given name exists.
    pub fn has_stream(&self, name: &str) -> bool {
        self.dir
            .iter()
            .any(|e| e.objtype == OBJTYPE_STREAM && e.name == name)
    }

    /// Returns the full contents of the named root-level stream, or `None`
    /// if no such stream exists.
    pub fn stream(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let entry = self
            .dir
            .iter()
            .find(|e| e.objtype == OBJTYPE_STREAM && e.name == name);
        let entry = match entry {
            Some(e) => e,
            None => return Ok(None),
        };
        if entry.size >= MINI_STREAM_CUTOFF {
            self.read_chain(entry.start_sector, entry.size).map(Some)
        } else {
            self.read_mini_chain(entry.start_sector, entry.size)
                .map(Some)
        }
    }

    fn sector(&self, n: u32) -> Result<&'a [u8]> {
        if n > MAXREGSECT {
            return Err(XlsxCryptoError::NotCompoundFile);
        }
        let off = (n as usize)
            .checked_add(1)
            .and_then(|s| s.checked_mul(self.sector_len))
            .ok_or(XlsxCryptoError::NotCompoundFile)?;
        self.data
            .get(off..off + self.sector_len)
            .ok_or(XlsxCryptoError::NotCompoundFile)
    }

    fn next_sector(&self, n: u32) -> Result<u32> {
        self.fat
            .get(n as usize)
            .copied()
            .ok_or(XlsxCryptoError::NotCompoundFile)
    }

    fn read_difat(&self, first_difat_sector: u32, difat_sectors: u32) -> Result<Vec<u32>> {
        let mut difat = Vec::new();
        for i in 0..HEADER_DIFAT_ENTRIES {
            let v = rdu32(self.data, 76 + i * 4)?;
            if v != FREESECT {
                difat.push(v);
            }
        }
        // DIFAT overflow sectors: sector_len/4 - 1 entries plus a next pointer
        let mut sector = first_difat_sector;
        for _ in 0..difat_sectors {
            if sector == ENDOFCHAIN {
                break;
            }
            let sec = self.sector(sector)?;
            let (entries, next) = sec.split_at(self.sector_len - 4);
            for v in entries.chunks_exact(4) {
                let v = u32::from_le_bytes(v.try_into().unwrap());
                if v != FREESECT {
                    difat.push(v);
                }
            }
            sector = u32::from_le_bytes(next.try_into().unwrap());
        }
        Ok(difat)
    }

    fn read_directory(&mut self, first_dir_sector: u32) -> Result<()> {
        let mut sector = first_dir_sector;
        let mut walked = 0usize;
        while sector != ENDOFCHAIN {
            // A well-formed chain never revisits a sector; cap the walk at
            // the FAT size to stay out of cycles in corrupt files
            if walked > self.fat.len() {
                return Err(XlsxCryptoError::NotCompoundFile);
            }
            let sec = self.sector(sector)?;
            for raw in sec.chunks_exact(DIR_ENTRY_LEN) {
                let entry = self.parse_dir_entry(raw)?;
                self.dir.push(entry);
            }
            sector = self.next_sector(sector)?;
            walked += 1;
        }
        Ok(())
    }

    fn parse_dir_entry(&self, raw: &[u8]) -> Result<DirEntry> {
        let objtype = raw[66];
        let name_len: usize = rdu16(raw, 64)?.into();
        let name = if objtype != 0 && (2..=64).contains(&name_len) && name_len % 2 == 0 {
            let units: Vec<u16> = raw[..name_len - 2]
                .chunks_exact(2)
                .map(|v| u16::from_le_bytes(v.try_into().unwrap()))
                .collect();
            String::from_utf16(&units).map_err(|_| XlsxCryptoError::NotCompoundFile)?
        } else {
            String::new()
        };
        let start_sector = rdu32(raw, 116)?;
        let mut size = rdu64(raw, 120)?;
        if self.sector_len == 512 {
            // Version 3 writers may leave garbage in the upper half
            size &= 0xffff_ffff;
        }
        Ok(DirEntry {
            name,
            objtype,
            start_sector,
            size,
        })
    }

    fn read_minifat(&mut self, first: u32, count: u32) -> Result<()> {
        let mut sector = first;
        for _ in 0..count {
            if sector == ENDOFCHAIN {
                break;
            }
            let sec = self.sector(sector)?;
            for v in sec.chunks_exact(4) {
                self.minifat.push(u32::from_le_bytes(v.try_into().unwrap()));
            }
            sector = self.next_sector(sector)?;
        }
        Ok(())
    }

    fn read_chain(&self, start: u32, size: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(size.min(self.data.len() as u64) as usize);
        let mut sector = start;
        let mut walked = 0usize;
        while sector != ENDOFCHAIN && (out.len() as u64) < size {
            if walked > self.fat.len() {
                return Err(XlsxCryptoError::NotCompoundFile);
            }
            out.extend_from_slice(self.sector(sector)?);
            sector = self.next_sector(sector)?;
            walked += 1;
        }
        if (out.len() as u64) < size {
            return Err(XlsxCryptoError::NotCompoundFile);
        }
        out.truncate(size as usize);
        Ok(out)
    }

    /// Streams below the cutoff live in the mini stream, which is itself a
    /// regular stream anchored at the root entry.
    fn read_mini_chain(&self, start: u32, size: u64) -> Result<Vec<u8>> {
        let root = &self.dir[0];
        let ministream = self.read_chain(root.start_sector, root.size)?;
        let mut out = Vec::with_capacity(size as usize);
        let mut sector = start;
        let mut walked = 0usize;
        while sector != ENDOFCHAIN && (out.len() as u64) < size {
            if sector > MAXREGSECT || walked > self.minifat.len() {
                return Err(XlsxCryptoError::NotCompoundFile);
            }
            let off = sector as usize * MINI_SECTOR_LEN;
            let chunk = ministream
                .get(off..off + MINI_SECTOR_LEN)
                .ok_or(XlsxCryptoError::NotCompoundFile)?;
            out.extend_from_slice(chunk);
            sector = self
                .minifat
                .get(sector as usize)
                .copied()
                .ok_or(XlsxCryptoError::NotCompoundFile)?;
            walked += 1;
        }
        if (out.len() as u64) < size {
            return Err(XlsxCryptoError::NotCompoundFile);
        }
        out.truncate(size as usize);
        Ok(out)
    }
}
