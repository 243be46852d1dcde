use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Record;

/// Largest payload a record may carry. A longer length prefix on disk is
/// treated as corruption instead of an allocation request.
pub const MAX_RECORD_LEN: usize = 1 << 20;

/// Encode a single record as `[len][bincode][crc32]`. Returns bytes written.
fn encode_record(writer: &mut impl Write, record: &Record) -> io::Result<u64> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("record of {} bytes exceeds {MAX_RECORD_LEN}", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(8 + payload.len() as u64)
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the file ended first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode the next entry and its encoded size. `Ok(None)` on a clean end, a
/// truncated tail, an oversized length, a CRC mismatch or an undecodable
/// payload; replay stops at the first bad entry.
fn decode_next(reader: &mut impl Read) -> io::Result<Option<(Record, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Record>(&payload)
        .ok()
        .map(|record| (record, 8 + len as u64)))
}

/// Valid records on disk and the byte length they occupy.
fn scan(path: &Path) -> io::Result<(Vec<Record>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut valid_len = 0;
    while let Some((record, size)) = decode_next(&mut reader)? {
        records.push(record);
        valid_len += size;
    }
    Ok((records, valid_len))
}

/// Test-only write failures, triggered on the next batch.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Half a record reaches the file, then the write errors.
    TornWrite,
    /// The whole batch reaches the file, then fsync errors.
    SyncFails,
}

/// Append-only write-ahead log for building registrations and entry/exit events.
///
/// Format per entry: `[u32: len][bincode: Record][u32: crc32]`, little endian.
///
/// The file never holds bytes past the last acknowledged batch: opening cuts
/// a torn tail left by a crash, and a batch that fails is truncated away
/// before the error is returned. If even that truncation fails the log
/// refuses further appends until it is reopened.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length covered by acknowledged batches.
    committed_len: u64,
    appends_since_compact: u64,
    broken: Option<String>,
    #[cfg(test)]
    fault: Option<Fault>,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::open_and_replay(path).map(|(wal, _)| wal)
    }

    /// Open for appends and return every valid record already on disk,
    /// cutting off anything after the last valid one.
    pub fn open_and_replay(path: &Path) -> io::Result<(Self, Vec<Record>)> {
        let (records, valid_len) = scan(path)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            committed_len: valid_len,
            appends_since_compact: 0,
            broken: None,
            #[cfg(test)]
            fault: None,
        };
        Ok((wal, records))
    }

    /// Append and fsync one record.
    #[cfg(test)]
    pub fn append(&mut self, record: &Record) -> io::Result<()> {
        self.append_batch([record])
    }

    /// Write and fsync `records` as one unit. On error none of them remain in
    /// the file and nothing is counted.
    pub fn append_batch<'a>(&mut self, records: impl IntoIterator<Item = &'a Record>) -> io::Result<()> {
        if let Some(reason) = &self.broken {
            return Err(io::Error::other(format!("WAL unusable after failed rollback: {reason}")));
        }
        match self.write_batch(records) {
            Ok((count, bytes)) => {
                self.committed_len += bytes;
                self.appends_since_compact += count;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.rollback() {
                    self.broken = Some(rollback.to_string());
                }
                Err(e)
            }
        }
    }

    fn write_batch<'a>(&mut self, records: impl IntoIterator<Item = &'a Record>) -> io::Result<(u64, u64)> {
        let (mut count, mut bytes) = (0, 0);
        for record in records {
            bytes += encode_record(&mut self.writer, record)?;
            count += 1;
        }
        #[cfg(test)]
        if let Some(fault) = self.fault.take() {
            return Err(self.trigger(fault));
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok((count, bytes))
    }

    /// Drop buffered bytes and cut the file back to `committed_len`.
    fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        file.set_len(self.committed_len)?;
        file.sync_all()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it on drop.
        let _ = stale.into_parts();
        Ok(())
    }

    #[cfg(test)]
    pub fn inject_fault(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    #[cfg(test)]
    fn trigger(&mut self, fault: Fault) -> io::Error {
        if fault == Fault::TornWrite {
            let _ = self.writer.write_all(&40u32.to_le_bytes());
            let _ = self.writer.write_all(&[0u8; 10]);
        }
        let _ = self.writer.flush();
        io::Error::other(format!("injected {fault:?}"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write the compacted record set next to the WAL and fsync it.
    pub fn write_compact_file(path: &Path, records: &[Record]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted file over the WAL and reopen for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.committed_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.broken = None;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, records: &[Record]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// All valid records on disk, in append order. A missing file is empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Record>> {
        scan(path).map(|(records, _)| records)
    }
}
