//! Segment file format shared by the push log and head blocks
//!
//! ```text
//! header: magic "SPWL" | u16 version | u64 segment id
//! record: u32 len | u32 crc32(data) | data
//! data:   u8 id_len | id | payload
//! ```
//!
//! All integers are little-endian. `len` counts `data` only.
//!
//! Reading is tolerant: a record whose checksum does not match (or whose id
//! is invalid) is skipped and counted, and a record that runs past the end
//! of the file ends the segment (torn tail of a crash).

use byteorder::{ByteOrder, LittleEndian};
use spanstore_core::{Error, Result, SyncMode, TraceId, TRACE_ID_LEN};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Segment magic.
pub const SEGMENT_MAGIC: [u8; 4] = *b"SPWL";

/// Segment format version.
pub const SEGMENT_VERSION: u16 = 1;

/// Header size: magic + version + segment id.
pub const SEGMENT_HEADER_SIZE: usize = 4 + 2 + 8;

/// Record framing: len + crc.
pub const RECORD_HEADER_SIZE: usize = 4 + 4;

/// Segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Push log generation, or 0 for head files
    pub segment_id: u64,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf[..4].copy_from_slice(&SEGMENT_MAGIC);
        LittleEndian::write_u16(&mut buf[4..6], SEGMENT_VERSION);
        LittleEndian::write_u64(&mut buf[6..], self.segment_id);
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SEGMENT_HEADER_SIZE {
            return Err(Error::Corruption("segment header truncated".to_string()));
        }
        if bytes[..4] != SEGMENT_MAGIC {
            return Err(Error::Corruption("bad segment magic".to_string()));
        }
        let version = LittleEndian::read_u16(&bytes[4..6]);
        if version != SEGMENT_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported segment version {}",
                version
            )));
        }
        Ok(Self {
            segment_id: LittleEndian::read_u64(&bytes[6..SEGMENT_HEADER_SIZE]),
        })
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Trace the payload belongs to
    pub trace_id: TraceId,
    /// Opaque payload
    pub payload: Vec<u8>,
}

/// Where a record sits in its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    /// Offset of the record's length field
    pub offset: u64,
    /// Total record length including framing
    pub len: u32,
}

/// Frame one record.
pub fn encode_record(trace_id: &TraceId, payload: &[u8]) -> Vec<u8> {
    let id = trace_id.as_bytes();
    let data_len = 1 + id.len() + payload.len();
    let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + data_len);
    out.extend_from_slice(&[0u8; RECORD_HEADER_SIZE]);
    out.push(id.len() as u8);
    out.extend_from_slice(id);
    out.extend_from_slice(payload);

    let crc = crc32fast::hash(&out[RECORD_HEADER_SIZE..]);
    LittleEndian::write_u32(&mut out[..4], data_len as u32);
    LittleEndian::write_u32(&mut out[4..8], crc);
    out
}

/// Decode one complete framed record.
///
/// # Errors
///
/// [`Error::Corruption`] on a length or checksum mismatch or an invalid id.
pub fn decode_record(bytes: &[u8]) -> Result<Record> {
    if bytes.len() < RECORD_HEADER_SIZE {
        return Err(Error::Corruption("record header truncated".to_string()));
    }
    let len = LittleEndian::read_u32(&bytes[..4]) as usize;
    let crc = LittleEndian::read_u32(&bytes[4..8]);
    let data = &bytes[RECORD_HEADER_SIZE..];
    if data.len() != len {
        return Err(Error::Corruption(format!(
            "record length {} does not match frame {}",
            data.len(),
            len
        )));
    }
    if crc32fast::hash(data) != crc {
        return Err(Error::Corruption("record checksum mismatch".to_string()));
    }
    let id_len = *data
        .first()
        .ok_or_else(|| Error::Corruption("empty record".to_string()))? as usize;
    if id_len == 0 || id_len > TRACE_ID_LEN || 1 + id_len > data.len() {
        return Err(Error::Corruption(format!("bad record id length {}", id_len)));
    }
    let trace_id = TraceId::from_slice(&data[1..1 + id_len])
        .map_err(|e| Error::Corruption(format!("bad record id: {}", e)))?;
    Ok(Record {
        trace_id,
        payload: data[1 + id_len..].to_vec(),
    })
}

/// Contents of one segment file.
#[derive(Debug, Default)]
pub struct SegmentContents {
    /// Segment id from the header
    pub segment_id: u64,
    /// Valid records in file order, with their locations
    pub records: Vec<(RecordLocation, Record)>,
    /// Records skipped for a bad checksum or id
    pub corrupt_records: u64,
    /// Whether the file ended inside a record
    pub truncated: bool,
}

/// Read every record of a segment file.
///
/// # Errors
///
/// [`Error::Corruption`] if the header is unreadable; [`Error::Io`] if the
/// file cannot be read. Damaged records are skipped, not errors.
pub fn read_segment(path: &Path) -> Result<SegmentContents> {
    let bytes = fs::read(path)?;
    let header = SegmentHeader::decode(&bytes)?;
    let mut contents = SegmentContents {
        segment_id: header.segment_id,
        ..Default::default()
    };

    let mut pos = SEGMENT_HEADER_SIZE;
    while pos < bytes.len() {
        if bytes.len() - pos < RECORD_HEADER_SIZE {
            contents.truncated = true;
            break;
        }
        let len = LittleEndian::read_u32(&bytes[pos..pos + 4]) as usize;
        let end = pos + RECORD_HEADER_SIZE + len;
        if len == 0 || end > bytes.len() {
            contents.truncated = true;
            break;
        }
        match decode_record(&bytes[pos..end]) {
            Ok(record) => contents.records.push((
                RecordLocation {
                    offset: pos as u64,
                    len: (end - pos) as u32,
                },
                record,
            )),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    offset = pos,
                    error = %e,
                    "skipping corrupt record"
                );
                contents.corrupt_records += 1;
            }
        }
        pos = end;
    }

    if contents.truncated {
        warn!(path = %path.display(), offset = pos, "segment ends inside a record");
    }
    Ok(contents)
}

/// Append-only writer for one segment file.
#[derive(Debug)]
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    len: u64,
    sync_mode: SyncMode,
}

impl SegmentWriter {
    /// Create a new segment. Fails if the file already exists.
    pub fn create(
        path: impl Into<PathBuf>,
        segment_id: u64,
        sync_mode: SyncMode,
    ) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&path)?;
        file.write_all(&SegmentHeader { segment_id }.encode())?;
        if sync_mode.sync_on_rotate() {
            file.sync_all()?;
        }
        Ok(Self {
            file,
            path,
            len: SEGMENT_HEADER_SIZE as u64,
            sync_mode,
        })
    }

    /// Append one record.
    ///
    /// A failed write is rolled back so the file never holds a torn record
    /// in front of later ones.
    pub fn append(&mut self, trace_id: &TraceId, payload: &[u8]) -> Result<RecordLocation> {
        let frame = encode_record(trace_id, payload);
        if let Err(e) = self.file.write_all(&frame) {
            let _ = self.file.set_len(self.len);
            return Err(Error::Io(e));
        }
        if self.sync_mode.sync_each_write() {
            self.file.sync_data()?;
        }
        let loc = RecordLocation {
            offset: self.len,
            len: frame.len() as u32,
        };
        self.len += frame.len() as u64;
        Ok(loc)
    }

    /// Flush to stable storage unless syncing is disabled.
    pub fn sync(&mut self) -> Result<()> {
        if self.sync_mode.sync_on_rotate() {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Bytes written, header included.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether no record has been written.
    pub fn is_empty(&self) -> bool {
        self.len == SEGMENT_HEADER_SIZE as u64
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Framed record length for a payload of `payload_len` bytes.
pub fn record_len(payload_len: usize) -> u64 {
    (RECORD_HEADER_SIZE + 1 + TRACE_ID_LEN + payload_len) as u64
}
