use crate::access::{le_u16, le_u32, le_u64, put_u16, put_u32, put_u64};
use crate::error::ExfatError;
use crate::times::EntryTimes;
use crate::upcase::UpcaseTable;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const DIRENT_SIZE: usize = 32;

pub const ATTR_READ_ONLY: u16 = 0x0001;
pub const ATTR_HIDDEN: u16 = 0x0002;
pub const ATTR_SYSTEM: u16 = 0x0004;
pub const ATTR_DIRECTORY: u16 = 0x0010;
pub const ATTR_ARCHIVE: u16 = 0x0020;

/// Stream extension flag: allocation possible, set on every ordinary
/// file and directory.
pub const FLAG_ALLOC_POSSIBLE: u8 = 0x01;
/// Stream extension flag: the clusters are consecutive and the chain
/// has no FAT entries.
pub const FLAG_CONTIGUOUS: u8 = 0x02;

/// Names are at most 255 UTF-16 units, 15 per file-name entry.
pub const NAME_MAX_UNITS: usize = 255;
const NAME_UNITS_PER_ENTRY: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    AllocationBitmap, // 0x81
    UpCaseTable,      // 0x82
    VolumeLabel,      // 0x83
    File,             // 0x85 (primary of a file entry set)
    VolumeGuid,       // 0xA0
    StreamExt,        // 0xC0 (stream extension)
    FileName,         // 0xC1 (15 UTF-16 units of the name)
    Unknown(u8),
    End, // 0x00 marks end of directory
}

impl From<u8> for EntryType {
    fn from(v: u8) -> Self {
        match v {
            0x00 => EntryType::End,
            0x81 => EntryType::AllocationBitmap,
            0x82 => EntryType::UpCaseTable,
            0x83 => EntryType::VolumeLabel,
            0x85 => EntryType::File,
            0xA0 => EntryType::VolumeGuid,
            0xC0 => EntryType::StreamExt,
            0xC1 => EntryType::FileName,
            x => EntryType::Unknown(x),
        }
    }
}

/// One raw 32-byte directory entry slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDirEnt {
    pub entry_type: u8,
    pub raw: [u8; 32],
}

impl RawDirEnt {
    pub fn from_bytes(b: &[u8]) -> Self {
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&b[0..32]);
        Self {
            entry_type: raw[0],
            raw,
        }
    }

    pub fn kind(&self) -> EntryType {
        EntryType::from(self.entry_type)
    }

    /// The high bit of the type byte marks the entry as live; a deleted
    /// entry keeps its type bits with the high bit cleared.
    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.entry_type & 0x80 != 0
    }

    #[inline]
    pub fn is_end(&self) -> bool {
        self.entry_type == 0x00
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    // 0x85
    pub secondary_count: u8,
    pub set_checksum: u16,
    pub attributes: u16,
    pub times: EntryTimes,
}

impl FileEntry {
    pub fn parse(raw: &RawDirEnt) -> Self {
        let b = &raw.raw;
        Self {
            secondary_count: b[1],
            set_checksum: le_u16(b, 2),
            attributes: le_u16(b, 4),
            times: EntryTimes::read(b),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEntry {
    // 0xC0
    pub flags: u8,
    pub name_length: u8,
    pub name_hash: u16,
    pub valid_length: u64,
    pub first_cluster: u32,
    pub data_length: u64,
}

impl StreamEntry {
    pub fn parse(raw: &RawDirEnt) -> Self {
        let b = &raw.raw;
        Self {
            flags: b[1],
            name_length: b[3],
            name_hash: le_u16(b, 4),
            valid_length: le_u64(b, 8),
            first_cluster: le_u32(b, 20),
            data_length: le_u64(b, 24),
        }
    }

    #[inline]
    pub fn is_contiguous(&self) -> bool {
        self.flags & FLAG_CONTIGUOUS != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameEntry {
    // 0xC1
    pub units: [u16; 15],
}

impl NameEntry {
    pub fn parse(raw: &RawDirEnt) -> Self {
        let b = &raw.raw;
        let mut units = [0u16; 15];
        for (i, u) in units.iter_mut().enumerate() {
            *u = le_u16(b, 2 + i * 2);
        }
        Self { units }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitmapEntry {
    // 0x81
    pub first_cluster: u32,
    pub data_length: u64,
}

impl BitmapEntry {
    pub fn parse(raw: &RawDirEnt) -> Self {
        let b = &raw.raw;
        Self {
            first_cluster: le_u32(b, 20),
            data_length: le_u64(b, 24),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpcaseEntry {
    // 0x82
    pub table_checksum: u32,
    pub first_cluster: u32,
    pub data_length: u64,
}

impl UpcaseEntry {
    pub fn parse(raw: &RawDirEnt) -> Self {
        let b = &raw.raw;
        Self {
            table_checksum: le_u32(b, 4),
            first_cluster: le_u32(b, 20),
            data_length: le_u64(b, 24),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelEntry {
    // 0x83
    pub label: String,
}

impl LabelEntry {
    pub fn parse(raw: &RawDirEnt) -> Self {
        let b = &raw.raw;
        let len = (b[1] as usize).min(11);
        let mut out = String::new();
        for i in 0..len {
            let ch = le_u16(b, 2 + i * 2);
            out.push(char::from_u32(ch as u32).unwrap_or('\u{FFFD}'));
        }
        Self { label: out }
    }
}

/// A decoded directory entry, keyed by the slot's type byte.
#[derive(Debug, Clone)]
pub enum DirEntryData {
    End,
    Bitmap(BitmapEntry),
    Upcase(UpcaseEntry),
    Label(LabelEntry),
    File(FileEntry),
    VolumeGuid,
    Stream(StreamEntry),
    Name(NameEntry),
    Unknown(u8),
}

impl DirEntryData {
    pub fn decode(raw: &RawDirEnt) -> Self {
        match raw.kind() {
            EntryType::End => DirEntryData::End,
            EntryType::AllocationBitmap => DirEntryData::Bitmap(BitmapEntry::parse(raw)),
            EntryType::UpCaseTable => DirEntryData::Upcase(UpcaseEntry::parse(raw)),
            EntryType::VolumeLabel => DirEntryData::Label(LabelEntry::parse(raw)),
            EntryType::File => DirEntryData::File(FileEntry::parse(raw)),
            EntryType::VolumeGuid => DirEntryData::VolumeGuid,
            EntryType::StreamExt => DirEntryData::Stream(StreamEntry::parse(raw)),
            EntryType::FileName => DirEntryData::Name(NameEntry::parse(raw)),
            EntryType::Unknown(t) => DirEntryData::Unknown(t),
        }
    }
}

/// A complete file entry set, assembled from primary, stream extension
/// and name entries. `slot` is the index of the primary entry within
/// the directory stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    pub attributes: u16,
    pub times: EntryTimes,
    pub first_cluster: u32,
    pub valid_length: u64,
    pub data_length: u64,
    pub contiguous: bool,
    pub slot: usize,
    pub secondary_count: u8,
}

impl FileRecord {
    pub fn is_dir(&self) -> bool {
        (self.attributes & ATTR_DIRECTORY) != 0
    }
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

/// Checksum over a whole entry set. Bytes 2 and 3 of the primary entry
/// hold the stored checksum and are excluded from the computation.
pub fn entry_set_checksum(set: &[RawDirEnt]) -> u16 {
    let mut sum: u16 = 0;
    for (i, e) in set.iter().enumerate() {
        for (j, &b) in e.raw.iter().enumerate() {
            if i == 0 && (j == 2 || j == 3) {
                continue;
            }
            sum = ((sum << 15) | (sum >> 1)).wrapping_add(b as u16);
        }
    }
    sum
}

/// Hash of an already upcased name, stored in the stream extension so
/// lookups can reject non-matches without reading the name entries.
pub fn name_hash(upcased: &[u16]) -> u16 {
    let mut hash: u16 = 0;
    for &u in upcased {
        for b in u.to_le_bytes() {
            hash = ((hash << 15) | (hash >> 1)).wrapping_add(b as u16);
        }
    }
    hash
}

/// Receives decoded facts while a directory stream is parsed. The
/// default methods ignore everything, so a visitor only implements the
/// callbacks it cares about.
pub trait DirectoryVisitor {
    fn found_label(&mut self, _label: &str) {}
    fn found_bitmap(&mut self, _first_cluster: u32, _size_bytes: u64) {}
    fn found_upcase(&mut self, _checksum: u32, _first_cluster: u32, _size_bytes: u64) {}
    fn found_file(&mut self, _record: FileRecord) {}
}

/// Walks a directory's byte stream slot by slot, groups file entry sets,
/// verifies their checksums and dispatches to the visitor.
///
/// Deleted slots are skipped without joining any set. A 0x00 type byte
/// ends the directory; running out of bytes is only legal between sets,
/// inside one it is corruption. Any corrupt set aborts the whole parse.
pub fn parse_directory(data: &[u8], visitor: &mut dyn DirectoryVisitor) -> Result<(), ExfatError> {
    let slots = data.len() / DIRENT_SIZE;
    let mut slot = 0usize;
    while slot < slots {
        let raw = RawDirEnt::from_bytes(&data[slot * DIRENT_SIZE..(slot + 1) * DIRENT_SIZE]);
        if raw.is_end() {
            return Ok(());
        }
        if !raw.is_in_use() {
            slot += 1;
            continue;
        }
        match DirEntryData::decode(&raw) {
            DirEntryData::End => return Ok(()),
            DirEntryData::Label(l) => {
                visitor.found_label(&l.label);
                slot += 1;
            }
            DirEntryData::Bitmap(b) => {
                visitor.found_bitmap(b.first_cluster, b.data_length);
                slot += 1;
            }
            DirEntryData::Upcase(u) => {
                visitor.found_upcase(u.table_checksum, u.first_cluster, u.data_length);
                slot += 1;
            }
            DirEntryData::VolumeGuid => {
                debug!("skipping volume GUID entry at slot {}", slot);
                slot += 1;
            }
            DirEntryData::File(_) => {
                slot += parse_file_set(data, slot, slots, visitor)?;
            }
            DirEntryData::Stream(_) | DirEntryData::Name(_) => {
                return Err(ExfatError::Format(format!(
                    "secondary entry 0x{:02X} at slot {} without a primary",
                    raw.entry_type, slot
                )));
            }
            DirEntryData::Unknown(t) => {
                return Err(ExfatError::Format(format!(
                    "unknown in-use directory entry type 0x{:02X} at slot {}",
                    t, slot
                )));
            }
        }
    }
    Ok(())
}

fn parse_file_set(
    data: &[u8],
    first_slot: usize,
    slots: usize,
    visitor: &mut dyn DirectoryVisitor,
) -> Result<usize, ExfatError> {
    let primary = RawDirEnt::from_bytes(&data[first_slot * DIRENT_SIZE..][..DIRENT_SIZE]);
    let file = FileEntry::parse(&primary);
    let count = file.secondary_count as usize;
    // A valid set holds one stream extension and 1..=17 name entries.
    if !(2..=18).contains(&count) {
        return Err(ExfatError::Format(format!(
            "file entry at slot {} declares {} secondaries",
            first_slot, count
        )));
    }
    if first_slot + 1 + count > slots {
        return Err(ExfatError::Format(format!(
            "directory ends inside the entry set at slot {}",
            first_slot
        )));
    }

    let mut set = Vec::with_capacity(count + 1);
    set.push(primary);
    for i in 1..=count {
        set.push(RawDirEnt::from_bytes(
            &data[(first_slot + i) * DIRENT_SIZE..][..DIRENT_SIZE],
        ));
    }

    let sum = entry_set_checksum(&set);
    if sum != file.set_checksum {
        error!(
            "entry set at slot {}: checksum {:#06x}, stored {:#06x}",
            first_slot, sum, file.set_checksum
        );
        return Err(ExfatError::Format(format!(
            "directory entry set checksum mismatch at slot {}",
            first_slot
        )));
    }

    if set[1].kind() != EntryType::StreamExt {
        return Err(ExfatError::Format(format!(
            "entry set at slot {} has no stream extension",
            first_slot
        )));
    }
    let stream = StreamEntry::parse(&set[1]);
    if stream.name_length == 0 {
        return Err(ExfatError::Format(format!(
            "entry set at slot {} has an empty name",
            first_slot
        )));
    }
    if stream.valid_length > stream.data_length {
        return Err(ExfatError::Format(format!(
            "entry set at slot {}: valid length {} exceeds data length {}",
            first_slot, stream.valid_length, stream.data_length
        )));
    }
    if stream.first_cluster == 0 && stream.data_length > 0 {
        return Err(ExfatError::Format(format!(
            "entry set at slot {} claims {} bytes without clusters",
            first_slot, stream.data_length
        )));
    }

    let mut units: Vec<u16> = Vec::with_capacity(stream.name_length as usize);
    for e in &set[2..] {
        if e.kind() != EntryType::FileName {
            return Err(ExfatError::Format(format!(
                "unexpected entry 0x{:02X} inside the set at slot {}",
                e.entry_type, first_slot
            )));
        }
        units.extend_from_slice(&NameEntry::parse(e).units);
    }
    if units.len() < stream.name_length as usize {
        return Err(ExfatError::Format(format!(
            "entry set at slot {} holds {} name units, header says {}",
            first_slot,
            units.len(),
            stream.name_length
        )));
    }
    units.truncate(stream.name_length as usize);

    visitor.found_file(FileRecord {
        name: String::from_utf16_lossy(&units),
        attributes: file.attributes,
        times: file.times,
        first_cluster: stream.first_cluster,
        valid_length: stream.valid_length,
        data_length: stream.data_length,
        contiguous: stream.is_contiguous(),
        slot: first_slot,
        secondary_count: file.secondary_count,
    });
    Ok(count + 1)
}

/// Builds the slots of a new file entry set, checksum filled in. The
/// upcase table feeds the stored name hash.
pub fn build_file_set(
    name: &str,
    attributes: u16,
    times: &EntryTimes,
    first_cluster: u32,
    valid_length: u64,
    data_length: u64,
    contiguous: bool,
    upcase: &UpcaseTable,
) -> Result<Vec<RawDirEnt>, ExfatError> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.is_empty() {
        return Err(ExfatError::Format("empty file name".into()));
    }
    if units.len() > NAME_MAX_UNITS {
        return Err(ExfatError::Format(format!(
            "file name longer than {} units",
            NAME_MAX_UNITS
        )));
    }
    if name.contains('/') {
        return Err(ExfatError::Format(format!(
            "file name {:?} contains a path separator",
            name
        )));
    }

    let folded: Vec<u16> = units.iter().map(|&u| upcase.to_upper_char(u)).collect();
    let name_entries = units.len().div_ceil(NAME_UNITS_PER_ENTRY);
    let mut set = Vec::with_capacity(2 + name_entries);

    let mut primary = [0u8; DIRENT_SIZE];
    primary[0] = 0x85;
    primary[1] = (1 + name_entries) as u8;
    put_u16(&mut primary, 4, attributes);
    times.write(&mut primary);
    set.push(RawDirEnt {
        entry_type: 0x85,
        raw: primary,
    });

    let mut stream = [0u8; DIRENT_SIZE];
    stream[0] = 0xC0;
    stream[1] = FLAG_ALLOC_POSSIBLE | if contiguous { FLAG_CONTIGUOUS } else { 0 };
    stream[3] = units.len() as u8;
    put_u16(&mut stream, 4, name_hash(&folded));
    put_u64(&mut stream, 8, valid_length);
    put_u32(&mut stream, 20, first_cluster);
    put_u64(&mut stream, 24, data_length);
    set.push(RawDirEnt {
        entry_type: 0xC0,
        raw: stream,
    });

    for chunk in units.chunks(NAME_UNITS_PER_ENTRY) {
        let mut ne = [0u8; DIRENT_SIZE];
        ne[0] = 0xC1;
        for (i, &u) in chunk.iter().enumerate() {
            put_u16(&mut ne, 2 + i * 2, u);
        }
        set.push(RawDirEnt {
            entry_type: 0xC1,
            raw: ne,
        });
    }

    let sum = entry_set_checksum(&set);
    put_u16(&mut set[0].raw, 2, sum);
    Ok(set)
}
