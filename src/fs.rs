use crate::access::{put_u16, put_u32, put_u64};
use crate::bitmap::ClusterBitMap;
use crate::device::BlockDevice;
use crate::direntry::{
    self, ATTR_ARCHIVE, ATTR_DIRECTORY, DIRENT_SIZE, DirectoryVisitor, FLAG_ALLOC_POSSIBLE,
    FLAG_CONTIGUOUS, FileRecord, RawDirEnt, build_file_set,
};
use crate::error::ExfatError;
use crate::fat::{self, Fat};
use crate::node::{Node, NodeEntry, NodeId, ROOT_ID, node_id};
use crate::superblock::{STATE_DIRTY, SuperBlock};
use crate::times::{EntryTime, EntryTimes};
use crate::upcase::UpcaseTable;
use log::{debug, warn};
use prettytable::{Cell, Row, Table};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io;

/// Byte offsets of the two boot fields the driver updates in place.
/// Both are excluded from the boot region checksum.
const VOLUME_FLAGS_OFFSET: u64 = 0x6A;
const PERCENT_IN_USE_OFFSET: u64 = 0x70;

/// Collects the root directory's singleton metadata entries during the
/// mount scan. File entries are ignored at this stage.
#[derive(Default)]
struct RootMeta {
    label: Option<String>,
    bitmap: Option<(u32, u64)>,
    upcase: Option<(u32, u32, u64)>,
    duplicate: Option<&'static str>,
}

impl DirectoryVisitor for RootMeta {
    fn found_label(&mut self, label: &str) {
        if self.label.is_some() {
            self.duplicate = Some("volume label");
        } else {
            self.label = Some(label.to_string());
        }
    }
    fn found_bitmap(&mut self, first_cluster: u32, size_bytes: u64) {
        if self.bitmap.is_some() {
            self.duplicate = Some("allocation bitmap");
        } else {
            self.bitmap = Some((first_cluster, size_bytes));
        }
    }
    fn found_upcase(&mut self, checksum: u32, first_cluster: u32, size_bytes: u64) {
        if self.upcase.is_some() {
            self.duplicate = Some("upcase table");
        } else {
            self.upcase = Some((checksum, first_cluster, size_bytes));
        }
    }
}

/// A mounted exFAT volume over a block device. The volume owns its
/// device, superblock, allocation bitmap, upcase table and the arena of
/// directory entries; everything that touches them goes through
/// `&mut self`.
pub struct ExFatVolume<D: BlockDevice> {
    sb: SuperBlock,
    device: D,
    read_only: bool,
    closed: bool,
    label: Option<String>,
    bitmap: ClusterBitMap,
    upcase: UpcaseTable,
    nodes: HashMap<NodeId, NodeEntry>,
    alloc_hint: u32,
}

impl<D: BlockDevice> ExFatVolume<D> {
    /// Mounts the volume: superblock first, then a scan of the root
    /// directory for the allocation bitmap and upcase table descriptors,
    /// then both structures themselves. A missing or duplicated
    /// descriptor fails the mount. `read_only` is forced on when the
    /// device itself refuses writes.
    pub fn read(mut device: D, read_only: bool) -> Result<Self, ExfatError> {
        if device.is_closed() {
            return Err(ExfatError::Closed("device is closed".into()));
        }
        let read_only = read_only || device.is_read_only();
        let sb = SuperBlock::read(&mut device)?;
        if sb.is_dirty() {
            warn!("volume was not cleanly unmounted");
        }

        let root_len = {
            let mut fat = Fat::new(&sb, &mut device);
            fat.check_head()?;
            let chain = fat.walk_chain(sb.root_dir_cluster, sb.cluster_count as usize)?;
            chain.len() as u64 * sb.bytes_per_cluster()
        };
        let root = NodeEntry::root(sb.root_dir_cluster, root_len);

        let mut root_bytes = vec![0u8; root_len as usize];
        read_node_bytes(&sb, &mut device, &root.node, 0, &mut root_bytes)?;

        let mut meta = RootMeta::default();
        direntry::parse_directory(&root_bytes, &mut meta)?;
        if let Some(what) = meta.duplicate {
            return Err(ExfatError::Format(format!(
                "duplicate {} entry in the root directory",
                what
            )));
        }
        let (bmp_cluster, bmp_size) = meta.bitmap.ok_or_else(|| {
            ExfatError::Format("root directory has no allocation bitmap entry".into())
        })?;
        let (up_sum, up_cluster, up_size) = meta
            .upcase
            .ok_or_else(|| ExfatError::Format("root directory has no upcase table entry".into()))?;

        let bitmap = ClusterBitMap::read(&sb, &mut device, bmp_cluster, bmp_size)?;
        let upcase = UpcaseTable::read(&sb, &mut device, up_cluster, up_size, up_sum)?;

        debug!(
            "mounted volume serial {:#010x}, label {:?}, {} of {} clusters free",
            sb.volume_serial,
            meta.label,
            bitmap.count_free(),
            sb.cluster_count
        );

        let mut vol = Self {
            sb,
            device,
            read_only,
            closed: false,
            label: meta.label,
            bitmap,
            upcase,
            nodes: HashMap::from([(ROOT_ID, root)]),
            alloc_hint: 2,
        };
        if !vol.read_only {
            vol.set_volume_dirty(true)?;
        }
        Ok(vol)
    }

    fn ensure_open(&self) -> Result<(), ExfatError> {
        if self.closed || self.device.is_closed() {
            return Err(ExfatError::Closed("volume is closed".into()));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), ExfatError> {
        if self.read_only {
            return Err(ExfatError::ReadOnly("volume mounted read-only".into()));
        }
        Ok(())
    }

    fn node_of(&self, id: NodeId) -> Result<&NodeEntry, ExfatError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| ExfatError::NotFound(format!("no entry {:#x} in the cache", id)))
    }

    fn valid_node_of(&self, id: NodeId) -> Result<&NodeEntry, ExfatError> {
        let e = self.node_of(id)?;
        if !e.valid {
            return Err(ExfatError::InvalidEntry(format!(
                "{:?} was removed",
                e.name
            )));
        }
        Ok(e)
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        ROOT_ID
    }

    /// The cached entry behind an id. Stays available after removal so
    /// callers can still inspect `is_valid`, the name and the parent.
    pub fn entry(&self, id: NodeId) -> Result<&NodeEntry, ExfatError> {
        self.ensure_open()?;
        self.node_of(id)
    }

    /// Ids of the live entries of a directory, in disk order. Cached
    /// entries are kept across calls, so an id handed out earlier keeps
    /// pointing at the same object.
    pub fn list(&mut self, dir: NodeId) -> Result<Vec<NodeId>, ExfatError> {
        self.ensure_open()?;
        let (dir_cluster, records) = self.parse_dir(dir)?;
        let mut out = Vec::with_capacity(records.len());
        for r in records {
            let id = node_id(dir_cluster, r.slot);
            let stale = match self.nodes.get(&id) {
                Some(e) => !e.valid,
                None => true,
            };
            if stale {
                self.nodes.insert(id, NodeEntry::from_record(dir_cluster, dir, &r));
            }
            out.push(id);
        }
        Ok(out)
    }

    /// Case-insensitive name lookup, folded through the volume's own
    /// upcase table.
    pub fn lookup(&mut self, dir: NodeId, name: &str) -> Result<NodeId, ExfatError> {
        self.ensure_open()?;
        for id in self.list(dir)? {
            if let Some(e) = self.nodes.get(&id) {
                if self.upcase.eq_ignore_case(&e.name, name) {
                    return Ok(id);
                }
            }
        }
        Err(ExfatError::NotFound(name.to_string()))
    }

    /// Walks a `/`-separated path from the root. An empty path resolves
    /// to the root directory itself.
    pub fn resolve_path(&mut self, path: &str) -> Result<NodeId, ExfatError> {
        self.ensure_open()?;
        let mut cur = ROOT_ID;
        for comp in path.split('/').filter(|p| !p.is_empty()) {
            cur = self.lookup(cur, comp)?;
        }
        Ok(cur)
    }

    /// Reads file bytes. The range must lie inside the declared length;
    /// bytes past the valid length exist but have never been written and
    /// read as zeros.
    pub fn read_at(&mut self, id: NodeId, offset: u64, buf: &mut [u8]) -> Result<(), ExfatError> {
        self.ensure_open()?;
        let node = {
            let e = self.valid_node_of(id)?;
            if e.is_dir() {
                return Err(ExfatError::InvalidEntry(format!("not a file: {}", e.name)));
            }
            e.node
        };
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| past_end(offset, buf.len(), node.length))?;
        if end > node.length {
            return Err(past_end(offset, buf.len(), node.length));
        }
        let readable = node.valid_length.saturating_sub(offset).min(buf.len() as u64) as usize;
        if readable > 0 {
            read_node_bytes(&self.sb, &mut self.device, &node, offset, &mut buf[..readable])?;
        }
        buf[readable..].fill(0);
        Ok(())
    }

    /// Whole file contents, declared length worth of bytes.
    pub fn read_file(&mut self, id: NodeId) -> Result<Vec<u8>, ExfatError> {
        self.ensure_open()?;
        let len = {
            let e = self.valid_node_of(id)?;
            if e.is_dir() {
                return Err(ExfatError::InvalidEntry(format!("not a file: {}", e.name)));
            }
            e.node.length
        };
        let mut buf = vec![0u8; len as usize];
        self.read_at(id, 0, &mut buf)?;
        Ok(buf)
    }

    /// Writes inside the already allocated length. Extends the valid
    /// length when the write reaches past it; the gap between the old
    /// valid length and the write offset is zeroed first so it never
    /// exposes stale cluster contents.
    pub fn write_at(&mut self, id: NodeId, offset: u64, buf: &[u8]) -> Result<(), ExfatError> {
        self.ensure_open()?;
        self.ensure_writable()?;
        let node = {
            let e = self.valid_node_of(id)?;
            if e.is_dir() {
                return Err(ExfatError::InvalidEntry(format!("not a file: {}", e.name)));
            }
            e.node
        };
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| past_end(offset, buf.len(), node.length))?;
        if end > node.length {
            return Err(past_end(offset, buf.len(), node.length));
        }
        if buf.is_empty() {
            return Ok(());
        }
        if offset > node.valid_length {
            let gap = vec![0u8; (offset - node.valid_length) as usize];
            write_node_bytes(&self.sb, &mut self.device, &node, node.valid_length, &gap)?;
        }
        write_node_bytes(&self.sb, &mut self.device, &node, offset, buf)?;
        if let Some(e) = self.nodes.get_mut(&id) {
            if end > e.node.valid_length {
                e.node.valid_length = end;
            }
            e.times.modified = EntryTime::now();
            e.dirty = true;
        }
        Ok(())
    }

    /// Write that grows the file as needed before storing the bytes.
    pub fn write_extend(&mut self, id: NodeId, offset: u64, buf: &[u8]) -> Result<(), ExfatError> {
        self.ensure_open()?;
        self.ensure_writable()?;
        let length = {
            let e = self.valid_node_of(id)?;
            if e.is_dir() {
                return Err(ExfatError::InvalidEntry(format!("not a file: {}", e.name)));
            }
            e.node.length
        };
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| past_end(offset, buf.len(), length))?;
        if end > length {
            self.set_file_length(id, end)?;
        }
        self.write_at(id, offset, buf)
    }

    /// Truncates or extends a file. Growth allocates clusters near the
    /// previous tail and keeps the chain contiguous as long as the next
    /// free cluster happens to be adjacent; the first gap converts the
    /// chain to FAT links. Shrinking frees the tail clusters. The valid
    /// length never grows here, only the declared length does.
    pub fn set_file_length(&mut self, id: NodeId, new_len: u64) -> Result<(), ExfatError> {
        self.ensure_open()?;
        self.ensure_writable()?;
        let node = {
            let e = self.valid_node_of(id)?;
            if e.is_dir() {
                return Err(ExfatError::InvalidEntry(format!("not a file: {}", e.name)));
            }
            e.node
        };
        let cs = self.sb.bytes_per_cluster();
        let old_span = node.length.div_ceil(cs);
        let new_span = new_len.div_ceil(cs);
        if new_span > u64::from(self.sb.cluster_count) {
            return Err(ExfatError::Io(io::Error::new(
                io::ErrorKind::StorageFull,
                format!(
                    "{} bytes need {} clusters, the heap has {}",
                    new_len, new_span, self.sb.cluster_count
                ),
            )));
        }
        if new_span > old_span {
            self.grow_chain(id, old_span, new_span)?;
        } else if new_span < old_span {
            self.shrink_chain(id, old_span, new_span)?;
        }
        if let Some(e) = self.nodes.get_mut(&id) {
            e.node.length = new_len;
            if e.node.valid_length > new_len {
                e.node.valid_length = new_len;
            }
            e.times.modified = EntryTime::now();
            e.dirty = true;
        }
        Ok(())
    }

    /// Creates an empty file. No clusters are allocated until the first
    /// write grows it.
    pub fn create_file(&mut self, dir: NodeId, name: &str) -> Result<NodeId, ExfatError> {
        self.create_entry(dir, name, false)
    }

    /// Creates a directory with one zeroed cluster, which parses as an
    /// empty directory stream.
    pub fn create_directory(&mut self, dir: NodeId, name: &str) -> Result<NodeId, ExfatError> {
        self.create_entry(dir, name, true)
    }

    fn create_entry(
        &mut self,
        dir: NodeId,
        name: &str,
        directory: bool,
    ) -> Result<NodeId, ExfatError> {
        self.ensure_open()?;
        self.ensure_writable()?;
        match self.lookup(dir, name) {
            Ok(_) => {
                return Err(ExfatError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} already exists", name),
                )));
            }
            Err(ExfatError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let (first_cluster, length) = if directory {
            let c = self.allocate_cluster(self.alloc_hint)?;
            zero_cluster(&self.sb, &mut self.device, c)?;
            (c, self.sb.bytes_per_cluster())
        } else {
            (0, 0)
        };

        let times = EntryTimes::now();
        let attributes = if directory { ATTR_DIRECTORY } else { ATTR_ARCHIVE };
        let set = build_file_set(
            name,
            attributes,
            &times,
            first_cluster,
            length,
            length,
            true,
            &self.upcase,
        )?;

        let slot = self.find_slot(dir, set.len())?;
        self.write_dir_slots(dir, slot, &set)?;

        let dir_cluster = self.node_of(dir)?.node.first_cluster;
        let record = FileRecord {
            name: name.to_string(),
            attributes,
            times,
            first_cluster,
            valid_length: length,
            data_length: length,
            contiguous: true,
            slot,
            secondary_count: set.len() as u8 - 1,
        };
        let id = node_id(dir_cluster, slot);
        self.nodes
            .insert(id, NodeEntry::from_record(dir_cluster, dir, &record));
        debug!(
            "created {} {:?} at slot {} of directory {:#x}",
            if directory { "directory" } else { "file" },
            name,
            slot,
            dir
        );
        Ok(id)
    }

    /// Removes a file or an empty directory: clears the in-use bits of
    /// its entry set, releases its clusters and marks the cached entry
    /// invalid. The entry stays in the cache so stale ids keep failing
    /// with a useful error instead of vanishing.
    pub fn remove(&mut self, id: NodeId) -> Result<(), ExfatError> {
        self.ensure_open()?;
        self.ensure_writable()?;
        if id == ROOT_ID {
            return Err(ExfatError::InvalidEntry(
                "cannot remove the root directory".into(),
            ));
        }
        let (node, parent, slot, secondary_count, is_dir, name) = {
            let e = self.valid_node_of(id)?;
            (
                e.node,
                e.parent,
                e.slot,
                e.secondary_count,
                e.is_dir(),
                e.name.clone(),
            )
        };
        if is_dir {
            let (_, children) = self.parse_dir(id)?;
            if !children.is_empty() {
                return Err(ExfatError::Io(io::Error::new(
                    io::ErrorKind::DirectoryNotEmpty,
                    format!("{} is not empty", name),
                )));
            }
        }

        let parent_node = self.valid_node_of(parent)?.node;
        let count = 1 + secondary_count as usize;
        let mut bytes = vec![0u8; count * DIRENT_SIZE];
        read_node_bytes(
            &self.sb,
            &mut self.device,
            &parent_node,
            (slot * DIRENT_SIZE) as u64,
            &mut bytes,
        )?;
        for i in 0..count {
            bytes[i * DIRENT_SIZE] &= 0x7F;
        }
        write_node_bytes(
            &self.sb,
            &mut self.device,
            &parent_node,
            (slot * DIRENT_SIZE) as u64,
            &bytes,
        )?;

        if node.cluster_span(&self.sb) > 0 {
            let clusters = clusters_of(&self.sb, &mut self.device, &node)?;
            if !node.contiguous {
                for &c in &clusters {
                    self.fat_write(c, fat::FREE)?;
                }
            }
            for &c in &clusters {
                self.bitmap.set_free(c);
            }
        }

        if let Some(e) = self.nodes.get_mut(&id) {
            e.valid = false;
            e.dirty = false;
        }
        debug!("removed {:?} (slot {} of directory {:#x})", name, slot, parent);
        Ok(())
    }

    /// Writes every piece of dirty state back to the device: changed
    /// entry sets, the allocation bitmap and the percent-in-use byte.
    pub fn flush(&mut self) -> Result<(), ExfatError> {
        self.ensure_open()?;
        if self.read_only {
            return Ok(());
        }
        let dirty: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(id, e)| **id != ROOT_ID && e.dirty && e.valid)
            .map(|(id, _)| *id)
            .collect();
        for id in dirty {
            self.flush_node(id)?;
        }
        self.bitmap.write_back(&self.sb, &mut self.device)?;
        self.update_percent_in_use()?;
        self.device.flush()?;
        Ok(())
    }

    /// Flushes, clears the volume-dirty flag and closes the device. The
    /// value stays around so later calls can fail with `Closed`.
    pub fn close(&mut self) -> Result<(), ExfatError> {
        if self.closed {
            return Err(ExfatError::Closed("volume already closed".into()));
        }
        if !self.read_only {
            self.flush()?;
            self.set_volume_dirty(false)?;
            self.device.flush()?;
        }
        self.nodes.clear();
        self.closed = true;
        self.device.close()?;
        Ok(())
    }

    /// Hands the device back, for callers that manage its lifetime
    /// themselves. Nothing is flushed on the way out.
    pub fn into_device(self) -> D {
        self.device
    }

    #[inline]
    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }
    #[inline]
    pub fn upcase(&self) -> &UpcaseTable {
        &self.upcase
    }
    #[inline]
    pub fn volume_label(&self) -> Option<&str> {
        self.label.as_deref()
    }
    #[inline]
    pub fn free_clusters(&self) -> u32 {
        self.bitmap.count_free()
    }
    #[inline]
    pub fn percent_in_use(&self) -> Option<u8> {
        self.sb.percent_in_use()
    }
    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn volume_info_json(&self) -> Value {
        json!({
            "superblock": self.sb.to_json(),
            "label": self.label,
            "bitmap_cluster": self.bitmap.first_cluster(),
            "free_clusters": self.bitmap.count_free(),
            "read_only": self.read_only,
        })
    }

    /// Directory listing rendered as a table, one row per live entry.
    pub fn list_table(&mut self, dir: NodeId) -> Result<String, ExfatError> {
        let ids = self.list(dir)?;
        let mut t = Table::new();
        t.add_row(Row::new(vec![
            Cell::new("Identifier"),
            Cell::new("Name"),
            Cell::new("Size"),
            Cell::new("Dir?"),
        ]));
        for id in ids {
            let e = self.node_of(id)?;
            t.add_row(Row::new(vec![
                Cell::new(&format!("0x{:x}", e.id)),
                Cell::new(&e.name),
                Cell::new(&format!("{}", e.node.length)),
                Cell::new(&format!("{}", e.is_dir())),
            ]));
        }
        Ok(t.to_string())
    }

    // ---------- internals ----------

    fn set_volume_dirty(&mut self, dirty: bool) -> Result<(), ExfatError> {
        let mut state = self.sb.volume_state;
        if dirty {
            state |= STATE_DIRTY;
        } else {
            state &= !STATE_DIRTY;
        }
        if state != self.sb.volume_state {
            self.sb.volume_state = state;
            self.device
                .write_at(VOLUME_FLAGS_OFFSET, &state.to_le_bytes())?;
        }
        Ok(())
    }

    fn update_percent_in_use(&mut self) -> Result<(), ExfatError> {
        // 0xFF means the volume does not track the figure.
        if self.sb.percent_in_use == 0xFF {
            return Ok(());
        }
        let used = self.sb.cluster_count - self.bitmap.count_free();
        let pct = (u64::from(used) * 100 / u64::from(self.sb.cluster_count)) as u8;
        if pct != self.sb.percent_in_use {
            self.sb.percent_in_use = pct;
            self.device.write_at(PERCENT_IN_USE_OFFSET, &[pct])?;
        }
        Ok(())
    }

    /// Reads a directory stream and returns its first cluster plus the
    /// assembled file records, in disk order. Records whose declared
    /// geometry cannot fit the cluster heap abort the parse.
    fn parse_dir(&mut self, dir: NodeId) -> Result<(u32, Vec<FileRecord>), ExfatError> {
        let node = {
            let e = self.valid_node_of(dir)?;
            if !e.is_dir() {
                return Err(ExfatError::InvalidEntry(format!(
                    "not a directory: {}",
                    e.name
                )));
            }
            e.node
        };
        let mut bytes = vec![0u8; node.length as usize];
        read_node_bytes(&self.sb, &mut self.device, &node, 0, &mut bytes)?;

        struct Collect(Vec<FileRecord>);
        impl DirectoryVisitor for Collect {
            fn found_file(&mut self, record: FileRecord) {
                self.0.push(record);
            }
        }
        let mut v = Collect(Vec::new());
        direntry::parse_directory(&bytes, &mut v)?;
        for r in &v.0 {
            check_record(&self.sb, r)?;
        }
        Ok((node.first_cluster, v.0))
    }

    fn fat_write(&mut self, cluster: u32, value: u32) -> Result<(), ExfatError> {
        Fat::new(&self.sb, &mut self.device).write_entry(cluster, value)
    }

    fn allocate_cluster(&mut self, hint: u32) -> Result<u32, ExfatError> {
        let c = self.bitmap.find_free(hint).ok_or_else(|| {
            ExfatError::Io(io::Error::new(
                io::ErrorKind::StorageFull,
                "no free clusters left",
            ))
        })?;
        self.bitmap.set_used(c);
        self.alloc_hint = if c + 1 < 2 + self.sb.cluster_count {
            c + 1
        } else {
            2
        };
        Ok(c)
    }

    /// Appends clusters up to `new_span`. A contiguous chain stays
    /// contiguous while each new cluster lands right behind the previous
    /// tail; the first gap writes FAT links for the whole existing run
    /// and continues as a linked chain.
    fn grow_chain(&mut self, id: NodeId, old_span: u64, new_span: u64) -> Result<(), ExfatError> {
        let node = self.valid_node_of(id)?.node;
        let mut first = node.first_cluster;
        let mut contiguous = if old_span == 0 { true } else { node.contiguous };
        let mut last: Option<u32> = if old_span == 0 {
            None
        } else if node.contiguous {
            Some(node.first_cluster + (old_span - 1) as u32)
        } else {
            Some(Fat::new(&self.sb, &mut self.device).advance(node.first_cluster, old_span - 1)?)
        };

        for _ in old_span..new_span {
            let hint = match last {
                Some(l) => l + 1,
                None => self.alloc_hint,
            };
            let c = self.allocate_cluster(hint)?;
            match last {
                None => first = c,
                Some(l) => {
                    if contiguous {
                        if c != l + 1 {
                            // materialize the dense run in the FAT, then link on
                            for prev in first..l {
                                self.fat_write(prev, prev + 1)?;
                            }
                            self.fat_write(l, c)?;
                            contiguous = false;
                        }
                    } else {
                        self.fat_write(l, c)?;
                    }
                }
            }
            if !contiguous {
                self.fat_write(c, fat::EOC)?;
            }
            last = Some(c);
        }

        if let Some(e) = self.nodes.get_mut(&id) {
            e.node.first_cluster = first;
            e.node.contiguous = contiguous;
            e.dirty = true;
        }
        Ok(())
    }

    /// Frees the tail clusters past `new_span` and terminates what is
    /// kept. Contiguous chains have no FAT entries to clear.
    fn shrink_chain(&mut self, id: NodeId, old_span: u64, new_span: u64) -> Result<(), ExfatError> {
        let node = self.valid_node_of(id)?.node;
        if node.contiguous {
            for c in (node.first_cluster + new_span as u32)..(node.first_cluster + old_span as u32)
            {
                self.bitmap.set_free(c);
            }
        } else {
            let chain = {
                let mut fat = Fat::new(&self.sb, &mut self.device);
                fat.walk_chain(node.first_cluster, old_span as usize)?
            };
            if (chain.len() as u64) < old_span {
                return Err(ExfatError::Format(format!(
                    "chain of {} clusters shorter than the declared {}",
                    chain.len(),
                    old_span
                )));
            }
            if new_span > 0 {
                self.fat_write(chain[new_span as usize - 1], fat::EOC)?;
            }
            for &c in &chain[new_span as usize..] {
                self.fat_write(c, fat::FREE)?;
            }
            for &c in &chain[new_span as usize..] {
                self.bitmap.set_free(c);
            }
        }
        if let Some(e) = self.nodes.get_mut(&id) {
            if new_span == 0 {
                e.node.first_cluster = 0;
                e.node.contiguous = true;
            }
            e.dirty = true;
        }
        Ok(())
    }

    /// Adds one zeroed cluster to a directory stream.
    fn grow_directory(&mut self, dir: NodeId) -> Result<(), ExfatError> {
        let cs = self.sb.bytes_per_cluster();
        let old_span = {
            let e = self.valid_node_of(dir)?;
            e.node.length / cs
        };
        self.grow_chain(dir, old_span, old_span + 1)?;
        let node = self.valid_node_of(dir)?.node;
        let c = node_cluster_at(&self.sb, &mut self.device, &node, old_span)?;
        zero_cluster(&self.sb, &mut self.device, c)?;
        if let Some(e) = self.nodes.get_mut(&dir) {
            e.node.length += cs;
            e.node.valid_length = e.node.length;
            e.dirty = true;
        }
        Ok(())
    }

    /// Finds `want` consecutive reusable slots in a directory, growing
    /// the stream when the tail run is too short. Reusable means deleted
    /// or past the end marker.
    fn find_slot(&mut self, dir: NodeId, want: usize) -> Result<usize, ExfatError> {
        let node = self.valid_node_of(dir)?.node;
        let mut bytes = vec![0u8; node.length as usize];
        read_node_bytes(&self.sb, &mut self.device, &node, 0, &mut bytes)?;
        let slots = bytes.len() / DIRENT_SIZE;
        let mut run_start = 0usize;
        let mut run = 0usize;
        let mut ended = false;
        for i in 0..slots {
            let t = bytes[i * DIRENT_SIZE];
            if ended || t == 0x00 || t & 0x80 == 0 {
                if run == 0 {
                    run_start = i;
                }
                run += 1;
                if run == want {
                    return Ok(run_start);
                }
            } else {
                run = 0;
            }
            if t == 0x00 {
                ended = true;
            }
        }
        // not enough room, extend the tail run with fresh clusters
        let start = if run > 0 { run_start } else { slots };
        let missing = ((want - run) * DIRENT_SIZE) as u64;
        for _ in 0..missing.div_ceil(self.sb.bytes_per_cluster()).max(1) {
            self.grow_directory(dir)?;
        }
        Ok(start)
    }

    fn write_dir_slots(
        &mut self,
        dir: NodeId,
        slot: usize,
        set: &[RawDirEnt],
    ) -> Result<(), ExfatError> {
        let node = self.valid_node_of(dir)?.node;
        let mut bytes = Vec::with_capacity(set.len() * DIRENT_SIZE);
        for e in set {
            bytes.extend_from_slice(&e.raw);
        }
        write_node_bytes(
            &self.sb,
            &mut self.device,
            &node,
            (slot * DIRENT_SIZE) as u64,
            &bytes,
        )
    }

    /// Rewrites the on-disk entry set of one dirty cached entry: stream
    /// fields, timestamps and attributes are patched in place and the
    /// set checksum recomputed.
    fn flush_node(&mut self, id: NodeId) -> Result<(), ExfatError> {
        let (entry_node, parent, slot, count, times, attributes) = {
            let e = self.node_of(id)?;
            (
                e.node,
                e.parent,
                e.slot,
                1 + e.secondary_count as usize,
                e.times,
                e.attributes,
            )
        };
        let parent_node = self.valid_node_of(parent)?.node;
        let mut bytes = vec![0u8; count * DIRENT_SIZE];
        read_node_bytes(
            &self.sb,
            &mut self.device,
            &parent_node,
            (slot * DIRENT_SIZE) as u64,
            &mut bytes,
        )?;
        if bytes[0] != 0x85 || bytes[DIRENT_SIZE] != 0xC0 {
            return Err(ExfatError::Format(format!(
                "cached entry {:#x} no longer matches slot {} on disk",
                id, slot
            )));
        }

        put_u16(&mut bytes, 4, attributes);
        times.write(&mut bytes[0..DIRENT_SIZE]);
        {
            let s = &mut bytes[DIRENT_SIZE..2 * DIRENT_SIZE];
            s[1] = FLAG_ALLOC_POSSIBLE
                | if entry_node.contiguous {
                    FLAG_CONTIGUOUS
                } else {
                    0
                };
            put_u64(s, 8, entry_node.valid_length);
            put_u32(s, 20, entry_node.first_cluster);
            put_u64(s, 24, entry_node.length);
        }
        let mut set = Vec::with_capacity(count);
        for i in 0..count {
            set.push(RawDirEnt::from_bytes(
                &bytes[i * DIRENT_SIZE..(i + 1) * DIRENT_SIZE],
            ));
        }
        let sum = direntry::entry_set_checksum(&set);
        put_u16(&mut bytes, 2, sum);

        write_node_bytes(
            &self.sb,
            &mut self.device,
            &parent_node,
            (slot * DIRENT_SIZE) as u64,
            &bytes,
        )?;
        if let Some(e) = self.nodes.get_mut(&id) {
            e.dirty = false;
        }
        Ok(())
    }
}

fn past_end(offset: u64, len: usize, length: u64) -> ExfatError {
    ExfatError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!(
            "range {}..{} past the declared length {}",
            offset,
            offset as u128 + len as u128,
            length
        ),
    ))
}

/// Rejects a parsed record whose declared geometry cannot fit the
/// cluster heap. The math stays in u64 so absurd lengths cannot wrap
/// the comparisons.
fn check_record(sb: &SuperBlock, r: &FileRecord) -> Result<(), ExfatError> {
    let span = r.data_length.div_ceil(sb.bytes_per_cluster());
    if span > u64::from(sb.cluster_count) {
        return Err(ExfatError::Format(format!(
            "{}: {} bytes exceed a heap of {} clusters",
            r.name, r.data_length, sb.cluster_count
        )));
    }
    if span > 0 {
        if !sb.cluster_in_range(r.first_cluster) {
            return Err(ExfatError::Format(format!(
                "{}: first cluster {} outside the heap",
                r.name, r.first_cluster
            )));
        }
        if r.contiguous && u64::from(r.first_cluster) + span - 1 >= 2 + u64::from(sb.cluster_count)
        {
            return Err(ExfatError::Format(format!(
                "{}: contiguous run of {} from cluster {} leaves the heap",
                r.name, span, r.first_cluster
            )));
        }
    }
    Ok(())
}

/// Resolves the cluster holding byte index `index * cluster_size` of a
/// node, through the FAT unless the chain is contiguous.
fn node_cluster_at<D: BlockDevice + ?Sized>(
    sb: &SuperBlock,
    dev: &mut D,
    node: &Node,
    index: u64,
) -> Result<u32, ExfatError> {
    if node.contiguous {
        let c = u64::from(node.first_cluster) + index;
        if c >= 2 + u64::from(sb.cluster_count) {
            return Err(ExfatError::Format(format!(
                "contiguous run from {} leaves the heap at {}",
                node.first_cluster, c
            )));
        }
        Ok(c as u32)
    } else {
        Fat::new(sb, dev).advance(node.first_cluster, index)
    }
}

fn next_cluster<D: BlockDevice + ?Sized>(
    sb: &SuperBlock,
    dev: &mut D,
    node: &Node,
    cluster: u32,
) -> Result<u32, ExfatError> {
    if node.contiguous {
        let c = u64::from(cluster) + 1;
        if c >= 2 + u64::from(sb.cluster_count) {
            return Err(ExfatError::Format(format!(
                "contiguous run from {} leaves the heap at {}",
                node.first_cluster, c
            )));
        }
        Ok(c as u32)
    } else {
        Fat::new(sb, dev).next(cluster)?.ok_or_else(|| {
            ExfatError::Format(format!("FAT chain ends early at cluster {}", cluster))
        })
    }
}

/// Reads `buf.len()` bytes starting `offset` bytes into the node's
/// chain, crossing cluster boundaries as needed. The range must lie
/// inside the declared length.
fn read_node_bytes<D: BlockDevice + ?Sized>(
    sb: &SuperBlock,
    dev: &mut D,
    node: &Node,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), ExfatError> {
    if buf.is_empty() {
        return Ok(());
    }
    let end = offset
        .checked_add(buf.len() as u64)
        .ok_or_else(|| past_end(offset, buf.len(), node.length))?;
    if end > node.length {
        return Err(past_end(offset, buf.len(), node.length));
    }
    let cs = sb.bytes_per_cluster();
    let mut cluster = node_cluster_at(sb, dev, node, offset / cs)?;
    let mut pos = offset;
    let mut done = 0usize;
    while done < buf.len() {
        let within = pos % cs;
        let take = ((cs - within) as usize).min(buf.len() - done);
        dev.read_at(
            sb.cluster_to_byte_offset(cluster) + within,
            &mut buf[done..done + take],
        )?;
        done += take;
        pos += take as u64;
        if done < buf.len() {
            cluster = next_cluster(sb, dev, node, cluster)?;
        }
    }
    Ok(())
}

/// Mirror of `read_node_bytes` for the write direction.
fn write_node_bytes<D: BlockDevice + ?Sized>(
    sb: &SuperBlock,
    dev: &mut D,
    node: &Node,
    offset: u64,
    buf: &[u8],
) -> Result<(), ExfatError> {
    if buf.is_empty() {
        return Ok(());
    }
    let end = offset
        .checked_add(buf.len() as u64)
        .ok_or_else(|| past_end(offset, buf.len(), node.length))?;
    if end > node.length {
        return Err(past_end(offset, buf.len(), node.length));
    }
    let cs = sb.bytes_per_cluster();
    let mut cluster = node_cluster_at(sb, dev, node, offset / cs)?;
    let mut pos = offset;
    let mut done = 0usize;
    while done < buf.len() {
        let within = pos % cs;
        let take = ((cs - within) as usize).min(buf.len() - done);
        dev.write_at(
            sb.cluster_to_byte_offset(cluster) + within,
            &buf[done..done + take],
        )?;
        done += take;
        pos += take as u64;
        if done < buf.len() {
            cluster = next_cluster(sb, dev, node, cluster)?;
        }
    }
    Ok(())
}

/// Every cluster of a node, in stream order.
fn clusters_of<D: BlockDevice + ?Sized>(
    sb: &SuperBlock,
    dev: &mut D,
    node: &Node,
) -> Result<Vec<u32>, ExfatError> {
    let span = node.cluster_span(sb);
    if span == 0 {
        return Ok(Vec::new());
    }
    if node.contiguous {
        let last = u64::from(node.first_cluster) + span - 1;
        if !sb.cluster_in_range(node.first_cluster) || last >= 2 + u64::from(sb.cluster_count) {
            return Err(ExfatError::Format(format!(
                "contiguous run {}..={} leaves the heap",
                node.first_cluster, last
            )));
        }
        Ok((node.first_cluster..=last as u32).collect())
    } else {
        let chain = Fat::new(sb, dev).walk_chain(node.first_cluster, span as usize)?;
        if (chain.len() as u64) < span {
            return Err(ExfatError::Format(format!(
                "chain of {} clusters shorter than the declared {}",
                chain.len(),
                span
            )));
        }
        Ok(chain)
    }
}

fn zero_cluster<D: BlockDevice + ?Sized>(
    sb: &SuperBlock,
    dev: &mut D,
    cluster: u32,
) -> Result<(), ExfatError> {
    let zeros = vec![0u8; sb.bytes_per_cluster() as usize];
    dev.write_at(sb.cluster_to_byte_offset(cluster), &zeros)
}
