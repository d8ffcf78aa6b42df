use crate::direntry::{ATTR_DIRECTORY, FileRecord};
use crate::superblock::SuperBlock;
use crate::times::{DOS_EPOCH, EntryTime, EntryTimes};
use prettytable::{Cell, Row, Table};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Arena identifier of a directory entry: the parent directory's first
/// cluster in the high half, the primary entry's slot index in the low.
/// The id survives cache rebuilds because both halves come off the disk
/// layout, not from allocation order.
pub type NodeId = u64;

/// The root directory has no entry of its own; it gets the one id no
/// real slot can produce.
pub const ROOT_ID: NodeId = 0;

#[inline]
pub fn node_id(dir_first_cluster: u32, slot: usize) -> NodeId {
    (u64::from(dir_first_cluster) << 32) | slot as u64
}

/// A span of bytes reachable through a cluster chain. `contiguous`
/// mirrors the NoFatChain flag: when set the clusters are consecutive
/// and the FAT holds no entries for them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Node {
    pub first_cluster: u32,
    pub length: u64,
    pub valid_length: u64,
    pub contiguous: bool,
}

impl Node {
    /// Number of clusters the declared length occupies.
    #[inline]
    pub fn cluster_span(&self, sb: &SuperBlock) -> u64 {
        self.length.div_ceil(sb.bytes_per_cluster())
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.first_cluster >= 2
    }
}

/// A named entry in the per-volume arena. `parent` is an arena id, not
/// a reference, so entries can be looked up and mutated independently.
/// Removal flips `valid` off but keeps the entry around for callers
/// still holding its id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: NodeId,
    pub parent: NodeId,
    pub name: String,
    pub attributes: u16,
    pub times: EntryTimes,
    pub node: Node,
    pub slot: usize,
    pub secondary_count: u8,
    pub valid: bool,
    pub dirty: bool,
}

impl NodeEntry {
    pub fn from_record(dir_first_cluster: u32, parent: NodeId, fr: &FileRecord) -> Self {
        Self {
            id: node_id(dir_first_cluster, fr.slot),
            parent,
            name: fr.name.clone(),
            attributes: fr.attributes,
            times: fr.times,
            node: Node {
                first_cluster: fr.first_cluster,
                length: fr.data_length,
                valid_length: fr.valid_length,
                contiguous: fr.contiguous,
            },
            slot: fr.slot,
            secondary_count: fr.secondary_count,
            valid: true,
            dirty: false,
        }
    }

    /// Synthetic entry for the root directory. The root chain is always
    /// FAT-linked and its length is whatever the chain walk measured.
    pub fn root(root_cluster: u32, length: u64) -> Self {
        let epoch = EntryTime {
            unix_secs: DOS_EPOCH,
            centis: 0,
            tz_offset_quarters: None,
        };
        Self {
            id: ROOT_ID,
            parent: ROOT_ID,
            name: String::new(),
            attributes: ATTR_DIRECTORY,
            times: EntryTimes {
                created: epoch,
                modified: epoch,
                accessed: epoch,
            },
            node: Node {
                first_cluster: root_cluster,
                length,
                valid_length: length,
                contiguous: false,
            },
            slot: 0,
            secondary_count: 0,
            valid: true,
            dirty: false,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid
    }
    #[inline]
    pub fn is_dir(&self) -> bool {
        (self.attributes & ATTR_DIRECTORY) != 0
    }
    #[inline]
    pub fn is_regular_file(&self) -> bool {
        !self.is_dir()
    }
    #[inline]
    pub fn size(&self) -> u64 {
        self.node.length
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    pub fn to_string(&self) -> String {
        let mut t = Table::new();
        t.add_row(Row::new(vec![
            Cell::new("Identifier"),
            Cell::new(&format!("0x{:x}", self.id)),
        ]));
        t.add_row(Row::new(vec![
            Cell::new("Attributes"),
            Cell::new(&format!("0x{:04x}", self.attributes)),
        ]));
        t.add_row(Row::new(vec![
            Cell::new("First cluster"),
            Cell::new(&format!("{}", self.node.first_cluster)),
        ]));
        t.add_row(Row::new(vec![
            Cell::new("Size"),
            Cell::new(&format!("{}", self.node.length)),
        ]));
        t.add_row(Row::new(vec![
            Cell::new("Valid size"),
            Cell::new(&format!("{}", self.node.valid_length)),
        ]));
        t.add_row(Row::new(vec![
            Cell::new("Contiguous"),
            Cell::new(&format!("{}", self.node.contiguous)),
        ]));
        t.add_row(Row::new(vec![
            Cell::new("Dir?"),
            Cell::new(&format!("{}", self.is_dir())),
        ]));
        t.add_row(Row::new(vec![Cell::new("Name"), Cell::new(&self.name)]));
        t.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direntry::ATTR_ARCHIVE;
    use crate::testimg::{fixed_times, toy_superblock};

    fn record(name: &str, slot: usize) -> FileRecord {
        FileRecord {
            name: name.to_string(),
            attributes: ATTR_ARCHIVE,
            times: fixed_times(),
            first_cluster: 9,
            valid_length: 100,
            data_length: 4096,
            contiguous: true,
            slot,
            secondary_count: 2,
        }
    }

    #[test]
    fn id_packs_cluster_and_slot() {
        assert_eq!(node_id(5, 3), 0x0000_0005_0000_0003);
        assert_ne!(node_id(5, 3), node_id(5, 4));
        assert_ne!(node_id(5, 3), node_id(6, 3));
        assert_ne!(node_id(4, 0), ROOT_ID);
    }

    #[test]
    fn entry_from_record() {
        let e = NodeEntry::from_record(5, ROOT_ID, &record("a.txt", 3));
        assert_eq!(e.id, node_id(5, 3));
        assert_eq!(e.parent, ROOT_ID);
        assert_eq!(e.name, "a.txt");
        assert!(e.is_regular_file());
        assert!(e.is_valid());
        assert!(!e.dirty);
        assert_eq!(e.node.length, 4096);
        assert_eq!(e.node.valid_length, 100);
        assert!(e.node.contiguous);
    }

    #[test]
    fn cluster_span_rounds_up() {
        let sb = toy_superblock();
        let mut n = Node {
            first_cluster: 2,
            length: 0,
            valid_length: 0,
            contiguous: true,
        };
        assert_eq!(n.cluster_span(&sb), 0);
        n.length = 1;
        assert_eq!(n.cluster_span(&sb), 1);
        n.length = sb.bytes_per_cluster();
        assert_eq!(n.cluster_span(&sb), 1);
        n.length = sb.bytes_per_cluster() + 1;
        assert_eq!(n.cluster_span(&sb), 2);
    }

    #[test]
    fn root_entry_shape() {
        let e = NodeEntry::root(4, 2048);
        assert_eq!(e.id, ROOT_ID);
        assert_eq!(e.parent, ROOT_ID);
        assert!(e.is_dir());
        assert!(e.is_valid());
        assert!(!e.node.contiguous);
        assert_eq!(e.node.first_cluster, 4);
        assert_eq!(e.node.length, 2048);
    }

    #[test]
    fn renders_table_and_json() {
        let e = NodeEntry::from_record(5, ROOT_ID, &record("a.txt", 3));
        let s = e.to_string();
        assert!(s.contains("a.txt"));
        assert!(s.contains("Valid size"));
        let j = e.to_json();
        assert_eq!(j["name"], "a.txt");
        assert_eq!(j["node"]["first_cluster"], 9);
    }
}
