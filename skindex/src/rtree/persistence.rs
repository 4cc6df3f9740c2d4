//! Node-file persistence: an append-only file of bincode-encoded nodes plus
//! an offset/length map for O(1) random reads.
//!
//! Nodes are written once during the build and never rewritten; the map is
//! persisted to a sibling file and must be reloaded before any query-time
//! node read.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{IndexError, IndexResult};

use super::node::{Node, NodeRef};

/// Maps a node id to the byte offset and encoded length of its page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOffsetMap {
    offsets: HashMap<NodeRef, (u64, u32)>,
}

impl NodeOffsetMap {
    pub fn get(&self, id: NodeRef) -> Option<(u64, u32)> {
        self.offsets.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn save(&self, path: &Path) -> IndexResult<()> {
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::legacy())
            .map_err(|e| IndexError::Serialization(e.to_string()))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load(path: &Path) -> IndexResult<Self> {
        let bytes = std::fs::read(path)?;
        let (map, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())
            .map_err(|e| IndexError::Serialization(e.to_string()))?;
        Ok(map)
    }
}

/// Sequential writer used once per build to drain the node arena.
pub struct NodeFileWriter {
    file: BufWriter<File>,
    offsets: NodeOffsetMap,
    position: u64,
}

impl NodeFileWriter {
    pub fn create(path: &Path) -> IndexResult<Self> {
        Ok(Self {
            file: BufWriter::new(File::create(path)?),
            offsets: NodeOffsetMap::default(),
            position: 0,
        })
    }

    pub fn write_node(&mut self, node: &Node) -> IndexResult<()> {
        let bytes = bincode::serde::encode_to_vec(node, bincode::config::legacy())
            .map_err(|e| IndexError::Serialization(e.to_string()))?;

        self.file.write_all(&bytes)?;
        self.offsets
            .offsets
            .insert(node.id, (self.position, bytes.len() as u32));
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Flushes, syncs and returns the offset map for persisting.
    pub fn finish(mut self) -> IndexResult<NodeOffsetMap> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(self.offsets)
    }
}

/// Random-access node reader; one per query iterator so concurrent queries
/// never share a file cursor.
pub struct NodeFileReader {
    file: File,
    offsets: Arc<NodeOffsetMap>,
}

impl NodeFileReader {
    pub fn open(path: &Path, offsets: Arc<NodeOffsetMap>) -> IndexResult<Self> {
        Ok(Self {
            file: File::open(path)?,
            offsets,
        })
    }

    pub fn read_node(&mut self, id: NodeRef) -> IndexResult<Node> {
        let (offset, len) = self
            .offsets
            .get(id)
            .ok_or_else(|| IndexError::Store(format!("node {id} not in offset map")))?;

        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        self.file.read_exact(&mut buf)?;

        let (node, _) = bincode::serde::decode_from_slice(&buf, bincode::config::legacy())
            .map_err(|e| IndexError::Serialization(e.to_string()))?;
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtree::geometry::{Point, Rectangle};
    use crate::rtree::node::NumericRange;
    use tempfile::tempdir;

    fn sample_node(id: NodeRef, level: u16, entries: usize) -> Node {
        let mut node = Node::new(id, level);
        node.parent = (id != 0).then_some(0);
        for i in 0..entries {
            node.push(
                i as u64 * 100,
                Rectangle::new(
                    Point::new(i as f32, i as f32),
                    Point::new(i as f32 + 1.0, i as f32 + 2.0),
                ),
                Some(NumericRange::from_values(vec![i as f32, -(i as f32)])),
            );
        }
        node
    }

    #[test]
    fn test_node_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.bin");

        let nodes: Vec<Node> = (0..5).map(|i| sample_node(i, (i % 3) as u16, 4)).collect();

        let mut writer = NodeFileWriter::create(&path).unwrap();
        for node in &nodes {
            writer.write_node(node).unwrap();
        }
        let map = writer.finish().unwrap();
        assert_eq!(map.len(), 5);

        let mut reader = NodeFileReader::open(&path, Arc::new(map)).unwrap();
        // Read out of write order.
        for id in [3u64, 0, 4, 1, 2] {
            let back = reader.read_node(id).unwrap();
            assert_eq!(back, nodes[id as usize]);
        }
    }

    #[test]
    fn test_offset_map_save_load() {
        let dir = tempdir().unwrap();
        let node_path = dir.path().join("nodes.bin");
        let map_path = dir.path().join("nodes.map");

        let mut writer = NodeFileWriter::create(&node_path).unwrap();
        for i in 0..3 {
            writer.write_node(&sample_node(i, 0, 2)).unwrap();
        }
        let map = writer.finish().unwrap();
        map.save(&map_path).unwrap();

        let reloaded = NodeOffsetMap::load(&map_path).unwrap();
        assert_eq!(reloaded, map);
    }

    #[test]
    fn test_missing_node_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.bin");

        let mut writer = NodeFileWriter::create(&path).unwrap();
        writer.write_node(&sample_node(0, 0, 1)).unwrap();
        let map = writer.finish().unwrap();

        let mut reader = NodeFileReader::open(&path, Arc::new(map)).unwrap();
        assert!(reader.read_node(42).is_err());
    }
}
