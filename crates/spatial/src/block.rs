//! Flat serialized form of a [`SpatialIndex`].
//!
//! Layout: [`BlockHeader`], then `node_count` [`QuadNode`] records, then
//! `payload_count` [`PayloadRange`] records, then `object_count` `u32` object
//! ids. All fields are in host byte order.

use std::path::Path;

use bytemuck::{Pod, Zeroable};
use terrastream_common::INVALID_INDEX;

use crate::tree::{PayloadRange, QuadNode, SpatialIndex};

const MAGIC: [u8; 4] = *b"QTRE";
const VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BlockHeader {
    magic: [u8; 4],
    version: u32,
    node_count: u32,
    payload_count: u32,
    object_count: u32,
    max_cull_results: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();
const NODE_SIZE: usize = std::mem::size_of::<QuadNode>();
const PAYLOAD_SIZE: usize = std::mem::size_of::<PayloadRange>();

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("block too short: {0} bytes")]
    TooShort(usize),
    #[error("bad block magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("unsupported block version {0}")]
    UnsupportedVersion(u32),
    #[error("block length mismatch: header describes {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("node {node} is corrupt: {reason}")]
    CorruptNode { node: u32, reason: &'static str },
    #[error("payload table is corrupt: {0}")]
    CorruptPayload(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SpatialIndex {
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = BlockHeader {
            magic: MAGIC,
            version: VERSION,
            node_count: self.nodes.len() as u32,
            payload_count: self.payloads.len() as u32,
            object_count: self.objects.len() as u32,
            max_cull_results: self.max_cull_results,
        };
        let mut out = Vec::with_capacity(
            HEADER_SIZE
                + self.nodes.len() * NODE_SIZE
                + self.payloads.len() * PAYLOAD_SIZE
                + self.objects.len() * 4,
        );
        out.extend_from_slice(bytemuck::bytes_of(&header));
        out.extend_from_slice(bytemuck::cast_slice(&self.nodes));
        out.extend_from_slice(bytemuck::cast_slice(&self.payloads));
        out.extend_from_slice(bytemuck::cast_slice(&self.objects));
        out
    }

    /// Parse and validate a block produced by [`SpatialIndex::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        if bytes.len() < HEADER_SIZE {
            return Err(IndexError::TooShort(bytes.len()));
        }
        let header: BlockHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);
        if header.magic != MAGIC {
            return Err(IndexError::BadMagic(header.magic));
        }
        if header.version != VERSION {
            return Err(IndexError::UnsupportedVersion(header.version));
        }

        let node_bytes = header.node_count as usize * NODE_SIZE;
        let payload_bytes = header.payload_count as usize * PAYLOAD_SIZE;
        let object_bytes = header.object_count as usize * 4;
        let expected = HEADER_SIZE + node_bytes + payload_bytes + object_bytes;
        if bytes.len() != expected {
            return Err(IndexError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }

        let (node_part, rest) = bytes[HEADER_SIZE..].split_at(node_bytes);
        let (payload_part, object_part) = rest.split_at(payload_bytes);
        let nodes: Vec<QuadNode> = bytemuck::pod_collect_to_vec(node_part);
        let payloads: Vec<PayloadRange> = bytemuck::pod_collect_to_vec(payload_part);
        let objects: Vec<u32> = bytemuck::pod_collect_to_vec(object_part);

        validate_nodes(&nodes, payloads.len())?;
        let mut total = 0u64;
        for range in &payloads {
            let end = range.offset as u64 + range.count as u64;
            if end > objects.len() as u64 {
                return Err(IndexError::CorruptPayload("range exceeds object table"));
            }
            total += range.count as u64;
        }
        if total != header.max_cull_results as u64 {
            return Err(IndexError::CorruptPayload("max cull results does not match payloads"));
        }

        Ok(Self {
            nodes,
            payloads,
            objects,
            max_cull_results: header.max_cull_results,
        })
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), IndexError> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}

fn validate_nodes(nodes: &[QuadNode], payload_count: usize) -> Result<(), IndexError> {
    for (i, node) in nodes.iter().enumerate() {
        let node_id = i as u32;
        if node.payload != INVALID_INDEX && node.payload as usize >= payload_count {
            return Err(IndexError::CorruptNode {
                node: node_id,
                reason: "payload index out of range",
            });
        }
        for &child in &node.children {
            if child == INVALID_INDEX {
                continue;
            }
            // Pre-order storage: children always follow their parent.
            if child <= node_id || child as usize >= nodes.len() {
                return Err(IndexError::CorruptNode {
                    node: node_id,
                    reason: "child index out of range",
                });
            }
        }
    }
    Ok(())
}
