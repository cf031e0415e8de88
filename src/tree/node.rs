use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use super::array::SortedArray;
use super::pair::Element;
use crate::errdata;
use crate::error::Result;

/// Index of a node in the tree's arena. Parent references are plain arena
/// indices, so the structure stays acyclic for ownership purposes.
pub(crate) type NodeId = usize;

/// Byte overhead of a node image before its elements: the first-child
/// block index (4) plus the node-size field (2). The overflow predicate
/// accounts for it.
pub(crate) const NODE_HEADER: usize = 6;

/// One slot in a node's ordered element list: the element plus the
/// subtree holding keys greater than it and less than its successor.
#[derive(Debug, Clone)]
pub(crate) struct Entry<E> {
    pub elem: E,
    pub after: Option<NodeId>,
}

impl<E: Ord> PartialEq for Entry<E> {
    fn eq(&self, other: &Self) -> bool {
        self.elem == other.elem
    }
}

impl<E: Ord> Eq for Entry<E> {}

impl<E: Ord> PartialOrd for Entry<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E: Ord> Ord for Entry<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.elem.cmp(&other.elem)
    }
}

/// An in-memory tree node. Serializes 1:1 into one Single block;
/// `block == 0` means not yet persisted.
#[derive(Debug, Clone)]
pub(crate) struct Node<E: Element> {
    pub elems: SortedArray<Entry<E>>,
    pub first: Option<NodeId>,
    pub parent: Option<NodeId>,
    pub block: u32,
    pub synced: bool,
}

impl<E: Element> Node<E> {
    pub fn new(parent: Option<NodeId>) -> Self {
        Self {
            elems: SortedArray::new(),
            first: None,
            parent,
            block: 0,
            synced: false,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.first.is_none() && self.elems.iter().all(|entry| entry.after.is_none())
    }

    /// The node's in-memory byte footprint: header plus element sizes.
    pub fn byte_size(&self) -> usize {
        NODE_HEADER + self.elems.iter().map(|entry| entry.elem.size()).sum::<usize>()
    }

    pub fn overflows(&self, total: u16) -> bool {
        self.byte_size() > total as usize
    }
}

/// The serialized form of one node:
///
/// ```text
/// first-child block index (u32) | node size (u16)
/// then per element:
///   element length (u16) | element bytes | after-child block index (u32)
/// ```
///
/// The element length belongs to the node format; element bytes stay
/// opaque, and `Element::size()` excludes the prefix.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NodeImage<E> {
    pub first: u32,
    pub total: u16,
    pub elems: Vec<(E, u32)>,
}

impl<E: Element> NodeImage<E> {
    /// Serializes the image. `cap` is the per-element byte cap,
    /// `(total - 6) / 2`.
    pub fn encode(&self, cap: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(NODE_HEADER);
        buf.write_u32::<BigEndian>(self.first)?;
        buf.write_u16::<BigEndian>(self.total)?;
        for (elem, after) in &self.elems {
            buf.write_u16::<BigEndian>(elem.size() as u16)?;
            let start = buf.len();
            elem.encode(cap, &mut buf)?;
            if buf.len() - start != elem.size() {
                return errdata!(
                    "element encoded {} bytes but reports size {}",
                    buf.len() - start,
                    elem.size()
                );
            }
            buf.write_u32::<BigEndian>(*after)?;
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NODE_HEADER {
            return errdata!("node image truncated at {} bytes", bytes.len());
        }
        let first = BigEndian::read_u32(&bytes[0..4]);
        let total = BigEndian::read_u16(&bytes[4..6]);
        let mut elems = Vec::new();
        let mut pos = NODE_HEADER;
        while pos < bytes.len() {
            if pos + 2 > bytes.len() {
                return errdata!("node image truncated in element length");
            }
            let elem_len = BigEndian::read_u16(&bytes[pos..pos + 2]) as usize;
            pos += 2;
            if pos + elem_len + 4 > bytes.len() {
                return errdata!("node image truncated in element");
            }
            let elem = E::decode(&bytes[pos..pos + elem_len])?;
            pos += elem_len;
            let after = BigEndian::read_u32(&bytes[pos..pos + 4]);
            pos += 4;
            elems.push((elem, after));
        }
        Ok(Self {
            first,
            total,
            elems,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::pair::Pair;

    #[test]
    fn test_image_round_trip_bytes() {
        let image = NodeImage {
            first: 7,
            total: 512,
            elems: vec![
                (Pair::new("alpha", "1"), 0),
                (Pair::new("beta", "2"), 12),
                (Pair::new("gamma", "3"), 9),
            ],
        };

        let bytes = image.encode(64).expect("encode failed");
        let decoded: NodeImage<Pair> = NodeImage::decode(&bytes).expect("decode failed");
        assert_eq!(decoded, image);

        // Deserialize-then-serialize yields identical bytes.
        let bytes_again = decoded.encode(64).expect("encode failed");
        assert_eq!(bytes_again, bytes);
    }

    #[test]
    fn test_image_empty_node() {
        let image: NodeImage<Pair> = NodeImage {
            first: 0,
            total: 128,
            elems: Vec::new(),
        };
        let bytes = image.encode(61).expect("encode failed");
        assert_eq!(bytes.len(), NODE_HEADER);
        assert_eq!(NodeImage::<Pair>::decode(&bytes).expect("decode failed"), image);
    }

    #[test]
    fn test_image_rejects_truncation() {
        let image = NodeImage {
            first: 0,
            total: 512,
            elems: vec![(Pair::new("key", "value"), 0)],
        };
        let bytes = image.encode(64).expect("encode failed");
        assert!(NodeImage::<Pair>::decode(&bytes[..bytes.len() - 2]).is_err());
        assert!(NodeImage::<Pair>::decode(&bytes[..3]).is_err());
    }

    #[test]
    fn test_leaf_and_sizes() {
        let mut node: Node<Pair> = Node::new(None);
        assert!(node.is_leaf());
        assert_eq!(node.byte_size(), NODE_HEADER);

        node.elems.insert(Entry {
            elem: Pair::new("ab", "cd"),
            after: None,
        });
        assert!(node.is_leaf());
        assert_eq!(node.byte_size(), NODE_HEADER + 5);
        assert!(node.overflows(10));
        assert!(!node.overflows(11));

        node.elems.get_mut(0).unwrap().after = Some(3);
        assert!(!node.is_leaf());
    }
}
