use itertools::Itertools;
use rustc_hash::FxHashSet as HashSet;

use crate::loom::ops::{TensorOp, TileId, TileIr};

/// Submitted ops with pairwise independent tile accesses, in submission order.
///
/// No two members of a wave conflict, i.e., no tile is written by one member and read or
/// written by another. Members may therefore run in any order, or in parallel.
#[derive(Debug, Default)]
pub struct Wave {
    ops: Vec<Box<dyn TensorOp>>,
    reads: HashSet<TileId>,
    writes: HashSet<TileId>,
}

impl Wave {
    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns `true` if an op with the given io depends on any member (read-after-write,
    /// write-after-read or write-after-write).
    pub fn conflicts(&self, io: &[TileIr]) -> bool {
        io.iter().any(|ir| match ir.access.is_write() {
            true => self.touches(ir.id),
            false => self.writes.contains(&ir.id),
        })
    }

    /// Returns `true` if any member reads or writes the tile.
    #[inline]
    pub fn touches(&self, id: TileId) -> bool {
        self.reads.contains(&id) || self.writes.contains(&id)
    }

    /// Adds an op. The caller must have checked it does not conflict.
    pub fn push(&mut self, op: Box<dyn TensorOp>) {
        let io = op.io();
        debug_assert!(!self.conflicts(&io));
        for ir in io {
            match ir.access.is_write() {
                true => self.writes.insert(ir.id),
                false => self.reads.insert(ir.id),
            };
        }
        self.ops.push(op);
    }

    /// Empties the wave, returning its members.
    pub fn take(&mut self) -> Vec<Box<dyn TensorOp>> {
        self.reads.clear();
        self.writes.clear();
        std::mem::take(&mut self.ops)
    }
}

impl std::fmt::Display for Wave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.ops.iter().map(|op| op.name()).format(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::Wave;
    use crate::loom::{
        num::DataType,
        ops::{Access, InnerOp, TileId, TileIr},
        tag::Tag,
    };

    fn ir(id: TileId, access: Access) -> TileIr {
        TileIr {
            id,
            tag: Tag(0),
            r#type: DataType::F32,
            count: 1,
            node: 0,
            access,
        }
    }

    #[test]
    fn test_conflicts() {
        let [a, b, c] = [TileId::new(), TileId::new(), TileId::new()];

        let mut wave = Wave::default();
        wave.push(Box::new(InnerOp::new([
            ir(a, Access::ReadOnly),
            ir(b, Access::WriteOnly),
        ])));

        // read-after-read
        assert!(!wave.conflicts(&[ir(a, Access::ReadOnly)]));
        // write-after-read
        assert!(wave.conflicts(&[ir(a, Access::ReadWrite)]));
        // read-after-write
        assert!(wave.conflicts(&[ir(b, Access::ReadOnly)]));
        // write-after-write
        assert!(wave.conflicts(&[ir(b, Access::WriteOnly)]));
        // independent
        assert!(!wave.conflicts(&[ir(a, Access::ReadOnly), ir(c, Access::WriteOnly)]));

        wave.push(Box::new(InnerOp::new([ir(c, Access::ReadWrite)])));
        assert_eq!(wave.len(), 2);
        assert!(wave.touches(c));

        let ops = wave.take();
        assert_eq!(ops.len(), 2);
        assert!(wave.is_empty());
        assert!(!wave.conflicts(&[ir(b, Access::WriteOnly)]));
    }
}
