use std::{any::Any, borrow::Cow, sync::Arc};

use derive_more::Display;
use itertools::Itertools;
use tessel_derive::TensorOp;
use thiserror::Error;

use super::{num::DataType, tag::Tag};

/// Marker for the runtime-assigned identity of a registered tile buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile;

pub type TileId = uid::Id<Tile>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum Access {
    ReadOnly,
    ReadWrite,
    WriteOnly,
}

impl Access {
    #[inline]
    pub fn is_read(self) -> bool {
        matches!(self, Access::ReadOnly | Access::ReadWrite)
    }

    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, Access::ReadWrite | Access::WriteOnly)
    }
}

/// A tile as seen by a submitted op: which buffer, how it is accessed, and what it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileIr {
    pub id: TileId,
    pub tag: Tag,
    pub r#type: DataType,
    /// Number of elements in the tile.
    pub count: usize,
    /// Node owning the tile.
    pub node: usize,
    pub access: Access,
}

impl TileIr {
    #[inline]
    pub fn data_size(&self) -> usize {
        self.count * self.r#type.size()
    }
}

/// An operation on tiles, submitted to a device.
///
/// The declared [`io`](TensorOp::io) is all the runtime needs to order submissions:
/// two ops touching the same tile run in submission order whenever at least one of them writes.
pub trait TensorOp: Any + std::fmt::Debug + Send + Sync {
    #[inline]
    fn name(&self) -> Cow<'static, str> {
        Cow::from(std::any::type_name::<Self>())
    }

    /// Tiles read and written by the op.
    fn io(&self) -> Vec<TileIr>;
}

impl dyn TensorOp {
    #[inline]
    pub fn downcast_ref<Op: TensorOp>(&self) -> Option<&Op> {
        (self as &dyn Any).downcast_ref()
    }

    #[inline]
    pub fn op_type(&self) -> std::any::TypeId {
        (self as &dyn Any).type_id()
    }
}

/// The io of an op whose tile accesses are listed explicitly.
#[derive(Debug, Clone)]
pub struct InnerOp {
    pub io: Vec<TileIr>,
}

impl InnerOp {
    #[inline]
    pub fn new(io: impl IntoIterator<Item = TileIr>) -> Self {
        let io = io.into_iter().collect();
        Self { io }
    }
}

impl TensorOp for InnerOp {
    #[inline]
    fn io(&self) -> Vec<TileIr> {
        self.io.clone()
    }
}

/// Writes host data into a tile.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", name = "import")]
pub struct ImportOp {
    #[tensor_op]
    pub op: InnerOp,
    pub contents: Arc<[u8]>,
}

/// Sends the contents of a tile back to the host.
#[derive(Debug, Clone, TensorOp)]
#[tensor_op(crate = "crate", name = "export")]
pub struct ExportOp {
    #[tensor_op]
    pub op: InnerOp,
    pub sender: flume::Sender<Arc<[u8]>>,
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("tile {0} is written and accessed again by the same op")]
    Aliased(Tag),
}

/// Checks the uniqueness rule: a tile written by an op must not appear in it twice.
pub fn check_io(io: &[TileIr]) -> Result<(), AccessError> {
    for (x, y) in io.iter().tuple_combinations() {
        if x.id == y.id && (x.access.is_write() || y.access.is_write()) {
            return Err(AccessError::Aliased(x.tag));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Access, AccessError, InnerOp, TensorOp, TileId, TileIr, check_io};
    use crate::loom::{num::DataType, tag::Tag};

    fn ir(id: TileId, access: Access) -> TileIr {
        TileIr {
            id,
            tag: Tag(0),
            r#type: DataType::F32,
            count: 4,
            node: 0,
            access,
        }
    }

    #[test]
    fn test_check_io() {
        let [a, b] = [TileId::new(), TileId::new()];

        let io = [ir(a, Access::ReadOnly), ir(a, Access::ReadOnly)];
        assert!(check_io(&io).is_ok());

        let io = [ir(a, Access::ReadOnly), ir(b, Access::ReadWrite)];
        assert!(check_io(&io).is_ok());

        let io = [ir(a, Access::ReadOnly), ir(a, Access::WriteOnly)];
        assert!(matches!(check_io(&io), Err(AccessError::Aliased(_))));

        let io = [ir(b, Access::ReadWrite), ir(b, Access::ReadWrite)];
        assert!(matches!(check_io(&io), Err(AccessError::Aliased(_))));
    }

    #[test]
    fn test_downcast() {
        let op: Box<dyn TensorOp> = Box::new(InnerOp::new([]));
        assert!(op.downcast_ref::<InnerOp>().is_some());
        assert_eq!(op.op_type(), std::any::TypeId::of::<InnerOp>());
        assert!(op.name().contains("InnerOp"));
    }
}
