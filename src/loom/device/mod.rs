use std::{
    any::TypeId,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use super::{
    num::Scalar,
    ops::{TensorOp, TileId},
};

pub use cpu::{Cpu, CpuBuilder, Stats};

pub mod cpu;
pub mod wave;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device disconnected: {0}")]
    Recv(#[from] flume::RecvError),
}

/// Requests a device serves, in submission order.
#[derive(Debug)]
pub enum DeviceEvent {
    /// Allocates a zeroed buffer of `size` bytes for a tile.
    Register { id: TileId, size: usize },
    /// Enqueues an op. It runs once every earlier op touching the same tiles has run.
    Submit { op: Box<dyn TensorOp> },
    /// The contents of the tile are no longer needed. Later reads see unspecified data.
    Invalidate { id: TileId },
    /// The tile will not be used for a while. Purely advisory.
    WontUse { id: TileId },
    /// Releases the buffer of a tile after every earlier op touching it has run.
    Unregister { id: TileId },
    /// Answers once everything submitted before it has run.
    Barrier {
        sender: flume::Sender<Result<(), DeviceError>>,
    },
}

/// The runtime contract: accept events without blocking, execute them ordered by tile dependencies.
pub trait Device: std::fmt::Debug + Clone + Send + Sync + 'static {
    fn execute(&self, event: DeviceEvent);

    /// Waits for all ops submitted so far.
    ///
    /// The barrier is enqueued when this is called, not when the future is first polled.
    fn wait_all(&self) -> impl Future<Output = Result<(), DeviceError>> + Send {
        let (sender, receiver) = flume::bounded(1);
        self.execute(DeviceEvent::Barrier { sender });
        async move { receiver.recv_async().await? }
    }
}

/// Implemented for each backend for each [`TensorOp`].
/// Defines an op's actual execution on the backend.
pub trait BackendOp<B: Backend>: TensorOp {
    fn execute(&self, backend: &B);
}

pub trait Backend: Send + Sync + Sized + 'static {
    /// Executes an op by looking up its kernel.
    fn execute(&self, op: &dyn TensorOp);
    /// Fetches the buffer of a registered tile.
    ///
    /// # Panics
    /// Ops are checked against the registered tiles before they run, so a missing tile is a bug.
    fn fetch(&self, id: TileId) -> Buffer;
}

type OpVTable<B> = HashMap<TypeId, fn(&B, &dyn TensorOp)>;

/// Bytes of a tile, aligned for every element type.
#[derive(Debug, Default)]
pub struct Storage {
    data: Box<[u64]>,
    size: usize,
}

impl Storage {
    pub fn zeros(size: usize) -> Self {
        let data = vec![0u64; size.div_ceil(size_of::<u64>())].into_boxed_slice();
        Self { data, size }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.data)[..self.size]
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.data)[..self.size]
    }

    #[inline]
    pub fn read_slice<T: Scalar>(&self) -> &[T] {
        bytemuck::cast_slice(self.as_bytes())
    }

    #[inline]
    pub fn write_slice<T: Scalar>(&mut self) -> &mut [T] {
        bytemuck::cast_slice_mut(self.as_bytes_mut())
    }
}

/// A shared handle to the storage of a tile.
#[derive(Debug, Default, Clone)]
pub struct Buffer(Arc<RwLock<Storage>>);

impl Buffer {
    #[inline]
    pub fn new(storage: Storage) -> Self {
        Self(Arc::new(RwLock::new(storage)))
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Storage> {
        self.0.read().expect("failed to lock")
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Storage> {
        self.0.write().expect("failed to lock")
    }
}

#[cfg(test)]
mod tests {
    use half::f16;

    use super::Storage;

    #[test]
    fn test_storage() {
        let mut storage = Storage::zeros(3 * size_of::<f32>());
        assert_eq!(storage.read_slice::<f32>(), &[0.0; 3]);
        storage.write_slice::<f32>().copy_from_slice(&[1.0, 2.0, 3.0]);
        assert_eq!(storage.read_slice::<f32>(), &[1.0, 2.0, 3.0]);
        assert_eq!(storage.as_bytes().len(), 12);

        let storage = Storage::zeros(5 * size_of::<f16>());
        assert_eq!(storage.read_slice::<f16>().len(), 5);
    }
}
