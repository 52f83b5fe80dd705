use std::{
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use derive_more::Deref;
use thiserror::Error;

use super::{
    device::{Device, DeviceError, DeviceEvent},
    layout::{Shape, TensorTraits},
    num::{DataType, Scalar},
    ops::{Access, AccessError, ExportOp, ImportOp, InnerOp, TileId, TileIr},
    tag::{NextTag, Tag},
};

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("shape mismatch: {0} against {1}")]
    ShapeMismatch(Shape, Shape),
    #[error("distribution mismatch: {0} tiles but {1} placements")]
    DistributionMismatch(usize, usize),
    #[error("tensors {0} and {1} are placed differently")]
    PlacementMismatch(Tag, Tag),
    #[error("gradient presence contradicts the required-gradient flag")]
    InvalidGradConfig,
    #[error("unknown activation: {0}")]
    UnknownActivation(String),
    #[error("a model needs at least one layer")]
    EmptyModel,
    #[error("tensor {0} used after release")]
    UseAfterRelease(Tag),
    #[error("layer {0} does not consume the output of its predecessor")]
    Disconnected(usize),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl From<flume::RecvError> for TensorError {
    fn from(value: flume::RecvError) -> Self {
        Self::Device(value.into())
    }
}

#[derive(Debug)]
struct TensorInner<D: Device> {
    device: D,
    traits: TensorTraits,
    distribution: Vec<usize>,
    tag: Tag,
    r#type: DataType,
    /// Tile ids and their tags.
    tiles: Vec<(TileId, Tag)>,
    released: AtomicBool,
}

impl<D: Device> Drop for TensorInner<D> {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            log::trace!("release dropped tensor {}", self.tag);
            for &(id, _) in &self.tiles {
                self.device.execute(DeviceEvent::Unregister { id });
            }
        }
    }
}

/// A handle to a distributed tensor of any element type.
///
/// Cloning the handle shares the tensor. Equality is identity.
#[derive(Debug, Clone)]
pub struct TensorUntyped<D: Device>(Arc<TensorInner<D>>);

impl<D: Device> PartialEq for TensorUntyped<D> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<D: Device> Eq for TensorUntyped<D> {}

impl<D: Device> TensorUntyped<D> {
    #[inline]
    pub fn device(&self) -> &D {
        &self.0.device
    }

    #[inline]
    pub fn traits(&self) -> &TensorTraits {
        &self.0.traits
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        self.0.traits.shape()
    }

    #[inline]
    pub fn basetile_shape(&self) -> &Shape {
        self.0.traits.basetile_shape()
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.0.traits.ndim()
    }

    /// Owning node of each tile, by linear tile index.
    #[inline]
    pub fn distribution(&self) -> &[usize] {
        &self.0.distribution
    }

    /// Tag of the tensor, which is also the tag of its first tile.
    #[inline]
    pub fn tag(&self) -> Tag {
        self.0.tag
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.0.r#type
    }

    #[inline]
    pub fn is_released(&self) -> bool {
        self.0.released.load(Ordering::Acquire)
    }

    /// Returns `true` if both handles refer to the same tensor.
    #[inline]
    pub fn same(&self, other: &Self) -> bool {
        self == other
    }

    /// Fails with [`TensorError::UseAfterRelease`] once the tensor is unregistered.
    #[inline]
    pub fn check(&self) -> Result<(), TensorError> {
        match self.is_released() {
            true => Err(TensorError::UseAfterRelease(self.tag())),
            false => Ok(()),
        }
    }

    /// Checks that `other` has the same shape, tiling and placement.
    pub fn check_aligned(&self, other: &Self) -> Result<(), TensorError> {
        self.traits().check_compatible(other.traits())?;
        match self.distribution() == other.distribution() {
            true => Ok(()),
            false => Err(TensorError::PlacementMismatch(self.tag(), other.tag())),
        }
    }

    /// Describes the tile at linear index `index` for an op accessing it.
    pub fn ir(&self, index: usize, access: Access) -> TileIr {
        let traits = self.traits();
        let coords = traits.tile_index(index);
        let (id, tag) = self.0.tiles[index];
        TileIr {
            id,
            tag,
            r#type: self.0.r#type,
            count: traits.tile_shape(&coords).volume(),
            node: self.0.distribution[index],
            access,
        }
    }

    /// Describes the tile at the given grid coordinates.
    #[inline]
    pub fn ir_at(&self, coords: &[usize], access: Access) -> TileIr {
        self.ir(self.traits().tile_offset(coords), access)
    }

    /// Marks the contents as no longer needed. Later reads see unspecified data.
    pub fn invalidate_submit(&self) -> Result<(), TensorError> {
        self.check()?;
        for &(id, _) in &self.0.tiles {
            self.device().execute(DeviceEvent::Invalidate { id });
        }
        Ok(())
    }

    /// Hints that the tensor will not be used for a while.
    pub fn wont_use(&self) -> Result<(), TensorError> {
        self.check()?;
        for &(id, _) in &self.0.tiles {
            self.device().execute(DeviceEvent::WontUse { id });
        }
        Ok(())
    }

    /// Releases every tile. Ops submitted before still see the data.
    pub fn unregister(&self) -> Result<(), TensorError> {
        if self.0.released.swap(true, Ordering::AcqRel) {
            return Err(TensorError::UseAfterRelease(self.tag()));
        }
        log::debug!("unregister tensor {} {}", self.tag(), self.traits());
        for &(id, _) in &self.0.tiles {
            self.device().execute(DeviceEvent::Unregister { id });
        }
        Ok(())
    }
}

/// A statically typed tensor. Good to fit into typed APIs.
#[derive(Debug, Clone, PartialEq, Eq, Deref)]
pub struct Tensor<D: Device, T> {
    #[deref]
    tensor: TensorUntyped<D>,
    phantom: PhantomData<T>,
}

impl<D: Device, T: Scalar> Tensor<D, T> {
    /// Creates a tensor and registers its tiles with the device.
    ///
    /// Tile `i` receives tag `tag + i`; the returned allocator is advanced past the last one.
    /// Nothing is registered and no tag is consumed on failure.
    pub fn new(
        device: &D,
        traits: TensorTraits,
        distribution: Vec<usize>,
        next_tag: NextTag,
    ) -> Result<(Self, NextTag), TensorError> {
        let count = traits.grid_volume();
        if distribution.len() != count {
            return Err(TensorError::DistributionMismatch(count, distribution.len()));
        }

        const EXHAUSTED: TensorError = TensorError::InvalidConfig("tag space exhausted");
        let (tag, next_tag) = next_tag.reserve(count).ok_or(EXHAUSTED)?;
        let tags: Vec<_> = (0..count)
            .map(|index| tag.offset(index))
            .collect::<Option<_>>()
            .ok_or(EXHAUSTED)?;
        let tiles = tags
            .into_iter()
            .enumerate()
            .map(|(index, tag)| {
                let id = TileId::new();
                let coords = traits.tile_index(index);
                let size = traits.tile_shape(&coords).volume() * size_of::<T>();
                device.execute(DeviceEvent::Register { id, size });
                (id, tag)
            })
            .collect();
        log::debug!("register tensor {tag} {traits}");

        let inner = TensorInner {
            device: device.clone(),
            traits,
            distribution,
            tag,
            r#type: T::DATA_TYPE,
            tiles,
            released: AtomicBool::new(false),
        };
        let tensor = TensorUntyped(Arc::new(inner));
        let phantom = PhantomData;
        Ok((Self { tensor, phantom }, next_tag))
    }

    /// Creates a tensor with the same traits and placement as this one.
    #[inline]
    pub fn like<U: Scalar>(
        &self,
        next_tag: NextTag,
    ) -> Result<(Tensor<D, U>, NextTag), TensorError> {
        let traits = self.traits().clone();
        let distribution = self.distribution().to_vec();
        Tensor::new(self.device(), traits, distribution, next_tag)
    }

    /// Copies a column-major host array of the tensor's shape into the tiles.
    pub fn from_array(&self, shape: impl Into<Shape>, data: &[T]) -> Result<(), TensorError> {
        self.check()?;
        let shape = shape.into();
        if &shape != self.shape() {
            return Err(TensorError::ShapeMismatch(self.shape().clone(), shape));
        }
        if data.len() != shape.volume() {
            let len = Shape::from([data.len()]);
            return Err(TensorError::ShapeMismatch(shape, len));
        }

        let traits = self.traits();
        for index in 0..traits.grid_volume() {
            let coords = traits.tile_index(index);
            let tile: Vec<T> = traits.tile_elements(&coords).map(|x| data[x]).collect();
            let contents = bytemuck::cast_slice::<T, u8>(&tile).into();
            let op = InnerOp::new([self.ir(index, Access::WriteOnly)]);
            let op = ImportOp { op, contents };
            self.device().execute(DeviceEvent::Submit { op: Box::new(op) });
        }
        Ok(())
    }

    /// Same as [`from_array`](Self::from_array) with the tensor's own shape.
    #[inline]
    pub fn from_slice(&self, data: &[T]) -> Result<(), TensorError> {
        self.from_array(self.shape().clone(), data)
    }

    /// Copies the tiles into a column-major host array of the tensor's shape.
    ///
    /// Reads are ordered after every write submitted before the call.
    pub async fn to_array(&self, data: &mut [T]) -> Result<(), TensorError> {
        self.check()?;
        if data.len() != self.shape().volume() {
            let len = Shape::from([data.len()]);
            return Err(TensorError::ShapeMismatch(self.shape().clone(), len));
        }

        let traits = self.traits().clone();
        let receivers: Vec<_> = (0..traits.grid_volume())
            .map(|index| {
                let (sender, receiver) = flume::bounded(1);
                let op = InnerOp::new([self.ir(index, Access::ReadOnly)]);
                let op = ExportOp { op, sender };
                self.device().execute(DeviceEvent::Submit { op: Box::new(op) });
                receiver
            })
            .collect();

        let tiles = receivers.iter().map(|receiver| receiver.recv_async());
        let tiles = futures::future::try_join_all(tiles).await?;
        for (index, contents) in tiles.into_iter().enumerate() {
            let tile = bytemuck::pod_collect_to_vec::<u8, T>(&contents[..]);
            let coords = traits.tile_index(index);
            for (value, x) in tile.into_iter().zip(traits.tile_elements(&coords)) {
                data[x] = value;
            }
        }
        Ok(())
    }

    /// Reads the whole tensor back as a column-major vector.
    pub async fn to_vec(&self) -> Result<Vec<T>, TensorError> {
        let mut data = vec![T::zero(); self.shape().volume()];
        self.to_array(&mut data).await?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use half::f16;
    use itertools::Itertools;

    use super::{Access, Tensor, TensorError};
    use crate::loom::{
        device::{CpuBuilder, Device},
        layout::TensorTraits,
        tag::{NextTag, Tag},
    };

    #[tokio::test]
    async fn test_round_trip() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build().await;
        fastrand::seed(42);

        let traits = TensorTraits::new([5, 7, 3], [2, 3, 2])?;
        let distribution = traits.root_distribution();
        let (x, next) = Tensor::<_, f32>::new(&cpu, traits, distribution, NextTag::default())?;
        assert_eq!(x.tag(), Tag(0));
        assert_eq!(next, NextTag::new(3 * 3 * 2));

        let data = (0..x.shape().volume()).map(|_| fastrand::f32()).collect_vec();
        x.from_slice(&data)?;
        let output = x.to_vec().await?;
        assert_eq!(output, data);

        let traits = TensorTraits::new([4, 4], [3, 3])?;
        let distribution = traits.block_cyclic(&[2, 2], 0, 4)?;
        let (h, _) = Tensor::<_, f16>::new(&cpu, traits, distribution, next)?;
        let data = (0..16).map(|x| f16::from_f32(x as f32)).collect_vec();
        h.from_slice(&data)?;
        assert_eq!(h.to_vec().await?, data);

        x.unregister()?;
        h.unregister()?;
        cpu.wait_all().await?;
        assert_eq!(cpu.stats().tiles, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_tags() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build().await;
        fastrand::seed(42);

        let mut next = NextTag::default();
        let mut tensors = vec![];
        for _ in 0..16 {
            let shape = [fastrand::usize(1..10), fastrand::usize(1..10)];
            let tile = [fastrand::usize(1..=shape[0]), fastrand::usize(1..=shape[1])];
            let traits = TensorTraits::new(shape, tile)?;
            let distribution = traits.root_distribution();
            let (tensor, advanced) = Tensor::<_, f32>::new(&cpu, traits, distribution, next)?;
            next = advanced;
            tensors.push(tensor);
        }

        let tags = tensors
            .iter()
            .flat_map(|x| {
                let count = x.traits().grid_volume();
                (0..count).map(|index| x.ir(index, Access::ReadOnly).tag)
            })
            .collect_vec();
        assert!(tags.iter().tuple_windows().all(|(x, y)| x < y));
        Ok(())
    }

    #[tokio::test]
    async fn test_validation() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build().await;
        let traits = TensorTraits::new([4, 6], [2, 3])?;

        let next = NextTag::new(10);
        let result = Tensor::<_, f32>::new(&cpu, traits.clone(), vec![0; 3], next);
        assert!(matches!(result, Err(TensorError::DistributionMismatch(4, 3))));
        cpu.wait_all().await?;
        assert_eq!(cpu.stats().tiles, 0);

        let (x, _) = Tensor::<_, f32>::new(&cpu, traits, vec![0; 4], next)?;
        assert_eq!(x.tag(), Tag(10));
        assert!(matches!(
            x.from_array([6, 4], &[0.0; 24]),
            Err(TensorError::ShapeMismatch(..))
        ));
        assert!(matches!(
            x.from_slice(&[0.0; 23]),
            Err(TensorError::ShapeMismatch(..))
        ));

        // four tiles do not fit below the end of the tag space
        let traits = TensorTraits::new([4, 6], [2, 3])?;
        let result = Tensor::<_, f32>::new(&cpu, traits, vec![0; 4], NextTag::new(u64::MAX - 2));
        assert!(matches!(result, Err(TensorError::InvalidConfig(_))));
        cpu.wait_all().await?;
        assert_eq!(cpu.stats().tiles, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_use_after_release() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build().await;
        let traits = TensorTraits::new([3, 3], [2, 2])?;
        let distribution = traits.root_distribution();
        let (x, _) = Tensor::<_, f32>::new(&cpu, traits, distribution, NextTag::default())?;

        x.unregister()?;
        assert!(matches!(x.unregister(), Err(TensorError::UseAfterRelease(Tag(0)))));
        assert!(matches!(x.from_slice(&[0.0; 9]), Err(TensorError::UseAfterRelease(_))));
        assert!(matches!(x.to_vec().await, Err(TensorError::UseAfterRelease(_))));
        assert!(matches!(x.invalidate_submit(), Err(TensorError::UseAfterRelease(_))));
        assert!(matches!(x.wont_use(), Err(TensorError::UseAfterRelease(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_drop() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build().await;
        let traits = TensorTraits::new([8], [3])?;
        let distribution = traits.root_distribution();
        let (x, _) = Tensor::<_, f64>::new(&cpu, traits, distribution, NextTag::default())?;
        let y = x.clone();
        assert!(x.same(&y));

        cpu.wait_all().await?;
        assert_eq!(cpu.stats().tiles, 3);

        drop(x);
        cpu.wait_all().await?;
        assert_eq!(cpu.stats().tiles, 3);

        drop(y);
        cpu.wait_all().await?;
        assert_eq!(cpu.stats().tiles, 0);
        Ok(())
    }
}
