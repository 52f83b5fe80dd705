use std::sync::Arc;

use derive_more::{Deref, Display};
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::tensor::TensorError;

/// An ordered list of extents, one per dimension.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{}]", _0.iter().format(", "))]
pub struct Shape(Arc<[usize]>);

impl Shape {
    /// Number of elements covered by the shape. A shape with no dimensions covers one element.
    #[inline]
    pub fn volume(&self) -> usize {
        self.iter().product()
    }

    /// Concatenates two shapes.
    #[inline]
    pub fn concat(&self, other: &[usize]) -> Self {
        self.iter().chain(other).copied().collect()
    }
}

impl From<Vec<usize>> for Shape {
    #[inline]
    fn from(value: Vec<usize>) -> Self {
        Self(value.into())
    }
}

impl From<&[usize]> for Shape {
    #[inline]
    fn from(value: &[usize]) -> Self {
        Self(value.into())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    #[inline]
    fn from(value: [usize; N]) -> Self {
        Self(value.into())
    }
}

impl FromIterator<usize> for Shape {
    #[inline]
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Shape of a tensor and of the tiles it is cut into.
///
/// Tiles and the elements inside a tile are both enumerated in column-major
/// order: the first dimension varies fastest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{shape} / {basetile_shape}")]
pub struct TensorTraits {
    shape: Shape,
    basetile_shape: Shape,
    grid: Shape,
}

impl TensorTraits {
    /// Creates traits from a global shape and a base tile shape.
    ///
    /// Fails with [`TensorError::ShapeMismatch`] if the lengths differ or any extent is zero.
    pub fn new(
        shape: impl Into<Shape>,
        basetile_shape: impl Into<Shape>,
    ) -> Result<Self, TensorError> {
        let shape = shape.into();
        let basetile_shape = basetile_shape.into();
        if shape.len() != basetile_shape.len()
            || shape.contains(&0)
            || basetile_shape.contains(&0)
        {
            return Err(TensorError::ShapeMismatch(shape, basetile_shape));
        }
        let grid = itertools::zip_eq(shape.iter(), basetile_shape.iter())
            .map(|(&x, &t)| x.div_ceil(t))
            .collect();
        Ok(Self {
            shape,
            basetile_shape,
            grid,
        })
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn basetile_shape(&self) -> &Shape {
        &self.basetile_shape
    }

    /// Number of tiles along each dimension.
    #[inline]
    pub fn grid(&self) -> &Shape {
        &self.grid
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements of the whole tensor.
    #[inline]
    pub fn volume(&self) -> usize {
        self.shape.volume()
    }

    /// Number of tiles.
    #[inline]
    pub fn grid_volume(&self) -> usize {
        self.grid.volume()
    }

    /// Returns `true` if both traits describe the same shape cut into the same tiles.
    #[inline]
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.shape == other.shape && self.basetile_shape == other.basetile_shape
    }

    /// Checks that `other` has the same shape and tiling.
    pub fn check_compatible(&self, other: &Self) -> Result<(), TensorError> {
        match self.is_compatible(other) {
            true => Ok(()),
            false if self.shape != other.shape => Err(TensorError::ShapeMismatch(
                self.shape.clone(),
                other.shape.clone(),
            )),
            false => Err(TensorError::ShapeMismatch(
                self.basetile_shape.clone(),
                other.basetile_shape.clone(),
            )),
        }
    }

    /// Converts a linear tile index into its grid coordinates.
    pub fn tile_index(&self, mut index: usize) -> Vec<usize> {
        self.grid
            .iter()
            .map(|&extent| {
                let coord = index % extent;
                index /= extent;
                coord
            })
            .collect()
    }

    /// Converts grid coordinates into a linear tile index.
    pub fn tile_offset(&self, coords: &[usize]) -> usize {
        debug_assert_eq!(coords.len(), self.ndim());
        coords
            .iter()
            .zip(self.grid.iter())
            .rev()
            .fold(0, |offset, (&coord, &extent)| offset * extent + coord)
    }

    /// Shape of the tile at the given grid coordinates. Tiles on the far border may be partial.
    pub fn tile_shape(&self, coords: &[usize]) -> Shape {
        itertools::izip!(coords, self.shape.iter(), self.basetile_shape.iter())
            .map(|(&coord, &extent, &tile)| tile.min(extent - coord * tile))
            .collect()
    }

    /// Maps every element of a tile, in tile order, to its offset in the full column-major array.
    pub fn tile_elements(&self, coords: &[usize]) -> impl Iterator<Item = usize> + use<> {
        let tile_shape = self.tile_shape(coords);
        let origin: Vec<usize> = itertools::zip_eq(coords, self.basetile_shape.iter())
            .map(|(&coord, &tile)| coord * tile)
            .collect();
        let strides: Vec<usize> = self
            .shape
            .iter()
            .scan(1, |stride, &extent| {
                let current = *stride;
                *stride *= extent;
                Some(current)
            })
            .collect();
        let count = tile_shape.volume();
        (0..count).map(move |mut index| {
            let mut offset = 0;
            for ((&extent, &start), &stride) in tile_shape.iter().zip(&origin).zip(&strides) {
                offset += (start + index % extent) * stride;
                index /= extent;
            }
            offset
        })
    }

    /// Every tile owned by node 0.
    #[inline]
    pub fn root_distribution(&self) -> Vec<usize> {
        vec![0; self.grid_volume()]
    }

    /// Block-cyclic placement of tiles over a grid of nodes.
    ///
    /// Node ranks are laid out column-major over `mpi_grid`, shifted by `start_rank` and wrapped
    /// at `max_rank`.
    pub fn block_cyclic(
        &self,
        mpi_grid: &[usize],
        start_rank: usize,
        max_rank: usize,
    ) -> Result<Vec<usize>, TensorError> {
        if mpi_grid.len() != self.ndim() || mpi_grid.contains(&0) || max_rank == 0 {
            return Err(TensorError::ShapeMismatch(
                self.grid.clone(),
                Shape::from(mpi_grid),
            ));
        }
        let distribution = (0..self.grid_volume())
            .map(|index| {
                let coords = self.tile_index(index);
                let rank = coords
                    .iter()
                    .zip(mpi_grid)
                    .rev()
                    .fold(0, |rank, (&coord, &extent)| rank * extent + coord % extent);
                (rank + start_rank) % max_rank
            })
            .collect();
        Ok(distribution)
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::{Shape, TensorTraits};
    use crate::loom::tensor::TensorError;

    #[test]
    fn test_grid() -> Result<(), TensorError> {
        fastrand::seed(42);
        for _ in 0..64 {
            let ndim = fastrand::usize(0..=4);
            let shape = (0..ndim).map(|_| fastrand::usize(1..=17)).collect_vec();
            let tile = shape.iter().map(|&x| fastrand::usize(1..=x)).collect_vec();
            let traits = TensorTraits::new(shape.clone(), tile.clone())?;
            for (axis, &extent) in traits.grid().iter().enumerate() {
                assert_eq!(extent, shape[axis].div_ceil(tile[axis]));
            }
        }

        let traits = TensorTraits::new([5, 7], [2, 3])?;
        assert_eq!(traits.to_string(), "[5, 7] / [2, 3]");
        Ok(())
    }

    #[test]
    fn test_invalid() {
        assert!(matches!(
            TensorTraits::new([4, 3], [4]),
            Err(TensorError::ShapeMismatch(..))
        ));
        assert!(matches!(
            TensorTraits::new([4, 0], [4, 1]),
            Err(TensorError::ShapeMismatch(..))
        ));
        assert!(matches!(
            TensorTraits::new([4, 3], [0, 3]),
            Err(TensorError::ShapeMismatch(..))
        ));
    }

    #[test]
    fn test_tile_index() -> Result<(), TensorError> {
        let traits = TensorTraits::new([5, 7, 3], [2, 3, 3])?;
        assert_eq!(traits.grid(), &Shape::from([3, 3, 1]));
        for index in 0..traits.grid_volume() {
            let coords = traits.tile_index(index);
            assert_eq!(traits.tile_offset(&coords), index);
        }
        assert_eq!(traits.tile_index(1), vec![1, 0, 0]);
        assert_eq!(traits.tile_index(3), vec![0, 1, 0]);
        assert_eq!(traits.tile_shape(&[2, 2, 0]), Shape::from([1, 1, 3]));
        Ok(())
    }

    #[test]
    fn test_tile_elements() -> Result<(), TensorError> {
        let traits = TensorTraits::new([5, 7], [2, 3])?;
        let mut seen = vec![0; traits.volume()];
        for index in 0..traits.grid_volume() {
            let coords = traits.tile_index(index);
            let offsets = traits.tile_elements(&coords).collect_vec();
            assert_eq!(offsets.len(), traits.tile_shape(&coords).volume());
            offsets.into_iter().for_each(|offset| seen[offset] += 1);
        }
        assert!(seen.into_iter().all(|count| count == 1));

        // second tile along the first axis starts at row 2
        let offsets = traits.tile_elements(&[1, 0]).collect_vec();
        assert_eq!(offsets, vec![2, 3, 7, 8, 12, 13]);
        Ok(())
    }

    #[test]
    fn test_block_cyclic() -> Result<(), TensorError> {
        let traits = TensorTraits::new([8, 8], [2, 2])?;
        let distribution = traits.block_cyclic(&[2, 2], 0, 4)?;
        assert_eq!(distribution.len(), traits.grid_volume());
        assert_eq!(&distribution[..4], &[0, 1, 0, 1]);
        assert_eq!(&distribution[4..8], &[2, 3, 2, 3]);
        assert!(traits.root_distribution().into_iter().all(|rank| rank == 0));
        Ok(())
    }
}
