use super::{
    device::Device,
    num::Scalar,
    tag::NextTag,
    tensor::{Tensor, TensorError},
};

/// A tensor paired with its gradient, the unit passed between layers.
#[derive(Debug, Clone)]
pub struct TensorMoments<D: Device, T: Scalar> {
    pub value: Tensor<D, T>,
    /// Present exactly when `grad_required` is set.
    pub grad: Option<Tensor<D, T>>,
    pub grad_required: bool,
}

impl<D: Device, T: Scalar> TensorMoments<D, T> {
    /// Fails with [`TensorError::InvalidGradConfig`] if gradient presence and `grad_required`
    /// disagree, and with a shape or placement error if the gradient is not aligned with the value.
    pub fn new(
        value: Tensor<D, T>,
        grad: Option<Tensor<D, T>>,
        grad_required: bool,
    ) -> Result<Self, TensorError> {
        match (&grad, grad_required) {
            (Some(grad), true) => value.check_aligned(grad)?,
            (None, false) => {}
            _ => return Err(TensorError::InvalidGradConfig),
        }
        Ok(Self {
            value,
            grad,
            grad_required,
        })
    }

    /// Moments without gradient tracking.
    #[inline]
    pub fn constant(value: Tensor<D, T>) -> Self {
        Self {
            value,
            grad: None,
            grad_required: false,
        }
    }

    /// Moments tracking a gradient.
    #[inline]
    pub fn tracked(value: Tensor<D, T>, grad: Tensor<D, T>) -> Result<Self, TensorError> {
        Self::new(value, Some(grad), true)
    }

    /// Creates tracked moments with the traits and placement of `tensor`, value first.
    pub fn tracked_like<S: Scalar>(
        tensor: &Tensor<D, S>,
        next_tag: NextTag,
    ) -> Result<(Self, NextTag), TensorError> {
        let (value, next_tag) = tensor.like(next_tag)?;
        let (grad, next_tag) = tensor.like(next_tag)?;
        Ok((Self::tracked(value, grad)?, next_tag))
    }

    /// The gradient, if it is tracked.
    #[inline]
    pub fn tracked_grad(&self) -> Option<&Tensor<D, T>> {
        self.grad.as_ref().filter(|_| self.grad_required)
    }

    /// Returns `true` if both moments hold the same value tensor.
    #[inline]
    pub fn same(&self, other: &Self) -> bool {
        self.value.same(&other.value)
    }

    /// Fails with [`TensorError::UseAfterRelease`] if the value or the gradient is released.
    pub fn check(&self) -> Result<(), TensorError> {
        self.value.check()?;
        match &self.grad {
            Some(grad) => grad.check(),
            None => Ok(()),
        }
    }

    /// Releases the value and the gradient.
    pub fn unregister(&self) -> Result<(), TensorError> {
        self.value.unregister()?;
        if let Some(grad) = &self.grad {
            grad.unregister()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::TensorMoments;
    use crate::loom::{
        device::CpuBuilder,
        layout::TensorTraits,
        tag::NextTag,
        tensor::{Tensor, TensorError},
    };

    #[tokio::test]
    async fn test_grad_config() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().build().await;
        let traits = TensorTraits::new([4, 3], [2, 3])?;
        let distribution = traits.root_distribution();

        let next = NextTag::default();
        let (value, next) = Tensor::<_, f32>::new(&cpu, traits.clone(), distribution.clone(), next)?;
        let (grad, next) = Tensor::<_, f32>::new(&cpu, traits, distribution, next)?;

        let moments = TensorMoments::new(value.clone(), Some(grad.clone()), true)?;
        assert!(moments.tracked_grad().is_some());

        let moments = TensorMoments::new(value.clone(), None, false)?;
        assert!(moments.tracked_grad().is_none());

        assert!(matches!(
            TensorMoments::new(value.clone(), None, true),
            Err(TensorError::InvalidGradConfig)
        ));
        assert!(matches!(
            TensorMoments::new(value.clone(), Some(grad), false),
            Err(TensorError::InvalidGradConfig)
        ));

        // the gradient must match the value
        let traits = TensorTraits::new([4, 3], [4, 3])?;
        let distribution = traits.root_distribution();
        let (other, next) = Tensor::<_, f32>::new(&cpu, traits, distribution, next)?;
        assert!(matches!(
            TensorMoments::new(value.clone(), Some(other), true),
            Err(TensorError::ShapeMismatch(..))
        ));

        let traits = TensorTraits::new([4, 3], [2, 3])?;
        let (other, _) = Tensor::<_, f32>::new(&cpu, traits, vec![0, 1], next)?;
        assert!(matches!(
            TensorMoments::new(value, Some(other), true),
            Err(TensorError::PlacementMismatch(..))
        ));
        Ok(())
    }
}
