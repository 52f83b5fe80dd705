use std::str::FromStr;

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::model::Layer;
use crate::{
    hal::{
        frontend::{copy_async, prod_async, unary_async},
        ops::Unary,
    },
    loom::{
        device::Device, moments::TensorMoments, num::Float, tag::NextTag, tensor::TensorError,
    },
};

/// Registered elementwise nonlinearities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Activation {
    #[display("relu")]
    Relu,
    #[display("gelu")]
    Gelu,
    #[display("gelutanh")]
    GeluTanh,
    #[display("silu")]
    Silu,
    #[display("identity")]
    Identity,
}

impl Activation {
    /// The function and its derivative.
    pub fn pair(self) -> (Unary, Unary) {
        match self {
            Activation::Relu => (Unary::Relu, Unary::DRelu),
            Activation::Gelu => (Unary::Gelu, Unary::DGelu),
            Activation::GeluTanh => (Unary::GeluTanh, Unary::DGeluTanh),
            Activation::Silu => (Unary::Silu, Unary::DSilu),
            Activation::Identity => (Unary::Identity, Unary::DIdentity),
        }
    }
}

impl FromStr for Activation {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relu" => Ok(Activation::Relu),
            "gelu" => Ok(Activation::Gelu),
            "gelutanh" => Ok(Activation::GeluTanh),
            "silu" => Ok(Activation::Silu),
            "identity" => Ok(Activation::Identity),
            _ => Err(TensorError::UnknownActivation(s.to_owned())),
        }
    }
}

/// Applies an [`Activation`] elementwise.
///
/// The forward pass keeps a copy of the input in the input gradient, where the backward pass
/// evaluates the derivative and scales it by the output gradient.
#[derive(Debug)]
pub struct ActivationLayer<D: Device, T: Float> {
    func: Activation,
    x: TensorMoments<D, T>,
    y: TensorMoments<D, T>,
}

impl<D: Device, T: Float> ActivationLayer<D, T> {
    /// Creates the output moments, value then gradient, shaped and placed like the input.
    pub fn generate(
        x: TensorMoments<D, T>,
        name: &str,
        next_tag: NextTag,
    ) -> Result<(Self, NextTag), TensorError> {
        let func = name.parse()?;
        x.check()?;
        let (y, next_tag) = TensorMoments::tracked_like(&x.value, next_tag)?;
        log::debug!("activation {func}: {}", x.value.traits());
        Ok((Self { func, x, y }, next_tag))
    }

    #[inline]
    pub fn func(&self) -> Activation {
        self.func
    }
}

impl<D: Device, T: Float> Layer<D, T> for ActivationLayer<D, T> {
    #[inline]
    fn input(&self) -> &TensorMoments<D, T> {
        &self.x
    }

    #[inline]
    fn output(&self) -> &TensorMoments<D, T> {
        &self.y
    }

    fn parameters(&self) -> Vec<&TensorMoments<D, T>> {
        vec![]
    }

    #[cfg_attr(feature = "trace", tracing::instrument(name = "activation_forward", skip_all))]
    fn forward_async(&self) -> Result<(), TensorError> {
        self.x.check()?;
        self.y.check()?;
        let (f, _) = self.func.pair();
        copy_async(&self.x.value, &self.y.value)?;
        unary_async(f, &self.y.value)?;

        // the input lives on in its gradient until backward
        if let Some(dx) = &self.x.grad {
            copy_async(&self.x.value, dx)?;
            self.x.value.invalidate_submit()?;
            dx.wont_use()?;
        }
        Ok(())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(name = "activation_backward", skip_all))]
    fn backward_async(&self) -> Result<(), TensorError> {
        self.x.check()?;
        self.y.check()?;
        let dy = self.y.grad.as_ref().ok_or(TensorError::InvalidGradConfig)?;
        if let Some(dx) = self.x.tracked_grad() {
            let (_, df) = self.func.pair();
            unary_async(df, dx)?;
            prod_async(dy, dx)?;
        }
        dy.invalidate_submit()
    }

    /// Releases the output. The input belongs to the caller.
    fn unregister(&self) -> Result<(), TensorError> {
        self.y.unregister()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{Activation, ActivationLayer};
    use crate::{
        loom::{
            device::{Cpu, CpuBuilder, Device},
            layout::TensorTraits,
            moments::TensorMoments,
            tag::NextTag,
            tensor::{Tensor, TensorError},
        },
        nn::model::Layer,
    };

    fn input(
        cpu: &Cpu,
        grad: bool,
        next: NextTag,
    ) -> Result<(TensorMoments<Cpu, f32>, NextTag), TensorError> {
        let traits = TensorTraits::new([5, 4], [2, 3])?;
        let distribution = traits.root_distribution();
        let (value, next) = Tensor::new(cpu, traits, distribution, next)?;
        match grad {
            true => {
                let (grad, next) = value.like(next)?;
                Ok((TensorMoments::tracked(value, grad)?, next))
            }
            false => Ok((TensorMoments::constant(value), next)),
        }
    }

    #[test]
    fn test_registry() {
        for func in [
            Activation::Relu,
            Activation::Gelu,
            Activation::GeluTanh,
            Activation::Silu,
            Activation::Identity,
        ] {
            assert_eq!(func.to_string().parse::<Activation>().ok(), Some(func));
        }
        assert!(matches!(
            "tanh".parse::<Activation>(),
            Err(TensorError::UnknownActivation(name)) if name == "tanh"
        ));
    }

    #[tokio::test]
    async fn test_identity() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().add_default_ops().build().await;
        fastrand::seed(42);

        let (x, next) = input(&cpu, true, NextTag::default())?;
        let (layer, _) = ActivationLayer::generate(x.clone(), "identity", next)?;
        assert_eq!(layer.func(), Activation::Identity);
        let y = layer.output().clone();
        assert_eq!(y.value.traits(), x.value.traits());

        let data = (0..20).map(|_| fastrand::f32() * 10.0 - 5.0).collect_vec();
        x.value.from_slice(&data)?;
        layer.forward_async()?;
        assert_eq!(y.value.to_vec().await?, data);

        let dy = y.grad.as_ref().ok_or(TensorError::InvalidGradConfig)?;
        dy.from_slice(&[1.0; 20])?;
        layer.backward_async()?;
        let dx = x.grad.as_ref().ok_or(TensorError::InvalidGradConfig)?;
        assert_eq!(dx.to_vec().await?, vec![1.0; 20]);
        Ok(())
    }

    #[tokio::test]
    async fn test_relu() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().add_default_ops().build().await;

        let (x, next) = input(&cpu, true, NextTag::default())?;
        let (layer, _) = ActivationLayer::generate(x.clone(), "relu", next)?;
        let y = layer.output().clone();

        let data = (0..20).map(|x| x as f32 - 9.5).collect_vec();
        let grad = (0..20).map(|x| x as f32 * 0.5).collect_vec();
        x.value.from_slice(&data)?;
        layer.forward_async()?;
        let output = y.value.to_vec().await?;
        assert_eq!(output, data.iter().map(|x| x.max(0.0)).collect_vec());

        let dy = y.grad.as_ref().ok_or(TensorError::InvalidGradConfig)?;
        dy.from_slice(&grad)?;
        layer.backward_async()?;
        let dx = x.grad.as_ref().ok_or(TensorError::InvalidGradConfig)?;
        let r#ref = itertools::zip_eq(&data, &grad)
            .map(|(&x, &g)| if x > 0.0 { g } else { 0.0 })
            .collect_vec();
        assert_eq!(dx.to_vec().await?, r#ref);

        // the output gradient is consumed
        cpu.wait_all().await?;
        assert_eq!(dy.to_vec().await?, vec![0.0; 20]);
        Ok(())
    }

    #[tokio::test]
    async fn test_constant_input() -> Result<(), Box<dyn Error>> {
        let cpu = CpuBuilder::new().add_default_ops().build().await;

        let (x, next) = input(&cpu, false, NextTag::default())?;
        let (layer, next) = ActivationLayer::generate(x.clone(), "silu", next)?;
        assert_eq!(next, NextTag::new(6 * 3));

        let data = (0..20).map(|x| x as f32).collect_vec();
        x.value.from_slice(&data)?;
        layer.forward_async()?;
        // the input is kept when there is no gradient to save it in
        assert_eq!(x.value.to_vec().await?, data);

        let submitted = cpu.stats().submitted;
        layer.backward_async()?;
        // nothing to randomize either
        layer.init_randn_async(3)?;
        assert_eq!(cpu.stats().submitted, submitted);

        assert!(matches!(
            ActivationLayer::generate(x, "swish", next),
            Err(TensorError::UnknownActivation(_))
        ));
        cpu.wait_all().await?;
        assert_eq!(cpu.stats().tiles, 6 * 3);
        Ok(())
    }
}
