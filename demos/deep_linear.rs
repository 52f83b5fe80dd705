use std::error::Error;

use itertools::Itertools;
use tessel::{
    loom::{
        device::{CpuBuilder, Device},
        layout::TensorTraits,
        moments::TensorMoments,
        tag::NextTag,
        tensor::Tensor,
    },
    nn::{Model, Side},
};

const STEPS: usize = 20;
const LEARNING_RATE: f32 = 0.05;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    #[cfg(feature = "trace")]
    {
        use tracing_subscriber::fmt::format::FmtSpan;
        tracing_subscriber::fmt()
            .with_span_events(FmtSpan::CLOSE)
            .init();
    }

    let cpu = CpuBuilder::new().add_default_ops().build().await;
    fastrand::seed(42);

    let traits = TensorTraits::new([64, 32], [32, 16])?;
    let distribution = traits.root_distribution();
    let (x, next) = Tensor::<_, f32>::new(&cpu, traits, distribution, NextTag::default())?;
    let x = TensorMoments::constant(x);
    let (model, next) = Model::deep_linear(x.clone(), Side::Left, 1, 48, 16, 4, next)?;
    println!("{} layers, {} tags", model.layers().len(), next);

    // learn to reproduce the input
    let data = (0..64 * 32).map(|_| fastrand::f32() - 0.5).collect_vec();
    model.init_randn_async(7)?;
    for step in 0..STEPS {
        x.value.from_slice(&data)?;
        model.clear_gradients()?;
        model.forward()?;

        let output = model.output().value.to_vec().await?;
        let diff = itertools::zip_eq(&output, &data).map(|(y, x)| y - x).collect_vec();
        let loss = diff.iter().map(|x| x * x).sum::<f32>() / diff.len() as f32;
        println!("step {step}: loss {loss:.6}");

        if let Some(dy) = &model.output().grad {
            let scale = 2.0 / diff.len() as f32;
            let dy_data = diff.iter().map(|x| x * scale).collect_vec();
            dy.from_slice(&dy_data)?;
        }
        model.backward()?;

        for moments in model.parameters() {
            let Some(grad) = moments.tracked_grad() else {
                continue;
            };
            let w = moments.value.to_vec().await?;
            let g = grad.to_vec().await?;
            let w = itertools::zip_eq(w, g)
                .map(|(w, g)| w - LEARNING_RATE * g)
                .collect_vec();
            moments.value.from_slice(&w)?;
        }
    }

    cpu.wait_all().await?;
    println!("{:?}", cpu.stats());

    model.unregister()?;
    x.unregister()?;
    cpu.wait_all().await?;
    Ok(())
}
