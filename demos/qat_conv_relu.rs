use qat_fuse::activation::Rectifier;
use qat_fuse::nn::{Conv2d, Conv2dOptions, Module};
use qat_fuse::quantization::{FakeQuantControl, QATManager};
use qat_fuse::{ConvReLU2d, QConfig, Tape, Tensor};
use std::env;
use tracing_subscriber::EnvFilter;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

struct Args {
    per_channel: bool,
    relu6: bool,
    epochs: usize,
}

fn parse_args() -> Args {
    let mut args = Args {
        per_channel: false,
        relu6: false,
        epochs: 12,
    };
    let mut it = env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--per-channel" => args.per_channel = true,
            "--relu6" => args.relu6 = true,
            "--epochs" => {
                if let Some(n) = it.next().and_then(|v| v.parse().ok()) {
                    args.epochs = n;
                }
            }
            other => eprintln!("ignoring unknown argument {other}"),
        }
    }
    args
}

fn main() -> qat_fuse::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = parse_args();
    let options = Conv2dOptions::new(3, 8, (3, 3)).with_padding((1, 1));
    let rectifier = if args.relu6 { Rectifier::ReLU6 } else { Rectifier::ReLU };

    // fixed float network the fused layer learns to imitate
    let mut reference = Conv2d::new(options.clone())?;
    reference.weight.requires_grad = false;
    if let Some(b) = reference.bias.as_mut() {
        b.requires_grad = false;
    }

    let qconfig = if args.per_channel { QConfig::per_channel() } else { QConfig::default() };
    let mut layer = ConvReLU2d::new(options, &qconfig)?.with_rectifier(rectifier);
    let mut manager = QATManager::new(2, 2).with_observer_freeze(args.epochs.saturating_sub(2));

    println!("Fused Conv2d + {:?} QAT", rectifier);
    println!("weight quantization: {:?}", qconfig.weight.granularity);
    println!();

    let lr = 0.05;
    let steps_per_epoch = 25;

    for epoch in 0..args.epochs {
        let phase = manager.step(epoch, &mut [&mut layer as &mut dyn FakeQuantControl]);
        let mut epoch_loss = 0.0;

        for _ in 0..steps_per_epoch {
            Tape::reset(); // clear tape for new forward/backward pass

            let x = Tensor::randn(&[4, 3, 8, 8]);
            let target = rectifier.apply(&reference.forward(&x)?);
            let yhat = layer.forward(&x)?;

            let diff = &yhat - &target;
            let loss = (&diff * &diff).mean();
            loss.backward();
            epoch_loss += loss.data()[0];

            for p in layer.parameters() {
                if let Some(g) = p.grad_ref() {
                    let mut d = p.data_mut();
                    for (w, g) in d.iter_mut().zip(g.iter()) {
                        *w -= lr * g;
                    }
                }
                p.zero_grad();
            }
        }

        println!(
            "epoch {:3} [{:?}]: loss = {:.5}",
            epoch,
            phase,
            epoch_loss / steps_per_epoch as f32
        );
    }

    let act = layer.activation_fake_quant();
    println!();
    println!(
        "activation: range [{:.4}, {:.4}], scale {:?}, zero_point {:?}",
        act.running_min(),
        act.running_max(),
        act.scale(),
        act.zero_point()
    );
    println!("weight params: {} set(s)", layer.weight_fake_quant().params().len());
    Ok(())
}
