/*
 * MIT License
 *
 * Copyright (c) 2025 Matthew Abbott
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;

use srcnn::cnn::{Network, ParameterSnapshot};
use srcnn::config::Config;
use srcnn::device::{self, SharedDevice};
use srcnn::preprocess;
use srcnn::samples::{discover_pairs, SampleStore};
use srcnn::trainer::{initial_network, make_rng, TrainOptions, Trainer};

#[derive(Parser)]
#[command(name = "srcnn")]
#[command(about = "Super-resolution CNN trainer with hand-written forward and backward passes", long_about = None)]
pub struct Cli {
    /// Run on the CUDA device (needs a build with `--features cuda`).
    #[arg(long, global = true)]
    pub cuda: bool,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train on the `_small`/`_large` image pairs of a directory
    Train {
        #[arg(long)]
        config: PathBuf,
        /// Samples directory
        #[arg(long = "in")]
        input: PathBuf,
        /// Where the trained parameters are written
        #[arg(long)]
        out: Option<PathBuf>,
        /// Overrides the configured epoch count
        #[arg(long)]
        epochs: Option<usize>,
        /// Do not write any file
        #[arg(long)]
        dry: bool,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Upscale a single image with trained parameters
    Forward {
        #[arg(long)]
        config: PathBuf,
        #[arg(long = "in")]
        input: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        dry: bool,
    },
    /// Show the network described by a config and, optionally, a parameter file
    Info {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        params: Option<PathBuf>,
    },
    #[command(name = "usage")]
    Usage,
}

pub fn print_help() {
    println!("Commands:");
    println!("  train    Train the network on a directory of sample pairs");
    println!("  forward  Run a trained network on one image");
    println!("  info     Display network geometry and parameter statistics");
    println!("  usage    Show this help message\n");
    println!("Train Options:");
    println!("  --config=FILE.json     Network and training configuration (required)");
    println!("  --in=DIR               Directory of NAME_small/NAME_large images (required)");
    println!("  --out=FILE.json        Save trained parameters (required unless --dry)");
    println!("  --epochs=N             Epoch count (default: from config)");
    println!("  --seed=N               Seed for initialisation and shuffling");
    println!("  --dry                  Do not write checkpoints or results\n");
    println!("Forward Options:");
    println!("  --config=FILE.json     Configuration with parameters_file set (required)");
    println!("  --in=IMAGE             Input image (required)");
    println!("  --out=IMAGE            Result image (required unless --dry)");
    println!("  --dry                  Do not write the result\n");
    println!("Global Options:");
    println!("  --cuda                 Use the CUDA device\n");
    println!("Examples:");
    println!("  srcnn train --config=cfg.json --in=samples --out=params.json --epochs=500");
    println!("  srcnn forward --config=cfg.json --in=photo_small.png --out=photo_srcnn.png");
    println!("  srcnn info --config=cfg.json --params=params.json");
}

fn require_output(out: Option<PathBuf>, dry: bool) -> anyhow::Result<Option<PathBuf>> {
    match (out, dry) {
        (_, true) => Ok(None),
        (Some(path), false) => Ok(Some(path)),
        (None, false) => bail!("--out is required unless --dry is given"),
    }
}

fn load_config(path: &Path) -> anyhow::Result<Arc<Config>> {
    let config = Config::load(path)
        .with_context(|| format!("cannot load config {}", path.display()))?;
    Ok(Arc::new(config))
}

fn open_device(cuda: bool) -> anyhow::Result<SharedDevice> {
    let device = device::open(cuda).context("cannot open compute device")?;
    info!("using {} device", device.name());
    Ok(device)
}

pub fn handle_train(
    cuda: bool,
    config: &Path,
    input: &Path,
    out: Option<PathBuf>,
    epochs: Option<usize>,
    dry: bool,
    seed: Option<u64>,
) -> anyhow::Result<()> {
    let output = require_output(out, dry)?;
    let config = load_config(config)?;
    let device = open_device(cuda)?;
    let mut rng = make_rng(seed.or(config.seed));

    let pairs = discover_pairs(input)
        .with_context(|| format!("cannot list samples in {}", input.display()))?;
    let samples = SampleStore::load(device.clone(), &config, &pairs)?;
    let mut network = initial_network(device, config.clone(), &mut rng)?;

    let options = TrainOptions {
        epochs: epochs.unwrap_or(config.epochs),
        dry,
        output,
    };
    info!(
        "training for {} epochs (lr {}, weight decay {}){}",
        options.epochs,
        config.learning_rate,
        config.weight_decay,
        if dry { ", dry run" } else { "" }
    );
    let outcome = Trainer::new(&mut network, &samples, config, rng).run(&options)?;
    if outcome.diverged {
        log::warn!(
            "training diverged after {} epochs, kept the last snapshot",
            outcome.epochs_completed
        );
    }
    info!("done");
    Ok(())
}

pub fn handle_forward(
    cuda: bool,
    config: &Path,
    input: &Path,
    out: Option<PathBuf>,
    dry: bool,
) -> anyhow::Result<()> {
    let output = require_output(out, dry)?;
    let config = load_config(config)?;
    let Some(params) = config.parameters_file.clone() else {
        bail!("forward mode needs parameters_file in the config");
    };
    let device = open_device(cuda)?;
    let snapshot = ParameterSnapshot::load(&params)
        .with_context(|| format!("cannot load parameters {}", params.display()))?;
    let mut network = Network::from_snapshot(device.clone(), config.clone(), &snapshot)?;

    let image = run_forward(&device, &mut network, input)?;
    match output {
        Some(path) => {
            preprocess::save_result(&image, &path)?;
            info!("result written to {}", path.display());
        }
        None => info!("dry run, result of {}x{} not written", image.width(), image.height()),
    }
    Ok(())
}

/// Forward pass over one image file, returning the composed result image.
pub fn run_forward(
    device: &SharedDevice,
    network: &mut Network,
    input: &Path,
) -> anyhow::Result<image::RgbImage> {
    let prepared = preprocess::prepare(device.as_ref(), input)
        .with_context(|| format!("cannot prepare {}", input.display()))?;
    let (w, h) = (prepared.image.width, prepared.image.height);
    let centred = preprocess::subtract_mean(device.as_ref(), prepared.luma, w * h, &[prepared.event])?;
    device.release(prepared.pixels)?;

    let forward = network.forward(prepared.luma, w, h, &[centred]);
    let luma = forward.and_then(|e| network.read_output(&[e]));
    device.release(prepared.luma)?;
    let luma = luma?;

    let (out_w, out_h) = network
        .output_dims()
        .context("forward pass produced no output")?;
    Ok(preprocess::compose_result(&prepared.image, &luma, out_w, out_h)?)
}

pub fn print_info(config: &Path, params: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    println!("\n=================================================================");
    println!("  Network Information");
    println!("=================================================================\n");
    for (i, spec) in config.layer_specs().iter().enumerate() {
        println!(
            "Layer {}: {} filters of {}x{}x{}, {:?}",
            i + 1,
            spec.filter_count,
            spec.filter_size,
            spec.filter_size,
            spec.input_channels,
            spec.activation
        );
    }
    println!("Total padding: {} px\n", config.total_padding());
    println!("Training Parameters:");
    println!("Learning rate: {}", config.learning_rate);
    println!("Weight decay: {}", config.weight_decay);
    println!("Validation: {}%", config.validation_percent);
    println!("Checkpoint every: {} epochs\n", config.checkpoint_every);

    if let Some(path) = params.or(config.parameters_file.as_deref()) {
        let snapshot = ParameterSnapshot::load(path)
            .with_context(|| format!("cannot load parameters {}", path.display()))?;
        snapshot.validate(&config.layer_specs())?;
        println!("Parameters: {}", path.display());
        for (i, layer) in snapshot.layers.iter().enumerate() {
            let n = layer.weights.len() as f64;
            let mean = layer.weights.iter().map(|&w| w as f64).sum::<f64>() / n;
            let norm = layer.weights.iter().map(|&w| (w as f64).powi(2)).sum::<f64>().sqrt();
            println!(
                "  layer {}: {} weights (mean {:.4e}, L2 {:.4e}), {} biases",
                i + 1,
                layer.weights.len(),
                mean,
                norm,
                layer.bias.len()
            );
        }
    }
    Ok(())
}
