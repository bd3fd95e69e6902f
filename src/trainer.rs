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

//! Epoch loop: shuffle and split, train, check for divergence, snapshot,
//! update, validate, report. The last snapshot is what survives a diverged
//! run.

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::cnn::{Network, ParameterSnapshot};
use crate::config::Config;
use crate::device::{Event, SharedDevice};
use crate::error::{Error, Result};
use crate::samples::{Sample, SampleStore};

/// Seeded generator, or one seeded from the OS when no seed is given.
pub fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Network initialised from `config.parameters_file`, or randomly.
pub fn initial_network(
    device: SharedDevice,
    config: Arc<Config>,
    rng: &mut impl Rng,
) -> Result<Network> {
    match &config.parameters_file {
        Some(path) => {
            info!("loading parameters from {}", path.display());
            let snapshot = ParameterSnapshot::load(path)?;
            Network::from_snapshot(device, config.clone(), &snapshot)
        }
        None => Network::new(device, config, rng),
    }
}

/// Number of validation samples out of `total`, rounded down.
pub fn validation_size(total: usize, percent: u32) -> usize {
    total * percent as usize / 100
}

/// Per-epoch split of sample indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub training: Vec<usize>,
    pub validation: Vec<usize>,
}

impl Partition {
    /// Shuffles `0..total` and takes the first `validation` indices as the
    /// validation set.
    pub fn shuffle(total: usize, validation: usize, rng: &mut impl Rng) -> Self {
        let mut indices: Vec<usize> = (0..total).collect();
        indices.shuffle(rng);
        let training = indices.split_off(validation.min(total));
        Self {
            training,
            validation: indices,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    pub training_error: f64,
    /// Mean squared error per output pixel on the training set.
    pub training_error_per_pixel: f64,
    pub weight_decay: f64,
    /// `None` when the validation set is empty.
    pub validation_error_per_pixel: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub epochs_completed: usize,
    pub diverged: bool,
    pub reports: Vec<EpochReport>,
    /// Parameters the run ended with: the last snapshot when diverged.
    pub parameters: ParameterSnapshot,
}

#[derive(Debug, Clone, Default)]
pub struct TrainOptions {
    pub epochs: usize,
    /// Skip every file write.
    pub dry: bool,
    /// Where the final parameters go.
    pub output: Option<PathBuf>,
}

enum BatchResult {
    Finished { error: f64, pixels: usize, event: Event },
    Diverged { error: f64, pixels: usize, sample: String },
}

pub struct Trainer<'a> {
    network: &'a mut Network,
    samples: &'a SampleStore,
    config: Arc<Config>,
    rng: StdRng,
    last_snapshot: Option<ParameterSnapshot>,
}

impl<'a> Trainer<'a> {
    pub fn new(
        network: &'a mut Network,
        samples: &'a SampleStore,
        config: Arc<Config>,
        rng: StdRng,
    ) -> Self {
        Self {
            network,
            samples,
            config,
            rng,
            last_snapshot: None,
        }
    }

    /// Last parameters known to be finite: the latest checkpoint while
    /// training, the persisted result once `run` returns.
    pub fn last_snapshot(&self) -> Option<&ParameterSnapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn run(&mut self, options: &TrainOptions) -> Result<TrainingOutcome> {
        self.config.validate()?;
        self.network.snapshot()?.check_finite()?;
        let total = self.samples.len();
        let validation = validation_size(total, self.config.validation_percent);
        if total == validation {
            return Err(Error::InsufficientData(format!(
                "no training samples left out of {}",
                total
            )));
        }
        if validation == 0 {
            warn!("validation set is empty");
        } else {
            info!(
                "validation set: {}/{} samples ({:.1}%)",
                validation,
                total,
                validation as f64 * 100.0 / total as f64
            );
        }

        let decay = self.config.weight_decay;
        let mut reports = Vec::with_capacity(options.epochs);
        let mut diverged = false;
        for epoch in 0..options.epochs {
            let partition = Partition::shuffle(total, validation, &mut self.rng);

            let (error, pixels, trained) = match self.run_batch(&partition.training, true)? {
                BatchResult::Finished {
                    error,
                    pixels,
                    event,
                } => (error, pixels, event),
                BatchResult::Diverged { error, sample, .. } => {
                    warn!(
                        "[{}] squared error became {} on sample '{}', stopping",
                        epoch, error, sample
                    );
                    diverged = true;
                    break;
                }
            };

            if epoch % self.config.checkpoint_every == 0 && !self.checkpoint(epoch, options.dry)? {
                warn!("[{}] parameters are no longer finite, stopping", epoch);
                diverged = true;
                break;
            }

            // weights are constant across the batch, so the penalty is per epoch
            let weight_decay = self.network.weight_decay(decay, &[trained])?;
            let updated = self
                .network
                .update_parameters(partition.training.len(), &[trained])?;
            self.network.device().wait(&[updated])?;

            let validation_error = if partition.validation.is_empty() {
                None
            } else {
                match self.run_batch(&partition.validation, false)? {
                    BatchResult::Finished { error, pixels, .. } => Some(error / pixels as f64),
                    BatchResult::Diverged {
                        error,
                        pixels,
                        sample,
                    } => {
                        warn!(
                            "[{}] validation error became {} on sample '{}'",
                            epoch, error, sample
                        );
                        Some(error / pixels.max(1) as f64)
                    }
                }
            };

            let report = EpochReport {
                epoch,
                training_error: error,
                training_error_per_pixel: error / pixels as f64,
                weight_decay,
                validation_error_per_pixel: validation_error,
            };
            match report.validation_error_per_pixel {
                Some(v) => info!(
                    "[{}] training error {:.6e} per px, weight decay {:.6e}, validation error {:.6e} per px",
                    epoch, report.training_error_per_pixel, report.weight_decay, v
                ),
                None => info!(
                    "[{}] training error {:.6e} per px, weight decay {:.6e}",
                    epoch, report.training_error_per_pixel, report.weight_decay
                ),
            }
            reports.push(report);
        }

        let parameters = if diverged {
            self.rollback()?
        } else {
            let current = self.network.snapshot()?;
            if current.check_finite().is_ok() {
                current
            } else {
                warn!("last update left non-finite parameters, rolling back");
                diverged = true;
                self.rollback()?
            }
        };
        if let (Some(path), false) = (&options.output, options.dry) {
            parameters.save(path)?;
            info!("parameters written to {}", path.display());
        }
        self.last_snapshot = Some(parameters.clone());

        Ok(TrainingOutcome {
            epochs_completed: reports.len(),
            diverged,
            reports,
            parameters,
        })
    }

    /// Takes a snapshot and, when every value is finite, keeps it as the
    /// rollback point and writes it out. Returns `false` otherwise.
    fn checkpoint(&mut self, epoch: usize, dry: bool) -> Result<bool> {
        let snapshot = self.network.snapshot()?;
        if snapshot.check_finite().is_err() {
            return Ok(false);
        }
        if !dry {
            snapshot.save(&self.config.checkpoint_path)?;
            debug!(
                "[{}] checkpoint written to {}",
                epoch,
                self.config.checkpoint_path.display()
            );
        }
        self.last_snapshot = Some(snapshot);
        Ok(true)
    }

    /// Puts the last checkpoint back. Without one no update has run yet, so
    /// the network still holds its starting parameters.
    fn rollback(&mut self) -> Result<ParameterSnapshot> {
        match self.last_snapshot.take() {
            Some(snapshot) => {
                let restored = self.network.restore(&snapshot)?;
                self.network.device().wait(&[restored])?;
                Ok(snapshot)
            }
            None => {
                let current = self.network.snapshot()?;
                current.check_finite()?;
                Ok(current)
            }
        }
    }

    /// Runs `indices` one sample at a time. With `train` set, gradients of
    /// every sample are accumulated.
    fn run_batch(&mut self, indices: &[usize], train: bool) -> Result<BatchResult> {
        let device = self.network.device().clone();
        let decay = self.config.weight_decay;
        let mut error = 0.0f64;
        let mut pixels = 0usize;
        let mut last: Vec<Event> = Vec::new();

        for &index in indices {
            let sample: &Sample = self
                .samples
                .get(index)
                .ok_or_else(|| Error::InsufficientData(format!("no sample #{}", index)))?;
            let (w, h) = (sample.width, sample.height);
            let forward = self.network.forward(sample.input, w, h, &last)?;
            let (out_w, out_h) = self
                .network
                .output_dims()
                .ok_or_else(|| crate::error::shape("forward pass produced no output"))?;

            error += self.network.squared_error(
                sample.expected,
                self.network.output(),
                out_w,
                out_h,
                &[forward],
            )?;
            pixels += sample.output_pixels(&self.config);
            if !error.is_finite() {
                return Ok(BatchResult::Diverged {
                    error,
                    pixels,
                    sample: sample.name.clone(),
                });
            }

            let done = if train {
                self.network
                    .backpropagate(sample.input, sample.expected, w, h, decay, &[forward])?
            } else {
                forward
            };
            device.wait(&[done])?;
            last = vec![done];
        }

        let event = device.join(&last)?;
        Ok(BatchResult::Finished {
            error,
            pixels,
            event,
        })
    }
}
