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

use std::sync::Arc;

use log::{debug, warn};
use rand::Rng;

use super::layers::LayerAllocation;
use super::snapshot::ParameterSnapshot;
use super::types::LayerParameters;
use crate::config::Config;
use crate::device::{BufferId, Device, Event, Kernel, SharedDevice};
use crate::error::{shape, Result};

/// Scalar slots used by the reductions.
const SLOT_ERROR: usize = 0;
const SLOT_WEIGHTS: usize = 1;

/// The three-layer super-resolution network and its device buffers.
pub struct Network {
    device: SharedDevice,
    config: Arc<Config>,
    layers: [LayerAllocation; 3],
    scalars: BufferId,
}

impl Network {
    /// Randomly initialised network.
    pub fn new(device: SharedDevice, config: Arc<Config>, rng: &mut impl Rng) -> Result<Self> {
        let [s1, s2, s3] = config.layer_specs();
        let layers = [
            LayerAllocation::allocate(device.as_ref(), s1, rng)?,
            LayerAllocation::allocate(device.as_ref(), s2, rng)?,
            LayerAllocation::allocate(device.as_ref(), s3, rng)?,
        ];
        let scalars = device.allocate(SLOT_WEIGHTS + 3)?;
        Ok(Self {
            device,
            config,
            layers,
            scalars,
        })
    }

    /// Network whose parameters come from `snapshot`.
    pub fn from_snapshot(
        device: SharedDevice,
        config: Arc<Config>,
        snapshot: &ParameterSnapshot,
    ) -> Result<Self> {
        let specs = config.layer_specs();
        snapshot.validate(&specs)?;
        let [p1, p2, p3] = &snapshot.layers;
        let [s1, s2, s3] = specs;
        let layers = [
            LayerAllocation::with_parameters(device.as_ref(), s1, p1)?,
            LayerAllocation::with_parameters(device.as_ref(), s2, p2)?,
            LayerAllocation::with_parameters(device.as_ref(), s3, p3)?,
        ];
        let scalars = device.allocate(SLOT_WEIGHTS + 3)?;
        Ok(Self {
            device,
            config,
            layers,
            scalars,
        })
    }

    pub fn device(&self) -> &SharedDevice {
        &self.device
    }

    pub fn layers(&self) -> &[LayerAllocation; 3] {
        &self.layers
    }

    /// Buffer holding the layer 3 result of the last forward pass.
    pub fn output(&self) -> BufferId {
        self.layers[2].output
    }

    /// Dimensions of the last forward pass result.
    pub fn output_dims(&self) -> Option<(usize, usize)> {
        self.layers[2]
            .shape
            .map(|s| (s.out_width(), s.out_height()))
    }

    /// Issues the three layer kernels for a `w x h` luma input. Each layer
    /// depends on the previous layer's event; nothing blocks the host apart
    /// from buffer re-fitting when the input size changes.
    pub fn forward(&mut self, input: BufferId, w: usize, h: usize, deps: &[Event]) -> Result<Event> {
        if self.config.output_size(w, h).is_none() {
            return Err(shape(&format!(
                "{}x{} input is smaller than the network's receptive field ({} px padding)",
                w,
                h,
                self.config.total_padding()
            )));
        }
        let device = self.device.as_ref();
        let mut event = device.join(deps)?;
        let (mut cur_input, mut cur_w, mut cur_h) = (input, w, h);
        for layer in self.layers.iter_mut() {
            let conv = layer.fit(device, cur_w, cur_h)?;
            event = device.launch(
                Kernel::LayerForward {
                    input: cur_input,
                    output: layer.output,
                    weights: layer.weights,
                    bias: layer.bias,
                    shape: conv,
                    activation: layer.spec.activation,
                },
                &[event],
            )?;
            cur_input = layer.output;
            cur_w = conv.out_width();
            cur_h = conv.out_height();
        }
        Ok(event)
    }

    /// `Σ (actual - predicted)²` over `w x h` values, read back to the host.
    /// Non-finite results are returned as-is for the caller to act on.
    pub fn squared_error(
        &self,
        actual: BufferId,
        predicted: BufferId,
        w: usize,
        h: usize,
        deps: &[Event],
    ) -> Result<f64> {
        let e = self.device.launch(
            Kernel::SumSquaredError {
                a: actual,
                b: predicted,
                count: w * h,
                out: self.scalars,
                slot: SLOT_ERROR,
            },
            deps,
        )?;
        let scalars = self.device.read(self.scalars, &[e])?;
        Ok(scalars[SLOT_ERROR] as f64)
    }

    /// `coefficient * Σ w²` over the weights of all three layers.
    pub fn weight_decay(&self, coefficient: f32, deps: &[Event]) -> Result<f64> {
        if coefficient == 0.0 {
            return Ok(0.0);
        }
        let mut events = Vec::with_capacity(3);
        for (i, layer) in self.layers.iter().enumerate() {
            events.push(self.device.launch(
                Kernel::SumOfSquares {
                    input: layer.weights,
                    count: layer.spec.weight_len(),
                    out: self.scalars,
                    slot: SLOT_WEIGHTS + i,
                },
                deps,
            )?);
        }
        let scalars = self.device.read(self.scalars, &events)?;
        let total: f64 = scalars[SLOT_WEIGHTS..SLOT_WEIGHTS + 3]
            .iter()
            .map(|v| *v as f64)
            .sum();
        Ok(coefficient as f64 * total)
    }

    /// Accumulates this sample's gradients into every layer's accumulators.
    ///
    /// Must follow a [`forward`](Self::forward) over the same `input`;
    /// `expected` holds the target luma cropped to the output size. Deltas
    /// are issued layer 3 → 1, each gradient accumulation after the delta
    /// it consumes. `weight_decay` adds `weight_decay * w` to every weight
    /// gradient. Returns an event covering all three accumulations.
    pub fn backpropagate(
        &mut self,
        input: BufferId,
        expected: BufferId,
        w: usize,
        h: usize,
        weight_decay: f32,
        deps: &[Event],
    ) -> Result<Event> {
        let [l1, l2, l3] = &self.layers;
        let (s1, s2, s3) = match (l1.shape, l2.shape, l3.shape) {
            (Some(s1), Some(s2), Some(s3)) if s1.in_width == w && s1.in_height == h => (s1, s2, s3),
            _ => {
                return Err(shape(&format!(
                    "backpropagation over {}x{} without a matching forward pass",
                    w, h
                )))
            }
        };
        let device = self.device.as_ref();

        let d3 = device.launch(
            Kernel::OutputDeltas {
                predicted: l3.output,
                expected,
                deltas: l3.deltas,
                count: s3.output_len(),
                scale: self.config.output_scale,
            },
            deps,
        )?;
        let g3 = accumulate(device, l3, l2.output, s3, weight_decay, d3)?;

        let d2 = device.launch(
            Kernel::BackpropDeltas {
                next_deltas: l3.deltas,
                next_weights: l3.weights,
                next: s3,
                output: l2.output,
                activation: l2.spec.activation,
                deltas: l2.deltas,
            },
            &[d3],
        )?;
        let g2 = accumulate(device, l2, l1.output, s2, weight_decay, d2)?;

        let d1 = device.launch(
            Kernel::BackpropDeltas {
                next_deltas: l2.deltas,
                next_weights: l2.weights,
                next: s2,
                output: l1.output,
                activation: l1.spec.activation,
                deltas: l1.deltas,
            },
            &[d2],
        )?;
        let g1 = accumulate(device, l1, input, s1, weight_decay, d1)?;

        device.join(&[g1, g2, g3])
    }

    /// `p -= learning_rate * g / batch_size` for every parameter, then zeroes
    /// the accumulators. Callers block on all of the batch's backpropagation
    /// before calling this.
    pub fn update_parameters(&mut self, batch_size: usize, deps: &[Event]) -> Result<Event> {
        if batch_size == 0 {
            return Err(crate::error::Error::InsufficientData(
                "parameter update over an empty batch".into(),
            ));
        }
        let rate = self.config.learning_rate;
        let mut events = Vec::with_capacity(6);
        for layer in &self.layers {
            let pairs = [
                (layer.weights, layer.grad_weights, layer.spec.weight_len()),
                (layer.bias, layer.grad_bias, layer.spec.filter_count),
            ];
            for (params, grads, count) in pairs {
                events.push(self.device.launch(
                    Kernel::ApplyGradients {
                        params,
                        grads,
                        count,
                        rate,
                        batch_size,
                    },
                    deps,
                )?);
            }
        }
        self.device.join(&events)
    }

    /// Blocking host copy of the whole network output after `deps`.
    pub fn read_output(&self, deps: &[Event]) -> Result<Vec<f32>> {
        let (w, h) = self
            .output_dims()
            .ok_or_else(|| shape("no forward pass has been run"))?;
        let mut out = self.device.read(self.output(), deps)?;
        out.truncate(w * h);
        Ok(out)
    }

    /// Copies every weight and bias to the host. Blocks until the queue is
    /// drained so the copy reflects all issued updates.
    pub fn snapshot(&self) -> Result<ParameterSnapshot> {
        self.device.synchronize()?;
        let [l1, l2, l3] = &self.layers;
        let device = self.device.as_ref();
        Ok(ParameterSnapshot {
            layers: [
                l1.read_parameters(device, &[])?,
                l2.read_parameters(device, &[])?,
                l3.read_parameters(device, &[])?,
            ],
        })
    }

    pub fn restore(&mut self, snapshot: &ParameterSnapshot) -> Result<Event> {
        snapshot.validate(&self.config.layer_specs())?;
        let device = self.device.as_ref();
        let mut events = Vec::with_capacity(3);
        for (layer, params) in self.layers.iter().zip(&snapshot.layers) {
            events.push(layer.write_parameters(device, params, &[])?);
        }
        debug!("restored parameters from snapshot");
        device.join(&events)
    }

    /// Current gradient accumulators, mostly useful for inspection.
    pub fn gradients(&self) -> Result<[LayerParameters; 3]> {
        self.device.synchronize()?;
        let device = self.device.as_ref();
        let read = |l: &LayerAllocation| -> Result<LayerParameters> {
            Ok(LayerParameters {
                weights: device.read(l.grad_weights, &[])?,
                bias: device.read(l.grad_bias, &[])?,
            })
        };
        let [l1, l2, l3] = &self.layers;
        Ok([read(l1)?, read(l2)?, read(l3)?])
    }
}

fn accumulate(
    device: &dyn Device,
    layer: &LayerAllocation,
    input: BufferId,
    shape: crate::device::ConvShape,
    decay: f32,
    dep: Event,
) -> Result<Event> {
    device.launch(
        Kernel::AccumulateGradients {
            deltas: layer.deltas,
            input,
            weights: layer.weights,
            grad_weights: layer.grad_weights,
            grad_bias: layer.grad_bias,
            shape,
            decay,
        },
        &[dep],
    )
}

impl Drop for Network {
    fn drop(&mut self) {
        let device = self.device.as_ref();
        for (i, layer) in self.layers.iter().enumerate() {
            if let Err(e) = layer.release(device) {
                warn!("failed to release buffers of layer {}: {}", i + 1, e);
            }
        }
        if let Err(e) = device.release(self.scalars) {
            warn!("failed to release network buffer {}: {}", self.scalars, e);
        }
    }
}
