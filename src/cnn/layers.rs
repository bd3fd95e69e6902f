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

use rand::Rng;

use super::types::{LayerParameters, LayerSpec};
use crate::device::{BufferId, ConvShape, Device, Event};
use crate::error::{shape, Result};

/// Device buffers owned by one layer. Gradient accumulators are only ever
/// written by backpropagation and cleared by the parameter update.
pub struct LayerAllocation {
    pub spec: LayerSpec,
    pub weights: BufferId,
    pub bias: BufferId,
    pub grad_weights: BufferId,
    pub grad_bias: BufferId,
    pub output: BufferId,
    pub deltas: BufferId,
    /// Geometry of the last input this layer was fitted to.
    pub shape: Option<ConvShape>,
}

impl LayerAllocation {
    pub fn allocate(device: &dyn Device, spec: LayerSpec, rng: &mut impl Rng) -> Result<Self> {
        let scale = spec.init_scale();
        let weights: Vec<f32> = (0..spec.weight_len())
            .map(|_| (rng.gen::<f32>() - 0.5) * scale)
            .collect();
        let params = LayerParameters {
            weights,
            bias: vec![0.0; spec.filter_count],
        };
        Self::with_parameters(device, spec, &params)
    }

    pub fn with_parameters(
        device: &dyn Device,
        spec: LayerSpec,
        params: &LayerParameters,
    ) -> Result<Self> {
        if !params.matches(&spec) {
            return Err(shape(&format!(
                "parameters ({} weights, {} biases) do not fit layer {:?}",
                params.weights.len(),
                params.bias.len(),
                spec
            )));
        }
        let (weights, _) = device.upload(&params.weights)?;
        let (bias, _) = device.upload(&params.bias)?;
        let grad_weights = device.allocate(spec.weight_len())?;
        let grad_bias = device.allocate(spec.filter_count)?;
        let output = device.allocate(0)?;
        let deltas = device.allocate(0)?;

        Ok(Self {
            spec,
            weights,
            bias,
            grad_weights,
            grad_bias,
            output,
            deltas,
            shape: None,
        })
    }

    /// Resizes the output and delta buffers for an input of `in_w x in_h`.
    /// Buffers are only reallocated when the size changes; the device
    /// finishes queued work on the old buffers before they are released.
    pub fn fit(&mut self, device: &dyn Device, in_w: usize, in_h: usize) -> Result<ConvShape> {
        let conv = self.spec.conv_shape(in_w, in_h);
        if !conv.is_valid() {
            return Err(shape(&format!(
                "{}x{} input is smaller than the {}x{} filter",
                in_w, in_h, self.spec.filter_size, self.spec.filter_size
            )));
        }
        let needed = conv.output_len();
        if device.buffer_len(self.output)? != needed {
            device.release(self.output)?;
            device.release(self.deltas)?;
            self.output = device.allocate(needed)?;
            self.deltas = device.allocate(needed)?;
        }
        self.shape = Some(conv);
        Ok(conv)
    }

    pub fn write_parameters(
        &self,
        device: &dyn Device,
        params: &LayerParameters,
        deps: &[Event],
    ) -> Result<Event> {
        if !params.matches(&self.spec) {
            return Err(shape("snapshot does not match the layer geometry"));
        }
        let w = device.write(self.weights, &params.weights, deps)?;
        let b = device.write(self.bias, &params.bias, deps)?;
        device.join(&[w, b])
    }

    /// Blocking copy of the current weights and biases.
    pub fn read_parameters(&self, device: &dyn Device, deps: &[Event]) -> Result<LayerParameters> {
        Ok(LayerParameters {
            weights: device.read(self.weights, deps)?,
            bias: device.read(self.bias, deps)?,
        })
    }

    pub fn buffers(&self) -> [BufferId; 6] {
        [
            self.weights,
            self.bias,
            self.grad_weights,
            self.grad_bias,
            self.output,
            self.deltas,
        ]
    }

    pub fn release(&self, device: &dyn Device) -> Result<()> {
        for id in self.buffers() {
            device.release(id)?;
        }
        Ok(())
    }
}
