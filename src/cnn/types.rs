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

use serde::{Deserialize, Serialize};

use crate::device::{Activation, ConvShape};

/// Static description of one convolutional stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerSpec {
    pub filter_size: usize,
    pub input_channels: usize,
    pub filter_count: usize,
    pub activation: Activation,
}

impl LayerSpec {
    pub fn hidden(filter_size: usize, input_channels: usize, filter_count: usize) -> Self {
        Self {
            filter_size,
            input_channels,
            filter_count,
            activation: Activation::Relu,
        }
    }

    /// Single-filter output stage with a fixed scaling multiplier.
    pub fn output(filter_size: usize, input_channels: usize, scale: f32) -> Self {
        Self {
            filter_size,
            input_channels,
            filter_count: 1,
            activation: Activation::Scaled(scale),
        }
    }

    pub fn weight_len(&self) -> usize {
        self.filter_size * self.filter_size * self.input_channels * self.filter_count
    }

    pub fn conv_shape(&self, in_width: usize, in_height: usize) -> ConvShape {
        ConvShape {
            filter_size: self.filter_size,
            in_channels: self.input_channels,
            out_channels: self.filter_count,
            in_width,
            in_height,
        }
    }

    /// Uniform `(-0.5, 0.5) * sqrt(2 / fan_in)` initialisation scale.
    pub fn init_scale(&self) -> f32 {
        let fan_in = self.input_channels * self.filter_size * self.filter_size;
        (2.0 / fan_in as f32).sqrt()
    }
}

/// Weights and biases of one layer as stored on the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerParameters {
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

impl LayerParameters {
    pub fn zeros(spec: &LayerSpec) -> Self {
        Self {
            weights: vec![0.0; spec.weight_len()],
            bias: vec![0.0; spec.filter_count],
        }
    }

    pub fn matches(&self, spec: &LayerSpec) -> bool {
        self.weights.len() == spec.weight_len() && self.bias.len() == spec.filter_count
    }
}
