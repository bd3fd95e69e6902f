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

//! Compute device abstraction.
//!
//! Buffers are addressed by arena-indexed [`BufferId`]s and every asynchronous
//! operation returns an [`Event`] that later operations list as dependencies.
//! The host only blocks in [`Device::read`], [`Device::wait`] and
//! [`Device::synchronize`].

mod arena;
mod cpu;
pub mod host;
#[cfg(feature = "cuda")]
mod cuda;
#[cfg(feature = "cuda")]
mod kernels;

use std::fmt;
use std::sync::Arc;

use crate::error::Result;

pub use arena::Arena;
pub use cpu::CpuDevice;
#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;

/// Opaque handle to a device buffer. Stale handles are rejected by the
/// owning arena instead of aliasing a newer allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Completion token of a queued device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Event(pub(crate) u64);

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Relu,
    /// Linear response multiplied by a fixed factor.
    Scaled(f32),
}

impl Activation {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            // NaN passes through so a poisoned layer shows up in the loss
            Activation::Relu => {
                if x > 0.0 || x.is_nan() {
                    x
                } else {
                    0.0
                }
            }
            Activation::Scaled(s) => s * x,
        }
    }

    /// Derivative expressed in terms of the activated output.
    pub fn derivative(self, y: f32) -> f32 {
        match self {
            Activation::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Scaled(s) => s,
        }
    }
}

/// Geometry of one valid (unpadded, stride 1) convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvShape {
    pub filter_size: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub in_width: usize,
    pub in_height: usize,
}

impl ConvShape {
    pub fn out_width(&self) -> usize {
        self.in_width + 1 - self.filter_size
    }

    pub fn out_height(&self) -> usize {
        self.in_height + 1 - self.filter_size
    }

    pub fn input_len(&self) -> usize {
        self.in_channels * self.in_width * self.in_height
    }

    pub fn output_len(&self) -> usize {
        self.out_channels * self.out_width() * self.out_height()
    }

    pub fn weight_len(&self) -> usize {
        self.out_channels * self.in_channels * self.filter_size * self.filter_size
    }

    pub fn is_valid(&self) -> bool {
        self.filter_size > 0
            && self.in_channels > 0
            && self.out_channels > 0
            && self.in_width >= self.filter_size
            && self.in_height >= self.filter_size
    }
}

/// The numeric kernels the pipeline launches. Feature maps are planar
/// (`[channel][y][x]`), weights are `[out][in][fy][fx]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    /// Interleaved 8-bit pixels (stored as floats) to luma in `[0, 1]`.
    ExtractLuma {
        pixels: BufferId,
        luma: BufferId,
        width: usize,
        height: usize,
        bytes_per_pixel: usize,
    },
    LayerForward {
        input: BufferId,
        output: BufferId,
        weights: BufferId,
        bias: BufferId,
        shape: ConvShape,
        activation: Activation,
    },
    /// `out[slot] = Σ (a - b)²`
    SumSquaredError {
        a: BufferId,
        b: BufferId,
        count: usize,
        out: BufferId,
        slot: usize,
    },
    /// `out[slot] = Σ x²`
    SumOfSquares {
        input: BufferId,
        count: usize,
        out: BufferId,
        slot: usize,
    },
    /// `out[slot] = Σ x`
    Sum {
        input: BufferId,
        count: usize,
        out: BufferId,
        slot: usize,
    },
    AddScalar {
        buffer: BufferId,
        count: usize,
        value: f32,
    },
    Crop {
        src: BufferId,
        src_width: usize,
        src_height: usize,
        dst: BufferId,
        left: usize,
        top: usize,
        width: usize,
        height: usize,
    },
    /// `deltas = (predicted - expected) * scale`
    OutputDeltas {
        predicted: BufferId,
        expected: BufferId,
        deltas: BufferId,
        count: usize,
        scale: f32,
    },
    /// Transposed convolution of the next layer's deltas, masked by the
    /// derivative of this layer's activation.
    BackpropDeltas {
        next_deltas: BufferId,
        next_weights: BufferId,
        next: ConvShape,
        output: BufferId,
        activation: Activation,
        deltas: BufferId,
    },
    /// `gw += Σ delta * input + decay * w`, `gb += Σ delta`
    AccumulateGradients {
        deltas: BufferId,
        input: BufferId,
        weights: BufferId,
        grad_weights: BufferId,
        grad_bias: BufferId,
        shape: ConvShape,
        decay: f32,
    },
    /// `p -= rate * (g / batch_size); g = 0`
    ApplyGradients {
        params: BufferId,
        grads: BufferId,
        count: usize,
        rate: f32,
        batch_size: usize,
    },
}

impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::ExtractLuma { .. } => "extract_luma",
            Kernel::LayerForward { .. } => "layer_forward",
            Kernel::SumSquaredError { .. } => "sum_squared_error",
            Kernel::SumOfSquares { .. } => "sum_of_squares",
            Kernel::Sum { .. } => "sum",
            Kernel::AddScalar { .. } => "add_scalar",
            Kernel::Crop { .. } => "crop",
            Kernel::OutputDeltas { .. } => "output_deltas",
            Kernel::BackpropDeltas { .. } => "backprop_deltas",
            Kernel::AccumulateGradients { .. } => "accumulate_gradients",
            Kernel::ApplyGradients { .. } => "apply_gradients",
        }
    }

    /// Every buffer the kernel touches.
    pub fn buffers(&self) -> Vec<BufferId> {
        match *self {
            Kernel::ExtractLuma { pixels, luma, .. } => vec![pixels, luma],
            Kernel::LayerForward {
                input,
                output,
                weights,
                bias,
                ..
            } => vec![input, output, weights, bias],
            Kernel::SumSquaredError { a, b, out, .. } => vec![a, b, out],
            Kernel::SumOfSquares { input, out, .. } | Kernel::Sum { input, out, .. } => {
                vec![input, out]
            }
            Kernel::AddScalar { buffer, .. } => vec![buffer],
            Kernel::Crop { src, dst, .. } => vec![src, dst],
            Kernel::OutputDeltas {
                predicted,
                expected,
                deltas,
                ..
            } => vec![predicted, expected, deltas],
            Kernel::BackpropDeltas {
                next_deltas,
                next_weights,
                output,
                deltas,
                ..
            } => vec![next_deltas, next_weights, output, deltas],
            Kernel::AccumulateGradients {
                deltas,
                input,
                weights,
                grad_weights,
                grad_bias,
                ..
            } => vec![deltas, input, weights, grad_weights, grad_bias],
            Kernel::ApplyGradients { params, grads, .. } => vec![params, grads],
        }
    }
}

/// A single ordered command queue plus the buffers it operates on.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    /// Zero-filled buffer of `len` floats.
    fn allocate(&self, len: usize) -> Result<BufferId>;

    /// Frees a buffer once every queued command has finished with it.
    fn release(&self, id: BufferId) -> Result<()>;

    fn buffer_len(&self, id: BufferId) -> Result<usize>;

    fn write(&self, id: BufferId, data: &[f32], deps: &[Event]) -> Result<Event>;

    /// Blocks until `deps` complete, then copies the buffer to the host.
    fn read(&self, id: BufferId, deps: &[Event]) -> Result<Vec<f32>>;

    fn launch(&self, kernel: Kernel, deps: &[Event]) -> Result<Event>;

    /// Marker that completes once all of `deps` have completed.
    fn join(&self, deps: &[Event]) -> Result<Event>;

    fn wait(&self, events: &[Event]) -> Result<()>;

    fn synchronize(&self) -> Result<()>;

    fn upload(&self, data: &[f32]) -> Result<(BufferId, Event)> {
        let id = self.allocate(data.len())?;
        let event = self.write(id, data, &[])?;
        Ok((id, event))
    }
}

pub type SharedDevice = Arc<dyn Device>;

/// Host device, or the CUDA device when built with `--features cuda` and
/// `use_cuda` is set.
pub fn open(use_cuda: bool) -> Result<SharedDevice> {
    if use_cuda {
        #[cfg(feature = "cuda")]
        {
            return Ok(Arc::new(CudaBackend::new(0)?));
        }
        #[cfg(not(feature = "cuda"))]
        {
            return Err(crate::error::device(
                "this build has no CUDA support (rebuild with --features cuda)",
            ));
        }
    }
    Ok(Arc::new(CpuDevice::new()))
}
