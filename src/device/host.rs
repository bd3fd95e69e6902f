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

//! Reference implementations of the numeric kernels on host slices.
//!
//! These define the numeric contract the CUDA kernels follow, and are what
//! [`CpuDevice`](super::CpuDevice) executes.

use super::{Activation, ConvShape};
use crate::error::{shape, Result};

const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;

fn check_len(what: &str, len: usize, needed: usize) -> Result<()> {
    if len < needed {
        return Err(shape(&format!(
            "{} holds {} values, kernel needs {}",
            what, len, needed
        )));
    }
    Ok(())
}

#[inline]
fn weight_index(s: &ConvShape, k: usize, c: usize, dy: usize, dx: usize) -> usize {
    ((k * s.in_channels + c) * s.filter_size + dy) * s.filter_size + dx
}

pub fn extract_luma(
    pixels: &[f32],
    luma: &mut [f32],
    width: usize,
    height: usize,
    bytes_per_pixel: usize,
) -> Result<()> {
    let count = width * height;
    check_len("pixel buffer", pixels.len(), count * bytes_per_pixel)?;
    check_len("luma buffer", luma.len(), count)?;
    for (i, out) in luma.iter_mut().take(count).enumerate() {
        let px = &pixels[i * bytes_per_pixel..(i + 1) * bytes_per_pixel];
        let y = if bytes_per_pixel >= 3 {
            LUMA_R * px[0] + LUMA_G * px[1] + LUMA_B * px[2]
        } else {
            px[0]
        };
        *out = y / 255.0;
    }
    Ok(())
}

pub fn conv_forward(
    input: &[f32],
    weights: &[f32],
    bias: &[f32],
    output: &mut [f32],
    s: &ConvShape,
    activation: Activation,
) -> Result<()> {
    if !s.is_valid() {
        return Err(shape(&format!("invalid convolution {:?}", s)));
    }
    check_len("layer input", input.len(), s.input_len())?;
    check_len("weights", weights.len(), s.weight_len())?;
    check_len("bias", bias.len(), s.out_channels)?;
    check_len("layer output", output.len(), s.output_len())?;

    let (ow, oh) = (s.out_width(), s.out_height());
    let plane = s.in_width * s.in_height;
    for k in 0..s.out_channels {
        for y in 0..oh {
            for x in 0..ow {
                let mut sum = bias[k];
                for c in 0..s.in_channels {
                    for dy in 0..s.filter_size {
                        let row = c * plane + (y + dy) * s.in_width + x;
                        for dx in 0..s.filter_size {
                            sum += input[row + dx] * weights[weight_index(s, k, c, dy, dx)];
                        }
                    }
                }
                output[(k * oh + y) * ow + x] = activation.apply(sum);
            }
        }
    }
    Ok(())
}

pub fn sum_squared_error(a: &[f32], b: &[f32], count: usize) -> Result<f64> {
    check_len("first operand", a.len(), count)?;
    check_len("second operand", b.len(), count)?;
    Ok(a[..count]
        .iter()
        .zip(&b[..count])
        .map(|(x, y)| {
            let d = (*x as f64) - (*y as f64);
            d * d
        })
        .sum())
}

pub fn sum_of_squares(input: &[f32], count: usize) -> Result<f64> {
    check_len("input", input.len(), count)?;
    Ok(input[..count].iter().map(|x| (*x as f64) * (*x as f64)).sum())
}

pub fn sum(input: &[f32], count: usize) -> Result<f64> {
    check_len("input", input.len(), count)?;
    Ok(input[..count].iter().map(|x| *x as f64).sum())
}

pub fn add_scalar(buffer: &mut [f32], count: usize, value: f32) -> Result<()> {
    check_len("buffer", buffer.len(), count)?;
    buffer[..count].iter_mut().for_each(|x| *x += value);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn crop(
    src: &[f32],
    src_width: usize,
    src_height: usize,
    dst: &mut [f32],
    left: usize,
    top: usize,
    width: usize,
    height: usize,
) -> Result<()> {
    if left + width > src_width || top + height > src_height {
        return Err(shape(&format!(
            "crop {}x{}+{}+{} exceeds {}x{}",
            width, height, left, top, src_width, src_height
        )));
    }
    check_len("crop source", src.len(), src_width * src_height)?;
    check_len("crop target", dst.len(), width * height)?;
    for y in 0..height {
        let from = (top + y) * src_width + left;
        dst[y * width..(y + 1) * width].copy_from_slice(&src[from..from + width]);
    }
    Ok(())
}

pub fn output_deltas(
    predicted: &[f32],
    expected: &[f32],
    deltas: &mut [f32],
    count: usize,
    scale: f32,
) -> Result<()> {
    check_len("prediction", predicted.len(), count)?;
    check_len("expected output", expected.len(), count)?;
    check_len("deltas", deltas.len(), count)?;
    for i in 0..count {
        deltas[i] = (predicted[i] - expected[i]) * scale;
    }
    Ok(())
}

/// `next` describes the convolution that consumed this layer's output, so
/// this layer's map is `next.in_channels x next.in_height x next.in_width`.
pub fn backprop_deltas(
    next_deltas: &[f32],
    next_weights: &[f32],
    next: &ConvShape,
    output: &[f32],
    activation: Activation,
    deltas: &mut [f32],
) -> Result<()> {
    if !next.is_valid() {
        return Err(shape(&format!("invalid convolution {:?}", next)));
    }
    check_len("next deltas", next_deltas.len(), next.output_len())?;
    check_len("next weights", next_weights.len(), next.weight_len())?;
    check_len("layer output", output.len(), next.input_len())?;
    check_len("layer deltas", deltas.len(), next.input_len())?;

    let (w, h) = (next.in_width, next.in_height);
    let (ow, oh) = (next.out_width(), next.out_height());
    let f = next.filter_size;
    for c in 0..next.in_channels {
        for y in 0..h {
            // rows of the next layer's output whose window covers `y`
            let y_lo = (y + 1).saturating_sub(f);
            let y_hi = y.min(oh - 1);
            for x in 0..w {
                let x_lo = (x + 1).saturating_sub(f);
                let x_hi = x.min(ow - 1);
                let mut sum = 0.0f32;
                for k in 0..next.out_channels {
                    for oy in y_lo..=y_hi {
                        for ox in x_lo..=x_hi {
                            let d = next_deltas[(k * oh + oy) * ow + ox];
                            sum += d * next_weights[weight_index(next, k, c, y - oy, x - ox)];
                        }
                    }
                }
                let idx = (c * h + y) * w + x;
                deltas[idx] = sum * activation.derivative(output[idx]);
            }
        }
    }
    Ok(())
}

pub fn accumulate_gradients(
    deltas: &[f32],
    input: &[f32],
    weights: &[f32],
    grad_weights: &mut [f32],
    grad_bias: &mut [f32],
    s: &ConvShape,
    decay: f32,
) -> Result<()> {
    if !s.is_valid() {
        return Err(shape(&format!("invalid convolution {:?}", s)));
    }
    check_len("deltas", deltas.len(), s.output_len())?;
    check_len("layer input", input.len(), s.input_len())?;
    check_len("weights", weights.len(), s.weight_len())?;
    check_len("weight gradients", grad_weights.len(), s.weight_len())?;
    check_len("bias gradients", grad_bias.len(), s.out_channels)?;

    let (ow, oh) = (s.out_width(), s.out_height());
    let plane = s.in_width * s.in_height;
    for k in 0..s.out_channels {
        let d_plane = &deltas[k * ow * oh..(k + 1) * ow * oh];
        grad_bias[k] += d_plane.iter().sum::<f32>();
        for c in 0..s.in_channels {
            for dy in 0..s.filter_size {
                for dx in 0..s.filter_size {
                    let mut g = 0.0f32;
                    for y in 0..oh {
                        let row = c * plane + (y + dy) * s.in_width + dx;
                        for x in 0..ow {
                            g += d_plane[y * ow + x] * input[row + x];
                        }
                    }
                    let wi = weight_index(s, k, c, dy, dx);
                    grad_weights[wi] += g + decay * weights[wi];
                }
            }
        }
    }
    Ok(())
}

pub fn apply_gradients(
    params: &mut [f32],
    grads: &mut [f32],
    count: usize,
    rate: f32,
    batch_size: usize,
) -> Result<()> {
    if batch_size == 0 {
        return Err(shape("gradient update over an empty batch"));
    }
    check_len("parameters", params.len(), count)?;
    check_len("gradients", grads.len(), count)?;
    let n = batch_size as f32;
    for (p, g) in params[..count].iter_mut().zip(&mut grads[..count]) {
        *p -= rate * (*g / n);
        *g = 0.0;
    }
    Ok(())
}
