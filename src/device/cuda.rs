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

use cudarc::driver::{CudaDevice, CudaFunction, CudaSlice, DriverError, LaunchAsync, LaunchConfig};
use log::{debug, info};
use parking_lot::Mutex;

use super::kernels::{CUDA_KERNELS, KERNEL_NAMES, MODULE_NAME};
use super::{Activation, Arena, BufferId, ConvShape, Device, Event, Kernel};
use crate::error::{device, Error, Result};

const BLOCK_SIZE: u32 = 256;

impl From<DriverError> for Error {
    fn from(e: DriverError) -> Self {
        Error::Device(e.to_string())
    }
}

struct Buffer {
    slice: CudaSlice<f32>,
    len: usize,
}

struct Inner {
    arena: Arena<Buffer>,
    next_event: u64,
}

/// CUDA device driven through `cudarc`. Everything is issued on the default
/// stream, so queue order already satisfies dependencies and events are plain
/// sequence numbers; blocking calls synchronize the device.
pub struct CudaBackend {
    device: Arc<CudaDevice>,
    inner: Mutex<Inner>,
}

fn launch_config(n: usize) -> LaunchConfig {
    let n = n.max(1) as u32;
    let blocks = (n + BLOCK_SIZE - 1) / BLOCK_SIZE;
    LaunchConfig {
        grid_dim: (blocks, 1, 1),
        block_dim: (BLOCK_SIZE, 1, 1),
        shared_mem_bytes: 0,
    }
}

fn single_block() -> LaunchConfig {
    LaunchConfig {
        grid_dim: (1, 1, 1),
        block_dim: (BLOCK_SIZE, 1, 1),
        shared_mem_bytes: 0,
    }
}

fn activation_args(activation: Activation) -> (i32, f32) {
    match activation {
        Activation::Relu => (0, 1.0),
        Activation::Scaled(s) => (1, s),
    }
}

fn conv_args(s: &ConvShape) -> (i32, i32, i32, i32, i32) {
    (
        s.filter_size as i32,
        s.in_channels as i32,
        s.out_channels as i32,
        s.in_width as i32,
        s.in_height as i32,
    )
}

impl CudaBackend {
    pub fn new(ordinal: usize) -> Result<Self> {
        let device = CudaDevice::new(ordinal)?;
        let ptx = cudarc::nvrtc::compile_ptx(CUDA_KERNELS)
            .map_err(|e| device_error("kernel compilation failed", e))?;
        device.load_ptx(ptx, MODULE_NAME, KERNEL_NAMES)?;
        info!("CUDA device {} ready", ordinal);
        Ok(Self {
            device,
            inner: Mutex::new(Inner {
                arena: Arena::new(),
                next_event: 0,
            }),
        })
    }

    fn func(&self, name: &str) -> Result<CudaFunction> {
        self.device
            .get_func(MODULE_NAME, name)
            .ok_or_else(|| device(&format!("kernel {} not loaded", name)))
    }

    #[allow(clippy::too_many_arguments)]
    fn reduce(
        &self,
        arena: &Arena<Buffer>,
        out: BufferId,
        slot: usize,
        a: BufferId,
        b: BufferId,
        count: usize,
        mode: i32,
    ) -> Result<()> {
        if slot >= arena.get(out)?.len {
            return Err(crate::error::shape("scalar slot outside output buffer"));
        }
        let func = self.func("reduce_kernel")?;
        unsafe {
            func.launch(
                single_block(),
                (
                    &arena.get(out)?.slice,
                    slot as i32,
                    &arena.get(a)?.slice,
                    &arena.get(b)?.slice,
                    count as i32,
                    mode,
                ),
            )?;
        }
        Ok(())
    }

    fn dispatch(&self, arena: &Arena<Buffer>, kernel: &Kernel) -> Result<()> {
        let buf = |id: BufferId| arena.get(id).map(|b| &b.slice);
        debug!("cuda: {}", kernel.name());
        match *kernel {
            Kernel::ExtractLuma {
                pixels,
                luma,
                width,
                height,
                bytes_per_pixel,
            } => {
                let func = self.func("extract_luma_kernel")?;
                unsafe {
                    func.launch(
                        launch_config(width * height),
                        (
                            buf(luma)?,
                            buf(pixels)?,
                            width as i32,
                            height as i32,
                            bytes_per_pixel as i32,
                        ),
                    )?;
                }
            }
            Kernel::LayerForward {
                input,
                output,
                weights,
                bias,
                shape,
                activation,
            } => {
                let (f, cin, cout, w, h) = conv_args(&shape);
                let (kind, scale) = activation_args(activation);
                let func = self.func("layer_forward_kernel")?;
                unsafe {
                    func.launch(
                        launch_config(shape.output_len()),
                        (
                            buf(output)?,
                            buf(input)?,
                            buf(weights)?,
                            buf(bias)?,
                            f,
                            cin,
                            cout,
                            w,
                            h,
                            kind,
                            scale,
                        ),
                    )?;
                }
            }
            Kernel::SumSquaredError {
                a,
                b,
                count,
                out,
                slot,
            } => self.reduce(arena, out, slot, a, b, count, 0)?,
            Kernel::SumOfSquares {
                input,
                count,
                out,
                slot,
            } => self.reduce(arena, out, slot, input, input, count, 1)?,
            Kernel::Sum {
                input,
                count,
                out,
                slot,
            } => self.reduce(arena, out, slot, input, input, count, 2)?,
            Kernel::AddScalar {
                buffer,
                count,
                value,
            } => {
                let func = self.func("add_scalar_kernel")?;
                unsafe {
                    func.launch(launch_config(count), (buf(buffer)?, count as i32, value))?;
                }
            }
            Kernel::Crop {
                src,
                src_width,
                src_height,
                dst,
                left,
                top,
                width,
                height,
            } => {
                if left + width > src_width || top + height > src_height {
                    return Err(crate::error::shape("crop window exceeds source"));
                }
                let func = self.func("crop_kernel")?;
                unsafe {
                    func.launch(
                        launch_config(width * height),
                        (
                            buf(dst)?,
                            buf(src)?,
                            src_width as i32,
                            left as i32,
                            top as i32,
                            width as i32,
                            height as i32,
                        ),
                    )?;
                }
            }
            Kernel::OutputDeltas {
                predicted,
                expected,
                deltas,
                count,
                scale,
            } => {
                let func = self.func("output_deltas_kernel")?;
                unsafe {
                    func.launch(
                        launch_config(count),
                        (
                            buf(deltas)?,
                            buf(predicted)?,
                            buf(expected)?,
                            count as i32,
                            scale,
                        ),
                    )?;
                }
            }
            Kernel::BackpropDeltas {
                next_deltas,
                next_weights,
                next,
                output,
                activation,
                deltas,
            } => {
                let (f, cin, cout, w, h) = conv_args(&next);
                let (kind, scale) = activation_args(activation);
                let func = self.func("backprop_deltas_kernel")?;
                unsafe {
                    func.launch(
                        launch_config(next.input_len()),
                        (
                            buf(deltas)?,
                            buf(next_deltas)?,
                            buf(next_weights)?,
                            buf(output)?,
                            f,
                            cin,
                            cout,
                            w,
                            h,
                            kind,
                            scale,
                        ),
                    )?;
                }
            }
            Kernel::AccumulateGradients {
                deltas,
                input,
                weights,
                grad_weights,
                grad_bias,
                shape,
                decay,
            } => {
                let (f, cin, cout, w, h) = conv_args(&shape);
                let func = self.func("weight_grad_kernel")?;
                unsafe {
                    func.launch(
                        launch_config(shape.weight_len()),
                        (
                            buf(grad_weights)?,
                            buf(deltas)?,
                            buf(input)?,
                            buf(weights)?,
                            f,
                            cin,
                            cout,
                            w,
                            h,
                            decay,
                        ),
                    )?;
                }
                let plane = (shape.out_width() * shape.out_height()) as i32;
                let func = self.func("bias_grad_kernel")?;
                unsafe {
                    func.launch(
                        launch_config(shape.out_channels),
                        (buf(grad_bias)?, buf(deltas)?, cout, plane),
                    )?;
                }
            }
            Kernel::ApplyGradients {
                params,
                grads,
                count,
                rate,
                batch_size,
            } => {
                if batch_size == 0 {
                    return Err(crate::error::shape("gradient update over an empty batch"));
                }
                let func = self.func("apply_gradients_kernel")?;
                unsafe {
                    func.launch(
                        launch_config(count),
                        (
                            buf(params)?,
                            buf(grads)?,
                            count as i32,
                            rate,
                            batch_size as f32,
                        ),
                    )?;
                }
            }
        }
        Ok(())
    }
}

fn device_error(context: &str, e: impl std::fmt::Display) -> Error {
    device(&format!("{}: {}", context, e))
}

impl Inner {
    fn check_deps(&self, deps: &[Event]) -> Result<()> {
        match deps.iter().find(|e| e.0 >= self.next_event) {
            Some(e) => Err(Error::UnknownEvent(*e)),
            None => Ok(()),
        }
    }

    fn issue(&mut self) -> Event {
        let event = Event(self.next_event);
        self.next_event += 1;
        event
    }
}

impl Device for CudaBackend {
    fn name(&self) -> &str {
        "cuda"
    }

    fn allocate(&self, len: usize) -> Result<BufferId> {
        let slice = self.device.alloc_zeros::<f32>(len.max(1))?;
        Ok(self.inner.lock().arena.insert(Buffer { slice, len }))
    }

    fn release(&self, id: BufferId) -> Result<()> {
        self.device.synchronize()?;
        self.inner.lock().arena.remove(id).map(drop)
    }

    fn buffer_len(&self, id: BufferId) -> Result<usize> {
        Ok(self.inner.lock().arena.get(id)?.len)
    }

    fn write(&self, id: BufferId, data: &[f32], deps: &[Event]) -> Result<Event> {
        let mut inner = self.inner.lock();
        inner.check_deps(deps)?;
        let buffer = inner.arena.get_mut(id)?;
        if data.len() != buffer.len {
            return Err(crate::error::shape(&format!(
                "write of {} values into buffer {} of {}",
                data.len(),
                id,
                buffer.len
            )));
        }
        if !data.is_empty() {
            self.device.htod_sync_copy_into(data, &mut buffer.slice)?;
        }
        Ok(inner.issue())
    }

    fn read(&self, id: BufferId, deps: &[Event]) -> Result<Vec<f32>> {
        let inner = self.inner.lock();
        inner.check_deps(deps)?;
        let buffer = inner.arena.get(id)?;
        let mut data = self.device.dtoh_sync_copy(&buffer.slice)?;
        data.truncate(buffer.len);
        Ok(data)
    }

    fn launch(&self, kernel: Kernel, deps: &[Event]) -> Result<Event> {
        let mut inner = self.inner.lock();
        inner.check_deps(deps)?;
        if let Some(stale) = kernel.buffers().into_iter().find(|b| !inner.arena.contains(*b)) {
            return Err(Error::StaleBuffer(stale));
        }
        self.dispatch(&inner.arena, &kernel)?;
        Ok(inner.issue())
    }

    fn join(&self, deps: &[Event]) -> Result<Event> {
        let mut inner = self.inner.lock();
        inner.check_deps(deps)?;
        Ok(inner.issue())
    }

    fn wait(&self, events: &[Event]) -> Result<()> {
        self.inner.lock().check_deps(events)?;
        self.device.synchronize()?;
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        self.device.synchronize()?;
        Ok(())
    }
}
