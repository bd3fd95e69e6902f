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

use std::collections::VecDeque;

use log::trace;
use parking_lot::Mutex;

use super::{host, Arena, BufferId, Device, Event, Kernel};
use crate::error::{Error, Result};

enum Command {
    Write { dst: BufferId, data: Vec<f32> },
    Launch(Kernel),
    Marker,
}

struct Pending {
    event: Event,
    command: Command,
}

struct State {
    arena: Arena<Vec<f32>>,
    queue: VecDeque<Pending>,
    next_event: u64,
    /// Every event below this index has completed.
    completed: u64,
}

/// Host-side device. Commands are queued and only executed when the host
/// blocks on one of their events, so the issuing code sees the same
/// asynchronous behaviour it would on a GPU queue.
pub struct CpuDevice {
    state: Mutex<State>,
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                arena: Arena::new(),
                queue: VecDeque::new(),
                next_event: 0,
                completed: 0,
            }),
        }
    }

    /// Commands issued but not yet executed.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().arena.live()
    }
}

impl State {
    fn check_deps(&self, deps: &[Event]) -> Result<()> {
        match deps.iter().find(|e| e.0 >= self.next_event) {
            Some(e) => Err(Error::UnknownEvent(*e)),
            None => Ok(()),
        }
    }

    fn enqueue(&mut self, command: Command, deps: &[Event]) -> Result<Event> {
        self.check_deps(deps)?;
        let event = Event(self.next_event);
        self.next_event += 1;
        self.queue.push_back(Pending { event, command });
        Ok(event)
    }

    /// The queue is in issue order and dependencies always point backwards,
    /// so draining a prefix satisfies every dependency inside it.
    fn run_until(&mut self, target: u64) -> Result<()> {
        while self.completed < target {
            let Some(pending) = self.queue.pop_front() else {
                break;
            };
            self.completed = pending.event.0 + 1;
            self.execute(pending.command)?;
        }
        Ok(())
    }

    fn execute(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Write { dst, data } => {
                let buf = self.arena.get_mut(dst)?;
                if data.len() > buf.len() {
                    return Err(crate::error::shape(&format!(
                        "write of {} values into buffer {} of {}",
                        data.len(),
                        dst,
                        buf.len()
                    )));
                }
                buf[..data.len()].copy_from_slice(&data);
                Ok(())
            }
            Command::Launch(kernel) => {
                trace!("cpu: {}", kernel.name());
                self.run_kernel(kernel)
            }
            Command::Marker => Ok(()),
        }
    }

    fn store_scalar(&mut self, out: BufferId, slot: usize, value: f64) -> Result<()> {
        let buf = self.arena.get_mut(out)?;
        match buf.get_mut(slot) {
            Some(v) => {
                *v = value as f32;
                Ok(())
            }
            None => Err(crate::error::shape(&format!(
                "scalar slot {} outside buffer {}",
                slot, out
            ))),
        }
    }

    fn run_kernel(&mut self, kernel: Kernel) -> Result<()> {
        let arena = &mut self.arena;
        match kernel {
            Kernel::ExtractLuma {
                pixels,
                luma,
                width,
                height,
                bytes_per_pixel,
            } => {
                arena.with_taken(luma, |arena, out| {
                    host::extract_luma(arena.get(pixels)?, out, width, height, bytes_per_pixel)
                })
            }
            Kernel::LayerForward {
                input,
                output,
                weights,
                bias,
                shape,
                activation,
            } => {
                arena.with_taken(output, |arena, out| {
                    host::conv_forward(
                        arena.get(input)?,
                        arena.get(weights)?,
                        arena.get(bias)?,
                        out,
                        &shape,
                        activation,
                    )
                })
            }
            Kernel::SumSquaredError {
                a,
                b,
                count,
                out,
                slot,
            } => {
                let value = host::sum_squared_error(arena.get(a)?, arena.get(b)?, count)?;
                self.store_scalar(out, slot, value)
            }
            Kernel::SumOfSquares {
                input,
                count,
                out,
                slot,
            } => {
                let value = host::sum_of_squares(arena.get(input)?, count)?;
                self.store_scalar(out, slot, value)
            }
            Kernel::Sum {
                input,
                count,
                out,
                slot,
            } => {
                let value = host::sum(arena.get(input)?, count)?;
                self.store_scalar(out, slot, value)
            }
            Kernel::AddScalar {
                buffer,
                count,
                value,
            } => host::add_scalar(arena.get_mut(buffer)?, count, value),
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
                arena.with_taken(dst, |arena, out| {
                    host::crop(
                        arena.get(src)?,
                        src_width,
                        src_height,
                        out,
                        left,
                        top,
                        width,
                        height,
                    )
                })
            }
            Kernel::OutputDeltas {
                predicted,
                expected,
                deltas,
                count,
                scale,
            } => {
                arena.with_taken(deltas, |arena, out| {
                    host::output_deltas(
                        arena.get(predicted)?,
                        arena.get(expected)?,
                        out,
                        count,
                        scale,
                    )
                })
            }
            Kernel::BackpropDeltas {
                next_deltas,
                next_weights,
                next,
                output,
                activation,
                deltas,
            } => {
                arena.with_taken(deltas, |arena, out| {
                    host::backprop_deltas(
                        arena.get(next_deltas)?,
                        arena.get(next_weights)?,
                        &next,
                        arena.get(output)?,
                        activation,
                        out,
                    )
                })
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
                let mut gw = arena.take(grad_weights)?;
                let res = arena.with_taken(grad_bias, |arena, gb| {
                    host::accumulate_gradients(
                        arena.get(deltas)?,
                        arena.get(input)?,
                        arena.get(weights)?,
                        &mut gw,
                        gb,
                        &shape,
                        decay,
                    )
                });
                arena.put(grad_weights, gw)?;
                res
            }
            Kernel::ApplyGradients {
                params,
                grads,
                count,
                rate,
                batch_size,
            } => {
                let mut g = arena.take(grads)?;
                let res = arena
                    .get_mut(params)
                    .and_then(|p| host::apply_gradients(p, &mut g, count, rate, batch_size));
                arena.put(grads, g)?;
                res
            }
        }
    }
}

impl Device for CpuDevice {
    fn name(&self) -> &str {
        "cpu"
    }

    fn allocate(&self, len: usize) -> Result<BufferId> {
        Ok(self.state.lock().arena.insert(vec![0.0; len]))
    }

    fn release(&self, id: BufferId) -> Result<()> {
        let mut state = self.state.lock();
        let target = state.next_event;
        state.run_until(target)?;
        state.arena.remove(id).map(|_| ())
    }

    fn buffer_len(&self, id: BufferId) -> Result<usize> {
        Ok(self.state.lock().arena.get(id)?.len())
    }

    fn write(&self, id: BufferId, data: &[f32], deps: &[Event]) -> Result<Event> {
        let mut state = self.state.lock();
        let len = state.arena.get(id)?.len();
        if data.len() > len {
            return Err(crate::error::shape(&format!(
                "write of {} values into buffer {} of {}",
                data.len(),
                id,
                len
            )));
        }
        state.enqueue(
            Command::Write {
                dst: id,
                data: data.to_vec(),
            },
            deps,
        )
    }

    fn read(&self, id: BufferId, deps: &[Event]) -> Result<Vec<f32>> {
        let mut state = self.state.lock();
        state.check_deps(deps)?;
        if let Some(last) = deps.iter().max() {
            state.run_until(last.0 + 1)?;
        }
        Ok(state.arena.get(id)?.clone())
    }

    fn launch(&self, kernel: Kernel, deps: &[Event]) -> Result<Event> {
        let mut state = self.state.lock();
        if let Some(stale) = kernel.buffers().into_iter().find(|b| !state.arena.contains(*b)) {
            return Err(Error::StaleBuffer(stale));
        }
        state.enqueue(Command::Launch(kernel), deps)
    }

    fn join(&self, deps: &[Event]) -> Result<Event> {
        self.state.lock().enqueue(Command::Marker, deps)
    }

    fn wait(&self, events: &[Event]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_deps(events)?;
        match events.iter().max() {
            Some(last) => state.run_until(last.0 + 1),
            None => Ok(()),
        }
    }

    fn synchronize(&self) -> Result<()> {
        let mut state = self.state.lock();
        let target = state.next_event;
        state.run_until(target)
    }
}
