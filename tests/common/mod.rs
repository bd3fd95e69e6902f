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

#![allow(dead_code)]

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use srcnn::cnn::{LayerParameters, ParameterSnapshot};
use srcnn::device::{CpuDevice, SharedDevice};
use srcnn::Config;

/// 3x3 -> 1x1 -> 3x3 with two filters per hidden layer; 4 px of padding.
pub fn small_config() -> Config {
    Config {
        n1: 2,
        n2: 2,
        f1: 3,
        f2: 1,
        f3: 3,
        learning_rate: 1e-3,
        ..Config::default()
    }
}

pub fn cpu() -> SharedDevice {
    Arc::new(CpuDevice::new())
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_plane(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen::<f32>()).collect()
}

/// Strictly positive parameters so every ReLU stays in its linear region
/// for non-negative inputs.
pub fn positive_snapshot(config: &Config) -> ParameterSnapshot {
    let specs = config.layer_specs();
    let layer = |i: usize| {
        let spec = &specs[i];
        LayerParameters {
            weights: (0..spec.weight_len())
                .map(|j| 0.05 + 0.01 * ((j + i) % 7) as f32)
                .collect(),
            bias: vec![0.1; spec.filter_count],
        }
    };
    ParameterSnapshot {
        layers: [layer(0), layer(1), layer(2)],
    }
}
