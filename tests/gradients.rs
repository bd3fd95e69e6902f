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

mod common;

use std::sync::Arc;

use approx::assert_abs_diff_eq;

use common::{cpu, positive_snapshot, random_plane, rng, small_config};
use srcnn::cnn::{Network, ParameterSnapshot};
use srcnn::device::{BufferId, Device, SharedDevice};
use srcnn::Config;

const W: usize = 7;
const H: usize = 7;

struct Fixture {
    device: SharedDevice,
    input: BufferId,
    expected: BufferId,
}

impl Fixture {
    fn new() -> Self {
        let device = cpu();
        let (input, _) = device.upload(&random_plane(&mut rng(21), W * H)).unwrap();
        let (expected, _) = device.upload(&random_plane(&mut rng(22), 3 * 3)).unwrap();
        device.synchronize().unwrap();
        Self {
            device,
            input,
            expected,
        }
    }

    /// `0.5 * Σ (prediction - expected)²` for the given parameters.
    fn loss(&self, net: &mut Network, params: &ParameterSnapshot) -> f64 {
        let restored = net.restore(params).unwrap();
        let e = net.forward(self.input, W, H, &[restored]).unwrap();
        0.5 * net
            .squared_error(self.expected, net.output(), 3, 3, &[e])
            .unwrap()
    }
}

fn param_mut(s: &mut ParameterSnapshot, layer: usize, is_bias: bool, index: usize) -> &mut f32 {
    let l = &mut s.layers[layer];
    if is_bias {
        &mut l.bias[index]
    } else {
        &mut l.weights[index]
    }
}

#[test]
fn backpropagation_matches_finite_differences() {
    let fx = Fixture::new();
    let config = Arc::new(small_config());
    let base = positive_snapshot(&config);
    let mut net = Network::from_snapshot(fx.device.clone(), config, &base).unwrap();

    let e = net.forward(fx.input, W, H, &[]).unwrap();
    let done = net
        .backpropagate(fx.input, fx.expected, W, H, 0.0, &[e])
        .unwrap();
    fx.device.wait(&[done]).unwrap();
    let grads = net.gradients().unwrap();

    let step = 1e-2f32;
    // (layer, is_bias, index)
    let probes = [
        (0, false, 0),
        (0, false, 13),
        (0, true, 1),
        (1, false, 2),
        (1, true, 0),
        (2, false, 5),
        (2, false, 17),
        (2, true, 0),
    ];
    for (layer, is_bias, index) in probes {
        let mut plus = base.clone();
        let mut minus = base.clone();
        *param_mut(&mut plus, layer, is_bias, index) += step;
        *param_mut(&mut minus, layer, is_bias, index) -= step;
        let numeric = (fx.loss(&mut net, &plus) - fx.loss(&mut net, &minus)) / (2.0 * step as f64);
        let analytic = if is_bias {
            grads[layer].bias[index]
        } else {
            grads[layer].weights[index]
        } as f64;
        assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-3 + 1e-2 * numeric.abs());
    }
}

#[test]
fn weight_decay_adds_coefficient_times_weight() {
    let fx = Fixture::new();
    let config = Arc::new(small_config());
    let base = positive_snapshot(&config);

    let gradients_with = |decay: f32| {
        let mut net = Network::from_snapshot(fx.device.clone(), config.clone(), &base).unwrap();
        let e = net.forward(fx.input, W, H, &[]).unwrap();
        let done = net
            .backpropagate(fx.input, fx.expected, W, H, decay, &[e])
            .unwrap();
        fx.device.wait(&[done]).unwrap();
        net.gradients().unwrap()
    };
    let plain = gradients_with(0.0);
    let decayed = gradients_with(0.5);

    for layer in 0..3 {
        for (i, w) in base.layers[layer].weights.iter().enumerate() {
            assert_abs_diff_eq!(
                decayed[layer].weights[i] - plain[layer].weights[i],
                0.5 * w,
                epsilon = 1e-5
            );
        }
        assert_eq!(decayed[layer].bias, plain[layer].bias);
    }
}

#[test]
fn gradients_accumulate_until_the_update_clears_them() {
    let fx = Fixture::new();
    let config = Arc::new(small_config());
    let mut net = Network::from_snapshot(fx.device.clone(), config, &positive_snapshot(&small_config())).unwrap();

    let mut last = Vec::new();
    for _ in 0..2 {
        let e = net.forward(fx.input, W, H, &last).unwrap();
        last = vec![net.backpropagate(fx.input, fx.expected, W, H, 0.0, &[e]).unwrap()];
    }
    fx.device.wait(&last).unwrap();
    let twice = net.gradients().unwrap();

    let e = net.update_parameters(2, &last).unwrap();
    fx.device.wait(&[e]).unwrap();
    let cleared = net.gradients().unwrap();
    assert!(cleared
        .iter()
        .all(|l| l.weights.iter().chain(&l.bias).all(|v| *v == 0.0)));
    assert!(twice[2].bias[0] != 0.0);
}

#[test]
fn one_small_step_lowers_the_loss() {
    let fx = Fixture::new();
    let config = Arc::new(Config {
        learning_rate: 1e-3,
        ..small_config()
    });
    let base = positive_snapshot(&config);
    let mut net = Network::from_snapshot(fx.device.clone(), config, &base).unwrap();

    let before = fx.loss(&mut net, &base);
    let e = net.forward(fx.input, W, H, &[]).unwrap();
    let done = net
        .backpropagate(fx.input, fx.expected, W, H, 0.0, &[e])
        .unwrap();
    let updated = net.update_parameters(1, &[done]).unwrap();
    fx.device.wait(&[updated]).unwrap();

    let stepped = net.snapshot().unwrap();
    let after = fx.loss(&mut net, &stepped);
    assert!(after < before, "{} !< {}", after, before);
}
