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

use std::fs;
use std::path::Path;
use std::sync::Arc;

use approx::assert_abs_diff_eq;
use image::{Rgb, RgbImage};

use common::{cpu, rng, small_config};
use srcnn::cnn::Network;
use srcnn::preprocess;
use srcnn::samples::{discover_pairs, SampleStore};
use srcnn::trainer::{make_rng, TrainOptions, Trainer};
use srcnn::Error;

fn write_image(path: &Path, w: u32, h: u32, seed: u32) {
    RgbImage::from_fn(w, h, |x, y| {
        let v = ((x * 31 + y * 17 + seed * 7) % 256) as u8;
        Rgb([v, v.wrapping_mul(3), 255 - v])
    })
    .save(path)
    .unwrap();
}

#[test]
fn loads_valid_pairs_and_skips_broken_ones() {
    let dir = tempfile::tempdir().unwrap();
    let d = dir.path();
    write_image(&d.join("a_small.png"), 12, 10, 1);
    write_image(&d.join("a_large.png"), 12, 10, 2);
    // size mismatch
    write_image(&d.join("b_small.png"), 12, 10, 3);
    write_image(&d.join("b_large.png"), 10, 10, 4);
    // undecodable
    fs::write(d.join("c_small.png"), b"not a png").unwrap();
    write_image(&d.join("c_large.png"), 12, 10, 5);
    // below the receptive field
    write_image(&d.join("d_small.png"), 4, 4, 6);
    write_image(&d.join("d_large.png"), 4, 4, 7);

    let config = small_config();
    let pairs = discover_pairs(d).unwrap();
    assert_eq!(pairs.len(), 4);

    let device = cpu();
    let store = SampleStore::load(device.clone(), &config, &pairs).unwrap();
    assert_eq!(store.len(), 1);
    let sample = &store.samples()[0];
    assert_eq!(sample.name, "a");
    assert_eq!((sample.width, sample.height), (12, 10));
    assert_eq!(device.buffer_len(sample.expected).unwrap(), 8 * 6);

    let input = device.read(sample.input, &[]).unwrap();
    assert_eq!(input.len(), 12 * 10);
    assert_abs_diff_eq!(input.iter().sum::<f32>() / 120.0, 0.0, epsilon = 1e-5);
    let expected = device.read(sample.expected, &[]).unwrap();
    assert!(expected.iter().all(|v| (0.0..=1.0).contains(v)));
}

#[test]
fn nothing_loadable_is_insufficient_data() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("x_small.png"), b"junk").unwrap();
    fs::write(dir.path().join("x_large.png"), b"junk").unwrap();
    let pairs = discover_pairs(dir.path()).unwrap();
    let result = SampleStore::load(cpu(), &small_config(), &pairs);
    assert!(matches!(result, Err(Error::InsufficientData(_))));
}

#[test]
fn dropping_the_store_releases_sample_buffers() {
    let dir = tempfile::tempdir().unwrap();
    write_image(&dir.path().join("a_small.png"), 9, 9, 1);
    write_image(&dir.path().join("a_large.png"), 9, 9, 2);
    let pairs = discover_pairs(dir.path()).unwrap();

    let device = Arc::new(srcnn::device::CpuDevice::new());
    let store = SampleStore::load(device.clone(), &small_config(), &pairs).unwrap();
    assert_eq!(device.live_buffers(), 2);
    drop(store);
    assert_eq!(device.live_buffers(), 0);
}

#[test]
fn trains_on_images_and_composes_a_result() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..3 {
        write_image(&dir.path().join(format!("s{}_small.png", i)), 11, 9, i);
        write_image(&dir.path().join(format!("s{}_large.png", i)), 11, 9, i + 10);
    }
    let config = Arc::new(small_config());
    let device = cpu();
    let pairs = discover_pairs(dir.path()).unwrap();
    let samples = SampleStore::load(device.clone(), &config, &pairs).unwrap();
    let mut net = Network::new(device.clone(), config.clone(), &mut rng(1)).unwrap();
    let outcome = Trainer::new(&mut net, &samples, config.clone(), make_rng(Some(2)))
        .run(&TrainOptions {
            epochs: 2,
            dry: true,
            output: None,
        })
        .unwrap();
    assert_eq!(outcome.epochs_completed, 2);

    let prepared = preprocess::prepare(device.as_ref(), dir.path().join("s0_small.png")).unwrap();
    let centred =
        preprocess::subtract_mean(device.as_ref(), prepared.luma, 11 * 9, &[prepared.event]).unwrap();
    let e = net.forward(prepared.luma, 11, 9, &[centred]).unwrap();
    let luma = net.read_output(&[e]).unwrap();
    let image = preprocess::compose_result(&prepared.image, &luma, 7, 5).unwrap();
    assert_eq!(image.dimensions(), (7, 5));

    let out = dir.path().join("result.png");
    preprocess::save_result(&image, &out).unwrap();
    assert_eq!(image::open(&out).unwrap().to_rgb8(), image);
}
