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

//! Training sample discovery and the device-resident sample store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use image::ImageFormat;
use log::{info, warn};

use crate::config::Config;
use crate::device::{BufferId, Device, Kernel, SharedDevice};
use crate::error::{shape, Error, Result};
use crate::preprocess;

const INPUT_SUFFIX: &str = "_small";
const EXPECTED_SUFFIX: &str = "_large";

/// Files of one training example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePair {
    pub name: String,
    /// Network input (`<name>_small.<ext>`).
    pub input: PathBuf,
    /// Target image (`<name>_large.<ext>`).
    pub expected: PathBuf,
}

#[derive(Default)]
struct PartialPair {
    input: Option<PathBuf>,
    expected: Option<PathBuf>,
}

/// Pairs `<name>_small.<ext>` with `<name>_large.<ext>` in `dir`, sorted by
/// name. Unpaired and non-image files are skipped with a warning.
pub fn discover_pairs(dir: impl AsRef<Path>) -> Result<Vec<SamplePair>> {
    let dir = dir.as_ref();
    let entries = fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;

    let mut by_name: BTreeMap<String, PartialPair> = BTreeMap::new();
    for entry in entries {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        if !path.is_file() {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        if ImageFormat::from_path(&path).is_err() {
            warn!("'{}' is not an image, skipping", path.display());
            continue;
        }
        if let Some(name) = stem.strip_suffix(INPUT_SUFFIX) {
            by_name.entry(name.to_string()).or_default().input = Some(path);
        } else if let Some(name) = stem.strip_suffix(EXPECTED_SUFFIX) {
            by_name.entry(name.to_string()).or_default().expected = Some(path);
        } else {
            warn!(
                "'{}' is neither a {} nor a {} image, skipping",
                path.display(),
                INPUT_SUFFIX,
                EXPECTED_SUFFIX
            );
        }
    }

    let mut pairs = Vec::with_capacity(by_name.len());
    for (name, partial) in by_name {
        match (partial.input, partial.expected) {
            (Some(input), Some(expected)) => pairs.push(SamplePair {
                name,
                input,
                expected,
            }),
            _ => warn!("only one image for sample '{}', skipping", name),
        }
    }
    Ok(pairs)
}

/// One training example on the device.
#[derive(Debug, Clone)]
pub struct Sample {
    pub name: String,
    /// Mean-subtracted input luma, `width x height`.
    pub input: BufferId,
    /// Target luma cropped to the network output window.
    pub expected: BufferId,
    pub width: usize,
    pub height: usize,
}

impl Sample {
    pub fn output_pixels(&self, config: &Config) -> usize {
        config
            .output_size(self.width, self.height)
            .map_or(0, |(w, h)| w * h)
    }
}

/// Owns every loaded sample's device buffers.
pub struct SampleStore {
    device: SharedDevice,
    samples: Vec<Sample>,
}

impl SampleStore {
    pub fn new(device: SharedDevice) -> Self {
        Self {
            device,
            samples: Vec::new(),
        }
    }

    /// Loads every pair, logging and skipping the ones that fail.
    pub fn load(device: SharedDevice, config: &Config, pairs: &[SamplePair]) -> Result<Self> {
        let mut store = Self::new(device);
        for pair in pairs {
            if let Err(e) = store.add(config, pair) {
                warn!("skipping sample '{}': {}", pair.name, e);
            }
        }
        if store.is_empty() {
            return Err(Error::InsufficientData(format!(
                "none of {} sample pairs could be loaded",
                pairs.len()
            )));
        }
        info!("loaded {} of {} samples", store.len(), pairs.len());
        Ok(store)
    }

    pub fn add(&mut self, config: &Config, pair: &SamplePair) -> Result<()> {
        let device = self.device.as_ref();
        let mut scratch = Vec::new();
        let mut kept = Vec::new();
        let res = build_sample(device, config, pair, &mut scratch, &mut kept);
        if res.is_err() {
            scratch.append(&mut kept);
        }
        for id in scratch {
            if let Err(e) = device.release(id) {
                warn!("failed to release sample buffer {}: {}", id, e);
            }
        }
        self.samples.push(res?);
        Ok(())
    }

    /// Adds a sample from host luma planes: `input` is `width x height` and
    /// gets mean-subtracted, `expected` is already the output window.
    pub fn add_luma(
        &mut self,
        config: &Config,
        name: &str,
        input: &[f32],
        expected: &[f32],
        width: usize,
        height: usize,
    ) -> Result<()> {
        let (out_w, out_h) = config.output_size(width, height).ok_or_else(|| {
            shape(&format!(
                "{}x{} is smaller than the network's receptive field",
                width, height
            ))
        })?;
        if input.len() != width * height || expected.len() != out_w * out_h {
            return Err(shape(&format!(
                "sample '{}' needs {} input and {} expected values, got {} and {}",
                name,
                width * height,
                out_w * out_h,
                input.len(),
                expected.len()
            )));
        }
        let device = self.device.as_ref();
        let (input_id, written) = device.upload(input)?;
        let (expected_id, expected_written) = device.upload(expected)?;
        let centred = preprocess::subtract_mean(device, input_id, width * height, &[written])?;
        device.wait(&[centred, expected_written])?;
        self.samples.push(Sample {
            name: name.to_string(),
            input: input_id,
            expected: expected_id,
            width,
            height,
        });
        Ok(())
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        let device = self.device.as_ref();
        for s in self.samples.drain(..) {
            for id in [s.input, s.expected] {
                if let Err(e) = device.release(id) {
                    warn!("failed to release sample buffer {}: {}", id, e);
                }
            }
        }
    }
}

impl Drop for SampleStore {
    fn drop(&mut self) {
        self.clear();
    }
}

fn build_sample(
    device: &dyn Device,
    config: &Config,
    pair: &SamplePair,
    scratch: &mut Vec<BufferId>,
    kept: &mut Vec<BufferId>,
) -> Result<Sample> {
    let expected = preprocess::prepare(device, &pair.expected)?;
    scratch.extend([expected.pixels, expected.luma]);
    let input = preprocess::prepare(device, &pair.input)?;
    scratch.push(input.pixels);
    kept.push(input.luma);

    let (w, h) = (input.image.width, input.image.height);
    if (expected.image.width, expected.image.height) != (w, h) {
        return Err(shape(&format!(
            "input is {}x{} but expected output is {}x{}",
            w, h, expected.image.width, expected.image.height
        )));
    }
    let (out_w, out_h) = config.output_size(w, h).ok_or_else(|| {
        shape(&format!(
            "{}x{} is smaller than the network's receptive field",
            w, h
        ))
    })?;

    let centred = preprocess::subtract_mean(device, input.luma, w * h, &[input.event])?;

    let cropped = device.allocate(out_w * out_h)?;
    kept.push(cropped);
    let pad = config.total_padding();
    let crop = device.launch(
        Kernel::Crop {
            src: expected.luma,
            src_width: w,
            src_height: h,
            dst: cropped,
            left: pad / 2,
            top: pad / 2,
            width: out_w,
            height: out_h,
        },
        &[expected.event],
    )?;
    device.wait(&[centred, crop])?;

    Ok(Sample {
        name: pair.name.clone(),
        input: input.luma,
        expected: cropped,
        width: w,
        height: h,
    })
}
