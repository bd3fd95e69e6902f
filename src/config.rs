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

//! Run configuration, read once from a JSON file.
//!
//! ```json
//! {
//!   "n1": 64, "n2": 32,
//!   "f1": 9, "f2": 1, "f3": 5,
//!   "learning_rate": 0.0001,
//!   "weight_decay": 0.0001,
//!   "validation_percent": 20,
//!   "checkpoint_every": 200
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cnn::LayerSpec;
use crate::error::{Error, Result};

fn default_output_scale() -> f32 {
    1.0
}

fn default_validation_percent() -> u32 {
    20
}

fn default_checkpoint_every() -> usize {
    200
}

fn default_epochs() -> usize {
    100
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("weights_tmp.json")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Filters in layer 1.
    pub n1: usize,
    /// Filters in layer 2.
    pub n2: usize,
    pub f1: usize,
    pub f2: usize,
    pub f3: usize,
    pub learning_rate: f32,
    #[serde(default, alias = "weight_decay_parameter")]
    pub weight_decay: f32,
    /// Multiplier applied to the linear response of layer 3.
    #[serde(default = "default_output_scale")]
    pub output_scale: f32,
    #[serde(default = "default_validation_percent")]
    pub validation_percent: u32,
    /// Epochs between parameter snapshots.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Initial parameters; random initialisation when absent.
    #[serde(default)]
    pub parameters_file: Option<PathBuf>,
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            n1: 64,
            n2: 32,
            f1: 9,
            f2: 1,
            f3: 5,
            learning_rate: 1e-4,
            weight_decay: 0.0,
            output_scale: default_output_scale(),
            validation_percent: default_validation_percent(),
            checkpoint_every: default_checkpoint_every(),
            epochs: default_epochs(),
            parameters_file: None,
            checkpoint_path: default_checkpoint_path(),
            seed: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let mut cfg = Self::from_json(&text)?;
        // relative parameter files are resolved against the config location
        if let (Some(file), Some(dir)) = (cfg.parameters_file.as_mut(), path.parent()) {
            if file.is_relative() {
                *file = dir.join(&*file);
            }
        }
        Ok(cfg)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Config =
            serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |m: String| Err(Error::Config(m));
        for (name, v) in [("f1", self.f1), ("f2", self.f2), ("f3", self.f3)] {
            if v == 0 {
                return fail(format!("{} must be at least 1", name));
            }
        }
        if self.n1 == 0 || self.n2 == 0 {
            return fail("filter counts n1/n2 must be at least 1".into());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return fail(format!("learning_rate {} is not positive", self.learning_rate));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return fail(format!("weight_decay {} is negative", self.weight_decay));
        }
        if !self.output_scale.is_finite() || self.output_scale == 0.0 {
            return fail(format!("output_scale {} is unusable", self.output_scale));
        }
        if self.validation_percent >= 100 {
            return fail("validation_percent must be below 100".into());
        }
        if self.checkpoint_every == 0 {
            return fail("checkpoint_every must be at least 1".into());
        }
        Ok(())
    }

    /// Pixels lost per dimension across the three valid convolutions.
    pub fn total_padding(&self) -> usize {
        (self.f1 - 1) + (self.f2 - 1) + (self.f3 - 1)
    }

    pub fn layer_specs(&self) -> [LayerSpec; 3] {
        [
            LayerSpec::hidden(self.f1, 1, self.n1),
            LayerSpec::hidden(self.f2, self.n1, self.n2),
            LayerSpec::output(self.f3, self.n2, self.output_scale),
        ]
    }

    /// Network output size for a `w x h` input, `None` when the input is
    /// smaller than the receptive field.
    pub fn output_size(&self, w: usize, h: usize) -> Option<(usize, usize)> {
        let pad = self.total_padding();
        if w <= pad || h <= pad {
            return None;
        }
        Some((w - pad, h - pad))
    }
}
