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

use std::fs;
use std::io::Write;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use super::types::{LayerParameters, LayerSpec};
use crate::error::{Error, Result};

/// Host copy of every trainable parameter, layers in network order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    pub layers: [LayerParameters; 3],
}

impl ParameterSnapshot {
    pub fn zeros(specs: &[LayerSpec; 3]) -> Self {
        Self {
            layers: [
                LayerParameters::zeros(&specs[0]),
                LayerParameters::zeros(&specs[1]),
                LayerParameters::zeros(&specs[2]),
            ],
        }
    }

    pub fn validate(&self, specs: &[LayerSpec; 3]) -> Result<()> {
        for (i, (params, spec)) in self.layers.iter().zip(specs).enumerate() {
            if !params.matches(spec) {
                return Err(Error::Format(format!(
                    "layer {} has {} weights and {} biases, expected {} and {}",
                    i + 1,
                    params.weights.len(),
                    params.bias.len(),
                    spec.weight_len(),
                    spec.filter_count
                )));
            }
        }
        self.check_finite()
    }

    /// Fails on the first layer holding a NaN or infinity.
    pub fn check_finite(&self) -> Result<()> {
        for (i, params) in self.layers.iter().enumerate() {
            if params
                .weights
                .iter()
                .chain(&params.bias)
                .any(|v| !v.is_finite())
            {
                return Err(Error::Format(format!("layer {} holds non-finite values", i + 1)));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Format(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Format(e.to_string()))
    }

    /// Writes through a sibling temporary file so a crash never leaves a
    /// half-written parameter file behind.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.check_finite()?;
        let json = self.to_json()?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".part");
        let tmp = Path::new(&tmp);

        let mut file = fs::File::create(tmp).map_err(|e| Error::io(tmp, e))?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| Error::io(tmp, e))?;
        fs::rename(tmp, path).map_err(|e| Error::io(path, e))?;
        debug!("parameters written to {}", path.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn small_config() -> Config {
        Config {
            n1: 2,
            n2: 2,
            f1: 3,
            f2: 1,
            f3: 3,
            ..Config::default()
        }
    }

    #[test]
    fn file_round_trip_is_exact() {
        let specs = small_config().layer_specs();
        let mut snapshot = ParameterSnapshot::zeros(&specs);
        for (i, w) in snapshot.layers[0].weights.iter_mut().enumerate() {
            *w = (i as f32 * 0.1).sin() / 3.0;
        }
        snapshot.layers[2].bias[0] = -1.0e-7;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        snapshot.save(&path).unwrap();
        let loaded = ParameterSnapshot::load(&path).unwrap();
        assert_eq!(loaded, snapshot);
        loaded.validate(&specs).unwrap();
    }

    #[test]
    fn validate_rejects_wrong_lengths() {
        let specs = small_config().layer_specs();
        let mut snapshot = ParameterSnapshot::zeros(&specs);
        snapshot.layers[1].bias.push(0.0);
        assert!(matches!(snapshot.validate(&specs), Err(Error::Format(_))));
    }

    #[test]
    fn non_finite_parameters_are_never_written() {
        let specs = small_config().layer_specs();
        let mut snapshot = ParameterSnapshot::zeros(&specs);
        snapshot.layers[0].weights[3] = f32::NAN;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        assert!(matches!(snapshot.save(&path), Err(Error::Format(_))));
        assert!(!path.exists());
        assert!(matches!(snapshot.validate(&specs), Err(Error::Format(_))));
    }

    #[test]
    fn malformed_json_is_a_format_error() {
        assert!(matches!(
            ParameterSnapshot::from_json(r#"{"layers": [1, 2]}"#),
            Err(Error::Format(_))
        ));
    }
}
