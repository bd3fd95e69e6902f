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

//! Image decoding, luma extraction and result image assembly.

use std::path::Path;

use image::{Rgb, RgbImage};
use log::debug;

use crate::device::{BufferId, Device, Event, Kernel};
use crate::error::{shape, Error, Result};

const CHANNELS: usize = 3;

/// Decoded RGB pixels kept on the host.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub width: usize,
    pub height: usize,
    pub bytes_per_pixel: usize,
    pub pixels: Vec<u8>,
}

impl ImageData {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let img = image::open(path).map_err(|e| Error::image(path, e))?.to_rgb8();
        let (w, h) = img.dimensions();
        if w == 0 || h == 0 {
            return Err(shape(&format!("{} is empty", path.display())));
        }
        Ok(Self {
            width: w as usize,
            height: h as usize,
            bytes_per_pixel: CHANNELS,
            pixels: img.into_raw(),
        })
    }

    pub fn from_rgb(width: usize, height: usize, pixels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 || pixels.len() != width * height * CHANNELS {
            return Err(shape(&format!(
                "{} bytes do not form a {}x{} RGB image",
                pixels.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            bytes_per_pixel: CHANNELS,
            pixels,
        })
    }

    fn rgb(&self, x: usize, y: usize) -> [f32; 3] {
        let i = (y * self.width + x) * self.bytes_per_pixel;
        [
            self.pixels[i] as f32,
            self.pixels[i + 1] as f32,
            self.pixels[i + 2] as f32,
        ]
    }
}

/// An image uploaded to the device with its luma channel being extracted.
pub struct PreparedImage {
    pub image: ImageData,
    /// Interleaved pixels; only needed until `event` completes.
    pub pixels: BufferId,
    /// `width x height` luma in `[0, 1]`.
    pub luma: BufferId,
    pub event: Event,
}

/// Uploads `image` and queues luma extraction.
pub fn upload(device: &dyn Device, image: ImageData) -> Result<PreparedImage> {
    let data: Vec<f32> = image.pixels.iter().map(|&b| b as f32).collect();
    let (pixels, written) = device.upload(&data)?;
    let luma = device.allocate(image.width * image.height)?;
    let event = device.launch(
        Kernel::ExtractLuma {
            pixels,
            luma,
            width: image.width,
            height: image.height,
            bytes_per_pixel: image.bytes_per_pixel,
        },
        &[written],
    )?;
    Ok(PreparedImage {
        image,
        pixels,
        luma,
        event,
    })
}

pub fn prepare(device: &dyn Device, path: impl AsRef<Path>) -> Result<PreparedImage> {
    let path = path.as_ref();
    let image = ImageData::open(path)?;
    debug!("loaded {} ({}x{})", path.display(), image.width, image.height);
    upload(device, image)
}

/// Shifts `count` luma values to zero mean. The mean is reduced on the
/// device and read back, so this blocks on `deps`.
pub fn subtract_mean(
    device: &dyn Device,
    luma: BufferId,
    count: usize,
    deps: &[Event],
) -> Result<Event> {
    if count == 0 {
        return Err(shape("mean of an empty buffer"));
    }
    let scalar = device.allocate(1)?;
    let summed = device.launch(
        Kernel::Sum {
            input: luma,
            count,
            out: scalar,
            slot: 0,
        },
        deps,
    )?;
    let total = device.read(scalar, &[summed])?[0];
    device.release(scalar)?;
    let mean = total / count as f32;
    device.launch(
        Kernel::AddScalar {
            buffer: luma,
            count,
            value: -mean,
        },
        &[summed],
    )
}

/// Combines predicted luma (`[0, 1]`, `width x height`) with the chroma of
/// the centred window of `source`.
pub fn compose_result(
    source: &ImageData,
    luma: &[f32],
    width: usize,
    height: usize,
) -> Result<RgbImage> {
    if width > source.width || height > source.height || luma.len() < width * height {
        return Err(shape(&format!(
            "{}x{} result does not fit a {}x{} source",
            width, height, source.width, source.height
        )));
    }
    let left = (source.width - width) / 2;
    let top = (source.height - height) / 2;

    let mut out = RgbImage::new(width as u32, height as u32);
    for y in 0..height {
        for x in 0..width {
            let [r, g, b] = source.rgb(x + left, y + top);
            let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
            let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
            let luma = luma[y * width + x] * 255.0;
            let px = [
                luma + 1.402 * (cr - 128.0),
                luma - 0.344_136 * (cb - 128.0) - 0.714_136 * (cr - 128.0),
                luma + 1.772 * (cb - 128.0),
            ];
            out.put_pixel(x as u32, y as u32, Rgb(px.map(|v| v.round().clamp(0.0, 255.0) as u8)));
        }
    }
    Ok(out)
}

pub fn save_result(image: &RgbImage, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    image.save(path).map_err(|e| Error::image(path, e))
}
