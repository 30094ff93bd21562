//! Input conversion: color images to grayscale, raw depth maps to
//! meters.

use image::GrayImage;
use std::borrow::Cow;

use crate::settings::ColorOrder;
use crate::tracking::frame::DepthImage;

/// One input image. Raw color buffers are interleaved 3- or 4-channel
/// rows in the order named by `Camera.RGB`.
pub enum ImageInput<'a> {
    Gray(&'a GrayImage),
    Color {
        data: &'a [u8],
        width: u32,
        height: u32,
        channels: u8,
    },
}

/// One input depth map, scaled to meters by `DepthMapFactor`.
pub enum DepthInput<'a> {
    F32 {
        data: &'a [f32],
        width: u32,
        height: u32,
    },
    U16 {
        data: &'a [u16],
        width: u32,
        height: u32,
    },
}

/// BT.601 luma weights, the same conversion the usual color-to-gray
/// image paths apply.
#[inline]
fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8
}

/// Convert an input image to single-channel grayscale, honoring the
/// configured channel order. Grayscale input passes through unchanged.
pub fn to_grayscale<'a>(input: &'a ImageInput<'a>, order: ColorOrder) -> Cow<'a, GrayImage> {
    match input {
        ImageInput::Gray(image) => Cow::Borrowed(*image),
        ImageInput::Color {
            data,
            width,
            height,
            channels,
        } => {
            let channels = *channels as usize;
            assert!(
                channels == 3 || channels == 4,
                "color input must have 3 or 4 channels, got {channels}"
            );
            assert!(
                data.len() >= channels * (*width as usize) * (*height as usize),
                "color buffer too small for {width}x{height}x{channels}"
            );
            let mut gray = GrayImage::new(*width, *height);
            for (i, pixel) in gray.pixels_mut().enumerate() {
                let p = &data[i * channels..i * channels + 3];
                let (r, g, b) = match order {
                    ColorOrder::Rgb => (p[0], p[1], p[2]),
                    ColorOrder::Bgr => (p[2], p[1], p[0]),
                };
                pixel.0[0] = luma(r, g, b);
            }
            Cow::Owned(gray)
        }
    }
}

/// Convert a raw depth buffer to a float depth map in meters.
pub fn to_depth_image(input: &DepthInput, scale: f64) -> DepthImage {
    match input {
        DepthInput::F32 {
            data,
            width,
            height,
        } => {
            let pixels: Vec<f32> = data.iter().map(|&d| d * scale as f32).collect();
            DepthImage::from_vec(*width, *height, pixels).expect("depth buffer size")
        }
        DepthInput::U16 {
            data,
            width,
            height,
        } => {
            let pixels: Vec<f32> = data.iter().map(|&d| d as f32 * scale as f32).collect();
            DepthImage::from_vec(*width, *height, pixels).expect("depth buffer size")
        }
    }
}
