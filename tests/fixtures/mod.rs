//! In-memory image fixtures for tests. Generated rather than checked in so
//! the suite carries no binary assets.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

fn gradient(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
        Rgba([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            128,
            255,
        ])
    }))
}

pub fn sample_png() -> Vec<u8> {
    let mut out = Vec::new();
    gradient(64, 48)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .expect("png fixture");
    out
}

pub fn sample_jpeg() -> Vec<u8> {
    let mut out = Vec::new();
    gradient(64, 48)
        .to_rgb8()
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
        .expect("jpeg fixture");
    out
}
