use std::io::Cursor;

use loader_core::{fit_within, Bitmap, Renderer};

struct DecodedImage {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
}

/// Renders PNG payloads. PNG carries no embedded thumbnail, so the fast
/// preview is a nearest-neighbour sketch at half the preview size and the
/// refined preview a box-filtered downscale at full preview size.
pub struct PngRenderer;

impl Renderer for PngRenderer {
    fn render_preview(
        &self,
        payload: &[u8],
        max_dimension: u32,
        allow_embedded: bool,
    ) -> Option<Bitmap> {
        let image = decode(payload)?;
        if allow_embedded {
            let (width, height) =
                fit_within(image.width, image.height, (max_dimension / 2).max(1));
            Some(nearest(&image, width, height))
        } else {
            let (width, height) = fit_within(image.width, image.height, max_dimension);
            Some(box_filter(&image, width, height))
        }
    }

    fn render_final(&self, payload: &[u8]) -> Option<Bitmap> {
        let image = decode(payload)?;
        Some(Bitmap::new(image.width, image.height, image.rgba))
    }
}

fn decode(payload: &[u8]) -> Option<DecodedImage> {
    match decode_png(payload) {
        Ok(image) => Some(image),
        Err(err) => {
            log::debug!("png decode failed: {}", err);
            None
        }
    }
}

fn decode_png(bytes: &[u8]) -> Result<DecodedImage, String> {
    let mut decoder = png::Decoder::new(Cursor::new(bytes));
    decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
    let mut reader = decoder.read_info().map_err(|err| err.to_string())?;
    let mut buf = vec![0; reader.output_buffer_size()];
    let output = reader.next_frame(&mut buf).map_err(|err| err.to_string())?;
    let bytes = &buf[..output.buffer_size()];
    let pixels = output.width as usize * output.height as usize;
    let rgba = match output.color_type {
        png::ColorType::Rgba => bytes.to_vec(),
        png::ColorType::Rgb => {
            let mut out = Vec::with_capacity(pixels * 4);
            for chunk in bytes.chunks_exact(3) {
                out.extend_from_slice(&[chunk[0], chunk[1], chunk[2], 255]);
            }
            out
        }
        png::ColorType::Grayscale => {
            let mut out = Vec::with_capacity(pixels * 4);
            for value in bytes {
                out.extend_from_slice(&[*value, *value, *value, 255]);
            }
            out
        }
        png::ColorType::GrayscaleAlpha => {
            let mut out = Vec::with_capacity(pixels * 4);
            for chunk in bytes.chunks_exact(2) {
                out.extend_from_slice(&[chunk[0], chunk[0], chunk[0], chunk[1]]);
            }
            out
        }
        other => return Err(format!("unsupported png color type {:?}", other)),
    };
    Ok(DecodedImage {
        width: output.width,
        height: output.height,
        rgba,
    })
}

fn nearest(image: &DecodedImage, width: u32, height: u32) -> Bitmap {
    let mut out = Vec::with_capacity(width as usize * height as usize * 4);
    for y in 0..height {
        let src_y = (u64::from(y) * u64::from(image.height) / u64::from(height)) as usize;
        for x in 0..width {
            let src_x = (u64::from(x) * u64::from(image.width) / u64::from(width)) as usize;
            let offset = (src_y * image.width as usize + src_x) * 4;
            out.extend_from_slice(&image.rgba[offset..offset + 4]);
        }
    }
    Bitmap::new(width, height, out)
}

fn box_filter(image: &DecodedImage, width: u32, height: u32) -> Bitmap {
    let mut out = Vec::with_capacity(width as usize * height as usize * 4);
    for y in 0..height {
        let y0 = (u64::from(y) * u64::from(image.height) / u64::from(height)) as usize;
        let y1 = ((u64::from(y + 1) * u64::from(image.height) / u64::from(height)) as usize)
            .max(y0 + 1);
        for x in 0..width {
            let x0 = (u64::from(x) * u64::from(image.width) / u64::from(width)) as usize;
            let x1 = ((u64::from(x + 1) * u64::from(image.width) / u64::from(width)) as usize)
                .max(x0 + 1);
            let mut sum = [0u64; 4];
            for sy in y0..y1 {
                let row = sy * image.width as usize;
                for sx in x0..x1 {
                    let offset = (row + sx) * 4;
                    for (channel, total) in sum.iter_mut().enumerate() {
                        *total += u64::from(image.rgba[offset + channel]);
                    }
                }
            }
            let count = ((y1 - y0) * (x1 - x0)) as u64;
            for total in sum {
                out.push((total / count) as u8);
            }
        }
    }
    Bitmap::new(width, height, out)
}
