//! CPU frame annotator: boxes, identifier labels, and the unavailable
//! placeholder banner. Pure pixel work; no engine or transport coupling.

use anyhow::{Result, anyhow};
use bytes::Bytes;
use image::{ImageBuffer, Rgb, codecs::jpeg::JpegEncoder};
use video_source::Frame;

use crate::data::AnnotatedFrame;
use crate::invoker::EngineOutput;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_BACKDROP: Rgb<u8> = Rgb([0, 0, 0]);
const BANNER_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const JPEG_QUALITY: u8 = 80;

type Canvas = ImageBuffer<Rgb<u8>, Vec<u8>>;

/// Draw the engine output onto a copy of the frame and encode it.
/// Boxes are drawn first, then labels, so a label is never occluded by
/// a neighbouring box edge.
pub(crate) fn annotate(frame: &Frame, output: &EngineOutput) -> Result<AnnotatedFrame> {
    let width = frame.width as u32;
    let height = frame.height as u32;
    let mut image = Canvas::from_vec(width, height, bgr_to_rgb(&frame.data))
        .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;

    for bbox in &output.boxes {
        draw_rectangle(&mut image, bbox[0], bbox[1], bbox[2], bbox[3], BOX_COLOR);
    }

    if let Some(ids) = &output.ids {
        for (bbox, id) in output.boxes.iter().zip(ids) {
            let label = format!("ID {id}");
            let label_x = bbox[0];
            let label_y = (bbox[1] - 12).max(0);
            let text_width = label.chars().count() as i32 * 6;
            fill_rect(
                &mut image,
                label_x,
                label_y,
                label_x + text_width,
                label_y + 8,
                LABEL_BACKDROP,
            );
            draw_label(&mut image, label_x, label_y, &label, BOX_COLOR);
        }
    }

    finalize(image)
}

/// Dark frame with a centred "SOURCE UNAVAILABLE" banner, published at
/// placeholder cadence while the live source is down.
pub(crate) fn placeholder(width: i32, height: i32) -> Result<AnnotatedFrame> {
    let frame = video_source::placeholder_frame(width, height);
    let mut image = Canvas::from_vec(
        frame.width as u32,
        frame.height as u32,
        bgr_to_rgb(&frame.data),
    )
    .ok_or_else(|| anyhow!("placeholder buffer does not match its dimensions"))?;

    let banner = "SOURCE UNAVAILABLE";
    let text_width = banner.chars().count() as i32 * 6;
    let x = ((width - text_width) / 2).max(0);
    let y = ((height - 7) / 2).max(0);
    draw_label(&mut image, x, y, banner, BANNER_COLOR);

    finalize(image)
}

fn finalize(image: Canvas) -> Result<AnnotatedFrame> {
    let width = image.width();
    let height = image.height();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(AnnotatedFrame {
        width,
        height,
        rgb: Bytes::from(image.into_raw()),
        jpeg: Bytes::from(jpeg),
    })
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.push(chunk[2]);
        output.push(chunk[1]);
        output.push(chunk[0]);
    }
    output
}

fn draw_rectangle(image: &mut Canvas, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for x in left..=right {
        *image.get_pixel_mut(x as u32, top as u32) = color;
        *image.get_pixel_mut(x as u32, bottom as u32) = color;
    }
    for y in top..=bottom {
        *image.get_pixel_mut(left as u32, y as u32) = color;
        *image.get_pixel_mut(right as u32, y as u32) = color;
    }
}

fn fill_rect(image: &mut Canvas, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for y in top..=bottom {
        for x in left..=right {
            *image.get_pixel_mut(x as u32, y as u32) = color;
        }
    }
}

fn draw_label(image: &mut Canvas, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col as i32;
                        if px >= 0 && px < image.width() as i32 {
                            *image.get_pixel_mut(px as u32, py as u32) = color;
                        }
                    }
                }
            }
        }
        x += 6;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        'A' => Some([
            0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001,
        ]),
        'B' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110,
        ]),
        'C' => Some([
            0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110,
        ]),
        'D' => Some([
            0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110,
        ]),
        'E' => Some([
            0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111,
        ]),
        'I' => Some([
            0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110,
        ]),
        'L' => Some([
            0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111,
        ]),
        'N' => Some([
            0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001,
        ]),
        'O' => Some([
            0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110,
        ]),
        'R' => Some([
            0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001,
        ]),
        'S' => Some([
            0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110,
        ]),
        'U' => Some([
            0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110,
        ]),
        'V' => Some([
            0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b01010, 0b00100,
        ]),
        '0' => Some([
            0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110,
        ]),
        '1' => Some([
            0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110,
        ]),
        '2' => Some([
            0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111,
        ]),
        '3' => Some([
            0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110,
        ]),
        '4' => Some([
            0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010,
        ]),
        '5' => Some([
            0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110,
        ]),
        '6' => Some([
            0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110,
        ]),
        '7' => Some([
            0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000,
        ]),
        '8' => Some([
            0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110,
        ]),
        '9' => Some([
            0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100,
        ]),
        ' ' => Some([0, 0, 0, 0, 0, 0, 0]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: i32, height: i32, bgr: [u8; 3]) -> Frame {
        let mut frame = video_source::placeholder_frame(width, height);
        for chunk in frame.data.chunks_exact_mut(3) {
            chunk.copy_from_slice(&bgr);
        }
        frame
    }

    #[test]
    fn annotation_never_mutates_the_input_frame() {
        let frame = solid_frame(64, 48, [10, 20, 30]);
        let before = frame.data.clone();
        let output = EngineOutput {
            boxes: vec![[5, 5, 30, 30]],
            ids: Some(vec![1]),
        };
        annotate(&frame, &output).unwrap();
        assert_eq!(frame.data, before);
    }

    #[test]
    fn box_edges_are_painted_green() {
        let frame = solid_frame(64, 48, [0, 0, 0]);
        let output = EngineOutput {
            boxes: vec![[10, 20, 40, 40]],
            ids: None,
        };
        let annotated = annotate(&frame, &output).unwrap();
        // rgb is row-major RGB8; check the top-left corner of the box.
        let idx = (20 * 64 + 10) * 3;
        assert_eq!(&annotated.rgb[idx..idx + 3], &[0, 255, 0]);
    }

    #[test]
    fn jpeg_output_is_well_formed() {
        let frame = solid_frame(32, 32, [128, 128, 128]);
        let annotated = annotate(&frame, &EngineOutput::default()).unwrap();
        assert_eq!(&annotated.jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&annotated.jpeg[annotated.jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn placeholder_carries_the_banner() {
        let annotated = placeholder(640, 360).unwrap();
        assert_eq!(annotated.width, 640);
        assert_eq!(annotated.height, 360);
        // The banner paints white pixels on the otherwise uniform shade.
        assert!(annotated.rgb.iter().any(|&px| px == 255));
    }

    #[test]
    fn every_banner_character_has_a_glyph() {
        for ch in "SOURCE UNAVAILABLE ID 0123456789".chars() {
            assert!(glyph_bits(ch).is_some(), "missing glyph for {ch:?}");
        }
    }
}
