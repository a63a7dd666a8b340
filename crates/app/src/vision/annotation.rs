use anyhow::{Result, anyhow};
use image::{Rgb, RgbImage};

use crate::vision::data::DetectionSummary;
use video_ingest::Frame;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const RETICLE_COLOR: Rgb<u8> = Rgb([255, 128, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
const RETICLE_SIZE: i32 = 50;
const GLYPH_ADVANCE: i32 = 6;

/// Burn boxes, labels, the centre reticle and the frame rate into a copy of
/// `frame`.
pub(crate) fn annotate_frame(
    frame: &Frame,
    summaries: &[DetectionSummary],
    stream: &str,
    fps: f32,
) -> Result<RgbImage> {
    let width = u32::try_from(frame.width).map_err(|_| anyhow!("negative frame width"))?;
    let height = u32::try_from(frame.height).map_err(|_| anyhow!("negative frame height"))?;
    let mut image = RgbImage::from_vec(width, height, bgr_to_rgb(&frame.data))
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))?;

    for summary in summaries {
        let [left, top, right, bottom] = summary.bbox.map(|v| v.round() as i32);
        draw_rectangle(&mut image, left, top, right, bottom, BOX_COLOR);
    }

    for summary in summaries {
        let label_text = format!("{} {:.0}%", summary.class, summary.score * 100.0);
        let label_x = summary.bbox[0].round() as i32;
        let label_y = (summary.bbox[1].round() as i32 - 10).max(0);
        draw_text_box(&mut image, label_x, label_y, &label_text, BOX_COLOR);
    }

    draw_reticle(&mut image, RETICLE_COLOR);

    let info = format!("{stream}  FPS {fps:.2}");
    draw_text_box(&mut image, 4, 4, &info, TEXT_COLOR);

    Ok(image)
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    output
}

/// Crosshair centred on the frame with a gap around the exact centre.
fn draw_reticle(image: &mut RgbImage, color: Rgb<u8>) {
    let cx = image.width() as i32 / 2;
    let cy = image.height() as i32 / 2;
    let half = RETICLE_SIZE / 2;
    let gap = RETICLE_SIZE / 10;
    for offset in gap..=half {
        for (x, y) in [
            (cx - offset, cy),
            (cx + offset, cy),
            (cx, cy - offset),
            (cx, cy + offset),
        ] {
            put_pixel(image, x, y, color);
        }
    }
    draw_rectangle(image, cx - 1, cy - 1, cx + 1, cy + 1, color);
}

fn draw_text_box(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let text_width = text.chars().count() as i32 * GLYPH_ADVANCE;
    fill_rect(image, x, y, x + text_width + 1, y + 8, LABEL_BACKGROUND);
    draw_label(image, x + 1, y + 1, text, color);
}

fn put_pixel(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        *image.get_pixel_mut(x as u32, y as u32) = color;
    }
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 {
        return;
    }
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for x in left..=right {
        put_pixel(image, x, top, color);
        put_pixel(image, x, bottom, color);
    }
    for y in top..=bottom {
        put_pixel(image, left, y, color);
        put_pixel(image, right, y, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 {
        return;
    }
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for y in top..=bottom {
        for x in left..=right {
            put_pixel(image, x, y, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        put_pixel(image, x + col, y + row as i32, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let bits = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b11011, 0b10001],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ':' => [0, 0b00110, 0b00110, 0, 0b00110, 0b00110, 0],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        '/' => [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(bits)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use video_ingest::FrameFormat;

    use super::*;

    fn blank_frame(width: i32, height: i32) -> Frame {
        Frame {
            data: vec![0; (width * height * 3) as usize],
            width,
            height,
            timestamp_ms: 0,
            captured_at: Instant::now(),
            format: FrameFormat::Bgr8,
        }
    }

    #[test]
    fn channels_are_swapped_to_rgb() {
        let mut frame = blank_frame(1, 1);
        frame.data = vec![10, 20, 30];
        let image = RgbImage::from_vec(1, 1, bgr_to_rgb(&frame.data)).unwrap();
        assert_eq!(image.get_pixel(0, 0), &Rgb([30, 20, 10]));
    }

    #[test]
    fn boxes_and_reticle_are_drawn() {
        let frame = blank_frame(200, 120);
        let summary = DetectionSummary {
            class: "target".into(),
            class_id: 0,
            score: 0.9,
            bbox: [20.0, 40.0, 60.0, 80.0],
        };
        let image = annotate_frame(&frame, &[summary], "cam0", 12.5).unwrap();
        assert_eq!(image.get_pixel(40, 80), &BOX_COLOR);
        assert_eq!(image.get_pixel(60, 60), &BOX_COLOR);
        assert_eq!(image.get_pixel(100 + 20, 60), &RETICLE_COLOR);
        assert_eq!(image.get_pixel(100, 60 - 20), &RETICLE_COLOR);
    }

    #[test]
    fn out_of_frame_boxes_are_clamped() {
        let frame = blank_frame(16, 16);
        let summary = DetectionSummary {
            class: "x".into(),
            class_id: 1,
            score: 0.5,
            bbox: [-40.0, -40.0, 400.0, 400.0],
        };
        let image = annotate_frame(&frame, &[summary], "cam0", 0.0).unwrap();
        assert_eq!(image.get_pixel(15, 15), &BOX_COLOR);
    }

    #[test]
    fn mismatched_buffer_is_an_error() {
        let mut frame = blank_frame(4, 4);
        frame.data.truncate(10);
        assert!(annotate_frame(&frame, &[], "cam0", 0.0).is_err());
    }
}
