//! Drawing detection results onto frames.

use embedded_graphics::{
    mono_font::{ascii, MonoTextStyle},
    pixelcolor::Rgb888,
    prelude::*,
    primitives::{PrimitiveStyle, Rectangle},
    text::{Baseline, Text},
};
use image::{Rgb, RgbImage};
use moodlens_core::{Emotion, FaceRegion, Selection, StatsSnapshot};
use std::convert::Infallible;

const BOX_STROKE: u32 = 2;
const FONT_HEIGHT: u32 = 10;
const FONT_WIDTH: u32 = 6;
const LABEL_PADDING: u32 = 2;

/// A located face together with the emotion chosen for it.
#[derive(Debug, Clone, Copy)]
pub struct AnnotatedFace {
    pub region: FaceRegion,
    pub selection: Selection,
}

/// Overlay colour for each emotion.
pub fn emotion_color(emotion: Emotion) -> Rgb888 {
    match emotion {
        Emotion::Happy => Rgb888::new(255, 255, 0),
        Emotion::Sad => Rgb888::new(0, 128, 255),
        Emotion::Angry => Rgb888::new(255, 0, 0),
        Emotion::Surprise => Rgb888::new(0, 255, 255),
        Emotion::Fear => Rgb888::new(255, 0, 255),
        Emotion::Disgust => Rgb888::new(0, 255, 0),
        Emotion::Neutral => Rgb888::new(255, 255, 255),
    }
}

/// Text drawn above a face, e.g. `Happy 70%`.
pub fn face_label(selection: &Selection) -> String {
    format!("{} {:.0}%", selection.emotion, selection.confidence * 100.0)
}

/// Return a copy of `frame` with one box and one label per face, drawn in order.
///
/// With no faces the copy is pixel-identical to the input.
pub fn annotate(frame: &RgbImage, faces: &[AnnotatedFace]) -> RgbImage {
    let mut out = frame.clone();
    let mut canvas = Canvas(&mut out);

    for face in faces {
        let color = emotion_color(face.selection.emotion);
        let region = &face.region;

        infallible(
            Rectangle::new(
                Point::new(region.x as i32, region.y as i32),
                Size::new(region.width, region.height),
            )
            .into_styled(PrimitiveStyle::with_stroke(color, BOX_STROKE))
            .draw(&mut canvas),
        );

        // Label sits on a filled tab above the box, or just inside it at the top edge.
        let label = face_label(&face.selection);
        let tab_height = FONT_HEIGHT + LABEL_PADDING * 2;
        let tab_y = if region.y >= tab_height { region.y - tab_height } else { region.y };
        let tab_width = label.len() as u32 * FONT_WIDTH + LABEL_PADDING * 2;
        draw_tab(&mut canvas, region.x, tab_y, tab_width, tab_height, color);
        draw_text(&mut canvas, &label, region.x + LABEL_PADDING, tab_y + LABEL_PADDING, Rgb888::BLACK);
    }

    out
}

/// Draw the session's emotion shares in the top-left corner.
pub fn draw_stats_overlay(frame: &mut RgbImage, stats: &StatsSnapshot) {
    let mut canvas = Canvas(frame);
    let line_height = FONT_HEIGHT + LABEL_PADDING;
    let lines: Vec<String> = stats
        .percentages()
        .iter()
        .map(|(emotion, share)| format!("{:<8} {:>3.0}%", emotion.label(), share * 100.0))
        .collect();
    let width = lines.iter().map(|l| l.len() as u32).max().unwrap_or(0) * FONT_WIDTH + LABEL_PADDING * 2;
    let height = lines.len() as u32 * line_height + LABEL_PADDING;

    draw_tab(&mut canvas, 0, 0, width, height, Rgb888::new(32, 32, 32));
    for (i, line) in lines.iter().enumerate() {
        let emotion = Emotion::ALL[i];
        let y = LABEL_PADDING + i as u32 * line_height;
        draw_text(&mut canvas, line, LABEL_PADDING, y, emotion_color(emotion));
    }
}

fn draw_tab(canvas: &mut Canvas<'_>, x: u32, y: u32, width: u32, height: u32, color: Rgb888) {
    infallible(
        Rectangle::new(Point::new(x as i32, y as i32), Size::new(width, height))
            .into_styled(PrimitiveStyle::with_fill(color))
            .draw(canvas),
    );
}

fn draw_text(canvas: &mut Canvas<'_>, text: &str, x: u32, y: u32, color: Rgb888) {
    let style = MonoTextStyle::new(&ascii::FONT_6X10, color);
    infallible(Text::with_baseline(text, Point::new(x as i32, y as i32), style, Baseline::Top).draw(canvas));
}

fn infallible<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

/// `DrawTarget` over an `RgbImage`; pixels outside the image are clipped.
struct Canvas<'a>(&'a mut RgbImage);

impl OriginDimensions for Canvas<'_> {
    fn size(&self) -> Size {
        Size::new(self.0.width(), self.0.height())
    }
}

impl DrawTarget for Canvas<'_> {
    type Color = Rgb888;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let (width, height) = self.0.dimensions();
        for Pixel(point, color) in pixels {
            if point.x >= 0 && point.y >= 0 && (point.x as u32) < width && (point.y as u32) < height {
                self.0
                    .put_pixel(point.x as u32, point.y as u32, Rgb([color.r(), color.g(), color.b()]));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: u32, y: u32, w: u32, h: u32, emotion: Emotion, confidence: f32) -> AnnotatedFace {
        AnnotatedFace {
            region: FaceRegion { x, y, width: w, height: h, confidence: 0.9 },
            selection: Selection { emotion, confidence },
        }
    }

    fn gray_frame() -> RgbImage {
        RgbImage::from_pixel(160, 120, Rgb([40, 40, 40]))
    }

    #[test]
    fn test_no_faces_returns_identical_frame() {
        let frame = gray_frame();
        let out = annotate(&frame, &[]);
        assert_eq!(out, frame);
    }

    #[test]
    fn test_box_drawn_in_emotion_color() {
        let frame = gray_frame();
        let out = annotate(&frame, &[face(40, 50, 60, 40, Emotion::Angry, 0.8)]);
        // Left edge of the box, below the label tab.
        assert_eq!(out.get_pixel(40, 70).0, [255, 0, 0]);
        // Interior untouched.
        assert_eq!(out.get_pixel(70, 70).0, [40, 40, 40]);
        // Input is not mutated.
        assert_eq!(frame.get_pixel(40, 70).0, [40, 40, 40]);
    }

    #[test]
    fn test_label_tab_above_box() {
        let frame = gray_frame();
        let out = annotate(&frame, &[face(40, 50, 60, 40, Emotion::Happy, 0.7)]);
        // Tab spans y in [36, 50); its top-left corner is tab colour, not text.
        assert_eq!(out.get_pixel(40, 36).0, [255, 255, 0]);
        let changed_above = (36..50).any(|y| out.get_pixel(50, y).0 == [0, 0, 0]);
        assert!(changed_above, "expected label glyph pixels above the box");
    }

    #[test]
    fn test_box_at_frame_edge_is_clipped() {
        let frame = gray_frame();
        let out = annotate(&frame, &[face(150, 110, 10, 10, Emotion::Sad, 0.5)]);
        assert_eq!(out.dimensions(), frame.dimensions());
    }

    #[test]
    fn test_face_label() {
        let sel = Selection { emotion: Emotion::Happy, confidence: 0.7 };
        assert_eq!(face_label(&sel), "Happy 70%");
    }

    #[test]
    fn test_stats_overlay_draws_background() {
        let mut frame = gray_frame();
        draw_stats_overlay(&mut frame, &StatsSnapshot::default());
        assert_eq!(frame.get_pixel(0, 0).0, [32, 32, 32]);
        assert_eq!(frame.get_pixel(159, 119).0, [40, 40, 40]);
    }
}
