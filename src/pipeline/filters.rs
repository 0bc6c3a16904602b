//! Built-in frame transforms

use bytes::Bytes;
use image::{GrayImage, Luma};

use super::transform::{FrameTransform, ProcessingMode, TransformError, TransformInput, TransformOutput};
use crate::capture::decode;
use crate::capture::PixelFormat;

/// Pass-through, grayscale or Sobel edge map depending on the mode
#[derive(Debug, Default, Clone)]
pub struct EdgeDetector {
    /// Gradient magnitudes below this are zeroed
    pub threshold: u8,
}

impl EdgeDetector {
    pub fn new(threshold: u8) -> Self {
        Self { threshold }
    }

    fn luma(input: &TransformInput) -> Result<GrayImage, TransformError> {
        let luma = decode::to_luma(&input.data, &input.metadata())
            .map_err(|e| TransformError::Failed(e.to_string()))?;
        GrayImage::from_raw(input.width, input.height, luma)
            .ok_or_else(|| TransformError::Failed("luma plane size mismatch".into()))
    }

    fn sobel(&self, gray: &GrayImage) -> GrayImage {
        let (w, h) = gray.dimensions();
        let mut out = GrayImage::new(w, h);
        if w < 3 || h < 3 {
            return out;
        }
        let px = |x: u32, y: u32| gray.get_pixel(x, y)[0] as i32;
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let gx = px(x + 1, y - 1) + 2 * px(x + 1, y) + px(x + 1, y + 1)
                    - px(x - 1, y - 1)
                    - 2 * px(x - 1, y)
                    - px(x - 1, y + 1);
                let gy = px(x - 1, y + 1) + 2 * px(x, y + 1) + px(x + 1, y + 1)
                    - px(x - 1, y - 1)
                    - 2 * px(x, y - 1)
                    - px(x + 1, y - 1);
                let magnitude = (gx.abs() + gy.abs()).min(255) as u8;
                let value = if magnitude < self.threshold { 0 } else { magnitude };
                out.put_pixel(x, y, Luma([value]));
            }
        }
        out
    }
}

impl FrameTransform for EdgeDetector {
    fn name(&self) -> &str {
        "edge-detector"
    }

    fn process(
        &self,
        input: &TransformInput,
        mode: ProcessingMode,
    ) -> Result<TransformOutput, TransformError> {
        let (data, stride, format) = match mode {
            ProcessingMode::Raw => (input.data.clone(), input.stride, input.format),
            ProcessingMode::Gray => (
                Bytes::from(Self::luma(input)?.into_raw()),
                input.width,
                PixelFormat::Gray8,
            ),
            ProcessingMode::Edge => {
                let edges = self.sobel(&Self::luma(input)?);
                (Bytes::from(edges.into_raw()), input.width, PixelFormat::Gray8)
            }
        };
        Ok(TransformOutput {
            data,
            width: input.width,
            height: input.height,
            stride,
            format,
            code: mode.flag(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_input(width: u32, height: u32, pixels: Vec<u8>) -> TransformInput {
        TransformInput {
            data: Bytes::from(pixels),
            width,
            height,
            stride: width,
            format: PixelFormat::Gray8,
            timestamp_ns: 1,
        }
    }

    #[test]
    fn test_flat_image_has_no_edges() {
        let input = gray_input(4, 4, vec![90; 16]);
        let out = EdgeDetector::default()
            .process(&input, ProcessingMode::Edge)
            .unwrap();
        assert!(out.data.iter().all(|&v| v == 0));
        assert_eq!(out.format, PixelFormat::Gray8);
        assert_eq!(out.code, 1);
    }

    #[test]
    fn test_vertical_step_is_detected() {
        let mut pixels = Vec::new();
        for _ in 0..4 {
            pixels.extend_from_slice(&[0, 0, 255, 255]);
        }
        let out = EdgeDetector::default()
            .process(&gray_input(4, 4, pixels), ProcessingMode::Edge)
            .unwrap();
        assert_eq!(out.data[4 + 1], 255);
    }

    #[test]
    fn test_raw_passes_bytes_through() {
        let input = gray_input(2, 2, vec![1, 2, 3, 4]);
        let out = EdgeDetector::default()
            .process(&input, ProcessingMode::Raw)
            .unwrap();
        assert_eq!(out.data, input.data);
    }
}
