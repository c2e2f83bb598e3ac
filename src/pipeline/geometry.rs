//! Video rectangle computations

use serde::{Deserialize, Serialize};

/// Rectangle on the output, in output pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VideoRect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl VideoRect {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    /// Largest rectangle with the frame's aspect ratio centered in `self`.
    pub fn letterbox(&self, frame_width: u32, frame_height: u32) -> VideoRect {
        if self.is_empty() || frame_width == 0 || frame_height == 0 {
            return *self;
        }

        let (fw, fh) = (i64::from(frame_width), i64::from(frame_height));
        let frame_ratio = fw as f64 / fh as f64;
        let rect_ratio = f64::from(self.w) / f64::from(self.h);

        let mut out = *self;
        if frame_ratio >= rect_ratio {
            out.h = (fh * i64::from(self.w) / fw) as i32;
            out.y = self.y + (self.h - out.h) / 2;
        } else {
            out.w = (fw * i64::from(self.h) / fh) as i32;
            out.x = self.x + (self.w - out.w) / 2;
        }
        out
    }
}

/// Window placement plus the output scaling the compositor applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowGeometry {
    pub window: VideoRect,
    pub output_width: i32,
    pub output_height: i32,
    /// When set the window rectangle is scaled, otherwise the full output.
    pub size_override: bool,
    pub scale_x: (i32, i32),
    pub scale_y: (i32, i32),
    pub trans_x: i32,
    pub trans_y: i32,
}

impl Default for WindowGeometry {
    fn default() -> Self {
        Self {
            window: VideoRect::new(0, 0, 1280, 720),
            output_width: 1280,
            output_height: 720,
            size_override: false,
            scale_x: (1, 1),
            scale_y: (1, 1),
            trans_x: 0,
            trans_y: 0,
        }
    }
}

impl WindowGeometry {
    /// Video rectangle resulting from window position and scaling.
    pub fn video_rect(&self) -> VideoRect {
        let sx = |v: i32| scale(v, self.scale_x);
        let sy = |v: i32| scale(v, self.scale_y);

        if self.size_override {
            VideoRect {
                x: sx(self.window.x) + self.trans_x,
                y: sy(self.window.y) + self.trans_y,
                w: sx(self.window.w),
                h: sy(self.window.h),
            }
        } else {
            VideoRect {
                x: self.trans_x,
                y: self.trans_y,
                w: sx(self.output_width),
                h: sy(self.output_height),
            }
        }
    }
}

fn scale(value: i32, (num, denom): (i32, i32)) -> i32 {
    if denom == 0 {
        return value;
    }
    (i64::from(value) * i64::from(num) / i64::from(denom)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letterbox_wide_frame() {
        let rect = VideoRect::new(0, 0, 1920, 1080);
        assert_eq!(rect.letterbox(1920, 800), VideoRect::new(0, 140, 1920, 800));
    }

    #[test]
    fn test_pillarbox_narrow_frame() {
        let rect = VideoRect::new(100, 0, 1600, 900);
        assert_eq!(rect.letterbox(720, 900), VideoRect::new(540, 0, 720, 900));
    }

    #[test]
    fn test_letterbox_degenerate() {
        let rect = VideoRect::new(0, 0, 0, 0);
        assert_eq!(rect.letterbox(1920, 1080), rect);
        let rect = VideoRect::new(0, 0, 640, 480);
        assert_eq!(rect.letterbox(0, 1080), rect);
    }

    #[test]
    fn test_window_geometry_scaling() {
        let geometry = WindowGeometry {
            window: VideoRect::new(100, 50, 640, 360),
            size_override: true,
            scale_x: (3, 2),
            scale_y: (3, 2),
            trans_x: 10,
            trans_y: 20,
            ..Default::default()
        };
        assert_eq!(geometry.video_rect(), VideoRect::new(160, 95, 960, 540));

        let full = WindowGeometry {
            size_override: false,
            ..geometry
        };
        assert_eq!(full.video_rect(), VideoRect::new(10, 20, 1920, 1080));
    }
}
