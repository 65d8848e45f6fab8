use crate::core::{PixelFormat, PlayerError, Result, VideoBuffer};
use crate::player::video_playback::PixelConverter;
use ffmpeg_next::{software, util};
use log::debug;

fn to_ffmpeg_pixel(format: PixelFormat) -> util::format::Pixel {
    match format {
        PixelFormat::RGBA => util::format::Pixel::RGBA,
        PixelFormat::YUV420P => util::format::Pixel::YUV420P,
        PixelFormat::NV12 => util::format::Pixel::NV12,
    }
}

/// FFmpeg 像素格式转换器 - 原生格式帧 → 紧凑 RGBA
///
/// 持久化 SwsContext，尺寸或格式变化时重建。
pub struct FfmpegConverter {
    scaler: Option<software::scaling::Context>,
    src_format: Option<PixelFormat>,
    src_width: u32,
    src_height: u32,
}

// SwsContext 不是 Send，但转换器只在呈现线程中使用
unsafe impl Send for FfmpegConverter {}

impl FfmpegConverter {
    pub fn new() -> Self {
        Self {
            scaler: None,
            src_format: None,
            src_width: 0,
            src_height: 0,
        }
    }

    /// 把紧凑平面缓冲搬进 AVFrame
    fn load_frame(
        src: &VideoBuffer,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Result<util::frame::Video> {
        let mut frame = util::frame::Video::new(to_ffmpeg_pixel(format), width, height);
        let plane_heights: [usize; 3] = match format {
            PixelFormat::RGBA => [height as usize, 0, 0],
            PixelFormat::YUV420P => [
                height as usize,
                height as usize / 2,
                height as usize / 2,
            ],
            PixelFormat::NV12 => [height as usize, height as usize / 2, 0],
        };
        let mut offset = 0usize;
        for plane in 0..frame.planes() {
            let src_stride = src.strides[plane];
            let rows = plane_heights[plane];
            let needed = src_stride * rows;
            if src_stride == 0 || src.data.len() < offset + needed {
                return Err(PlayerError::ConvertError(format!(
                    "平面 {} 数据不完整: 需要 {} 字节", plane, needed
                )));
            }
            let dst_stride = frame.stride(plane);
            let row_bytes = src_stride.min(dst_stride);
            let data = frame.data_mut(plane);
            for y in 0..rows {
                let s = offset + y * src_stride;
                let d = y * dst_stride;
                data[d..d + row_bytes].copy_from_slice(&src.data[s..s + row_bytes]);
            }
            offset += needed;
        }
        Ok(frame)
    }
}

impl Default for FfmpegConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelConverter for FfmpegConverter {
    fn to_rgba(
        &mut self,
        src: &VideoBuffer,
        width: u32,
        height: u32,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let format = src
            .format
            .ok_or_else(|| PlayerError::ConvertError("帧缺少像素格式".into()))?;
        if width == 0 || height == 0 {
            return Err(PlayerError::ConvertError("帧尺寸为零".into()));
        }

        // RGBA 直通：只需要按 stride 压紧
        if format == PixelFormat::RGBA {
            let row_bytes = width as usize * 4;
            let stride = src.strides[0];
            if stride < row_bytes || src.data.len() < stride * height as usize {
                return Err(PlayerError::ConvertError("RGBA 数据不完整".into()));
            }
            out.clear();
            for y in 0..height as usize {
                out.extend_from_slice(&src.data[y * stride..y * stride + row_bytes]);
            }
            return Ok(());
        }

        let stale = self.src_format != Some(format)
            || self.src_width != width
            || self.src_height != height;
        if stale || self.scaler.is_none() {
            debug!("🔧 初始化像素转换器: {:?} {}x{} → RGBA", format, width, height);
            self.scaler = Some(software::scaling::Context::get(
                to_ffmpeg_pixel(format),
                width,
                height,
                util::format::Pixel::RGBA,
                width,
                height,
                software::scaling::Flags::BILINEAR,
            )?);
            self.src_format = Some(format);
            self.src_width = width;
            self.src_height = height;
        }

        let in_frame = Self::load_frame(src, format, width, height)?;
        let mut rgba = util::frame::Video::empty();
        self.scaler.as_mut().unwrap().run(&in_frame, &mut rgba)?;

        // 按行压紧到 width*4
        let row_bytes = width as usize * 4;
        let stride = rgba.stride(0);
        let data = rgba.data(0);
        out.clear();
        out.reserve(row_bytes * height as usize);
        for y in 0..height as usize {
            out.extend_from_slice(&data[y * stride..y * stride + row_bytes]);
        }
        Ok(())
    }
}
