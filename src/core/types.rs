use serde::{Deserialize, Serialize};

/// 流类型（每种最多一条活动流）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
}

impl StreamKind {
    pub const COUNT: usize = 3;

    /// 用于按流类型索引数组
    pub fn index(self) -> usize {
        match self {
            StreamKind::Video => 0,
            StreamKind::Audio => 1,
            StreamKind::Subtitle => 2,
        }
    }

    pub fn all() -> [StreamKind; Self::COUNT] {
        [StreamKind::Video, StreamKind::Audio, StreamKind::Subtitle]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
            StreamKind::Subtitle => "subtitle",
        }
    }
}

/// 主时钟类型 - 其余流向它同步
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterClockKind {
    Audio,
    Video,
    External,
}

/// 播放状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    RGBA,
    YUV420P,
    NV12,
}

impl PixelFormat {
    /// 该格式下一帧画面所需的字节数
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::RGBA => w * h * 4,
            PixelFormat::YUV420P | PixelFormat::NV12 => w * h * 3 / 2,
        }
    }
}

/// 视频帧像素数据（各平面依次紧凑排列）
#[derive(Debug, Clone, Default)]
pub struct VideoBuffer {
    pub format: Option<PixelFormat>,
    pub data: Vec<u8>,
    /// 每个平面的行跨度（字节），未使用的平面为 0
    pub strides: [usize; 3],
}

/// 音频帧 PCM 数据（交错 f32）
#[derive(Debug, Clone, Default)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl AudioBuffer {
    /// 每声道采样数
    pub fn nb_samples(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }
}

/// 字幕区域（当前仅文本字幕）
#[derive(Debug, Clone, Default)]
pub struct SubtitleText {
    pub text: String,
}

/// 媒体信息
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MediaInfo {
    pub duration: f64, // 总时长（秒），未知时为 0
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub video_codec: String,
    pub audio_codec: String,
    pub sample_rate: u32,
    pub channels: u16,
}
