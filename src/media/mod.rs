//! FFmpeg / cpal 后端：播放管线各抽象边界的真实实现

pub mod audio_device;
pub mod codec;
pub mod convert;
pub mod demux;
pub mod resample;

pub use audio_device::CpalAudioOutput;
pub use codec::{AudioEngine, SubtitleEngine, VideoEngine};
pub use convert::FfmpegConverter;
pub use demux::FfmpegSource;
pub use resample::FfmpegResampler;

use crate::core::{PlayerError, Result, StreamKind};
use crate::player::audio_playback::{AudioDevice, Resampler};
use crate::player::decoder::DecodeEngine;
use crate::player::session::MediaBackend;
use crate::player::source::{PacketSource, StreamDesc};
use crate::player::video_playback::{PixelConverter, RgbaTextureSink, SharedTexture};
use ffmpeg_next as ffmpeg;
use parking_lot::Mutex;
use std::sync::Arc;

/// 真实后端：FFmpeg 解封装/解码/重采样/转换 + cpal 输出
pub struct FfmpegBackend {
    video_params: Option<ffmpeg::codec::Parameters>,
    audio_params: Option<ffmpeg::codec::Parameters>,
    subtitle_params: Option<ffmpeg::codec::Parameters>,
    texture: SharedTexture,
}

impl FfmpegBackend {
    pub fn new() -> Result<Self> {
        ffmpeg::init().map_err(PlayerError::FFmpegError)?;
        Ok(Self {
            video_params: None,
            audio_params: None,
            subtitle_params: None,
            texture: Arc::new(Mutex::new(RgbaTextureSink::default())),
        })
    }
}

impl MediaBackend for FfmpegBackend {
    fn open(&mut self, path: &str) -> Result<Box<dyn PacketSource>> {
        let source = FfmpegSource::open(path)?;
        // 引擎构造在流选择之后，这里先把编解码参数留底
        self.video_params = source.codec_parameters(StreamKind::Video);
        self.audio_params = source.codec_parameters(StreamKind::Audio);
        self.subtitle_params = source.codec_parameters(StreamKind::Subtitle);
        Ok(Box::new(source))
    }

    fn video_engine(&mut self, _desc: &StreamDesc) -> Result<Box<dyn DecodeEngine>> {
        let params = self
            .video_params
            .clone()
            .ok_or(PlayerError::NoDecodableStream)?;
        Ok(Box::new(VideoEngine::new(params)?))
    }

    fn audio_engine(&mut self, _desc: &StreamDesc) -> Result<Box<dyn DecodeEngine>> {
        let params = self
            .audio_params
            .clone()
            .ok_or(PlayerError::NoDecodableStream)?;
        Ok(Box::new(AudioEngine::new(params)?))
    }

    fn subtitle_engine(&mut self, _desc: &StreamDesc) -> Result<Box<dyn DecodeEngine>> {
        let params = self
            .subtitle_params
            .clone()
            .ok_or(PlayerError::NoDecodableStream)?;
        Ok(Box::new(SubtitleEngine::new(params)?))
    }

    fn resampler(&mut self) -> Result<Box<dyn Resampler>> {
        Ok(Box::new(FfmpegResampler::new()))
    }

    fn converter(&mut self) -> Result<Box<dyn PixelConverter>> {
        Ok(Box::new(FfmpegConverter::new()))
    }

    fn audio_device(&mut self) -> Result<Box<dyn AudioDevice>> {
        Ok(Box::new(CpalAudioOutput::new()?))
    }

    fn texture_sink(&mut self) -> SharedTexture {
        self.texture.clone()
    }
}
