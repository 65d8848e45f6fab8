use crate::core::{PlayerError, Result};
use crate::player::audio_playback::AudioDevice;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig, SupportedStreamConfigRange};
use log::{debug, info, warn};

/// cpal 音频输出 - 拉取模型
///
/// 设备回调直接驱动 AudioPlayback::fill，没有中间样本队列；
/// 请求的配置不被支持时回退到常见标准配置。
pub struct CpalAudioOutput {
    device: Device,
    config: Option<StreamConfig>,
    stream: Option<Stream>,
}

// cpal::Stream 不是 Send，但设备对象只在创建它的线程中启停
unsafe impl Send for CpalAudioOutput {}

impl CpalAudioOutput {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::AudioError("无法找到音频输出设备".to_string()))?;
        debug!("使用音频设备: {}", device.name().unwrap_or_default());
        Ok(Self {
            device,
            config: None,
            stream: None,
        })
    }

    fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
        let rate_in_range = config.sample_rate.0 >= supported.min_sample_rate().0
            && config.sample_rate.0 <= supported.max_sample_rate().0;
        let channels_match = config.channels == supported.channels();
        rate_in_range && channels_match
    }

    fn supports(&self, config: &StreamConfig) -> Result<bool> {
        let supported = self
            .device
            .supported_output_configs()
            .map_err(|e| PlayerError::AudioError(format!("无法获取支持的音频配置: {}", e)))?;
        Ok(supported.into_iter().any(|s| Self::is_config_compatible(config, &s)))
    }
}

impl AudioDevice for CpalAudioOutput {
    /// 协商输出配置；不支持时回退到常见标准配置
    fn negotiate(&mut self, sample_rate: u32, channels: u16) -> Result<(u32, u16)> {
        let mut candidates = vec![(sample_rate, channels)];
        candidates.extend([(48000, 2), (44100, 2), (48000, 1), (44100, 1)]);

        for (rate, ch) in candidates {
            if rate == 0 || ch == 0 {
                continue;
            }
            let config = StreamConfig {
                channels: ch,
                sample_rate: cpal::SampleRate(rate),
                buffer_size: cpal::BufferSize::Default,
            };
            if self.supports(&config)? {
                if (rate, ch) != (sample_rate, channels) {
                    warn!(
                        "⚠ 音频设备不支持 {} Hz, {} 声道，回退到 {} Hz, {} 声道",
                        sample_rate, channels, rate, ch
                    );
                }
                self.config = Some(config);
                return Ok((rate, ch));
            }
        }
        Err(PlayerError::AudioError(format!(
            "音频设备不支持任何标准配置 (原请求: {} Hz, {} 声道)",
            sample_rate, channels
        )))
    }

    fn start(&mut self, mut callback: Box<dyn FnMut(&mut [f32]) + Send>) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let config = self
            .config
            .clone()
            .ok_or_else(|| PlayerError::AudioError("启动前必须先协商配置".to_string()))?;

        let stream = self
            .device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    callback(data);
                },
                move |err| {
                    warn!("音频流错误: {}", err);
                },
                None,
            )
            .map_err(|e| PlayerError::AudioError(format!("创建音频流失败: {}", e)))?;

        stream
            .play()
            .map_err(|e| PlayerError::AudioError(format!("启动音频流失败: {}", e)))?;
        self.stream = Some(stream);
        info!("音频输出已启动");
        Ok(())
    }

    fn pause(&mut self, paused: bool) {
        if let Some(stream) = &self.stream {
            let result = if paused {
                stream.pause().map_err(|e| e.to_string())
            } else {
                stream.play().map_err(|e| e.to_string())
            };
            if let Err(e) = result {
                warn!("音频流暂停/恢复失败: {}", e);
            }
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            info!("音频输出已停止");
        }
    }
}

impl Drop for CpalAudioOutput {
    fn drop(&mut self) {
        self.close();
    }
}
