use crate::core::{AudioBuffer, PlayerError, Result};
use crate::player::audio_playback::Resampler;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{software, util};
use log::debug;

/// 声道数对应的标准布局
fn layout_for(channels: u16) -> util::channel_layout::ChannelLayout {
    use util::channel_layout::ChannelLayout;
    match channels {
        1 => ChannelLayout::MONO,
        2 => ChannelLayout::STEREO,
        6 => ChannelLayout::_5POINT1,
        n => ChannelLayout::default(n as i32),
    }
}

/// FFmpeg 重采样器 - 交错 f32 进，设备格式出
///
/// 内部持久化 SwrContext；输入参数变化时重建。同步修正要求的
/// 样本数与实际不同时，用 swr_set_compensation 做瞬时变速，
/// 在一帧内均匀吸收差值而不是硬切。
pub struct FfmpegResampler {
    ctx: Option<software::resampling::Context>,
    in_rate: u32,
    in_channels: u16,
    out_rate: u32,
    out_channels: u16,
}

// SwrContext 不是 Send，但重采样器只在音频回调线程中使用
unsafe impl Send for FfmpegResampler {}

impl FfmpegResampler {
    pub fn new() -> Self {
        Self {
            ctx: None,
            in_rate: 0,
            in_channels: 0,
            out_rate: 0,
            out_channels: 0,
        }
    }

    fn ensure_context(
        &mut self,
        in_rate: u32,
        in_channels: u16,
        out_rate: u32,
        out_channels: u16,
    ) -> Result<()> {
        let unchanged = self.ctx.is_some()
            && self.in_rate == in_rate
            && self.in_channels == in_channels
            && self.out_rate == out_rate
            && self.out_channels == out_channels;
        if unchanged {
            return Ok(());
        }
        debug!(
            "🔧 初始化重采样器: {}Hz/{}ch → {}Hz/{}ch",
            in_rate, in_channels, out_rate, out_channels
        );
        let f32_packed = util::format::Sample::F32(util::format::sample::Type::Packed);
        self.ctx = Some(software::resampling::Context::get(
            f32_packed,
            layout_for(in_channels),
            in_rate,
            f32_packed,
            layout_for(out_channels),
            out_rate,
        )?);
        self.in_rate = in_rate;
        self.in_channels = in_channels;
        self.out_rate = out_rate;
        self.out_channels = out_channels;
        Ok(())
    }
}

impl Default for FfmpegResampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Resampler for FfmpegResampler {
    fn convert(
        &mut self,
        input: &AudioBuffer,
        out_rate: u32,
        out_channels: u16,
        wanted_samples: usize,
        out: &mut Vec<f32>,
    ) -> Result<()> {
        let nb = input.nb_samples();
        if nb == 0 {
            return Ok(());
        }
        if input.sample_rate == 0 || input.channels == 0 {
            return Err(PlayerError::ResampleError("输入缺少采样率/声道信息".into()));
        }
        self.ensure_context(input.sample_rate, input.channels, out_rate, out_channels)?;
        let ctx = self.ctx.as_mut().unwrap();

        // 同步修正：在本帧范围内均匀吸收样本数差值
        if wanted_samples != nb {
            let delta = wanted_samples as i64 - nb as i64;
            let ret = unsafe {
                ffmpeg::ffi::swr_set_compensation(
                    ctx.as_mut_ptr(),
                    (delta * out_rate as i64 / input.sample_rate as i64) as i32,
                    (wanted_samples as i64 * out_rate as i64 / input.sample_rate as i64) as i32,
                )
            };
            if ret < 0 {
                return Err(PlayerError::ResampleError(format!(
                    "swr_set_compensation 失败: {}",
                    ffmpeg::Error::from(ret)
                )));
            }
        }

        // 输入帧：把交错 f32 样本搬进 AVFrame
        let f32_packed = util::format::Sample::F32(util::format::sample::Type::Packed);
        let mut in_frame = util::frame::Audio::new(f32_packed, nb, layout_for(input.channels));
        in_frame.set_rate(input.sample_rate);
        {
            let dst = in_frame.data_mut(0);
            let src_bytes = unsafe {
                std::slice::from_raw_parts(
                    input.samples.as_ptr() as *const u8,
                    input.samples.len() * std::mem::size_of::<f32>(),
                )
            };
            dst[..src_bytes.len()].copy_from_slice(src_bytes);
        }

        let mut out_frame = util::frame::Audio::empty();
        ctx.run(&in_frame, &mut out_frame)?;

        let count = out_frame.samples() * out_channels as usize;
        if count > 0 {
            let raw = unsafe {
                std::slice::from_raw_parts(out_frame.data(0).as_ptr() as *const f32, count)
            };
            out.extend_from_slice(raw);
        }
        Ok(())
    }
}
