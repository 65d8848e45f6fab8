use crate::core::{now_seconds, AudioBuffer, ClockSet, MasterClockKind, PlaybackConfig, Result};
use crate::player::frame_queue::{FramePayload, FrameQueue};
use crate::player::session::Transport;
use log::warn;
use std::sync::Arc;

/// 重采样器抽象 - 真实实现见 media::resample
pub trait Resampler: Send {
    /// 把 input 的交错 f32 样本转换到 out_rate/out_channels，追加写入 out
    ///
    /// wanted_samples 是同步修正后的目标样本数（按输入采样率计），
    /// 与实际样本数不同时实现方需要做瞬时补偿。
    fn convert(
        &mut self,
        input: &AudioBuffer,
        out_rate: u32,
        out_channels: u16,
        wanted_samples: usize,
        out: &mut Vec<f32>,
    ) -> Result<()>;
}

/// 音频输出设备抽象 - 拉取模型
///
/// 设备周期性地回调索要 N 个样本；合成实现（测试）手动泵回调即可。
pub trait AudioDevice: Send {
    /// 协商输出配置，返回实际生效的 (采样率, 声道数)
    fn negotiate(&mut self, sample_rate: u32, channels: u16) -> Result<(u32, u16)>;
    /// 启动设备，开始周期性回调
    fn start(&mut self, callback: Box<dyn FnMut(&mut [f32]) + Send>) -> Result<()>;
    fn pause(&mut self, paused: bool);
    fn close(&mut self);
}

/// 音频呈现端 - 运行在设备回调线程上
///
/// 内部缓冲耗尽时解码下一帧（校验序号），按设备格式重采样；
/// 音频不是主时钟时按平滑后的钟差在 ±10% 带宽内伸缩样本数。
/// 时钟推进用"此刻可听见的位置"：帧尾 pts 减去尚未送出的缓冲时长。
pub struct AudioPlayback {
    frames: Arc<FrameQueue>,
    clocks: Arc<ClockSet>,
    transport: Arc<Transport>,
    cfg: PlaybackConfig,
    resampler: Box<dyn Resampler>,
    device_rate: u32,
    device_channels: u16,

    /// 已重采样、待送出的样本
    buf: Vec<f32>,
    buf_index: usize,

    // 钟差的指数平滑状态
    diff_cum: f64,
    diff_avg_coef: f64,
    diff_avg_count: u32,
    diff_threshold: f64,

    /// 最近一帧的帧尾 pts 与序号（时钟推进用）
    end_pts: f64,
    end_serial: u64,
}

impl AudioPlayback {
    pub fn new(
        frames: Arc<FrameQueue>,
        clocks: Arc<ClockSet>,
        transport: Arc<Transport>,
        cfg: PlaybackConfig,
        resampler: Box<dyn Resampler>,
        device_rate: u32,
        device_channels: u16,
    ) -> Self {
        let diff_avg_coef = cfg.audio_diff_avg_coef();
        // 低于一个设备回调周期的偏差没有修正意义（经验值：1024 样本）
        let diff_threshold = 1024.0 / device_rate.max(1) as f64;
        Self {
            frames,
            clocks,
            transport,
            cfg,
            resampler,
            device_rate,
            device_channels,
            buf: Vec::new(),
            buf_index: 0,
            diff_cum: 0.0,
            diff_avg_coef,
            diff_avg_count: 0,
            diff_threshold,
            end_pts: f64::NAN,
            end_serial: 0,
        }
    }

    /// 设备回调入口：同步产出恰好 out.len() 个样本
    pub fn fill(&mut self, out: &mut [f32]) {
        let callback_time = now_seconds();

        if self.transport.is_paused() {
            out.fill(0.0);
            return;
        }

        let mut filled = 0;
        while filled < out.len() {
            if self.buf_index >= self.buf.len() {
                if !self.refill() {
                    // 没有可用数据：剩余部分静音
                    out[filled..].fill(0.0);
                    break;
                }
            }
            let n = (out.len() - filled).min(self.buf.len() - self.buf_index);
            if self.transport.is_muted() {
                out[filled..filled + n].fill(0.0);
            } else {
                out[filled..filled + n]
                    .copy_from_slice(&self.buf[self.buf_index..self.buf_index + n]);
            }
            self.buf_index += n;
            filled += n;
        }

        // 推进音频时钟："此刻可听见的声音"，不是"已解码的声音"
        if !self.end_pts.is_nan() {
            let buffered = (self.buf.len() - self.buf_index) as f64
                / (self.device_rate as f64 * self.device_channels as f64);
            self.clocks
                .audio
                .set_at(self.end_pts - buffered, self.end_serial, callback_time);
            self.clocks
                .external
                .sync_to(&self.clocks.audio, self.cfg.nosync_threshold);
        }
    }

    /// 解码下一个可用音频帧到内部缓冲；没有数据时返回 false
    fn refill(&mut self) -> bool {
        // 非阻塞地跳过陈旧帧
        loop {
            if self.frames.undisplayed() == 0 {
                return false;
            }
            if self.frames.peek().serial != self.frames.packets().serial() {
                self.frames.advance();
                continue;
            }
            break;
        }

        let info = self.frames.peek();
        // 先取样本参数做同步修正，再持锁重采样
        let (nb, in_rate) = self.frames.with_current(|f| {
            if let FramePayload::Audio(buf) = &f.payload {
                (buf.nb_samples(), buf.sample_rate)
            } else {
                (0, 0)
            }
        });
        if nb == 0 || in_rate == 0 {
            self.frames.advance();
            return false;
        }
        let wanted = self.synchronize(nb, in_rate);

        self.buf.clear();
        self.buf_index = 0;
        let Self {
            frames,
            resampler,
            buf,
            device_rate,
            device_channels,
            ..
        } = self;
        let converted = frames.with_current(|f| {
            if let FramePayload::Audio(audio) = &f.payload {
                resampler.convert(audio, *device_rate, *device_channels, wanted, buf)
            } else {
                Ok(())
            }
        });

        let ok = match converted {
            Ok(()) => true,
            Err(e) => {
                // 重采样失败回退到静音，绝不中断播放
                warn!("⚠ 重采样失败，本帧静音: {}", e);
                self.buf.clear();
                false
            }
        };

        if !info.pts.is_nan() {
            // 帧尾 pts：帧首 + 本帧时长
            self.end_pts = info.pts + nb as f64 / in_rate as f64;
            self.end_serial = info.serial;
        }
        self.frames.advance();
        ok && !self.buf.is_empty()
    }

    /// 音频不是主时钟时，按平滑钟差伸缩请求的样本数
    fn synchronize(&mut self, nb_samples: usize, in_rate: u32) -> usize {
        if self.clocks.effective_master() == MasterClockKind::Audio {
            return nb_samples;
        }
        let diff = self.clocks.audio.get() - self.clocks.master_time();
        if diff.is_finite() && diff.abs() < self.cfg.nosync_threshold {
            self.diff_cum = diff + self.diff_avg_coef * self.diff_cum;
            if self.diff_avg_count < self.cfg.audio_diff_avg_nb {
                // 还在积累样本，先不修正
                self.diff_avg_count += 1;
            } else {
                let avg_diff = self.diff_cum * (1.0 - self.diff_avg_coef);
                if avg_diff.abs() >= self.diff_threshold {
                    let wanted = nb_samples as isize + (diff * in_rate as f64) as isize;
                    let pct = self.cfg.sample_correction_percent;
                    let min = (nb_samples as f64 * (100.0 - pct) / 100.0) as isize;
                    let max = (nb_samples as f64 * (100.0 + pct) / 100.0) as isize;
                    return wanted.clamp(min.max(1), max) as usize;
                }
            }
        } else {
            // 偏差离谱：重置平滑状态
            self.diff_avg_count = 0;
            self.diff_cum = 0.0;
        }
        nb_samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::packet_queue::PacketQueue;

    /// 直通重采样器：忽略速率差异，只做声道/样本数裁剪
    struct PassthroughResampler;
    impl Resampler for PassthroughResampler {
        fn convert(
            &mut self,
            input: &AudioBuffer,
            _out_rate: u32,
            out_channels: u16,
            wanted_samples: usize,
            out: &mut Vec<f32>,
        ) -> Result<()> {
            let nb = input.nb_samples().min(wanted_samples);
            for i in 0..nb {
                for c in 0..out_channels as usize {
                    let src = i * input.channels as usize + c.min(input.channels as usize - 1);
                    out.push(input.samples[src]);
                }
            }
            Ok(())
        }
    }

    fn setup(master: MasterClockKind) -> (AudioPlayback, Arc<FrameQueue>, Arc<PacketQueue>) {
        let packets = Arc::new(PacketQueue::new());
        packets.start();
        let frames = Arc::new(FrameQueue::new(packets.clone(), 9, false));
        let clocks = Arc::new(ClockSet::new(
            master,
            Some(packets.serial_handle()),
            None,
        ));
        let transport = Arc::new(Transport::new(clocks.clone()));
        let playback = AudioPlayback::new(
            frames.clone(),
            clocks,
            transport,
            PlaybackConfig::default(),
            Box::new(PassthroughResampler),
            48000,
            2,
        );
        (playback, frames, packets)
    }

    fn push_audio_frame(fq: &FrameQueue, pts: f64, serial: u64, value: f32, nb: usize) {
        assert!(fq.push_with(|f| {
            f.serial = serial;
            f.pts = pts;
            f.duration = nb as f64 / 48000.0;
            f.payload = FramePayload::Audio(AudioBuffer {
                sample_rate: 48000,
                channels: 2,
                samples: vec![value; nb * 2],
            });
        }));
    }

    #[test]
    fn test_fill_drains_frames_and_updates_clock() {
        let (mut playback, frames, packets) = setup(MasterClockKind::Audio);
        push_audio_frame(&frames, 1.0, packets.serial(), 0.5, 480);
        let mut out = vec![0.0f32; 480 * 2];
        playback.fill(&mut out);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
        // 帧尾 1.01s，缓冲恰好耗尽 → 时钟≈1.01
        let t = playback.clocks.audio.get();
        assert!((t - 1.01).abs() < 0.02, "音频时钟错误: {}", t);
    }

    #[test]
    fn test_underrun_fills_silence() {
        let (mut playback, _frames, _packets) = setup(MasterClockKind::Audio);
        let mut out = vec![1.0f32; 256];
        playback.fill(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_stale_audio_frames_skipped() {
        let (mut playback, frames, packets) = setup(MasterClockKind::Audio);
        push_audio_frame(&frames, 0.0, packets.serial(), 0.25, 480);
        packets.push_flush(); // seek：旧帧过期
        push_audio_frame(&frames, 9.0, packets.serial(), 0.75, 480);

        let mut out = vec![0.0f32; 64];
        playback.fill(&mut out);
        // 陈旧帧被跳过，输出来自新帧
        assert!(out.iter().all(|&s| (s - 0.75).abs() < 1e-6));
    }

    #[test]
    fn test_sample_correction_stays_in_band() {
        let (mut playback, _frames, packets) = setup(MasterClockKind::External);
        // 音频落后外部时钟很多：修正必须被夹在 ±10% 以内
        playback.clocks.external.set(10.0, 0);
        playback.clocks.audio.set(9.0, packets.serial());
        playback.diff_avg_count = playback.cfg.audio_diff_avg_nb;
        playback.diff_cum = -1.0 / (1.0 - playback.diff_avg_coef);
        let wanted = playback.synchronize(1000, 48000);
        assert_eq!(wanted, 900);

        playback.clocks.audio.set(11.0, packets.serial());
        playback.diff_cum = 1.0 / (1.0 - playback.diff_avg_coef);
        let wanted = playback.synchronize(1000, 48000);
        assert_eq!(wanted, 1100);
    }

    #[test]
    fn test_muted_output_is_silent_but_consumes() {
        let (mut playback, frames, packets) = setup(MasterClockKind::Audio);
        playback.transport.set_muted(true);
        push_audio_frame(&frames, 0.0, packets.serial(), 0.5, 480);
        let mut out = vec![1.0f32; 480 * 2];
        playback.fill(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        // 静音仍然消费帧、推进时钟
        assert_eq!(frames.undisplayed(), 0);
        assert!(!playback.clocks.audio.get().is_nan());
    }
}
