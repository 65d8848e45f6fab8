use crate::core::{now_seconds, ClockSet, MasterClockKind, PlaybackConfig, Result, VideoBuffer};
use crate::player::frame_queue::{FrameInfo, FramePayload, FrameQueue};
use crate::player::session::Transport;
use log::warn;
use parking_lot::Mutex;
use std::sync::Arc;

/// 像素格式转换器抽象 - 真实实现见 media::convert
pub trait PixelConverter: Send {
    /// 把原生格式的一帧转换为 RGBA，写入调用方持有的缓冲
    fn to_rgba(&mut self, src: &VideoBuffer, width: u32, height: u32, out: &mut Vec<u8>) -> Result<()>;
}

/// 纹理接收端抽象 - 嵌入方的渲染器从这里取画面
pub trait TextureSink: Send {
    /// 上传一帧 RGBA 像素（尺寸变化时重建）
    fn upload(&mut self, width: u32, height: u32, rgba: &[u8]);
    fn size(&self) -> (u32, u32);
}

pub type SharedTexture = Arc<Mutex<dyn TextureSink>>;

/// 简单的 CPU 侧 RGBA 纹理：嵌入方直接读像素
#[derive(Default)]
pub struct RgbaTextureSink {
    width: u32,
    height: u32,
    pub pixels: Vec<u8>,
    pub frame_count: u64,
}

impl TextureSink for RgbaTextureSink {
    fn upload(&mut self, width: u32, height: u32, rgba: &[u8]) {
        self.width = width;
        self.height = height;
        self.pixels.clear();
        self.pixels.extend_from_slice(rgba);
        self.frame_count += 1;
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// 视频同步的目标延迟修正
///
/// 仅在视频不是主时钟时调整：落后超过阈值就压缩延迟追赶，
/// 领先较多时拉伸延迟，领先较少时把延迟翻倍（多停留一帧）。
pub(crate) fn compute_target_delay(
    mut delay: f64,
    video_time: f64,
    master_time: f64,
    cfg: &PlaybackConfig,
) -> f64 {
    let diff = video_time - master_time;
    let sync_threshold = delay.clamp(cfg.sync_threshold_min, cfg.sync_threshold_max);
    if diff.is_finite() && diff.abs() < cfg.max_frame_duration {
        if diff <= -sync_threshold {
            delay = (delay + diff).max(0.0);
        } else if diff >= sync_threshold && delay > cfg.framedup_threshold {
            delay += diff;
        } else if diff >= sync_threshold {
            delay *= 2.0;
        }
    }
    delay
}

/// 视频呈现端 - 在渲染线程的每个 tick 上被驱动
///
/// 在正确的墙钟时刻从帧队列取出一帧，转换像素格式并上传纹理，
/// 同时解析当前应显示的字幕。没有新帧时保持上一帧不动。
pub struct VideoPlayback {
    frames: Arc<FrameQueue>,
    subtitles: Option<Arc<FrameQueue>>,
    clocks: Arc<ClockSet>,
    transport: Arc<Transport>,
    cfg: PlaybackConfig,
    converter: Box<dyn PixelConverter>,
    sink: SharedTexture,

    /// 帧节拍器：上一帧理应显示的墙钟时刻
    frame_timer: f64,
    rgba_buf: Vec<u8>,
    dropped: u64,

    /// 当前显示中的字幕（serial + pts 作为身份，避免每 tick 重复克隆）
    active_sub_key: Option<(u64, f64)>,
    active_sub_text: String,
}

impl VideoPlayback {
    pub fn new(
        frames: Arc<FrameQueue>,
        subtitles: Option<Arc<FrameQueue>>,
        clocks: Arc<ClockSet>,
        transport: Arc<Transport>,
        cfg: PlaybackConfig,
        converter: Box<dyn PixelConverter>,
        sink: SharedTexture,
    ) -> Self {
        Self {
            frames,
            subtitles,
            clocks,
            transport,
            cfg,
            converter,
            sink,
            frame_timer: now_seconds(),
            rgba_buf: Vec::new(),
            dropped: 0,
            active_sub_key: None,
            active_sub_text: String::new(),
        }
    }

    /// 迄今为止因落后主时钟而丢弃的帧数
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// 当前应叠加显示的字幕文本
    pub fn active_subtitle(&self) -> Option<&str> {
        self.active_sub_key.map(|_| self.active_sub_text.as_str())
    }

    /// 一次呈现 tick
    pub fn tick(&mut self) {
        loop {
            if self.frames.undisplayed() == 0 {
                // 没有新帧：保持上一帧
                return;
            }
            let last = self.frames.peek_last();
            let cur = self.frames.peek();

            // seek 之前的陈旧帧：丢掉重试
            if cur.serial != self.frames.packets().serial() {
                self.frames.advance();
                continue;
            }
            // 不连续点之后重置节拍器
            if last.serial != cur.serial {
                self.frame_timer = now_seconds();
            }
            if self.transport.is_paused() {
                return;
            }

            let delay = compute_target_delay_for(
                self.frame_duration(&last, &cur),
                &self.clocks,
                &self.cfg,
            );
            let time = now_seconds();
            if time < self.frame_timer + delay {
                // 还没到显示时刻
                return;
            }
            self.frame_timer += delay;
            if delay > 0.0 && time - self.frame_timer > self.cfg.sync_threshold_max {
                // 节拍器落后太多，重新对齐到当前时刻
                self.frame_timer = time;
            }

            if !cur.pts.is_nan() {
                self.clocks.video.set(cur.pts, cur.serial);
                self.clocks
                    .external
                    .sync_to(&self.clocks.video, self.cfg.nosync_threshold);
            }

            // 下一帧已经迟到：丢弃当前帧追赶，而不是越落越远
            if self.frames.undisplayed() > 1
                && !self.transport.step_pending()
                && self.clocks.effective_master() != MasterClockKind::Video
            {
                let next = self.frames.peek_next();
                let duration = self.frame_duration(&cur, &next);
                if time > self.frame_timer + duration {
                    self.dropped += 1;
                    self.frames.advance();
                    continue;
                }
            }

            self.resolve_subtitles();
            self.present();
            self.transport.finish_step();
            return;
        }
    }

    /// 相邻两帧的间隔；异常值回退到帧自身的估计时长
    fn frame_duration(&self, a: &FrameInfo, b: &FrameInfo) -> f64 {
        if a.serial != b.serial {
            return 0.0;
        }
        let d = b.pts - a.pts;
        if d.is_nan() || d <= 0.0 || d > self.cfg.max_frame_duration {
            if a.duration.is_finite() {
                a.duration
            } else {
                0.0
            }
        } else {
            d
        }
    }

    /// 转换 + 上传当前帧，然后消费它
    fn present(&mut self) {
        let Self {
            frames,
            converter,
            sink,
            rgba_buf,
            ..
        } = self;
        frames.with_current(|f| {
            if f.uploaded {
                return;
            }
            if let FramePayload::Video(buf) = &f.payload {
                match converter.to_rgba(buf, f.width, f.height, rgba_buf) {
                    Ok(()) => {
                        sink.lock().upload(f.width, f.height, rgba_buf);
                        f.uploaded = true;
                    }
                    Err(e) => {
                        // 转换失败只跳过本帧上传，不打断播放
                        warn!("⚠ 像素格式转换失败，跳过上传: {}", e);
                    }
                }
            }
        });
        frames.advance();
    }

    /// 字幕可见性：过了结束时间或下一条的开始时间就丢弃；
    /// 过了开始时间就显示。
    fn resolve_subtitles(&mut self) {
        let Some(subs) = &self.subtitles else {
            return;
        };
        let sub_serial = subs.packets().serial();
        let vid = self.clocks.video.get();
        while subs.undisplayed() > 0 {
            let sp = subs.peek();
            let end = sp.pts + sp.duration;
            let next_start = if subs.undisplayed() > 1 {
                Some(subs.peek_next().pts)
            } else {
                None
            };
            let expired = sp.serial != sub_serial
                || (vid.is_finite() && !sp.pts.is_nan() && vid > end)
                || next_start.map_or(false, |s| vid.is_finite() && !s.is_nan() && vid > s);
            if expired {
                if self.active_sub_key == Some((sp.serial, sp.pts)) {
                    self.active_sub_key = None;
                }
                subs.advance();
                continue;
            }
            if vid.is_finite() && !sp.pts.is_nan() && vid >= sp.pts {
                let key = (sp.serial, sp.pts);
                if self.active_sub_key != Some(key) {
                    let text = &mut self.active_sub_text;
                    subs.with_current(|f| {
                        if let FramePayload::Subtitle(s) = &f.payload {
                            text.clear();
                            text.push_str(&s.text);
                        }
                    });
                    self.active_sub_key = Some(key);
                }
            }
            break;
        }
    }
}

/// 读取时钟后委托 compute_target_delay；视频为主时钟时不做修正
fn compute_target_delay_for(delay: f64, clocks: &ClockSet, cfg: &PlaybackConfig) -> f64 {
    if clocks.effective_master() == MasterClockKind::Video {
        return delay;
    }
    compute_target_delay(delay, clocks.video.get(), clocks.master_time(), cfg)
}
