use crate::core::{
    ClockSet, MediaInfo, PlaybackConfig, PlaybackState, PlayerError, Result, StreamKind,
};
use crate::player::audio_playback::{AudioDevice, AudioPlayback, Resampler};
use crate::player::decoder::{self, new_finished_flag, DecodeEngine, Decoder};
use crate::player::frame_queue::FrameQueue;
use crate::player::packet_queue::PacketQueue;
use crate::player::reader::{Reader, ReaderCommand, ReaderWaker, StreamSlot};
use crate::player::source::{PacketSource, SeekRequest, StreamDesc};
use crate::player::video_playback::{PixelConverter, SharedTexture, VideoPlayback};
use crossbeam_channel::Sender;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// 跨线程共享的播放控制状态
///
/// 暂停/静音/单步/结束标志都是小原子量，各线程直接读；
/// 暂停恢复同时作用于三个时钟。
pub struct Transport {
    clocks: Arc<ClockSet>,
    paused: AtomicBool,
    muted: AtomicBool,
    step: AtomicBool,
    finished: AtomicBool,
    failed: AtomicBool,
}

impl Transport {
    pub fn new(clocks: Arc<ClockSet>) -> Self {
        Self {
            clocks,
            paused: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            step: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn toggle_pause(&self) {
        let now_paused = !self.is_paused();
        // 时钟先行：暂停把外推结果落回基准，恢复从当前时刻重新起步
        self.clocks.set_paused(now_paused);
        self.paused.store(now_paused, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    /// 向前走恰好一帧：暂停中则先恢复，呈现一帧后由 finish_step 重新暂停
    pub fn step_to_next_frame(&self) {
        if self.is_paused() {
            self.toggle_pause();
        }
        self.step.store(true, Ordering::Release);
    }

    pub fn step_pending(&self) -> bool {
        self.step.load(Ordering::Acquire)
    }

    /// 单步完成：呈现过一帧后重新暂停
    pub fn finish_step(&self) {
        if self.step.swap(false, Ordering::AcqRel) && !self.is_paused() {
            self.toggle_pause();
        }
    }

    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn set_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

/// 外部协作者的装配入口：解封装、解码引擎、重采样、像素转换、
/// 音频设备、纹理。真实实现见 media::FfmpegBackend，测试用合成实现。
pub trait MediaBackend {
    fn open(&mut self, path: &str) -> Result<Box<dyn PacketSource>>;
    fn video_engine(&mut self, desc: &StreamDesc) -> Result<Box<dyn DecodeEngine>>;
    fn audio_engine(&mut self, desc: &StreamDesc) -> Result<Box<dyn DecodeEngine>>;
    fn subtitle_engine(&mut self, desc: &StreamDesc) -> Result<Box<dyn DecodeEngine>>;
    fn resampler(&mut self) -> Result<Box<dyn Resampler>>;
    fn converter(&mut self) -> Result<Box<dyn PixelConverter>>;
    fn audio_device(&mut self) -> Result<Box<dyn AudioDevice>>;
    fn texture_sink(&mut self) -> SharedTexture;
}

/// 一次播放会话 - 一个文件从 Play 到 Stop 的生命周期单位
///
/// 组合一个 Reader 线程、至多 3 个解码线程、对应的队列与时钟。
/// 销毁时 abort 所有队列、唤醒所有等待者并 join 每个线程，
/// 之后才释放队列内存；绝不留游离线程。
pub struct Session {
    media_info: MediaInfo,
    cfg: PlaybackConfig,
    clocks: Arc<ClockSet>,
    transport: Arc<Transport>,

    packet_queues: Vec<Arc<PacketQueue>>,
    frame_queues: Vec<Arc<FrameQueue>>,

    reader_tx: Sender<ReaderCommand>,
    reader_handle: Option<JoinHandle<()>>,
    decoder_handles: Vec<JoinHandle<()>>,

    audio_device: Option<Box<dyn AudioDevice>>,
    video: Option<VideoPlayback>,
    texture: SharedTexture,

    stopped: bool,
}

impl Session {
    /// 打开文件并立即开始播放
    ///
    /// 打开失败（文件无法读取、没有可解码的流）直接返回错误，
    /// 不会留下任何已启动的线程。
    pub fn open(
        path: &str,
        backend: &mut dyn MediaBackend,
        cfg: PlaybackConfig,
    ) -> Result<Self> {
        info!("🎬 打开媒体: {}", path);
        let source = backend.open(path)?;
        let streams: Vec<StreamDesc> = source.streams().to_vec();

        let video_desc = streams.iter().find(|s| s.kind == StreamKind::Video).cloned();
        let audio_desc = streams.iter().find(|s| s.kind == StreamKind::Audio).cloned();
        let subtitle_desc = streams
            .iter()
            .find(|s| s.kind == StreamKind::Subtitle)
            .cloned();
        if video_desc.is_none() && audio_desc.is_none() {
            return Err(PlayerError::NoDecodableStream);
        }

        let media_info = build_media_info(&source, &video_desc, &audio_desc);
        info!("媒体信息: {:?}", media_info);

        // 每条活动流一组队列 + 解码 EOF 标志
        let mut slots: [Option<StreamSlot>; StreamKind::COUNT] = [None, None, None];
        let mut packet_queues = Vec::new();
        let mut frame_queues = Vec::new();
        let mut make_slot = |kind: StreamKind, capacity: usize, keep_last: bool| {
            let queue = Arc::new(PacketQueue::new());
            queue.start();
            let frames = Arc::new(FrameQueue::new(queue.clone(), capacity, keep_last));
            let finished = new_finished_flag();
            packet_queues.push(queue.clone());
            frame_queues.push(frames.clone());
            slots[kind.index()] = Some(StreamSlot {
                queue,
                frames,
                finished,
            });
        };
        if video_desc.is_some() {
            make_slot(StreamKind::Video, cfg.video_queue_len, true);
        }
        if audio_desc.is_some() {
            make_slot(StreamKind::Audio, cfg.audio_queue_len, false);
        }
        if subtitle_desc.is_some() {
            make_slot(StreamKind::Subtitle, cfg.subtitle_queue_len, true);
        }

        let clocks = Arc::new(ClockSet::new(
            cfg.master,
            slots[StreamKind::Audio.index()]
                .as_ref()
                .map(|s| s.queue.serial_handle()),
            slots[StreamKind::Video.index()]
                .as_ref()
                .map(|s| s.queue.serial_handle()),
        ));
        let transport = Arc::new(Transport::new(clocks.clone()));

        // 所有后端构件先就位，之后才启动任何线程；
        // 构造中途失败时直接返回，没有需要回收的线程
        let video_engine = match &video_desc {
            Some(desc) => Some(backend.video_engine(desc)?),
            None => None,
        };
        let audio_engine = match &audio_desc {
            Some(desc) => Some(backend.audio_engine(desc)?),
            None => None,
        };
        let subtitle_engine = match (&subtitle_desc, &slots[StreamKind::Subtitle.index()]) {
            (Some(desc), Some(slot)) => match backend.subtitle_engine(desc) {
                Ok(engine) => Some(engine),
                Err(e) => {
                    // 字幕不可解码不致命，继续播放
                    warn!("⚠ 创建字幕解码器失败，忽略字幕流: {}", e);
                    slot.queue.abort();
                    None
                }
            },
            _ => None,
        };
        let converter = match &video_desc {
            Some(_) => Some(backend.converter()?),
            None => None,
        };

        // Reader 线程（持有各 slot 的克隆）
        let reader_slots = [
            clone_slot(&slots[0]),
            clone_slot(&slots[1]),
            clone_slot(&slots[2]),
        ];
        let (reader_tx, reader_handle) = Reader::spawn(
            source,
            reader_slots,
            clocks.clone(),
            transport.clone(),
            cfg.clone(),
        );
        let waker = ReaderWaker::new(reader_tx.clone());

        // 每条流一个解码线程
        let mut decoder_handles = Vec::new();
        if let (Some(engine), Some(slot)) = (video_engine, &slots[StreamKind::Video.index()]) {
            let dec = Decoder::new(engine, slot.queue.clone(), waker.clone());
            let frames = slot.frames.clone();
            let finished = slot.finished.clone();
            let frame_rate = video_desc.as_ref().map_or(0.0, |d| d.frame_rate);
            decoder_handles.push(
                thread::Builder::new()
                    .name("video_decoder".into())
                    .spawn(move || decoder::video_loop(dec, frames, frame_rate, finished))
                    .expect("无法创建视频解码线程"),
            );
        }
        if let (Some(engine), Some(slot)) = (audio_engine, &slots[StreamKind::Audio.index()]) {
            let dec = Decoder::new(engine, slot.queue.clone(), waker.clone());
            let frames = slot.frames.clone();
            let finished = slot.finished.clone();
            decoder_handles.push(
                thread::Builder::new()
                    .name("audio_decoder".into())
                    .spawn(move || decoder::audio_loop(dec, frames, finished))
                    .expect("无法创建音频解码线程"),
            );
        }
        if let (Some(engine), Some(slot)) = (subtitle_engine, &slots[StreamKind::Subtitle.index()])
        {
            let dec = Decoder::new(engine, slot.queue.clone(), waker.clone());
            let frames = slot.frames.clone();
            let finished = slot.finished.clone();
            decoder_handles.push(
                thread::Builder::new()
                    .name("subtitle_decoder".into())
                    .spawn(move || decoder::subtitle_loop(dec, frames, finished))
                    .expect("无法创建字幕解码线程"),
            );
        }

        // 音频输出（拉取模型：设备回调驱动 AudioPlayback）
        let mut audio_device = None;
        if let (Some(desc), Some(slot)) = (&audio_desc, &slots[StreamKind::Audio.index()]) {
            match Self::start_audio(backend, desc, slot, &clocks, &transport, &cfg) {
                Ok(device) => audio_device = Some(device),
                Err(e) => {
                    // 音频设备打不开时继续无声播放
                    warn!("⚠ 音频输出不可用，静默播放: {}", e);
                }
            }
        }

        // 视频呈现端（由调用方的 update() 驱动）
        let texture = backend.texture_sink();
        let video = match (&slots[StreamKind::Video.index()], converter) {
            (Some(slot), Some(converter)) => Some(VideoPlayback::new(
                slot.frames.clone(),
                slots[StreamKind::Subtitle.index()]
                    .as_ref()
                    .map(|s| s.frames.clone()),
                clocks.clone(),
                transport.clone(),
                cfg.clone(),
                converter,
                texture.clone(),
            )),
            _ => None,
        };

        info!("✅ 播放会话就绪");
        Ok(Self {
            media_info,
            cfg,
            clocks,
            transport,
            packet_queues,
            frame_queues,
            reader_tx,
            reader_handle: Some(reader_handle),
            decoder_handles,
            audio_device,
            video,
            texture,
            stopped: false,
        })
    }

    fn start_audio(
        backend: &mut dyn MediaBackend,
        desc: &StreamDesc,
        slot: &StreamSlot,
        clocks: &Arc<ClockSet>,
        transport: &Arc<Transport>,
        cfg: &PlaybackConfig,
    ) -> Result<Box<dyn AudioDevice>> {
        let mut device = backend.audio_device()?;
        let (rate, channels) = device.negotiate(desc.sample_rate, desc.channels)?;
        info!("🔊 音频输出: {} Hz, {} 声道", rate, channels);
        let mut playback = AudioPlayback::new(
            slot.frames.clone(),
            clocks.clone(),
            transport.clone(),
            cfg.clone(),
            backend.resampler()?,
            rate,
            channels,
        );
        device.start(Box::new(move |out| playback.fill(out)))?;
        Ok(device)
    }

    /// 一次呈现 tick：驱动视频端（音频由设备回调自行驱动）
    pub fn update(&mut self) {
        if self.stopped {
            return;
        }
        if let Some(video) = &mut self.video {
            video.tick();
        }
    }

    pub fn toggle_pause(&self) {
        self.transport.toggle_pause();
        info!(
            "{}",
            if self.transport.is_paused() {
                "⏸ 暂停"
            } else {
                "▶ 继续播放"
            }
        );
    }

    pub fn step_to_next_frame(&self) {
        self.transport.step_to_next_frame();
    }

    pub fn set_muted(&self, muted: bool) {
        self.transport.set_muted(muted);
    }

    /// 请求 seek；实际执行在 Reader 线程，通过 Flush/序号机制作废在途数据
    pub fn seek(&self, target: f64, rel: f64, by_bytes: bool) {
        let _ = self.reader_tx.send(ReaderCommand::Seek(SeekRequest {
            target,
            rel,
            by_bytes,
        }));
    }

    pub fn is_paused(&self) -> bool {
        self.transport.is_paused()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped || self.transport.is_finished() || self.transport.is_failed()
    }

    pub fn state(&self) -> PlaybackState {
        if self.is_stopped() {
            PlaybackState::Stopped
        } else if self.is_paused() {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        }
    }

    /// 当前时间线位置（秒，主时钟），无效时为 NaN
    pub fn position(&self) -> f64 {
        self.clocks.master_time()
    }

    pub fn duration(&self) -> f64 {
        self.media_info.duration
    }

    pub fn media_info(&self) -> &MediaInfo {
        &self.media_info
    }

    /// 视频纹理句柄（嵌入方渲染器读取）
    pub fn video_texture(&self) -> SharedTexture {
        self.texture.clone()
    }

    /// 当前应显示的字幕
    pub fn active_subtitle(&self) -> Option<&str> {
        self.video.as_ref().and_then(|v| v.active_subtitle())
    }

    /// 时钟组（诊断与测试用）
    pub fn clocks(&self) -> &Arc<ClockSet> {
        &self.clocks
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.cfg
    }

    /// 停止播放并回收所有线程。可重复调用。
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        info!("🛑 停止播放会话");
        self.stopped = true;

        // 先 abort 所有队列并唤醒等待者，让每个线程都能退出阻塞
        for q in &self.packet_queues {
            q.abort();
        }
        for f in &self.frame_queues {
            f.signal();
        }
        let _ = self.reader_tx.send(ReaderCommand::Stop);

        if let Some(handle) = self.reader_handle.take() {
            let _ = handle.join();
        }
        for handle in self.decoder_handles.drain(..) {
            let _ = handle.join();
        }
        if let Some(mut device) = self.audio_device.take() {
            device.close();
        }
        info!("✅ 所有播放线程已回收");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

fn clone_slot(slot: &Option<StreamSlot>) -> Option<StreamSlot> {
    slot.as_ref().map(|s| StreamSlot {
        queue: s.queue.clone(),
        frames: s.frames.clone(),
        finished: s.finished.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MasterClockKind;

    fn transport() -> Arc<Transport> {
        let clocks = Arc::new(ClockSet::new(MasterClockKind::Audio, None, None));
        Arc::new(Transport::new(clocks))
    }

    #[test]
    fn test_toggle_pause_holds_clocks() {
        let t = transport();
        t.clocks.video.set(3.0, 1);
        t.toggle_pause();
        assert!(t.is_paused());
        let held = t.clocks.video.get();
        std::thread::sleep(std::time::Duration::from_millis(30));
        // 暂停期间时钟不外推
        assert_eq!(t.clocks.video.get(), held);

        t.toggle_pause();
        assert!(!t.is_paused());
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert!(t.clocks.video.get() > held);
    }

    #[test]
    fn test_step_unpauses_then_finish_step_repauses() {
        let t = transport();
        t.toggle_pause();
        assert!(t.is_paused());

        t.step_to_next_frame();
        assert!(!t.is_paused());
        assert!(t.step_pending());

        // 呈现一帧后重新暂停
        t.finish_step();
        assert!(t.is_paused());
        assert!(!t.step_pending());
    }

    #[test]
    fn test_finish_step_without_step_keeps_playing() {
        let t = transport();
        t.finish_step();
        assert!(!t.is_paused());
    }

    #[test]
    fn test_finished_and_failed_are_sticky() {
        let t = transport();
        assert!(!t.is_finished());
        t.set_finished();
        assert!(t.is_finished());
        t.set_failed();
        assert!(t.is_failed());
    }

    #[test]
    fn test_mute_flag() {
        let t = transport();
        assert!(!t.is_muted());
        t.set_muted(true);
        assert!(t.is_muted());
        t.set_muted(false);
        assert!(!t.is_muted());
    }
}

fn build_media_info(
    source: &Box<dyn PacketSource>,
    video: &Option<StreamDesc>,
    audio: &Option<StreamDesc>,
) -> MediaInfo {
    let duration = source.duration();
    MediaInfo {
        duration: if duration.is_finite() { duration } else { 0.0 },
        width: video.as_ref().map_or(0, |v| v.width),
        height: video.as_ref().map_or(0, |v| v.height),
        fps: video.as_ref().map_or(0.0, |v| v.frame_rate),
        video_codec: video
            .as_ref()
            .map_or_else(|| "none".into(), |v| v.codec.clone()),
        audio_codec: audio
            .as_ref()
            .map_or_else(|| "none".into(), |a| a.codec.clone()),
        sample_rate: audio.as_ref().map_or(0, |a| a.sample_rate),
        channels: audio.as_ref().map_or(0, |a| a.channels),
    }
}
