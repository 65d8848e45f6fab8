use crate::core::{PixelFormat, Result};
use crate::player::frame_queue::{FramePayload, FrameQueue};
use crate::player::packet_queue::{PacketQueue, QueuedPacket};
use crate::player::reader::ReaderWaker;
use crate::player::source::MediaPacket;
use log::{error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 解码引擎吐出的一个单元（由引擎原地填充、循环复用）
#[derive(Debug)]
pub enum DecodedUnit {
    Video {
        /// 秒，NaN = 引擎给不出时间戳
        pts: f64,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
        strides: [usize; 3],
    },
    Audio {
        pts: f64,
        sample_rate: u32,
        channels: u16,
        samples: Vec<f32>,
    },
    Subtitle {
        start: f64,
        end: f64,
        text: String,
    },
}

impl DecodedUnit {
    pub fn empty_video() -> Self {
        DecodedUnit::Video {
            pts: f64::NAN,
            width: 0,
            height: 0,
            format: PixelFormat::YUV420P,
            data: Vec::new(),
            strides: [0; 3],
        }
    }

    pub fn empty_audio() -> Self {
        DecodedUnit::Audio {
            pts: f64::NAN,
            sample_rate: 0,
            channels: 0,
            samples: Vec::new(),
        }
    }

    pub fn empty_subtitle() -> Self {
        DecodedUnit::Subtitle {
            start: f64::NAN,
            end: f64::NAN,
            text: String::new(),
        }
    }
}

/// 提交压缩包的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Consumed,
    /// 引擎暂时收不下，包要保留下次重新提交
    Again,
}

/// 取解码单元的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Frame,
    NeedInput,
    Eof,
}

/// 解码引擎抽象 - 真实实现见 media::codec，测试里用合成实现
///
/// 协议与常见解码 API 一致：submit 喂入压缩包，receive 反复取
/// 解码结果直到 NeedInput；可恢复的解码错误由实现内部吞掉。
pub trait DecodeEngine: Send {
    fn submit(&mut self, packet: &MediaPacket) -> Result<SubmitOutcome>;
    /// 流结束：引擎进入排空模式，之后 receive 吐尽缓冲帧再报 Eof
    fn submit_eof(&mut self) -> Result<()>;
    fn receive(&mut self, out: &mut DecodedUnit) -> Result<ReceiveOutcome>;
    /// 丢弃全部内部状态（seek 之后、排空完成之后调用）
    fn flush(&mut self);
}

/// 一次 decode_next 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    Frame,
    Eof,
    Aborted,
}

/// 单条流的解码状态机
///
/// 从 PacketQueue 拉包 → 喂给解码引擎 → 产出带序号的解码单元。
/// 序号不匹配的包直接丢弃；Flush 哨兵重置引擎与音频 pts 基线；
/// 引擎"收不下"的包保留为 pending，下一轮重新提交而不是丢掉。
pub struct Decoder {
    engine: Box<dyn DecodeEngine>,
    queue: Arc<PacketQueue>,
    waker: ReaderWaker,
    /// 最近一次送入引擎的包的序号
    pkt_serial: u64,
    /// 到达解码 EOF 时的序号；与队列当前序号相等时表示"这代数据确实放完了"
    eof_serial: u64,
    /// submit 返回 Again 时暂存的包
    pending: Option<MediaPacket>,
    /// 已收到结束标记，正在排空引擎缓冲的延迟帧
    draining: bool,
    /// 音频 pts 缺失时的顺延基线（秒）
    next_pts: f64,
}

/// 解码 EOF 状态的共享句柄（Reader 的结束判定用）
///
/// 存放 eof_serial，u64::MAX 表示尚未到达 EOF。
pub type FinishedFlag = Arc<AtomicU64>;

pub fn new_finished_flag() -> FinishedFlag {
    Arc::new(AtomicU64::new(u64::MAX))
}

impl Decoder {
    pub fn new(
        engine: Box<dyn DecodeEngine>,
        queue: Arc<PacketQueue>,
        waker: ReaderWaker,
    ) -> Self {
        Self {
            engine,
            queue,
            waker,
            pkt_serial: u64::MAX, // 与任何队列序号都不相等，首轮必然先取包
            eof_serial: u64::MAX,
            pending: None,
            draining: false,
            next_pts: f64::NAN,
        }
    }

    /// 最近产出帧所属的序号
    pub fn pkt_serial(&self) -> u64 {
        self.pkt_serial
    }

    /// 本代数据是否已解码到 EOF
    pub fn reached_eof(&self) -> bool {
        self.eof_serial == self.queue.serial()
    }

    /// 解码下一个单元
    ///
    /// 返回 Frame 时 out 已填充且 pts 已归一化；Eof 表示当前这代
    /// 数据放完（遇到新 Flush 后还会继续）；Aborted 为终态。
    pub fn decode_next(&mut self, out: &mut DecodedUnit) -> Result<DecodeStatus> {
        loop {
            // (a) 序号仍然匹配时，先把引擎里已有的结果收完
            if self.queue.serial() == self.pkt_serial {
                loop {
                    match self.engine.receive(out)? {
                        ReceiveOutcome::Frame => {
                            self.normalize_pts(out);
                            return Ok(DecodeStatus::Frame);
                        }
                        ReceiveOutcome::Eof => {
                            return Ok(self.finish_generation());
                        }
                        ReceiveOutcome::NeedInput => {
                            if self.draining {
                                // 排空模式下引擎不再要输入，收不到帧即放完
                                return Ok(self.finish_generation());
                            }
                            break;
                        }
                    }
                }
            }

            // (b) 取下一个包；序号陈旧的直接丢弃
            let (pkt, serial) = loop {
                if let Some(p) = self.pending.take() {
                    // pending 包的序号就是 pkt_serial；若已陈旧则丢弃
                    if self.pkt_serial == self.queue.serial() {
                        break (QueuedPacket::Data(p), self.pkt_serial);
                    }
                    continue;
                }
                if self.queue.packet_count() == 0 {
                    // 队列见底，提醒 Reader 别再打盹
                    self.waker.wake();
                }
                let Some((pkt, serial)) = self.queue.pop(true) else {
                    return Ok(DecodeStatus::Aborted);
                };
                if serial == self.queue.serial() {
                    break (pkt, serial);
                }
                // seek 之前的陈旧包，静默丢弃
            };

            match pkt {
                QueuedPacket::Flush => {
                    self.engine.flush();
                    self.draining = false;
                    self.next_pts = f64::NAN;
                    self.pkt_serial = serial;
                }
                QueuedPacket::Eof => {
                    // 进入排空：先吐尽解码器缓冲的延迟帧（B 帧重排），
                    // 引擎报 Eof 后才算这代数据真正放完
                    self.pkt_serial = serial;
                    self.engine.submit_eof()?;
                    self.draining = true;
                }
                QueuedPacket::Data(p) => {
                    self.pkt_serial = serial;
                    match self.engine.submit(&p)? {
                        SubmitOutcome::Consumed => {}
                        SubmitOutcome::Again => {
                            self.pending = Some(p);
                        }
                    }
                }
            }
        }
    }

    /// 排空结束：记录本代 eof_serial 并复位引擎
    fn finish_generation(&mut self) -> DecodeStatus {
        self.eof_serial = self.pkt_serial;
        self.draining = false;
        self.engine.flush();
        DecodeStatus::Eof
    }

    /// 时间戳归一化：音频在引擎给不出 pts 时按"上一帧 pts + 样本数"顺延
    fn normalize_pts(&mut self, out: &mut DecodedUnit) {
        if let DecodedUnit::Audio {
            pts,
            sample_rate,
            channels,
            samples,
        } = out
        {
            if pts.is_nan() {
                *pts = self.next_pts;
            }
            if !pts.is_nan() && *sample_rate > 0 && *channels > 0 {
                let nb = samples.len() / *channels as usize;
                self.next_pts = *pts + nb as f64 / *sample_rate as f64;
            }
        }
    }
}

// ---- 每种流各自的解码线程循环 ----

/// 视频解码线程：Decoder → 视频 FrameQueue
pub fn video_loop(
    mut dec: Decoder,
    frames: Arc<FrameQueue>,
    frame_rate: f64,
    finished: FinishedFlag,
) {
    info!("🎬 视频解码线程启动");
    let estimated_duration = if frame_rate > 0.0 {
        1.0 / frame_rate
    } else {
        f64::NAN
    };
    let mut unit = DecodedUnit::empty_video();
    loop {
        match dec.decode_next(&mut unit) {
            Ok(DecodeStatus::Frame) => {
                let DecodedUnit::Video {
                    pts,
                    width,
                    height,
                    format,
                    data,
                    strides,
                } = &mut unit
                else {
                    unreachable!()
                };
                let serial = dec.pkt_serial();
                let published = frames.push_with(|f| {
                    f.serial = serial;
                    f.pts = *pts;
                    f.duration = estimated_duration;
                    f.width = *width;
                    f.height = *height;
                    let buf = match &mut f.payload {
                        FramePayload::Video(buf) => buf,
                        other => {
                            *other = FramePayload::Video(Default::default());
                            match other {
                                FramePayload::Video(buf) => buf,
                                _ => unreachable!(),
                            }
                        }
                    };
                    buf.format = Some(*format);
                    buf.strides = *strides;
                    buf.data.clear();
                    buf.data.extend_from_slice(data);
                });
                if !published {
                    break;
                }
            }
            Ok(DecodeStatus::Eof) => {
                finished.store(dec.pkt_serial(), Ordering::Release);
                if dec.queue.is_aborted() {
                    break;
                }
                // 这代数据放完了；继续等下一个 Flush（seek 回放）
            }
            Ok(DecodeStatus::Aborted) => break,
            Err(e) => {
                error!("❌ 视频解码线程出错退出: {}", e);
                break;
            }
        }
    }
    info!("🛑 视频解码线程退出");
}

/// 音频解码线程：Decoder → 音频 FrameQueue
pub fn audio_loop(mut dec: Decoder, frames: Arc<FrameQueue>, finished: FinishedFlag) {
    info!("🔊 音频解码线程启动");
    let mut unit = DecodedUnit::empty_audio();
    loop {
        match dec.decode_next(&mut unit) {
            Ok(DecodeStatus::Frame) => {
                let DecodedUnit::Audio {
                    pts,
                    sample_rate,
                    channels,
                    samples,
                } = &mut unit
                else {
                    unreachable!()
                };
                if *sample_rate == 0 || *channels == 0 {
                    warn!("音频帧缺少采样率/声道信息，跳过");
                    continue;
                }
                let nb = samples.len() / *channels as usize;
                let duration = nb as f64 / *sample_rate as f64;
                let serial = dec.pkt_serial();
                let published = frames.push_with(|f| {
                    f.serial = serial;
                    f.pts = *pts;
                    f.duration = duration;
                    let buf = match &mut f.payload {
                        FramePayload::Audio(buf) => buf,
                        other => {
                            *other = FramePayload::Audio(Default::default());
                            match other {
                                FramePayload::Audio(buf) => buf,
                                _ => unreachable!(),
                            }
                        }
                    };
                    buf.sample_rate = *sample_rate;
                    buf.channels = *channels;
                    buf.samples.clear();
                    buf.samples.extend_from_slice(samples);
                });
                if !published {
                    break;
                }
            }
            Ok(DecodeStatus::Eof) => {
                finished.store(dec.pkt_serial(), Ordering::Release);
                if dec.queue.is_aborted() {
                    break;
                }
            }
            Ok(DecodeStatus::Aborted) => break,
            Err(e) => {
                error!("❌ 音频解码线程出错退出: {}", e);
                break;
            }
        }
    }
    info!("🛑 音频解码线程退出");
}

/// 字幕解码线程：Decoder → 字幕 FrameQueue
pub fn subtitle_loop(mut dec: Decoder, frames: Arc<FrameQueue>, finished: FinishedFlag) {
    info!("💬 字幕解码线程启动");
    let mut unit = DecodedUnit::empty_subtitle();
    loop {
        match dec.decode_next(&mut unit) {
            Ok(DecodeStatus::Frame) => {
                let DecodedUnit::Subtitle { start, end, text } = &mut unit else {
                    unreachable!()
                };
                let serial = dec.pkt_serial();
                let (pts, duration) = (*start, *end - *start);
                let published = frames.push_with(|f| {
                    f.serial = serial;
                    f.pts = pts;
                    f.duration = if duration.is_finite() && duration > 0.0 {
                        duration
                    } else {
                        3.0 // 缺失结束时间时默认显示 3 秒
                    };
                    let sub = match &mut f.payload {
                        FramePayload::Subtitle(sub) => sub,
                        other => {
                            *other = FramePayload::Subtitle(Default::default());
                            match other {
                                FramePayload::Subtitle(sub) => sub,
                                _ => unreachable!(),
                            }
                        }
                    };
                    sub.text.clear();
                    sub.text.push_str(text);
                });
                if !published {
                    break;
                }
            }
            Ok(DecodeStatus::Eof) => {
                finished.store(dec.pkt_serial(), Ordering::Release);
                if dec.queue.is_aborted() {
                    break;
                }
            }
            Ok(DecodeStatus::Aborted) => break,
            Err(e) => {
                error!("❌ 字幕解码线程出错退出: {}", e);
                break;
            }
        }
    }
    info!("🛑 字幕解码线程退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StreamKind;
    use std::collections::VecDeque;

    /// 合成引擎：每个包"解码"成一个音频单元，可以模拟 Again/EOF
    struct StubEngine {
        ready: VecDeque<f64>, // 待吐出的 pts
        again_once: bool,     // 下一次 submit 返回 Again
        drained: bool,
        flushed: usize,
        submitted: Vec<f64>,
    }

    impl StubEngine {
        fn new() -> Self {
            Self {
                ready: VecDeque::new(),
                again_once: false,
                drained: false,
                flushed: 0,
                submitted: Vec::new(),
            }
        }
    }

    impl DecodeEngine for StubEngine {
        fn submit(&mut self, packet: &MediaPacket) -> Result<SubmitOutcome> {
            if self.again_once {
                self.again_once = false;
                return Ok(SubmitOutcome::Again);
            }
            self.submitted.push(packet.pts);
            self.ready.push_back(packet.pts);
            Ok(SubmitOutcome::Consumed)
        }

        fn submit_eof(&mut self) -> Result<()> {
            self.drained = true;
            Ok(())
        }

        fn receive(&mut self, out: &mut DecodedUnit) -> Result<ReceiveOutcome> {
            let Some(pts) = self.ready.pop_front() else {
                if self.drained {
                    return Ok(ReceiveOutcome::Eof);
                }
                return Ok(ReceiveOutcome::NeedInput);
            };
            *out = DecodedUnit::Audio {
                pts,
                sample_rate: 48000,
                channels: 2,
                samples: vec![0.0; 2 * 480], // 10ms
            };
            Ok(ReceiveOutcome::Frame)
        }

        fn flush(&mut self) {
            self.ready.clear();
            self.drained = false;
            self.flushed += 1;
        }
    }

    fn packet(pts: f64) -> MediaPacket {
        MediaPacket {
            stream: StreamKind::Audio,
            data: vec![0u8; 16],
            pts,
            dts: pts,
            duration: 0.01,
            keyframe: false,
        }
    }

    fn setup(engine: StubEngine) -> (Decoder, Arc<PacketQueue>) {
        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let dec = Decoder::new(Box::new(engine), queue.clone(), ReaderWaker::noop());
        (dec, queue)
    }

    #[test]
    fn test_decodes_in_order() {
        let (mut dec, queue) = setup(StubEngine::new());
        queue.push(packet(0.0));
        queue.push(packet(0.01));
        let mut out = DecodedUnit::empty_audio();
        assert_eq!(dec.decode_next(&mut out).unwrap(), DecodeStatus::Frame);
        let DecodedUnit::Audio { pts, .. } = out else {
            panic!()
        };
        assert!((pts - 0.0).abs() < 1e-9);
        assert_eq!(dec.pkt_serial(), queue.serial());
    }

    #[test]
    fn test_eof_marker_finishes_generation() {
        let (mut dec, queue) = setup(StubEngine::new());
        queue.push(packet(0.0));
        queue.push_eof();
        let mut out = DecodedUnit::empty_audio();
        assert_eq!(dec.decode_next(&mut out).unwrap(), DecodeStatus::Frame);
        assert_eq!(dec.decode_next(&mut out).unwrap(), DecodeStatus::Eof);
        assert!(dec.reached_eof());

        // 新的 Flush（seek 回放）开启下一代，EOF 判定随之失效
        queue.push_flush();
        assert!(!dec.reached_eof());
    }

    #[test]
    fn test_stale_packets_discarded_after_flush() {
        let (mut dec, queue) = setup(StubEngine::new());
        queue.push(packet(1.0));
        queue.push(packet(2.0));
        // seek：清空前先入队 Flush，老包序号立刻过期
        queue.push_flush();
        queue.push(packet(10.0));

        let mut out = DecodedUnit::empty_audio();
        assert_eq!(dec.decode_next(&mut out).unwrap(), DecodeStatus::Frame);
        let DecodedUnit::Audio { pts, .. } = out else {
            panic!()
        };
        // 陈旧包（1.0 / 2.0）被静默跳过，产出的是新包
        assert!((pts - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_again_packet_held_as_pending() {
        let mut engine = StubEngine::new();
        engine.again_once = true;
        let (mut dec, queue) = setup(engine);
        queue.push(packet(5.0));

        let mut out = DecodedUnit::empty_audio();
        // 第一次 submit 返回 Again，包保留为 pending 并在下一轮重新提交
        assert_eq!(dec.decode_next(&mut out).unwrap(), DecodeStatus::Frame);
        let DecodedUnit::Audio { pts, .. } = out else {
            panic!()
        };
        assert!((pts - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_audio_pts_carry_forward() {
        struct NoPtsEngine(StubEngine);
        impl DecodeEngine for NoPtsEngine {
            fn submit(&mut self, p: &MediaPacket) -> Result<SubmitOutcome> {
                self.0.submit(p)
            }
            fn submit_eof(&mut self) -> Result<()> {
                self.0.submit_eof()
            }
            fn receive(&mut self, out: &mut DecodedUnit) -> Result<ReceiveOutcome> {
                let r = self.0.receive(out)?;
                if let (ReceiveOutcome::Frame, DecodedUnit::Audio { pts, .. }) = (r, &mut *out) {
                    if self.0.submitted.len() > 1 {
                        *pts = f64::NAN; // 第二个包起引擎丢失 pts
                    }
                }
                Ok(r)
            }
            fn flush(&mut self) {
                self.0.flush()
            }
        }

        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let mut dec = Decoder::new(
            Box::new(NoPtsEngine(StubEngine::new())),
            queue.clone(),
            ReaderWaker::noop(),
        );
        queue.push(packet(1.0));
        queue.push(packet(999.0)); // pts 会被引擎抹掉

        let mut out = DecodedUnit::empty_audio();
        assert_eq!(dec.decode_next(&mut out).unwrap(), DecodeStatus::Frame);
        assert_eq!(dec.decode_next(&mut out).unwrap(), DecodeStatus::Frame);
        let DecodedUnit::Audio { pts, .. } = out else {
            panic!()
        };
        // 顺延基线：1.0 + 480/48000 = 1.01
        assert!((pts - 1.01).abs() < 1e-6, "顺延 pts 错误: {}", pts);
    }

    #[test]
    fn test_drain_surfaces_delayed_frames_at_eof() {
        /// 带重排延迟的引擎：帧一直压在内部缓冲，排空时才逐个吐出
        struct ReorderEngine {
            held: VecDeque<f64>,
            draining: bool,
        }
        impl DecodeEngine for ReorderEngine {
            fn submit(&mut self, p: &MediaPacket) -> Result<SubmitOutcome> {
                self.held.push_back(p.pts);
                Ok(SubmitOutcome::Consumed)
            }
            fn submit_eof(&mut self) -> Result<()> {
                self.draining = true;
                Ok(())
            }
            fn receive(&mut self, out: &mut DecodedUnit) -> Result<ReceiveOutcome> {
                if !self.draining {
                    return Ok(ReceiveOutcome::NeedInput);
                }
                let Some(pts) = self.held.pop_front() else {
                    return Ok(ReceiveOutcome::Eof);
                };
                *out = DecodedUnit::Audio {
                    pts,
                    sample_rate: 48000,
                    channels: 2,
                    samples: vec![0.0; 2 * 480],
                };
                Ok(ReceiveOutcome::Frame)
            }
            fn flush(&mut self) {
                self.held.clear();
                self.draining = false;
            }
        }

        let queue = Arc::new(PacketQueue::new());
        queue.start();
        let mut dec = Decoder::new(
            Box::new(ReorderEngine {
                held: VecDeque::new(),
                draining: false,
            }),
            queue.clone(),
            ReaderWaker::noop(),
        );
        queue.push(packet(0.0));
        queue.push(packet(0.01));
        queue.push(packet(0.02));
        queue.push_eof();

        // 结束标记触发排空：缓冲的延迟帧全部吐出后才是 Eof
        let mut out = DecodedUnit::empty_audio();
        for expected in [0.0, 0.01, 0.02] {
            assert_eq!(dec.decode_next(&mut out).unwrap(), DecodeStatus::Frame);
            let DecodedUnit::Audio { pts, .. } = &out else {
                panic!()
            };
            assert!((pts - expected).abs() < 1e-9, "排空帧顺序错误: {}", pts);
        }
        assert_eq!(dec.decode_next(&mut out).unwrap(), DecodeStatus::Eof);
        assert!(dec.reached_eof());
    }

    #[test]
    fn test_abort_terminates() {
        let (mut dec, queue) = setup(StubEngine::new());
        queue.abort();
        let mut out = DecodedUnit::empty_audio();
        assert_eq!(dec.decode_next(&mut out).unwrap(), DecodeStatus::Aborted);
    }
}
