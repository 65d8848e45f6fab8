use crate::core::{ClockSet, PlaybackConfig, StreamKind};
use crate::player::decoder::FinishedFlag;
use crate::player::frame_queue::FrameQueue;
use crate::player::packet_queue::PacketQueue;
use crate::player::session::Transport;
use crate::player::source::{PacketSource, ReadOutcome, SeekRequest};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use log::{error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Reader 线程命令
pub enum ReaderCommand {
    Seek(SeekRequest),
    /// 解码队列见底时解码线程用它打断 Reader 的背压小睡
    Wake,
    Stop,
}

/// 解码线程持有的 Reader 唤醒句柄
#[derive(Clone)]
pub struct ReaderWaker {
    tx: Option<Sender<ReaderCommand>>,
}

impl ReaderWaker {
    pub fn new(tx: Sender<ReaderCommand>) -> Self {
        Self { tx: Some(tx) }
    }

    /// 不连接任何 Reader（测试用）
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn wake(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ReaderCommand::Wake);
        }
    }
}

/// 一条活动流在 Reader 侧的句柄
pub struct StreamSlot {
    pub queue: Arc<PacketQueue>,
    pub frames: Arc<FrameQueue>,
    /// 解码线程发布的 eof_serial
    pub finished: FinishedFlag,
}

/// 容器读取线程 - 管线里唯一的生产者
///
/// 单线程循环：处理 seek → 背压节流 → 结束判定 → 读包分发。
/// 背压是整个管线唯一的流控点：队列字节总量超限，或所有活动流
/// 都已缓冲"足够"时，小睡至多 10ms（可被命令打断）。
pub struct Reader {
    source: Box<dyn PacketSource>,
    slots: [Option<StreamSlot>; StreamKind::COUNT],
    clocks: Arc<ClockSet>,
    transport: Arc<Transport>,
    cfg: PlaybackConfig,
    rx: Receiver<ReaderCommand>,
    /// 已为本次 EOF 发过结束标记（容器 EOF 是粘性的，只发一次）
    eof_sent: bool,
}

impl Reader {
    /// 启动 Reader 线程，返回命令发送端与线程句柄
    pub fn spawn(
        source: Box<dyn PacketSource>,
        slots: [Option<StreamSlot>; StreamKind::COUNT],
        clocks: Arc<ClockSet>,
        transport: Arc<Transport>,
        cfg: PlaybackConfig,
    ) -> (Sender<ReaderCommand>, JoinHandle<()>) {
        let (tx, rx) = unbounded();
        let reader = Reader {
            source,
            slots,
            clocks,
            transport,
            cfg,
            rx,
            eof_sent: false,
        };
        let handle = thread::Builder::new()
            .name("reader".into())
            .spawn(move || reader.run())
            .expect("无法创建 Reader 线程");
        (tx, handle)
    }

    fn run(mut self) {
        info!("📖 Reader 线程启动");
        let mut pending_seek: Option<SeekRequest> = None;

        'outer: loop {
            // 优先排空命令（非阻塞）
            loop {
                match self.rx.try_recv() {
                    Ok(ReaderCommand::Stop) => break 'outer,
                    Ok(ReaderCommand::Seek(req)) => pending_seek = Some(req),
                    Ok(ReaderCommand::Wake) => {}
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'outer,
                }
            }

            // (1) 待处理的 seek
            if let Some(req) = pending_seek.take() {
                self.do_seek(&req);
            }

            // (2) 背压：唯一的流控点
            if self.should_throttle() {
                match self.nap(&mut pending_seek) {
                    NapOutcome::Continue => continue,
                    NapOutcome::Stop => break 'outer,
                }
            }

            // (3) 全部流解码到头且没有未显示帧 → 播放完成
            if self.eof_sent && self.all_finished() {
                info!("🏁 所有流播放完毕，Reader 线程结束");
                self.transport.set_finished();
                break 'outer;
            }

            // (4) 读下一个包
            match self.source.read() {
                Ok(ReadOutcome::Packet(pkt)) => {
                    if let Some(slot) = &self.slots[pkt.stream.index()] {
                        slot.queue.push(pkt);
                    }
                    // 未播放的流：直接丢弃
                }
                Ok(ReadOutcome::Eof) => {
                    if !self.eof_sent {
                        info!("📄 容器读尽，向各流发送结束标记");
                        for slot in self.slots.iter().flatten() {
                            slot.queue.push_eof();
                        }
                        self.eof_sent = true;
                    }
                    // 粘性 EOF：小睡后继续循环（等待 seek 或播放完成）
                    if let NapOutcome::Stop = self.nap(&mut pending_seek) {
                        break 'outer;
                    }
                }
                Err(e) => {
                    // 真正的 I/O 故障是致命的：解封装状态无法安全恢复
                    error!("❌ 读包失败，Reader 线程终止: {}", e);
                    self.transport.set_failed();
                    break 'outer;
                }
            }
        }

        info!("🛑 Reader 线程退出");
    }

    /// 执行 seek：容器定位 → 清空各队列并入队 Flush → 重置外部时钟
    fn do_seek(&mut self, req: &SeekRequest) {
        info!(
            "⏩ Seek 到 {:.3}{}",
            req.target,
            if req.by_bytes { " (字节)" } else { "s" }
        );
        match self.source.seek(req) {
            Err(e) => warn!("⚠ Seek 失败，保持原位置: {}", e),
            Ok(()) => {
                for slot in self.slots.iter().flatten() {
                    slot.queue.clear();
                    slot.queue.push_flush();
                }
                if req.by_bytes {
                    // 字节定位无法换算时间线位置
                    self.clocks.external.set(f64::NAN, 0);
                } else {
                    self.clocks.external.set(req.target, 0);
                }
            }
        }
        self.eof_sent = false;
        // 暂停状态下 seek：向前走恰好一帧，让画面落到目标位置
        if self.transport.is_paused() {
            self.transport.step_to_next_frame();
        }
    }

    /// 背压小睡：至多 reader_wait_ms，可被命令打断
    fn nap(&mut self, pending_seek: &mut Option<SeekRequest>) -> NapOutcome {
        match self
            .rx
            .recv_timeout(Duration::from_millis(self.cfg.reader_wait_ms))
        {
            Ok(ReaderCommand::Stop) => NapOutcome::Stop,
            Ok(ReaderCommand::Seek(req)) => {
                *pending_seek = Some(req);
                NapOutcome::Continue
            }
            Ok(ReaderCommand::Wake) => NapOutcome::Continue,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => NapOutcome::Continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => NapOutcome::Stop,
        }
    }

    /// 队列字节总量超限，或每条活动流都已缓冲"足够"
    fn should_throttle(&self) -> bool {
        let total: usize = self
            .slots
            .iter()
            .flatten()
            .map(|s| s.queue.byte_size())
            .sum();
        if total > self.cfg.max_queue_bytes {
            return true;
        }
        self.slots
            .iter()
            .flatten()
            .all(|s| self.has_enough(&s.queue))
    }

    fn has_enough(&self, queue: &PacketQueue) -> bool {
        queue.is_aborted()
            || (queue.packet_count() > self.cfg.min_packets
                && (queue.duration() <= 0.0 || queue.duration() > self.cfg.min_queued_duration))
    }

    /// 音视频流都解码到本代 EOF 且帧队列里没有未显示的帧。
    /// 字幕只在视频呈现时顺带消费，末尾可能留下未到期的字幕，
    /// 所以不参与结束判定；已 abort 的流同样跳过。
    fn all_finished(&self) -> bool {
        [StreamKind::Video, StreamKind::Audio]
            .into_iter()
            .all(|kind| match &self.slots[kind.index()] {
                None => true,
                Some(s) => {
                    s.queue.is_aborted()
                        || (s.finished.load(Ordering::Acquire) == s.queue.serial()
                            && s.frames.undisplayed() == 0)
                }
            })
    }
}

enum NapOutcome {
    Continue,
    Stop,
}
