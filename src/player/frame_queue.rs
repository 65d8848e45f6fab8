use crate::core::{AudioBuffer, SubtitleText, VideoBuffer};
use crate::player::packet_queue::PacketQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// 解码后的一帧（视频/音频/字幕共用外壳）
///
/// 帧对象在环形队列初始化时一次性分配，之后原地复用；
/// payload 里的缓冲区只增长不释放，避免每帧分配。
#[derive(Debug, Default)]
pub struct Frame {
    /// 解码该帧的包所属的序号
    pub serial: u64,
    /// 显示时间戳（秒），NaN = 未知
    pub pts: f64,
    /// 估计显示时长（秒）
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    /// 是否已上传到纹理（视频）
    pub uploaded: bool,
    pub payload: FramePayload,
}

#[derive(Debug, Default)]
pub enum FramePayload {
    #[default]
    Empty,
    Video(VideoBuffer),
    Audio(AudioBuffer),
    Subtitle(SubtitleText),
}

/// 不持锁传出的帧元数据快照
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub serial: u64,
    pub pts: f64,
    pub duration: f64,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    fn info(&self) -> FrameInfo {
        FrameInfo {
            serial: self.serial,
            pts: self.pts,
            duration: self.duration,
            width: self.width,
            height: self.height,
        }
    }
}

struct Ring {
    frames: Vec<Frame>,
    rindex: usize,
    windex: usize,
    size: usize,
    /// keep_last 模式下首帧出队后固定为 1：rindex 指向"上一次显示的帧"
    rindex_shown: usize,
}

/// 固定容量的解码帧环形队列
///
/// 写端（解码线程）原地填充空闲槽位后发布；读端（呈现侧）可以
/// 先窥视再消费。绑定一个 PacketQueue 以共享 abort 与序号。
pub struct FrameQueue {
    ring: Mutex<Ring>,
    cond: Condvar,
    packets: Arc<PacketQueue>,
    capacity: usize,
    keep_last: bool,
}

impl FrameQueue {
    pub fn new(packets: Arc<PacketQueue>, capacity: usize, keep_last: bool) -> Self {
        assert!(capacity > 0);
        let mut frames = Vec::with_capacity(capacity);
        frames.resize_with(capacity, Frame::default);
        Self {
            ring: Mutex::new(Ring {
                frames,
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
            }),
            cond: Condvar::new(),
            packets,
            capacity,
            keep_last,
        }
    }

    /// 绑定的 PacketQueue
    pub fn packets(&self) -> &Arc<PacketQueue> {
        &self.packets
    }

    /// 等待空闲槽位并原地填充、发布一帧
    ///
    /// 相当于 PeekWritable + Enqueue：fill 在持锁状态下直接写入
    /// 预分配的帧对象。返回 false 表示队列已 abort，未发布任何帧。
    pub fn push_with(&self, fill: impl FnOnce(&mut Frame)) -> bool {
        let mut ring = self.ring.lock();
        while ring.size >= self.capacity && !self.packets.is_aborted() {
            self.cond.wait(&mut ring);
        }
        if self.packets.is_aborted() {
            return false;
        }
        let w = ring.windex;
        let frame = &mut ring.frames[w];
        frame.uploaded = false;
        fill(frame);
        ring.windex = (ring.windex + 1) % self.capacity;
        ring.size += 1;
        self.cond.notify_all();
        true
    }

    /// 阻塞等待至少一帧未显示数据；返回 false 表示已 abort
    pub fn wait_readable(&self) -> bool {
        let mut ring = self.ring.lock();
        while ring.size - ring.rindex_shown == 0 && !self.packets.is_aborted() {
            self.cond.wait(&mut ring);
        }
        !self.packets.is_aborted()
    }

    /// 当前待显示帧的元数据（调用前须确认 undisplayed() > 0）
    pub fn peek(&self) -> FrameInfo {
        let ring = self.ring.lock();
        ring.frames[(ring.rindex + ring.rindex_shown) % self.capacity].info()
    }

    /// 再往后一帧的元数据
    pub fn peek_next(&self) -> FrameInfo {
        let ring = self.ring.lock();
        ring.frames[(ring.rindex + ring.rindex_shown + 1) % self.capacity].info()
    }

    /// 上一次显示过的帧的元数据（keep_last 模式下始终可用）
    pub fn peek_last(&self) -> FrameInfo {
        let ring = self.ring.lock();
        ring.frames[ring.rindex].info()
    }

    /// 访问当前待显示帧的内容（持锁回调，不消费）
    pub fn with_current<R>(&self, f: impl FnOnce(&mut Frame) -> R) -> R {
        let mut ring = self.ring.lock();
        let idx = (ring.rindex + ring.rindex_shown) % self.capacity;
        f(&mut ring.frames[idx])
    }

    /// 消费当前帧，推进读游标
    ///
    /// keep_last 模式下首次调用只把 rindex_shown 置 1（保留可显示帧），
    /// 之后每次正常推进。
    pub fn advance(&self) {
        let mut ring = self.ring.lock();
        if self.keep_last && ring.rindex_shown == 0 {
            ring.rindex_shown = 1;
            return;
        }
        ring.rindex = (ring.rindex + 1) % self.capacity;
        ring.size -= 1;
        self.cond.notify_all();
    }

    /// 未显示帧数（不含 keep_last 保留的那一帧）
    pub fn undisplayed(&self) -> usize {
        let ring = self.ring.lock();
        ring.size - ring.rindex_shown
    }

    /// 唤醒所有等待者（abort 流程使用）
    pub fn signal(&self) {
        let _ring = self.ring.lock();
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn queue(capacity: usize, keep_last: bool) -> (Arc<FrameQueue>, Arc<PacketQueue>) {
        let packets = Arc::new(PacketQueue::new());
        packets.start();
        (
            Arc::new(FrameQueue::new(packets.clone(), capacity, keep_last)),
            packets,
        )
    }

    #[test]
    fn test_ring_capacity_never_exceeded() {
        let (fq, packets) = queue(3, false);
        for i in 0..3 {
            assert!(fq.push_with(|f| f.pts = i as f64));
        }
        assert_eq!(fq.undisplayed(), 3);

        // 队列已满：写线程必须阻塞，直到读端消费
        let fq2 = fq.clone();
        let pushed = Arc::new(AtomicUsize::new(0));
        let pushed2 = pushed.clone();
        let handle = std::thread::spawn(move || {
            fq2.push_with(|f| f.pts = 99.0);
            pushed2.store(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(pushed.load(Ordering::SeqCst), 0, "写端越过了容量上限");
        assert_eq!(fq.undisplayed(), 3);

        fq.advance();
        handle.join().unwrap();
        assert_eq!(pushed.load(Ordering::SeqCst), 1);
        assert_eq!(fq.undisplayed(), 3);
        let _ = packets;
    }

    #[test]
    fn test_keep_last_first_dequeue_is_noop() {
        let (fq, _packets) = queue(3, true);
        assert!(fq.push_with(|f| f.pts = 1.0));
        assert!(fq.push_with(|f| f.pts = 2.0));
        assert_eq!(fq.undisplayed(), 2);

        // 首次 advance 不减少未显示计数
        fq.advance();
        assert_eq!(fq.undisplayed(), 1);
        assert!((fq.peek_last().pts - 1.0).abs() < 1e-9);
        assert!((fq.peek().pts - 2.0).abs() < 1e-9);

        // 之后的 advance 正常推进
        fq.advance();
        assert_eq!(fq.undisplayed(), 0);
        assert!((fq.peek_last().pts - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_fifo_order_and_reuse() {
        let (fq, _packets) = queue(2, false);
        assert!(fq.push_with(|f| {
            f.pts = 1.0;
            f.payload = FramePayload::Subtitle(SubtitleText {
                text: "第一条".into(),
            });
        }));
        assert!((fq.peek().pts - 1.0).abs() < 1e-9);
        fq.advance();
        assert!(fq.push_with(|f| f.pts = 2.0));
        assert!(fq.push_with(|f| f.pts = 3.0));
        assert!((fq.peek().pts - 2.0).abs() < 1e-9);
        fq.advance();
        assert!((fq.peek().pts - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_abort_unblocks_writer_and_reader() {
        let (fq, packets) = queue(1, false);
        assert!(fq.push_with(|f| f.pts = 0.0));

        let fq2 = fq.clone();
        let writer = std::thread::spawn(move || fq2.push_with(|f| f.pts = 1.0));
        std::thread::sleep(Duration::from_millis(20));
        packets.abort();
        fq.signal();
        assert!(!writer.join().unwrap());

        let fq3 = fq.clone();
        let reader = std::thread::spawn(move || fq3.wait_readable());
        assert!(!reader.join().unwrap() || fq.undisplayed() > 0);
    }
}
