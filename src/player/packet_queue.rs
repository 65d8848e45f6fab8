use crate::player::source::MediaPacket;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 队列中的一项：普通数据包或哨兵
#[derive(Debug)]
pub enum QueuedPacket {
    Data(MediaPacket),
    /// 不连续点标记（seek 之后），入队时令序号 +1
    Flush,
    /// 流结束标记
    Eof,
}

struct QueueState {
    items: VecDeque<(QueuedPacket, u64)>,
    byte_size: usize,
    duration: f64, // 累计时长（秒）
    aborted: bool,
}

/// 压缩包 FIFO 队列 - Reader 与解码线程之间的边界
///
/// 每个包入队时打上当时的序号（serial）。序号只增不减，
/// 仅在入队 Flush 哨兵时 +1；解码侧据此识别 seek 之前的陈旧数据。
pub struct PacketQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    /// 序号镜像，供时钟和播放端无锁读取
    serial: Arc<AtomicU64>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                byte_size: 0,
                duration: 0.0,
                aborted: false,
            }),
            cond: Condvar::new(),
            serial: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 启动队列：入队第一个 Flush 哨兵（序号从 1 开始）
    pub fn start(&self) {
        self.push_flush();
    }

    /// 入队普通数据包
    pub fn push(&self, packet: MediaPacket) {
        let mut state = self.state.lock();
        if state.aborted {
            return;
        }
        state.byte_size += packet.data.len();
        if packet.duration.is_finite() {
            state.duration += packet.duration;
        }
        let serial = self.serial.load(Ordering::Acquire);
        state.items.push_back((QueuedPacket::Data(packet), serial));
        self.cond.notify_all();
    }

    /// 入队 Flush 哨兵并递增序号
    pub fn push_flush(&self) {
        let mut state = self.state.lock();
        if state.aborted {
            return;
        }
        let serial = self.serial.fetch_add(1, Ordering::AcqRel) + 1;
        state.items.push_back((QueuedPacket::Flush, serial));
        self.cond.notify_all();
    }

    /// 入队流结束标记
    pub fn push_eof(&self) {
        let mut state = self.state.lock();
        if state.aborted {
            return;
        }
        let serial = self.serial.load(Ordering::Acquire);
        state.items.push_back((QueuedPacket::Eof, serial));
        self.cond.notify_all();
    }

    /// 出队一个包，返回该包入队时捕获的序号
    ///
    /// blocking 为 true 时阻塞直到有数据或被 abort；
    /// 返回 None 表示已 abort（或非阻塞模式下队列为空）。
    pub fn pop(&self, blocking: bool) -> Option<(QueuedPacket, u64)> {
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return None;
            }
            if let Some((pkt, serial)) = state.items.pop_front() {
                if let QueuedPacket::Data(p) = &pkt {
                    state.byte_size -= p.data.len();
                    if p.duration.is_finite() {
                        state.duration -= p.duration;
                    }
                }
                self.cond.notify_all();
                return Some((pkt, serial));
            }
            if !blocking {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    /// 清空全部数据包并重置字节/时长统计；序号保持不变
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.items.clear();
        state.byte_size = 0;
        state.duration = 0.0;
        self.cond.notify_all();
    }

    /// 终止队列：唤醒所有等待者，之后 pop 永远返回 None。不可恢复。
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// 当前序号
    pub fn serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    /// 序号镜像句柄，用于绑定 PtsClock
    pub fn serial_handle(&self) -> Arc<AtomicU64> {
        self.serial.clone()
    }

    // ---- Reader 背压统计 ----

    pub fn packet_count(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn byte_size(&self) -> usize {
        self.state.lock().byte_size
    }

    pub fn duration(&self) -> f64 {
        self.state.lock().duration
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}
