use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// 进程内单调时间（秒），所有时钟与帧定时器共用同一基准
pub fn now_seconds() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// 播放时钟 - 用于音视频同步
///
/// 记录"最近一次已知的 pts + 记录时刻"，查询时按墙钟外推。
/// 绑定了 PacketQueue 序号的时钟在 seek 之后（序号不再匹配时）
/// 返回 NaN，避免陈旧时间污染同步判断。
pub struct PtsClock {
    inner: Mutex<ClockInner>,
    /// 绑定的 PacketQueue 当前序号；None 表示不做失效检查（外部时钟）
    queue_serial: Option<Arc<AtomicU64>>,
}

struct ClockInner {
    pts: f64,          // 基准 pts（秒），NaN = 尚未设置
    last_updated: f64, // 基准时刻（now_seconds）
    serial: u64,       // 设置 pts 时捕获的序号
    paused: bool,
}

impl PtsClock {
    pub fn new(queue_serial: Option<Arc<AtomicU64>>) -> Self {
        Self {
            inner: Mutex::new(ClockInner {
                pts: f64::NAN,
                last_updated: now_seconds(),
                serial: 0,
                paused: false,
            }),
            queue_serial,
        }
    }

    /// 以当前时刻为基准设置 pts
    pub fn set(&self, pts: f64, serial: u64) {
        self.set_at(pts, serial, now_seconds());
    }

    /// 以指定时刻为基准设置 pts（音频回调的时机略有滞后，用它补偿）
    pub fn set_at(&self, pts: f64, serial: u64, time: f64) {
        let mut inner = self.inner.lock();
        inner.pts = pts;
        inner.last_updated = time;
        inner.serial = serial;
    }

    /// 当前时间线位置（秒）
    ///
    /// 序号不匹配或尚未设置时返回 NaN；暂停时返回基准 pts 本身。
    pub fn get(&self) -> f64 {
        let inner = self.inner.lock();
        if let Some(q) = &self.queue_serial {
            if q.load(Ordering::Acquire) != inner.serial {
                return f64::NAN;
            }
        }
        if inner.paused {
            inner.pts
        } else {
            inner.pts + (now_seconds() - inner.last_updated)
        }
    }

    /// 设置 pts 时捕获的序号
    pub fn serial(&self) -> u64 {
        self.inner.lock().serial
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// 切换暂停状态；恢复/暂停都先把外推结果落回基准，避免跳变
    pub fn set_paused(&self, paused: bool) {
        let mut inner = self.inner.lock();
        if !inner.pts.is_nan() && !inner.paused {
            inner.pts += now_seconds() - inner.last_updated;
        }
        inner.last_updated = now_seconds();
        inner.paused = paused;
    }

    /// 向另一个时钟对齐：自身无效或偏差超过阈值时直接跳变
    pub fn sync_to(&self, other: &PtsClock, nosync_threshold: f64) {
        let mine = self.get();
        let theirs = other.get();
        if !theirs.is_nan() && (mine.is_nan() || (mine - theirs).abs() > nosync_threshold) {
            self.set(theirs, other.serial());
        }
    }
}

/// 一次播放会话的三个时钟及主时钟选择
pub struct ClockSet {
    pub audio: PtsClock,
    pub video: PtsClock,
    pub external: PtsClock,
    master: crate::core::MasterClockKind,
    has_audio: bool,
    has_video: bool,
}

impl ClockSet {
    /// audio/video 分别绑定各自 PacketQueue 的序号镜像；没有对应流时传 None
    pub fn new(
        master: crate::core::MasterClockKind,
        audio_serial: Option<Arc<AtomicU64>>,
        video_serial: Option<Arc<AtomicU64>>,
    ) -> Self {
        let has_audio = audio_serial.is_some();
        let has_video = video_serial.is_some();
        Self {
            audio: PtsClock::new(audio_serial),
            video: PtsClock::new(video_serial),
            external: PtsClock::new(None),
            master,
            has_audio,
            has_video,
        }
    }

    /// 实际生效的主时钟：指定的流不存在时逐级回退
    pub fn effective_master(&self) -> crate::core::MasterClockKind {
        use crate::core::MasterClockKind::*;
        match self.master {
            Video if self.has_video => Video,
            Video | Audio if self.has_audio => Audio,
            Video | Audio => External,
            External => External,
        }
    }

    /// 主时钟的当前时间线位置（秒）
    pub fn master_time(&self) -> f64 {
        use crate::core::MasterClockKind::*;
        match self.effective_master() {
            Audio => self.audio.get(),
            Video => self.video.get(),
            External => self.external.get(),
        }
    }

    /// 暂停/恢复对三个时钟一起生效
    pub fn set_paused(&self, paused: bool) {
        self.audio.set_paused(paused);
        self.video.set_paused(paused);
        self.external.set_paused(paused);
    }
}
