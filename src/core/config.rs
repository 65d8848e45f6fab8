use crate::core::MasterClockKind;

/// 播放管线调优参数
///
/// 这些阈值是长期实践得出的经验值，作为可配置的默认值保留，
/// 不是从第一性原理推导出来的。
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Reader 背压：所有队列字节总量上限
    pub max_queue_bytes: usize,
    /// Reader 背压：单个队列认为"足够"的最小包数
    pub min_packets: usize,
    /// Reader 背压：单个队列认为"足够"的最小缓冲时长（秒）
    pub min_queued_duration: f64,
    /// Reader 背压等待的最长时间（毫秒）
    pub reader_wait_ms: u64,

    /// 视频同步：低于该阈值不做修正（秒）
    pub sync_threshold_min: f64,
    /// 视频同步：高于该阈值强制修正（秒）
    pub sync_threshold_max: f64,
    /// 视频同步：延迟超过该值时按差值整体拉伸而不是翻倍（秒）
    pub framedup_threshold: f64,
    /// 时钟偏差超过该值视为失步，直接跳变对齐（秒）
    pub nosync_threshold: f64,
    /// 帧间隔超过该值视为不可信，回退到估计时长（秒）
    pub max_frame_duration: f64,

    /// 音频同步：采样数修正的最大百分比
    pub sample_correction_percent: f64,
    /// 音频同步：开始修正前累计的偏差样本数
    pub audio_diff_avg_nb: u32,

    /// 帧环形队列容量
    pub video_queue_len: usize,
    pub audio_queue_len: usize,
    pub subtitle_queue_len: usize,

    /// 主时钟选择（默认音频）
    pub master: MasterClockKind,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_queue_bytes: 15 * 1024 * 1024,
            min_packets: 25,
            min_queued_duration: 1.0,
            reader_wait_ms: 10,

            sync_threshold_min: 0.04,
            sync_threshold_max: 0.1,
            framedup_threshold: 0.1,
            nosync_threshold: 10.0,
            max_frame_duration: 10.0,

            sample_correction_percent: 10.0,
            audio_diff_avg_nb: 20,

            video_queue_len: 3,
            audio_queue_len: 9,
            subtitle_queue_len: 16,

            master: MasterClockKind::Audio,
        }
    }
}

impl PlaybackConfig {
    /// 音频偏差指数平滑系数：audio_diff_avg_nb 帧后剩余权重 1%
    pub fn audio_diff_avg_coef(&self) -> f64 {
        (0.01f64).powf(1.0 / self.audio_diff_avg_nb as f64)
    }
}
