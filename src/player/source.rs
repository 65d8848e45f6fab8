use crate::core::{Result, StreamKind};

/// 一个压缩数据包（已脱离具体容器格式）
///
/// 时间戳在读出时已经换算成秒，管线内部不再关心容器的 time_base。
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub stream: StreamKind,
    pub data: Vec<u8>,
    /// 显示时间戳（秒），NaN = 未知
    pub pts: f64,
    /// 解码时间戳（秒），NaN = 未知
    pub dts: f64,
    /// 时长（秒），NaN = 未知
    pub duration: f64,
    pub keyframe: bool,
}

/// 容器里一条被选中的流的描述
#[derive(Debug, Clone)]
pub struct StreamDesc {
    pub kind: StreamKind,
    pub codec: String,
    /// 标称帧率（视频），未知为 0
    pub frame_rate: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub width: u32,
    pub height: u32,
}

/// Seek 请求
#[derive(Debug, Clone, Copy)]
pub struct SeekRequest {
    /// 目标位置：秒（by_bytes 时为字节偏移）
    pub target: f64,
    /// 相对窗口：容器应落在 [target - rel, target] 内（rel < 0 时为 [target, target - rel]）
    pub rel: f64,
    pub by_bytes: bool,
}

/// 一次读包的结果
#[derive(Debug)]
pub enum ReadOutcome {
    Packet(MediaPacket),
    /// 文件读尽。某些容器的 EOF 是粘性的：之后每次读都会继续返回 Eof，
    /// 直到 seek 为止，Reader 必须容忍这一点。
    Eof,
}

/// 解封装端抽象 - 真实实现见 media::demux，测试里用合成实现
pub trait PacketSource: Send {
    /// 被选中的活动流（每种类型至多一条）
    fn streams(&self) -> &[StreamDesc];

    /// 总时长（秒），未知返回 NaN
    fn duration(&self) -> f64;

    /// 读下一个包。Err 表示真正的 I/O 故障，Reader 会就此终止。
    fn read(&mut self) -> Result<ReadOutcome>;

    /// 在 [min, max] 窗口内定位到目标时间戳
    fn seek(&mut self, req: &SeekRequest) -> Result<()>;
}
