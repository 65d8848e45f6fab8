//! 播放内核：解封装 → 解码 → 同步 → 呈现管线
//!
//! 核心管线（player 模块）只依赖抽象边界，不直接接触
//! FFmpeg/cpal；真实后端由 media 模块装配。嵌入方通过
//! [`Session`] 驱动播放，从共享纹理取画面。

pub mod core;
pub mod media;
pub mod player;

pub use crate::core::{MasterClockKind, MediaInfo, PlaybackConfig, PlaybackState, PlayerError, Result};
pub use crate::media::FfmpegBackend;
pub use crate::player::{Session, SharedTexture};
