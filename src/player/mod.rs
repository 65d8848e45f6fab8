//! 播放管线：Reader → 解码线程 → 帧队列 → 呈现端
//!
//! 所有模块都只依赖 source/decoder 等抽象边界，
//! 不直接接触 FFmpeg/cpal；真实后端在 media 模块装配。

pub mod audio_playback;
pub mod decoder;
pub mod frame_queue;
pub mod packet_queue;
pub mod reader;
pub mod session;
pub mod source;
pub mod video_playback;

pub use audio_playback::{AudioDevice, AudioPlayback, Resampler};
pub use decoder::{DecodeEngine, DecodedUnit, Decoder, ReceiveOutcome, SubmitOutcome};
pub use frame_queue::{Frame, FrameInfo, FramePayload, FrameQueue};
pub use packet_queue::{PacketQueue, QueuedPacket};
pub use reader::{Reader, ReaderCommand, ReaderWaker};
pub use session::{MediaBackend, Session, Transport};
pub use source::{MediaPacket, PacketSource, ReadOutcome, SeekRequest, StreamDesc};
pub use video_playback::{PixelConverter, RgbaTextureSink, SharedTexture, TextureSink, VideoPlayback};
