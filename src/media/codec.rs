use crate::core::{PixelFormat, PlayerError, Result};
use crate::player::decoder::{DecodeEngine, DecodedUnit, ReceiveOutcome, SubmitOutcome};
use crate::player::source::MediaPacket;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, software, util};
use log::{debug, warn};
use std::ffi::CStr;

/// 引擎内部统一用微秒 time_base 传递时间戳
///
/// 管线两端都以秒计时；解码器只要求 pts 单调可比，
/// 不关心绝对刻度，所以进出各做一次微秒换算即可。
const TICKS_PER_SECOND: f64 = 1_000_000.0;

fn seconds_to_ticks(sec: f64) -> Option<i64> {
    if sec.is_nan() {
        None
    } else {
        Some((sec * TICKS_PER_SECOND) as i64)
    }
}

fn ticks_to_seconds(ticks: Option<i64>) -> f64 {
    match ticks {
        Some(t) => t as f64 / TICKS_PER_SECOND,
        None => f64::NAN,
    }
}

/// 从管线包重建 FFmpeg 包
fn rebuild_packet(packet: &MediaPacket) -> ffmpeg::Packet {
    let mut pkt = ffmpeg::Packet::copy(&packet.data);
    pkt.set_pts(seconds_to_ticks(packet.pts));
    pkt.set_dts(seconds_to_ticks(packet.dts));
    pkt
}

/// FFmpeg 视频解码引擎（软件解码）
///
/// 输出原生像素格式（YUV420P/NV12 直通）；其他格式先用内部
/// scaler 归一到 YUV420P，RGBA 转换留到呈现端按需做。
pub struct VideoEngine {
    decoder: codec::decoder::Video,
    normalizer: Option<software::scaling::Context>,
}

// SwsContext 不是 Send，但引擎只在单个解码线程中使用
unsafe impl Send for VideoEngine {}

impl VideoEngine {
    pub fn new(params: codec::Parameters) -> Result<Self> {
        let context = codec::context::Context::from_parameters(params)?;
        let decoder = context.decoder().video()?;
        debug!(
            "视频解码器: {}x{}, 格式: {:?}",
            decoder.width(),
            decoder.height(),
            decoder.format()
        );
        Ok(Self {
            decoder,
            normalizer: None,
        })
    }

    /// 把解码帧搬进管线单元（平面紧凑复制）
    fn export_frame(&mut self, frame: &util::frame::Video, out: &mut DecodedUnit) -> Result<()> {
        let mut normalized = None;
        let (frame, format) = match frame.format() {
            util::format::Pixel::YUV420P => (frame, PixelFormat::YUV420P),
            util::format::Pixel::NV12 => (frame, PixelFormat::NV12),
            other => {
                // 不常见的格式归一到 YUV420P
                if self.normalizer.is_none() {
                    debug!("归一像素格式 {:?} → YUV420P", other);
                    self.normalizer = Some(software::scaling::Context::get(
                        other,
                        frame.width(),
                        frame.height(),
                        util::format::Pixel::YUV420P,
                        frame.width(),
                        frame.height(),
                        software::scaling::Flags::BILINEAR,
                    )?);
                }
                let mut converted = util::frame::Video::empty();
                self.normalizer.as_mut().unwrap().run(frame, &mut converted)?;
                converted.set_pts(frame.pts());
                (&*normalized.insert(converted), PixelFormat::YUV420P)
            }
        };

        let DecodedUnit::Video {
            pts,
            width,
            height,
            format: out_format,
            data,
            strides,
        } = out
        else {
            return Err(PlayerError::DecodeError("视频引擎收到非视频单元".into()));
        };
        *pts = ticks_to_seconds(frame.pts());
        *width = frame.width();
        *height = frame.height();
        *out_format = format;
        data.clear();
        *strides = [0; 3];
        for plane in 0..frame.planes() {
            strides[plane] = frame.stride(plane);
            data.extend_from_slice(frame.data(plane));
        }
        Ok(())
    }
}

impl DecodeEngine for VideoEngine {
    fn submit(&mut self, packet: &MediaPacket) -> Result<SubmitOutcome> {
        let pkt = rebuild_packet(packet);
        match self.decoder.send_packet(&pkt) {
            Ok(()) => Ok(SubmitOutcome::Consumed),
            Err(ffmpeg::Error::Other { errno: 11 }) => Ok(SubmitOutcome::Again), // EAGAIN
            Err(ffmpeg::Error::Eof) => Ok(SubmitOutcome::Again),
            Err(e) => Err(e.into()),
        }
    }

    fn submit_eof(&mut self) -> Result<()> {
        // 空包让解码器进入排空，吐出重排缓冲里的延迟帧
        match self.decoder.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn receive(&mut self, out: &mut DecodedUnit) -> Result<ReceiveOutcome> {
        let mut frame = util::frame::Video::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                self.export_frame(&frame, out)?;
                Ok(ReceiveOutcome::Frame)
            }
            Err(ffmpeg::Error::Other { errno: 11 }) => Ok(ReceiveOutcome::NeedInput), // EAGAIN
            Err(ffmpeg::Error::Eof) => Ok(ReceiveOutcome::Eof),
            Err(e) => {
                // 单帧解码错误可以容忍（损坏的流），跳过继续
                warn!("视频解码错误（已跳过）: {}", e);
                Ok(ReceiveOutcome::NeedInput)
            }
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

/// FFmpeg 音频解码引擎
///
/// 输出交错 f32、原生采样率；采样率/声道适配交给呈现端的重采样器。
pub struct AudioEngine {
    decoder: codec::decoder::Audio,
    packer: Option<software::resampling::Context>,
}

unsafe impl Send for AudioEngine {}

impl AudioEngine {
    pub fn new(params: codec::Parameters) -> Result<Self> {
        let context = codec::context::Context::from_parameters(params)?;
        let decoder = context.decoder().audio()?;
        debug!(
            "音频解码器: {} Hz, {} 声道, 格式: {:?}",
            decoder.rate(),
            decoder.channels(),
            decoder.format()
        );
        Ok(Self {
            decoder,
            packer: None,
        })
    }

    /// 样本格式归一到交错 f32（速率与声道保持原样）
    fn export_frame(&mut self, frame: &util::frame::Audio, out: &mut DecodedUnit) -> Result<()> {
        if self.packer.is_none() {
            self.packer = Some(software::resampling::Context::get(
                frame.format(),
                frame.channel_layout(),
                frame.rate(),
                util::format::Sample::F32(util::format::sample::Type::Packed),
                frame.channel_layout(),
                frame.rate(),
            )?);
        }
        let mut packed = util::frame::Audio::empty();
        self.packer.as_mut().unwrap().run(frame, &mut packed)?;

        let DecodedUnit::Audio {
            pts,
            sample_rate,
            channels,
            samples,
        } = out
        else {
            return Err(PlayerError::DecodeError("音频引擎收到非音频单元".into()));
        };
        *pts = ticks_to_seconds(frame.pts());
        *sample_rate = frame.rate();
        *channels = frame.channels();
        let count = packed.samples() * frame.channels() as usize;
        let raw = unsafe {
            std::slice::from_raw_parts(packed.data(0).as_ptr() as *const f32, count)
        };
        samples.clear();
        samples.extend_from_slice(raw);
        Ok(())
    }
}

impl DecodeEngine for AudioEngine {
    fn submit(&mut self, packet: &MediaPacket) -> Result<SubmitOutcome> {
        let pkt = rebuild_packet(packet);
        match self.decoder.send_packet(&pkt) {
            Ok(()) => Ok(SubmitOutcome::Consumed),
            Err(ffmpeg::Error::Other { errno: 11 }) => Ok(SubmitOutcome::Again), // EAGAIN
            Err(ffmpeg::Error::Eof) => Ok(SubmitOutcome::Again),
            Err(e) => Err(e.into()),
        }
    }

    fn submit_eof(&mut self) -> Result<()> {
        match self.decoder.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn receive(&mut self, out: &mut DecodedUnit) -> Result<ReceiveOutcome> {
        let mut frame = util::frame::Audio::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {
                self.export_frame(&frame, out)?;
                Ok(ReceiveOutcome::Frame)
            }
            Err(ffmpeg::Error::Other { errno: 11 }) => Ok(ReceiveOutcome::NeedInput), // EAGAIN
            Err(ffmpeg::Error::Eof) => Ok(ReceiveOutcome::Eof),
            Err(e) => {
                warn!("音频解码错误（已跳过）: {}", e);
                Ok(ReceiveOutcome::NeedInput)
            }
        }
    }

    fn flush(&mut self) {
        self.decoder.flush();
    }
}

/// FFmpeg 字幕解码引擎（文本与 ASS 字幕）
///
/// 字幕解码是一次一包的同步调用，没有内部缓冲；
/// submit 直接产出，receive 把缓存的结果交出去。
pub struct SubtitleEngine {
    decoder: codec::decoder::Subtitle,
    ready: Option<(f64, f64, String)>,
    draining: bool,
}

unsafe impl Send for SubtitleEngine {}

impl SubtitleEngine {
    pub fn new(params: codec::Parameters) -> Result<Self> {
        let context = codec::context::Context::from_parameters(params)?;
        let decoder = context.decoder().subtitle()?;
        Ok(Self {
            decoder,
            ready: None,
            draining: false,
        })
    }

    fn decode_packet(&mut self, packet: &MediaPacket) -> Result<()> {
        let pkt = rebuild_packet(packet);
        let mut subtitle = codec::subtitle::Subtitle::default();
        if let Err(e) = self.decoder.decode(&pkt, &mut subtitle) {
            if matches!(e, ffmpeg::Error::Other { errno: 11 }) {
                return Ok(()); // EAGAIN
            }
            warn!("字幕解码失败（已跳过）: {}", e);
            return Ok(());
        }

        let start = ticks_to_seconds(subtitle.pts()).max(0.0);
        // end_display_time 是相对开始的毫秒数
        let duration_ms = unsafe { (*subtitle.as_ptr()).end_display_time };
        let end = if duration_ms > 0 {
            start + duration_ms as f64 / 1000.0
        } else {
            f64::NAN
        };

        let mut text = String::new();
        for rect in subtitle.rects() {
            unsafe {
                let raw = rect.as_ptr();
                match (*raw).type_ {
                    ffmpeg::ffi::AVSubtitleType::SUBTITLE_TEXT => {
                        if !(*raw).text.is_null() {
                            text.push_str(&CStr::from_ptr((*raw).text).to_string_lossy());
                            text.push('\n');
                        }
                    }
                    ffmpeg::ffi::AVSubtitleType::SUBTITLE_ASS => {
                        if !(*raw).ass.is_null() {
                            text.push_str(&strip_ass_markup(
                                &CStr::from_ptr((*raw).ass).to_string_lossy(),
                            ));
                            text.push('\n');
                        }
                    }
                    _ => {
                        debug!("跳过位图字幕（当前仅支持文本字幕）");
                    }
                }
            }
        }
        // AVSubtitle 必须显式释放，否则泄漏
        unsafe {
            ffmpeg::ffi::avsubtitle_free(subtitle.as_mut_ptr());
        }

        let text = text.trim().to_string();
        if !text.is_empty() {
            self.ready = Some((start, end, text));
        }
        Ok(())
    }
}

impl DecodeEngine for SubtitleEngine {
    fn submit(&mut self, packet: &MediaPacket) -> Result<SubmitOutcome> {
        if self.ready.is_some() {
            // 上一条还没被取走
            return Ok(SubmitOutcome::Again);
        }
        self.decode_packet(packet)?;
        Ok(SubmitOutcome::Consumed)
    }

    fn submit_eof(&mut self) -> Result<()> {
        // 字幕解码没有内部缓冲，排空只需交出最后一条
        self.draining = true;
        Ok(())
    }

    fn receive(&mut self, out: &mut DecodedUnit) -> Result<ReceiveOutcome> {
        let Some((start, end, text)) = self.ready.take() else {
            if self.draining {
                return Ok(ReceiveOutcome::Eof);
            }
            return Ok(ReceiveOutcome::NeedInput);
        };
        let DecodedUnit::Subtitle {
            start: s,
            end: e,
            text: t,
        } = out
        else {
            return Err(PlayerError::DecodeError("字幕引擎收到非字幕单元".into()));
        };
        *s = start;
        *e = end;
        t.clear();
        t.push_str(&text);
        Ok(ReceiveOutcome::Frame)
    }

    fn flush(&mut self) {
        self.ready = None;
        self.draining = false;
        self.decoder.flush();
    }
}

/// 清理 ASS 字幕：跳过 Dialogue 前缀字段并移除 {\...} 标签
fn strip_ass_markup(ass: &str) -> String {
    // ASS 事件行有 9 个逗号分隔的前缀字段，第 10 段才是正文
    let body = ass.splitn(10, ',').nth(9).unwrap_or(ass);
    let mut result = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    let mut in_tag = false;
    while let Some(ch) = chars.next() {
        match ch {
            '{' => in_tag = true,
            '}' => in_tag = false,
            _ if in_tag => {}
            '\\' => match chars.peek() {
                Some('N') | Some('n') => {
                    chars.next();
                    result.push('\n');
                }
                Some('h') => {
                    chars.next();
                    result.push(' ');
                }
                _ => result.push(ch),
            },
            '\r' => {}
            _ => result.push(ch),
        }
    }
    result.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ass_markup() {
        let line = "0,0,Default,,0,0,0,,{\\an8}你好\\N世界";
        assert_eq!(strip_ass_markup(line), "你好\n世界");
    }

    #[test]
    fn test_strip_ass_markup_plain_text() {
        assert_eq!(strip_ass_markup("没有前缀的普通文本"), "没有前缀的普通文本");
    }

    #[test]
    fn test_ticks_round_trip() {
        assert!(seconds_to_ticks(f64::NAN).is_none());
        assert!(ticks_to_seconds(None).is_nan());
        let t = seconds_to_ticks(1.5).unwrap();
        assert!((ticks_to_seconds(Some(t)) - 1.5).abs() < 1e-6);
    }
}
