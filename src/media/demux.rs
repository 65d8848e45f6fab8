use crate::core::{PlayerError, Result, StreamKind};
use crate::player::source::{MediaPacket, PacketSource, ReadOutcome, SeekRequest, StreamDesc};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, media};
use log::{debug, info, warn};

/// 被选中的一条流在解封装侧的登记项
struct SelectedStream {
    index: usize,
    kind: StreamKind,
    /// 该流的 time_base（秒/tick），出入口在这里换算成秒
    time_base: f64,
}

/// FFmpeg 解封装源 - 读取媒体文件并分离音/视/字幕流
///
/// 每种类型至多选一条流（best 选择），其余流的包在读取时跳过。
/// 时间戳离开本层时已经换算成秒，管线内部不再接触 time_base。
pub struct FfmpegSource {
    input_ctx: format::context::Input,
    selected: Vec<SelectedStream>,
    descs: Vec<StreamDesc>,
    duration: f64,
    source_path: String,
}

impl FfmpegSource {
    /// 打开媒体文件并选流
    pub fn open(path: &str) -> Result<Self> {
        info!("正在打开文件: {}", path);

        let input_ctx = format::input(&path)
            .map_err(|e| PlayerError::OpenError(format!("无法打开文件 {}: {}", path, e)))?;

        let video_index = input_ctx
            .streams()
            .best(media::Type::Video)
            .map(|s| s.index());
        let audio_index = input_ctx
            .streams()
            .best(media::Type::Audio)
            .map(|s| s.index());
        // 字幕流：取第一条
        let subtitle_index = input_ctx
            .streams()
            .find(|s| s.parameters().medium() == media::Type::Subtitle)
            .map(|s| s.index());

        debug!("视频流索引: {:?}", video_index);
        debug!("音频流索引: {:?}", audio_index);
        debug!("字幕流索引: {:?}", subtitle_index);

        if video_index.is_none() && audio_index.is_none() {
            return Err(PlayerError::NoDecodableStream);
        }

        let mut selected = Vec::new();
        let mut descs = Vec::new();
        let pairs = [
            (video_index, StreamKind::Video),
            (audio_index, StreamKind::Audio),
            (subtitle_index, StreamKind::Subtitle),
        ];
        for (index, kind) in pairs {
            let Some(index) = index else { continue };
            let stream = input_ctx
                .stream(index)
                .ok_or_else(|| PlayerError::OpenError(format!("流 {} 不存在", index)))?;
            let tb = stream.time_base();
            let time_base = tb.numerator() as f64 / tb.denominator() as f64;
            match Self::describe_stream(&stream, kind) {
                Ok(desc) => {
                    selected.push(SelectedStream {
                        index,
                        kind,
                        time_base,
                    });
                    descs.push(desc);
                }
                Err(e) => {
                    // 字幕等次要流描述失败时忽略该流，不阻止播放
                    warn!("⚠ 无法描述 {} 流，忽略: {}", kind.as_str(), e);
                }
            }
        }
        if !selected.iter().any(|s| s.kind != StreamKind::Subtitle) {
            return Err(PlayerError::NoDecodableStream);
        }

        // 容器时长是 AV_TIME_BASE（微秒）计的
        let raw = input_ctx.duration();
        let duration = if raw > 0 {
            raw as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE)
        } else {
            f64::NAN
        };

        Ok(Self {
            input_ctx,
            selected,
            descs,
            duration,
            source_path: path.to_string(),
        })
    }

    fn describe_stream(stream: &format::stream::Stream, kind: StreamKind) -> Result<StreamDesc> {
        let params = stream.parameters();
        let codec_name = params.id().name().to_string();
        let mut desc = StreamDesc {
            kind,
            codec: codec_name,
            frame_rate: 0.0,
            sample_rate: 0,
            channels: 0,
            width: 0,
            height: 0,
        };
        match kind {
            StreamKind::Video => {
                let ctx = codec::context::Context::from_parameters(params)?;
                let dec = ctx.decoder().video()?;
                desc.width = dec.width();
                desc.height = dec.height();
                let fps = stream.avg_frame_rate();
                if fps.denominator() != 0 {
                    desc.frame_rate = fps.numerator() as f64 / fps.denominator() as f64;
                }
            }
            StreamKind::Audio => {
                let ctx = codec::context::Context::from_parameters(params)?;
                let dec = ctx.decoder().audio()?;
                desc.sample_rate = dec.rate();
                desc.channels = dec.channels();
            }
            StreamKind::Subtitle => {}
        }
        Ok(desc)
    }

    pub fn description(&self) -> String {
        format!("FFmpeg 解封装: {}", self.source_path)
    }

    /// 选中流的编解码参数（解码引擎构造用）
    pub fn codec_parameters(&self, kind: StreamKind) -> Option<codec::Parameters> {
        self.selected
            .iter()
            .find(|s| s.kind == kind)
            .and_then(|s| self.input_ctx.stream(s.index))
            .map(|st| st.parameters())
    }

    fn to_seconds(ts: Option<i64>, time_base: f64) -> f64 {
        match ts {
            Some(t) => t as f64 * time_base,
            None => f64::NAN,
        }
    }
}

impl PacketSource for FfmpegSource {
    fn streams(&self) -> &[StreamDesc] {
        &self.descs
    }

    fn duration(&self) -> f64 {
        self.duration
    }

    fn read(&mut self) -> Result<ReadOutcome> {
        loop {
            match self.input_ctx.packets().next() {
                Some((stream, packet)) => {
                    let Some(sel) = self.selected.iter().find(|s| s.index == stream.index())
                    else {
                        // 未选中的流（数据流、第二条音轨等），直接跳过
                        continue;
                    };
                    let data = packet.data().map(|d| d.to_vec()).unwrap_or_default();
                    let duration = packet.duration();
                    return Ok(ReadOutcome::Packet(MediaPacket {
                        stream: sel.kind,
                        data,
                        pts: Self::to_seconds(packet.pts(), sel.time_base),
                        dts: Self::to_seconds(packet.dts(), sel.time_base),
                        duration: if duration > 0 {
                            duration as f64 * sel.time_base
                        } else {
                            f64::NAN
                        },
                        keyframe: packet.is_key(),
                    }));
                }
                // av_read_frame 的 EOF 是粘性的，迭代器之后一直给 None
                None => return Ok(ReadOutcome::Eof),
            }
        }
    }

    fn seek(&mut self, req: &SeekRequest) -> Result<()> {
        if req.by_bytes {
            // 字节定位：AVSEEK_FLAG_BYTE，ffmpeg-next 没有封装，走 ffi
            let pos = req.target as i64;
            let ret = unsafe {
                ffmpeg::ffi::avformat_seek_file(
                    self.input_ctx.as_mut_ptr(),
                    -1,
                    i64::MIN,
                    pos,
                    i64::MAX,
                    ffmpeg::ffi::AVSEEK_FLAG_BYTE,
                )
            };
            if ret < 0 {
                return Err(PlayerError::FFmpegError(ffmpeg::Error::from(ret)));
            }
            return Ok(());
        }

        // 时间定位：目标落在 [target - rel, target] 窗口内
        let to_ts = |sec: f64| (sec * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;
        let target = to_ts(req.target);
        if req.rel > 0.0 {
            let min = to_ts(req.target - req.rel);
            self.input_ctx.seek(target, min..target)?;
        } else {
            self.input_ctx.seek(target, ..target)?;
        }
        Ok(())
    }
}
