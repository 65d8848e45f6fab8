use anyhow::Result;
use log::info;
use std::time::Duration;
use youyou_player::{FfmpegBackend, PlaybackConfig, Session};

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("用法: play <媒体文件>"))?;

    info!("🎬 播放内核启动");
    let mut backend = FfmpegBackend::new()?;
    let mut session = Session::open(&path, &mut backend, PlaybackConfig::default())?;

    let info = session.media_info().clone();
    info!(
        "📄 {}x{} @ {:.2} fps, {} / {}, 时长 {:.1}s",
        info.width, info.height, info.fps, info.video_codec, info.audio_codec, info.duration
    );

    let mut last_report = 0.0f64;
    while !session.is_stopped() {
        session.update();

        // 每秒报告一次进度
        let pos = session.position();
        if pos.is_finite() && pos - last_report >= 1.0 {
            info!("⏱ 播放进度: {:.1}s / {:.1}s", pos, session.duration());
            last_report = pos;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    session.stop();
    info!("✅ 播放结束");
    Ok(())
}
