//! 媒体解码管线核心库
//!
//! 负责解封装、解码、格式转换与多流同步定位；
//! 输出带时间戳、可直接呈现的音频 / 视频 / 字幕块。

pub mod core;
pub mod decoding;

pub use crate::core::{
    BufferState, ContainerConfiguration, MediaError, MediaInfo, MediaOptions, MediaSource,
    MediaType, Result, TimeSpan,
};
pub use crate::decoding::{MediaBlock, MediaContainer, MediaFrame};

use log::info;
use std::sync::Once;

static INIT: Once = Once::new();

/// 初始化 FFmpeg（可重复调用）
pub fn init() -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| match ffmpeg_next::init() {
        Ok(()) => info!("✅ FFmpeg 初始化成功"),
        Err(e) => result = Err(MediaError::FFmpegError(e)),
    });
    result
}
