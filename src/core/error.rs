use crate::core::MediaType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("无法打开媒体: {0}")]
    OpenError(String),

    #[error("媒体中没有可解码的流")]
    NoDecodableStreams,

    #[error("找不到可用的 {media_type} 解码器 (流 #{stream_index})")]
    DecoderNotFound {
        media_type: MediaType,
        stream_index: usize,
    },

    #[error("无法打开解码器 {codec}: {source}")]
    DecoderOpenError {
        codec: String,
        #[source]
        source: ffmpeg_next::Error,
    },

    #[error("读取数据包失败: {0}")]
    ReadError(ffmpeg_next::Error),

    #[error("读取已被中止")]
    ReadAborted,

    #[error("读取超时 ({0} ms)")]
    ReadTimeout(u128),

    #[error("容器状态错误: {0}")]
    InvalidState(String),

    #[error("容器已释放")]
    Disposed,

    #[error("不支持的操作: {0}")]
    Unsupported(String),

    #[error("配置错误: {0}")]
    ConfigError(#[from] serde_json::Error),

    #[error("没有可处理 {0} 帧的组件")]
    ComponentNotFound(MediaType),

    #[error("转换错误: {0}")]
    ConvertError(String),
}

impl MediaError {
    /// 是否为读取中断（中止或超时）
    pub fn is_interrupt(&self) -> bool {
        matches!(self, MediaError::ReadAborted | MediaError::ReadTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_classification() {
        assert!(MediaError::ReadAborted.is_interrupt());
        assert!(MediaError::ReadTimeout(500).is_interrupt());
        assert!(!MediaError::ReadError(ffmpeg_next::Error::Eof).is_interrupt());
        assert!(!MediaError::NoDecodableStreams.is_interrupt());
    }
}
