use crate::core::timing::TimeSpan;
use ffmpeg_next::media;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Seek};

/// 媒体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MediaType {
    Audio,
    Video,
    Subtitle,
}

impl MediaType {
    pub const ALL: [MediaType; 3] = [MediaType::Audio, MediaType::Video, MediaType::Subtitle];

    pub fn from_ffmpeg(medium: media::Type) -> Option<Self> {
        match medium {
            media::Type::Audio => Some(MediaType::Audio),
            media::Type::Video => Some(MediaType::Video),
            media::Type::Subtitle => Some(MediaType::Subtitle),
            _ => None,
        }
    }

    pub fn to_ffmpeg(self) -> media::Type {
        match self {
            MediaType::Audio => media::Type::Audio,
            MediaType::Video => media::Type::Video,
            MediaType::Subtitle => media::Type::Subtitle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Audio => "音频",
            MediaType::Video => "视频",
            MediaType::Subtitle => "字幕",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 流媒体协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamProtocol {
    /// RTSP - 实时流协议（监控摄像头）
    RTSP,
    /// RTMP - 实时消息协议（直播流）
    RTMP,
    /// HLS - HTTP Live Streaming
    HLS,
    /// HTTP - 普通 HTTP 流
    HTTP,
    /// UDP / RTP 组播
    UDP,
}

impl StreamProtocol {
    /// 根据 URL 推断协议，本地路径返回 `None`
    pub fn detect(url: &str) -> Option<Self> {
        let lower = url.to_ascii_lowercase();
        if lower.starts_with("rtsp://") {
            Some(StreamProtocol::RTSP)
        } else if lower.starts_with("rtmp://") {
            Some(StreamProtocol::RTMP)
        } else if lower.ends_with(".m3u8") || lower.contains("/hls/") {
            Some(StreamProtocol::HLS)
        } else if lower.starts_with("http://") || lower.starts_with("https://") {
            Some(StreamProtocol::HTTP)
        } else if lower.starts_with("udp://") || lower.starts_with("rtp://") {
            Some(StreamProtocol::UDP)
        } else {
            None
        }
    }

    /// 实时协议没有固定时长，也不可定位
    pub fn is_realtime(&self) -> bool {
        matches!(self, StreamProtocol::RTSP | StreamProtocol::RTMP | StreamProtocol::UDP)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamProtocol::RTSP => "RTSP",
            StreamProtocol::RTMP => "RTMP",
            StreamProtocol::HLS => "HLS",
            StreamProtocol::HTTP => "HTTP",
            StreamProtocol::UDP => "UDP",
        }
    }
}

/// 自定义输入流（内存、加密文件等）
///
/// 容器会为它创建原生自定义 IO 上下文。
pub trait MediaInputStream: Read + Seek + Send {
    /// 用于日志和格式探测的 URI
    fn stream_uri(&self) -> String;

    /// 是否支持随机访问
    fn can_seek(&self) -> bool {
        true
    }

    /// 每次读取的缓冲区大小（字节）
    fn read_buffer_length(&self) -> usize {
        32 * 1024
    }
}

/// 媒体源
pub enum MediaSource {
    /// 本地路径或网络 URL
    Url(String),
    /// 自定义输入流
    Stream(Box<dyn MediaInputStream>),
}

impl MediaSource {
    /// 从 URL 字符串构造媒体源
    pub fn from_url(url: &str) -> Self {
        MediaSource::Url(url.to_string())
    }

    pub fn from_stream(stream: impl MediaInputStream + 'static) -> Self {
        MediaSource::Stream(Box::new(stream))
    }

    pub fn protocol(&self) -> Option<StreamProtocol> {
        match self {
            MediaSource::Url(url) => StreamProtocol::detect(url),
            MediaSource::Stream(_) => None,
        }
    }

    /// 判断是否为网络流
    pub fn is_network_stream(&self) -> bool {
        self.protocol().is_some()
    }

    pub fn description(&self) -> String {
        match self {
            MediaSource::Url(url) => url.clone(),
            MediaSource::Stream(stream) => stream.stream_uri(),
        }
    }
}

impl fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            MediaSource::Stream(stream) => f.debug_tuple("Stream").field(&stream.stream_uri()).finish(),
        }
    }
}

/// 单个流的探测信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: usize,
    pub media_type: Option<MediaType>,
    pub codec_name: String,
    pub codec_id: i32,
    /// (分子, 分母)
    pub time_base: (i32, i32),
    pub start_time: Option<TimeSpan>,
    pub duration: Option<TimeSpan>,
    pub bit_rate: i64,
    pub language: Option<String>,
    /// 封面图（attached picture）
    pub is_attached_picture: bool,
    pub width: u32,
    pub height: u32,
    pub pixel_format: Option<String>,
    pub frame_rate: f64,
    pub sample_aspect_ratio: (i32, i32),
    pub sample_rate: u32,
    pub channels: u16,
}

/// 媒体探测结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub format_name: String,
    pub duration: Option<TimeSpan>,
    pub start_time: Option<TimeSpan>,
    pub bit_rate: i64,
    pub metadata: BTreeMap<String, String>,
    pub is_seekable: bool,
    pub is_network: bool,
    pub is_realtime: bool,
    pub streams: Vec<StreamInfo>,
    /// 各类型的最佳流索引
    pub best_streams: BTreeMap<MediaType, usize>,
}

impl MediaInfo {
    pub fn stream(&self, index: usize) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.index == index)
    }

    pub fn best_stream(&self, media_type: MediaType) -> Option<&StreamInfo> {
        self.best_streams
            .get(&media_type)
            .and_then(|idx| self.stream(*idx))
    }
}

/// 数据包缓冲状态（用于监控和读取节奏控制）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferState {
    /// 缓冲字节数
    pub length: usize,
    /// 缓冲包数
    pub count: usize,
    /// 认为"足够"的包数阈值
    pub count_threshold: usize,
    /// 是否所有组件都已有足够的包
    pub has_enough_packets: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_detection() {
        assert_eq!(StreamProtocol::detect("rtsp://cam/live"), Some(StreamProtocol::RTSP));
        assert_eq!(StreamProtocol::detect("https://cdn/a/index.m3u8"), Some(StreamProtocol::HLS));
        assert_eq!(StreamProtocol::detect("HTTP://host/video.mp4"), Some(StreamProtocol::HTTP));
        assert_eq!(StreamProtocol::detect("udp://239.0.0.1:1234"), Some(StreamProtocol::UDP));
        assert_eq!(StreamProtocol::detect("/data/movie.mkv"), None);
        assert!(!MediaSource::from_url("C:\\movie.mp4").is_network_stream());
        assert!(StreamProtocol::RTMP.is_realtime());
        assert!(!StreamProtocol::HLS.is_realtime());
    }

    #[test]
    fn test_media_type_mapping() {
        for t in MediaType::ALL {
            assert_eq!(MediaType::from_ffmpeg(t.to_ffmpeg()), Some(t));
        }
        assert_eq!(MediaType::from_ffmpeg(media::Type::Data), None);
    }
}
