use crate::core::error::Result;
use crate::core::types::MediaType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// 容器级配置（打开输入之前生效）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfiguration {
    /// 强制输入格式（如 "mpegts"），为空时自动探测
    pub forced_input_format: Option<String>,
    /// URL 前缀（如 "async:"、"cache:"）
    pub protocol_prefix: Option<String>,
    /// 单次读取超时（毫秒），0 表示不限制
    pub read_timeout_ms: u64,
    /// 探测字节数
    pub probe_size: Option<u64>,
    /// 分析时长（微秒）
    pub analyze_duration: Option<u64>,
    /// 额外的格式选项，原样传给解封装器（如 fflags）
    pub format_options: BTreeMap<String, String>,
    /// 对网络 URL 追加重连/超时/缓冲选项
    pub apply_network_defaults: bool,
    /// 自定义输入流的 IO 缓冲区大小
    pub stream_buffer_size: usize,
}

impl Default for ContainerConfiguration {
    fn default() -> Self {
        Self {
            forced_input_format: None,
            protocol_prefix: None,
            read_timeout_ms: 30_000,
            probe_size: None,
            analyze_duration: None,
            format_options: BTreeMap::new(),
            apply_network_defaults: true,
            stream_buffer_size: 32 * 1024,
        }
    }
}

impl ContainerConfiguration {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        if self.read_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.read_timeout_ms))
        }
    }

    /// 网络流默认选项（重连、读写超时、缓冲）
    pub fn network_defaults() -> Vec<(&'static str, &'static str)> {
        vec![
            ("reconnect", "1"),
            ("reconnect_streamed", "1"),
            ("reconnect_delay_max", "4"),
            ("rw_timeout", "8000000"),
            ("timeout", "15000000"),
            ("buffer_size", "8388608"),
        ]
    }

    /// 合并后的格式选项，用户显式设置优先
    pub fn effective_format_options(&self, is_network: bool) -> BTreeMap<String, String> {
        let mut options = BTreeMap::new();
        if is_network && self.apply_network_defaults {
            for (key, value) in Self::network_defaults() {
                options.insert(key.to_string(), value.to_string());
            }
        }
        if let Some(probe_size) = self.probe_size {
            options.insert("probesize".to_string(), probe_size.to_string());
        }
        if let Some(analyze) = self.analyze_duration {
            options.insert("analyzeduration".to_string(), analyze.to_string());
        }
        for (key, value) in &self.format_options {
            options.insert(key.clone(), value.clone());
        }
        options
    }
}

/// 解码线程数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadCount {
    /// 交给解码器决定
    #[default]
    Auto,
    Fixed(usize),
}

impl ThreadCount {
    /// 写入 `AVCodecContext.thread_count` 的值，0 表示自动
    pub fn as_native(&self) -> i32 {
        match self {
            ThreadCount::Auto => 0,
            ThreadCount::Fixed(n) => (*n).min(i32::MAX as usize) as i32,
        }
    }
}

/// 硬件设备类型偏好
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareDeviceType {
    Cuda,
    D3D11VA,
    DXVA2,
    VAAPI,
    VDPAU,
    VideoToolbox,
    QSV,
}

impl HardwareDeviceType {
    /// 默认的设备优先级
    pub const PREFERENCE: [HardwareDeviceType; 7] = [
        HardwareDeviceType::Cuda,
        HardwareDeviceType::D3D11VA,
        HardwareDeviceType::DXVA2,
        HardwareDeviceType::VideoToolbox,
        HardwareDeviceType::VAAPI,
        HardwareDeviceType::QSV,
        HardwareDeviceType::VDPAU,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HardwareDeviceType::Cuda => "cuda",
            HardwareDeviceType::D3D11VA => "d3d11va",
            HardwareDeviceType::DXVA2 => "dxva2",
            HardwareDeviceType::VAAPI => "vaapi",
            HardwareDeviceType::VDPAU => "vdpau",
            HardwareDeviceType::VideoToolbox => "videotoolbox",
            HardwareDeviceType::QSV => "qsv",
        }
    }

    /// 在优先级表中的位置，越小越优先
    pub fn rank(&self) -> usize {
        Self::PREFERENCE
            .iter()
            .position(|t| t == self)
            .unwrap_or(Self::PREFERENCE.len())
    }
}

/// 媒体级选项（创建组件时生效）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaOptions {
    pub is_audio_disabled: bool,
    pub is_video_disabled: bool,
    pub is_subtitle_disabled: bool,
    /// 显式指定各类型使用的流索引
    pub stream_selection: BTreeMap<MediaType, usize>,
    /// 按流索引强制解码器名称
    pub decoder_codec_by_stream: BTreeMap<usize, String>,
    /// 按媒体类型强制解码器名称
    pub decoder_codec_by_type: BTreeMap<MediaType, String>,
    pub decoder_threads: ThreadCount,
    /// 低分辨率解码级别（0 为原始分辨率）
    pub low_resolution_index: i32,
    pub enable_fast_decoding: bool,
    pub enable_low_delay_decoding: bool,
    /// 强制视频帧率（覆盖流时间基）
    pub forced_frame_rate: Option<f64>,
    /// 可用的硬件设备，为空时不启用硬件解码
    pub video_hardware_devices: Vec<HardwareDeviceType>,
    /// 音频滤镜图表达式（如 "volume=0.5"）
    pub audio_filter: Option<String>,
    /// 视频滤镜图表达式（如 "yadif"）
    pub video_filter: Option<String>,
    /// 字幕延迟（毫秒，可为负）
    pub subtitle_delay_ms: i64,
    pub audio_output_sample_rate: u32,
    pub audio_output_channels: u16,
}

impl Default for MediaOptions {
    fn default() -> Self {
        Self {
            is_audio_disabled: false,
            is_video_disabled: false,
            is_subtitle_disabled: false,
            stream_selection: BTreeMap::new(),
            decoder_codec_by_stream: BTreeMap::new(),
            decoder_codec_by_type: BTreeMap::new(),
            decoder_threads: ThreadCount::Auto,
            low_resolution_index: 0,
            enable_fast_decoding: false,
            enable_low_delay_decoding: false,
            forced_frame_rate: None,
            video_hardware_devices: Vec::new(),
            audio_filter: None,
            video_filter: None,
            subtitle_delay_ms: 0,
            audio_output_sample_rate: 48_000,
            audio_output_channels: 2,
        }
    }
}

impl MediaOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn is_disabled(&self, media_type: MediaType) -> bool {
        match media_type {
            MediaType::Audio => self.is_audio_disabled,
            MediaType::Video => self.is_video_disabled,
            MediaType::Subtitle => self.is_subtitle_disabled,
        }
    }

    /// 强制解码器名称：流索引优先于媒体类型
    pub fn forced_codec(&self, media_type: MediaType, stream_index: usize) -> Option<&str> {
        self.decoder_codec_by_stream
            .get(&stream_index)
            .or_else(|| self.decoder_codec_by_type.get(&media_type))
            .map(String::as_str)
            .filter(|name| !name.trim().is_empty())
    }

    pub fn filter_for(&self, media_type: MediaType) -> Option<&str> {
        let filter = match media_type {
            MediaType::Audio => self.audio_filter.as_deref(),
            MediaType::Video => self.video_filter.as_deref(),
            MediaType::Subtitle => None,
        };
        filter.filter(|f| !f.trim().is_empty())
    }
}
