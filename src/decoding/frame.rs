use crate::core::{MediaType, TimeSpan};
use crate::decoding::closed_captions::{parse_a53_side_data, ClosedCaptionPacket};
use ffmpeg_next::codec::subtitle::{Rect, Subtitle};
use ffmpeg_next::util::frame;
use ffmpeg_next::{ffi, Rational};

/// 帧 / 块共用的时间信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaTiming {
    pub start_time: TimeSpan,
    pub end_time: TimeSpan,
    pub duration: TimeSpan,
    /// 开始时间能否从流中恢复
    pub has_valid_start_time: bool,
}

impl MediaTiming {
    pub fn new(start_time: Option<TimeSpan>, duration: TimeSpan) -> Self {
        let duration = duration.max(TimeSpan::ZERO);
        let start = start_time.unwrap_or(TimeSpan::ZERO);
        Self {
            start_time: start,
            end_time: start + duration,
            duration,
            has_valid_start_time: start_time.is_some(),
        }
    }

    /// 整体平移（字幕延迟）
    pub fn shifted(&self, offset: TimeSpan) -> Self {
        Self {
            start_time: self.start_time + offset,
            end_time: self.end_time + offset,
            ..*self
        }
    }
}

/// 来源数据包大小（未知时为 -1）
fn packet_size(native: &frame::Frame) -> usize {
    unsafe { (*native.as_ptr()).pkt_size.max(0) as usize }
}

/// 可按开始时间排序的对象
pub trait Timed {
    fn media_type(&self) -> MediaType;
    fn start_time(&self) -> TimeSpan;
}

/// 按开始时间稳定排序（同一时间保持原有顺序）
pub fn sort_by_start_time<T: Timed>(items: &mut [T]) {
    items.sort_by_key(|item| item.start_time());
}

/// 解码得到的音频帧
pub struct AudioFrame {
    native: Option<frame::Audio>,
    pub stream_index: usize,
    pub timing: MediaTiming,
    pub compressed_size: usize,
}

impl AudioFrame {
    /// 无有效采样时返回 `None`，原生帧随即释放
    pub fn new(native: frame::Audio, stream_index: usize, time_base: Rational) -> Option<Self> {
        if native.samples() == 0 || native.rate() == 0 {
            return None;
        }

        let packet = native.packet();
        // 滤镜输出帧可能只有 pts
        let start = native
            .timestamp()
            .or_else(|| native.pts())
            .and_then(|ts| TimeSpan::from_timestamp(ts, time_base));

        let mut duration = TimeSpan::from_timestamp(packet.duration, time_base).unwrap_or_default();
        if !duration.is_positive() {
            duration = TimeSpan::from_micros(
                (native.samples() as i64).saturating_mul(1_000_000) / native.rate() as i64,
            );
        }

        Some(Self {
            stream_index,
            timing: MediaTiming::new(start, duration),
            compressed_size: packet_size(&native),
            native: Some(native),
        })
    }

    pub fn native(&self) -> Option<&frame::Audio> {
        self.native.as_ref()
    }

    pub(crate) fn native_mut(&mut self) -> Option<&mut frame::Audio> {
        self.native.as_mut()
    }

    pub(crate) fn take_native(&mut self) -> Option<frame::Audio> {
        self.native.take()
    }

    pub(crate) fn replace_native(&mut self, native: frame::Audio) {
        self.native = Some(native);
    }

    pub fn samples_per_channel(&self) -> usize {
        self.native.as_ref().map(|f| f.samples()).unwrap_or(0)
    }
}

/// 解码得到的视频帧
pub struct VideoFrame {
    native: Option<frame::Video>,
    pub stream_index: usize,
    pub timing: MediaTiming,
    pub compressed_size: usize,
    /// 是否经由硬件解码
    pub is_hardware_frame: bool,
    pub hardware_name: Option<&'static str>,
    pub closed_captions: Vec<ClosedCaptionPacket>,
    pub is_keyframe: bool,
}

impl VideoFrame {
    /// 宽高非法时返回 `None`，原生帧随即释放
    pub fn new(
        native: frame::Video,
        stream_index: usize,
        time_base: Rational,
        frame_rate: f64,
    ) -> Option<Self> {
        if native.width() == 0 || native.height() == 0 {
            return None;
        }

        let packet = native.packet();
        // 滤镜输出帧可能只有 pts
        let start = native
            .timestamp()
            .or_else(|| native.pts())
            .and_then(|ts| TimeSpan::from_timestamp(ts, time_base));

        let mut duration = TimeSpan::from_timestamp(packet.duration, time_base).unwrap_or_default();
        if !duration.is_positive() && frame_rate > 0.0 {
            duration = TimeSpan::from_secs_f64(1.0 / frame_rate);
        }

        let closed_captions = native
            .side_data(frame::side_data::Type::A53CC)
            .map(|side| parse_a53_side_data(side.data()))
            .unwrap_or_default();

        Some(Self {
            stream_index,
            timing: MediaTiming::new(start, duration),
            compressed_size: packet_size(&native),
            is_hardware_frame: false,
            hardware_name: None,
            closed_captions,
            is_keyframe: native.is_key(),
            native: Some(native),
        })
    }

    pub fn native(&self) -> Option<&frame::Video> {
        self.native.as_ref()
    }

    pub(crate) fn native_mut(&mut self) -> Option<&mut frame::Video> {
        self.native.as_mut()
    }

    pub(crate) fn take_native(&mut self) -> Option<frame::Video> {
        self.native.take()
    }

    pub(crate) fn replace_native(&mut self, native: frame::Video) {
        self.native = Some(native);
    }
}

/// 持有原生 AVSubtitle，离开作用域时释放
pub struct NativeSubtitle(Subtitle);

// AVSubtitle 只在持有者线程内访问，转移所有权是安全的
unsafe impl Send for NativeSubtitle {}

impl NativeSubtitle {
    pub fn new(subtitle: Subtitle) -> Self {
        Self(subtitle)
    }

    pub fn inner(&self) -> &Subtitle {
        &self.0
    }

    /// 提取文本类矩形（ASS 或纯文本），位图字幕跳过
    pub fn text_rects(&self) -> (Vec<String>, SubtitleFormat) {
        let mut texts = Vec::new();
        let mut format = SubtitleFormat::None;
        for rect in self.0.rects() {
            match rect {
                Rect::Text(text) => {
                    texts.push(text.get().to_string());
                    if format == SubtitleFormat::None {
                        format = SubtitleFormat::Text;
                    }
                }
                Rect::Ass(ass) => {
                    texts.push(ass.get().to_string());
                    format = SubtitleFormat::Ass;
                }
                Rect::Bitmap(_) => {
                    if format == SubtitleFormat::None {
                        format = SubtitleFormat::Bitmap;
                    }
                }
                Rect::None(_) => {}
            }
        }
        (texts, format)
    }
}

impl Drop for NativeSubtitle {
    fn drop(&mut self) {
        unsafe {
            ffi::avsubtitle_free(self.0.as_mut_ptr());
        }
    }
}

/// 字幕原始格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum SubtitleFormat {
    #[default]
    None,
    Text,
    Ass,
    Bitmap,
}

/// 解码得到的字幕帧
pub struct SubtitleFrame {
    native: Option<NativeSubtitle>,
    pub stream_index: usize,
    pub timing: MediaTiming,
    pub compressed_size: usize,
}

/// 字幕没有结束时间时的默认显示时长
const DEFAULT_SUBTITLE_DURATION: TimeSpan = TimeSpan::from_secs(3);

impl SubtitleFrame {
    /// `packet_pts` / `packet_duration` 为原始数据包的时间（流时间基）
    pub fn new(
        native: NativeSubtitle,
        stream_index: usize,
        time_base: Rational,
        packet_pts: Option<i64>,
        packet_duration: i64,
        compressed_size: usize,
    ) -> Self {
        let subtitle = native.inner();
        // AVSubtitle.pts 以 AV_TIME_BASE 为单位
        let base = subtitle
            .pts()
            .and_then(TimeSpan::from_av_time)
            .or_else(|| packet_pts.and_then(|pts| TimeSpan::from_timestamp(pts, time_base)));

        let start_offset = TimeSpan::from_millis(subtitle.start() as i64);
        let end_offset = TimeSpan::from_millis(subtitle.end() as i64);
        let start = base.map(|b| b + start_offset);

        let mut duration = if subtitle.end() > subtitle.start() && subtitle.end() != u32::MAX {
            end_offset - start_offset
        } else {
            TimeSpan::ZERO
        };
        if !duration.is_positive() {
            duration = TimeSpan::from_timestamp(packet_duration, time_base)
                .filter(|d| d.is_positive())
                .unwrap_or(DEFAULT_SUBTITLE_DURATION);
        }

        Self {
            stream_index,
            timing: MediaTiming::new(start, duration),
            compressed_size,
            native: Some(native),
        }
    }

    pub fn native(&self) -> Option<&NativeSubtitle> {
        self.native.as_ref()
    }
}

/// 解码后的帧（尚未转换）
pub enum MediaFrame {
    Audio(AudioFrame),
    Video(VideoFrame),
    Subtitle(SubtitleFrame),
}

impl MediaFrame {
    pub fn media_type(&self) -> MediaType {
        match self {
            MediaFrame::Audio(_) => MediaType::Audio,
            MediaFrame::Video(_) => MediaType::Video,
            MediaFrame::Subtitle(_) => MediaType::Subtitle,
        }
    }

    pub fn timing(&self) -> &MediaTiming {
        match self {
            MediaFrame::Audio(f) => &f.timing,
            MediaFrame::Video(f) => &f.timing,
            MediaFrame::Subtitle(f) => &f.timing,
        }
    }

    pub fn stream_index(&self) -> usize {
        match self {
            MediaFrame::Audio(f) => f.stream_index,
            MediaFrame::Video(f) => f.stream_index,
            MediaFrame::Subtitle(f) => f.stream_index,
        }
    }

    pub fn start_time(&self) -> TimeSpan {
        self.timing().start_time
    }

    pub fn end_time(&self) -> TimeSpan {
        self.timing().end_time
    }

    pub fn duration(&self) -> TimeSpan {
        self.timing().duration
    }

    pub fn has_valid_start_time(&self) -> bool {
        self.timing().has_valid_start_time
    }

    pub fn compressed_size(&self) -> usize {
        match self {
            MediaFrame::Audio(f) => f.compressed_size,
            MediaFrame::Video(f) => f.compressed_size,
            MediaFrame::Subtitle(f) => f.compressed_size,
        }
    }

    /// 原生内存已释放
    pub fn is_stale(&self) -> bool {
        match self {
            MediaFrame::Audio(f) => f.native.is_none(),
            MediaFrame::Video(f) => f.native.is_none(),
            MediaFrame::Subtitle(f) => f.native.is_none(),
        }
    }

    /// 释放原生帧（可重复调用）
    pub fn dispose(&mut self) {
        match self {
            MediaFrame::Audio(f) => f.native = None,
            MediaFrame::Video(f) => f.native = None,
            MediaFrame::Subtitle(f) => f.native = None,
        }
    }
}

impl Timed for MediaFrame {
    fn media_type(&self) -> MediaType {
        MediaFrame::media_type(self)
    }

    fn start_time(&self) -> TimeSpan {
        MediaFrame::start_time(self)
    }
}

impl std::fmt::Debug for MediaFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaFrame")
            .field("media_type", &self.media_type())
            .field("stream_index", &self.stream_index())
            .field("start_time", &self.start_time())
            .field("duration", &self.duration())
            .field("is_stale", &self.is_stale())
            .finish()
    }
}
