use crate::core::{MediaType, TimeSpan};
use crate::decoding::closed_captions::ClosedCaptionPacket;
use crate::decoding::frame::{MediaTiming, SubtitleFormat, Timed};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicUsize, Ordering};

/// 块持有的输出缓冲区
///
/// 计算出的字节数不变时复用同一块内存，只在尺寸变化时重新分配。
pub struct BlockBuffer {
    data: RwLock<Vec<u8>>,
    allocations: AtomicUsize,
}

impl BlockBuffer {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            allocations: AtomicUsize::new(0),
        }
    }

    /// 确保缓冲区长度恰好为 `len`，返回是否发生了重新分配
    pub fn ensure_len(&self, len: usize) -> bool {
        let mut data = self.data.write();
        if data.len() == len {
            return false;
        }
        // 旧缓冲区在赋值时释放
        *data = vec![0u8; len];
        self.allocations.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// 累计分配次数
    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// 当前缓冲区地址（用于判断是否复用）
    pub fn address(&self) -> usize {
        self.data.read().as_ptr() as usize
    }

    pub fn release(&self) {
        let mut data = self.data.write();
        *data = Vec::new();
    }
}

impl Default for BlockBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// 时间修复：源帧开始时间不可用时，接续上一块的结束时间
///
/// 只修复开始时间不可用的帧：时长优先用源帧自身的正值，否则沿用上一块的时长。
pub fn resolve_block_timing(source: &MediaTiming, previous: Option<&MediaTiming>) -> MediaTiming {
    let (start, duration) = match previous {
        Some(prev) if !source.has_valid_start_time => {
            let duration = if source.duration.is_positive() {
                source.duration
            } else {
                prev.duration
            };
            (prev.end_time, duration)
        }
        _ => (source.start_time, source.duration),
    };
    MediaTiming {
        start_time: start,
        end_time: start + duration,
        duration,
        has_valid_start_time: source.has_valid_start_time,
    }
}

/// 转换后的音频块（交错 S16 PCM）
#[derive(Default)]
pub struct AudioBlock {
    pub stream_index: usize,
    pub timing: MediaTiming,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_channel: usize,
    pub compressed_size: usize,
    pub buffer: BlockBuffer,
}

impl AudioBlock {
    pub const BYTES_PER_SAMPLE: usize = 2;

    pub fn buffer_length(&self) -> usize {
        self.buffer.len()
    }

    /// 按格式计算的字节数
    pub fn expected_length(&self) -> usize {
        self.samples_per_channel * self.channels as usize * Self::BYTES_PER_SAMPLE
    }

    /// 以 i16 采样读取
    pub fn samples_i16(&self) -> Vec<i16> {
        let data = self.buffer.read();
        match bytemuck::try_cast_slice::<u8, i16>(&data) {
            Ok(samples) => samples.to_vec(),
            // 缓冲区未按 2 字节对齐时逐个拷贝
            Err(_) => data
                .chunks_exact(2)
                .map(|c| i16::from_ne_bytes([c[0], c[1]]))
                .collect(),
        }
    }
}

/// 转换后的视频块（BGRA 紧凑排列）
#[derive(Default)]
pub struct VideoBlock {
    pub stream_index: usize,
    pub timing: MediaTiming,
    pub pixel_width: u32,
    pub pixel_height: u32,
    /// 每行字节数
    pub stride: usize,
    /// 像素宽高比 (分子, 分母)
    pub pixel_aspect: (i32, i32),
    pub picture_number: i64,
    pub smpte_timecode: String,
    pub closed_captions: Vec<ClosedCaptionPacket>,
    pub is_hardware_frame: bool,
    pub hardware_name: Option<&'static str>,
    pub is_keyframe: bool,
    pub compressed_size: usize,
    pub buffer: BlockBuffer,
}

impl VideoBlock {
    pub const BYTES_PER_PIXEL: usize = 4;

    pub fn buffer_length(&self) -> usize {
        self.buffer.len()
    }

    pub fn expected_length(&self) -> usize {
        self.stride * self.pixel_height as usize
    }
}

/// 转换后的字幕块
#[derive(Debug, Clone, Default)]
pub struct SubtitleBlock {
    pub stream_index: usize,
    pub timing: MediaTiming,
    /// 去除标记后的纯文本行
    pub text: Vec<String>,
    /// 原始文本（保留格式）
    pub original_text: Vec<String>,
    pub original_format: SubtitleFormat,
    pub compressed_size: usize,
}

/// 可直接呈现的媒体块
pub enum MediaBlock {
    Audio(AudioBlock),
    Video(VideoBlock),
    Subtitle(SubtitleBlock),
}

impl MediaBlock {
    /// 指定类型的空块
    pub fn empty(media_type: MediaType) -> Self {
        match media_type {
            MediaType::Audio => MediaBlock::Audio(AudioBlock::default()),
            MediaType::Video => MediaBlock::Video(VideoBlock::default()),
            MediaType::Subtitle => MediaBlock::Subtitle(SubtitleBlock::default()),
        }
    }

    pub fn media_type(&self) -> MediaType {
        match self {
            MediaBlock::Audio(_) => MediaType::Audio,
            MediaBlock::Video(_) => MediaType::Video,
            MediaBlock::Subtitle(_) => MediaType::Subtitle,
        }
    }

    pub fn timing(&self) -> &MediaTiming {
        match self {
            MediaBlock::Audio(b) => &b.timing,
            MediaBlock::Video(b) => &b.timing,
            MediaBlock::Subtitle(b) => &b.timing,
        }
    }

    pub fn stream_index(&self) -> usize {
        match self {
            MediaBlock::Audio(b) => b.stream_index,
            MediaBlock::Video(b) => b.stream_index,
            MediaBlock::Subtitle(b) => b.stream_index,
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

    /// 块内是否有可用数据
    pub fn is_empty(&self) -> bool {
        match self {
            MediaBlock::Audio(b) => b.buffer.is_empty(),
            MediaBlock::Video(b) => b.buffer.is_empty(),
            MediaBlock::Subtitle(b) => b.text.is_empty() && b.original_text.is_empty(),
        }
    }

    /// 释放缓冲区
    pub fn dispose(&mut self) {
        match self {
            MediaBlock::Audio(b) => b.buffer.release(),
            MediaBlock::Video(b) => b.buffer.release(),
            MediaBlock::Subtitle(b) => {
                b.text.clear();
                b.original_text.clear();
            }
        }
    }

    pub fn as_audio(&self) -> Option<&AudioBlock> {
        match self {
            MediaBlock::Audio(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_video(&self) -> Option<&VideoBlock> {
        match self {
            MediaBlock::Video(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_subtitle(&self) -> Option<&SubtitleBlock> {
        match self {
            MediaBlock::Subtitle(b) => Some(b),
            _ => None,
        }
    }
}

impl Timed for MediaBlock {
    fn media_type(&self) -> MediaType {
        MediaBlock::media_type(self)
    }

    fn start_time(&self) -> TimeSpan {
        MediaBlock::start_time(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_reused_when_size_unchanged() {
        let buffer = BlockBuffer::new();
        assert!(buffer.ensure_len(64 * 48 * 4));
        let address = buffer.address();
        for _ in 0..5 {
            assert!(!buffer.ensure_len(64 * 48 * 4));
            assert_eq!(buffer.address(), address);
        }
        assert_eq!(buffer.allocation_count(), 1);

        assert!(buffer.ensure_len(32 * 24 * 4));
        assert_eq!(buffer.len(), 32 * 24 * 4);
        assert_eq!(buffer.allocation_count(), 2);
    }

    #[test]
    fn test_timing_repair_from_previous() {
        let previous = MediaTiming::new(Some(TimeSpan::from_millis(960)), TimeSpan::from_millis(40));
        let source = MediaTiming::new(None, TimeSpan::ZERO);

        let repaired = resolve_block_timing(&source, Some(&previous));
        assert_eq!(repaired.start_time, TimeSpan::from_millis(1000));
        assert_eq!(repaired.duration, TimeSpan::from_millis(40));
        assert_eq!(repaired.end_time, TimeSpan::from_millis(1040));
    }

    #[test]
    fn test_timing_repair_keeps_own_duration() {
        let previous = MediaTiming::new(Some(TimeSpan::from_millis(960)), TimeSpan::from_millis(40));
        let source = MediaTiming::new(None, TimeSpan::from_millis(33));
        let repaired = resolve_block_timing(&source, Some(&previous));
        assert_eq!(repaired.start_time, TimeSpan::from_millis(1000));
        assert_eq!(repaired.duration, TimeSpan::from_millis(33));

        let valid = MediaTiming::new(Some(TimeSpan::from_millis(500)), TimeSpan::from_millis(20));
        assert_eq!(resolve_block_timing(&valid, Some(&previous)), valid);
        assert_eq!(resolve_block_timing(&source, None), source);
    }

    #[test]
    fn test_valid_start_keeps_zero_duration() {
        let previous = MediaTiming::new(Some(TimeSpan::from_millis(960)), TimeSpan::from_millis(40));
        let source = MediaTiming::new(Some(TimeSpan::from_millis(1000)), TimeSpan::ZERO);

        let resolved = resolve_block_timing(&source, Some(&previous));
        assert_eq!(resolved.start_time, TimeSpan::from_millis(1000));
        assert_eq!(resolved.duration, TimeSpan::ZERO);
        assert_eq!(resolved, source);
    }

    #[test]
    fn test_audio_samples_view() {
        let block = AudioBlock {
            channels: 2,
            samples_per_channel: 2,
            ..Default::default()
        };
        block.buffer.ensure_len(block.expected_length());
        {
            let mut data = block.buffer.write();
            for (i, value) in [1i16, -2, 300, -400].iter().enumerate() {
                data[i * 2..i * 2 + 2].copy_from_slice(&value.to_ne_bytes());
            }
        }
        assert_eq!(block.samples_i16(), vec![1, -2, 300, -400]);
    }

    #[test]
    fn test_empty_block_and_dispose() {
        let mut block = MediaBlock::empty(MediaType::Subtitle);
        assert!(block.is_empty());
        if let MediaBlock::Subtitle(sub) = &mut block {
            sub.text.push("你好".into());
        }
        assert!(!block.is_empty());
        block.dispose();
        assert!(block.is_empty());
        assert_eq!(block.media_type(), MediaType::Subtitle);
    }
}
