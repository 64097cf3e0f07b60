use crate::core::{MediaError, Result};
use crate::decoding::block::AudioBlock;
use ffmpeg_next::format::{sample, Sample};
use ffmpeg_next::software::resampling;
use ffmpeg_next::util::frame;
use ffmpeg_next::{ffi, ChannelLayout};
use log::debug;

/// 输出采样格式：交错 16 位有符号整数
pub const OUTPUT_SAMPLE_FORMAT: Sample = Sample::I16(sample::Type::Packed);

/// 按声道数选择布局
pub fn layout_for_channels(channels: u16) -> ChannelLayout {
    match channels {
        1 => ChannelLayout::MONO,
        2 => ChannelLayout::STEREO,
        3 => ChannelLayout::_2POINT1,
        4 => ChannelLayout::QUAD,
        5 => ChannelLayout::_5POINT0,
        6 => ChannelLayout::_5POINT1,
        8 => ChannelLayout::_7POINT1,
        _ => ChannelLayout::STEREO,
    }
}

/// 重采样器缓存键：源参数变化时重建
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSourceKey {
    pub format: Sample,
    pub layout_bits: u64,
    pub channels: u16,
    pub rate: u32,
}

impl AudioSourceKey {
    pub fn of(frame: &frame::Audio) -> Self {
        Self {
            format: frame.format(),
            layout_bits: frame.channel_layout().bits(),
            channels: frame.channels(),
            rate: frame.rate(),
        }
    }

    fn layout(&self) -> ChannelLayout {
        let layout = ChannelLayout::from_bits_truncate(self.layout_bits);
        if layout.is_empty() {
            layout_for_channels(self.channels)
        } else {
            layout
        }
    }
}

/// 按采样率比例估算输出采样数（含重采样器内部延迟余量）
pub fn estimate_output_samples(input_samples: usize, input_rate: u32, output_rate: u32) -> usize {
    if input_rate == 0 {
        return input_samples;
    }
    let scaled = (input_samples as u64 * output_rate as u64).div_ceil(input_rate as u64);
    scaled as usize + 256
}

/// 音频转换：重采样为目标采样率 / 声道的交错 S16
pub struct AudioConverter {
    resampler: Option<resampling::Context>,
    key: Option<AudioSourceKey>,
    output_rate: u32,
    output_channels: u16,
}

// SwrContext 只在所属组件的转换锁内使用
unsafe impl Send for AudioConverter {}

impl AudioConverter {
    pub fn new(output_rate: u32, output_channels: u16) -> Self {
        Self {
            resampler: None,
            key: None,
            output_rate: output_rate.max(1),
            output_channels: output_channels.max(1),
        }
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn output_channels(&self) -> u16 {
        self.output_channels
    }

    /// 源格式与上次不同才重建重采样器
    fn ensure_resampler(&mut self, key: AudioSourceKey) -> Result<&mut resampling::Context> {
        if self.key != Some(key) || self.resampler.is_none() {
            debug!(
                "🔧 初始化音频重采样器: {}Hz/{}ch {:?} → {}Hz/{}ch",
                key.rate, key.channels, key.format, self.output_rate, self.output_channels
            );
            self.resampler = None;
            self.resampler = Some(resampling::Context::get(
                key.format,
                key.layout(),
                key.rate,
                OUTPUT_SAMPLE_FORMAT,
                layout_for_channels(self.output_channels),
                self.output_rate,
            )?);
            self.key = Some(key);
        }
        self.resampler
            .as_mut()
            .ok_or_else(|| MediaError::ConvertError("重采样器不可用".to_string()))
    }

    /// 重采样到块缓冲区，返回每声道采样数
    pub fn convert(&mut self, input: &mut frame::Audio, block: &mut AudioBlock) -> Result<usize> {
        let key = AudioSourceKey::of(input);
        if input.channel_layout().is_empty() {
            // 未声明布局的帧按声道数补上默认布局，与重采样器输入一致
            input.set_channel_layout(key.layout());
            unsafe {
                let ptr = input.as_mut_ptr();
                ffi::av_channel_layout_uninit(&mut (*ptr).ch_layout);
                ffi::av_channel_layout_default(&mut (*ptr).ch_layout, key.channels as i32);
            }
        }
        let output_rate = self.output_rate;
        let output_channels = self.output_channels;
        let resampler = self.ensure_resampler(key)?;

        let capacity = estimate_output_samples(input.samples(), key.rate, output_rate);
        let mut output = frame::Audio::new(
            OUTPUT_SAMPLE_FORMAT,
            capacity,
            layout_for_channels(output_channels),
        );
        output.set_rate(output_rate);
        resampler.run(input, &mut output)?;

        let samples = output.samples();
        let length = samples * output_channels as usize * AudioBlock::BYTES_PER_SAMPLE;

        block.buffer.ensure_len(length);
        {
            let mut buffer = block.buffer.write();
            let source = output.data(0);
            let copy = length.min(source.len());
            buffer[..copy].copy_from_slice(&source[..copy]);
        }

        block.sample_rate = output_rate;
        block.channels = output_channels;
        block.samples_per_channel = samples;
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_output_samples() {
        assert_eq!(estimate_output_samples(1024, 48_000, 48_000), 1024 + 256);
        assert_eq!(estimate_output_samples(441, 44_100, 48_000), 480 + 256);
        assert_eq!(estimate_output_samples(100, 0, 48_000), 100);
    }

    #[test]
    fn test_layout_fallback() {
        assert_eq!(layout_for_channels(1), ChannelLayout::MONO);
        assert_eq!(layout_for_channels(6), ChannelLayout::_5POINT1);
        assert_eq!(layout_for_channels(13), ChannelLayout::STEREO);

        let key = AudioSourceKey {
            format: Sample::F32(sample::Type::Planar),
            layout_bits: 0,
            channels: 1,
            rate: 22_050,
        };
        assert_eq!(key.layout(), ChannelLayout::MONO);
    }

    #[test]
    fn test_resample_to_s16_stereo() {
        let mut input = frame::Audio::new(Sample::F32(sample::Type::Planar), 441, ChannelLayout::MONO);
        input.set_rate(44_100);

        let mut converter = AudioConverter::new(48_000, 2);
        let mut block = AudioBlock::default();
        let samples = converter.convert(&mut input, &mut block).unwrap();

        assert_eq!(block.channels, 2);
        assert_eq!(block.sample_rate, 48_000);
        assert_eq!(block.samples_per_channel, samples);
        assert_eq!(block.buffer_length(), block.expected_length());
    }
}
