use crate::core::{MediaError, Result};
use crate::decoding::block::VideoBlock;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;
use ffmpeg_next::util::frame;
use log::debug;

/// 输出像素格式：紧凑排列的 BGRA
pub const OUTPUT_PIXEL_FORMAT: Pixel = Pixel::BGRA;

/// 已弃用的全范围 YUVJ 格式换成对应的标准格式
pub fn normalize_pixel_format(format: Pixel) -> Pixel {
    match format {
        Pixel::YUVJ420P => Pixel::YUV420P,
        Pixel::YUVJ422P => Pixel::YUV422P,
        Pixel::YUVJ444P => Pixel::YUV444P,
        Pixel::YUVJ440P => Pixel::YUV440P,
        Pixel::YUVJ411P => Pixel::YUV411P,
        other => other,
    }
}

/// 宽高比，源未声明时为 1:1
pub fn pixel_aspect_or_square(num: i32, den: i32) -> (i32, i32) {
    if num <= 0 || den <= 0 {
        (1, 1)
    } else {
        (num, den)
    }
}

/// 缩放器缓存键
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoSourceKey {
    pub format: Pixel,
    pub width: u32,
    pub height: u32,
}

/// 视频转换：缩放 / 转换为 BGRA
pub struct VideoConverter {
    scaler: Option<scaling::Context>,
    key: Option<VideoSourceKey>,
    output: Option<frame::Video>,
}

// SwsContext 只在所属组件的转换锁内使用
unsafe impl Send for VideoConverter {}

impl VideoConverter {
    pub fn new() -> Self {
        Self {
            scaler: None,
            key: None,
            output: None,
        }
    }

    /// 源几何或格式变化时复用缓存的缩放上下文（sws_getCachedContext 会释放旧上下文）
    fn ensure_scaler(&mut self, key: VideoSourceKey) -> Result<()> {
        if self.key == Some(key) && self.scaler.is_some() {
            return Ok(());
        }
        match self.scaler.as_mut() {
            Some(scaler) => {
                debug!("缩放器参数变化: {:?} → {:?}", self.key, key);
                scaler.cached(
                    key.format,
                    key.width,
                    key.height,
                    OUTPUT_PIXEL_FORMAT,
                    key.width,
                    key.height,
                    scaling::Flags::BILINEAR,
                );
            }
            None => {
                self.scaler = Some(scaling::Context::get(
                    key.format,
                    key.width,
                    key.height,
                    OUTPUT_PIXEL_FORMAT,
                    key.width,
                    key.height,
                    scaling::Flags::BILINEAR,
                )?);
            }
        }
        self.output = None;
        self.key = Some(key);
        Ok(())
    }

    /// 转换到块缓冲区；缓冲区尺寸不变时复用
    pub fn convert(&mut self, input: &mut frame::Video, block: &mut VideoBlock) -> Result<()> {
        let format = normalize_pixel_format(input.format());
        if format != input.format() {
            input.set_format(format);
        }

        let key = VideoSourceKey {
            format,
            width: input.width(),
            height: input.height(),
        };
        self.ensure_scaler(key)?;

        let scaler = self
            .scaler
            .as_mut()
            .ok_or_else(|| MediaError::ConvertError("缩放器不可用".to_string()))?;
        let output = self
            .output
            .get_or_insert_with(|| frame::Video::new(OUTPUT_PIXEL_FORMAT, key.width, key.height));
        scaler.run(input, output)?;

        let stride = key.width as usize * VideoBlock::BYTES_PER_PIXEL;
        let height = key.height as usize;
        block.buffer.ensure_len(stride * height);
        {
            let mut buffer = block.buffer.write();
            let source_stride = output.stride(0);
            let source = output.data(0);
            for y in 0..height {
                let src = y * source_stride;
                let dst = y * stride;
                buffer[dst..dst + stride].copy_from_slice(&source[src..src + stride]);
            }
        }

        block.pixel_width = key.width;
        block.pixel_height = key.height;
        block.stride = stride;
        let aspect = input.aspect_ratio();
        block.pixel_aspect = pixel_aspect_or_square(aspect.numerator(), aspect.denominator());
        Ok(())
    }
}

impl Default for VideoConverter {
    fn default() -> Self {
        Self::new()
    }
}
