use crate::core::{HardwareDeviceType, MediaError, Result};
use ffmpeg_next::codec::{self, Codec};
use ffmpeg_next::ffi;
use ffmpeg_next::util::frame;
use log::{debug, info, warn};
use std::ptr;

impl HardwareDeviceType {
    /// 对应的 FFmpeg 设备类型
    pub fn to_ffmpeg(&self) -> ffi::AVHWDeviceType {
        use ffi::AVHWDeviceType::*;
        match self {
            HardwareDeviceType::Cuda => AV_HWDEVICE_TYPE_CUDA,
            HardwareDeviceType::D3D11VA => AV_HWDEVICE_TYPE_D3D11VA,
            HardwareDeviceType::DXVA2 => AV_HWDEVICE_TYPE_DXVA2,
            HardwareDeviceType::VAAPI => AV_HWDEVICE_TYPE_VAAPI,
            HardwareDeviceType::VDPAU => AV_HWDEVICE_TYPE_VDPAU,
            HardwareDeviceType::VideoToolbox => AV_HWDEVICE_TYPE_VIDEOTOOLBOX,
            HardwareDeviceType::QSV => AV_HWDEVICE_TYPE_QSV,
        }
    }

    pub fn from_ffmpeg(device: ffi::AVHWDeviceType) -> Option<Self> {
        HardwareDeviceType::PREFERENCE
            .iter()
            .copied()
            .find(|t| t.to_ffmpeg() == device)
    }
}

/// 解码器上报的一条可用硬件配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareConfig {
    pub device_type: HardwareDeviceType,
    pub pixel_format: ffi::AVPixelFormat,
}

/// 按允许列表过滤并按设备优先级排序
pub fn prioritize(
    configs: &[HardwareConfig],
    allowed: &[HardwareDeviceType],
) -> Vec<HardwareConfig> {
    let mut selected: Vec<HardwareConfig> = configs
        .iter()
        .copied()
        .filter(|c| allowed.contains(&c.device_type))
        .collect();
    selected.sort_by_key(|c| c.device_type.rank());
    selected.dedup_by_key(|c| c.device_type);
    selected
}

/// 枚举解码器支持设备上下文方式的硬件配置
pub fn codec_hardware_configs(codec: &Codec) -> Vec<HardwareConfig> {
    let mut configs = Vec::new();
    unsafe {
        let mut index = 0;
        loop {
            let config = ffi::avcodec_get_hw_config(codec.as_ptr(), index);
            if config.is_null() {
                break;
            }
            index += 1;

            let methods = (*config).methods;
            if methods & ffi::AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as i32 == 0 {
                continue;
            }
            if let Some(device_type) = HardwareDeviceType::from_ffmpeg((*config).device_type) {
                configs.push(HardwareConfig {
                    device_type,
                    pixel_format: (*config).pix_fmt,
                });
            }
        }
    }
    configs
}

/// 硬件解码挂载
///
/// 持有设备上下文引用和 get_format 所需的像素格式；
/// 必须在解码器上下文释放之后才被释放。
pub struct HardwareAccelerator {
    device_type: HardwareDeviceType,
    pixel_format: Box<ffi::AVPixelFormat>,
    device_ctx: *mut ffi::AVBufferRef,
}

// 设备上下文是引用计数的 AVBufferRef，跨线程转移是安全的
unsafe impl Send for HardwareAccelerator {}

impl HardwareAccelerator {
    /// 在打开解码器之前挂载硬件设备；失败返回 `None`，调用方继续软件解码
    pub fn attach(
        context: &mut codec::Context,
        codec: &Codec,
        allowed: &[HardwareDeviceType],
    ) -> Option<Self> {
        if !cfg!(feature = "hwaccel") || allowed.is_empty() {
            return None;
        }

        let candidates = prioritize(&codec_hardware_configs(codec), allowed);
        if candidates.is_empty() {
            debug!("解码器 {} 没有可用的硬件配置", codec.name());
            return None;
        }

        for candidate in candidates {
            match Self::create_device(candidate.device_type) {
                Ok(device_ctx) => {
                    let accelerator = Self {
                        device_type: candidate.device_type,
                        pixel_format: Box::new(candidate.pixel_format),
                        device_ctx,
                    };
                    unsafe {
                        let ctx = context.as_mut_ptr();
                        (*ctx).hw_device_ctx = ffi::av_buffer_ref(accelerator.device_ctx);
                        (*ctx).opaque = &*accelerator.pixel_format as *const ffi::AVPixelFormat
                            as *mut std::os::raw::c_void;
                        (*ctx).get_format = Some(select_hardware_format);
                    }
                    info!("✓ 已挂载硬件解码: {} ({})", candidate.device_type.name(), codec.name());
                    return Some(accelerator);
                }
                Err(e) => {
                    warn!("硬件设备 {} 创建失败，尝试下一个: {}", candidate.device_type.name(), e);
                }
            }
        }

        warn!("没有可用的硬件设备，回退到软件解码");
        None
    }

    fn create_device(device_type: HardwareDeviceType) -> Result<*mut ffi::AVBufferRef> {
        let mut device_ctx: *mut ffi::AVBufferRef = ptr::null_mut();
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(
                &mut device_ctx,
                device_type.to_ffmpeg(),
                ptr::null(),
                ptr::null_mut(),
                0,
            )
        };
        if ret < 0 || device_ctx.is_null() {
            return Err(MediaError::FFmpegError(ffmpeg_next::Error::from(ret)));
        }
        Ok(device_ctx)
    }

    pub fn device_type(&self) -> HardwareDeviceType {
        self.device_type
    }

    pub fn name(&self) -> &'static str {
        self.device_type.name()
    }

    pub fn pixel_format(&self) -> ffi::AVPixelFormat {
        *self.pixel_format
    }

    /// 硬件帧下载为软件帧
    ///
    /// 非硬件格式的帧原样返回；下载成功时原帧被释放，第二个返回值为 `true`。
    pub fn exchange_frame(&self, input: frame::Video) -> Result<(frame::Video, bool)> {
        let is_hardware = unsafe { (*input.as_ptr()).format == *self.pixel_format as i32 };
        if !is_hardware {
            return Ok((input, false));
        }

        let mut output = frame::Video::empty();
        unsafe {
            let ret = ffi::av_hwframe_transfer_data(output.as_mut_ptr(), input.as_ptr(), 0);
            if ret < 0 {
                return Err(MediaError::FFmpegError(ffmpeg_next::Error::from(ret)));
            }
            let ret = ffi::av_frame_copy_props(output.as_mut_ptr(), input.as_ptr());
            if ret < 0 {
                return Err(MediaError::FFmpegError(ffmpeg_next::Error::from(ret)));
            }
        }
        drop(input);
        Ok((output, true))
    }
}

impl Drop for HardwareAccelerator {
    fn drop(&mut self) {
        if !self.device_ctx.is_null() {
            unsafe {
                ffi::av_buffer_unref(&mut self.device_ctx);
            }
        }
    }
}

/// get_format 回调：候选列表中有硬件格式时选它，否则交给默认协商
unsafe extern "C" fn select_hardware_format(
    ctx: *mut ffi::AVCodecContext,
    formats: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    let wanted = (*ctx).opaque as *const ffi::AVPixelFormat;
    if !wanted.is_null() {
        let mut cursor = formats;
        while *cursor != ffi::AVPixelFormat::AV_PIX_FMT_NONE {
            if *cursor == *wanted {
                return *cursor;
            }
            cursor = cursor.add(1);
        }
    }
    ffi::avcodec_default_get_format(ctx, formats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(device_type: HardwareDeviceType) -> HardwareConfig {
        HardwareConfig {
            device_type,
            pixel_format: ffi::AVPixelFormat::AV_PIX_FMT_NONE,
        }
    }

    #[test]
    fn test_prioritize_filters_and_orders() {
        let configs = [
            config(HardwareDeviceType::VDPAU),
            config(HardwareDeviceType::VAAPI),
            config(HardwareDeviceType::Cuda),
            config(HardwareDeviceType::VAAPI),
        ];
        let allowed = [HardwareDeviceType::VAAPI, HardwareDeviceType::Cuda];
        let ordered: Vec<_> = prioritize(&configs, &allowed)
            .into_iter()
            .map(|c| c.device_type)
            .collect();
        assert_eq!(ordered, vec![HardwareDeviceType::Cuda, HardwareDeviceType::VAAPI]);
        assert!(prioritize(&configs, &[]).is_empty());
    }

    #[test]
    fn test_device_type_mapping() {
        for device in HardwareDeviceType::PREFERENCE {
            assert_eq!(HardwareDeviceType::from_ffmpeg(device.to_ffmpeg()), Some(device));
        }
        assert_eq!(
            HardwareDeviceType::from_ffmpeg(ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE),
            None
        );
    }
}
