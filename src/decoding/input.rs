use crate::core::{
    log_ctx, rational_to_f64, ContainerConfiguration, MediaError, MediaInfo, MediaInputStream,
    MediaSource, MediaType, Result, StreamInfo, TimeSpan,
};
use crate::decoding::interrupt::{interrupt_callback, ReadInterrupt};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::format::stream::Disposition;
use ffmpeg_next::{ffi, format, Dictionary, Packet};
use log::{debug, error, info, warn};
use std::ffi::{CStr, CString};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::Arc;

/// 一次读取的结果
pub enum ReadResult {
    Packet(Packet),
    EndOfStream,
    /// 解封装器暂时没有数据（EAGAIN）
    TryAgain,
}

/// 自定义输入流的状态，作为 AVIOContext 的 opaque
struct StreamOpaque {
    stream: Box<dyn MediaInputStream>,
}

/// 自定义 IO 上下文
///
/// 必须在格式上下文关闭之后释放。
struct CustomIo {
    ctx: *mut ffi::AVIOContext,
    opaque: *mut StreamOpaque,
}

impl CustomIo {
    fn new(stream: Box<dyn MediaInputStream>, buffer_size: usize) -> Result<Self> {
        let buffer_size = stream.read_buffer_length().max(buffer_size).max(4096);
        let can_seek = stream.can_seek();
        unsafe {
            let buffer = ffi::av_malloc(buffer_size) as *mut u8;
            if buffer.is_null() {
                return Err(MediaError::OpenError("无法分配 IO 缓冲区".to_string()));
            }
            let opaque = Box::into_raw(Box::new(StreamOpaque { stream }));
            let ctx = ffi::avio_alloc_context(
                buffer,
                buffer_size as c_int,
                0,
                opaque as *mut c_void,
                Some(read_stream),
                None,
                if can_seek { Some(seek_stream) } else { None },
            );
            if ctx.is_null() {
                ffi::av_free(buffer as *mut c_void);
                drop(Box::from_raw(opaque));
                return Err(MediaError::OpenError("无法创建自定义 IO 上下文".to_string()));
            }
            (*ctx).seekable = if can_seek { ffi::AVIO_SEEKABLE_NORMAL as c_int } else { 0 };
            Ok(Self { ctx, opaque })
        }
    }
}

impl Drop for CustomIo {
    fn drop(&mut self) {
        unsafe {
            if !self.ctx.is_null() {
                // 缓冲区可能已被 FFmpeg 替换，释放上下文当前持有的那块
                ffi::av_freep(&mut (*self.ctx).buffer as *mut *mut u8 as *mut c_void);
                ffi::avio_context_free(&mut self.ctx);
            }
            if !self.opaque.is_null() {
                drop(Box::from_raw(self.opaque));
                self.opaque = ptr::null_mut();
            }
        }
    }
}

unsafe extern "C" fn read_stream(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
    if opaque.is_null() || buf.is_null() || buf_size <= 0 {
        return c_int::from(ffmpeg::Error::Eof);
    }
    let source = &mut *(opaque as *mut StreamOpaque);
    let target = std::slice::from_raw_parts_mut(buf, buf_size as usize);
    match source.stream.read(target) {
        Ok(0) => c_int::from(ffmpeg::Error::Eof),
        Ok(n) => n as c_int,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
        Err(e) => {
            warn!("自定义输入流读取失败: {}", e);
            c_int::from(ffmpeg::Error::External)
        }
    }
}

unsafe extern "C" fn seek_stream(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    if opaque.is_null() {
        return -1;
    }
    let source = &mut *(opaque as *mut StreamOpaque);
    let whence = whence & !(ffi::AVSEEK_FORCE as c_int);
    if whence == ffi::AVSEEK_SIZE as c_int {
        return stream_size(&mut source.stream).map(|s| s as i64).unwrap_or(-1);
    }
    match seek_position(offset, whence) {
        Some(position) => source.stream.seek(position).map(|p| p as i64).unwrap_or(-1),
        None => -1,
    }
}

/// AVIO 的 whence 转为 `SeekFrom`
fn seek_position(offset: i64, whence: c_int) -> Option<SeekFrom> {
    match whence {
        0 if offset >= 0 => Some(SeekFrom::Start(offset as u64)),
        1 => Some(SeekFrom::Current(offset)),
        2 => Some(SeekFrom::End(offset)),
        _ => None,
    }
}

/// 流总长度，读取后恢复原位置
fn stream_size<S: Seek + ?Sized>(stream: &mut S) -> io::Result<u64> {
    let current = stream.stream_position()?;
    let end = stream.seek(SeekFrom::End(0))?;
    stream.seek(SeekFrom::Start(current))?;
    Ok(end)
}

/// 已打开的解封装输入
pub struct InputHandle {
    // 字段按声明顺序释放：格式上下文先于自定义 IO
    input: Option<format::context::Input>,
    custom_io: Option<CustomIo>,
    interrupt: Arc<ReadInterrupt>,
    description: String,
    is_network: bool,
    is_realtime: bool,
    is_seekable: bool,
}

// 格式上下文只在容器的读取锁内访问
unsafe impl Send for InputHandle {}

impl InputHandle {
    /// 分配格式上下文、挂上中断回调并探测流信息
    pub fn open(
        source: MediaSource,
        config: &ContainerConfiguration,
        interrupt: Arc<ReadInterrupt>,
    ) -> Result<Self> {
        let protocol = source.protocol();
        let is_network = protocol.is_some();
        let is_realtime = protocol.map(|p| p.is_realtime()).unwrap_or(false);
        let description = source.description();

        let (url, custom_io, stream_can_seek) = match source {
            MediaSource::Url(url) => {
                let prefix = config.protocol_prefix.as_deref().unwrap_or("");
                (format!("{}{}", prefix, url), None, None)
            }
            MediaSource::Stream(stream) => {
                let uri = stream.stream_uri();
                let can_seek = stream.can_seek();
                (uri, Some(CustomIo::new(stream, config.stream_buffer_size)?), Some(can_seek))
            }
        };

        if is_network {
            info!("{} 🌐 检测到网络流，应用网络选项: {}", log_ctx(), description);
        } else {
            info!("{} 正在打开: {}", log_ctx(), description);
        }

        let c_url = CString::new(url.as_str())
            .map_err(|_| MediaError::OpenError(format!("URL 含有非法字符: {}", description)))?;

        let mut options = Dictionary::new();
        for (key, value) in config.effective_format_options(is_network) {
            options.set(&key, &value);
        }

        let ctx = unsafe {
            let mut ctx = ffi::avformat_alloc_context();
            if ctx.is_null() {
                return Err(MediaError::OpenError("无法分配格式上下文".to_string()));
            }
            (*ctx).interrupt_callback = ffi::AVIOInterruptCB {
                callback: Some(interrupt_callback),
                opaque: interrupt.as_opaque(),
            };
            if let Some(io) = &custom_io {
                (*ctx).pb = io.ctx;
                (*ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;
            }

            let forced_format = find_input_format(config.forced_input_format.as_deref());

            let mut raw_options = options.disown();
            interrupt.begin_read();
            let ret = ffi::avformat_open_input(&mut ctx, c_url.as_ptr(), forced_format, &mut raw_options);
            interrupt.end_read();
            let ignored = Dictionary::own(raw_options);
            for (key, value) in ignored.iter() {
                debug!("未被使用的格式选项: {}={}", key, value);
            }

            if ret < 0 {
                // 失败时 avformat_open_input 已释放上下文
                let error = ffmpeg::Error::from(ret);
                error!("{} ❌ 无法打开 {}: {}", log_ctx(), description, error);
                return Err(match interrupt.classify(error) {
                    MediaError::ReadError(e) => MediaError::OpenError(format!("{}: {}", description, e)),
                    interrupted => interrupted,
                });
            }

            interrupt.begin_read();
            let ret = ffi::avformat_find_stream_info(ctx, ptr::null_mut());
            interrupt.end_read();
            if ret < 0 {
                let error = ffmpeg::Error::from(ret);
                ffi::avformat_close_input(&mut ctx);
                error!("{} ❌ 无法探测流信息 {}: {}", log_ctx(), description, error);
                return Err(match interrupt.classify(error) {
                    MediaError::ReadError(e) => MediaError::OpenError(format!("{}: {}", description, e)),
                    interrupted => interrupted,
                });
            }
            ctx
        };

        let is_seekable = match stream_can_seek {
            Some(can_seek) => can_seek,
            None => unsafe {
                let pb = (*ctx).pb;
                !is_realtime && !pb.is_null() && (*pb).seekable != 0
            },
        };

        let input = unsafe { format::context::Input::wrap(ctx) };
        info!(
            "{} ✅ 输入已打开: {} (格式: {}, 可定位: {})",
            log_ctx(),
            description,
            input.format().name(),
            is_seekable
        );

        Ok(Self {
            input: Some(input),
            custom_io,
            interrupt,
            description,
            is_network,
            is_realtime,
            is_seekable,
        })
    }

    pub fn input(&self) -> Result<&format::context::Input> {
        self.input.as_ref().ok_or(MediaError::Disposed)
    }

    fn input_mut(&mut self) -> Result<&mut format::context::Input> {
        self.input.as_mut().ok_or(MediaError::Disposed)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_network(&self) -> bool {
        self.is_network
    }

    pub fn is_realtime(&self) -> bool {
        self.is_realtime
    }

    pub fn is_seekable(&self) -> bool {
        self.is_seekable
    }

    /// 输入的起始时间（AV_TIME_BASE），未知时为 0
    pub fn start_time(&self) -> TimeSpan {
        self.input
            .as_ref()
            .and_then(|input| unsafe { TimeSpan::from_av_time((*input.as_ptr()).start_time) })
            .unwrap_or_default()
    }

    /// 读取一个数据包；读取期间受中断回调约束
    pub fn read_packet(&mut self) -> Result<ReadResult> {
        let interrupt = Arc::clone(&self.interrupt);
        let input = self.input_mut()?;
        let mut packet = Packet::empty();

        interrupt.begin_read();
        let result = packet.read(input);
        interrupt.end_read();

        match result {
            Ok(()) => Ok(ReadResult::Packet(packet)),
            Err(ffmpeg::Error::Eof) => Ok(ReadResult::EndOfStream),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                Ok(ReadResult::TryAgain)
            }
            Err(e) => Err(interrupt.classify(e)),
        }
    }

    /// 在指定流上向后定位（时间戳为该流的时间基）
    pub fn seek_stream(&mut self, stream_index: usize, timestamp: i64) -> Result<()> {
        let interrupt = Arc::clone(&self.interrupt);
        let input = self.input_mut()?;
        interrupt.begin_read();
        let ret = unsafe {
            ffi::av_seek_frame(
                input.as_mut_ptr(),
                stream_index as c_int,
                timestamp,
                ffi::AVSEEK_FLAG_BACKWARD as c_int,
            )
        };
        interrupt.end_read();
        if ret < 0 {
            return Err(MediaError::FFmpegError(ffmpeg::Error::from(ret)));
        }
        Ok(())
    }

    /// 定位到输入起点
    pub fn seek_to_start(&mut self) -> Result<()> {
        let start = self.start_time().to_timestamp(ffmpeg::rescale::TIME_BASE);
        let interrupt = Arc::clone(&self.interrupt);
        let input = self.input_mut()?;
        interrupt.begin_read();
        let ret = unsafe {
            ffi::av_seek_frame(input.as_mut_ptr(), -1, start, ffi::AVSEEK_FLAG_BACKWARD as c_int)
        };
        interrupt.end_read();
        if ret < 0 {
            return Err(MediaError::FFmpegError(ffmpeg::Error::from(ret)));
        }
        Ok(())
    }

    /// 复制指定流的封面图数据包
    pub fn attached_picture(&self, stream_index: usize) -> Option<Packet> {
        let input = self.input.as_ref()?;
        let stream = input.stream(stream_index)?;
        if !stream.disposition().contains(Disposition::ATTACHED_PIC) {
            return None;
        }
        unsafe {
            let source = &(*stream.as_ptr()).attached_pic;
            if source.size <= 0 {
                return None;
            }
            let mut packet = Packet::empty();
            if ffi::av_packet_ref(packet.as_mut_ptr(), source) < 0 {
                return None;
            }
            packet.set_stream(stream_index);
            Some(packet)
        }
    }

    /// 探测结果
    pub fn media_info(&self) -> Result<MediaInfo> {
        let input = self.input()?;
        let (duration, start_time, bit_rate) = unsafe {
            let ctx = input.as_ptr();
            (
                TimeSpan::from_av_time((*ctx).duration).filter(|d| d.is_positive()),
                TimeSpan::from_av_time((*ctx).start_time),
                (*ctx).bit_rate,
            )
        };

        let streams = input.streams().map(|stream| stream_info(&stream)).collect();
        let best_streams = MediaType::ALL
            .iter()
            .filter_map(|t| input.streams().best(t.to_ffmpeg()).map(|s| (*t, s.index())))
            .collect();

        Ok(MediaInfo {
            format_name: input.format().name().to_string(),
            duration,
            start_time,
            bit_rate,
            metadata: input
                .metadata()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            is_seekable: self.is_seekable,
            is_network: self.is_network,
            is_realtime: self.is_realtime,
            streams,
            best_streams,
        })
    }

    /// 关闭输入（可重复调用）
    pub fn close(&mut self) {
        if self.input.take().is_some() {
            debug!("{} 输入已关闭: {}", log_ctx(), self.description);
        }
        self.custom_io = None;
    }
}

impl Drop for InputHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn find_input_format(name: Option<&str>) -> *const ffi::AVInputFormat {
    let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => name,
        None => return ptr::null(),
    };
    let format = match CString::new(name) {
        Ok(c_name) => unsafe { ffi::av_find_input_format(c_name.as_ptr()) },
        Err(_) => ptr::null(),
    };
    if format.is_null() {
        warn!("找不到强制输入格式 '{}'，改为自动探测", name);
    }
    format as *const ffi::AVInputFormat
}

fn stream_info(stream: &format::stream::Stream) -> StreamInfo {
    let parameters = stream.parameters();
    let media_type = MediaType::from_ffmpeg(parameters.medium());
    let time_base = stream.time_base();
    let frame_rate = rational_to_f64(stream.avg_frame_rate());

    let (codec_id, bit_rate, width, height, raw_format, sample_rate, channels, sar) = unsafe {
        let p = parameters.as_ptr();
        (
            (*p).codec_id as i32,
            (*p).bit_rate,
            (*p).width.max(0) as u32,
            (*p).height.max(0) as u32,
            (*p).format,
            (*p).sample_rate.max(0) as u32,
            (*p).ch_layout.nb_channels.max(0) as u16,
            (*p).sample_aspect_ratio,
        )
    };

    let pixel_format = if media_type == Some(MediaType::Video) && raw_format >= 0 {
        unsafe {
            // codecpar.format 对视频流就是 AVPixelFormat
            let name = ffi::av_get_pix_fmt_name(std::mem::transmute::<c_int, ffi::AVPixelFormat>(raw_format));
            if name.is_null() {
                None
            } else {
                Some(CStr::from_ptr(name).to_string_lossy().into_owned())
            }
        }
    } else {
        None
    };

    StreamInfo {
        index: stream.index(),
        media_type,
        codec_name: parameters.id().name().to_string(),
        codec_id,
        time_base: (time_base.numerator(), time_base.denominator()),
        start_time: TimeSpan::from_timestamp(stream.start_time(), time_base),
        duration: TimeSpan::from_timestamp(stream.duration(), time_base).filter(|d| d.is_positive()),
        bit_rate,
        language: stream.metadata().get("language").map(str::to_string),
        is_attached_picture: stream.disposition().contains(Disposition::ATTACHED_PIC),
        width,
        height,
        pixel_format,
        frame_rate,
        sample_aspect_ratio: (sar.num, sar.den),
        sample_rate,
        channels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct MemoryStream(Cursor<Vec<u8>>);

    impl Read for MemoryStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl Seek for MemoryStream {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.0.seek(pos)
        }
    }

    impl MediaInputStream for MemoryStream {
        fn stream_uri(&self) -> String {
            "memory://garbage".to_string()
        }
    }

    #[test]
    fn test_seek_position_mapping() {
        assert_eq!(seek_position(10, 0), Some(SeekFrom::Start(10)));
        assert_eq!(seek_position(-4, 1), Some(SeekFrom::Current(-4)));
        assert_eq!(seek_position(0, 2), Some(SeekFrom::End(0)));
        assert_eq!(seek_position(-1, 0), None);
        assert_eq!(seek_position(0, 7), None);
    }

    #[test]
    fn test_stream_size_restores_position() {
        let mut cursor = Cursor::new(vec![0u8; 1000]);
        cursor.seek(SeekFrom::Start(123)).unwrap();
        assert_eq!(stream_size(&mut cursor).unwrap(), 1000);
        assert_eq!(cursor.position(), 123);
    }

    #[test]
    fn test_garbage_stream_fails_to_open() {
        let _ = crate::init();
        let stream = MemoryStream(Cursor::new(vec![0x5a; 64 * 1024]));
        let interrupt = Arc::new(ReadInterrupt::new(None));
        let result = InputHandle::open(
            MediaSource::from_stream(stream),
            &ContainerConfiguration::default(),
            interrupt,
        );
        assert!(matches!(result, Err(MediaError::OpenError(_))));
    }
}
