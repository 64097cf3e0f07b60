use crate::core::{
    log_ctx, picture_number, rational_to_f64, smpte_timecode, MediaError, MediaOptions, MediaType,
    Result, ThreadCount, TimeSpan,
};
use crate::decoding::audio::AudioConverter;
use crate::decoding::block::{resolve_block_timing, MediaBlock};
use crate::decoding::component_set::{BufferTracker, ComponentBufferState};
use crate::decoding::filter_graph::{audio_source_args, video_source_args, FilterCache, NativeGraph};
use crate::decoding::frame::{AudioFrame, MediaFrame, NativeSubtitle, SubtitleFrame, VideoFrame};
use crate::decoding::hw_accel::HardwareAccelerator;
use crate::decoding::packet_queue::{MediaPacket, PacketQueue};
use crate::decoding::subtitle::SubtitleConverter;
use crate::decoding::video::VideoConverter;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec::subtitle::Subtitle;
use ffmpeg_next::codec::{self, decoder, Codec};
use ffmpeg_next::format::stream::Disposition;
use ffmpeg_next::util::frame;
use ffmpeg_next::{ffi, Dictionary, Packet, Rational};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::ops::DerefMut;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// 打开解码器的全局锁（avcodec_open2 跨实例并发不安全）
static CODEC_OPEN_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// 音频组件认为缓冲足够的包数
const AUDIO_BUFFER_COUNT_THRESHOLD: usize = 48;
/// 视频组件的最小阈值
const MIN_VIDEO_BUFFER_COUNT_THRESHOLD: usize = 16;
/// 排空字幕解码器时最多送入的空包数
const MAX_SUBTITLE_DRAIN_PACKETS: usize = 8;

/// 缓冲包数阈值
pub fn buffer_count_threshold(media_type: MediaType, frame_rate: f64) -> usize {
    match media_type {
        MediaType::Audio => AUDIO_BUFFER_COUNT_THRESHOLD,
        MediaType::Video => {
            let rounded = if frame_rate.is_finite() && frame_rate > 0.0 {
                frame_rate.round() as usize
            } else {
                0
            };
            rounded.max(MIN_VIDEO_BUFFER_COUNT_THRESHOLD)
        }
        MediaType::Subtitle => 0,
    }
}

/// 字幕和封面图不需要预读
pub fn has_enough_packets(
    media_type: MediaType,
    is_attached_picture: bool,
    count: usize,
    threshold: usize,
) -> bool {
    if media_type == MediaType::Subtitle || is_attached_picture {
        return true;
    }
    count >= threshold
}

/// 已打开的解码器
enum ComponentDecoder {
    Audio(decoder::Audio),
    Video {
        // 字段按声明顺序释放：解码器上下文先于硬件设备
        decoder: decoder::Video,
        hardware: Option<HardwareAccelerator>,
    },
    Subtitle(decoder::Subtitle),
}

// AVCodecContext 只在组件的解码锁内访问
unsafe impl Send for ComponentDecoder {}

enum FrameConverter {
    Audio(AudioConverter),
    Video(VideoConverter),
    Subtitle(SubtitleConverter),
}

/// 组件统计信息
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentStats {
    pub media_type: MediaType,
    pub stream_index: usize,
    pub codec_name: String,
    pub bit_rate: i64,
    pub lifetime_bytes_read: u64,
    pub start_time: TimeSpan,
    pub duration: Option<TimeSpan>,
    pub frame_rate: f64,
    pub is_hardware_accelerated: bool,
    pub buffer: ComponentBufferState,
}

/// 单个基本流的解码组件
///
/// 持有解码器、待解码包队列和转换器。
/// 解码（`receive_frames`）和转换（`materialize`）各自加锁，可以在不同线程上并行。
pub struct MediaComponent {
    media_type: MediaType,
    stream_index: usize,
    codec_name: String,
    time_base: Rational,
    start_time: TimeSpan,
    duration: Option<TimeSpan>,
    bit_rate: i64,
    frame_rate: f64,
    is_attached_picture: bool,
    hardware_name: Option<&'static str>,
    filter_spec: Option<String>,

    packets: PacketQueue,
    /// 已送入解码器、尚未产出帧的数据包
    in_flight: PacketQueue,
    lifetime_bytes_read: AtomicU64,

    decoder: Mutex<Option<ComponentDecoder>>,
    converter: Mutex<FrameConverter>,
    filter: Mutex<FilterCache<NativeGraph>>,
    tracker: Arc<BufferTracker>,
    disposed: AtomicBool,
}

impl MediaComponent {
    /// 为输入中的指定流创建组件
    ///
    /// 先尝试用户强制的解码器，再回退到流的默认解码器；全部失败时返回错误。
    pub fn open(
        input: &ffmpeg::format::context::Input,
        stream_index: usize,
        options: &MediaOptions,
        tracker: Arc<BufferTracker>,
    ) -> Result<Self> {
        let stream = input
            .stream(stream_index)
            .ok_or_else(|| MediaError::OpenError(format!("流 #{} 不存在", stream_index)))?;
        let parameters = stream.parameters();
        let media_type = MediaType::from_ffmpeg(parameters.medium()).ok_or_else(|| {
            MediaError::Unsupported(format!("流 #{} 的媒体类型 {:?}", stream_index, parameters.medium()))
        })?;

        let mut time_base = stream.time_base();
        let mut frame_rate = if media_type == MediaType::Video {
            let average = rational_to_f64(stream.avg_frame_rate());
            if average > 0.0 {
                average
            } else {
                rational_to_f64(stream.rate())
            }
        } else {
            0.0
        };
        let forced_rate = options
            .forced_frame_rate
            .filter(|fps| media_type == MediaType::Video && fps.is_finite() && *fps > 0.0);
        if let Some(fps) = forced_rate {
            // 强制帧率：包时间基改为 1/fps
            time_base = Rational::from(fps).invert();
            frame_rate = fps;
            debug!("流 #{} 强制帧率 {:.3}，时间基 {}", stream_index, fps, time_base);
        }

        let start_time = TimeSpan::from_timestamp(stream.start_time(), time_base).unwrap_or_default();
        let duration = TimeSpan::from_timestamp(stream.duration(), time_base)
            .filter(|d| d.is_positive())
            .or_else(|| TimeSpan::from_av_time(input.duration()).filter(|d| d.is_positive()));
        let bit_rate = unsafe { (*parameters.as_ptr()).bit_rate };
        let is_attached_picture = media_type == MediaType::Video
            && stream.disposition().contains(Disposition::ATTACHED_PIC);

        let candidates = decoder_candidates(media_type, stream_index, parameters.id(), options);
        if candidates.is_empty() {
            warn!("{} 流 #{} 找不到 {} 解码器 ({:?})", log_ctx(), stream_index, media_type, parameters.id());
            return Err(MediaError::DecoderNotFound { media_type, stream_index });
        }

        let mut last_error = None;
        let mut opened = None;
        for codec in candidates {
            match open_decoder(&stream, &codec, media_type, time_base, forced_rate, options) {
                Ok(decoder) => {
                    opened = Some((codec, decoder));
                    break;
                }
                Err(e) => {
                    warn!("解码器 {} 打开失败，尝试下一个: {}", codec.name(), e);
                    last_error = Some((codec.name().to_string(), e));
                }
            }
        }

        let (codec, decoder) = match (opened, last_error) {
            (Some(opened), _) => opened,
            (None, Some((codec, source))) => {
                warn!("{} 流 #{} 没有可用的解码器", log_ctx(), stream_index);
                return Err(MediaError::DecoderOpenError { codec, source });
            }
            (None, None) => return Err(MediaError::DecoderNotFound { media_type, stream_index }),
        };

        let hardware_name = match &decoder {
            ComponentDecoder::Video { hardware: Some(hw), .. } => Some(hw.name()),
            _ => None,
        };
        let converter = match media_type {
            MediaType::Audio => FrameConverter::Audio(AudioConverter::new(
                options.audio_output_sample_rate,
                options.audio_output_channels,
            )),
            MediaType::Video => FrameConverter::Video(VideoConverter::new()),
            MediaType::Subtitle => FrameConverter::Subtitle(SubtitleConverter::new(
                TimeSpan::from_millis(options.subtitle_delay_ms),
            )),
        };

        info!(
            "{} ✅ {} 组件已创建: 流 #{}, 解码器 {}{}",
            log_ctx(),
            media_type,
            stream_index,
            codec.name(),
            hardware_name.map(|n| format!(" (硬件: {})", n)).unwrap_or_default()
        );

        let component = Self {
            media_type,
            stream_index,
            codec_name: codec.name().to_string(),
            time_base,
            start_time,
            duration,
            bit_rate,
            frame_rate,
            is_attached_picture,
            hardware_name,
            filter_spec: options.filter_for(media_type).map(str::to_string),
            packets: PacketQueue::new(),
            in_flight: PacketQueue::new(),
            lifetime_bytes_read: AtomicU64::new(0),
            decoder: Mutex::new(Some(decoder)),
            converter: Mutex::new(converter),
            filter: Mutex::new(FilterCache::new()),
            tracker,
            disposed: AtomicBool::new(false),
        };
        component.notify_queue_changed();
        Ok(component)
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// 流的起始时间（组件时间戳的零点偏移）
    pub fn start_time(&self) -> TimeSpan {
        self.start_time
    }

    pub fn duration(&self) -> Option<TimeSpan> {
        self.duration
    }

    pub fn bit_rate(&self) -> i64 {
        self.bit_rate
    }

    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    pub fn is_attached_picture(&self) -> bool {
        self.is_attached_picture
    }

    pub fn is_hardware_accelerated(&self) -> bool {
        self.hardware_name.is_some()
    }

    pub fn hardware_name(&self) -> Option<&'static str> {
        self.hardware_name
    }

    pub fn lifetime_bytes_read(&self) -> u64 {
        self.lifetime_bytes_read.load(Ordering::Relaxed)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn packet_count(&self) -> usize {
        self.packets.count()
    }

    pub fn buffer_length(&self) -> usize {
        self.packets.buffer_length()
    }

    pub fn buffer_state(&self) -> ComponentBufferState {
        let count = self.packets.count();
        let count_threshold = buffer_count_threshold(self.media_type, self.frame_rate);
        ComponentBufferState {
            length: self.packets.buffer_length(),
            count,
            count_threshold,
            has_enough_packets: has_enough_packets(
                self.media_type,
                self.is_attached_picture,
                count,
                count_threshold,
            ),
            duration: TimeSpan::from_timestamp(self.packets.duration(), self.time_base).unwrap_or_default(),
        }
    }

    pub fn stats(&self) -> ComponentStats {
        ComponentStats {
            media_type: self.media_type,
            stream_index: self.stream_index,
            codec_name: self.codec_name.clone(),
            bit_rate: self.bit_rate,
            lifetime_bytes_read: self.lifetime_bytes_read(),
            start_time: self.start_time,
            duration: self.duration,
            frame_rate: self.frame_rate,
            is_hardware_accelerated: self.is_hardware_accelerated(),
            buffer: self.buffer_state(),
        }
    }

    fn notify_queue_changed(&self) {
        if !self.is_disposed() {
            self.tracker.update(self.media_type, self.buffer_state());
        }
    }

    /// 数据包入队；`None` 视为输入结束，入队排空哨兵
    pub fn send_packet(&self, packet: Option<Packet>) {
        let packet = match packet {
            Some(packet) => packet,
            None => return self.send_empty_packet(),
        };
        if self.is_disposed() {
            return;
        }
        let size = packet.size();
        self.packets.push(MediaPacket::Data(packet));
        if size > 0 {
            self.lifetime_bytes_read.fetch_add(size as u64, Ordering::Relaxed);
        }
        self.notify_queue_changed();
    }

    /// 入队排空哨兵
    pub fn send_empty_packet(&self) {
        if self.is_disposed() {
            return;
        }
        self.packets.push(MediaPacket::Drain {
            stream_index: self.stream_index,
        });
        self.notify_queue_changed();
    }

    /// 入队冲刷哨兵
    pub fn send_flush_packet(&self) {
        if self.is_disposed() {
            return;
        }
        self.packets.push(MediaPacket::Flush {
            stream_index: self.stream_index,
        });
        self.notify_queue_changed();
    }

    pub fn clear_queue(&self) {
        self.packets.clear();
        self.notify_queue_changed();
    }

    /// 解码队首的一个数据包，返回 0..N 帧
    pub fn receive_frames(&self) -> Vec<MediaFrame> {
        let packet = match self.packets.dequeue() {
            Some(packet) => packet,
            None => return Vec::new(),
        };
        self.notify_queue_changed();

        let mut guard = self.decoder.lock();
        let decoder = match guard.as_mut() {
            Some(decoder) => decoder,
            None => return Vec::new(),
        };

        let frames = match decoder {
            ComponentDecoder::Audio(audio) => {
                let natives = self.decode_av(audio, packet, frame::Audio::empty);
                let mut frames = Vec::with_capacity(natives.len());
                for native in natives {
                    let (filtered, time_base) = self.filter_audio(native);
                    for native in filtered {
                        match AudioFrame::new(native, self.stream_index, time_base) {
                            Some(frame) => frames.push(MediaFrame::Audio(frame)),
                            None => warn!("丢弃无效音频帧 (流 #{})", self.stream_index),
                        }
                    }
                }
                frames
            }
            ComponentDecoder::Video { decoder, hardware } => {
                let natives = self.decode_av(decoder, packet, frame::Video::empty);
                let mut frames = Vec::with_capacity(natives.len());
                for native in natives {
                    let (native, is_hardware) = match hardware.as_ref() {
                        Some(hw) => match hw.exchange_frame(native) {
                            Ok(exchanged) => exchanged,
                            Err(e) => {
                                warn!("硬件帧下载失败（已跳过）: {}", e);
                                continue;
                            }
                        },
                        None => (native, false),
                    };
                    let (filtered, time_base) = self.filter_video(native);
                    for filtered in filtered {
                        match VideoFrame::new(filtered, self.stream_index, time_base, self.frame_rate) {
                            Some(mut frame) => {
                                frame.is_hardware_frame = is_hardware;
                                frame.hardware_name = if is_hardware { self.hardware_name } else { None };
                                frames.push(MediaFrame::Video(frame));
                            }
                            None => warn!("丢弃无效视频帧 (流 #{})", self.stream_index),
                        }
                    }
                }
                frames
            }
            ComponentDecoder::Subtitle(subtitle) => self.decode_subtitle(subtitle, packet),
        };

        if !frames.is_empty() {
            self.in_flight.clear();
        }
        frames
    }

    /// 解码直到队列为空
    pub fn receive_all_frames(&self) -> Vec<MediaFrame> {
        let mut frames = Vec::new();
        while !self.packets.is_empty() {
            frames.extend(self.receive_frames());
        }
        frames
    }

    /// 解码直到产出至少一帧或队列为空
    pub fn receive_next_frames(&self) -> Vec<MediaFrame> {
        while !self.packets.is_empty() {
            let frames = self.receive_frames();
            if !frames.is_empty() {
                return frames;
            }
        }
        Vec::new()
    }

    /// 音视频解码：send_packet 后循环 receive_frame 直到 EAGAIN
    fn decode_av<D, F>(&self, decoder: &mut D, packet: MediaPacket, make: fn() -> F) -> Vec<F>
    where
        D: DerefMut<Target = decoder::Opened>,
        F: DerefMut<Target = frame::Frame>,
    {
        let opened: &mut decoder::Opened = decoder;
        let mut decoded = Vec::new();

        match packet {
            MediaPacket::Flush { .. } => {
                opened.flush();
                self.in_flight.clear();
                return decoded;
            }
            MediaPacket::Drain { .. } => {
                if let Err(e) = opened.send_eof() {
                    debug!("解码器排空失败: {}", e);
                }
                receive_into(opened, make, &mut decoded);
                // 排空后解码器处于 EOF 状态，flush 后才能继续接收数据
                opened.flush();
                self.in_flight.clear();
                return decoded;
            }
            MediaPacket::Data(data) => {
                match opened.send_packet(&data) {
                    Ok(()) => {}
                    Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                        // 输出尚未取完，先取帧再重新送入
                        receive_into(opened, make, &mut decoded);
                        if let Err(e) = opened.send_packet(&data) {
                            warn!("数据包重新送入解码器失败（已跳过）: {}", e);
                            return decoded;
                        }
                    }
                    Err(ffmpeg::Error::Eof) => {
                        debug!("解码器收到 EOF（send_packet），执行 flush 并忽略本次包");
                        opened.flush();
                        return decoded;
                    }
                    Err(e) => {
                        warn!("解码错误（已跳过）: {}", e);
                        return decoded;
                    }
                }
                self.in_flight.push(MediaPacket::Data(data));
            }
        }

        receive_into(opened, make, &mut decoded);
        decoded
    }

    /// 字幕解码：一次性 decode，排空时送入空包取出缓冲的字幕
    fn decode_subtitle(&self, subtitle: &mut decoder::Subtitle, packet: MediaPacket) -> Vec<MediaFrame> {
        let mut frames = Vec::new();
        match packet {
            MediaPacket::Flush { .. } => {
                subtitle.flush();
                self.in_flight.clear();
            }
            MediaPacket::Data(data) => {
                let mut native = Subtitle::new();
                let result = subtitle.decode(&data, &mut native);
                let native = NativeSubtitle::new(native);
                match result {
                    Ok(true) => frames.push(MediaFrame::Subtitle(SubtitleFrame::new(
                        native,
                        self.stream_index,
                        self.time_base,
                        data.pts(),
                        data.duration(),
                        data.size(),
                    ))),
                    Ok(false) => self.in_flight.push(MediaPacket::Data(data)),
                    Err(e) => warn!("字幕解码错误（已跳过）: {}", e),
                }
            }
            MediaPacket::Drain { .. } => {
                for _ in 0..MAX_SUBTITLE_DRAIN_PACKETS {
                    let mut empty = Packet::empty();
                    empty.set_stream(self.stream_index);
                    let mut native = Subtitle::new();
                    let result = subtitle.decode(&empty, &mut native);
                    let native = NativeSubtitle::new(native);
                    match result {
                        Ok(true) => frames.push(MediaFrame::Subtitle(SubtitleFrame::new(
                            native,
                            self.stream_index,
                            self.time_base,
                            None,
                            0,
                            0,
                        ))),
                        _ => break,
                    }
                }
                self.in_flight.clear();
            }
        }
        frames
    }

    /// 返回滤镜输出帧及其时间基；未经过滤镜时为流时间基
    fn filter_video(&self, native: frame::Video) -> (Vec<frame::Video>, Rational) {
        let spec = match self.filter_spec.as_deref() {
            Some(spec) => spec,
            None => return (vec![native], self.time_base),
        };
        let args = video_source_args(&native, self.time_base, self.frame_rate);
        let mut cache = self.filter.lock();
        match cache.get_or_build(&args, |a| NativeGraph::build(MediaType::Video, a, spec)) {
            Some(graph) => match graph.run_video(&native) {
                Ok(outputs) => outputs,
                Err(e) => {
                    warn!("视频滤镜处理失败，帧不经过滤镜: {}", e);
                    (vec![native], self.time_base)
                }
            },
            None => (vec![native], self.time_base),
        }
    }

    fn filter_audio(&self, native: frame::Audio) -> (Vec<frame::Audio>, Rational) {
        let spec = match self.filter_spec.as_deref() {
            Some(spec) => spec,
            None => return (vec![native], self.time_base),
        };
        let args = audio_source_args(&native, self.time_base);
        let mut cache = self.filter.lock();
        match cache.get_or_build(&args, |a| NativeGraph::build(MediaType::Audio, a, spec)) {
            Some(graph) => match graph.run_audio(&native) {
                Ok(outputs) => outputs,
                Err(e) => {
                    warn!("音频滤镜处理失败，帧不经过滤镜: {}", e);
                    (vec![native], self.time_base)
                }
            },
            None => (vec![native], self.time_base),
        }
    }

    /// 把帧转换为块
    ///
    /// `previous` 为同类型的上一块，用于修复缺失的时间戳。
    /// 帧已释放时返回 `Ok(false)`。
    pub fn materialize(
        &self,
        input: &mut MediaFrame,
        output: &mut MediaBlock,
        previous: Option<&MediaBlock>,
    ) -> Result<bool> {
        if input.media_type() != self.media_type {
            return Err(MediaError::ComponentNotFound(input.media_type()));
        }
        if input.is_stale() {
            return Ok(false);
        }
        if output.media_type() != self.media_type {
            *output = MediaBlock::empty(self.media_type);
        }
        let previous = previous
            .filter(|p| p.media_type() == self.media_type)
            .map(|p| *p.timing());

        let mut converter = self.converter.lock();
        match (&mut *converter, input, output) {
            (FrameConverter::Audio(converter), MediaFrame::Audio(frame), MediaBlock::Audio(block)) => {
                let native = match frame.native_mut() {
                    Some(native) => native,
                    None => return Ok(false),
                };
                converter.convert(native, block)?;
                block.stream_index = frame.stream_index;
                block.compressed_size = frame.compressed_size;
                block.timing = resolve_block_timing(&frame.timing, previous.as_ref());
            }
            (FrameConverter::Video(converter), MediaFrame::Video(frame), MediaBlock::Video(block)) => {
                let native = match frame.native_mut() {
                    Some(native) => native,
                    None => return Ok(false),
                };
                converter.convert(native, block)?;
                block.stream_index = frame.stream_index;
                block.compressed_size = frame.compressed_size;
                block.timing = resolve_block_timing(&frame.timing, previous.as_ref());
                block.picture_number = picture_number(block.timing.start_time, self.frame_rate);
                block.smpte_timecode = smpte_timecode(block.timing.start_time, self.frame_rate);
                block.closed_captions = frame.closed_captions.clone();
                block.is_hardware_frame = frame.is_hardware_frame;
                block.hardware_name = frame.hardware_name;
                block.is_keyframe = frame.is_keyframe;
            }
            (FrameConverter::Subtitle(converter), MediaFrame::Subtitle(frame), MediaBlock::Subtitle(block)) => {
                converter.convert(frame, block);
                block.stream_index = frame.stream_index;
                block.compressed_size = frame.compressed_size;
                block.timing = resolve_block_timing(&block.timing, previous.as_ref());
            }
            _ => {
                return Err(MediaError::ConvertError(format!(
                    "{} 组件收到不匹配的帧或块",
                    self.media_type
                )))
            }
        }
        Ok(true)
    }

    /// 释放解码器并清空队列（可重复调用）
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let decoder = self.decoder.lock().take();
        drop(decoder);
        self.packets.clear();
        self.in_flight.clear();
        self.filter.lock().reset();
        self.tracker.remove(self.media_type);
        debug!("{} {} 组件已释放 (流 #{})", log_ctx(), self.media_type, self.stream_index);
    }
}

impl Drop for MediaComponent {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// 取出解码器当前可用的全部帧
fn receive_into<F>(opened: &mut decoder::Opened, make: fn() -> F, out: &mut Vec<F>)
where
    F: DerefMut<Target = frame::Frame>,
{
    loop {
        let mut decoded = make();
        match opened.receive_frame(&mut decoded) {
            Ok(()) => out.push(decoded),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => break,
            Err(ffmpeg::Error::Eof) => break,
            Err(e) => {
                warn!("解码错误（已跳过）: {}", e);
                break;
            }
        }
    }
}

/// 解码器候选：强制名称在前，流的默认解码器在后
fn decoder_candidates(
    media_type: MediaType,
    stream_index: usize,
    codec_id: codec::Id,
    options: &MediaOptions,
) -> Vec<Codec> {
    let mut candidates = Vec::new();
    if let Some(name) = options.forced_codec(media_type, stream_index) {
        match decoder::find_by_name(name).filter(|c| MediaType::from_ffmpeg(c.medium()) == Some(media_type)) {
            Some(codec) => candidates.push(codec),
            None => warn!(
                "找不到强制指定的 {} 解码器 '{}' (流 #{})，回退到默认解码器",
                media_type, name, stream_index
            ),
        }
    }
    if let Some(codec) = decoder::find(codec_id) {
        if !candidates.iter().any(|c| c.name() == codec.name()) {
            candidates.push(codec);
        }
    }
    candidates
}

/// 每个候选解码器都从流参数新建上下文
fn open_decoder(
    stream: &ffmpeg::format::stream::Stream,
    codec: &Codec,
    media_type: MediaType,
    time_base: Rational,
    forced_rate: Option<f64>,
    options: &MediaOptions,
) -> Result<ComponentDecoder> {
    let mut context = codec::Context::from_parameters(stream.parameters())?;
    apply_decoder_options(&mut context, codec, time_base, forced_rate, options);

    let hardware = if media_type == MediaType::Video {
        HardwareAccelerator::attach(&mut context, codec, &options.video_hardware_devices)
    } else {
        None
    };

    let mut dictionary = Dictionary::new();
    if options.decoder_threads == ThreadCount::Auto {
        dictionary.set("threads", "auto");
    }

    let opened = {
        let _guard = CODEC_OPEN_LOCK.lock();
        context.decoder().open_as_with(*codec, dictionary)
    }
    .map_err(|source| MediaError::DecoderOpenError {
        codec: codec.name().to_string(),
        source,
    })?;

    Ok(match media_type {
        MediaType::Audio => ComponentDecoder::Audio(opened.audio()?),
        MediaType::Video => ComponentDecoder::Video {
            decoder: opened.video()?,
            hardware,
        },
        MediaType::Subtitle => ComponentDecoder::Subtitle(opened.subtitle()?),
    })
}

fn apply_decoder_options(
    context: &mut codec::Context,
    codec: &Codec,
    time_base: Rational,
    forced_rate: Option<f64>,
    options: &MediaOptions,
) {
    let max_lowres = unsafe { (*codec.as_ptr()).max_lowres as i32 };
    let lowres = options.low_resolution_index.max(0);
    if lowres > max_lowres {
        warn!(
            "解码器 {} 不支持低分辨率级别 {}（最大 {}），已忽略",
            codec.name(),
            lowres,
            max_lowres
        );
    }

    unsafe {
        let ctx = context.as_mut_ptr();
        (*ctx).pkt_timebase = time_base.into();
        (*ctx).thread_count = options.decoder_threads.as_native();
        if lowres > 0 && lowres <= max_lowres {
            (*ctx).lowres = lowres;
        }
        if options.enable_fast_decoding {
            (*ctx).flags2 |= ffi::AV_CODEC_FLAG2_FAST as i32;
        }
        if options.enable_low_delay_decoding {
            (*ctx).flags |= ffi::AV_CODEC_FLAG_LOW_DELAY as i32;
        }
        if let Some(fps) = forced_rate {
            (*ctx).framerate = Rational::from(fps).into();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_thresholds() {
        assert_eq!(buffer_count_threshold(MediaType::Audio, 0.0), 48);
        assert_eq!(buffer_count_threshold(MediaType::Video, 29.97), 30);
        assert_eq!(buffer_count_threshold(MediaType::Video, 60.0), 60);
        assert_eq!(buffer_count_threshold(MediaType::Video, 12.0), 16);
        assert_eq!(buffer_count_threshold(MediaType::Video, f64::NAN), 16);
        assert_eq!(buffer_count_threshold(MediaType::Subtitle, 25.0), 0);
    }

    #[test]
    fn test_has_enough_packets() {
        assert!(has_enough_packets(MediaType::Subtitle, false, 0, 0));
        assert!(has_enough_packets(MediaType::Video, true, 0, 25));
        assert!(!has_enough_packets(MediaType::Video, false, 24, 25));
        assert!(has_enough_packets(MediaType::Video, false, 25, 25));
        assert!(!has_enough_packets(MediaType::Audio, false, 47, 48));
    }

    #[test]
    fn test_forced_decoder_falls_back_to_default() {
        let _ = ffmpeg::init();
        let mut options = MediaOptions::default();
        options
            .decoder_codec_by_type
            .insert(MediaType::Audio, "no_such_decoder".to_string());

        let candidates = decoder_candidates(MediaType::Audio, 1, codec::Id::PCM_S16LE, &options);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id(), codec::Id::PCM_S16LE);

        options
            .decoder_codec_by_stream
            .insert(1, "pcm_s16le".to_string());
        let candidates = decoder_candidates(MediaType::Audio, 1, codec::Id::PCM_S16LE, &options);
        assert_eq!(candidates.len(), 1);
    }

    #[test]
    fn test_forced_decoder_of_wrong_type_is_ignored() {
        let _ = ffmpeg::init();
        let mut options = MediaOptions::default();
        options
            .decoder_codec_by_type
            .insert(MediaType::Video, "pcm_s16le".to_string());
        let candidates = decoder_candidates(MediaType::Video, 0, codec::Id::MJPEG, &options);
        assert!(candidates.iter().all(|c| c.id() != codec::Id::PCM_S16LE));
    }
}
