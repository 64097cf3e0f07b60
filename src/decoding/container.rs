use crate::core::{
    log_ctx, BufferState, ContainerConfiguration, MediaError, MediaInfo, MediaOptions, MediaSource,
    MediaType, Result, TimeSpan,
};
use crate::decoding::block::MediaBlock;
use crate::decoding::component::MediaComponent;
use crate::decoding::component_set::{BufferChangedCallback, MediaComponentSet};
use crate::decoding::frame::{sort_by_start_time, MediaFrame};
use crate::decoding::input::{InputHandle, ReadResult};
use crate::decoding::interrupt::ReadInterrupt;
use crate::decoding::seek::{required_media_types, run_seek, SeekDriver};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 容器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Uninitialized,
    /// 输入已打开、格式已探测
    Initialized,
    /// 组件已创建
    Open,
    Disposed,
}

/// 流末尾锁存：只在首次观察到 EOF 时触发排空
///
/// 状态查询不经过读取锁。
#[derive(Debug, Default)]
pub struct EndOfStreamLatch {
    at_end: AtomicBool,
}

impl EndOfStreamLatch {
    /// 记录一次 EOF，返回是否为新的 EOF 转换
    pub fn observe_end(&self) -> bool {
        !self.at_end.swap(true, Ordering::AcqRel)
    }

    pub fn reset(&self) {
        self.at_end.store(false, Ordering::Release);
    }

    pub fn is_at_end(&self) -> bool {
        self.at_end.load(Ordering::Acquire)
    }
}

/// 定位时需要的队列操作
trait QueueControl {
    fn clear_queues(&self);
    fn send_flush_packets(&self);
}

impl QueueControl for MediaComponentSet {
    fn clear_queues(&self) {
        MediaComponentSet::clear_queues(self);
    }

    fn send_flush_packets(&self) {
        MediaComponentSet::send_flush_packets(self);
    }
}

/// 原生定位成功后才丢弃已入队的包并冲刷解码器；失败时队列保持原样
fn reposition<Q, F>(queues: &Q, seek: F) -> Result<()>
where
    Q: QueueControl + ?Sized,
    F: FnOnce() -> Result<()>,
{
    seek()?;
    queues.clear_queues();
    queues.send_flush_packets();
    Ok(())
}

/// 读取阶段的状态（读取锁保护）
struct ReadState {
    input: Option<InputHandle>,
    end_of_stream: Arc<EndOfStreamLatch>,
    /// 本轮（打开 / 定位之后）是否还需投递封面图
    attached_picture_pending: bool,
}

impl ReadState {
    fn input_mut(&mut self) -> Result<&mut InputHandle> {
        self.input.as_mut().ok_or(MediaError::Disposed)
    }

    /// 读取一个数据包并分发给组件
    fn read_into(&mut self, components: &MediaComponentSet) -> Result<Option<MediaType>> {
        let video = components.get(MediaType::Video).filter(|v| v.is_attached_picture());

        if self.attached_picture_pending {
            self.attached_picture_pending = false;
            if let Some(video) = &video {
                let picture = self.input_mut()?.attached_picture(video.stream_index());
                if let Some(packet) = picture {
                    debug!("投递封面图 (流 #{})", video.stream_index());
                    video.send_packet(Some(packet));
                    video.send_empty_packet();
                    return Ok(Some(MediaType::Video));
                }
            }
        }

        match self.input_mut()?.read_packet() {
            Ok(ReadResult::Packet(packet)) => {
                // 封面图已单独投递过
                if video.map(|v| v.stream_index() == packet.stream()).unwrap_or(false) {
                    return Ok(None);
                }
                self.end_of_stream.reset();
                Ok(components.send_packet(packet))
            }
            Ok(ReadResult::EndOfStream) => {
                if self.end_of_stream.observe_end() {
                    info!("{} 📭 到达流末尾，排空所有解码器", log_ctx());
                    components.send_empty_packets();
                }
                Ok(None)
            }
            Ok(ReadResult::TryAgain) => Ok(None),
            Err(e) => {
                if e.is_interrupt() {
                    warn!("{} 读取被打断: {}", log_ctx(), e);
                } else {
                    error!("{} ❌ 读取数据包失败: {}", log_ctx(), e);
                }
                Err(e)
            }
        }
    }
}

/// 媒体容器
///
/// 持有解封装输入和组件集合，对外提供读取 / 解码 / 转换 / 定位。
/// 三个阶段各有一把锁，可以分别在不同线程上运行；同一阶段的调用互相串行。
pub struct MediaContainer {
    configuration: ContainerConfiguration,
    options: RwLock<MediaOptions>,
    state: RwLock<ContainerState>,
    read: Mutex<ReadState>,
    decode_lock: Mutex<()>,
    convert_lock: Mutex<()>,
    components: MediaComponentSet,
    interrupt: Arc<ReadInterrupt>,
    media_info: RwLock<Option<MediaInfo>>,
    media_start_time: RwLock<TimeSpan>,
    end_of_stream: Arc<EndOfStreamLatch>,
    disposed: AtomicBool,
}

impl MediaContainer {
    /// 打开输入并探测流信息（Uninitialized → Initialized）
    pub fn new(source: MediaSource, configuration: ContainerConfiguration) -> Result<Self> {
        crate::init()?;

        let interrupt = Arc::new(ReadInterrupt::new(configuration.read_timeout()));
        let input = InputHandle::open(source, &configuration, Arc::clone(&interrupt))?;
        let media_info = input.media_info()?;
        debug!(
            "媒体信息: 格式 {}, 时长 {:?}, {} 个流",
            media_info.format_name,
            media_info.duration,
            media_info.streams.len()
        );

        let end_of_stream = Arc::new(EndOfStreamLatch::default());
        let container = Self {
            configuration,
            options: RwLock::new(MediaOptions::default()),
            state: RwLock::new(ContainerState::Uninitialized),
            read: Mutex::new(ReadState {
                input: Some(input),
                end_of_stream: Arc::clone(&end_of_stream),
                attached_picture_pending: false,
            }),
            decode_lock: Mutex::new(()),
            convert_lock: Mutex::new(()),
            components: MediaComponentSet::new(),
            interrupt,
            media_info: RwLock::new(Some(media_info)),
            media_start_time: RwLock::new(TimeSpan::ZERO),
            end_of_stream,
            disposed: AtomicBool::new(false),
        };
        *container.state.write() = ContainerState::Initialized;
        Ok(container)
    }

    /// 打开 URL 并创建组件
    pub fn open_url(url: &str, configuration: ContainerConfiguration, options: MediaOptions) -> Result<Self> {
        let container = Self::new(MediaSource::from_url(url), configuration)?;
        container.open(options)?;
        Ok(container)
    }

    /// 按选项创建组件（Initialized → Open）
    pub fn open(&self, options: MediaOptions) -> Result<()> {
        self.ensure_state(ContainerState::Initialized)?;
        let mut read = self.read.lock();
        let _decode = self.decode_lock.lock();
        let _convert = self.convert_lock.lock();

        let info = self
            .media_info
            .read()
            .clone()
            .ok_or_else(|| MediaError::InvalidState("缺少媒体信息".to_string()))?;
        let input = read.input.as_ref().ok_or(MediaError::Disposed)?;

        let mut last_error = None;
        for media_type in MediaType::ALL {
            if options.is_disabled(media_type) {
                debug!("{} 组件已被禁用", media_type);
                continue;
            }
            let stream_index = match select_stream(&info, &options, media_type) {
                Some(index) => index,
                None => continue,
            };
            match MediaComponent::open(input.input()?, stream_index, &options, self.components.tracker()) {
                Ok(component) => self.components.add(Arc::new(component)),
                Err(e) => {
                    warn!("{} 无法创建 {} 组件 (流 #{})，跳过: {}", log_ctx(), media_type, stream_index, e);
                    last_error = Some(e);
                }
            }
        }

        if self.components.is_empty() {
            error!("{} ❌ 没有可解码的流: {}", log_ctx(), input.description());
            return Err(last_error.unwrap_or(MediaError::NoDecodableStreams));
        }
        let main = self
            .refresh_main(&mut read)
            .ok_or(MediaError::NoDecodableStreams)?;
        *self.options.write() = options;
        *self.state.write() = ContainerState::Open;

        info!(
            "{} ✅ 容器已打开: 主组件 {}, 组件 {:?}",
            log_ctx(),
            main.media_type(),
            self.components.media_types()
        );
        Ok(())
    }

    /// 按当前主组件更新时间零点和封面图投递标记
    fn refresh_main(&self, read: &mut ReadState) -> Option<Arc<MediaComponent>> {
        let main = self.components.main();
        if let Some(main) = &main {
            *self.media_start_time.write() = main.start_time();
        }
        read.attached_picture_pending = self
            .components
            .get(MediaType::Video)
            .map(|v| v.is_attached_picture())
            .unwrap_or(false);
        main
    }

    fn ensure_state(&self, expected: ContainerState) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(MediaError::Disposed);
        }
        let state = *self.state.read();
        if state != expected {
            return Err(MediaError::InvalidState(format!("需要 {:?}，当前 {:?}", expected, state)));
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        self.ensure_state(ContainerState::Open)
    }

    /// 读取一个数据包，返回接收它的组件类型
    pub fn read(&self) -> Result<Option<MediaType>> {
        self.ensure_open()?;
        self.read.lock().read_into(&self.components)
    }

    /// 解码所有已入队的数据包，结果按开始时间排序
    pub fn decode(&self) -> Result<Vec<MediaFrame>> {
        self.ensure_open()?;
        let _decode = self.decode_lock.lock();
        let mut frames = Vec::new();
        for component in self.components.all() {
            frames.extend(component.receive_all_frames());
        }
        sort_by_start_time(&mut frames);
        Ok(frames)
    }

    /// 把帧转换为块；`release_input` 为真时转换后释放帧
    pub fn convert(
        &self,
        input: &mut MediaFrame,
        output: &mut MediaBlock,
        release_input: bool,
        previous: Option<&MediaBlock>,
    ) -> Result<bool> {
        self.ensure_open()?;
        let _convert = self.convert_lock.lock();
        let component = self.components.get(input.media_type());
        let result = match component {
            Some(component) => component.materialize(input, output, previous),
            None => Err(MediaError::ComponentNotFound(input.media_type())),
        };
        if release_input {
            input.dispose();
        }
        result
    }

    /// 定位到 `target`（相对媒体起点），返回目标附近按时间排序的帧
    pub fn seek(&self, target: TimeSpan) -> Result<Vec<MediaFrame>> {
        self.ensure_open()?;
        let mut read = self.read.lock();
        let _decode = self.decode_lock.lock();

        if !target.is_positive() {
            let input = read.input_mut()?;
            match reposition(&self.components, || input.seek_to_start()) {
                Ok(()) => {
                    read.end_of_stream.reset();
                    read.attached_picture_pending = true;
                    debug!("{} ⏮ 已定位到起点", log_ctx());
                }
                Err(e) => warn!("{} 定位到起点失败: {}", log_ctx(), e),
            }
            return Ok(Vec::new());
        }

        if !read.input_mut()?.is_seekable() {
            warn!("{} 输入不支持定位，忽略定位请求", log_ctx());
            return Ok(Vec::new());
        }

        let main = self
            .components
            .main()
            .ok_or_else(|| MediaError::InvalidState("没有主组件".to_string()))?;
        let duration = main.duration().unwrap_or(TimeSpan::MAX);
        let clamped = target.clamp(TimeSpan::ZERO, duration);
        let absolute = clamped + main.start_time();
        let required = required_media_types(main.media_type(), &self.components.media_types());

        let mut driver = ContainerSeekDriver {
            read: &mut *read,
            components: &self.components,
            main: main.as_ref(),
            interrupt: &self.interrupt,
        };
        let outcome = run_seek(&mut driver, absolute, main.start_time(), &required);

        info!(
            "{} ⏩ 定位到 {}: {} 帧, 原生定位 {} 次{}",
            log_ctx(),
            clamped,
            outcome.frames.len(),
            outcome.attempts,
            if outcome.validated { "" } else { "（未校验通过）" }
        );
        Ok(outcome.frames)
    }

    /// 更换或移除某类型的组件
    pub fn change_component(&self, media_type: MediaType, stream_index: Option<usize>) -> Result<()> {
        self.ensure_open()?;
        let mut read = self.read.lock();
        let _decode = self.decode_lock.lock();
        let _convert = self.convert_lock.lock();

        let stream_index = match stream_index {
            Some(index) => index,
            None => {
                if self.components.remove(media_type).is_some() {
                    self.refresh_main(&mut read);
                    info!("{} 已移除 {} 组件", log_ctx(), media_type);
                }
                return Ok(());
            }
        };

        let input = read.input.as_ref().ok_or(MediaError::Disposed)?;
        let options = self.options.read().clone();
        let component = MediaComponent::open(input.input()?, stream_index, &options, self.components.tracker())?;
        if component.media_type() != media_type {
            return Err(MediaError::InvalidState(format!(
                "流 #{} 是 {}，不是 {}",
                stream_index,
                component.media_type(),
                media_type
            )));
        }
        self.components.add(Arc::new(component));
        self.refresh_main(&mut read);
        info!("{} 🔄 {} 组件已切换到流 #{}", log_ctx(), media_type, stream_index);
        Ok(())
    }

    /// 中止读取；`auto_reset` 为真时只打断下一次读取
    pub fn signal_abort_reads(&self, auto_reset: bool) {
        info!("{} ⏹ 请求中止读取 (auto_reset: {})", log_ctx(), auto_reset);
        self.interrupt.signal_abort(auto_reset);
    }

    /// 中止是一次性的，恢复需要重新打开容器
    pub fn signal_resume_reads(&self) -> Result<()> {
        Err(MediaError::Unsupported("读取中止后需要重新打开容器".to_string()))
    }

    pub fn state(&self) -> ContainerState {
        *self.state.read()
    }

    pub fn configuration(&self) -> &ContainerConfiguration {
        &self.configuration
    }

    pub fn options(&self) -> MediaOptions {
        self.options.read().clone()
    }

    pub fn media_info(&self) -> Option<MediaInfo> {
        self.media_info.read().clone()
    }

    pub fn is_at_end_of_stream(&self) -> bool {
        self.end_of_stream.is_at_end()
    }

    pub fn is_stream_seekable(&self) -> bool {
        self.media_info.read().as_ref().map(|i| i.is_seekable).unwrap_or(false)
    }

    pub fn is_network_stream(&self) -> bool {
        self.media_info.read().as_ref().map(|i| i.is_network).unwrap_or(false)
    }

    pub fn is_realtime(&self) -> bool {
        self.media_info.read().as_ref().map(|i| i.is_realtime).unwrap_or(false)
    }

    /// 组件时间戳的零点偏移
    pub fn media_start_time(&self) -> TimeSpan {
        *self.media_start_time.read()
    }

    pub fn buffer_state(&self) -> BufferState {
        self.components.buffer_state()
    }

    pub fn set_buffer_callback(&self, callback: Option<BufferChangedCallback>) {
        self.components.tracker().set_callback(callback);
    }

    pub fn components(&self) -> Vec<Arc<MediaComponent>> {
        self.components.all()
    }

    pub fn component(&self, media_type: MediaType) -> Option<Arc<MediaComponent>> {
        self.components.get(media_type)
    }

    pub fn main_media_type(&self) -> Option<MediaType> {
        self.components.main_media_type()
    }

    /// 释放组件并关闭输入（可重复调用）
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        // 先打断可能阻塞中的读取
        self.interrupt.signal_abort(false);
        let mut read = self.read.lock();
        let _decode = self.decode_lock.lock();
        let _convert = self.convert_lock.lock();

        self.components.dispose();
        if let Some(mut input) = read.input.take() {
            input.close();
        }
        *self.state.write() = ContainerState::Disposed;
        info!("{} 🗑 容器已释放", log_ctx());
    }
}

impl Drop for MediaContainer {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// 显式指定的流优先（类型必须匹配），否则用最佳流
fn select_stream(info: &MediaInfo, options: &MediaOptions, media_type: MediaType) -> Option<usize> {
    if let Some(index) = options.stream_selection.get(&media_type) {
        match info.stream(*index) {
            Some(stream) if stream.media_type == Some(media_type) => return Some(*index),
            _ => warn!("指定的 {} 流 #{} 不可用，改用默认流", media_type, index),
        }
    }
    info.best_streams.get(&media_type).copied()
}

/// 定位算法的容器实现
struct ContainerSeekDriver<'a> {
    read: &'a mut ReadState,
    components: &'a MediaComponentSet,
    main: &'a MediaComponent,
    interrupt: &'a ReadInterrupt,
}

impl SeekDriver for ContainerSeekDriver<'_> {
    type Frame = MediaFrame;

    fn seek_to(&mut self, position: TimeSpan) -> Result<()> {
        let timestamp = position.to_timestamp(self.main.time_base());
        let stream_index = self.main.stream_index();
        let input = self.read.input_mut()?;
        reposition(self.components, || input.seek_stream(stream_index, timestamp))?;
        self.read.end_of_stream.reset();
        self.read.attached_picture_pending = true;
        Ok(())
    }

    fn read_next(&mut self) -> Result<()> {
        self.read.read_into(self.components).map(|_| ())
    }

    fn decode_pending(&mut self) -> Vec<MediaFrame> {
        let mut frames = Vec::new();
        for component in self.components.all() {
            frames.extend(component.receive_all_frames());
        }
        frames
    }

    fn is_at_end(&self) -> bool {
        self.read.end_of_stream.is_at_end()
    }

    fn is_abort_requested(&self) -> bool {
        self.interrupt.is_abort_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_fires_once_per_eof_transition() {
        let latch = EndOfStreamLatch::default();
        let mut drains = 0;
        for _ in 0..5 {
            if latch.observe_end() {
                drains += 1;
            }
        }
        assert_eq!(drains, 1);
        assert!(latch.is_at_end());

        // 定位或读到新数据后重新计数
        latch.reset();
        assert!(!latch.is_at_end());
        for _ in 0..3 {
            if latch.observe_end() {
                drains += 1;
            }
        }
        assert_eq!(drains, 2);
    }

    #[test]
    fn test_end_of_stream_readable_while_read_locked() {
        let latch = Arc::new(EndOfStreamLatch::default());
        let read = Mutex::new(ReadState {
            input: None,
            end_of_stream: Arc::clone(&latch),
            attached_picture_pending: false,
        });

        let guard = read.lock();
        assert!(guard.end_of_stream.observe_end());
        let observer = Arc::clone(&latch);
        let seen = std::thread::spawn(move || observer.is_at_end())
            .join()
            .unwrap();
        assert!(seen);
        drop(guard);
    }

    #[derive(Default)]
    struct RecordingQueues {
        calls: Mutex<Vec<&'static str>>,
    }

    impl QueueControl for RecordingQueues {
        fn clear_queues(&self) {
            self.calls.lock().push("clear");
        }

        fn send_flush_packets(&self) {
            self.calls.lock().push("flush");
        }
    }

    #[test]
    fn test_failed_native_seek_keeps_queues() {
        let queues = RecordingQueues::default();
        let result = reposition(&queues, || Err(MediaError::ReadError(ffmpeg_next::Error::Bug)));
        assert!(result.is_err());
        assert!(queues.calls.lock().is_empty());

        reposition(&queues, || Ok(())).unwrap();
        assert_eq!(*queues.calls.lock(), vec!["clear", "flush"]);
    }

    #[test]
    fn test_missing_file_fails_to_initialize() {
        let result = MediaContainer::new(
            MediaSource::from_url("/nonexistent/myy_media/missing.mp4"),
            ContainerConfiguration::default(),
        );
        assert!(matches!(result, Err(MediaError::OpenError(_))));
    }

    fn info_with_streams() -> MediaInfo {
        let stream = |index: usize, media_type: MediaType| crate::core::StreamInfo {
            index,
            media_type: Some(media_type),
            codec_name: String::new(),
            codec_id: 0,
            time_base: (1, 1000),
            start_time: None,
            duration: None,
            bit_rate: 0,
            language: None,
            is_attached_picture: false,
            width: 0,
            height: 0,
            pixel_format: None,
            frame_rate: 0.0,
            sample_aspect_ratio: (0, 1),
            sample_rate: 0,
            channels: 0,
        };
        let mut info = MediaInfo {
            streams: vec![
                stream(0, MediaType::Video),
                stream(1, MediaType::Audio),
                stream(2, MediaType::Audio),
            ],
            ..MediaInfo::default()
        };
        info.best_streams.insert(MediaType::Video, 0);
        info.best_streams.insert(MediaType::Audio, 1);
        info
    }

    #[test]
    fn test_stream_selection() {
        let info = info_with_streams();
        let mut options = MediaOptions::default();
        assert_eq!(select_stream(&info, &options, MediaType::Audio), Some(1));
        assert_eq!(select_stream(&info, &options, MediaType::Subtitle), None);

        options.stream_selection.insert(MediaType::Audio, 2);
        assert_eq!(select_stream(&info, &options, MediaType::Audio), Some(2));

        // 类型不匹配时回退到最佳流
        options.stream_selection.insert(MediaType::Audio, 0);
        assert_eq!(select_stream(&info, &options, MediaType::Audio), Some(1));
    }
}
