use crate::core::{BufferState, MediaType, TimeSpan};
use crate::decoding::component::MediaComponent;
use ffmpeg_next::Packet;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

/// 单个组件的缓冲快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComponentBufferState {
    pub length: usize,
    pub count: usize,
    pub count_threshold: usize,
    pub has_enough_packets: bool,
    pub duration: TimeSpan,
}

/// 汇总所有组件的缓冲状态；没有组件时不算"足够"
pub fn aggregate_buffer_states<'a>(
    states: impl IntoIterator<Item = &'a ComponentBufferState>,
) -> BufferState {
    let mut aggregate = BufferState::default();
    let mut any = false;
    let mut all_enough = true;
    for state in states {
        any = true;
        aggregate.length += state.length;
        aggregate.count += state.count;
        aggregate.count_threshold += state.count_threshold;
        all_enough &= state.has_enough_packets;
    }
    aggregate.has_enough_packets = any && all_enough;
    aggregate
}

pub type BufferChangedCallback = Box<dyn Fn(BufferState) + Send + Sync>;

/// 缓冲状态汇总器
///
/// 每次任意组件队列变化（入队 / 出队 / 清空）都会重新计算并发布汇总结果。
pub struct BufferTracker {
    states: Mutex<BTreeMap<MediaType, ComponentBufferState>>,
    aggregate: RwLock<BufferState>,
    callback: RwLock<Option<BufferChangedCallback>>,
}

impl BufferTracker {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(BTreeMap::new()),
            aggregate: RwLock::new(BufferState::default()),
            callback: RwLock::new(None),
        }
    }

    pub fn set_callback(&self, callback: Option<BufferChangedCallback>) {
        *self.callback.write() = callback;
    }

    pub fn update(&self, media_type: MediaType, state: ComponentBufferState) {
        let aggregate = {
            let mut states = self.states.lock();
            states.insert(media_type, state);
            aggregate_buffer_states(states.values())
        };
        self.publish(aggregate);
    }

    pub fn remove(&self, media_type: MediaType) {
        let aggregate = {
            let mut states = self.states.lock();
            if states.remove(&media_type).is_none() {
                return;
            }
            aggregate_buffer_states(states.values())
        };
        self.publish(aggregate);
    }

    fn publish(&self, aggregate: BufferState) {
        *self.aggregate.write() = aggregate;
        if let Some(callback) = self.callback.read().as_ref() {
            callback(aggregate);
        }
    }

    pub fn aggregate(&self) -> BufferState {
        *self.aggregate.read()
    }

    pub fn component(&self, media_type: MediaType) -> Option<ComponentBufferState> {
        self.states.lock().get(&media_type).copied()
    }
}

impl Default for BufferTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// 主组件选择：视频优先；视频只是封面图且有音频时选音频；其次字幕
pub fn select_main_component(
    has_audio: bool,
    video_attached_picture: Option<bool>,
    has_subtitle: bool,
) -> Option<MediaType> {
    match video_attached_picture {
        Some(true) if has_audio => Some(MediaType::Audio),
        Some(_) => Some(MediaType::Video),
        None if has_audio => Some(MediaType::Audio),
        None if has_subtitle => Some(MediaType::Subtitle),
        None => None,
    }
}

#[derive(Default)]
struct ComponentSlots {
    audio: Option<Arc<MediaComponent>>,
    video: Option<Arc<MediaComponent>>,
    subtitle: Option<Arc<MediaComponent>>,
}

impl ComponentSlots {
    fn slot(&mut self, media_type: MediaType) -> &mut Option<Arc<MediaComponent>> {
        match media_type {
            MediaType::Audio => &mut self.audio,
            MediaType::Video => &mut self.video,
            MediaType::Subtitle => &mut self.subtitle,
        }
    }

    fn get(&self, media_type: MediaType) -> Option<&Arc<MediaComponent>> {
        match media_type {
            MediaType::Audio => self.audio.as_ref(),
            MediaType::Video => self.video.as_ref(),
            MediaType::Subtitle => self.subtitle.as_ref(),
        }
    }

    fn main_type(&self) -> Option<MediaType> {
        select_main_component(
            self.audio.is_some(),
            self.video.as_ref().map(|v| v.is_attached_picture()),
            self.subtitle.is_some(),
        )
    }

    fn all(&self) -> Vec<Arc<MediaComponent>> {
        MediaType::ALL
            .iter()
            .filter_map(|t| self.get(*t).cloned())
            .collect()
    }
}

/// 每种媒体类型至多一个组件的集合
pub struct MediaComponentSet {
    slots: RwLock<ComponentSlots>,
    tracker: Arc<BufferTracker>,
}

impl MediaComponentSet {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(ComponentSlots::default()),
            tracker: Arc::new(BufferTracker::new()),
        }
    }

    /// 组件上报缓冲变化用的汇总器
    pub fn tracker(&self) -> Arc<BufferTracker> {
        Arc::clone(&self.tracker)
    }

    /// 放入组件，同类型的旧组件被释放
    pub fn add(&self, component: Arc<MediaComponent>) {
        let media_type = component.media_type();
        let previous = self.slots.write().slot(media_type).replace(component);
        if let Some(previous) = previous {
            debug!("替换 {} 组件 (流 #{})", media_type, previous.stream_index());
            previous.dispose();
        }
    }

    pub fn remove(&self, media_type: MediaType) -> Option<Arc<MediaComponent>> {
        let removed = self.slots.write().slot(media_type).take();
        if let Some(component) = &removed {
            component.dispose();
        }
        removed
    }

    pub fn get(&self, media_type: MediaType) -> Option<Arc<MediaComponent>> {
        self.slots.read().get(media_type).cloned()
    }

    /// 按 音频 / 视频 / 字幕 顺序
    pub fn all(&self) -> Vec<Arc<MediaComponent>> {
        self.slots.read().all()
    }

    pub fn count(&self) -> usize {
        self.slots.read().all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn main_media_type(&self) -> Option<MediaType> {
        self.slots.read().main_type()
    }

    pub fn main(&self) -> Option<Arc<MediaComponent>> {
        let slots = self.slots.read();
        slots.main_type().and_then(|t| slots.get(t).cloned())
    }

    pub fn media_types(&self) -> Vec<MediaType> {
        self.all().iter().map(|c| c.media_type()).collect()
    }

    /// 按流索引路由数据包；没有组件认领时返回 `None`，数据包随之释放
    pub fn send_packet(&self, packet: Packet) -> Option<MediaType> {
        let target = {
            let slots = self.slots.read();
            slots
                .all()
                .into_iter()
                .find(|c| c.stream_index() == packet.stream())
        };
        match target {
            Some(component) => {
                component.send_packet(Some(packet));
                Some(component.media_type())
            }
            None => None,
        }
    }

    /// 所有组件入队排空哨兵
    pub fn send_empty_packets(&self) {
        for component in self.all() {
            component.send_empty_packet();
        }
    }

    /// 所有组件入队冲刷哨兵
    pub fn send_flush_packets(&self) {
        for component in self.all() {
            component.send_flush_packet();
        }
    }

    pub fn clear_queues(&self) {
        for component in self.all() {
            component.clear_queue();
        }
    }

    pub fn buffer_state(&self) -> BufferState {
        self.tracker.aggregate()
    }

    /// 释放全部组件
    pub fn dispose(&self) {
        let components = {
            let mut slots = self.slots.write();
            let all = slots.all();
            *slots = ComponentSlots::default();
            all
        };
        for component in components {
            component.dispose();
        }
    }
}

impl Default for MediaComponentSet {
    fn default() -> Self {
        Self::new()
    }
}
