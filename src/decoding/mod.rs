// 解码管线：解封装 → 数据包队列 → 解码 → 转换

pub mod audio;
pub mod block;
pub mod closed_captions;
pub mod component;
pub mod component_set;
pub mod container;
pub mod filter_graph;  // FFmpeg 滤镜图（带失败缓存）
pub mod frame;
pub mod hw_accel;
pub mod input;         // 输入打开、中断回调、自定义 IO
pub mod interrupt;
pub mod packet_queue;
pub mod seek;          // 多流同步定位算法
pub mod subtitle;
pub mod video;

pub use audio::AudioConverter;
pub use block::{AudioBlock, BlockBuffer, MediaBlock, SubtitleBlock, VideoBlock};
pub use closed_captions::{CaptionType, ClosedCaptionPacket};
pub use component::{ComponentStats, MediaComponent};
pub use component_set::{BufferChangedCallback, BufferTracker, ComponentBufferState, MediaComponentSet};
pub use container::{ContainerState, MediaContainer};
pub use frame::{AudioFrame, MediaFrame, MediaTiming, SubtitleFrame, Timed, VideoFrame};
pub use hw_accel::HardwareAccelerator;
pub use interrupt::ReadInterrupt;
pub use packet_queue::{MediaPacket, PacketQueue};
pub use subtitle::SubtitleConverter;
pub use video::VideoConverter;
