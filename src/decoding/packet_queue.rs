use ffmpeg_next::Packet;
use parking_lot::RwLock;
use std::collections::VecDeque;

/// 送往解码器的数据包
///
/// 除了真实的压缩数据，还有两种哨兵：
/// - `Flush`：要求解码器丢弃内部缓冲（定位后使用）
/// - `Drain`：输入结束，要求解码器吐出剩余帧
pub enum MediaPacket {
    Data(Packet),
    Flush { stream_index: usize },
    Drain { stream_index: usize },
}

impl MediaPacket {
    pub fn stream_index(&self) -> usize {
        match self {
            MediaPacket::Data(packet) => packet.stream(),
            MediaPacket::Flush { stream_index } | MediaPacket::Drain { stream_index } => *stream_index,
        }
    }

    /// 压缩数据字节数，哨兵为 0
    pub fn size(&self) -> usize {
        match self {
            MediaPacket::Data(packet) => packet.size(),
            _ => 0,
        }
    }

    pub fn is_flush(&self) -> bool {
        matches!(self, MediaPacket::Flush { .. })
    }

    pub fn is_drain(&self) -> bool {
        matches!(self, MediaPacket::Drain { .. })
    }

    /// 流时间基下的时长
    pub fn duration(&self) -> i64 {
        match self {
            MediaPacket::Data(packet) => packet.duration().max(0),
            _ => 0,
        }
    }

    pub fn info(&self) -> PacketInfo {
        let (pts, dts, is_key) = match self {
            MediaPacket::Data(packet) => (packet.pts(), packet.dts(), packet.is_key()),
            _ => (None, None, false),
        };
        PacketInfo {
            stream_index: self.stream_index(),
            size: self.size(),
            duration: self.duration(),
            pts,
            dts,
            is_key,
            is_flush: self.is_flush(),
            is_drain: self.is_drain(),
        }
    }
}

/// 队首数据包的快照（`peek` 不交出所有权）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub stream_index: usize,
    pub size: usize,
    pub duration: i64,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub is_key: bool,
    pub is_flush: bool,
    pub is_drain: bool,
}

struct PacketQueueInner {
    packets: VecDeque<MediaPacket>,
    buffer_length: usize,
    duration: i64,
}

/// 线程安全的数据包 FIFO
///
/// 锁只在单次操作内持有，解码期间不会占用队列锁。
pub struct PacketQueue {
    inner: RwLock<PacketQueueInner>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PacketQueueInner {
                packets: VecDeque::new(),
                buffer_length: 0,
                duration: 0,
            }),
        }
    }

    pub fn push(&self, packet: MediaPacket) {
        let mut inner = self.inner.write();
        inner.buffer_length += packet.size();
        inner.duration += packet.duration();
        inner.packets.push_back(packet);
    }

    pub fn peek(&self) -> Option<PacketInfo> {
        self.inner.read().packets.front().map(MediaPacket::info)
    }

    pub fn dequeue(&self) -> Option<MediaPacket> {
        let mut inner = self.inner.write();
        let packet = inner.packets.pop_front()?;
        inner.buffer_length = inner.buffer_length.saturating_sub(packet.size());
        inner.duration = (inner.duration - packet.duration()).max(0);
        Some(packet)
    }

    /// 清空并释放所有数据包
    pub fn clear(&self) {
        let drained: Vec<MediaPacket> = {
            let mut inner = self.inner.write();
            inner.buffer_length = 0;
            inner.duration = 0;
            inner.packets.drain(..).collect()
        };
        drop(drained);
    }

    pub fn count(&self) -> usize {
        self.inner.read().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().packets.is_empty()
    }

    /// 队列中所有数据包的字节总数
    pub fn buffer_length(&self) -> usize {
        self.inner.read().buffer_length
    }

    /// 流时间基下的累计时长
    pub fn duration(&self) -> i64 {
        self.inner.read().duration
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(size: usize, stream: usize) -> MediaPacket {
        let mut packet = Packet::new(size);
        packet.set_stream(stream);
        packet.set_duration(10);
        MediaPacket::Data(packet)
    }

    #[test]
    fn test_buffer_length_accounting() {
        let queue = PacketQueue::new();
        let sizes = [120usize, 0, 4096, 7, 33];
        for (i, size) in sizes.iter().enumerate() {
            queue.push(data(*size, i % 2));
        }
        queue.push(MediaPacket::Flush { stream_index: 0 });
        assert_eq!(queue.count(), 6);
        assert_eq!(queue.buffer_length(), sizes.iter().sum::<usize>());

        let mut remaining: usize = sizes.iter().sum();
        for size in sizes.iter().take(3) {
            let packet = queue.dequeue().unwrap();
            assert_eq!(packet.size(), *size);
            remaining -= size;
            assert_eq!(queue.buffer_length(), remaining);
        }

        queue.push(data(500, 1));
        assert_eq!(queue.buffer_length(), remaining + 500);
        assert_eq!(queue.count(), 4);
    }

    #[test]
    fn test_clear_resets_everything() {
        let queue = PacketQueue::new();
        for size in [10usize, 20, 30] {
            queue.push(data(size, 0));
        }
        queue.push(MediaPacket::Drain { stream_index: 0 });
        queue.clear();
        assert_eq!(queue.count(), 0);
        assert_eq!(queue.buffer_length(), 0);
        assert_eq!(queue.duration(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_empty_queue_returns_none() {
        let queue = PacketQueue::new();
        assert!(queue.peek().is_none());
        assert!(queue.dequeue().is_none());
        assert_eq!(queue.buffer_length(), 0);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let queue = PacketQueue::new();
        queue.push(data(64, 2));
        queue.push(MediaPacket::Drain { stream_index: 2 });

        let head = queue.peek().unwrap();
        assert_eq!(head.size, 64);
        assert_eq!(head.stream_index, 2);
        assert!(!head.is_drain);
        assert_eq!(queue.count(), 2);

        queue.dequeue();
        let head = queue.peek().unwrap();
        assert!(head.is_drain);
        assert_eq!(head.size, 0);
    }
}
