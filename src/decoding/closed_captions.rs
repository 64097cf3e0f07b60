use serde::{Deserialize, Serialize};

/// CEA-608/708 字幕数据类型（cc_type）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptionType {
    /// NTSC 场 1（CC1/CC2）
    NtscField1,
    /// NTSC 场 2（CC3/CC4）
    NtscField2,
    /// DTVCC 数据包数据
    DtvccData,
    /// DTVCC 数据包起始
    DtvccStart,
}

impl CaptionType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => CaptionType::NtscField1,
            1 => CaptionType::NtscField2,
            2 => CaptionType::DtvccData,
            _ => CaptionType::DtvccStart,
        }
    }
}

/// A/53 侧数据中的一个字幕三元组
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedCaptionPacket {
    pub caption_type: CaptionType,
    pub data0: u8,
    pub data1: u8,
}

impl ClosedCaptionPacket {
    /// 去掉奇偶校验位后的两个字节
    pub fn payload(&self) -> (u8, u8) {
        (self.data0 & 0x7F, self.data1 & 0x7F)
    }

    /// NTSC 数据中的空填充（0x80 0x80）
    pub fn is_padding(&self) -> bool {
        self.payload() == (0, 0)
    }

    /// 字幕通道号：场 1 为 1，场 2 为 3；控制码位 3 选择第二通道
    pub fn channel(&self) -> Option<u8> {
        let base = match self.caption_type {
            CaptionType::NtscField1 => 1,
            CaptionType::NtscField2 => 3,
            _ => return None,
        };
        let (d0, _) = self.payload();
        if (0x10..=0x1F).contains(&d0) && d0 & 0x08 != 0 {
            Some(base + 1)
        } else {
            Some(base)
        }
    }
}

/// 解析 A53_CC 侧数据（3 字节一组，cc_valid 位为 0 的跳过）
pub fn parse_a53_side_data(data: &[u8]) -> Vec<ClosedCaptionPacket> {
    data.chunks_exact(3)
        .filter(|chunk| chunk[0] & 0x04 != 0)
        .map(|chunk| ClosedCaptionPacket {
            caption_type: CaptionType::from_bits(chunk[0]),
            data0: chunk[1],
            data1: chunk[2],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_a53_side_data() {
        // 有效场 1、无效条目、有效 DTVCC、不完整尾部
        let data = [0xFC, 0x94, 0x2C, 0xF8, 0x00, 0x00, 0xFE, 0x12, 0x34, 0xFC];
        let packets = parse_a53_side_data(&data);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].caption_type, CaptionType::NtscField1);
        assert_eq!(packets[0].payload(), (0x14, 0x2C));
        assert_eq!(packets[0].channel(), Some(1));
        assert_eq!(packets[1].caption_type, CaptionType::DtvccData);
        assert_eq!(packets[1].channel(), None);
    }

    #[test]
    fn test_padding_and_second_channel() {
        let padding = ClosedCaptionPacket {
            caption_type: CaptionType::NtscField2,
            data0: 0x80,
            data1: 0x80,
        };
        assert!(padding.is_padding());

        let cc4 = ClosedCaptionPacket {
            caption_type: CaptionType::NtscField2,
            data0: 0x1C,
            data1: 0x2C,
        };
        assert_eq!(cc4.channel(), Some(4));
    }
}
