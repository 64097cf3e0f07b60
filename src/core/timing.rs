use ffmpeg_next::Rational;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// FFmpeg 中表示"无时间戳"的值
pub const NO_TIMESTAMP: i64 = ffmpeg_next::ffi::AV_NOPTS_VALUE;

/// 有符号时间值（微秒精度）
///
/// 所有帧、块、组件的时间都用它表示。媒体起始偏移可能为负，
/// 所以不能用 `std::time::Duration`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeSpan(i64);

impl TimeSpan {
    pub const ZERO: TimeSpan = TimeSpan(0);
    pub const MIN: TimeSpan = TimeSpan(i64::MIN);
    pub const MAX: TimeSpan = TimeSpan(i64::MAX);

    pub const fn from_micros(micros: i64) -> Self {
        TimeSpan(micros)
    }

    pub const fn from_millis(millis: i64) -> Self {
        TimeSpan(millis.saturating_mul(1_000))
    }

    pub const fn from_secs(secs: i64) -> Self {
        TimeSpan(secs.saturating_mul(1_000_000))
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        TimeSpan((secs * 1_000_000.0).round() as i64)
    }

    pub const fn as_micros(&self) -> i64 {
        self.0
    }

    pub const fn as_millis(&self) -> i64 {
        self.0 / 1_000
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// 按时间基把流时间戳换算为时间值；`NO_TIMESTAMP` 返回 `None`
    pub fn from_timestamp(timestamp: i64, time_base: Rational) -> Option<Self> {
        if timestamp == NO_TIMESTAMP || time_base.denominator() == 0 {
            return None;
        }
        let micros = timestamp as i128 * time_base.numerator() as i128 * 1_000_000
            / time_base.denominator() as i128;
        Some(TimeSpan(micros.clamp(i64::MIN as i128 + 1, i64::MAX as i128) as i64))
    }

    /// 换算回指定时间基的流时间戳
    pub fn to_timestamp(&self, time_base: Rational) -> i64 {
        if time_base.numerator() == 0 {
            return 0;
        }
        let ts = self.0 as i128 * time_base.denominator() as i128
            / (time_base.numerator() as i128 * 1_000_000);
        ts.clamp(i64::MIN as i128 + 1, i64::MAX as i128) as i64
    }

    /// AV_TIME_BASE（微秒）单位的时间戳
    pub fn from_av_time(value: i64) -> Option<Self> {
        if value == NO_TIMESTAMP {
            None
        } else {
            Some(TimeSpan(value))
        }
    }

    pub fn clamp(self, min: TimeSpan, max: TimeSpan) -> TimeSpan {
        TimeSpan(self.0.clamp(min.0, max.0.max(min.0)))
    }
}

impl Add for TimeSpan {
    type Output = TimeSpan;
    fn add(self, rhs: TimeSpan) -> TimeSpan {
        TimeSpan(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for TimeSpan {
    fn add_assign(&mut self, rhs: TimeSpan) {
        *self = *self + rhs;
    }
}

impl Sub for TimeSpan {
    type Output = TimeSpan;
    fn sub(self, rhs: TimeSpan) -> TimeSpan {
        TimeSpan(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for TimeSpan {
    fn sub_assign(&mut self, rhs: TimeSpan) {
        *self = *self - rhs;
    }
}

impl Neg for TimeSpan {
    type Output = TimeSpan;
    fn neg(self) -> TimeSpan {
        TimeSpan(self.0.saturating_neg())
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let micros = abs % 1_000_000;
        let total_secs = abs / 1_000_000;
        write!(
            f,
            "{}{:02}:{:02}:{:02}.{:06}",
            sign,
            total_secs / 3600,
            (total_secs / 60) % 60,
            total_secs % 60,
            micros
        )
    }
}

/// 有理数转浮点，分母为 0 时返回 0
pub fn rational_to_f64(value: Rational) -> f64 {
    if value.denominator() == 0 {
        0.0
    } else {
        value.numerator() as f64 / value.denominator() as f64
    }
}

/// 由开始时间与帧率推算显示帧序号
pub fn picture_number(start_time: TimeSpan, frame_rate: f64) -> i64 {
    if frame_rate <= 0.0 || start_time.is_negative() {
        return 0;
    }
    (start_time.as_secs_f64() * frame_rate).round() as i64
}

/// SMPTE 时间码 `hh:mm:ss:ff`
pub fn smpte_timecode(start_time: TimeSpan, frame_rate: f64) -> String {
    let fps = frame_rate.round().max(1.0) as i64;
    let number = picture_number(start_time, frame_rate);
    let frames = number % fps;
    let total_secs = number / fps;
    format!(
        "{:02}:{:02}:{:02}:{:02}",
        total_secs / 3600,
        (total_secs / 60) % 60,
        total_secs % 60,
        frames
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_timestamp() {
        let tb = Rational::new(1, 90_000);
        assert_eq!(TimeSpan::from_timestamp(90_000, tb), Some(TimeSpan::from_secs(1)));
        assert_eq!(TimeSpan::from_timestamp(NO_TIMESTAMP, tb), None);
        assert_eq!(TimeSpan::from_timestamp(10, Rational::new(1, 0)), None);
        assert_eq!(TimeSpan::from_secs(2).to_timestamp(tb), 180_000);
    }

    #[test]
    fn test_display() {
        assert_eq!(TimeSpan::from_millis(3_723_500).to_string(), "01:02:03.500000");
        assert_eq!(TimeSpan::from_millis(-1_500).to_string(), "-00:00:01.500000");
    }

    #[test]
    fn test_saturating_arithmetic() {
        assert_eq!(TimeSpan::MAX + TimeSpan::from_secs(1), TimeSpan::MAX);
        assert_eq!(TimeSpan::from_secs(5) - TimeSpan::from_secs(7), TimeSpan::from_secs(-2));
        assert_eq!(
            TimeSpan::from_secs(12).clamp(TimeSpan::ZERO, TimeSpan::from_secs(10)),
            TimeSpan::from_secs(10)
        );
    }

    #[test]
    fn test_smpte_timecode() {
        assert_eq!(smpte_timecode(TimeSpan::from_millis(1_500), 25.0), "00:00:01:13");
        assert_eq!(picture_number(TimeSpan::from_secs(2), 30.0), 60);
        assert_eq!(picture_number(TimeSpan::from_secs(2), 0.0), 0);
    }
}
