use crate::core::{MediaType, Result, TimeSpan};
use crate::decoding::frame::{sort_by_start_time, Timed};
use log::{debug, warn};

/// 回退重试的最大次数
pub const MAX_SEEK_RETRIES: usize = 10;
/// 每次回退的步长
pub const SEEK_RETRY_STEP: TimeSpan = TimeSpan::from_secs(1);

/// 定位校验需要的组件类型
///
/// 主组件是音频时只看音频；同时有音视频时看两者；否则看全部。
pub fn required_media_types(main: MediaType, available: &[MediaType]) -> Vec<MediaType> {
    if main == MediaType::Audio {
        return vec![MediaType::Audio];
    }
    let has_audio = available.contains(&MediaType::Audio);
    let has_video = available.contains(&MediaType::Video);
    if has_audio && has_video {
        vec![MediaType::Audio, MediaType::Video]
    } else {
        available.to_vec()
    }
}

/// 丢弃目标之前多余的帧
///
/// 每种类型只保留目标之前（含）的最后一帧和目标之后的全部帧；重复执行结果不变。
/// 结果按开始时间排序，返回丢弃的帧数。
pub fn discard_frames<T: Timed>(frames: &mut Vec<T>, target: TimeSpan) -> usize {
    sort_by_start_time(frames);

    let mut last_before = [None; 3];
    for (index, frame) in frames.iter().enumerate() {
        if frame.start_time() <= target {
            last_before[type_slot(frame.media_type())] = Some(index);
        }
    }

    let before = frames.len();
    let mut index = 0;
    frames.retain(|frame| {
        let keep = frame.start_time() > target
            || last_before[type_slot(frame.media_type())] == Some(index);
        index += 1;
        keep
    });
    before - frames.len()
}

fn type_slot(media_type: MediaType) -> usize {
    match media_type {
        MediaType::Audio => 0,
        MediaType::Video => 1,
        MediaType::Subtitle => 2,
    }
}

/// 所有必需类型都已解码到目标时间（或之后）
pub fn has_reached_target<T: Timed>(frames: &[T], required: &[MediaType], target: TimeSpan) -> bool {
    required.iter().all(|media_type| {
        frames
            .iter()
            .any(|f| f.media_type() == *media_type && f.start_time() >= target)
    })
}

/// 每个必需类型最早的帧都不晚于目标
///
/// 已到流末尾时缺帧的类型不作要求，但至少要有一帧。
pub fn is_seek_valid<T: Timed>(
    frames: &[T],
    required: &[MediaType],
    target: TimeSpan,
    at_end: bool,
) -> bool {
    required.iter().all(|media_type| {
        let earliest = frames
            .iter()
            .filter(|f| f.media_type() == *media_type)
            .map(|f| f.start_time())
            .min();
        match earliest {
            Some(start) => start <= target,
            None => at_end && !frames.is_empty(),
        }
    })
}

/// 定位过程依赖的容器操作
pub trait SeekDriver {
    type Frame: Timed;

    /// 原生向后定位：落点不晚于 `position`（流绝对时间）
    fn seek_to(&mut self, position: TimeSpan) -> Result<()>;

    /// 读取一个数据包并分发给组件
    fn read_next(&mut self) -> Result<()>;

    /// 解码所有已入队的数据包
    fn decode_pending(&mut self) -> Vec<Self::Frame>;

    fn is_at_end(&self) -> bool;

    fn is_abort_requested(&self) -> bool {
        false
    }
}

/// 定位结果
pub struct SeekOutcome<F> {
    pub frames: Vec<F>,
    /// 实际执行的原生定位次数
    pub attempts: usize,
    pub validated: bool,
}

/// 定位到 `target`（流绝对时间）并解码到目标附近
///
/// 原生定位落在目标之后（关键帧间隔导致）时，整体丢弃后回退一秒重试，
/// 回退不早于 `floor`，最多重试 [`MAX_SEEK_RETRIES`] 次。
pub fn run_seek<D: SeekDriver>(
    driver: &mut D,
    target: TimeSpan,
    floor: TimeSpan,
    required: &[MediaType],
) -> SeekOutcome<D::Frame> {
    let mut frames: Vec<D::Frame> = Vec::new();
    let mut seek_point = target;
    let mut attempts = 0;
    let mut validated = false;

    while attempts <= MAX_SEEK_RETRIES {
        frames.clear();
        attempts += 1;

        if let Err(e) = driver.seek_to(seek_point) {
            warn!("定位到 {} 失败: {}", seek_point, e);
            break;
        }

        let mut interrupted = false;
        loop {
            if driver.is_abort_requested() {
                interrupted = true;
                break;
            }
            if let Err(e) = driver.read_next() {
                if e.is_interrupt() {
                    interrupted = true;
                } else {
                    warn!("定位过程中读取失败: {}", e);
                }
                break;
            }
            frames.extend(driver.decode_pending());
            // 边解码边丢弃，限制关键帧距离很远时的内存占用
            discard_frames(&mut frames, target);

            if has_reached_target(&frames, required, target) || driver.is_at_end() {
                break;
            }
        }

        if interrupted {
            debug!("定位被中止");
            break;
        }

        if is_seek_valid(&frames, required, target, driver.is_at_end()) {
            validated = true;
            break;
        }

        if seek_point <= floor {
            break;
        }
        if attempts > MAX_SEEK_RETRIES {
            warn!("定位到 {} 重试 {} 次仍未落在目标之前，返回当前结果", target, MAX_SEEK_RETRIES);
            break;
        }
        seek_point = (seek_point - SEEK_RETRY_STEP).max(floor);
        debug!("定位越过目标 {}，回退到 {} 重试", target, seek_point);
    }

    discard_frames(&mut frames, target);
    SeekOutcome {
        frames,
        attempts,
        validated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MediaError;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Stamp(MediaType, i64);

    impl Timed for Stamp {
        fn media_type(&self) -> MediaType {
            self.0
        }
        fn start_time(&self) -> TimeSpan {
            TimeSpan::from_millis(self.1)
        }
    }

    fn ms(value: i64) -> TimeSpan {
        TimeSpan::from_millis(value)
    }

    /// 视频 40ms 一帧、关键帧间隔 `keyframe_ms`；原生定位落在目标之后的第一个关键帧
    struct MockDriver {
        duration_ms: i64,
        keyframe_ms: i64,
        video_ms: i64,
        audio_ms: i64,
        pending: Vec<Stamp>,
        seeks: Vec<TimeSpan>,
        fail_seek: bool,
        abort_after_reads: Option<usize>,
        reads: usize,
    }

    impl MockDriver {
        fn new(keyframe_ms: i64) -> Self {
            Self {
                duration_ms: 10_000,
                keyframe_ms,
                video_ms: 0,
                audio_ms: 0,
                pending: Vec::new(),
                seeks: Vec::new(),
                fail_seek: false,
                abort_after_reads: None,
                reads: 0,
            }
        }
    }

    impl SeekDriver for MockDriver {
        type Frame = Stamp;

        fn seek_to(&mut self, position: TimeSpan) -> Result<()> {
            self.seeks.push(position);
            if self.fail_seek {
                return Err(MediaError::Unsupported("seek".into()));
            }
            let position = position.as_millis().max(0);
            let keyframe = (position + self.keyframe_ms - 1) / self.keyframe_ms * self.keyframe_ms;
            self.video_ms = keyframe.min(self.duration_ms);
            self.audio_ms = position / 20 * 20;
            self.pending.clear();
            Ok(())
        }

        fn read_next(&mut self) -> Result<()> {
            self.reads += 1;
            if self.video_ms < self.duration_ms {
                self.pending.push(Stamp(MediaType::Video, self.video_ms));
                self.video_ms += 40;
            }
            for _ in 0..2 {
                if self.audio_ms < self.duration_ms {
                    self.pending.push(Stamp(MediaType::Audio, self.audio_ms));
                    self.audio_ms += 20;
                }
            }
            Ok(())
        }

        fn decode_pending(&mut self) -> Vec<Stamp> {
            std::mem::take(&mut self.pending)
        }

        fn is_at_end(&self) -> bool {
            self.video_ms >= self.duration_ms && self.audio_ms >= self.duration_ms
        }

        fn is_abort_requested(&self) -> bool {
            self.abort_after_reads.map(|n| self.reads >= n).unwrap_or(false)
        }
    }

    fn earliest(frames: &[Stamp], media_type: MediaType) -> Option<TimeSpan> {
        frames
            .iter()
            .filter(|f| f.0 == media_type)
            .map(|f| f.start_time())
            .min()
    }

    #[test]
    fn test_required_types_policy() {
        let all = [MediaType::Audio, MediaType::Video, MediaType::Subtitle];
        assert_eq!(required_media_types(MediaType::Audio, &all), vec![MediaType::Audio]);
        assert_eq!(
            required_media_types(MediaType::Video, &all),
            vec![MediaType::Audio, MediaType::Video]
        );
        assert_eq!(
            required_media_types(MediaType::Video, &[MediaType::Video, MediaType::Subtitle]),
            vec![MediaType::Video, MediaType::Subtitle]
        );
    }

    #[test]
    fn test_discard_keeps_last_frame_before_target() {
        let mut frames = vec![
            Stamp(MediaType::Video, 80),
            Stamp(MediaType::Audio, 0),
            Stamp(MediaType::Video, 0),
            Stamp(MediaType::Video, 40),
            Stamp(MediaType::Audio, 20),
            Stamp(MediaType::Audio, 40),
            Stamp(MediaType::Video, 120),
            Stamp(MediaType::Audio, 60),
        ];
        let dropped = discard_frames(&mut frames, ms(50));
        assert_eq!(dropped, 3);
        assert_eq!(
            frames,
            vec![
                Stamp(MediaType::Video, 40),
                Stamp(MediaType::Audio, 40),
                Stamp(MediaType::Audio, 60),
                Stamp(MediaType::Video, 80),
                Stamp(MediaType::Video, 120),
            ]
        );
    }

    #[test]
    fn test_discard_is_idempotent() {
        let mut frames: Vec<Stamp> = (0..50)
            .map(|i| Stamp(if i % 3 == 0 { MediaType::Video } else { MediaType::Audio }, i * 13))
            .collect();
        discard_frames(&mut frames, ms(300));
        let once = frames.clone();
        assert_eq!(discard_frames(&mut frames, ms(300)), 0);
        assert_eq!(frames, once);
    }

    #[test]
    fn test_overshoot_retries_one_second_earlier() {
        let mut driver = MockDriver::new(2_000);
        let required = [MediaType::Audio, MediaType::Video];
        let outcome = run_seek(&mut driver, ms(5_000), TimeSpan::ZERO, &required);

        assert!(outcome.validated);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(driver.seeks, vec![ms(5_000), ms(4_000)]);
        for media_type in required {
            assert!(earliest(&outcome.frames, media_type).unwrap() <= ms(5_000));
        }
        assert!(outcome
            .frames
            .windows(2)
            .all(|w| w[0].start_time() <= w[1].start_time()));
    }

    #[test]
    fn test_seek_bound_holds_across_targets() {
        let required = [MediaType::Audio, MediaType::Video];
        for target in [0, 1, 4_999, 5_000, 7_777, 10_000] {
            let mut driver = MockDriver::new(3_000);
            let outcome = run_seek(&mut driver, ms(target), TimeSpan::ZERO, &required);
            assert!(outcome.validated, "target {}", target);
            for media_type in required {
                let first = earliest(&outcome.frames, media_type).unwrap();
                assert!(first <= ms(target), "target {} {:?} {}", target, media_type, first);
            }
        }
    }

    #[test]
    fn test_retries_are_bounded() {
        // 关键帧间隔远大于重试覆盖范围
        let mut driver = MockDriver::new(60_000);
        driver.duration_ms = 120_000;
        let outcome = run_seek(&mut driver, ms(30_000), TimeSpan::ZERO, &[MediaType::Video]);
        assert!(!outcome.validated);
        assert_eq!(outcome.attempts, MAX_SEEK_RETRIES + 1);
        assert_eq!(driver.seeks.last(), Some(&ms(20_000)));
    }

    #[test]
    fn test_failed_native_seek_breaks() {
        let mut driver = MockDriver::new(2_000);
        driver.fail_seek = true;
        let outcome = run_seek(&mut driver, ms(5_000), TimeSpan::ZERO, &[MediaType::Video]);
        assert!(outcome.frames.is_empty());
        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.validated);
    }

    #[test]
    fn test_abort_stops_seek() {
        let mut driver = MockDriver::new(2_000);
        driver.abort_after_reads = Some(3);
        let outcome = run_seek(&mut driver, ms(9_000), TimeSpan::ZERO, &[MediaType::Video]);
        assert!(!outcome.validated);
        assert_eq!(driver.reads, 3);
    }
}
