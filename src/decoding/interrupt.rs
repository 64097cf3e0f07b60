use crate::core::MediaError;
use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// 读取被打断的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    Aborted,
    TimedOut,
}

const REASON_NONE: u8 = 0;
const REASON_ABORTED: u8 = 1;
const REASON_TIMED_OUT: u8 = 2;

/// 原生读取的中断控制
///
/// 通过 `AVIOInterruptCB` 挂在格式上下文上，FFmpeg 在阻塞 IO 中轮询它。
pub struct ReadInterrupt {
    abort_requested: AtomicBool,
    auto_reset: AtomicBool,
    /// 当前读取开始时刻（相对 epoch 的微秒 + 1），0 表示没有在读
    read_started: AtomicU64,
    last_reason: AtomicU8,
    timeout: Option<Duration>,
    epoch: Instant,
}

impl ReadInterrupt {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            abort_requested: AtomicBool::new(false),
            auto_reset: AtomicBool::new(false),
            read_started: AtomicU64::new(0),
            last_reason: AtomicU8::new(REASON_NONE),
            timeout,
            epoch: Instant::now(),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// 开始一次受超时约束的读取
    pub fn begin_read(&self) {
        let now = self.epoch.elapsed().as_micros() as u64 + 1;
        self.read_started.store(now, Ordering::SeqCst);
        self.last_reason.store(REASON_NONE, Ordering::SeqCst);
    }

    pub fn end_read(&self) {
        self.read_started.store(0, Ordering::SeqCst);
    }

    /// 请求中止读取；`auto_reset` 为真时只打断一次
    pub fn signal_abort(&self, auto_reset: bool) {
        self.auto_reset.store(auto_reset, Ordering::SeqCst);
        self.abort_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    /// 读取已进行的时长
    pub fn elapsed(&self) -> Option<Duration> {
        match self.read_started.load(Ordering::SeqCst) {
            0 => None,
            started => {
                let now = self.epoch.elapsed().as_micros() as u64 + 1;
                Some(Duration::from_micros(now.saturating_sub(started)))
            }
        }
    }

    /// 是否应打断当前原生调用
    pub fn should_interrupt(&self) -> bool {
        if self.abort_requested.load(Ordering::SeqCst) {
            if self.auto_reset.load(Ordering::SeqCst) {
                self.abort_requested.store(false, Ordering::SeqCst);
            }
            self.last_reason.store(REASON_ABORTED, Ordering::SeqCst);
            return true;
        }

        match (self.timeout, self.elapsed()) {
            (Some(timeout), Some(elapsed)) if elapsed > timeout => {
                self.last_reason.store(REASON_TIMED_OUT, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    pub fn last_reason(&self) -> Option<InterruptReason> {
        match self.last_reason.load(Ordering::SeqCst) {
            REASON_ABORTED => Some(InterruptReason::Aborted),
            REASON_TIMED_OUT => Some(InterruptReason::TimedOut),
            _ => None,
        }
    }

    /// 把读取错误转换为容器错误，区分中止、超时与普通读错误
    pub fn classify(&self, error: ffmpeg_next::Error) -> MediaError {
        match (error, self.last_reason()) {
            (ffmpeg_next::Error::Exit, Some(InterruptReason::TimedOut)) => {
                MediaError::ReadTimeout(self.timeout.map(|t| t.as_millis()).unwrap_or(0))
            }
            (ffmpeg_next::Error::Exit, _) => MediaError::ReadAborted,
            (error, _) => MediaError::ReadError(error),
        }
    }

    /// 供 `AVIOInterruptCB.opaque` 使用的指针
    pub(crate) fn as_opaque(&self) -> *mut c_void {
        self as *const ReadInterrupt as *mut c_void
    }
}

/// FFmpeg 中断回调：返回非 0 时当前阻塞调用以 AVERROR_EXIT 结束
pub(crate) unsafe extern "C" fn interrupt_callback(opaque: *mut c_void) -> c_int {
    if opaque.is_null() {
        return 0;
    }
    let interrupt = &*(opaque as *const ReadInterrupt);
    c_int::from(interrupt.should_interrupt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_interrupt_by_default() {
        let interrupt = ReadInterrupt::new(Some(Duration::from_secs(30)));
        interrupt.begin_read();
        assert!(!interrupt.should_interrupt());
        interrupt.end_read();
        assert!(interrupt.elapsed().is_none());
        assert_eq!(interrupt.last_reason(), None);
    }

    #[test]
    fn test_abort_one_shot_and_auto_reset() {
        let interrupt = ReadInterrupt::new(None);
        interrupt.signal_abort(false);
        assert!(interrupt.should_interrupt());
        assert!(interrupt.should_interrupt());
        assert!(matches!(interrupt.classify(ffmpeg_next::Error::Exit), MediaError::ReadAborted));

        let interrupt = ReadInterrupt::new(None);
        interrupt.signal_abort(true);
        assert!(interrupt.should_interrupt());
        assert!(!interrupt.should_interrupt());
        assert!(!interrupt.is_abort_requested());
    }

    #[test]
    fn test_timeout_only_during_read() {
        let interrupt = ReadInterrupt::new(Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!interrupt.should_interrupt());

        interrupt.begin_read();
        std::thread::sleep(Duration::from_millis(5));
        assert!(interrupt.should_interrupt());
        assert_eq!(interrupt.last_reason(), Some(InterruptReason::TimedOut));
        assert!(matches!(interrupt.classify(ffmpeg_next::Error::Exit), MediaError::ReadTimeout(1)));
        assert!(matches!(
            interrupt.classify(ffmpeg_next::Error::Eof),
            MediaError::ReadError(ffmpeg_next::Error::Eof)
        ));
    }

    #[test]
    fn test_callback_reads_opaque() {
        let interrupt = ReadInterrupt::new(None);
        unsafe {
            assert_eq!(interrupt_callback(std::ptr::null_mut()), 0);
            assert_eq!(interrupt_callback(interrupt.as_opaque()), 0);
            interrupt.signal_abort(false);
            assert_eq!(interrupt_callback(interrupt.as_opaque()), 1);
        }
    }
}
