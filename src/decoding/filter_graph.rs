use crate::core::{MediaError, MediaType, Result};
use ffmpeg_next::util::frame;
use ffmpeg_next::{ffi, filter, Rational};
use log::{debug, warn};

/// 滤镜图缓存状态
///
/// 每帧计算一次参数字符串；与缓存不同才重建。
/// 构建失败也会被记住，参数不变时不再重试。
pub enum FilterState<G> {
    NoGraph,
    Built { args: String, graph: G },
    Failed { args: String },
}

pub struct FilterCache<G> {
    state: FilterState<G>,
    builds: usize,
}

impl<G> FilterCache<G> {
    pub fn new() -> Self {
        Self {
            state: FilterState::NoGraph,
            builds: 0,
        }
    }

    /// 取出与 `args` 匹配的滤镜图，必要时调用 `build` 重建；失败返回 `None`
    pub fn get_or_build<F>(&mut self, args: &str, build: F) -> Option<&mut G>
    where
        F: FnOnce(&str) -> Result<G>,
    {
        let cached = match &self.state {
            FilterState::Built { args: cached, .. } | FilterState::Failed { args: cached } => {
                cached == args
            }
            FilterState::NoGraph => false,
        };

        if !cached {
            // 旧图先释放
            self.state = FilterState::NoGraph;
            self.builds += 1;
            self.state = match build(args) {
                Ok(graph) => {
                    debug!("滤镜图已重建: {}", args);
                    FilterState::Built {
                        args: args.to_string(),
                        graph,
                    }
                }
                Err(e) => {
                    warn!("滤镜图构建失败，帧将不经过滤镜: {}", e);
                    FilterState::Failed {
                        args: args.to_string(),
                    }
                }
            };
        }

        match &mut self.state {
            FilterState::Built { graph, .. } => Some(graph),
            _ => None,
        }
    }

    pub fn reset(&mut self) {
        self.state = FilterState::NoGraph;
    }

    /// 累计构建次数
    pub fn build_count(&self) -> usize {
        self.builds
    }

    pub fn state(&self) -> &FilterState<G> {
        &self.state
    }
}

impl<G> Default for FilterCache<G> {
    fn default() -> Self {
        Self::new()
    }
}

/// 原生滤镜图（只在所属组件的锁内使用）
pub struct NativeGraph(filter::Graph);

// AVFilterGraph 不是线程安全的，但每个组件的滤镜图只在转换锁内访问
unsafe impl Send for NativeGraph {}

impl NativeGraph {
    /// `buffer` / `abuffer` -> 用户表达式 -> `buffersink` / `abuffersink`
    pub fn build(media_type: MediaType, source_args: &str, spec: &str) -> Result<Self> {
        let (source_name, sink_name) = match media_type {
            MediaType::Video => ("buffer", "buffersink"),
            MediaType::Audio => ("abuffer", "abuffersink"),
            MediaType::Subtitle => {
                return Err(MediaError::Unsupported("字幕不支持滤镜图".to_string()))
            }
        };

        let source = filter::find(source_name)
            .ok_or_else(|| MediaError::Unsupported(format!("缺少滤镜 {}", source_name)))?;
        let sink = filter::find(sink_name)
            .ok_or_else(|| MediaError::Unsupported(format!("缺少滤镜 {}", sink_name)))?;

        let mut graph = filter::Graph::new();
        graph.add(&source, "in", source_args)?;
        graph.add(&sink, "out", "")?;
        graph.output("in", 0)?.input("out", 0)?.parse(spec)?;
        graph.validate()?;
        Ok(Self(graph))
    }

    /// 送入一帧并取出所有可用的输出帧；输入帧由调用方释放
    ///
    /// 输出帧的时间戳以输出端时间基为准（`fps` / `settb` 等滤镜会改变它），一并返回。
    fn run<F>(&mut self, input: &frame::Frame, mut make: impl FnMut() -> F) -> Result<(Vec<F>, Rational)>
    where
        F: std::ops::DerefMut<Target = frame::Frame>,
    {
        self.0
            .get("in")
            .ok_or_else(|| MediaError::InvalidState("滤镜图缺少输入端".to_string()))?
            .source()
            .add(input)?;

        let mut outputs = Vec::new();
        let mut sink = self
            .0
            .get("out")
            .ok_or_else(|| MediaError::InvalidState("滤镜图缺少输出端".to_string()))?;
        let time_base = Rational::from(unsafe { ffi::av_buffersink_get_time_base(sink.as_ptr()) });
        loop {
            let mut output = make();
            match sink.sink().frame(&mut *output) {
                Ok(()) => {
                    // best_effort_timestamp 沿用输入帧的值，和改写后的 pts 不在同一时间基
                    unsafe {
                        let native = output.as_mut_ptr();
                        (*native).best_effort_timestamp = (*native).pts;
                    }
                    outputs.push(output);
                }
                Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => break,
                Err(ffmpeg_next::Error::Eof) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok((outputs, time_base))
    }

    pub fn run_video(&mut self, input: &frame::Video) -> Result<(Vec<frame::Video>, Rational)> {
        self.run(input, frame::Video::empty)
    }

    pub fn run_audio(&mut self, input: &frame::Audio) -> Result<(Vec<frame::Audio>, Rational)> {
        self.run(input, frame::Audio::empty)
    }
}

/// 视频 `buffer` 源参数，随帧几何和格式变化
pub fn video_source_args(input: &frame::Video, time_base: Rational, frame_rate: f64) -> String {
    let aspect = input.aspect_ratio();
    let (sar_num, sar_den) = if aspect.numerator() > 0 && aspect.denominator() > 0 {
        (aspect.numerator(), aspect.denominator())
    } else {
        (1, 1)
    };
    let pix_fmt: ffi::AVPixelFormat = input.format().into();
    let mut args = format!(
        "video_size={}x{}:pix_fmt={}:time_base={}/{}:pixel_aspect={}/{}",
        input.width(),
        input.height(),
        pix_fmt as i32,
        time_base.numerator(),
        time_base.denominator().max(1),
        sar_num,
        sar_den
    );
    if frame_rate > 0.0 {
        let rate = Rational::from(frame_rate);
        args.push_str(&format!(":frame_rate={}/{}", rate.numerator(), rate.denominator().max(1)));
    }
    args
}

/// 音频 `abuffer` 源参数
pub fn audio_source_args(input: &frame::Audio, time_base: Rational) -> String {
    format!(
        "time_base={}/{}:sample_rate={}:sample_fmt={}:channel_layout=0x{:x}",
        time_base.numerator(),
        time_base.denominator().max(1),
        input.rate(),
        input.format().name(),
        input.channel_layout().bits()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebuilds_only_when_args_change() {
        let mut cache: FilterCache<String> = FilterCache::new();
        for _ in 0..4 {
            let graph = cache.get_or_build("w=64:h=48", |args| Ok(format!("graph({})", args)));
            assert_eq!(graph.map(|g| g.clone()), Some("graph(w=64:h=48)".to_string()));
        }
        assert_eq!(cache.build_count(), 1);

        cache.get_or_build("w=32:h=24", |args| Ok(format!("graph({})", args)));
        assert_eq!(cache.build_count(), 2);
        assert!(matches!(cache.state(), FilterState::Built { args, .. } if args == "w=32:h=24"));
    }

    #[test]
    fn test_build_failure_falls_back_and_is_memoized() {
        let mut cache: FilterCache<String> = FilterCache::new();
        let failing = |_: &str| -> Result<String> { Err(MediaError::ConvertError("bad filter".into())) };

        assert!(cache.get_or_build("a", failing).is_none());
        assert!(cache.get_or_build("a", failing).is_none());
        assert_eq!(cache.build_count(), 1);
        assert!(matches!(cache.state(), FilterState::Failed { .. }));

        assert!(cache.get_or_build("b", |args| Ok(args.to_string())).is_some());
        assert_eq!(cache.build_count(), 2);

        cache.reset();
        assert!(matches!(cache.state(), FilterState::NoGraph));
    }

    #[test]
    fn test_outputs_use_sink_time_base() {
        ffmpeg_next::init().unwrap();
        let stream_time_base = Rational::new(1, 12_800);
        let mut input = frame::Video::new(ffmpeg_next::format::Pixel::YUV420P, 64, 48);
        input.set_pts(Some(64_000));

        let args = video_source_args(&input, stream_time_base, 0.0);
        let mut graph = NativeGraph::build(MediaType::Video, &args, "settb=1/30").unwrap();
        let (outputs, time_base) = graph.run_video(&input).unwrap();

        assert_eq!(time_base, Rational::new(1, 30));
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].pts(), Some(150));
        assert_eq!(outputs[0].timestamp(), Some(150));

        let frame = crate::decoding::frame::VideoFrame::new(outputs[0].clone(), 0, time_base, 0.0).unwrap();
        assert_eq!(frame.timing.start_time, crate::core::TimeSpan::from_secs(5));
    }
}
