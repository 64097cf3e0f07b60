use crate::core::TimeSpan;
use crate::decoding::block::SubtitleBlock;
use crate::decoding::frame::{SubtitleFormat, SubtitleFrame};

/// 取出 ASS 事件行的文本字段
///
/// 兼容两种形式：
/// - `Dialogue: Layer,Start,End,Style,Name,MarginL,MarginR,MarginV,Effect,Text`
/// - FFmpeg 解码输出的 `ReadOrder,Layer,Style,Name,MarginL,MarginR,MarginV,Effect,Text`
pub fn ass_dialogue_text(line: &str) -> &str {
    let line = line.trim_end_matches(['\r', '\n']);
    let (body, fields) = match line.strip_prefix("Dialogue:") {
        Some(rest) => (rest, 10),
        None => (line, 9),
    };
    match body.splitn(fields, ',').nth(fields - 1) {
        Some(text) => text,
        None => body,
    }
}

/// 去掉 ASS 覆盖标签 `{...}`，处理 `\N` `\n` `\h`
pub fn strip_ass_markup(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut in_tag = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' => in_tag = true,
            '}' if in_tag => in_tag = false,
            _ if in_tag => {}
            '\\' => match chars.peek() {
                Some('N') | Some('n') => {
                    chars.next();
                    result.push('\n');
                }
                Some('h') => {
                    chars.next();
                    result.push(' ');
                }
                _ => result.push(ch),
            },
            _ => result.push(ch),
        }
    }
    result
}

/// 去掉 SRT / HTML 风格标签 `<i>` `</b>` `<font color=...>`
pub fn strip_srt_markup(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('<') {
        result.push_str(&rest[..open]);
        let candidate = &rest[open + 1..];
        let is_tag = candidate
            .chars()
            .next()
            .map(|c| c == '/' || c.is_ascii_alphabetic())
            .unwrap_or(false);
        match candidate.find('>') {
            Some(close) if is_tag => rest = &candidate[close + 1..],
            _ => {
                result.push('<');
                rest = candidate;
            }
        }
    }
    result.push_str(rest);
    strip_ass_markup(&result)
}

/// 拆成非空行
pub fn split_lines(text: &str) -> Vec<String> {
    text.replace("\r\n", "\n")
        .split(['\n', '\r'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// 按原始格式去除标记，返回纯文本行
pub fn plain_text_lines(texts: &[String], format: SubtitleFormat) -> Vec<String> {
    texts
        .iter()
        .flat_map(|text| match format {
            SubtitleFormat::Ass => split_lines(&strip_ass_markup(ass_dialogue_text(text))),
            _ => split_lines(&strip_srt_markup(text)),
        })
        .collect()
}

/// 字幕转换：不做缓冲区转换，只去标记并应用延迟
pub struct SubtitleConverter {
    delay: TimeSpan,
}

impl SubtitleConverter {
    pub fn new(delay: TimeSpan) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> TimeSpan {
        self.delay
    }

    pub fn convert(&self, input: &SubtitleFrame, block: &mut SubtitleBlock) {
        let (texts, format) = input
            .native()
            .map(|native| native.text_rects())
            .unwrap_or_default();

        block.text = plain_text_lines(&texts, format);
        block.original_text = texts;
        block.original_format = format;
        block.timing = input.timing.shifted(self.delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ass_dialogue_text_both_forms() {
        assert_eq!(
            ass_dialogue_text("Dialogue: 0,0:00:01.00,0:00:02.50,Default,,0,0,0,,Hello, world"),
            "Hello, world"
        );
        assert_eq!(
            ass_dialogue_text("3,0,Default,,0,0,0,,{\\i1}你好{\\i0}，世界"),
            "{\\i1}你好{\\i0}，世界"
        );
        assert_eq!(ass_dialogue_text("plain"), "plain");
    }

    #[test]
    fn test_strip_ass_markup() {
        assert_eq!(strip_ass_markup("{\\b1}Hello{\\b0} World"), "Hello World");
        assert_eq!(strip_ass_markup("Line 1\\NLine 2"), "Line 1\nLine 2");
        assert_eq!(strip_ass_markup("{\\an8\\pos(100,200)}A\\hB"), "A B");
    }

    #[test]
    fn test_strip_srt_markup() {
        assert_eq!(strip_srt_markup("<i>Hello</i> <font color=\"#fff\">there</font>"), "Hello there");
        assert_eq!(strip_srt_markup("1 < 2 and 3 > 2"), "1 < 2 and 3 > 2");
        assert_eq!(strip_srt_markup("a <b unclosed"), "a <b unclosed");
    }

    #[test]
    fn test_plain_text_lines() {
        let ass = vec!["0,0,Default,,0,0,0,,First\\N{\\i1}Second".to_string()];
        assert_eq!(plain_text_lines(&ass, SubtitleFormat::Ass), vec!["First", "Second"]);

        let srt = vec!["<i>one</i>\r\n\r\n two ".to_string()];
        assert_eq!(plain_text_lines(&srt, SubtitleFormat::Text), vec!["one", "two"]);
        assert!(plain_text_lines(&[], SubtitleFormat::None).is_empty());
    }
}
