// 核心数据结构和类型定义

pub mod error;
pub mod options;
pub mod timing;
pub mod types;

use std::{process, thread};

pub use error::*;
pub use options::*;
pub use timing::*;
pub use types::*;

/// 日志上下文前缀
pub(crate) fn log_ctx() -> String {
    format!("[pid:{}-tid:{:?}]", process::id(), thread::current().id())
}
