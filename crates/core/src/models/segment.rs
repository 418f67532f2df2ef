use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 导出时间的显示格式
pub const EXPORT_TIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S%.3f UTC";

/// 拷贝时间窗口 `(start_time, end_time]`
///
/// 对账统计使用的桶是 `[start_time, end_time)`, 见 [`Segment::covers`]。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Segment {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl Segment {
    pub fn new(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time,
        }
    }

    /// 没有新数据时起止时间相同
    pub fn is_empty(&self) -> bool {
        self.start_time >= self.end_time
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }

    pub fn is_contiguous_with(&self, next: &Segment) -> bool {
        self.end_time == next.start_time
    }

    /// 拷贝作业是否包含该导出时间
    pub fn contains(&self, export_time: DateTime<Utc>) -> bool {
        self.start_time < export_time && export_time <= self.end_time
    }

    /// 统计桶是否包含该导出时间
    pub fn covers(&self, export_time: DateTime<Utc>) -> bool {
        self.start_time <= export_time && export_time < self.end_time
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {}",
            self.start_time.format(EXPORT_TIME_LAYOUT),
            self.end_time.format(EXPORT_TIME_LAYOUT)
        )
    }
}
