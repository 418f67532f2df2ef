//! 不一致时间段的去重与合并

use super::MismatchedSegment;

/// 去掉时间段完全相同的重复项, 保留第一次出现的
pub fn deduplicate(segments: Vec<MismatchedSegment>) -> Vec<MismatchedSegment> {
    let mut unique: Vec<MismatchedSegment> = Vec::with_capacity(segments.len());
    for segment in segments {
        if !unique.iter().any(|seen| seen.segment == segment.segment) {
            unique.push(segment);
        }
    }
    unique
}

/// 按起点稳定排序后一次遍历, 首尾相接的时间段合并为一个并累加各副本的行数
pub fn aggregate(mut segments: Vec<MismatchedSegment>) -> Vec<MismatchedSegment> {
    segments.sort_by_key(|s| s.segment.start_time);

    let mut merged: Vec<MismatchedSegment> = Vec::with_capacity(segments.len());
    for next in segments {
        match merged.last_mut() {
            Some(last) if last.segment.is_contiguous_with(&next.segment) => {
                last.segment.end_time = next.segment.end_time;
                for (copy, count) in next.counts {
                    *last.counts.entry(copy).or_insert(0) += count;
                }
            }
            _ => merged.push(next),
        }
    }
    merged
}
