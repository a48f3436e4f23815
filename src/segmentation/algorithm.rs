use crate::frames::Frame;
use crate::segmentation::config::SegmentationConfig;

/// A run of consecutive frames that will become one video segment.
///
/// All frames in a group share one resolution, and no two neighbors are
/// separated by more than the configured gap.
#[derive(Debug, Clone)]
pub struct FrameGroup {
    pub frames: Vec<Frame>,
    pub width: u32,
    pub height: u32,
    pub start_ts: f64,
    pub end_ts: f64,
}

impl FrameGroup {
    fn start(frame: Frame) -> Self {
        FrameGroup {
            width: frame.width,
            height: frame.height,
            start_ts: frame.ts,
            end_ts: frame.ts,
            frames: vec![frame],
        }
    }

    fn extend(&mut self, frame: Frame) {
        self.end_ts = frame.ts;
        self.frames.push(frame);
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

/// Splits one day of timestamp-ordered frames into segment-sized groups.
///
/// A new group starts when the resolution changes, when the pause since the
/// previous frame exceeds `max_gap_seconds`, or when the current group is
/// full. A timestamp that moves backwards is treated like a gap, so a clock
/// step never stretches a segment across it.
pub fn group_frames(frames: Vec<Frame>, config: &SegmentationConfig) -> Vec<FrameGroup> {
    if frames.is_empty() {
        return Vec::new();
    }

    let mut groups = Vec::new();
    let mut current_group: Option<FrameGroup> = None;

    for frame in frames {
        match &mut current_group {
            Some(group) if !must_break(group, &frame, config) => {
                group.extend(frame);
            }
            _ => {
                if let Some(group) = current_group.take() {
                    groups.push(group);
                }
                current_group = Some(FrameGroup::start(frame));
            }
        }
    }

    // Push final group
    if let Some(group) = current_group {
        groups.push(group);
    }

    groups
}

fn must_break(group: &FrameGroup, frame: &Frame, config: &SegmentationConfig) -> bool {
    if group.frames.len() >= config.max_frames_per_segment {
        return true;
    }
    if frame.width != group.width || frame.height != group.height {
        return true;
    }

    let delta = frame.ts - group.end_ts;
    delta < 0.0 || delta > config.max_gap_seconds
}
