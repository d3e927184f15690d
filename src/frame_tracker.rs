use crate::timing::{TICKS_PER_SEC, Tick};

pub struct FrameTracker {
    /// Tick at the start of tracking, seconds are relative to this
    base_time: Tick,

    /// The current second being tracked
    current_second: u64,

    /// The presented-frame count for the current second being tracked
    current_second_frame_count: u32,

    /// The frame rate to report. This is the rate recorded in the last
    /// completed second.
    current_frame_rate: u32,

    /// Frames whose swap was issued before their scheduled appearance instant
    on_target_frames: u64,

    /// Frames that swapped after the tearline had already passed
    missed_frames: u64,

    /// Total lateness of missed frames, for an average-miss report
    missed_ticks_total: u64,
}

impl FrameTracker {
    pub fn new(base_time: Tick) -> Self {
        Self {
            base_time,
            current_second: 0,
            current_second_frame_count: 0,
            current_frame_rate: 0,
            on_target_frames: 0,
            missed_frames: 0,
            missed_ticks_total: 0,
        }
    }

    pub fn frame_complete(&mut self, now: Tick) {
        let second = now.wrapping_sub(self.base_time) / TICKS_PER_SEC;

        if second == self.current_second {
            self.current_second_frame_count += 1;
        } else {
            // Flush the previous second's count
            self.current_frame_rate = self.current_second_frame_count;

            // Start tracking in the new second
            self.current_second = second;
            self.current_second_frame_count = 1;
        }
    }

    /// Record how a scheduled swap went: on target if it was issued before the
    /// frame's appearance instant.
    pub fn record_swap(&mut self, swapped_at: Tick, appearance: Tick) {
        if (swapped_at.wrapping_sub(appearance) as i64) <= 0 {
            self.on_target_frames += 1;
        } else {
            self.missed_frames += 1;
            self.missed_ticks_total += swapped_at.wrapping_sub(appearance);
        }
    }

    pub fn total_on_target_percent(&self) -> f64 {
        let total_frames = self.on_target_frames + self.missed_frames;
        if total_frames == 0 {
            return 100.0;
        }
        (self.on_target_frames as f64 / total_frames as f64) * 100.0
    }

    /// Average lateness of missed frames in microseconds
    pub fn average_miss_us(&self) -> f64 {
        if self.missed_frames == 0 {
            return 0.0;
        }
        self.missed_ticks_total as f64 / self.missed_frames as f64 / 1_000.0
    }

    pub fn current_frame_rate(&self) -> u32 {
        self.current_frame_rate
    }
}
