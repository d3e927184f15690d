use log::debug;

use crate::{estimate::SharedVblankEstimate, timing::Tick};

/// Number of timepoints kept in the circular buffer. Power of two, at least 4.
/// More points shrink the phase error (~1/size) but lengthen each update.
const MAX_SIZE: u32 = 32;

/// Estimates vblank phase and period from one timestamp per observed vblank.
///
/// Each sample is the time a blocking wait-for-vblank call woke up, which is
/// always at or after the true vblank, never before. Plotting samples as
/// (frame number, timestamp), the true vblank times lie on a line and every
/// sample sits on or above it. The best-fit line passes through two samples
/// ("pivots") that are adjacent on the lower convex hull, one on each side of
/// the average frame number, so the estimator maintains that hull
/// incrementally and reads the period off the pivot segment as an exact
/// integer ratio.
///
/// Frame numbers are guesses: each new sample's frame is predicted from the
/// current period. When the guesses stop being trustworthy (a huge gap, too
/// many skipped vblanks, residuals blowing up) the estimator restarts from the
/// newest sample alone and relocks over the next few vblanks.
pub struct PivotHullEstimator {
    /// Wake-up timestamps, circular
    timepoints: [Tick; MAX_SIZE as usize],

    /// Guessed frame number for each timepoint
    frames: [u32; MAX_SIZE as usize],

    /// Whether the timepoint skipped at least one vblank since its predecessor
    multiframe: [bool; MAX_SIZE as usize],

    /// For each element, the hull point before it. Characterized by the
    /// invariant that the line through (prev_hull[i], i) has every earlier
    /// element on or above it.
    prev_hull: [u32; MAX_SIZE as usize],

    /// For each hull point, the next hull point. Junk for elements off the
    /// hull: next_hull(prev_hull(x)) is valid, prev_hull(next_hull(x)) is not.
    next_hull: [u32; MAX_SIZE as usize],

    /// Elements live at [index_begin, index_end). Free-running indices
    index_begin: u32,
    index_end: u32,

    /// The right pivot. Lies at or after the midpoint frame; the left pivot is
    /// prev_hull(middle_pivot).
    middle_pivot: u32,

    /// Running sums over the live elements, used to locate the midpoint frame
    /// and to compute the mean residual without rescanning
    sum_of_frames: u32,
    sum_of_timepoints: u64,
    multiframe_count: u32,

    /// Period as an exact tick ratio between the pivots, kept unreduced so
    /// residual tests can use integer arithmetic with no rounding bias
    period_numerator: u64,
    period_denominator: u64,

    /// Where (phase, period) get published for the render thread
    shared: SharedVblankEstimate,
}

/// Whether free-running index `a` is before `b`
fn index_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Return (t0 - t_base) / (d0 - d_base) <= (t1 - t_base) / (d1 - d_base),
/// evaluated exactly via cross-multiplication
fn ratio_lteq(t0: Tick, t1: Tick, t_base: Tick, d0: u32, d1: u32, d_base: u32) -> bool {
    let n0 = t0.wrapping_sub(t_base) as i64;
    let n1 = t1.wrapping_sub(t_base) as i64;
    let f0 = d0.wrapping_sub(d_base) as i32 as i64;
    let f1 = d1.wrapping_sub(d_base) as i32 as i64;
    n0 * f1 - n1 * f0 <= 0
}

fn rounded_divide(n: u64, d: u64) -> u64 {
    (n + d / 2) / d
}

impl PivotHullEstimator {
    pub fn new(shared: SharedVblankEstimate) -> Self {
        Self {
            timepoints: [0; MAX_SIZE as usize],
            frames: [0; MAX_SIZE as usize],
            multiframe: [false; MAX_SIZE as usize],
            prev_hull: [0; MAX_SIZE as usize],
            next_hull: [0; MAX_SIZE as usize],
            index_begin: 0,
            index_end: 0,
            middle_pivot: 0,
            sum_of_frames: 0,
            sum_of_timepoints: 0,
            multiframe_count: 0,
            period_numerator: 0,
            period_denominator: 1,
            shared,
        }
    }

    pub fn elements(&self) -> u32 {
        self.index_end.wrapping_sub(self.index_begin)
    }

    /// Period between the current pivots as an exact (numerator, denominator)
    /// tick ratio. Stale until at least two samples have been fed.
    pub fn period_ratio(&self) -> (u64, u64) {
        (self.period_numerator, self.period_denominator)
    }

    fn slot(x: u32) -> usize {
        (x % MAX_SIZE) as usize
    }

    fn timepoint_at(&self, x: u32) -> Tick {
        self.timepoints[Self::slot(x)]
    }

    fn frame_at(&self, x: u32) -> u32 {
        self.frames[Self::slot(x)]
    }

    fn multiframe_at(&self, x: u32) -> bool {
        self.multiframe[Self::slot(x)]
    }

    fn hull_prev(&self, x: u32) -> u32 {
        self.prev_hull[Self::slot(x)]
    }

    fn hull_next(&self, x: u32) -> u32 {
        self.next_hull[Self::slot(x)]
    }

    /// Drop everything except a single fresh timepoint. Recovery mechanism for
    /// every timing anomaly: most samples are good, so good data arrives again
    /// within a few vblanks and relocks the estimate.
    pub fn restart(&mut self, new_timepoint: Tick) {
        self.index_begin = self.index_end.wrapping_sub(1);
        self.timepoints[Self::slot(self.index_begin)] = new_timepoint;
        self.frames[Self::slot(self.index_begin)] = 0;
        self.sum_of_frames = 0;
        self.sum_of_timepoints = new_timepoint;
        self.multiframe_count = 0;
        debug!("restarting vblank estimator");
    }

    /// Feed the wake-up time of one vblank wait. Timestamps must be strictly
    /// increasing; two waits can never report the same vblank.
    pub fn feed(&mut self, new_timepoint: Tick) {
        let previous_element = self.index_end.wrapping_sub(1);
        if self.elements() >= 1 {
            // Degenerate input the wait API cannot produce
            assert!(
                new_timepoint != self.timepoint_at(previous_element),
                "duplicate vblank timestamp"
            );
        }

        // Too few elements to estimate the new sample's frame; append blindly
        if self.elements() <= 1 {
            let frame = self.frame_at(previous_element).wrapping_add(1);
            self.timepoints[Self::slot(self.index_end)] = new_timepoint;
            self.frames[Self::slot(self.index_end)] = frame;
            self.multiframe[Self::slot(self.index_end)] = false;
            self.sum_of_timepoints = self.sum_of_timepoints.wrapping_add(new_timepoint);
            self.sum_of_frames = self.sum_of_frames.wrapping_add(frame);
            self.index_end = self.index_end.wrapping_add(1);

            if self.elements() == 2 {
                self.middle_pivot = self.index_begin.wrapping_add(1);
                self.prev_hull[Self::slot(self.index_begin.wrapping_add(1))] = self.index_begin;
                self.prev_hull[Self::slot(self.index_begin)] = self.index_begin.wrapping_sub(1);
                self.set_period_phase();
            }
            // With one point the phase is junk; don't publish anything
            return;
        }

        // Estimate the frame of the new timepoint by rounding against the
        // pivot line: (new - pivot_time + period/elements) / period. A frame
        // captures roughly [-1/n, (n-1)/n) around its vblank, matching the
        // 1/n phase error of the estimate itself.
        let elements = self.elements() as u64;
        let diff = new_timepoint.wrapping_sub(self.timepoint_at(self.middle_pivot));
        let this_frame = ((self
            .period_denominator
            .wrapping_mul(elements)
            .wrapping_mul(diff)
            .wrapping_add(self.period_numerator))
            / (self.period_numerator * elements)) as u32;
        let mut this_frame = this_frame.wrapping_add(self.frame_at(self.middle_pivot));

        let mut is_multiframe = false;
        let frame_gap = this_frame.wrapping_sub(self.frame_at(previous_element)) as i32;
        if frame_gap <= 0 {
            // Two timepoints cannot share a vblank. Trust the period over a
            // single bad prediction and push the frame forward.
            debug!(
                "zero-frame vblank sample, gap {} ticks",
                new_timepoint.wrapping_sub(self.timepoint_at(previous_element))
            );
            this_frame = self.frame_at(previous_element).wrapping_add(1);
        } else if frame_gap >= ((self.elements() + 2) / 2) as i32 {
            // So many skipped vblanks that the frame guess is no longer
            // trustworthy. Typically alt-tab or a system sleep.
            debug!(
                "long multi-frame vblank gap of {} frames at {} elements",
                frame_gap,
                self.elements()
            );
            self.restart(new_timepoint);
            return;
        } else if frame_gap >= 2 {
            is_multiframe = true;
        }

        // Insert, evicting the oldest element first when full so we never hold
        // max_size + 1 elements at once
        self.sum_of_frames = self.sum_of_frames.wrapping_add(this_frame);
        self.sum_of_timepoints = self.sum_of_timepoints.wrapping_add(new_timepoint);
        self.multiframe_count += is_multiframe as u32;
        if self.elements() == MAX_SIZE {
            self.sum_of_frames = self
                .sum_of_frames
                .wrapping_sub(self.frame_at(self.index_begin));
            self.sum_of_timepoints = self
                .sum_of_timepoints
                .wrapping_sub(self.timepoint_at(self.index_begin));
            self.multiframe_count -= self.multiframe_at(self.index_begin) as u32;
            self.index_begin = self.index_begin.wrapping_add(1);
        }
        self.timepoints[Self::slot(self.index_end)] = new_timepoint;
        self.frames[Self::slot(self.index_end)] = this_frame;
        self.multiframe[Self::slot(self.index_end)] = is_multiframe;
        let this_index = self.index_end;
        self.index_end = self.index_end.wrapping_add(1);

        if is_multiframe {
            // A third of the samples skipping frames means the reported period
            // may really be a multiple like 1.5x, a case the residual check
            // cannot catch (0, 1.5, 3 has zero residual)
            if self.multiframe_count * 3 >= self.elements() - 1 {
                debug!(
                    "multi-frame fraction too high ({} of {})",
                    self.multiframe_count,
                    self.elements()
                );
                self.restart(new_timepoint);
                return;
            }
        }

        self.find_hull_line_backwards_from(this_index);
        if index_before(self.hull_prev(this_index), self.middle_pivot) {
            self.middle_pivot = this_index;
        } else {
            let prev = self.hull_prev(this_index);
            self.next_hull[Self::slot(prev)] = this_index;
        }

        // The pivot's hull predecessor may have fallen off the back while
        // extending the hull; and if the oldest element expired, the pivot
        // segment may no longer straddle the midpoint. Walk left until it does.
        loop {
            if index_before(self.hull_prev(self.middle_pivot), self.index_begin) {
                self.find_hull_line_backwards_from(self.middle_pivot);
            }
            let previous_pivot = self.hull_prev(self.middle_pivot);
            let midpoint_or_later = !index_before(
                self.frame_at(previous_pivot)
                    .wrapping_mul(self.elements()),
                self.sum_of_frames,
            );
            if midpoint_or_later {
                self.next_hull[Self::slot(previous_pivot)] = self.middle_pivot;
                self.middle_pivot = previous_pivot;
            } else {
                break;
            }
        }

        self.set_period_phase();

        // Mean |residual| from the pivot line must stay under period/4, or the
        // frame guesses (and thus the whole fit) are suspect. The two pivots
        // have artificially zero residual, hence elements - 2.
        // All in exact integer arithmetic: error * denominator vs threshold.
        let elements = self.elements();
        let baseline_excess = self
            .sum_of_timepoints
            .wrapping_sub(self.timepoint_at(self.middle_pivot).wrapping_mul(elements as u64));
        let frame_excess = self
            .sum_of_frames
            .wrapping_sub(self.frame_at(self.middle_pivot).wrapping_mul(elements))
            as i32 as i64 as u64;
        let error_times_denominator = self
            .period_denominator
            .wrapping_mul(baseline_excess)
            .wrapping_sub(frame_excess.wrapping_mul(self.period_numerator));

        if error_times_denominator >= (elements as u64 - 2) * self.period_numerator / 4 {
            debug!(
                "excess vblank residual at {} elements, period ratio {}/{}",
                elements, self.period_numerator, self.period_denominator
            );
            self.restart(new_timepoint);
        }
    }

    /// Set prev_hull(position) by walking hull points backwards. Each pair of
    /// consecutive hull points gives a candidate line; once a line sits below
    /// `position`, every earlier line does too, and the search stops.
    fn find_hull_line_backwards_from(&mut self, position: u32) {
        self.prev_hull[Self::slot(position)] = position.wrapping_sub(1);
        let mut hull_iterator = position.wrapping_sub(1);
        loop {
            // If the hull predecessor fell off the back end, recompute it so
            // the line can be tested
            if index_before(self.hull_prev(hull_iterator), self.index_begin) {
                if hull_iterator == self.index_begin {
                    self.prev_hull[Self::slot(position)] = self.index_begin;
                    return;
                }
                self.find_hull_line_backwards_from(hull_iterator);
            }

            let hull_point_before = self.hull_prev(hull_iterator);

            // True when the implied period between position and the point
            // before is at most the hull segment's period, i.e. position lies
            // below the line. <= rather than <: with equally spaced
            // timepoints, <= makes every element point at its immediate
            // predecessor and the walk bails out after one step.
            let point_below_line = ratio_lteq(
                self.timepoint_at(position),
                self.timepoint_at(hull_iterator),
                self.timepoint_at(hull_point_before),
                self.frame_at(position),
                self.frame_at(hull_iterator),
                self.frame_at(hull_point_before),
            );
            if point_below_line {
                self.prev_hull[Self::slot(position)] = hull_point_before;
                hull_iterator = hull_point_before;
            } else {
                return;
            }
        }
    }

    /// Recompute the exact period ratio between the pivots, first moving the
    /// right pivot forward until its frame reaches the midpoint
    fn find_period_ratio(&mut self) {
        let elements = self.elements();
        let mut pivot_frame_multiple = self.frame_at(self.middle_pivot).wrapping_mul(elements);

        while index_before(pivot_frame_multiple, self.sum_of_frames) {
            self.middle_pivot = self.hull_next(self.middle_pivot);
            pivot_frame_multiple = self.frame_at(self.middle_pivot).wrapping_mul(elements);
        }

        if pivot_frame_multiple == self.sum_of_frames {
            // The pivot sits exactly on the midpoint, so the line could aim at
            // either neighbor. Average the two segments:
            // t0/f0 + t1/f1 = (t0*f1 + t1*f0) / (f0*f1), halved.
            let pivot_before = self.hull_prev(self.middle_pivot);
            let pivot_after = self.hull_next(self.middle_pivot);
            let t0 = self
                .timepoint_at(self.middle_pivot)
                .wrapping_sub(self.timepoint_at(pivot_before));
            let t1 = self
                .timepoint_at(pivot_after)
                .wrapping_sub(self.timepoint_at(self.middle_pivot));
            let f0 = self
                .frame_at(self.middle_pivot)
                .wrapping_sub(self.frame_at(pivot_before)) as u64;
            let f1 = self
                .frame_at(pivot_after)
                .wrapping_sub(self.frame_at(self.middle_pivot)) as u64;
            self.period_numerator = t0 * f1 + t1 * f0;
            self.period_denominator = f0 * f1 * 2;
        } else {
            let pivot_before = self.hull_prev(self.middle_pivot);
            self.period_numerator = self
                .timepoint_at(self.middle_pivot)
                .wrapping_sub(self.timepoint_at(pivot_before));
            self.period_denominator = self
                .frame_at(self.middle_pivot)
                .wrapping_sub(self.frame_at(pivot_before)) as u64;
        }
        debug_assert!(self.period_denominator != 0);
    }

    /// Publish (phase, period) for the render thread. The phase is positioned
    /// one frame after the latest sample, which minimizes the rounding error
    /// of extrapolation and keeps the prediction stable when phase and period
    /// are read at slightly different times.
    fn set_period_phase(&mut self) {
        self.find_period_ratio();

        let frames_ahead = self
            .frame_at(self.index_end.wrapping_sub(1))
            .wrapping_sub(self.frame_at(self.middle_pivot))
            .wrapping_add(1) as u64;
        let phase = self.timepoint_at(self.middle_pivot).wrapping_add(rounded_divide(
            frames_ahead * self.period_numerator,
            self.period_denominator,
        ));
        let period = self.period_numerator as f64 / self.period_denominator as f64;

        self.shared.publish(phase, period);
    }
}
