//! Frame-skipping policy that maps the native rate onto the target rate.

/// Keep every `interval`-th frame where `interval = max(1, floor(in / out))`.
/// An unknown or non-positive native rate keeps every frame.
pub fn sampling_interval(native_fps: Option<f64>, target_fps: u32) -> u64 {
    let Some(native) = native_fps.filter(|fps| fps.is_finite() && *fps > 0.0) else {
        return 1;
    };
    if target_fps == 0 {
        return 1;
    }
    let ratio = (native / f64::from(target_fps)).floor();
    if ratio < 1.0 {
        1
    } else {
        ratio as u64
    }
}

/// Running index plus the stride decision. The target is passed in on every
/// call, so a rate change applies from the next frame on.
#[derive(Debug)]
pub struct Sampler {
    native_fps: Option<f64>,
    index: u64,
    last_interval: u64,
}

impl Sampler {
    pub fn new(native_fps: Option<f64>) -> Self {
        Self {
            native_fps,
            index: 0,
            last_interval: 1,
        }
    }

    /// Decide for the next source frame. Advances the index whether or not
    /// the frame is kept.
    pub fn admit(&mut self, target_fps: u32) -> bool {
        let interval = sampling_interval(self.native_fps, target_fps);
        if interval != self.last_interval {
            log::debug!(
                "sampling interval {} -> {} (target {} fps)",
                self.last_interval,
                interval,
                target_fps
            );
            self.last_interval = interval;
        }
        let keep = self.index % interval == 0;
        self.index += 1;
        keep
    }

    /// Frames seen so far.
    pub fn position(&self) -> u64 {
        self.index
    }

    pub fn interval(&self) -> u64 {
        self.last_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_from_rates() {
        assert_eq!(sampling_interval(Some(60.0), 30), 2);
        assert_eq!(sampling_interval(Some(30.0), 30), 1);
        assert_eq!(sampling_interval(Some(29.97), 10), 2);
        assert_eq!(sampling_interval(Some(24.0), 30), 1);
        assert_eq!(sampling_interval(Some(60.0), 7), 8);
    }

    #[test]
    fn unknown_or_zero_native_rate_keeps_everything() {
        assert_eq!(sampling_interval(None, 30), 1);
        assert_eq!(sampling_interval(Some(0.0), 30), 1);
        assert_eq!(sampling_interval(Some(f64::NAN), 30), 1);
    }

    #[test]
    fn sixty_to_thirty_keeps_even_indices() {
        let mut sampler = Sampler::new(Some(60.0));
        let kept: Vec<u64> = (0..10u64).filter(|_| sampler.admit(30)).collect();
        assert_eq!(kept, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn rate_change_applies_to_next_decision() {
        let mut sampler = Sampler::new(Some(60.0));
        let mut kept = Vec::new();
        for index in 0..6u64 {
            if sampler.admit(30) {
                kept.push(index);
            }
        }
        // interval becomes floor(60 / 10) = 6 from index 6 on
        for index in 6..20u64 {
            if sampler.admit(10) {
                kept.push(index);
            }
        }
        assert_eq!(kept, vec![0, 2, 4, 6, 12, 18]);
        assert_eq!(sampler.interval(), 6);
        assert_eq!(sampler.position(), 20);
    }

    #[test]
    fn never_admits_more_than_ceil_rate_per_second() {
        for (native, target) in [(60.0, 30), (25.0, 7), (50.0, 3), (30.0, 60)] {
            let mut sampler = Sampler::new(Some(native));
            let per_second = (0..native as u64).filter(|_| sampler.admit(target)).count() as f64;
            let interval = sampling_interval(Some(native), target) as f64;
            assert!(per_second <= (native / interval).ceil());
        }
    }
}
