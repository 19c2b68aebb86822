use std::time::Instant;

/// Monotonic time source for the whole pipeline. Every timestamp in the
/// system is microseconds since this clock's origin.
///
/// Cloning shares the origin, so timestamps from clones are comparable.
#[derive(Debug, Clone)]
pub struct MidiClock {
    origin: Instant,
}

impl Default for MidiClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MidiClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Microseconds since the clock origin.
    pub fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Converts between file ticks and microseconds under the active tempo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickConverter {
    ticks_per_quarter: u16,
    us_per_quarter: u32,
}

impl TickConverter {
    pub fn new(ticks_per_quarter: u16, us_per_quarter: u32) -> Self {
        Self {
            ticks_per_quarter: ticks_per_quarter.max(1),
            us_per_quarter,
        }
    }

    pub fn us_per_quarter(&self) -> u32 {
        self.us_per_quarter
    }

    pub fn set_us_per_quarter(&mut self, us_per_quarter: u32) {
        self.us_per_quarter = us_per_quarter;
    }

    pub fn ticks_to_us(&self, ticks: u64) -> u64 {
        // 128-bit intermediate: a long file at a slow tempo overflows u64.
        ((ticks as u128 * self.us_per_quarter as u128) / self.ticks_per_quarter as u128) as u64
    }

    pub fn us_to_ticks(&self, us: u64) -> u64 {
        if self.us_per_quarter == 0 {
            return 0;
        }
        ((us as u128 * self.ticks_per_quarter as u128) / self.us_per_quarter as u128) as u64
    }
}

/// A (wall time, tick) pair the player re-establishes on every tempo change,
/// resume, and seek. Event times are always computed relative to the latest
/// anchor so tempo changes never accumulate rounding drift.
#[derive(Debug, Clone, Copy)]
pub struct Anchor {
    pub wall_us: u64,
    pub tick: u64,
}

impl Anchor {
    pub fn new(wall_us: u64, tick: u64) -> Self {
        Self { wall_us, tick }
    }

    /// Wall-clock time at which `tick` is due, under `conv` and the given
    /// tempo scale (1.0 = file tempo, 2.0 = double speed).
    pub fn event_time_us(&self, conv: &TickConverter, tick: u64, tempo_scale: f64) -> u64 {
        let delta_ticks = tick.saturating_sub(self.tick);
        let delta_us = conv.ticks_to_us(delta_ticks) as f64 / tempo_scale;
        self.wall_us + delta_us as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_conversion_round_numbers() {
        // 480 ticks per quarter at 500_000 us per quarter (120 BPM).
        let conv = TickConverter::new(480, 500_000);
        assert_eq!(conv.ticks_to_us(480), 500_000);
        assert_eq!(conv.ticks_to_us(240), 250_000);
        assert_eq!(conv.us_to_ticks(500_000), 480);
    }

    #[test]
    fn tick_conversion_no_overflow() {
        let conv = TickConverter::new(960, 16_777_215);
        // Several hours of ticks must not overflow.
        let ticks = 960u64 * 4 * 60 * 60 * 10;
        let us = conv.ticks_to_us(ticks);
        assert_eq!(conv.us_to_ticks(us), ticks);
    }

    #[test]
    fn anchor_event_time_respects_scale() {
        let conv = TickConverter::new(480, 500_000);
        let anchor = Anchor::new(1_000_000, 0);
        assert_eq!(anchor.event_time_us(&conv, 480, 1.0), 1_500_000);
        // Double speed halves the delta.
        assert_eq!(anchor.event_time_us(&conv, 480, 2.0), 1_250_000);
        // Ticks behind the anchor clamp to the anchor time.
        assert_eq!(anchor.event_time_us(&conv, 0, 1.0), 1_000_000);
    }
}
