//! CPU-budget admission control.
//!
//! A worker only claims new work while average utilization sits under the
//! configured limit. The limit may vary by time of day — donate everything
//! at night, back off during working hours.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveTime;

/// Maximum CPU utilization (percent) a worker tolerates before claiming
/// work. A limit of 100 disables the gate entirely.
#[derive(Debug, Clone, PartialEq)]
pub enum CpuPolicy {
    Fixed(f64),
    /// Piecewise schedule of `(time-of-day, limit)` breakpoints. The active
    /// entry is the latest breakpoint at or before now; before the day's
    /// first breakpoint, the last one wraps around from the previous day.
    Schedule(Vec<SchedulePoint>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulePoint {
    pub at: NaiveTime,
    pub limit: f64,
}

impl Default for CpuPolicy {
    fn default() -> Self {
        CpuPolicy::Fixed(100.0)
    }
}

impl CpuPolicy {
    pub fn schedule(points: Vec<(NaiveTime, f64)>) -> Self {
        let mut points: Vec<SchedulePoint> = points
            .into_iter()
            .map(|(at, limit)| SchedulePoint { at, limit })
            .collect();
        points.sort_by_key(|p| p.at);
        CpuPolicy::Schedule(points)
    }

    /// Parse `"4:00=100,8:30=50,23:00=10"`.
    pub fn parse(spec: &str) -> Result<Self, String> {
        if let Ok(fixed) = spec.parse::<f64>() {
            return Ok(CpuPolicy::Fixed(fixed));
        }
        let mut points = Vec::new();
        for part in spec.split(',') {
            let (time, limit) = part
                .split_once('=')
                .ok_or_else(|| format!("expected HH:MM=percent, got {part:?}"))?;
            let at = NaiveTime::parse_from_str(time.trim(), "%H:%M")
                .map_err(|e| format!("bad time {time:?}: {e}"))?;
            let limit = limit
                .trim()
                .parse::<f64>()
                .map_err(|e| format!("bad percentage {limit:?}: {e}"))?;
            points.push((at, limit));
        }
        if points.is_empty() {
            return Err("empty cpu schedule".to_string());
        }
        Ok(CpuPolicy::schedule(points))
    }

    /// The limit in force at `t`, clamped to 0..=100.
    pub fn limit_at(&self, t: NaiveTime) -> f64 {
        let raw = match self {
            CpuPolicy::Fixed(limit) => *limit,
            CpuPolicy::Schedule(points) => {
                if points.is_empty() {
                    return 100.0;
                }
                points
                    .iter()
                    .rev()
                    .find(|p| p.at <= t)
                    // Past midnight, before the first breakpoint: the last
                    // entry of the schedule is still in force.
                    .unwrap_or_else(|| points.last().expect("schedule checked non-empty"))
                    .limit
            }
        };
        raw.clamp(0.0, 100.0)
    }

    /// Whether the gate is a no-op at `t`.
    pub fn disabled_at(&self, t: NaiveTime) -> bool {
        self.limit_at(t) >= 100.0
    }
}

/// Source of utilization readings. The production sampler averages over a
/// real window; tests inject scripted values.
#[async_trait]
pub trait CpuSampler: Send + Sync {
    /// Average CPU utilization (percent, 0..=100) over `window`.
    async fn utilization(&mut self, window: Duration) -> f64;
}

/// Samples `/proc/stat` twice across the window and derives busy time from
/// the counter deltas. Any read failure yields 0.0 — an unreadable meter
/// must not wedge the worker.
#[derive(Debug, Default)]
pub struct ProcStatSampler;

impl ProcStatSampler {
    fn read_counters() -> Option<(u64, u64)> {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        let line = stat.lines().next()?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|v| v.parse().ok())
            .collect();
        if fields.len() < 4 {
            return None;
        }
        let total: u64 = fields.iter().sum();
        // Field 3 is idle time.
        Some((total - fields[3], total))
    }
}

#[async_trait]
impl CpuSampler for ProcStatSampler {
    async fn utilization(&mut self, window: Duration) -> f64 {
        let Some((busy_a, total_a)) = Self::read_counters() else {
            return 0.0;
        };
        tokio::time::sleep(window).await;
        let Some((busy_b, total_b)) = Self::read_counters() else {
            return 0.0;
        };
        let total = total_b.saturating_sub(total_a);
        if total == 0 {
            return 0.0;
        }
        100.0 * busy_b.saturating_sub(busy_a) as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).expect("valid time")
    }

    #[test]
    fn fixed_policy_clamps() {
        assert_eq!(CpuPolicy::Fixed(250.0).limit_at(t(12, 0)), 100.0);
        assert_eq!(CpuPolicy::Fixed(-3.0).limit_at(t(12, 0)), 0.0);
        assert_eq!(CpuPolicy::Fixed(55.0).limit_at(t(12, 0)), 55.0);
    }

    #[test]
    fn schedule_picks_latest_breakpoint() {
        let policy = CpuPolicy::schedule(vec![
            (t(4, 0), 100.0),
            (t(8, 30), 50.0),
            (t(23, 0), 10.0),
        ]);
        assert_eq!(policy.limit_at(t(4, 0)), 100.0);
        assert_eq!(policy.limit_at(t(8, 29)), 100.0);
        assert_eq!(policy.limit_at(t(8, 30)), 50.0);
        assert_eq!(policy.limit_at(t(22, 59)), 50.0);
        assert_eq!(policy.limit_at(t(23, 30)), 10.0);
    }

    #[test]
    fn schedule_wraps_past_midnight() {
        let policy = CpuPolicy::schedule(vec![(t(4, 0), 100.0), (t(23, 0), 10.0)]);
        // 01:00 is after 23:00 of the previous day, before 04:00 of this
        // one: the 23:00 entry is still in force.
        assert_eq!(policy.limit_at(t(1, 0)), 10.0);
    }

    #[test]
    fn parse_fixed_and_schedule() {
        assert_eq!(CpuPolicy::parse("80").expect("fixed"), CpuPolicy::Fixed(80.0));
        let policy = CpuPolicy::parse("4:00=100,8:30=50").expect("schedule");
        assert_eq!(policy.limit_at(t(9, 0)), 50.0);
        assert!(CpuPolicy::parse("nonsense").is_err());
    }

    #[test]
    fn disabled_at_full_limit() {
        assert!(CpuPolicy::Fixed(100.0).disabled_at(t(12, 0)));
        assert!(!CpuPolicy::Fixed(99.0).disabled_at(t(12, 0)));
    }
}
