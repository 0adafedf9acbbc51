use chrono::{Datelike, NaiveDate, NaiveTime};

use crate::model::Minutes;
use crate::policy::{minute_of_day, BusinessHoursPolicy, TimeRange};

/// One bookable time-of-day produced by the policy for a date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub time: NaiveTime,
    /// Configured durations that fit inside the source range without touching lunch.
    pub durations: Vec<Minutes>,
}

/// Ranges that apply to `date`, in priority order:
/// holiday → nothing; exception → its ranges instead of the defaults; otherwise the
/// weekday/weekend defaults for the day name.
pub fn ranges_for(date: NaiveDate, policy: &BusinessHoursPolicy) -> &[TimeRange] {
    if policy.holidays.contains(&date) {
        return &[];
    }
    if let Some(ranges) = policy.exceptions.get(&date) {
        return ranges;
    }
    policy.default_ranges(date.weekday())
}

/// Generate the ordered candidate slots for `date`.
///
/// Pure: depends only on its inputs, so calling it twice yields identical output.
/// Overlapping ranges are merged first so no time-of-day is emitted twice.
pub fn generate_slots(date: NaiveDate, policy: &BusinessHoursPolicy) -> Vec<Candidate> {
    let mut ranges: Vec<TimeRange> = ranges_for(date, policy).to_vec();
    if ranges.is_empty() {
        return Vec::new();
    }
    ranges.sort_by_key(|r| r.start);
    let ranges = merge_overlapping(&ranges);

    let step = policy.interval_minutes;
    let lunch = policy
        .lunch_break
        .map(|l| (minute_of_day(l.start), minute_of_day(l.end)));
    let hits_lunch = |start: Minutes, end: Minutes| {
        lunch.is_some_and(|(ls, le)| start < le && ls < end)
    };

    let mut out = Vec::new();
    for range in &ranges {
        let range_end = minute_of_day(range.end);
        let mut m = minute_of_day(range.start);
        while m + step <= range_end {
            if !hits_lunch(m, m + step) {
                let durations: Vec<Minutes> = policy
                    .durations
                    .iter()
                    .copied()
                    .filter(|&d| m + d <= range_end && !hits_lunch(m, m + d))
                    .collect();
                if !durations.is_empty()
                    && let Some(time) = NaiveTime::from_hms_opt(m / 60, m % 60, 0)
                {
                    out.push(Candidate { time, durations });
                }
            }
            m += step;
        }
    }
    out
}

/// Just the times of [`generate_slots`].
pub fn slot_times(date: NaiveDate, policy: &BusinessHoursPolicy) -> Vec<NaiveTime> {
    generate_slots(date, policy).into_iter().map(|c| c.time).collect()
}

/// Merge sorted overlapping ranges. Adjacent ranges stay separate so each keeps its own grid.
fn merge_overlapping(sorted: &[TimeRange]) -> Vec<TimeRange> {
    let mut merged: Vec<TimeRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start < last.end
        {
            last.end = last.end.max(range.end);
            continue;
        }
        merged.push(range);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn r(s: &str) -> TimeRange {
        TimeRange::parse(s).unwrap()
    }

    /// Weekday 09:00–12:00 and 13:00–17:00, lunch 12:00–13:00, 30-minute grid.
    fn scenario_policy() -> BusinessHoursPolicy {
        let mut p = BusinessHoursPolicy::default();
        p.weekday.clear();
        p.weekend.clear();
        p.with_days(
            &[Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            &[r("09:00-12:00"), r("13:00-17:00")],
        )
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    #[test]
    fn monday_yields_fourteen_slots() {
        let times: Vec<String> = slot_times(monday(), &scenario_policy())
            .iter()
            .map(|t| t.format("%H:%M").to_string())
            .collect();
        assert_eq!(
            times,
            vec![
                "09:00", "09:30", "10:00", "10:30", "11:00", "11:30", "13:00", "13:30", "14:00",
                "14:30", "15:00", "15:30", "16:00", "16:30",
            ]
        );
    }

    #[test]
    fn generation_is_idempotent() {
        let p = scenario_policy();
        for offset in 0..14 {
            let date = monday() + chrono::Days::new(offset);
            assert_eq!(generate_slots(date, &p), generate_slots(date, &p));
        }
    }

    #[test]
    fn nothing_inside_lunch() {
        // A single range straddling lunch; nothing may start inside 12:00–13:00.
        let mut p = scenario_policy().with_days(&[Weekday::Mon], &[r("08:00-18:00")]);
        p.lunch_break = Some(r("12:15-13:15"));
        let lunch = p.lunch_break.unwrap();
        let times = slot_times(monday(), &p);
        assert!(!times.is_empty());
        for time in &times {
            assert!(!lunch.contains_time(*time), "{time} inside lunch");
        }
        // 12:00 would run into lunch at 12:15; 13:00 would start inside it.
        assert!(!times.contains(&t(12, 0)));
        assert!(!times.contains(&t(13, 0)));
        assert!(times.contains(&t(11, 30)));
        assert!(times.contains(&t(13, 30)));
    }

    #[test]
    fn holiday_is_closed() {
        let mut p = scenario_policy();
        p.holidays.insert(monday());
        // Holidays beat exceptions too.
        p.exceptions.insert(monday(), vec![r("09:00-10:00")]);
        assert!(generate_slots(monday(), &p).is_empty());
    }

    #[test]
    fn closed_weekend_day_is_empty() {
        let p = scenario_policy();
        let sunday = NaiveDate::from_ymd_opt(2026, 10, 25).unwrap();
        let saturday = NaiveDate::from_ymd_opt(2026, 10, 24).unwrap();
        assert!(generate_slots(sunday, &p).is_empty());
        assert!(generate_slots(saturday, &p).is_empty());
    }

    #[test]
    fn weekend_ranges_apply_on_weekend() {
        let p = scenario_policy().with_days(&[Weekday::Sat], &[r("10:00-11:00")]);
        let saturday = NaiveDate::from_ymd_opt(2026, 10, 24).unwrap();
        assert_eq!(slot_times(saturday, &p), vec![t(10, 0), t(10, 30)]);
    }

    #[test]
    fn exception_overrides_not_merges() {
        let mut p = scenario_policy();
        p.exceptions.insert(monday(), vec![r("15:00-16:00")]);
        assert_eq!(slot_times(monday(), &p), vec![t(15, 0), t(15, 30)]);

        // Empty override closes the day.
        p.exceptions.insert(monday(), vec![]);
        assert!(generate_slots(monday(), &p).is_empty());

        // Other days untouched.
        let tuesday = monday() + chrono::Days::new(1);
        assert_eq!(slot_times(tuesday, &p).len(), 14);
    }

    #[test]
    fn exception_can_open_a_closed_day() {
        let mut p = scenario_policy();
        let sunday = NaiveDate::from_ymd_opt(2026, 10, 25).unwrap();
        p.exceptions.insert(sunday, vec![r("11:00-12:00")]);
        assert_eq!(slot_times(sunday, &p), vec![t(11, 0), t(11, 30)]);
    }

    #[test]
    fn durations_stop_at_range_end_and_lunch() {
        let p = scenario_policy();
        let slots = generate_slots(monday(), &p);
        let at = |h, m| slots.iter().find(|c| c.time == t(h, m)).unwrap().durations.clone();
        assert_eq!(at(9, 0), vec![30, 60]);
        assert_eq!(at(11, 30), vec![30]);
        assert_eq!(at(16, 0), vec![30, 60]);
        assert_eq!(at(16, 30), vec![30]);
    }

    #[test]
    fn slot_must_fit_inside_range() {
        let p = scenario_policy().with_days(&[Weekday::Mon], &[r("09:00-09:45")]);
        assert_eq!(slot_times(monday(), &p), vec![t(9, 0)]);
    }

    #[test]
    fn overlapping_ranges_do_not_duplicate() {
        let p = scenario_policy().with_days(&[Weekday::Mon], &[r("10:00-11:00"), r("09:00-10:30")]);
        assert_eq!(
            slot_times(monday(), &p),
            vec![t(9, 0), t(9, 30), t(10, 0), t(10, 30)]
        );
    }

    #[test]
    fn adjacent_ranges_keep_their_grid() {
        let p = scenario_policy().with_days(&[Weekday::Mon], &[r("09:00-09:45"), r("09:45-10:45")]);
        assert_eq!(slot_times(monday(), &p), vec![t(9, 0), t(9, 45), t(10, 15)]);
    }

    #[test]
    fn no_lunch_break_configured() {
        let mut p = scenario_policy().with_days(&[Weekday::Mon], &[r("11:00-14:00")]);
        p.lunch_break = None;
        assert_eq!(slot_times(monday(), &p).len(), 6);
    }
}
