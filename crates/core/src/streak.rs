//! Day-streak math over distinct activity dates.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};

use crate::time::CalendarZone;

/// Collect the distinct calendar days on which any of `instants` fall.
pub fn activity_days(
    instants: impl IntoIterator<Item = DateTime<Utc>>,
    zone: CalendarZone,
) -> BTreeSet<NaiveDate> {
    instants.into_iter().map(|at| zone.date_of(at)).collect()
}

/// Length of the run of consecutive active days ending today or yesterday.
///
/// A streak survives a day without activity only if that day is today.
#[must_use]
pub fn current_streak(days: &BTreeSet<NaiveDate>, today: NaiveDate) -> u32 {
    let start = if days.contains(&today) {
        today
    } else {
        match today.pred_opt() {
            Some(yesterday) if days.contains(&yesterday) => yesterday,
            _ => return 0,
        }
    };

    let mut streak = 0;
    let mut cursor = Some(start);
    while let Some(day) = cursor.filter(|d| days.contains(d)) {
        streak += 1;
        cursor = day.pred_opt();
    }
    streak
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn jan_1_to_3() -> BTreeSet<NaiveDate> {
        [date(1), date(2), date(3)].into_iter().collect()
    }

    #[test]
    fn streak_ending_today() {
        assert_eq!(current_streak(&jan_1_to_3(), date(3)), 3);
    }

    #[test]
    fn streak_ending_yesterday_still_counts() {
        assert_eq!(current_streak(&jan_1_to_3(), date(4)), 3);
    }

    #[test]
    fn streak_broken_after_two_idle_days() {
        assert_eq!(current_streak(&jan_1_to_3(), date(5)), 0);
    }

    #[test]
    fn gap_stops_the_count() {
        let days: BTreeSet<_> = [date(1), date(3), date(4)].into_iter().collect();
        assert_eq!(current_streak(&days, date(4)), 2);
    }

    #[test]
    fn empty_history_has_no_streak() {
        assert_eq!(current_streak(&BTreeSet::new(), date(4)), 0);
    }

    #[test]
    fn activity_days_dedupes_same_day() {
        let zone = CalendarZone::utc();
        let morning = date(2).and_hms_opt(8, 0, 0).unwrap().and_utc();
        let evening = date(2).and_hms_opt(20, 0, 0).unwrap().and_utc();
        let days = activity_days([morning, evening], zone);
        assert_eq!(days.len(), 1);
        assert!(days.contains(&date(2)));
    }
}
