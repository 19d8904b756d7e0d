//! Sortable timestamps for table sort keys.
//!
//! Format `YYYYMMDD.HHMMSS.NNNNNNNNN`, always UTC. Lexicographic order of the
//! text equals chronological order.

use chrono::{DateTime, NaiveDateTime, Utc};

pub const SORTABLE_TIME_FORMAT: &str = "%Y%m%d.%H%M%S.%f";

pub fn to_sortable(t: &DateTime<Utc>) -> String {
    t.format(SORTABLE_TIME_FORMAT).to_string()
}

pub fn from_sortable(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, SORTABLE_TIME_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn formats_with_nanoseconds() {
        let t = Utc.with_ymd_and_hms(2016, 8, 19, 17, 22, 32).unwrap()
            + chrono::Duration::nanoseconds(7_001);
        assert_eq!(to_sortable(&t), "20160819.172232.000007001");
    }

    #[test]
    fn parses_stored_timestamp() {
        let t = from_sortable("20160819.172232.000000000").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2016, 8, 19, 17, 22, 32).unwrap());
        assert!(from_sortable("yesterday").is_none());
    }

    proptest! {
        #[test]
        fn text_order_matches_time_order(a in 0i64..4_000_000_000, b in 0i64..4_000_000_000, na in 0u32..1_000_000_000, nb in 0u32..1_000_000_000) {
            let ta = DateTime::from_timestamp(a, na).unwrap();
            let tb = DateTime::from_timestamp(b, nb).unwrap();
            prop_assert_eq!(ta.cmp(&tb), to_sortable(&ta).cmp(&to_sortable(&tb)));
            prop_assert_eq!(from_sortable(&to_sortable(&ta)), Some(ta));
        }
    }
}
