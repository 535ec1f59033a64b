use crate::models::{Flag, Flags};

/// Flags are stored as one comma-joined, upper-cased token list.
pub fn flags_to_column(flags: &Flags) -> String {
    flags
        .iter()
        .map(|f| f.token().to_ascii_uppercase())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn flags_from_column(column: Option<&str>) -> Flags {
    column
        .unwrap_or("")
        .split(',')
        .filter(|t| !t.trim().is_empty())
        .filter_map(|t| t.parse::<Flag>().ok())
        .collect()
}

/// Change in (unread, flagged) for setting `flag` to `value` on a message whose
/// flags are currently `before`.
///
/// A message contributes to the counters only while it is live (neither
/// DELETED nor X_DESTROYED). Setting one of those removes its contribution,
/// clearing the last of them restores it. SEEN/FLAGGED only move the counters
/// on a real transition of a live message.
pub(super) fn counter_delta(before: &Flags, flag: &Flag, value: bool) -> (i64, i64) {
    let seen = before.contains(&Flag::Seen);
    let flagged = before.contains(&Flag::Flagged);
    let contribution = (i64::from(!seen), i64::from(flagged));

    let mut after = before.clone();
    after.set(flag.clone(), value);

    match (before.is_live(), after.is_live()) {
        (true, false) => (-contribution.0, -contribution.1),
        (false, true) => contribution,
        (false, false) => (0, 0),
        (true, true) => match flag {
            Flag::Seen if value != seen => (if value { -1 } else { 1 }, 0),
            Flag::Flagged if value != flagged => (0, if value { 1 } else { -1 }),
            _ => (0, 0),
        },
    }
}

/// Contribution of a message with these flags to its folder's counters.
pub(super) fn contribution(flags: &Flags) -> (i64, i64) {
    if !flags.is_live() {
        return (0, 0);
    }
    (
        i64::from(!flags.contains(&Flag::Seen)),
        i64::from(flags.contains(&Flag::Flagged)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(list: &[Flag]) -> Flags {
        list.iter().cloned().collect()
    }

    #[test]
    fn column_round_trip_keeps_custom_tokens() {
        let f = flags(&[Flag::Seen, Flag::Custom("$LABEL1".into())]);
        let col = flags_to_column(&f);
        assert!(col.contains("SEEN"));
        assert!(col.contains("$LABEL1"));
        assert_eq!(flags_from_column(Some(&col)), f);
        assert!(flags_from_column(None).is_empty());
        assert!(flags_from_column(Some("")).is_empty());
    }

    #[test]
    fn seen_transition_moves_unread_once() {
        let unread = Flags::new();
        assert_eq!(counter_delta(&unread, &Flag::Seen, true), (-1, 0));
        let read = flags(&[Flag::Seen]);
        assert_eq!(counter_delta(&read, &Flag::Seen, true), (0, 0));
        assert_eq!(counter_delta(&read, &Flag::Seen, false), (1, 0));
    }

    #[test]
    fn flagged_transition_is_guarded() {
        let plain = Flags::new();
        assert_eq!(counter_delta(&plain, &Flag::Flagged, true), (0, 1));
        assert_eq!(counter_delta(&plain, &Flag::Flagged, false), (0, 0));
        let starred = flags(&[Flag::Flagged]);
        assert_eq!(counter_delta(&starred, &Flag::Flagged, false), (0, -1));
    }

    #[test]
    fn tombstoning_removes_and_restores_contribution() {
        let unread_starred = flags(&[Flag::Flagged]);
        assert_eq!(counter_delta(&unread_starred, &Flag::Deleted, true), (-1, -1));
        let deleted = flags(&[Flag::Flagged, Flag::Deleted]);
        assert_eq!(counter_delta(&deleted, &Flag::Deleted, false), (1, 1));
        // already out of the counts
        assert_eq!(counter_delta(&deleted, &Flag::Deleted, true), (0, 0));
        assert_eq!(counter_delta(&deleted, &Flag::XDestroyed, true), (0, 0));
        assert_eq!(counter_delta(&deleted, &Flag::Seen, true), (0, 0));
    }

    #[test]
    fn destroy_of_read_message_changes_nothing() {
        let read = flags(&[Flag::Seen]);
        assert_eq!(counter_delta(&read, &Flag::XDestroyed, true), (0, 0));
    }

    #[test]
    fn contribution_ignores_tombstones() {
        assert_eq!(contribution(&Flags::new()), (1, 0));
        assert_eq!(contribution(&flags(&[Flag::Deleted])), (0, 0));
        assert_eq!(contribution(&flags(&[Flag::Seen, Flag::Flagged])), (0, 1));
    }
}
