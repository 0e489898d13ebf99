//! Property-based tests for alarm deduplication and alarm-code parsing.

use coldgate::report::{normalize_alarm_codes, AlarmSet};
use coldgate::state::{AlarmTracker, AlarmTransition, CommandMailbox};
use proptest::collection::{btree_set, vec};
use proptest::prelude::*;
use serde_json::Value;

fn alarm_set() -> impl Strategy<Value = AlarmSet> {
    btree_set(0i64..500, 0..6)
}

proptest! {
    /// Repeating a non-empty set never notifies twice in a row
    #[test]
    fn repeated_set_notifies_once(codes in btree_set(0i64..500, 1..6), n in 2..10usize) {
        let tracker = AlarmTracker::new();
        let notified = (0..n)
            .filter(|_| tracker.evaluate("U1", &codes).should_notify())
            .count();
        prop_assert_eq!(notified, 1);
    }

    /// Notifications equal the number of changes to a new non-empty set
    #[test]
    fn notifications_match_model(sets in vec(alarm_set(), 1..30)) {
        let tracker = AlarmTracker::new();
        let mut prior: Option<AlarmSet> = None;
        let mut expected = 0;
        let mut actual = 0;

        for set in &sets {
            if !set.is_empty() && prior.as_ref() != Some(set) {
                expected += 1;
            }
            prior = if set.is_empty() { None } else { Some(set.clone()) };

            if tracker.evaluate("U1", set).should_notify() {
                actual += 1;
            }
            prop_assert_eq!(tracker.current("U1"), prior.clone());
        }
        prop_assert_eq!(actual, expected);
    }

    /// Devices do not share alarm state
    #[test]
    fn devices_independent(a in btree_set(0i64..500, 1..6), b in btree_set(0i64..500, 1..6)) {
        let tracker = AlarmTracker::new();
        prop_assert_eq!(tracker.evaluate("U1", &a), AlarmTransition::Raised);
        prop_assert_eq!(tracker.evaluate("U2", &b), AlarmTransition::Raised);
        prop_assert_eq!(tracker.current("U1"), Some(a));
    }

    /// String and list forms of the same codes normalise identically
    #[test]
    fn string_and_list_forms_agree(codes in vec(0i64..100_000, 0..10)) {
        let joined = codes.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
        let as_string = normalize_alarm_codes(&Value::String(joined));
        let as_list = normalize_alarm_codes(&Value::from(codes.clone()));
        prop_assert_eq!(&as_string, &as_list);
        prop_assert_eq!(as_list, codes.into_iter().collect::<AlarmSet>());
    }

    /// Non-numeric tokens never produce codes
    #[test]
    fn junk_tokens_dropped(junk in vec("[a-z ]{1,6}", 0..5)) {
        let joined = junk.join(",");
        prop_assert!(normalize_alarm_codes(&Value::String(joined)).is_empty());
    }

    /// The mailbox always hands out the most recently queued command, once
    #[test]
    fn mailbox_last_write_wins(commands in vec("[A-Z]{3,10}", 1..8)) {
        let mailbox = CommandMailbox::new();
        for c in &commands {
            mailbox.queue("U1", c.as_str());
        }
        prop_assert_eq!(mailbox.take_if_present("U1"), commands.last().cloned());
        prop_assert_eq!(mailbox.take_if_present("U1"), None);
    }
}
