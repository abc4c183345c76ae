//! Property-based tests for the donation status state machine and the
//! path-addressed document tree.
//!
//! The transition rules decide who may write a donation next, so bugs here
//! corrupt custody for the whole lifecycle. These properties hold for any
//! input, which catches edge cases manual case selection misses.

use giving_chain::document::{Document, Value, set_data};
use giving_chain::trackable::TrackableStatus;
use proptest::prelude::*;

const ALL_STATUSES: [TrackableStatus; 5] = [
    TrackableStatus::Created,
    TrackableStatus::Published,
    TrackableStatus::Accepted,
    TrackableStatus::PickedUp,
    TrackableStatus::Delivered,
];

fn status_strategy() -> impl Strategy<Value = TrackableStatus> {
    prop_oneof![
        Just(TrackableStatus::Created),
        Just(TrackableStatus::Published),
        Just(TrackableStatus::Accepted),
        Just(TrackableStatus::PickedUp),
        Just(TrackableStatus::Delivered),
    ]
}

/// Slash-safe path segments, one to four levels deep.
fn path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z][a-z0-9]{0,7}", 1..=4).prop_map(|segments| segments.join("/"))
}

fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        "[ -~]{0,16}".prop_map(Value::Text),
    ]
}

proptest! {
    /// An allowed transition always moves strictly forward in the order.
    #[test]
    fn advancing_is_strictly_monotonic(a in status_strategy(), b in status_strategy()) {
        if a.can_advance_to(b) {
            prop_assert!(a < b, "{:?} -> {:?} must move forward", a, b);
        }
        if a >= b {
            prop_assert!(!a.can_advance_to(b), "{:?} -> {:?} must be rejected", a, b);
        }
    }

    /// Every status except the terminal one has exactly one legal successor.
    #[test]
    fn exactly_one_successor_except_terminal(a in status_strategy()) {
        let successors = ALL_STATUSES
            .iter()
            .filter(|b| a.can_advance_to(**b))
            .count();
        if a == TrackableStatus::Delivered {
            prop_assert_eq!(successors, 0);
        } else {
            prop_assert_eq!(successors, 1);
        }
    }

    /// Any walk that only takes allowed transitions never revisits or
    /// rewinds a status, regardless of how the candidate steps arrive.
    #[test]
    fn random_walks_never_rewind(candidates in prop::collection::vec(status_strategy(), 0..12)) {
        let mut current = TrackableStatus::Created;
        let mut seen = vec![current];
        for candidate in candidates {
            if current.can_advance_to(candidate) {
                current = candidate;
                prop_assert!(!seen.contains(&current));
                prop_assert!(*seen.last().unwrap() < current);
                seen.push(current);
            }
        }
    }

    /// Status text round-trips; arbitrary other strings are rejected.
    #[test]
    fn parse_rejects_unknown_text(s in "[A-Za-z]{0,12}") {
        match TrackableStatus::parse(&s) {
            Ok(status) => prop_assert_eq!(status.as_str(), s),
            Err(_) => prop_assert!(ALL_STATUSES.iter().all(|k| k.as_str() != s)),
        }
    }

    /// Writing a path into the tree makes exactly that value resolvable.
    #[test]
    fn set_then_resolve_round_trips(path in path_strategy(), value in scalar_strategy()) {
        let mut doc = Document::new_empty("did:gc:prop", "gcaddr1prop");
        doc.apply(&[set_data(path.clone(), value.clone())]).unwrap();
        prop_assert_eq!(doc.resolve_data(&path), Some(&value));
    }

    /// The tip is a pure function of history: equal histories agree,
    /// and every accepted batch moves the tip.
    #[test]
    fn tip_is_deterministic_and_always_advances(
        paths in prop::collection::vec(path_strategy(), 1..6)
    ) {
        let mut a = Document::new_empty("did:gc:prop", "gcaddr1prop");
        let mut b = Document::new_empty("did:gc:prop", "gcaddr1prop");
        let mut previous_tips = vec![a.tip.clone()];

        for path in &paths {
            let batch = [set_data(path.clone(), Value::Bool(false))];
            a.apply(&batch).unwrap();
            b.apply(&batch).unwrap();
            prop_assert_eq!(&a.tip, &b.tip);
            prop_assert!(!previous_tips.contains(&a.tip));
            previous_tips.push(a.tip.clone());
        }
    }
}
