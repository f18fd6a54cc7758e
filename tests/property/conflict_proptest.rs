//! Property-based tests for conflict transitions

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

use offline_sync::shared::timestamp::{record_updated_at, to_canonical};
use offline_sync::sync::conflict_resolver::{merge_fields, resolve, transition};
use offline_sync::sync::{ConflictState, ConflictStrategy};

fn strategy() -> impl Strategy<Value = ConflictStrategy> {
    prop_oneof![
        Just(ConflictStrategy::LastWriteWins),
        Just(ConflictStrategy::RemoteWins),
        Just(ConflictStrategy::LocalWins),
        Just(ConflictStrategy::Manual),
    ]
}

fn timestamp(offset_secs: i64) -> String {
    let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    to_canonical(&(base + Duration::seconds(offset_secs)))
}

proptest! {
    #[test]
    fn test_detected_always_leaves_to_a_terminal_state(
        local in -10_000i64..10_000,
        remote in -10_000i64..10_000,
        strategy in strategy(),
    ) {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let state = transition(
            Some(base + Duration::seconds(local)),
            Some(base + Duration::seconds(remote)),
            strategy,
        );
        prop_assert_ne!(state, ConflictState::Detected);

        if strategy == ConflictStrategy::LastWriteWins {
            let expected = match local.cmp(&remote) {
                std::cmp::Ordering::Less => ConflictState::RemoteWins,
                std::cmp::Ordering::Equal => ConflictState::Merged,
                std::cmp::Ordering::Greater => ConflictState::LocalWins,
            };
            prop_assert_eq!(state, expected);
        }
    }

    #[test]
    fn test_unparseable_timestamps_fall_back_to_remote(
        garbage in "[a-z ]{0,12}",
        strategy in strategy(),
    ) {
        let local = json!({"id": "1", "updated_at": garbage});
        let remote = json!({"id": "1", "updated_at": timestamp(0), "name": "remote"});
        let resolution = resolve("contacts", "1", &local, &remote, &[], strategy);
        prop_assert_eq!(resolution.state, ConflictState::RemoteWins);
        prop_assert_eq!(resolution.data, Some(remote));
    }

    #[test]
    fn test_applied_data_never_moves_backwards(
        local in -10_000i64..10_000,
        remote in -10_000i64..10_000,
        strategy in strategy(),
    ) {
        let local_doc = json!({"id": "1", "name": "local", "updated_at": timestamp(local)});
        let remote_doc = json!({"id": "1", "name": "remote", "updated_at": timestamp(remote)});
        let resolution = resolve("contacts", "1", &local_doc, &remote_doc, &[], strategy);

        match resolution.data {
            Some(data) => {
                prop_assert!(resolution.state.applies_remote());
                prop_assert!(record_updated_at(&data) >= record_updated_at(&local_doc));
            }
            None => prop_assert!(!resolution.state.applies_remote()),
        }
        prop_assert_eq!(
            resolution.skew,
            Some(Duration::seconds((remote - local).abs()))
        );
    }

    #[test]
    fn test_merge_keeps_local_user_fields(
        local_note in "[a-z]{1,8}",
        remote_note in "[a-z]{1,8}",
        remote_name in "[a-z]{1,8}",
    ) {
        let user_fields = vec!["notes".to_string()];
        let local = json!({"id": "1", "name": "local", "notes": local_note.clone()});
        let remote = json!({"id": "1", "name": remote_name.clone(), "notes": remote_note, "phone": "+1"});
        let merged = merge_fields(&local, &remote, &user_fields);

        prop_assert_eq!(&merged["notes"], &json!(local_note));
        prop_assert_eq!(&merged["name"], &json!(remote_name));
        prop_assert_eq!(&merged["phone"], &json!("+1"));
    }
}
