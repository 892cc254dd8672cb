//! Property tests for wildcard matching.
//!
//! Two oracles: a direct recursive matcher checked against `Topic::matches`,
//! and the trie-backed directory checked against a linear scan of its
//! contents.

use proptest::prelude::*;

use postmq::message::QoS;
use postmq::topic::{Subscription, SubscriptionDirectory, Topic};

/// Straight-line restatement of the matching rules.
fn reference_matches(filter: &str, name: &str) -> bool {
    if name.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    fn go(filter: &[&str], name: &[&str]) -> bool {
        match (filter.split_first(), name.split_first()) {
            (None, None) => true,
            (Some((&"#", _)), _) => true,
            (None, Some(_)) => false,
            (Some(_), None) => false,
            (Some((level, filter_rest)), Some((name_level, name_rest))) => {
                (*level == "+" || level == name_level) && go(filter_rest, name_rest)
            }
        }
    }

    let filter: Vec<&str> = filter.split('/').collect();
    let name: Vec<&str> = name.split('/').collect();
    go(&filter, &name)
}

fn name_strategy() -> impl Strategy<Value = String> {
    proptest::collection::vec(
        prop_oneof![
            Just("a"),
            Just("b"),
            Just("room1"),
            Just("$SYS"),
            Just(""),
        ],
        1..5,
    )
    .prop_map(|segments| segments.join("/"))
    .prop_filter("valid name", |s| Topic::name(s).is_ok())
}

fn filter_strategy() -> impl Strategy<Value = String> {
    (
        proptest::collection::vec(
            prop_oneof![
                Just("a"),
                Just("b"),
                Just("room1"),
                Just("$SYS"),
                Just("+"),
                Just(""),
            ],
            1..5,
        ),
        proptest::bool::ANY,
    )
        .prop_map(|(mut segments, trailing_hash)| {
            if trailing_hash {
                segments.push("#");
            }
            segments.join("/")
        })
        .prop_filter("valid filter", |s| Topic::filter(s).is_ok())
}

proptest! {
    #[test]
    fn matches_agrees_with_reference(filter in filter_strategy(), name in name_strategy()) {
        let parsed_filter = Topic::filter(&filter).unwrap();
        let parsed_name = Topic::name(&name).unwrap();
        prop_assert_eq!(
            parsed_filter.matches(&parsed_name),
            reference_matches(&filter, &name),
            "filter={:?} name={:?}", filter, name
        );
    }

    #[test]
    fn directory_agrees_with_linear_scan(
        filters in proptest::collection::hash_set(filter_strategy(), 1..12),
        name in name_strategy(),
    ) {
        let directory = SubscriptionDirectory::new();
        for filter in &filters {
            // one client per filter so set comparison is by filter alone
            directory.add(Subscription::new(
                filter.as_str(),
                Topic::filter(filter).unwrap(),
                QoS::AtLeastOnce,
            ));
        }

        let parsed_name = Topic::name(&name).unwrap();
        let mut from_directory: Vec<String> = directory
            .matching(&parsed_name)
            .into_iter()
            .map(|s| s.filter.as_str().to_string())
            .collect();
        from_directory.sort();

        let mut from_scan: Vec<String> = filters
            .iter()
            .filter(|f| Topic::filter(f).unwrap().matches(&parsed_name))
            .cloned()
            .collect();
        from_scan.sort();

        prop_assert_eq!(from_directory, from_scan);
    }
}
