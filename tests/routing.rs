use std::collections::HashSet;

use jetflow::item::Item;
use jetflow::routing::{key_fn, ProcessingStrategy, Route, Router};

fn route_all(router: &mut Router, items: &[Item]) -> Vec<Route> {
    items.iter().map(|item| router.route(item).unwrap()).collect()
}

#[test]
fn round_robin_cycles_from_first_instance() {
    let mut router = Router::with_strategy("rr", ProcessingStrategy::RoundRobin, 3, None).unwrap();
    let items: Vec<_> = (0u32..9).map(Item::new).collect();
    let targets: Vec<_> = route_all(&mut router, &items)
        .into_iter()
        .map(|route| match route {
            Route::One(i) => i,
            Route::All => usize::MAX,
        })
        .collect();
    assert_eq!(targets, [0, 1, 2, 0, 1, 2, 0, 1, 2]);
}

#[test]
fn broadcast_reaches_every_instance() {
    let mut router = Router::with_strategy("all", ProcessingStrategy::Broadcast, 4, None).unwrap();
    let items: Vec<_> = (0u32..5).map(Item::new).collect();
    assert!(route_all(&mut router, &items)
        .into_iter()
        .all(|route| route == Route::All));
}

#[test]
fn partitioning_is_stable_per_key() {
    let by_name = key_fn(|pair: &(String, u32)| pair.0.clone());
    let mut first =
        Router::with_strategy("p", ProcessingStrategy::Partitioning, 5, Some(by_name.clone()))
            .unwrap();
    let mut second =
        Router::with_strategy("p", ProcessingStrategy::Partitioning, 5, Some(by_name)).unwrap();

    let names = ["ann", "bob", "cid", "dee", "eve", "fay", "gus"];
    let mut used = HashSet::new();
    for (n, name) in names.iter().enumerate() {
        let a = Item::new((name.to_string(), n as u32));
        let b = Item::new((name.to_string(), 100 + n as u32));
        let route = first.route(&a).unwrap();
        assert_eq!(route, first.route(&b).unwrap(), "same key, same instance");
        assert_eq!(route, second.route(&a).unwrap(), "every sender agrees");
        match route {
            Route::One(i) => {
                assert!(i < 5);
                used.insert(i);
            }
            Route::All => panic!("partitioned edge broadcast a record"),
        }
    }
    assert!(used.len() > 1, "keys should spread over instances");
}

#[test]
fn zero_instances_is_an_error() {
    assert!(Router::with_strategy("none", ProcessingStrategy::RoundRobin, 0, None).is_err());
}

#[test]
fn wrong_record_type_fails_to_route() {
    let mut router = Router::with_strategy(
        "typed",
        ProcessingStrategy::Partitioning,
        2,
        Some(key_fn(|x: &u64| *x)),
    )
    .unwrap();
    assert!(router.route(&Item::new("not a number".to_string())).is_err());
}
