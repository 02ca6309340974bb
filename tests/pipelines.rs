use std::sync::{Arc, Mutex};
use std::task::Poll;
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use jetflow::aggregate::{counting, summing, to_list, with_create};
use jetflow::connectors::{buffered, collect, from_fn, list};
use jetflow::errors::{ConfigurationError, Error, ExecutionError};
use jetflow::window::limiting_lag;
use jetflow::{ExecutionConfig, JoinClause, Pipeline, WindowDefinition};

fn config() -> ExecutionConfig {
    ExecutionConfig::default()
        .with_worker_threads(2)
        .with_default_parallelism(2)
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs)
}

#[test]
fn grouped_sum_by_parity() {
    let p = Pipeline::create();
    let (sink, results) = collect();
    p.read_from(list(0i64..=4))
        .grouping_key(|x: &i64| x % 2)
        .aggregate(summing(|x: &i64| *x))
        .unwrap()
        .drain_to(sink);
    p.run(&config()).unwrap();

    let mut sums = results.take();
    sums.sort();
    assert_eq!(sums, vec![(0, 6), (1, 4)]);
}

#[derive(Debug, Clone, PartialEq)]
struct Person {
    id: u32,
    name: String,
}

#[derive(Debug, Clone, PartialEq)]
struct Score {
    id: u32,
    val: i64,
}

#[test]
fn hash_join_enriches_primary() {
    let p = Pipeline::create();
    let people = p.read_from(list(vec![Person {
        id: 1,
        name: "a".to_string(),
    }]));
    let scores = p.read_from(list(vec![Score { id: 1, val: 10 }]));
    let (sink, results) = collect();
    people
        .hash_join(
            &scores,
            JoinClause::on_keys(|p: &Person| p.id, |s: &Score| s.id).projecting(|s: Score| s.val),
            |person: Person, val: Option<i64>| (person.name, val),
        )
        .unwrap()
        .drain_to(sink);
    p.run(&config()).unwrap();

    assert_eq!(results.take(), vec![("a".to_string(), Some(10))]);
}

#[test]
fn hash_join_without_match_yields_none() {
    let p = Pipeline::create();
    let people = p.read_from(list(vec![
        Person {
            id: 1,
            name: "a".to_string(),
        },
        Person {
            id: 2,
            name: "b".to_string(),
        },
    ]));
    let scores = p.read_from(list(vec![Score { id: 2, val: 5 }]));
    let (sink, results) = collect();
    people
        .hash_join(
            &scores,
            JoinClause::on_keys(|p: &Person| p.id, |s: &Score| s.id),
            |person: Person, score: Option<Score>| (person.name, score.map(|s| s.val)),
        )
        .unwrap()
        .drain_to(sink);
    p.run(&config()).unwrap();

    let mut joined = results.take();
    joined.sort();
    assert_eq!(
        joined,
        vec![("a".to_string(), None), ("b".to_string(), Some(5))]
    );
}

#[test]
fn two_way_hash_join() {
    let p = Pipeline::create();
    let people = p.read_from(list(vec![Person {
        id: 7,
        name: "x".to_string(),
    }]));
    let scores = p.read_from(list(vec![Score { id: 7, val: 3 }]));
    let nicknames = p.read_from(list(vec![(7u32, "seven".to_string())]));
    let (sink, results) = collect();
    people
        .hash_join2(
            &scores,
            JoinClause::on_keys(|p: &Person| p.id, |s: &Score| s.id).projecting(|s: Score| s.val),
            &nicknames,
            JoinClause::on_keys(|p: &Person| p.id, |n: &(u32, String)| n.0)
                .projecting(|n: (u32, String)| n.1),
            |person: Person, val: Option<i64>, nick: Option<String>| (person.name, val, nick),
        )
        .unwrap()
        .drain_to(sink);
    p.run(&config()).unwrap();

    assert_eq!(
        results.take(),
        vec![("x".to_string(), Some(3), Some("seven".to_string()))]
    );
}

#[test]
fn global_aggregation_ignores_batching_and_parallelism() {
    for (parallelism, batch) in [(1, 1), (3, 1), (3, 7), (4, 64)] {
        let p = Pipeline::create();
        let numbers = p.read_from(list(0i64..100));
        let (sum_sink, sums) = collect();
        let (count_sink, counts) = collect();
        numbers
            .aggregate(summing(|x: &i64| *x))
            .unwrap()
            .drain_to(sum_sink);
        numbers.aggregate(counting()).unwrap().drain_to(count_sink);
        let config = config()
            .with_default_parallelism(parallelism)
            .with_inbox_batch_size(batch)
            .with_queue_capacity(4)
            .with_outbox_capacity(2);
        p.run(&config).unwrap();

        assert_eq!(sums.take(), vec![4950], "parallelism {parallelism}, batch {batch}");
        assert_eq!(counts.take(), vec![100]);
    }
}

#[test]
fn global_aggregation_with_explicit_parallelism() {
    let p = Pipeline::create();
    let (sink, sums) = collect();
    p.read_from(list(0i64..100))
        .set_local_parallelism(4)
        .map(|x| x)
        .set_local_parallelism(3)
        .aggregate(summing(|x: &i64| *x))
        .unwrap()
        .set_local_parallelism(1)
        .drain_to(sink);
    p.run(&config().with_default_parallelism(3)).unwrap();

    assert_eq!(sums.take(), vec![4950]);
}

#[test]
fn global_aggregation_refuses_several_instances() {
    let p = Pipeline::create();
    let (sink, sums) = collect();
    p.read_from(list(0i64..100))
        .aggregate(summing(|x: &i64| *x))
        .unwrap()
        .set_local_parallelism(3)
        .drain_to(sink);
    assert!(matches!(
        p.run(&config()),
        Err(Error::Configuration(ConfigurationError::SingleInstance { requested: 3, .. }))
    ));
    assert!(sums.is_empty());
}

#[test]
fn global_aggregation_of_two_stages() {
    for parallelism in [1, 3] {
        let p = Pipeline::create();
        let numbers = p.read_from(list(0i64..50)).set_local_parallelism(2);
        let words = p
            .read_from(list(vec!["a".to_string(), "bb".to_string(), "ccc".to_string()]))
            .set_local_parallelism(3);
        let op = with_create(|| (0i64, 0usize))
            .and_accumulate0(|acc: &mut (i64, usize), x: i64| acc.0 += x)
            .and_accumulate1(|acc: &mut (i64, usize), w: String| acc.1 += w.len())
            .and_finish(|acc| acc);
        let (sink, results) = collect();
        numbers.aggregate2(&words, op).unwrap().drain_to(sink);
        p.run(&config().with_default_parallelism(parallelism).with_inbox_batch_size(3))
            .unwrap();

        assert_eq!(results.take(), vec![(1225, 6)], "parallelism {parallelism}");
    }
}

#[test]
fn co_group_of_two_stages() {
    let p = Pipeline::create();
    let left = p
        .read_from(list(vec![
            ("a".to_string(), 1i64),
            ("b".to_string(), 2),
            ("a".to_string(), 3),
        ]))
        .grouping_key(|x: &(String, i64)| x.0.clone());
    let right = p
        .read_from(list(vec![("a".to_string(), 10i64)]))
        .grouping_key(|x: &(String, i64)| x.0.clone());
    let op = with_create(|| (0i64, 0i64))
        .and_accumulate0(|acc: &mut (i64, i64), x: (String, i64)| acc.0 += x.1)
        .and_accumulate1(|acc: &mut (i64, i64), x: (String, i64)| acc.1 += x.1)
        .and_finish(|acc| acc);
    let (sink, results) = collect();
    left.aggregate2(&right, op).unwrap().drain_to(sink);
    p.run(&config()).unwrap();

    let mut grouped = results.take();
    grouped.sort();
    assert_eq!(
        grouped,
        vec![("a".to_string(), (4, 10)), ("b".to_string(), (2, 0))]
    );
}

#[test]
fn co_group_builder_with_three_inputs() {
    let p = Pipeline::create();
    let clicks = p
        .read_from(list(vec![1u32, 1, 2]))
        .grouping_key(|user: &u32| *user);
    let views = p
        .read_from(list(vec![(1u32, "home".to_string())]))
        .grouping_key(|view: &(u32, String)| view.0);
    let buys = p
        .read_from(list(vec![(2u32, 9.5f64)]))
        .grouping_key(|buy: &(u32, f64)| buy.0);

    let mut builder = clicks.aggregate_builder();
    let clicks_tag = builder.tag0();
    let views_tag = builder.add(&views);
    let buys_tag = builder.add(&buys);
    let op = with_create(|| (0usize, Vec::new(), 0.0f64))
        .and_accumulate(clicks_tag, |acc: &mut (usize, Vec<String>, f64), _: u32| {
            acc.0 += 1
        })
        .and_accumulate(
            views_tag,
            |acc: &mut (usize, Vec<String>, f64), view: (u32, String)| acc.1.push(view.1),
        )
        .and_accumulate(
            buys_tag,
            |acc: &mut (usize, Vec<String>, f64), buy: (u32, f64)| acc.2 += buy.1,
        )
        .and_finish(|acc| acc);
    let (sink, results) = collect();
    builder.build(op).unwrap().drain_to(sink);
    p.run(&config()).unwrap();

    let mut rows = results.take();
    rows.sort_by_key(|row| row.0);
    assert_eq!(
        rows,
        vec![
            (1, (2, vec!["home".to_string()], 0.0)),
            (2, (1, vec![], 9.5)),
        ]
    );
}

#[test]
fn tumbling_window_counts_per_key() {
    let p = Pipeline::create();
    let events = vec![
        ("a".to_string(), 1i64),
        ("a".to_string(), 5),
        ("b".to_string(), 7),
        ("a".to_string(), 12),
        ("b".to_string(), 15),
        ("a".to_string(), 25),
    ];
    let (sink, results) = collect();
    p.read_from(list(events))
        .set_local_parallelism(1)
        .timestamp(
            |e: &(String, i64)| at(e.1),
            limiting_lag(Duration::zero()),
        )
        .set_local_parallelism(1)
        .grouping_key(|e: &(String, i64)| e.0.clone())
        .window(WindowDefinition::tumbling(Duration::seconds(10)))
        .aggregate(counting())
        .unwrap()
        .drain_to(sink);
    p.run(&config()).unwrap();

    let mut windows: Vec<_> = results
        .take()
        .into_iter()
        .map(|w| (w.key, w.start, w.end, w.result))
        .collect();
    windows.sort();
    assert_eq!(
        windows,
        vec![
            ("a".to_string(), at(0), at(10), 2),
            ("a".to_string(), at(10), at(20), 1),
            ("a".to_string(), at(20), at(30), 1),
            ("b".to_string(), at(0), at(10), 1),
            ("b".to_string(), at(10), at(20), 1),
        ]
    );
}

#[test]
fn sliding_window_over_whole_stream() {
    let p = Pipeline::create();
    let (sink, results) = collect();
    p.read_from(list(vec![1i64, 6, 11]))
        .timestamp(|x: &i64| at(*x), limiting_lag(Duration::seconds(100)))
        .window(WindowDefinition::sliding(
            Duration::seconds(10),
            Duration::seconds(5),
        ))
        .aggregate(to_list())
        .unwrap()
        .drain_to(sink);
    p.run(&config()).unwrap();

    let mut windows: Vec<_> = results
        .take()
        .into_iter()
        .map(|w| {
            let mut items = w.result;
            items.sort();
            (w.start, items)
        })
        .collect();
    windows.sort();
    assert_eq!(
        windows,
        vec![
            (at(-5), vec![1]),
            (at(0), vec![1, 6]),
            (at(5), vec![6, 11]),
            (at(10), vec![11]),
        ]
    );
}

#[test]
fn peek_and_filter_pass_records_through() {
    let p = Pipeline::create();
    let (sink, results) = collect();
    p.read_from(list(0u32..10))
        .peek(|x| x % 5 == 0, |x| format!("saw {x}"))
        .filter(|x| x % 2 == 1)
        .flat_map(|x| vec![x; 2])
        .drain_to(sink);
    p.run(&config()).unwrap();

    let mut out = results.take();
    out.sort();
    assert_eq!(out, vec![1, 1, 3, 3, 5, 5, 7, 7, 9, 9]);
}

#[test]
fn one_sink_for_several_stages() {
    let p = Pipeline::create();
    let evens = p.read_from(list(vec![0u32, 2]));
    let odds = p.read_from(list(vec![1u32, 3])).map(|x| x * 10);
    let (sink, results) = collect();
    p.drain_all(sink, &[&evens, &odds]);
    p.run(&config()).unwrap();

    let mut out = results.take();
    out.sort();
    assert_eq!(out, vec![0, 2, 10, 30]);
}

#[test]
fn buffered_sink_is_flushed_and_disposed_per_instance() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let disposed = log.clone();
        buffered(
            "buffer",
            |_instance| Vec::new(),
            |buf: &mut Vec<u32>, x: u32| buf.push(x),
            |_buf: &mut Vec<u32>| {},
            move |buf: Vec<u32>| disposed.lock().unwrap().extend(buf),
        )
    };
    let p = Pipeline::create();
    p.read_from(list(0u32..20)).drain_to(sink);
    p.run(&config()).unwrap();

    let mut seen = log.lock().unwrap().clone();
    seen.sort();
    assert_eq!(seen, (0..20).collect::<Vec<_>>());
}

#[test]
fn user_error_fails_the_job() {
    let p = Pipeline::create();
    let (sink, _) = collect();
    p.read_from(list(0i64..10))
        .try_map(|x: i64| if x == 3 { Err("bad record 3") } else { Ok(x) })
        .drain_to(sink);
    match p.run(&config()) {
        Err(Error::Execution(ExecutionError::ProcessorFailed {
            vertex, message, ..
        })) => {
            assert_eq!(vertex, "map");
            assert!(message.contains("bad record 3"), "{message}");
            assert!(message.contains("pipelines.rs"), "{message}");
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn panic_in_user_function_fails_the_job() {
    let p = Pipeline::create();
    let (sink, _) = collect::<u32>();
    p.read_from(list(0u32..10))
        .map(|x| {
            if x == 5 {
                panic!("five is right out");
            }
            x
        })
        .drain_to(sink);
    match p.run(&config()) {
        Err(Error::Execution(ExecutionError::ProcessorFailed { message, .. })) => {
            assert!(message.contains("five is right out"), "{message}");
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn cancel_stops_an_endless_job() {
    let p = Pipeline::create();
    let endless = from_fn("endless", |_instance, _parallelism| {
        let mut n = 0u64;
        move || {
            n += 1;
            Poll::Ready(Some(n))
        }
    });
    let (sink, _) = collect::<u64>();
    p.read_from(endless).filter(|n| n % 1000 == 0).drain_to(sink);
    let job = p.submit(&config()).unwrap();
    thread::sleep(StdDuration::from_millis(50));
    assert!(!job.is_finished());
    job.cancel();
    assert!(matches!(
        job.join(),
        Err(Error::Execution(ExecutionError::Cancelled))
    ));
}

#[test]
fn invalid_pipeline_never_runs() {
    let p = Pipeline::create();
    let (sink, results) = collect::<u32>();
    p.read_from(list(vec![1u32]))
        .set_local_parallelism(0)
        .drain_to(sink);
    assert!(matches!(p.run(&config()), Err(Error::Configuration(_))));
    assert!(results.is_empty());
}
