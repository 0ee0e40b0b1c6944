//! Integration tests for the transaction executor and record streams.

mod support;

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use cluster_client::{
    Bin, Cluster, ClusterConfig, Error, Policy, Request, ResultCode, ScanOptions, TaskPool, Value,
    execute_transaction, scan_nodes, spawn_stream,
};
use crossbeam_channel::bounded;

use support::{MockNode, N_PARTITIONS, NAMESPACE, wait_until};

fn single_node() -> Result<(MockNode, Cluster)> {
    let mock = MockNode::start("A", (0..N_PARTITIONS).collect())?;
    let cluster = Cluster::new(
        ClusterConfig::default()
            .with_host("127.0.0.1", mock.port())
            .with_tend_interval(Duration::from_millis(50)),
    )?;
    Ok((mock, cluster))
}

fn keyed(key: &str) -> Request {
    Request::new(NAMESPACE).with_set("demo").with_key(key)
}

#[test]
fn write_then_read_round_trips_through_the_node() -> Result<()> {
    let (mock, cluster) = single_node()?;
    let policy = Policy::default();

    let write = keyed("user:1").write(vec![Bin::new("name", "alice"), Bin::new("age", 42i64)]);
    let written = execute_transaction(&cluster, &write, &policy)?;
    assert_eq!(written.result_code, ResultCode::Ok);
    assert_eq!(written.generation, 7);
    assert_eq!(written.bin("age"), Some(&Value::Int(42)));

    let read = keyed("user:1").read(&["name"]);
    let record = execute_transaction(&cluster, &read, &policy)?;
    assert_eq!(record.bin("name"), Some(&Value::from("value-of-name")));
    assert_eq!(record.ttl, 0);
    assert_eq!(mock.requests(), 2);
    Ok(())
}

#[test]
fn connections_are_reused_between_transactions() -> Result<()> {
    let (mock, cluster) = single_node()?;
    let node = cluster.node_by_name("A").ok_or_else(|| anyhow!("A missing"))?;

    for i in 0..5 {
        let read = keyed(&format!("user:{i}")).read(&[]);
        execute_transaction(&cluster, &read, &Policy::default())?;
    }
    assert_eq!(mock.data_connections(), 1);
    assert_eq!(node.pool().opened(), 1);
    assert_eq!(node.pool().idle(false), 1);
    Ok(())
}

#[test]
fn retried_delete_that_finds_nothing_succeeds() -> Result<()> {
    let (mock, cluster) = single_node()?;
    // The first delete is read but never answered; the retry reports NotFound.
    mock.swallow_next(1, Duration::from_millis(1500));
    mock.set_result_code(ResultCode::NotFound.as_u8());

    let delete = keyed("user:9").delete();
    let outcome = execute_transaction(&cluster, &delete, &Policy::new(Duration::from_secs(2)))?;
    assert_eq!(outcome.result_code, ResultCode::Ok);
    assert_eq!(mock.requests(), 2);
    assert_eq!(mock.data_connections(), 2);
    Ok(())
}

#[test]
fn first_attempt_not_found_is_an_error() -> Result<()> {
    let (mock, cluster) = single_node()?;
    mock.set_result_code(ResultCode::NotFound.as_u8());

    let err = execute_transaction(&cluster, &keyed("gone").delete(), &Policy::default()).unwrap_err();
    assert_eq!(err.result_code(), Some(ResultCode::NotFound));
    let err = execute_transaction(&cluster, &keyed("gone").read(&[]), &Policy::default()).unwrap_err();
    assert_eq!(err.result_code(), Some(ResultCode::NotFound));
    // Server answers leave the connection healthy.
    assert_eq!(mock.data_connections(), 1);
    Ok(())
}

#[test]
fn no_retry_surfaces_the_transport_failure() -> Result<()> {
    let (mock, cluster) = single_node()?;
    mock.swallow_next(1, Duration::ZERO);

    let policy = Policy::new(Duration::from_secs(2)).no_retry();
    let err = execute_transaction(&cluster, &keyed("k").read(&[]), &policy).unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert_eq!(mock.requests(), 1);

    // The broken connection was not pooled; the next call opens a fresh one.
    execute_transaction(&cluster, &keyed("k").read(&[]), &policy)?;
    assert_eq!(mock.data_connections(), 2);
    Ok(())
}

#[test]
fn deadline_bounds_retries() -> Result<()> {
    let (mock, cluster) = single_node()?;
    mock.swallow_next(100, Duration::from_secs(2));

    let started = Instant::now();
    let err = execute_transaction(&cluster, &keyed("k").read(&[]), &Policy::new(Duration::from_millis(300)))
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(started.elapsed() < Duration::from_secs(1));
    Ok(())
}

#[test]
fn scan_streams_every_record_then_finishes() -> Result<()> {
    let (mock, cluster) = single_node()?;
    mock.set_scan_records(5);
    let node = cluster.node_by_name("A").ok_or_else(|| anyhow!("A missing"))?;

    let request = Request::new(NAMESPACE).scan(ScanOptions::default(), false);
    let (records, handle) = spawn_stream(node, request, Policy::default(), 2)?;
    let values: Vec<i64> = records
        .iter()
        .filter_map(|record| record.bin("n").and_then(Value::as_int))
        .collect();
    let delivered = handle.join().map_err(|_| anyhow!("stream thread panicked"))??;

    assert_eq!(delivered, 5);
    assert_eq!(values, vec![0, 1, 2, 3, 4]);
    Ok(())
}

#[test]
fn scan_without_bins_still_yields_records() -> Result<()> {
    let (mock, cluster) = single_node()?;
    mock.set_scan_records(3);
    let node = cluster.node_by_name("A").ok_or_else(|| anyhow!("A missing"))?;

    let request = Request::new(NAMESPACE).scan(ScanOptions::default(), true);
    let (records, handle) = spawn_stream(node, request, Policy::default(), 8)?;
    let collected: Vec<_> = records.iter().collect();
    assert_eq!(handle.join().map_err(|_| anyhow!("stream thread panicked"))??, 3);
    assert!(collected.iter().all(|record| record.ops.is_empty()));
    Ok(())
}

#[test]
fn scan_error_ends_the_stream_with_a_server_error() -> Result<()> {
    let (mock, cluster) = single_node()?;
    mock.set_scan_records(2);
    mock.set_result_code(ResultCode::Unavailable.as_u8());
    let node = cluster.node_by_name("A").ok_or_else(|| anyhow!("A missing"))?;

    let request = Request::new(NAMESPACE).scan(ScanOptions::default(), false);
    let (records, handle) = spawn_stream(node, request, Policy::default(), 8)?;
    assert_eq!(records.iter().count(), 2);
    let err = handle
        .join()
        .map_err(|_| anyhow!("stream thread panicked"))?
        .unwrap_err();
    assert_eq!(err.result_code(), Some(ResultCode::Unavailable));
    Ok(())
}

#[test]
fn dropping_the_receiver_abandons_the_stream() -> Result<()> {
    let (mock, cluster) = single_node()?;
    mock.set_scan_records(50);
    let node = cluster.node_by_name("A").ok_or_else(|| anyhow!("A missing"))?;

    let request = Request::new(NAMESPACE).scan(ScanOptions::default(), false);
    let (records, handle) = spawn_stream(node.clone(), request, Policy::default(), 1)?;
    drop(records);
    let delivered = handle.join().map_err(|_| anyhow!("stream thread panicked"))??;
    assert!(delivered <= 1);
    // The half-read response was not pooled.
    assert_eq!(node.pool().idle(false), 0);
    Ok(())
}

#[test]
fn scan_fans_out_over_every_node() -> Result<()> {
    let a = MockNode::start("A", (0..8).collect())?;
    let b = MockNode::start("B", (8..N_PARTITIONS).collect())?;
    a.announce(&[b.addr()]);
    a.set_scan_records(3);
    b.set_scan_records(4);

    let cluster = Cluster::new(
        ClusterConfig::default()
            .with_host("127.0.0.1", a.port())
            .with_tend_interval(Duration::from_millis(50)),
    )?;
    wait_until(Duration::from_secs(5), || cluster.node_count() == 2)?;

    let pool = TaskPool::new(2, "scan-test")?;
    let (tx, rx) = bounded(64);
    let request = Request::new(NAMESPACE).scan(ScanOptions::default(), false);
    let mut outcomes = scan_nodes(&cluster, &request, &Policy::default(), &pool, &tx);
    drop(tx);

    outcomes.sort_by(|x, y| x.0.cmp(&y.0));
    let counts: Vec<(String, usize)> = outcomes
        .into_iter()
        .map(|(name, outcome)| outcome.map(|n| (name, n)))
        .collect::<Result<_, _>>()?;
    assert_eq!(counts, vec![("A".to_owned(), 3), ("B".to_owned(), 4)]);
    assert_eq!(rx.iter().count(), 7);
    Ok(())
}
