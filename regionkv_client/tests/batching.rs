mod common;

use std::{
    num::{NonZeroU32, NonZeroUsize},
    sync::Arc,
    time::Duration,
};

use assert_matches::assert_matches;
use bytes::Bytes;
use regionkv_client::{
    AppendRequest, AtomicIncrementRequest, BufferLimits, ClientConfig, DeleteRequest, Error,
    FailureCause, Operation, PutRequest, Rejection, RegionId, RetryPolicy, ServerAddr,
    TransportError,
};

use common::{CachingResolver, FakeCluster, Placement};

const RS1: &str = "rs1:16020";
const RS2: &str = "rs2:16020";
const RS3: &str = "rs3:16020";

fn three_regions() -> Arc<Placement> {
    Placement::new(&[("", "users,", RS1), ("h", "users,h", RS2), ("p", "users,p", RS3)])
}

fn put(row: impl Into<Bytes>, family: impl Into<Bytes>) -> Operation {
    Operation::new(PutRequest::new("users", row, family, "q", "v"))
}

fn config(flush_interval: Duration, max_operations: usize) -> ClientConfig {
    ClientConfig {
        flush_interval,
        limits: BufferLimits {
            max_operations: NonZeroUsize::new(max_operations).unwrap(),
            ..Default::default()
        },
        ..Default::default()
    }
}

struct Setup {
    placement: Arc<Placement>,
    resolver: Arc<CachingResolver>,
    cluster: Arc<FakeCluster>,
}

fn setup(cluster: impl FnOnce(FakeCluster) -> FakeCluster) -> Setup {
    let placement = three_regions();
    Setup {
        resolver: Arc::new(CachingResolver::new(Arc::clone(&placement))),
        cluster: Arc::new(cluster(FakeCluster::new(Arc::clone(&placement)))),
        placement,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_operation_settles_exactly_once() {
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 250;

    let s = setup(|c| c);
    let client = Arc::new(common::client(
        &s.resolver,
        &s.cluster,
        config(Duration::from_millis(5), 16),
    ));

    let writers = (0..WRITERS)
        .map(|w| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let mut handles = vec![];
                for i in 0..PER_WRITER {
                    let row = format!("{}{w}-{i:03}", ["a", "k", "x"][i % 3]);
                    let handle = client.submit(put(row.clone(), "cf")).await;
                    handles.push((row, handle));
                }
                handles
            })
        })
        .collect::<Vec<_>>();

    let mut handles = vec![];
    for w in writers {
        handles.extend(w.await.unwrap());
    }
    client.flush_all().await;

    for (row, handle) in handles {
        assert_eq!(handle.await.unwrap(), row.as_bytes());
    }

    let mut seen = s
        .cluster
        .requests()
        .into_iter()
        .flat_map(|r| r.actions)
        .map(|(row, _)| row)
        .collect::<Vec<_>>();
    assert_eq!(seen.len(), WRITERS * PER_WRITER);
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), WRITERS * PER_WRITER, "an action was sent twice");
    assert_eq!(client.buffered_operations(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_row_operations_keep_submission_order() {
    let s = setup(|c| c.with_latency(Duration::from_millis(1)));
    let client = common::client(&s.resolver, &s.cluster, config(Duration::from_millis(1), 3));

    let families = (0..30).map(|i| format!("f{i:02}")).collect::<Vec<_>>();
    let mut handles = vec![];
    for family in &families {
        handles.push(client.submit(put("row", family.clone())).await);
        // Interleave another row so batches are not trivially uniform.
        handles.push(client.submit(put("rox", "cf")).await);
    }
    client.flush_all().await;
    for h in handles {
        h.await.unwrap();
    }

    let wire = s
        .cluster
        .requests()
        .into_iter()
        .flat_map(|r| r.actions)
        .filter(|(row, _)| row == "row")
        .map(|(_, family)| family)
        .collect::<Vec<_>>();
    assert_eq!(wire, families);
}

#[tokio::test]
async fn full_buffer_flushes_without_timer() {
    let s = setup(|c| c);
    let client = common::client(&s.resolver, &s.cluster, config(Duration::from_secs(3_600), 4));

    let mut handles = vec![];
    for i in 0..5 {
        handles.push(client.submit(put(format!("a{i}"), "cf")).await);
    }

    for h in handles.drain(..4) {
        h.await.unwrap();
    }
    let requests = s.cluster.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].actions.len(), 4);
    assert_eq!(client.buffered_operations(), 1);
}

#[tokio::test]
async fn unbufferable_operation_sent_alone_and_immediately() {
    let s = setup(|c| c);
    let client = common::client(&s.resolver, &s.cluster, config(Duration::from_secs(3_600), 100));

    let mut buffered = vec![];
    for i in 0..3 {
        buffered.push(client.submit(put(format!("a{i}"), "cf")).await);
    }

    let op = Operation::new(AtomicIncrementRequest::new("users", "a-counter", "cf", "hits", 1));
    op.set_bufferable(false).unwrap();
    client.submit(op).await.await.unwrap();

    let requests = s.cluster.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].actions, [(Bytes::from("a-counter"), Bytes::from("cf"))]);
    assert_eq!(client.buffered_operations(), 3);

    client.flush_all().await;
    for h in buffered {
        h.await.unwrap();
    }
    let requests = s.cluster.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].actions.len(), 3);
}

#[test_log::test(tokio::test)]
async fn stale_location_is_re_resolved() {
    let s = setup(|c| c);
    let client = common::client(&s.resolver, &s.cluster, config(Duration::ZERO, 100));

    let op = put("a1", "cf");
    let handle = client.submit(op.clone()).await;

    // The region moves after the client cached its location.
    s.placement.move_region("users,", RS3);
    client.flush_all().await;

    assert_eq!(handle.await.unwrap(), "a1");
    assert_eq!(op.attempts(), 1);

    let servers = s
        .cluster
        .requests()
        .into_iter()
        .map(|r| r.server)
        .collect::<Vec<_>>();
    assert_eq!(servers, [ServerAddr::new(RS1), ServerAddr::new(RS3)]);
    assert_eq!(s.resolver.invalidated(), [RegionId::new("users,", 1)]);
    assert_eq!(s.resolver.lookups(), 2);
}

#[tokio::test]
async fn transient_failures_exhaust_retries() {
    let s = setup(|c| {
        c.with_always_fail(TransportError::Connection {
            server: ServerAddr::new(RS1),
            reason: "connection refused".to_string(),
        })
    });
    let client = common::client(
        &s.resolver,
        &s.cluster,
        ClientConfig {
            flush_interval: Duration::ZERO,
            retry: RetryPolicy {
                max_attempts: NonZeroU32::new(2).unwrap(),
                initial_backoff: Duration::from_millis(1),
                ..Default::default()
            },
            ..Default::default()
        },
    );

    let op = Operation::new(AppendRequest::new("users", "a1", "cf", "log", "entry"));
    let handle = client.submit(op.clone()).await;
    client.flush_all().await;

    assert_matches!(
        handle.await,
        Err(Error::RetriesExhausted {
            attempts: 2,
            last_cause: FailureCause::Transport(TransportError::Connection { .. }),
        })
    );
    assert_eq!(op.attempts(), 2);
    assert_eq!(s.cluster.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn flush_all_waits_for_every_destination() {
    let s = setup(|c| c.with_latency(Duration::from_millis(50)));
    let client = common::client(&s.resolver, &s.cluster, config(Duration::ZERO, 100));

    let mut handles = vec![];
    for row in ["a1", "a2", "k1", "x1", "x2", "x3"] {
        handles.push(client.submit(put(row, "cf")).await);
    }
    assert_eq!(client.buffered_operations(), 6);

    let mut flush = client.flush_all();
    assert_eq!(client.buffered_operations(), 0);
    assert!(futures::poll!(&mut flush).is_pending());
    flush.await;

    for mut h in handles {
        assert_matches!(h.try_settled(), Some(Ok(_)));
    }
    let mut regions = s
        .cluster
        .requests()
        .into_iter()
        .map(|r| r.region)
        .collect::<Vec<_>>();
    regions.sort_by(|a, b| a.name().cmp(b.name()));
    assert_eq!(
        regions,
        [
            RegionId::new("users,", 1),
            RegionId::new("users,h", 1),
            RegionId::new("users,p", 1)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn flush_all_waits_for_rerouted_operations_sent_by_the_timer() {
    let placement = Placement::new(&[("", "users,", RS1)]);
    let resolver = Arc::new(CachingResolver::new(Arc::clone(&placement)));
    let cluster = Arc::new(
        FakeCluster::new(Arc::clone(&placement))
            .with_server_latency(RS2, Duration::from_millis(100)),
    );
    let client = common::client(&resolver, &cluster, config(Duration::from_millis(10), 100));

    let mut a = client.submit(put("a1", "cf")).await;
    let mut b = client.submit(put("b1", "cf")).await;

    // Both rows leave the region: a1 stays in its lower half, now on RS2, and
    // b1 moves to a new region on RS3 that takes a while to look up.
    placement.split("users,", "b", "users,b", RS3);
    placement.move_region("users,", RS2);
    resolver.set_lookup_delay("b1", Duration::from_millis(50));

    // While b1 is being located, the timer picks up a1 from its new buffer
    // and sends it to the slow server.
    client.flush_all().await;

    assert_matches!(a.try_settled(), Some(Ok(_)));
    assert_matches!(b.try_settled(), Some(Ok(_)));
    let servers = cluster
        .requests()
        .into_iter()
        .map(|r| r.server)
        .collect::<Vec<_>>();
    assert_eq!(
        servers,
        [ServerAddr::new(RS1), ServerAddr::new(RS2), ServerAddr::new(RS3)]
    );
}

#[tokio::test]
async fn shutdown_settles_everything_then_rejects() {
    let s = setup(|c| c);
    let client = common::client(&s.resolver, &s.cluster, config(Duration::from_secs(3_600), 100));

    let mut handles = vec![];
    for row in ["a1", "k1", "x1"] {
        handles.push(client.submit(put(row, "cf")).await);
    }
    handles.push(
        client
            .submit(Operation::new(DeleteRequest::whole_row("users", "k2")))
            .await,
    );

    client.shutdown().await;
    for mut h in handles {
        assert_matches!(h.try_settled(), Some(Ok(_)));
    }
    assert_eq!(s.cluster.actions_received(), 4);

    let late = client.submit(put("a2", "cf")).await;
    assert_matches!(late.await, Err(Error::Rejected(Rejection::ShuttingDown)));
}

#[tokio::test]
async fn dropping_client_sends_buffered_operations() {
    let s = setup(|c| c);
    let client = common::client(&s.resolver, &s.cluster, config(Duration::from_secs(3_600), 100));

    let handle = client.submit(put("a1", "cf")).await;
    drop(client);

    assert_eq!(handle.await.unwrap(), "a1");
    assert_eq!(s.cluster.actions_received(), 1);
}
