#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ringwatch_core::config::RetryConfig;
use ringwatch_core::store::retry::with_retry;
use ringwatch_core::{
    ColumnUpdate, InMemoryMembershipTable, InsertOutcome, MembershipEntry, MembershipTableCache,
    MembershipTableStore, SiloAddress, SiloStatus, StoreError, SuspectVote, WriteOutcome,
};

fn silo(idx: u16) -> SiloAddress {
    SiloAddress::new(
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 30_000 + idx),
        1,
    )
}

fn joining(idx: u16) -> MembershipEntry {
    MembershipEntry::joining(silo(idx), format!("silo-{idx}"), "localhost", Utc::now())
}

async fn seeded(count: u16) -> Arc<InMemoryMembershipTable> {
    let table = Arc::new(InMemoryMembershipTable::new());
    for idx in 0..count {
        let outcome = table.insert_row(joining(idx)).await.expect("insert");
        assert!(matches!(outcome, InsertOutcome::Inserted { .. }));
    }
    table
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_conditional_writes_have_one_winner() {
    let table = seeded(3).await;
    let expected = table.version();

    let mut handles = Vec::new();
    for writer in 0..8u16 {
        let table = Arc::clone(&table);
        let expected = expected.clone();
        handles.push(tokio::spawn(async move {
            let mut row = table.row(&silo(2)).expect("row");
            row.host_name = format!("writer-{writer}");
            table.update_row(row, &expected).await.expect("update")
        }));
    }

    let mut applied = 0;
    for handle in handles {
        match handle.await.expect("join") {
            WriteOutcome::Applied { version, .. } => {
                assert_eq!(version.version, expected.version + 1);
                applied += 1;
            }
            WriteOutcome::VersionConflict { current } => {
                assert_eq!(current.version, expected.version + 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(applied, 1);
    assert_eq!(table.version().version, expected.version + 1);
}

#[tokio::test]
async fn observed_versions_strictly_increase() {
    let table = seeded(1).await;
    let mut last = table.version().version;
    for step in 0..20 {
        let mut row = table.row(&silo(0)).expect("row");
        row.host_name = format!("step-{step}");
        let outcome = table.update_row(row, &table.version()).await.expect("update");
        let WriteOutcome::Applied { version, row } = outcome else {
            panic!("sequential writes must apply");
        };
        assert!(version.version > last);
        assert_eq!(row.row_version, version.version);
        last = version.version;
    }
}

#[tokio::test]
async fn duplicate_insert_is_a_benign_race() {
    let table = seeded(1).await;
    let outcome = table.insert_row(joining(0)).await.expect("insert");
    assert_eq!(outcome, InsertOutcome::AlreadyExists);
    assert_eq!(table.version().version, 1);
}

#[tokio::test]
async fn dead_rows_reject_every_write() {
    let table = seeded(1).await;
    let mut row = table.row(&silo(0)).expect("row");
    row.status = SiloStatus::Dead;
    assert!(table.update_row(row, &table.version()).await.expect("update").is_applied());

    let mut revived = table.row(&silo(0)).expect("row");
    revived.status = SiloStatus::Active;
    let outcome = table.update_row(revived, &table.version()).await.expect("update");
    assert_eq!(outcome, WriteOutcome::RowDead);

    let heartbeat = table
        .merge_column(silo(0), ColumnUpdate::IAmAlive(Utc::now()), &table.version())
        .await
        .expect("merge");
    assert_eq!(heartbeat, WriteOutcome::RowDead);
    assert_eq!(
        table.row(&silo(0)).map(|row| row.status),
        Some(SiloStatus::Dead)
    );
}

#[tokio::test]
async fn fallback_column_merge_checks_version() {
    let table = seeded(2).await;
    table.set_column_merge(false);
    assert!(!table.supports_column_merge());

    let stale = table.version();
    let mut other = table.row(&silo(1)).expect("row");
    other.host_name = "elsewhere".into();
    table.update_row(other, &stale).await.expect("update");

    let vote = ColumnUpdate::SuspectVote {
        vote: SuspectVote {
            voter: silo(1),
            at: Utc::now(),
        },
        cutoff: Utc::now() - chrono::Duration::minutes(2),
        max_votes: 8,
    };
    let rejected = table
        .merge_column(silo(0), vote.clone(), &stale)
        .await
        .expect("merge");
    assert!(matches!(rejected, WriteOutcome::VersionConflict { .. }));

    let applied = table
        .merge_column(silo(0), vote, &table.version())
        .await
        .expect("merge");
    let WriteOutcome::Applied { row, .. } = applied else {
        panic!("fresh version must apply");
    };
    assert!(row.vote_of(&silo(1)).is_some());
}

#[tokio::test(start_paused = true)]
async fn cache_rides_out_store_outage() {
    let table = seeded(2).await;
    let store: Arc<dyn MembershipTableStore> = table.clone();
    let cache = MembershipTableCache::new(
        store,
        RetryConfig {
            call_timeout: Duration::from_millis(200),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            max_attempts: 3,
        },
    );
    cache.refresh().await.expect("refresh");
    let before = cache.current();

    table.set_available(false);
    let err = cache.refresh().await.unwrap_err();
    assert!(matches!(err, StoreError::Unavailable(_)));
    assert_eq!(*cache.current(), *before);

    table.set_available(true);
    table.insert_row(joining(9)).await.expect("insert");
    let after = cache.refresh().await.expect("refresh");
    assert_eq!(after.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn slow_store_calls_time_out_and_retry() {
    let table = seeded(1).await;
    table.set_latency(Duration::from_secs(10));
    let retry = RetryConfig {
        call_timeout: Duration::from_millis(100),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
        max_attempts: 2,
    };

    let err = with_retry(&retry, "read_all", || table.read_all())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Timeout(_)));

    table.set_latency(Duration::ZERO);
    let readout = with_retry(&retry, "read_all", || table.read_all())
        .await
        .expect("read");
    assert_eq!(readout.entries.len(), 1);
}
