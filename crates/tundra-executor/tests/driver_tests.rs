//! End-to-end driver tests against scripted in-process replicas

use arrow_array::{Array, ArrayRef, Int64Array, RecordBatch, StringArray, UInt32Array};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tundra_common::{sinks, NodeAddr, PartUuidRegistry, Progress, Settings, TundraError};
use tundra_executor::{Header, HeaderColumn, QueryRequest, ReadResult, RemoteQueryDriver};
use tundra_net::{
    build_connection_set, local_channel, ClientPacket, Connection, ConnectionFactory, ServerEnd,
    ServerException, ServerPacket,
};
use uuid::Uuid;
use arrow_schema::DataType;

fn test_settings() -> Arc<Settings> {
    Arc::new(Settings {
        receive_timeout_ms: 5_000,
        drain_timeout_ms: 5_000,
        ..Settings::default()
    })
}

fn header_ab() -> Header {
    Header::new(vec![
        HeaderColumn::new("a", DataType::Int64),
        HeaderColumn::new("b", DataType::Utf8),
    ])
}

fn batch_ab(rows: usize) -> RecordBatch {
    let a: Vec<i64> = (0..rows as i64).collect();
    let b: Vec<String> = (0..rows).map(|i| format!("row-{i}")).collect();
    RecordBatch::try_from_iter([
        ("a", Arc::new(Int64Array::from(a)) as ArrayRef),
        ("b", Arc::new(StringArray::from(b)) as ArrayRef),
    ])
    .unwrap()
}

/// Consume client packets until the Query arrives.
fn expect_query(server: &ServerEnd) -> ClientPacket {
    loop {
        let packet = server.recv().unwrap();
        if matches!(packet, ClientPacket::Query { .. }) {
            return packet;
        }
    }
}

/// Keep receiving until the client hangs up, so cancels and disconnects
/// never strand the scripted replica.
fn drain_client(server: ServerEnd) {
    while server.recv().is_ok() {}
}

fn single_replica_driver(
    query: QueryRequest,
    settings: Arc<Settings>,
) -> (RemoteQueryDriver, ServerEnd) {
    let (client, server) = local_channel(NodeAddr::new("replica-1", 9000), 64);
    let driver =
        RemoteQueryDriver::with_connection(Arc::new(client), query, settings, None);
    (driver, server)
}

#[test]
fn test_single_replica_happy_path() {
    let (driver, server) = single_replica_driver(
        QueryRequest::new("SELECT a, b FROM t", header_ab()),
        test_settings(),
    );

    let progress_rows = Arc::new(AtomicUsize::new(0));
    let seen = progress_rows.clone();
    driver.set_progress_callback(Box::new(move |progress: &Progress| {
        seen.fetch_add(progress.read_rows as usize, Ordering::Relaxed);
    }));

    let replica = std::thread::spawn(move || {
        expect_query(&server);
        server
            .send(ServerPacket::Progress(Progress::new(5, 0, 100)))
            .unwrap();
        // A rows-free block only announces the schema and must be skipped.
        server
            .send(ServerPacket::Data(RecordBatch::new_empty(
                header_ab().schema(),
            )))
            .unwrap();
        server.send(ServerPacket::Data(batch_ab(3))).unwrap();
        server
            .send(ServerPacket::Progress(Progress::new(95, 0, 0)))
            .unwrap();
        server.send(ServerPacket::EndOfStream).unwrap();
    });

    let result = driver.read().unwrap();
    let ReadResult::Data(batch) = result else {
        panic!("expected a data block, got {result:?}");
    };
    assert_eq!(batch.num_rows(), 3);
    assert_eq!(batch.schema(), header_ab().schema());

    assert!(matches!(driver.read().unwrap(), ReadResult::Finished));
    assert!(driver.is_finished());
    assert_eq!(progress_rows.load(Ordering::Relaxed), 100);
    replica.join().unwrap();
}

#[test]
fn test_const_column_materialization() {
    let header = Header::new(vec![HeaderColumn::constant(
        "v",
        Arc::new(UInt32Array::from(vec![42u32])) as ArrayRef,
    )]);
    let (driver, server) =
        single_replica_driver(QueryRequest::new("SELECT v", header), test_settings());

    let replica = std::thread::spawn(move || {
        expect_query(&server);
        let batch = RecordBatch::try_from_iter([(
            "v",
            Arc::new(UInt32Array::from(vec![7u32, 7, 7])) as ArrayRef,
        )])
        .unwrap();
        server.send(ServerPacket::Data(batch)).unwrap();
        server.send(ServerPacket::EndOfStream).unwrap();
    });

    let batch = driver.read_block().unwrap();
    assert_eq!(batch.num_rows(), 3);
    let v = batch
        .column(0)
        .as_any()
        .downcast_ref::<UInt32Array>()
        .unwrap();
    // The replica materialized its own value for the constant; its first
    // value wins over the declared one.
    assert_eq!(v.values(), &[7, 7, 7]);

    assert!(matches!(driver.read().unwrap(), ReadResult::Finished));
    replica.join().unwrap();
}

#[test]
fn test_exception_propagation() {
    let (driver, server) = single_replica_driver(
        QueryRequest::new("SELECT broken", header_ab()),
        test_settings(),
    );

    let replica = std::thread::spawn(move || {
        expect_query(&server);
        server
            .send(ServerPacket::Exception(ServerException::new(57, "X")))
            .unwrap();
        drain_client(server);
    });

    let err = driver.read().unwrap_err();
    match err {
        TundraError::Remote { message, .. } => assert_eq!(message, "X"),
        other => panic!("expected a remote exception, got {other}"),
    }
    assert!(driver.has_thrown_exception());

    // The destructor must tear the conversation down without panicking.
    drop(driver);
    replica.join().unwrap();
}

#[test]
fn test_cancel_during_stream() {
    let (driver, server) = single_replica_driver(
        QueryRequest::new("SELECT a, b FROM t", header_ab()),
        test_settings(),
    );
    let driver = Arc::new(driver);

    let replica = std::thread::spawn(move || {
        expect_query(&server);
        server.send(ServerPacket::Data(batch_ab(2))).unwrap();
        server.send(ServerPacket::Data(batch_ab(2))).unwrap();
        // Wait for the cancel, then wind the stream down.
        loop {
            match server.recv() {
                Ok(ClientPacket::Cancel) => break,
                Ok(_) => continue,
                Err(_) => return,
            }
        }
        server
            .send(ServerPacket::Log(batch_ab(1)))
            .unwrap();
        server.send(ServerPacket::EndOfStream).unwrap();
    });

    assert!(matches!(driver.read().unwrap(), ReadResult::Data(_)));
    assert!(matches!(driver.read().unwrap(), ReadResult::Data(_)));

    let canceller = {
        let driver = driver.clone();
        std::thread::spawn(move || driver.cancel().unwrap())
    };
    canceller.join().unwrap();
    assert!(driver.was_cancelled());

    // Cancelled: reads are terminal from now on.
    assert!(matches!(driver.read().unwrap(), ReadResult::Finished));

    // The drain forwards the remote log batch and reaches end-of-stream.
    let (log_tx, log_rx) = sinks::sink_channel(4);
    sinks::set_text_log_sink(Some(log_tx));
    driver.finish().unwrap();
    sinks::set_text_log_sink(None);

    assert!(driver.is_finished());
    assert_eq!(log_rx.try_iter().count(), 1);
    replica.join().unwrap();
}

#[test]
fn test_cancel_is_idempotent_on_the_wire() {
    let (client, server) = local_channel(NodeAddr::new("replica-1", 9000), 64);
    let driver = Arc::new(RemoteQueryDriver::with_connection(
        Arc::new(client),
        QueryRequest::new("SELECT a, b FROM t", header_ab()),
        test_settings(),
        None,
    ));

    let cancel_count = Arc::new(AtomicUsize::new(0));
    let counted = cancel_count.clone();
    let replica = std::thread::spawn(move || {
        expect_query(&server);
        loop {
            match server.recv() {
                Ok(ClientPacket::Cancel) => {
                    counted.fetch_add(1, Ordering::SeqCst);
                    server.send(ServerPacket::EndOfStream).unwrap();
                }
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    });

    driver.send_query().unwrap();
    for _ in 0..3 {
        driver.cancel().unwrap();
    }
    driver.finish().unwrap();
    assert!(driver.is_finished());
    assert_eq!(cancel_count.load(Ordering::SeqCst), 1);

    drop(driver);
    replica.join().unwrap();
}

#[test]
fn test_send_ordering_cancel_never_interleaves() {
    let (client, server) = local_channel(NodeAddr::new("replica-1", 9000), 64);
    let scalar = RecordBatch::try_from_iter([(
        "s",
        Arc::new(Int64Array::from(vec![1i64])) as ArrayRef,
    )])
    .unwrap();
    let query = QueryRequest::new("SELECT a, b FROM t", header_ab())
        .with_scalar("scalar_1", scalar)
        .with_external_table("ext_1", vec![batch_ab(2)]);
    let driver =
        RemoteQueryDriver::with_connection(Arc::new(client), query, test_settings(), None);

    let order = Arc::new(Mutex::new(Vec::new()));
    let recorded = order.clone();
    let replica = std::thread::spawn(move || {
        loop {
            match server.recv() {
                Ok(packet) => {
                    let entry = match &packet {
                        ClientPacket::Data { table_name, .. } => format!("Data:{table_name}"),
                        other => other.kind().to_string(),
                    };
                    let is_cancel = matches!(packet, ClientPacket::Cancel);
                    recorded.lock().unwrap().push(entry);
                    if is_cancel {
                        server.send(ServerPacket::EndOfStream).unwrap();
                    }
                }
                Err(_) => return,
            }
        }
    });

    driver.send_query().unwrap();
    driver.cancel().unwrap();
    driver.finish().unwrap();
    drop(driver);
    replica.join().unwrap();

    let order = order.lock().unwrap().clone();
    assert_eq!(
        order,
        vec!["Query", "Data:scalar_1", "Data:ext_1", "Cancel"],
        "cancel must come after the whole send window"
    );
}

fn two_round_factory(
    settings: Arc<Settings>,
) -> (ConnectionFactory, ServerEnd, ServerEnd) {
    let (c1, s1) = local_channel(NodeAddr::new("replica-1", 9000), 64);
    let (c2, s2) = local_channel(NodeAddr::new("replica-1", 9000), 64);
    let mut rounds: VecDeque<Arc<dyn Connection>> =
        VecDeque::from([Arc::new(c1) as Arc<dyn Connection>, Arc::new(c2) as _]);
    let factory: ConnectionFactory = Box::new(move |_| {
        let conn = rounds
            .pop_front()
            .ok_or_else(|| TundraError::Network("no replicas left".to_string()))?;
        Ok(build_connection_set(vec![conn], vec![], &settings))
    });
    (factory, s1, s2)
}

#[test]
fn test_duplicate_uuid_retry() {
    let settings = test_settings();
    let (factory, s1, s2) = two_round_factory(settings.clone());
    let driver = RemoteQueryDriver::new(
        factory,
        QueryRequest::new("SELECT a, b FROM t", header_ab()),
        settings,
        None,
    );

    let u1 = Uuid::new_v4();
    let u2 = Uuid::new_v4();

    // Another replica already produced part u1 within this query.
    let registry = Arc::new(PartUuidRegistry::new());
    registry.add(&[u1]);
    driver.set_part_uuid_registry(registry);

    let first_round = std::thread::spawn(move || {
        expect_query(&s1);
        s1.send(ServerPacket::PartUuids(vec![u1])).unwrap();
        // This data must never surface: the uuid collision preempts it.
        let _ = s1.send(ServerPacket::Data(batch_ab(2)));
        drain_client(s1);
    });

    let second_round = std::thread::spawn(move || {
        let first = s2.recv().unwrap();
        match first {
            ClientPacket::IgnoredPartUuids(uuids) => assert_eq!(uuids, vec![u1]),
            other => panic!("expected the ignored uuids first, got {}", other.kind()),
        }
        expect_query(&s2);
        s2.send(ServerPacket::PartUuids(vec![u2])).unwrap();
        s2.send(ServerPacket::Data(batch_ab(4))).unwrap();
        s2.send(ServerPacket::EndOfStream).unwrap();
    });

    let result = driver.read().unwrap();
    let ReadResult::Data(batch) = result else {
        panic!("expected the retried data block, got {result:?}");
    };
    assert_eq!(batch.num_rows(), 4);
    assert!(driver.was_query_resent());

    assert!(matches!(driver.read().unwrap(), ReadResult::Finished));
    first_round.join().unwrap();
    second_round.join().unwrap();
}

#[test]
fn test_second_uuid_collision_is_fatal() {
    let settings = test_settings();
    let (factory, s1, s2) = two_round_factory(settings.clone());
    let driver = RemoteQueryDriver::new(
        factory,
        QueryRequest::new("SELECT a, b FROM t", header_ab()),
        settings,
        None,
    );

    let u1 = Uuid::new_v4();
    let registry = Arc::new(PartUuidRegistry::new());
    registry.add(&[u1]);
    driver.set_part_uuid_registry(registry);

    let first_round = std::thread::spawn(move || {
        expect_query(&s1);
        s1.send(ServerPacket::PartUuids(vec![u1])).unwrap();
        drain_client(s1);
    });

    let second_round = std::thread::spawn(move || {
        loop {
            match s2.recv() {
                Ok(ClientPacket::Query { .. }) => break,
                Ok(_) => continue,
                Err(_) => return,
            }
        }
        let _ = s2.send(ServerPacket::PartUuids(vec![u1]));
        drain_client(s2);
    });

    let err = driver.read().unwrap_err();
    assert!(matches!(err, TundraError::DuplicatedParts(_)));
    drop(driver);
    first_round.join().unwrap();
    second_round.join().unwrap();
}

#[test]
fn test_skip_unavailable_shards_returns_terminal() {
    let settings = Arc::new(Settings {
        skip_unavailable_shards: true,
        ..Settings::default()
    });
    let factory_settings = settings.clone();
    let factory: ConnectionFactory =
        Box::new(move |_| Ok(build_connection_set(vec![], vec![], &factory_settings)));
    let driver = RemoteQueryDriver::new(
        factory,
        QueryRequest::new("SELECT a, b FROM t", header_ab()),
        settings,
        None,
    );

    assert!(matches!(driver.read().unwrap(), ReadResult::Finished));
    assert!(!driver.is_finished());
}

#[test]
fn test_destructor_disconnects_pending_query() {
    let (client, server) = local_channel(NodeAddr::new("replica-1", 9000), 64);
    let client = Arc::new(client);
    let driver = RemoteQueryDriver::with_connection(
        client.clone(),
        QueryRequest::new("SELECT a, b FROM t", header_ab()),
        test_settings(),
        None,
    );

    driver.send_query().unwrap();
    expect_query(&server);
    assert!(client.is_connected());

    // Mid-conversation drop must hard-disconnect so the replica is not left
    // waiting on a silent peer.
    drop(driver);
    assert!(!client.is_connected());
}

#[test]
fn test_totals_and_extremes_are_reshaped_and_held_aside() {
    let (driver, server) = single_replica_driver(
        QueryRequest::new("SELECT a, b FROM t", header_ab()),
        test_settings(),
    );

    let replica = std::thread::spawn(move || {
        expect_query(&server);
        server.send(ServerPacket::Data(batch_ab(3))).unwrap();
        server.send(ServerPacket::Totals(batch_ab(1))).unwrap();
        server.send(ServerPacket::Extremes(batch_ab(2))).unwrap();
        server.send(ServerPacket::EndOfStream).unwrap();
    });

    assert!(matches!(driver.read().unwrap(), ReadResult::Data(_)));
    assert!(matches!(driver.read().unwrap(), ReadResult::Finished));

    let totals = driver.totals().expect("totals were delivered");
    assert_eq!(totals.num_rows(), 1);
    assert_eq!(totals.schema(), header_ab().schema());
    let extremes = driver.extremes().expect("extremes were delivered");
    assert_eq!(extremes.num_rows(), 2);
    replica.join().unwrap();
}

#[cfg(unix)]
mod async_reads {
    use super::*;
    use std::time::Duration;

    fn wait_readable(fd: i32) {
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pollfd, 1, 2_000) };
        assert!(rc >= 0, "poll failed");
    }

    #[test]
    fn test_async_send_and_read_never_block_the_caller() {
        // Capacity 1 and a slow replica force the send to suspend midway:
        // the query packet fits, the scalar behind it has to wait.
        let (client, server) = local_channel(NodeAddr::new("replica-1", 9000), 1);
        let scalar = RecordBatch::try_from_iter([(
            "s",
            Arc::new(Int64Array::from(vec![1i64])) as ArrayRef,
        )])
        .unwrap();
        let query = QueryRequest::new("SELECT a, b FROM t", header_ab())
            .with_scalar("scalar_1", scalar)
            .with_external_table("ext_1", vec![batch_ab(2)]);
        let driver = RemoteQueryDriver::with_connection(
            Arc::new(client),
            query,
            test_settings(),
            None,
        );

        let replica = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            expect_query(&server);
            // Drain the pending scalar and external table data.
            loop {
                match server.recv_timeout(Duration::from_millis(200)).unwrap() {
                    Some(_) => continue,
                    None => break,
                }
            }
            server.send(ServerPacket::Data(batch_ab(3))).unwrap();
            server.send(ServerPacket::EndOfStream).unwrap();
        });

        // The send suspends on the clogged channel and hands back a
        // pollable descriptor instead of blocking.
        let fd = driver.send_query_async().unwrap();
        assert!(fd >= 0, "send should have suspended mid-way");
        loop {
            wait_readable(fd);
            if driver.send_query_async().unwrap() == -1 {
                break;
            }
        }

        let mut batches = Vec::new();
        loop {
            match driver.read_async().unwrap() {
                ReadResult::FileDescriptor(fd) => wait_readable(fd),
                ReadResult::Data(batch) => batches.push(batch),
                ReadResult::Finished => break,
                _ => {}
            }
        }

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].num_rows(), 3);
        assert!(driver.is_finished());
        replica.join().unwrap();
    }

    #[test]
    fn test_async_cancel_makes_reads_terminal() {
        let (driver, server) = single_replica_driver(
            QueryRequest::new("SELECT a, b FROM t", header_ab()),
            test_settings(),
        );
        let driver = Arc::new(driver);

        let replica = std::thread::spawn(move || {
            expect_query(&server);
            server.send(ServerPacket::Data(batch_ab(2))).unwrap();
            loop {
                match server.recv() {
                    Ok(ClientPacket::Cancel) => break,
                    Ok(_) => continue,
                    Err(_) => return,
                }
            }
            let _ = server.send(ServerPacket::EndOfStream);
        });

        // Drive until the first data block arrives.
        let mut got_data = false;
        while !got_data {
            match driver.read_async().unwrap() {
                ReadResult::FileDescriptor(fd) => wait_readable(fd),
                ReadResult::Data(_) => got_data = true,
                ReadResult::Finished => panic!("stream ended before any data"),
                _ => {}
            }
        }

        driver.cancel().unwrap();
        assert!(matches!(driver.read_async().unwrap(), ReadResult::Finished));

        driver.finish().unwrap();
        assert!(driver.is_finished());
        replica.join().unwrap();
    }
}
