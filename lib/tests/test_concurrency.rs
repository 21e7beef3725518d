use anyhow::Result;
use genstore::{DeferredTxn, GenerationId, Location, Store, StoreConfig, TxnMode};
use oxigraph::model::{GraphName, Literal, NamedNode, Quad};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn counter_quad(i: usize) -> Quad {
    Quad::new(
        NamedNode::new_unchecked("http://example.org/counter"),
        NamedNode::new_unchecked("http://example.org/value"),
        Literal::from(i as i64),
        GraphName::DefaultGraph,
    )
}

fn open(location: Location) -> Result<Store> {
    let _ = env_logger::try_init();
    let config = StoreConfig::builder()
        .location(location)
        .exclusive_timeout(Duration::from_secs(10))
        .build()?;
    Ok(Store::open(config)?)
}

#[test]
fn writers_take_turns() -> Result<()> {
    let store = open(Location::mem())?;
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let threads = 8;
    let per_thread = 25;
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let store = store.clone();
            let active = active.clone();
            let max_active = max_active.clone();
            let start = start.clone();
            thread::spawn(move || -> Result<()> {
                start.wait();
                for i in 0..per_thread {
                    let mut txn = store.begin(TxnMode::Write)?;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    txn.add(&counter_quad(t * per_thread + i))?;
                    thread::yield_now();
                    active.fetch_sub(1, Ordering::SeqCst);
                    txn.commit()?;
                    txn.end()?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer panicked")?;
    }

    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    let txn = store.begin(TxnMode::Read)?;
    assert_eq!(txn.len()?, threads * per_thread);
    assert_eq!(
        txn.data_version(),
        (threads * per_thread) as u64,
        "every write commit advances the data version"
    );
    Ok(())
}

#[test]
fn reader_survives_compaction_on_disk() -> Result<()> {
    let dir = tempdir()?;
    let store = open(Location::dir(dir.path()))?;
    store.execute_write(|txn| txn.extend((0..100).map(counter_quad)))?;

    let (ready_tx, ready_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let reader_store = store.clone();
    let reader = thread::spawn(move || -> Result<(GenerationId, usize)> {
        let txn = reader_store.begin(TxnMode::Read)?;
        ready_tx.send(())?;
        go_rx.recv()?;
        // the generation behind this snapshot has been retired by now
        let count = txn.quads()?.collect::<genstore::Result<Vec<_>>>()?.len();
        Ok((txn.generation_id(), count))
    });
    ready_rx.recv()?;

    let report = store.compact()?;
    assert_eq!(report.quads, 100);
    store.execute_write(|txn| txn.add(&counter_quad(100)))?;
    go_tx.send(())?;

    let (generation, count) = reader.join().expect("reader panicked")?;
    assert_eq!(generation, GenerationId::FIRST);
    assert_eq!(count, 100);

    let txn = store.begin(TxnMode::Read)?;
    assert_eq!(txn.generation_id(), GenerationId::new(2));
    assert_eq!(txn.len()?, 101);
    Ok(())
}

#[test]
fn writes_during_repeated_compactions_are_not_lost() -> Result<()> {
    let dir = tempdir()?;
    let store = open(Location::dir(dir.path()))?;
    let writes = 200;

    let writer_store = store.clone();
    let writer = thread::spawn(move || -> Result<()> {
        for i in 0..writes {
            writer_store.execute_write(|txn| txn.add(&counter_quad(i)))?;
        }
        Ok(())
    });
    let mut compactions = 0;
    while !writer.is_finished() && compactions < 5 {
        store.compact()?;
        compactions += 1;
    }
    writer.join().expect("writer panicked")?;

    let expected: HashSet<Quad> = (0..writes).map(counter_quad).collect();
    let txn = store.begin(TxnMode::Read)?;
    let found = txn.quads()?.collect::<genstore::Result<HashSet<_>>>()?;
    assert_eq!(found, expected);
    assert_eq!(
        store.current_generation(),
        GenerationId::new(1 + compactions as u32)
    );
    drop(txn);
    drop(store);

    // every committed write survives a reopen as well
    let store = open(Location::dir(dir.path()))?;
    let txn = store.begin(TxnMode::Read)?;
    assert_eq!(txn.len()?, writes);
    Ok(())
}

#[test]
fn deferred_write_from_thread_holding_a_read() -> Result<()> {
    let store = open(Location::mem())?;
    let reader = store.begin(TxnMode::Read)?;
    // a direct write here would be a protocol violation on this thread
    assert!(store.begin(TxnMode::Write).is_err());

    let mut deferred = DeferredTxn::write(&store, |txn| txn.add(&counter_quad(7)))?;
    assert!(deferred.run()?);
    assert!(!reader.contains(&counter_quad(7))?);
    drop(reader);

    let txn = store.begin(TxnMode::Read)?;
    assert!(txn.contains(&counter_quad(7))?);
    Ok(())
}
