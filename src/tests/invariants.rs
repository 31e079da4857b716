use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{build_journal, new_journal, test_config};
use crate::entry::JsetEntryKind;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tickets_are_ordered_and_disjoint() {
    let t = new_journal(1).await;

    // (task, seq, offset, u64s) for every ticket handed out.
    let log: Arc<Mutex<Vec<(usize, u64, u32, u32)>>> = Arc::new(Mutex::new(Vec::new()));

    let mut writers = Vec::new();
    for task in 0..4usize {
        let journal = Arc::clone(&t.journal);
        let log = Arc::clone(&log);
        writers.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(task as u64);
            let mut last_seq = 0;
            for _ in 0..40 {
                let u64s = rng.gen_range(2..16);
                let res = journal.res_get(u64s, u64s).await.expect("reservation");

                // Sequence numbers observed by one thread never run
                // backwards.
                assert!(res.seq >= last_seq);
                last_seq = res.seq;

                log.lock().push((task, res.seq, res.offset(), res.u64s()));
                journal.res_put(res);
            }
        }));
    }
    for writer in writers {
        writer.await.expect("writer task should not panic");
    }

    t.journal.flush().await.expect("final flush");

    // Within an entry, ticket ranges are pairwise disjoint.
    let mut by_seq: HashMap<u64, Vec<(u32, u32)>> = HashMap::new();
    for (_, seq, offset, u64s) in log.lock().iter() {
        by_seq.entry(*seq).or_default().push((*offset, *u64s));
    }
    for (seq, mut ranges) in by_seq {
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(
                pair[0].0 + pair[0].1 <= pair[1].0,
                "overlapping tickets in entry {seq}: {pair:?}"
            );
        }
    }

    t.journal.stop().await;
}

#[tokio::test]
async fn unpinned_durable_entries_are_reclaimed() {
    let t = new_journal(1).await;
    let journal = &t.journal;

    for _ in 0..5 {
        journal.meta().await.expect("meta");
    }

    // Nothing pinned: reclamation catches all the way up to the live entry.
    assert_eq!(journal.last_seq(), journal.cur_seq());
    assert!(journal
        .debug_state()
        .contains("active journal entries:\t1"));

    t.journal.stop().await;
}

#[tokio::test]
async fn blacklisted_sequences_are_skipped_and_recorded() {
    let t = build_journal(test_config(), 1, &[(1, 3)]).await;
    let journal = &t.journal;

    // New sequences begin past the blacklist.
    assert_eq!(journal.cur_seq(), 4);

    let res = journal.res_get(4, 4).await.expect("reservation");
    assert_eq!(res.seq, 4);
    // The blacklist chunk was staged into the entry before any reservation.
    assert_eq!(res.offset(), 3);
    journal.res_put(res);
    journal.flush_seq(4).await.expect("flush");

    let jset = t.jset_at(0, t.bucket_sector(0, 0));
    assert_eq!(jset.seq, 4);
    assert_eq!(jset.last_seq, 4);
    assert_eq!(jset.entries[0].kind, JsetEntryKind::Blacklist);
    assert_eq!(jset.entries[0].keys, vec![1, 3]);

    t.journal.stop().await;
}

#[tokio::test]
async fn last_unwritten_seq_tracks_the_inflight_entry() {
    let t = new_journal(1).await;
    let journal = &t.journal;

    assert_eq!(journal.last_unwritten_seq(), 1);

    // Hold entry 1 in flight: the unwritten horizon stays behind cur_seq.
    t.devs[0].pause();
    let res = journal.res_get(2, 2).await.expect("reservation");
    journal.res_put(res);

    let flusher = {
        let journal = Arc::clone(&t.journal);
        tokio::spawn(async move { journal.flush_seq(1).await })
    };
    while journal.cur_seq() < 2 {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    assert_eq!(journal.last_unwritten_seq(), 1);

    t.devs[0].resume();
    flusher
        .await
        .expect("flusher should not panic")
        .expect("flush");
    assert_eq!(journal.last_unwritten_seq(), journal.cur_seq());

    t.journal.stop().await;
}
