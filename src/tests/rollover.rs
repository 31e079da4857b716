use pretty_assertions::assert_eq;

use super::new_journal;
use crate::{entry::JsetEntryKind, BtreeId};

// With 4KiB starting buffers and 512-byte blocks, a fresh entry offers
// 4096/8 - 6 (header) - 54 (roots reserve) = 452 u64s.
const FIRST_ENTRY_U64S: u32 = 452;

#[tokio::test]
async fn entry_fills_and_rolls_over() {
    let t = new_journal(1).await;
    let journal = &t.journal;

    // Fill entry 1 to the brim with ten equal reservations.
    let chunk = FIRST_ENTRY_U64S / 10;
    let mut tickets = Vec::new();
    for i in 0..10 {
        let res = journal.res_get(chunk, chunk).await.expect("reservation");
        assert_eq!(res.seq, 1);
        assert_eq!(res.offset(), i * chunk);
        tickets.push(res);
    }

    // The next reservation cannot fit; the slow path closes entry 1 and
    // opens entry 2.
    let leftover = FIRST_ENTRY_U64S - chunk * 10;
    let res11 = journal
        .res_get(leftover + 1, chunk)
        .await
        .expect("rollover reservation");
    assert_eq!(res11.seq, 2);
    assert_eq!(res11.offset(), 0);

    for mut res in tickets {
        let keys = vec![res.seq; chunk as usize - 1];
        journal.entry_write(&mut res, JsetEntryKind::BtreeKeys, BtreeId::Extents, 0, &keys);
        journal.res_put(res);
    }
    journal.res_put(res11);

    journal.flush_seq(2).await.expect("flush should succeed");

    // Both entries on disk, in order, contiguous in the same bucket.
    let first = t.jset_at(0, t.bucket_sector(0, 0));
    assert_eq!(first.seq, 1);
    assert_eq!(first.u64s, chunk * 10);

    let first_sectors = (48 + u64::from(first.u64s) * 8).div_ceil(512);
    let second = t.jset_at(0, t.bucket_sector(0, 0) + first_sectors);
    assert_eq!(second.seq, 2);

    t.journal.stop().await;
}

#[tokio::test]
async fn rollover_lands_second_entry_after_first() {
    let t = new_journal(1).await;
    let journal = &t.journal;

    let r1 = journal
        .res_get(FIRST_ENTRY_U64S, FIRST_ENTRY_U64S)
        .await
        .expect("filling reservation");
    assert_eq!(r1.seq, 1);

    let r2 = journal.res_get(10, 10).await.expect("rollover reservation");
    assert_eq!(r2.seq, 2);

    journal.res_put(r1);
    journal.res_put(r2);
    journal.flush_seq(2).await.expect("flush should succeed");

    let first = t.jset_at(0, t.bucket_sector(0, 0));
    assert_eq!(first.seq, 1);
    assert_eq!(first.u64s, FIRST_ENTRY_U64S);

    // Entry 1 occupies ceil((48 + 452*8)/512) = 8 sectors.
    let second = t.jset_at(0, t.bucket_sector(0, 0) + 8);
    assert_eq!(second.seq, 2);
    assert_eq!(second.u64s, 10);

    t.journal.stop().await;
}

#[tokio::test]
async fn sealed_entries_never_change() {
    let t = new_journal(1).await;
    let journal = &t.journal;

    let mut res = journal.res_get(6, 6).await.expect("reservation");
    journal.entry_write(&mut res, JsetEntryKind::BtreeKeys, BtreeId::Alloc, 0, &[1, 2, 3, 4, 5]);
    journal.res_put(res);
    journal.flush_seq(1).await.expect("flush");

    let sealed = t.jset_at(0, t.bucket_sector(0, 0));
    assert_eq!(sealed.u64s, 6);

    // Keep the journal moving; the sealed entry must not be touched.
    for _ in 0..3 {
        journal.meta().await.expect("meta");
    }

    let reread = t.jset_at(0, t.bucket_sector(0, 0));
    assert_eq!(reread, sealed);

    // And no new ticket is ever issued against a sealed sequence.
    let res = journal.res_get(2, 2).await.expect("reservation");
    assert!(res.seq > sealed.seq);
    journal.res_put(res);

    t.journal.stop().await;
}

#[tokio::test]
async fn buffers_grow_when_the_device_offers_more() {
    let t = new_journal(1).await;
    let journal = &t.journal;

    // Fill the 4KiB entry while the bucket could hold 8KiB: the slow path
    // asks for bigger buffers at the next rotation.
    let r1 = journal
        .res_get(FIRST_ENTRY_U64S, FIRST_ENTRY_U64S)
        .await
        .expect("filling reservation");
    let r2 = journal.res_get(10, 10).await.expect("rollover reservation");
    journal.res_put(r1);

    // Entry 2 opened out of a grown 8KiB buffer: 16 sectors of entry space.
    let state = journal.debug_state();
    assert!(
        state.contains("current entry u64s:\t964"),
        "expected a grown entry, got:\n{state}"
    );

    journal.res_put(r2);
    t.journal.stop().await;
}
