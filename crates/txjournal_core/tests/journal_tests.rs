//! End-to-end journal tests: write, rollover, recovery and damage
//! tolerance against real files.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;
use txjournal_core::{
    JournalError, JournalFile, JournalOptions, JournalRecord, PooledBufferProvider,
    FIXED_HEADER_SIZE, RECORD_HEADER_SIZE, RECORD_OVERHEAD,
};

const TEST_JOURNAL_SIZE: u64 = 64 * 1024;

fn record_with(journal: &JournalFile, payload: &[u8]) -> JournalRecord {
    let mut record = journal.create_empty_record();
    record
        .create_empty_payload(payload.len())
        .unwrap()
        .copy_from_slice(payload);
    record
}

fn write_one(journal: &JournalFile, payload: &[u8]) {
    let mut batch = [record_with(journal, payload)];
    journal.write(&mut batch).unwrap();
}

fn payloads(journal: &JournalFile) -> Vec<Vec<u8>> {
    journal
        .read_all(false)
        .map(|record| record.payload().to_vec())
        .collect()
}

/// Flips one byte of the journal file behind the journal's back.
fn flip_byte(path: &Path, offset: u64) {
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    let mut byte = [0u8];
    std::io::Read::read_exact(&mut file, &mut byte).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[byte[0] ^ 0xFF]).unwrap();
}

#[test]
fn single_record_round_trip() {
    let dir = tempdir().unwrap();
    let journal = JournalFile::open(dir.path().join("s1.journal"), TEST_JOURNAL_SIZE).unwrap();

    write_one(&journal, b"hello");

    let records: Vec<_> = journal.read_all(false).collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload(), b"hello");
    assert!(records[0].is_valid());
}

#[test]
fn rollover_preserves_both_cycles_in_order() {
    let dir = tempdir().unwrap();
    let journal = JournalFile::open(dir.path().join("s2.journal"), TEST_JOURNAL_SIZE).unwrap();

    // The new cycle restarts at the front of the record area, reclaiming
    // the oldest bytes first; lead with a record whose space the
    // post-rollover write may take.
    write_one(&journal, &[b'.'; 64]);
    write_one(&journal, b"A");
    journal.rollover().unwrap();
    write_one(&journal, b"B");

    let records: Vec<_> = journal.read_all(false).collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].payload(), b"A");
    assert_eq!(records[1].payload(), b"B");
    assert_ne!(
        records[0].generation(),
        records[1].generation(),
        "the cycles must be stamped with different generations"
    );
}

#[test]
fn corrupted_payload_is_skipped() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s3.journal");
    let journal = JournalFile::open(&path, TEST_JOURNAL_SIZE).unwrap();

    write_one(&journal, b"aaa");
    write_one(&journal, b"bbb");
    write_one(&journal, b"ccc");
    journal.force().unwrap();

    // One byte inside the middle record's payload area.
    let record_size = (RECORD_OVERHEAD + 3) as u64;
    let target = FIXED_HEADER_SIZE as u64 + record_size + RECORD_HEADER_SIZE as u64 + 1;
    flip_byte(&path, target);

    assert_eq!(payloads(&journal), [b"aaa".to_vec(), b"ccc".to_vec()]);

    // With include_invalid the damaged record surfaces, flagged.
    let all: Vec<_> = journal.read_all(true).collect();
    assert_eq!(all.len(), 3);
    assert!(!all[1].is_valid());
}

#[test]
fn torn_trailer_is_dropped_and_append_point_recovers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s4.journal");

    let after_first;
    let after_second;
    {
        let journal = JournalFile::open(&path, TEST_JOURNAL_SIZE).unwrap();
        write_one(&journal, b"survives");
        after_first = journal.position();
        write_one(&journal, b"torn away");
        after_second = journal.position();
        journal.close().unwrap();
    }

    // Tear the second record mid-trailer, as a crash during its write
    // would.
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(after_second - 10).unwrap();
    drop(file);

    let journal = JournalFile::open(&path, TEST_JOURNAL_SIZE).unwrap();
    assert_eq!(payloads(&journal), [b"survives".to_vec()]);
    assert_eq!(journal.position(), after_first);
}

#[test]
fn full_journal_refuses_until_rollover() {
    let dir = tempdir().unwrap();
    let payload = b"x";
    let record_size = (RECORD_OVERHEAD + payload.len()) as u64;
    let lead_size = (RECORD_OVERHEAD + 10) as u64;
    // Room for a leading record (reclaimed by the next cycle) plus one
    // payload record, and nothing more.
    let journal = JournalFile::open(
        dir.path().join("s5.journal"),
        FIXED_HEADER_SIZE as u64 + lead_size + record_size,
    )
    .unwrap();

    write_one(&journal, &[b'.'; 10]);
    write_one(&journal, payload);
    assert_eq!(journal.remaining_capacity(), 0);

    let mut batch = [record_with(&journal, payload)];
    match journal.write(&mut batch) {
        Err(JournalError::NeedsRollover {
            remaining,
            required,
        }) => {
            assert_eq!(remaining, 0);
            assert_eq!(required, record_size);
        }
        other => panic!("expected NeedsRollover, got {other:?}"),
    }

    journal.rollover().unwrap();
    journal.write(&mut batch).unwrap();

    // The pre-rollover record survives under the previous generation, the
    // retried one lands under the current generation.
    let records: Vec<_> = journal.read_all(false).collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].payload(), b"x");
    assert_eq!(records[1].payload(), b"x");
    assert_ne!(records[0].generation(), records[1].generation());
}

#[test]
fn second_open_is_refused_while_locked() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("s6.journal");

    let first = JournalFile::open(&path, TEST_JOURNAL_SIZE).unwrap();
    assert!(matches!(
        JournalFile::open(&path, TEST_JOURNAL_SIZE),
        Err(JournalError::Busy)
    ));

    first.close().unwrap();
    JournalFile::open(&path, TEST_JOURNAL_SIZE).unwrap();
}

#[test]
fn rollover_union_keeps_all_records_in_order() {
    let dir = tempdir().unwrap();
    let journal = JournalFile::open(dir.path().join("union.journal"), TEST_JOURNAL_SIZE).unwrap();

    // The leading record absorbs the new cycle's overwrites so the n*
    // records stay intact.
    write_one(&journal, &[b'.'; 128]);
    for payload in [b"n1".as_slice(), b"n2", b"n3"] {
        write_one(&journal, payload);
    }
    journal.rollover().unwrap();
    for payload in [b"m1".as_slice(), b"m2"] {
        write_one(&journal, payload);
    }

    let expected: Vec<Vec<u8>> = [b"n1".as_slice(), b"n2", b"n3", b"m1", b"m2"]
        .iter()
        .map(|p| p.to_vec())
        .collect();
    assert_eq!(payloads(&journal), expected);
}

#[test]
fn reopen_appends_after_existing_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen.journal");

    {
        let journal = JournalFile::open(&path, TEST_JOURNAL_SIZE).unwrap();
        write_one(&journal, b"first");
        write_one(&journal, b"second");
        journal.close().unwrap();
    }

    let journal = JournalFile::open(&path, TEST_JOURNAL_SIZE).unwrap();
    write_one(&journal, b"third");

    assert_eq!(
        payloads(&journal),
        [b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
    );
}

#[test]
fn reopen_after_rollover_keeps_both_cycles() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen_rollover.journal");

    {
        let journal = JournalFile::open(&path, TEST_JOURNAL_SIZE).unwrap();
        write_one(&journal, &[b'.'; 64]);
        write_one(&journal, b"old cycle");
        journal.rollover().unwrap();
        write_one(&journal, b"new cycle");
        journal.close().unwrap();
    }

    let journal = JournalFile::open(&path, TEST_JOURNAL_SIZE).unwrap();
    assert_eq!(
        payloads(&journal),
        [b"old cycle".to_vec(), b"new cycle".to_vec()]
    );
}

#[test]
fn empty_batch_writes_nothing() {
    let dir = tempdir().unwrap();
    let journal = JournalFile::open(dir.path().join("empty.journal"), TEST_JOURNAL_SIZE).unwrap();

    let position = journal.position();
    assert_eq!(journal.write(&mut []).unwrap(), 0);
    assert_eq!(journal.position(), position);
}

#[test]
fn fresh_journal_is_empty_with_append_point_behind_the_header() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fresh.journal");

    {
        let journal = JournalFile::open(&path, TEST_JOURNAL_SIZE).unwrap();
        assert_eq!(journal.position(), FIXED_HEADER_SIZE as u64);
        assert_eq!(journal.read_all(false).count(), 0);
        journal.close().unwrap();
    }

    // Header-only reopen behaves the same.
    let journal = JournalFile::open(&path, TEST_JOURNAL_SIZE).unwrap();
    assert_eq!(journal.position(), FIXED_HEADER_SIZE as u64);
    assert_eq!(journal.read_all(false).count(), 0);
}

#[test]
fn journal_grows_but_never_shrinks() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sizes.journal");

    {
        let journal = JournalFile::open(&path, TEST_JOURNAL_SIZE).unwrap();
        journal.close().unwrap();
    }

    // Requesting a smaller size keeps the larger file.
    {
        let journal = JournalFile::open(&path, TEST_JOURNAL_SIZE / 2).unwrap();
        assert_eq!(journal.size(), TEST_JOURNAL_SIZE);
        journal.close().unwrap();
    }

    // Requesting a larger size grows it; grow() extends further.
    let journal = JournalFile::open(&path, TEST_JOURNAL_SIZE * 2).unwrap();
    assert_eq!(journal.size(), TEST_JOURNAL_SIZE * 2);
    journal.grow(TEST_JOURNAL_SIZE * 4).unwrap();
    assert_eq!(journal.size(), TEST_JOURNAL_SIZE * 4);
    journal.grow(TEST_JOURNAL_SIZE).unwrap();
    assert_eq!(journal.size(), TEST_JOURNAL_SIZE * 4);
}

#[test]
fn non_journal_file_is_refused() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("not_a.journal");
    std::fs::write(&path, vec![b'?'; 2048]).unwrap();

    assert!(matches!(
        JournalFile::open(&path, TEST_JOURNAL_SIZE),
        Err(JournalError::BadMagic { .. })
    ));

    // The failed open released the lock.
    std::fs::write(&path, Vec::new()).unwrap();
    JournalFile::open(&path, TEST_JOURNAL_SIZE).unwrap();
}

#[test]
fn close_is_idempotent_and_blocks_later_writes() {
    let dir = tempdir().unwrap();
    let journal = JournalFile::open(dir.path().join("closed.journal"), TEST_JOURNAL_SIZE).unwrap();
    write_one(&journal, b"before close");

    journal.close().unwrap();
    journal.close().unwrap();

    let mut batch = [];
    assert!(matches!(journal.write(&mut batch), Err(JournalError::Closed)));
    assert!(matches!(journal.force(), Err(JournalError::Closed)));
    assert!(matches!(journal.rollover(), Err(JournalError::Closed)));
}

#[test]
fn multiple_rollovers_retire_the_oldest_cycle() {
    let dir = tempdir().unwrap();
    let journal =
        JournalFile::open(dir.path().join("retire.journal"), TEST_JOURNAL_SIZE).unwrap();

    write_one(&journal, b"cycle one");
    journal.rollover().unwrap();
    write_one(&journal, &[b'.'; 64]);
    write_one(&journal, b"two-a");
    write_one(&journal, b"two-b");
    journal.rollover().unwrap();
    write_one(&journal, b"three");

    // The second cycle's surviving records and the third cycle are live;
    // "cycle one" is two generations old and gone.
    assert_eq!(
        payloads(&journal),
        [b"two-a".to_vec(), b"two-b".to_vec(), b"three".to_vec()]
    );
}

#[test]
fn works_with_a_pooled_provider() {
    let dir = tempdir().unwrap();
    let provider = Arc::new(PooledBufferProvider::new());
    let journal = JournalFile::open_with(
        dir.path().join("pooled.journal"),
        JournalOptions::new().initial_size(TEST_JOURNAL_SIZE),
        provider,
    )
    .unwrap();

    // The leading record absorbs the next cycle's overwrites.
    write_one(&journal, &[b'.'; 600]);
    for i in 0..32u8 {
        write_one(&journal, &[i; 100]);
    }
    journal.rollover().unwrap();
    for i in 0..8u8 {
        write_one(&journal, &[i; 17]);
    }

    let records: Vec<_> = journal.read_all(false).collect();
    assert_eq!(records.len(), 40);
    assert!(records.iter().all(JournalRecord::is_valid));
    assert_eq!(records[0].payload(), &[0u8; 100]);
    assert_eq!(records[39].payload(), &[7u8; 17]);
}
