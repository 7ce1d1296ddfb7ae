//! Crash-recovery, replay, checkpoint, and garbage-collection tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quill_journal::channel::JOURNAL_MAGIC;
use quill_journal::{
    FixedDirs, Journal, JournalChannel, JournalConfig, JournalError, JournalId, JournalMetrics,
    LastLogMark, LogMark, FORMAT_V4, FORMAT_V5, HEADER_SIZE, PADDING_MASK,
};
use tempfile::TempDir;

fn wait_for(mut predicate: impl FnMut() -> bool) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for condition");
}

fn config_for(tmp: &TempDir) -> JournalConfig {
    let mut config = JournalConfig::default();
    config.journal_dir = tmp.path().join("journal");
    config.max_group_wait_ms = 2;
    config
}

fn open_journal(tmp: &TempDir, config: &JournalConfig) -> Journal {
    let dirs = Arc::new(FixedDirs::single(tmp.path().to_path_buf()));
    Journal::new(config, dirs, Arc::new(JournalMetrics::default())).expect("journal")
}

fn collect_replay(journal: &Journal) -> Vec<Vec<u8>> {
    let replayed: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = replayed.clone();
    journal
        .replay(&mut move |_version: u32, _offset: u64, payload: &[u8]| {
            sink.lock().unwrap().push(payload.to_vec());
            Ok(())
        })
        .expect("replay");
    let collected = replayed.lock().unwrap().clone();
    collected
}

/// Write a raw journal file: a valid header followed by `body` bytes.
fn write_raw_journal(dir: &Path, id: u64, version: u32, body: &[u8]) {
    let mut bytes = vec![0u8; HEADER_SIZE as usize];
    bytes[0..4].copy_from_slice(&JOURNAL_MAGIC);
    bytes[4..8].copy_from_slice(&version.to_be_bytes());
    bytes.extend_from_slice(body);
    std::fs::create_dir_all(dir).expect("mkdir");
    std::fs::write(dir.join(JournalId::new(id).file_name()), bytes).expect("write journal");
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + payload.len());
    bytes.extend_from_slice(&(payload.len() as i32).to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

#[test]
fn acknowledged_entries_survive_restart() {
    let tmp = TempDir::new().expect("tempdir");
    let config = config_for(&tmp);

    let payloads: Vec<Vec<u8>> = (0..20u8)
        .map(|i| vec![i; 10 + (i as usize) * 7])
        .collect();

    {
        let journal = open_journal(&tmp, &config);
        journal.start().expect("start");
        let acked = Arc::new(AtomicUsize::new(0));
        for (entry_id, payload) in payloads.iter().enumerate() {
            let acked = acked.clone();
            journal
                .log_add(payload.clone(), 1, entry_id as i64, Some(1), move |rc, _l, _e| {
                    assert_eq!(rc, 0);
                    acked.fetch_add(1, Ordering::SeqCst);
                })
                .expect("log_add");
        }
        wait_for(|| acked.load(Ordering::SeqCst) == payloads.len());
        journal.shutdown();
    }

    let reopened = open_journal(&tmp, &config);
    assert_eq!(collect_replay(&reopened), payloads);
}

#[test]
fn replay_resumes_past_a_completed_checkpoint() {
    let tmp = TempDir::new().expect("tempdir");
    let config = config_for(&tmp);

    let mark_before;
    {
        let journal = open_journal(&tmp, &config);
        journal.start().expect("start");
        let acked = Arc::new(AtomicUsize::new(0));
        for entry_id in 0..3i64 {
            let acked = acked.clone();
            journal
                .log_add(vec![9u8; 48], 4, entry_id, Some(4), move |_rc, _l, _e| {
                    acked.fetch_add(1, Ordering::SeqCst);
                })
                .expect("log_add");
        }
        wait_for(|| acked.load(Ordering::SeqCst) == 3);

        let checkpoint = journal.new_checkpoint();
        journal
            .checkpoint_complete(checkpoint, false)
            .expect("checkpoint");
        // Completing the same checkpoint again must be harmless.
        journal
            .checkpoint_complete(checkpoint, false)
            .expect("checkpoint again");
        mark_before = journal.last_log_mark();
        journal.shutdown();
    }

    let reopened = open_journal(&tmp, &config);
    // Everything below the mark was already consumed by the memtable that
    // issued the checkpoint; nothing is surfaced twice.
    assert!(collect_replay(&reopened).is_empty());
    assert!(reopened.last_log_mark() >= mark_before);
}

#[test]
fn truncated_tail_ends_replay_silently() {
    let tmp = TempDir::new().expect("tempdir");
    let config = config_for(&tmp);
    std::fs::create_dir_all(&config.journal_dir).expect("mkdir");

    let first = vec![0x11u8; 10];
    let second = vec![0x22u8; 20];
    let id = JournalId::new(0x99);
    {
        let channel = JournalChannel::create(
            &config.journal_dir,
            id,
            4096,
            64 * 1024,
            512,
            false,
            FORMAT_V5,
        )
        .expect("create");
        channel.write(&frame(&first)).expect("write first");
        channel.write(&frame(&second)).expect("write second");
        channel.flush(false).expect("flush");
        channel.close().expect("close");
    }

    // Cut the file mid-way through the second record's payload, as an
    // unclean shutdown would.
    let path = config.journal_dir.join(id.file_name());
    let cut = HEADER_SIZE + 4 + first.len() as u64 + 4 + 8;
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .expect("open");
    file.set_len(cut).expect("truncate");

    let journal = open_journal(&tmp, &config);
    assert_eq!(collect_replay(&journal), vec![first]);
    // Replay advanced the in-memory mark to the last complete record.
    assert_eq!(journal.last_log_mark(), LogMark::new(id, HEADER_SIZE));
}

#[test]
fn padding_records_are_skipped_and_realign_the_stream() {
    let tmp = TempDir::new().expect("tempdir");
    let config = config_for(&tmp);
    std::fs::create_dir_all(&config.journal_dir).expect("mkdir");

    let first = vec![0x33u8; 100];
    let second = vec![0x44u8; 50];
    let id = JournalId::new(0xabc);
    {
        let channel = JournalChannel::create(
            &config.journal_dir,
            id,
            8192,
            64 * 1024,
            512,
            false,
            FORMAT_V5,
        )
        .expect("create");
        channel.write(&frame(&first)).expect("write first");
        channel.write_padding().expect("pad");
        channel.write(&frame(&second)).expect("write second");
        channel.flush(false).expect("flush");
        channel.close().expect("close");
    }

    let journal = open_journal(&tmp, &config);
    let offsets: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let payloads: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let offsets = offsets.clone();
        let payloads = payloads.clone();
        journal
            .replay(&mut move |_version: u32, offset: u64, payload: &[u8]| {
                offsets.lock().unwrap().push(offset);
                payloads.lock().unwrap().push(payload.to_vec());
                Ok(())
            })
            .expect("replay");
    }

    assert_eq!(*payloads.lock().unwrap(), vec![first, second]);
    let offsets = offsets.lock().unwrap();
    assert_eq!(offsets[0], HEADER_SIZE);
    assert_eq!(offsets[1] % 512, 0, "record after padding starts aligned");
}

#[test]
fn padding_mask_in_pre_v5_journal_is_a_format_error() {
    let tmp = TempDir::new().expect("tempdir");
    let config = config_for(&tmp);

    let mut body = Vec::new();
    body.extend_from_slice(&PADDING_MASK.to_be_bytes());
    body.extend_from_slice(&100i32.to_be_bytes());
    body.extend_from_slice(&[0u8; 100]);
    write_raw_journal(&config.journal_dir, 0x55, FORMAT_V4, &body);

    let journal = open_journal(&tmp, &config);
    let result = journal.replay(&mut |_v: u32, _o: u64, _p: &[u8]| Ok(()));
    assert!(matches!(result, Err(JournalError::Format(_))));
}

#[test]
fn compacting_checkpoint_prunes_old_journals() {
    let tmp = TempDir::new().expect("tempdir");
    let mut config = config_for(&tmp);
    config.max_backup_journals = 2;

    for id in 1..=8u64 {
        write_raw_journal(&config.journal_dir, id, FORMAT_V5, &[]);
    }

    // One healthy directory and one that has gone away; the mark must
    // still land in the healthy one.
    let good_dir = tmp.path().join("good");
    std::fs::create_dir_all(&good_dir).expect("mkdir");
    let dirs: Vec<PathBuf> = vec![tmp.path().join("missing"), good_dir.clone()];
    LastLogMark::roll_log(LogMark::new(JournalId::new(6), 600), &dirs).expect("roll");

    let journal = Journal::new(
        &config,
        Arc::new(FixedDirs::new(dirs)),
        Arc::new(JournalMetrics::default()),
    )
    .expect("journal");
    assert_eq!(journal.last_log_mark().log_id, JournalId::new(6));

    let checkpoint = journal.new_checkpoint();
    journal
        .checkpoint_complete(checkpoint, true)
        .expect("checkpoint");
    assert!(good_dir.join("lastMark").exists());

    let mut remaining: Vec<u64> = std::fs::read_dir(&config.journal_dir)
        .expect("read_dir")
        .filter_map(|entry| {
            let name = entry.expect("entry").file_name();
            JournalId::from_file_name(name.to_str().expect("utf8")).map(JournalId::as_u64)
        })
        .collect();
    remaining.sort_unstable();

    // Journals at or past the mark are untouchable; below it the two
    // youngest backups survive.
    assert_eq!(remaining, vec![4, 5, 6, 7, 8]);

    // Re-running the same checkpoint deletes nothing further.
    journal
        .checkpoint_complete(checkpoint, true)
        .expect("checkpoint again");
    let survivors = std::fs::read_dir(&config.journal_dir).expect("read_dir").count();
    assert_eq!(survivors, 5);
}

#[test]
fn replay_requires_the_marked_journal() {
    let tmp = TempDir::new().expect("tempdir");
    let config = config_for(&tmp);

    // Mark points into journal 0x42, but only a younger journal exists.
    write_raw_journal(&config.journal_dir, 0x50, FORMAT_V5, &[]);
    LastLogMark::roll_log(
        LogMark::new(JournalId::new(0x42), 700),
        &[tmp.path().to_path_buf()],
    )
    .expect("roll");

    let journal = open_journal(&tmp, &config);
    let result = journal.replay(&mut |_v: u32, _o: u64, _p: &[u8]| Ok(()));
    assert!(
        matches!(result, Err(JournalError::MissingJournal(id)) if id == JournalId::new(0x42))
    );
}

#[test]
fn durable_mark_never_regresses_across_restarts() {
    let tmp = TempDir::new().expect("tempdir");
    let config = config_for(&tmp);

    let first_mark;
    {
        let journal = open_journal(&tmp, &config);
        journal.start().expect("start");
        let acked = Arc::new(AtomicUsize::new(0));
        let probe = acked.clone();
        journal
            .log_add(vec![5u8; 100], 2, 0, Some(2), move |_rc, _l, _e| {
                probe.fetch_add(1, Ordering::SeqCst);
            })
            .expect("log_add");
        wait_for(|| acked.load(Ordering::SeqCst) == 1);
        let checkpoint = journal.new_checkpoint();
        journal
            .checkpoint_complete(checkpoint, false)
            .expect("checkpoint");
        first_mark = journal.last_log_mark();
        journal.shutdown();
    }

    let reopened = open_journal(&tmp, &config);
    assert!(reopened.last_log_mark() >= first_mark);

    reopened.start().expect("start");
    let acked = Arc::new(AtomicUsize::new(0));
    let probe = acked.clone();
    reopened
        .log_add(vec![6u8; 100], 2, 1, Some(2), move |_rc, _l, _e| {
            probe.fetch_add(1, Ordering::SeqCst);
        })
        .expect("log_add");
    wait_for(|| acked.load(Ordering::SeqCst) == 1);
    assert!(reopened.last_log_mark() > first_mark);
    reopened.shutdown();
}
