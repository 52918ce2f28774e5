// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use spool_queue::{
    FlushMode, QueueBuilder, QueueError, Record, RollStrategy, SegmentState,
    segment::{ScanItem, SegmentReader},
};
use tempfile::TempDir;

fn segment_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "seg"))
        .collect();
    files.sort();
    files
}

#[test]
fn test_queue_write_and_read() {
    let temp_dir = TempDir::new().unwrap();
    let mut queue = QueueBuilder::new(temp_dir.path())
        .flush_mode(FlushMode::Sync)
        .build()
        .unwrap();

    for i in 0..100 {
        queue
            .writer()
            .enqueue(&Record::new(format!("message-{i:04}")).with_label("seq", i.to_string()))
            .unwrap();
    }

    for i in 0..100 {
        let entry = queue.reader().next().unwrap().unwrap();
        assert_eq!(entry.record.data, format!("message-{i:04}").as_str());
        assert_eq!(entry.record.label("seq"), Some(i.to_string().as_str()));
        queue.reader().commit(entry.next).unwrap();
    }
    assert!(queue.reader().next().unwrap().is_none());

    queue.shutdown().unwrap();
}

#[test]
fn test_committed_records_are_not_redelivered() {
    let temp_dir = TempDir::new().unwrap();

    {
        let mut queue = QueueBuilder::new(temp_dir.path()).build().unwrap();
        queue
            .writer()
            .enqueue(&Record::new("x").with_label("tenant", "a"))
            .unwrap();
        queue
            .writer()
            .enqueue(&Record::new("y").with_label("tenant", "b"))
            .unwrap();

        let entry = queue.reader().next().unwrap().unwrap();
        assert_eq!(entry.record.data, "x");
        queue.reader().commit(entry.next).unwrap();
        // Dropped without shutdown.
    }

    let mut queue = QueueBuilder::new(temp_dir.path()).build().unwrap();
    let entry = queue.reader().next().unwrap().unwrap();
    assert_eq!(entry.record.data, "y");
    assert_eq!(entry.record.label("tenant"), Some("b"));
    assert!(queue.reader().next().unwrap().is_none());
}

#[test]
fn test_uncommitted_records_are_redelivered() {
    let temp_dir = TempDir::new().unwrap();

    {
        let mut queue = QueueBuilder::new(temp_dir.path()).build().unwrap();
        for i in 0..5 {
            queue.writer().enqueue(&Record::new(format!("r{i}"))).unwrap();
        }
        let first = queue.reader().next().unwrap().unwrap();
        queue.reader().commit(first.next).unwrap();
        // Read the rest but never acknowledge them.
        while queue.reader().next().unwrap().is_some() {}
        queue.shutdown().unwrap();
    }

    let mut queue = QueueBuilder::new(temp_dir.path()).build().unwrap();
    let mut seen = Vec::new();
    while let Some(entry) = queue.reader().next().unwrap() {
        seen.push(entry.record.data);
    }
    assert_eq!(seen, ["r1", "r2", "r3", "r4"]);
}

#[test]
fn test_rotation_keeps_order_and_segments_stay_scannable() {
    let temp_dir = TempDir::new().unwrap();
    let mut queue = QueueBuilder::new(temp_dir.path())
        .max_segment_size(1024)
        .max_record_size(512)
        .roll_strategy(RollStrategy::BySize(1024))
        .build()
        .unwrap();

    for i in 0..60 {
        queue
            .writer()
            .enqueue(&Record::new(vec![i as u8; 80]).with_label("i", i.to_string()))
            .unwrap();
    }
    queue.writer().flush().unwrap();

    let files = segment_files(temp_dir.path());
    assert!(files.len() > 3, "expected several segments, got {}", files.len());

    let mut frames = 0;
    for path in &files {
        assert!(std::fs::metadata(path).unwrap().len() <= 1024);
        let mut reader = SegmentReader::open(path).unwrap();
        for item in reader.scan_from(16).unwrap() {
            match item.unwrap() {
                ScanItem::Frame { .. } => frames += 1,
                ScanItem::Corrupt { offset, error } => {
                    panic!("{} corrupt at {offset}: {error}", path.display())
                }
            }
        }
    }
    assert_eq!(frames, 60);

    for i in 0..60 {
        let entry = queue.reader().next().unwrap().unwrap();
        assert_eq!(entry.record.label("i"), Some(i.to_string().as_str()));
    }
    assert!(queue.reader().next().unwrap().is_none());
}

#[test]
fn test_torn_tail_is_truncated_on_reopen() {
    let temp_dir = TempDir::new().unwrap();

    {
        let mut queue = QueueBuilder::new(temp_dir.path()).build().unwrap();
        for i in 0..10 {
            queue.writer().enqueue(&Record::new(format!("r{i}"))).unwrap();
        }
        queue.shutdown().unwrap();
    }

    let path = segment_files(temp_dir.path()).pop().unwrap();
    let len = std::fs::metadata(&path).unwrap().len();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(len - 3)
        .unwrap();

    let mut queue = QueueBuilder::new(temp_dir.path()).build().unwrap();
    assert_eq!(queue.recovery_report().frames_found, 9);
    assert!(queue.recovery_report().bytes_truncated > 0);

    queue.writer().enqueue(&Record::new("after")).unwrap();

    let mut seen = Vec::new();
    while let Some(entry) = queue.reader().next().unwrap() {
        seen.push(entry.record.data);
    }
    assert_eq!(seen.len(), 10);
    assert_eq!(seen[8], "r8");
    assert_eq!(seen[9], "after");
}

#[test]
fn test_queue_full_until_consumed() {
    let temp_dir = TempDir::new().unwrap();
    let mut queue = QueueBuilder::new(temp_dir.path())
        .max_segment_size(1024)
        .max_record_size(512)
        .max_total_size(4096)
        .build()
        .unwrap();

    let record = Record::new(vec![7u8; 100]);
    let mut accepted = 0;
    let err = loop {
        match queue.writer().enqueue(&record) {
            Ok(_) => accepted += 1,
            Err(e) => break e,
        }
        assert!(accepted < 1000, "queue never filled up");
    };
    assert!(matches!(err, QueueError::QueueFull { .. }));
    assert!(err.is_capacity());
    assert!(queue.stats().total_bytes <= 4096);

    for _ in 0..accepted {
        let entry = queue.reader().next().unwrap().unwrap();
        queue.reader().commit(entry.next).unwrap();
    }

    queue.writer().enqueue(&record).unwrap();
}

#[test]
fn test_two_segment_limit_recovers_after_full_drain() {
    let temp_dir = TempDir::new().unwrap();
    let mut queue = QueueBuilder::new(temp_dir.path())
        .max_segment_size(1024)
        .max_record_size(512)
        .max_total_size(2048)
        .build()
        .unwrap();
    let record = Record::new(vec![3u8; 200]);

    for round in 0..5 {
        let mut accepted = 0;
        loop {
            match queue.writer().enqueue(&record) {
                Ok(_) => accepted += 1,
                Err(e) => {
                    assert!(e.is_capacity(), "round {round}: {e}");
                    break;
                }
            }
            assert!(accepted < 100, "queue never filled up");
        }
        assert!(accepted > 0, "round {round} accepted nothing");
        assert!(queue.stats().total_bytes <= 2048);

        while let Some(entry) = queue.reader().next().unwrap() {
            queue.reader().commit(entry.next).unwrap();
        }
        assert_eq!(queue.stats().pending_bytes, 0);
    }
}

#[test]
fn test_crash_with_torn_tail_keeps_committed_prefix() {
    let temp_dir = TempDir::new().unwrap();
    let mut positions = Vec::new();

    {
        let mut queue = QueueBuilder::new(temp_dir.path())
            .flush_mode(FlushMode::Async)
            .build()
            .unwrap();
        for i in 0..6 {
            positions.push(queue.writer().enqueue(&Record::new(format!("r{i}"))).unwrap());
        }
        for _ in 0..2 {
            let entry = queue.reader().next().unwrap().unwrap();
            queue.reader().commit(entry.next).unwrap();
        }
        // Process dies: no shutdown, no drop.
        std::mem::forget(queue);
    }

    let path = segment_files(temp_dir.path()).pop().unwrap();
    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(positions[5].offset + 3)
        .unwrap();

    let mut queue = QueueBuilder::new(temp_dir.path()).build().unwrap();
    assert_eq!(queue.recovery_report().read_position, positions[2]);
    assert_eq!(queue.recovery_report().bytes_truncated, 3);

    let mut seen = Vec::new();
    while let Some(entry) = queue.reader().next().unwrap() {
        seen.push(entry.record.data);
    }
    assert_eq!(seen, ["r2", "r3", "r4"]);
}

#[test]
fn test_consumed_segments_are_retired() {
    let temp_dir = TempDir::new().unwrap();
    let mut queue = QueueBuilder::new(temp_dir.path())
        .max_segment_size(1024)
        .max_record_size(512)
        .build()
        .unwrap();

    for _ in 0..40 {
        queue.writer().enqueue(&Record::new(vec![1u8; 100])).unwrap();
    }
    let before = segment_files(temp_dir.path()).len();
    assert!(before > 2);

    while let Some(entry) = queue.reader().next().unwrap() {
        queue.reader().commit(entry.next).unwrap();
    }

    let stats = queue.stats();
    assert_eq!(segment_files(temp_dir.path()).len(), 1);
    assert_eq!(stats.segments.len(), 1);
    assert_eq!(stats.segments[0].1.state, SegmentState::Active);
    assert_eq!(stats.pending_bytes, 0);
}

#[test]
fn test_producer_and_consumer_threads() {
    let temp_dir = TempDir::new().unwrap();
    let queue = QueueBuilder::new(temp_dir.path())
        .max_segment_size(64 * 1024)
        .max_record_size(1024)
        .flush_mode(FlushMode::Async)
        .build()
        .unwrap();
    let (mut writer, mut reader) = queue.split();

    let producer = thread::spawn(move || {
        for i in 0..2000u32 {
            writer
                .enqueue(&Record::new(i.to_be_bytes().to_vec()))
                .unwrap();
        }
        writer.close().unwrap();
    });

    let mut expected = 0u32;
    while expected < 2000 {
        let Some(entry) = reader.next_timeout(Duration::from_secs(5)).unwrap() else {
            panic!("consumer starved at record {expected}");
        };
        assert_eq!(entry.record.data.as_ref(), expected.to_be_bytes());
        reader.commit(entry.next).unwrap();
        expected += 1;
    }

    producer.join().unwrap();
    assert!(reader.next().unwrap().is_none());
    assert_eq!(reader.lag_bytes(), 0);
}
