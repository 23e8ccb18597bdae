//! Indexer — one pass over the source, external merge sort, blocked output.
//!
//! # Pipeline
//!
//! ```text
//! mmap ──▶ range partition ──▶ N scan workers ──▶ sorted runs ──▶ spills
//!                                   │                              │
//!                                   └── bounded run queue ─────────┤
//!                                                                  ▼
//!                                                        k-way heap merge
//!                                                                  │
//!                                     bloom ◀── unique keys ───────┤
//!                                                                  ▼
//!                                                  blocks ──▶ .cidx (+footer)
//! ```
//!
//! Workers scan disjoint byte ranges aligned to record boundaries.  A full
//! run is sorted and spilled to a temp file; each worker's final partial run
//! travels through a bounded queue to the merger, and a worker that finds
//! the queue full spills that run too.  The merge is a single thread over a
//! binary min-heap; ties break by source offset because record ordering
//! already includes it.
//!
//! All outputs are written as `<name>.tmp` and renamed into place after
//! fsync, so a crash or failure leaves any previous index intact.

use crossbeam_channel::{bounded, Sender};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::block::{BlockWriter, DEFAULT_BLOCK_RECORDS, TARGET_BLOCK_BYTES};
use crate::bloom::Bloom;
use crate::error::{Error, Result};
use crate::meta::{self, ColumnStats, IndexMeta};
use crate::record::{IndexRecord, COMPOSITE_SEP, RECORD_LEN};
use crate::scan;
use crate::source::{self, Source, RECORD_SEP};

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// One entry per index to build; an entry with several names is a
    /// composite index.
    pub columns:   Vec<Vec<String>>,
    pub separator: u8,
    pub workers:   usize,
    pub memory_mb: usize,
    pub bloom_fp:  f64,
    /// Rebuild even when the existing meta says the source changed.
    pub force:     bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            columns:   Vec::new(),
            separator: b',',
            workers:   std::thread::available_parallelism().map_or(4, |n| n.get()),
            memory_mb: 256,
            bloom_fp:  0.01,
            force:     false,
        }
    }
}

#[derive(Debug)]
pub struct IndexReport {
    pub total_rows:     u64,
    pub malformed_rows: u64,
    /// `(column key, records indexed, blocks written)` per index.
    pub indexes:        Vec<(String, u64, usize)>,
}

// ── Indexer ──────────────────────────────────────────────────────────────────

pub struct Indexer {
    opts: IndexOptions,
    stop: Arc<AtomicBool>,
}

/// A worker's in-memory run for one index, delivered through the run queue.
struct FinalRun {
    colset:  usize,
    records: Vec<IndexRecord>,
}

/// What one scan worker produced besides the runs it queued.
struct WorkerOutput {
    spills:    Vec<Vec<PathBuf>>, // per colset
    rows:      u64,
    malformed: u64,
}

impl Indexer {
    pub fn new(opts: IndexOptions) -> Self {
        Self { opts, stop: Arc::new(AtomicBool::new(false)) }
    }

    /// Shared flag that cancels the pipeline between records.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn build(&self, source_path: &Path) -> Result<IndexReport> {
        let source = Source::open(source_path)?;
        let previous_meta = IndexMeta::load(source_path)?;

        let colsets: Vec<Vec<String>> = if !self.opts.columns.is_empty() {
            self.opts.columns.clone()
        } else {
            // No explicit columns: refresh everything the meta lists.
            let meta = previous_meta.as_ref().ok_or_else(|| {
                Error::Protocol("no columns given and no meta file to refresh from".into())
            })?;
            meta.columns
                .keys()
                .map(|k| k.split('+').map(str::to_owned).collect())
                .collect()
        };

        if let Some(ref prev) = previous_meta {
            if let Some(why) = prev.staleness(&source) {
                if !self.opts.force {
                    return Err(Error::SourceStale(why));
                }
                debug!(%why, "rebuilding stale index under --force");
            }
        }

        let header = source.header_columns(self.opts.separator)?;
        let col_indices: Vec<Vec<usize>> = colsets
            .iter()
            .map(|cols| {
                cols.iter()
                    .map(|name| {
                        header
                            .iter()
                            .position(|h| h == name)
                            .ok_or_else(|| Error::UnknownColumn(name.clone()))
                    })
                    .collect()
            })
            .collect::<Result<_>>()?;

        // Everything below writes through this guard; on success the renames
        // happen first and the guard only sweeps leftovers.
        let mut cleanup = CleanupGuard::default();
        let result = self.run_pipeline(&source, &colsets, &col_indices, &mut cleanup);
        if let Ok(ref report) = result {
            info!(
                rows = report.total_rows,
                malformed = report.malformed_rows,
                indexes = report.indexes.len(),
                "index build complete"
            );
        }
        result
    }

    fn run_pipeline(
        &self,
        source: &Source,
        colsets: &[Vec<String>],
        col_indices: &[Vec<usize>],
        cleanup: &mut CleanupGuard,
    ) -> Result<IndexReport> {
        let sep = self.opts.separator;
        let data = source.data();
        let data_start = source.data_start() as usize;
        let workers = self.opts.workers.max(1);

        let ranges = partition_ranges(data, data_start, workers);

        // Phase A: newline counts per range give each worker its global
        // starting line number (header is line 1).
        let range_rows: Vec<u64> = std::thread::scope(|s| {
            let handles: Vec<_> = ranges
                .iter()
                .map(|&(start, end)| {
                    s.spawn(move || scan::count_separators(&data[start..end], RECORD_SEP) as u64)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let mut line_bases = Vec::with_capacity(ranges.len());
        let mut base = 2i64;
        for rows in &range_rows {
            line_bases.push(base);
            base += *rows as i64;
        }

        let run_cap = (self.opts.memory_mb.max(1) * 1024 * 1024
            / workers
            / colsets.len().max(1)
            / RECORD_LEN)
            .max(1024);

        // Phase B: scan.  Final runs flow through a bounded queue sized for
        // one run per (worker, index); a full queue forces a spill instead.
        let (run_tx, run_rx) = bounded::<FinalRun>(workers * colsets.len());
        let stop: &AtomicBool = &self.stop;
        let outputs: Vec<Result<WorkerOutput>> = std::thread::scope(|s| {
            let handles: Vec<_> = ranges
                .iter()
                .zip(&line_bases)
                .enumerate()
                .map(|(wid, (&(start, end), &line_base))| {
                    let tx = run_tx.clone();
                    s.spawn(move || {
                        scan_range(ScanJob {
                            worker: wid,
                            data,
                            start,
                            end,
                            line_base,
                            sep,
                            col_indices,
                            run_cap,
                            run_tx: tx,
                            stop,
                        })
                    })
                })
                .collect();
            drop(run_tx);
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut mem_runs: Vec<Vec<Vec<IndexRecord>>> = vec![Vec::new(); colsets.len()];
        for run in run_rx.try_iter() {
            mem_runs[run.colset].push(run.records);
        }

        let mut spills: Vec<Vec<PathBuf>> = vec![Vec::new(); colsets.len()];
        let mut total_rows = 0u64;
        let mut malformed_rows = 0u64;
        for out in outputs {
            let out = out?;
            total_rows += out.rows;
            malformed_rows += out.malformed;
            for (ci, paths) in out.spills.into_iter().enumerate() {
                for p in paths {
                    cleanup.add(p.clone());
                    spills[ci].push(p);
                }
            }
        }

        // Phase C: merge each index's runs into its blocked, bloomed output.
        let mut new_meta = IndexMeta::capture(source)?;
        new_meta.total_rows = total_rows;
        new_meta.malformed_rows = malformed_rows;

        let mut report_indexes = Vec::with_capacity(colsets.len());
        for (ci, cols) in colsets.iter().enumerate() {
            let key = meta::column_key(cols);
            let record_total: u64 = spills[ci]
                .iter()
                .map(|p| spill_record_count(p))
                .sum::<Result<u64>>()?
                + mem_runs[ci].iter().map(|r| r.len() as u64).sum::<u64>();

            let (blocks, distinct) = self.merge_colset(
                source.path(),
                cols,
                std::mem::take(&mut spills[ci]),
                std::mem::take(&mut mem_runs[ci]),
                record_total,
                cleanup,
            )?;

            let index_size = std::fs::metadata(meta::index_path(source.path(), cols))?.len();
            new_meta
                .columns
                .insert(key.clone(), ColumnStats { distinct_count: distinct, file_size: index_size });
            report_indexes.push((key, record_total, blocks));
        }

        new_meta.save(source.path())?;

        Ok(IndexReport {
            total_rows,
            malformed_rows,
            indexes: report_indexes,
        })
    }

    /// K-way merge of one index's spills and in-memory runs into
    /// `<csv>_<col>.cidx` + `.bloom`.  Returns (block count, distinct keys).
    fn merge_colset(
        &self,
        source_path: &Path,
        cols: &[String],
        spills: Vec<PathBuf>,
        mem_runs: Vec<Vec<IndexRecord>>,
        record_total: u64,
        cleanup: &mut CleanupGuard,
    ) -> Result<(usize, u64)> {
        let index_final = meta::index_path(source_path, cols);
        let bloom_final = meta::bloom_path(source_path, cols);
        let index_tmp = index_final.with_extension("cidx.tmp");
        let bloom_tmp = bloom_final.with_extension("bloom.tmp");
        cleanup.add(index_tmp.clone());
        cleanup.add(bloom_tmp.clone());

        let mut sources: Vec<MergeSource> = Vec::with_capacity(spills.len() + mem_runs.len());
        for path in &spills {
            sources.push(MergeSource::Spill(BufReader::new(File::open(path)?)));
        }
        for run in mem_runs {
            sources.push(MergeSource::Mem(run.into_iter()));
        }

        let mut heap: BinaryHeap<Reverse<(IndexRecord, usize)>> = BinaryHeap::new();
        for (i, src) in sources.iter_mut().enumerate() {
            if let Some(rec) = src.next()? {
                heap.push(Reverse((rec, i)));
            }
        }

        let mut bloom = Bloom::with_capacity(record_total as usize, self.opts.bloom_fp);
        let mut writer = BlockWriter::new(BufWriter::new(File::create(&index_tmp)?))?;
        let mut block: Vec<IndexRecord> = Vec::with_capacity(DEFAULT_BLOCK_RECORDS);
        let mut block_records = DEFAULT_BLOCK_RECORDS;
        let mut prev_key: Option<[u8; 64]> = None;
        let mut distinct = 0u64;

        while let Some(Reverse((rec, src_idx))) = heap.pop() {
            if self.stop.load(Ordering::Relaxed) {
                return Err(Error::Canceled);
            }
            let key_changed = prev_key != Some(rec.key);
            if key_changed {
                bloom.insert(rec.key_trimmed());
                distinct += 1;
                prev_key = Some(rec.key);
            }
            // Flush at a key boundary so a duplicate run stays within one
            // block; the hard cap bounds pathological runs.
            if (block.len() >= block_records && key_changed)
                || block.len() >= block_records * 4
            {
                writer.write_block(&block)?;
                block.clear();
                block_records = adapt_block_records(block_records, writer.last_block_len());
            }
            block.push(rec);
            if let Some(next) = sources[src_idx].next()? {
                heap.push(Reverse((next, src_idx)));
            }
        }
        if !block.is_empty() {
            writer.write_block(&block)?;
        }

        let (buf, blocks) = writer.finish()?;
        let file = buf
            .into_inner()
            .map_err(|e| Error::Internal(format!("index flush: {e}")))?;
        file.sync_all().map_err(map_space)?;
        std::fs::rename(&index_tmp, &index_final)?;

        let bloom_file = File::create(&bloom_tmp)?;
        let mut bloom_buf = BufWriter::new(bloom_file);
        bloom.write_to(&mut bloom_buf)?;
        bloom_buf.flush()?;
        bloom_buf
            .into_inner()
            .map_err(|e| Error::Internal(format!("bloom flush: {e}")))?
            .sync_all()
            .map_err(map_space)?;
        std::fs::rename(&bloom_tmp, &bloom_final)?;

        for path in &spills {
            let _ = std::fs::remove_file(path);
        }
        debug!(
            index = %index_final.display(),
            blocks = blocks.len(),
            distinct,
            "index written"
        );
        Ok((blocks.len(), distinct))
    }
}

// ── Range partitioning ───────────────────────────────────────────────────────

/// Split `data[data_start..]` into up to `workers` ranges, each beginning at
/// a record start and ending just after a record terminator (or at EOF).
fn partition_ranges(data: &[u8], data_start: usize, workers: usize) -> Vec<(usize, usize)> {
    let len = data.len();
    if data_start >= len {
        return Vec::new();
    }
    let chunk = ((len - data_start) / workers).max(1);

    let mut bounds = vec![data_start];
    for i in 1..workers {
        let raw = data_start + i * chunk;
        if raw >= len {
            break;
        }
        // The record straddling `raw` belongs to the previous range.
        let aligned = match scan::find_first(&data[raw..], RECORD_SEP) {
            Some(idx) => raw + idx + 1,
            None => len,
        };
        if aligned > *bounds.last().unwrap() && aligned < len {
            bounds.push(aligned);
        }
    }
    bounds.push(len);

    bounds
        .windows(2)
        .filter(|w| w[1] > w[0])
        .map(|w| (w[0], w[1]))
        .collect()
}

// ── Scan worker ──────────────────────────────────────────────────────────────

struct ScanJob<'a> {
    worker:      usize,
    data:        &'a [u8],
    start:       usize,
    end:         usize,
    line_base:   i64,
    sep:         u8,
    col_indices: &'a [Vec<usize>],
    run_cap:     usize,
    run_tx:      Sender<FinalRun>,
    stop:        &'a AtomicBool,
}

fn scan_range(job: ScanJob<'_>) -> Result<WorkerOutput> {
    let n_sets = job.col_indices.len();
    let mut runs: Vec<Vec<IndexRecord>> = (0..n_sets)
        .map(|_| Vec::with_capacity(job.run_cap))
        .collect();
    let mut spills: Vec<Vec<PathBuf>> = vec![Vec::new(); n_sets];
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut key_buf: Vec<u8> = Vec::with_capacity(64);

    let mut rows = 0u64;
    let mut malformed = 0u64;
    let mut pos = job.start;
    let mut line = job.line_base;

    while pos < job.end {
        if job.stop.load(Ordering::Relaxed) {
            return Err(Error::Canceled);
        }
        let rest = &job.data[pos..job.end];
        let rec_len = match scan::find_first(rest, RECORD_SEP) {
            Some(i) => i + 1,
            None => rest.len(),
        };
        let record = &rest[..rec_len];
        rows += 1;

        fill_field_spans(record, job.sep, &mut spans);
        let max_needed = job
            .col_indices
            .iter()
            .flat_map(|set| set.iter().copied())
            .max()
            .unwrap_or(0);
        if spans.len() <= max_needed {
            malformed += 1;
            pos += rec_len;
            line += 1;
            continue;
        }

        for (ci, set) in job.col_indices.iter().enumerate() {
            key_buf.clear();
            for (i, &col) in set.iter().enumerate() {
                if i > 0 {
                    key_buf.push(COMPOSITE_SEP);
                }
                let (s, e) = spans[col];
                key_buf.extend_from_slice(&record[s..e]);
            }
            runs[ci].push(IndexRecord::new(&key_buf, pos as i64, line));

            if runs[ci].len() >= job.run_cap {
                let run = std::mem::replace(&mut runs[ci], Vec::with_capacity(job.run_cap));
                let seq = spills[ci].len();
                spills[ci].push(spill_run(job.worker, ci, seq, run)?);
            }
        }

        pos += rec_len;
        line += 1;
    }

    // Final partial runs go through the queue; spill if it is full.
    for (ci, mut run) in runs.into_iter().enumerate() {
        if run.is_empty() {
            continue;
        }
        run.sort_unstable();
        match job.run_tx.try_send(FinalRun { colset: ci, records: run }) {
            Ok(()) => {}
            Err(crossbeam_channel::TrySendError::Full(back)) => {
                let seq = spills[ci].len();
                spills[ci].push(spill_run(job.worker, ci, seq, back.records)?);
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                return Err(Error::Canceled);
            }
        }
    }

    Ok(WorkerOutput { spills, rows, malformed })
}

/// Field spans within a record, reusing the caller's buffer.
fn fill_field_spans(record: &[u8], sep: u8, spans: &mut Vec<(usize, usize)>) {
    spans.clear();
    let body = source::trim_record(record);
    let mut start = 0usize;
    for p in memchr::memchr_iter(sep, body) {
        spans.push((start, p));
        start = p + 1;
    }
    spans.push((start, body.len()));
}

// ── Spills ───────────────────────────────────────────────────────────────────

fn spill_path(worker: usize, colset: usize, seq: usize) -> PathBuf {
    std::env::temp_dir().join(format!(
        "csvquery_spill_{}_{worker}_{colset}_{seq}.run",
        std::process::id()
    ))
}

/// Sort a run and stream it to a temp file as bare 80-byte records.
fn spill_run(worker: usize, colset: usize, seq: usize, mut run: Vec<IndexRecord>) -> Result<PathBuf> {
    run.sort_unstable();
    let path = spill_path(worker, colset, seq);
    let file = File::create(&path)
        .map_err(|e| Error::SpillFull(format!("{}: {e}", path.display())))?;
    let mut w = BufWriter::new(file);
    let mut buf = [0u8; RECORD_LEN];
    for rec in &run {
        rec.encode_into(&mut buf);
        w.write_all(&buf).map_err(spill_write_error)?;
    }
    w.flush().map_err(spill_write_error)?;
    Ok(path)
}

fn spill_write_error(e: std::io::Error) -> Error {
    if e.raw_os_error() == Some(28) {
        // ENOSPC
        Error::OutOfSpace
    } else {
        Error::SpillFull(e.to_string())
    }
}

fn map_space(e: std::io::Error) -> Error {
    if e.raw_os_error() == Some(28) {
        Error::OutOfSpace
    } else {
        Error::SourceIo(e)
    }
}

fn spill_record_count(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)?.len() / RECORD_LEN as u64)
}

enum MergeSource {
    Spill(BufReader<File>),
    Mem(std::vec::IntoIter<IndexRecord>),
}

impl MergeSource {
    fn next(&mut self) -> Result<Option<IndexRecord>> {
        match self {
            MergeSource::Mem(it) => Ok(it.next()),
            MergeSource::Spill(rd) => {
                let mut buf = [0u8; RECORD_LEN];
                match rd.read_exact(&mut buf) {
                    Ok(()) => Ok(Some(IndexRecord::decode_from(&buf))),
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

/// Steer the records-per-block count toward the compressed-size target.
fn adapt_block_records(current: usize, last_len: Option<u64>) -> usize {
    match last_len {
        Some(len) if len as usize > TARGET_BLOCK_BYTES * 2 => (current / 2).max(64),
        Some(len) if (len as usize) < TARGET_BLOCK_BYTES / 2 => (current * 2).min(8192),
        _ => current,
    }
}

/// Removes any listed path that still exists when dropped.  Successful
/// outputs are renamed away before the guard fires, so only leftovers from a
/// failed run are swept.
#[derive(Default)]
struct CleanupGuard {
    paths: Vec<PathBuf>,
}

impl CleanupGuard {
    fn add(&mut self, path: PathBuf) {
        self.paths.push(path);
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::IndexReader;
    use crate::bloom::BloomMap;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn write_csv(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    fn build(path: &Path, columns: &[&[&str]], opts_fn: impl FnOnce(&mut IndexOptions)) -> IndexReport {
        let mut opts = IndexOptions {
            columns: columns
                .iter()
                .map(|set| set.iter().map(|s| s.to_string()).collect())
                .collect(),
            ..IndexOptions::default()
        };
        opts_fn(&mut opts);
        Indexer::new(opts).build(path).unwrap()
    }

    #[test]
    fn builds_a_sorted_complete_index() {
        let dir = TempDir::new().unwrap();
        let mut content = String::from("ID,STATUS\n");
        for i in 0..500 {
            content.push_str(&format!("{i},{}\n", if i % 3 == 0 { "active" } else { "inactive" }));
        }
        let csv = write_csv(&dir, "rows.csv", &content);

        let report = build(&csv, &[&["STATUS"]], |o| o.workers = 4);
        assert_eq!(report.total_rows, 500);
        assert_eq!(report.malformed_rows, 0);

        let reader = IndexReader::open(&meta::index_path(&csv, &["STATUS".into()])).unwrap();
        assert_eq!(reader.total_records(), 500);

        let mut all = Vec::new();
        for d in reader.blocks() {
            all.extend(reader.read_block(d).unwrap());
        }
        assert!(all.windows(2).all(|w| w[0] <= w[1]), "records must be sorted");

        // Every offset points at a row whose STATUS equals the key.
        let source = Source::open(&csv).unwrap();
        for rec in &all {
            let (row, _) = source.record_at(rec.offset as u64).unwrap();
            let status = source::field_at(row, b',', 1).unwrap();
            assert_eq!(status, rec.key_trimmed());
        }

        let bloom = BloomMap::open(&meta::bloom_path(&csv, &["STATUS".into()])).unwrap();
        assert!(bloom.might_contain(b"active"));
        assert!(bloom.might_contain(b"inactive"));

        let meta = IndexMeta::load(&csv).unwrap().unwrap();
        assert_eq!(meta.total_rows, 500);
        assert_eq!(meta.columns["STATUS"].distinct_count, 2);
    }

    #[test]
    fn spilling_produces_the_same_output() {
        let dir = TempDir::new().unwrap();
        let mut content = String::from("K,V\n");
        for i in (0..20_000).rev() {
            content.push_str(&format!("{i:05},{}\n", i % 10));
        }
        let csv = write_csv(&dir, "spill.csv", &content);

        // One MB over two workers caps each run at 6553 records, so every
        // worker spills before its final run.
        build(&csv, &[&["K"]], |o| {
            o.workers = 2;
            o.memory_mb = 1;
        });
        let reader = IndexReader::open(&meta::index_path(&csv, &["K".into()])).unwrap();
        assert_eq!(reader.total_records(), 20_000);
        let mut all = Vec::new();
        for d in reader.blocks() {
            all.extend(reader.read_block(d).unwrap());
        }
        assert!(all.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(all.first().unwrap().key_trimmed(), b"00000");
        assert_eq!(all.last().unwrap().key_trimmed(), b"19999");
    }

    #[test]
    fn composite_keys_join_with_unit_separator() {
        let dir = TempDir::new().unwrap();
        let csv = write_csv(
            &dir,
            "emp.csv",
            "NAME,DEPT,LEVEL\nana,ENG,3\nbob,OPS,1\ncyd,ENG,3\n",
        );
        build(&csv, &[&["DEPT", "LEVEL"]], |o| o.workers = 2);

        let cols = vec!["DEPT".to_string(), "LEVEL".to_string()];
        let reader = IndexReader::open(&meta::index_path(&csv, &cols)).unwrap();
        let records = reader.read_block(&reader.blocks()[0]).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key_trimmed(), b"ENG\x1F3");
        assert_eq!(records[2].key_trimmed(), b"OPS\x1F1");
    }

    #[test]
    fn malformed_rows_are_skipped_and_counted() {
        let dir = TempDir::new().unwrap();
        let csv = write_csv(&dir, "bad.csv", "A,B\n1,x\nonly-one-field\n2,y\n");
        let report = build(&csv, &[&["B"]], |o| o.workers = 1);
        assert_eq!(report.total_rows, 3);
        assert_eq!(report.malformed_rows, 1);

        let reader = IndexReader::open(&meta::index_path(&csv, &["B".into()])).unwrap();
        assert_eq!(reader.total_records(), 2);
    }

    #[test]
    fn unknown_column_fails() {
        let dir = TempDir::new().unwrap();
        let csv = write_csv(&dir, "cols.csv", "A,B\n1,2\n");
        let opts = IndexOptions {
            columns: vec![vec!["NOPE".into()]],
            ..IndexOptions::default()
        };
        assert!(matches!(
            Indexer::new(opts).build(&csv),
            Err(Error::UnknownColumn(c)) if c == "NOPE"
        ));
    }

    #[test]
    fn stale_source_fails_without_force() {
        let dir = TempDir::new().unwrap();
        let csv = write_csv(&dir, "stale.csv", "A\n1\n2\n");
        build(&csv, &[&["A"]], |o| o.workers = 1);

        let mut f = std::fs::OpenOptions::new().append(true).open(&csv).unwrap();
        f.write_all(b"3\n").unwrap();
        drop(f);

        let opts = IndexOptions {
            columns: vec![vec!["A".into()]],
            workers: 1,
            ..IndexOptions::default()
        };
        assert!(matches!(Indexer::new(opts).build(&csv), Err(Error::SourceStale(_))));

        let forced = IndexOptions {
            columns: vec![vec!["A".into()]],
            workers: 1,
            force: true,
            ..IndexOptions::default()
        };
        let report = Indexer::new(forced).build(&csv).unwrap();
        assert_eq!(report.total_rows, 3);
    }

    #[test]
    fn rebuild_is_byte_identical_except_meta_timestamp() {
        let dir = TempDir::new().unwrap();
        let mut content = String::from("ID,V\n");
        for i in 0..300 {
            content.push_str(&format!("{i},{}\n", i % 7));
        }
        let csv = write_csv(&dir, "idem.csv", &content);

        build(&csv, &[&["V"]], |o| o.workers = 3);
        let idx1 = std::fs::read(meta::index_path(&csv, &["V".into()])).unwrap();
        let bloom1 = std::fs::read(meta::bloom_path(&csv, &["V".into()])).unwrap();

        build(&csv, &[&["V"]], |o| o.workers = 3);
        let idx2 = std::fs::read(meta::index_path(&csv, &["V".into()])).unwrap();
        let bloom2 = std::fs::read(meta::bloom_path(&csv, &["V".into()])).unwrap();

        assert_eq!(idx1, idx2);
        assert_eq!(bloom1, bloom2);
    }

    #[test]
    fn refresh_without_columns_uses_meta() {
        let dir = TempDir::new().unwrap();
        let csv = write_csv(&dir, "refresh.csv", "A,B\n1,x\n2,y\n");
        build(&csv, &[&["B"]], |o| o.workers = 1);

        // No columns: the meta drives the rebuild (source unchanged).
        let opts = IndexOptions { workers: 1, ..IndexOptions::default() };
        let report = Indexer::new(opts).build(&csv).unwrap();
        assert_eq!(report.indexes.len(), 1);
        assert_eq!(report.indexes[0].0, "B");
    }
}
