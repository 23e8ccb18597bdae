//! Query executor — candidate offsets from indexes, rows from the source.
//!
//! A query is planned per predicate node: indexable leaves scan their chosen
//! index (bloom prune, footer binary search, block decode, in-block search);
//! `AND` intersects per-leaf offset sets and post-filters the leaves no
//! index can answer; `OR` unions.  When nothing is indexable the executor
//! falls back to a full scan in source order — the same routine doubles as
//! the reference implementation the property tests compare against.
//!
//! Results flow through a [`RowSink`] as they are produced: warning lines
//! first, then `(offset, length)` pairs, length including the record
//! terminator.  Single-leaf and full-scan plans emit block by block without
//! materializing the result; `AND`/`OR` plans materialize their candidate
//! sets (the intersection needs them whole) and then drain through the sink.
//! Natural order is the chosen index's key order; `ORDER BY` re-sorts only
//! when the stream is not already in the requested order.
//!
//! Every block read and every scan stride checks the per-query [`Ctx`]: a
//! passed deadline or a raised cancel flag (the connection owner's view of a
//! gone client) aborts after the current block with no partial state kept.

use serde_json::Value;
use std::cell::Cell;
use std::cmp::Ordering;
use std::path::Path;
use std::sync::atomic::{self, AtomicBool};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::block::{BlockDescriptor, IndexReader};
use crate::bloom::BloomMap;
use crate::error::{Error, Result};
use crate::meta::{self, IndexMeta};
use crate::planner::{self, Access, AccessBound, IndexInfo};
use crate::predicate::{compare_values, CmpOp, Predicate, Row};
use crate::record::KEY_LEN;
use crate::source::{self, Source};

// ── Requests ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub desc:   bool,
}

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub predicate: Option<Predicate>,
    pub limit:     Option<usize>,
    pub offset:    usize,
    pub order_by:  Option<OrderBy>,
    /// Fail with `NoUsableIndex` instead of falling back to a full scan.
    pub strict:    bool,
    pub deadline:  Option<Instant>,
    /// Raised by the connection owner when the client goes away; the query
    /// aborts after the current block.
    pub cancel:    Option<Arc<AtomicBool>>,
}

impl QueryRequest {
    /// Parse the body shared by the `query` and `count` wire commands.
    pub fn from_json(v: &Value) -> Result<Self> {
        let obj = v
            .as_object()
            .ok_or_else(|| Error::Protocol("request must be an object".into()))?;

        let predicate = match obj.get("where") {
            None | Some(Value::Null) => None,
            Some(w) => Some(Predicate::from_json(w)?),
        };
        let limit = match obj.get("limit") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .ok_or_else(|| Error::Protocol("\"limit\" must be a non-negative integer".into()))?
                    as usize,
            ),
        };
        let offset = match obj.get("offset") {
            None | Some(Value::Null) => 0,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| Error::Protocol("\"offset\" must be a non-negative integer".into()))?
                as usize,
        };
        let order_by = match obj.get("orderBy") {
            None | Some(Value::Null) => None,
            Some(Value::String(col)) => Some(OrderBy { column: col.clone(), desc: false }),
            Some(Value::Object(o)) => {
                let column = o
                    .get("column")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Protocol("\"orderBy\" needs a \"column\"".into()))?
                    .to_owned();
                let desc = o.get("desc").and_then(Value::as_bool).unwrap_or(false);
                Some(OrderBy { column, desc })
            }
            Some(_) => return Err(Error::Protocol("\"orderBy\" must be a string or object".into())),
        };
        let strict = obj.get("strict").and_then(Value::as_bool).unwrap_or(false);

        Ok(Self { predicate, limit, offset, order_by, strict, deadline: None, cancel: None })
    }
}

// ── Response sinks ───────────────────────────────────────────────────────────

/// Receives the response stream as the executor produces it: warnings first,
/// then one call per matching row, in plan order.  A sink error (a client
/// that stopped listening, typically) propagates and stops the scan.
pub trait RowSink {
    fn warning(&mut self, message: &str) -> Result<()> {
        let _ = message;
        Ok(())
    }
    fn row(&mut self, offset: u64, length: u64) -> Result<()>;
}

#[derive(Debug)]
pub struct QueryStats {
    pub rows:        u64,
    pub blocks_read: u64,
}

#[derive(Debug)]
pub struct QueryResult {
    pub rows:        Vec<(u64, u64)>,
    pub warnings:    Vec<String>,
    pub blocks_read: u64,
}

#[derive(Debug)]
pub struct CountResult {
    pub count:       u64,
    pub warnings:    Vec<String>,
    pub blocks_read: u64,
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// One loaded index: footer-backed reader plus its bloom sidecar.
pub struct IndexHandle {
    pub key:    String,
    pub reader: IndexReader,
    pub bloom:  Option<BloomMap>,
}

pub struct Engine {
    source:  Source,
    sep:     u8,
    header:  Vec<String>,
    meta:    Option<IndexMeta>,
    handles: Vec<IndexHandle>,
    infos:   Vec<IndexInfo>,
}

impl Engine {
    /// Open the source and every `(index, bloom)` pair the meta lists.  A
    /// triple with a missing or unreadable member is treated as absent.
    pub fn open(path: &Path, sep: u8) -> Result<Self> {
        let source = Source::open(path)?;
        let header = source.header_columns(sep)?;
        let meta = IndexMeta::load(path)?;

        let mut handles = Vec::new();
        let mut infos = Vec::new();
        if let Some(ref m) = meta {
            for (key, stats) in &m.columns {
                let columns: Vec<String> = key.split('+').map(str::to_owned).collect();
                let index_path = meta::index_path(path, &columns);
                let bloom_path = meta::bloom_path(path, &columns);
                if !index_path.exists() || !bloom_path.exists() {
                    warn!(index = %key, "index or bloom file missing, treating as absent");
                    continue;
                }
                let reader = match IndexReader::open(&index_path) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(index = %key, error = %e, "unreadable index, treating as absent");
                        continue;
                    }
                };
                let bloom = match BloomMap::open(&bloom_path) {
                    Ok(b) => Some(b),
                    Err(e) => {
                        warn!(index = %key, error = %e, "unreadable bloom, treating as absent");
                        continue;
                    }
                };
                infos.push(IndexInfo {
                    columns,
                    block_count:    reader.blocks().len(),
                    distinct_count: stats.distinct_count,
                });
                handles.push(IndexHandle { key: key.clone(), reader, bloom });
            }
        }
        debug!(indexes = handles.len(), "engine opened");
        Ok(Self { source, sep, header, meta, handles, infos })
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn index_keys(&self) -> Vec<&str> {
        self.handles.iter().map(|h| h.key.as_str()).collect()
    }

    fn stale_warning(&self) -> Option<String> {
        self.meta
            .as_ref()
            .and_then(|m| m.staleness(&self.source))
            .map(|why| format!("SourceStale: {why}"))
    }

    // ── Query ────────────────────────────────────────────────────────────────

    /// Run the query, pushing warnings and rows into `sink` as the plan
    /// produces them.  OFFSET/LIMIT apply at the sink boundary.
    pub fn query_stream(&self, req: &QueryRequest, sink: &mut dyn RowSink) -> Result<QueryStats> {
        let ctx = Ctx::for_request(req);
        ctx.check_live()?;

        let mut pager = Pager { sink, skip: req.offset, taken: 0, limit: req.limit };
        if let Some(w) = self.stale_warning() {
            pager.warn(&w)?;
        }

        match req.predicate {
            None => self.emit_all(None, &req.order_by, &ctx, &mut pager)?,
            Some(ref pred) => {
                let leaf_access = match pred {
                    Predicate::And(_) | Predicate::Or(_) => None,
                    leaf => planner::plan_leaf(leaf, &self.infos),
                };
                match leaf_access {
                    // The index's own order satisfies the request: stream
                    // straight off the blocks.
                    Some(access)
                        if order_satisfied(
                            &req.order_by,
                            &natural_column(&access, &self.infos),
                        ) =>
                    {
                        let verify = needs_verify(&access.bound);
                        self.scan_access(&access, &ctx, &mut |offset, length| {
                            if verify && !self.row_matches_all(offset, &[pred]) {
                                return Ok(());
                            }
                            pager.push(offset, length)
                        })?;
                    }
                    _ => match self.candidates(pred, &ctx)? {
                        Some(set) => {
                            let mut rows = set.rows;
                            if let Some(ref order) = req.order_by {
                                if !order_satisfied(&req.order_by, &set.natural) {
                                    self.sort_rows(&mut rows, order)?;
                                }
                            }
                            for (offset, length) in rows {
                                pager.push(offset, length)?;
                            }
                        }
                        None => {
                            if req.strict {
                                return Err(Error::NoUsableIndex(format!(
                                    "columns {:?} have no usable index",
                                    pred.columns()
                                )));
                            }
                            pager.warn(&format!(
                                "NoUsableIndex: columns {:?}, falling back to full scan",
                                pred.columns()
                            ))?;
                            self.emit_all(Some(pred), &req.order_by, &ctx, &mut pager)?;
                        }
                    },
                }
            }
        }

        Ok(QueryStats { rows: pager.taken, blocks_read: ctx.blocks_read.get() })
    }

    /// Convenience wrapper collecting the stream into a [`QueryResult`].
    pub fn query(&self, req: &QueryRequest) -> Result<QueryResult> {
        let mut collect = Collect::default();
        let stats = self.query_stream(req, &mut collect)?;
        Ok(QueryResult {
            rows:        collect.rows,
            warnings:    collect.warnings,
            blocks_read: stats.blocks_read,
        })
    }

    /// Full scan with optional re-sort, streamed when source order is enough.
    fn emit_all(
        &self,
        pred: Option<&Predicate>,
        order: &Option<OrderBy>,
        ctx: &Ctx,
        pager: &mut Pager<'_>,
    ) -> Result<()> {
        match order {
            None => self.full_scan_stream(pred, ctx, &mut |o, l| pager.push(o, l)),
            Some(ob) => {
                let mut rows = self.full_scan(pred, ctx)?;
                self.sort_rows(&mut rows, ob)?;
                for (o, l) in rows {
                    pager.push(o, l)?;
                }
                Ok(())
            }
        }
    }

    /// Match count, ignoring limit/offset/order.  A single equality on an
    /// indexed column can often be answered from the footer alone.
    pub fn count(&self, req: &QueryRequest) -> Result<CountResult> {
        let ctx = Ctx::for_request(req);
        ctx.check_live()?;
        let mut warnings = Vec::new();
        if let Some(w) = self.stale_warning() {
            warnings.push(w);
        }

        if let Some(Predicate::Cmp { op: CmpOp::Eq, ref column, ref value }) = req.predicate {
            if let Some(count) = self.footer_only_count(column, value.as_bytes()) {
                return Ok(CountResult { count, warnings, blocks_read: 0 });
            }
        }

        let count = match req.predicate {
            Some(ref pred) => match self.candidates(pred, &ctx)? {
                Some(set) => set.rows.len() as u64,
                None => {
                    if req.strict {
                        return Err(Error::NoUsableIndex(format!(
                            "columns {:?} have no usable index",
                            pred.columns()
                        )));
                    }
                    self.full_scan(Some(pred), &ctx)?.len() as u64
                }
            },
            None => match self.meta {
                // Row total is already captured; a bare count needs no scan.
                Some(ref m) if self.stale_warning().is_none() => m.total_rows,
                _ => self.full_scan(None, &ctx)?.len() as u64,
            },
        };
        Ok(CountResult { count, warnings, blocks_read: ctx.blocks_read.get() })
    }

    /// Footer-only equality count.  Exact when the key opens a distinct
    /// block whose neighbors prove no duplicate run straddles into it; the
    /// indexer extends blocks across duplicate runs to make that common.
    fn footer_only_count(&self, column: &str, value: &[u8]) -> Option<u64> {
        let idx = self
            .infos
            .iter()
            .position(|i| i.columns.len() == 1 && i.columns[0] == column)?;
        let handle = &self.handles[idx];
        let key = &value[..value.len().min(KEY_LEN)];

        if let Some(ref bloom) = handle.bloom {
            if !bloom.might_contain(key) {
                return Some(0);
            }
        }
        let blocks = handle.reader.blocks();
        if blocks.is_empty() {
            return Some(0);
        }
        if key < blocks[0].start_key.as_bytes() {
            return Some(0);
        }

        // The block that opens with this exact key proves the key present.
        // Distinct neighbors rule out a duplicate run straddling into it.
        let i = blocks.partition_point(|b| b.start_key.as_bytes() < key);
        if i == blocks.len() || blocks[i].start_key.as_bytes() != key {
            return None;
        }
        let prev_ok = i == 0 || blocks[i - 1].is_distinct;
        let next_ok = i + 1 == blocks.len() || blocks[i + 1].start_key.as_bytes() != key;
        if blocks[i].is_distinct && prev_ok && next_ok {
            return Some(1);
        }
        None
    }

    // ── Candidate generation ─────────────────────────────────────────────────

    fn candidates(&self, pred: &Predicate, ctx: &Ctx) -> Result<Option<CandidateSet>> {
        match pred {
            Predicate::And(children) => self.candidates_and(children, ctx),
            Predicate::Or(children) => {
                let mut sets = Vec::with_capacity(children.len());
                for child in children {
                    match self.candidates(child, ctx)? {
                        Some(set) => sets.push(set.rows),
                        None => return Ok(None),
                    }
                }
                Ok(Some(CandidateSet { rows: union(sets), natural: None }))
            }
            leaf => {
                let access = match planner::plan_leaf(leaf, &self.infos) {
                    Some(a) => a,
                    None => return Ok(None),
                };
                let rows = self.collect_access(&access, ctx)?;
                let rows = self.verify_rows(rows, &access, std::slice::from_ref(leaf))?;
                let natural = natural_column(&access, &self.infos);
                Ok(Some(CandidateSet { rows, natural }))
            }
        }
    }

    fn candidates_and(&self, children: &[Predicate], ctx: &Ctx) -> Result<Option<CandidateSet>> {
        // A composite index that swallows several equality children is the
        // one access the per-child recursion below cannot discover.
        let composite = planner::plan_and(children, &self.infos)
            .filter(|a| a.covered.len() > 1);

        let mut sets: Vec<Vec<(u64, u64)>> = Vec::new();
        let mut naturals: Vec<Option<String>> = Vec::new();
        let mut residual: Vec<&Predicate> = Vec::new();
        let consumed: Vec<usize> = composite.as_ref().map_or_else(Vec::new, |a| a.covered.clone());

        if let Some(ref access) = composite {
            let rows = self.collect_access(access, ctx)?;
            let covered: Vec<Predicate> =
                access.covered.iter().map(|&i| children[i].clone()).collect();
            let rows = self.verify_rows(rows, access, &covered)?;
            naturals.push(natural_column(access, &self.infos));
            sets.push(rows);
        }

        for (i, child) in children.iter().enumerate() {
            if consumed.contains(&i) {
                continue;
            }
            match self.candidates(child, ctx)? {
                Some(set) => {
                    naturals.push(set.natural);
                    sets.push(set.rows);
                }
                None => residual.push(child),
            }
        }

        if sets.is_empty() {
            return Ok(None);
        }

        let single = sets.len() == 1;
        let natural = if single { naturals.pop().flatten() } else { None };
        let mut rows = intersect_all(sets);

        if !residual.is_empty() {
            rows.retain(|&(offset, _)| self.row_matches_all(offset, &residual));
        }
        Ok(Some(CandidateSet { rows, natural }))
    }

    /// Re-check rows whose index keys cannot be trusted verbatim: truncated
    /// keys and `LIKE` prefixes both need the real column bytes.
    fn verify_rows(
        &self,
        rows: Vec<(u64, u64)>,
        access: &Access,
        covered: &[Predicate],
    ) -> Result<Vec<(u64, u64)>> {
        if !needs_verify(&access.bound) {
            return Ok(rows);
        }
        let refs: Vec<&Predicate> = covered.iter().collect();
        Ok(rows
            .into_iter()
            .filter(|&(offset, _)| self.row_matches_all(offset, &refs))
            .collect())
    }

    fn row_matches_all(&self, offset: u64, preds: &[&Predicate]) -> bool {
        let Some((record, _)) = self.source.record_at(offset) else {
            return false;
        };
        let row = Row {
            header: &self.header,
            fields: source::split_fields(record, self.sep),
        };
        preds.iter().all(|p| p.evaluate(&row))
    }

    // ── Index scans ──────────────────────────────────────────────────────────

    fn scan_access(
        &self,
        access: &Access,
        ctx: &Ctx,
        emit: &mut dyn FnMut(u64, u64) -> Result<()>,
    ) -> Result<()> {
        let handle = &self.handles[access.index];
        match &access.bound {
            AccessBound::Eq(key) => self.scan_eq(handle, key, ctx, emit),
            AccessBound::In(values) => {
                // Members can overlap, so the union is built before emission.
                let mut sets = Vec::with_capacity(values.len());
                for v in values {
                    let mut rows = Vec::new();
                    self.scan_eq(handle, v, ctx, &mut |o, l| {
                        rows.push((o, l));
                        Ok(())
                    })?;
                    sets.push(rows);
                }
                for (o, l) in union(sets) {
                    emit(o, l)?;
                }
                Ok(())
            }
            AccessBound::Range { op, value } => self.scan_range(handle, *op, value, ctx, emit),
            AccessBound::LikePrefix { prefix, .. } => self.scan_prefix(handle, prefix, ctx, emit),
        }
    }

    fn collect_access(&self, access: &Access, ctx: &Ctx) -> Result<Vec<(u64, u64)>> {
        let mut rows = Vec::new();
        self.scan_access(access, ctx, &mut |o, l| {
            rows.push((o, l));
            Ok(())
        })?;
        Ok(rows)
    }

    fn scan_eq(
        &self,
        handle: &IndexHandle,
        key: &[u8],
        ctx: &Ctx,
        emit: &mut dyn FnMut(u64, u64) -> Result<()>,
    ) -> Result<()> {
        let key = &key[..key.len().min(KEY_LEN)];
        if let Some(ref bloom) = handle.bloom {
            if !bloom.might_contain(key) {
                return Ok(());
            }
        }
        let blocks = handle.reader.blocks();
        if blocks.is_empty() {
            return Ok(());
        }
        let padded = pad_key(key);

        let mut i = handle.reader.seek_block(key);
        while i < blocks.len() && blocks[i].start_key.as_bytes() <= key {
            let records = self.read_block(handle, &blocks[i], ctx)?;
            let start = records.partition_point(|r| r.key < padded);
            for rec in &records[start..] {
                if rec.key != padded {
                    break;
                }
                self.emit_row(rec.offset, emit)?;
            }
            i += 1;
        }
        Ok(())
    }

    fn scan_range(
        &self,
        handle: &IndexHandle,
        op: CmpOp,
        value: &[u8],
        ctx: &Ctx,
        emit: &mut dyn FnMut(u64, u64) -> Result<()>,
    ) -> Result<()> {
        let blocks = handle.reader.blocks();
        let numeric = std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .is_some();

        let satisfies = |key: &[u8]| -> bool {
            let ord = compare_values(key, value);
            match op {
                CmpOp::Gt => ord == Ordering::Greater,
                CmpOp::Ge => ord != Ordering::Less,
                CmpOp::Lt => ord == Ordering::Less,
                CmpOp::Le => ord != Ordering::Greater,
                CmpOp::Eq | CmpOp::Ne => unreachable!("range scan never sees equality ops"),
            }
        };

        // Byte-ordered bounds only prune when the comparison is byte-wise;
        // numeric keys are not laid out in numeric order.
        let start = if !numeric && matches!(op, CmpOp::Gt | CmpOp::Ge) {
            handle.reader.seek_block(&value[..value.len().min(KEY_LEN)])
        } else {
            0
        };

        for (i, desc) in blocks.iter().enumerate().skip(start) {
            if !numeric
                && matches!(op, CmpOp::Lt | CmpOp::Le)
                && i > 0
                && !satisfies(desc.start_key.as_bytes())
            {
                // This block's smallest key already fails an upper bound.
                break;
            }
            let records = self.read_block(handle, desc, ctx)?;
            for rec in &records {
                if satisfies(rec.key_trimmed()) {
                    self.emit_row(rec.offset, emit)?;
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(
        &self,
        handle: &IndexHandle,
        prefix: &[u8],
        ctx: &Ctx,
        emit: &mut dyn FnMut(u64, u64) -> Result<()>,
    ) -> Result<()> {
        let prefix = &prefix[..prefix.len().min(KEY_LEN)];
        let blocks = handle.reader.blocks();
        if blocks.is_empty() {
            return Ok(());
        }
        let upper = prefix_successor(prefix);

        let mut i = handle.reader.seek_block(prefix);
        while i < blocks.len() {
            if let Some(ref up) = upper {
                if blocks[i].start_key.as_bytes() >= up.as_slice() {
                    break;
                }
            }
            let records = self.read_block(handle, &blocks[i], ctx)?;
            for rec in &records {
                let key = rec.key_trimmed();
                if let Some(ref up) = upper {
                    if key >= up.as_slice() {
                        break;
                    }
                }
                if key.starts_with(prefix) {
                    self.emit_row(rec.offset, emit)?;
                }
            }
            i += 1;
        }
        Ok(())
    }

    fn read_block(
        &self,
        handle: &IndexHandle,
        desc: &BlockDescriptor,
        ctx: &Ctx,
    ) -> Result<Vec<crate::record::IndexRecord>> {
        ctx.check_live()?;
        ctx.blocks_read.set(ctx.blocks_read.get() + 1);
        handle.reader.read_block(desc)
    }

    fn emit_row(&self, offset: i64, emit: &mut dyn FnMut(u64, u64) -> Result<()>) -> Result<()> {
        // An offset past EOF means the index outlived a source truncation;
        // the staleness warning already covers it.
        if let Some((_, len)) = self.source.record_at(offset as u64) {
            emit(offset as u64, len)?;
        }
        Ok(())
    }

    // ── Full scan (reference path) ───────────────────────────────────────────

    /// Evaluate the predicate row by row, collecting matches in source
    /// order.  This is the reference the planner is held to.
    pub fn full_scan(&self, pred: Option<&Predicate>, ctx: &Ctx) -> Result<Vec<(u64, u64)>> {
        let mut rows = Vec::new();
        self.full_scan_stream(pred, ctx, &mut |o, l| {
            rows.push((o, l));
            Ok(())
        })?;
        Ok(rows)
    }

    fn full_scan_stream(
        &self,
        pred: Option<&Predicate>,
        ctx: &Ctx,
        emit: &mut dyn FnMut(u64, u64) -> Result<()>,
    ) -> Result<()> {
        let mut since_check = 0u32;
        for (offset, record) in self.source.records_from(self.source.data_start()) {
            since_check += 1;
            if since_check == 1024 {
                ctx.check_live()?;
                since_check = 0;
            }
            let matches = match pred {
                None => true,
                Some(p) => {
                    let row = Row {
                        header: &self.header,
                        fields: source::split_fields(record, self.sep),
                    };
                    p.evaluate(&row)
                }
            };
            if matches {
                emit(offset, record.len() as u64)?;
            }
        }
        Ok(())
    }

    fn sort_rows(&self, rows: &mut [(u64, u64)], order: &OrderBy) -> Result<()> {
        let col = self
            .header
            .iter()
            .position(|h| h == &order.column)
            .ok_or_else(|| Error::UnknownColumn(order.column.clone()))?;
        rows.sort_by(|&(a, _), &(b, _)| {
            let va = self
                .source
                .record_at(a)
                .and_then(|(rec, _)| source::field_at(rec, self.sep, col))
                .unwrap_or(b"");
            let vb = self
                .source
                .record_at(b)
                .and_then(|(rec, _)| source::field_at(rec, self.sep, col))
                .unwrap_or(b"");
            let ord = compare_values(va, vb).then(a.cmp(&b));
            if order.desc {
                ord.reverse()
            } else {
                ord
            }
        });
        Ok(())
    }
}

// ── Context, paging, set algebra ─────────────────────────────────────────────

/// Per-query context: deadline, cancel flag, and the block-read tally.
pub struct Ctx {
    deadline:    Option<Instant>,
    cancel:      Option<Arc<AtomicBool>>,
    blocks_read: Cell<u64>,
}

impl Ctx {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self { deadline, cancel: None, blocks_read: Cell::new(0) }
    }

    fn for_request(req: &QueryRequest) -> Self {
        Self {
            deadline:    req.deadline,
            cancel:      req.cancel.clone(),
            blocks_read: Cell::new(0),
        }
    }

    /// Checked before every block read and every full-scan stride.  Cancel
    /// beats deadline: a gone client must not read as a timeout.
    fn check_live(&self) -> Result<()> {
        if let Some(ref cancel) = self.cancel {
            if cancel.load(atomic::Ordering::Relaxed) {
                return Err(Error::Canceled);
            }
        }
        match self.deadline {
            Some(d) if Instant::now() > d => Err(Error::Deadline),
            _ => Ok(()),
        }
    }
}

/// Applies OFFSET/LIMIT at the sink boundary while forwarding the stream.
struct Pager<'s> {
    sink:  &'s mut dyn RowSink,
    skip:  usize,
    taken: u64,
    limit: Option<usize>,
}

impl Pager<'_> {
    fn warn(&mut self, message: &str) -> Result<()> {
        self.sink.warning(message)
    }

    fn push(&mut self, offset: u64, length: u64) -> Result<()> {
        if self.skip > 0 {
            self.skip -= 1;
            return Ok(());
        }
        if self.limit.map_or(false, |l| self.taken as usize >= l) {
            return Ok(());
        }
        self.sink.row(offset, length)?;
        self.taken += 1;
        Ok(())
    }
}

#[derive(Default)]
struct Collect {
    rows:     Vec<(u64, u64)>,
    warnings: Vec<String>,
}

impl RowSink for Collect {
    fn warning(&mut self, message: &str) -> Result<()> {
        self.warnings.push(message.to_owned());
        Ok(())
    }

    fn row(&mut self, offset: u64, length: u64) -> Result<()> {
        self.rows.push((offset, length));
        Ok(())
    }
}

struct CandidateSet {
    rows:    Vec<(u64, u64)>,
    /// Column whose byte order the rows are already sorted by, if any.
    natural: Option<String>,
}

fn order_satisfied(order: &Option<OrderBy>, natural: &Option<String>) -> bool {
    match order {
        None => true,
        Some(ob) => natural.as_deref() == Some(ob.column.as_str()) && !ob.desc,
    }
}

fn needs_verify(bound: &AccessBound) -> bool {
    match bound {
        AccessBound::Eq(key) => key.len() >= KEY_LEN,
        AccessBound::In(values) => values.iter().any(|v| v.len() >= KEY_LEN),
        AccessBound::Range { value, .. } => value.len() >= KEY_LEN,
        AccessBound::LikePrefix { .. } => true,
    }
}

fn natural_column(access: &Access, infos: &[IndexInfo]) -> Option<String> {
    let info = &infos[access.index];
    if info.columns.len() != 1 {
        return None;
    }
    match &access.bound {
        // Equal keys or a byte-ordered walk keep the column's byte order;
        // numeric ranges and multi-value sets do not.
        AccessBound::Eq(_) => Some(info.columns[0].clone()),
        AccessBound::Range { value, .. } => {
            let numeric = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.trim().parse::<f64>().ok())
                .is_some();
            (!numeric).then(|| info.columns[0].clone())
        }
        _ => None,
    }
}

fn intersect_all(mut sets: Vec<Vec<(u64, u64)>>) -> Vec<(u64, u64)> {
    for set in &mut sets {
        set.sort_unstable_by_key(|&(o, _)| o);
    }
    sets.sort_by_key(|s| s.len());
    let mut iter = sets.into_iter();
    let mut acc = iter.next().unwrap_or_default();
    for set in iter {
        let mut out = Vec::with_capacity(acc.len().min(set.len()));
        let (mut a, mut b) = (0usize, 0usize);
        while a < acc.len() && b < set.len() {
            match acc[a].0.cmp(&set[b].0) {
                Ordering::Less => a += 1,
                Ordering::Greater => b += 1,
                Ordering::Equal => {
                    out.push(acc[a]);
                    a += 1;
                    b += 1;
                }
            }
        }
        acc = out;
    }
    acc
}

fn union(sets: Vec<Vec<(u64, u64)>>) -> Vec<(u64, u64)> {
    let mut all: Vec<(u64, u64)> = sets.into_iter().flatten().collect();
    all.sort_unstable_by_key(|&(o, _)| o);
    all.dedup_by_key(|&mut (o, _)| o);
    all
}

fn pad_key(key: &[u8]) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    out[..key.len()].copy_from_slice(key);
    out
}

/// Smallest byte string greater than every string with this prefix, or
/// `None` when the prefix is all `0xFF`.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut p = prefix.to_vec();
    while let Some(&last) = p.last() {
        if last == 0xFF {
            p.pop();
        } else {
            *p.last_mut().unwrap() = last + 1;
            return Some(p);
        }
    }
    None
}
