//! Multi-range HTTP transfer engine.
//!
//! Grounded on `examples/original_source/zypp-curl/ng/network/{request.cc,curlmultiparthandler.h,curlmultiparthandler.cc}`:
//! the descending range-batch-size series, the per-range `Pending -> Running
//! -> Finished|Error` state machine, and `Content-Range`/multipart response
//! parsing. HTTP transport itself uses `reqwest`'s blocking client (enriched
//! from `AOSC-Dev-aoscbootstrap`'s use of `reqwest`) since the original's
//! libcurl multi-handle and the teacher's internal `proxmox_http` client are
//! both unavailable here; the range-batching/coalescing/recovery state
//! machine is original to this crate, built in the same explicit,
//! `Result`-propagating style the teacher uses throughout `mirror.rs`.

use std::io::Read as _;
use std::time::Duration;

use openssl::hash::{Hasher, MessageDigest};

use crate::error::TransferError;
use crate::reports::Reports;

/// Batch sizes tried in order until the server accepts a multi-range
/// request, mirroring `CurlMultiPartHandler::_rangeAttempt`.
pub const RANGE_BATCH_SIZES: &[usize] = &[255, 127, 63, 15, 5, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeState {
    Pending,
    Running,
    Finished,
    Error,
}

/// One requested byte range plus the checksum it is expected to satisfy.
#[derive(Debug, Clone)]
pub struct RangeRequest {
    pub start: u64,
    pub len: u64,
    pub expected_sha256: Option<[u8; 32]>,
    pub state: RangeState,
    pub data: Vec<u8>,
}

impl RangeRequest {
    pub fn new(start: u64, len: u64) -> Self {
        Self {
            start,
            len,
            expected_sha256: None,
            state: RangeState::Pending,
            data: Vec::new(),
        }
    }

    pub fn with_checksum(mut self, sha256: [u8; 32]) -> Self {
        self.expected_sha256 = Some(sha256);
        self
    }

    fn restart(&mut self) {
        self.state = RangeState::Pending;
        self.data.clear();
    }

    fn verify_checksum(&self) -> Result<(), TransferError> {
        let Some(expected) = self.expected_sha256 else {
            return Ok(());
        };
        let mut hasher = Hasher::new(MessageDigest::sha256())
            .map_err(|e| TransferError::Internal(e.to_string()))?;
        hasher
            .update(&self.data)
            .map_err(|e| TransferError::Internal(e.to_string()))?;
        let digest = hasher.finish().map_err(|e| TransferError::Internal(e.to_string()))?;
        if digest.as_ref() == expected {
            Ok(())
        } else {
            Err(TransferError::InvalidChecksum { offset: self.start })
        }
    }
}

/// Coalesce adjacent/overlapping ranges in a batch into the fewest possible
/// `Range:` header segments, same purpose as the original's header builder
/// ahead of each curl multi-range request.
fn coalesce_ranges(indices: &[usize], ranges: &[RangeRequest]) -> Vec<(u64, u64)> {
    let mut sorted: Vec<usize> = indices.to_vec();
    sorted.sort_by_key(|&i| ranges[i].start);

    let mut out: Vec<(u64, u64)> = Vec::new();
    for &i in &sorted {
        let (start, end) = (ranges[i].start, ranges[i].start + ranges[i].len);
        if let Some(last) = out.last_mut() {
            if start <= last.1 {
                last.1 = last.1.max(end);
                continue;
            }
        }
        out.push((start, end));
    }
    out
}

fn range_header_value(segments: &[(u64, u64)]) -> String {
    let parts: Vec<String> = segments
        .iter()
        .map(|(start, end)| format!("{start}-{}", end.saturating_sub(1)))
        .collect();
    format!("bytes={}", parts.join(","))
}

/// Tracks whether a failed transfer attempt is worth retrying, mirroring
/// `CurlMultiPartHandler::canRecover()`/`prepareToContinue()`: recovery is
/// only offered for `RangeFail`, only while batch sizes remain, and only
/// while there is still pending work.
pub struct RecoveryState {
    batch_index: usize,
    last_error: Option<TransferError>,
    pending: usize,
}

impl RecoveryState {
    pub fn new(pending: usize) -> Self {
        Self {
            batch_index: 0,
            last_error: None,
            pending,
        }
    }

    pub fn batch_index(&self) -> usize {
        self.batch_index
    }

    pub fn set_pending(&mut self, pending: usize) {
        self.pending = pending;
    }

    fn record_error(&mut self, error: TransferError) {
        self.last_error = Some(error);
    }

    /// True iff the last recorded error was `RangeFail`, a smaller batch
    /// size remains to try, and there is pending work left.
    pub fn can_recover(&self) -> bool {
        matches!(self.last_error, Some(TransferError::RangeFail))
            && self.batch_index + 1 < RANGE_BATCH_SIZES.len().saturating_sub(1)
            && self.pending > 0
    }

    /// Advances the batch-size index; callers reset their connection handle
    /// to defaults alongside this to avoid residual read-state errors.
    pub fn prepare_to_continue(&mut self) {
        self.batch_index += 1;
        self.last_error = None;
    }
}

/// Drives one URL's range set to completion, descending through
/// `RANGE_BATCH_SIZES` whenever the server refuses a multi-range request,
/// and advancing the batch index (not restarting from the top) on a
/// recoverable per-range failure -- same recovery contract as
/// `CurlMultiPartHandler::canRecover`/`hasMoreWork`
/// ([`RecoveryState`] exposes that contract explicitly).
pub struct TransferEngine<'a> {
    client: &'a reqwest::blocking::Client,
    reports: &'a dyn Reports,
}

impl<'a> TransferEngine<'a> {
    pub fn new(client: &'a reqwest::blocking::Client, reports: &'a dyn Reports) -> Self {
        Self { client, reports }
    }

    /// Fetch every range in `ranges` from `url`, mutating each entry's
    /// `state`/`data` in place. Returns `Ok(())` only once every range has
    /// reached `Finished`.
    pub fn fetch_ranges(&self, url: &str, ranges: &mut [RangeRequest]) -> Result<(), TransferError> {
        let mut pending: Vec<usize> = (0..ranges.len()).collect();
        let mut recovery = RecoveryState::new(pending.len());

        // The last entry in RANGE_BATCH_SIZES (1) is never tried automatically:
        // a single-range request that still fails range negotiation means the
        // server doesn't do ranges at all, and falling back to a full,
        // range-less download is the caller's decision, not this engine's.
        let usable_batches = RANGE_BATCH_SIZES.len().saturating_sub(1);

        while !pending.is_empty() {
            let batch_index = recovery.batch_index();
            let batch_size = *RANGE_BATCH_SIZES
                .get(batch_index)
                .filter(|_| batch_index < usable_batches)
                .ok_or(TransferError::RangeFail)?;

            let this_round: Vec<usize> = pending.iter().take(batch_size).copied().collect();
            for &i in &this_round {
                ranges[i].state = RangeState::Running;
            }

            match self.fetch_batch(url, &this_round, ranges) {
                Ok(()) => {
                    let mut failed = Vec::new();
                    for &i in &this_round {
                        match ranges[i].verify_checksum() {
                            Ok(()) => ranges[i].state = RangeState::Finished,
                            Err(e) => {
                                self.reports.warning(&format!(
                                    "range at offset {} failed checksum verification: {e}",
                                    ranges[i].start
                                ));
                                ranges[i].state = RangeState::Error;
                                ranges[i].restart();
                                failed.push(i);
                            }
                        }
                    }
                    // Batch index is left untouched here: checksum failures retry at
                    // the same batch size, only a request-level RangeFail below
                    // shrinks it.
                    pending.retain(|i| !this_round.contains(i));
                    pending.extend(failed);
                    recovery.set_pending(pending.len());
                }
                Err(TransferError::RangeFail) => {
                    recovery.set_pending(pending.len());
                    recovery.record_error(TransferError::RangeFail);
                    if !recovery.can_recover() {
                        return Err(TransferError::RangeFail);
                    }
                    self.reports.warning(&format!(
                        "server refused {} simultaneous ranges, retrying with a smaller batch",
                        batch_size
                    ));
                    for &i in &this_round {
                        ranges[i].restart();
                    }
                    recovery.prepare_to_continue();
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Plain, range-less GET of the whole resource. Used as the caller-driven
    /// fallback when range negotiation is refused entirely (§4.5's "falling
    /// back to a full-file download is expected to be left to the caller").
    pub fn fetch_full(&self, url: &str) -> Result<Vec<u8>, TransferError> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(300))
            .send()
            .map_err(|e| classify_reqwest_error(&e, url))?;

        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(TransferError::Forbidden);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TransferError::NotFound);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransferError::Unauthorized);
        }
        if !status.is_success() {
            return Err(TransferError::ServerReturnedError(status.as_u16()));
        }

        response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| classify_reqwest_error(&e, url))
    }

    fn fetch_batch(&self, url: &str, indices: &[usize], ranges: &mut [RangeRequest]) -> Result<(), TransferError> {
        let segments = coalesce_ranges(indices, ranges);
        let header = range_header_value(&segments);

        let response = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, header)
            .timeout(Duration::from_secs(300))
            .send()
            .map_err(|e| classify_reqwest_error(&e, url))?;

        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(TransferError::Forbidden);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TransferError::NotFound);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransferError::Unauthorized);
        }
        // §4.5: a 2xx other than 206 means the server ignored the Range
        // header and sent the whole body; 416 means it rejected the range
        // outright. Both mean "ranges not supported" for this batch size.
        if status.as_u16() == 416
            || (status.is_success() && status != reqwest::StatusCode::PARTIAL_CONTENT)
            || (status.is_client_error() && indices.len() > 1)
        {
            return Err(TransferError::RangeFail);
        }
        if !status.is_success() && status != reqwest::StatusCode::PARTIAL_CONTENT {
            return Err(TransferError::ServerReturnedError(status.as_u16()));
        }

        let is_multipart = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("multipart/byteranges"));

        let body = response
            .bytes()
            .map_err(|e| classify_reqwest_error(&e, url))?;

        if is_multipart {
            self.distribute_multipart(&body, indices, ranges)
        } else {
            self.distribute_single(&body, indices, ranges)
        }
    }

    fn distribute_single(&self, body: &[u8], indices: &[usize], ranges: &mut [RangeRequest]) -> Result<(), TransferError> {
        if indices.len() != 1 {
            return Err(TransferError::MissingData(indices.len()));
        }
        let i = indices[0];
        ranges[i].data = body.to_vec();
        Ok(())
    }

    /// Parse a `multipart/byteranges` body into per-range payloads. Boundary
    /// detection follows RFC 2046's `--boundary` delimiter convention; each
    /// part's own `Content-Range: bytes start-end/total` header identifies
    /// which pending range it belongs to.
    fn distribute_multipart(&self, body: &[u8], indices: &[usize], ranges: &mut [RangeRequest]) -> Result<(), TransferError> {
        let text_boundary_end = body
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or(TransferError::MissingData(indices.len()))?;
        let boundary_line = &body[..text_boundary_end];
        let boundary = boundary_line
            .strip_prefix(b"--")
            .ok_or(TransferError::MissingData(indices.len()))?
            .to_vec();

        let delimiter = [b"--".as_slice(), &boundary].concat();
        let mut remaining = body;
        let mut filled = 0usize;

        while let Some(part_start) = find_subslice(remaining, &delimiter) {
            remaining = &remaining[part_start + delimiter.len()..];
            if remaining.starts_with(b"--") {
                break;
            }
            let Some(header_end) = find_subslice(remaining, b"\r\n\r\n") else {
                break;
            };
            let headers = std::str::from_utf8(&remaining[..header_end]).unwrap_or("");
            let start = headers
                .lines()
                .find_map(|l| l.to_ascii_lowercase().starts_with("content-range").then_some(l))
                .and_then(parse_content_range_start);

            let body_start = header_end + 4;
            let Some(next_boundary) = find_subslice(&remaining[body_start..], &delimiter) else {
                break;
            };
            let part_body = &remaining[body_start..body_start + next_boundary];
            let part_body = part_body.strip_suffix(b"\r\n").unwrap_or(part_body);

            if let Some(start) = start {
                if let Some(&i) = indices.iter().find(|&&i| ranges[i].start == start) {
                    ranges[i].data = part_body.to_vec();
                    filled += 1;
                }
            }
            remaining = &remaining[body_start + next_boundary..];
        }

        if filled != indices.len() {
            return Err(TransferError::MissingData(indices.len() - filled));
        }
        Ok(())
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_content_range_start(line: &str) -> Option<u64> {
    let (_, rest) = line.split_once("bytes")?;
    let rest = rest.trim().trim_start_matches(':').trim();
    let (range, _total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    start.trim().parse().ok()
}

fn classify_reqwest_error(e: &reqwest::Error, url: &str) -> TransferError {
    if e.is_timeout() {
        TransferError::Timeout {
            url: url.to_string(),
            target: "range fetch".to_string(),
        }
    } else if e.is_connect() {
        TransferError::ConnectionFailed(e.to_string())
    } else {
        TransferError::TemporaryProblem(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reports::RecordingReports;

    #[test]
    fn coalesces_overlapping_and_adjacent_ranges() {
        let ranges = vec![
            RangeRequest::new(0, 10),
            RangeRequest::new(10, 10),
            RangeRequest::new(100, 5),
        ];
        let segments = coalesce_ranges(&[0, 1, 2], &ranges);
        assert_eq!(segments, vec![(0, 20), (100, 105)]);
    }

    #[test]
    fn range_header_formats_as_bytes_ranges() {
        assert_eq!(range_header_value(&[(0, 10), (20, 25)]), "bytes=0-9,20-24");
    }

    #[test]
    fn checksum_mismatch_is_reported_not_panicked() {
        let mut range = RangeRequest::new(0, 4).with_checksum([0u8; 32]);
        range.data = b"abcd".to_vec();
        assert!(matches!(
            range.verify_checksum(),
            Err(TransferError::InvalidChecksum { offset: 0 })
        ));
    }

    #[test]
    fn batch_size_series_is_descending() {
        let mut prev = usize::MAX;
        for &size in RANGE_BATCH_SIZES {
            assert!(size < prev);
            prev = size;
        }
        assert_eq!(RANGE_BATCH_SIZES.last(), Some(&1));
    }

    #[test]
    fn engine_exhausting_batch_sizes_without_success_errors() {
        let client = reqwest::blocking::Client::new();
        let reports = RecordingReports::new();
        let engine = TransferEngine::new(&client, &reports);
        // Unroutable address forces connection failures, not RangeFail;
        // this exercises the early-return-on-non-RangeFail-error path.
        let mut ranges = vec![RangeRequest::new(0, 10)];
        let result = engine.fetch_ranges("http://127.0.0.1:1/nonexistent", &mut ranges);
        assert!(result.is_err());
    }

    #[test]
    fn recovery_never_advances_past_the_pre_last_batch_size() {
        let mut recovery = RecoveryState::new(1);
        // Walk through 255, 127, 63, 15 -> recoverable every time.
        for _ in 0..4 {
            recovery.record_error(TransferError::RangeFail);
            assert!(recovery.can_recover());
            recovery.prepare_to_continue();
        }
        // Now sitting at batch size 5 (index 4); one more RangeFail is terminal:
        // the engine must not advance to the series' last entry (1).
        recovery.record_error(TransferError::RangeFail);
        assert_eq!(RANGE_BATCH_SIZES[recovery.batch_index()], 5);
        assert!(!recovery.can_recover());
    }

    #[test]
    fn recovery_is_not_offered_for_non_range_fail_errors() {
        let mut recovery = RecoveryState::new(1);
        recovery.record_error(TransferError::Forbidden);
        assert!(!recovery.can_recover());
    }

    #[test]
    fn recovery_is_not_offered_once_no_work_remains() {
        let mut recovery = RecoveryState::new(0);
        recovery.record_error(TransferError::RangeFail);
        assert!(!recovery.can_recover());
    }
}
