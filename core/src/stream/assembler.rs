/// Line reassembly for the inbound NUS byte stream
///
/// Notifications arrive in arbitrary chunks (typically one ATT payload each),
/// so a log line may be split across several of them or several lines may
/// share one. The assembler buffers bytes until a `\n` appears and hands back
/// complete lines, tolerating `\r\n` endings. A line that is never terminated
/// (e.g. the firmware crashed mid-print) is recovered by polling
/// [`LineAssembler::flush_if_idle`].
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Longest line emitted; longer runs are cut into pieces of this size
pub const DEFAULT_MAX_PENDING: usize = 64 * 1024;

/// Reassembles newline-delimited lines from byte chunks
#[derive(Debug)]
pub struct LineAssembler {
    buf: Vec<u8>,
    last_activity: Instant,
    max_pending: usize,
}

impl LineAssembler {
    /// Create an assembler with the default pending-bytes bound
    pub fn new() -> Self {
        Self::with_max_pending(DEFAULT_MAX_PENDING)
    }

    /// Create an assembler that cuts lines into `max_pending`-byte pieces
    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            buf: Vec::new(),
            last_activity: Instant::now(),
            max_pending: max_pending.max(1),
        }
    }

    /// Feed a chunk, returning every line it completed (in order)
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.feed_at(chunk, Instant::now())
    }

    /// Same as [`feed`](Self::feed) with an explicit clock reading
    pub fn feed_at(&mut self, chunk: &[u8], now: Instant) -> Vec<Vec<u8>> {
        self.last_activity = now;
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            start = self.split_oversized(start, end, &mut lines);
            let line = &self.buf[start..end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            lines.push(line.to_vec());
            start = end + 1;
        }
        let len = self.buf.len();
        start = self.split_oversized(start, len, &mut lines);
        self.buf.drain(..start);

        lines
    }

    /// Cut `max_pending`-byte pieces off `buf[start..end]` while more than
    /// `max_pending` bytes remain, returning the new start.
    ///
    /// Pieces sit at fixed offsets from the line start, so the output does not
    /// depend on how the stream was chunked.
    fn split_oversized(&self, mut start: usize, end: usize, lines: &mut Vec<Vec<u8>>) -> usize {
        if end - start > self.max_pending {
            warn!(
                "Line exceeded {} bytes, emitting it in pieces",
                self.max_pending
            );
        }
        while end - start > self.max_pending {
            lines.push(self.buf[start..start + self.max_pending].to_vec());
            start += self.max_pending;
        }
        start
    }

    /// Return the partial line if nothing arrived for at least `threshold`
    pub fn flush_if_idle(&mut self, threshold: Duration) -> Option<Vec<u8>> {
        self.flush_if_idle_at(threshold, Instant::now())
    }

    /// Same as [`flush_if_idle`](Self::flush_if_idle) with an explicit clock reading
    pub fn flush_if_idle_at(&mut self, threshold: Duration, now: Instant) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            return None;
        }
        if now.saturating_duration_since(self.last_activity) < threshold {
            return None;
        }
        Some(std::mem::take(&mut self.buf))
    }

    /// Take whatever partial line is buffered, idle or not
    pub fn take_remaining(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }

    /// Number of buffered bytes not yet terminated by `\n`
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    /// Whether no partial line is buffered
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn as_strings(lines: Vec<Vec<u8>>) -> Vec<String> {
        lines
            .into_iter()
            .map(|l| String::from_utf8(l).expect("utf8"))
            .collect()
    }

    #[test]
    fn test_feed_basic_lines() {
        let mut assembler = LineAssembler::new();
        let lines = assembler.feed(b"hello\nworld\n");
        assert_eq!(as_strings(lines), vec!["hello", "world"]);

        let lines = assembler.feed(b"partial");
        assert!(lines.is_empty());
        assert_eq!(assembler.pending_len(), 7);
    }

    #[test]
    fn test_split_across_chunks() {
        let mut assembler = LineAssembler::new();
        let mut lines = assembler.feed(b"ab");
        lines.extend(assembler.feed(b"c\nde\n"));
        assert_eq!(as_strings(lines), vec!["abc", "de"]);
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_crlf_is_stripped() {
        let mut assembler = LineAssembler::new();
        let lines = assembler.feed(b"hi\r\nworld\r\n");
        assert_eq!(as_strings(lines), vec!["hi", "world"]);
    }

    #[test]
    fn test_only_one_trailing_cr_is_stripped() {
        let mut assembler = LineAssembler::new();
        let lines = assembler.feed(b"a\r\r\n\rb\n");
        assert_eq!(lines, vec![b"a\r".to_vec(), b"\rb".to_vec()]);
    }

    #[test]
    fn test_cr_split_from_lf() {
        let mut assembler = LineAssembler::new();
        assert!(assembler.feed(b"boot ok\r").is_empty());
        let lines = assembler.feed(b"\n");
        assert_eq!(as_strings(lines), vec!["boot ok"]);
    }

    #[test]
    fn test_empty_lines_are_kept() {
        let mut assembler = LineAssembler::new();
        let lines = assembler.feed(b"\n\nx\n");
        assert_eq!(as_strings(lines), vec!["", "", "x"]);
    }

    #[test]
    fn test_flush_if_idle_once() {
        let start = Instant::now();
        let mut assembler = LineAssembler::new();
        assembler.feed_at(b"partial", start);

        let threshold = Duration::from_millis(250);
        assert!(assembler
            .flush_if_idle_at(threshold, start + Duration::from_millis(100))
            .is_none());

        let later = start + Duration::from_millis(300);
        assert_eq!(
            assembler.flush_if_idle_at(threshold, later),
            Some(b"partial".to_vec())
        );
        assert!(assembler.flush_if_idle_at(threshold, later).is_none());
    }

    #[test]
    fn test_new_data_resets_idle_clock() {
        let start = Instant::now();
        let threshold = Duration::from_millis(250);
        let mut assembler = LineAssembler::new();

        assembler.feed_at(b"par", start);
        assembler.feed_at(b"tial", start + Duration::from_millis(200));

        assert!(assembler
            .flush_if_idle_at(threshold, start + Duration::from_millis(300))
            .is_none());
        assert_eq!(
            assembler.flush_if_idle_at(threshold, start + Duration::from_millis(450)),
            Some(b"partial".to_vec())
        );
    }

    #[test]
    fn test_flush_on_empty_buffer() {
        let start = Instant::now();
        let mut assembler = LineAssembler::new();
        assembler.feed_at(b"done\n", start);
        assert!(assembler
            .flush_if_idle_at(Duration::ZERO, start + Duration::from_secs(10))
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_with_runtime_clock() {
        let mut assembler = LineAssembler::new();
        assembler.feed(b"no newline");

        assert!(assembler.flush_if_idle(Duration::from_millis(250)).is_none());
        tokio::time::advance(Duration::from_millis(260)).await;
        assert_eq!(
            assembler.flush_if_idle(Duration::from_millis(250)),
            Some(b"no newline".to_vec())
        );
    }

    #[test]
    fn test_max_pending_splits_lines() {
        let mut assembler = LineAssembler::with_max_pending(8);
        assert!(assembler.feed(b"12345678").is_empty());

        let lines = assembler.feed(b"9");
        assert_eq!(lines, vec![b"12345678".to_vec()]);
        assert_eq!(assembler.pending_len(), 1);

        let lines = assembler.feed(b"\n");
        assert_eq!(as_strings(lines), vec!["9"]);
        assert!(assembler.is_empty());

        // Delimited lines longer than the bound are cut the same way
        let lines = assembler.feed(b"a-much-longer-line\n");
        assert_eq!(as_strings(lines), vec!["a-much-l", "onger-li", "ne"]);
    }

    #[test]
    fn test_oversized_line_independent_of_chunking() {
        let mut data = vec![b'x'; 70_000];
        data.push(b'\n');

        let mut whole = LineAssembler::new();
        let expected = whole.feed(&data);

        let mut chunked = LineAssembler::new();
        let actual: Vec<Vec<u8>> = data.chunks(1000).flat_map(|c| chunked.feed(c)).collect();

        let lengths: Vec<usize> = actual.iter().map(Vec::len).collect();
        assert_eq!(lengths, vec![DEFAULT_MAX_PENDING, 70_000 - DEFAULT_MAX_PENDING]);
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_crlf_split_by_bound() {
        let mut assembler = LineAssembler::with_max_pending(4);
        assert_eq!(assembler.feed(b"abcd\r"), vec![b"abcd".to_vec()]);
        assert_eq!(assembler.feed(b"\n"), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn test_take_remaining() {
        let mut assembler = LineAssembler::new();
        assembler.feed(b"one\ntw");
        assert_eq!(assembler.take_remaining(), Some(b"tw".to_vec()));
        assert_eq!(assembler.take_remaining(), None);
    }

    fn feed_in_pieces(
        assembler: &mut LineAssembler,
        data: &[u8],
        cuts: Vec<usize>,
    ) -> Vec<Vec<u8>> {
        let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c.min(data.len())).collect();
        cuts.sort_unstable();

        let mut lines = Vec::new();
        let mut prev = 0;
        for cut in cuts {
            lines.extend(assembler.feed(&data[prev..cut]));
            prev = cut;
        }
        lines.extend(assembler.feed(&data[prev..]));
        lines
    }

    proptest! {
        #[test]
        fn prop_chunk_boundaries_do_not_matter(
            data in proptest::collection::vec(
                prop_oneof![Just(b'\n'), Just(b'\r'), any::<u8>()],
                0..512,
            ),
            cuts in proptest::collection::vec(0usize..512, 0..16),
        ) {
            let mut whole = LineAssembler::new();
            let expected = whole.feed(&data);

            let mut chunked = LineAssembler::new();
            let actual = feed_in_pieces(&mut chunked, &data, cuts);

            prop_assert_eq!(actual, expected);
            prop_assert_eq!(chunked.pending_len(), whole.pending_len());
        }

        #[test]
        fn prop_chunk_boundaries_do_not_matter_when_bounded(
            data in proptest::collection::vec(
                prop_oneof![Just(b'\n'), Just(b'\r'), Just(b'x'), any::<u8>()],
                0..512,
            ),
            cuts in proptest::collection::vec(0usize..512, 0..16),
        ) {
            let mut whole = LineAssembler::with_max_pending(8);
            let expected = whole.feed(&data);

            let mut chunked = LineAssembler::with_max_pending(8);
            let actual = feed_in_pieces(&mut chunked, &data, cuts);

            prop_assert!(chunked.pending_len() <= 8);
            prop_assert!(actual.iter().all(|line| line.len() <= 8));
            prop_assert_eq!(actual, expected);
            prop_assert_eq!(chunked.pending_len(), whole.pending_len());
        }
    }
}
