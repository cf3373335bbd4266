#![deny(rust_2018_idioms)]

use snafu::{ResultExt, Snafu};
use std::io::{Empty, Read};

/// A byte-level cursor over XML input.
///
/// The cursor owns the bytes the scanners look at. In buffered mode
/// the whole input is visible at once and nothing is ever thrown
/// away. In streaming mode the cursor keeps a window of the input,
/// refills it from the source on demand, and recycles bytes that fall
/// before the window start.
///
/// Offsets handed out by [`offset`](Self::offset) are absolute
/// positions in the input, stable across recycling.
#[derive(Debug)]
pub struct Cursor<R = Empty> {
    source: Option<R>,
    buffer: Vec<u8>,

    n_retired_bytes: usize,
    offset: usize,

    window: Option<(usize, usize)>,

    source_exhausted: bool,
}

impl Cursor {
    /// A cursor over fully-buffered input. No window, no quota.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            source: None,
            buffer: bytes,
            n_retired_bytes: 0,
            offset: 0,
            window: None,
            source_exhausted: true,
        }
    }
}

impl<R> Cursor<R>
where
    R: Read,
{
    const REFILL_SIZE: usize = 1024;

    /// A cursor that refills incrementally from `source`.
    pub fn from_stream(source: R) -> Self {
        Self {
            source: Some(source),
            buffer: Vec::new(),
            n_retired_bytes: 0,
            offset: 0,
            window: None,
            source_exhausted: false,
        }
    }

    #[must_use]
    pub fn is_buffered(&self) -> bool {
        self.source.is_none()
    }

    /// The absolute offset of the byte the cursor is on.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Rewinds (or restores) the cursor to an absolute offset. Only
    /// offsets inside the retained window are valid targets.
    pub fn seek(&mut self, offset: usize) {
        debug_assert!(
            offset >= self.n_retired_bytes && offset <= self.buffered_end(),
            "Seek target outside the retained window",
        );
        self.offset = offset;
    }

    pub fn advance(&mut self, n: usize) {
        self.offset += n;
        debug_assert!(
            self.offset <= self.buffered_end(),
            "Advanced past the buffered input",
        );
    }

    pub fn skip_byte(&mut self) {
        self.advance(1);
    }

    /// Marks `start` as the boundary of the quota-checked region:
    /// bytes before it may be recycled on the next refill, and a read
    /// that cannot make progress without extending past `start +
    /// max_bytes` fails with `QuotaExceeded`.
    pub fn set_window(&mut self, start: usize, max_bytes: usize) {
        debug_assert!(
            start >= self.n_retired_bytes && start <= self.offset,
            "Window start outside the retained window",
        );
        self.window = Some((start, max_bytes));
    }

    /// True once a refill attempt yields nothing more to read.
    pub fn at_end(&mut self) -> Result<bool> {
        Ok(self.fill(1)?.is_empty())
    }

    /// The byte at the cursor, refilling as needed.
    pub fn current_byte(&mut self) -> Result<u8> {
        Ok(self.require(1)?[0])
    }

    /// Makes at least `min` bytes available at the cursor when the
    /// input allows it and returns them. The result is shorter than
    /// `min` when the input ends first, and is clipped at the window
    /// bound so scanners cannot consume past the quota.
    pub fn fill(&mut self, min: usize) -> Result<&[u8]> {
        let mut need = self.offset + min;
        if let Some(limit) = self.limit() {
            need = need.min(limit);
        }
        self.refill_to(need)?;

        let mut end = self.buffered_end();
        if let Some(limit) = self.limit() {
            end = end.min(limit).max(self.offset);
        }

        Ok(&self.buffer[self.offset - self.n_retired_bytes..end - self.n_retired_bytes])
    }

    /// Like [`fill`](Self::fill), but fails when fewer than `n` bytes
    /// can be served: `UnexpectedEof` when the input ends,
    /// `QuotaExceeded` when the window bound is what stopped us.
    pub fn require(&mut self, n: usize) -> Result<&[u8]> {
        let len = self.fill(n)?.len();

        if len < n {
            let served_end = self.offset + len;
            let at_limit = self.limit() == Some(served_end);
            let input_continues = !self.source_exhausted || self.buffered_end() > served_end;

            if at_limit && input_continues {
                let (_, quota) = self.window.unwrap_or_default();
                return QuotaExceededSnafu {
                    quota,
                    location: served_end,
                }
                .fail();
            }

            return UnexpectedEofSnafu {
                location: served_end,
            }
            .fail();
        }

        Ok(&self.buffer[self.offset - self.n_retired_bytes..][..n])
    }

    /// Re-reads the bytes of a recorded span. Panics when the span is
    /// not inside the retained window; spans are only valid until the
    /// read that produced them is superseded.
    #[must_use]
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(
            offset >= self.n_retired_bytes && offset + len <= self.buffered_end(),
            "Span outside the retained window",
        );
        &self.buffer[offset - self.n_retired_bytes..][..len]
    }

    /// Absolute offsets of line starts within the retained window: the
    /// first retained byte, plus every byte following LF or a lone CR.
    #[must_use]
    pub fn line_starts(&self) -> Vec<usize> {
        let mut starts = vec![self.n_retired_bytes];

        for (i, &b) in self.buffer.iter().enumerate() {
            let terminates = b == b'\n' || (b == b'\r' && self.buffer.get(i + 1) != Some(&b'\n'));
            if terminates {
                starts.push(self.n_retired_bytes + i + 1);
            }
        }

        starts
    }

    fn buffered_end(&self) -> usize {
        self.n_retired_bytes + self.buffer.len()
    }

    fn limit(&self) -> Option<usize> {
        self.window.map(|(start, max)| start + max)
    }

    fn refill_to(&mut self, need_end: usize) -> Result<()> {
        while self.buffered_end() < need_end && !self.source_exhausted {
            self.recycle();

            let len = self.buffer.len();
            let want = (need_end - self.n_retired_bytes - len).max(Self::REFILL_SIZE);
            self.buffer.resize(len + want, 0);

            let read = match &mut self.source {
                Some(source) => source.read(&mut self.buffer[len..]),
                None => Ok(0),
            };

            let n_new_bytes = match read.context(IoSnafu {
                location: self.offset,
            }) {
                Ok(n) => n,
                Err(e) => {
                    self.buffer.truncate(len);
                    return Err(e);
                }
            };

            self.buffer.truncate(len + n_new_bytes);

            if n_new_bytes == 0 {
                self.source_exhausted = true;
            }
        }

        Ok(())
    }

    fn recycle(&mut self) {
        let keep_from = match self.window {
            Some((start, _)) => start,
            None => return,
        };

        if keep_from <= self.n_retired_bytes {
            return;
        }

        let n_dead_bytes = keep_from - self.n_retired_bytes;
        let live = self.buffer.len() - n_dead_bytes;
        self.buffer.copy_within(n_dead_bytes.., 0);
        self.buffer.truncate(live);
        self.n_retired_bytes = keep_from;
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Needed more input at byte {location}, but the input was exhausted"))]
    UnexpectedEof { location: usize },

    #[snafu(display("Reading past byte {location} would exceed the read quota of {quota} bytes"))]
    QuotaExceeded { quota: usize, location: usize },

    #[snafu(display("Unable to read more input at byte {location}"))]
    Io {
        source: std::io::Error,
        location: usize,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod test {
    use std::io;

    use super::*;

    type BoxError = Box<dyn std::error::Error>;
    type Result<T = (), E = BoxError> = std::result::Result<T, E>;

    macro_rules! assert_error {
        ($e:expr, $p:pat $(if $guard:expr)?) => {
            assert!(
                matches!($e, Err($p) $(if $guard)?),
                "Expected {}, but got {:?}",
                stringify!($p),
                $e,
            )
        };
    }

    #[test]
    fn buffered_input_is_visible_all_at_once() -> Result {
        let mut cursor = Cursor::from_vec(b"abc".to_vec());

        assert_eq!(cursor.fill(1)?, b"abc");
        assert_eq!(cursor.current_byte()?, b'a');

        cursor.advance(2);
        assert_eq!(cursor.offset(), 2);
        assert_eq!(cursor.current_byte()?, b'c');

        cursor.skip_byte();
        assert!(cursor.at_end()?);

        Ok(())
    }

    #[test]
    fn at_end_stays_true_once_reached() -> Result {
        let mut cursor = Cursor::from_vec(b"x".to_vec());

        cursor.advance(1);
        assert!(cursor.at_end()?);
        assert!(cursor.at_end()?);

        Ok(())
    }

    #[test]
    fn fail_require_past_the_end_of_input() {
        let mut cursor = Cursor::from_vec(b"ab".to_vec());

        let r = cursor.require(3).map(<[u8]>::to_vec);

        assert_error!(r, Error::UnexpectedEof { location: 2 });
    }

    #[test]
    fn trickled_source_refills_until_requests_are_met() -> Result {
        let mut cursor = Cursor::from_stream(Trickle::new(b"abcdef", 2));

        assert_eq!(cursor.require(5)?, b"abcde");
        cursor.advance(5);
        assert_eq!(cursor.current_byte()?, b'f');

        Ok(())
    }

    #[test]
    fn seek_rewinds_within_the_retained_window() -> Result {
        let mut cursor = Cursor::from_stream(Trickle::new(b"abcdef", 3));

        cursor.require(4)?;
        cursor.advance(4);
        cursor.seek(1);
        assert_eq!(cursor.current_byte()?, b'b');

        Ok(())
    }

    #[test]
    fn slice_returns_previously_seen_spans() -> Result {
        let mut cursor = Cursor::from_stream(Trickle::new(b"abcdef", 2));

        cursor.require(6)?;
        cursor.advance(6);
        assert_eq!(cursor.slice(2, 3), b"cde");

        Ok(())
    }

    mod windows {
        use super::*;

        #[test]
        fn recycling_happens_before_the_window_start() -> Result {
            let mut cursor = Cursor::from_stream(Trickle::new(b"abcdefgh", 1));

            cursor.require(4)?;
            cursor.advance(4);
            cursor.set_window(4, 100);
            cursor.require(4)?;

            assert_eq!(cursor.line_starts(), [4]);
            assert_eq!(cursor.slice(4, 4), b"efgh");

            Ok(())
        }

        #[test]
        fn requests_up_to_the_quota_succeed() -> Result {
            let mut cursor = Cursor::from_stream(Trickle::new(b"abcdef", 2));

            cursor.set_window(0, 4);
            assert_eq!(cursor.require(4)?, b"abcd");

            Ok(())
        }

        #[test]
        fn fail_requests_past_the_quota() {
            let mut cursor = Cursor::from_stream(Trickle::new(b"abcdef", 2));

            cursor.set_window(0, 4);
            let r = cursor.require(5).map(<[u8]>::to_vec);

            assert_error!(r, Error::QuotaExceeded { quota: 4, location: 4 });
        }

        #[test]
        fn fill_is_clipped_at_the_window_bound() -> Result {
            let mut cursor = Cursor::from_stream(Trickle::new(b"abcdef", 6));

            cursor.set_window(0, 3);
            assert_eq!(cursor.fill(6)?, b"abc");

            Ok(())
        }

        #[test]
        fn input_ending_inside_the_window_is_not_a_quota_failure() {
            let mut cursor = Cursor::from_stream(Trickle::new(b"abc", 2));

            cursor.set_window(0, 100);
            let r = cursor.require(5).map(<[u8]>::to_vec);

            assert_error!(r, Error::UnexpectedEof { location: 3 });
        }

        #[test]
        fn a_fresh_window_lifts_the_previous_bound() -> Result {
            let mut cursor = Cursor::from_stream(Trickle::new(b"abcdef", 2));

            cursor.set_window(0, 3);
            cursor.require(3)?;
            cursor.advance(3);

            cursor.set_window(3, 3);
            assert_eq!(cursor.require(3)?, b"def");

            Ok(())
        }
    }

    mod line_starts {
        use super::*;

        #[test]
        fn after_line_feeds_and_lone_carriage_returns() {
            let cursor = Cursor::from_vec(b"a\nb\r\nc\rd".to_vec());

            assert_eq!(cursor.line_starts(), [0, 2, 5, 7]);
        }

        #[test]
        fn input_without_terminators_has_one_line() {
            let cursor = Cursor::from_vec(b"abc".to_vec());

            assert_eq!(cursor.line_starts(), [0]);
        }
    }

    #[derive(Debug)]
    struct Trickle<'a> {
        bytes: &'a [u8],
        step: usize,
    }

    impl<'a> Trickle<'a> {
        fn new(bytes: &'a [u8], step: usize) -> Self {
            Self { bytes, step }
        }
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(self.bytes.len()).min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[..n]);
            self.bytes = &self.bytes[n..];
            Ok(n)
        }
    }
}
