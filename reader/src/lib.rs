#![deny(rust_2018_idioms)]

use chartype::{ByteExt, SliceExt};
use cursor::Cursor;
use easy_ext::ext;
use memchr::{memchr, memchr2};
use snafu::{ensure, Snafu};
use std::{
    fmt,
    io::{Empty, Read},
    str,
};

/// Streaming-mode byte budget for a single `read`.
pub const DEFAULT_MAX_BYTES_PER_READ: usize = 4096;

/// Largest text run returned from a single streaming `read`.
pub const MAX_TEXT_CHUNK: usize = 2048;

const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";
const XMLNS_NAMESPACE: &str = "http://www.w3.org/2000/xmlns/";

/// Single-letter prefixes are served from here instead of the input
/// buffer, so `<a:x>` never allocates for its prefix.
const ALPHA_PREFIXES: [&str; 26] = [
    "a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l", "m", "n", "o", "p", "q", "r", "s",
    "t", "u", "v", "w", "x", "y", "z",
];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeKind {
    StartElement,
    EndElement,
    Attribute,
    Text(TextKind),
    Comment,
    CData,
    Declaration,
    EndOfFile,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TextKind {
    /// Only space, tab, and line feed bytes.
    Whitespace,
    /// Immediately followed by markup that is not `<!`; a writer may
    /// copy it verbatim.
    Atomic,
    /// May need further inspection downstream.
    Complex,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Quote {
    Single,
    Double,
}

impl Quote {
    fn to_ascii_char(self) -> u8 {
        match self {
            Self::Single => b'\'',
            Self::Double => b'"',
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Single => "'",
            Self::Double => "\"",
        }
    }
}

/// A qualified name split at its namespace separator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Name<'a> {
    pub prefix: Option<&'a str>,
    pub local_part: &'a str,
}

impl PartialEq<&str> for Name<'_> {
    fn eq(&self, other: &&str) -> bool {
        self.prefix.is_none() && self.local_part == *other
    }
}

impl PartialEq<(&str, &str)> for Name<'_> {
    fn eq(&self, other: &(&str, &str)) -> bool {
        self.prefix == Some(other.0) && self.local_part == other.1
    }
}

/// The value carried by the current node.
///
/// `Bytes` borrows the cursor's buffer window and is only valid until
/// the next `read`; copy it out to keep it longer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Value<'a> {
    Bytes { bytes: &'a [u8], escaped: bool },
    Char(char),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttributeKind {
    Ordinary,
    /// `xmlns="..."` or `xmlns:p="..."`; also pushed a binding.
    Namespace,
    /// `xml:*`, e.g. `xml:space`.
    Reserved,
}

#[derive(Debug, Copy, Clone)]
pub struct Attribute<'a> {
    pub name: Name<'a>,
    pub value: &'a [u8],
    pub escaped: bool,
    pub quote: Quote,
    pub kind: AttributeKind,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadState {
    Initial,
    Interactive,
    EndOfFile,
    Closed,
}

/// 1-based line and column, resolved lazily from the line index.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Copy, Clone)]
struct Span {
    offset: usize,
    len: usize,
}

#[derive(Debug, Copy, Clone)]
enum RawPrefix {
    Empty,
    Interned(usize),
    Spanned(Span),
}

#[derive(Debug, Copy, Clone)]
enum NodeValue {
    None,
    Span {
        offset: usize,
        len: usize,
        escaped: bool,
    },
    Char(char),
}

#[derive(Debug)]
struct CurrentNode {
    kind: Option<NodeKind>,
    value: NodeValue,
    exits_scope: bool,
}

#[derive(Debug)]
struct ElementFrame {
    /// The qualified name exactly as it appeared, for the bytewise
    /// end-tag comparison.
    raw_name: Vec<u8>,
    prefix: Option<String>,
    local_part: String,
    namespace: Option<String>,
    n_bindings: usize,
}

#[derive(Debug)]
struct NamespaceBinding {
    prefix: String,
    uri: String,
}

#[derive(Debug)]
struct AttributeRecord {
    prefix: RawPrefix,
    local: Span,
    value: Span,
    escaped: bool,
    quote: Quote,
    kind: AttributeKind,
}

/// A pull reader over UTF-8 XML bytes.
///
/// Each `read` consumes one lexical unit and makes it the current
/// node. Accessors borrow the reader, so spans handed out for one node
/// cannot outlive the `read` that supersedes it.
#[derive(Debug)]
pub struct Reader<R = Empty> {
    cursor: Cursor<R>,
    streaming: bool,
    quota: usize,
    window_start: usize,

    state: ReadState,
    poisoned: Option<usize>,

    node: CurrentNode,
    pending_end_element: bool,

    elements: Vec<ElementFrame>,
    bindings: Vec<NamespaceBinding>,
    attributes: Vec<AttributeRecord>,
    current_attribute: Option<usize>,

    line_starts: Option<Vec<usize>>,
}

impl Reader {
    /// A reader over fully materialized input. No read quota applies.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::build(Cursor::from_vec(bytes.into()), false, DEFAULT_MAX_BYTES_PER_READ)
    }
}

impl<R> Reader<R>
where
    R: Read,
{
    /// A reader that pulls from `source` incrementally. A single
    /// `read` may consume at most `max_bytes_per_read` bytes; a
    /// structural unit that needs more fails with `QuotaExceeded`. A
    /// quota of zero is raised to one byte, the smallest budget under
    /// which any input is visible at all.
    pub fn from_stream(source: R, max_bytes_per_read: usize) -> Self {
        Self::build(Cursor::from_stream(source), true, max_bytes_per_read.max(1))
    }

    fn build(cursor: Cursor<R>, streaming: bool, quota: usize) -> Self {
        Self {
            cursor,
            streaming,
            quota,
            window_start: 0,
            state: ReadState::Initial,
            poisoned: None,
            node: CurrentNode {
                kind: None,
                value: NodeValue::None,
                exits_scope: false,
            },
            pending_end_element: false,
            elements: Vec::new(),
            bindings: vec![
                NamespaceBinding {
                    prefix: "xml".into(),
                    uri: XML_NAMESPACE.into(),
                },
                NamespaceBinding {
                    prefix: "xmlns".into(),
                    uri: XMLNS_NAMESPACE.into(),
                },
            ],
            attributes: Vec::new(),
            current_attribute: None,
            line_starts: None,
        }
    }

    /// Advances to the next node. Returns `Ok(false)` once the input
    /// is exhausted; every later call also returns `Ok(false)`.
    pub fn read(&mut self) -> Result<bool> {
        if matches!(self.state, ReadState::Closed | ReadState::EndOfFile) {
            return Ok(false);
        }
        if let Some(location) = self.poisoned {
            return AlreadyFailedSnafu { location }.fail();
        }

        match self.read_node() {
            Ok(more) => Ok(more),
            Err(e) => {
                self.poisoned = Some(e.location());
                Err(e)
            }
        }
    }

    fn read_node(&mut self) -> Result<bool> {
        self.current_attribute = None;

        if self.node.exits_scope {
            self.exit_scope();
            self.node.exits_scope = false;
        }

        self.attributes.clear();

        if self.pending_end_element {
            self.pending_end_element = false;
            self.node = CurrentNode {
                kind: Some(NodeKind::EndElement),
                value: NodeValue::None,
                exits_scope: true,
            };
            return Ok(true);
        }

        if self.streaming {
            self.window_start = self.cursor.offset();
            self.cursor.set_window(self.window_start, self.quota);
        }

        if self.cursor.at_end()? {
            ensure!(
                self.elements.is_empty(),
                UnexpectedEofSnafu {
                    location: self.cursor.offset(),
                }
            );
            self.state = ReadState::EndOfFile;
            self.node = CurrentNode {
                kind: Some(NodeKind::EndOfFile),
                value: NodeValue::None,
                exits_scope: false,
            };
            return Ok(false);
        }

        let location = self.cursor.offset();
        let b = self.cursor.current_byte()?;
        let outside_root = self.elements.is_empty();

        if b == b'<' {
            self.cursor.skip_byte();
            let b = self.cursor.current_byte()?;
            if b == b'/' {
                self.cursor.skip_byte();
                self.read_end_element()?;
            } else if b == b'!' {
                self.cursor.skip_byte();
                if self.cursor.current_byte()? == b'-' {
                    self.read_comment()?;
                } else {
                    ensure!(!outside_root, InvalidRootContentSnafu { location });
                    self.read_cdata()?;
                }
            } else if b == b'?' {
                self.read_declaration()?;
            } else {
                self.read_start_element()?;
            }
        } else if b.is_special_space_byte() {
            self.read_whitespace()?;
        } else if outside_root && b != b'\r' {
            return InvalidRootContentSnafu { location }.fail();
        } else if b.is_text_byte() {
            self.read_text(false)?;
        } else if b == b'&' {
            self.read_escaped_text()?;
        } else if b == b'\r' {
            self.read_carriage_return()?;
        } else if b == b']' {
            self.read_bracket()?;
        } else if b == 0xEF {
            self.read_text(true)?;
        } else {
            return InvalidByteSnafu { byte: b, location }.fail();
        }

        if self.state == ReadState::Initial {
            self.state = ReadState::Interactive;
        }

        Ok(true)
    }

    // ---------- element scanning ----------

    fn read_start_element(&mut self) -> Result<()> {
        if self.streaming {
            self.buffer_element()?;
        }

        let name_start = self.cursor.offset();
        let (prefix, local) = self.scan_qualified_name()?;
        let raw_len = self.cursor.offset() - name_start;

        let frame = ElementFrame {
            raw_name: self.cursor.slice(name_start, raw_len).to_vec(),
            prefix: self.prefix_str(prefix).map(str::to_owned),
            local_part: self.name_str(local).to_owned(),
            namespace: None,
            n_bindings: 0,
        };
        self.elements.push(frame);

        let terminator = self.scan_attributes()?;
        ensure!(
            terminator != b'?',
            UnexpectedTokenSnafu {
                expected: ">",
                found: terminator.found_token(),
                location: self.cursor.offset(),
            }
        );

        let namespace = match self.prefix_str(prefix) {
            Some(p) => match self.lookup_namespace(p) {
                Some(uri) => Some(uri.to_owned()),
                None => {
                    return UndefinedPrefixSnafu {
                        prefix: p.to_owned(),
                        location: name_start,
                    }
                    .fail()
                }
            },
            None => self.lookup_namespace("").map(str::to_owned),
        };
        if let Some(frame) = self.elements.last_mut() {
            frame.namespace = namespace;
        }

        if terminator == b'/' {
            self.cursor.skip_byte();
            self.pending_end_element = true;
        }
        self.require_byte(b'>', ">")?;

        self.node = CurrentNode {
            kind: Some(NodeKind::StartElement),
            value: NodeValue::None,
            exits_scope: false,
        };
        Ok(())
    }

    fn read_end_element(&mut self) -> Result<()> {
        let name_start = self.cursor.offset();
        let (matched, expected_len) = {
            let expected = self
                .elements
                .last()
                .map(|f| f.raw_name.as_slice())
                .unwrap_or_default();
            let window = self.cursor.fill(expected.len() + 1)?;
            let matched = !expected.is_empty()
                && window.len() >= expected.len()
                && window[..expected.len()] == *expected
                && window.get(expected.len()).map_or(true, |b| !b.is_name_byte());
            (matched, expected.len())
        };

        if matched {
            self.cursor.advance(expected_len);
        } else {
            let expected = self
                .elements
                .last()
                .map_or_else(String::new, |f| String::from_utf8_lossy(&f.raw_name).into_owned());
            // Scan the name properly so the failure can report it.
            let _ = self.scan_qualified_name()?;
            let found_len = self.cursor.offset() - name_start;
            let found = String::from_utf8_lossy(self.cursor.slice(name_start, found_len)).into_owned();
            return TagMismatchSnafu {
                expected,
                found,
                location: name_start,
            }
            .fail();
        }

        self.skip_whitespace()?;
        self.require_byte(b'>', ">")?;

        self.node = CurrentNode {
            kind: Some(NodeKind::EndElement),
            value: NodeValue::None,
            exits_scope: true,
        };
        Ok(())
    }

    /// Advisory streaming lookahead: extends the buffer until it holds
    /// the element's closing `>` (respecting quoted values), so the
    /// element is usually scanned out of one contiguous window. Any
    /// shortfall just stops the lookahead.
    fn buffer_element(&mut self) -> Result<()> {
        let mut want = 128;
        loop {
            let window = match self.cursor.fill(want) {
                Ok(window) => window,
                Err(_) => return Ok(()),
            };

            let mut quote = None;
            for &b in window {
                match quote {
                    Some(q) => {
                        if b == q {
                            quote = None;
                        }
                    }
                    None => match b {
                        b'"' | b'\'' => quote = Some(b),
                        b'>' => return Ok(()),
                        _ => {}
                    },
                }
            }

            if window.len() < want {
                return Ok(());
            }
            want += 128;
        }
    }

    // ---------- names ----------

    /// Consumes one `FirstNameChar NameChar*` run. Returns its length
    /// and an OR-accumulator over the consumed bytes; a first byte
    /// that is a name byte but not a first-name byte poisons the
    /// accumulator so the slow-path validation runs.
    fn scan_name_run(&mut self) -> Result<(usize, u8)> {
        let mut acc = 0u8;
        let mut len = 0;
        loop {
            let (n, complete) = {
                let window = self.cursor.fill(1)?;
                let mut n = 0;
                let mut complete = window.is_empty();
                for &b in window {
                    if !b.is_name_byte() {
                        complete = true;
                        break;
                    }
                    if len + n == 0 && !b.is_first_name_byte() {
                        acc |= 0x80;
                    }
                    acc |= b;
                    n += 1;
                }
                (n, complete)
            };
            self.cursor.advance(n);
            len += n;
            if complete {
                return Ok((len, acc));
            }
        }
    }

    fn scan_qualified_name(&mut self) -> Result<(RawPrefix, Span)> {
        let start = self.cursor.offset();
        let (first_len, mut acc) = self.scan_name_run()?;

        let has_colon = first_len > 0 && {
            let window = self.cursor.fill(1)?;
            window.first() == Some(&b':')
        };

        let (prefix, local) = if has_colon {
            self.cursor.skip_byte();
            let local_start = self.cursor.offset();
            let (local_len, local_acc) = self.scan_name_run()?;
            acc |= local_acc;

            let prefix_byte = self.cursor.slice(start, 1)[0];
            let prefix = if first_len == 1 && prefix_byte.is_ascii_lowercase() {
                RawPrefix::Interned((prefix_byte - b'a') as usize)
            } else {
                RawPrefix::Spanned(Span {
                    offset: start,
                    len: first_len,
                })
            };

            (
                prefix,
                Span {
                    offset: local_start,
                    len: local_len,
                },
            )
        } else {
            (
                RawPrefix::Empty,
                Span {
                    offset: start,
                    len: first_len,
                },
            )
        };

        ensure!(
            local.len > 0,
            NameSyntaxSnafu {
                name: String::new(),
                location: local.offset,
            }
        );

        if acc >= 0x80 {
            if let RawPrefix::Spanned(span) = prefix {
                self.verify_nc_name(span)?;
            }
            self.verify_nc_name(local)?;
        }

        Ok((prefix, local))
    }

    fn verify_nc_name(&self, span: Span) -> Result<()> {
        let bytes = self.cursor.slice(span.offset, span.len);
        ensure!(
            bytes.is_nc_name(),
            NameSyntaxSnafu {
                name: String::from_utf8_lossy(bytes),
                location: span.offset,
            }
        );
        Ok(())
    }

    fn name_str(&self, span: Span) -> &str {
        let bytes = self.cursor.slice(span.offset, span.len);
        // SAFETY: name runs are either all-ASCII (the OR-accumulator
        // stayed below 0x80) or were validated as NCNames, which
        // includes a UTF-8 check.
        unsafe { str::from_utf8_unchecked(bytes) }
    }

    fn prefix_str(&self, prefix: RawPrefix) -> Option<&str> {
        match prefix {
            RawPrefix::Empty => None,
            RawPrefix::Interned(i) => Some(ALPHA_PREFIXES[i]),
            RawPrefix::Spanned(span) => Some(self.name_str(span)),
        }
    }

    // ---------- attributes ----------

    /// Scans zero or more attributes, stopping just before `>`, `/`,
    /// or `?` and returning that byte unconsumed.
    fn scan_attributes(&mut self) -> Result<u8> {
        let mut first = true;
        let terminator = loop {
            let skipped = self.skip_whitespace()?;
            let b = self.cursor.current_byte()?;
            if matches!(b, b'>' | b'/' | b'?') {
                break b;
            }
            ensure!(
                first || skipped > 0,
                MissingAttributeSeparatorSnafu {
                    location: self.cursor.offset(),
                }
            );
            first = false;
            self.scan_attribute()?;
        };

        if self.streaming {
            let consumed = self.cursor.offset() - self.window_start;
            ensure!(
                consumed <= self.quota,
                QuotaExceededSnafu {
                    quota: self.quota,
                    location: self.cursor.offset(),
                }
            );
        }

        Ok(terminator)
    }

    fn scan_attribute(&mut self) -> Result<()> {
        let (prefix, local) = self.scan_qualified_name()?;
        self.skip_whitespace()?;
        self.require_byte(b'=', "=")?;
        self.skip_whitespace()?;
        let quote = self.require_quote()?;
        let (value, escaped) = self.scan_attribute_value(quote)?;

        let kind = if self.prefix_str(prefix) == Some("xmlns") {
            AttributeKind::Namespace
        } else if matches!(prefix, RawPrefix::Empty)
            && self.cursor.slice(local.offset, local.len) == b"xmlns"
        {
            AttributeKind::Namespace
        } else if self.prefix_str(prefix) == Some("xml") {
            AttributeKind::Reserved
        } else {
            AttributeKind::Ordinary
        };

        if kind == AttributeKind::Namespace && !self.elements.is_empty() {
            let binding_prefix = match prefix {
                RawPrefix::Empty => String::new(),
                _ => self.name_str(local).to_owned(),
            };
            let uri = match str::from_utf8(self.cursor.slice(value.offset, value.len)) {
                Ok(uri) => uri.to_owned(),
                Err(_) => {
                    return InvalidUtf8Snafu {
                        location: value.offset,
                    }
                    .fail()
                }
            };
            self.bindings.push(NamespaceBinding {
                prefix: binding_prefix,
                uri,
            });
            if let Some(frame) = self.elements.last_mut() {
                frame.n_bindings += 1;
            }
        }

        self.attributes.push(AttributeRecord {
            prefix,
            local,
            value,
            escaped,
            quote,
            kind,
        });
        Ok(())
    }

    fn scan_attribute_value(&mut self, quote: Quote) -> Result<(Span, bool)> {
        let start = self.cursor.offset();
        let mut escaped = false;
        loop {
            let (n, complete) = {
                let window = self.cursor.fill(1)?;
                match window.iter().position(|b| !b.is_attribute_text_byte()) {
                    Some(i) => (i, true),
                    None => (window.len(), window.is_empty()),
                }
            };
            self.cursor.advance(n);
            if !complete {
                continue;
            }

            let b = self.cursor.current_byte()?;
            if b == quote.to_ascii_char() {
                let span = Span {
                    offset: start,
                    len: self.cursor.offset() - start,
                };
                self.cursor.skip_byte();
                return Ok((span, escaped));
            }
            match b {
                b'&' => {
                    // Decoded for validation only; the raw span is kept.
                    self.scan_char_ref()?;
                    escaped = true;
                }
                b'"' | b'\'' => self.cursor.skip_byte(),
                b'\n' | b'\r' | b'\t' => {
                    self.cursor.skip_byte();
                    escaped = true;
                }
                0xEF => self.require_non_fffe()?,
                _ => {
                    return UnexpectedTokenSnafu {
                        expected: quote.as_str(),
                        found: b.found_token(),
                        location: self.cursor.offset(),
                    }
                    .fail()
                }
            }
        }
    }

    // ---------- comments, CDATA, declaration ----------

    fn read_comment(&mut self) -> Result<()> {
        self.require_literal(b"--", "--")?;
        let start = self.cursor.offset();
        let len = loop {
            let (n, complete) = {
                let window = self.cursor.fill(1)?;
                match window
                    .iter()
                    .position(|&b| b == b'-' || !b.is_comment_byte())
                {
                    Some(i) => (i, true),
                    None => (window.len(), window.is_empty()),
                }
            };
            self.cursor.advance(n);
            if !complete {
                continue;
            }

            let b = self.cursor.current_byte()?;
            match b {
                b'-' => {
                    let (b1, b2) = {
                        let bytes = self.cursor.require(3)?;
                        (bytes[1], bytes[2])
                    };
                    if b1 == b'-' {
                        ensure!(
                            b2 == b'>',
                            InvalidCommentContentSnafu {
                                location: self.cursor.offset(),
                            }
                        );
                        let len = self.cursor.offset() - start;
                        self.cursor.advance(3);
                        break len;
                    }
                    // A lone hyphen is ordinary content.
                    self.cursor.skip_byte();
                }
                0xEF => self.require_non_fffe()?,
                _ => {
                    return InvalidByteSnafu {
                        byte: b,
                        location: self.cursor.offset(),
                    }
                    .fail()
                }
            }
        };

        self.node = CurrentNode {
            kind: Some(NodeKind::Comment),
            value: NodeValue::Span {
                offset: start,
                len,
                escaped: false,
            },
            exits_scope: false,
        };
        Ok(())
    }

    fn read_cdata(&mut self) -> Result<()> {
        self.require_literal(b"[CDATA[", "[CDATA[")?;
        let start = self.cursor.offset();
        let len = loop {
            let (n, found) = {
                let window = self.cursor.fill(1)?;
                match memchr2(b']', 0xEF, window) {
                    Some(i) => (i, window.get(i).copied()),
                    None => (window.len(), None),
                }
            };
            self.cursor.advance(n);

            match found {
                Some(b']') => {
                    let (b1, b2) = {
                        let bytes = self.cursor.require(3)?;
                        (bytes[1], bytes[2])
                    };
                    if b1 == b']' && b2 == b'>' {
                        let len = self.cursor.offset() - start;
                        self.cursor.advance(3);
                        break len;
                    }
                    self.cursor.skip_byte();
                }
                Some(_) => self.require_non_fffe()?,
                None => {
                    // Force a refill; end of input here is an error.
                    self.cursor.require(1)?;
                }
            }
        };

        self.node = CurrentNode {
            kind: Some(NodeKind::CData),
            value: NodeValue::Span {
                offset: start,
                len,
                escaped: false,
            },
            exits_scope: false,
        };
        Ok(())
    }

    fn read_declaration(&mut self) -> Result<()> {
        if self.streaming {
            self.buffer_element()?;
        }

        let location = self.cursor.offset();
        {
            let window = self.cursor.fill(5)?;
            let well_formed =
                window.len() >= 5 && window.starts_with(b"?xml") && window[4].is_space_byte();
            // Processing instructions are unsupported, so anything
            // else after `<?` is rejected outright.
            ensure!(
                well_formed,
                UnexpectedTokenSnafu {
                    expected: "?xml",
                    found: String::from_utf8_lossy(&window[..window.len().min(5)]),
                    location,
                }
            );
        }
        ensure!(
            self.state == ReadState::Initial,
            DeclarationNotFirstSnafu { location }
        );
        self.cursor.advance(5);

        let value_start = self.cursor.offset();
        let terminator = self.scan_attributes()?;
        let mut value_len = self.cursor.offset() - value_start;

        // Back the trailing whitespace out of the value span.
        while value_len > 0 {
            let b = self.cursor.slice(value_start, value_len)[value_len - 1];
            if !b.is_space_byte() {
                break;
            }
            value_len -= 1;
        }

        ensure!(
            terminator == b'?',
            UnexpectedTokenSnafu {
                expected: "?>",
                found: terminator.found_token(),
                location: self.cursor.offset(),
            }
        );
        self.require_literal(b"?>", "?>")?;

        self.node = CurrentNode {
            kind: Some(NodeKind::Declaration),
            value: NodeValue::Span {
                offset: value_start,
                len: value_len,
                escaped: false,
            },
            exits_scope: false,
        };
        Ok(())
    }

    // ---------- text ----------

    fn read_whitespace(&mut self) -> Result<()> {
        let start = self.cursor.offset();
        let len = {
            let min = if self.streaming { MAX_TEXT_CHUNK } else { 1 };
            let window = self.cursor.fill(min)?;
            let cap = if self.streaming {
                MAX_TEXT_CHUNK
            } else {
                window.len()
            };
            let window = &window[..window.len().min(cap)];
            window
                .iter()
                .position(|b| !b.is_special_space_byte())
                .unwrap_or(window.len())
        };
        self.cursor.advance(len);

        self.node = CurrentNode {
            kind: Some(NodeKind::Text(TextKind::Whitespace)),
            value: NodeValue::Span {
                offset: start,
                len,
                escaped: false,
            },
            exits_scope: false,
        };
        Ok(())
    }

    fn read_text(&mut self, watched: bool) -> Result<()> {
        let start = self.cursor.offset();
        let mut len = if watched {
            self.scan_watched_text()?
        } else {
            self.scan_plain_text()?
        };

        if self.streaming {
            // Never split a UTF-8 sequence at the chunk edge.
            let window = self.cursor.fill(1)?;
            len = break_text(&window[..len.min(window.len())]);
        }

        let kind = {
            let window = self.cursor.fill(1)?;
            match (window.get(len), window.get(len + 1)) {
                (Some(b'<'), Some(next)) if *next != b'!' => TextKind::Atomic,
                _ => TextKind::Complex,
            }
        };
        self.cursor.advance(len);

        self.node = CurrentNode {
            kind: Some(NodeKind::Text(kind)),
            value: NodeValue::Span {
                offset: start,
                len,
                escaped: false,
            },
            exits_scope: false,
        };
        Ok(())
    }

    fn scan_plain_text(&mut self) -> Result<usize> {
        let min = if self.streaming { MAX_TEXT_CHUNK } else { 1 };
        let window = self.cursor.fill(min)?;
        let cap = if self.streaming {
            MAX_TEXT_CHUNK
        } else {
            window.len()
        };
        let window = &window[..window.len().min(cap)];
        Ok(window
            .iter()
            .position(|b| !b.is_text_byte())
            .unwrap_or(window.len()))
    }

    /// Text scan that vets every 0xEF-led sequence against U+FFFE and
    /// U+FFFF. Does not advance the cursor.
    fn scan_watched_text(&mut self) -> Result<usize> {
        let start = self.cursor.offset();
        let mut n = 0;
        loop {
            let mut need_more = false;
            {
                let min = if self.streaming { MAX_TEXT_CHUNK } else { 1 };
                let window = self.cursor.fill(min)?;
                let cap = if self.streaming {
                    MAX_TEXT_CHUNK
                } else {
                    window.len()
                };
                let window = &window[..window.len().min(cap)];

                while n < window.len() {
                    let b = window[n];
                    if b != 0xEF {
                        if !b.is_text_byte() {
                            return Ok(n);
                        }
                        n += 1;
                    } else if n + 2 < window.len() {
                        ensure!(
                            !(window[n + 1] == 0xBF && matches!(window[n + 2], 0xBE | 0xBF)),
                            InvalidCharacterSnafu { location: start + n }
                        );
                        n += 3;
                    } else if n > 0 {
                        // End the run before the partial sequence; the
                        // next read resumes at the 0xEF byte.
                        return Ok(n);
                    } else {
                        need_more = true;
                        break;
                    }
                }

                if !need_more {
                    return Ok(n);
                }
            }
            self.cursor.require(3)?;
        }
    }

    fn read_escaped_text(&mut self) -> Result<()> {
        let ch = self.scan_char_ref()?;
        let kind = if u32::from(ch) < 256 && (u32::from(ch) as u8).is_space_byte() {
            TextKind::Whitespace
        } else {
            TextKind::Complex
        };

        self.node = CurrentNode {
            kind: Some(NodeKind::Text(kind)),
            value: NodeValue::Char(ch),
            exits_scope: false,
        };
        Ok(())
    }

    fn read_carriage_return(&mut self) -> Result<()> {
        self.cursor.skip_byte();

        // CR+LF collapses into the following whitespace run; a lone CR
        // normalizes to one LF.
        if !self.cursor.at_end()? && self.cursor.current_byte()? == b'\n' {
            return self.read_whitespace();
        }

        self.node = CurrentNode {
            kind: Some(NodeKind::Text(TextKind::Complex)),
            value: NodeValue::Char('\n'),
            exits_scope: false,
        };
        Ok(())
    }

    fn read_bracket(&mut self) -> Result<()> {
        let location = self.cursor.offset();
        let is_cdata_end = {
            let bytes = self.cursor.require(3)?;
            &bytes[..3] == b"]]>"
        };
        ensure!(!is_cdata_end, UnexpectedCDataEndSnafu { location });

        self.cursor.skip_byte();
        self.node = CurrentNode {
            kind: Some(NodeKind::Text(TextKind::Complex)),
            value: NodeValue::Char(']'),
            exits_scope: false,
        };
        Ok(())
    }

    // ---------- character references ----------

    /// Scans `&...;` as one span, rewinds, and decodes the whole span
    /// to a single scalar. The cursor ends up past the `;`.
    fn scan_char_ref(&mut self) -> Result<char> {
        let start = self.cursor.offset();
        self.cursor.skip_byte();
        loop {
            let (n, found) = {
                let window = self.cursor.fill(1)?;
                match memchr(b';', window) {
                    Some(i) => (i + 1, true),
                    None => (window.len(), false),
                }
            };
            self.cursor.advance(n);
            if found {
                break;
            }
            if n == 0 {
                // Nothing buffered: either the input ended before the
                // terminator or the quota cut the scan short.
                match self.cursor.require(1).map(|_| ()) {
                    Err(cursor::Error::UnexpectedEof { .. }) => {
                        let len = self.cursor.offset() - start;
                        return MalformedEntitySnafu {
                            entity: String::from_utf8_lossy(self.cursor.slice(start, len)),
                            location: start,
                        }
                        .fail();
                    }
                    Err(e) => return Err(e.into()),
                    Ok(()) => {}
                }
            }
        }

        let len = self.cursor.offset() - start;
        self.cursor.seek(start);
        let decoded = {
            let entity = self.cursor.slice(start, len);
            decode_char_ref(&entity[1..len - 1])
        };
        let ch = match decoded {
            Some(ch) => ch,
            None => {
                return MalformedEntitySnafu {
                    entity: String::from_utf8_lossy(self.cursor.slice(start, len)),
                    location: start,
                }
                .fail()
            }
        };
        self.cursor.advance(len);
        Ok(ch)
    }

    // ---------- low-level helpers ----------

    fn skip_whitespace(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            let (n, complete) = {
                let window = self.cursor.fill(1)?;
                match window.iter().position(|b| !b.is_space_byte()) {
                    Some(i) => (i, true),
                    None => (window.len(), window.is_empty()),
                }
            };
            self.cursor.advance(n);
            total += n;
            if complete {
                return Ok(total);
            }
        }
    }

    fn require_byte(&mut self, expected: u8, token: &'static str) -> Result<()> {
        let location = self.cursor.offset();
        let found = self.cursor.current_byte()?;
        ensure!(
            found == expected,
            UnexpectedTokenSnafu {
                expected: token,
                found: found.found_token(),
                location,
            }
        );
        self.cursor.skip_byte();
        Ok(())
    }

    fn require_literal(&mut self, literal: &'static [u8], token: &'static str) -> Result<()> {
        let location = self.cursor.offset();
        let matched = {
            let window = self.cursor.fill(literal.len())?;
            if window.starts_with(literal) {
                Ok(())
            } else {
                Err(String::from_utf8_lossy(&window[..window.len().min(literal.len())]).into_owned())
            }
        };
        match matched {
            Ok(()) => {
                self.cursor.advance(literal.len());
                Ok(())
            }
            Err(found) => UnexpectedTokenSnafu {
                expected: token,
                found,
                location,
            }
            .fail(),
        }
    }

    fn require_quote(&mut self) -> Result<Quote> {
        let location = self.cursor.offset();
        let found = self.cursor.current_byte()?;
        let quote = match found {
            b'"' => Quote::Double,
            b'\'' => Quote::Single,
            _ => {
                return UnexpectedTokenSnafu {
                    expected: "\"",
                    found: found.found_token(),
                    location,
                }
                .fail()
            }
        };
        self.cursor.skip_byte();
        Ok(quote)
    }

    /// At a 0xEF lead byte: rejects the three-byte encodings of
    /// U+FFFE and U+FFFF, consumes any other sequence.
    fn require_non_fffe(&mut self) -> Result<()> {
        let location = self.cursor.offset();
        let (b1, b2) = {
            let bytes = self.cursor.require(3)?;
            (bytes[1], bytes[2])
        };
        ensure!(
            !(b1 == 0xBF && matches!(b2, 0xBE | 0xBF)),
            InvalidCharacterSnafu { location }
        );
        self.cursor.advance(3);
        Ok(())
    }

    fn exit_scope(&mut self) {
        if let Some(frame) = self.elements.pop() {
            self.bindings.truncate(self.bindings.len() - frame.n_bindings);
        }
    }

    // ---------- the public node surface ----------

    pub fn node_kind(&self) -> Option<NodeKind> {
        if self.current_attribute.is_some() {
            return Some(NodeKind::Attribute);
        }
        self.node.kind
    }

    pub fn name(&self) -> Option<Name<'_>> {
        if let Some(a) = self.current_attribute.and_then(|i| self.attributes.get(i)) {
            return Some(Name {
                prefix: self.prefix_str(a.prefix),
                local_part: self.name_str(a.local),
            });
        }
        match self.node.kind? {
            NodeKind::StartElement | NodeKind::EndElement => self.elements.last().map(|f| Name {
                prefix: f.prefix.as_deref(),
                local_part: &f.local_part,
            }),
            NodeKind::Declaration => Some(Name {
                prefix: None,
                local_part: "xml",
            }),
            _ => None,
        }
    }

    /// The resolved namespace of the current element, if any.
    pub fn namespace(&self) -> Option<&str> {
        match self.node.kind? {
            NodeKind::StartElement | NodeKind::EndElement => {
                self.elements.last()?.namespace.as_deref()
            }
            _ => None,
        }
    }

    pub fn value(&self) -> Option<Value<'_>> {
        if let Some(a) = self.current_attribute.and_then(|i| self.attributes.get(i)) {
            return Some(Value::Bytes {
                bytes: self.cursor.slice(a.value.offset, a.value.len),
                escaped: a.escaped,
            });
        }
        match self.node.value {
            NodeValue::None => None,
            NodeValue::Span {
                offset,
                len,
                escaped,
            } => Some(Value::Bytes {
                bytes: self.cursor.slice(offset, len),
                escaped,
            }),
            NodeValue::Char(ch) => Some(Value::Char(ch)),
        }
    }

    /// The quote character around the current attribute's value.
    pub fn quote(&self) -> Option<Quote> {
        self.current_attribute
            .and_then(|i| self.attributes.get(i))
            .map(|a| a.quote)
    }

    /// Whether the current node closes its enclosing element scope.
    pub fn exits_scope(&self) -> bool {
        self.node.exits_scope
    }

    pub fn attributes(&self) -> impl Iterator<Item = Attribute<'_>> + '_ {
        self.attributes.iter().map(move |a| Attribute {
            name: Name {
                prefix: self.prefix_str(a.prefix),
                local_part: self.name_str(a.local),
            },
            value: self.cursor.slice(a.value.offset, a.value.len),
            escaped: a.escaped,
            quote: a.quote,
            kind: a.kind,
        })
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    /// Makes attribute `index` the current node. Fails (returns
    /// `false`) when the current node carries no attributes or the
    /// index is out of range.
    pub fn move_to_attribute(&mut self, index: usize) -> bool {
        let has_attributes = matches!(
            self.node.kind,
            Some(NodeKind::StartElement | NodeKind::Declaration)
        );
        if has_attributes && index < self.attributes.len() {
            self.current_attribute = Some(index);
            true
        } else {
            false
        }
    }

    /// Moves back from an attribute to its element.
    pub fn move_to_element(&mut self) -> bool {
        self.current_attribute.take().is_some()
    }

    /// Resolves a prefix against the bindings in scope. The empty
    /// prefix resolves the default namespace.
    pub fn lookup_namespace(&self, prefix: &str) -> Option<&str> {
        self.bindings
            .iter()
            .rev()
            .find(|b| b.prefix == prefix)
            .map(|b| b.uri.as_str())
    }

    pub fn depth(&self) -> usize {
        self.elements.len()
    }

    pub fn offset(&self) -> usize {
        self.cursor.offset()
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    pub fn position(&mut self) -> Position {
        self.position_of(self.cursor.offset())
    }

    /// Translates an absolute byte offset (e.g. an error location)
    /// into line and column. Builds the line index on first use.
    /// Offsets before the retained window are clamped to its start,
    /// so streaming readers never produce a position they cannot see.
    pub fn position_of(&mut self, offset: usize) -> Position {
        let starts = self
            .line_starts
            .get_or_insert_with(|| self.cursor.line_starts());

        let offset = usize::max(offset, starts[0]);

        let mut line = 0;
        while line + 1 < starts.len() && starts[line + 1] < offset {
            line += 1;
        }

        Position {
            line: line + 1,
            column: offset - starts[line] + 1,
        }
    }

    /// Stops the reader and releases the line index. Further reads
    /// return `Ok(false)`.
    pub fn close(&mut self) {
        self.state = ReadState::Closed;
        self.line_starts = None;
    }
}

/// Shortens a streaming chunk so it never ends inside a multi-byte
/// UTF-8 sequence. Returns the full length when no safe break point
/// exists within the trailing sequence.
fn break_text(chunk: &[u8]) -> usize {
    let original = chunk.len();
    if original == 0 || chunk[original - 1] & 0x80 != 0x80 {
        return original;
    }

    // Walk back to the lead byte of the trailing sequence.
    let mut length = original;
    loop {
        length -= 1;
        if length == 0 || chunk[length] & 0xC0 == 0xC0 {
            break;
        }
    }
    if length == 0 {
        return original;
    }

    // How many bytes the lead byte promises.
    let mut b = chunk[length] << 2;
    let mut byte_count = 2;
    while b & 0x80 == 0x80 {
        b <<= 1;
        byte_count += 1;
        if byte_count > 4 {
            return original;
        }
    }

    if length + byte_count == original {
        return original;
    }
    length
}

/// Decodes the body of a character reference (between `&` and `;`).
fn decode_char_ref(body: &[u8]) -> Option<char> {
    match body {
        b"amp" => return Some('&'),
        b"lt" => return Some('<'),
        b"gt" => return Some('>'),
        b"quot" => return Some('"'),
        b"apos" => return Some('\''),
        _ => {}
    }

    let digits = body.strip_prefix(b"#")?;
    let (digits, radix) = match digits.strip_prefix(b"x") {
        Some(hex) => (hex, 16),
        None => (digits, 10),
    };
    if digits.is_empty() {
        return None;
    }

    let mut value: u32 = 0;
    for &b in digits {
        let digit = char::from(b).to_digit(radix)?;
        value = value.checked_mul(radix)?.checked_add(digit)?;
    }

    if value == 0 || value == 0xFFFE || value == 0xFFFF {
        return None;
    }
    char::from_u32(value)
}

#[ext]
impl u8 {
    fn found_token(&self) -> String {
        char::from(*self).to_string()
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The name {name:?} at byte {location} is not a valid NCName"))]
    NameSyntax { name: String, location: usize },

    #[snafu(display("Expected {expected:?} at byte {location}, but found {found:?}"))]
    UnexpectedToken {
        expected: &'static str,
        found: String,
        location: usize,
    },

    #[snafu(display(
        "The end tag {found:?} at byte {location} does not match the open element {expected:?}"
    ))]
    TagMismatch {
        expected: String,
        found: String,
        location: usize,
    },

    #[snafu(display("Attributes at byte {location} must be separated by whitespace"))]
    MissingAttributeSeparator { location: usize },

    #[snafu(display("Reading past byte {location} would exceed the read quota of {quota} bytes"))]
    QuotaExceeded { quota: usize, location: usize },

    #[snafu(display("The character at byte {location} is U+FFFE or U+FFFF, which XML forbids"))]
    InvalidCharacter { location: usize },

    #[snafu(display("Content at byte {location} is not allowed outside the root element"))]
    InvalidRootContent { location: usize },

    #[snafu(display("The sequence ]]> at byte {location} is not allowed outside a CDATA section"))]
    UnexpectedCDataEnd { location: usize },

    #[snafu(display("The declaration at byte {location} is not the first token of the document"))]
    DeclarationNotFirst { location: usize },

    #[snafu(display("The character reference {entity:?} at byte {location} is malformed"))]
    MalformedEntity { entity: String, location: usize },

    #[snafu(display("The comment at byte {location} contains -- without closing the comment"))]
    InvalidCommentContent { location: usize },

    #[snafu(display("The byte {byte:#04X} at {location} is not allowed in XML content"))]
    InvalidByte { byte: u8, location: usize },

    #[snafu(display("The prefix {prefix:?} at byte {location} is not bound to a namespace"))]
    UndefinedPrefix { prefix: String, location: usize },

    #[snafu(display("The bytes at {location} are not UTF-8"))]
    InvalidUtf8 { location: usize },

    #[snafu(display("Needed more input at byte {location}, but the input was exhausted"))]
    UnexpectedEof { location: usize },

    #[snafu(display("Unable to read more input at byte {location}"))]
    Io {
        source: std::io::Error,
        location: usize,
    },

    #[snafu(display("The reader failed at byte {location} and cannot continue"))]
    AlreadyFailed { location: usize },
}

impl Error {
    /// The absolute byte offset the failure refers to.
    pub fn location(&self) -> usize {
        use Error::*;

        match self {
            NameSyntax { location, .. }
            | UnexpectedToken { location, .. }
            | TagMismatch { location, .. }
            | MissingAttributeSeparator { location }
            | QuotaExceeded { location, .. }
            | InvalidCharacter { location }
            | InvalidRootContent { location }
            | UnexpectedCDataEnd { location }
            | DeclarationNotFirst { location }
            | MalformedEntity { location, .. }
            | InvalidCommentContent { location }
            | InvalidByte { location, .. }
            | UndefinedPrefix { location, .. }
            | InvalidUtf8 { location }
            | UnexpectedEof { location }
            | Io { location, .. }
            | AlreadyFailed { location } => *location,
        }
    }
}

impl From<cursor::Error> for Error {
    fn from(e: cursor::Error) -> Self {
        match e {
            cursor::Error::UnexpectedEof { location } => Self::UnexpectedEof { location },
            cursor::Error::QuotaExceeded { quota, location } => {
                Self::QuotaExceeded { quota, location }
            }
            cursor::Error::Io { source, location } => Self::Io { source, location },
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
