#![deny(rust_2018_idioms)]

//! A streaming, byte-oriented reader for UTF-8 XML.
//!
//! The interesting pieces live in the member crates; this crate
//! stitches them together into one surface:
//!
//! - [`chartype`] — the 256-entry byte classification table the
//!   scanners dispatch on.
//! - [`Cursor`] — buffered and incremental input with absolute
//!   offsets, windows, and read quotas.
//! - [`Reader`] — the pull API, where each [`read`](Reader::read)
//!   makes the next lexical unit the current node.
//!
//! ```
//! use xylo::{NodeKind, Reader};
//!
//! # fn main() -> xylo::Result<()> {
//! let mut reader = Reader::from_bytes(r#"<greeting lang="en">hello</greeting>"#);
//!
//! while reader.read()? {
//!     if reader.node_kind() == Some(NodeKind::StartElement) {
//!         for attribute in reader.attributes() {
//!             println!("{} = {:?}", attribute.name.local_part, attribute.value);
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub use chartype;
pub use cursor::Cursor;
pub use reader::{
    Attribute, AttributeKind, Error, Name, NodeKind, Position, Quote, ReadState, Reader, Result,
    TextKind, Value, DEFAULT_MAX_BYTES_PER_READ, MAX_TEXT_CHUNK,
};
