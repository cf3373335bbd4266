#![deny(rust_2018_idioms)]

use xylo::{NodeKind, Reader, TextKind, Value, DEFAULT_MAX_BYTES_PER_READ};

type Error = Box<dyn std::error::Error>;
type Result<T = (), E = Error> = std::result::Result<T, E>;

const DOCUMENT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<order xmlns="urn:orders" xmlns:c="urn:customers" id="17">
  <!-- the buyer -->
  <c:name title="Dr.">Ada</c:name>
  <note><![CDATA[fragile & <urgent>]]></note>
  <total currency="EUR">12&#x20;50</total>
</order>
"#;

fn collect<R: std::io::Read>(reader: &mut Reader<R>) -> Result<Vec<String>, xylo::Error> {
    let mut nodes = Vec::new();

    while reader.read()? {
        let name = reader.name().map(|n| match n.prefix {
            Some(p) => format!("{}:{}", p, n.local_part),
            None => n.local_part.to_owned(),
        });
        let value = match reader.value() {
            Some(Value::Bytes { bytes, .. }) => String::from_utf8_lossy(bytes).into_owned(),
            Some(Value::Char(ch)) => ch.to_string(),
            None => String::new(),
        };

        nodes.push(match reader.node_kind() {
            Some(NodeKind::StartElement) => format!("<{}>", name.unwrap_or_default()),
            Some(NodeKind::EndElement) => format!("</{}>", name.unwrap_or_default()),
            Some(NodeKind::Text(TextKind::Whitespace)) => "(ws)".to_owned(),
            Some(NodeKind::Text(_)) => format!("{value:?}"),
            Some(NodeKind::Comment) => format!("<!--{value}-->"),
            Some(NodeKind::CData) => format!("[{value}]"),
            Some(NodeKind::Declaration) => format!("<?{value}?>"),
            other => format!("{other:?}"),
        });
    }

    Ok(nodes)
}

#[test]
fn reads_a_whole_document() -> Result {
    let mut reader = Reader::from_bytes(DOCUMENT);

    let nodes = collect(&mut reader)?;

    assert_eq!(
        nodes,
        [
            r#"<?version="1.0" encoding="utf-8"?>"#,
            "(ws)",
            "<order>",
            "(ws)",
            "<!-- the buyer -->",
            "(ws)",
            "<c:name>",
            "\"Ada\"",
            "</c:name>",
            "(ws)",
            "<note>",
            "[fragile & <urgent>]",
            "</note>",
            "(ws)",
            "<total>",
            "\"12\"",
            "(ws)",
            "\"50\"",
            "</total>",
            "(ws)",
            "</order>",
            "(ws)",
        ],
    );

    Ok(())
}

#[test]
fn resolves_namespaces_while_in_scope() -> Result {
    let mut reader = Reader::from_bytes(DOCUMENT);

    reader.read()?; // declaration
    reader.read()?; // whitespace
    reader.read()?; // <order>
    assert_eq!(reader.namespace(), Some("urn:orders"));
    assert_eq!(reader.lookup_namespace("c"), Some("urn:customers"));

    while reader.read()? {
        if reader.node_kind() == Some(NodeKind::StartElement) {
            break;
        }
    }
    // <c:name> picks up the binding from its parent.
    assert_eq!(reader.namespace(), Some("urn:customers"));

    Ok(())
}

#[test]
fn streaming_reads_match_buffered_reads() -> Result {
    let mut buffered = Reader::from_bytes(DOCUMENT);
    let mut streamed = Reader::from_stream(DOCUMENT.as_bytes(), DEFAULT_MAX_BYTES_PER_READ);

    assert_eq!(collect(&mut buffered)?, collect(&mut streamed)?);

    Ok(())
}

#[test]
fn reports_errors_with_their_position() {
    let mut reader = Reader::from_bytes("<a>\n  <b></c>\n</a>");

    let e = loop {
        match reader.read() {
            Ok(true) => {}
            Ok(false) => panic!("expected the mismatched tag to fail"),
            Err(e) => break e,
        }
    };

    let position = reader.position_of(e.location());
    assert_eq!((position.line, position.column), (2, 8));
}
