#![deny(rust_2018_idioms)]

use argh::FromArgs;
use std::{
    env,
    fs::File,
    io::{self, BufWriter, Read, Write},
    str::FromStr,
};
use xylo::{NodeKind, Reader, Value, DEFAULT_MAX_BYTES_PER_READ};

type Error = Box<dyn std::error::Error>;
type Result<T = (), E = Error> = std::result::Result<T, E>;

/// The developer utility for Xylo
#[derive(Debug, FromArgs)]
struct Args {
    /// do not output the parsed nodes
    #[argh(switch, short = 'q')]
    quiet: bool,

    /// read the whole file up front instead of streaming it
    #[argh(switch)]
    buffered: bool,

    /// how many bytes one streaming read may consume
    #[argh(option)]
    max_bytes_per_read: Option<usize>,

    /// the file to read
    #[argh(positional)]
    filename: String,
}

impl Args {
    fn apply_environment_variables(&mut self) {
        self.quiet = self.quiet || env::var_os("QUIET").is_some();
        self.buffered = self.buffered || env::var_os("BUFFERED").is_some();

        self.max_bytes_per_read.ambient_value("MAX_BYTES_PER_READ");
    }

    fn into_options(self) -> Options {
        let Self {
            quiet,
            buffered,
            max_bytes_per_read,
            filename,
        } = self;

        Options {
            quiet,
            buffered,
            max_bytes_per_read: max_bytes_per_read.unwrap_or(DEFAULT_MAX_BYTES_PER_READ),
            filename,
        }
    }
}

#[derive(Debug)]
struct Options {
    quiet: bool,
    buffered: bool,
    max_bytes_per_read: usize,
    filename: String,
}

impl Options {
    fn from_env_and_command_line() -> Self {
        let mut args: Args = argh::from_env();
        args.apply_environment_variables();
        args.into_options()
    }
}

trait AmbientValue {
    fn ambient_value(&mut self, env_var_name: &str);
}

impl<T> AmbientValue for Option<T>
where
    T: FromStr,
{
    fn ambient_value(&mut self, env_var_name: &str) {
        if self.is_none() {
            if let Ok(v) = env::var(env_var_name) {
                *self = v.parse().ok();
            }
        }
    }
}

fn main() -> Result {
    let Options {
        quiet,
        buffered,
        max_bytes_per_read,
        filename,
    } = Options::from_env_and_command_line();

    if buffered {
        let mut bytes = Vec::new();
        File::open(&filename)?.read_to_end(&mut bytes)?;
        let mut reader = Reader::from_bytes(bytes);
        run(&mut reader, quiet)
    } else {
        let file = File::open(&filename)?;
        let mut reader = Reader::from_stream(file, max_bytes_per_read);
        run(&mut reader, quiet)
    }
}

fn run<R: Read>(reader: &mut Reader<R>, quiet: bool) -> Result {
    match stream_output(reader, quiet) {
        Ok(count) => {
            eprintln!("Read {count} nodes");
            Ok(())
        }
        Err(e) => {
            let position = reader.position_of(e.location());
            eprintln!("Error at {position}: {e}");
            Err(e.into())
        }
    }
}

fn stream_output<R: Read>(reader: &mut Reader<R>, quiet: bool) -> Result<usize, xylo::Error> {
    let mut count = 0;

    if quiet {
        let out = io::sink();
        let mut out = BufWriter::new(out);
        while reader.read()? {
            count += 1;
            write_node(reader, &mut out).map_err(io_error(reader))?;
        }
    } else {
        let out = io::stdout();
        let out = out.lock();
        let mut out = BufWriter::new(out);
        while reader.read()? {
            count += 1;
            write_node(reader, &mut out).map_err(io_error(reader))?;
        }
    }

    Ok(count)
}

fn io_error<R>(reader: &Reader<R>) -> impl Fn(io::Error) -> xylo::Error
where
    R: Read,
{
    let location = reader.offset();
    move |source| xylo::Error::Io { source, location }
}

fn write_node<R: Read>(reader: &Reader<R>, out: &mut impl Write) -> io::Result<()> {
    let name = reader.name();
    let name = name.as_ref().map_or_else(String::new, |n| match n.prefix {
        Some(p) => format!("{}:{}", p, n.local_part),
        None => n.local_part.to_owned(),
    });

    match reader.node_kind() {
        Some(NodeKind::StartElement) => {
            write!(out, "StartElement {name}")?;
            for attribute in reader.attributes() {
                let value = String::from_utf8_lossy(attribute.value);
                write!(out, " {}={:?}", attribute.name.local_part, value)?;
            }
            writeln!(out)
        }
        Some(NodeKind::EndElement) => writeln!(out, "EndElement {name}"),
        Some(NodeKind::Text(kind)) => match reader.value() {
            Some(Value::Bytes { bytes, .. }) => {
                writeln!(out, "Text({kind:?}) {:?}", String::from_utf8_lossy(bytes))
            }
            Some(Value::Char(ch)) => writeln!(out, "Text({kind:?}) {ch:?}"),
            None => writeln!(out, "Text({kind:?})"),
        },
        Some(NodeKind::Comment) | Some(NodeKind::CData) | Some(NodeKind::Declaration) => {
            let kind = reader.node_kind();
            match reader.value() {
                Some(Value::Bytes { bytes, .. }) => {
                    writeln!(out, "{kind:?} {:?}", String::from_utf8_lossy(bytes))
                }
                _ => writeln!(out, "{kind:?}"),
            }
        }
        other => writeln!(out, "{other:?}"),
    }
}

