//! Destinations for encoded log lines

use std::{
    fmt,
    io::{self, BufWriter, Stdout, Write},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

enum Target {
    Stdout(BufWriter<Stdout>),
    Memory(Vec<u8>),
    Writer(Box<dyn Write + Send>),
}

impl Write for Target {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stdout(out) => out.write(buf),
            Self::Memory(bytes) => bytes.write(buf),
            Self::Writer(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stdout(out) => out.flush(),
            Self::Memory(_) => Ok(()),
            Self::Writer(writer) => writer.flush(),
        }
    }
}

/// Shared, buffered output for log records
///
/// Cloning is cheap; every clone appends to the same target. Records are
/// buffered until [`LogSink::flush`] is called or the buffer fills up.
#[derive(Clone)]
pub struct LogSink {
    target: Arc<Mutex<Target>>,
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &*self.target.lock() {
            Target::Stdout(_) => "stdout",
            Target::Memory(_) => "memory",
            Target::Writer(_) => "writer",
        };
        f.debug_struct("LogSink").field("target", &kind).finish()
    }
}

impl LogSink {
    fn from_target(target: Target) -> Self {
        Self {
            target: Arc::new(Mutex::new(target)),
        }
    }

    /// Buffered standard output
    pub fn stdout() -> Self {
        Self::from_target(Target::Stdout(BufWriter::new(io::stdout())))
    }

    /// In-memory buffer, readable through [`LogSink::contents`]
    pub fn memory() -> Self {
        Self::from_target(Target::Memory(Vec::new()))
    }

    /// Any writer, e.g. a file
    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        Self::from_target(Target::Writer(Box::new(writer)))
    }

    /// Everything written so far, for in-memory sinks
    pub fn contents(&self) -> Option<String> {
        match &*self.target.lock() {
            Target::Memory(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    /// Push buffered records to the underlying target
    pub fn flush(&self) -> io::Result<()> {
        self.target.lock().flush()
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.target.lock().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        // One lock per record keeps concurrent lines from interleaving.
        self.target.lock().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.target.lock().flush()
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_collects_writes_from_clones() {
        let sink = LogSink::memory();
        let mut first = sink.clone();
        let mut second = sink.clone();

        first.write_all(b"one\n").unwrap();
        second.write_all(b"two\n").unwrap();

        assert_eq!(sink.contents().as_deref(), Some("one\ntwo\n"));
    }

    #[test]
    fn writer_sink_has_no_readable_contents() {
        let sink = LogSink::writer(io::sink());
        assert!(sink.contents().is_none());
        assert!(sink.flush().is_ok());
    }

    #[test]
    fn debug_names_the_target() {
        assert!(format!("{:?}", LogSink::memory()).contains("memory"));
    }
}
