use super::{LogSink, SinkError};
use crate::formatter::FormattedRecord;
use parking_lot::Mutex;
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

/// Line-oriented console output. Whole lines are written under one lock so
/// concurrent requests never interleave mid-line.
pub struct ConsoleSink {
    stream: ConsoleStream,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    pub fn stdout() -> Self {
        Self {
            stream: ConsoleStream::Stdout,
            writer: Mutex::new(Box::new(io::stdout())),
        }
    }

    pub fn stderr() -> Self {
        Self {
            stream: ConsoleStream::Stderr,
            writer: Mutex::new(Box::new(io::stderr())),
        }
    }

    /// Console sink over an arbitrary writer
    pub fn with_writer(stream: ConsoleStream, writer: Box<dyn Write + Send>) -> Self {
        Self {
            stream,
            writer: Mutex::new(writer),
        }
    }

    pub fn stream(&self) -> ConsoleStream {
        self.stream
    }
}

impl LogSink for ConsoleSink {
    fn name(&self) -> &'static str {
        match self.stream {
            ConsoleStream::Stdout => "stdout",
            ConsoleStream::Stderr => "stderr",
        }
    }

    fn write(&self, record: &FormattedRecord) -> Result<(), SinkError> {
        let mut line = record.to_line();
        line.push('\n');

        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Shared in-memory writer for inspecting console output
    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_lines_are_newline_terminated() {
        let capture = Capture::default();
        let sink = ConsoleSink::with_writer(ConsoleStream::Stdout, Box::new(capture.clone()));

        sink.write(&FormattedRecord::Line("{\"a\":1}".into())).unwrap();
        sink.write(&FormattedRecord::Line("{\"a\":2}".into())).unwrap();

        let output = String::from_utf8(capture.0.lock().clone()).unwrap();
        assert_eq!(output, "{\"a\":1}\n{\"a\":2}\n");
        assert_eq!(sink.name(), "stdout");
    }

    #[test]
    fn test_concurrent_writes_do_not_interleave() {
        let capture = Capture::default();
        let sink = Arc::new(ConsoleSink::with_writer(
            ConsoleStream::Stderr,
            Box::new(capture.clone()),
        ));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let line = format!("{{\"thread\":{},\"i\":{},\"pad\":\"{}\"}}", t, i, "x".repeat(64));
                        sink.write(&FormattedRecord::Line(line)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let output = String::from_utf8(capture.0.lock().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 400);
        for line in lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed["thread"].is_number());
        }
    }
}
