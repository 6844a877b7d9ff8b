use std::io::{self, Write};

// Room for the output of a typical verbose test without reallocating.
pub const CAPTURE_CAPACITY: usize = 1 << 20;

// Output of a single test. Everything written to it is kept in memory and also
// forwarded as it arrives to the live stdout/stderr sinks.
pub struct Capture<'a> {
    buf: Vec<u8>,
    stdout: &'a mut dyn Write,
    stderr: &'a mut dyn Write,
}

impl<'a> Capture<'a> {
    pub fn new(stdout: &'a mut dyn Write, stderr: &'a mut dyn Write) -> Self {
        Self {
            buf: Vec::with_capacity(CAPTURE_CAPACITY),
            stdout,
            stderr,
        }
    }

    pub fn stdout(&mut self) -> Tee<'_> {
        Tee {
            buf: &mut self.buf,
            live: &mut *self.stdout,
        }
    }

    pub fn stderr(&mut self) -> Tee<'_> {
        Tee {
            buf: &mut self.buf,
            live: &mut *self.stderr,
        }
    }

    // Both streams, interleaved in the order they were written.
    pub fn output(&self) -> &[u8] {
        &self.buf
    }

    #[cfg(test)]
    pub fn into_output(self) -> Vec<u8> {
        self.buf
    }
}

// Writer that duplicates everything into a capture buffer and a live sink.
pub struct Tee<'a> {
    buf: &'a mut Vec<u8>,
    live: &'a mut dyn Write,
}

impl Write for Tee<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        self.live.write_all(data)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.live.flush()
    }
}

// The last `n` lines of `output`, preceded by a marker line showing that the
// start was cut off.
pub fn tail_lines(output: &str, n: usize) -> String {
    let lines: Vec<&str> = output.split('\n').collect();
    let start = lines.len().saturating_sub(n);
    format!("......\n{}", lines[start..].join("\n"))
}
