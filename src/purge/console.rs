use std::io::{self, BufRead, Write};

/// Line-oriented terminal access for the purge run.
///
/// `write_line` is called from the background task and the listener thread
/// alike, so implementations must serialise writes per line.
pub trait Console: Send + Sync {
    fn write_line(&self, line: &str);

    /// Blocks until a full line is available. `None` means end of input.
    fn read_line(&self) -> Option<String>;
}

/// Stdout for output, stdin for the cancellation keyword.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdConsole;

impl Console for StdConsole {
    fn write_line(&self, line: &str) {
        let mut out = io::stdout().lock();
        // A closed pipe must not take the purge down with it.
        let _ = writeln!(out, "{line}").and_then(|()| out.flush());
    }

    fn read_line(&self) -> Option<String> {
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line),
        }
    }
}
