use std::io::Write;

/// Abstraction over user-facing output.
///
/// Commands use this instead of `println!` so diagnostics stay on stderr via
/// `tracing` while results go to stdout.
pub trait UserOutput: Send + Sync {
    fn status(&self, message: &str);

    fn warning(&self, message: &str);

    fn error(&self, message: &str);

    /// Inline progress (no trailing newline). Call `finish_progress` after.
    fn progress(&self, message: &str);

    fn finish_progress(&self, result: &str);
}

pub struct CliOutput;

impl UserOutput for CliOutput {
    fn status(&self, message: &str) {
        println!("{}", message);
    }

    fn warning(&self, message: &str) {
        eprintln!("{}", message);
    }

    fn error(&self, message: &str) {
        eprintln!("\x1b[31m{}\x1b[0m", message);
    }

    fn progress(&self, message: &str) {
        print!("{}", message);
        std::io::stdout().flush().ok();
    }

    fn finish_progress(&self, result: &str) {
        println!("{}", result);
    }
}
