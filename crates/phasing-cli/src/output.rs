//! Terminal status lines

use std::io::Write;

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

/// Hint shown whenever a session fails
pub const INIT_HINT: &str = "Make sure that phasing has been initialized properly (phasing --init).";

fn status_line(out: &mut impl Write, color: Color, symbol: &str, msg: &str) {
    let _ = crossterm::execute!(
        out,
        SetForegroundColor(color),
        Print(symbol),
        Print(" "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Green check on stdout
pub fn print_success(msg: &str) {
    status_line(&mut std::io::stdout(), Color::Green, "✓", msg);
}

/// Cyan info line on stdout
pub fn print_info(msg: &str) {
    status_line(&mut std::io::stdout(), Color::Cyan, "ℹ", msg);
}

/// Yellow warning on stderr
pub fn print_warning(msg: &str) {
    status_line(&mut std::io::stderr(), Color::Yellow, "⚠", msg);
}

/// Red error on stderr
pub fn print_error(msg: &str) {
    status_line(&mut std::io::stderr(), Color::Red, "✗", msg);
}

/// The two lines announcing where traffic comes from and goes to
pub fn endpoint_lines(remote: &str, local: &str) -> [String; 2] {
    [
        format!("Remote endpoint is {}", remote),
        format!("Local endpoint is {}", local),
    ]
}

/// Announce the redirected Service and the local target
pub fn print_endpoints(remote: &str, local: &str) {
    for line in endpoint_lines(remote, local) {
        print_info(&line);
    }
}

/// Report a failed session: the error chain, then the `--init` hint
pub fn print_failure(error: &anyhow::Error) {
    print_error(&format!("{:#}", error));
    print_warning(INIT_HINT);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_lines() {
        let [remote, local] = endpoint_lines("web.default:8080", "127.0.0.1:7777");
        assert_eq!(remote, "Remote endpoint is web.default:8080");
        assert_eq!(local, "Local endpoint is 127.0.0.1:7777");
    }

    #[test]
    fn test_status_line_has_symbol_and_message() {
        let mut out = Vec::new();
        status_line(&mut out, Color::Cyan, "ℹ", "Local endpoint is 127.0.0.1:7777");

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("ℹ"));
        assert!(text.ends_with("Local endpoint is 127.0.0.1:7777\n"));
    }
}
