//! Command descriptors and reply parsers.
//!
//! A [`Cmd`] bundles the ASCII text of one protocol exchange with the
//! parser that will later claim the matching reply. Parsers return
//! `Option<T>`: `None` means "this line is not for me yet", never an
//! error, so the bus can probe every pending parser against a partially
//! assembled response without side effects.
//!
//! Parameterized commands are plain functions in the instrument modules
//! that validate their arguments and return `ComResult<Cmd<T>>`, failing
//! before anything reaches the wire.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

/// A reply matcher. `None` means the text (so far) is not a match.
pub type Parser<T> = Arc<dyn Fn(&str) -> Option<T> + Send + Sync>;

/// Default reply deadline when a command does not override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// One protocol exchange: wire text plus the parser(s) for its reply.
///
/// `delayed_parser`, when set, declares that the instrument answers
/// twice: an immediate acknowledgement (claimed by `parser`) and a
/// completion event that arrives later, possibly interleaved with other
/// commands' traffic (claimed by `delayed_parser`). The caller's result
/// is the completion value.
#[derive(Clone)]
pub struct Cmd<T> {
    pub text: String,
    pub parser: Parser<T>,
    pub delayed_parser: Option<Parser<T>>,
    /// Number of separator-delimited lines in the expected response.
    pub n_lines: usize,
    /// Reply deadline. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl<T> Cmd<T> {
    pub fn new(text: impl Into<String>, parser: Parser<T>) -> Self {
        Self {
            text: text.into(),
            parser,
            delayed_parser: None,
            n_lines: 1,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    /// Set the expected response line count.
    pub fn lines(mut self, n: usize) -> Self {
        self.n_lines = n;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Attach a parser for a later, asynchronously delivered completion
    /// event. The caller's result comes from this parser.
    pub fn delayed(mut self, parser: Parser<T>) -> Self {
        self.delayed_parser = Some(parser);
        self
    }
}

impl<T> std::fmt::Debug for Cmd<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cmd")
            .field("text", &self.text)
            .field("n_lines", &self.n_lines)
            .field("timeout", &self.timeout)
            .field("delayed", &self.delayed_parser.is_some())
            .finish()
    }
}

/// Matches the reply if it equals `expected` exactly.
pub fn ok_if_match(expected: impl Into<String>) -> Parser<bool> {
    let expected = expected.into();
    Arc::new(move |resp| (resp == expected).then_some(true))
}

/// Matches the reply if it equals any of `expected` exactly.
pub fn ok_if_match_any(expected: &[&str]) -> Parser<bool> {
    let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
    Arc::new(move |resp| expected.iter().any(|e| resp == e).then_some(true))
}

fn compile(pattern: &str) -> Regex {
    #[allow(clippy::expect_used)]
    let re = Regex::new(pattern).expect("command table patterns are valid regexes");
    re
}

/// Matches if the pattern is found anywhere in the reply.
pub fn ok_re(pattern: &str) -> Parser<bool> {
    let re = compile(pattern);
    Arc::new(move |resp| re.is_match(resp).then_some(true))
}

/// Matches on the pattern and maps its captures to a value. Returning
/// `None` from `f` rejects the match.
pub fn re_map<T, F>(pattern: &str, f: F) -> Parser<T>
where
    F: Fn(&regex::Captures<'_>) -> Option<T> + Send + Sync + 'static,
{
    let re = compile(pattern);
    Arc::new(move |resp| re.captures(resp).and_then(|caps| f(&caps)))
}

/// Matches on the pattern and parses its first capture group with
/// [`std::str::FromStr`].
pub fn re_parse<T>(pattern: &str) -> Parser<T>
where
    T: std::str::FromStr,
{
    re_map(pattern, |caps| caps.get(1)?.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_if_match() {
        let p = ok_if_match("1G");
        assert_eq!(p("1G"), Some(true));
        assert_eq!(p("1G "), None);
        assert_eq!(p("Move Done"), None);
    }

    #[test]
    fn test_ok_if_match_any() {
        let p = ok_if_match_any(&["SMD-G-1.1.2", "SMD-G-1.1.1"]);
        assert_eq!(p("SMD-G-1.1.1"), Some(true));
        assert_eq!(p("SMD12"), None);
    }

    #[test]
    fn test_re_parse_int() {
        let p: Parser<i32> = re_parse(r"\??PR P\n(\-?\d+)");
        assert_eq!(p("?PR P\n-1200"), Some(-1200));
        assert_eq!(p("PR P"), None);
    }

    #[test]
    fn test_re_parse_accepts_leading_plus() {
        // The y-stage reports positions as e.g. "*+0".
        let p: Parser<i32> = re_parse(r"1R\(PA\)\n1?\*([\d\+\-]+)");
        assert_eq!(p("1R(PA)\n*+0"), Some(0));
    }

    #[test]
    fn test_re_map_rejection() {
        let p: Parser<bool> = re_map(r"/0([`@])", |caps| match caps.get(1)?.as_str() {
            "`" => Some(true),
            "@" => Some(false),
            _ => None,
        });
        assert_eq!(p("/0`"), Some(true));
        assert_eq!(p("/0@"), Some(false));
        assert_eq!(p("/0x"), None);
    }

    #[test]
    fn test_cmd_builder() {
        let cmd = Cmd::new("GOTO(CHKMV)", ok_if_match("1GOTO(CHKMV)"))
            .delayed(ok_if_match("Move Done"))
            .timeout(Duration::from_secs(60));
        assert_eq!(cmd.text, "GOTO(CHKMV)");
        assert!(cmd.delayed_parser.is_some());
        assert_eq!(cmd.timeout, Some(Duration::from_secs(60)));
        assert_eq!(cmd.n_lines, 1);
    }
}
