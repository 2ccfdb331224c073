//! Incremental parsing of framed replies.

use tracing::warn;

/// Parser state; `Done`, `NoData` and `BadData` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Begin,
    Command,
    Result,
    Data,
    LineCount,
    Lines,
    End,
    Done,
    NoData,
    BadData,
}

/// Terminal classification of a parsed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Completed with SUCCESS.
    Ok,
    /// Completed with ERROR.
    Fail,
    /// Input did not follow the frame grammar.
    CantParse,
    /// The peer stopped producing data before the frame completed.
    Timeout,
    /// More lines are needed.
    Incomplete,
}

/// Mealy-style state machine consuming one reply line per [`feed`] call.
///
/// Feed lines until [`is_completed`] turns true, inspect the accessors, then
/// [`reset`] before the next frame.
///
/// [`feed`]: ReplyParser::feed
/// [`is_completed`]: ReplyParser::is_completed
/// [`reset`]: ReplyParser::reset
#[derive(Debug, Clone)]
pub struct ReplyParser {
    state: State,
    command: String,
    lines: Vec<String>,
    last_line: String,
    remaining: usize,
    success: bool,
}

impl Default for ReplyParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyParser {
    /// Creates a parser in its pristine state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Begin,
            command: String::new(),
            lines: Vec::new(),
            last_line: String::new(),
            remaining: 0,
            success: false,
        }
    }

    /// Returns the parser to its pristine state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Enters one line of input into the state machine.
    pub fn feed(&mut self, line: &str) {
        let input = line.trim_end_matches([' ', '\t', '\n', '\r']);
        self.last_line = input.to_owned();
        self.state = match self.state {
            State::Begin => {
                if input == "BEGIN" {
                    State::Command
                } else {
                    State::BadData
                }
            }
            State::Command => {
                if input.is_empty() {
                    State::BadData
                } else {
                    self.command = input.to_owned();
                    State::Result
                }
            }
            State::Result => match input {
                "SUCCESS" | "ERROR" => {
                    self.success = input == "SUCCESS";
                    State::Data
                }
                _ => State::BadData,
            },
            State::Data => match input {
                "DATA" => State::LineCount,
                "END" => State::Done,
                _ => State::BadData,
            },
            State::LineCount => match input.parse::<usize>() {
                Ok(0) => State::End,
                Ok(count) => {
                    self.remaining = count;
                    State::Lines
                }
                Err(_) => State::BadData,
            },
            State::Lines => {
                if input.is_empty() {
                    State::BadData
                } else {
                    self.lines.push(input.to_owned());
                    self.remaining -= 1;
                    if self.remaining == 0 { State::End } else { State::Lines }
                }
            }
            State::End => {
                if input == "END" {
                    State::Done
                } else {
                    State::BadData
                }
            }
            State::Done | State::NoData | State::BadData => {
                warn!("reply parser: skipping data: {input}");
                self.state
            }
        };
        if self.state == State::BadData {
            warn!("reply parser: bad input: {input}");
        }
    }

    /// Marks the frame as abandoned because the peer went silent.
    pub fn mark_no_data(&mut self) {
        self.state = State::NoData;
    }

    /// Reports whether the parser has reached a terminal state.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self.state, State::Done | State::NoData | State::BadData)
    }

    /// Classifies the frame parsed so far.
    #[must_use]
    pub fn outcome(&self) -> ReplyOutcome {
        match self.state {
            State::Done => {
                if self.success {
                    ReplyOutcome::Ok
                } else {
                    ReplyOutcome::Fail
                }
            }
            State::BadData => ReplyOutcome::CantParse,
            State::NoData => ReplyOutcome::Timeout,
            _ => ReplyOutcome::Incomplete,
        }
    }

    /// The echoed command, defined once completed.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The payload lines, defined once completed.
    #[must_use]
    pub fn data(&self) -> &[String] {
        &self.lines
    }

    /// The SUCCESS/ERROR flag, defined once completed.
    #[must_use]
    pub fn success(&self) -> bool {
        self.success
    }

    /// The most recently fed line, for diagnostics.
    #[must_use]
    pub fn last_line(&self) -> &str {
        &self.last_line
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::Reply;

    fn feed_all(parser: &mut ReplyParser, frame: &str) {
        for line in frame.lines() {
            parser.feed(line);
        }
    }

    #[test]
    fn parses_bare_success() {
        let mut parser = ReplyParser::new();
        feed_all(&mut parser, "BEGIN\nVERSION\nSUCCESS\nEND\n");
        assert!(parser.is_completed());
        assert_eq!(parser.outcome(), ReplyOutcome::Ok);
        assert_eq!(parser.command(), "VERSION");
        assert!(parser.data().is_empty());
    }

    #[test]
    fn parses_data_section() {
        let mut parser = ReplyParser::new();
        feed_all(
            &mut parser,
            "BEGIN\nGET_BACKEND_INFO\nSUCCESS\nDATA\n1\nstd 4711 acme /dev/ir0\nEND\n",
        );
        assert_eq!(parser.outcome(), ReplyOutcome::Ok);
        assert_eq!(parser.data(), ["std 4711 acme /dev/ir0"]);
    }

    #[test]
    fn parses_error_frame() {
        let mut parser = ReplyParser::new();
        feed_all(&mut parser, "BEGIN\nSEND_ONCE X Y\nERROR\nDATA\n1\nTIMEOUT\nEND\n");
        assert_eq!(parser.outcome(), ReplyOutcome::Fail);
        assert!(!parser.success());
        assert_eq!(parser.data(), ["TIMEOUT"]);
    }

    #[test]
    fn incomplete_until_end() {
        let mut parser = ReplyParser::new();
        feed_all(&mut parser, "BEGIN\nLIST\nSUCCESS\n");
        assert!(!parser.is_completed());
        assert_eq!(parser.outcome(), ReplyOutcome::Incomplete);
    }

    #[rstest]
    #[case::wrong_opening("HELLO\n")]
    #[case::empty_command("BEGIN\n\n")]
    #[case::wrong_result("BEGIN\nLIST\nMAYBE\n")]
    #[case::bad_count("BEGIN\nLIST\nSUCCESS\nDATA\nmany\n")]
    #[case::empty_payload_line("BEGIN\nLIST\nSUCCESS\nDATA\n2\n\n")]
    fn malformed_input_is_absorbing(#[case] frame: &str) {
        let mut parser = ReplyParser::new();
        feed_all(&mut parser, frame);
        assert_eq!(parser.outcome(), ReplyOutcome::CantParse);
        // further input must not resurrect the parser
        parser.feed("END");
        assert_eq!(parser.outcome(), ReplyOutcome::CantParse);
    }

    #[test]
    fn no_data_reports_timeout() {
        let mut parser = ReplyParser::new();
        parser.feed("BEGIN");
        parser.mark_no_data();
        assert!(parser.is_completed());
        assert_eq!(parser.outcome(), ReplyOutcome::Timeout);
    }

    #[test]
    fn reset_restores_pristine_state() {
        let mut parser = ReplyParser::new();
        feed_all(&mut parser, "BEGIN\nLIST\nERROR\nDATA\n1\nboom\nEND\n");
        parser.reset();
        assert!(!parser.is_completed());
        feed_all(&mut parser, "BEGIN\nLIST\nSUCCESS\nEND\n");
        assert_eq!(parser.outcome(), ReplyOutcome::Ok);
    }

    #[rstest]
    #[case::bare(Reply::success("VERSION"))]
    #[case::with_data(Reply::success_with(
        "LIST remote",
        vec!["KEY_POWER".into(), "KEY_MUTE".into()],
    ))]
    #[case::error(Reply::error("SEND_ONCE X Y", "TIMEOUT"))]
    fn round_trips_codec_frames(#[case] reply: Reply) {
        let mut parser = ReplyParser::new();
        feed_all(&mut parser, &reply.encode());
        assert!(parser.is_completed());
        match reply {
            Reply::Success { message, data } => {
                assert_eq!(parser.outcome(), ReplyOutcome::Ok);
                assert_eq!(parser.command(), message);
                assert_eq!(parser.data(), data.as_slice());
            }
            Reply::Error { message, data } => {
                assert_eq!(parser.outcome(), ReplyOutcome::Fail);
                assert_eq!(parser.command(), message);
                assert_eq!(parser.data(), data.as_slice());
            }
            Reply::SigHup => unreachable!(),
        }
    }
}
