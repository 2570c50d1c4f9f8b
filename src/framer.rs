//! Demultiplexing of captured command output.
//!
//! A command's stdout and stderr share one spool. Besides ordinary log lines a
//! script may emit two bracketed sections:
//!
//! ```text
//! BEGIN_EXTRA_PAYLOAD
//! <MIME multipart body with one JSON part>
//! END_EXTRA_PAYLOAD
//! BEGIN_EXTRA_RET_ERR_MSG
//! <raw text>
//! END_EXTRA_RET_ERR_MSG
//! ```
//!
//! Payload sections are merged into one JSON object, error sections are kept
//! as raw text, and everything else becomes the results log.

use serde_json::{Map, Value};
use std::io::SeekFrom;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncSeek, AsyncSeekExt};
use tracing::{info, warn};

use crate::error::FrameError;
use crate::multipart;

pub const BEGIN_EXTRA_PAYLOAD: &str = "BEGIN_EXTRA_PAYLOAD";
pub const END_EXTRA_PAYLOAD: &str = "END_EXTRA_PAYLOAD";
pub const BEGIN_EXTRA_RET_ERR_MSG: &str = "BEGIN_EXTRA_RET_ERR_MSG";
pub const END_EXTRA_RET_ERR_MSG: &str = "END_EXTRA_RET_ERR_MSG";

/// The three channels recovered from one output stream.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FramedOutput {
    pub results_log: Vec<String>,
    pub payload: Map<String, Value>,
    pub error_messages: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Plain,
    Payload,
    ErrMsg,
}

impl Mode {
    fn section_name(self) -> &'static str {
        match self {
            Mode::Plain => "plain",
            Mode::Payload => BEGIN_EXTRA_PAYLOAD,
            Mode::ErrMsg => BEGIN_EXTRA_RET_ERR_MSG,
        }
    }
}

/// Line-at-a-time state machine over the three output modes.
#[derive(Debug)]
pub struct OutputFramer {
    mode: Mode,
    section: Vec<String>,
    output: FramedOutput,
}

impl Default for OutputFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputFramer {
    pub fn new() -> Self {
        Self {
            mode: Mode::Plain,
            section: Vec::new(),
            output: FramedOutput::default(),
        }
    }

    /// Feed one line (with or without its trailing newline).
    pub fn push_line(&mut self, raw: &str) {
        let line = raw.trim();

        match (self.mode, line) {
            (Mode::Plain, BEGIN_EXTRA_PAYLOAD) => self.enter(Mode::Payload),
            (Mode::Plain, BEGIN_EXTRA_RET_ERR_MSG) => self.enter(Mode::ErrMsg),
            (Mode::Payload, END_EXTRA_PAYLOAD) => {
                let body = self.leave();
                match multipart::decode_payload(&body) {
                    Ok(objects) => {
                        for object in objects {
                            self.output.payload.extend(object);
                        }
                    }
                    Err(e) => warn!(error = %e, "Skipping undecodable extra payload"),
                }
            }
            (Mode::ErrMsg, END_EXTRA_RET_ERR_MSG) => {
                let message = self.leave();
                self.output.error_messages.push(message);
            }
            (Mode::Plain, _) => {
                info!("{}", line);
                self.output.results_log.push(line.to_string());
            }
            (Mode::Payload | Mode::ErrMsg, _) => self.section.push(line.to_string()),
        }
    }

    /// Close the stream and return what was collected.
    ///
    /// A section still open at this point (typically a script killed by the
    /// timeout) is dropped with a diagnostic.
    pub fn finish(mut self) -> FramedOutput {
        if self.mode != Mode::Plain {
            let err = FrameError::MalformedOutputSection {
                section: self.mode.section_name(),
                lines: self.section.len(),
            };
            warn!(error = %err, "Dropping unterminated output section");
            self.section.clear();
        }
        self.output
    }

    fn enter(&mut self, mode: Mode) {
        self.mode = mode;
        self.section.clear();
    }

    fn leave(&mut self) -> String {
        self.mode = Mode::Plain;
        std::mem::take(&mut self.section).join("\n")
    }
}

/// Rewind `source` and demultiplex it from the start.
///
/// Invalid UTF-8 is replaced rather than aborting the parse.
pub async fn parse_output<R>(source: &mut R) -> std::io::Result<FramedOutput>
where
    R: AsyncBufRead + AsyncSeek + Unpin,
{
    source.seek(SeekFrom::Start(0)).await?;

    let mut framer = OutputFramer::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if source.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        framer.push_line(&String::from_utf8_lossy(&buf));
    }
    Ok(framer.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const PAYLOAD_BODY: &str = "Content-Type: multipart/form-data; boundary=\"===============42==\"
MIME-Version: 1.0

--===============42==
Content-Type: application/json; charset=\"utf-8\"
MIME-Version: 1.0
Content-Transfer-Encoding: base64

{\"k\": \"v\"}
--===============42==--";

    async fn parse(text: String) -> FramedOutput {
        let mut cursor = Cursor::new(text.into_bytes());
        parse_output(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn test_payload_is_separated_from_log() {
        let output = parse(format!("a\nBEGIN_EXTRA_PAYLOAD\n{PAYLOAD_BODY}\nEND_EXTRA_PAYLOAD\nb\n")).await;

        assert_eq!(output.results_log, vec!["a", "b"]);
        assert_eq!(output.payload.get("k"), Some(&Value::from("v")));
        assert!(output.error_messages.is_empty());
    }

    #[tokio::test]
    async fn test_error_message_section() {
        let output = parse(
            "start\nBEGIN_EXTRA_RET_ERR_MSG\noops\nmore detail\nEND_EXTRA_RET_ERR_MSG\nend\n".to_string(),
        )
        .await;

        assert_eq!(output.error_messages, vec!["oops\nmore detail"]);
        assert_eq!(output.results_log, vec!["start", "end"]);
    }

    #[tokio::test]
    async fn test_unterminated_section_is_dropped() {
        let output = parse("one\nBEGIN_EXTRA_PAYLOAD\nContent-Type: multipart/form-data\n".to_string()).await;

        assert_eq!(output.results_log, vec!["one"]);
        assert!(output.payload.is_empty());
    }

    #[tokio::test]
    async fn test_bad_payload_does_not_break_framing() {
        let output = parse(format!(
            "BEGIN_EXTRA_PAYLOAD\nnot a mime body\nEND_EXTRA_PAYLOAD\nBEGIN_EXTRA_PAYLOAD\n{PAYLOAD_BODY}\nEND_EXTRA_PAYLOAD\ntail\n"
        ))
        .await;

        assert_eq!(output.results_log, vec!["tail"]);
        assert_eq!(output.payload.len(), 1);
    }

    #[tokio::test]
    async fn test_parse_rewinds_before_reading() {
        let mut cursor = Cursor::new(b"first\nsecond".to_vec());
        cursor.set_position(6);

        let output = parse_output(&mut cursor).await.unwrap();
        assert_eq!(output.results_log, vec!["first", "second"]);

        let again = parse_output(&mut cursor).await.unwrap();
        assert_eq!(again, output);
    }

    #[test]
    fn test_lines_are_trimmed_and_crlf_tolerated() {
        let mut framer = OutputFramer::new();
        framer.push_line("  indented  \r\n");
        framer.push_line("BEGIN_EXTRA_RET_ERR_MSG\r\n");
        framer.push_line("failed\r\n");
        framer.push_line("END_EXTRA_RET_ERR_MSG\r\n");

        let output = framer.finish();
        assert_eq!(output.results_log, vec!["indented"]);
        assert_eq!(output.error_messages, vec!["failed"]);
    }
}
