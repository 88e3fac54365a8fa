//! Line framing for the poliqarpd text protocol.
//!
//! Every server line is newline-terminated and starts with a one-character
//! class marker followed by a space:
//!
//! ```text
//! R OK 6\n          synchronous reply
//! R ERR 16\n        synchronous error reply
//! R kot\n           synchronous data line (segment literal, tag, ...)
//! M QUERY-DONE 6\n  asynchronous milestone
//! ```
//!
//! Commands are plain text lines terminated with `\n`.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PoliqarpError, Result};

/// Maximum line length (1MB) to prevent OOM from a misbehaving server.
pub const MAX_LINE_SIZE: usize = 1024 * 1024;

/// Marker of synchronous replies.
const REPLY_MARKER: char = 'R';
/// Marker of asynchronous milestones.
const MILESTONE_MARKER: char = 'M';

/// Class of a server line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    /// Reply to the command currently in flight.
    Reply,
    /// Asynchronous job notification.
    Milestone,
}

/// Status carried by a line payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// `OK` or `OK ...`
    Ok,
    /// `ERR <code>`
    Error(u16),
    /// Anything else: literals, tags, metadata values.
    Data,
}

/// One decoded server line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLine {
    pub class: LineClass,
    pub status: Status,
    /// Text after the class marker, without the line terminator.
    pub payload: String,
}

impl ServerLine {
    /// Whitespace-separated field of the payload.
    pub fn field(&self, index: usize) -> Option<&str> {
        self.payload.split_whitespace().nth(index)
    }

    /// Convert an error status into the matching typed error.
    pub fn into_result(self) -> Result<ServerLine> {
        match self.status {
            Status::Error(code) => Err(PoliqarpError::from_code(code)),
            _ => Ok(self),
        }
    }
}

/// Known poliqarpd error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorCode {
    BadArgumentCount,
    NoSession,
    SessionExists,
    OutOfMemory,
    InvalidSession,
    SessionAlreadyBound,
    SessionUserMismatch,
    CorpusAlreadyOpen,
    CorpusOpenFailed,
    NoCorpus,
    InvalidJobId,
    JobInProgress,
    IncorrectQuery,
    InvalidResultRange,
    IncorrectSessionOption,
    InvalidSessionOptionValue,
    InvalidSortCriteria,
}

impl ServerErrorCode {
    pub fn from_code(code: u16) -> Option<Self> {
        use ServerErrorCode::*;
        let known = match code {
            1 => BadArgumentCount,
            3 => NoSession,
            4 => SessionExists,
            5 => OutOfMemory,
            6 => InvalidSession,
            7 => SessionAlreadyBound,
            8 => SessionUserMismatch,
            10 => CorpusAlreadyOpen,
            12 => CorpusOpenFailed,
            13 => NoCorpus,
            14 => InvalidJobId,
            15 => JobInProgress,
            16 => IncorrectQuery,
            17 => InvalidResultRange,
            18 => IncorrectSessionOption,
            19 => InvalidSessionOptionValue,
            20 => InvalidSortCriteria,
            _ => return None,
        };
        Some(known)
    }

    pub fn description(&self) -> &'static str {
        use ServerErrorCode::*;
        match self {
            BadArgumentCount => "Incorrect number of arguments",
            NoSession => "No session opened",
            SessionExists => "Cannot create a session for a connection that already has one",
            OutOfMemory => "Not enough memory",
            InvalidSession => "Invalid session ID",
            SessionAlreadyBound => "Session with this ID is already bound",
            SessionUserMismatch => "Session user ID does not match the argument",
            CorpusAlreadyOpen => "Session already has an open corpus",
            CorpusOpenFailed => "System error while opening the corpus",
            NoCorpus => "No corpus opened",
            InvalidJobId => "Invalid job ID",
            JobInProgress => "A job is already in progress",
            IncorrectQuery => "Incorrect query",
            InvalidResultRange => "Invalid result range",
            IncorrectSessionOption => "Incorrect session option",
            InvalidSessionOptionValue => "Invalid session option value",
            InvalidSortCriteria => "Invalid sorting criteria",
        }
    }
}

/// Parse one raw server line (terminator optional).
pub fn parse_line(raw: &str) -> Result<ServerLine> {
    let line = raw
        .strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(raw);

    let mut chars = line.chars();
    let class = match chars.next() {
        Some(REPLY_MARKER) => LineClass::Reply,
        Some(MILESTONE_MARKER) => LineClass::Milestone,
        Some(other) => {
            return Err(PoliqarpError::Protocol(format!(
                "Unknown line marker '{}' in {:?}",
                other, line
            )))
        }
        None => return Err(PoliqarpError::Protocol("Empty line".to_string())),
    };

    // Marker is ASCII, so byte offsets 1 and 2 are char boundaries.
    let payload = match &line[1..] {
        "" => "",
        rest => rest.strip_prefix(' ').ok_or_else(|| {
            PoliqarpError::Protocol(format!("Missing separator after marker in {:?}", line))
        })?,
    };

    Ok(ServerLine {
        class,
        status: classify(payload),
        payload: payload.to_string(),
    })
}

fn classify(payload: &str) -> Status {
    if payload == "OK" || payload.starts_with("OK ") {
        return Status::Ok;
    }
    if let Some(code) = payload.strip_prefix("ERR ") {
        if let Ok(code) = code.trim().parse::<u16>() {
            return Status::Error(code);
        }
    }
    Status::Data
}

/// Frame a command for the wire.
pub fn encode_command(command: &str) -> Result<String> {
    if command.contains(['\n', '\r']) {
        return Err(PoliqarpError::Protocol(format!(
            "Command contains a line break: {:?}",
            command
        )));
    }
    Ok(format!("{}\n", command))
}

/// Read one raw line from the stream, terminator included.
///
/// Invalid UTF-8 is replaced rather than rejected so a single bad corpus
/// token does not kill the connection.
///
/// # Errors
///
/// - `ConnectionClosed` on EOF, including EOF in the middle of a line
/// - `Protocol` if the line exceeds `MAX_LINE_SIZE`
/// - `Io` on socket failure
pub async fn read_line<R>(reader: &mut R) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = reader
        .take(MAX_LINE_SIZE as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;

    if read == 0 {
        return Err(PoliqarpError::ConnectionClosed);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > MAX_LINE_SIZE {
            return Err(PoliqarpError::Protocol(format!(
                "Line exceeds maximum {} bytes",
                MAX_LINE_SIZE
            )));
        }
        return Err(PoliqarpError::ConnectionClosed);
    }

    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Write one command line and flush.
pub async fn write_command<W>(writer: &mut W, command: &str) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let framed = encode_command(command)?;
    writer.write_all(framed.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::BufReader;
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_parse_reply_ok() {
        let line = parse_line("R OK 6\n").unwrap();
        assert_eq!(line.class, LineClass::Reply);
        assert_eq!(line.status, Status::Ok);
        assert_eq!(line.payload, "OK 6");
        assert_eq!(line.field(1), Some("6"));
    }

    #[test]
    fn test_parse_error_line() {
        let line = parse_line("R ERR 15\r\n").unwrap();
        assert_eq!(line.status, Status::Error(15));
        assert!(matches!(
            line.into_result(),
            Err(PoliqarpError::JobInProgress)
        ));
    }

    #[test]
    fn test_parse_milestone() {
        let line = parse_line("M QUERY-DONE 188\n").unwrap();
        assert_eq!(line.class, LineClass::Milestone);
        assert_eq!(line.status, Status::Data);
        assert_eq!(line.field(1), Some("188"));
    }

    #[test]
    fn test_parse_data_keeps_payload_verbatim() {
        let line = parse_line("R  kot \n").unwrap();
        assert_eq!(line.status, Status::Data);
        assert_eq!(line.payload, " kot ");

        // Tokens that merely look like a status stay data.
        assert_eq!(parse_line("R OKNO\n").unwrap().status, Status::Data);
        assert_eq!(parse_line("R ERRATA\n").unwrap().status, Status::Data);
    }

    #[test]
    fn test_parse_bare_marker() {
        let line = parse_line("R\n").unwrap();
        assert_eq!(line.payload, "");
        assert_eq!(line.status, Status::Data);
    }

    #[test]
    fn test_parse_rejects_unknown_marker() {
        assert!(matches!(
            parse_line("X OK\n"),
            Err(PoliqarpError::Protocol(_))
        ));
        assert!(matches!(parse_line("\n"), Err(PoliqarpError::Protocol(_))));
        assert!(matches!(
            parse_line("ROK\n"),
            Err(PoliqarpError::Protocol(_))
        ));
    }

    #[test]
    fn test_encode_command() {
        assert_eq!(encode_command("PING").unwrap(), "PING\n");
        assert!(encode_command("MAKE-QUERY a\nCLOSE").is_err());
    }

    #[test]
    fn test_error_code_table() {
        assert_eq!(
            ServerErrorCode::from_code(13).map(|c| c.description()),
            Some("No corpus opened")
        );
        assert_eq!(ServerErrorCode::from_code(2), None);
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (client, server) = tokio::io::duplex(256);
        let (_client_read, mut client_write) = tokio::io::split(client);
        let (server_read, _server_write) = tokio::io::split(server);

        write_command(&mut client_write, "MAKE-SESSION TEST")
            .await
            .expect("Write failed");

        let mut reader = BufReader::new(server_read);
        let received = timeout(TEST_TIMEOUT, read_line(&mut reader))
            .await
            .expect("Test timed out")
            .expect("Read failed");

        assert_eq!(received, "MAKE-SESSION TEST\n");
    }

    #[tokio::test]
    async fn test_read_reports_eof_as_closed() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = BufReader::new(server);
        drop(client);

        let result = timeout(TEST_TIMEOUT, read_line(&mut reader))
            .await
            .expect("Test timed out");
        assert!(matches!(result, Err(PoliqarpError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_partial_line_then_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"R OK").await.unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        let result = timeout(TEST_TIMEOUT, read_line(&mut reader))
            .await
            .expect("Test timed out");
        assert!(matches!(result, Err(PoliqarpError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_replaces_invalid_utf8() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"R k\xffot\n").await.unwrap();

        let mut reader = BufReader::new(server);
        let line = read_line(&mut reader).await.unwrap();
        assert_eq!(line, "R k\u{fffd}ot\n");
    }
}
