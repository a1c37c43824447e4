//! Demultiplexer for the combined stdout/stderr stream.
//!
//! When a container runs without a TTY the engine interleaves both output
//! streams into one, each chunk prefixed by an 8-byte header:
//!
//! ```text
//! [type: u8][0][0][0][length: u32 big-endian][payload: length bytes]
//! ```
//!
//! `type` is 0 (stdin), 1 (stdout) or 2 (stderr). Chunks may be split
//! arbitrarily across reads, so the parser keeps its position between calls
//! to [`FrameDemuxer::feed`].

use crate::error::ContainerError;

const HEADER_LEN: usize = 8;

/// Which stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_byte(byte: u8) -> Result<Self, ContainerError> {
        match byte {
            0 => Ok(Self::Stdin),
            1 => Ok(Self::Stdout),
            2 => Ok(Self::Stderr),
            other => Err(ContainerError::InvalidFrame(format!(
                "unknown stream type {other}"
            ))),
        }
    }
}

#[derive(Debug)]
enum State {
    Header { buf: [u8; HEADER_LEN], filled: usize },
    Payload { kind: StreamKind, remaining: usize },
}

impl Default for State {
    fn default() -> Self {
        Self::Header {
            buf: [0; HEADER_LEN],
            filled: 0,
        }
    }
}

/// Output collected from a demultiplexed stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemuxedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl DemuxedOutput {
    /// Lossy UTF-8 view of stdout.
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Lossy UTF-8 view of stderr.
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Incremental parser for the framed stream.
#[derive(Debug, Default)]
pub struct FrameDemuxer {
    state: State,
    output: DemuxedOutput,
}

impl FrameDemuxer {
    /// Create an empty demuxer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next slice of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::InvalidFrame`] on an unknown stream type.
    pub fn feed(&mut self, mut bytes: &[u8]) -> Result<(), ContainerError> {
        while !bytes.is_empty() {
            match &mut self.state {
                State::Header { buf, filled } => {
                    let take = (HEADER_LEN - *filled).min(bytes.len());
                    buf[*filled..*filled + take].copy_from_slice(&bytes[..take]);
                    *filled += take;
                    bytes = &bytes[take..];

                    if *filled == HEADER_LEN {
                        let kind = StreamKind::from_byte(buf[0])?;
                        let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
                        self.state = if len == 0 {
                            State::default()
                        } else {
                            State::Payload {
                                kind,
                                remaining: len,
                            }
                        };
                    }
                }
                State::Payload { kind, remaining } => {
                    let take = (*remaining).min(bytes.len());
                    let sink = match kind {
                        StreamKind::Stderr => &mut self.output.stderr,
                        StreamKind::Stdin | StreamKind::Stdout => &mut self.output.stdout,
                    };
                    sink.extend_from_slice(&bytes[..take]);
                    *remaining -= take;
                    bytes = &bytes[take..];

                    if *remaining == 0 {
                        self.state = State::default();
                    }
                }
            }
        }
        Ok(())
    }

    /// Finish parsing and return the collected output.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::InvalidFrame`] if the stream ended inside a
    /// header or a payload.
    pub fn finish(self) -> Result<DemuxedOutput, ContainerError> {
        match self.state {
            State::Header { filled: 0, .. } => Ok(self.output),
            State::Header { filled, .. } => Err(ContainerError::InvalidFrame(format!(
                "stream ended after {filled} header bytes"
            ))),
            State::Payload { remaining, .. } => Err(ContainerError::InvalidFrame(format!(
                "stream ended with {remaining} payload bytes missing"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_frame(kind: StreamKind, payload: &[u8]) -> Vec<u8> {
        let type_byte = match kind {
            StreamKind::Stdin => 0,
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        };
        let len = u32::try_from(payload.len()).unwrap();
        let mut frame = vec![type_byte, 0, 0, 0];
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn sample_stream() -> Vec<u8> {
        let mut stream = encode_frame(StreamKind::Stdout, b"{\"output\":");
        stream.extend(encode_frame(StreamKind::Stderr, b"warning"));
        stream.extend(encode_frame(StreamKind::Stdout, b"1}"));
        stream
    }

    #[test]
    fn test_length_spans_header_bytes() {
        let payload = vec![b'x'; 300];
        let stream = encode_frame(StreamKind::Stderr, &payload);
        assert_eq!(stream[..HEADER_LEN], [2, 0, 0, 0, 0, 0, 1, 44]);

        let mut demux = FrameDemuxer::new();
        demux.feed(&stream).unwrap();
        assert_eq!(demux.finish().unwrap().stderr, payload);
    }

    #[test]
    fn test_whole_stream() {
        let mut demux = FrameDemuxer::new();
        demux.feed(&sample_stream()).unwrap();
        let out = demux.finish().unwrap();

        assert_eq!(out.stdout_lossy(), "{\"output\":1}");
        assert_eq!(out.stderr_lossy(), "warning");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut demux = FrameDemuxer::new();
        for byte in sample_stream() {
            demux.feed(&[byte]).unwrap();
        }
        let out = demux.finish().unwrap();

        assert_eq!(out.stdout, b"{\"output\":1}");
        assert_eq!(out.stderr, b"warning");
    }

    #[test]
    fn test_split_inside_header() {
        let stream = sample_stream();
        let mut demux = FrameDemuxer::new();
        demux.feed(&stream[..3]).unwrap();
        demux.feed(&stream[3..21]).unwrap();
        demux.feed(&stream[21..]).unwrap();

        assert_eq!(demux.finish().unwrap().stdout, b"{\"output\":1}");
    }

    #[test]
    fn test_empty_frame() {
        let mut stream = encode_frame(StreamKind::Stdout, b"");
        stream.extend(encode_frame(StreamKind::Stdout, b"ok"));
        let mut demux = FrameDemuxer::new();
        demux.feed(&stream).unwrap();

        assert_eq!(demux.finish().unwrap().stdout, b"ok");
    }

    #[test]
    fn test_truncated_payload() {
        let stream = encode_frame(StreamKind::Stdout, b"hello");
        let mut demux = FrameDemuxer::new();
        demux.feed(&stream[..stream.len() - 2]).unwrap();

        assert!(matches!(demux.finish(), Err(ContainerError::InvalidFrame(_))));
    }

    #[test]
    fn test_truncated_header() {
        let mut demux = FrameDemuxer::new();
        demux.feed(&[1, 0, 0]).unwrap();

        assert!(matches!(demux.finish(), Err(ContainerError::InvalidFrame(_))));
    }

    #[test]
    fn test_unknown_stream_type() {
        let mut demux = FrameDemuxer::new();
        let result = demux.feed(&[7, 0, 0, 0, 0, 0, 0, 1, b'x']);

        assert!(matches!(result, Err(ContainerError::InvalidFrame(_))));
    }
}
