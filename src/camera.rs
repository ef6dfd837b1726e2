// Webcam frames for the MJPEG stream
//
// The capture device is an external command writing concatenated JPEG images
// to stdout (e.g. ffmpeg with the mjpeg muxer). Frames are cut out of the byte
// stream at SOI/EOI markers and fanned out to every viewer through a broadcast
// channel; slow viewers skip frames instead of stalling capture.

use std::convert::Infallible;
use std::io;
use std::process::Stdio;

use axum::body::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

/// Multipart boundary used by the video endpoint
pub const BOUNDARY: &str = "frame";

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Drop the partial frame if no EOI shows up within this many bytes
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

fn find(haystack: &[u8], marker: [u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

/// Cuts complete JPEG images out of an arbitrary byte stream
#[derive(Debug, Default)]
pub struct JpegSplitter {
    buf: Vec<u8>,
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every frame completed by them
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find(&self.buf, SOI) else {
                // Keep a trailing 0xFF, it may begin the next SOI
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                self.buf.drain(..self.buf.len() - keep);
                break;
            };
            if start > 0 {
                self.buf.drain(..start);
            }

            match find(&self.buf[SOI.len()..], EOI) {
                Some(offset) => {
                    let end = SOI.len() + offset + EOI.len();
                    frames.push(Bytes::copy_from_slice(&self.buf[..end]));
                    self.buf.drain(..end);
                }
                None => {
                    if self.buf.len() > MAX_FRAME_BYTES {
                        warn!("Discarding {} bytes without an end-of-image marker", self.buf.len());
                        self.buf.clear();
                    }
                    break;
                }
            }
        }

        frames
    }
}

/// Read side of the frame broadcast
///
/// Viewer streams end when the capture task ends or when `shutdown` flips,
/// whichever comes first.
pub struct FrameFeed {
    rx: broadcast::Receiver<Bytes>,
    shutdown: watch::Receiver<bool>,
}

impl FrameFeed {
    /// Create a feed and the sender a capture task publishes into
    pub fn channel(
        backlog: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (broadcast::Sender<Bytes>, Self) {
        let (tx, rx) = broadcast::channel(backlog);
        (tx, Self { rx, shutdown })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.rx.resubscribe()
    }

    /// Multipart body stream for one viewer
    pub fn viewer(&self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        mjpeg_stream(self.subscribe(), self.shutdown.clone())
    }
}

/// Wrap one JPEG image as a multipart part
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", BOUNDARY);
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

/// Turn a frame subscription into a multipart body stream that ends once
/// `shutdown` is true
pub fn mjpeg_stream(
    frames: broadcast::Receiver<Bytes>,
    shutdown: watch::Receiver<bool>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    // `None` marks the end: capture gone or shutdown requested
    let parts = BroadcastStream::new(frames)
        .filter_map(|frame| match frame {
            Ok(jpeg) => Some(Some(multipart_part(&jpeg))),
            Err(e) => {
                debug!("Viewer fell behind: {}", e);
                None
            }
        })
        .chain(tokio_stream::once(None));
    let stop = WatchStream::new(shutdown)
        .filter(|stopping| *stopping)
        .map(|_| None::<Bytes>);

    parts
        .merge(stop)
        .take_while(Option::is_some)
        .filter_map(|part| part.map(Ok::<Bytes, Infallible>))
}

/// Start the capture command and publish its frames until it exits or
/// `shutdown` flips
pub fn spawn_capture(
    command_line: &str,
    frames: broadcast::Sender<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<JoinHandle<()>> {
    let mut words = command_line.split_whitespace();
    let program = words
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty camera command"))?;

    let mut child = Command::new(program)
        .args(words)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("camera command has no stdout"))?;

    info!("Camera capture started: {}", command_line);

    Ok(tokio::spawn(async move {
        let mut splitter = JpegSplitter::new();
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let read = tokio::select! {
                read = stdout.read(&mut chunk) => read,
                _ = shutdown.changed() => break,
            };

            match read {
                Ok(0) => {
                    warn!("Camera stream ended");
                    break;
                }
                Ok(n) => {
                    for frame in splitter.push(&chunk[..n]) {
                        // No viewers is fine, the frame is just dropped
                        let _ = frames.send(frame);
                    }
                }
                Err(e) => {
                    warn!("Camera read failed: {}", e);
                    break;
                }
            }
        }

        if let Err(e) = child.kill().await {
            debug!("Camera command already exited: {}", e);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut img = SOI.to_vec();
        img.extend_from_slice(body);
        img.extend_from_slice(&EOI);
        img
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let mut input = jpeg(b"first");
        input.extend(jpeg(b"second"));

        let frames = JpegSplitter::new().push(&input);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &jpeg(b"first")[..]);
        assert_eq!(&frames[1][..], &jpeg(b"second")[..]);
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let img = jpeg(b"0123456789");
        let mut splitter = JpegSplitter::new();

        // Split right between the two EOI bytes
        let cut = img.len() - 1;
        assert!(splitter.push(&img[..cut]).is_empty());
        let frames = splitter.push(&img[cut..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &img[..]);
    }

    #[test]
    fn test_leading_garbage_skipped() {
        let mut input = b"noise\xFF".to_vec();
        input.extend(jpeg(b"x"));
        let frames = JpegSplitter::new().push(&input);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &jpeg(b"x")[..]);
    }

    #[test]
    fn test_soi_split_across_chunks() {
        let img = jpeg(b"abc");
        let mut splitter = JpegSplitter::new();
        assert!(splitter.push(&img[..1]).is_empty());
        assert_eq!(splitter.push(&img[1..]).len(), 1);
    }

    #[test]
    fn test_multipart_part_layout() {
        let part = multipart_part(b"JPG");
        assert_eq!(
            &part[..],
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPG\r\n"
        );
    }

    #[tokio::test]
    async fn test_stream_ends_with_capture() {
        let (_stop, shutdown) = watch::channel(false);
        let (tx, feed) = FrameFeed::channel(4, shutdown);
        let mut stream = Box::pin(feed.viewer());

        tx.send(Bytes::from_static(b"img")).unwrap();
        drop(tx);
        drop(feed);

        let part = stream.next().await.unwrap().unwrap();
        assert!(part.ends_with(b"img\r\n"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_ends_on_shutdown_while_capturing() {
        let (stop, shutdown) = watch::channel(false);
        let (tx, feed) = FrameFeed::channel(4, shutdown);
        let mut stream = Box::pin(feed.viewer());

        tx.send(Bytes::from_static(b"img")).unwrap();
        let part = stream.next().await.unwrap().unwrap();
        assert!(part.ends_with(b"img\r\n"));

        // Capture is still alive, only the shutdown flag flips
        stop.send(true).unwrap();
        let end = tokio::time::timeout(Duration::from_secs(1), stream.next()).await;
        assert!(matches!(end, Ok(None)));
        drop(tx);
    }
}
