//! Outgoing audio stream.
//!
//! A production thread decodes the source at its own pace and slices the
//! resampled byte stream into exactly the buffer length the engine last
//! requested. The engine-facing [`read`] is strictly non-blocking: an empty
//! queue yields nothing and the engine pads with silence.
//!
//! [`read`]: AudioStream::read

use crate::queue::FrameQueue;
use crate::source::AudioSource;
use crate::video::VideoStream;
use crate::{EndOfStream, DEFAULT_AUDIO_CHUNK_LEN, DEFAULT_QUEUE_DEPTH};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Best-effort lip-sync window. When the companion video runs more than
/// this far ahead, one audio chunk is dropped; more than this far behind,
/// the video is told to skip its next decoded frame.
pub const LIP_SYNC_THRESHOLD: Duration = Duration::from_millis(100);

struct AudioShared {
    queue: RwLock<Arc<FrameQueue<Bytes>>>,
    running: AtomicBool,
    paused: AtomicBool,
    requested_len: AtomicUsize,
    pts: Mutex<Option<Duration>>,
    source_id: String,
    queue_depth: usize,
}

/// Pull-driven outgoing audio stream backed by a production thread
#[derive(Clone)]
pub struct AudioStream {
    shared: Arc<AudioShared>,
}

impl AudioStream {
    /// Create a stream and start its production thread. With no source the
    /// stream stays idle: every `read` returns nothing and the caller pads
    /// with silence.
    pub fn start(
        source: Option<Box<dyn AudioSource>>,
        repeat: bool,
        on_ended: EndOfStream,
        companion: Option<VideoStream>,
    ) -> Self {
        let source_id = source
            .as_ref()
            .map(|s| s.id().to_string())
            .unwrap_or_default();
        let shared = Arc::new(AudioShared {
            queue: RwLock::new(Arc::new(FrameQueue::new(DEFAULT_QUEUE_DEPTH))),
            running: AtomicBool::new(source.is_some()),
            paused: AtomicBool::new(false),
            requested_len: AtomicUsize::new(DEFAULT_AUDIO_CHUNK_LEN),
            pts: Mutex::new(None),
            source_id,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        });

        if let Some(source) = source {
            let thread_shared = Arc::clone(&shared);
            let queue = Arc::clone(&shared.queue.read());
            std::thread::Builder::new()
                .name("audio-stream".to_string())
                .spawn(move || {
                    production_loop(source, repeat, on_ended, companion, thread_shared, queue)
                })
                .ok();
        }

        Self { shared }
    }

    /// Pull the next buffer of exactly `len` bytes. Never blocks; returns
    /// `None` when nothing is buffered or the stream is paused, and the
    /// caller substitutes silence. The requested length is remembered and
    /// steers how the production side slices its output.
    pub fn read(&self, len: usize) -> Option<Bytes> {
        if len > 0 {
            self.shared.requested_len.store(len, Ordering::Relaxed);
        }
        if self.shared.paused.load(Ordering::Relaxed) {
            return None;
        }
        self.shared.queue.read().try_pop()
    }

    /// Pause or resume consumption. Production keeps running so that
    /// un-pausing resumes immediately instead of starting cold.
    pub fn set_pause(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::Relaxed);
    }

    /// Whether reads are currently paused.
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Relaxed)
    }

    /// Whether the production thread is still producing.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    /// Presentation position of the most recently decoded chunk.
    pub fn pts(&self) -> Option<Duration> {
        *self.shared.pts.lock()
    }

    /// Source identifier this stream was started with.
    pub fn source_id(&self) -> &str {
        &self.shared.source_id
    }

    /// Stop production and drop every buffered frame. The queue is replaced
    /// with a fresh one so a later consumer can never observe a stale
    /// buffer.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let mut queue = self.shared.queue.write();
        queue.close();
        *queue = Arc::new(FrameQueue::new(self.shared.queue_depth));
    }
}

fn production_loop(
    mut source: Box<dyn AudioSource>,
    repeat: bool,
    on_ended: EndOfStream,
    companion: Option<VideoStream>,
    shared: Arc<AudioShared>,
    queue: Arc<FrameQueue<Bytes>>,
) {
    let mut tail: Vec<u8> = Vec::new();

    loop {
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }

        let chunk = match source.next_chunk() {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                if repeat {
                    if let Err(e) = source.rewind() {
                        warn!(source = %shared.source_id, error = %e, "Rewind failed");
                        shared.running.store(false, Ordering::SeqCst);
                        on_ended(source.id());
                        return;
                    }
                    continue;
                }
                debug!(source = %shared.source_id, "Audio source exhausted");
                shared.running.store(false, Ordering::SeqCst);
                on_ended(source.id());
                return;
            }
            Err(e) => {
                warn!(source = %shared.source_id, error = %e, "Audio decode failed");
                shared.running.store(false, Ordering::SeqCst);
                on_ended(source.id());
                return;
            }
        };

        let audio_pts = source.pts();
        *shared.pts.lock() = audio_pts;

        if let (Some(video), Some(apts)) = (&companion, audio_pts) {
            if let Some(vpts) = video.pts() {
                if vpts > apts && vpts - apts > LIP_SYNC_THRESHOLD {
                    // Video ran ahead: drop this chunk so audio catches up.
                    continue;
                }
                if apts > vpts && apts - vpts > LIP_SYNC_THRESHOLD {
                    video.skip_next_frame();
                }
            }
        }

        tail.extend_from_slice(&chunk);
        loop {
            let len = shared.requested_len.load(Ordering::Relaxed).max(1);
            if tail.len() < len {
                break;
            }
            let frame = Bytes::copy_from_slice(&tail[..len]);
            tail.drain(..len);
            if !queue.push(frame) {
                // Queue closed by stop.
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use std::sync::atomic::AtomicUsize;

    /// Serves `chunks` once, then EOF (looping again after rewind).
    struct ScriptedSource {
        chunks: Vec<Vec<u8>>,
        cursor: usize,
        rewinds: Arc<AtomicUsize>,
    }

    impl AudioSource for ScriptedSource {
        fn next_chunk(&mut self) -> Result<Option<Bytes>, MediaError> {
            match self.chunks.get(self.cursor) {
                Some(chunk) => {
                    self.cursor += 1;
                    Ok(Some(Bytes::copy_from_slice(chunk)))
                }
                None => Ok(None),
            }
        }

        fn rewind(&mut self) -> Result<(), MediaError> {
            self.cursor = 0;
            self.rewinds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn pts(&self) -> Option<Duration> {
            None
        }

        fn id(&self) -> &str {
            "scripted"
        }
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn sourceless_stream_reads_empty_without_blocking() {
        let stream = AudioStream::start(None, false, Arc::new(|_| {}), None);
        for _ in 0..16 {
            assert!(stream.read(960).is_none());
        }
        assert!(!stream.is_running());
    }

    #[test]
    fn slices_follow_the_requested_length() {
        // 100-byte chunks sliced at 160 bytes: every frame spans a chunk
        // boundary, so correct slicing proves the tail carries over.
        let source = ScriptedSource {
            chunks: vec![vec![1u8; 100], vec![2u8; 100]],
            cursor: 0,
            rewinds: Arc::new(AtomicUsize::new(0)),
        };
        let stream = AudioStream::start(Some(Box::new(source)), true, Arc::new(|_| {}), None);

        // The first read teaches the requested length; frames produced
        // before that may still use the default and are skipped over.
        assert!(wait_until(Duration::from_secs(2), || {
            matches!(stream.read(160), Some(frame) if frame.len() == 160)
        }));
        stream.stop();
    }

    #[test]
    fn end_of_stream_fires_once_with_source_id() {
        let source = ScriptedSource {
            chunks: vec![vec![0u8; 64]],
            cursor: 0,
            rewinds: Arc::new(AtomicUsize::new(0)),
        };
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        let stream = AudioStream::start(
            Some(Box::new(source)),
            false,
            Arc::new(move |id| {
                assert_eq!(id, "scripted");
                fired_cb.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );

        assert!(wait_until(Duration::from_secs(2), || !stream.is_running()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeat_rewinds_without_end_callback() {
        let rewinds = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource {
            chunks: vec![vec![7u8; 32]],
            cursor: 0,
            rewinds: Arc::clone(&rewinds),
        };
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        let stream = AudioStream::start(
            Some(Box::new(source)),
            true,
            Arc::new(move |_| {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );

        assert!(wait_until(Duration::from_secs(2), || {
            rewinds.load(Ordering::SeqCst) >= 2
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        stream.stop();
    }

    #[test]
    fn stop_discards_buffered_frames() {
        let source = ScriptedSource {
            chunks: vec![vec![3u8; 960], vec![4u8; 960]],
            cursor: 0,
            rewinds: Arc::new(AtomicUsize::new(0)),
        };
        let stream = AudioStream::start(Some(Box::new(source)), true, Arc::new(|_| {}), None);

        assert!(wait_until(Duration::from_secs(2), || {
            stream.shared.queue.read().len() > 0
        }));
        stream.stop();
        assert!(stream.read(960).is_none());
        assert!(!stream.is_running());
    }

    #[test]
    fn paused_stream_reads_empty_but_keeps_producing() {
        let source = ScriptedSource {
            chunks: vec![vec![5u8; 960]; 4],
            cursor: 0,
            rewinds: Arc::new(AtomicUsize::new(0)),
        };
        let stream = AudioStream::start(Some(Box::new(source)), true, Arc::new(|_| {}), None);

        stream.set_pause(true);
        assert!(wait_until(Duration::from_secs(2), || {
            stream.shared.queue.read().len() > 0
        }));
        assert!(stream.read(960).is_none());

        stream.set_pause(false);
        assert!(stream.read(960).is_some());
        stream.stop();
    }
}
