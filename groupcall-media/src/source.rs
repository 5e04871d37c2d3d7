//! Decoder-side sources for the media streams.
//!
//! A source decodes at its natural pace and hands the stream format-normalized
//! data: interleaved 48 kHz stereo s16le for audio, RGBA frames for video.
//! Sources are driven only from a stream's production thread, so they are
//! `Send` but never shared.

use crate::error::MediaError;
use crate::{AUDIO_CHANNELS, AUDIO_SAMPLE_RATE};
use bytes::{Bytes, BytesMut};
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use openh264::formats::YUVSource;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder as SymphoniaDecoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::debug;

/// Produces format-normalized audio chunks from some underlying medium.
pub trait AudioSource: Send {
    /// Decode the next chunk, already resampled to 48 kHz stereo s16le.
    /// Returns `Ok(None)` on end of stream.
    fn next_chunk(&mut self) -> Result<Option<Bytes>, MediaError>;

    /// Seek back to the start of the source.
    fn rewind(&mut self) -> Result<(), MediaError>;

    /// Presentation position of the most recently produced chunk.
    fn pts(&self) -> Option<Duration>;

    /// Identifier of the source, reported by the end-of-stream callback.
    fn id(&self) -> &str;
}

/// Geometry and rate of a video source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frames per second
    pub fps: u32,
}

impl VideoInfo {
    /// Size in bytes of one RGBA frame at this geometry.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

impl Default for VideoInfo {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

/// One decoded RGBA video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// RGBA pixel data, `width * height * 4` bytes
    pub data: Bytes,
    /// Presentation timestamp of the frame
    pub pts: Option<Duration>,
}

/// Produces RGBA frames from some underlying medium.
pub trait VideoSource: Send {
    /// Decode the next frame. Returns `Ok(None)` on end of stream.
    fn next_frame(&mut self) -> Result<Option<VideoFrame>, MediaError>;

    /// Seek back to the first frame.
    fn rewind(&mut self) -> Result<(), MediaError>;

    /// Geometry and rate of the source.
    fn info(&self) -> VideoInfo;

    /// Identifier of the source, reported by the end-of-stream callback.
    fn id(&self) -> &str;
}

/// Audio file source: symphonia demux/decode, rubato resample to the target
/// format. Supports any container/codec the enabled symphonia features
/// cover.
pub struct FileAudioSource {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn SymphoniaDecoder>,
    track_id: u32,
    source_rate: u32,
    source_channels: usize,
    resampler: Option<rubato::SincFixedIn<f32>>,
    /// Planar staging buffers feeding the fixed-size resampler input
    pending: Vec<Vec<f32>>,
    frames_emitted: u64,
    id: String,
}

impl FileAudioSource {
    /// Open and probe an audio file.
    pub fn open(path: &Path) -> Result<Self, MediaError> {
        let source_id = path.display().to_string();
        let file = File::open(path).map_err(|e| MediaError::Open {
            source_id: source_id.clone(),
            reason: e.to_string(),
        })?;
        let stream = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                stream,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| MediaError::Open {
                source_id: source_id.clone(),
                reason: e.to_string(),
            })?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| MediaError::NoAudioTrack {
                source_id: source_id.clone(),
            })?;
        let track_id = track.id;
        let source_rate = track.codec_params.sample_rate.unwrap_or(AUDIO_SAMPLE_RATE);
        let source_channels = track
            .codec_params
            .channels
            .map(|c| c.count())
            .unwrap_or(AUDIO_CHANNELS);

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| MediaError::Decode {
                reason: e.to_string(),
            })?;

        let resampler = if source_rate != AUDIO_SAMPLE_RATE {
            Some(Self::build_resampler(source_rate)?)
        } else {
            None
        };

        debug!(
            source = %source_id,
            rate = source_rate,
            channels = source_channels,
            resampled = resampler.is_some(),
            "Opened audio source"
        );

        Ok(Self {
            format,
            decoder,
            track_id,
            source_rate,
            source_channels,
            resampler,
            pending: vec![Vec::new(); AUDIO_CHANNELS],
            frames_emitted: 0,
            id: source_id,
        })
    }

    fn build_resampler(source_rate: u32) -> Result<rubato::SincFixedIn<f32>, MediaError> {
        use rubato::{
            SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
        };

        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        SincFixedIn::<f32>::new(
            f64::from(AUDIO_SAMPLE_RATE) / f64::from(source_rate),
            2.0,
            params,
            1024,
            AUDIO_CHANNELS,
        )
        .map_err(|e| MediaError::Resample {
            reason: e.to_string(),
        })
    }

    /// Spread an interleaved source buffer into the stereo staging buffers,
    /// duplicating mono and taking the first two channels of anything wider.
    fn stage(&mut self, interleaved: &[f32]) {
        match self.source_channels {
            0 => {}
            1 => {
                self.pending[0].extend_from_slice(interleaved);
                self.pending[1].extend_from_slice(interleaved);
            }
            n => {
                for frame in interleaved.chunks_exact(n) {
                    self.pending[0].push(frame[0]);
                    self.pending[1].push(frame[1]);
                }
            }
        }
    }

    /// Drain staged frames through the resampler (or straight through when
    /// rates match) into interleaved s16le bytes.
    fn drain_staged(&mut self, out: &mut BytesMut) -> Result<(), MediaError> {
        match &mut self.resampler {
            None => {
                let frames = self.pending[0].len().min(self.pending[1].len());
                if frames == 0 {
                    return Ok(());
                }
                for i in 0..frames {
                    for ch in 0..AUDIO_CHANNELS {
                        out.extend_from_slice(&to_s16(self.pending[ch][i]).to_le_bytes());
                    }
                }
                for ch in self.pending.iter_mut() {
                    ch.drain(..frames);
                }
                self.frames_emitted += frames as u64;
                Ok(())
            }
            Some(resampler) => {
                use rubato::Resampler;

                loop {
                    let needed = resampler.input_frames_next();
                    if self.pending[0].len() < needed || self.pending[1].len() < needed {
                        return Ok(());
                    }
                    let block: Vec<Vec<f32>> = self
                        .pending
                        .iter_mut()
                        .map(|ch| ch.drain(..needed).collect())
                        .collect();
                    let resampled =
                        resampler
                            .process(&block, None)
                            .map_err(|e| MediaError::Resample {
                                reason: e.to_string(),
                            })?;

                    let frames = resampled[0].len().min(resampled[1].len());
                    for i in 0..frames {
                        for ch in resampled.iter().take(AUDIO_CHANNELS) {
                            out.extend_from_slice(&to_s16(ch[i]).to_le_bytes());
                        }
                    }
                    self.frames_emitted += frames as u64;
                }
            }
        }
    }
}

impl AudioSource for FileAudioSource {
    fn next_chunk(&mut self) -> Result<Option<Bytes>, MediaError> {
        let mut out = BytesMut::new();

        while out.is_empty() {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => {
                    return Err(MediaError::Decode {
                        reason: e.to_string(),
                    })
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                // A single malformed packet is skippable.
                Err(SymphoniaError::DecodeError(e)) => {
                    debug!(source = %self.id, error = %e, "Skipping malformed packet");
                    continue;
                }
                Err(e) => {
                    return Err(MediaError::Decode {
                        reason: e.to_string(),
                    })
                }
            };

            let spec = *decoded.spec();
            let mut samples = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            samples.copy_interleaved_ref(decoded);
            self.stage(samples.samples());
            self.drain_staged(&mut out)?;
        }

        Ok(Some(out.freeze()))
    }

    fn rewind(&mut self) -> Result<(), MediaError> {
        self.format
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::default(),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| MediaError::Seek {
                reason: e.to_string(),
            })?;
        self.decoder.reset();
        if self.resampler.is_some() {
            self.resampler = Some(Self::build_resampler(self.source_rate)?);
        }
        for ch in self.pending.iter_mut() {
            ch.clear();
        }
        self.frames_emitted = 0;
        Ok(())
    }

    fn pts(&self) -> Option<Duration> {
        Some(Duration::from_secs_f64(
            self.frames_emitted as f64 / f64::from(AUDIO_SAMPLE_RATE),
        ))
    }

    fn id(&self) -> &str {
        &self.id
    }
}

fn to_s16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

/// Video file source: an H.264 Annex-B elementary stream decoded with
/// openh264 and converted to RGBA. Elementary streams carry no container
/// timing, so frames are timestamped against the nominal frame rate.
pub struct FileVideoSource {
    data: Vec<u8>,
    units: Vec<(usize, usize)>,
    cursor: usize,
    decoder: openh264::decoder::Decoder,
    info: VideoInfo,
    frame_index: u64,
    id: String,
}

impl FileVideoSource {
    /// Read and index an Annex-B elementary stream.
    pub fn open(path: &Path) -> Result<Self, MediaError> {
        let source_id = path.display().to_string();
        let data = std::fs::read(path).map_err(|e| MediaError::Open {
            source_id: source_id.clone(),
            reason: e.to_string(),
        })?;
        let units = annex_b_units(&data);
        if units.is_empty() {
            return Err(MediaError::Open {
                source_id,
                reason: "no Annex-B start codes found".to_string(),
            });
        }
        let decoder = openh264::decoder::Decoder::new().map_err(|e| MediaError::Decode {
            reason: e.to_string(),
        })?;

        debug!(source = %source_id, nal_units = units.len(), "Opened video source");

        Ok(Self {
            data,
            units,
            cursor: 0,
            decoder,
            info: VideoInfo::default(),
            frame_index: 0,
            id: source_id,
        })
    }
}

impl VideoSource for FileVideoSource {
    fn next_frame(&mut self) -> Result<Option<VideoFrame>, MediaError> {
        while self.cursor < self.units.len() {
            let (start, end) = self.units[self.cursor];
            self.cursor += 1;

            let decoded = self
                .decoder
                .decode(&self.data[start..end])
                .map_err(|e| MediaError::Decode {
                    reason: e.to_string(),
                })?;

            if let Some(yuv) = decoded {
                let (width, height) = yuv_dimensions(&yuv);
                self.info.width = width;
                self.info.height = height;

                let pts = Duration::from_secs_f64(
                    self.frame_index as f64 / f64::from(self.info.fps.max(1)),
                );
                self.frame_index += 1;

                return Ok(Some(VideoFrame {
                    data: yuv_to_rgba(&yuv),
                    pts: Some(pts),
                }));
            }
        }
        Ok(None)
    }

    fn rewind(&mut self) -> Result<(), MediaError> {
        self.cursor = 0;
        self.frame_index = 0;
        // The decoder keeps reference frames; a fresh one avoids artifacts
        // from decoding the stream head against stale state.
        self.decoder = openh264::decoder::Decoder::new().map_err(|e| MediaError::Decode {
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn info(&self) -> VideoInfo {
        self.info
    }

    fn id(&self) -> &str {
        &self.id
    }
}

fn yuv_dimensions(yuv: &openh264::decoder::DecodedYUV<'_>) -> (u32, u32) {
    let (width, height) = yuv.dimensions();
    (width as u32, height as u32)
}

/// BT.601 limited-range YUV 4:2:0 to interleaved RGBA.
fn yuv_to_rgba(yuv: &openh264::decoder::DecodedYUV<'_>) -> Bytes {
    let (width, height) = yuv.dimensions();
    let (stride_y, stride_u, stride_v) = yuv.strides();
    let (y_plane, u_plane, v_plane) = (yuv.y(), yuv.u(), yuv.v());

    let mut rgba = BytesMut::with_capacity(width * height * 4);
    for row in 0..height {
        for col in 0..width {
            let y = f32::from(y_plane[row * stride_y + col]);
            let u = f32::from(u_plane[(row / 2) * stride_u + col / 2]) - 128.0;
            let v = f32::from(v_plane[(row / 2) * stride_v + col / 2]) - 128.0;

            let c = 1.164 * (y - 16.0);
            let r = (c + 1.596 * v).clamp(0.0, 255.0) as u8;
            let g = (c - 0.392 * u - 0.813 * v).clamp(0.0, 255.0) as u8;
            let b = (c + 2.017 * u).clamp(0.0, 255.0) as u8;
            rgba.extend_from_slice(&[r, g, b, 255]);
        }
    }
    rgba.freeze()
}

/// Index the NAL units of an Annex-B stream as byte ranges, each including
/// its start code.
fn annex_b_units(data: &[u8]) -> Vec<(usize, usize)> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            // Fold a four-byte start code into the unit.
            let begin = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            starts.push(begin);
            i += 3;
        } else {
            i += 1;
        }
    }

    starts
        .iter()
        .enumerate()
        .map(|(n, &begin)| {
            let end = starts.get(n + 1).copied().unwrap_or(data.len());
            (begin, end)
        })
        .collect()
}
