use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision};
use symphonia::core::probe::Hint;
use symphonia::core::units::TimeBase;

use crate::error::{Result, SessionError};

use super::bridge::{DecodeBridge, PcmDelivery};

const OUTPUT_BITS_PER_SAMPLE: u16 = 16;

/// Counters reported when the decode loop ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    pub packets: u64,
    pub frames: u64,
    pub decode_errors: u64,
}

/// A probed source, ready to decode
pub struct DecoderSource {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    tags: Vec<(String, String)>,
}

impl std::fmt::Debug for DecoderSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderSource")
            .field("track_id", &self.track_id)
            .field("tags", &self.tags)
            .finish()
    }
}

/// Open and probe `source`. Any failure to open, probe, or build a decoder
/// is reported as `InvalidSource`.
pub fn open_source(source: &str) -> Result<DecoderSource> {
    let invalid = |reason: String| SessionError::InvalidSource {
        source_id: source.to_string(),
        reason,
    };

    let path = Path::new(source);
    let file = std::fs::File::open(path).map_err(|e| invalid(e.to_string()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mut probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| invalid(format!("failed to probe format: {e}")))?;

    let mut tags = Vec::new();
    if let Some(metadata) = probed.metadata.get() {
        if let Some(revision) = metadata.current() {
            tags = collect_tags(revision);
        }
    }
    if tags.is_empty() {
        if let Some(revision) = probed.format.metadata().current() {
            tags = collect_tags(revision);
        }
    }

    let format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| invalid("no audio tracks found".into()))?;
    let track_id = track.id;
    let time_base = track.codec_params.time_base;
    let decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| invalid(format!("failed to create decoder: {e}")))?;

    Ok(DecoderSource {
        format,
        decoder,
        track_id,
        time_base,
        tags,
    })
}

fn collect_tags(revision: &MetadataRevision) -> Vec<(String, String)> {
    revision
        .tags()
        .iter()
        .map(|tag| {
            let key = match tag.std_key {
                Some(std_key) => format!("{std_key:?}"),
                None => tag.key.clone(),
            };
            (key, tag.value.to_string())
        })
        .collect()
}

impl DecoderSource {
    /// Metadata tags found while probing, as (key, value)
    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    /// Decode until end of stream or until `stop` is set
    pub fn run<B>(mut self, bridge: &B, chunk_size: usize, stop: &AtomicBool) -> Result<DecodeSummary>
    where
        B: DecodeBridge + ?Sized,
    {
        let mut summary = DecodeSummary::default();
        let chunk_size = chunk_size.max(1);

        while !stop.load(Ordering::Relaxed) {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => {
                    log::warn!("Stream reset required; stopping decode");
                    break;
                }
                Err(e) => {
                    log::warn!("Stopping decode on read error: {}", e);
                    break;
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }
            summary.packets += 1;

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    summary.decode_errors += 1;
                    log::debug!("Skipping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => {
                    log::warn!("Stopping decode on decoder error: {}", e);
                    break;
                }
            };

            let spec = *decoded.spec();
            let channels = spec.channels.count();
            let num_frames = decoded.frames();
            if num_frames == 0 || channels == 0 {
                continue;
            }

            let mut sample_buf = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
            sample_buf.copy_interleaved_ref(decoded);
            let samples = sample_buf.samples();

            for (i, chunk) in samples.chunks(chunk_size * channels).enumerate() {
                let byte_size = std::mem::size_of_val(chunk);
                let mut buffer = bridge.on_prepare(byte_size)?;
                for (dst, sample) in buffer.chunks_exact_mut(2).zip(chunk) {
                    dst.copy_from_slice(&sample.to_le_bytes());
                }
                bridge.on_deliver(
                    buffer,
                    PcmDelivery {
                        channels: channels as u16,
                        sample_rate: spec.rate,
                        sample_count: (chunk.len() / channels) as u32,
                        bits_per_sample: OUTPUT_BITS_PER_SAMPLE,
                        byte_size,
                        pts: chunk_pts(packet.ts(), i * chunk_size, spec.rate, self.time_base),
                    },
                )?;
            }
            summary.frames += num_frames as u64;
        }

        Ok(summary)
    }
}

/// Timestamp, in track timebase ticks, of a chunk starting `frame_offset`
/// frames into a packet. Without a timebase, ticks are frames.
fn chunk_pts(packet_ts: u64, frame_offset: usize, sample_rate: u32, time_base: Option<TimeBase>) -> i64 {
    let offset = match time_base {
        Some(tb) if tb.numer > 0 && sample_rate > 0 => {
            frame_offset as u64 * tb.denom as u64 / (tb.numer as u64 * sample_rate as u64)
        }
        _ => frame_offset as u64,
    };
    (packet_ts + offset) as i64
}

/// Run the decode loop on its own thread, the way an external decoder would
/// call back into the session
pub fn spawn_decoder<B>(
    source: DecoderSource,
    bridge: Arc<B>,
    chunk_size: usize,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<Result<DecodeSummary>>>
where
    B: DecodeBridge + 'static,
{
    let handle = thread::Builder::new()
        .name("pcmscope-decoder".into())
        .spawn(move || {
            let result = source.run(&*bridge, chunk_size, &stop);
            match &result {
                Ok(summary) => log::info!(
                    "Decoder finished: {} packets, {} frames, {} decode errors",
                    summary.packets,
                    summary.frames,
                    summary.decode_errors
                ),
                Err(e) => log::error!("Decoder stopped: {}", e),
            }
            result
        })?;
    Ok(handle)
}

#[cfg(test)]
pub(crate) fn write_test_wav(name: &str, sample_rate: u32, samples: &[i16]) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("pcmscope-{}-{}.wav", std::process::id(), name));
    let data_len = std::mem::size_of_val(samples) as u32;
    let mut bytes = Vec::with_capacity(44 + data_len as usize);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
    bytes.extend_from_slice(b"WAVE");
    bytes.extend_from_slice(b"fmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&sample_rate.to_le_bytes());
    bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&data_len.to_le_bytes());
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    std::fs::write(&path, bytes).unwrap();
    path
}
