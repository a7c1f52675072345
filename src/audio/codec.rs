//! # PCM Codec
//!
//! Pure conversions between the representations audio takes on its way through the engine:
//! - **f32 samples** in [-1.0, 1.0], what the microphone and the mixer work with
//! - **PCM16 bytes**, 16-bit signed little-endian, what the peer speaks
//! - **base64 text**, the transport encoding for PCM16 payloads
//! - **WAV files**, a canonical 44-byte RIFF header in front of raw PCM
//!
//! ## Tolerance:
//! None of these functions fail on their normal inputs. Frames are cut at arbitrary
//! boundaries, so a trailing odd byte or a partial base64 quantum is an expected
//! artifact. It is truncated rather than rejected. `try_decode_base64` is the strict
//! variant for callers that would rather reject a malformed payload.

use crate::error::{EngineError, EngineResult};
use base64::alphabet;
use base64::engine::general_purpose::STANDARD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;
use tracing::debug;

/// Length of the canonical RIFF/WAVE header written by `build_wav`.
pub const WAV_HEADER_LEN: usize = 44;

/// Lenient engine used after the input has been cut down to whole characters:
/// padding is optional and stray low bits in the last character are ignored.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Convert float samples to PCM16 little-endian bytes.
///
/// ## Conversion:
/// Each sample is scaled by 32767, rounded to the nearest integer and clamped to the
/// signed 16-bit range. Out-of-range input is clamped, NaN becomes silence.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    for (sample, out) in samples.iter().zip(bytes.chunks_exact_mut(2)) {
        LittleEndian::write_i16(out, sample_to_i16(*sample));
    }
    bytes
}

/// Scale one float sample to a signed 16-bit value.
#[inline]
pub fn sample_to_i16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample * 32767.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Convert PCM16 little-endian bytes back to float samples.
///
/// ## Conversion:
/// Divides by 32768.0, so the output lies in [-1.0, 1.0). A trailing odd byte
/// cannot form a sample and is dropped.
pub fn pcm16_to_float(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| LittleEndian::read_i16(pair) as f32 / 32768.0)
        .collect()
}

/// Encode bytes with the standard base64 alphabet, padded, without line wrapping.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode base64 text, truncating instead of failing.
///
/// ## Truncation Rules:
/// 1. ASCII whitespace is skipped (some peers wrap long payloads)
/// 2. Decoding stops at the first padding character or byte outside the alphabet
/// 3. A dangling single character (not enough bits for a byte) is dropped
///
/// Well-formed input decodes exactly as a strict decoder would.
pub fn decode_base64(text: &str) -> Vec<u8> {
    let (symbols, truncated) = base64_symbols(text);
    if truncated {
        debug!(
            input_len = text.len(),
            decoded_symbols = symbols.len(),
            "base64 payload truncated"
        );
    }

    // Only alphabet characters remain and the length is never 1 mod 4, so this cannot fail.
    LENIENT.decode(&symbols).unwrap_or_default()
}

/// Alphabet symbols of `text` up to the first padding or foreign byte, and whether
/// anything other than padding and whitespace was dropped.
fn base64_symbols(text: &str) -> (Vec<u8>, bool) {
    let bytes = text.as_bytes();
    let mut symbols: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut stop = None;
    for (i, &byte) in bytes.iter().enumerate() {
        if byte.is_ascii_whitespace() {
            continue;
        }
        if byte.is_ascii_alphanumeric() || byte == b'+' || byte == b'/' {
            symbols.push(byte);
        } else {
            stop = Some(i);
            break;
        }
    }

    let mut truncated = stop.map_or(false, |i| {
        bytes[i..]
            .iter()
            .any(|&b| b != b'=' && !b.is_ascii_whitespace())
    });
    if symbols.len() % 4 == 1 {
        symbols.pop();
        truncated = true;
    }
    (symbols, truncated)
}

/// Strict base64 decoding that rejects malformed input.
pub fn try_decode_base64(text: &str) -> EngineResult<Vec<u8>> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| EngineError::Protocol(format!("Invalid base64 audio: {}", e)))
}

/// Format description for a WAV container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl WavSpec {
    /// 24kHz mono 16-bit, the format of everything the peer sends.
    pub fn mono_24k() -> Self {
        Self::mono16(24_000)
    }

    /// Mono 16-bit at the given rate.
    pub fn mono16(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            bits_per_sample: 16,
        }
    }

    /// Bytes per second of audio: rate × channels × bytes per sample.
    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.channels as u32 * self.bits_per_sample as u32 / 8
    }

    /// Bytes per frame (one sample for every channel).
    pub fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample / 8
    }
}

/// Wrap raw PCM bytes in a canonical 44-byte RIFF/WAVE header.
///
/// ## Byte Layout (little-endian):
/// ```text
///  0 "RIFF"      4 u32 36 + data size   8 "WAVE"
/// 12 "fmt "     16 u32 16               20 u16 1 (PCM)   22 u16 channels
/// 24 u32 rate   28 u32 byte rate        32 u16 block align  34 u16 bits
/// 36 "data"     40 u32 data size        44 PCM payload
/// ```
pub fn build_wav(pcm: &[u8], spec: WavSpec) -> Vec<u8> {
    let data_size = u32::try_from(pcm.len()).unwrap_or(u32::MAX);

    let mut header = [0u8; WAV_HEADER_LEN];
    header[0..4].copy_from_slice(b"RIFF");
    LittleEndian::write_u32(&mut header[4..8], data_size.saturating_add(36));
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    LittleEndian::write_u32(&mut header[16..20], 16);
    LittleEndian::write_u16(&mut header[20..22], 1);
    LittleEndian::write_u16(&mut header[22..24], spec.channels);
    LittleEndian::write_u32(&mut header[24..28], spec.sample_rate);
    LittleEndian::write_u32(&mut header[28..32], spec.byte_rate());
    LittleEndian::write_u16(&mut header[32..34], spec.block_align());
    LittleEndian::write_u16(&mut header[34..36], spec.bits_per_sample);
    header[36..40].copy_from_slice(b"data");
    LittleEndian::write_u32(&mut header[40..44], data_size);

    let mut wav = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
    wav.extend_from_slice(&header);
    wav.extend_from_slice(pcm);
    wav
}

/// `build_wav` for mono 16-bit PCM at `sample_rate`.
pub fn build_wav_default(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    build_wav(pcm, WavSpec::mono16(sample_rate))
}

/// Write mono 16-bit PCM to `path` as a standalone WAV file.
pub fn write_wav_file(path: impl AsRef<Path>, pcm: &[u8], sample_rate: u32) -> EngineResult<()> {
    let path = path.as_ref();
    std::fs::write(path, build_wav_default(pcm, sample_rate))?;
    debug!(path = %path.display(), bytes = pcm.len(), sample_rate, "WAV artifact written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_float_to_pcm16_scaling_and_clamping() {
        let bytes = float_to_pcm16(&[0.0, 0.5, -0.5, 1.0, -1.0, 2.0, -3.0, f32::NAN]);
        let values: Vec<i16> = bytes.chunks_exact(2).map(LittleEndian::read_i16).collect();
        assert_eq!(values, vec![0, 16384, -16384, 32767, -32767, 32767, -32768, 0]);
    }

    #[test]
    fn test_pcm16_to_float_truncates_odd_byte() {
        let samples = pcm16_to_float(&[0x00, 0x40, 0x00, 0x80, 0x7f]);
        assert_eq!(samples, vec![0.5, -1.0]);
    }

    #[test]
    fn test_pcm_round_trip_is_quantization_bounded() {
        // Encoding scales by 32767 and decoding divides by 32768, so next to the
        // half-step rounding error there is a |s|/32768 scale error.
        for i in -1000..=1000 {
            let s = i as f32 / 1000.0;
            let back = pcm16_to_float(&float_to_pcm16(&[s]))[0];
            let bound = (0.5 + s.abs()) / 32768.0 + 1e-6;
            assert!(
                (back - s).abs() <= bound,
                "sample {} came back as {}",
                s,
                back
            );
        }

        // Values on the 1/32768 grid below full scale come back within one step.
        for q in [-16384i32, -1, 0, 1, 8192, 16384] {
            let s = q as f32 / 32768.0;
            let back = pcm16_to_float(&float_to_pcm16(&[s]))[0];
            assert!((back - s).abs() <= 1.0 / 32768.0);
        }
    }

    #[test]
    fn test_base64_standard_alphabet() {
        assert_eq!(encode_base64(b"live"), "bGl2ZQ==");
        assert_eq!(decode_base64("bGl2ZQ=="), b"live".to_vec());
        assert_eq!(try_decode_base64("bGl2ZQ==").unwrap(), b"live".to_vec());
    }

    #[test]
    fn test_base64_tolerant_decoding() {
        // Missing padding
        assert_eq!(decode_base64("bGl2ZQ"), b"live".to_vec());
        // Wrapped lines
        assert_eq!(decode_base64("bGl2\nZQ=="), b"live".to_vec());
        // Garbage tail is cut off at the first invalid character
        assert_eq!(decode_base64("bGl2ZQ==%%%"), b"live".to_vec());
        assert_eq!(decode_base64("bGl2!ZQ=="), b"liv".to_vec());
        // Dangling single character
        assert_eq!(decode_base64("bGl2Z"), b"liv".to_vec());
        assert!(decode_base64("").is_empty());
        assert!(decode_base64("%%%").is_empty());

        assert!(try_decode_base64("bGl2!ZQ==").is_err());
    }

    #[test]
    fn test_padding_is_not_truncation() {
        assert!(!base64_symbols("AEAAwA==").1);
        assert!(!base64_symbols("AEAA\nwA==\n").1);
        assert!(!base64_symbols("AEAAwA").1);

        let (symbols, truncated) = base64_symbols("AEAA!wA==");
        assert_eq!(symbols, b"AEAA".to_vec());
        assert!(truncated);

        // Data after the padding is dropped.
        assert!(base64_symbols("AA==AEAA").1);
        // A dangling symbol carries less than a byte.
        assert!(base64_symbols("AEAAw").1);
    }

    #[test]
    fn test_wav_header_exactness() {
        let pcm = vec![0u8; 1000];
        let wav = build_wav(&pcm, WavSpec::mono_24k());
        assert_eq!(wav.len(), 1044);

        let mut expected = Vec::new();
        expected.extend_from_slice(b"RIFF");
        expected.extend_from_slice(&1036u32.to_le_bytes());
        expected.extend_from_slice(b"WAVE");
        expected.extend_from_slice(b"fmt ");
        expected.extend_from_slice(&16u32.to_le_bytes());
        expected.extend_from_slice(&1u16.to_le_bytes());
        expected.extend_from_slice(&1u16.to_le_bytes());
        expected.extend_from_slice(&24_000u32.to_le_bytes());
        expected.extend_from_slice(&48_000u32.to_le_bytes());
        expected.extend_from_slice(&2u16.to_le_bytes());
        expected.extend_from_slice(&16u16.to_le_bytes());
        expected.extend_from_slice(b"data");
        expected.extend_from_slice(&1000u32.to_le_bytes());

        assert_eq!(&wav[..WAV_HEADER_LEN], expected.as_slice());
        assert!(wav[WAV_HEADER_LEN..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_wav_output_is_readable_by_wav_crate() {
        let samples = [0.0f32, 0.25, -0.25, 0.5];
        let wav_bytes = build_wav_default(&float_to_pcm16(&samples), 24_000);

        let (header, data) = wav::read(&mut Cursor::new(wav_bytes)).unwrap();
        assert_eq!(header.audio_format, 1);
        assert_eq!(header.channel_count, 1);
        assert_eq!(header.sampling_rate, 24_000);
        assert_eq!(header.bits_per_sample, 16);
        match data {
            wav::BitDepth::Sixteen(values) => assert_eq!(values, vec![0, 8192, -8192, 16384]),
            other => panic!("unexpected bit depth: {:?}", other),
        }
    }

    #[test]
    fn test_stereo_header_fields() {
        let spec = WavSpec {
            sample_rate: 48_000,
            channels: 2,
            bits_per_sample: 16,
        };
        let wav = build_wav(&[0u8; 8], spec);
        assert_eq!(LittleEndian::read_u32(&wav[28..32]), 192_000);
        assert_eq!(LittleEndian::read_u16(&wav[32..34]), 4);
    }
}
