//! In-memory WAV fixtures for unit tests

use std::io::Cursor;

use crate::wav::WavStream;

fn write_wav<S: hound::Sample + Copy>(samples: &[S], spec: hound::WavSpec) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("wav writer");
    for &sample in samples {
        writer.write_sample(sample).expect("write sample");
    }
    writer.finalize().expect("finalize wav");
    cursor.into_inner()
}

/// 16-bit PCM WAV bytes, interleaved when `channels > 1`
pub fn wav_bytes(samples: &[i16], channels: u16, sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    write_wav(samples, spec)
}

/// 24-bit PCM WAV bytes; samples are sign-extended 24-bit values
pub fn wav_bytes_24(samples: &[i32], channels: u16, sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 24,
        sample_format: hound::SampleFormat::Int,
    };
    write_wav(samples, spec)
}

pub fn mono_stream(samples: &[i16], sample_rate: u32) -> WavStream<Cursor<Vec<u8>>> {
    WavStream::from_reader(Cursor::new(wav_bytes(samples, 1, sample_rate)))
        .expect("fixture must parse")
}

pub fn mono_stream_24(samples: &[i32], sample_rate: u32) -> WavStream<Cursor<Vec<u8>>> {
    WavStream::from_reader(Cursor::new(wav_bytes_24(samples, 1, sample_rate)))
        .expect("fixture must parse")
}

/// Deterministic non-periodic noise
pub fn noise(len: usize, seed: u32) -> Vec<i16> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 16) as i16
        })
        .collect()
}

/// Deterministic noise in the signed 24-bit range
pub fn noise_24(len: usize, seed: u32) -> Vec<i32> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(7);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state as i32) >> 8
        })
        .collect()
}
