// Sound controller of the video board: four synthesised voices plus the
// sample-table voice fed through a FIFO. Register writes fan out to every
// voice whose bit is set in the enable mask; bit 7 selects the sample
// voice, whose registers 0/1/2 mean FIFO byte, baud divider and format
// instead. The host audio thread owns the phase accumulators and pulls
// samples through a shared handle: registers cross as atomics, PCM bytes
// on a bounded SPSC channel whose length doubles as the FIFO byte count.

use crossbeam_channel::{Receiver, Sender};
use rand::Rng;
use rodio::Source;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SAMPLE_RATE: u32 = 44091;
pub const VOICE_COUNT: usize = 4;
const SAMPLE_FIFO_SIZE: usize = 1024;
const SAMPLE_MAX: u32 = 65535;

// Registers, relative to the controller
const REG_FREQ_LOW: u16 = 0x0;
const REG_FREQ_HIGH: u16 = 0x1;
const REG_WAVEFORM: u16 = 0x2;
const REG_VOICE_VOL: u16 = 0x3;
const REG_MST_LEFT: u16 = 0xB;
const REG_MST_RIGHT: u16 = 0xC;
const REG_MST_HOLD: u16 = 0xD;
const REG_MST_VOL: u16 = 0xE;
const REG_MST_ENA: u16 = 0xF;

const WAVE_SQUARE: u8 = 0;
const WAVE_TRIANGLE: u8 = 1;
const WAVE_SAWTOOTH: u8 = 2;
const WAVE_NOISE: u8 = 3;

/// Duty cycle sits in the top three bits of the waveform register.
const WAVEFORM_DUTY_SHIFT: u8 = 5;

fn volume_steps_to_float(value: u8, bits: u32) -> f32 {
    let mask = (1u8 << bits) - 1;
    let step = 1.0 / (mask as f32 + 1.0);
    ((value & mask) as f32 + 1.0) * step
}

struct VoiceRegs {
    freq_low: AtomicU8,
    freq_high: AtomicU8,
    wave: AtomicU8,
    duty: AtomicU8,
    volume_steps: AtomicU8,
    hold: AtomicU8,
}

impl VoiceRegs {
    fn new() -> VoiceRegs {
        VoiceRegs {
            freq_low: AtomicU8::new(0),
            freq_high: AtomicU8::new(0),
            wave: AtomicU8::new(0),
            duty: AtomicU8::new(0),
            volume_steps: AtomicU8::new(0),
            hold: AtomicU8::new(0),
        }
    }
}

/// Register state shared with the audio thread.
struct SoundShared {
    voices: [VoiceRegs; VOICE_COUNT],
    enabled_voices: AtomicU8,
    left_voices: AtomicU8,
    right_voices: AtomicU8,
    hold_voices: AtomicU8,
    master_volume: AtomicU8,
    sample_divider: AtomicU8,
    sample_config: AtomicU8,
}

pub struct Sound {
    shared: Arc<SoundShared>,
    fifo_tx: Sender<u8>,
    /// Receiver handed over to the audio source at stream creation.
    pending_rx: Option<Receiver<u8>>,
}

impl Sound {
    pub fn new() -> Sound {
        let shared = Arc::new(SoundShared {
            voices: [VoiceRegs::new(), VoiceRegs::new(), VoiceRegs::new(), VoiceRegs::new()],
            enabled_voices: AtomicU8::new(0),
            left_voices: AtomicU8::new(0),
            right_voices: AtomicU8::new(0),
            hold_voices: AtomicU8::new(0),
            // Both channels disabled on boot
            master_volume: AtomicU8::new(0xc0),
            sample_divider: AtomicU8::new(0),
            sample_config: AtomicU8::new(0),
        });
        let (fifo_tx, fifo_rx) = crossbeam_channel::bounded(SAMPLE_FIFO_SIZE);
        let mut sound = Sound { shared, fifo_tx, pending_rx: Some(fifo_rx) };
        sound.reset();
        sound
    }

    pub fn reset(&mut self) {
        let shared = &self.shared;
        shared.enabled_voices.store(0, Ordering::Relaxed);
        shared.left_voices.store(0, Ordering::Relaxed);
        shared.right_voices.store(0, Ordering::Relaxed);
        shared.hold_voices.store(0, Ordering::Relaxed);
        shared.master_volume.store(0xc0, Ordering::Relaxed);
        shared.sample_divider.store(0, Ordering::Relaxed);
        shared.sample_config.store(0, Ordering::Relaxed);
        for voice in &shared.voices {
            voice.freq_low.store(0, Ordering::Relaxed);
            voice.freq_high.store(0, Ordering::Relaxed);
            voice.wave.store(0, Ordering::Relaxed);
            voice.duty.store(0, Ordering::Relaxed);
            voice.volume_steps.store(0, Ordering::Relaxed);
            voice.hold.store(0, Ordering::Relaxed);
        }
        // Drain any queued samples
        if let Some(rx) = &self.pending_rx {
            while rx.try_recv().is_ok() {}
        }
    }

    fn sample_table_enabled(&self) -> bool {
        self.shared.enabled_voices.load(Ordering::Relaxed) & 0x80 != 0
    }

    fn voice_enabled(&self, i: usize) -> bool {
        self.shared.enabled_voices.load(Ordering::Relaxed) & (1 << i) != 0
    }

    pub fn read(&mut self, port: u16) -> u8 {
        let shared = &self.shared;
        match port {
            REG_FREQ_HIGH if self.sample_table_enabled() => shared.sample_divider.load(Ordering::Relaxed),
            REG_WAVEFORM if self.sample_table_enabled() => {
                let len = self.fifo_tx.len();
                (((len == 0) as u8) << 7)
                    | (((len == SAMPLE_FIFO_SIZE) as u8) << 6)
                    | (shared.sample_config.load(Ordering::Relaxed) & 0x7)
            }
            REG_MST_LEFT => shared.left_voices.load(Ordering::Relaxed),
            REG_MST_RIGHT => shared.right_voices.load(Ordering::Relaxed),
            REG_MST_HOLD => shared.hold_voices.load(Ordering::Relaxed),
            REG_MST_VOL => shared.master_volume.load(Ordering::Relaxed),
            REG_MST_ENA => shared.enabled_voices.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    pub fn write(&mut self, port: u16, value: u8) {
        let shared = Arc::clone(&self.shared);
        match port {
            REG_FREQ_LOW => {
                for i in 0..VOICE_COUNT {
                    if self.voice_enabled(i) {
                        shared.voices[i].freq_low.store(value, Ordering::Relaxed);
                    }
                }
                if self.sample_table_enabled() {
                    // Register 0 feeds the FIFO; drop the byte when full
                    let _ = self.fifo_tx.try_send(value);
                }
            }
            REG_FREQ_HIGH => {
                for i in 0..VOICE_COUNT {
                    if self.voice_enabled(i) {
                        shared.voices[i].freq_high.store(value, Ordering::Relaxed);
                    }
                }
                if self.sample_table_enabled() {
                    shared.sample_divider.store(value, Ordering::Relaxed);
                }
            }
            REG_WAVEFORM => {
                for i in 0..VOICE_COUNT {
                    if self.voice_enabled(i) {
                        shared.voices[i].wave.store(value & 0x3, Ordering::Relaxed);
                        shared.voices[i].duty.store(value >> WAVEFORM_DUTY_SHIFT, Ordering::Relaxed);
                    }
                }
                // Register 2 of the sample voice is its format configuration
                if self.sample_table_enabled() {
                    shared.sample_config.store(value & 0x7, Ordering::Relaxed);
                }
            }
            REG_VOICE_VOL => {
                for i in 0..VOICE_COUNT {
                    if self.voice_enabled(i) {
                        shared.voices[i].volume_steps.store(value, Ordering::Relaxed);
                    }
                }
            }
            REG_MST_LEFT => shared.left_voices.store(value, Ordering::Relaxed),
            REG_MST_RIGHT => shared.right_voices.store(value, Ordering::Relaxed),
            REG_MST_HOLD => {
                shared.hold_voices.store(value, Ordering::Relaxed);
                for i in 0..VOICE_COUNT {
                    shared.voices[i].hold.store((value >> i) & 1, Ordering::Relaxed);
                }
            }
            REG_MST_VOL => shared.master_volume.store(value, Ordering::Relaxed),
            REG_MST_ENA => shared.enabled_voices.store(value, Ordering::Relaxed),
            _ => {}
        }
    }

    /// Build the source feeding the host audio stream; call once at stream
    /// creation.
    pub fn take_source(&mut self) -> Option<SoundSource> {
        let rx = self.pending_rx.take()?;
        Some(SoundSource {
            shared: Arc::clone(&self.shared),
            fifo_rx: rx,
            phases: [0; VOICE_COUNT],
            current_sample: 0,
            have_sample: false,
            baud_count: 0,
            queued_right: None,
        })
    }
}

/// rodio source mixing the five voices to interleaved stereo.
pub struct SoundSource {
    shared: Arc<SoundShared>,
    fifo_rx: Receiver<u8>,
    phases: [u32; VOICE_COUNT],
    current_sample: i16,
    have_sample: bool,
    baud_count: u32,
    queued_right: Option<i16>,
}

impl SoundSource {
    /// Generate the next raw sample of one synthesised voice.
    fn generate_wave(&mut self, ch: usize) -> i16 {
        let regs = &self.shared.voices[ch];
        let steps = (regs.freq_high.load(Ordering::Relaxed) as u32) << 8
            | regs.freq_low.load(Ordering::Relaxed) as u32;
        if steps == 0 {
            return 0;
        }

        let phase = self.phases[ch];
        let threshold = (regs.duty.load(Ordering::Relaxed) as u32) << 13;
        let sample: u32 = match regs.wave.load(Ordering::Relaxed) {
            WAVE_SQUARE => {
                if phase < threshold {
                    SAMPLE_MAX
                } else {
                    0
                }
            }
            WAVE_TRIANGLE => {
                let s = if phase > SAMPLE_MAX / 2 { SAMPLE_MAX - phase } else { phase };
                s * 2
            }
            WAVE_SAWTOOTH => phase,
            WAVE_NOISE => rand::thread_rng().gen_range(0..SAMPLE_MAX),
            _ => 0,
        };

        if regs.hold.load(Ordering::Relaxed) == 0 {
            self.phases[ch] += steps;
        }
        if self.phases[ch] > SAMPLE_MAX {
            self.phases[ch] = steps;
        }

        let volume = volume_steps_to_float(regs.volume_steps.load(Ordering::Relaxed), 2);
        ((sample as f32 * volume) as i32 - 0x8000) as i16
    }

    /// Next sample of the PCM voice, if one is available. The current
    /// sample repeats until the baud divider elapses.
    fn generate_sample(&mut self) -> Option<i16> {
        let hold = self.shared.hold_voices.load(Ordering::Relaxed) & 0x80 != 0;
        if hold {
            return None;
        }
        let config = self.shared.sample_config.load(Ordering::Relaxed);
        let is_u8 = config & 1 != 0;
        let is_signed = config & 4 != 0;
        let sample_bytes = if is_u8 { 1 } else { 2 };

        if !self.have_sample {
            if self.fifo_rx.len() < sample_bytes {
                return None;
            }
            let lo = self.fifo_rx.try_recv().ok()?;
            self.current_sample = if is_u8 {
                (((lo as i32) << 8) - 0x8000) as i16
            } else {
                let hi = self.fifo_rx.try_recv().ok()?;
                let raw = lo as u16 | (hi as u16) << 8;
                if is_signed {
                    raw as i16
                } else {
                    raw.wrapping_sub(0x8000) as i16
                }
            };
            self.have_sample = true;
        }

        let divider = self.shared.sample_divider.load(Ordering::Relaxed) as u32;
        if self.baud_count >= divider {
            self.baud_count = 0;
            self.have_sample = false;
        } else {
            self.baud_count += 1;
        }

        Some(self.current_sample)
    }

    /// Mix one stereo frame.
    fn next_frame(&mut self) -> (i16, i16) {
        let left_mask = self.shared.left_voices.load(Ordering::Relaxed);
        let right_mask = self.shared.right_voices.load(Ordering::Relaxed);
        let master = self.shared.master_volume.load(Ordering::Relaxed);

        let mut left: i32 = 0;
        let mut right: i32 = 0;
        for ch in 0..VOICE_COUNT {
            let sample = self.generate_wave(ch) as i32;
            if left_mask & (1 << ch) != 0 {
                left += sample;
            }
            if right_mask & (1 << ch) != 0 {
                right += sample;
            }
        }

        if let Some(sample) = self.generate_sample() {
            if left_mask & 0x80 != 0 {
                left += sample as i32;
            }
            if right_mask & 0x80 != 0 {
                right += sample as i32;
            }
        }

        // The high bit of each half of the master register mutes the channel
        let left_volume = if master & 0x40 != 0 { 0.0 } else { volume_steps_to_float(master, 2) };
        let right_volume = if master & 0x80 != 0 { 0.0 } else { volume_steps_to_float(master >> 2, 2) };

        let left = (left / VOICE_COUNT as i32) as f32 * left_volume;
        let right = (right / VOICE_COUNT as i32) as f32 * right_volume;
        (left as i16, right as i16)
    }
}

impl Iterator for SoundSource {
    type Item = i16;

    fn next(&mut self) -> Option<i16> {
        if let Some(right) = self.queued_right.take() {
            return Some(right);
        }
        let (left, right) = self.next_frame();
        self.queued_right = Some(right);
        Some(left)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_bit_7_selects_the_sample_voice() {
        let mut sound = Sound::new();
        // With the sample voice enabled, register 1 is the baud divider
        sound.write(REG_MST_ENA, 0x80);
        sound.write(REG_FREQ_HIGH, 5);
        assert_eq!(sound.read(REG_FREQ_HIGH), 5);

        // Register 0 feeds the FIFO: the status register drops its
        // "empty" bit
        assert_eq!(sound.read(REG_WAVEFORM) & 0x80, 0x80);
        sound.write(REG_FREQ_LOW, 0x42);
        assert_eq!(sound.read(REG_WAVEFORM) & 0x80, 0);
    }

    #[test]
    fn voice_writes_fan_out_by_enable_mask() {
        let mut sound = Sound::new();
        sound.write(REG_MST_ENA, 0b0101);
        sound.write(REG_FREQ_LOW, 0x12);
        for (i, voice) in sound.shared.voices.iter().enumerate() {
            let expected = if i % 2 == 0 { 0x12 } else { 0 };
            assert_eq!(voice.freq_low.load(Ordering::Relaxed), expected);
        }
    }

    #[test]
    fn pcm_bytes_reach_the_audio_source() {
        let mut sound = Sound::new();
        let mut source = sound.take_source().expect("source available once");
        sound.write(REG_MST_ENA, 0x80);
        // 8-bit unsigned samples, routed left, full volume
        sound.write(REG_WAVEFORM, 0x01);
        sound.write(REG_MST_LEFT, 0x80);
        sound.write(REG_MST_VOL, 0x00);
        sound.write(REG_FREQ_LOW, 0xFF);

        let left = source.next().expect("stream is endless");
        let _right = source.next();
        assert!(left > 0);
        assert!(sound.take_source().is_none());
    }
}

impl Source for SoundSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        2
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}
