//! Lock-free SPSC ring buffers for audio samples, plus frame assembly.
//!
//! Uses `ringbuf::HeapRb<f32>` which provides a wait-free `push_slice`
//! safe to call from a real-time audio callback. Two rings exist per session:
//! capture (device callback → framing thread) and sequential playback
//! (session thread → output callback).

pub mod frame;
pub mod framer;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Type alias for the producer half, held by the writing thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Type alias for the consumer half, held by the reading thread.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Capture ring capacity: 2^20 samples ≈ 21.8 s at 48 kHz.
/// The framing thread drains every few milliseconds, so this only absorbs stalls.
pub const CAPTURE_RING_CAPACITY: usize = 1 << 20;

/// Playback ring capacity: 2^23 samples ≈ 174 s at 48 kHz.
/// Remote audio arrives faster than real time and must never be dropped for
/// lack of space, so this is sized for a long reply.
pub const PLAYBACK_RING_CAPACITY: usize = 1 << 23;

/// Create the producer/consumer pair used between the capture callback and the
/// framing thread.
pub fn create_capture_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(CAPTURE_RING_CAPACITY).split()
}

/// Create the producer/consumer pair used between the session thread and the
/// sequential output callback.
pub fn create_playback_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(PLAYBACK_RING_CAPACITY).split()
}
