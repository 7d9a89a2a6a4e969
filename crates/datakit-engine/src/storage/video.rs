//! Video shard codec seam.
//!
//! Real video codecs live outside the compiler. The writer only needs to
//! append frames and get bytes back; the reader only needs a frame range.
//! [`RawFrameCodec`] is the built-in container: uncompressed `uint8`
//! frames, each prefixed with its shape.

use datakit_types::tensor::{DType, Tensor, TensorData};

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("not a video frame: {0}")]
    NotAFrame(String),
    #[error("corrupt video container: {0}")]
    Corrupt(String),
    #[error("frames {start}..{end} requested but the container holds {available}")]
    OutOfRange { start: u64, end: u64, available: u64 },
}

/// Appends frames for one video shard.
pub trait FrameEncoder: Send {
    fn push_frame(&mut self, frame: &Tensor) -> Result<(), VideoError>;
    fn frame_count(&self) -> u64;
    fn finish(self: Box<Self>) -> Result<Vec<u8>, VideoError>;
}

/// Decodes a frame range from one video shard.
pub trait FrameDecoder: Send + Sync {
    fn decode_range(&self, bytes: &[u8], start: u64, count: u64) -> Result<Vec<Tensor>, VideoError>;
}

/// A codec pairs an encoder factory with its decoder.
pub trait VideoCodec: Send + Sync {
    fn name(&self) -> &'static str;
    fn extension(&self) -> &'static str;
    fn encoder(&self) -> Box<dyn FrameEncoder>;
    fn decoder(&self) -> &dyn FrameDecoder;
}

/// `uint8` tensors of rank 2 (HW) or 3 (HWC) are stored as video.
#[must_use]
pub fn is_video_frame(tensor: &Tensor) -> bool {
    tensor.dtype() == DType::Uint8 && matches!(tensor.shape.len(), 2 | 3)
}

const MAGIC: &[u8; 4] = b"DKRV";
const VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct RawFrameCodec;

impl VideoCodec for RawFrameCodec {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn extension(&self) -> &'static str {
        "rawv"
    }

    fn encoder(&self) -> Box<dyn FrameEncoder> {
        let mut buf = Vec::with_capacity(MAGIC.len() + 1);
        buf.extend_from_slice(MAGIC);
        buf.push(VERSION);
        Box::new(RawEncoder { buf, frames: 0 })
    }

    fn decoder(&self) -> &dyn FrameDecoder {
        self
    }
}

struct RawEncoder {
    buf: Vec<u8>,
    frames: u64,
}

impl FrameEncoder for RawEncoder {
    fn push_frame(&mut self, frame: &Tensor) -> Result<(), VideoError> {
        let TensorData::Uint8(pixels) = &frame.data else {
            return Err(VideoError::NotAFrame(format!("dtype {}", frame.dtype())));
        };
        if !is_video_frame(frame) {
            return Err(VideoError::NotAFrame(format!("shape {:?}", frame.shape)));
        }
        // Rank is bounded to 2 or 3 above.
        #[allow(clippy::cast_possible_truncation)]
        let rank = frame.shape.len() as u8;
        self.buf.push(rank);
        for dim in &frame.shape {
            let dim = u32::try_from(*dim)
                .map_err(|_| VideoError::NotAFrame(format!("dimension {dim} too large")))?;
            self.buf.extend_from_slice(&dim.to_le_bytes());
        }
        self.buf.extend_from_slice(pixels);
        self.frames += 1;
        Ok(())
    }

    fn frame_count(&self) -> u64 {
        self.frames
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>, VideoError> {
        Ok(self.buf)
    }
}

impl FrameDecoder for RawFrameCodec {
    fn decode_range(&self, bytes: &[u8], start: u64, count: u64) -> Result<Vec<Tensor>, VideoError> {
        let header = MAGIC.len() + 1;
        if bytes.len() < header || &bytes[..MAGIC.len()] != MAGIC {
            return Err(VideoError::Corrupt("bad magic".into()));
        }
        if bytes[MAGIC.len()] != VERSION {
            return Err(VideoError::Corrupt(format!("unsupported version {}", bytes[MAGIC.len()])));
        }

        let end = start + count;
        let mut out = Vec::new();
        let mut pos = header;
        let mut index = 0u64;
        while index < end {
            if pos >= bytes.len() {
                return Err(VideoError::OutOfRange { start, end, available: index });
            }
            let ndim = usize::from(bytes[pos]);
            pos += 1;
            let mut shape = Vec::with_capacity(ndim);
            for _ in 0..ndim {
                let raw: [u8; 4] = bytes
                    .get(pos..pos + 4)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| VideoError::Corrupt(format!("truncated header of frame {index}")))?;
                shape.push(u32::from_le_bytes(raw) as usize);
                pos += 4;
            }
            let len = shape.iter().product::<usize>();
            let pixels = bytes
                .get(pos..pos + len)
                .ok_or_else(|| VideoError::Corrupt(format!("truncated pixels of frame {index}")))?;
            pos += len;
            if index >= start {
                let frame = Tensor::new(shape, TensorData::Uint8(pixels.to_vec()))
                    .map_err(|e| VideoError::Corrupt(e.to_string()))?;
                out.push(frame);
            }
            index += 1;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: u8) -> Tensor {
        Tensor::image(2, 2, 3, vec![value; 12]).unwrap()
    }

    fn encode(frames: &[Tensor]) -> Vec<u8> {
        let mut encoder = RawFrameCodec.encoder();
        for f in frames {
            encoder.push_frame(f).unwrap();
        }
        assert_eq!(encoder.frame_count(), frames.len() as u64);
        encoder.finish().unwrap()
    }

    #[test]
    fn test_decode_range() {
        let frames: Vec<Tensor> = (0..5).map(frame).collect();
        let bytes = encode(&frames);
        let decoded = RawFrameCodec.decoder().decode_range(&bytes, 1, 3).unwrap();
        assert_eq!(decoded, frames[1..4].to_vec());
    }

    #[test]
    fn test_grayscale_frames() {
        let gray = Tensor::new(vec![2, 3], TensorData::Uint8(vec![7; 6])).unwrap();
        let bytes = encode(&[gray.clone()]);
        assert_eq!(RawFrameCodec.decoder().decode_range(&bytes, 0, 1).unwrap(), vec![gray]);
    }

    #[test]
    fn test_out_of_range() {
        let bytes = encode(&[frame(1)]);
        let err = RawFrameCodec.decoder().decode_range(&bytes, 0, 2).unwrap_err();
        assert!(matches!(err, VideoError::OutOfRange { available: 1, .. }));
    }

    #[test]
    fn test_rejects_non_frames() {
        let mut encoder = RawFrameCodec.encoder();
        assert!(encoder.push_frame(&Tensor::vector_f32(vec![1.0])).is_err());
        assert!(encoder
            .push_frame(&Tensor::new(vec![4], TensorData::Uint8(vec![0; 4])).unwrap())
            .is_err());
    }

    #[test]
    fn test_corrupt_container() {
        assert!(RawFrameCodec.decoder().decode_range(b"nope", 0, 1).is_err());
        let mut bytes = encode(&[frame(3)]);
        bytes.truncate(bytes.len() - 1);
        assert!(RawFrameCodec.decoder().decode_range(&bytes, 0, 1).is_err());
    }
}
