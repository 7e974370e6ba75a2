//! User side of the long-string protocol: sentinels, chunk sources and reassembly.

use std::fmt;

use serde::Serialize;

pub const ERR_BAD_CHUNK_IDX: i32 = -1;
pub const ERR_BAD_PROBE_READ: i32 = -2;
pub const ERR_LENGTH: i32 = -3;

/// Why a long-string payload did not make it across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransferError {
    BadChunkIndex,
    BadProbeRead,
    LengthMismatch,
    Unknown(i32),
}

impl TransferError {
    /// Map a negative byte count to its failure, `None` for valid lengths.
    pub fn from_sentinel(value: i32) -> Option<Self> {
        match value {
            v if v >= 0 => None,
            ERR_BAD_CHUNK_IDX => Some(TransferError::BadChunkIndex),
            ERR_BAD_PROBE_READ => Some(TransferError::BadProbeRead),
            ERR_LENGTH => Some(TransferError::LengthMismatch),
            v => Some(TransferError::Unknown(v)),
        }
    }

    pub fn sentinel(&self) -> i32 {
        match self {
            TransferError::BadChunkIndex => ERR_BAD_CHUNK_IDX,
            TransferError::BadProbeRead => ERR_BAD_PROBE_READ,
            TransferError::LengthMismatch => ERR_LENGTH,
            TransferError::Unknown(v) => *v,
        }
    }

    /// Short name used as the key of the error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::BadChunkIndex => "BAD_CHUNK_IDX",
            TransferError::BadProbeRead => "BAD_PROBE_READ",
            TransferError::LengthMismatch => "LENGTH_FAULT",
            TransferError::Unknown(_) => "UNKNOWN_TRANSFER_ERROR",
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind(), self.sentinel())
    }
}

/// Read access to a chunk store.
pub trait ChunkSource {
    /// Contents of chunk `index`, `None` if the store has no such chunk.
    fn read_chunk(&self, index: u32) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGeometry {
    pub size: u32,
    pub count: u32,
}

impl ChunkGeometry {
    pub fn chunks_needed(&self, len: usize) -> usize {
        if self.size == 0 {
            return 0;
        }
        len.div_ceil(self.size as usize)
    }
}

/// Walk `ceil(len / size)` chunks starting at `start`, wrapping around the ring, and return
/// the first `len` bytes.
pub fn reassemble(
    source: &dyn ChunkSource,
    geometry: ChunkGeometry,
    start: u32,
    len: usize,
) -> Result<Vec<u8>, TransferError> {
    if geometry.count == 0 || start >= geometry.count {
        return Err(TransferError::BadChunkIndex);
    }
    let needed = geometry.chunks_needed(len);
    if needed > geometry.count as usize {
        return Err(TransferError::LengthMismatch);
    }

    let mut payload = Vec::with_capacity(len);
    for i in 0..needed as u32 {
        let index = (start + i) % geometry.count;
        let chunk = source
            .read_chunk(index)
            .ok_or(TransferError::BadChunkIndex)?;
        let want = (len - payload.len()).min(geometry.size as usize);
        if chunk.len() < want {
            return Err(TransferError::LengthMismatch);
        }
        payload.extend_from_slice(&chunk[..want]);
    }
    Ok(payload)
}

/// In-memory model of the kernel chunk ring, following the same reservation and copy rules as
/// the generated routine. Used to drive the decode path without a kernel.
#[derive(Debug)]
pub struct ChunkRing {
    geometry: ChunkGeometry,
    chunks: Vec<Vec<u8>>,
    next: u32,
}

impl ChunkRing {
    pub fn new(geometry: ChunkGeometry) -> Self {
        ChunkRing {
            geometry,
            chunks: vec![Vec::new(); geometry.count as usize],
            next: 0,
        }
    }

    pub fn geometry(&self) -> ChunkGeometry {
        self.geometry
    }

    /// Copy `payload` into the ring, returning `(byte count or sentinel, start chunk)`.
    pub fn write(&mut self, payload: &[u8]) -> (i32, u32) {
        let Ok(len) = i32::try_from(payload.len()) else {
            return (ERR_LENGTH, 0);
        };
        let needed = self.geometry.chunks_needed(payload.len());
        if needed > self.geometry.count as usize {
            return (ERR_LENGTH, 0);
        }
        let first = self.next % self.geometry.count;
        self.next = self.next.wrapping_add(needed as u32);

        let size = self.geometry.size as usize;
        for (i, piece) in payload.chunks(size).enumerate() {
            let index = (first as usize + i) % self.geometry.count as usize;
            let chunk = &mut self.chunks[index];
            chunk.resize(size, 0);
            chunk[..piece.len()].copy_from_slice(piece);
        }
        (len, first)
    }
}

impl ChunkSource for ChunkRing {
    fn read_chunk(&self, index: u32) -> Option<Vec<u8>> {
        let chunk = self.chunks.get(index as usize)?;
        if chunk.is_empty() {
            // Never written, the kernel array would hand back zeroes.
            return Some(vec![0; self.geometry.size as usize]);
        }
        Some(chunk.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cell::Cell;

    struct CountingSource<'a> {
        ring: &'a ChunkRing,
        reads: Cell<usize>,
    }

    impl ChunkSource for CountingSource<'_> {
        fn read_chunk(&self, index: u32) -> Option<Vec<u8>> {
            self.reads.set(self.reads.get() + 1);
            self.ring.read_chunk(index)
        }
    }

    #[test]
    fn test_sentinels() {
        assert_eq!(TransferError::from_sentinel(0), None);
        assert_eq!(TransferError::from_sentinel(17), None);
        assert_eq!(
            TransferError::from_sentinel(-1),
            Some(TransferError::BadChunkIndex)
        );
        assert_eq!(
            TransferError::from_sentinel(-2),
            Some(TransferError::BadProbeRead)
        );
        assert_eq!(
            TransferError::from_sentinel(-3),
            Some(TransferError::LengthMismatch)
        );
        assert_eq!(
            TransferError::from_sentinel(-9),
            Some(TransferError::Unknown(-9))
        );
        assert_eq!(TransferError::BadProbeRead.sentinel(), -2);
    }

    #[test]
    fn test_five_megabyte_payload() {
        let geometry = ChunkGeometry {
            size: 1_048_576,
            count: 64,
        };
        let mut ring = ChunkRing::new(geometry);
        let payload: Vec<u8> = (0..5_000_000u32).map(|i| (i % 251) as u8).collect();
        let (len, start) = ring.write(&payload);
        assert_eq!(len, 5_000_000);
        assert_eq!(start, 0);

        let source = CountingSource {
            ring: &ring,
            reads: Cell::new(0),
        };
        let out = reassemble(&source, geometry, start, len as usize).unwrap();
        assert_eq!(source.reads.get(), 5);
        assert_eq!(out.len(), 5_000_000);
        assert!(out == payload);
    }

    #[test]
    fn test_round_trip_with_wraparound() {
        let geometry = ChunkGeometry { size: 16, count: 8 };
        let mut ring = ChunkRing::new(geometry);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let len = rng.random_range(0..=(16 * 8));
            let payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            let (sz, start) = ring.write(&payload);
            assert_eq!(sz as usize, len);
            let out = reassemble(&ring, geometry, start, sz as usize).unwrap();
            assert_eq!(out, payload);
        }
    }

    #[test]
    fn test_oversized_payload() {
        let geometry = ChunkGeometry { size: 4, count: 2 };
        let mut ring = ChunkRing::new(geometry);
        assert_eq!(ring.write(&[0u8; 9]).0, ERR_LENGTH);
        assert_eq!(
            reassemble(&ring, geometry, 0, 9),
            Err(TransferError::LengthMismatch)
        );
    }

    #[test]
    fn test_bad_start() {
        let geometry = ChunkGeometry { size: 4, count: 2 };
        let ring = ChunkRing::new(geometry);
        assert_eq!(
            reassemble(&ring, geometry, 2, 1),
            Err(TransferError::BadChunkIndex)
        );
    }

    #[test]
    fn test_empty_payload() {
        let geometry = ChunkGeometry { size: 4, count: 2 };
        let mut ring = ChunkRing::new(geometry);
        let (sz, start) = ring.write(&[]);
        assert_eq!(sz, 0);
        assert_eq!(reassemble(&ring, geometry, start, 0).unwrap(), Vec::<u8>::new());
    }
}
