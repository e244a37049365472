//! Chunked bump allocator for per-session data
//!
//! An SMTP session keeps its envelope (sender, recipient table and the
//! recipient strings) in an [`Arena`]. Allocation hands out [`Region`]
//! handles instead of references so the session can keep them next to the
//! arena without borrowing it. There is no per-allocation free: the whole
//! arena is reset when the envelope is reset and dropped with the session.

/// Default chunk size in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Alignment of every allocation handed out from a shared chunk
pub const ALIGNMENT: usize = 8;

/// Handle to bytes allocated from an [`Arena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    chunk: u32,
    offset: u32,
    len: u32,
}

impl Region {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunk(&self) -> usize {
        self.chunk as usize
    }

    pub fn offset(&self) -> usize {
        self.offset as usize
    }
}

/// The arena's byte budget is spent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaExhausted;

struct Chunk {
    data: Box<[u8]>,
    used: usize,
}

impl Chunk {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            used: 0,
        }
    }
}

pub struct Arena {
    chunks: Vec<Chunk>,
    current: usize,
    chunk_size: usize,
    limit: usize,
    reserved: usize,
}

impl Arena {
    /// Create an arena with the default chunk size and no practical limit
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_CHUNK_SIZE, usize::MAX)
    }

    /// Create an arena that never holds more than `limit` bytes of chunks
    pub fn with_limit(chunk_size: usize, limit: usize) -> Self {
        Self {
            chunks: Vec::new(),
            current: 0,
            chunk_size: chunk_size.max(ALIGNMENT),
            limit,
            reserved: 0,
        }
    }

    /// Bytes of chunk storage currently held
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Bump-allocate `size` bytes
    ///
    /// Requests larger than the chunk size get a dedicated chunk of exactly
    /// `size` bytes which does not become the current chunk. Returns `None`
    /// once the byte budget would be exceeded.
    pub fn allocate(&mut self, size: usize) -> Option<Region> {
        if size > self.chunk_size {
            let index = self.push_chunk(size)?;
            self.chunks[index].used = size;
            return Some(Region {
                chunk: index as u32,
                offset: 0,
                len: size as u32,
            });
        }

        if let Some(region) = self.bump(self.current, size) {
            return Some(region);
        }

        let index = self.push_chunk(self.chunk_size)?;
        self.current = index;
        self.bump(index, size)
    }

    /// Allocate `size` bytes that read as zero
    pub fn allocate_zeroed(&mut self, size: usize) -> Option<Region> {
        let region = self.allocate(size)?;
        // Chunks are recycled by reset(), so stale bytes are possible
        self.bytes_mut(region).fill(0);
        Some(region)
    }

    /// Copy `data` into the arena
    pub fn alloc_bytes(&mut self, data: &[u8]) -> Option<Region> {
        let region = self.allocate(data.len())?;
        self.bytes_mut(region).copy_from_slice(data);
        Some(region)
    }

    /// Copy a string into the arena
    pub fn alloc_str(&mut self, s: &str) -> Option<Region> {
        self.alloc_bytes(s.as_bytes())
    }

    pub fn bytes(&self, region: Region) -> &[u8] {
        let chunk = &self.chunks[region.chunk()];
        &chunk.data[region.offset()..region.offset() + region.len()]
    }

    pub fn bytes_mut(&mut self, region: Region) -> &mut [u8] {
        let chunk = &mut self.chunks[region.chunk()];
        &mut chunk.data[region.offset()..region.offset() + region.len()]
    }

    /// View a region written by [`Arena::alloc_str`]
    pub fn str(&self, region: Region) -> &str {
        std::str::from_utf8(self.bytes(region)).unwrap_or_default()
    }

    /// Release every allocation at once, keeping the first chunk for reuse
    pub fn reset(&mut self) {
        self.chunks.truncate(1);
        if let Some(first) = self.chunks.first_mut() {
            first.used = 0;
        }
        self.current = 0;
        self.reserved = self.chunks.iter().map(|c| c.data.len()).sum();
    }

    fn bump(&mut self, index: usize, size: usize) -> Option<Region> {
        let chunk = self.chunks.get_mut(index)?;
        let offset = align_up(chunk.used);
        if offset > chunk.data.len() || chunk.data.len() - offset < size {
            return None;
        }
        chunk.used = offset + size;
        Some(Region {
            chunk: index as u32,
            offset: offset as u32,
            len: size as u32,
        })
    }

    fn push_chunk(&mut self, capacity: usize) -> Option<usize> {
        if capacity > self.limit.saturating_sub(self.reserved) {
            return None;
        }
        self.chunks.push(Chunk::new(capacity));
        self.reserved += capacity;
        Some(self.chunks.len() - 1)
    }

    #[cfg(test)]
    fn current_remaining(&self) -> usize {
        self.chunks
            .get(self.current)
            .map_or(0, |c| c.data.len() - c.used)
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

fn align_up(n: usize) -> usize {
    (n + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

const ENTRY_SIZE: usize = 12;

/// Growable list of regions whose table itself lives in the arena
///
/// The table starts with a fixed capacity and doubles when full; the old
/// table stays allocated until the arena is reset.
#[derive(Debug, Clone, Default)]
pub struct RegionList {
    table: Option<Region>,
    len: usize,
    capacity: usize,
}

impl RegionList {
    pub const INITIAL_CAPACITY: usize = 10;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forget every entry; call after resetting the arena
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn push(&mut self, arena: &mut Arena, item: Region) -> Result<(), ArenaExhausted> {
        if self.len == self.capacity {
            self.grow(arena)?;
        }
        let table = self.table.ok_or(ArenaExhausted)?;
        let start = self.len * ENTRY_SIZE;
        let slot = &mut arena.bytes_mut(table)[start..start + ENTRY_SIZE];
        slot[0..4].copy_from_slice(&item.chunk.to_le_bytes());
        slot[4..8].copy_from_slice(&item.offset.to_le_bytes());
        slot[8..12].copy_from_slice(&item.len.to_le_bytes());
        self.len += 1;
        Ok(())
    }

    pub fn get(&self, arena: &Arena, index: usize) -> Option<Region> {
        if index >= self.len {
            return None;
        }
        let table = self.table?;
        let start = index * ENTRY_SIZE;
        let slot = &arena.bytes(table)[start..start + ENTRY_SIZE];
        let field = |at: usize| u32::from_le_bytes([slot[at], slot[at + 1], slot[at + 2], slot[at + 3]]);
        Some(Region {
            chunk: field(0),
            offset: field(4),
            len: field(8),
        })
    }

    pub fn iter<'a>(&'a self, arena: &'a Arena) -> impl Iterator<Item = Region> + 'a {
        (0..self.len).filter_map(move |i| self.get(arena, i))
    }

    fn grow(&mut self, arena: &mut Arena) -> Result<(), ArenaExhausted> {
        let capacity = if self.capacity == 0 {
            Self::INITIAL_CAPACITY
        } else {
            self.capacity * 2
        };
        let table = arena
            .allocate_zeroed(capacity * ENTRY_SIZE)
            .ok_or(ArenaExhausted)?;
        if let Some(old) = self.table {
            let used = self.len * ENTRY_SIZE;
            let entries = arena.bytes(old)[..used].to_vec();
            arena.bytes_mut(table)[..used].copy_from_slice(&entries);
        }
        self.table = Some(table);
        self.capacity = capacity;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_allocations_are_aligned() {
        let mut arena = Arena::new();
        let a = arena.allocate(3).unwrap();
        let b = arena.allocate(5).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 8);
        assert_eq!(a.chunk(), b.chunk());
    }

    #[test]
    fn test_oversized_allocation_keeps_current_chunk() {
        let mut arena = Arena::with_limit(64, usize::MAX);
        let small = arena.allocate(16).unwrap();
        let big = arena.allocate(200).unwrap();
        assert_ne!(small.chunk(), big.chunk());
        assert_eq!(big.len(), 200);

        let next = arena.allocate(16).unwrap();
        assert_eq!(next.chunk(), small.chunk());
        assert_eq!(arena.current_remaining(), 64 - 32);
    }

    #[test]
    fn test_new_chunk_becomes_current() {
        let mut arena = Arena::with_limit(32, usize::MAX);
        arena.allocate(30).unwrap();
        let second = arena.allocate(8).unwrap();
        assert_eq!(second.chunk(), 1);
        let third = arena.allocate(8).unwrap();
        assert_eq!(third.chunk(), 1);
        assert_eq!(arena.chunk_count(), 2);
    }

    #[test]
    fn test_limit_exhaustion_returns_none() {
        let mut arena = Arena::with_limit(64, 128);
        assert!(arena.allocate(64).is_some());
        assert!(arena.allocate(64).is_some());
        assert!(arena.allocate(1).is_none());
        assert!(arena.allocate(500).is_none());
    }

    #[test]
    fn test_strings_round_trip() {
        let mut arena = Arena::new();
        let a = arena.alloc_str("x@y").unwrap();
        let b = arena.alloc_str("a@b").unwrap();
        assert_eq!(arena.str(a), "x@y");
        assert_eq!(arena.str(b), "a@b");
    }

    #[test]
    fn test_reset_recycles_first_chunk() {
        let mut arena = Arena::with_limit(64, usize::MAX);
        arena.allocate(60).unwrap();
        arena.allocate(60).unwrap();
        assert_eq!(arena.chunk_count(), 2);

        arena.reset();
        assert_eq!(arena.chunk_count(), 1);
        assert_eq!(arena.reserved(), 64);

        let zeroed = arena.allocate_zeroed(16).unwrap();
        assert!(arena.bytes(zeroed).iter().all(|b| *b == 0));
    }

    #[test]
    fn test_region_list_doubles() {
        let mut arena = Arena::new();
        let mut list = RegionList::new();
        let mut expected = Vec::new();
        for i in 0..25 {
            let r = arena.alloc_str(&format!("rcpt{}@example.com", i)).unwrap();
            list.push(&mut arena, r).unwrap();
            expected.push(r);
        }
        assert_eq!(list.len(), 25);
        assert_eq!(list.capacity(), 40);
        let got: Vec<Region> = list.iter(&arena).collect();
        assert_eq!(got, expected);
        assert_eq!(arena.str(got[24]), "rcpt24@example.com");
    }

    #[test]
    fn test_region_list_reports_exhaustion() {
        let mut arena = Arena::with_limit(128, 128);
        let mut list = RegionList::new();
        let item = arena.alloc_str("a@b").unwrap();
        for _ in 0..RegionList::INITIAL_CAPACITY {
            list.push(&mut arena, item).unwrap();
        }
        // Doubling needs a 240 byte table, which the budget cannot cover
        assert_eq!(list.push(&mut arena, item), Err(ArenaExhausted));
        assert_eq!(list.len(), RegionList::INITIAL_CAPACITY);
    }

    proptest! {
        #[test]
        fn prop_allocations_never_overlap(sizes in proptest::collection::vec(0usize..300, 1..80)) {
            let mut arena = Arena::with_limit(256, usize::MAX);
            let mut regions = Vec::new();
            for size in &sizes {
                let region = arena.allocate(*size).unwrap();
                prop_assert_eq!(region.len(), *size);
                regions.push(region);
            }

            let served: usize = regions.iter().map(|r| r.len()).sum();
            prop_assert!(served >= sizes.iter().sum::<usize>());

            for (i, a) in regions.iter().enumerate() {
                for b in regions.iter().skip(i + 1) {
                    if a.chunk() != b.chunk() || a.is_empty() || b.is_empty() {
                        continue;
                    }
                    let disjoint = a.offset() + a.len() <= b.offset()
                        || b.offset() + b.len() <= a.offset();
                    prop_assert!(disjoint, "{:?} overlaps {:?}", a, b);
                }
            }
        }
    }
}
