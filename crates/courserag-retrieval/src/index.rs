//! Exact nearest-neighbor vector index with a JSON side-table.
//!
//! Vectors live in one contiguous `f32` buffer and are scanned exhaustively
//! under squared Euclidean distance. The index persists as two artifacts:
//! a binary blob holding the vectors and a JSON object mapping each position
//! to its chunk content and metadata.

use std::collections::BTreeMap;
use std::path::Path;

use courserag_core::{ChunkRecord, CourseRagError, EmbeddedChunk, SearchResult};
use tracing::{debug, info, warn};

const MAGIC: &[u8; 4] = b"CRVI";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8 + 8;

/// A stored vector's position and its distance to a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Zero-based insertion position.
    pub position: usize,
    /// Squared Euclidean distance to the query.
    pub distance: f32,
}

/// Flat (brute-force) index over fixed-dimension vectors.
///
/// # Examples
///
/// ```
/// use courserag_retrieval::index::FlatIndex;
///
/// let index = FlatIndex::build(&[vec![0.0, 0.0], vec![3.0, 4.0]]).unwrap();
/// let hits = index.search(&[3.0, 4.0], 2).unwrap();
/// assert_eq!(hits[0].position, 1);
/// assert_eq!(hits[0].distance, 0.0);
/// assert_eq!(hits[1].distance, 25.0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    /// Build an index from vectors in position order.
    ///
    /// The dimension is taken from the first vector.
    ///
    /// # Errors
    ///
    /// Returns [`CourseRagError::DimensionMismatch`] if any vector differs in
    /// length from the first, and [`CourseRagError::Index`] if `vectors` is
    /// empty or the first vector has no components.
    pub fn build(vectors: &[Vec<f32>]) -> Result<Self, CourseRagError> {
        let dimension = match vectors.first() {
            Some(first) if !first.is_empty() => first.len(),
            Some(_) => {
                return Err(CourseRagError::Index(
                    "cannot build an index from zero-length vectors".into(),
                ))
            }
            None => {
                return Err(CourseRagError::Index(
                    "cannot build an index from an empty vector set".into(),
                ))
            }
        };

        let mut data = Vec::with_capacity(dimension * vectors.len());
        for (position, vector) in vectors.iter().enumerate() {
            if vector.len() != dimension {
                return Err(CourseRagError::DimensionMismatch {
                    expected: dimension,
                    found: vector.len(),
                    position,
                });
            }
            data.extend_from_slice(vector);
        }

        Ok(Self { dimension, data })
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.data.len() / self.dimension
    }

    /// Whether the index holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Dimension shared by every stored vector.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Stored vector at `position`, if any.
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// Return up to `k` nearest vectors, nearest first.
    ///
    /// Ties are broken by ascending position. A `k` larger than the index
    /// returns every vector.
    ///
    /// # Errors
    ///
    /// Returns [`CourseRagError::Index`] if `query` has the wrong dimension.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, CourseRagError> {
        if query.len() != self.dimension {
            return Err(CourseRagError::Index(format!(
                "query has dimension {}, index has dimension {}",
                query.len(),
                self.dimension
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut neighbors: Vec<Neighbor> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(position, stored)| Neighbor {
                position,
                distance: squared_l2(query, stored),
            })
            .collect();

        neighbors.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then(a.position.cmp(&b.position))
        });
        neighbors.truncate(k);
        Ok(neighbors)
    }

    /// Serialize to the binary blob format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dimension as u64).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for f in &self.data {
            bytes.extend_from_slice(&f.to_le_bytes());
        }
        bytes
    }

    /// Parse the binary blob format.
    ///
    /// # Errors
    ///
    /// Returns [`CourseRagError::Index`] if the header is wrong or the
    /// payload length disagrees with it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CourseRagError> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(CourseRagError::Index("not a vector index file".into()));
        }
        let version = read_u32(&bytes[4..8]);
        if version != FORMAT_VERSION {
            return Err(CourseRagError::Index(format!(
                "unsupported index format version {version}"
            )));
        }
        let dimension = read_u64(&bytes[8..16]) as usize;
        let count = read_u64(&bytes[16..24]) as usize;
        if dimension == 0 {
            return Err(CourseRagError::Index("index has zero dimension".into()));
        }

        let payload = &bytes[HEADER_LEN..];
        let expected = dimension
            .checked_mul(count)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| CourseRagError::Index("index header overflows".into()))?;
        if payload.len() != expected {
            return Err(CourseRagError::Index(format!(
                "index payload is {} bytes, header declares {expected}",
                payload.len()
            )));
        }

        Ok(Self {
            dimension,
            data: bytes_to_floats(payload),
        })
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

fn bytes_to_floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Position → chunk mapping persisted beside the vector blob.
///
/// Serializes as a JSON object keyed by stringified positions.
pub type SideTable = BTreeMap<usize, ChunkRecord>;

/// A vector index paired with its side-table, read-only once built or loaded.
///
/// Load it once per process and share it behind an `Arc`; searches take
/// `&self` and need no locking.
///
/// # Examples
///
/// ```
/// use courserag_core::{ChunkMetadata, ChunkRecord, EmbeddedChunk};
/// use courserag_retrieval::index::LoadedIndex;
///
/// let chunk = EmbeddedChunk {
///     chunk: ChunkRecord {
///         content: "Pandas reads CSV files.".into(),
///         metadata: ChunkMetadata {
///             source_url: None,
///             source_title: "Pandas".into(),
///             chunk_id: "pandas_chunk_0".into(),
///         },
///     },
///     embedding: vec![1.0, 0.0],
/// };
/// let index = LoadedIndex::build(vec![chunk]).unwrap();
/// let results = index.search(&[1.0, 0.0], 5).unwrap();
/// assert_eq!(results.len(), 1);
/// assert_eq!(results[0].metadata.chunk_id, "pandas_chunk_0");
/// ```
#[derive(Debug, Clone)]
pub struct LoadedIndex {
    index: FlatIndex,
    side_table: SideTable,
}

impl LoadedIndex {
    /// Build from embedded chunks; position `i` is the `i`-th chunk.
    ///
    /// # Errors
    ///
    /// Returns [`CourseRagError::DimensionMismatch`] or
    /// [`CourseRagError::Index`] as [`FlatIndex::build`] does.
    pub fn build(chunks: Vec<EmbeddedChunk>) -> Result<Self, CourseRagError> {
        let (vectors, records): (Vec<Vec<f32>>, Vec<ChunkRecord>) = chunks
            .into_iter()
            .map(|embedded| (embedded.embedding, embedded.chunk))
            .unzip();
        let index = FlatIndex::build(&vectors)?;
        let side_table = records.into_iter().enumerate().collect();
        Ok(Self { index, side_table })
    }

    /// Pair an index with an arbitrary side-table.
    pub fn from_parts(index: FlatIndex, side_table: SideTable) -> Self {
        Self { index, side_table }
    }

    /// The underlying vector index.
    pub fn index(&self) -> &FlatIndex {
        &self.index
    }

    /// The position → chunk mapping.
    pub fn side_table(&self) -> &SideTable {
        &self.side_table
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no vectors are stored.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Write the vector blob and the side-table, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`CourseRagError::Io`] or [`CourseRagError::Serialization`] if
    /// either artifact cannot be written.
    pub fn save(&self, index_path: &Path, mapping_path: &Path) -> Result<(), CourseRagError> {
        for path in [index_path, mapping_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(index_path, self.index.to_bytes())?;
        let mapping = serde_json::to_string_pretty(&self.side_table)?;
        std::fs::write(mapping_path, mapping)?;

        info!(
            vectors = self.index.len(),
            dimension = self.index.dimension(),
            index = %index_path.display(),
            mapping = %mapping_path.display(),
            "saved vector index"
        );
        Ok(())
    }

    /// Load both artifacts.
    ///
    /// # Errors
    ///
    /// Returns [`CourseRagError::Config`] if either artifact is missing (the
    /// build step has not run), [`CourseRagError::Index`] for a corrupt blob,
    /// and [`CourseRagError::Serialization`] for an unreadable side-table.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::path::Path;
    /// use std::sync::Arc;
    /// use courserag_retrieval::index::LoadedIndex;
    ///
    /// let index = Arc::new(
    ///     LoadedIndex::load(
    ///         Path::new("data/vector_index.bin"),
    ///         Path::new("data/index_to_chunk_map.json"),
    ///     )
    ///     .unwrap(),
    /// );
    /// ```
    pub fn load(index_path: &Path, mapping_path: &Path) -> Result<Self, CourseRagError> {
        for path in [index_path, mapping_path] {
            if !path.exists() {
                return Err(CourseRagError::Config(format!(
                    "index artifact {} not found; run `courserag build` first",
                    path.display()
                )));
            }
        }

        let index = FlatIndex::from_bytes(&std::fs::read(index_path)?)?;
        let side_table: SideTable = serde_json::from_str(&std::fs::read_to_string(mapping_path)?)?;

        if side_table.len() != index.len() {
            warn!(
                vectors = index.len(),
                entries = side_table.len(),
                "index and side-table sizes differ; unmatched results will be dropped"
            );
        }
        info!(
            vectors = index.len(),
            dimension = index.dimension(),
            "loaded vector index"
        );

        Ok(Self { index, side_table })
    }

    /// Search and resolve positions to chunks, nearest first.
    ///
    /// Positions with no side-table entry are dropped, so fewer than `k`
    /// results may come back.
    ///
    /// # Errors
    ///
    /// Returns [`CourseRagError::Index`] if `query` has the wrong dimension.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, CourseRagError> {
        let neighbors = self.index.search(query, k)?;
        Ok(neighbors
            .into_iter()
            .filter_map(|neighbor| match self.side_table.get(&neighbor.position) {
                Some(record) => Some(SearchResult {
                    content: record.content.clone(),
                    metadata: record.metadata.clone(),
                    distance: neighbor.distance,
                }),
                None => {
                    debug!(
                        position = neighbor.position,
                        "dropping result with no side-table entry"
                    );
                    None
                }
            })
            .collect())
    }
}
