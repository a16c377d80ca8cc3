pub mod codec;
pub mod embeddings;
pub mod ingest;
pub mod rag;
pub mod store;

pub use codec::{decode_vector, encode_vector};
pub use embeddings::{create_embedder, HttpEmbeddingProvider, OllamaEmbeddingProvider};
pub use ingest::{ingest_samples, IngestReport};
pub use rag::VectorStore;
pub use store::SqliteVectorIndex;
