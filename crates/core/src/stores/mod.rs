pub mod neo4j;
pub mod pgvector;

pub use neo4j::{GraphSearchClient, Neo4jConfig};
pub use pgvector::{PgVectorManager, VectorSearchClient};
