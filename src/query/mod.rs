//! Query resolution engine: declarative filter/group/reference/sort
//! specifications compiled to parameterized SQL, plus hierarchical
//! reconstruction of reference edges.

pub mod builder;
pub mod engine;
pub mod expr;
pub mod external;
pub mod tree;
pub mod types;

pub use engine::QueryEngine;
pub use external::{ExternalQueryService, PoolRegistry};
pub use tree::{build_full_tree, build_hierarchy_in_values, EdgeRow};
pub use types::*;

use crate::error::AppError;
use crate::model::Model;
use async_trait::async_trait;

/// The seam between callers and the two storage paths. Callers never know
/// which backend served the request.
#[async_trait]
pub trait ObjectQuerier: Send + Sync {
    async fn list_objects(
        &self,
        model: &Model,
        req: &QueryRequest,
    ) -> Result<ObjectPage, AppError>;

    async fn find_grouped_objects(
        &self,
        model: &Model,
        req: &QueryRequest,
    ) -> Result<GroupedResult, AppError>;
}
