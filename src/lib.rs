//! Metastudio: a metadata-driven entity platform. Models and views are data,
//! edited through a change-tracking studio, persisted to versioned _sys_*
//! tables, and served by a declarative query engine over an internal JSONB
//! object store or mapped external tables.

pub mod data;
pub mod error;
pub mod handlers;
pub mod model;
pub mod pg;
pub mod query;
pub mod response;
pub mod routes;
pub mod service;
pub mod state;
pub mod store;
pub mod studio;

pub use error::{AppError, ConfigError};
pub use model::{load_registry_from_pool, Model, ModelRegistry, View};
pub use query::{ExternalQueryService, ObjectQuerier, PoolRegistry, QueryEngine, QueryRequest};
pub use routes::api_router;
pub use service::ObjectService;
pub use state::AppState;
pub use store::{ensure_database_exists, ensure_sys_tables, save_studio_config, SaveRequest};
pub use studio::{ChangeDetector, StudioDataManager};
