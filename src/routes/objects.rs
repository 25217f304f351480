//! Object routes: declarative queries, hierarchy reads, and CRUD.

use crate::handlers::objects::{
    create_object, delete_object, get_deep_object, get_object, get_tree, query_grouped,
    query_objects, update_object,
};
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn object_routes(state: AppState) -> Router {
    Router::new()
        .route("/objects/query", post(query_objects))
        .route("/objects/query/grouped", post(query_grouped))
        .route("/objects/:model/tree", get(get_tree))
        .route("/objects/:model", post(create_object))
        .route(
            "/objects/:model/:id",
            get(get_object).patch(update_object).delete(delete_object),
        )
        .route("/objects/:model/:id/deep", get(get_deep_object))
        .with_state(state)
}
