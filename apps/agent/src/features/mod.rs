pub mod admin;
pub mod callbacks_api;
pub mod console;
pub mod external;
pub mod health;
pub mod images;
pub mod introspection;
pub mod jobs;
pub mod labs;
pub mod links;
pub mod locks;
pub mod overlay;
pub mod plugin;

use axum::Router;

/// Merges every feature's router into the one service the process serves.
/// Each module owns its own route table and handler set; this just
/// concatenates them the way the server's overall surface is organized
/// around independent capability areas rather than one flat file.
pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(jobs::router())
        .merge(labs::router())
        .merge(links::router())
        .merge(external::router())
        .merge(overlay::router())
        .merge(locks::router())
        .merge(admin::router())
        .merge(callbacks_api::router())
        .merge(introspection::router())
        .merge(images::router())
        .merge(console::router())
        .merge(plugin::router())
}
