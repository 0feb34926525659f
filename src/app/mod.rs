//! Application layer: the ingress consumer and the stats API

mod dispatcher;
mod stats_api;

pub use dispatcher::{start, Dispatcher};
pub use stats_api::{build_api_router, start_api_server};
