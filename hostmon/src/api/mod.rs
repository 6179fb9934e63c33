//! Local HTTP API: Prometheus exposition, GraphQL and the GraphiQL UI.

pub mod exposition;
pub mod graphql;
pub mod server;

mod router;

pub use server::ApiServer;
