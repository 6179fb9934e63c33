//! HTTP API router.
//!
//! Three routes: `/metrics` (Prometheus text exposition), `/graphql`
//! (GET/POST GraphQL endpoint) and `/` (the GraphiQL UI).

use super::exposition;
use super::graphql::ApiSchema;
use crate::store::Store;
use futures_util::future::{BoxFuture, FutureExt as _};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt as _, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode, header};
use std::convert::Infallible;
use std::sync::Arc;

/// Body type used in API responses.
pub type ApiBody = BoxBody<Bytes, crate::Error>;

#[derive(Clone)]
pub(super) struct Router {
    store: Arc<Store>,
    schema: ApiSchema,
}

impl Router {
    pub(super) fn new(store: Arc<Store>, schema: ApiSchema) -> Self {
        Self { store, schema }
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Response<ApiBody> {
        let path = req.uri().path().to_owned();

        match (req.method().clone(), path.as_str()) {
            (Method::GET, "/metrics") => into_response(
                "text/plain; version=0.0.4; charset=utf-8",
                exposition::render(&self.store),
            ),
            (Method::GET, "/") => into_response(
                "text/html; charset=utf-8",
                Ok(async_graphql::http::GraphiQLSource::build()
                    .endpoint("/graphql")
                    .finish()),
            ),
            (Method::GET, "/graphql") => self.handle_graphql_get(&req).await,
            (Method::POST, "/graphql") => self.handle_graphql_post(req).await,
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(BoxBody::new(Empty::new().map_err(Into::into)))
                .unwrap(),
        }
    }

    async fn handle_graphql_get(&self, req: &Request<Incoming>) -> Response<ApiBody> {
        let query = req.uri().query().unwrap_or("");

        let request = match async_graphql::http::parse_query_string(query) {
            Ok(request) => request,
            Err(err) => return bad_request(format!("invalid GraphQL query string: {err}")),
        };

        self.execute(request).await
    }

    async fn handle_graphql_post(&self, req: Request<Incoming>) -> Response<ApiBody> {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => return bad_request(format!("cannot read request body: {err}")),
        };

        let request: async_graphql::Request = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => return bad_request(format!("invalid GraphQL request: {err}")),
        };

        self.execute(request).await
    }

    async fn execute(&self, request: async_graphql::Request) -> Response<ApiBody> {
        let response = self.schema.execute(request).await;

        match serde_json::to_vec(&response) {
            Ok(json) => Response::builder()
                .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
                .body(BoxBody::new(Full::from(json).map_err(Into::into)))
                .unwrap(),
            Err(err) => Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(BoxBody::new(
                    Full::from(err.to_string()).map_err(Into::into),
                ))
                .unwrap(),
        }
    }
}

impl Service<Request<Incoming>> for Router {
    type Response = Response<ApiBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let router = self.clone();

        async move { Ok(router.handle_request(req).await) }.boxed()
    }
}

fn into_response(
    content_type: &str,
    res: crate::Result<impl Into<Full<Bytes>>>,
) -> Response<ApiBody> {
    match res {
        Ok(data) => Response::builder()
            .header(header::CONTENT_TYPE, content_type)
            .body(BoxBody::new(data.into().map_err(Into::into)))
            .unwrap(),
        Err(err) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(BoxBody::new(
                Full::from(err.to_string()).map_err(Into::into),
            ))
            .unwrap(),
    }
}

fn bad_request(message: String) -> Response<ApiBody> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(BoxBody::new(Full::from(message).map_err(Into::into)))
        .unwrap()
}
