//! Radix-tree request router.
//!
//! One tree per HTTP method, O(path-length) lookup. Build it once at startup
//! and pass it to [`Server::serve`](crate::Server::serve).

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use matchit::Router as MatchitRouter;

use crate::handler::{BoxedHandler, Handler};

/// A matched route.
pub(crate) struct Route {
    pub(crate) handler: BoxedHandler,
    pub(crate) params: HashMap<String, String>,
    /// Counted by the shutdown coordinator. Probes are not.
    pub(crate) tracked: bool,
}

#[derive(Clone)]
struct Entry {
    handler: BoxedHandler,
    tracked: bool,
}

/// The application router.
pub struct Router {
    routes: HashMap<Method, MatchitRouter<Entry>>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: HashMap::new() }
    }

    /// Register a handler for a method + path pair. Returns `self` for chaining.
    ///
    /// Path parameters use `{name}` syntax:
    ///
    /// ```rust,no_run
    /// # use quiesce::{FailureRecord, Request, Response, Router};
    /// # use http::Method;
    /// # async fn get_user(_: Request) -> Result<Response, FailureRecord> { Ok(Response::text("")) }
    /// # async fn create_user(_: Request) -> Response { Response::text("") }
    /// Router::new()
    ///     .on(Method::GET,  "/users/{id}", get_user)
    ///     .on(Method::POST, "/users",      create_user);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a valid route or conflicts with one already
    /// registered for `method`. Routes are fixed at startup.
    pub fn on(self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.add(method, path, handler, true)
    }

    /// Register a `GET` health probe.
    ///
    /// Probes skip the in-flight count: they answer while the server drains
    /// and never hold the drain open.
    pub fn probe(self, path: &str, handler: impl Handler) -> Self {
        self.add(Method::GET, path, handler, false)
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::GET, path, handler)
    }

    pub fn post(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::POST, path, handler)
    }

    pub fn put(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::PUT, path, handler)
    }

    pub fn delete(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::DELETE, path, handler)
    }

    fn add(mut self, method: Method, path: &str, handler: impl Handler, tracked: bool) -> Self {
        let entry = Entry { handler: handler.into_boxed_handler(), tracked };
        self.routes
            .entry(method)
            .or_default()
            .insert(path, entry)
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
        self
    }

    pub(crate) fn lookup(&self, method: &Method, path: &str) -> Option<Route> {
        let tree = self.routes.get(method)?;
        let matched = tree.at(path).ok()?;
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some(Route {
            handler: Arc::clone(&matched.value.handler),
            params,
            tracked: matched.value.tracked,
        })
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Request, Response};

    async fn show(req: Request) -> Response {
        Response::text(req.param("id").unwrap_or_default().to_owned())
    }

    #[test]
    fn lookup_extracts_params() {
        let router = Router::new().get("/users/{id}", show);

        let route = router.lookup(&Method::GET, "/users/7").unwrap();
        assert_eq!(route.params.get("id").map(String::as_str), Some("7"));
        assert!(route.tracked);
    }

    #[test]
    fn probes_are_untracked_gets() {
        let router = Router::new().probe("/healthz", show);

        assert!(!router.lookup(&Method::GET, "/healthz").unwrap().tracked);
        assert!(router.lookup(&Method::POST, "/healthz").is_none());
    }

    #[test]
    fn lookup_is_per_method() {
        let router = Router::new().get("/users/{id}", show);

        assert!(router.lookup(&Method::POST, "/users/7").is_none());
        assert!(router.lookup(&Method::GET, "/teams/7").is_none());
    }

    #[test]
    #[should_panic(expected = "invalid route")]
    fn conflicting_routes_panic() {
        let _router = Router::new().get("/a/{x}", show).get("/a/{y}", show);
    }
}
