//! Route table and the swappable router holding it.
//!
//! # Architecture
//!
//! A [`RouteTable`] is immutable once built. Lookups try exact paths first,
//! then the longest matching prefix. A path that matches but rejects the
//! method answers 405 rather than falling through to 404.
//!
//! [`MutableRouter`] holds the current table behind an `Arc`. The trigger
//! set builds a complete new table off the request path and swaps it in;
//! requests clone the `Arc` and keep using the table they started with.

use std::sync::Arc;

use arc_swap::ArcSwap;
use http::Method;

use crate::handler::FunctionHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
}

/// What a matched route does.
#[derive(Clone)]
pub enum Endpoint {
    /// Plain 200; router liveness and the default home page.
    Ok,
    /// Build version as JSON.
    Version,
    Function(Arc<FunctionHandler>),
}

#[derive(Clone)]
pub struct Route {
    pub path: PathMatch,
    /// `None` accepts any method.
    pub methods: Option<Vec<Method>>,
    /// `None` accepts any host.
    pub host: Option<String>,
    pub endpoint: Endpoint,
}

impl Route {
    fn accepts_host(&self, host: &str) -> bool {
        self.host.as_deref().is_none_or(|h| h.eq_ignore_ascii_case(host))
    }

    fn accepts_method(&self, method: &Method) -> bool {
        self.methods.as_ref().is_none_or(|m| m.contains(method))
    }
}

pub enum Lookup<'a> {
    Found(&'a Route),
    MethodNotAllowed,
    NotFound,
}

#[derive(Default, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, route: Route) {
        self.routes.push(route);
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn has_exact(&self, method: &Method, path: &str) -> bool {
        self.routes
            .iter()
            .any(|r| r.path == PathMatch::Exact(path.to_string()) && r.accepts_method(method))
    }

    /// `host` is the request's Host header without the port.
    pub fn lookup(&self, method: &Method, host: &str, path: &str) -> Lookup<'_> {
        let mut path_matched = false;

        let exact = self.routes.iter().filter(|r| {
            matches!(&r.path, PathMatch::Exact(p) if p == path) && r.accepts_host(host)
        });
        for route in exact {
            if route.accepts_method(method) {
                return Lookup::Found(route);
            }
            path_matched = true;
        }

        let mut best: Option<(&Route, usize)> = None;
        for route in &self.routes {
            let PathMatch::Prefix(prefix) = &route.path else { continue };
            if !path.starts_with(prefix.as_str()) || !route.accepts_host(host) {
                continue;
            }
            if !route.accepts_method(method) {
                path_matched = true;
                continue;
            }
            if best.is_none_or(|(_, len)| prefix.len() > len) {
                best = Some((route, prefix.len()));
            }
        }

        match best {
            Some((route, _)) => Lookup::Found(route),
            None if path_matched => Lookup::MethodNotAllowed,
            None => Lookup::NotFound,
        }
    }
}

/// Shared, atomically replaced route table.
#[derive(Default)]
pub struct MutableRouter {
    current: ArcSwap<RouteTable>,
}

impl MutableRouter {
    pub fn new(table: RouteTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(table),
        }
    }

    pub fn load(&self) -> Arc<RouteTable> {
        self.current.load_full()
    }

    pub fn store(&self, table: RouteTable) {
        self.current.store(Arc::new(table));
    }
}

/// Strip the port from a Host header value, keeping bracketed IPv6 intact.
pub fn host_without_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: PathMatch, methods: &[Method], host: Option<&str>) -> Route {
        Route {
            path,
            methods: if methods.is_empty() { None } else { Some(methods.to_vec()) },
            host: host.map(str::to_string),
            endpoint: Endpoint::Ok,
        }
    }

    fn matched(lookup: Lookup<'_>) -> Option<&Route> {
        match lookup {
            Lookup::Found(r) => Some(r),
            _ => None,
        }
    }

    #[test]
    fn exact_wins_over_prefix() {
        let mut table = RouteTable::new();
        table.add(route(PathMatch::Prefix("/api".into()), &[], None));
        table.add(route(PathMatch::Exact("/api".into()), &[Method::GET], None));

        let hit = matched(table.lookup(&Method::GET, "x", "/api")).unwrap();
        assert_eq!(hit.path, PathMatch::Exact("/api".into()));
        let hit = matched(table.lookup(&Method::POST, "x", "/api")).unwrap();
        assert_eq!(hit.path, PathMatch::Prefix("/api".into()));
    }

    #[test]
    fn longest_prefix_wins() {
        let mut table = RouteTable::new();
        table.add(route(PathMatch::Prefix("/a/".into()), &[], None));
        table.add(route(PathMatch::Prefix("/a/b/".into()), &[], None));
        let hit = matched(table.lookup(&Method::GET, "x", "/a/b/c")).unwrap();
        assert_eq!(hit.path, PathMatch::Prefix("/a/b/".into()));
    }

    #[test]
    fn method_and_host_filters() {
        let mut table = RouteTable::new();
        table.add(route(PathMatch::Exact("/hello".into()), &[Method::POST], Some("example.com")));

        assert!(matched(table.lookup(&Method::POST, "example.com", "/hello")).is_some());
        assert!(matches!(table.lookup(&Method::GET, "example.com", "/hello"), Lookup::MethodNotAllowed));
        assert!(matches!(table.lookup(&Method::POST, "other.org", "/hello"), Lookup::NotFound));
        assert!(matches!(table.lookup(&Method::POST, "example.com", "/nope"), Lookup::NotFound));
    }

    #[test]
    fn swap_does_not_disturb_readers() {
        let router = MutableRouter::default();
        let before = router.load();
        let mut table = RouteTable::new();
        table.add(route(PathMatch::Exact("/x".into()), &[], None));
        router.store(table);
        assert!(before.is_empty());
        assert_eq!(router.load().len(), 1);
    }

    #[test]
    fn host_port_is_stripped() {
        assert_eq!(host_without_port("example.com:8080"), "example.com");
        assert_eq!(host_without_port("example.com"), "example.com");
        assert_eq!(host_without_port("[::1]:8080"), "::1");
        assert_eq!(host_without_port("::1"), "::1");
    }
}
