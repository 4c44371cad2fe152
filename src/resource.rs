//! Resource tree, dispatcher and `/.well-known/core` discovery
//!
//! Handlers are registered at startup under an exact path. [`ResourceTree::dispatch`]
//! always produces a [`Response`]: unknown paths become 4.04 and a panicking
//! handler becomes 5.00, so one bad request never takes the server down.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::coap_types::{ContentFormat, Method, Request, Response, ResponseCode, split_path};
use crate::error::{GatewayError, Result};

/// Path of the discovery resource
pub const WELL_KNOWN_CORE: &str = "/.well-known/core";

/// Something that can answer requests for one resource path
///
/// Implementations must terminate every branch in a `Response`; the
/// dispatcher additionally converts panics into 5.00.
pub trait ResourceHandler: Send + Sync {
    fn handle(&self, request: &Request) -> Response;
}

impl<F> ResourceHandler for F
where
    F: Fn(&Request) -> Response + Send + Sync,
{
    fn handle(&self, request: &Request) -> Response {
        self(request)
    }
}

/// One entry of an RFC 6690 link-format listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Absolute path, e.g. `/sensor`
    pub path: String,
    /// `rt` attribute
    pub resource_type: Option<String>,
    /// `ct` attribute values
    pub content_formats: Vec<u16>,
    /// `title` attribute
    pub title: Option<String>,
}

impl Link {
    pub fn new(path: &str) -> Self {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        Self {
            path: format!("/{}", segments.join("/")),
            resource_type: None,
            content_formats: Vec::new(),
            title: None,
        }
    }

    pub fn with_resource_type(mut self, rt: &str) -> Self {
        self.resource_type = Some(rt.to_string());
        self
    }

    pub fn with_content_format(mut self, format: ContentFormat) -> Self {
        self.content_formats.push(format.as_u16());
        self
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    /// Apply the `rt` / `href` query filters of RFC 6690 §4.1
    fn matches(&self, request: &Request) -> bool {
        if let Some(pattern) = request.query.get("href") {
            if !matches_pattern(&self.path, pattern) {
                return false;
            }
        }
        if let Some(pattern) = request.query.get("rt") {
            let Some(rt) = &self.resource_type else {
                return false;
            };
            if !rt.split_whitespace().any(|value| matches_pattern(value, pattern)) {
                return false;
            }
        }
        true
    }

    /// Parse a link-format document as returned by discovery
    pub fn parse_list(document: &str) -> Result<Vec<Link>> {
        split_unquoted(document, ',')
            .into_iter()
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(Self::parse_one)
            .collect()
    }

    fn parse_one(entry: &str) -> Result<Link> {
        let invalid = || GatewayError::InvalidResponseFormat(format!("invalid link: {entry}"));

        let rest = entry.strip_prefix('<').ok_or_else(invalid)?;
        let (target, attributes) = rest.split_once('>').ok_or_else(invalid)?;
        let mut link = Link::new(target);

        for attribute in split_unquoted(attributes, ';') {
            let attribute = attribute.trim();
            if attribute.is_empty() {
                continue;
            }
            let (key, value) = attribute.split_once('=').unwrap_or((attribute, ""));
            let value = value.trim_matches('"');
            match key {
                "rt" => link.resource_type = Some(value.to_string()),
                "title" => link.title = Some(value.to_string()),
                "ct" => {
                    for format in value.split_whitespace() {
                        link.content_formats.push(format.parse().map_err(|_| invalid())?);
                    }
                }
                _ => {}
            }
        }
        Ok(link)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.path)?;
        if let Some(rt) = &self.resource_type {
            write!(f, ";rt=\"{rt}\"")?;
        }
        match self.content_formats.as_slice() {
            [] => {}
            [single] => write!(f, ";ct={single}")?,
            many => {
                let joined: Vec<String> = many.iter().map(u16::to_string).collect();
                write!(f, ";ct=\"{}\"", joined.join(" "))?;
            }
        }
        if let Some(title) = &self.title {
            write!(f, ";title=\"{title}\"")?;
        }
        Ok(())
    }
}

fn matches_pattern(value: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => value == pattern,
    }
}

fn split_unquoted(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (index, ch) in input.char_indices() {
        if ch == '"' {
            in_quotes = !in_quotes;
        } else if ch == separator && !in_quotes {
            parts.push(&input[start..index]);
            start = index + ch.len_utf8();
        }
    }
    parts.push(&input[start..]);
    parts
}

type LinkCatalog = Arc<RwLock<Vec<Link>>>;

/// Registered resources keyed by exact path segments
pub struct ResourceTree {
    handlers: HashMap<Vec<String>, Box<dyn ResourceHandler>>,
    /// Registration-ordered listing shared with the discovery handler
    catalog: LinkCatalog,
}

impl Default for ResourceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResourceTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let paths: Vec<String> = self.catalog.read().iter().map(|l| l.path.clone()).collect();
        f.debug_struct("ResourceTree").field("paths", &paths).finish()
    }
}

impl ResourceTree {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            catalog: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a handler under `path` with no link attributes
    pub fn register(&mut self, path: &str, handler: impl ResourceHandler + 'static) -> Result<()> {
        self.register_with(Link::new(path), handler)
    }

    /// Register a handler, advertising `link` through discovery
    pub fn register_with(
        &mut self,
        link: Link,
        handler: impl ResourceHandler + 'static,
    ) -> Result<()> {
        let segments = split_path(&link.path)?;
        if self.handlers.contains_key(&segments) {
            return Err(GatewayError::DuplicateResource(link.path));
        }
        debug!(path = %link.path, "registered resource");
        self.handlers.insert(segments, Box::new(handler));
        self.catalog.write().push(link);
        Ok(())
    }

    /// Register the `/.well-known/core` listing
    pub fn register_discovery(&mut self) -> Result<()> {
        let handler = WellKnownCore {
            catalog: self.catalog.clone(),
        };
        self.register_with(
            Link::new(WELL_KNOWN_CORE).with_content_format(ContentFormat::LinkFormat),
            handler,
        )
    }

    /// Links of every registered resource, in registration order
    pub fn links(&self) -> Vec<Link> {
        self.catalog.read().clone()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Route a request to its handler
    pub fn dispatch(&self, request: &Request) -> Response {
        let Some(handler) = self.handlers.get(&request.path) else {
            debug!(path = %request.path_string(), "no resource registered");
            return Response::not_found(&request.path_string());
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
            Ok(response) => response,
            Err(_) => {
                error!(path = %request.path_string(), "resource handler panicked");
                Response::error(
                    ResponseCode::InternalServerError,
                    "Server Error: resource handler failed",
                )
            }
        }
    }
}

/// Discovery handler listing the tree's resources in link format
struct WellKnownCore {
    catalog: LinkCatalog,
}

impl ResourceHandler for WellKnownCore {
    fn handle(&self, request: &Request) -> Response {
        if request.method != Method::Get {
            return Response::method_not_allowed(request.method);
        }
        let listing: Vec<String> = self
            .catalog
            .read()
            .iter()
            .filter(|link| link.matches(request))
            .map(Link::to_string)
            .collect();
        Response::content(listing.join(",").into_bytes(), ContentFormat::LinkFormat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap_types::QueryParams;

    fn echo(request: &Request) -> Response {
        Response::content(request.payload.clone(), ContentFormat::TextPlain)
    }

    fn sample_tree() -> ResourceTree {
        let mut tree = ResourceTree::new();
        tree.register_with(
            Link::new("/sensor")
                .with_resource_type("sensor")
                .with_content_format(ContentFormat::TextPlain),
            echo,
        )
        .unwrap();
        tree.register_with(
            Link::new("sensor/snapshot")
                .with_resource_type("sensor.snapshot")
                .with_content_format(ContentFormat::Json)
                .with_content_format(ContentFormat::Cbor),
            echo,
        )
        .unwrap();
        tree.register_discovery().unwrap();
        tree
    }

    fn get(path: &str) -> Request {
        Request::new(Method::Get).with_path(path).unwrap()
    }

    #[test]
    fn test_dispatch_exact_match() {
        let tree = sample_tree();
        let response = tree.dispatch(&get("/sensor").with_payload(b"hi".to_vec()));
        assert_eq!(response.code, ResponseCode::Content);
        assert_eq!(response.payload, b"hi");

        // no prefix or wildcard matching
        let response = tree.dispatch(&get("/sensor/temperature"));
        assert_eq!(response.code, ResponseCode::NotFound);
        let response = tree.dispatch(&get("/"));
        assert_eq!(response.code, ResponseCode::NotFound);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut tree = sample_tree();
        let result = tree.register("/sensor/", echo);
        assert!(matches!(result, Err(GatewayError::DuplicateResource(p)) if p == "/sensor"));
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_panicking_handler_becomes_server_error() {
        let mut tree = ResourceTree::new();
        tree.register("/boom", |_: &Request| -> Response { panic!("handler fault") })
            .unwrap();

        let response = tree.dispatch(&get("/boom"));
        assert_eq!(response.code, ResponseCode::InternalServerError);
        assert!(!response.payload.is_empty());
    }

    #[test]
    fn test_discovery_listing() {
        let tree = sample_tree();
        let response = tree.dispatch(&get(WELL_KNOWN_CORE));

        assert_eq!(response.code, ResponseCode::Content);
        assert_eq!(response.content_format, Some(ContentFormat::LinkFormat));
        assert_eq!(
            response.payload_text(),
            "</sensor>;rt=\"sensor\";ct=0,\
             </sensor/snapshot>;rt=\"sensor.snapshot\";ct=\"50 60\",\
             </.well-known/core>;ct=40"
        );
    }

    #[test]
    fn test_discovery_filters() {
        let tree = sample_tree();

        let request = get(WELL_KNOWN_CORE).with_query(QueryParams::parse("rt=sensor"));
        let links = Link::parse_list(&tree.dispatch(&request).payload_text()).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].path, "/sensor");

        let request = get(WELL_KNOWN_CORE).with_query(QueryParams::parse("rt=sensor*"));
        let links = Link::parse_list(&tree.dispatch(&request).payload_text()).unwrap();
        assert_eq!(links.len(), 2);

        let request = get(WELL_KNOWN_CORE).with_query(QueryParams::parse("href=/.well-known*"));
        let links = Link::parse_list(&tree.dispatch(&request).payload_text()).unwrap();
        assert_eq!(links, vec![Link::new(WELL_KNOWN_CORE).with_content_format(ContentFormat::LinkFormat)]);
    }

    #[test]
    fn test_discovery_rejects_post() {
        let tree = sample_tree();
        let request = Request::new(Method::Post).with_path(WELL_KNOWN_CORE).unwrap();
        assert_eq!(tree.dispatch(&request).code, ResponseCode::MethodNotAllowed);
    }

    #[test]
    fn test_parse_link_list() {
        let links =
            Link::parse_list("</a>;title=\"x, y\";ct=\"0 40\",</b/c>;rt=\"t1 t2\";obs").unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].title.as_deref(), Some("x, y"));
        assert_eq!(links[0].content_formats, vec![0, 40]);
        assert_eq!(links[1].path, "/b/c");
        assert_eq!(links[1].resource_type.as_deref(), Some("t1 t2"));

        assert!(Link::parse_list("/missing-brackets").is_err());
        assert!(Link::parse_list("").unwrap().is_empty());
    }
}
