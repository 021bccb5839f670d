//! Webhook ingress contract. The HTTP server proper lives outside this
//! crate; whatever mounts the routes hands `(route, slug, payload)` to the
//! router, which picks the configured source that should handle it.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressRoute {
    WebScrobbler,
    Jellyfin,
}

impl IngressRoute {
    /// Path the route is mounted at, without the optional slug suffix.
    pub fn path(self) -> &'static str {
        match self {
            IngressRoute::WebScrobbler => "/api/webscrobbler",
            IngressRoute::Jellyfin => "/jellyfin",
        }
    }

    pub fn for_source_type(kind: &str) -> Option<IngressRoute> {
        match kind {
            "webscrobbler" => Some(IngressRoute::WebScrobbler),
            "jellyfin" => Some(IngressRoute::Jellyfin),
            _ => None,
        }
    }
}

impl fmt::Display for IngressRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, Clone)]
struct Binding {
    route: IngressRoute,
    slug: Option<String>,
    source: String,
}

/// Maps `(route, slug)` to a source name. A binding without a slug matches
/// only slugless requests; a named slug requires exact equality.
#[derive(Debug, Default)]
pub struct IngressRouter {
    bindings: Vec<Binding>,
}

impl IngressRouter {
    pub fn new() -> Self {
        IngressRouter::default()
    }

    pub fn bind(&mut self, route: IngressRoute, slug: Option<String>, source: impl Into<String>) {
        self.bindings.push(Binding {
            route,
            slug,
            source: source.into(),
        });
    }

    pub fn resolve(&self, route: IngressRoute, slug: Option<&str>) -> Option<&str> {
        self.bindings
            .iter()
            .find(|b| b.route == route && b.slug.as_deref() == slug)
            .map(|b| b.source.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> IngressRouter {
        let mut r = IngressRouter::new();
        r.bind(IngressRoute::WebScrobbler, None, "ws-default");
        r.bind(IngressRoute::WebScrobbler, Some("firefox".into()), "ws-firefox");
        r.bind(IngressRoute::Jellyfin, None, "jf");
        r
    }

    #[test]
    fn slugless_binding_matches_only_slugless_requests() {
        let r = router();
        assert_eq!(r.resolve(IngressRoute::WebScrobbler, None), Some("ws-default"));
        assert_eq!(r.resolve(IngressRoute::WebScrobbler, Some("chrome")), None);
    }

    #[test]
    fn named_slug_requires_exact_match() {
        let r = router();
        assert_eq!(
            r.resolve(IngressRoute::WebScrobbler, Some("firefox")),
            Some("ws-firefox")
        );
        assert_eq!(r.resolve(IngressRoute::WebScrobbler, Some("firefo")), None);
    }

    #[test]
    fn routes_are_independent() {
        let r = router();
        assert_eq!(r.resolve(IngressRoute::Jellyfin, None), Some("jf"));
        assert_eq!(r.resolve(IngressRoute::Jellyfin, Some("firefox")), None);
    }
}
