use crate::config::{Config, RouteConfig, ServerConfig};
use crate::http::Request;

/// Select the virtual host for a request: the first server whose
/// `server_name` matches the `Host` header exactly (case-insensitive, any
/// `:port` suffix ignored). No match, or no `Host` at all, falls back to
/// the first configured server.
pub fn select_server(config: &Config, req: &Request) -> usize {
    let host = match req.header("host") {
        Some(host) => strip_port(host),
        None => return 0,
    };
    config
        .servers
        .iter()
        .position(|sc| sc.server_names.iter().any(|name| name.eq_ignore_ascii_case(host)))
        .unwrap_or(0)
}

/// Longest-prefix route match against the URI path. Equal lengths cannot
/// occur twice unless routes are duplicated, in which case the first
/// configured wins.
pub fn match_route<'a>(sc: &'a ServerConfig, path: &str) -> Option<&'a RouteConfig> {
    let mut best: Option<&RouteConfig> = None;
    for route in &sc.routes {
        if path.starts_with(&route.path) {
            if best.map_or(true, |b| route.path.len() > b.path.len()) {
                best = Some(route);
            }
        }
    }
    best
}

/// The part of the URI the matched route prefix doesn't cover; an empty or
/// bare-slash remainder turns into the route's index file when configured.
pub fn relative_uri(route: &RouteConfig, path: &str) -> String {
    let rel = &path[route.path.len()..];
    if rel.is_empty() || rel == "/" {
        if let Some(index) = &route.index {
            return format!("/{}", index);
        }
    }
    rel.to_string()
}

fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(colon) => &host[..colon],
        None => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_host(host: Option<&str>) -> Request {
        let mut req = Request::new();
        req.method = "GET".to_string();
        req.uri = "/".to_string();
        if let Some(host) = host {
            req.headers.push(("Host".to_string(), host.to_string()));
        }
        req
    }

    fn two_server_config() -> Config {
        Config::parse(
            "server * 8080\nserver_name a\nroute / ./a\n\
             server * 8081\nserver_name b www.b\nroute / ./b\n",
        )
        .unwrap()
    }

    #[test]
    fn host_selects_exact_match() {
        let config = two_server_config();
        assert_eq!(select_server(&config, &request_with_host(Some("b"))), 1);
        assert_eq!(select_server(&config, &request_with_host(Some("www.b"))), 1);
        assert_eq!(select_server(&config, &request_with_host(Some("a"))), 0);
    }

    #[test]
    fn host_match_is_case_insensitive() {
        let config = two_server_config();
        assert_eq!(select_server(&config, &request_with_host(Some("B"))), 1);
        assert_eq!(select_server(&config, &request_with_host(Some("WWW.B"))), 1);
    }

    #[test]
    fn port_suffix_is_ignored() {
        let config = two_server_config();
        assert_eq!(select_server(&config, &request_with_host(Some("b:8080"))), 1);
    }

    #[test]
    fn unknown_or_missing_host_falls_back_to_first() {
        let config = two_server_config();
        assert_eq!(select_server(&config, &request_with_host(Some("nope"))), 0);
        assert_eq!(select_server(&config, &request_with_host(None)), 0);
    }

    #[test]
    fn substring_names_do_not_match() {
        let config = two_server_config();
        // "ab" contains "a" and "b" but matches neither exactly.
        assert_eq!(select_server(&config, &request_with_host(Some("ab"))), 0);
    }

    #[test]
    fn longest_prefix_wins() {
        let config = Config::parse(
            "server * 0\nroute / ./root\nroute /static ./static\nroute /static/img ./img\n",
        )
        .unwrap();
        let sc = &config.servers[0];
        assert_eq!(match_route(sc, "/static/img/x.png").unwrap().root, "./img");
        assert_eq!(match_route(sc, "/static/x.css").unwrap().root, "./static");
        assert_eq!(match_route(sc, "/other").unwrap().root, "./root");
    }

    #[test]
    fn equal_length_prefix_keeps_first_configured() {
        let config = Config::parse("server * 0\nroute /a ./first\nroute /a ./second\n").unwrap();
        let sc = &config.servers[0];
        assert_eq!(match_route(sc, "/a/x").unwrap().root, "./first");
    }

    #[test]
    fn no_match_is_none() {
        let config = Config::parse("server * 0\nroute /only ./x\n").unwrap();
        assert!(match_route(&config.servers[0], "/other").is_none());
    }

    #[test]
    fn relative_uri_applies_index() {
        let config =
            Config::parse("server * 0\nroute /site ./www index=index.html\nroute /raw ./www\n")
                .unwrap();
        let site = &config.servers[0].routes[0];
        let raw = &config.servers[0].routes[1];
        assert_eq!(relative_uri(site, "/site"), "/index.html");
        assert_eq!(relative_uri(site, "/site/"), "/index.html");
        assert_eq!(relative_uri(site, "/site/page.html"), "/page.html");
        assert_eq!(relative_uri(raw, "/raw/"), "/");
    }
}
