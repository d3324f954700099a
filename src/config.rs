use std::path::Path;

use anyhow::{anyhow, Context, Result};

const DEFAULT_MAX_BODY_SIZE: usize = 1 << 20;
const DEFAULT_HEADER_TIMEOUT_MS: u64 = 5000;
const DEFAULT_BODY_TIMEOUT_MS: u64 = 10000;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 15000;
const DEFAULT_CGI_TIMEOUT_MS: u64 = 10000;

/// One `route` line: a URI prefix mapped onto a filesystem root plus the
/// per-route policy switches.
#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub path: String,
    pub root: String,
    pub methods: Vec<String>,
    pub redirect: Option<String>,
    pub index: Option<String>,
    pub autoindex: bool,
    pub uploads_enabled: bool,
    pub upload_path: Option<String>,
    pub cgi_extension: Option<String>,
    pub cgi_interpreter: Option<String>,
}

impl RouteConfig {
    fn new(path: String, root: String) -> Self {
        RouteConfig {
            path,
            root,
            methods: Vec::new(),
            redirect: None,
            index: None,
            autoindex: false,
            uploads_enabled: false,
            upload_path: None,
            cgi_extension: None,
            cgi_interpreter: None,
        }
    }

    /// Empty method list means any method is allowed.
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m == method)
    }
}

/// One `server` block: listening address, virtual host names, limits and
/// timeout budgets, and an ordered route table.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub server_names: Vec<String>,
    pub error_page_root: Option<String>,
    pub client_max_body_size: usize,
    pub header_timeout_ms: u64,
    pub body_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub cgi_timeout_ms: u64,
    pub routes: Vec<RouteConfig>,
}

impl ServerConfig {
    fn new(host: String, port: u16) -> Self {
        ServerConfig {
            host,
            port,
            server_names: Vec::new(),
            error_page_root: None,
            client_max_body_size: DEFAULT_MAX_BODY_SIZE,
            header_timeout_ms: DEFAULT_HEADER_TIMEOUT_MS,
            body_timeout_ms: DEFAULT_BODY_TIMEOUT_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            cgi_timeout_ms: DEFAULT_CGI_TIMEOUT_MS,
            routes: Vec::new(),
        }
    }
}

/// Immutable, validated configuration for the process lifetime.
#[derive(Debug, Clone)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Config::parse(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Parse the line-oriented config format: `#` comments, whitespace
    /// separated tokens, `server` opening a block that following directives
    /// attach to.
    pub fn parse(text: &str) -> Result<Config> {
        let mut servers: Vec<ServerConfig> = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            parse_line(line, &mut servers)
                .with_context(|| format!("config line {}: `{}'", lineno + 1, line.trim()))?;
        }
        if servers.is_empty() {
            return Err(anyhow!("no server blocks configured"));
        }
        Ok(Config { servers })
    }
}

fn parse_line(line: &str, servers: &mut Vec<ServerConfig>) -> Result<()> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(());
    }
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let directive = tokens[0];

    if directive == "server" {
        if tokens.len() < 3 {
            return Err(anyhow!("expected `server <host> <port>'"));
        }
        let host = if tokens[1] == "*" { String::new() } else { tokens[1].to_string() };
        let port = tokens[2]
            .parse()
            .with_context(|| format!("port number {} is invalid", tokens[2]))?;
        servers.push(ServerConfig::new(host, port));
        return Ok(());
    }

    let current = servers
        .last_mut()
        .ok_or_else(|| anyhow!("directive `{}' before any server block", directive))?;

    match directive {
        "server_name" => {
            if tokens.len() < 2 {
                return Err(anyhow!("server_name needs at least one name"));
            }
            current
                .server_names
                .extend(tokens[1..].iter().map(|t| t.to_string()));
        }
        "error_page_root" => {
            current.error_page_root = Some(require_value(&tokens)?.to_string());
        }
        "client_max_body_size" => {
            current.client_max_body_size = parse_number(require_value(&tokens)?)?;
        }
        "header_timeout" => {
            current.header_timeout_ms = parse_number(require_value(&tokens)?)?;
        }
        "body_timeout" => {
            current.body_timeout_ms = parse_number(require_value(&tokens)?)?;
        }
        "idle_timeout" => {
            current.idle_timeout_ms = parse_number(require_value(&tokens)?)?;
        }
        "cgi_timeout" => {
            current.cgi_timeout_ms = parse_number(require_value(&tokens)?)?;
        }
        "route" => {
            if tokens.len() < 3 {
                return Err(anyhow!("expected `route <path> <root> [key=value ...]'"));
            }
            let mut route = RouteConfig::new(tokens[1].to_string(), tokens[2].to_string());
            for option in &tokens[3..] {
                let (key, value) = match option.find('=') {
                    Some(eq) => (&option[..eq], &option[eq + 1..]),
                    None => return Err(anyhow!("route option `{}' is not key=value", option)),
                };
                match key {
                    "index" => route.index = Some(value.to_string()),
                    "methods" => {
                        route.methods =
                            value.split(',').filter(|m| !m.is_empty()).map(str::to_string).collect()
                    }
                    "upload" => route.uploads_enabled = parse_switch(value),
                    "upload_path" => route.upload_path = Some(value.to_string()),
                    "autoindex" => route.autoindex = parse_switch(value),
                    "redirect" => route.redirect = Some(value.to_string()),
                    "cgi_ext" => route.cgi_extension = Some(value.to_string()),
                    "cgi_bin" => route.cgi_interpreter = Some(value.to_string()),
                    _ => return Err(anyhow!("unknown route option `{}'", key)),
                }
            }
            current.routes.push(route);
        }
        _ => return Err(anyhow!("unknown directive `{}'", directive)),
    }
    Ok(())
}

fn require_value<'a>(tokens: &[&'a str]) -> Result<&'a str> {
    tokens
        .get(1)
        .copied()
        .ok_or_else(|| anyhow!("directive `{}' needs a value", tokens[0]))
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("number {} is invalid", value))
}

fn parse_switch(value: &str) -> bool {
    matches!(value, "on" | "1" | "true")
}
