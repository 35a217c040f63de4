//! nginx configuration as a parse tree
//!
//! Only the subset harbor touches is modelled: directives, blocks, and
//! comments. Quoted arguments are kept verbatim so a parse/serialize cycle
//! does not change their meaning.

use crate::error::{HarborError, HarborResult};
use std::fmt::{self, Write};

const REVISION_MARKER: &str = "harbor-revision";

const FORWARDED_HEADERS: [&str; 4] = [
    "Host $host",
    "X-Real-IP $remote_addr",
    "X-Forwarded-For $proxy_add_x_forwarded_for",
    "X-Forwarded-Host $server_name",
];

/// One node of an nginx config
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Directive { name: String, args: Vec<String> },
    Block {
        name: String,
        args: Vec<String>,
        children: Vec<Node>,
    },
    Comment(String),
}

impl Node {
    pub fn directive(name: &str, args: &[&str]) -> Self {
        Node::Directive {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn block(name: &str, args: &[&str], children: Vec<Node>) -> Self {
        Node::Block {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            children,
        }
    }

    fn is_block(&self, block_name: &str) -> bool {
        matches!(self, Node::Block { name, .. } if name == block_name)
    }

    fn is_block_with(&self, block_name: &str, value: &str) -> bool {
        matches!(self, Node::Block { name, args, .. } if name == block_name && args.len() == 1 && args[0] == value)
    }

    fn children(&self) -> &[Node] {
        match self {
            Node::Block { children, .. } => children,
            _ => &[],
        }
    }

    fn children_mut(&mut self) -> Option<&mut Vec<Node>> {
        match self {
            Node::Block { children, .. } => Some(children),
            _ => None,
        }
    }

    /// First argument of the first child directive called `directive`
    fn directive_value(&self, directive: &str) -> Option<&str> {
        self.children().iter().find_map(|child| match child {
            Node::Directive { name, args } if name == directive => args.first().map(String::as_str),
            _ => None,
        })
    }
}

/// A path rule found in the routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub path: String,
    /// Upstream named by `proxy_pass http://<upstream>/`
    pub upstream: Option<String>,
}

/// Parsed nginx config
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NginxConf {
    pub nodes: Vec<Node>,
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Open,
    Close,
    Semicolon,
    Comment(String),
}

fn tokenize(input: &str) -> HarborResult<Vec<(Token, usize)>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '{' => {
                tokens.push((Token::Open, line));
                chars.next();
            }
            '}' => {
                tokens.push((Token::Close, line));
                chars.next();
            }
            ';' => {
                tokens.push((Token::Semicolon, line));
                chars.next();
            }
            '#' => {
                chars.next();
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    text.push(c);
                    chars.next();
                }
                tokens.push((Token::Comment(text.trim().to_string()), line));
            }
            '"' | '\'' => {
                let quote = c;
                let start = line;
                let mut word = String::new();
                word.push(quote);
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    word.push(c);
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                word.push(escaped);
                            }
                        }
                        '\n' => line += 1,
                        c if c == quote => {
                            closed = true;
                            break;
                        }
                        _ => {}
                    }
                }
                if !closed {
                    return Err(HarborError::ProxyConfig(format!(
                        "unterminated string starting on line {}",
                        start
                    )));
                }
                tokens.push((Token::Word(word), start));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '{' | '}' | ';') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push((Token::Word(word), line));
            }
        }
    }
    Ok(tokens)
}

fn parse_nodes<I>(tokens: &mut I, nested: bool) -> HarborResult<Vec<Node>>
where
    I: Iterator<Item = (Token, usize)>,
{
    let mut nodes = Vec::new();
    loop {
        let Some((token, line)) = tokens.next() else {
            if nested {
                return Err(HarborError::ProxyConfig("unexpected end of file, expecting `}`".into()));
            }
            return Ok(nodes);
        };

        match token {
            Token::Comment(text) => nodes.push(Node::Comment(text)),
            Token::Close if nested => return Ok(nodes),
            Token::Close => {
                return Err(HarborError::ProxyConfig(format!("unexpected `}}` on line {}", line)));
            }
            Token::Open | Token::Semicolon => {
                return Err(HarborError::ProxyConfig(format!("unexpected token on line {}", line)));
            }
            Token::Word(name) => {
                let mut args = Vec::new();
                loop {
                    match tokens.next() {
                        Some((Token::Word(arg), _)) => args.push(arg),
                        // nginx allows comments between arguments; they are dropped
                        Some((Token::Comment(_), _)) => {}
                        Some((Token::Semicolon, _)) => {
                            nodes.push(Node::Directive { name, args });
                            break;
                        }
                        Some((Token::Open, _)) => {
                            let children = parse_nodes(tokens, true)?;
                            nodes.push(Node::Block { name, args, children });
                            break;
                        }
                        Some((Token::Close, line)) => {
                            return Err(HarborError::ProxyConfig(format!(
                                "directive `{}` is not terminated by `;` on line {}",
                                name, line
                            )));
                        }
                        None => {
                            return Err(HarborError::ProxyConfig(format!(
                                "unexpected end of file in directive `{}`",
                                name
                            )));
                        }
                    }
                }
            }
        }
    }
}

fn write_nodes(out: &mut String, nodes: &[Node], depth: usize) -> fmt::Result {
    let indent = "    ".repeat(depth);
    for (i, node) in nodes.iter().enumerate() {
        match node {
            Node::Comment(text) => writeln!(out, "{}# {}", indent, text)?,
            Node::Directive { name, args } => {
                write!(out, "{}{}", indent, name)?;
                for arg in args {
                    write!(out, " {}", arg)?;
                }
                writeln!(out, ";")?;
            }
            Node::Block { name, args, children } => {
                if i > 0 && !matches!(nodes[i - 1], Node::Comment(_)) {
                    writeln!(out)?;
                }
                write!(out, "{}{}", indent, name)?;
                for arg in args {
                    write!(out, " {}", arg)?;
                }
                writeln!(out, " {{")?;
                write_nodes(out, children, depth + 1)?;
                writeln!(out, "{}}}", indent)?;
            }
        }
    }
    Ok(())
}

impl NginxConf {
    pub fn parse(input: &str) -> HarborResult<Self> {
        let mut tokens = tokenize(input)?.into_iter();
        Ok(Self {
            nodes: parse_nodes(&mut tokens, false)?,
        })
    }

    /// Revision from the `# harbor-revision N` marker, 0 when absent
    pub fn revision(&self) -> u64 {
        self.nodes
            .iter()
            .find_map(|node| match node {
                Node::Comment(text) => text
                    .strip_prefix(REVISION_MARKER)
                    .and_then(|rest| rest.trim().parse().ok()),
                _ => None,
            })
            .unwrap_or(0)
    }

    pub fn set_revision(&mut self, revision: u64) {
        let marker = Node::Comment(format!("{} {}", REVISION_MARKER, revision));
        let existing = self.nodes.iter().position(
            |node| matches!(node, Node::Comment(text) if text.starts_with(REVISION_MARKER)),
        );
        match existing {
            Some(idx) => self.nodes[idx] = marker,
            None => self.nodes.insert(0, marker),
        }
    }

    fn http(&self) -> HarborResult<&Node> {
        self.nodes
            .iter()
            .find(|node| node.is_block("http"))
            .ok_or_else(|| HarborError::ProxyConfig("no http block".into()))
    }

    fn http_mut(&mut self) -> HarborResult<&mut Vec<Node>> {
        self.nodes
            .iter_mut()
            .find(|node| node.is_block("http"))
            .and_then(Node::children_mut)
            .ok_or_else(|| HarborError::ProxyConfig("no http block".into()))
    }

    /// Upstream blocks as (name, server address)
    pub fn upstreams(&self) -> HarborResult<Vec<(String, Option<String>)>> {
        Ok(self
            .http()?
            .children()
            .iter()
            .filter_map(|node| match node {
                Node::Block { name, args, .. } if name == "upstream" => Some((
                    args.first().cloned().unwrap_or_default(),
                    node.directive_value("server").map(str::to_string),
                )),
                _ => None,
            })
            .collect())
    }

    /// Remove every upstream block named `upstream`; returns whether any existed
    pub fn remove_upstream(&mut self, upstream: &str) -> HarborResult<bool> {
        let http = self.http_mut()?;
        let before = http.len();
        http.retain(|node| !node.is_block_with("upstream", upstream));
        Ok(http.len() != before)
    }

    pub fn add_upstream(&mut self, upstream: &str, address: &str) -> HarborResult<()> {
        self.http_mut()?.push(Node::block(
            "upstream",
            &[upstream],
            vec![Node::directive("server", &[address])],
        ));
        Ok(())
    }

    /// Every location rule across all server blocks
    pub fn routes(&self) -> HarborResult<Vec<Route>> {
        Ok(self
            .http()?
            .children()
            .iter()
            .filter(|node| node.is_block("server"))
            .flat_map(|server| server.children().iter())
            .filter_map(|node| match node {
                Node::Block { name, args, .. } if name == "location" => Some(Route {
                    path: args.last().cloned().unwrap_or_default(),
                    upstream: node.directive_value("proxy_pass").and_then(upstream_of),
                }),
                _ => None,
            })
            .collect())
    }

    pub fn route(&self, path: &str) -> HarborResult<Option<Route>> {
        Ok(self.routes()?.into_iter().find(|route| route.path == path))
    }

    /// Replace the location rule for `path` with one proxying to `upstream`.
    /// A server block listening on `listen_port` is created if none exists.
    pub fn upsert_location(&mut self, path: &str, upstream: &str, listen_port: u16) -> HarborResult<()> {
        let http = self.http_mut()?;
        for server in http.iter_mut().filter(|node| node.is_block("server")) {
            if let Some(children) = server.children_mut() {
                children.retain(|node| !node.is_block_with("location", path));
            }
        }

        let server = match http.iter().position(|node| node.is_block("server")) {
            Some(idx) => &mut http[idx],
            None => {
                http.push(Node::block(
                    "server",
                    &[],
                    vec![Node::directive("listen", &[listen_port.to_string().as_str()])],
                ));
                let last = http.len() - 1;
                &mut http[last]
            }
        };

        let proxy_pass = format!("http://{}/", upstream);
        let mut rule = vec![
            Node::directive("proxy_pass", &[proxy_pass.as_str()]),
            Node::directive("proxy_redirect", &["off"]),
        ];
        for header in FORWARDED_HEADERS {
            let (name, value) = header.split_once(' ').unwrap_or((header, ""));
            rule.push(Node::directive("proxy_set_header", &[name, value]));
        }
        if let Some(children) = server.children_mut() {
            children.push(Node::block("location", &[path], rule));
        }
        Ok(())
    }

    /// Remove the location rule for `path`; returns the upstream it pointed at
    pub fn remove_location(&mut self, path: &str) -> HarborResult<Option<String>> {
        let previous = self.route(path)?;
        let http = self.http_mut()?;
        for server in http.iter_mut().filter(|node| node.is_block("server")) {
            if let Some(children) = server.children_mut() {
                children.retain(|node| !node.is_block_with("location", path));
            }
        }
        Ok(previous.and_then(|route| route.upstream))
    }
}

impl fmt::Display for NginxConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        write_nodes(&mut out, &self.nodes, 0)?;
        f.write_str(&out)
    }
}

fn upstream_of(proxy_pass: &str) -> Option<String> {
    let rest = proxy_pass
        .strip_prefix("http://")
        .or_else(|| proxy_pass.strip_prefix("https://"))?;
    let name = rest.split('/').next()?;
    (!name.is_empty()).then(|| name.to_string())
}
