//! Shared reverse proxy in front of every deployed model

pub mod conf;
mod router;

pub use conf::{NginxConf, Node, Route};
pub use router::{ReverseProxyRouter, RouteUpdate};
