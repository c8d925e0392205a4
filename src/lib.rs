#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation, // TODO
    clippy::too_many_lines, // TODO
)]

mod cache;
mod client;
mod config;
mod connection;
mod enums;
mod error;
mod flags;
mod frame;
mod headers;
mod hpack;
mod request;
mod response;
mod settings;
mod stream;

pub use bytes::Bytes;
pub use cache::ConnectionCache;
pub use client::Client;
pub use config::Options;
pub use connection::Connection;
pub use error::Error;
pub use headers::HeaderList;
pub use request::{Method, Request, RequestContext};
pub use response::Response;
pub use url::Url;
