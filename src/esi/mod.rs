//! EVE Swagger Interface access: the fetch contract, its HTTP
//! implementation and the response types of the built-in resources.

pub mod api_types;
mod client;
mod fetch;

pub use client::{EnvTokenSource, EsiClient, TokenSource};
pub use fetch::{FetchOptions, FetchResponse, RemoteFetch, RemoteFetchExt};
