#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod router;
pub mod token;

pub use client::{Client, Event};
pub use config::{Config, GrantType};
pub use connection::ConnectionState;
pub use token::Credential;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;
