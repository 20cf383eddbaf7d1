//! Identity provider core: per-client identity virtualization, grant bookkeeping, the
//! user-status machine and the change-notification pipeline.
//!
//! # Layout
//! - `model` and `store` hold the records and their persistence contract.
//! - `virtualizer`, `resolver`, `status` and `notifier` implement the pipeline stages.
//! - `entities`, `authorizer` and `reader` are the entry points, bundled by `provider`.
//! - `config`, `observability`, `app` and `api` make up the service shell.
pub mod api;
pub mod app;
pub mod authorizer;
pub mod config;
pub mod delivery;
pub mod entities;
pub mod error;
pub mod model;
pub mod notifier;
pub mod observability;
pub mod phone;
pub mod provider;
pub mod reader;
pub mod resolver;
pub mod status;
pub mod store;
pub mod virtualizer;
