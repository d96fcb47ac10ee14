//! Build-and-deploy orchestrator for Tekton task runs.
//!
//! A deploy request names a source (git, local storage or an archive), an
//! image and optionally an app. The runner renders the Kubernetes documents
//! for the build, submits them to the build cluster and, once the build task
//! succeeds, deploys the image into an ephemeral `kind` workspace cluster.
//!
//! # Architecture
//!
//! - [`request`] parses and validates deploy requests
//! - [`manifest`] renders the build documents from [`templates`]
//! - [`driver`] submits documents and [`waiter`] polls the build task
//! - [`workspace`] provisions workspace clusters and [`deployer`] deploys into them
//! - [`portmap`] persists external port mappings and [`forward`] keeps the
//!   matching forwarders alive
//! - [`orchestrator`] ties everything together and [`server`] exposes it over HTTP
//!
//! Every external tool call goes through [`command::CommandRunner`], so the
//! whole engine can be driven by a scripted runner in tests.

pub mod command;
pub mod config;
pub mod deployer;
pub mod driver;
pub mod endpoints;
pub mod error;
pub mod forward;
pub mod kind;
pub mod kubectl;
pub mod manifest;
pub mod names;
pub mod orchestrator;
pub mod portmap;
pub mod request;
pub mod server;
pub mod templates;
pub mod waiter;
pub mod workspace;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use config::RunnerConfig;
pub use error::{Result, RunnerError};
pub use orchestrator::Orchestrator;
pub use request::{DeployRequest, RunRequest};
