//! searchstack - provision and launch multi-node OpenSearch clusters
//!
//! The bring-up run lives in [`cluster::orchestrator`]; the cloud side and the
//! node transport are injected through the traits in [`cloud`] and [`remote`].

pub mod cli;
pub mod cloud;
pub mod cluster;
pub mod config;
pub mod remote;
pub mod render;
