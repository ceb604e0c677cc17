//! Kubernetes client for ktail
//!
//! This crate provides kubeconfig handling and the pod [`WatchSource`]
//! backed by the Kubernetes list and watch APIs.
//!
//! [`WatchSource`]: ktail_core::WatchSource

mod client;
mod convert;
mod watch;

pub use client::KubeClient;
pub use convert::pod_snapshot;
pub use watch::KubeWatchSource;
