//! phasing: redirect a Kubernetes Service to a local process
//!
//! Library side of the `phasing` binary: argument handling, the session
//! lifecycle and the pieces it is wired from.

pub mod cli;
pub mod commands;
pub mod coordinator;
pub mod output;
pub mod prompt;
pub mod tunnel;
