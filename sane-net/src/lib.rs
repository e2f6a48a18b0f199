#![forbid(unsafe_code)]

//! SANE network protocol: wire codec, backend contract, net client and
//! the daemon core.
//!
//! The [`proto`] and [`wire`] modules define the binary RPC surface;
//! [`backend`] is the uniform driver contract; [`client`] proxies remote
//! scanners as local devices over it, and [`server`] publishes local
//! devices to the network, guarded by [`access`] rules and [`auth`]
//! credentials.

pub mod access;
pub mod auth;
pub mod backend;
pub mod client;
pub mod config;
pub mod proto;
pub mod server;
pub mod wire;

pub use backend::{auth_channel, AuthRequest, AuthSender, Backend, Credentials, Device};
pub use client::{NetBackend, NetDevice, NetError};
pub use config::{NetConfig, SanedConfig};
pub use proto::{DeviceInfo, OptionDescriptor, OptionValue, Parameters, Status};
pub use server::{
    accept_any, bind_listeners, run, run_with_listeners, serve_connection, ServerConfig,
    ServerError,
};
pub use wire::{WireError, WireReader, WireWriter, MAX_MESSAGE_BYTES};
